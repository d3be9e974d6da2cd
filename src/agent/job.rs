//! Ordered task sequences delivered over MQTT for actuator modules.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

#[derive(Clone, Debug, Deserialize)]
pub struct Task {
    pub duration_ms: u32,
    pub value: HashMap<String, Value>,
    pub transition: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct Job {
    pub tasks: Vec<Task>,
    pub offset_ms: Option<u32>,
}

impl Job {
    pub fn from_json(payload: &[u8]) -> serde_json::Result<Job> {
        serde_json::from_slice(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_job_with_tasks_and_offset() {
        let payload = br#"{"tasks":[{"duration_ms":500,"value":{"pwm_frequency":1000,"value":75}}],"offset_ms":250}"#;
        let job = Job::from_json(payload).unwrap();
        assert_eq!(job.tasks.len(), 1);
        assert_eq!(job.tasks[0].duration_ms, 500);
        assert_eq!(job.offset_ms, Some(250));
    }

    #[test]
    fn offset_is_optional() {
        let payload = br#"{"tasks":[]}"#;
        let job = Job::from_json(payload).unwrap();
        assert!(job.tasks.is_empty());
        assert_eq!(job.offset_ms, None);
    }
}
