//! HTTP session with the control plane: auth, config fetch, ping/clock-sync,
//! and reading upload.

use std::net::UdpSocket;
use std::sync::Mutex;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;

use super::config::DeviceConfig;
use super::errors::{Error, Result};
use super::store::SensorReading;

include!(concat!(env!("OUT_DIR"), "/build_constants.rs"));

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct UploadReading {
    #[serde(rename = "sensorId")]
    sensor_id: u32,
    value: f64,
    #[serde(rename = "createdAt")]
    created_at: i64,
}

pub struct MqttCredentials {
    pub username: String,
    pub password: String,
    pub topic: String,
}

struct AuthState {
    bearer: String,
}

pub struct ApiClient {
    client: Client,
    base_url: String,
    device_uid: String,
    local_ip: String,
    auth: Mutex<Option<AuthState>>,
    /// `local_ms - server_ms`, recomputed on every successful ping.
    offset_ms: Mutex<i64>,
}

fn build_client() -> reqwest::Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(header::USER_AGENT, HeaderValue::from_static(constants::USER_AGENT_STRING));
    Client::builder().default_headers(headers).timeout(REQUEST_TIMEOUT).build()
}

/// Determines this host's outbound local IP by opening a throwaway UDP
/// "connection" to a well-known public address and reading back the local
/// endpoint — no packets are actually sent for a UDP connect.
fn local_ip() -> String {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("1.1.1.1:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "0.0.0.0".to_string())
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, device_uid: impl Into<String>) -> Result<ApiClient> {
        let client = build_client().map_err(|_| Error::io_init("http-client"))?;
        let api = ApiClient {
            client,
            base_url: base_url.into(),
            device_uid: device_uid.into(),
            local_ip: local_ip(),
            auth: Mutex::new(None),
            offset_ms: Mutex::new(0),
        };
        api.authenticate()?;
        Ok(api)
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("Origin", HeaderValue::from_str(&self.local_ip).unwrap_or(HeaderValue::from_static("0.0.0.0")));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json; charset=utf-8"));
        if let Some(state) = self.auth.lock().unwrap().as_ref() {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", state.bearer)) {
                headers.insert(header::AUTHORIZATION, value);
            }
        }
        headers
    }

    fn authenticate(&self) -> Result<()> {
        let url = format!("{}/device-auth", self.base_url);
        let response = self
            .client
            .post(&url)
            .headers(self.headers())
            .json(&serde_json::json!({ "uid": self.device_uid }))
            .send()
            .map_err(|_| Error::server_unreachable(&url))?;

        if response.status() != StatusCode::OK {
            return Err(Error::server_unreachable(&url));
        }

        let bearer = response.text().map_err(|_| Error::server_unreachable(&url))?;
        *self.auth.lock().unwrap() = Some(AuthState { bearer });
        tracing::debug!(%url, "authenticated");
        Ok(())
    }

    /// Retries a request body exactly once after a fresh auth if the first
    /// attempt came back 401. A second 401 propagates as
    /// `ServerUnreachable` — this bounds the retry, unlike a literal
    /// re-auth-and-recurse loop.
    fn with_retry<T>(&self, endpoint: &str, mut attempt: impl FnMut() -> Result<reqwest::blocking::Response>) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let mut response = attempt()?;
        if response.status() == StatusCode::UNAUTHORIZED {
            self.authenticate()?;
            response = attempt()?;
            if response.status() == StatusCode::UNAUTHORIZED {
                return Err(Error::server_unreachable(endpoint));
            }
        }
        if !response.status().is_success() {
            return Err(Error::server_unreachable(endpoint));
        }
        response.json::<T>().map_err(|_| Error::server_unreachable(endpoint))
    }

    pub fn get_device_config(&self) -> Result<DeviceConfig> {
        let url = format!("{}/device-config", self.base_url);
        let value: Value = self.with_retry(&url, || self.client.get(&url).headers(self.headers()).send().map_err(|_| Error::server_unreachable(&url)))?;
        DeviceConfig::from_json(&value).map_err(Error::from)
    }

    pub fn get_mqtt_credentials(&self) -> Result<MqttCredentials> {
        let url = format!("{}/mqtt-credentials", self.base_url);
        let value: Value = self.with_retry(&url, || self.client.get(&url).headers(self.headers()).send().map_err(|_| Error::server_unreachable(&url)))?;

        let field = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_string).ok_or_else(|| Error::server_unreachable(&url));

        Ok(MqttCredentials { username: field("MQTT_USER")?, password: field("MQTT_PASSWORD")?, topic: field("MQTT_TOPIC")? })
    }

    /// Sends a ping and records the updated clock offset. Never fatal to
    /// the caller beyond `ServerUnreachable` — optional-subsystem callers
    /// (the main loop's 60 s tick) log and continue.
    pub fn send_ping(&self) -> Result<()> {
        let url = format!("{}/device-ping", self.base_url);
        let mut response = self.client.post(&url).headers(self.headers()).send().map_err(|_| Error::server_unreachable(&url))?;

        if response.status() == StatusCode::UNAUTHORIZED {
            self.authenticate()?;
            response = self.client.post(&url).headers(self.headers()).send().map_err(|_| Error::server_unreachable(&url))?;
            if response.status() == StatusCode::UNAUTHORIZED {
                return Err(Error::server_unreachable(&url));
            }
        }
        if !response.status().is_success() {
            return Err(Error::server_unreachable(&url));
        }

        let local_ms = chrono::Utc::now().timestamp_millis();
        if let Ok(body) = response.json::<Value>() {
            if let Some(server_ms) = body.get("time").and_then(Value::as_i64) {
                *self.offset_ms.lock().unwrap() = local_ms - server_ms;
            }
        }
        Ok(())
    }

    pub fn clock_offset_ms(&self) -> i64 {
        *self.offset_ms.lock().unwrap()
    }

    /// Uploads every reading in `readings` with the current clock offset
    /// applied. Does not touch the store — callers purge on success.
    pub fn send_sensor_values(&self, readings: &[SensorReading]) -> Result<()> {
        let url = format!("{}/sensor-readings-save", self.base_url);
        let offset = self.clock_offset_ms();

        let body: Vec<UploadReading> = readings
            .iter()
            .map(|r| UploadReading { sensor_id: r.sensor_id, value: r.value, created_at: r.created_at_ms as i64 + offset })
            .collect();

        let response = self.client.post(&url).headers(self.headers()).json(&body).send().map_err(|_| Error::server_unreachable(&url))?;

        if response.status() == StatusCode::UNAUTHORIZED {
            self.authenticate()?;
            let retry = self.client.post(&url).headers(self.headers()).json(&body).send().map_err(|_| Error::server_unreachable(&url))?;
            if !retry.status().is_success() {
                return Err(Error::server_unreachable(&url));
            }
            return Ok(());
        }

        if !response.status().is_success() {
            return Err(Error::server_unreachable(&url));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    #[test]
    fn authenticates_on_construction_and_stores_bearer() {
        let mut server = Server::new();
        let _auth = server.mock("POST", "/device-auth").with_status(200).with_body("token-123").create();

        let client = ApiClient::new(server.url(), "device-1").unwrap();
        assert_eq!(client.auth.lock().unwrap().as_ref().unwrap().bearer, "token-123");
    }

    #[test]
    fn a_single_401_triggers_reauth_and_retry() {
        let mut server = Server::new();
        let _auth = server.mock("POST", "/device-auth").with_status(200).with_body("token-1").expect(1).create();

        let client = ApiClient::new(server.url(), "device-1").unwrap();

        let _reauth = server.mock("POST", "/device-auth").with_status(200).with_body("token-2").create();
        let _first = server.mock("GET", "/device-config").match_header("authorization", "Bearer token-1").with_status(401).create();
        let _second = server
            .mock("GET", "/device-config")
            .match_header("authorization", "Bearer token-2")
            .with_status(200)
            .with_body(r#"{"id":1,"name":"n","modules":[]}"#)
            .create();

        let config = client.get_device_config().unwrap();
        assert_eq!(config.id, 1);
    }

    #[test]
    fn ping_updates_clock_offset() {
        let mut server = Server::new();
        let _auth = server.mock("POST", "/device-auth").with_status(200).with_body("token").create();
        let client = ApiClient::new(server.url(), "device-1").unwrap();

        let server_ms = chrono::Utc::now().timestamp_millis() - 5000;
        let _ping = server.mock("POST", "/device-ping").with_status(200).with_body(format!(r#"{{"time":{}}}"#, server_ms)).create();

        client.send_ping().unwrap();
        assert!(client.clock_offset_ms() >= 4000);
    }

    #[test]
    fn upload_applies_offset_and_surfaces_non_2xx() {
        let mut server = Server::new();
        let _auth = server.mock("POST", "/device-auth").with_status(200).with_body("token").create();
        let client = ApiClient::new(server.url(), "device-1").unwrap();

        let _upload = server.mock("POST", "/sensor-readings-save").with_status(503).create();
        let readings = [SensorReading { sensor_id: 1, value: 1.0, created_at_ms: 100 }];
        assert!(client.send_sensor_values(&readings).is_err());
    }
}
