mod agent;
mod timer;

use std::env;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use agent::api_client::ApiClient;
use agent::config::DeviceConfig;
use agent::errors::{Error, Result};
use agent::io_hub::IoHub;
use agent::module_manager::ModuleManager;
use agent::mqtt_router::MqttRouter;
use agent::store::ReadingStore;

#[cfg(feature = "station-rf")]
use agent::rf_link::{GpioFrameTransport, RfLink};

const TICK_INTERVAL: Duration = Duration::from_millis(500);
const PING_INTERVAL: Duration = Duration::from_secs(60);
const MODULE_INIT_REBOOT_DELAY: Duration = Duration::from_secs(5 * 60);
const DEFAULT_STORE_PATH: &str = "data/readings.db";

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Increase log verbosity; also implied by DEVELOPMENT_ENV=1.
    #[clap(short = 'v', long = "verbose", parse(from_occurrences))]
    verbose: u8,

    /// Overrides READING_STORE_PATH for local/dev testing.
    #[clap(long = "store", parse(from_os_str))]
    store: Option<std::path::PathBuf>,
}

fn required_env(name: &str) -> Result<String> {
    env::var(name).map_err(|_| Error::config_invalid(format!("env:{name}")))
}

fn setup_tracing(verbose: u8) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let _ = tracing_log::LogTracer::init();

    let development = env::var("DEVELOPMENT_ENV").map(|v| v == "1").unwrap_or(false);
    let default_level = if verbose > 0 || development { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if development {
        let subscriber = tracing_subscriber::FmtSubscriber::builder().with_env_filter(filter).finish();
        tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
        None
    } else {
        let appender = tracing_appender::rolling::daily("logs", "agent.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        let subscriber = tracing_subscriber::FmtSubscriber::builder().with_env_filter(filter).with_writer(non_blocking).with_ansi(false).finish();
        tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
        Some(guard)
    }
}

/// Shells out to the host's privileged reboot program. Logs and returns
/// either way — the caller decides whether a failure here should also be
/// treated as fatal.
fn invoke_reboot() {
    match Command::new("sudo").arg("reboot").status() {
        Ok(status) if status.success() => tracing::info!("reboot command issued"),
        Ok(status) => tracing::error!(code = ?status.code(), "reboot command exited non-zero"),
        Err(err) => tracing::error!(%err, "failed to invoke reboot command"),
    }
}

fn main() {
    let args = Args::parse();
    let _tracing_guard = setup_tracing(args.verbose);

    if let Err(err) = run(args) {
        tracing::error!(%err, "process exiting due to fatal error");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || running.store(false, Ordering::SeqCst)).expect("Error setting Ctrl-C handler");
    }

    let api_link = required_env("API_LINK")?;
    let device_uid = required_env("DEVICE_UID")?;
    let mqtt_host = required_env("MQTT_HOST")?;
    let mqtt_port = required_env("MQTT_PORT")?;

    let io_hub = Arc::new(IoHub::new());

    tracing::info!(%api_link, %device_uid, "authenticating with control plane");
    let api_client = ApiClient::new(&api_link, &device_uid)?;

    let credentials = api_client.get_mqtt_credentials()?;
    let mqtt_uri = format!("tcp://{mqtt_host}:{mqtt_port}");
    let mqtt_client_id = format!("home-node-agent-{device_uid}");
    let mqtt = MqttRouter::connect(&mqtt_uri, &mqtt_client_id, &credentials.username, &credentials.password, &credentials.topic)?;
    let mqtt_receiver = mqtt.make_receiver();

    let store_path = args
        .store
        .or_else(|| env::var("READING_STORE_PATH").ok().map(std::path::PathBuf::from))
        .unwrap_or_else(|| std::path::PathBuf::from(DEFAULT_STORE_PATH));
    let store = ReadingStore::open(&store_path)?;

    let module_manager = Arc::new(Mutex::new(ModuleManager::new()));

    #[cfg(feature = "station-rf")]
    let _rf_link = build_rf_link(&io_hub);

    let fatal: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));

    mqtt.subscribe(
        "restart",
        Box::new(|_payload| {
            tracing::warn!("restart requested over MQTT");
            invoke_reboot();
        }),
    );

    {
        let manager = Arc::clone(&module_manager);
        let io_hub = Arc::clone(&io_hub);
        let mqtt_for_reconcile = mqtt.clone();
        let fatal = Arc::clone(&fatal);
        let running = Arc::clone(&running);
        mqtt.subscribe(
            "config",
            Box::new(move |payload| match DeviceConfig::from_json(&payload) {
                Ok(config) => {
                    let mut manager = manager.lock().unwrap();
                    if let Err(err) = manager.reconcile(&config, &io_hub, &mqtt_for_reconcile) {
                        tracing::error!(%err, "config reconciliation failed");
                        *fatal.lock().unwrap() = Some(err);
                        running.store(false, Ordering::SeqCst);
                    }
                }
                Err(err) => tracing::error!(%err, "received malformed device config over MQTT"),
            }),
        );
    }

    match api_client.get_device_config() {
        Ok(config) => {
            let mut manager = module_manager.lock().unwrap();
            if let Err(err) = manager.reconcile(&config, &io_hub, &mqtt) {
                tracing::error!(%err, "initial reconciliation failed");
                *fatal.lock().unwrap() = Some(err);
                running.store(false, Ordering::SeqCst);
            }
        }
        Err(err) => tracing::warn!(%err, "initial device-config fetch failed; starting with no modules"),
    }

    let mut last_ping = Instant::now() - PING_INTERVAL;

    while running.load(Ordering::SeqCst) {
        mqtt.poll(&mqtt_receiver);

        let now_ms = chrono::Utc::now().timestamp_millis() as u64;
        let tick_result = module_manager.lock().unwrap().tick(now_ms);

        match tick_result {
            Ok(readings) => {
                if let Err(err) = store.append(&readings) {
                    tracing::error!(%err, "failed to append readings to local store");
                }
            }
            Err(err) => {
                tracing::error!(%err, "module tick failed");
                *fatal.lock().unwrap() = Some(err);
                break;
            }
        }

        if last_ping.elapsed() >= PING_INTERVAL {
            last_ping = Instant::now();
            run_ping_and_upload(&api_client, &store);
        }

        thread::sleep(TICK_INTERVAL);
    }

    tracing::info!("shutting down");
    module_manager.lock().unwrap().shutdown();
    mqtt.disconnect();
    io_hub.shutdown();

    match fatal.lock().unwrap().take() {
        Some(err) => {
            if matches!(err, Error::ModuleInit { .. }) {
                tracing::warn!(delay_secs = MODULE_INIT_REBOOT_DELAY.as_secs(), "module init failed, delaying reboot");
                thread::sleep(MODULE_INIT_REBOOT_DELAY);
            }
            invoke_reboot();
            Err(err)
        }
        None => Ok(()),
    }
}

/// Pings the server (updating the clock offset) and, if that succeeds,
/// flushes whatever readings accumulated locally. Both steps log and
/// continue on failure — `ServerUnreachable` is never fatal, and whatever
/// remains queued is retried on the next 60 s cycle.
fn run_ping_and_upload(api_client: &ApiClient, store: &ReadingStore) {
    if let Err(err) = api_client.send_ping() {
        tracing::warn!(%err, "ping failed, will retry next cycle");
        return;
    }

    let pending = match store.snapshot() {
        Ok(rows) => rows,
        Err(err) => {
            tracing::error!(%err, "failed to snapshot local store");
            return;
        }
    };

    if pending.is_empty() {
        return;
    }

    match api_client.send_sensor_values(&pending) {
        Ok(()) => {
            if let Err(err) = store.purge_all() {
                tracing::error!(%err, "failed to purge uploaded readings");
            }
        }
        Err(err) => tracing::warn!(%err, reading_count = pending.len(), "upload failed, readings remain queued"),
    }
}

#[cfg(feature = "station-rf")]
fn build_rf_link(io_hub: &IoHub) -> Option<RfLink<GpioFrameTransport>> {
    let pin: u8 = env::var("RF_PIN").ok().and_then(|v| v.parse().ok()).unwrap_or(7);
    let address: u16 = env::var("RF_ADDRESS").ok().and_then(|v| v.parse().ok()).unwrap_or(1);

    match GpioFrameTransport::new(io_hub, pin) {
        Ok(transport) => {
            tracing::info!(pin, address, "RF link online");
            Some(RfLink::new(address, transport))
        }
        Err(err) => {
            tracing::warn!(%err, "RF link unavailable, continuing without it");
            None
        }
    }
}
