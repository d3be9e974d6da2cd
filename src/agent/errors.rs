use core::fmt;
use std::error;

pub type Result<T> = core::result::Result<T, Error>;

/// Top-level error taxonomy for the agent. Optional subsystems (ping, upload,
/// display) catch and log their own errors rather than propagating here;
/// anything that reaches the main loop as one of these variants is either
/// retried next cycle (`ServerUnreachable`) or escalated to a reboot.
#[derive(Debug)]
pub enum Error {
    ConfigInvalid { path: String },
    IoInit { resource: String },
    ModuleInit { class: String, name: String },
    ServerUnreachable { endpoint: String },
    DisplayInit { cause: String },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ConfigInvalid { path } => write!(f, "invalid configuration at {path}"),
            Error::IoInit { resource } => write!(f, "failed to initialize {resource}"),
            Error::ModuleInit { class, name } => write!(f, "module {name} ({class}) failed to initialize"),
            Error::ServerUnreachable { endpoint } => write!(f, "server unreachable: {endpoint}"),
            Error::DisplayInit { cause } => write!(f, "display unavailable: {cause}"),
        }
    }
}

impl error::Error for Error {}

impl Error {
    pub fn config_invalid(path: impl Into<String>) -> Self {
        Error::ConfigInvalid { path: path.into() }
    }

    pub fn io_init(resource: impl Into<String>) -> Self {
        Error::IoInit { resource: resource.into() }
    }

    pub fn module_init(class: impl Into<String>, name: impl Into<String>) -> Self {
        Error::ModuleInit { class: class.into(), name: name.into() }
    }

    pub fn server_unreachable(endpoint: impl Into<String>) -> Self {
        Error::ServerUnreachable { endpoint: endpoint.into() }
    }

    /// True for errors the main loop treats as fatal (schedules a reboot),
    /// as opposed to `ServerUnreachable` which is retried next cycle.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::ServerUnreachable { .. } | Error::DisplayInit { .. })
    }
}
