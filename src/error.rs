use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use zbus::DBusError;

pub const ERROR_FAILED: &str = "org.freedesktop.DBus.Error.Failed";
pub const ERROR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
pub const ERROR_UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
pub const ERROR_INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
pub const ERROR_NOT_SUPPORTED: &str = "org.freedesktop.DBus.Error.NotSupported";

/// Library error type for query and miner operations.
///
/// Cloneable so that cached initialization failures and sticky proxy errors
/// can be handed to every caller as an independent copy.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The operation was cancelled through its cancellation token.
    #[error("operation was cancelled")]
    Cancelled,

    /// The shared SPARQL connection could not be opened.
    #[error("unable to connect to the tracker database: {0}")]
    TrackerInit(String),

    /// The SPARQL store rejected or failed a query.
    #[error("sparql error: {0}")]
    Sparql(String),

    /// A queued statement was dropped without ever being answered.
    #[error("tracker queue dropped the statement")]
    Abandoned,

    /// An online miner helper could not be started.
    #[error("unable to spawn {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },

    /// The helper exited before it connected back.
    #[error("Online miner for {0} terminated unexpectedly before connecting")]
    MinerTerminated(String),

    /// No online miner is registered for the provider type.
    #[error("no online miner for provider {0}")]
    UnknownProvider(String),

    /// A bus address could not be parsed or used.
    #[error("invalid bus address: {0}")]
    Address(String),

    /// The peer sent data that does not follow the wire format.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The connection to the helper went away.
    #[error("connection closed")]
    ConnectionClosed,

    /// The peer answered a method call with a named D-Bus error.
    #[error("{name}: {message}")]
    Remote { name: String, message: String },

    /// Transport or marshalling failure on a D-Bus connection.
    #[error("d-bus error: {0}")]
    Bus(String),

    /// Underlying IO error.
    #[error(transparent)]
    Io(Arc<std::io::Error>),
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    pub fn remote(name: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Remote {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<zbus::Error> for Error {
    fn from(err: zbus::Error) -> Self {
        match err {
            zbus::Error::MethodError(name, message, _) => Error::Remote {
                name: name.to_string(),
                message: message.unwrap_or_default(),
            },
            zbus::Error::FDO(err) => {
                Error::remote(err.name().to_string(), err.description().unwrap_or_default())
            }
            other => Error::Bus(other.to_string()),
        }
    }
}

/// Reply sent back to a D-Bus caller.
impl From<Error> for zbus::fdo::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Remote { name, message } => match name.as_str() {
                ERROR_NOT_SUPPORTED => Self::NotSupported(message),
                ERROR_INVALID_ARGS => Self::InvalidArgs(message),
                ERROR_UNKNOWN_METHOD => Self::UnknownMethod(message),
                ERROR_UNKNOWN_OBJECT => Self::UnknownObject(message),
                _ => Self::Failed(format!("{name}: {message}")),
            },
            other => Self::Failed(other.to_string()),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
