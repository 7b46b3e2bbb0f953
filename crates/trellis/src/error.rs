use std::fmt;

use trellis_core::CredentialsError;

/// Errors from server registration and lifecycle operations.
#[derive(Debug)]
pub enum ServerError {
    /// The listening socket could not be opened.
    Bind {
        address: String,
        source: std::io::Error,
    },
    /// The credentials could not be turned into a TLS configuration.
    Credentials(CredentialsError),
    /// `start` was called before any endpoint was bound.
    NotBound,
    /// `start` was called twice.
    AlreadyStarted,
    /// The server has been shut down.
    ShutDown,
    /// Registration was attempted after the server started.
    AlreadyRunning,
    /// A service definition names a method the implementation lacks.
    MissingImplementation { method: String },
    /// The implementation of a method has the wrong request, response or
    /// cardinality type.
    HandlerTypeMismatch { method: String },
    /// A method path of the service is already registered.
    DuplicateMethod { path: String },
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Bind { address, source } => {
                write!(f, "failed to bind {}: {}", address, source)
            }
            ServerError::Credentials(e) => write!(f, "invalid credentials: {}", e),
            ServerError::NotBound => write!(f, "server must be bound in order to start"),
            ServerError::AlreadyStarted => write!(f, "server is already started"),
            ServerError::ShutDown => write!(f, "server is shut down"),
            ServerError::AlreadyRunning => {
                write!(f, "cannot register methods after the server started")
            }
            ServerError::MissingImplementation { method } => {
                write!(f, "no implementation provided for method {}", method)
            }
            ServerError::HandlerTypeMismatch { method } => {
                write!(f, "implementation of method {} has the wrong type", method)
            }
            ServerError::DuplicateMethod { path } => {
                write!(f, "method handler for {} already provided", path)
            }
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Bind { source, .. } => Some(source),
            ServerError::Credentials(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CredentialsError> for ServerError {
    fn from(err: CredentialsError) -> Self {
        ServerError::Credentials(err)
    }
}
