use thiserror::Error;

use crate::filter::FilterError;
use crate::registry::ServiceId;

/// Coarse classification of every [`Error`], stable across variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum ErrorKind {
    IllegalArgument,
    IllegalState,
    OutOfMemory,
    ServiceCallbackFailed,
    FrameworkShutdown,
    /// A synchronous wait gave up; the operation still completes later.
    Timeout,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Illegal argument: {message}")]
    IllegalArgument { message: String },

    #[error("Illegal state: {message}")]
    IllegalState { message: String },

    #[error("Service {service_id} is unregistering")]
    ServiceUnregistering { service_id: ServiceId },

    #[error("Out of memory while {context}")]
    OutOfMemory { context: String },

    // callbacks
    #[error("Callback `{callback}` of component {component} failed: {message}")]
    ServiceCallbackFailed {
        component: String,
        callback: String,
        message: String,
    },

    #[error("Framework is shut down")]
    FrameworkShutdown,

    #[error("Timed out waiting for `{operation}`")]
    Timeout { operation: String },

    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type MusubiResult<T> = Result<T, Error>;

impl Error {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Error::Internal(message.into())
    }

    pub fn illegal_argument<S: Into<String>>(message: S) -> Self {
        Error::IllegalArgument {
            message: message.into(),
        }
    }

    pub fn illegal_state<S: Into<String>>(message: S) -> Self {
        Error::IllegalState {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::IllegalArgument { .. } | Error::Filter(_) | Error::Config(_) => {
                ErrorKind::IllegalArgument
            }
            Error::IllegalState { .. } | Error::ServiceUnregistering { .. } => {
                ErrorKind::IllegalState
            }
            Error::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            Error::ServiceCallbackFailed { .. } => ErrorKind::ServiceCallbackFailed,
            Error::FrameworkShutdown => ErrorKind::FrameworkShutdown,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Internal(_) => ErrorKind::IllegalState,
        }
    }
}

/// Failure reported by a user callback (lifecycle, dependency or scheduled event).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct CallbackError {
    pub message: String,
}

impl CallbackError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<&str> for CallbackError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for CallbackError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<Error> for CallbackError {
    fn from(error: Error) -> Self {
        Self::new(error.to_string())
    }
}

pub type CallbackResult = Result<(), CallbackError>;
