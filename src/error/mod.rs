use std::{error::Error, fmt};
use thiserror::Error;

const ERR_MSG_QUEUE_FULL: &str = "queue is full";
const ERR_MSG_TRANSPORT_CLOSED: &str = "transport is closed";
const ERR_MSG_TIMEOUT: &str = "operation timed out";
const ERR_MSG_DISCONNECTED: &str = "connection disconnected";
const ERR_MSG_CANCELLED: &str = "operation cancelled";

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendFailReason {
    Timeout,
    Cancelled,
    Full,
    Closed,
}

impl fmt::Display for SendFailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendFailReason::Timeout => write!(f, "{ERR_MSG_TIMEOUT}"),
            SendFailReason::Cancelled => write!(f, "{ERR_MSG_CANCELLED}"),
            SendFailReason::Full => write!(f, "{ERR_MSG_QUEUE_FULL}"),
            SendFailReason::Closed => write!(f, "{ERR_MSG_TRANSPORT_CLOSED}"),
        }
    }
}

/// Failed send; hands the value back when the transport still owns it.
#[derive(Debug)]
pub struct SendError<T> {
    pub value: Option<T>,
    pub reason: SendFailReason,
}

impl<T> SendError<T> {
    pub fn full(value: Option<T>) -> Self {
        Self {
            value,
            reason: SendFailReason::Full,
        }
    }

    pub fn closed(value: Option<T>) -> Self {
        Self {
            value,
            reason: SendFailReason::Closed,
        }
    }

    pub fn cancelled(value: Option<T>) -> Self {
        Self {
            value,
            reason: SendFailReason::Cancelled,
        }
    }

    pub fn timeout(value: Option<T>) -> Self {
        Self {
            value,
            reason: SendFailReason::Timeout,
        }
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)
    }
}

impl<T: fmt::Debug> Error for SendError<T> {}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TryRecvError {
    Empty,
    Disconnected,
}

#[derive(Debug)]
pub enum RecvError {
    Timeout,
    Disconnected,
    Cancelled,
}

impl Error for RecvError {}

impl fmt::Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecvError::Timeout => write!(f, "{ERR_MSG_TIMEOUT}"),
            RecvError::Disconnected => write!(f, "{ERR_MSG_DISCONNECTED}"),
            RecvError::Cancelled => write!(f, "{ERR_MSG_CANCELLED}"),
        }
    }
}

/// Malformed or unresolved configuration. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("exactly one controller is required, found {0}")]
    ControllerCount(usize),
    #[error("component `{component}`: missing option `{option}`")]
    MissingOption { component: String, option: String },
    #[error("component `{component}`: option `{option}` is invalid: {reason}")]
    InvalidOption {
        component: String,
        option: String,
        reason: String,
    },
    #[error("component `{component}` references unknown {kind} `{name}`")]
    UnknownReference {
        component: String,
        kind: &'static str,
        name: String,
    },
    #[error("duplicate component name `{0}`")]
    DuplicateName(String),
    #[error("invalid step definition: {0}")]
    InvalidStep(String),
    #[error(transparent)]
    InvalidClass(#[from] InvalidComponentClass),
}

/// A component could not reach a runnable state. Fatal at startup.
#[derive(Debug, Error)]
pub enum InitializationError {
    #[error("station `{0}` has no data channels")]
    NoChannels(String),
    #[error("station `{0}` has no workflow")]
    NoWorkflow(String),
    #[error("channel `{channel}` requires `{required}` which is not linked")]
    UnlinkedChannel { channel: String, required: String },
    #[error("component `{component}`: {reason}")]
    Component { component: String, reason: String },
    #[error("component `{0}` was not configured")]
    NotConfigured(String),
}

/// Why a factory lookup did not produce a component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentClassErrorKind {
    UnknownClass,
    WrongCapability(&'static str),
    ConstructorFailed(String),
}

impl fmt::Display for ComponentClassErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownClass => write!(f, "class is not registered"),
            Self::WrongCapability(cap) => write!(f, "class is not a {cap}"),
            Self::ConstructorFailed(reason) => write!(f, "constructor failed: {reason}"),
        }
    }
}

#[derive(Debug, Error)]
#[error("cannot instantiate component class `{class}`: {kind}")]
pub struct InvalidComponentClass {
    pub class: String,
    pub kind: ComponentClassErrorKind,
}

impl InvalidComponentClass {
    pub fn new(class: impl Into<String>, kind: ComponentClassErrorKind) -> Self {
        Self {
            class: class.into(),
            kind,
        }
    }
}

/// Rejected router registration. The router state is left untouched.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouterRegistrationError {
    #[error("node `{name}` is already registered as {bucket}")]
    Duplicate { name: String, bucket: &'static str },
    #[error("node name is empty")]
    Unnamed,
    #[error("node `{0}` is not registered")]
    UnknownNode(String),
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("index {index} is outside frame [{frame_start}, {frame_end}]")]
pub struct DataOutOfFrame {
    pub index: i64,
    pub frame_start: i64,
    pub frame_end: i64,
}

/// Failure of a pooled task.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("task panicked: {0}")]
    Panicked(String),
    #[error("task result was dropped")]
    Dropped,
    #[error("task join cancelled")]
    Cancelled,
    #[error("task join timed out")]
    Timeout,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Initialization(#[from] InitializationError),
    #[error(transparent)]
    InvalidClass(#[from] InvalidComponentClass),
    #[error("engine is not initialized")]
    NotInitialized,
    #[error("{phase} phase did not settle within {timeout_ms} ms")]
    BarrierTimeout { phase: &'static str, timeout_ms: u64 },
    #[error("worker pool is closed")]
    PoolClosed,
    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),
}
