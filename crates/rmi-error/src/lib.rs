//! Unified error taxonomy with stable error codes for the RMI execution core.
//!
//! Every error raised by a core component carries an [`ErrorCode`] (a
//! machine-readable, stable string tag), a human-readable message, an
//! optional cause chain, and arbitrary key-value context. Use the builder
//! returned by [`RmiError::new`] to construct errors fluently.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Envelope decode / version / signature errors (C1, C2, C5).
    Document,
    /// Plugin resolution errors (C7, C11).
    Plugin,
    /// Method dispatch errors (C8).
    Dispatch,
    /// Request validity window errors (C8).
    Window,
    /// Broker connectivity and declare/send/ack errors (C3).
    Broker,
    /// Pending-store I/O errors (C4).
    Store,
    /// Configuration errors (C13).
    Config,
    /// Single-instance lock / process lifecycle errors (C12).
    Process,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Document => "document",
            Self::Plugin => "plugin",
            Self::Dispatch => "dispatch",
            Self::Window => "window",
            Self::Broker => "broker",
            Self::Store => "store",
            Self::Config => "config",
            Self::Process => "process",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serialises to a `SCREAMING_SNAKE_CASE` string that is
/// guaranteed not to change across patch releases. The `model.version` and
/// `auth.*` codes named in the wire contract map to
/// [`DocumentVersionMismatch`](Self::DocumentVersionMismatch) and
/// [`DocumentAuthRejected`](Self::DocumentAuthRejected) respectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- Document (C1/C2/C5) --
    /// Envelope body failed to parse as JSON, or a required field is missing.
    DocumentInvalid,
    /// `version` field does not match the agent's supported version.
    DocumentVersionMismatch,
    /// Signature verification failed.
    DocumentAuthRejected,

    // -- Plugin (C7/C11) --
    /// No plugin is registered for the inbound queue.
    PluginNotFound,

    // -- Dispatch (C8) --
    /// Requested `classname` is not in the plugin's catalog.
    ClassNotFound,
    /// Requested `method` is not defined on the resolved class.
    MethodNotFound,
    /// Requested `method` exists but is not marked remote-permitted.
    NotPermitted,

    // -- Window (C8) --
    /// The request's validity window has already closed.
    WindowMissed,
    /// The request's validity window has not opened yet.
    WindowPending,

    // -- Broker (C3) --
    /// The broker connection was lost; the reliability wrapper will retry.
    BrokerConnectionLost,
    /// A send to the broker failed for a reason other than connection loss.
    BrokerSendFailed,

    // -- Store (C4) --
    /// Reading or writing a pending-store entry failed.
    StoreIoFailed,

    // -- Config (C13) --
    /// Configuration file or value is invalid.
    ConfigInvalid,

    // -- Process (C12) --
    /// The single-instance lock is already held by another process.
    InstanceLockHeld,

    // -- Internal --
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::DocumentInvalid | Self::DocumentVersionMismatch | Self::DocumentAuthRejected => {
                ErrorCategory::Document
            }
            Self::PluginNotFound => ErrorCategory::Plugin,
            Self::ClassNotFound | Self::MethodNotFound | Self::NotPermitted => {
                ErrorCategory::Dispatch
            }
            Self::WindowMissed | Self::WindowPending => ErrorCategory::Window,
            Self::BrokerConnectionLost | Self::BrokerSendFailed => ErrorCategory::Broker,
            Self::StoreIoFailed => ErrorCategory::Store,
            Self::ConfigInvalid => ErrorCategory::Config,
            Self::InstanceLockHeld => ErrorCategory::Process,
            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Stable `&'static str` representation of the code (e.g.
    /// `"DOCUMENT_VERSION_MISMATCH"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DocumentInvalid => "DOCUMENT_INVALID",
            Self::DocumentVersionMismatch => "DOCUMENT_VERSION_MISMATCH",
            Self::DocumentAuthRejected => "DOCUMENT_AUTH_REJECTED",
            Self::PluginNotFound => "PLUGIN_NOT_FOUND",
            Self::ClassNotFound => "CLASS_NOT_FOUND",
            Self::MethodNotFound => "METHOD_NOT_FOUND",
            Self::NotPermitted => "NOT_PERMITTED",
            Self::WindowMissed => "WINDOW_MISSED",
            Self::WindowPending => "WINDOW_PENDING",
            Self::BrokerConnectionLost => "BROKER_CONNECTION_LOST",
            Self::BrokerSendFailed => "BROKER_SEND_FAILED",
            Self::StoreIoFailed => "STORE_IO_FAILED",
            Self::ConfigInvalid => "CONFIG_INVALID",
            Self::InstanceLockHeld => "INSTANCE_LOCK_HELD",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// RmiError
// ---------------------------------------------------------------------------

/// Unified core error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context.
///
/// # Builder usage
///
/// ```
/// use rmi_error::{RmiError, ErrorCode};
///
/// let err = RmiError::new(ErrorCode::BrokerConnectionLost, "connection reset")
///     .with_context("url", "local://agent")
///     .with_context("attempt", 3);
/// ```
pub struct RmiError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl RmiError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialisation
    /// fails, the entry is silently skipped.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }
}

impl fmt::Debug for RmiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("RmiError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for RmiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            // Deterministic output thanks to BTreeMap.
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for RmiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// Serialization support
// ---------------------------------------------------------------------------

/// Serialisable snapshot of an [`RmiError`] (without the opaque source).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RmiErrorDto {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    pub context: BTreeMap<String, serde_json::Value>,
    /// String representation of the source error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_message: Option<String>,
}

impl From<&RmiError> for RmiErrorDto {
    fn from(err: &RmiError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            context: err.context.clone(),
            source_message: err.source.as_ref().map(|s| s.to_string()),
        }
    }
}

impl From<RmiErrorDto> for RmiError {
    fn from(dto: RmiErrorDto) -> Self {
        Self {
            code: dto.code,
            message: dto.message,
            source: None,
            context: dto.context,
        }
    }
}
