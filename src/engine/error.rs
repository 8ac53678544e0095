//! Error types for the formlink engine
//!
//! Domain errors use thiserror. Every terminal error carries an
//! [`ErrorAddress`] naming the page context, form, control and field involved
//! so a failure can be diagnosed without replaying the session.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Identifying addresses attached to a terminal error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorAddress {
    /// Page context identifier, if the failure is tied to one
    pub page_context_id: Option<String>,
    /// Server form identifier
    pub form_id: Option<String>,
    /// Structural control path
    pub control_path: Option<String>,
    /// Caller-facing field name
    pub field_name: Option<String>,
}

impl ErrorAddress {
    /// Address naming only a page context
    pub fn page_context(id: impl Into<String>) -> Self {
        Self {
            page_context_id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Attach a form id
    pub fn with_form(mut self, form_id: impl Into<String>) -> Self {
        self.form_id = Some(form_id.into());
        self
    }

    /// Attach a control path
    pub fn with_control(mut self, control_path: impl Into<String>) -> Self {
        self.control_path = Some(control_path.into());
        self
    }

    /// Attach a field name
    pub fn with_field(mut self, field_name: impl Into<String>) -> Self {
        self.field_name = Some(field_name.into());
        self
    }

    /// True when no address component is known
    pub fn is_empty(&self) -> bool {
        self.page_context_id.is_none()
            && self.form_id.is_none()
            && self.control_path.is_none()
            && self.field_name.is_none()
    }
}

impl fmt::Display for ErrorAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "unaddressed");
        }

        let parts = [
            ("page_context", &self.page_context_id),
            ("form", &self.form_id),
            ("control", &self.control_path),
            ("field", &self.field_name),
        ];

        let mut first = true;
        for (label, value) in parts {
            if let Some(value) = value {
                if !first {
                    write!(f, ", ")?;
                }
                write!(f, "{label}={value}")?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Top-level engine error
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed caller input, rejected before any I/O
    #[error("Validation error: {message} ({address})")]
    Validation {
        /// What was wrong with the input
        message: String,
        /// Addresses involved
        address: ErrorAddress,
    },

    /// Remote-reported or unexpected protocol payloads, and essential-wait timeouts
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport or session unavailable
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Session, page or context missing
    #[error("Not found: {0}")]
    NotFound(#[from] NotFoundError),
}

impl EngineError {
    /// Build a validation error
    pub fn validation(message: impl Into<String>, address: ErrorAddress) -> Self {
        Self::Validation {
            message: message.into(),
            address,
        }
    }

    /// Whether retrying the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Protocol(ProtocolError::Timeout { .. })
                | EngineError::Protocol(ProtocolError::StaleFilter { .. })
        )
    }

    /// Addresses carried by this error
    pub fn address(&self) -> Option<&ErrorAddress> {
        match self {
            EngineError::Validation { address, .. } => Some(address),
            EngineError::Protocol(err) => Some(err.address()),
            EngineError::Connection(err) => err.address(),
            EngineError::NotFound(err) => err.address(),
        }
    }

    /// Remote message kind when the server itself reported the failure
    pub fn remote_kind(&self) -> Option<RemoteMessageKind> {
        match self {
            EngineError::Protocol(ProtocolError::Remote { kind, .. }) => Some(*kind),
            _ => None,
        }
    }
}

/// Kind of remote-reported message embedded in a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteMessageKind {
    /// Hard error dialog or message
    Error,
    /// Field validation failure
    Validation,
    /// Server asks for confirmation before proceeding
    Confirm,
}

impl RemoteMessageKind {
    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteMessageKind::Error => "error",
            RemoteMessageKind::Validation => "validation",
            RemoteMessageKind::Confirm => "confirm",
        }
    }
}

impl fmt::Display for RemoteMessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol-level errors
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    /// The server reported an error, validation or confirmation payload
    #[error("remote {kind}: {message} ({address})")]
    Remote {
        /// Handler kind that carried the message
        kind: RemoteMessageKind,
        /// Server-provided text
        message: String,
        /// Addresses involved
        address: ErrorAddress,
    },

    /// A required confirmation did not arrive in time
    #[error("timed out after {timeout_ms}ms waiting for {waiting_for} ({address})")]
    Timeout {
        /// What the wait expected to observe
        waiting_for: String,
        /// Configured timeout
        timeout_ms: u64,
        /// Addresses involved
        address: ErrorAddress,
    },

    /// The caller cancelled a required wait before it completed
    #[error("cancelled while waiting for {waiting_for} ({address})")]
    Cancelled {
        /// What the wait expected to observe
        waiting_for: String,
        /// Addresses involved
        address: ErrorAddress,
    },

    /// Filters are believed active on the server but the read asked for none
    #[error("stale filters {fields:?} were active on page {page_id}; filter state cleared ({address})")]
    StaleFilter {
        /// Page whose filter state was cleared
        page_id: String,
        /// Fields that were filtered
        fields: Vec<String>,
        /// Addresses involved
        address: ErrorAddress,
    },

    /// Payload could not be decoded
    #[error("failed to decode payload: {detail} ({address})")]
    Decode {
        /// Decoder message
        detail: String,
        /// Addresses involved
        address: ErrorAddress,
    },

    /// Response shape the engine cannot work with
    #[error("unexpected response: {detail} ({address})")]
    Unexpected {
        /// Description of the mismatch
        detail: String,
        /// Addresses involved
        address: ErrorAddress,
    },
}

impl ProtocolError {
    /// Addresses carried by this error
    pub fn address(&self) -> &ErrorAddress {
        match self {
            ProtocolError::Remote { address, .. }
            | ProtocolError::Timeout { address, .. }
            | ProtocolError::Cancelled { address, .. }
            | ProtocolError::StaleFilter { address, .. }
            | ProtocolError::Decode { address, .. }
            | ProtocolError::Unexpected { address, .. } => address,
        }
    }

    /// Replace the address, keeping the rest of the error
    pub fn with_address(mut self, new_address: ErrorAddress) -> Self {
        match &mut self {
            ProtocolError::Remote { address, .. }
            | ProtocolError::Timeout { address, .. }
            | ProtocolError::Cancelled { address, .. }
            | ProtocolError::StaleFilter { address, .. }
            | ProtocolError::Decode { address, .. }
            | ProtocolError::Unexpected { address, .. } => *address = new_address,
        }
        self
    }

    /// Build an unexpected-response error
    pub fn unexpected(detail: impl Into<String>, address: ErrorAddress) -> Self {
        ProtocolError::Unexpected {
            detail: detail.into(),
            address,
        }
    }
}

/// Errors reported by a [`Session`](super::correlator::Session) implementation
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The connection dropped
    #[error("connection lost: {0}")]
    Disconnected(String),

    /// The interaction could not be written
    #[error("send failed: {0}")]
    Send(String),

    /// The transport received bytes it could not frame
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Connection-level errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The transport failed while sending an interaction
    #[error("transport failure in session {session_id} during {interaction}: {source}")]
    Transport {
        /// Session the interaction was sent on
        session_id: String,
        /// Interaction name
        interaction: String,
        /// Underlying transport error
        #[source]
        source: TransportError,
        /// Addresses involved
        address: ErrorAddress,
    },

    /// The asynchronous event stream closed during a required wait
    #[error("event stream for session {session_id} closed ({address})")]
    EventStreamClosed {
        /// Session whose stream closed
        session_id: String,
        /// Addresses involved
        address: ErrorAddress,
    },
}

impl ConnectionError {
    /// Addresses carried by this error
    pub fn address(&self) -> Option<&ErrorAddress> {
        match self {
            ConnectionError::Transport { address, .. }
            | ConnectionError::EventStreamClosed { address, .. } => Some(address),
        }
    }
}

/// Missing sessions, contexts and page elements
#[derive(Debug, Error)]
pub enum NotFoundError {
    /// The session behind a page context no longer exists; reopen the session
    #[error("session '{session_id}' is gone ({address})")]
    SessionGone {
        /// Missing session
        session_id: String,
        /// Addresses involved
        address: ErrorAddress,
    },

    /// The page context was invalidated or never existed; reopen the page
    #[error("page context '{page_context_id}' not found")]
    ContextGone {
        /// Missing context id
        page_context_id: String,
        /// Addresses involved
        address: ErrorAddress,
    },

    /// The page is not open on the session and could not be opened
    #[error("page '{page_id}' not available ({address})")]
    Page {
        /// Requested page
        page_id: String,
        /// Addresses involved
        address: ErrorAddress,
    },

    /// No field with the requested name or path exists on the page
    #[error("field '{field}' not found ({address})")]
    Field {
        /// Requested field
        field: String,
        /// Addresses involved
        address: ErrorAddress,
    },

    /// No action with the requested identifier exists on the page
    #[error("action '{action}' not found ({address})")]
    Action {
        /// Requested action
        action: String,
        /// Addresses involved
        address: ErrorAddress,
    },
}

impl NotFoundError {
    /// Addresses carried by this error
    pub fn address(&self) -> Option<&ErrorAddress> {
        match self {
            NotFoundError::SessionGone { address, .. }
            | NotFoundError::ContextGone { address, .. }
            | NotFoundError::Page { address, .. }
            | NotFoundError::Field { address, .. }
            | NotFoundError::Action { address, .. } => Some(address),
        }
    }
}

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;
