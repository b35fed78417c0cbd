use crate::Token;
use cancel_this::Cancelled;
use thiserror::Error;

/// A fault raised by the code of an async iterator method (or by an operation it awaited).
///
/// Faults are ordinary values of the protocol: they are caught once at the driver boundary,
/// end the sequence, and are delivered to the consumer exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Fault {
    /// A fault thrown by user code, carrying its message.
    #[error("{message}")]
    Thrown { message: String },
    /// The awaited operation (or the outstanding wait) was canceled.
    #[error("{0}")]
    #[cfg_attr(feature = "serde", serde(skip))]
    Cancelled(Cancelled),
}

impl Fault {
    /// Create a [`Fault::Thrown`] with the given message.
    pub fn thrown<S: Into<String>>(message: S) -> Fault {
        Fault::Thrown {
            message: message.into(),
        }
    }

    /// The text bound by a `catch` clause which handles this fault.
    pub fn message(&self) -> String {
        match self {
            Fault::Thrown { message } => message.clone(),
            Fault::Cancelled(_) => "cancelled".to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Fault::Cancelled(_))
    }
}

impl From<Cancelled> for Fault {
    fn from(value: Cancelled) -> Self {
        Fault::Cancelled(value)
    }
}

/// Violations of the single-outstanding-wait protocol.
///
/// These are programming errors of the producer or the consumer and are never returned:
/// they abort the offending call with a panic carrying this message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsageError {
    #[error("stale token {found:?} used with completion source at version {expected:?}")]
    StaleToken { expected: Token, found: Token },
    #[error("completion source was already completed and not reset")]
    AlreadyCompleted,
    #[error("result requested from a completion source which is still pending")]
    NotCompleted,
    #[error("a continuation is already registered for this completion")]
    ContinuationAlreadyRegistered,
}

impl UsageError {
    #[track_caller]
    pub(crate) fn fail(self) -> ! {
        tracing::error!(error = %self, "protocol usage error");
        panic!("{}", self)
    }
}
