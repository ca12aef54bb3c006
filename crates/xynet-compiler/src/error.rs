//! Error types for the netlist compiler

use thiserror::Error;

/// Result type for compiler operations
pub type Result<T> = std::result::Result<T, CompilerError>;

/// Errors that abort a compile. There is no partial-success mode: any of these
/// means nothing was written to the caller's sink.
#[derive(Error, Debug)]
pub enum CompilerError {
    /// Structural failure while expanding templates into instances
    #[error("Network generation failed in part '{part}': {reason}")]
    NetworkGeneration {
        /// Dotted path of the offending part
        part: String,
        /// Reason for failure
        reason: String,
    },

    /// Classification, device mapping or output resolution failure
    #[error("Translation failed for '{subject}': {reason}")]
    Translation {
        /// Part, variable or output expression that could not be translated
        subject: String,
        /// Reason for failure
        reason: String,
    },

    /// Writing the artifact failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CompilerError {
    /// Create a network generation error
    pub fn network_generation(part: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NetworkGeneration {
            part: part.into(),
            reason: reason.into(),
        }
    }

    /// Create a translation error
    pub fn translation(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Translation {
            subject: subject.into(),
            reason: reason.into(),
        }
    }

    /// Check if this is a network generation error
    pub fn is_network_generation(&self) -> bool {
        matches!(self, Self::NetworkGeneration { .. })
    }

    /// Check if this is a translation error
    pub fn is_translation(&self) -> bool {
        matches!(self, Self::Translation { .. })
    }
}
