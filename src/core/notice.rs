use std::fmt;

use crate::core::message::Participant;

/// One-shot, user-facing notifications emitted by the engine.
///
/// Decode problems never produce a notice; they are logged and dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// A participant's generation failed mid-stream. Its partial output was
    /// still finalized.
    ChannelError {
        session_id: String,
        participant: Participant,
        message_id: String,
        error: Option<String>,
    },
    /// The stream request itself failed or ended early.
    TransportError { session_id: String, message: String },
    /// Credentials were cleared and the user must sign in again.
    LoggedOut { reason: String },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::ChannelError {
                participant, error, ..
            } => {
                let label = participant.as_str().to_ascii_uppercase();
                match error {
                    Some(error) => write!(f, "Model {label} error: {error}"),
                    None => write!(f, "Model {label} error"),
                }
            }
            Notice::TransportError { message, .. } => {
                write!(f, "Failed to get a response: {message}")
            }
            Notice::LoggedOut { reason } => write!(f, "Signed out: {reason}"),
        }
    }
}
