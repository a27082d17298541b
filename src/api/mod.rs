//! Request and response payloads exchanged with the chat service.

use serde::{Deserialize, Serialize};

use crate::core::message::{Message, Preference};
use crate::core::session::{ChatMode, Session};

pub mod endpoints;

/// Body of `POST /messages/stream`: the new user message followed by one
/// assistant placeholder per participant.
#[derive(Serialize)]
pub struct StreamRequest<'a> {
    pub session_id: &'a str,
    pub messages: Vec<&'a Message>,
}

#[derive(Serialize)]
pub struct CreateSessionRequest<'a> {
    pub mode: ChatMode,
    pub model_a_id: Option<&'a str>,
    pub model_b_id: Option<&'a str>,
}

#[derive(Serialize)]
pub struct RenameSessionRequest<'a> {
    pub title: &'a str,
}

#[derive(Deserialize)]
pub struct TitleResponse {
    #[serde(default)]
    pub title: Option<String>,
}

/// `GET /sessions/{id}/`: session metadata plus its finalized messages.
#[derive(Deserialize)]
pub struct SessionDetail {
    #[serde(flatten)]
    pub session: Session,
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// The session list arrives either bare or wrapped in a paginated envelope.
#[derive(Deserialize)]
#[serde(untagged)]
pub enum SessionList {
    Plain(Vec<Session>),
    Paged { results: Vec<Session> },
}

impl SessionList {
    pub fn into_sessions(self) -> Vec<Session> {
        match self {
            SessionList::Plain(sessions) | SessionList::Paged { results: sessions } => sessions,
        }
    }
}

#[derive(Serialize)]
pub struct FeedbackRequest<'a> {
    pub session_id: &'a str,
    pub feedback_type: &'static str,
    pub message_id: &'a str,
    pub preference: Preference,
}

impl<'a> FeedbackRequest<'a> {
    pub fn preference(session_id: &'a str, message_id: &'a str, preference: Preference) -> Self {
        Self {
            session_id,
            feedback_type: "preference",
            message_id,
            preference,
        }
    }
}
