use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn is_assistant(self) -> bool {
        self == Role::Assistant
    }
}

impl TryFrom<&str> for Role {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            _ => Err(format!("invalid message role: {value}")),
        }
    }
}

impl TryFrom<String> for Role {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

impl From<Role> for String {
    fn from(value: Role) -> Self {
        value.as_str().to_string()
    }
}

/// One of the two generation slots inside a turn.
///
/// Direct-mode sessions only ever use [`Participant::A`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Participant {
    A,
    B,
}

impl Participant {
    pub fn as_str(self) -> &'static str {
        match self {
            Participant::A => "a",
            Participant::B => "b",
        }
    }
}

impl fmt::Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Pending,
    Complete,
    Error,
}

/// Preference tag attached to a finalized message after a comparison vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preference {
    ModelA,
    ModelB,
    Tie,
    BothBad,
}

impl Preference {
    pub fn as_str(self) -> &'static str {
        match self {
            Preference::ModelA => "model_a",
            Preference::ModelB => "model_b",
            Preference::Tie => "tie",
            Preference::BothBad => "both_bad",
        }
    }
}

impl std::str::FromStr for Preference {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "model_a" => Ok(Preference::ModelA),
            "model_b" => Ok(Preference::ModelB),
            "tie" => Ok(Preference::Tie),
            "both_bad" => Ok(Preference::BothBad),
            _ => Err(format!(
                "invalid preference: {value} (expected model_a, model_b, tie or both_bad)"
            )),
        }
    }
}

impl fmt::Display for Preference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message in a session's finalized list.
///
/// Assistant messages only reach this shape through
/// [`SessionStore::finalize`](crate::core::store::SessionStore::finalize);
/// afterwards only `feedback` changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<Participant>,
    #[serde(default)]
    pub parent_message_ids: Vec<String>,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<Preference>,
    #[serde(
        default,
        rename = "modelId",
        alias = "model_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn user(
        id: impl Into<String>,
        content: impl Into<String>,
        parent_message_ids: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            role: Role::User,
            content: content.into(),
            participant: None,
            parent_message_ids,
            status: MessageStatus::Pending,
            feedback: None,
            model_id: None,
            created_at: Some(Utc::now()),
        }
    }

    /// Empty assistant message sent to the server to reserve an id for one
    /// participant's response.
    pub fn placeholder(
        id: impl Into<String>,
        participant: Participant,
        parent_message_ids: Vec<String>,
        model_id: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            role: Role::Assistant,
            content: String::new(),
            participant: Some(participant),
            parent_message_ids,
            status: MessageStatus::Pending,
            feedback: None,
            model_id,
            created_at: None,
        }
    }

    pub fn is_assistant(&self) -> bool {
        self.role.is_assistant()
    }
}
