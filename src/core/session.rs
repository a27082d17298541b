use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::message::Participant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatMode {
    /// One model answers each turn.
    Direct,
    /// Two user-selected models answer side by side.
    Compare,
    /// Two server-selected models answer side by side.
    Random,
}

impl ChatMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatMode::Direct => "direct",
            ChatMode::Compare => "compare",
            ChatMode::Random => "random",
        }
    }

    /// Participants that stream a response for every turn in this mode.
    pub fn participants(self) -> &'static [Participant] {
        match self {
            ChatMode::Direct => &[Participant::A],
            ChatMode::Compare | ChatMode::Random => &[Participant::A, Participant::B],
        }
    }
}

impl FromStr for ChatMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(ChatMode::Direct),
            "compare" => Ok(ChatMode::Compare),
            "random" => Ok(ChatMode::Random),
            other => Err(format!(
                "invalid chat mode: {other} (expected direct, compare or random)"
            )),
        }
    }
}

impl fmt::Display for ChatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub mode: ChatMode,
    #[serde(default, alias = "model_a_id")]
    pub model_a: Option<String>,
    #[serde(default, alias = "model_b_id")]
    pub model_b: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

impl Session {
    pub fn model_for(&self, participant: Participant) -> Option<&str> {
        match participant {
            Participant::A => self.model_a.as_deref(),
            Participant::B => self.model_b.as_deref(),
        }
    }

    pub fn display_title(&self) -> &str {
        self.title
            .as_deref()
            .filter(|title| !title.trim().is_empty())
            .unwrap_or("Untitled chat")
    }
}
