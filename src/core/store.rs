//! In-memory session state.
//!
//! The store is the only owner of sessions, finalized messages and transient
//! streaming buffers. Every mutation is a synchronous transition; callers
//! share it behind a lock and never hold the lock across a network await.

use std::collections::{HashMap, HashSet};
use std::error::Error as StdError;
use std::fmt;

use chrono::Utc;

use crate::core::message::{Message, MessageStatus, Participant, Preference, Role};
use crate::core::session::Session;

/// Partial assistant output for one message id, visible while it streams.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingBuffer {
    pub content: String,
    pub participant: Option<Participant>,
    pub parent_message_ids: Vec<String>,
    pub model_id: Option<String>,
}

/// Describes a buffer to open with [`SessionStore::begin_streaming`].
#[derive(Debug, Clone)]
pub struct BufferSpec {
    /// `None` for history whose messages were never attributed.
    pub participant: Option<Participant>,
    pub parent_message_ids: Vec<String>,
    pub model_id: Option<String>,
}

impl BufferSpec {
    pub fn new(participant: impl Into<Option<Participant>>) -> Self {
        Self {
            participant: participant.into(),
            parent_message_ids: Vec::new(),
            model_id: None,
        }
    }

    pub fn with_parents(mut self, parent_message_ids: Vec<String>) -> Self {
        self.parent_message_ids = parent_message_ids;
        self
    }

    pub fn with_model(mut self, model_id: Option<String>) -> Self {
        self.model_id = model_id;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    UnknownSession(String),
    DuplicateMessage {
        session_id: String,
        message_id: String,
    },
    UnknownMessage {
        session_id: String,
        message_id: String,
    },
    BufferExists {
        session_id: String,
        message_id: String,
    },
    NoBuffer {
        session_id: String,
        message_id: String,
    },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::UnknownSession(id) => write!(f, "Unknown session {id}"),
            StoreError::DuplicateMessage {
                session_id,
                message_id,
            } => write!(
                f,
                "Message {message_id} already exists in session {session_id}"
            ),
            StoreError::UnknownMessage {
                session_id,
                message_id,
            } => write!(f, "No message {message_id} in session {session_id}"),
            StoreError::BufferExists {
                session_id,
                message_id,
            } => write!(
                f,
                "Message {message_id} in session {session_id} is already streaming"
            ),
            StoreError::NoBuffer {
                session_id,
                message_id,
            } => write!(
                f,
                "Message {message_id} in session {session_id} is not streaming"
            ),
        }
    }
}

impl StdError for StoreError {}

#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: Vec<Session>,
    active_session: Option<String>,
    messages: HashMap<String, Vec<Message>>,
    streaming: HashMap<String, HashMap<String, StreamingBuffer>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn session(&self, session_id: &str) -> Option<&Session> {
        self.sessions.iter().find(|session| session.id == session_id)
    }

    pub fn active_session(&self) -> Option<&Session> {
        self.active_session
            .as_deref()
            .and_then(|id| self.session(id))
    }

    pub fn set_active_session(&mut self, session_id: Option<&str>) {
        self.active_session = session_id.map(str::to_string);
    }

    /// Replaces the session list, e.g. after listing sessions from the server.
    pub fn set_sessions(&mut self, sessions: Vec<Session>) {
        self.sessions = sessions;
    }

    /// Inserts a newly created session at the front and makes it active.
    pub fn insert_session(&mut self, session: Session) {
        self.sessions.retain(|existing| existing.id != session.id);
        self.active_session = Some(session.id.clone());
        self.sessions.insert(0, session);
    }

    /// Merges server-side session metadata and replaces the finalized list.
    ///
    /// Messages still streaming locally stay buffers, and a repeated id keeps
    /// its first occurrence.
    pub fn set_session_state(&mut self, session: Session, messages: Vec<Message>) {
        let session_id = session.id.clone();
        match self.sessions.iter_mut().find(|s| s.id == session_id) {
            Some(existing) => *existing = session,
            None => self.sessions.push(session),
        }
        let streaming = self.streaming.get(&session_id);
        let mut seen = HashSet::new();
        let messages = messages
            .into_iter()
            .filter(|message| {
                let buffered = streaming.is_some_and(|buffers| buffers.contains_key(&message.id));
                !buffered && seen.insert(message.id.clone())
            })
            .collect();
        self.messages.insert(session_id, messages);
    }

    pub fn set_title(&mut self, session_id: &str, title: &str) -> Result<(), StoreError> {
        let session = self
            .sessions
            .iter_mut()
            .find(|session| session.id == session_id)
            .ok_or_else(|| StoreError::UnknownSession(session_id.to_string()))?;
        session.title = Some(title.to_string());
        Ok(())
    }

    /// Drops a session and everything the client holds for it.
    pub fn remove_session(&mut self, session_id: &str) -> Option<Session> {
        let index = self.sessions.iter().position(|s| s.id == session_id)?;
        self.messages.remove(session_id);
        self.streaming.remove(session_id);
        if self.active_session.as_deref() == Some(session_id) {
            self.active_session = None;
        }
        Some(self.sessions.remove(index))
    }

    pub fn messages(&self, session_id: &str) -> &[Message] {
        self.messages
            .get(session_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn message(&self, session_id: &str, message_id: &str) -> Option<&Message> {
        self.messages(session_id)
            .iter()
            .find(|message| message.id == message_id)
    }

    pub fn streaming_buffer(&self, session_id: &str, message_id: &str) -> Option<&StreamingBuffer> {
        self.streaming
            .get(session_id)
            .and_then(|buffers| buffers.get(message_id))
    }

    pub fn streaming_buffers(&self, session_id: &str) -> impl Iterator<Item = (&str, &StreamingBuffer)> {
        self.streaming
            .get(session_id)
            .into_iter()
            .flat_map(|buffers| buffers.iter().map(|(id, buffer)| (id.as_str(), buffer)))
    }

    pub fn add_message(&mut self, session_id: &str, message: Message) -> Result<(), StoreError> {
        if self.streaming_buffer(session_id, &message.id).is_some() {
            return Err(StoreError::BufferExists {
                session_id: session_id.to_string(),
                message_id: message.id,
            });
        }
        if self.message(session_id, &message.id).is_some() {
            return Err(StoreError::DuplicateMessage {
                session_id: session_id.to_string(),
                message_id: message.id,
            });
        }
        self.messages
            .entry(session_id.to_string())
            .or_default()
            .push(message);
        Ok(())
    }

    pub fn begin_streaming(
        &mut self,
        session_id: &str,
        message_id: &str,
        spec: BufferSpec,
    ) -> Result<(), StoreError> {
        if self.message(session_id, message_id).is_some() {
            return Err(StoreError::DuplicateMessage {
                session_id: session_id.to_string(),
                message_id: message_id.to_string(),
            });
        }
        let buffers = self.streaming.entry(session_id.to_string()).or_default();
        if buffers.contains_key(message_id) {
            return Err(StoreError::BufferExists {
                session_id: session_id.to_string(),
                message_id: message_id.to_string(),
            });
        }
        buffers.insert(
            message_id.to_string(),
            StreamingBuffer {
                content: String::new(),
                participant: spec.participant,
                parent_message_ids: spec.parent_message_ids,
                model_id: spec.model_id,
            },
        );
        Ok(())
    }

    /// Appends already-unescaped text. Chunks are applied in call order.
    pub fn append_chunk(
        &mut self,
        session_id: &str,
        message_id: &str,
        text: &str,
    ) -> Result<(), StoreError> {
        let buffer = self.buffer_mut(session_id, message_id)?;
        buffer.content.push_str(text);
        Ok(())
    }

    /// Converts a finished buffer into a permanent assistant message. A
    /// finalized message with the same id is replaced in place.
    pub fn finalize(
        &mut self,
        session_id: &str,
        message_id: &str,
        status: MessageStatus,
    ) -> Result<&Message, StoreError> {
        let buffer = self
            .streaming
            .get_mut(session_id)
            .and_then(|buffers| buffers.remove(message_id))
            .ok_or_else(|| StoreError::NoBuffer {
                session_id: session_id.to_string(),
                message_id: message_id.to_string(),
            })?;
        if self
            .streaming
            .get(session_id)
            .is_some_and(|buffers| buffers.is_empty())
        {
            self.streaming.remove(session_id);
        }

        let message = Message {
            id: message_id.to_string(),
            role: Role::Assistant,
            content: buffer.content,
            participant: buffer.participant,
            parent_message_ids: buffer.parent_message_ids,
            status,
            feedback: None,
            model_id: buffer.model_id,
            created_at: Some(Utc::now()),
        };
        let list = self.messages.entry(session_id.to_string()).or_default();
        let index = match list.iter().position(|m| m.id == message_id) {
            Some(index) => {
                list[index] = message;
                index
            }
            None => {
                list.push(message);
                list.len() - 1
            }
        };
        Ok(&list[index])
    }

    /// Drops an unfinished buffer without producing a message.
    pub fn discard_streaming(&mut self, session_id: &str, message_id: &str) -> Option<StreamingBuffer> {
        let buffers = self.streaming.get_mut(session_id)?;
        let removed = buffers.remove(message_id);
        if buffers.is_empty() {
            self.streaming.remove(session_id);
        }
        removed
    }

    pub fn remove_message(&mut self, session_id: &str, message_id: &str) -> Result<Message, StoreError> {
        let list = self.messages.get_mut(session_id);
        let index = list
            .as_ref()
            .and_then(|list| list.iter().position(|m| m.id == message_id));
        match (list, index) {
            (Some(list), Some(index)) => Ok(list.remove(index)),
            _ => Err(StoreError::UnknownMessage {
                session_id: session_id.to_string(),
                message_id: message_id.to_string(),
            }),
        }
    }

    pub fn set_feedback(
        &mut self,
        session_id: &str,
        message_id: &str,
        value: Preference,
    ) -> Result<(), StoreError> {
        let message = self
            .messages
            .get_mut(session_id)
            .and_then(|list| list.iter_mut().find(|m| m.id == message_id))
            .ok_or_else(|| StoreError::UnknownMessage {
                session_id: session_id.to_string(),
                message_id: message_id.to_string(),
            })?;
        message.feedback = Some(value);
        Ok(())
    }

    fn buffer_mut(&mut self, session_id: &str, message_id: &str) -> Result<&mut StreamingBuffer, StoreError> {
        self.streaming
            .get_mut(session_id)
            .and_then(|buffers| buffers.get_mut(message_id))
            .ok_or_else(|| StoreError::NoBuffer {
                session_id: session_id.to_string(),
                message_id: message_id.to_string(),
            })
    }
}
