use tracing::{debug, warn};

use crate::core::frame::{FinishReason, Frame};
use crate::core::message::{Message, MessageStatus, Participant};
use crate::core::store::{BufferSpec, SessionStore};

/// Where frames for one channel of a turn are written.
#[derive(Debug, Clone)]
pub struct ChannelRoute {
    /// Tag this channel answers to; `None` accepts frames of either tag.
    pub tag: Option<Participant>,
    pub message_id: String,
    pub buffer: BufferSpec,
}

#[derive(Debug)]
struct Channel {
    route: ChannelRoute,
    settled: bool,
}

/// A channel that just completed, with the message it was finalized into.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSettled {
    pub participant: Participant,
    pub message: Message,
    pub reason: FinishReason,
    pub error: Option<String>,
}

impl ChannelSettled {
    pub fn is_error(&self) -> bool {
        self.reason.is_error()
    }
}

/// Applies decoded frames for one turn to the session store.
///
/// A turn is settled once every routed channel has signalled completion,
/// which may happen well before the transport closes.
#[derive(Debug)]
pub struct StreamReconciler {
    session_id: String,
    channels: Vec<Channel>,
}

impl StreamReconciler {
    pub fn new(session_id: impl Into<String>, routes: Vec<ChannelRoute>) -> Self {
        Self {
            session_id: session_id.into(),
            channels: routes
                .into_iter()
                .map(|route| Channel {
                    route,
                    settled: false,
                })
                .collect(),
        }
    }

    /// Routes every frame, whatever its tag, to `message_id`.
    pub fn single(session_id: impl Into<String>, message_id: impl Into<String>, buffer: BufferSpec) -> Self {
        Self::new(
            session_id,
            vec![ChannelRoute {
                tag: None,
                message_id: message_id.into(),
                buffer,
            }],
        )
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_settled(&self) -> bool {
        self.channels.iter().all(|channel| channel.settled)
    }

    /// Message ids whose channel has not completed yet.
    pub fn unsettled(&self) -> impl Iterator<Item = &str> {
        self.channels
            .iter()
            .filter(|channel| !channel.settled)
            .map(|channel| channel.route.message_id.as_str())
    }

    /// Applies one frame. Frames for unknown or already-settled channels are
    /// ignored; store failures are logged and absorbed.
    pub fn apply(&mut self, store: &mut SessionStore, frame: Frame) -> Option<ChannelSettled> {
        let participant = frame.participant();
        let Some(channel) = self.channels.iter_mut().find(|channel| {
            !channel.settled && channel.route.tag.is_none_or(|tag| tag == participant)
        }) else {
            debug!(%participant, "ignoring frame for a settled or unrouted channel");
            return None;
        };

        let session_id = self.session_id.as_str();
        let message_id = channel.route.message_id.as_str();
        if store.streaming_buffer(session_id, message_id).is_none() {
            if let Err(err) = store.begin_streaming(session_id, message_id, channel.route.buffer.clone()) {
                warn!(error = %err, "cannot open streaming buffer; dropping frame");
                return None;
            }
        }

        match frame {
            Frame::Content { text, .. } => {
                if let Err(err) = store.append_chunk(session_id, message_id, &text) {
                    warn!(error = %err, "dropping content frame");
                }
                None
            }
            Frame::Completion { reason, error, .. } => {
                channel.settled = true;
                let status = if reason.is_error() {
                    MessageStatus::Error
                } else {
                    MessageStatus::Complete
                };
                // An errored channel keeps whatever it produced so far.
                let finalized = match store.finalize(session_id, message_id, status) {
                    Ok(message) => message.clone(),
                    Err(err) => {
                        warn!(error = %err, "completion without a streaming buffer");
                        return None;
                    }
                };
                debug!(
                    session_id,
                    message_id,
                    participant = %finalized.participant.unwrap_or(participant),
                    ?status,
                    "channel settled"
                );
                Some(ChannelSettled {
                    participant,
                    message: finalized,
                    reason,
                    error,
                })
            }
        }
    }

    /// Discards the buffers of channels that never completed and marks them
    /// settled. Returns the discarded message ids.
    pub fn abandon(&mut self, store: &mut SessionStore) -> Vec<String> {
        let mut dropped = Vec::new();
        for channel in self.channels.iter_mut().filter(|channel| !channel.settled) {
            channel.settled = true;
            let message_id = channel.route.message_id.clone();
            if store.discard_streaming(&self.session_id, &message_id).is_some() {
                debug!(session_id = %self.session_id, %message_id, "discarded unfinished buffer");
            }
            dropped.push(message_id);
        }
        dropped
    }
}
