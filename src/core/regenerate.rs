//! In-place regeneration of a single finalized assistant message.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::endpoints;
use crate::auth::dispatcher::ApiRequest;
use crate::core::chat_stream::read_turn;
use crate::core::client::{ChatClient, ChatError, TurnKind};
use crate::core::message::{Message, MessageStatus};
use crate::core::notice::Notice;
use crate::core::reconciler::StreamReconciler;
use crate::core::store::{BufferSpec, SessionStore, StoreError};

/// Removes the target message and reopens an empty buffer under its id.
///
/// The removal happens before any replacement output exists, so a later
/// failure leaves the conversation without the message.
pub fn prepare_regeneration(
    store: &mut SessionStore,
    session_id: &str,
    message_id: &str,
) -> Result<StreamReconciler, ChatError> {
    let target = store
        .message(session_id, message_id)
        .ok_or_else(|| StoreError::UnknownMessage {
            session_id: session_id.to_string(),
            message_id: message_id.to_string(),
        })?;
    if !target.is_assistant() {
        return Err(ChatError::InvalidRegenerationTarget {
            message_id: message_id.to_string(),
        });
    }

    let original = store.remove_message(session_id, message_id)?;
    let buffer = BufferSpec::new(original.participant)
        .with_parents(original.parent_message_ids)
        .with_model(original.model_id);
    store.begin_streaming(session_id, message_id, buffer.clone())?;
    Ok(StreamReconciler::single(session_id, message_id, buffer))
}

impl ChatClient {
    /// Streams a fresh response for an existing assistant message. The
    /// replacement keeps the original id, parents and participant.
    pub async fn regenerate(
        &self,
        session_id: &str,
        message_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Message, ChatError> {
        let _guard = self.begin_turn(session_id, TurnKind::Regenerate)?;
        let mut reconciler =
            prepare_regeneration(&mut *self.store().lock().await, session_id, message_id)?;
        info!(%session_id, %message_id, "regenerating message");

        let request = ApiRequest::post(endpoints::regenerate(message_id));
        let response = match self.dispatcher().send_checked(&request).await {
            Ok(response) => response,
            Err(err) => {
                reconciler.abandon(&mut *self.store().lock().await);
                let _ = self.notices().send(Notice::TransportError {
                    session_id: session_id.to_string(),
                    message: err.to_string(),
                });
                return Err(err.into());
            }
        };

        let outcome = read_turn(
            response,
            &mut reconciler,
            self.store(),
            cancel,
            self.notices(),
        )
        .await?;
        let message = outcome
            .messages
            .into_iter()
            .next()
            .ok_or_else(|| ChatError::Transport("regeneration produced no message".to_string()))?;
        debug!(
            %session_id,
            %message_id,
            failed = message.status == MessageStatus::Error,
            "regeneration finished"
        );
        Ok(message)
    }
}
