use futures_util::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::client::ChatError;
use crate::core::frame::FrameDecoder;
use crate::core::message::{Message, Participant};
use crate::core::notice::Notice;
use crate::core::reconciler::{ChannelSettled, StreamReconciler};
use crate::core::store::SessionStore;

/// Result of one streamed turn or regeneration.
#[derive(Debug, Clone, Default)]
pub struct TurnOutcome {
    pub session_id: String,
    pub user_message_id: Option<String>,
    /// Finalized assistant messages in completion order.
    pub messages: Vec<Message>,
    /// Channels that finished with `finishReason: error`.
    pub failures: Vec<(Participant, Option<String>)>,
}

impl TurnOutcome {
    fn record(&mut self, settled: ChannelSettled, notices: &mpsc::UnboundedSender<Notice>) {
        if settled.is_error() {
            let _ = notices.send(Notice::ChannelError {
                session_id: self.session_id.clone(),
                participant: settled.participant,
                message_id: settled.message.id.clone(),
                error: settled.error.clone(),
            });
            self.failures.push((settled.participant, settled.error));
        }
        self.messages.push(settled.message);
    }
}

enum StreamEnd {
    Settled,
    Cancelled,
    Failed(String),
}

/// Drains a streaming response into the store until every channel of the
/// turn has settled, the transport ends, or `cancel` fires.
///
/// Frames delivered in the same chunk are applied under one store lock, so
/// their cross-participant interleaving is preserved exactly. On cancellation
/// or transport failure, buffers that never completed are discarded.
pub async fn read_turn(
    response: reqwest::Response,
    reconciler: &mut StreamReconciler,
    store: &Mutex<SessionStore>,
    cancel: &CancellationToken,
    notices: &mpsc::UnboundedSender<Notice>,
) -> Result<TurnOutcome, ChatError> {
    let mut outcome = TurnOutcome {
        session_id: reconciler.session_id().to_string(),
        ..TurnOutcome::default()
    };
    let mut decoder = FrameDecoder::new();
    let mut stream = response.bytes_stream();

    let end = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break StreamEnd::Cancelled,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(bytes)) => {
                let mut store = store.lock().await;
                for frame in decoder.feed(&bytes) {
                    if let Some(settled) = reconciler.apply(&mut store, frame) {
                        outcome.record(settled, notices);
                    }
                }
                // Transports may stay open for keep-alive after the last
                // completion, so settling ends the read.
                if reconciler.is_settled() {
                    break StreamEnd::Settled;
                }
            }
            Some(Err(err)) => break StreamEnd::Failed(err.to_string()),
            None => {
                let mut store = store.lock().await;
                if let Some(frame) = std::mem::take(&mut decoder).finish() {
                    if let Some(settled) = reconciler.apply(&mut store, frame) {
                        outcome.record(settled, notices);
                    }
                }
                if reconciler.is_settled() {
                    break StreamEnd::Settled;
                }
                break StreamEnd::Failed("stream closed before the response completed".to_string());
            }
        }
    };
    // Release the connection before touching the store again.
    drop(stream);

    match end {
        StreamEnd::Settled => {
            debug!(
                session_id = %outcome.session_id,
                finalized = outcome.messages.len(),
                "turn settled"
            );
            Ok(outcome)
        }
        StreamEnd::Cancelled => {
            let dropped = reconciler.abandon(&mut *store.lock().await);
            debug!(session_id = %outcome.session_id, ?dropped, "stream cancelled");
            Err(ChatError::Cancelled)
        }
        StreamEnd::Failed(message) => {
            let dropped = reconciler.abandon(&mut *store.lock().await);
            warn!(session_id = %outcome.session_id, ?dropped, %message, "stream failed");
            let _ = notices.send(Notice::TransportError {
                session_id: outcome.session_id.clone(),
                message: message.clone(),
            });
            Err(ChatError::Transport(message))
        }
    }
}
