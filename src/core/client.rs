//! High-level chat client: session lifecycle, streamed turns and feedback.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::endpoints;
use crate::api::{
    CreateSessionRequest, FeedbackRequest, RenameSessionRequest, SessionDetail, SessionList,
    StreamRequest, TitleResponse,
};
use crate::auth::credentials::CredentialStore;
use crate::auth::dispatcher::{ApiRequest, DispatchError, RequestDispatcher};
use crate::auth::refresh::{HttpTokenRefresher, RefreshCoordinator, RefreshPolicy, TokenRefresher};
use crate::core::chat_stream::{read_turn, TurnOutcome};
use crate::core::config::Config;
use crate::core::message::{Message, Participant, Preference};
use crate::core::notice::Notice;
use crate::core::reconciler::{ChannelRoute, StreamReconciler};
use crate::core::session::{ChatMode, Session};
use crate::core::store::{BufferSpec, SessionStore, StoreError};
use crate::utils::url::normalize_base_url;

#[derive(Debug)]
pub enum ChatError {
    Dispatch(DispatchError),
    Store(StoreError),
    UnknownSession(String),
    /// Only finalized assistant messages can be regenerated.
    InvalidRegenerationTarget { message_id: String },
    /// A send or regeneration is already outstanding for this session.
    SessionBusy(String),
    /// The response stream failed or closed before every channel settled.
    Transport(String),
    Cancelled,
}

impl fmt::Display for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatError::Dispatch(err) => write!(f, "{err}"),
            ChatError::Store(err) => write!(f, "{err}"),
            ChatError::UnknownSession(id) => write!(f, "Unknown session {id}"),
            ChatError::InvalidRegenerationTarget { message_id } => {
                write!(f, "Message {message_id} is not an assistant response")
            }
            ChatError::SessionBusy(id) => {
                write!(f, "Session {id} is still waiting on a response")
            }
            ChatError::Transport(message) => write!(f, "Failed to get a response: {message}"),
            ChatError::Cancelled => write!(f, "Request cancelled"),
        }
    }
}

impl Error for ChatError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ChatError::Dispatch(err) => Some(err),
            ChatError::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DispatchError> for ChatError {
    fn from(err: DispatchError) -> Self {
        ChatError::Dispatch(err)
    }
}

impl From<StoreError> for ChatError {
    fn from(err: StoreError) -> Self {
        ChatError::Store(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TurnKind {
    Send,
    Regenerate,
}

type InFlight = Arc<StdMutex<HashMap<String, TurnKind>>>;

/// Marks a session busy until dropped.
pub(crate) struct TurnGuard {
    in_flight: InFlight,
    session_id: String,
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.session_id);
    }
}

/// A new user turn.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub session_id: String,
    pub content: String,
    /// Messages the new user message answers; empty for the first turn.
    pub parent_message_ids: Vec<String>,
}

pub struct ChatClient {
    dispatcher: RequestDispatcher,
    store: Arc<Mutex<SessionStore>>,
    in_flight: InFlight,
    notices: mpsc::UnboundedSender<Notice>,
}

impl ChatClient {
    pub fn from_config(
        config: &Config,
        credentials: CredentialStore,
    ) -> (Self, mpsc::UnboundedReceiver<Notice>) {
        Self::new(
            &config.base_url,
            credentials,
            config.auth.policy(),
            config.auth.refresh_timeout(),
        )
    }

    pub fn new(
        base_url: &str,
        credentials: CredentialStore,
        policy: RefreshPolicy,
        refresh_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let client = reqwest::Client::new();
        let base_url = normalize_base_url(base_url);
        let refresher = HttpTokenRefresher::new(client.clone(), &base_url, refresh_timeout);
        Self::with_refresher(client, &base_url, Box::new(refresher), credentials, policy)
    }

    pub fn with_refresher(
        client: reqwest::Client,
        base_url: &str,
        refresher: Box<dyn TokenRefresher>,
        credentials: CredentialStore,
        policy: RefreshPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = Arc::new(RefreshCoordinator::new(
            refresher,
            credentials,
            policy,
            tx.clone(),
        ));
        let client = Self {
            dispatcher: RequestDispatcher::new(client, base_url, coordinator),
            store: Arc::new(Mutex::new(SessionStore::new())),
            in_flight: Arc::new(StdMutex::new(HashMap::new())),
            notices: tx,
        };
        (client, rx)
    }

    pub fn store(&self) -> &Arc<Mutex<SessionStore>> {
        &self.store
    }

    pub fn dispatcher(&self) -> &RequestDispatcher {
        &self.dispatcher
    }

    pub(crate) fn notices(&self) -> &mpsc::UnboundedSender<Notice> {
        &self.notices
    }

    /// True while a regeneration is outstanding for the session.
    pub fn is_regenerating(&self, session_id: &str) -> bool {
        self.lock_in_flight().get(session_id) == Some(&TurnKind::Regenerate)
    }

    /// True while any send or regeneration is outstanding for the session.
    pub fn is_busy(&self, session_id: &str) -> bool {
        self.lock_in_flight().contains_key(session_id)
    }

    pub(crate) fn begin_turn(&self, session_id: &str, kind: TurnKind) -> Result<TurnGuard, ChatError> {
        let mut in_flight = self.lock_in_flight();
        if in_flight.contains_key(session_id) {
            return Err(ChatError::SessionBusy(session_id.to_string()));
        }
        in_flight.insert(session_id.to_string(), kind);
        Ok(TurnGuard {
            in_flight: Arc::clone(&self.in_flight),
            session_id: session_id.to_string(),
        })
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<String, TurnKind>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn create_session(
        &self,
        mode: ChatMode,
        model_a: Option<&str>,
        model_b: Option<&str>,
    ) -> Result<Session, ChatError> {
        let request = ApiRequest::post(endpoints::SESSIONS).json(&CreateSessionRequest {
            mode,
            model_a_id: model_a,
            model_b_id: model_b,
        })?;
        let session: Session = self.dispatcher.send_json(&request).await?;
        info!(session_id = %session.id, %mode, "created session");
        self.store.lock().await.insert_session(session.clone());
        Ok(session)
    }

    pub async fn fetch_sessions(&self) -> Result<Vec<Session>, ChatError> {
        let list: SessionList = self
            .dispatcher
            .send_json(&ApiRequest::get(endpoints::SESSIONS))
            .await?;
        let sessions = list.into_sessions();
        self.store.lock().await.set_sessions(sessions.clone());
        Ok(sessions)
    }

    /// Fetches a session's finalized history and replaces the local copy.
    pub async fn load_session(&self, session_id: &str) -> Result<Session, ChatError> {
        let detail: SessionDetail = self
            .dispatcher
            .send_json(&ApiRequest::get(endpoints::session(session_id)))
            .await?;
        let session = detail.session.clone();
        self.store
            .lock()
            .await
            .set_session_state(detail.session, detail.messages);
        Ok(session)
    }

    pub async fn set_active_session(&self, session_id: Option<&str>) -> Result<(), ChatError> {
        let mut store = self.store.lock().await;
        if let Some(id) = session_id {
            if store.session(id).is_none() {
                return Err(ChatError::UnknownSession(id.to_string()));
            }
        }
        store.set_active_session(session_id);
        Ok(())
    }

    /// Asks the server to title the session from its first turn.
    pub async fn generate_title(&self, session_id: &str) -> Result<Option<String>, ChatError> {
        let response: TitleResponse = self
            .dispatcher
            .send_json(&ApiRequest::post(endpoints::generate_title(session_id)))
            .await?;
        if let Some(title) = &response.title {
            self.store.lock().await.set_title(session_id, title)?;
        }
        Ok(response.title)
    }

    pub async fn rename_session(&self, session_id: &str, title: &str) -> Result<(), ChatError> {
        let request =
            ApiRequest::patch(endpoints::session(session_id)).json(&RenameSessionRequest { title })?;
        self.dispatcher.send_checked(&request).await?;
        let mut store = self.store.lock().await;
        if store.session(session_id).is_some() {
            store.set_title(session_id, title)?;
        }
        Ok(())
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<(), ChatError> {
        self.dispatcher
            .send_checked(&ApiRequest::delete(endpoints::session(session_id)))
            .await?;
        if self.store.lock().await.remove_session(session_id).is_some() {
            info!(%session_id, "deleted session");
        }
        Ok(())
    }

    pub async fn submit_feedback(
        &self,
        session_id: &str,
        message_id: &str,
        preference: Preference,
    ) -> Result<(), ChatError> {
        let request = ApiRequest::post(endpoints::FEEDBACK).json(&FeedbackRequest::preference(
            session_id, message_id, preference,
        ))?;
        self.dispatcher.send_checked(&request).await?;
        self.store
            .lock()
            .await
            .set_feedback(session_id, message_id, preference)?;
        Ok(())
    }

    /// Sends a user turn and streams every participant's response into the
    /// store. The session must already be known to the store.
    pub async fn send_message(
        &self,
        request: SendRequest,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, ChatError> {
        let _guard = self.begin_turn(&request.session_id, TurnKind::Send)?;
        let session_id = request.session_id.as_str();
        let first_turn = request.parent_message_ids.is_empty();

        let (user, placeholders) = {
            let mut store = self.store.lock().await;
            let session = store
                .session(session_id)
                .cloned()
                .ok_or_else(|| ChatError::UnknownSession(session_id.to_string()))?;

            let user = Message::user(
                Uuid::new_v4().to_string(),
                request.content,
                request.parent_message_ids,
            );
            let placeholders: Vec<(Participant, Message)> = session
                .mode
                .participants()
                .iter()
                .map(|&participant| {
                    let placeholder = Message::placeholder(
                        Uuid::new_v4().to_string(),
                        participant,
                        vec![user.id.clone()],
                        session.model_for(participant).map(str::to_string),
                    );
                    (participant, placeholder)
                })
                .collect();

            store.add_message(session_id, user.clone())?;
            for (participant, placeholder) in &placeholders {
                store.begin_streaming(
                    session_id,
                    &placeholder.id,
                    buffer_spec(*participant, placeholder),
                )?;
            }
            (user, placeholders)
        };

        let routes = placeholders
            .iter()
            .map(|(participant, placeholder)| ChannelRoute {
                tag: Some(*participant),
                message_id: placeholder.id.clone(),
                buffer: buffer_spec(*participant, placeholder),
            })
            .collect();
        let mut reconciler = StreamReconciler::new(session_id, routes);

        let mut messages = vec![&user];
        messages.extend(placeholders.iter().map(|(_, placeholder)| placeholder));
        let api_request = ApiRequest::post(endpoints::MESSAGES_STREAM).json(&StreamRequest {
            session_id,
            messages,
        })?;
        debug!(%session_id, channels = placeholders.len(), "sending turn");

        let response = match self.dispatcher.send_checked(&api_request).await {
            Ok(response) => response,
            Err(err) => {
                reconciler.abandon(&mut *self.store.lock().await);
                let _ = self.notices.send(Notice::TransportError {
                    session_id: session_id.to_string(),
                    message: err.to_string(),
                });
                return Err(err.into());
            }
        };

        let mut outcome = read_turn(response, &mut reconciler, &self.store, cancel, &self.notices).await?;
        outcome.user_message_id = Some(user.id);

        if first_turn {
            if let Err(err) = self.generate_title(session_id).await {
                warn!(%session_id, error = %err, "title generation failed");
            }
        }
        Ok(outcome)
    }
}

fn buffer_spec(participant: Participant, placeholder: &Message) -> BufferSpec {
    BufferSpec::new(participant)
        .with_parents(placeholder.parent_message_ids.clone())
        .with_model(placeholder.model_id.clone())
}
