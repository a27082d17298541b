use std::error::Error;
use std::fmt;
use std::sync::Arc;

use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::auth::credentials::{CredentialError, CredentialKind, CredentialStore};
use crate::auth::refresh::{AuthError, RefreshCoordinator};
use crate::utils::url::{construct_api_url, endpoint_path};

/// Endpoint prefixes that never carry credentials and never trigger a
/// refresh, so the refresh call cannot recurse into itself.
pub const AUTH_EXEMPT_PREFIXES: &[&str] = &["/auth/", "/public/"];

pub const ANONYMOUS_TOKEN_HEADER: &str = "X-Anonymous-Token";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Bearer(String),
    Anonymous(String),
}

/// A replayable request description. The body is kept as JSON so the exact
/// request can be re-sent after a credential refresh.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self, DispatchError> {
        self.body = Some(serde_json::to_value(body).map_err(DispatchError::Encode)?);
        Ok(self)
    }
}

#[derive(Debug)]
pub enum DispatchError {
    Http(reqwest::Error),
    Status { status: StatusCode, body: String },
    Auth(AuthError),
    Credentials(CredentialError),
    Encode(serde_json::Error),
}

impl DispatchError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            DispatchError::Status { status, .. } => Some(*status),
            DispatchError::Http(err) => err.status(),
            _ => None,
        }
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::Http(err) => write!(f, "Request failed: {err}"),
            DispatchError::Status { status, body } => {
                let body = body.trim();
                if body.is_empty() {
                    write!(f, "Server responded with {status}")
                } else {
                    write!(f, "Server responded with {status}: {body}")
                }
            }
            DispatchError::Auth(err) => write!(f, "{err}"),
            DispatchError::Credentials(err) => write!(f, "{err}"),
            DispatchError::Encode(err) => write!(f, "Failed to encode request body: {err}"),
        }
    }
}

impl Error for DispatchError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DispatchError::Http(err) => Some(err),
            DispatchError::Auth(err) => Some(err),
            DispatchError::Credentials(err) => Some(err),
            DispatchError::Encode(err) => Some(err),
            DispatchError::Status { .. } => None,
        }
    }
}

impl From<reqwest::Error> for DispatchError {
    fn from(err: reqwest::Error) -> Self {
        DispatchError::Http(err)
    }
}

impl From<AuthError> for DispatchError {
    fn from(err: AuthError) -> Self {
        DispatchError::Auth(err)
    }
}

impl From<CredentialError> for DispatchError {
    fn from(err: CredentialError) -> Self {
        DispatchError::Credentials(err)
    }
}

pub fn is_auth_exempt(path: &str) -> bool {
    let path = endpoint_path(path);
    AUTH_EXEMPT_PREFIXES
        .iter()
        .any(|prefix| path.starts_with(prefix))
}

/// Sends every outbound request: picks the credential, attaches it, and
/// hands a 401 to the refresh coordinator exactly once per request.
pub struct RequestDispatcher {
    client: reqwest::Client,
    base_url: String,
    coordinator: Arc<RefreshCoordinator>,
}

impl RequestDispatcher {
    pub fn new(client: reqwest::Client, base_url: &str, coordinator: Arc<RefreshCoordinator>) -> Self {
        Self {
            client,
            base_url: base_url.to_string(),
            coordinator,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    pub fn credentials(&self) -> &CredentialStore {
        self.coordinator.credentials()
    }

    /// The user credential if signed in, else the anonymous one, else none.
    pub fn credential(&self) -> Result<Option<Credential>, CredentialError> {
        let credentials = self.credentials();
        if let Some(access) = credentials.get(CredentialKind::Access)? {
            return Ok(Some(Credential::Bearer(access)));
        }
        Ok(credentials
            .get(CredentialKind::Anonymous)?
            .map(Credential::Anonymous))
    }

    /// Sends the request and returns the response whatever its status,
    /// after at most one credential refresh and replay.
    pub async fn send(&self, request: &ApiRequest) -> Result<Response, DispatchError> {
        if is_auth_exempt(&request.path) {
            let response = self.build(request, None).send().await?;
            if response.status().is_success() {
                self.coordinator.record_success();
            }
            return Ok(response);
        }

        let credential = self.credential()?;
        let response = self.build(request, credential.as_ref()).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            if response.status().is_success() {
                self.coordinator.record_success();
            }
            return Ok(response);
        }

        debug!(path = %request.path, "unauthorized; consulting refresh coordinator");
        drop(response);
        let access = self.coordinator.handle_unauthorized().await?;
        let replayed = self
            .build(request, Some(&Credential::Bearer(access)))
            .send()
            .await?;
        if replayed.status().is_success() {
            self.coordinator.record_success();
        }
        Ok(replayed)
    }

    /// Like [`send`](Self::send) but turns non-success statuses into errors.
    pub async fn send_checked(&self, request: &ApiRequest) -> Result<Response, DispatchError> {
        let response = self.send(request).await?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(DispatchError::Status { status, body })
    }

    pub async fn send_json<T: DeserializeOwned>(&self, request: &ApiRequest) -> Result<T, DispatchError> {
        Ok(self.send_checked(request).await?.json::<T>().await?)
    }

    fn build(&self, request: &ApiRequest, credential: Option<&Credential>) -> RequestBuilder {
        let url = construct_api_url(&self.base_url, &request.path);
        let mut builder = self.client.request(request.method.clone(), url);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        match credential {
            Some(Credential::Bearer(token)) => builder.bearer_auth(token),
            Some(Credential::Anonymous(token)) => builder.header(ANONYMOUS_TOKEN_HEADER, token),
            None => builder,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::refresh::{HttpTokenRefresher, RefreshPolicy};
    use crate::core::notice::Notice;
    use crate::utils::test_utils::{MockResponse, MockServer};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn dispatcher(
        base_url: &str,
        credentials: CredentialStore,
    ) -> (RequestDispatcher, mpsc::UnboundedReceiver<Notice>) {
        let client = reqwest::Client::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let refresher = HttpTokenRefresher::new(client.clone(), base_url, Duration::from_secs(5));
        let coordinator = Arc::new(RefreshCoordinator::new(
            Box::new(refresher),
            credentials,
            RefreshPolicy::default(),
            tx,
        ));
        (RequestDispatcher::new(client, base_url, coordinator), rx)
    }

    #[test]
    fn exempt_prefixes_match_rooted_paths() {
        assert!(is_auth_exempt("/auth/refresh/"));
        assert!(is_auth_exempt("auth/login/"));
        assert!(is_auth_exempt("/public/models/"));
        assert!(!is_auth_exempt("/sessions/"));
        assert!(!is_auth_exempt("/messages/auth-notes/"));
    }

    #[test]
    fn bearer_credential_wins_over_anonymous() {
        let credentials = CredentialStore::in_memory();
        let (dispatcher, _rx) = dispatcher("http://unused", credentials.clone());
        assert_eq!(dispatcher.credential().unwrap(), None);

        credentials.set(CredentialKind::Anonymous, "anon").unwrap();
        assert_eq!(
            dispatcher.credential().unwrap(),
            Some(Credential::Anonymous("anon".into()))
        );

        credentials.set(CredentialKind::Access, "acc").unwrap();
        assert_eq!(
            dispatcher.credential().unwrap(),
            Some(Credential::Bearer("acc".into()))
        );
    }

    #[tokio::test]
    async fn attaches_exactly_one_credential_kind() {
        let server = MockServer::start(|_| async { MockResponse::json(200, "{}") }).await;
        let credentials = CredentialStore::in_memory();
        credentials.set(CredentialKind::Anonymous, "anon-1").unwrap();
        let (dispatcher, _rx) = dispatcher(&server.base_url, credentials.clone());

        dispatcher.send(&ApiRequest::get("/sessions/")).await.unwrap();
        credentials.set(CredentialKind::Access, "acc-1").unwrap();
        dispatcher.send(&ApiRequest::get("/sessions/")).await.unwrap();
        dispatcher
            .send(&ApiRequest::post("/public/ping/"))
            .await
            .unwrap();

        let requests = server.requests().await;
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].header(ANONYMOUS_TOKEN_HEADER), Some("anon-1"));
        assert_eq!(requests[0].header("authorization"), None);
        assert_eq!(requests[1].header("authorization"), Some("Bearer acc-1"));
        assert_eq!(requests[1].header(ANONYMOUS_TOKEN_HEADER), None);
        assert_eq!(requests[2].header("authorization"), None);
        assert_eq!(requests[2].header(ANONYMOUS_TOKEN_HEADER), None);
    }

    #[tokio::test]
    async fn auth_storm_triggers_a_single_refresh_and_replays_everything() {
        let unauthorized = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&unauthorized);
        let server = MockServer::start(move |request| {
            let seen = Arc::clone(&seen);
            async move {
                if request.path == "/auth/refresh/" {
                    assert_eq!(request.json()["refresh"], "refresh-1");
                    // Hold the refresh until every original request has failed.
                    while seen.load(Ordering::SeqCst) < 5 {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    return MockResponse::json(200, r#"{"access":"fresh"}"#);
                }
                if request.header("authorization") == Some("Bearer fresh") {
                    MockResponse::json(200, r#"{"ok":true}"#)
                } else {
                    seen.fetch_add(1, Ordering::SeqCst);
                    MockResponse::json(401, r#"{"detail":"token expired"}"#)
                }
            }
        })
        .await;

        let credentials = CredentialStore::in_memory();
        credentials.set(CredentialKind::Access, "stale").unwrap();
        credentials.set(CredentialKind::Refresh, "refresh-1").unwrap();
        let (dispatcher, mut notices) = dispatcher(&server.base_url, credentials.clone());
        let dispatcher = Arc::new(dispatcher);

        let tasks: Vec<_> = (0..5)
            .map(|i| {
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    dispatcher
                        .send_checked(&ApiRequest::get(format!("/sessions/{i}/")))
                        .await
                        .map(|response| response.status())
                })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), StatusCode::OK);
        }

        assert_eq!(server.count("/auth/refresh/").await, 1);
        let requests = server.requests().await;
        let replays = requests
            .iter()
            .filter(|r| r.header("authorization") == Some("Bearer fresh"))
            .count();
        assert_eq!(replays, 5);
        let refresh = requests
            .iter()
            .find(|r| r.path == "/auth/refresh/")
            .unwrap();
        assert_eq!(refresh.header("authorization"), None);
        assert_eq!(
            credentials.get(CredentialKind::Access).unwrap().as_deref(),
            Some("fresh")
        );
        assert!(notices.try_recv().is_err());
    }

    #[tokio::test]
    async fn refresh_network_failure_expires_the_session() {
        let server = MockServer::start(|request| async move {
            if request.path == "/auth/refresh/" {
                MockResponse::Disconnect
            } else {
                MockResponse::json(401, "{}")
            }
        })
        .await;
        let credentials = CredentialStore::in_memory();
        credentials.set(CredentialKind::Access, "stale").unwrap();
        credentials.set(CredentialKind::Refresh, "refresh-1").unwrap();
        let (dispatcher, mut notices) = dispatcher(&server.base_url, credentials.clone());

        let err = dispatcher
            .send(&ApiRequest::get("/sessions/"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Auth(AuthError::SessionExpired)));
        assert_eq!(credentials.get(CredentialKind::Access).unwrap(), None);
        assert!(matches!(notices.try_recv(), Ok(Notice::LoggedOut { .. })));
        assert!(notices.try_recv().is_err());
    }

    #[tokio::test]
    async fn replayed_request_is_not_refreshed_again() {
        let server = MockServer::start(|request| async move {
            if request.path == "/auth/refresh/" {
                MockResponse::json(200, r#"{"access":"still-bad"}"#)
            } else {
                MockResponse::json(401, "{}")
            }
        })
        .await;
        let credentials = CredentialStore::in_memory();
        credentials.set(CredentialKind::Refresh, "refresh-1").unwrap();
        let (dispatcher, _rx) = dispatcher(&server.base_url, credentials);

        let err = dispatcher
            .send_checked(&ApiRequest::get("/sessions/"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::UNAUTHORIZED));
        assert_eq!(server.count("/auth/refresh/").await, 1);
        assert_eq!(server.count("/sessions/").await, 2);
    }

    #[tokio::test]
    async fn exempt_endpoints_do_not_trigger_refresh() {
        let server = MockServer::start(|_| async { MockResponse::json(401, "{}") }).await;
        let credentials = CredentialStore::in_memory();
        credentials.set(CredentialKind::Refresh, "refresh-1").unwrap();
        let (dispatcher, _rx) = dispatcher(&server.base_url, credentials);

        let response = dispatcher
            .send(&ApiRequest::post("/auth/login/"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(server.count("/auth/refresh/").await, 0);
    }
}
