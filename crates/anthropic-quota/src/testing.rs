//! In-process stand-ins for the messages API and the token endpoint

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Form, Router};
use tokio::net::TcpListener;

/// A request received by `MockApi`.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub token: String,
    pub headers: HashMap<String, String>,
    pub body: serde_json::Value,
}

#[derive(Clone)]
struct Scripted {
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: Option<String>,
}

#[derive(Clone, Default)]
struct ApiState {
    responses: Arc<Mutex<HashMap<String, Scripted>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    delay: Arc<Mutex<Duration>>,
}

/// Messages API stub. Unknown bearer tokens get 401.
pub struct MockApi {
    addr: SocketAddr,
    state: ApiState,
}

impl MockApi {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = ApiState::default();
        let app = Router::new()
            .route("/v1/messages", post(messages_handler))
            .with_state(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}/v1/messages", self.addr)
    }

    /// Script the response for requests bearing `token`.
    pub fn respond(&self, token: &str, status: StatusCode, headers: &[(&str, &str)]) {
        let headers = headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.script(token, Scripted { status, headers, body: None });
    }

    /// Script a response with a literal body for requests bearing `token`.
    pub fn respond_with_body(&self, token: &str, status: StatusCode, body: impl Into<String>) {
        self.script(
            token,
            Scripted {
                status,
                headers: Vec::new(),
                body: Some(body.into()),
            },
        );
    }

    fn script(&self, token: &str, scripted: Scripted) {
        self.state
            .responses
            .lock()
            .unwrap()
            .insert(token.to_string(), scripted);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.state.requests.lock().unwrap().len()
    }

    pub fn tokens_seen(&self) -> Vec<String> {
        self.state
            .requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.token.clone())
            .collect()
    }

    pub fn last_request(&self) -> Option<RecordedRequest> {
        self.state.requests.lock().unwrap().last().cloned()
    }
}

async fn messages_handler(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default()
        .to_string();
    let recorded_headers = headers
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
        .collect();
    state.requests.lock().unwrap().push(RecordedRequest {
        token: token.clone(),
        headers: recorded_headers,
        body: serde_json::from_str(&body).unwrap_or(serde_json::Value::Null),
    });

    let delay = *state.delay.lock().unwrap();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let scripted = state.responses.lock().unwrap().get(&token).cloned();
    match scripted {
        Some(Scripted {
            status,
            headers: extra,
            body,
        }) => {
            let body = body.unwrap_or_else(|| {
                if status == StatusCode::OK {
                    r#"{"type":"message","content":[]}"#.to_string()
                } else {
                    r#"{"type":"error","error":{"message":"mock error"}}"#.to_string()
                }
            });
            let mut response = (status, body).into_response();
            for (name, value) in extra {
                response.headers_mut().insert(
                    HeaderName::from_bytes(name.as_bytes()).unwrap(),
                    HeaderValue::from_str(&value).unwrap(),
                );
            }
            response
        }
        None => (
            StatusCode::UNAUTHORIZED,
            r#"{"type":"error","error":{"type":"authentication_error"}}"#,
        )
            .into_response(),
    }
}

#[derive(Clone, Default)]
struct TokenState {
    responses: Arc<Mutex<HashMap<String, (StatusCode, String)>>>,
    received: Arc<Mutex<Vec<String>>>,
    calls: Arc<AtomicUsize>,
    delay: Arc<Mutex<Duration>>,
}

/// Token endpoint stub keyed by the submitted refresh token. Unknown
/// refresh tokens get 400 `invalid_grant`.
pub struct MockTokenEndpoint {
    addr: SocketAddr,
    state: TokenState,
}

impl MockTokenEndpoint {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = TokenState::default();
        let app = Router::new()
            .route("/v1/oauth/token", post(token_handler))
            .with_state(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}/v1/oauth/token", self.addr)
    }

    /// Rotate `refresh` into the pair `(new_access, new_refresh)`.
    pub fn rotate(&self, refresh: &str, new_access: &str, new_refresh: &str) {
        let body = serde_json::json!({
            "access_token": new_access,
            "refresh_token": new_refresh,
            "expires_in": 28800,
        })
        .to_string();
        self.respond(refresh, StatusCode::OK, &body);
    }

    pub fn respond(&self, refresh: &str, status: StatusCode, body: &str) {
        self.state
            .responses
            .lock()
            .unwrap()
            .insert(refresh.to_string(), (status, body.to_string()));
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    pub fn refresh_tokens_seen(&self) -> Vec<String> {
        self.state.received.lock().unwrap().clone()
    }
}

async fn token_handler(
    State(state): State<TokenState>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    state.calls.fetch_add(1, Ordering::SeqCst);
    let refresh = form.get("refresh_token").cloned().unwrap_or_default();
    state.received.lock().unwrap().push(refresh.clone());

    let delay = *state.delay.lock().unwrap();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let scripted = state.responses.lock().unwrap().get(&refresh).cloned();
    match scripted {
        Some((status, body)) => (status, body).into_response(),
        None => (StatusCode::BAD_REQUEST, r#"{"error":"invalid_grant"}"#).into_response(),
    }
}
