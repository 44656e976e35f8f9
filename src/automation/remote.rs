use super::{AutomationDriver, AutomationError, AutomationSession, Credentials, Step};
use crate::http::build_client;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Client for a browser automation sidecar speaking JSON over HTTP. Requests
/// carry no overall timeout; the session lease bounds every call.
#[derive(Debug, Clone)]
pub struct RemoteDriver {
    base_url: String,
    http: Client,
}

#[derive(Deserialize)]
struct OpenSessionResponse {
    session_id: String,
}

#[derive(Serialize)]
struct StepsRequest<'a> {
    steps: &'a [Step],
}

#[derive(Deserialize)]
struct StepsResponse {
    #[serde(default)]
    captures: Vec<String>,
}

#[derive(Deserialize)]
struct SidecarError {
    kind: String,
    #[serde(default)]
    detail: Option<String>,
}

impl RemoteDriver {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: build_client(None),
        }
    }
}

#[async_trait]
impl AutomationDriver for RemoteDriver {
    async fn open_session(&self) -> Result<Box<dyn AutomationSession>, AutomationError> {
        let response = self
            .http
            .post(format!("{}/sessions", self.base_url))
            .send()
            .await
            .map_err(transport_error)?;
        let response = check(response).await?;
        let payload: OpenSessionResponse = response
            .json()
            .await
            .map_err(|err| AutomationError::Network(format!("invalid session payload: {err}")))?;
        debug!(
            target = "fleet.sessions",
            session_id = %payload.session_id,
            "remote session opened"
        );
        Ok(Box::new(RemoteSession {
            url: format!("{}/sessions/{}", self.base_url, payload.session_id),
            http: self.http.clone(),
        }))
    }
}

struct RemoteSession {
    url: String,
    http: Client,
}

#[async_trait]
impl AutomationSession for RemoteSession {
    async fn login(&mut self, credentials: &Credentials) -> Result<(), AutomationError> {
        let response = self
            .http
            .post(format!("{}/login", self.url))
            .json(credentials)
            .send()
            .await
            .map_err(transport_error)?;
        if matches!(
            response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            let detail = response
                .json::<SidecarError>()
                .await
                .ok()
                .and_then(|err| err.detail)
                .unwrap_or_else(|| "credentials rejected".into());
            return Err(AutomationError::LoginFailed(detail));
        }
        check(response).await.map(|_| ())
    }

    async fn interact(&mut self, steps: &[Step]) -> Result<Vec<String>, AutomationError> {
        let response = self
            .http
            .post(format!("{}/steps", self.url))
            .json(&StepsRequest { steps })
            .send()
            .await
            .map_err(transport_error)?;
        let response = check(response).await?;
        let payload: StepsResponse = response
            .json()
            .await
            .map_err(|err| AutomationError::Network(format!("invalid steps payload: {err}")))?;
        Ok(payload.captures)
    }

    async fn close(&mut self) {
        if let Err(err) = self.http.delete(&self.url).send().await {
            warn!(target = "fleet.sessions", "failed to close remote session: {err}");
        }
    }
}

fn transport_error(err: reqwest::Error) -> AutomationError {
    if err.is_timeout() {
        AutomationError::Timeout
    } else {
        AutomationError::Network(err.to_string())
    }
}

async fn check(response: Response) -> Result<Response, AutomationError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match response.json::<SidecarError>().await {
        Ok(body) => Err(classify(&body.kind, body.detail)),
        Err(_) => Err(AutomationError::Network(format!("HTTP {status}"))),
    }
}

fn classify(kind: &str, detail: Option<String>) -> AutomationError {
    let detail = detail.unwrap_or_else(|| kind.to_string());
    match kind {
        "timeout" => AutomationError::Timeout,
        "element_not_found" => AutomationError::ElementNotFound(detail),
        "login_failed" => AutomationError::LoginFailed(detail),
        "unexpected_page" => AutomationError::UnexpectedPage(detail),
        _ => AutomationError::Network(detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::{Control, Field, Marker, Page};
    use crate::session::SessionPool;
    use axum::{
        Json, Router,
        extract::{Path, State},
        http::StatusCode as AxumStatus,
        routing::{delete, post},
    };
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct Sidecar {
        closed: Arc<AtomicUsize>,
    }

    async fn open() -> Json<Value> {
        Json(json!({"session_id": "s1"}))
    }

    async fn login(Json(credentials): Json<Credentials>) -> (AxumStatus, Json<Value>) {
        if credentials.password == "pw" {
            (AxumStatus::OK, Json(json!({})))
        } else {
            (
                AxumStatus::UNAUTHORIZED,
                Json(json!({"kind": "login_failed", "detail": "password rejected"})),
            )
        }
    }

    async fn steps(
        Path(session): Path<String>,
        Json(body): Json<Value>,
    ) -> (AxumStatus, Json<Value>) {
        let steps = body["steps"].as_array().cloned().unwrap_or_default();
        if steps.iter().any(|step| step["value"] == "missing") {
            return (
                AxumStatus::UNPROCESSABLE_ENTITY,
                Json(json!({"kind": "element_not_found", "detail": "#title"})),
            );
        }
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let captures: Vec<String> = steps
            .iter()
            .filter(|step| step["op"] == "capture")
            .map(|_| format!("{session}-listing"))
            .collect();
        (AxumStatus::OK, Json(json!({"captures": captures})))
    }

    async fn close(State(sidecar): State<Sidecar>) -> AxumStatus {
        sidecar.closed.fetch_add(1, Ordering::SeqCst);
        AxumStatus::NO_CONTENT
    }

    async fn spawn_sidecar() -> (String, Sidecar) {
        let sidecar = Sidecar::default();
        let app = Router::new()
            .route("/sessions", post(open))
            .route("/sessions/{id}/login", post(login))
            .route("/sessions/{id}/steps", post(steps))
            .route("/sessions/{id}", delete(close))
            .with_state(sidecar.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        (format!("http://{addr}"), sidecar)
    }

    fn creds(password: &str) -> Credentials {
        Credentials {
            username: "seller".into(),
            password: password.into(),
        }
    }

    #[test]
    fn sidecar_error_kinds_are_classified() {
        assert_eq!(classify("timeout", None), AutomationError::Timeout);
        assert_eq!(
            classify("element_not_found", Some("#ship".into())),
            AutomationError::ElementNotFound("#ship".into())
        );
        assert_eq!(
            classify("captcha", None),
            AutomationError::Network("captcha".into())
        );
    }

    #[test]
    fn base_url_is_normalized() {
        let driver = RemoteDriver::new("http://sidecar:9222/");
        assert_eq!(driver.base_url, "http://sidecar:9222");
    }

    #[tokio::test]
    async fn step_list_gets_one_timeout_per_step() {
        let (url, _) = spawn_sidecar().await;
        let pool = SessionPool::new(Arc::new(RemoteDriver::new(&url)), 1, Duration::from_secs(1));
        let mut lease = pool.acquire().await.expect("lease");
        lease.login(&creds("pw")).await.expect("login");

        let steps = [
            Step::navigate_to(Page::ListingDetail, "L-9"),
            Step::click(Control::Polish),
            Step::capture(Marker::ListingId),
        ];
        let captures = lease.interact(&steps).await.expect("three-step budget");
        assert_eq!(captures, vec!["s1-listing".to_string()]);
        assert!(!lease.is_poisoned());
    }

    #[tokio::test]
    async fn session_lifecycle_maps_sidecar_errors() {
        let (url, sidecar) = spawn_sidecar().await;
        let driver = RemoteDriver::new(&url);
        let mut session = driver.open_session().await.expect("open");

        let err = session.login(&creds("wrong")).await.expect_err("rejected");
        assert_eq!(err, AutomationError::LoginFailed("password rejected".into()));
        session.login(&creds("pw")).await.expect("login");

        let err = session
            .interact(&[Step::fill(Field::Title, "missing")])
            .await
            .expect_err("missing element");
        assert_eq!(err, AutomationError::ElementNotFound("#title".into()));

        session.close().await;
        assert_eq!(sidecar.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unreachable_sidecar_is_a_network_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        let driver = RemoteDriver::new(&format!("http://{addr}"));
        let err = driver.open_session().await.err().expect("refused");
        assert!(matches!(err, AutomationError::Network(_)));
    }
}
