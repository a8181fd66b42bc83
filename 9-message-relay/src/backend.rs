use std::time::Duration;

use anyhow::{Context, ensure};
use reqwest::{Method, StatusCode, header::CONTENT_TYPE};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::event::Id;

/// Backend routes, relative to the configured base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Send,
    Delivered,
    ReadAll,
    Conversation(String),
    Update,
    Delete,
}

impl Route {
    pub fn method(&self) -> Method {
        match self {
            Route::Conversation(_) => Method::GET,
            _ => Method::POST,
        }
    }

    pub fn segments(&self) -> Vec<&str> {
        match self {
            Route::Send => vec!["messages", "send"],
            Route::Delivered => vec!["messages", "delivered"],
            Route::ReadAll => vec!["messages", "read-all"],
            Route::Update => vec!["messages", "update"],
            Route::Delete => vec!["messages", "delete"],
            Route::Conversation(id) => vec!["messages", "conversation", id.as_str()],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackendRequest {
    pub route: Route,
    pub body: Option<Value>,
}

impl BackendRequest {
    pub fn post(route: Route, body: Value) -> Self {
        Self {
            route,
            body: Some(body),
        }
    }

    pub fn get(route: Route) -> Self {
        Self { route, body: None }
    }
}

/// The two participants the backend resolves for every conversation route.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Participants {
    #[serde(rename = "conversation_user_id")]
    pub user_id: Id,
    #[serde(rename = "conversation_admin_id")]
    pub admin_id: Id,
}

#[derive(Deserialize)]
struct ParticipantsEnvelope {
    data: Participants,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend base url cannot take route segments")]
    InvalidBaseUrl,
    #[error("backend request timed out")]
    Timeout,
    #[error("backend request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("backend responded with status {0}")]
    Status(StatusCode),
    #[error("backend response has no conversation participants: {0}")]
    Contract(#[source] serde_json::Error),
}

impl BackendError {
    /// Contract violations are reported separately from transport failures.
    pub fn is_contract(&self) -> bool {
        matches!(self, BackendError::Contract(_))
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BackendError::Timeout
        } else {
            BackendError::Request(err)
        }
    }
}

/// Every backend route answers with the same `data` shape, whatever it
/// persisted; this is the only place that shape is read.
pub fn parse_participants(body: &[u8]) -> Result<Participants, BackendError> {
    serde_json::from_slice::<ParticipantsEnvelope>(body)
        .map(|envelope| envelope.data)
        .map_err(BackendError::Contract)
}

#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base: Url,
}

impl BackendClient {
    pub fn new(base: Url, timeout: Duration) -> anyhow::Result<Self> {
        ensure!(
            !base.cannot_be_a_base(),
            "backend url {base} cannot be used as a base url"
        );

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build backend http client")?;

        Ok(Self { http, base })
    }

    pub fn endpoint(&self, route: &Route) -> Result<Url, BackendError> {
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| BackendError::InvalidBaseUrl)?;
            // Pushed segments are percent-encoded, so ids cannot escape the route.
            segments.pop_if_empty().extend(route.segments());
        }
        Ok(url)
    }

    /// Sends the request and resolves the conversation participants.
    pub async fn forward(&self, request: &BackendRequest) -> Result<Participants, BackendError> {
        let url = self.endpoint(&request.route)?;
        debug!(method = %request.route.method(), %url, "forwarding event to backend");

        let mut builder = self
            .http
            .request(request.route.method(), url)
            .header(CONTENT_TYPE, "application/json");
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status(status));
        }

        let body = response.bytes().await?;
        parse_participants(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> BackendClient {
        BackendClient::new(base.parse().expect("valid url"), Duration::from_secs(1))
            .expect("client builds")
    }

    #[test]
    fn parses_string_and_numeric_participants() {
        let parsed = parse_participants(
            br#"{"data":{"conversation_user_id":12,"conversation_admin_id":"admin-1","title":"x"}}"#,
        )
        .expect("valid contract");

        assert_eq!(
            parsed,
            Participants {
                user_id: Id::Number(12),
                admin_id: Id::Text("admin-1".into()),
            }
        );
    }

    #[test]
    fn missing_participants_is_a_contract_error() {
        let err = parse_participants(br#"{"data":{"conversation_user_id":"u1"}}"#)
            .expect_err("admin id missing");
        assert!(err.is_contract());

        let err = parse_participants(b"<html>oops</html>").expect_err("not json");
        assert!(err.is_contract());
    }

    #[test]
    fn builds_endpoints_under_the_base_path() {
        let backend = client("https://backend.test/api/v1");
        assert_eq!(
            backend.endpoint(&Route::ReadAll).expect("endpoint").as_str(),
            "https://backend.test/api/v1/messages/read-all"
        );

        let backend = client("https://backend.test/api/v1/");
        assert_eq!(
            backend.endpoint(&Route::Send).expect("endpoint").as_str(),
            "https://backend.test/api/v1/messages/send"
        );
    }

    #[test]
    fn escapes_conversation_ids_in_the_path() {
        let backend = client("http://127.0.0.1:9000/api");
        let url = backend
            .endpoint(&Route::Conversation("a/b c".into()))
            .expect("endpoint");
        assert_eq!(url.as_str(), "http://127.0.0.1:9000/api/messages/conversation/a%2Fb%20c");
        assert_eq!(Route::Conversation("1".into()).method(), Method::GET);
        assert_eq!(Route::Delete.method(), Method::POST);
    }

    #[test]
    fn rejects_non_base_urls() {
        let base: Url = "mailto:relay@example.com".parse().expect("valid url");
        assert!(BackendClient::new(base, Duration::from_secs(1)).is_err());
    }
}
