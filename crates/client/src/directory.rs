//! Out-of-band meeting registration with the REST backend.

use async_trait::async_trait;
use meetroom_contracts::RoomCode;
use reqwest::Client;
use serde::Serialize;
use url::Url;

use crate::config::MeetConfig;
use crate::error::DirectoryError;

/// Registers and deregisters participation in a meeting, independent of
/// the signaling connection.
#[async_trait]
pub trait MeetingDirectory: Send + Sync {
    async fn join_meeting(&self, code: &RoomCode) -> Result<(), DirectoryError>;

    async fn leave_meeting(&self, code: &RoomCode) -> Result<(), DirectoryError>;
}

#[derive(Serialize)]
struct MeetingCodeBody<'a> {
    code: &'a str,
}

/// `POST {base}/meetings/join` and `POST {base}/meetings/leave`.
#[derive(Debug, Clone)]
pub struct HttpDirectory {
    base: Url,
    token: Option<String>,
    http: Client,
}

impl HttpDirectory {
    pub fn new(base: Url, token: Option<String>) -> Self {
        Self {
            base,
            token,
            http: Client::new(),
        }
    }

    /// `None` when no API base is configured.
    pub fn from_config(config: &MeetConfig) -> Option<Self> {
        config
            .api_base
            .clone()
            .map(|base| Self::new(base, config.api_token.clone()))
    }

    fn endpoint(&self, action: &str) -> Result<Url, DirectoryError> {
        let base = self.base.as_str().trim_end_matches('/');
        Ok(Url::parse(&format!("{base}/meetings/{action}"))?)
    }

    async fn post(&self, action: &str, code: &str) -> Result<(), DirectoryError> {
        let mut request = self
            .http
            .post(self.endpoint(action)?)
            .json(&MeetingCodeBody { code });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            tracing::debug!("meeting {} {} acknowledged", code, action);
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(DirectoryError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl MeetingDirectory for HttpDirectory {
    async fn join_meeting(&self, code: &RoomCode) -> Result<(), DirectoryError> {
        self.post("join", code).await
    }

    async fn leave_meeting(&self, code: &RoomCode) -> Result<(), DirectoryError> {
        self.post("leave", code).await
    }
}
