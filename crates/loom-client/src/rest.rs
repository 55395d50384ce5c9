//! Thin REST client for session management and history paging.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use loom_core::{Event, PromptId, SessionId, SubmitDisposition};

use crate::error::{ClientError, Result};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub workspace_ref: String,
    #[serde(default)]
    pub title: Option<String>,
    pub status: String,
    pub last_seq: u64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct EnqueueResult {
    pub prompt_id: PromptId,
    pub disposition: SubmitDisposition,
    #[serde(default)]
    pub position: Option<u32>,
}

/// Paging cursor for [`RestClient::events`].
#[derive(Clone, Copy, Debug, Default)]
pub enum HistoryCursor {
    #[default]
    Start,
    Since(u64),
    Before(u64),
}

#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base: String,
}

impl RestClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: server_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn health(&self) -> Result<serde_json::Value> {
        let resp = self.http.get(format!("{}/health", self.base)).send().await?;
        decode(resp).await
    }

    pub async fn create_session(&self, workspace_ref: &str, title: Option<&str>) -> Result<SessionSummary> {
        let resp = self
            .http
            .post(self.url("/sessions"))
            .json(&json!({"workspace_ref": workspace_ref, "title": title}))
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn list_sessions(&self, include_archived: bool) -> Result<Vec<SessionSummary>> {
        let resp = self
            .http
            .get(self.url("/sessions"))
            .query(&[("include_archived", include_archived)])
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn archive_session(&self, id: &SessionId) -> Result<SessionSummary> {
        let resp = self.http.post(self.url(&format!("/sessions/{id}/archive"))).send().await?;
        decode(resp).await
    }

    pub async fn delete_session(&self, id: &SessionId) -> Result<()> {
        let resp = self.http.delete(self.url(&format!("/sessions/{id}"))).send().await?;
        check(resp).await.map(|_| ())
    }

    pub async fn events(&self, id: &SessionId, cursor: HistoryCursor, limit: u32) -> Result<Vec<Event>> {
        let mut query = vec![("limit", limit.to_string())];
        match cursor {
            HistoryCursor::Start => {}
            HistoryCursor::Since(seq) => query.push(("since_seq", seq.to_string())),
            HistoryCursor::Before(seq) => query.push(("before_seq", seq.to_string())),
        }
        let resp = self
            .http
            .get(self.url(&format!("/sessions/{id}/events")))
            .query(&query)
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn enqueue(&self, id: &SessionId, text: &str, prompt_id: Option<&PromptId>) -> Result<EnqueueResult> {
        let resp = self
            .http
            .post(self.url(&format!("/sessions/{id}/queue")))
            .json(&json!({"text": text, "prompt_id": prompt_id}))
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn cancel(&self, id: &SessionId) -> Result<bool> {
        let resp = self.http.post(self.url(&format!("/sessions/{id}/cancel"))).send().await?;
        let body: serde_json::Value = decode(resp).await?;
        Ok(body["cancelled"].as_bool().unwrap_or(false))
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{path}", self.base)
    }
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body: serde_json::Value = resp.json().await.unwrap_or_default();
    let message = body["message"].as_str().unwrap_or_default().to_string();
    if status.as_u16() == 404 {
        return Err(ClientError::NotFound(message));
    }
    Err(ClientError::Http {
        status: status.as_u16(),
        code: body["code"].as_str().unwrap_or_default().to_string(),
        message,
    })
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    Ok(check(resp).await?.json().await?)
}
