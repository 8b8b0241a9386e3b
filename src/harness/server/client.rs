//! HTTP client for the shared agent server.

use anyhow::Context;
use serde::Deserialize;
use serde_json::{json, Map, Value};

#[derive(Debug, Clone)]
pub struct ServerClient {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
pub struct RemoteSession {
    pub id: String,
}

/// Body of a prompt request.
#[derive(Debug, Default)]
pub struct PromptRequest<'a> {
    pub text: &'a str,
    pub model: Option<&'a str>,
    pub system: Option<&'a str>,
    pub disabled_tools: &'a [String],
}

impl ServerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str, directory: &str) -> String {
        let mut url = format!("{}{}", self.base_url, path);
        if !directory.is_empty() {
            url.push_str("?directory=");
            url.push_str(&urlencoding::encode(directory));
        }
        url
    }

    /// Whether the server answers HTTP at all.
    pub async fn ping(&self) -> bool {
        self.client
            .get(format!("{}/config", self.base_url))
            .send()
            .await
            .is_ok()
    }

    /// Request for the SSE event feed scoped to `directory`.
    pub fn events_request(&self, directory: &str) -> reqwest::RequestBuilder {
        self.client
            .get(self.url("/event", directory))
            .header("accept", "text/event-stream")
    }

    pub async fn create_session(
        &self,
        directory: &str,
        title: Option<&str>,
    ) -> anyhow::Result<RemoteSession> {
        let mut body = Map::new();
        if let Some(t) = title {
            body.insert("title".to_string(), json!(t));
        }

        let resp = self
            .client
            .post(self.url("/session", directory))
            .json(&body)
            .send()
            .await
            .context("Failed to call /session")?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("Session create failed: {} - {}", status, text);
        }

        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse session response: {}", text))
    }

    /// Queue a prompt; progress arrives on the event feed.
    pub async fn prompt_async(
        &self,
        session_id: &str,
        directory: &str,
        request: PromptRequest<'_>,
    ) -> anyhow::Result<()> {
        let mut body = Map::new();
        body.insert(
            "parts".to_string(),
            json!([{ "type": "text", "text": request.text }]),
        );
        if let Some((provider_id, model_id)) = request.model.and_then(split_model) {
            body.insert(
                "model".to_string(),
                json!({ "providerID": provider_id, "modelID": model_id }),
            );
        }
        if let Some(system) = request.system {
            body.insert("system".to_string(), json!(system));
        }
        if !request.disabled_tools.is_empty() {
            let tools: Map<String, Value> = request
                .disabled_tools
                .iter()
                .map(|name| (name.clone(), Value::Bool(false)))
                .collect();
            body.insert("tools".to_string(), Value::Object(tools));
        }

        let resp = self
            .client
            .post(self.url(&format!("/session/{}/prompt_async", session_id), directory))
            .json(&body)
            .send()
            .await
            .context("Failed to call /session/{id}/prompt_async")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("Prompt failed: {} - {}", status, text);
        }
        Ok(())
    }

    pub async fn approve_permission(
        &self,
        session_id: &str,
        permission_id: &str,
        directory: &str,
    ) -> anyhow::Result<()> {
        let resp = self
            .client
            .post(self.url(
                &format!("/session/{}/permissions/{}", session_id, permission_id),
                directory,
            ))
            .json(&json!({ "response": "once" }))
            .send()
            .await
            .context("Failed to answer permission request")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("Permission reply failed: {} - {}", status, text);
        }
        Ok(())
    }

    pub async fn delete_session(&self, session_id: &str, directory: &str) -> anyhow::Result<()> {
        let resp = self
            .client
            .delete(self.url(&format!("/session/{}", session_id), directory))
            .send()
            .await
            .context("Failed to call DELETE /session/{id}")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("Session delete failed: {} - {}", status, text);
        }
        Ok(())
    }
}

/// `provider/model` into its two halves.
fn split_model(model: &str) -> Option<(String, String)> {
    let (provider, model_id) = model.trim().split_once('/')?;
    let (provider, model_id) = (provider.trim(), model_id.trim());
    if provider.is_empty() || model_id.is_empty() {
        None
    } else {
        Some((provider.to_string(), model_id.to_string()))
    }
}
