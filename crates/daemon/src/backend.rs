// HTTP control surface of an agent runtime.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use berth_common::protocol::events::GenerationPhase;
use berth_common::types::SessionId;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

/// Control calls the hub makes against a running agent runtime.
pub trait AgentBackend: Send + Sync + 'static {
    fn generation_state(&self, port: u16, session_id: &SessionId) -> BoxFuture<'static, Result<GenerationPhase>>;

    fn stop_generation(&self, port: u16, session_id: &SessionId) -> BoxFuture<'static, Result<()>>;

    /// Ask the runtime to continue as `to` instead of its current session.
    fn switch_session(&self, port: u16, to: &SessionId) -> BoxFuture<'static, Result<()>>;

    fn start_generation(
        &self,
        port: u16,
        session_id: &SessionId,
        prompt: &str,
    ) -> BoxFuture<'static, Result<()>>;

    /// Graceful close notification. Best effort; callers never wait on it
    /// before releasing local state.
    fn notify_closed(&self, port: u16, session_id: &SessionId) -> BoxFuture<'static, Result<()>>;
}

#[derive(Debug, Deserialize)]
struct SessionState {
    #[serde(default)]
    generating: bool,
}

pub struct HttpAgentBackend {
    client: reqwest::Client,
}

impl Default for HttpAgentBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpAgentBackend {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    fn post(&self, port: u16, path: &'static str, body: Value) -> BoxFuture<'static, Result<()>> {
        let url = runtime_url(port, path);
        let client = self.client.clone();
        async move {
            let request = client.post(url.with_context(|| format!("bad runtime url {path}"))?).json(&body);
            let response = request.send().await.with_context(|| format!("POST {path} failed"))?;
            if !response.status().is_success() {
                bail!("POST {path} answered {}", response.status());
            }
            Ok(())
        }
        .boxed()
    }
}

/// Address of `path` on the agent runtime listening on loopback `port`.
pub fn runtime_url(port: u16, path: &str) -> Result<Url, url::ParseError> {
    Url::parse(&format!("http://127.0.0.1:{port}/"))?.join(path.trim_start_matches('/'))
}

impl AgentBackend for HttpAgentBackend {
    fn generation_state(&self, port: u16, session_id: &SessionId) -> BoxFuture<'static, Result<GenerationPhase>> {
        let url = runtime_url(port, "/api/session/state");
        let client = self.client.clone();
        let session_id = session_id.clone();
        async move {
            let request = client.get(url?).query(&[("session_id", session_id.as_str())]);
            let response = request.send().await.context("GET /api/session/state failed")?;
            if !response.status().is_success() {
                bail!("GET /api/session/state answered {}", response.status());
            }
            let state: SessionState =
                response.json().await.context("invalid /api/session/state body")?;
            Ok(if state.generating { GenerationPhase::Generating } else { GenerationPhase::Idle })
        }
        .boxed()
    }

    fn stop_generation(&self, port: u16, session_id: &SessionId) -> BoxFuture<'static, Result<()>> {
        self.post(port, "/api/generation/stop", json!({ "session_id": session_id }))
    }

    fn switch_session(&self, port: u16, to: &SessionId) -> BoxFuture<'static, Result<()>> {
        self.post(port, "/api/session/switch", json!({ "session_id": to }))
    }

    fn start_generation(
        &self,
        port: u16,
        session_id: &SessionId,
        prompt: &str,
    ) -> BoxFuture<'static, Result<()>> {
        self.post(
            port,
            "/api/generation/start",
            json!({ "session_id": session_id, "prompt": prompt }),
        )
    }

    fn notify_closed(&self, port: u16, session_id: &SessionId) -> BoxFuture<'static, Result<()>> {
        self.post(port, "/api/session/close", json!({ "session_id": session_id }))
    }
}
