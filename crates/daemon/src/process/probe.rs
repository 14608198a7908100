// Readiness probing after spawn and during health sweeps.

use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::time::Instant;

use crate::backend::runtime_url;
use crate::process::host::ProcessHost;
use crate::process::registry::SpawnError;

pub trait ReadinessProbe: Send + Sync + 'static {
    /// One probe attempt against the process listening on `port`.
    fn probe(&self, port: u16) -> BoxFuture<'static, bool>;
}

/// `GET http://127.0.0.1:{port}{health_path}`, ready on any 2xx.
pub struct HttpReadinessProbe {
    client: reqwest::Client,
    health_path: String,
}

impl HttpReadinessProbe {
    pub fn new(health_path: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, health_path: health_path.into() }
    }
}

impl ReadinessProbe for HttpReadinessProbe {
    fn probe(&self, port: u16) -> BoxFuture<'static, bool> {
        let Ok(url) = runtime_url(port, &self.health_path) else {
            return futures_util::future::ready(false).boxed();
        };
        let request = self.client.get(url);
        async move {
            match request.send().await {
                Ok(response) => response.status().is_success(),
                Err(_) => false,
            }
        }
        .boxed()
    }
}

/// Poll until the probe succeeds, the process dies, or `timeout` elapses.
pub async fn wait_until_ready(
    probe: &dyn ReadinessProbe,
    host: &dyn ProcessHost,
    pid: u32,
    port: u16,
    timeout: Duration,
    interval: Duration,
) -> Result<(), SpawnError> {
    let deadline = Instant::now() + timeout;
    loop {
        if !host.is_alive(pid) {
            let code = host.wait_exit(pid).await;
            return Err(SpawnError::ExitedDuringStartup { pid, code });
        }
        if probe.probe(port).await {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(SpawnError::ReadinessTimeout { pid, timeout_ms: timeout.as_millis() as u64 });
        }
        tokio::time::sleep(interval).await;
    }
}
