// Opening one server-push connection to an agent runtime.

use std::time::Duration;

use berth_common::protocol::events::RoutedEvent;
use berth_common::types::SessionId;
use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream};
use futures_util::{FutureExt, StreamExt};
use reqwest::header::{HeaderValue, ACCEPT};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::backend::runtime_url;
use crate::stream::sse::SseParser;

/// Where a subscription currently points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTarget {
    pub session_id: SessionId,
    pub port: u16,
    /// Identity of the process behind `port`; a change forces a full reconnect.
    pub backend_id: Uuid,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("failed to connect to event stream: {0}")]
    Connect(String),
    #[error("event stream answered with status {0}")]
    Status(u16),
    #[error("event stream read failed: {0}")]
    Read(String),
}

pub type EventStream = BoxStream<'static, Result<RoutedEvent, StreamError>>;

pub trait StreamConnector: Send + Sync + 'static {
    /// Open the stream. The runtime replays its `init` snapshot first, then
    /// every event after `last_event_id` when one is given.
    fn connect(
        &self,
        target: &StreamTarget,
        last_event_id: Option<&str>,
    ) -> BoxFuture<'static, Result<EventStream, StreamError>>;
}

/// `GET /api/session/events?session_id=...` with `Last-Event-ID` on reconnect.
pub struct HttpStreamConnector {
    client: reqwest::Client,
}

impl Default for HttpStreamConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpStreamConnector {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

impl StreamConnector for HttpStreamConnector {
    fn connect(
        &self,
        target: &StreamTarget,
        last_event_id: Option<&str>,
    ) -> BoxFuture<'static, Result<EventStream, StreamError>> {
        let url = match runtime_url(target.port, "/api/session/events") {
            Ok(url) => url,
            Err(e) => return futures_util::future::ready(Err(StreamError::Connect(e.to_string()))).boxed(),
        };
        let mut request = self
            .client
            .get(url)
            .query(&[("session_id", target.session_id.as_str())])
            .header(ACCEPT, HeaderValue::from_static("text/event-stream"));
        if let Some(id) = last_event_id.and_then(|id| HeaderValue::from_str(id).ok()) {
            request = request.header("Last-Event-ID", id);
        }
        let session_id = target.session_id.clone();

        async move {
            let response = request.send().await.map_err(|e| StreamError::Connect(e.to_string()))?;
            if !response.status().is_success() {
                return Err(StreamError::Status(response.status().as_u16()));
            }
            debug!(session_id = %session_id, "event stream connected");

            let body = Box::pin(response.bytes_stream());
            let events = stream::unfold(
                (body, SseParser::new(), std::collections::VecDeque::new()),
                |(mut body, mut parser, mut ready)| async move {
                    loop {
                        if let Some(event) = ready.pop_front() {
                            return Some((Ok(event), (body, parser, ready)));
                        }
                        match body.next().await {
                            Some(Ok(chunk)) => {
                                ready.extend(parser.push(&chunk).into_iter().map(|e| e.into_routed()));
                            }
                            Some(Err(error)) => {
                                return Some((
                                    Err(StreamError::Read(error.to_string())),
                                    (body, parser, ready),
                                ));
                            }
                            None => return None,
                        }
                    }
                },
            );
            Ok(events.boxed())
        }
        .boxed()
    }
}
