// Per-owner event streams from agent runtimes: SSE decoding, reconnect policy,
// the HTTP connector and the router that owns subscriptions.

pub mod backoff;
pub mod connector;
pub mod router;
pub mod sse;
