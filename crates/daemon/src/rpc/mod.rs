// JSON-RPC server: method dispatch over the Unix socket plus an optional HTTP surface.

pub mod http;
pub mod methods;
pub mod unix;
