// Wire protocols: daemon JSON-RPC and agent runtime event stream.

pub mod events;
pub mod jsonrpc;
pub mod rpc_methods;
