// berth-daemon library entry point.

pub mod activation;
pub mod backend;
pub mod config;
pub mod error;
pub mod guardian;
pub mod hub;
pub mod migrate;
pub mod ownership;
pub mod process;
pub mod recovery;
pub mod rpc;
pub mod runtime;
pub mod scheduler;
pub mod startup;
pub mod store;
pub mod stream;

#[cfg(any(test, feature = "test-helpers"))]
pub mod testing;
