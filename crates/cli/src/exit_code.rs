// Process exit codes of the berth CLI.
//
//   0  = success
//   1  = general error
//   2  = usage/argument error
//   10 = daemon not reachable
//   12 = conflict (session open elsewhere, rekey target taken)

use std::io;
use std::process;

use crate::client::{DaemonUnavailable, RpcError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitCode {
    Success = 0,
    Error = 1,
    Usage = 2,
    DaemonDown = 10,
    Conflict = 12,
}

impl ExitCode {
    /// The first recognizable cause in the chain decides.
    pub fn from_error(error: &anyhow::Error) -> Self {
        error
            .chain()
            .find_map(|cause| {
                if let Some(rpc) = cause.downcast_ref::<RpcError>() {
                    Some(Self::from_rpc_code(&rpc.code))
                } else if cause.is::<DaemonUnavailable>() {
                    Some(Self::DaemonDown)
                } else {
                    cause.downcast_ref::<io::Error>().map(|io_error| match io_error.kind() {
                        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => Self::DaemonDown,
                        _ => Self::Error,
                    })
                }
            })
            .unwrap_or(Self::Error)
    }

    pub fn from_rpc_code(code: &str) -> Self {
        match code {
            "SINGLETON_CONFLICT" | "MIGRATION_CONFLICT" => Self::Conflict,
            "INVALID_REQUEST" | "INVALID_PARAMS" | "METHOD_NOT_FOUND" | "UNSUPPORTED_PROTOCOL" => {
                Self::Usage
            }
            _ => Self::Error,
        }
    }
}

impl From<ExitCode> for process::ExitCode {
    fn from(code: ExitCode) -> Self {
        process::ExitCode::from(code as u8)
    }
}
