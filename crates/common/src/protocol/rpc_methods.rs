// RPC method name constants, mirrored in contracts/jsonrpc-methods.json.

// ── Daemon-internal ────────────────────────────────────────────────
pub const RPC_PING: &str = "rpc.ping";
pub const DAEMON_SHUTDOWN: &str = "daemon.shutdown";
pub const DAEMON_STATUS: &str = "daemon.status";

// ── Session ────────────────────────────────────────────────────────
pub const SESSION_OPEN: &str = "session.open";
pub const SESSION_RELEASE: &str = "session.release";
pub const SESSION_ACTIVATION: &str = "session.activation";
pub const SESSION_REKEY: &str = "session.rekey";
pub const SESSION_ADOPT: &str = "session.adopt";
pub const SESSION_SWITCH: &str = "session.switch";

// ── Scheduled tasks ────────────────────────────────────────────────
pub const TASK_CREATE: &str = "task.create";
pub const TASK_LIST: &str = "task.list";
pub const TASK_START: &str = "task.start";
pub const TASK_PAUSE: &str = "task.pause";
pub const TASK_RESUME: &str = "task.resume";
pub const TASK_STOP: &str = "task.stop";

/// All methods the daemon currently dispatches.
pub const IMPLEMENTED_METHODS: &[&str] = &[
    RPC_PING,
    DAEMON_SHUTDOWN,
    DAEMON_STATUS,
    SESSION_OPEN,
    SESSION_RELEASE,
    SESSION_ACTIVATION,
    SESSION_REKEY,
    SESSION_ADOPT,
    SESSION_SWITCH,
    TASK_CREATE,
    TASK_LIST,
    TASK_START,
    TASK_PAUSE,
    TASK_RESUME,
    TASK_STOP,
];

/// Methods acknowledged in the contract as planned but not yet implemented.
pub const PLANNED_METHODS: &[&str] = &["task.delete", "session.list"];

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use serde_json::Value;

    use super::*;

    const CONTRACT: &str = include_str!("../../../../contracts/jsonrpc-methods.json");

    fn contract_list(contract: &Value, field: &str) -> BTreeSet<String> {
        contract[field]
            .as_array()
            .unwrap_or_else(|| panic!("contract should list {field}"))
            .iter()
            .map(|name| name.as_str().expect("method names are strings").to_string())
            .collect()
    }

    #[test]
    fn constants_match_contract_file() {
        let contract: Value = serde_json::from_str(CONTRACT).expect("contract should parse");
        let implemented: BTreeSet<String> =
            IMPLEMENTED_METHODS.iter().map(|name| name.to_string()).collect();
        let planned: BTreeSet<String> = PLANNED_METHODS.iter().map(|name| name.to_string()).collect();

        assert_eq!(contract_list(&contract, "implemented_methods"), implemented);
        assert_eq!(contract_list(&contract, "planned_methods"), planned);
        assert!(implemented.is_disjoint(&planned));

        let versions: Vec<&str> = contract["rpc_protocol_versions"]
            .as_array()
            .expect("contract should list protocol versions")
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert_eq!(versions, crate::protocol::jsonrpc::SUPPORTED_PROTOCOL_VERSIONS);
    }

    #[test]
    fn method_names_are_namespaced() {
        for name in IMPLEMENTED_METHODS.iter().chain(PLANNED_METHODS) {
            let (namespace, method) = name.split_once('.').expect("method should be namespaced");
            assert!(!namespace.is_empty() && !method.is_empty(), "bad method name {name}");
        }
    }
}
