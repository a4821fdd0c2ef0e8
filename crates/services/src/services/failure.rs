use serde::Serialize;
use strum_macros::Display;

/// Coarse failure buckets for dashboards. Classification is a substring
/// heuristic over the error text and never changes runtime behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureCategory {
    Database,
    Network,
    Auth,
    Concurrency,
    Resources,
    Configuration,
    Assertion,
    Other,
}

pub fn classify(message: &str) -> FailureCategory {
    let msg = message.to_lowercase();

    let any = |needles: &[&str]| needles.iter().any(|n| msg.contains(n));

    if any(&["sql", "database", "constraint", "no such table", "migration"]) {
        FailureCategory::Database
    } else if any(&["connection refused", "timed out", "timeout", "dns", "network", "broken pipe", "reset by peer"]) {
        FailureCategory::Network
    } else if any(&["unauthorized", "forbidden", "401", "403", "token", "credential", "permission denied"]) {
        FailureCategory::Auth
    } else if any(&["deadlock", "lock", "conflict", "concurrent", "already active", "busy"]) {
        FailureCategory::Concurrency
    } else if any(&["out of memory", "oom", "disk full", "no space", "resource", "too many open files"]) {
        FailureCategory::Resources
    } else if any(&["config", "invalid value", "missing required", "not found on path"]) {
        FailureCategory::Configuration
    } else if any(&["assert", "panic", "unreachable", "invariant"]) {
        FailureCategory::Assertion
    } else {
        FailureCategory::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_match_substrings() {
        assert_eq!(classify("UNIQUE constraint failed: tasks.title"), FailureCategory::Database);
        assert_eq!(classify("connection refused (os error 111)"), FailureCategory::Network);
        assert_eq!(classify("401 Unauthorized from provider"), FailureCategory::Auth);
        assert_eq!(classify("database is locked"), FailureCategory::Database);
        assert_eq!(classify("deadlock detected"), FailureCategory::Concurrency);
        assert_eq!(classify("child killed: out of memory"), FailureCategory::Resources);
        assert_eq!(classify("invalid value for AUTODEV_DB_PORT"), FailureCategory::Configuration);
        assert_eq!(classify("thread panicked at 'boom'"), FailureCategory::Assertion);
        assert_eq!(classify("something completely else"), FailureCategory::Other);
    }
}
