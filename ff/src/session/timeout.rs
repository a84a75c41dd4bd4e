//! Backend timeouts chosen by task type

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// The `timeouts` config section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutPolicy {
    /// Start-to-close timeout for one backend call
    #[serde(rename = "default-ms")]
    pub default_ms: u64,

    /// Overrides keyed by task type, e.g. `refactor: 3600000`
    #[serde(rename = "per-task-type")]
    pub per_task_type: BTreeMap<String, u64>,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            default_ms: 30 * 60 * 1000,
            per_task_type: BTreeMap::new(),
        }
    }
}

impl TimeoutPolicy {
    /// Timeout for a backend call; an explicit override wins over the task type
    pub fn backend_timeout(&self, task_type: Option<&str>, override_ms: Option<u64>) -> Duration {
        let ms = override_ms
            .or_else(|| task_type.and_then(|t| self.per_task_type.get(t).copied()))
            .unwrap_or(self.default_ms);
        debug!(?task_type, ?override_ms, ms, "TimeoutPolicy::backend_timeout: called");
        Duration::from_millis(ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_resolution_order() {
        let mut policy = TimeoutPolicy {
            default_ms: 1000,
            ..Default::default()
        };
        policy.per_task_type.insert("refactor".to_string(), 5000);

        assert_eq!(policy.backend_timeout(None, None), Duration::from_millis(1000));
        assert_eq!(policy.backend_timeout(Some("bugfix"), None), Duration::from_millis(1000));
        assert_eq!(policy.backend_timeout(Some("refactor"), None), Duration::from_millis(5000));
        assert_eq!(policy.backend_timeout(Some("refactor"), Some(200)), Duration::from_millis(200));
    }

    #[test]
    fn test_deserialize() {
        let yaml = r#"
default-ms: 60000
per-task-type:
  docs: 120000
"#;
        let policy: TimeoutPolicy = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(policy.default_ms, 60000);
        assert_eq!(policy.per_task_type["docs"], 120000);
    }
}
