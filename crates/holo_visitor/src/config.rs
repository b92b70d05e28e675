//! Coordinator-side visitor tuning.

use serde::{Deserialize, Serialize};

pub const MAX_VISITORS_PER_NODE_ENV: &str = "HOLO_VISIT_MAX_VISITORS_PER_NODE";
pub const MIN_SHARDS_PER_COMMAND_ENV: &str = "HOLO_VISIT_MIN_SHARDS_PER_COMMAND";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitorConfig {
    /// Commands one client visit may have outstanding on a single node.
    #[serde(default = "default_max_visitors_per_node")]
    pub max_visitors_per_node_per_client_visitor: u32,
    /// A node's shards are only split over several commands when each gets at
    /// least this many.
    #[serde(default = "default_min_shards_per_command")]
    pub min_shards_per_command: u32,
}

fn default_max_visitors_per_node() -> u32 {
    4
}

fn default_min_shards_per_command() -> u32 {
    5
}

impl Default for VisitorConfig {
    fn default() -> Self {
        Self {
            max_visitors_per_node_per_client_visitor: default_max_visitors_per_node(),
            min_shards_per_command: default_min_shards_per_command(),
        }
    }
}

impl VisitorConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.max_visitors_per_node_per_client_visitor >= 1,
            "max_visitors_per_node_per_client_visitor must be >= 1"
        );
        anyhow::ensure!(
            self.min_shards_per_command >= 1,
            "min_shards_per_command must be >= 1"
        );
        Ok(())
    }

    /// Apply `HOLO_VISIT_*` environment overrides on top of `self`.
    ///
    /// Unset variables keep the current value; values that are not positive
    /// integers are ignored with a warning.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(value) = parse_positive(&lookup, MAX_VISITORS_PER_NODE_ENV) {
            self.max_visitors_per_node_per_client_visitor = value;
        }
        if let Some(value) = parse_positive(&lookup, MIN_SHARDS_PER_COMMAND_ENV) {
            self.min_shards_per_command = value;
        }
        self
    }
}

fn parse_positive(lookup: &impl Fn(&str) -> Option<String>, var_name: &str) -> Option<u32> {
    let raw = lookup(var_name)?;
    match raw.trim().parse::<u32>() {
        Ok(value) if value > 0 => Some(value),
        _ => {
            tracing::warn!(env = var_name, value = %raw, "ignoring invalid visitor config override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = VisitorConfig::default();
        assert_eq!(cfg.max_visitors_per_node_per_client_visitor, 4);
        assert_eq!(cfg.min_shards_per_command, 5);
        cfg.validate().unwrap();
    }

    #[test]
    fn missing_fields_take_defaults() {
        let cfg: VisitorConfig = serde_json::from_str(r#"{"min_shards_per_command": 2}"#).unwrap();
        assert_eq!(cfg.max_visitors_per_node_per_client_visitor, 4);
        assert_eq!(cfg.min_shards_per_command, 2);
    }

    #[test]
    fn zero_limits_are_rejected() {
        let cfg = VisitorConfig {
            max_visitors_per_node_per_client_visitor: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = VisitorConfig {
            min_shards_per_command: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn overrides_apply_only_positive_values() {
        let cfg = VisitorConfig::default().with_overrides(|name| match name {
            MAX_VISITORS_PER_NODE_ENV => Some("9".to_string()),
            MIN_SHARDS_PER_COMMAND_ENV => Some("0".to_string()),
            _ => None,
        });
        assert_eq!(cfg.max_visitors_per_node_per_client_visitor, 9);
        assert_eq!(cfg.min_shards_per_command, 5);
    }
}
