//! Command-line and environment configuration for embedders.

use std::time::Duration;

use clap::Parser;
use swim_messages::Node;

use crate::engine::{SwimSettings, Unreachability};
use crate::shell::ShellConfig;

#[derive(Parser, Debug, Clone)]
pub struct ShellArgs {
    /// Identity of the local node: `host:port` or `host:port#uid`
    #[arg(long, env = "SWIM_NODE")]
    pub node: Node,

    /// Cluster nodes contacted on startup
    #[arg(long, env = "SWIM_CONTACT_POINTS", value_delimiter = ',')]
    pub contact_points: Vec<Node>,

    /// Escalate timed-out suspects to `unreachable` instead of `dead`
    #[arg(long, env = "SWIM_UNREACHABILITY")]
    pub unreachability: bool,

    /// Do not run periodic protocol pings (drive them externally)
    #[arg(long, env = "SWIM_NO_PERIODIC_PINGS")]
    pub no_periodic_pings: bool,

    /// Seconds to wait before re-probing an unresponsive contact point
    #[arg(long, env = "SWIM_CONTACT_RETRY_SECS", default_value_t = 5)]
    pub contact_retry_secs: u64,

    /// Give up probing a contact point after this many attempts
    #[arg(long, env = "SWIM_CONTACT_MAX_ATTEMPTS")]
    pub contact_max_attempts: Option<u32>,
}

impl ShellArgs {
    pub fn shell_config(&self) -> ShellConfig {
        let mut config = ShellConfig::new(self.node.clone());
        config.initial_contact_points = self.contact_points.clone();
        config.start_periodic_pings = !self.no_periodic_pings;
        config.monitor_retry_interval = Duration::from_secs(self.contact_retry_secs);
        config.monitor_max_attempts = self.contact_max_attempts;
        config
    }

    /// Settings destined for the engine the shell will drive.
    pub fn swim_settings(&self) -> SwimSettings {
        SwimSettings {
            unreachability: if self.unreachability {
                Unreachability::Enabled
            } else {
                Unreachability::Disabled
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_argument_set() {
        let args = ShellArgs::parse_from([
            "swim",
            "--node",
            "10.0.0.1:7001#42",
            "--contact-points",
            "10.0.0.2:7001,10.0.0.3:7001#7",
            "--unreachability",
            "--contact-retry-secs",
            "2",
            "--contact-max-attempts",
            "3",
        ]);

        let config = args.shell_config();
        assert_eq!(config.local_node, "10.0.0.1:7001#42".parse().unwrap());
        assert_eq!(
            config.initial_contact_points,
            vec![
                "10.0.0.2:7001".parse().unwrap(),
                "10.0.0.3:7001#7".parse().unwrap()
            ]
        );
        assert!(config.start_periodic_pings);
        assert_eq!(config.monitor_retry_interval, Duration::from_secs(2));
        assert_eq!(config.monitor_max_attempts, Some(3));
        assert!(args.swim_settings().unreachability.is_enabled());
    }

    #[test]
    fn defaults_keep_retrying_forever() {
        let args = ShellArgs::parse_from(["swim", "--node", "10.0.0.1:7001"]);
        let config = args.shell_config();
        assert_eq!(config.monitor_retry_interval, Duration::from_secs(5));
        assert_eq!(config.monitor_max_attempts, None);
        assert!(!args.swim_settings().unreachability.is_enabled());
    }
}
