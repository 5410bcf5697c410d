// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;
use std::time::Duration;

/// Processes never reported as services.
pub const DEFAULT_IGNORED_PROCESSES: &[&str] = &[
    "sshd",
    "dhclient",
    "systemd",
    "systemd-resolved",
    "systemd-networkd",
    "datadog-agent",
    "livenessprobe",
    // Ignored until docker containers are supported
    "docker-proxy",
];

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// Names of the processes to ignore
    pub ignored_processes: HashSet<String>,
    /// Minimum time between two heartbeats of a running service
    pub heartbeat_interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            ignored_processes: DEFAULT_IGNORED_PROCESSES
                .iter()
                .map(|p| p.to_string())
                .collect(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

impl DiscoveryConfig {
    /// Add processes to the ignore list
    pub fn with_ignored_processes<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignored_processes
            .extend(names.into_iter().map(Into::into));
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn is_ignored(&self, name: &str) -> bool {
        self.ignored_processes.contains(name)
    }
}
