// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;

/// Code of a discovery failure, used to tag telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Procfs,
    SystemProbeConn,
    SystemProbeServices,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Procfs => "procfs",
            ErrorCode::SystemProbeConn => "system_probe_conn",
            ErrorCode::SystemProbeServices => "system_probe_services",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of the system-probe client
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SystemProbeError {
    #[error("unable to connect to the system-probe: {0}")]
    Connection(String),
    #[error("system-probe request failed: {0}")]
    Request(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("failed to read the process table: {0}")]
    Procfs(#[source] io::Error),
    #[error("[pid: {pid}] failed to read /proc/{{pid}}/stat: {source}")]
    ProcessStat {
        pid: i32,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    SystemProbe(#[from] SystemProbeError),
}

impl DiscoveryError {
    pub fn code(&self) -> ErrorCode {
        match self {
            DiscoveryError::Procfs(_) | DiscoveryError::ProcessStat { .. } => ErrorCode::Procfs,
            DiscoveryError::SystemProbe(SystemProbeError::Connection(_)) => {
                ErrorCode::SystemProbeConn
            }
            DiscoveryError::SystemProbe(SystemProbeError::Request(_)) => {
                ErrorCode::SystemProbeServices
            }
        }
    }
}
