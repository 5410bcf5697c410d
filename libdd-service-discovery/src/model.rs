// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Services reported by the system-probe and discovery results.

use crate::error::DiscoveryError;
use std::time::SystemTime;

/// A process with open ports, as reported by the system-probe
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Service {
    pub pid: i32,
    pub name: String,
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServicesResponse {
    pub services: Vec<Service>,
}

/// A discovered service and its process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub pid: i32,
    pub name: String,
    pub ports: Vec<u16>,
    /// Start time of the process in seconds since epoch
    pub start_time: u64,
    pub last_heartbeat: SystemTime,
}

/// Events emitted by a discovery cycle, each sorted by pid
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceEvents {
    pub start: Vec<ServiceInfo>,
    pub heartbeat: Vec<ServiceInfo>,
    pub stop: Vec<ServiceInfo>,
}

impl ServiceEvents {
    pub fn is_empty(&self) -> bool {
        self.start.is_empty() && self.heartbeat.is_empty() && self.stop.is_empty()
    }
}

/// Outcome of a discovery cycle
#[derive(Debug, Default)]
pub struct DiscoveredServices {
    pub alive_procs_count: usize,
    /// Pids of the ignored processes, sorted
    pub ignored_pids: Vec<i32>,
    /// Services waiting for the next cycle to be confirmed, sorted by pid
    pub potential: Vec<ServiceInfo>,
    /// Running services, sorted by pid
    pub running: Vec<ServiceInfo>,
    pub events: ServiceEvents,
    /// Failures on single processes, which are ignored until they die
    pub process_errors: Vec<DiscoveryError>,
}
