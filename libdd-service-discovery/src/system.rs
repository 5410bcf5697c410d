// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Interfaces to the host used by the discovery.

use crate::error::SystemProbeError;
use crate::model::ServicesResponse;
use std::io;
use std::time::SystemTime;

/// Fields of `/proc/<pid>/stat` used by the discovery
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcStat {
    /// Start time of the process in clock ticks since boot
    pub start_time_ticks: u64,
}

pub trait Process {
    fn pid(&self) -> i32;
    fn stat(&self) -> io::Result<ProcStat>;
}

/// The table of the processes alive on the host
pub trait ProcessTable {
    type Process: Process;

    fn all_procs(&self) -> io::Result<Vec<Self::Process>>;

    /// Boot time of the host in seconds since epoch
    fn boot_time(&self) -> io::Result<u64>;
}

/// Client of the system-probe discovery module
pub trait SystemProbeClient {
    fn get_discovery_services(&self) -> Result<ServicesResponse, SystemProbeError>;
}

pub trait Clock {
    fn now(&self) -> SystemTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}
