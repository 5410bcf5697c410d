// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tracking of the services across discovery cycles.
//!
//! A process with open ports is first a *potential* service. If it's still alive on the next
//! cycle it becomes a *running* service and a start event is emitted. Running services emit a
//! heartbeat every heartbeat interval and a stop event once their process is gone. Processes
//! which can't be inspected or are on the ignore list are skipped until they die.

use crate::config::DiscoveryConfig;
use crate::error::DiscoveryError;
use crate::model::{DiscoveredServices, Service, ServiceEvents, ServiceInfo};
use crate::system::{Clock, Process, ProcessTable, SystemClock, SystemProbeClient};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, SystemTime};
use tracing::{debug, error};

/// Clock ticks per second used by `/proc/<pid>/stat`
const CLOCK_TICKS_PER_SEC: u64 = 100;

/// Truncate a duration to whole minutes
fn truncate_to_minutes(d: Duration) -> Duration {
    Duration::from_secs(d.as_secs() / 60 * 60)
}

pub struct ServiceDiscovery<T, S, C = SystemClock> {
    config: DiscoveryConfig,
    process_table: T,
    system_probe: S,
    clock: C,
    boot_time: u64,

    ignored_pids: HashSet<i32>,
    alive_services: HashMap<i32, ServiceInfo>,
    potential_services: HashMap<i32, ServiceInfo>,
}

impl<T, S> ServiceDiscovery<T, S, SystemClock>
where
    T: ProcessTable,
    S: SystemProbeClient,
{
    /// Create a discovery using the system clock.
    ///
    /// # Errors
    /// Fails if the boot time can't be read from the process table.
    pub fn new(
        config: DiscoveryConfig,
        process_table: T,
        system_probe: S,
    ) -> Result<Self, DiscoveryError> {
        Self::with_clock(config, process_table, system_probe, SystemClock)
    }
}

impl<T, S, C> ServiceDiscovery<T, S, C>
where
    T: ProcessTable,
    S: SystemProbeClient,
    C: Clock,
{
    pub fn with_clock(
        config: DiscoveryConfig,
        process_table: T,
        system_probe: S,
        clock: C,
    ) -> Result<Self, DiscoveryError> {
        let boot_time = process_table
            .boot_time()
            .map_err(DiscoveryError::Procfs)?;
        Ok(ServiceDiscovery {
            config,
            process_table,
            system_probe,
            clock,
            boot_time,
            ignored_pids: HashSet::new(),
            alive_services: HashMap::new(),
            potential_services: HashMap::new(),
        })
    }

    /// Run a discovery cycle.
    ///
    /// # Errors
    /// Fails without changing the tracked services if the process table can't be read or if the
    /// system-probe can't be queried. The next cycle retries.
    pub fn discover_services(&mut self) -> Result<DiscoveredServices, DiscoveryError> {
        let procs: HashMap<i32, T::Process> = self
            .process_table
            .all_procs()
            .map_err(DiscoveryError::Procfs)?
            .into_iter()
            .map(|p| (p.pid(), p))
            .collect();
        let response = self.system_probe.get_discovery_services()?;

        let now = self.clock.now();
        let mut events = ServiceEvents::default();
        let mut process_errors = Vec::new();

        // Potential services still alive are confirmed
        for (pid, mut svc) in self.potential_services.drain() {
            if procs.contains_key(&pid) {
                svc.last_heartbeat = now;
                events.start.push(svc.clone());
                self.alive_services.insert(pid, svc);
            }
        }

        // New processes with open ports are confirmed on the next cycle
        for service in response.services {
            let pid = service.pid;
            if self.ignored_pids.contains(&pid) || self.alive_services.contains_key(&pid) {
                continue;
            }
            debug!(pid, "Found new process with open ports");
            let Some(process) = procs.get(&pid) else {
                debug!(pid, "Process with open ports was not found in alive procs");
                continue;
            };
            let svc = match self.service_info(process, service, now) {
                Ok(svc) => svc,
                Err(err) => {
                    error!(pid, %err, "Failed to get process info");
                    process_errors.push(err);
                    self.ignored_pids.insert(pid);
                    continue;
                }
            };
            if self.config.is_ignored(&svc.name) {
                debug!(pid, name = %svc.name, "Process ignored from config");
                self.ignored_pids.insert(pid);
                continue;
            }
            debug!(pid, name = %svc.name, "Adding process to potential services");
            self.potential_services.insert(pid, svc);
        }

        // Running services are stopped or keep beating
        let heartbeat_interval = self.config.heartbeat_interval;
        self.alive_services.retain(|pid, svc| {
            if !procs.contains_key(pid) {
                events.stop.push(svc.clone());
                return false;
            }
            let elapsed = now
                .duration_since(svc.last_heartbeat)
                .unwrap_or(Duration::ZERO);
            if truncate_to_minutes(elapsed) >= heartbeat_interval {
                svc.last_heartbeat = now;
                events.heartbeat.push(svc.clone());
            }
            true
        });

        self.ignored_pids.retain(|pid| procs.contains_key(pid));

        events.start.sort_by_key(|s| s.pid);
        events.heartbeat.sort_by_key(|s| s.pid);
        events.stop.sort_by_key(|s| s.pid);
        Ok(DiscoveredServices {
            alive_procs_count: procs.len(),
            ignored_pids: sorted_pids(&self.ignored_pids),
            potential: sorted_services(&self.potential_services),
            running: sorted_services(&self.alive_services),
            events,
            process_errors,
        })
    }

    fn service_info(
        &self,
        process: &T::Process,
        service: Service,
        now: SystemTime,
    ) -> Result<ServiceInfo, DiscoveryError> {
        let pid = process.pid();
        let stat = process
            .stat()
            .map_err(|source| DiscoveryError::ProcessStat { pid, source })?;
        Ok(ServiceInfo {
            pid,
            name: service.name,
            ports: service.ports,
            start_time: self.boot_time + stat.start_time_ticks / CLOCK_TICKS_PER_SEC,
            last_heartbeat: now,
        })
    }
}

fn sorted_pids(pids: &HashSet<i32>) -> Vec<i32> {
    let mut pids: Vec<i32> = pids.iter().copied().collect();
    pids.sort_unstable();
    pids
}

fn sorted_services(services: &HashMap<i32, ServiceInfo>) -> Vec<ServiceInfo> {
    let mut services: Vec<ServiceInfo> = services.values().cloned().collect();
    services.sort_by_key(|s| s.pid);
    services
}
