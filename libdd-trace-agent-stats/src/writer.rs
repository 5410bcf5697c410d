// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Destination of the flushed stats payloads.

use crate::config::StatsConfig;
use crate::pb;
use tokio::sync::mpsc;
use tracing::warn;

/// Agent fields set on every written payload
#[derive(Debug, Clone, Default)]
pub(crate) struct AgentMetadata {
    pub(crate) env: String,
    pub(crate) hostname: String,
    pub(crate) version: String,
}

impl AgentMetadata {
    pub(crate) fn from_config(config: &StatsConfig) -> Self {
        AgentMetadata {
            env: config.agent_env.clone(),
            hostname: config.agent_hostname.clone(),
            version: config.agent_version.clone(),
        }
    }

    /// Wrap client payloads in a payload ready to be written
    pub(crate) fn wrap(
        &self,
        stats: Vec<pb::ClientStatsPayload>,
        client_computed: bool,
    ) -> pb::StatsPayload {
        pb::StatsPayload {
            agent_hostname: self.hostname.clone(),
            agent_env: self.env.clone(),
            agent_version: self.version.clone(),
            stats,
            client_computed,
            split_payload: false,
        }
    }
}

/// A sink for stats payloads.
///
/// Writes are fire-and-forget: implementations must not block the aggregators and don't report
/// failures.
pub trait StatsWriter: Send + Sync {
    fn write(&self, payload: pb::StatsPayload);
}

/// Writer forwarding payloads to a bounded tokio channel.
///
/// Payloads are dropped with a warning when the channel is full or closed.
#[derive(Debug, Clone)]
pub struct ChannelWriter {
    sender: mpsc::Sender<pb::StatsPayload>,
}

impl ChannelWriter {
    pub fn new(sender: mpsc::Sender<pb::StatsPayload>) -> Self {
        Self { sender }
    }

    /// Create a writer and the receiving end of its channel
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<pb::StatsPayload>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }
}

impl StatsWriter for ChannelWriter {
    fn write(&self, payload: pb::StatsPayload) {
        if let Err(err) = self.sender.try_send(payload) {
            match err {
                mpsc::error::TrySendError::Full(p) => warn!(
                    client_payloads = p.stats.len(),
                    "Stats channel is full, dropping payload"
                ),
                mpsc::error::TrySendError::Closed(p) => warn!(
                    client_payloads = p.stats.len(),
                    "Stats channel is closed, dropping payload"
                ),
            }
        }
    }
}

/// Writer calling a closure for each payload
pub struct FnWriter<F>(pub F);

impl<F> StatsWriter for FnWriter<F>
where
    F: Fn(pb::StatsPayload) + Send + Sync,
{
    fn write(&self, payload: pb::StatsPayload) {
        (self.0)(payload)
    }
}
