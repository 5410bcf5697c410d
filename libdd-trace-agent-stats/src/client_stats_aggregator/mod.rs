// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Aggregation of the stats payloads computed by tracers.
//!
//! Tracers with client side stats send payloads covering short time buckets. The aggregator
//! re-aligns them on its own clock to correct clock skew and merges payloads falling in the same
//! bucket. A bucket receiving a single payload forwards it untouched. As soon as a second payload
//! lands in a bucket, the payloads are forwarded with their counts removed ("distributions") and
//! the counts are summed and emitted on flush ("counts").

use crate::aggregation::{BucketsAggregationKey, PayloadAggregationKey};
use crate::config::{ConfigError, StatsConfig};
use crate::container_tags::{version_data_from_tags, ContainerTagsProvider};
use crate::mutex::MutexExt;
use crate::pb;
use crate::time_utils::{align_timestamp, unix_nanos};
use crate::worker::{FlushWorker, Worker, WorkerError};
use crate::writer::{AgentMetadata, StatsWriter};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::runtime::Handle;
use tracing::{debug, error, info};

/// `agent_aggregation` of the payloads forwarded without their counts
pub const AGGREGATION_DISTRIBUTIONS: &str = "distributions";
/// `agent_aggregation` of the payloads holding merged counts
pub const AGGREGATION_COUNTS: &str = "counts";

#[derive(Debug, Clone, Default)]
struct AggregatedCounts {
    hits: u64,
    errors: u64,
    duration: u64,
    peer_tags: Vec<String>,
}

/// Payloads received in the same aggregator bucket
#[derive(Debug, Default)]
struct Bucket {
    /// Number of payloads received
    n: usize,
    /// First payload, kept until a second one arrives
    first: Option<pb::ClientStatsPayload>,
    agg: BTreeMap<PayloadAggregationKey, BTreeMap<BucketsAggregationKey, AggregatedCounts>>,
}

impl Bucket {
    /// Add a payload to the bucket, returning the payloads to forward right away.
    fn add(&mut self, p: pb::ClientStatsPayload) -> Vec<pb::ClientStatsPayload> {
        self.n += 1;
        match self.n {
            1 => {
                self.first = Some(p);
                vec![]
            }
            2 => {
                let mut out = Vec::with_capacity(2);
                if let Some(first) = self.first.take() {
                    self.aggregate_counts(&first);
                    out.push(trim_counts(first));
                }
                self.aggregate_counts(&p);
                out.push(trim_counts(p));
                out
            }
            _ => {
                self.aggregate_counts(&p);
                vec![trim_counts(p)]
            }
        }
    }

    fn aggregate_counts(&mut self, p: &pb::ClientStatsPayload) {
        let payload_agg = self.agg.entry(PayloadAggregationKey::from(p)).or_default();
        for gs in p.stats.iter().flat_map(|b| b.stats.iter().flatten()) {
            let counts = payload_agg
                .entry(BucketsAggregationKey::from(gs))
                .or_default();
            counts.hits = counts.hits.saturating_add(gs.hits);
            counts.errors = counts.errors.saturating_add(gs.errors);
            counts.duration = counts.duration.saturating_add(gs.duration);
            counts.peer_tags.clone_from(&gs.peer_tags);
        }
    }

    /// Return the payloads to emit when the bucket is closed
    fn flush(self, ts: u64, client_bucket_duration: u64) -> Vec<pb::ClientStatsPayload> {
        if self.n == 1 {
            return self.first.into_iter().collect();
        }
        self.agg
            .into_iter()
            .filter(|(_, groups)| !groups.is_empty())
            .map(|(key, groups)| counts_payload(key, groups, ts, client_bucket_duration))
            .collect()
    }
}

fn counts_payload(
    key: PayloadAggregationKey,
    groups: BTreeMap<BucketsAggregationKey, AggregatedCounts>,
    start: u64,
    duration: u64,
) -> pb::ClientStatsPayload {
    let stats = groups
        .into_iter()
        .map(|(key, counts)| {
            Some(pb::ClientGroupedStats {
                service: key.service,
                name: key.name,
                resource: key.resource,
                http_status_code: key.status_code,
                r#type: key.r#type,
                synthetics: key.synthetics,
                span_kind: key.span_kind,
                is_trace_root: key.is_trace_root.into(),
                peer_tags: counts.peer_tags,
                hits: counts.hits,
                errors: counts.errors,
                duration: counts.duration,
                ..Default::default()
            })
        })
        .collect();
    pb::ClientStatsPayload {
        hostname: key.hostname,
        env: key.env,
        version: key.version,
        git_commit_sha: key.git_commit_sha,
        image_tag: key.image_tag,
        agent_aggregation: AGGREGATION_COUNTS.to_string(),
        stats: vec![pb::ClientStatsBucket {
            start,
            duration,
            stats,
            agent_time_shift: 0,
        }],
        ..Default::default()
    }
}

/// Return `to - from` saturated to the `i64` range
fn time_shift(to: u64, from: u64) -> i64 {
    let shift = i128::from(to) - i128::from(from);
    shift.clamp(i64::MIN.into(), i64::MAX.into()) as i64
}

/// Remove the counts of a payload whose counts are aggregated by the agent
fn trim_counts(mut p: pb::ClientStatsPayload) -> pb::ClientStatsPayload {
    p.agent_aggregation = AGGREGATION_DISTRIBUTIONS.to_string();
    for gs in p.stats.iter_mut().flat_map(|b| b.stats.iter_mut().flatten()) {
        gs.hits = 0;
        gs.errors = 0;
        gs.duration = 0;
    }
    p
}

#[derive(Debug, Clone, Copy)]
struct Timing {
    bucket_duration: u64,
    client_bucket_duration: u64,
    oldest_bucket_start: u64,
    timestamp_offset: u64,
}

impl Timing {
    /// Align a timestamp on the aggregator buckets
    fn align(&self, t: u64) -> u64 {
        align_timestamp(t, self.bucket_duration) + self.timestamp_offset
    }

    /// Return the start of the oldest bucket accepting data at `now`
    fn oldest_start(&self, now: u64) -> u64 {
        self.align((now + self.bucket_duration).saturating_sub(self.oldest_bucket_start))
    }

    /// Return the aggregator bucket of a client bucket and whether its start must be shifted.
    fn bucket_time(&self, now: u64, oldest_ts: u64, start: u64) -> (u64, bool) {
        if start < oldest_ts {
            return (oldest_ts, true);
        }
        if start > now {
            return (self.align(now), true);
        }
        (self.align(start), false)
    }
}

#[derive(Debug)]
struct AggregatorState {
    buckets: BTreeMap<u64, Bucket>,
    oldest_ts: u64,
}

/// Merges the stats payloads computed by tracers.
///
/// # Clock skew
/// The start of a client bucket older than the oldest open bucket is moved to the oldest open
/// bucket, and a start in the future is moved to the current bucket. The shift is reported in
/// the `agent_time_shift` field of the bucket. Buckets within the window are only re-aligned to
/// pick the aggregator bucket, they keep their original start.
///
/// # Flushing
/// Buckets older than the window are closed on every flush tick, every bucket is closed when
/// the aggregator is stopped. Each emission is written as one [`pb::StatsPayload`] marked as
/// client computed.
///
/// The aggregator is cheap to clone, clones share the same buckets.
#[derive(Clone)]
pub struct ClientStatsAggregator {
    state: Arc<Mutex<AggregatorState>>,
    timing: Timing,
    flush_interval: Duration,
    metadata: Arc<AgentMetadata>,
    writer: Arc<dyn StatsWriter>,
    container_tags: Option<Arc<dyn ContainerTagsProvider>>,
}

impl ClientStatsAggregator {
    /// Create an aggregator, `now` is used to define the oldest bucket accepting data.
    ///
    /// # Errors
    /// Fails if the client stats configuration is invalid.
    pub fn new(
        config: &StatsConfig,
        writer: Arc<dyn StatsWriter>,
        now: SystemTime,
    ) -> Result<Self, ConfigError> {
        let client_stats = &config.client_stats;
        client_stats.validate()?;
        let timing = Timing {
            bucket_duration: client_stats.bucket_duration.as_nanos() as u64,
            client_bucket_duration: client_stats.client_bucket_duration.as_nanos() as u64,
            oldest_bucket_start: client_stats.oldest_bucket_start.as_nanos() as u64,
            timestamp_offset: client_stats.timestamp_offset.as_nanos() as u64,
        };
        Ok(ClientStatsAggregator {
            state: Arc::new(Mutex::new(AggregatorState {
                buckets: BTreeMap::new(),
                oldest_ts: timing.oldest_start(unix_nanos(now)),
            })),
            timing,
            flush_interval: client_stats.flush_interval,
            metadata: Arc::new(AgentMetadata::from_config(config)),
            writer,
            container_tags: None,
        })
    }

    /// Resolve missing version data of the payloads from the tags of their container
    pub fn with_container_tags(mut self, provider: Arc<dyn ContainerTagsProvider>) -> Self {
        self.container_tags = Some(provider);
        self
    }

    /// Return the start of the oldest bucket accepting data
    pub fn oldest_timestamp(&self) -> u64 {
        self.state.lock_or_panic().oldest_ts
    }

    /// Add a client payload received now
    pub fn add(&self, p: pb::ClientStatsPayload) {
        self.add_at(SystemTime::now(), p)
    }

    /// Add a client payload received at `now`.
    ///
    /// Each client bucket is added separately. The payloads which must be forwarded right away
    /// are written once the buckets are released.
    pub fn add_at(&self, now: SystemTime, mut p: pb::ClientStatsPayload) {
        self.set_version_data_from_container_tags(&mut p);
        let now = unix_nanos(now);
        let client_buckets = std::mem::take(&mut p.stats);
        let mut emitted = Vec::new();
        {
            let mut state = self.state.lock_or_panic();
            let oldest_ts = state.oldest_ts;
            for mut client_bucket in client_buckets {
                let (ts, shifted) = self.timing.bucket_time(now, oldest_ts, client_bucket.start);
                if shifted {
                    client_bucket.agent_time_shift = time_shift(ts, client_bucket.start);
                    client_bucket.start = ts;
                }
                let single = pb::ClientStatsPayload {
                    stats: vec![client_bucket],
                    ..p.clone()
                };
                let out = state
                    .buckets
                    .entry(ts)
                    .or_insert_with(|| {
                        debug!(bucket_timestamp = ts, "Creating client stats bucket");
                        Bucket::default()
                    })
                    .add(single);
                emitted.push(out);
            }
        }
        for payloads in emitted {
            self.write(payloads);
        }
    }

    /// Close the buckets which are out of the window at `now`, oldest first.
    pub fn flush_on_time(&self, now: SystemTime) {
        let flush_ts = self.timing.oldest_start(unix_nanos(now));
        let flushed: Vec<Vec<pb::ClientStatsPayload>> = {
            let mut state = self.state.lock_or_panic();
            let open = state.buckets.split_off(&flush_ts);
            let closed = std::mem::replace(&mut state.buckets, open);
            state.oldest_ts = state.oldest_ts.max(flush_ts);
            closed
                .into_iter()
                .map(|(ts, bucket)| bucket.flush(ts, self.timing.client_bucket_duration))
                .collect()
        };
        if !flushed.is_empty() {
            debug!(buckets = flushed.len(), "Flushing client stats buckets");
        }
        for payloads in flushed {
            self.write(payloads);
        }
    }

    /// Close every bucket, oldest first.
    pub fn flush_all(&self) {
        let flushed: Vec<Vec<pb::ClientStatsPayload>> = {
            let mut state = self.state.lock_or_panic();
            std::mem::take(&mut state.buckets)
                .into_iter()
                .map(|(ts, bucket)| bucket.flush(ts, self.timing.client_bucket_duration))
                .collect()
        };
        for payloads in flushed {
            self.write(payloads);
        }
    }

    fn write(&self, payloads: Vec<pb::ClientStatsPayload>) {
        if payloads.is_empty() {
            return;
        }
        self.writer.write(self.metadata.wrap(payloads, true));
    }

    fn set_version_data_from_container_tags(&self, p: &mut pb::ClientStatsPayload) {
        if !p.image_tag.is_empty() && !p.git_commit_sha.is_empty() {
            return;
        }
        let Some(provider) = &self.container_tags else {
            return;
        };
        if p.container_id.is_empty() {
            return;
        }
        match provider.container_tags(&p.container_id) {
            Ok(tags) => {
                let data = version_data_from_tags(&tags);
                if p.image_tag.is_empty() {
                    p.image_tag = data.image_tag.unwrap_or_default().to_string();
                }
                if p.git_commit_sha.is_empty() {
                    p.git_commit_sha = data.git_commit_sha.unwrap_or_default().to_string();
                }
            }
            Err(err) => error!(
                container_id = %p.container_id,
                %err,
                "Unable to resolve container ID to container tags"
            ),
        }
    }

    /// Return the worker closing the buckets every flush interval
    pub fn worker(&self) -> ClientStatsWorker {
        ClientStatsWorker {
            aggregator: self.clone(),
        }
    }

    /// Start the flush loop on the given runtime.
    ///
    /// Stopping the returned worker flushes all the remaining buckets.
    pub fn start(&self, rt: &Handle) -> Result<FlushWorker<ClientStatsWorker>, WorkerError> {
        let mut worker = FlushWorker::new(self.worker());
        worker.start(rt)?;
        info!(
            flush_interval_secs = self.flush_interval.as_secs_f64(),
            "Client stats aggregator started"
        );
        Ok(worker)
    }
}

/// Worker flushing a [`ClientStatsAggregator`] periodically
pub struct ClientStatsWorker {
    aggregator: ClientStatsAggregator,
}

#[async_trait]
impl Worker for ClientStatsWorker {
    async fn run(&mut self) {
        self.aggregator.flush_on_time(SystemTime::now());
    }

    async fn trigger(&mut self) {
        tokio::time::sleep(self.aggregator.flush_interval).await;
    }

    async fn shutdown(&mut self) {
        info!("Client stats aggregator stopping, flushing all buckets");
        self.aggregator.flush_all();
    }
}
