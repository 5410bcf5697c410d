// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Concentrator scheduling the flushes of a [`SpanConcentrator`].
//!
//! The concentrator receives processed traces, aggregates their spans and writes a stats payload
//! every bucket interval. When its worker is stopped all buckets are flushed regardless of their
//! age.

use crate::config::{ConfigError, StatsConfig};
use crate::mutex::MutexExt;
use crate::pb;
use crate::span_concentrator::{PayloadContext, SpanConcentrator};
use crate::worker::{FlushWorker, Worker, WorkerError};
use crate::writer::{AgentMetadata, StatsWriter};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::runtime::Handle;
use tracing::{debug, info};

const METRIC_SAMPLE_RATE: &str = "_sample_rate";

/// A trace chunk with the metadata extracted by the agent.
#[derive(Debug, Clone, Default)]
pub struct ProcessedTrace {
    pub chunk: pb::TraceChunk,
    /// Index of the root span in the chunk
    pub root_index: Option<usize>,
    pub tracer_env: String,
    pub tracer_hostname: String,
    pub app_version: String,
    pub git_commit_sha: String,
    pub image_tag: String,
}

impl ProcessedTrace {
    /// Create a processed trace from a chunk, looking up its root span
    pub fn new(chunk: pb::TraceChunk) -> Self {
        let root_index = get_root_index(&chunk.spans);
        ProcessedTrace {
            chunk,
            root_index,
            ..Default::default()
        }
    }

    pub fn root(&self) -> Option<&pb::Span> {
        self.root_index.and_then(|i| self.chunk.spans.get(i))
    }
}

/// Return the index of the root span of a trace.
///
/// The root is the last span without parent, or if there is none the first span whose parent is
/// not part of the trace.
fn get_root_index(spans: &[pb::Span]) -> Option<usize> {
    if spans.is_empty() {
        return None;
    }
    if let Some(i) = spans.iter().rposition(|s| s.parent_id == 0) {
        return Some(i);
    }
    let span_ids: HashSet<u64> = spans.iter().map(|s| s.span_id).collect();
    spans
        .iter()
        .position(|s| !span_ids.contains(&s.parent_id))
        .or(Some(spans.len() - 1))
}

/// Traces received together from a container
#[derive(Debug, Clone, Default)]
pub struct Input {
    pub traces: Vec<ProcessedTrace>,
    pub container_id: String,
    pub container_tags: Vec<String>,
}

/// Return the weight of a trace from the sample rate of its root span
pub fn weight(root: Option<&pb::Span>) -> f64 {
    let Some(root) = root else {
        return 1.0;
    };
    match root.metrics.get(METRIC_SAMPLE_RATE) {
        Some(rate) if *rate > 0.0 && *rate <= 1.0 => 1.0 / rate,
        _ => 1.0,
    }
}

/// Concentrator aggregates the spans of processed traces and periodically writes stats payloads.
///
/// The concentrator is cheap to clone, clones share the same buckets.
#[derive(Clone)]
pub struct Concentrator {
    span_concentrator: Arc<Mutex<SpanConcentrator>>,
    bucket_interval: Duration,
    metadata: Arc<AgentMetadata>,
    writer: Arc<dyn StatsWriter>,
}

impl Concentrator {
    /// Create a concentrator, `now` is used to define the oldest bucket accepting data.
    ///
    /// # Errors
    /// Fails if the configuration is invalid.
    pub fn new(
        config: &StatsConfig,
        writer: Arc<dyn StatsWriter>,
        now: SystemTime,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut span_concentrator = SpanConcentrator::new(
            config.bucket_interval,
            now,
            config.compute_stats_by_span_kind,
            config.configured_peer_tags(),
        );
        span_concentrator.set_buffer_len(config.buffer_len);
        Ok(Concentrator {
            span_concentrator: Arc::new(Mutex::new(span_concentrator)),
            bucket_interval: config.bucket_interval,
            metadata: Arc::new(AgentMetadata::from_config(config)),
            writer,
        })
    }

    /// Add the spans of the input traces to the stats
    pub fn add(&self, input: &Input) {
        let mut span_concentrator = self.span_concentrator.lock_or_panic();
        for trace in &input.traces {
            self.add_trace(
                &mut span_concentrator,
                trace,
                &input.container_id,
                &input.container_tags,
            );
        }
    }

    fn add_trace(
        &self,
        span_concentrator: &mut SpanConcentrator,
        trace: &ProcessedTrace,
        container_id: &str,
        container_tags: &[String],
    ) {
        let hostname = if trace.tracer_hostname.is_empty() {
            &self.metadata.hostname
        } else {
            &trace.tracer_hostname
        };
        let env = if trace.tracer_env.is_empty() {
            &self.metadata.env
        } else {
            &trace.tracer_env
        };
        let ctx = PayloadContext {
            env,
            hostname,
            version: &trace.app_version,
            container_id,
            git_commit_sha: &trace.git_commit_sha,
            image_tag: &trace.image_tag,
            origin: &trace.chunk.origin,
            weight: weight(trace.root()),
            container_tags,
        };
        for span in &trace.chunk.spans {
            span_concentrator.add_span(span, &ctx);
        }
    }

    /// Flush the closed buckets, or all buckets if `force` is true.
    ///
    /// Returns `None` if no bucket has been flushed.
    pub fn flush_now(&self, now: SystemTime, force: bool) -> Option<pb::StatsPayload> {
        let stats = self.span_concentrator.lock_or_panic().flush(now, force);
        if stats.is_empty() {
            return None;
        }
        Some(self.metadata.wrap(stats, false))
    }

    /// Flush at the current time and write the payload if any
    pub fn flush_and_write(&self, force: bool) {
        if let Some(payload) = self.flush_now(SystemTime::now(), force) {
            debug!(
                client_payloads = payload.stats.len(),
                force, "Writing concentrator stats"
            );
            self.writer.write(payload);
        }
    }

    /// Return the worker flushing the concentrator every bucket interval
    pub fn worker(&self) -> ConcentratorWorker {
        ConcentratorWorker {
            concentrator: self.clone(),
        }
    }

    /// Start the flush loop on the given runtime.
    ///
    /// Stopping the returned worker flushes all the remaining stats.
    pub fn start(&self, rt: &Handle) -> Result<FlushWorker<ConcentratorWorker>, WorkerError> {
        let mut worker = FlushWorker::new(self.worker());
        worker.start(rt)?;
        info!(
            bucket_interval_secs = self.bucket_interval.as_secs_f64(),
            "Concentrator started"
        );
        Ok(worker)
    }
}

/// Worker flushing a [`Concentrator`] periodically
pub struct ConcentratorWorker {
    concentrator: Concentrator,
}

#[async_trait]
impl Worker for ConcentratorWorker {
    async fn run(&mut self) {
        self.concentrator.flush_and_write(false);
    }

    async fn trigger(&mut self) {
        tokio::time::sleep(self.concentrator.bucket_interval).await;
    }

    async fn shutdown(&mut self) {
        info!("Concentrator stopping, flushing all stats");
        self.concentrator.flush_and_write(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::test_utils::RecordingWriter;
    use std::collections::HashMap;
    use std::time::UNIX_EPOCH;

    const BUCKET_INTERVAL: Duration = Duration::from_secs(10);

    fn unix_nanos(t: SystemTime) -> i64 {
        t.duration_since(UNIX_EPOCH).unwrap().as_nanos() as i64
    }

    fn config() -> StatsConfig {
        StatsConfig::default()
            .with_agent_env("agent-env")
            .with_agent_hostname("agent-host")
            .with_agent_version("7.0.0")
            .with_bucket_interval(BUCKET_INTERVAL)
    }

    fn span(span_id: u64, parent_id: u64, end: SystemTime, duration: i64) -> pb::Span {
        let mut span = pb::Span {
            service: "svc".to_string(),
            name: "op".to_string(),
            resource: "res".to_string(),
            span_id,
            parent_id,
            start: unix_nanos(end) - duration,
            duration,
            ..Default::default()
        };
        if parent_id == 0 {
            span.metrics.insert("_top_level".to_string(), 1.0);
        }
        span
    }

    fn trace(spans: Vec<pb::Span>) -> ProcessedTrace {
        ProcessedTrace::new(pb::TraceChunk {
            spans,
            ..Default::default()
        })
    }

    #[test]
    fn test_get_root_index() {
        let now = SystemTime::now();
        assert_eq!(get_root_index(&[]), None);
        assert_eq!(
            get_root_index(&[span(2, 1, now, 1), span(1, 0, now, 1)]),
            Some(1)
        );
        // Orphan span
        assert_eq!(
            get_root_index(&[span(2, 1, now, 1), span(1, 42, now, 1)]),
            Some(1)
        );
        // Cycle
        assert_eq!(
            get_root_index(&[span(1, 2, now, 1), span(2, 1, now, 1)]),
            Some(1)
        );
    }

    #[test]
    fn test_weight() {
        let mut root = pb::Span::default();
        assert_eq!(weight(None), 1.0);
        assert_eq!(weight(Some(&root)), 1.0);
        root.metrics.insert("_sample_rate".to_string(), 0.25);
        assert_eq!(weight(Some(&root)), 4.0);
        root.metrics.insert("_sample_rate".to_string(), 0.0);
        assert_eq!(weight(Some(&root)), 1.0);
        root.metrics.insert("_sample_rate".to_string(), 1.5);
        assert_eq!(weight(Some(&root)), 1.0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let writer = Arc::new(RecordingWriter::default());
        let zero_interval = config().with_bucket_interval(Duration::ZERO);
        assert!(matches!(
            Concentrator::new(&zero_interval, writer.clone(), SystemTime::now()),
            Err(ConfigError::Invalid(_))
        ));

        let mut zero_flush = config();
        zero_flush.client_stats.flush_interval = Duration::ZERO;
        assert!(Concentrator::new(&zero_flush, writer, SystemTime::now()).is_err());
    }

    #[test]
    fn test_add_uses_agent_defaults() {
        let now = SystemTime::now();
        let writer = Arc::new(RecordingWriter::default());
        let concentrator = Concentrator::new(&config(), writer, now).unwrap();

        let mut with_env = trace(vec![span(1, 0, now, 100)]);
        with_env.tracer_env = "tracer-env".to_string();
        with_env.tracer_hostname = "tracer-host".to_string();
        with_env.app_version = "1.2.3".to_string();
        with_env.git_commit_sha = "abc".to_string();
        with_env.image_tag = "v1".to_string();

        let mut sampled = trace(vec![span(1, 0, now, 100), span(2, 1, now, 50)]);
        sampled.chunk.spans[0]
            .metrics
            .insert("_sample_rate".to_string(), 0.5);
        sampled.chunk.origin = "synthetics".to_string();

        concentrator.add(&Input {
            traces: vec![with_env, sampled],
            container_id: "cid".to_string(),
            container_tags: vec!["image_tag:v1".to_string()],
        });

        assert!(concentrator.flush_now(now, false).is_none());
        let payload = concentrator.flush_now(now, true).unwrap();
        assert_eq!(payload.agent_env, "agent-env");
        assert_eq!(payload.agent_hostname, "agent-host");
        assert_eq!(payload.agent_version, "7.0.0");
        assert!(!payload.client_computed);

        let by_env: HashMap<&str, &pb::ClientStatsPayload> =
            payload.stats.iter().map(|p| (p.env.as_str(), p)).collect();
        assert_eq!(by_env.len(), 2);

        let tracer = by_env["tracer-env"];
        assert_eq!(tracer.hostname, "tracer-host");
        assert_eq!(tracer.version, "1.2.3");
        assert_eq!(tracer.git_commit_sha, "abc");
        assert_eq!(tracer.image_tag, "v1");
        assert_eq!(tracer.container_id, "cid");
        assert_eq!(tracer.tags, vec!["image_tag:v1"]);

        let agent = by_env["agent-env"];
        assert_eq!(agent.hostname, "agent-host");
        let stats = &agent.stats[0].stats;
        // Only the root span is eligible
        assert_eq!(stats.len(), 1);
        let gs = stats[0].as_ref().unwrap();
        assert_eq!(gs.hits, 2);
        assert_eq!(gs.duration, 200);
        assert!(gs.synthetics);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_flushes_on_tick_and_stop() {
        let now = SystemTime::now();
        let writer = Arc::new(RecordingWriter::default());
        let concentrator = Concentrator::new(
            &config(),
            writer.clone(),
            now - Duration::from_secs(3600),
        )
        .unwrap();

        // Old enough to be flushed on the first tick
        let old = now - Duration::from_secs(1800);
        concentrator.add(&Input {
            traces: vec![trace(vec![span(1, 0, old, 10)])],
            ..Default::default()
        });
        let mut worker = concentrator.start(&Handle::current()).unwrap();

        tokio::time::sleep(BUCKET_INTERVAL + Duration::from_secs(1)).await;
        let payloads = writer.take();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].stats[0].stats[0].stats[0].as_ref().unwrap().hits, 1);

        // Nothing to flush, nothing written
        tokio::time::sleep(BUCKET_INTERVAL).await;
        assert!(writer.take().is_empty());

        // Recent spans are only flushed by the final forced flush
        concentrator.add(&Input {
            traces: vec![trace(vec![span(1, 0, SystemTime::now(), 10)])],
            ..Default::default()
        });
        worker.stop().await.unwrap();
        let payloads = writer.take();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].agent_env, "agent-env");
    }
}
