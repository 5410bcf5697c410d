// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
//! This module implements the SpanConcentrator used to aggregate spans into stats
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, SystemTime};

use crate::aggregation::{
    has_top_level, is_measured, is_partial_snapshot, is_span_kind_eligible, PayloadAggregationKey,
    TAG_SPANKIND,
};
use crate::pb;
use crate::time_utils::{align_timestamp, unix_nanos};
use tracing::debug;

use stats_bucket::StatsBucket;

mod stats_bucket;

/// Payload level context of a span: where it comes from and how much it weighs.
#[derive(Debug, Clone, Copy)]
pub struct PayloadContext<'a> {
    pub env: &'a str,
    pub hostname: &'a str,
    pub version: &'a str,
    pub container_id: &'a str,
    pub git_commit_sha: &'a str,
    pub image_tag: &'a str,
    /// Origin of the trace, e.g. `synthetics`
    pub origin: &'a str,
    /// Inverse of the sampling rate applied to the trace
    pub weight: f64,
    /// Tags of the container, attached to the flushed payloads of the container
    pub container_tags: &'a [String],
}

impl Default for PayloadContext<'_> {
    fn default() -> Self {
        PayloadContext {
            env: "",
            hostname: "",
            version: "",
            container_id: "",
            git_commit_sha: "",
            image_tag: "",
            origin: "",
            weight: 1.0,
            container_tags: &[],
        }
    }
}

/// Return true if the span has a span.kind that is eligible for stats computation
fn compute_stats_for_span_kind(span: &pb::Span) -> bool {
    span.meta
        .get(TAG_SPANKIND)
        .is_some_and(|span_kind| is_span_kind_eligible(span_kind))
}

/// Return true if the span should be ignored for stats computation
fn should_ignore_span(span: &pb::Span, compute_stats_by_span_kind: bool) -> bool {
    !(span.parent_id == 0
        || has_top_level(span)
        || is_measured(span)
        || (compute_stats_by_span_kind && compute_stats_for_span_kind(span)))
        || is_partial_snapshot(span)
}

/// SpanConcentrator compute stats on span aggregated by time and span attributes
///
/// # Aggregation
/// Spans are aggregated into time buckets based on their end_time. Within each time bucket there
/// is another level of aggregation based on the payload context (env, hostname, version,
/// container) and the spans fields (e.g. resource_name, service_name) and the peer tags if peer
/// tag keys are configured.
///
/// # Span eligibility
/// The ingested spans are only aggregated if they are root, top-level, measured or if their
/// `span.kind` is eligible and `compute_stats_by_span_kind` is enabled. Partial snapshots of long
/// running spans are never aggregated.
///
/// # Flushing
/// When the SpanConcentrator is flushed it keeps the `buffer_len` most recent buckets and remove
/// all older buckets returning their content. When using force flush all buckets are flushed
/// regardless of their age. A flushed time window is never reopened: late spans are added to the
/// oldest open bucket.
#[derive(Clone)]
pub struct SpanConcentrator {
    /// Size of the time buckets used for aggregation in nanos
    bucket_size: u64,
    buckets: HashMap<u64, StatsBucket>,
    /// Timestamp of the oldest time bucket for which we allow data.
    /// Any ingested stats older than it get added to this bucket.
    oldest_timestamp: u64,
    /// bufferLen is the number stats bucket we keep when flushing.
    buffer_len: usize,
    compute_stats_by_span_kind: bool,
    /// keys for supplementary tags that describe peer.service entities
    peer_tag_keys: Vec<String>,
    /// Tags of the containers with stats in the open buckets
    container_tags: HashMap<String, Vec<String>>,
}

impl SpanConcentrator {
    /// Return a new concentrator with the given parameters
    /// - `bucket_size` is the size of the time buckets
    /// - `now` the current system time, used to define the oldest bucket
    /// - `compute_stats_by_span_kind` compute stats for spans with an eligible span kind
    /// - `peer_tag_keys` list of keys considered as peer tags for aggregation
    pub fn new(
        bucket_size: Duration,
        now: SystemTime,
        compute_stats_by_span_kind: bool,
        peer_tag_keys: Vec<String>,
    ) -> SpanConcentrator {
        let bucket_size = (bucket_size.as_nanos() as u64).max(1);
        SpanConcentrator {
            bucket_size,
            buckets: HashMap::new(),
            oldest_timestamp: align_timestamp(unix_nanos(now), bucket_size),
            buffer_len: 2,
            compute_stats_by_span_kind,
            peer_tag_keys,
            container_tags: HashMap::new(),
        }
    }

    /// Set the number of most recent buckets kept when flushing, at least one.
    pub fn set_buffer_len(&mut self, buffer_len: usize) {
        self.buffer_len = buffer_len.max(1);
    }

    /// Return the timestamp of the oldest bucket accepting data
    pub fn oldest_timestamp(&self) -> u64 {
        self.oldest_timestamp
    }

    /// Add a span into the concentrator, by computing stats if the span is eligible for stats
    /// computation.
    ///
    /// Return true if the span has been aggregated.
    pub fn add_span(&mut self, span: &pb::Span, ctx: &PayloadContext<'_>) -> bool {
        if should_ignore_span(span, self.compute_stats_by_span_kind) {
            return false;
        }
        let end = span.start.saturating_add(span.duration).max(0) as u64;
        let mut bucket_timestamp = align_timestamp(end, self.bucket_size);
        // If the span is to old we aggregate it in the oldest bucket instead of
        // creating a new one
        if bucket_timestamp < self.oldest_timestamp {
            bucket_timestamp = self.oldest_timestamp;
        }

        if !ctx.container_id.is_empty() && !ctx.container_tags.is_empty() {
            self.container_tags
                .insert(ctx.container_id.to_owned(), ctx.container_tags.to_vec());
        }

        self.buckets
            .entry(bucket_timestamp)
            .or_insert_with(|| {
                debug!(bucket_timestamp, "Creating stats bucket");
                StatsBucket::new(bucket_timestamp)
            })
            .insert(span, ctx, &self.peer_tag_keys);
        true
    }

    /// Flush all stats bucket except for the `buffer_len` most recent. If `force` is true, flush
    /// all buckets.
    ///
    /// Returns one payload per payload aggregation key, each holding the flushed buckets in
    /// ascending start order.
    pub fn flush(&mut self, now: SystemTime, force: bool) -> Vec<pb::ClientStatsPayload> {
        let now_timestamp = unix_nanos(now);
        let mut buckets: Vec<(u64, StatsBucket)> = self.buckets.drain().collect();
        buckets.sort_by_key(|(timestamp, _)| *timestamp);

        // Always keep `bufferLen` buckets (default is 2: current + previous one).
        // This is a trade-off: we accept slightly late traces (clock skew and stuff)
        // but we delay flushing by at most `bufferLen` buckets.
        // The "force" boolean skips the delay and flushes all buckets, typically on
        // shutdown.
        let keep_after =
            now_timestamp.saturating_sub(self.buffer_len as u64 * self.bucket_size);
        let mut payloads: BTreeMap<PayloadAggregationKey, pb::ClientStatsPayload> =
            BTreeMap::new();
        for (timestamp, bucket) in buckets {
            if !force && timestamp > keep_after {
                self.buckets.insert(timestamp, bucket);
                continue;
            }
            for (key, stats_bucket) in bucket.flush(self.bucket_size) {
                payloads
                    .entry(key)
                    .or_insert_with_key(|key| self.new_payload(key))
                    .stats
                    .push(stats_bucket);
            }
        }

        let new_oldest = if force {
            align_timestamp(now_timestamp, self.bucket_size)
        } else {
            align_timestamp(now_timestamp, self.bucket_size)
                .saturating_sub((self.buffer_len as u64 - 1) * self.bucket_size)
        };
        self.oldest_timestamp = self.oldest_timestamp.max(new_oldest);

        let buckets = &self.buckets;
        self.container_tags
            .retain(|container_id, _| buckets.values().any(|b| b.has_container(container_id)));

        if !payloads.is_empty() {
            debug!(payloads = payloads.len(), force, "Flushed span concentrator");
        }
        payloads.into_values().collect()
    }

    fn new_payload(&self, key: &PayloadAggregationKey) -> pb::ClientStatsPayload {
        pb::ClientStatsPayload {
            hostname: key.hostname.clone(),
            env: key.env.clone(),
            version: key.version.clone(),
            container_id: key.container_id.clone(),
            git_commit_sha: key.git_commit_sha.clone(),
            image_tag: key.image_tag.clone(),
            tags: self
                .container_tags
                .get(&key.container_id)
                .cloned()
                .unwrap_or_default(),
            ..Default::default()
        }
    }
}
