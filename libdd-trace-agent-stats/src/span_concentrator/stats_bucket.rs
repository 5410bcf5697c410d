// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
//! Time buckets of the span concentrator and the stats computed from spans in each group.
use crate::aggregation::{
    format_peer_tags, get_status_code, has_top_level, is_span_kind_eligible, is_synthetics,
    matching_peer_tags, peer_tags_hash, BucketsAggregationKey, PayloadAggregationKey,
    TAG_SPANKIND,
};
use crate::pb;
use hashbrown::HashMap;
use sketches_ddsketch::{Config as SketchConfig, DDSketch};
use std::collections::BTreeMap;
use tracing::warn;

use super::PayloadContext;

#[derive(Clone, Hash, PartialEq, Eq)]
/// Represent a stats aggregation key borrowed from span data
///
/// Fields are laid out in the same order as the fields of [`PayloadAggregationKey`] followed by
/// the fields of [`BucketsAggregationKey`].
pub(super) struct BorrowedAggregationKey<'a> {
    env: &'a str,
    hostname: &'a str,
    version: &'a str,
    container_id: &'a str,
    git_commit_sha: &'a str,
    image_tag: &'a str,
    service: &'a str,
    name: &'a str,
    resource: &'a str,
    span_type: &'a str,
    span_kind: &'a str,
    status_code: u32,
    synthetics: bool,
    peer_tags_hash: u64,
    is_trace_root: pb::Trilean,
}

impl hashbrown::Equivalent<OwnedAggregationKey> for BorrowedAggregationKey<'_> {
    #[inline]
    fn equivalent(&self, key: &OwnedAggregationKey) -> bool {
        let (p, b) = (&key.payload, &key.bucket);
        self.env == p.env
            && self.hostname == p.hostname
            && self.version == p.version
            && self.container_id == p.container_id
            && self.git_commit_sha == p.git_commit_sha
            && self.image_tag == p.image_tag
            && self.service == b.service
            && self.name == b.name
            && self.resource == b.resource
            && self.span_type == b.r#type
            && self.span_kind == b.span_kind
            && self.status_code == b.status_code
            && self.synthetics == b.synthetics
            && self.peer_tags_hash == b.peer_tags_hash
            && self.is_trace_root == b.is_trace_root
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Default)]
/// Represents a span aggregation key with owned data
///
/// To be able to use BorrowedAggregationKey to index into a stats bucket hashmap two
/// conditions must stay true:
/// * Hashing an owned key derived from a borrowed key should produce the same hash as hashing the
///   borrowed key
/// * Running the Equivalent trait on an owned key derived from a borrowed key should produce true
pub(super) struct OwnedAggregationKey {
    pub(super) payload: PayloadAggregationKey,
    pub(super) bucket: BucketsAggregationKey,
}

impl From<&BorrowedAggregationKey<'_>> for OwnedAggregationKey {
    fn from(value: &BorrowedAggregationKey<'_>) -> Self {
        OwnedAggregationKey {
            payload: PayloadAggregationKey {
                env: value.env.to_owned(),
                hostname: value.hostname.to_owned(),
                version: value.version.to_owned(),
                container_id: value.container_id.to_owned(),
                git_commit_sha: value.git_commit_sha.to_owned(),
                image_tag: value.image_tag.to_owned(),
            },
            bucket: BucketsAggregationKey {
                service: value.service.to_owned(),
                name: value.name.to_owned(),
                resource: value.resource.to_owned(),
                r#type: value.span_type.to_owned(),
                span_kind: value.span_kind.to_owned(),
                status_code: value.status_code,
                synthetics: value.synthetics,
                peer_tags_hash: value.peer_tags_hash,
                is_trace_root: value.is_trace_root,
            },
        }
    }
}

impl<'a> BorrowedAggregationKey<'a> {
    /// Return the aggregation key of a span in the given payload context.
    ///
    /// `peer_tags` are the peer tags of the span formatted as `name:value`, they are only
    /// included in the key through their hash.
    pub(super) fn from_span(
        span: &'a pb::Span,
        ctx: &PayloadContext<'a>,
        peer_tags: &[String],
    ) -> Self {
        let span_kind = span
            .meta
            .get(TAG_SPANKIND)
            .map(|s| s.as_str())
            .filter(|kind| is_span_kind_eligible(kind))
            .unwrap_or_default();
        Self {
            env: ctx.env,
            hostname: ctx.hostname,
            version: ctx.version,
            container_id: ctx.container_id,
            git_commit_sha: ctx.git_commit_sha,
            image_tag: ctx.image_tag,
            service: &span.service,
            name: &span.name,
            resource: &span.resource,
            span_type: &span.r#type,
            span_kind,
            status_code: get_status_code(span),
            synthetics: is_synthetics(ctx.origin),
            peer_tags_hash: peer_tags_hash(peer_tags),
            is_trace_root: pb::Trilean::from(span.parent_id == 0),
        }
    }
}

/// The stats computed from a group of span with the same aggregation key.
///
/// Counts are weighted by the sampling rate of the trace and rounded when flushed.
#[derive(Clone)]
pub(super) struct GroupedStats {
    hits: f64,
    top_level_hits: f64,
    errors: f64,
    duration: f64,
    ok_summary: DDSketch,
    error_summary: DDSketch,
    peer_tags: Vec<String>,
}

impl Default for GroupedStats {
    fn default() -> Self {
        GroupedStats {
            hits: 0.0,
            top_level_hits: 0.0,
            errors: 0.0,
            duration: 0.0,
            ok_summary: DDSketch::new(SketchConfig::defaults()),
            error_summary: DDSketch::new(SketchConfig::defaults()),
            peer_tags: Vec::new(),
        }
    }
}

impl GroupedStats {
    /// Update the stats of a GroupedStats by inserting a span.
    fn insert(&mut self, span: &pb::Span, weight: f64) {
        let duration = span.duration.max(0) as f64;
        self.hits += weight;
        self.duration += weight * duration;

        if span.error != 0 {
            self.errors += weight;
            self.error_summary.add(duration);
        } else {
            self.ok_summary.add(duration);
        }
        if has_top_level(span) {
            self.top_level_hits += weight;
        }
    }
}

fn encode_sketch(sketch: &DDSketch) -> Vec<u8> {
    match rmp_serde::to_vec(sketch) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(%err, "Failed to encode latency summary");
            Vec::new()
        }
    }
}

/// Create a ClientGroupedStats struct based on the given aggregation key and GroupedStats
fn encode_grouped_stats(key: BucketsAggregationKey, group: GroupedStats) -> pb::ClientGroupedStats {
    pb::ClientGroupedStats {
        service: key.service,
        name: key.name,
        resource: key.resource,
        http_status_code: key.status_code,
        r#type: key.r#type,
        db_type: String::new(),

        hits: group.hits.round() as u64,
        errors: group.errors.round() as u64,
        duration: group.duration.round() as u64,
        top_level_hits: group.top_level_hits.round() as u64,

        ok_summary: encode_sketch(&group.ok_summary),
        error_summary: encode_sketch(&group.error_summary),
        synthetics: key.synthetics,
        span_kind: key.span_kind,

        peer_tags: group.peer_tags,
        is_trace_root: key.is_trace_root.into(),
    }
}

/// A time bucket used for stats aggregation. It stores a map of GroupedStats storing the stats of
/// spans aggregated on their payload and bucket keys.
#[derive(Clone)]
pub(super) struct StatsBucket {
    data: HashMap<OwnedAggregationKey, GroupedStats>,
    start: u64,
}

impl StatsBucket {
    /// Return a new StatsBucket starting at the given timestamp
    pub(super) fn new(start_timestamp: u64) -> Self {
        Self {
            data: HashMap::new(),
            start: start_timestamp,
        }
    }

    /// Insert a span in the group of its aggregation key, creating the group if it does not
    /// exist.
    pub(super) fn insert(
        &mut self,
        span: &pb::Span,
        ctx: &PayloadContext<'_>,
        peer_tag_keys: &[String],
    ) {
        let peer_tags = format_peer_tags(&matching_peer_tags(span, peer_tag_keys));
        let key = BorrowedAggregationKey::from_span(span, ctx, &peer_tags);
        let group = self.data.entry_ref(&key).or_default();
        if group.peer_tags.is_empty() && !peer_tags.is_empty() {
            group.peer_tags = peer_tags;
        }
        group.insert(span, ctx.weight);
    }

    /// Return true if the bucket contains stats for the container
    pub(super) fn has_container(&self, container_id: &str) -> bool {
        self.data
            .keys()
            .any(|k| k.payload.container_id == container_id)
    }

    /// Consume the bucket and return one ClientStatsBucket per payload key.
    /// `bucket_duration` is the size of buckets for the concentrator containing the bucket.
    pub(super) fn flush(
        self,
        bucket_duration: u64,
    ) -> BTreeMap<PayloadAggregationKey, pb::ClientStatsBucket> {
        let mut buckets: BTreeMap<PayloadAggregationKey, pb::ClientStatsBucket> = BTreeMap::new();
        for (key, group) in self.data {
            buckets
                .entry(key.payload)
                .or_insert_with(|| pb::ClientStatsBucket {
                    start: self.start,
                    duration: bucket_duration,
                    stats: Vec::new(),
                    // Agent-only field
                    agent_time_shift: 0,
                })
                .stats
                .push(Some(encode_grouped_stats(key.bucket, group)));
        }
        buckets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::collections::HashMap as StdHashMap;
    use std::hash::{Hash, Hasher};

    fn hash_of<T: Hash>(value: &T) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        hasher.finish()
    }

    fn context() -> PayloadContext<'static> {
        PayloadContext {
            env: "prod",
            hostname: "host",
            version: "v1",
            container_id: "cid",
            git_commit_sha: "abc",
            image_tag: "v1.0",
            origin: "synthetics-browser",
            weight: 1.0,
            container_tags: &[],
        }
    }

    #[test]
    fn test_borrowed_and_owned_keys_hash_equally() {
        let keys = vec!["peer.service".to_string()];
        let span = pb::Span {
            service: "service".to_string(),
            name: "op".to_string(),
            resource: "res".to_string(),
            r#type: "web".to_string(),
            parent_id: 2,
            meta: StdHashMap::from([
                ("span.kind".to_string(), "client".to_string()),
                ("peer.service".to_string(), "remote-service".to_string()),
                ("http.status_code".to_string(), "500".to_string()),
            ]),
            ..Default::default()
        };
        let ctx = context();
        let peer_tags = format_peer_tags(&matching_peer_tags(&span, &keys));
        let borrowed = BorrowedAggregationKey::from_span(&span, &ctx, &peer_tags);
        let owned = OwnedAggregationKey::from(&borrowed);

        assert_eq!(hash_of(&borrowed), hash_of(&owned));
        assert!(hashbrown::Equivalent::equivalent(&borrowed, &owned));
        assert_eq!(
            owned.bucket,
            BucketsAggregationKey {
                service: "service".to_string(),
                name: "op".to_string(),
                resource: "res".to_string(),
                r#type: "web".to_string(),
                span_kind: "client".to_string(),
                status_code: 500,
                synthetics: true,
                peer_tags_hash: 3430395298086625290,
                is_trace_root: pb::Trilean::False,
            }
        );
        assert_eq!(owned.payload.container_id, "cid");
    }

    #[test]
    fn test_ineligible_span_kind_is_not_in_key() {
        let span = pb::Span {
            meta: StdHashMap::from([("span.kind".to_string(), "internal".to_string())]),
            ..Default::default()
        };
        let ctx = context();
        let key = OwnedAggregationKey::from(&BorrowedAggregationKey::from_span(&span, &ctx, &[]));
        assert_eq!(key.bucket.span_kind, "");
        assert_eq!(key.bucket.is_trace_root, pb::Trilean::True);
    }

    #[test]
    fn test_weighted_insert() {
        let mut bucket = StatsBucket::new(100);
        let ctx = PayloadContext {
            weight: 2.5,
            ..context()
        };
        let ok = pb::Span {
            service: "s".to_string(),
            duration: 10,
            metrics: StdHashMap::from([("_top_level".to_string(), 1.0)]),
            ..Default::default()
        };
        let err = pb::Span {
            error: 1,
            ..ok.clone()
        };
        bucket.insert(&ok, &ctx, &[]);
        bucket.insert(&err, &ctx, &[]);
        assert!(bucket.has_container("cid"));
        assert!(!bucket.has_container("other"));

        let flushed = bucket.flush(10);
        assert_eq!(flushed.len(), 1);
        let (payload_key, stats_bucket) = flushed.into_iter().next().unwrap();
        assert_eq!(payload_key.env, "prod");
        assert_eq!(stats_bucket.start, 100);
        assert_eq!(stats_bucket.duration, 10);
        let gs = stats_bucket.stats[0].as_ref().unwrap();
        assert_eq!(gs.hits, 5);
        assert_eq!(gs.errors, 3); // 2.5 rounded
        assert_eq!(gs.duration, 50);
        assert_eq!(gs.top_level_hits, 5);
        assert!(!gs.ok_summary.is_empty());
        assert!(!gs.error_summary.is_empty());
    }
}
