// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Aggregation keys shared by the span concentrator and the client stats aggregator.
//!
//! Stats are grouped on two levels: the [`PayloadAggregationKey`] selects the outgoing client
//! payload and the [`BucketsAggregationKey`] selects the grouped stats within a time bucket.
//! Peer tags are folded in the bucket key as a hash to bound its size.

use crate::pb;
use std::hash::Hasher;

pub(crate) const TAG_STATUS_CODE: &str = "http.status_code";
pub(crate) const TAG_SPANKIND: &str = "span.kind";
pub(crate) const TAG_SYNTHETICS: &str = "synthetics";
pub(crate) const METRIC_TOP_LEVEL: &str = "_top_level";
pub(crate) const METRIC_MEASURED: &str = "_dd.measured";
pub(crate) const METRIC_PARTIAL_VERSION: &str = "_dd.partial_version";

/// Span kinds for which stats can be computed when computing stats by span kind is enabled.
pub const KIND_SERVER: &str = "server";
pub const KIND_CLIENT: &str = "client";
pub const KIND_PRODUCER: &str = "producer";
pub const KIND_CONSUMER: &str = "consumer";

/// Payload level dimensions of the aggregation.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct PayloadAggregationKey {
    pub env: String,
    pub hostname: String,
    pub version: String,
    pub container_id: String,
    pub git_commit_sha: String,
    pub image_tag: String,
}

impl From<&pb::ClientStatsPayload> for PayloadAggregationKey {
    fn from(p: &pb::ClientStatsPayload) -> Self {
        PayloadAggregationKey {
            env: p.env.clone(),
            hostname: p.hostname.clone(),
            version: p.version.clone(),
            container_id: p.container_id.clone(),
            git_commit_sha: p.git_commit_sha.clone(),
            image_tag: p.image_tag.clone(),
        }
    }
}

/// Dimensions used to group stats within a time bucket.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct BucketsAggregationKey {
    pub service: String,
    pub name: String,
    pub resource: String,
    pub r#type: String,
    pub span_kind: String,
    pub status_code: u32,
    pub synthetics: bool,
    pub peer_tags_hash: u64,
    pub is_trace_root: pb::Trilean,
}

impl From<&pb::ClientGroupedStats> for BucketsAggregationKey {
    fn from(gs: &pb::ClientGroupedStats) -> Self {
        BucketsAggregationKey {
            service: gs.service.clone(),
            name: gs.name.clone(),
            resource: gs.resource.clone(),
            r#type: gs.r#type.clone(),
            span_kind: gs.span_kind.clone(),
            status_code: gs.http_status_code,
            synthetics: gs.synthetics,
            peer_tags_hash: peer_tags_hash(&gs.peer_tags),
            is_trace_root: gs.trace_root(),
        }
    }
}

/// Return true if stats can be computed for a span of this kind
pub fn is_span_kind_eligible(span_kind: &str) -> bool {
    [KIND_SERVER, KIND_CONSUMER, KIND_CLIENT, KIND_PRODUCER]
        .iter()
        .any(|k| span_kind.eq_ignore_ascii_case(k))
}

/// Return true if a span of this kind can carry peer tags. Server spans describe the service
/// itself and never get a peer dimension.
pub fn is_peer_tags_eligible(span_kind: &str) -> bool {
    [KIND_CLIENT, KIND_PRODUCER, KIND_CONSUMER]
        .iter()
        .any(|k| span_kind.eq_ignore_ascii_case(k))
}

/// Compute the FNV-1a 64 hash of an ordered list of `name:value` peer tags.
///
/// Tags are separated by a zero byte and are not sorted, the caller controls the order. An empty
/// list hashes to 0.
pub fn peer_tags_hash<S: AsRef<str>>(tags: &[S]) -> u64 {
    if tags.is_empty() {
        return 0;
    }
    let mut hasher = fnv::FnvHasher::default();
    for (i, tag) in tags.iter().enumerate() {
        if i > 0 {
            hasher.write(&[0]);
        }
        hasher.write(tag.as_ref().as_bytes());
    }
    hasher.finish()
}

/// Return the peer tags of a span as `(name, value)` pairs in the order of `peer_tag_keys`.
///
/// Tags missing from the span or with an empty value are skipped. Spans whose kind can't carry
/// peer tags always return an empty list.
pub fn matching_peer_tags<'a>(
    span: &'a pb::Span,
    peer_tag_keys: &'a [String],
) -> Vec<(&'a str, &'a str)> {
    if peer_tag_keys.is_empty() {
        return vec![];
    }
    let span_kind = span.meta.get(TAG_SPANKIND).map(|s| s.as_str()).unwrap_or("");
    if !is_peer_tags_eligible(span_kind) {
        return vec![];
    }
    peer_tag_keys
        .iter()
        .filter_map(|key| {
            let value = span.meta.get(key)?;
            if value.is_empty() {
                return None;
            }
            Some((key.as_str(), value.as_str()))
        })
        .collect()
}

/// Format peer tags as `name:value` strings
pub fn format_peer_tags(peer_tags: &[(&str, &str)]) -> Vec<String> {
    peer_tags.iter().map(|(k, v)| format!("{k}:{v}")).collect()
}

/// Return the status code of a span based on the metrics and meta tags.
///
/// The metric wins over the meta tag, an unparsable meta tag is considered as 0.
pub fn get_status_code(span: &pb::Span) -> u32 {
    if let Some(status_code) = span.metrics.get(TAG_STATUS_CODE) {
        *status_code as u32
    } else if let Some(status_code) = span.meta.get(TAG_STATUS_CODE) {
        status_code.parse().unwrap_or(0)
    } else {
        0
    }
}

/// Return true if the origin of the trace is a synthetics test
pub fn is_synthetics(origin: &str) -> bool {
    origin.starts_with(TAG_SYNTHETICS)
}

/// Return true if the span has been marked as top-level
pub fn has_top_level(span: &pb::Span) -> bool {
    span.metrics
        .get(METRIC_TOP_LEVEL)
        .is_some_and(|v| *v == 1.0)
}

/// Return true if the span has been marked as measured
pub fn is_measured(span: &pb::Span) -> bool {
    span.metrics.get(METRIC_MEASURED).is_some_and(|v| *v == 1.0)
}

/// Return true if the span is a partial snapshot of a long running span
pub fn is_partial_snapshot(span: &pb::Span) -> bool {
    span.metrics
        .get(METRIC_PARTIAL_VERSION)
        .is_some_and(|v| *v >= 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn peer_tag_keys() -> Vec<String> {
        vec![
            "db.instance".to_string(),
            "db.system".to_string(),
            "peer.service".to_string(),
        ]
    }

    #[test]
    fn test_peer_tags_hash_values() {
        assert_eq!(peer_tags_hash::<&str>(&[]), 0);
        assert_eq!(
            peer_tags_hash(&["peer.service:remote-service"]),
            3430395298086625290
        );
        assert_eq!(
            peer_tags_hash(&[
                "db.instance:i-1234",
                "db.system:postgres",
                "peer.service:remote-service"
            ]),
            9894752672193411515
        );
        assert_eq!(
            peer_tags_hash(&["messaging.destination:topic-foo", "messaging.system:kafka"]),
            0xf5eeb51fbe7929b4
        );
    }

    #[test]
    fn test_peer_tags_hash_is_order_sensitive() {
        let a = peer_tags_hash(&["db.system:postgres", "db.instance:i-1234"]);
        let b = peer_tags_hash(&["db.instance:i-1234", "db.system:postgres"]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_matching_peer_tags() {
        let keys = peer_tag_keys();
        let span = pb::Span {
            meta: HashMap::from([
                ("span.kind".to_string(), "client".to_string()),
                ("peer.service".to_string(), "remote-service".to_string()),
            ]),
            ..Default::default()
        };
        let tags = matching_peer_tags(&span, &keys);
        assert_eq!(tags, vec![("peer.service", "remote-service")]);
        let formatted = format_peer_tags(&tags);
        assert_eq!(formatted, vec!["peer.service:remote-service"]);
        assert_eq!(peer_tags_hash(&formatted), 3430395298086625290);
    }

    #[test]
    fn test_matching_peer_tags_empty_values() {
        let keys = peer_tag_keys();
        let span = pb::Span {
            meta: HashMap::from([
                ("span.kind".to_string(), "producer".to_string()),
                ("db.instance".to_string(), "".to_string()),
                ("peer.service".to_string(), "".to_string()),
            ]),
            ..Default::default()
        };
        let tags = matching_peer_tags(&span, &keys);
        assert!(tags.is_empty());
        assert_eq!(peer_tags_hash(&format_peer_tags(&tags)), 0);
    }

    #[test]
    fn test_matching_peer_tags_by_kind() {
        let keys = peer_tag_keys();
        for (kind, expected) in [
            ("client", 1),
            ("CONSUMER", 1),
            ("Producer", 1),
            ("server", 0),
            ("internal", 0),
            ("", 0),
        ] {
            let span = pb::Span {
                meta: HashMap::from([
                    ("span.kind".to_string(), kind.to_string()),
                    ("peer.service".to_string(), "remote".to_string()),
                ]),
                ..Default::default()
            };
            assert_eq!(matching_peer_tags(&span, &keys).len(), expected, "{kind}");
        }
        let span = pb::Span {
            meta: HashMap::from([
                ("span.kind".to_string(), "client".to_string()),
                ("peer.service".to_string(), "remote".to_string()),
            ]),
            ..Default::default()
        };
        assert!(matching_peer_tags(&span, &[]).is_empty());
    }

    #[test]
    fn test_span_kind_eligibility() {
        for kind in ["server", "CLIENT", "Producer", "consumer"] {
            assert!(is_span_kind_eligible(kind), "{kind}");
        }
        for kind in ["internal", "", "serverless"] {
            assert!(!is_span_kind_eligible(kind), "{kind}");
        }
        assert!(!is_peer_tags_eligible("server"));
    }

    #[test]
    fn test_get_status_code() {
        let span = pb::Span {
            meta: HashMap::from([("http.status_code".to_string(), "200".to_string())]),
            metrics: HashMap::from([("http.status_code".to_string(), 302.0)]),
            ..Default::default()
        };
        assert_eq!(get_status_code(&span), 302);

        let span = pb::Span {
            meta: HashMap::from([("http.status_code".to_string(), "200".to_string())]),
            ..Default::default()
        };
        assert_eq!(get_status_code(&span), 200);

        let span = pb::Span {
            meta: HashMap::from([("http.status_code".to_string(), "x".to_string())]),
            ..Default::default()
        };
        assert_eq!(get_status_code(&span), 0);

        assert_eq!(get_status_code(&pb::Span::default()), 0);
    }

    #[test]
    fn test_span_markers() {
        let span = pb::Span {
            metrics: HashMap::from([
                ("_top_level".to_string(), 1.0),
                ("_dd.measured".to_string(), 1.0),
                ("_dd.partial_version".to_string(), 0.0),
            ]),
            ..Default::default()
        };
        assert!(has_top_level(&span));
        assert!(is_measured(&span));
        assert!(is_partial_snapshot(&span));
        assert!(!has_top_level(&pb::Span::default()));
        assert!(!is_partial_snapshot(&pb::Span::default()));
        assert!(is_synthetics("synthetics-browser"));
        assert!(!is_synthetics("rum"));
    }

    #[test]
    fn test_buckets_key_from_grouped_stats() {
        let gs = pb::ClientGroupedStats {
            service: "svc".to_string(),
            name: "op".to_string(),
            resource: "res".to_string(),
            http_status_code: 404,
            span_kind: "client".to_string(),
            peer_tags: vec!["peer.service:remote-service".to_string()],
            is_trace_root: pb::Trilean::False.into(),
            ..Default::default()
        };
        let key = BucketsAggregationKey::from(&gs);
        assert_eq!(
            key,
            BucketsAggregationKey {
                service: "svc".to_string(),
                name: "op".to_string(),
                resource: "res".to_string(),
                span_kind: "client".to_string(),
                status_code: 404,
                peer_tags_hash: 3430395298086625290,
                is_trace_root: pb::Trilean::False,
                ..Default::default()
            }
        );
    }
}
