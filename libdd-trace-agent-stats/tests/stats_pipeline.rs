// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use libdd_trace_agent_stats::client_stats_aggregator::ClientStatsAggregator;
use libdd_trace_agent_stats::codec::{
    decode_client_stats_payload, encode_client_stats_payload, encode_stats_payload,
};
use libdd_trace_agent_stats::concentrator::{Concentrator, Input, ProcessedTrace};
use libdd_trace_agent_stats::config::StatsConfig;
use libdd_trace_agent_stats::pb;
use libdd_trace_agent_stats::writer::ChannelWriter;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn now() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(1_700_000_000)
}

fn config() -> StatsConfig {
    StatsConfig::default()
        .with_agent_env("prod")
        .with_agent_hostname("agent-host")
        .with_agent_version("7.60.0")
}

#[test]
fn test_tracer_payloads_are_merged() {
    let (writer, mut receiver) = ChannelWriter::channel(8);
    let aggregator = ClientStatsAggregator::new(&config(), Arc::new(writer), now()).unwrap();

    let payload = pb::ClientStatsPayload {
        hostname: "tracer-host".to_string(),
        env: "staging".to_string(),
        version: "1.2.3".to_string(),
        lang: "python".to_string(),
        stats: vec![pb::ClientStatsBucket {
            start: now().duration_since(UNIX_EPOCH).unwrap().as_nanos() as u64,
            duration: 10_000_000_000,
            stats: vec![Some(pb::ClientGroupedStats {
                service: "web".to_string(),
                name: "http.request".to_string(),
                resource: "GET /".to_string(),
                hits: 4,
                errors: 1,
                duration: 400,
                ok_summary: vec![1, 2],
                ..Default::default()
            })],
            agent_time_shift: 0,
        }],
        ..Default::default()
    };
    let bytes = encode_client_stats_payload(&payload).unwrap();
    let decoded = decode_client_stats_payload(&bytes).unwrap();
    assert_eq!(decoded, payload);

    aggregator.add_at(now(), decoded.clone());
    assert!(receiver.try_recv().is_err());
    aggregator.add_at(now(), decoded);

    let distributions = receiver.try_recv().unwrap();
    assert!(distributions.client_computed);
    assert_eq!(distributions.agent_hostname, "agent-host");
    assert_eq!(distributions.stats.len(), 2);
    for p in &distributions.stats {
        assert_eq!(p.agent_aggregation, "distributions");
        assert_eq!(p.lang, "python");
        let gs = p.stats[0].stats[0].as_ref().unwrap();
        assert_eq!(gs.hits, 0);
        assert_eq!(gs.ok_summary, vec![1, 2]);
    }

    aggregator.flush_all();
    let counts = receiver.try_recv().unwrap();
    assert_eq!(counts.stats.len(), 1);
    let p = &counts.stats[0];
    assert_eq!(p.agent_aggregation, "counts");
    assert_eq!(p.env, "staging");
    assert_eq!(p.lang, "");
    let gs = p.stats[0].stats[0].as_ref().unwrap();
    assert_eq!((gs.hits, gs.errors, gs.duration), (8, 2, 800));
    assert!(gs.ok_summary.is_empty());

    assert!(!encode_stats_payload(&counts).unwrap().is_empty());
    assert!(receiver.try_recv().is_err());
}

#[test]
fn test_concentrator_payload_is_encodable() {
    let (writer, _receiver) = ChannelWriter::channel(1);
    let concentrator = Concentrator::new(&config(), Arc::new(writer), now()).unwrap();
    let end = now().duration_since(UNIX_EPOCH).unwrap().as_nanos() as i64;
    let root = pb::Span {
        service: "web".to_string(),
        name: "http.request".to_string(),
        resource: "GET /".to_string(),
        span_id: 1,
        start: end - 1_000,
        duration: 1_000,
        metrics: HashMap::from([("_top_level".to_string(), 1.0)]),
        ..Default::default()
    };
    let mut trace = ProcessedTrace::new(pb::TraceChunk {
        spans: vec![root],
        ..Default::default()
    });
    trace.tracer_env = "staging".to_string();
    concentrator.add(&Input {
        traces: vec![trace],
        container_id: String::new(),
        container_tags: vec![],
    });

    let payload = concentrator.flush_now(now(), true).unwrap();
    assert!(!payload.client_computed);
    assert_eq!(payload.stats[0].env, "staging");
    let gs = payload.stats[0].stats[0].stats[0].as_ref().unwrap();
    assert_eq!(gs.hits, 1);
    assert_eq!(gs.top_level_hits, 1);
    assert!(!encode_stats_payload(&payload).unwrap().is_empty());
}
