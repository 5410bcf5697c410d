// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire types of the stats intake and the span model consumed by the concentrator.
//!
//! Field names are serialized in PascalCase, matching the payloads tracers send on
//! `/v0.6/stats` and the payloads the agent sends to the intake.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Trilean is an expanded boolean type that is meant to differentiate between being unset and
/// false.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(i32)]
pub enum Trilean {
    #[default]
    NotSet = 0,
    True = 1,
    False = 2,
}

impl Trilean {
    /// Convert an integer read on the wire, unknown values are considered as not set.
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => Trilean::True,
            2 => Trilean::False,
            _ => Trilean::NotSet,
        }
    }

    pub fn as_str_name(&self) -> &'static str {
        match self {
            Trilean::NotSet => "NOT_SET",
            Trilean::True => "TRUE",
            Trilean::False => "FALSE",
        }
    }
}

impl From<bool> for Trilean {
    fn from(value: bool) -> Self {
        if value {
            Trilean::True
        } else {
            Trilean::False
        }
    }
}

impl From<Trilean> for i32 {
    fn from(value: Trilean) -> Self {
        value as i32
    }
}

/// StatsPayload is the payload used to send stats from the agent to the backend.
#[derive(Deserialize, Serialize, Clone, PartialEq, Debug, Default)]
#[serde(rename_all = "PascalCase")]
pub struct StatsPayload {
    #[serde(default)]
    pub agent_hostname: String,
    #[serde(default)]
    pub agent_env: String,
    #[serde(default)]
    pub stats: Vec<ClientStatsPayload>,
    #[serde(default)]
    pub agent_version: String,
    #[serde(default)]
    pub client_computed: bool,
    /// splitPayload indicates if the payload is actually one of several payloads split out from a
    /// larger payload.
    #[serde(default)]
    pub split_payload: bool,
}

/// ClientStatsPayload is the first layer of span stats aggregation. It is also
/// the payload sent by tracers to the agent when stats in tracer are enabled.
#[derive(Deserialize, Serialize, Clone, PartialEq, Debug, Default)]
#[serde(rename_all = "PascalCase")]
pub struct ClientStatsPayload {
    /// Hostname is the tracer hostname. It's extracted from spans with "_dd.hostname" meta
    /// or set by tracer stats payload when hostname reporting is enabled.
    #[serde(default)]
    pub hostname: String,
    /// env tag set on spans or in the tracers, used for aggregation
    #[serde(default)]
    pub env: String,
    /// version tag set on spans or in the tracers, used for aggregation
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub stats: Vec<ClientStatsBucket>,
    /// informative field not used for aggregation
    #[serde(default)]
    pub lang: String,
    /// informative field not used for aggregation
    #[serde(default)]
    pub tracer_version: String,
    /// used on stats payloads sent by the tracer to identify uniquely a message
    #[serde(default)]
    #[serde(rename = "RuntimeID")]
    pub runtime_id: String,
    /// used on stats payloads sent by the tracer to identify uniquely a message
    #[serde(default)]
    pub sequence: u64,
    /// AgentAggregation is set by the agent on tracer payloads modified by the agent aggregation
    /// layer. Characterizes counts only and distributions only payloads.
    #[serde(default)]
    pub agent_aggregation: String,
    /// Service is the main service of the tracer.
    #[serde(default)]
    pub service: String,
    /// ContainerID specifies the origin container ID. It is meant to be populated by the client
    /// and may be enhanced by the agent to ensure it is unique.
    #[serde(default)]
    #[serde(rename = "ContainerID")]
    pub container_id: String,
    /// Tags specifies a set of tags obtained from the orchestrator (where applicable) using the
    /// specified containerID.
    #[serde(default)]
    pub tags: Vec<String>,
    /// The git commit SHA is obtained from a trace, where it may be set through a tracer <->
    /// source code integration.
    #[serde(default)]
    pub git_commit_sha: String,
    /// The image tag is obtained from a container's set of tags.
    #[serde(default)]
    pub image_tag: String,
}

/// ClientStatsBucket is a time bucket containing aggregated stats.
#[derive(Deserialize, Serialize, Clone, PartialEq, Debug, Default)]
#[serde(rename_all = "PascalCase")]
pub struct ClientStatsBucket {
    /// bucket start in nanoseconds
    #[serde(default)]
    pub start: u64,
    /// bucket duration in nanoseconds
    #[serde(default)]
    pub duration: u64,
    /// Grouped stats of the bucket. Payloads sent by buggy clients may contain nil entries.
    #[serde(default)]
    pub stats: Vec<Option<ClientGroupedStats>>,
    /// AgentTimeShift is the shift applied by the agent stats aggregator on bucket start
    /// when the received bucket start is outside of the agent aggregation window
    #[serde(default)]
    pub agent_time_shift: i64,
}

/// ClientGroupedStats aggregate stats on spans grouped by service, name, resource, status_code,
/// type
#[derive(Deserialize, Serialize, Clone, PartialEq, Debug, Default)]
#[serde(rename_all = "PascalCase")]
pub struct ClientGroupedStats {
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    #[serde(rename = "HTTPStatusCode")]
    pub http_status_code: u32,
    #[serde(default)]
    pub r#type: String,
    /// db_type might be used in the future to help in the obfuscation step
    #[serde(default)]
    #[serde(rename = "DBType")]
    pub db_type: String,
    /// count of all spans aggregated in the groupedstats
    #[serde(default)]
    pub hits: u64,
    /// count of error spans aggregated in the groupedstats
    #[serde(default)]
    pub errors: u64,
    /// total duration in nanoseconds of spans aggregated in the bucket
    #[serde(default)]
    pub duration: u64,
    /// ddsketch summary of ok spans latencies
    #[serde(default)]
    #[serde(with = "serde_bytes")]
    pub ok_summary: Vec<u8>,
    /// ddsketch summary of error spans latencies
    #[serde(default)]
    #[serde(with = "serde_bytes")]
    pub error_summary: Vec<u8>,
    /// set to true on spans generated by synthetics traffic
    #[serde(default)]
    pub synthetics: bool,
    /// count of top level spans aggregated in the groupedstats
    #[serde(default)]
    pub top_level_hits: u64,
    /// value of the span.kind tag on the span
    #[serde(default)]
    pub span_kind: String,
    /// peer_tags are supplementary tags that further describe a peer entity
    /// E.g., `grpc.target` to describe the name of a gRPC peer, or `db.hostname` to describe the
    /// name of peer DB
    #[serde(default)]
    pub peer_tags: Vec<String>,
    /// this field's value is equal to span's ParentID == 0, see [`Trilean`].
    #[serde(default)]
    pub is_trace_root: i32,
}

impl ClientGroupedStats {
    /// Return the trace root flag as a [`Trilean`]
    pub fn trace_root(&self) -> Trilean {
        Trilean::from_i32(self.is_trace_root)
    }
}

/// A span as seen by the concentrator once a trace has been decoded.
#[derive(Deserialize, Serialize, Clone, PartialEq, Debug, Default)]
pub struct Span {
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub trace_id: u64,
    #[serde(default)]
    pub span_id: u64,
    #[serde(default)]
    pub parent_id: u64,
    /// start time in nanoseconds since the unix epoch
    #[serde(default)]
    pub start: i64,
    /// duration in nanoseconds
    #[serde(default)]
    pub duration: i64,
    #[serde(default)]
    pub error: i32,
    #[serde(default)]
    pub meta: HashMap<String, String>,
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
    #[serde(default)]
    pub r#type: String,
}

/// A list of spans sharing the same trace id, with the chunk level attributes.
#[derive(Deserialize, Serialize, Clone, PartialEq, Debug, Default)]
pub struct TraceChunk {
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub origin: String,
    #[serde(default)]
    pub spans: Vec<Span>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub dropped_trace: bool,
}
