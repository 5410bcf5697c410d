// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! MessagePack encoding of stats payloads.

use crate::pb;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("error deserializing client stats payload: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("error serializing stats payload: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
}

/// Decode a stats payload sent by a tracer.
///
/// Nil grouped stats are kept as `None` entries and skipped later by the aggregator.
pub fn decode_client_stats_payload(data: &[u8]) -> Result<pb::ClientStatsPayload, CodecError> {
    let payload: pb::ClientStatsPayload = rmp_serde::from_slice(data)?;
    if payload.stats.is_empty() {
        debug!("Empty trace stats payload received, but this is okay");
    }
    Ok(payload)
}

/// Encode a payload with named fields, as expected by the stats intake.
pub fn encode_stats_payload(payload: &pb::StatsPayload) -> Result<Vec<u8>, CodecError> {
    Ok(rmp_serde::to_vec_named(payload)?)
}

/// Encode a client payload with named fields, as sent by tracers.
pub fn encode_client_stats_payload(
    payload: &pb::ClientStatsPayload,
) -> Result<Vec<u8>, CodecError> {
    Ok(rmp_serde::to_vec_named(payload)?)
}
