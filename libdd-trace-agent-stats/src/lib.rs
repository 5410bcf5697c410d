// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Agent side trace stats aggregation.
//!
//! This crate turns spans and stats payloads computed by tracers into time bucketed stats
//! payloads ready to be sent to the Datadog intake:
//! - [`span_concentrator::SpanConcentrator`] aggregates raw spans into buckets.
//! - [`concentrator::Concentrator`] owns a span concentrator and flushes it periodically.
//! - [`client_stats_aggregator::ClientStatsAggregator`] merges payloads computed by tracers,
//!   correcting their clock skew.

pub mod aggregation;
pub mod client_stats_aggregator;
pub mod codec;
pub mod concentrator;
pub mod config;
pub mod container_tags;
pub mod pb;
pub mod span_concentrator;
pub mod worker;
pub mod writer;

mod mutex;
mod time_utils;
