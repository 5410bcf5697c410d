// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Discovery of the services running on the host.
//!
//! Processes with open ports reported by the system-probe are tracked across collection cycles
//! and reported through start, heartbeat and stop events.

pub mod config;
pub mod discovery;
pub mod error;
pub mod model;
#[cfg(target_os = "linux")]
pub mod procfs;
pub mod system;

pub use config::DiscoveryConfig;
pub use discovery::ServiceDiscovery;
pub use error::{DiscoveryError, ErrorCode};
