// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::{self, Duration, SystemTime};

/// Return a Duration between t and the unix epoch
/// If t is before the unix epoch return 0
pub(crate) fn system_time_to_unix_duration(t: SystemTime) -> Duration {
    t.duration_since(time::UNIX_EPOCH)
        .unwrap_or(Duration::from_nanos(0))
}

/// Return the number of nanoseconds between t and the unix epoch
#[inline]
pub(crate) fn unix_nanos(t: SystemTime) -> u64 {
    system_time_to_unix_duration(t).as_nanos() as u64
}

/// Align a timestamp on the start of a bucket
#[inline]
pub(crate) fn align_timestamp(t: u64, bucket_size: u64) -> u64 {
    t - (t % bucket_size)
}
