// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! [`ProcessTable`] reading the Linux `/proc` filesystem.

use crate::system::{ProcStat, Process, ProcessTable};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const DEFAULT_PROC_PATH: &str = "/proc";

/// Index of `starttime` in the fields following the command name
const STAT_START_TIME_INDEX: usize = 19;

fn invalid_data(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

/// Parse the content of `/proc/<pid>/stat`.
///
/// The command name is enclosed in parentheses and may contain spaces or parentheses itself, the
/// fields are read after the last closing parenthesis.
fn parse_stat(content: &str) -> io::Result<ProcStat> {
    let open = content
        .find('(')
        .ok_or_else(|| invalid_data("missing command name"))?;
    let close = content
        .rfind(')')
        .filter(|close| *close > open)
        .ok_or_else(|| invalid_data("unterminated command name"))?;
    let start_time_ticks = content[close + 1..]
        .split_whitespace()
        .nth(STAT_START_TIME_INDEX)
        .ok_or_else(|| invalid_data("missing starttime field"))?
        .parse()
        .map_err(|_| invalid_data("invalid starttime field"))?;
    Ok(ProcStat { start_time_ticks })
}

/// Read the boot time from the content of `/proc/stat`
fn parse_boot_time(content: &str) -> io::Result<u64> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("btime "))
        .ok_or_else(|| invalid_data("missing btime"))?
        .trim()
        .parse()
        .map_err(|_| invalid_data("invalid btime"))
}

#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new(DEFAULT_PROC_PATH)
    }
}

impl ProcFs {
    /// Create a process table reading a proc filesystem mounted at `root`
    pub fn new(root: impl AsRef<Path>) -> Self {
        ProcFs {
            root: root.as_ref().to_path_buf(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcFsProcess {
    pid: i32,
    path: PathBuf,
}

impl Process for ProcFsProcess {
    fn pid(&self) -> i32 {
        self.pid
    }

    fn stat(&self) -> io::Result<ProcStat> {
        parse_stat(&fs::read_to_string(self.path.join("stat"))?)
    }
}

impl ProcessTable for ProcFs {
    type Process = ProcFsProcess;

    fn all_procs(&self) -> io::Result<Vec<ProcFsProcess>> {
        let mut procs = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<i32>().ok())
            else {
                continue;
            };
            procs.push(ProcFsProcess {
                pid,
                path: entry.path(),
            });
        }
        procs.sort_by_key(|p| p.pid);
        Ok(procs)
    }

    fn boot_time(&self) -> io::Result<u64> {
        parse_boot_time(&fs::read_to_string(self.root.join("stat"))?)
    }
}
