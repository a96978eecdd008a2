//! Resource accounting for one sandboxed run.
//!
//! The monitor is a two-state machine. It starts `Running`, and the first
//! limit violation or a call to `finish()` moves it to `Terminated` for good.
//! Once terminated by a violation, every later `check_limits()` returns the
//! same error again without re-measuring.

use std::time::{Duration, Instant};

use super::config::SandboxConfig;
use super::error::ResourceLimitError;

/// One observation of a running process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    /// Resident set size in bytes.
    pub memory_bytes: u64,
    pub open_files: u64,
}

/// Source of [`ResourceUsage`] samples for a sandboxed process tree.
pub trait ResourceProbe: Send + Sync + std::fmt::Debug {
    /// Usage summed over `leader`, every process in the process group it
    /// leads, and every descendant still attached to it. `None` once none of
    /// them is left or the platform has no data.
    fn sample(&self, leader: u32) -> Option<ResourceUsage>;
}

/// Reads `/proc/<pid>/stat`, `/proc/<pid>/status` and `/proc/<pid>/fd` for
/// every member of the sandbox's process tree.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcProbe;

impl ResourceProbe for ProcProbe {
    #[cfg(target_os = "linux")]
    fn sample(&self, leader: u32) -> Option<ResourceUsage> {
        let processes: Vec<ProcStat> = std::fs::read_dir("/proc")
            .ok()?
            .flatten()
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
            .filter_map(|pid| {
                let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
                parse_stat(pid, &stat)
            })
            .collect();

        let mut total: Option<ResourceUsage> = None;
        for pid in tree_members(leader, &processes) {
            if let Some(usage) = sample_process(pid) {
                let sum = total.get_or_insert_with(ResourceUsage::default);
                sum.memory_bytes += usage.memory_bytes;
                sum.open_files += usage.open_files;
            }
        }
        total
    }

    #[cfg(not(target_os = "linux"))]
    fn sample(&self, _leader: u32) -> Option<ResourceUsage> {
        None
    }
}

/// The fields of `/proc/<pid>/stat` the probe needs.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProcStat {
    pid: u32,
    ppid: u32,
    pgrp: u32,
}

/// `pid (comm) state ppid pgrp ...`; `comm` may itself contain `)` and
/// spaces, so fields are counted from the last `)`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_stat(pid: u32, stat: &str) -> Option<ProcStat> {
    let (_, rest) = stat.rsplit_once(')')?;
    let mut fields = rest.split_whitespace().skip(1);
    let ppid = fields.next()?.parse().ok()?;
    let pgrp = fields.next()?.parse().ok()?;
    Some(ProcStat { pid, ppid, pgrp })
}

/// `leader`, its process group, and its descendants (which may have moved
/// to a group of their own).
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn tree_members(leader: u32, processes: &[ProcStat]) -> Vec<u32> {
    let mut members: Vec<u32> = processes
        .iter()
        .filter(|p| p.pid == leader || p.pgrp == leader)
        .map(|p| p.pid)
        .collect();

    let mut frontier = vec![leader];
    while let Some(parent) = frontier.pop() {
        for child in processes.iter().filter(|p| p.ppid == parent) {
            if !members.contains(&child.pid) {
                members.push(child.pid);
            }
            if child.pid != parent {
                frontier.push(child.pid);
            }
        }
    }
    members
}

#[cfg(target_os = "linux")]
fn sample_process(pid: u32) -> Option<ResourceUsage> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    let memory_bytes = status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
        .unwrap_or(0);
    let open_files = std::fs::read_dir(format!("/proc/{pid}/fd"))
        .map(|entries| entries.count() as u64)
        .unwrap_or(0);

    Some(ResourceUsage {
        memory_bytes,
        open_files,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Running,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct ResourceMonitor {
    started: Instant,
    max_memory_bytes: u64,
    max_wall_time: Duration,
    max_open_files: u64,
    latest: ResourceUsage,
    peak: ResourceUsage,
    state: MonitorState,
    violation: Option<ResourceLimitError>,
}

impl ResourceMonitor {
    pub fn new(config: &SandboxConfig) -> Self {
        Self::with_start(config, Instant::now())
    }

    pub fn with_start(config: &SandboxConfig, started: Instant) -> Self {
        Self {
            started,
            max_memory_bytes: config.max_memory_bytes(),
            max_wall_time: config.wall_time(),
            max_open_files: config.max_open_files,
            latest: ResourceUsage::default(),
            peak: ResourceUsage::default(),
            state: MonitorState::Running,
            violation: None,
        }
    }

    /// Feeds a new sample. Ignored once terminated.
    pub fn record(&mut self, usage: ResourceUsage) {
        if self.state == MonitorState::Terminated {
            return;
        }
        self.latest = usage;
        self.peak.memory_bytes = self.peak.memory_bytes.max(usage.memory_bytes);
        self.peak.open_files = self.peak.open_files.max(usage.open_files);
    }

    pub fn check_limits(&mut self) -> Result<(), ResourceLimitError> {
        self.check_limits_at(Instant::now())
    }

    /// Compares the latest sample and elapsed time against the limits.
    pub fn check_limits_at(&mut self, now: Instant) -> Result<(), ResourceLimitError> {
        if self.state == MonitorState::Terminated {
            return match &self.violation {
                Some(violation) => Err(violation.clone()),
                None => Ok(()),
            };
        }

        let elapsed = now.saturating_duration_since(self.started);
        let violation = if self.latest.memory_bytes > self.max_memory_bytes {
            Some(ResourceLimitError::Memory {
                observed_bytes: self.latest.memory_bytes,
                limit_bytes: self.max_memory_bytes,
            })
        } else if elapsed > self.max_wall_time {
            Some(ResourceLimitError::WallTime {
                elapsed,
                limit: self.max_wall_time,
            })
        } else if self.latest.open_files > self.max_open_files {
            Some(ResourceLimitError::OpenFiles {
                observed: self.latest.open_files,
                limit: self.max_open_files,
            })
        } else {
            None
        };

        match violation {
            Some(violation) => {
                self.state = MonitorState::Terminated;
                self.violation = Some(violation.clone());
                Err(violation)
            }
            None => Ok(()),
        }
    }

    /// Normal completion. No effect if already terminated.
    pub fn finish(&mut self) {
        self.state = MonitorState::Terminated;
    }

    /// High-water marks across all recorded samples.
    pub fn peak(&self) -> ResourceUsage {
        self.peak
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn violation(&self) -> Option<&ResourceLimitError> {
        self.violation.as_ref()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}
