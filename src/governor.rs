//! Resource governor: CPU and memory ceilings with requests equal to limits.
//!
//! Workers report usage through a [`UsageMeter`]; the controller subscribes to
//! it and asks [`ResourceGovernor::check`] after every update, so a breach is
//! seen as soon as it is reported. External processes are sampled from
//! `/proc` by [`ProcUsage`].

use std::sync::Arc;

use serde::Serialize;
use nix::unistd::{SysconfVar, sysconf};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::warn;

use crate::error::ConfigError;
use crate::state_machine::{Breach, Resource};

// USER_HZ on every mainstream Linux build; used only if sysconf fails.
const DEFAULT_CLOCK_TICKS_PER_SEC: u64 = 100;
const TICK_SLACK_PER_PROCESS: u64 = 2;

/// Memory in bytes and CPU in millicores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceCeilings {
    pub memory_bytes: u64,
    pub cpu_millis: u64,
}

impl ResourceCeilings {
    /// Parse Kubernetes-style quantities such as `8Gi` and `500m`.
    pub fn from_quantities(memory: &str, cpu: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            memory_bytes: parse_memory(memory)?,
            cpu_millis: parse_cpu(cpu)?,
        })
    }
}

/// Quality-of-service class a cluster scheduler derives from an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QosClass {
    Guaranteed,
    Burstable,
}

/// Resource requests and limits attached to the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceAllocation {
    pub requests: ResourceCeilings,
    pub limits: ResourceCeilings,
}

impl ResourceAllocation {
    /// Requests equal to limits: no preemption ambiguity, no throttling
    /// beyond the ceiling.
    pub fn guaranteed(ceilings: ResourceCeilings) -> Self {
        Self {
            requests: ceilings,
            limits: ceilings,
        }
    }

    pub fn qos_class(&self) -> QosClass {
        if self.requests == self.limits {
            QosClass::Guaranteed
        } else {
            QosClass::Burstable
        }
    }
}

/// Point-in-time resource usage of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct UsageSample {
    pub memory_bytes: u64,
    pub cpu_millis: u64,
}

/// Shared usage gauge written by the worker and observed by the controller.
#[derive(Debug, Clone)]
pub struct UsageMeter {
    tx: Arc<watch::Sender<UsageSample>>,
}

impl UsageMeter {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(UsageSample::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn record(&self, sample: UsageSample) {
        self.tx.send_replace(sample);
    }

    pub fn record_memory(&self, bytes: u64) {
        self.tx.send_modify(|s| s.memory_bytes = bytes);
    }

    pub fn current(&self) -> UsageSample {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<UsageSample> {
        self.tx.subscribe()
    }
}

impl Default for UsageMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// Enforces the ceilings of a guaranteed allocation.
#[derive(Debug, Clone)]
pub struct ResourceGovernor {
    allocation: ResourceAllocation,
}

impl ResourceGovernor {
    pub fn new(ceilings: ResourceCeilings) -> Self {
        Self {
            allocation: ResourceAllocation::guaranteed(ceilings),
        }
    }

    pub fn allocation(&self) -> ResourceAllocation {
        self.allocation
    }

    /// Compare a sample to the limits. Memory is checked first.
    pub fn check(&self, usage: UsageSample) -> Option<Breach> {
        let limits = self.allocation.limits;
        let breach = if usage.memory_bytes > limits.memory_bytes {
            Breach {
                resource: Resource::Memory,
                observed: usage.memory_bytes,
                ceiling: limits.memory_bytes,
            }
        } else if usage.cpu_millis > limits.cpu_millis {
            Breach {
                resource: Resource::Cpu,
                observed: usage.cpu_millis,
                ceiling: limits.cpu_millis,
            }
        } else {
            return None;
        };
        warn!(
            resource = %breach.resource,
            observed = breach.observed,
            ceiling = breach.ceiling,
            "Resource ceiling exceeded"
        );
        Some(breach)
    }
}

/// Samples a worker's process group from `/proc`.
///
/// Memory is the summed resident set of every process in the group. CPU is
/// the group's CPU time since the first sample divided by the wall time since
/// then, so only sustained use above the ceiling shows up as a breach.
#[derive(Debug)]
pub struct ProcUsage {
    pgid: u32,
    ticks_per_sec: u64,
    baseline: Option<(Instant, u64)>,
    peak_ticks: u64,
}

impl ProcUsage {
    pub fn new(pgid: u32) -> Self {
        Self {
            pgid,
            ticks_per_sec: clock_ticks_per_sec(),
            baseline: None,
            peak_ticks: 0,
        }
    }

    /// `None` once no process of the group is left or `/proc` is unavailable.
    pub fn sample(&mut self) -> Option<UsageSample> {
        let mut processes = 0u64;
        let mut memory_bytes = 0u64;
        let mut ticks = 0u64;
        for entry in std::fs::read_dir("/proc").ok()?.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };
            let Some(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat"))
                .ok()
                .and_then(|raw| parse_stat(&raw))
            else {
                continue;
            };
            if stat.pgrp != self.pgid {
                continue;
            }
            processes += 1;
            ticks += stat.ticks;
            memory_bytes += std::fs::read_to_string(format!("/proc/{pid}/status"))
                .ok()
                .and_then(|status| parse_vm_rss(&status))
                .unwrap_or(0);
        }
        if processes == 0 {
            return None;
        }

        // Processes reaped outside the group take their ticks with them.
        self.peak_ticks = self.peak_ticks.max(ticks);
        let now = Instant::now();
        let (since, base) = *self.baseline.get_or_insert((now, self.peak_ticks));
        let cpu_millis = sustained_cpu_millis(
            self.peak_ticks - base,
            processes,
            now.duration_since(since).as_millis() as u64,
            self.ticks_per_sec,
        );

        Some(UsageSample {
            memory_bytes,
            cpu_millis,
        })
    }
}

/// Kernel clock ticks per second for `/proc/<pid>/stat` times.
fn clock_ticks_per_sec() -> u64 {
    match sysconf(SysconfVar::CLK_TCK) {
        Ok(Some(hz)) if hz > 0 => hz as u64,
        _ => DEFAULT_CLOCK_TICKS_PER_SEC,
    }
}

// Average millicores over `elapsed_ms`. utime and stime are each rounded to
// whole ticks, so every sampled process is allowed that much slack.
fn sustained_cpu_millis(ticks: u64, processes: u64, elapsed_ms: u64, ticks_per_sec: u64) -> u64 {
    if elapsed_ms == 0 || ticks_per_sec == 0 {
        return 0;
    }
    let counted = ticks.saturating_sub(processes * TICK_SLACK_PER_PROCESS);
    counted * 1000 * 1000 / ticks_per_sec / elapsed_ms
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kib = line
        .trim_start_matches("VmRSS:")
        .split_whitespace()
        .next()?
        .parse::<u64>()
        .ok()?;
    Some(kib * 1024)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProcStat {
    pgrp: u32,
    ticks: u64,
}

// pgrp is field 5, utime and stime are fields 14 and 15. The command name in
// field 2 may contain spaces, so count from the closing parenthesis.
fn parse_stat(stat: &str) -> Option<ProcStat> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let pgrp = fields.get(2)?.parse::<u32>().ok()?;
    let utime = fields.get(11)?.parse::<u64>().ok()?;
    let stime = fields.get(12)?.parse::<u64>().ok()?;
    Some(ProcStat {
        pgrp,
        ticks: utime + stime,
    })
}

/// Parse a memory quantity: plain bytes, decimal (`k`, `M`, `G`, `T`) or
/// binary (`Ki`, `Mi`, `Gi`, `Ti`) suffixes.
pub fn parse_memory(quantity: &str) -> Result<u64, ConfigError> {
    let q = quantity.trim();
    let invalid = || ConfigError::Quantity(quantity.to_string());
    let split = q.find(|c: char| !c.is_ascii_digit()).unwrap_or(q.len());
    let (digits, suffix) = q.split_at(split);
    let value: u64 = digits.parse().map_err(|_| invalid())?;
    let multiplier: u64 = match suffix {
        "" => 1,
        "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        _ => return Err(invalid()),
    };
    let bytes = value.checked_mul(multiplier).ok_or_else(invalid)?;
    if bytes == 0 {
        return Err(invalid());
    }
    Ok(bytes)
}

/// Parse a CPU quantity into millicores: `500m`, `2`, or `0.5`.
pub fn parse_cpu(quantity: &str) -> Result<u64, ConfigError> {
    let q = quantity.trim();
    let invalid = || ConfigError::Quantity(quantity.to_string());
    let millis = if let Some(m) = q.strip_suffix('m') {
        m.parse::<u64>().map_err(|_| invalid())?
    } else {
        let cores: f64 = q.parse().map_err(|_| invalid())?;
        if !cores.is_finite() || cores < 0.0 {
            return Err(invalid());
        }
        (cores * 1000.0).round() as u64
    };
    if millis == 0 {
        return Err(invalid());
    }
    Ok(millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor() -> ResourceGovernor {
        ResourceGovernor::new(ResourceCeilings::from_quantities("8Gi", "1").unwrap())
    }

    #[test]
    fn memory_quantities() {
        assert_eq!(parse_memory("8Gi").unwrap(), 8 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory("512Mi").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory("2G").unwrap(), 2_000_000_000);
        assert_eq!(parse_memory("1024").unwrap(), 1024);
        assert!(parse_memory("8GB").is_err());
        assert!(parse_memory("Gi").is_err());
        assert!(parse_memory("0").is_err());
    }

    #[test]
    fn cpu_quantities() {
        assert_eq!(parse_cpu("500m").unwrap(), 500);
        assert_eq!(parse_cpu("2").unwrap(), 2000);
        assert_eq!(parse_cpu("0.5").unwrap(), 500);
        assert!(parse_cpu("half").is_err());
        assert!(parse_cpu("0m").is_err());
        assert!(parse_cpu("-1").is_err());
    }

    #[test]
    fn allocation_is_guaranteed() {
        let allocation = governor().allocation();
        assert_eq!(allocation.requests, allocation.limits);
        assert_eq!(allocation.qos_class(), QosClass::Guaranteed);
    }

    #[test]
    fn usage_within_ceilings_passes() {
        let usage = UsageSample {
            memory_bytes: 8 * 1024 * 1024 * 1024,
            cpu_millis: 1000,
        };
        assert!(governor().check(usage).is_none());
    }

    #[test]
    fn memory_breach_detected() {
        let usage = UsageSample {
            memory_bytes: 8 * 1024 * 1024 * 1024 + 1,
            cpu_millis: 0,
        };
        let breach = governor().check(usage).unwrap();
        assert_eq!(breach.resource, Resource::Memory);
        assert_eq!(breach.ceiling, 8 * 1024 * 1024 * 1024);
    }

    #[test]
    fn memory_checked_before_cpu() {
        let usage = UsageSample {
            memory_bytes: u64::MAX,
            cpu_millis: u64::MAX,
        };
        assert_eq!(governor().check(usage).unwrap().resource, Resource::Memory);
    }

    #[test]
    fn cpu_breach_detected() {
        let usage = UsageSample {
            memory_bytes: 0,
            cpu_millis: 1500,
        };
        let breach = governor().check(usage).unwrap();
        assert_eq!(breach.resource, Resource::Cpu);
        assert_eq!(breach.observed, 1500);
    }

    #[tokio::test]
    async fn meter_notifies_subscribers() {
        let meter = UsageMeter::new();
        let mut rx = meter.subscribe();
        meter.record_memory(42);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().memory_bytes, 42);
        assert_eq!(meter.current().memory_bytes, 42);
    }

    #[test]
    fn vm_rss_parsing() {
        let status = "Name:\tpython\nVmPeak:\t  2048 kB\nVmRSS:\t  1536 kB\nThreads:\t4\n";
        assert_eq!(parse_vm_rss(status), Some(1536 * 1024));
        assert_eq!(parse_vm_rss("Name:\tkthreadd\n"), None);
    }

    #[test]
    fn stat_parsing_handles_spaces_in_name() {
        let stat = "1234 (my worker) S 1 1200 1200 0 -1 4194304 100 0 0 0 250 50 0 0 20 0 1 0";
        assert_eq!(
            parse_stat(stat),
            Some(ProcStat {
                pgrp: 1200,
                ticks: 300
            })
        );
        assert_eq!(parse_stat("1234 (truncated"), None);
    }

    #[test]
    fn sustained_cpu_conversion() {
        assert_eq!(sustained_cpu_millis(52, 1, 1000, 100), 500);
        assert_eq!(sustained_cpu_millis(2002, 1, 1000, 1000), 2000);
        assert_eq!(sustained_cpu_millis(10, 1, 0, 100), 0);
        assert_eq!(sustained_cpu_millis(1, 1, 1000, 100), 0);
    }

    #[test]
    fn one_core_with_rounding_stays_within_one_core() {
        // One busy process sampled over 100 ms, its two counters each rounded up.
        let usage = UsageSample {
            memory_bytes: 0,
            cpu_millis: sustained_cpu_millis(12, 1, 100, 100),
        };
        assert!(governor().check(usage).is_none());

        // Two busy processes in the group over a full second.
        let usage = UsageSample {
            memory_bytes: 0,
            cpu_millis: sustained_cpu_millis(200, 2, 1000, 100),
        };
        assert_eq!(governor().check(usage).unwrap().resource, Resource::Cpu);
    }

    #[test]
    fn clock_ticks_are_known() {
        assert!(clock_ticks_per_sec() > 0);
    }

    #[test]
    fn proc_usage_of_current_process_group() {
        if !cfg!(target_os = "linux") {
            return;
        }
        let pgid = nix::unistd::getpgrp().as_raw() as u32;
        let mut usage = ProcUsage::new(pgid);
        let sample = usage.sample().unwrap();
        assert!(sample.memory_bytes > 0);
        assert_eq!(sample.cpu_millis, 0);
    }

    #[test]
    fn proc_usage_of_missing_group_is_none() {
        if !cfg!(target_os = "linux") {
            return;
        }
        assert!(ProcUsage::new(u32::MAX).sample().is_none());
    }
}
