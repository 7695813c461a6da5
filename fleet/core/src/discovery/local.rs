//! Local Host Resources
//!
//! Reads the counters that describe this machine. Every reader degrades to
//! zero when its source is missing (non-Linux hosts, no GPU, sandboxed /proc).

use std::path::Path;

const MEMINFO_PATH: &str = "/proc/meminfo";
const LOADAVG_PATH: &str = "/proc/loadavg";
const KIB_PER_GIB: f64 = 1024.0 * 1024.0;
const MIB_PER_GIB: f64 = 1024.0;

/// Hardware and load counters of the local host
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct HostResources {
    /// Logical CPU cores
    pub cpu_cores: u32,
    /// Total memory in GiB
    pub memory_gb: f64,
    /// Sum of GPU memory across devices in GiB
    pub gpu_memory_gb: f64,
    /// One-minute load normalised to 0-100 by core count
    pub load_avg: f64,
}

impl HostResources {
    /// Collect the current counters
    pub async fn collect() -> Self {
        let cpu_cores = std::thread::available_parallelism()
            .map(|n| u32::try_from(n.get()).unwrap_or(u32::MAX))
            .unwrap_or(1);

        let memory_gb = read_to_string(MEMINFO_PATH)
            .await
            .and_then(|s| parse_meminfo(&s))
            .unwrap_or(0.0);

        let load_avg = read_to_string(LOADAVG_PATH)
            .await
            .and_then(|s| parse_loadavg(&s, cpu_cores))
            .unwrap_or(0.0);

        let gpu_memory_gb = query_gpu_memory().await;

        Self {
            cpu_cores,
            memory_gb,
            gpu_memory_gb,
            load_avg,
        }
    }
}

async fn read_to_string(path: impl AsRef<Path>) -> Option<String> {
    match tokio::fs::read_to_string(path.as_ref()).await {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::debug!(path = %path.as_ref().display(), error = %e, "Host counter unavailable");
            None
        }
    }
}

async fn query_gpu_memory() -> f64 {
    let output = tokio::process::Command::new("nvidia-smi")
        .args(["--query-gpu=memory.total", "--format=csv,noheader,nounits"])
        .output()
        .await;

    match output {
        Ok(out) if out.status.success() => parse_nvidia_smi(&String::from_utf8_lossy(&out.stdout)),
        Ok(out) => {
            tracing::debug!(status = %out.status, "nvidia-smi exited with failure");
            0.0
        }
        Err(_) => 0.0,
    }
}

/// Total memory in GiB from the `MemTotal` line of `/proc/meminfo`
#[must_use]
pub fn parse_meminfo(content: &str) -> Option<f64> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kib| kib.parse::<f64>().ok())
        .map(|kib| kib / KIB_PER_GIB)
}

/// One-minute load from `/proc/loadavg`, as a 0-100 share of `cores`
#[must_use]
pub fn parse_loadavg(content: &str, cores: u32) -> Option<f64> {
    let one_minute = content.split_whitespace().next()?.parse::<f64>().ok()?;
    if !one_minute.is_finite() || one_minute < 0.0 {
        return None;
    }
    let cores = f64::from(cores.max(1));
    Some((one_minute / cores * 100.0).min(100.0))
}

/// Sum of per-device `memory.total` values (MiB) reported by `nvidia-smi`
#[must_use]
pub fn parse_nvidia_smi(content: &str) -> f64 {
    content
        .lines()
        .filter_map(|line| line.trim().parse::<f64>().ok())
        .sum::<f64>()
        / MIB_PER_GIB
}
