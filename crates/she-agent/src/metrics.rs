//! Lightweight CPU and RAM usage from /proc, attached to heartbeat payloads.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;

/// A single CPU/RAM snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub cpu_percent: f64,
    pub ram_percent: f64,
    pub ram_used_mb: u64,
    pub ram_total_mb: u64,
}

const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Reads CPU and RAM metrics from /proc/stat and /proc/meminfo. CPU
/// utilisation is computed from two snapshots taken one second apart, giving
/// an average rather than an instantaneous point reading. The inter-sample
/// sleep honours cancellation.
pub async fn collect(cancel: &CancellationToken) -> Result<Sample> {
    let (idle0, total0) = read_cpu_stat().await.context("first cpu sample")?;

    tokio::select! {
        _ = cancel.cancelled() => bail!("metrics sampling cancelled"),
        _ = tokio::time::sleep(SAMPLE_INTERVAL) => {}
    }

    let (idle1, total1) = read_cpu_stat().await.context("second cpu sample")?;

    let delta_total = total1.saturating_sub(total0);
    let delta_idle = idle1.saturating_sub(idle0);
    let cpu_percent = if delta_total > 0 {
        delta_total.saturating_sub(delta_idle) as f64 / delta_total as f64 * 100.0
    } else {
        0.0
    };

    let (mem_total_kb, mem_avail_kb) = read_mem_info().await.context("meminfo")?;
    let used_kb = mem_total_kb.saturating_sub(mem_avail_kb);
    let ram_percent = if mem_total_kb > 0 {
        used_kb as f64 / mem_total_kb as f64 * 100.0
    } else {
        0.0
    };

    Ok(Sample {
        cpu_percent,
        ram_percent,
        ram_used_mb: used_kb / 1024,
        ram_total_mb: mem_total_kb / 1024,
    })
}

async fn read_cpu_stat() -> Result<(u64, u64)> {
    let content = tokio::fs::read_to_string("/proc/stat")
        .await
        .context("read /proc/stat")?;
    parse_cpu_stat(&content)
}

async fn read_mem_info() -> Result<(u64, u64)> {
    let content = tokio::fs::read_to_string("/proc/meminfo")
        .await
        .context("read /proc/meminfo")?;
    parse_mem_info(&content)
}

/// Returns (idle, total) jiffies from the aggregate "cpu " line.
fn parse_cpu_stat(content: &str) -> Result<(u64, u64)> {
    for line in content.lines() {
        let Some(rest) = line.strip_prefix("cpu ") else {
            continue;
        };
        // Fields: user nice system idle iowait irq softirq steal guest guest_nice
        let fields: Vec<u64> = rest
            .split_whitespace()
            .take(10)
            .map(str::parse)
            .collect::<Result<_, _>>()
            .with_context(|| format!("parse /proc/stat cpu line {line:?}"))?;
        if fields.len() < 5 {
            bail!("unexpected /proc/stat format: {line:?}");
        }
        let total = fields.iter().sum();
        let idle = fields[3] + fields[4]; // idle + iowait
        return Ok((idle, total));
    }
    bail!("/proc/stat: cpu line not found")
}

/// Returns (MemTotal, MemAvailable) in kB.
fn parse_mem_info(content: &str) -> Result<(u64, u64)> {
    let mut mem_total = 0u64;
    let mut mem_avail = 0u64;
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next()) {
            (Some("MemTotal:"), Some(v)) => mem_total = v.parse().unwrap_or(0),
            (Some("MemAvailable:"), Some(v)) => mem_avail = v.parse().unwrap_or(0),
            _ => {}
        }
    }
    if mem_total == 0 {
        bail!("/proc/meminfo: MemTotal not found");
    }
    Ok((mem_total, mem_avail))
}
