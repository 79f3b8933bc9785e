// src/config.rs
//
// Daemon-wide settings. Defaults are tuned for a single workstation; every
// field can be overridden with a CLI flag (see main.rs) so the daemon needs
// no config file for the common case.

use anyhow::{bail, Result};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub log_dir: PathBuf,
    /// Path to a topology config file. Per spec.md §4.3, if this path does
    /// not exist, the daemon synthesizes a default topology instead of
    /// failing; if it exists but is malformed, startup is refused.
    pub topology_file: PathBuf,
    pub tick_interval_ms: u64,
    pub total_cpus: Option<u32>,
    pub total_mem_mb: Option<u64>,
    pub elastic_enabled: bool,
    /// Utilization threshold `T` in percent, spec.md §4.6 (default 50).
    pub elastic_threshold_pct: f64,
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs_home();
        Self {
            db_path: home.join(".mini_slurm.db"),
            log_dir: home.join(".mini_slurm_logs"),
            topology_file: home.join(".mini_slurm_topology.conf"),
            tick_interval_ms: 1000,
            total_cpus: None,
            total_mem_mb: None,
            elastic_enabled: true,
            elastic_threshold_pct: 50.0,
        }
    }
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Parses human-readable memory sizes used on the CLI and in topology files:
/// a bare integer is megabytes, `G`/`GB`/`g`/`gb` suffixes multiply by 1024.
pub fn parse_mem_mb(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        bail!("empty memory size");
    }

    let lower = s.to_ascii_lowercase();
    let (digits, multiplier) = if let Some(n) = lower.strip_suffix("gb") {
        (n, 1024)
    } else if let Some(n) = lower.strip_suffix('g') {
        (n, 1024)
    } else if let Some(n) = lower.strip_suffix("mb") {
        (n, 1)
    } else if let Some(n) = lower.strip_suffix('m') {
        (n, 1)
    } else {
        (lower.as_str(), 1)
    };

    let value: f64 = digits
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid memory size: {:?}", s))?;
    if value < 0.0 {
        bail!("memory size must not be negative: {:?}", s);
    }
    Ok((value * multiplier as f64).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_megabytes() {
        assert_eq!(parse_mem_mb("512").unwrap(), 512);
    }

    #[test]
    fn parses_gigabyte_suffixes() {
        assert_eq!(parse_mem_mb("2G").unwrap(), 2048);
        assert_eq!(parse_mem_mb("2GB").unwrap(), 2048);
        assert_eq!(parse_mem_mb("2g").unwrap(), 2048);
    }

    #[test]
    fn parses_megabyte_suffix() {
        assert_eq!(parse_mem_mb("1024mb").unwrap(), 1024);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_mem_mb("not-a-size").is_err());
        assert!(parse_mem_mb("").is_err());
    }

    #[test]
    fn parses_float_mantissa() {
        assert_eq!(parse_mem_mb("1.5G").unwrap(), 1536);
        assert_eq!(parse_mem_mb("0.5GB").unwrap(), 512);
    }
}
