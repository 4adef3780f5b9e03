use crate::core::archive_engine::{ArchiveEngine, ArchiveRequest, ArchiveStats};
use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;
use tokio::process::Command;
use tracing::{debug, info};

// "Number of files: 4 (reg: 3, dir: 1)" or "Number of files: 3"
static FILES_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Number of files:\s*([\d,.]+)(?:\s*\(reg:\s*([\d,.]+))?").expect("valid regex")
});

// "Total file size: 12,345 bytes"
static SIZE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Total file size:\s*([\d,.]+)").expect("valid regex"));

pub struct RsyncEngine;

#[async_trait]
impl ArchiveEngine for RsyncEngine {
    fn name(&self) -> &'static str {
        "rsync"
    }

    async fn archive(&self, req: &ArchiveRequest) -> Result<ArchiveStats> {
        let source = req.source.to_string_lossy();
        let destination = req.destination.to_string_lossy();

        let mut cmd = Command::new("rsync");
        cmd.arg("-a").arg("--stats");

        if let Some(link_dest) = &req.link_dest {
            cmd.arg(format!("--link-dest={}", link_dest.display()));
        }

        if req.compress {
            cmd.arg("--compress");
        }

        // Trailing slashes copy the contents rather than the directory itself
        cmd.arg(format!("{}/", source))
            .arg(format!("{}/", destination));

        info!(
            job_id = %req.job_id,
            source = %source,
            destination = %destination,
            link_dest = ?req.link_dest,
            "Running rsync"
        );

        let output = cmd
            .output()
            .await
            .map_err(|e| anyhow!("Failed to spawn rsync process: {}", e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("Rsync failed with status {}: {}", output.status, stderr.trim());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stats = parse_rsync_stats(&stdout);

        debug!(
            job_id = %req.job_id,
            files = stats.files_processed,
            bytes = stats.bytes_processed,
            "Parsed rsync stats"
        );

        Ok(stats)
    }
}

/// Recover file and byte counts from rsync's `--stats` report.
///
/// When the file count carries a `(reg: N, ...)` breakdown, N (regular files)
/// is reported; otherwise the leading total is used. Unrecognized output
/// yields zeros.
pub fn parse_rsync_stats(output: &str) -> ArchiveStats {
    let mut stats = ArchiveStats::default();

    for line in output.lines() {
        if let Some(caps) = FILES_RE.captures(line) {
            let count = caps.get(2).or_else(|| caps.get(1));
            if let Some(count) = count.and_then(|m| parse_count(m.as_str())) {
                stats.files_processed = count;
            }
        } else if let Some(caps) = SIZE_RE.captures(line) {
            if let Some(bytes) = caps.get(1).and_then(|m| parse_count(m.as_str())) {
                stats.bytes_processed = bytes;
            }
        }
    }

    stats
}

fn parse_count(raw: &str) -> Option<u64> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}
