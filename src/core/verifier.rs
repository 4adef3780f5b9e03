use rand::Rng;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::core::checksum::compute_checksum;
use crate::core::models::VerificationResult;
use crate::error::Result;
use crate::store::{MetadataStore, jobs};

/// Outcome of the per-file pass, before the checksum comparison
#[derive(Debug, Default)]
struct FileAudit {
    files_checked: u64,
    files_failed: u64,
    errors: Vec<String>,
}

impl FileAudit {
    /// Count one inspected entry. `files_failed` never exceeds `files_checked`.
    fn record(&mut self, outcome: std::result::Result<(), String>) {
        self.files_checked += 1;
        if let Err(message) = outcome {
            self.files_failed += 1;
            self.errors.push(message);
        }
    }
}

/// Audit the backup at `backup_path`.
///
/// A sample of files (every file when `sample_rate >= 1.0`, otherwise
/// `max(1, floor(n * rate))`) is checked for existence, readability and a
/// clean full read. Separately the tree's checksum is recomputed and compared
/// with the one recorded in the metadata store. Findings are collected into
/// the result; this never returns an error.
pub async fn verify_backup(
    store: &MetadataStore,
    backup_path: &Path,
    sample_rate: f64,
) -> VerificationResult {
    let start = Instant::now();

    info!(backup = %backup_path.display(), sample_rate, "Verifying backup");

    if !backup_path.is_dir() {
        return VerificationResult::new(
            backup_path.to_path_buf(),
            0,
            0,
            false,
            vec![format!(
                "Backup directory does not exist: {}",
                backup_path.display()
            )],
            start.elapsed().as_secs_f64(),
        );
    }

    let root = backup_path.to_path_buf();
    let mut audit = match tokio::task::spawn_blocking(move || audit_files(&root, sample_rate)).await
    {
        Ok(audit) => audit,
        Err(e) => FileAudit {
            errors: vec![format!("Verification failed: {}", e)],
            ..FileAudit::default()
        },
    };

    let checksum_matches = match checksum_matches(store, backup_path).await {
        Ok(true) => true,
        Ok(false) => {
            audit.errors.push(format!(
                "Checksum mismatch for backup: {}",
                backup_path.display()
            ));
            false
        }
        Err(e) => {
            warn!(backup = %backup_path.display(), error = %e, "Checksum verification failed");
            audit
                .errors
                .push(format!("Checksum verification failed: {}", e));
            false
        }
    };

    let result = VerificationResult::new(
        backup_path.to_path_buf(),
        audit.files_checked,
        audit.files_failed,
        checksum_matches,
        audit.errors,
        start.elapsed().as_secs_f64(),
    );

    info!(
        backup = %backup_path.display(),
        is_valid = result.is_valid,
        files_checked = result.files_checked,
        files_failed = result.files_failed,
        checksum_matches = result.checksum_matches,
        "Verification complete"
    );

    result
}

fn audit_files(root: &Path, sample_rate: f64) -> FileAudit {
    let mut audit = FileAudit::default();
    let mut all_files = Vec::new();

    for entry in WalkDir::new(root) {
        match entry {
            Ok(entry) if entry.file_type().is_file() => all_files.push(entry.into_path()),
            Ok(_) => {}
            Err(e) => audit.record(Err(format!("Cannot read entry: {}", e))),
        }
    }

    let to_check = select_sample(all_files, sample_rate, &mut rand::thread_rng());
    debug!(sampled = to_check.len(), "Checking sampled files");

    for path in &to_check {
        audit.record(check_file(path));
    }

    audit
}

/// Draw the files to inspect. Never empty when `files` is non-empty.
fn select_sample<R: Rng>(files: Vec<PathBuf>, sample_rate: f64, rng: &mut R) -> Vec<PathBuf> {
    if sample_rate >= 1.0 || files.is_empty() {
        return files;
    }

    let total = files.len();
    let size = ((total as f64 * sample_rate.max(0.0)).floor() as usize).clamp(1, total);

    rand::seq::index::sample(rng, total, size)
        .into_iter()
        .map(|i| files[i].clone())
        .collect()
}

fn check_file(path: &Path) -> std::result::Result<(), String> {
    if !path.exists() {
        return Err(format!("Missing file: {}", path.display()));
    }

    let mut file = File::open(path)
        .map_err(|e| format!("Cannot read file: {} - {}", path.display(), e))?;

    let mut buffer = [0u8; 8192];
    loop {
        match file.read(&mut buffer) {
            Ok(0) => return Ok(()),
            Ok(_) => {}
            Err(e) => return Err(format!("Corrupted file: {} - {}", path.display(), e)),
        }
    }
}

/// Compare the recorded checksum with a fresh one.
///
/// A backup with no metadata record, or a record without a checksum, passes.
async fn checksum_matches(store: &MetadataStore, backup_path: &Path) -> Result<bool> {
    let backup_name = backup_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let Some(record) = jobs::find_by_backup_name(store, &backup_name).await? else {
        warn!(backup = %backup_name, "No metadata found for backup");
        return Ok(true);
    };

    let Some(expected) = record.checksum else {
        warn!(backup = %backup_name, "No checksum in metadata for backup");
        return Ok(true);
    };

    let current = compute_checksum(backup_path.to_path_buf()).await?;
    Ok(current == expected)
}
