use crate::core::archive_engine::{ArchiveEngine, ArchiveRequest, ArchiveStats};
use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use filetime::FileTime;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info, info_span, warn};

/// Buffer size for file I/O operations (128KB for optimal throughput)
const BUFFER_SIZE: usize = 128 * 1024;

/// In-process archive engine.
///
/// - Refuses to write into an existing destination
/// - Large buffered I/O with optional per-file fsync
/// - Preserves permissions and timestamps
/// - With a link-dest, hard-links files whose size and mtime match the
///   previous backup instead of copying them
pub struct NativeCopyEngine {
    /// Whether to fsync each file after writing (safer but slower)
    pub sync_files: bool,
}

impl Default for NativeCopyEngine {
    fn default() -> Self {
        Self { sync_files: true }
    }
}

#[async_trait]
impl ArchiveEngine for NativeCopyEngine {
    fn name(&self) -> &'static str {
        "native-copy"
    }

    async fn archive(&self, req: &ArchiveRequest) -> Result<ArchiveStats> {
        let req = req.clone();
        let sync_files = self.sync_files;

        tokio::task::spawn_blocking(move || copy_tree(&req, sync_files)).await?
    }
}

/// Result of scanning a directory
struct ScanResult {
    files: Vec<FileInfo>,
    /// Parents before children
    directories: Vec<PathBuf>,
    total_bytes: u64,
}

#[derive(Clone)]
struct FileInfo {
    path: PathBuf,
    size: u64,
}

/// How a single file reached the destination
enum Placement {
    Copied(u64),
    Linked,
}

struct CopyError {
    file: String,
    message: String,
}

fn copy_tree(req: &ArchiveRequest, sync_files: bool) -> Result<ArchiveStats> {
    let span = info_span!(
        "native_copy",
        job_id = %req.job_id,
        source = %req.source.display(),
        destination = %req.destination.display()
    );
    let _enter = span.enter();

    if req.destination.exists() {
        bail!(
            "Destination already exists: {}. Refusing to overwrite.",
            req.destination.display()
        );
    }

    if req.compress {
        debug!("Compression is not applied by the native engine");
    }

    let start_time = Instant::now();

    let scan = scan_directory(&req.source)?;
    info!(
        total_files = scan.files.len(),
        total_bytes = scan.total_bytes,
        total_dirs = scan.directories.len(),
        "Scan complete"
    );

    fs::create_dir_all(&req.destination)
        .map_err(|e| anyhow!("Failed to create destination directory: {}", e))?;
    create_directory_structure(&req.source, &req.destination, &scan.directories)?;

    let mut copied_bytes: u64 = 0;
    let mut linked_files: u64 = 0;
    let mut errors: Vec<CopyError> = Vec::new();

    for file_info in &scan.files {
        let relative = file_info.path.strip_prefix(&req.source)?;
        let dest_path = req.destination.join(relative);
        let previous = req.link_dest.as_ref().map(|dir| dir.join(relative));

        debug!(file = %relative.display(), size = file_info.size, "Placing file");

        match place_file(&file_info.path, &dest_path, previous.as_deref(), sync_files) {
            Ok(Placement::Copied(bytes)) => copied_bytes += bytes,
            Ok(Placement::Linked) => linked_files += 1,
            Err(e) => {
                let file = relative.to_string_lossy().to_string();
                error!(file = %file, error = %e, "Failed to copy file");
                errors.push(CopyError {
                    file,
                    message: e.to_string(),
                });
            }
        }
    }

    if !errors.is_empty() {
        let mut summary = format!(
            "Copy completed with {} error(s):\n{}",
            errors.len(),
            errors
                .iter()
                .take(10)
                .map(|e| format!("  - {}: {}", e.file, e.message))
                .collect::<Vec<_>>()
                .join("\n")
        );
        if errors.len() > 10 {
            summary.push_str(&format!("\n  ... and {} more errors", errors.len() - 10));
        }
        bail!(summary);
    }

    info!(
        files = scan.files.len(),
        copied_bytes,
        linked_files,
        duration_ms = start_time.elapsed().as_millis() as u64,
        "Native copy complete"
    );

    Ok(ArchiveStats {
        files_processed: scan.files.len() as u64,
        bytes_processed: scan.total_bytes,
    })
}

/// Scan a directory recursively, collecting files and directories.
fn scan_directory(source: &Path) -> Result<ScanResult> {
    let mut result = ScanResult {
        files: Vec::new(),
        directories: Vec::new(),
        total_bytes: 0,
    };
    scan_directory_recursive(source, &mut result)?;
    Ok(result)
}

fn scan_directory_recursive(current: &Path, result: &mut ScanResult) -> Result<()> {
    let entries = fs::read_dir(current)
        .map_err(|e| anyhow!("Failed to read directory {}: {}", current.display(), e))?;

    for entry in entries {
        let entry = entry.map_err(|e| anyhow!("Failed to read directory entry: {}", e))?;
        let path = entry.path();

        // Use symlink_metadata to avoid following symlinks
        let metadata = match path.symlink_metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };

        if metadata.is_dir() {
            result.directories.push(path.clone());
            scan_directory_recursive(&path, result)?;
        } else if metadata.is_file() {
            result.total_bytes += metadata.len();
            result.files.push(FileInfo {
                path,
                size: metadata.len(),
            });
        }
        // Skip symlinks and other special files
    }

    Ok(())
}

/// Create all directories in the destination, preserving permissions
fn create_directory_structure(
    source: &Path,
    destination: &Path,
    directories: &[PathBuf],
) -> Result<()> {
    for dir_path in directories {
        let relative = dir_path.strip_prefix(source)?;
        let dest_dir = destination.join(relative);

        fs::create_dir_all(&dest_dir)?;
        let permissions = fs::metadata(dir_path)?.permissions();
        fs::set_permissions(&dest_dir, permissions)?;
    }
    Ok(())
}

/// Hard-link from the previous backup when unchanged, otherwise copy.
fn place_file(
    source: &Path,
    dest: &Path,
    previous: Option<&Path>,
    sync_file: bool,
) -> Result<Placement> {
    if let Some(previous) = previous {
        if is_unchanged(source, previous) {
            match fs::hard_link(previous, dest) {
                Ok(()) => return Ok(Placement::Linked),
                Err(e) => debug!(
                    previous = %previous.display(),
                    error = %e,
                    "Hard link failed, copying instead"
                ),
            }
        }
    }

    copy_single_file(source, dest, sync_file).map(Placement::Copied)
}

fn is_unchanged(source: &Path, previous: &Path) -> bool {
    let (Ok(src), Ok(prev)) = (fs::metadata(source), fs::metadata(previous)) else {
        return false;
    };

    prev.is_file()
        && src.len() == prev.len()
        && FileTime::from_last_modification_time(&src)
            == FileTime::from_last_modification_time(&prev)
}

/// Copy a single file with metadata preservation
fn copy_single_file(source: &Path, dest: &Path, sync_file: bool) -> Result<u64> {
    let source_metadata = fs::metadata(source)
        .map_err(|e| anyhow!("Failed to read source metadata: {}", e))?;

    let source_file =
        File::open(source).map_err(|e| anyhow!("Failed to open source file: {}", e))?;
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, source_file);

    let dest_file =
        File::create(dest).map_err(|e| anyhow!("Failed to create destination file: {}", e))?;
    let mut writer = BufWriter::with_capacity(BUFFER_SIZE, dest_file);

    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut bytes_written: u64 = 0;

    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .map_err(|e| anyhow!("Failed to read from source: {}", e))?;
        if bytes_read == 0 {
            break;
        }

        writer
            .write_all(&buffer[..bytes_read])
            .map_err(|e| anyhow!("Failed to write to destination: {}", e))?;
        bytes_written += bytes_read as u64;
    }

    writer
        .flush()
        .map_err(|e| anyhow!("Failed to flush destination file: {}", e))?;

    if sync_file {
        let inner = writer
            .into_inner()
            .map_err(|e| anyhow!("Failed to get inner file handle: {}", e.error()))?;
        inner
            .sync_all()
            .map_err(|e| anyhow!("Failed to sync file: {}", e))?;
    }

    if let Err(e) = fs::set_permissions(dest, source_metadata.permissions()) {
        debug!(dest = %dest.display(), error = %e, "Failed to set file permissions");
    }

    // Matching mtimes let the next incremental backup link this file
    let atime = FileTime::from_last_access_time(&source_metadata);
    let mtime = FileTime::from_last_modification_time(&source_metadata);
    if let Err(e) = filetime::set_file_times(dest, atime, mtime) {
        debug!(dest = %dest.display(), error = %e, "Failed to preserve file timestamps");
    }

    Ok(bytes_written)
}
