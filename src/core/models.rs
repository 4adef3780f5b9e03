use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

/// Archive strategy for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Full,
    #[default]
    Incremental,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "incremental" => Ok(Self::Incremental),
            other => Err(format!("unknown backup type '{}'", other)),
        }
    }
}

/// Schedule label for model backups.
///
/// Every schedule runs the incremental strategy; the label is reported back
/// in [`EnhancedBackupResult::backup_type`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackupSchedule {
    #[default]
    Daily,
    Weekly,
    Monthly,
}

impl BackupSchedule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }

    pub fn backup_type(&self) -> BackupType {
        BackupType::Incremental
    }
}

impl fmt::Display for BackupSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupSchedule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            other => Err(format!("unknown backup schedule '{}'", other)),
        }
    }
}

/// Lifecycle of a job: `pending -> running -> completed | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempted backup. Serialized form is the metadata record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupJob {
    pub job_id: String,
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
    pub backup_type: BackupType,
    pub status: JobStatus,
    #[serde(default, deserialize_with = "timestamp::deserialize_option")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "timestamp::deserialize_option")]
    pub end_time: Option<DateTime<Utc>>,
    pub files_processed: u64,
    pub bytes_processed: u64,
    pub errors: Vec<String>,
    pub checksum: Option<String>,
}

impl BackupJob {
    /// Create a pending job whose destination lives under `backup_dir`.
    ///
    /// The destination name is `<source name>_<type>_<timestamp>_<suffix>`,
    /// where the suffix is the random tail of the job id.
    pub fn new(source_path: &Path, backup_type: BackupType, backup_dir: &Path) -> Self {
        let timestamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let suffix = random_suffix();
        let source_name = source_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "root".to_string());

        Self {
            job_id: format!("backup_{}_{}", timestamp, suffix),
            source_path: source_path.to_path_buf(),
            destination_path: backup_dir.join(format!(
                "{}_{}_{}_{}",
                source_name, backup_type, timestamp, suffix
            )),
            backup_type,
            status: JobStatus::Pending,
            start_time: None,
            end_time: None,
            files_processed: 0,
            bytes_processed: 0,
            errors: Vec::new(),
            checksum: None,
        }
    }

    /// Move to `next`, stamping start/end times. Returns false (and leaves the
    /// job untouched) for transitions the lifecycle does not allow.
    pub fn transition(&mut self, next: JobStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }

        match next {
            JobStatus::Running => self.start_time = Some(Utc::now()),
            JobStatus::Completed | JobStatus::Failed => self.end_time = Some(Utc::now()),
            JobStatus::Pending => {}
        }
        self.status = next;
        true
    }

    /// Record an error and move to `failed`.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
        self.transition(JobStatus::Failed);
    }

    pub fn destination_name(&self) -> String {
        self.destination_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Metadata timestamps: RFC 3339, or a naive ISO-8601 value taken as local
/// time.
pub(crate) mod timestamp {
    use chrono::{DateTime, Local, NaiveDateTime, Utc};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};

    pub fn parse(value: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
            return Some(dt.with_timezone(&Utc));
        }
        let naive: NaiveDateTime = value.parse().ok()?;
        naive
            .and_local_timezone(Local)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let value = String::deserialize(d)?;
        parse(&value).ok_or_else(|| D::Error::custom(format!("invalid timestamp: {}", value)))
    }

    pub fn deserialize_option<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        match Option::<String>::deserialize(d)? {
            Some(value) => parse(&value)
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("invalid timestamp: {}", value))),
            None => Ok(None),
        }
    }
}

/// Random tail of a UUIDv7, eight hex characters.
pub(crate) fn random_suffix() -> String {
    let simple = Uuid::now_v7().simple().to_string();
    simple[simple.len() - 8..].to_string()
}

/// Outcome of auditing a backup directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub backup_path: PathBuf,
    pub is_valid: bool,
    pub files_checked: u64,
    pub files_failed: u64,
    pub checksum_matches: bool,
    pub errors: Vec<String>,
    pub verification_time: DateTime<Utc>,
    pub duration_seconds: f64,
}

impl VerificationResult {
    pub fn new(
        backup_path: PathBuf,
        files_checked: u64,
        files_failed: u64,
        checksum_matches: bool,
        errors: Vec<String>,
        duration_seconds: f64,
    ) -> Self {
        Self {
            backup_path,
            is_valid: files_failed == 0 && checksum_matches,
            files_checked,
            files_failed,
            checksum_matches,
            errors,
            verification_time: Utc::now(),
            duration_seconds,
        }
    }
}

/// Caller-facing summary of a model backup attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhancedBackupResult {
    pub success: bool,
    pub message: String,
    pub backup_type: String,
    pub model_name: Option<String>,
    pub backup_path: Option<PathBuf>,
    pub duration_seconds: f64,
    pub files_processed: u64,
    pub bytes_processed: u64,
    pub compression_ratio: Option<f64>,
    pub errors: Vec<String>,
    /// Number of backup jobs created for this request
    pub attempts: u32,
}

/// Aggregate view of the in-memory ledger.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BackupStatus {
    pub active_jobs: usize,
    pub pending_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub jobs: BTreeMap<String, BackupJob>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_derived_from_source_and_type() {
        let job = BackupJob::new(
            Path::new("/models/phi-3"),
            BackupType::Full,
            Path::new("/backup/models"),
        );

        assert!(job.job_id.starts_with("backup_"));
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.destination_path.starts_with("/backup/models"));
        assert!(job.destination_name().starts_with("phi-3_full_"));
        // Job id suffix is folded into the destination
        let suffix = job.job_id.rsplit('_').next().unwrap();
        assert!(job.destination_name().ends_with(suffix));
    }

    #[test]
    fn test_jobs_for_same_source_get_distinct_destinations() {
        let a = BackupJob::new(Path::new("/m/x"), BackupType::Full, Path::new("/b"));
        let b = BackupJob::new(Path::new("/m/x"), BackupType::Full, Path::new("/b"));
        assert_ne!(a.job_id, b.job_id);
        assert_ne!(a.destination_path, b.destination_path);
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut job = BackupJob::new(Path::new("/m/x"), BackupType::Full, Path::new("/b"));

        assert!(!job.transition(JobStatus::Completed));
        assert!(job.transition(JobStatus::Running));
        assert!(job.start_time.is_some());
        assert!(!job.transition(JobStatus::Pending));
        assert!(job.transition(JobStatus::Completed));
        assert!(job.end_time.is_some());

        // Terminal states are final
        assert!(!job.transition(JobStatus::Running));
        assert!(!job.transition(JobStatus::Failed));
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[test]
    fn test_fail_records_error() {
        let mut job = BackupJob::new(Path::new("/m/x"), BackupType::Full, Path::new("/b"));
        job.transition(JobStatus::Running);
        job.fail("rsync exited with 23");
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.errors, vec!["rsync exited with 23".to_string()]);
    }

    #[test]
    fn test_is_valid_truth_table() {
        let cases = [
            (0, true, true),
            (0, false, false),
            (2, true, false),
            (2, false, false),
        ];

        for (failed, checksum_matches, expected) in cases {
            let result = VerificationResult::new(
                PathBuf::from("/b/x"),
                5,
                failed,
                checksum_matches,
                Vec::new(),
                0.0,
            );
            assert_eq!(
                result.is_valid, expected,
                "files_failed={} checksum_matches={}",
                failed, checksum_matches
            );
        }
    }

    #[test]
    fn test_job_serializes_to_metadata_shape() {
        let job = BackupJob::new(Path::new("/m/x"), BackupType::Incremental, Path::new("/b"));
        let value = serde_json::to_value(&job).unwrap();

        assert_eq!(value["backup_type"], "incremental");
        assert_eq!(value["status"], "pending");
        assert!(value["start_time"].is_null());
        assert!(value["checksum"].is_null());
        assert_eq!(value["errors"], serde_json::json!([]));
    }

    #[test]
    fn test_parse_types_and_schedules() {
        assert_eq!("FULL".parse::<BackupType>().unwrap(), BackupType::Full);
        assert!("differential".parse::<BackupType>().is_err());
        assert_eq!(
            "weekly".parse::<BackupSchedule>().unwrap(),
            BackupSchedule::Weekly
        );
        assert_eq!(BackupSchedule::Monthly.backup_type(), BackupType::Incremental);
    }
}
