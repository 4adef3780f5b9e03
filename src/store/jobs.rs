use crate::core::models::BackupJob;
use crate::error::Result;

use super::MetadataStore;

/// Append a finished job's record to the metadata document.
pub async fn append(store: &MetadataStore, job: &BackupJob) -> Result<()> {
    let job = job.clone();
    store.modify(move |document| document.jobs.push(job)).await
}

/// First record whose destination directory is named `backup_name`.
pub async fn find_by_backup_name(
    store: &MetadataStore,
    backup_name: &str,
) -> Result<Option<BackupJob>> {
    let document = store.load().await?;

    Ok(document.jobs.into_iter().find(|job| {
        job.destination_path
            .file_name()
            .is_some_and(|name| name == backup_name)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{BackupType, JobStatus};
    use std::path::Path;
    use tempfile::tempdir;

    fn finished_job(source: &str, checksum: &str) -> BackupJob {
        let mut job = BackupJob::new(Path::new(source), BackupType::Full, Path::new("/backup"));
        job.transition(JobStatus::Running);
        job.checksum = Some(checksum.to_string());
        job.files_processed = 3;
        job.transition(JobStatus::Completed);
        job
    }

    #[tokio::test]
    async fn test_append_and_find() {
        let temp = tempdir().unwrap();
        let store = MetadataStore::new(temp.path().join("backup_metadata.json"));

        let a = finished_job("/models/a", "aaa");
        let b = finished_job("/models/b", "bbb");
        append(&store, &a).await.unwrap();
        append(&store, &b).await.unwrap();

        let found = find_by_backup_name(&store, &b.destination_name())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found, b);

        assert!(
            find_by_backup_name(&store, "nothing_here")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_document_round_trips_metadata_format() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("backup_metadata.json");
        let store = MetadataStore::new(path.clone());

        append(&store, &finished_job("/models/a", "abc")).await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(raw["created"].is_string());
        let record = &raw["jobs"][0];
        assert_eq!(record["status"], "completed");
        assert_eq!(record["backup_type"], "full");
        assert_eq!(record["checksum"], "abc");
        assert_eq!(record["files_processed"], 3);
        assert!(record["start_time"].is_string());
        assert!(record["end_time"].is_string());
    }

    #[tokio::test]
    async fn test_concurrent_appends_keep_every_record() {
        let temp = tempdir().unwrap();
        let store = MetadataStore::new(temp.path().join("backup_metadata.json"));

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                append(&store, &finished_job(&format!("/models/m{}", i), "x"))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.load().await.unwrap().jobs.len(), 8);
    }
}
