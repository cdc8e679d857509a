//! Job registry and append-only CSV output for LeadX.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leadx_core::{slugify_list_name, ExtractedRecord, Job, JobPatch, JobSpec, JobStatus};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "leadx-storage";

/// Column schema for lead output files.
pub const LEAD_CSV_HEADER: [&str; 17] = [
    "Full Name",
    "First Name",
    "Last Name",
    "Title",
    "Company Name",
    "Person LinkedIn",
    "Person City",
    "Person State",
    "Person Country",
    "Linkedin Premium",
    "In Role",
    "In Company",
    "LinkedIn Url",
    "Website",
    "Website_One",
    "URL Number",
    "Page Number",
];

pub fn lead_csv_row(record: &ExtractedRecord) -> Vec<String> {
    let domain = |i: usize| record.domains.get(i).cloned().unwrap_or_default();
    vec![
        record.full_name.clone(),
        record.first_name.clone(),
        record.last_name.clone(),
        record.title.clone(),
        record.company_name.clone(),
        record.person_linkedin.clone(),
        record.person_city.clone(),
        record.person_state.clone(),
        record.person_country.clone(),
        record.linkedin_premium.clone(),
        record.in_role.clone(),
        record.in_company.clone(),
        record.linkedin_url.clone(),
        domain(0),
        domain(1),
        record.url_number.to_string(),
        record.page_number.to_string(),
    ]
}

/// `<data_dir>/<slug>-<unix millis>.csv`
pub fn create_csv_path(data_dir: &Path, list_name: &str, now: DateTime<Utc>) -> PathBuf {
    data_dir.join(format!(
        "{}-{}.csv",
        slugify_list_name(list_name),
        now.timestamp_millis()
    ))
}

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("job {id}: illegal status transition {from} -> {to}")]
    IllegalTransition {
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("persisting job snapshot: {0:#}")]
    Persist(#[from] anyhow::Error),
}

/// Keyed job registry. Readers share the map; writes to one job are serialized by its own lock.
#[derive(Debug, Default)]
pub struct JobStore {
    jobs: RwLock<HashMap<Uuid, Arc<Mutex<Job>>>>,
    snapshot_path: Option<PathBuf>,
    persist_lock: Mutex<()>,
}

impl JobStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens a store backed by a JSON snapshot file. Jobs a previous process left `Running`
    /// come back `Paused` so they can be resumed.
    pub async fn open(snapshot_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let snapshot_path = snapshot_path.into();
        let mut jobs = HashMap::new();

        if fs::try_exists(&snapshot_path)
            .await
            .with_context(|| format!("checking {}", snapshot_path.display()))?
        {
            let text = fs::read_to_string(&snapshot_path)
                .await
                .with_context(|| format!("reading {}", snapshot_path.display()))?;
            let loaded: Vec<Job> = if text.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str(&text)
                    .with_context(|| format!("parsing {}", snapshot_path.display()))?
            };
            for mut job in loaded {
                if job.status == JobStatus::Running {
                    warn!(job_id = %job.id, "job was running when the store was last written; marking paused");
                    job.status = JobStatus::Paused;
                    job.error = Some("interrupted".to_string());
                }
                jobs.insert(job.id, Arc::new(Mutex::new(job)));
            }
        }

        Ok(Self {
            jobs: RwLock::new(jobs),
            snapshot_path: Some(snapshot_path),
            persist_lock: Mutex::new(()),
        })
    }

    pub async fn create(&self, spec: JobSpec) -> Result<Job, JobStoreError> {
        let job = Job::new(spec, Utc::now());
        self.jobs
            .write()
            .await
            .insert(job.id, Arc::new(Mutex::new(job.clone())));
        self.persist().await?;
        debug!(job_id = %job.id, list_name = %job.list_name, "job created");
        Ok(job)
    }

    pub async fn get(&self, id: Uuid) -> Option<Job> {
        let slot = self.slot(id).await?;
        let job = slot.lock().await;
        Some(job.clone())
    }

    pub async fn list(&self) -> Vec<Job> {
        let slots = self.jobs.read().await.values().cloned().collect::<Vec<_>>();
        let mut jobs = Vec::with_capacity(slots.len());
        for slot in slots {
            jobs.push(slot.lock().await.clone());
        }
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Returns `Ok(None)` when the job does not exist (deleted or never created).
    pub async fn update(&self, id: Uuid, patch: JobPatch) -> Result<Option<Job>, JobStoreError> {
        let Some(slot) = self.slot(id).await else {
            return Ok(None);
        };
        let updated = {
            let mut job = slot.lock().await;
            if let Some(next) = patch.status {
                if !job.status.can_transition_to(next) {
                    return Err(JobStoreError::IllegalTransition {
                        id,
                        from: job.status,
                        to: next,
                    });
                }
            }
            job.apply(patch, Utc::now());
            job.clone()
        };
        self.persist().await?;
        Ok(Some(updated))
    }

    pub async fn remove(&self, id: Uuid) -> Result<Option<Job>, JobStoreError> {
        let removed = self.jobs.write().await.remove(&id);
        let Some(slot) = removed else {
            return Ok(None);
        };
        let job = slot.lock().await.clone();
        self.persist().await?;
        Ok(Some(job))
    }

    async fn slot(&self, id: Uuid) -> Option<Arc<Mutex<Job>>> {
        self.jobs.read().await.get(&id).cloned()
    }

    /// Writes the whole registry through a temp file + rename so readers never see a torn file.
    async fn persist(&self) -> anyhow::Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let _guard = self.persist_lock.lock().await;
        let jobs = self.list().await;
        let bytes = serde_json::to_vec_pretty(&jobs).context("serializing job snapshot")?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4()));
        fs::write(&temp_path, &bytes)
            .await
            .with_context(|| format!("writing {}", temp_path.display()))?;
        if let Err(err) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!("renaming {} -> {}", temp_path.display(), path.display())
            });
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding csv row: {0}")]
    Encode(#[from] csv::Error),
}

/// Durable, append-only row writer. `append` returns only after the row reached the file.
#[async_trait]
pub trait CsvSink: Send + Sync {
    async fn ensure_header(&self, path: &Path, header: &[&str]) -> Result<(), SinkError>;
    async fn append(&self, path: &Path, row: &[String]) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FileCsvSink;

impl FileCsvSink {
    pub fn new() -> Self {
        Self
    }

    async fn write_line(path: &Path, line: &[u8]) -> Result<(), SinkError> {
        let io_err = |source| SinkError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(io_err)?;
        file.write_all(line).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        file.sync_data().await.map_err(io_err)?;
        Ok(())
    }
}

#[async_trait]
impl CsvSink for FileCsvSink {
    async fn ensure_header(&self, path: &Path, header: &[&str]) -> Result<(), SinkError> {
        match fs::metadata(path).await {
            Ok(meta) if meta.len() > 0 => return Ok(()),
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(SinkError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
        let line = encode_csv_line(header)?;
        Self::write_line(path, &line).await
    }

    async fn append(&self, path: &Path, row: &[String]) -> Result<(), SinkError> {
        let line = encode_csv_line(row)?;
        Self::write_line(path, &line).await
    }
}

/// Encodes one record with RFC 4180 quoting and a trailing `\n`.
pub fn encode_csv_line<I, T>(fields: I) -> Result<Vec<u8>, SinkError>
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer.write_record(fields)?;
    writer.into_inner().map_err(|err| SinkError::Io {
        path: PathBuf::from("<buffer>"),
        source: err.into_error(),
    })
}

/// Counts data rows (header excluded) in a lead output file. Missing files count as zero.
pub fn count_data_rows(path: &Path) -> anyhow::Result<u64> {
    if !path.exists() {
        return Ok(0);
    }
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let mut rows = 0u64;
    for record in reader.records() {
        record.with_context(|| format!("reading {}", path.display()))?;
        rows += 1;
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadx_core::JobTarget;
    use tempfile::tempdir;

    fn spec() -> JobSpec {
        JobSpec {
            list_name: "Founders".into(),
            target: JobTarget::Single("https://example.com/search".into()),
            file_path: PathBuf::from("founders.csv"),
        }
    }

    #[tokio::test]
    async fn create_get_update_roundtrip() {
        let store = JobStore::in_memory();
        let job = store.create(spec()).await.expect("create");
        assert_eq!(job.status, JobStatus::Pending);

        let updated = store
            .update(
                job.id,
                JobPatch {
                    status: Some(JobStatus::Running),
                    total: Some(25),
                    page_index: Some(1),
                    ..Default::default()
                },
            )
            .await
            .expect("update")
            .expect("job exists");
        assert_eq!(updated.total, 25);
        assert_eq!(store.get(job.id).await.expect("get").page_index, 1);
    }

    #[tokio::test]
    async fn update_of_unknown_job_is_absent_not_error() {
        let store = JobStore::in_memory();
        let result = store
            .update(Uuid::new_v4(), JobPatch::status(JobStatus::Running))
            .await
            .expect("no error");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn illegal_transition_leaves_job_untouched() {
        let store = JobStore::in_memory();
        let job = store.create(spec()).await.expect("create");
        store.update(job.id, JobPatch::running()).await.expect("run");
        store
            .update(job.id, JobPatch::status(JobStatus::Completed))
            .await
            .expect("complete");

        let err = store
            .update(job.id, JobPatch::status(JobStatus::Running))
            .await
            .expect_err("completed jobs stay completed");
        assert!(matches!(err, JobStoreError::IllegalTransition { .. }));
        assert_eq!(store.get(job.id).await.expect("get").status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn concurrent_updates_to_one_job_do_not_lose_progress() {
        let store = Arc::new(JobStore::in_memory());
        let id = store.create(spec()).await.expect("create").id;

        let mut handles = Vec::new();
        for n in 1..=32u64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update(id, JobPatch { total: Some(n), ..Default::default() })
                    .await
                    .expect("update");
            }));
        }
        for handle in handles {
            handle.await.expect("join");
        }
        assert_eq!(store.get(id).await.expect("get").total, 32);
    }

    #[tokio::test]
    async fn snapshot_reload_pauses_interrupted_jobs() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state").join("jobs.json");

        let id = {
            let store = JobStore::open(&path).await.expect("open");
            let job = store.create(spec()).await.expect("create");
            store
                .update(
                    job.id,
                    JobPatch {
                        status: Some(JobStatus::Running),
                        page_index: Some(3),
                        total: Some(75),
                        ..Default::default()
                    },
                )
                .await
                .expect("update");
            job.id
        };

        let reopened = JobStore::open(&path).await.expect("reopen");
        let job = reopened.get(id).await.expect("persisted job");
        assert_eq!(job.status, JobStatus::Paused);
        assert_eq!(job.page_index, 3);
        assert_eq!(job.total, 75);
        assert_eq!(job.error.as_deref(), Some("interrupted"));
    }

    #[tokio::test]
    async fn header_is_written_once_and_rows_are_quoted() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out").join("leads.csv");
        let sink = FileCsvSink::new();

        sink.ensure_header(&path, &LEAD_CSV_HEADER).await.expect("header");
        sink.ensure_header(&path, &LEAD_CSV_HEADER).await.expect("header again");

        let record = ExtractedRecord {
            full_name: "Jane Doe".into(),
            first_name: "Jane".into(),
            last_name: "Doe".into(),
            company_name: "Acme, Inc.".into(),
            domains: vec!["acme.com".into()],
            url_number: 1,
            page_number: 2,
            ..Default::default()
        };
        sink.append(&path, &lead_csv_row(&record)).await.expect("append");

        let text = std::fs::read_to_string(&path).expect("read");
        assert_eq!(text.matches("Full Name").count(), 1);
        assert!(text.contains("\"Acme, Inc.\""));
        assert_eq!(count_data_rows(&path).expect("count"), 1);
    }

    #[test]
    fn csv_paths_are_slugged_and_stamped() {
        let now = DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);
        let path = create_csv_path(Path::new("data"), "Sales Nav: EMEA", now);
        assert_eq!(
            path,
            PathBuf::from("data").join(format!("sales-nav-emea-{}.csv", now.timestamp_millis()))
        );
    }
}
