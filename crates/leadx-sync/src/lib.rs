//! Job orchestration for LeadX: the pagination state machine, bulk campaigns, enrichment
//! merging and the job control surface.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use leadx_adapters::{
    is_http_url, with_page_param, FixtureSessionFactory, LeadSession, PageAdvance, SessionError,
    SessionFactory,
};
use leadx_core::{
    normalize_identity, BulkUrlEntry, EnrichmentBatch, EnrichmentRecord, ExtractedRecord, Job,
    JobPatch, JobSpec, JobStatus, JobTarget, PageTiming,
};
use leadx_storage::{
    create_csv_path, lead_csv_row, CsvSink, FileCsvSink, JobStore, JobStoreError, SinkError,
    LEAD_CSV_HEADER,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "leadx-sync";

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub data_dir: PathBuf,
    pub jobs_file: PathBuf,
    pub fixtures_dir: PathBuf,
    pub max_pages: u32,
    pub abort_on_row_failure: bool,
}

impl RunnerConfig {
    pub fn from_env() -> Self {
        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));
        Self {
            jobs_file: std::env::var("LEADX_JOBS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("jobs.json")),
            fixtures_dir: std::env::var("LEADX_FIXTURES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./fixtures")),
            max_pages: std::env::var("MAX_PAGES")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(100),
            abort_on_row_failure: std::env::var("ABORT_ON_ROW_FAILURE")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            data_dir,
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            jobs_file: PathBuf::from("./data/jobs.json"),
            fixtures_dir: PathBuf::from("./fixtures"),
            max_pages: 100,
            abort_on_row_failure: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub filled: usize,
    pub by_source: BTreeMap<String, usize>,
}

/// Fills primary records with domains from enrichment sources.
///
/// Sources are scanned in call order and the first matching candidate wins: equal normalized
/// first names or equal normalized company names, both sides non-empty. A filled record is never
/// revisited, so an early wrong match blocks a later correct one.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionMerger {
    max_domains: usize,
}

impl Default for ExtractionMerger {
    fn default() -> Self {
        Self { max_domains: 2 }
    }
}

impl ExtractionMerger {
    pub fn new(max_domains: usize) -> Self {
        Self { max_domains }
    }

    pub fn merge(&self, records: &mut [ExtractedRecord], batches: &[EnrichmentBatch]) -> MergeReport {
        let mut report = MergeReport::default();
        for record in records.iter_mut().filter(|r| !r.has_domains()) {
            let first_name = normalize_identity(&record.first_name);
            let company = normalize_identity(&record.company_name);
            let found = batches.iter().find_map(|batch| {
                batch
                    .records
                    .iter()
                    .find_map(|candidate| {
                        self.candidate_domains(candidate, &first_name, &company)
                    })
                    .map(|domains| (batch.source.as_str(), domains))
            });
            if let Some((source, domains)) = found {
                record.domains = domains;
                report.filled += 1;
                *report.by_source.entry(source.to_string()).or_default() += 1;
            }
        }
        report
    }

    fn candidate_domains(
        &self,
        candidate: &EnrichmentRecord,
        first_name: &str,
        company: &str,
    ) -> Option<Vec<String>> {
        let domains = candidate
            .domains
            .iter()
            .map(|d| d.trim())
            .filter(|d| !d.is_empty())
            .take(self.max_domains)
            .map(str::to_string)
            .collect::<Vec<_>>();
        if domains.is_empty() {
            return None;
        }
        let by_first_name =
            !first_name.is_empty() && normalize_identity(&candidate.first_name) == first_name;
        let by_company = !company.is_empty() && normalize_identity(&candidate.company_name) == company;
        (by_first_name || by_company).then_some(domains)
    }
}

/// Answers "should this run halt?" from the job's token and its stored status.
#[derive(Debug, Clone)]
pub struct StopProbe {
    store: Arc<JobStore>,
    job_id: Uuid,
    token: CancellationToken,
}

impl StopProbe {
    pub fn new(store: Arc<JobStore>, job_id: Uuid, token: CancellationToken) -> Self {
        Self {
            store,
            job_id,
            token,
        }
    }

    /// A deleted job counts as stopped.
    pub async fn stop_requested(&self) -> bool {
        if self.token.is_cancelled() {
            return true;
        }
        match self.store.get(self.job_id).await {
            Some(job) => job.status.is_stop_requested(),
            None => true,
        }
    }
}

#[derive(Debug, Error)]
pub enum PaginationError {
    #[error("Pagination page mismatch: expected {expected}, got {actual}")]
    Desync { expected: u32, actual: u32 },
    #[error("Pagination stopped: {0}")]
    Advance(String),
    #[error("Pagination failed: {0}")]
    Session(#[from] SessionError),
    #[error("Pagination failed: {0}")]
    Row(#[from] SinkError),
    #[error("Pagination failed: {0}")]
    Store(#[from] JobStoreError),
}

/// One target URL to paginate for a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRun {
    pub job_id: Uuid,
    pub target_url: String,
    pub url_number: u32,
    /// 1 for a fresh run; `pageIndex + 1` when resuming.
    pub start_page: u32,
    pub file_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum PaginationOutcome {
    Completed { last_page: u32 },
    Stopped { last_page: u32 },
    Failed { message: String },
}

impl PaginationOutcome {
    fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

/// Sequential page loop shared by single-target jobs and bulk campaigns.
pub struct PaginationEngine {
    store: Arc<JobStore>,
    sink: Arc<dyn CsvSink>,
    merger: ExtractionMerger,
    max_pages: u32,
    abort_on_row_failure: bool,
}

impl PaginationEngine {
    pub fn new(store: Arc<JobStore>, sink: Arc<dyn CsvSink>, config: &RunnerConfig) -> Self {
        Self {
            store,
            sink,
            merger: ExtractionMerger::default(),
            max_pages: config.max_pages.max(1),
            abort_on_row_failure: config.abort_on_row_failure,
        }
    }

    /// Runs one target to a terminal outcome. Job status is left to the caller.
    pub async fn run(
        &self,
        session: &mut dyn LeadSession,
        probe: &StopProbe,
        run: &PageRun,
    ) -> PaginationOutcome {
        let mut last_page = run.start_page.saturating_sub(1);
        let err = match self.drive(session, probe, run, &mut last_page).await {
            Ok(outcome) => return outcome,
            Err(err) => err,
        };
        if !matches!(err, PaginationError::Desync { .. }) && probe.stop_requested().await {
            info!(job_id = %run.job_id, last_page, error = %err, "failure observed after stop request; treating as stopped");
            return PaginationOutcome::Stopped { last_page };
        }
        error!(job_id = %run.job_id, url_number = run.url_number, last_page, error = %err, "pagination failed");
        PaginationOutcome::failed(err.to_string())
    }

    async fn drive(
        &self,
        session: &mut dyn LeadSession,
        probe: &StopProbe,
        run: &PageRun,
        last_page: &mut u32,
    ) -> Result<PaginationOutcome, PaginationError> {
        let start_page = run.start_page.max(1);
        let url = if start_page > 1 {
            with_page_param(&run.target_url, start_page)
                .map_err(|err| SessionError::navigation("build page url", err.to_string()))?
        } else {
            run.target_url.clone()
        };
        session.navigate(&url).await?;
        let reported = session.current_page_number().await?;
        if let Some(reported) = reported.filter(|&page| page != start_page) {
            warn!(job_id = %run.job_id, url = %url, requested = start_page, reported, "listing opened on a different page; keeping the requested page");
        }
        let mut current = start_page;
        debug!(job_id = %run.job_id, url = %url, page = current, "listing loaded");

        let mut pages_done = 0u32;
        loop {
            if pages_done >= self.max_pages {
                warn!(job_id = %run.job_id, max_pages = self.max_pages, "page limit reached; finishing target");
                return Ok(PaginationOutcome::Completed {
                    last_page: *last_page,
                });
            }
            if probe.stop_requested().await {
                return Ok(PaginationOutcome::Stopped {
                    last_page: *last_page,
                });
            }

            self.extract_page(session, run, current)
                .instrument(info_span!("page", page = current, url_number = run.url_number))
                .await?;
            *last_page = current;
            pages_done += 1;

            if probe.stop_requested().await {
                return Ok(PaginationOutcome::Stopped {
                    last_page: *last_page,
                });
            }

            match session.advance_page().await? {
                PageAdvance::Moved { page_number } => {
                    let expected = current + 1;
                    let actual = match page_number {
                        Some(n) => n,
                        None => session.current_page_number().await?.unwrap_or(expected),
                    };
                    if actual != expected {
                        return Err(PaginationError::Desync { expected, actual });
                    }
                    current = expected;
                }
                PageAdvance::Disabled => {
                    return Ok(PaginationOutcome::Completed {
                        last_page: *last_page,
                    })
                }
                other => return Err(PaginationError::Advance(other.reason())),
            }
        }
    }

    /// Extracts, enriches, merges and appends one page, then records progress.
    async fn extract_page(
        &self,
        session: &mut dyn LeadSession,
        run: &PageRun,
        page_number: u32,
    ) -> Result<u64, PaginationError> {
        let started = Instant::now();
        let mut records = session.extract_listing().await?;

        let mut source_seconds = BTreeMap::new();
        let mut batches = Vec::new();
        for source in session.enrichment_sources() {
            let source_started = Instant::now();
            let found = enrich_with_reauth(session, &source).await?;
            source_seconds.insert(source.clone(), source_started.elapsed().as_secs_f64());
            batches.push(EnrichmentBatch::new(source, found));
        }
        let report = self.merger.merge(&mut records, &batches);

        let mut rows_added = 0u64;
        let mut row_error = None;
        for record in records.iter_mut() {
            record.url_number = run.url_number;
            record.page_number = page_number;
            match self.sink.append(&run.file_path, &lead_csv_row(record)).await {
                Ok(()) => rows_added += 1,
                Err(err) if self.abort_on_row_failure => {
                    row_error = Some(err);
                    break;
                }
                Err(err) => {
                    warn!(job_id = %run.job_id, page = page_number, full_name = %record.full_name, error = %err, "dropping row that failed to write")
                }
            }
        }

        let previous = self
            .store
            .get(run.job_id)
            .await
            .map(|job| job.total)
            .unwrap_or(0);
        if let Some(err) = row_error {
            // Rows already in the file still count; the page itself stays unfinished.
            self.store
                .update(
                    run.job_id,
                    JobPatch {
                        total: Some(previous + rows_added),
                        url_number: Some(run.url_number),
                        ..Default::default()
                    },
                )
                .await?;
            warn!(job_id = %run.job_id, page = page_number, rows_added, error = %err, "row write failed; aborting page");
            return Err(err.into());
        }
        let timing = PageTiming {
            page_number,
            rows_added,
            page_seconds: started.elapsed().as_secs_f64(),
            source_seconds,
        };
        self.store
            .update(
                run.job_id,
                JobPatch {
                    total: Some(previous + rows_added),
                    page_index: Some(page_number),
                    url_number: Some(run.url_number),
                    last_page: Some(timing.clone()),
                    ..Default::default()
                },
            )
            .await?;

        info!(
            job_id = %run.job_id,
            page = page_number,
            rows = records.len(),
            rows_added,
            enriched = report.filled,
            total = previous + rows_added,
            seconds = timing.page_seconds,
            "page persisted"
        );
        Ok(rows_added)
    }
}

/// Queries one enrichment source. An expired session gets exactly one re-login; other
/// enrichment failures degrade to "no enrichment" for this page.
async fn enrich_with_reauth(
    session: &mut dyn LeadSession,
    source: &str,
) -> Result<Vec<EnrichmentRecord>, PaginationError> {
    let err = match session.extract_enrichment(source).await {
        Ok(found) => return Ok(found),
        Err(err) => err,
    };
    if !err.is_auth_expired() {
        warn!(source, error = %err, "enrichment failed; continuing without it");
        return Ok(Vec::new());
    }

    warn!(source, "enrichment session expired; re-authenticating");
    session.reauthenticate(source).await?;
    match session.extract_enrichment(source).await {
        Ok(found) => Ok(found),
        Err(err) if err.is_auth_expired() => Err(err.into()),
        Err(err) => {
            warn!(source, error = %err, "enrichment failed after re-login; continuing without it");
            Ok(Vec::new())
        }
    }
}

/// First page to request for `entry` when resuming a campaign.
pub fn resume_start_page(job: &Job, entry: &BulkUrlEntry) -> u32 {
    if job.is_positioned_at(entry) {
        job.page_index + 1
    } else {
        1
    }
}

/// Runs every entry of a bulk job through the [`PaginationEngine`], in order.
pub struct BulkCampaignRunner {
    engine: Arc<PaginationEngine>,
    store: Arc<JobStore>,
}

impl BulkCampaignRunner {
    pub fn new(engine: Arc<PaginationEngine>, store: Arc<JobStore>) -> Self {
        Self { engine, store }
    }

    pub async fn run(
        &self,
        session: &mut dyn LeadSession,
        probe: &StopProbe,
        job: &Job,
        resume: bool,
    ) -> Result<PaginationOutcome, JobStoreError> {
        let first = if resume {
            job.bulk_index.min(job.bulk_urls.len())
        } else {
            0
        };
        let mut last_page = 0;

        for (index, entry) in job.bulk_urls.iter().enumerate().skip(first) {
            let start_page = if resume && index == first {
                resume_start_page(job, entry)
            } else {
                1
            };
            self.store
                .update(
                    job.id,
                    JobPatch {
                        target_url: Some(entry.url.clone()),
                        bulk_index: Some(index),
                        url_number: Some(entry.url_number),
                        page_index: Some(start_page - 1),
                        ..Default::default()
                    },
                )
                .await?;
            info!(job_id = %job.id, bulk_index = index, url_number = entry.url_number, start_page, "starting bulk entry");

            let run = PageRun {
                job_id: job.id,
                target_url: entry.url.clone(),
                url_number: entry.url_number,
                start_page,
                file_path: job.file_path.clone(),
            };
            match self.engine.run(session, probe, &run).await {
                PaginationOutcome::Completed { last_page: page } => {
                    last_page = page;
                    self.store
                        .update(
                            job.id,
                            JobPatch {
                                bulk_index: Some(index + 1),
                                ..Default::default()
                            },
                        )
                        .await?;
                }
                other => return Ok(other),
            }
        }
        Ok(PaginationOutcome::Completed { last_page })
    }
}

/// Cancellation tokens of the jobs that currently own a session.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    tokens: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl SessionRegistry {
    /// Registers a fresh token for `id`, replacing any stale one.
    pub async fn register(&self, id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.lock().await.insert(id, token.clone());
        token
    }

    pub async fn unregister(&self, id: Uuid) {
        self.tokens.lock().await.remove(&id);
    }

    /// Fires the job's token. Returns false when no session is registered for it.
    pub async fn cancel(&self, id: Uuid) -> bool {
        match self.tokens.lock().await.get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn is_active(&self, id: Uuid) -> bool {
        self.tokens.lock().await.contains_key(&id)
    }

    pub async fn active_count(&self) -> usize {
        self.tokens.lock().await.len()
    }
}

#[derive(Debug, Error)]
pub enum JobServiceError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error("preparing output file: {0}")]
    Sink(#[from] SinkError),
    #[error("deleting {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Job control surface: create, stop, resume, inspect and delete jobs.
#[derive(Clone)]
pub struct JobService {
    config: RunnerConfig,
    store: Arc<JobStore>,
    sink: Arc<dyn CsvSink>,
    sessions: Arc<dyn SessionFactory>,
    engine: Arc<PaginationEngine>,
    registry: SessionRegistry,
    handles: Arc<Mutex<HashMap<Uuid, JoinHandle<()>>>>,
    /// Per-job control locks; stop, resume and delete of one job never wait on another.
    control: Arc<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

impl JobService {
    pub fn new(
        config: RunnerConfig,
        store: Arc<JobStore>,
        sink: Arc<dyn CsvSink>,
        sessions: Arc<dyn SessionFactory>,
    ) -> Self {
        let engine = Arc::new(PaginationEngine::new(store.clone(), sink.clone(), &config));
        Self {
            config,
            store,
            sink,
            sessions,
            engine,
            registry: SessionRegistry::default(),
            handles: Arc::default(),
            control: Arc::default(),
        }
    }

    /// Snapshot-backed store, file sink and fixture sessions, all from `config`.
    pub async fn from_config(config: RunnerConfig) -> Result<Self> {
        let store = JobStore::open(&config.jobs_file)
            .await
            .with_context(|| format!("opening job store {}", config.jobs_file.display()))?;
        let sessions = FixtureSessionFactory::new(config.fixtures_dir.clone());
        Ok(Self::new(
            config,
            Arc::new(store),
            Arc::new(FileCsvSink::new()),
            Arc::new(sessions),
        ))
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Creates a Pending job and its output file header without starting it.
    pub async fn submit(&self, list_name: &str, target: JobTarget) -> Result<Job, JobServiceError> {
        let list_name = list_name.trim();
        if list_name.is_empty() {
            return Err(JobServiceError::InvalidRequest("listName is required".into()));
        }
        match &target {
            JobTarget::Single(url) if !is_http_url(url) => {
                return Err(JobServiceError::InvalidRequest(format!(
                    "url must be an absolute http(s) URL: {url}"
                )))
            }
            JobTarget::Bulk(entries) if entries.is_empty() => {
                return Err(JobServiceError::InvalidRequest(
                    "bulk job needs at least one URL".into(),
                ))
            }
            _ => {}
        }

        let file_path = create_csv_path(&self.config.data_dir, list_name, Utc::now());
        self.sink.ensure_header(&file_path, &LEAD_CSV_HEADER).await?;
        let job = self
            .store
            .create(JobSpec {
                list_name: list_name.to_string(),
                target,
                file_path,
            })
            .await?;
        info!(job_id = %job.id, list_name = %job.list_name, bulk = job.bulk, file = %job.file_path.display(), "job submitted");
        Ok(job)
    }

    /// Submits and starts a job in the background.
    pub async fn create_job(&self, list_name: &str, target: JobTarget) -> Result<Job, JobServiceError> {
        let job = self.submit(list_name, target).await?;
        let started = self.start(job.id, false).await?;
        Ok(started.unwrap_or(job))
    }

    /// Continues a job from its persisted position. Running and Completed jobs come back
    /// unchanged.
    pub async fn resume_job(&self, id: Uuid) -> Result<Option<Job>, JobServiceError> {
        self.start(id, true).await
    }

    /// Marks the job Paused and fires its token; the run halts at its next checkpoint.
    pub async fn stop_job(&self, id: Uuid) -> Result<Option<Job>, JobServiceError> {
        let control = self.control_lock(id).await;
        let _control = control.lock().await;
        let stopped = self.stop_locked(id).await?;
        if stopped.is_none() {
            self.control.lock().await.remove(&id);
        }
        Ok(stopped)
    }

    pub async fn get_job(&self, id: Uuid) -> Option<Job> {
        self.store.get(id).await
    }

    pub async fn list_jobs(&self) -> Vec<Job> {
        self.store.list().await
    }

    /// Stops the job, waits for its run to exit, then drops the record and its output file.
    pub async fn delete_job(&self, id: Uuid) -> Result<Option<Job>, JobServiceError> {
        let control = self.control_lock(id).await;
        let _control = control.lock().await;
        if self.stop_locked(id).await?.is_none() {
            self.control.lock().await.remove(&id);
            return Ok(None);
        }
        self.wait(id).await;
        let removed = self.store.remove(id).await?;
        self.control.lock().await.remove(&id);
        let Some(job) = removed else {
            return Ok(None);
        };
        match tokio::fs::remove_file(&job.file_path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(JobServiceError::Io {
                    path: job.file_path.clone(),
                    source,
                })
            }
        }
        info!(job_id = %id, "job deleted");
        Ok(Some(job))
    }

    /// Number of background runs that have not finished yet.
    pub async fn tracked_runs(&self) -> usize {
        let mut handles = self.handles.lock().await;
        handles.retain(|_, handle| !handle.is_finished());
        handles.len()
    }

    /// Waits for the background run of `id`, if any, to finish.
    pub async fn wait(&self, id: Uuid) {
        let handle = self.handles.lock().await.remove(&id);
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(job_id = %id, error = %err, "job task panicked or was aborted");
            }
        }
    }

    async fn control_lock(&self, id: Uuid) -> Arc<Mutex<()>> {
        self.control.lock().await.entry(id).or_default().clone()
    }

    async fn stop_locked(&self, id: Uuid) -> Result<Option<Job>, JobServiceError> {
        let Some(job) = self.store.get(id).await else {
            return Ok(None);
        };
        let job = if matches!(job.status, JobStatus::Pending | JobStatus::Running) {
            self.store
                .update(id, JobPatch::status(JobStatus::Paused))
                .await?
                .unwrap_or(job)
        } else {
            job
        };
        if self.registry.cancel(id).await {
            info!(job_id = %id, "stop requested");
        }
        Ok(Some(job))
    }

    async fn start(&self, id: Uuid, resume: bool) -> Result<Option<Job>, JobServiceError> {
        let control = self.control_lock(id).await;
        let _control = control.lock().await;
        let Some(job) = self.store.get(id).await else {
            return Ok(None);
        };
        if matches!(job.status, JobStatus::Running | JobStatus::Completed) {
            return Ok(Some(job));
        }
        // A previous run may still be unwinding towards its next checkpoint; one writer per file.
        self.wait(id).await;

        let Some(job) = self.store.update(id, JobPatch::running()).await? else {
            return Ok(None);
        };
        let token = self.registry.register(id).await;
        let service = self.clone();
        let span = info_span!("job_run", job_id = %id, resume);
        let handle = tokio::spawn(
            async move {
                let outcome = service.execute(id, token, resume).await;
                service.settle(id, outcome).await;
                service.registry.unregister(id).await;
            }
            .instrument(span),
        );
        let mut handles = self.handles.lock().await;
        handles.retain(|_, handle| !handle.is_finished());
        handles.insert(id, handle);
        Ok(Some(job))
    }

    async fn execute(&self, id: Uuid, token: CancellationToken, resume: bool) -> PaginationOutcome {
        let Some(job) = self.store.get(id).await else {
            return PaginationOutcome::Stopped { last_page: 0 };
        };
        let probe = StopProbe::new(self.store.clone(), id, token);
        let mut session = match self.sessions.open(&job).await {
            Ok(session) => session,
            Err(err) => return PaginationOutcome::failed(format!("opening session: {err}")),
        };

        let outcome = if job.bulk {
            let runner = BulkCampaignRunner::new(self.engine.clone(), self.store.clone());
            runner
                .run(session.as_mut(), &probe, &job, resume)
                .await
                .unwrap_or_else(|err| PaginationOutcome::failed(err.to_string()))
        } else {
            let run = PageRun {
                job_id: id,
                target_url: job.target_url.clone(),
                url_number: job.url_number,
                start_page: if resume { job.page_index + 1 } else { 1 },
                file_path: job.file_path.clone(),
            };
            self.engine.run(session.as_mut(), &probe, &run).await
        };

        if let Err(err) = session.close().await {
            warn!(job_id = %id, error = %err, "closing session failed");
        }
        outcome
    }

    /// Writes the terminal status for a finished run.
    async fn settle(&self, id: Uuid, outcome: PaginationOutcome) {
        let patch = match &outcome {
            PaginationOutcome::Completed { .. } => JobPatch::status(JobStatus::Completed),
            PaginationOutcome::Failed { message } => JobPatch::failed(message.clone()),
            PaginationOutcome::Stopped { .. } => match self.store.get(id).await {
                Some(job) if job.status == JobStatus::Running => JobPatch::status(JobStatus::Paused),
                _ => {
                    info!(job_id = %id, ?outcome, "run stopped");
                    return;
                }
            },
        };
        match self.store.update(id, patch).await {
            Ok(Some(job)) => info!(job_id = %id, status = %job.status, total = job.total, "run finished"),
            Ok(None) => debug!(job_id = %id, "job deleted before its run finished"),
            Err(JobStoreError::IllegalTransition { from, to, .. }) => {
                warn!(job_id = %id, %from, %to, "job changed state while finishing; keeping {from}");
                if let PaginationOutcome::Failed { message } = outcome {
                    self.record_error(id, message).await;
                }
            }
            Err(err) => error!(job_id = %id, error = %err, "recording run outcome failed"),
        }
    }

    /// Stores a failure message without touching the status.
    async fn record_error(&self, id: Uuid, message: String) {
        let patch = JobPatch {
            error: Some(Some(message)),
            ..Default::default()
        };
        if let Err(err) = self.store.update(id, patch).await {
            error!(job_id = %id, error = %err, "recording run error failed");
        }
    }
}
