//! Core domain model for LeadX: jobs, lifecycle states, bulk targets and lead records.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "leadx-core";

/// Lifecycle state of a job. `Paused` and `Stopped` both mean "halt at the next checkpoint".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Stopped,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_stop_requested(self) -> bool {
        matches!(self, JobStatus::Paused | JobStatus::Stopped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "Pending",
            JobStatus::Running => "Running",
            JobStatus::Paused => "Paused",
            JobStatus::Stopped => "Stopped",
            JobStatus::Completed => "Completed",
            JobStatus::Failed => "Failed",
        }
    }

    /// Transition table for the job lifecycle. Re-asserting the current status is always allowed.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        if self == next {
            return true;
        }
        match self {
            Pending => matches!(next, Running | Paused | Stopped | Failed),
            Running => matches!(next, Paused | Stopped | Completed | Failed),
            Paused => matches!(next, Running | Stopped),
            Stopped | Failed => next == Running,
            Completed => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of a bulk campaign target list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkUrlEntry {
    pub url_number: u32,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "value")]
pub enum JobTarget {
    Single(String),
    Bulk(Vec<BulkUrlEntry>),
}

/// Creation request handed to the job store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub list_name: String,
    pub target: JobTarget,
    pub file_path: PathBuf,
}

/// Timing and row counts for the most recently persisted page.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageTiming {
    pub page_number: u32,
    pub rows_added: u64,
    pub page_seconds: f64,
    pub source_seconds: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub list_name: String,
    pub target_url: String,
    pub file_path: PathBuf,
    pub status: JobStatus,
    pub total: u64,
    pub page_index: u32,
    pub url_number: u32,
    pub error: Option<String>,
    pub bulk: bool,
    #[serde(default)]
    pub bulk_urls: Vec<BulkUrlEntry>,
    #[serde(default)]
    pub bulk_index: usize,
    #[serde(default)]
    pub bulk_total: usize,
    #[serde(default)]
    pub last_page: Option<PageTiming>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(spec: JobSpec, now: DateTime<Utc>) -> Self {
        let (target_url, url_number, bulk, bulk_urls) = match spec.target {
            JobTarget::Single(url) => (url, 1, false, Vec::new()),
            JobTarget::Bulk(entries) => {
                let (url, number) = entries
                    .first()
                    .map(|e| (e.url.clone(), e.url_number))
                    .unwrap_or_else(|| (String::new(), 1));
                (url, number, true, entries)
            }
        };
        Self {
            id: Uuid::new_v4(),
            list_name: spec.list_name,
            target_url,
            file_path: spec.file_path,
            status: JobStatus::Pending,
            total: 0,
            page_index: 0,
            url_number,
            error: None,
            bulk,
            bulk_total: bulk_urls.len(),
            bulk_urls,
            bulk_index: 0,
            last_page: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Applies a patch without lifecycle checks; the store validates transitions first.
    /// `total` only ever moves forward.
    pub fn apply(&mut self, patch: JobPatch, now: DateTime<Utc>) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(target_url) = patch.target_url {
            self.target_url = target_url;
        }
        if let Some(total) = patch.total {
            self.total = self.total.max(total);
        }
        if let Some(page_index) = patch.page_index {
            self.page_index = page_index;
        }
        if let Some(url_number) = patch.url_number {
            self.url_number = url_number;
        }
        if let Some(error) = patch.error {
            self.error = error;
        }
        if let Some(bulk_index) = patch.bulk_index {
            self.bulk_index = bulk_index;
        }
        if let Some(last_page) = patch.last_page {
            self.last_page = Some(last_page);
        }
        self.updated_at = now;
    }

    /// True when `entry` is the exact `{url, urlNumber}` pair this job last worked on.
    pub fn is_positioned_at(&self, entry: &BulkUrlEntry) -> bool {
        self.target_url == entry.url && self.url_number == entry.url_number
    }
}

/// Partial update for a job. `None` leaves a field untouched; `error: Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub target_url: Option<String>,
    pub total: Option<u64>,
    pub page_index: Option<u32>,
    pub url_number: Option<u32>,
    pub error: Option<Option<String>>,
    pub bulk_index: Option<usize>,
    pub last_page: Option<PageTiming>,
}

impl JobPatch {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error: Some(Some(message.into())),
            ..Default::default()
        }
    }

    pub fn running() -> Self {
        Self {
            status: Some(JobStatus::Running),
            error: Some(None),
            ..Default::default()
        }
    }
}

/// Lead row produced by the listing extractor and completed by enrichment sources.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExtractedRecord {
    pub full_name: String,
    pub first_name: String,
    pub last_name: String,
    pub title: String,
    pub company_name: String,
    pub person_linkedin: String,
    pub person_city: String,
    pub person_state: String,
    pub person_country: String,
    pub linkedin_premium: String,
    pub in_role: String,
    pub in_company: String,
    pub linkedin_url: String,
    pub domains: Vec<String>,
    pub url_number: u32,
    pub page_number: u32,
}

impl ExtractedRecord {
    /// Builds a record whose first/last names are derived from `full_name`.
    pub fn from_full_name(full_name: &str, company_name: &str) -> Self {
        let (first_name, last_name) = split_full_name(full_name);
        Self {
            full_name: full_name.trim().to_string(),
            first_name,
            last_name,
            company_name: company_name.trim().to_string(),
            ..Default::default()
        }
    }

    pub fn has_domains(&self) -> bool {
        !self.domains.is_empty()
    }
}

/// Partial identity plus payload reported by one enrichment source.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EnrichmentRecord {
    pub first_name: String,
    pub company_name: String,
    pub domains: Vec<String>,
}

/// All records one enrichment source produced for the current page.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EnrichmentBatch {
    pub source: String,
    pub records: Vec<EnrichmentRecord>,
}

impl EnrichmentBatch {
    pub fn new(source: impl Into<String>, records: Vec<EnrichmentRecord>) -> Self {
        Self {
            source: source.into(),
            records,
        }
    }
}

/// Identity key used for cross-source matching.
pub fn normalize_identity(input: &str) -> String {
    input.trim().to_lowercase()
}

pub fn split_full_name(full_name: &str) -> (String, String) {
    let mut parts = full_name.split_whitespace();
    let first = parts.next().unwrap_or_default().to_string();
    let rest = parts.collect::<Vec<_>>().join(" ");
    (first, rest)
}

/// File-name-safe form of a list name; falls back to `job`.
pub fn slugify_list_name(list_name: &str) -> String {
    let lowered = list_name.to_lowercase();
    let mut slug = String::with_capacity(lowered.len());
    for c in lowered.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "job".to_string()
    } else {
        slug.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(target: JobTarget) -> JobSpec {
        JobSpec {
            list_name: "Founders".into(),
            target,
            file_path: PathBuf::from("data/founders.csv"),
        }
    }

    #[test]
    fn new_bulk_job_points_at_first_entry() {
        let job = Job::new(
            spec(JobTarget::Bulk(vec![
                BulkUrlEntry { url_number: 7, url: "https://x.com/a".into() },
                BulkUrlEntry { url_number: 8, url: "https://x.com/b".into() },
            ])),
            Utc::now(),
        );
        assert!(job.bulk);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.target_url, "https://x.com/a");
        assert_eq!(job.url_number, 7);
        assert_eq!(job.bulk_total, 2);
        assert_eq!(job.total, 0);
        assert_eq!(job.page_index, 0);
    }

    #[test]
    fn total_never_moves_backwards() {
        let mut job = Job::new(spec(JobTarget::Single("https://x.com".into())), Utc::now());
        job.apply(JobPatch { total: Some(12), ..Default::default() }, Utc::now());
        job.apply(JobPatch { total: Some(4), ..Default::default() }, Utc::now());
        assert_eq!(job.total, 12);
    }

    #[test]
    fn lifecycle_table_rejects_leaving_completed() {
        assert!(JobStatus::Running.can_transition_to(JobStatus::Paused));
        assert!(JobStatus::Paused.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Failed.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Paused.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Completed.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn error_patch_can_clear_message() {
        let mut job = Job::new(spec(JobTarget::Single("https://x.com".into())), Utc::now());
        job.apply(JobPatch::failed("boom"), Utc::now());
        assert_eq!(job.error.as_deref(), Some("boom"));
        job.apply(JobPatch::running(), Utc::now());
        assert_eq!(job.error, None);
        assert_eq!(job.status, JobStatus::Running);
    }

    #[test]
    fn names_split_and_slugs_are_stable() {
        assert_eq!(
            split_full_name("  Jane  van Dyke "),
            ("Jane".to_string(), "van Dyke".to_string())
        );
        assert_eq!(slugify_list_name("Q3 Leads / EMEA!"), "q3-leads-emea");
        assert_eq!(slugify_list_name("***"), "job");
        assert_eq!(normalize_identity("  ACME Corp "), "acme corp");
    }

    #[test]
    fn job_serializes_with_camel_case_fields() {
        let job = Job::new(spec(JobTarget::Single("https://x.com".into())), Utc::now());
        let value = serde_json::to_value(&job).expect("serialize");
        assert!(value.get("listName").is_some());
        assert!(value.get("pageIndex").is_some());
        assert_eq!(value["status"], "Pending");
    }
}
