//! Session collaborator contracts, bulk target parsing and fixture-first sessions.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use leadx_core::{BulkUrlEntry, EnrichmentBatch, EnrichmentRecord, ExtractedRecord, Job};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const CRATE_NAME: &str = "leadx-adapters";

/// Query parameter the listing uses for its page cursor.
pub const PAGE_PARAM: &str = "page";

pub const BULK_TEMPLATE_CSV: &str = "url_number,url\n1,https://www.linkedin.com/sales/search/people?savedSearchId=12345\n2,https://www.linkedin.com/sales/search/people?savedSearchId=67890\n";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{source_name} session expired: {message}")]
    AuthExpired { source_name: String, message: String },
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },
    #[error("{operation} failed: {message}")]
    Navigation { operation: String, message: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SessionError {
    pub fn navigation(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Navigation {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn is_auth_expired(&self) -> bool {
        matches!(self, SessionError::AuthExpired { .. })
    }
}

/// Result of asking the listing for its next page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum PageAdvance {
    /// The listing moved; `page_number` is what the freshly loaded page reports, if readable.
    Moved { page_number: Option<u32> },
    /// The next control exists but is disabled: this was the last page.
    Disabled,
    /// No next control was found on the page.
    NextMissing,
    /// The control was clicked but the listing did not change.
    NoChange,
    /// The listing did not settle within the bounded wait.
    Timeout { waited_ms: u64 },
}

impl PageAdvance {
    pub fn reason(&self) -> String {
        match self {
            PageAdvance::Moved { .. } => "moved".to_string(),
            PageAdvance::Disabled => "disabled".to_string(),
            PageAdvance::NextMissing => "next-missing".to_string(),
            PageAdvance::NoChange => "no-change".to_string(),
            PageAdvance::Timeout { waited_ms } => format!("timeout after {waited_ms}ms"),
        }
    }
}

/// One live browser session bound to a single job. Enrichment sources read UI state of the
/// currently displayed page, so every call here is strictly sequential.
#[async_trait]
pub trait LeadSession: Send {
    async fn navigate(&mut self, url: &str) -> Result<(), SessionError>;

    /// Page number the loaded listing reports about itself.
    async fn current_page_number(&mut self) -> Result<Option<u32>, SessionError>;

    async fn extract_listing(&mut self) -> Result<Vec<ExtractedRecord>, SessionError>;

    /// Enrichment source names in the order they must be queried.
    fn enrichment_sources(&self) -> Vec<String>;

    async fn extract_enrichment(
        &mut self,
        source: &str,
    ) -> Result<Vec<EnrichmentRecord>, SessionError>;

    async fn reauthenticate(&mut self, source: &str) -> Result<(), SessionError>;

    async fn advance_page(&mut self) -> Result<PageAdvance, SessionError>;

    async fn close(&mut self) -> Result<(), SessionError>;
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, job: &Job) -> Result<Box<dyn LeadSession>, SessionError>;
}

/// Sets (or replaces) the page cursor on a listing URL.
pub fn with_page_param(url: &str, page: u32) -> Result<String, url::ParseError> {
    let mut parsed = Url::parse(url)?;
    let kept = parsed
        .query_pairs()
        .filter(|(k, _)| k != PAGE_PARAM)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect::<Vec<_>>();
    {
        let mut pairs = parsed.query_pairs_mut();
        pairs.clear();
        for (k, v) in &kept {
            pairs.append_pair(k, v);
        }
        pairs.append_pair(PAGE_PARAM, &page.to_string());
    }
    Ok(parsed.to_string())
}

/// Page cursor encoded in `url`, if any.
pub fn page_param(url: &str) -> Option<u32> {
    let parsed = Url::parse(url).ok()?;
    let page = parsed
        .query_pairs()
        .find(|(k, _)| k == PAGE_PARAM)
        .and_then(|(_, v)| v.parse().ok());
    page
}

/// The URL with its page cursor removed, used to identify a listing independent of position.
pub fn listing_key(url: &str) -> Option<String> {
    let mut parsed = Url::parse(url).ok()?;
    let kept = parsed
        .query_pairs()
        .filter(|(k, _)| k != PAGE_PARAM)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect::<Vec<_>>();
    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        parsed.query_pairs_mut().clear().extend_pairs(kept);
    }
    Some(parsed.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BulkCsvError {
    #[error("CSV is empty")]
    Empty,
    #[error("No valid rows found in CSV")]
    NoRows,
    #[error("{}", first_errors(.0))]
    InvalidRows(Vec<String>),
}

fn first_errors(errors: &[String]) -> String {
    errors.iter().take(3).cloned().collect::<Vec<_>>().join("; ")
}

fn detect_delimiter(line: &str) -> char {
    if line.contains('\t') {
        '\t'
    } else if line.contains(';') {
        ';'
    } else {
        ','
    }
}

fn clean_cell(cell: &str) -> String {
    let cell = cell.trim();
    let cell = cell.strip_prefix('"').unwrap_or(cell);
    let cell = cell.strip_suffix('"').unwrap_or(cell);
    cell.trim().to_string()
}

/// Absolute `http`/`https` URL with a host.
pub fn is_http_url(value: &str) -> bool {
    let lowered = value.to_ascii_lowercase();
    if !(lowered.starts_with("http://") || lowered.starts_with("https://")) {
        return false;
    }
    Url::parse(value)
        .map(|u| u.host_str().is_some_and(|h| !h.is_empty()))
        .unwrap_or(false)
}

/// Parses a bulk target list (`url_number`, `url`). Any invalid row rejects the whole batch;
/// line numbers in errors are physical lines of the input.
pub fn parse_bulk_csv(text: &str) -> Result<Vec<BulkUrlEntry>, BulkCsvError> {
    let lines = text
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty())
        .collect::<Vec<_>>();
    let Some(&(_, first_line)) = lines.first() else {
        return Err(BulkCsvError::Empty);
    };

    let delimiter = detect_delimiter(first_line);
    let split = |line: &str| {
        let mut cells = line.split(delimiter).map(clean_cell).collect::<Vec<_>>();
        while cells.len() > 2 && cells.last().is_some_and(|c| c.is_empty()) {
            cells.pop();
        }
        cells
    };
    let has_header = split(first_line)
        .iter()
        .any(|cell| cell.to_ascii_lowercase().contains("url"));

    let mut entries = Vec::new();
    let mut errors = Vec::new();
    for &(line_no, line) in lines.iter().skip(usize::from(has_header)) {
        let cells = split(line);
        if cells.len() != 2 {
            errors.push(format!("Line {line_no} must have 2 columns"));
            continue;
        }
        let url_number = match cells[0].parse::<u32>() {
            Ok(n) if n > 0 => n,
            _ => {
                errors.push(format!("Line {line_no} has invalid URL number"));
                continue;
            }
        };
        if !is_http_url(&cells[1]) {
            errors.push(format!("Line {line_no} has invalid URL"));
            continue;
        }
        entries.push(BulkUrlEntry {
            url_number,
            url: cells[1].clone(),
        });
    }

    if !errors.is_empty() {
        return Err(BulkCsvError::InvalidRows(errors));
    }
    if entries.is_empty() {
        return Err(BulkCsvError::NoRows);
    }
    Ok(entries)
}

/// Recorded listing used by the fixture session: every page with its rows and enrichment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingFixture {
    pub url: String,
    #[serde(default)]
    pub sources: Vec<String>,
    pub pages: Vec<FixturePage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixturePage {
    pub page_number: u32,
    #[serde(default)]
    pub records: Vec<ExtractedRecord>,
    #[serde(default)]
    pub enrichment: Vec<EnrichmentBatch>,
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Loads every `*.json` listing fixture in `dir`, in file-name order.
pub fn load_listing_fixtures(dir: impl AsRef<Path>) -> Result<Vec<ListingFixture>> {
    let dir = dir.as_ref();
    let mut paths = fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect::<Vec<_>>();
    paths.sort();
    paths.iter().map(|path| read_json_file(path)).collect()
}

/// Replays recorded listings page by page. Stands in for a live browser session.
#[derive(Debug, Clone)]
pub struct FixtureSession {
    listings: Vec<ListingFixture>,
    position: Option<(usize, usize)>,
}

impl FixtureSession {
    pub fn new(listings: Vec<ListingFixture>) -> Self {
        Self {
            listings,
            position: None,
        }
    }

    fn current(&self, operation: &str) -> Result<(&ListingFixture, &FixturePage), SessionError> {
        let (listing, page) = self
            .position
            .ok_or_else(|| SessionError::navigation(operation, "no listing loaded"))?;
        let listing = &self.listings[listing];
        Ok((listing, &listing.pages[page]))
    }
}

#[async_trait]
impl LeadSession for FixtureSession {
    async fn navigate(&mut self, url: &str) -> Result<(), SessionError> {
        let key = listing_key(url)
            .ok_or_else(|| SessionError::navigation("navigate", format!("invalid url {url}")))?;
        let listing_idx = self
            .listings
            .iter()
            .position(|l| listing_key(&l.url).as_deref() == Some(key.as_str()))
            .ok_or_else(|| SessionError::navigation("navigate", format!("no fixture for {url}")))?;
        let wanted = page_param(url).unwrap_or(1);
        let page_idx = self.listings[listing_idx]
            .pages
            .iter()
            .position(|p| p.page_number == wanted)
            .ok_or_else(|| {
                SessionError::navigation("navigate", format!("page {wanted} not recorded for {url}"))
            })?;
        debug!(url, page = wanted, "fixture navigate");
        self.position = Some((listing_idx, page_idx));
        Ok(())
    }

    async fn current_page_number(&mut self) -> Result<Option<u32>, SessionError> {
        Ok(self.position.map(|(l, p)| self.listings[l].pages[p].page_number))
    }

    async fn extract_listing(&mut self) -> Result<Vec<ExtractedRecord>, SessionError> {
        let (_, page) = self.current("extract listing")?;
        Ok(page.records.clone())
    }

    fn enrichment_sources(&self) -> Vec<String> {
        self.position
            .map(|(l, _)| self.listings[l].sources.clone())
            .unwrap_or_default()
    }

    async fn extract_enrichment(
        &mut self,
        source: &str,
    ) -> Result<Vec<EnrichmentRecord>, SessionError> {
        let (_, page) = self.current("extract enrichment")?;
        Ok(page
            .enrichment
            .iter()
            .find(|batch| batch.source == source)
            .map(|batch| batch.records.clone())
            .unwrap_or_default())
    }

    async fn reauthenticate(&mut self, _source: &str) -> Result<(), SessionError> {
        Ok(())
    }

    async fn advance_page(&mut self) -> Result<PageAdvance, SessionError> {
        let (listing_idx, page_idx) = self
            .position
            .ok_or_else(|| SessionError::navigation("advance page", "no listing loaded"))?;
        let pages = &self.listings[listing_idx].pages;
        if page_idx + 1 >= pages.len() {
            return Ok(PageAdvance::Disabled);
        }
        let page_number = pages[page_idx + 1].page_number;
        self.position = Some((listing_idx, page_idx + 1));
        Ok(PageAdvance::Moved {
            page_number: Some(page_number),
        })
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.position = None;
        Ok(())
    }
}

/// Opens a [`FixtureSession`] over the listing fixtures found in `root`.
#[derive(Debug, Clone)]
pub struct FixtureSessionFactory {
    root: PathBuf,
}

impl FixtureSessionFactory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl SessionFactory for FixtureSessionFactory {
    async fn open(&self, job: &Job) -> Result<Box<dyn LeadSession>, SessionError> {
        let listings = load_listing_fixtures(&self.root)?;
        debug!(job_id = %job.id, fixtures = listings.len(), "opening fixture session");
        Ok(Box::new(FixtureSession::new(listings)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadx_core::{EnrichmentBatch, EnrichmentRecord};
    use tempfile::tempdir;

    #[test]
    fn parses_headerless_comma_list_in_order() {
        let entries = parse_bulk_csv("1,https://x.com/a\n2,https://x.com/b").expect("parse");
        assert_eq!(
            entries,
            vec![
                BulkUrlEntry { url_number: 1, url: "https://x.com/a".into() },
                BulkUrlEntry { url_number: 2, url: "https://x.com/b".into() },
            ]
        );
    }

    #[test]
    fn rejects_batch_naming_bad_number_line() {
        let err = parse_bulk_csv("1,https://x.com/a\nabc,https://x.com/b").expect_err("bad row");
        assert_eq!(err, BulkCsvError::InvalidRows(vec!["Line 2 has invalid URL number".into()]));
        assert!(err.to_string().contains("Line 2"));
    }

    #[test]
    fn detects_header_and_semicolon_delimiter() {
        let text = "url_number;url\r\n\"3\";\"https://x.com/c\"\r\n4;https://x.com/d\r\n";
        let entries = parse_bulk_csv(text).expect("parse");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].url_number, 3);
        assert_eq!(entries[0].url, "https://x.com/c");
    }

    #[test]
    fn tab_delimited_lists_are_supported() {
        let entries = parse_bulk_csv("URL Number\tURL\n9\thttp://x.com/z\n").expect("parse");
        assert_eq!(entries, vec![BulkUrlEntry { url_number: 9, url: "http://x.com/z".into() }]);
    }

    #[test]
    fn aggregates_only_first_three_errors() {
        let text = "0,https://x.com/a\n1,ftp://x.com\n2\n3,https://x.com/d,extra\n";
        let err = parse_bulk_csv(text).expect_err("invalid");
        let message = err.to_string();
        assert_eq!(
            message,
            "Line 1 has invalid URL number; Line 2 has invalid URL; Line 3 must have 2 columns"
        );
        assert!(!message.contains("Line 4"));
    }

    #[test]
    fn empty_and_header_only_inputs_are_rejected() {
        assert_eq!(parse_bulk_csv("  \n\n"), Err(BulkCsvError::Empty));
        assert_eq!(parse_bulk_csv("url_number,url\n"), Err(BulkCsvError::NoRows));
    }

    #[test]
    fn trailing_empty_cells_are_tolerated() {
        let entries = parse_bulk_csv("1,https://x.com/a,,\n").expect("parse");
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn bulk_template_parses() {
        assert_eq!(parse_bulk_csv(BULK_TEMPLATE_CSV).expect("template").len(), 2);
    }

    #[test]
    fn page_param_is_replaced_not_duplicated() {
        let url = with_page_param("https://x.com/search?q=cto&page=2", 5).expect("url");
        assert_eq!(url, "https://x.com/search?q=cto&page=5");
        assert_eq!(page_param(&url), Some(5));
        assert_eq!(listing_key(&url).as_deref(), Some("https://x.com/search?q=cto"));
        assert_eq!(listing_key("https://x.com/s?page=3").as_deref(), Some("https://x.com/s"));
    }

    fn fixture() -> ListingFixture {
        ListingFixture {
            url: "https://x.com/search?q=cto".into(),
            sources: vec!["lusha".into()],
            pages: (1..=3)
                .map(|n| FixturePage {
                    page_number: n,
                    records: vec![ExtractedRecord::from_full_name(&format!("Lead {n}"), "Acme")],
                    enrichment: vec![EnrichmentBatch::new(
                        "lusha",
                        vec![EnrichmentRecord {
                            first_name: "lead".into(),
                            company_name: String::new(),
                            domains: vec![format!("p{n}.com")],
                        }],
                    )],
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn fixture_session_navigates_directly_and_reports_last_page() {
        let mut session = FixtureSession::new(vec![fixture()]);
        session
            .navigate("https://x.com/search?q=cto&page=2")
            .await
            .expect("navigate");
        assert_eq!(session.current_page_number().await.expect("page"), Some(2));
        assert_eq!(session.enrichment_sources(), vec!["lusha".to_string()]);
        let lusha = session.extract_enrichment("lusha").await.expect("lusha");
        assert_eq!(lusha[0].domains, vec!["p2.com".to_string()]);

        assert_eq!(
            session.advance_page().await.expect("advance"),
            PageAdvance::Moved { page_number: Some(3) }
        );
        assert_eq!(session.advance_page().await.expect("advance"), PageAdvance::Disabled);
    }

    #[tokio::test]
    async fn fixture_session_rejects_unrecorded_pages() {
        let mut session = FixtureSession::new(vec![fixture()]);
        let err = session
            .navigate("https://x.com/search?q=cto&page=9")
            .await
            .expect_err("missing page");
        assert!(err.to_string().contains("page 9"));
    }

    #[test]
    fn bundled_workspace_fixtures_parse() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures");
        let listings = load_listing_fixtures(root).expect("fixtures");
        let cto = listings
            .iter()
            .find(|l| l.url.contains("savedSearchId=12345"))
            .expect("cto listing");
        assert_eq!(cto.sources, vec!["lusha".to_string(), "contactout".to_string()]);
        assert_eq!(cto.pages.len(), 2);
    }

    #[tokio::test]
    async fn factory_loads_fixture_directory() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("cto.json"),
            serde_json::to_vec(&fixture()).expect("json"),
        )
        .expect("write");
        std::fs::write(dir.path().join("notes.txt"), "ignored").expect("write");

        let listings = load_listing_fixtures(dir.path()).expect("load");
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].pages.len(), 3);
    }
}
