//! Spreadsheet annotation pipeline: column mapping, row-by-row link checks,
//! status write-back into the uploaded workbook.

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use slc_checker::{
    is_marketplace_link, ApiBase, CheckerConfig, IdentifierExtractor, LivenessChecker,
    MarkerRules, MarkerRulesError, RunContext,
};
use slc_core::{CellValue, CheckOutcome, ColumnMapping, RowRecord, RunSummary, STATUS_BLANK};
use slc_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher, JitterRateLimiter, ResultStore, StoredResult};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "slc-annotate";

pub const RESULTS_FILE_NAME: &str = "shopee_link_results.xlsx";
pub const SUMMARY_FILE_NAME: &str = "run_summary.json";

/// Placeholder prefix for columns whose header cell is blank.
pub const EMPTY_KEY_PREFIX: &str = "__EMPTY";

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub api_base: Option<String>,
    pub user_agent: String,
    pub api_timeout_secs: u64,
    pub page_timeout_secs: u64,
    pub rate_min_ms: u64,
    pub rate_max_ms: u64,
    pub max_attempts: usize,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub markers_file: Option<PathBuf>,
    pub output_dir: PathBuf,
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            api_base: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            api_timeout_secs: 15,
            page_timeout_secs: 10,
            rate_min_ms: 2000,
            rate_max_ms: 5000,
            max_attempts: 3,
            backoff_base_ms: 1500,
            backoff_max_ms: 6000,
            markers_file: None,
            output_dir: PathBuf::from("./results"),
        }
    }
}

impl RunConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_base: std::env::var("SLC_API_BASE").ok().filter(|v| !v.trim().is_empty()),
            user_agent: std::env::var("SLC_USER_AGENT").unwrap_or(defaults.user_agent),
            api_timeout_secs: env_parse("SLC_API_TIMEOUT_SECS", defaults.api_timeout_secs),
            page_timeout_secs: env_parse("SLC_PAGE_TIMEOUT_SECS", defaults.page_timeout_secs),
            rate_min_ms: env_parse("SLC_RATE_MIN_MS", defaults.rate_min_ms),
            rate_max_ms: env_parse("SLC_RATE_MAX_MS", defaults.rate_max_ms),
            max_attempts: env_parse("SLC_MAX_ATTEMPTS", defaults.max_attempts).max(1),
            backoff_base_ms: env_parse("SLC_BACKOFF_BASE_MS", defaults.backoff_base_ms),
            backoff_max_ms: env_parse("SLC_BACKOFF_MAX_MS", defaults.backoff_max_ms),
            markers_file: std::env::var("SLC_MARKERS_FILE").ok().map(PathBuf::from),
            output_dir: std::env::var("SLC_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
        }
    }

    pub fn checker_config(&self) -> Result<CheckerConfig, MarkerRulesError> {
        let markers = match &self.markers_file {
            Some(path) => MarkerRules::load(path)?,
            None => MarkerRules::default(),
        };
        Ok(CheckerConfig {
            api_base: ApiBase::from_option(self.api_base.clone()),
            api_timeout: Duration::from_secs(self.api_timeout_secs),
            page_timeout: Duration::from_secs(self.page_timeout_secs),
            max_attempts: self.max_attempts.max(1),
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(self.backoff_base_ms),
                max_delay: Duration::from_millis(self.backoff_max_ms),
            },
            markers,
            ..CheckerConfig::default()
        })
    }

    pub fn rate_limiter(&self) -> JitterRateLimiter {
        JitterRateLimiter::new(
            Duration::from_millis(self.rate_min_ms),
            Duration::from_millis(self.rate_max_ms),
        )
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            user_agent: Some(self.user_agent.clone()),
            ..HttpClientConfig::default()
        }
    }
}

/// Column-mapping rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRules {
    pub link_display_name: String,
    pub link_token: String,
    pub domain_keywords: Vec<String>,
    pub fallback_link_key: String,
    pub status_key: String,
    pub marketplace_token: String,
}

impl Default for ColumnRules {
    fn default() -> Self {
        Self {
            link_display_name: "Link tin bài đăng bán sản phẩm".to_string(),
            link_token: "link".to_string(),
            domain_keywords: vec!["bán".into(), "sản".into(), "product".into()],
            fallback_link_key: format!("{EMPTY_KEY_PREFIX}_2"),
            status_key: format!("{EMPTY_KEY_PREFIX}_3"),
            marketplace_token: "shopee".to_string(),
        }
    }
}

/// Resolve link/status keys from the first row's key shape.
pub fn resolve_columns(rows: &[RowRecord], rules: &ColumnRules) -> ColumnMapping {
    let keys: Vec<&str> = rows.first().map(|r| r.keys().collect()).unwrap_or_default();
    let display = rules.link_display_name.trim().to_lowercase();

    let exact = keys
        .iter()
        .find(|k| k.trim().to_lowercase() == display)
        .map(|k| k.to_string());

    let heuristic = || {
        let token = rules.link_token.to_lowercase();
        keys.iter()
            .find(|k| {
                let lowered = k.to_lowercase();
                lowered.contains(&token)
                    && rules
                        .domain_keywords
                        .iter()
                        .any(|kw| lowered.contains(&kw.to_lowercase()))
            })
            .map(|k| k.to_string())
    };

    let link_column_key = exact
        .or_else(heuristic)
        .unwrap_or_else(|| rules.fallback_link_key.clone());

    ColumnMapping {
        link_column_key,
        status_column_key: rules.status_key.clone(),
    }
}

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("workbook could not be parsed: {0}")]
    Parse(String),
    #[error("workbook has no worksheets")]
    NoSheet,
    #[error("workbook could not be written: {0}")]
    Write(String),
}

/// First-sheet view of an uploaded document. Rows and columns are 0-based;
/// row 0 is the header row.
pub trait TabularDocument {
    fn dimensions(&self) -> (u32, u32);
    fn cell(&self, row: u32, column: u32) -> CellValue;
    /// Overwrite the value only; existing formatting stays.
    fn set_cell_text(&mut self, row: u32, column: u32, text: &str);
    fn extend_used_columns(&mut self, columns: u32);
}

/// `.xlsx` workbook backed by umya-spreadsheet.
pub struct XlsxDocument {
    book: umya_spreadsheet::Spreadsheet,
    used_columns: u32,
}

impl XlsxDocument {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DocumentError> {
        let book = umya_spreadsheet::reader::xlsx::read_reader(Cursor::new(bytes), true)
            .map_err(|e| DocumentError::Parse(e.to_string()))?;
        let used_columns = book
            .get_sheet(&0)
            .ok_or(DocumentError::NoSheet)?
            .get_highest_column_and_row()
            .0;
        Ok(Self { book, used_columns })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, DocumentError> {
        let mut cursor = Cursor::new(Vec::new());
        umya_spreadsheet::writer::xlsx::write_writer(&self.book, &mut cursor)
            .map_err(|e| DocumentError::Write(e.to_string()))?;
        Ok(cursor.into_inner())
    }

    pub fn used_columns(&self) -> u32 {
        self.used_columns
    }
}

impl TabularDocument for XlsxDocument {
    fn dimensions(&self) -> (u32, u32) {
        match self.book.get_sheet(&0) {
            Some(sheet) => {
                let (columns, rows) = sheet.get_highest_column_and_row();
                (rows, columns.max(self.used_columns))
            }
            None => (0, 0),
        }
    }

    fn cell(&self, row: u32, column: u32) -> CellValue {
        let Some(cell) = self
            .book
            .get_sheet(&0)
            .and_then(|sheet| sheet.get_cell((column + 1, row + 1)))
        else {
            return CellValue::Blank;
        };

        let raw = cell.get_value();
        if raw.is_empty() {
            return CellValue::Blank;
        }
        match cell.get_data_type() {
            "n" => raw
                .parse::<f64>()
                .map(CellValue::Number)
                .unwrap_or_else(|_| CellValue::Text(raw.to_string())),
            "b" => CellValue::Bool(raw == "1" || raw.eq_ignore_ascii_case("true")),
            _ => CellValue::Text(raw.to_string()),
        }
    }

    fn set_cell_text(&mut self, row: u32, column: u32, text: &str) {
        if let Some(sheet) = self.book.get_sheet_mut(&0) {
            sheet
                .get_cell_mut((column + 1, row + 1))
                .set_value_string(text);
        }
    }

    fn extend_used_columns(&mut self, columns: u32) {
        // The sheet dimension is recomputed from populated cells on write.
        self.used_columns = self.used_columns.max(columns);
    }
}

/// Rows of the first sheet keyed by header text.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Dataset {
    /// Header keys with their absolute sheet column.
    pub columns: Vec<(String, u32)>,
    pub rows: Vec<RowRecord>,
    /// Sheet row and column of the table's top-left corner.
    pub header_row: u32,
    pub first_column: u32,
}

impl Dataset {
    /// Column for `key`: its header position, `__EMPTY_N` → `N + 1` counted
    /// from the table's first column, or the first column past the header.
    pub fn column_index(&self, key: &str) -> u32 {
        if let Some((_, index)) = self.columns.iter().find(|(k, _)| k == key) {
            return *index;
        }
        if let Some(n) = key
            .strip_prefix(EMPTY_KEY_PREFIX)
            .and_then(|rest| rest.strip_prefix('_'))
            .and_then(|n| n.parse::<u32>().ok())
        {
            return self.first_column + n + 1;
        }
        self.columns
            .iter()
            .map(|(_, i)| i + 1)
            .max()
            .unwrap_or(self.first_column)
    }
}

fn header_key(value: &CellValue) -> Option<String> {
    if value.is_blank() {
        None
    } else {
        Some(value.to_string().trim().to_string())
    }
}

/// Top-left corner of the populated area: first non-blank row, then the
/// first column holding anything at or below it.
fn table_origin<D: TabularDocument + ?Sized>(document: &D) -> Option<(u32, u32)> {
    let (row_count, column_count) = document.dimensions();
    let header_row = (0..row_count)
        .find(|&row| (0..column_count).any(|column| !document.cell(row, column).is_blank()))?;
    let first_column = (0..column_count).find(|&column| {
        (header_row..row_count).any(|row| !document.cell(row, column).is_blank())
    })?;
    Some((header_row, first_column))
}

/// Header row and data rows of the first sheet. Leading blank rows and
/// columns are skipped; `sheet_row` stays absolute.
pub fn read_dataset<D: TabularDocument + ?Sized>(document: &D) -> Dataset {
    let Some((header_row, first_column)) = table_origin(document) else {
        return Dataset::default();
    };
    let (row_count, column_count) = document.dimensions();

    let mut columns: Vec<(String, u32)> =
        Vec::with_capacity((column_count - first_column) as usize);
    let mut blank_headers = 0usize;
    for column in first_column..column_count {
        let key = match header_key(&document.cell(header_row, column)) {
            Some(text) => {
                let mut key = text.clone();
                let mut suffix = 1;
                while columns.iter().any(|(k, _)| *k == key) {
                    key = format!("{text}_{suffix}");
                    suffix += 1;
                }
                key
            }
            None => {
                let key = if blank_headers == 0 {
                    EMPTY_KEY_PREFIX.to_string()
                } else {
                    format!("{EMPTY_KEY_PREFIX}_{blank_headers}")
                };
                blank_headers += 1;
                key
            }
        };
        columns.push((key, column));
    }

    let rows = (header_row + 1..row_count)
        .filter_map(|row| {
            let cells: Vec<(String, CellValue)> = columns
                .iter()
                .map(|(key, column)| (key.clone(), document.cell(row, *column)))
                .collect();
            if cells.iter().all(|(_, v)| v.is_blank()) {
                None
            } else {
                Some(RowRecord::with_cells(row, cells))
            }
        })
        .collect();

    Dataset {
        columns,
        rows,
        header_row,
        first_column,
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("could not read the uploaded workbook: {0}")]
    DocumentParse(#[source] DocumentError),
    #[error("could not produce the annotated workbook: {0}")]
    DocumentWrite(#[source] DocumentError),
    #[error("run cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusWrite {
    pub row: u32,
    pub column: u32,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub rows: Vec<RowRecord>,
    pub writes: Vec<StatusWrite>,
    pub status_column: u32,
    pub marketplace_links: usize,
    pub live_links: usize,
}

impl Annotation {
    pub fn mirror_into<D: TabularDocument + ?Sized>(&self, document: &mut D) {
        for write in &self.writes {
            document.set_cell_text(write.row, write.column, &write.value);
        }
        let (_, used_columns) = document.dimensions();
        if self.status_column >= used_columns {
            document.extend_used_columns(self.status_column + 1);
        }
    }
}

pub struct RowAnnotator<'a> {
    pub extractor: &'a IdentifierExtractor,
    pub checker: &'a LivenessChecker,
    pub marketplace_token: &'a str,
}

impl<'a> RowAnnotator<'a> {
    /// Check every row in order and write its status into the row set and the document.
    pub async fn annotate<D: TabularDocument + Send + ?Sized>(
        &self,
        dataset: Dataset,
        document: &mut D,
        mapping: &ColumnMapping,
        ctx: &RunContext,
    ) -> Result<Annotation, RunError> {
        let annotation = self.annotate_rows(dataset, mapping, ctx).await?;
        annotation.mirror_into(document);
        Ok(annotation)
    }

    /// Sequential per-row checks; document writes are returned, not applied.
    pub async fn annotate_rows(
        &self,
        dataset: Dataset,
        mapping: &ColumnMapping,
        ctx: &RunContext,
    ) -> Result<Annotation, RunError> {
        let status_column = dataset.column_index(&mapping.status_column_key);
        let link_of = |row: &RowRecord| {
            row.get(&mapping.link_column_key)
                .and_then(CellValue::as_text)
                .filter(|link| is_marketplace_link(link, self.marketplace_token))
                .map(str::to_string)
        };
        let total = dataset.rows.iter().filter(|r| link_of(r).is_some()).count();
        info!(
            link_column = %mapping.link_column_key,
            status_column = %mapping.status_column_key,
            rows = dataset.rows.len(),
            links = total,
            "annotating rows"
        );

        let mut rows = Vec::with_capacity(dataset.rows.len());
        let mut writes = Vec::with_capacity(dataset.rows.len());
        let mut current = 0usize;
        let mut live_links = 0usize;

        for mut row in dataset.rows {
            if ctx.is_cancelled() {
                warn!(processed = rows.len(), "run cancelled at row boundary");
                return Err(RunError::Cancelled);
            }

            let status = match link_of(&row) {
                Some(link) => {
                    current += 1;
                    let span = info_span!("row_check", sheet_row = row.sheet_row, current, total);
                    let outcome = async {
                        info!(url = %link, "checking link");
                        let identifier = self.extractor.extract(&link);
                        self.checker.check(identifier.as_ref(), &link, ctx).await
                    }
                    .instrument(span)
                    .await;
                    if outcome == CheckOutcome::Exists {
                        live_links += 1;
                    }
                    outcome.status_marker()
                }
                None => STATUS_BLANK,
            };

            row.set(&mapping.status_column_key, CellValue::Text(status.to_string()));
            writes.push(StatusWrite {
                row: row.sheet_row,
                column: status_column,
                value: status.to_string(),
            });
            rows.push(row);
        }

        if ctx.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        Ok(Annotation {
            rows,
            writes,
            status_column,
            marketplace_links: total,
            live_links,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub workbook: Vec<u8>,
    pub rows: Vec<RowRecord>,
    pub mapping: ColumnMapping,
    pub summary: RunSummary,
}

/// Everything one upload needs, minus the per-run dedup state.
pub struct LinkCheckPipeline {
    extractor: IdentifierExtractor,
    checker: LivenessChecker,
    rules: ColumnRules,
    limiter: Arc<JitterRateLimiter>,
}

impl LinkCheckPipeline {
    pub fn new(
        extractor: IdentifierExtractor,
        checker: LivenessChecker,
        rules: ColumnRules,
        limiter: Arc<JitterRateLimiter>,
    ) -> Self {
        Self {
            extractor,
            checker,
            rules,
            limiter,
        }
    }

    pub fn from_config(config: &RunConfig) -> anyhow::Result<Self> {
        let fetcher = HttpFetcher::new(config.http_client_config())?;
        let checker_config = config
            .checker_config()
            .context("loading page marker rules")?;
        Ok(Self::new(
            IdentifierExtractor::shopee(),
            LivenessChecker::new(Arc::new(fetcher), checker_config),
            ColumnRules::default(),
            Arc::new(config.rate_limiter()),
        ))
    }

    pub fn checker(&self) -> &LivenessChecker {
        &self.checker
    }

    pub fn rules(&self) -> &ColumnRules {
        &self.rules
    }

    pub fn limiter(&self) -> &JitterRateLimiter {
        &self.limiter
    }

    pub async fn run_workbook(
        &self,
        bytes: &[u8],
        cancel: CancellationToken,
    ) -> Result<RunOutput, RunError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("link_check_run", %run_id);

        async move {
            // The workbook is not held across awaits; it is reopened for the write-back.
            let dataset = {
                let document = XlsxDocument::from_bytes(bytes).map_err(RunError::DocumentParse)?;
                read_dataset(&document)
            };
            let total_rows = dataset.rows.len();
            let mapping = resolve_columns(&dataset.rows, &self.rules);

            let ctx = RunContext::new(self.limiter.clone(), cancel);
            let annotator = RowAnnotator {
                extractor: &self.extractor,
                checker: &self.checker,
                marketplace_token: &self.rules.marketplace_token,
            };
            let annotation = annotator.annotate_rows(dataset, &mapping, &ctx).await?;

            let mut document = XlsxDocument::from_bytes(bytes).map_err(RunError::DocumentParse)?;
            annotation.mirror_into(&mut document);
            let workbook = document.to_bytes().map_err(RunError::DocumentWrite)?;

            let summary = RunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                total_rows,
                marketplace_links: annotation.marketplace_links,
                live_links: annotation.live_links,
                missing_links: annotation.marketplace_links - annotation.live_links,
            };
            info!(
                rows = summary.total_rows,
                links = summary.marketplace_links,
                live = summary.live_links,
                "run complete"
            );

            Ok(RunOutput {
                workbook,
                rows: annotation.rows,
                mapping,
                summary,
            })
        }
        .instrument(span)
        .await
    }
}

/// Persist the annotated workbook and the run summary.
pub async fn write_results(
    store: &ResultStore,
    output: &RunOutput,
) -> anyhow::Result<(StoredResult, StoredResult)> {
    let workbook = store
        .store_bytes(RESULTS_FILE_NAME, &output.workbook)
        .await
        .context("writing annotated workbook")?;
    let summary_json =
        serde_json::to_vec_pretty(&output.summary).context("serializing run summary")?;
    let summary = store
        .store_bytes(SUMMARY_FILE_NAME, &summary_json)
        .await
        .context("writing run summary")?;
    Ok((workbook, summary))
}
