//! Product-link liveness checking: identifier extraction, marketplace API
//! probing with retry/backoff, and the direct page fallback.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use scraper::Html;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use slc_core::{CheckOutcome, ProductIdentifier};
use slc_storage::{
    classify_status, BackoffPolicy, FetchedResponse, JitterRateLimiter, ProbeRequest,
    ProbeTransport, RetryDisposition,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use url::Url;

pub const CRATE_NAME: &str = "slc-checker";

pub const DEFAULT_LOCALE: &str = "vn";

/// Trim whitespace and trailing slashes off a link cell.
pub fn normalize_link(link: &str) -> &str {
    link.trim().trim_end_matches('/')
}

/// Case-insensitive substring test against the marketplace token.
pub fn is_marketplace_link(link: &str, marketplace_token: &str) -> bool {
    !marketplace_token.is_empty()
        && link
            .to_lowercase()
            .contains(&marketplace_token.to_lowercase())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlPart {
    Path,
    Query,
    Fragment,
}

#[derive(Debug, Clone)]
enum RuleMatcher {
    /// Regex with named `shop` and `item` groups.
    Captures(Regex),
    /// `shopid`/`shop_id` + `itemid`/`item_id` key-value pairs.
    Params,
}

#[derive(Debug, Clone)]
pub struct PatternRule {
    pub name: &'static str,
    pub part: UrlPart,
    matcher: RuleMatcher,
}

impl PatternRule {
    pub fn captures(name: &'static str, part: UrlPart, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            name,
            part,
            matcher: RuleMatcher::Captures(Regex::new(pattern)?),
        })
    }

    pub fn params(name: &'static str, part: UrlPart) -> Self {
        Self {
            name,
            part,
            matcher: RuleMatcher::Params,
        }
    }

    fn apply(&self, url: &Url) -> Option<(String, String)> {
        let haystack = match self.part {
            UrlPart::Path => url.path(),
            UrlPart::Query => url.query()?,
            UrlPart::Fragment => {
                let fragment = url.fragment()?;
                fragment.split_once('?').map_or(fragment, |(_, q)| q)
            }
        };

        match &self.matcher {
            RuleMatcher::Captures(re) => {
                let caps = re.captures(haystack)?;
                Some((caps.name("shop")?.as_str().to_string(), caps.name("item")?.as_str().to_string()))
            }
            RuleMatcher::Params => {
                let mut shop = None;
                let mut item = None;
                for (key, value) in url::form_urlencoded::parse(haystack.as_bytes()) {
                    let value = value.trim();
                    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
                        continue;
                    }
                    match key.to_ascii_lowercase().as_str() {
                        "shopid" | "shop_id" => shop = shop.or_else(|| Some(value.to_string())),
                        "itemid" | "item_id" => item = item.or_else(|| Some(value.to_string())),
                        _ => {}
                    }
                }
                Some((shop?, item?))
            }
        }
    }
}

/// Ordered rule list; the first rule yielding both ids wins.
#[derive(Debug, Clone)]
pub struct IdentifierExtractor {
    rules: Vec<PatternRule>,
    locales: Vec<(&'static str, &'static str)>,
    default_locale: String,
}

impl Default for IdentifierExtractor {
    fn default() -> Self {
        Self::shopee()
    }
}

impl IdentifierExtractor {
    pub fn shopee() -> Self {
        let rules = vec![
            PatternRule::captures(
                "slug_shop_item",
                UrlPart::Path,
                r"(?:-|/)i\.(?P<shop>\d+)\.(?P<item>\d+)",
            ),
            PatternRule::captures(
                "item_then_shop",
                UrlPart::Path,
                r"/item/(?P<item>\d+)/shop/(?P<shop>\d+)(?:/|$)",
            ),
            PatternRule::captures(
                "nested_product",
                UrlPart::Path,
                r"/product/(?P<shop>\d+)/(?P<item>\d+)(?:/|$)",
            ),
        ]
        .into_iter()
        .map(|rule| rule.expect("static identifier pattern"))
        .chain([
            PatternRule::params("query_params", UrlPart::Query),
            PatternRule::params("fragment_params", UrlPart::Fragment),
        ])
        .collect();

        Self {
            rules,
            // Longer suffixes first so `.co.id` wins over a bare `.id`.
            locales: vec![
                (".com.my", "com.my"),
                (".co.th", "co.th"),
                (".co.id", "co.id"),
                (".sg", "sg"),
                (".ph", "ph"),
                (".tw", "tw"),
                (".vn", "vn"),
            ],
            default_locale: DEFAULT_LOCALE.to_string(),
        }
    }

    pub fn locale_for_host(&self, host: &str) -> String {
        let host = host.to_ascii_lowercase();
        self.locales
            .iter()
            .find(|(suffix, _)| host.ends_with(suffix))
            .map(|(_, locale)| locale.to_string())
            .unwrap_or_else(|| self.default_locale.clone())
    }

    pub fn extract(&self, link: &str) -> Option<ProductIdentifier> {
        let url = Url::parse(normalize_link(link)).ok()?;
        let host = url.host_str()?;
        let locale = self.locale_for_host(host);

        self.rules.iter().find_map(|rule| {
            let (shop_id, item_id) = rule.apply(&url)?;
            debug!(rule = rule.name, %shop_id, %item_id, "identifier extracted");
            Some(ProductIdentifier {
                shop_id,
                item_id,
                locale: locale.clone(),
            })
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiBase {
    /// `https://shopee.{locale}` per identifier.
    Marketplace,
    /// Fixed base, e.g. the local relay at `http://localhost:3001/api/shopee`.
    Custom(String),
}

impl ApiBase {
    pub fn from_option(base: Option<String>) -> Self {
        match base {
            Some(base) if !base.trim().is_empty() => {
                ApiBase::Custom(base.trim().trim_end_matches('/').to_string())
            }
            _ => ApiBase::Marketplace,
        }
    }

    pub fn root_for(&self, locale: &str) -> String {
        match self {
            ApiBase::Marketplace => format!("https://shopee.{locale}"),
            ApiBase::Custom(base) => base.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiEndpoint {
    ItemGetV4,
    ItemGetV2,
    PdpGetPc,
}

impl ApiEndpoint {
    pub const ALL: [ApiEndpoint; 3] = [
        ApiEndpoint::ItemGetV4,
        ApiEndpoint::ItemGetV2,
        ApiEndpoint::PdpGetPc,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ApiEndpoint::ItemGetV4 => "item_get_v4",
            ApiEndpoint::ItemGetV2 => "item_get_v2",
            ApiEndpoint::PdpGetPc => "pdp_get_pc",
        }
    }

    pub fn url(self, base: &ApiBase, id: &ProductIdentifier) -> String {
        let root = base.root_for(&id.locale);
        match self {
            ApiEndpoint::ItemGetV4 => format!(
                "{root}/api/v4/item/get?itemid={}&shopid={}",
                id.item_id, id.shop_id
            ),
            ApiEndpoint::ItemGetV2 => format!(
                "{root}/api/v2/item/get?itemid={}&shopid={}",
                id.item_id, id.shop_id
            ),
            ApiEndpoint::PdpGetPc => format!(
                "{root}/api/v4/pdp/get_pc?item_id={}&shop_id={}",
                id.item_id, id.shop_id
            ),
        }
    }
}

/// Picks which candidate endpoint the next attempt uses.
pub trait EndpointSelector: Send + Sync + fmt::Debug {
    fn select(&self, attempt: usize, previous: Option<usize>, candidates: usize) -> usize;
}

/// Uniform pick, never repeating the previous endpoint when there is a choice.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSelector;

impl EndpointSelector for RandomSelector {
    fn select(&self, _attempt: usize, previous: Option<usize>, candidates: usize) -> usize {
        if candidates <= 1 {
            return 0;
        }
        match previous {
            Some(prev) if prev < candidates => {
                let pick = fastrand::usize(..candidates - 1);
                if pick >= prev {
                    pick + 1
                } else {
                    pick
                }
            }
            _ => fastrand::usize(..candidates),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RotatingSelector {
    pub start: usize,
}

impl RotatingSelector {
    pub fn new(start: usize) -> Self {
        Self { start }
    }
}

impl EndpointSelector for RotatingSelector {
    fn select(&self, attempt: usize, _previous: Option<usize>, candidates: usize) -> usize {
        if candidates == 0 {
            return 0;
        }
        (self.start + attempt) % candidates
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemVerdict {
    Live,
    Unavailable,
}

fn first_present<'a>(item: &'a JsonValue, names: &[&str]) -> Option<&'a JsonValue> {
    names
        .iter()
        .filter_map(|name| item.get(*name))
        .find(|v| !v.is_null())
}

fn has_identifier(item: &JsonValue) -> bool {
    match first_present(item, &["itemid", "item_id"]) {
        Some(JsonValue::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
        Some(JsonValue::String(s)) => !s.trim().is_empty() && s.trim() != "0",
        _ => false,
    }
}

/// The item record, from `item` or `data.item`. An object without an
/// identifier does not count as an item record.
pub fn locate_item(body: &JsonValue) -> Option<&JsonValue> {
    [body.get("item"), body.pointer("/data/item")]
        .into_iter()
        .flatten()
        .find(|candidate| candidate.is_object() && has_identifier(candidate))
}

fn status_flag_active(flag: &JsonValue) -> bool {
    match flag {
        JsonValue::Number(n) => n.as_f64() == Some(1.0),
        JsonValue::String(s) => {
            matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "normal" | "active")
        }
        JsonValue::Bool(b) => *b,
        _ => true,
    }
}

/// Existence predicate. Missing fields pass.
pub fn evaluate_item(item: &JsonValue) -> ItemVerdict {
    let deleted = match item.get("is_deleted") {
        Some(JsonValue::Bool(b)) => *b,
        Some(JsonValue::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
        _ => false,
    };
    if deleted {
        return ItemVerdict::Unavailable;
    }

    // Either status flag being active is enough.
    let flags: Vec<&JsonValue> = ["item_status", "status"]
        .iter()
        .filter_map(|name| item.get(*name))
        .filter(|v| !v.is_null())
        .collect();
    let active = flags.is_empty() || flags.into_iter().any(status_flag_active);
    if !active {
        return ItemVerdict::Unavailable;
    }

    let out_of_stock = match first_present(item, &["stock", "normal_stock"]) {
        Some(JsonValue::Number(n)) => n.as_f64().is_some_and(|v| v <= 0.0),
        _ => false,
    };
    if out_of_stock {
        return ItemVerdict::Unavailable;
    }

    ItemVerdict::Live
}

#[derive(Debug, Error)]
pub enum MarkerRulesError {
    #[error("reading marker rules {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing marker rules: {0}")]
    Parse(#[from] serde_yaml::Error),
}

fn default_not_found() -> Vec<String> {
    [
        "product not found",
        "this product does not exist",
        "item not found",
        "page not found",
        "sản phẩm không tồn tại",
        "không tìm thấy sản phẩm",
        "sản phẩm này không tồn tại",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_available() -> Vec<String> {
    [
        "add to cart",
        "buy now",
        "thêm vào giỏ hàng",
        "mua ngay",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_min_body_bytes() -> usize {
    10_000
}

/// Phrase markers for the page fallback. Negative markers take priority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerRules {
    #[serde(default = "default_not_found")]
    pub not_found: Vec<String>,
    #[serde(default = "default_available")]
    pub available: Vec<String>,
    #[serde(default = "default_min_body_bytes")]
    pub min_body_bytes: usize,
}

impl Default for MarkerRules {
    fn default() -> Self {
        Self {
            not_found: default_not_found(),
            available: default_available(),
            min_body_bytes: default_min_body_bytes(),
        }
    }
}

impl MarkerRules {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, MarkerRulesError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, MarkerRulesError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| MarkerRulesError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// Classify a fetched page body.
    pub fn classify(&self, body: &str) -> CheckOutcome {
        // Entity-decoded text catches markers the raw HTML only carries escaped.
        let decoded = Html::parse_document(body)
            .root_element()
            .text()
            .collect::<Vec<_>>()
            .join(" ");
        let haystack = format!("{}\n{}", body.to_lowercase(), decoded.to_lowercase());

        let contains_any = |phrases: &[String]| {
            phrases
                .iter()
                .filter(|p| !p.trim().is_empty())
                .any(|p| haystack.contains(&p.to_lowercase()))
        };

        if contains_any(&self.not_found) {
            CheckOutcome::NotExists
        } else if contains_any(&self.available) || body.len() >= self.min_body_bytes {
            CheckOutcome::Exists
        } else {
            CheckOutcome::NotExists
        }
    }
}

/// Identifier keys already resolved in the current run.
#[derive(Debug, Default)]
pub struct DedupSet {
    keys: Mutex<HashSet<String>>,
}

impl DedupSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically test-and-insert. `true` means the caller owns the first check.
    pub async fn claim(&self, key: &str) -> bool {
        self.keys.lock().await.insert(key.to_string())
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.keys.lock().await.contains(key)
    }
}

/// State scoped to one upload/run.
#[derive(Debug)]
pub struct RunContext {
    pub dedup: DedupSet,
    pub limiter: Arc<JitterRateLimiter>,
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn new(limiter: Arc<JitterRateLimiter>, cancel: CancellationToken) -> Self {
        Self {
            dedup: DedupSet::new(),
            limiter,
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[derive(Debug, Clone)]
pub struct CheckerConfig {
    pub api_base: ApiBase,
    pub endpoints: Vec<ApiEndpoint>,
    pub api_timeout: Duration,
    pub page_timeout: Duration,
    pub max_attempts: usize,
    pub backoff: BackoffPolicy,
    pub markers: MarkerRules,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            api_base: ApiBase::Marketplace,
            endpoints: ApiEndpoint::ALL.to_vec(),
            api_timeout: Duration::from_secs(15),
            page_timeout: Duration::from_secs(10),
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
            markers: MarkerRules::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub endpoint: ApiEndpoint,
    pub failure: Option<String>,
    pub backoff: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiVerdict {
    Resolved(CheckOutcome),
    /// Key was already claimed earlier in the run; no request was made.
    AlreadyResolved,
    Exhausted,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiCheckReport {
    pub verdict: ApiVerdict,
    pub attempts: Vec<AttemptRecord>,
}

impl ApiCheckReport {
    pub fn outcome(&self) -> CheckOutcome {
        match self.verdict {
            ApiVerdict::Resolved(outcome) => outcome,
            _ => CheckOutcome::Inconclusive,
        }
    }
}

enum AttemptResult {
    Resolved(CheckOutcome),
    Retry(String),
}

pub struct LivenessChecker {
    transport: Arc<dyn ProbeTransport>,
    selector: Box<dyn EndpointSelector>,
    config: CheckerConfig,
}

impl fmt::Debug for LivenessChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LivenessChecker")
            .field("selector", &self.selector)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LivenessChecker {
    pub fn new(transport: Arc<dyn ProbeTransport>, config: CheckerConfig) -> Self {
        Self {
            transport,
            selector: Box::new(RandomSelector),
            config,
        }
    }

    pub fn with_selector(mut self, selector: impl EndpointSelector + 'static) -> Self {
        self.selector = Box::new(selector);
        self
    }

    pub fn config(&self) -> &CheckerConfig {
        &self.config
    }

    /// Full pipeline for one link. A repeated identifier yields `Inconclusive`
    /// without any network traffic; callers leave such rows blank.
    pub async fn check(
        &self,
        identifier: Option<&ProductIdentifier>,
        raw_url: &str,
        ctx: &RunContext,
    ) -> CheckOutcome {
        match identifier {
            Some(id) => {
                let report = self.check_api(id, ctx).await;
                match report.verdict {
                    ApiVerdict::Resolved(outcome) => return outcome,
                    ApiVerdict::AlreadyResolved | ApiVerdict::Cancelled => {
                        return CheckOutcome::Inconclusive
                    }
                    ApiVerdict::Exhausted => {
                        info!(item_key = %id.key(), "api check inconclusive, falling back to page probe");
                    }
                }
            }
            None => debug!(url = raw_url, "no identifier in link, using page probe"),
        }
        self.probe_page(raw_url, ctx).await
    }

    /// Bounded retry loop over the API candidates.
    pub async fn check_api(&self, id: &ProductIdentifier, ctx: &RunContext) -> ApiCheckReport {
        let key = id.key();
        let mut attempts = Vec::with_capacity(self.config.max_attempts);

        if !ctx.dedup.claim(&key).await {
            info!(item_key = %key, "already checked this run, skipping");
            return ApiCheckReport {
                verdict: ApiVerdict::AlreadyResolved,
                attempts,
            };
        }

        let candidates = self.config.endpoints.len();
        if candidates == 0 {
            return ApiCheckReport {
                verdict: ApiVerdict::Exhausted,
                attempts,
            };
        }

        let mut previous = None;
        for attempt in 0..self.config.max_attempts {
            if ctx.is_cancelled() || !ctx.limiter.acquire(&ctx.cancel).await {
                return ApiCheckReport {
                    verdict: ApiVerdict::Cancelled,
                    attempts,
                };
            }

            let index = self.selector.select(attempt, previous, candidates) % candidates;
            previous = Some(index);
            let endpoint = self.config.endpoints[index];

            let span = info_span!("api_check", item_key = %key, endpoint = endpoint.name(), attempt);
            let result = self.attempt(endpoint, id).instrument(span).await;

            match result {
                AttemptResult::Resolved(outcome) => {
                    info!(item_key = %key, endpoint = endpoint.name(), ?outcome, "api check resolved");
                    attempts.push(AttemptRecord {
                        endpoint,
                        failure: None,
                        backoff: Duration::ZERO,
                    });
                    return ApiCheckReport {
                        verdict: ApiVerdict::Resolved(outcome),
                        attempts,
                    };
                }
                AttemptResult::Retry(reason) => {
                    let backoff = if attempt + 1 < self.config.max_attempts {
                        self.config.backoff.delay_for_attempt(attempt)
                    } else {
                        Duration::ZERO
                    };
                    warn!(
                        item_key = %key,
                        endpoint = endpoint.name(),
                        attempt = attempt + 1,
                        max_attempts = self.config.max_attempts,
                        %reason,
                        "api check failed"
                    );
                    attempts.push(AttemptRecord {
                        endpoint,
                        failure: Some(reason),
                        backoff,
                    });
                    if !backoff.is_zero() {
                        tokio::select! {
                            _ = ctx.cancel.cancelled() => {
                                return ApiCheckReport { verdict: ApiVerdict::Cancelled, attempts };
                            }
                            _ = tokio::time::sleep(backoff) => {}
                        }
                    }
                }
            }
        }

        ApiCheckReport {
            verdict: ApiVerdict::Exhausted,
            attempts,
        }
    }

    async fn attempt(&self, endpoint: ApiEndpoint, id: &ProductIdentifier) -> AttemptResult {
        let url = endpoint.url(&self.config.api_base, id);
        let request = ProbeRequest::new(url, self.config.api_timeout)
            .header("Accept", "*/*")
            .header("Accept-Language", "en-US,en;q=0.5")
            .header("X-Shopee-Language", "en")
            .header("X-Requested-With", "XMLHttpRequest")
            .header("X-API-SOURCE", "pc")
            .header("Referer", format!("https://shopee.{}/", id.locale))
            .header("Cache-Control", "no-cache");

        let resp = match self.transport.get(request).await {
            Ok(resp) => resp,
            Err(err) => return AttemptResult::Retry(err.to_string()),
        };

        if !resp.status.is_success() {
            return match classify_status(resp.status) {
                RetryDisposition::Terminal => AttemptResult::Resolved(CheckOutcome::NotExists),
                RetryDisposition::Retryable => {
                    AttemptResult::Retry(format!("http status {}", resp.status.as_u16()))
                }
            };
        }

        let body: JsonValue = match serde_json::from_slice(&resp.body) {
            Ok(body) => body,
            Err(err) => return AttemptResult::Retry(format!("malformed body: {err}")),
        };

        match locate_item(&body) {
            Some(item) => AttemptResult::Resolved(match evaluate_item(item) {
                ItemVerdict::Live => CheckOutcome::Exists,
                ItemVerdict::Unavailable => CheckOutcome::NotExists,
            }),
            None => AttemptResult::Retry("response has no item record".to_string()),
        }
    }

    /// HEAD, then GET + marker scan. Transport failures fail closed.
    pub async fn probe_page(&self, raw_url: &str, ctx: &RunContext) -> CheckOutcome {
        let url = normalize_link(raw_url);
        let span = info_span!("page_probe", url);
        async move {
            if ctx.is_cancelled() {
                return CheckOutcome::Inconclusive;
            }

            let head = self.transport.head(self.page_request(url)).await;
            match head {
                Ok(resp) if resp.status.is_success() => {
                    info!(status = resp.status.as_u16(), "page reachable");
                    return CheckOutcome::Exists;
                }
                Ok(resp) => debug!(status = resp.status.as_u16(), "head probe rejected"),
                Err(err) => debug!(error = %err, "head probe failed"),
            }

            if ctx.is_cancelled() {
                return CheckOutcome::Inconclusive;
            }

            match self.transport.get(self.page_request(url)).await {
                Ok(resp) if resp.status.is_success() => {
                    let outcome = self.classify_page(&resp);
                    info!(status = resp.status.as_u16(), bytes = resp.body.len(), ?outcome, "page content classified");
                    outcome
                }
                Ok(resp) => {
                    info!(status = resp.status.as_u16(), "page fetch unsuccessful");
                    CheckOutcome::NotExists
                }
                Err(err) => {
                    warn!(error = %err, "page fetch failed");
                    CheckOutcome::NotExists
                }
            }
        }
        .instrument(span)
        .await
    }

    fn page_request(&self, url: &str) -> ProbeRequest {
        ProbeRequest::new(url, self.config.page_timeout)
            .header(
                "Accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            )
            .header("Accept-Language", "en-US,en;q=0.5")
    }

    fn classify_page(&self, resp: &FetchedResponse) -> CheckOutcome {
        self.config.markers.classify(&resp.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use slc_storage::{FetchError, StatusCode};
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    type Scripted = Result<FetchedResponse, FetchError>;

    #[derive(Default)]
    struct ScriptedTransport {
        gets: StdMutex<VecDeque<Scripted>>,
        heads: StdMutex<VecDeque<Scripted>>,
        log: StdMutex<Vec<(String, String)>>,
    }

    impl ScriptedTransport {
        fn get_then(self, resp: Scripted) -> Self {
            self.gets.lock().unwrap().push_back(resp);
            self
        }

        fn head_then(self, resp: Scripted) -> Self {
            self.heads.lock().unwrap().push_back(resp);
            self
        }

        fn requests(&self) -> Vec<(String, String)> {
            self.log.lock().unwrap().clone()
        }
    }

    fn unscripted(url: &str) -> Scripted {
        Err(FetchError::Connect {
            url: url.to_string(),
            message: "unscripted".into(),
        })
    }

    #[async_trait]
    impl ProbeTransport for ScriptedTransport {
        async fn get(&self, request: ProbeRequest) -> Result<FetchedResponse, FetchError> {
            self.log.lock().unwrap().push(("GET".into(), request.url.clone()));
            self.gets
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| unscripted(&request.url))
        }

        async fn head(&self, request: ProbeRequest) -> Result<FetchedResponse, FetchError> {
            self.log.lock().unwrap().push(("HEAD".into(), request.url.clone()));
            self.heads
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| unscripted(&request.url))
        }
    }

    fn json(status: StatusCode, body: serde_json::Value) -> Scripted {
        Ok(FetchedResponse {
            status,
            final_url: "https://shopee.vn/api".into(),
            body: body.to_string().into_bytes(),
        })
    }

    fn page(status: StatusCode, body: &str) -> Scripted {
        Ok(FetchedResponse {
            status,
            final_url: "https://shopee.vn/page".into(),
            body: body.as_bytes().to_vec(),
        })
    }

    fn timeout() -> Scripted {
        Err(FetchError::Timeout {
            url: "https://shopee.vn/api".into(),
        })
    }

    fn checker(transport: Arc<ScriptedTransport>) -> LivenessChecker {
        let config = CheckerConfig {
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(4),
            },
            ..CheckerConfig::default()
        };
        LivenessChecker::new(transport, config).with_selector(RotatingSelector::new(0))
    }

    fn ctx() -> RunContext {
        RunContext::new(
            Arc::new(JitterRateLimiter::disabled()),
            CancellationToken::new(),
        )
    }

    const LINK: &str = "https://shopee.vn/foo-bar-i.111.222";

    #[test]
    fn extracts_slug_form_with_default_locale() {
        let id = IdentifierExtractor::shopee().extract(LINK).expect("identifier");
        assert_eq!(id, ProductIdentifier::new("111", "222", "vn"));
    }

    #[test]
    fn extracts_every_supported_shape() {
        let extractor = IdentifierExtractor::shopee();
        let cases = [
            ("https://shopee.sg/Some-Item-i.12.34?sp_atk=abc", "12", "34", "sg"),
            ("https://shopee.com.my/item/98/shop/76", "76", "98", "com.my"),
            ("https://shopee.co.th/product/5551/7772/", "5551", "7772", "co.th"),
            ("https://shopee.co.id/universal-link?shopid=10&itemid=20", "10", "20", "co.id"),
            ("https://shopee.ph/share?shop_id=31&item_id=42", "31", "42", "ph"),
            ("https://shopee.tw/app#/product?shopid=7&itemid=8", "7", "8", "tw"),
            ("https://shopee.vn/m#shopid=1&itemid=2", "1", "2", "vn"),
            ("  https://www.shopee.vn/x-i.9.10/  ", "9", "10", "vn"),
        ];
        for (url, shop, item, locale) in cases {
            let id = extractor.extract(url).unwrap_or_else(|| panic!("no id for {url}"));
            assert_eq!(id.shop_id, shop, "{url}");
            assert_eq!(id.item_id, item, "{url}");
            assert_eq!(id.locale, locale, "{url}");
        }
    }

    #[test]
    fn path_rule_wins_over_query_params() {
        let id = IdentifierExtractor::shopee()
            .extract("https://shopee.vn/a-i.1.2?shopid=3&itemid=4")
            .expect("identifier");
        assert_eq!((id.shop_id.as_str(), id.item_id.as_str()), ("1", "2"));
    }

    #[test]
    fn unrecognized_or_malformed_links_yield_none() {
        let extractor = IdentifierExtractor::shopee();
        for url in [
            "https://shopee.vn/shop/12345",
            "https://shopee.vn/search?keyword=ao",
            "https://shopee.vn/x?shopid=abc&itemid=2",
            "https://shopee.vn/x?shopid=1",
            "shopee.vn/foo-i.1.2",
            "not a url at all",
            "",
            "http://[::1",
        ] {
            assert_eq!(extractor.extract(url), None, "{url}");
        }
    }

    #[test]
    fn unknown_hosts_fall_back_to_base_locale() {
        let extractor = IdentifierExtractor::shopee();
        assert_eq!(extractor.locale_for_host("SHOPEE.CO.ID"), "co.id");
        assert_eq!(extractor.locale_for_host("example.com"), "vn");
    }

    #[test]
    fn marketplace_link_test_is_case_insensitive() {
        assert!(is_marketplace_link("HTTPS://SHOPEE.VN/abc", "shopee"));
        assert!(!is_marketplace_link("https://example.com/not-a-marketplace-link", "shopee"));
        assert_eq!(normalize_link("  https://a.b/c//  "), "https://a.b/c");
    }

    #[test]
    fn item_predicate_is_lenient_on_missing_fields() {
        let live = serde_json::json!({"itemid": 222});
        assert_eq!(evaluate_item(&live), ItemVerdict::Live);

        let cases = [
            (serde_json::json!({"itemid": 222, "is_deleted": true}), ItemVerdict::Unavailable),
            (serde_json::json!({"itemid": 222, "item_status": 8}), ItemVerdict::Unavailable),
            (serde_json::json!({"itemid": 222, "status": "normal"}), ItemVerdict::Live),
            (serde_json::json!({"itemid": 222, "item_status": 0, "status": 1}), ItemVerdict::Live),
            (serde_json::json!({"itemid": 222, "item_status": 1, "status": 0}), ItemVerdict::Live),
            (serde_json::json!({"itemid": 222, "item_status": 0, "status": 2}), ItemVerdict::Unavailable),
            (serde_json::json!({"itemid": 222, "stock": 0}), ItemVerdict::Unavailable),
            (serde_json::json!({"itemid": 222, "stock": null, "normal_stock": 3}), ItemVerdict::Live),
            (serde_json::json!({"itemid": 222, "item_status": 1, "stock": 5, "is_deleted": false}), ItemVerdict::Live),
        ];
        for (item, expected) in cases {
            assert_eq!(evaluate_item(&item), expected, "{item}");
        }
    }

    #[test]
    fn item_record_requires_identifier() {
        let nested = serde_json::json!({"data": {"item": {"item_id": "5"}}});
        assert!(locate_item(&nested).is_some());
        assert!(locate_item(&serde_json::json!({"item": {"itemid": 0}})).is_none());
        assert!(locate_item(&serde_json::json!({"error": 4, "item": null})).is_none());
        assert!(locate_item(&serde_json::json!({"item": {"name": "x"}})).is_none());
    }

    #[test]
    fn rotating_selector_is_deterministic() {
        let selector = RotatingSelector::new(1);
        let picks: Vec<_> = (0..4).map(|a| selector.select(a, None, 3)).collect();
        assert_eq!(picks, vec![1, 2, 0, 1]);
    }

    #[test]
    fn random_selector_never_repeats_previous() {
        let selector = RandomSelector;
        for _ in 0..200 {
            let pick = selector.select(1, Some(2), 3);
            assert!(pick < 3);
            assert_ne!(pick, 2);
        }
        assert_eq!(selector.select(0, Some(0), 1), 0);
    }

    #[test]
    fn endpoint_urls_honor_custom_base() {
        let id = ProductIdentifier::new("111", "222", "sg");
        assert_eq!(
            ApiEndpoint::ItemGetV4.url(&ApiBase::Marketplace, &id),
            "https://shopee.sg/api/v4/item/get?itemid=222&shopid=111"
        );
        let relay = ApiBase::from_option(Some("http://localhost:3001/api/shopee/".into()));
        assert_eq!(
            ApiEndpoint::PdpGetPc.url(&relay, &id),
            "http://localhost:3001/api/shopee/api/v4/pdp/get_pc?item_id=222&shop_id=111"
        );
        assert_eq!(ApiBase::from_option(Some("  ".into())), ApiBase::Marketplace);
    }

    #[test]
    fn marker_rules_prefer_negative_evidence() {
        let rules = MarkerRules::default();
        assert_eq!(
            rules.classify("<html>Add to cart ... Product not found</html>"),
            CheckOutcome::NotExists
        );
        assert_eq!(rules.classify("<html><button>Mua ngay</button></html>"), CheckOutcome::Exists);
        assert_eq!(
            rules.classify("<p>S&#7843;n ph&#7849;m kh&#244;ng t&#7891;n t&#7841;i</p>"),
            CheckOutcome::NotExists
        );
        assert_eq!(rules.classify("<html>tiny</html>"), CheckOutcome::NotExists);
        let big = format!("<html>{}</html>", "a".repeat(20_000));
        assert_eq!(rules.classify(&big), CheckOutcome::Exists);
    }

    #[test]
    fn marker_rules_yaml_fills_defaults() {
        let rules = MarkerRules::from_yaml_str("not_found: [\"gone forever\"]\n").expect("yaml");
        assert_eq!(rules.not_found, vec!["gone forever".to_string()]);
        assert_eq!(rules.available, default_available());
        assert_eq!(rules.min_body_bytes, 10_000);
        assert!(MarkerRules::from_yaml_str("not_found: 3").is_err());
    }

    #[test]
    fn marker_rules_load_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("markers.yaml");
        std::fs::write(&path, "available: [\"in stock\"]\nmin_body_bytes: 5\n").expect("write");
        let rules = MarkerRules::load(&path).expect("load");
        assert_eq!(rules.min_body_bytes, 5);
        assert!(matches!(
            MarkerRules::load(dir.path().join("missing.yaml")),
            Err(MarkerRulesError::Io { .. })
        ));
    }

    #[tokio::test]
    async fn live_item_resolves_exists_with_one_request() {
        let transport = Arc::new(ScriptedTransport::default().get_then(json(
            StatusCode::OK,
            serde_json::json!({"item": {"itemid": 222, "is_deleted": false, "item_status": 1, "stock": 5}}),
        )));
        let checker = checker(transport.clone());
        let ctx = ctx();
        let id = IdentifierExtractor::shopee().extract(LINK);

        let outcome = checker.check(id.as_ref(), LINK, &ctx).await;

        assert_eq!(outcome, CheckOutcome::Exists);
        assert_eq!(
            transport.requests(),
            vec![(
                "GET".to_string(),
                "https://shopee.vn/api/v4/item/get?itemid=222&shopid=111".to_string()
            )]
        );
        assert!(ctx.dedup.contains("111-222").await);
    }

    #[tokio::test]
    async fn deleted_item_is_not_exists_without_page_fallback() {
        let transport = Arc::new(ScriptedTransport::default().get_then(json(
            StatusCode::OK,
            serde_json::json!({"item": {"itemid": 222, "is_deleted": true}}),
        )));
        let checker = checker(transport.clone());
        let id = IdentifierExtractor::shopee().extract(LINK);

        let outcome = checker.check(id.as_ref(), LINK, &ctx()).await;

        assert_eq!(outcome, CheckOutcome::NotExists);
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn repeated_identifier_short_circuits_without_network() {
        let transport = Arc::new(ScriptedTransport::default().get_then(json(
            StatusCode::OK,
            serde_json::json!({"item": {"itemid": 222}}),
        )));
        let checker = checker(transport.clone());
        let ctx = ctx();
        let id = IdentifierExtractor::shopee().extract(LINK);

        assert_eq!(checker.check(id.as_ref(), LINK, &ctx).await, CheckOutcome::Exists);
        assert_eq!(checker.check(id.as_ref(), LINK, &ctx).await, CheckOutcome::Inconclusive);
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn gone_status_is_terminal() {
        let transport = Arc::new(
            ScriptedTransport::default().get_then(json(StatusCode::GONE, serde_json::json!({}))),
        );
        let checker = checker(transport.clone());
        let id = ProductIdentifier::new("1", "2", "vn");

        let report = checker.check_api(&id, &ctx()).await;

        assert_eq!(report.verdict, ApiVerdict::Resolved(CheckOutcome::NotExists));
        assert_eq!(report.attempts.len(), 1);
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn retries_follow_backoff_schedule_and_rotate_endpoints() {
        let transport = Arc::new(
            ScriptedTransport::default()
                .get_then(timeout())
                .get_then(json(StatusCode::SERVICE_UNAVAILABLE, serde_json::json!({})))
                .get_then(page(StatusCode::OK, "not json")),
        );
        let checker = checker(transport.clone());
        let id = ProductIdentifier::new("1", "2", "vn");

        let report = checker.check_api(&id, &ctx()).await;

        assert_eq!(report.verdict, ApiVerdict::Exhausted);
        assert_eq!(report.outcome(), CheckOutcome::Inconclusive);
        let endpoints: Vec<_> = report.attempts.iter().map(|a| a.endpoint).collect();
        assert_eq!(endpoints, ApiEndpoint::ALL.to_vec());
        let backoffs: Vec<_> = report.attempts.iter().map(|a| a.backoff).collect();
        assert_eq!(
            backoffs,
            vec![Duration::from_millis(1), Duration::from_millis(2), Duration::ZERO]
        );
        assert!(report.attempts.iter().all(|a| a.failure.is_some()));
    }

    #[tokio::test]
    async fn every_api_attempt_waits_on_the_rate_limiter() {
        let transport = Arc::new(
            ScriptedTransport::default()
                .get_then(timeout())
                .get_then(timeout())
                .get_then(timeout()),
        );
        let checker = checker(transport.clone());
        let window = Duration::from_millis(20);
        let ctx = RunContext::new(
            Arc::new(JitterRateLimiter::new(window, window)),
            CancellationToken::new(),
        );
        let id = ProductIdentifier::new("111", "222", "vn");

        let started = std::time::Instant::now();
        let report = checker.check_api(&id, &ctx).await;
        let elapsed = started.elapsed();

        assert_eq!(report.verdict, ApiVerdict::Exhausted);
        assert_eq!(report.attempts.len(), 3);
        assert_eq!(transport.requests().len(), 3);
        // Backoff here totals 3ms, so only a per-attempt wait reaches 60ms.
        assert!(elapsed >= window * 3, "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn malformed_body_is_retried_then_resolved() {
        let transport = Arc::new(
            ScriptedTransport::default()
                .get_then(json(StatusCode::OK, serde_json::json!({"error": 90309999})))
                .get_then(json(
                    StatusCode::OK,
                    serde_json::json!({"data": {"item": {"item_id": 2, "status": 1}}}),
                )),
        );
        let checker = checker(transport.clone());
        let id = ProductIdentifier::new("1", "2", "vn");

        let report = checker.check_api(&id, &ctx()).await;

        assert_eq!(report.verdict, ApiVerdict::Resolved(CheckOutcome::Exists));
        assert_eq!(report.attempts.len(), 2);
        assert!(transport.requests()[1].1.contains("/api/v2/item/get"));
    }

    #[tokio::test]
    async fn exhausted_api_falls_back_to_page_markers() {
        let transport = Arc::new(
            ScriptedTransport::default()
                .get_then(timeout())
                .get_then(timeout())
                .get_then(timeout())
                .head_then(page(StatusCode::METHOD_NOT_ALLOWED, ""))
                .get_then(page(StatusCode::OK, "<html><h1>Product not found</h1></html>")),
        );
        let checker = checker(transport.clone());
        let ctx = ctx();
        let id = IdentifierExtractor::shopee().extract(LINK);

        let outcome = checker.check(id.as_ref(), LINK, &ctx).await;

        assert_eq!(outcome, CheckOutcome::NotExists);
        let methods: Vec<_> = transport.requests().into_iter().map(|(m, _)| m).collect();
        assert_eq!(methods, vec!["GET", "GET", "GET", "HEAD", "GET"]);
        assert_eq!(transport.requests()[4].1, LINK);
        assert!(ctx.dedup.contains("111-222").await);
    }

    #[tokio::test]
    async fn link_without_identifier_uses_head_probe_only() {
        let transport =
            Arc::new(ScriptedTransport::default().head_then(page(StatusCode::OK, "")));
        let checker = checker(transport.clone());
        let url = "https://shopee.vn/some-shop";

        let outcome = checker.check(None, url, &ctx()).await;

        assert_eq!(outcome, CheckOutcome::Exists);
        assert_eq!(transport.requests(), vec![("HEAD".to_string(), url.to_string())]);
    }

    #[tokio::test]
    async fn page_transport_failure_fails_closed() {
        let transport = Arc::new(ScriptedTransport::default());
        let checker = checker(transport.clone());

        let outcome = checker.probe_page("https://shopee.vn/x", &ctx()).await;

        assert_eq!(outcome, CheckOutcome::NotExists);
        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn cancelled_run_issues_no_requests() {
        let transport = Arc::new(ScriptedTransport::default());
        let checker = checker(transport.clone());
        let ctx = ctx();
        ctx.cancel.cancel();
        let id = IdentifierExtractor::shopee().extract(LINK);

        let outcome = checker.check(id.as_ref(), LINK, &ctx).await;

        assert_eq!(outcome, CheckOutcome::Inconclusive);
        assert!(transport.requests().is_empty());
    }
}
