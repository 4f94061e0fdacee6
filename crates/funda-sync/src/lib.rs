//! Tracker loop: paginate one area query, flatten every page, persist the rows.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use funda_adapters::{
    build_search_request, flatten_page, ClientIdentity, FundaEndpoints, InsightsCacheConfig,
    InsightsFetcher, InvalidQuery, MalformedListing, OfferingType, PublicationDate, RadiusKm,
    SearchClient, SearchDialect, SearchError, DEFAULT_AUTHORIZATION, DEFAULT_USER_AGENT,
};
use funda_storage::{
    ensure_table, DbSettings, HttpClientConfig, HttpFetcher, HttpTransport, ListingSink,
    PersistReport, PgListingWriter, TableName,
};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "funda-sync";

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub db: DbSettings,
    pub table: String,
    pub user_agent: String,
    pub authorization: String,
    pub search_api: SearchDialect,
    pub http_timeout_secs: u64,
    pub page_size: u32,
    pub page_delay_secs: u64,
    pub max_pages: u32,
    pub neighbourhood_cache: usize,
    pub listing_cache: usize,
    pub listing_insights: bool,
}

/// Boolean setting: `1`/`true`/`yes`/`on` or `0`/`false`/`no`/`off`, any case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Flag(bool);

impl std::str::FromStr for Flag {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Flag(true)),
            "0" | "false" | "no" | "off" => Ok(Flag(false)),
            _ => Err(()),
        }
    }
}

/// A set but unparseable value falls back to `default` with a warning.
fn parse_setting<T: std::str::FromStr>(key: &str, raw: Option<String>, default: T) -> T {
    let Some(raw) = raw else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable setting; using default");
            default
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    parse_setting(key, std::env::var(key).ok(), default)
}

impl TrackerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            db: DbSettings::from_env(),
            table: std::env::var("FUNDA_TABLE").unwrap_or(defaults.table),
            user_agent: std::env::var("FUNDA_USER_AGENT").unwrap_or(defaults.user_agent),
            authorization: std::env::var("FUNDA_AUTHORIZATION").unwrap_or(defaults.authorization),
            search_api: env_parse("FUNDA_SEARCH_API", defaults.search_api),
            http_timeout_secs: env_parse("FUNDA_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            page_size: env_parse("FUNDA_PAGE_SIZE", defaults.page_size),
            page_delay_secs: env_parse("FUNDA_PAGE_DELAY_SECS", defaults.page_delay_secs),
            max_pages: env_parse("FUNDA_MAX_PAGES", defaults.max_pages),
            neighbourhood_cache: env_parse("FUNDA_NEIGHBOURHOOD_CACHE", defaults.neighbourhood_cache),
            listing_cache: env_parse("FUNDA_LISTING_CACHE", defaults.listing_cache),
            listing_insights: env_parse("FUNDA_LISTING_INSIGHTS", Flag(defaults.listing_insights)).0,
        }
    }

    pub fn identity(&self) -> ClientIdentity {
        ClientIdentity {
            user_agent: self.user_agent.clone(),
            authorization: self.authorization.clone(),
        }
    }

    pub fn pagination(&self) -> PaginationSettings {
        PaginationSettings {
            page_size: self.page_size,
            page_delay: Duration::from_secs(self.page_delay_secs),
            max_pages: self.max_pages,
            enrich: self.listing_insights,
        }
    }

    pub fn caches(&self) -> InsightsCacheConfig {
        InsightsCacheConfig {
            listing_capacity: self.listing_cache,
            neighbourhood_capacity: self.neighbourhood_cache,
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            db: DbSettings::default(),
            table: "funda".to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            authorization: DEFAULT_AUTHORIZATION.to_string(),
            search_api: SearchDialect::default(),
            http_timeout_secs: 20,
            page_size: 100,
            page_delay_secs: 5,
            max_pages: 1000,
            neighbourhood_cache: 2400,
            listing_cache: 10_000,
            listing_insights: true,
        }
    }
}

/// One area/filter query to track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerQuery {
    pub postal_code: u32,
    pub radius: RadiusKm,
    pub publication_date: PublicationDate,
    pub offering_type: OfferingType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationSettings {
    pub page_size: u32,
    pub page_delay: Duration,
    pub max_pages: u32,
    pub enrich: bool,
}

impl Default for PaginationSettings {
    fn default() -> Self {
        TrackerConfig::default().pagination()
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The remote reported zero matches.
    EmptyResult,
    /// Offset reached the reported total.
    Exhausted,
    /// A page came back without hits before the total was reached.
    EmptyPage,
    PageLimit,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Termination::EmptyResult => "empty_result",
            Termination::Exhausted => "exhausted",
            Termination::EmptyPage => "empty_page",
            Termination::PageLimit => "page_limit",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error(transparent)]
    Query(#[from] InvalidQuery),
    #[error("search page at offset {offset} failed: {source}")]
    Search {
        offset: u64,
        #[source]
        source: SearchError,
    },
}

#[derive(Debug, Clone)]
pub struct TrackerReport {
    pub run_id: Uuid,
    pub search_query: String,
    pub total: u64,
    pub pages: u32,
    pub listings_seen: u64,
    pub termination: Termination,
    pub persisted: PersistReport,
    pub skipped: Vec<MalformedListing>,
}

impl fmt::Display for TrackerReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run complete: run_id={} query={} total={} pages={} inserted={} duplicates={} skipped={} failed={} termination={}",
            self.run_id,
            self.search_query,
            self.total,
            self.pages,
            self.persisted.inserted,
            self.persisted.duplicates,
            self.skipped.len(),
            self.persisted.failed(),
            self.termination
        )
    }
}

pub struct Tracker {
    search: SearchClient,
    insights: InsightsFetcher,
    sink: Box<dyn ListingSink>,
    pagination: PaginationSettings,
    run_id: Uuid,
}

impl Tracker {
    pub fn new(
        search: SearchClient,
        insights: InsightsFetcher,
        sink: Box<dyn ListingSink>,
        pagination: PaginationSettings,
        run_id: Uuid,
    ) -> Self {
        Self {
            search,
            insights,
            sink,
            pagination,
            run_id,
        }
    }

    /// Wire the search client and insights fetcher to one shared transport.
    pub fn with_transport(
        config: &TrackerConfig,
        transport: Arc<dyn HttpTransport>,
        sink: Box<dyn ListingSink>,
        run_id: Uuid,
    ) -> Self {
        let endpoints = FundaEndpoints::default();
        let search = SearchClient::new(
            transport.clone(),
            endpoints.clone(),
            config.identity(),
            config.search_api,
        );
        let insights = InsightsFetcher::new(transport, endpoints, config.identity(), config.caches());
        Self::new(search, insights, sink, config.pagination(), run_id)
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Page through every result of `query`, persisting each page before requesting the next.
    pub async fn run(&mut self, query: &TrackerQuery) -> Result<TrackerReport, TrackerError> {
        let base = build_search_request(
            query.postal_code,
            query.radius,
            query.publication_date,
            query.offering_type,
            0,
            self.pagination.page_size,
        )?;
        let search_query = base.descriptor();

        let mut report = TrackerReport {
            run_id: self.run_id,
            search_query: search_query.clone(),
            total: 0,
            pages: 0,
            listings_seen: 0,
            termination: Termination::Exhausted,
            persisted: PersistReport::default(),
            skipped: Vec::new(),
        };

        let mut offset = 0u64;
        // Unknown until the first response; 1 forces at least one fetch.
        let mut total = 1u64;

        report.termination = loop {
            if offset >= total {
                break Termination::Exhausted;
            }
            if report.pages >= self.pagination.max_pages {
                warn!(
                    offset,
                    total,
                    max_pages = self.pagination.max_pages,
                    "page limit reached before the result set was exhausted"
                );
                break Termination::PageLimit;
            }
            if report.pages > 0 && !self.pagination.page_delay.is_zero() {
                tokio::time::sleep(self.pagination.page_delay).await;
            }

            let span = info_span!("search_page", run_id = %self.run_id, offset);
            let page = self
                .search
                .search(&base.at_offset(offset))
                .instrument(span.clone())
                .await
                .map_err(|source| TrackerError::Search { offset, source })?;
            report.pages += 1;
            total = page.total;
            report.total = page.total;

            if total == 0 {
                info!(search_query = %search_query, "no results");
                break Termination::EmptyResult;
            }
            if page.hits.is_empty() {
                warn!(offset, total, "empty page before reaching the reported total");
                break Termination::EmptyPage;
            }

            let returned = page.hits.len() as u64;
            async {
                info!("Processing results {}-{}/{}", offset, offset + returned, total);
                let mut outcome =
                    flatten_page(&page.hits, self.pagination.enrich, &mut self.insights).await;
                for record in &mut outcome.records {
                    record.search_query = search_query.clone();
                }
                let persisted = self.sink.persist(&outcome.records).await;
                report.persisted.merge(persisted);
                report.skipped.extend(outcome.skipped);
            }
            .instrument(span)
            .await;

            report.listings_seen += returned;
            offset += returned;
        };

        info!(
            run_id = %self.run_id,
            termination = %report.termination,
            pages = report.pages,
            inserted = report.persisted.inserted,
            duplicates = report.persisted.duplicates,
            skipped = report.skipped.len(),
            failed = report.persisted.failed(),
            "tracker run finished"
        );
        Ok(report)
    }
}

/// Connect, make sure the destination table exists, and run one tracker pass.
pub async fn run_tracker_once(config: &TrackerConfig, query: &TrackerQuery) -> Result<TrackerReport> {
    let table = TableName::parse(&config.table)?;
    let pool = config.db.connect().await?;
    ensure_table(&pool, &table).await?;

    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
    })?;
    let run_id = Uuid::new_v4();
    let sink = PgListingWriter::new(pool, table, run_id);
    let mut tracker = Tracker::with_transport(config, Arc::new(http), Box::new(sink), run_id);
    tracker
        .run(query)
        .await
        .with_context(|| format!("tracking postal code {}", query.postal_code))
}
