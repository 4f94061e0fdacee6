//! HTTP transport and idempotent Postgres persistence for tracked listings.

use std::fmt;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use funda_core::{
    ColumnType, ColumnValue, FlatListingRecord, RowMetadata, LISTING_SCHEMA, PRIMARY_KEY_COLUMN,
    PROCESSING_TIME_COLUMN, RUN_ID_COLUMN,
};
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, error, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "funda-storage";

/// Separator placed between column values when hashing a row.
pub const HASH_FIELD_SEPARATOR: &str = "~~";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Content-derived primary key: a digest over every record column in schema order.
///
/// Processing metadata is not part of the record, so two writes of the same
/// listing state from different runs share one key.
pub fn row_id(record: &FlatListingRecord) -> String {
    let joined = record
        .columns()
        .iter()
        .map(|(_, value)| value.render())
        .collect::<Vec<_>>()
        .join(HASH_FIELD_SEPARATOR);
    sha256_hex(joined.as_bytes())
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => f.write_str("GET"),
            Method::Post => f.write_str("POST"),
        }
    }
}

/// Transport-neutral description of one outbound call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl OutboundRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, content_type: &str, body: Vec<u8>) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            headers: vec![("content-type".to_string(), content_type.to_string())],
            body: Some(body),
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("request to {url} failed: {message}")]
    Other { url: String, message: String },
}

/// Seam between request construction and the wire; every status is returned to the caller.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: OutboundRequest) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for HttpFetcher {
    async fn send(&self, request: OutboundRequest) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", method = %request.method, url = %request.url);
        async move {
            let mut builder = match request.method {
                Method::Get => self.client.get(&request.url),
                Method::Post => self.client.post(&request.url),
            };
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let resp = builder.send().await?;
            let status = resp.status().as_u16();
            let final_url = resp.url().to_string();
            let body = resp.bytes().await?.to_vec();
            debug!(status, bytes = body.len(), "response received");

            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Error)]
#[error("invalid table name {0:?}: expected [A-Za-z_][A-Za-z0-9_]*")]
pub struct InvalidTableName(pub String);

/// SQL identifier checked to be safe for interpolation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName(String);

impl TableName {
    pub fn parse(name: &str) -> Result<Self, InvalidTableName> {
        let mut chars = name.chars();
        let valid_head = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        let valid_tail = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if valid_head && valid_tail && name.len() <= 63 {
            Ok(Self(name.to_string()))
        } else {
            Err(InvalidTableName(name.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn create_table_sql(table: &TableName) -> String {
    let columns = LISTING_SCHEMA
        .iter()
        .map(|c| format!("{} {}", c.name, c.ty.sql()))
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE IF NOT EXISTS {table}({columns})")
}

/// Insert over every schema column; a primary-key conflict is a no-op.
pub fn insert_sql(table: &TableName) -> String {
    let names = LISTING_SCHEMA
        .iter()
        .map(|c| c.name)
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = LISTING_SCHEMA
        .iter()
        .enumerate()
        .map(|(i, c)| match c.ty {
            ColumnType::Timestamp => format!("CAST(${} AS TIMESTAMP)", i + 1),
            _ => format!("${}", i + 1),
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {table}({names}) VALUES({placeholders}) ON CONFLICT ({PRIMARY_KEY_COLUMN}) DO NOTHING"
    )
}

/// Full row in schema order: key, record columns, then processing metadata.
pub fn row_values(record: &FlatListingRecord, metadata: &RowMetadata) -> Vec<(&'static str, ColumnValue)> {
    let mut values = Vec::with_capacity(LISTING_SCHEMA.len());
    values.push((PRIMARY_KEY_COLUMN, ColumnValue::Text(row_id(record))));
    values.extend(record.columns());
    values.push((
        PROCESSING_TIME_COLUMN,
        ColumnValue::Timestamp(
            metadata
                .processing_time
                .format("%Y-%m-%d %H:%M:%S%.6f")
                .to_string(),
        ),
    ));
    values.push((RUN_ID_COLUMN, ColumnValue::Text(metadata.run_id.to_string())));
    values
}

pub async fn ensure_table(pool: &PgPool, table: &TableName) -> anyhow::Result<()> {
    let sql = create_table_sql(table);
    sqlx::query(&sql)
        .execute(pool)
        .await
        .with_context(|| format!("creating table {table}"))?;
    Ok(())
}

#[derive(Debug, Error)]
#[error("storing listing {listing_id} failed: {source}")]
pub struct PersistenceError {
    pub listing_id: String,
    pub record: String,
    pub statement: String,
    #[source]
    pub source: sqlx::Error,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistReport {
    pub inserted: usize,
    pub duplicates: usize,
    pub failed_listing_ids: Vec<String>,
}

impl PersistReport {
    pub fn merge(&mut self, other: PersistReport) {
        self.inserted += other.inserted;
        self.duplicates += other.duplicates;
        self.failed_listing_ids.extend(other.failed_listing_ids);
    }

    pub fn failed(&self) -> usize {
        self.failed_listing_ids.len()
    }
}

/// Destination for flattened records.
#[async_trait]
pub trait ListingSink: Send {
    async fn persist(&mut self, records: &[FlatListingRecord]) -> PersistReport;
}

/// Write each record with its content hash and run metadata.
///
/// A failing row is logged with the record and statement and the batch
/// continues with the next one.
pub async fn persist(
    records: &[FlatListingRecord],
    table: &TableName,
    pool: &PgPool,
    run_id: Uuid,
) -> PersistReport {
    let statement = insert_sql(table);
    let mut report = PersistReport::default();
    debug!(count = records.len(), %table, "storing results");

    for record in records {
        let metadata = RowMetadata {
            processing_time: Utc::now().naive_utc(),
            run_id,
        };
        match insert_row(pool, &statement, record, &metadata).await {
            Ok(0) => report.duplicates += 1,
            Ok(_) => report.inserted += 1,
            Err(source) => {
                let err = PersistenceError {
                    listing_id: record.listing_id.clone(),
                    record: format!("{record:?}"),
                    statement: statement.clone(),
                    source,
                };
                error!(
                    listing_id = %err.listing_id,
                    record = %err.record,
                    statement = %err.statement,
                    error = %err,
                    "failed to store listing"
                );
                report.failed_listing_ids.push(err.listing_id);
            }
        }
    }

    report
}

async fn insert_row(
    pool: &PgPool,
    statement: &str,
    record: &FlatListingRecord,
    metadata: &RowMetadata,
) -> Result<u64, sqlx::Error> {
    let mut query = sqlx::query(statement);
    for (_, value) in row_values(record, metadata) {
        query = match value {
            ColumnValue::Text(v) | ColumnValue::Timestamp(v) => query.bind(v),
            ColumnValue::Integer(v) => query.bind(v),
            ColumnValue::Real(v) => query.bind(v),
        };
    }
    Ok(query.execute(pool).await?.rows_affected())
}

/// Postgres-backed [`ListingSink`] carrying the run identifier of this process.
#[derive(Debug, Clone)]
pub struct PgListingWriter {
    pool: PgPool,
    table: TableName,
    run_id: Uuid,
}

impl PgListingWriter {
    pub fn new(pool: PgPool, table: TableName, run_id: Uuid) -> Self {
        Self {
            pool,
            table,
            run_id,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }
}

#[async_trait]
impl ListingSink for PgListingWriter {
    async fn persist(&mut self, records: &[FlatListingRecord]) -> PersistReport {
        persist(records, &self.table, &self.pool, self.run_id).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbSettings {
    pub database_url: Option<String>,
    pub name: String,
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
}

impl Default for DbSettings {
    fn default() -> Self {
        Self {
            database_url: None,
            name: "funda".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            host: "localhost".to_string(),
            port: 5432,
        }
    }
}

impl DbSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            name: std::env::var("DB_NAME").unwrap_or(defaults.name),
            user: std::env::var("DB_USER").unwrap_or(defaults.user),
            password: std::env::var("DB_PASSWORD").unwrap_or(defaults.password),
            host: std::env::var("DB_HOST").unwrap_or(defaults.host),
            port: std::env::var("DB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
        }
    }

    pub fn connect_options(&self) -> anyhow::Result<PgConnectOptions> {
        if let Some(url) = &self.database_url {
            return url
                .parse::<PgConnectOptions>()
                .context("parsing DATABASE_URL");
        }
        Ok(PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.name))
    }

    /// Single-connection pool; the tracker is the only writer.
    pub async fn connect(&self) -> anyhow::Result<PgPool> {
        let options = self.connect_options()?;
        PgPoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to postgres database {}", self.name))
    }
}
