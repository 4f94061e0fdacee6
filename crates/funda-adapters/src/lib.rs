//! Funda search and market-insights adapters, plus the listing flattener.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;
use std::sync::Arc;

use funda_core::{
    integer_of, text_of, FlatListingRecord, ListingInsights, Loose, NeighbourhoodInsights,
    SearchHit,
};
use funda_storage::{FetchError, FetchedResponse, HttpTransport, OutboundRequest};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, error, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "funda-adapters";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_6) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/118.0.0.0 Safari/537.36";

/// Anonymous key the public site sends with every API call.
pub const DEFAULT_AUTHORIZATION: &str =
    "Basic ZjVhMjQyZGIxZmUwOjM5ZDYxMjI3LWQ1YTgtNDIxMi04NDY4LWU1NWQ0MjhjMmM2Zg==";

const LISTINGS_INDEX: &str = "listings-wonen-searcher-alias-prod";
const GEO_INDEX: &str = "geo-wonen-alias-prod";
const MSEARCH_TEMPLATE_ID: &str = "search_result_20250808";

/// Total order for pagination: newest first, then tier, relevance, numeric id.
pub const SORT_ORDER: &[(&str, &str)] = &[
    ("publish_date", "desc"),
    ("placement_type", "asc"),
    ("relevancy_sort_order", "desc"),
    ("id.number", "desc"),
];

const SOURCE_FIELDS: &[&str] = &[
    "address",
    "agent",
    "amenities",
    "availability",
    "construction_date_range",
    "construction_period",
    "construction_type",
    "description",
    "energy_label",
    "exterior_space_garden_orientation",
    "exterior_space_garden_size",
    "exterior_space_type",
    "floor_area",
    "garage_capacity",
    "garage_type",
    "handover_date_range",
    "id",
    "number_of_bedrooms",
    "number_of_rooms",
    "object_detail_page_relative_url",
    "object_type",
    "offering_type",
    "placement_type",
    "plot_area",
    "price",
    "project",
    "publish_date",
    "sale_date_range",
    "selected_area",
    "status",
    "surrounding",
    "zoning",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidQuery {
    #[error("postal code {0} is not a 4-digit locality code")]
    PostalCode(u32),
    #[error("page size must be greater than zero")]
    PageSize,
    #[error("unsupported radius {0:?}; expected one of 1, 2, 5, 10, 15, 30, 50, 100")]
    Radius(String),
    #[error("unsupported publication date filter {0:?}")]
    PublicationDate(String),
    #[error("unsupported offering type {0:?}; expected buy, rent or all")]
    OfferingType(String),
    #[error("unsupported search api {0:?}; expected reactivesearch or msearch")]
    Dialect(String),
}

/// Radius buckets precomputed by the geo index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadiusKm {
    One,
    Two,
    Five,
    Ten,
    Fifteen,
    Thirty,
    Fifty,
    Hundred,
}

impl RadiusKm {
    pub fn km(self) -> u32 {
        match self {
            RadiusKm::One => 1,
            RadiusKm::Two => 2,
            RadiusKm::Five => 5,
            RadiusKm::Ten => 10,
            RadiusKm::Fifteen => 15,
            RadiusKm::Thirty => 30,
            RadiusKm::Fifty => 50,
            RadiusKm::Hundred => 100,
        }
    }

    /// Name of the geo field holding this bucket.
    pub fn field(self) -> String {
        format!("area_with_radius.{}", self.km())
    }
}

impl TryFrom<u32> for RadiusKm {
    type Error = InvalidQuery;

    fn try_from(km: u32) -> Result<Self, Self::Error> {
        Ok(match km {
            1 => RadiusKm::One,
            2 => RadiusKm::Two,
            5 => RadiusKm::Five,
            10 => RadiusKm::Ten,
            15 => RadiusKm::Fifteen,
            30 => RadiusKm::Thirty,
            50 => RadiusKm::Fifty,
            100 => RadiusKm::Hundred,
            other => return Err(InvalidQuery::Radius(other.to_string())),
        })
    }
}

impl FromStr for RadiusKm {
    type Err = InvalidQuery;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u32>()
            .map_err(|_| InvalidQuery::Radius(s.to_string()))
            .and_then(RadiusKm::try_from)
    }
}

impl fmt::Display for RadiusKm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.km())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublicationDate {
    LastDay,
    Last3Days,
    Last5Days,
    Last10Days,
    #[default]
    Last30Days,
    NoPreference,
}

impl PublicationDate {
    pub fn as_str(self) -> &'static str {
        match self {
            PublicationDate::LastDay => "now-1d",
            PublicationDate::Last3Days => "now-3d",
            PublicationDate::Last5Days => "now-5d",
            PublicationDate::Last10Days => "now-10d",
            PublicationDate::Last30Days => "now-30d",
            PublicationDate::NoPreference => "no_preference",
        }
    }

    /// Window length in days; `None` means unconstrained.
    pub fn days(self) -> Option<u32> {
        match self {
            PublicationDate::LastDay => Some(1),
            PublicationDate::Last3Days => Some(3),
            PublicationDate::Last5Days => Some(5),
            PublicationDate::Last10Days => Some(10),
            PublicationDate::Last30Days => Some(30),
            PublicationDate::NoPreference => None,
        }
    }
}

impl FromStr for PublicationDate {
    type Err = InvalidQuery;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "now-1d" => PublicationDate::LastDay,
            "now-3d" => PublicationDate::Last3Days,
            "now-5d" => PublicationDate::Last5Days,
            "now-10d" => PublicationDate::Last10Days,
            "now-30d" => PublicationDate::Last30Days,
            "no_preference" => PublicationDate::NoPreference,
            other => return Err(InvalidQuery::PublicationDate(other.to_string())),
        })
    }
}

impl fmt::Display for PublicationDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OfferingType {
    #[default]
    Buy,
    Rent,
    All,
}

impl OfferingType {
    pub fn as_str(self) -> &'static str {
        match self {
            OfferingType::Buy => "buy",
            OfferingType::Rent => "rent",
            OfferingType::All => "all",
        }
    }
}

impl FromStr for OfferingType {
    type Err = InvalidQuery;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "buy" => OfferingType::Buy,
            "rent" => OfferingType::Rent,
            "all" => OfferingType::All,
            other => return Err(InvalidQuery::OfferingType(other.to_string())),
        })
    }
}

impl fmt::Display for OfferingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which search endpoint flavour requests are encoded for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchDialect {
    #[default]
    ReactiveSearch,
    MultiSearch,
}

impl FromStr for SearchDialect {
    type Err = InvalidQuery;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "reactivesearch" => Ok(SearchDialect::ReactiveSearch),
            "msearch" => Ok(SearchDialect::MultiSearch),
            other => Err(InvalidQuery::Dialect(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundaEndpoints {
    pub reactivesearch_url: String,
    pub msearch_url: String,
    pub listing_insights_url: String,
    pub neighbourhood_insights_url: String,
}

impl Default for FundaEndpoints {
    fn default() -> Self {
        Self {
            reactivesearch_url: format!(
                "https://listing-search-wonen-arc.funda.io/{LISTINGS_INDEX}/_reactivesearch?preference=_local"
            ),
            msearch_url: "https://listing-search-wonen.funda.io/_msearch/template".to_string(),
            listing_insights_url: "https://marketinsights.funda.io/v1/objectinsights".to_string(),
            neighbourhood_insights_url: "https://marketinsights.funda.io/v2/LocalInsights/preview"
                .to_string(),
        }
    }
}

/// Headers identifying this client to every endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub user_agent: String,
    pub authorization: String,
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            authorization: DEFAULT_AUTHORIZATION.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub postal_code4: u16,
    pub radius: RadiusKm,
    pub publication_date: PublicationDate,
    pub offering_type: OfferingType,
    pub offset: u64,
    pub page_size: u32,
}

pub fn build_search_request(
    postal_code4: u32,
    radius: RadiusKm,
    publication_date: PublicationDate,
    offering_type: OfferingType,
    offset: u64,
    page_size: u32,
) -> Result<SearchRequest, InvalidQuery> {
    if !(1000..=9999).contains(&postal_code4) {
        return Err(InvalidQuery::PostalCode(postal_code4));
    }
    if page_size == 0 {
        return Err(InvalidQuery::PageSize);
    }
    Ok(SearchRequest {
        postal_code4: postal_code4 as u16,
        radius,
        publication_date,
        offering_type,
        offset,
        page_size,
    })
}

impl SearchRequest {
    pub fn at_offset(&self, offset: u64) -> Self {
        Self {
            offset,
            ..self.clone()
        }
    }

    /// Area/filter descriptor stored with every row: `postal~radius~date`.
    pub fn descriptor(&self) -> String {
        format!(
            "{}~{}~{}",
            self.postal_code4, self.radius, self.publication_date
        )
    }

    fn location_identifier(&self) -> String {
        format!("{}-0", self.postal_code4)
    }

    pub fn reactivesearch_body(&self) -> JsonValue {
        let sort = SORT_ORDER
            .iter()
            .map(|(field, order)| keyed(field, json!(order)))
            .collect::<Vec<_>>();

        let mut queries = vec![
            json!({
                "id": "search_result",
                "type": "search",
                "dataField": ["availability"],
                "execute": true,
                "react": {
                    "and": [
                        "selected_area",
                        "offering_type",
                        "sort",
                        "publication_date",
                        "availability",
                        "zoning",
                        "type",
                        "free_text_search",
                        "search_result__internal"
                    ]
                },
                "size": self.page_size,
                "from": self.offset,
                "defaultQuery": {
                    "track_total_hits": true,
                    "timeout": "3s",
                    "sort": sort,
                    "_source": { "includes": SOURCE_FIELDS }
                }
            }),
            json!({
                "id": "selected_area",
                "type": "term",
                "dataField": ["reactive_component_field"],
                "execute": true,
                "customQuery": {
                    "id": "location-radius-query-v2",
                    "params": {
                        "searchField": "location",
                        "geoIndex": GEO_INDEX,
                        "locationIdentifier": self.location_identifier(),
                        "radiusField": self.radius.field()
                    }
                }
            }),
        ];

        if self.publication_date != PublicationDate::NoPreference {
            queries.push(json!({
                "id": "publication_date",
                "type": "term",
                "dataField": ["publish_date_utc"],
                "execute": false,
                "customQuery": {
                    "id": "publish-date-query-v2",
                    "params": {
                        "date_to": "now",
                        "date_from": self.publication_date.as_str()
                    }
                }
            }));
        }

        if self.offering_type != OfferingType::All {
            queries.push(json!({
                "id": "offering_type",
                "type": "term",
                "dataField": ["offering_type"],
                "execute": false,
                "value": self.offering_type.as_str()
            }));
        }

        json!({
            "settings": {
                "recordAnalytics": false,
                "enableQueryRules": true,
                "emptyQuery": true,
                "suggestionAnalytics": false,
                "queryParams": { "preference": "_local" }
            },
            "query": queries
        })
    }

    /// Newline-delimited body for the search-template endpoint.
    pub fn msearch_body(&self) -> String {
        let publication = match self.publication_date.days() {
            Some(days) => keyed(&days.to_string(), json!(true)),
            None => json!({}),
        };
        let index_line = json!({ "index": LISTINGS_INDEX });
        let query_line = json!({
            "id": MSEARCH_TEMPLATE_ID,
            "params": {
                "collapse_projects": false,
                "radius_search": {
                    "index": GEO_INDEX,
                    "id": self.location_identifier(),
                    "path": self.radius.field()
                },
                "offering_type": self.offering_type.as_str(),
                "project_phase": {},
                "publication_date": publication,
                "availability": ["available", "negotiations", "unavailable"],
                "free_text_search": "",
                // The template fixes its own page size; only the offset is sent.
                "page": { "from": self.offset },
                "zoning": ["residential", "recreational"],
                "type": ["single", "group"],
                "sort": { "field": null, "order": null },
                "open_house": {}
            }
        });
        format!("{index_line}\n{query_line}\n")
    }

    pub fn to_outbound(
        &self,
        dialect: SearchDialect,
        endpoints: &FundaEndpoints,
        identity: &ClientIdentity,
    ) -> OutboundRequest {
        let request = match dialect {
            SearchDialect::ReactiveSearch => OutboundRequest::post(
                endpoints.reactivesearch_url.clone(),
                "application/json",
                self.reactivesearch_body().to_string().into_bytes(),
            ),
            SearchDialect::MultiSearch => OutboundRequest::post(
                endpoints.msearch_url.clone(),
                "application/x-ndjson",
                self.msearch_body().into_bytes(),
            )
            .header("accept", "application/x-ndjson")
            .header("referer", "https://www.funda.nl/"),
        };
        request
            .header("user-agent", identity.user_agent.clone())
            .header("authorization", identity.authorization.clone())
    }
}

fn keyed(key: &str, value: JsonValue) -> JsonValue {
    let mut map = serde_json::Map::new();
    map.insert(key.to_string(), value);
    JsonValue::Object(map)
}

#[derive(Debug, Error)]
#[error("unexpected search response shape: {0}")]
pub struct ResponseShapeError(pub String);

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search endpoint returned status {status}: {body}")]
    Remote { status: u16, body: String },
    #[error(transparent)]
    Transport(#[from] FetchError),
    #[error(transparent)]
    ResponseShape(#[from] ResponseShapeError),
}

/// One page of search results.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchPage {
    pub total: u64,
    pub hits: Vec<JsonValue>,
}

fn hits_object(response: &JsonValue) -> Option<&JsonValue> {
    response
        .pointer("/responses/0/hits")
        .or_else(|| response.pointer("/search_result/hits"))
}

fn shape_error(what: &str, response: &JsonValue) -> ResponseShapeError {
    let mut got = response.to_string();
    if got.len() > 500 {
        let mut cut = 500;
        while !got.is_char_boundary(cut) {
            cut -= 1;
        }
        got.truncate(cut);
        got.push_str("...");
    }
    ResponseShapeError(format!("{what}; got {got}"))
}

/// Hit list of a response, in either the multi-search or reactive-search shape.
pub fn page_hits(response: &JsonValue) -> Result<Vec<JsonValue>, ResponseShapeError> {
    hits_object(response)
        .and_then(|hits| hits.get("hits"))
        .and_then(JsonValue::as_array)
        .cloned()
        .ok_or_else(|| shape_error("missing hits.hits array", response))
}

pub fn page_total(response: &JsonValue) -> Result<u64, ResponseShapeError> {
    hits_object(response)
        .and_then(|hits| hits.get("total"))
        .and_then(|total| total.get("value").unwrap_or(total).as_u64())
        .ok_or_else(|| shape_error("missing hits.total.value", response))
}

pub fn parse_search_page(response: &JsonValue) -> Result<SearchPage, ResponseShapeError> {
    Ok(SearchPage {
        total: page_total(response)?,
        hits: page_hits(response)?,
    })
}

/// Executes search requests against the configured endpoint.
#[derive(Clone)]
pub struct SearchClient {
    transport: Arc<dyn HttpTransport>,
    endpoints: FundaEndpoints,
    identity: ClientIdentity,
    dialect: SearchDialect,
}

impl SearchClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        endpoints: FundaEndpoints,
        identity: ClientIdentity,
        dialect: SearchDialect,
    ) -> Self {
        Self {
            transport,
            endpoints,
            identity,
            dialect,
        }
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchPage, SearchError> {
        let outbound = request.to_outbound(self.dialect, &self.endpoints, &self.identity);
        let resp = self.transport.send(outbound).await?;
        if !resp.is_success() {
            return Err(SearchError::Remote {
                status: resp.status,
                body: resp.text(),
            });
        }
        let value: JsonValue = resp
            .json()
            .map_err(|err| ResponseShapeError(format!("response is not JSON: {err}")))?;
        Ok(parse_search_page(&value)?)
    }
}

/// Bounded map evicting the least-recently-used entry when full.
#[derive(Debug, Clone)]
pub struct LruCache<K, V> {
    capacity: usize,
    tick: u64,
    entries: HashMap<K, (V, u64)>,
    recency: BTreeMap<u64, K>,
}

impl<K: Eq + Hash + Clone, V: Clone> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            tick: 0,
            entries: HashMap::new(),
            recency: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        let tick = self.next_tick();
        let (value, last_used) = self.entries.get_mut(key)?;
        let previous = *last_used;
        *last_used = tick;
        self.recency.remove(&previous);
        self.recency.insert(tick, key.clone());
        Some(value.clone())
    }

    pub fn insert(&mut self, key: K, value: V) {
        if self.capacity == 0 {
            return;
        }
        let tick = self.next_tick();
        if let Some((_, last_used)) = self.entries.get(&key) {
            self.recency.remove(last_used);
        } else if self.entries.len() >= self.capacity {
            if let Some((_, evicted)) = self.recency.pop_first() {
                self.entries.remove(&evicted);
            }
        }
        self.recency.insert(tick, key.clone());
        self.entries.insert(key, (value, tick));
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

#[derive(Debug, Error)]
pub enum InsightsUnavailable {
    #[error("no insights available (204)")]
    NoContent,
    #[error("insights endpoint returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error(transparent)]
    Transport(#[from] FetchError),
    #[error("undecodable insights payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid insights url: {0}")]
    InvalidUrl(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NeighbourhoodKey {
    pub city: String,
    pub neighbourhood: String,
}

/// Slashes and spaces become hyphens; runs of hyphens collapse to one.
pub fn normalize_neighbourhood(neighbourhood: &str) -> String {
    let mut out = String::with_capacity(neighbourhood.len());
    for ch in neighbourhood.chars() {
        let ch = if ch == '/' || ch == ' ' { '-' } else { ch };
        if ch == '-' && out.ends_with('-') {
            continue;
        }
        out.push(ch);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsightsCacheConfig {
    pub listing_capacity: usize,
    pub neighbourhood_capacity: usize,
}

impl Default for InsightsCacheConfig {
    fn default() -> Self {
        Self {
            listing_capacity: 10_000,
            neighbourhood_capacity: 2400,
        }
    }
}

fn endpoint_url(base: &str, segments: &[&str]) -> Result<String, InsightsUnavailable> {
    let mut url =
        reqwest::Url::parse(base).map_err(|e| InsightsUnavailable::InvalidUrl(e.to_string()))?;
    {
        let mut path = url
            .path_segments_mut()
            .map_err(|_| InsightsUnavailable::InvalidUrl(base.to_string()))?;
        path.pop_if_empty().extend(segments);
    }
    Ok(url.to_string())
}

fn decode_insights<T: serde::de::DeserializeOwned>(
    resp: FetchedResponse,
) -> Result<T, InsightsUnavailable> {
    match resp.status {
        200 => Ok(resp.json()?),
        204 => Err(InsightsUnavailable::NoContent),
        status => Err(InsightsUnavailable::Status {
            status,
            body: resp.text(),
        }),
    }
}

/// Memoizing lookups against the listing and neighbourhood insights endpoints.
///
/// Failures degrade to empty insights and are never returned to the caller.
pub struct InsightsFetcher {
    transport: Arc<dyn HttpTransport>,
    endpoints: FundaEndpoints,
    identity: ClientIdentity,
    listings: LruCache<String, ListingInsights>,
    neighbourhoods: LruCache<NeighbourhoodKey, NeighbourhoodInsights>,
}

impl InsightsFetcher {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        endpoints: FundaEndpoints,
        identity: ClientIdentity,
        caches: InsightsCacheConfig,
    ) -> Self {
        Self {
            transport,
            endpoints,
            identity,
            listings: LruCache::new(caches.listing_capacity),
            neighbourhoods: LruCache::new(caches.neighbourhood_capacity),
        }
    }

    pub fn cached_neighbourhoods(&self) -> usize {
        self.neighbourhoods.len()
    }

    pub fn cached_listings(&self) -> usize {
        self.listings.len()
    }

    /// Views/saves for one listing. 200 and 204 answers are cached; errors are not.
    pub async fn fetch_listing_insights(&mut self, listing_id: &str) -> ListingInsights {
        let key = listing_id.to_string();
        if let Some(hit) = self.listings.get(&key) {
            return hit;
        }

        let span = info_span!("listing_insights", listing_id);
        let result = self.request_listing(listing_id).instrument(span).await;
        match result {
            Ok(insights) => {
                self.listings.insert(key, insights);
                insights
            }
            Err(InsightsUnavailable::NoContent) => {
                debug!(listing_id, "no listing insights available");
                self.listings.insert(key, ListingInsights::default());
                ListingInsights::default()
            }
            Err(err) => {
                error!(listing_id, error = %err, "failed to get listing insights");
                ListingInsights::default()
            }
        }
    }

    async fn request_listing(&self, listing_id: &str) -> Result<ListingInsights, InsightsUnavailable> {
        let url = endpoint_url(&self.endpoints.listing_insights_url, &[listing_id])?;
        let request = OutboundRequest::get(url)
            .header("user-agent", self.identity.user_agent.clone())
            .header("authorization", self.identity.authorization.clone());
        decode_insights(self.transport.send(request).await?)
    }

    /// Neighbourhood statistics, keyed by city and normalized neighbourhood. Only 200 answers are cached.
    pub async fn fetch_neighbourhood_insights(
        &mut self,
        city: &str,
        neighbourhood: &str,
    ) -> NeighbourhoodInsights {
        let key = NeighbourhoodKey {
            city: city.to_string(),
            neighbourhood: normalize_neighbourhood(neighbourhood),
        };
        if key.city.is_empty() || key.neighbourhood.is_empty() {
            return NeighbourhoodInsights::default();
        }
        if let Some(hit) = self.neighbourhoods.get(&key) {
            return hit;
        }

        let span = info_span!("neighbourhood_insights", city, neighbourhood = %key.neighbourhood);
        let result = self.request_neighbourhood(&key).instrument(span).await;
        match result {
            Ok(insights) => {
                self.neighbourhoods.insert(key, insights);
                insights
            }
            Err(InsightsUnavailable::NoContent) => {
                debug!(city, neighbourhood = %key.neighbourhood, "no neighbourhood insights available");
                NeighbourhoodInsights::default()
            }
            Err(err) => {
                error!(
                    city,
                    neighbourhood = %key.neighbourhood,
                    error = %err,
                    "failed to get neighbourhood insights"
                );
                NeighbourhoodInsights::default()
            }
        }
    }

    async fn request_neighbourhood(
        &self,
        key: &NeighbourhoodKey,
    ) -> Result<NeighbourhoodInsights, InsightsUnavailable> {
        let url = endpoint_url(
            &self.endpoints.neighbourhood_insights_url,
            &[key.city.as_str(), key.neighbourhood.as_str()],
        )?;
        let request = OutboundRequest::get(url).header("user-agent", self.identity.user_agent.clone());
        decode_insights(self.transport.send(request).await?)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MalformedListing {
    #[error("listing {} is missing required field {field}", .listing_id.as_deref().unwrap_or("<unknown>"))]
    MissingField {
        listing_id: Option<String>,
        field: &'static str,
    },
    #[error("listing {} could not be decoded: {reason}", .listing_id.as_deref().unwrap_or("<unknown>"))]
    Undecodable {
        listing_id: Option<String>,
        reason: String,
    },
}

impl MalformedListing {
    pub fn listing_id(&self) -> Option<&str> {
        match self {
            MalformedListing::MissingField { listing_id, .. }
            | MalformedListing::Undecodable { listing_id, .. } => listing_id.as_deref(),
        }
    }
}

pub fn decode_hit(raw: &JsonValue) -> Result<SearchHit, MalformedListing> {
    serde_json::from_value(raw.clone()).map_err(|err| MalformedListing::Undecodable {
        listing_id: raw.get("_id").map(|id| Loose(id.clone()).text()),
        reason: err.to_string(),
    })
}

fn required(
    value: Option<&Loose>,
    field: &'static str,
    listing_id: &Option<String>,
) -> Result<String, MalformedListing> {
    match value {
        Some(v) if !v.is_absent() => Ok(v.text()),
        _ => Err(MalformedListing::MissingField {
            listing_id: listing_id.clone(),
            field,
        }),
    }
}

/// Project a decoded hit onto the flat record, without any insights lookups.
pub fn project(hit: &SearchHit) -> Result<FlatListingRecord, MalformedListing> {
    let known_id = hit.id.as_ref().map(Loose::text).filter(|id| !id.is_empty());
    let listing_id = required(hit.id.as_ref(), "_id", &known_id)?;
    let Some(raw) = &hit.source else {
        return Err(MalformedListing::MissingField {
            listing_id: known_id,
            field: "_source",
        });
    };
    let address = raw.address.clone().unwrap_or_default();
    let agent = raw
        .agent
        .as_ref()
        .and_then(|agents| agents.first())
        .cloned()
        .unwrap_or_default();
    let price = raw.price.clone().unwrap_or_default();
    let description = raw.description.clone().unwrap_or_default();

    Ok(FlatListingRecord {
        agent_id: text_of(agent.id.as_ref()),
        agent_url: text_of(agent.relative_url.as_ref()),
        listing_id,
        agent_name: text_of(agent.name.as_ref()),
        agent_association: text_of(agent.association.as_ref()),
        address_country: required(address.country.as_ref(), "address.country", &known_id)?,
        address_province: text_of(address.province.as_ref()),
        address_city: text_of(address.city.as_ref()),
        address_neighbourhood: text_of(address.neighbourhood.as_ref()),
        address_municipality: text_of(address.municipality.as_ref()),
        address_house_number: text_of(address.house_number.as_ref()),
        address_house_number_suffix: text_of(address.house_number_suffix.as_ref()),
        address_postal_code: required(
            address.postal_code.as_ref(),
            "address.postal_code",
            &known_id,
        )?,
        address_street_name: text_of(address.street_name.as_ref()),
        number_of_bedrooms: integer_of(raw.number_of_bedrooms.as_ref()),
        number_of_rooms: integer_of(raw.number_of_rooms.as_ref()),
        object_type: text_of(raw.object_type.as_ref()),
        energy_label: text_of(raw.energy_label.as_ref()),
        floor_area: integer_of(raw.floor_area.as_ref()),
        plot_area: integer_of(raw.plot_area.as_ref()),
        publish_date: required(raw.publish_date.as_ref(), "publish_date", &known_id)?,
        url_path: required(
            raw.object_detail_page_relative_url.as_ref(),
            "object_detail_page_relative_url",
            &known_id,
        )?,
        status: text_of(raw.status.as_ref()),
        price: integer_of(price.selling_price.as_ref()),
        price_type: text_of(price.selling_price_type.as_ref()),
        price_condition: text_of(price.selling_price_condition.as_ref()),
        placement_type: text_of(raw.placement_type.as_ref()),
        availability: text_of(raw.availability.as_ref()),
        amenities: text_of(raw.amenities.as_ref()),
        construction_date_range: raw
            .construction_date_range
            .as_ref()
            .map(|r| r.render())
            .unwrap_or_default(),
        construction_period: text_of(raw.construction_period.as_ref()),
        construction_type: text_of(raw.construction_type.as_ref()),
        handover_date_range: raw
            .handover_date_range
            .as_ref()
            .map(|r| r.render())
            .unwrap_or_default(),
        offering_type: text_of(raw.offering_type.as_ref()),
        project: raw
            .project
            .as_ref()
            .map(|p| text_of(p.id.as_ref()))
            .unwrap_or_default(),
        sale_date_range: raw
            .sale_date_range
            .as_ref()
            .map(|r| r.render())
            .unwrap_or_default(),
        selected_area: text_of(raw.selected_area.as_ref()),
        description: text_of(description.dutch.as_ref()),
        description_tags: text_of(description.tags.as_ref()),
        zoning: text_of(raw.zoning.as_ref()),
        surrounding: text_of(raw.surrounding.as_ref()),
        exterior_space_garden_size: text_of(raw.exterior_space_garden_size.as_ref()),
        exterior_space_type: text_of(raw.exterior_space_type.as_ref()),
        exterior_space_garden_orientation: text_of(raw.exterior_space_garden_orientation.as_ref()),
        garage_capacity: text_of(raw.garage_capacity.as_ref()),
        garage_type: text_of(raw.garage_type.as_ref()),
        ..Default::default()
    })
}

/// Flatten one hit and attach neighbourhood insights, plus listing insights when `enrich` is set.
pub async fn flatten(
    raw: &JsonValue,
    enrich: bool,
    insights: &mut InsightsFetcher,
) -> Result<FlatListingRecord, MalformedListing> {
    let hit = decode_hit(raw)?;
    let mut record = project(&hit)?;

    let neighbourhood = insights
        .fetch_neighbourhood_insights(&record.address_city, &record.address_neighbourhood)
        .await;
    record.apply_neighbourhood_insights(&neighbourhood);

    if enrich {
        let listing = insights.fetch_listing_insights(&record.listing_id).await;
        record.apply_listing_insights(&listing);
    }

    Ok(record)
}

/// Per-listing results of flattening one page.
#[derive(Debug, Clone, Default)]
pub struct PageOutcome {
    pub records: Vec<FlatListingRecord>,
    pub skipped: Vec<MalformedListing>,
}

/// Flatten every hit of a page; a malformed listing is skipped, never fatal to the page.
pub async fn flatten_page(
    hits: &[JsonValue],
    enrich: bool,
    insights: &mut InsightsFetcher,
) -> PageOutcome {
    debug!(count = hits.len(), "parsing listings");
    let mut outcome = PageOutcome::default();
    for hit in hits {
        match flatten(hit, enrich, insights).await {
            Ok(record) => outcome.records.push(record),
            Err(err) => {
                warn!(error = %err, "skipping malformed listing");
                outcome.skipped.push(err);
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;

    type Responder = Box<dyn Fn(&OutboundRequest) -> Result<FetchedResponse, FetchError> + Send + Sync>;

    struct FakeTransport {
        requests: Mutex<Vec<OutboundRequest>>,
        respond: Responder,
    }

    impl FakeTransport {
        fn new(
            respond: impl Fn(&OutboundRequest) -> Result<FetchedResponse, FetchError> + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
                respond: Box::new(respond),
            })
        }

        fn requests(&self) -> Vec<OutboundRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HttpTransport for FakeTransport {
        async fn send(&self, request: OutboundRequest) -> Result<FetchedResponse, FetchError> {
            let resp = (self.respond)(&request);
            self.requests.lock().unwrap().push(request);
            resp
        }
    }

    fn reply(status: u16, body: &str) -> Result<FetchedResponse, FetchError> {
        Ok(FetchedResponse {
            status,
            final_url: String::new(),
            body: body.as_bytes().to_vec(),
        })
    }

    fn fixture(name: &str) -> JsonValue {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/funda")
            .join(name);
        let text = std::fs::read_to_string(&path).expect("read fixture");
        serde_json::from_str(&text).expect("parse fixture")
    }

    fn fetcher(transport: Arc<FakeTransport>) -> InsightsFetcher {
        InsightsFetcher::new(
            transport,
            FundaEndpoints::default(),
            ClientIdentity::default(),
            InsightsCacheConfig::default(),
        )
    }

    fn sample_request() -> SearchRequest {
        build_search_request(
            1000,
            RadiusKm::Fifteen,
            PublicationDate::Last3Days,
            OfferingType::Buy,
            50,
            25,
        )
        .unwrap()
    }

    fn first_hit(name: &str) -> JsonValue {
        page_hits(&fixture(name)).unwrap().remove(0)
    }

    #[test]
    fn search_request_construction_validates_inputs() {
        assert_eq!(
            build_search_request(999, RadiusKm::One, PublicationDate::NoPreference, OfferingType::All, 0, 100),
            Err(InvalidQuery::PostalCode(999))
        );
        assert_eq!(
            build_search_request(1000, RadiusKm::One, PublicationDate::NoPreference, OfferingType::All, 0, 0),
            Err(InvalidQuery::PageSize)
        );
        assert_eq!("7".parse::<RadiusKm>(), Err(InvalidQuery::Radius("7".into())));
        assert_eq!("15".parse::<RadiusKm>(), Ok(RadiusKm::Fifteen));
        assert_eq!("now-10d".parse::<PublicationDate>(), Ok(PublicationDate::Last10Days));
        assert!("now-2d".parse::<PublicationDate>().is_err());
        assert!("lease".parse::<OfferingType>().is_err());
    }

    #[test]
    fn reactivesearch_body_paginates_with_total_order() {
        let body = sample_request().reactivesearch_body();
        let search = body["query"]
            .as_array()
            .unwrap()
            .iter()
            .find(|q| q["id"] == "search_result")
            .unwrap();
        assert_eq!(search["from"], 50);
        assert_eq!(search["size"], 25);
        assert_eq!(
            search["defaultQuery"]["sort"],
            json!([
                {"publish_date": "desc"},
                {"placement_type": "asc"},
                {"relevancy_sort_order": "desc"},
                {"id.number": "desc"}
            ])
        );

        let area = body["query"]
            .as_array()
            .unwrap()
            .iter()
            .find(|q| q["id"] == "selected_area")
            .unwrap();
        assert_eq!(area["customQuery"]["params"]["locationIdentifier"], "1000-0");
        assert_eq!(area["customQuery"]["params"]["radiusField"], "area_with_radius.15");
    }

    #[test]
    fn reactivesearch_body_omits_unconstrained_filters() {
        let constrained = sample_request().reactivesearch_body();
        let ids = |body: &JsonValue| {
            body["query"]
                .as_array()
                .unwrap()
                .iter()
                .map(|q| q["id"].as_str().unwrap().to_string())
                .collect::<Vec<_>>()
        };
        assert_eq!(
            ids(&constrained),
            vec!["search_result", "selected_area", "publication_date", "offering_type"]
        );
        let publication = &constrained["query"][2]["customQuery"]["params"];
        assert_eq!(publication["date_from"], "now-3d");
        assert_eq!(publication["date_to"], "now");

        let open = build_search_request(
            1000,
            RadiusKm::Five,
            PublicationDate::NoPreference,
            OfferingType::All,
            0,
            100,
        )
        .unwrap()
        .reactivesearch_body();
        assert_eq!(ids(&open), vec!["search_result", "selected_area"]);
    }

    #[test]
    fn msearch_body_is_two_json_lines() {
        let body = sample_request().msearch_body();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(body.ends_with('\n'));
        let index: JsonValue = serde_json::from_str(lines[0]).unwrap();
        let query: JsonValue = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(index["index"], LISTINGS_INDEX);
        assert_eq!(query["params"]["page"], json!({"from": 50}));
        assert_eq!(query["params"]["publication_date"], json!({"3": true}));
        assert_eq!(query["params"]["radius_search"]["path"], "area_with_radius.15");
        assert_eq!(query["params"]["offering_type"], "buy");
    }

    #[test]
    fn outbound_search_carries_identity_headers() {
        let identity = ClientIdentity {
            user_agent: "Mozilla/5.0 Test Agent".into(),
            authorization: "Basic test".into(),
        };
        let req = sample_request().to_outbound(SearchDialect::ReactiveSearch, &FundaEndpoints::default(), &identity);
        assert_eq!(req.header_value("User-Agent"), Some("Mozilla/5.0 Test Agent"));
        assert_eq!(req.header_value("Authorization"), Some("Basic test"));
        assert_eq!(req.header_value("content-type"), Some("application/json"));

        let req = sample_request().to_outbound(SearchDialect::MultiSearch, &FundaEndpoints::default(), &identity);
        assert_eq!(req.header_value("content-type"), Some("application/x-ndjson"));
        assert!(req.url.ends_with("/_msearch/template"));
    }

    #[test]
    fn descriptor_joins_area_and_filters() {
        assert_eq!(sample_request().descriptor(), "1000~15~now-3d");
    }

    #[test]
    fn response_shapes_are_recognised() {
        let page = parse_search_page(&fixture("search_response.json")).unwrap();
        assert_eq!(page.total, 705);
        assert_eq!(page.hits.len(), 1);

        let reactive = json!({"search_result": {"hits": {"total": 3, "hits": [{}, {}, {}]}}});
        let page = parse_search_page(&reactive).unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.hits.len(), 3);

        let err = parse_search_page(&json!({"invalid": "structure"})).unwrap_err();
        assert!(err.to_string().contains("missing hits"));
        assert!(page_total(&fixture("minimal_response.json")).is_err());
        assert_eq!(page_hits(&fixture("minimal_response.json")).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn search_failure_carries_status_and_body() {
        let transport = FakeTransport::new(|_| reply(400, "Bad Request"));
        let client = SearchClient::new(
            transport.clone(),
            FundaEndpoints::default(),
            ClientIdentity::default(),
            SearchDialect::ReactiveSearch,
        );
        match client.search(&sample_request()).await {
            Err(SearchError::Remote { status, body }) => {
                assert_eq!(status, 400);
                assert_eq!(body, "Bad Request");
            }
            other => panic!("expected remote error, got {other:?}"),
        }
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn search_success_parses_page() {
        let body = fixture("search_response.json").to_string();
        let transport = FakeTransport::new(move |_| reply(200, &body));
        let client = SearchClient::new(
            transport.clone(),
            FundaEndpoints::default(),
            ClientIdentity::default(),
            SearchDialect::ReactiveSearch,
        );
        let page = client.search(&sample_request()).await.unwrap();
        assert_eq!(page.total, 705);
        let sent: JsonValue = serde_json::from_slice(transport.requests()[0].body.as_ref().unwrap()).unwrap();
        assert_eq!(sent["query"][0]["from"], 50);
    }

    #[tokio::test]
    async fn listing_insights_success_is_cached() {
        let transport = FakeTransport::new(|_| reply(200, r#"{"nrOfViews": 150, "nrOfSaves": 25}"#));
        let mut insights = fetcher(transport.clone());

        let first = insights.fetch_listing_insights("12345").await;
        let second = insights.fetch_listing_insights("12345").await;

        assert_eq!(first.nr_of_views, Some(150));
        assert_eq!(first.nr_of_saves, Some(25));
        assert_eq!(first, second);
        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url, "https://marketinsights.funda.io/v1/objectinsights/12345");
        assert_eq!(requests[0].header_value("authorization"), Some(DEFAULT_AUTHORIZATION));
    }

    #[tokio::test]
    async fn listing_insights_no_content_and_errors_are_empty() {
        let transport = FakeTransport::new(|req| {
            if req.url.ends_with("/1") {
                reply(204, "")
            } else {
                reply(500, "Internal Server Error")
            }
        });
        let mut insights = fetcher(transport.clone());

        assert!(insights.fetch_listing_insights("1").await.is_empty());
        assert!(insights.fetch_listing_insights("1").await.is_empty());
        assert!(insights.fetch_listing_insights("2").await.is_empty());
        assert!(insights.fetch_listing_insights("2").await.is_empty());

        // 204 is remembered, 500 is retried on the next call.
        assert_eq!(transport.requests().len(), 3);
        assert_eq!(insights.cached_listings(), 1);
    }

    #[tokio::test]
    async fn listing_insights_transport_failure_is_empty() {
        let transport = FakeTransport::new(|req| {
            Err(FetchError::Other {
                url: req.url.clone(),
                message: "connection reset".into(),
            })
        });
        let mut insights = fetcher(transport);
        assert!(insights.fetch_listing_insights("1").await.is_empty());
    }

    #[tokio::test]
    async fn neighbourhood_lookup_is_requested_once() {
        let transport = FakeTransport::new(|_| {
            reply(200, r#"{"inhabitants": 50000, "averageAskingPricePerM2": 8500, "familiesWithChildren": 0.35}"#)
        });
        let mut insights = fetcher(transport.clone());

        let first = insights.fetch_neighbourhood_insights("Amsterdam", "Landlust").await;
        let second = insights.fetch_neighbourhood_insights("Amsterdam", "Landlust").await;

        assert_eq!(first.inhabitants, Some(50000.0));
        assert_eq!(first.average_asking_price_per_m2, Some(8500.0));
        assert_eq!(first, second);
        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].url,
            "https://marketinsights.funda.io/v2/LocalInsights/preview/Amsterdam/Landlust"
        );
        assert_eq!(requests[0].header_value("authorization"), None);
    }

    #[tokio::test]
    async fn neighbourhood_key_uses_normalized_name() {
        let transport = FakeTransport::new(|_| reply(200, r#"{"inhabitants": 1200}"#));
        let mut insights = fetcher(transport.clone());

        insights.fetch_neighbourhood_insights("Amsterdam", "Oud West / Centrum").await;
        insights.fetch_neighbourhood_insights("Amsterdam", "Oud-West-Centrum").await;

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].url.ends_with("/preview/Amsterdam/Oud-West-Centrum"));
    }

    #[tokio::test]
    async fn neighbourhood_no_content_is_not_cached() {
        let transport = FakeTransport::new(|_| reply(204, ""));
        let mut insights = fetcher(transport.clone());
        assert!(insights.fetch_neighbourhood_insights("Utrecht", "Lombok").await.is_empty());
        assert!(insights.fetch_neighbourhood_insights("Utrecht", "Lombok").await.is_empty());
        assert_eq!(transport.requests().len(), 2);
        assert_eq!(insights.cached_neighbourhoods(), 0);
    }

    #[tokio::test]
    async fn neighbourhood_lookup_skips_missing_location() {
        let transport = FakeTransport::new(|_| reply(200, "{}"));
        let mut insights = fetcher(transport.clone());
        assert!(insights.fetch_neighbourhood_insights("", "").await.is_empty());
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn normalization_collapses_separators() {
        assert_eq!(normalize_neighbourhood("Landlust"), "Landlust");
        assert_eq!(normalize_neighbourhood("Oud West / Centrum"), "Oud-West-Centrum");
        assert_eq!(normalize_neighbourhood("a--b  c"), "a-b-c");
    }

    #[test]
    fn lru_cache_evicts_least_recently_used() {
        let mut cache = LruCache::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        assert_eq!(cache.get(&"a"), Some(1));
        cache.insert("c", 3);
        assert!(cache.contains(&"a"));
        assert!(!cache.contains(&"b"));
        assert!(cache.contains(&"c"));
        cache.insert("a", 10);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"a"), Some(10));

        let mut disabled: LruCache<&str, i32> = LruCache::new(0);
        disabled.insert("a", 1);
        assert!(disabled.is_empty());
    }

    #[tokio::test]
    async fn flatten_sample_listing_without_enrichment() {
        let transport = FakeTransport::new(|_| reply(204, ""));
        let mut insights = fetcher(transport.clone());
        let record = flatten(&first_hit("search_response.json"), false, &mut insights)
            .await
            .unwrap();

        assert_eq!(record.listing_id, "6965113");
        assert_eq!(record.agent_id, "24581");
        assert_eq!(record.agent_name, "Tel Krop Makelaars");
        assert_eq!(record.address_city, "Amsterdam");
        assert_eq!(record.address_neighbourhood, "Landlust");
        assert_eq!(record.price, Some(375000));
        assert_eq!(record.number_of_bedrooms, Some(2));
        assert_eq!(record.number_of_rooms, Some(3));
        assert_eq!(record.object_type, "apartment");
        assert_eq!(record.energy_label, "D");
        assert_eq!(record.floor_area, Some(51));
        assert_eq!(record.plot_area, Some(0));
        assert_eq!(record.amenities, "balcony,garden");
        assert_eq!(record.surrounding, "park,school");
        assert_eq!(record.construction_date_range, "1980~1990");
        assert_eq!(record.sale_date_range, "2023-01-01~2023-12-31");
        assert_eq!(record.description, "Mooie woning");
        assert_eq!(record.description_tags, "modern,central");
        assert_eq!(record.offering_type, "buy");
        assert_eq!(record.project, "project123");
        assert_eq!(record.neighbourhood_inhabitants, None);
        assert_eq!(record.listing_nr_of_views, None);

        // Only the neighbourhood lookup goes out when enrichment is off.
        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].url.contains("/LocalInsights/preview/"));
    }

    #[tokio::test]
    async fn flatten_attaches_insights_when_enriched() {
        let transport = FakeTransport::new(|req| {
            if req.url.contains("objectinsights") {
                reply(200, r#"{"nrOfViews": 100, "nrOfSaves": 20}"#)
            } else {
                reply(200, r#"{"inhabitants": 50000, "averageAskingPricePerM2": 8500, "familiesWithChildren": 0.35}"#)
            }
        });
        let mut insights = fetcher(transport.clone());
        let record = flatten(&first_hit("search_response.json"), true, &mut insights)
            .await
            .unwrap();

        assert_eq!(record.listing_nr_of_views, Some(100));
        assert_eq!(record.listing_nr_of_saves, Some(20));
        assert_eq!(record.neighbourhood_inhabitants, Some(50000));
        assert_eq!(record.neighbourhood_avg_askingprice_m2, Some(8500));
        assert_eq!(record.neighbourhood_families_with_children_pct, Some(0.35));
        assert!(transport
            .requests()
            .iter()
            .any(|r| r.url.ends_with("/objectinsights/6965113")));
    }

    #[tokio::test]
    async fn flatten_leaves_listing_insights_absent_on_partial_payload() {
        let transport = FakeTransport::new(|req| {
            if req.url.contains("objectinsights") {
                reply(200, r#"{"nrOfViews": 100}"#)
            } else {
                reply(204, "")
            }
        });
        let mut insights = fetcher(transport);
        let record = flatten(&first_hit("search_response.json"), true, &mut insights)
            .await
            .unwrap();
        assert_eq!(record.listing_nr_of_views, None);
        assert_eq!(record.listing_nr_of_saves, None);
    }

    #[tokio::test]
    async fn flatten_defaults_missing_optional_fields() {
        let transport = FakeTransport::new(|_| reply(204, ""));
        let mut insights = fetcher(transport);
        let record = flatten(&first_hit("minimal_response.json"), false, &mut insights)
            .await
            .unwrap();

        assert_eq!(record.listing_id, "test123");
        assert_eq!(record.address_country, "NL");
        assert_eq!(record.url_path, "/test/path/");
        assert_eq!(record.price, None);
        assert_eq!(record.agent_name, "");
        assert_eq!(record.floor_area, None);
        assert_eq!(record.amenities, "");
        assert_eq!(record.construction_date_range, "");
        assert_eq!(record.columns().len(), funda_core::record_columns().count());
    }

    #[test]
    fn each_required_field_is_enforced() {
        let cases: &[(&str, &str)] = &[
            ("/_id", "_id"),
            ("/_source/address/country", "address.country"),
            ("/_source/address/postal_code", "address.postal_code"),
            ("/_source/publish_date", "publish_date"),
            ("/_source/object_detail_page_relative_url", "object_detail_page_relative_url"),
        ];
        for (pointer, field) in cases {
            let mut hit = first_hit("search_response.json");
            let (parent, key) = pointer.rsplit_once('/').unwrap();
            let container = if parent.is_empty() {
                &mut hit
            } else {
                hit.pointer_mut(parent).unwrap()
            };
            container.as_object_mut().unwrap().remove(key);

            let err = decode_hit(&hit).and_then(|h| project(&h)).unwrap_err();
            assert_eq!(
                err,
                MalformedListing::MissingField {
                    listing_id: if *field == "_id" { None } else { Some("6965113".into()) },
                    field: *field,
                },
                "removing {pointer}"
            );
        }
    }

    #[tokio::test]
    async fn flatten_page_skips_bad_listings_and_continues() {
        let transport = FakeTransport::new(|_| reply(204, ""));
        let mut insights = fetcher(transport);
        let good = first_hit("search_response.json");
        let mut missing_address = good.clone();
        missing_address["_source"]
            .as_object_mut()
            .unwrap()
            .remove("address");
        let undecodable = json!({"_id": "77", "_source": {"address": "not an object"}});
        let minimal = first_hit("minimal_response.json");

        let outcome = flatten_page(&[good, missing_address, undecodable, minimal], false, &mut insights).await;

        assert_eq!(
            outcome.records.iter().map(|r| r.listing_id.as_str()).collect::<Vec<_>>(),
            vec!["6965113", "test123"]
        );
        assert_eq!(outcome.skipped.len(), 2);
        assert_eq!(outcome.skipped[1].listing_id(), Some("77"));
        assert!(matches!(outcome.skipped[1], MalformedListing::Undecodable { .. }));
    }
}
