//! Core listing model and destination schema for the Funda tracker.

use chrono::NaiveDateTime;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "funda-core";

/// Primary-key column holding the content hash of a row.
pub const PRIMARY_KEY_COLUMN: &str = "id";
pub const PROCESSING_TIME_COLUMN: &str = "_processing_time";
pub const RUN_ID_COLUMN: &str = "_run_id";

/// Storage type of one destination column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    PrimaryKey,
    Varchar(Option<u16>),
    Integer,
    Real,
    Timestamp,
}

impl ColumnType {
    pub fn sql(&self) -> String {
        match self {
            ColumnType::PrimaryKey => "VARCHAR(100) PRIMARY KEY".to_string(),
            ColumnType::Varchar(Some(len)) => format!("VARCHAR({len})"),
            ColumnType::Varchar(None) => "VARCHAR".to_string(),
            ColumnType::Integer => "INTEGER".to_string(),
            ColumnType::Real => "REAL".to_string(),
            ColumnType::Timestamp => "TIMESTAMP".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
}

const fn col(name: &'static str, ty: ColumnType) -> Column {
    Column { name, ty }
}

const V100: ColumnType = ColumnType::Varchar(Some(100));
const V500: ColumnType = ColumnType::Varchar(Some(500));
const V1000: ColumnType = ColumnType::Varchar(Some(1000));

/// Destination table layout, in insertion order.
pub const LISTING_SCHEMA: &[Column] = &[
    col("id", ColumnType::PrimaryKey),
    col("agent_id", V100),
    col("agent_url", V500),
    col("listing_id", V100),
    col("agent_name", V500),
    col("agent_association", V500),
    col("address_country", V100),
    col("address_province", V100),
    col("address_city", V100),
    col("address_neighbourhood", V100),
    col("address_municipality", V100),
    col("address_house_number", V100),
    col("address_house_number_suffix", V100),
    col("address_postal_code", V100),
    col("address_street_name", V500),
    col("number_of_bedrooms", ColumnType::Integer),
    col("number_of_rooms", ColumnType::Integer),
    col("object_type", V100),
    col("energy_label", V100),
    col("floor_area", ColumnType::Integer),
    col("plot_area", ColumnType::Integer),
    col("publish_date", ColumnType::Timestamp),
    col("url_path", V500),
    col("status", V100),
    col("price", ColumnType::Integer),
    col("price_type", V100),
    col("price_condition", V100),
    col("placement_type", V100),
    col("availability", V100),
    col("amenities", V1000),
    col("construction_date_range", V100),
    col("construction_period", V100),
    col("construction_type", V100),
    col("handover_date_range", V100),
    col("offering_type", V100),
    col("project", V100),
    col("sale_date_range", V100),
    col("selected_area", V100),
    col("description", ColumnType::Varchar(None)),
    col("description_tags", V1000),
    col("zoning", V100),
    col("surrounding", V1000),
    col("exterior_space_garden_size", V100),
    col("exterior_space_type", V100),
    col("exterior_space_garden_orientation", V100),
    col("garage_capacity", V100),
    col("garage_type", V100),
    col("neighbourhood_inhabitants", ColumnType::Integer),
    col("neighbourhood_avg_askingprice_m2", ColumnType::Integer),
    col("neighbourhood_families_with_children_pct", ColumnType::Real),
    col("listing_nr_of_saves", ColumnType::Integer),
    col("listing_nr_of_views", ColumnType::Integer),
    col("search_query", V500),
    col(PROCESSING_TIME_COLUMN, ColumnType::Timestamp),
    col(RUN_ID_COLUMN, V100),
];

pub fn column(name: &str) -> Option<&'static Column> {
    LISTING_SCHEMA.iter().find(|c| c.name == name)
}

/// Columns carried by [`FlatListingRecord`]: everything except the key and run metadata.
pub fn record_columns() -> impl Iterator<Item = &'static Column> {
    LISTING_SCHEMA.iter().filter(|c| {
        !matches!(
            c.name,
            PRIMARY_KEY_COLUMN | PROCESSING_TIME_COLUMN | RUN_ID_COLUMN
        )
    })
}

/// One typed cell of a flat row.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Text(String),
    Integer(Option<i32>),
    Real(Option<f32>),
    /// Timestamp kept in its source text form; the database parses it.
    Timestamp(String),
}

impl ColumnValue {
    /// Text form used when hashing a row. Absent values render empty.
    pub fn render(&self) -> String {
        match self {
            ColumnValue::Text(s) | ColumnValue::Timestamp(s) => s.clone(),
            ColumnValue::Integer(v) => v.map(|v| v.to_string()).unwrap_or_default(),
            ColumnValue::Real(v) => v.map(|v| v.to_string()).unwrap_or_default(),
        }
    }
}

/// Processing metadata attached to a row at write time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowMetadata {
    pub processing_time: NaiveDateTime,
    pub run_id: Uuid,
}

/// Single-level projection of one listing, one field per schema column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlatListingRecord {
    pub agent_id: String,
    pub agent_url: String,
    pub listing_id: String,
    pub agent_name: String,
    pub agent_association: String,
    pub address_country: String,
    pub address_province: String,
    pub address_city: String,
    pub address_neighbourhood: String,
    pub address_municipality: String,
    pub address_house_number: String,
    pub address_house_number_suffix: String,
    pub address_postal_code: String,
    pub address_street_name: String,
    pub number_of_bedrooms: Option<i32>,
    pub number_of_rooms: Option<i32>,
    pub object_type: String,
    pub energy_label: String,
    pub floor_area: Option<i32>,
    pub plot_area: Option<i32>,
    pub publish_date: String,
    pub url_path: String,
    pub status: String,
    pub price: Option<i32>,
    pub price_type: String,
    pub price_condition: String,
    pub placement_type: String,
    pub availability: String,
    pub amenities: String,
    pub construction_date_range: String,
    pub construction_period: String,
    pub construction_type: String,
    pub handover_date_range: String,
    pub offering_type: String,
    pub project: String,
    pub sale_date_range: String,
    pub selected_area: String,
    pub description: String,
    pub description_tags: String,
    pub zoning: String,
    pub surrounding: String,
    pub exterior_space_garden_size: String,
    pub exterior_space_type: String,
    pub exterior_space_garden_orientation: String,
    pub garage_capacity: String,
    pub garage_type: String,
    pub neighbourhood_inhabitants: Option<i32>,
    pub neighbourhood_avg_askingprice_m2: Option<i32>,
    pub neighbourhood_families_with_children_pct: Option<f32>,
    pub listing_nr_of_saves: Option<i32>,
    pub listing_nr_of_views: Option<i32>,
    pub search_query: String,
}

impl FlatListingRecord {
    /// Column name / value pairs in schema order.
    pub fn columns(&self) -> Vec<(&'static str, ColumnValue)> {
        use ColumnValue::{Integer, Real, Text, Timestamp};
        vec![
            ("agent_id", Text(self.agent_id.clone())),
            ("agent_url", Text(self.agent_url.clone())),
            ("listing_id", Text(self.listing_id.clone())),
            ("agent_name", Text(self.agent_name.clone())),
            ("agent_association", Text(self.agent_association.clone())),
            ("address_country", Text(self.address_country.clone())),
            ("address_province", Text(self.address_province.clone())),
            ("address_city", Text(self.address_city.clone())),
            ("address_neighbourhood", Text(self.address_neighbourhood.clone())),
            ("address_municipality", Text(self.address_municipality.clone())),
            ("address_house_number", Text(self.address_house_number.clone())),
            (
                "address_house_number_suffix",
                Text(self.address_house_number_suffix.clone()),
            ),
            ("address_postal_code", Text(self.address_postal_code.clone())),
            ("address_street_name", Text(self.address_street_name.clone())),
            ("number_of_bedrooms", Integer(self.number_of_bedrooms)),
            ("number_of_rooms", Integer(self.number_of_rooms)),
            ("object_type", Text(self.object_type.clone())),
            ("energy_label", Text(self.energy_label.clone())),
            ("floor_area", Integer(self.floor_area)),
            ("plot_area", Integer(self.plot_area)),
            ("publish_date", Timestamp(self.publish_date.clone())),
            ("url_path", Text(self.url_path.clone())),
            ("status", Text(self.status.clone())),
            ("price", Integer(self.price)),
            ("price_type", Text(self.price_type.clone())),
            ("price_condition", Text(self.price_condition.clone())),
            ("placement_type", Text(self.placement_type.clone())),
            ("availability", Text(self.availability.clone())),
            ("amenities", Text(self.amenities.clone())),
            (
                "construction_date_range",
                Text(self.construction_date_range.clone()),
            ),
            ("construction_period", Text(self.construction_period.clone())),
            ("construction_type", Text(self.construction_type.clone())),
            ("handover_date_range", Text(self.handover_date_range.clone())),
            ("offering_type", Text(self.offering_type.clone())),
            ("project", Text(self.project.clone())),
            ("sale_date_range", Text(self.sale_date_range.clone())),
            ("selected_area", Text(self.selected_area.clone())),
            ("description", Text(self.description.clone())),
            ("description_tags", Text(self.description_tags.clone())),
            ("zoning", Text(self.zoning.clone())),
            ("surrounding", Text(self.surrounding.clone())),
            (
                "exterior_space_garden_size",
                Text(self.exterior_space_garden_size.clone()),
            ),
            ("exterior_space_type", Text(self.exterior_space_type.clone())),
            (
                "exterior_space_garden_orientation",
                Text(self.exterior_space_garden_orientation.clone()),
            ),
            ("garage_capacity", Text(self.garage_capacity.clone())),
            ("garage_type", Text(self.garage_type.clone())),
            (
                "neighbourhood_inhabitants",
                Integer(self.neighbourhood_inhabitants),
            ),
            (
                "neighbourhood_avg_askingprice_m2",
                Integer(self.neighbourhood_avg_askingprice_m2),
            ),
            (
                "neighbourhood_families_with_children_pct",
                Real(self.neighbourhood_families_with_children_pct),
            ),
            ("listing_nr_of_saves", Integer(self.listing_nr_of_saves)),
            ("listing_nr_of_views", Integer(self.listing_nr_of_views)),
            ("search_query", Text(self.search_query.clone())),
        ]
    }

    pub fn apply_neighbourhood_insights(&mut self, insights: &NeighbourhoodInsights) {
        self.neighbourhood_inhabitants = insights.inhabitants.and_then(int_column);
        self.neighbourhood_avg_askingprice_m2 =
            insights.average_asking_price_per_m2.and_then(int_column);
        self.neighbourhood_families_with_children_pct =
            insights.families_with_children.map(|v| v as f32);
    }

    /// Both counters or neither: a payload missing either key leaves the fields absent.
    pub fn apply_listing_insights(&mut self, insights: &ListingInsights) {
        if let (Some(views), Some(saves)) = (insights.nr_of_views, insights.nr_of_saves) {
            self.listing_nr_of_views = i32::try_from(views).ok();
            self.listing_nr_of_saves = i32::try_from(saves).ok();
        }
    }
}

fn int_column(value: f64) -> Option<i32> {
    if !value.is_finite() {
        return None;
    }
    let rounded = value.round();
    if rounded < i32::MIN as f64 || rounded > i32::MAX as f64 {
        return None;
    }
    Some(rounded as i32)
}

/// Loosely typed scalar from the search index: strings, numbers, or lists of either.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct Loose(pub JsonValue);

impl Loose {
    /// Text form; lists are comma-joined in order.
    pub fn text(&self) -> String {
        value_text(&self.0)
    }

    /// Integer form; for lists the first element is used.
    pub fn integer(&self) -> Option<i32> {
        value_integer(&self.0)
    }

    pub fn is_absent(&self) -> bool {
        match &self.0 {
            JsonValue::Null => true,
            JsonValue::String(s) => s.is_empty(),
            _ => false,
        }
    }
}

fn value_text(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Array(items) => items.iter().map(value_text).collect::<Vec<_>>().join(","),
        JsonValue::Object(_) => value.to_string(),
    }
}

fn value_integer(value: &JsonValue) -> Option<i32> {
    match value {
        JsonValue::Number(n) => match n.as_i64() {
            Some(v) => i32::try_from(v).ok(),
            None => n.as_f64().and_then(int_column),
        },
        JsonValue::String(s) => s.trim().parse::<f64>().ok().and_then(int_column),
        JsonValue::Array(items) => items.first().and_then(value_integer),
        _ => None,
    }
}

pub fn text_of(value: Option<&Loose>) -> String {
    value.map(Loose::text).unwrap_or_default()
}

pub fn integer_of(value: Option<&Loose>) -> Option<i32> {
    value.and_then(Loose::integer)
}

/// One entry of the search response hit list.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchHit {
    #[serde(rename = "_id")]
    pub id: Option<Loose>,
    #[serde(rename = "_source")]
    pub source: Option<RawListing>,
}

/// Nested listing document as returned by the search index.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawListing {
    pub agent: Option<Vec<RawAgent>>,
    pub address: Option<RawAddress>,
    pub number_of_bedrooms: Option<Loose>,
    pub number_of_rooms: Option<Loose>,
    pub object_type: Option<Loose>,
    pub energy_label: Option<Loose>,
    pub floor_area: Option<Loose>,
    pub plot_area: Option<Loose>,
    pub publish_date: Option<Loose>,
    pub object_detail_page_relative_url: Option<Loose>,
    pub status: Option<Loose>,
    pub price: Option<RawPrice>,
    pub placement_type: Option<Loose>,
    pub availability: Option<Loose>,
    pub amenities: Option<Loose>,
    pub construction_date_range: Option<RawRange>,
    pub construction_period: Option<Loose>,
    pub construction_type: Option<Loose>,
    pub handover_date_range: Option<RawRange>,
    pub offering_type: Option<Loose>,
    pub project: Option<RawProject>,
    pub sale_date_range: Option<RawRange>,
    pub selected_area: Option<Loose>,
    pub description: Option<RawDescription>,
    pub zoning: Option<Loose>,
    pub surrounding: Option<Loose>,
    pub exterior_space_garden_size: Option<Loose>,
    pub exterior_space_type: Option<Loose>,
    pub exterior_space_garden_orientation: Option<Loose>,
    pub garage_capacity: Option<Loose>,
    pub garage_type: Option<Loose>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawAgent {
    pub id: Option<Loose>,
    pub relative_url: Option<Loose>,
    pub name: Option<Loose>,
    pub association: Option<Loose>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawAddress {
    pub country: Option<Loose>,
    pub province: Option<Loose>,
    pub city: Option<Loose>,
    pub neighbourhood: Option<Loose>,
    pub municipality: Option<Loose>,
    pub house_number: Option<Loose>,
    pub house_number_suffix: Option<Loose>,
    pub postal_code: Option<Loose>,
    pub street_name: Option<Loose>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawPrice {
    pub selling_price: Option<Loose>,
    pub selling_price_type: Option<Loose>,
    pub selling_price_condition: Option<Loose>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawRange {
    pub gte: Option<Loose>,
    pub lte: Option<Loose>,
}

impl RawRange {
    /// `gte~lte`, either side empty when missing.
    pub fn render(&self) -> String {
        format!("{}~{}", text_of(self.gte.as_ref()), text_of(self.lte.as_ref()))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawProject {
    pub id: Option<Loose>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawDescription {
    pub dutch: Option<Loose>,
    pub tags: Option<Loose>,
}

/// View/save counters for one listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct ListingInsights {
    #[serde(rename = "nrOfViews", default)]
    pub nr_of_views: Option<i64>,
    #[serde(rename = "nrOfSaves", default)]
    pub nr_of_saves: Option<i64>,
}

impl ListingInsights {
    pub fn is_empty(&self) -> bool {
        self.nr_of_views.is_none() && self.nr_of_saves.is_none()
    }
}

/// Demographic and price statistics for one neighbourhood.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct NeighbourhoodInsights {
    #[serde(default)]
    pub inhabitants: Option<f64>,
    #[serde(rename = "averageAskingPricePerM2", default)]
    pub average_asking_price_per_m2: Option<f64>,
    #[serde(rename = "familiesWithChildren", default)]
    pub families_with_children: Option<f64>,
}

impl NeighbourhoodInsights {
    pub fn is_empty(&self) -> bool {
        self.inhabitants.is_none()
            && self.average_asking_price_per_m2.is_none()
            && self.families_with_children.is_none()
    }
}
