use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use funda_adapters::{
    build_search_request, flatten_page, parse_search_page, ClientIdentity, FundaEndpoints,
    InsightsCacheConfig, InsightsFetcher, OfferingType, PublicationDate, RadiusKm,
};
use funda_core::{ColumnValue, FlatListingRecord};
use funda_storage::{row_id, FetchError, FetchedResponse, HttpTransport, OutboundRequest};

fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .join("fixtures")
        .join("funda")
}

fn read_fixture(name: &str) -> String {
    std::fs::read_to_string(fixtures_dir().join(name)).expect("read fixture")
}

/// Serves the insights fixtures and records every URL requested.
#[derive(Default)]
struct FixtureTransport {
    urls: Mutex<Vec<String>>,
}

#[async_trait]
impl HttpTransport for FixtureTransport {
    async fn send(&self, request: OutboundRequest) -> Result<FetchedResponse, FetchError> {
        self.urls.lock().unwrap().push(request.url.clone());
        let name = if request.url.contains("/objectinsights/") {
            "listing_insights.json"
        } else {
            "neighbourhood_insights.json"
        };
        Ok(FetchedResponse {
            status: 200,
            final_url: request.url,
            body: read_fixture(name).into_bytes(),
        })
    }
}

async fn flatten_fixture(name: &str, enrich: bool) -> (Vec<FlatListingRecord>, Arc<FixtureTransport>) {
    let transport = Arc::new(FixtureTransport::default());
    let mut insights = InsightsFetcher::new(
        transport.clone(),
        FundaEndpoints::default(),
        ClientIdentity::default(),
        InsightsCacheConfig::default(),
    );
    let response: serde_json::Value = serde_json::from_str(&read_fixture(name)).unwrap();
    let page = parse_search_page(&response).unwrap();
    let outcome = flatten_page(&page.hits, enrich, &mut insights).await;
    assert!(outcome.skipped.is_empty(), "{:?}", outcome.skipped);
    (outcome.records, transport)
}

#[tokio::test]
async fn sample_listing_flattens_to_a_complete_row() {
    let (records, transport) = flatten_fixture("search_response.json", true).await;
    assert_eq!(records.len(), 1);
    let record = &records[0];

    assert_eq!(record.listing_id, "6965113");
    assert_eq!(record.agent_id, "24581");
    assert_eq!(record.agent_association, "NVM");
    assert_eq!(record.address_postal_code, "1055EP");
    assert_eq!(record.address_house_number_suffix, "-I");
    assert_eq!(record.price, Some(375000));
    assert_eq!(record.price_condition, "kosten_koper");
    assert_eq!(record.publish_date, "2023-11-27T15:50:30.3700000");
    assert_eq!(record.handover_date_range, "2024-01-01~2024-03-31");
    assert_eq!(record.listing_nr_of_views, Some(150));
    assert_eq!(record.listing_nr_of_saves, Some(25));
    assert_eq!(record.neighbourhood_inhabitants, Some(50000));
    assert_eq!(record.neighbourhood_avg_askingprice_m2, Some(8500));

    // Every column except the search descriptor is populated by the sample.
    for (name, value) in record.columns() {
        if name == "search_query" {
            continue;
        }
        let populated = match &value {
            ColumnValue::Text(v) | ColumnValue::Timestamp(v) => !v.is_empty(),
            ColumnValue::Integer(v) => v.is_some(),
            ColumnValue::Real(v) => v.is_some(),
        };
        assert!(populated, "column {name} is empty");
    }

    let urls = transport.urls.lock().unwrap().clone();
    assert_eq!(
        urls,
        vec![
            "https://marketinsights.funda.io/v2/LocalInsights/preview/Amsterdam/Landlust".to_string(),
            "https://marketinsights.funda.io/v1/objectinsights/6965113".to_string(),
        ]
    );
}

#[tokio::test]
async fn row_identity_follows_content_and_query() {
    let (mut first, _) = flatten_fixture("search_response.json", false).await;
    let (second, _) = flatten_fixture("search_response.json", false).await;
    assert_eq!(row_id(&first[0]), row_id(&second[0]));

    let request = build_search_request(
        1055,
        RadiusKm::Five,
        PublicationDate::Last30Days,
        OfferingType::Buy,
        0,
        100,
    )
    .unwrap();
    first[0].search_query = request.descriptor();
    assert_eq!(first[0].search_query, "1055~5~now-30d");
    assert_ne!(row_id(&first[0]), row_id(&second[0]));
}

#[tokio::test]
async fn empty_result_page_has_no_records() {
    let response: serde_json::Value =
        serde_json::from_str(&read_fixture("empty_response.json")).unwrap();
    let page = parse_search_page(&response).unwrap();
    assert_eq!(page.total, 0);
    assert!(page.hits.is_empty());

    let (records, transport) = flatten_fixture("empty_response.json", true).await;
    assert!(records.is_empty());
    assert!(transport.urls.lock().unwrap().is_empty());
}
