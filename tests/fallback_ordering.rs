// tests/fallback_ordering.rs
use std::sync::Arc;

use serde_json::json;

use census_tract_deid::geocode::mock::ScriptedGeocoder;
use census_tract_deid::{normalize, AddressFieldMap, GeocodeResult, GeocodingGateway};

fn full_map() -> AddressFieldMap {
    AddressFieldMap {
        street: Some("l1".into()),
        street2: Some("l2".into()),
        secondary: Some("unit".into()),
        city: Some("city".into()),
        state: Some("st".into()),
        zipcode: Some("zip".into()),
    }
}

#[tokio::test]
async fn extraction_runs_once_with_fields_in_role_order() {
    let record = json!({
        "zip": "98144",
        "st": "wa",
        "city": "Seattle",
        "unit": "Apt B",
        "l2": null,
        "l1": "2718 14th Ave S"
    });
    let addr = normalize(record.as_object().unwrap(), &full_map()).unwrap();

    let svc = Arc::new(ScriptedGeocoder::new().with_extract(
        "2718 14TH AVE S, APT B, SEATTLE, WA, 98144",
        47.5796,
        -122.3148,
    ));
    let gw = GeocodingGateway::new(svc.clone());
    let out = gw.resolve(&addr).await.unwrap();

    assert_eq!(out.coordinate(), Some((47.5796, -122.3148)));
    assert_eq!(svc.street_calls(), 1);
    assert_eq!(
        svc.extract_texts(),
        vec!["2718 14TH AVE S, APT B, SEATTLE, WA, 98144".to_string()]
    );
}

#[tokio::test]
async fn structured_candidate_wins_over_extraction() {
    let record = json!({"l1": "1 Main St", "l2": "", "unit": "", "city": "x", "st": "y", "zip": "z"});
    let addr = normalize(record.as_object().unwrap(), &full_map()).unwrap();
    let svc = Arc::new(
        ScriptedGeocoder::new()
            .with_street("1 MAIN ST", 1.0, 2.0)
            .with_extract("1 MAIN ST, X, Y, Z", 3.0, 4.0),
    );
    let out = GeocodingGateway::new(svc.clone()).resolve(&addr).await.unwrap();
    assert_eq!(out.coordinate(), Some((1.0, 2.0)));
    assert_eq!(svc.extract_calls(), 0);
}

#[tokio::test]
async fn nothing_found_anywhere_is_unresolved() {
    let record = json!({"l1": "nowhere", "l2": "", "unit": "", "city": "", "st": "", "zip": ""});
    let addr = normalize(record.as_object().unwrap(), &full_map()).unwrap();
    let svc = Arc::new(ScriptedGeocoder::new());
    let out = GeocodingGateway::new(svc.clone()).resolve(&addr).await.unwrap();
    assert_eq!(out, GeocodeResult::Unresolved);
    assert_eq!((svc.street_calls(), svc.extract_calls()), (1, 1));
}
