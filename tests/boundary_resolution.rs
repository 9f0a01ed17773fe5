// tests/boundary_resolution.rs
use census_tract_deid::boundary::{query_point, BoundaryIndex};
use census_tract_deid::PipelineError;
use std::path::PathBuf;

fn fixture() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/seattle_tracts.geojson")
}

fn index() -> BoundaryIndex {
    BoundaryIndex::load(fixture()).expect("fixture loads")
}

#[test]
fn loads_every_feature_in_file_order() {
    let idx = index();
    let ids: Vec<&str> = idx.tracts().iter().map(|t| t.geoid()).collect();
    assert_eq!(
        ids,
        vec!["53033009000", "53033008500", "53033009100", "53033010001", "53033007900"]
    );
    let first = &idx.tracts()[0];
    assert_eq!(first.state_fips(), Some("53"));
    assert_eq!(first.county_fips(), Some("033"));
}

#[test]
fn point_strictly_inside_one_tract() {
    assert_eq!(index().resolve(47.5796, -122.3148), Some("53033009000"));
}

#[test]
fn longitude_is_x_and_latitude_is_y() {
    let p = query_point(47.6, -122.3);
    assert_eq!((p.x(), p.y()), (-122.3, 47.6));

    let idx = index();
    assert_eq!(idx.resolve(47.6, -122.3), Some("53033007900"));
    // swapped arguments land nowhere near Washington
    assert_eq!(idx.resolve(-122.3, 47.6), None);
}

#[test]
fn overlap_resolves_to_first_feature() {
    assert_eq!(index().resolve(47.585, -122.315), Some("53033009000"));
}

#[test]
fn multipolygon_members_and_holes() {
    let idx = index();
    assert_eq!(idx.resolve(47.505, -122.38), Some("53033010001"));
    assert_eq!(idx.resolve(47.505, -122.345), Some("53033010001"));
    // inside the hole
    assert_eq!(idx.resolve(47.52, -122.38), None);
}

#[test]
fn outside_every_tract_is_absent() {
    assert_eq!(index().resolve(45.0, -120.0), None);
}

#[test]
fn missing_file_is_a_boundary_load_error() {
    let err = BoundaryIndex::load("does/not/exist.geojson").unwrap_err();
    assert!(matches!(err, PipelineError::BoundaryLoad { .. }));
    assert!(err.to_string().contains("does/not/exist.geojson"));
}
