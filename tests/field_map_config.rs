// tests/field_map_config.rs
use census_tract_deid::address::config::{load_field_maps_default, load_field_maps_from, ENV_PATH};
use std::{env, fs};

#[test]
fn file_entries_extend_and_override_builtins() {
    let dir = tempfile::tempdir().unwrap();

    let p_toml = dir.path().join("field_maps.toml");
    fs::write(
        &p_toml,
        r#"
[KP.address]
street = "Addr1"
city = "City"
zipcode = "Zip"

[default.address]
street = "home_address"
"#,
    )
    .unwrap();
    let reg = load_field_maps_from(&p_toml).unwrap();
    assert_eq!(reg.get("kp").unwrap().address.zipcode.as_deref(), Some("Zip"));
    assert_eq!(
        reg.get("default").unwrap().address.street.as_deref(),
        Some("home_address")
    );
    // untouched built-in survives
    assert_eq!(reg.get("uw").unwrap().address.city.as_deref(), Some("City"));

    let p_json = dir.path().join("field_maps.json");
    fs::write(&p_json, r#"{"kp": {"address": {"street": "A", "city": "A"}}}"#).unwrap();
    let err = load_field_maps_from(&p_json).unwrap_err();
    assert!(format!("{err:#}").contains("kp"), "{err:#}");
}

#[serial_test::serial]
#[test]
fn default_uses_env_then_fallbacks() {
    // isolate CWD from the repo's own config/
    let old = env::current_dir().unwrap();
    let tmp = tempfile::tempdir().unwrap();
    env::set_current_dir(tmp.path()).unwrap();
    env::remove_var(ENV_PATH);

    // 1) nothing on disk -> built-ins
    let reg = load_field_maps_default().unwrap();
    assert_eq!(reg.names(), vec!["default", "sch", "uw"]);

    // 2) ./config/field_maps.toml
    let cfg_dir = tmp.path().join("config");
    fs::create_dir_all(&cfg_dir).unwrap();
    fs::write(cfg_dir.join("field_maps.toml"), "[toml_inst.address]\nstreet = \"S\"\n").unwrap();
    assert!(load_field_maps_default().unwrap().get("toml_inst").is_ok());

    // 3) env wins
    let p_env = tmp.path().join("elsewhere.json");
    fs::write(&p_env, r#"{"env_inst": {"address": {"street": "S"}}}"#).unwrap();
    env::set_var(ENV_PATH, &p_env);
    let reg = load_field_maps_default().unwrap();
    assert!(reg.get("env_inst").is_ok());
    assert!(reg.get("toml_inst").is_err());

    // 4) env pointing nowhere is an error, not a silent fallback
    env::set_var(ENV_PATH, tmp.path().join("missing.toml"));
    assert!(load_field_maps_default().is_err());

    env::remove_var(ENV_PATH);
    env::set_current_dir(old).unwrap();
}
