//! Engine behavior driven by a configuration file

mod common;

use common::*;
use std::io::Write;
use tierjit::{Engine, EngineConfig, Error};

fn engine_from(json: &str) -> tierjit::Result<Engine> {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();
    Engine::new(EngineConfig::from_file(file.path())?)
}

#[test]
fn test_threshold_from_file() {
    let mut engine = engine_from(r#"{ "tier_up_threshold": 2 }"#).unwrap();
    let add = engine.define(add_chunk()).unwrap();
    engine.call(add, nums(&[1.0, 2.0])).unwrap();
    assert!(!engine.is_optimized(add));
    engine.call(add, nums(&[1.0, 2.0])).unwrap();
    assert!(engine.is_optimized(add));
}

#[test]
fn test_call_depth_from_file() {
    let mut engine = engine_from(r#"{ "max_call_depth": 1 }"#).unwrap();
    let add = engine.define(add_chunk()).unwrap();
    assert_eq!(engine.call(add, nums(&[1.0, 2.0])).unwrap(), num(3.0));
}

#[test]
fn test_invalid_file_rejected() {
    let err = engine_from(r#"{ "max_polymorphism": 2, "max_optimizable_polymorphism": 3 }"#)
        .err()
        .unwrap();
    assert!(matches!(err, Error::Config(_)));
    assert!(matches!(engine_from("not json").err().unwrap(), Error::Config(_)));
}

#[test]
fn test_config_round_trips_through_json() {
    let config = EngineConfig::default()
        .with_tier_up_threshold(9)
        .with_concurrent_compilation(true);
    let json = serde_json::to_string(&config).unwrap();
    assert_eq!(EngineConfig::from_json_str(&json).unwrap(), config);
}
