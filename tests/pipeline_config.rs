use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use roadwatch::config::{PipelineConfig, DEFAULT_VEHICLE_LABELS};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "ROADWATCH_CONFIG",
        "ROADWATCH_CONFIDENCE",
        "ROADWATCH_LABELS",
        "ROADWATCH_LINE_POSITION",
        "ROADWATCH_QUEUE_CAPACITY",
        "ROADWATCH_TRACKING",
        "ROADWATCH_IDLE_TIMEOUT_SECS",
        "ROADWATCH_PLATES",
        "ROADWATCH_TRAFFIC_LIGHTS",
        "ROADWATCH_PLATE_PATTERN",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn defaults_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = PipelineConfig::load().expect("load defaults");
    assert_eq!(cfg.camera.confidence, 0.5);
    assert_eq!(cfg.camera.line_position, 0.5);
    assert_eq!(cfg.camera.queue_capacity, 10);
    assert!(cfg.camera.tracking);
    assert_eq!(cfg.camera.labels, DEFAULT_VEHICLE_LABELS);
    assert!(cfg.plates.enabled);
    assert_eq!(cfg.plates.queue_capacity, 5);
    assert!(!cfg.traffic_lights.enabled);
    assert_eq!(cfg.idle_timeout, Duration::ZERO);
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "camera": {
            "confidence": 0.6,
            "labels": ["Car", "truck", "car"],
            "line_position": 0.7,
            "queue_capacity": 4,
            "max_tracks": 8
        },
        "plates": { "enabled": false, "confidence": 0.25 },
        "idle_timeout_secs": 30
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("ROADWATCH_CONFIG", file.path());
    std::env::set_var("ROADWATCH_LINE_POSITION", "0.4");
    std::env::set_var("ROADWATCH_TRAFFIC_LIGHTS", "true");

    let cfg = PipelineConfig::load().expect("load config");

    assert_eq!(cfg.camera.confidence, 0.6);
    assert_eq!(cfg.camera.labels, vec!["car", "truck"]);
    assert_eq!(cfg.camera.line_position, 0.4);
    assert_eq!(cfg.camera.queue_capacity, 4);
    assert_eq!(cfg.camera.limits.max_tracks, 8);
    assert!(!cfg.plates.enabled);
    assert_eq!(cfg.plates.confidence, 0.25);
    assert!(cfg.traffic_lights.enabled);
    assert_eq!(cfg.idle_timeout.as_secs(), 30);

    clear_env();
}

#[test]
fn toml_file_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new().suffix(".toml").tempfile().expect("temp config");
    let toml = r#"
idle_timeout_secs = 120

[camera]
tracking = false
labels = ["bus"]

[traffic_lights]
enabled = true
confidence = 0.55
"#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");

    let cfg = PipelineConfig::load_from(Some(file.path())).expect("load toml");
    assert!(!cfg.camera.tracking);
    assert_eq!(cfg.camera.labels, vec!["bus"]);
    assert!(cfg.traffic_lights.enabled);
    assert_eq!(cfg.traffic_lights.confidence, 0.55);
    assert_eq!(cfg.idle_timeout, Duration::from_secs(120));
}

#[test]
fn env_overrides_are_validated() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("ROADWATCH_CONFIDENCE", "1.5");
    assert!(PipelineConfig::load().is_err());
    clear_env();

    std::env::set_var("ROADWATCH_QUEUE_CAPACITY", "0");
    assert!(PipelineConfig::load().is_err());
    clear_env();

    std::env::set_var("ROADWATCH_TRACKING", "maybe");
    assert!(PipelineConfig::load().is_err());
    clear_env();

    std::env::set_var("ROADWATCH_PLATE_PATTERN", "([unclosed");
    assert!(PipelineConfig::load().is_err());
    clear_env();

    std::env::set_var("ROADWATCH_LABELS", "Car, BUS ,");
    let cfg = PipelineConfig::load().expect("labels override");
    assert_eq!(cfg.camera.labels, vec!["car", "bus"]);
    clear_env();
}

#[test]
fn missing_file_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("ROADWATCH_CONFIG", "/nonexistent/roadwatch.json");
    assert!(PipelineConfig::load().is_err());
    clear_env();
}
