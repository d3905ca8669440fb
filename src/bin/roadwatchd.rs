//! roadwatchd - consume camera frames over MQTT, count vehicles crossing a
//! line, read license plates on violations and publish the results.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use roadwatch::detect::{BackendRegistry, StubBackend};
use roadwatch::transport::{
    parse_mqtt_endpoint, validate_loopback_addr, ConnectionManager, InboundHandler, MqttSettings,
    TlsMaterials, Topics,
};
use roadwatch::{EventSink, PipelineConfig, ServiceContext, ShutdownFlag};

const DAEMON_NAME: &str = "roadwatchd";
const EVICTION_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(author, version, about = "Real-time vehicle counting and plate recognition")]
struct Args {
    /// MQTT broker address. Only loopback brokers are accepted unless
    /// --allow-remote-mqtt is set.
    #[arg(long, env = "MQTT_BROKER_ADDR", default_value = "127.0.0.1:1883")]
    mqtt_broker_addr: String,

    /// Allow non-loopback MQTT connections.
    #[arg(long, env = "ALLOW_REMOTE_MQTT")]
    allow_remote_mqtt: bool,

    #[arg(long, env = "MQTT_USERNAME")]
    mqtt_username: Option<String>,

    #[arg(long, env = "MQTT_PASSWORD")]
    mqtt_password: Option<String>,

    /// Enable TLS for MQTT (implied by mqtts:// addresses).
    #[arg(long, env = "MQTT_USE_TLS")]
    mqtt_use_tls: bool,

    /// Path to a PEM-encoded CA certificate to trust for MQTT TLS.
    #[arg(long, env = "MQTT_TLS_CA_PATH")]
    mqtt_tls_ca_path: Option<PathBuf>,

    /// Path to a PEM-encoded client certificate for MQTT TLS.
    #[arg(long, env = "MQTT_TLS_CLIENT_CERT_PATH")]
    mqtt_tls_client_cert_path: Option<PathBuf>,

    /// Path to a PEM-encoded client private key for MQTT TLS.
    #[arg(long, env = "MQTT_TLS_CLIENT_KEY_PATH")]
    mqtt_tls_client_key_path: Option<PathBuf>,

    #[arg(long, env = "MQTT_CLIENT_ID", default_value = DAEMON_NAME)]
    mqtt_client_id: String,

    /// Prefix for every topic consumed and published.
    #[arg(long, env = "MQTT_TOPIC_PREFIX", default_value = "roadwatch")]
    topic_prefix: String,

    /// Pipeline config file (JSON, or TOML by extension). Overrides
    /// ROADWATCH_CONFIG.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Detection service URL, or "stub" to run without a detector.
    #[arg(long, env = "DETECTOR_URL", default_value = "stub")]
    detector_url: String,

    /// Separate service for plate regions and characters.
    #[arg(long, env = "PLATE_DETECTOR_URL")]
    plate_detector_url: Option<String>,
}

fn build_registry(args: &Args) -> Result<BackendRegistry> {
    let mut registry = BackendRegistry::new();
    if args.detector_url == "stub" {
        log::warn!("no detector configured; frames will produce no detections");
        registry.register(StubBackend::new());
        return Ok(registry);
    }
    register_http(&mut registry, args)?;
    Ok(registry)
}

#[cfg(feature = "backend-http")]
fn register_http(registry: &mut BackendRegistry, args: &Args) -> Result<()> {
    use roadwatch::detect::backends::HttpBackend;
    use roadwatch::detect::DetectionCapability;

    let all = [
        DetectionCapability::Vehicle,
        DetectionCapability::TrafficLight,
        DetectionCapability::PlateRegion,
        DetectionCapability::PlateCharacter,
    ];
    registry.register_as("detector", HttpBackend::new(&args.detector_url, &all));
    registry.set_default("detector")?;
    if let Some(url) = &args.plate_detector_url {
        let plate = [
            DetectionCapability::PlateRegion,
            DetectionCapability::PlateCharacter,
        ];
        registry.register_as("plates", HttpBackend::new(url, &plate));
        registry.assign(DetectionCapability::PlateRegion, "plates")?;
        registry.assign(DetectionCapability::PlateCharacter, "plates")?;
    }
    Ok(())
}

#[cfg(not(feature = "backend-http"))]
fn register_http(_registry: &mut BackendRegistry, args: &Args) -> Result<()> {
    Err(anyhow!(
        "detector url {} requires the backend-http feature",
        args.detector_url
    ))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mqtt_endpoint = parse_mqtt_endpoint(&args.mqtt_broker_addr, args.mqtt_use_tls)?;
    let tls = TlsMaterials::load(
        args.mqtt_tls_ca_path.as_deref(),
        args.mqtt_tls_client_cert_path.as_deref(),
        args.mqtt_tls_client_key_path.as_deref(),
    )?;
    if !args.allow_remote_mqtt {
        validate_loopback_addr(&mqtt_endpoint, &args.mqtt_broker_addr)?;
    } else {
        log::warn!("Remote MQTT enabled - ensure broker is in a trusted network");
    }

    let config = match &args.config {
        Some(path) => PipelineConfig::load_from(Some(path.as_path()))?,
        None => PipelineConfig::load()?,
    };
    let detectors = build_registry(&args)?;

    log::info!("{} starting", DAEMON_NAME);
    log::info!("  MQTT broker: {}", mqtt_endpoint);
    log::info!("  Topic prefix: {}", args.topic_prefix);
    log::info!("  Detectors: {}", detectors.list().join(", "));
    log::info!("  Labels: {}", config.camera.labels.join(", "));
    log::info!("  Confidence: {}", config.camera.confidence);
    log::info!("  Line position: {}", config.camera.line_position);
    log::info!("  Tracking: {}", config.camera.tracking);
    log::info!("  Plates: {}", config.plates.enabled);
    log::info!("  Traffic lights: {}", config.traffic_lights.enabled);

    let mut settings = MqttSettings::new(mqtt_endpoint, &args.mqtt_client_id);
    settings.tls = tls;
    settings.username = args.mqtt_username.clone();
    settings.password = args.mqtt_password.clone();
    settings.topics = Topics::new(&args.topic_prefix);
    let connection = ConnectionManager::new(settings);

    let shutdown = ShutdownFlag::new();
    let sink: Arc<dyn EventSink> = connection.emitter();
    let service = Arc::new(ServiceContext::new(
        config,
        detectors,
        sink,
        shutdown.clone(),
    )?);

    let signal = shutdown.clone();
    ctrlc::set_handler(move || {
        log::info!("shutdown signal received");
        signal.trigger();
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let handler: Arc<dyn InboundHandler> = service.clone();
    let conn_shutdown = shutdown.clone();
    let conn_thread = std::thread::Builder::new()
        .name("mqtt".to_string())
        .spawn(move || {
            let result = connection.run(handler, conn_shutdown.clone());
            conn_shutdown.trigger();
            result
        })?;

    while !shutdown.is_set() {
        std::thread::sleep(EVICTION_INTERVAL);
        match service.evict_idle() {
            Ok(evicted) if !evicted.is_empty() => {
                log::info!("evicted idle cameras: {}", evicted.join(", "))
            }
            Ok(_) => {}
            Err(err) => log::error!("idle eviction failed: {:#}", err),
        }
    }

    log::info!("stopping pipelines...");
    service.shutdown()?;
    conn_thread
        .join()
        .map_err(|_| anyhow!("mqtt thread panicked"))??;
    log::info!("{} stopped", DAEMON_NAME);
    Ok(())
}
