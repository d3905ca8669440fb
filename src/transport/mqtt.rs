//! MQTT connection management: connect, subscribe, dispatch inbound events,
//! publish outbound events, reconnect with bounded backoff.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{Client, Connection, Event, Incoming, MqttOptions};

use super::tls::{MqttEndpoint, TlsMaterials};
use crate::events::{EventSink, OutboundEvent, IMAGE_EVENT, VIOLATION_DETECT_EVENT};
use crate::ShutdownFlag;

pub const DEFAULT_TOPIC_PREFIX: &str = "roadwatch";
pub const STATUS_ONLINE: &str = "online";
pub const STATUS_OFFLINE: &str = "offline";

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(5);
const CHANNEL_CAPACITY: usize = 64;

/// Topic layout under a common prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topics {
    prefix: String,
}

impl Topics {
    pub fn new(prefix: &str) -> Self {
        let prefix = prefix.trim_matches('/');
        let prefix = if prefix.is_empty() {
            DEFAULT_TOPIC_PREFIX
        } else {
            prefix
        };
        Self {
            prefix: prefix.to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn event(&self, name: &str) -> String {
        format!("{}/{}", self.prefix, name)
    }

    pub fn status(&self) -> String {
        self.event("status")
    }

    /// Topics carrying inbound events.
    pub fn inbound(&self) -> [String; 2] {
        [self.event(IMAGE_EVENT), self.event(VIOLATION_DETECT_EVENT)]
    }

    /// Inbound event name for `topic`, if it is one we consume.
    pub fn inbound_event<'a>(&self, topic: &'a str) -> Option<&'a str> {
        let name = topic.strip_prefix(self.prefix.as_str())?.strip_prefix('/')?;
        match name {
            IMAGE_EVENT | VIOLATION_DETECT_EVENT => Some(name),
            _ => None,
        }
    }
}

/// Receives inbound events on the connection thread. Must not block.
pub trait InboundHandler: Send + Sync {
    fn handle(&self, event_name: &str, payload: &[u8]);
}

/// Doubling retry delay with jitter, capped.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_BACKOFF, MAX_BACKOFF)
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.min(max);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Next delay: the current step plus up to 20% jitter, never above `max`.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        let jitter = rand::thread_rng().gen_range(0.0..=0.2);
        base.mul_f64(1.0 + jitter).min(self.max)
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[derive(Clone, Debug)]
pub struct MqttSettings {
    pub endpoint: MqttEndpoint,
    pub tls: TlsMaterials,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topics: Topics,
    pub keep_alive: Duration,
    /// Upper bound on inbound packets; frames are large.
    pub max_packet_size: u32,
    pub poll_interval: Duration,
}

impl MqttSettings {
    pub fn new(endpoint: MqttEndpoint, client_id: impl Into<String>) -> Self {
        Self {
            endpoint,
            tls: TlsMaterials::default(),
            client_id: client_id.into(),
            username: None,
            password: None,
            topics: Topics::new(DEFAULT_TOPIC_PREFIX),
            keep_alive: Duration::from_secs(60),
            max_packet_size: 16 * 1024 * 1024,
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Publishes outbound events on whatever connection is currently live.
pub struct MqttEmitter {
    client: RwLock<Option<Client>>,
    topics: Topics,
}

impl MqttEmitter {
    pub fn new(topics: Topics) -> Self {
        Self {
            client: RwLock::new(None),
            topics,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.client.read().map(|c| c.is_some()).unwrap_or(false)
    }

    fn attach(&self, client: Client) {
        if let Ok(mut slot) = self.client.write() {
            *slot = Some(client);
        }
    }

    fn detach(&self) {
        if let Ok(mut slot) = self.client.write() {
            *slot = None;
        }
    }
}

impl EventSink for MqttEmitter {
    fn emit(&self, event: OutboundEvent) {
        let guard = match self.client.read() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        let Some(client) = guard.as_ref() else {
            log::debug!(
                "[camera {}] not connected, {} dropped",
                event.camera_id(),
                event.name()
            );
            return;
        };
        let payload = match event.to_json() {
            Ok(payload) => payload,
            Err(err) => {
                log::warn!("failed to encode {}: {:#}", event.name(), err);
                return;
            }
        };
        let topic = self.topics.event(event.name());
        if let Err(err) = client.try_publish(topic, QoS::AtMostOnce, false, payload) {
            log::debug!(
                "[camera {}] {} not published: {}",
                event.camera_id(),
                event.name(),
                err
            );
        }
    }
}

enum SessionEnd {
    Shutdown,
    Lost,
}

/// Owns the broker connection for the lifetime of the daemon.
pub struct ConnectionManager {
    settings: MqttSettings,
    emitter: Arc<MqttEmitter>,
}

impl ConnectionManager {
    pub fn new(settings: MqttSettings) -> Self {
        let emitter = Arc::new(MqttEmitter::new(settings.topics.clone()));
        Self { settings, emitter }
    }

    /// Sink handed to the pipelines.
    pub fn emitter(&self) -> Arc<MqttEmitter> {
        Arc::clone(&self.emitter)
    }

    /// Connect and serve until `shutdown` is set. Connection failures are
    /// retried forever; only invalid TLS settings return early.
    pub fn run(&self, handler: Arc<dyn InboundHandler>, shutdown: ShutdownFlag) -> Result<()> {
        let mut backoff = Backoff::default();
        while !shutdown.is_set() {
            let (client, connection) = self.connect()?;
            let end = self.session(&client, connection, handler.as_ref(), &shutdown, &mut backoff);
            self.emitter.detach();
            if let SessionEnd::Shutdown = end {
                let _ = client.try_publish(
                    self.settings.topics.status(),
                    QoS::AtLeastOnce,
                    true,
                    STATUS_OFFLINE.as_bytes().to_vec(),
                );
                let _ = client.try_disconnect();
                break;
            }

            let delay = backoff.next_delay();
            log::warn!("MQTT reconnecting in {:.1}s", delay.as_secs_f64());
            sleep_unless(delay, &shutdown);
        }
        log::info!("MQTT connection manager stopped");
        Ok(())
    }

    fn connect(&self) -> Result<(Client, Connection)> {
        let s = &self.settings;
        let mut options = MqttOptions::new(&s.client_id, &s.endpoint.host, s.endpoint.port);
        options.set_keep_alive(s.keep_alive);
        options.set_clean_start(true);
        options.set_max_packet_size(Some(s.max_packet_size));
        if let (Some(user), Some(pass)) = (&s.username, &s.password) {
            options.set_credentials(user, pass);
        }
        options.set_transport(
            s.tls
                .build_transport(&s.endpoint)
                .context("invalid MQTT TLS settings")?,
        );
        options.set_last_will(LastWill::new(
            s.topics.status(),
            STATUS_OFFLINE.as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
            None,
        ));
        Ok(Client::new(options, CHANNEL_CAPACITY))
    }

    fn session(
        &self,
        client: &Client,
        mut connection: Connection,
        handler: &dyn InboundHandler,
        shutdown: &ShutdownFlag,
        backoff: &mut Backoff,
    ) -> SessionEnd {
        let topics = &self.settings.topics;
        loop {
            if shutdown.is_set() {
                return SessionEnd::Shutdown;
            }
            match connection.recv_timeout(self.settings.poll_interval) {
                // nothing arrived this poll; loss surfaces as Ok(Err(_))
                Err(_) => continue,
                Ok(Err(err)) => {
                    log::error!("MQTT connection error: {}", err);
                    return SessionEnd::Lost;
                }
                Ok(Ok(Event::Incoming(Incoming::ConnAck(_)))) => {
                    backoff.reset();
                    for topic in topics.inbound() {
                        if let Err(err) = client.try_subscribe(topic.clone(), QoS::AtMostOnce) {
                            log::error!("MQTT subscribe to {} failed: {}", topic, err);
                            return SessionEnd::Lost;
                        }
                    }
                    if let Err(err) = client.try_publish(
                        topics.status(),
                        QoS::AtLeastOnce,
                        true,
                        STATUS_ONLINE.as_bytes().to_vec(),
                    ) {
                        log::warn!("MQTT status publish failed: {}", err);
                    }
                    self.emitter.attach(client.clone());
                    log::info!(
                        "MQTT connected to {} (prefix {})",
                        self.settings.endpoint,
                        topics.prefix()
                    );
                }
                Ok(Ok(Event::Incoming(Incoming::Publish(publish)))) => {
                    let topic = match std::str::from_utf8(&publish.topic) {
                        Ok(topic) => topic,
                        Err(_) => {
                            log::warn!("MQTT publish with non-UTF-8 topic ignored");
                            continue;
                        }
                    };
                    match topics.inbound_event(topic) {
                        Some(name) => handler.handle(name, &publish.payload),
                        None => log::debug!("ignoring publish on {}", topic),
                    }
                }
                Ok(Ok(_)) => {}
            }
        }
    }
}

fn sleep_unless(delay: Duration, shutdown: &ShutdownFlag) {
    let step = Duration::from_millis(100);
    let mut waited = Duration::ZERO;
    while waited < delay && !shutdown.is_set() {
        let nap = step.min(delay - waited);
        std::thread::sleep(nap);
        waited += nap;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ImageDimensions, TrafficLight};
    use crate::transport::parse_mqtt_endpoint;
    use std::time::Instant;

    struct Ignore;

    impl InboundHandler for Ignore {
        fn handle(&self, _event_name: &str, _payload: &[u8]) {}
    }

    fn unreachable_broker() -> ConnectionManager {
        // nothing listens on the discard port
        let endpoint = parse_mqtt_endpoint("127.0.0.1:9", false).unwrap();
        let mut settings = MqttSettings::new(endpoint, "roadwatch-test");
        settings.poll_interval = Duration::from_millis(20);
        ConnectionManager::new(settings)
    }

    #[test]
    fn topics_under_prefix() {
        let topics = Topics::new("city/cams/");
        assert_eq!(topics.event("car_detected"), "city/cams/car_detected");
        assert_eq!(topics.status(), "city/cams/status");
        assert_eq!(
            topics.inbound(),
            ["city/cams/image".to_string(), "city/cams/violation_detect".to_string()]
        );
        assert_eq!(Topics::new("").prefix(), DEFAULT_TOPIC_PREFIX);
    }

    #[test]
    fn inbound_event_matches_only_consumed_topics() {
        let topics = Topics::new("roadwatch");
        assert_eq!(topics.inbound_event("roadwatch/image"), Some("image"));
        assert_eq!(
            topics.inbound_event("roadwatch/violation_detect"),
            Some("violation_detect")
        );
        assert_eq!(topics.inbound_event("roadwatch/car_detected"), None);
        assert_eq!(topics.inbound_event("roadwatchx/image"), None);
        assert_eq!(topics.inbound_event("other/image"), None);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::default();
        let first = backoff.next_delay();
        assert!(first >= Duration::from_secs(1) && first <= Duration::from_millis(1200));
        let second = backoff.next_delay();
        assert!(second >= Duration::from_secs(2) && second <= Duration::from_millis(2400));
        for _ in 0..10 {
            assert!(backoff.next_delay() <= MAX_BACKOFF);
        }
        backoff.reset();
        assert!(backoff.next_delay() <= Duration::from_millis(1200));
    }

    #[test]
    fn emitter_drops_while_disconnected() {
        let emitter = MqttEmitter::new(Topics::new("roadwatch"));
        assert!(!emitter.is_connected());
        emitter.emit(OutboundEvent::TrafficLight(TrafficLight {
            camera_id: "cam".into(),
            image_id: None,
            traffic_status: "red".into(),
            detections: Vec::new(),
            inference_time: 0.0,
            image_dimensions: ImageDimensions { width: 1, height: 1 },
            created_at: None,
        }));
    }

    #[test]
    fn refused_connection_ends_the_session() {
        let manager = unreachable_broker();
        let (client, connection) = manager.connect().unwrap();
        let mut backoff = Backoff::default();
        let started = Instant::now();
        let end = manager.session(&client, connection, &Ignore, &ShutdownFlag::new(), &mut backoff);
        assert!(matches!(end, SessionEnd::Lost));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!manager.emitter().is_connected());
    }

    #[test]
    fn run_returns_once_shutdown_is_set() {
        let manager = Arc::new(unreachable_broker());
        let shutdown = ShutdownFlag::new();
        let runner = {
            let manager = Arc::clone(&manager);
            let shutdown = shutdown.clone();
            std::thread::spawn(move || manager.run(Arc::new(Ignore), shutdown))
        };
        std::thread::sleep(Duration::from_millis(200));
        shutdown.trigger();
        runner.join().unwrap().unwrap();
    }
}
