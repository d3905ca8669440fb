//! Broker transport: endpoint and TLS handling plus the MQTT connection
//! manager that feeds inbound events to the pipelines and publishes results.

pub mod mqtt;
mod tls;

pub use mqtt::{
    Backoff, ConnectionManager, InboundHandler, MqttEmitter, MqttSettings, Topics,
    DEFAULT_TOPIC_PREFIX,
};
pub use tls::{
    parse_mqtt_endpoint, validate_loopback_addr, MqttEndpoint, TlsMaterials, DEFAULT_MQTTS_PORT,
    DEFAULT_MQTT_PORT,
};
