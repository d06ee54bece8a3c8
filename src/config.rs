use anyhow::{anyhow, bail, Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

use crate::telemetry::DEFAULT_MEASUREMENT_NAME;

const DEFAULT_BATCH_SIZE: usize = 500;
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 1000;
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 200;
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 5000;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 10_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TlsMode {
    Disabled,
    /// Verify the broker certificate against the platform roots.
    Strict,
    /// Accept any broker certificate. Opt-in only.
    Insecure,
}

#[derive(Clone, Debug)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub tls: TlsMode,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topics: Vec<String>,
    pub client_id: String,
    pub keepalive_secs: u64,
}

impl MqttConfig {
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }
}

#[derive(Clone, Debug)]
pub struct InfluxConfig {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
    pub measurement: String,
    pub timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct SinkConfig {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub max_queue: usize,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl SinkConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            max_queue: DEFAULT_BATCH_SIZE * 10,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            retry_max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Absent when no broker host is configured; only live mode needs it.
    pub mqtt: Option<MqttConfig>,
    pub influx: InfluxConfig,
    pub sink: SinkConfig,
    pub shutdown_timeout_ms: u64,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let vars = Vars { lookup: &lookup };

        let mqtt = match vars.optional("INGEST_MQTT_HOST") {
            Some(host) => Some(load_mqtt(&vars, host)?),
            None => None,
        };

        let influx = InfluxConfig {
            url: vars
                .optional("INGEST_INFLUX_URL")
                .unwrap_or_else(|| "http://localhost:8086".to_string()),
            token: vars.required("INGEST_INFLUX_TOKEN")?,
            org: vars.required("INGEST_INFLUX_ORG")?,
            bucket: vars.required("INGEST_INFLUX_BUCKET")?,
            measurement: vars
                .optional("INGEST_INFLUX_MEASUREMENT")
                .unwrap_or_else(|| DEFAULT_MEASUREMENT_NAME.to_string()),
            timeout: Duration::from_millis(vars.parse("INGEST_INFLUX_TIMEOUT_MS", 10_000u64)?),
        };

        let batch_size = vars.parse("INGEST_BATCH_SIZE", DEFAULT_BATCH_SIZE)?;
        let sink = SinkConfig {
            batch_size,
            flush_interval_ms: vars.parse("INGEST_FLUSH_INTERVAL_MS", DEFAULT_FLUSH_INTERVAL_MS)?,
            max_queue: vars.parse("INGEST_MAX_QUEUE", batch_size.saturating_mul(10))?,
            max_attempts: vars.parse("INGEST_MAX_RETRY_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?,
            retry_base_delay_ms: vars
                .parse("INGEST_RETRY_BASE_DELAY_MS", DEFAULT_RETRY_BASE_DELAY_MS)?,
            retry_max_delay_ms: vars.parse("INGEST_RETRY_MAX_DELAY_MS", DEFAULT_RETRY_MAX_DELAY_MS)?,
        };
        if sink.batch_size == 0 {
            bail!("INGEST_BATCH_SIZE must be at least 1");
        }
        if sink.max_queue == 0 {
            bail!("INGEST_MAX_QUEUE must be at least 1");
        }
        if sink.max_attempts == 0 {
            bail!("INGEST_MAX_RETRY_ATTEMPTS must be at least 1");
        }

        Ok(Self {
            mqtt,
            influx,
            sink,
            shutdown_timeout_ms: vars
                .parse("INGEST_SHUTDOWN_TIMEOUT_MS", DEFAULT_SHUTDOWN_TIMEOUT_MS)?,
            otlp_endpoint: vars.optional("OTEL_EXPORTER_OTLP_ENDPOINT"),
        })
    }

    pub fn mqtt(&self) -> Result<&MqttConfig> {
        self.mqtt
            .as_ref()
            .ok_or_else(|| anyhow!("INGEST_MQTT_HOST is required for live ingestion"))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

fn load_mqtt(vars: &Vars<'_>, host: String) -> Result<MqttConfig> {
    let tls_enabled = vars.flag("INGEST_MQTT_TLS", true)?;
    let tls = match (tls_enabled, vars.flag("INGEST_MQTT_TLS_INSECURE", false)?) {
        (false, _) => TlsMode::Disabled,
        (true, false) => TlsMode::Strict,
        (true, true) => TlsMode::Insecure,
    };
    let port = vars.parse("INGEST_MQTT_PORT", if tls_enabled { 8883u16 } else { 1883 })?;

    let username = vars.optional("INGEST_MQTT_USERNAME");
    let password = vars.optional("INGEST_MQTT_PASSWORD");

    let topics = match vars.optional("INGEST_MQTT_TOPICS") {
        Some(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|topic| !topic.is_empty())
            .map(str::to_string)
            .collect(),
        None => {
            let username = username.as_deref().context(
                "INGEST_MQTT_TOPICS or INGEST_MQTT_USERNAME is required to choose the uplink topic",
            )?;
            vec![uplink_topic(username, vars.optional("INGEST_MQTT_TENANT").as_deref())]
        }
    };
    if topics.is_empty() {
        bail!("INGEST_MQTT_TOPICS does not contain any topic filter");
    }

    Ok(MqttConfig {
        host,
        port,
        tls,
        username,
        password,
        topics,
        client_id: vars
            .optional("INGEST_MQTT_CLIENT_ID")
            .unwrap_or_else(|| format!("lorawan-ingest-{}", uuid::Uuid::new_v4().simple())),
        keepalive_secs: vars.parse("INGEST_MQTT_KEEPALIVE_SECS", 30u64)?,
    })
}

/// Uplink topic of a The Things Stack v3 application.
pub fn uplink_topic(application: &str, tenant: Option<&str>) -> String {
    match tenant {
        Some(tenant) if !application.contains('@') => {
            format!("v3/{application}@{tenant}/devices/+/up")
        }
        _ => format!("v3/{application}/devices/+/up"),
    }
}

struct Vars<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Vars<'_> {
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn required(&self, key: &str) -> Result<String> {
        self.optional(key)
            .ok_or_else(|| anyhow!("missing env var {key}"))
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: std::str::FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match self.optional(key) {
            Some(value) => value
                .parse::<T>()
                .with_context(|| format!("invalid {key}: {value:?}")),
            None => Ok(default),
        }
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool> {
        match self.optional(key) {
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => bail!("invalid {key}: {value:?} (expected true/false)"),
            },
            None => Ok(default),
        }
    }
}
