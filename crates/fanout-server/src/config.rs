use std::str::FromStr;
use std::time::Duration;

use fanout_media::VideoCodec;

use crate::sfu::OverflowPolicy;

#[derive(Clone, Debug)]
pub struct Config {
    /// WebSocket URL of the signaling service
    pub signal_url: String,
    /// Identity this relay registers with on the signaling service
    pub node_id: String,
    /// Codec forced on every session; `None` keeps the VP9 default
    pub codec: Option<VideoCodec>,
    /// REMB target in kbps
    pub bitrate_kbps: u32,
    /// Local slot tracks per endpoint
    pub slot_capacity: usize,
    pub forwarder_queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub failed_grace: Duration,
    /// Interval of the periodic stats log
    pub sync_interval: Duration,
    pub reconnect_delay: Duration,
    pub turn_url: Option<String>,
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<TurnServer>,
}

#[derive(Clone, Debug)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signal_url: "ws://127.0.0.1:8080/signal".to_string(),
            node_id: "fanout".to_string(),
            codec: None,
            bitrate_kbps: 500,
            slot_capacity: 1,
            forwarder_queue_capacity: 1000,
            overflow_policy: OverflowPolicy::DropNewest,
            failed_grace: Duration::from_secs(10),
            sync_interval: Duration::from_secs(15),
            reconnect_delay: Duration::from_secs(3),
            turn_url: None,
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: vec![],
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let defaults = Config::default();

        let codec = match non_empty("CODEC_TYPE") {
            Some(name) => Some(name.parse::<VideoCodec>()?),
            None => None,
        };

        let overflow_policy = match non_empty("FORWARDER_OVERFLOW") {
            Some(policy) => policy.parse()?,
            None => defaults.overflow_policy,
        };

        let stun_servers = non_empty("STUN_SERVERS")
            .map(|s| s.split(',').map(|url| url.trim().to_string()).collect())
            .unwrap_or(defaults.stun_servers);

        let turn_servers = non_empty("TURN_SERVERS")
            .map(|s| parse_turn_servers(&s))
            .unwrap_or_default();

        if codec.is_none() {
            tracing::info!("CODEC_TYPE not set, defaulting to VP9");
        }

        Ok(Config {
            signal_url: non_empty("SIGNAL_URL").unwrap_or(defaults.signal_url),
            node_id: non_empty("NODE_ID").unwrap_or(defaults.node_id),
            codec,
            bitrate_kbps: parsed("BIT_RATE", defaults.bitrate_kbps),
            slot_capacity: parsed("NUMBER_TRACK", defaults.slot_capacity).max(1),
            forwarder_queue_capacity: parsed(
                "FORWARDER_QUEUE_CAPACITY",
                defaults.forwarder_queue_capacity,
            )
            .max(1),
            overflow_policy,
            failed_grace: Duration::from_secs(parsed("FAILED_GRACE_SECS", 10)),
            sync_interval: Duration::from_secs(parsed("SYNC_INTERVAL", 15).max(1)),
            reconnect_delay: Duration::from_secs(parsed("SIGNAL_RECONNECT_SECS", 3)),
            turn_url: non_empty("TURN_URL"),
            stun_servers,
            turn_servers,
        })
    }
}

/// Parse `url|user|credential` entries separated by commas
fn parse_turn_servers(raw: &str) -> Vec<TurnServer> {
    raw.split(',')
        .filter_map(|entry| {
            let mut parts = entry.trim().splitn(3, '|');
            Some(TurnServer {
                url: parts.next()?.to_string(),
                username: parts.next()?.to_string(),
                credential: parts.next()?.to_string(),
            })
        })
        .collect()
}

fn non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T: FromStr + Copy>(key: &str, default: T) -> T {
    match non_empty(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring invalid {}={}", key, raw);
            default
        }),
        None => default,
    }
}
