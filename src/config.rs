use std::env;
use std::time::Duration;

const DEFAULT_MAX_BITRATE: u32 = 1_000_000;
const BITRATE_FLOOR: u32 = 50_000;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub ws_port: u16,
    pub debug_port: u16,
    /// Maximum per-peer sending bitrate in bits per second.
    pub max_bitrate: u32,
    /// Lower bound the bitrate policy never goes below.
    pub min_bitrate: u32,
    /// Decay factor applied per additional sending peer.
    pub bitrate_factor: f64,
    /// Codec names the room is capable of negotiating.
    pub media_codecs: Vec<String>,
    /// How long to wait after a disconnect before checking room emptiness.
    pub room_grace_period: Duration,
    /// Application-level timeout for outbound requests.
    pub request_timeout: Duration,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let max_bitrate = env::var("MAX_BITRATE")
            .unwrap_or_else(|_| DEFAULT_MAX_BITRATE.to_string())
            .parse()
            .unwrap_or(DEFAULT_MAX_BITRATE);

        Self {
            ws_port: env::var("WS_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .unwrap_or(8080),
            debug_port: env::var("DEBUG_PORT")
                .unwrap_or_else(|_| "8081".to_string())
                .parse()
                .unwrap_or(8081),
            max_bitrate,
            min_bitrate: BITRATE_FLOOR.min(max_bitrate),
            bitrate_factor: env::var("BITRATE_FACTOR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.75),
            media_codecs: env::var("MEDIA_CODECS")
                .unwrap_or_else(|_| "opus,VP8,H264".to_string())
                .split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
            room_grace_period: Duration::from_secs(
                env::var("ROOM_GRACE_SECS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
            ),
            request_timeout: Duration::from_secs(
                env::var("REQUEST_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .unwrap_or(10),
            ),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_port: 8080,
            debug_port: 8081,
            max_bitrate: DEFAULT_MAX_BITRATE,
            min_bitrate: BITRATE_FLOOR.min(DEFAULT_MAX_BITRATE),
            bitrate_factor: 0.75,
            media_codecs: vec!["opus".to_string(), "VP8".to_string(), "H264".to_string()],
            room_grace_period: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
        }
    }
}
