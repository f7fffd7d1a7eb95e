use crate::error::Error;
use crate::protocol::UserId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;

const DEFAULT_STUN_SERVERS: [&str; 5] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
    "stun:stun4.l.google.com:19302",
];

/// Complete configuration of a single room participant.
///
/// Every field has a default, so a configuration file only needs to mention what differs, ie.
/// ```json
/// { "relay_url": "wss://relay.example.com/ws", "room_id": "standup", "user_id": "u-1" }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomConfig {
    /// WebSocket URL of the signaling relay.
    pub relay_url: String,
    pub room_id: String,
    /// Identifier under which the relay knows this participant.
    pub user_id: UserId,
    pub user_name: String,
    /// STUN/TURN urls passed to every peer connection.
    pub ice_servers: Vec<String>,
    pub media: MediaConstraints,
    pub reconnect: ReconnectPolicy,
    pub recovery: RecoveryPolicy,
    /// Delay between observing a `joined` notification and creating the initiator session.
    /// Zero creates the session right away.
    pub join_delay_ms: u64,
    pub rejoin: RejoinPolicy,
}

impl RoomConfig {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let config: RoomConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e).into()))?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.relay_url.is_empty() {
            return Err(Error::Config("relay_url is required".into()));
        }
        if self.room_id.is_empty() {
            return Err(Error::Config("room_id is required".into()));
        }
        if self.user_id.as_str().is_empty() {
            return Err(Error::Config("user_id is required".into()));
        }
        if self.recovery.max_consecutive_failures == 0 {
            return Err(Error::Config(
                "recovery.max_consecutive_failures must be at least 1".into(),
            ));
        }
        if self.recovery.retry_delay_ms == 0 {
            return Err(Error::Config("recovery.retry_delay_ms must be positive".into()));
        }
        if self.reconnect.initial_delay_ms == 0 {
            return Err(Error::Config(
                "reconnect.initial_delay_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn join_delay(&self) -> Duration {
        Duration::from_millis(self.join_delay_ms)
    }

    /// Peer connection options derived from this configuration.
    pub fn options(&self) -> Options {
        Options::with_ice_servers(&self.ice_servers)
    }
}

impl Default for RoomConfig {
    fn default() -> Self {
        RoomConfig {
            relay_url: String::new(),
            room_id: String::new(),
            user_id: UserId::from(""),
            user_name: String::new(),
            ice_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            media: MediaConstraints::default(),
            reconnect: ReconnectPolicy::default(),
            recovery: RecoveryPolicy::default(),
            join_delay_ms: 0,
            rejoin: RejoinPolicy::default(),
        }
    }
}

/// Constraints passed to the local media source when acquiring camera and microphone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
    pub width: u32,
    pub height: u32,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        MediaConstraints {
            audio: true,
            video: true,
            width: 1280,
            height: 720,
        }
    }
}

/// Relay reconnection schedule: exponential backoff capped at `max_delay_ms`, giving up after
/// `max_attempts` consecutive failed attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl ReconnectPolicy {
    /// Delay before the n-th (1-based) reconnection attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.initial_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            max_attempts: 10,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
        }
    }
}

/// Failure driven peer session recreation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryPolicy {
    /// Number of failures in a row after which a peer is no longer recreated automatically.
    pub max_consecutive_failures: u32,
    /// Fixed delay between a failure and the recreation of the session.
    pub retry_delay_ms: u64,
}

impl RecoveryPolicy {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        RecoveryPolicy {
            max_consecutive_failures: 3,
            retry_delay_ms: 2_000,
        }
    }
}

/// What happens to existing peer sessions once the relay connection is re-established.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejoinPolicy {
    /// Peer connections may still be alive even though the relay dropped: keep them.
    #[default]
    KeepSessions,
    /// Tear down every session, remote peers will initiate again.
    DiscardSessions,
}

/// Options used to construct every peer connection.
#[derive(Clone)]
pub struct Options {
    pub rtc_config: RTCConfiguration,
}

impl Options {
    pub fn with_ice_servers<S: AsRef<str>>(urls: &[S]) -> Self {
        let ice_servers = if urls.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: urls.iter().map(|url| url.as_ref().to_owned()).collect(),
                ..Default::default()
            }]
        };
        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        Options { rtc_config }
    }
}

impl Default for Options {
    fn default() -> Self {
        Options::with_ice_servers(&DEFAULT_STUN_SERVERS)
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("ice_servers", &self.rtc_config.ice_servers.len())
            .finish()
    }
}
