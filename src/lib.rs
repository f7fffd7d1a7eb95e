//! `wrtc-mesh` keeps a small full-mesh WebRTC room together: every participant holds a direct
//! [webrtc](https://webrtc.rs) peer connection with every other one, and negotiation payloads
//! travel through a WebSocket relay.
//! - Joins, leaves and negotiation signals coming from the relay drive one peer session per
//!   remote participant.
//! - Failed sessions are recreated after a delay, up to a bounded number of times in a row.
//! - Camera, microphone and screen sharing are swapped on all live connections at once, without
//!   renegotiation.
//! - Everything the UI needs is published as a single ordered stream of [Notification]s.
//!
//! Capture devices are not touched by this crate. Embedding application provides them through
//! the [MediaSource] trait and writes encoded samples into returned [LocalTrack]s.
//!
//! # Examples
//!
//! ```rust,no_run
//! use wrtc_mesh::{Error, LocalStream, LocalTrack, MediaConstraints, MediaSource, Notification, Room, RoomConfig};
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct Camera;
//!
//! #[async_trait]
//! impl MediaSource for Camera {
//!     async fn acquire(&self, _constraints: &MediaConstraints) -> Result<LocalStream, Error> {
//!         // samples are written into these tracks by the capture pipeline
//!         Ok(LocalStream {
//!             id: "camera".into(),
//!             audio: Some(LocalTrack::audio("mic", "camera")),
//!             video: Some(LocalTrack::video("cam", "camera")),
//!         })
//!     }
//!
//!     async fn acquire_screen(&self) -> Result<LocalStream, Error> {
//!         Err(Error::UserCancelled)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let config = RoomConfig::from_json(r#"{
//!         "relay_url": "wss://relay.example.com/ws",
//!         "room_id": "standup",
//!         "user_id": "alice",
//!         "user_name": "Alice"
//!     }"#)?;
//!     let (room, mut notifications) = Room::connect(config, Arc::new(Camera))?;
//!
//!     while let Some(notification) = notifications.next().await {
//!         match notification {
//!             Notification::RemoteStreamAvailable { user_id, track } => {
//!                 // hand `track.rtp()` over to a decoder
//!                 println!("{} sends {:?}", user_id, track.kind);
//!             }
//!             Notification::RosterChanged(members) => println!("{} participants", members.len()),
//!             Notification::LocalMedia(state) => println!("local media: {:?}", state),
//!             Notification::Failure(report) => eprintln!("{}", report),
//!             Notification::Closed => return Ok(()),
//!         }
//!     }
//!
//!     room.leave().await
//! }
//! ```

pub mod config;
pub mod error;
mod event;
mod manager;
pub mod media;
pub mod notification;
pub mod peer_connection;
pub mod protocol;
pub mod room;
pub mod session;
pub mod signaling;
mod supervisor;
#[cfg(test)]
mod testing;

pub use config::{MediaConstraints, Options, ReconnectPolicy, RecoveryPolicy, RejoinPolicy, RoomConfig};
pub use error::{Error, FailureKind, FailureReport};
pub use media::{LocalMediaSnapshot, LocalStream, LocalTrack, MediaSource, RemoteTrack, TrackKind};
pub use notification::{Member, Notification, Notifications};
pub use peer_connection::{PeerConnection, WebRtcConnector};
pub use protocol::{Signal, SignalingMessage, UserId};
pub use room::{Room, RoomHandle};
pub use session::{Connection, Connector, Role, SessionEvents, SessionState};
pub use signaling::{RelayEvent, RelayEvents, RoomIdentity, SignalingClient, SignalingSender};
