//! In-memory stand-ins for the peer transport and capture devices.

use crate::config::{MediaConstraints, RecoveryPolicy};
use crate::error::Error;
use crate::event::Event;
use crate::manager::{SessionFailure, SessionManager};
use crate::media::{LocalMedia, LocalStream, LocalTrack, MediaSource, TrackKind};
use crate::notification::{Notifications, Notifier};
use crate::protocol::{Signal, SignalingMessage, UserId};
use crate::session::{Connection, Connector, Role, SessionEvents};
use crate::signaling::{RoomIdentity, SignalingSender};
use crate::supervisor::RecoverySupervisor;
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

pub(crate) fn camera_stream(id: &str) -> LocalStream {
    LocalStream {
        id: id.into(),
        audio: Some(LocalTrack::audio(&format!("{id}-audio"), id)),
        video: Some(LocalTrack::video(&format!("{id}-video"), id)),
    }
}

pub(crate) fn screen_stream(id: &str) -> LocalStream {
    LocalStream {
        id: id.into(),
        audio: None,
        video: Some(LocalTrack::video(&format!("{id}-screen"), id)),
    }
}

pub(crate) struct MockConnection {
    pub role: Role,
    pub events: SessionEvents,
    kinds: Mutex<HashSet<TrackKind>>,
    tracks: Mutex<Vec<LocalTrack>>,
    applied: Mutex<Vec<Signal>>,
    replaced: Mutex<Vec<LocalTrack>>,
    closes: AtomicUsize,
}

impl MockConnection {
    pub fn user_id(&self) -> &UserId {
        self.events.user_id()
    }

    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.kinds.lock().unwrap().contains(&kind)
    }

    pub fn tracks(&self) -> Vec<LocalTrack> {
        self.tracks.lock().unwrap().clone()
    }

    pub fn applied(&self) -> Vec<Signal> {
        self.applied.lock().unwrap().clone()
    }

    pub fn replaced(&self) -> Vec<LocalTrack> {
        self.replaced.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Track currently sent for given kind: last replacement or the one it was seeded with.
    pub fn outgoing(&self, kind: TrackKind) -> Option<LocalTrack> {
        let replaced = self.replaced.lock().unwrap();
        if let Some(track) = replaced.iter().rev().find(|t| t.kind() == kind) {
            return Some(track.clone());
        }
        let tracks = self.tracks.lock().unwrap();
        tracks.iter().rev().find(|t| t.kind() == kind).cloned()
    }
}

struct MockHandle(Arc<MockConnection>);

impl Connection for MockHandle {
    fn apply_signal(&self, signal: Signal) {
        self.0.applied.lock().unwrap().push(signal);
    }

    fn add_tracks(&self, tracks: Vec<LocalTrack>) {
        let mut kinds = self.0.kinds.lock().unwrap();
        for track in tracks.iter() {
            kinds.insert(track.kind());
        }
        self.0.tracks.lock().unwrap().extend(tracks);
    }

    fn has_sender(&self, kind: TrackKind) -> bool {
        self.0.has_kind(kind)
    }

    fn replace_track(&self, track: LocalTrack) {
        self.0.replaced.lock().unwrap().push(track);
    }

    fn close(&self) {
        self.0.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Clone, Default)]
pub(crate) struct MockConnector {
    connections: Arc<Mutex<Vec<Arc<MockConnection>>>>,
}

impl MockConnector {
    pub fn count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<Arc<MockConnection>> {
        self.connections.lock().unwrap().last().cloned()
    }

    pub fn for_user(&self, user_id: &str) -> Vec<Arc<MockConnection>> {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.user_id().as_str() == user_id)
            .cloned()
            .collect()
    }
}

impl Connector for MockConnector {
    fn connect(&self, role: Role, tracks: Vec<LocalTrack>, events: SessionEvents) -> Box<dyn Connection> {
        let kinds = tracks.iter().map(|t| t.kind()).collect();
        let conn = Arc::new(MockConnection {
            role,
            events,
            kinds: Mutex::new(kinds),
            tracks: Mutex::new(tracks),
            applied: Mutex::new(Vec::new()),
            replaced: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        });
        self.connections.lock().unwrap().push(conn.clone());
        Box::new(MockHandle(conn))
    }
}

/// Media source returning preconfigured results. Once the screen queue runs dry, screen capture
/// is reported as cancelled.
pub(crate) struct MockMediaSource {
    camera: Mutex<Option<Result<LocalStream, Error>>>,
    screens: Mutex<VecDeque<Result<LocalStream, Error>>>,
}

impl MockMediaSource {
    pub fn new(camera: Result<LocalStream, Error>) -> Self {
        MockMediaSource {
            camera: Mutex::new(Some(camera)),
            screens: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_screen(self, screen: Result<LocalStream, Error>) -> Self {
        self.screens.lock().unwrap().push_back(screen);
        self
    }
}

#[async_trait]
impl MediaSource for MockMediaSource {
    async fn acquire(&self, _constraints: &MediaConstraints) -> Result<LocalStream, Error> {
        self.camera
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| Err(Error::MediaAccessDenied("camera already taken".into())))
    }

    async fn acquire_screen(&self) -> Result<LocalStream, Error> {
        self.screens
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(Error::UserCancelled))
    }
}

/// Session manager wired to mocks, with every queue it writes into exposed for inspection.
pub(crate) struct Harness {
    pub connector: MockConnector,
    pub manager: SessionManager,
    pub media: LocalMedia,
    pub outbox: UnboundedReceiver<SignalingMessage>,
    pub notifications: Notifications,
    policy: RecoveryPolicy,
    notifier: Notifier,
    events_tx: UnboundedSender<Event>,
    events: UnboundedReceiver<Event>,
    timers: VecDeque<Event>,
}

impl Harness {
    pub fn new(max_consecutive_failures: u32) -> Self {
        let connector = MockConnector::default();
        let (outbox_tx, outbox) = unbounded_channel();
        let identity = RoomIdentity {
            room_id: "room".into(),
            user_id: "me".into(),
            user_name: "Me".into(),
        };
        let (events_tx, events) = unbounded_channel();
        let (notifier, notifications) = Notifier::new();
        let manager = SessionManager::new(
            Arc::new(connector.clone()),
            SignalingSender::new(identity, outbox_tx),
            events_tx.clone(),
            notifier.clone(),
        );
        Harness {
            connector,
            manager,
            media: LocalMedia::new(),
            outbox,
            notifications,
            policy: RecoveryPolicy {
                max_consecutive_failures,
                retry_delay_ms: 2000,
            },
            notifier,
            events_tx,
            events,
            timers: VecDeque::new(),
        }
    }

    pub fn local_user(&self) -> UserId {
        UserId::from("me")
    }

    pub fn supervisor(&self) -> RecoverySupervisor {
        self.supervisor_with_join_delay(Duration::ZERO)
    }

    pub fn supervisor_with_join_delay(&self, join_delay: Duration) -> RecoverySupervisor {
        RecoverySupervisor::new(
            self.policy.clone(),
            join_delay,
            self.events_tx.clone(),
            self.notifier.clone(),
        )
    }

    /// Feeds every queued session callback to the manager. Other events are set aside for
    /// [Harness::next_timer].
    pub fn pump(&mut self) -> Vec<SessionFailure> {
        let mut failures = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            match event {
                Event::Session(e) => failures.extend(self.manager.on_session_event(e)),
                other => self.timers.push_back(other),
            }
        }
        failures
    }

    pub fn next_timer(&mut self) -> Option<Event> {
        self.pump();
        self.timers.pop_front()
    }
}
