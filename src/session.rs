use crate::error::Error;
use crate::event::Event;
use crate::media::{LocalTrack, RemoteTrack, TrackKind};
use crate::protocol::{Signal, UserId};
use std::fmt::Formatter;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

/// Side of the negotiation a session plays. Fixed for the whole life of a session.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Role {
    /// Produces the first offer. Taken by the participant which observed the other one joining.
    Initiator,
    /// Answers offers. Taken on the first signal coming from an unknown participant.
    Responder,
}

impl Role {
    pub fn is_initiator(&self) -> bool {
        *self == Role::Initiator
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SessionState {
    Negotiating,
    Connected,
    Failed,
    Closed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Closed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Negotiating => "negotiating",
            SessionState::Connected => "connected",
            SessionState::Failed => "failed",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Capability used to create peer transports. The default implementation is
/// [WebRtcConnector](crate::peer_connection::WebRtcConnector).
pub trait Connector: Send + Sync {
    /// Allocates a new connection seeded with given outgoing `tracks`. Everything the connection
    /// wants to report must go through `events`.
    ///
    /// This method must not block: any asynchronous setup should happen in the background, with
    /// calls made on the returned handle queued in order until it's done.
    fn connect(&self, role: Role, tracks: Vec<LocalTrack>, events: SessionEvents) -> Box<dyn Connection>;
}

/// Handle to a single peer transport, exclusively owned by its [PeerSession].
pub trait Connection: Send {
    /// Feeds negotiation payload received from the remote peer.
    fn apply_signal(&self, signal: Signal);

    /// Starts sending additional tracks.
    fn add_tracks(&self, tracks: Vec<LocalTrack>);

    /// Checks if the connection already sends (or was asked to send) a track of given kind.
    fn has_sender(&self, kind: TrackKind) -> bool;

    /// Swaps the track sent by the sender of the same kind, without renegotiation.
    fn replace_track(&self, track: LocalTrack);

    /// Releases the transport. Called exactly once.
    fn close(&self);
}

#[derive(Debug)]
pub struct SessionEvent {
    pub user_id: UserId,
    pub generation: u64,
    pub kind: SessionEventKind,
}

#[derive(Debug)]
pub enum SessionEventKind {
    /// Negotiation payload which should be forwarded to the remote peer.
    Signal(Signal),
    RemoteTrack(RemoteTrack),
    Connected,
    Failed(Error),
    Closed,
}

/// Sink for everything a connection handle reports about itself. Every event is stamped with
/// the session it belongs to. Once the session is destroyed the sink is detached and all further
/// events are silently dropped.
#[derive(Clone)]
pub struct SessionEvents {
    user_id: UserId,
    generation: u64,
    sink: UnboundedSender<Event>,
    detached: CancellationToken,
}

impl SessionEvents {
    pub(crate) fn new(
        user_id: UserId,
        generation: u64,
        sink: UnboundedSender<Event>,
        detached: CancellationToken,
    ) -> Self {
        SessionEvents {
            user_id,
            generation,
            sink,
            detached,
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn signal(&self, signal: Signal) -> bool {
        self.emit(SessionEventKind::Signal(signal))
    }

    pub fn remote_track(&self, track: RemoteTrack) -> bool {
        self.emit(SessionEventKind::RemoteTrack(track))
    }

    pub fn connected(&self) -> bool {
        self.emit(SessionEventKind::Connected)
    }

    pub fn failed(&self, cause: Error) -> bool {
        self.emit(SessionEventKind::Failed(cause))
    }

    pub fn closed(&self) -> bool {
        self.emit(SessionEventKind::Closed)
    }

    pub fn is_detached(&self) -> bool {
        self.detached.is_cancelled()
    }

    /// Completes once the owning session has been destroyed.
    pub async fn detached(&self) {
        self.detached.cancelled().await
    }

    fn emit(&self, kind: SessionEventKind) -> bool {
        if self.detached.is_cancelled() {
            return false;
        }
        let event = SessionEvent {
            user_id: self.user_id.clone(),
            generation: self.generation,
            kind,
        };
        self.sink.send(Event::Session(event)).is_ok()
    }
}

/// Connection with a single remote participant.
///
/// Sessions never come back from a terminal state: recovery always means a new session with
/// a new generation installed under the same user id.
pub struct PeerSession {
    user_id: UserId,
    role: Role,
    state: SessionState,
    generation: u64,
    retry_count: u32,
    connection: Option<Box<dyn Connection>>,
    detached: CancellationToken,
    failure: Option<Error>,
}

impl PeerSession {
    pub(crate) fn create(
        user_id: UserId,
        role: Role,
        generation: u64,
        retry_count: u32,
        tracks: Vec<LocalTrack>,
        connector: &dyn Connector,
        sink: UnboundedSender<Event>,
    ) -> Self {
        let detached = CancellationToken::new();
        let events = SessionEvents::new(user_id.clone(), generation, sink, detached.clone());
        let connection = connector.connect(role, tracks, events);
        PeerSession {
            user_id,
            role,
            state: SessionState::Negotiating,
            generation,
            retry_count,
            connection: Some(connection),
            detached,
            failure: None,
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of failure-triggered recreations which led to this session.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn failure(&self) -> Option<&Error> {
        self.failure.as_ref()
    }

    pub fn is_live(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Feeds a negotiation payload received from the remote peer.
    pub fn apply_inbound(&self, payload: Signal) -> Result<(), Error> {
        match &self.connection {
            Some(connection) if self.is_live() => {
                connection.apply_signal(payload);
                Ok(())
            }
            _ => Err(Error::InvalidSignal(self.state)),
        }
    }

    /// Swaps the outgoing track of the same kind. Returns `false` (and does nothing) when the
    /// connection has no sender of that kind yet: it will pick tracks up during negotiation.
    pub fn replace_outgoing_track(&self, track: &LocalTrack) -> bool {
        match &self.connection {
            Some(connection) if self.is_live() && connection.has_sender(track.kind()) => {
                connection.replace_track(track.clone());
                true
            }
            _ => false,
        }
    }

    /// Adds tracks of kinds the connection doesn't send yet. Used when local media becomes
    /// available after the session was created.
    pub fn attach_tracks(&self, tracks: &[LocalTrack]) -> usize {
        let connection = match &self.connection {
            Some(connection) if self.is_live() => connection,
            _ => return 0,
        };
        let missing: Vec<_> = tracks
            .iter()
            .filter(|t| !connection.has_sender(t.kind()))
            .cloned()
            .collect();
        let count = missing.len();
        if count > 0 {
            connection.add_tracks(missing);
        }
        count
    }

    pub(crate) fn on_connected(&mut self) -> bool {
        if self.state == SessionState::Negotiating {
            self.state = SessionState::Connected;
            self.retry_count = 0;
            true
        } else {
            false
        }
    }

    /// Moves a live session into failed state. The connection handle is kept until the session
    /// is either recreated or abandoned.
    pub(crate) fn on_failed(&mut self, cause: Error) -> bool {
        if self.is_live() {
            self.state = SessionState::Failed;
            self.failure = Some(cause);
            true
        } else {
            false
        }
    }

    /// Releases the connection handle and detaches its callbacks. Idempotent.
    pub fn destroy(&mut self) {
        self.detached.cancel();
        if let Some(connection) = self.connection.take() {
            log::debug!(
                "releasing connection to {} (generation {})",
                self.user_id,
                self.generation
            );
            connection.close();
        }
        if self.state != SessionState::Failed {
            self.state = SessionState::Closed;
        }
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("user_id", &self.user_id)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("retry_count", &self.retry_count)
            .finish()
    }
}
