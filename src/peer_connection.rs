use crate::config::Options;
use crate::error::Error;
use crate::media::{LocalTrack, RemoteTrack, TrackKind};
use crate::protocol::Signal;
use crate::session::{Connection, Connector, Role, SessionEvents};
use arc_swap::{ArcSwap, Guard};
use log::{debug, trace, warn};
use std::collections::{HashMap, HashSet};
use std::fmt::Formatter;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

/// [Connector] creating [PeerConnection]s backed by webrtc-rs.
#[derive(Debug, Clone, Default)]
pub struct WebRtcConnector {
    options: Options,
}

impl WebRtcConnector {
    pub fn new(options: Options) -> Self {
        WebRtcConnector { options }
    }
}

impl Connector for WebRtcConnector {
    fn connect(&self, role: Role, tracks: Vec<LocalTrack>, events: SessionEvents) -> Box<dyn Connection> {
        Box::new(PeerConnection::start(role, tracks, self.options.clone(), events))
    }
}

/// WebRTC peer connection with simplified access patterns.
///
/// The underlying `RTCPeerConnection` lives in a background task. All calls made on this handle
/// are queued and executed by that task in order, so they can be made before the connection
/// has even been created.
pub struct PeerConnection {
    role: Role,
    status: PeerConnectionState,
    senders: Mutex<HashSet<TrackKind>>,
    commands: UnboundedSender<Command>,
}

impl PeerConnection {
    /// Starts a new instance of [PeerConnection]. Negotiation payloads, remote tracks and state
    /// changes are reported through `events`. The connection is closed once [Connection::close]
    /// is called or the session owning `events` is destroyed.
    pub fn start(role: Role, tracks: Vec<LocalTrack>, options: Options, events: SessionEvents) -> Self {
        let (commands, receiver) = unbounded_channel();
        let status = PeerConnectionState::default();
        let senders = tracks.iter().map(|t| t.kind()).collect();
        tokio::spawn(drive(role, tracks, options, events, status.clone(), receiver));
        PeerConnection {
            role,
            status,
            senders: Mutex::new(senders),
            commands,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_connected(&self) -> bool {
        matches!(&**self.status.get(), InnerState::Connected)
    }

    pub fn is_closed(&self) -> bool {
        self.status.get().is_closed()
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            trace!("peer connection driver is gone, command dropped");
        }
    }
}

impl Connection for PeerConnection {
    fn apply_signal(&self, signal: Signal) {
        self.send(Command::Signal(signal));
    }

    fn add_tracks(&self, tracks: Vec<LocalTrack>) {
        if let Ok(mut senders) = self.senders.lock() {
            senders.extend(tracks.iter().map(|t| t.kind()));
        }
        self.send(Command::AddTracks(tracks));
    }

    fn has_sender(&self, kind: TrackKind) -> bool {
        match self.senders.lock() {
            Ok(senders) => senders.contains(&kind),
            Err(_) => false,
        }
    }

    fn replace_track(&self, track: LocalTrack) {
        self.send(Command::ReplaceTrack(track));
    }

    fn close(&self) {
        self.send(Command::Close);
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("role", &self.role)
            .field("status", &**self.status.get())
            .finish()
    }
}

enum Command {
    Signal(Signal),
    AddTracks(Vec<LocalTrack>),
    ReplaceTrack(LocalTrack),
    Close,
}

async fn drive(
    role: Role,
    tracks: Vec<LocalTrack>,
    options: Options,
    events: SessionEvents,
    status: PeerConnectionState,
    mut commands: UnboundedReceiver<Command>,
) {
    let pc = match open(role, options, &events, &status).await {
        Ok(pc) => pc,
        Err(cause) => {
            if status.set_failed() {
                events.failed(cause);
            }
            return;
        }
    };
    let mut link = Link {
        pc,
        role,
        senders: HashMap::new(),
        pending_candidates: Vec::new(),
    };
    if let Err(cause) = link.seed(tracks).await {
        if status.set_failed() {
            events.failed(cause);
        }
    }

    loop {
        let command = tokio::select! {
            _ = events.detached() => Command::Close,
            command = commands.recv() => command.unwrap_or(Command::Close),
        };
        let result = match command {
            Command::Signal(signal) => link.apply_signal(signal, &events).await,
            Command::AddTracks(tracks) => link.add_tracks(tracks).await,
            Command::ReplaceTrack(track) => link.replace_track(track).await,
            Command::Close => break,
        };
        if let Err(cause) = result {
            warn!("peer connection to {} failed: {}", events.user_id(), cause);
            if status.set_failed() {
                events.failed(cause);
            }
        }
    }

    status.set_closed();
    if let Err(e) = link.pc.close().await {
        warn!("failed to close peer connection to {}: {}", events.user_id(), e);
    }
    debug!("peer connection to {} closed", events.user_id());
}

async fn open(
    role: Role,
    options: Options,
    events: &SessionEvents,
    status: &PeerConnectionState,
) -> Result<Arc<RTCPeerConnection>, Error> {
    // Create a MediaEngine object to configure the supported codec
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    // Interceptors provide NACKs, RTCP reports etc. Each peer connection needs its own registry.
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let peer_connection = Arc::new(api.new_peer_connection(options.rtc_config).await?);

    {
        let status = status.clone();
        let events = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(move |s| {
            match s {
                RTCPeerConnectionState::Connected => {
                    if status.set_connected() {
                        events.connected();
                    }
                }
                RTCPeerConnectionState::Failed => {
                    if status.set_failed() {
                        events.failed(webrtc::Error::ErrConnectionClosed.into());
                    }
                }
                RTCPeerConnectionState::Closed => {
                    if status.set_closed() {
                        events.closed();
                    }
                }
                RTCPeerConnectionState::Disconnected => {}
                RTCPeerConnectionState::Unspecified => {}
                RTCPeerConnectionState::New => {}
                RTCPeerConnectionState::Connecting => {}
            }
            Box::pin(async move {})
        }));
    }
    {
        let status = status.clone();
        let events = events.clone();
        peer_connection.on_ice_connection_state_change(Box::new(move |s| {
            if s == RTCIceConnectionState::Failed && status.set_failed() {
                events.failed(webrtc::Error::ErrICEConnectionNotStarted.into());
            }
            Box::pin(async move {})
        }));
    }
    {
        let events = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate| {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => {
                        events.signal(Signal::Candidate(init));
                    }
                    Err(e) => warn!("failed to serialize ICE candidate: {}", e),
                }
            } else {
                // ICE gathering complete
            }
            Box::pin(async move {})
        }));
    }
    {
        let status = status.clone();
        let events = events.clone();
        let pc = Arc::downgrade(&peer_connection);
        peer_connection.on_negotiation_needed(Box::new(move || {
            let status = status.clone();
            let events = events.clone();
            let pc = pc.clone();
            Box::pin(async move {
                match renegotiate(&pc, role).await {
                    Ok(Some(signal)) => {
                        events.signal(signal);
                    }
                    Ok(None) => {}
                    Err(cause) => {
                        if status.set_failed() {
                            events.failed(cause);
                        }
                    }
                }
            })
        }));
    }
    {
        let events = events.clone();
        peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            debug!(
                "remote {:?} track {} from {}",
                track.kind(),
                track.id(),
                events.user_id()
            );
            events.remote_track(RemoteTrack::from_rtp(track));
            Box::pin(async move {})
        }));
    }

    Ok(peer_connection)
}

/// Called whenever local transceivers changed. Initiator produces a new offer, responder asks
/// the initiator to do so, unless the very first offer is still on its way.
async fn renegotiate(pc: &Weak<RTCPeerConnection>, role: Role) -> Result<Option<Signal>, Error> {
    let pc = match pc.upgrade() {
        Some(pc) => pc,
        None => return Ok(None),
    };
    match role {
        Role::Initiator => {
            let offer = pc.create_offer(None).await?;
            pc.set_local_description(offer.clone()).await?;
            Ok(Some(Signal::Sdp(offer)))
        }
        Role::Responder => {
            if pc.remote_description().await.is_some() {
                Ok(Some(Signal::Renegotiate))
            } else {
                Ok(None)
            }
        }
    }
}

/// State owned exclusively by the driver task.
struct Link {
    pc: Arc<RTCPeerConnection>,
    role: Role,
    senders: HashMap<TrackKind, Arc<RTCRtpSender>>,
    pending_candidates: Vec<RTCIceCandidateInit>,
}

impl Link {
    /// Attaches initial tracks. Initiator also declares interest in receiving media kinds it
    /// has nothing to send for, so that its offer covers them.
    async fn seed(&mut self, tracks: Vec<LocalTrack>) -> Result<(), Error> {
        self.add_tracks(tracks).await?;
        if self.role.is_initiator() {
            for kind in [TrackKind::Audio, TrackKind::Video] {
                if !self.senders.contains_key(&kind) {
                    let init = RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    };
                    self.pc.add_transceiver_from_kind(kind.into(), Some(init)).await?;
                }
            }
        }
        Ok(())
    }

    async fn add_tracks(&mut self, tracks: Vec<LocalTrack>) -> Result<(), Error> {
        for track in tracks {
            if self.senders.contains_key(&track.kind()) {
                continue;
            }
            let sender = self.pc.add_track(track.rtp()).await?;
            // RTCP packets must be read for interceptors (NACK, reports) to work
            let rtcp = sender.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while rtcp.read(&mut buf).await.is_ok() {}
            });
            self.senders.insert(track.kind(), sender);
        }
        Ok(())
    }

    async fn replace_track(&mut self, track: LocalTrack) -> Result<(), Error> {
        match self.senders.get(&track.kind()) {
            Some(sender) => {
                sender.replace_track(Some(track.rtp())).await?;
                debug!("outgoing {:?} track replaced with {}", track.kind(), track.id());
            }
            None => debug!("no {:?} sender, track {} not replaced", track.kind(), track.id()),
        }
        Ok(())
    }

    /// Apply [Signal]s received from the remote peer.
    async fn apply_signal(&mut self, signal: Signal, events: &SessionEvents) -> Result<(), Error> {
        match signal {
            Signal::Renegotiate => {
                if self.role.is_initiator() && self.pc.signaling_state() == RTCSignalingState::Stable
                {
                    let offer = self.pc.create_offer(None).await?;
                    self.pc.set_local_description(offer.clone()).await?;
                    events.signal(Signal::Sdp(offer));
                }
            }
            Signal::Candidate(candidate) => {
                if self.pc.remote_description().await.is_some() {
                    if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                        warn!("failed to add ICE candidate from {}: {}", events.user_id(), e);
                    }
                } else {
                    self.pending_candidates.push(candidate);
                }
            }
            Signal::Sdp(sdp) => {
                let is_offer = sdp.sdp_type == RTCSdpType::Offer;
                self.pc.set_remote_description(sdp).await?;
                if is_offer {
                    let answer = self.pc.create_answer(None).await?;
                    self.pc.set_local_description(answer.clone()).await?;
                    events.signal(Signal::Sdp(answer));
                }
                for candidate in self.pending_candidates.drain(..) {
                    if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                        warn!("failed to add ICE candidate from {}: {}", events.user_id(), e);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Connection status shared between the handle and webrtc callbacks. Each transition is
/// reported at most once, and nothing is reported after the connection got closed.
#[repr(transparent)]
#[derive(Debug, Clone)]
struct PeerConnectionState(Arc<ArcSwap<InnerState>>);

impl PeerConnectionState {
    fn get(&self) -> Guard<Arc<InnerState>> {
        self.0.load()
    }

    fn set_connected(&self) -> bool {
        self.update(InnerState::Connected)
    }

    fn set_failed(&self) -> bool {
        self.update(InnerState::Closed { failed: true })
    }

    fn set_closed(&self) -> bool {
        self.update(InnerState::Closed { failed: false })
    }

    fn update(&self, new_state: InnerState) -> bool {
        let new_state = Arc::new(new_state);
        let old = self.0.rcu(|old| {
            if old.accepts(&new_state) {
                new_state.clone()
            } else {
                old.clone()
            }
        });
        old.accepts(&new_state)
    }
}

impl Default for PeerConnectionState {
    fn default() -> Self {
        PeerConnectionState(Arc::new(ArcSwap::from_pointee(InnerState::Connecting)))
    }
}

#[derive(Debug)]
enum InnerState {
    Connecting,
    Connected,
    Closed { failed: bool },
}

impl InnerState {
    fn is_closed(&self) -> bool {
        matches!(self, InnerState::Closed { .. })
    }

    fn accepts(&self, next: &InnerState) -> bool {
        match (self, next) {
            (InnerState::Closed { .. }, _) => false,
            (InnerState::Connecting, InnerState::Connecting) => false,
            (InnerState::Connected, InnerState::Connected) => false,
            (InnerState::Connected, InnerState::Connecting) => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod test {
    use crate::config::Options;
    use crate::event::Event;
    use crate::media::LocalTrack;
    use crate::peer_connection::{InnerState, PeerConnectionState, WebRtcConnector};
    use crate::session::{Connection, Connector, Role, SessionEventKind, SessionEvents};
    use std::time::Duration;
    use tokio::sync::mpsc::unbounded_channel;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn status_transitions_are_reported_once() {
        let status = PeerConnectionState::default();
        assert!(status.set_connected());
        assert!(!status.set_connected());
        assert!(status.set_failed());
        assert!(!status.set_closed());
        assert!(!status.set_connected());
        assert!(matches!(&**status.get(), InnerState::Closed { failed: true }));
    }

    #[tokio::test]
    async fn connection_negotiation() {
        let connector = WebRtcConnector::new(Options::with_ice_servers::<&str>(&[]));
        let (tx1, mut rx1) = unbounded_channel();
        let (tx2, mut rx2) = unbounded_channel();
        let p1 = connector.connect(
            Role::Initiator,
            vec![LocalTrack::video("v1", "s1")],
            SessionEvents::new("p2".into(), 1, tx1, CancellationToken::new()),
        );
        let p2 = connector.connect(
            Role::Responder,
            vec![LocalTrack::audio("a2", "s2")],
            SessionEvents::new("p1".into(), 1, tx2, CancellationToken::new()),
        );

        let (mut c1, mut c2) = (false, false);
        let negotiation = async {
            while !(c1 && c2) {
                tokio::select! {
                    Some(Event::Session(e)) = rx1.recv() => match e.kind {
                        SessionEventKind::Signal(s) => p2.apply_signal(s),
                        SessionEventKind::Connected => c1 = true,
                        SessionEventKind::Failed(e) => panic!("initiator failed: {}", e),
                        _ => {}
                    },
                    Some(Event::Session(e)) = rx2.recv() => match e.kind {
                        SessionEventKind::Signal(s) => p1.apply_signal(s),
                        SessionEventKind::Connected => c2 = true,
                        SessionEventKind::Failed(e) => panic!("responder failed: {}", e),
                        _ => {}
                    },
                }
            }
        };
        timeout(Duration::from_secs(30), negotiation)
            .await
            .expect("peers failed to connect in time");

        p1.close();
        p2.close();
    }
}
