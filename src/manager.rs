use crate::error::{Error, FailureKind, FailureReport};
use crate::event::Event;
use crate::media::{LocalMediaState, LocalTrack};
use crate::notification::{Member, Notification, Notifier};
use crate::protocol::{Signal, UserId};
use crate::session::{Connector, PeerSession, Role, SessionEvent, SessionEventKind};
use crate::signaling::SignalingSender;
use log::{debug, info, trace};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// Failure reported by the current session of a peer, handed over to the recovery supervisor.
#[derive(Debug)]
pub(crate) struct SessionFailure {
    pub user_id: UserId,
    pub generation: u64,
    pub error: Error,
}

/// Owner of the session table and the room roster.
///
/// There's at most one session per remote participant. Every check-then-create sequence runs
/// inside a single synchronous call, which together with the single room task is what keeps
/// that invariant.
pub(crate) struct SessionManager {
    local_user: UserId,
    connector: Arc<dyn Connector>,
    sessions: HashMap<UserId, PeerSession>,
    members: BTreeMap<UserId, Member>,
    exhausted: HashSet<UserId>,
    events: UnboundedSender<Event>,
    outbox: SignalingSender,
    notifier: Notifier,
    next_generation: u64,
}

impl SessionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        outbox: SignalingSender,
        events: UnboundedSender<Event>,
        notifier: Notifier,
    ) -> Self {
        SessionManager {
            local_user: outbox.identity().user_id.clone(),
            connector,
            sessions: HashMap::new(),
            members: BTreeMap::new(),
            exhausted: HashSet::new(),
            events,
            outbox,
            notifier,
            next_generation: 1,
        }
    }

    pub fn session(&self, user_id: &UserId) -> Option<&PeerSession> {
        self.sessions.get(user_id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &PeerSession> {
        self.sessions.values()
    }

    pub fn members(&self) -> Vec<Member> {
        self.members.values().cloned().collect()
    }

    pub fn is_member(&self, user_id: &UserId) -> bool {
        self.members.contains_key(user_id)
    }

    pub fn is_exhausted(&self, user_id: &UserId) -> bool {
        self.exhausted.contains(user_id)
    }

    /// Handles a participant announcing itself in the room: records it and starts an initiator
    /// session towards it, unless a live one already exists.
    pub fn on_member_joined(&mut self, user_id: UserId, user_name: Arc<str>, media: &LocalMediaState) -> bool {
        if self.admit_member(user_id.clone(), user_name) {
            self.ensure_initiator(user_id, media)
        } else {
            false
        }
    }

    /// Records a participant announced by the relay, without creating a session. A repeated
    /// announcement gives an exhausted peer another chance. Returns `false` for our own echo.
    pub fn admit_member(&mut self, user_id: UserId, user_name: Arc<str>) -> bool {
        if user_id == self.local_user {
            trace!("ignoring own join announcement");
            return false;
        }
        self.exhausted.remove(&user_id);
        self.record_member(user_id, Some(user_name));
        true
    }

    /// Creates an initiator session for a known participant, unless a live session exists.
    /// A terminal leftover gets replaced.
    pub fn ensure_initiator(&mut self, user_id: UserId, media: &LocalMediaState) -> bool {
        match self.sessions.get(&user_id).map(|s| s.state()) {
            Some(state) if !state.is_terminal() => {
                debug!("session with {} is already {}", user_id, state);
                false
            }
            _ => {
                self.install(user_id, Role::Initiator, 0, media);
                true
            }
        }
    }

    /// Routes a negotiation payload from a remote participant. Unknown participants get a
    /// responder session first, terminal sessions are replaced by a fresh responder.
    pub fn on_signal_received(&mut self, user_id: UserId, payload: Signal, media: &LocalMediaState) {
        if user_id == self.local_user {
            trace!("ignoring signal echo");
            return;
        }
        if self.is_exhausted(&user_id) {
            debug!("dropping signal from {}: recovery budget exhausted", user_id);
            return;
        }
        self.record_member(user_id.clone(), None);

        match self.sessions.get(&user_id).map(|s| s.state()) {
            None => self.install(user_id.clone(), Role::Responder, 0, media),
            Some(state) if !state.is_terminal() => {}
            Some(state) => {
                self.notifier.failure(
                    FailureReport::peer(user_id.clone(), FailureKind::StaleSessionSignal)
                        .with_error(Error::InvalidSignal(state)),
                );
                self.install(user_id.clone(), Role::Responder, 0, media);
            }
        }

        if let Some(session) = self.sessions.get(&user_id) {
            if let Err(e) = session.apply_inbound(payload) {
                debug!("failed to apply signal from {}: {}", user_id, e);
            }
        }
    }

    /// Tears down the session with a participant which left the room and forgets about it.
    pub fn on_member_left(&mut self, user_id: &UserId) {
        self.exhausted.remove(user_id);
        if let Some(mut session) = self.sessions.remove(user_id) {
            session.destroy();
            info!("session with {} closed: participant left", user_id);
        }
        if self.members.remove(user_id).is_some() {
            self.notify_roster();
        }
    }

    /// Swaps the outgoing track of the same kind on every live session. Returns the number of
    /// sessions which had a sender to swap.
    pub fn broadcast_track_replacement(&self, track: &LocalTrack) -> usize {
        let mut replaced = 0;
        for session in self.sessions.values() {
            if session.replace_outgoing_track(track) {
                replaced += 1;
            }
        }
        debug!("outgoing {:?} track replaced on {} sessions", track.kind(), replaced);
        replaced
    }

    /// Adds newly available local tracks to sessions created before they existed.
    pub fn attach_tracks(&self, tracks: &[LocalTrack]) {
        for session in self.sessions.values() {
            let added = session.attach_tracks(tracks);
            if added > 0 {
                debug!("attached {} local tracks to session with {}", added, session.user_id());
            }
        }
    }

    /// Handles a callback from a peer connection. Callbacks of sessions which were replaced or
    /// already ended are dropped. Failures of the current session are returned for recovery.
    pub fn on_session_event(&mut self, event: SessionEvent) -> Option<SessionFailure> {
        let SessionEvent {
            user_id,
            generation,
            kind,
        } = event;
        let session = match self.sessions.get_mut(&user_id) {
            Some(session) if session.generation() == generation && session.is_live() => session,
            _ => {
                trace!("dropping stale event of {} (generation {})", user_id, generation);
                return None;
            }
        };
        match kind {
            SessionEventKind::Signal(payload) => {
                if let Err(e) = self.outbox.signal(user_id.clone(), payload) {
                    self.notifier.failure(
                        FailureReport::peer(user_id, FailureKind::RelayDisconnected).with_error(e),
                    );
                }
                None
            }
            SessionEventKind::RemoteTrack(track) => {
                info!("remote {:?} track {} from {}", track.kind, track.track_id, user_id);
                self.notifier
                    .notify(Notification::RemoteStreamAvailable { user_id, track });
                None
            }
            SessionEventKind::Connected => {
                if session.on_connected() {
                    info!("session with {} connected", user_id);
                }
                None
            }
            SessionEventKind::Failed(error) => {
                if session.on_failed(error.clone()) {
                    Some(SessionFailure {
                        user_id,
                        generation,
                        error,
                    })
                } else {
                    None
                }
            }
            SessionEventKind::Closed => {
                if let Some(mut session) = self.sessions.remove(&user_id) {
                    session.destroy();
                }
                info!("session with {} closed by remote side", user_id);
                None
            }
        }
    }

    /// Replaces a failed session with a new one of the same role. Does nothing when the failed
    /// session is no longer the current one.
    pub fn recreate(&mut self, user_id: &UserId, generation: u64, media: &LocalMediaState) -> bool {
        let (role, retry_count) = match self.sessions.get(user_id) {
            Some(s) if s.generation() == generation && !s.is_live() => (s.role(), s.retry_count()),
            _ => return false,
        };
        info!("recreating session with {} as {:?} (retry {})", user_id, role, retry_count + 1);
        self.install(user_id.clone(), role, retry_count + 1, media);
        if role == Role::Responder {
            // a responder only answers, the remote initiator has to offer again
            if let Err(e) = self.outbox.signal(user_id.clone(), Signal::Renegotiate) {
                self.notifier.failure(
                    FailureReport::peer(user_id.clone(), FailureKind::RelayDisconnected).with_error(e),
                );
            }
        }
        true
    }

    /// Drops a failed session for good. Signals from that participant are ignored until it
    /// rejoins or the room is force-reconnected.
    pub fn abandon(&mut self, user_id: &UserId, generation: u64) -> bool {
        match self.sessions.get(user_id) {
            Some(s) if s.generation() == generation => {}
            _ => return false,
        }
        if let Some(mut session) = self.sessions.remove(user_id) {
            session.destroy();
        }
        self.exhausted.insert(user_id.clone());
        true
    }

    /// Destroys every session and forgets exhausted peers. Roster stays intact.
    pub fn destroy_all(&mut self) {
        for (_, mut session) in self.sessions.drain() {
            session.destroy();
        }
        self.exhausted.clear();
    }

    /// Sends `leave` followed by `join`, making remote participants tear down their side and
    /// initiate again.
    pub fn rejoin_room(&self) -> Result<(), Error> {
        self.outbox.leave()?;
        self.outbox.join()
    }

    pub fn leave_room(&self) -> Result<(), Error> {
        self.outbox.leave()
    }

    fn install(&mut self, user_id: UserId, role: Role, retry_count: u32, media: &LocalMediaState) {
        let generation = self.next_generation;
        self.next_generation += 1;
        let session = PeerSession::create(
            user_id.clone(),
            role,
            generation,
            retry_count,
            media.outgoing_tracks(),
            self.connector.as_ref(),
            self.events.clone(),
        );
        debug!("created {:?} session with {} (generation {})", role, user_id, generation);
        if let Some(mut old) = self.sessions.insert(user_id, session) {
            old.destroy();
        }
    }

    fn record_member(&mut self, user_id: UserId, display_name: Option<Arc<str>>) {
        let changed = match self.members.get_mut(&user_id) {
            Some(member) => match display_name {
                Some(name) if member.display_name.as_deref() != Some(&*name) => {
                    member.display_name = Some(name);
                    true
                }
                _ => false,
            },
            None => {
                self.members.insert(
                    user_id.clone(),
                    Member {
                        user_id,
                        display_name,
                    },
                );
                true
            }
        };
        if changed {
            self.notify_roster();
        }
    }

    fn notify_roster(&self) {
        self.notifier.notify(Notification::RosterChanged(self.members()));
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.destroy_all();
    }
}

#[cfg(test)]
mod test {
    use crate::error::{Error, FailureKind};
    use crate::media::{LocalTrack, RemoteTrack, TrackKind};
    use crate::notification::{Member, Notification};
    use crate::protocol::{Signal, SignalingMessage, UserId};
    use crate::session::{Role, SessionState};
    use crate::testing::{camera_stream, screen_stream, Harness};

    #[test]
    fn join_connect_leave() {
        let mut h = Harness::new(3);
        let u1 = UserId::from("u1");
        assert!(h.manager.on_member_joined(u1.clone(), "Alice".into(), h.media.state()));

        let session = h.manager.session(&u1).unwrap();
        assert_eq!(session.role(), Role::Initiator);
        assert_eq!(session.state(), SessionState::Negotiating);
        match h.notifications.try_next() {
            Some(Notification::RosterChanged(members)) => assert_eq!(
                members,
                vec![Member {
                    user_id: u1.clone(),
                    display_name: Some("Alice".into())
                }]
            ),
            other => panic!("unexpected notification {:?}", other),
        }

        h.connector.last().unwrap().events.connected();
        assert!(h.pump().is_empty());
        assert_eq!(h.manager.session(&u1).unwrap().state(), SessionState::Connected);

        h.manager.on_member_left(&u1);
        assert!(h.manager.session(&u1).is_none());
        assert_eq!(h.connector.last().unwrap().close_count(), 1);
        match h.notifications.try_next() {
            Some(Notification::RosterChanged(members)) => assert!(members.is_empty()),
            other => panic!("unexpected notification {:?}", other),
        }
    }

    #[test]
    fn unknown_signal_creates_responder() {
        let mut h = Harness::new(3);
        let u2 = UserId::from("u2");
        h.manager
            .on_signal_received(u2.clone(), Signal::Renegotiate, h.media.state());

        let session = h.manager.session(&u2).unwrap();
        assert_eq!(session.role(), Role::Responder);
        assert_eq!(session.state(), SessionState::Negotiating);
        let conn = h.connector.last().unwrap();
        assert_eq!(conn.role, Role::Responder);
        assert!(matches!(conn.applied()[..], [Signal::Renegotiate]));
        assert_eq!(
            h.manager.members(),
            vec![Member {
                user_id: u2.clone(),
                display_name: None
            }]
        );

        // a later join announcement fills the name in, without a second session
        assert!(!h.manager.on_member_joined(u2.clone(), "Bob".into(), h.media.state()));
        assert_eq!(h.manager.members()[0].display_name.as_deref(), Some("Bob"));
        assert_eq!(h.connector.count(), 1);
    }

    #[test]
    fn at_most_one_session_per_user() {
        let mut h = Harness::new(3);
        let u1 = UserId::from("u1");
        let state = h.media.state().clone();
        h.manager.on_member_joined(u1.clone(), "Alice".into(), &state);
        h.manager.on_signal_received(u1.clone(), Signal::Renegotiate, &state);
        h.manager.on_member_joined(u1.clone(), "Alice".into(), &state);
        h.manager.on_signal_received(u1.clone(), Signal::Renegotiate, &state);
        assert_eq!(h.connector.for_user("u1").len(), 1);
        assert_eq!(h.connector.last().unwrap().applied().len(), 2);

        h.manager.on_member_left(&u1);
        h.manager.on_signal_received(u1.clone(), Signal::Renegotiate, &state);
        let conns = h.connector.for_user("u1");
        assert_eq!(conns.len(), 2);
        assert_eq!(conns[0].close_count(), 1);
        assert_eq!(conns[1].close_count(), 0);
        assert_eq!(h.manager.sessions().filter(|s| s.is_live()).count(), 1);
    }

    #[test]
    fn own_echoes_are_ignored() {
        let mut h = Harness::new(3);
        let me = h.local_user();
        assert!(!h.manager.on_member_joined(me.clone(), "me".into(), h.media.state()));
        h.manager
            .on_signal_received(me.clone(), Signal::Renegotiate, h.media.state());
        assert_eq!(h.connector.count(), 0);
        assert!(h.manager.members().is_empty());
    }

    #[test]
    fn new_session_is_seeded_with_latest_track() {
        let mut h = Harness::new(3);
        h.media.set_camera(camera_stream("cam"));
        h.manager
            .on_member_joined("u1".into(), "Alice".into(), h.media.state());

        assert!(h.media.begin_screen_share());
        let screen = h
            .media
            .finish_screen_share(Ok(screen_stream("scr")))
            .unwrap()
            .unwrap();
        assert_eq!(h.manager.broadcast_track_replacement(&screen), 1);
        h.manager
            .on_member_joined("u2".into(), "Bob".into(), h.media.state());

        for user in ["u1", "u2"] {
            let conn = h.connector.for_user(user).pop().unwrap();
            let video = conn.outgoing(TrackKind::Video).unwrap();
            assert!(video.same_track(&screen), "{} sends {:?}", user, video);
            assert_eq!(conn.outgoing(TrackKind::Audio).unwrap().id(), "cam-audio");
        }
    }

    #[test]
    fn late_media_is_attached_to_existing_sessions() {
        let mut h = Harness::new(3);
        h.manager
            .on_member_joined("u1".into(), "Alice".into(), h.media.state());
        let conn = h.connector.last().unwrap();
        assert!(conn.tracks().is_empty());

        let tracks = h.media.set_camera(camera_stream("cam"));
        h.manager.attach_tracks(&tracks);
        assert!(conn.has_kind(TrackKind::Audio));
        assert!(conn.has_kind(TrackKind::Video));
        h.manager.attach_tracks(&tracks);
        assert_eq!(conn.tracks().len(), 2);
    }

    #[test]
    fn stale_callbacks_are_ignored() {
        let mut h = Harness::new(3);
        let u1 = UserId::from("u1");
        h.manager
            .on_member_joined(u1.clone(), "Alice".into(), h.media.state());
        let old = h.connector.last().unwrap();
        // queued before the session gets replaced
        assert!(old.events.failed(Error::UserCancelled));

        h.manager.on_member_left(&u1);
        h.manager
            .on_member_joined(u1.clone(), "Alice".into(), h.media.state());
        assert!(h.pump().is_empty());
        assert_eq!(h.manager.session(&u1).unwrap().state(), SessionState::Negotiating);

        // fired after being destroyed
        assert!(!old.events.connected());
        assert!(!old.events.signal(Signal::Renegotiate));
        h.pump();
        assert_eq!(h.manager.session(&u1).unwrap().state(), SessionState::Negotiating);
        assert!(h.outbox.try_recv().is_err());
    }

    #[test]
    fn outbound_signals_are_addressed_to_peer() {
        let mut h = Harness::new(3);
        h.manager
            .on_member_joined("u1".into(), "Alice".into(), h.media.state());
        h.connector.last().unwrap().events.signal(Signal::Renegotiate);
        h.pump();
        match h.outbox.try_recv().unwrap() {
            SignalingMessage::Signal {
                room_id,
                user_id,
                payload: Signal::Renegotiate,
            } => {
                assert_eq!(room_id, "room");
                assert_eq!(user_id.as_str(), "u1");
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn remote_tracks_are_published() {
        let mut h = Harness::new(3);
        h.manager
            .on_member_joined("u1".into(), "Alice".into(), h.media.state());
        h.notifications.try_next();
        let track = RemoteTrack::new("stream", "video", TrackKind::Video);
        h.connector.last().unwrap().events.remote_track(track);
        h.pump();
        match h.notifications.try_next() {
            Some(Notification::RemoteStreamAvailable { user_id, track }) => {
                assert_eq!(user_id.as_str(), "u1");
                assert_eq!(&*track.track_id, "video");
            }
            other => panic!("unexpected notification {:?}", other),
        }
    }

    #[test]
    fn signal_for_failed_session_replaces_it() {
        let mut h = Harness::new(3);
        let u1 = UserId::from("u1");
        h.manager
            .on_member_joined(u1.clone(), "Alice".into(), h.media.state());
        h.notifications.try_next();
        h.connector.last().unwrap().events.failed(Error::UserCancelled);
        assert_eq!(h.pump().len(), 1);
        assert_eq!(h.manager.session(&u1).unwrap().state(), SessionState::Failed);

        h.manager
            .on_signal_received(u1.clone(), Signal::Renegotiate, h.media.state());
        match h.notifications.try_next() {
            Some(Notification::Failure(report)) => {
                assert_eq!(report.kind, FailureKind::StaleSessionSignal);
                assert_eq!(report.user_id, Some(u1.clone()));
            }
            other => panic!("unexpected notification {:?}", other),
        }
        let session = h.manager.session(&u1).unwrap();
        assert_eq!(session.role(), Role::Responder);
        assert_eq!(session.state(), SessionState::Negotiating);
        let conns = h.connector.for_user("u1");
        assert_eq!(conns.len(), 2);
        assert_eq!(conns[0].close_count(), 1);
        assert_eq!(conns[1].applied().len(), 1);
    }

    #[test]
    fn remote_close_keeps_membership() {
        let mut h = Harness::new(3);
        let u1 = UserId::from("u1");
        h.manager
            .on_member_joined(u1.clone(), "Alice".into(), h.media.state());
        h.connector.last().unwrap().events.closed();
        h.pump();
        assert!(h.manager.session(&u1).is_none());
        assert!(h.manager.is_member(&u1));

        // membership allows the peer to be approached again
        assert!(h.manager.ensure_initiator(u1.clone(), h.media.state()));
    }

    #[test]
    fn replacement_skips_sessions_without_sender() {
        let mut h = Harness::new(3);
        h.manager
            .on_member_joined("u1".into(), "Alice".into(), h.media.state());
        let video = LocalTrack::video("v", "s");
        assert_eq!(h.manager.broadcast_track_replacement(&video), 0);
        assert!(h.connector.last().unwrap().replaced().is_empty());
    }
}
