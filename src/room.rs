use crate::config::RoomConfig;
use crate::error::{Error, FailureKind, FailureReport};
use crate::event::{Command, Event};
use crate::manager::SessionManager;
use crate::media::{LocalMedia, MediaSource};
use crate::notification::{Notification, Notifications, Notifier};
use crate::peer_connection::WebRtcConnector;
use crate::session::Connector;
use crate::signaling::{RelayEvent, RelayEvents, RoomIdentity, SignalingClient};
use crate::supervisor::RecoverySupervisor;
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

/// Membership in a single mesh room: a connection to the signaling relay plus one peer session
/// per remote participant.
///
/// The room runs as a single background task. Everything it reacts to (relay traffic, peer
/// connection callbacks, timers, capture results and user commands) is processed one event at
/// a time.
pub struct Room {
    config: RoomConfig,
    client: SignalingClient,
    relay: RelayEvents,
    events_tx: UnboundedSender<Event>,
    events: UnboundedReceiver<Event>,
    manager: SessionManager,
    supervisor: RecoverySupervisor,
    media: LocalMedia,
    source: Arc<dyn MediaSource>,
    notifier: Notifier,
}

impl Room {
    /// Joins a room using webrtc-rs peer connections configured from `config`.
    pub fn connect(config: RoomConfig, source: Arc<dyn MediaSource>) -> Result<(RoomHandle, Notifications), Error> {
        let connector = WebRtcConnector::new(config.options());
        Self::join(config, Arc::new(connector), source)
    }

    /// Joins a room with peer connections created by given `connector`. Must be called from
    /// within a tokio runtime.
    pub fn join(
        config: RoomConfig,
        connector: Arc<dyn Connector>,
        source: Arc<dyn MediaSource>,
    ) -> Result<(RoomHandle, Notifications), Error> {
        config.validate()?;
        let identity = RoomIdentity {
            room_id: config.room_id.as_str().into(),
            user_id: config.user_id.clone(),
            user_name: config.user_name.as_str().into(),
        };
        let (client, relay) = SignalingClient::connect(&config.relay_url, identity, config.reconnect.clone());
        let (events_tx, events) = unbounded_channel();
        let (notifier, notifications) = Notifier::new();
        let manager = SessionManager::new(connector, client.sender(), events_tx.clone(), notifier.clone());
        let supervisor = RecoverySupervisor::new(
            config.recovery.clone(),
            config.join_delay(),
            events_tx.clone(),
            notifier.clone(),
        );
        let room = Room {
            config,
            client,
            relay,
            events_tx: events_tx.clone(),
            events,
            manager,
            supervisor,
            media: LocalMedia::new(),
            source,
            notifier,
        };
        info!(
            "joining room {} as {} via {}",
            room.config.room_id, room.config.user_id, room.config.relay_url
        );
        room.acquire_camera();
        let task = tokio::spawn(room.run());
        let handle = RoomHandle {
            commands: events_tx,
            task: Some(task),
        };
        Ok((handle, notifications))
    }

    async fn run(mut self) {
        loop {
            let done = tokio::select! {
                event = self.relay.next() => match event {
                    Some(event) => self.on_relay_event(event),
                    None => true,
                },
                Some(event) = self.events.recv() => self.on_event(event),
            };
            if done {
                break;
            }
        }
        self.shutdown().await;
    }

    /// Returns `true` when the room can't continue.
    fn on_relay_event(&mut self, event: RelayEvent) -> bool {
        match event {
            RelayEvent::Connected { rejoin } => {
                info!("room {} joined (rejoin: {})", self.config.room_id, rejoin);
                if rejoin {
                    self.supervisor
                        .on_relay_rejoined(&mut self.manager, self.config.rejoin);
                }
            }
            RelayEvent::Joined { user_id, user_name } => {
                self.supervisor.on_member_joined(
                    &mut self.manager,
                    user_id,
                    user_name,
                    self.media.state(),
                );
            }
            RelayEvent::Signal { user_id, payload } => {
                self.manager
                    .on_signal_received(user_id, payload, self.media.state());
            }
            RelayEvent::Left { user_id } => {
                self.manager.on_member_left(&user_id);
            }
            RelayEvent::Disconnected { reason } => {
                self.notifier.failure(
                    FailureReport::new(FailureKind::RelayDisconnected)
                        .with_error(Error::RelayDisconnected(reason)),
                );
            }
            RelayEvent::Closed { reason } => {
                error!("room {} lost relay connection for good: {}", self.config.room_id, reason);
                self.notifier.failure(
                    FailureReport::new(FailureKind::RelayReconnectExhausted)
                        .with_error(Error::RelayDisconnected(reason)),
                );
                return true;
            }
        }
        false
    }

    /// Returns `true` when the room has been left.
    fn on_event(&mut self, event: Event) -> bool {
        match event {
            Event::Session(event) => {
                if let Some(failure) = self.manager.on_session_event(event) {
                    self.supervisor.on_session_failed(&mut self.manager, failure);
                }
            }
            Event::RetryDue {
                user_id,
                generation,
            } => {
                self.supervisor.on_retry_due(
                    &mut self.manager,
                    &user_id,
                    generation,
                    self.media.state(),
                );
            }
            Event::DelayedJoin { user_id } => {
                self.supervisor
                    .on_delayed_join(&mut self.manager, user_id, self.media.state());
            }
            Event::CameraReady(Ok(stream)) => {
                info!("local media {} acquired", stream.id);
                let tracks = self.media.set_camera(stream);
                for track in tracks.iter() {
                    self.manager.broadcast_track_replacement(track);
                }
                self.manager.attach_tracks(&tracks);
                self.notify_local_media();
            }
            Event::CameraReady(Err(e)) => {
                // peers still get connected, receive-only
                self.notifier
                    .failure(FailureReport::new(FailureKind::MediaAccessDenied).with_error(e));
                self.notify_local_media();
            }
            Event::ScreenReady(result) => {
                match self.media.finish_screen_share(result) {
                    Ok(Some(track)) => {
                        info!("screen sharing started");
                        self.manager.broadcast_track_replacement(&track);
                        // sessions without a video sender (audio-only camera) get it added
                        self.manager.attach_tracks(std::slice::from_ref(&track));
                    }
                    Ok(None) => debug!("screen capture produced no video"),
                    Err(Error::UserCancelled) => {
                        self.notifier.failure(
                            FailureReport::new(FailureKind::UserCancelled).with_error(Error::UserCancelled),
                        );
                    }
                    Err(e) => {
                        self.notifier
                            .failure(FailureReport::new(FailureKind::MediaAccessDenied).with_error(e));
                    }
                }
                self.notify_local_media();
            }
            Event::Command(command) => return self.on_command(command),
        }
        false
    }

    fn on_command(&mut self, command: Command) -> bool {
        debug!("command: {:?}", command);
        match command {
            Command::ToggleAudio => {
                self.media.toggle_audio();
            }
            Command::ToggleVideo => {
                self.media.toggle_video();
            }
            Command::ToggleScreenShare => {
                if self.media.state().is_screen_sharing() {
                    self.stop_screen_share();
                } else if self.media.begin_screen_share() {
                    let source = self.source.clone();
                    let events = self.events_tx.clone();
                    tokio::spawn(async move {
                        let result = source.acquire_screen().await;
                        let _ = events.send(Event::ScreenReady(result));
                    });
                    return false;
                } else {
                    debug!("screen capture is already being acquired");
                    return false;
                }
            }
            Command::ScreenShareEnded => {
                if !self.media.state().is_screen_sharing() {
                    return false;
                }
                self.stop_screen_share();
            }
            Command::ForceReconnect => {
                if let Err(e) = self.supervisor.force_reconnect(&mut self.manager) {
                    self.notifier
                        .failure(FailureReport::new(FailureKind::RelayDisconnected).with_error(e));
                }
                return false;
            }
            Command::Leave => return true,
        }
        self.notify_local_media();
        false
    }

    fn stop_screen_share(&mut self) {
        info!("screen sharing stopped");
        if let Some(camera) = self.media.stop_screen_share() {
            self.manager.broadcast_track_replacement(&camera);
        }
    }

    fn acquire_camera(&self) {
        let constraints = self.config.media.clone();
        if !constraints.audio && !constraints.video {
            debug!("no local media requested");
            return;
        }
        let source = self.source.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = source.acquire(&constraints).await;
            let _ = events.send(Event::CameraReady(result));
        });
    }

    fn notify_local_media(&self) {
        self.notifier
            .notify(Notification::LocalMedia(self.media.snapshot()));
    }

    async fn shutdown(mut self) {
        if let Err(e) = self.manager.leave_room() {
            debug!("leave not sent: {}", e);
        }
        self.supervisor.cancel_timers();
        self.manager.destroy_all();
        self.client.close().await;
        self.media.release();
        // commands issued from now on fail instead of being silently lost
        self.events.close();
        info!("room {} left", self.config.room_id);
        self.notifier.notify(Notification::Closed);
    }
}

/// User facing control of a [Room]. Every command fails with [Error::RoomClosed] once the room
/// is gone.
#[derive(Debug)]
pub struct RoomHandle {
    commands: UnboundedSender<Event>,
    task: Option<JoinHandle<()>>,
}

impl RoomHandle {
    pub fn toggle_audio(&self) -> Result<(), Error> {
        self.send(Command::ToggleAudio)
    }

    pub fn toggle_video(&self) -> Result<(), Error> {
        self.send(Command::ToggleVideo)
    }

    /// Starts screen sharing, or stops it if it's already active.
    pub fn toggle_screen_share(&self) -> Result<(), Error> {
        self.send(Command::ToggleScreenShare)
    }

    /// Reports that screen capture has been ended outside of the application.
    pub fn screen_share_ended(&self) -> Result<(), Error> {
        self.send(Command::ScreenShareEnded)
    }

    /// Drops every peer connection and joins the room again.
    pub fn force_reconnect(&self) -> Result<(), Error> {
        self.send(Command::ForceReconnect)
    }

    /// Leaves the room and waits until everything has been released.
    pub async fn leave(mut self) -> Result<(), Error> {
        let result = self.send(Command::Leave);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("room task terminated abnormally: {}", e);
            }
        }
        result
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    fn send(&self, command: Command) -> Result<(), Error> {
        self.commands
            .send(Event::Command(command))
            .map_err(|_| Error::RoomClosed)
    }
}
