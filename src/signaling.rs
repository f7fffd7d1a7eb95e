use crate::config::ReconnectPolicy;
use crate::error::Error;
use crate::protocol::{Signal, SignalingMessage, UserId};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, Stream, StreamExt};
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Who we are and which room we're in, as announced to the relay on every (re)connect.
#[derive(Debug, Clone)]
pub struct RoomIdentity {
    pub room_id: Arc<str>,
    pub user_id: UserId,
    pub user_name: Arc<str>,
}

impl RoomIdentity {
    fn join(&self) -> SignalingMessage {
        SignalingMessage::Join {
            room_id: self.room_id.to_string(),
            user_id: self.user_id.clone(),
            user_name: self.user_name.to_string(),
        }
    }

    fn leave(&self) -> SignalingMessage {
        SignalingMessage::Leave {
            room_id: self.room_id.to_string(),
            user_id: self.user_id.clone(),
        }
    }
}

/// Events produced by the [SignalingClient], delivered in the order they were received from
/// the relay.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// Relay connection has been established and the room joined. `rejoin` is set when this
    /// follows a lost connection.
    Connected { rejoin: bool },
    Joined { user_id: UserId, user_name: Arc<str> },
    Signal { user_id: UserId, payload: Signal },
    Left { user_id: UserId },
    /// Connection has been lost. Reconnection is already in progress.
    Disconnected { reason: Arc<str> },
    /// Reconnection budget has been exhausted. No more events will follow.
    Closed { reason: Arc<str> },
}

/// Ordered stream of [RelayEvent]s.
#[derive(Debug)]
pub struct RelayEvents(UnboundedReceiver<RelayEvent>);

impl RelayEvents {
    pub async fn next(&mut self) -> Option<RelayEvent> {
        self.0.recv().await
    }
}

impl Stream for RelayEvents {
    type Item = RelayEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.0.poll_recv(cx)
    }
}

/// Cloneable sending half of the signaling client.
///
/// Messages sent while the relay connection is down are buffered and replayed, in the original
/// order, right after the room has been rejoined. Once the client gave up reconnecting, every
/// send fails with [Error::RelayDisconnected].
#[derive(Debug, Clone)]
pub struct SignalingSender {
    identity: Arc<RoomIdentity>,
    tx: UnboundedSender<SignalingMessage>,
}

impl SignalingSender {
    pub(crate) fn new(identity: RoomIdentity, tx: UnboundedSender<SignalingMessage>) -> Self {
        SignalingSender {
            identity: Arc::new(identity),
            tx,
        }
    }

    pub fn identity(&self) -> &RoomIdentity {
        &self.identity
    }

    pub fn send(&self, message: SignalingMessage) -> Result<(), Error> {
        self.tx
            .send(message)
            .map_err(|_| Error::relay_disconnected("signaling client is closed"))
    }

    /// Forwards a negotiation payload to the target participant.
    pub fn signal(&self, target: UserId, payload: Signal) -> Result<(), Error> {
        self.send(SignalingMessage::Signal {
            room_id: self.identity.room_id.to_string(),
            user_id: target,
            payload,
        })
    }

    pub fn join(&self) -> Result<(), Error> {
        self.send(self.identity.join())
    }

    pub fn leave(&self) -> Result<(), Error> {
        self.send(self.identity.leave())
    }
}

/// Connection to the signaling relay, with automatic reconnection and room rejoin.
pub struct SignalingClient {
    sender: SignalingSender,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SignalingClient {
    /// Starts connecting to the relay at `url`. Progress is reported via returned [RelayEvents]:
    /// [RelayEvent::Connected] is emitted once the room has been joined.
    pub fn connect(url: &str, identity: RoomIdentity, policy: ReconnectPolicy) -> (Self, RelayEvents) {
        let (tx, outbound) = unbounded_channel();
        let (events_tx, events) = unbounded_channel();
        let shutdown = CancellationToken::new();
        let driver = Driver {
            url: url.to_owned(),
            identity: identity.clone(),
            policy,
            outbound,
            pending: VecDeque::new(),
            events: events_tx,
            shutdown: shutdown.clone(),
        };
        let task = tokio::spawn(driver.run());
        let client = SignalingClient {
            sender: SignalingSender::new(identity, tx),
            shutdown,
            task: Some(task),
        };
        (client, RelayEvents(events))
    }

    pub fn sender(&self) -> SignalingSender {
        self.sender.clone()
    }

    pub fn send(&self, message: SignalingMessage) -> Result<(), Error> {
        self.sender.send(message)
    }

    /// Announces the room membership again, without touching the transport.
    pub fn rejoin(&self) -> Result<(), Error> {
        self.sender.join()
    }

    pub fn leave(&self) -> Result<(), Error> {
        self.sender.leave()
    }

    /// Stops the client, flushing messages which were already queued when the relay is
    /// connected, and waits for the background task to finish.
    pub async fn close(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("signaling driver terminated abnormally: {}", e);
            }
        }
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

enum Served {
    Shutdown,
    /// Connection broke. `healthy` is set once the relay delivered anything after the join.
    Lost { reason: Arc<str>, healthy: bool },
}

struct Driver {
    url: String,
    identity: RoomIdentity,
    policy: ReconnectPolicy,
    outbound: UnboundedReceiver<SignalingMessage>,
    /// Messages taken from `outbound` which could not be written because the connection broke.
    pending: VecDeque<SignalingMessage>,
    events: UnboundedSender<RelayEvent>,
    shutdown: CancellationToken,
}

impl Driver {
    async fn run(mut self) {
        let mut connected_before = false;
        let mut attempt = 0u32;
        loop {
            let connecting = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                res = connect_async(self.url.as_str()) => res,
            };
            let reason: Arc<str> = match connecting {
                Ok((ws, _)) => {
                    info!("connected to relay {}", self.url);
                    let rejoin = connected_before;
                    connected_before = true;
                    match self.serve(ws, rejoin).await {
                        Served::Shutdown => return,
                        Served::Lost { reason, healthy } => {
                            warn!("relay connection lost: {}", reason);
                            // relays accepting and dropping right away keep using up the budget
                            if healthy {
                                attempt = 0;
                            }
                            self.emit(RelayEvent::Disconnected {
                                reason: reason.clone(),
                            });
                            reason
                        }
                    }
                }
                Err(e) => {
                    warn!("failed to connect to relay {}: {}", self.url, e);
                    e.to_string().into()
                }
            };

            attempt += 1;
            if attempt > self.policy.max_attempts {
                error!(
                    "giving up on relay {} after {} attempts",
                    self.url, self.policy.max_attempts
                );
                self.emit(RelayEvent::Closed { reason });
                return;
            }
            let delay = self.policy.delay(attempt);
            debug!("reconnecting to relay in {:?} (attempt {})", delay, attempt);
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn serve(&mut self, ws: WsStream, rejoin: bool) -> Served {
        let (mut write, mut read) = ws.split();

        let lost = |e: Error, healthy| Served::Lost {
            reason: e.to_string().into(),
            healthy,
        };
        let join = self.identity.join();
        if let Err(e) = write_message(&mut write, &join).await {
            return lost(e, false);
        }
        self.emit(RelayEvent::Connected { rejoin });

        while let Some(message) = self.pending.pop_front() {
            if let Err(e) = write_message(&mut write, &message).await {
                self.pending.push_front(message);
                return lost(e, false);
            }
        }

        let mut healthy = false;
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    self.flush_queued(&mut write).await;
                    let _ = write.send(Message::Close(None)).await;
                    return Served::Shutdown;
                }
                frame = read.next() => {
                    match self.on_frame(frame) {
                        Some(reason) => return Served::Lost { reason, healthy },
                        None => healthy = true,
                    }
                }
                message = self.outbound.recv() => match message {
                    Some(message) => {
                        if let Err(e) = write_message(&mut write, &message).await {
                            self.pending.push_back(message);
                            return lost(e, healthy);
                        }
                    }
                    None => {
                        let _ = write.send(Message::Close(None)).await;
                        return Served::Shutdown;
                    }
                },
            }
        }
    }

    /// Writes out whatever has been queued before shutdown was requested.
    async fn flush_queued(&mut self, write: &mut SplitSink<WsStream, Message>) {
        while let Ok(message) = self.outbound.try_recv() {
            if write_message(write, &message).await.is_err() {
                break;
            }
        }
    }

    /// Handles a single inbound frame. Returns a reason if the connection is no longer usable.
    fn on_frame(
        &self,
        frame: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
    ) -> Option<Arc<str>> {
        match frame {
            Some(Ok(Message::Text(text))) => {
                self.dispatch(text.as_str());
                None
            }
            Some(Ok(Message::Close(_))) => Some("connection closed by relay".into()),
            Some(Ok(_)) => None,
            Some(Err(e)) => Some(e.to_string().into()),
            None => Some("connection closed".into()),
        }
    }

    fn dispatch(&self, text: &str) {
        let message = match SignalingMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("skipping malformed relay message: {}", e);
                return;
            }
        };
        let room_id = message.room_id();
        if !room_id.is_empty() && room_id != &*self.identity.room_id {
            debug!("ignoring message for foreign room {}", room_id);
            return;
        }
        let event = match message {
            SignalingMessage::Joined {
                user_id, user_name, ..
            } => RelayEvent::Joined {
                user_id,
                user_name: user_name.into(),
            },
            SignalingMessage::Signal {
                user_id, payload, ..
            } => RelayEvent::Signal { user_id, payload },
            SignalingMessage::Left { user_id, .. } => RelayEvent::Left { user_id },
            other => {
                debug!("ignoring unexpected relay message: {:?}", other);
                return;
            }
        };
        self.emit(event);
    }

    fn emit(&self, event: RelayEvent) {
        let _ = self.events.send(event);
    }
}

async fn write_message(
    write: &mut SplitSink<WsStream, Message>,
    message: &SignalingMessage,
) -> Result<(), Error> {
    let json = message.to_json()?;
    write.send(Message::Text(json.into())).await?;
    Ok(())
}
