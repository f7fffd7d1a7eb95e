use crate::error::FailureReport;
use crate::media::{LocalMediaSnapshot, RemoteTrack};
use crate::protocol::UserId;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Room participant as known from the relay. Participants first seen through a signal, before
/// their join announcement, have no display name yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub user_id: UserId,
    pub display_name: Option<Arc<str>>,
}

/// Everything the rendering side of the application needs to know about.
#[derive(Debug, Clone)]
pub enum Notification {
    RemoteStreamAvailable { user_id: UserId, track: RemoteTrack },
    /// Current list of remote participants, ordered by user id.
    RosterChanged(Vec<Member>),
    LocalMedia(LocalMediaSnapshot),
    Failure(FailureReport),
    /// Room has been left or the relay could not be reached anymore. Nothing follows.
    Closed,
}

#[derive(Debug, Clone)]
pub(crate) struct Notifier(UnboundedSender<Notification>);

impl Notifier {
    pub fn new() -> (Self, Notifications) {
        let (tx, rx) = unbounded_channel();
        (Notifier(tx), Notifications(rx))
    }

    pub fn notify(&self, notification: Notification) {
        // nobody listening is fine
        let _ = self.0.send(notification);
    }

    pub fn failure(&self, report: FailureReport) {
        log::warn!("{}", report);
        self.notify(Notification::Failure(report));
    }
}

/// Ordered stream of [Notification]s produced by a room.
#[derive(Debug)]
pub struct Notifications(UnboundedReceiver<Notification>);

impl Notifications {
    pub async fn next(&mut self) -> Option<Notification> {
        self.0.recv().await
    }

    /// Returns the next notification if one is already queued.
    pub fn try_next(&mut self) -> Option<Notification> {
        self.0.try_recv().ok()
    }
}

impl Stream for Notifications {
    type Item = Notification;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.0.poll_recv(cx)
    }
}
