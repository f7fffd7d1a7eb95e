use crate::error::Error;
use crate::media::LocalStream;
use crate::protocol::UserId;
use crate::session::SessionEvent;

/// Every input of the room event loop apart from relay traffic. Entries are processed one at a
/// time, in the order they were enqueued.
#[derive(Debug)]
pub(crate) enum Event {
    /// Callback fired by a peer connection handle.
    Session(SessionEvent),
    /// Recovery delay for a failed session has elapsed.
    RetryDue { user_id: UserId, generation: u64 },
    /// Join delay for a newly observed participant has elapsed.
    DelayedJoin { user_id: UserId },
    /// Camera and microphone acquisition finished.
    CameraReady(Result<LocalStream, Error>),
    /// Screen capture acquisition finished.
    ScreenReady(Result<LocalStream, Error>),
    Command(Command),
}

/// User triggered operations.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    ToggleAudio,
    ToggleVideo,
    ToggleScreenShare,
    ScreenShareEnded,
    ForceReconnect,
    Leave,
}
