//! Events fanned out by rooms, PM sessions and the client.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::trace;

use crate::model::{Message, ModeratorFlags, User};
use crate::room::RoomFlags;

/// An event produced by a room, a PM session or the client itself.
///
/// Events are broadcast; anything holding a subscription sees every one of
/// them. Slow subscribers lag rather than block the connection.
#[derive(Debug, Clone)]
pub enum Event {
    /// The client finished its startup sequence.
    Init,
    /// All initial rooms reported in (or the deadline expired).
    Started,

    /// Session bootstrap acknowledged by the server.
    Connect { room: String },
    /// The connection closed, cleanly or otherwise.
    Disconnect { room: String },
    /// The keep-alive ping was written.
    Ping,
    /// The server answered with an empty frame.
    Pong,

    /// A fully reconciled message with its final id.
    Message(Arc<Message>),

    /// A named user joined the room.
    Join(User),
    /// A named user left the room.
    Leave(User),
    /// An anonymous user joined the room.
    AnonJoin(User),
    /// An anonymous user left the room.
    AnonLeave(User),
    /// A session upgraded from anonymous to a named account.
    UserLogin { before: User, user: User },
    /// A session downgraded from a named account to anonymous.
    UserLogout { before: User, user: User },
    /// An anonymous session changed its anonymous identity.
    AnonLogin { before: User, user: User },

    /// A named user was banned.
    Ban { by: User, target: User },
    /// An anonymous author was banned through a message unid.
    AnonBan { by: User, target: User },
    /// A named user was unbanned.
    Unban { by: User, target: User },
    /// An anonymous author was unbanned.
    AnonUnban { by: User, target: User },
    /// The full ban list was replaced.
    BanlistUpdate,
    /// The recent-unbans log was refreshed.
    UnbanlistUpdate,

    /// A user gained moderator powers.
    ModAdded(User),
    /// A user lost moderator powers.
    ModRemove(User),
    /// A moderator's power bits changed.
    ModsChange(User, ModeratorFlags),
    /// The server rejected a moderator update.
    ModUpdateError { user: User, kind: String },

    /// The current announcement body.
    Announcement(String),
    /// The announcement body changed; carries the enabled flag.
    AnnouncementUpdate(bool),

    /// All messages were purged, with the issuing unid.
    ClearAll(String),
    /// A single message was deleted from view.
    DeleteMessage { user: User, message: Arc<Message> },
    /// A user's messages were bulk-deleted.
    DeleteUser {
        user: Option<User>,
        messages: Vec<Arc<Message>>,
    },

    /// The server warned about message flooding.
    FloodWarning,
    /// A temporary ban was applied, with its duration in seconds.
    ShowTempBan(u64),
    /// A temporary ban is still active, with its remaining seconds.
    TempBan(u64),

    /// The room's feature flags were replaced.
    GroupFlags(RoomFlags),
    /// The server refused the room; the session will not reconnect.
    RoomDenied(String),
    /// The connection came from a banned proxy range.
    ProxyBanned,
    /// An outbound message exceeded the room's length limit.
    MessageLengthExceeded,
    /// The banned-words lists, url-decoded.
    BannedWords { part: String, whole: String },

    /// A user's message background should be re-fetched.
    BgReload(User),
    /// A user edited their profile.
    ProfileChanges(User),
    /// A user's profile should be re-fetched.
    ProfileReload(User),
    /// A user's premium flag flipped on a recent message.
    PremiumChange { user: User, premium: bool },
    /// This session was logged out and now runs under its anon identity.
    Logout(User),
}

/// Fan-out of events to the owning object and any listeners.
///
/// Handlers receive events through subscriptions instead of being called
/// inline, so a slow or failing subscriber can't stall the receive loop.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new()
    }
}

impl EventBus {
    pub fn new() -> EventBus {
        let (tx, _) = broadcast::channel(512);
        EventBus { tx }
    }

    /// Open a new subscription. Events emitted before this call are not
    /// replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub(crate) fn emit(&self, event: Event) {
        trace!(?event, "event");
        // no subscribers is fine; state keeping doesn't depend on listeners
        let _ = self.tx.send(event);
    }
}
