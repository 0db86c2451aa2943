//! XMPP multi-user chat connection for the collab wiki chat panel.
//!
//! [`ChatConnection`] owns the session lifecycle and publishes room traffic on
//! the `chat.*` channels of the event bus. On native targets
//! [`WebSocketTransport`] provides the wire session and [`ChatSession`] drives
//! a connection from one tokio task.

pub mod error;
pub mod jid;
pub mod queue;
pub mod roster;
pub mod stanza;
pub mod status;
pub mod transport;

#[cfg(feature = "native")]
pub mod connection;
#[cfg(feature = "native")]
pub mod session;
#[cfg(feature = "native")]
pub mod websocket;

pub use error::{ChatError, ConnectionError};
pub use minidom::Element;
pub use queue::{DelayedMessageQueue, QueuedMessage};
pub use roster::{Participant, ParticipantRoster, RosterChange};
pub use status::{StatusAction, StatusInfo, TransportStatus, translate};
pub use transport::{ChatTransport, TransportEvent};

#[cfg(feature = "native")]
pub use connection::{ChatConnection, ConnectionConfig, SessionPhase};
#[cfg(feature = "native")]
pub use session::ChatSession;
#[cfg(feature = "native")]
pub use websocket::WebSocketTransport;
