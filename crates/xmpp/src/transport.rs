use minidom::Element;

use crate::error::ConnectionError;
use crate::status::TransportStatus;

/// Inbound traffic from a transport, delivered to the owning event loop.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Status(TransportStatus),
    Stanza(Element),
}

/// The protocol session a chat connection runs on.
///
/// `connect` only starts the session; progress is reported as
/// [`TransportEvent::Status`] events and room traffic as
/// [`TransportEvent::Stanza`] events on the transport's event channel.
#[cfg_attr(test, mockall::automock)]
pub trait ChatTransport {
    fn connect(&mut self, endpoint: &str, jid: &str, password: &str)
    -> Result<(), ConnectionError>;

    /// Ends the session. A transport that is not connected ignores the call.
    fn disconnect(&mut self);

    fn send(&mut self, stanza: Element) -> Result<(), ConnectionError>;
}
