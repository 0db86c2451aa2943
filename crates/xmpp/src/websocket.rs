//! XMPP over WebSocket (RFC 7395): one XML element per text frame, SASL
//! PLAIN authentication and resource binding.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::{SinkExt, StreamExt};
use minidom::Element;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use xmpp_parsers::ns;

use crate::error::ConnectionError;
use crate::jid;
use crate::status::TransportStatus;
use crate::transport::{ChatTransport, TransportEvent};

const NS_FRAMING: &str = "urn:ietf:params:xml:ns:xmpp-framing";
const NS_STREAM: &str = "http://etherx.jabber.org/streams";
const SUBPROTOCOL: &str = "xmpp";
const BIND_ID: &str = "bind_1";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Control side of a running session task.
struct SessionHandle {
    outbound: mpsc::UnboundedSender<Element>,
    close: oneshot::Sender<()>,
}

pub struct WebSocketTransport {
    events: mpsc::UnboundedSender<TransportEvent>,
    session: Option<SessionHandle>,
    timeout: Duration,
}

impl WebSocketTransport {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        Self::with_timeout(Self::DEFAULT_TIMEOUT)
    }

    /// `timeout` bounds the WebSocket handshake and each reply during stream
    /// negotiation.
    pub fn with_timeout(timeout: Duration) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let transport = Self {
            events,
            session: None,
            timeout,
        };
        (transport, receiver)
    }
}

impl ChatTransport for WebSocketTransport {
    /// Spawns the session task; must be called from within a tokio runtime.
    fn connect(
        &mut self,
        endpoint: &str,
        jid: &str,
        password: &str,
    ) -> Result<(), ConnectionError> {
        if self
            .session
            .as_ref()
            .is_some_and(|session| !session.outbound.is_closed())
        {
            return Err(ConnectionError::AlreadyConnected);
        }

        let credentials = Credentials::parse(jid, password)?;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (close, close_rx) = oneshot::channel();
        self.session = Some(SessionHandle { outbound, close });

        let session = Session {
            endpoint: endpoint.to_string(),
            credentials,
            timeout: self.timeout,
            events: self.events.clone(),
        };
        tokio::spawn(session.run(outbound_rx, close_rx));
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = session.close.send(());
        }
    }

    fn send(&mut self, stanza: Element) -> Result<(), ConnectionError> {
        let session = self.session.as_ref().ok_or(ConnectionError::NotConnected)?;
        session
            .outbound
            .send(stanza)
            .map_err(|_| ConnectionError::NotConnected)
    }
}

#[derive(Debug, Clone)]
struct Credentials {
    domain: String,
    username: String,
    password: String,
    resource: Option<String>,
}

impl Credentials {
    fn parse(jid: &str, password: &str) -> Result<Self, ConnectionError> {
        let username = jid::node(jid)
            .filter(|node| !node.is_empty())
            .ok_or_else(|| ConnectionError::InvalidJid(jid.to_string()))?;
        let domain = jid::domain(jid);
        if domain.is_empty() {
            return Err(ConnectionError::InvalidJid(jid.to_string()));
        }

        Ok(Self {
            domain: domain.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            resource: jid::resource(jid).map(String::from),
        })
    }

    fn plain_payload(&self) -> String {
        STANDARD.encode(format!("\0{}\0{}", self.username, self.password))
    }
}

struct Session {
    endpoint: String,
    credentials: Credentials,
    timeout: Duration,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Session {
    async fn run(
        self,
        mut outbound: mpsc::UnboundedReceiver<Element>,
        mut close: oneshot::Receiver<()>,
    ) {
        self.emit_status(TransportStatus::Connecting);

        let established = tokio::select! {
            result = self.establish() => Some(result),
            _ = &mut close => None,
        };

        match established {
            Some(Ok(mut socket)) => {
                info!(endpoint = %self.endpoint, "xmpp session established");
                self.emit_status(TransportStatus::Connected);
                if let Err(error) = self.pump(&mut socket, &mut outbound, &mut close).await {
                    warn!(error = %error, "xmpp session ended with error");
                }
            }
            Some(Err(error)) => {
                warn!(endpoint = %self.endpoint, error = %error, "xmpp session could not be established");
                let status = if error.is_auth_failure() {
                    TransportStatus::AuthFail
                } else {
                    TransportStatus::ConnFail
                };
                self.emit_status(status);
            }
            None => {
                debug!("disconnect requested during negotiation");
                self.emit_status(TransportStatus::Disconnecting);
            }
        }

        self.emit_status(TransportStatus::Disconnected);
    }

    async fn establish(&self) -> Result<Socket, ConnectionError> {
        let mut request = self
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(websocket_error)?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));

        let (mut socket, _response) =
            tokio::time::timeout(self.timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| ConnectionError::Timeout(self.timeout.as_secs()))?
                .map_err(websocket_error)?;

        let features = self.open_stream(&mut socket).await?;
        self.authenticate(&mut socket, &features).await?;

        let features = self.open_stream(&mut socket).await?;
        self.bind(&mut socket, &features).await?;

        Ok(socket)
    }

    /// Send `<open/>`, wait for the server's `<open/>` and return the stream
    /// features that follow it.
    async fn open_stream(&self, socket: &mut Socket) -> Result<Element, ConnectionError> {
        let open = Element::builder("open", NS_FRAMING)
            .attr("to", self.credentials.domain.as_str())
            .attr("version", "1.0")
            .build();
        write_element(socket, &open).await?;

        let reply = self.read_element(socket).await?;
        if !reply.is("open", NS_FRAMING) {
            return Err(unexpected(&reply));
        }

        let features = self.read_element(socket).await?;
        if !features.is("features", NS_STREAM) {
            return Err(unexpected(&features));
        }
        Ok(features)
    }

    async fn authenticate(
        &self,
        socket: &mut Socket,
        features: &Element,
    ) -> Result<(), ConnectionError> {
        self.emit_status(TransportStatus::Authenticating);

        let offers_plain = features
            .get_child("mechanisms", ns::SASL)
            .is_some_and(|mechanisms| {
                mechanisms
                    .children()
                    .any(|mechanism| mechanism.name() == "mechanism" && mechanism.text() == "PLAIN")
            });
        if !offers_plain {
            return Err(ConnectionError::AuthenticationFailed(
                "server does not offer SASL PLAIN".to_string(),
            ));
        }

        let auth = Element::builder("auth", ns::SASL)
            .attr("mechanism", "PLAIN")
            .append(self.credentials.plain_payload())
            .build();
        write_element(socket, &auth).await?;

        let reply = self.read_element(socket).await?;
        match reply.name() {
            "success" => {
                debug!(user = %self.credentials.username, "sasl authentication succeeded");
                Ok(())
            }
            "failure" => {
                let condition = reply
                    .children()
                    .map(|child| child.name().to_string())
                    .find(|name| name != "text")
                    .unwrap_or_else(|| "failure".to_string());
                Err(ConnectionError::AuthenticationFailed(condition))
            }
            _ => Err(unexpected(&reply)),
        }
    }

    async fn bind(&self, socket: &mut Socket, features: &Element) -> Result<(), ConnectionError> {
        if features.get_child("bind", ns::BIND).is_none() {
            return Err(ConnectionError::Protocol(
                "server offered no resource binding".to_string(),
            ));
        }

        let mut bind = Element::builder("bind", ns::BIND);
        if let Some(resource) = &self.credentials.resource {
            bind = bind.append(
                Element::builder("resource", ns::BIND)
                    .append(resource.as_str())
                    .build(),
            );
        }
        let iq = Element::builder("iq", ns::JABBER_CLIENT)
            .attr("type", "set")
            .attr("id", BIND_ID)
            .append(bind.build())
            .build();
        write_element(socket, &iq).await?;

        loop {
            let reply = self.read_element(socket).await?;
            if reply.name() != "iq" || reply.attr("id") != Some(BIND_ID) {
                debug!(name = reply.name(), "skipping element while binding");
                continue;
            }

            return match reply.attr("type") {
                Some("result") => {
                    let bound = reply
                        .get_child("bind", ns::BIND)
                        .and_then(|bind| bind.get_child("jid", ns::BIND))
                        .map(Element::text)
                        .unwrap_or_default();
                    info!(jid = %bound, "resource bound");
                    Ok(())
                }
                _ => Err(unexpected(&reply)),
            };
        }
    }

    async fn pump(
        &self,
        socket: &mut Socket,
        outbound: &mut mpsc::UnboundedReceiver<Element>,
        close: &mut oneshot::Receiver<()>,
    ) -> Result<(), ConnectionError> {
        loop {
            tokio::select! {
                incoming = next_element(socket) => {
                    let element = incoming?;
                    if element.is("close", NS_FRAMING) {
                        debug!("server closed the stream");
                        return Ok(());
                    }
                    self.emit(TransportEvent::Stanza(element));
                }
                Some(stanza) = outbound.recv() => {
                    write_element(socket, &stanza).await?;
                }
                _ = &mut *close => {
                    self.emit_status(TransportStatus::Disconnecting);
                    let frame = Element::builder("close", NS_FRAMING).build();
                    if let Err(error) = write_element(socket, &frame).await {
                        debug!(error = %error, "failed to send stream close");
                    }
                    let _ = socket.close(None).await;
                    return Ok(());
                }
            }
        }
    }

    async fn read_element(&self, socket: &mut Socket) -> Result<Element, ConnectionError> {
        tokio::time::timeout(self.timeout, next_element(socket))
            .await
            .map_err(|_| ConnectionError::Timeout(self.timeout.as_secs()))?
    }

    fn emit_status(&self, status: TransportStatus) {
        self.emit(TransportEvent::Status(status));
    }

    fn emit(&self, event: TransportEvent) {
        // The connection may already be gone during shutdown.
        let _ = self.events.send(event);
    }
}

async fn next_element(socket: &mut Socket) -> Result<Element, ConnectionError> {
    loop {
        match socket.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                return text
                    .as_str()
                    .parse::<Element>()
                    .map_err(|error| ConnectionError::Protocol(error.to_string()));
            }
            Some(Ok(WsMessage::Close(_))) | None => return Err(ConnectionError::StreamClosed),
            Some(Ok(_)) => continue,
            Some(Err(error)) => return Err(websocket_error(error)),
        }
    }
}

async fn write_element(socket: &mut Socket, element: &Element) -> Result<(), ConnectionError> {
    socket
        .send(WsMessage::text(String::from(element)))
        .await
        .map_err(websocket_error)
}

fn websocket_error(error: tokio_tungstenite::tungstenite::Error) -> ConnectionError {
    ConnectionError::WebSocket(error.to_string())
}

fn unexpected(element: &Element) -> ConnectionError {
    ConnectionError::Protocol(format!("unexpected <{}/>", element.name()))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn credentials_split_jid() {
        let credentials = Credentials::parse("alice@example.org/laptop", "secret").unwrap();
        assert_eq!(credentials.username, "alice");
        assert_eq!(credentials.domain, "example.org");
        assert_eq!(credentials.resource.as_deref(), Some("laptop"));
    }

    #[test]
    fn credentials_require_node() {
        assert_matches!(
            Credentials::parse("example.org", "secret"),
            Err(ConnectionError::InvalidJid(_))
        );
        assert_matches!(
            Credentials::parse("@example.org", "secret"),
            Err(ConnectionError::InvalidJid(_))
        );
    }

    #[test]
    fn plain_payload_encodes_authcid_and_password() {
        let credentials = Credentials::parse("alice@example.org", "secret").unwrap();
        assert_eq!(credentials.plain_payload(), STANDARD.encode("\0alice\0secret"));
    }

    #[test]
    fn send_before_connect_is_not_connected() {
        let (mut transport, _events) = WebSocketTransport::new();
        let stanza = Element::builder("message", ns::JABBER_CLIENT).build();
        assert_matches!(transport.send(stanza), Err(ConnectionError::NotConnected));
        transport.disconnect();
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unreachable_endpoint_reports_connfail_then_disconnected() {
        let (mut transport, mut events) =
            WebSocketTransport::with_timeout(Duration::from_secs(2));
        transport
            .connect("ws://127.0.0.1:1/xmpp-websocket", "alice@example.org", "secret")
            .unwrap();

        let mut statuses = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_secs(5), events.recv()).await
        {
            if let TransportEvent::Status(status) = event {
                statuses.push(status);
                if status == TransportStatus::Disconnected {
                    break;
                }
            }
        }

        assert_eq!(
            statuses,
            vec![
                TransportStatus::Connecting,
                TransportStatus::ConnFail,
                TransportStatus::Disconnected,
            ]
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn connect_twice_is_rejected_while_running() {
        let (mut transport, _events) = WebSocketTransport::with_timeout(Duration::from_secs(1));
        transport
            .connect("ws://127.0.0.1:1/xmpp-websocket", "alice@example.org", "secret")
            .unwrap();
        assert_matches!(
            transport.connect("ws://127.0.0.1:1/xmpp-websocket", "alice@example.org", "secret"),
            Err(ConnectionError::AlreadyConnected)
        );
        transport.disconnect();
    }
}
