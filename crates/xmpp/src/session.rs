use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use collab_core::error::EventBusError;
use collab_core::event::{Channel, Event, EventBus, EventPayload, EventSource, EventSubscription};
use collab_core::scheduler::{Scheduler, TickHandle};
use collab_core::session_store::SessionStore;

use crate::connection::ChatConnection;
use crate::error::ChatError;
use crate::transport::{ChatTransport, TransportEvent};

/// Host requests arrive on these channels.
const HOST_PATTERN: &str = "ui.**";

/// Transport events handled in a row before a ready flush tick gets a turn.
pub const MAX_EVENTS_BEFORE_TICK: usize = 64;

/// Single-task driver for a [`ChatConnection`].
///
/// Transport events, scheduler ticks and host requests are handled one at a
/// time, transport traffic first, so a flush tick only runs once the burst it
/// was scheduled for has been read. Under sustained traffic a ready tick is
/// let through after [`MAX_EVENTS_BEFORE_TICK`] transport events.
pub struct ChatSession<T, S, K>
where
    T: ChatTransport,
    S: Scheduler,
    K: SessionStore,
{
    connection: ChatConnection<T, S, K>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ticks: mpsc::UnboundedReceiver<TickHandle>,
    host_events: EventSubscription,
    event_bus: Arc<dyn EventBus>,
}

impl<T, S, K> ChatSession<T, S, K>
where
    T: ChatTransport,
    S: Scheduler,
    K: SessionStore,
{
    pub fn new(
        connection: ChatConnection<T, S, K>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        ticks: mpsc::UnboundedReceiver<TickHandle>,
        event_bus: Arc<dyn EventBus>,
    ) -> Result<Self, ChatError> {
        let host_events = event_bus.subscribe(HOST_PATTERN)?;
        Ok(Self {
            connection,
            transport_events,
            ticks,
            host_events,
            event_bus,
        })
    }

    /// Open the connection and drive it until the transport reports
    /// `Disconnected` or goes away.
    ///
    /// When `shutdown` resolves the connection is closed once and the loop
    /// keeps draining until the transport finishes. The connection is handed
    /// back for inspection.
    pub async fn run(
        mut self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<ChatConnection<T, S, K>, ChatError> {
        self.connection.open()?;
        tokio::pin!(shutdown);

        let mut unloading = false;
        let mut host_open = true;
        let mut streak = 0;
        while !self.connection.is_finished() {
            tokio::select! {
                biased;

                _ = &mut shutdown, if !unloading => {
                    info!("shutdown requested, closing chat session");
                    unloading = true;
                    self.connection.close();
                }
                Some(tick) = self.ticks.recv(), if streak >= MAX_EVENTS_BEFORE_TICK => {
                    debug!(streak, "flushing during sustained transport traffic");
                    streak = 0;
                    self.connection.on_tick(tick);
                }
                event = self.transport_events.recv() => match event {
                    Some(event) => {
                        streak += 1;
                        self.connection.handle_event(event);
                    }
                    None => {
                        debug!("transport event channel closed");
                        break;
                    }
                },
                Some(tick) = self.ticks.recv() => {
                    streak = 0;
                    self.connection.on_tick(tick);
                }
                request = self.host_events.recv(), if host_open => match request {
                    Ok(event) => self.handle_host_event(event),
                    Err(EventBusError::Lagged(count)) => {
                        warn!(count, "host requests were dropped");
                    }
                    Err(error) => {
                        warn!(error = %error, "host request channel closed");
                        host_open = false;
                    }
                },
            }
        }

        info!(room = %self.connection.room_jid(), "chat session finished");
        Ok(self.connection)
    }

    fn handle_host_event(&mut self, event: Event) {
        match event.payload {
            EventPayload::MessageComposed { text } => {
                if let Err(error) = self.connection.send(&text) {
                    warn!(error = %error, "failed to send chat message");
                    self.emit_error(error.to_string());
                }
            }
            EventPayload::CloseRequested => self.connection.close(),
            other => debug!(channel = %event.channel, ?other, "ignoring host event"),
        }
    }

    fn emit_error(&self, message: String) {
        let Ok(channel) = Channel::new("system.error.occurred") else {
            return;
        };

        let event = Event::new(
            channel,
            EventSource::System("chat".into()),
            EventPayload::ErrorOccurred {
                component: "chat".to_string(),
                message,
                recoverable: true,
            },
        );
        if let Err(error) = self.event_bus.publish(event) {
            warn!(error = %error, "failed to publish error event");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use minidom::Element;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    use collab_core::event::BroadcastEventBus;
    use collab_core::scheduler::{ManualScheduler, TokioScheduler};
    use collab_core::session_store::MemorySessionStore;

    use super::*;
    use crate::connection::{ConnectionConfig, SessionPhase};
    use crate::error::ConnectionError;
    use crate::status::TransportStatus;

    const ROOM: &str = "lobby@conference.example.org";

    /// Reports status through the same channel a real transport would and
    /// records outbound stanzas.
    struct LoopbackTransport {
        events: mpsc::UnboundedSender<TransportEvent>,
        sent: Vec<Element>,
        disconnects: u32,
        reject_sends: bool,
    }

    impl ChatTransport for LoopbackTransport {
        fn connect(&mut self, _: &str, _: &str, _: &str) -> Result<(), ConnectionError> {
            let _ = self
                .events
                .send(TransportEvent::Status(TransportStatus::Connecting));
            Ok(())
        }

        fn disconnect(&mut self) {
            self.disconnects += 1;
            let _ = self
                .events
                .send(TransportEvent::Status(TransportStatus::Disconnected));
        }

        fn send(&mut self, stanza: Element) -> Result<(), ConnectionError> {
            if self.reject_sends {
                return Err(ConnectionError::NotConnected);
            }
            self.sent.push(stanza);
            Ok(())
        }
    }

    fn setup(reject_sends: bool) -> (
        ChatSession<LoopbackTransport, TokioScheduler, MemorySessionStore>,
        mpsc::UnboundedSender<TransportEvent>,
        Arc<dyn EventBus>,
    ) {
        let event_bus: Arc<dyn EventBus> = Arc::new(BroadcastEventBus::default());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (scheduler, ticks) = TokioScheduler::new();
        let transport = LoopbackTransport {
            events: events_tx.clone(),
            sent: Vec::new(),
            disconnects: 0,
            reject_sends,
        };
        let connection = ChatConnection::new(
            ConnectionConfig {
                endpoint: "ws://localhost:5280/ws".to_string(),
                room: ROOM.to_string(),
                jid: "alice@example.org".to_string(),
                password: "secret".to_string(),
            },
            transport,
            scheduler,
            MemorySessionStore::new(),
            event_bus.clone(),
        );
        let session = ChatSession::new(connection, events_rx, ticks, event_bus.clone()).unwrap();
        (session, events_tx, event_bus)
    }

    fn room_message(body: &str, stamp: &str) -> TransportEvent {
        let stanza: Element = format!(
            "<message xmlns='jabber:client' from='{ROOM}/bob' type='groupchat'>\
             <body>{body}</body><delay xmlns='urn:xmpp:delay' stamp='{stamp}'/></message>"
        )
        .parse()
        .unwrap();
        TransportEvent::Stanza(stanza)
    }

    fn publish(event_bus: &Arc<dyn EventBus>, channel: &str, payload: EventPayload) {
        event_bus
            .publish(Event::new(
                Channel::new(channel).unwrap(),
                EventSource::Ui,
                payload,
            ))
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_closes_once_and_finishes() {
        let (session, _events, _bus) = setup(false);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        shutdown_tx.send(()).unwrap();

        let connection = timeout(
            Duration::from_secs(1),
            session.run(async {
                let _ = shutdown_rx.await;
            }),
        )
        .await
        .expect("session should finish")
        .unwrap();

        assert_eq!(connection.transport().disconnects, 1);
        assert_eq!(connection.phase(), SessionPhase::Closed);
        assert!(connection.is_finished());
    }

    #[tokio::test]
    async fn composed_message_is_sent_to_room() {
        let (session, events, event_bus) = setup(false);
        let mut connected = event_bus.subscribe("chat.connection.connected").unwrap();
        let handle = tokio::spawn(session.run(std::future::pending()));

        events
            .send(TransportEvent::Status(TransportStatus::Connected))
            .unwrap();
        timeout(Duration::from_secs(1), connected.recv())
            .await
            .expect("room should be joined")
            .unwrap();

        publish(
            &event_bus,
            "ui.message.compose",
            EventPayload::MessageComposed {
                text: "hi all".to_string(),
            },
        );
        publish(&event_bus, "ui.session.close", EventPayload::CloseRequested);

        let connection = timeout(Duration::from_secs(1), handle)
            .await
            .expect("session should finish")
            .unwrap()
            .unwrap();

        let sent = &connection.transport().sent;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].name(), "presence");
        assert_eq!(sent[1].name(), "message");
        assert_eq!(sent[1].attr("to"), Some(ROOM));
        assert_eq!(connection.transport().disconnects, 1);
    }

    #[tokio::test]
    async fn send_failure_is_reported_on_the_bus() {
        let (session, events, event_bus) = setup(true);
        let mut errors = event_bus.subscribe("system.error.*").unwrap();
        let handle = tokio::spawn(session.run(std::future::pending()));

        events
            .send(TransportEvent::Status(TransportStatus::Connected))
            .unwrap();
        publish(
            &event_bus,
            "ui.message.compose",
            EventPayload::MessageComposed {
                text: "lost".to_string(),
            },
        );

        let event = timeout(Duration::from_secs(1), errors.recv())
            .await
            .expect("timed out waiting for error")
            .unwrap();
        assert_matches!(
            event.payload,
            EventPayload::ErrorOccurred { component, recoverable: true, .. } if component == "chat"
        );

        publish(&event_bus, "ui.session.close", EventPayload::CloseRequested);
        let connection = timeout(Duration::from_secs(1), handle)
            .await
            .expect("session should finish")
            .unwrap()
            .unwrap();
        assert!(connection.is_finished());
        assert_eq!(connection.transport().disconnects, 1);
    }

    #[tokio::test]
    async fn history_burst_is_rendered_in_order() {
        let (session, events, event_bus) = setup(false);
        let mut messages = event_bus.subscribe("chat.message.received").unwrap();
        let handle = tokio::spawn(session.run(std::future::pending()));

        events
            .send(TransportEvent::Status(TransportStatus::Connected))
            .unwrap();
        for (body, stamp) in [
            ("third", "2024-05-01T10:00:03Z"),
            ("first", "2024-05-01T10:00:01Z"),
            ("second", "2024-05-01T10:00:02Z"),
        ] {
            let stanza: Element = format!(
                "<message xmlns='jabber:client' from='{ROOM}/bob' type='groupchat'>\
                 <body>{body}</body><delay xmlns='urn:xmpp:delay' stamp='{stamp}'/></message>"
            )
            .parse()
            .unwrap();
            events.send(TransportEvent::Stanza(stanza)).unwrap();
        }

        let mut bodies = Vec::new();
        for _ in 0..3 {
            let event = timeout(Duration::from_secs(1), messages.recv())
                .await
                .expect("timed out waiting for message")
                .unwrap();
            if let EventPayload::MessageReceived { message } = event.payload {
                bodies.push(message.body);
            }
        }
        assert_eq!(bodies, vec!["first", "second", "third"]);

        publish(&event_bus, "ui.session.close", EventPayload::CloseRequested);
        timeout(Duration::from_secs(1), handle)
            .await
            .expect("session should finish")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn server_disconnect_delivers_queued_history() {
        let (session, events, event_bus) = setup(false);
        let mut chat = event_bus.subscribe("chat.**").unwrap();
        events
            .send(TransportEvent::Status(TransportStatus::Connected))
            .unwrap();
        events
            .send(room_message("last words", "2024-05-01T10:00:00Z"))
            .unwrap();
        events
            .send(TransportEvent::Status(TransportStatus::Disconnected))
            .unwrap();

        let connection = timeout(Duration::from_secs(1), session.run(std::future::pending()))
            .await
            .expect("session should finish")
            .unwrap();
        assert!(connection.is_finished());
        assert_eq!(connection.pending_messages(), 0);
        assert!(!connection.is_flush_scheduled());

        let mut bodies = Vec::new();
        loop {
            let event = timeout(Duration::from_secs(1), chat.recv())
                .await
                .expect("timed out waiting for disconnect")
                .unwrap();
            match event.payload {
                EventPayload::MessageReceived { message } => bodies.push(message.body),
                EventPayload::Disconnected => break,
                _ => {}
            }
        }
        assert_eq!(bodies, vec!["last words"]);
    }

    #[tokio::test]
    async fn sustained_traffic_does_not_starve_flush() {
        let event_bus: Arc<dyn EventBus> = Arc::new(BroadcastEventBus::default());
        let mut messages = event_bus.subscribe("chat.message.received").unwrap();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ticks_tx, ticks_rx) = mpsc::unbounded_channel();
        let transport = LoopbackTransport {
            events: events_tx.clone(),
            sent: Vec::new(),
            disconnects: 0,
            reject_sends: false,
        };
        let connection = ChatConnection::new(
            ConnectionConfig {
                endpoint: "ws://localhost:5280/ws".to_string(),
                room: ROOM.to_string(),
                jid: "alice@example.org".to_string(),
                password: "secret".to_string(),
            },
            transport,
            ManualScheduler::new(),
            MemorySessionStore::new(),
            event_bus.clone(),
        );
        let session = ChatSession::new(connection, events_rx, ticks_rx, event_bus.clone()).unwrap();

        // Everything is already queued when the loop starts, so the transport
        // branch is always ready. Stamps run backwards so each batch starts
        // with its newest arrival.
        events_tx
            .send(TransportEvent::Status(TransportStatus::Connected))
            .unwrap();
        for n in 0..100u32 {
            let seconds = 99 - n;
            let stamp = format!("2024-05-01T10:{:02}:{:02}Z", seconds / 60, seconds % 60);
            events_tx
                .send(room_message(&format!("m{n}"), &stamp))
                .unwrap();
        }
        ticks_tx.send(TickHandle::new(1)).unwrap();
        ticks_tx.send(TickHandle::new(2)).unwrap();
        publish(&event_bus, "ui.session.close", EventPayload::CloseRequested);

        let connection = timeout(Duration::from_secs(1), session.run(std::future::pending()))
            .await
            .expect("session should finish")
            .unwrap();
        assert_eq!(connection.scheduler().scheduled().len(), 2);

        let mut bodies = Vec::new();
        while let Ok(Ok(event)) = timeout(Duration::from_millis(50), messages.recv()).await {
            if let EventPayload::MessageReceived { message } = event.payload {
                bodies.push(message.body);
            }
        }
        assert_eq!(bodies.len(), 100);
        // Connected plus m0..m62 fill the first run of events.
        let first_batch = MAX_EVENTS_BEFORE_TICK - 1;
        assert_eq!(bodies[0], format!("m{}", first_batch - 1));
        assert_eq!(bodies[first_batch - 1], "m0");
        assert_eq!(bodies[first_batch], "m99");
    }
}
