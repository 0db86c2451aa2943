use std::sync::Arc;

use chrono::{DateTime, Utc};
use minidom::Element;
use tracing::{debug, info, warn};
use uuid::Uuid;

use collab_core::config::ChatConfig;
use collab_core::event::{Channel, ChatLine, Event, EventBus, EventPayload, EventSource};
use collab_core::scheduler::{Scheduler, TickHandle};
use collab_core::session_store::SessionStore;

use crate::error::{ChatError, ConnectionError};
use crate::jid;
use crate::queue::{DelayedMessageQueue, QueuedMessage};
use crate::roster::{ParticipantRoster, RosterChange};
use crate::stanza::{self, RoomStanza};
use crate::status::{StatusAction, TransportStatus, translate};
use crate::transport::{ChatTransport, TransportEvent};

/// Session-store key holding the per-session resource suffix.
pub const RESOURCE_ID_KEY: &str = "webchatid";

/// Resource suffixes are drawn from `0..RESOURCE_ID_RANGE`.
const RESOURCE_ID_RANGE: u128 = 999;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub endpoint: String,
    /// Full room address or a bare room name.
    pub room: String,
    pub jid: String,
    pub password: String,
}

impl From<&ChatConfig> for ConnectionConfig {
    fn from(config: &ChatConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            room: config.room.clone(),
            jid: config.jid.clone(),
            password: config.password.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Open,
    Closed,
}

/// One MUC session: lifecycle, room join, sending and ordered delivery of
/// room traffic onto the event bus.
///
/// The connection is driven from a single event loop: transport events go to
/// [`handle_event`](Self::handle_event) and scheduler ticks to
/// [`on_tick`](Self::on_tick).
pub struct ChatConnection<T, S, K>
where
    T: ChatTransport,
    S: Scheduler,
    K: SessionStore,
{
    config: ConnectionConfig,
    room_jid: String,
    transport: T,
    scheduler: S,
    store: K,
    event_bus: Arc<dyn EventBus>,
    phase: SessionPhase,
    status: Option<TransportStatus>,
    resource: Option<String>,
    /// Room handlers are active.
    joined: bool,
    disconnected_notified: bool,
    roster: ParticipantRoster,
    queue: DelayedMessageQueue,
}

impl<T, S, K> ChatConnection<T, S, K>
where
    T: ChatTransport,
    S: Scheduler,
    K: SessionStore,
{
    pub fn new(
        config: ConnectionConfig,
        transport: T,
        scheduler: S,
        store: K,
        event_bus: Arc<dyn EventBus>,
    ) -> Self {
        let room_jid = jid::resolve_room_jid(&config.room, &config.jid);
        Self {
            config,
            room_jid,
            transport,
            scheduler,
            store,
            event_bus,
            phase: SessionPhase::Idle,
            status: None,
            resource: None,
            joined: false,
            disconnected_notified: false,
            roster: ParticipantRoster::new(),
            queue: DelayedMessageQueue::new(),
        }
    }

    /// Start the session. Progress is published as `chat.connection.status`
    /// events as the transport reports it.
    pub fn open(&mut self) -> Result<(), ChatError> {
        if self.phase != SessionPhase::Idle {
            return Err(ChatError::AlreadyOpened);
        }

        info!(jid = %self.config.jid, room = %self.room_jid, "opening chat session");
        self.phase = SessionPhase::Open;
        if let Err(error) =
            self.transport
                .connect(&self.config.endpoint, &self.config.jid, &self.config.password)
        {
            warn!(error = %error, "transport refused to connect");
            self.handle_status(TransportStatus::ConnFail);
            return Err(error.into());
        }
        Ok(())
    }

    /// Send `text` to the room. There is no local echo; the room reflects the
    /// message back like any other.
    pub fn send(&mut self, text: &str) -> Result<(), ConnectionError> {
        self.transport
            .send(stanza::groupchat_message(&self.room_jid, text))
    }

    /// Tear the session down. Safe to call any number of times; only the
    /// first call reaches the transport.
    pub fn close(&mut self) {
        if self.phase == SessionPhase::Closed {
            return;
        }

        self.phase = SessionPhase::Closed;
        self.joined = false;
        let dropped = self.queue.cancel(&mut self.scheduler);
        if dropped > 0 {
            debug!(count = dropped, "dropping unflushed messages on close");
        }
        info!(room = %self.room_jid, "closing chat session");
        self.transport.disconnect();
    }

    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Status(status) => self.handle_status(status),
            TransportEvent::Stanza(stanza) => self.handle_stanza(&stanza),
        }
    }

    pub fn handle_status(&mut self, status: TransportStatus) {
        let info = translate(status);
        debug!(?status, label = info.label, "transport status changed");
        self.status = Some(status);
        self.emit_event(
            "chat.connection.status",
            EventPayload::StatusChanged {
                is_error: info.is_error,
                label: info.label.to_string(),
            },
        );

        match info.action {
            StatusAction::None => {}
            StatusAction::Disconnect => self.close(),
            StatusAction::JoinRoom => self.join_room(),
            StatusAction::NotifyDisconnected => self.notify_disconnected(),
        }
    }

    pub fn handle_stanza(&mut self, stanza: &Element) {
        if !self.joined {
            debug!(name = stanza.name(), "ignoring stanza before room join");
            return;
        }

        match stanza::classify(stanza, &self.room_jid) {
            Some(RoomStanza::Message {
                sender,
                body,
                delayed_at,
            }) => {
                let timestamp = delayed_at.unwrap_or_else(now_millis);
                self.enqueue(QueuedMessage {
                    timestamp,
                    sender: sender.map(String::from),
                    body,
                });
            }
            Some(RoomStanza::Presence {
                address,
                nick,
                unavailable,
            }) => {
                self.handle_presence(address, nick.to_string(), unavailable);
            }
            None => {}
        }
    }

    /// Deliver a scheduler tick. Ticks other than the pending one are ignored.
    pub fn on_tick(&mut self, tick: TickHandle) {
        let Some(batch) = self.queue.take_batch(tick) else {
            debug!(tick = tick.id(), "ignoring stale tick");
            return;
        };
        self.emit_batch(batch);
    }

    fn emit_batch(&self, batch: Vec<QueuedMessage>) {
        for message in batch {
            let is_self = self.is_self(message.sender.as_deref());
            let line = ChatLine {
                timestamp: DateTime::from_timestamp_millis(message.timestamp)
                    .unwrap_or_else(Utc::now),
                sender: message.sender,
                body: message.body,
                is_self,
            };
            self.emit_event(
                "chat.message.received",
                EventPayload::MessageReceived { message: line },
            );
        }
    }

    /// Whether `sender` is this session's room nick or the local account name.
    pub fn is_self(&self, sender: Option<&str>) -> bool {
        let Some(sender) = sender else {
            return false;
        };
        self.resource.as_deref() == Some(sender) || jid::node(&self.config.jid) == Some(sender)
    }

    pub fn room_jid(&self) -> &str {
        &self.room_jid
    }

    /// Local room nick, known once the room was joined.
    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    pub fn status(&self) -> Option<TransportStatus> {
        self.status
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn roster(&self) -> &ParticipantRoster {
        &self.roster
    }

    pub fn pending_messages(&self) -> usize {
        self.queue.len()
    }

    pub fn is_flush_scheduled(&self) -> bool {
        self.queue.is_scheduled()
    }

    /// The session reported `Disconnected`; nothing more will arrive.
    pub fn is_finished(&self) -> bool {
        self.disconnected_notified
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    pub fn store(&self) -> &K {
        &self.store
    }

    fn handle_presence(&mut self, address: &str, nick: String, unavailable: bool) {
        let text = match self.roster.apply(address, unavailable) {
            RosterChange::Unchanged => {
                debug!(address, "repeated presence for present occupant");
                return;
            }
            RosterChange::Joined => {
                self.emit_event(
                    "chat.participant.joined",
                    EventPayload::ParticipantJoined { name: nick.clone() },
                );
                format!("{nick} has entered the room")
            }
            RosterChange::Left => {
                self.emit_event(
                    "chat.participant.left",
                    EventPayload::ParticipantLeft { name: nick.clone() },
                );
                format!("{nick} has left the room")
            }
        };

        self.enqueue(QueuedMessage {
            timestamp: now_millis(),
            sender: None,
            body: text,
        });
    }

    fn join_room(&mut self) {
        if self.joined || self.phase != SessionPhase::Open {
            debug!("room join skipped");
            return;
        }

        let id = self.resource_id();
        let nick = format!("{}-{id}", jid::node(&self.config.jid).unwrap_or_default());
        self.joined = true;
        self.resource = Some(nick.clone());

        if let Err(error) = self
            .transport
            .send(stanza::muc_join_presence(&self.room_jid, &nick))
        {
            warn!(error = %error, room = %self.room_jid, "failed to send room join presence");
        }

        info!(room = %self.room_jid, nick = %nick, "joined room");
        self.emit_event(
            "chat.connection.connected",
            EventPayload::Connected {
                jid: self.config.jid.clone(),
                room: self.room_jid.clone(),
                nick,
            },
        );
    }

    /// The stored suffix, or a fresh random one that is stored for the rest
    /// of the session.
    fn resource_id(&mut self) -> String {
        if let Some(id) = self.store.get(RESOURCE_ID_KEY) {
            return id;
        }

        let id = (Uuid::new_v4().as_u128() % RESOURCE_ID_RANGE).to_string();
        if let Err(error) = self.store.set(RESOURCE_ID_KEY, &id) {
            warn!(error = %error, "failed to persist resource id");
        }
        id
    }

    fn notify_disconnected(&mut self) {
        if self.disconnected_notified {
            return;
        }

        self.disconnected_notified = true;
        self.joined = false;
        // Traffic that arrived before the server hung up still goes out.
        let batch = self.queue.flush_now(&mut self.scheduler);
        if !batch.is_empty() {
            debug!(count = batch.len(), "flushing queued messages on disconnect");
            self.emit_batch(batch);
        }
        self.roster.clear();
        info!(room = %self.room_jid, "chat session disconnected");
        self.emit_event("chat.connection.disconnected", EventPayload::Disconnected);
    }

    fn enqueue(&mut self, message: QueuedMessage) {
        self.queue.push(message, &mut self.scheduler);
    }

    fn emit_event(&self, channel_name: &str, payload: EventPayload) {
        let Ok(channel) = Channel::new(channel_name) else {
            return;
        };

        let event = Event::new(channel, EventSource::Xmpp, payload);
        if let Err(error) = self.event_bus.publish(event) {
            warn!(error = %error, channel = channel_name, "failed to publish chat event");
        }
    }
}

impl<T, S, K> Drop for ChatConnection<T, S, K>
where
    T: ChatTransport,
    S: Scheduler,
    K: SessionStore,
{
    fn drop(&mut self) {
        if self.phase == SessionPhase::Open {
            self.close();
        }
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
