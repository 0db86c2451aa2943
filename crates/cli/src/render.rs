//! Prints chat events to stdout.

use std::fmt::Display;

use chrono::TimeZone;
use tracing::warn;

use collab_core::error::EventBusError;
use collab_core::event::{ChatLine, Event, EventPayload, EventSubscription};

/// One line of terminal output for `event`, or `None` when the event has no
/// visible form.
pub fn render_event<Tz>(event: &Event, tz: &Tz) -> Option<String>
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    match &event.payload {
        EventPayload::StatusChanged { is_error: true, label } => Some(format!("!! {label}")),
        EventPayload::StatusChanged { label, .. } => Some(format!("-- {label}")),
        EventPayload::Connected { room, nick, .. } => {
            Some(format!("-- joined {room} as {nick}"))
        }
        EventPayload::Disconnected => Some("-- session ended".to_string()),
        EventPayload::MessageReceived { message } => Some(render_line(message, tz)),
        _ => None,
    }
}

pub fn render_line<Tz>(line: &ChatLine, tz: &Tz) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let time = line.timestamp.with_timezone(tz).format("%H:%M:%S");
    match &line.sender {
        Some(sender) if line.is_self => format!("[{time}] <{sender}> (you) {}", line.body),
        Some(sender) => format!("[{time}] <{sender}> {}", line.body),
        None => format!("[{time}] * {}", line.body),
    }
}

/// Print events until the session reports it has ended.
pub async fn run(mut subscription: EventSubscription) {
    loop {
        match subscription.recv().await {
            Ok(event) => {
                if let Some(line) = render_event(&event, &chrono::Local) {
                    println!("{line}");
                }
                if matches!(event.payload, EventPayload::Disconnected) {
                    break;
                }
            }
            Err(EventBusError::Lagged(count)) => {
                warn!(count, "renderer fell behind, events skipped");
            }
            Err(_) => break,
        }
    }
}
