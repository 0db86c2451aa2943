//! Turns terminal input into host requests on the `ui.*` channels.

use std::io::BufRead;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use collab_core::error::EventBusError;
use collab_core::event::{Channel, Event, EventBus, EventPayload, EventSource};

const QUIT_COMMAND: &str = "/quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputCommand {
    Send(String),
    Quit,
}

impl InputCommand {
    /// Blank lines produce nothing.
    pub fn parse(line: &str) -> Option<Self> {
        let text = line.trim_end_matches(['\r', '\n']);
        if text.trim() == QUIT_COMMAND {
            return Some(Self::Quit);
        }
        if text.trim().is_empty() {
            return None;
        }
        Some(Self::Send(text.to_string()))
    }

    fn into_event(self) -> Result<Event, EventBusError> {
        let (channel, payload) = match self {
            Self::Send(text) => ("ui.message.compose", EventPayload::MessageComposed { text }),
            Self::Quit => ("ui.session.close", EventPayload::CloseRequested),
        };
        Ok(Event::new(Channel::new(channel)?, EventSource::Ui, payload))
    }
}

/// Read stdin on a dedicated thread; a blocking read would otherwise hold the
/// runtime open at shutdown.
pub fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (lines, receiver) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if lines.send(line).is_err() {
                break;
            }
        }
    });
    receiver
}

/// Publish each line as a host request. End of input counts as `/quit`.
pub async fn forward(mut lines: mpsc::UnboundedReceiver<String>, event_bus: Arc<dyn EventBus>) {
    while let Some(line) = lines.recv().await {
        let Some(command) = InputCommand::parse(&line) else {
            continue;
        };
        let quit = command == InputCommand::Quit;
        publish(&event_bus, command);
        if quit {
            return;
        }
    }

    debug!("input closed");
    publish(&event_bus, InputCommand::Quit);
}

fn publish(event_bus: &Arc<dyn EventBus>, command: InputCommand) {
    let published = command
        .into_event()
        .and_then(|event| event_bus.publish(event));
    if let Err(error) = published {
        warn!(error = %error, "failed to publish input");
    }
}
