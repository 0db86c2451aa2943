//! Building outbound MUC stanzas and reading the parts of inbound ones the
//! connection cares about.

use chrono::NaiveDateTime;
use minidom::Element;
use tracing::debug;
use xmpp_parsers::ns;

use crate::jid;

/// Length of `YYYY-MM-DDTHH:MM:SS`.
const STAMP_SECONDS_LEN: usize = 19;

/// What a room handler sees of an inbound stanza.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomStanza<'a> {
    Message {
        /// Room nick of the author; `None` when the room itself speaks.
        sender: Option<&'a str>,
        body: String,
        /// Epoch millis from a `urn:xmpp:delay` annotation.
        delayed_at: Option<i64>,
    },
    Presence {
        /// Full occupant address.
        address: &'a str,
        nick: &'a str,
        unavailable: bool,
    },
}

/// Match an inbound stanza against the room handlers.
///
/// Only stanzas from the room (compared on the bare address) are handled, and
/// messages without a body are dropped.
pub fn classify<'a>(stanza: &'a Element, room_jid: &str) -> Option<RoomStanza<'a>> {
    let from = stanza.attr("from")?;
    if jid::bare_jid(from) != room_jid {
        debug!(from, room = room_jid, "ignoring stanza from outside the room");
        return None;
    }

    match stanza.name() {
        "message" => Some(RoomStanza::Message {
            sender: jid::resource(from),
            body: body_text(stanza)?,
            delayed_at: delay_timestamp(stanza),
        }),
        "presence" => {
            // Presence from the bare room address (errors, room status) has
            // no occupant behind it.
            let Some(nick) = jid::resource(from).filter(|nick| !nick.is_empty()) else {
                debug!(from, "ignoring presence without an occupant nick");
                return None;
            };
            Some(RoomStanza::Presence {
                address: from,
                nick,
                unavailable: is_unavailable(stanza),
            })
        }
        _ => None,
    }
}

pub fn groupchat_message(room_jid: &str, text: &str) -> Element {
    Element::builder("message", ns::JABBER_CLIENT)
        .attr("to", room_jid)
        .attr("type", "groupchat")
        .append(Element::builder("body", ns::JABBER_CLIENT).append(text).build())
        .build()
}

/// Presence to `room/nick` carrying the MUC marker, which joins the room.
pub fn muc_join_presence(room_jid: &str, nick: &str) -> Element {
    Element::builder("presence", ns::JABBER_CLIENT)
        .attr("to", format!("{room_jid}/{nick}"))
        .append(Element::builder("x", ns::MUC).build())
        .build()
}

/// Text of the first `body` child.
pub fn body_text(message: &Element) -> Option<String> {
    message
        .children()
        .find(|child| child.name() == "body")
        .map(Element::text)
}

/// Timestamp of the last well-formed delay annotation, in epoch millis.
pub fn delay_timestamp(stanza: &Element) -> Option<i64> {
    stanza
        .children()
        .filter(|child| child.is("delay", ns::DELAY))
        .filter_map(|delay| delay.attr("stamp"))
        .filter_map(parse_stamp)
        .last()
}

/// Parse `YYYY-MM-DDTHH:MM:SS[.fraction]Z` as UTC epoch millis.
///
/// Fractions finer than a millisecond are truncated. Other offsets than `Z`
/// are not accepted.
pub fn parse_stamp(stamp: &str) -> Option<i64> {
    let stamp = stamp.strip_suffix('Z')?;
    let (seconds, fraction) = stamp.split_once('.').unwrap_or((stamp, ""));
    if seconds.len() != STAMP_SECONDS_LEN || !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let naive = NaiveDateTime::parse_from_str(seconds, "%Y-%m-%dT%H:%M:%S").ok()?;
    let millis: i64 = fraction
        .chars()
        .chain(std::iter::repeat('0'))
        .take(3)
        .collect::<String>()
        .parse()
        .ok()?;

    Some(naive.and_utc().timestamp_millis() + millis)
}

pub fn is_unavailable(presence: &Element) -> bool {
    presence.attr("type") == Some("unavailable")
}
