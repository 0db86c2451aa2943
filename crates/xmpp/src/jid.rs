//! String-level JID helpers: `node@domain/resource`.

/// Service prefix used when a bare room name is given.
pub const CONFERENCE_SUBDOMAIN: &str = "conference";

pub fn bare_jid(jid: &str) -> &str {
    match jid.find('/') {
        Some(pos) => &jid[..pos],
        None => jid,
    }
}

pub fn node(jid: &str) -> Option<&str> {
    bare_jid(jid).split_once('@').map(|(node, _)| node)
}

pub fn domain(jid: &str) -> &str {
    let bare = bare_jid(jid);
    match bare.split_once('@') {
        Some((_, domain)) => domain,
        None => bare,
    }
}

/// Everything after the first `/`; resources may themselves contain `/`.
pub fn resource(jid: &str) -> Option<&str> {
    jid.split_once('/').map(|(_, resource)| resource)
}

/// A room with a node part is used as given; a bare name becomes
/// `name@conference.<user domain>`.
pub fn resolve_room_jid(room: &str, user_jid: &str) -> String {
    if node(room).is_some() {
        return room.to_string();
    }
    format!("{room}@{CONFERENCE_SUBDOMAIN}.{}", domain(user_jid))
}
