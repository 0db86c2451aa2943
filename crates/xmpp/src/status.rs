use serde::{Deserialize, Serialize};

/// Connection status reported by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransportStatus {
    Connecting,
    ConnFail,
    Authenticating,
    AuthFail,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Lifecycle step the connection takes after announcing a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusAction {
    None,
    /// Release the transport; the session cannot recover.
    Disconnect,
    JoinRoom,
    NotifyDisconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusInfo {
    pub label: &'static str,
    pub is_error: bool,
    pub action: StatusAction,
}

pub fn translate(status: TransportStatus) -> StatusInfo {
    let (label, is_error, action) = match status {
        TransportStatus::Connecting => ("Connecting", false, StatusAction::None),
        TransportStatus::ConnFail => ("Connection failed", true, StatusAction::Disconnect),
        TransportStatus::Authenticating => ("Authenticating", false, StatusAction::None),
        TransportStatus::AuthFail => ("Authentication failed", true, StatusAction::Disconnect),
        TransportStatus::Connected => ("Connected", false, StatusAction::JoinRoom),
        TransportStatus::Disconnecting => ("Disconnecting", false, StatusAction::None),
        TransportStatus::Disconnected => ("Disconnected", false, StatusAction::NotifyDisconnected),
    };

    StatusInfo {
        label,
        is_error,
        action,
    }
}

impl std::fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(translate(*self).label)
    }
}
