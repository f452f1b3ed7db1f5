use crate::peer::media::RemoteStream;
use crate::peer::types::{CallId, ConnectionState, Role};
use serde::{Deserialize, Serialize};

/// Фазы координатора: Idle → RoleSelected → RecordBound → Negotiating → Connected → Ended
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CallPhase {
    Idle,
    RoleSelected(Role),
    RecordBound,
    Negotiating,
    Connected,
    Ended,
}

impl CallPhase {
    pub fn is_ended(self) -> bool {
        self == CallPhase::Ended
    }
}

/// Снимок состояния звонка для UI
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallStatus {
    pub phase: CallPhase,
    pub role: Option<Role>,
    pub call_id: Option<CallId>,
    pub connection: ConnectionState,
    pub remote_stream: Option<RemoteStream>,
    pub media_ready: bool,
    pub last_error: Option<String>,
    /// unix-время снимка
    pub updated_at: Option<i64>,
}

impl Default for CallStatus {
    fn default() -> Self {
        Self {
            phase: CallPhase::Idle,
            role: None,
            call_id: None,
            connection: ConnectionState::New,
            remote_stream: None,
            media_ready: false,
            last_error: None,
            updated_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_for_the_webview() {
        let status = CallStatus {
            phase: CallPhase::RoleSelected(Role::Initiator),
            role: Some(Role::Initiator),
            call_id: Some(CallId::from("abc")),
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["phase"]["role-selected"], "initiator");
        assert_eq!(json["role"], "initiator");
        assert_eq!(json["callId"], "abc");
        assert_eq!(json["connection"], "new");

        let idle = serde_json::to_value(CallStatus::default()).unwrap();
        assert_eq!(idle["phase"], "idle");
    }
}
