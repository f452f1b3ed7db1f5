use crate::peer::types::CallId;
use serde::{Serialize, Serializer};
use thiserror::Error;

/// Ошибки сигнального слоя
#[derive(Debug, Error)]
pub enum SignalingError {
    /// Действие невозможно в текущих условиях (нет медиа, нет call id)
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("call record {0} not found")]
    NotFound(CallId),

    /// Описание сессии применяется не по порядку или повторно
    #[error("invalid state: {0}")]
    State(String),

    /// Транспорт отклонил offer/answer
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("store error: {0}")]
    Store(String),

    /// Сбой отправки или применения отдельного кандидата
    #[error("network error: {0}")]
    TransientNetwork(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl SignalingError {
    /// Можно ли предложить пользователю повторить действие
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SignalingError::Store(_)
                | SignalingError::TransientNetwork(_)
                | SignalingError::NotFound(_)
                | SignalingError::Negotiation(_)
        )
    }
}

impl From<webrtc::Error> for SignalingError {
    fn from(e: webrtc::Error) -> Self {
        SignalingError::Negotiation(e.to_string())
    }
}

impl From<reqwest::Error> for SignalingError {
    fn from(e: reqwest::Error) -> Self {
        SignalingError::Store(e.to_string())
    }
}

impl From<serde_json::Error> for SignalingError {
    fn from(e: serde_json::Error) -> Self {
        SignalingError::Store(format!("malformed record: {e}"))
    }
}

impl From<toml::de::Error> for SignalingError {
    fn from(e: toml::de::Error) -> Self {
        SignalingError::Config(e.to_string())
    }
}

impl From<std::io::Error> for SignalingError {
    fn from(e: std::io::Error) -> Self {
        SignalingError::Config(e.to_string())
    }
}

// Tauri передаёт ошибки команд во фронтенд как строки
impl Serialize for SignalingError {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SignalingError>;
