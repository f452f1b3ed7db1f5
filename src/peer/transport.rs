use crate::error::Result;
use crate::peer::media::{LocalMedia, RemoteStream};
use crate::peer::types::{ConnectionState, IceCandidate, SessionDescription};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// События транспорта. Доставляются по одному через канал, без реентрантности.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Найден новый локальный сетевой путь
    LocalCandidate(IceCandidate),
    /// Сбор кандидатов завершён (null candidate)
    GatheringComplete,
    ConnectionState(ConnectionState),
    RemoteTrack(RemoteStream),
}

/// Локальный медиа-транспорт (обёртка над peer connection).
///
/// `create_offer` и `create_answer` сразу устанавливают результат как local description.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Регистрирует единственного слушателя событий. Повторный вызов заменяет слушателя.
    fn set_event_sink(&self, sink: mpsc::UnboundedSender<TransportEvent>);

    async fn attach_media(&self, media: &LocalMedia) -> Result<()>;

    async fn detach_media(&self) -> Result<()>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
