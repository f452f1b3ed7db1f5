//! Общая запись звонка и клиент хранилища, через которое пиры обмениваются сигналами.

pub mod memory;
pub mod postgrest;

use crate::error::Result;
use crate::peer::types::{CallId, IceCandidate, Role};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use memory::MemoryStore;
pub use postgrest::PostgrestStore;

/// Запись звонка: единственный общий ресурс двух пиров
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub id: CallId,
    pub offer: Option<String>,
    pub answer: Option<String>,
    #[serde(default)]
    pub initiator_candidates: Vec<IceCandidate>,
    #[serde(default)]
    pub responder_candidates: Vec<IceCandidate>,
}

impl CallRecord {
    pub fn new(id: CallId, offer: impl Into<String>) -> Self {
        CallRecord {
            id,
            offer: Some(offer.into()),
            answer: None,
            initiator_candidates: Vec::new(),
            responder_candidates: Vec::new(),
        }
    }

    pub fn candidates(&self, side: Side) -> &[IceCandidate] {
        match side {
            Side::Initiator => &self.initiator_candidates,
            Side::Responder => &self.responder_candidates,
        }
    }

    pub fn candidates_mut(&mut self, side: Side) -> &mut Vec<IceCandidate> {
        match side {
            Side::Initiator => &mut self.initiator_candidates,
            Side::Responder => &mut self.responder_candidates,
        }
    }
}

/// Чья последовательность кандидатов
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Initiator,
    Responder,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Initiator => Side::Responder,
            Side::Responder => Side::Initiator,
        }
    }
}

impl From<Role> for Side {
    fn from(role: Role) -> Self {
        match role {
            Role::Initiator => Side::Initiator,
            Role::Responder => Side::Responder,
        }
    }
}

/// Подписка на изменения одной записи.
///
/// Каждое уведомление несёт запись целиком. Доставка at-least-once, так что
/// один и тот же снапшот может прийти несколько раз.
pub struct Subscription {
    pub updates: mpsc::UnboundedReceiver<CallRecord>,
    pub handle: Unsubscribe,
}

/// Останавливает фоновую доставку. Срабатывает и при drop.
pub struct Unsubscribe(Option<JoinHandle<()>>);

impl Unsubscribe {
    pub fn new(task: JoinHandle<()>) -> Self {
        Unsubscribe(Some(task))
    }

    pub fn unsubscribe(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(task) = self.0.take() {
            task.abort();
        }
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.stop();
    }
}

#[async_trait]
pub trait RendezvousStore: Send + Sync {
    /// Создаёт запись с offer и пустыми списками кандидатов
    async fn create_record(&self, offer: &str) -> Result<CallId>;

    /// `SignalingError::NotFound`, если записи нет
    async fn fetch_record(&self, id: &CallId) -> Result<CallRecord>;

    /// Перезаписывает всю последовательность кандидатов одной стороны
    async fn write_candidates(&self, id: &CallId, side: Side, candidates: Vec<IceCandidate>) -> Result<()>;

    /// Записывает answer. Повторная запись отклоняется.
    async fn set_answer(&self, id: &CallId, answer: &str) -> Result<()>;

    async fn subscribe(&self, id: &CallId) -> Result<Subscription>;

    /// Read-modify-write без транзакции: два параллельных писателя одной стороны
    /// могут потерять обновление. Вызывающий сам сериализует свои добавления.
    async fn append_candidate(&self, id: &CallId, side: Side, candidate: IceCandidate) -> Result<()> {
        let record = self.fetch_record(id).await?;
        let mut current = record.candidates(side).to_vec();
        current.push(candidate);
        self.write_candidates(id, side, current).await
    }
}
