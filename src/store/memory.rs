use crate::error::{Result, SignalingError};
use crate::peer::types::{CallId, IceCandidate};
use crate::store::{CallRecord, RendezvousStore, Side, Subscription, Unsubscribe};
use crate::utils::random_id;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

const CHANGE_FEED_CAPACITY: usize = 256;

/// Хранилище в памяти процесса. Подходит для тестов и локальной связки двух пиров.
#[derive(Clone)]
pub struct MemoryStore {
    records: Arc<RwLock<HashMap<CallId, CallRecord>>>,
    changes: broadcast::Sender<CallRecord>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            changes: broadcast::channel(CHANGE_FEED_CAPACITY).0,
        }
    }

    /// Снапшот записи без await, для проверок
    pub fn snapshot(&self, id: &CallId) -> Option<CallRecord> {
        self.records.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Повторно рассылает текущий снапшот (дубликат at-least-once доставки)
    pub fn redeliver(&self, id: &CallId) -> bool {
        match self.snapshot(id) {
            Some(record) => {
                let _ = self.changes.send(record);
                true
            }
            None => false,
        }
    }

    fn update<F>(&self, id: &CallId, f: F) -> Result<()>
    where
        F: FnOnce(&mut CallRecord) -> Result<()>,
    {
        let snapshot = {
            let mut records = self.records.write();
            let record = records
                .get_mut(id)
                .ok_or_else(|| SignalingError::NotFound(id.clone()))?;
            f(record)?;
            record.clone()
        };
        // ошибка только если подписчиков нет
        let _ = self.changes.send(snapshot);
        Ok(())
    }
}

#[async_trait]
impl RendezvousStore for MemoryStore {
    async fn create_record(&self, offer: &str) -> Result<CallId> {
        let id = CallId::from(random_id());
        self.records
            .write()
            .insert(id.clone(), CallRecord::new(id.clone(), offer));
        debug!(call_id = %id, "call record created");
        Ok(id)
    }

    async fn fetch_record(&self, id: &CallId) -> Result<CallRecord> {
        self.snapshot(id)
            .ok_or_else(|| SignalingError::NotFound(id.clone()))
    }

    async fn write_candidates(&self, id: &CallId, side: Side, candidates: Vec<IceCandidate>) -> Result<()> {
        self.update(id, |record| {
            *record.candidates_mut(side) = candidates;
            Ok(())
        })
    }

    async fn set_answer(&self, id: &CallId, answer: &str) -> Result<()> {
        self.update(id, |record| {
            if record.answer.is_some() {
                return Err(SignalingError::State(format!(
                    "answer already set for call {}",
                    record.id
                )));
            }
            record.answer = Some(answer.to_string());
            Ok(())
        })
    }

    async fn subscribe(&self, id: &CallId) -> Result<Subscription> {
        if self.snapshot(id).is_none() {
            return Err(SignalingError::NotFound(id.clone()));
        }

        let mut feed = self.changes.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let id = id.clone();
        let records = self.records.clone();

        let task = tokio::spawn(async move {
            loop {
                match feed.recv().await {
                    Ok(record) if record.id == id => {
                        if tx.send(record).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // пропущенные изменения покрываются текущим снапшотом
                        warn!(skipped, call_id = %id, "change feed lagged, resending snapshot");
                        let current = records.read().get(&id).cloned();
                        if let Some(record) = current {
                            if tx.send(record).is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Subscription {
            updates: rx,
            handle: Unsubscribe::new(task),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn cand(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 100 10.0.0.{n} 4000 typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[tokio::test]
    async fn create_and_fetch() {
        let store = MemoryStore::new();
        let id = store.create_record("O1").await.unwrap();
        let record = store.fetch_record(&id).await.unwrap();

        assert_eq!(record.offer.as_deref(), Some("O1"));
        assert!(record.answer.is_none());
        assert!(record.initiator_candidates.is_empty());
        assert!(record.responder_candidates.is_empty());
    }

    #[tokio::test]
    async fn missing_record_is_not_found() {
        let store = MemoryStore::new();
        let id = CallId::from("nope");
        assert!(matches!(store.fetch_record(&id).await, Err(SignalingError::NotFound(_))));
        assert!(matches!(store.set_answer(&id, "A").await, Err(SignalingError::NotFound(_))));
        assert!(matches!(store.subscribe(&id).await, Err(SignalingError::NotFound(_))));
    }

    #[tokio::test]
    async fn answer_is_write_once() {
        let store = MemoryStore::new();
        let id = store.create_record("O1").await.unwrap();
        store.set_answer(&id, "A1").await.unwrap();

        let err = store.set_answer(&id, "A2").await.unwrap_err();
        assert!(matches!(err, SignalingError::State(_)));
        assert_eq!(store.snapshot(&id).unwrap().answer.as_deref(), Some("A1"));
    }

    #[tokio::test]
    async fn append_keeps_order_per_side() {
        let store = MemoryStore::new();
        let id = store.create_record("O1").await.unwrap();
        store.append_candidate(&id, Side::Initiator, cand(1)).await.unwrap();
        store.append_candidate(&id, Side::Initiator, cand(2)).await.unwrap();
        store.append_candidate(&id, Side::Responder, cand(9)).await.unwrap();

        let record = store.snapshot(&id).unwrap();
        assert_eq!(record.initiator_candidates, vec![cand(1), cand(2)]);
        assert_eq!(record.responder_candidates, vec![cand(9)]);
    }

    #[tokio::test]
    async fn subscription_delivers_full_snapshots() {
        let store = MemoryStore::new();
        let id = store.create_record("O1").await.unwrap();
        let other = store.create_record("O2").await.unwrap();
        let mut sub = store.subscribe(&id).await.unwrap();

        store.append_candidate(&other, Side::Initiator, cand(7)).await.unwrap();
        store.append_candidate(&id, Side::Responder, cand(1)).await.unwrap();
        store.append_candidate(&id, Side::Responder, cand(2)).await.unwrap();

        let first = timeout(Duration::from_secs(1), sub.updates.recv()).await.unwrap().unwrap();
        let second = timeout(Duration::from_secs(1), sub.updates.recv()).await.unwrap().unwrap();
        assert_eq!(first.responder_candidates, vec![cand(1)]);
        assert_eq!(second.responder_candidates, vec![cand(1), cand(2)]);

        assert!(store.redeliver(&id));
        let dup = timeout(Duration::from_secs(1), sub.updates.recv()).await.unwrap().unwrap();
        assert_eq!(dup, second);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let store = MemoryStore::new();
        let id = store.create_record("O1").await.unwrap();
        let Subscription { mut updates, handle } = store.subscribe(&id).await.unwrap();

        handle.unsubscribe();
        store.set_answer(&id, "A1").await.unwrap();

        let next = timeout(Duration::from_millis(200), updates.recv()).await;
        assert!(matches!(next, Ok(None)), "channel should close after unsubscribe");
    }
}
