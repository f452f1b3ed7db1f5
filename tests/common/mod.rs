//! Общие заготовки для интеграционных тестов: скриптуемый транспорт и обёртки над хранилищем.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use rendezvous_call_lib::error::{Result, SignalingError};
use rendezvous_call_lib::peer::media::LocalMedia;
use rendezvous_call_lib::peer::transport::{MediaTransport, TransportEvent};
use rendezvous_call_lib::peer::types::{CallId, IceCandidate, SdpKind, SessionDescription};
use rendezvous_call_lib::store::{CallRecord, MemoryStore, RendezvousStore, Side, Subscription};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

pub const WAIT: Duration = Duration::from_secs(3);

pub fn cand(n: u32) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} {} typ host", 40000 + n),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

/// Что транспорт успел сделать, в порядке вызовов
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    AttachMedia(String),
    DetachMedia,
    CreateOffer,
    CreateAnswer,
    SetRemote(SessionDescription),
    AddCandidate(IceCandidate),
    Close,
}

/// Транспорт без сети: отдаёт заранее заданных кандидатов при создании local description
pub struct FakeTransport {
    label: String,
    sink: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    ops: Mutex<Vec<Op>>,
    gathered: Vec<IceCandidate>,
    fail_candidates: AtomicBool,
}

impl FakeTransport {
    pub fn new(label: &str) -> Arc<Self> {
        Self::with_candidates(label, Vec::new())
    }

    pub fn with_candidates(label: &str, gathered: Vec<IceCandidate>) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            sink: Mutex::new(None),
            ops: Mutex::new(Vec::new()),
            gathered,
            fail_candidates: AtomicBool::new(false),
        })
    }

    pub fn offer_sdp(&self) -> String {
        format!("v=0 offer from {}", self.label)
    }

    pub fn answer_sdp(&self) -> String {
        format!("v=0 answer from {}", self.label)
    }

    pub fn emit(&self, event: TransportEvent) {
        if let Some(sink) = self.sink.lock().as_ref() {
            let _ = sink.send(event);
        }
    }

    pub fn fail_candidates(&self, fail: bool) {
        self.fail_candidates.store(fail, Ordering::SeqCst);
    }

    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().clone()
    }

    pub fn count(&self, matches: impl Fn(&Op) -> bool) -> usize {
        self.ops.lock().iter().filter(|op| matches(op)).count()
    }

    pub fn added_candidates(&self) -> Vec<IceCandidate> {
        self.ops
            .lock()
            .iter()
            .filter_map(|op| match op {
                Op::AddCandidate(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.ops
            .lock()
            .iter()
            .filter_map(|op| match op {
                Op::SetRemote(d) => Some(d.clone()),
                _ => None,
            })
            .collect()
    }

    /// Кандидаты, поданные до первого remote description
    pub fn candidates_before_remote(&self) -> usize {
        self.ops
            .lock()
            .iter()
            .take_while(|op| !matches!(op, Op::SetRemote(_)))
            .filter(|op| matches!(op, Op::AddCandidate(_)))
            .count()
    }

    fn record(&self, op: Op) {
        self.ops.lock().push(op);
    }

    fn emit_gathered(&self) {
        for candidate in &self.gathered {
            self.emit(TransportEvent::LocalCandidate(candidate.clone()));
        }
        self.emit(TransportEvent::GatheringComplete);
    }
}

#[async_trait]
impl MediaTransport for FakeTransport {
    fn set_event_sink(&self, sink: mpsc::UnboundedSender<TransportEvent>) {
        *self.sink.lock() = Some(sink);
    }

    async fn attach_media(&self, media: &LocalMedia) -> Result<()> {
        self.record(Op::AttachMedia(media.stream_id.clone()));
        Ok(())
    }

    async fn detach_media(&self) -> Result<()> {
        self.record(Op::DetachMedia);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.record(Op::CreateOffer);
        self.emit_gathered();
        Ok(SessionDescription::offer(self.offer_sdp()))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.record(Op::CreateAnswer);
        self.emit_gathered();
        Ok(SessionDescription::answer(self.answer_sdp()))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        if desc.kind == SdpKind::Offer && !desc.sdp.starts_with("v=0") {
            return Err(SignalingError::Negotiation("malformed offer".into()));
        }
        self.record(Op::SetRemote(desc));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if self.fail_candidates.load(Ordering::SeqCst) {
            return Err(SignalingError::Negotiation("candidate rejected".into()));
        }
        self.record(Op::AddCandidate(candidate));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.record(Op::Close);
        Ok(())
    }
}

/// Хранилище, у которого одна операция (`create_record` по умолчанию) ждёт явного разрешения теста
pub struct GatedStore {
    pub inner: MemoryStore,
    op: &'static str,
    gate: Semaphore,
    entered: AtomicBool,
}

impl GatedStore {
    pub fn new(inner: MemoryStore) -> Arc<Self> {
        Self::gating(inner, "create_record")
    }

    pub fn gating(inner: MemoryStore, op: &'static str) -> Arc<Self> {
        Arc::new(Self {
            inner,
            op,
            gate: Semaphore::new(0),
            entered: AtomicBool::new(false),
        })
    }

    /// Вызов задержанной операции уже ждёт у ворот
    pub fn is_blocked(&self) -> bool {
        self.entered.load(Ordering::SeqCst)
    }

    pub fn release(&self) {
        self.gate.add_permits(1);
    }

    async fn pass(&self, op: &'static str) -> Result<()> {
        if op != self.op {
            return Ok(());
        }
        self.entered.store(true, Ordering::SeqCst);
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| SignalingError::Store(e.to_string()))?;
        permit.forget();
        Ok(())
    }
}

#[async_trait]
impl RendezvousStore for GatedStore {
    async fn create_record(&self, offer: &str) -> Result<CallId> {
        self.pass("create_record").await?;
        self.inner.create_record(offer).await
    }

    async fn fetch_record(&self, id: &CallId) -> Result<CallRecord> {
        self.pass("fetch_record").await?;
        self.inner.fetch_record(id).await
    }

    async fn write_candidates(&self, id: &CallId, side: Side, candidates: Vec<IceCandidate>) -> Result<()> {
        self.inner.write_candidates(id, side, candidates).await
    }

    async fn set_answer(&self, id: &CallId, answer: &str) -> Result<()> {
        self.pass("set_answer").await?;
        self.inner.set_answer(id, answer).await
    }

    async fn subscribe(&self, id: &CallId) -> Result<Subscription> {
        self.inner.subscribe(id).await
    }
}

/// Хранилище, которое отказывает заданное число раз на выбранных операциях
pub struct FlakyStore {
    pub inner: MemoryStore,
    failures: Mutex<HashMap<&'static str, usize>>,
}

impl FlakyStore {
    pub fn new(inner: MemoryStore) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failures: Mutex::new(HashMap::new()),
        })
    }

    pub fn fail_next(&self, op: &'static str, times: usize) {
        self.failures.lock().insert(op, times);
    }

    fn check(&self, op: &'static str) -> Result<()> {
        let mut failures = self.failures.lock();
        match failures.get_mut(op) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Err(SignalingError::Store(format!("{op}: service unavailable")))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl RendezvousStore for FlakyStore {
    async fn create_record(&self, offer: &str) -> Result<CallId> {
        self.check("create_record")?;
        self.inner.create_record(offer).await
    }

    async fn fetch_record(&self, id: &CallId) -> Result<CallRecord> {
        self.check("fetch_record")?;
        self.inner.fetch_record(id).await
    }

    async fn write_candidates(&self, id: &CallId, side: Side, candidates: Vec<IceCandidate>) -> Result<()> {
        self.check("write_candidates")?;
        self.inner.write_candidates(id, side, candidates).await
    }

    async fn set_answer(&self, id: &CallId, answer: &str) -> Result<()> {
        self.check("set_answer")?;
        self.inner.set_answer(id, answer).await
    }

    async fn subscribe(&self, id: &CallId) -> Result<Subscription> {
        self.check("subscribe")?;
        self.inner.subscribe(id).await
    }
}

/// Ждёт, пока условие станет истинным, иначе падает
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Даёт фоновым задачам отработать всё, что уже в очередях
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
