//! Координатор сигнализации: роли, обмен offer/answer и кандидатами через общую запись.
//!
//! Состояние координатора живёт под синхронным мьютексом, который никогда не
//! удерживается через `.await`. Каждая секция под ним соответствует одному
//! дискретному событию, поэтому обработчики не выполняются одновременно.
//! Фоновые задачи (события транспорта, уведомления хранилища, отправка
//! кандидатов) держат только `Weak` и после каждого await проверяют, не
//! завершён ли звонок.

use crate::config::SignalingConfig;
use crate::error::{Result, SignalingError};
use crate::peer::connection::WebrtcTransport;
use crate::peer::ice::{CandidateBuffer, RemoteCandidateDedup};
use crate::peer::media::{LocalMedia, RemoteStream};
use crate::peer::negotiator::SessionNegotiator;
use crate::peer::transport::{MediaTransport, TransportEvent};
use crate::peer::types::{
    CallId, ConnectionState, IceCandidate, NegotiationState, Role, SessionDescription,
};
use crate::session::{CallPhase, CallStatus};
use crate::store::{CallRecord, RendezvousStore, Side, Subscription, Unsubscribe};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct Core {
    phase: CallPhase,
    call_id: Option<CallId>,
    connection: ConnectionState,
    /// исходящие кандидаты до появления call id
    outgoing: CandidateBuffer,
    /// очередь единственного отправителя кандидатов в хранилище
    outbox: Option<mpsc::UnboundedSender<IceCandidate>>,
    dedup: RemoteCandidateDedup,
    /// удалённые кандидаты, пришедшие раньше remote description
    pending_remote: Vec<IceCandidate>,
    remote_ready: bool,
    media: Option<LocalMedia>,
    subscription: Option<Unsubscribe>,
    remote_stream: Option<RemoteStream>,
    last_error: Option<String>,
    /// выполняется start_call или join_call
    action_in_flight: bool,
    tasks: Vec<JoinHandle<()>>,
}

struct Shared {
    negotiator: SessionNegotiator,
    store: Arc<dyn RendezvousStore>,
    core: Mutex<Core>,
    status: watch::Sender<CallStatus>,
}

/// Сигнальная часть одного пира. Один экземпляр обслуживает один звонок.
pub struct SignalingCoordinator {
    shared: Arc<Shared>,
}

impl SignalingCoordinator {
    /// Должен вызываться внутри tokio runtime: запускает обработчик событий транспорта
    pub fn new(transport: Arc<dyn MediaTransport>, store: Arc<dyn RendezvousStore>) -> Self {
        let negotiator = SessionNegotiator::new(transport);
        let events = negotiator.take_events();

        let shared = Arc::new(Shared {
            negotiator,
            store,
            core: Mutex::new(Core {
                phase: CallPhase::Idle,
                call_id: None,
                connection: ConnectionState::New,
                outgoing: CandidateBuffer::new(),
                outbox: None,
                dedup: RemoteCandidateDedup::new(),
                pending_remote: Vec::new(),
                remote_ready: false,
                media: None,
                subscription: None,
                remote_stream: None,
                last_error: None,
                action_in_flight: false,
                tasks: Vec::new(),
            }),
            status: watch::channel(CallStatus::default()).0,
        });

        if let Some(rx) = events {
            let pump = spawn_event_pump(Arc::downgrade(&shared), rx);
            shared.core.lock().tasks.push(pump);
        }

        Self { shared }
    }

    /// Координатор поверх настоящего WebRTC транспорта
    pub async fn with_webrtc(
        config: &SignalingConfig,
        store: Arc<dyn RendezvousStore>,
    ) -> Result<(Self, Arc<WebrtcTransport>)> {
        config.validate()?;
        let transport = Arc::new(WebrtcTransport::new(&config.ice_servers).await?);
        let coordinator = Self::new(transport.clone(), store);
        Ok((coordinator, transport))
    }

    /// UI сообщил, что локальные камера/микрофон захвачены
    pub async fn media_started(&self, media: LocalMedia) -> Result<()> {
        self.shared.ensure_live()?;
        self.shared.negotiator.attach_media(&media).await?;

        let mut core = self.shared.core.lock();
        info!(stream = %media.stream_id, tracks = media.tracks.len(), "local media ready");
        core.media = Some(media);
        self.shared.publish(&core);
        Ok(())
    }

    /// UI остановил захват
    pub async fn media_stopped(&self) -> Result<()> {
        self.shared.negotiator.release_media().await?;

        let mut core = self.shared.core.lock();
        if core.media.take().is_some() {
            info!("local media released");
        }
        self.shared.publish(&core);
        Ok(())
    }

    /// Сторона A: создаёт offer и запись звонка. Возвращает id для передачи собеседнику.
    ///
    /// После ошибки хранилища вызов можно повторить: уже созданный offer и запись
    /// переиспользуются, роль не меняется.
    pub async fn start_call(&self) -> Result<CallId> {
        let shared = &self.shared;
        let _action = shared.begin_action()?;

        let bound_id = {
            let mut core = shared.core.lock();
            match core.phase {
                CallPhase::Idle => {
                    require_media(&core)?;
                    shared.negotiator.assign_role(Role::Initiator)?;
                    core.phase = CallPhase::RoleSelected(Role::Initiator);
                    info!("role selected: initiator");
                    shared.publish(&core);
                    None
                }
                CallPhase::RoleSelected(Role::Initiator) => {
                    require_media(&core)?;
                    None
                }
                CallPhase::RecordBound
                    if shared.negotiator.role() == Some(Role::Initiator)
                        && core.subscription.is_none() =>
                {
                    core.call_id.clone()
                }
                phase => {
                    return Err(SignalingError::State(format!(
                        "cannot start a call while {phase:?}"
                    )))
                }
            }
        };

        let id = match bound_id {
            Some(id) => id,
            None => {
                let offer = match shared.negotiator.local_description().await {
                    Some(offer) => offer,
                    None => shared
                        .negotiator
                        .create_local_offer()
                        .await
                        .map_err(|e| shared.fail(e))?,
                };
                shared.ensure_live()?;

                let id = shared
                    .store
                    .create_record(&offer.sdp)
                    .await
                    .map_err(|e| shared.fail(e))?;
                shared.bind_record(&id, Side::Initiator)?;
                id
            }
        };

        let subscription = shared.store.subscribe(&id).await.map_err(|e| shared.fail(e))?;
        shared.attach_subscription(subscription)?;
        info!(call_id = %id, "call started, waiting for answer");
        Ok(id)
    }

    /// Сторона B: подключается к существующей записи и записывает answer.
    ///
    /// Повтор с тем же id продолжает с текущего состояния переговоров.
    pub async fn join_call(&self, id: CallId) -> Result<()> {
        let shared = &self.shared;
        let _action = shared.begin_action()?;

        let fresh = {
            let core = shared.core.lock();
            require_media(&core)?;
            match core.phase {
                CallPhase::Idle => true,
                CallPhase::RoleSelected(Role::Responder) | CallPhase::RecordBound
                    if shared.negotiator.role() == Some(Role::Responder)
                        && core.call_id.as_ref() == Some(&id) =>
                {
                    false
                }
                phase => {
                    return Err(SignalingError::State(format!(
                        "cannot join a call while {phase:?}"
                    )))
                }
            }
        };

        let record = shared.store.fetch_record(&id).await.map_err(|e| shared.fail(e))?;
        let offer = record.offer.clone().ok_or_else(|| {
            shared.fail(SignalingError::Precondition(format!("call {id} has no offer yet")))
        })?;

        if fresh {
            if record.answer.is_some() {
                return Err(shared.fail(SignalingError::Precondition(format!(
                    "call {id} already has a responder"
                ))));
            }

            let mut core = shared.core.lock();
            if core.phase != CallPhase::Idle {
                return Err(SignalingError::State(format!(
                    "call state changed while joining: {:?}",
                    core.phase
                )));
            }
            shared.negotiator.assign_role(Role::Responder)?;
            core.phase = CallPhase::RoleSelected(Role::Responder);
            core.call_id = Some(id.clone());
            info!(call_id = %id, "role selected: responder");
            shared.publish(&core);
        }

        let subscribed = shared.core.lock().subscription.is_some();
        if !subscribed {
            let subscription = shared.store.subscribe(&id).await.map_err(|e| shared.fail(e))?;
            shared.attach_subscription(subscription)?;
        }

        if !shared.negotiator.has_remote_description().await {
            shared
                .negotiator
                .apply_remote_offer(SessionDescription::offer(offer))
                .await
                .map_err(|e| shared.fail(e))?;
            shared.on_remote_description_applied().await;
        }

        let answer = match shared.negotiator.state().await {
            NegotiationState::HaveRemoteOffer => shared
                .negotiator
                .create_local_answer()
                .await
                .map_err(|e| shared.fail(e))?,
            _ => shared.negotiator.local_description().await.ok_or_else(|| {
                SignalingError::State("negotiation has no local answer".into())
            })?,
        };
        shared.ensure_live()?;

        // кандидаты инициатора, уже лежащие в записи
        shared.on_record(record.clone()).await;

        match record.answer.as_deref() {
            Some(existing) if existing == answer.sdp => {
                debug!(call_id = %id, "answer already stored by a previous attempt");
            }
            _ => {
                shared
                    .store
                    .set_answer(&id, &answer.sdp)
                    .await
                    .map_err(|e| shared.fail(e))?;
            }
        }

        {
            let mut core = shared.core.lock();
            if core.phase.is_ended() {
                return Err(ended());
            }
            shared.bind_outgoing(&mut core, &id, Side::Responder);
            core.phase = CallPhase::Negotiating;
            core.last_error = None;
            shared.publish(&core);
        }
        info!(call_id = %id, "answer written, negotiating");
        Ok(())
    }

    /// Завершает звонок. Повторный вызов ничего не делает.
    pub async fn end_call(&self) -> Result<()> {
        self.shared.terminate(None).await;
        Ok(())
    }

    pub fn status(&self) -> watch::Receiver<CallStatus> {
        self.shared.status.subscribe()
    }

    pub fn snapshot(&self) -> CallStatus {
        self.shared.status.borrow().clone()
    }

    pub fn phase(&self) -> CallPhase {
        self.shared.core.lock().phase
    }

    pub fn call_id(&self) -> Option<CallId> {
        self.shared.core.lock().call_id.clone()
    }

    pub fn role(&self) -> Option<Role> {
        self.shared.negotiator.role()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.core.lock().connection
    }

    pub fn remote_stream(&self) -> Option<RemoteStream> {
        self.shared.core.lock().remote_stream.clone()
    }

    pub async fn negotiation_state(&self) -> NegotiationState {
        self.shared.negotiator.state().await
    }

    /// Локальные кандидаты, ждущие call id
    pub fn buffered_candidate_count(&self) -> usize {
        self.shared.core.lock().outgoing.len()
    }

    /// Удалённые кандидаты, ждущие remote description
    pub fn pending_remote_count(&self) -> usize {
        self.shared.core.lock().pending_remote.len()
    }
}

/// Снимает флаг текущего действия при любом выходе из start/join
struct ActionGuard {
    shared: Arc<Shared>,
}

impl Drop for ActionGuard {
    fn drop(&mut self) {
        self.shared.core.lock().action_in_flight = false;
    }
}

impl Shared {
    fn publish(&self, core: &Core) {
        self.status.send_replace(CallStatus {
            phase: core.phase,
            role: self.negotiator.role(),
            call_id: core.call_id.clone(),
            connection: core.connection,
            remote_stream: core.remote_stream.clone(),
            media_ready: core.media.is_some(),
            last_error: core.last_error.clone(),
            updated_at: Some(chrono::Utc::now().timestamp()),
        });
    }

    /// Ошибка явного действия пользователя: показываем один раз и отдаём вызывающему
    fn fail(&self, err: SignalingError) -> SignalingError {
        warn!(error = %err, recoverable = err.is_recoverable(), "call action failed");
        let mut core = self.core.lock();
        if !core.phase.is_ended() {
            core.last_error = Some(err.to_string());
            self.publish(&core);
        }
        err
    }

    /// Повторный start/join, пока предыдущий не завершился, отклоняется
    fn begin_action(self: &Arc<Self>) -> Result<ActionGuard> {
        let mut core = self.core.lock();
        if core.action_in_flight {
            warn!(phase = ?core.phase, "call action already in progress");
            return Err(SignalingError::State("call action already in progress".into()));
        }
        core.action_in_flight = true;
        Ok(ActionGuard {
            shared: self.clone(),
        })
    }

    fn is_ended(&self) -> bool {
        self.core.lock().phase.is_ended()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_ended() {
            return Err(ended());
        }
        Ok(())
    }

    /// Инициатор получил id записи: фиксируем его и сливаем буфер кандидатов
    fn bind_record(self: &Arc<Self>, id: &CallId, side: Side) -> Result<()> {
        let mut core = self.core.lock();
        if core.phase.is_ended() {
            warn!(call_id = %id, "record created after the call ended, abandoning it");
            return Err(ended());
        }
        core.call_id = Some(id.clone());
        core.phase = CallPhase::RecordBound;
        core.last_error = None;
        self.bind_outgoing(&mut core, id, side);
        info!(call_id = %id, "call record bound");
        self.publish(&core);
        Ok(())
    }

    /// Запускает единственного отправителя кандидатов. Буфер сливается в его очередь
    /// под тем же локом, поэтому порядок генерации сохраняется.
    fn bind_outgoing(self: &Arc<Self>, core: &mut Core, id: &CallId, side: Side) {
        if core.outbox.is_some() {
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let buffered = core.outgoing.drain_in_order();
        if !buffered.is_empty() {
            info!(count = buffered.len(), "flushing buffered local candidates");
        }
        for candidate in buffered {
            let _ = tx.send(candidate);
        }
        core.outbox = Some(tx);

        let submitter = spawn_submitter(Arc::downgrade(self), id.clone(), side, rx);
        core.tasks.push(submitter);
    }

    fn attach_subscription(self: &Arc<Self>, subscription: Subscription) -> Result<()> {
        let Subscription { updates, handle } = subscription;
        let mut core = self.core.lock();
        if core.phase.is_ended() {
            handle.unsubscribe();
            return Err(ended());
        }
        if core.subscription.is_some() {
            handle.unsubscribe();
            return Err(SignalingError::State("call record is already subscribed".into()));
        }
        if let CallPhase::RoleSelected(_) = core.phase {
            core.phase = CallPhase::RecordBound;
        }
        core.subscription = Some(handle);
        core.last_error = None;
        let pump = spawn_notification_pump(Arc::downgrade(self), updates);
        core.tasks.push(pump);
        self.publish(&core);
        Ok(())
    }

    async fn on_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let mut core = self.core.lock();
                if core.phase.is_ended() {
                    return;
                }
                if let Some(outbox) = &core.outbox {
                    if outbox.send(candidate).is_err() {
                        warn!("candidate submitter is gone, dropping local candidate");
                    }
                } else if core.outgoing.push(candidate) {
                    debug!(buffered = core.outgoing.len(), "no call id yet, buffering local candidate");
                }
            }

            TransportEvent::GatheringComplete => {
                debug!("local candidate gathering complete");
            }

            TransportEvent::ConnectionState(state) => {
                let state = self.negotiator.observe_connection_state(state).await;
                {
                    let mut core = self.core.lock();
                    if core.phase.is_ended() {
                        return;
                    }
                    core.connection = state;
                    if state == ConnectionState::Connected
                        && matches!(core.phase, CallPhase::RecordBound | CallPhase::Negotiating)
                    {
                        core.phase = CallPhase::Connected;
                        info!("peer connected");
                    }
                    self.publish(&core);
                }
                if state == ConnectionState::Failed {
                    error!("transport failed, ending call");
                    self.terminate(Some("connection failed".to_string())).await;
                }
            }

            TransportEvent::RemoteTrack(stream) => {
                let mut core = self.core.lock();
                if core.phase.is_ended() {
                    return;
                }
                core.remote_stream = Some(stream);
                self.publish(&core);
            }
        }
    }

    /// Обработка снапшота записи из подписки (или только что прочитанной)
    async fn on_record(self: &Arc<Self>, record: CallRecord) {
        let Some(role) = self.negotiator.role() else {
            return;
        };
        {
            let core = self.core.lock();
            if core.phase.is_ended() || core.call_id.as_ref() != Some(&record.id) {
                return;
            }
        }

        if role == Role::Initiator {
            if let Some(answer) = &record.answer {
                self.apply_answer_once(answer).await;
            }
        }

        let remote_side = Side::from(role).other();
        let ready = {
            let mut core = self.core.lock();
            if core.phase.is_ended() {
                return;
            }
            let fresh = core.dedup.filter_unseen(record.candidates(remote_side));
            if core.remote_ready {
                fresh
            } else {
                if !fresh.is_empty() {
                    debug!(count = fresh.len(), "remote description not set yet, queuing candidates");
                }
                core.pending_remote.extend(fresh);
                Vec::new()
            }
        };
        self.apply_remote_candidates(ready).await;
    }

    async fn apply_answer_once(self: &Arc<Self>, answer: &str) {
        if self.negotiator.has_remote_description().await {
            return;
        }

        match self
            .negotiator
            .apply_remote_answer(SessionDescription::answer(answer))
            .await
        {
            Ok(()) => {
                {
                    let mut core = self.core.lock();
                    if core.phase.is_ended() {
                        return;
                    }
                    if core.phase == CallPhase::RecordBound {
                        core.phase = CallPhase::Negotiating;
                    }
                    self.publish(&core);
                }
                info!("answer received and applied");
                self.on_remote_description_applied().await;
            }
            Err(SignalingError::State(msg)) => debug!(%msg, "answer not applied"),
            Err(e) => {
                // повторять бессмысленно: тот же answer снова будет отклонён
                error!(error = %e, "remote answer rejected");
                let mut core = self.core.lock();
                core.last_error = Some(e.to_string());
                self.publish(&core);
            }
        }
    }

    /// Remote description установлен: с этого момента кандидаты применяются сразу
    async fn on_remote_description_applied(self: &Arc<Self>) {
        let pending = {
            let mut core = self.core.lock();
            core.remote_ready = true;
            std::mem::take(&mut core.pending_remote)
        };
        if !pending.is_empty() {
            info!(count = pending.len(), "applying queued remote candidates");
        }
        self.apply_remote_candidates(pending).await;
    }

    async fn apply_remote_candidates(&self, candidates: Vec<IceCandidate>) {
        for candidate in candidates {
            if self.is_ended() {
                return;
            }
            if let Err(e) = self.negotiator.add_remote_candidate(candidate).await {
                warn!(error = %e, "remote candidate not applied");
            }
        }
    }

    async fn terminate(self: &Arc<Self>, reason: Option<String>) {
        let (subscription, tasks) = {
            let mut core = self.core.lock();
            if core.phase.is_ended() {
                return;
            }
            core.phase = CallPhase::Ended;
            if reason.is_some() {
                core.last_error = reason;
            }
            core.outbox = None;
            core.media = None;
            core.pending_remote.clear();
            self.publish(&core);
            (core.subscription.take(), std::mem::take(&mut core.tasks))
        };
        info!("call ended");

        if let Some(handle) = subscription {
            handle.unsubscribe();
        }
        if let Err(e) = self.negotiator.release_media().await {
            warn!(error = %e, "releasing local media failed");
        }
        if let Err(e) = self.negotiator.close().await {
            warn!(error = %e, "closing negotiation session failed");
        }

        let connection = self.negotiator.connection_state().await;
        {
            let mut core = self.core.lock();
            core.connection = connection;
            self.publish(&core);
        }

        // текущая задача может быть среди них: abort сработает на следующем await
        for task in tasks {
            task.abort();
        }
    }
}

fn require_media(core: &Core) -> Result<()> {
    if core.media.is_none() {
        return Err(SignalingError::Precondition("media not ready".into()));
    }
    Ok(())
}

fn ended() -> SignalingError {
    SignalingError::State("call already ended".into())
}

fn spawn_event_pump(
    shared: Weak<Shared>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(shared) = shared.upgrade() else {
                break;
            };
            shared.on_transport_event(event).await;
        }
    })
}

fn spawn_notification_pump(
    shared: Weak<Shared>,
    mut updates: mpsc::UnboundedReceiver<CallRecord>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(record) = updates.recv().await {
            let Some(shared) = shared.upgrade() else {
                break;
            };
            if shared.is_ended() {
                break;
            }
            shared.on_record(record).await;
        }
    })
}

/// Отправляет кандидатов строго по одному: append в хранилище это read-modify-write
fn spawn_submitter(
    shared: Weak<Shared>,
    id: CallId,
    side: Side,
    mut outbox: mpsc::UnboundedReceiver<IceCandidate>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(candidate) = outbox.recv().await {
            let Some(shared) = shared.upgrade() else {
                break;
            };
            if shared.is_ended() {
                break;
            }
            if let Err(e) = shared.store.append_candidate(&id, side, candidate).await {
                let e = SignalingError::TransientNetwork(e.to_string());
                warn!(call_id = %id, error = %e, "candidate submission failed");
            }
        }
    })
}
