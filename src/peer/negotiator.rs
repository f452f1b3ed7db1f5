//! Переговоры одного пира: offer/answer, удалённые кандидаты и состояние соединения.
//!
//! Каждая операция проверяет состояние и вызывает транспорт под одним и тем же
//! async-мьютексом, поэтому «проверить и применить» для описаний атомарно.

use crate::error::{Result, SignalingError};
use crate::logger::dump_candidate;
use crate::peer::media::LocalMedia;
use crate::peer::transport::{MediaTransport, TransportEvent};
use crate::peer::types::{
    ConnectionState, IceCandidate, NegotiationState, Role, SdpKind, SessionDescription,
};
use once_cell::sync::OnceCell;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

struct Inner {
    state: NegotiationState,
    connection: ConnectionState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied_candidates: usize,
    media_attached: bool,
    disposed: bool,
}

pub struct SessionNegotiator {
    transport: Arc<dyn MediaTransport>,
    role: OnceCell<Role>,
    inner: Mutex<Inner>,
    events: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl SessionNegotiator {
    pub fn new(transport: Arc<dyn MediaTransport>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        transport.set_event_sink(tx);

        Self {
            transport,
            role: OnceCell::new(),
            inner: Mutex::new(Inner {
                state: NegotiationState::New,
                connection: ConnectionState::New,
                local: None,
                remote: None,
                applied_candidates: 0,
                media_attached: false,
                disposed: false,
            }),
            events: parking_lot::Mutex::new(Some(rx)),
        }
    }

    /// Забирает поток событий транспорта. Слушатель может быть только один.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events.lock().take()
    }

    /// Назначает роль. Смена уже назначенной роли считается ошибкой программы.
    pub fn assign_role(&self, role: Role) -> Result<()> {
        match self.role.get() {
            Some(current) if *current == role => Ok(()),
            Some(current) => Err(SignalingError::State(format!(
                "role already assigned as {current:?}, refusing {role:?}"
            ))),
            None => self
                .role
                .set(role)
                .map_err(|_| SignalingError::State("role assigned concurrently".into())),
        }
    }

    pub fn role(&self) -> Option<Role> {
        self.role.get().copied()
    }

    pub async fn state(&self) -> NegotiationState {
        self.inner.lock().await.state
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.inner.lock().await.connection
    }

    pub async fn has_remote_description(&self) -> bool {
        self.inner.lock().await.remote.is_some()
    }

    pub async fn local_description(&self) -> Option<SessionDescription> {
        self.inner.lock().await.local.clone()
    }

    pub async fn applied_candidate_count(&self) -> usize {
        self.inner.lock().await.applied_candidates
    }

    pub async fn attach_media(&self, media: &LocalMedia) -> Result<()> {
        let mut inner = self.inner.lock().await;
        ensure_live(&inner)?;
        if inner.media_attached {
            self.transport.detach_media().await?;
            inner.media_attached = false;
        }
        self.transport.attach_media(media).await?;
        inner.media_attached = true;
        Ok(())
    }

    /// Снимает локальные треки. Повторный вызов ничего не делает.
    pub async fn release_media(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if !inner.media_attached {
            return Ok(());
        }
        inner.media_attached = false;
        self.transport.detach_media().await
    }

    pub async fn create_local_offer(&self) -> Result<SessionDescription> {
        self.require_role(Role::Initiator)?;
        let mut inner = self.inner.lock().await;
        ensure_live(&inner)?;
        if inner.state != NegotiationState::New || inner.local.is_some() {
            return Err(SignalingError::Negotiation(
                "local offer already created for this session".into(),
            ));
        }

        let offer = self.transport.create_offer().await?;
        info!("local description set (offer)");
        inner.local = Some(offer.clone());
        inner.state = NegotiationState::HaveLocalOffer;
        Ok(offer)
    }

    pub async fn apply_remote_offer(&self, desc: SessionDescription) -> Result<()> {
        self.require_role(Role::Responder)?;
        expect_kind(&desc, SdpKind::Offer)?;
        let mut inner = self.inner.lock().await;
        ensure_live(&inner)?;
        if inner.remote.is_some() {
            return Err(SignalingError::State(
                "remote description already applied".into(),
            ));
        }

        self.transport.set_remote_description(desc.clone()).await?;
        info!("remote description set (offer)");
        inner.remote = Some(desc);
        inner.state = NegotiationState::HaveRemoteOffer;
        Ok(())
    }

    pub async fn create_local_answer(&self) -> Result<SessionDescription> {
        self.require_role(Role::Responder)?;
        let mut inner = self.inner.lock().await;
        ensure_live(&inner)?;
        if inner.state != NegotiationState::HaveRemoteOffer {
            return Err(SignalingError::State(format!(
                "cannot answer in state {:?}",
                inner.state
            )));
        }

        let answer = self.transport.create_answer().await?;
        info!("local description set (answer)");
        inner.local = Some(answer.clone());
        inner.state = NegotiationState::HaveLocalAnswer;
        Ok(answer)
    }

    pub async fn apply_remote_answer(&self, desc: SessionDescription) -> Result<()> {
        self.require_role(Role::Initiator)?;
        expect_kind(&desc, SdpKind::Answer)?;
        let mut inner = self.inner.lock().await;
        ensure_live(&inner)?;
        if inner.remote.is_some() {
            return Err(SignalingError::State(
                "remote description already applied".into(),
            ));
        }
        if inner.state != NegotiationState::HaveLocalOffer {
            return Err(SignalingError::State(
                "remote answer without a local offer".into(),
            ));
        }

        self.transport.set_remote_description(desc.clone()).await?;
        info!("remote description set (answer)");
        inner.remote = Some(desc);
        inner.state = NegotiationState::HaveRemoteAnswer;
        Ok(())
    }

    /// Кандидат до remote description транспорту не передаётся никогда
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut inner = self.inner.lock().await;
        ensure_live(&inner)?;
        if inner.remote.is_none() {
            return Err(SignalingError::Precondition(
                "remote candidate before remote description".into(),
            ));
        }

        dump_candidate("REMOTE", &candidate);
        self.transport
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| SignalingError::TransientNetwork(e.to_string()))?;
        inner.applied_candidates += 1;
        Ok(())
    }

    /// Обновляет автомат по сигналу транспорта и возвращает новое состояние соединения
    pub async fn observe_connection_state(&self, state: ConnectionState) -> ConnectionState {
        let mut inner = self.inner.lock().await;
        if inner.state.is_terminal() {
            debug!(?state, "ignoring connection state after terminal negotiation state");
            return inner.connection;
        }

        inner.connection = state;
        match state {
            ConnectionState::Connected => match inner.state {
                NegotiationState::HaveRemoteAnswer | NegotiationState::HaveLocalAnswer => {
                    inner.state = NegotiationState::Connected;
                }
                other => warn!(?other, "transport connected before negotiation finished"),
            },
            ConnectionState::Failed => inner.state = NegotiationState::Failed,
            ConnectionState::Closed => inner.state = NegotiationState::Closed,
            ConnectionState::New | ConnectionState::Connecting => {}
        }
        state
    }

    /// Закрывает сессию. После этого допустима только утилизация.
    pub async fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.disposed {
            return Ok(());
        }
        inner.disposed = true;
        if inner.state != NegotiationState::Failed {
            inner.state = NegotiationState::Closed;
        }
        inner.connection = ConnectionState::Closed;
        if inner.media_attached {
            inner.media_attached = false;
            if let Err(e) = self.transport.detach_media().await {
                warn!(error = %e, "detaching media on close failed");
            }
        }
        self.transport.close().await
    }

    fn require_role(&self, expected: Role) -> Result<()> {
        match self.role.get() {
            Some(role) if *role == expected => Ok(()),
            Some(role) => Err(SignalingError::State(format!(
                "operation requires role {expected:?}, session is {role:?}"
            ))),
            None => Err(SignalingError::State("role not assigned".into())),
        }
    }
}

fn ensure_live(inner: &Inner) -> Result<()> {
    if inner.state.is_terminal() {
        return Err(SignalingError::State(format!(
            "negotiation session is {:?}",
            inner.state
        )));
    }
    Ok(())
}

fn expect_kind(desc: &SessionDescription, kind: SdpKind) -> Result<()> {
    if desc.kind != kind {
        return Err(SignalingError::State(format!(
            "expected {kind:?} description, got {:?}",
            desc.kind
        )));
    }
    Ok(())
}
