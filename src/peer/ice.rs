use crate::error::Result;
use crate::peer::types::{IceCandidate, ServerConfig};
use crate::utils::add_ice_url_scheme;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use webrtc::{
    api::APIBuilder,
    ice_transport::{ice_gatherer_state::RTCIceGathererState, ice_server::RTCIceServer},
    peer_connection::{configuration::RTCConfiguration, RTCPeerConnection},
};

/// Сколько ждать подходящего кандидата при проверке ICE сервера
const CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Исходящие кандидаты, накопленные до появления call id.
///
/// Очищается ровно один раз, в порядке генерации: транспорт выдаёт кандидатов
/// по приоритету, и этот порядок должен дойти до хранилища без изменений.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: Vec<IceCandidate>,
    drained: bool,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Возвращает false, если буфер уже был слит и кандидат нужно отправлять напрямую
    pub fn push(&mut self, candidate: IceCandidate) -> bool {
        if self.drained {
            return false;
        }
        self.pending.push(candidate);
        true
    }

    pub fn drain_in_order(&mut self) -> Vec<IceCandidate> {
        self.drained = true;
        std::mem::take(&mut self.pending)
    }

    pub fn is_drained(&self) -> bool {
        self.drained
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Учёт уже применённых удалённых кандидатов.
///
/// Хранилище каждый раз присылает весь массив целиком, так что один и тот же
/// кандидат приходит многократно.
#[derive(Debug, Default)]
pub struct RemoteCandidateDedup {
    seen: HashSet<String>,
}

impl RemoteCandidateDedup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen(&self, candidate: &IceCandidate) -> bool {
        self.seen.contains(&canonical_key(candidate))
    }

    /// true, если кандидат встретился впервые
    pub fn mark_seen(&mut self, candidate: &IceCandidate) -> bool {
        self.seen.insert(canonical_key(candidate))
    }

    /// Оставляет из снапшота только новые кандидаты и сразу помечает их
    pub fn filter_unseen(&mut self, snapshot: &[IceCandidate]) -> Vec<IceCandidate> {
        snapshot
            .iter()
            .filter(|c| self.mark_seen(c))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

fn canonical_key(candidate: &IceCandidate) -> String {
    serde_json::to_string(candidate).unwrap_or_else(|_| format!("{candidate:?}"))
}

/// Сводка по типам собранных кандидатов
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateSummary {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates(candidates: &[IceCandidate]) -> CandidateSummary {
    let mut summary = CandidateSummary::default();

    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            summary.host += 1;
        } else if candidate.candidate.contains("typ srflx") {
            summary.srflx += 1;
        } else if candidate.candidate.contains("typ relay") {
            summary.relay += 1;
        }
    }

    info!(
        host = summary.host,
        srflx = summary.srflx,
        relay = summary.relay,
        "candidate analysis"
    );

    if summary.relay == 0 {
        warn!("No TURN relay candidates found! Connection through NAT may fail.");
    }
    summary
}

/// Проверяет, отвечает ли ICE сервер: для STUN ждём srflx, для TURN ждём relay кандидата
pub async fn check_ice_server_availability(config: &ServerConfig) -> Result<bool> {
    let url = add_ice_url_scheme(config);
    debug!(original = %config.url, processed = %url, "checking ICE server");

    let rtc_config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: vec![url],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        }],
        ..Default::default()
    };

    let api = APIBuilder::new().build();
    let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await?);
    let available = check_via_ice_gathering(&peer_connection, &config.r#type).await;

    if let Err(e) = peer_connection.close().await {
        debug!(error = %e, "availability check connection close failed");
    }
    available
}

async fn check_via_ice_gathering(
    peer_connection: &Arc<RTCPeerConnection>,
    server_type: &str,
) -> Result<bool> {
    let (state_tx, mut state_rx) = mpsc::unbounded_channel();
    peer_connection.on_ice_gathering_state_change(Box::new(move |state| {
        let _ = state_tx.send(state);
        Box::pin(async {})
    }));

    let (candidate_tx, mut candidate_rx) = mpsc::unbounded_channel();
    let wanted = if server_type == "turn" {
        "typ relay"
    } else {
        "typ srflx"
    };

    peer_connection.on_ice_candidate(Box::new(move |candidate| {
        let tx = candidate_tx.clone();
        Box::pin(async move {
            let Some(c) = candidate else {
                return;
            };
            match c.to_json() {
                Ok(json) if json.candidate.contains(wanted) => {
                    debug!(candidate = %json.candidate, "availability check found matching candidate");
                    let _ = tx.send(());
                }
                Ok(json) => debug!(candidate = %json.candidate, "availability check candidate type mismatch"),
                Err(e) => debug!(error = %e, "availability check candidate has no JSON form"),
            }
        })
    }));

    // data channel нужен только чтобы offer запустил сбор кандидатов
    peer_connection.create_data_channel("availability", None).await?;
    let offer = peer_connection.create_offer(None).await?;
    peer_connection.set_local_description(offer).await?;

    tokio::select! {
        result = timeout(CHECK_TIMEOUT, candidate_rx.recv()) => match result {
            Ok(Some(())) => Ok(true),
            Ok(None) => Ok(false),
            Err(_) => {
                debug!("timeout waiting for candidate match");
                Ok(false)
            }
        },
        _ = async {
            while let Some(state) = state_rx.recv().await {
                if state == RTCIceGathererState::Complete {
                    break;
                }
            }
        } => {
            debug!("gathering completed without a matching candidate");
            Ok(false)
        }
    }
}
