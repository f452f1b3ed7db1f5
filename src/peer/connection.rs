use crate::config::get_user_ice_servers;
use crate::error::{Result, SignalingError};
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::peer::ice::analyze_candidates;
use crate::peer::media::{LocalMedia, MediaKind, RemoteStream};
use crate::peer::transport::{MediaTransport, TransportEvent};
use crate::peer::types::{ConnectionState, IceCandidate, SdpKind, ServerConfig, SessionDescription};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;
use webrtc::{
    api::APIBuilder,
    ice_transport::ice_candidate::RTCIceCandidate,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
};

/// Период ожидания перед тем, как считать disconnected окончательным сбоем
pub const GRACE_PERIOD: Duration = Duration::from_secs(10);

type Sink = Arc<Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>>;

struct LocalSender {
    track: Arc<TrackLocalStaticSample>,
    sender: Arc<RTCRtpSender>,
}

/// `MediaTransport` поверх `RTCPeerConnection`
pub struct WebrtcTransport {
    pc: Arc<RTCPeerConnection>,
    sink: Sink,
    local: Mutex<HashMap<String, LocalSender>>,
    remote: Arc<Mutex<HashMap<String, Arc<TrackRemote>>>>,
    disconnect_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl WebrtcTransport {
    /// Создаёт peer connection с заданными ICE серверами. Список не меняется до конца звонка.
    pub async fn new(ice_servers: &[ServerConfig]) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(rtc_config(ice_servers)).await?);
        let transport = Self {
            pc,
            sink: Arc::new(Mutex::new(None)),
            local: Mutex::new(HashMap::new()),
            remote: Arc::new(Mutex::new(HashMap::new())),
            disconnect_task: Arc::new(Mutex::new(None)),
        };
        transport.install_handlers();
        Ok(transport)
    }

    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    /// Удалённый трек для отрисовки в UI
    pub fn remote_track(&self, track_id: &str) -> Option<Arc<TrackRemote>> {
        self.remote.lock().get(track_id).cloned()
    }

    /// Подаёт закодированный кадр/фрейм захвата в локальный трек
    pub async fn write_sample(&self, track_id: &str, data: Bytes, duration: Duration) -> Result<()> {
        let track = self
            .local
            .lock()
            .get(track_id)
            .map(|s| s.track.clone())
            .ok_or_else(|| SignalingError::Precondition(format!("unknown local track {track_id}")))?;

        track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(|e| SignalingError::TransientNetwork(e.to_string()))
    }

    fn install_handlers(&self) {
        let sink = self.sink.clone();
        let gathered = Arc::new(Mutex::new(Vec::<IceCandidate>::new()));

        self.pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            let gathered = gathered.clone();
            Box::pin(async move {
                match cand {
                    Some(c) => match c.to_json() {
                        Ok(init) => {
                            let candidate = IceCandidate::from(init);
                            dump_candidate("LOCAL", &candidate);
                            gathered.lock().push(candidate.clone());
                            emit(&sink, TransportEvent::LocalCandidate(candidate));
                        }
                        Err(e) => warn!(error = %e, "local candidate has no JSON form"),
                    },
                    None => {
                        // cand == None означает конец сбора
                        info!("ICE candidate gathering completed (null candidate received)");
                        let all = std::mem::take(&mut *gathered.lock());
                        analyze_candidates(&all);
                        emit(&sink, TransportEvent::GatheringComplete);
                    }
                }
            })
        }));

        self.pc.on_ice_gathering_state_change(Box::new(move |state| {
            debug!(?state, "ICE gathering state changed");
            Box::pin(async {})
        }));

        let sink = self.sink.clone();
        let disconnect_task = self.disconnect_task.clone();
        let pc_weak: Weak<RTCPeerConnection> = Arc::downgrade(&self.pc);

        self.pc
            .on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
                info!(state = ?st, "peer connection state changed");

                match st {
                    RTCPeerConnectionState::Connected => {
                        // отменяем отложенный сбой, если он был
                        if let Some(handle) = disconnect_task.lock().take() {
                            debug!("connection recovered, aborting grace timer");
                            handle.abort();
                        }
                        emit(&sink, TransportEvent::ConnectionState(ConnectionState::Connected));
                    }

                    RTCPeerConnectionState::Disconnected => {
                        let mut pending = disconnect_task.lock();
                        if pending.is_some() {
                            debug!("grace timer already pending, ignoring");
                            return Box::pin(async {});
                        }
                        emit(&sink, TransportEvent::ConnectionState(ConnectionState::Connecting));

                        let sink = sink.clone();
                        let pc_weak = pc_weak.clone();
                        *pending = Some(tokio::spawn(async move {
                            info!("grace period started, waiting {} s", GRACE_PERIOD.as_secs());
                            sleep(GRACE_PERIOD).await;

                            let Some(pc) = pc_weak.upgrade() else {
                                return;
                            };
                            let state_now = pc.connection_state();
                            if state_now != RTCPeerConnectionState::Connected {
                                dump_selected_pair(&pc, "BEFORE-FAIL").await;
                                emit(&sink, TransportEvent::ConnectionState(ConnectionState::Failed));
                            } else {
                                debug!("connection recovered during grace period");
                            }
                        }));
                    }

                    RTCPeerConnectionState::Failed => {
                        if let Some(handle) = disconnect_task.lock().take() {
                            handle.abort();
                        }
                        if let Some(pc) = pc_weak.upgrade() {
                            tokio::spawn(async move {
                                dump_selected_pair(&pc, "BEFORE-FAIL").await;
                            });
                        }
                        emit(&sink, TransportEvent::ConnectionState(ConnectionState::Failed));
                    }

                    RTCPeerConnectionState::Closed => {
                        if let Some(handle) = disconnect_task.lock().take() {
                            handle.abort();
                        }
                        emit(&sink, TransportEvent::ConnectionState(ConnectionState::Closed));
                    }

                    RTCPeerConnectionState::Connecting => {
                        emit(&sink, TransportEvent::ConnectionState(ConnectionState::Connecting));
                    }

                    _ => debug!(state = ?st, "ignoring peer connection state"),
                }
                Box::pin(async {})
            }));

        let sink = self.sink.clone();
        let remote = self.remote.clone();
        self.pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let kind = match track.kind() {
                RTPCodecType::Audio => MediaKind::Audio,
                _ => MediaKind::Video,
            };
            let stream = RemoteStream {
                stream_id: track.stream_id(),
                track_id: track.id(),
                kind,
            };
            info!(track = %stream.track_id, ?kind, "remote track received");
            remote.lock().insert(stream.track_id.clone(), track);
            emit(&sink, TransportEvent::RemoteTrack(stream));
            Box::pin(async {})
        }));
    }
}

fn emit(sink: &Sink, event: TransportEvent) {
    if let Some(tx) = sink.lock().as_ref() {
        if tx.send(event).is_err() {
            debug!("transport event listener is gone");
        }
    }
}

/// Создает конфигурацию для peer connection
fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: get_user_ice_servers(servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

fn codec_for(kind: MediaKind) -> RTCRtpCodecCapability {
    match kind {
        MediaKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48_000,
            channels: 2,
            ..Default::default()
        },
        MediaKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90_000,
            ..Default::default()
        },
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
    };
    Ok(rtc)
}

#[async_trait]
impl MediaTransport for WebrtcTransport {
    fn set_event_sink(&self, sink: mpsc::UnboundedSender<TransportEvent>) {
        *self.sink.lock() = Some(sink);
    }

    async fn attach_media(&self, media: &LocalMedia) -> Result<()> {
        for t in &media.tracks {
            let track = Arc::new(TrackLocalStaticSample::new(
                codec_for(t.kind),
                t.id.clone(),
                media.stream_id.clone(),
            ));
            let sender = self
                .pc
                .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                .await?;

            // RTCP нужно вычитывать, иначе interceptors не работают
            let rtcp_sender = sender.clone();
            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while rtcp_sender.read(&mut rtcp_buf).await.is_ok() {}
            });

            debug!(track = %t.id, kind = ?t.kind, "local track attached");
            self.local.lock().insert(t.id.clone(), LocalSender { track, sender });
        }
        Ok(())
    }

    async fn detach_media(&self) -> Result<()> {
        let senders: Vec<LocalSender> = self.local.lock().drain().map(|(_, s)| s).collect();
        for s in senders {
            if let Err(e) = self.pc.remove_track(&s.sender).await {
                warn!(error = %e, "failed to remove local track");
            }
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer).await?;
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| SignalingError::Negotiation("local offer missing after set".into()))?;
        Ok(SessionDescription::offer(local.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer).await?;
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| SignalingError::Negotiation("local answer missing after set".into()))?;
        Ok(SessionDescription::answer(local.sdp))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(handle) = self.disconnect_task.lock().take() {
            handle.abort();
        }
        self.remote.lock().clear();
        self.pc.close().await?;
        Ok(())
    }
}
