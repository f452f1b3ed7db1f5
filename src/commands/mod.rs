//! Tauri-команды поверх координатора (feature `desktop`).
//!
//! Координатор одноразовый, поэтому состояние держит слот с текущим звонком и
//! создаёт новый, когда UI начинает следующий.

pub mod call_api;
pub mod ice_api;

use crate::config::SignalingConfig;
use crate::error::Result;
use crate::peer::connection::WebrtcTransport;
use crate::signaling::SignalingCoordinator;
use crate::store::RendezvousStore;
use parking_lot::RwLock;
use std::sync::Arc;
use tauri::{AppHandle, Builder, Emitter, Runtime};
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const STATUS_EVENT: &str = "call-status";

/// Текущий звонок: координатор и транспорт, в который пишет захват
#[derive(Clone)]
pub struct ActiveCall {
    pub coordinator: Arc<SignalingCoordinator>,
    pub transport: Arc<WebrtcTransport>,
}

pub struct CallState {
    config: RwLock<SignalingConfig>,
    store: Arc<dyn RendezvousStore>,
    active: Mutex<Option<ActiveCall>>,
}

impl CallState {
    pub fn new(config: SignalingConfig, store: Arc<dyn RendezvousStore>) -> Self {
        Self {
            config: RwLock::new(config),
            store,
            active: Mutex::new(None),
        }
    }

    pub fn config(&self) -> SignalingConfig {
        self.config.read().clone()
    }

    pub async fn active(&self) -> Option<ActiveCall> {
        self.active.lock().await.clone()
    }

    /// Текущий звонок или новый, если прошлый завершён
    pub async fn ensure_active<R: Runtime>(&self, app: &AppHandle<R>) -> Result<ActiveCall> {
        let mut slot = self.active.lock().await;
        if let Some(call) = slot.as_ref() {
            if !call.coordinator.phase().is_ended() {
                return Ok(call.clone());
            }
        }

        let config = self.config();
        let (coordinator, transport) =
            SignalingCoordinator::with_webrtc(&config, self.store.clone()).await?;
        let call = ActiveCall {
            coordinator: Arc::new(coordinator),
            transport,
        };
        forward_status(app.clone(), &call.coordinator);
        debug!("new call session prepared");
        *slot = Some(call.clone());
        Ok(call)
    }

    /// Убирает звонок из слота, чтобы следующий начался с чистого координатора
    pub async fn take_active(&self) -> Option<ActiveCall> {
        self.active.lock().await.take()
    }
}

/// Пересылает снимки состояния в webview, пока координатор жив
fn forward_status<R: Runtime>(app: AppHandle<R>, coordinator: &SignalingCoordinator) {
    let mut status = coordinator.status();
    tauri::async_runtime::spawn(async move {
        while status.changed().await.is_ok() {
            let snapshot = status.borrow_and_update().clone();
            if let Err(e) = app.emit(STATUS_EVENT, snapshot) {
                warn!(error = %e, "failed to emit {STATUS_EVENT}");
            }
        }
    });
}

/// Подключает состояние и все команды к builder'у приложения
pub fn register<R: Runtime>(
    builder: Builder<R>,
    config: SignalingConfig,
    store: Arc<dyn RendezvousStore>,
) -> Builder<R> {
    crate::logger::init();
    builder
        .manage(CallState::new(config, store))
        .invoke_handler(tauri::generate_handler![
            call_api::media_started,
            call_api::media_stopped,
            call_api::start_call,
            call_api::join_call,
            call_api::end_call,
            call_api::call_status,
            ice_api::get_ice_servers,
            ice_api::set_ice_servers,
            ice_api::check_ice_server_availability,
        ])
}
