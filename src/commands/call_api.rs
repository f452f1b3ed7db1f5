use crate::commands::CallState;
use crate::error::{Result, SignalingError};
use crate::peer::media::LocalMedia;
use crate::peer::types::CallId;
use crate::session::CallStatus;
use tauri::{command, AppHandle, Runtime, State};
use tracing::info;

/// UI захватил камеру и микрофон
#[command]
pub async fn media_started<R: Runtime>(
    app: AppHandle<R>,
    state: State<'_, CallState>,
    media: LocalMedia,
) -> Result<()> {
    let call = state.ensure_active(&app).await?;
    call.coordinator.media_started(media).await
}

#[command]
pub async fn media_stopped(state: State<'_, CallState>) -> Result<()> {
    match state.active().await {
        Some(call) => call.coordinator.media_stopped().await,
        None => Ok(()),
    }
}

/// A-сторона: создаёт запись и возвращает её id
#[command]
pub async fn start_call(state: State<'_, CallState>) -> Result<CallId> {
    let call = state
        .active()
        .await
        .ok_or_else(|| SignalingError::Precondition("media not ready".into()))?;
    call.coordinator.start_call().await
}

/// B-сторона: подключается по id, полученному от собеседника
#[command]
pub async fn join_call(state: State<'_, CallState>, call_id: String) -> Result<()> {
    let call = state
        .active()
        .await
        .ok_or_else(|| SignalingError::Precondition("media not ready".into()))?;
    call.coordinator.join_call(CallId::from(call_id)).await
}

#[command]
pub async fn end_call(state: State<'_, CallState>) -> Result<()> {
    if let Some(call) = state.take_active().await {
        info!(call_id = ?call.coordinator.call_id(), "end_call requested");
        call.coordinator.end_call().await?;
    }
    Ok(())
}

#[command]
pub async fn call_status(state: State<'_, CallState>) -> Result<CallStatus> {
    Ok(state
        .active()
        .await
        .map(|call| call.coordinator.snapshot())
        .unwrap_or_default())
}
