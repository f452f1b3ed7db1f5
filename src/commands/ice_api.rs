use crate::commands::CallState;
use crate::config::validate_ice_servers;
use crate::error::Result;
use crate::peer::ice;
use crate::peer::types::ServerConfig;
use tauri::{command, State};
use tracing::info;

#[command]
pub fn get_ice_servers(state: State<'_, CallState>) -> Vec<ServerConfig> {
    state.config().ice_servers
}

/// Новый список применяется к следующему звонку
#[command]
pub fn set_ice_servers(state: State<'_, CallState>, servers: Vec<ServerConfig>) -> Result<()> {
    validate_ice_servers(&servers)?;
    info!(count = servers.len(), "ICE servers updated");
    state.config.write().ice_servers = servers;
    Ok(())
}

/// Проверка доступности одного STUN/TURN сервера
#[command]
pub async fn check_ice_server_availability(server: ServerConfig) -> Result<bool> {
    ice::check_ice_server_availability(&server).await
}
