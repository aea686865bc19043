//! REST API handlers
//!
//! Device access is blocking, so handlers that touch the context run their
//! work on the blocking pool.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use wethlink_core::register::parse_byte;
use wethlink_core::rf::{ghz_to_khz, khz_to_ghz, parse_vco_list};
use wethlink_core::{ConnectError, ConnectErrorKind, RegisterDump, RegisterMap};

use crate::state::AppState;

/// API error response
#[derive(Serialize)]
struct ApiError {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<ConnectErrorKind>,
}

impl ApiError {
    fn new(msg: impl Into<String>) -> Self {
        Self {
            error: msg.into(),
            kind: None,
        }
    }

    fn response(status: StatusCode, msg: impl Into<String>) -> Response {
        (status, Json(Self::new(msg))).into_response()
    }
}

fn connect_error_response(e: &ConnectError) -> Response {
    let status = match e.kind {
        ConnectErrorKind::DeviceNotFound => StatusCode::NOT_FOUND,
        ConnectErrorKind::AlreadyConnected | ConnectErrorKind::Busy => StatusCode::CONFLICT,
        ConnectErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        ConnectErrorKind::NotSupported => StatusCode::UNPROCESSABLE_ENTITY,
        ConnectErrorKind::Unknown => StatusCode::BAD_GATEWAY,
    };
    let body = ApiError {
        error: e.to_string(),
        kind: Some(e.kind),
    };
    (status, Json(body)).into_response()
}

/// Run blocking device work off the async workers
async fn blocking<T, F>(state: &Arc<AppState>, work: F) -> Result<T, Response>
where
    F: FnOnce(&AppState) -> T + Send + 'static,
    T: Send + 'static,
{
    let state = state.clone();
    tokio::task::spawn_blocking(move || work(&state))
        .await
        .map_err(|e| {
            warn!(error = %e, "Blocking API task failed");
            ApiError::response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        })
}

/// Response for an operation that returned nothing
fn absent(connected: bool, what: String) -> Response {
    if connected {
        ApiError::response(StatusCode::BAD_GATEWAY, format!("{} failed", what))
    } else {
        ApiError::response(StatusCode::CONFLICT, "No device connected")
    }
}

/// Parse a register address given as decimal or `0x` hex
fn parse_address(text: &str) -> Option<u32> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

fn register_map(device: &str) -> Result<&'static RegisterMap, Response> {
    RegisterMap::for_device(device).ok_or_else(|| {
        ApiError::response(
            StatusCode::NOT_FOUND,
            format!("No register map for device {}", device),
        )
    })
}

/// Validate `addr` against the device's map when it has one
fn checked_address(device: &str, addr: &str) -> Result<u32, Response> {
    let parsed = parse_address(addr).ok_or_else(|| {
        ApiError::response(StatusCode::BAD_REQUEST, format!("Bad register address '{}'", addr))
    })?;
    match RegisterMap::for_device(device) {
        Some(map) if !map.contains(parsed) => Err(ApiError::response(
            StatusCode::BAD_REQUEST,
            format!("Register {} is reserved on {}", parsed, device),
        )),
        _ => Ok(parsed),
    }
}

/// Link and selection status
pub async fn get_status(State(state): State<Arc<AppState>>) -> Response {
    match blocking(&state, |s| s.status()).await {
        Ok(status) => Json(status).into_response(),
        Err(resp) => resp,
    }
}

#[derive(Serialize)]
struct EndpointList {
    endpoints: Vec<String>,
    selection: Option<String>,
}

/// Endpoint list as shown to the operator, placeholder first
pub async fn list_endpoints(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(EndpointList {
        endpoints: state.discovery.display_names(),
        selection: state.discovery.selection().map(|e| e.0),
    })
}

#[derive(Deserialize)]
pub struct SelectRequest {
    /// Endpoint name; absent or the placeholder disconnects
    #[serde(default)]
    endpoint: Option<String>,
}

#[derive(Serialize)]
struct Selection {
    selection: Option<String>,
    uri: Option<String>,
}

/// Select an endpoint and connect to it
pub async fn select_endpoint(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SelectRequest>,
) -> Response {
    info!(endpoint = ?req.endpoint, "Endpoint selection requested");
    let endpoint = req.endpoint;
    let result = blocking(&state, move |s| s.select_endpoint(endpoint.as_deref())).await;
    match result {
        Ok(Ok(uri)) => Json(Selection {
            selection: state.discovery.selection().map(|e| e.0),
            uri,
        })
        .into_response(),
        Ok(Err(e)) => connect_error_response(&e),
        Err(resp) => resp,
    }
}

/// Run a discovery pulse now
pub async fn trigger_scan(State(state): State<Arc<AppState>>) -> Response {
    match blocking(&state, |s| s.scan()).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(resp) => resp,
    }
}

#[derive(Serialize)]
struct AttrValue {
    device: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<String>,
    attr: String,
    value: String,
}

pub async fn get_attr(
    State(state): State<Arc<AppState>>,
    Path((device, attr)): Path<(String, String)>,
) -> Response {
    let (d, a) = (device.clone(), attr.clone());
    let result = blocking(&state, move |s| {
        (s.context.read_attribute(&d, &a), s.context.is_connected())
    })
    .await;
    match result {
        Ok((Some(value), _)) => Json(AttrValue {
            device,
            channel: None,
            attr,
            value,
        })
        .into_response(),
        Ok((None, connected)) => absent(connected, format!("read {}/{}", device, attr)),
        Err(resp) => resp,
    }
}

#[derive(Deserialize)]
pub struct WriteRequest {
    value: String,
    /// Write even if the device already holds this value
    #[serde(default)]
    force: bool,
}

pub async fn put_attr(
    State(state): State<Arc<AppState>>,
    Path((device, attr)): Path<(String, String)>,
    Json(req): Json<WriteRequest>,
) -> Response {
    let (d, a) = (device.clone(), attr.clone());
    let result = blocking(&state, move |s| {
        let outcome = if req.force {
            s.context
                .write_attribute(&d, &a, &req.value)
                .map(|()| wethlink_context::WriteOutcome::Written)
        } else {
            s.context.write_attribute_if_changed(&d, &a, &req.value)
        };
        (outcome, s.context.is_connected())
    })
    .await;
    match result {
        Ok((Some(outcome), _)) => Json(serde_json::json!({ "outcome": outcome })).into_response(),
        Ok((None, connected)) => absent(connected, format!("write {}/{}", device, attr)),
        Err(resp) => resp,
    }
}

pub async fn get_channel_attr(
    State(state): State<Arc<AppState>>,
    Path((device, channel, attr)): Path<(String, String, String)>,
) -> Response {
    let (d, c, a) = (device.clone(), channel.clone(), attr.clone());
    let result = blocking(&state, move |s| {
        (
            s.context.read_channel_attribute(&d, &c, &a),
            s.context.is_connected(),
        )
    })
    .await;
    match result {
        Ok((Some(value), _)) => Json(AttrValue {
            device,
            channel: Some(channel),
            attr,
            value,
        })
        .into_response(),
        Ok((None, connected)) => {
            absent(connected, format!("read {}/{}/{}", device, channel, attr))
        }
        Err(resp) => resp,
    }
}

pub async fn put_channel_attr(
    State(state): State<Arc<AppState>>,
    Path((device, channel, attr)): Path<(String, String, String)>,
    Json(req): Json<WriteRequest>,
) -> Response {
    let (d, c, a) = (device.clone(), channel.clone(), attr.clone());
    let result = blocking(&state, move |s| {
        (
            s.context.write_channel_attribute(&d, &c, &a, &req.value),
            s.context.is_connected(),
        )
    })
    .await;
    match result {
        Ok((Some(()), _)) => {
            Json(serde_json::json!({ "outcome": wethlink_context::WriteOutcome::Written }))
                .into_response()
        }
        Ok((None, connected)) => {
            absent(connected, format!("write {}/{}/{}", device, channel, attr))
        }
        Err(resp) => resp,
    }
}

/// VCO frequency and the device's offered list, in GHz
#[derive(Serialize)]
struct VcoSettings {
    device: String,
    /// `"0"` when the VCO is off
    current: Option<String>,
    available: Vec<String>,
}

fn vco_display(raw: &str) -> Option<String> {
    if raw.trim() == "0" {
        Some("0".to_string())
    } else {
        khz_to_ghz(raw)
    }
}

pub async fn get_vco(
    State(state): State<Arc<AppState>>,
    Path(device): Path<String>,
) -> Response {
    let d = device.clone();
    let result = blocking(&state, move |s| {
        let current = s.context.read_attribute(&d, "vco");
        let available = current
            .as_ref()
            .and_then(|_| s.context.read_attribute(&d, "vco_available"));
        (current, available, s.context.is_connected())
    })
    .await;
    match result {
        Ok((Some(current), Some(available), _)) => Json(VcoSettings {
            device,
            current: vco_display(&current),
            available: parse_vco_list(&available),
        })
        .into_response(),
        Ok((_, _, connected)) => absent(connected, format!("read {}/vco", device)),
        Err(resp) => resp,
    }
}

#[derive(Deserialize)]
pub struct VcoRequest {
    pub ghz: String,
}

/// Tune the VCO to one of the offered frequencies
pub async fn put_vco(
    State(state): State<Arc<AppState>>,
    Path(device): Path<String>,
    Json(req): Json<VcoRequest>,
) -> Response {
    let Some(khz) = ghz_to_khz(&req.ghz) else {
        return ApiError::response(
            StatusCode::BAD_REQUEST,
            format!("Bad frequency '{}'", req.ghz),
        );
    };

    let (d, wanted) = (device.clone(), khz.clone());
    let result = blocking(&state, move |s| {
        let offered = s
            .context
            .read_attribute(&d, "vco_available")
            .map(|list| {
                parse_vco_list(&list)
                    .iter()
                    .any(|f| ghz_to_khz(f).as_deref() == Some(wanted.as_str()))
            });
        let outcome = match offered {
            Some(true) => s.context.write_attribute_if_changed(&d, "vco", &wanted).map(Some),
            Some(false) => Some(None),
            None => None,
        };
        (outcome, s.context.is_connected())
    })
    .await;
    match result {
        Ok((Some(Some(outcome)), _)) => {
            Json(serde_json::json!({ "outcome": outcome, "value": khz })).into_response()
        }
        Ok((Some(None), _)) => ApiError::response(
            StatusCode::BAD_REQUEST,
            format!("{} GHz is not offered by {}", req.ghz.trim(), device),
        ),
        Ok((None, connected)) => absent(connected, format!("write {}/vco", device)),
        Err(resp) => resp,
    }
}

#[derive(Serialize)]
struct RegisterValue {
    device: String,
    address: u32,
    value: u8,
    hex: String,
}

pub async fn get_register(
    State(state): State<Arc<AppState>>,
    Path((device, addr)): Path<(String, String)>,
) -> Response {
    let address = match checked_address(&device, &addr) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let d = device.clone();
    let result = blocking(&state, move |s| {
        (s.context.read_register(&d, address), s.context.is_connected())
    })
    .await;
    match result {
        Ok((Some(value), _)) => Json(RegisterValue {
            device,
            address,
            value,
            hex: format!("0x{:02x}", value),
        })
        .into_response(),
        Ok((None, connected)) => absent(connected, format!("read register {}[{}]", device, address)),
        Err(resp) => resp,
    }
}

#[derive(Deserialize)]
pub struct RegisterWrite {
    /// Decimal or `0x` hex; masked to one byte
    value: String,
}

pub async fn put_register(
    State(state): State<Arc<AppState>>,
    Path((device, addr)): Path<(String, String)>,
    Json(req): Json<RegisterWrite>,
) -> Response {
    let address = match checked_address(&device, &addr) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let Some(value) = parse_byte(&req.value, false) else {
        return ApiError::response(
            StatusCode::BAD_REQUEST,
            format!("Bad register value '{}'", req.value),
        );
    };
    let d = device.clone();
    let result = blocking(&state, move |s| {
        (
            s.context.write_register(&d, address, value),
            s.context.is_connected(),
        )
    })
    .await;
    match result {
        Ok((Some(()), _)) => Json(RegisterValue {
            device,
            address,
            value,
            hex: format!("0x{:02x}", value),
        })
        .into_response(),
        Ok((None, connected)) => {
            absent(connected, format!("write register {}[{}]", device, address))
        }
        Err(resp) => resp,
    }
}

/// Export every valid register in the dump text format
pub async fn export_registers(
    State(state): State<Arc<AppState>>,
    Path(device): Path<String>,
) -> Response {
    let map = match register_map(&device) {
        Ok(map) => map,
        Err(resp) => return resp,
    };
    let result = blocking(&state, move |s| {
        (s.context.export_registers(map), s.context.is_connected())
    })
    .await;
    match result {
        Ok((Some(dump), _)) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/csv")],
            dump.render(),
        )
            .into_response(),
        Ok((None, connected)) => absent(connected, format!("export registers of {}", device)),
        Err(resp) => resp,
    }
}

/// Import a register dump, applying rows in file order
pub async fn import_registers(
    State(state): State<Arc<AppState>>,
    Path(device): Path<String>,
    body: String,
) -> Response {
    let map = match register_map(&device) {
        Ok(map) => map,
        Err(resp) => return resp,
    };
    let dump = match RegisterDump::parse(&body, map) {
        Ok(dump) => dump,
        Err(e) => return ApiError::response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    info!(device = %device, rows = dump.len(), "Register import requested");
    let d = device.clone();
    let result = blocking(&state, move |s| {
        (s.context.import_registers(&d, &dump), s.context.is_connected())
    })
    .await;
    match result {
        Ok((Some(written), _)) => Json(serde_json::json!({ "written": written })).into_response(),
        Ok((None, connected)) => absent(connected, format!("import registers of {}", device)),
        Err(resp) => resp,
    }
}

/// Identity of the connected transceiver
pub async fn get_context(State(state): State<Arc<AppState>>) -> Response {
    let result = blocking(&state, |s| (s.context.context_info(), s.context.is_connected())).await;
    match result {
        Ok((Some(info), _)) => Json(info).into_response(),
        Ok((None, connected)) => absent(connected, "read context info".to_string()),
        Err(resp) => resp,
    }
}

/// Latest refresh snapshot
pub async fn get_snapshot(State(state): State<Arc<AppState>>) -> Response {
    match state.last_snapshot() {
        Some(snapshot) => Json(snapshot).into_response(),
        None => ApiError::response(StatusCode::NOT_FOUND, "No snapshot yet"),
    }
}

/// Recent diagnostic entries, oldest first
pub async fn get_diagnostics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.diagnostics.entries())
}

pub async fn get_heartbeats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.heartbeats.tasks())
}

/// Get current configuration
pub async fn get_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.config.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("16"), Some(16));
        assert_eq!(parse_address("0x1b"), Some(27));
        assert_eq!(parse_address("0X0A"), Some(10));
        assert_eq!(parse_address("zz"), None);
    }

    #[test]
    fn test_checked_address() {
        assert_eq!(checked_address("hmc6300", "12").ok(), Some(12));
        assert!(checked_address("hmc6300", "14").is_err());
        assert!(checked_address("hmc6301", "14").is_err());
        assert!(checked_address("hmc6301", "0").is_ok());
        // No map, no restriction
        assert_eq!(checked_address("mwc", "99").ok(), Some(99));
    }
}
