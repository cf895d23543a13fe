//! REST API handlers for tracerouted
//!
//! `POST {base}/trace/json` runs a trace and answers with the hop list;
//! `GET {base}/status` reports the topology epoch and service counters.

use crate::error::TraceError;
use crate::service::{ServiceStatus, TraceService};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use sonic_fabric_types::{Hop, MacAddress, ProbePacket, VlanId};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{error, info};

/// Body of a trace request. Absent fields default to zero, except `vlanID`,
/// which is required.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceRequest {
    pub eth_src: Option<String>,
    pub eth_dst: Option<String>,
    #[serde(rename = "vlanID")]
    pub vlan_id: Option<u16>,
    pub ip_src: Option<String>,
    pub ip_dst: Option<String>,
    pub tcp_src_port: Option<u16>,
    pub tcp_dst_port: Option<u16>,
}

impl TraceRequest {
    /// Builds the uncolored probe this request describes.
    pub fn into_probe(self) -> Result<ProbePacket, TraceError> {
        let vlan = match self.vlan_id {
            None | Some(VlanId::UNTAGGED_WIRE) => {
                return Err(TraceError::invalid_probe(
                    "vlanID is required and must not be the untagged value",
                ))
            }
            Some(raw) => VlanId::new(raw)
                .map_err(|e| TraceError::invalid_probe(e.to_string()))?,
        };

        let mut probe = ProbePacket::new(
            parse_mac(self.eth_src.as_deref())?,
            parse_mac(self.eth_dst.as_deref())?,
            Some(vlan),
        );
        probe.ip_src = parse_ipv4(self.ip_src.as_deref())?;
        probe.ip_dst = parse_ipv4(self.ip_dst.as_deref())?;
        probe.tcp_src_port = self.tcp_src_port.unwrap_or(0);
        probe.tcp_dst_port = self.tcp_dst_port.unwrap_or(0);
        Ok(probe)
    }
}

fn parse_mac(field: Option<&str>) -> Result<MacAddress, TraceError> {
    field.map_or(Ok(MacAddress::ZERO), |s| {
        s.parse().map_err(|e: sonic_fabric_types::ParseError| TraceError::invalid_probe(e.to_string()))
    })
}

fn parse_ipv4(field: Option<&str>) -> Result<Ipv4Addr, TraceError> {
    field.map_or(Ok(Ipv4Addr::UNSPECIFIED), |s| {
        s.parse()
            .map_err(|_| TraceError::invalid_probe(format!("invalid IPv4 address: {}", s)))
    })
}

/// Error response structure
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ApiErrorResponse {
    /// HTTP status code
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// A trace error on its way to the client.
#[derive(Debug)]
pub struct ApiError(pub TraceError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            TraceError::InvalidProbe(_) => StatusCode::BAD_REQUEST,
            TraceError::UnknownEndpoint(_) => StatusCode::NOT_FOUND,
            TraceError::TooManyColors { .. } | TraceError::TopologyUnstable { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ApiErrorResponse {
            code: status.as_u16(),
            message: status
                .canonical_reason()
                .unwrap_or("error")
                .to_string(),
            details: Some(self.0.to_string()),
        };
        (status, Json(body)).into_response()
    }
}

impl From<TraceError> for ApiError {
    fn from(error: TraceError) -> Self {
        Self(error)
    }
}

/// Builds the router for `service`, with every route under `base_path`.
pub fn router(service: Arc<TraceService>, base_path: &str) -> Router {
    let base = base_path.trim_end_matches('/');
    Router::new()
        .route(&format!("{}/trace/json", base), post(trace_handler))
        .route(&format!("{}/status", base), get(status_handler))
        .with_state(service)
}

pub async fn trace_handler(
    State(service): State<Arc<TraceService>>,
    payload: Result<Json<TraceRequest>, JsonRejection>,
) -> Result<Json<Vec<Hop>>, ApiError> {
    let Json(request) =
        payload.map_err(|rejection| TraceError::invalid_probe(rejection.body_text()))?;
    let probe = request.into_probe()?;
    info!(src = %probe.eth_src, dst = %probe.eth_dst, "Trace requested via REST API");

    match service.trace_route(probe).await {
        Ok(report) => Ok(Json(report.hops)),
        Err(e) => {
            error!(error = %e, "Trace request failed");
            Err(ApiError(e))
        }
    }
}

pub async fn status_handler(State(service): State<Arc<TraceService>>) -> Json<ServiceStatus> {
    Json(service.status())
}
