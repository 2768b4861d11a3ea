use anyhow::{bail, Context, Result};
use axum::extract::connect_info::Connected;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::serve::IncomingStream;
use axum::Router;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::settings::Settings;
use crate::state::{AppState, ErrorResponse, HistoryPoint, MessageResponse, StatusResponse};

// ---------------------------------------------------------------------------
// Local-network filter
// ---------------------------------------------------------------------------

/// Prefix used to compare caller and interface when no subnet is configured.
const INTERFACE_PREFIX: u8 = 24;

/// Which callers count as "on the local network". Loopback is always local.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalNetwork {
    /// Same /24 as the interface address the request arrived on.
    SameSubnet,
    /// An explicit IPv4 subnet.
    Subnet { network: Ipv4Addr, prefix: u8 },
}

impl LocalNetwork {
    /// Parse an IPv4 CIDR such as `192.168.1.0/24`.
    pub fn parse(cidr: &str) -> Result<Self> {
        let Some((addr, prefix)) = cidr.trim().split_once('/') else {
            bail!("{cidr:?} is not a CIDR (expected e.g. 192.168.1.0/24)");
        };
        let addr: Ipv4Addr = addr
            .parse()
            .with_context(|| format!("invalid IPv4 address in {cidr:?}"))?;
        let prefix: u8 = prefix
            .parse()
            .with_context(|| format!("invalid prefix length in {cidr:?}"))?;
        if prefix > 32 {
            bail!("prefix length {prefix} in {cidr:?} exceeds 32");
        }
        Ok(Self::Subnet {
            network: Ipv4Addr::from(u32::from(addr) & mask(prefix)),
            prefix,
        })
    }

    /// `local` is the address the connection was accepted on.
    pub fn allows(&self, remote: IpAddr, local: Option<IpAddr>) -> bool {
        let remote = remote.to_canonical();
        if remote.is_loopback() {
            return true;
        }
        let IpAddr::V4(remote) = remote else {
            return false;
        };
        match self {
            Self::SameSubnet => match local.map(|ip| ip.to_canonical()) {
                Some(IpAddr::V4(local)) if !local.is_unspecified() => {
                    let m = mask(INTERFACE_PREFIX);
                    u32::from(remote) & m == u32::from(local) & m
                }
                _ => false,
            },
            Self::Subnet { network, prefix } => {
                u32::from(remote) & mask(*prefix) == u32::from(*network)
            }
        }
    }
}

fn mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

/// Both ends of an accepted TCP connection.
#[derive(Debug, Clone, Copy)]
pub struct PeerAddrs {
    pub remote: SocketAddr,
    pub local: Option<SocketAddr>,
}

impl Connected<IncomingStream<'_, TcpListener>> for PeerAddrs {
    fn connect_info(stream: IncomingStream<'_, TcpListener>) -> Self {
        Self {
            remote: *stream.remote_addr(),
            local: stream.io().local_addr().ok(),
        }
    }
}

async fn local_only(State(network): State<LocalNetwork>, req: Request, next: Next) -> Response {
    let peer = req.extensions().get::<ConnectInfo<PeerAddrs>>().map(|c| c.0);

    match peer {
        Some(p) if network.allows(p.remote.ip(), p.local.map(|a| a.ip())) => next.run(req).await,
        _ => {
            warn!(peer = ?peer.map(|p| p.remote), path = %req.uri().path(), "rejected non-local caller");
            (
                StatusCode::FORBIDDEN,
                Json(ErrorResponse { error: "Forbidden" }),
            )
                .into_response()
        }
    }
}

async fn cors_headers(req: Request, next: Next) -> Response {
    let mut res = next.run(req).await;
    let headers = res.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Origin, X-Requested-With, Content-Type, Accept"),
    );
    res
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route(
            "/config",
            get(get_config).post(post_config).options(config_preflight),
        )
        .route("/status", get(status))
        .route("/history", get(history))
        .route("/water", post(water))
        .route("/stop", post(stop))
        .layer(middleware::from_fn_with_state(state.network, local_only))
        .layer(middleware::from_fn(cors_headers))
        .with_state(state)
}

async fn index(State(state): State<AppState>) -> String {
    let name = state.settings.name();
    if name.is_empty() {
        "Hello from HydroHomie".to_string()
    } else {
        format!("Hello from {name}")
    }
}

async fn get_config(State(state): State<AppState>) -> Json<Settings> {
    Json(state.settings.current())
}

async fn post_config(State(state): State<AppState>, body: String) -> Response {
    if body.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "No JSON payload",
            }),
        )
            .into_response();
    }

    match state.settings.apply_json(&body).await {
        Ok(_) => Json(MessageResponse {
            message: "Configuration updated successfully",
        })
        .into_response(),
        Err(e) => {
            warn!("settings update rejected: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "Failed to update configuration",
                }),
            )
                .into_response()
        }
    }
}

async fn config_preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let controller = state.controller.lock().await;
    Json(controller.to_status())
}

async fn history(State(state): State<AppState>) -> Json<Vec<HistoryPoint>> {
    let controller = state.controller.lock().await;
    Json(controller.to_history())
}

async fn water(State(state): State<AppState>) -> Json<MessageResponse> {
    state.controller.lock().await.force_start_watering();
    Json(MessageResponse {
        message: "Watering started",
    })
}

async fn stop(State(state): State<AppState>) -> Json<MessageResponse> {
    state.controller.lock().await.force_stop_watering();
    Json(MessageResponse {
        message: "Watering stopped",
    })
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve<F>(state: AppState, port: u16, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "http api listening");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<PeerAddrs>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("web server error")?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
