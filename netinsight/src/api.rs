use axum::{
    extract::{ws::{Message, WebSocket}, ConnectInfo, Query, State, WebSocketUpgrade},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use ipnet::IpNet;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use netinsight::snapshot::TableSnapshot;

pub struct AppState {
    pub interface: String,
    pub snapshots: watch::Receiver<TableSnapshot>,
    pub start_time: Instant,
}

impl AppState {
    fn latest(&self) -> TableSnapshot {
        self.snapshots.borrow().clone()
    }
}

// ── Prometheus Metrics ────────────────────────────────────────────────────────

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct FlowLabels {
    source: String,
    destination: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ConnectionLabels {
    source: String,
    destination: String,
    source_port: String,
    destination_port: String,
    protocol: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ProtocolLabels {
    protocol: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct DropLabels {
    reason: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct TableLabels {
    table: String,
}

/// Registry rebuilt from one snapshot per scrape, so label sets of rows that
/// were drained or evicted do not linger.
struct Metrics {
    registry: Registry,
}

impl Metrics {
    fn from_snapshot(snapshot: &TableSnapshot) -> Self {
        let mut registry = Registry::default();

        let flow_packets = Family::<FlowLabels, Gauge>::default();
        let flow_bytes = Family::<FlowLabels, Gauge>::default();
        let flow_latency = Family::<FlowLabels, Gauge>::default();
        let flow_packet_size = Family::<FlowLabels, Gauge>::default();
        for flow in &snapshot.flows {
            let labels = FlowLabels {
                source: flow.src_ip.clone(),
                destination: flow.dst_ip.clone(),
            };
            flow_packets.get_or_create(&labels).set(gauge_value(flow.packets));
            flow_bytes.get_or_create(&labels).set(gauge_value(flow.bytes));
            flow_latency
                .get_or_create(&labels)
                .set(gauge_value(flow.latency_sum_ns));
            if let Some(size) = flow.avg_packet_bytes {
                flow_packet_size.get_or_create(&labels).set(gauge_value(size));
            }
        }

        let connection_packets = Family::<ConnectionLabels, Gauge>::default();
        for conn in &snapshot.connections {
            connection_packets
                .get_or_create(&ConnectionLabels {
                    source: conn.src_ip.clone(),
                    destination: conn.dst_ip.clone(),
                    source_port: conn.src_port.to_string(),
                    destination_port: conn.dst_port.to_string(),
                    protocol: conn.protocol.clone(),
                })
                .set(gauge_value(conn.packets));
        }

        let protocol_packets = Family::<ProtocolLabels, Gauge>::default();
        for (protocol, packets) in [
            ("TCP", snapshot.protocols.tcp),
            ("UDP", snapshot.protocols.udp),
        ] {
            protocol_packets
                .get_or_create(&ProtocolLabels {
                    protocol: protocol.to_string(),
                })
                .set(gauge_value(packets));
        }

        let drops = Family::<DropLabels, Gauge>::default();
        for drop in &snapshot.drops {
            drops
                .get_or_create(&DropLabels {
                    reason: drop.reason.clone(),
                })
                .set(gauge_value(drop.count));
        }

        let overflows = Family::<TableLabels, Gauge>::default();
        for overflow in &snapshot.overflows {
            overflows
                .get_or_create(&TableLabels {
                    table: overflow.table.to_string(),
                })
                .set(gauge_value(overflow.lost));
        }

        let pending = Gauge::<i64>::default();
        pending.set(snapshot.pending_timestamps as i64);

        registry.register(
            "netinsight_flow_packets",
            "Packets per host pair",
            flow_packets,
        );
        registry.register(
            "netinsight_flow_bytes",
            "Bytes per host pair",
            flow_bytes,
        );
        registry.register(
            "netinsight_flow_latency_sum_nanoseconds",
            "Sum of alternating inter-arrival gaps per host pair",
            flow_latency,
        );
        registry.register(
            "netinsight_flow_avg_packet_bytes",
            "Mean frame size per host pair",
            flow_packet_size,
        );
        registry.register(
            "netinsight_connection_packets",
            "Packets per connection 5-tuple",
            connection_packets,
        );
        registry.register(
            "netinsight_protocol_packets",
            "Packets per transport protocol",
            protocol_packets,
        );
        registry.register(
            "netinsight_packet_drops",
            "Dropped packets per reason",
            drops,
        );
        registry.register(
            "netinsight_table_overflows",
            "Inserts lost because a table was full",
            overflows,
        );
        registry.register(
            "netinsight_pending_timestamps",
            "Host pairs waiting for their second packet",
            pending,
        );

        Self { registry }
    }

    fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

fn gauge_value(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

// ── Response Types ────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    interface: String,
    uptime_seconds: u64,
    last_read: i64,
    total_packets: u64,
}

#[derive(Serialize)]
struct Totals {
    taken_at: i64,
    total_packets: u64,
    total_bytes: u64,
    flows: usize,
    connections: usize,
}

#[derive(Deserialize)]
pub struct LimitParams {
    limit: Option<usize>,
}

impl LimitParams {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(100).min(1024)
    }
}

// ── Router ────────────────────────────────────────────────────────────────────

pub fn router(state: Arc<AppState>, allowed_ips: &[String]) -> Router {
    let mut app = Router::new()
        .route("/api/health", get(get_health))
        .route("/api/tables", get(get_tables))
        .route("/api/flows", get(get_flows))
        .route("/api/connections", get(get_connections))
        .route("/api/stream", get(ws_handler))
        .route("/metrics", get(get_metrics));

    // Apply IP allowlist middleware if configured.
    if !allowed_ips.is_empty() {
        let nets: Arc<Vec<IpNet>> = Arc::new(
            allowed_ips
                .iter()
                .filter_map(|s| match s.parse::<IpNet>() {
                    Ok(net) => Some(net),
                    Err(e) => {
                        tracing::warn!("ignoring allowed_ips entry {:?}: {}", s, e);
                        None
                    }
                })
                .collect(),
        );
        app = app.layer(middleware::from_fn(move |req, next| {
            let nets = nets.clone();
            ip_allowlist(req, next, nets)
        }));
    }

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

// ── IP Allowlist Middleware ────────────────────────────────────────────────────

async fn ip_allowlist(
    req: axum::extract::Request,
    next: middleware::Next,
    allowed: Arc<Vec<IpNet>>,
) -> impl IntoResponse {
    if let Some(connect_info) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        let ip = connect_info.0.ip();
        if allowed.iter().any(|net| net.contains(&ip)) {
            return next.run(req).await.into_response();
        }
        return StatusCode::FORBIDDEN.into_response();
    }
    // Without ConnectInfo there is no peer to check.
    next.run(req).await.into_response()
}

// ── Handlers ──────────────────────────────────────────────────────────────────

async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let snapshot = state.snapshots.borrow();
    Json(HealthResponse {
        status: "ok".to_string(),
        interface: state.interface.clone(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        last_read: snapshot.taken_at,
        total_packets: snapshot.total_packets,
    })
}

async fn get_tables(State(state): State<Arc<AppState>>) -> Json<TableSnapshot> {
    Json(state.latest())
}

async fn get_flows(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LimitParams>,
) -> Json<serde_json::Value> {
    let snapshot = state.snapshots.borrow();
    let flows: Vec<_> = snapshot.flows.iter().take(params.limit()).collect();
    Json(serde_json::json!({
        "taken_at": snapshot.taken_at,
        "flows": flows,
    }))
}

async fn get_connections(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LimitParams>,
) -> Json<serde_json::Value> {
    let snapshot = state.snapshots.borrow();
    let connections: Vec<_> = snapshot.connections.iter().take(params.limit()).collect();
    Json(serde_json::json!({
        "taken_at": snapshot.taken_at,
        "protocols": snapshot.protocols,
        "connections": connections,
    }))
}

async fn get_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.latest();
    match Metrics::from_snapshot(&snapshot).encode() {
        Ok(body) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(1));

    loop {
        interval.tick().await;

        let totals = {
            let snapshot = state.snapshots.borrow();
            Totals {
                taken_at: snapshot.taken_at,
                total_packets: snapshot.total_packets,
                total_bytes: snapshot.total_bytes,
                flows: snapshot.flows.len(),
                connections: snapshot.connections.len(),
            }
        };
        let Ok(text) = serde_json::to_string(&totals) else {
            break;
        };

        if socket.send(Message::Text(text)).await.is_err() {
            break;
        }
    }
}
