//! HTTP API of the virtual network.

use crate::dhcp::DhcpServer;
use crate::dns::DnsServer;
use crate::forwarder::{PortsForwarder, UdpForwarder};
use crate::switch::Switch;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Stats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub connections: usize,
    pub udp_flows: usize,
}

#[derive(Clone)]
struct StatsState {
    switch: Arc<Switch>,
    udp: Arc<UdpForwarder>,
}

pub fn stats(switch: &Switch, udp: &UdpForwarder) -> Stats {
    Stats {
        bytes_sent: switch.bytes_sent(),
        bytes_received: switch.bytes_received(),
        connections: switch.connections(),
        udp_flows: udp.active(),
    }
}

/// Mounts every service under its prefix: `/forwarder`, `/dhcp`, `/dns`,
/// plus `/stats` and `/cam`.
pub fn mux(
    switch: Arc<Switch>,
    udp: Arc<UdpForwarder>,
    dhcp: &Arc<DhcpServer>,
    dns: &Arc<DnsServer>,
    ports: &Arc<PortsForwarder>,
) -> Router {
    Router::new()
        .route("/stats", get(stats_handler))
        .route("/cam", get(cam_handler))
        .with_state(StatsState { switch, udp })
        .nest("/forwarder", ports.mux())
        .nest("/dhcp", dhcp.mux())
        .nest("/dns", dns.mux())
}

async fn stats_handler(State(state): State<StatsState>) -> Json<Stats> {
    Json(stats(&state.switch, &state.udp))
}

async fn cam_handler(State(state): State<StatsState>) -> Json<HashMap<String, u64>> {
    Json(state.switch.cam())
}
