// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request and connection bookkeeping.
//!
//! Request handlers never touch shared counters. They push events into
//! unbounded channels, each drained by a single task that owns its state.
//! Snapshots are requested through the same channels, so they observe every
//! event sent before them.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// HTTP connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
    /// Accepted, no request read yet.
    New,
    /// A request is being served.
    Active,
    /// Keep-alive, waiting for the next request.
    Idle,
    /// Taken over by a protocol upgrade.
    Hijacked,
    /// Closed.
    Closed,
}

impl ConnState {
    /// Lowercase state name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnState::New => "new",
            ConnState::Active => "active",
            ConnState::Idle => "idle",
            ConnState::Hijacked => "hijacked",
            ConnState::Closed => "closed",
        }
    }
}

/// Request totals since the last reset.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RequestTotals {
    /// Requests served.
    pub requests: u64,
    /// Sum of request durations.
    pub total_time: Duration,
}

enum RequestEvent {
    Served(Duration),
    Reset,
    Snapshot(oneshot::Sender<RequestTotals>),
}

enum ConnEvent {
    Transition(u64, ConnState),
    Snapshot(oneshot::Sender<BTreeMap<String, usize>>),
}

/// Handle to the two aggregator tasks. Cheap to clone.
#[derive(Debug, Clone)]
pub struct StatsRecorder {
    requests: mpsc::UnboundedSender<RequestEvent>,
    conns: mpsc::UnboundedSender<ConnEvent>,
}

impl StatsRecorder {
    /// Spawn the aggregators. They stop once every recorder is dropped.
    pub fn spawn() -> Self {
        let (requests, request_rx) = mpsc::unbounded_channel();
        let (conns, conn_rx) = mpsc::unbounded_channel();
        tokio::spawn(aggregate_requests(request_rx));
        tokio::spawn(aggregate_conns(conn_rx));
        Self { requests, conns }
    }

    /// Record one served request.
    pub fn record_request(&self, elapsed: Duration) {
        let _ = self.requests.send(RequestEvent::Served(elapsed));
    }

    /// Zero the request totals.
    pub fn reset(&self) {
        let _ = self.requests.send(RequestEvent::Reset);
    }

    /// Record a connection state transition.
    pub fn conn_state(&self, conn_id: u64, state: ConnState) {
        let _ = self.conns.send(ConnEvent::Transition(conn_id, state));
    }

    /// Current request totals.
    pub async fn request_totals(&self) -> RequestTotals {
        let (tx, rx) = oneshot::channel();
        if self.requests.send(RequestEvent::Snapshot(tx)).is_err() {
            return RequestTotals::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Number of live connections per state name.
    pub async fn conn_states(&self) -> BTreeMap<String, usize> {
        let (tx, rx) = oneshot::channel();
        if self.conns.send(ConnEvent::Snapshot(tx)).is_err() {
            return BTreeMap::new();
        }
        rx.await.unwrap_or_default()
    }
}

async fn aggregate_requests(mut rx: mpsc::UnboundedReceiver<RequestEvent>) {
    let mut totals = RequestTotals::default();
    while let Some(event) = rx.recv().await {
        match event {
            RequestEvent::Served(elapsed) => {
                totals.requests += 1;
                totals.total_time += elapsed;
            }
            RequestEvent::Reset => totals = RequestTotals::default(),
            RequestEvent::Snapshot(reply) => {
                let _ = reply.send(totals);
            }
        }
    }
    debug!("Request stats aggregator stopped");
}

async fn aggregate_conns(mut rx: mpsc::UnboundedReceiver<ConnEvent>) {
    let mut states: HashMap<u64, ConnState> = HashMap::new();
    while let Some(event) = rx.recv().await {
        match event {
            ConnEvent::Transition(id, ConnState::Closed | ConnState::Hijacked) => {
                states.remove(&id);
            }
            ConnEvent::Transition(id, state) => {
                states.insert(id, state);
            }
            ConnEvent::Snapshot(reply) => {
                let mut counts = BTreeMap::new();
                for state in states.values() {
                    *counts.entry(state.as_str().to_string()).or_insert(0) += 1;
                }
                let _ = reply.send(counts);
            }
        }
    }
    debug!("Connection state aggregator stopped");
}
