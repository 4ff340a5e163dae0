// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Accept loop for the proxy.

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

use super::{ConnMeta, ConnState, Proxy};

/// Serve the proxy on `listener` until `shutdown` turns true.
///
/// Open connections finish their in-flight request and then close.
pub async fn serve(
    listener: TcpListener,
    proxy: Proxy,
    shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "Proxy listening");
    let mut next_id: u64 = 0;

    loop {
        let (stream, peer) = tokio::select! {
            biased;

            _ = shutdown_signal(shutdown.clone()) => {
                info!("Proxy shutting down");
                return Ok(());
            }

            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    continue;
                }
            },
        };

        next_id += 1;
        let id = next_id;
        let conn = ConnMeta { id, peer };
        let recorder = proxy.recorder().clone();
        recorder.conn_state(id, ConnState::New);

        let proxy = proxy.clone();
        let conn_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let proxy = proxy.clone();
                async move {
                    let recorder = proxy.recorder().clone();
                    recorder.conn_state(conn.id, ConnState::Active);
                    let response = proxy.handle(req, conn).await;
                    recorder.conn_state(conn.id, ConnState::Idle);
                    response
                }
            });

            let connection = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades();
            tokio::pin!(connection);

            let result = tokio::select! {
                result = connection.as_mut() => result,
                _ = shutdown_signal(conn_shutdown) => {
                    connection.as_mut().graceful_shutdown();
                    connection.await
                }
            };
            if let Err(e) = result {
                debug!(conn_id = id, error = %e, "Connection error");
            }
            recorder.conn_state(id, ConnState::Closed);
        });
    }
}

async fn shutdown_signal(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
