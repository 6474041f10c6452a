//! Networked TCP transport
//!
//! A TCP listener speaking length-prefixed JSON-RPC. Each connection
//! carries its own session state, a token-bucket rate limiter, and an
//! activity clock; a janitor sweeps idle connections once per minute.
//! Requests on one connection are processed in arrival order, so responses
//! are FIFO per connection.

use crate::auth::Authenticator;
use crate::mcp::{self, Session};
use crate::rpc::{self, JsonRpcResponse, RpcError, PARSE_ERROR, RATE_LIMIT_EXCEEDED};
use crate::state::ServerState;
use crate::tools::ToolRegistry;
use dashmap::DashMap;
use dshield_core::{DshieldError, DshieldResult, TcpTransportConfig, TransportError};
use governor::{Quota, RateLimiter};
use serde_json::Value;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

type ConnectionLimiter =
    RateLimiter<governor::state::NotKeyed, governor::state::InMemoryState, governor::clock::DefaultClock>;

/// Bounded wait for in-flight work during shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// Janitor sweep interval.
const JANITOR_INTERVAL: Duration = Duration::from_secs(60);

struct ConnectionEntry {
    handle: tokio::task::JoinHandle<()>,
    last_activity_ms: Arc<AtomicI64>,
    peer: std::net::SocketAddr,
}

/// The TCP transport.
pub struct TcpTransport {
    state: Arc<ServerState>,
    registry: Arc<ToolRegistry>,
    authenticator: Arc<Authenticator>,
    config: TcpTransportConfig,
}

impl TcpTransport {
    pub fn new(
        state: Arc<ServerState>,
        registry: Arc<ToolRegistry>,
        authenticator: Arc<Authenticator>,
    ) -> Self {
        let config = state.config.tcp_transport.clone();
        Self {
            state,
            registry,
            authenticator,
            config,
        }
    }

    /// Accept and serve connections until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> DshieldResult<()> {
        let bind = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(&bind).await.map_err(|e| {
            DshieldError::from(TransportError::Framing {
                reason: format!("failed to bind {}: {}", bind, e),
            })
        })?;

        if !self.authenticator.required() {
            tracing::warn!("no api keys configured; network transport runs unauthenticated");
        }
        tracing::info!(%bind, max_connections = self.config.max_connections, "tcp transport listening");

        let connections: Arc<DashMap<u64, ConnectionEntry>> = Arc::new(DashMap::new());
        let mut next_connection_id: u64 = 0;

        let janitor = tokio::spawn(Self::janitor(
            connections.clone(),
            self.config.connection_timeout_seconds,
            shutdown.clone(),
        ));

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };

                    // Reap finished connections before checking the cap
                    connections.retain(|_, entry| !entry.handle.is_finished());
                    if connections.len() >= self.config.max_connections {
                        tracing::warn!(%peer, "connection cap reached, refusing");
                        drop(stream);
                        continue;
                    }

                    let id = next_connection_id;
                    next_connection_id += 1;
                    let last_activity_ms = Arc::new(AtomicI64::new(now_ms()));
                    let handle = tokio::spawn(handle_connection(
                        stream,
                        peer,
                        self.state.clone(),
                        self.registry.clone(),
                        self.authenticator.clone(),
                        self.config.clone(),
                        last_activity_ms.clone(),
                        shutdown.clone(),
                    ));
                    tracing::info!(%peer, id, "connection accepted");
                    connections.insert(id, ConnectionEntry { handle, last_activity_ms, peer });
                }
                _ = shutdown.changed() => break,
            }
        }

        // Stop accepting, then give in-flight work a bounded window
        tracing::info!("tcp transport shutting down");
        drop(listener);
        janitor.abort();

        let deadline = tokio::time::Instant::now() + SHUTDOWN_DEADLINE;
        for entry in connections.iter() {
            if tokio::time::timeout_at(deadline, async {
                while !entry.handle.is_finished() {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            })
            .await
            .is_err()
            {
                break;
            }
        }
        for entry in connections.iter() {
            if !entry.handle.is_finished() {
                tracing::warn!(peer = %entry.peer, "abandoning connection at shutdown deadline");
                entry.handle.abort();
            }
        }
        connections.clear();

        Ok(())
    }

    /// Close connections idle past the configured timeout.
    async fn janitor(
        connections: Arc<DashMap<u64, ConnectionEntry>>,
        timeout_seconds: u64,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(JANITOR_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }

            let cutoff = now_ms() - (timeout_seconds as i64) * 1000;
            // Iterate a snapshot of ids; removal mutates the map
            let idle: Vec<u64> = connections
                .iter()
                .filter(|entry| entry.last_activity_ms.load(Ordering::Relaxed) < cutoff)
                .map(|entry| *entry.key())
                .collect();

            for id in idle {
                if let Some((_, entry)) = connections.remove(&id) {
                    tracing::info!(peer = %entry.peer, id, "closing idle connection");
                    entry.handle.abort();
                }
            }
            connections.retain(|_, entry| !entry.handle.is_finished());
        }
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("bind_address", &self.config.bind_address)
            .field("port", &self.config.port)
            .finish()
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn connection_limiter(config: &TcpTransportConfig) -> ConnectionLimiter {
    let rpm = NonZeroU32::new(config.rate_limit_requests_per_minute.max(1))
        .expect("validated positive");
    let burst = NonZeroU32::new(config.rate_limit_burst.max(1)).expect("validated positive");
    RateLimiter::direct(Quota::per_minute(rpm).allow_burst(burst))
}

/// Serve one connection: read a frame, process it, respond, repeat.
#[allow(clippy::too_many_arguments)]
async fn handle_connection(
    stream: TcpStream,
    peer: std::net::SocketAddr,
    state: Arc<ServerState>,
    registry: Arc<ToolRegistry>,
    authenticator: Arc<Authenticator>,
    config: TcpTransportConfig,
    last_activity_ms: Arc<AtomicI64>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);

    let limiter = connection_limiter(&config);
    let mut session = Session::network(authenticator.required());

    loop {
        let frame = tokio::select! {
            frame = rpc::read_frame(&mut reader, config.max_message_size_bytes) => frame,
            _ = shutdown.changed() => {
                tracing::debug!(%peer, "connection cancelled by shutdown");
                return;
            }
        };

        let payload = match frame {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                tracing::info!(%peer, "peer closed connection");
                return;
            }
            Err(err) => {
                // Framing violations are reported once, then the
                // connection is closed.
                tracing::warn!(%peer, error = %err, "framing error, closing connection");
                let response = JsonRpcResponse::from_error(Value::Null, &err);
                let _ = rpc::write_response(&mut writer, &response).await;
                return;
            }
        };

        last_activity_ms.store(now_ms(), Ordering::Relaxed);

        let response = if limiter.check().is_err() {
            Some(JsonRpcResponse::error(
                request_id(&payload),
                RpcError::new(RATE_LIMIT_EXCEEDED, "rate limit exceeded"),
            ))
        } else {
            match serde_json::from_slice::<rpc::JsonRpcRequest>(&payload) {
                Ok(request) => {
                    mcp::handle_request(&state, &registry, &authenticator, &mut session, request)
                        .await
                }
                Err(err) => Some(JsonRpcResponse::error(
                    Value::Null,
                    RpcError::new(PARSE_ERROR, format!("parse error: {}", err)),
                )),
            }
        };

        if let Some(response) = response {
            if let Err(err) = rpc::write_response(&mut writer, &response).await {
                tracing::warn!(%peer, error = %err, "write failed, closing connection");
                return;
            }
        }
    }
}

/// Best-effort id extraction for error responses to unparsed payloads.
fn request_id(payload: &[u8]) -> Value {
    serde_json::from_slice::<Value>(payload)
        .ok()
        .and_then(|v| v.get("id").cloned())
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limiter_burst_then_deny() {
        let config = TcpTransportConfig {
            rate_limit_requests_per_minute: 60,
            rate_limit_burst: 3,
            ..Default::default()
        };
        let limiter = connection_limiter(&config);

        for _ in 0..3 {
            assert!(limiter.check().is_ok());
        }
        // Burst exhausted; the next check within the same instant is denied
        assert!(limiter.check().is_err());
    }

    #[test]
    fn test_request_id_extraction() {
        assert_eq!(request_id(br#"{"id": 42, "method": "x"}"#), serde_json::json!(42));
        assert_eq!(request_id(b"not json"), Value::Null);
        assert_eq!(request_id(br#"{"method": "x"}"#), Value::Null);
    }
}
