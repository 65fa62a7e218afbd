//! Single-shot HTTP endpoint that waits for an operator to POST a key.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, StatusCode};
use regex::Regex;
use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::{SshConfig, SshStrategy};
use crate::error::Cancelled;

/// Base64 body of an OpenSSH ed25519 public key.
static KEY_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9+/]{68}$").ok());

const MSG_METHOD: &str = "Only POST method is allowed";
const MSG_INVALID: &str = "Invalid key format, expected base64-encoded OpenSSH ed25519 public key";
const MSG_ACCEPTED: &str = "SSH key received and stored successfully";
const MSG_TAKEN: &str = "SSH key already received";

/// How long open connections get to finish once a key is in.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[async_trait]
pub trait KeyHandshake: Send + Sync {
    /// Block until a valid key arrives or `cancel` fires.
    async fn wait_for_key(&self, cancel: &CancellationToken) -> Result<String>;
}

pub fn handshake_for(config: &SshConfig) -> Result<Box<dyn KeyHandshake>> {
    Ok(match config.strategy()? {
        SshStrategy::WebServer { listen } => Box::new(NetworkHandshake::new(listen)),
    })
}

pub fn is_valid_key(key: &str) -> bool {
    KEY_PATTERN.as_ref().is_some_and(|pattern| pattern.is_match(key))
}

pub struct NetworkHandshake {
    listen: SocketAddr,
}

impl NetworkHandshake {
    pub fn new(listen: SocketAddr) -> Self {
        Self { listen }
    }
}

#[async_trait]
impl KeyHandshake for NetworkHandshake {
    async fn wait_for_key(&self, cancel: &CancellationToken) -> Result<String> {
        let listener = TcpListener::bind(self.listen)
            .await
            .with_context(|| format!("failed to listen on {}", self.listen))?;
        serve(listener, cancel).await
    }
}

type KeySlot = Arc<Mutex<Option<oneshot::Sender<String>>>>;

/// Serve the handshake on `listener` until one valid key is accepted.
///
/// The server is shut down before returning, whichever way the wait ends.
pub async fn serve(listener: TcpListener, cancel: &CancellationToken) -> Result<String> {
    let (tx, rx) = oneshot::channel();
    let slot: KeySlot = Arc::new(Mutex::new(Some(tx)));
    let app = Router::new().fallback(submit).with_state(slot);

    if let Ok(addr) = listener.local_addr() {
        log::info!("starting web server on {addr} to receive SSH key");
    }

    let stop = CancellationToken::new();
    let server =
        axum::serve(listener, app).with_graceful_shutdown(stop.clone().cancelled_owned());
    let mut server = tokio::spawn(async move { server.await });

    let outcome = tokio::select! {
        _ = cancel.cancelled() => Err(Cancelled.into()),
        exited = &mut server => {
            return Err(match exited {
                Ok(Ok(())) => anyhow!("server stopped before a key was received"),
                Ok(Err(e)) => anyhow::Error::new(e).context("server error"),
                Err(e) => anyhow::Error::new(e).context("server task failed"),
            });
        }
        received = rx => received.map_err(|_| anyhow!("key channel closed without a key")),
    };

    stop.cancel();
    if outcome.is_err() {
        server.abort();
        let _ = server.await;
        return outcome;
    }
    match tokio::time::timeout(DRAIN_TIMEOUT, &mut server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => log::warn!("web server exited with error: {e}"),
        Ok(Err(e)) => log::warn!("web server task failed: {e}"),
        Err(_) => {
            log::warn!("web server connections still open, closing them");
            server.abort();
            let _ = server.await;
        }
    }
    outcome
}

async fn submit(
    State(slot): State<KeySlot>,
    method: Method,
    body: Bytes,
) -> (StatusCode, &'static str) {
    if method != Method::POST {
        return (StatusCode::METHOD_NOT_ALLOWED, MSG_METHOD);
    }

    let Ok(key) = std::str::from_utf8(&body) else {
        return (StatusCode::BAD_REQUEST, MSG_INVALID);
    };
    if !is_valid_key(key) {
        log::warn!("rejected malformed SSH key submission ({} bytes)", body.len());
        return (StatusCode::BAD_REQUEST, MSG_INVALID);
    }

    let Some(sender) = slot.lock().await.take() else {
        return (StatusCode::CONFLICT, MSG_TAKEN);
    };
    if sender.send(key.to_string()).is_err() {
        return (StatusCode::CONFLICT, MSG_TAKEN);
    }
    (StatusCode::OK, MSG_ACCEPTED)
}
