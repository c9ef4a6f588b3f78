//! Local control endpoint: newline-delimited JSON over TCP.
//!
//! Each line is one [`ControlRequest`]; the daemon answers every line with
//! exactly one [`ControlResponse`] line. The CLI uses [`ControlClient`].

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_stream::wrappers::{LinesStream, TcpListenerStream};
use tracing::{debug, info, warn};

use crate::apply::{DeadLetterRecord, ReplayReport};
use crate::engine::Engine;
use crate::error::ErrorKind;
use crate::subscription::{SubscriptionState, SubscriptionStatus};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum ControlRequest {
    Start { subscription: String },
    Stop { subscription: String },
    Pause { subscription: String },
    Resume { subscription: String },
    Status { subscription: String },
    DeadLetters { subscription: String },
    ReplayDeadLetters { subscription: String },
}

impl ControlRequest {
    pub fn subscription(&self) -> &str {
        match self {
            ControlRequest::Start { subscription }
            | ControlRequest::Stop { subscription }
            | ControlRequest::Pause { subscription }
            | ControlRequest::Resume { subscription }
            | ControlRequest::Status { subscription }
            | ControlRequest::DeadLetters { subscription }
            | ControlRequest::ReplayDeadLetters { subscription } => subscription,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<SubscriptionState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SubscriptionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_letters: Option<Vec<DeadLetterRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay: Option<ReplayReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ControlError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ControlResponse {
    fn success() -> Self {
        Self {
            ok: true,
            ..Default::default()
        }
    }

    fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(ControlError {
                kind,
                message: message.into(),
            }),
            ..Default::default()
        }
    }

    fn from_error(error: &Error) -> Self {
        Self::failure(error.kind(), error.to_string())
    }
}

pub async fn bind(addr: &str) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Control endpoint listening");
    Ok(listener)
}

/// Serves control connections until `shutdown` turns true.
pub async fn serve(
    engine: Arc<Engine>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut incoming = TcpListenerStream::new(listener);
    loop {
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            connection = incoming.next() => match connection {
                Some(Ok(stream)) => {
                    let engine = engine.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(engine, stream).await {
                            warn!("Control connection failed: {}", e);
                        }
                    });
                }
                Some(Err(e)) => warn!("Failed to accept control connection: {}", e),
                None => break,
            },
        }
    }
    debug!("Control endpoint closed");
    Ok(())
}

async fn handle_connection(engine: Arc<Engine>, stream: TcpStream) -> Result<()> {
    let peer = stream.peer_addr()?;
    debug!(peer = %peer, "Control connection opened");

    let (reader, mut writer) = stream.into_split();
    let mut lines = LinesStream::new(BufReader::new(reader).lines());
    while let Some(line) = lines.next().await {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<ControlRequest>(&line) {
            Ok(request) => handle_request(&engine, request).await,
            Err(e) => ControlResponse::failure(
                ErrorKind::Unsupported,
                format!("invalid control request: {}", e),
            ),
        };
        let mut encoded = serde_json::to_vec(&response)?;
        encoded.push(b'\n');
        writer.write_all(&encoded).await?;
    }
    debug!(peer = %peer, "Control connection closed");
    Ok(())
}

async fn handle_request(engine: &Engine, request: ControlRequest) -> ControlResponse {
    info!(request = ?request, "Control request");
    let name = request.subscription();
    let result = match &request {
        ControlRequest::Start { .. } => engine.start(name).await.map(with_state),
        ControlRequest::Stop { .. } => engine.stop(name).await.map(with_state),
        ControlRequest::Pause { .. } => engine.pause(name).await.map(with_state),
        ControlRequest::Resume { .. } => engine.resume(name).await.map(with_state),
        ControlRequest::Status { .. } => engine.status(name).map(|status| ControlResponse {
            state: Some(status.state),
            status: Some(status),
            ..ControlResponse::success()
        }),
        ControlRequest::DeadLetters { .. } => {
            engine
                .dead_letters(name)
                .await
                .map(|records| ControlResponse {
                    dead_letters: Some(records),
                    ..ControlResponse::success()
                })
        }
        ControlRequest::ReplayDeadLetters { .. } => {
            engine
                .replay_dead_letters(name)
                .await
                .map(|report| ControlResponse {
                    replay: Some(report),
                    ..ControlResponse::success()
                })
        }
    };
    result.unwrap_or_else(|e| ControlResponse::from_error(&e))
}

fn with_state(state: SubscriptionState) -> ControlResponse {
    ControlResponse {
        state: Some(state),
        ..ControlResponse::success()
    }
}

/// Talks to a running daemon.
#[derive(Debug, Clone)]
pub struct ControlClient {
    addr: String,
}

impl ControlClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    /// Sends one request and waits for its response.
    ///
    /// An unreachable daemon is a `Connection` error; a refused request
    /// comes back as a response with `ok = false`.
    pub async fn send(&self, request: &ControlRequest) -> Result<ControlResponse> {
        let stream = TcpStream::connect(&self.addr).await.map_err(|e| {
            Error::Connection(format!("control endpoint {}: {}", self.addr, e))
        })?;
        let (reader, mut writer) = stream.into_split();

        let mut payload = serde_json::to_vec(request)?;
        payload.push(b'\n');
        writer.write_all(&payload).await?;

        let line = BufReader::new(reader)
            .lines()
            .next_line()
            .await?
            .ok_or_else(|| {
                Error::Connection(format!(
                    "control endpoint {} closed the connection",
                    self.addr
                ))
            })?;
        Ok(serde_json::from_str(&line)?)
    }
}
