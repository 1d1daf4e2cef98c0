//! The RPC endpoint: a Unix domain socket speaking newline-delimited JSON
//! frames. One response per request; stream events interleave with the
//! request id attached. A panicking handler answers INTERNAL_ERROR and the
//! daemon keeps serving.

use std::sync::Arc;

use futures_util::{FutureExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, error, info, warn};

use ocg_protocol::frames::{InboundFrame, ResFrame};
use ocg_protocol::{methods, MAX_FRAME_BYTES};

use crate::app::AppState;
use crate::dispatch;

/// Per-connection outbound queue; a stuck client gets disconnected rather
/// than wedging the daemon.
const OUTBOUND_CAP: usize = 256;

pub async fn serve(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let path = state.config.socket_path.clone();
    if path.exists() {
        let _ = std::fs::remove_file(&path);
    }
    let listener = UnixListener::bind(&path)?;

    // the gateway runs as its own user; the socket is the auth boundary's
    // inside edge
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o666))?;
    }
    info!(path = %path.display(), "rpc endpoint listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let state = Arc::clone(&state);
                        tokio::spawn(async move { handle_conn(state, stream).await });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("rpc endpoint closing");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_conn(state: Arc<AppState>, stream: UnixStream) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = FramedRead::new(
        read_half,
        LinesCodec::new_with_max_length(MAX_FRAME_BYTES),
    );

    let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_CAP);
    let writer = tokio::spawn(async move {
        while let Some(line) = out_rx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if write_half.write_all(b"\n").await.is_err() {
                break;
            }
        }
    });

    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "malformed frame — closing connection");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let req = match serde_json::from_str::<InboundFrame>(&line).ok().and_then(|f| f.as_req()) {
            Some(req) => req,
            None => {
                let res = ResFrame::err("", "PROTOCOL_ERROR", "expected a req frame", "");
                send_frame(&out_tx, &res).await;
                continue;
            }
        };

        debug!(method = %req.method, id = %req.id, "request received");
        let state = Arc::clone(&state);
        let out = out_tx.clone();
        // each request runs concurrently so chat.abort can land while a
        // chat.stream is in flight
        tokio::spawn(async move {
            let id = req.id.clone();
            let method = req.method.clone();
            let timeout = method_timeout(&state, &method);

            let work = dispatch::route(Arc::clone(&state), req, out.clone());
            let outcome =
                tokio::time::timeout(timeout, std::panic::AssertUnwindSafe(work).catch_unwind())
                    .await;

            let res = match outcome {
                Ok(Ok(Ok(payload))) => ResFrame::ok(id.as_str(), payload),
                Ok(Ok(Err(agent_err))) => ResFrame::from_error(id.as_str(), &agent_err),
                Ok(Err(panic)) => {
                    error!(method = %method, "handler panicked: {:?}", panic_message(&panic));
                    ResFrame::err(
                        id.as_str(),
                        "INTERNAL_ERROR",
                        "handler panicked",
                        "check the daemon logs",
                    )
                }
                Err(_elapsed) => ResFrame::from_error(
                    id.as_str(),
                    &ocg_core::AgentError::Timeout {
                        ms: timeout.as_millis() as u64,
                    },
                ),
            };
            state.inflight.remove(&id);
            send_frame(&out, &res).await;
        });
    }

    writer.abort();
}

fn method_timeout(state: &AppState, method: &str) -> std::time::Duration {
    let secs = match method {
        methods::CHAT_SEND | methods::CHAT_STREAM => state.config.turn.chat_timeout_secs,
        methods::AUDIO_CHUNK | methods::AUDIO_END => state.config.realtime.call_timeout_secs,
        _ => 30,
    };
    std::time::Duration::from_secs(secs)
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

pub async fn send_frame<T: serde::Serialize>(out: &mpsc::Sender<String>, frame: &T) {
    match serde_json::to_string(frame) {
        Ok(line) => {
            let _ = out.send(line).await;
        }
        Err(e) => error!(error = %e, "frame serialisation failed"),
    }
}
