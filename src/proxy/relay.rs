// Response relay - fans one upstream body out to two consumers.
//
// The client-facing stream is the source of truth: every chunk is forwarded
// as it arrives, byte for byte, and never waits on accounting. A second copy
// accumulates into a capped in-memory buffer that is handed to a completion
// callback once the transfer ends (normally, on upstream error, or on client
// disconnect). LLM completion bodies are assumed moderate; the cap keeps a
// misbehaving upstream from ballooning memory, at the cost of an unknown
// character count for oversized responses.

use std::io;

use axum::body::Body;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// What the capture branch saw by the time the transfer ended.
pub struct Captured {
    /// Prefix of the body, up to the capture limit.
    pub body: Vec<u8>,
    /// True when the body outgrew the limit; the capture is then incomplete.
    pub truncated: bool,
}

/// Forward `upstream` to a fresh `Body` while capturing up to `capture_limit`
/// bytes. `on_done` runs exactly once, after the last chunk has been handled.
///
/// A dropped client (receiver) stops the forwarding loop, which drops the
/// upstream stream and aborts the transfer; `on_done` still fires with the
/// partial capture.
pub fn relay_with_capture<S, E>(
    upstream: S,
    capture_limit: usize,
    on_done: impl FnOnce(Captured) + Send + 'static,
) -> Body
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(16);

    tokio::spawn(async move {
        let mut upstream = std::pin::pin!(upstream);
        let mut captured = Captured {
            body: Vec::new(),
            truncated: false,
        };

        while let Some(item) = upstream.next().await {
            match item {
                Ok(chunk) => {
                    if captured.body.len() + chunk.len() <= capture_limit {
                        captured.body.extend_from_slice(&chunk);
                    } else {
                        captured.truncated = true;
                    }
                    if tx.send(Ok(chunk)).await.is_err() {
                        // Client went away; dropping the stream aborts the
                        // upstream transfer.
                        tracing::debug!("client disconnected mid-relay");
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!("upstream body error mid-relay: {err}");
                    let _ = tx
                        .send(Err(io::Error::new(io::ErrorKind::Other, err.to_string())))
                        .await;
                    break;
                }
            }
        }

        on_done(captured);
    });

    Body::from_stream(ReceiverStream::new(rx))
}
