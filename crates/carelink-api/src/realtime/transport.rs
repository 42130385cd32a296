// ── Realtime transport seam ──
//
// The manager never touches a socket directly. A transport opens one
// authenticated link and hands back a pair of channels; the manager's
// supervisor owns reconnection.

use std::future::Future;

use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder, Message};
use tracing::{debug, info, trace};
use url::Url;

use crate::error::Error;

/// Credentials presented during the handshake.
#[derive(Debug, Clone)]
pub struct AuthPayload {
    pub token: SecretString,
    pub user_id: Option<String>,
}

/// Something the link reports back to the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// One inbound text frame.
    Message(String),
    /// The link is gone. No further events follow.
    Closed { reason: String },
}

/// An open, authenticated link.
///
/// Dropping `outbound` asks the transport to close the connection.
#[derive(Debug)]
pub struct RealtimeLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Opens realtime links. Implemented over WebSocket by [`WsTransport`];
/// tests substitute an in-memory peer.
pub trait RealtimeTransport: Send + Sync + 'static {
    /// Perform the handshake. Resolving `Ok` means the server accepted it.
    fn open(
        &self,
        endpoint: &Url,
        auth: &AuthPayload,
    ) -> impl Future<Output = Result<RealtimeLink, Error>> + Send;
}

// ── WebSocket implementation ─────────────────────────────────────────

/// JSON text frames over a `tokio-tungstenite` WebSocket.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

impl RealtimeTransport for WsTransport {
    async fn open(&self, endpoint: &Url, auth: &AuthPayload) -> Result<RealtimeLink, Error> {
        info!(url = %endpoint, "connecting to realtime endpoint");

        let uri: tungstenite::http::Uri = endpoint
            .as_str()
            .parse()
            .map_err(|e: tungstenite::http::uri::InvalidUri| {
                Error::WebSocketConnect(e.to_string())
            })?;

        let mut request = ClientRequestBuilder::new(uri)
            .with_header("Authorization", format!("Bearer {}", auth.token.expose_secret()));
        if let Some(user_id) = &auth.user_id {
            request = request.with_header("X-User-Id", user_id.clone());
        }

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<LinkEvent>();

        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    outbound = out_rx.recv() => match outbound {
                        Some(text) => {
                            if let Err(e) = write.send(Message::text(text)).await {
                                break e.to_string();
                            }
                        }
                        None => {
                            let _ = write.send(Message::Close(None)).await;
                            break "closed by client".to_owned();
                        }
                    },
                    frame = read.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            if in_tx.send(LinkEvent::Message(text.as_str().to_owned())).is_err() {
                                break "link dropped".to_owned();
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            break frame.map_or_else(
                                || "server closed".to_owned(),
                                |cf| format!("server closed ({}): {}", cf.code, cf.reason),
                            );
                        }
                        Some(Ok(Message::Ping(_))) => trace!("realtime ping"),
                        // Binary, Pong, raw frames
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break e.to_string(),
                        None => break "stream ended".to_owned(),
                    },
                }
            };
            debug!(%reason, "realtime link closed");
            let _ = in_tx.send(LinkEvent::Closed { reason });
        });

        Ok(RealtimeLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
