//! Websocket channel to a browser tab
//!
//! The page opens `ws://<addr>/__hmr`; the newest socket becomes the live
//! host. Update frames go out as text messages and every text message the
//! page sends is handed to the bridge.

use std::future::Future;
use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tracing::{debug, info};

use super::TransportBridge;
use crate::error::{Error, Result};

/// Route the browser connects to
pub const HMR_PATH: &str = "/__hmr";

/// Router exposing the update socket
pub fn router(bridge: TransportBridge) -> Router {
    Router::new()
        .route(HMR_PATH, get(upgrade_handler))
        .with_state(bridge)
}

/// Serve the update socket until `shutdown` resolves
pub async fn serve<F>(bridge: TransportBridge, addr: SocketAddr, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::transport(format!("cannot bind {}: {}", addr, e)))?;
    info!("hmr socket listening on ws://{}{}", addr, HMR_PATH);
    axum::serve(listener, router(bridge))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::transport(format!("websocket server failed: {}", e)))
}

async fn upgrade_handler(State(bridge): State<TransportBridge>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, bridge))
}

async fn handle_socket(socket: WebSocket, bridge: TransportBridge) {
    let mut link = bridge.connect();
    let id = link.id;
    let (mut sink, mut stream) = socket.split();
    let mut in_flight = None;

    loop {
        tokio::select! {
            frame = link.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(Message::Text(frame.clone())).await {
                        debug!(link = id, "websocket write failed: {}", e);
                        in_flight = Some(frame);
                        break;
                    }
                }
                // Replaced by a newer tab, or the bridge closed.
                None => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let _ = bridge.deliver(&text);
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!(link = id, "websocket closed by host");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(link = id, "websocket read failed: {}", e);
                    break;
                }
            },
        }
    }

    let unsent = link.into_unsent(in_flight);
    bridge.disconnect(id, unsent);
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_serve_binds_and_shuts_down() {
        let bridge = TransportBridge::new();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(serve(bridge, addr, async move {
            let _ = rx.await;
        }));
        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }

    #[test]
    fn test_router_builds() {
        let _router = router(TransportBridge::new());
        assert_eq!(HMR_PATH, "/__hmr");
    }
}
