use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;

use super::session::Session;
use crate::broker::PriceFeed;
use crate::utils::Result;

pub async fn start_websocket_server(
    addr: &str,
    feed: Arc<PriceFeed>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve(listener, feed, shutdown).await
}

/// Accepts connections on `listener` until `shutdown` fires. Open
/// connections are closed when it does.
pub async fn serve(
    listener: TcpListener,
    feed: Arc<PriceFeed>,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("WebSocket server listening on ws://{}", listener.local_addr()?);

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {e}");
                    continue;
                }
            },
        };

        let feed = Arc::clone(&feed);
        let shutdown = shutdown.child_token();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, feed, shutdown).await {
                error!(%peer, "Connection failed: {e}");
            }
        });
    }

    info!("WebSocket server stopped accepting connections");
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    feed: Arc<PriceFeed>,
    shutdown: CancellationToken,
) -> Result<()> {
    let ws_stream = accept_async(stream).await?;

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (mut session, mut outbound) = Session::open(feed);
    let session_token = session.token();
    debug!(%peer, client_id = session.id(), "Connection accepted");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = ws_sender.send(WsMessage::Close(None)).await;
                break;
            }
            _ = session_token.cancelled() => break,
            outgoing = outbound.recv() => {
                let Some(message) = outgoing else { break };
                let text = match message.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        error!(client_id = session.id(), "Failed to serialize message: {e}");
                        continue;
                    }
                };
                if let Err(e) = ws_sender.send(WsMessage::text(text)).await {
                    warn!(client_id = session.id(), "Failed to send message: {e}");
                    break;
                }
            }
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => session.handle_text(text.as_str()).await,
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(client_id = session.id(), "WebSocket read error: {e}");
                    break;
                }
            },
        }
    }

    info!(%peer, client_id = session.id(), "Client disconnected");
    session.close().await;
    Ok(())
}
