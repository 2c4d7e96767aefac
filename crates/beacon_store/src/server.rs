//! Wire server: accepts connections and dispatches framed requests.

use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

use crate::wire::{self, Request};
use crate::NodeState;

/// Accept loop; runs until the listener errors or the node stops.
pub async fn serve(listener: TcpListener, node: Arc<NodeState>) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await.context("accept")?;
        debug!(%peer, "connection accepted");
        let node = node.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, node).await {
                debug!(%peer, error = ?err, "connection closed");
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, node: Arc<NodeState>) -> anyhow::Result<()> {
    stream.set_nodelay(true)?;
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    while let Some(frame) = framed.next().await {
        let frame = frame.context("read frame")?;
        let request: Request = match wire::decode(&frame) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = ?err, "undecodable request frame");
                return Err(err);
            }
        };
        let response = node.dispatch(request).await;
        let payload = wire::encode(&response)?;
        framed.send(Bytes::from(payload)).await.context("send response")?;
    }
    Ok(())
}
