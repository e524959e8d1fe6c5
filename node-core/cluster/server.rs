//! Accepts inbound connections from remote nodes and dispatches requests to
//! local services. One server per node; it never originates calls itself —
//! that's [`crate::cluster::client::RpcClient`]'s job.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use node_wire::{Frame, ProcessorRegistry, RequestFrame, ResponseFrame};

use crate::cluster::Cluster;
use crate::error::CoreError;

pub struct RpcServer {
    processors: ProcessorRegistry,
}

impl RpcServer {
    pub fn new() -> Self {
        Self {
            processors: ProcessorRegistry::default(),
        }
    }

    /// Binds `addr` and serves forever, handing each accepted connection to
    /// its own task. Returns only on a bind failure.
    pub async fn serve(self: Arc<Self>, addr: std::net::SocketAddr, cluster: Arc<Cluster>) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, "rpc server listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            let this = Arc::clone(&self);
            let cluster = Arc::clone(&cluster);
            tokio::spawn(async move {
                if let Err(e) = this.handle_connection(stream, cluster).await {
                    tracing::debug!(%peer, error = %e, "rpc connection closed");
                }
            });
        }
    }

    async fn handle_connection(
        &self,
        mut stream: TcpStream,
        cluster: Arc<Cluster>,
    ) -> std::io::Result<()> {
        loop {
            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await?;
            let len = u16::from_le_bytes(len_buf) as usize;
            let mut body = vec![0u8; 1 + len];
            stream.read_exact(&mut body).await?;

            let Ok(processor) = self.processors.get(body[0]) else {
                tracing::error!(processor_id = body[0], "rpc server: unknown processor id");
                continue;
            };
            let Ok(frame) = processor.decode(&body[1..]) else {
                tracing::error!("rpc server: failed to decode request frame");
                continue;
            };

            let Frame::Request(request) = frame else {
                tracing::error!("rpc server received a response frame on the server socket");
                continue;
            };

            let response = self.dispatch(&cluster, request.clone()).await;
            if request.no_reply {
                continue;
            }
            let response_frame = Frame::Response(response);
            let encoded = processor.encode(&response_frame).map_err(std::io::Error::other)?;
            if encoded.len() > node_wire::MAX_BODY_LEN {
                tracing::error!(len = encoded.len(), "rpc server: response exceeds frame limit");
                continue;
            }
            let mut framed = Vec::with_capacity(3 + encoded.len());
            framed.extend_from_slice(&(encoded.len() as u16).to_le_bytes());
            framed.push(processor.id());
            framed.extend_from_slice(&encoded);
            stream.write_all(&framed).await?;
        }
    }

    /// Inbound frames always arrive from a remote peer, never this node's
    /// own in-process callers, so they never carry an `AllowRetiring`
    /// opt-in: a service this node is retiring rejects them outright.
    async fn dispatch(&self, cluster: &Arc<Cluster>, request: RequestFrame) -> ResponseFrame {
        match cluster.dispatch_local(&request.service_method, request.payload, false).await {
            | Ok(reply) => ResponseFrame::ok(request.seq, reply),
            | Err(e) => ResponseFrame::err(request.seq, describe(&e)),
        }
    }
}

impl Default for RpcServer {
    fn default() -> Self {
        Self::new()
    }
}

fn describe(e: &CoreError) -> String {
    e.to_string()
}
