//! Overlay RPC transport: wire messages, framing, dialer and server.
//!
//! Every overlay call is unary and minimal: an identifier, an IP string,
//! a boolean, or nothing. Frames are length-prefixed bincode over TCP, one
//! request per connection. A transport error and a timeout are the same
//! thing to callers: the peer is unreachable for this call.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::{RingError, RingResult};
use crate::keyspace::KeyId;
use crate::node::RingNode;

/// Upper bound on a single wire frame. Overlay messages are tiny; anything
/// bigger is a protocol violation.
const MAX_FRAME_LEN: u32 = 16 * 1024;

/// Requests a node answers on its RPC port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RingRequest {
    /// Who owns this identifier?
    FindSucc { id: KeyId },
    /// Whose successor owns this identifier?
    FindPred { id: KeyId },
    /// Current successor of the callee
    GetSucc,
    /// Current predecessor of the callee, if known
    GetPred,
    /// Advisory: the caller believes it is our predecessor
    UpdatePred { ip: String },
    /// Unconditional: the caller is our successor's replacement
    UpdateSucc { ip: String },
    /// Single-to-two-member transition
    NotAlone { ip: String },
    /// Liveness check
    Ping,
}

/// Replies to [`RingRequest`]s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RingResponse {
    /// An IP string
    Ip { ip: String },
    /// An IP string that may be unknown
    OptionalIp { ip: Option<String> },
    /// Liveness result
    Status { ok: bool },
    /// Nothing to say
    Empty,
}

pub(crate) async fn write_frame<T: Serialize>(stream: &mut TcpStream, msg: &T) -> RingResult<()> {
    let bytes = bincode::serialize(msg)?;
    let len = u32::try_from(bytes.len()).map_err(|_| RingError::Wire("frame too large".into()))?;
    if len > MAX_FRAME_LEN {
        return Err(RingError::Wire(format!("frame of {len} bytes exceeds cap")));
    }
    stream.write_u32(len).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

pub(crate) async fn read_frame<T: for<'de> Deserialize<'de>>(
    stream: &mut TcpStream,
) -> RingResult<T> {
    let len = stream.read_u32().await?;
    if len > MAX_FRAME_LEN {
        return Err(RingError::Wire(format!("frame of {len} bytes exceeds cap")));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(bincode::deserialize(&buf)?)
}

/// Client side of the overlay RPC protocol.
///
/// The dialer is external to [`crate::node::NodeRef`]: refs are plain
/// values, and every call dials the peer's fixed RPC port fresh, bounded
/// by one deadline covering connect, send and receive.
#[derive(Debug, Clone)]
pub struct Dialer {
    rpc_port: u16,
    timeout: Duration,
}

impl Dialer {
    /// Create a dialer for a fixed RPC port and per-call deadline.
    #[must_use]
    pub fn new(rpc_port: u16, timeout: Duration) -> Self {
        Self { rpc_port, timeout }
    }

    /// Issue one request to `ip` and await its reply.
    pub async fn call(&self, ip: &str, request: RingRequest) -> RingResult<RingResponse> {
        let exchange = async {
            let mut stream = TcpStream::connect((ip, self.rpc_port)).await?;
            write_frame(&mut stream, &request).await?;
            read_frame::<RingResponse>(&mut stream).await
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(RingError::PeerUnreachable {
                peer: ip.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(RingError::PeerUnreachable {
                peer: ip.to_string(),
                reason: format!("no reply within {:?}", self.timeout),
            }),
        }
    }

    /// Ask `ip` for the owner of `id`.
    pub async fn find_succ(&self, ip: &str, id: KeyId) -> RingResult<String> {
        match self.call(ip, RingRequest::FindSucc { id }).await? {
            RingResponse::Ip { ip } => Ok(ip),
            other => Err(unexpected(other)),
        }
    }

    /// Ask `ip` for the node whose successor owns `id`.
    pub async fn find_pred(&self, ip: &str, id: KeyId) -> RingResult<String> {
        match self.call(ip, RingRequest::FindPred { id }).await? {
            RingResponse::Ip { ip } => Ok(ip),
            other => Err(unexpected(other)),
        }
    }

    /// Ask `ip` for its successor.
    pub async fn get_succ(&self, ip: &str) -> RingResult<String> {
        match self.call(ip, RingRequest::GetSucc).await? {
            RingResponse::Ip { ip } => Ok(ip),
            other => Err(unexpected(other)),
        }
    }

    /// Ask `ip` for its predecessor, if it has one.
    pub async fn get_pred(&self, ip: &str) -> RingResult<Option<String>> {
        match self.call(ip, RingRequest::GetPred).await? {
            RingResponse::OptionalIp { ip } => Ok(ip),
            other => Err(unexpected(other)),
        }
    }

    /// Advise `ip` that `own_ip` may be its predecessor.
    pub async fn update_pred(&self, ip: &str, own_ip: &str) -> RingResult<()> {
        self.call(
            ip,
            RingRequest::UpdatePred {
                ip: own_ip.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    /// Tell `ip` that `own_ip` is now its successor.
    pub async fn update_succ(&self, ip: &str, own_ip: &str) -> RingResult<()> {
        self.call(
            ip,
            RingRequest::UpdateSucc {
                ip: own_ip.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    /// Tell the lone member at `ip` that `own_ip` joined.
    pub async fn not_alone(&self, ip: &str, own_ip: &str) -> RingResult<()> {
        self.call(
            ip,
            RingRequest::NotAlone {
                ip: own_ip.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    /// Liveness probe. Any transport error means dead.
    pub async fn ping(&self, ip: &str) -> bool {
        matches!(
            self.call(ip, RingRequest::Ping).await,
            Ok(RingResponse::Status { ok: true })
        )
    }
}

fn unexpected(response: RingResponse) -> RingError {
    RingError::Wire(format!("unexpected response variant: {response:?}"))
}

/// Accept loop for the overlay RPC port.
///
/// Connections beyond the worker bound queue on the semaphore; each served
/// connection carries exactly one request.
pub(crate) async fn serve(node: Arc<RingNode>, listener: TcpListener, workers: usize) {
    let semaphore = Arc::new(Semaphore::new(workers));

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                if !node.is_running() {
                    break;
                }
                warn!(error = %e, "RPC accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        if !node.is_running() {
            break;
        }

        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let node = Arc::clone(&node);
        tokio::spawn(async move {
            let _permit = permit;
            let mut stream = stream;
            if let Err(e) = handle_connection(&node, &mut stream).await {
                debug!(peer = %peer, error = %e, "RPC connection ended with error");
            }
        });
    }

    debug!("RPC accept loop stopped");
}

async fn handle_connection(node: &RingNode, stream: &mut TcpStream) -> RingResult<()> {
    let request: RingRequest = read_frame(stream).await?;
    let response = node.handle(request).await;
    write_frame(stream, &response).await
}
