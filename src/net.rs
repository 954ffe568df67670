//! Wire plumbing: peer URLs, request/response envelopes, stream frames,
//! length-prefixed JSON framing, and the connection manager.
//!
//! Every frame on the wire is a 4-byte big-endian length followed by a
//! JSON payload. A connection carries either request/response envelopes
//! or, after a `sub-query` request, a stream of [`StreamFrame`]s ending
//! with [`StreamFrame::End`].

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::error::{PlasmaError, Result};
use crate::plan::Plan;
use crate::tuple::PathTuple;

/// URL scheme peers address each other with.
pub const PLASMA_PROTO: &str = "plasma";

/// Upper bound on a single wire frame.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Parsed peer address, canonical form `plasma://<host>:<port>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerUrl {
    /// URL scheme, normally [`PLASMA_PROTO`].
    pub proto: String,
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl PeerUrl {
    /// A plasma URL for the given host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            proto: PLASMA_PROTO.to_owned(),
            host: host.into(),
            port,
        }
    }

    /// `host:port`, the form the socket layer wants.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for PeerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.proto, self.host, self.port)
    }
}

impl FromStr for PeerUrl {
    type Err = PlasmaError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || PlasmaError::Transport(format!("malformed peer url '{s}'"));
        let (proto, rest) = s.split_once("://").ok_or_else(bad)?;
        let (host, port) = rest.rsplit_once(':').ok_or_else(bad)?;
        if proto.is_empty() || host.is_empty() {
            return Err(bad());
        }
        let port = port.parse::<u16>().map_err(|_| bad())?;
        Ok(Self {
            proto: proto.to_owned(),
            host: host.to_owned(),
            port,
        })
    }
}

/// Request envelope of the request channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
    /// Caller-chosen correlation id, echoed in the response.
    pub id: u64,
    /// Method name, e.g. `query` or `sub-query`.
    pub method: String,
    /// Method parameters as a JSON array.
    pub params: serde_json::Value,
}

/// Response envelope: exactly one of `result` or `error` is set.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Response {
    /// Correlation id from the request.
    pub id: u64,
    /// Successful result payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Failure payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Response {
    /// A success envelope.
    pub fn ok(id: u64, result: serde_json::Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// A failure envelope.
    pub fn fail(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(WireError {
                message: message.into(),
                cause: None,
            }),
        }
    }
}

/// Structured error payload of a failed request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireError {
    /// Human-readable description.
    pub message: String,
    /// Optional nested cause.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

/// Frame of the stream channel opened by `sub-query`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "kebab-case")]
pub enum StreamFrame {
    /// One path tuple.
    Tuple(PathTuple),
    /// A non-fatal error event riding the stream.
    Error {
        /// Machine-readable code.
        code: String,
        /// Human-readable description.
        message: String,
    },
    /// End of stream marker; nothing follows.
    End,
}

/// Writes one length-prefixed JSON frame.
pub async fn write_frame<W, T>(writer: &mut W, payload: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(payload)?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(PlasmaError::Transport(format!(
            "frame of {} bytes exceeds limit",
            bytes.len()
        )));
    }
    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed JSON frame; `None` on clean end of stream.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(PlasmaError::Transport(format!(
            "incoming frame of {len} bytes exceeds limit"
        )));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(serde_json::from_slice(&buf)?))
}

/// The connection manager. Opens request and stream channels to other
/// peers and tracks the peers it has seen; registration is idempotent
/// per URL. Operators reach it through the runtime context rather than
/// through any process-wide state.
pub struct Connector {
    next_id: AtomicU64,
    peers: Mutex<HashSet<PeerUrl>>,
}

impl Connector {
    /// A connection manager that knows no peers yet.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            peers: Mutex::new(HashSet::new()),
        }
    }

    /// Records a peer; returns whether it was previously unseen.
    pub fn register(&self, url: PeerUrl) -> bool {
        self.peers.lock().insert(url)
    }

    /// Every peer registered so far.
    pub fn known_peers(&self) -> Vec<PeerUrl> {
        self.peers.lock().iter().cloned().collect()
    }

    /// Sends one request and waits for its response envelope.
    pub async fn request(
        &self,
        url: &PeerUrl,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let mut stream = self.connect(url).await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        write_frame(
            &mut stream,
            &Request {
                id,
                method: method.to_owned(),
                params,
            },
        )
        .await?;
        match read_frame::<_, Response>(&mut stream).await? {
            Some(Response {
                error: Some(err), ..
            }) => Err(PlasmaError::Remote(err.message)),
            Some(Response { result, .. }) => Ok(result.unwrap_or(serde_json::Value::Null)),
            None => Err(PlasmaError::Transport(format!(
                "{url} closed before responding to {method}"
            ))),
        }
    }

    /// Opens a sub-query stream: ships the plan, then pumps incoming
    /// frames into the returned channel until the end marker. A transport
    /// failure mid-stream surfaces as an error frame and closes the
    /// channel; nothing else is affected.
    pub async fn open_stream(
        &self,
        url: &PeerUrl,
        plan: &Plan,
    ) -> Result<mpsc::Receiver<StreamFrame>> {
        let mut stream = self.connect(url).await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        write_frame(
            &mut stream,
            &Request {
                id,
                method: "sub-query".to_owned(),
                params: serde_json::json!([plan]),
            },
        )
        .await?;

        let (tx, rx) = mpsc::channel(64);
        let peer = url.clone();
        tokio::spawn(async move {
            loop {
                match read_frame::<_, StreamFrame>(&mut stream).await {
                    Ok(Some(StreamFrame::End)) | Ok(None) => break,
                    Ok(Some(frame)) => {
                        if tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(peer = %peer, %err, "sub-query stream dropped");
                        let _ = tx
                            .send(StreamFrame::Error {
                                code: "transport".to_owned(),
                                message: err.to_string(),
                            })
                            .await;
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn connect(&self, url: &PeerUrl) -> Result<TcpStream> {
        TcpStream::connect(url.authority())
            .await
            .map_err(|err| PlasmaError::Transport(format!("connect {url}: {err}")))
    }
}

impl Default for Connector {
    fn default() -> Self {
        Self::new()
    }
}

/// Presence broadcast payload, as carried by the discovery layer's UDP
/// datagrams.
#[derive(Debug, Deserialize)]
pub struct PresenceBeacon {
    /// Stable peer identity.
    #[serde(rename = "peer-id")]
    pub peer_id: String,
    /// Advertised host.
    #[serde(rename = "peer-host")]
    pub peer_host: String,
    /// Advertised port.
    #[serde(rename = "peer-port")]
    pub peer_port: u16,
}

/// Registers the peer named by a presence datagram with the connection
/// manager. The UDP socket itself belongs to the discovery layer.
pub fn register_presence(payload: &[u8], connector: &Connector) -> Result<PeerUrl> {
    let beacon: PresenceBeacon = serde_json::from_slice(payload)?;
    let url = PeerUrl::new(beacon.peer_host, beacon.peer_port);
    if connector.register(url.clone()) {
        tracing::info!(peer = %url, peer_id = %beacon.peer_id, "registered peer from presence");
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_parse_and_display_canonically() {
        let url: PeerUrl = "plasma://example.test:4004".parse().unwrap();
        assert_eq!(url.proto, "plasma");
        assert_eq!(url.host, "example.test");
        assert_eq!(url.port, 4004);
        assert_eq!(url.to_string(), "plasma://example.test:4004");
    }

    #[test]
    fn malformed_urls_are_transport_errors() {
        for bad in ["plasma://", "example:4004", "plasma://host:notaport", "://h:1"] {
            let err = bad.parse::<PeerUrl>().unwrap_err();
            assert_eq!(err.code(), "transport", "{bad}");
        }
    }

    #[tokio::test]
    async fn frames_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let sent = Request {
            id: 7,
            method: "ping".into(),
            params: serde_json::json!([]),
        };
        write_frame(&mut a, &sent).await.unwrap();
        let got: Request = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(got.id, 7);
        assert_eq!(got.method, "ping");
    }

    #[tokio::test]
    async fn clean_eof_reads_as_none() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        let got: Option<Request> = read_frame(&mut b).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let len = (MAX_FRAME_LEN as u32 + 1).to_be_bytes();
            let _ = a.write_all(&len).await;
        });
        let err = read_frame::<_, Request>(&mut b).await.unwrap_err();
        assert_eq!(err.code(), "transport");
    }

    #[test]
    fn presence_registration_is_idempotent() {
        let connector = Connector::new();
        let payload =
            br#"{"peer-id":"p1","peer-host":"10.0.0.7","peer-port":4004}"#;
        let url = register_presence(payload, &connector).unwrap();
        assert_eq!(url, PeerUrl::new("10.0.0.7", 4004));
        assert_eq!(connector.known_peers().len(), 1);
        register_presence(payload, &connector).unwrap();
        assert_eq!(connector.known_peers().len(), 1);
    }
}
