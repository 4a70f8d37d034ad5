//! Wire protocol: message framing and p2p payload documents.
//!
//! Every message shares the frame `{id: u32 LE, seq: u16 LE, size: u32 LE,
//! payload}`. The payload is a tagged document with short field names,
//! encoded as JSON. Binary blobs inside documents are base64 strings.
//!
//! `seq` pairs a request with its reply: a fresh nonzero sequence is
//! allocated by [`crate::dispatch::Dispatcher::send`] and echoed back by the
//! responder. Fire-and-forget messages travel with `seq = 0`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Compiled-in protocol version. Handshake fails on any mismatch.
pub const PROTOCOL_VERSION: u32 = 1;

/// Frame header: id (4) + seq (2) + size (4), little-endian.
pub const FRAME_HEADER_LEN: usize = 10;

/// Upper bound on a single frame payload.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

// ── Message ids ─────────────────────────────────────────────────

pub const P2P_HELLO: u32 = 0x0101;
pub const P2P_LINKSTATE: u32 = 0x0102;
pub const P2P_TOPOSYNC: u32 = 0x0103;
pub const P2P_TOPODIFF: u32 = 0x0104;
pub const P2P_LOG_STATE: u32 = 0x0105;
pub const P2P_LOG_DATA: u32 = 0x0106;

/// Human-readable message name for logging.
pub fn msg_name(id: u32) -> &'static str {
    match id {
        P2P_HELLO => "p2p_hello",
        P2P_LINKSTATE => "p2p_linkstate",
        P2P_TOPOSYNC => "p2p_toposync",
        P2P_TOPODIFF => "p2p_topodiff",
        P2P_LOG_STATE => "p2p_cfslog_state",
        P2P_LOG_DATA => "p2p_cfslog_data",
        _ => "unknown",
    }
}

/// The message id a request expects its reply to carry.
///
/// Used by the dispatcher to tell an inbound reply apart from an inbound
/// request that happens to reuse the same sequence number.
pub fn reply_id(request_id: u32) -> Option<u32> {
    match request_id {
        P2P_HELLO => Some(P2P_HELLO),
        P2P_TOPOSYNC => Some(P2P_TOPODIFF),
        P2P_LOG_STATE => Some(P2P_LOG_DATA),
        _ => None,
    }
}

// ── Framing ─────────────────────────────────────────────────────

/// One framed message.
#[derive(Debug, Clone)]
pub struct Frame {
    pub id: u32,
    pub seq: u16,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(id: u32, seq: u16, payload: Bytes) -> Self {
        Self { id, seq, payload }
    }
}

/// Read exactly one frame. `Closed` on EOF, `InvalidMessage` on an
/// oversized size field.
pub async fn read_frame<R>(r: &mut R) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut hdr = [0u8; FRAME_HEADER_LEN];
    if let Err(e) = r.read_exact(&mut hdr).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(Error::Closed);
        }
        return Err(Error::Io(e));
    }

    let mut buf = &hdr[..];
    let id = buf.get_u32_le();
    let seq = buf.get_u16_le();
    let size = buf.get_u32_le() as usize;

    if size > MAX_FRAME_SIZE {
        return Err(Error::invalid_message(format!("frame of {size} bytes exceeds limit")));
    }

    let mut payload = vec![0u8; size];
    if let Err(e) = r.read_exact(&mut payload).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(Error::Closed);
        }
        return Err(Error::Io(e));
    }

    Ok(Frame::new(id, seq, Bytes::from(payload)))
}

/// Write one frame. Header and payload go out in a single write so the
/// message is atomic on the stream.
pub async fn write_frame<W>(w: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + frame.payload.len());
    buf.put_u32_le(frame.id);
    buf.put_u16_le(frame.seq);
    buf.put_u32_le(frame.payload.len() as u32);
    buf.extend_from_slice(&frame.payload);
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

/// Encode a payload document.
pub fn encode<T: Serialize>(msg: &T) -> Bytes {
    // Serialization of our own closed message set cannot fail.
    Bytes::from(serde_json::to_vec(msg).expect("message serialization"))
}

/// Decode a payload document, mapping failures to `InvalidMessage`.
pub fn decode<T: DeserializeOwned>(frame: &Frame) -> Result<T> {
    serde_json::from_slice(&frame.payload)
        .map_err(|e| Error::invalid_message(format!("{} payload: {e}", msg_name(frame.id))))
}

// ── UUID halves ─────────────────────────────────────────────────

pub fn uuid_halves(uuid: Uuid) -> (u64, u64) {
    let v = uuid.as_u128();
    ((v >> 64) as u64, v as u64)
}

pub fn uuid_from_halves(hi: u64, lo: u64) -> Uuid {
    Uuid::from_u128(((hi as u128) << 64) | lo as u128)
}

// ── Blob fields ─────────────────────────────────────────────────

pub fn blob_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

pub fn blob_decode(data: &str) -> Result<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| Error::invalid_message(format!("blob field: {e}")))
}

// ── P2P payload documents ───────────────────────────────────────

/// Handshake. Sent by the outbound side on connect; the inbound side
/// replies with its own hello on the same sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    #[serde(rename = "V")]
    pub version: u32,
    #[serde(rename = "U0")]
    pub uuid_hi: u64,
    #[serde(rename = "U1")]
    pub uuid_lo: u64,
    #[serde(rename = "L")]
    pub listen: String,
}

impl Hello {
    pub fn new(version: u32, uuid: Uuid, listen: String) -> Self {
        let (uuid_hi, uuid_lo) = uuid_halves(uuid);
        Self { version, uuid_hi, uuid_lo, listen }
    }

    pub fn uuid(&self) -> Uuid {
        uuid_from_halves(self.uuid_hi, self.uuid_lo)
    }
}

/// A single-link assertion, authored by `source` and flooded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkState {
    #[serde(rename = "S_U0")]
    pub src_hi: u64,
    #[serde(rename = "S_U1")]
    pub src_lo: u64,
    #[serde(rename = "P_U0")]
    pub peer_hi: u64,
    #[serde(rename = "P_U1")]
    pub peer_lo: u64,
    #[serde(rename = "S_A")]
    pub src_addr: String,
    #[serde(rename = "P_A")]
    pub peer_addr: String,
    #[serde(rename = "C")]
    pub connected: bool,
    #[serde(rename = "N")]
    pub seq: u32,
}

impl LinkState {
    pub fn source(&self) -> Uuid {
        uuid_from_halves(self.src_hi, self.src_lo)
    }

    pub fn peer(&self) -> Uuid {
        uuid_from_halves(self.peer_hi, self.peer_lo)
    }
}

/// Node entry of a topology document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopoNodeDoc {
    #[serde(rename = "U1")]
    pub uuid_hi: u64,
    #[serde(rename = "U2")]
    pub uuid_lo: u64,
    #[serde(rename = "A")]
    pub addr: String,
}

/// Link entry of a topology document. Endpoints are indices into the
/// node list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopoLinkDoc {
    #[serde(rename = "U1")]
    pub a: u32,
    #[serde(rename = "U2")]
    pub b: u32,
    #[serde(rename = "W")]
    pub weight: u32,
}

/// Serialized topology snapshot, payload of toposync and topodiff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyDoc {
    #[serde(rename = "NC")]
    pub node_count: u64,
    #[serde(rename = "LC")]
    pub link_count: u64,
    /// Total size of the string storage the node addresses need.
    #[serde(rename = "ES")]
    pub extradata_size: u64,
    #[serde(rename = "N")]
    pub nodes: Vec<TopoNodeDoc>,
    #[serde(rename = "L")]
    pub links: Vec<TopoLinkDoc>,
}

/// Pull request: "send me entries of `origin`'s log above `top`".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogState {
    #[serde(rename = "O0")]
    pub origin_hi: u64,
    #[serde(rename = "O1")]
    pub origin_lo: u64,
    #[serde(rename = "T")]
    pub top: u64,
}

impl LogState {
    pub fn new(origin: Uuid, top: u64) -> Self {
        let (origin_hi, origin_lo) = uuid_halves(origin);
        Self { origin_hi, origin_lo, top }
    }

    pub fn origin(&self) -> Uuid {
        uuid_from_halves(self.origin_hi, self.origin_lo)
    }
}

/// One log entry on the wire. `P` is the opaque payload blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntryDoc {
    #[serde(rename = "I")]
    pub id: u64,
    #[serde(rename = "P")]
    pub payload: String,
}

/// Pull reply carrying a batch of entries in ascending id order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogData {
    #[serde(rename = "O0")]
    pub origin_hi: u64,
    #[serde(rename = "O1")]
    pub origin_lo: u64,
    #[serde(rename = "E")]
    pub entries: Vec<LogEntryDoc>,
}

impl LogData {
    pub fn origin(&self) -> Uuid {
        uuid_from_halves(self.origin_hi, self.origin_lo)
    }
}
