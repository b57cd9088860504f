
use anyhow::Result;
use base64::Engine;
use serde::{Deserialize, Serialize};

pub const WS_MAX_MESSAGE_BYTES: usize = 8 * 1024 * 1024;

const MAGIC0: u8 = b'S';
const MAGIC1: u8 = b'B';
const VERSION: u8 = 1;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Encoding {
    Json,
    MsgPack,
}

impl Encoding {
    pub fn as_str(self) -> &'static str {
        match self {
            Encoding::Json => "json",
            Encoding::MsgPack => "msgpack",
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Encoding::Json => 0,
            Encoding::MsgPack => 1,
        }
    }
}

pub fn preferred_encoding(header: &str) -> Encoding {
    match header.trim().to_lowercase().as_str() {
        "msgpack" => Encoding::MsgPack,
        "json" => Encoding::Json,
        _ => Encoding::Json,
    }
}

#[derive(Debug, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "typ")]
    pub typ: u16,
    #[serde(rename = "dat")]
    pub dat: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct FileWrite {
    pub path: String,
    pub etag: String,
    pub length: i64,
    pub content: Option<Vec<u8>>,
}

#[derive(Debug, Deserialize)]
struct JsonFileWrite {
    #[serde(rename = "pth")]
    pub path: String,
    #[serde(rename = "etg")]
    pub etag: String,
    #[serde(rename = "len")]
    pub length: i64,
    #[serde(rename = "con", default, deserialize_with = "deserialize_base64_opt")]
    pub content: Option<Vec<u8>>,
}

// Go msgpack encoding uses exported field names, not `json:"pth"` tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgpackFileWrite {
    #[serde(rename = "Path")]
    pub path: String,
    #[serde(rename = "ETag")]
    pub etag: String,
    #[serde(rename = "Length")]
    pub length: i64,
    #[serde(rename = "Content", default)]
    pub content: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct FileDelete {
    pub path: String,
}

#[derive(Debug, Deserialize)]
struct JsonFileDelete {
    #[serde(rename = "pth")]
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgpackFileDelete {
    #[serde(rename = "Path")]
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct Ack {
    pub original_id: String,
}

#[derive(Debug, Clone)]
pub struct Nack {
    pub original_id: String,
    pub error: String,
}

#[derive(Debug, Deserialize)]
struct JsonAck {
    #[serde(rename = "oid")]
    pub original_id: String,
}

#[derive(Debug, Deserialize)]
struct JsonNack {
    #[serde(rename = "oid")]
    pub original_id: String,
    #[serde(rename = "err")]
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MsgpackAck {
    #[serde(rename = "OriginalId")]
    pub original_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MsgpackNack {
    #[serde(rename = "OriginalId")]
    pub original_id: String,
    #[serde(rename = "Error")]
    pub error: String,
}

/// Ordered list of ACL files the relay is about to push for one datasite.
/// The receiver stages the subsequent ACL file writes and applies them only
/// once the whole ordered set has arrived, so a permission widening in a
/// child directory is never visible before the parent narrowing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ACLManifest {
    #[serde(rename = "Version")]
    pub version: u32,
    #[serde(rename = "Datasite")]
    pub datasite: String,
    #[serde(rename = "ForUser")]
    pub for_user: String,
    #[serde(rename = "ForHash")]
    pub for_hash: String,
    #[serde(rename = "Generated")]
    pub generated: String,
    #[serde(rename = "ACLOrder")]
    pub acl_order: Vec<ACLEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ACLEntry {
    #[serde(rename = "Path")]
    pub path: String,
    #[serde(rename = "Hash")]
    pub hash: String,
}

#[derive(Debug, Deserialize)]
struct JsonAclEntry {
    #[serde(rename = "pth")]
    path: String,
    #[serde(rename = "hsh")]
    hash: String,
}

#[derive(Debug, Deserialize)]
struct JsonAclManifest {
    #[serde(rename = "ver", default)]
    version: u32,
    #[serde(rename = "ds")]
    datasite: String,
    #[serde(rename = "for", default)]
    for_user: String,
    #[serde(rename = "fh", default)]
    for_hash: String,
    #[serde(rename = "gen", default)]
    generated: String,
    #[serde(rename = "ord", default)]
    acl_order: Vec<JsonAclEntry>,
}

// Hotlink session negotiation envelopes (types 9-13). Like the file-write
// envelopes above, msgpack uses exported field names and json uses the
// compact tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgpackHotlinkOpen {
    #[serde(rename = "SessionId")]
    pub session_id: String,
    #[serde(rename = "Path")]
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgpackHotlinkAccept {
    #[serde(rename = "SessionId")]
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgpackHotlinkReject {
    #[serde(rename = "SessionId")]
    pub session_id: String,
    #[serde(rename = "Reason")]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgpackHotlinkData {
    #[serde(rename = "SessionId")]
    pub session_id: String,
    #[serde(rename = "Seq")]
    pub seq: u64,
    #[serde(rename = "Path")]
    pub path: String,
    #[serde(rename = "ETag")]
    pub etag: String,
    #[serde(rename = "Payload", default)]
    pub payload: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgpackHotlinkClose {
    #[serde(rename = "SessionId")]
    pub session_id: String,
    #[serde(rename = "Reason")]
    pub reason: String,
}

#[derive(Debug, Deserialize)]
struct JsonHotlinkOpen {
    #[serde(rename = "sid")]
    session_id: String,
    #[serde(rename = "pth")]
    path: String,
}

#[derive(Debug, Deserialize)]
struct JsonHotlinkAccept {
    #[serde(rename = "sid")]
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct JsonHotlinkReject {
    #[serde(rename = "sid")]
    session_id: String,
    #[serde(rename = "rsn", default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
struct JsonHotlinkData {
    #[serde(rename = "sid")]
    session_id: String,
    #[serde(rename = "seq")]
    seq: u64,
    #[serde(rename = "pth", default)]
    path: String,
    #[serde(rename = "etg", default)]
    etag: String,
    #[serde(rename = "pay", default, deserialize_with = "deserialize_base64_opt")]
    payload: Option<Vec<u8>>,
}

#[derive(Debug, Deserialize)]
struct JsonHotlinkClose {
    #[serde(rename = "sid")]
    session_id: String,
    #[serde(rename = "rsn", default)]
    reason: String,
}

// Message type tags shared with the relay.
pub const MSG_FILE_WRITE: u16 = 2;
pub const MSG_FILE_DELETE: u16 = 3;
pub const MSG_ACK: u16 = 4;
pub const MSG_NACK: u16 = 5;
// Type 6 is the relay's app-RPC http message; apps are out of scope here,
// so frames with that tag decode as `Other` and are ignored.
pub const MSG_FILE_NOTIFY: u16 = 7;
pub const MSG_ACL_MANIFEST: u16 = 8;
pub const MSG_HOTLINK_OPEN: u16 = 9;
pub const MSG_HOTLINK_ACCEPT: u16 = 10;
pub const MSG_HOTLINK_REJECT: u16 = 11;
pub const MSG_HOTLINK_DATA: u16 = 12;
pub const MSG_HOTLINK_CLOSE: u16 = 13;

#[derive(Debug)]
pub enum Decoded {
    FileWrite { id: String, write: FileWrite },
    FileDelete { id: String, delete: FileDelete },
    Ack(Ack),
    Nack(Nack),
    AclManifest { id: String, manifest: ACLManifest },
    HotlinkOpen { session_id: String, path: String },
    HotlinkAccept { session_id: String },
    HotlinkReject { session_id: String, reason: String },
    HotlinkData {
        session_id: String,
        path: String,
        etag: String,
        seq: u64,
        payload: Vec<u8>,
    },
    HotlinkClose { session_id: String, reason: String },
    Other { id: String, typ: u16 },
}

#[derive(Debug, Deserialize, Serialize)]
struct WireMessage {
    pub id: String,
    #[serde(rename = "typ")]
    pub typ: u16,
    #[serde(rename = "dat")]
    pub dat: Vec<u8>,
}

pub fn encode_msgpack<T: Serialize>(id: &str, typ: u16, dat: &T) -> Result<Vec<u8>> {
    let dat_bytes = rmp_serde::to_vec_named(dat)?;
    let wire = WireMessage {
        id: id.to_string(),
        typ,
        dat: dat_bytes,
    };
    let payload = rmp_serde::to_vec_named(&wire)?;

    let mut out = Vec::with_capacity(4 + payload.len());
    out.push(MAGIC0);
    out.push(MAGIC1);
    out.push(VERSION);
    out.push(Encoding::MsgPack.as_byte());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Encode a file write for the wire in the negotiated encoding, as the
/// WebSocket message kind that encoding travels in (text for json, binary
/// for msgpack).
pub fn encode_file_write(
    id: &str,
    write: &FileWrite,
    encoding: Encoding,
) -> Result<tokio_tungstenite::tungstenite::Message> {
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    match encoding {
        Encoding::Json => {
            let payload = serde_json::json!({
                "id": id,
                "typ": MSG_FILE_WRITE,
                "dat": {
                    "pth": write.path,
                    "etg": write.etag,
                    "len": write.length,
                    "con": write.content.as_deref().map(|c| {
                        base64::engine::general_purpose::STANDARD.encode(c)
                    }),
                }
            });
            Ok(WsMessage::Text(serde_json::to_string(&payload)?))
        }
        Encoding::MsgPack => {
            let fw = MsgpackFileWrite {
                path: write.path.clone(),
                etag: write.etag.clone(),
                length: write.length,
                content: write.content.clone(),
            };
            Ok(WsMessage::Binary(encode_msgpack(id, MSG_FILE_WRITE, &fw)?))
        }
    }
}

pub fn encode_file_delete(
    id: &str,
    path: &str,
    encoding: Encoding,
) -> Result<tokio_tungstenite::tungstenite::Message> {
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    match encoding {
        Encoding::Json => {
            let payload = serde_json::json!({
                "id": id,
                "typ": MSG_FILE_DELETE,
                "dat": { "pth": path }
            });
            Ok(WsMessage::Text(serde_json::to_string(&payload)?))
        }
        Encoding::MsgPack => {
            let fd = MsgpackFileDelete {
                path: path.to_string(),
            };
            Ok(WsMessage::Binary(encode_msgpack(id, MSG_FILE_DELETE, &fd)?))
        }
    }
}

pub fn encode_ack(
    id: &str,
    original_id: &str,
    encoding: Encoding,
) -> Result<tokio_tungstenite::tungstenite::Message> {
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    match encoding {
        Encoding::Json => {
            let payload = serde_json::json!({
                "id": id,
                "typ": MSG_ACK,
                "dat": { "oid": original_id }
            });
            Ok(WsMessage::Text(serde_json::to_string(&payload)?))
        }
        Encoding::MsgPack => {
            let ack = MsgpackAck {
                original_id: original_id.to_string(),
            };
            Ok(WsMessage::Binary(encode_msgpack(id, MSG_ACK, &ack)?))
        }
    }
}

pub fn encode_nack(
    id: &str,
    original_id: &str,
    error: &str,
    encoding: Encoding,
) -> Result<tokio_tungstenite::tungstenite::Message> {
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    match encoding {
        Encoding::Json => {
            let payload = serde_json::json!({
                "id": id,
                "typ": MSG_NACK,
                "dat": { "oid": original_id, "err": error }
            });
            Ok(WsMessage::Text(serde_json::to_string(&payload)?))
        }
        Encoding::MsgPack => {
            let nack = MsgpackNack {
                original_id: original_id.to_string(),
                error: error.to_string(),
            };
            Ok(WsMessage::Binary(encode_msgpack(id, MSG_NACK, &nack)?))
        }
    }
}

/// One encoder per hotlink control message, so the session manager never
/// has to care which encoding was negotiated.
pub fn encode_hotlink_open(
    id: &str,
    session_id: &str,
    path: &str,
    encoding: Encoding,
) -> Result<tokio_tungstenite::tungstenite::Message> {
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    match encoding {
        Encoding::Json => {
            let payload = serde_json::json!({
                "id": id,
                "typ": MSG_HOTLINK_OPEN,
                "dat": { "sid": session_id, "pth": path }
            });
            Ok(WsMessage::Text(serde_json::to_string(&payload)?))
        }
        Encoding::MsgPack => {
            let open = MsgpackHotlinkOpen {
                session_id: session_id.to_string(),
                path: path.to_string(),
            };
            Ok(WsMessage::Binary(encode_msgpack(id, MSG_HOTLINK_OPEN, &open)?))
        }
    }
}

pub fn encode_hotlink_accept(
    id: &str,
    session_id: &str,
    encoding: Encoding,
) -> Result<tokio_tungstenite::tungstenite::Message> {
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    match encoding {
        Encoding::Json => {
            let payload = serde_json::json!({
                "id": id,
                "typ": MSG_HOTLINK_ACCEPT,
                "dat": { "sid": session_id }
            });
            Ok(WsMessage::Text(serde_json::to_string(&payload)?))
        }
        Encoding::MsgPack => {
            let accept = MsgpackHotlinkAccept {
                session_id: session_id.to_string(),
            };
            Ok(WsMessage::Binary(encode_msgpack(
                id,
                MSG_HOTLINK_ACCEPT,
                &accept,
            )?))
        }
    }
}

pub fn encode_hotlink_reject(
    id: &str,
    session_id: &str,
    reason: &str,
    encoding: Encoding,
) -> Result<tokio_tungstenite::tungstenite::Message> {
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    match encoding {
        Encoding::Json => {
            let payload = serde_json::json!({
                "id": id,
                "typ": MSG_HOTLINK_REJECT,
                "dat": { "sid": session_id, "rsn": reason }
            });
            Ok(WsMessage::Text(serde_json::to_string(&payload)?))
        }
        Encoding::MsgPack => {
            let reject = MsgpackHotlinkReject {
                session_id: session_id.to_string(),
                reason: reason.to_string(),
            };
            Ok(WsMessage::Binary(encode_msgpack(
                id,
                MSG_HOTLINK_REJECT,
                &reject,
            )?))
        }
    }
}

pub fn encode_hotlink_data(
    id: &str,
    session_id: &str,
    seq: u64,
    path: &str,
    etag: &str,
    payload: Vec<u8>,
    encoding: Encoding,
) -> Result<tokio_tungstenite::tungstenite::Message> {
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    match encoding {
        Encoding::Json => {
            let body = serde_json::json!({
                "id": id,
                "typ": MSG_HOTLINK_DATA,
                "dat": {
                    "sid": session_id,
                    "seq": seq,
                    "pth": path,
                    "etg": etag,
                    "pay": base64::engine::general_purpose::STANDARD.encode(&payload),
                }
            });
            Ok(WsMessage::Text(serde_json::to_string(&body)?))
        }
        Encoding::MsgPack => {
            let data = MsgpackHotlinkData {
                session_id: session_id.to_string(),
                seq,
                path: path.to_string(),
                etag: etag.to_string(),
                payload: Some(payload),
            };
            Ok(WsMessage::Binary(encode_msgpack(
                id,
                MSG_HOTLINK_DATA,
                &data,
            )?))
        }
    }
}

pub fn encode_hotlink_close(
    id: &str,
    session_id: &str,
    reason: &str,
    encoding: Encoding,
) -> Result<tokio_tungstenite::tungstenite::Message> {
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    match encoding {
        Encoding::Json => {
            let payload = serde_json::json!({
                "id": id,
                "typ": MSG_HOTLINK_CLOSE,
                "dat": { "sid": session_id, "rsn": reason }
            });
            Ok(WsMessage::Text(serde_json::to_string(&payload)?))
        }
        Encoding::MsgPack => {
            let close = MsgpackHotlinkClose {
                session_id: session_id.to_string(),
                reason: reason.to_string(),
            };
            Ok(WsMessage::Binary(encode_msgpack(
                id,
                MSG_HOTLINK_CLOSE,
                &close,
            )?))
        }
    }
}

pub fn decode_text_json(raw: &str) -> Result<Decoded> {
    let msg: Message = serde_json::from_str(raw)?;
    decode_json_msg(msg)
}

pub fn decode_binary(raw: &[u8]) -> Result<Decoded> {
    if raw.len() >= 4 && raw[0] == MAGIC0 && raw[1] == MAGIC1 {
        if raw[2] != VERSION {
            anyhow::bail!("unsupported ws envelope version: {}", raw[2]);
        }
        let enc = raw[3];
        let payload = &raw[4..];
        match enc {
            1 => decode_msgpack(payload),
            0 => {
                // Allow binary JSON envelopes if ever used.
                let txt = std::str::from_utf8(payload)?;
                decode_text_json(txt)
            }
            _ => anyhow::bail!("unknown ws encoding: {}", enc),
        }
    } else {
        // Legacy binary frames are treated as UTF-8 JSON (best effort).
        let txt = std::str::from_utf8(raw)?;
        decode_text_json(txt)
    }
}

fn decode_msgpack(payload: &[u8]) -> Result<Decoded> {
    let wire: WireMessage = rmp_serde::from_slice(payload)?;
    decode_wire(wire)
}

fn decode_wire(wire: WireMessage) -> Result<Decoded> {
    match wire.typ {
        MSG_FILE_WRITE | MSG_FILE_NOTIFY => {
            let fw: MsgpackFileWrite = rmp_serde::from_slice(&wire.dat)?;
            Ok(Decoded::FileWrite {
                id: wire.id,
                write: FileWrite {
                    path: fw.path,
                    etag: fw.etag,
                    length: fw.length,
                    content: fw.content,
                },
            })
        }
        MSG_FILE_DELETE => {
            let fd: MsgpackFileDelete = rmp_serde::from_slice(&wire.dat)?;
            Ok(Decoded::FileDelete {
                id: wire.id,
                delete: FileDelete { path: fd.path },
            })
        }
        MSG_ACK => {
            let ack: MsgpackAck = rmp_serde::from_slice(&wire.dat)?;
            Ok(Decoded::Ack(Ack {
                original_id: ack.original_id,
            }))
        }
        MSG_NACK => {
            let nack: MsgpackNack = rmp_serde::from_slice(&wire.dat)?;
            Ok(Decoded::Nack(Nack {
                original_id: nack.original_id,
                error: nack.error,
            }))
        }
        MSG_ACL_MANIFEST => {
            let manifest: ACLManifest = rmp_serde::from_slice(&wire.dat)?;
            Ok(Decoded::AclManifest {
                id: wire.id,
                manifest,
            })
        }
        MSG_HOTLINK_OPEN => {
            let open: MsgpackHotlinkOpen = rmp_serde::from_slice(&wire.dat)?;
            Ok(Decoded::HotlinkOpen {
                session_id: open.session_id,
                path: open.path,
            })
        }
        MSG_HOTLINK_ACCEPT => {
            let accept: MsgpackHotlinkAccept = rmp_serde::from_slice(&wire.dat)?;
            Ok(Decoded::HotlinkAccept {
                session_id: accept.session_id,
            })
        }
        MSG_HOTLINK_REJECT => {
            let reject: MsgpackHotlinkReject = rmp_serde::from_slice(&wire.dat)?;
            Ok(Decoded::HotlinkReject {
                session_id: reject.session_id,
                reason: reject.reason,
            })
        }
        MSG_HOTLINK_DATA => {
            let data: MsgpackHotlinkData = rmp_serde::from_slice(&wire.dat)?;
            Ok(Decoded::HotlinkData {
                session_id: data.session_id,
                path: data.path,
                etag: data.etag,
                seq: data.seq,
                payload: data.payload.unwrap_or_default(),
            })
        }
        MSG_HOTLINK_CLOSE => {
            let close: MsgpackHotlinkClose = rmp_serde::from_slice(&wire.dat)?;
            Ok(Decoded::HotlinkClose {
                session_id: close.session_id,
                reason: close.reason,
            })
        }
        _ => Ok(Decoded::Other {
            id: wire.id,
            typ: wire.typ,
        }),
    }
}

fn decode_json_msg(msg: Message) -> Result<Decoded> {
    match msg.typ {
        MSG_FILE_WRITE | MSG_FILE_NOTIFY => {
            let fw: JsonFileWrite = serde_json::from_value(msg.dat)?;
            Ok(Decoded::FileWrite {
                id: msg.id,
                write: FileWrite {
                    path: fw.path,
                    etag: fw.etag,
                    length: fw.length,
                    content: fw.content,
                },
            })
        }
        MSG_FILE_DELETE => {
            let fd: JsonFileDelete = serde_json::from_value(msg.dat)?;
            Ok(Decoded::FileDelete {
                id: msg.id,
                delete: FileDelete { path: fd.path },
            })
        }
        MSG_ACK => {
            let ack: JsonAck = serde_json::from_value(msg.dat)?;
            Ok(Decoded::Ack(Ack {
                original_id: ack.original_id,
            }))
        }
        MSG_NACK => {
            let nack: JsonNack = serde_json::from_value(msg.dat)?;
            Ok(Decoded::Nack(Nack {
                original_id: nack.original_id,
                error: nack.error,
            }))
        }
        MSG_ACL_MANIFEST => {
            let m: JsonAclManifest = serde_json::from_value(msg.dat)?;
            Ok(Decoded::AclManifest {
                id: msg.id,
                manifest: ACLManifest {
                    version: m.version,
                    datasite: m.datasite,
                    for_user: m.for_user,
                    for_hash: m.for_hash,
                    generated: m.generated,
                    acl_order: m
                        .acl_order
                        .into_iter()
                        .map(|e| ACLEntry {
                            path: e.path,
                            hash: e.hash,
                        })
                        .collect(),
                },
            })
        }
        MSG_HOTLINK_OPEN => {
            let open: JsonHotlinkOpen = serde_json::from_value(msg.dat)?;
            Ok(Decoded::HotlinkOpen {
                session_id: open.session_id,
                path: open.path,
            })
        }
        MSG_HOTLINK_ACCEPT => {
            let accept: JsonHotlinkAccept = serde_json::from_value(msg.dat)?;
            Ok(Decoded::HotlinkAccept {
                session_id: accept.session_id,
            })
        }
        MSG_HOTLINK_REJECT => {
            let reject: JsonHotlinkReject = serde_json::from_value(msg.dat)?;
            Ok(Decoded::HotlinkReject {
                session_id: reject.session_id,
                reason: reject.reason,
            })
        }
        MSG_HOTLINK_DATA => {
            let data: JsonHotlinkData = serde_json::from_value(msg.dat)?;
            Ok(Decoded::HotlinkData {
                session_id: data.session_id,
                path: data.path,
                etag: data.etag,
                seq: data.seq,
                payload: data.payload.unwrap_or_default(),
            })
        }
        MSG_HOTLINK_CLOSE => {
            let close: JsonHotlinkClose = serde_json::from_value(msg.dat)?;
            Ok(Decoded::HotlinkClose {
                session_id: close.session_id,
                reason: close.reason,
            })
        }
        _ => Ok(Decoded::Other {
            id: msg.id,
            typ: msg.typ,
        }),
    }
}

fn deserialize_base64_opt<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<u8>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt = Option::<serde_json::Value>::deserialize(deserializer)?;
    match opt {
        None => Ok(None),
        Some(serde_json::Value::String(s)) => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(s.as_bytes())
                .map_err(serde::de::Error::custom)?;
            Ok(Some(bytes))
        }
        Some(serde_json::Value::Array(arr)) => {
            let mut out = Vec::with_capacity(arr.len());
            for v in arr {
                let n = v
                    .as_u64()
                    .ok_or_else(|| serde::de::Error::custom("expected byte"))?;
                out.push(n as u8);
            }
            Ok(Some(out))
        }
        _ => Err(serde::de::Error::custom(
            "expected base64 string or array for bytes",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    #[test]
    fn msgpack_file_write_round_trips() {
        let write = FileWrite {
            path: "alice@example.com/public/x.request".to_string(),
            etag: "5d41402abc4b2a76b9719d911017c592".to_string(),
            length: 5,
            content: Some(b"hello".to_vec()),
        };
        let msg = encode_file_write("msg-1", &write, Encoding::MsgPack).unwrap();
        let WsMessage::Binary(raw) = msg else {
            panic!("msgpack file write must be a binary frame");
        };
        match decode_binary(&raw).unwrap() {
            Decoded::FileWrite { id, write: got } => {
                assert_eq!(id, "msg-1");
                assert_eq!(got.path, write.path);
                assert_eq!(got.etag, write.etag);
                assert_eq!(got.length, 5);
                assert_eq!(got.content.as_deref(), Some(&b"hello"[..]));
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn json_file_write_round_trips_with_base64_content() {
        let write = FileWrite {
            path: "alice@example.com/public/x.request".to_string(),
            etag: "etag".to_string(),
            length: 3,
            content: Some(b"abc".to_vec()),
        };
        let msg = encode_file_write("msg-2", &write, Encoding::Json).unwrap();
        let WsMessage::Text(raw) = msg else {
            panic!("json file write must be a text frame");
        };
        match decode_text_json(&raw).unwrap() {
            Decoded::FileWrite { id, write: got } => {
                assert_eq!(id, "msg-2");
                assert_eq!(got.content.as_deref(), Some(&b"abc"[..]));
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn ack_and_nack_round_trip_in_both_encodings() {
        for encoding in [Encoding::Json, Encoding::MsgPack] {
            let ack = encode_ack("a-1", "orig-1", encoding).unwrap();
            let decoded = match ack {
                WsMessage::Text(raw) => decode_text_json(&raw).unwrap(),
                WsMessage::Binary(raw) => decode_binary(&raw).unwrap(),
                other => panic!("unexpected ws message: {other:?}"),
            };
            match decoded {
                Decoded::Ack(a) => assert_eq!(a.original_id, "orig-1"),
                other => panic!("unexpected decode: {other:?}"),
            }

            let nack = encode_nack("n-1", "orig-2", "acl denied", encoding).unwrap();
            let decoded = match nack {
                WsMessage::Text(raw) => decode_text_json(&raw).unwrap(),
                WsMessage::Binary(raw) => decode_binary(&raw).unwrap(),
                other => panic!("unexpected ws message: {other:?}"),
            };
            match decoded {
                Decoded::Nack(n) => {
                    assert_eq!(n.original_id, "orig-2");
                    assert_eq!(n.error, "acl denied");
                }
                other => panic!("unexpected decode: {other:?}"),
            }
        }
    }

    #[test]
    fn file_delete_round_trips() {
        let msg =
            encode_file_delete("d-1", "alice@example.com/public/x.txt", Encoding::MsgPack).unwrap();
        let WsMessage::Binary(raw) = msg else {
            panic!("expected binary frame");
        };
        match decode_binary(&raw).unwrap() {
            Decoded::FileDelete { id, delete } => {
                assert_eq!(id, "d-1");
                assert_eq!(delete.path, "alice@example.com/public/x.txt");
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn acl_manifest_decodes_from_msgpack_envelope() {
        let manifest = ACLManifest {
            version: 1,
            datasite: "alice@example.com".to_string(),
            for_user: "bob@example.com".to_string(),
            for_hash: "h".to_string(),
            generated: "2026-01-01T00:00:00Z".to_string(),
            acl_order: vec![
                ACLEntry {
                    path: "alice@example.com".to_string(),
                    hash: "h1".to_string(),
                },
                ACLEntry {
                    path: "alice@example.com/public".to_string(),
                    hash: "h2".to_string(),
                },
            ],
        };
        let raw = encode_msgpack("m-1", MSG_ACL_MANIFEST, &manifest).unwrap();
        match decode_binary(&raw).unwrap() {
            Decoded::AclManifest { id, manifest: got } => {
                assert_eq!(id, "m-1");
                assert_eq!(got.datasite, "alice@example.com");
                assert_eq!(got.acl_order.len(), 2);
                assert_eq!(got.acl_order[1].path, "alice@example.com/public");
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn hotlink_envelopes_decode_from_json() {
        let open = r#"{"id":"1","typ":9,"dat":{"sid":"s-1","pth":"alice@example.com/app_data/demo/rpc/ep/x.request"}}"#;
        match decode_text_json(open).unwrap() {
            Decoded::HotlinkOpen { session_id, path } => {
                assert_eq!(session_id, "s-1");
                assert!(path.ends_with(".request"));
            }
            other => panic!("unexpected decode: {other:?}"),
        }

        let data = r#"{"id":"2","typ":12,"dat":{"sid":"s-1","seq":3,"pth":"p","etg":"e","pay":"aGk="}}"#;
        match decode_text_json(data).unwrap() {
            Decoded::HotlinkData {
                session_id,
                seq,
                payload,
                ..
            } => {
                assert_eq!(session_id, "s-1");
                assert_eq!(seq, 3);
                assert_eq!(payload, b"hi");
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn hotlink_encoders_round_trip_in_both_encodings() {
        for encoding in [Encoding::Json, Encoding::MsgPack] {
            let decode = |msg: WsMessage| match msg {
                WsMessage::Text(raw) => decode_text_json(&raw).unwrap(),
                WsMessage::Binary(raw) => decode_binary(&raw).unwrap(),
                other => panic!("unexpected ws message: {other:?}"),
            };

            let open =
                encode_hotlink_open("m1", "s-1", "alice@example.com/a/x.request", encoding)
                    .unwrap();
            match decode(open) {
                Decoded::HotlinkOpen { session_id, path } => {
                    assert_eq!(session_id, "s-1");
                    assert!(path.ends_with("x.request"));
                }
                other => panic!("unexpected decode: {other:?}"),
            }

            let data =
                encode_hotlink_data("m2", "s-1", 9, "p", "e", b"bytes".to_vec(), encoding)
                    .unwrap();
            match decode(data) {
                Decoded::HotlinkData {
                    session_id,
                    seq,
                    payload,
                    ..
                } => {
                    assert_eq!(session_id, "s-1");
                    assert_eq!(seq, 9);
                    assert_eq!(payload, b"bytes");
                }
                other => panic!("unexpected decode: {other:?}"),
            }

            let reject = encode_hotlink_reject("m3", "s-1", "not permitted", encoding).unwrap();
            match decode(reject) {
                Decoded::HotlinkReject { session_id, reason } => {
                    assert_eq!(session_id, "s-1");
                    assert_eq!(reason, "not permitted");
                }
                other => panic!("unexpected decode: {other:?}"),
            }

            let accept = encode_hotlink_accept("m4", "s-1", encoding).unwrap();
            assert!(matches!(decode(accept), Decoded::HotlinkAccept { .. }));
            let close = encode_hotlink_close("m5", "s-1", "fallback", encoding).unwrap();
            assert!(matches!(decode(close), Decoded::HotlinkClose { .. }));
        }
    }

    #[test]
    fn unknown_type_decodes_as_other() {
        let raw = r#"{"id":"x","typ":99,"dat":{}}"#;
        match decode_text_json(raw).unwrap() {
            Decoded::Other { id, typ } => {
                assert_eq!(id, "x");
                assert_eq!(typ, 99);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }
}
