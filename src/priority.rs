//! Priority channel: the low-latency event socket to the relay.
//!
//! Small files, deletes, and ACL manifests travel here instead of the blob
//! path. Delivery is at-least-once on the wire and at-most-once on disk:
//! the sender holds every frame until the matching Ack/Nack arrives
//! (retrying across reconnects), and the receiver publishes bytes with the
//! same stage/journal/rename sequence the bulk download path uses.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

use crate::acl::{AclStore, Permission, ACL_FILE_NAME};
use crate::acl_staging::AclStaging;
use crate::control::ControlPlane;
use crate::errors::SyncErrorKind;
use crate::hotlink_manager::HotlinkManager;
use crate::http::ApiClient;
use crate::subscriptions::{Action, CachedSubscriptions};
use crate::wsproto::{
    self, Decoded, Encoding, FileWrite, WS_MAX_MESSAGE_BYTES,
};

/// Inline payload ceiling for priority-channel writes. Anything larger goes
/// through the blob path and arrives as a notify-only frame.
pub const PRIORITY_INLINE_LIMIT: usize = 4 * 1024 * 1024;

const SEND_QUEUE_DEPTH: usize = 256;
const ACK_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_FLOOR: Duration = Duration::from_millis(500);
const RECONNECT_CEILING: Duration = Duration::from_secs(30);

/// Cheap clonable sender into the channel's outbound queue. Hotlink session
/// negotiation shares the same socket through this handle.
#[derive(Clone)]
pub struct WsHandle {
    tx: mpsc::Sender<WsMessage>,
    encoding: Encoding,
}

impl WsHandle {
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub async fn send_ws(&self, msg: WsMessage) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| anyhow::anyhow!("priority channel closed"))
    }
}

enum AckOutcome {
    Acked,
    Nacked(String),
}

struct Shared {
    /// In-flight sends awaiting Ack/Nack, keyed by message id.
    pending: StdMutex<HashMap<String, oneshot::Sender<AckOutcome>>>,
    /// Frames not yet acknowledged, replayed verbatim after a reconnect.
    unacked: StdMutex<HashMap<String, WsMessage>>,
    wake: Notify,
}

/// Everything the inbound dispatcher needs to act on a frame.
pub struct PriorityDelivery {
    pub api: ApiClient,
    pub data_dir: PathBuf,
    pub owner_email: String,
    pub acl: Arc<AclStore>,
    pub subscriptions: Arc<CachedSubscriptions>,
    pub staging: Arc<AclStaging>,
    pub control: Option<ControlPlane>,
    pub hotlink: Option<HotlinkManager>,
}

pub struct PriorityChannel {
    server_url: String,
    owner_email: String,
    handle: WsHandle,
    outbound_rx: StdMutex<Option<mpsc::Receiver<WsMessage>>>,
    shared: Arc<Shared>,
}

impl PriorityChannel {
    pub fn new(server_url: &str, owner_email: &str, encoding: Encoding) -> Self {
        let (tx, rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        PriorityChannel {
            server_url: server_url.trim_end_matches('/').to_string(),
            owner_email: owner_email.to_string(),
            handle: WsHandle { tx, encoding },
            outbound_rx: StdMutex::new(Some(rx)),
            shared: Arc::new(Shared {
                pending: StdMutex::new(HashMap::new()),
                unacked: StdMutex::new(HashMap::new()),
                wake: Notify::new(),
            }),
        }
    }

    pub fn handle(&self) -> WsHandle {
        self.handle.clone()
    }

    /// Wait until an inbound delivery has changed local state (used by the
    /// sync loop as an extra wakeup source).
    pub async fn wait_delivery(&self) {
        self.shared.wake.notified().await;
    }

    /// Spawn the connect/reconnect loop. May only be called once.
    pub fn spawn(&self, delivery: PriorityDelivery, shutdown: Arc<Notify>) {
        let rx = self
            .outbound_rx
            .lock()
            .unwrap()
            .take()
            .expect("priority channel already spawned");
        let ws_url = ws_url(&self.server_url, &self.owner_email);
        let handle = self.handle.clone();
        let shared = self.shared.clone();
        tokio::spawn(run_channel(ws_url, handle, shared, rx, delivery, shutdown));
    }

    /// Send a small-file write and wait for the relay's Ack. A Nack maps to
    /// a precondition error; a timeout leaves the frame queued for replay
    /// after the next reconnect and reports transient.
    pub async fn send_file_write(&self, key: &str, etag: &str, content: Vec<u8>) -> Result<()> {
        if content.len() > PRIORITY_INLINE_LIMIT {
            return Err(SyncErrorKind::invalid(format!(
                "priority payload too large: {} bytes",
                content.len()
            )));
        }
        let write = FileWrite {
            path: key.to_string(),
            etag: etag.to_string(),
            length: content.len() as i64,
            content: Some(content),
        };
        let id = Uuid::new_v4().to_string();
        let frame = wsproto::encode_file_write(&id, &write, self.handle.encoding)?;
        self.send_and_await_ack(id, frame).await
    }

    pub async fn send_file_delete(&self, key: &str) -> Result<()> {
        let id = Uuid::new_v4().to_string();
        let frame = wsproto::encode_file_delete(&id, key, self.handle.encoding)?;
        self.send_and_await_ack(id, frame).await
    }

    async fn send_and_await_ack(&self, id: String, frame: WsMessage) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .unwrap()
            .insert(id.clone(), ack_tx);
        self.shared
            .unacked
            .lock()
            .unwrap()
            .insert(id.clone(), frame.clone());

        if let Err(err) = self.handle.send_ws(frame).await {
            self.shared.pending.lock().unwrap().remove(&id);
            self.shared.unacked.lock().unwrap().remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(ACK_TIMEOUT, ack_rx).await {
            Ok(Ok(AckOutcome::Acked)) => {
                self.shared.unacked.lock().unwrap().remove(&id);
                Ok(())
            }
            Ok(Ok(AckOutcome::Nacked(reason))) => {
                self.shared.unacked.lock().unwrap().remove(&id);
                Err(SyncErrorKind::precondition(format!(
                    "priority write rejected: {reason}"
                )))
            }
            Ok(Err(_)) | Err(_) => {
                // Keep the frame in `unacked` so a reconnect replays it.
                self.shared.pending.lock().unwrap().remove(&id);
                Err(SyncErrorKind::transient("priority ack timed out"))
            }
        }
    }
}

fn ws_url(server_url: &str, email: &str) -> String {
    let ws_base = if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{server_url}")
    };
    format!("{ws_base}/v1/ws?user={email}")
}

async fn run_channel(
    ws_url: String,
    handle: WsHandle,
    shared: Arc<Shared>,
    mut outbound_rx: mpsc::Receiver<WsMessage>,
    delivery: PriorityDelivery,
    shutdown: Arc<Notify>,
) {
    let mut backoff = RECONNECT_FLOOR;
    loop {
        let conn = tokio::select! {
            _ = shutdown.notified() => return,
            conn = connect(&delivery.api, &ws_url, handle.encoding) => conn,
        };

        let ws = match conn {
            Ok(ws) => ws,
            Err(err) => {
                crate::logging::error(format!("priority channel connect failed: {err:#}"));
                let wait = jittered(backoff);
                backoff = (backoff * 2).min(RECONNECT_CEILING);
                tokio::select! {
                    _ = shutdown.notified() => return,
                    _ = tokio::time::sleep(wait) => continue,
                }
            }
        };

        crate::logging::info_kv(
            "priority channel connected",
            &[("encoding", handle.encoding.as_str())],
        );
        backoff = RECONNECT_FLOOR;

        // Unacked writes from before the disconnect go out first.
        let replay: Vec<WsMessage> = shared
            .unacked
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();

        let exit = drive_connection(
            ws,
            replay,
            &handle,
            &shared,
            &mut outbound_rx,
            &delivery,
            &shutdown,
        )
        .await;

        match exit {
            ConnectionExit::Shutdown => return,
            ConnectionExit::Dropped => {
                crate::logging::info("priority channel disconnected, reconnecting");
            }
        }
    }
}

enum ConnectionExit {
    Shutdown,
    Dropped,
}

async fn connect(
    api: &ApiClient,
    ws_url: &str,
    encoding: Encoding,
) -> Result<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
> {
    api.ensure_access_token().await?;
    let mut request = ws_url
        .into_client_request()
        .context("build ws request")?;
    if let Some(token) = api.current_access_token().await {
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {token}").parse().context("auth header")?,
        );
    }
    request.headers_mut().insert(
        "X-Syft-Msg-Encoding",
        encoding.as_str().parse().context("encoding header")?,
    );
    let (ws, _resp) = connect_async(request).await.context("ws connect")?;
    Ok(ws)
}

async fn drive_connection(
    mut ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    replay: Vec<WsMessage>,
    handle: &WsHandle,
    shared: &Arc<Shared>,
    outbound_rx: &mut mpsc::Receiver<WsMessage>,
    delivery: &PriorityDelivery,
    shutdown: &Arc<Notify>,
) -> ConnectionExit {
    for frame in replay {
        if ws.send(frame).await.is_err() {
            return ConnectionExit::Dropped;
        }
    }

    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                let _ = ws.close(None).await;
                return ConnectionExit::Shutdown;
            }
            out = outbound_rx.recv() => {
                match out {
                    Some(msg) => {
                        if ws.send(msg).await.is_err() {
                            return ConnectionExit::Dropped;
                        }
                    }
                    None => return ConnectionExit::Shutdown,
                }
            }
            inbound = ws.next() => {
                match inbound {
                    Some(Ok(msg)) => {
                        if let Some(decoded) = decode_ws_message(msg) {
                            dispatch(decoded, handle, shared, delivery).await;
                        }
                    }
                    Some(Err(err)) => {
                        crate::logging::error(format!("priority channel read error: {err}"));
                        return ConnectionExit::Dropped;
                    }
                    None => return ConnectionExit::Dropped,
                }
            }
        }
    }
}

fn decode_ws_message(msg: WsMessage) -> Option<Decoded> {
    let decoded = match msg {
        WsMessage::Text(raw) => wsproto::decode_text_json(&raw),
        WsMessage::Binary(raw) => {
            if raw.len() > WS_MAX_MESSAGE_BYTES {
                crate::logging::error(format!(
                    "priority channel frame oversize: {} bytes",
                    raw.len()
                ));
                return None;
            }
            wsproto::decode_binary(&raw)
        }
        WsMessage::Close(_) => return None,
        // Pings are answered by the websocket layer on the next flush.
        _ => return None,
    };
    match decoded {
        Ok(d) => Some(d),
        Err(err) => {
            crate::logging::error(format!("priority channel decode error: {err:#}"));
            None
        }
    }
}

async fn dispatch(
    decoded: Decoded,
    handle: &WsHandle,
    shared: &Arc<Shared>,
    delivery: &PriorityDelivery,
) {
    match decoded {
        Decoded::Ack(ack) => {
            if let Some(tx) = shared.pending.lock().unwrap().remove(&ack.original_id) {
                let _ = tx.send(AckOutcome::Acked);
            }
        }
        Decoded::Nack(nack) => {
            if let Some(tx) = shared.pending.lock().unwrap().remove(&nack.original_id) {
                let _ = tx.send(AckOutcome::Nacked(nack.error));
            }
        }
        Decoded::FileWrite { id, write } => {
            match handle_file_write(delivery, &write).await {
                Ok(changed) => {
                    send_ack(handle, &id).await;
                    if changed {
                        notify_delivery(shared, delivery);
                    }
                }
                Err(err) => {
                    crate::logging::error(format!(
                        "priority write failed path={} err={err:#}",
                        write.path
                    ));
                    send_nack(handle, &id, &err.to_string()).await;
                }
            }
        }
        Decoded::FileDelete { id, delete } => {
            match handle_file_delete(delivery, &delete.path) {
                Ok(changed) => {
                    send_ack(handle, &id).await;
                    if changed {
                        notify_delivery(shared, delivery);
                    }
                }
                Err(err) => {
                    crate::logging::error(format!(
                        "priority delete failed path={} err={err:#}",
                        delete.path
                    ));
                    send_nack(handle, &id, &err.to_string()).await;
                }
            }
        }
        Decoded::AclManifest { id, manifest } => {
            delivery.staging.announce(manifest);
            send_ack(handle, &id).await;
        }
        Decoded::HotlinkOpen { session_id, path } => {
            if let Some(hotlink) = &delivery.hotlink {
                hotlink.handle_open(session_id, path).await;
            }
        }
        Decoded::HotlinkAccept { session_id } => {
            if let Some(hotlink) = &delivery.hotlink {
                hotlink.handle_accept(session_id).await;
            }
        }
        Decoded::HotlinkReject { session_id, reason } => {
            if let Some(hotlink) = &delivery.hotlink {
                hotlink.handle_reject(session_id, reason).await;
            }
        }
        Decoded::HotlinkData {
            session_id,
            path,
            etag,
            seq,
            payload,
        } => {
            if let Some(hotlink) = &delivery.hotlink {
                hotlink.handle_data(session_id, path, etag, seq, payload).await;
            }
        }
        Decoded::HotlinkClose { session_id, reason } => {
            if let Some(hotlink) = &delivery.hotlink {
                crate::logging::info(format!(
                    "hotlink session closed: session={session_id} reason={reason}"
                ));
                hotlink.handle_close(session_id).await;
            }
        }
        Decoded::Other { id, typ } => {
            crate::logging::info(format!("priority channel ignoring message id={id} typ={typ}"));
        }
    }
}

fn notify_delivery(shared: &Arc<Shared>, delivery: &PriorityDelivery) {
    shared.wake.notify_waiters();
    if let Some(cp) = &delivery.control {
        cp.trigger_sync();
    }
}

async fn send_ack(handle: &WsHandle, original_id: &str) {
    let id = Uuid::new_v4().to_string();
    match wsproto::encode_ack(&id, original_id, handle.encoding) {
        Ok(frame) => {
            let _ = handle.send_ws(frame).await;
        }
        Err(err) => crate::logging::error(format!("encode ack failed: {err:#}")),
    }
}

async fn send_nack(handle: &WsHandle, original_id: &str, error: &str) {
    let id = Uuid::new_v4().to_string();
    match wsproto::encode_nack(&id, original_id, error, handle.encoding) {
        Ok(frame) => {
            let _ = handle.send_ws(frame).await;
        }
        Err(err) => crate::logging::error(format!("encode nack failed: {err:#}")),
    }
}

/// Apply an inbound small-file write. Returns whether local state changed
/// (an ACL-staged write reports true as well since the staging callback
/// publishes it).
async fn handle_file_write(delivery: &PriorityDelivery, write: &FileWrite) -> Result<bool> {
    let key = normalize_key(&write.path)?;
    let (owner, rel) = split_key(&key)?;

    if owner.eq_ignore_ascii_case(&delivery.owner_email) {
        // Echo of our own write fanned back out by the relay.
        return Ok(false);
    }

    let is_acl_file = Path::new(rel)
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n == ACL_FILE_NAME);

    if is_acl_file {
        return handle_acl_file_write(delivery, &key, owner, write);
    }

    match delivery.subscriptions.action_for(&delivery.owner_email, &key) {
        Action::Allow => {}
        other => {
            return Err(SyncErrorKind::precondition(format!(
                "subscription {:?} for {key}",
                other
            )))
        }
    }

    if !acl_allows_read(delivery, owner, rel) {
        return Err(SyncErrorKind::precondition(format!("acl denies read: {key}")));
    }

    match write.content.as_deref() {
        Some(content) if content.len() <= PRIORITY_INLINE_LIMIT => {
            publish_inline_write(&delivery.data_dir, &key, &write.etag, content)?;
            Ok(true)
        }
        Some(content) => Err(SyncErrorKind::invalid(format!(
            "inline payload too large: {} bytes",
            content.len()
        ))),
        // Notify-only frame: the reconciler pulls the bytes over the blob path.
        None => Ok(true),
    }
}

fn handle_acl_file_write(
    delivery: &PriorityDelivery,
    key: &str,
    owner: &str,
    write: &FileWrite,
) -> Result<bool> {
    let content = write
        .content
        .as_deref()
        .ok_or_else(|| SyncErrorKind::invalid("acl write without inline content"))?;

    // When a manifest announced an ordered ACL set, hold each file until the
    // set completes; the staging callback publishes them in order. Manifest
    // entries name the ruleset's directory, not the file inside it.
    let dir_key = key
        .strip_suffix(&format!("/{ACL_FILE_NAME}"))
        .unwrap_or(key);
    if delivery
        .staging
        .accept(owner, dir_key, content.to_vec(), write.etag.clone())
    {
        return Ok(true);
    }

    publish_inline_write(&delivery.data_dir, key, &write.etag, content)?;
    for err in delivery.acl.reload(owner) {
        crate::logging::error(format!("{err}"));
    }
    Ok(true)
}

fn handle_file_delete(delivery: &PriorityDelivery, path: &str) -> Result<bool> {
    let key = normalize_key(path)?;
    let (owner, _rel) = split_key(&key)?;

    if owner.eq_ignore_ascii_case(&delivery.owner_email) {
        return Ok(false);
    }

    // Pause freezes the existing local copy; the delete is suppressed.
    if delivery.subscriptions.action_for(&delivery.owner_email, &key) == Action::Pause {
        return Ok(false);
    }

    let target = delivery.data_dir.join("datasites").join(&key);
    if target.exists() {
        if target.is_dir() {
            std::fs::remove_dir_all(&target)
                .with_context(|| format!("remove {}", target.display()))?;
        } else {
            std::fs::remove_file(&target)
                .with_context(|| format!("remove {}", target.display()))?;
        }
    }
    crate::sync::journal_delete_direct(&delivery.data_dir, &key)?;
    Ok(true)
}

fn acl_allows_read(delivery: &PriorityDelivery, owner: &str, rel: &str) -> bool {
    if delivery
        .acl
        .check(owner, &delivery.owner_email, rel, Permission::Read)
    {
        return true;
    }
    // The mirror's ACL tree may not be loaded yet (first delivery for this
    // datasite); reload once before concluding the relay sent something we
    // may not read.
    delivery.acl.reload(owner);
    delivery
        .acl
        .check(owner, &delivery.owner_email, rel, Permission::Read)
}

/// Stage, journal, then rename, so no observer ever reads a torn write and
/// the journal row always lands before the bytes become visible.
pub(crate) fn publish_inline_write(
    data_dir: &Path,
    key: &str,
    etag: &str,
    content: &[u8],
) -> Result<()> {
    let target = data_dir.join("datasites").join(key);
    crate::sync::ensure_parent_dirs(&target)?;

    let fname = target
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("delivery");
    let tmp = target
        .parent()
        .map(|p| p.join(format!(".{fname}.tmp-{}", Uuid::new_v4())))
        .ok_or_else(|| anyhow::anyhow!("target has no parent: {}", target.display()))?;

    std::fs::write(&tmp, content).with_context(|| format!("write {}", tmp.display()))?;

    let local_etag = format!("{:x}", md5::compute(content));
    let now = chrono::Utc::now().timestamp();
    crate::sync::journal_upsert_direct(
        data_dir,
        key,
        etag,
        &local_etag,
        content.len() as i64,
        now,
    )?;

    if target.exists() && target.is_dir() {
        std::fs::remove_dir_all(&target)
            .with_context(|| format!("remove {}", target.display()))?;
    }
    std::fs::rename(&tmp, &target)
        .with_context(|| format!("rename {} -> {}", tmp.display(), target.display()))?;
    Ok(())
}

fn normalize_key(raw: &str) -> Result<String> {
    let key = raw.trim().trim_start_matches('/').replace('\\', "/");
    if key.is_empty() {
        return Err(SyncErrorKind::invalid("empty path"));
    }
    for component in key.split('/') {
        if component.is_empty() || component == ".." {
            return Err(SyncErrorKind::invalid(format!("invalid path: {raw}")));
        }
    }
    Ok(key)
}

fn split_key(key: &str) -> Result<(&str, &str)> {
    let Some((owner, rel)) = key.split_once('/') else {
        return Err(SyncErrorKind::invalid(format!("key has no owner: {key}")));
    };
    if !owner.contains('@') || rel.is_empty() {
        return Err(SyncErrorKind::invalid(format!("key has no owner: {key}")));
    }
    Ok((owner, rel))
}

fn jittered(base: Duration) -> Duration {
    let millis = base.as_millis().max(1) as i64;
    let jitter_range = millis / 4;
    let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
    Duration::from_millis((millis + jitter).max(1) as u64)
}
