//! Hotlink session management: the experimental local fast path.
//!
//! Colocated processes that want priority-channel bytes without a round
//! trip through the filesystem advertise an IPC socket via marker files in
//! their RPC endpoint directory. Session negotiation (open, accept/reject,
//! data, close) rides the priority channel; payload frames cross the local
//! socket. Everything here is inert unless `SYFTBOX_HOTLINK=1`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::FutureExt;
use tokio::sync::{watch, Mutex, Notify};
use uuid::Uuid;

use crate::hotlink::{
    bind_ipc, prepare_ipc_marker, HotlinkFrame, HotlinkListener, HotlinkStream, IpcMode,
    ACCEPT_MARKER,
};
use crate::priority::WsHandle;
use crate::wsproto;

/// How long the sender waits for the peer to accept before falling back to
/// the regular sync path.
const DECISION_WAIT: Duration = Duration::from_millis(1500);
/// How long the receiver polls for a local consumer's accept marker.
const CONSUMER_WAIT: Duration = Duration::from_millis(1500);
const CONSUMER_POLL: Duration = Duration::from_millis(200);
const IPC_ACCEPT_WAIT: Duration = Duration::from_secs(5);
const DISCOVERY_SWEEP: Duration = Duration::from_millis(250);

/// Decides whether hotlink traffic for a sync key may flow: the same ACL
/// read + subscription allow combination the bulk transfer path enforces.
pub type HotlinkGate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Decision {
    Pending,
    Accepted,
    Rejected,
}

/// A session a remote peer opened toward us; frames get forwarded to the
/// local consumer's IPC socket.
struct InboundSession {
    path: String,
    ipc_marker: PathBuf,
}

/// A session we opened toward a peer, keyed by the endpoint directory so
/// consecutive writes to the same endpoint reuse it.
struct OutboundSession {
    dir_key: String,
    next_seq: u64,
    decision_tx: watch::Sender<Decision>,
    // Held so the decision can land before (or without) anyone waiting;
    // subscribers always observe the current value.
    _decision_rx: watch::Receiver<Decision>,
}

/// Listener plus the currently connected consumer for one IPC marker.
/// A write failure drops the connection; the next frame re-accepts.
struct IpcForwarder {
    listener: Option<HotlinkListener>,
    conn: Option<HotlinkStream>,
}

impl IpcForwarder {
    fn new() -> Self {
        Self {
            listener: None,
            conn: None,
        }
    }

    async fn ensure_listener(&mut self, marker: &Path) -> Result<()> {
        if self.listener.is_none() {
            self.listener = Some(bind_ipc(marker).await?);
        }
        Ok(())
    }

    async fn forward(&mut self, marker: &Path, frame: &HotlinkFrame) -> Result<()> {
        self.ensure_listener(marker).await?;
        if self.conn.is_none() {
            let listener = self.listener.as_ref().context("ipc listener")?;
            self.conn = Some(listener.accept(IPC_ACCEPT_WAIT).await?);
        }
        let conn = self.conn.as_mut().context("ipc connection")?;
        if let Err(err) = conn.write_frame(frame).await {
            self.conn = None;
            return Err(err).context("ipc write");
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct HotlinkManager {
    enabled: bool,
    discovery_enabled: bool,
    datasites_root: PathBuf,
    ws: WsHandle,
    gate: HotlinkGate,
    inbound: Arc<Mutex<HashMap<String, InboundSession>>>,
    outbound: Arc<Mutex<HashMap<String, OutboundSession>>>,
    outbound_by_dir: Arc<Mutex<HashMap<String, String>>>,
    forwarders: Arc<Mutex<HashMap<PathBuf, Arc<Mutex<IpcForwarder>>>>>,
    watched_markers: Arc<Mutex<HashMap<PathBuf, ()>>>,
    shutdown: Arc<Notify>,
}

impl HotlinkManager {
    pub fn new(
        datasites_root: PathBuf,
        ws: WsHandle,
        shutdown: Arc<Notify>,
        gate: HotlinkGate,
    ) -> Self {
        let flag = |name: &str| std::env::var(name).ok().as_deref() == Some("1");
        Self {
            enabled: flag("SYFTBOX_HOTLINK"),
            discovery_enabled: flag("SYFTBOX_HOTLINK_SOCKET_ONLY"),
            datasites_root,
            ws,
            gate,
            inbound: Arc::new(Mutex::new(HashMap::new())),
            outbound: Arc::new(Mutex::new(HashMap::new())),
            outbound_by_dir: Arc::new(Mutex::new(HashMap::new())),
            forwarders: Arc::new(Mutex::new(HashMap::new())),
            watched_markers: Arc::new(Mutex::new(HashMap::new())),
            shutdown,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Sweep the owner's `app_data` tree for IPC markers and attach a
    /// reader to each; frames written by local apps become hotlink sends.
    pub fn start_local_discovery(&self, owner_email: String) {
        if !self.enabled || !self.discovery_enabled {
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            let root = manager.datasites_root.join(&owner_email).join("app_data");
            let marker_name = IpcMode::detect().marker_file_name();
            loop {
                if manager.shutdown.notified().now_or_never().is_some() {
                    return;
                }

                let mut fresh = Vec::new();
                for entry in walkdir::WalkDir::new(&root)
                    .into_iter()
                    .filter_map(Result::ok)
                {
                    if entry.file_type().is_file()
                        && entry.file_name().to_string_lossy() == marker_name
                    {
                        fresh.push(entry.path().to_path_buf());
                    }
                }

                for marker in fresh {
                    let mut watched = manager.watched_markers.lock().await;
                    if watched.insert(marker.clone(), ()).is_none() {
                        let reader = manager.clone();
                        tokio::spawn(async move {
                            reader.pump_local_frames(marker).await;
                        });
                    }
                }

                tokio::time::sleep(DISCOVERY_SWEEP).await;
            }
        });
    }

    /// Accept connections on one local marker's socket and relay every
    /// frame a local app writes.
    async fn pump_local_frames(&self, marker: PathBuf) {
        if let Err(err) = prepare_ipc_marker(&marker).await {
            crate::logging::error(format!("hotlink marker setup failed: {err:#}"));
            return;
        }
        let listener = match bind_ipc(&marker).await {
            Ok(l) => l,
            Err(err) => {
                crate::logging::error(format!("hotlink ipc listen failed: {err:#}"));
                return;
            }
        };

        loop {
            if self.shutdown.notified().now_or_never().is_some() {
                return;
            }
            let Ok(mut conn) = listener.accept(IPC_ACCEPT_WAIT).await else {
                continue;
            };
            while let Ok(frame) = conn.read_frame().await {
                if frame.path.trim().is_empty() || frame.payload.is_empty() {
                    continue;
                }
                let etag = if frame.etag.trim().is_empty() {
                    format!("{:x}", md5::compute(&frame.payload))
                } else {
                    frame.etag.clone()
                };
                self.send_best_effort(frame.path, etag, frame.payload).await;
            }
        }
    }

    // ---- receiver side ----

    pub async fn handle_open(&self, session_id: String, path: String) {
        if !self.enabled {
            return;
        }
        // Same gates as the bulk transfer path: a session for a path we may
        // not read (or have not subscribed to) never gets accepted.
        if !(self.gate)(&path) {
            self.send_control(wsproto::encode_hotlink_reject(
                &new_id(),
                &session_id,
                "not permitted",
                self.ws.encoding(),
            ))
            .await;
            return;
        }

        let endpoint_dir = self.datasites_root.join(endpoint_dir_of(&path));
        let ipc_marker = endpoint_dir.join(IpcMode::detect().marker_file_name());
        let prepared = async {
            tokio::fs::create_dir_all(&endpoint_dir).await?;
            prepare_ipc_marker(&ipc_marker).await?;
            // Bind eagerly so a consumer can connect before the first frame.
            self.forwarder_for(&ipc_marker)
                .await
                .lock()
                .await
                .ensure_listener(&ipc_marker)
                .await
        }
        .await;
        if let Err(err) = prepared {
            crate::logging::error(format!("hotlink open setup failed: {err:#}"));
            self.send_control(wsproto::encode_hotlink_reject(
                &new_id(),
                &session_id,
                "ipc unavailable",
                self.ws.encoding(),
            ))
            .await;
            return;
        }

        self.inbound.lock().await.insert(
            session_id.clone(),
            InboundSession {
                path,
                ipc_marker,
            },
        );

        // The accept marker is the local consumer's opt-in; poll briefly
        // in case it is still starting up.
        let accept_marker = endpoint_dir.join(ACCEPT_MARKER);
        let manager = self.clone();
        tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + CONSUMER_WAIT;
            loop {
                if tokio::fs::metadata(&accept_marker).await.is_ok() {
                    manager
                        .send_control(wsproto::encode_hotlink_accept(
                            &new_id(),
                            &session_id,
                            manager.ws.encoding(),
                        ))
                        .await;
                    return;
                }
                if tokio::time::Instant::now() >= deadline {
                    manager
                        .send_control(wsproto::encode_hotlink_reject(
                            &new_id(),
                            &session_id,
                            "no local consumer",
                            manager.ws.encoding(),
                        ))
                        .await;
                    manager.inbound.lock().await.remove(&session_id);
                    return;
                }
                tokio::time::sleep(CONSUMER_POLL).await;
            }
        });
    }

    pub async fn handle_data(
        &self,
        session_id: String,
        path: String,
        etag: String,
        seq: u64,
        payload: Vec<u8>,
    ) {
        if !self.enabled {
            return;
        }
        let (frame, ipc_marker) = {
            let inbound = self.inbound.lock().await;
            let Some(session) = inbound.get(&session_id) else {
                return;
            };
            let frame_path = if path.trim().is_empty() {
                session.path.clone()
            } else {
                path
            };
            (
                HotlinkFrame {
                    path: frame_path,
                    etag,
                    seq,
                    payload,
                },
                session.ipc_marker.clone(),
            )
        };

        // Re-gate per frame: the session may outlive an ACL or
        // subscription change.
        if !(self.gate)(&frame.path) {
            return;
        }

        let forwarder = self.forwarder_for(&ipc_marker).await;
        let result = forwarder.lock().await.forward(&ipc_marker, &frame).await;
        if let Err(err) = result {
            crate::logging::error(format!("hotlink forward failed: {err:#}"));
        }
    }

    pub async fn handle_close(&self, session_id: String) {
        if !self.enabled {
            return;
        }
        self.inbound.lock().await.remove(&session_id);
    }

    // ---- sender side ----

    pub async fn handle_accept(&self, session_id: String) {
        self.resolve_decision(&session_id, Decision::Accepted).await;
    }

    pub async fn handle_reject(&self, session_id: String, reason: String) {
        crate::logging::info(format!(
            "hotlink rejected: session={session_id} reason={reason}"
        ));
        self.resolve_decision(&session_id, Decision::Rejected).await;
    }

    async fn resolve_decision(&self, session_id: &str, decision: Decision) {
        if !self.enabled {
            return;
        }
        if let Some(session) = self.outbound.lock().await.get(session_id) {
            let _ = session.decision_tx.send(decision);
        }
    }

    /// Try to push one payload over a hotlink session; every failure mode
    /// just leaves delivery to the regular sync path.
    pub async fn send_best_effort(&self, rel_path: String, etag: String, payload: Vec<u8>) {
        if !self.enabled || payload.is_empty() || !is_hotlink_eligible(&rel_path) {
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(err) = manager.send_via_session(rel_path, etag, payload).await {
                crate::logging::error(format!("hotlink send failed: {err:#}"));
            }
        });
    }

    async fn send_via_session(
        &self,
        rel_path: String,
        etag: String,
        payload: Vec<u8>,
    ) -> Result<()> {
        let dir_key = endpoint_dir_of(&rel_path).to_string_lossy().to_string();
        let session_id = match self.existing_session(&dir_key).await {
            Some(id) => id,
            None => self.open_session(&dir_key, &rel_path).await?,
        };

        if !self.await_acceptance(&session_id).await {
            self.send_control(wsproto::encode_hotlink_close(
                &new_id(),
                &session_id,
                "fallback",
                self.ws.encoding(),
            ))
            .await;
            self.drop_session(&session_id).await;
            return Ok(());
        }

        let seq = {
            let mut outbound = self.outbound.lock().await;
            match outbound.get_mut(&session_id) {
                Some(session) => {
                    session.next_seq += 1;
                    session.next_seq
                }
                None => return Ok(()),
            }
        };
        self.ws
            .send_ws(wsproto::encode_hotlink_data(
                &new_id(),
                &session_id,
                seq,
                &rel_path,
                &etag,
                payload,
                self.ws.encoding(),
            )?)
            .await
    }

    async fn existing_session(&self, dir_key: &str) -> Option<String> {
        self.outbound_by_dir.lock().await.get(dir_key).cloned()
    }

    async fn open_session(&self, dir_key: &str, rel_path: &str) -> Result<String> {
        let session_id = new_id();
        let (decision_tx, decision_rx) = watch::channel(Decision::Pending);
        self.outbound.lock().await.insert(
            session_id.clone(),
            OutboundSession {
                dir_key: dir_key.to_string(),
                next_seq: 0,
                decision_tx,
                _decision_rx: decision_rx,
            },
        );
        self.outbound_by_dir
            .lock()
            .await
            .insert(dir_key.to_string(), session_id.clone());

        let open = wsproto::encode_hotlink_open(
            &new_id(),
            &session_id,
            rel_path,
            self.ws.encoding(),
        )?;
        if let Err(err) = self.ws.send_ws(open).await {
            self.drop_session(&session_id).await;
            return Err(err);
        }
        Ok(session_id)
    }

    async fn await_acceptance(&self, session_id: &str) -> bool {
        let mut rx = {
            let outbound = self.outbound.lock().await;
            match outbound.get(session_id) {
                Some(session) => session.decision_tx.subscribe(),
                None => return false,
            }
        };
        let decided = tokio::time::timeout(
            DECISION_WAIT,
            rx.wait_for(|decision| *decision != Decision::Pending),
        )
        .await;
        matches!(decided, Ok(Ok(decision)) if *decision == Decision::Accepted)
    }

    async fn drop_session(&self, session_id: &str) {
        if let Some(session) = self.outbound.lock().await.remove(session_id) {
            self.outbound_by_dir.lock().await.remove(&session.dir_key);
        }
    }

    async fn forwarder_for(&self, marker: &Path) -> Arc<Mutex<IpcForwarder>> {
        self.forwarders
            .lock()
            .await
            .entry(marker.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(IpcForwarder::new())))
            .clone()
    }

    async fn send_control(&self, frame: Result<tokio_tungstenite::tungstenite::Message>) {
        match frame {
            Ok(frame) => {
                if let Err(err) = self.ws.send_ws(frame).await {
                    crate::logging::error(format!("hotlink control send failed: {err:#}"));
                }
            }
            Err(err) => crate::logging::error(format!("hotlink encode failed: {err:#}")),
        }
    }
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Only RPC request/response files ride the hotlink.
fn is_hotlink_eligible(path: &str) -> bool {
    path.ends_with(".request") || path.ends_with(".response")
}

/// The endpoint directory a payload path belongs to: its parent for
/// eligible files, the path itself otherwise.
fn endpoint_dir_of(path: &str) -> PathBuf {
    let p = Path::new(path);
    if is_hotlink_eligible(path) {
        if let Some(parent) = p.parent() {
            return parent.to_path_buf();
        }
    }
    p.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eligibility_is_limited_to_rpc_traffic() {
        assert!(is_hotlink_eligible("a@b.c/app_data/demo/rpc/ep/call.request"));
        assert!(is_hotlink_eligible("a@b.c/app_data/demo/rpc/ep/call.response"));
        assert!(!is_hotlink_eligible("a@b.c/public/data.bin"));
        assert!(!is_hotlink_eligible("a@b.c/public/syft.pub.yaml"));
    }

    #[test]
    fn endpoint_dir_strips_eligible_file_names_only() {
        assert_eq!(
            endpoint_dir_of("a@b.c/app_data/demo/rpc/ep/call.request"),
            PathBuf::from("a@b.c/app_data/demo/rpc/ep")
        );
        assert_eq!(
            endpoint_dir_of("a@b.c/app_data/demo/rpc/ep"),
            PathBuf::from("a@b.c/app_data/demo/rpc/ep")
        );
    }
}
