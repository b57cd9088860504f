//! Hotlink wire and IPC primitives: the length-delimited `HLNK` frame and
//! the local socket transport it crosses between the daemon and colocated
//! app processes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const FRAME_MAGIC: [u8; 4] = *b"HLNK";
const FRAME_VERSION: u8 = 1;
const SOCKET_DIR: &str = "/tmp/syftbox-hotlink";
const DIAL_POLL: Duration = Duration::from_millis(50);

/// Touching this file in an endpoint directory is how a local consumer
/// opts in to receiving hotlink frames for it.
pub const ACCEPT_MARKER: &str = "stream.accept";

/// One payload frame. On the wire: the 4-byte magic, a version byte, path
/// and etag lengths as u16, payload length as u32, the sequence number as
/// u64 (all big-endian), then the three byte runs in that order.
#[derive(Debug, Clone)]
pub struct HotlinkFrame {
    pub path: String,
    pub etag: String,
    pub seq: u64,
    pub payload: Vec<u8>,
}

impl HotlinkFrame {
    pub fn encode(&self) -> Vec<u8> {
        let path = self.path.as_bytes();
        let etag = self.etag.as_bytes();
        let mut out =
            Vec::with_capacity(4 + 1 + 2 + 2 + 4 + 8 + path.len() + etag.len() + self.payload.len());
        out.extend_from_slice(&FRAME_MAGIC);
        out.push(FRAME_VERSION);
        out.extend_from_slice(&(path.len() as u16).to_be_bytes());
        out.extend_from_slice(&(etag.len() as u16).to_be_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(path);
        out.extend_from_slice(etag);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Read the next frame, resynchronizing on the magic so a torn write
    /// from a crashed peer does not poison the stream forever.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut window = [0u8; 4];
        reader.read_exact(&mut window).await?;
        while window != FRAME_MAGIC {
            window.rotate_left(1);
            window[3] = reader.read_u8().await?;
        }

        let version = reader.read_u8().await?;
        if version != FRAME_VERSION {
            bail!("unsupported hotlink frame version: {version}");
        }
        let path_len = reader.read_u16().await? as usize;
        let etag_len = reader.read_u16().await? as usize;
        let payload_len = reader.read_u32().await? as usize;
        let seq = reader.read_u64().await?;

        let mut path = vec![0u8; path_len];
        reader.read_exact(&mut path).await?;
        let mut etag = vec![0u8; etag_len];
        reader.read_exact(&mut etag).await?;
        let mut payload = vec![0u8; payload_len];
        reader.read_exact(&mut payload).await?;

        Ok(Self {
            path: String::from_utf8(path).context("frame path utf8")?,
            etag: String::from_utf8(etag).context("frame etag utf8")?,
            seq,
            payload,
        })
    }
}

/// Which local transport carries frames. TCP is opt-in via
/// `SYFTBOX_HOTLINK_IPC=tcp`; Windows would need named pipes, which are
/// not implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcMode {
    Unix,
    Tcp,
    Pipe,
}

impl IpcMode {
    pub fn detect() -> Self {
        let requested = std::env::var("SYFTBOX_HOTLINK_IPC")
            .map(|v| v.trim().to_lowercase())
            .unwrap_or_default();
        if requested == "tcp" {
            IpcMode::Tcp
        } else if cfg!(windows) {
            IpcMode::Pipe
        } else {
            IpcMode::Unix
        }
    }

    /// Marker file a sender drops into the endpoint directory; its content
    /// is the address to dial.
    pub fn marker_file_name(self) -> &'static str {
        match self {
            IpcMode::Unix => "stream.sock",
            IpcMode::Tcp => "stream.tcp",
            IpcMode::Pipe => "stream.pipe",
        }
    }
}

/// `datasites/<owner>/app_data/<app>/rpc/<endpoint>`.
pub fn endpoint_dir(datasites_root: &Path, owner: &str, app: &str, endpoint: &str) -> PathBuf {
    datasites_root
        .join(owner)
        .join("app_data")
        .join(app)
        .join("rpc")
        .join(endpoint)
}

pub fn ipc_marker_path(datasites_root: &Path, owner: &str, app: &str, endpoint: &str) -> PathBuf {
    endpoint_dir(datasites_root, owner, app, endpoint).join(IpcMode::detect().marker_file_name())
}

pub fn accept_marker_path(
    datasites_root: &Path,
    owner: &str,
    app: &str,
    endpoint: &str,
) -> PathBuf {
    endpoint_dir(datasites_root, owner, app, endpoint).join(ACCEPT_MARKER)
}

pub async fn touch_accept_marker(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::write(path, b"1").await?;
    Ok(())
}

/// Unix sockets live under a private directory keyed by the marker path,
/// keeping datasite trees free of socket inodes (which must never sync).
fn socket_path_for(marker: &Path) -> PathBuf {
    let digest = Sha1::digest(marker.as_os_str().to_string_lossy().as_bytes());
    PathBuf::from(SOCKET_DIR).join(format!("{digest:x}.sock"))
}

/// Create the marker and fill in the address a consumer should dial.
pub async fn prepare_ipc_marker(marker: &Path) -> Result<()> {
    if let Some(dir) = marker.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    match IpcMode::detect() {
        IpcMode::Unix => {
            tokio::fs::create_dir_all(SOCKET_DIR).await?;
            let target = socket_path_for(marker);
            tokio::fs::write(marker, target.to_string_lossy().as_bytes()).await?;
        }
        IpcMode::Tcp => {
            let addr = std::env::var("SYFTBOX_HOTLINK_TCP_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:0".to_string());
            tokio::fs::write(marker, addr).await?;
        }
        IpcMode::Pipe => {
            tokio::fs::write(marker, b"").await?;
        }
    }
    Ok(())
}

pub enum HotlinkListener {
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
    Tcp(tokio::net::TcpListener),
}

pub enum HotlinkStream {
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
    Tcp(tokio::net::TcpStream),
}

/// Bind the listening side for a marker, refreshing the marker content
/// with the actual address (relevant for TCP's port 0).
pub async fn bind_ipc(marker: &Path) -> Result<HotlinkListener> {
    prepare_ipc_marker(marker).await?;
    match IpcMode::detect() {
        IpcMode::Unix => {
            #[cfg(unix)]
            {
                let target = socket_path_for(marker);
                let _ = tokio::fs::remove_file(&target).await;
                let listener = tokio::net::UnixListener::bind(&target)
                    .with_context(|| format!("bind {}", target.display()))?;
                Ok(HotlinkListener::Unix(listener))
            }
            #[cfg(not(unix))]
            {
                bail!("unix sockets are not available on this platform")
            }
        }
        IpcMode::Tcp => {
            let addr = std::env::var("SYFTBOX_HOTLINK_TCP_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:0".to_string());
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("bind {addr}"))?;
            if let Ok(bound) = listener.local_addr() {
                tokio::fs::write(marker, bound.to_string()).await?;
            }
            Ok(HotlinkListener::Tcp(listener))
        }
        IpcMode::Pipe => bail!("named pipe hotlink ipc is not implemented"),
    }
}

/// Dial the address a marker advertises, polling until the sender has
/// filled it in and bound, or the deadline passes.
pub async fn dial_ipc(marker: &Path, wait: Duration) -> Result<HotlinkStream> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        if tokio::time::Instant::now() > deadline {
            bail!("timed out dialing hotlink ipc via {}", marker.display());
        }

        let target = match tokio::fs::read(marker).await {
            Ok(raw) => String::from_utf8_lossy(&raw).trim().to_string(),
            Err(_) => String::new(),
        };
        if !target.is_empty() {
            if target.contains(':') && !target.starts_with('/') {
                if let Ok(stream) = tokio::net::TcpStream::connect(&target).await {
                    return Ok(HotlinkStream::Tcp(stream));
                }
            }
            #[cfg(unix)]
            if !target.contains(':') || target.starts_with('/') {
                if let Ok(stream) = tokio::net::UnixStream::connect(&target).await {
                    return Ok(HotlinkStream::Unix(stream));
                }
            }
        }
        tokio::time::sleep(DIAL_POLL).await;
    }
}

impl HotlinkListener {
    pub async fn accept(&self, wait: Duration) -> Result<HotlinkStream> {
        match self {
            #[cfg(unix)]
            HotlinkListener::Unix(listener) => {
                let (stream, _) = tokio::time::timeout(wait, listener.accept()).await??;
                Ok(HotlinkStream::Unix(stream))
            }
            HotlinkListener::Tcp(listener) => {
                let (stream, _) = tokio::time::timeout(wait, listener.accept()).await??;
                Ok(HotlinkStream::Tcp(stream))
            }
        }
    }
}

impl HotlinkStream {
    pub async fn write_frame(&mut self, frame: &HotlinkFrame) -> Result<()> {
        let bytes = frame.encode();
        match self {
            #[cfg(unix)]
            HotlinkStream::Unix(stream) => write_all_flush(stream, &bytes).await,
            HotlinkStream::Tcp(stream) => write_all_flush(stream, &bytes).await,
        }
    }

    pub async fn read_frame(&mut self) -> Result<HotlinkFrame> {
        match self {
            #[cfg(unix)]
            HotlinkStream::Unix(stream) => HotlinkFrame::read_from(stream).await,
            HotlinkStream::Tcp(stream) => HotlinkFrame::read_from(stream).await,
        }
    }
}

async fn write_all_flush<W>(writer: &mut W, bytes: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn make_temp_dir(name: &str) -> PathBuf {
        let mut root = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        root.push(format!("datasite-sync-hotlink-test-{name}-{nanos}"));
        std::fs::create_dir_all(&root).unwrap();
        root
    }

    #[test]
    fn frame_layout_is_magic_version_lengths_seq() {
        let frame = HotlinkFrame {
            path: "p".to_string(),
            etag: "et".to_string(),
            seq: 7,
            payload: b"abc".to_vec(),
        };
        let raw = frame.encode();

        assert_eq!(&raw[0..4], b"HLNK");
        assert_eq!(raw[4], 1);
        assert_eq!(u16::from_be_bytes([raw[5], raw[6]]), 1); // path len
        assert_eq!(u16::from_be_bytes([raw[7], raw[8]]), 2); // etag len
        assert_eq!(u32::from_be_bytes([raw[9], raw[10], raw[11], raw[12]]), 3); // payload len
        assert_eq!(u64::from_be_bytes(raw[13..21].try_into().unwrap()), 7); // seq
        assert_eq!(&raw[21..22], b"p");
        assert_eq!(&raw[22..24], b"et");
        assert_eq!(&raw[24..27], b"abc");
    }

    #[tokio::test]
    async fn decoder_resynchronizes_past_leading_garbage() {
        let frame = HotlinkFrame {
            path: "a".to_string(),
            etag: "b".to_string(),
            seq: 3,
            payload: b"ok".to_vec(),
        };
        let mut wire = b"NOISE".to_vec();
        wire.extend_from_slice(&frame.encode());

        let mut reader = std::io::Cursor::new(wire);
        let decoded = HotlinkFrame::read_from(&mut reader).await.unwrap();
        assert_eq!(decoded.seq, 3);
        assert_eq!(decoded.payload, b"ok");
    }

    #[tokio::test]
    async fn frame_round_trips_over_ipc_socket() {
        let root = make_temp_dir("ipc");
        let marker = ipc_marker_path(&root, "alice@example.com", "demo", "endpoint");

        let listener = bind_ipc(&marker).await.unwrap();
        let dial = tokio::spawn({
            let marker = marker.clone();
            async move {
                let mut stream = dial_ipc(&marker, Duration::from_secs(5)).await.unwrap();
                stream
                    .write_frame(&HotlinkFrame {
                        path: "alice@example.com/app_data/demo/rpc/endpoint/x.request"
                            .to_string(),
                        etag: "5d41402abc4b2a76b9719d911017c592".to_string(),
                        seq: 1,
                        payload: b"hello".to_vec(),
                    })
                    .await
                    .unwrap();
            }
        });

        let mut conn = listener.accept(Duration::from_secs(5)).await.unwrap();
        let frame = conn.read_frame().await.unwrap();
        assert_eq!(frame.seq, 1);
        assert_eq!(frame.payload, b"hello");
        assert!(frame.path.ends_with(".request"));
        dial.await.unwrap();
    }

    #[tokio::test]
    async fn accept_marker_lands_in_the_endpoint_dir() {
        let root = make_temp_dir("accept");
        let accept = accept_marker_path(&root, "alice@example.com", "demo", "endpoint");
        touch_accept_marker(&accept).await.unwrap();
        assert!(accept.exists());
        assert_eq!(
            accept.parent().unwrap(),
            endpoint_dir(&root, "alice@example.com", "demo", "endpoint")
        );
    }
}
