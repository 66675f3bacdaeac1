// Keyd IPC
// Fixed-frame request protocol and the layer-listener set

use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Payload capacity of one IPC frame.
pub const MAX_IPC_MESSAGE_SIZE: usize = 4096;

/// Upper bound on concurrently subscribed layer listeners.
pub const MAX_LISTENERS: usize = 32;

/// How long a broadcast write may stall on a slow listener before the
/// listener is dropped.
pub const LISTENER_SEND_TIMEOUT: Duration = Duration::from_millis(50);

const FRAME_SIZE: usize = 8 + MAX_IPC_MESSAGE_SIZE;

const TYPE_SUCCESS: u32 = 0;
const TYPE_FAIL: u32 = 1;
const TYPE_RELOAD: u32 = 2;
const TYPE_BIND: u32 = 3;
const TYPE_LAYER_LISTEN: u32 = 4;

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to create {0} (another instance already running?)")]
    AlreadyRunning(PathBuf),

    #[error("oversized payload ({0} bytes)")]
    Oversized(u32),

    #[error("unknown command type {0}")]
    UnknownType(u32),

    #[error("payload is not valid UTF-8")]
    Utf8,
}

/// A decoded client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Reload,
    Bind(String),
    LayerListen,
}

/// A decoded daemon reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Success(String),
    Fail(String),
}

fn encode_frame(msg_type: u32, data: &[u8]) -> [u8; FRAME_SIZE] {
    let mut frame = [0u8; FRAME_SIZE];
    frame[0..4].copy_from_slice(&msg_type.to_ne_bytes());
    frame[4..8].copy_from_slice(&(data.len() as u32).to_ne_bytes());
    frame[8..8 + data.len()].copy_from_slice(data);
    frame
}

fn read_frame(stream: &mut UnixStream) -> Result<(u32, Vec<u8>), IpcError> {
    let mut frame = [0u8; FRAME_SIZE];
    stream.read_exact(&mut frame)?;

    let msg_type = u32::from_ne_bytes([frame[0], frame[1], frame[2], frame[3]]);
    let sz = u32::from_ne_bytes([frame[4], frame[5], frame[6], frame[7]]);
    if sz as usize > MAX_IPC_MESSAGE_SIZE {
        return Err(IpcError::Oversized(sz));
    }

    Ok((msg_type, frame[8..8 + sz as usize].to_vec()))
}

/// Read one request frame from a freshly accepted connection.
pub fn read_request(stream: &mut UnixStream) -> Result<Request, IpcError> {
    let (msg_type, data) = read_frame(stream)?;
    match msg_type {
        TYPE_RELOAD => Ok(Request::Reload),
        TYPE_BIND => String::from_utf8(data)
            .map(Request::Bind)
            .map_err(|_| IpcError::Utf8),
        TYPE_LAYER_LISTEN => Ok(Request::LayerListen),
        other => Err(IpcError::UnknownType(other)),
    }
}

/// Write one request frame; used by clients and tests.
pub fn write_request(stream: &mut UnixStream, request: &Request) -> io::Result<()> {
    let frame = match request {
        Request::Reload => encode_frame(TYPE_RELOAD, b""),
        Request::Bind(expr) => {
            let data = expr.as_bytes();
            let len = data.len().min(MAX_IPC_MESSAGE_SIZE);
            encode_frame(TYPE_BIND, &data[..len])
        }
        Request::LayerListen => encode_frame(TYPE_LAYER_LISTEN, b""),
    };
    stream.write_all(&frame)
}

/// Read one reply frame; used by clients and tests.
pub fn read_reply(stream: &mut UnixStream) -> Result<Reply, IpcError> {
    let (msg_type, data) = read_frame(stream)?;
    let text = String::from_utf8(data).map_err(|_| IpcError::Utf8)?;
    match msg_type {
        TYPE_SUCCESS => Ok(Reply::Success(text)),
        TYPE_FAIL => Ok(Reply::Fail(text)),
        other => Err(IpcError::UnknownType(other)),
    }
}

/// Reply success and close the connection.
pub fn send_success(mut con: UnixStream) {
    let frame = encode_frame(TYPE_SUCCESS, b"Success");
    if let Err(e) = con.write_all(&frame) {
        log::warn!("failed to write IPC reply: {}", e);
    }
}

/// Reply failure with a diagnostic and close the connection.
pub fn send_fail(mut con: UnixStream, message: &str) {
    let data = message.as_bytes();
    let len = data.len().min(MAX_IPC_MESSAGE_SIZE);
    let frame = encode_frame(TYPE_FAIL, &data[..len]);
    if let Err(e) = con.write_all(&frame) {
        log::warn!("failed to write IPC reply: {}", e);
    }
}

/// The daemon's listening socket.
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Bind the socket, refusing to clobber a live instance. A stale
    /// socket file left by a crash is removed.
    pub fn create(path: &Path) -> Result<Self, IpcError> {
        if UnixStream::connect(path).is_ok() {
            return Err(IpcError::AlreadyRunning(path.to_path_buf()));
        }
        let _ = std::fs::remove_file(path);

        let listener = UnixListener::bind(path)
            .map_err(|_| IpcError::AlreadyRunning(path.to_path_buf()))?;

        // The daemon runs as root; let user sessions reach the socket.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666));
        }

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn accept(&self) -> io::Result<UnixStream> {
        let (stream, _) = self.listener.accept()?;
        Ok(stream)
    }
}

impl AsRawFd for IpcServer {
    fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Connections subscribed to layer notifications.
///
/// Bounded at [`MAX_LISTENERS`]; members that cannot take a full line
/// within the send timeout are dropped during the broadcast that failed.
pub struct ListenerSet {
    listeners: Vec<UnixStream>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Promote a connection to a layer listener. A full set rejects the
    /// newcomer with a human-readable line and closes it.
    pub fn add(&mut self, mut con: UnixStream) {
        if self.listeners.len() == MAX_LISTENERS {
            let _ = con.write_all(b"Max listeners exceeded\n");
            return;
        }

        if let Err(e) = con.set_write_timeout(Some(LISTENER_SEND_TIMEOUT)) {
            log::warn!("failed to set listener send timeout: {}", e);
        }
        self.listeners.push(con);
    }

    /// Send `+name` or `-name` to every listener, evicting any that
    /// cannot take the whole line.
    pub fn broadcast(&mut self, name: &str, active: bool) {
        if self.listeners.is_empty() {
            return;
        }

        let line = format!("{}{}\n", if active { '+' } else { '-' }, name);
        self.listeners
            .retain_mut(|l| matches!(l.write(line.as_bytes()), Ok(n) if n == line.len()));
    }
}

impl Default for ListenerSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_request_round_trip() {
        let (mut a, mut b) = UnixStream::pair().expect("pair");

        write_request(&mut a, &Request::Bind("a = b".to_string())).expect("write");
        assert_eq!(
            read_request(&mut b).expect("read"),
            Request::Bind("a = b".to_string())
        );

        write_request(&mut a, &Request::Reload).expect("write");
        assert_eq!(read_request(&mut b).expect("read"), Request::Reload);

        write_request(&mut a, &Request::LayerListen).expect("write");
        assert_eq!(read_request(&mut b).expect("read"), Request::LayerListen);
    }

    #[test]
    fn test_reply_round_trip() {
        let (mut a, mut b) = UnixStream::pair().expect("pair");

        send_success(a.try_clone().expect("clone"));
        assert_eq!(
            read_reply(&mut b).expect("read"),
            Reply::Success("Success".to_string())
        );

        send_fail(a.try_clone().expect("clone"), "no such layer");
        assert_eq!(
            read_reply(&mut b).expect("read"),
            Reply::Fail("no such layer".to_string())
        );
    }

    #[test]
    fn test_unknown_type_rejected() {
        let (mut a, mut b) = UnixStream::pair().expect("pair");
        let frame = encode_frame(99, b"");
        a.write_all(&frame).expect("write");
        assert!(matches!(
            read_request(&mut b),
            Err(IpcError::UnknownType(99))
        ));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let (mut a, mut b) = UnixStream::pair().expect("pair");
        let mut frame = encode_frame(TYPE_BIND, b"");
        frame[4..8].copy_from_slice(&(MAX_IPC_MESSAGE_SIZE as u32 + 1).to_ne_bytes());
        a.write_all(&frame).expect("write");
        assert!(matches!(read_request(&mut b), Err(IpcError::Oversized(_))));
    }

    #[test]
    fn test_listener_cap_rejects_33rd() {
        let mut set = ListenerSet::new();
        let mut peers = Vec::new();
        for _ in 0..MAX_LISTENERS {
            let (ours, theirs) = UnixStream::pair().expect("pair");
            set.add(ours);
            peers.push(theirs);
        }
        assert_eq!(set.len(), MAX_LISTENERS);

        let (ours, mut theirs) = UnixStream::pair().expect("pair");
        set.add(ours);
        assert_eq!(set.len(), MAX_LISTENERS);

        // The rejected connection sees the diagnostic line, then EOF.
        let mut rejection = String::new();
        theirs
            .read_to_string(&mut rejection)
            .expect("read rejection");
        assert_eq!(rejection, "Max listeners exceeded\n");

        // The original members are untouched.
        set.broadcast("nav", true);
        assert_eq!(set.len(), MAX_LISTENERS);
        let mut buf = [0u8; 5];
        peers[0].read_exact(&mut buf).expect("read broadcast");
        assert_eq!(&buf, b"+nav\n");
    }

    #[test]
    fn test_broadcast_evicts_dead_listener() {
        let mut set = ListenerSet::new();

        let (dead, dead_peer) = UnixStream::pair().expect("pair");
        let (live, mut live_peer) = UnixStream::pair().expect("pair");
        set.add(dead);
        set.add(live);
        drop(dead_peer); // writes now fail with EPIPE

        set.broadcast("nav", true);
        assert_eq!(set.len(), 1);

        let mut buf = [0u8; 5];
        live_peer.read_exact(&mut buf).expect("read");
        assert_eq!(&buf, b"+nav\n");

        set.broadcast("nav", false);
        let mut buf = [0u8; 5];
        live_peer.read_exact(&mut buf).expect("read");
        assert_eq!(&buf, b"-nav\n");
    }
}
