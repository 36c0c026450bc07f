//! TCP front end
//!
//! Accepts connections, frames the byte stream into complete control
//! packets using the fixed header's remaining length, and feeds each packet
//! to the dispatcher. Writes go through a per-connection channel drained by
//! a writer task, so replies and fan-out never block dispatch.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broker::{Dispatcher, Transport};
use crate::codec::PacketReader;
use crate::protocol::{ControlPacketType, DecodeError};

enum WriterCommand {
    Send(Bytes),
    Close,
}

/// Registry of live connections; the dispatcher's [`Transport`].
#[derive(Default)]
pub struct ConnectionTable {
    peers: DashMap<u64, mpsc::UnboundedSender<WriterCommand>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl Transport for ConnectionTable {
    fn send(&self, connection_id: u64, bytes: Bytes) {
        if let Some(tx) = self.peers.get(&connection_id) {
            let _ = tx.send(WriterCommand::Send(bytes));
        }
    }

    fn close(&self, connection_id: u64) {
        if let Some((_, tx)) = self.peers.remove(&connection_id) {
            let _ = tx.send(WriterCommand::Close);
        }
    }
}

/// Total length of the frame at the head of `buf`, if its fixed header is
/// complete. `Ok(None)` means more bytes are needed.
fn frame_len(buf: &[u8]) -> Result<Option<usize>, DecodeError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let mut reader = PacketReader::new(buf);
    let _ = reader.pop_u8()?;
    match reader.pop_var_int() {
        Ok(remaining) => {
            let header = buf.len() - reader.remaining_len();
            Ok(Some(header + remaining as usize))
        }
        Err(DecodeError::Truncated) => Ok(None),
        Err(e) => Err(e),
    }
}

/// TCP listener feeding the dispatcher.
pub struct Server {
    bind: SocketAddr,
    max_packet_size: usize,
    connections: Arc<ConnectionTable>,
    dispatcher: Arc<Dispatcher>,
    next_id: AtomicU64,
}

impl Server {
    pub fn new(
        bind: SocketAddr,
        max_packet_size: usize,
        connections: Arc<ConnectionTable>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            bind,
            max_packet_size,
            connections,
            dispatcher,
            next_id: AtomicU64::new(1),
        }
    }

    /// Accept loop; runs until the process is stopped.
    pub async fn run(self: Arc<Self>) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.bind).await?;
        info!("listening on {}", self.bind);

        loop {
            let (stream, addr) = listener.accept().await?;
            let connection_id = self.next_id.fetch_add(1, Ordering::Relaxed);
            debug!(connection_id, %addr, "connection accepted");

            let server = self.clone();
            tokio::spawn(async move {
                server.handle_connection(connection_id, stream).await;
                debug!(connection_id, "connection finished");
            });
        }
    }

    async fn handle_connection(&self, connection_id: u64, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(connection_id, error = %e, "set_nodelay failed");
        }
        let (mut read_half, mut write_half) = stream.into_split();

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.connections.peers.insert(connection_id, tx);

        let writer = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    WriterCommand::Send(bytes) => {
                        if write_half.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    WriterCommand::Close => break,
                }
            }
            let _ = write_half.shutdown().await;
        });

        let mut read_buf = BytesMut::with_capacity(4096);
        let mut disconnected = false;
        loop {
            if !self.drain_frames(connection_id, &mut read_buf, &mut disconnected) {
                break;
            }

            match read_half.read_buf(&mut read_buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(connection_id, error = %e, "read failed");
                    break;
                }
            }
        }

        self.connections.close(connection_id);
        let _ = writer.await;

        // Mirror a client DISCONNECT so the task layer can clean up, unless
        // the client already sent one.
        if !disconnected {
            self.dispatcher.on_receive(connection_id, &[0xE0, 0x00]);
        }
    }

    /// Dispatch every complete packet at the front of `read_buf`, in receipt
    /// order. Returns `false` once the connection is closed, whether by the
    /// dispatcher or by the framing checks here; frames pipelined behind the
    /// offending packet are dropped, never dispatched.
    ///
    /// `disconnected` is set once a client DISCONNECT passes through, so the
    /// teardown path knows not to synthesize a second one.
    fn drain_frames(
        &self,
        connection_id: u64,
        read_buf: &mut BytesMut,
        disconnected: &mut bool,
    ) -> bool {
        loop {
            if !self.connections.peers.contains_key(&connection_id) {
                return false;
            }

            match frame_len(read_buf) {
                Ok(Some(total)) if total > self.max_packet_size => {
                    warn!(connection_id, size = total, "packet exceeds size limit");
                    self.connections.close(connection_id);
                    return false;
                }
                Ok(Some(total)) if read_buf.len() >= total => {
                    let frame = read_buf.split_to(total).freeze();
                    if frame[0] >> 4 == ControlPacketType::Disconnect as u8 {
                        *disconnected = true;
                    }
                    self.dispatcher.on_receive(connection_id, &frame);
                }
                Ok(_) => return true,
                Err(e) => {
                    debug!(connection_id, error = %e, "unframeable stream");
                    self.connections.close(connection_id);
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use bytes::BufMut;
    use pretty_assertions::assert_eq;

    use crate::broker::{Task, WorkSubmission};
    use crate::codec::{write_string, write_var_int, DEFAULT_MAX_PACKET_SIZE};
    use crate::session::{MemorySessionCache, SessionCache};

    #[derive(Default)]
    struct RecordingWork {
        tasks: Mutex<Vec<Task>>,
    }

    impl RecordingWork {
        fn tasks(&self) -> Vec<Task> {
            self.tasks.lock().unwrap().clone()
        }
    }

    impl WorkSubmission for RecordingWork {
        fn submit(&self, task: Task) {
            self.tasks.lock().unwrap().push(task);
        }
    }

    struct Harness {
        server: Server,
        cache: Arc<MemorySessionCache>,
        work: Arc<RecordingWork>,
        // Keeps the writer channel alive for the registered connection.
        _rx: mpsc::UnboundedReceiver<WriterCommand>,
    }

    fn harness(connection_id: u64, max_packet_size: usize) -> Harness {
        let cache = Arc::new(MemorySessionCache::new());
        let connections = Arc::new(ConnectionTable::new());
        let work = Arc::new(RecordingWork::default());
        let dispatcher = Arc::new(Dispatcher::new(
            cache.clone(),
            connections.clone(),
            work.clone(),
        ));

        let (tx, rx) = mpsc::unbounded_channel();
        connections.peers.insert(connection_id, tx);

        let server = Server::new(
            "127.0.0.1:0".parse().unwrap(),
            max_packet_size,
            connections,
            dispatcher,
        );
        Harness {
            server,
            cache,
            work,
            _rx: rx,
        }
    }

    fn connect_frame(client_id: &str) -> BytesMut {
        let mut body = BytesMut::new();
        write_string(&mut body, "MQTT");
        body.put_u8(4);
        body.put_u8(0x02);
        body.put_u16(60);
        write_string(&mut body, client_id);

        let mut buf = BytesMut::new();
        buf.put_u8(0x10);
        write_var_int(&mut buf, body.len() as u32);
        buf.put_slice(&body);
        buf
    }

    #[test]
    fn frames_behind_a_malformed_packet_are_not_dispatched() {
        let h = harness(7, DEFAULT_MAX_PACKET_SIZE);

        // SUBSCRIBE with a zero flags nibble closes the connection; the
        // CONNECT pipelined behind it in the same read must be dropped.
        let mut buf = BytesMut::new();
        buf.put_slice(&[0x80, 0x02, 0x00, 0x01]);
        buf.put_slice(&connect_frame("pipelined-client"));

        let mut disconnected = false;
        let open = h.server.drain_frames(7, &mut buf, &mut disconnected);

        assert!(!open);
        assert!(!h.server.connections.peers.contains_key(&7));
        assert_eq!(h.cache.get("pipelined-client"), None);
        assert!(h.work.tasks().is_empty());
    }

    #[test]
    fn oversize_packet_closes_without_dispatching_followers() {
        let h = harness(7, 16);

        // Declared 64-byte PUBLISH over a 16-byte limit, then a PINGREQ.
        let mut buf = BytesMut::new();
        buf.put_slice(&[0x30, 0x40]);
        buf.put_slice(&[0u8; 0x40]);
        buf.put_slice(&[0xC0, 0x00]);

        let mut disconnected = false;
        let open = h.server.drain_frames(7, &mut buf, &mut disconnected);

        assert!(!open);
        assert!(!h.server.connections.peers.contains_key(&7));
        assert!(h.work.tasks().is_empty());
    }

    #[test]
    fn drain_continues_while_connection_stays_open() {
        let h = harness(7, DEFAULT_MAX_PACKET_SIZE);

        let mut buf = connect_frame("client-1");
        buf.put_slice(&[0xC0, 0x00]);
        // Trailing partial fixed header stays buffered for the next read.
        buf.put_slice(&[0x30]);

        let mut disconnected = false;
        let open = h.server.drain_frames(7, &mut buf, &mut disconnected);

        assert!(open);
        assert!(!disconnected);
        assert_eq!(buf.as_ref(), &[0x30]);
        assert!(h.cache.get("client-1").is_some());
    }

    #[test]
    fn client_disconnect_is_marked_once_seen() {
        let h = harness(7, DEFAULT_MAX_PACKET_SIZE);

        // The mark survives frames dispatched after the DISCONNECT.
        let mut buf = BytesMut::new();
        buf.put_slice(&[0xE0, 0x00]);
        buf.put_slice(&[0xC0, 0x00]);

        let mut disconnected = false;
        let open = h.server.drain_frames(7, &mut buf, &mut disconnected);

        assert!(open);
        assert!(disconnected);
        // Exactly one close task for the real DISCONNECT.
        let closes: Vec<_> = h
            .work
            .tasks()
            .into_iter()
            .filter(|t| t.action == "close")
            .collect();
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].param, "7");
    }

    #[test]
    fn frame_len_waits_for_fixed_header() {
        assert_eq!(frame_len(&[]), Ok(None));
        assert_eq!(frame_len(&[0x30]), Ok(None));
    }

    #[test]
    fn frame_len_single_byte_length() {
        // PINGREQ: 2-byte frame.
        assert_eq!(frame_len(&[0xC0, 0x00]), Ok(Some(2)));
        // PUBLISH header declaring 4 body bytes.
        assert_eq!(frame_len(&[0x30, 0x04, 0x00]), Ok(Some(6)));
    }

    #[test]
    fn frame_len_multi_byte_length() {
        // Remaining length 321 = 0xC1 0x02.
        assert_eq!(frame_len(&[0x30, 0xC1, 0x02]), Ok(Some(3 + 321)));
    }

    #[test]
    fn frame_len_incomplete_var_int() {
        assert_eq!(frame_len(&[0x30, 0x80]), Ok(None));
    }

    #[test]
    fn frame_len_rejects_overlong_var_int() {
        assert_eq!(
            frame_len(&[0x30, 0x80, 0x80, 0x80, 0x80, 0x01]),
            Err(DecodeError::Malformed("remaining length exceeds 4 bytes"))
        );
    }
}
