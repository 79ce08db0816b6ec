//! TCP client bridge towards the inspector.
//!
//! The reader accumulates bytes until a whole frame is buffered, then
//! feeds the stream into the in-process memory bridge; the writer
//! serializes committed streams. Both run on the bridge's own runtime, so
//! application threads never block on the network.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Buf, BytesMut};
use lgn_validation_messages::discovery::{ClientRequestMessage, DiscoveryRequestMessage};
use lgn_validation_messages::MessageStream;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::Notify;

use crate::{protocol, BridgeInfo, BridgeListener, MemoryBridge, Result, TransportError};

/// Endpoint the client resolves against.
#[derive(Debug, Clone)]
pub struct EndpointResolve {
    pub address: String,
    pub port: u16,
}

struct Connection {
    sender: mpsc::UnboundedSender<Vec<u8>>,
    cancel: Arc<Notify>,
    reader: tokio::task::JoinHandle<()>,
    writer: tokio::task::JoinHandle<()>,
}

/// Cross-process client bridge.
pub struct RemoteClientBridge {
    runtime: tokio::runtime::Runtime,
    memory: Arc<MemoryBridge>,
    outbound: Mutex<Vec<MessageStream>>,
    connection: Mutex<Option<Connection>>,
    commit_on_append: AtomicBool,
    bytes_read: Arc<AtomicU64>,
    bytes_written: AtomicU64,
}

impl RemoteClientBridge {
    /// # Errors
    ///
    /// Fails when the IO runtime cannot be created.
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("lgn-bridge-io")
            .enable_all()
            .build()?;

        Ok(Self {
            runtime,
            memory: Arc::new(MemoryBridge::new()),
            outbound: Mutex::new(Vec::new()),
            connection: Mutex::new(None),
            commit_on_append: AtomicBool::new(true),
            bytes_read: Arc::new(AtomicU64::new(0)),
            bytes_written: AtomicU64::new(0),
        })
    }

    /// Inbound streams surface through the memory bridge and its
    /// listeners.
    pub fn register(&self, message_id: u32, listener: Arc<dyn BridgeListener>) {
        self.memory.register(message_id, listener);
    }

    pub fn deregister(&self, message_id: u32, listener: &Arc<dyn BridgeListener>) {
        self.memory.deregister(message_id, listener);
    }

    pub fn register_ordered(&self, listener: Arc<dyn BridgeListener>) {
        self.memory.register_ordered(listener);
    }

    pub fn deregister_ordered(&self, listener: &Arc<dyn BridgeListener>) {
        self.memory.deregister_ordered(listener);
    }

    /// Whether inbound frames dispatch immediately instead of waiting for
    /// the next commit.
    pub fn set_commit_on_append(&self, enabled: bool) {
        self.commit_on_append.store(enabled, Ordering::Relaxed);
    }

    /// Connect to the inspector endpoint.
    ///
    /// # Errors
    ///
    /// Propagates resolution and connection failures.
    pub fn connect(&self, resolve: &EndpointResolve) -> Result<()> {
        let stream = self
            .runtime
            .block_on(TcpStream::connect((resolve.address.as_str(), resolve.port)))?;
        stream.set_nodelay(true)?;

        let (mut read_half, mut write_half) = stream.into_split();

        let cancel = Arc::new(Notify::new());
        let (sender, mut receiver) = mpsc::unbounded_channel::<Vec<u8>>();

        let reader = {
            let memory = Arc::clone(&self.memory);
            let cancel = Arc::clone(&cancel);
            let bytes_read = Arc::clone(&self.bytes_read);
            let commit_on_append = self.commit_on_append.load(Ordering::Relaxed);

            self.runtime.spawn(async move {
                let mut buffer = BytesMut::with_capacity(64 * 1024);

                loop {
                    tokio::select! {
                        _ = cancel.notified() => break,
                        read = read_half.read_buf(&mut buffer) => {
                            match read {
                                Ok(0) => break,
                                Ok(count) => {
                                    bytes_read.fetch_add(count as u64, Ordering::Relaxed);
                                    if !drain_frames(&mut buffer, &memory, commit_on_append) {
                                        break;
                                    }
                                }
                                Err(error) => {
                                    log::warn!("bridge read failed: {}", error);
                                    break;
                                }
                            }
                        }
                    }
                }
            })
        };

        let writer = {
            let cancel = Arc::clone(&cancel);
            self.runtime.spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.notified() => break,
                        frame = receiver.recv() => {
                            let Some(frame) = frame else { break };
                            if let Err(error) = write_half.write_all(&frame).await {
                                log::warn!("bridge write failed: {}", error);
                                break;
                            }
                        }
                    }
                }
            })
        };

        *self.connection.lock().unwrap() = Some(Connection {
            sender,
            cancel,
            reader,
            writer,
        });

        log::info!("bridge connected to {}:{}", resolve.address, resolve.port);
        Ok(())
    }

    /// Ask the resolver for its host-info entries; the reply surfaces as a
    /// `HostDiscoveryMessage` stream.
    ///
    /// # Errors
    ///
    /// Fails when not connected.
    pub fn discover(&self) -> Result<()> {
        let mut stream = MessageStream::typed::<DiscoveryRequestMessage>();
        stream.add(&DiscoveryRequestMessage {});
        self.send_now(&stream)
    }

    /// Request attachment to the host behind `token`; the answer surfaces
    /// as a `HostConnectedMessage`.
    ///
    /// # Errors
    ///
    /// Fails when not connected.
    pub fn request_client(&self, token: &str) -> Result<()> {
        let mut stream = MessageStream::typed::<ClientRequestMessage>();
        stream.add(&ClientRequestMessage {
            token: token.to_string(),
        });
        self.send_now(&stream)
    }

    /// Stage an outbound stream for the next commit.
    pub fn add_stream(&self, stream: MessageStream) {
        self.outbound.lock().unwrap().push(stream);
    }

    /// Send staged streams and dispatch queued inbound ones.
    ///
    /// # Errors
    ///
    /// Fails when not connected; the staged streams stay queued.
    pub fn commit(&self) -> Result<()> {
        let staged = std::mem::take(&mut *self.outbound.lock().unwrap());

        if !staged.is_empty() {
            let connection = self.connection.lock().unwrap();
            let Some(connection) = connection.as_ref() else {
                // Keep the streams, in order, for a later reconnect.
                let mut outbound = self.outbound.lock().unwrap();
                let mut restored = staged;
                restored.extend(outbound.drain(..));
                *outbound = restored;
                return Err(TransportError::NotConnected);
            };

            for stream in &staged {
                let frame = protocol::encode_frame(stream);
                self.bytes_written
                    .fetch_add(frame.len() as u64, Ordering::Relaxed);
                connection
                    .sender
                    .send(frame)
                    .map_err(|_| TransportError::NotConnected)?;
            }
        }

        self.memory.commit();
        Ok(())
    }

    /// Abort in-flight operations, leaving the socket to `stop`.
    pub fn cancel(&self) {
        if let Some(connection) = self.connection.lock().unwrap().as_ref() {
            connection.cancel.notify_waiters();
        }
    }

    /// Abort and close the connection.
    pub fn stop(&self) {
        if let Some(connection) = self.connection.lock().unwrap().take() {
            connection.cancel.notify_waiters();
            connection.reader.abort();
            connection.writer.abort();
        }
    }

    pub fn info(&self) -> BridgeInfo {
        let inbound = self.memory.info();
        BridgeInfo {
            streams_committed: inbound.streams_committed,
            bytes_committed: inbound.bytes_committed
                + self.bytes_written.load(Ordering::Relaxed)
                + self.bytes_read.load(Ordering::Relaxed),
        }
    }

    fn send_now(&self, stream: &MessageStream) -> Result<()> {
        let connection = self.connection.lock().unwrap();
        let connection = connection.as_ref().ok_or(TransportError::NotConnected)?;

        let frame = protocol::encode_frame(stream);
        self.bytes_written
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        connection
            .sender
            .send(frame)
            .map_err(|_| TransportError::NotConnected)
    }
}

impl Drop for RemoteClientBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Pull every buffered frame into the memory bridge. Returns false when
/// the connection must abort (framing violation).
fn drain_frames(buffer: &mut BytesMut, memory: &MemoryBridge, commit_on_append: bool) -> bool {
    loop {
        match protocol::try_decode_frame(&buffer[..]) {
            Ok(Some((stream, consumed))) => {
                buffer.advance(consumed);
                memory.add_stream(stream);
                if commit_on_append {
                    memory.commit();
                }
            }
            Ok(None) => return true,
            Err(error) => {
                log::error!("bridge aborting connection: {}", error);
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lgn_validation_messages::discovery::{
        HostConnectedMessage, HostDiscoveryMessage, HostServerInfoMessage,
    };
    use lgn_validation_messages::Message;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::time::{Duration, Instant};

    fn read_frame(socket: &mut std::net::TcpStream) -> MessageStream {
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let count = socket.read(&mut chunk).unwrap();
            assert!(count > 0, "peer closed before a full frame");
            buffer.extend_from_slice(&chunk[..count]);
            if let Some((stream, _)) = protocol::try_decode_frame(&buffer).unwrap() {
                return stream;
            }
        }
    }

    fn wait_until(mut probe: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !probe() {
            assert!(Instant::now() < deadline, "condition never held");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[derive(Default)]
    struct Inbox {
        streams: Mutex<Vec<MessageStream>>,
    }

    impl BridgeListener for Inbox {
        fn handle(&self, streams: &[MessageStream]) {
            self.streams.lock().unwrap().extend_from_slice(streams);
        }
    }

    #[test]
    fn test_discovery_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();

            // Expect the discovery request, answer with one entry.
            let request = read_frame(&mut socket);
            assert_eq!(request.schema().message_id, DiscoveryRequestMessage::ID);

            let mut reply = MessageStream::typed::<HostDiscoveryMessage>();
            reply.add(&HostDiscoveryMessage {
                infos: vec![HostServerInfoMessage {
                    guid: "token-1".to_string(),
                    reserved_guid: String::new(),
                    process: "game.exe".to_string(),
                    application: "Game".to_string(),
                    api: "vulkan".to_string(),
                    process_id: 77,
                    device_uid: 1,
                    device_objects: 1,
                }],
            });
            socket.write_all(&protocol::encode_frame(&reply)).unwrap();

            // Expect the client request for that token, accept it.
            let request = read_frame(&mut socket);
            let decoded = request.decode_all::<ClientRequestMessage>().unwrap();
            assert_eq!(decoded[0].token, "token-1");

            let mut accepted = MessageStream::typed::<HostConnectedMessage>();
            accepted.add(&HostConnectedMessage { accepted: true });
            socket.write_all(&protocol::encode_frame(&accepted)).unwrap();
        });

        let bridge = RemoteClientBridge::new().unwrap();
        let discovered = Arc::new(Inbox::default());
        let connected = Arc::new(Inbox::default());
        bridge.register(HostDiscoveryMessage::ID, discovered.clone());
        bridge.register(HostConnectedMessage::ID, connected.clone());

        bridge
            .connect(&EndpointResolve {
                address: "127.0.0.1".to_string(),
                port,
            })
            .unwrap();

        bridge.discover().unwrap();
        wait_until(|| !discovered.streams.lock().unwrap().is_empty());

        let infos = discovered.streams.lock().unwrap()[0]
            .decode_all::<HostDiscoveryMessage>()
            .unwrap();
        assert_eq!(infos[0].infos[0].guid, "token-1");

        bridge.request_client("token-1").unwrap();
        wait_until(|| !connected.streams.lock().unwrap().is_empty());

        let accepted = connected.streams.lock().unwrap()[0]
            .decode_all::<HostConnectedMessage>()
            .unwrap();
        assert!(accepted[0].accepted);

        bridge.stop();
        server.join().unwrap();
    }

    #[test]
    fn test_commit_frames_staged_streams() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let stream = read_frame(&mut socket);
            let decoded = stream
                .decode_all::<lgn_validation_messages::diagnostic::VersionBranchMessage>()
                .unwrap();
            assert_eq!(decoded[0].head, 9);
        });

        let bridge = RemoteClientBridge::new().unwrap();
        bridge
            .connect(&EndpointResolve {
                address: "127.0.0.1".to_string(),
                port,
            })
            .unwrap();

        let mut stream = MessageStream::typed::<
            lgn_validation_messages::diagnostic::VersionBranchMessage,
        >();
        stream.add(&lgn_validation_messages::diagnostic::VersionBranchMessage { head: 9 });
        bridge.add_stream(stream);
        bridge.commit().unwrap();

        server.join().unwrap();
        bridge.stop();
    }

    #[test]
    fn test_commit_without_connection_fails() {
        let bridge = RemoteClientBridge::new().unwrap();
        bridge.add_stream(MessageStream::ordered());

        // Ordered empty stream still counts as staged.
        assert!(matches!(
            bridge.commit(),
            Err(TransportError::NotConnected)
        ));
    }

    #[test]
    fn test_framing_violation_aborts_reader() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            socket.write_all(&[0xFFu8; 64]).unwrap();
        });

        let bridge = RemoteClientBridge::new().unwrap();
        let inbox = Arc::new(Inbox::default());
        bridge.register_ordered(inbox.clone());

        bridge
            .connect(&EndpointResolve {
                address: "127.0.0.1".to_string(),
                port,
            })
            .unwrap();

        server.join().unwrap();
        std::thread::sleep(Duration::from_millis(100));

        assert!(inbox.streams.lock().unwrap().is_empty());
        bridge.stop();
    }
}
