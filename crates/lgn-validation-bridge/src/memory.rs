use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lgn_validation_messages::MessageStream;

use crate::{BridgeListener, ListenerRegistry};

/// Transfer counters, for inspection.
#[derive(Debug, Clone, Copy, Default)]
pub struct BridgeInfo {
    pub streams_committed: u64,
    pub bytes_committed: u64,
}

#[derive(Default)]
struct MemoryBridgeInner {
    storage: Vec<MessageStream>,
    listeners: ListenerRegistry,
}

/// Same-process bridge: producers append streams, `commit` drains them
/// into the registered listeners on the committing thread.
#[derive(Default)]
pub struct MemoryBridge {
    inner: Mutex<MemoryBridgeInner>,
    streams_committed: AtomicU64,
    bytes_committed: AtomicU64,
}

impl MemoryBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_ordered(&self, listener: Arc<dyn BridgeListener>) {
        self.inner.lock().unwrap().listeners.register_ordered(listener);
    }

    pub fn deregister_ordered(&self, listener: &Arc<dyn BridgeListener>) {
        self.inner
            .lock()
            .unwrap()
            .listeners
            .deregister_ordered(listener);
    }

    pub fn register(&self, message_id: u32, listener: Arc<dyn BridgeListener>) {
        self.inner
            .lock()
            .unwrap()
            .listeners
            .register(message_id, listener);
    }

    pub fn deregister(&self, message_id: u32, listener: &Arc<dyn BridgeListener>) {
        self.inner
            .lock()
            .unwrap()
            .listeners
            .deregister(message_id, listener);
    }

    /// Append a stream for the next commit.
    pub fn add_stream(&self, stream: MessageStream) {
        self.inner.lock().unwrap().storage.push(stream);
    }

    /// Append a stream and leave the source empty with its schema intact.
    pub fn add_stream_and_swap(&self, stream: &mut MessageStream) {
        if stream.is_empty() {
            return;
        }
        let swapped = stream.swap_out();
        self.add_stream(swapped);
    }

    /// Drain queued streams into the listeners.
    pub fn commit(&self) {
        // Drain under the lock, dispatch after: listeners may append.
        let streams = {
            let mut inner = self.inner.lock().unwrap();
            if inner.storage.is_empty() {
                return;
            }
            std::mem::take(&mut inner.storage)
        };

        for stream in &streams {
            self.streams_committed.fetch_add(1, Ordering::Relaxed);
            self.bytes_committed
                .fetch_add(stream.byte_size() as u64, Ordering::Relaxed);
        }

        // Snapshot the listener set so handlers can re-enter the bridge.
        let listeners = self.inner.lock().unwrap().listeners.clone();
        listeners.dispatch(&streams);
    }

    pub fn info(&self) -> BridgeInfo {
        BridgeInfo {
            streams_committed: self.streams_committed.load(Ordering::Relaxed),
            bytes_committed: self.bytes_committed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lgn_validation_messages::diagnostic::VersionBranchMessage;
    use lgn_validation_messages::Message;

    #[derive(Default)]
    struct Collect {
        heads: Mutex<Vec<u32>>,
    }

    impl BridgeListener for Collect {
        fn handle(&self, streams: &[MessageStream]) {
            let mut heads = self.heads.lock().unwrap();
            for stream in streams {
                for message in stream.decode_all::<VersionBranchMessage>().unwrap() {
                    heads.push(message.head);
                }
            }
        }
    }

    #[test]
    fn test_commit_drains_in_order() {
        let bridge = MemoryBridge::new();
        let listener = Arc::new(Collect::default());
        bridge.register(VersionBranchMessage::ID, listener.clone());

        for head in [3u32, 1, 2] {
            let mut stream = MessageStream::typed::<VersionBranchMessage>();
            stream.add(&VersionBranchMessage { head });
            bridge.add_stream(stream);
        }

        bridge.commit();
        assert_eq!(*listener.heads.lock().unwrap(), vec![3, 1, 2]);

        // Nothing left for a second commit.
        bridge.commit();
        assert_eq!(listener.heads.lock().unwrap().len(), 3);
        assert_eq!(bridge.info().streams_committed, 3);
    }

    #[test]
    fn test_add_stream_and_swap_resets_source() {
        let bridge = MemoryBridge::new();

        let mut stream = MessageStream::typed::<VersionBranchMessage>();
        stream.add(&VersionBranchMessage { head: 4 });
        bridge.add_stream_and_swap(&mut stream);

        assert!(stream.is_empty());
        assert_eq!(stream.schema().message_id, VersionBranchMessage::ID);

        // Empty sources are not enqueued.
        bridge.add_stream_and_swap(&mut stream);
        bridge.commit();
        assert_eq!(bridge.info().streams_committed, 1);
    }
}
