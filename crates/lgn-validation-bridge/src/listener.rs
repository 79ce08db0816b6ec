use std::collections::HashMap;
use std::sync::Arc;

use lgn_validation_messages::{MessageSchemaKind, MessageStream};

/// A bridge message sink. Listeners must tolerate being invoked from the
/// bridge's commit thread.
pub trait BridgeListener: Send + Sync {
    fn handle(&self, streams: &[MessageStream]);
}

/// Listener bookkeeping shared by the bridge variants: ordered listeners
/// observe every committed batch in order, specialized listeners only the
/// typed streams of their id.
#[derive(Default, Clone)]
pub struct ListenerRegistry {
    ordered: Vec<Arc<dyn BridgeListener>>,
    by_id: HashMap<u32, Vec<Arc<dyn BridgeListener>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_ordered(&mut self, listener: Arc<dyn BridgeListener>) {
        self.ordered.push(listener);
    }

    pub fn deregister_ordered(&mut self, listener: &Arc<dyn BridgeListener>) {
        self.ordered.retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn register(&mut self, message_id: u32, listener: Arc<dyn BridgeListener>) {
        self.by_id.entry(message_id).or_default().push(listener);
    }

    pub fn deregister(&mut self, message_id: u32, listener: &Arc<dyn BridgeListener>) {
        if let Some(listeners) = self.by_id.get_mut(&message_id) {
            listeners.retain(|l| !Arc::ptr_eq(l, listener));
        }
    }

    /// Dispatch one committed batch: the whole batch to ordered listeners
    /// first, then each typed stream to its specialized listeners.
    pub fn dispatch(&self, streams: &[MessageStream]) {
        for listener in &self.ordered {
            listener.handle(streams);
        }

        for stream in streams {
            if stream.schema().kind != MessageSchemaKind::Typed {
                continue;
            }

            if let Some(listeners) = self.by_id.get(&stream.schema().message_id) {
                for listener in listeners {
                    listener.handle(std::slice::from_ref(stream));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lgn_validation_messages::diagnostic::VersionBranchMessage;
    use lgn_validation_messages::Message;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        batches: Mutex<Vec<usize>>,
    }

    impl BridgeListener for Recorder {
        fn handle(&self, streams: &[MessageStream]) {
            self.batches.lock().unwrap().push(streams.len());
        }
    }

    #[test]
    fn test_ordered_sees_batch_specialized_sees_stream() {
        let mut registry = ListenerRegistry::new();

        let ordered = Arc::new(Recorder::default());
        let specialized = Arc::new(Recorder::default());
        registry.register_ordered(ordered.clone());
        registry.register(VersionBranchMessage::ID, specialized.clone());

        let mut typed = MessageStream::typed::<VersionBranchMessage>();
        typed.add(&VersionBranchMessage { head: 1 });
        let other = MessageStream::ordered();

        registry.dispatch(&[typed, other]);

        assert_eq!(*ordered.batches.lock().unwrap(), vec![2]);
        assert_eq!(*specialized.batches.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_deregister_stops_delivery() {
        let mut registry = ListenerRegistry::new();

        let listener = Arc::new(Recorder::default());
        let as_dyn: Arc<dyn BridgeListener> = listener.clone();
        registry.register_ordered(as_dyn.clone());
        registry.deregister_ordered(&as_dyn);

        registry.dispatch(&[MessageStream::ordered()]);
        assert!(listener.batches.lock().unwrap().is_empty());
    }
}
