use std::sync::{Arc, Mutex};

use lgn_validation_bridge::MemoryBridge;
use lgn_validation_messages::diagnostic::{
    ResourceVersionMessage, VersionBranchMessage, VersionCollapseMessage,
    VersionSummarizationMessage,
};
use lgn_validation_messages::MessageStream;

/// Resource facts narrated to the inspector.
#[derive(Debug, Clone)]
pub struct ResourceVersionInfo {
    pub puid: u32,
    pub name: Option<String>,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub format: String,
}

/// A point in the version timeline. `segmented` records whether a branch
/// was actually emitted; collapse is skipped otherwise.
#[derive(Debug, Clone, Copy)]
pub struct VersionSegmentationPoint {
    pub id: u32,
    pub segmented: bool,
}

struct VersioningInner {
    head: u32,
    pending_commit: bool,
    /// Ordered branch/collapse/summarization events.
    stream: MessageStream,
    /// Resource version payloads; ordering against `stream` is guaranteed
    /// by flushing both together.
    resource_stream: MessageStream,
}

/// Emits ordered resource create/destroy/rename events so the inspector
/// can reconstruct resource lifetimes: a message referencing a puid at
/// version `N` happens-after the corresponding `resource-created, v=N`.
pub struct VersioningController {
    bridge: Arc<MemoryBridge>,
    inner: Mutex<VersioningInner>,
}

impl VersioningController {
    pub fn new(bridge: Arc<MemoryBridge>) -> Self {
        Self {
            bridge,
            inner: Mutex::new(VersioningInner {
                head: 0,
                pending_commit: false,
                stream: MessageStream::ordered(),
                resource_stream: MessageStream::typed::<ResourceVersionMessage>(),
            }),
        }
    }

    /// Record a resource creation or recommit at the current head.
    pub fn create_or_recommit(&self, info: &ResourceVersionInfo) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending_commit = true;

        let head = inner.head;
        push_version(&mut inner.resource_stream, info, head);
    }

    /// Record a destruction; the version sentinel marks the entry dead.
    pub fn destroy(&self, puid: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending_commit = true;

        inner.resource_stream.add(&ResourceVersionMessage {
            puid,
            version: ResourceVersionMessage::VERSION_DESTROYED,
            name: String::new(),
            width: 0,
            height: 0,
            depth: 0,
            format: String::new(),
        });
    }

    /// Answer a summarization request with the full live set.
    pub fn summarize(&self, resources: &[ResourceVersionInfo]) {
        let mut inner = self.inner.lock().unwrap();
        let head = inner.head;

        inner
            .stream
            .add_ordered(&VersionSummarizationMessage { head });

        for info in resources {
            push_version(&mut inner.resource_stream, info, head);
        }
    }

    /// Open a new version branch if resource state changed since the last
    /// one. Ordering between the flushed streams and subsequent messages
    /// is what lets the inspector anchor references to versions.
    pub fn branch_on_segmentation_point(&self) -> VersionSegmentationPoint {
        let mut inner = self.inner.lock().unwrap();

        if !inner.pending_commit {
            return VersionSegmentationPoint {
                id: inner.head,
                segmented: false,
            };
        }

        self.flush(&mut inner);

        inner.head += 1;
        let head = inner.head;
        inner.stream.add_ordered(&VersionBranchMessage { head });
        inner.pending_commit = false;

        VersionSegmentationPoint {
            id: head - 1,
            segmented: true,
        }
    }

    /// Collapse a previously segmented branch.
    pub fn collapse_on_fork(&self, point: VersionSegmentationPoint) {
        if !point.segmented {
            return;
        }

        let mut inner = self.inner.lock().unwrap();
        inner
            .stream
            .add_ordered(&VersionCollapseMessage { head: point.id });
    }

    pub fn head(&self) -> u32 {
        self.inner.lock().unwrap().head
    }

    /// Flush accumulated events to the bridge.
    pub fn commit(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.flush(&mut inner);
    }

    fn flush(&self, inner: &mut VersioningInner) {
        self.bridge.add_stream_and_swap(&mut inner.stream);
        self.bridge.add_stream_and_swap(&mut inner.resource_stream);
    }
}

fn push_version(stream: &mut MessageStream, info: &ResourceVersionInfo, head: u32) {
    stream.add(&ResourceVersionMessage {
        puid: info.puid,
        version: head,
        name: info.name.clone().unwrap_or_default(),
        width: info.width,
        height: info.height,
        depth: info.depth,
        format: info.format.clone(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use lgn_validation_bridge::BridgeListener;
    use lgn_validation_messages::Message;

    #[derive(Default)]
    struct Recorder {
        versions: Mutex<Vec<(u32, u32)>>,
    }

    impl BridgeListener for Recorder {
        fn handle(&self, streams: &[MessageStream]) {
            let mut versions = self.versions.lock().unwrap();
            for stream in streams {
                if stream.schema().message_id != ResourceVersionMessage::ID {
                    continue;
                }
                for message in stream.decode_all::<ResourceVersionMessage>().unwrap() {
                    versions.push((message.puid, message.version));
                }
            }
        }
    }

    fn info(puid: u32) -> ResourceVersionInfo {
        ResourceVersionInfo {
            puid,
            name: Some(format!("resource-{}", puid)),
            width: 16,
            height: 16,
            depth: 1,
            format: "R8".to_string(),
        }
    }

    #[test]
    fn test_branch_only_when_dirty() {
        let bridge = Arc::new(MemoryBridge::new());
        let controller = VersioningController::new(Arc::clone(&bridge));

        // Nothing changed: no segmentation.
        let point = controller.branch_on_segmentation_point();
        assert!(!point.segmented);
        assert_eq!(point.id, 0);

        controller.create_or_recommit(&info(1));
        let point = controller.branch_on_segmentation_point();
        assert!(point.segmented);
        assert_eq!(point.id, 0);
        assert_eq!(controller.head(), 1);

        // Collapse of a non-segmented point is silent.
        controller.collapse_on_fork(VersionSegmentationPoint {
            id: 0,
            segmented: false,
        });
    }

    #[test]
    fn test_versions_reach_listeners_in_order() {
        let bridge = Arc::new(MemoryBridge::new());
        let recorder = Arc::new(Recorder::default());
        bridge.register(ResourceVersionMessage::ID, recorder.clone());

        let controller = VersioningController::new(Arc::clone(&bridge));
        controller.create_or_recommit(&info(1));
        controller.create_or_recommit(&info(2));
        controller.destroy(1);
        controller.commit();
        bridge.commit();

        assert_eq!(
            *recorder.versions.lock().unwrap(),
            vec![
                (1, 0),
                (2, 0),
                (1, ResourceVersionMessage::VERSION_DESTROYED)
            ]
        );
    }
}
