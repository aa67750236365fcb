//! Transformation and routing between watchers and the storage layers.
//!
//! Watchers push raw objects into a bounded queue; the pipeline task drains
//! them in small batches, normalizes each into an [`Event`], and fans the
//! batch out to its sinks (block store, graph builder) in order. The queue
//! drops its oldest entries on overflow so a slow sink can never block a
//! watcher.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub mod normalize;
pub mod status;

use crate::block_store::BlockStore;
use crate::event::{Event, EventKind};

const BATCH_SIZE: usize = 64;

/// A watched object before normalization.
#[derive(Clone, Debug)]
pub struct RawResourceEvent {
    pub kind: EventKind,
    pub api_group: String,
    pub api_version: String,
    pub resource_kind: String,
    pub object: serde_json::Value,
}

/// Receives normalized event batches, in arrival order.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn accept(&self, events: &[Event]);
}

#[async_trait]
impl EventSink for BlockStore {
    async fn accept(&self, events: &[Event]) {
        for event in events {
            if let Err(error) = self.append(event.clone()).await {
                error!(message = "failed to append event to block store", %error);
            }
        }
    }
}

/// Bounded queue that sheds its oldest entries under pressure.
pub struct EventQueue {
    inner: Mutex<VecDeque<RawResourceEvent>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        })
    }

    /// Enqueues an item, evicting the oldest when full. Never blocks.
    pub fn push(&self, item: RawResourceEvent) {
        {
            let mut queue = self.inner.lock().expect("event queue poisoned");
            queue.push_back(item);
            if queue.len() > self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.notify.notify_one();
    }

    /// Waits for items and drains up to `max` of them.
    pub async fn pop_batch(&self, max: usize) -> Vec<RawResourceEvent> {
        loop {
            {
                let mut queue = self.inner.lock().expect("event queue poisoned");
                if !queue.is_empty() {
                    let n = queue.len().min(max);
                    return queue.drain(..n).collect();
                }
            }
            self.notify.notified().await;
        }
    }

    fn drain_all(&self) -> Vec<RawResourceEvent> {
        let mut queue = self.inner.lock().expect("event queue poisoned");
        queue.drain(..).collect()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("event queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cloneable producer half handed to watchers.
#[derive(Clone)]
pub struct PipelineHandle {
    queue: Arc<EventQueue>,
}

impl PipelineHandle {
    pub fn push(&self, item: RawResourceEvent) {
        self.queue.push(item);
    }
}

/// The pipeline task: normalization plus ordered fan-out.
pub struct Pipeline {
    queue: Arc<EventQueue>,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl Pipeline {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: EventQueue::new(capacity),
            sinks: Vec::new(),
        }
    }

    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            queue: Arc::clone(&self.queue),
        }
    }

    pub fn queue(&self) -> Arc<EventQueue> {
        Arc::clone(&self.queue)
    }

    pub fn add_sink(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }

    /// Runs until cancelled, then drains whatever is still queued.
    pub async fn run(self, cancel: CancellationToken) {
        info!(message = "event pipeline started", sinks = self.sinks.len());
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let remaining = self.queue.drain_all();
                    if !remaining.is_empty() {
                        debug!(message = "draining pipeline on shutdown", remaining = remaining.len());
                        self.process(remaining).await;
                    }
                    break;
                }
                batch = self.queue.pop_batch(BATCH_SIZE) => {
                    self.process(batch).await;
                }
            }
        }
        info!(message = "event pipeline stopped", dropped = self.queue.dropped());
    }

    async fn process(&self, batch: Vec<RawResourceEvent>) {
        let mut events = Vec::with_capacity(batch.len());
        for raw in &batch {
            match normalize::normalize(raw) {
                Ok(event) => events.push(event),
                Err(error) => {
                    warn!(message = "dropping unnormalizable object", kind = %raw.resource_kind, %error);
                }
            }
        }
        if events.is_empty() {
            return;
        }
        for sink in &self.sinks {
            sink.accept(&events).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(name: &str) -> RawResourceEvent {
        RawResourceEvent {
            kind: EventKind::Create,
            api_group: String::new(),
            api_version: "v1".into(),
            resource_kind: "Pod".into(),
            object: json!({"metadata": {"name": name, "uid": name}}),
        }
    }

    #[test]
    fn overflow_drops_oldest() {
        let queue = EventQueue::new(2);
        queue.push(raw("a"));
        queue.push(raw("b"));
        queue.push(raw("c"));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
        let drained = queue.drain_all();
        assert_eq!(
            drained[0].object.pointer("/metadata/name").unwrap(),
            &json!("b")
        );
    }

    struct Capture(Mutex<Vec<Event>>);

    #[async_trait]
    impl EventSink for Capture {
        async fn accept(&self, events: &[Event]) {
            self.0.lock().unwrap().extend_from_slice(events);
        }
    }

    #[tokio::test]
    async fn pipeline_normalizes_and_fans_out() {
        let mut pipeline = Pipeline::new(16);
        let capture = Arc::new(Capture(Mutex::new(Vec::new())));
        pipeline.add_sink(Arc::clone(&capture));

        let handle = pipeline.handle();
        handle.push(raw("a"));
        handle.push(raw("b"));

        let cancel = CancellationToken::new();
        cancel.cancel();
        // Cancelled up front: run drains the queue and exits.
        pipeline.run(cancel).await;

        let seen = capture.0.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].identity.name, "a");
        assert_eq!(seen[1].identity.name, "b");
    }
}
