//! Bounded, multi-threaded, optionally sequence-tagged work queue used by
//! every connection to dispatch decoded JSON frames to handlers.
//!
//! Modeled as plain OS threads plus a mutex/condvar, not tokio tasks: the
//! scheduling model here is explicitly "parallel OS threads, no event
//! loop" (unlike the connection layer, which is tokio-driven for I/O).

use std::collections::{HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use log::{error, warn};
use serde_json::Value;

use crate::error::{GatewayError, Result};

pub const MAX_QUEUESIZE: usize = 100_000;

pub type Doc = Value;
pub type Handler = Arc<dyn Fn(Doc) + Send + Sync>;
pub type TypeDetector = Arc<dyn Fn(&Doc) -> String + Send + Sync>;

struct QueueItem {
    doc: Doc,
    handler: Handler,
    seq_tag: Option<u64>,
}

struct QueueState {
    items: VecDeque<QueueItem>,
    open_sequences: HashSet<u64>,
}

pub struct MessageProcessor {
    state: Mutex<QueueState>,
    cv: Condvar,
    max_size: usize,
    shutdown: AtomicBool,
    paused: AtomicBool,
    autoflush: bool,
    batch_size: usize,
    running_threads: AtomicUsize,
    busy_threads: AtomicUsize,
    workers: Mutex<Vec<JoinHandle<()>>>,
    type_detector: RwLock<Option<TypeDetector>>,
    handlers: RwLock<std::collections::HashMap<String, Handler>>,
}

impl MessageProcessor {
    pub fn new(max_size: usize, autoflush: bool, batch_size: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                open_sequences: HashSet::new(),
            }),
            cv: Condvar::new(),
            max_size,
            shutdown: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            autoflush,
            batch_size,
            running_threads: AtomicUsize::new(0),
            busy_threads: AtomicUsize::new(0),
            workers: Mutex::new(Vec::new()),
            type_detector: RwLock::new(None),
            handlers: RwLock::new(std::collections::HashMap::new()),
        })
    }

    /// Sets the classifier invoked by `process_message`. No-op (and an
    /// error) if already set.
    pub fn register_type_detector(&self, detector: TypeDetector) -> Result<()> {
        let mut slot = self.type_detector.write().unwrap();
        if slot.is_some() {
            return Err(GatewayError::StateConflict(
                "type detector already registered".into(),
            ));
        }
        *slot = Some(detector);
        Ok(())
    }

    pub fn register_handler(&self, msg_type: impl Into<String>, handler: Handler) -> Result<()> {
        let msg_type = msg_type.into();
        let mut handlers = self.handlers.write().unwrap();
        if handlers.contains_key(&msg_type) {
            return Err(GatewayError::StateConflict(format!(
                "duplicate handler for message type {msg_type}"
            )));
        }
        handlers.insert(msg_type, handler);
        Ok(())
    }

    pub fn process_message(&self, doc: Doc) -> Result<()> {
        let msg_type = {
            let detector = self.type_detector.read().unwrap();
            let detector = detector
                .as_ref()
                .ok_or(GatewayError::NotInitialized)?;
            detector(&doc)
        };

        let handler = {
            let handlers = self.handlers.read().unwrap();
            handlers.get(&msg_type).cloned()
        };

        match handler {
            Some(handler) => self.enqueue(doc, handler, None),
            None => Err(GatewayError::StateConflict(format!(
                "Not supported message: {msg_type}"
            ))),
        }
    }

    pub fn enqueue(&self, doc: Doc, handler: Handler, seq_tag: Option<u64>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if self.shutdown.load(Ordering::Acquire) {
            return Err(GatewayError::StateConflict("processor is shutting down".into()));
        }
        if state.items.len() >= self.max_size {
            return Err(GatewayError::QueueFull);
        }
        state.items.push_back(QueueItem { doc, handler, seq_tag });
        let len = state.items.len();
        drop(state);

        if !self.autoflush || len >= self.batch_size {
            self.cv.notify_one();
        }
        Ok(())
    }

    /// Notifies one waiting worker if the queue is non-empty; driven by an
    /// external autoflush timer so items behind the batch threshold
    /// eventually run.
    pub fn on_flush(&self) {
        if !self.state.lock().unwrap().items.is_empty() {
            self.cv.notify_one();
        }
    }

    pub fn start(self: &Arc<Self>, name: &str, n_workers: usize) {
        self.running_threads.store(n_workers, Ordering::Release);
        let mut workers = self.workers.lock().unwrap();
        for i in 0..n_workers {
            let proc = self.clone();
            let thread_name = format!("{name}_{i:02}");
            let handle = thread::Builder::new()
                .name(thread_name)
                .spawn(move || proc.worker_loop())
                .expect("failed to spawn message processor worker");
            workers.push(handle);
        }
    }

    fn worker_loop(self: Arc<Self>) {
        loop {
            let mut state = self.state.lock().unwrap();
            loop {
                if self.shutdown.load(Ordering::Acquire) && state.items.is_empty() {
                    return;
                }
                if !self.paused.load(Ordering::Acquire) {
                    if let Some(idx) = state
                        .items
                        .iter()
                        .position(|it| it.seq_tag.is_none_or(|t| !state.open_sequences.contains(&t)))
                    {
                        let item = state.items.remove(idx).unwrap();
                        if let Some(tag) = item.seq_tag {
                            state.open_sequences.insert(tag);
                        }
                        drop(state);

                        self.busy_threads.fetch_add(1, Ordering::AcqRel);
                        let doc = item.doc;
                        let handler = item.handler;
                        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| handler(doc))) {
                            error!("message processor handler panicked: {panic:?}");
                        }
                        self.busy_threads.fetch_sub(1, Ordering::AcqRel);

                        state = self.state.lock().unwrap();
                        if let Some(tag) = item.seq_tag {
                            state.open_sequences.remove(&tag);
                        }
                        self.cv.notify_all();
                        break;
                    }
                }
                state = match self.cv.wait(state) {
                    Ok(s) => s,
                    Err(poisoned) => {
                        warn!("message processor mutex poisoned, recovering");
                        poisoned.into_inner()
                    }
                };
            }
        }
    }

    pub fn stop(&self, cancel_queue: bool, detach: bool) {
        {
            let mut state = self.state.lock().unwrap();
            self.shutdown.store(true, Ordering::Release);
            if cancel_queue {
                state.items.clear();
                state.open_sequences.clear();
            }
        }
        self.cv.notify_all();

        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            if detach {
                drop(handle);
            } else {
                let _ = handle.join();
            }
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn unpause(&self) {
        self.paused.store(false, Ordering::Release);
        self.cv.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn queue_size(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    pub fn max_queue_size(&self) -> usize {
        self.max_size
    }

    pub fn running_threads(&self) -> usize {
        self.running_threads.load(Ordering::Acquire)
    }

    pub fn busy_threads(&self) -> usize {
        self.busy_threads.load(Ordering::Acquire)
    }

    pub fn idle_threads(&self) -> usize {
        self.running_threads().saturating_sub(self.busy_threads())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;
    use std::time::Duration;

    #[test]
    fn queue_full_rejects_beyond_max_size() {
        let proc = MessageProcessor::new(2, false, 1);
        let handler: Handler = Arc::new(|_| {});
        assert!(proc.enqueue(Value::Null, handler.clone(), None).is_ok());
        assert!(proc.enqueue(Value::Null, handler.clone(), None).is_ok());
        assert!(matches!(
            proc.enqueue(Value::Null, handler, None),
            Err(GatewayError::QueueFull)
        ));
        assert_eq!(proc.queue_size(), 2);
    }

    #[test]
    fn same_sequence_tag_runs_strictly_serially() {
        let proc = MessageProcessor::new(MAX_QUEUESIZE, false, 1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let concurrent = Arc::new(AtomicI64::new(0));
        let max_concurrent = Arc::new(AtomicI64::new(0));

        proc.start("test", 4);

        let handler: Handler = {
            let order = order.clone();
            let concurrent = concurrent.clone();
            let max_concurrent = max_concurrent.clone();
            Arc::new(move |doc: Doc| {
                let cur = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                max_concurrent.fetch_max(cur, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(2));
                order.lock().unwrap().push(doc.as_i64().unwrap());
                concurrent.fetch_sub(1, Ordering::SeqCst);
            })
        };

        for i in 0..20 {
            proc.enqueue(Value::from(i), handler.clone(), Some(42)).unwrap();
        }

        thread::sleep(Duration::from_millis(500));
        proc.stop(false, false);

        assert_eq!(*order.lock().unwrap(), (0..20).collect::<Vec<_>>());
        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    }
}
