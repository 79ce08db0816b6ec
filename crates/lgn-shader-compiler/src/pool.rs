//! The worker pool both compilers share.
//!
//! Batches are segmented into chunks of `max(1, count / (workers * 3))`;
//! the oversubscription keeps work stealing effective without grinding the
//! queue lock on tiny chunks. The completion functor runs on the worker
//! that finishes the last chunk, and it observes a *predicted* head: the
//! complete counter plus the finishing chunk's size, with the counter
//! itself advancing only after the functor returns. Downstream consumers
//! order against that prediction.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::CompileError;

pub const CHUNKED_SEGMENTATION_FACTOR: usize = 3;

/// Per-batch failure accounting; entries are keyed by shader guid.
#[derive(Default)]
pub struct CompilerDiagnostic {
    pub failed_jobs: AtomicU32,
    pub messages: Mutex<Vec<(u64, String)>>,
}

impl CompilerDiagnostic {
    pub fn record_failure(&self, shader_guid: u64, error: &CompileError) {
        self.failed_jobs.fetch_add(1, Ordering::Relaxed);
        self.messages
            .lock()
            .unwrap()
            .push((shader_guid, error.to_string()));
    }

    pub fn failed_job_count(&self) -> u32 {
        self.failed_jobs.load(Ordering::Relaxed)
    }
}

/// Invoked exactly once per batch with `(predicted_head, first_error,
/// outputs)`. Failed items stay `None` in the output array.
pub type BatchCompletion<O> =
    Box<dyn FnOnce(u64, Option<CompileError>, Vec<Option<O>>) + Send>;

struct BatchContext<O> {
    pending: AtomicU32,
    outputs: Mutex<Vec<Option<O>>>,
    first_error: Mutex<Option<CompileError>>,
    completion: Mutex<Option<BatchCompletion<O>>>,
}

struct QueuedChunk<I, O> {
    context: Arc<BatchContext<O>>,
    offset: usize,
    items: Vec<I>,
}

struct Shared<I, O> {
    queue: Mutex<VecDeque<QueuedChunk<I, O>>>,
    condvar: Condvar,
    exit: AtomicBool,
    complete_counter: AtomicU64,
    compile: Box<dyn Fn(&I) -> Result<O, CompileError> + Send + Sync>,
}

/// A fixed worker set draining a mutex-guarded FIFO of job chunks.
pub struct CompilerPool<I: Send + 'static, O: Send + 'static> {
    shared: Arc<Shared<I, O>>,
    workers: Vec<JoinHandle<()>>,
    worker_count: usize,
}

impl<I: Send + 'static, O: Send + 'static> CompilerPool<I, O> {
    pub fn new<F>(worker_count: usize, name: &str, compile: F) -> Self
    where
        F: Fn(&I) -> Result<O, CompileError> + Send + Sync + 'static,
    {
        let worker_count = worker_count.max(1);

        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            exit: AtomicBool::new(false),
            complete_counter: AtomicU64::new(0),
            compile: Box::new(compile),
        });

        log::info!("starting {} {} workers", worker_count, name);

        let workers = (0..worker_count)
            .map(|index| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("{}-{}", name, index))
                    .spawn(move || worker_entry(&shared))
                    .expect("worker spawn")
            })
            .collect();

        Self {
            shared,
            workers,
            worker_count,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Realized complete counter.
    pub fn complete_counter(&self) -> u64 {
        self.shared.complete_counter.load(Ordering::Acquire)
    }

    /// Chunk size for a batch of `count` items.
    pub fn chunked_size(&self, count: usize) -> usize {
        (count / (self.worker_count * CHUNKED_SEGMENTATION_FACTOR)).max(1)
    }

    /// Push a batch. A zero-length batch completes immediately on the
    /// calling thread with an empty output array.
    pub fn push(&self, items: Vec<I>, completion: BatchCompletion<O>) {
        let count = items.len();
        if count == 0 {
            let head = self.complete_counter();
            completion(head, None, Vec::new());
            return;
        }

        let context = Arc::new(BatchContext {
            pending: AtomicU32::new(0),
            outputs: Mutex::new((0..count).map(|_| None).collect()),
            first_error: Mutex::new(None),
            completion: Mutex::new(Some(completion)),
        });

        let chunked_size = self.chunked_size(count);

        // All chunks of the batch enter the queue under one critical
        // section so a worker cannot observe a partial batch.
        let mut queue = self.shared.queue.lock().unwrap();
        let mut offset = 0;
        let mut items = items.into_iter();
        while offset < count {
            let take = chunked_size.min(count - offset);
            let chunk_items: Vec<I> = items.by_ref().take(take).collect();

            context.pending.fetch_add(1, Ordering::AcqRel);
            queue.push_back(QueuedChunk {
                context: Arc::clone(&context),
                offset,
                items: chunk_items,
            });

            offset += take;
        }
        drop(queue);

        self.shared.condvar.notify_all();
    }
}

impl<I: Send + 'static, O: Send + 'static> Drop for CompilerPool<I, O> {
    fn drop(&mut self) {
        self.shared.exit.store(true, Ordering::Release);
        self.shared.condvar.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_entry<I, O>(shared: &Shared<I, O>) {
    loop {
        let chunk = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if shared.exit.load(Ordering::Acquire) {
                    return;
                }
                if let Some(chunk) = queue.pop_front() {
                    break chunk;
                }
                queue = shared.condvar.wait(queue).unwrap();
            }
        };

        let chunk_size = chunk.items.len();

        for (index, item) in chunk.items.iter().enumerate() {
            match (shared.compile)(item) {
                Ok(output) => {
                    chunk.context.outputs.lock().unwrap()[chunk.offset + index] = Some(output);
                }
                Err(error) => {
                    chunk
                        .context
                        .first_error
                        .lock()
                        .unwrap()
                        .get_or_insert(error);
                }
            }
        }

        // Predicted head: where the counter lands once this chunk is
        // accounted. The counter itself moves after the completion runs.
        let predicted_head =
            shared.complete_counter.load(Ordering::Acquire) + chunk_size as u64;

        if chunk.context.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            let completion = chunk
                .context
                .completion
                .lock()
                .unwrap()
                .take()
                .expect("completion invoked once");
            let outputs = std::mem::take(&mut *chunk.context.outputs.lock().unwrap());
            let first_error = chunk.context.first_error.lock().unwrap().take();

            completion(predicted_head, first_error, outputs);
        }

        // Realize the head as a separate operation.
        shared
            .complete_counter
            .fetch_add(chunk_size as u64, Ordering::AcqRel);
    }
}
