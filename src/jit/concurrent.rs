//! Background compilation
//!
//! A single worker thread compiles queued [`CompileRequest`]s. Requests and
//! results are plain owned data; the worker never sees engine state. The
//! engine polls [`CompileQueue::drain_results`] at call boundaries and
//! installs whatever is still current.

use super::compiler::{self, CompileFailure, CompileRequest};
use super::ir::OptimizedUnit;
use crate::engine::FunctionId;
use crate::error::Result;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// A finished compile job
#[derive(Debug)]
pub struct CompileResult {
    pub function: FunctionId,
    /// Bytecode version the request was built from
    pub bytecode_version: u32,
    pub outcome: std::result::Result<OptimizedUnit, CompileFailure>,
}

#[derive(Default)]
struct QueueState {
    jobs: VecDeque<CompileRequest>,
    results: Vec<CompileResult>,
    /// Jobs taken by the worker and not yet finished
    in_flight: usize,
    shutdown: bool,
}

struct QueueInner {
    state: Mutex<QueueState>,
    work_ready: Condvar,
    idle: Condvar,
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Job queue served by one compiler thread
pub struct CompileQueue {
    inner: Arc<QueueInner>,
    worker: Option<JoinHandle<()>>,
}

impl CompileQueue {
    /// Start the compiler thread
    pub fn new() -> Result<Self> {
        let inner = Arc::new(QueueInner {
            state: Mutex::new(QueueState::default()),
            work_ready: Condvar::new(),
            idle: Condvar::new(),
        });
        let worker_inner = Arc::clone(&inner);
        let worker = thread::Builder::new()
            .name("tierjit-compiler".into())
            .spawn(move || worker_loop(&worker_inner))?;
        Ok(Self {
            inner,
            worker: Some(worker),
        })
    }

    pub fn submit(&self, request: CompileRequest) {
        debug!(function = %request.function, "queued for background compilation");
        let mut state = self.inner.lock();
        state.jobs.push_back(request);
        self.inner.work_ready.notify_one();
    }

    /// Take every finished result without blocking
    pub fn drain_results(&self) -> Vec<CompileResult> {
        std::mem::take(&mut self.inner.lock().results)
    }

    /// Jobs queued or being compiled
    pub fn pending(&self) -> usize {
        let state = self.inner.lock();
        state.jobs.len() + state.in_flight
    }

    /// Block until the queue is empty and the worker is idle
    pub fn wait_idle(&self) {
        let mut state = self.inner.lock();
        while !state.jobs.is_empty() || state.in_flight > 0 {
            state = self.inner.idle.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl Drop for CompileQueue {
    fn drop(&mut self) {
        {
            let mut state = self.inner.lock();
            state.shutdown = true;
            state.jobs.clear();
        }
        self.inner.work_ready.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("compiler thread panicked");
            }
        }
    }
}

fn worker_loop(inner: &QueueInner) {
    loop {
        let request = {
            let mut state = inner.lock();
            loop {
                if state.shutdown {
                    return;
                }
                if let Some(request) = state.jobs.pop_front() {
                    state.in_flight += 1;
                    break request;
                }
                state = inner.work_ready.wait(state).unwrap_or_else(PoisonError::into_inner);
            }
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| compiler::compile(&request)))
            .unwrap_or_else(|_| Err(CompileFailure::Internal("compiler panicked".into())));
        let result = CompileResult {
            function: request.function,
            bytecode_version: request.bytecode_version,
            outcome,
        };

        let mut state = inner.lock();
        state.results.push(result);
        state.in_flight -= 1;
        inner.idle.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::ChunkBuilder;
    use crate::jit::compiler::CompilerOptions;
    use crate::jit::feedback::FeedbackVector;
    use rustc_hash::FxHashMap as HashMap;

    fn request(id: u32) -> CompileRequest {
        let mut b = ChunkBuilder::new(format!("f{}", id), 1);
        b.get_local(0).ret();
        let chunk = b.finish().unwrap();
        CompileRequest {
            function: FunctionId(id),
            bytecode_version: 7,
            feedback: FeedbackVector::new(&chunk.call_sites, 4),
            chunk: Arc::new(chunk),
            globals: HashMap::default(),
            options: CompilerOptions::default(),
        }
    }

    #[test]
    fn test_results_come_back() {
        let queue = CompileQueue::new().unwrap();
        for id in 0..4 {
            queue.submit(request(id));
        }
        queue.wait_idle();
        assert_eq!(queue.pending(), 0);
        let mut results = queue.drain_results();
        results.sort_by_key(|r| r.function.0);
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.bytecode_version == 7 && r.outcome.is_ok()));
        assert!(queue.drain_results().is_empty());
    }

    #[test]
    fn test_drop_joins_worker() {
        let queue = CompileQueue::new().unwrap();
        queue.submit(request(1));
        drop(queue);
    }
}
