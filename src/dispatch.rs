//! Inline and detached classifier dispatch.
//!
//! The detached path owns the classifier on a worker thread behind a bounded
//! channel. Requests that do not fit are dropped rather than queued, so a
//! slow model never builds up latency. Every request carries a generation id
//! and the owner decides whether a returning result is still current.

use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError, TrySendError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::engine::{Classifier, EngineError};
use crate::preprocess::Tensor;

pub struct InferenceRequest {
    pub generation: u64,
    pub slot: usize,
    pub tensor: Tensor,
}

pub struct InferenceOutcome {
    pub generation: u64,
    pub slot: usize,
    pub result: Result<Vec<f32>, EngineError>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submit {
    Queued,
    /// Channel full; the request was discarded.
    Dropped,
}

pub struct DetachedClassifier {
    requests: Option<SyncSender<InferenceRequest>>,
    outcomes: Receiver<InferenceOutcome>,
    worker: Option<JoinHandle<()>>,
}

impl DetachedClassifier {
    pub fn spawn(
        mut classifier: Box<dyn Classifier>,
        queue_depth: usize,
    ) -> Result<Self, EngineError> {
        let (req_tx, req_rx) = mpsc::sync_channel::<InferenceRequest>(queue_depth.max(1));
        let (out_tx, out_rx) = mpsc::channel::<InferenceOutcome>();

        let worker = thread::Builder::new()
            .name("slate-inference".to_string())
            .spawn(move || {
                while let Ok(req) = req_rx.recv() {
                    let start = Instant::now();
                    let result = classifier.classify(&req.tensor);
                    let outcome = InferenceOutcome {
                        generation: req.generation,
                        slot: req.slot,
                        result,
                        elapsed: start.elapsed(),
                    };
                    if out_tx.send(outcome).is_err() {
                        break;
                    }
                }
                tracing::debug!("inference worker exiting");
            })?;

        Ok(Self {
            requests: Some(req_tx),
            outcomes: out_rx,
            worker: Some(worker),
        })
    }

    pub fn submit(&self, req: InferenceRequest) -> Result<Submit, EngineError> {
        let tx = self.requests.as_ref().ok_or(EngineError::WorkerGone)?;
        match tx.try_send(req) {
            Ok(()) => Ok(Submit::Queued),
            Err(TrySendError::Full(_)) => Ok(Submit::Dropped),
            Err(TrySendError::Disconnected(_)) => Err(EngineError::WorkerGone),
        }
    }

    /// Everything the worker has finished since the last drain.
    pub fn drain(&self) -> Vec<InferenceOutcome> {
        let mut out = Vec::new();
        loop {
            match self.outcomes.try_recv() {
                Ok(o) => out.push(o),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        out
    }

    /// Block until one outcome arrives or `timeout` passes.
    pub fn wait(&self, timeout: Duration) -> Option<InferenceOutcome> {
        self.outcomes.recv_timeout(timeout).ok()
    }

    /// Close the request channel and detach the worker. An in-flight request
    /// finishes on its own; its result is never delivered.
    pub fn shutdown(&mut self) {
        self.requests = None;
        self.worker = None;
    }

    pub fn is_running(&self) -> bool {
        self.requests.is_some()
    }
}

impl Drop for DetachedClassifier {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub enum Dispatcher {
    Inline(Box<dyn Classifier>),
    Detached(DetachedClassifier),
}
