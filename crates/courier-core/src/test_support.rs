//! In-crate test helpers.

use crate::sink::{MessageSink, SinkError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// A sink that records every frame and can be programmed to fail.
pub(crate) struct RecordingSink {
    frames: Mutex<Vec<String>>,
    failures: Mutex<VecDeque<SinkError>>,
    closed: Mutex<Option<(u16, String)>>,
    open: AtomicBool,
}

impl RecordingSink {
    pub(crate) fn new() -> Self {
        Self {
            frames: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            closed: Mutex::new(None),
            open: AtomicBool::new(true),
        }
    }

    /// Every frame sent so far.
    pub(crate) fn sent(&self) -> Vec<String> {
        self.frames.lock().unwrap().clone()
    }

    /// Frames decoded back into envelopes.
    pub(crate) fn sent_envelopes(&self) -> Vec<courier_protocol::Envelope> {
        self.sent()
            .iter()
            .map(|frame| courier_protocol::decode(frame).unwrap())
            .collect()
    }

    /// Fail the next send with `error`, in FIFO order across calls.
    pub(crate) fn fail_next(&self, error: SinkError) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub(crate) fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    /// Close code and reason, if the sink was closed.
    pub(crate) fn closed(&self) -> Option<(u16, String)> {
        self.closed.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageSink for RecordingSink {
    async fn send(&self, frame: &str) -> Result<(), SinkError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(SinkError::Closed);
        }
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.frames.lock().unwrap().push(frame.to_string());
        Ok(())
    }

    async fn close(&self, code: u16, reason: &str) {
        self.open.store(false, Ordering::SeqCst);
        *self.closed.lock().unwrap() = Some((code, reason.to_string()));
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
