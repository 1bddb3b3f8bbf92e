//! In-memory sink for tests and benchmarks.

use async_trait::async_trait;
use courier_core::sink::{MessageSink, SinkError};
use courier_protocol::Envelope;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// A sink that records every frame instead of writing to a socket.
///
/// Sends can be programmed to fail in FIFO order, and the sink can be
/// flipped closed to simulate a dropped connection.
pub struct InMemorySink {
    frames: Mutex<Vec<String>>,
    failures: Mutex<VecDeque<SinkError>>,
    closed: Mutex<Option<(u16, String)>>,
    open: AtomicBool,
}

impl Default for InMemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self {
            frames: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            closed: Mutex::new(None),
            open: AtomicBool::new(true),
        }
    }

    /// Every frame sent so far.
    #[must_use]
    pub fn sent(&self) -> Vec<String> {
        self.frames.lock().unwrap().clone()
    }

    /// Frames that decode back into envelopes. Malformed frames are skipped.
    #[must_use]
    pub fn sent_envelopes(&self) -> Vec<Envelope> {
        self.sent()
            .iter()
            .filter_map(|frame| courier_protocol::decode(frame).ok())
            .collect()
    }

    /// Drain the recorded frames.
    #[must_use]
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut self.frames.lock().unwrap())
    }

    /// Fail the next send with `error`, in FIFO order across calls.
    pub fn fail_next(&self, error: SinkError) {
        self.failures.lock().unwrap().push_back(error);
    }

    /// Flip the sink open or closed without recording a close frame.
    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    /// Close code and reason, if the sink was closed through [`MessageSink`].
    #[must_use]
    pub fn closed(&self) -> Option<(u16, String)> {
        self.closed.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageSink for InMemorySink {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_frames_in_order() {
        let sink = InMemorySink::new();
        sink.send("one").await.unwrap();
        sink.send("two").await.unwrap();
        assert_eq!(sink.sent(), vec!["one".to_string(), "two".to_string()]);
        assert_eq!(sink.take().len(), 2);
        assert!(sink.sent().is_empty());
    }

    #[tokio::test]
    async fn test_programmed_failures_consumed_in_order() {
        let sink = InMemorySink::new();
        sink.fail_next(SinkError::Backpressure);
        sink.fail_next(SinkError::Failed("boom".to_string()));

        assert!(matches!(
            sink.send("a").await,
            Err(SinkError::Backpressure)
        ));
        assert!(matches!(sink.send("b").await, Err(SinkError::Failed(_))));
        sink.send("c").await.unwrap();
        assert_eq!(sink.sent(), vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn test_close_records_code_and_blocks_sends() {
        let sink = InMemorySink::new();
        sink.close(4000, "policy").await;
        assert!(!sink.is_open());
        assert_eq!(sink.closed(), Some((4000, "policy".to_string())));
        assert!(matches!(sink.send("late").await, Err(SinkError::Closed)));
    }
}
