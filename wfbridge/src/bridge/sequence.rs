use std::sync::atomic::{AtomicU64, Ordering};

/// Message id source shared by every bridge of one service.
///
/// Never reset across pool generations, so a late result from a drained
/// generation can never alias a fresh command.
#[derive(Debug)]
pub struct SequenceCounter(AtomicU64);

impl SequenceCounter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Last id handed out, 0 if none.
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}
