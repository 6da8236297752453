//! Remote ICE candidates that arrived before the remote description.

use std::collections::VecDeque;

use async_trait::async_trait;

use crate::error::CallError;
use crate::platform::CandidateInit;

/// Default bound on buffered candidates.
pub const DEFAULT_CAPACITY: usize = 256;

/// Where buffered candidates go.
#[async_trait]
pub trait CandidateSink: Send + Sync {
    fn remote_description_applied(&self) -> bool;
    async fn add_candidate(&self, candidate: &CandidateInit) -> Result<(), CallError>;
}

/// Outcome of a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    pub applied: usize,
    pub skipped: usize,
}

/// FIFO of candidates awaiting application.
#[derive(Debug)]
pub struct IceCandidateBuffer {
    pending: VecDeque<CandidateInit>,
    capacity: usize,
}

impl Default for IceCandidateBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl IceCandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append in arrival order. When full, the oldest candidate is dropped.
    pub fn push(&mut self, candidate: CandidateInit) {
        if self.pending.len() >= self.capacity {
            if let Some(dropped) = self.pending.pop_front() {
                tracing::warn!(
                    "ICE buffer full ({}), dropping oldest candidate {}",
                    self.capacity,
                    dropped.candidate
                );
            }
        }
        self.pending.push_back(candidate);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Apply everything, oldest first. A candidate that fails is logged and
    /// skipped. Refuses (keeping the buffer) if the sink has no remote
    /// description yet.
    pub async fn drain_into(&mut self, sink: &dyn CandidateSink) -> Result<DrainReport, CallError> {
        if !sink.remote_description_applied() {
            return Err(CallError::InvalidState {
                op: "apply ICE candidates",
                state: "no remote description".into(),
            });
        }
        let mut report = DrainReport::default();
        while let Some(candidate) = self.pending.pop_front() {
            match sink.add_candidate(&candidate).await {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    tracing::warn!("Skipping ICE candidate {:?}: {}", candidate.candidate, e);
                    report.skipped += 1;
                }
            }
        }
        if report.applied + report.skipped > 0 {
            tracing::debug!(
                "Drained ICE buffer: {} applied, {} skipped",
                report.applied,
                report.skipped
            );
        }
        Ok(report)
    }
}
