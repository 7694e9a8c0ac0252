//! Fire-and-forget trace records for debuggers, profilers and telemetry.
//!
//! Consumers subscribe with a bounded capacity and receive [`TraceEvent`]s over
//! a crossbeam channel. Emission uses `try_send`: a slow consumer loses events
//! (counted in [`TraceSink::dropped`]) but never stalls the mutator.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::trace;

use super::codegen::JobId;
use super::entry_point::{CleanupReason, EntryPointId, NativeAddress};
use super::function::FunctionId;
use super::tier::{ExecutionTier, JitTier};

/// One observable control-plane event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    TierTransition {
        function: FunctionId,
        from: ExecutionTier,
        to: ExecutionTier,
        reason: &'static str,
    },
    CompileQueued {
        entry_point: EntryPointId,
        tier: JitTier,
        job: JobId,
    },
    CompileFinished {
        entry_point: EntryPointId,
        job: JobId,
        succeeded: bool,
    },
    Installed {
        entry_point: EntryPointId,
        address: NativeAddress,
        size: usize,
    },
    Rollback {
        entry_point: EntryPointId,
    },
    Invalidated {
        entry_point: EntryPointId,
        prolonged: bool,
    },
    Expired {
        entry_point: EntryPointId,
    },
    CleanedUp {
        entry_point: EntryPointId,
        reason: CleanupReason,
    },
    Redeferred {
        function: FunctionId,
    },
}

/// Fan-out of trace events to any number of bounded subscribers
#[derive(Debug, Default)]
pub struct TraceSink {
    subscribers: Vec<Sender<TraceEvent>>,
    dropped: u64,
}

impl TraceSink {
    pub const fn new() -> Self {
        TraceSink {
            subscribers: Vec::new(),
            dropped: 0,
        }
    }

    /// Add a subscriber holding at most `capacity` undelivered events
    pub fn subscribe(&mut self, capacity: usize) -> Receiver<TraceEvent> {
        let (tx, rx) = bounded(capacity.max(1));
        self.subscribers.push(tx);
        rx
    }

    /// Deliver to every live subscriber without blocking
    pub fn emit(&mut self, event: TraceEvent) {
        trace!(?event, "trace event");
        if self.subscribers.is_empty() {
            return;
        }
        let mut dropped = 0;
        self.subscribers
            .retain(|tx| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    dropped += 1;
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            });
        self.dropped += dropped;
    }

    /// Events lost because a subscriber was full
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::arena::test_handle;

    fn function_id() -> FunctionId {
        test_handle(0)
    }

    #[test]
    fn test_full_subscriber_drops_without_blocking() {
        let mut sink = TraceSink::new();
        let rx = sink.subscribe(1);
        let function = function_id();
        for _ in 0..3 {
            sink.emit(TraceEvent::Redeferred { function });
        }
        assert_eq!(rx.len(), 1);
        assert_eq!(sink.dropped(), 2);
    }

    #[test]
    fn test_disconnected_subscriber_is_pruned() {
        let mut sink = TraceSink::new();
        let rx = sink.subscribe(4);
        drop(rx);
        sink.emit(TraceEvent::Redeferred {
            function: function_id(),
        });
        assert_eq!(sink.subscriber_count(), 0);
    }
}
