// crates/elspeth-telemetry/src/queue.rs
// ============================================================================
// Module: ELSPETH Telemetry Bounded Queue
// Description: A per-exporter bounded queue whose overflow behavior
//              follows the configured backpressure mode (§9: "a bounded
//              queue per exporter with a worker consuming events").
// ============================================================================

use std::collections::VecDeque;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::mpsc::Sender;

use crate::config::BackpressureMode;
use crate::error::TelemetryError;
use crate::event::TelemetryEvent;

/// One item flowing through an exporter's queue: either an event to
/// deliver, or a control message the worker must act on synchronously.
pub(crate) enum QueueItem {
    /// An event awaiting export.
    Event(TelemetryEvent),
    /// A flush request; the worker replies on the embedded channel once
    /// `TelemetryExporter::flush` returns.
    Flush(Sender<Result<(), TelemetryError>>),
    /// A shutdown request; the worker calls `TelemetryExporter::close`
    /// and exits its loop after processing this item.
    Close,
}

/// Whether a push into the queue enqueued its event, or dropped it
/// under a non-blocking backpressure mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushOutcome {
    /// The event (or control item) was enqueued.
    Enqueued,
    /// The queue was full and the incoming event was dropped
    /// (`drop_newest`).
    DroppedIncoming,
    /// The queue was full and its oldest event was evicted to make room
    /// (`drop_oldest`).
    EvictedOldest,
}

/// A bounded FIFO of [`QueueItem`]s shared between the dispatcher (the
/// producer) and one exporter worker thread (the consumer). Control
/// items (`Flush`, `Close`) always enqueue regardless of capacity: they
/// carry no backpressure semantics of their own.
pub(crate) struct BoundedQueue {
    capacity: usize,
    items: Mutex<VecDeque<QueueItem>>,
    not_empty: Condvar,
}

impl BoundedQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self { capacity, items: Mutex::new(VecDeque::with_capacity(capacity)), not_empty: Condvar::new() }
    }

    /// Pushes an event, honoring `mode`'s overflow behavior. `mode`
    /// must not be [`BackpressureMode::Slow`]; callers validate
    /// configuration before constructing a queue.
    pub(crate) fn push_event(&self, event: TelemetryEvent, mode: BackpressureMode) -> PushOutcome {
        let mut items = self.items.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let outcome = match mode {
            BackpressureMode::Block => {
                while items.len() >= self.capacity {
                    items = self.not_empty.wait(items).unwrap_or_else(std::sync::PoisonError::into_inner);
                }
                items.push_back(QueueItem::Event(event));
                PushOutcome::Enqueued
            }
            BackpressureMode::DropNewest => {
                if items.len() >= self.capacity {
                    PushOutcome::DroppedIncoming
                } else {
                    items.push_back(QueueItem::Event(event));
                    PushOutcome::Enqueued
                }
            }
            BackpressureMode::DropOldest => {
                let evicted = if items.len() >= self.capacity {
                    items.pop_front();
                    true
                } else {
                    false
                };
                items.push_back(QueueItem::Event(event));
                if evicted { PushOutcome::EvictedOldest } else { PushOutcome::Enqueued }
            }
            BackpressureMode::Slow => unreachable!("slow backpressure mode is rejected at configuration load"),
        };
        drop(items);
        self.not_empty.notify_one();
        outcome
    }

    /// Pushes a control item (`Flush`/`Close`), bypassing capacity: a
    /// worker must always be able to be told to flush or shut down.
    pub(crate) fn push_control(&self, item: QueueItem) {
        let mut items = self.items.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        items.push_back(item);
        drop(items);
        self.not_empty.notify_one();
    }

    /// Blocks until an item is available, then removes and returns it.
    pub(crate) fn pop(&self) -> QueueItem {
        let mut items = self.items.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        loop {
            if let Some(item) = items.pop_front() {
                return item;
            }
            items = self.not_empty.wait(items).unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "Test-only panic-based assertions are permitted.")]
mod tests {
    use super::*;
    use elspeth_core::identifiers::RunId;
    use time::OffsetDateTime;

    fn event() -> TelemetryEvent {
        TelemetryEvent::RunStarted {
            run_id: RunId::new("run-1"),
            canonical_version: "sha256-rfc8785-v1".to_string(),
            at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn drop_newest_rejects_once_full() {
        let queue = BoundedQueue::new(1);
        assert_eq!(queue.push_event(event(), BackpressureMode::DropNewest), PushOutcome::Enqueued);
        assert_eq!(queue.push_event(event(), BackpressureMode::DropNewest), PushOutcome::DroppedIncoming);
    }

    #[test]
    fn drop_oldest_evicts_to_make_room() {
        let queue = BoundedQueue::new(1);
        assert_eq!(queue.push_event(event(), BackpressureMode::DropOldest), PushOutcome::Enqueued);
        assert_eq!(queue.push_event(event(), BackpressureMode::DropOldest), PushOutcome::EvictedOldest);
        let QueueItem::Event(_) = queue.pop() else { panic!("expected an event") };
    }

    #[test]
    fn pop_blocks_until_push() {
        let queue = BoundedQueue::new(4);
        queue.push_event(event(), BackpressureMode::Block);
        let QueueItem::Event(_) = queue.pop() else { panic!("expected an event") };
    }
}
