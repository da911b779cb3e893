// crates/elspeth-telemetry/src/dispatcher.rs
// ============================================================================
// Module: ELSPETH Telemetry Dispatcher
// Description: Non-blocking fan-out of events to registered exporters,
//              each driven by its own worker thread (C10, §6.5, §9).
// ============================================================================

//! ## Overview
//! [`TelemetryDispatcher`] owns one [`crate::queue::BoundedQueue`] and one
//! worker thread per registered exporter. `dispatch` never runs exporter
//! code itself: it only enqueues, so a slow or wedged exporter cannot stall
//! the orchestrator's row loop, and a panicking exporter cannot take down
//! the run (the affected queue simply stops draining; `flush`/`shutdown`
//! against it surface [`TelemetryError::WorkerGone`]).
//!
//! The orchestrator is responsible for the ordering guarantee in §9
//! ("the orchestrator must not emit events when a recorder write
//! failed"): this dispatcher trusts every event handed to it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::thread;
use std::thread::JoinHandle;

use crate::config::DispatcherConfig;
use crate::error::TelemetryError;
use crate::event::TelemetryEvent;
use crate::exporter::TelemetryExporter;
use crate::queue::BoundedQueue;
use crate::queue::QueueItem;

struct ExporterHandle {
    queue: Arc<BoundedQueue>,
    consecutive_failures: Arc<AtomicU32>,
    disabled: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

/// Fans typed lifecycle events out to every registered, still-enabled
/// exporter (§6.5).
pub struct TelemetryDispatcher {
    config: DispatcherConfig,
    exporters: HashMap<String, ExporterHandle>,
}

impl TelemetryDispatcher {
    /// Builds a dispatcher from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns whatever [`DispatcherConfig::validate`] returns.
    pub fn new(config: DispatcherConfig) -> Result<Self, TelemetryError> {
        config.validate()?;
        Ok(Self { config, exporters: HashMap::new() })
    }

    /// Registers `exporter` under `name` and spawns its worker thread.
    /// `opts` is passed to `TelemetryExporter::configure` before the
    /// worker begins consuming events.
    ///
    /// # Errors
    ///
    /// Returns whatever `exporter.configure(opts)` returns; the
    /// exporter is not registered if configuration fails.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        mut exporter: Box<dyn TelemetryExporter>,
        opts: &serde_json::Value,
    ) -> Result<(), TelemetryError> {
        let name = name.into();
        exporter.configure(opts)?;

        let queue = Arc::new(BoundedQueue::new(self.config.queue_capacity));
        let consecutive_failures = Arc::new(AtomicU32::new(0));
        let disabled = Arc::new(AtomicBool::new(false));
        let max_consecutive_failures = self.config.max_consecutive_failures;

        let worker_queue = Arc::clone(&queue);
        let worker_failures = Arc::clone(&consecutive_failures);
        let worker_disabled = Arc::clone(&disabled);
        let worker = thread::spawn(move || {
            run_worker(&worker_queue, exporter.as_mut(), &worker_failures, &worker_disabled, max_consecutive_failures);
        });

        self.exporters.insert(
            name,
            ExporterHandle { queue, consecutive_failures, disabled, worker: Some(worker) },
        );
        Ok(())
    }

    /// Enqueues `event` for every enabled exporter whose granularity
    /// threshold the event meets. A no-op when the dispatcher is
    /// disabled.
    pub fn dispatch(&self, event: TelemetryEvent) {
        if !self.config.enabled || event.granularity() < self.config.granularity {
            return;
        }
        for handle in self.exporters.values() {
            if handle.disabled.load(Ordering::Acquire) {
                continue;
            }
            handle.queue.push_event(event.clone(), self.config.backpressure_mode);
        }
    }

    /// Whether every registered exporter has been disabled by
    /// consecutive failures, and the dispatcher is configured to fail
    /// the run in that case (§6.5: "if all exporters fail and
    /// `fail_on_total_exporter_failure` is true the run transitions to
    /// FAILED at the next event").
    #[must_use]
    pub fn should_abort(&self) -> bool {
        self.config.fail_on_total_exporter_failure
            && !self.exporters.is_empty()
            && self.exporters.values().all(|handle| handle.disabled.load(Ordering::Acquire))
    }

    /// Requests every exporter flush its buffered events and waits for
    /// each to acknowledge.
    ///
    /// # Errors
    ///
    /// Returns the first [`TelemetryError`] reported by any exporter's
    /// flush, or [`TelemetryError::WorkerGone`] if a worker's reply
    /// channel was dropped (its thread has exited).
    pub fn flush(&self) -> Result<(), TelemetryError> {
        for (name, handle) in &self.exporters {
            let (reply_tx, reply_rx) = mpsc::channel();
            handle.queue.push_control(QueueItem::Flush(reply_tx));
            reply_rx.recv().map_err(|_| TelemetryError::WorkerGone(name.clone()))??;
        }
        Ok(())
    }

    /// Signals every worker to close its exporter, then joins each
    /// thread. Consumes the dispatcher: once shut down it cannot be
    /// reused.
    pub fn shutdown(mut self) {
        for handle in self.exporters.values() {
            handle.queue.push_control(QueueItem::Close);
        }
        for handle in self.exporters.values_mut() {
            if let Some(worker) = handle.worker.take() {
                let _ = worker.join();
            }
        }
    }
}

fn run_worker(
    queue: &BoundedQueue,
    exporter: &mut dyn TelemetryExporter,
    consecutive_failures: &AtomicU32,
    disabled: &AtomicBool,
    max_consecutive_failures: u32,
) {
    loop {
        match queue.pop() {
            QueueItem::Event(event) => {
                if disabled.load(Ordering::Acquire) {
                    continue;
                }
                match exporter.export(&event) {
                    Ok(()) => consecutive_failures.store(0, Ordering::Release),
                    Err(_) => {
                        let failures = consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                        if failures >= max_consecutive_failures {
                            disabled.store(true, Ordering::Release);
                        }
                    }
                }
            }
            QueueItem::Flush(reply) => {
                let result = if disabled.load(Ordering::Acquire) { Ok(()) } else { exporter.flush() };
                let _ = reply.send(result);
            }
            QueueItem::Close => {
                let _ = exporter.close();
                break;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "Test-only panic-based assertions are permitted.")]
mod tests {
    use std::sync::Mutex;

    use elspeth_core::identifiers::RunId;
    use time::OffsetDateTime;

    use super::*;
    use crate::config::BackpressureMode;
    use crate::config::Granularity;

    fn event() -> TelemetryEvent {
        TelemetryEvent::RunStarted {
            run_id: RunId::new("run-1"),
            canonical_version: "sha256-rfc8785-v1".to_string(),
            at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    fn config() -> DispatcherConfig {
        DispatcherConfig {
            enabled: true,
            granularity: Granularity::Lifecycle,
            backpressure_mode: BackpressureMode::Block,
            queue_capacity: 8,
            max_consecutive_failures: 3,
            fail_on_total_exporter_failure: true,
        }
    }

    struct RecordingExporter {
        sink: Arc<Mutex<Vec<TelemetryEvent>>>,
        fail: bool,
    }

    impl TelemetryExporter for RecordingExporter {
        fn configure(&mut self, _opts: &serde_json::Value) -> Result<(), TelemetryError> {
            Ok(())
        }

        fn export(&mut self, event: &TelemetryEvent) -> Result<(), TelemetryError> {
            if self.fail {
                return Err(TelemetryError::ExportFailed { exporter: "recording".to_string(), reason: "forced".to_string() });
            }
            self.sink.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(event.clone());
            Ok(())
        }

        fn flush(&mut self) -> Result<(), TelemetryError> {
            Ok(())
        }

        fn close(&mut self) -> Result<(), TelemetryError> {
            Ok(())
        }
    }

    #[test]
    fn dispatch_delivers_events_to_registered_exporter() {
        let mut dispatcher = TelemetryDispatcher::new(config()).unwrap();
        let sink = Arc::new(Mutex::new(Vec::new()));
        dispatcher
            .register("recording", Box::new(RecordingExporter { sink: Arc::clone(&sink), fail: false }), &serde_json::json!({}))
            .unwrap();

        dispatcher.dispatch(event());
        dispatcher.flush().unwrap();

        assert_eq!(sink.lock().unwrap().len(), 1);
        dispatcher.shutdown();
    }

    #[test]
    fn exporter_disables_after_max_consecutive_failures_and_aborts_run() {
        let mut dispatcher = TelemetryDispatcher::new(config()).unwrap();
        let sink = Arc::new(Mutex::new(Vec::new()));
        dispatcher
            .register("recording", Box::new(RecordingExporter { sink, fail: true }), &serde_json::json!({}))
            .unwrap();

        for _ in 0..3 {
            dispatcher.dispatch(event());
        }
        dispatcher.flush().unwrap();

        assert!(dispatcher.should_abort());
        dispatcher.shutdown();
    }

    #[test]
    fn rejects_slow_backpressure_mode_at_construction() {
        let mut cfg = config();
        cfg.backpressure_mode = BackpressureMode::Slow;
        let error = TelemetryDispatcher::new(cfg).unwrap_err();
        assert_eq!(error, TelemetryError::UnimplementedBackpressureMode(BackpressureMode::Slow));
    }
}
