use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::bench::{BenchmarkError, BenchmarkRecorder, RunStats};
use crate::rpc::{CallId, Request, Response};
use crate::utils::EnvUtility;

#[derive(Debug, Clone, PartialEq)]
pub struct TrackerConfig {
    pub monitor_interval: Duration,
    pub cleanup_interval: Duration,
    pub default_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_secs(1),
            cleanup_interval: Duration::from_secs(60),
            default_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl TrackerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            monitor_interval: EnvUtility::duration_ms_or("NEURORPC_MONITOR_INTERVAL_MS", defaults.monitor_interval),
            cleanup_interval: EnvUtility::duration_ms_or("NEURORPC_CLEANUP_INTERVAL_MS", defaults.cleanup_interval),
            default_timeout: EnvUtility::duration_ms_or("NEURORPC_REQUEST_TIMEOUT_MS", defaults.default_timeout),
            shutdown_grace: defaults.shutdown_grace,
        }
    }
}

/// Monotonic counters. Only a restart resets them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub outgoing_requests_count: u64,
    pub incoming_requests_count: u64,
    pub outgoing_responses_count: u64,
    pub incoming_responses_count: u64,
    pub timed_out_requests: u64,
}

#[derive(Debug, Clone)]
pub struct PendingOutgoingCall {
    pub method: String,
    pub issued_at: Instant,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PendingIncomingCall {
    pub method: String,
    pub received_at: Instant,
}

#[derive(Debug, Clone)]
struct ResponseRecord {
    at: Instant,
    #[allow(dead_code)]
    success: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallSnapshot {
    pub id: CallId,
    pub method: String,
    pub elapsed: Duration,
}

/// Result of one sweep over the pending tables.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub timed_out: Vec<CallSnapshot>,
    pub pending_outgoing: Vec<CallSnapshot>,
    pub pending_incoming: Vec<CallSnapshot>,
}

pub type TimeoutCallback = Arc<dyn Fn(&[CallSnapshot]) -> anyhow::Result<()> + Send + Sync>;

#[derive(Default)]
struct TrackerState {
    outgoing_requests: HashMap<CallId, PendingOutgoingCall>,
    incoming_requests: HashMap<CallId, PendingIncomingCall>,
    outgoing_responses: HashMap<CallId, ResponseRecord>,
    incoming_responses: HashMap<CallId, ResponseRecord>,
    stats: Statistics,
    bench: BenchmarkRecorder,
}

struct MonitorHandle {
    stop_tx: Sender<()>,
    done_rx: Receiver<()>,
    thread: JoinHandle<()>,
}

/// Owns the pending-call tables. Every access goes through one lock.
pub struct CallTracker {
    config: TrackerConfig,
    state: Mutex<TrackerState>,
    monitor: Mutex<Option<MonitorHandle>>,
}

impl CallTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(TrackerState::default()),
            monitor: Mutex::new(None),
        }
    }

    pub fn shared(config: TrackerConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn track_outgoing_request(&self, request: &Request, timeout: Duration) {
        let Some(id) = request.call_id() else {
            debug!("Not tracking outgoing notification {}", request.method);
            return;
        };
        let mut state = self.state();
        if state.bench.is_active() {
            let size = request.to_wire().to_string().len();
            state.bench.record_request(&id, size);
        }
        let previous = state.outgoing_requests.insert(
            id.clone(),
            PendingOutgoingCall {
                method: request.method.clone(),
                issued_at: Instant::now(),
                timeout,
            },
        );
        if let Some(previous) = previous {
            warn!(
                "Request ID {} reused while {} call was still pending, replacing it",
                id, previous.method
            );
        }
        state.stats.outgoing_requests_count += 1;
    }

    pub fn track_incoming_request(&self, request: &Request) {
        let Some(id) = request.call_id() else {
            return;
        };
        let mut state = self.state();
        state.incoming_requests.insert(
            id,
            PendingIncomingCall {
                method: request.method.clone(),
                received_at: Instant::now(),
            },
        );
        state.stats.incoming_requests_count += 1;
    }

    pub fn track_outgoing_response(&self, id: &CallId, success: bool) {
        let mut state = self.state();
        state.incoming_requests.remove(id);
        state.outgoing_responses.insert(
            id.clone(),
            ResponseRecord {
                at: Instant::now(),
                success,
            },
        );
        state.stats.outgoing_responses_count += 1;
    }

    /// Closes the matching outgoing call. Returns false for ids that were never tracked.
    pub fn track_incoming_response(&self, response: &Response) -> bool {
        let id = response.call_id();
        let mut state = self.state();
        if state.outgoing_requests.remove(&id).is_none() {
            warn!("Received response for unknown request ID: {}", id);
            return false;
        }
        state.incoming_responses.insert(
            id.clone(),
            ResponseRecord {
                at: Instant::now(),
                success: !response.is_error(),
            },
        );
        state.stats.incoming_responses_count += 1;
        state.bench.record_response(&id, response.exec_time);
        true
    }

    /// Method name recorded when the outgoing call was tracked.
    pub fn outgoing_method(&self, id: &CallId) -> Option<String> {
        self.state()
            .outgoing_requests
            .get(id)
            .map(|call| call.method.clone())
    }

    pub fn set_exec_time(&self, id: &CallId, exec_time_us: i64) -> bool {
        self.state().bench.set_exec_time(id, exec_time_us)
    }

    pub fn pending_outgoing_count(&self) -> usize {
        self.state().outgoing_requests.len()
    }

    pub fn pending_incoming_count(&self) -> usize {
        self.state().incoming_requests.len()
    }

    pub fn get_statistics(&self) -> Statistics {
        self.state().stats.clone()
    }

    pub fn monitor_once(&self) -> SweepReport {
        self.monitor_at(Instant::now())
    }

    /// One sweep as seen at `now`. Timed-out calls are removed and counted once.
    pub fn monitor_at(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let mut state = self.state();

        for (id, call) in state.outgoing_requests.iter() {
            let snapshot = CallSnapshot {
                id: id.clone(),
                method: call.method.clone(),
                elapsed: now.saturating_duration_since(call.issued_at),
            };
            if snapshot.elapsed > call.timeout {
                report.timed_out.push(snapshot);
            } else {
                report.pending_outgoing.push(snapshot);
            }
        }
        for call in &report.timed_out {
            state.outgoing_requests.remove(&call.id);
            state.stats.timed_out_requests += 1;
            warn!(
                "Request {} ({}) timed out after {:.3}s",
                call.id,
                call.method,
                call.elapsed.as_secs_f64()
            );
        }
        report.pending_incoming = state
            .incoming_requests
            .iter()
            .map(|(id, call)| CallSnapshot {
                id: id.clone(),
                method: call.method.clone(),
                elapsed: now.saturating_duration_since(call.received_at),
            })
            .collect();
        report
    }

    pub fn clean_tracking_data(&self, max_age: Duration) -> usize {
        self.clean_tracking_data_at(Instant::now(), max_age)
    }

    /// Drops entries older than `max_age` from all four tables.
    pub fn clean_tracking_data_at(&self, now: Instant, max_age: Duration) -> usize {
        let mut state = self.state();
        let fresh = |at: Instant| now.saturating_duration_since(at) <= max_age;
        let before = state.outgoing_requests.len()
            + state.incoming_requests.len()
            + state.outgoing_responses.len()
            + state.incoming_responses.len();

        state.outgoing_requests.retain(|_, call| fresh(call.issued_at));
        state.incoming_requests.retain(|_, call| fresh(call.received_at));
        state.outgoing_responses.retain(|_, record| fresh(record.at));
        state.incoming_responses.retain(|_, record| fresh(record.at));

        let after = state.outgoing_requests.len()
            + state.incoming_requests.len()
            + state.outgoing_responses.len()
            + state.incoming_responses.len();
        before - after
    }

    pub fn start_benchmark(&self, id: Option<String>) -> String {
        self.state().bench.start_run(id)
    }

    pub fn stop_benchmark(&self, id: Option<&str>) -> Result<RunStats, BenchmarkError> {
        self.state().bench.stop_run(id)
    }

    pub fn benchmark_stats(&self, id: &str) -> Result<RunStats, BenchmarkError> {
        self.state().bench.run_stats(id)
    }

    pub fn export_benchmark(&self, path: impl AsRef<Path>) -> Result<(), BenchmarkError> {
        self.state().bench.export_json(path)
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Spawns the background sweep. Returns false if one is already running.
    pub fn start_monitoring(self: &Arc<Self>, callback: Option<TimeoutCallback>) -> bool {
        let mut monitor = self.monitor.lock().unwrap_or_else(PoisonError::into_inner);
        if monitor.is_some() {
            warn!("Call monitor is already running");
            return false;
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (done_tx, done_rx) = bounded::<()>(1);
        let tracker = Arc::downgrade(self);
        let interval = self.config.monitor_interval;
        let cleanup_interval = self.config.cleanup_interval;

        let spawned = thread::Builder::new()
            .name("call-monitor".to_string())
            .spawn(move || {
                monitor_loop(tracker, stop_rx, callback, interval, cleanup_interval);
                let _ = done_tx.send(());
            });

        match spawned {
            Ok(thread) => {
                *monitor = Some(MonitorHandle {
                    stop_tx,
                    done_rx,
                    thread,
                });
                info!("Call monitor started (interval {:?})", interval);
                true
            }
            Err(e) => {
                error!("Failed to spawn call monitor: {}", e);
                false
            }
        }
    }

    /// Signals the sweep to stop and waits up to the shutdown grace period.
    pub fn stop_monitoring(&self) -> bool {
        let handle = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return true;
        };

        let _ = handle.stop_tx.try_send(());
        match handle.done_rx.recv_timeout(self.config.shutdown_grace) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.thread.join().is_err() {
                    error!("Call monitor thread panicked");
                }
                info!("Call monitor stopped");
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Call monitor did not stop within {:?}, leaving it detached",
                    self.config.shutdown_grace
                );
                false
            }
        }
    }
}

impl Drop for CallTracker {
    fn drop(&mut self) {
        // may run on the monitor thread itself, so only signal
        if let Some(handle) = self
            .monitor
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = handle.stop_tx.try_send(());
        }
    }
}

fn monitor_loop(
    tracker: Weak<CallTracker>,
    stop_rx: Receiver<()>,
    callback: Option<TimeoutCallback>,
    interval: Duration,
    cleanup_interval: Duration,
) {
    let mut last_cleanup = Instant::now();
    loop {
        {
            let Some(tracker) = tracker.upgrade() else {
                debug!("Call tracker dropped, monitor exiting");
                break;
            };
            let report = tracker.monitor_once();
            if !report.timed_out.is_empty() {
                if let Some(callback) = &callback {
                    match catch_unwind(AssertUnwindSafe(|| callback(&report.timed_out))) {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => error!("Timeout callback failed: {:#}", e),
                        Err(_) => error!("Timeout callback panicked"),
                    }
                }
            }
            if last_cleanup.elapsed() >= cleanup_interval {
                let removed = tracker.clean_tracking_data(cleanup_interval);
                if removed > 0 {
                    debug!("Cleaned {} stale tracking entries", removed);
                }
                last_cleanup = Instant::now();
            }
        }

        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
