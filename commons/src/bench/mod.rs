use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

use crate::rpc::CallId;
use crate::utils::TimeUtility;

#[derive(Error, Debug)]
pub enum BenchmarkError {
    #[error("Unknown benchmark run: {0}")]
    UnknownRun(String),
    #[error("No benchmark run is active")]
    NoActiveRun,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One request/response pair observed during a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub request_ts_us: u64,
    pub payload_size: usize,
    pub response_ts_us: Option<u64>,
    pub exec_time_ms: Option<f64>,
    pub total_latency_ms: Option<f64>,
    pub network_latency_ms: Option<f64>,
}

impl Sample {
    fn complete(&mut self, response_ts_us: u64, exec_time_us: Option<i64>) {
        self.response_ts_us = Some(response_ts_us);
        self.total_latency_ms = Some(response_ts_us.saturating_sub(self.request_ts_us) as f64 / 1000.0);
        if let Some(exec) = exec_time_us {
            self.exec_time_ms = Some(exec as f64 / 1000.0);
        }
        self.update_network();
    }

    fn update_network(&mut self) {
        if let (Some(total), Some(exec)) = (self.total_latency_ms, self.exec_time_ms) {
            self.network_latency_ms = Some((total - exec).abs());
        }
    }

    pub fn is_complete(&self) -> bool {
        self.response_ts_us.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkRun {
    pub id: String,
    pub start_ts_us: u64,
    pub end_ts_us: Option<u64>,
    pub samples: BTreeMap<CallId, Sample>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub run_id: String,
    pub duration_ms: f64,
    pub total_samples: usize,
    pub completed: usize,
    pub pending: usize,
    pub avg_payload_size: f64,
    pub avg_total_latency_ms: f64,
    pub avg_exec_time_ms: f64,
    pub avg_network_latency_ms: f64,
}

fn average<I: Iterator<Item = f64>>(values: I) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

impl BenchmarkRun {
    fn new(id: String, start_ts_us: u64) -> Self {
        Self {
            id,
            start_ts_us,
            end_ts_us: None,
            samples: BTreeMap::new(),
        }
    }

    pub fn stats(&self) -> RunStats {
        let end = self.end_ts_us.unwrap_or_else(TimeUtility::get_timestamp_us);
        let completed: Vec<&Sample> = self.samples.values().filter(|s| s.is_complete()).collect();
        RunStats {
            run_id: self.id.clone(),
            duration_ms: end.saturating_sub(self.start_ts_us) as f64 / 1000.0,
            total_samples: self.samples.len(),
            completed: completed.len(),
            pending: self.samples.len() - completed.len(),
            avg_payload_size: average(self.samples.values().map(|s| s.payload_size as f64)),
            avg_total_latency_ms: average(completed.iter().filter_map(|s| s.total_latency_ms)),
            avg_exec_time_ms: average(completed.iter().filter_map(|s| s.exec_time_ms)),
            avg_network_latency_ms: average(completed.iter().filter_map(|s| s.network_latency_ms)),
        }
    }
}

/// Latency recorder that splits round trips into peer execution time and network time.
#[derive(Debug, Default)]
pub struct BenchmarkRecorder {
    runs: BTreeMap<String, BenchmarkRun>,
    active: Option<String>,
}

impl BenchmarkRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_run(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Starts a run and makes it the active one. A run that was active is finished first.
    pub fn start_run(&mut self, id: Option<String>) -> String {
        if let Some(previous) = self.active.take() {
            info!("Finishing benchmark run {} before starting a new one", previous);
            if let Some(run) = self.runs.get_mut(&previous) {
                run.end_ts_us = Some(TimeUtility::get_timestamp_us());
            }
        }
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        self.runs
            .insert(id.clone(), BenchmarkRun::new(id.clone(), TimeUtility::get_timestamp_us()));
        self.active = Some(id.clone());
        debug!("Benchmark run {} started", id);
        id
    }

    pub fn stop_run(&mut self, id: Option<&str>) -> Result<RunStats, BenchmarkError> {
        let id = match id {
            Some(id) => id.to_string(),
            None => self.active.clone().ok_or(BenchmarkError::NoActiveRun)?,
        };
        let run = self
            .runs
            .get_mut(&id)
            .ok_or_else(|| BenchmarkError::UnknownRun(id.clone()))?;
        if run.end_ts_us.is_none() {
            run.end_ts_us = Some(TimeUtility::get_timestamp_us());
        }
        if self.active.as_deref() == Some(id.as_str()) {
            self.active = None;
        }
        let stats = run.stats();
        debug!("Benchmark run {} stopped: {:?}", id, stats);
        Ok(stats)
    }

    pub fn run(&self, id: &str) -> Option<&BenchmarkRun> {
        self.runs.get(id)
    }

    pub fn run_stats(&self, id: &str) -> Result<RunStats, BenchmarkError> {
        self.runs
            .get(id)
            .map(BenchmarkRun::stats)
            .ok_or_else(|| BenchmarkError::UnknownRun(id.to_string()))
    }

    pub fn run_ids(&self) -> Vec<String> {
        self.runs.keys().cloned().collect()
    }

    pub fn record_request(&mut self, call_id: &CallId, payload_size: usize) {
        self.record_request_at(call_id, payload_size, TimeUtility::get_timestamp_us());
    }

    fn record_request_at(&mut self, call_id: &CallId, payload_size: usize, now_us: u64) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        if let Some(run) = self.runs.get_mut(active) {
            run.samples.insert(
                call_id.clone(),
                Sample {
                    request_ts_us: now_us,
                    payload_size,
                    ..Sample::default()
                },
            );
        }
    }

    pub fn record_response(&mut self, call_id: &CallId, exec_time_us: Option<i64>) -> bool {
        self.record_response_at(call_id, exec_time_us, TimeUtility::get_timestamp_us())
    }

    fn record_response_at(&mut self, call_id: &CallId, exec_time_us: Option<i64>, now_us: u64) -> bool {
        match self.sample_mut(call_id) {
            Some(sample) => {
                sample.complete(now_us, exec_time_us);
                true
            }
            None => false,
        }
    }

    /// Overrides the peer execution time of a sample, in the peer's microseconds.
    pub fn set_exec_time(&mut self, call_id: &CallId, exec_time_us: i64) -> bool {
        match self.sample_mut(call_id) {
            Some(sample) => {
                sample.exec_time_ms = Some(exec_time_us as f64 / 1000.0);
                sample.update_network();
                true
            }
            None => {
                warn!("No benchmark sample for call {}", call_id);
                false
            }
        }
    }

    fn sample_mut(&mut self, call_id: &CallId) -> Option<&mut Sample> {
        // the active run first, then any other run still holding the call
        let active = self.active.clone();
        if let Some(active) = active {
            if self
                .runs
                .get(&active)
                .map_or(false, |run| run.samples.contains_key(call_id))
            {
                return self.runs.get_mut(&active).and_then(|run| run.samples.get_mut(call_id));
            }
        }
        self.runs
            .values_mut()
            .find_map(|run| run.samples.get_mut(call_id))
    }

    pub fn export_json(&self, path: impl AsRef<Path>) -> Result<(), BenchmarkError> {
        let mut runs: Vec<&BenchmarkRun> = self.runs.values().collect();
        runs.sort_by_key(|run| run.start_ts_us);
        let writer = BufWriter::new(File::create(path.as_ref())?);
        serde_json::to_writer_pretty(writer, &runs)?;
        info!("Exported {} benchmark runs to {}", runs.len(), path.as_ref().display());
        Ok(())
    }

    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, BenchmarkError> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let runs: Vec<BenchmarkRun> = serde_json::from_reader(reader)?;
        Ok(Self {
            runs: runs.into_iter().map(|run| (run.id.clone(), run)).collect(),
            active: None,
        })
    }
}
