use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::time::{Duration, Instant};

/// Counters and phase timings for one command run
#[derive(Debug, Serialize)]
pub struct RunMetrics {
    #[serde(skip)]
    start_time: Instant,
    pub rows_read: usize,
    pub models: usize,
    pub step_durations_ms: BTreeMap<String, u64>,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            rows_read: 0,
            models: 0,
            step_durations_ms: BTreeMap::new(),
        }
    }

    pub fn record_step(&mut self, step_name: &str, duration: Duration) {
        self.step_durations_ms
            .insert(step_name.to_string(), duration.as_millis() as u64);
    }

    /// Run `f` and record its wall time under `step_name`
    pub fn time<T>(&mut self, step_name: &str, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let out = f();
        self.record_step(step_name, start.elapsed());
        out
    }

    pub fn total_duration(&self) -> Duration {
        self.start_time.elapsed()
    }
}

impl Default for RunMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a model artifact came from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lineage {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub inputs: Vec<InputFileStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputFileStats {
    pub path: String,
    pub hash: String, // SHA256 hex
    pub size_bytes: u64,
}

impl InputFileStats {
    pub fn capture<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        Ok(Self {
            path: path.display().to_string(),
            hash: compute_file_hash(path)?,
            size_bytes: std::fs::metadata(path)?.len(),
        })
    }
}

impl Lineage {
    pub fn capture<P: AsRef<Path>>(run_id: &str, inputs: &[P]) -> io::Result<Self> {
        Ok(Self {
            run_id: run_id.to_string(),
            timestamp: Utc::now(),
            inputs: inputs
                .iter()
                .map(InputFileStats::capture)
                .collect::<io::Result<Vec<_>>>()?,
        })
    }
}

pub fn compute_file_hash<P: AsRef<Path>>(path: P) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0; 8192];

    loop {
        let count = file.read(&mut buffer)?;
        if count == 0 {
            break;
        }
        hasher.update(&buffer[..count]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}
