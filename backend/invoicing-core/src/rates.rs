// src/rates.rs

use rust_decimal::Decimal;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
#[cfg(test)]
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{error, warn};

use crate::reference_data::{HourRatePolicy, InternalRates, ProjectBillingConfig};
use crate::time_entry::NormalizedEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateGapKind {
    /// The project bills internal rates but the table has no row for the task.
    InternalRateMissing,
    /// No usable source rate either, so the task is priced at zero.
    NoHourlyRate,
}

/// A hole in the rate data that an operator should fill in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateGap {
    pub kind: RateGapKind,
    pub client: String,
    pub service: String,
    pub task: String,
    pub project_id: String,
}

impl fmt::Display for RateGap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.kind {
            RateGapKind::InternalRateMissing => "Internal rate not found",
            RateGapKind::NoHourlyRate => "No hourly rate found",
        };
        write!(
            f,
            "{} - Client: {}, Service: {}, Task: {}, Project ID: {}",
            prefix, self.client, self.service, self.task, self.project_id
        )
    }
}

pub trait RateGapReporter: Send + Sync {
    fn report(&self, gap: &RateGap);
}

/// Appends one line per gap to `missing_from_rates.txt`. The file is never truncated,
/// so gaps accumulate across runs.
#[derive(Debug, Clone)]
pub struct FileRateGapReporter {
    path: PathBuf,
}

impl FileRateGapReporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RateGapReporter for FileRateGapReporter {
    fn report(&self, gap: &RateGap) {
        warn!("{}", gap);
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| writeln!(file, "{}", gap));
        if let Err(e) = result {
            error!("Failed to write to {}: {}", self.path.display(), e);
        }
    }
}

/// Collects gaps in memory.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct MemoryRateGapReporter {
    gaps: Arc<Mutex<Vec<RateGap>>>,
}

#[cfg(test)]
impl MemoryRateGapReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gaps(&self) -> MutexGuard<'_, Vec<RateGap>> {
        self.gaps.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
impl RateGapReporter for MemoryRateGapReporter {
    fn report(&self, gap: &RateGap) {
        tracing::debug!("Rate gap recorded: {}", gap);
        self.gaps().push(gap.clone());
    }
}

/// Picks the hourly rate for an entry of `project_id`.
///
/// Internal-rate projects use the `(project, task)` table row when there is one.
/// Otherwise the entry's own task price is used, and zero when that is missing too.
/// Every table miss and every fall to zero is reported.
pub fn resolve_rate(
    entry: &NormalizedEntry,
    project_id: &str,
    config: &ProjectBillingConfig,
    internal_rates: &InternalRates,
    reporter: &dyn RateGapReporter,
) -> Decimal {
    let gap = |kind| RateGap {
        kind,
        client: config.client_label().to_string(),
        service: config.service_label().to_string(),
        task: entry.task.clone(),
        project_id: project_id.to_string(),
    };

    if config.hour_rate_policy() == HourRatePolicy::Internal {
        if let Some(rate) = internal_rates.get(project_id, &entry.task) {
            return rate;
        }
        reporter.report(&gap(RateGapKind::InternalRateMissing));
    }

    match entry.task_rate {
        Some(rate) => rate,
        None => {
            reporter.report(&gap(RateGapKind::NoHourlyRate));
            Decimal::ZERO
        }
    }
}
