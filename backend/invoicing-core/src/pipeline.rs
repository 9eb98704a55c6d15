// src/pipeline.rs

use chrono::NaiveDate;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::agileday_client::{ProjectMetadata, TimeSource};
use crate::aggregation::{
    data_span, projects_not_included, role_task_week_totals, task_week_totals, week_windows,
    Aggregator,
};
use crate::config::{RoleDirectory, WorkdayProfile, MISSING_RATES_FILE_NAME};
use crate::error::{io_context, InvoicingError};
use crate::fixed_fee::{
    fixed_fee_invoices, load_fixed_fee_configs, load_pass_through, write_fixed_fee_summary,
};
use crate::invoice::{
    encode_windows_1252, hour_invoices, render_transfer, sibling_with_suffix, write_atomic,
    write_transfer_file, InvoiceMonth, TransferBatch, TransferTotals,
};
use crate::rates::{FileRateGapReporter, RateGapReporter};
use crate::reference_data::{CustomerData, InternalRates};
use crate::reports::{
    log_project_summaries, project_summaries, render_invoicing_summary, render_utilization_summary,
    warn_projects_without_hours, write_errors, write_project_summaries, write_projects_not_found,
    write_projects_not_included, write_roles_csv, write_text, write_weekly_csv, FailedRecord,
    UtilizationTotals,
};
use crate::time_entry::{
    filter_by_date, normalize_all, parse_billable, read_raw_hours, write_raw_hours, RawTimeEntry,
};

// --- Stages ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    LoadConfig,
    LoadRates,
    ReadHours,
    Aggregate,
    GroupByInvoice,
    EmitLines,
    WriteOutput,
    WriteSummaries,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::LoadConfig => "LOAD_CONFIG",
            Stage::LoadRates => "LOAD_RATES",
            Stage::ReadHours => "READ_HOURS",
            Stage::Aggregate => "AGGREGATE",
            Stage::GroupByInvoice => "GROUP_BY_INVOICE",
            Stage::EmitLines => "EMIT_LINES",
            Stage::WriteOutput => "WRITE_OUTPUT",
            Stage::WriteSummaries => "WRITE_SUMMARIES",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running(Stage),
    Success,
    Failed(Stage),
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Idle => f.write_str("idle"),
            RunState::Running(stage) => write!(f, "running {}", stage),
            RunState::Success => f.write_str("succeeded"),
            RunState::Failed(stage) => write!(f, "failed in {}", stage),
        }
    }
}

struct StageTracker {
    state: RunState,
}

impl StageTracker {
    fn run<T>(
        &mut self,
        stage: Stage,
        step: impl FnOnce() -> Result<T, InvoicingError>,
    ) -> Result<T, InvoicingError> {
        info!("Stage {}", stage);
        self.state = RunState::Running(stage);
        step().map_err(|source| {
            error!("Stage {} failed: {}", stage, source);
            self.state = RunState::Failed(stage);
            InvoicingError::Stage {
                stage,
                source: Box::new(source),
            }
        })
    }
}

// --- Time-based invoicing ---

#[derive(Debug, Clone)]
pub enum HoursSource {
    /// A raw hours CSV from an earlier `fetch-hours` run.
    File(PathBuf),
    Entries(Vec<RawTimeEntry>),
}

#[derive(Debug, Clone)]
pub struct InvoicingRequest {
    pub customer_data: PathBuf,
    pub rates_file: PathBuf,
    pub hours: HoursSource,
    pub result_file: PathBuf,
    pub month: InvoiceMonth,
    pub invoicing_date: NaiveDate,
}

#[derive(Debug, Clone, Default)]
pub struct InvoicingOutcome {
    pub totals: TransferTotals,
    pub failed: Vec<FailedRecord>,
    pub projects_not_included: usize,
    pub summary_file: PathBuf,
}

pub struct InvoicingPipeline {
    internal_company: String,
    profile: WorkdayProfile,
    reporter: Arc<dyn RateGapReporter>,
    state: RunState,
}

impl InvoicingPipeline {
    pub fn new(
        internal_company: &str,
        profile: WorkdayProfile,
        reporter: Arc<dyn RateGapReporter>,
    ) -> Self {
        Self {
            internal_company: internal_company.to_string(),
            profile,
            reporter,
            state: RunState::Idle,
        }
    }

    /// A pipeline that appends rate gaps to `missing_from_rates.txt` in `output_dir`.
    pub fn with_file_reporter(
        internal_company: &str,
        profile: WorkdayProfile,
        output_dir: &Path,
    ) -> Self {
        let reporter = FileRateGapReporter::new(output_dir.join(MISSING_RATES_FILE_NAME));
        Self::new(internal_company, profile, Arc::new(reporter))
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn run(&mut self, request: &InvoicingRequest) -> Result<InvoicingOutcome, InvoicingError> {
        let mut tracker = StageTracker {
            state: RunState::Idle,
        };
        let result = self.run_stages(request, &mut tracker);
        self.state = match &result {
            Ok(_) => RunState::Success,
            Err(_) => tracker.state,
        };
        result
    }

    fn run_stages(
        &self,
        request: &InvoicingRequest,
        tracker: &mut StageTracker,
    ) -> Result<InvoicingOutcome, InvoicingError> {
        let customers = tracker.run(Stage::LoadConfig, || {
            CustomerData::load(&request.customer_data)
        })?;
        let rates = tracker.run(Stage::LoadRates, || InternalRates::load(&request.rates_file))?;
        let entries = tracker.run(Stage::ReadHours, || {
            let raw = match &request.hours {
                HoursSource::File(path) => read_raw_hours(path)?,
                HoursSource::Entries(entries) => entries.clone(),
            };
            Ok(normalize_all(&raw))
        })?;

        let (aggregation, not_included) = tracker.run(Stage::Aggregate, || {
            let aggregator = Aggregator::invoicing(
                &customers,
                &rates,
                self.reporter.as_ref(),
                &self.internal_company,
            );
            let aggregation = aggregator.aggregate(&entries);
            let invoiced: HashSet<String> = aggregation
                .lines
                .iter()
                .map(|l| l.project_id.clone())
                .collect();
            let not_included = projects_not_included(&entries, &invoiced, &self.internal_company);
            Ok((aggregation, not_included))
        })?;

        let batch = tracker.run(Stage::GroupByInvoice, || {
            Ok(TransferBatch::admit(hour_invoices(
                &aggregation.lines,
                &request.month,
                request.invoicing_date,
            )))
        })?;

        let bytes = tracker.run(Stage::EmitLines, || {
            let text = render_transfer(&batch, &self.profile);
            batch.totals.log();
            if let (Some(first), Some(last)) = (aggregation.first_day, aggregation.last_day) {
                info!("Hours period - First day: {}, Last day: {}", first, last);
            }
            Ok(encode_windows_1252(&text))
        })?;

        tracker.run(Stage::WriteOutput, || {
            write_atomic(&request.result_file, &bytes)?;
            info!("Successfully wrote result file: {}", request.result_file.display());
            Ok(())
        })?;

        let summary_file = tracker.run(Stage::WriteSummaries, || {
            let extension = request
                .result_file
                .extension()
                .map(|e| e.to_string_lossy().into_owned())
                .unwrap_or_else(|| "txt".to_string());
            let summary_file = sibling_with_suffix(&request.result_file, "_summary", &extension);
            let summary = render_invoicing_summary(
                &batch.invoices,
                &batch.totals,
                aggregation.first_day,
                aggregation.last_day,
            );
            write_text(&summary_file, &summary)?;
            info!("Wrote invoicing summary to {}", summary_file.display());
            write_projects_not_included(
                &sibling_with_suffix(&request.result_file, "_projects_not_included", "csv"),
                &not_included,
            )?;
            Ok(summary_file)
        })?;

        let mut failed: Vec<FailedRecord> = aggregation
            .failures
            .iter()
            .map(|f| FailedRecord::for_bucket(&f.project_id, &f.task, f.reason.clone()))
            .collect();
        failed.extend(rejected_records(&batch));

        Ok(InvoicingOutcome {
            totals: batch.totals,
            failed,
            projects_not_included: not_included.len(),
            summary_file,
        })
    }
}

fn rejected_records(batch: &TransferBatch) -> Vec<FailedRecord> {
    batch
        .rejected
        .iter()
        .flat_map(|invoice| invoice.rows.iter())
        .map(|row| {
            FailedRecord::for_bucket(
                &row.project_id,
                &row.task,
                "Invoice left out: transfer totals overflow",
            )
        })
        .collect()
}

// --- Fetch from AgileDay, then invoice ---

#[derive(Debug, Clone)]
pub struct FetchHoursRequest {
    pub output_dir: PathBuf,
    pub customer_data: PathBuf,
    pub rates_file: PathBuf,
    pub result_file_name: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub status: String,
    pub month: InvoiceMonth,
    pub invoicing_date: NaiveDate,
}

#[derive(Debug, Clone, Default)]
pub struct FetchHoursOutcome {
    pub fetched: usize,
    pub filtered: usize,
    pub invoicing: InvoicingOutcome,
    pub failed: Vec<FailedRecord>,
}

fn require_file(path: &Path, what: &str) -> Result<(), InvoicingError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(InvoicingError::InvalidInput(format!(
            "{} not found: {}",
            what,
            path.display()
        )))
    }
}

fn failed_for_entries<'a>(
    entries: impl IntoIterator<Item = &'a RawTimeEntry>,
    error: &str,
) -> Vec<FailedRecord> {
    let raw: Vec<RawTimeEntry> = entries.into_iter().cloned().collect();
    normalize_all(&raw)
        .iter()
        .map(|e| FailedRecord::for_entry(e, error))
        .collect()
}

/// Fetches entries and project metadata, writes the raw and filtered exports, then runs the
/// time-based pipeline on the billable entries. `errors.csv` lists every entry that failed.
pub async fn fetch_hours<S: TimeSource + ?Sized>(
    source: &S,
    request: &FetchHoursRequest,
    pipeline: &mut InvoicingPipeline,
) -> Result<FetchHoursOutcome, InvoicingError> {
    require_file(&request.customer_data, "Customer data file")?;
    require_file(&request.rates_file, "Rates file")?;
    fs::create_dir_all(&request.output_dir).map_err(|e| {
        io_context(
            e,
            format!("Failed to create output directory {}", request.output_dir.display()),
        )
    })?;
    let out = |name: &str| request.output_dir.join(name);

    let entries = source
        .fetch_entries(request.start, request.end, &request.status)
        .await?;
    write_raw_hours(&out("raw_hours.csv"), &entries)?;
    let external = entries
        .iter()
        .filter(|e| e.project_type.as_deref() == Some("External"))
        .count();
    let billable = entries
        .iter()
        .filter(|e| parse_billable(e.billable.as_deref()))
        .count();
    info!(
        "Raw data stats: {} total entries, {} external projects, {} billable entries",
        entries.len(),
        external,
        billable
    );

    let project_ids: BTreeSet<&str> = entries.iter().filter_map(RawTimeEntry::project_id).collect();
    info!("Found {} unique projects", project_ids.len());
    let mut projects: HashMap<&str, ProjectMetadata> = HashMap::new();
    let mut failed = Vec::new();
    for project_id in project_ids {
        match source.fetch_project(project_id).await {
            Ok(project) => {
                if project.id.as_deref().map_or(false, |id| id.trim() != project_id) {
                    warn!(
                        "AgileDay returned project {:?} when asked for {}",
                        project.id, project_id
                    );
                }
                debug!(
                    "Project {} ({}): type={:?}, company={:?}",
                    project_id,
                    project.name.as_deref().unwrap_or("unnamed"),
                    project.project_type,
                    project.company_name()
                );
                projects.insert(project_id, project);
            }
            Err(e) => {
                warn!("Failed to fetch project {}: {}", project_id, e);
                failed.extend(failed_for_entries(
                    entries.iter().filter(|en| en.project_id() == Some(project_id)),
                    &format!("Failed to fetch project data: {}", e),
                ));
            }
        }
    }

    let filtered: Vec<RawTimeEntry> = entries
        .iter()
        .filter(|e| {
            e.project_id().map_or(false, |id| projects.contains_key(id))
                && parse_billable(e.billable.as_deref())
        })
        .cloned()
        .collect();
    info!(
        "Filtered {} entries down to {} billable entries",
        entries.len(),
        filtered.len()
    );
    write_raw_hours(&out("filtered_hours.csv"), &filtered)?;

    let filtered_summaries = project_summaries(&normalize_all(&filtered));
    log_project_summaries(&filtered_summaries);
    write_project_summaries(&out("filtered_hours_summary.csv"), &filtered_summaries)?;
    info!("Processing complete summary for all projects");
    let complete = normalize_all(&entries);
    let complete_summaries = project_summaries(&complete);
    log_project_summaries(&complete_summaries);
    write_project_summaries(&out("complete_hours_summary.csv"), &complete_summaries)?;
    let idle = warn_projects_without_hours(&CustomerData::load(&request.customer_data)?, &complete);
    if !idle.is_empty() {
        info!("{} active projects have no hours in this period", idle.len());
    }

    let invoicing_request = InvoicingRequest {
        customer_data: request.customer_data.clone(),
        rates_file: request.rates_file.clone(),
        hours: HoursSource::Entries(filtered.clone()),
        result_file: out(&request.result_file_name),
        month: request.month,
        invoicing_date: request.invoicing_date,
    };
    let invoicing = match pipeline.run(&invoicing_request) {
        Ok(outcome) => {
            failed.extend(outcome.failed.iter().cloned());
            outcome
        }
        Err(e) => {
            failed.extend(failed_for_entries(
                entries.iter(),
                &format!("Failed during invoice transformation: {}", e),
            ));
            write_errors(&out("errors.csv"), &failed)?;
            return Err(e);
        }
    };

    if !failed.is_empty() {
        write_errors(&out("errors.csv"), &failed)?;
    }
    Ok(FetchHoursOutcome {
        fetched: entries.len(),
        filtered: filtered.len(),
        invoicing,
        failed,
    })
}

// --- Utilization ---

#[derive(Debug, Clone)]
pub struct UtilizationRequest {
    pub customer_data: PathBuf,
    pub hours: HoursSource,
    pub result_file: PathBuf,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default)]
pub struct UtilizationOutcome {
    pub totals: UtilizationTotals,
    pub projects_not_found: usize,
    pub weeks: usize,
}

pub fn run_utilization(
    request: &UtilizationRequest,
    internal_company: &str,
    roles: &RoleDirectory,
) -> Result<UtilizationOutcome, InvoicingError> {
    require_file(&request.customer_data, "Customer data file")?;
    let customers = CustomerData::load(&request.customer_data)?;
    let raw = match &request.hours {
        HoursSource::File(path) => {
            require_file(path, "Raw hours file")?;
            info!("Reading hours from file: {}", path.display());
            read_raw_hours(path)?
        }
        HoursSource::Entries(entries) => entries.clone(),
    };
    let raw = filter_by_date(raw, request.start, request.end);
    if raw.is_empty() {
        warn!("No time entries found for the specified period");
    }
    let entries = normalize_all(&raw);

    let aggregation = Aggregator::utilization(&customers, internal_company).aggregate(&entries);
    let filtered_period = request.start.zip(request.end);
    let data_period = aggregation.first_day.zip(aggregation.last_day);

    let summary = render_utilization_summary(&aggregation.lines, filtered_period, data_period);
    let summary_file = sibling_with_suffix(&request.result_file, "_summary", "txt");
    if let Some(parent) = summary_file.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| io_context(e, format!("Failed to create {}", parent.display())))?;
    }
    write_text(&summary_file, &summary)?;
    info!("Wrote utilization summary to {}", summary_file.display());

    let weeks = filtered_period
        .or_else(|| data_span(&aggregation.lines))
        .map(|(start, end)| week_windows(start, end))
        .unwrap_or_default();
    if weeks.is_empty() {
        warn!("No dates available, skipping weekly and role summaries");
    } else {
        write_weekly_csv(
            &sibling_with_suffix(&request.result_file, "_weekly", "csv"),
            &weeks,
            &task_week_totals(&aggregation.lines, &weeks),
        )?;
        write_roles_csv(
            &sibling_with_suffix(&request.result_file, "_roles", "csv"),
            &weeks,
            &role_task_week_totals(&aggregation.lines, &weeks, roles),
        )?;
    }
    write_projects_not_found(
        &sibling_with_suffix(&request.result_file, "_projects_not_found", "csv"),
        &aggregation.projects_not_found,
    )?;

    Ok(UtilizationOutcome {
        totals: UtilizationTotals::of(&aggregation.lines),
        projects_not_found: aggregation.projects_not_found.len(),
        weeks: weeks.len(),
    })
}

// --- Fixed fee ---

#[derive(Debug, Clone)]
pub struct FixedFeeRequest {
    pub config_file: PathBuf,
    pub pass_through_file: PathBuf,
    pub result_file: PathBuf,
    pub month: InvoiceMonth,
    pub invoicing_date: NaiveDate,
}

#[derive(Debug, Clone, Default)]
pub struct FixedFeeOutcome {
    pub totals: TransferTotals,
    pub failed: Vec<FailedRecord>,
}

pub fn run_fixed_fee(
    request: &FixedFeeRequest,
    profile: &WorkdayProfile,
) -> Result<FixedFeeOutcome, InvoicingError> {
    info!("Invoicing fixed fees for {}", request.month);
    let configs = load_fixed_fee_configs(&request.config_file)?;
    let pass_through = load_pass_through(&request.pass_through_file, &request.month)?;
    let batch = TransferBatch::admit(fixed_fee_invoices(
        &configs,
        &pass_through,
        &request.month,
        request.invoicing_date,
    ));
    write_transfer_file(&request.result_file, &batch, profile)?;
    batch.totals.log();
    write_fixed_fee_summary(
        &sibling_with_suffix(&request.result_file, "_summary", "csv"),
        &batch.invoices,
    )?;
    Ok(FixedFeeOutcome {
        totals: batch.totals,
        failed: rejected_records(&batch),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rates::MemoryRateGapReporter;
    use async_trait::async_trait;

    const CUSTOMERS: &str = "\
AgileDay_projectId,Active,Client,Service name,projectName,included_hours,hour_rates,Group invoice,Invoice Info A2 Ext Id,Account A2 Ext ID,Billable Description,Sales Item hours
p-1,yes,Acme Oy,Maintenance,Web,all,internal,,INV-1,ACC-1,Kehitys,SI-1
p-2,yes,Beta Ab,Support,Helpdesk,orangit,,,INV-2,ACC-2,Tuki,SI-2
p-3,yes,Gamma,Idle,Idle,all,,,INV-3,ACC-3,,
";

    fn raw(project: &str, task: &str, minutes: &str, company: &str) -> RawTimeEntry {
        RawTimeEntry::new(project, task)
            .with_project_name(project)
            .with_customer("Customer")
            .with_minutes(minutes)
            .with_billable("True")
            .with_company(company)
            .with_date("2025-03-10")
            .with_task_rate("90")
    }

    fn fixture(dir: &Path) -> (PathBuf, PathBuf) {
        let customers = dir.join("customers.csv");
        let rates = dir.join("rates.csv");
        fs::write(&customers, CUSTOMERS).unwrap();
        fs::write(&rates, "p-1,Dev,120\n").unwrap();
        (customers, rates)
    }

    fn request(dir: &Path, hours: HoursSource) -> InvoicingRequest {
        let (customer_data, rates_file) = fixture(dir);
        InvoicingRequest {
            customer_data,
            rates_file,
            hours,
            result_file: dir.join("out").join("invoices.csv"),
            month: InvoiceMonth::new(2025, 3).unwrap(),
            invoicing_date: NaiveDate::from_ymd_opt(2025, 4, 2).unwrap(),
        }
    }

    #[test]
    fn pipeline_writes_transfer_and_summaries() {
        let dir = tempfile::tempdir().unwrap();
        let hours = vec![
            raw("p-1", "Dev", "120", "OrangIT Oy"),
            raw("p-1", "Review", "60", "OrangIT Oy").with_task_rate(""),
            raw("p-2", "Tickets", "60", "OrangIT Oy"),
            raw("p-2", "Tickets", "600", "Subcontractor Ltd"),
            raw("p-9", "Dev", "60", "OrangIT Oy"),
        ];
        let reporter = Arc::new(MemoryRateGapReporter::new());
        let mut pipeline =
            InvoicingPipeline::new("OrangIT Oy", WorkdayProfile::default(), reporter.clone());
        let req = request(dir.path(), HoursSource::Entries(hours));
        let outcome = pipeline.run(&req).unwrap();

        assert_eq!(pipeline.state(), RunState::Success);
        // p-1 Dev 2h * 120, p-2 Tickets 1h * 90; p-1 Review is priced at zero and dropped.
        assert_eq!(outcome.totals.amount, rust_decimal_macros::dec!(330));
        assert_eq!(outcome.totals.invoices, 2);
        assert_eq!(outcome.totals.lines, 2);
        assert_eq!(outcome.projects_not_included, 1);
        assert!(outcome.failed.is_empty());
        // Review misses the table and has no source price.
        assert_eq!(reporter.gaps().len(), 2);

        let bytes = fs::read(&req.result_file).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains(";;;330.00;"));
        assert!(!crate::invoice::temp_sibling(&req.result_file).exists());
        assert!(outcome.summary_file.ends_with("invoices_summary.csv"));
        assert!(fs::read_to_string(&outcome.summary_file)
            .unwrap()
            .contains("Total number of invoices: 2"));
        let not_included =
            fs::read_to_string(dir.path().join("out").join("invoices_projects_not_included.csv")).unwrap();
        assert!(not_included.contains("p-9"));
    }

    #[test]
    fn overflowing_bucket_becomes_a_failed_record() {
        let dir = tempfile::tempdir().unwrap();
        let hours = vec![
            raw("p-1", "Dev", "120", "OrangIT Oy"),
            raw("p-2", "Tickets", "79228162514264337593543950335", "OrangIT Oy"),
        ];
        let mut pipeline = InvoicingPipeline::new(
            "OrangIT Oy",
            WorkdayProfile::default(),
            Arc::new(MemoryRateGapReporter::new()),
        );
        let req = request(dir.path(), HoursSource::Entries(hours));
        let outcome = pipeline.run(&req).unwrap();

        assert_eq!(pipeline.state(), RunState::Success);
        assert_eq!(outcome.totals.amount, rust_decimal_macros::dec!(240));
        assert_eq!(outcome.totals.invoices, 1);
        assert_eq!(outcome.failed.len(), 1);
        let failed = &outcome.failed[0];
        assert_eq!(failed.project_id, "p-2");
        assert_eq!(failed.project_task, "Tickets");
        assert!(failed.error.contains("overflow"), "{}", failed.error);
        assert!(req.result_file.is_file());
    }

    #[test]
    fn missing_customer_file_fails_before_any_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = request(dir.path(), HoursSource::Entries(Vec::new()));
        req.customer_data = dir.path().join("nope.csv");
        let mut pipeline = InvoicingPipeline::new(
            "OrangIT Oy",
            WorkdayProfile::default(),
            Arc::new(MemoryRateGapReporter::new()),
        );
        let err = pipeline.run(&req).unwrap_err();
        assert_eq!(err.stage(), Some(Stage::LoadConfig));
        assert_eq!(pipeline.state(), RunState::Failed(Stage::LoadConfig));
        assert!(!req.result_file.exists());
    }

    #[test]
    fn stage_names_are_screaming_snake_case() {
        assert_eq!(Stage::GroupByInvoice.to_string(), "GROUP_BY_INVOICE");
        assert_eq!(Stage::WriteSummaries.to_string(), "WRITE_SUMMARIES");
    }

    struct StubSource {
        entries: Vec<RawTimeEntry>,
    }

    #[async_trait]
    impl TimeSource for StubSource {
        async fn fetch_entries(
            &self,
            _start: NaiveDate,
            _end: NaiveDate,
            _status: &str,
        ) -> Result<Vec<RawTimeEntry>, InvoicingError> {
            Ok(self.entries.clone())
        }

        async fn fetch_project(&self, project_id: &str) -> Result<ProjectMetadata, InvoicingError> {
            if project_id == "p-broken" {
                return Err(InvoicingError::InvalidInput("boom".into()));
            }
            Ok(ProjectMetadata {
                id: Some(project_id.to_string()),
                ..ProjectMetadata::default()
            })
        }
    }

    #[tokio::test]
    async fn fetch_hours_records_failed_project_lookups() {
        let dir = tempfile::tempdir().unwrap();
        let (customer_data, rates_file) = fixture(dir.path());
        let source = StubSource {
            entries: vec![
                raw("p-1", "Dev", "60", "OrangIT Oy"),
                raw("p-1", "Dev", "60", "OrangIT Oy").with_billable("False"),
                raw("p-broken", "Dev", "60", "OrangIT Oy"),
            ],
        };
        let output_dir = dir.path().join("run");
        let request = FetchHoursRequest {
            output_dir: output_dir.clone(),
            customer_data,
            rates_file,
            result_file_name: "invoices.csv".into(),
            start: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2025, 3, 31).unwrap(),
            status: "Submitted".into(),
            month: InvoiceMonth::new(2025, 3).unwrap(),
            invoicing_date: NaiveDate::from_ymd_opt(2025, 4, 2).unwrap(),
        };
        let mut pipeline = InvoicingPipeline::with_file_reporter(
            "OrangIT Oy",
            WorkdayProfile::default(),
            &output_dir,
        );
        let outcome = fetch_hours(&source, &request, &mut pipeline).await.unwrap();

        assert_eq!(outcome.fetched, 3);
        assert_eq!(outcome.filtered, 1);
        assert_eq!(outcome.failed.len(), 1);
        for name in [
            "raw_hours.csv",
            "filtered_hours.csv",
            "filtered_hours_summary.csv",
            "complete_hours_summary.csv",
            "invoices.csv",
            "errors.csv",
        ] {
            assert!(output_dir.join(name).is_file(), "{} missing", name);
        }
        let errors = fs::read_to_string(output_dir.join("errors.csv")).unwrap();
        assert!(errors.contains("Failed to fetch project data"));
    }

    #[test]
    fn utilization_writes_summary_and_matrices() {
        let dir = tempfile::tempdir().unwrap();
        let (customer_data, _) = fixture(dir.path());
        let hours = vec![
            raw("p-1", "Dev", "120", "OrangIT Oy").with_employee("Anna", "anna@orangit.fi"),
            raw("p-9", "Dev", "60", "OrangIT Oy")
                .with_employee("Bob", "bob@orangit.fi")
                .with_date("2025-03-17"),
        ];
        let request = UtilizationRequest {
            customer_data,
            hours: HoursSource::Entries(hours),
            result_file: dir.path().join("utilization.csv"),
            start: None,
            end: None,
        };
        let roles = RoleDirectory::default().with_role("anna@orangit.fi", crate::config::Role::TeamLead);
        let outcome = run_utilization(&request, "OrangIT Oy", &roles).unwrap();

        assert_eq!(outcome.weeks, 2);
        assert_eq!(outcome.projects_not_found, 1);
        assert_eq!(outcome.totals.hours, rust_decimal_macros::dec!(3));

        let weekly = fs::read_to_string(dir.path().join("utilization_weekly.csv")).unwrap();
        assert_eq!(
            weekly.lines().collect::<Vec<_>>(),
            vec![
                "Task,2025-03-10 to 2025-03-16,2025-03-17 to 2025-03-23",
                "Dev,2.00,1.00",
            ]
        );
        let roles_csv = fs::read_to_string(dir.path().join("utilization_roles.csv")).unwrap();
        assert_eq!(
            roles_csv.lines().collect::<Vec<_>>(),
            vec![
                "Role,Task,2025-03-10 to 2025-03-16,2025-03-17 to 2025-03-23",
                "Team Lead,Dev,2.00,0.00",
                "Engineer,Dev,0.00,1.00",
            ]
        );
        assert!(dir.path().join("utilization_summary.txt").is_file());
        assert!(dir.path().join("utilization_projects_not_found.csv").is_file());
    }
}
