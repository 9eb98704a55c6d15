// src/reports.rs

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::aggregation::{
    checked_sum, AggregatedLine, ProjectNotFound, ProjectNotIncluded, WeekWindow,
};
use crate::config::Role;
use crate::error::{csv_context, io_context, InvoicingError};
use crate::invoice::{format_amount, group_by_first_seen, Invoice, TransferTotals};
use crate::reference_data::CustomerData;
use crate::time_entry::NormalizedEntry;

const HEAVY_RULE: &str = "================================================================================";
const LIGHT_RULE: &str = "--------------------------------------------------------------------------------";

fn date_str(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub fn write_text(path: &Path, text: &str) -> Result<(), InvoicingError> {
    fs::write(path, text).map_err(|e| io_context(e, format!("Failed to write {}", path.display())))
}

fn csv_writer(path: &Path) -> Result<csv::Writer<fs::File>, InvoicingError> {
    csv::Writer::from_path(path)
        .map_err(|e| csv_context(e, format!("Failed to create {}", path.display())))
}

fn finish(mut writer: csv::Writer<fs::File>, path: &Path) -> Result<(), InvoicingError> {
    writer
        .flush()
        .map_err(|e| io_context(e, format!("Failed to flush {}", path.display())))
}

// --- Invoicing summary ---

/// Per-invoice blocks of service/task totals, then the overall totals.
pub fn render_invoicing_summary(
    invoices: &[Invoice],
    totals: &TransferTotals,
    first_day: Option<NaiveDate>,
    last_day: Option<NaiveDate>,
) -> String {
    let mut out = String::new();
    for invoice in invoices {
        let Some(first_row) = invoice.rows.first() else {
            continue;
        };
        out.push_str(&format!("Customer: {}\n{}\n", first_row.customer_name, LIGHT_RULE));

        let blocks = group_by_first_seen(invoice.rows.iter(), |row| {
            format!("{}\u{0}{}", row.service_name, row.task)
        });
        let mut customer_total = Decimal::ZERO;
        for (_, rows) in &blocks {
            let head = rows[0];
            let hours = checked_sum(rows.iter().map(|r| r.quantity.value()));
            let amount = checked_sum(rows.iter().map(|r| r.amount));
            let (Some(hours), Some(amount), Some(total)) = (
                hours,
                amount,
                amount.and_then(|a| customer_total.checked_add(a)),
            ) else {
                warn!(
                    "Totals of {} / {} overflow, block left out of the summary",
                    head.service_name, head.task
                );
                continue;
            };
            customer_total = total;
            out.push_str(&format!(
                "Service: {}\nTask: {}\nHours: {}\nRate: {}\nAmount: {}\n\n",
                head.service_name,
                head.task,
                format_amount(hours),
                format_amount(head.unit_price),
                format_amount(amount)
            ));
        }
        out.push_str(&format!(
            "Total for {}: {} ({} lines)\n{}\n\n",
            first_row.customer_name,
            format_amount(customer_total),
            invoice.rows.len(),
            HEAVY_RULE
        ));
    }

    out.push_str(&format!("\nOVERALL SUMMARY\n{}\n", HEAVY_RULE));
    out.push_str(&format!("Total number of invoices: {}\n", totals.invoices));
    out.push_str(&format!("Total number of invoice lines: {}\n", totals.lines));
    out.push_str(&format!(
        "Total amount across all invoices: {}\n",
        format_amount(totals.amount)
    ));
    if let (Some(first), Some(last)) = (first_day, last_day) {
        out.push_str(&format!("First day of hours: {}\n", date_str(first)));
        out.push_str(&format!("Last day of hours: {}\n", date_str(last)));
    }
    out.push_str(HEAVY_RULE);
    out.push('\n');
    out
}

// --- Utilization summary ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UtilizationTotals {
    pub hours: Decimal,
    pub billable_hours: Decimal,
    pub euro: Decimal,
    pub billable_euro: Decimal,
}

impl UtilizationTotals {
    /// Totals of `lines`. A line that would overflow them is left out with a warning.
    pub fn of<'a, 'b: 'a>(lines: impl IntoIterator<Item = &'a AggregatedLine<'b>>) -> Self {
        lines.into_iter().fold(Self::default(), |acc, line| {
            match acc.checked_add(line) {
                Some(next) => next,
                None => {
                    warn!(
                        "Utilization totals overflow, task '{}' of project {} left out",
                        line.task, line.project_id
                    );
                    acc
                }
            }
        })
    }

    fn checked_add(&self, line: &AggregatedLine<'_>) -> Option<Self> {
        Some(Self {
            hours: self.hours.checked_add(line.hours)?,
            billable_hours: self.billable_hours.checked_add(line.billable_hours)?,
            euro: self.euro.checked_add(line.amount)?,
            billable_euro: self.billable_euro.checked_add(line.billable_amount)?,
        })
    }

    pub fn billable_percentage(&self) -> Decimal {
        if self.hours > Decimal::ZERO {
            self.billable_hours
                .checked_div(self.hours)
                .and_then(|share| share.checked_mul(Decimal::ONE_HUNDRED))
                .unwrap_or(Decimal::ZERO)
        } else {
            Decimal::ZERO
        }
    }

    fn render(&self) -> String {
        format!(
            "Total Hours: {}\nBillable Hours: {}\nNon-Billable Hours: {}\nBillable Percentage: {}%\nTotal Euro Amount: {} €\nBillable Euro Amount: {} €\nNon-Billable Euro Amount: {} €\n",
            format_amount(self.hours),
            format_amount(self.billable_hours),
            format_amount(self.hours.saturating_sub(self.billable_hours)),
            format_amount(self.billable_percentage()),
            format_amount(self.euro),
            format_amount(self.billable_euro),
            format_amount(self.euro.saturating_sub(self.billable_euro))
        )
    }
}

pub fn render_utilization_summary(
    lines: &[AggregatedLine<'_>],
    filtered_period: Option<(NaiveDate, NaiveDate)>,
    data_period: Option<(NaiveDate, NaiveDate)>,
) -> String {
    let mut out = format!("PERIOD INFORMATION\n{}\n", HEAVY_RULE);
    if let Some((start, end)) = filtered_period {
        out.push_str(&format!("Filtered period: {} to {}\n", date_str(start), date_str(end)));
    }
    if let Some((first, last)) = data_period {
        out.push_str(&format!("Data period: {} to {}\n", date_str(first), date_str(last)));
    }
    out.push_str(&format!("{}\n\n", HEAVY_RULE));

    let mut by_task: BTreeMap<&str, Vec<&AggregatedLine<'_>>> = BTreeMap::new();
    for line in lines {
        by_task.entry(line.task.as_str()).or_default().push(line);
    }
    for (task, mut task_lines) in by_task {
        out.push_str(&format!("Task: {}\n{}\n", task, LIGHT_RULE));
        out.push_str(&UtilizationTotals::of(task_lines.iter().copied()).render());
        out.push_str("\nProjects:\n");
        task_lines.sort_by(|a, b| {
            (a.client_label(), a.project_name.as_str()).cmp(&(b.client_label(), b.project_name.as_str()))
        });
        for line in task_lines {
            out.push_str(&format!(
                "  {} - {}: {} hours{} @ {} €/h = {} €\n",
                line.client_label(),
                line.project_name,
                format_amount(line.hours),
                if line.is_billable() { " (Billable)" } else { "" },
                format_amount(line.rate),
                format_amount(line.amount)
            ));
        }
        out.push('\n');
    }

    let overall = UtilizationTotals::of(lines);
    out.push_str(&format!("\nOVERALL SUMMARY\n{}\n", HEAVY_RULE));
    out.push_str(&overall.render());
    out.push_str(HEAVY_RULE);
    out.push('\n');

    info!(
        "Summary totals - Total Hours: {}, Billable Hours: {}, Non-Billable Hours: {}",
        format_amount(overall.hours),
        format_amount(overall.billable_hours),
        format_amount(overall.hours.saturating_sub(overall.billable_hours))
    );
    out
}

// --- Week and role matrices ---

pub fn write_weekly_csv(
    path: &Path,
    weeks: &[WeekWindow],
    rows: &[(String, Vec<Decimal>)],
) -> Result<(), InvoicingError> {
    let mut writer = csv_writer(path)?;
    let header: Vec<String> = std::iter::once("Task".to_string())
        .chain(weeks.iter().map(WeekWindow::label))
        .collect();
    writer
        .write_record(&header)
        .map_err(|e| csv_context(e, "Failed to write weekly header"))?;
    for (task, hours) in rows {
        let record: Vec<String> = std::iter::once(task.clone())
            .chain(hours.iter().map(|h| format_amount(*h)))
            .collect();
        writer
            .write_record(&record)
            .map_err(|e| csv_context(e, "Failed to write weekly row"))?;
    }
    finish(writer, path)?;
    info!("Wrote weekly summary to {}", path.display());
    Ok(())
}

pub fn write_roles_csv(
    path: &Path,
    weeks: &[WeekWindow],
    rows: &[(Role, String, Vec<Decimal>)],
) -> Result<(), InvoicingError> {
    let mut writer = csv_writer(path)?;
    let header: Vec<String> = ["Role".to_string(), "Task".to_string()]
        .into_iter()
        .chain(weeks.iter().map(WeekWindow::label))
        .collect();
    writer
        .write_record(&header)
        .map_err(|e| csv_context(e, "Failed to write role header"))?;
    for (role, task, hours) in rows {
        let record: Vec<String> = [role.to_string(), task.clone()]
            .into_iter()
            .chain(hours.iter().map(|h| format_amount(*h)))
            .collect();
        writer
            .write_record(&record)
            .map_err(|e| csv_context(e, "Failed to write role row"))?;
    }
    finish(writer, path)?;
    info!("Wrote role summary to {}", path.display());
    Ok(())
}

// --- Diagnostics ---

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NotFoundRow<'a> {
    project_id: &'a str,
    project_name: &'a str,
    total_hours: String,
    billable_hours: String,
    hourly_rate: String,
    euro_amount: String,
    billable_euro_amount: String,
}

/// Writes nothing and returns `false` when there is nothing to report.
pub fn write_projects_not_found(
    path: &Path,
    projects: &[ProjectNotFound],
) -> Result<bool, InvoicingError> {
    if projects.is_empty() {
        return Ok(false);
    }
    let mut sorted: Vec<&ProjectNotFound> = projects.iter().collect();
    sorted.sort_by(|a, b| a.project_name.cmp(&b.project_name));

    let mut writer = csv_writer(path)?;
    for project in sorted {
        writer
            .serialize(NotFoundRow {
                project_id: &project.project_id,
                project_name: &project.project_name,
                total_hours: format_amount(project.total_hours),
                billable_hours: format_amount(project.billable_hours),
                hourly_rate: format_amount(project.hourly_rate),
                euro_amount: format_amount(project.euro_amount),
                billable_euro_amount: format_amount(project.billable_euro_amount),
            })
            .map_err(|e| csv_context(e, "Failed to write projects-not-found row"))?;
    }
    finish(writer, path)?;
    info!("Wrote {} projects not found to {}", projects.len(), path.display());
    Ok(true)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NotIncludedRow<'a> {
    customer_name: &'a str,
    project_name: &'a str,
    project_id: &'a str,
    total_hours: String,
}

pub fn write_projects_not_included(
    path: &Path,
    projects: &[ProjectNotIncluded],
) -> Result<bool, InvoicingError> {
    if projects.is_empty() {
        return Ok(false);
    }
    let mut writer = csv_writer(path)?;
    for project in projects {
        writer
            .serialize(NotIncludedRow {
                customer_name: &project.customer_name,
                project_name: &project.project_name,
                project_id: &project.project_id,
                total_hours: format_amount(project.total_hours),
            })
            .map_err(|e| csv_context(e, "Failed to write projects-not-included row"))?;
    }
    finish(writer, path)?;
    info!(
        "Wrote {} missing internal projects to {}",
        projects.len(),
        path.display()
    );
    Ok(true)
}

/// Active configured projects without a single entry.
pub fn warn_projects_without_hours(customers: &CustomerData, entries: &[NormalizedEntry]) -> Vec<String> {
    let with_hours: HashSet<&str> = entries
        .iter()
        .map(|e| e.project_id.as_str())
        .filter(|id| !id.is_empty())
        .collect();
    let mut idle = Vec::new();
    for config in customers.active_projects() {
        let project_id = config.project_id.trim();
        if !with_hours.contains(project_id) {
            warn!(
                "No hours recorded for project - Client: {}, Service: {} (ID: {})",
                config.client_label(),
                config.service_label(),
                project_id
            );
            idle.push(project_id.to_string());
        }
    }
    idle
}

// --- Project summaries ---

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectSummary {
    pub customer_name: String,
    pub project_name: String,
    pub task: String,
    pub project_id: String,
    pub billable: bool,
    pub hours: Decimal,
    pub amount: Decimal,
}

impl ProjectSummary {
    /// Hours-weighted average of the entry rates.
    pub fn hourly_rate(&self) -> Decimal {
        if self.hours > Decimal::ZERO {
            self.amount.checked_div(self.hours).unwrap_or(Decimal::ZERO)
        } else {
            Decimal::ZERO
        }
    }
}

/// Per (customer, project, task, project id), sorted by customer, project and task.
/// Entries whose hours or amount overflow their summary are skipped with a warning.
pub fn project_summaries(entries: &[NormalizedEntry]) -> Vec<ProjectSummary> {
    let mut summaries: BTreeMap<(&str, &str, &str, &str), ProjectSummary> = BTreeMap::new();
    for entry in entries {
        let key = (
            entry.customer_name.as_str(),
            entry.project_name.as_str(),
            entry.task.as_str(),
            entry.project_id.as_str(),
        );
        let summary = summaries.entry(key).or_insert_with(|| ProjectSummary {
            customer_name: entry.customer_name.clone(),
            project_name: entry.project_name.clone(),
            task: entry.task.clone(),
            project_id: entry.project_id.clone(),
            billable: entry.billable,
            hours: Decimal::ZERO,
            amount: Decimal::ZERO,
        });
        let added = entry.hours.checked_mul(entry.rate).and_then(|amount| {
            Some((
                summary.hours.checked_add(entry.hours)?,
                summary.amount.checked_add(amount)?,
            ))
        });
        match added {
            Some((hours, amount)) => {
                summary.hours = hours;
                summary.amount = amount;
            }
            None => warn!(
                "Skipping entry of {} on {:?} for project {} in summaries: hours {} at rate {} overflow",
                entry.employee_name, entry.date, entry.project_id, entry.hours, entry.rate
            ),
        }
    }
    summaries.into_values().collect()
}

/// Total hours and amount over all summaries, `None` when they overflow.
fn summary_totals(summaries: &[ProjectSummary]) -> Option<(Decimal, Decimal)> {
    let totals = checked_sum(summaries.iter().map(|s| s.hours))
        .zip(checked_sum(summaries.iter().map(|s| s.amount)));
    if totals.is_none() {
        warn!("Project summary totals overflow, TOTAL row left out");
    }
    totals
}

pub fn log_project_summaries(summaries: &[ProjectSummary]) {
    if summaries.is_empty() {
        info!("No entries to summarize");
        return;
    }
    let rule = "-".repeat(100);
    info!("Project Summaries:");
    info!("{}", rule);
    info!("{:<30} {:<30} {:>10} {:>12} {:>15}", "Customer", "Project", "Hours", "Rate", "Amount");
    info!("{}", rule);
    let mut by_amount: Vec<&ProjectSummary> = summaries.iter().collect();
    by_amount.sort_by(|a, b| b.amount.cmp(&a.amount).then_with(|| a.customer_name.cmp(&b.customer_name)));
    for s in by_amount {
        info!(
            "{:<30} {:<30} {:>10} {:>12} {:>15}",
            truncate(&s.customer_name, 30),
            truncate(&s.project_name, 30),
            format_amount(s.hours),
            format_amount(s.hourly_rate()),
            format_amount(s.amount)
        );
    }
    info!("{}", rule);
    if let Some((hours, amount)) = summary_totals(summaries) {
        info!("{:<61} {:>10} {:>12} {:>15}", "TOTAL", format_amount(hours), "", format_amount(amount));
        info!("{}", rule);
    }
}

fn truncate(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SummaryRow<'a> {
    customer_name: &'a str,
    project_name: &'a str,
    project_task: &'a str,
    project_id: &'a str,
    billable: String,
    total_hours: String,
    hourly_rate: String,
    total_amount: String,
}

/// Summary rows followed by a TOTAL row.
pub fn write_project_summaries(path: &Path, summaries: &[ProjectSummary]) -> Result<(), InvoicingError> {
    let mut writer = csv_writer(path)?;
    for s in summaries {
        writer
            .serialize(SummaryRow {
                customer_name: &s.customer_name,
                project_name: &s.project_name,
                project_task: &s.task,
                project_id: &s.project_id,
                billable: if s.billable { "True" } else { "False" }.to_string(),
                total_hours: format_amount(s.hours),
                hourly_rate: format_amount(s.hourly_rate()),
                total_amount: format_amount(s.amount),
            })
            .map_err(|e| csv_context(e, "Failed to write summary row"))?;
    }
    if let Some((hours, amount)) = summary_totals(summaries) {
        writer
            .serialize(SummaryRow {
                customer_name: "TOTAL",
                project_name: "",
                project_task: "",
                project_id: "",
                billable: String::new(),
                total_hours: format_amount(hours),
                hourly_rate: String::new(),
                total_amount: format_amount(amount),
            })
            .map_err(|e| csv_context(e, "Failed to write summary total"))?;
    }
    finish(writer, path)?;
    info!("Project summaries written to {}", path.display());
    Ok(())
}

// --- Failed records ---

/// An entry, or a group of entries, that could not be processed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedRecord {
    pub project_id: String,
    pub project_name: String,
    pub project_task: String,
    pub date: String,
    pub employee_name: String,
    pub error: String,
}

impl FailedRecord {
    pub fn for_entry(entry: &NormalizedEntry, error: impl Into<String>) -> Self {
        Self {
            project_id: entry.project_id.clone(),
            project_name: entry.project_name.clone(),
            project_task: entry.task.clone(),
            date: entry.date.map(date_str).unwrap_or_default(),
            employee_name: entry.employee_name.clone(),
            error: error.into(),
        }
    }

    pub fn for_bucket(project_id: &str, task: &str, error: impl Into<String>) -> Self {
        Self {
            project_id: project_id.to_string(),
            project_name: String::new(),
            project_task: task.to_string(),
            date: String::new(),
            employee_name: String::new(),
            error: error.into(),
        }
    }
}

pub fn write_errors(path: &Path, failed: &[FailedRecord]) -> Result<(), InvoicingError> {
    let mut writer = csv_writer(path)?;
    for record in failed {
        writer
            .serialize(record)
            .map_err(|e| csv_context(e, "Failed to write error row"))?;
    }
    finish(writer, path)?;
    warn!("Wrote {} failed entries to {}", failed.len(), path.display());
    Ok(())
}
