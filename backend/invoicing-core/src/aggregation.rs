// src/aggregation.rs

use chrono::{Datelike, Duration, NaiveDate};
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::config::{Role, RoleDirectory};
use crate::error::InvoicingError;
use crate::rates::{resolve_rate, RateGapReporter};
use crate::reference_data::{CustomerData, IncludedHours, InternalRates, ProjectBillingConfig};
use crate::time_entry::NormalizedEntry;

/// `round(value, 2)`, halves away from zero.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Sum of `values`, `None` when it does not fit in a `Decimal`.
pub fn checked_sum(values: impl IntoIterator<Item = Decimal>) -> Option<Decimal> {
    values
        .into_iter()
        .try_fold(Decimal::ZERO, |acc, value| acc.checked_add(value))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationMode {
    /// Billable hours of active configured projects, priced through the rate resolver.
    Invoicing,
    /// All hours of every project with activity; unconfigured projects count internal hours only.
    Utilization,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inclusion {
    Included,
    Excluded,
    UnknownPolicy,
}

/// Hours of one (project, task) bucket.
#[derive(Debug, Clone)]
pub struct AggregatedLine<'a> {
    pub project_id: String,
    pub project_name: String,
    pub customer_name: String,
    pub task: String,
    pub hours: Decimal,
    pub billable_hours: Decimal,
    pub rate: Decimal,
    /// `round(hours * rate, 2)`. Utilization prices billable hours only, so there it
    /// equals `billable_amount`.
    pub amount: Decimal,
    /// `round(billable_hours * rate, 2)`
    pub billable_amount: Decimal,
    pub config: Option<&'a ProjectBillingConfig>,
    pub entries: Vec<&'a NormalizedEntry>,
}

impl AggregatedLine<'_> {
    pub fn client_label(&self) -> &str {
        match self.config {
            Some(config) => config.client_label(),
            None => non_empty(&self.customer_name, "Unknown"),
        }
    }

    pub fn is_billable(&self) -> bool {
        self.billable_hours > Decimal::ZERO
    }
}

/// A project with hours but no customer row.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectNotFound {
    pub project_id: String,
    pub project_name: String,
    pub total_hours: Decimal,
    pub billable_hours: Decimal,
    pub hourly_rate: Decimal,
    pub euro_amount: Decimal,
    pub billable_euro_amount: Decimal,
}

/// An internal-company project with billable hours that produced no invoice line.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectNotIncluded {
    pub customer_name: String,
    pub project_name: String,
    pub project_id: String,
    pub total_hours: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BucketFailure {
    pub project_id: String,
    pub task: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct Aggregation<'a> {
    pub lines: Vec<AggregatedLine<'a>>,
    pub projects_not_found: Vec<ProjectNotFound>,
    /// Active configured projects with no entries at all.
    pub projects_without_hours: Vec<String>,
    pub failures: Vec<BucketFailure>,
    pub first_day: Option<NaiveDate>,
    pub last_day: Option<NaiveDate>,
}

impl Aggregation<'_> {
    fn track_day(&mut self, date: Option<NaiveDate>) {
        let Some(date) = date else { return };
        if self.first_day.map_or(true, |d| date < d) {
            self.first_day = Some(date);
        }
        if self.last_day.map_or(true, |d| date > d) {
            self.last_day = Some(date);
        }
    }
}

enum RateSource<'a> {
    Resolved {
        internal_rates: &'a InternalRates,
        reporter: &'a dyn RateGapReporter,
    },
    TaskPriceOnly,
}

/// The filter, bucket, sum and price engine shared by invoicing and utilization.
pub struct Aggregator<'a> {
    mode: AggregationMode,
    customers: &'a CustomerData,
    rate_source: RateSource<'a>,
    internal_company: String,
}

impl<'a> Aggregator<'a> {
    pub fn invoicing(
        customers: &'a CustomerData,
        internal_rates: &'a InternalRates,
        reporter: &'a dyn RateGapReporter,
        internal_company: &str,
    ) -> Self {
        Self {
            mode: AggregationMode::Invoicing,
            customers,
            rate_source: RateSource::Resolved {
                internal_rates,
                reporter,
            },
            internal_company: internal_company.to_string(),
        }
    }

    pub fn utilization(customers: &'a CustomerData, internal_company: &str) -> Self {
        Self {
            mode: AggregationMode::Utilization,
            customers,
            rate_source: RateSource::TaskPriceOnly,
            internal_company: internal_company.to_string(),
        }
    }

    /// Whether `entry` counts for its project under the project's included-hours policy.
    pub fn inclusion(
        &self,
        entry: &NormalizedEntry,
        config: Option<&ProjectBillingConfig>,
    ) -> Inclusion {
        if self.mode == AggregationMode::Invoicing && !entry.billable {
            return Inclusion::Excluded;
        }
        let Some(config) = config else {
            return match self.mode {
                AggregationMode::Invoicing => Inclusion::Excluded,
                AggregationMode::Utilization if entry.is_from_company(&self.internal_company) => {
                    Inclusion::Included
                }
                AggregationMode::Utilization => Inclusion::Excluded,
            };
        };
        match config.included_hours_policy() {
            IncludedHours::All => Inclusion::Included,
            IncludedHours::InternalOnly if entry.is_from_company(&self.internal_company) => {
                Inclusion::Included
            }
            IncludedHours::InternalOnly => Inclusion::Excluded,
            IncludedHours::Unrecognized(_) => Inclusion::UnknownPolicy,
        }
    }

    pub fn aggregate(&self, entries: &'a [NormalizedEntry]) -> Aggregation<'a> {
        let by_project = group_by_project(entries);
        let mut aggregation = Aggregation::default();
        match self.mode {
            AggregationMode::Invoicing => self.aggregate_invoicing(&by_project, &mut aggregation),
            AggregationMode::Utilization => {
                self.aggregate_utilization(&by_project, &mut aggregation)
            }
        }

        if !aggregation.projects_without_hours.is_empty() {
            warn!(
                "No hours found for {} active projects:\n{}",
                aggregation.projects_without_hours.len(),
                aggregation.projects_without_hours.join("\n")
            );
        }
        info!(
            "Aggregated {} entries into {} task lines ({} failed buckets)",
            entries.len(),
            aggregation.lines.len(),
            aggregation.failures.len()
        );
        aggregation
    }

    fn aggregate_invoicing(
        &self,
        by_project: &HashMap<&'a str, Vec<&'a NormalizedEntry>>,
        aggregation: &mut Aggregation<'a>,
    ) {
        for config in self.customers.active_projects() {
            let project_id = config.project_id.trim();
            let Some(project_entries) = by_project.get(project_id) else {
                aggregation.projects_without_hours.push(format!(
                    "Project: {} (ID: {})",
                    non_empty(&config.project_name, config.service_label()),
                    project_id
                ));
                continue;
            };
            debug!(
                "Processing hours for project - Client: {}, Service: {} (ID: {}), included_hours: {}, total entries: {}",
                config.client_label(),
                config.service_label(),
                project_id,
                config.included_hours,
                project_entries.len()
            );

            let mut included = Vec::new();
            let mut unknown_policy = 0usize;
            for entry in project_entries {
                if entry.billable {
                    aggregation.track_day(entry.date);
                }
                match self.inclusion(entry, Some(config)) {
                    Inclusion::Included => included.push(*entry),
                    Inclusion::Excluded => {}
                    Inclusion::UnknownPolicy => unknown_policy += 1,
                }
            }
            if unknown_policy > 0 {
                warn!(
                    "Unknown included_hours value '{}' for project - Client: {}, Service: {} (ID: {}), {} entries excluded",
                    config.included_hours.trim(),
                    config.client_label(),
                    config.service_label(),
                    project_id,
                    unknown_policy
                );
            }
            if included.is_empty() {
                warn!(
                    "No matching hours after filtering - Client: {}, Service: {} (ID: {}), included_hours: {}",
                    config.client_label(),
                    config.service_label(),
                    project_id,
                    config.included_hours
                );
                continue;
            }
            self.fold_project(project_id, Some(config), included, aggregation);
        }
    }

    fn aggregate_utilization(
        &self,
        by_project: &HashMap<&'a str, Vec<&'a NormalizedEntry>>,
        aggregation: &mut Aggregation<'a>,
    ) {
        let mut project_ids: Vec<&&str> = by_project.keys().collect();
        project_ids.sort();

        for project_id in project_ids {
            let project_entries = &by_project[*project_id];
            let config = self.customers.get(project_id);
            let mut included = Vec::new();
            let mut unknown_policy = 0usize;
            for entry in project_entries {
                match self.inclusion(entry, config) {
                    Inclusion::Included => included.push(*entry),
                    Inclusion::Excluded => {}
                    Inclusion::UnknownPolicy => unknown_policy += 1,
                }
            }
            if let (Some(config), true) = (config, unknown_policy > 0) {
                warn!(
                    "Unknown included_hours value '{}' for project - Client: {}, Service: {} (ID: {}), {} entries excluded",
                    config.included_hours.trim(),
                    config.client_label(),
                    config.service_label(),
                    project_id,
                    unknown_policy
                );
            }
            for entry in &included {
                aggregation.track_day(entry.date);
            }
            if !included.is_empty() {
                self.fold_project(project_id, config, included, aggregation);
            }
            if config.is_none() {
                match self.not_found_totals(project_id, project_entries) {
                    Ok(totals) => aggregation.projects_not_found.push(totals),
                    Err(e) => {
                        warn!("Failed to total unconfigured project {}: {}", project_id, e);
                        aggregation.failures.push(BucketFailure {
                            project_id: project_id.to_string(),
                            task: String::new(),
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }
    }

    fn fold_project(
        &self,
        project_id: &str,
        config: Option<&'a ProjectBillingConfig>,
        included: Vec<&'a NormalizedEntry>,
        aggregation: &mut Aggregation<'a>,
    ) {
        let mut by_task: BTreeMap<&'a str, Vec<&'a NormalizedEntry>> = BTreeMap::new();
        for entry in included {
            by_task.entry(entry.task.as_str()).or_default().push(entry);
        }

        for (task, bucket) in by_task {
            match self.fold_bucket(project_id, task, config, bucket) {
                Ok(line) => aggregation.lines.push(line),
                Err(e) => {
                    warn!(
                        "Failed to process task '{}' for project {}: {}",
                        task, project_id, e
                    );
                    aggregation.failures.push(BucketFailure {
                        project_id: project_id.to_string(),
                        task: task.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    fn fold_bucket(
        &self,
        project_id: &str,
        task: &str,
        config: Option<&'a ProjectBillingConfig>,
        bucket: Vec<&'a NormalizedEntry>,
    ) -> Result<AggregatedLine<'a>, InvoicingError> {
        let overflow =
            || InvoicingError::Arithmetic(format!("summing task '{}' of project {}", task, project_id));

        let first = *bucket
            .first()
            .ok_or_else(|| InvoicingError::InvalidInput(format!("empty bucket for task '{}'", task)))?;

        let mut hours = Decimal::ZERO;
        let mut billable_hours = Decimal::ZERO;
        for entry in &bucket {
            hours = hours.checked_add(entry.hours).ok_or_else(overflow)?;
            if entry.billable {
                billable_hours = billable_hours.checked_add(entry.hours).ok_or_else(overflow)?;
            }
        }

        // Entries of one task are priced alike; only the first entry's rate is resolved.
        let rate = self.bucket_rate(first, project_id, config);
        let billable_amount = round_money(billable_hours.checked_mul(rate).ok_or_else(overflow)?);
        let amount = match self.mode {
            AggregationMode::Invoicing => round_money(hours.checked_mul(rate).ok_or_else(overflow)?),
            AggregationMode::Utilization => billable_amount,
        };

        let project_name = if first.project_name.is_empty() {
            config.map(|c| c.project_name.clone()).unwrap_or_default()
        } else {
            first.project_name.clone()
        };

        Ok(AggregatedLine {
            project_id: project_id.to_string(),
            project_name,
            customer_name: first.customer_name.clone(),
            task: task.to_string(),
            hours,
            billable_hours,
            rate,
            amount,
            billable_amount,
            config,
            entries: bucket,
        })
    }

    fn bucket_rate(
        &self,
        first: &NormalizedEntry,
        project_id: &str,
        config: Option<&ProjectBillingConfig>,
    ) -> Decimal {
        match (&self.rate_source, config) {
            (
                RateSource::Resolved {
                    internal_rates,
                    reporter,
                },
                Some(config),
            ) => resolve_rate(first, project_id, config, internal_rates, *reporter),
            _ => first.task_rate.unwrap_or(Decimal::ZERO),
        }
    }

    fn not_found_totals(
        &self,
        project_id: &str,
        entries: &[&NormalizedEntry],
    ) -> Result<ProjectNotFound, InvoicingError> {
        let overflow = || InvoicingError::Arithmetic(format!("totalling project {}", project_id));
        let internal: Vec<&&NormalizedEntry> = entries
            .iter()
            .filter(|e| e.is_from_company(&self.internal_company))
            .collect();
        let total_hours = checked_sum(internal.iter().map(|e| e.hours)).ok_or_else(overflow)?;
        let billable_hours = checked_sum(internal.iter().filter(|e| e.billable).map(|e| e.hours))
            .ok_or_else(overflow)?;
        let first = entries.first();
        let hourly_rate = first
            .and_then(|e| e.task_rate)
            .unwrap_or(Decimal::ZERO);
        let euro_amount = round_money(billable_hours.checked_mul(hourly_rate).ok_or_else(overflow)?);
        warn!(
            "Project {} ({}) not found in customer data, {} internal hours",
            project_id,
            first.map_or("Unknown", |e| e.project_name.as_str()),
            total_hours
        );
        Ok(ProjectNotFound {
            project_id: project_id.to_string(),
            project_name: first
                .map(|e| non_empty(&e.project_name, "Unknown").to_string())
                .unwrap_or_else(|| "Unknown".to_string()),
            total_hours,
            billable_hours,
            hourly_rate,
            euro_amount,
            billable_euro_amount: euro_amount,
        })
    }
}

fn non_empty<'s>(value: &'s str, fallback: &'s str) -> &'s str {
    if value.trim().is_empty() {
        fallback
    } else {
        value
    }
}

fn group_by_project(entries: &[NormalizedEntry]) -> HashMap<&str, Vec<&NormalizedEntry>> {
    let mut by_project: HashMap<&str, Vec<&NormalizedEntry>> = HashMap::new();
    for entry in entries {
        if entry.project_id.is_empty() {
            continue;
        }
        by_project
            .entry(entry.project_id.as_str())
            .or_default()
            .push(entry);
    }
    by_project
}

/// Internal-company projects with billable hours whose id is not in `invoiced_project_ids`,
/// sorted by customer and project name. A project whose hours overflow is left out.
pub fn projects_not_included(
    entries: &[NormalizedEntry],
    invoiced_project_ids: &HashSet<String>,
    internal_company: &str,
) -> Vec<ProjectNotIncluded> {
    let mut missing: HashMap<&str, ProjectNotIncluded> = HashMap::new();
    let mut overflowed: HashSet<&str> = HashSet::new();
    for entry in entries {
        if entry.project_id.is_empty()
            || invoiced_project_ids.contains(&entry.project_id)
            || !entry.billable
            || !entry.is_from_company(internal_company)
            || overflowed.contains(entry.project_id.as_str())
        {
            continue;
        }
        let project = missing
            .entry(entry.project_id.as_str())
            .or_insert_with(|| ProjectNotIncluded {
                customer_name: non_empty(&entry.customer_name, "Unknown").to_string(),
                project_name: non_empty(&entry.project_name, "Unknown").to_string(),
                project_id: entry.project_id.clone(),
                total_hours: Decimal::ZERO,
            });
        match project.total_hours.checked_add(entry.hours) {
            Some(total) => project.total_hours = total,
            None => {
                warn!(
                    "Hours of project {} overflow, leaving it out of the not-included report",
                    entry.project_id
                );
                missing.remove(entry.project_id.as_str());
                overflowed.insert(entry.project_id.as_str());
            }
        }
    }

    let mut missing: Vec<ProjectNotIncluded> = missing.into_values().collect();
    missing.sort_by(|a, b| {
        (&a.customer_name, &a.project_name, &a.project_id)
            .cmp(&(&b.customer_name, &b.project_name, &b.project_id))
    });
    for project in &missing {
        warn!(
            "{} project not included in result - Customer: {}, Project: {} (ID: {}), Total Hours: {:.2}",
            internal_company, project.customer_name, project.project_name, project.project_id, project.total_hours
        );
    }
    missing
}

// --- Week and role breakdowns ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeekWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl WeekWindow {
    pub fn containing(date: NaiveDate) -> Self {
        let start = date - Duration::days(i64::from(date.weekday().num_days_from_monday()));
        Self {
            start,
            end: start + Duration::days(6),
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn label(&self) -> String {
        format!(
            "{} to {}",
            self.start.format("%Y-%m-%d"),
            self.end.format("%Y-%m-%d")
        )
    }
}

/// Monday-aligned weeks covering `start..=end`.
pub fn week_windows(start: NaiveDate, end: NaiveDate) -> Vec<WeekWindow> {
    let mut weeks = Vec::new();
    let mut window = WeekWindow::containing(start);
    while window.start <= end {
        weeks.push(window);
        window = WeekWindow::containing(window.start + Duration::days(7));
    }
    weeks
}

/// Earliest and latest entry date among the lines' entries.
pub fn data_span(lines: &[AggregatedLine<'_>]) -> Option<(NaiveDate, NaiveDate)> {
    let mut dates = lines
        .iter()
        .flat_map(|l| l.entries.iter())
        .filter_map(|e| e.date);
    let first = dates.next()?;
    Some(dates.fold((first, first), |(lo, hi), d| (lo.min(d), hi.max(d))))
}

fn add_to_week(row: &mut [Decimal], weeks: &[WeekWindow], entry: &NormalizedEntry) {
    let Some(date) = entry.date else { return };
    if let Some(i) = weeks.iter().position(|w| w.contains(date)) {
        match row[i].checked_add(entry.hours) {
            Some(total) => row[i] = total,
            None => warn!(
                "Hours overflow in week {} for task '{}', entry of {} skipped",
                weeks[i].label(),
                entry.task,
                non_empty(&entry.employee_name, "unknown employee")
            ),
        }
    }
}

/// Hours per task per week, tasks sorted by name.
pub fn task_week_totals(
    lines: &[AggregatedLine<'_>],
    weeks: &[WeekWindow],
) -> Vec<(String, Vec<Decimal>)> {
    let mut rows: BTreeMap<&str, Vec<Decimal>> = BTreeMap::new();
    for line in lines {
        let row = rows
            .entry(line.task.as_str())
            .or_insert_with(|| vec![Decimal::ZERO; weeks.len()]);
        for entry in &line.entries {
            add_to_week(row, weeks, entry);
        }
    }
    rows.into_iter()
        .map(|(task, hours)| (task.to_string(), hours))
        .collect()
}

/// Hours per (role, task, week). Roles in declaration order, then tasks by name.
/// Entries without an email are left out.
pub fn role_task_week_totals(
    lines: &[AggregatedLine<'_>],
    weeks: &[WeekWindow],
    roles: &RoleDirectory,
) -> Vec<(Role, String, Vec<Decimal>)> {
    let mut rows: BTreeMap<(Role, &str), Vec<Decimal>> = BTreeMap::new();
    for line in lines {
        for entry in &line.entries {
            let Some(email) = entry.employee_email.as_deref() else {
                warn!(
                    "No email found for entry of {} on {:?}, skipping role breakdown",
                    non_empty(&entry.employee_name, "unknown employee"),
                    entry.date
                );
                continue;
            };
            let role = roles.role_for(email);
            debug!("Assigned role {} to email {}", role, email);
            let row = rows
                .entry((role, line.task.as_str()))
                .or_insert_with(|| vec![Decimal::ZERO; weeks.len()]);
            add_to_week(row, weeks, entry);
        }
    }
    rows.into_iter()
        .map(|((role, task), hours)| (role, task.to_string(), hours))
        .collect()
}
