// src/time_entry.rs

use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::de::value::MapDeserializer;
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::error::{csv_context, io_context, InvoicingError};
use crate::reference_data::read_text_with_fallback;

const MINUTES_PER_HOUR: Decimal = dec!(60);

// --- Raw entries ---

/// One time entry as reported by AgileDay, either straight from the API or
/// from a raw hours CSV written by an earlier run. Scalars are kept as text
/// until normalization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTimeEntry {
    #[serde(default, deserialize_with = "lenient_text")]
    pub customer_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub customer_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub project_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub project_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub project_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub project_task: Option<String>,
    #[serde(default, deserialize_with = "lenient_text", alias = "OpeningName")]
    pub opening_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub date: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub employee_name: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_text",
        alias = "employeeEmailAddress"
    )]
    pub employee_email: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub employee_company: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub billable: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub actual_minutes: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub opening_hourly_price: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub task_hourly_price: Option<String>,
}

#[cfg(test)]
impl RawTimeEntry {
    pub fn new(project_id: &str, task: &str) -> Self {
        Self {
            project_id: Some(project_id.to_string()),
            project_task: Some(task.to_string()),
            ..Self::default()
        }
    }

    pub fn with_project_name(mut self, name: &str) -> Self {
        self.project_name = Some(name.to_string());
        self
    }

    pub fn with_customer(mut self, name: &str) -> Self {
        self.customer_name = Some(name.to_string());
        self
    }

    pub fn with_minutes(mut self, minutes: &str) -> Self {
        self.actual_minutes = Some(minutes.to_string());
        self
    }

    pub fn with_billable(mut self, billable: &str) -> Self {
        self.billable = Some(billable.to_string());
        self
    }

    pub fn with_company(mut self, company: &str) -> Self {
        self.employee_company = Some(company.to_string());
        self
    }

    pub fn with_employee(mut self, name: &str, email: &str) -> Self {
        self.employee_name = Some(name.to_string());
        self.employee_email = Some(email.to_string());
        self
    }

    pub fn with_date(mut self, date: &str) -> Self {
        self.date = Some(date.to_string());
        self
    }

    pub fn with_task_rate(mut self, rate: &str) -> Self {
        self.task_hourly_price = Some(rate.to_string());
        self
    }

    pub fn with_opening_rate(mut self, rate: &str) -> Self {
        self.opening_hourly_price = Some(rate.to_string());
        self
    }
}

impl RawTimeEntry {
    /// Builds an entry from a header-keyed CSV row, keeping every cell as the exact text.
    pub fn from_row(row: HashMap<String, String>) -> Result<Self, de::value::Error> {
        RawTimeEntry::deserialize(MapDeserializer::<_, de::value::Error>::new(row.into_iter()))
    }

    pub fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref().map(str::trim).filter(|id| !id.is_empty())
    }
}

/// Accepts strings, numbers, booleans and null for a text field so the same
/// struct reads AgileDay JSON and our own CSV exports.
pub(crate) fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct ScalarVisitor;

    impl<'de> Visitor<'de> for ScalarVisitor {
        type Value = Option<String>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a string, number, boolean or null")
        }

        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_some<D2: Deserializer<'de>>(self, d: D2) -> Result<Self::Value, D2::Error> {
            d.deserialize_any(ScalarVisitor)
        }

        fn visit_bool<E: de::Error>(self, v: bool) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            if v.is_empty() {
                Ok(None)
            } else {
                Ok(Some(v.to_string()))
            }
        }
    }

    deserializer.deserialize_option(ScalarVisitor)
}

// --- Normalized entries ---

/// A time entry with numeric hours, rate and a real billable flag.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEntry {
    pub project_id: String,
    pub project_name: String,
    pub customer_name: String,
    pub task: String,
    pub date: Option<NaiveDate>,
    pub employee_name: String,
    pub employee_email: Option<String>,
    pub employee_company: String,
    pub hours: Decimal,
    /// First usable rate among task and opening prices, zero when neither parses.
    pub rate: Decimal,
    /// The task price on its own; the rate resolver falls back to it.
    pub task_rate: Option<Decimal>,
    pub billable: bool,
}

impl NormalizedEntry {
    pub fn is_from_company(&self, company: &str) -> bool {
        is_same_company(&self.employee_company, company)
    }
}

/// Case-insensitive employer match used by every inclusion rule.
pub fn is_same_company(employee_company: &str, company: &str) -> bool {
    employee_company.trim().to_lowercase() == company.trim().to_lowercase()
}

/// `"True"`, `"true"` (JSON `true`) are billable; anything else, including a missing flag, is not.
pub fn parse_billable(raw: Option<&str>) -> bool {
    raw.map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

pub fn parse_decimal(raw: &str) -> Option<Decimal> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Decimal::from_str(trimmed)
        .or_else(|_| Decimal::from_scientific(trimmed))
        .ok()
}

fn parse_optional_decimal(raw: Option<&str>, field: &str, entry_ref: &str) -> Option<Decimal> {
    let value = raw.map(str::trim).filter(|v| !v.is_empty())?;
    match parse_decimal(value) {
        Some(d) => Some(d),
        None => {
            warn!(
                "Unparseable {} '{}' for entry {}, treating as missing",
                field, value, entry_ref
            );
            None
        }
    }
}

pub fn parse_entry_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}

/// Never fails: malformed numbers degrade to zero with a warning.
pub fn normalize(raw: &RawTimeEntry) -> NormalizedEntry {
    let project_id = raw.project_id().unwrap_or_default().to_string();
    let task = raw.project_task.clone().unwrap_or_default();
    let entry_ref = format!("project {} task '{}'", project_id, task);

    let hours = parse_optional_decimal(raw.actual_minutes.as_deref(), "actualMinutes", &entry_ref)
        .and_then(|minutes| minutes.checked_div(MINUTES_PER_HOUR))
        .unwrap_or(Decimal::ZERO);

    let task_rate = parse_optional_decimal(
        raw.task_hourly_price.as_deref(),
        "taskHourlyPrice",
        &entry_ref,
    );
    let opening_rate = parse_optional_decimal(
        raw.opening_hourly_price.as_deref(),
        "openingHourlyPrice",
        &entry_ref,
    );
    let rate = task_rate.or(opening_rate).unwrap_or(Decimal::ZERO);

    let date = match raw.date.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
        Some(d) => {
            let parsed = parse_entry_date(d);
            if parsed.is_none() {
                warn!("Invalid date format '{}' for entry {}", d, entry_ref);
            }
            parsed
        }
        None => None,
    };

    NormalizedEntry {
        project_id,
        project_name: raw.project_name.clone().unwrap_or_default(),
        customer_name: raw.customer_name.clone().unwrap_or_default(),
        task,
        date,
        employee_name: raw.employee_name.clone().unwrap_or_default(),
        employee_email: raw
            .employee_email
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::to_string),
        employee_company: raw.employee_company.clone().unwrap_or_default(),
        hours,
        rate,
        task_rate,
        billable: parse_billable(raw.billable.as_deref()),
    }
}

pub fn normalize_all(raw: &[RawTimeEntry]) -> Vec<NormalizedEntry> {
    let normalized: Vec<NormalizedEntry> = raw.iter().map(normalize).collect();
    debug!("Normalized {} time entries", normalized.len());
    normalized
}

/// Keeps entries dated inside `[start, end]`. With a bound given, undated entries are kept
/// and entries with an unparseable date are dropped.
pub fn filter_by_date(
    entries: Vec<RawTimeEntry>,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> Vec<RawTimeEntry> {
    if start.is_none() && end.is_none() {
        return entries;
    }
    let total = entries.len();
    let kept: Vec<RawTimeEntry> = entries
        .into_iter()
        .filter(|entry| {
            let Some(raw_date) = entry.date.as_deref() else {
                return true;
            };
            match parse_entry_date(raw_date) {
                Some(date) => {
                    start.map_or(true, |s| date >= s) && end.map_or(true, |e| date <= e)
                }
                None => {
                    warn!("Invalid date format in entry: {}", raw_date);
                    false
                }
            }
        })
        .collect();
    info!(
        "Processed {} raw hour entries, {} entries after date filtering",
        total,
        kept.len()
    );
    kept
}

// --- CSV I/O ---

pub fn read_raw_hours(path: &Path) -> Result<Vec<RawTimeEntry>, InvoicingError> {
    let (text, encoding) = read_text_with_fallback(path)?;
    debug!("Reading raw hours from {} as {}", path.display(), encoding);
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut entries = Vec::new();
    for (index, record) in reader.deserialize::<HashMap<String, String>>().enumerate() {
        match record.map_err(|e| e.to_string()).and_then(|row| {
            RawTimeEntry::from_row(row).map_err(|e| e.to_string())
        }) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(
                "Skipping unreadable row {} in {}: {}",
                index + 2,
                path.display(),
                e
            ),
        }
    }
    let projects: HashSet<&str> =
        entries.iter().filter_map(RawTimeEntry::project_id).collect();
    info!(
        "Processed {} raw hour entries across {} projects",
        entries.len(),
        projects.len()
    );
    Ok(entries)
}

pub fn write_raw_hours(path: &Path, entries: &[RawTimeEntry]) -> Result<(), InvoicingError> {
    info!("Writing {} entries to {}", entries.len(), path.display());
    let file = File::create(path)
        .map_err(|e| io_context(e, format!("Failed to create {}", path.display())))?;
    let mut writer = csv::Writer::from_writer(BufWriter::new(file));
    for entry in entries {
        writer
            .serialize(entry)
            .map_err(|e| csv_context(e, format!("Failed to write entry to {}", path.display())))?;
    }
    writer
        .flush()
        .map_err(|e| io_context(e, format!("Failed to flush {}", path.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn minutes_become_hours_exactly() {
        let entry = normalize(&RawTimeEntry::new("42", "Dev").with_minutes("480"));
        assert_eq!(entry.hours, dec!(8));

        let entry = normalize(&RawTimeEntry::new("42", "Dev").with_minutes("90"));
        assert_eq!(entry.hours, dec!(1.5));
    }

    #[test]
    fn missing_or_malformed_minutes_yield_zero_hours() {
        assert_eq!(normalize(&RawTimeEntry::new("42", "Dev")).hours, Decimal::ZERO);
        let entry = normalize(&RawTimeEntry::new("42", "Dev").with_minutes("lots"));
        assert_eq!(entry.hours, Decimal::ZERO);
    }

    #[test]
    fn task_rate_is_preferred_over_opening_rate() {
        let entry = normalize(
            &RawTimeEntry::new("42", "Dev")
                .with_task_rate("95.50")
                .with_opening_rate("80"),
        );
        assert_eq!(entry.rate, dec!(95.50));
        assert_eq!(entry.task_rate, Some(dec!(95.50)));

        let entry = normalize(
            &RawTimeEntry::new("42", "Dev")
                .with_task_rate("n/a")
                .with_opening_rate("80"),
        );
        assert_eq!(entry.rate, dec!(80));
        assert_eq!(entry.task_rate, None);

        let entry = normalize(&RawTimeEntry::new("42", "Dev"));
        assert_eq!(entry.rate, Decimal::ZERO);
    }

    #[test]
    fn billable_flag_is_parsed_once() {
        assert!(parse_billable(Some("True")));
        assert!(parse_billable(Some("true")));
        assert!(!parse_billable(Some("False")));
        assert!(!parse_billable(Some("yes")));
        assert!(!parse_billable(None));
    }

    #[test]
    fn json_entries_with_native_scalars_deserialize() {
        let json = r#"[{
            "projectId": "42",
            "projectTask": "Development",
            "actualMinutes": 150,
            "billable": true,
            "taskHourlyPrice": 100.0,
            "openingHourlyPrice": null,
            "employeeEmailAddress": "dev@orangit.fi",
            "someFieldWeIgnore": {"nested": 1}
        }]"#;
        let raw: Vec<RawTimeEntry> = serde_json::from_str(json).unwrap();
        let entry = normalize(&raw[0]);
        assert_eq!(entry.hours, dec!(2.5));
        assert!(entry.billable);
        assert_eq!(entry.rate, dec!(100));
        assert_eq!(entry.employee_email.as_deref(), Some("dev@orangit.fi"));
    }

    #[test]
    fn raw_hours_round_trip_through_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw_hours.csv");
        let entries = vec![
            RawTimeEntry::new("42", "Development")
                .with_minutes("480")
                .with_billable("True")
                .with_company("OrangIT Oy")
                .with_date("2025-03-03"),
            RawTimeEntry::new("43", ""),
        ];
        write_raw_hours(&path, &entries).unwrap();

        let read_back = read_raw_hours(&path).unwrap();
        assert_eq!(read_back.len(), 2);
        let first = normalize(&read_back[0]);
        assert_eq!(first.hours, dec!(8));
        assert!(first.billable);
        assert_eq!(first.date, NaiveDate::from_ymd_opt(2025, 3, 3));
        assert_eq!(normalize(&read_back[1]).task, "");
    }

    #[test]
    fn date_filter_is_inclusive() {
        let entries = vec![
            RawTimeEntry::new("1", "a").with_date("2025-02-28"),
            RawTimeEntry::new("1", "a").with_date("2025-03-01"),
            RawTimeEntry::new("1", "a").with_date("2025-03-31"),
            RawTimeEntry::new("1", "a").with_date("2025-04-01"),
            RawTimeEntry::new("1", "a").with_date("31.3.2025"),
        ];
        let kept = filter_by_date(
            entries,
            NaiveDate::from_ymd_opt(2025, 3, 1),
            NaiveDate::from_ymd_opt(2025, 3, 31),
        );
        assert_eq!(kept.len(), 2);
    }
}
