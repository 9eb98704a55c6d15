// src/reference_data.rs

use encoding_rs::WINDOWS_1252;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::error::{io_context, InvoicingError};
use crate::time_entry::parse_decimal;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

// --- Encoding fallback ---

/// Reads a hand-edited reference file. UTF-8 is tried first; anything that is not valid
/// UTF-8 is decoded as windows-1252, the superset of Latin-1 that spreadsheet exports use.
pub fn read_text_with_fallback(path: &Path) -> Result<(String, &'static str), InvoicingError> {
    let bytes = fs::read(path)
        .map_err(|e| io_context(e, format!("Failed to read {}", path.display())))?;
    Ok(decode_with_fallback(&bytes))
}

pub fn decode_with_fallback(bytes: &[u8]) -> (String, &'static str) {
    let without_bom = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    match std::str::from_utf8(without_bom) {
        Ok(text) => (text.to_string(), "utf-8"),
        Err(_) => {
            debug!("Failed to read as utf-8, trying windows-1252");
            let (text, _had_errors) = WINDOWS_1252.decode_without_bom_handling(without_bom);
            (text.into_owned(), WINDOWS_1252.name())
        }
    }
}

// --- Customer billing configuration ---

/// Which employees' hours count towards a project's invoice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncludedHours {
    All,
    /// Only hours logged by employees of the internal company.
    InternalOnly,
    Unrecognized(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HourRatePolicy {
    Internal,
    Source,
}

/// Whether an invoice covers the invoicing month (`post`) or the month after it (`pre`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeriodTiming {
    Pre,
    #[default]
    Post,
}

impl PeriodTiming {
    pub fn parse(raw: &str) -> PeriodTiming {
        if raw.trim().eq_ignore_ascii_case("pre") {
            PeriodTiming::Pre
        } else {
            PeriodTiming::Post
        }
    }
}

/// One row of the customer data sheet, keyed by the AgileDay project id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectBillingConfig {
    #[serde(rename = "AgileDay_projectId", default)]
    pub project_id: String,
    #[serde(rename = "Active", default)]
    pub active: String,
    #[serde(rename = "Client", default)]
    pub client: String,
    #[serde(rename = "Service name", default)]
    pub service_name: String,
    #[serde(rename = "projectName", default)]
    pub project_name: String,
    #[serde(rename = "included_hours", default)]
    pub included_hours: String,
    #[serde(rename = "hour_rates", default)]
    pub hour_rates: String,
    #[serde(rename = "Group invoice", default)]
    pub group_invoice: String,
    #[serde(rename = "Invoice Info A2 Ext Id", default)]
    pub invoice_a2_id: String,
    #[serde(rename = "Account A2 Ext ID", default)]
    pub account_a2_id: String,
    #[serde(rename = "Our Reference", default)]
    pub our_reference: String,
    #[serde(rename = "CUSTOMER_REFERENCE", default)]
    pub customer_reference: String,
    #[serde(rename = "Contract number", default)]
    pub contract_number: String,
    #[serde(rename = "Billable Description", default)]
    pub billable_description: String,
    #[serde(rename = "Sales Item hours", default)]
    pub sales_item_hours: String,
    #[serde(rename = "Tax_Applicability", default)]
    pub tax_applicability: String,
    #[serde(rename = "Tax_Code", default)]
    pub tax_code: String,
    #[serde(rename = "Period", default)]
    pub period: String,
}

impl ProjectBillingConfig {
    pub fn new(project_id: &str, client: &str, service_name: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            active: "yes".to_string(),
            client: client.to_string(),
            service_name: service_name.to_string(),
            included_hours: "all".to_string(),
            ..Self::default()
        }
    }

    #[cfg(test)]
    pub fn with_included_hours(mut self, policy: &str) -> Self {
        self.included_hours = policy.to_string();
        self
    }

    #[cfg(test)]
    pub fn with_hour_rates(mut self, policy: &str) -> Self {
        self.hour_rates = policy.to_string();
        self
    }

    #[cfg(test)]
    pub fn with_group_invoice(mut self, group: &str) -> Self {
        self.group_invoice = group.to_string();
        self
    }

    #[cfg(test)]
    pub fn with_invoice_ids(mut self, invoice_a2: &str, account_a2: &str) -> Self {
        self.invoice_a2_id = invoice_a2.to_string();
        self.account_a2_id = account_a2.to_string();
        self
    }

    #[cfg(test)]
    pub fn with_active(mut self, active: &str) -> Self {
        self.active = active.to_string();
        self
    }

    pub fn is_active(&self) -> bool {
        self.active.trim().eq_ignore_ascii_case("yes")
    }

    pub fn included_hours_policy(&self) -> IncludedHours {
        let raw = self.included_hours.trim();
        match raw.to_lowercase().as_str() {
            "all" => IncludedHours::All,
            "orangit" => IncludedHours::InternalOnly,
            _ => IncludedHours::Unrecognized(raw.to_string()),
        }
    }

    pub fn hour_rate_policy(&self) -> HourRatePolicy {
        if self.hour_rates.trim().eq_ignore_ascii_case("internal") {
            HourRatePolicy::Internal
        } else {
            HourRatePolicy::Source
        }
    }

    pub fn period_timing(&self) -> PeriodTiming {
        PeriodTiming::parse(&self.period)
    }

    /// Group invoice, then the Invoice A2 id, then the client name.
    pub fn invoice_key(&self) -> String {
        [&self.group_invoice, &self.invoice_a2_id, &self.client]
            .into_iter()
            .map(|v| v.trim())
            .find(|v| !v.is_empty())
            .unwrap_or_default()
            .to_string()
    }

    pub fn client_label(&self) -> &str {
        non_empty_or(&self.client, "Unknown")
    }

    pub fn service_label(&self) -> &str {
        non_empty_or(&self.service_name, "Unknown Service")
    }
}

fn non_empty_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.trim().is_empty() {
        fallback
    } else {
        value
    }
}

/// All customer rows in file order. A later row with the same project id replaces
/// the earlier one but keeps its position, unless it would deactivate an active row.
#[derive(Debug, Clone, Default)]
pub struct CustomerData {
    projects: Vec<ProjectBillingConfig>,
    index: HashMap<String, usize>,
}

impl CustomerData {
    #[cfg(test)]
    pub fn from_configs(configs: impl IntoIterator<Item = ProjectBillingConfig>) -> Self {
        let mut data = CustomerData::default();
        for config in configs {
            data.insert(config);
        }
        data
    }

    fn insert(&mut self, config: ProjectBillingConfig) {
        let project_id = config.project_id.trim().to_string();
        if project_id.is_empty() {
            return;
        }
        match self.index.get(&project_id) {
            Some(&position) if self.projects[position].is_active() && !config.is_active() => {
                warn!(
                    "Duplicate inactive customer row for project {}, keeping the active row",
                    project_id
                );
            }
            Some(&position) => {
                warn!(
                    "Duplicate customer row for project {}, using the later row",
                    project_id
                );
                self.projects[position] = config;
            }
            None => {
                self.index.insert(project_id, self.projects.len());
                self.projects.push(config);
            }
        }
    }

    pub fn load(path: &Path) -> Result<Self, InvoicingError> {
        if !path.is_file() {
            return Err(InvoicingError::InvalidInput(format!(
                "Customer data file not found: {}",
                path.display()
            )));
        }
        let (text, encoding) = read_text_with_fallback(path)?;
        let data = Self::parse(&text)?;
        info!(
            "Successfully read {} customer rows from {} with encoding {}",
            data.len(),
            path.display(),
            encoding
        );
        Ok(data)
    }

    pub fn parse(text: &str) -> Result<Self, InvoicingError> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::Headers)
            .from_reader(text.as_bytes());
        let headers = reader
            .headers()
            .map_err(|e| crate::error::csv_context(e, "Failed to read customer CSV header"))?
            .clone();
        info!("Customer CSV fields: {:?}", headers.iter().collect::<Vec<_>>());

        let mut data = CustomerData::default();
        for (index, record) in reader.records().enumerate() {
            let record = match record {
                Ok(r) => r,
                Err(e) => {
                    warn!("Skipping unreadable customer row {}: {}", index + 2, e);
                    continue;
                }
            };
            match record.deserialize::<ProjectBillingConfig>(Some(&headers)) {
                Ok(config) => {
                    debug!(
                        "Mapping project ID {} to client '{}', service '{}'",
                        config.project_id,
                        config.client_label(),
                        config.service_label()
                    );
                    data.insert(config);
                }
                Err(e) => warn!("Skipping malformed customer row {}: {}", index + 2, e),
            }
        }
        info!(
            "Loaded {} customer records ({} active)",
            data.len(),
            data.active_projects().count()
        );
        Ok(data)
    }

    pub fn get(&self, project_id: &str) -> Option<&ProjectBillingConfig> {
        self.index.get(project_id.trim()).map(|&i| &self.projects[i])
    }

    pub fn active_projects(&self) -> impl Iterator<Item = &ProjectBillingConfig> {
        self.projects.iter().filter(|c| c.is_active())
    }

    pub fn len(&self) -> usize {
        self.projects.len()
    }
}

// --- Internal rates ---

/// Negotiated `(project id, task) -> hourly rate` table.
#[derive(Debug, Clone, Default)]
pub struct InternalRates {
    rates: HashMap<(String, String), Decimal>,
}

impl InternalRates {
    #[cfg(test)]
    pub fn with_rate(mut self, project_id: &str, task: &str, rate: Decimal) -> Self {
        self.rates
            .insert((project_id.to_string(), task.to_string()), rate);
        self
    }

    pub fn load(path: &Path) -> Result<Self, InvoicingError> {
        if !path.is_file() {
            return Err(InvoicingError::InvalidInput(format!(
                "Rates file not found: {}",
                path.display()
            )));
        }
        let (text, _) = read_text_with_fallback(path)?;
        let rates = Self::parse(&text);
        info!(
            "Successfully loaded {} internal rates from {}",
            rates.len(),
            path.display()
        );
        Ok(rates)
    }

    /// Rows are `project id, task name, rate`. Anything else is skipped with a warning.
    pub fn parse(text: &str) -> Self {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(text.as_bytes());

        let mut table = InternalRates::default();
        for record in reader.records() {
            let record = match record {
                Ok(r) => r,
                Err(e) => {
                    warn!("Failed to read rate row: {}", e);
                    continue;
                }
            };
            if record.len() < 3 {
                if record.iter().any(|f| !f.trim().is_empty()) {
                    warn!("Failed to parse rate from row {:?}: expected 3 columns", record);
                }
                continue;
            }
            let project_id = record[0].trim();
            let task = record[1].trim();
            match parse_decimal(&record[2]) {
                Some(rate) => {
                    debug!(
                        "Loaded internal rate {} for project {}, task {}",
                        rate, project_id, task
                    );
                    table
                        .rates
                        .insert((project_id.to_string(), task.to_string()), rate);
                }
                None => warn!(
                    "Failed to parse rate from row {:?}: '{}' is not a number",
                    record,
                    record[2].trim()
                ),
            }
        }
        info!("Loaded {} internal rates", table.len());
        table
    }

    pub fn get(&self, project_id: &str, task: &str) -> Option<Decimal> {
        self.rates
            .get(&(project_id.to_string(), task.to_string()))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const CUSTOMER_CSV: &str = "\
AgileDay_projectId,Active,Client,Service name,included_hours,hour_rates,Group invoice,Invoice Info A2 Ext Id,Account A2 Ext ID,Billable Description,Tax_Code
p-1,Yes,Kahvila Ö,Ylläpito,all,internal,,INV-1,ACC-1,Jatkuva kehitys,25.5
p-2,no,Beta,Dev,orangit,,G-1,INV-2,ACC-2,,
p-3,yes,Gamma,Ops,Orangit,,,INV-3,ACC-3,,
";

    #[test]
    fn windows_1252_file_loads_like_its_utf8_twin() {
        let dir = tempfile::tempdir().unwrap();
        let utf8_path = dir.path().join("customers_utf8.csv");
        let legacy_path = dir.path().join("customers_1252.csv");
        fs::write(&utf8_path, CUSTOMER_CSV).unwrap();
        let (legacy_bytes, _, unmappable) = WINDOWS_1252.encode(CUSTOMER_CSV);
        assert!(!unmappable);
        assert!(std::str::from_utf8(&legacy_bytes).is_err());
        fs::write(&legacy_path, &legacy_bytes).unwrap();

        let from_utf8 = CustomerData::load(&utf8_path).unwrap();
        let from_legacy = CustomerData::load(&legacy_path).unwrap();
        assert_eq!(from_utf8.len(), 3);
        assert_eq!(from_legacy.len(), from_utf8.len());
        assert_eq!(from_legacy.get("p-1").unwrap().client, "Kahvila Ö");
        assert_eq!(from_legacy.get("p-1"), from_utf8.get("p-1"));
    }

    #[test]
    fn byte_order_mark_is_ignored() {
        let mut bytes = UTF8_BOM.to_vec();
        bytes.extend_from_slice(CUSTOMER_CSV.as_bytes());
        let (text, encoding) = decode_with_fallback(&bytes);
        assert_eq!(encoding, "utf-8");
        let data = CustomerData::parse(&text).unwrap();
        assert!(data.get("p-1").is_some());
    }

    #[test]
    fn policies_and_activity_are_interpreted() {
        let data = CustomerData::parse(CUSTOMER_CSV).unwrap();
        let p1 = data.get("p-1").unwrap();
        assert!(p1.is_active());
        assert_eq!(p1.included_hours_policy(), IncludedHours::All);
        assert_eq!(p1.hour_rate_policy(), HourRatePolicy::Internal);
        assert_eq!(p1.invoice_key(), "INV-1");

        assert!(!data.get("p-2").unwrap().is_active());
        assert_eq!(data.get("p-2").unwrap().invoice_key(), "G-1");

        let p3 = data.get("p-3").unwrap();
        assert_eq!(p3.included_hours_policy(), IncludedHours::InternalOnly);
        assert_eq!(p3.hour_rate_policy(), HourRatePolicy::Source);
        assert_eq!(p3.period_timing(), PeriodTiming::Post);

        let ids: Vec<&str> = data.active_projects().map(|c| c.project_id.as_str()).collect();
        assert_eq!(ids, vec!["p-1", "p-3"]);
    }

    #[test]
    fn inactive_duplicate_does_not_replace_an_active_row() {
        let data = CustomerData::parse(
            "AgileDay_projectId,Active,Client\np-1,yes,Acme\np-1,no,Acme (old)\n",
        )
        .unwrap();
        let ids: Vec<&str> = data.active_projects().map(|c| c.project_id.as_str()).collect();
        assert_eq!(ids, vec!["p-1"]);
        assert_eq!(data.get("p-1").unwrap().client, "Acme");
        assert_eq!(data.len(), 1);
    }

    #[test]
    fn later_duplicate_replaces_earlier_row_in_place() {
        let data = CustomerData::parse(
            "AgileDay_projectId,Active,Client\np-1,no,Old\np-2,yes,Beta\np-1,yes,New\n",
        )
        .unwrap();
        let ids: Vec<&str> = data.active_projects().map(|c| c.project_id.as_str()).collect();
        assert_eq!(ids, vec!["p-1", "p-2"]);
        assert_eq!(data.get("p-1").unwrap().client, "New");
    }

    #[test]
    fn invoice_key_falls_back_to_client() {
        let config = ProjectBillingConfig::new("p-9", "Delta Oy", "Support");
        assert_eq!(config.invoice_key(), "Delta Oy");
    }

    #[test]
    fn malformed_rate_rows_are_skipped() {
        let rates = InternalRates::parse(
            "p-1,Development,95.5\np-1,Design\np-2,Support,cheap\n\np-3, Ops ,80\n",
        );
        assert_eq!(rates.len(), 2);
        assert_eq!(rates.get("p-1", "Development"), Some(dec!(95.5)));
        assert_eq!(rates.get("p-3", "Ops"), Some(dec!(80)));
        assert_eq!(rates.get("p-2", "Support"), None);
    }

    #[test]
    fn missing_reference_file_is_invalid_input() {
        let dir = tempfile::tempdir().unwrap();
        let err = CustomerData::load(&dir.path().join("nope.csv")).unwrap_err();
        assert!(matches!(err, InvoicingError::InvalidInput(_)));
    }
}
