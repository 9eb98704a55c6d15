// src/invoice.rs

use chrono::{Datelike, Months, NaiveDate};
use encoding_rs::{EncoderResult, WINDOWS_1252};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aggregation::AggregatedLine;
use crate::config::WorkdayProfile;
use crate::error::{io_context, InvoicingError};
use crate::reference_data::{PeriodTiming, ProjectBillingConfig};

const TRANSFER_TITLE_H: &str = "Row type H= Title;ConnectID;Invoice A2 ID;Account A2 ID;Free text;Accounting date[YYYY-MM-DD];Invoicing date[YYYY-MM-DD];Our reference;Customer reference;Period Start date [YYYY-MM-DD];Period End date [YYYY-MM-DD];Contract number;PO number;Appendix 1;Appendix 2;Appendix 3;Appendix 4;;;Source System;";
const TRANSFER_TITLE_R: &str = "Row type R= Row;ConnectID;Grouping info (Memo);Sales Item;Description;Quantity;Unit of measure;Unit price;Dim 1: Cost center;Dim 2: Business line (Function);Dim 3: Area;Dim 4: Service;Dim 5: Project;Dim 7: Counter company;Dim 8: Work type;Dim 10: Official;Dim 11: Employee;Dim 13: Company;Tax_Applicability;Tax_Code;";

/// Two decimals, period separator.
pub fn format_amount(value: Decimal) -> String {
    format!("{:.2}", crate::aggregation::round_money(value))
}

// --- Invoicing month ---

/// The calendar month being invoiced, with the dates derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvoiceMonth {
    first_day: NaiveDate,
    last_day: NaiveDate,
    next_first_day: NaiveDate,
    next_last_day: NaiveDate,
}

impl InvoiceMonth {
    pub fn new(year: i32, month: u32) -> Result<Self, InvoicingError> {
        let invalid = || InvoicingError::InvalidInput(format!("Invalid invoicing month {}-{}", year, month));
        let first_day = NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(invalid)?;
        let next_first_day = first_day
            .checked_add_months(Months::new(1))
            .ok_or_else(invalid)?;
        let after_next = next_first_day
            .checked_add_months(Months::new(1))
            .ok_or_else(invalid)?;
        Ok(Self {
            first_day,
            last_day: next_first_day.pred_opt().ok_or_else(invalid)?,
            next_first_day,
            next_last_day: after_next.pred_opt().ok_or_else(invalid)?,
        })
    }

    /// `YYYY-MM`
    pub fn parse(raw: &str) -> Result<Self, InvoicingError> {
        let invalid = || InvoicingError::InvalidInput(format!("Invalid month '{}', expected YYYY-MM", raw));
        let (year, month) = raw.trim().split_once('-').ok_or_else(invalid)?;
        let year = year.parse::<i32>().map_err(|_| invalid())?;
        let month = month.parse::<u32>().map_err(|_| invalid())?;
        Self::new(year, month)
    }

    pub fn containing(date: NaiveDate) -> Result<Self, InvoicingError> {
        Self::new(date.year(), date.month())
    }

    pub fn previous(&self) -> Result<Self, InvoicingError> {
        let last_of_previous = self.first_day.pred_opt().ok_or_else(|| {
            InvoicingError::InvalidInput(format!("No month before {}", self))
        })?;
        Self::containing(last_of_previous)
    }

    pub fn year(&self) -> i32 {
        self.first_day.year()
    }

    pub fn month(&self) -> u32 {
        self.first_day.month()
    }

    pub fn first_day(&self) -> NaiveDate {
        self.first_day
    }

    pub fn last_day(&self) -> NaiveDate {
        self.last_day
    }

    /// First day of the following month.
    pub fn accounting_date(&self) -> NaiveDate {
        self.next_first_day
    }

    pub fn billing_period(&self, timing: PeriodTiming) -> (NaiveDate, NaiveDate) {
        match timing {
            PeriodTiming::Post => (self.first_day, self.last_day),
            PeriodTiming::Pre => (self.next_first_day, self.next_last_day),
        }
    }

    /// `MM/YYYY`, the row label of the pass-through sheet.
    pub fn sheet_label(&self) -> String {
        format!("{:02}/{}", self.month(), self.year())
    }
}

impl fmt::Display for InvoiceMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}", self.year(), self.month())
    }
}

// --- Invoice records ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceHeader {
    pub invoice_a2_id: String,
    pub account_a2_id: String,
    pub accounting_date: NaiveDate,
    pub invoicing_date: NaiveDate,
    pub our_reference: String,
    pub customer_reference: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub contract_number: String,
}

impl InvoiceHeader {
    pub fn from_config(
        config: &ProjectBillingConfig,
        month: &InvoiceMonth,
        invoicing_date: NaiveDate,
    ) -> Self {
        let (period_start, period_end) = month.billing_period(config.period_timing());
        Self {
            invoice_a2_id: config.invoice_a2_id.clone(),
            account_a2_id: config.account_a2_id.clone(),
            accounting_date: month.accounting_date(),
            invoicing_date,
            our_reference: config.our_reference.clone(),
            customer_reference: config.customer_reference.clone(),
            period_start,
            period_end,
            contract_number: config.contract_number.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    Hours(Decimal),
    Units(u32),
}

impl Quantity {
    pub fn value(&self) -> Decimal {
        match self {
            Quantity::Hours(h) => *h,
            Quantity::Units(n) => Decimal::from(*n),
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quantity::Hours(h) => f.write_str(&format_amount(*h)),
            Quantity::Units(n) => write!(f, "{}", n),
        }
    }
}

/// One `R` record plus the names it was built from, for summaries.
#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceRow {
    pub grouping_info: String,
    pub sales_item: String,
    pub description: String,
    pub quantity: Quantity,
    pub unit_price: Decimal,
    pub amount: Decimal,
    pub tax_applicability: String,
    pub tax_code: String,
    pub customer_name: String,
    pub service_name: String,
    pub task: String,
    pub project_id: String,
}

impl InvoiceRow {
    pub fn for_hours(line: &AggregatedLine<'_>, config: &ProjectBillingConfig) -> Self {
        Self {
            grouping_info: line.project_name.clone(),
            sales_item: config.sales_item_hours.clone(),
            description: format!(
                "{} - {} - {}",
                line.project_name, config.billable_description, line.task
            ),
            quantity: Quantity::Hours(line.hours),
            unit_price: line.rate,
            amount: line.amount,
            tax_applicability: config.tax_applicability.clone(),
            tax_code: config.tax_code.clone(),
            customer_name: config.client_label().to_string(),
            service_name: config.service_label().to_string(),
            task: line.task.clone(),
            project_id: line.project_id.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Invoice {
    pub connect_id: Uuid,
    pub key: String,
    pub header: InvoiceHeader,
    pub rows: Vec<InvoiceRow>,
}

impl Invoice {
    /// Drops zero-amount rows. `None` when nothing is left to bill.
    pub fn assemble(key: &str, header: InvoiceHeader, rows: Vec<InvoiceRow>) -> Option<Self> {
        let rows: Vec<InvoiceRow> = rows
            .into_iter()
            .filter(|row| {
                let keep = !row.amount.is_zero();
                if !keep {
                    debug!(
                        "Skipping zero amount row - {}, Quantity: {}, Price: {}",
                        row.description,
                        row.quantity,
                        format_amount(row.unit_price)
                    );
                }
                keep
            })
            .collect();
        if rows.is_empty() {
            info!("Skipping invoice for group {} - no non-zero amount rows", key);
            return None;
        }
        Some(Self {
            connect_id: Uuid::new_v4(),
            key: key.to_string(),
            header,
            rows,
        })
    }
}

/// Groups items by key, keeping the order in which keys are first seen.
pub fn group_by_first_seen<T, K>(items: impl IntoIterator<Item = T>, key: K) -> Vec<(String, Vec<T>)>
where
    K: Fn(&T) -> String,
{
    let mut groups: Vec<(String, Vec<T>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for item in items {
        let k = key(&item);
        match index.get(&k) {
            Some(&i) => groups[i].1.push(item),
            None => {
                index.insert(k.clone(), groups.len());
                groups.push((k, vec![item]));
            }
        }
    }
    groups
}

/// Time-based invoices: one per invoice key, header metadata from the first line's project.
pub fn hour_invoices(
    lines: &[AggregatedLine<'_>],
    month: &InvoiceMonth,
    invoicing_date: NaiveDate,
) -> Vec<Invoice> {
    let configured = lines
        .iter()
        .filter_map(|line| line.config.map(|config| (line, config)));
    group_by_first_seen(configured, |(_, config)| config.invoice_key())
        .into_iter()
        .filter_map(|(key, members)| {
            let (_, owner) = members.first()?;
            let header = InvoiceHeader::from_config(owner, month, invoicing_date);
            let rows = members
                .iter()
                .map(|(line, config)| InvoiceRow::for_hours(line, config))
                .collect();
            Invoice::assemble(&key, header, rows)
        })
        .collect()
}

// --- Totals ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferTotals {
    pub amount: Decimal,
    pub hours: Decimal,
    pub invoices: usize,
    pub lines: usize,
}

impl TransferTotals {
    /// The totals with `invoice` added, `None` when a sum overflows.
    fn with_invoice(&self, invoice: &Invoice) -> Option<Self> {
        let mut next = *self;
        for row in &invoice.rows {
            next.amount = next.amount.checked_add(row.amount)?;
            if let Quantity::Hours(h) = row.quantity {
                next.hours = next.hours.checked_add(h)?;
            }
            next.lines += 1;
        }
        next.invoices += 1;
        Some(next)
    }

    pub fn log(&self) {
        info!("Number of invoices (H rows): {}", self.invoices);
        info!("Number of invoice rows (R rows): {}", self.lines);
        info!("Total hours: {}", format_amount(self.hours));
        info!("Total amount: {}", format_amount(self.amount));
    }
}

/// The invoices of one transfer file and the totals written to its header.
#[derive(Debug, Clone, Default)]
pub struct TransferBatch {
    pub invoices: Vec<Invoice>,
    pub totals: TransferTotals,
    /// Left out because the file totals would overflow with them.
    pub rejected: Vec<Invoice>,
}

impl TransferBatch {
    /// Takes invoices in order while the running totals stay representable.
    pub fn admit(candidates: Vec<Invoice>) -> Self {
        let mut batch = Self::default();
        for invoice in candidates {
            match batch.totals.with_invoice(&invoice) {
                Some(totals) => {
                    batch.totals = totals;
                    batch.invoices.push(invoice);
                }
                None => {
                    warn!(
                        "Invoice for group {} overflows the transfer totals, left out of the file",
                        invoice.key
                    );
                    batch.rejected.push(invoice);
                }
            }
        }
        batch
    }
}

// --- Transfer file ---

fn header_record(connect_id: &Uuid, header: &InvoiceHeader, profile: &WorkdayProfile) -> String {
    let date = |d: NaiveDate| d.format("%Y-%m-%d").to_string();
    let connect_id = connect_id.to_string();
    let accounting_date = date(header.accounting_date);
    let invoicing_date = date(header.invoicing_date);
    let period_start = date(header.period_start);
    let period_end = date(header.period_end);
    [
        "H",
        connect_id.as_str(),
        header.invoice_a2_id.as_str(),
        header.account_a2_id.as_str(),
        "",
        accounting_date.as_str(),
        invoicing_date.as_str(),
        header.our_reference.as_str(),
        header.customer_reference.as_str(),
        period_start.as_str(),
        period_end.as_str(),
        header.contract_number.as_str(),
        "",
        "",
        "",
        "",
        "",
        "",
        "",
        profile.source_system.as_str(),
        "",
    ]
    .join(";")
}

fn row_record(connect_id: &Uuid, row: &InvoiceRow, profile: &WorkdayProfile) -> String {
    let connect_id = connect_id.to_string();
    let quantity = row.quantity.to_string();
    let unit_price = format_amount(row.unit_price);
    let dims = &profile.dimensions;
    [
        "R",
        connect_id.as_str(),
        row.grouping_info.as_str(),
        row.sales_item.as_str(),
        row.description.as_str(),
        quantity.as_str(),
        "",
        unit_price.as_str(),
        dims.cost_center.as_str(),
        dims.business_line.as_str(),
        dims.area.as_str(),
        dims.service.as_str(),
        "",
        "",
        "",
        "",
        "",
        "",
        row.tax_applicability.as_str(),
        row.tax_code.as_str(),
        "",
    ]
    .join(";")
}

/// The full transfer file text: two title lines, two schema lines, then `H`/`R` records.
pub fn render_transfer(batch: &TransferBatch, profile: &WorkdayProfile) -> String {
    let mut lines = vec![
        format!(
            "Invoice transfer into Workday;;;Company code:;{};;;Invoicing total;;;;;;;;;;;;;",
            profile.company_code
        ),
        format!(
            "Title information/Row information;;;Reply-to-email:;{};;;{};;;;;;;;;;;;;",
            profile.reply_email,
            format_amount(batch.totals.amount)
        ),
        TRANSFER_TITLE_H.to_string(),
        TRANSFER_TITLE_R.to_string(),
    ];
    for invoice in &batch.invoices {
        lines.push(header_record(&invoice.connect_id, &invoice.header, profile));
        for row in &invoice.rows {
            info!(
                "{}, Quantity: {}, Price: {}, Amount: {}",
                row.description,
                row.quantity,
                format_amount(row.unit_price),
                format_amount(row.amount)
            );
            lines.push(row_record(&invoice.connect_id, row, profile));
        }
    }
    let mut text = lines.join("\n");
    text.push('\n');
    text
}

/// windows-1252 bytes; characters outside the code page become `?`.
pub fn encode_windows_1252(text: &str) -> Vec<u8> {
    let mut encoder = WINDOWS_1252.new_encoder();
    let mut out = Vec::with_capacity(text.len());
    let mut buffer = [0u8; 4096];
    let mut remaining = text;
    loop {
        let (result, read, written) =
            encoder.encode_from_utf8_without_replacement(remaining, &mut buffer, true);
        out.extend_from_slice(&buffer[..written]);
        remaining = &remaining[read..];
        match result {
            EncoderResult::InputEmpty => break,
            EncoderResult::OutputFull => continue,
            EncoderResult::Unmappable(c) => {
                debug!("Replacing unmappable character {:?} with '?'", c);
                out.push(b'?');
            }
        }
    }
    out
}

pub fn temp_sibling(path: &Path) -> PathBuf {
    path.with_extension("tmp")
}

/// Writes `bytes` to a `.tmp` sibling and renames it over `path`.
/// The temp file is removed when anything fails.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), InvoicingError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| io_context(e, format!("Failed to create directory {}", parent.display())))?;
    }
    let temp_path = temp_sibling(path);
    let result = fs::write(&temp_path, bytes)
        .map_err(|e| io_context(e, format!("Failed to write {}", temp_path.display())))
        .and_then(|_| {
            fs::rename(&temp_path, path).map_err(|e| {
                io_context(
                    e,
                    format!("Failed to move {} to {}", temp_path.display(), path.display()),
                )
            })
        });
    if let Err(e) = &result {
        error!("Failed to write result file: {}", e);
        if temp_path.exists() {
            if let Err(cleanup) = fs::remove_file(&temp_path) {
                error!("Failed to remove {}: {}", temp_path.display(), cleanup);
            }
        }
    }
    result
}

pub fn write_transfer_file(
    path: &Path,
    batch: &TransferBatch,
    profile: &WorkdayProfile,
) -> Result<(), InvoicingError> {
    let text = render_transfer(batch, profile);
    write_atomic(path, &encode_windows_1252(&text))?;
    info!("Successfully wrote result file: {}", path.display());
    Ok(())
}

/// `<dir>/<stem><suffix>.<ext>` next to the result file.
pub fn sibling_with_suffix(path: &Path, suffix: &str, extension: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{}{}.{}", stem, suffix, extension))
}
