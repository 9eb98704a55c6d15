// src/fixed_fee.rs

use chrono::NaiveDate;
use csv::StringRecord;
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::aggregation::round_money;
use crate::error::{csv_context, io_context, InvoicingError};
use crate::invoice::{
    format_amount, group_by_first_seen, Invoice, InvoiceHeader, InvoiceMonth, InvoiceRow, Quantity,
};
use crate::reference_data::{read_text_with_fallback, PeriodTiming};

// Zero-based columns of the fixed-fee configuration sheet.
mod column {
    pub const CLIENT: usize = 1;
    pub const SERVICE_NAME: usize = 2;
    pub const ACTIVE: usize = 5;
    pub const MONTHLY_FIXED_FEE: usize = 9;
    pub const GROUP_INVOICE: usize = 16;
    pub const FIXED_FEE_DESCRIPTION: usize = 21;
    pub const BILLABLE_DESCRIPTION: usize = 22;
    pub const ACCOUNT_A2_EXT_ID: usize = 23;
    pub const INVOICE_INFO_A2_EXT_ID: usize = 24;
    pub const SALES_ITEM_FIXED: usize = 26;
    pub const TAX_APPLICABILITY: usize = 27;
    pub const TAX_CODE_FIXED: usize = 29;
    pub const CONTRACT_NUMBER: usize = 32;
    pub const CONFIG_ID: usize = 33;
    pub const CUSTOMER_REFERENCE: usize = 34;
    pub const OUR_REFERENCE: usize = 35;
    pub const PERIOD: usize = 40;
}

// Pass-through sheet layout.
const PASS_THROUGH_ID_ROW: usize = 3;
const PASS_THROUGH_FIRST_COLUMN: usize = 35;
const PASS_THROUGH_COLUMNS: usize = 12;
const PASS_THROUGH_DESCRIPTION_OFFSET: usize = 14;

static FEE_NOISE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^0-9.\-]").expect("fee pattern is valid"));

/// `"1 200.50 €"` -> `1200.50`. Anything unreadable is zero.
pub fn parse_fee(raw: &str) -> Decimal {
    let cleaned = FEE_NOISE.replace_all(raw, "");
    if cleaned.is_empty() {
        return Decimal::ZERO;
    }
    crate::time_entry::parse_decimal(&cleaned).unwrap_or_else(|| {
        warn!("Unreadable monthly fee '{}', treating as 0", raw.trim());
        Decimal::ZERO
    })
}

/// Pass-through cells use a decimal comma and may carry `€` and spaces.
pub fn parse_pass_through_amount(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .replace(',', ".")
        .chars()
        .filter(|c| *c != '€' && !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    crate::time_entry::parse_decimal(&cleaned)
}

fn cell(record: &StringRecord, index: usize) -> String {
    record.get(index).unwrap_or_default().trim().to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub struct FixedFeeConfig {
    pub client: String,
    pub service_name: String,
    pub active: String,
    pub monthly_fee: Decimal,
    pub group_invoice: String,
    pub fixed_fee_description: String,
    pub billable_description: String,
    pub account_a2_id: String,
    pub invoice_a2_id: String,
    pub sales_item_fixed: String,
    pub tax_applicability: String,
    pub tax_code: String,
    pub contract_number: String,
    pub config_id: String,
    pub customer_reference: String,
    pub our_reference: String,
    pub period: PeriodTiming,
}

impl FixedFeeConfig {
    pub fn from_record(record: &StringRecord) -> Self {
        Self {
            client: cell(record, column::CLIENT),
            service_name: cell(record, column::SERVICE_NAME),
            active: cell(record, column::ACTIVE),
            monthly_fee: parse_fee(record.get(column::MONTHLY_FIXED_FEE).unwrap_or_default()),
            group_invoice: cell(record, column::GROUP_INVOICE),
            fixed_fee_description: cell(record, column::FIXED_FEE_DESCRIPTION),
            billable_description: cell(record, column::BILLABLE_DESCRIPTION),
            account_a2_id: cell(record, column::ACCOUNT_A2_EXT_ID),
            invoice_a2_id: cell(record, column::INVOICE_INFO_A2_EXT_ID),
            sales_item_fixed: cell(record, column::SALES_ITEM_FIXED),
            tax_applicability: cell(record, column::TAX_APPLICABILITY),
            tax_code: cell(record, column::TAX_CODE_FIXED),
            contract_number: cell(record, column::CONTRACT_NUMBER),
            config_id: cell(record, column::CONFIG_ID),
            customer_reference: cell(record, column::CUSTOMER_REFERENCE),
            our_reference: cell(record, column::OUR_REFERENCE),
            period: PeriodTiming::parse(record.get(column::PERIOD).unwrap_or("post")),
        }
    }

    pub fn is_billable(&self) -> bool {
        self.active.eq_ignore_ascii_case("yes") && self.monthly_fee > Decimal::ZERO
    }

    /// Group invoice, then the Invoice A2 id, then the client name.
    pub fn invoice_key(&self) -> String {
        [&self.group_invoice, &self.invoice_a2_id, &self.client]
            .into_iter()
            .find(|v| !v.is_empty())
            .cloned()
            .unwrap_or_default()
    }

    pub fn header(&self, month: &InvoiceMonth, invoicing_date: NaiveDate) -> InvoiceHeader {
        let (period_start, period_end) = month.billing_period(self.period);
        InvoiceHeader {
            invoice_a2_id: self.invoice_a2_id.clone(),
            account_a2_id: self.account_a2_id.clone(),
            accounting_date: month.accounting_date(),
            invoicing_date,
            our_reference: self.our_reference.clone(),
            customer_reference: self.customer_reference.clone(),
            period_start,
            period_end,
            contract_number: self.contract_number.clone(),
        }
    }

    fn row(&self, description: String, amount: Decimal) -> InvoiceRow {
        let amount = round_money(amount);
        InvoiceRow {
            grouping_info: self.service_name.clone(),
            sales_item: self.sales_item_fixed.clone(),
            description,
            quantity: Quantity::Units(1),
            unit_price: amount,
            amount,
            tax_applicability: self.tax_applicability.clone(),
            tax_code: self.tax_code.clone(),
            customer_name: self.client.clone(),
            service_name: self.service_name.clone(),
            task: String::new(),
            project_id: self.config_id.clone(),
        }
    }

    pub fn fixed_fee_row(&self) -> InvoiceRow {
        self.row(
            format!("{} - {}", self.service_name, self.fixed_fee_description),
            self.monthly_fee,
        )
    }

    pub fn pass_through_row(&self, item: &PassThroughItem) -> InvoiceRow {
        self.row(item.description.clone(), item.amount)
    }
}

fn positional_reader(text: &str) -> csv::Reader<&[u8]> {
    csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes())
}

/// Active rows with a positive monthly fee, in file order.
pub fn parse_fixed_fee_configs(text: &str) -> Result<Vec<FixedFeeConfig>, InvoicingError> {
    let mut configs = Vec::new();
    let mut skipped = 0usize;
    for record in positional_reader(text).records() {
        let record = record.map_err(|e| csv_context(e, "Failed to read fixed-fee config row"))?;
        let config = FixedFeeConfig::from_record(&record);
        if config.is_billable() {
            debug!(
                "Fixed fee {} for {} / {}",
                format_amount(config.monthly_fee),
                config.client,
                config.service_name
            );
            configs.push(config);
        } else {
            skipped += 1;
        }
    }
    info!(
        "Read {} active config rows ({} rows without an active fee)",
        configs.len(),
        skipped
    );
    Ok(configs)
}

pub fn load_fixed_fee_configs(path: &Path) -> Result<Vec<FixedFeeConfig>, InvoicingError> {
    if !path.is_file() {
        return Err(InvoicingError::InvalidInput(format!(
            "Config file not found: {}",
            path.display()
        )));
    }
    let (text, encoding) = read_text_with_fallback(path)?;
    debug!("Read {} as {}", path.display(), encoding);
    parse_fixed_fee_configs(&text)
}

// --- Pass-through amounts ---

#[derive(Debug, Clone, PartialEq)]
pub struct PassThroughItem {
    pub config_id: String,
    pub amount: Decimal,
    pub description: String,
}

/// Reads the twelve pass-through columns of the month's row. A sheet without a row for
/// the month yields no items.
pub fn parse_pass_through(
    text: &str,
    month: &InvoiceMonth,
) -> Result<Vec<PassThroughItem>, InvoicingError> {
    let records = positional_reader(text)
        .records()
        .collect::<Result<Vec<StringRecord>, csv::Error>>()
        .map_err(|e| csv_context(e, "Failed to read pass-through sheet"))?;

    let label = month.sheet_label();
    let Some(row) = records
        .iter()
        .find(|r| r.get(0).map(str::trim) == Some(label.as_str()))
    else {
        warn!("No pass-through row for {} found", label);
        return Ok(Vec::new());
    };
    info!("Found the pass-through row for {}", label);
    let Some(ids) = records.get(PASS_THROUGH_ID_ROW) else {
        warn!("Pass-through sheet has no id row, ignoring pass-through amounts");
        return Ok(Vec::new());
    };

    let mut items = Vec::new();
    for offset in 0..PASS_THROUGH_COLUMNS {
        let col = PASS_THROUGH_FIRST_COLUMN + offset;
        let config_id = cell(ids, col);
        let raw_amount = cell(row, col);
        if config_id.is_empty() || raw_amount.is_empty() {
            continue;
        }
        let Some(amount) = parse_pass_through_amount(&raw_amount) else {
            warn!(
                "Skipping pass-through amount '{}' for config {}: not a number",
                raw_amount, config_id
            );
            continue;
        };
        items.push(PassThroughItem {
            config_id,
            amount,
            description: cell(row, col + PASS_THROUGH_DESCRIPTION_OFFSET),
        });
    }
    info!("Read {} pass-through amounts for {}", items.len(), label);
    Ok(items)
}

pub fn load_pass_through(
    path: &Path,
    month: &InvoiceMonth,
) -> Result<Vec<PassThroughItem>, InvoicingError> {
    if !path.is_file() {
        return Err(InvoicingError::InvalidInput(format!(
            "Input file not found: {}",
            path.display()
        )));
    }
    let (text, _) = read_text_with_fallback(path)?;
    parse_pass_through(&text, month)
}

/// One invoice per invoice key. Each config contributes its fixed-fee row followed by
/// its pass-through rows.
pub fn fixed_fee_invoices(
    configs: &[FixedFeeConfig],
    pass_through: &[PassThroughItem],
    month: &InvoiceMonth,
    invoicing_date: NaiveDate,
) -> Vec<Invoice> {
    group_by_first_seen(configs.iter(), |c| c.invoice_key())
        .into_iter()
        .filter_map(|(key, members)| {
            let owner = members.first()?;
            let header = owner.header(month, invoicing_date);
            let mut rows = Vec::new();
            for config in &members {
                rows.push(config.fixed_fee_row());
                rows.extend(
                    pass_through
                        .iter()
                        .filter(|item| !config.config_id.is_empty() && item.config_id == config.config_id)
                        .map(|item| config.pass_through_row(item)),
                );
            }
            Invoice::assemble(&key, header, rows)
        })
        .collect()
}

// --- Summary ---

#[derive(Debug, Serialize)]
struct FixedFeeSummaryRow<'a> {
    #[serde(rename = "Customer Name")]
    customer_name: &'a str,
    #[serde(rename = "Service Name")]
    service_name: &'a str,
    #[serde(rename = "ConnectID")]
    connect_id: String,
    #[serde(rename = "Invoice A2 ID")]
    invoice_a2_id: &'a str,
    #[serde(rename = "Account A2 ID")]
    account_a2_id: &'a str,
    #[serde(rename = "Grouping info (Memo)")]
    grouping_info: &'a str,
    #[serde(rename = "Sales Item")]
    sales_item: &'a str,
    #[serde(rename = "Description")]
    description: &'a str,
    #[serde(rename = "Quantity")]
    quantity: String,
    #[serde(rename = "Unit price")]
    unit_price: String,
    #[serde(rename = "Amount")]
    amount: String,
}

/// `<result>_summary.csv`: every emitted row with its customer and service.
pub fn write_fixed_fee_summary(path: &Path, invoices: &[Invoice]) -> Result<(), InvoicingError> {
    let mut writer = csv::Writer::from_path(path)
        .map_err(|e| csv_context(e, format!("Failed to create {}", path.display())))?;
    for invoice in invoices {
        for row in &invoice.rows {
            writer
                .serialize(FixedFeeSummaryRow {
                    customer_name: &row.customer_name,
                    service_name: &row.service_name,
                    connect_id: invoice.connect_id.to_string(),
                    invoice_a2_id: &invoice.header.invoice_a2_id,
                    account_a2_id: &invoice.header.account_a2_id,
                    grouping_info: &row.grouping_info,
                    sales_item: &row.sales_item,
                    description: &row.description,
                    quantity: row.quantity.to_string(),
                    unit_price: format_amount(row.unit_price),
                    amount: format_amount(row.amount),
                })
                .map_err(|e| csv_context(e, "Failed to write fixed-fee summary row"))?;
        }
    }
    writer
        .flush()
        .map_err(|e| io_context(e, format!("Failed to flush {}", path.display())))?;
    info!("Summary file written to {}", path.display());
    Ok(())
}
