// src/main.rs

use anyhow::{bail, Context, Result};
use chrono::{Datelike, Local, NaiveDate};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

mod aggregation;
mod agileday_client;
mod config;
mod error;
mod fixed_fee;
mod invoice;
mod invoice_tests;
mod pipeline;
mod rates;
mod reference_data;
mod reports;
mod time_entry;

use agileday_client::{AgileDayClient, CachingTimeSource, TimeSource};
use config::{Settings, DEFAULT_HOUR_STATUS};
use invoice::InvoiceMonth;
use pipeline::{
    fetch_hours, run_fixed_fee, run_utilization, FetchHoursRequest, FixedFeeRequest,
    HoursSource, InvoicingOutcome, InvoicingPipeline, InvoicingRequest, UtilizationRequest,
};

// --- CLI ---

#[derive(Parser)]
#[command(
    name = "billable-invoicing",
    version,
    about = "Turns AgileDay hours and billing reference data into Workday invoice transfer files"
)]
struct Cli {
    /// Log at DEBUG instead of INFO
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Employer whose hours count as internal (overrides INTERNAL_COMPANY)
    #[arg(long, global = true)]
    company: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch hours from AgileDay, write the raw exports and invoice the billable ones
    FetchHours(FetchHoursArgs),
    /// Invoice hours from an existing raw hours CSV
    Invoice(InvoiceArgs),
    /// Write utilization summaries from a raw hours CSV or from AgileDay
    Utilization(UtilizationArgs),
    /// Invoice monthly fixed fees and pass-through costs
    FixedFee(FixedFeeArgs),
}

#[derive(Args)]
struct MonthArgs {
    /// Invoicing month as YYYY-MM
    #[arg(long, conflicts_with_all = ["year", "month"])]
    invoice_month: Option<String>,
    /// Invoicing year, used together with --month
    #[arg(long, requires = "month")]
    year: Option<i32>,
    /// Invoicing month (1-12)
    #[arg(long, requires = "year")]
    month: Option<u32>,
    /// Invoicing date written to the headers, defaults to today
    #[arg(long)]
    invoicing_date: Option<NaiveDate>,
}

impl MonthArgs {
    fn resolve(&self, default: InvoiceMonth) -> Result<InvoiceMonth> {
        if let Some(raw) = &self.invoice_month {
            return InvoiceMonth::parse(raw).context("Invalid --invoice-month");
        }
        match (self.year, self.month) {
            (Some(year), Some(month)) => {
                InvoiceMonth::new(year, month).context("Invalid --year/--month")
            }
            _ => Ok(default),
        }
    }

    fn invoicing_date(&self, today: NaiveDate) -> NaiveDate {
        self.invoicing_date.unwrap_or(today)
    }
}

#[derive(Args)]
struct FetchHoursArgs {
    /// Directory where all output files are written
    #[arg(long)]
    output_path: PathBuf,
    #[arg(long)]
    customer_data: PathBuf,
    /// CSV of internal hour rates: project id, task, rate
    #[arg(long)]
    rates_file: PathBuf,
    /// File name of the transfer file inside the output directory
    #[arg(long)]
    result_file: String,
    #[arg(long)]
    start_date: NaiveDate,
    #[arg(long)]
    end_date: NaiveDate,
    #[arg(long, default_value = DEFAULT_HOUR_STATUS)]
    status: String,
    #[command(flatten)]
    month: MonthArgs,
}

#[derive(Args)]
struct InvoiceArgs {
    #[arg(long)]
    customer_data: PathBuf,
    #[arg(long)]
    rates_file: PathBuf,
    /// Raw hours CSV written by fetch-hours
    #[arg(long)]
    raw_hours: PathBuf,
    #[arg(long)]
    output: PathBuf,
    #[command(flatten)]
    month: MonthArgs,
}

#[derive(Args)]
struct UtilizationArgs {
    #[arg(short, long)]
    customer_data: PathBuf,
    /// Raw hours CSV; hours are fetched from AgileDay when omitted
    #[arg(short, long)]
    raw_hours: Option<PathBuf>,
    #[arg(short, long)]
    output: PathBuf,
    #[arg(long)]
    start_date: Option<NaiveDate>,
    #[arg(long)]
    end_date: Option<NaiveDate>,
    #[arg(long, default_value = DEFAULT_HOUR_STATUS)]
    status: String,
}

#[derive(Args)]
struct FixedFeeArgs {
    /// Pass-through spreadsheet export
    #[arg(long)]
    input: PathBuf,
    /// Fixed-fee configuration CSV
    #[arg(long)]
    config: PathBuf,
    #[arg(long)]
    output: PathBuf,
    #[command(flatten)]
    month: MonthArgs,
}

// --- Commands ---

fn agileday_client(settings: &Settings) -> Result<CachingTimeSource<AgileDayClient>> {
    let token = settings
        .require_token()
        .context("AgileDay API token is required")?;
    let client = AgileDayClient::new(&settings.agileday_api_url, &token)
        .context("Failed to create AgileDay client")?;
    info!("AgileDay client initialized for {}", settings.agileday_api_url);
    Ok(CachingTimeSource::new(client))
}

fn log_invoicing_outcome(outcome: &InvoicingOutcome) {
    info!(
        "Invoiced {} hours for {} in {} invoices ({} lines), summary in {}",
        invoice::format_amount(outcome.totals.hours),
        invoice::format_amount(outcome.totals.amount),
        outcome.totals.invoices,
        outcome.totals.lines,
        outcome.summary_file.display()
    );
    if outcome.projects_not_included > 0 {
        warn!(
            "{} internal projects with billable hours were not invoiced",
            outcome.projects_not_included
        );
    }
}

async fn run_fetch_hours(
    args: FetchHoursArgs,
    settings: &Settings,
    internal_company: &str,
    today: NaiveDate,
) -> Result<bool> {
    if args.start_date > args.end_date {
        bail!("Start date {} is after end date {}", args.start_date, args.end_date);
    }
    let source = agileday_client(settings)?;
    let default_month = InvoiceMonth::containing(today)?.previous()?;
    let request = FetchHoursRequest {
        output_dir: args.output_path.clone(),
        customer_data: args.customer_data,
        rates_file: args.rates_file,
        result_file_name: args.result_file,
        start: args.start_date,
        end: args.end_date,
        status: args.status,
        month: args.month.resolve(default_month)?,
        invoicing_date: args.month.invoicing_date(today),
    };
    let mut pipeline = InvoicingPipeline::with_file_reporter(
        internal_company,
        settings.workday_profile(),
        &args.output_path,
    );
    let outcome = fetch_hours(&source, &request, &mut pipeline)
        .await
        .context("Fetching and invoicing hours failed")?;
    info!(
        "Fetched {} entries, {} billable with project data, {} projects looked up",
        outcome.fetched,
        outcome.filtered,
        source.cached_projects().await
    );
    log_invoicing_outcome(&outcome.invoicing);
    Ok(outcome.failed.is_empty())
}

fn run_invoice(
    args: InvoiceArgs,
    settings: &Settings,
    internal_company: &str,
    today: NaiveDate,
) -> Result<bool> {
    let default_month = InvoiceMonth::containing(today)?.previous()?;
    let output_dir = args
        .output
        .parent()
        .map(PathBuf::from)
        .unwrap_or_default();
    let request = InvoicingRequest {
        customer_data: args.customer_data,
        rates_file: args.rates_file,
        hours: HoursSource::File(args.raw_hours),
        result_file: args.output,
        month: args.month.resolve(default_month)?,
        invoicing_date: args.month.invoicing_date(today),
    };
    let mut pipeline = InvoicingPipeline::with_file_reporter(
        internal_company,
        settings.workday_profile(),
        &output_dir,
    );
    let outcome = match pipeline.run(&request) {
        Ok(outcome) => outcome,
        Err(e) => {
            let stage = e
                .stage()
                .map_or_else(|| "setup".to_string(), |stage| stage.to_string());
            error!("Invoicing stopped at {}, pipeline {}", stage, pipeline.state());
            return Err(e).context("Invoicing failed");
        }
    };
    log_invoicing_outcome(&outcome);
    for failure in &outcome.failed {
        warn!(
            "Failed task '{}' of project {}: {}",
            failure.project_task, failure.project_id, failure.error
        );
    }
    Ok(outcome.failed.is_empty())
}

async fn run_utilization_command(
    args: UtilizationArgs,
    settings: &Settings,
    internal_company: &str,
) -> Result<bool> {
    let hours = match args.raw_hours {
        Some(path) => HoursSource::File(path),
        None => {
            let (Some(start), Some(end)) = (args.start_date, args.end_date) else {
                bail!("--start-date and --end-date are required when fetching hours from AgileDay");
            };
            info!("Fetching hours from AgileDay API for {} to {}", start, end);
            let source = agileday_client(settings)?;
            HoursSource::Entries(source.fetch_entries(start, end, &args.status).await?)
        }
    };
    let request = UtilizationRequest {
        customer_data: args.customer_data,
        hours,
        result_file: args.output,
        start: args.start_date,
        end: args.end_date,
    };
    let outcome = run_utilization(&request, internal_company, &settings.role_directory())
        .context("Utilization report failed")?;
    info!(
        "Utilization: {} hours, {}% billable, {} weeks, {} projects not in customer data",
        invoice::format_amount(outcome.totals.hours),
        invoice::format_amount(outcome.totals.billable_percentage()),
        outcome.weeks,
        outcome.projects_not_found
    );
    Ok(true)
}

fn run_fixed_fee_command(args: FixedFeeArgs, settings: &Settings, today: NaiveDate) -> Result<bool> {
    let default_month = InvoiceMonth::new(today.year(), today.month())?;
    let request = FixedFeeRequest {
        config_file: args.config,
        pass_through_file: args.input,
        result_file: args.output,
        month: args.month.resolve(default_month)?,
        invoicing_date: args.month.invoicing_date(today),
    };
    let outcome = run_fixed_fee(&request, &settings.workday_profile())
        .context("Fixed-fee invoicing failed")?;
    info!(
        "Wrote {} fixed-fee invoices to {}",
        outcome.totals.invoices,
        request.result_file.display()
    );
    for failure in &outcome.failed {
        warn!(
            "Failed row '{}' of project {}: {}",
            failure.project_task, failure.project_id, failure.error
        );
    }
    Ok(outcome.failed.is_empty())
}

// --- Main ---

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Setting tracing subscriber failed")?;

    let settings = Settings::from_env().context("Failed to load settings from environment")?;
    let internal_company = cli
        .company
        .clone()
        .unwrap_or_else(|| settings.internal_company.clone());
    info!("Internal company: {}", internal_company);
    let today = Local::now().date_naive();

    let result = match cli.command {
        Command::FetchHours(args) => {
            run_fetch_hours(args, &settings, &internal_company, today).await
        }
        Command::Invoice(args) => run_invoice(args, &settings, &internal_company, today),
        Command::Utilization(args) => {
            run_utilization_command(args, &settings, &internal_company).await
        }
        Command::FixedFee(args) => run_fixed_fee_command(args, &settings, today),
    };

    match result {
        Ok(true) => Ok(ExitCode::SUCCESS),
        Ok(false) => {
            error!("Some records failed, see errors.csv and the log above");
            Ok(ExitCode::FAILURE)
        }
        Err(e) => {
            error!("{:#}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}
