//! est-scraper - download smart meter consumption data from mans.e-st.lv.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use chrono::Local;
use clap::{ArgAction, Parser, ValueEnum};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use est_scraper::api::consumption::AsPolarsDf;
use est_scraper::api::{
    parse_flag, ConsumptionFetcher, ConsumptionRecord, Credentials, EnergyFlows, ObjectReference,
    PeriodKind, PeriodSpec,
};
use est_scraper::EstPortal;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "mans.e-st.lv electricity consumption data scraper"
)]
struct Args {
    /// Website username
    #[arg(long, env = "EST_USERNAME")]
    username: String,

    /// Website password
    #[arg(long, env = "EST_PASSWORD", hide_env_values = true)]
    password: String,

    /// Object EIC code
    #[arg(long = "objectid", env = "EST_OBJECT_ID")]
    object_id: String,

    /// Electricity meter ID
    #[arg(long, env = "EST_METER_ID")]
    meter: String,

    /// Report data time period
    #[arg(long, default_value = "month")]
    period: PeriodKind,

    /// Defaults to the current year
    #[arg(long)]
    year: Option<i32>,

    /// Defaults to the current month (day and month periods only)
    #[arg(long)]
    month: Option<u32>,

    /// Defaults to the current day (day period only)
    #[arg(long)]
    day: Option<u32>,

    /// Net consumption, with energy fed into the grid subtracted
    #[arg(long, action = ArgAction::Set, default_value = "True", value_parser = parse_flag)]
    neto: bool,

    /// Output both the consumed (A+) and returned (A-) series
    #[arg(long)]
    breakdown: bool,

    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,

    /// Save data in specified file
    #[arg(long, value_hint = clap::ValueHint::FilePath)]
    outfile: Option<PathBuf>,

    /// Portal address, EST_BASE_URL or the production portal when unset
    #[arg(long)]
    base_url: Option<String>,

    /// Request timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// Print debug logs
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Table,
}

enum Report {
    Records(Vec<ConsumptionRecord>),
    Flows(EnergyFlows),
}

impl Report {
    fn render(&self, format: OutputFormat) -> anyhow::Result<String> {
        match (self, format) {
            (Report::Records(records), OutputFormat::Json) => to_json(records),
            (Report::Flows(flows), OutputFormat::Json) => to_json(flows),
            (Report::Records(records), OutputFormat::Table) => {
                Ok(records.as_polars_df()?.to_string())
            }
            (Report::Flows(flows), OutputFormat::Table) => Ok(flows.as_polars_df()?.to_string()),
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> anyhow::Result<String> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut ser)?;
    Ok(String::from_utf8(buf)?)
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "est_scraper=debug"
    } else {
        "est_scraper=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // stdout is reserved for the report
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let credentials = Credentials::new(args.username, args.password);
    let object = ObjectReference::new(args.object_id, args.meter)?;
    let period = PeriodSpec::from_parts(
        args.period,
        args.year,
        args.month,
        args.day,
        Local::now().date_naive(),
    )?;

    let portal = match args.base_url {
        Some(base_url) => EstPortal::new()?.with_base_url(base_url)?,
        None => EstPortal::from_env_values()?,
    }
    .with_timeout(Duration::from_secs(args.timeout))?;

    let fetcher = ConsumptionFetcher::new(&portal);
    let session = fetcher
        .authenticate(&credentials)
        .with_context(|| format!("logging in to {}", portal.base_url()))?;

    let report = if args.breakdown {
        Report::Flows(fetcher.fetch_breakdown(&session, &object, &period)?)
    } else {
        Report::Records(fetcher.fetch(&session, &object, &period, args.neto)?)
    };
    let rendered = report.render(args.format)?;

    match args.outfile {
        Some(path) => {
            std::fs::write(&path, rendered)
                .with_context(|| format!("writing {}", path.display()))?;
            info!(path = %path.display(), "report saved");
        }
        None => println!("{}", rendered),
    }

    Ok(())
}
