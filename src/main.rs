//! CLI entry point for the PRF accident analysis pipeline.
//!
//! Provides subcommands for building the derived table with a full summary
//! and for exporting individual aggregation views as CSV for the external
//! charting layer.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use prf_accidents::{
    fetch::{ACCIDENTS_2022_URL, ACCIDENTS_2023_URL, BasicClient, fetch_bytes},
    model::Scope,
    output,
    pipeline::AccidentPipeline,
    stats::{self, AccidentSummary, KeyCount, RunRecord},
};
use std::ffi::OsStr;
use std::path::Path;
use tracing::info;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "prf_accidents")]
#[command(about = "Analyze PRF traffic accident data for Ceará (2022/2023)", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the derived table and log the full analysis summary
    Analyze {
        /// 2022 export: URL or local file path
        #[arg(long, default_value = ACCIDENTS_2022_URL)]
        source_2022: String,

        /// 2023 export: URL or local file path
        #[arg(long, default_value = ACCIDENTS_2023_URL)]
        source_2023: String,

        /// Analysis scope: metropolitan area or whole state
        #[arg(short, long, value_enum, default_value_t = Scope::State)]
        scope: Scope,

        /// Run log CSV to append results to
        #[arg(short, long, default_value = "runs.csv")]
        output: String,
    },
    /// Export one aggregation view as CSV
    Export {
        /// Which view to export
        #[arg(value_enum)]
        view: View,

        /// 2022 export: URL or local file path
        #[arg(long, default_value = ACCIDENTS_2022_URL)]
        source_2022: String,

        /// 2023 export: URL or local file path
        #[arg(long, default_value = ACCIDENTS_2023_URL)]
        source_2023: String,

        /// Analysis scope: metropolitan area or whole state
        #[arg(short, long, value_enum, default_value_t = Scope::State)]
        scope: Scope,

        /// Output CSV path
        #[arg(short, long, default_value = "view.csv")]
        output: String,
    },
}

/// The aggregation views the charting layer consumes.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum View {
    /// Involvement counts per age
    Age,
    /// Accident counts per vehicle type
    Vehicles,
    /// Top municipalities by accident deaths
    Municipalities,
    /// Accident counts per month
    Months,
    /// Accident counts per weather condition
    Weather,
    /// Full-table latitude/longitude points
    Geo,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/prf_accidents.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("prf_accidents.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse().unwrap()));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse().unwrap()));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Analyze {
            source_2022,
            source_2023,
            scope,
            output,
        } => {
            let mut pipeline = load_pipeline(&source_2022, &source_2023).await?;
            let built = pipeline.table(scope)?;
            let summary = AccidentSummary::from_table(scope, &built.0, &built.1);

            output::print_json(&summary)?;
            output::append_record(&output, &RunRecord::from_summary(&summary))?;
        }
        Commands::Export {
            view,
            source_2022,
            source_2023,
            scope,
            output,
        } => {
            let mut pipeline = load_pipeline(&source_2022, &source_2023).await?;
            let built = pipeline.table(scope)?;
            let table = &built.0;

            match view {
                View::Age => {
                    let entries: Vec<KeyCount> = stats::age_distribution(table)
                        .iter()
                        .map(|bucket| KeyCount {
                            key: bucket.age.to_string(),
                            count: bucket.count,
                        })
                        .collect();
                    output::write_counts_csv(&output, "idade", &entries)?;
                }
                View::Vehicles => output::write_counts_csv(
                    &output,
                    "tipo_veiculo",
                    &stats::vehicle_type_counts(table),
                )?,
                View::Municipalities => output::write_counts_csv(
                    &output,
                    "municipio",
                    &stats::top_fatal_municipalities(table),
                )?,
                View::Months => {
                    output::write_counts_csv(&output, "mes", &stats::monthly_counts(table))?
                }
                View::Weather => output::write_counts_csv(
                    &output,
                    "condicao_metereologica",
                    &stats::weather_distribution(table),
                )?,
                View::Geo => output::write_geo_csv(&output, &stats::geo_points(table))?,
            }

            info!(path = %output, scope = %scope, "View exported");
        }
    }

    Ok(())
}

/// Loads an export from a local file path or fetches it over HTTP.
#[tracing::instrument(fields(source = %source))]
async fn fetcher(source: &str) -> Result<Vec<u8>> {
    let bytes = if source.starts_with("http") {
        let client = BasicClient::new();
        fetch_bytes(&client, source).await?
    } else {
        std::fs::read(source)?
    };
    Ok(bytes)
}

/// Fetches both yearly exports and assembles the pipeline.
async fn load_pipeline(source_2022: &str, source_2023: &str) -> Result<AccidentPipeline> {
    let bytes_2022 = fetcher(source_2022).await?;
    let bytes_2023 = fetcher(source_2023).await?;
    info!(
        bytes_2022 = bytes_2022.len(),
        bytes_2023 = bytes_2023.len(),
        "Sources loaded"
    );

    AccidentPipeline::from_bytes(&[bytes_2022, bytes_2023])
}
