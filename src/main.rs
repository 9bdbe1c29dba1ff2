use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use pg_index_insight::analysis::{advise, BloatThreshold, Inspector};
use pg_index_insight::catalog::{PgCatalog, DEFAULT_UNUSED_SCAN_LIMIT};
use pg_index_insight::config::{DbConfig, DEFAULT_CONNECT_TIMEOUT_SECS};
use pg_index_insight::models::FindingCategory;
use pg_index_insight::reporter::{IndexReport, ReportFormat, Reporter};
use std::path::PathBuf;
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// PostgreSQL index health inspector - finds unused, invalid, duplicate and bloated indexes
#[derive(Parser, Debug)]
#[command(name = "pg-index-insight")]
#[command(version = "0.1.0")]
#[command(about = "PostgreSQL index health inspector")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format
    #[arg(
        short = 'f',
        long = "format",
        value_enum,
        default_value = "table",
        global = true
    )]
    format: ReportFormat,

    /// Print the remediation statement for each finding (never executed)
    #[arg(long = "advise", global = true)]
    advise: bool,

    /// Also write the JSON report to a file
    #[arg(long = "json-report", global = true)]
    json_report: bool,

    /// Directory for JSON report files (defaults to the system temp dir)
    #[arg(long = "report-dir", global = true)]
    report_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Args, Debug, Clone)]
struct ConnectionArgs {
    /// Database host
    #[arg(
        short = 'H',
        long = "host",
        env = "POSTGRES_HOST",
        default_value = "localhost"
    )]
    host: String,

    /// Database port
    #[arg(long = "port", env = "POSTGRES_PORT", default_value = "5432")]
    port: u16,

    /// Database name
    #[arg(short = 'd', long = "database", env = "POSTGRES_DATABASE")]
    database: String,

    /// Username
    #[arg(short = 'u', long = "username", env = "POSTGRES_USER")]
    username: String,

    /// Password
    #[arg(short = 'p', long = "password", env = "POSTGRES_PASSWORD")]
    password: String,

    /// Seconds to wait for a pooled connection
    #[arg(long = "connect-timeout", default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS)]
    connect_timeout: u64,
}

impl ConnectionArgs {
    fn into_config(self) -> DbConfig {
        DbConfig::from_connection_params(
            self.host,
            self.port,
            self.database,
            self.username,
            self.password,
        )
        .with_connect_timeout(self.connect_timeout)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List indexes that are rarely or never scanned
    Unused {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// Indexes with fewer scans than this are reported
        #[arg(long = "max-scans", default_value_t = DEFAULT_UNUSED_SCAN_LIMIT)]
        max_scans: i64,
    },
    /// List indexes whose catalog validity flag is false
    Invalid {
        #[command(flatten)]
        connection: ConnectionArgs,
    },
    /// List B-tree indexes that duplicate another index
    Duplicate {
        #[command(flatten)]
        connection: ConnectionArgs,
    },
    /// List B-tree indexes whose estimated bloat reaches the threshold
    Bloated {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// Minimum estimated bloat percentage (0-100)
        #[arg(long = "threshold", allow_negative_numbers = true)]
        threshold: Option<i64>,
    },
    /// List indexes that are unused or invalid
    Inefficient {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// Indexes with fewer scans than this count as unused
        #[arg(long = "max-scans", default_value_t = DEFAULT_UNUSED_SCAN_LIMIT)]
        max_scans: i64,
    },
    /// Inspect every database listed in a YAML config file
    Config {
        /// Path to YAML config file
        #[arg(short = 'c', long = "config")]
        config_path: String,

        /// Category to classify
        #[arg(long = "category", value_enum)]
        category: FindingCategory,

        /// Minimum estimated bloat percentage (0-100), for the bloated category
        #[arg(long = "threshold", allow_negative_numbers = true)]
        threshold: Option<i64>,

        /// Indexes with fewer scans than this count as unused
        #[arg(long = "max-scans", default_value_t = DEFAULT_UNUSED_SCAN_LIMIT)]
        max_scans: i64,
    },
}

#[derive(Debug, Clone, Copy)]
struct RunOptions {
    category: FindingCategory,
    threshold: Option<i64>,
    max_scans: i64,
    advise: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Initialize logging
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let multi_database = matches!(cli.command, Commands::Config { .. });
    let (targets, category, threshold, max_scans) = match cli.command {
        Commands::Unused {
            connection,
            max_scans,
        } => (
            vec![connection.into_config()],
            FindingCategory::Unused,
            None,
            max_scans,
        ),
        Commands::Invalid { connection } => (
            vec![connection.into_config()],
            FindingCategory::Invalid,
            None,
            DEFAULT_UNUSED_SCAN_LIMIT,
        ),
        Commands::Duplicate { connection } => (
            vec![connection.into_config()],
            FindingCategory::Duplicate,
            None,
            DEFAULT_UNUSED_SCAN_LIMIT,
        ),
        Commands::Bloated {
            connection,
            threshold,
        } => (
            vec![connection.into_config()],
            FindingCategory::Bloated,
            threshold,
            DEFAULT_UNUSED_SCAN_LIMIT,
        ),
        Commands::Inefficient {
            connection,
            max_scans,
        } => (
            vec![connection.into_config()],
            FindingCategory::Inefficient,
            None,
            max_scans,
        ),
        Commands::Config {
            config_path,
            category,
            threshold,
            max_scans,
        } => {
            info!("Loading config from: {}", config_path);
            (
                DbConfig::from_config_file(&config_path)?,
                category,
                threshold,
                max_scans,
            )
        }
    };

    // Reject a bad threshold before connecting anywhere
    if let Some(value) = threshold {
        BloatThreshold::new(value)?;
    }

    let options = RunOptions {
        category,
        threshold,
        max_scans,
        advise: cli.advise,
    };

    let mut runs = JoinSet::new();
    for (position, config) in targets.into_iter().enumerate() {
        runs.spawn(async move { (position, inspect(config, options).await) });
    }

    let mut outcomes = Vec::new();
    while let Some(joined) = runs.join_next().await {
        outcomes.push(joined.context("inspection task panicked")?);
    }
    outcomes.sort_by_key(|(position, _)| *position);

    let reporter = Reporter::new(cli.format);
    let report_dir = cli.report_dir.unwrap_or_else(std::env::temp_dir);
    let mut reports = Vec::with_capacity(outcomes.len());
    let mut failures = 0;

    for (_, outcome) in outcomes {
        match outcome {
            Ok(report) => {
                if cli.json_report {
                    let path = report.write_json_file(&report_dir)?;
                    eprintln!("JSON report written to {}", path.display());
                }
                reports.push(report);
            }
            Err(err) => {
                error!("{:#}", err);
                failures += 1;
            }
        }
    }

    if multi_database {
        reporter.report_all(&reports)?;
    } else {
        for report in &reports {
            reporter.report(report)?;
        }
    }

    if failures > 0 {
        anyhow::bail!("{} of the inspected databases could not be classified", failures);
    }

    Ok(())
}

async fn inspect(config: DbConfig, options: RunOptions) -> anyhow::Result<IndexReport> {
    info!("Inspecting database: {}", config.database);
    let database = config.database.clone();

    let catalog = PgCatalog::connect(&config)
        .await
        .with_context(|| format!("cannot inspect {database}"))?
        .with_unused_scan_limit(options.max_scans);
    let inspector = Inspector::new(catalog, config)
        .await
        .with_context(|| format!("cannot inspect {database}"))?;

    let findings = inspector
        .classify(options.category, options.threshold)
        .await
        .with_context(|| {
            format!(
                "cannot classify {} indexes in {database}",
                options.category.slug()
            )
        })?;

    let mut report = IndexReport::new(
        options.category,
        &database,
        inspector.context(),
        &findings,
        chrono::Utc::now(),
    );
    if options.advise {
        report = report.with_advice(findings.iter().map(advise).collect());
    }

    Ok(report)
}
