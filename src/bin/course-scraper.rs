//! course-scraper CLI - extract course catalogs into flat datasets
//!
//! Runs retrievals described by a YAML configuration and writes the
//! resulting datasets as JSON or NDJSON.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use course_scraper::serialization::{write_dataset, write_terms};
use course_scraper::{ConfigNode, Document, OutputFormat, QueryTool, Retriever, Substitutor, Target, Variables};

#[derive(Parser)]
#[command(name = "course-scraper")]
#[command(version, about = "Configuration-driven course catalog extraction", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire a catalog and extract it into a dataset
    Extract {
        /// Path to the YAML retrieval configuration
        #[arg(short, long)]
        config: PathBuf,

        /// Local variable as key=value (repeatable)
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,

        /// Term to retrieve, bound as ${term} (repeatable)
        #[arg(short, long = "term")]
        terms: Vec<String>,

        /// Output format (json, json-array, ndjson)
        #[arg(short, long, default_value = "json")]
        format: OutputFormat,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Copy the raw catalog to this file
        #[arg(long)]
        tee: Option<PathBuf>,
    },

    /// Validate a retrieval configuration without fetching anything
    Validate {
        /// Path to the YAML retrieval configuration
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Evaluate one query against a local XML document
    Query {
        /// XML document to query
        #[arg(short, long)]
        file: PathBuf,

        /// Query expression, e.g. "//course/@id"
        #[arg(short, long)]
        expr: String,

        /// Local variable as key=value (repeatable)
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Extract { config, vars, terms, format, output, tee } => {
            extract(&config, &vars, &terms, format, output.as_deref(), tee.as_deref()).await
        }
        Commands::Validate { config } => validate(&config),
        Commands::Query { file, expr, vars } => query(&file, &expr, &vars),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn parse_vars(pairs: &[String]) -> Result<Variables> {
    let mut vars = Variables::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("invalid --var '{}', expected KEY=VALUE", pair);
        };
        vars.insert(key.trim().to_string(), value.to_string());
    }
    Ok(vars)
}

fn open_output(output: Option<&Path>) -> Result<Box<dyn Write>> {
    match output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            Ok(Box::new(BufWriter::new(file)))
        }
        None => Ok(Box::new(io::stdout().lock())),
    }
}

async fn extract(
    config: &Path,
    vars: &[String],
    terms: &[String],
    format: OutputFormat,
    output: Option<&Path>,
    tee: Option<&Path>,
) -> Result<()> {
    let settings = ConfigNode::load_from_file(config)?;
    let retriever = Retriever::new(settings)?;
    let vars = parse_vars(vars)?;

    let tee_sink = |path: &Path| -> Result<course_scraper::source::TeeSink> {
        let file = std::fs::File::create(path)
            .with_context(|| format!("failed to create tee file {}", path.display()))?;
        Ok(Box::new(tokio::fs::File::from_std(file)))
    };

    if terms.is_empty() {
        let sink = tee.map(tee_sink).transpose()?;
        let retrieval = retriever.retrieve_with_tee(&vars, sink).await?;
        report(None, &retrieval.report);

        let written = write_dataset(&retrieval.dataset, format, open_output(output)?)?;
        tracing::info!("Wrote {} group(s) as {}", written, format);
        return Ok(());
    }

    if tee.is_some() {
        tracing::warn!("--tee is ignored when retrieving several terms");
    }

    let mut datasets = BTreeMap::new();
    for (term, result) in retriever.retrieve_terms(terms, &vars).await {
        match result {
            Ok(retrieval) => {
                report(Some(&term), &retrieval.report);
                datasets.insert(term, retrieval.dataset);
            }
            Err(e) => eprintln!("  ✗ {}: {}", term, e),
        }
    }
    if datasets.is_empty() {
        bail!("no term could be retrieved");
    }

    let written = write_terms(&datasets, format, open_output(output)?)?;
    tracing::info!("Wrote {} group(s) for {} term(s) as {}", written, datasets.len(), format);
    Ok(())
}

fn report(term: Option<&str>, report: &course_scraper::RetrievalReport) {
    let label = term.map(|t| format!("{}: ", t)).unwrap_or_default();
    eprintln!(
        "  ✓ {}{} group(s), {} batch(es) {:?}",
        label,
        report.groups,
        report.batches.len(),
        report.batch_sizes()
    );
    for skipped in &report.skipped {
        eprintln!("  ⚠ skipped {}: {}", skipped.label, skipped.reason);
    }
    for failed in &report.failed {
        eprintln!("  ✗ failed {}: {}", failed.label, failed.reason);
    }
}

fn validate(config: &Path) -> Result<()> {
    println!("🔍 Validating {}...", config.display());

    let settings = ConfigNode::load_from_file(config)?;
    let retriever = Retriever::new(settings.clone())
        .with_context(|| format!("invalid configuration {}", config.display()))?;
    println!("  ✓ Queries present");

    match retriever.source() {
        Some(source) => println!("  ✓ Data source: {:?}", source.kind()),
        None => println!("  ℹ No data source configured (documents must be supplied)"),
    }
    match retriever.coordinator().batch_size() {
        Some(size) => println!("  ✓ Batch size: {}", size),
        None => println!("  ✓ Batch size: unbounded"),
    }

    let substitutor = Substitutor::for_config(&settings);
    for key in ["query-all", "query-single"] {
        let expr = substitutor.resolve(settings.get(key, ""), &Variables::new())?;
        match course_scraper::query::parse(&expr) {
            Ok(_) => println!("  ✓ {} parses", key),
            Err(_) if expr.contains("${") => {
                println!("  ℹ {} depends on runtime variables, not checked", key)
            }
            Err(e) => bail!("'{}' does not parse: {}", key, e),
        }
    }

    println!("✅ Configuration is valid");
    Ok(())
}

fn query(file: &Path, expr: &str, vars: &[String]) -> Result<()> {
    let vars = parse_vars(vars)?;
    let bytes = std::fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
    let document = Document::parse_bytes(&bytes, Default::default())?;

    let substitutor = Substitutor::for_config(&ConfigNode::new());
    let scripts = course_scraper::ScriptEngine::new(Default::default(), substitutor.clone());
    let tool = QueryTool::new(substitutor, scripts);

    let matches = tool.query(&Target::root(Arc::new(document)), expr, &vars)?;
    if matches.is_empty() {
        bail!("no matches for '{}'", expr);
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for found in matches {
        writeln!(out, "{}", found.text())?;
    }
    Ok(())
}
