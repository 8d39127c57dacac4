use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use clinreport::config::{PipelineConfig, APP_NAME, CONFIG_FILE_VAR};
use clinreport::pipeline::rag::{ReportRequest, ReportType};
use clinreport::pipeline::storage::ChunkFilter;
use clinreport::{init_tracing, RawDocument, ReportSession};

#[derive(Parser)]
#[command(name = APP_NAME)]
#[command(about = "De-identify clinical notes and generate reports from them", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON config file (overrides CLINREPORT_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the scrubbed form of a text file
    Scrub {
        file: PathBuf,
    },
    /// Print per-kind identifier counts for a text file, without values
    Entities {
        file: PathBuf,
    },
    /// Ingest text files and generate a report
    Report {
        /// Text files to ingest
        files: Vec<PathBuf>,

        /// full_summary | progress_notes | assessment_summary | medication_review | discharge_summary
        #[arg(long = "type", default_value = "full_summary")]
        report_type: ReportType,

        /// Focus for retrieval and generation
        #[arg(long, default_value = "")]
        query: String,

        #[arg(long, default_value_t = 5)]
        top_k: usize,

        /// Only use chunks of these document ids (repeatable)
        #[arg(long = "document")]
        documents: Vec<Uuid>,

        /// Only use chunks whose source label contains this text
        #[arg(long)]
        label: Option<String>,

        /// Skip the generation backend
        #[arg(long)]
        structured: bool,

        /// Load a saved index before ingesting
        #[arg(long)]
        load_index: Option<PathBuf>,

        /// Save the index after ingesting
        #[arg(long)]
        save_index: Option<PathBuf>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let config = match path {
        Some(path) => {
            let path = path.to_string_lossy().to_string();
            PipelineConfig::from_lookup(|key| {
                if key == CONFIG_FILE_VAR {
                    Some(path.clone())
                } else {
                    std::env::var(key).ok()
                }
            })
        }
        None => PipelineConfig::from_env(),
    };
    config.context("loading configuration")
}

/// `number` is the 1-based input position. Paths may carry identifiers, so
/// errors name the position only.
fn read_document(number: usize, path: &Path) -> Result<RawDocument> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading input document #{number}"))?;
    let label = path
        .file_stem()
        .map(|s| s.to_string_lossy().replace(['_', '-'], " "))
        .unwrap_or_else(|| "document".to_string());
    Ok(RawDocument::new(&label, text))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose.then_some("clinreport=debug"));

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Scrub { file } => {
            let session = ReportSession::new(config)?;
            let doc = read_document(1, &file)?;
            let result = session.scrub(doc.text())?;
            println!("{}", result.scrubbed_text);
        }
        Commands::Entities { file } => {
            let session = ReportSession::new(config)?;
            let doc = read_document(1, &file)?;
            let report = session.entity_report(doc.text())?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Report {
            files,
            report_type,
            query,
            top_k,
            documents,
            label,
            structured,
            load_index,
            save_index,
            json,
        } => {
            let session = ReportSession::from_config(config)?;
            if let Some(path) = load_index {
                session.load_index(&path).context("loading index")?;
            }

            let inputs = files
                .iter()
                .enumerate()
                .map(|(i, f)| read_document(i + 1, f))
                .collect::<Result<Vec<_>>>()?;
            for (i, result) in session.ingest_batch(&inputs).into_iter().enumerate() {
                let summary = result.with_context(|| format!("ingesting input document #{}", i + 1))?;
                eprintln!("document #{}: {} ({} chunks)", i + 1, summary.document_id, summary.chunks);
            }
            if let Some(path) = save_index {
                session.save_index(&path).context("saving index")?;
            }

            let mut request = ReportRequest::new(report_type).with_query(&query).with_top_k(top_k);
            if !documents.is_empty() || label.is_some() {
                request = request.with_filter(ChunkFilter {
                    document_ids: (!documents.is_empty()).then_some(documents),
                    source_label_contains: label,
                });
            }
            if structured {
                request = request.structured_only();
            }
            let report = session.generate_report(&request)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", report.content);
                if let Some(reason) = report.degradation {
                    eprintln!("note: generation backend not used ({reason:?})");
                }
            }
        }
    }
    Ok(())
}
