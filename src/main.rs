use anyhow::{Context, Result};
use clap::Parser;
use jarweaver::cli::{Cli, Commands};
use jarweaver::config::{AnalysisConfig, ensure_dir};
use jarweaver::library::LibraryId;
use jarweaver::manifest::Provenance;
use jarweaver::orchestrator::{BatchReport, Orchestrator};
use jarweaver::rewrite::{ArchiveRewriter, append_to_classpath};
use jarweaver::scan::find_archives;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = AnalysisConfig::from_cli(&cli)?;

    match cli.command.clone() {
        Commands::Scan { paths, tree, summary } => {
            let archives = expand_paths(&paths)?;
            let report = Orchestrator::new(config).analyze(&archives, &HashMap::new())?;
            print_batch(&report, tree, !summary)?;
            exit_on_failure(&report);
        }
        Commands::Instrument {
            paths,
            output,
            classifier,
            include_dir,
            app_context,
            blacklist,
            no_compress,
        } => {
            config.instrument = true;
            config.output_dir = output;
            config.classifier = classifier;
            config.include_dir = include_dir;
            config.compress_new_entries = !no_compress;
            config.blacklist.extend(blacklist);
            config.app_context = app_context
                .map(|s| {
                    LibraryId::parse(&s)
                        .with_context(|| format!("Invalid application context (expected group:artifact:version): {s}"))
                })
                .transpose()?;
            ensure_dir(&config.output_dir())?;

            let archives = expand_paths(&paths)?;
            let report = Orchestrator::new(config).analyze(&archives, &HashMap::new())?;
            print_batch(&report, false, false)?;
            exit_on_failure(&report);
        }
        Commands::Preprocess { paths, output } => {
            let tmp_dir = output.unwrap_or_else(|| config.tmp_dir());
            ensure_dir(&tmp_dir)?;
            let output = preprocess(&expand_paths(&paths)?, &tmp_dir);
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Check { paths } => {
            let output = check(&expand_paths(&paths)?);
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Files are taken as given; directories are searched for archives.
fn expand_paths(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for path in paths {
        if path.is_dir() {
            out.extend(find_archives(path)?);
        } else if path.exists() {
            out.push(path.clone());
        } else {
            anyhow::bail!("No such file or directory: {}", path.display());
        }
    }
    Ok(out)
}

fn print_batch(report: &BatchReport, tree: bool, with_constructs: bool) -> Result<()> {
    let json = if tree {
        serde_json::to_string_pretty(&report.dependency_tree())?
    } else {
        #[derive(Serialize)]
        struct BatchOutput<T: Serialize> {
            submitted: usize,
            completed: usize,
            timed_out: bool,
            results: T,
        }
        serde_json::to_string_pretty(&BatchOutput {
            submitted: report.submitted,
            completed: report.results.len(),
            timed_out: report.timed_out,
            results: report.summaries(with_constructs),
        })?
    };
    println!("{json}");
    Ok(())
}

fn exit_on_failure(report: &BatchReport) {
    if report.timed_out || report.failures().next().is_some() {
        std::process::exit(2);
    }
}

#[derive(Debug, Serialize)]
struct PreprocessOutput {
    duration_ms: u64,
    classpath: BTreeSet<PathBuf>,
    archives: Vec<PreprocessEntry>,
}

#[derive(Debug, Serialize)]
struct PreprocessEntry {
    source: PathBuf,
    appended: PathBuf,
    rewritten: bool,
}

fn preprocess(paths: &[PathBuf], tmp_dir: &Path) -> PreprocessOutput {
    let start = Instant::now();
    let mut classpath = BTreeSet::new();
    let archives = paths
        .iter()
        .map(|source| {
            let appended = append_to_classpath(&mut classpath, source, true, tmp_dir);
            PreprocessEntry {
                rewritten: appended != *source,
                source: source.clone(),
                appended,
            }
        })
        .collect();
    PreprocessOutput {
        duration_ms: start.elapsed().as_millis() as u64,
        classpath,
        archives,
    }
}

#[derive(Debug, Serialize)]
struct CheckEntry {
    path: PathBuf,
    rewritten: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    provenance: Option<Provenance>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn check(paths: &[PathBuf]) -> Vec<CheckEntry> {
    paths
        .iter()
        .map(|path| match ArchiveRewriter::open(path) {
            Ok(rewriter) => CheckEntry {
                path: path.clone(),
                rewritten: rewriter.is_rewritten(),
                provenance: rewriter.original_manifest().provenance(),
                error: None,
            },
            Err(e) => CheckEntry {
                path: path.clone(),
                rewritten: false,
                provenance: None,
                error: Some(e.to_string()),
            },
        })
        .collect()
}
