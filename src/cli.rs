use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::DEFAULT_THREADS;

#[derive(Debug, Clone, Parser)]
#[command(name = "jarweaver")]
#[command(about = "Discover code constructs in Java archives and rewrite them with monitoring probes")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Worker threads for the batch.
    #[arg(long, global = true, value_name = "N", default_value_t = DEFAULT_THREADS)]
    pub threads: usize,

    /// Wall clock budget for the whole batch, in seconds.
    #[arg(long, global = true, value_name = "SECS")]
    pub timeout: Option<u64>,

    #[arg(long, global = true, value_name = "DIR")]
    pub work_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// List constructs and bundled libraries of archives (directories are searched).
    Scan {
        #[arg(required = true, value_name = "PATH")]
        paths: Vec<PathBuf>,

        /// Print the results as a dependency tree.
        #[arg(long)]
        tree: bool,

        /// Omit the construct lists.
        #[arg(long)]
        summary: bool,
    },
    /// Scan and rewrite archives with probes inserted.
    Instrument {
        #[arg(required = true, value_name = "PATH")]
        paths: Vec<PathBuf>,

        #[arg(short = 'o', long, value_name = "DIR")]
        output: Option<PathBuf>,

        #[arg(long, value_name = "NAME")]
        classifier: Option<String>,

        #[arg(long, value_name = "DIR")]
        include_dir: Option<PathBuf>,

        #[arg(long, value_name = "GROUP:ARTIFACT:VERSION")]
        app_context: Option<String>,

        /// Additional class name prefixes that are never instrumented.
        #[arg(long = "blacklist", value_name = "PREFIX")]
        blacklist: Vec<String>,

        /// Store entries added to the archives without compression.
        #[arg(long)]
        no_compress: bool,
    },
    /// Strip `Class-Path` from archives so they can be put on a classpath.
    Preprocess {
        #[arg(required = true, value_name = "PATH")]
        paths: Vec<PathBuf>,

        #[arg(short = 'o', long, value_name = "DIR")]
        output: Option<PathBuf>,
    },
    /// Report whether archives were already rewritten.
    Check {
        #[arg(required = true, value_name = "PATH")]
        paths: Vec<PathBuf>,
    },
}
