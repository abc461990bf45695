use anyhow::{Context, Result};
use serde::Serialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::Cli;
use crate::instrument::default_blacklist;
use crate::library::LibraryId;

pub const WORK_DIR_ENV: &str = "JARWEAVER_WORK_DIR";
pub const DEFAULT_THREADS: usize = 2;

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisConfig {
    pub threads: usize,
    pub timeout: Option<Duration>,
    pub instrument: bool,
    /// Appended to the names of rewritten archives, e.g. `lib-<classifier>.jar`.
    pub classifier: Option<String>,
    pub work_dir: PathBuf,
    /// Where rewritten top-level archives go; `<work_dir>/rewritten` if unset.
    pub output_dir: Option<PathBuf>,
    pub include_dir: Option<PathBuf>,
    pub blacklist: Vec<String>,
    pub app_context: Option<LibraryId>,
    pub compress_new_entries: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            threads: DEFAULT_THREADS,
            timeout: None,
            instrument: false,
            classifier: None,
            work_dir: env::temp_dir().join("jarweaver"),
            output_dir: None,
            include_dir: None,
            blacklist: default_blacklist(),
            app_context: None,
            compress_new_entries: true,
        }
    }
}

impl AnalysisConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        Ok(Self {
            threads: cli.threads.max(1),
            timeout: cli.timeout.map(Duration::from_secs),
            work_dir: resolve_work_dir(cli)?,
            ..Self::default()
        })
    }

    pub fn output_dir(&self) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| self.work_dir.join("rewritten"))
    }

    pub fn extract_dir(&self) -> PathBuf {
        self.work_dir.join("extract")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.work_dir.join("tmp")
    }
}

pub fn resolve_work_dir(cli: &Cli) -> Result<PathBuf> {
    if let Some(p) = cli.work_dir.clone() {
        return Ok(p);
    }

    if let Ok(p) = env::var(WORK_DIR_ENV)
        && !p.is_empty()
    {
        return Ok(PathBuf::from(p));
    }

    Ok(jarweaver_home()?.join("work"))
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))
}

fn jarweaver_home() -> Result<PathBuf> {
    let base = dirs::data_local_dir()
        .or_else(dirs::cache_dir)
        .or_else(dirs::home_dir)
        .ok_or_else(|| anyhow::anyhow!("Failed to resolve data directory"))?;
    Ok(base.join("jarweaver"))
}
