//! Web archives and self-executing archives.
//!
//! Both bundle their own classes and libraries below a fixed directory. A
//! [`Container`] owns the extracted copy of such an archive in a scratch
//! directory that belongs to exactly one task.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::error::AnalysisError;
use crate::library::LibraryId;
use crate::resolve::ResolutionContext;
use crate::rewrite::{ArchiveRewriter, EntrySource};
use crate::scan::{find_files, relative_entry_name};

pub const CORE_PROPERTIES: &str = "jarweaver-core.properties";
pub const CFG_PROPERTIES: &str = "jarweaver-cfg.properties";
pub const LOG4J_PROPERTIES: &str = "log4j.properties";
pub const AND_CONFIG_CLASSIFIER: &str = "and-config";

pub const APP_GROUP_KEY: &str = "jarweaver.appContext.group";
pub const APP_ARTIFACT_KEY: &str = "jarweaver.appContext.artifact";
pub const APP_VERSION_KEY: &str = "jarweaver.appContext.version";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContainerKind {
    Plain,
    Web,
    SelfExecuting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerLayout {
    pub classes: &'static str,
    pub lib: &'static str,
}

const WEB_LAYOUT: ContainerLayout = ContainerLayout {
    classes: "WEB-INF/classes/",
    lib: "WEB-INF/lib/",
};

const SELF_EXECUTING_LAYOUT: ContainerLayout = ContainerLayout {
    classes: "BOOT-INF/classes/",
    lib: "BOOT-INF/lib/",
};

const SELF_EXECUTING_MARKER: &str = "BOOT-INF/";

impl ContainerKind {
    pub fn detect(path: &Path, rewriter: &ArchiveRewriter) -> Self {
        let is_war = path
            .extension()
            .is_some_and(|e| e.eq_ignore_ascii_case("war"));
        if is_war {
            ContainerKind::Web
        } else if rewriter.has_entry_with_prefix(SELF_EXECUTING_MARKER) {
            ContainerKind::SelfExecuting
        } else {
            ContainerKind::Plain
        }
    }

    pub fn layout(self) -> Option<ContainerLayout> {
        match self {
            ContainerKind::Plain => None,
            ContainerKind::Web => Some(WEB_LAYOUT),
            ContainerKind::SelfExecuting => Some(SELF_EXECUTING_LAYOUT),
        }
    }

    pub fn is_container(self) -> bool {
        self != ContainerKind::Plain
    }
}

/// Nested archive found in a container's lib directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NestedArchive {
    pub path: PathBuf,
    pub entry_name: String,
}

#[derive(Debug)]
pub struct Container {
    kind: ContainerKind,
    layout: ContainerLayout,
    scratch: PathBuf,
}

impl Container {
    /// Extracts the archive into `scratch`. Plain archives are rejected with
    /// `None` since they have nothing to unpack.
    pub fn unpack(
        kind: ContainerKind,
        rewriter: &ArchiveRewriter,
        scratch: &Path,
    ) -> Result<Option<Self>, AnalysisError> {
        let Some(layout) = kind.layout() else {
            return Ok(None);
        };
        rewriter.extract(scratch)?;
        Ok(Some(Self {
            kind,
            layout,
            scratch: scratch.to_path_buf(),
        }))
    }

    pub fn layout(&self) -> ContainerLayout {
        self.layout
    }

    pub fn classes_dir(&self) -> PathBuf {
        self.scratch.join(self.layout.classes.trim_end_matches('/'))
    }

    pub fn lib_dir(&self) -> PathBuf {
        self.scratch.join(self.layout.lib.trim_end_matches('/'))
    }

    /// Output directory for the rewritten nested archives, e.g. `WEB-INF/lib_mod`.
    pub fn children_out_dir(&self) -> PathBuf {
        let lib = self.layout.lib.trim_end_matches('/');
        self.scratch.join(format!("{lib}_mod"))
    }

    /// Puts the classes directory and, for self-executing archives, every
    /// nested library on the classpath. Failures only limit resolution.
    pub fn register_classpath(&self, ctx: &ResolutionContext) {
        let classes = self.classes_dir();
        if classes.is_dir()
            && let Err(e) = ctx.insert_classpath(&classes)
        {
            error!(dir = %classes.display(), error = %e, "error while updating the classpath");
        }
        if self.kind == ContainerKind::SelfExecuting {
            for lib in self.nested_archives() {
                if let Err(e) = ctx.insert_classpath(&lib.path) {
                    warn!(lib = %lib.path.display(), error = %e, "nested library not added to the classpath");
                }
            }
        }
    }

    /// Class file names relative to the classes directory, e.g. `a/B.class`.
    pub fn class_entries(&self) -> Vec<String> {
        let classes = self.classes_dir();
        match find_files(&classes, "class") {
            Ok(files) => files
                .iter()
                .filter_map(|f| relative_entry_name(&classes, f))
                .collect(),
            Err(e) => {
                error!(dir = %classes.display(), error = %e, "cannot list classes");
                Vec::new()
            }
        }
    }

    pub fn nested_archives(&self) -> Vec<NestedArchive> {
        let lib = self.lib_dir();
        let files = match find_files(&lib, "jar") {
            Ok(files) => files,
            Err(e) => {
                error!(dir = %lib.display(), error = %e, "cannot list nested archives");
                return Vec::new();
            }
        };
        files
            .into_iter()
            .filter_map(|path| {
                let rel = relative_entry_name(&lib, &path)?;
                Some(NestedArchive {
                    entry_name: format!("{}{rel}", self.layout.lib),
                    path,
                })
            })
            .collect()
    }

    /// Registers the substitution rules for instrumented classes and rewritten
    /// nested archives, and adds the include directory's files.
    pub fn prepare_rewrite(
        &self,
        rewriter: &mut ArchiveRewriter,
        classes: HashMap<String, Vec<u8>>,
        children: HashMap<String, PathBuf>,
        include: Option<&IncludeDir>,
    ) -> Result<(), AnalysisError> {
        let classes_pattern = format!("{}.*\\.class", regex::escape(self.layout.classes));
        let lib_pattern = format!("{}.*\\.jar", regex::escape(self.layout.lib));
        let rule_err = |e: regex::Error| AnalysisError::Write {
            target: self.scratch.clone(),
            reason: e.to_string(),
        };

        rewriter
            .register(
                &classes_pattern,
                EntrySource::Classes {
                    strip_prefix: self.layout.classes.to_string(),
                    bytes: classes,
                },
            )
            .map_err(rule_err)?;
        rewriter
            .register(&lib_pattern, EntrySource::NestedArchives { files: children })
            .map_err(rule_err)?;

        if self.kind == ContainerKind::SelfExecuting {
            rewriter.set_compress_new_entries(false);
        }

        if let Some(include) = include {
            include.add_to(rewriter, self.layout);
        }
        Ok(())
    }
}

/// Directory whose archives and configuration files are added to every
/// rewritten container.
#[derive(Debug, Clone)]
pub struct IncludeDir {
    dir: PathBuf,
    ignored: BTreeSet<PathBuf>,
}

impl IncludeDir {
    /// Archives in `dir` that carry [`CORE_PROPERTIES`] and were not rewritten
    /// yet get the application context injected into that file. The
    /// originals are then left out of the containers.
    pub fn prepare(dir: &Path, app_context: Option<&LibraryId>) -> Self {
        let mut ignored = BTreeSet::new();
        let Some(app) = app_context else {
            return Self {
                dir: dir.to_path_buf(),
                ignored,
            };
        };

        let libs = find_files(dir, "jar").unwrap_or_else(|e| {
            error!(dir = %dir.display(), error = %e, "cannot list include directory");
            Vec::new()
        });
        for lib in libs {
            match inject_app_context(&lib, dir, app) {
                Ok(true) => {
                    ignored.insert(lib);
                }
                Ok(false) => {}
                Err(e) => error!(lib = %lib.display(), error = %e, "error when rewriting the archive"),
            }
        }

        Self {
            dir: dir.to_path_buf(),
            ignored,
        }
    }

    pub fn is_ignored(&self, path: &Path) -> bool {
        self.ignored.contains(path)
    }

    fn add_to(&self, rewriter: &mut ArchiveRewriter, layout: ContainerLayout) {
        if !self.dir.is_dir() {
            return;
        }
        let libs = find_files(&self.dir, "jar").unwrap_or_default();
        let mut added = 0;
        for lib in libs.iter().filter(|l| !self.is_ignored(l)) {
            rewriter.add_file(Some(layout.lib), lib, true);
            added += 1;
        }
        info!(dir = %self.dir.display(), count = added, lib = layout.lib, "include directory archives added");

        rewriter.add_file(Some(layout.classes), &self.dir.join(CFG_PROPERTIES), true);
        rewriter.add_file(Some(layout.classes), &self.dir.join(LOG4J_PROPERTIES), false);
    }
}

pub fn app_context_properties(app: &LibraryId) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_GROUP_KEY.to_string(), app.group.clone()),
        (APP_ARTIFACT_KEY.to_string(), app.artifact.clone()),
        (APP_VERSION_KEY.to_string(), app.version.clone()),
    ])
}

/// Returns `true` when `lib` was rewritten with the context injected.
fn inject_app_context(lib: &Path, out_dir: &Path, app: &LibraryId) -> Result<bool, AnalysisError> {
    let mut rewriter = ArchiveRewriter::open(lib)?;
    if !rewriter.has_entry(CORE_PROPERTIES) || rewriter.is_rewritten() {
        debug!(lib = %lib.display(), "no configuration to inject");
        return Ok(false);
    }
    rewriter.set_classifier(AND_CONFIG_CLASSIFIER);
    rewriter
        .register(
            &regex::escape(CORE_PROPERTIES),
            EntrySource::Properties {
                values: app_context_properties(app),
            },
        )
        .map_err(|e| AnalysisError::Write {
            target: lib.to_path_buf(),
            reason: e.to_string(),
        })?;
    rewriter.rewrite(out_dir)?;
    Ok(true)
}
