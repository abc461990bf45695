//! Per-archive analysis.
//!
//! An [`ArchiveAnalyzer`] is owned by exactly one worker at a time; it is
//! `Send` but deliberately not `Clone`, and every stateful operation takes
//! `&mut self`. It walks `Unstarted -> Scanned -> Instrumented -> Rewritten`,
//! or ends in `Failed`.

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, warn};

use crate::classfile::ClassFile;
use crate::config::AnalysisConfig;
use crate::construct::{ConstructId, is_class_entry, qualified_name_of};
use crate::container::{Container, ContainerKind, IncludeDir, NestedArchive};
use crate::error::{AnalysisError, EntryNameError};
use crate::instrument::{InstrumentationControl, InstrumentationStats, Instrumentor, ProbeContext};
use crate::library::{Library, LibraryId};
use crate::manifest::{APP_CONTEXT, CLASS_INSTR_STATS, CONSTRUCT_STATS};
use crate::pom::{is_pom_entry, library_id_of};
use crate::probe::read_entry;
use crate::resolve::ResolutionContext;
use crate::rewrite::{ArchiveRewriter, EntrySource, RewriteOutcome};

static SCRATCH_SEQ: AtomicU64 = AtomicU64::new(0);

/// Everything the analyzers of one orchestrator run share.
pub struct AnalysisSession {
    pub config: AnalysisConfig,
    pub resolution: Arc<ResolutionContext>,
    pub instrumentor: Arc<dyn Instrumentor>,
    pub include: Option<IncludeDir>,
}

impl AnalysisSession {
    pub fn new(config: AnalysisConfig, instrumentor: Arc<dyn Instrumentor>) -> Self {
        let include = match (&config.include_dir, config.instrument) {
            (Some(dir), true) => Some(IncludeDir::prepare(dir, config.app_context.as_ref())),
            _ => None,
        };
        Self {
            config,
            resolution: ResolutionContext::shared(),
            instrumentor,
            include,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnalysisState {
    Unstarted,
    Scanned,
    Instrumented,
    Rewritten,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanCounters {
    pub classes: usize,
    pub enums: usize,
    pub interfaces: usize,
    pub skipped_entries: usize,
    pub unresolved: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveReport {
    pub kind: ContainerKind,
    pub state: AnalysisState,
    pub file_size: u64,
    pub library: Library,
    pub counters: ScanCounters,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instrumentation: Option<InstrumentationStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rewritten: Option<RewriteOutcome>,
}

pub struct ArchiveAnalyzer {
    session: Arc<AnalysisSession>,
    path: PathBuf,
    state: AnalysisState,
    kind: ContainerKind,
    rewriter: ArchiveRewriter,
    container: Option<Container>,
    library_id: Option<LibraryId>,
    out_dir: PathBuf,
    library: Option<Library>,
    counters: ScanCounters,
    control: Option<InstrumentationControl>,
    rewritten: Option<RewriteOutcome>,
}

impl ArchiveAnalyzer {
    pub fn open(path: &Path, session: Arc<AnalysisSession>) -> Result<Self, AnalysisError> {
        let rewriter = ArchiveRewriter::open(path)?;
        let kind = ContainerKind::detect(path, &rewriter);
        let out_dir = session.config.output_dir();
        Ok(Self {
            session,
            path: path.to_path_buf(),
            state: AnalysisState::Unstarted,
            kind,
            rewriter,
            container: None,
            library_id: None,
            out_dir,
            library: None,
            counters: ScanCounters::default(),
            control: None,
            rewritten: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> ContainerKind {
        self.kind
    }

    pub fn state(&self) -> AnalysisState {
        self.state
    }

    pub fn counters(&self) -> ScanCounters {
        self.counters
    }

    pub fn set_library_id(&mut self, id: LibraryId) {
        if let Some(lib) = self.library.as_mut() {
            lib.library_id = Some(id.clone());
        }
        self.library_id = Some(id);
    }

    /// Directory the rewritten archive is written to.
    pub fn set_output_dir(&mut self, dir: &Path) {
        self.out_dir = dir.to_path_buf();
    }

    /// Builds the library summary. Repeated calls return the first result.
    pub fn scan(&mut self) -> Result<&Library, AnalysisError> {
        if self.library.is_none() {
            match self.scan_archive() {
                Ok(library) => self.library = Some(library),
                Err(e) => {
                    self.state = AnalysisState::Failed;
                    return Err(e);
                }
            }
        }
        self.library.as_ref().ok_or_else(|| AnalysisError::open(&self.path, "scan produced no library"))
    }

    fn scan_archive(&mut self) -> Result<Library, AnalysisError> {
        let digest = self.rewriter.digest()?;
        let config = &self.session.config;

        if config.instrument {
            let ctx = ProbeContext {
                original_digest: (!self.kind.is_container()).then(|| digest.clone()),
                app_context: config.app_context.clone(),
            };
            self.control = Some(InstrumentationControl::new(
                self.session.instrumentor.clone(),
                config.blacklist.clone(),
                ctx,
            ));
        }

        let resolution = self.session.resolution.clone();
        let (location, class_entries) = if self.kind.is_container() {
            let scratch = self.scratch_dir(&digest);
            let container = Container::unpack(self.kind, &self.rewriter, &scratch)?
                .ok_or_else(|| AnalysisError::Extract {
                    path: self.path.clone(),
                    reason: "archive has no container layout".into(),
                })?;
            container.register_classpath(&resolution);
            let entries = container.class_entries();
            let location = container.classes_dir();
            self.container = Some(container);
            (location, entries)
        } else {
            if let Err(e) = resolution.insert_classpath(&self.path) {
                error!(archive = %self.path.display(), error = %e, "error while adding archive to the classpath");
            }
            let entries = self
                .rewriter
                .entry_names()
                .iter()
                .filter(|n| is_class_entry(n))
                .cloned()
                .collect();
            (self.path.clone(), entries)
        };

        let mut constructs = BTreeSet::new();
        for entry in &class_entries {
            let qname = match qualified_name_of(entry) {
                Ok(qname) => qname,
                Err(e) => {
                    self.counters.skipped_entries += 1;
                    match e {
                        EntryNameError::SyntheticDescriptor(_) | EntryNameError::NotAClass(_) => {
                            debug!(entry = %entry, "entry skipped")
                        }
                        EntryNameError::MultiRelease(_) | EntryNameError::InvalidSegment { .. } => {
                            warn!(archive = %self.path.display(), reason = %e, "entry skipped")
                        }
                    }
                    continue;
                }
            };

            let class = match resolution.resolve_from(&location, &qname) {
                Ok(class) => class,
                Err(e) => {
                    self.counters.unresolved += 1;
                    error!(archive = %self.path.display(), class = %qname, error = %e, "error while analyzing class");
                    continue;
                }
            };
            self.visit_class(&qname, &class, &mut constructs);
        }

        let mut bundled = BTreeSet::new();
        for entry in self.rewriter.entry_names().iter().filter(|n| is_pom_entry(n)) {
            match read_entry(&self.path, entry) {
                Ok(Some(content)) => {
                    if let Some(id) = library_id_of(entry, &content) {
                        bundled.insert(id);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(entry = %entry, error = %e, "i/o error for bundled package descriptor"),
            }
        }

        let mut library = Library::new(digest).with_manifest(self.rewriter.original_manifest());
        library.library_id = self.library_id.clone();
        library.constructs = constructs;
        library.bundled_library_ids = bundled;

        self.state = AnalysisState::Scanned;
        match &self.control {
            Some(control) => {
                self.state = AnalysisState::Instrumented;
                let stats = control.stats();
                info!(
                    archive = %self.path.display(),
                    total = stats.total,
                    already = stats.already_done,
                    ok = stats.success,
                    err = stats.failure,
                    constructs = library.constructs.len(),
                    "classes and enums comprised/already-instr/instr/not-instr"
                );
            }
            None => info!(
                archive = %self.path.display(),
                constructs = library.constructs.len(),
                classes = self.counters.classes,
                enums = self.counters.enums,
                interfaces = self.counters.interfaces,
                "archive scanned"
            ),
        }
        Ok(library)
    }

    fn visit_class(&mut self, qname: &str, class: &ClassFile, constructs: &mut BTreeSet<ConstructId>) {
        if class.is_interface() {
            self.counters.interfaces += 1;
            return;
        }
        if class.is_enum() {
            self.counters.enums += 1;
        } else {
            self.counters.classes += 1;
        }
        constructs.extend(class.constructs());

        if let Some(control) = self.control.as_mut()
            && control.accepts(qname)
        {
            control.apply(class);
        }
    }

    fn scratch_dir(&self, digest: &str) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "archive".into());
        // the digest may come from the archive's own manifest
        let short: String = digest.chars().filter(char::is_ascii_hexdigit).take(12).collect();
        self.session.config.extract_dir().join(format!(
            "{name}-{short}-{}-{}",
            std::process::id(),
            SCRATCH_SEQ.fetch_add(1, Ordering::Relaxed)
        ))
    }

    /// Nested archives of a container; empty for plain archives or before `scan`.
    pub fn children(&self) -> Vec<NestedArchive> {
        self.container
            .as_ref()
            .map(Container::nested_archives)
            .unwrap_or_default()
    }

    /// Where rewritten children of this container should be written.
    pub fn children_out_dir(&self) -> Option<PathBuf> {
        self.container.as_ref().map(Container::children_out_dir)
    }

    pub fn is_instrumenting(&self) -> bool {
        self.control.is_some()
    }

    /// Writes the instrumented archive. `children` maps nested entry names to
    /// the rewritten child files. Does nothing unless instrumentation is on.
    pub fn rewrite(&mut self, children: HashMap<String, PathBuf>) -> Result<Option<&RewriteOutcome>, AnalysisError> {
        if self.library.is_none() {
            self.scan()?;
        }
        if self.rewritten.is_some() {
            return Ok(self.rewritten.as_ref());
        }
        let Some(control) = self.control.take() else {
            return Ok(None);
        };

        let stats = control.stats();
        let constructs = self.library.as_ref().map(|l| l.constructs.len()).unwrap_or(0);
        self.rewriter.add_manifest_attribute(CLASS_INSTR_STATS, stats.to_string());
        self.rewriter.add_manifest_attribute(CONSTRUCT_STATS, format!("[{constructs} constructs]"));
        if let Some(app) = &self.session.config.app_context {
            self.rewriter.add_manifest_attribute(APP_CONTEXT, app.to_string());
        }
        if let Some(classifier) = &self.session.config.classifier {
            self.rewriter.set_classifier(classifier.clone());
        }
        self.rewriter.set_compress_new_entries(self.session.config.compress_new_entries);

        let classes = control.into_instrumented();
        let registered = match &self.container {
            Some(container) => container.prepare_rewrite(
                &mut self.rewriter,
                classes,
                children,
                self.session.include.as_ref(),
            ),
            None => self
                .rewriter
                .register(
                    r".*\.class",
                    EntrySource::Classes {
                        strip_prefix: String::new(),
                        bytes: classes,
                    },
                )
                .map_err(|e| AnalysisError::Write {
                    target: self.out_dir.clone(),
                    reason: e.to_string(),
                }),
        };

        let result = registered.and_then(|_| self.rewriter.rewrite(&self.out_dir));
        match result {
            Ok(outcome) => {
                self.state = AnalysisState::Rewritten;
                self.rewritten = Some(outcome);
                Ok(self.rewritten.as_ref())
            }
            Err(e) => {
                self.state = AnalysisState::Failed;
                Err(e)
            }
        }
    }

    pub fn instrumentation_stats(&self) -> Option<InstrumentationStats> {
        self.control.as_ref().map(InstrumentationControl::stats)
    }

    pub fn into_report(self, stats: Option<InstrumentationStats>) -> Result<ArchiveReport, AnalysisError> {
        let library = self
            .library
            .ok_or_else(|| AnalysisError::open(&self.path, "archive was never scanned"))?;
        Ok(ArchiveReport {
            kind: self.kind,
            state: self.state,
            file_size: self.rewriter.file_size(),
            library,
            counters: self.counters,
            instrumentation: stats,
            rewritten: self.rewritten,
        })
    }
}

/// Scans and, when instrumenting, rewrites one archive in a single call.
pub fn analyze_archive(
    path: &Path,
    session: Arc<AnalysisSession>,
    children: HashMap<String, PathBuf>,
) -> Result<ArchiveReport, AnalysisError> {
    let mut analyzer = ArchiveAnalyzer::open(path, session)?;
    analyzer.scan()?;
    finish(analyzer, children)
}

/// Rewrites (if instrumenting) and turns the analyzer into its report.
pub fn finish(
    mut analyzer: ArchiveAnalyzer,
    children: HashMap<String, PathBuf>,
) -> Result<ArchiveReport, AnalysisError> {
    let stats = analyzer.instrumentation_stats();
    analyzer.rewrite(children)?;
    analyzer.into_report(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::{ACC_ABSTRACT, ACC_ENUM, ACC_INTERFACE};
    use crate::instrument::{MarkerInstrumentor, PROBE_ATTRIBUTE};
    use crate::manifest::{MANIFEST_PATH, MODIFIED_AT, ORIGINAL_DIGEST};
    use crate::probe::read_manifest;
    use crate::testutil::{class_bytes, manifest, plain_class, temp_dir, temp_path, write_jar};
    use std::fs;

    fn session(work: &Path, instrument: bool) -> Arc<AnalysisSession> {
        let config = AnalysisConfig {
            instrument,
            work_dir: work.to_path_buf(),
            ..AnalysisConfig::default()
        };
        Arc::new(AnalysisSession::new(config, Arc::new(MarkerInstrumentor)))
    }

    #[test]
    fn scan_counts_kinds_and_skips_bad_entries() {
        let jar = temp_path("kinds.jar");
        write_jar(
            &jar,
            &[
                ("a/Widget.class", &plain_class("a/Widget")),
                ("a/Api.class", &class_bytes("a/Api", ACC_INTERFACE | ACC_ABSTRACT, &[])),
                ("a/Color.class", &class_bytes("a/Color", 0x0011 | ACC_ENUM, &[])),
                ("a/module-info.class", b"ignored"),
                ("META-INF/versions/9/a/Widget.class", b"ignored"),
                ("1.0/a/Bad.class", b"ignored"),
            ],
        );
        let work = temp_dir("kinds-work");
        let mut analyzer = ArchiveAnalyzer::open(&jar, session(&work, false)).unwrap();
        assert_eq!(analyzer.state(), AnalysisState::Unstarted);

        let library = analyzer.scan().unwrap().clone();
        assert_eq!(analyzer.state(), AnalysisState::Scanned);
        let counters = analyzer.counters();
        assert_eq!((counters.classes, counters.enums, counters.interfaces), (1, 1, 1));
        assert_eq!(counters.skipped_entries, 3);

        let names: Vec<&str> = library.constructs.iter().map(|c| c.qualified_name.as_str()).collect();
        assert!(names.contains(&"a.Widget"));
        assert!(names.contains(&"a.Color"));
        assert!(names.contains(&"a.Widget.run()"));
        assert!(!names.iter().any(|n| n.starts_with("a.Api")));

        assert_eq!(analyzer.scan().unwrap().constructs, library.constructs);

        let _ = fs::remove_file(&jar);
        let _ = fs::remove_dir_all(&work);
    }

    #[test]
    fn descriptor_only_archive_yields_one_bundled_id() {
        let jar = temp_path("pom-only.jar");
        let pom = b"<project><groupId>g</groupId><artifactId>a</artifactId><version>1</version></project>";
        write_jar(&jar, &[("META-INF/maven/g/a/pom.xml", pom)]);
        let work = temp_dir("pom-only-work");

        let report = analyze_archive(&jar, session(&work, false), HashMap::new()).unwrap();
        assert!(report.library.constructs.is_empty());
        assert_eq!(report.library.bundled_library_ids.len(), 1);
        assert!(report.rewritten.is_none());

        let _ = fs::remove_file(&jar);
        let _ = fs::remove_dir_all(&work);
    }

    #[test]
    fn instrumented_rewrite_marks_classes_and_manifest() {
        let jar = temp_path("instr.jar");
        let mf = manifest(&[("Created-By", "tests")]);
        write_jar(
            &jar,
            &[
                (MANIFEST_PATH, &mf),
                ("a/B.class", &plain_class("a/B")),
                ("java/lang/Fake.class", &plain_class("java/lang/Fake")),
            ],
        );
        let work = temp_dir("instr-work");
        let report = analyze_archive(&jar, session(&work, true), HashMap::new()).unwrap();

        assert_eq!(report.state, AnalysisState::Rewritten);
        let stats = report.instrumentation.unwrap();
        assert_eq!((stats.total, stats.success), (1, 1));
        let outcome = report.rewritten.unwrap();
        assert_eq!(outcome.replaced, 1);

        let mf = read_manifest(&outcome.path).unwrap();
        assert_eq!(mf.get(ORIGINAL_DIGEST), Some(report.library.digest.as_str()));
        assert_eq!(mf.get(CLASS_INSTR_STATS), Some("[1 total, 0 existed, 1 ok, 0 err]"));
        assert!(mf.get(CONSTRUCT_STATS).is_some());

        let patched = read_entry(&outcome.path, "a/B.class").unwrap().unwrap();
        assert!(ClassFile::parse(patched).unwrap().has_attribute(PROBE_ATTRIBUTE));

        // scanning the rewritten archive keeps the original digest and finds
        // the probe already in place
        let again = analyze_archive(&outcome.path, session(&work, true), HashMap::new()).unwrap();
        assert_eq!(again.library.digest, report.library.digest);
        assert_eq!(again.instrumentation.unwrap().already_done, 1);

        let _ = fs::remove_file(&jar);
        let _ = fs::remove_dir_all(&work);
    }

    #[test]
    fn container_with_non_hex_recorded_digest_is_scanned() {
        let war = temp_path("recorded.war");
        let mf = manifest(&[(ORIGINAL_DIGEST, "aéééééé"), (MODIFIED_AT, "1 Jan 2024 10:00:00")]);
        write_jar(
            &war,
            &[
                (MANIFEST_PATH, &mf),
                ("WEB-INF/classes/app/Main.class", &plain_class("app/Main")),
            ],
        );
        let work = temp_dir("recorded-work");

        let mut analyzer = ArchiveAnalyzer::open(&war, session(&work, false)).unwrap();
        assert_eq!(analyzer.kind(), ContainerKind::Web);
        let library = analyzer.scan().unwrap();
        assert_eq!(library.digest, "aéééééé");
        assert!(library.constructs.iter().any(|c| c.qualified_name == "app.Main"));

        let _ = fs::remove_file(&war);
        let _ = fs::remove_dir_all(&work);
    }

    #[test]
    fn broken_archive_fails_to_open() {
        let bad = temp_path("broken.jar");
        fs::write(&bad, b"nope").unwrap();
        let work = temp_dir("broken-work");
        assert!(matches!(
            ArchiveAnalyzer::open(&bad, session(&work, false)),
            Err(AnalysisError::Open { .. })
        ));
        let _ = fs::remove_file(&bad);
        let _ = fs::remove_dir_all(&work);
    }
}
