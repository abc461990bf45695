//! Batch analysis of archives and the archives nested inside them.
//!
//! Tasks live in an arena indexed by [`TaskId`]; a nested archive records
//! the id of the container it was found in. Work runs on a bounded rayon
//! pool and reports back over a channel, so the calling thread is the only
//! one that touches the arena. When the optional batch timeout expires,
//! jobs that have not started are never run; jobs already running are
//! waited for and their results kept, so no work outlives `analyze`.

use anyhow::{Context, Result};
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::analyzer::{AnalysisSession, ArchiveAnalyzer, ArchiveReport, finish};
use crate::config::AnalysisConfig;
use crate::container::{ContainerKind, NestedArchive};
use crate::error::AnalysisError;
use crate::instrument::{Instrumentor, MarkerInstrumentor};
use crate::library::LibraryId;
use crate::resolve::ResolutionContext;

pub type TaskId = usize;

/// What the surrounding build knows about an archive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyMeta {
    pub library_id: Option<LibraryId>,
    pub scope: Option<String>,
    pub transitive: bool,
}

#[derive(Debug)]
pub struct AnalysisResult {
    pub id: TaskId,
    pub path: PathBuf,
    pub parent: Option<TaskId>,
    pub entry_in_parent: Option<String>,
    pub dependency: Option<DependencyMeta>,
    pub outcome: Result<ArchiveReport, AnalysisError>,
}

impl AnalysisResult {
    pub fn kind(&self) -> Option<ContainerKind> {
        self.outcome.as_ref().ok().map(|r| r.kind)
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn summary(&self, parent_path: Option<&Path>, with_constructs: bool) -> ResultSummary {
        let (report, error) = match &self.outcome {
            Ok(report) => {
                let mut report = report.clone();
                if !with_constructs {
                    report.library.constructs.clear();
                }
                (Some(report), None)
            }
            Err(e) => (None, Some(e.to_string())),
        };
        ResultSummary {
            path: self.path.clone(),
            parent: parent_path.map(Path::to_path_buf),
            entry_in_parent: self.entry_in_parent.clone(),
            dependency: self.dependency.clone(),
            report,
            error,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResultSummary {
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_in_parent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependency: Option<DependencyMeta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<ArchiveReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DependencyNode {
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_in_parent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub library_id: Option<LibraryId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    pub constructs: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub children: Vec<DependencyNode>,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub results: Vec<AnalysisResult>,
    pub submitted: usize,
    pub timed_out: bool,
}

impl BatchReport {
    pub fn get(&self, path: &Path) -> Option<&AnalysisResult> {
        self.results.iter().find(|r| r.path == path)
    }

    pub fn by_id(&self, id: TaskId) -> Option<&AnalysisResult> {
        self.results.iter().find(|r| r.id == id)
    }

    pub fn failures(&self) -> impl Iterator<Item = &AnalysisResult> {
        self.results.iter().filter(|r| !r.is_ok())
    }

    pub fn summaries(&self, with_constructs: bool) -> Vec<ResultSummary> {
        self.results
            .iter()
            .map(|r| {
                let parent = r.parent.and_then(|p| self.by_id(p)).map(|p| p.path.as_path());
                r.summary(parent, with_constructs)
            })
            .collect()
    }

    /// Results arranged by container. Archives whose container did not
    /// finish show up as roots.
    pub fn dependency_tree(&self) -> Vec<DependencyNode> {
        let mut children: HashMap<TaskId, Vec<&AnalysisResult>> = HashMap::new();
        let mut roots = Vec::new();
        for result in &self.results {
            match result.parent.filter(|p| self.by_id(*p).is_some()) {
                Some(parent) => children.entry(parent).or_default().push(result),
                None => roots.push(result),
            }
        }
        roots.into_iter().map(|r| build_node(r, &children)).collect()
    }
}

fn build_node(result: &AnalysisResult, children: &HashMap<TaskId, Vec<&AnalysisResult>>) -> DependencyNode {
    let (library_id, digest, constructs, error) = match &result.outcome {
        Ok(report) => (
            report.library.library_id.clone(),
            Some(report.library.digest.clone()),
            report.library.constructs.len(),
            None,
        ),
        Err(e) => (None, None, 0, Some(e.to_string())),
    };
    DependencyNode {
        path: result.path.clone(),
        entry_in_parent: result.entry_in_parent.clone(),
        library_id,
        digest,
        constructs,
        error,
        children: children
            .get(&result.id)
            .map(|c| c.iter().map(|r| build_node(r, children)).collect())
            .unwrap_or_default(),
    }
}

pub struct Orchestrator {
    session: Arc<AnalysisSession>,
}

impl Orchestrator {
    pub fn new(config: AnalysisConfig) -> Self {
        Self::with_instrumentor(config, Arc::new(MarkerInstrumentor))
    }

    pub fn with_instrumentor(config: AnalysisConfig, instrumentor: Arc<dyn Instrumentor>) -> Self {
        Self {
            session: Arc::new(AnalysisSession::new(config, instrumentor)),
        }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.session.config
    }

    pub fn resolution_context(&self) -> Arc<ResolutionContext> {
        self.session.resolution.clone()
    }

    /// Clears the classpath collected by earlier runs.
    pub fn reset(&self) {
        self.session.resolution.reset();
    }

    pub fn analyze(&self, paths: &[PathBuf], known: &HashMap<PathBuf, DependencyMeta>) -> Result<BatchReport> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.session.config.threads.max(1))
            .build()
            .context("Failed to build worker pool")?;
        let (tx, rx) = mpsc::channel();
        let mut batch = Batch {
            session: self.session.clone(),
            pool,
            tx,
            gate: Arc::new(Mutex::new(Gate::default())),
            slots: Vec::new(),
            outstanding: 0,
            received: 0,
            known,
        };

        let mut seen = std::collections::HashSet::new();
        for path in paths {
            if !seen.insert(path.clone()) {
                continue;
            }
            let id = batch.add_task(path.clone(), None, None, None);
            batch.submit_scan(id);
        }

        let started = Instant::now();
        let timed_out = batch.run(&rx);
        if timed_out {
            batch.close(&rx);
        }

        let report = batch.into_report(timed_out);
        info!(
            submitted = report.submitted,
            completed = report.results.len(),
            failed = report.failures().count(),
            timed_out,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "batch finished"
        );
        Ok(report)
    }
}

enum Message {
    Scanned {
        id: TaskId,
        analyzer: ArchiveAnalyzer,
        children: Vec<NestedArchive>,
    },
    Finished {
        id: TaskId,
        outcome: Result<ArchiveReport, AnalysisError>,
    },
}

struct TaskSlot {
    path: PathBuf,
    parent: Option<TaskId>,
    entry_in_parent: Option<String>,
    out_dir: Option<PathBuf>,
    dependency: Option<DependencyMeta>,
    parked: Option<ArchiveAnalyzer>,
    pending_children: usize,
    child_files: HashMap<String, PathBuf>,
    result: Option<Result<ArchiveReport, AnalysisError>>,
}

/// Admission of pool jobs. Once closed, jobs that have not begun are
/// dropped; `started` counts the ones let through, each of which sends
/// exactly one message.
#[derive(Default)]
struct Gate {
    closed: bool,
    started: usize,
}

fn admit(gate: &Mutex<Gate>) -> bool {
    match gate.lock() {
        Ok(mut gate) if !gate.closed => {
            gate.started += 1;
            true
        }
        _ => false,
    }
}

struct Batch<'a> {
    session: Arc<AnalysisSession>,
    pool: ThreadPool,
    tx: Sender<Message>,
    gate: Arc<Mutex<Gate>>,
    slots: Vec<TaskSlot>,
    outstanding: usize,
    received: usize,
    known: &'a HashMap<PathBuf, DependencyMeta>,
}

impl Batch<'_> {
    fn add_task(
        &mut self,
        path: PathBuf,
        parent: Option<TaskId>,
        entry_in_parent: Option<String>,
        out_dir: Option<PathBuf>,
    ) -> TaskId {
        let dependency = self.known.get(&path).cloned();
        self.slots.push(TaskSlot {
            path,
            parent,
            entry_in_parent,
            out_dir,
            dependency,
            parked: None,
            pending_children: 0,
            child_files: HashMap::new(),
            result: None,
        });
        self.slots.len() - 1
    }

    fn submit_scan(&mut self, id: TaskId) {
        let slot = &self.slots[id];
        let path = slot.path.clone();
        let out_dir = slot.out_dir.clone();
        let library_id = slot.dependency.as_ref().and_then(|d| d.library_id.clone());
        let session = self.session.clone();
        let gate = self.gate.clone();
        let tx = self.tx.clone();

        self.outstanding += 1;
        self.pool.spawn(move || {
            if !admit(&gate) {
                debug!(archive = %path.display(), "cancelled before start");
                return;
            }
            let message = catch_unwind(AssertUnwindSafe(|| {
                scan_task(id, &path, session, out_dir.as_deref(), library_id)
            }))
            .unwrap_or_else(|_| Message::Finished {
                id,
                outcome: Err(AnalysisError::Panicked(path.clone())),
            });
            let _ = tx.send(message);
        });
    }

    fn submit_finish(&mut self, id: TaskId, analyzer: ArchiveAnalyzer, child_files: HashMap<String, PathBuf>) {
        let path = self.slots[id].path.clone();
        let gate = self.gate.clone();
        let tx = self.tx.clone();

        self.outstanding += 1;
        self.pool.spawn(move || {
            if !admit(&gate) {
                debug!(archive = %path.display(), "cancelled before rewrite");
                return;
            }
            let outcome = catch_unwind(AssertUnwindSafe(|| finish(analyzer, child_files)))
                .unwrap_or_else(|_| Err(AnalysisError::Panicked(path.clone())));
            let _ = tx.send(Message::Finished { id, outcome });
        });
    }

    /// Drains messages until every task is done or the deadline passes.
    /// Returns whether the deadline passed.
    fn run(&mut self, rx: &Receiver<Message>) -> bool {
        let deadline = self.session.config.timeout.map(|t| Instant::now() + t);
        while self.outstanding > 0 {
            let message = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match rx.recv_timeout(remaining) {
                        Ok(m) => m,
                        Err(RecvTimeoutError::Timeout) => {
                            warn!(
                                outstanding = self.outstanding,
                                "batch timeout reached, collecting tasks already running"
                            );
                            return true;
                        }
                        Err(RecvTimeoutError::Disconnected) => return false,
                    }
                }
                None => match rx.recv() {
                    Ok(m) => m,
                    Err(_) => return false,
                },
            };
            self.outstanding -= 1;
            self.received += 1;
            self.handle(message);
        }
        false
    }

    /// Stops admitting jobs and waits for the ones already running. Their
    /// results are kept; a container scanned this late is dropped with its
    /// nested archives.
    fn close(&mut self, rx: &Receiver<Message>) {
        let started = match self.gate.lock() {
            Ok(mut gate) => {
                gate.closed = true;
                gate.started
            }
            Err(_) => return,
        };
        debug!(running = started.saturating_sub(self.received), "waiting for running tasks");
        while self.received < started {
            let Ok(message) = rx.recv() else {
                break;
            };
            self.received += 1;
            match message {
                Message::Finished { .. } => self.handle(message),
                Message::Scanned { analyzer, .. } => {
                    debug!(archive = %analyzer.path().display(), "container scanned after timeout, dropped")
                }
            }
        }
    }

    fn handle(&mut self, message: Message) {
        match message {
            Message::Scanned { id, analyzer, children } => {
                let child_out = analyzer.children_out_dir();
                info!(
                    archive = %analyzer.path().display(),
                    nested = children.len(),
                    "container scanned, submitting nested archives"
                );
                for child in children {
                    let cid = self.add_task(child.path, Some(id), Some(child.entry_name), child_out.clone());
                    self.submit_scan(cid);
                }
                let pending = self.slots.iter().filter(|s| s.parent == Some(id)).count();
                if analyzer.is_instrumenting() && pending > 0 {
                    let slot = &mut self.slots[id];
                    slot.pending_children = pending;
                    slot.parked = Some(analyzer);
                } else {
                    self.submit_finish(id, analyzer, HashMap::new());
                }
            }
            Message::Finished { id, outcome } => {
                let rewritten = outcome
                    .as_ref()
                    .ok()
                    .and_then(|r| r.rewritten.as_ref())
                    .map(|o| o.path.clone());
                if let Err(e) = &outcome {
                    warn!(archive = %self.slots[id].path.display(), error = %e, "archive analysis failed");
                }
                self.slots[id].result = Some(outcome);

                let Some(parent) = self.slots[id].parent else {
                    return;
                };
                if let (Some(entry), Some(file)) = (self.slots[id].entry_in_parent.clone(), rewritten) {
                    self.slots[parent].child_files.insert(entry, file);
                }
                let ready = {
                    let slot = &mut self.slots[parent];
                    if slot.pending_children == 0 {
                        None
                    } else {
                        slot.pending_children -= 1;
                        if slot.pending_children == 0 {
                            slot.parked
                                .take()
                                .map(|a| (a, std::mem::take(&mut slot.child_files)))
                        } else {
                            None
                        }
                    }
                };
                if let Some((analyzer, files)) = ready {
                    self.submit_finish(parent, analyzer, files);
                }
            }
        }
    }

    fn into_report(self, timed_out: bool) -> BatchReport {
        let submitted = self.slots.len();
        let results = self
            .slots
            .into_iter()
            .enumerate()
            .filter_map(|(id, slot)| {
                let outcome = slot.result?;
                Some(AnalysisResult {
                    id,
                    path: slot.path,
                    parent: slot.parent,
                    entry_in_parent: slot.entry_in_parent,
                    dependency: slot.dependency,
                    outcome,
                })
            })
            .collect();
        BatchReport {
            results,
            submitted,
            timed_out,
        }
    }
}

fn scan_task(
    id: TaskId,
    path: &Path,
    session: Arc<AnalysisSession>,
    out_dir: Option<&Path>,
    library_id: Option<LibraryId>,
) -> Message {
    let mut analyzer = match ArchiveAnalyzer::open(path, session) {
        Ok(analyzer) => analyzer,
        Err(e) => return Message::Finished { id, outcome: Err(e) },
    };
    if let Some(dir) = out_dir {
        analyzer.set_output_dir(dir);
    }
    if let Some(library_id) = library_id {
        analyzer.set_library_id(library_id);
    }
    if let Err(e) = analyzer.scan() {
        return Message::Finished { id, outcome: Err(e) };
    }

    let children = analyzer.children();
    if children.is_empty() {
        Message::Finished {
            id,
            outcome: finish(analyzer, HashMap::new()),
        }
    } else {
        Message::Scanned { id, analyzer, children }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{plain_class, temp_dir, temp_path, write_jar};
    use std::fs;

    fn config(work: &Path, instrument: bool) -> AnalysisConfig {
        AnalysisConfig {
            instrument,
            work_dir: work.to_path_buf(),
            ..AnalysisConfig::default()
        }
    }

    #[test]
    fn failures_do_not_affect_siblings() {
        let good = temp_path("good.jar");
        let bad = temp_path("bad.jar");
        write_jar(&good, &[("a/B.class", &plain_class("a/B"))]);
        fs::write(&bad, b"garbage").unwrap();
        let work = temp_dir("orchestrator-siblings");

        let mut known = HashMap::new();
        known.insert(
            good.clone(),
            DependencyMeta {
                library_id: LibraryId::parse("g:good:1"),
                scope: Some("compile".into()),
                transitive: false,
            },
        );

        let orchestrator = Orchestrator::new(config(&work, false));
        let report = orchestrator.analyze(&[good.clone(), bad.clone(), good.clone()], &known).unwrap();
        assert!(!report.timed_out);
        assert_eq!(report.submitted, 2);
        assert_eq!(report.results.len(), 2);

        let good_result = report.get(&good).unwrap();
        let library = &good_result.outcome.as_ref().unwrap().library;
        assert_eq!(library.library_id, LibraryId::parse("g:good:1"));
        assert_eq!(good_result.dependency.as_ref().unwrap().scope.as_deref(), Some("compile"));
        assert!(matches!(report.get(&bad).unwrap().outcome, Err(AnalysisError::Open { .. })));
        assert_eq!(report.failures().count(), 1);

        let _ = fs::remove_file(&good);
        let _ = fs::remove_file(&bad);
        let _ = fs::remove_dir_all(&work);
    }

    #[test]
    fn nested_archives_form_a_tree() {
        let inner = temp_path("inner.jar");
        write_jar(&inner, &[("lib/Util.class", &plain_class("lib/Util"))]);
        let inner_bytes = fs::read(&inner).unwrap();
        let war = temp_path("tree.war");
        write_jar(
            &war,
            &[
                ("WEB-INF/classes/app/Main.class", &plain_class("app/Main")),
                ("WEB-INF/lib/inner.jar", &inner_bytes),
            ],
        );
        let work = temp_dir("orchestrator-tree");

        let orchestrator = Orchestrator::new(config(&work, false));
        let report = orchestrator.analyze(&[war.clone()], &HashMap::new()).unwrap();
        assert_eq!(report.results.len(), 2);

        let tree = report.dependency_tree();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].path, war);
        assert_eq!(tree[0].children.len(), 1);
        assert_eq!(tree[0].children[0].entry_in_parent.as_deref(), Some("WEB-INF/lib/inner.jar"));
        assert!(tree[0].children[0].constructs > 0);

        let summaries = report.summaries(false);
        let child = summaries.iter().find(|s| s.parent.is_some()).unwrap();
        assert_eq!(child.parent.as_deref(), Some(war.as_path()));
        assert!(child.report.as_ref().unwrap().library.constructs.is_empty());

        orchestrator.reset();
        assert!(orchestrator.resolution_context().is_empty());

        let _ = fs::remove_file(&inner);
        let _ = fs::remove_file(&war);
        let _ = fs::remove_dir_all(&work);
    }
}
