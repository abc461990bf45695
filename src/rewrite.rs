//! Archive rewriting.
//!
//! An [`ArchiveRewriter`] copies a source archive into a new one. Entries
//! matched by a [`RewriteRule`] may get new bytes; every other entry is
//! copied raw, so its compression method, CRC and sizes are untouched. The
//! manifest is regenerated with provenance attributes and signature files
//! are dropped, since any substitution invalidates them.

use chrono::Local;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, warn};
use zip::read::ZipFile;
use zip::write::{FileOptions, ZipWriter};
use zip::CompressionMethod;

use crate::construct::qualified_name_of;
use crate::digest::hash_file;
use crate::error::AnalysisError;
use crate::manifest::{
    CLASS_PATH, MANIFEST_PATH, Manifest, ORIGINAL_DIGEST, is_signature_entry,
};
use crate::probe::{open_archive, read_entry_from};

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Where the bytes of a matched entry come from.
#[derive(Debug, Clone)]
pub enum EntrySource {
    /// Copy the source entry unchanged.
    PassThrough,
    /// Class bytes keyed by qualified class name; `strip_prefix` is removed
    /// from the entry name before the name is derived.
    Classes {
        strip_prefix: String,
        bytes: HashMap<String, Vec<u8>>,
    },
    /// Rewritten nested archives keyed by entry name.
    NestedArchives { files: HashMap<String, PathBuf> },
    /// Key/values merged into a `.properties` entry.
    Properties { values: BTreeMap<String, String> },
}

#[derive(Debug, Clone)]
pub struct RewriteRule {
    pattern: Regex,
    source: EntrySource,
}

impl RewriteRule {
    /// `pattern` must match the whole entry name.
    pub fn new(pattern: &str, source: EntrySource) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(&format!("^(?:{pattern})$"))?,
            source,
        })
    }

    pub fn matches(&self, entry_name: &str) -> bool {
        self.pattern.is_match(entry_name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RewriteOutcome {
    pub path: PathBuf,
    pub substitution_requests: usize,
    pub replaced: usize,
    pub passed_through: usize,
    pub duplicates_skipped: usize,
    pub signatures_dropped: usize,
    pub additional_files: usize,
    pub reused: bool,
}

pub struct ArchiveRewriter {
    path: PathBuf,
    file_size: u64,
    manifest: Manifest,
    entry_names: Vec<String>,
    digest: Option<String>,
    skip_attributes: BTreeSet<String>,
    add_attributes: Vec<(String, String)>,
    classifier: Option<String>,
    rules: Vec<RewriteRule>,
    additional_files: BTreeMap<String, PathBuf>,
    compress_new_entries: bool,
    rewritten: Option<PathBuf>,
}

impl ArchiveRewriter {
    pub fn open(path: &Path) -> Result<Self, AnalysisError> {
        let mut archive = open_archive(path).map_err(|e| AnalysisError::open(path, format!("{e:#}")))?;

        let mut entry_names = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let entry = archive.by_index(i).map_err(|e| AnalysisError::open(path, e))?;
            entry_names.push(entry.name().to_string());
        }

        let manifest = match read_entry_from(&mut archive, MANIFEST_PATH)
            .map_err(|e| AnalysisError::open(path, format!("{e:#}")))?
        {
            Some(bytes) => Manifest::parse(&bytes),
            None => {
                warn!(archive = %path.display(), "manifest file is missing");
                Manifest::new()
            }
        };

        let file_size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);

        Ok(Self {
            path: path.to_path_buf(),
            file_size,
            manifest,
            entry_names,
            digest: None,
            skip_attributes: BTreeSet::new(),
            add_attributes: Vec::new(),
            classifier: None,
            rules: Vec::new(),
            additional_files: BTreeMap::new(),
            compress_new_entries: true,
            rewritten: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn original_manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn entry_names(&self) -> &[String] {
        &self.entry_names
    }

    pub fn has_entry(&self, entry_name: &str) -> bool {
        self.entry_names.iter().any(|n| n == entry_name)
    }

    pub fn has_entry_with_prefix(&self, prefix: &str) -> bool {
        self.entry_names.iter().any(|n| n.starts_with(prefix))
    }

    pub fn has_manifest_attribute(&self, key: &str) -> bool {
        self.manifest.contains(key)
    }

    pub fn is_rewritten(&self) -> bool {
        self.manifest.is_rewritten()
    }

    /// Digest of the archive before any rewrite by this engine.
    pub fn digest(&mut self) -> Result<String, AnalysisError> {
        if let Some(d) = &self.digest {
            return Ok(d.clone());
        }
        let digest = match self.manifest.get(ORIGINAL_DIGEST) {
            Some(d) => d.to_string(),
            None => hash_file(&self.path).map_err(|e| AnalysisError::open(&self.path, format!("{e:#}")))?,
        };
        self.digest = Some(digest.clone());
        Ok(digest)
    }

    pub fn skip_manifest_attribute(&mut self, key: &str) {
        self.skip_attributes.insert(key.to_ascii_lowercase());
    }

    pub fn add_manifest_attribute(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .add_attributes
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
        {
            Some((_, v)) => *v = value,
            None => self.add_attributes.push((key.to_string(), value)),
        }
    }

    pub fn set_classifier(&mut self, classifier: impl Into<String>) {
        self.classifier = Some(classifier.into());
    }

    pub fn set_compress_new_entries(&mut self, compress: bool) {
        self.compress_new_entries = compress;
    }

    /// Rules are tried in registration order; the first match wins.
    pub fn register(&mut self, pattern: &str, source: EntrySource) -> Result<(), regex::Error> {
        self.rules.push(RewriteRule::new(pattern, source)?);
        Ok(())
    }

    /// Adds `path` as `<target_dir>/<file name>`. Without `overwrite` the
    /// file is ignored when the archive already has such an entry.
    pub fn add_file(&mut self, target_dir: Option<&str>, path: &Path, overwrite: bool) {
        let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            warn!(path = %path.display(), "additional file has no file name");
            return;
        };
        let entry_name = match target_dir {
            None | Some("") => file_name,
            Some(dir) if dir.ends_with('/') => format!("{dir}{file_name}"),
            Some(dir) => format!("{dir}/{file_name}"),
        };
        if overwrite || !self.has_entry(&entry_name) {
            self.additional_files.insert(entry_name, path.to_path_buf());
        }
    }

    pub fn rewrite_file_name(&self) -> String {
        let original = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match &self.classifier {
            None => original,
            Some(classifier) => match original.rfind('.') {
                Some(idx) => format!("{}-{classifier}{}", &original[..idx], &original[idx..]),
                None => format!("{original}-{classifier}"),
            },
        }
    }

    /// Path of the last rewrite, if any.
    pub fn rewritten_path(&self) -> Option<&Path> {
        self.rewritten.as_deref()
    }

    /// Writes the rewritten archive into `out_dir`. An existing file with the
    /// target name is returned as is.
    pub fn rewrite(&mut self, out_dir: &Path) -> Result<RewriteOutcome, AnalysisError> {
        let file_name = self.rewrite_file_name();
        let target = out_dir.join(&file_name);

        if target.exists() {
            info!(target = %target.display(), "target already exists, skip rewriting");
            self.rewritten = Some(target.clone());
            return Ok(RewriteOutcome {
                path: target,
                reused: true,
                ..RewriteOutcome::default()
            });
        }

        fs::create_dir_all(out_dir).map_err(|e| AnalysisError::Write {
            target: target.clone(),
            reason: e.to_string(),
        })?;

        let manifest = self.modified_manifest()?;
        let tmp = out_dir.join(format!(
            ".{file_name}.{}-{}.tmp",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        let result = self
            .write_archive(&tmp, &target, &manifest)
            .and_then(|outcome| {
                fs::rename(&tmp, &target)
                    .map(|_| outcome)
                    .map_err(|e| AnalysisError::Write {
                        target: target.clone(),
                        reason: e.to_string(),
                    })
            });

        match result {
            Ok(mut outcome) => {
                outcome.path = target.clone();
                info!(
                    source = %self.path.display(),
                    target = %target.display(),
                    replaced = outcome.replaced,
                    passed_through = outcome.passed_through,
                    "archive rewritten"
                );
                self.rewritten = Some(target);
                Ok(outcome)
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                Err(e)
            }
        }
    }

    fn modified_manifest(&mut self) -> Result<Manifest, AnalysisError> {
        let mut manifest = Manifest::new();
        for (k, v) in self.manifest.attributes() {
            if !self.skip_attributes.contains(&k.to_ascii_lowercase()) {
                manifest.set(k, v);
            }
        }
        for (k, v) in &self.add_attributes {
            manifest.set(k, v.clone());
        }
        let digest = self.digest()?;
        manifest.stamp_provenance(&digest, Local::now());
        Ok(manifest)
    }

    fn write_archive(
        &self,
        tmp: &Path,
        target: &Path,
        manifest: &Manifest,
    ) -> Result<RewriteOutcome, AnalysisError> {
        let write_err = |reason: String| AnalysisError::Write {
            target: target.to_path_buf(),
            reason,
        };
        let entry_err = |entry: &str, reason: String| AnalysisError::WriteEntry {
            entry: entry.to_string(),
            target: target.to_path_buf(),
            reason,
        };

        let mut source = open_archive(&self.path).map_err(|e| AnalysisError::open(&self.path, format!("{e:#}")))?;
        let file = File::create(tmp).map_err(|e| write_err(e.to_string()))?;
        let mut zip = ZipWriter::new(file);
        let new_entry_options = FileOptions::default().compression_method(self.new_entry_method());

        let mut outcome = RewriteOutcome::default();
        let mut written: HashSet<String> = HashSet::new();
        let mut pending = self.additional_files.clone();

        zip.start_file(MANIFEST_PATH, FileOptions::default().compression_method(CompressionMethod::Deflated))
            .map_err(|e| entry_err(MANIFEST_PATH, e.to_string()))?;
        zip.write_all(&manifest.to_bytes())
            .map_err(|e| entry_err(MANIFEST_PATH, e.to_string()))?;
        written.insert(MANIFEST_PATH.to_string());

        for i in 0..source.len() {
            let mut entry = source.by_index(i).map_err(|e| write_err(e.to_string()))?;
            let name = entry.name().to_string();

            if name == MANIFEST_PATH {
                continue;
            }
            if written.contains(&name) {
                debug!(entry = %name, "duplicate entry skipped");
                outcome.duplicates_skipped += 1;
                continue;
            }
            if is_signature_entry(&name) {
                debug!(entry = %name, "signature entry dropped");
                outcome.signatures_dropped += 1;
                continue;
            }

            let replacement = if let Some(path) = pending.remove(&name) {
                let bytes = fs::read(&path).map_err(|e| entry_err(&name, e.to_string()))?;
                outcome.additional_files += 1;
                Some((bytes, new_entry_options))
            } else if entry.is_dir() {
                None
            } else {
                let (requested, bytes) = self
                    .substitute(&name, &mut entry)
                    .map_err(|reason| entry_err(&name, reason))?;
                if requested {
                    outcome.substitution_requests += 1;
                }
                bytes.map(|b| {
                    outcome.replaced += 1;
                    let method = match entry.compression() {
                        CompressionMethod::Stored => CompressionMethod::Stored,
                        _ => CompressionMethod::Deflated,
                    };
                    let options = FileOptions::default()
                        .compression_method(method)
                        .last_modified_time(entry.last_modified());
                    (b, options)
                })
            };

            match replacement {
                Some((bytes, options)) => {
                    debug!(entry = %name, size = bytes.len(), "entry substituted");
                    drop(entry);
                    zip.start_file(name.as_str(), options)
                        .map_err(|e| entry_err(&name, e.to_string()))?;
                    zip.write_all(&bytes).map_err(|e| entry_err(&name, e.to_string()))?;
                }
                None => {
                    zip.raw_copy_file(entry)
                        .map_err(|e| entry_err(&name, e.to_string()))?;
                    outcome.passed_through += 1;
                }
            }
            written.insert(name);
        }

        for (name, path) in pending {
            if written.contains(&name) {
                continue;
            }
            if !path.is_file() {
                warn!(entry = %name, path = %path.display(), "additional file does not exist");
                continue;
            }
            let bytes = fs::read(&path).map_err(|e| entry_err(&name, e.to_string()))?;
            zip.start_file(name.as_str(), new_entry_options)
                .map_err(|e| entry_err(&name, e.to_string()))?;
            zip.write_all(&bytes).map_err(|e| entry_err(&name, e.to_string()))?;
            outcome.additional_files += 1;
            written.insert(name);
        }

        zip.finish().map_err(|e| write_err(e.to_string()))?;
        Ok(outcome)
    }

    /// Returns whether a substituting rule matched and, if so, the new bytes.
    fn substitute(&self, name: &str, entry: &mut ZipFile<'_>) -> Result<(bool, Option<Vec<u8>>), String> {
        let Some(rule) = self.rules.iter().find(|r| r.matches(name)) else {
            return Ok((false, None));
        };
        match &rule.source {
            EntrySource::PassThrough => Ok((false, None)),
            EntrySource::Classes { strip_prefix, bytes } => {
                let relative = name.strip_prefix(strip_prefix.as_str()).unwrap_or(name);
                let found = match qualified_name_of(relative) {
                    Ok(qname) => bytes.get(&qname).cloned(),
                    Err(e) => {
                        debug!(entry = name, reason = %e, "no class name for entry");
                        None
                    }
                };
                Ok((true, found))
            }
            EntrySource::NestedArchives { files } => match files.get(name) {
                Some(path) => fs::read(path).map(|b| (true, Some(b))).map_err(|e| {
                    format!("cannot read rewritten nested archive [{}]: {e}", path.display())
                }),
                None => {
                    debug!(entry = name, "no rewritten nested archive, keeping original");
                    Ok((true, None))
                }
            },
            EntrySource::Properties { values } => {
                let mut raw = Vec::new();
                entry.read_to_end(&mut raw).map_err(|e| e.to_string())?;
                let merged = merge_properties(&String::from_utf8_lossy(&raw), values);
                Ok((true, Some(merged.into_bytes())))
            }
        }
    }

    fn new_entry_method(&self) -> CompressionMethod {
        if self.compress_new_entries {
            CompressionMethod::Deflated
        } else {
            CompressionMethod::Stored
        }
    }

    /// Extracts every entry below `to_dir`. Entries that would land outside
    /// of it are skipped, as are entries that fail to extract.
    pub fn extract(&self, to_dir: &Path) -> Result<PathBuf, AnalysisError> {
        let extract_err = |reason: String| AnalysisError::Extract {
            path: self.path.clone(),
            reason,
        };
        let mut archive = open_archive(&self.path).map_err(|e| extract_err(format!("{e:#}")))?;
        fs::create_dir_all(to_dir).map_err(|e| extract_err(e.to_string()))?;

        for i in 0..archive.len() {
            let mut entry = match archive.by_index(i) {
                Ok(entry) => entry,
                Err(e) => {
                    error!(archive = %self.path.display(), index = i, error = %e, "cannot read entry");
                    continue;
                }
            };
            let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
                warn!(
                    entry = entry.name(),
                    archive = %self.path.display(),
                    "entry would be extracted outside of the destination directory, skipped"
                );
                continue;
            };
            let out = to_dir.join(relative);
            if let Err(e) = extract_entry(&mut entry, &out) {
                error!(entry = entry.name(), error = %e, "error while extracting entry");
            }
        }

        info!(archive = %self.path.display(), to = %to_dir.display(), "archive extracted");
        Ok(to_dir.to_path_buf())
    }
}

fn extract_entry(entry: &mut ZipFile<'_>, out: &Path) -> io::Result<()> {
    if entry.is_dir() {
        return fs::create_dir_all(out);
    }
    if let Some(parent) = out.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(out)?;
    io::copy(entry, &mut file)?;
    Ok(())
}

/// Replaces or appends `key=value` lines; comments and other keys are kept.
pub fn merge_properties(content: &str, values: &BTreeMap<String, String>) -> String {
    let mut remaining: BTreeMap<&str, &str> = values
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    let mut lines = Vec::new();

    for line in content.lines() {
        let trimmed = line.trim_start();
        let key = if trimmed.starts_with('#') || trimmed.starts_with('!') {
            None
        } else {
            trimmed
                .split(|c: char| c == '=' || c == ':' || c.is_whitespace())
                .next()
                .filter(|k| !k.is_empty())
        };
        match key.and_then(|k| remaining.remove_entry(k)) {
            Some((k, v)) => lines.push(format!("{k}={v}")),
            None => lines.push(line.to_string()),
        }
    }
    for (k, v) in remaining {
        lines.push(format!("{k}={v}"));
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Rewrites `path` without its `Class-Path` attribute into `tmp_dir`, using
/// the digest as classifier. Archives without the attribute are returned
/// unchanged.
pub fn preprocess_for_classpath(path: &Path, tmp_dir: &Path) -> Result<PathBuf, AnalysisError> {
    let mut rewriter = ArchiveRewriter::open(path)?;
    if !rewriter.has_manifest_attribute(CLASS_PATH) {
        info!(archive = %path.display(), "rewriting not necessary, original archive kept");
        return Ok(path.to_path_buf());
    }
    rewriter.skip_manifest_attribute(CLASS_PATH);
    let digest = rewriter.digest()?;
    rewriter.set_classifier(digest);
    Ok(rewriter.rewrite(tmp_dir)?.path)
}

/// Adds `path`, pre-processed if requested, to `classpath` and returns the
/// path that was added. Falls back to the original on any error.
pub fn append_to_classpath(
    classpath: &mut BTreeSet<PathBuf>,
    path: &Path,
    preprocess: bool,
    tmp_dir: &Path,
) -> PathBuf {
    let appended = if !preprocess || path.is_dir() {
        path.to_path_buf()
    } else {
        match preprocess_for_classpath(path, tmp_dir) {
            Ok(p) => p,
            Err(e) => {
                error!(archive = %path.display(), error = %e, "pre-processing failed, original archive appended");
                path.to_path_buf()
            }
        }
    };
    classpath.insert(appended.clone());
    appended
}
