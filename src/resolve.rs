//! Session-scoped classpath used to resolve class names to parsed class files.
//!
//! One [`ResolutionContext`] is owned by an orchestrator session and shared
//! with its workers through an `Arc`. Entries are only ever added; callers
//! `reset()` it between unrelated runs.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

use crate::classfile::ClassFile;
use crate::construct::entry_path_of;
use crate::error::ResolveError;
use crate::probe::{MappedArchive, open_archive, read_entry_from};

enum ClasspathEntry {
    Directory(PathBuf),
    Archive {
        path: PathBuf,
        archive: Mutex<MappedArchive>,
    },
}

impl ClasspathEntry {
    fn location(&self) -> &Path {
        match self {
            ClasspathEntry::Directory(p) => p,
            ClasspathEntry::Archive { path, .. } => path,
        }
    }

    fn read(&self, class: &str, entry_name: &str) -> Result<Option<Vec<u8>>, ResolveError> {
        let read_err = |reason: String| ResolveError::Read {
            class: class.to_string(),
            location: self.location().to_path_buf(),
            reason,
        };
        match self {
            ClasspathEntry::Directory(dir) => {
                let file = dir.join(entry_name);
                if !file.is_file() {
                    return Ok(None);
                }
                std::fs::read(&file).map(Some).map_err(|e| read_err(e.to_string()))
            }
            ClasspathEntry::Archive { archive, .. } => {
                let mut archive = archive
                    .lock()
                    .map_err(|_| read_err("classpath archive lock poisoned".into()))?;
                read_entry_from(&mut *archive, entry_name).map_err(|e| read_err(format!("{e:#}")))
            }
        }
    }
}

#[derive(Default)]
pub struct ResolutionContext {
    entries: RwLock<Vec<Arc<ClasspathEntry>>>,
}

impl ResolutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Adds a directory or an archive in front of the existing entries.
    /// Inserting a location that is already present is a no-op.
    pub fn insert_classpath(&self, path: &Path) -> anyhow::Result<()> {
        if self.contains(path) {
            return Ok(());
        }
        let entry = if path.is_dir() {
            ClasspathEntry::Directory(path.to_path_buf())
        } else {
            ClasspathEntry::Archive {
                path: path.to_path_buf(),
                archive: Mutex::new(open_archive(path)?),
            }
        };
        let mut entries = self
            .entries
            .write()
            .map_err(|_| anyhow::anyhow!("classpath lock poisoned"))?;
        entries.insert(0, Arc::new(entry));
        debug!(path = %path.display(), size = entries.len(), "classpath entry inserted");
        Ok(())
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.snapshot().iter().any(|e| e.location() == path)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Finds `qualified_name` (e.g. `a.b.C$D`) on the classpath, newest entry first.
    pub fn resolve(&self, qualified_name: &str) -> Result<ClassFile, ResolveError> {
        let entry_name = entry_path_of(qualified_name);
        for entry in self.snapshot() {
            if let Some(bytes) = entry.read(qualified_name, &entry_name)? {
                return ClassFile::parse(bytes).map_err(|source| ResolveError::Parse {
                    class: qualified_name.to_string(),
                    source,
                });
            }
        }
        Err(ResolveError::NotFound(qualified_name.to_string()))
    }

    /// Like [`resolve`](Self::resolve), but only looks at the entry inserted
    /// for `location`. Falls back to the whole classpath when `location` was
    /// never inserted.
    pub fn resolve_from(&self, location: &Path, qualified_name: &str) -> Result<ClassFile, ResolveError> {
        let Some(entry) = self.snapshot().into_iter().find(|e| e.location() == location) else {
            return self.resolve(qualified_name);
        };
        match entry.read(qualified_name, &entry_path_of(qualified_name))? {
            Some(bytes) => ClassFile::parse(bytes).map_err(|source| ResolveError::Parse {
                class: qualified_name.to_string(),
                source,
            }),
            None => Err(ResolveError::NotFound(qualified_name.to_string())),
        }
    }

    pub fn reset(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }

    fn snapshot(&self) -> Vec<Arc<ClasspathEntry>> {
        self.entries.read().map(|e| e.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{plain_class, temp_dir, temp_path, write_jar};
    use std::fs;

    #[test]
    fn resolves_from_archives_and_directories() {
        let jar = temp_path("resolve.jar");
        write_jar(&jar, &[("a/b/C.class", &plain_class("a/b/C"))]);
        let dir = temp_dir("resolve-dir");
        fs::create_dir_all(dir.join("x")).unwrap();
        fs::write(dir.join("x/Y.class"), plain_class("x/Y")).unwrap();

        let ctx = ResolutionContext::new();
        assert!(matches!(ctx.resolve("a.b.C"), Err(ResolveError::NotFound(_))));

        ctx.insert_classpath(&jar).unwrap();
        ctx.insert_classpath(&dir).unwrap();
        ctx.insert_classpath(&dir).unwrap();
        assert_eq!(ctx.len(), 2);

        assert_eq!(ctx.resolve("a.b.C").unwrap().name(), "a.b.C");
        assert_eq!(ctx.resolve("x.Y").unwrap().name(), "x.Y");

        ctx.reset();
        assert!(ctx.is_empty());
        assert!(ctx.resolve("x.Y").is_err());

        let _ = fs::remove_file(&jar);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn newest_entry_wins() {
        let old = temp_path("old.jar");
        let new = temp_path("new.jar");
        write_jar(&old, &[("p/Q.class", &plain_class("p/Q"))]);
        write_jar(&new, &[("p/Q.class", b"not a class")]);

        let ctx = ResolutionContext::new();
        ctx.insert_classpath(&old).unwrap();
        ctx.insert_classpath(&new).unwrap();
        assert!(matches!(ctx.resolve("p.Q"), Err(ResolveError::Parse { .. })));
        assert_eq!(ctx.resolve_from(&old, "p.Q").unwrap().name(), "p.Q");
        assert!(matches!(ctx.resolve_from(&old, "p.R"), Err(ResolveError::NotFound(_))));

        let _ = fs::remove_file(&old);
        let _ = fs::remove_file(&new);
    }

    #[test]
    fn inserting_a_broken_archive_fails() {
        let bad = temp_path("bad.jar");
        fs::write(&bad, b"nope").unwrap();
        assert!(ResolutionContext::new().insert_classpath(&bad).is_err());
        let _ = fs::remove_file(&bad);
    }
}
