use anyhow::Result;
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};
use std::sync::mpsc;

/// All regular files below `base_path` with the given extension, sorted.
pub fn find_files(base_path: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    if !base_path.is_dir() {
        return Ok(Vec::new());
    }
    let (tx, rx) = mpsc::channel();

    let walker = WalkBuilder::new(base_path)
        .hidden(false)
        .ignore(false)
        .parents(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .build_parallel();

    walker.run(|| {
        let tx = tx.clone();
        Box::new(move |entry| {
            if let Ok(entry) = entry {
                let path = entry.path();
                let is_file = entry.file_type().is_some_and(|t| t.is_file());
                if is_file && path.extension().is_some_and(|e| e == extension) {
                    let _ = tx.send(path.to_path_buf());
                }
            }
            ignore::WalkState::Continue
        })
    });

    drop(tx);
    let mut files: Vec<PathBuf> = rx.iter().collect();
    files.sort();
    Ok(files)
}

pub fn find_archives(base_path: &Path) -> Result<Vec<PathBuf>> {
    let mut archives = find_files(base_path, "jar")?;
    archives.extend(find_files(base_path, "war")?);
    archives.sort();
    Ok(archives)
}

/// `base/a/b/C.class` relative to `base`, with `/` separators.
pub fn relative_entry_name(base_path: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(base_path).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::temp_dir;
    use std::fs;

    #[test]
    fn find_files_filters_by_extension() {
        let base = temp_dir("jarweaver-scan");
        fs::create_dir_all(base.join("a/b")).unwrap();
        fs::create_dir_all(base.join(".hidden")).unwrap();
        fs::write(base.join("a/b/C.class"), b"x").unwrap();
        fs::write(base.join("a/D.class"), b"x").unwrap();
        fs::write(base.join(".hidden/E.class"), b"x").unwrap();
        fs::write(base.join("a/readme.txt"), b"x").unwrap();
        fs::write(base.join("lib.jar"), b"x").unwrap();

        let classes = find_files(&base, "class").unwrap();
        assert_eq!(classes.len(), 3);
        assert!(classes.iter().all(|p| p.extension().unwrap() == "class"));

        let names: Vec<String> = classes
            .iter()
            .filter_map(|p| relative_entry_name(&base, p))
            .collect();
        assert!(names.contains(&"a/b/C.class".to_string()));

        assert_eq!(find_archives(&base).unwrap(), vec![base.join("lib.jar")]);
        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn missing_directory_yields_nothing() {
        let missing = std::env::temp_dir().join("jarweaver-scan-does-not-exist-at-all");
        assert!(find_files(&missing, "class").unwrap().is_empty());
    }
}
