use anyhow::{Context, Result};
use memmap2::Mmap;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;
use zip::ZipArchive;

use crate::manifest::{MANIFEST_PATH, Manifest};

pub type MappedArchive = ZipArchive<Cursor<Mmap>>;

pub fn open_archive(path: &Path) -> Result<MappedArchive> {
    let file = File::open(path).with_context(|| format!("Failed to open archive: {}", path.display()))?;
    let mmap = unsafe { Mmap::map(&file).with_context(|| format!("Failed to mmap: {}", path.display()))? };
    ZipArchive::new(Cursor::new(mmap))
        .with_context(|| format!("Failed to read zip structure: {}", path.display()))
}

pub fn read_entry(path: &Path, entry_name: &str) -> Result<Option<Vec<u8>>> {
    let mut archive = open_archive(path)?;
    read_entry_from(&mut archive, entry_name)
}

pub fn read_entry_from<R: std::io::Read + std::io::Seek>(
    archive: &mut ZipArchive<R>,
    entry_name: &str,
) -> Result<Option<Vec<u8>>> {
    let mut entry = match archive.by_name(entry_name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to read entry: {entry_name}")),
    };
    let mut buf = Vec::with_capacity(entry.size() as usize);
    entry
        .read_to_end(&mut buf)
        .with_context(|| format!("Failed to decompress entry: {entry_name}"))?;
    Ok(Some(buf))
}

/// Main manifest section, or an empty manifest when the archive has none.
pub fn read_manifest(path: &Path) -> Result<Manifest> {
    Ok(read_entry(path, MANIFEST_PATH)?
        .map(|bytes| Manifest::parse(&bytes))
        .unwrap_or_default())
}
