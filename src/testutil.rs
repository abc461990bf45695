use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use zip::write::FileOptions;

static COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn temp_path(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "jarweaver_test_{}_{}_{}_{}",
        std::process::id(),
        nanos,
        n,
        name
    ))
}

pub fn temp_dir(name: &str) -> PathBuf {
    let dir = temp_path(name);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn write_jar(path: &Path, entries: &[(&str, &[u8])]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let file = std::fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for (name, content) in entries {
        if name.ends_with('/') {
            zip.add_directory(*name, options).unwrap();
            continue;
        }
        zip.start_file(*name, options).unwrap();
        zip.write_all(content).unwrap();
    }
    zip.finish().unwrap();
}

pub fn manifest(attributes: &[(&str, &str)]) -> Vec<u8> {
    let mut out = String::from("Manifest-Version: 1.0\r\n");
    for (k, v) in attributes {
        out.push_str(&format!("{k}: {v}\r\n"));
    }
    out.push_str("\r\n");
    out.into_bytes()
}

/// Builds a minimal, well-formed class file. `name` uses `/` separators;
/// methods are `(name, descriptor, access_flags)` without code.
pub fn class_bytes(name: &str, access: u16, methods: &[(&str, &str, u16)]) -> Vec<u8> {
    fn utf8(pool: &mut Vec<Vec<u8>>, s: &str) -> u16 {
        let mut e = vec![1u8];
        e.extend_from_slice(&(s.len() as u16).to_be_bytes());
        e.extend_from_slice(s.as_bytes());
        pool.push(e);
        pool.len() as u16
    }

    let mut pool: Vec<Vec<u8>> = Vec::new();

    let this_name = utf8(&mut pool, name);
    pool.push(vec![7, (this_name >> 8) as u8, this_name as u8]);
    let this_class = pool.len() as u16;
    let super_name = utf8(&mut pool, "java/lang/Object");
    pool.push(vec![7, (super_name >> 8) as u8, super_name as u8]);
    let super_class = pool.len() as u16;

    let mut method_refs = Vec::new();
    for (m_name, desc, flags) in methods {
        let n = utf8(&mut pool, m_name);
        let d = utf8(&mut pool, desc);
        method_refs.push((*flags, n, d));
    }

    let mut out = Vec::new();
    out.extend_from_slice(&0xCAFE_BABEu32.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&52u16.to_be_bytes());
    out.extend_from_slice(&((pool.len() + 1) as u16).to_be_bytes());
    for entry in &pool {
        out.extend_from_slice(entry);
    }
    out.extend_from_slice(&access.to_be_bytes());
    out.extend_from_slice(&this_class.to_be_bytes());
    out.extend_from_slice(&super_class.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&(method_refs.len() as u16).to_be_bytes());
    for (flags, n, d) in method_refs {
        out.extend_from_slice(&flags.to_be_bytes());
        out.extend_from_slice(&n.to_be_bytes());
        out.extend_from_slice(&d.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
    }
    out.extend_from_slice(&0u16.to_be_bytes());
    out
}

pub fn plain_class(name: &str) -> Vec<u8> {
    class_bytes(name, 0x0021, &[("<init>", "()V", 0x0001), ("run", "()V", 0x0001)])
}
