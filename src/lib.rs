//! # jarweaver
//!
//! Discovers code constructs in Java archives and rewrites the archives with
//! monitoring probes, recursing into web archives and self-executing JARs.
//!
//! ## Architecture
//!
//! - **construct**: Construct identifiers and class entry name mapping
//! - **classfile**: Minimal class file reader and attribute writer
//! - **manifest**: JAR manifest parsing, provenance attributes and serialization
//! - **library**: Library summary produced per archive
//! - **pom**: Bundled Maven descriptor parsing
//! - **digest**: Archive digests
//! - **probe**: Memory-mapped archive inspection helpers
//! - **scan**: File discovery under directories
//! - **resolve**: Session classpath used to resolve class names
//! - **instrument**: Instrumentor seam, blacklist and statistics
//! - **rewrite**: Streaming archive rewriter with substitution rules
//! - **container**: Web and self-executing archive layouts
//! - **analyzer**: Per-archive scan, instrument and rewrite state machine
//! - **orchestrator**: Batch scheduling of archives and their nested archives

pub mod analyzer;
pub mod classfile;
pub mod cli;
pub mod config;
pub mod construct;
pub mod container;
pub mod digest;
pub mod error;
pub mod instrument;
pub mod library;
pub mod manifest;
pub mod orchestrator;
pub mod pom;
pub mod probe;
pub mod resolve;
pub mod rewrite;
pub mod scan;

#[cfg(test)]
mod testutil;
