//! Stable identifiers for addressable code units.
//!
//! A [`ConstructId`] names a package, class, method, constructor or static
//! initializer independently of the archive it was found in. Class
//! identifiers are derived from archive entry paths with
//! [`qualified_name_of`]; entries that cannot form a valid identifier are
//! reported as an [`EntryNameError`] and skipped by the callers.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::error::EntryNameError;

pub const CLASS_SUFFIX: &str = ".class";
pub const MULTI_RELEASE_PREFIX: &str = "META-INF/versions/";

const SYNTHETIC_DESCRIPTORS: [&str; 2] = ["package-info.class", "module-info.class"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Java,
    Python,
    Javascript,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConstructKind {
    Package,
    Class,
    Interface,
    Enum,
    Method,
    Constructor,
    StaticInit,
    Module,
    Function,
}

impl ConstructKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConstructKind::Package => "package",
            ConstructKind::Class => "class",
            ConstructKind::Interface => "interface",
            ConstructKind::Enum => "enum",
            ConstructKind::Method => "method",
            ConstructKind::Constructor => "constructor",
            ConstructKind::StaticInit => "static-init",
            ConstructKind::Module => "module",
            ConstructKind::Function => "function",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConstructId {
    pub language: Language,
    pub kind: ConstructKind,
    pub qualified_name: String,
}

impl ConstructId {
    pub fn new(language: Language, kind: ConstructKind, qualified_name: impl Into<String>) -> Self {
        Self {
            language,
            kind,
            qualified_name: qualified_name.into(),
        }
    }

    pub fn java(kind: ConstructKind, qualified_name: impl Into<String>) -> Self {
        Self::new(Language::Java, kind, qualified_name)
    }
}

impl Ord for ConstructId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.qualified_name
            .cmp(&other.qualified_name)
            .then_with(|| self.kind.cmp(&other.kind))
            .then_with(|| self.language.cmp(&other.language))
    }
}

impl PartialOrd for ConstructId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ConstructId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}|{}|{}", self.language, self.kind.as_str(), self.qualified_name)
    }
}

pub fn is_java_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first.is_alphabetic() || first == '_' || first == '$') {
        return false;
    }
    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}

pub fn is_class_entry(entry_name: &str) -> bool {
    entry_name.ends_with(CLASS_SUFFIX)
}

/// Converts an archive entry such as `a/b/C.class` into `a.b.C`.
pub fn qualified_name_of(entry_name: &str) -> Result<String, EntryNameError> {
    let Some(stem) = entry_name.strip_suffix(CLASS_SUFFIX) else {
        return Err(EntryNameError::NotAClass(entry_name.to_string()));
    };
    if entry_name.starts_with(MULTI_RELEASE_PREFIX) {
        return Err(EntryNameError::MultiRelease(entry_name.to_string()));
    }
    if SYNTHETIC_DESCRIPTORS
        .iter()
        .any(|descriptor| entry_name.ends_with(descriptor))
    {
        return Err(EntryNameError::SyntheticDescriptor(entry_name.to_string()));
    }

    let mut segments = Vec::new();
    for segment in stem.split(['/', '\\']) {
        if !is_java_identifier(segment) {
            return Err(EntryNameError::InvalidSegment {
                entry: entry_name.to_string(),
                segment: segment.to_string(),
            });
        }
        segments.push(segment);
    }
    Ok(segments.join("."))
}

pub fn entry_path_of(qualified_name: &str) -> String {
    format!("{}{CLASS_SUFFIX}", qualified_name.replace('.', "/"))
}

pub fn package_of(qualified_name: &str) -> Option<&str> {
    qualified_name.rsplit_once('.').map(|(pkg, _)| pkg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn qualified_name_of_builds_dotted_names() {
        assert_eq!(qualified_name_of("Foo.class").unwrap(), "Foo");
        assert_eq!(
            qualified_name_of("com/sun/tools/xjc/grammar/IgnoreItem.class").unwrap(),
            "com.sun.tools.xjc.grammar.IgnoreItem"
        );
        assert_eq!(qualified_name_of("a/b/C$Inner.class").unwrap(), "a.b.C$Inner");
    }

    #[test]
    fn qualified_name_of_rejects_invalid_segments() {
        let err = qualified_name_of("1.0/com/sun/tools/xjc/grammar/IgnoreItem.class").unwrap_err();
        assert!(matches!(err, EntryNameError::InvalidSegment { ref segment, .. } if segment == "1.0"));
    }

    #[test]
    fn qualified_name_of_excludes_descriptors_and_overlays() {
        assert!(matches!(
            qualified_name_of("com/sun/tools/xjc/grammar/module-info.class"),
            Err(EntryNameError::SyntheticDescriptor(_))
        ));
        assert!(matches!(
            qualified_name_of("com/sun/tools/xjc/grammar/package-info.class"),
            Err(EntryNameError::SyntheticDescriptor(_))
        ));
        assert!(matches!(
            qualified_name_of("META-INF/versions/9/org/apache/logging/log4j/core/util/SystemClock.class"),
            Err(EntryNameError::MultiRelease(_))
        ));
        assert!(matches!(
            qualified_name_of("META-INF/MANIFEST.MF"),
            Err(EntryNameError::NotAClass(_))
        ));
    }

    #[test]
    fn entry_path_round_trips_qualified_name() {
        for entry in ["Foo.class", "a/b/C.class", "org/x/y/Outer$Inner.class"] {
            let qname = qualified_name_of(entry).unwrap();
            assert_eq!(entry_path_of(&qname), entry);
        }
    }

    #[test]
    fn is_java_identifier_follows_java_rules() {
        assert!(!is_java_identifier("1.0"));
        assert!(is_java_identifier("Foo"));
        assert!(!is_java_identifier("{Foo"));
        assert!(!is_java_identifier(""));
        assert!(is_java_identifier("_$x9"));
    }

    #[test]
    fn construct_ids_order_by_qualified_name() {
        let mut set = BTreeSet::new();
        set.insert(ConstructId::java(ConstructKind::Method, "b.B.run()"));
        set.insert(ConstructId::java(ConstructKind::Class, "a.A"));
        set.insert(ConstructId::java(ConstructKind::Class, "a.A"));
        let names: Vec<_> = set.iter().map(|c| c.qualified_name.as_str()).collect();
        assert_eq!(names, vec!["a.A", "b.B.run()"]);
    }
}
