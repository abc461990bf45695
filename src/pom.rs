//! Bundled package descriptors (`pom.xml`).

use tracing::{debug, warn};
use xmltree::Element;

use crate::library::LibraryId;

pub const POM_FILE_NAME: &str = "pom.xml";

pub fn is_pom_entry(entry_name: &str) -> bool {
    entry_name == POM_FILE_NAME || entry_name.ends_with("/pom.xml")
}

/// Reads the coordinates declared by a `pom.xml`.
///
/// Group and version fall back to the `<parent>` block. Returns `None` when
/// the document cannot be parsed or any coordinate is missing; the caller
/// only ever logs that.
pub fn library_id_of(entry_name: &str, content: &[u8]) -> Option<LibraryId> {
    let root = match Element::parse(content) {
        Ok(root) => root,
        Err(e) => {
            warn!(entry = entry_name, error = %e, "cannot parse bundled package descriptor");
            return None;
        }
    };

    let parent = root.get_child("parent");
    let coordinate = |name: &str| -> Option<String> {
        child_text(&root, name).or_else(|| parent.and_then(|p| child_text(p, name)))
    };

    let group = coordinate("groupId");
    let artifact = child_text(&root, "artifactId");
    let version = coordinate("version");

    match (group, artifact, version) {
        (Some(g), Some(a), Some(v)) => Some(LibraryId::new(g, a, v)),
        (g, a, v) => {
            debug!(
                entry = entry_name,
                group = ?g,
                artifact = ?a,
                version = ?v,
                "bundled package descriptor has incomplete coordinates"
            );
            None
        }
    }
}

fn child_text(element: &Element, name: &str) -> Option<String> {
    let text = element.get_child(name)?.get_text()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}
