//! Instrumentation adapter.
//!
//! [`Instrumentor`] is the seam to whatever produces the probe; the default
//! [`MarkerInstrumentor`] tags the class with a `JarWeaverProbe` attribute.
//! [`InstrumentationControl`] applies an instrumentor to the classes of one
//! archive and keeps the statistics written into the rewritten manifest.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::classfile::ClassFile;
use crate::error::InstrumentError;
use crate::library::LibraryId;

pub const PROBE_ATTRIBUTE: &str = "JarWeaverProbe";

pub const DEFAULT_BLACKLIST: [&str; 4] = ["java.", "javax.", "jdk.", "sun."];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProbeContext {
    pub original_digest: Option<String>,
    pub app_context: Option<LibraryId>,
}

pub trait Instrumentor: Send + Sync {
    fn is_eligible(&self, _class_name: &str) -> bool {
        true
    }

    fn is_instrumented(&self, class: &ClassFile) -> bool;

    fn instrument(&self, class: &ClassFile, ctx: &ProbeContext) -> Result<Vec<u8>, InstrumentError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstrumentOutcome {
    AlreadyDone,
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InstrumentationStats {
    pub total: usize,
    pub already_done: usize,
    pub success: usize,
    pub failure: usize,
}

impl fmt::Display for InstrumentationStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} total, {} existed, {} ok, {} err]",
            self.total, self.already_done, self.success, self.failure
        )
    }
}

/// Adds the probe attribute; its presence means "already instrumented".
#[derive(Debug, Default, Clone, Copy)]
pub struct MarkerInstrumentor;

impl Instrumentor for MarkerInstrumentor {
    fn is_instrumented(&self, class: &ClassFile) -> bool {
        class.has_attribute(PROBE_ATTRIBUTE)
    }

    fn instrument(&self, class: &ClassFile, ctx: &ProbeContext) -> Result<Vec<u8>, InstrumentError> {
        let payload = format!(
            "{};{}",
            ctx.original_digest.as_deref().unwrap_or(""),
            ctx.app_context.as_ref().map(|a| a.to_string()).unwrap_or_default()
        );
        class
            .with_class_attribute(PROBE_ATTRIBUTE, payload.as_bytes())
            .map_err(|e| InstrumentError::Compile {
                class: class.name().to_string(),
                reason: e.to_string(),
            })
    }
}

/// Per-archive driver around an [`Instrumentor`]. Not shared between tasks.
pub struct InstrumentationControl {
    instrumentor: Arc<dyn Instrumentor>,
    blacklist: Vec<String>,
    ctx: ProbeContext,
    stats: InstrumentationStats,
    instrumented: HashMap<String, Vec<u8>>,
}

impl InstrumentationControl {
    pub fn new(instrumentor: Arc<dyn Instrumentor>, blacklist: Vec<String>, ctx: ProbeContext) -> Self {
        Self {
            instrumentor,
            blacklist,
            ctx,
            stats: InstrumentationStats::default(),
            instrumented: HashMap::new(),
        }
    }

    pub fn is_blacklisted(&self, class_name: &str) -> bool {
        self.blacklist.iter().any(|p| class_name.starts_with(p.as_str()))
    }

    pub fn accepts(&self, class_name: &str) -> bool {
        !self.is_blacklisted(class_name) && self.instrumentor.is_eligible(class_name)
    }

    /// Instruments one class. On success the new bytes are kept for the
    /// rewrite and also returned. A failure only bumps the counter.
    pub fn apply(&mut self, class: &ClassFile) -> (Option<Vec<u8>>, InstrumentOutcome) {
        self.stats.total += 1;
        let name = class.name();

        if self.instrumentor.is_instrumented(class) {
            self.stats.already_done += 1;
            debug!(class = name, "class already instrumented");
            return (None, InstrumentOutcome::AlreadyDone);
        }

        match self.instrumentor.instrument(class, &self.ctx) {
            Ok(bytes) => {
                self.stats.success += 1;
                self.instrumented.insert(name.to_string(), bytes.clone());
                (Some(bytes), InstrumentOutcome::Success)
            }
            Err(e) => {
                self.stats.failure += 1;
                warn!(class = name, error = %e, "instrumentation failed, class left untouched");
                (None, InstrumentOutcome::Failure)
            }
        }
    }

    pub fn stats(&self) -> InstrumentationStats {
        self.stats
    }

    /// Instrumented class bytes by qualified class name.
    pub fn into_instrumented(self) -> HashMap<String, Vec<u8>> {
        self.instrumented
    }
}

pub fn default_blacklist() -> Vec<String> {
    DEFAULT_BLACKLIST.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::plain_class;

    struct Refusing;

    impl Instrumentor for Refusing {
        fn is_eligible(&self, class_name: &str) -> bool {
            !class_name.ends_with("Skipped")
        }

        fn is_instrumented(&self, _class: &ClassFile) -> bool {
            false
        }

        fn instrument(&self, class: &ClassFile, _ctx: &ProbeContext) -> Result<Vec<u8>, InstrumentError> {
            Err(InstrumentError::Compile {
                class: class.name().to_string(),
                reason: "refused".into(),
            })
        }
    }

    fn control(instrumentor: Arc<dyn Instrumentor>) -> InstrumentationControl {
        let ctx = ProbeContext {
            original_digest: Some("abc".into()),
            app_context: LibraryId::parse("g:a:1"),
        };
        InstrumentationControl::new(instrumentor, default_blacklist(), ctx)
    }

    #[test]
    fn marker_instruments_once() {
        let mut ctl = control(Arc::new(MarkerInstrumentor));
        let class = ClassFile::parse(plain_class("a/B")).unwrap();

        let (bytes, outcome) = ctl.apply(&class);
        assert_eq!(outcome, InstrumentOutcome::Success);
        let patched = ClassFile::parse(bytes.unwrap()).unwrap();
        assert!(patched.has_attribute(PROBE_ATTRIBUTE));

        let (bytes, outcome) = ctl.apply(&patched);
        assert_eq!(outcome, InstrumentOutcome::AlreadyDone);
        assert!(bytes.is_none());

        assert_eq!(
            ctl.stats(),
            InstrumentationStats {
                total: 2,
                already_done: 1,
                success: 1,
                failure: 0
            }
        );
        assert_eq!(ctl.stats().to_string(), "[2 total, 1 existed, 1 ok, 0 err]");
        assert!(ctl.into_instrumented().contains_key("a.B"));
    }

    #[test]
    fn failures_are_counted_not_raised() {
        let mut ctl = control(Arc::new(Refusing));
        let class = ClassFile::parse(plain_class("a/B")).unwrap();
        let (bytes, outcome) = ctl.apply(&class);
        assert!(bytes.is_none());
        assert_eq!(outcome, InstrumentOutcome::Failure);
        assert_eq!(ctl.stats().failure, 1);
        assert!(ctl.into_instrumented().is_empty());
    }

    #[test]
    fn blacklist_and_eligibility_filter_classes() {
        let ctl = control(Arc::new(Refusing));
        assert!(!ctl.accepts("java.lang.String"));
        assert!(!ctl.accepts("javax.servlet.Filter"));
        assert!(!ctl.accepts("org.acme.Skipped"));
        assert!(ctl.accepts("org.acme.Widget"));
    }
}
