//! Unit registry: resolves the code to run for a logical job.
//!
//! Retries, chain stages and recurring firings are dispatched by logical name
//! alone, so the unit and its input source are registered up front.
//!
//! Patterns:
//! - exact: `nightly-sync`
//! - category: `reports.*` matches `reports.daily`, `reports.weekly`
//! - wildcard: `*`

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use jobctl_core::{RecordSource, StaticSource, Unit};

/// A unit together with the source of its input.
#[derive(Clone)]
pub struct UnitWork {
    pub unit: Arc<dyn Unit>,
    pub source: Arc<dyn RecordSource>,
}

impl UnitWork {
    pub fn new(unit: impl Unit, source: impl RecordSource) -> Self {
        Self {
            unit: Arc::new(unit),
            source: Arc::new(source),
        }
    }

    /// A unit with no input records (single-shot or recurring bodies).
    pub fn standalone(unit: impl Unit) -> Self {
        Self::new(unit, StaticSource::empty())
    }

    pub fn requires_external_calls(&self) -> bool {
        self.unit.requires_external_calls()
    }
}

impl fmt::Debug for UnitWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitWork")
            .field("requires_external_calls", &self.requires_external_calls())
            .finish_non_exhaustive()
    }
}

/// Pattern-keyed registry of units.
#[derive(Debug, Default)]
pub struct UnitRegistry {
    entries: RwLock<HashMap<String, UnitWork>>,
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the unit for a logical-name pattern.
    pub fn register(&self, pattern: impl Into<String>, work: UnitWork) {
        let pattern = pattern.into();
        tracing::debug!(pattern = %pattern, "unit registered");
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(pattern, work);
        }
    }

    pub fn unregister(&self, pattern: &str) -> bool {
        self.entries
            .write()
            .map(|mut entries| entries.remove(pattern).is_some())
            .unwrap_or(false)
    }

    /// Find the unit for `logical_name`: exact match first, then the longest
    /// matching `prefix.*`, then `*`.
    pub fn resolve(&self, logical_name: &str) -> Option<UnitWork> {
        let entries = self.entries.read().ok()?;

        if let Some(work) = entries.get(logical_name) {
            return Some(work.clone());
        }

        let category = entries
            .iter()
            .filter_map(|(pattern, work)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = logical_name.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), work))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, work)| work.clone());
        if category.is_some() {
            return category;
        }

        entries.get("*").cloned()
    }

    pub fn patterns(&self) -> Vec<String> {
        let mut patterns: Vec<String> = self
            .entries
            .read()
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default();
        patterns.sort();
        patterns
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobctl_core::{JobContext, Record, UnitError, UnitOutcome};

    fn work(tag: u64) -> UnitWork {
        UnitWork::standalone(
            move |_: &[Record], _: &JobContext| -> Result<UnitOutcome, UnitError> {
                Ok(UnitOutcome::processed(tag))
            },
        )
    }

    fn tag_of(work: &UnitWork) -> u64 {
        work.unit
            .execute(&[], &JobContext::new())
            .unwrap()
            .items_processed
    }

    #[test]
    fn exact_match_wins() {
        let registry = UnitRegistry::new();
        registry.register("reports.*", work(1));
        registry.register("reports.daily", work(2));
        assert_eq!(tag_of(&registry.resolve("reports.daily").unwrap()), 2);
    }

    #[test]
    fn category_match() {
        let registry = UnitRegistry::new();
        registry.register("reports.*", work(1));
        registry.register("reports.finance.*", work(3));
        assert_eq!(tag_of(&registry.resolve("reports.weekly").unwrap()), 1);
        assert_eq!(tag_of(&registry.resolve("reports.finance.q3").unwrap()), 3);
        assert!(registry.resolve("reportsweekly").is_none());
    }

    #[test]
    fn wildcard_is_the_fallback() {
        let registry = UnitRegistry::new();
        assert!(registry.resolve("anything").is_none());
        registry.register("*", work(9));
        assert_eq!(tag_of(&registry.resolve("anything").unwrap()), 9);
    }

    #[test]
    fn unregister_removes_pattern() {
        let registry = UnitRegistry::new();
        registry.register("nightly-sync", work(1));
        assert!(registry.unregister("nightly-sync"));
        assert!(!registry.unregister("nightly-sync"));
        assert!(registry.patterns().is_empty());
    }
}
