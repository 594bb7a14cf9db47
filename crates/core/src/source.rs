//! Input record sources (the bulk-data supplier boundary).

use std::sync::Arc;

use crate::context::JobContext;
use crate::unit::{Record, UnitError};

/// An opened, forward-only stream of input records.
pub struct RecordCursor {
    total: Option<u64>,
    records: Box<dyn Iterator<Item = Record> + Send>,
}

impl RecordCursor {
    pub fn new(total: Option<u64>, records: impl Iterator<Item = Record> + Send + 'static) -> Self {
        Self {
            total,
            records: Box::new(records),
        }
    }

    /// Cursor over an in-memory vector; the total is known up front.
    pub fn from_vec(records: Vec<Record>) -> Self {
        let total = records.len() as u64;
        Self::new(Some(total), records.into_iter())
    }

    /// Cursor whose size is only known once it is exhausted.
    pub fn unsized_iter(records: impl Iterator<Item = Record> + Send + 'static) -> Self {
        Self::new(None, records)
    }

    pub fn empty() -> Self {
        Self::new(Some(0), std::iter::empty())
    }

    pub fn total(&self) -> Option<u64> {
        self.total
    }

    /// Pull up to `max` records. An empty slice means the cursor is exhausted.
    pub fn next_slice(&mut self, max: usize) -> Vec<Record> {
        self.records.by_ref().take(max).collect()
    }
}

impl core::fmt::Debug for RecordCursor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RecordCursor").field("total", &self.total).finish_non_exhaustive()
    }
}

/// Supplies the input for a unit. Opened once per launch, so retries see the
/// input afresh.
///
/// Sources receive the launch context; a source that cannot resolve what the
/// context references should fail with `UnitError::Validation`.
pub trait RecordSource: Send + Sync + 'static {
    fn open(&self, context: &JobContext) -> Result<RecordCursor, UnitError>;
}

impl<F> RecordSource for F
where
    F: Fn(&JobContext) -> Result<RecordCursor, UnitError> + Send + Sync + 'static,
{
    fn open(&self, context: &JobContext) -> Result<RecordCursor, UnitError> {
        self(context)
    }
}

/// A fixed set of records, shared between launches.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    records: Arc<Vec<Record>>,
}

impl StaticSource {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records: Arc::new(records),
        }
    }

    /// Source with no input; for units that do their own fetching.
    pub fn empty() -> Self {
        Self::default()
    }

    /// `count` sequential integer records, mostly useful in tests and demos.
    pub fn sequence(count: u64) -> Self {
        Self::new((0..count).map(Record::from).collect())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl RecordSource for StaticSource {
    fn open(&self, _context: &JobContext) -> Result<RecordCursor, UnitError> {
        let records = Arc::clone(&self.records);
        let total = records.len() as u64;
        Ok(RecordCursor::new(
            Some(total),
            (0..records.len()).map(move |i| records[i].clone()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_yields_fixed_size_slices() {
        let mut cursor = StaticSource::sequence(5).open(&JobContext::new()).unwrap();
        assert_eq!(cursor.total(), Some(5));
        assert_eq!(cursor.next_slice(2).len(), 2);
        assert_eq!(cursor.next_slice(2).len(), 2);
        assert_eq!(cursor.next_slice(2).len(), 1);
        assert!(cursor.next_slice(2).is_empty());
    }

    #[test]
    fn closure_sources_can_reject_stale_context() {
        let source = |ctx: &JobContext| {
            if ctx.contains("batch_id") {
                Ok(RecordCursor::empty())
            } else {
                Err(UnitError::validation("batch_id no longer exists"))
            }
        };
        assert!(source.open(&JobContext::new()).is_err());
        assert!(source.open(&JobContext::new().with("batch_id", 7)).is_ok());
    }
}
