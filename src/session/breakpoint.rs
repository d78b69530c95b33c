use crate::error::ReplyError;
use crate::runner::protocol::BreakpointRecord;
use std::collections::BTreeMap;

/// Breakpoint as it is exposed to the debugger frontend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    /// Identifier assigned by the runner.
    pub id: i64,
    pub source: String,
    pub line: u32,
    pub verified: bool,
}

impl Breakpoint {
    pub fn from_record(source: &str, record: BreakpointRecord) -> Self {
        Self {
            id: record.id,
            source: source.to_string(),
            line: record.line,
            verified: record.verified,
        }
    }
}

/// Requested breakpoint lines per source.
///
/// Lines of a source are replaced as a whole on every update, order and duplicates are kept as
/// the caller passed them.
#[derive(Debug, Default, Clone)]
pub struct BreakpointSets {
    sources: BTreeMap<String, Vec<u32>>,
}

impl BreakpointSets {
    pub fn replace(&mut self, source: impl Into<String>, lines: Vec<u32>) {
        self.sources.insert(source.into(), lines);
    }

    pub fn remove(&mut self, source: &str) -> Option<Vec<u32>> {
        self.sources.remove(source)
    }

    pub fn lines(&self, source: &str) -> Option<&[u32]> {
        self.sources.get(source).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u32])> {
        self.sources
            .iter()
            .map(|(source, lines)| (source.as_str(), lines.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// Map runner records to breakpoints. Records are positionally aligned with requested lines.
pub fn zip_records(
    source: &str,
    requested: &[u32],
    records: Vec<BreakpointRecord>,
) -> Result<Vec<Breakpoint>, ReplyError> {
    if records.len() != requested.len() {
        return Err(ReplyError::BreakpointMismatch {
            requested: requested.len(),
            returned: records.len(),
        });
    }
    Ok(records
        .into_iter()
        .map(|record| Breakpoint::from_record(source, record))
        .collect())
}
