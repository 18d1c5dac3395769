//! Conjunctive record filters applied during bucket scans.
//!
//! Each entity family exposes a small filter enum implementing
//! [`RecordFilter`]; a scan keeps a record only when every filter accepts it.

pub trait RecordFilter<T> {
    fn matches(&self, record: &T) -> bool;
}

/// True when every filter accepts the record. An empty list accepts everything.
pub fn matches_all<T, F: RecordFilter<T>>(record: &T, filters: &[F]) -> bool {
    filters.iter().all(|filter| filter.matches(record))
}
