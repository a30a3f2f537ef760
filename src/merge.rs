use std::collections::{HashMap, HashSet};

use crate::model::{LookupKey, ResolvedRecord};

pub type RowId = usize;

/// Row-level access to the dataset being enriched.
///
/// Implementations lock a single row inside `write_name_fields`; nothing here ever
/// holds the whole table.
pub trait PatientTable: Sync {
    /// Rows that carry a policy number and initials but no surname yet.
    fn rows_missing_names(&self) -> Vec<RowId>;

    fn read_key(&self, row: RowId) -> Option<LookupKey>;

    /// Fills surname, given name and patronymic if the row is still unnamed.
    /// Returns `false` when another writer got there first.
    fn write_name_fields(&self, row: RowId, record: &ResolvedRecord) -> bool;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub rows_filled: usize,
    /// Records whose `(insurance number, initials)` matched no unnamed row.
    pub records_unmatched: usize,
}

pub fn merge<T: PatientTable + ?Sized>(records: &[ResolvedRecord], table: &T) -> MergeStats {
    let index: HashMap<LookupKey, &ResolvedRecord> = records
        .iter()
        .map(|record| (record.match_key(), record))
        .collect();
    if index.is_empty() {
        return MergeStats::default();
    }

    let mut matched = HashSet::new();
    let mut rows_filled = 0usize;
    for row in table.rows_missing_names() {
        let Some(key) = table.read_key(row) else {
            continue;
        };
        let Some(record) = index.get(&key) else {
            continue;
        };
        if table.write_name_fields(row, record) {
            rows_filled += 1;
        }
        matched.insert(key);
    }

    MergeStats {
        rows_filled,
        records_unmatched: index.len() - matched.len(),
    }
}
