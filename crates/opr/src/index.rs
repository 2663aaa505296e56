//! Ordered record collection
//!
//! Records are kept sorted on (database, schema, osuser), compared byte-wise
//! over the full padded fields, so lookups are binary searches. Anything that
//! mutates the collection out of order must call `sort_all` before the next
//! search.

use std::cmp::Ordering;

use crate::codec::{DatabaseField, OsUserField, Record, SchemaField};
use crate::error::{RepoError, Result};

/// Maximum number of records a repository holds
pub const MAX_ENTRIES: usize = 4096;

/// Three-field comparator behind the ordering invariant
pub fn compare(a: &Record, b: &Record) -> Ordering {
    compare_key(a, &b.database, &b.schema, &b.osuser)
}

fn compare_key(
    record: &Record,
    database: &DatabaseField,
    schema: &SchemaField,
    osuser: &OsUserField,
) -> Ordering {
    record
        .database
        .cmp(database)
        .then_with(|| record.schema.cmp(schema))
        .then_with(|| record.osuser.cmp(osuser))
}

/// Capacity-bounded, sorted set of records
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordSet {
    records: Vec<Record>,
}

impl RecordSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap records as decoded from disk and re-establish the order
    pub fn from_records(records: Vec<Record>) -> Self {
        let mut set = Self { records };
        set.sort_all();
        set
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.records.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Record> {
        self.records.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Record> {
        self.records.get_mut(index)
    }

    pub fn as_slice(&self) -> &[Record] {
        &self.records
    }

    pub fn sort_all(&mut self) {
        self.records.sort_by(compare);
    }

    /// Fails when the collection is already at `MAX_ENTRIES`
    pub fn ensure_room(&self, additional: usize) -> Result<()> {
        if self.records.len() + additional > MAX_ENTRIES {
            return Err(RepoError::CapacityExceeded(MAX_ENTRIES));
        }
        Ok(())
    }

    /// Append and re-sort
    pub fn insert(&mut self, record: Record) -> Result<()> {
        self.ensure_room(1)?;
        self.records.push(record);
        self.sort_all();
        Ok(())
    }

    /// Remove by index, closing the gap
    pub fn remove(&mut self, index: usize) -> Record {
        self.records.remove(index)
    }

    /// Index of the exact (database, schema, osuser) tuple
    pub fn find_exact(
        &self,
        database: &DatabaseField,
        schema: &SchemaField,
        osuser: &OsUserField,
    ) -> Option<usize> {
        self.records
            .binary_search_by(|candidate| compare_key(candidate, database, schema, osuser))
            .ok()
    }

    /// Index of the first record for (database, schema), whatever its osuser
    pub fn find_by_schema(&self, database: &DatabaseField, schema: &SchemaField) -> Option<usize> {
        let range = self.schema_range(database, schema);
        (!range.is_empty()).then_some(range.start)
    }

    /// Indices of every record for (database, schema), in order
    pub fn schema_range(
        &self,
        database: &DatabaseField,
        schema: &SchemaField,
    ) -> std::ops::Range<usize> {
        let lead = |candidate: &Record| {
            candidate
                .database
                .cmp(database)
                .then_with(|| candidate.schema.cmp(schema))
        };
        let start = self.records.partition_point(|r| lead(r) == Ordering::Less);
        let end = self.records.partition_point(|r| lead(r) != Ordering::Greater);
        start..end
    }

    pub fn is_sorted(&self) -> bool {
        self.records
            .windows(2)
            .all(|w| compare(&w[0], &w[1]) != Ordering::Greater)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FixedField;

    fn record(db: &str, schema: &str, osuser: &str) -> Record {
        Record {
            database: FixedField::from_text("database", db).unwrap(),
            schema: FixedField::from_text("schemaname", schema).unwrap(),
            osuser: FixedField::from_text("osusername", osuser).unwrap(),
            secret: FixedField::empty(),
        }
    }

    fn key(db: &str, schema: &str, osuser: &str) -> (DatabaseField, SchemaField, OsUserField) {
        let r = record(db, schema, osuser);
        (r.database, r.schema, r.osuser)
    }

    fn sample() -> RecordSet {
        let mut set = RecordSet::new();
        for (db, schema, osuser) in [
            ("TEST", "scott", "bob"),
            ("PRODDB", "hr", "carol"),
            ("PRODDB", "hr", "bob"),
            ("DEVDB", "app", "alice"),
            ("PRODDB", "finance", "bob"),
        ] {
            set.insert(record(db, schema, osuser)).unwrap();
        }
        set
    }

    #[test]
    fn test_insert_keeps_order() {
        let set = sample();
        assert!(set.is_sorted());
        let order: Vec<String> = set
            .iter()
            .map(|r| format!("{}/{}/{}", r.database.text(), r.schema.text(), r.osuser.text()))
            .collect();
        assert_eq!(
            order,
            [
                "DEVDB/app/alice",
                "PRODDB/finance/bob",
                "PRODDB/hr/bob",
                "PRODDB/hr/carol",
                "TEST/scott/bob",
            ]
        );
    }

    #[test]
    fn test_find_exact_present_and_absent() {
        let set = sample();
        for (i, r) in set.iter().enumerate() {
            assert_eq!(set.find_exact(&r.database, &r.schema, &r.osuser), Some(i));
        }

        let (d, s, o) = key("PRODDB", "hr", "dave");
        assert_eq!(set.find_exact(&d, &s, &o), None);
        let (d, s, o) = key("proddb", "hr", "bob");
        assert_eq!(set.find_exact(&d, &s, &o), None);
    }

    #[test]
    fn test_find_by_schema_returns_first_of_pair() {
        let mut set = RecordSet::new();
        for osuser in ["zed", "mia", "bob", "kim", "amy"] {
            set.insert(record("PRODDB", "hr", osuser)).unwrap();
        }
        set.insert(record("PRODDB", "ap", "bob")).unwrap();
        set.insert(record("TEST", "hr", "bob")).unwrap();

        let (d, s, _) = key("PRODDB", "hr", "");
        let i = set.find_by_schema(&d, &s).unwrap();
        assert_eq!(i, 1);
        assert_eq!(set.get(i).unwrap().osuser.text(), "amy");
    }

    #[test]
    fn test_find_by_schema_ignores_osuser() {
        let set = sample();
        let (d, s, _) = key("PRODDB", "hr", "");
        let i = set.find_by_schema(&d, &s).unwrap();
        assert_eq!(set.get(i).unwrap().schema.text(), "hr");
        assert_eq!(set.get(i).unwrap().osuser.text(), "bob");
        assert_eq!(i, 2);

        let (d, s, _) = key("PRODDB", "payroll", "");
        assert!(set.find_by_schema(&d, &s).is_none());
    }

    #[test]
    fn test_schema_range() {
        let set = sample();
        let (d, s, _) = key("PRODDB", "hr", "");
        assert_eq!(set.schema_range(&d, &s), 2..4);

        let (d, s, _) = key("PRODDB", "zzz", "");
        assert!(set.schema_range(&d, &s).is_empty());
    }

    #[test]
    fn test_remove_closes_gap() {
        let mut set = sample();
        let (d, s, o) = key("PRODDB", "hr", "bob");
        let i = set.find_exact(&d, &s, &o).unwrap();
        set.remove(i);

        assert_eq!(set.len(), 4);
        assert!(set.is_sorted());
        assert_eq!(set.find_exact(&d, &s, &o), None);
        let (d, s, o) = key("PRODDB", "hr", "carol");
        assert_eq!(set.find_exact(&d, &s, &o), Some(2));
    }

    #[test]
    fn test_capacity_bound() {
        let mut set = RecordSet::new();
        for i in 0..MAX_ENTRIES {
            set.records.push(record("DB", &format!("s{i}"), "u"));
        }
        set.sort_all();

        let err = set.insert(record("DB", "extra", "u")).unwrap_err();
        assert!(matches!(err, RepoError::CapacityExceeded(MAX_ENTRIES)));
        assert_eq!(set.len(), MAX_ENTRIES);

        set.remove(0);
        assert!(set.insert(record("DB", "extra", "u")).is_ok());
    }
}
