//! Group hash table.
//!
//! Open addressed with linear probing. Entries pair the full key hash with a
//! group index; the hash is compared before the representative row so most
//! probe steps never touch group storage. The table doubles while under the
//! load factor until the in-memory group cap is reached, after which inserts
//! report `Full` and the spill engine takes over.

use foldexec_datum::datum::group_eq;
use foldexec_datum::row::Row;
use foldexec_error::{FoldexecError, Result};

use super::state::PerGroupArray;

const LOAD_FACTOR: f64 = 0.75;

#[derive(Debug, Clone, Copy, Default)]
struct TableEntry {
    hash: u64,
    group_idx: u32,
    occupied: bool,
}

/// One resident group: its representative key tuple and the per-transition
/// working states.
#[derive(Debug)]
pub struct GroupEntry {
    pub hash: u64,
    pub representative: Row,
    pub pergroup: PerGroupArray,
}

/// Result of a lookup-or-insert.
#[derive(Debug, PartialEq, Eq)]
pub enum Lookup {
    /// Existing group.
    Found(usize),
    /// Newly created group.
    Inserted(usize),
    /// Table is at its in-memory cap and the key is not resident.
    Full,
}

#[derive(Debug)]
pub struct GroupHashTable {
    entries: Vec<TableEntry>,
    groups: Vec<GroupEntry>,
    /// Leading columns of the representative rows that form the key.
    num_key_cols: usize,
    /// Maximum resident group count before inserts report Full.
    max_groups: usize,
}

impl GroupHashTable {
    pub fn new(init_capacity: usize, num_key_cols: usize, max_groups: usize) -> Self {
        let capacity = init_capacity.next_power_of_two().max(16);
        GroupHashTable {
            entries: vec![TableEntry::default(); capacity],
            groups: Vec::new(),
            num_key_cols,
            max_groups,
        }
    }

    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn num_key_cols(&self) -> usize {
        self.num_key_cols
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Probe for the group keyed by the first `num_key_cols` columns of
    /// `key_row` under `hash`. Creates the group with `make_entry` on a miss
    /// while under the cap.
    pub fn lookup_or_insert(
        &mut self,
        hash: u64,
        key_row: &Row,
        make_entry: impl FnOnce() -> Result<(Row, PerGroupArray)>,
    ) -> Result<Lookup> {
        self.resize_if_needed()?;

        let cap = self.entries.len();
        let mut offset = (hash as usize) % cap;
        let mut iter_count = 0;

        loop {
            let entry = self.entries[offset];

            if !entry.occupied {
                if self.groups.len() >= self.max_groups {
                    return Ok(Lookup::Full);
                }

                let (representative, pergroup) = make_entry()?;
                let group_idx = self.groups.len();
                self.groups.push(GroupEntry {
                    hash,
                    representative,
                    pergroup,
                });
                self.entries[offset] = TableEntry {
                    hash,
                    group_idx: group_idx as u32,
                    occupied: true,
                };
                return Ok(Lookup::Inserted(group_idx));
            }

            if entry.hash == hash {
                let group = &self.groups[entry.group_idx as usize];
                if self.keys_equal(&group.representative, key_row) {
                    return Ok(Lookup::Found(entry.group_idx as usize));
                }
            }

            offset = (offset + 1) % cap;
            iter_count += 1;
            if iter_count > cap {
                // Resizing keeps the table under the load factor, so a full
                // wrap means bookkeeping is broken.
                return Err(FoldexecError::new("group hash table completely full"));
            }
        }
    }

    /// Probe without inserting.
    pub fn find(&self, hash: u64, key_row: &Row) -> Option<usize> {
        let cap = self.entries.len();
        let mut offset = (hash as usize) % cap;
        let mut iter_count = 0;

        loop {
            let entry = self.entries[offset];
            if !entry.occupied {
                return None;
            }
            if entry.hash == hash {
                let group = &self.groups[entry.group_idx as usize];
                if self.keys_equal(&group.representative, key_row) {
                    return Some(entry.group_idx as usize);
                }
            }
            offset = (offset + 1) % cap;
            iter_count += 1;
            if iter_count > cap {
                return None;
            }
        }
    }

    /// Insert a group known to be absent. Reports `Full` at the cap.
    pub fn insert_new(
        &mut self,
        hash: u64,
        representative: Row,
        pergroup: PerGroupArray,
    ) -> Result<Lookup> {
        if self.groups.len() >= self.max_groups {
            return Ok(Lookup::Full);
        }
        self.resize_if_needed()?;

        let cap = self.entries.len();
        let mut offset = (hash as usize) % cap;
        while self.entries[offset].occupied {
            offset = (offset + 1) % cap;
        }

        let group_idx = self.groups.len();
        self.groups.push(GroupEntry {
            hash,
            representative,
            pergroup,
        });
        self.entries[offset] = TableEntry {
            hash,
            group_idx: group_idx as u32,
            occupied: true,
        };
        Ok(Lookup::Inserted(group_idx))
    }

    fn keys_equal(&self, a: &Row, b: &Row) -> bool {
        (0..self.num_key_cols).all(|idx| {
            let left = &a.columns[idx];
            let right = &b.columns[idx];
            group_eq(left, right)
        })
    }

    pub fn group(&self, idx: usize) -> &GroupEntry {
        &self.groups[idx]
    }

    pub fn group_mut(&mut self, idx: usize) -> &mut GroupEntry {
        &mut self.groups[idx]
    }

    pub fn groups_mut(&mut self) -> &mut [GroupEntry] {
        &mut self.groups
    }

    /// Remove and return every resident group, leaving an empty table with
    /// its bucket array intact.
    pub fn take_groups(&mut self) -> Vec<GroupEntry> {
        for entry in self.entries.iter_mut() {
            *entry = TableEntry::default();
        }
        std::mem::take(&mut self.groups)
    }

    /// Wipe the table completely.
    pub fn reset(&mut self) {
        self.take_groups();
    }

    fn resize_if_needed(&mut self) -> Result<()> {
        let possible = self.groups.len() + 1;
        let mut new_capacity = self.entries.len();
        while (possible as f64) / (new_capacity as f64) >= LOAD_FACTOR {
            new_capacity *= 2;
        }
        if new_capacity == self.entries.len() {
            return Ok(());
        }

        let mut new_entries = vec![TableEntry::default(); new_capacity];
        for entry in self.entries.drain(..) {
            if !entry.occupied {
                continue;
            }
            let mut offset = (entry.hash as usize) % new_capacity;
            while new_entries[offset].occupied {
                offset = (offset + 1) % new_capacity;
            }
            new_entries[offset] = entry;
        }
        self.entries = new_entries;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use foldexec_datum::datum::Datum;
    use smallvec::SmallVec;

    use super::*;

    fn key(v: i64) -> Row {
        Row::from_iter([Datum::Int64(v)])
    }

    fn make(v: i64) -> impl FnOnce() -> Result<(Row, PerGroupArray)> {
        move || Ok((key(v), SmallVec::new()))
    }

    #[test]
    fn insert_then_find() {
        let mut table = GroupHashTable::new(16, 1, usize::MAX);

        assert_eq!(
            Lookup::Inserted(0),
            table.lookup_or_insert(4, &key(10), make(10)).unwrap()
        );
        assert_eq!(
            Lookup::Found(0),
            table.lookup_or_insert(4, &key(10), make(10)).unwrap()
        );
        assert_eq!(1, table.num_groups());
    }

    #[test]
    fn hash_collisions_stay_distinct() {
        let mut table = GroupHashTable::new(16, 1, usize::MAX);

        // Same hash, different keys.
        assert_eq!(
            Lookup::Inserted(0),
            table.lookup_or_insert(4, &key(1), make(1)).unwrap()
        );
        assert_eq!(
            Lookup::Inserted(1),
            table.lookup_or_insert(4, &key(2), make(2)).unwrap()
        );
        assert_eq!(
            Lookup::Found(0),
            table.lookup_or_insert(4, &key(1), make(1)).unwrap()
        );
        assert_eq!(2, table.num_groups());
    }

    #[test]
    fn resize_preserves_groups() {
        // All hashes collide and the group count crosses several doublings.
        let mut table = GroupHashTable::new(16, 1, usize::MAX);
        for v in 0..33 {
            table.lookup_or_insert(44, &key(v), make(v)).unwrap();
        }
        assert_eq!(33, table.num_groups());
        for v in 0..33 {
            assert_eq!(
                Lookup::Found(v as usize),
                table.lookup_or_insert(44, &key(v), make(v)).unwrap()
            );
        }
    }

    #[test]
    fn cap_reports_full_for_new_keys_only() {
        let mut table = GroupHashTable::new(16, 1, 2);
        table.lookup_or_insert(1, &key(1), make(1)).unwrap();
        table.lookup_or_insert(2, &key(2), make(2)).unwrap();

        assert_eq!(
            Lookup::Full,
            table.lookup_or_insert(3, &key(3), make(3)).unwrap()
        );
        // Resident keys still hit.
        assert_eq!(
            Lookup::Found(1),
            table.lookup_or_insert(2, &key(2), make(2)).unwrap()
        );
    }

    #[test]
    fn null_keys_group_together() {
        let mut table = GroupHashTable::new(16, 1, usize::MAX);
        let null_key = Row::from_iter([Datum::Null]);

        let first = table
            .lookup_or_insert(7, &null_key, || Ok((null_key.clone(), SmallVec::new())))
            .unwrap();
        let second = table
            .lookup_or_insert(7, &null_key, || Ok((null_key.clone(), SmallVec::new())))
            .unwrap();

        assert_eq!(Lookup::Inserted(0), first);
        assert_eq!(Lookup::Found(0), second);
    }

    #[test]
    fn take_groups_empties_the_table() {
        let mut table = GroupHashTable::new(16, 1, usize::MAX);
        table.lookup_or_insert(1, &key(1), make(1)).unwrap();
        table.lookup_or_insert(2, &key(2), make(2)).unwrap();

        let groups = table.take_groups();
        assert_eq!(2, groups.len());
        assert_eq!(0, table.num_groups());
        assert_eq!(
            Lookup::Inserted(0),
            table.lookup_or_insert(1, &key(1), make(1)).unwrap()
        );
    }
}
