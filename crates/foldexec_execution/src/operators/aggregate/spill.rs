//! Hybrid hash aggregation: partition-on-overflow with recursive reload.
//!
//! When a group hash table reaches its in-memory entry cap, every resident
//! entry is serialized into one of a fixed set of batch files selected by
//! `hashkey mod num_files`, and the table restarts empty. After input is
//! exhausted the batches are read back one file at a time; records rebuild
//! table entries (or combine into entries rebuilt earlier from the same
//! file), and a file whose records no longer fit promotes a child partition
//! set with one more file than its parent, bounding the recursion.
//!
//! Record format: `u32 hashkey`, `u64 total_size`, then `total_size` bytes of
//! payload holding the representative tuple, one flags byte per transition,
//! and the encoded transition values. Internal transition states cross the
//! disk boundary through their serialize/deserialize functions.

use foldexec_datum::codec;
use foldexec_datum::datatype::DataType;
use foldexec_datum::hash::partition_for_hash;
use foldexec_datum::row::Row;
use foldexec_error::{FoldexecError, Result};
use foldexec_io::BufFile;
use tracing::debug;

use crate::memory::MemoryArena;

use super::finalize::serialize_trans_value;
use super::hash_table::{GroupEntry, GroupHashTable, Lookup};
use super::state::{PerGroup, PerGroupArray, PerTrans, TransValue};
use super::transition::{advance_combine, deserialize_incoming};
use crate::functions::AggValue;

const FLAG_VALUE_IS_NULL: u8 = 1;
const FLAG_NO_TRANS_VALUE: u8 = 2;

/// Whether a table may spill: every transition needs a combine function, and
/// internal transition states additionally need a serialize/deserialize
/// pair. A table failing this stays memory-only.
pub fn hybrid_allowed(pertrans: &[PerTrans]) -> bool {
    pertrans.iter().all(|pt| {
        pt.combine_fn.is_some()
            && (pt.trans_type != DataType::Internal
                || (pt.serial_fn.is_some() && pt.deserial_fn.is_some()))
    })
}

/// Maximum in-memory entry count for a memory budget.
pub fn max_in_memory_entries(work_mem_bytes: usize, entry_size: usize) -> usize {
    (work_mem_bytes / entry_size.max(1)).max(1)
}

/// Rough per-entry footprint used for sizing.
pub fn estimate_entry_size(num_key_cols: usize, num_trans: usize) -> usize {
    64 + num_key_cols * 24 + num_trans * 48
}

/// Running totals for one table's spill activity.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpillStats {
    pub tuples_spilled: u64,
    pub batches_created: u64,
    pub max_level: u32,
}

/// One partitioning level.
#[derive(Debug)]
pub struct SpillSet {
    pub files: Vec<SpillFile>,
    pub num_files: usize,
    pub level: u32,
}

/// One batch file within a partitioning level.
#[derive(Debug)]
pub struct SpillFile {
    file: BufFile,
    pub ntups_written: u64,
    pub ntups_read: u64,
    pub spilled: bool,
    /// Created when this batch itself overflowed during reload.
    pub child: Option<Box<SpillSet>>,
}

impl SpillSet {
    pub fn new(num_files: usize, level: u32) -> Result<Self> {
        let mut files = Vec::with_capacity(num_files);
        for idx in 0..num_files {
            files.push(SpillFile {
                file: BufFile::create_temp(&format!("aggspill-l{level}-f{idx}"))?,
                ntups_written: 0,
                ntups_read: 0,
                spilled: false,
                child: None,
            });
        }
        Ok(SpillSet {
            files,
            num_files,
            level,
        })
    }

    /// Route one encoded entry to its batch file.
    pub fn spill_record(&mut self, hashkey: u32, payload: &[u8]) -> Result<()> {
        let file = &mut self.files[partition_for_hash(hashkey as u64, self.num_files)];
        file.file.write_bytes(&hashkey.to_le_bytes())?;
        file.file.write_bytes(&(payload.len() as u64).to_le_bytes())?;
        file.file.write_bytes(payload)?;
        file.ntups_written += 1;
        file.spilled = true;
        Ok(())
    }
}

fn read_spill_record(file: &mut BufFile) -> Result<Option<(u32, Vec<u8>)>> {
    let mut hashkey = [0u8; 4];
    if !file.try_read_exact(&mut hashkey)? {
        return Ok(None);
    }
    let mut total_size = [0u8; 8];
    file.read_exact(&mut total_size)?;
    let total_size = u64::from_le_bytes(total_size) as usize;
    let mut payload = vec![0u8; total_size];
    file.read_exact(&mut payload)?;
    Ok(Some((u32::from_le_bytes(hashkey), payload)))
}

/// Serialize one table entry into a spill payload.
pub fn encode_spill_entry(
    entry: &GroupEntry,
    pertrans: &mut [PerTrans],
    set_arena: &MemoryArena,
    tmp_arena: &MemoryArena,
    buf: &mut Vec<u8>,
) -> Result<()> {
    codec::encode_row(&entry.representative, buf);
    for (transno, pergroup) in entry.pergroup.iter().enumerate() {
        let mut flags = 0u8;
        if pergroup.trans_value_is_null {
            flags |= FLAG_VALUE_IS_NULL;
        }
        if pergroup.no_trans_value {
            flags |= FLAG_NO_TRANS_VALUE;
        }
        buf.push(flags);

        if !pergroup.trans_value_is_null {
            let datum =
                serialize_trans_value(&mut pertrans[transno], pergroup, set_arena, tmp_arena)?;
            codec::encode_datum(&datum, buf);
        }
    }
    Ok(())
}

fn decode_spill_row(payload: &[u8]) -> Result<(Row, usize)> {
    let mut input = payload;
    let row = codec::decode_row(&mut input)?;
    Ok((row, payload.len() - input.len()))
}

fn decode_spill_states(
    mut input: &[u8],
    pertrans: &mut [PerTrans],
    set_arena: &MemoryArena,
    tmp_arena: &MemoryArena,
) -> Result<PerGroupArray> {
    let mut pergroup = PerGroupArray::with_capacity(pertrans.len());
    for pt in pertrans.iter_mut() {
        if input.is_empty() {
            return Err(FoldexecError::new("truncated spill record"));
        }
        let flags = input[0];
        input = &input[1..];

        if flags & FLAG_VALUE_IS_NULL != 0 {
            pergroup.push(PerGroup {
                trans_value: TransValue::Empty,
                trans_value_is_null: true,
                no_trans_value: flags & FLAG_NO_TRANS_VALUE != 0,
            });
            continue;
        }

        let datum = codec::decode_datum(&mut input)?;
        let value = if pt.trans_type == DataType::Internal {
            let (value, is_null) =
                deserialize_incoming(pt, set_arena, tmp_arena, AggValue::Datum(datum), false)?;
            if is_null {
                return Err(FoldexecError::new(
                    "deserialization of a spilled transition state returned null",
                ));
            }
            value
        } else {
            AggValue::Datum(datum)
        };
        pergroup.push(PerGroup {
            trans_value: TransValue::adopt(value, pt.trans_type_by_val, set_arena.scope()),
            trans_value_is_null: false,
            no_trans_value: false,
        });
    }
    if !input.is_empty() {
        return Err(FoldexecError::new("trailing bytes in spill record"));
    }
    Ok(pergroup)
}

/// Write every resident entry out to the spill set and restart the table
/// empty.
pub fn spill_table(
    table: &mut GroupHashTable,
    spill: &mut SpillSet,
    pertrans: &mut [PerTrans],
    set_arena: &MemoryArena,
    tmp_arena: &MemoryArena,
    stats: &mut SpillStats,
) -> Result<()> {
    let groups = table.take_groups();
    let count = groups.len();
    let mut buf = Vec::new();
    for entry in groups {
        buf.clear();
        encode_spill_entry(&entry, pertrans, set_arena, tmp_arena, &mut buf)?;
        spill.spill_record(entry.hash as u32, &buf)?;
    }
    stats.tuples_spilled += count as u64;
    debug!(
        count,
        level = spill.level,
        num_files = spill.num_files,
        "spilled hash table to batch files"
    );
    Ok(())
}

/// Depth-first reader over a spill tree.
#[derive(Debug)]
pub struct SpillReader {
    stack: Vec<ReadFrame>,
    pub stats: SpillStats,
}

#[derive(Debug)]
struct ReadFrame {
    set: SpillSet,
    next_file: usize,
}

impl SpillReader {
    pub fn new(root: SpillSet, stats: SpillStats) -> Self {
        SpillReader {
            stack: vec![ReadFrame {
                set: root,
                next_file: 0,
            }],
            stats,
        }
    }

    /// Reload the next batch file into the table.
    ///
    /// On return the table holds every group of that batch that fit; the
    /// caller drains it before the next call. Returns false once the whole
    /// spill tree is exhausted.
    pub fn reload_next_file(
        &mut self,
        table: &mut GroupHashTable,
        pertrans: &mut [PerTrans],
        set_arena: &MemoryArena,
        tmp_arena: &MemoryArena,
    ) -> Result<bool> {
        loop {
            let frame = match self.stack.last_mut() {
                Some(frame) => frame,
                None => return Ok(false),
            };
            if frame.next_file >= frame.set.files.len() {
                self.stack.pop();
                continue;
            }

            let file_idx = frame.next_file;
            frame.next_file += 1;

            let parent_num_files = frame.set.num_files;
            let parent_level = frame.set.level;
            let file = &mut frame.set.files[file_idx];

            reload_file(
                file,
                parent_num_files,
                parent_level,
                table,
                pertrans,
                set_arena,
                tmp_arena,
                &mut self.stats,
            )?;

            // Batches written while this file reloaded are read next,
            // before any sibling.
            if let Some(child) = file.child.take() {
                self.stats.max_level = self.stats.max_level.max(child.level);
                self.stack.push(ReadFrame {
                    set: *child,
                    next_file: 0,
                });
            }
            return Ok(true);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn reload_file(
    file: &mut SpillFile,
    parent_num_files: usize,
    parent_level: u32,
    table: &mut GroupHashTable,
    pertrans: &mut [PerTrans],
    set_arena: &MemoryArena,
    tmp_arena: &MemoryArena,
    stats: &mut SpillStats,
) -> Result<()> {
    file.file.rewind()?;
    let mut nread = 0u64;

    while let Some((hashkey, payload)) = read_spill_record(&mut file.file)? {
        nread += 1;
        let hash = hashkey as u64;
        let (rep, consumed) = decode_spill_row(&payload)?;

        if let Some(idx) = table.find(hash, &rep) {
            // A second record for a group already rebuilt from this batch;
            // merge the incoming states into the resident entry.
            let incoming =
                decode_spill_states(&payload[consumed..], pertrans, set_arena, tmp_arena)?;
            for (transno, mut inc) in incoming.into_iter().enumerate() {
                let is_null = inc.trans_value_is_null;
                let value = inc.trans_value.take_agg_value();
                let group = table.group_mut(idx);
                advance_combine(
                    &mut pertrans[transno],
                    &mut group.pergroup[transno],
                    set_arena,
                    tmp_arena,
                    value,
                    is_null,
                    false,
                )?;
            }
            continue;
        }

        let incoming = decode_spill_states(&payload[consumed..], pertrans, set_arena, tmp_arena)?;
        match table.insert_new(hash, rep, incoming)? {
            Lookup::Inserted(_) | Lookup::Found(_) => {}
            Lookup::Full => {
                // This batch no longer fits; push the record down one level.
                if file.child.is_none() {
                    let child = SpillSet::new(parent_num_files + 1, parent_level + 1)?;
                    stats.batches_created += child.num_files as u64;
                    file.child = Some(Box::new(child));
                }
                match &mut file.child {
                    Some(child) => {
                        child.spill_record(hashkey, &payload)?;
                        stats.tuples_spilled += 1;
                    }
                    None => {
                        return Err(FoldexecError::new("spill child partition set missing"));
                    }
                }
            }
        }
    }

    file.ntups_read = nread;
    if file.ntups_read != file.ntups_written {
        return Err(FoldexecError::new(format!(
            "spill batch corrupted: wrote {} tuples but read {}",
            file.ntups_written, file.ntups_read
        )));
    }

    debug!(
        tuples = nread,
        level = parent_level,
        respilled = file.child.is_some(),
        "reloaded spill batch"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use foldexec_datum::datum::Datum;
    use foldexec_datum::hash::hash_datum;

    use super::*;
    use crate::expr::PhysicalColumnExpr;
    use crate::functions::aggregate::{AccessPolicy, BUILTIN_AGGREGATES};
    use crate::operators::aggregate::plan::{AggCallExpr, AggPlan, OutputColumn};
    use crate::operators::aggregate::state::{build_aggregates, initial_pergroup_array};
    use crate::operators::aggregate::transition::advance_transition;

    fn sum_pertrans() -> Vec<PerTrans> {
        let plan = AggPlan::plain(
            vec![AggCallExpr::new(
                "sum_i64",
                vec![Arc::new(PhysicalColumnExpr::new(0))],
            )],
            vec![OutputColumn::AggregateResult(0)],
        );
        build_aggregates(&plan, &BUILTIN_AGGREGATES, &AccessPolicy::allow_all(), 1)
            .unwrap()
            .pertrans
    }

    fn insert_group(
        table: &mut GroupHashTable,
        pertrans: &mut [PerTrans],
        set_arena: &MemoryArena,
        tmp_arena: &MemoryArena,
        k: i64,
        v: i64,
    ) -> Lookup {
        let key = Row::from_iter([Datum::Int64(k)]);
        let hash = hash_datum(&Datum::Int64(k));
        let lookup = table
            .lookup_or_insert(hash, &key, || {
                Ok((key.clone(), initial_pergroup_array(pertrans, set_arena)))
            })
            .unwrap();
        let idx = match lookup {
            Lookup::Found(idx) | Lookup::Inserted(idx) => idx,
            Lookup::Full => return Lookup::Full,
        };
        let group = table.group_mut(idx);
        advance_transition(
            &mut pertrans[0],
            &mut group.pergroup[0],
            set_arena,
            tmp_arena,
            &[Datum::Int64(v)],
        )
        .unwrap();
        lookup
    }

    #[test]
    fn hybrid_eligibility() {
        let pertrans = sum_pertrans();
        assert!(hybrid_allowed(&pertrans));
    }

    #[test]
    fn spill_round_trip_preserves_sums() {
        let mut pertrans = sum_pertrans();
        let set_arena = MemoryArena::new_root("hash");
        let tmp_arena = MemoryArena::new_root("tmp");
        let mut stats = SpillStats::default();

        // Cap of 4 resident groups; 16 distinct keys, two inputs each.
        let mut table = GroupHashTable::new(16, 1, 4);
        let mut spill = SpillSet::new(3, 0).unwrap();

        for round in 0..2 {
            for k in 0..16 {
                if let Lookup::Full =
                    insert_group(&mut table, &mut pertrans, &set_arena, &tmp_arena, k, k + round)
                {
                    spill_table(
                        &mut table,
                        &mut spill,
                        &mut pertrans,
                        &set_arena,
                        &tmp_arena,
                        &mut stats,
                    )
                    .unwrap();
                    insert_group(&mut table, &mut pertrans, &set_arena, &tmp_arena, k, k + round);
                }
            }
        }
        // Flush the residual table so reload sees every group on disk.
        spill_table(
            &mut table,
            &mut spill,
            &mut pertrans,
            &set_arena,
            &tmp_arena,
            &mut stats,
        )
        .unwrap();

        // Reload with a cap that fits everything, summing per key.
        let mut reload_table = GroupHashTable::new(64, 1, usize::MAX);
        let mut reader = SpillReader::new(spill, stats);
        let mut results = std::collections::BTreeMap::new();
        while reader
            .reload_next_file(&mut reload_table, &mut pertrans, &set_arena, &tmp_arena)
            .unwrap()
        {
            for group in reload_table.take_groups() {
                let k = group.representative.columns[0].try_as_i64().unwrap();
                let sum = match &group.pergroup[0].trans_value {
                    TransValue::ByVal(Datum::Int64(v)) => *v,
                    other => panic!("unexpected trans value: {other:?}"),
                };
                assert!(results.insert(k, sum).is_none(), "key {k} emitted twice");
            }
        }

        // Each key saw k and k+1.
        assert_eq!(16, results.len());
        for k in 0..16 {
            assert_eq!(2 * k + 1, results[&k]);
        }
    }

    #[test]
    fn overflow_during_reload_promotes_a_child() {
        let mut pertrans = sum_pertrans();
        let set_arena = MemoryArena::new_root("hash");
        let tmp_arena = MemoryArena::new_root("tmp");
        let mut stats = SpillStats::default();

        // Everything lands in one file, and the reload table only holds two
        // groups, so reloading must recurse.
        let mut table = GroupHashTable::new(16, 1, usize::MAX);
        let mut spill = SpillSet::new(1, 0).unwrap();

        for k in 0..8 {
            insert_group(&mut table, &mut pertrans, &set_arena, &tmp_arena, k, k);
        }
        spill_table(
            &mut table,
            &mut spill,
            &mut pertrans,
            &set_arena,
            &tmp_arena,
            &mut stats,
        )
        .unwrap();

        let mut reload_table = GroupHashTable::new(4, 1, 2);
        let mut reader = SpillReader::new(spill, stats);
        let mut seen = std::collections::BTreeSet::new();
        while reader
            .reload_next_file(&mut reload_table, &mut pertrans, &set_arena, &tmp_arena)
            .unwrap()
        {
            for group in reload_table.take_groups() {
                let k = group.representative.columns[0].try_as_i64().unwrap();
                assert!(seen.insert(k), "key {k} emitted twice");
            }
        }

        assert_eq!((0..8).collect::<std::collections::BTreeSet<_>>(), seen);
        assert!(reader.stats.max_level >= 1);
    }
}
