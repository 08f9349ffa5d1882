//! The aggregate execution operator.
//!
//! Consumes a stream of input tuples and produces one output tuple per
//! distinct group per grouping set. Sorted phases detect group boundaries in
//! pre-ordered input; hashed grouping sets build group tables (spilling to
//! disk when past the memory budget); mixed plans populate the hash tables
//! while the sorted phases run and drain them last. An optional
//! redistribution exchange repartitions rows across parallel workers before
//! any of that happens.

pub mod finalize;
pub mod hash_table;
pub mod ordered;
pub mod phase;
pub mod plan;
pub mod redistribute;
pub mod spill;
pub mod state;
pub mod transition;

use std::collections::VecDeque;

use foldexec_datum::datum::Datum;
use foldexec_datum::hash::hash_datums;
use foldexec_datum::row::Row;
use foldexec_error::{FoldexecError, OptionExt, Result};
use tracing::debug;

use crate::config::{ExecutionConfig, InterruptFlag};
use crate::explain::{Explainable, ExplainEntry};
use crate::expr::{evaluate_filter, PhysicalExprRef};
use crate::functions::aggregate::{AccessPolicy, AggregateCatalog};
use crate::functions::AggValue;
use crate::memory::MemoryArena;
use crate::sort::TupleSorter;

use self::finalize::finalize_aggregate;
use self::hash_table::{GroupHashTable, Lookup};
use self::ordered::process_ordered;
use self::phase::{sets_to_finalize, PerPhase, PhaseScheduler};
use self::plan::{AggPlan, AggSplit, AggStrategy, OutputColumn};
use self::redistribute::{Redistributor, RouteOutcome};
use self::spill::{
    estimate_entry_size, hybrid_allowed, max_in_memory_entries, spill_table, SpillReader,
    SpillSet, SpillStats,
};
use self::state::{
    build_aggregates, initial_pergroup_array, PerAgg, PerGroup, PerTrans,
};
use self::transition::{
    advance_combine, advance_transition, eval_combined_input, filter_passes, push_sort_input,
};

use super::TupleSource;

/// One hashed grouping set's runtime state.
#[derive(Debug)]
struct PerHash {
    /// Input column indices forming the key, in key order.
    key_cols: Vec<usize>,
    /// For each global grouping column, its position in the key, if present.
    global_to_key: Vec<Option<usize>>,
    table: GroupHashTable,
    hybrid: bool,
    spill: Option<SpillSet>,
    reader: Option<SpillReader>,
    stats: SpillStats,
}

#[derive(Debug, Default, Clone, Copy)]
struct OperatorStats {
    input_rows: u64,
    output_rows: u64,
    having_skipped: u64,
}

/// The operator itself. Each `next` call returns one output row.
#[derive(Debug)]
pub struct AggregateOperator {
    child: Box<dyn TupleSource>,

    strategy: AggStrategy,
    split: AggSplit,
    group_cols: Vec<usize>,
    output: Vec<OutputColumn>,
    having: Option<PhysicalExprRef>,
    hybrid_capable: bool,

    pertrans: Vec<PerTrans>,
    peraggs: Vec<PerAgg>,
    call_to_aggno: Vec<usize>,
    combined_exprs: Vec<PhysicalExprRef>,

    scheduler: PhaseScheduler,
    perhash: Vec<PerHash>,

    // Arena tree. Resetting the root cascades everywhere.
    root_arena: MemoryArena,
    tmp_arena: MemoryArena,
    aggcontexts: Vec<MemoryArena>,
    hashcontext: MemoryArena,
    output_arena: MemoryArena,

    // Sorted-phase state. Group states are indexed setno * numtrans +
    // transno for the current phase's grouping sets.
    pergroup_sorted: Vec<PerGroup>,
    current_group_row: Option<Row>,
    group_started: bool,

    input_sorter: Option<TupleSorter>,
    output_sorter: Option<TupleSorter>,

    // Hash phase state.
    hash_input_done: bool,
    drain_hash_idx: usize,
    drain_group_idx: usize,

    redist: Option<(Redistributor, usize)>,
    redist_consuming: bool,

    trans_scratch: Vec<Datum>,
    out_queue: VecDeque<Row>,
    config: ExecutionConfig,
    interrupts: InterruptFlag,
    stats: OperatorStats,
    done: bool,
}

impl AggregateOperator {
    pub fn try_new(
        plan: AggPlan,
        child: Box<dyn TupleSource>,
        catalog: &AggregateCatalog,
        policy: &AccessPolicy,
        config: ExecutionConfig,
    ) -> Result<Self> {
        plan.validate()?;

        let phases: Vec<PerPhase> = plan
            .sorted_phases
            .iter()
            .map(|p| PerPhase {
                group_cols: p.group_cols.clone(),
                set_prefixes: p.set_prefixes.clone(),
                input_sort: p.input_sort.clone(),
            })
            .collect();
        for (idx, phase) in phases.iter().enumerate() {
            if idx > 0 && phase.input_sort.is_none() {
                return Err(FoldexecError::new(
                    "chained sorted phase is missing its re-sort specification",
                ));
            }
        }

        let scheduler = PhaseScheduler::new(phases, !plan.hashed_sets.is_empty())?;
        let num_sets = scheduler.max_sets().max(1);

        let built = build_aggregates(&plan, catalog, policy, num_sets)?;
        let numtrans = built.pertrans.len();

        let root_arena = MemoryArena::new_root("agg_operator");
        let tmp_arena = root_arena.new_child("agg_tmp");
        let aggcontexts: Vec<_> = (0..num_sets)
            .map(|_| root_arena.new_child("aggcontext"))
            .collect();
        let hashcontext = root_arena.new_child("hashcontext");
        let output_arena = root_arena.new_child("agg_output");

        let hybrid = plan.hybrid_capable && hybrid_allowed(&built.pertrans);
        let perhash = plan
            .hashed_sets
            .iter()
            .map(|set| {
                let entry_size = estimate_entry_size(set.key_cols.len(), numtrans);
                let max_groups = if hybrid {
                    max_in_memory_entries(config.work_mem_bytes, entry_size)
                } else {
                    usize::MAX
                };
                let global_to_key = plan
                    .group_cols
                    .iter()
                    .map(|col| set.key_cols.iter().position(|k| k == col))
                    .collect();
                PerHash {
                    key_cols: set.key_cols.clone(),
                    global_to_key,
                    table: GroupHashTable::new(
                        config.hash_table_init_capacity,
                        set.key_cols.len(),
                        max_groups,
                    ),
                    hybrid,
                    spill: None,
                    reader: None,
                    stats: SpillStats::default(),
                }
            })
            .collect();

        let mut operator = AggregateOperator {
            child,
            strategy: plan.strategy,
            split: plan.split,
            group_cols: plan.group_cols,
            output: plan.output,
            having: plan.having,
            hybrid_capable: hybrid,
            pertrans: built.pertrans,
            peraggs: built.peraggs,
            call_to_aggno: built.call_to_aggno,
            combined_exprs: built.combined_exprs,
            scheduler,
            perhash,
            root_arena,
            tmp_arena,
            aggcontexts,
            hashcontext,
            output_arena,
            pergroup_sorted: Vec::new(),
            current_group_row: None,
            group_started: false,
            input_sorter: None,
            output_sorter: None,
            hash_input_done: false,
            drain_hash_idx: 0,
            drain_group_idx: 0,
            redist: None,
            redist_consuming: false,
            trans_scratch: Vec::new(),
            out_queue: VecDeque::new(),
            config,
            interrupts: InterruptFlag::new(),
            stats: OperatorStats::default(),
            done: false,
        };
        operator.prepare_output_sorter()?;
        Ok(operator)
    }

    /// Attach a redistribution exchange: rows whose grouping value hashes to
    /// another worker are shipped there, and rows shipped here are consumed
    /// as if read from the child.
    pub fn with_redistribution(mut self, redist: Redistributor, key_col: usize) -> Result<Self> {
        if self.strategy != AggStrategy::Hashed {
            return Err(FoldexecError::new(
                "redistribution requires a hash-only aggregation",
            ));
        }
        self.redist = Some((redist, key_col));
        Ok(self)
    }

    pub fn interrupt_flag(&self) -> InterruptFlag {
        self.interrupts.clone()
    }

    /// Produce the next output row, or None at end of output.
    pub fn next(&mut self) -> Result<Option<Row>> {
        loop {
            if let Some(row) = self.out_queue.pop_front() {
                self.stats.output_rows += 1;
                self.output_arena.reset();
                return Ok(Some(row));
            }
            if self.done {
                return Ok(None);
            }
            self.interrupts.check()?;

            if self.scheduler.in_hash_phase() {
                if !self.hash_input_done {
                    self.fill_hash_tables()?;
                    self.finish_hash_input()?;
                }
                self.drain_hash_step()?;
            } else {
                self.sorted_step()?;
            }
        }
    }

    /// Restart the operator with unchanged parameters.
    pub fn rescan(&mut self) -> Result<()> {
        self.out_queue.clear();
        self.stats = OperatorStats::default();

        // A purely hashed plan whose tables are complete in memory can be
        // re-read without touching the child.
        let tables_reusable = self.strategy == AggStrategy::Hashed
            && self.hash_input_done
            && self.redist.is_none()
            && self
                .perhash
                .iter()
                .all(|ph| ph.stats.tuples_spilled == 0 && ph.reader.is_none());
        if tables_reusable {
            self.drain_hash_idx = 0;
            self.drain_group_idx = 0;
            self.done = false;
            return Ok(());
        }

        self.child.rescan()?;
        // Fires registered shutdown callbacks and invalidates every scope.
        self.root_arena.reset();

        for ph in self.perhash.iter_mut() {
            ph.table.reset();
            ph.spill = None;
            ph.reader = None;
            ph.stats = SpillStats::default();
        }
        for pt in self.pertrans.iter_mut() {
            for sorter in pt.sorters.iter_mut() {
                *sorter = None;
            }
        }

        self.scheduler.restart();
        self.pergroup_sorted.clear();
        self.current_group_row = None;
        self.group_started = false;
        self.input_sorter = None;
        self.output_sorter = None;
        self.hash_input_done = false;
        self.drain_hash_idx = 0;
        self.drain_group_idx = 0;
        self.redist_consuming = false;
        self.done = false;
        self.prepare_output_sorter()?;
        Ok(())
    }

    // Input plumbing.

    fn next_input_row(&mut self) -> Result<Option<Row>> {
        loop {
            self.interrupts.check()?;

            if self.redist_consuming {
                let (redist, _) = self
                    .redist
                    .as_mut()
                    .required("redistributor during consume phase")?;
                return redist.next_remote_row();
            }

            let row = match &mut self.input_sorter {
                Some(sorter) => sorter.get_tuple()?,
                None => self.child.next_tuple()?,
            };

            match row {
                Some(row) => match &mut self.redist {
                    Some((redist, key_col)) => {
                        let value = row.column(*key_col).cloned().unwrap_or(Datum::Null);
                        match redist.route_row(&row, &value)? {
                            RouteOutcome::Local => return Ok(Some(row)),
                            RouteOutcome::Shipped(Some(incoming)) => return Ok(Some(incoming)),
                            RouteOutcome::Shipped(None) => continue,
                        }
                    }
                    None => return Ok(Some(row)),
                },
                None => match &mut self.redist {
                    Some((redist, _)) => {
                        redist.finish_produce()?;
                        self.redist_consuming = true;
                        continue;
                    }
                    None => return Ok(None),
                },
            }
        }
    }

    // Sorted phases.

    fn sorted_step(&mut self) -> Result<()> {
        loop {
            let row = self.next_input_row()?;
            match row {
                None => {
                    self.end_of_sorted_input()?;
                    return Ok(());
                }
                Some(row) => {
                    self.stats.input_rows += 1;
                    self.consume_sorted_row(row)?;
                    if !self.out_queue.is_empty() {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn consume_sorted_row(&mut self, row: Row) -> Result<()> {
        if let Some(sorter) = &mut self.output_sorter {
            sorter.put_tuple(row.clone())?;
        }
        // The combined argument projection is evaluated once here; both the
        // hashed and sorted targets below read from the same slots.
        eval_combined_input(&self.combined_exprs, &row, &mut self.trans_scratch)?;

        // Mixed plans populate the hash tables during the first sorted pass.
        if !self.perhash.is_empty() && self.scheduler.current_index() == 1 {
            self.insert_into_hash_tables(&row)?;
        }

        if !self.group_started {
            self.start_sorted_groups(&row)?;
        } else {
            let phase = self
                .scheduler
                .current_sorted()
                .required("sorted phase while consuming rows")?;
            let prev = self
                .current_group_row
                .as_ref()
                .required("current group row inside a started group")?;
            if let Some(changed_at) = phase.first_changed_col(prev, &row) {
                let n = sets_to_finalize(&phase.set_prefixes, changed_at);
                self.finalize_sorted_sets(0..n)?;
                self.reset_sorted_sets(0..n)?;
                self.current_group_row = Some(row.clone());
            }
        }

        self.advance_sorted_row(&row)
    }

    fn start_sorted_groups(&mut self, row: &Row) -> Result<()> {
        let num_sets = self.current_num_sets()?;
        self.pergroup_sorted.clear();
        for setno in 0..num_sets {
            let arena = &self.aggcontexts[setno];
            self.pergroup_sorted
                .extend(initial_pergroup_array(&self.pertrans, arena));
        }
        self.current_group_row = Some(row.clone());
        self.group_started = true;
        Ok(())
    }

    fn current_num_sets(&self) -> Result<usize> {
        Ok(self
            .scheduler
            .current_sorted()
            .required("sorted phase")?
            .set_prefixes
            .len())
    }

    fn advance_sorted_row(&mut self, row: &Row) -> Result<()> {
        let num_sets = self.current_num_sets()?;
        let numtrans = self.pertrans.len();

        for transno in 0..numtrans {
            let pt = &mut self.pertrans[transno];
            if !filter_passes(pt, row)? {
                continue;
            }
            let args = &self.trans_scratch[pt.arg_offset..pt.arg_offset + pt.num_args];

            if pt.sort_spec.is_some() {
                for setno in 0..num_sets {
                    push_sort_input(pt, setno, args)?;
                }
            } else if self.split.combine {
                for setno in 0..num_sets {
                    let incoming = args[0].clone();
                    let is_null = incoming.is_null();
                    advance_combine(
                        pt,
                        &mut self.pergroup_sorted[setno * numtrans + transno],
                        &self.aggcontexts[setno],
                        &self.tmp_arena,
                        AggValue::Datum(incoming),
                        is_null,
                        true,
                    )?;
                }
            } else {
                for setno in 0..num_sets {
                    advance_transition(
                        pt,
                        &mut self.pergroup_sorted[setno * numtrans + transno],
                        &self.aggcontexts[setno],
                        &self.tmp_arena,
                        args,
                    )?;
                }
            }
        }

        self.tmp_arena.reset();
        Ok(())
    }

    fn end_of_sorted_input(&mut self) -> Result<()> {
        let num_sets = self.current_num_sets()?;

        if self.group_started {
            self.finalize_sorted_sets(0..num_sets)?;
        } else {
            // No input at all: grouping sets with no key columns still emit
            // their single group.
            let phase = self
                .scheduler
                .current_sorted()
                .required("sorted phase at end of input")?
                .clone();
            let empty_sets: Vec<_> = phase
                .set_prefixes
                .iter()
                .enumerate()
                .filter(|(_, &prefix)| prefix == 0)
                .map(|(setno, _)| setno)
                .collect();
            if !empty_sets.is_empty() {
                self.start_sorted_groups(&Row::empty())?;
                for setno in empty_sets {
                    self.finalize_one_sorted_set(setno)?;
                }
                self.group_started = false;
            }
        }

        self.advance_past_sorted_phase()
    }

    fn advance_past_sorted_phase(&mut self) -> Result<()> {
        self.group_started = false;
        self.current_group_row = None;
        self.pergroup_sorted.clear();
        for arena in &self.aggcontexts {
            arena.reset();
        }

        if self.scheduler.has_next_sorted() {
            let mut sorter = self
                .output_sorter
                .take()
                .required("re-sort feeding the next sorted phase")?;
            sorter.perform_sort()?;
            self.input_sorter = Some(sorter);
            self.scheduler.advance();
            self.prepare_output_sorter()?;
            return Ok(());
        }

        if self.scheduler.advance() {
            // Entered the hash phase (mixed plans): input was consumed during
            // the first sorted pass.
            self.input_sorter = None;
            self.output_sorter = None;
            self.finish_hash_input()?;
        } else {
            self.log_finished();
            self.done = true;
        }
        Ok(())
    }

    /// Allocate the sorter collecting input for the phase after the current
    /// one, when there is one.
    fn prepare_output_sorter(&mut self) -> Result<()> {
        if !self.scheduler.has_next_sorted() {
            self.output_sorter = None;
            return Ok(());
        }
        let next_idx = self.scheduler.current_index(); // 1-based; next phase is at this index
        let spec = self
            .scheduler
            .sorted_phase(next_idx)
            .and_then(|p| p.input_sort.clone())
            .required("sort specification for the next sorted phase")?;
        self.output_sorter = Some(TupleSorter::new(spec));
        Ok(())
    }

    fn finalize_sorted_sets(&mut self, sets: std::ops::Range<usize>) -> Result<()> {
        for setno in sets {
            self.finalize_one_sorted_set(setno)?;
        }
        Ok(())
    }

    fn finalize_one_sorted_set(&mut self, setno: usize) -> Result<()> {
        self.interrupts.check()?;
        let numtrans = self.pertrans.len();

        // Finish any deferred DISTINCT/ORDER BY sorts for this set.
        for transno in 0..numtrans {
            if self.pertrans[transno].sort_spec.is_some() {
                process_ordered(
                    &mut self.pertrans[transno],
                    setno,
                    &mut self.pergroup_sorted[setno * numtrans + transno],
                    &self.aggcontexts[setno],
                    &self.tmp_arena,
                )?;
            }
        }

        let rep = self.current_group_row.clone().unwrap_or_default();
        let phase = self
            .scheduler
            .current_sorted()
            .required("sorted phase during finalize")?;
        let prefix = phase.set_prefixes[setno];
        let set_cols: Vec<usize> = phase.group_cols[..prefix].to_vec();

        let mut agg_values = Vec::with_capacity(self.peraggs.len());
        for aggno in 0..self.peraggs.len() {
            let transno = self.peraggs[aggno].transno;
            let value = finalize_aggregate(
                &mut self.peraggs[aggno],
                &mut self.pertrans[transno],
                &self.pergroup_sorted[setno * numtrans + transno],
                &rep,
                &self.aggcontexts[setno],
                &self.tmp_arena,
                self.split.skip_final,
            )?;
            agg_values.push(value);
        }

        let group_cols = self.group_cols.clone();
        self.emit_output_row(&agg_values, move |pos| {
            let col = group_cols[pos];
            if set_cols.contains(&col) {
                Some(rep.column(col).cloned().unwrap_or(Datum::Null))
            } else {
                None
            }
        })
    }

    fn reset_sorted_sets(&mut self, sets: std::ops::Range<usize>) -> Result<()> {
        let numtrans = self.pertrans.len();
        for setno in sets {
            self.aggcontexts[setno].reset();
            for transno in 0..numtrans {
                self.pergroup_sorted[setno * numtrans + transno] =
                    self.pertrans[transno].initial_pergroup(&self.aggcontexts[setno]);
            }
        }
        Ok(())
    }

    // Hashed grouping.

    fn fill_hash_tables(&mut self) -> Result<()> {
        while let Some(row) = self.next_input_row()? {
            self.stats.input_rows += 1;
            eval_combined_input(&self.combined_exprs, &row, &mut self.trans_scratch)?;
            self.insert_into_hash_tables(&row)?;
            self.tmp_arena.reset();
        }
        Ok(())
    }

    /// Update every hashed set from the current row. The combined projection
    /// must already be evaluated into the scratch slots.
    fn insert_into_hash_tables(&mut self, row: &Row) -> Result<()> {
        let numtrans = self.pertrans.len();

        for hash_idx in 0..self.perhash.len() {
            let key_row = row.project(&self.perhash[hash_idx].key_cols);
            let hash = hash_datums(&key_row.columns);

            let group_idx = self.hash_lookup(hash_idx, hash, &key_row)?;

            for transno in 0..numtrans {
                let pt = &mut self.pertrans[transno];
                if !filter_passes(pt, row)? {
                    continue;
                }
                let args = &self.trans_scratch[pt.arg_offset..pt.arg_offset + pt.num_args];
                let group = self.perhash[hash_idx].table.group_mut(group_idx);

                if self.split.combine {
                    let incoming = args[0].clone();
                    let is_null = incoming.is_null();
                    advance_combine(
                        pt,
                        &mut group.pergroup[transno],
                        &self.hashcontext,
                        &self.tmp_arena,
                        AggValue::Datum(incoming),
                        is_null,
                        true,
                    )?;
                } else {
                    advance_transition(
                        pt,
                        &mut group.pergroup[transno],
                        &self.hashcontext,
                        &self.tmp_arena,
                        args,
                    )?;
                }
            }
        }
        Ok(())
    }

    fn hash_lookup(&mut self, hash_idx: usize, hash: u64, key_row: &Row) -> Result<usize> {
        let pertrans = &self.pertrans;
        let hashcontext = &self.hashcontext;

        let ph = &mut self.perhash[hash_idx];
        let lookup = ph.table.lookup_or_insert(hash, key_row, || {
            Ok((key_row.clone(), initial_pergroup_array(pertrans, hashcontext)))
        })?;
        match lookup {
            Lookup::Found(idx) | Lookup::Inserted(idx) => Ok(idx),
            Lookup::Full => {
                if !ph.hybrid {
                    return Err(FoldexecError::new(
                        "hash table exceeded its memory budget and cannot spill",
                    ));
                }
                // Overflow: push every resident entry out to batch files and
                // retry into the now-empty table.
                if ph.spill.is_none() {
                    ph.spill = Some(SpillSet::new(self.config.spill_partitions, 0)?);
                    ph.stats.batches_created += self.config.spill_partitions as u64;
                }
                let spill = match &mut ph.spill {
                    Some(spill) => spill,
                    None => return Err(FoldexecError::new("spill set allocation failed")),
                };
                spill_table(
                    &mut ph.table,
                    spill,
                    &mut self.pertrans,
                    &self.hashcontext,
                    &self.tmp_arena,
                    &mut ph.stats,
                )?;
                self.hashcontext.reset();

                let ph = &mut self.perhash[hash_idx];
                let pertrans = &self.pertrans;
                let hashcontext = &self.hashcontext;
                match ph.table.lookup_or_insert(hash, key_row, || {
                    Ok((key_row.clone(), initial_pergroup_array(pertrans, hashcontext)))
                })? {
                    Lookup::Found(idx) | Lookup::Inserted(idx) => Ok(idx),
                    Lookup::Full => Err(FoldexecError::new(
                        "hash table full immediately after spilling",
                    )),
                }
            }
        }
    }

    /// Input is exhausted; tables with spill sets flush their residual
    /// entries so the reload pass sees every group on disk.
    fn finish_hash_input(&mut self) -> Result<()> {
        for hash_idx in 0..self.perhash.len() {
            if self.perhash[hash_idx].spill.is_none() {
                continue;
            }
            let ph = &mut self.perhash[hash_idx];
            let spill = match &mut ph.spill {
                Some(spill) => spill,
                None => continue,
            };
            spill_table(
                &mut ph.table,
                spill,
                &mut self.pertrans,
                &self.hashcontext,
                &self.tmp_arena,
                &mut ph.stats,
            )?;
            self.hashcontext.reset();

            let ph = &mut self.perhash[hash_idx];
            let spill = ph.spill.take().required("spill set just flushed")?;
            ph.reader = Some(SpillReader::new(spill, ph.stats));
        }
        self.hash_input_done = true;
        self.drain_hash_idx = 0;
        self.drain_group_idx = 0;
        Ok(())
    }

    fn drain_hash_step(&mut self) -> Result<()> {
        loop {
            self.interrupts.check()?;

            if self.drain_hash_idx >= self.perhash.len() {
                self.log_finished();
                self.done = true;
                return Ok(());
            }

            let hash_idx = self.drain_hash_idx;
            if self.drain_group_idx < self.perhash[hash_idx].table.num_groups() {
                let group_idx = self.drain_group_idx;
                self.drain_group_idx += 1;
                self.finalize_hash_group(hash_idx, group_idx)?;
                if !self.out_queue.is_empty() {
                    return Ok(());
                }
                continue;
            }

            // Table exhausted; pull the next spill batch in, or move on.
            let ph = &mut self.perhash[hash_idx];
            if let Some(reader) = &mut ph.reader {
                ph.table.reset();
                self.hashcontext.reset();
                let more = reader.reload_next_file(
                    &mut ph.table,
                    &mut self.pertrans,
                    &self.hashcontext,
                    &self.tmp_arena,
                )?;
                if more {
                    self.drain_group_idx = 0;
                    continue;
                }
                ph.stats = reader.stats;
                ph.reader = None;
            }

            let ph = &self.perhash[hash_idx];
            if ph.stats.tuples_spilled > 0 {
                debug!(
                    set = hash_idx,
                    tuples_spilled = ph.stats.tuples_spilled,
                    batches = ph.stats.batches_created,
                    max_level = ph.stats.max_level,
                    "hybrid hash aggregation finished"
                );
            }
            self.drain_hash_idx += 1;
            self.drain_group_idx = 0;
        }
    }

    fn finalize_hash_group(&mut self, hash_idx: usize, group_idx: usize) -> Result<()> {
        let mut agg_values = Vec::with_capacity(self.peraggs.len());
        let rep = self.perhash[hash_idx].table.group(group_idx).representative.clone();

        for aggno in 0..self.peraggs.len() {
            let transno = self.peraggs[aggno].transno;
            let value = finalize_aggregate(
                &mut self.peraggs[aggno],
                &mut self.pertrans[transno],
                &self.perhash[hash_idx].table.group(group_idx).pergroup[transno],
                &rep,
                &self.hashcontext,
                &self.tmp_arena,
                self.split.skip_final,
            )?;
            agg_values.push(value);
        }

        let global_to_key = self.perhash[hash_idx].global_to_key.clone();
        self.emit_output_row(&agg_values, move |pos| {
            global_to_key[pos]
                .map(|key_pos| rep.column(key_pos).cloned().unwrap_or(Datum::Null))
        })
    }

    // Output projection.
    //
    // `group_value` maps a position in the global grouping column list to
    // the key value for the group being emitted; None means the column is
    // absent from the current grouping set (distinct from a null-valued
    // key). The grouping-id bitmask sets a bit per absent column, leftmost
    // column most significant.

    fn emit_output_row(
        &mut self,
        agg_values: &[Datum],
        group_value: impl Fn(usize) -> Option<Datum>,
    ) -> Result<()> {
        let num_global = self.group_cols.len();
        let mut grouping_mask = 0i64;
        for pos in 0..num_global {
            if group_value(pos).is_none() {
                grouping_mask |= 1 << (num_global - 1 - pos);
            }
        }

        let mut columns = Vec::with_capacity(self.output.len());
        for out in &self.output {
            let value = match out {
                OutputColumn::GroupingColumn(pos) => {
                    if *pos >= num_global {
                        return Err(FoldexecError::new(format!(
                            "output references grouping column {pos} of {num_global}"
                        )));
                    }
                    group_value(*pos).unwrap_or(Datum::Null)
                }
                OutputColumn::AggregateResult(call_idx) => {
                    let aggno = *self
                        .call_to_aggno
                        .get(*call_idx)
                        .required("aggregate call position in output")?;
                    agg_values[aggno].clone()
                }
                OutputColumn::GroupingId => Datum::Int64(grouping_mask),
            };
            columns.push(value);
        }
        let row = Row::new(columns);

        if let Some(having) = &self.having {
            if !evaluate_filter(having.as_ref(), &row)? {
                self.stats.having_skipped += 1;
                return Ok(());
            }
        }

        self.out_queue.push_back(row);
        Ok(())
    }

    fn log_finished(&self) {
        debug!(
            strategy = %self.strategy,
            split = %self.split,
            input_rows = self.stats.input_rows,
            output_rows = self.stats.output_rows + self.out_queue.len() as u64,
            having_skipped = self.stats.having_skipped,
            "aggregation finished"
        );
    }
}

impl Explainable for AggregateOperator {
    fn explain_entry(&self) -> ExplainEntry {
        ExplainEntry::new("Aggregate")
            .with_value("strategy", self.strategy)
            .with_value("split", self.split)
            .with_value("num_aggregates", self.peraggs.len())
            .with_value("num_transitions", self.pertrans.len())
            .with_value("sorted_phases", self.scheduler.num_sorted_phases())
            .with_value("hashed_sets", self.perhash.len())
            .with_value("hybrid", self.hybrid_capable)
            .with_values("group_cols", self.group_cols.iter())
    }
}
