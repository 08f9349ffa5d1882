//! Parallel-worker repartitioning.
//!
//! Each worker hashes the chosen grouping column of every input row and
//! either consumes the row locally or ships it to the owning worker. Shipping
//! goes through a fixed-size single-producer/single-consumer byte ring per
//! ordered worker pair, overflowing into per-target disk files whose names
//! are published once the sender finishes producing. Workers advance through
//! a monotone status protocol; an error anywhere aborts every observer.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use foldexec_datum::codec;
use foldexec_datum::datum::Datum;
use foldexec_datum::hash::hash_datum;
use foldexec_datum::row::Row;
use foldexec_error::{FoldexecError, Result};
use foldexec_io::BufFile;
use parking_lot::Mutex;
use tracing::debug;

/// Worker lifecycle states. Transitions are monotone except that Error may
/// be entered from anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum WorkerStatus {
    None = 0,
    Init = 1,
    ProduceDone = 2,
    ConsumeDone = 3,
    Error = 4,
}

impl WorkerStatus {
    fn from_u8(v: u8) -> WorkerStatus {
        match v {
            0 => WorkerStatus::None,
            1 => WorkerStatus::Init,
            2 => WorkerStatus::ProduceDone,
            3 => WorkerStatus::ConsumeDone,
            _ => WorkerStatus::Error,
        }
    }
}

/// Container kind carried by a ring buffer, fixed on first use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    DataRow = 1,
    MinimalTuple = 2,
    HeapTuple = 3,
}

const KIND_UNSET: u8 = 0;

/// Fixed-size single-producer/single-consumer byte ring.
///
/// `head` and `tail` are monotone byte counters owned by the sender and
/// receiver respectively; indices are taken modulo the capacity. Free space
/// is `capacity - 1 - used` so a full ring never equals an empty one.
#[derive(Debug)]
pub struct SpscRing {
    data: Box<[AtomicU8]>,
    head: AtomicU64,
    tail: AtomicU64,
    kind: AtomicU8,
}

impl SpscRing {
    fn new(capacity: usize) -> Self {
        SpscRing {
            data: (0..capacity).map(|_| AtomicU8::new(0)).collect(),
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            kind: AtomicU8::new(KIND_UNSET),
        }
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn free_space(&self) -> usize {
        let used = self.head.load(Ordering::Acquire) - self.tail.load(Ordering::Acquire);
        self.capacity() - 1 - used as usize
    }

    /// Try to enqueue one length-prefixed record. Returns false when the
    /// ring lacks room.
    fn try_push(&self, kind: RecordKind, payload: &[u8]) -> Result<bool> {
        match self
            .kind
            .compare_exchange(KIND_UNSET, kind as u8, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(existing) if existing == kind as u8 => {}
            Err(_) => {
                // A ring never changes container kind while in use.
                return Err(FoldexecError::new(
                    "redistribution buffer container kind changed mid-stream",
                ));
            }
        }

        let needed = 4 + payload.len();
        if self.free_space() < needed {
            return Ok(false);
        }

        let head = self.head.load(Ordering::Relaxed);
        let len = i32::try_from(payload.len())
            .map_err(|_| FoldexecError::new("row too large for redistribution ring"))?;
        self.write_bytes(head, &len.to_le_bytes());
        self.write_bytes(head + 4, payload);
        self.head.store(head + needed as u64, Ordering::Release);
        Ok(true)
    }

    /// Try to dequeue one record.
    fn try_pop(&self) -> Result<Option<Vec<u8>>> {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Relaxed);
        if head == tail {
            return Ok(None);
        }

        let mut len_bytes = [0u8; 4];
        self.read_bytes(tail, &mut len_bytes);
        let len = i32::from_le_bytes(len_bytes);
        if len < 0 || (head - tail) < 4 + len as u64 {
            return Err(FoldexecError::new("data corrupted"));
        }

        let mut payload = vec![0u8; len as usize];
        self.read_bytes(tail + 4, &mut payload);
        self.tail.store(tail + 4 + len as u64, Ordering::Release);
        Ok(Some(payload))
    }

    fn write_bytes(&self, at: u64, bytes: &[u8]) {
        let cap = self.capacity() as u64;
        for (offset, byte) in bytes.iter().enumerate() {
            let idx = ((at + offset as u64) % cap) as usize;
            self.data[idx].store(*byte, Ordering::Relaxed);
        }
    }

    fn read_bytes(&self, at: u64, out: &mut [u8]) {
        let cap = self.capacity() as u64;
        for (offset, byte) in out.iter_mut().enumerate() {
            let idx = ((at + offset as u64) % cap) as usize;
            *byte = self.data[idx].load(Ordering::Relaxed);
        }
    }
}

/// Shared control plane for one redistribution exchange.
#[derive(Debug)]
pub struct RedistShared {
    num_workers: usize,
    status: Vec<AtomicU8>,
    parallel_error: AtomicBool,
    /// Rings indexed `sender * num_workers + receiver`.
    rings: Vec<SpscRing>,
    /// Published overflow file names per ordered pair, appended once by the
    /// sender when it finishes producing.
    files: Vec<Mutex<Option<Vec<PathBuf>>>>,
}

impl RedistShared {
    pub fn new(num_workers: usize, ring_bytes: usize) -> Arc<Self> {
        Arc::new(RedistShared {
            num_workers,
            status: (0..num_workers).map(|_| AtomicU8::new(0)).collect(),
            parallel_error: AtomicBool::new(false),
            rings: (0..num_workers * num_workers)
                .map(|_| SpscRing::new(ring_bytes))
                .collect(),
            files: (0..num_workers * num_workers)
                .map(|_| Mutex::new(None))
                .collect(),
        })
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    fn ring(&self, sender: usize, receiver: usize) -> &SpscRing {
        &self.rings[sender * self.num_workers + receiver]
    }

    fn status_of(&self, worker: usize) -> WorkerStatus {
        WorkerStatus::from_u8(self.status[worker].load(Ordering::Acquire))
    }

    fn set_status(&self, worker: usize, status: WorkerStatus) {
        self.status[worker].store(status as u8, Ordering::Release);
    }

    pub fn raise_parallel_error(&self) {
        self.parallel_error.store(true, Ordering::Release);
    }

    fn check_peers_healthy(&self) -> Result<()> {
        if self.parallel_error.load(Ordering::Acquire) {
            return Err(FoldexecError::new("data corrupted"));
        }
        for worker in 0..self.num_workers {
            if self.status_of(worker) == WorkerStatus::Error {
                return Err(FoldexecError::new("data corrupted"));
            }
        }
        Ok(())
    }
}

/// Target worker for a grouping value: nulls go to worker zero, everything
/// else distributes by hash.
pub fn target_worker(value: &Datum, num_workers: usize) -> usize {
    if value.is_null() {
        return 0;
    }
    let hash = hash_datum(value);
    let shift = num_workers.min(63) as u32;
    let bucket = hash % (1u64 << shift);
    (bucket % num_workers as u64) as usize
}

/// Outcome of routing one input row.
#[derive(Debug, PartialEq)]
pub enum RouteOutcome {
    /// The row belongs to this worker; process it.
    Local,
    /// The row was shipped; an incoming row may have been drained in
    /// exchange and should be processed instead.
    Shipped(Option<Row>),
}

/// Per-worker handle driving one side of the exchange.
#[derive(Debug)]
pub struct Redistributor {
    shared: Arc<RedistShared>,
    me: usize,
    /// Overflow files this worker writes, one slot per target.
    overflow: Vec<Option<BufFile>>,
    /// Remote files opened during consumption, per peer.
    remote_files: Vec<Vec<BufFile>>,
    remote_files_opened: Vec<bool>,
    drain_cursor: usize,
    produce_done: bool,
}

impl Redistributor {
    pub fn new(shared: Arc<RedistShared>, worker_idx: usize) -> Self {
        let num_workers = shared.num_workers();
        shared.set_status(worker_idx, WorkerStatus::Init);
        Redistributor {
            shared,
            me: worker_idx,
            overflow: (0..num_workers).map(|_| None).collect(),
            remote_files: (0..num_workers).map(|_| Vec::new()).collect(),
            remote_files_opened: vec![false; num_workers],
            drain_cursor: 0,
            produce_done: false,
        }
    }

    pub fn worker_index(&self) -> usize {
        self.me
    }

    /// Route one input row by its grouping value.
    pub fn route_row(&mut self, row: &Row, value: &Datum) -> Result<RouteOutcome> {
        self.shared.check_peers_healthy()?;

        let target = target_worker(value, self.shared.num_workers());
        if target == self.me {
            return Ok(RouteOutcome::Local);
        }

        let payload = codec::row_to_bytes(row);
        let ring = self.shared.ring(self.me, target);
        if !ring.try_push(RecordKind::DataRow, &payload)? {
            if self.overflow[target].is_none() {
                self.overflow[target] = Some(BufFile::create_temp(&format!(
                    "redist-{}-to-{}",
                    self.me, target
                ))?);
            }
            match &mut self.overflow[target] {
                Some(file) => file.write_record(&payload)?,
                None => return Err(FoldexecError::new("overflow file creation failed")),
            }
        }

        // Drain one incoming row so a worker that only ships never starves
        // its producers.
        let drained = self.poll_incoming_ring()?;
        Ok(RouteOutcome::Shipped(drained))
    }

    /// Pop at most one record from the incoming rings, round-robin.
    fn poll_incoming_ring(&mut self) -> Result<Option<Row>> {
        let n = self.shared.num_workers();
        for _ in 0..n {
            let peer = self.drain_cursor;
            self.drain_cursor = (self.drain_cursor + 1) % n;
            if peer == self.me {
                continue;
            }
            if let Some(payload) = self.shared.ring(peer, self.me).try_pop()? {
                return Ok(Some(codec::row_from_bytes(&payload)?));
            }
        }
        Ok(None)
    }

    /// Flush overflow files, publish their names, and mark this worker done
    /// producing.
    pub fn finish_produce(&mut self) -> Result<()> {
        for (target, slot) in self.overflow.iter_mut().enumerate() {
            if let Some(file) = slot {
                let mut attempts = 0;
                loop {
                    match file.flush() {
                        Ok(()) => break,
                        Err(err) => {
                            attempts += 1;
                            if attempts >= 3 {
                                self.shared.set_status(self.me, WorkerStatus::Error);
                                return Err(err);
                            }
                        }
                    }
                }
                let names = vec![file.path().to_path_buf()];
                *self.shared.files
                    [self.me * self.shared.num_workers() + target]
                    .lock() = Some(names);
            }
        }
        self.shared.set_status(self.me, WorkerStatus::ProduceDone);
        self.produce_done = true;
        debug!(worker = self.me, "redistribution produce done");
        Ok(())
    }

    /// Produce the next row shipped to this worker by any peer.
    ///
    /// Returns None once every peer has finished producing and all rings and
    /// published files toward this worker are drained. At that point this
    /// worker has settled into ConsumeDone and waited for its peers to do
    /// the same.
    pub fn next_remote_row(&mut self) -> Result<Option<Row>> {
        if !self.produce_done {
            return Err(FoldexecError::new(
                "consume phase entered before produce finished",
            ));
        }

        loop {
            self.shared.check_peers_healthy()?;

            if let Some(row) = self.poll_incoming_ring()? {
                return Ok(Some(row));
            }

            // Open and drain files from peers that finished producing.
            let n = self.shared.num_workers();
            for peer in 0..n {
                if peer == self.me {
                    continue;
                }
                if self.shared.status_of(peer) >= WorkerStatus::ProduceDone
                    && !self.remote_files_opened[peer]
                {
                    let names = self.shared.files[peer * n + self.me].lock().clone();
                    if let Some(names) = names {
                        for name in names {
                            self.remote_files[peer].push(BufFile::open_path(&name)?);
                        }
                    }
                    self.remote_files_opened[peer] = true;
                }
                while let Some(file) = self.remote_files[peer].first_mut() {
                    match file.read_record()? {
                        Some(payload) => return Ok(Some(codec::row_from_bytes(&payload)?)),
                        None => {
                            self.remote_files[peer].remove(0);
                        }
                    }
                }
            }

            // Done only when everyone stopped producing and nothing is left
            // in flight.
            let all_produced = (0..n)
                .filter(|&w| w != self.me)
                .all(|w| self.shared.status_of(w) >= WorkerStatus::ProduceDone);
            let all_opened = (0..n)
                .filter(|&w| w != self.me)
                .all(|w| self.remote_files_opened[w]);
            if all_produced && all_opened {
                if self.poll_incoming_ring()?.is_none() {
                    self.settle_consume_done()?;
                    return Ok(None);
                }
            } else {
                std::thread::yield_now();
            }
        }
    }

    fn settle_consume_done(&mut self) -> Result<()> {
        self.shared.set_status(self.me, WorkerStatus::ConsumeDone);
        loop {
            self.shared.check_peers_healthy()?;
            let n = self.shared.num_workers();
            let all_done = (0..n).all(|w| self.shared.status_of(w) >= WorkerStatus::ConsumeDone);
            if all_done {
                break;
            }
            std::thread::yield_now();
        }
        // Exchange finished; release remote file handles.
        for files in self.remote_files.iter_mut() {
            files.clear();
        }
        debug!(worker = self.me, "redistribution consume done");
        Ok(())
    }

    pub fn mark_error(&self) {
        self.shared.set_status(self.me, WorkerStatus::Error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row_i64(v: i64) -> Row {
        Row::from_iter([Datum::Int64(v)])
    }

    #[test]
    fn ring_round_trips_records() {
        let ring = SpscRing::new(64);
        assert!(ring.try_push(RecordKind::DataRow, b"hello").unwrap());
        assert!(ring.try_push(RecordKind::DataRow, b"world!").unwrap());

        assert_eq!(Some(b"hello".to_vec()), ring.try_pop().unwrap());
        assert_eq!(Some(b"world!".to_vec()), ring.try_pop().unwrap());
        assert_eq!(None, ring.try_pop().unwrap());
    }

    #[test]
    fn ring_reports_full() {
        let ring = SpscRing::new(16);
        // 4-byte prefix + 8 bytes payload = 12; a second record cannot fit
        // in the remaining 3 usable bytes.
        assert!(ring.try_push(RecordKind::DataRow, &[7u8; 8]).unwrap());
        assert!(!ring.try_push(RecordKind::DataRow, &[7u8; 8]).unwrap());

        ring.try_pop().unwrap().unwrap();
        assert!(ring.try_push(RecordKind::DataRow, &[9u8; 8]).unwrap());
    }

    #[test]
    fn ring_wraps_around() {
        let ring = SpscRing::new(16);
        for i in 0..10 {
            assert!(ring.try_push(RecordKind::DataRow, &[i as u8; 4]).unwrap());
            assert_eq!(Some(vec![i as u8; 4]), ring.try_pop().unwrap());
        }
    }

    #[test]
    fn ring_rejects_kind_change() {
        let ring = SpscRing::new(64);
        ring.try_push(RecordKind::DataRow, b"x").unwrap();
        assert!(ring.try_push(RecordKind::HeapTuple, b"y").is_err());
    }

    #[test]
    fn null_routes_to_worker_zero() {
        assert_eq!(0, target_worker(&Datum::Null, 4));
    }

    #[test]
    fn targets_are_stable_and_in_range() {
        for w in 1..6usize {
            for v in 0..100i64 {
                let t1 = target_worker(&Datum::Int64(v), w);
                let t2 = target_worker(&Datum::Int64(v), w);
                assert_eq!(t1, t2);
                assert!(t1 < w);
            }
        }
    }

    #[test]
    fn two_workers_exchange_rows() {
        let shared = RedistShared::new(2, 1024);

        let shared_a = shared.clone();
        let shared_b = shared.clone();

        let a = std::thread::spawn(move || -> Result<Vec<i64>> {
            let mut redist = Redistributor::new(shared_a, 0);
            let mut mine = Vec::new();
            for v in 0..100 {
                let row = row_i64(v);
                match redist.route_row(&row, &row.columns[0])? {
                    RouteOutcome::Local => mine.push(v),
                    RouteOutcome::Shipped(Some(incoming)) => {
                        mine.push(incoming.columns[0].try_as_i64().unwrap())
                    }
                    RouteOutcome::Shipped(None) => {}
                }
            }
            redist.finish_produce()?;
            while let Some(row) = redist.next_remote_row()? {
                mine.push(row.columns[0].try_as_i64().unwrap());
            }
            Ok(mine)
        });

        let b = std::thread::spawn(move || -> Result<Vec<i64>> {
            let mut redist = Redistributor::new(shared_b, 1);
            let mut mine = Vec::new();
            for v in 100..200 {
                let row = row_i64(v);
                match redist.route_row(&row, &row.columns[0])? {
                    RouteOutcome::Local => mine.push(v),
                    RouteOutcome::Shipped(Some(incoming)) => {
                        mine.push(incoming.columns[0].try_as_i64().unwrap())
                    }
                    RouteOutcome::Shipped(None) => {}
                }
            }
            redist.finish_produce()?;
            while let Some(row) = redist.next_remote_row()? {
                mine.push(row.columns[0].try_as_i64().unwrap());
            }
            Ok(mine)
        });

        let mut got_a = a.join().unwrap().unwrap();
        let mut got_b = b.join().unwrap().unwrap();

        // Each worker owns exactly its hash partition.
        for &v in &got_a {
            assert_eq!(0, target_worker(&Datum::Int64(v), 2));
        }
        for &v in &got_b {
            assert_eq!(1, target_worker(&Datum::Int64(v), 2));
        }

        // Conservation: every row consumed exactly once.
        got_a.append(&mut got_b);
        got_a.sort_unstable();
        assert_eq!((0..200).collect::<Vec<_>>(), got_a);
    }

    #[test]
    fn peer_error_aborts_consumers() {
        let shared = RedistShared::new(2, 256);
        let mut redist = Redistributor::new(shared.clone(), 0);
        shared.set_status(1, WorkerStatus::Error);

        let err = redist
            .route_row(&row_i64(1), &Datum::Int64(1))
            .unwrap_err();
        assert_eq!("data corrupted", err.message());
    }
}
