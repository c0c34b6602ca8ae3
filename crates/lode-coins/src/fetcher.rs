//! Parallel block-input prefetcher.
//!
//! [`InputFetcher`] owns a fixed pool of OS worker threads that resolve
//! the coins a block is about to spend, so serial transaction processing
//! never stalls on backing-store reads. Each fetch round is delimited by
//! two barriers: the first releases the workers into a claim loop where
//! they take successive indices from a shared atomic counter (natural
//! work stealing without a task queue), the second confirms every worker
//! has left the loop before the round state is torn down. Per-item
//! results travel over a channel, whose send/recv pairing provides the
//! release/acquire edge that makes a worker's coin write visible to the
//! orchestrator without any lock on the hot path.
//!
//! The destination cache is mutated only by the orchestrating thread, in
//! original block order, so the final cache contents are deterministic
//! regardless of worker timing.

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Barrier};
use std::thread::{self, JoinHandle};

use parking_lot::RwLock;

use lode_core::error::LodeError;
use lode_core::types::{Block, Coin, Hash256, OutPoint};
use lode_core::view::CoinsView;

use crate::cache::CoinsCache;

/// State shared between the orchestrator and the worker pool.
struct FetchShared {
    /// Round delimiter; sized for every worker plus the orchestrator.
    barrier: Barrier,
    /// Set once at teardown; workers observe it after the release barrier.
    stop: AtomicBool,
    /// Next unclaimed index into the round's outpoint list.
    next_input: AtomicUsize,
    /// Present only while a round is in flight.
    round: RwLock<Option<FetchRound>>,
}

/// Inputs and output channel for one fetch round.
struct FetchRound {
    outpoints: Vec<OutPoint>,
    view: Arc<dyn CoinsView>,
    results: Sender<(usize, Option<Coin>)>,
}

/// Fixed worker pool that pre-populates a scratch cache with the coins a
/// block spends.
///
/// Constructed once and reused for every block. A zero-worker fetcher is
/// valid: [`fetch_inputs`](InputFetcher::fetch_inputs) becomes a no-op
/// and callers fall back to resolving inputs inline.
pub struct InputFetcher {
    shared: Arc<FetchShared>,
    workers: Vec<JoinHandle<()>>,
}

impl InputFetcher {
    /// Spawn `workers` fetch threads.
    ///
    /// # Errors
    ///
    /// [`LodeError::Io`] if a thread cannot be spawned.
    pub fn new(workers: usize) -> Result<Self, LodeError> {
        let shared = Arc::new(FetchShared {
            barrier: Barrier::new(workers + 1),
            stop: AtomicBool::new(false),
            next_input: AtomicUsize::new(0),
            round: RwLock::new(None),
        });
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("inputfetch.{index}"))
                .spawn(move || worker_loop(&shared, index))?;
            handles.push(handle);
        }
        Ok(Self { shared, workers: handles })
    }

    /// Number of worker threads in the pool.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Resolve every missing input of `block` from `view` in parallel and
    /// prime the results into `dest`.
    ///
    /// An input is skipped when its previous output was created by an
    /// earlier transaction in the same block (present nowhere outside the
    /// block, so a lookup would be wasted) or when `parent` already holds
    /// any entry for it — an unspent hit needs no work, and a spent
    /// tombstone must never be resurrected out of the backing store.
    ///
    /// A backing-view failure or panic on one input is logged and treated
    /// as a miss for that input alone; the rest of the round completes,
    /// and the missing coin surfaces later as a validation failure rather
    /// than a crash. With zero workers this is a synchronous no-op.
    ///
    /// # Errors
    ///
    /// Only transaction-id serialization failures propagate; lookup
    /// failures never do.
    pub fn fetch_inputs(
        &mut self,
        dest: &mut CoinsCache,
        parent: &CoinsCache,
        view: &Arc<dyn CoinsView>,
        block: &Block,
    ) -> Result<(), LodeError> {
        if self.workers.is_empty() {
            return Ok(());
        }

        // Collect inputs not satisfiable from the block itself or the
        // parent cache, in block order.
        let mut block_txids: HashSet<Hash256> = HashSet::with_capacity(block.transactions.len());
        let mut missing: Vec<OutPoint> = Vec::with_capacity(block.spending_input_count());
        for tx in block.transactions.iter().skip(1) {
            for input in &tx.inputs {
                let outpoint = &input.previous_output;
                if !block_txids.contains(&outpoint.txid)
                    && parent.cached_coin(outpoint).is_none()
                {
                    missing.push(outpoint.clone());
                }
            }
            block_txids.insert(tx.txid()?);
        }
        if missing.is_empty() {
            return Ok(());
        }

        let total = missing.len();
        let (sender, receiver) = mpsc::channel();
        self.shared.next_input.store(0, Ordering::Relaxed);
        *self.shared.round.write() = Some(FetchRound {
            outpoints: missing,
            view: Arc::clone(view),
            results: sender,
        });

        // Release the workers into the claim loop.
        self.shared.barrier.wait();

        let mut fetched: Vec<Option<Coin>> = Vec::new();
        fetched.resize_with(total, || None);
        for _ in 0..total {
            match receiver.recv() {
                Ok((index, coin)) => fetched[index] = coin,
                Err(_) => break,
            }
        }

        // Confirm every worker left the loop before tearing the round down.
        self.shared.barrier.wait();
        let round = self.shared.round.write().take();

        if let Some(round) = round {
            for (outpoint, coin) in round.outpoints.into_iter().zip(fetched) {
                if let Some(coin) = coin {
                    dest.prime_coin(outpoint, coin);
                }
            }
        }
        Ok(())
    }
}

impl Drop for InputFetcher {
    fn drop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        // All workers are parked at the release barrier between rounds;
        // wake them with the stop flag set and collect the threads.
        self.shared.stop.store(true, Ordering::Release);
        self.shared.barrier.wait();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: &FetchShared, index: usize) {
    tracing::debug!(worker = index, "input fetch worker started");
    loop {
        shared.barrier.wait(); // Wait for work.
        if shared.stop.load(Ordering::Acquire) {
            break;
        }
        {
            let guard = shared.round.read();
            if let Some(round) = guard.as_ref() {
                loop {
                    let i = shared.next_input.fetch_add(1, Ordering::Relaxed);
                    if i >= round.outpoints.len() {
                        break;
                    }
                    let coin = resolve_input(round, i);
                    if round.results.send((i, coin)).is_err() {
                        break;
                    }
                }
            }
        }
        shared.barrier.wait(); // Signal completion.
    }
    tracing::debug!(worker = index, "input fetch worker stopped");
}

/// Resolve one claimed input against the backing view.
///
/// Failures stay local to the item: an I/O error or a panicking view
/// implementation is logged and reported as a miss, never allowed to
/// escape the claim loop and wedge the barrier protocol.
fn resolve_input(round: &FetchRound, i: usize) -> Option<Coin> {
    let outpoint = &round.outpoints[i];
    match panic::catch_unwind(AssertUnwindSafe(|| round.view.get_coin(outpoint))) {
        Ok(Ok(Some(coin))) if !coin.is_spent() => Some(coin),
        Ok(Ok(_)) => None,
        Ok(Err(e)) => {
            tracing::warn!(%outpoint, error = %e, "input fetch failed, treating as missing");
            None
        }
        Err(_) => {
            tracing::error!(%outpoint, "input fetch panicked, treating as missing");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lode_core::types::{BlockHeader, Transaction, TxInput, TxOutput};
    use lode_core::view::MemoryCoinsView;
    use parking_lot::Mutex;

    fn coin(value: u64) -> Coin {
        Coin::new(
            TxOutput { value, script_pubkey: vec![0x51; 10] },
            1,
            false,
        )
    }

    fn header() -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_hash: Hash256::ZERO,
            merkle_root: Hash256::ZERO,
            timestamp: 1_700_000_000,
            difficulty_target: u64::MAX,
            nonce: 0,
        }
    }

    fn coinbase() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput::from_outpoint(OutPoint::null())],
            outputs: vec![TxOutput { value: 50, script_pubkey: vec![] }],
            lock_time: 0,
        }
    }

    fn spend(outpoint: OutPoint, lock_time: u64) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput::from_outpoint(outpoint)],
            outputs: vec![TxOutput { value: 1, script_pubkey: vec![] }],
            lock_time,
        }
    }

    /// 1 coinbase + `num_txs - 1` spending transactions. Each spends the
    /// previous transaction's output, except every third (and the first,
    /// which has no predecessor) spends a distinct external outpoint.
    /// Returns the block and the external outpoints in block order.
    fn chained_block(num_txs: usize) -> (Block, Vec<OutPoint>) {
        let mut transactions = vec![coinbase()];
        let mut externals = Vec::new();
        let mut prev = OutPoint::new(Hash256([1; 32]), 0);
        for i in 1..num_txs {
            let external = i == 1 || i % 3 == 0;
            let input = if external {
                let mut id = [0xE0u8; 32];
                id[..8].copy_from_slice(&(i as u64).to_le_bytes());
                let op = OutPoint::new(Hash256(id), 0);
                externals.push(op.clone());
                op
            } else {
                prev.clone()
            };
            let tx = spend(input, i as u64);
            prev = OutPoint::new(tx.txid().unwrap(), 0);
            transactions.push(tx);
        }
        (Block { header: header(), transactions }, externals)
    }

    fn all_inputs(block: &Block) -> Vec<OutPoint> {
        block
            .transactions
            .iter()
            .skip(1)
            .flat_map(|tx| tx.inputs.iter().map(|i| i.previous_output.clone()))
            .collect()
    }

    /// Backing view that records every queried outpoint.
    #[derive(Default)]
    struct RecordingView {
        inner: MemoryCoinsView,
        queried: Mutex<Vec<OutPoint>>,
    }

    impl CoinsView for RecordingView {
        fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, LodeError> {
            self.queried.lock().push(outpoint.clone());
            self.inner.get_coin(outpoint)
        }

        fn batch_write(
            &self,
            coins: Vec<(OutPoint, Coin)>,
            best_block: Hash256,
        ) -> Result<(), LodeError> {
            self.inner.batch_write(coins, best_block)
        }

        fn best_block(&self) -> Result<Hash256, LodeError> {
            self.inner.best_block()
        }
    }

    /// Backing view whose lookups always fail.
    struct ErrorView;

    impl CoinsView for ErrorView {
        fn get_coin(&self, _outpoint: &OutPoint) -> Result<Option<Coin>, LodeError> {
            Err(LodeError::Storage("database error".into()))
        }

        fn batch_write(
            &self,
            _coins: Vec<(OutPoint, Coin)>,
            _best_block: Hash256,
        ) -> Result<(), LodeError> {
            Ok(())
        }

        fn best_block(&self) -> Result<Hash256, LodeError> {
            Ok(Hash256::ZERO)
        }
    }

    /// Backing view whose lookups panic.
    struct PanicView;

    impl CoinsView for PanicView {
        fn get_coin(&self, _outpoint: &OutPoint) -> Result<Option<Coin>, LodeError> {
            panic!("queried a view that must never be touched");
        }

        fn batch_write(
            &self,
            _coins: Vec<(OutPoint, Coin)>,
            _best_block: Hash256,
        ) -> Result<(), LodeError> {
            Ok(())
        }

        fn best_block(&self) -> Result<Hash256, LodeError> {
            Ok(Hash256::ZERO)
        }
    }

    fn seeded_view(outpoints: &[OutPoint]) -> Arc<MemoryCoinsView> {
        let view = Arc::new(MemoryCoinsView::new());
        for op in outpoints {
            view.put_coin(op.clone(), coin(1));
        }
        view
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    #[test]
    fn concrete_scenario_hundred_tx_block() {
        let (block, externals) = chained_block(100);
        let store = seeded_view(&externals);
        let view: Arc<dyn CoinsView> = store;

        let mut fetcher = InputFetcher::new(3).unwrap();
        let parent = CoinsCache::new(Arc::clone(&view));
        let mut dest = CoinsCache::new(Arc::clone(&view));
        fetcher.fetch_inputs(&mut dest, &parent, &view, &block).unwrap();

        assert_eq!(dest.cache_size(), externals.len());
        for op in &externals {
            let fetched = dest.cached_coin(op).unwrap();
            assert!(!fetched.is_spent());
            assert_eq!(fetched.output.value, 1);
        }
    }

    #[test]
    fn internal_spends_never_hit_the_backing_store() {
        let (block, externals) = chained_block(20);
        let recording = Arc::new(RecordingView::default());
        for op in &externals {
            recording.inner.put_coin(op.clone(), coin(1));
        }
        let view: Arc<dyn CoinsView> = recording.clone();

        let mut fetcher = InputFetcher::new(2).unwrap();
        let parent = CoinsCache::new(Arc::clone(&view));
        let mut dest = CoinsCache::new(Arc::clone(&view));
        fetcher.fetch_inputs(&mut dest, &parent, &view, &block).unwrap();

        let queried = recording.queried.lock();
        let external_set: HashSet<OutPoint> = externals.iter().cloned().collect();
        for op in queried.iter() {
            assert!(external_set.contains(op), "internal spend {op} was queried");
        }
        assert_eq!(queried.len(), externals.len());
    }

    #[test]
    fn spent_in_parent_is_never_resurrected() {
        let (block, _) = chained_block(100);
        let inputs = all_inputs(&block);
        // The store has every input unspent...
        let store = seeded_view(&inputs);
        let view: Arc<dyn CoinsView> = store;

        // ...but the parent cache has already recorded every spend.
        let mut parent = CoinsCache::new(Arc::clone(&view));
        for op in &inputs {
            parent.prime_coin(op.clone(), Coin::new_spent());
        }

        let mut fetcher = InputFetcher::new(3).unwrap();
        let mut dest = CoinsCache::new(Arc::clone(&view));
        fetcher.fetch_inputs(&mut dest, &parent, &view, &block).unwrap();
        assert_eq!(dest.cache_size(), 0);
    }

    #[test]
    fn repeated_fetch_is_idempotent() {
        let (block, externals) = chained_block(50);
        let store = seeded_view(&externals);
        let view: Arc<dyn CoinsView> = store;
        let mut fetcher = InputFetcher::new(3).unwrap();
        let parent = CoinsCache::new(Arc::clone(&view));

        let mut snapshots = Vec::new();
        for _ in 0..3 {
            let mut dest = CoinsCache::new(Arc::clone(&view));
            fetcher.fetch_inputs(&mut dest, &parent, &view, &block).unwrap();
            let mut contents: Vec<(OutPoint, u64)> = externals
                .iter()
                .filter_map(|op| dest.cached_coin(op).map(|c| (op.clone(), c.output.value)))
                .collect();
            contents.sort();
            snapshots.push((dest.cache_size(), contents));
        }
        assert_eq!(snapshots[0], snapshots[1]);
        assert_eq!(snapshots[1], snapshots[2]);
    }

    #[test]
    fn zero_workers_is_a_no_op() {
        let (block, externals) = chained_block(20);
        let store = seeded_view(&externals);
        let view: Arc<dyn CoinsView> = store;

        let mut fetcher = InputFetcher::new(0).unwrap();
        assert_eq!(fetcher.worker_count(), 0);
        let parent = CoinsCache::new(Arc::clone(&view));
        let mut dest = CoinsCache::new(Arc::clone(&view));
        fetcher.fetch_inputs(&mut dest, &parent, &view, &block).unwrap();
        assert_eq!(dest.cache_size(), 0);
    }

    #[test]
    fn randomized_blocks_fetch_exactly_the_externals() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(7);
        let mut fetcher = InputFetcher::new(3).unwrap();

        for _ in 0..5 {
            let num_txs = rng.gen_range(2..60);
            let mut transactions = vec![coinbase()];
            let mut externals = Vec::new();
            let mut prev = OutPoint::new(Hash256([1; 32]), 0);
            for i in 1..num_txs {
                let external = i == 1 || rng.gen_bool(0.5);
                let input = if external {
                    let mut id = [0xE0u8; 32];
                    id[..8].copy_from_slice(&(i as u64).to_le_bytes());
                    let op = OutPoint::new(Hash256(id), 0);
                    externals.push(op.clone());
                    op
                } else {
                    prev.clone()
                };
                let tx = spend(input, i as u64);
                prev = OutPoint::new(tx.txid().unwrap(), 0);
                transactions.push(tx);
            }
            let block = Block { header: header(), transactions };

            let store = seeded_view(&externals);
            let view: Arc<dyn CoinsView> = store;
            let parent = CoinsCache::new(Arc::clone(&view));
            let mut dest = CoinsCache::new(Arc::clone(&view));
            fetcher.fetch_inputs(&mut dest, &parent, &view, &block).unwrap();

            assert_eq!(dest.cache_size(), externals.len());
            for op in &externals {
                assert_eq!(dest.cached_coin(op).unwrap().output.value, 1);
            }
        }
    }

    #[test]
    fn backing_errors_degrade_to_misses() {
        init_tracing();
        let (block, _) = chained_block(20);
        let view: Arc<dyn CoinsView> = Arc::new(ErrorView);

        let mut fetcher = InputFetcher::new(2).unwrap();
        let parent = CoinsCache::new(Arc::clone(&view));
        let mut dest = CoinsCache::new(Arc::clone(&view));
        fetcher.fetch_inputs(&mut dest, &parent, &view, &block).unwrap();
        assert_eq!(dest.cache_size(), 0);
    }

    #[test]
    fn panicking_view_does_not_wedge_the_pool() {
        init_tracing();
        let (block, externals) = chained_block(20);
        let panic_view: Arc<dyn CoinsView> = Arc::new(PanicView);

        let mut fetcher = InputFetcher::new(2).unwrap();
        let parent = CoinsCache::new(Arc::clone(&panic_view));
        let mut dest = CoinsCache::new(Arc::clone(&panic_view));
        fetcher
            .fetch_inputs(&mut dest, &parent, &panic_view, &block)
            .unwrap();
        assert_eq!(dest.cache_size(), 0);

        // The pool is still serviceable for a healthy round.
        let store = seeded_view(&externals);
        let view: Arc<dyn CoinsView> = store;
        let parent = CoinsCache::new(Arc::clone(&view));
        let mut dest = CoinsCache::new(Arc::clone(&view));
        fetcher.fetch_inputs(&mut dest, &parent, &view, &block).unwrap();
        assert_eq!(dest.cache_size(), externals.len());
    }

    #[test]
    fn coinbase_only_block_fetches_nothing() {
        let block = Block { header: header(), transactions: vec![coinbase()] };
        let recording = Arc::new(RecordingView::default());
        let view: Arc<dyn CoinsView> = recording.clone();

        let mut fetcher = InputFetcher::new(2).unwrap();
        let parent = CoinsCache::new(Arc::clone(&view));
        let mut dest = CoinsCache::new(Arc::clone(&view));
        fetcher.fetch_inputs(&mut dest, &parent, &view, &block).unwrap();

        assert_eq!(dest.cache_size(), 0);
        assert!(recording.queried.lock().is_empty());
    }

    #[test]
    fn drop_joins_cleanly_after_use() {
        let (block, externals) = chained_block(10);
        let store = seeded_view(&externals);
        let view: Arc<dyn CoinsView> = store;
        let mut fetcher = InputFetcher::new(4).unwrap();
        let parent = CoinsCache::new(Arc::clone(&view));
        let mut dest = CoinsCache::new(Arc::clone(&view));
        fetcher.fetch_inputs(&mut dest, &parent, &view, &block).unwrap();
        drop(fetcher);
    }
}
