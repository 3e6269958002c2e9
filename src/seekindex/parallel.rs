//! Worker pool for parallel block decoding (xz, zstd).
//!
//! The pool is message-passing only: a bounded request channel feeds the
//! workers, results land in a completion map guarded by one mutex and a
//! condvar.  The owning reader prepares jobs (the cheap part — reading
//! compressed bytes) on its own thread and hands decoding (the expensive
//! part) to the pool, so workers never touch the underlying byte source.
//!
//! Completed blocks stay in a bounded LRU so sequential readers hit the
//! cache for every block the pool prefetched.  Dropping the pool closes
//! the channel and joins every worker.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender};

/// The decode step: a pure function from prepared compressed bytes to
/// uncompressed bytes, safe to run on any worker.
pub type BlockDecode = Arc<dyn Fn(Vec<u8>) -> io::Result<Vec<u8>> + Send + Sync>;

struct PoolState {
    pending:  HashSet<usize>,
    done:     HashMap<usize, Result<Vec<u8>, String>>,
    /// Completion order, oldest first, for LRU eviction.
    order:    VecDeque<usize>,
    /// Blocks a caller is currently blocked on; never evicted.
    waiting:  HashSet<usize>,
    capacity: usize,
}

struct Shared {
    state: Mutex<PoolState>,
    ready: Condvar,
}

pub struct BlockPool {
    request_tx: Option<Sender<(usize, Vec<u8>)>>,
    shared:     Arc<Shared>,
    handles:    Vec<JoinHandle<()>>,
    workers:    usize,
}

impl BlockPool {
    pub fn new(workers: usize, decode: BlockDecode) -> Self {
        let workers = workers.max(1);
        let (request_tx, request_rx) = bounded::<(usize, Vec<u8>)>(workers * 2);
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                pending:  HashSet::new(),
                done:     HashMap::new(),
                order:    VecDeque::new(),
                waiting:  HashSet::new(),
                capacity: (workers * 2).max(8),
            }),
            ready: Condvar::new(),
        });

        let handles = (0..workers)
            .map(|_| {
                let rx = request_rx.clone();
                let shared = Arc::clone(&shared);
                let decode = Arc::clone(&decode);
                std::thread::spawn(move || {
                    while let Ok((index, job)) = rx.recv() {
                        let result = decode(job).map_err(|e| e.to_string());
                        let mut state = shared.state.lock().unwrap();
                        state.pending.remove(&index);
                        state.done.insert(index, result);
                        state.order.push_back(index);
                        evict(&mut state);
                        drop(state);
                        shared.ready.notify_all();
                    }
                })
            })
            .collect();

        Self { request_tx: Some(request_tx), shared, handles, workers }
    }

    #[inline]
    pub fn workers(&self) -> usize { self.workers }

    /// True when scheduling `index` again would be redundant.
    pub fn is_ready_or_pending(&self, index: usize) -> bool {
        let state = self.shared.state.lock().unwrap();
        state.pending.contains(&index) || state.done.contains_key(&index)
    }

    /// Queue a prepared job.  Blocks briefly if all workers are busy and
    /// the request queue is full.
    pub fn schedule(&self, index: usize, job: Vec<u8>) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.pending.contains(&index) || state.done.contains_key(&index) {
                return;
            }
            state.pending.insert(index);
        }
        if let Some(tx) = &self.request_tx {
            // A closed channel means the pool is shutting down; the caller
            // is about to be dropped too.
            let _ = tx.send((index, job));
        }
    }

    /// Block until `index` has been decoded, then return a copy.
    /// `index` must have been scheduled first.
    pub fn wait(&self, index: usize) -> io::Result<Vec<u8>> {
        let mut state = self.shared.state.lock().unwrap();
        state.waiting.insert(index);
        loop {
            if let Some(result) = state.done.get(&index) {
                let out = result.clone().map_err(|message| {
                    io::Error::new(io::ErrorKind::InvalidData, message)
                });
                state.waiting.remove(&index);
                return out;
            }
            if !state.pending.contains(&index) {
                state.waiting.remove(&index);
                return Err(io::Error::new(io::ErrorKind::Other,
                    "block was neither decoded nor scheduled"));
            }
            state = self.shared.ready.wait(state).unwrap();
        }
    }
}

fn evict(state: &mut PoolState) {
    while state.done.len() > state.capacity {
        let Some(oldest) = state.order.iter().position(|i| !state.waiting.contains(i)) else {
            break;
        };
        let index = state.order.remove(oldest).unwrap();
        state.done.remove(&index);
    }
}

impl Drop for BlockPool {
    fn drop(&mut self) {
        // Closing the channel ends every worker's recv loop.
        self.request_tx = None;
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doubler() -> BlockDecode {
        Arc::new(|job: Vec<u8>| Ok(job.iter().flat_map(|&b| [b, b]).collect()))
    }

    #[test]
    fn schedule_and_wait() {
        let pool = BlockPool::new(2, doubler());
        pool.schedule(0, vec![1, 2]);
        pool.schedule(1, vec![3]);
        assert_eq!(pool.wait(0).unwrap(), vec![1, 1, 2, 2]);
        assert_eq!(pool.wait(1).unwrap(), vec![3, 3]);
    }

    #[test]
    fn results_are_cached() {
        let pool = BlockPool::new(1, doubler());
        pool.schedule(7, vec![9]);
        assert_eq!(pool.wait(7).unwrap(), vec![9, 9]);
        // Second wait hits the LRU, no rescheduling needed.
        assert_eq!(pool.wait(7).unwrap(), vec![9, 9]);
    }

    #[test]
    fn decode_errors_propagate() {
        let failing: BlockDecode = Arc::new(|_| {
            Err(io::Error::new(io::ErrorKind::InvalidData, "bad block"))
        });
        let pool = BlockPool::new(1, failing);
        pool.schedule(0, vec![0]);
        assert!(pool.wait(0).is_err());
    }

    #[test]
    fn unscheduled_wait_fails_fast() {
        let pool = BlockPool::new(1, doubler());
        assert!(pool.wait(42).is_err());
    }

    #[test]
    fn drop_joins_workers() {
        let pool = BlockPool::new(4, doubler());
        for i in 0..32 {
            pool.schedule(i, vec![i as u8]);
        }
        drop(pool); // must not hang
    }
}
