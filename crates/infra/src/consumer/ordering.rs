//! Per-key ordering for records handled on concurrent tasks.
//!
//! Each record of a key waits for the previous record of the same key to
//! finish before its handler runs. Records with different keys never wait on
//! each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

#[derive(Debug)]
struct Tail {
    generation: u64,
    done: oneshot::Receiver<()>,
}

#[derive(Debug, Default)]
struct Chains {
    next_generation: u64,
    tails: HashMap<String, Tail>,
}

/// Chains records by key in the order they are enqueued.
#[derive(Debug, Clone, Default)]
pub struct KeySequencer {
    chains: Arc<Mutex<Chains>>,
}

impl KeySequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the end of `key`'s chain. Must be called in fetch order.
    pub fn enqueue(&self, key: &str) -> SequenceSlot {
        let (tx, rx) = oneshot::channel();
        let mut chains = match self.chains.lock() {
            Ok(chains) => chains,
            Err(poisoned) => poisoned.into_inner(),
        };

        let generation = chains.next_generation;
        chains.next_generation += 1;
        let predecessor = chains
            .tails
            .insert(key.to_string(), Tail { generation, done: rx })
            .map(|tail| tail.done);

        SequenceSlot {
            chains: self.chains.clone(),
            key: key.to_string(),
            generation,
            predecessor,
            done: Some(tx),
        }
    }

    /// Keys with a record still pending.
    pub fn pending_keys(&self) -> usize {
        self.chains.lock().map(|c| c.tails.len()).unwrap_or(0)
    }
}

/// A record's place in its key's chain. Dropping it lets the successor run.
#[derive(Debug)]
pub struct SequenceSlot {
    chains: Arc<Mutex<Chains>>,
    key: String,
    generation: u64,
    predecessor: Option<oneshot::Receiver<()>>,
    done: Option<oneshot::Sender<()>>,
}

impl SequenceSlot {
    /// Wait until every earlier record of the same key has finished.
    ///
    /// A predecessor that panicked counts as finished.
    pub async fn wait_turn(&mut self) {
        if let Some(predecessor) = self.predecessor.take() {
            let _ = predecessor.await;
        }
    }
}

impl Drop for SequenceSlot {
    fn drop(&mut self) {
        if let Ok(mut chains) = self.chains.lock() {
            let is_tail = chains
                .tails
                .get(&self.key)
                .is_some_and(|tail| tail.generation == self.generation);
            if is_tail {
                chains.tails.remove(&self.key);
            }
        }
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}
