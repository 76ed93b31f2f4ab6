use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::error::{GpuError, Result};

/// Single worker thread running items strictly in submission order.
///
/// Dropping the queue lets the worker drain what is already queued, then
/// joins it.
pub struct OrderedWorkQueue<T: Send + 'static> {
    name: String,
    tx: Option<Sender<T>>,
    worker: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> OrderedWorkQueue<T> {
    pub fn new(name: &str, mut handler: impl FnMut(T) + Send + 'static) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<T>();
        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Ok(item) = rx.recv() {
                    handler(item);
                }
            })
            .map_err(|err| GpuError::WorkerSpawn(err.to_string()))?;
        debug!(name, "work queue started");
        Ok(Self {
            name: name.to_string(),
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    /// Queues `item`. Never blocks. Returns `false` once the worker is gone.
    pub fn push(&self, item: T) -> bool {
        match &self.tx {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }
}

impl<T: Send + 'static> Drop for OrderedWorkQueue<T> {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(name = %self.name, "work queue worker panicked");
            }
        }
    }
}

impl<T: Send + 'static> std::fmt::Debug for OrderedWorkQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedWorkQueue")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn runs_items_in_order_and_drains_on_drop() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let queue = {
            let seen = seen.clone();
            OrderedWorkQueue::new("test-wq", move |item: u32| {
                seen.lock().unwrap().push(item);
            })
            .unwrap()
        };
        for i in 0..100 {
            assert!(queue.push(i));
        }
        drop(queue);
        assert_eq!(*seen.lock().unwrap(), (0..100).collect::<Vec<_>>());
    }
}
