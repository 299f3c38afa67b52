//! Batched dataset loading with optional prefetch workers.
//!
//! A [`DataLoader`] groups consecutive dataset items into batches. Every call
//! to [`DataLoader::iter`] starts a fresh pass, so a loader can be iterated as
//! many times as needed. With `num_workers > 0` batches are built on worker
//! threads and re-ordered on the way out, so the sequence is identical to the
//! single-threaded one.

use anyhow::{bail, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Batches in flight per worker
const PREFETCH_FACTOR: usize = 2;

/// An indexable collection of samples that knows how to batch them.
pub trait Dataset: Send + Sync + 'static {
    type Item: Send;
    type Batch: Send + 'static;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize) -> Result<Self::Item>;

    /// Combine items into a batch along a new leading axis
    fn collate(items: Vec<Self::Item>) -> Result<Self::Batch>;
}

pub struct DataLoader<D: Dataset> {
    dataset: Arc<D>,
    batch_size: usize,
    num_workers: usize,
}

impl<D: Dataset> DataLoader<D> {
    pub fn new(dataset: D, batch_size: usize, num_workers: usize) -> Result<Self> {
        if batch_size == 0 {
            bail!("Batch size must be positive");
        }
        Ok(Self {
            dataset: Arc::new(dataset),
            batch_size,
            num_workers,
        })
    }

    pub fn dataset(&self) -> &D {
        &self.dataset
    }

    /// Number of batches in one pass. The last batch may be short.
    pub fn len(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start a new pass over the dataset
    pub fn iter(&self) -> BatchIter<D> {
        let num_batches = self.len();
        if self.num_workers == 0 || num_batches == 0 {
            return BatchIter {
                inner: Inner::Sequential {
                    dataset: Arc::clone(&self.dataset),
                    batch_size: self.batch_size,
                },
                next: 0,
                num_batches,
            };
        }

        let workers = self.num_workers.min(num_batches);
        let (tx, rx) = mpsc::sync_channel(workers * PREFETCH_FACTOR);
        let cancel_flag = Arc::new(AtomicBool::new(false));

        let handles = (0..workers)
            .map(|worker| {
                let dataset = Arc::clone(&self.dataset);
                let tx = tx.clone();
                let cancel_flag = Arc::clone(&cancel_flag);
                let batch_size = self.batch_size;

                thread::spawn(move || {
                    for index in (worker..num_batches).step_by(workers) {
                        if cancel_flag.load(Ordering::SeqCst) {
                            return;
                        }
                        let batch = build_batch(dataset.as_ref(), index, batch_size);
                        if tx.send((index, batch)).is_err() {
                            // Receiver dropped
                            return;
                        }
                    }
                })
            })
            .collect();

        tracing::debug!(workers, batches = num_batches, "Started loader workers");

        BatchIter {
            inner: Inner::Workers {
                rx: Some(rx),
                pending: BTreeMap::new(),
                cancel_flag,
                handles,
            },
            next: 0,
            num_batches,
        }
    }
}

impl<'a, D: Dataset> IntoIterator for &'a DataLoader<D> {
    type Item = Result<D::Batch>;
    type IntoIter = BatchIter<D>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

fn build_batch<D: Dataset>(dataset: &D, index: usize, batch_size: usize) -> Result<D::Batch> {
    let start = index * batch_size;
    let end = (start + batch_size).min(dataset.len());
    let items = (start..end)
        .map(|i| dataset.get(i))
        .collect::<Result<Vec<_>>>()?;
    D::collate(items)
}

enum Inner<D: Dataset> {
    Sequential {
        dataset: Arc<D>,
        batch_size: usize,
    },
    Workers {
        rx: Option<Receiver<(usize, Result<D::Batch>)>>,
        pending: BTreeMap<usize, Result<D::Batch>>,
        cancel_flag: Arc<AtomicBool>,
        handles: Vec<JoinHandle<()>>,
    },
}

/// One pass over a [`DataLoader`], yielding batches in index order
pub struct BatchIter<D: Dataset> {
    inner: Inner<D>,
    next: usize,
    num_batches: usize,
}

impl<D: Dataset> Iterator for BatchIter<D> {
    type Item = Result<D::Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.num_batches {
            return None;
        }
        let index = self.next;
        self.next += 1;

        match &mut self.inner {
            Inner::Sequential { dataset, batch_size } => {
                Some(build_batch(dataset.as_ref(), index, *batch_size))
            }
            Inner::Workers { rx, pending, .. } => {
                if let Some(batch) = pending.remove(&index) {
                    return Some(batch);
                }
                let rx = rx.as_ref()?;
                loop {
                    match rx.recv() {
                        Ok((i, batch)) if i == index => return Some(batch),
                        Ok((i, batch)) => {
                            pending.insert(i, batch);
                        }
                        Err(_) => {
                            // All workers exited before producing this batch
                            self.next = self.num_batches;
                            return Some(Err(anyhow::anyhow!(
                                "Loader workers stopped before batch {}",
                                index
                            )));
                        }
                    }
                }
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.num_batches - self.next;
        (remaining, Some(remaining))
    }
}

impl<D: Dataset> Drop for BatchIter<D> {
    fn drop(&mut self) {
        if let Inner::Workers {
            rx,
            cancel_flag,
            handles,
            ..
        } = &mut self.inner
        {
            cancel_flag.store(true, Ordering::SeqCst);
            // Unblock workers waiting on a full channel
            drop(rx.take());
            for handle in handles.drain(..) {
                if handle.join().is_err() {
                    tracing::warn!("Loader worker panicked");
                }
            }
        }
    }
}
