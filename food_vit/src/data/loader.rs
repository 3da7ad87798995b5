//! Shuffled mini-batches decoded ahead of the training step.
//!
//! A producer thread walks the epoch order and decodes each batch on a
//! dedicated rayon pool, handing finished batches over a bounded channel.
//! The channel bound is the prefetch depth.

use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, bounded};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::ThreadPool;
use rayon::prelude::*;
use tracing::debug;

use super::dataset::Sample;
use super::image::{ImageTensor, Preprocessor, TrainAugment};
use crate::error::{Error, Result};

/// How samples are turned into tensors.
#[derive(Debug, Clone)]
pub enum Transform {
    Eval(Preprocessor),
    Train(TrainAugment),
}

impl Transform {
    /// `seed` fixes the random augmentation of this one sample.
    fn load(&self, sample: &Sample, seed: u64) -> Result<ImageTensor> {
        match self {
            Transform::Eval(pre) => pre.load(&sample.path),
            Transform::Train(aug) => aug.load(&sample.path, &mut StdRng::seed_from_u64(seed)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Batch {
    pub images: Vec<ImageTensor>,
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct LoaderOptions {
    pub batch_size: usize,
    pub num_workers: usize,
    pub prefetch: usize,
    pub shuffle: bool,
}

pub struct DataLoader {
    samples: Arc<Vec<Sample>>,
    transform: Arc<Transform>,
    pool: Arc<ThreadPool>,
    options: LoaderOptions,
}

impl DataLoader {
    pub fn new(samples: Vec<Sample>, transform: Transform, options: LoaderOptions) -> Result<Self> {
        if options.batch_size == 0 {
            return Err(Error::InvalidConfig("batch_size must be positive".into()));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.num_workers.max(1))
            .thread_name(|i| format!("loader-{i}"))
            .build()
            .map_err(|e| Error::Dataset(format!("failed to start loader workers: {e}")))?;
        Ok(DataLoader {
            samples: Arc::new(samples),
            transform: Arc::new(transform),
            pool: Arc::new(pool),
            options,
        })
    }

    pub fn num_samples(&self) -> usize {
        self.samples.len()
    }

    /// Batches per epoch, counting a trailing partial batch.
    pub fn num_batches(&self) -> usize {
        self.samples.len().div_ceil(self.options.batch_size)
    }

    /// Start one pass over the data. Order and per-sample augmentation
    /// seeds are drawn from `rng` up front, so a seeded `rng` reproduces the
    /// epoch regardless of worker scheduling.
    pub fn epoch<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<BatchIter> {
        let mut order: Vec<usize> = (0..self.samples.len()).collect();
        if self.options.shuffle {
            order.shuffle(rng);
        }
        let plan: Vec<(usize, u64)> = order.into_iter().map(|i| (i, rng.r#gen())).collect();

        let (sender, receiver) = bounded::<Result<Batch>>(self.options.prefetch.max(1));
        let samples = Arc::clone(&self.samples);
        let transform = Arc::clone(&self.transform);
        let pool = Arc::clone(&self.pool);
        let batch_size = self.options.batch_size;

        let handle = thread::Builder::new()
            .name("loader".into())
            .spawn(move || {
                for chunk in plan.chunks(batch_size) {
                    let images: Result<Vec<ImageTensor>> = pool.install(|| {
                        chunk
                            .par_iter()
                            .map(|&(idx, seed)| transform.load(&samples[idx], seed))
                            .collect()
                    });
                    let batch = images.map(|images| Batch {
                        images,
                        labels: chunk.iter().map(|&(idx, _)| samples[idx].label).collect(),
                    });
                    let failed = batch.is_err();
                    // receiver gone means the consumer stopped early
                    if sender.send(batch).is_err() || failed {
                        return;
                    }
                }
                debug!("loader finished epoch");
            })
            .map_err(|e| Error::Dataset(format!("failed to spawn loader thread: {e}")))?;

        Ok(BatchIter {
            receiver: Some(receiver),
            handle: Some(handle),
        })
    }
}

/// Batches of one epoch, in order. Dropping it stops the producer.
pub struct BatchIter {
    receiver: Option<Receiver<Result<Batch>>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Iterator for BatchIter {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.receiver.as_ref()?.recv().ok()
    }
}

impl Drop for BatchIter {
    fn drop(&mut self) {
        // unblock a producer waiting on a full channel before joining it
        drop(self.receiver.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
