use std::num::NonZeroUsize;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

/// A supervised dataset held in memory, one row of features per sample and a scalar target.
#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    xs: Array2<f32>,
    ys: Array1<f32>,
}

impl InMemoryDataset {
    /// Creates a new dataset from owned buffers.
    ///
    /// # Panics
    /// If `xs` and `ys` don't have the same amount of samples.
    pub fn new(xs: Array2<f32>, ys: Array1<f32>) -> Self {
        assert_eq!(xs.nrows(), ys.len(), "xs and ys must have the same amount of samples");
        Self { xs, ys }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ys.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ys.is_empty()
    }

    /// The amount of features per sample.
    #[inline]
    pub fn x_dim(&self) -> usize {
        self.xs.ncols()
    }

    #[inline]
    pub fn xs(&self) -> ArrayView2<'_, f32> {
        self.xs.view()
    }

    #[inline]
    pub fn ys(&self) -> ArrayView1<'_, f32> {
        self.ys.view()
    }
}

/// Samples gathered by index.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub xs: Array2<f32>,
    pub ys: Array1<f32>,
}

impl Batch {
    #[inline]
    pub fn len(&self) -> usize {
        self.ys.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ys.is_empty()
    }
}

/// Batches a dataset in the order of a given index sequence, usually a
/// sampler's draw for the current epoch.
#[derive(Debug, Clone)]
pub struct DataLoader<'a> {
    dataset: &'a InMemoryDataset,
    indices: Vec<usize>,
    batch_size: NonZeroUsize,
    drop_last: bool,
    cursor: usize,
}

impl<'a> DataLoader<'a> {
    /// Creates a new `DataLoader`.
    ///
    /// # Arguments
    /// * `dataset` - The samples to batch.
    /// * `indices` - Which samples to visit and in which order.
    /// * `batch_size` - The amount of samples per batch.
    /// * `drop_last` - Whether to skip a trailing batch smaller than `batch_size`.
    ///
    /// # Panics
    /// If an index is out of the dataset's bounds.
    pub fn new(
        dataset: &'a InMemoryDataset,
        indices: Vec<usize>,
        batch_size: NonZeroUsize,
        drop_last: bool,
    ) -> Self {
        assert!(
            indices.iter().all(|&i| i < dataset.len()),
            "every index must be within the dataset"
        );

        Self {
            dataset,
            indices,
            batch_size,
            drop_last,
            cursor: 0,
        }
    }

    fn remaining_batches(&self) -> usize {
        let left = self.indices.len() - self.cursor;
        let bs = self.batch_size.get();

        if self.drop_last { left / bs } else { left.div_ceil(bs) }
    }
}

impl Iterator for DataLoader<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining_batches() == 0 {
            return None;
        }

        let end = (self.cursor + self.batch_size.get()).min(self.indices.len());
        let idx = &self.indices[self.cursor..end];
        self.cursor = end;

        Some(Batch {
            xs: self.dataset.xs.select(Axis(0), idx),
            ys: self.dataset.ys.select(Axis(0), idx),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining_batches();
        (n, Some(n))
    }
}

impl ExactSizeIterator for DataLoader<'_> {}
