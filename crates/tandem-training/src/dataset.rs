use crate::batch::{Batch, DEFAULT_ATTRIBUTE};
use crate::error::{TrainingError, TrainingResult};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tandem_abstraction::Tensor;

/// Fraction of rows assigned to training when a bulk tensor is split.
pub const DEFAULT_TRAIN_SPLIT: f64 = 0.9;

/// One indexable slice of a dataset (training, validation or testing).
pub trait Segment: Send + Sync {
    /// Number of samples. Sequential sources report their nominal length.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Assembles the samples at `indices` into one batch.
    fn sample(&self, indices: &[usize]) -> TrainingResult<Batch>;
}

/// Named tensors sharing a row dimension.
#[derive(Debug, Clone)]
pub struct TensorSegment {
    tensors: BTreeMap<String, Tensor>,
    rows: usize,
}

impl TensorSegment {
    pub fn new(tensors: BTreeMap<String, Tensor>) -> TrainingResult<Self> {
        let mut rows = None;
        for (name, tensor) in &tensors {
            match rows {
                None => rows = Some(tensor.rows()),
                Some(expected) if expected != tensor.rows() => {
                    return Err(TrainingError::Dataset(format!(
                        "attribute `{name}` has {} rows, expected {expected}",
                        tensor.rows()
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(Self { tensors, rows: rows.unwrap_or(0) })
    }

    /// A segment with one tensor under the `data` attribute.
    #[must_use]
    pub fn single(tensor: Tensor) -> Self {
        let rows = tensor.rows();
        Self { tensors: BTreeMap::from([(DEFAULT_ATTRIBUTE.to_string(), tensor)]), rows }
    }

    fn slice(&self, start: usize, end: usize) -> TrainingResult<Self> {
        let tensors = self
            .tensors
            .iter()
            .map(|(name, tensor)| Ok((name.clone(), tensor.slice_rows(start, end)?)))
            .collect::<TrainingResult<BTreeMap<_, _>>>()?;
        Ok(Self { tensors, rows: end - start })
    }
}

impl Segment for TensorSegment {
    fn len(&self) -> usize {
        self.rows
    }

    fn sample(&self, indices: &[usize]) -> TrainingResult<Batch> {
        let mut batch = Batch::new();
        for (name, tensor) in &self.tensors {
            batch.insert(name.clone(), tensor.select_rows(indices)?);
        }
        Ok(batch)
    }
}

/// A sequential source: every call yields the next batch, indices are ignored.
pub struct StreamSegment {
    source: Mutex<Box<dyn Iterator<Item = Batch> + Send>>,
    len: usize,
}

impl StreamSegment {
    pub fn new<I>(source: I, len: usize) -> Self
    where
        I: Iterator<Item = Batch> + Send + 'static,
    {
        Self { source: Mutex::new(Box::new(source)), len }
    }
}

impl fmt::Debug for StreamSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSegment").field("len", &self.len).finish_non_exhaustive()
    }
}

impl Segment for StreamSegment {
    fn len(&self) -> usize {
        self.len
    }

    fn sample(&self, _indices: &[usize]) -> TrainingResult<Batch> {
        self.source
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next()
            .ok_or_else(|| TrainingError::Dataset("sequential source is exhausted".to_string()))
    }
}

/// Raw material a dataset type hands to [`Dataset::from_data`].
pub enum DatasetInput {
    /// Explicit training / validation / testing segments.
    Split {
        training: Arc<dyn Segment>,
        validation: Option<Arc<dyn Segment>>,
        testing: Option<Arc<dyn Segment>>,
    },
    /// Already in dataset shape.
    Dataset(Dataset),
    /// An indexed or sequential source, used unsplit as the training segment.
    Source(Arc<dyn Segment>),
    /// A bulk array split by rows into training and validation.
    Bulk(Tensor),
}

/// Implemented by dataset types that tasks declare as dependencies.
pub trait DatasetProvider: Send + 'static {
    fn load(&self) -> TrainingResult<DatasetInput>;
}

/// Training data split into segments. Training is always present.
#[derive(Clone)]
pub struct Dataset {
    training: Arc<dyn Segment>,
    validation: Option<Arc<dyn Segment>>,
    testing: Option<Arc<dyn Segment>>,
}

impl fmt::Debug for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dataset")
            .field("training", &self.training.len())
            .field("validation", &self.validation.as_ref().map(|s| s.len()))
            .field("testing", &self.testing.as_ref().map(|s| s.len()))
            .finish()
    }
}

impl Dataset {
    pub fn new(training: Arc<dyn Segment>) -> Self {
        Self { training, validation: None, testing: None }
    }

    #[must_use]
    pub fn with_validation(mut self, validation: Arc<dyn Segment>) -> Self {
        self.validation = Some(validation);
        self
    }

    #[must_use]
    pub fn with_testing(mut self, testing: Arc<dyn Segment>) -> Self {
        self.testing = Some(testing);
        self
    }

    /// Normalizes any supported input into a dataset.
    ///
    /// Bulk tensors are split at `floor(rows * train_split)`; an empty
    /// remainder leaves validation unset.
    pub fn from_data(input: DatasetInput, train_split: f64) -> TrainingResult<Self> {
        match input {
            DatasetInput::Split { training, validation, testing } => {
                Ok(Self { training, validation, testing })
            }
            DatasetInput::Dataset(dataset) => Ok(dataset),
            DatasetInput::Source(source) => Ok(Self::new(source)),
            DatasetInput::Bulk(tensor) => Self::split_bulk(tensor, train_split),
        }
    }

    fn split_bulk(tensor: Tensor, train_split: f64) -> TrainingResult<Self> {
        if !(train_split > 0.0 && train_split <= 1.0) {
            return Err(TrainingError::Dataset(format!(
                "train split must be in (0, 1], got {train_split}"
            )));
        }
        let rows = tensor.rows();
        if rows == 0 {
            return Err(TrainingError::Dataset("bulk dataset has no rows".to_string()));
        }
        let split = ((rows as f64) * train_split).floor() as usize;
        if split == 0 {
            return Err(TrainingError::Dataset(format!(
                "train split {train_split} leaves no training rows out of {rows}"
            )));
        }

        let all = TensorSegment::single(tensor);
        let mut dataset = Self::new(Arc::new(all.slice(0, split)?));
        if split < rows {
            dataset.validation = Some(Arc::new(all.slice(split, rows)?));
        }
        Ok(dataset)
    }

    #[must_use]
    pub fn training(&self) -> &Arc<dyn Segment> {
        &self.training
    }

    #[must_use]
    pub fn validation(&self) -> Option<&Arc<dyn Segment>> {
        self.validation.as_ref()
    }

    #[must_use]
    pub fn testing(&self) -> Option<&Arc<dyn Segment>> {
        self.testing.as_ref()
    }
}
