use std::collections::BTreeMap;
use tandem_abstraction::{Device, Tensor};

/// Attribute name used when a batch is built from a bare tensor.
pub const DEFAULT_ATTRIBUTE: &str = "data";

/// Items sampled together from one dataset segment.
///
/// Every attribute is an independent tensor, so a batch may carry inputs
/// without targets or any other partial combination.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    attributes: BTreeMap<String, Tensor>,
    sequence: Option<u64>,
}

impl Batch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a single tensor under the `data` attribute.
    #[must_use]
    pub fn from_tensor(tensor: Tensor) -> Self {
        Self::new().with(DEFAULT_ATTRIBUTE, tensor)
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.insert(name, tensor);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.attributes.insert(name.into(), tensor);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.attributes.get(name)
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Number of samples, taken from the first attribute's row count.
    #[must_use]
    pub fn samples(&self) -> usize {
        self.attributes.values().next().map_or(0, Tensor::rows)
    }

    /// Position in an ordered sweep; `None` for randomly sampled batches.
    #[must_use]
    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    #[must_use]
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Moves every attribute to `device`.
    #[must_use]
    pub fn to(self, device: Device) -> Self {
        Self {
            attributes: self.attributes.into_iter().map(|(k, v)| (k, v.to(device))).collect(),
            sequence: self.sequence,
        }
    }
}
