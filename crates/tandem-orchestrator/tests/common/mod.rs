//! Shared fixtures for orchestrator integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tandem_abstraction::{Component, Parameter, ScalarLoss, Tensor, mse};
use tandem_training::{DatasetInput, DatasetProvider, StepOutcome, TaskArgs, TrainingResult};

macro_rules! learnable {
    ($name:ident, $width:expr) => {
        pub struct $name {
            pub weights: Parameter,
            training: bool,
        }

        impl Default for $name {
            fn default() -> Self {
                Self {
                    weights: Parameter::new("weights", Tensor::zeros(vec![$width])),
                    training: false,
                }
            }
        }

        impl Component for $name {
            fn parameters(&self) -> Vec<Parameter> {
                vec![self.weights.clone()]
            }
            fn set_training(&mut self, training: bool) {
                self.training = training;
            }
            fn is_training(&self) -> bool {
                self.training
            }
        }
    };
}

learnable!(Encoder, 4);
learnable!(Decoder, 4);
learnable!(Critic, 2);

/// 40 rows of two features, no validation split.
#[derive(Default)]
pub struct Points;

impl DatasetProvider for Points {
    fn load(&self) -> TrainingResult<DatasetInput> {
        let tensor = Tensor::new(vec![40, 2], (0..80).map(|v| v as f32).collect())?;
        Ok(DatasetInput::Source(Arc::new(tandem_training::TensorSegment::single(tensor))))
    }
}

/// 20 rows split by the run's train fraction.
#[derive(Default)]
pub struct Samples;

impl DatasetProvider for Samples {
    fn load(&self) -> TrainingResult<DatasetInput> {
        Ok(DatasetInput::Bulk(Tensor::full(vec![20, 4], 1.0)))
    }
}

/// Pulls `weights` toward ones.
pub fn fit_encoder(args: &mut TaskArgs<'_>) -> anyhow::Result<StepOutcome> {
    args.batch("batch")?;
    let target = Tensor::full(vec![4], 1.0);
    let loss = args.with_component::<Encoder, _, _>("encoder", |e| mse(&e.weights, &target))??;
    Ok(StepOutcome::loss(loss))
}

/// Counts invocations into a shared counter.
pub fn counting(
    counter: &Arc<AtomicU64>,
) -> impl Fn(&mut TaskArgs<'_>) -> anyhow::Result<StepOutcome> + Send + Sync + 'static {
    let counter = Arc::clone(counter);
    move |_args| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(StepOutcome::loss(ScalarLoss::new(1.0)))
    }
}
