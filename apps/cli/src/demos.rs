//! Task modules compiled into the binary.

use rand::SeedableRng;
use rand::rngs::StdRng;
use std::sync::Arc;
use tandem_abstraction::{Component, Parameter, Tensor, mse};
use tandem_orchestrator::{ModuleCatalog, TaskModule};
use tandem_training::{
    Batch, DatasetInput, DatasetProvider, StepOutcome, StreamSegment, TaskArgs, TaskDefinition,
    TrainingResult,
};

pub const IMAGE_SHAPE: [usize; 4] = [1, 3, 16, 16];
const TARGET_SEED: u64 = 2019;
/// Nominal length of the target stream.
const TARGET_SAMPLES: usize = 1000;

/// An image whose pixels are the learnable parameter.
pub struct Image {
    pixels: Parameter,
    training: bool,
}

impl Default for Image {
    fn default() -> Self {
        Self {
            pixels: Parameter::new("pixels", Tensor::zeros(IMAGE_SHAPE.to_vec())),
            training: false,
        }
    }
}

impl Component for Image {
    fn parameters(&self) -> Vec<Parameter> {
        vec![self.pixels.clone()]
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }
}

/// Endless stream of one fixed random target image.
#[derive(Default)]
pub struct TargetImage;

impl DatasetProvider for TargetImage {
    fn load(&self) -> TrainingResult<DatasetInput> {
        let mut rng = StdRng::seed_from_u64(TARGET_SEED);
        let target = Tensor::uniform(IMAGE_SHAPE.to_vec(), &mut rng);
        let stream = std::iter::repeat_with(move || Batch::new().with("target", target.clone()));
        Ok(DatasetInput::Source(Arc::new(StreamSegment::new(stream, TARGET_SAMPLES))))
    }
}

fn task_optimize_image(args: &mut TaskArgs<'_>) -> anyhow::Result<StepOutcome> {
    let target = args
        .batch("data")?
        .get("target")
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("batch has no target"))?;
    let loss = args.with_component::<Image, _, _>("image", |image| mse(&image.pixels, &target))??;
    Ok(StepOutcome::loss(loss))
}

fn show_image(args: &mut TaskArgs<'_>) -> anyhow::Result<StepOutcome> {
    let mean = args.with_component::<Image, _, _>("image", |image| image.pixels.value().mean())?;
    Ok(StepOutcome::Score(f64::from(mean)))
}

/// Every module the binary can run, by name.
pub fn catalog() -> ModuleCatalog {
    ModuleCatalog::new().with(
        TaskModule::new("train_image")
            .with_task(
                TaskDefinition::new("task_optimize_image", task_optimize_image)
                    .dataset::<TargetImage>("data")
                    .component::<Image>("image"),
            )
            .with_task(TaskDefinition::new("show_image", show_image).component::<Image>("image")),
    )
}
