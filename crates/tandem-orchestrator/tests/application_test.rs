//! End-to-end scheduler behaviour.

mod common;

use common::{Critic, Decoder, Encoder, Points, Samples, counting, fit_encoder};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tandem_abstraction::{Device, ScalarLoss, lock_component};
use tandem_orchestrator::{
    Application, FsTaskSource, ModuleCatalog, OrchestrationError, Registry, RunSettings, RunSummary,
    TaskModule,
};
use tandem_training::{
    CheckpointStore, ComponentConfig, ComponentKey, MemoryCheckpointStore, OptimizerKind,
    RunManifest, StepOutcome, TaskConfig, TaskDefinition, checkpoint_filename,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn settings(temp: &TempDir) -> RunSettings {
    RunSettings { output_dir: temp.path().join("models"), ..Default::default() }
}

fn registry(module: TaskModule) -> Registry {
    let mut registry = Registry::new();
    registry.load_module(module).unwrap();
    registry
}

async fn run(registry: Registry, temp: &TempDir) -> tandem_orchestrator::Result<RunSummary> {
    Application::new(registry, settings(temp)).run(CancellationToken::new()).await
}

#[tokio::test]
async fn test_single_task_trains_and_checkpoints() {
    let temp = TempDir::new().unwrap();
    let module = TaskModule::new("train_points").with_task(
        TaskDefinition::new("task_fit", fit_encoder)
            .component::<Encoder>("encoder")
            .dataset::<Points>("batch")
            .config(TaskConfig { batch_size: Some(4), ..Default::default() }),
    );

    let summary = Application::new(registry(module), settings(&temp))
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert!(!summary.cancelled);
    assert_eq!(summary.rounds, 10);
    assert_eq!(summary.groups.len(), 1);
    assert_eq!(summary.groups[0].training_steps, 10);
    assert_eq!(summary.groups[0].optimizer_steps, 10);
    assert_eq!(summary.checkpoints.len(), 1);

    let filename = checkpoint_filename(ComponentKey::of::<Encoder>());
    let expected = temp.path().join("models").join(filename);
    assert_eq!(summary.checkpoints[0], expected);
    assert!(expected.exists());

    let manifest = RunManifest::read(&summary.manifest.unwrap()).unwrap();
    assert_eq!(manifest.artifacts.len(), 1);
    assert_eq!(manifest.groups[0].group, "Encoder");
}

#[tokio::test]
async fn test_shared_dependencies_form_one_group() {
    let temp = TempDir::new().unwrap();
    let first = Arc::new(AtomicU64::new(0));
    let second = Arc::new(AtomicU64::new(0));
    let module = TaskModule::new("train_pair")
        .with_task(
            TaskDefinition::new("task_reconstruct", counting(&first))
                .component::<Encoder>("encoder")
                .component::<Decoder>("decoder")
                .batchless()
                .config(TaskConfig { iterations: Some(3), ..Default::default() }),
        )
        .with_task(
            TaskDefinition::new("task_encode", counting(&second))
                .component::<Encoder>("encoder")
                .batchless()
                .config(TaskConfig { iterations: Some(5), ..Default::default() }),
        );

    let registry = registry(module);
    let groups = registry.groups();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].label(), "Encoder+Decoder");

    let summary = run(registry, &temp).await.unwrap();
    assert_eq!(summary.rounds, 5);
    assert_eq!(first.load(Ordering::SeqCst), 3);
    assert_eq!(second.load(Ordering::SeqCst), 5);
    assert_eq!(summary.groups[0].training_steps, 8);
    assert_eq!(summary.groups[0].optimizer_steps, 5);
    assert_eq!(summary.checkpoints.len(), 2);
}

#[tokio::test]
async fn test_partial_overlap_trains_two_groups() {
    let temp = TempDir::new().unwrap();
    let module = TaskModule::new("train_overlap")
        .with_task(
            TaskDefinition::new("task_ab", |_| Ok(StepOutcome::Score(1.0)))
                .component::<Encoder>("encoder")
                .component::<Decoder>("decoder")
                .batchless()
                .config(TaskConfig { iterations: Some(2), ..Default::default() }),
        )
        .with_task(
            TaskDefinition::new("task_bc", |_| Ok(StepOutcome::Score(1.0)))
                .component::<Decoder>("decoder")
                .component::<Critic>("critic")
                .batchless()
                .config(TaskConfig { iterations: Some(4), ..Default::default() }),
        );

    let summary = run(registry(module), &temp).await.unwrap();
    assert_eq!(summary.groups.len(), 2);
    assert_eq!(summary.rounds, 4);
    assert_eq!(summary.groups[0].training_steps, 2);
    assert_eq!(summary.groups[1].training_steps, 4);
}

#[tokio::test]
async fn test_shared_component_steps_are_seen_by_later_groups() {
    let temp = TempDir::new().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let observed = Arc::clone(&seen);
    let sgd = TaskConfig {
        iterations: Some(3),
        learning_rate: Some(0.5),
        optimizer: Some(OptimizerKind::Sgd { momentum: 0.0 }),
        ..Default::default()
    };
    let push_decoder = |args: &mut tandem_training::TaskArgs<'_>| {
        args.with_component::<Decoder, _, _>("decoder", |d| {
            ScalarLoss::new(1.0).with_gradient(&d.weights, vec![1.0; 4])
        })
    };

    let module = TaskModule::new("train_overlap")
        .with_task(
            TaskDefinition::new("task_ab", move |args| Ok(StepOutcome::loss(push_decoder(args)?)))
                .component::<Encoder>("encoder")
                .component::<Decoder>("decoder")
                .batchless()
                .config(sgd.clone()),
        )
        .with_task(
            TaskDefinition::new("task_bc", move |args| {
                let first = |d: &mut Decoder| d.weights.value().data()[0];
                let weight = args.with_component::<Decoder, _, _>("decoder", first)?;
                observed.lock().unwrap().push(weight);
                Ok(StepOutcome::loss(push_decoder(args)?))
            })
            .component::<Decoder>("decoder")
            .component::<Critic>("critic")
            .batchless()
            .config(sgd),
        );

    let summary = run(registry(module), &temp).await.unwrap();
    assert_eq!(summary.groups.len(), 2);
    assert_eq!(summary.groups[0].group, "Encoder+Decoder");
    assert_eq!(summary.rounds, 3);
    // each round the second group sees the first group's step from the same round
    assert_eq!(*seen.lock().unwrap(), vec![-0.5, -1.5, -2.5]);
}

#[tokio::test]
async fn test_component_iterations_drive_training() {
    let temp = TempDir::new().unwrap();
    let calls = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&calls);
    let module = TaskModule::new("train_points")
        .with_task(
            TaskDefinition::new("task_fit", move |args| {
                counter.fetch_add(1, Ordering::SeqCst);
                fit_encoder(args)
            })
            .component::<Encoder>("encoder")
            .dataset::<Points>("batch")
            .config(TaskConfig { batch_size: Some(4), ..Default::default() }),
        )
        .with_component_config(
            "Encoder",
            ComponentConfig { iterations: Some(3), ..Default::default() },
        );

    let registry = registry(module);
    assert_eq!(registry.component_config(ComponentKey::of::<Encoder>()).iterations, Some(3));

    let summary = run(registry, &temp).await.unwrap();
    assert_eq!(summary.groups[0].training_steps, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_cancellation_finishes_the_round() {
    let temp = TempDir::new().unwrap();
    let token = CancellationToken::new();
    let calls_a = Arc::new(AtomicU64::new(0));
    let calls_b = Arc::new(AtomicU64::new(0));

    let trigger = token.clone();
    let counter_a = Arc::clone(&calls_a);
    let module = TaskModule::new("train_cancel")
        .with_task(
            TaskDefinition::new("task_a", move |args| {
                if counter_a.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                    trigger.cancel();
                }
                let loss = args.with_component::<Encoder, _, _>("encoder", |e| {
                    ScalarLoss::new(1.0).with_gradient(&e.weights, vec![1.0; 4])
                })?;
                Ok(StepOutcome::loss(loss))
            })
            .component::<Encoder>("encoder")
            .batchless()
            .config(TaskConfig { iterations: Some(100), ..Default::default() }),
        )
        .with_task(
            TaskDefinition::new("task_b", common::counting(&calls_b))
                .component::<Critic>("critic")
                .batchless()
                .config(TaskConfig { iterations: Some(100), ..Default::default() }),
        );

    let summary = Application::new(registry(module), settings(&temp)).run(token).await.unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.rounds, 3);
    assert_eq!(calls_a.load(Ordering::SeqCst), 3);
    assert_eq!(calls_b.load(Ordering::SeqCst), 3);
    assert!(summary.groups.iter().all(|g| g.cancelled));
    assert_eq!(summary.groups[0].optimizer_steps, 3);
    // both groups ran at least one round, so both are checkpointed
    assert_eq!(summary.checkpoints.len(), 2);
}

#[tokio::test]
async fn test_cancelled_before_start_saves_nothing() {
    let temp = TempDir::new().unwrap();
    let token = CancellationToken::new();
    token.cancel();
    let module = TaskModule::new("train_points").with_task(
        TaskDefinition::new("task_fit", fit_encoder)
            .component::<Encoder>("encoder")
            .dataset::<Points>("batch"),
    );
    let summary = Application::new(registry(module), settings(&temp)).run(token).await.unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.rounds, 0);
    assert!(summary.checkpoints.is_empty());
    assert!(!temp.path().join("models").exists());
}

#[tokio::test]
async fn test_no_tasks_has_no_side_effects() {
    let temp = TempDir::new().unwrap();
    let module = TaskModule::new("train_nothing")
        .with_task(TaskDefinition::new("show_nothing", |_| Ok(StepOutcome::Score(0.0))));
    let err = run(registry(module), &temp).await.unwrap_err();
    assert!(matches!(err, OrchestrationError::NoTasks));
    assert!(!temp.path().join("models").exists());
}

#[tokio::test]
async fn test_resume_restores_trained_weights() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(MemoryCheckpointStore::new());
    let module = || {
        TaskModule::new("train_points").with_task(
            TaskDefinition::new("task_fit", fit_encoder)
                .component::<Encoder>("encoder")
                .dataset::<Points>("batch")
                .config(TaskConfig { iterations: Some(3), ..Default::default() }),
        )
    };

    Application::new(registry(module()), settings(&temp))
        .with_store(store.clone())
        .run(CancellationToken::new())
        .await
        .unwrap();
    let first = store.load(&checkpoint_filename(ComponentKey::of::<Encoder>())).unwrap().unwrap();

    let resumed = registry(module());
    let components = resumed.create_components(Device::Cpu, Some(store.as_ref())).unwrap();
    let encoder = components.get(ComponentKey::of::<Encoder>()).unwrap();
    assert_eq!(lock_component(encoder).state().unwrap(), first);
}

#[tokio::test]
async fn test_validation_runs_on_held_out_rows() {
    let temp = TempDir::new().unwrap();
    let validated = Arc::new(AtomicU64::new(0));
    let seen = Arc::clone(&validated);
    let module = TaskModule::new("train_samples").with_task(
        TaskDefinition::new("task_fit", move |args| {
            let rows = args.batch("data_samples")?.samples();
            if !args.is_training() {
                seen.fetch_add(rows as u64, Ordering::SeqCst);
            }
            Ok(StepOutcome::Score(0.25))
        })
        .dataset::<Samples>("data_samples")
        .config(TaskConfig { batch_size: Some(6), epochs: Some(2), ..Default::default() }),
    );

    let summary = run(registry(module), &temp).await.unwrap();
    // 18 training rows -> 3 steps per epoch; 2 validation rows -> 1 step per epoch
    assert_eq!(summary.groups[0].training_steps, 6);
    assert_eq!(summary.groups[0].last_validation_loss, Some(0.25));
    assert_eq!(validated.load(Ordering::SeqCst), 2 * 6);
}

#[tokio::test]
async fn test_fs_source_drives_a_run() {
    let temp = TempDir::new().unwrap();
    let manifest = "[tasks.task_fit]\niterations = 2\n";
    std::fs::write(temp.path().join("train_points.toml"), manifest).unwrap();
    let catalog = ModuleCatalog::new().with(
        TaskModule::new("train_points").with_task(
            TaskDefinition::new("task_fit", fit_encoder)
                .component::<Encoder>("encoder")
                .dataset::<Points>("batch"),
        ),
    );

    let mut registry = Registry::new();
    registry.load(&FsTaskSource::new(temp.path(), catalog)).unwrap();
    let summary = run(registry, &temp).await.unwrap();
    assert_eq!(summary.rounds, 2);
}

#[tokio::test]
async fn test_entry_and_display_tasks_run_once() {
    let temp = TempDir::new().unwrap();
    let entry = Arc::new(AtomicU64::new(0));
    let display = Arc::new(AtomicU64::new(0));
    let module = TaskModule::new("train_points")
        .with_task(TaskDefinition::new("main_prepare", counting(&entry)))
        .with_task(
            TaskDefinition::new("task_fit", fit_encoder)
                .component::<Encoder>("encoder")
                .dataset::<Points>("batch")
                .config(TaskConfig { iterations: Some(4), ..Default::default() }),
        )
        .with_task(
            TaskDefinition::new("show_result", counting(&display))
                .component::<Encoder>("encoder")
                .dataset::<Points>("batch"),
        )
        .with_task(TaskDefinition::new("display_broken", |_| anyhow::bail!("no display")));

    let summary = run(registry(module), &temp).await.unwrap();
    assert_eq!(summary.rounds, 4);
    assert_eq!(entry.load(Ordering::SeqCst), 1);
    assert_eq!(display.load(Ordering::SeqCst), 1);
}
