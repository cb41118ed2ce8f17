use anyhow::Result;
use checkpoint::CheckpointManager;
use collective::LocalRendezvous;
use data_shard::{DataLoader, TensorDataset};
use runtime_core::{BackendKind, CheckpointConfig, Error, RunnerConfig, TrainConfig, WorkerPlacement};
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;
use trainer::testing::{Linear, MseLoss, Sgd, StepLr};
use trainer::{Criterion, LrScheduler, Module, OneOrMany, Optimizer, Runner, RunnerBuilder, TrainOptions};

fn single_worker(checkpoint: Option<CheckpointConfig>) -> Result<Runner> {
    let config = RunnerConfig {
        backend: BackendKind::Local,
        checkpoint,
        ..RunnerConfig::default()
    };
    let placement = WorkerPlacement {
        task_index: 0,
        task_addresses: vec!["127.0.0.1:7001".to_string()],
        cluster_info: vec!["127.0.0.1:29500".to_string()],
    };

    let runner = RunnerBuilder::new(config, TrainConfig::new().with("lr", 0.05).with("momentum", 0.9))
        .model_creator(|_| Ok(OneOrMany::One(Box::new(Linear::filled(2, 1, 0.5, true)) as Box<dyn Module>)))
        .optimizer_creator(|_, config| {
            let sgd = Sgd::with_momentum(config.require_f64("lr")?, config.require_f64("momentum")?);
            Ok(OneOrMany::One(Box::new(sgd) as Box<dyn Optimizer>))
        })
        .loss_creator(|_| Ok(Box::new(MseLoss) as Box<dyn Criterion>))
        .scheduler_creator(|_, _| Ok(OneOrMany::One(Box::new(StepLr::new(2, 0.5)) as Box<dyn LrScheduler>)))
        .local_rendezvous(LocalRendezvous::new(1))
        .build(&placement)?;
    Ok(runner)
}

fn loader() -> Result<DataLoader> {
    let features = ndarray::Array::from_iter((0..16).map(|i| (i % 5) as f32 * 0.25))
        .into_shape_with_order((8, 2))?
        .into_dyn();
    let labels = ndarray::Array::from_iter((0..8).map(|i| i as f32 * 0.1)).into_dyn();
    let dataset = TensorDataset::new(vec![features, labels])?;
    Ok(DataLoader::new(Arc::new(dataset), 3)?.with_shuffle(11))
}

fn weights(runner: &Runner) -> Vec<f32> {
    runner.models()[0]
        .parameters()
        .iter()
        .flat_map(|p| p.value.iter().copied())
        .collect()
}

fn checkpoint_config(dir: &Path, resume: bool) -> CheckpointConfig {
    let mut config = CheckpointConfig::new(dir.join("run-{epoch}"));
    config.resume = resume;
    config.keep_count = Some(1);
    config
}

#[test]
fn test_resume_matches_uninterrupted_run() -> Result<()> {
    let dir = tempdir()?;
    let data = loader()?;

    // 1. Reference run without interruption
    let mut reference = single_worker(None)?;
    reference.train_epochs(&data, 3, TrainOptions::default())?;

    // 2. Run two epochs, then drop the worker without shutting down
    {
        let mut crashed = single_worker(Some(checkpoint_config(dir.path(), false)))?;
        crashed.train_epochs(&data, 2, TrainOptions::default())?;
    }
    // keep_count = 1 removed the first periodic file once the second was published
    assert!(!dir.path().join("run-epoch=1.ckpt").exists());
    assert!(dir.path().join("run-epoch=2.ckpt").exists());

    // 3. Restart from last.ckpt and finish the third epoch
    let mut resumed = single_worker(Some(checkpoint_config(dir.path(), true)))?;
    resumed.resume_from_latest()?;
    assert_eq!(resumed.epochs(), 2);
    resumed.train_epochs(&data, 1, TrainOptions::default())?;

    assert_eq!(resumed.epochs(), reference.epochs());
    assert_eq!(resumed.global_step(), reference.global_step());
    assert_eq!(resumed.learning_rates(), reference.learning_rates());
    assert_eq!(weights(&resumed), weights(&reference));
    assert!(dir.path().join("run-epoch=3.ckpt").exists());
    Ok(())
}

#[test]
fn test_fresh_run_refuses_existing_checkpoints() -> Result<()> {
    let dir = tempdir()?;
    {
        let mut first = single_worker(Some(checkpoint_config(dir.path(), false)))?;
        first.train_epochs(&loader()?, 1, TrainOptions::default())?;
    }

    match single_worker(Some(checkpoint_config(dir.path(), false))) {
        Err(e) => match e.downcast_ref::<Error>() {
            Some(Error::CheckpointDirNotEmpty { .. }) => {}
            _ => anyhow::bail!("unexpected error: {}", e),
        },
        Ok(_) => anyhow::bail!("non-empty checkpoint directory was accepted"),
    }
    Ok(())
}

#[tokio::test]
async fn test_crash_before_publish_keeps_previous_checkpoint() -> Result<()> {
    let dir = tempdir()?;
    let mut manager = CheckpointManager::new(checkpoint_config(dir.path(), false))?;
    manager.preflight().await?;

    // 1. A complete save publishes last.ckpt
    manager.save(1, 10, b"epoch one").await?;

    // 2. The next file is written but the worker dies before publishing it
    let name = manager.checkpoint_name(2, 20);
    manager.write(&name, 2, 20, b"epoch two").await?;
    assert!(dir.path().join(&name).exists());

    // 3. Recovery still finds a loadable checkpoint
    let latest = CheckpointManager::latest_checkpoint(dir.path())?;
    let loaded = CheckpointManager::load(&latest).await?;
    assert_eq!(loaded.header.epoch, 1);
    assert_eq!(loaded.header.step, 10);
    assert_eq!(&loaded.payload[..], b"epoch one");
    Ok(())
}

#[test]
fn test_truncated_checkpoint_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    {
        let mut runner = single_worker(Some(checkpoint_config(dir.path(), false)))?;
        runner.train_epochs(&loader()?, 1, TrainOptions::default())?;
    }

    let last = dir.path().join("last.ckpt");
    let bytes = std::fs::read(&last)?;
    std::fs::write(&last, &bytes[..bytes.len() / 2])?;

    let mut runner = single_worker(Some(checkpoint_config(dir.path(), true)))?;
    match runner.resume_from_latest() {
        Err(Error::CheckpointCorrupted { .. }) => {}
        Err(other) => anyhow::bail!("unexpected error: {}", other),
        Ok(path) => anyhow::bail!("truncated {} was accepted", path.display()),
    }
    assert_eq!(runner.epochs(), 0);
    Ok(())
}

#[test]
fn test_missing_checkpoint_is_fatal() -> Result<()> {
    let dir = tempdir()?;
    match CheckpointManager::latest_checkpoint(dir.path()) {
        Err(Error::NoCheckpointForRecovery { path }) => assert!(path.ends_with("last.ckpt")),
        other => anyhow::bail!("unexpected result: {:?}", other),
    }
    Ok(())
}
