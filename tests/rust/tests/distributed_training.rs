use anyhow::Result;
use data_shard::{DataLoader, DataLoaderAdapter, ShardContext, TensorDataset, WrapPolicy};
use ndarray::array;
use runtime_core::{resolve_rank, BackendKind, Error, RunnerConfig, TrainConfig, WorkerPlacement};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use trainer::testing::{Linear, MseLoss, Sgd};
use trainer::{Callback, Criterion, DefaultMainHooks, Module, OneOrMany, Optimizer, RunnerBuilder, TrainOptions};

fn linear_builder(config: RunnerConfig) -> RunnerBuilder {
    RunnerBuilder::new(config, TrainConfig::new().with("lr", 0.5))
        .model_creator(|_| Ok(OneOrMany::One(Box::new(Linear::filled(1, 1, 1.0, false)) as Box<dyn Module>)))
        .optimizer_creator(|_, config| {
            Ok(OneOrMany::One(Box::new(Sgd::new(config.require_f64("lr")?)) as Box<dyn Optimizer>))
        })
        .loss_creator(|_| Ok(Box::new(MseLoss) as Box<dyn Criterion>))
}

fn regression_loader() -> Result<DataLoader> {
    let features = array![[0.0f32], [0.0], [1.0], [1.0]].into_dyn();
    let labels = array![0.0f32, 0.0, 0.0, 0.0].into_dyn();
    let dataset = TensorDataset::new(vec![features, labels])?;
    Ok(DataLoader::new(Arc::new(dataset), 2)?)
}

fn local_cluster(world_size: usize) -> Result<Vec<String>> {
    (0..world_size)
        .map(|_| {
            let port = portpicker::pick_unused_port().ok_or_else(|| anyhow::anyhow!("no free port"))?;
            Ok(format!("127.0.0.1:{}", port))
        })
        .collect()
}

#[test]
fn test_two_worker_tcp_regression() -> Result<()> {
    runtime_core::telemetry::init_tracing("warn");

    // 1. Two workers on one host, joined over TCP
    let cluster_info = local_cluster(2)?;
    let task_addresses = vec!["127.0.0.1:7001".to_string(), "127.0.0.1:7002".to_string()];

    let handles: Vec<_> = (0..2)
        .map(|task_index| {
            let placement = WorkerPlacement {
                task_index,
                task_addresses: task_addresses.clone(),
                cluster_info: cluster_info.clone(),
            };
            thread::spawn(move || -> Result<(usize, f32, f32)> {
                let config = RunnerConfig {
                    backend: BackendKind::Tcp,
                    ..RunnerConfig::default()
                };
                let mut runner = linear_builder(config).build(&placement)?;

                // 2. Train two epochs
                let loader = regression_loader()?;
                let first = runner.train_epochs(&loader, 1, TrainOptions::default())?;
                assert_eq!(first[0].epoch, 1);
                let after_first = runner.models()[0].parameters()[0].value[[0, 0]];

                runner.train_epochs(&loader, 1, TrainOptions::default())?;
                let after_second = runner.models()[0].parameters()[0].value[[0, 0]];
                let rank = runner.rank();
                runner.shutdown()?;
                Ok((rank, after_first, after_second))
            })
        })
        .collect();

    // 3. Every worker holds the same weight: 0.5, then 0.25
    let mut ranks = BTreeSet::new();
    for handle in handles {
        let (rank, first, second) = handle.join().map_err(|_| anyhow::anyhow!("worker panicked"))??;
        assert!((first - 0.5).abs() < 1e-6, "rank {} weight after epoch 1: {}", rank, first);
        assert!((second - 0.25).abs() < 1e-6, "rank {} weight after epoch 2: {}", rank, second);
        ranks.insert(rank);
    }
    assert_eq!(ranks, BTreeSet::from([0, 1]));
    Ok(())
}

#[test]
fn test_rank_resolution_is_a_permutation() -> Result<()> {
    // Tasks placed on three hosts in a different order than the cluster info
    let task_addresses: Vec<String> = ["10.0.0.2:1", "10.0.0.1:1", "10.0.0.2:2", "10.0.0.12:1", "10.0.0.1:2"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let cluster_info: Vec<String> = ["10.0.0.1:5000", "10.0.0.12:5000", "10.0.0.2:5000", "10.0.0.1:5001", "10.0.0.2:5001"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    let ranks = (0..task_addresses.len())
        .map(|i| resolve_rank(i, &task_addresses, &cluster_info))
        .collect::<runtime_core::Result<Vec<_>>>()?;

    assert_eq!(ranks, vec![2, 0, 4, 1, 3]);
    let unique: BTreeSet<_> = ranks.iter().copied().collect();
    assert_eq!(unique, (0..5).collect());

    // A host missing from the cluster info cannot be placed
    let err = resolve_rank(0, &["10.0.0.9:1".to_string()], &cluster_info).unwrap_err();
    assert!(matches!(err, Error::RankResolution { .. }));
    Ok(())
}

#[test]
fn test_sharded_epoch_covers_dataset_once() -> Result<()> {
    let world_size = 3;
    let features = ndarray::Array::from_iter((0..10).map(|i| i as f32))
        .into_shape_with_order((10, 1))?
        .into_dyn();
    let labels = ndarray::Array1::<f32>::zeros(10).into_dyn();
    let dataset = TensorDataset::new(vec![features, labels])?;
    let loader = DataLoader::new(Arc::new(dataset), 2)?.with_shuffle(7);

    for epoch in 0..3 {
        let mut seen = Vec::new();
        for rank in 0..world_size {
            let local = DataLoaderAdapter::wrap(&loader, ShardContext { rank, world_size }, WrapPolicy::Auto)?;
            for batch in local.epoch(epoch) {
                seen.extend(batch?[0].iter().map(|v| *v as usize));
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>(), "epoch {}", epoch);
    }
    Ok(())
}

#[test]
fn test_second_main_callback_rejected() -> Result<()> {
    let builder = linear_builder(RunnerConfig::default()).callback(Callback::main(DefaultMainHooks))?;
    match builder.callback(Callback::main(DefaultMainHooks)) {
        Err(Error::DuplicateMainCallback { existing }) => assert_eq!(existing, "DefaultMainHooks"),
        Err(other) => anyhow::bail!("unexpected error: {}", other),
        Ok(_) => anyhow::bail!("second main callback was accepted"),
    }
    Ok(())
}
