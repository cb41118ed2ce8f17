//! Per-worker training runner
//!
//! The runner joins the process group, builds the training components,
//! drives epochs through the [`TrainingOperator`] and persists state through
//! the [`CheckpointManager`]. It is single-threaded: collectives and
//! checkpoint I/O block on the runner's current-thread runtime.

use crate::callbacks::{Callback, CallbackRegistry};
use crate::distributed::{broadcast_parameters, DistributedModel, DistributedOptimizer};
use crate::factory::{ComponentFactory, Components, CreatorResult, OneOrMany};
use crate::metrics::{EpochStats, Metric, ValidationStats, WeightedMean, NUM_SAMPLES, TRAIN_LOSS, VAL_LOSS};
use crate::nn::{Criterion, Module};
use crate::operator::TrainingOperator;
use crate::optim::{LrScheduler, Optimizer};
use crate::state::{ModelWeights, StateSerializer, StateSnapshot};
use checkpoint::CheckpointManager;
use collective::{GroupInitializer, LocalRendezvous, ProcessGroupHandle, ReduceOp};
use data_shard::{DataLoader, DataLoaderAdapter, ShardContext, WrapPolicy};
use runtime_core::{
    CheckpointMetadata, CheckpointType, Epoch, Error, Info, Rank, Result, RunnerConfig,
    RuntimeHandle, RuntimeManager, Step, SyncMode, Tensor, TimerCollection, TrainConfig,
    WorkerPlacement, SCHEDULER_STEP,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Options of [`Runner::train_epochs`] and [`Runner::train_epoch`]
#[derive(Debug, Clone, Default)]
pub struct TrainOptions {
    /// Attach timer statistics to the returned stats
    pub profile: bool,
    /// Side-channel values handed to every hook
    pub info: Info,
}

/// Options of [`Runner::validate`]
#[derive(Debug, Clone, Default)]
pub struct ValidateOptions {
    /// Stop after this many batches
    pub num_steps: Option<usize>,
    pub profile: bool,
    pub info: Info,
}

/// Collects everything a [`Runner`] needs before joining the group
pub struct RunnerBuilder {
    config: RunnerConfig,
    train_config: TrainConfig,
    factory: ComponentFactory,
    callbacks: CallbackRegistry,
    metrics: Vec<Box<dyn Metric>>,
    wrap_policy: WrapPolicy,
    local_rendezvous: Option<Arc<LocalRendezvous>>,
    runtime: Option<RuntimeHandle>,
}

impl RunnerBuilder {
    pub fn new(config: RunnerConfig, train_config: TrainConfig) -> Self {
        Self {
            config,
            train_config,
            factory: ComponentFactory::new(),
            callbacks: CallbackRegistry::new(),
            metrics: Vec::new(),
            wrap_policy: WrapPolicy::default(),
            local_rendezvous: None,
            runtime: None,
        }
    }

    pub fn model_creator<F>(mut self, creator: F) -> Self
    where
        F: Fn(&TrainConfig) -> CreatorResult<OneOrMany<Box<dyn Module>>> + Send + 'static,
    {
        self.factory = self.factory.model_creator(creator);
        self
    }

    pub fn optimizer_creator<F>(mut self, creator: F) -> Self
    where
        F: Fn(&[Box<dyn Module>], &TrainConfig) -> CreatorResult<OneOrMany<Box<dyn Optimizer>>>
            + Send
            + 'static,
    {
        self.factory = self.factory.optimizer_creator(creator);
        self
    }

    pub fn loss_creator<F>(mut self, creator: F) -> Self
    where
        F: Fn(&TrainConfig) -> CreatorResult<Box<dyn Criterion>> + Send + 'static,
    {
        self.factory = self.factory.loss_creator(creator);
        self
    }

    pub fn scheduler_creator<F>(mut self, creator: F) -> Self
    where
        F: Fn(&[Box<dyn Optimizer>], &TrainConfig) -> CreatorResult<OneOrMany<Box<dyn LrScheduler>>>
            + Send
            + 'static,
    {
        self.factory = self.factory.scheduler_creator(creator);
        self
    }

    /// Register a callback; a second main callback is rejected
    pub fn callback(mut self, callback: Callback) -> Result<Self> {
        self.callbacks.register(callback)?;
        Ok(self)
    }

    pub fn metric(mut self, metric: impl Metric + 'static) -> Self {
        self.metrics.push(Box::new(metric));
        self
    }

    pub fn wrap_policy(mut self, policy: WrapPolicy) -> Self {
        self.wrap_policy = policy;
        self
    }

    /// In-process rendezvous for the `local` backend
    pub fn local_rendezvous(mut self, rendezvous: Arc<LocalRendezvous>) -> Self {
        self.local_rendezvous = Some(rendezvous);
        self
    }

    /// Share an existing runtime instead of creating one
    pub fn runtime(mut self, runtime: RuntimeHandle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Resolve this worker's rank, join the group and build the runner
    #[instrument(skip(self, placement), fields(task_index = placement.task_index))]
    pub fn build(mut self, placement: &WorkerPlacement) -> Result<Runner> {
        let rank = placement.resolve_rank()?;
        let world_size = placement.world_size();
        let url = placement.rendezvous_url()?;
        let runtime = match self.runtime.take() {
            Some(runtime) => runtime,
            None => RuntimeManager::shared()?,
        };

        let mut initializer = GroupInitializer::new(
            self.config.backend,
            self.config.network.clone(),
            Arc::clone(&runtime),
        );
        if let Some(rendezvous) = self.local_rendezvous.take() {
            initializer = initializer.with_local_rendezvous(rendezvous);
        }

        info!(rank, world_size, url = %url, backend = %self.config.backend, "Joining process group");
        let group = initializer.init(&url, rank, world_size)?;
        self.build_with_group(group, runtime)
    }

    /// Build the runner on an already joined group
    pub fn build_with_group(self, group: ProcessGroupHandle, runtime: RuntimeHandle) -> Result<Runner> {
        let rank = group.rank();
        let sync_mode = self.config.sync_mode;

        let mut components = self.factory.build(&self.train_config, sync_mode)?;
        match sync_mode {
            SyncMode::Replicated => {
                components.models = components
                    .models
                    .into_iter()
                    .map(|model| {
                        DistributedModel::wrap(model, Arc::clone(&group))
                            .map(|m| Box::new(m) as Box<dyn Module>)
                    })
                    .collect::<Result<_>>()?;
            }
            SyncMode::Optimizer => {
                for model in components.models.iter_mut() {
                    broadcast_parameters(group.as_ref(), &mut model.parameters_mut())?;
                }
                components.optimizers = components
                    .optimizers
                    .into_iter()
                    .map(|o| Box::new(DistributedOptimizer::wrap(o, Arc::clone(&group))) as Box<dyn Optimizer>)
                    .collect();
            }
        }

        let checkpoints = match &self.config.checkpoint {
            Some(cfg) => {
                let manager = CheckpointManager::new(cfg.clone())?;
                // rank 0 owns the directory; everyone learns whether it is usable
                let failure = if rank == 0 {
                    runtime.block_on(manager.preflight()).err()
                } else {
                    None
                };
                let mut flag: [f32; 1] = [if failure.is_some() { 1.0 } else { 0.0 }];
                group.all_reduce(&mut flag, ReduceOp::Max)?;
                if let Some(e) = failure {
                    return Err(e);
                }
                if flag[0] > 0.0 {
                    return Err(Error::config("checkpoint directory rejected by rank 0"));
                }
                Some(manager)
            }
            None => None,
        };

        info!(
            rank,
            world_size = group.world_size(),
            models = components.models.len(),
            optimizers = components.optimizers.len(),
            schedulers = components.schedulers.len(),
            sync_mode = ?sync_mode,
            "Runner ready"
        );

        Ok(Runner {
            config: self.config,
            train_config: self.train_config,
            group,
            runtime,
            components,
            operator: TrainingOperator::new(self.callbacks),
            metrics: self.metrics,
            timers: TimerCollection::new(),
            checkpoints,
            wrap_policy: self.wrap_policy,
            epochs: 0,
        })
    }
}

/// Training runner of one worker
pub struct Runner {
    config: RunnerConfig,
    train_config: TrainConfig,
    group: ProcessGroupHandle,
    runtime: RuntimeHandle,
    components: Components,
    operator: TrainingOperator,
    metrics: Vec<Box<dyn Metric>>,
    timers: TimerCollection,
    checkpoints: Option<CheckpointManager>,
    wrap_policy: WrapPolicy,
    epochs: Epoch,
}

impl Runner {
    pub fn rank(&self) -> Rank {
        self.group.rank()
    }

    pub fn world_size(&self) -> usize {
        self.group.world_size()
    }

    /// Completed training epochs
    pub fn epochs(&self) -> Epoch {
        self.epochs
    }

    pub fn global_step(&self) -> Step {
        self.operator.global_step()
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn train_config(&self) -> &TrainConfig {
        &self.train_config
    }

    pub fn models(&self) -> &[Box<dyn Module>] {
        &self.components.models
    }

    pub fn learning_rates(&self) -> Vec<f64> {
        self.components.learning_rates()
    }

    pub fn checkpoint_manager(&self) -> Option<&CheckpointManager> {
        self.checkpoints.as_ref()
    }

    fn is_root(&self) -> bool {
        self.rank() == 0
    }

    /// This rank's view of `loader`, according to the wrap policy
    pub fn shard_loader(&self, loader: &DataLoader) -> Result<DataLoader> {
        let ctx = ShardContext {
            rank: self.rank(),
            world_size: self.world_size(),
        };
        DataLoaderAdapter::wrap(loader, ctx, self.wrap_policy)
    }

    fn set_profiling(&mut self, profile: bool) {
        if profile {
            self.timers.enable();
            self.timers.reset();
        } else {
            self.timers.disable();
        }
    }

    fn epoch_info(&self, info: &Info) -> Info {
        let mut info = info.clone();
        info.insert(
            SCHEDULER_STEP.to_string(),
            serde_json::Value::from(self.config.scheduler_step.as_str()),
        );
        info
    }

    /// Fail on every rank if the workers would run different batch counts
    fn agree_on_batches(&self, loader: &DataLoader) -> Result<()> {
        let local = loader.num_batches().map(|n| n as f64).unwrap_or(-1.0);
        // max of the count and of its negation gives both bounds in one round
        let mut bounds = [local, -local];
        self.group.all_reduce_f64(&mut bounds, ReduceOp::Max)?;
        let (max, min) = (bounds[0], -bounds[1]);
        if min != max {
            return Err(Error::UnevenBatches {
                min: min as i64,
                max: max as i64,
            });
        }
        Ok(())
    }

    /// Combine `values` across workers when stats are synced.
    ///
    /// Sample counts are summed, every other value is averaged.
    fn sync_values(&self, values: &mut BTreeMap<String, f64>) -> Result<()> {
        if !self.config.sync_stats {
            return Ok(());
        }
        let (counts, others): (Vec<_>, Vec<_>) = values
            .iter()
            .partition(|(name, _)| name.as_str() == NUM_SAMPLES);
        let mut counts: Vec<f64> = counts.into_iter().map(|(_, v)| *v).collect();
        let mut others: Vec<f64> = others.into_iter().map(|(_, v)| *v).collect();
        self.group.all_reduce_f64(&mut counts, ReduceOp::Sum)?;
        self.group.all_reduce_f64(&mut others, ReduceOp::Mean)?;

        let (mut counts, mut others) = (counts.into_iter(), others.into_iter());
        for (name, value) in values.iter_mut() {
            let reduced = if name == NUM_SAMPLES { counts.next() } else { others.next() };
            if let Some(reduced) = reduced {
                *value = reduced;
            }
        }
        Ok(())
    }

    fn checkpoint_payload(&self, kind: CheckpointType) -> Result<Vec<u8>> {
        match kind {
            CheckpointType::Full => self.snapshot().to_bytes(),
            CheckpointType::ModelOnly => StateSerializer::capture_weights(self.epochs, &self.components).to_bytes(),
        }
    }

    /// Train `num_epochs` epochs over this rank's share of `loader`
    #[instrument(skip(self, loader, options), fields(rank = self.rank()))]
    pub fn train_epochs(&mut self, loader: &DataLoader, num_epochs: u64, options: TrainOptions) -> Result<Vec<EpochStats>> {
        let loader = self.shard_loader(loader)?;
        let info = self.epoch_info(&options.info);

        self.operator
            .begin_train(&self.components, self.epochs, &info)?;

        let mut results = Vec::with_capacity(num_epochs as usize);
        for _ in 0..num_epochs {
            let stats = self.train_epoch(&loader, options.clone())?;
            if self.is_root() {
                info!(epoch = stats.epoch, metrics = ?stats.metrics, "Finished training epoch");
            }
            results.push(stats);
        }

        self.operator
            .end_train(&self.components, self.epochs, &info)?;

        if self.is_root() && self.checkpoints.is_some() {
            let kind = self.checkpoints.as_ref().map(|m| m.checkpoint_type()).unwrap_or(CheckpointType::Full);
            let payload = self.checkpoint_payload(kind)?;
            let (epoch, step) = (self.epochs, self.global_step());
            if let Some(manager) = self.checkpoints.as_mut() {
                self.runtime.block_on(manager.save_last(epoch, step, &payload))?;
            }
        }
        Ok(results)
    }

    /// Train one epoch over `loader` exactly as given
    pub fn train_epoch(&mut self, loader: &DataLoader, options: TrainOptions) -> Result<EpochStats> {
        self.set_profiling(options.profile);
        let info = self.epoch_info(&options.info);
        self.agree_on_batches(loader)?;

        let epoch = self.epochs;
        let root = self.is_root();
        let kind = self.checkpoints.as_ref().map(|m| m.checkpoint_type());
        let mut loss = WeightedMean::default();

        self.operator.begin_epoch(&self.components, epoch, &info)?;
        {
            let _epoch_timer = self.timers.record("train_epoch");
            for (batch_idx, batch) in loader.epoch(epoch).enumerate() {
                let _batch_timer = self.timers.record("batch");
                let batch = batch?;
                let outcome = self.operator.train_batch(
                    &mut self.components,
                    &batch,
                    batch_idx,
                    epoch,
                    &info,
                    &self.timers,
                )?;
                loss.add(outcome.loss as f64, outcome.num_samples);

                let step = self.operator.global_step();
                let due = self.checkpoints.as_ref().is_some_and(|m| m.should_save_step(step));
                if root && due {
                    let payload = self.checkpoint_payload(kind.unwrap_or(CheckpointType::Full))?;
                    if let Some(manager) = self.checkpoints.as_mut() {
                        self.runtime.block_on(manager.save(epoch, step, &payload))?;
                    }
                }
            }
        }
        self.operator.end_epoch(&mut self.components, epoch, &info)?;
        self.epochs += 1;

        let mut metrics = BTreeMap::from([
            (TRAIN_LOSS.to_string(), loss.mean()),
            (NUM_SAMPLES.to_string(), loss.weight() as f64),
        ]);
        self.sync_values(&mut metrics)?;

        let due = self.checkpoints.as_ref().is_some_and(|m| m.should_save_epoch(self.epochs));
        if root && due {
            let payload = self.checkpoint_payload(kind.unwrap_or(CheckpointType::Full))?;
            let (epochs, step) = (self.epochs, self.global_step());
            if let Some(manager) = self.checkpoints.as_mut() {
                self.runtime.block_on(manager.save(epochs, step, &payload))?;
            }
        }

        debug!(epoch = self.epochs, step = self.global_step(), "Epoch complete");
        Ok(EpochStats {
            epoch: self.epochs,
            metrics,
            profile: options.profile.then(|| self.timers.stats()),
        })
    }

    /// Evaluate over this rank's share of `loader`
    #[instrument(skip(self, loader, options), fields(rank = self.rank()))]
    pub fn validate(&mut self, loader: &DataLoader, options: ValidateOptions) -> Result<ValidationStats> {
        let loader = self.shard_loader(loader)?;
        self.set_profiling(options.profile);
        let info = self.epoch_info(&options.info);
        for metric in self.metrics.iter_mut() {
            metric.reset();
        }

        let limit = options.num_steps.unwrap_or(usize::MAX);
        let mut loss = WeightedMean::default();
        for (batch_idx, batch) in loader.epoch(self.epochs).take(limit).enumerate() {
            let _timer = self.timers.record("validation");
            let batch = batch?;
            let outcome = self
                .operator
                .validate_batch(&mut self.components, &batch, batch_idx, &info)?;
            loss.add(outcome.loss as f64, outcome.num_samples);

            let targets = batch.last().map(std::slice::from_ref).unwrap_or_default();
            for metric in self.metrics.iter_mut() {
                metric.update(&outcome.outputs, targets)?;
            }
        }

        let mut metrics = BTreeMap::from([
            (VAL_LOSS.to_string(), loss.mean()),
            (NUM_SAMPLES.to_string(), loss.weight() as f64),
        ]);
        for metric in &self.metrics {
            metrics.insert(metric.name().to_string(), metric.compute());
        }
        self.sync_values(&mut metrics)?;
        let num_samples = metrics.remove(NUM_SAMPLES).map(|n| n as usize).unwrap_or_default();

        Ok(ValidationStats {
            num_samples,
            metrics,
            profile: options.profile.then(|| self.timers.stats()),
        })
    }

    /// Model outputs for every batch of `loader`, used as given
    pub fn predict(&mut self, loader: &DataLoader, num_steps: Option<usize>) -> Result<Vec<Vec<Tensor>>> {
        let limit = num_steps.unwrap_or(usize::MAX);
        let mut outputs = Vec::new();
        for batch in loader.epoch(self.epochs).take(limit) {
            let _timer = self.timers.record("predict");
            let batch = batch?;
            outputs.push(self.operator.predict_batch(&mut self.components, &batch)?);
        }
        Ok(outputs)
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSerializer::capture(self.epochs, &self.operator, &self.components)
    }

    pub fn restore(&mut self, snapshot: &StateSnapshot) -> Result<()> {
        self.epochs = StateSerializer::apply(snapshot, &mut self.operator, &mut self.components)?;
        Ok(())
    }

    pub fn state_bytes(&self) -> Result<Vec<u8>> {
        self.snapshot().to_bytes()
    }

    pub fn load_state_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let snapshot = StateSnapshot::from_bytes(bytes)?;
        self.restore(&snapshot)
    }

    /// Save a checkpoint now; only rank 0 writes
    pub fn save_checkpoint(&mut self) -> Result<Option<CheckpointMetadata>> {
        let kind = self
            .checkpoints
            .as_ref()
            .map(|m| m.checkpoint_type())
            .ok_or_else(|| Error::config("checkpointing is not configured"))?;
        if !self.is_root() {
            return Ok(None);
        }
        let payload = self.checkpoint_payload(kind)?;
        let (epoch, step) = (self.epochs, self.global_step());
        match self.checkpoints.as_mut() {
            Some(manager) => Ok(Some(self.runtime.block_on(manager.save(epoch, step, &payload))?)),
            None => Ok(None),
        }
    }

    /// Restore from a checkpoint file
    #[instrument(skip(self, path), fields(rank = self.rank(), path = %path.as_ref().display()))]
    pub fn load_checkpoint<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let loaded = self.runtime.block_on(CheckpointManager::load(path.as_ref()))?;
        match loaded.header.checkpoint_type {
            CheckpointType::Full => self.load_state_bytes(&loaded.payload)?,
            CheckpointType::ModelOnly => {
                let weights = ModelWeights::from_bytes(&loaded.payload)?;
                self.epochs = StateSerializer::apply_weights(&weights, &mut self.components)?;
                warn!("Checkpoint holds model weights only; optimizer state starts fresh");
            }
        }
        info!(epoch = self.epochs, step = self.global_step(), "Checkpoint restored");
        Ok(())
    }

    /// Restore from `last.ckpt` in the configured checkpoint directory
    pub fn resume_from_latest(&mut self) -> Result<PathBuf> {
        let dir = self
            .checkpoints
            .as_ref()
            .map(|m| m.dir().to_path_buf())
            .ok_or_else(|| Error::config("checkpointing is not configured"))?;
        let path = CheckpointManager::latest_checkpoint(&dir)?;
        self.load_checkpoint(&path)?;
        Ok(path)
    }

    /// Notify observers and leave the group
    pub fn shutdown(mut self) -> Result<()> {
        self.operator.shutdown()?;
        info!(rank = self.rank(), epochs = self.epochs, "Runner shut down");
        Ok(())
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("rank", &self.rank())
            .field("world_size", &self.world_size())
            .field("epochs", &self.epochs)
            .field("global_step", &self.global_step())
            .field("main", &self.operator.main_name())
            .finish()
    }
}
