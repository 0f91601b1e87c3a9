//! DQN trainer
//!
//! Consumes experiences from the durable queue into a replay buffer and runs
//! gradient steps against a policy/target network pair. The target network is
//! hard-synced every `target_sync_interval` steps and the policy is written to
//! the shared checkpoint every `save_interval` steps.
//!
//! Training needs the `rl` feature; without it [`DqnTrainer::new`] fails.

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::experience_buffer::ReplayBuffer;
use super::feature_extractor::FEATURE_COUNT;
use super::metrics::TrainingMetrics;
use super::model_loader::{argmax, load_or_fresh};
use super::q_network::{Adam, QNetwork};
use crate::config::{ModelConfig, TrainerConfig};
use crate::queue::{Popped, QueueStore};
use crate::shutdown::Shutdown;
use crate::types::{Experience, Signal};

/// Model input width: features plus trade size
pub const MODEL_INPUT_DIM: usize = FEATURE_COUNT + 1;

/// Transition in model-input form, ready for a batch
#[derive(Debug, Clone, PartialEq)]
struct Transition {
    state: Vec<f32>,
    action: usize,
    reward: f32,
    next_state: Vec<f32>,
    done: bool,
}

/// Append the trade size to a state one short of the model width
fn model_state(state: &[f32], quantity: f64, input_dim: usize) -> Option<Vec<f32>> {
    let mut out = state.to_vec();
    if out.len() + 1 == input_dim {
        out.push(quantity as f32);
    }
    (out.len() == input_dim && out.iter().all(|v| v.is_finite())).then_some(out)
}

pub struct DqnTrainer {
    config: TrainerConfig,
    model: ModelConfig,
    policy: QNetwork,
    target: QNetwork,
    optimizer: Adam,
    buffer: ReplayBuffer,
    rng: StdRng,
    epsilon: f64,
    metrics: TrainingMetrics,
}

impl DqnTrainer {
    /// Resume from the checkpoint when it matches, otherwise start fresh
    pub fn new(config: &TrainerConfig, model: &ModelConfig, seed: u64) -> Result<Self> {
        let policy = load_or_fresh(model, MODEL_INPUT_DIM, seed).context("building policy network")?;
        let target = policy.try_clone().context("building target network")?;
        let optimizer = Adam::new(config.learning_rate, &policy)?;
        Ok(Self {
            config: config.clone(),
            model: model.clone(),
            buffer: ReplayBuffer::new(config.replay_capacity),
            rng: StdRng::seed_from_u64(seed),
            epsilon: config.epsilon_start,
            metrics: TrainingMetrics::default(),
            policy,
            target,
            optimizer,
        })
    }

    pub fn policy(&self) -> &QNetwork {
        &self.policy
    }

    pub fn target(&self) -> &QNetwork {
        &self.target
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn metrics(&self) -> &TrainingMetrics {
        &self.metrics
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// Validate an experience and add it to the replay buffer. Experiences
    /// whose width does not fit the model are dropped.
    pub fn ingest(&mut self, exp: Experience) -> bool {
        let dim = self.policy.input_dim();
        let fits = model_state(&exp.state, exp.quantity, dim).is_some()
            && model_state(&exp.next_state, exp.quantity, dim).is_some()
            && exp.reward.is_finite();
        if !fits {
            warn!(
                "[TRAIN] Dropping experience: state width {} / {} does not fit model input {}",
                exp.state.len(),
                exp.next_state.len(),
                dim
            );
            self.metrics.record_dropped();
            return false;
        }
        self.metrics.record_experience(exp.signal(), exp.reward);
        self.buffer.push(exp);
        true
    }

    fn sample_batch(&mut self) -> Vec<Transition> {
        let dim = self.policy.input_dim();
        self.buffer
            .sample(self.config.batch_size, &mut self.rng)
            .into_iter()
            .filter_map(|exp| {
                Some(Transition {
                    state: model_state(&exp.state, exp.quantity, dim)?,
                    action: exp.signal().action_index(),
                    reward: exp.reward,
                    next_state: model_state(&exp.next_state, exp.quantity, dim)?,
                    done: exp.done,
                })
            })
            .collect()
    }

    /// One gradient step; None until the buffer holds enough experiences
    pub fn train_step(&mut self) -> Option<f32> {
        let warmup = self.config.train_after.max(self.config.batch_size);
        if !self.buffer.ready(warmup) {
            return None;
        }

        let batch = self.sample_batch();
        if batch.is_empty() {
            return None;
        }
        let gamma = self.config.gamma;
        let targets: Vec<f32> = batch
            .iter()
            .map(|t| {
                let next_max = self
                    .target
                    .forward(&t.next_state)
                    .into_iter()
                    .fold(f32::NEG_INFINITY, f32::max);
                let bootstrap = if t.done || !next_max.is_finite() { 0.0 } else { gamma * next_max };
                t.reward + bootstrap
            })
            .collect();
        let states: Vec<Vec<f32>> = batch.iter().map(|t| t.state.clone()).collect();
        let actions: Vec<usize> = batch.iter().map(|t| t.action).collect();

        let loss = self.policy.train_batch(&states, &actions, &targets, &mut self.optimizer);
        self.metrics.record_step(loss);
        self.epsilon = (self.epsilon * self.config.epsilon_decay).max(self.config.epsilon_min);

        let step = self.metrics.total_steps;
        if step % self.config.target_sync_interval == 0 {
            match self.target.copy_from(&self.policy) {
                Ok(()) => {
                    self.metrics.target_syncs += 1;
                    debug!("[TRAIN] Target network synced at step {}", step);
                }
                Err(e) => warn!("[TRAIN] Target sync failed at step {}: {:#}", step, e),
            }
        }
        if step % self.config.save_interval == 0 {
            self.save_checkpoint();
        }
        Some(loss)
    }

    /// Write the policy to the shared checkpoint; failures are logged
    pub fn save_checkpoint(&mut self) -> bool {
        match self.policy.save(&self.model.path) {
            Ok(()) => {
                self.metrics.checkpoints_saved += 1;
                info!(
                    "[MODEL] Checkpoint saved to {} (step {})",
                    self.model.path.display(),
                    self.metrics.total_steps
                );
                true
            }
            Err(e) => {
                warn!("[MODEL] Checkpoint save failed: {:#}", e);
                false
            }
        }
    }

    /// Epsilon-greedy choice over the policy network, for exploratory rollouts
    pub fn explore_action(&mut self, state: &[f32]) -> Signal {
        if self.rng.gen::<f64>() < self.epsilon {
            let idx = self.rng.gen_range(0..Signal::ACTION_SPACE.len());
            return Signal::ACTION_SPACE[idx];
        }
        model_state(state, crate::config::DEFAULT_TRADE_SIZE, self.policy.input_dim())
            .and_then(|input| argmax(&self.policy.forward(&input)))
            .and_then(Signal::from_index)
            .unwrap_or(Signal::Hold)
    }

    fn log_progress(&self) {
        let snap = self.metrics.snapshot();
        info!(
            "[TRAIN] step={} exp={} dropped={} buffer={}/{} loss={} avg_reward={:+.5} eps={:.3} mix={:?}",
            snap.total_steps,
            snap.total_experiences,
            snap.dropped_experiences,
            self.buffer.len(),
            self.buffer.capacity(),
            snap.avg_loss.map(|l| format!("{:.5}", l)).unwrap_or_else(|| "-".to_string()),
            snap.avg_reward,
            self.epsilon,
            snap.action_distribution
        );
        info!("[TRAIN] {}", self.metrics.readiness_status());
    }

    /// Consume the queue until cancelled. An empty queue or a store error
    /// sleeps briefly and retries.
    pub async fn run(&mut self, store: Arc<QueueStore>, queue_key: &str, shutdown: Shutdown) -> Result<()> {
        let idle = Duration::from_millis(self.config.idle_sleep_ms);
        info!(
            "[TRAIN] Consuming '{}' (batch={}, warmup={}, capacity={})",
            queue_key, self.config.batch_size, self.config.train_after, self.config.replay_capacity
        );

        while !shutdown.is_triggered() {
            let popped = match store.pop_experience(queue_key) {
                Ok(p) => p,
                Err(e) => {
                    warn!("[QUEUE] Pop failed: {:#}", e);
                    Popped::Empty
                }
            };
            match popped {
                Popped::Experience(exp) => {
                    if self.ingest(exp) {
                        for _ in 0..self.config.train_steps_per_experience {
                            let before = self.metrics.total_steps;
                            if self.train_step().is_none() {
                                break;
                            }
                            if before / self.config.log_interval.max(1)
                                != self.metrics.total_steps / self.config.log_interval.max(1)
                            {
                                self.log_progress();
                            }
                        }
                    }
                    tokio::task::yield_now().await;
                }
                Popped::Malformed => self.metrics.record_dropped(),
                Popped::Empty => {
                    tokio::select! {
                        _ = shutdown.wait() => break,
                        _ = tokio::time::sleep(idle) => {}
                    }
                }
            }
        }

        info!("[TRAIN] Stopping after {} steps", self.metrics.total_steps);
        if self.metrics.total_steps > 0 {
            self.save_checkpoint();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn configs(path: PathBuf) -> (TrainerConfig, ModelConfig) {
        let trainer = TrainerConfig {
            batch_size: 8,
            train_after: 16,
            replay_capacity: 64,
            target_sync_interval: 5,
            save_interval: 10,
            ..Default::default()
        };
        let model = ModelConfig { path, hidden_layers: vec![16], refresh_interval_secs: 0 };
        (trainer, model)
    }

    fn exp(i: usize, done: bool) -> Experience {
        let state: Vec<f32> = (0..FEATURE_COUNT).map(|j| ((i + j) % 7) as f32 / 7.0).collect();
        Experience {
            next_state: state.iter().map(|v| v * 0.5).collect(),
            state,
            action: [1, -1, 0][i % 3],
            reward: if i % 3 == 0 { 0.5 } else { -0.1 },
            done,
            quantity: 0.001,
        }
    }

    #[test]
    fn test_model_state_pads_one_short() {
        let state = exp(2, false).state;
        let padded = model_state(&state, 0.001, MODEL_INPUT_DIM).unwrap();
        assert_eq!(padded.len(), MODEL_INPUT_DIM);
        assert_eq!(padded[FEATURE_COUNT], 0.001);
        assert!(model_state(&state[..3], 0.001, MODEL_INPUT_DIM).is_none());
        assert!(model_state(&[f32::NAN; FEATURE_COUNT], 0.001, MODEL_INPUT_DIM).is_none());
    }

    #[cfg(not(feature = "rl"))]
    #[test]
    fn test_trainer_requires_rl_feature() {
        let dir = tempfile::tempdir().unwrap();
        let (t, m) = configs(dir.path().join("model.safetensors"));
        let err = DqnTrainer::new(&t, &m, 7).err().unwrap();
        assert!(format!("{:#}", err).contains("rl"));
    }

    #[cfg(feature = "rl")]
    #[test]
    fn test_warmup_before_training() {
        let dir = tempfile::tempdir().unwrap();
        let (t, m) = configs(dir.path().join("model.safetensors"));
        let mut trainer = DqnTrainer::new(&t, &m, 7).unwrap();
        for i in 0..15 {
            assert!(trainer.ingest(exp(i, false)));
        }
        assert_eq!(trainer.train_step(), None);
        trainer.ingest(exp(15, true));
        assert!(trainer.train_step().is_some());
    }

    #[cfg(feature = "rl")]
    #[test]
    fn test_wrong_width_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (t, m) = configs(dir.path().join("model.safetensors"));
        let mut trainer = DqnTrainer::new(&t, &m, 7).unwrap();
        let mut bad = exp(0, false);
        bad.state.truncate(3);
        assert!(!trainer.ingest(bad));
        assert_eq!(trainer.buffer_len(), 0);
        assert_eq!(trainer.metrics().dropped_experiences, 1);

        // full width including the trade size is accepted as is
        let mut full = exp(1, false);
        full.state.push(0.001);
        full.next_state.push(0.001);
        assert!(trainer.ingest(full));
    }

    #[cfg(feature = "rl")]
    #[test]
    fn test_sync_save_and_epsilon_decay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let (t, m) = configs(path.clone());
        let mut trainer = DqnTrainer::new(&t, &m, 3).unwrap();
        for i in 0..32 {
            trainer.ingest(exp(i, i % 10 == 9));
        }
        for _ in 0..10 {
            trainer.train_step().unwrap();
        }
        assert_eq!(trainer.metrics().target_syncs, 2);
        assert_eq!(trainer.metrics().checkpoints_saved, 1);
        assert!(path.exists());
        assert!(trainer.epsilon() < t.epsilon_start);

        let probe = model_state(&exp(0, false).state, 0.001, MODEL_INPUT_DIM).unwrap();
        assert_eq!(trainer.policy().forward(&probe), trainer.target().forward(&probe));

        // a restarted trainer resumes from the checkpoint
        let resumed = DqnTrainer::new(&t, &m, 99).unwrap();
        assert_eq!(resumed.policy().forward(&probe), trainer.policy().forward(&probe));
    }

    #[cfg(feature = "rl")]
    #[test]
    fn test_epsilon_floor_and_greedy_action() {
        let dir = tempfile::tempdir().unwrap();
        let (mut t, m) = configs(dir.path().join("model.safetensors"));
        t.epsilon_start = 0.0;
        t.epsilon_min = 0.0;
        let mut trainer = DqnTrainer::new(&t, &m, 5).unwrap();
        let state = exp(0, false).state;
        let first = trainer.explore_action(&state);
        assert_eq!(trainer.explore_action(&state), first);
    }

    #[cfg(feature = "rl")]
    #[tokio::test]
    async fn test_run_consumes_queue_until_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let (t, m) = configs(dir.path().join("model.safetensors"));
        let store = Arc::new(QueueStore::open_in_memory().unwrap());
        for i in 0..20 {
            store.push_experience("exp", &exp(i, false)).unwrap();
        }
        store.push("exp", "garbage").unwrap();

        let mut trainer = DqnTrainer::new(&t, &m, 1).unwrap();
        let shutdown = Shutdown::new();
        let stopper = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            stopper.trigger();
        });
        trainer.run(store.clone(), "exp", shutdown).await.unwrap();

        assert_eq!(store.len("exp").unwrap(), 0);
        assert_eq!(trainer.buffer_len(), 20);
        assert_eq!(trainer.metrics().dropped_experiences, 1);
        assert!(trainer.metrics().total_steps > 0);
    }
}
