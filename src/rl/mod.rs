//! Learning side of the pipeline
//!
//! Feature extraction, the decision engines, reward shaping, and the DQN
//! trainer with its replay buffer, value network and checkpoint loader.
//!
//! # Feature Flags
//! - `rl`: PyTorch-backed value network (requires libtorch). Without it the
//!   learned policy always falls back to HOLD and the trainer refuses to start;
//!   the rule ensemble and the rest of the pipeline are unaffected.

pub mod decision;
pub mod evaluator;
pub mod experience_buffer;
pub mod feature_extractor;
pub mod metrics;
pub mod model_loader;
pub mod q_network;
pub mod reward;
pub mod trainer;

pub use decision::{build_engine, DecisionEngine, DecisionResult, LearnedPolicy, RuleEnsemble};
pub use evaluator::{EvaluatorAgent, EvaluatorFeedback, TradeSample};
pub use experience_buffer::ReplayBuffer;
pub use feature_extractor::{build_features, FeatureContext, FeatureVector, FEATURE_COUNT, FEATURE_NAMES};
pub use metrics::{MetricsSnapshot, TrainingMetrics};
pub use model_loader::{ModelLoadError, ModelLoader};
pub use q_network::{Adam, LayerWeights, QNetwork};
pub use reward::{RewardBreakdown, RewardInput, RewardShaper};
pub use trainer::{DqnTrainer, MODEL_INPUT_DIM};
