//! Action-value network
//!
//! A small fully connected ReLU network mapping a state vector to one Q-value
//! per action (BUY, SELL, HOLD). Weights are exchanged between the trainer and
//! the live policy as a safetensors file with PyTorch-style `net.{i}.weight`
//! / `net.{i}.bias` keys, weight shape `[out, in]`; linear layers sit at even
//! indices as in an `nn.Sequential` with interleaved ReLUs.
//!
//! # Feature Flags
//! - `rl`: the network runs on libtorch through `tch`.
//!
//! Without the `rl` feature a stub is compiled that refuses to build or load a
//! network. The checkpoint codec below works either way, so checkpoints can
//! still be inspected and validated.

use anyhow::{Context, Result};
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;
use std::fs;
use std::path::Path;

use super::model_loader::ModelLoadError;

/// One dense layer as stored in a checkpoint; `weight` is row-major
/// `[out_dim, in_dim]`
#[derive(Debug, Clone, PartialEq)]
pub struct LayerWeights {
    pub in_dim: usize,
    pub out_dim: usize,
    pub weight: Vec<f32>,
    pub bias: Vec<f32>,
}

/// `net.{i}.{kind}` → `i`
pub(crate) fn layer_index(name: &str, kind: &str) -> Option<usize> {
    let rest = name.strip_prefix("net.")?;
    let (idx, suffix) = rest.split_once('.')?;
    if suffix != kind {
        return None;
    }
    idx.parse().ok()
}

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn bytes_f32(data: &[u8]) -> Vec<f32> {
    data.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

pub fn checkpoint_bytes(layers: &[LayerWeights]) -> Result<Vec<u8>> {
    let buffers: Vec<(String, Vec<usize>, Vec<u8>)> = layers
        .iter()
        .enumerate()
        .flat_map(|(i, l)| {
            [
                (format!("net.{}.weight", 2 * i), vec![l.out_dim, l.in_dim], f32_bytes(&l.weight)),
                (format!("net.{}.bias", 2 * i), vec![l.out_dim], f32_bytes(&l.bias)),
            ]
        })
        .collect();

    let mut views = Vec::with_capacity(buffers.len());
    for (name, shape, data) in &buffers {
        let view = TensorView::new(Dtype::F32, shape.clone(), data)
            .with_context(|| format!("building tensor {}", name))?;
        views.push((name.clone(), view));
    }
    safetensors::serialize(views, &None).context("serializing checkpoint")
}

/// Write the checkpoint through a temp file and rename, so readers never
/// see a partial file.
pub fn write_checkpoint(path: &Path, layers: &[LayerWeights]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let bytes = checkpoint_bytes(layers)?;
    let tmp = path.with_extension("safetensors.tmp");
    fs::write(&tmp, bytes).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

/// Decode and validate the layer chain of a checkpoint
pub fn parse_layers(bytes: &[u8]) -> Result<Vec<LayerWeights>, ModelLoadError> {
    let tensors =
        SafeTensors::deserialize(bytes).map_err(|e| ModelLoadError::Format(e.to_string()))?;

    let mut indices: Vec<usize> = tensors
        .names()
        .iter()
        .filter_map(|name| layer_index(name, "weight"))
        .collect();
    indices.sort_unstable();
    if indices.is_empty() {
        return Err(ModelLoadError::NoInputLayer);
    }

    let mut layers: Vec<LayerWeights> = Vec::with_capacity(indices.len());
    for (pos, idx) in indices.into_iter().enumerate() {
        if idx != 2 * pos {
            return Err(ModelLoadError::Architecture(format!(
                "net.{}.weight where net.{}.weight was expected",
                idx,
                2 * pos
            )));
        }
        let w = tensors
            .tensor(&format!("net.{}.weight", idx))
            .map_err(|e| ModelLoadError::Format(e.to_string()))?;
        let b = tensors
            .tensor(&format!("net.{}.bias", idx))
            .map_err(|_| ModelLoadError::Architecture(format!("missing net.{}.bias", idx)))?;

        if w.dtype() != Dtype::F32 || b.dtype() != Dtype::F32 {
            return Err(ModelLoadError::Format(format!("layer {} is not f32", idx)));
        }
        let (out_dim, in_dim) = match w.shape() {
            [o, i] => (*o, *i),
            other => {
                return Err(ModelLoadError::Architecture(format!(
                    "net.{}.weight has shape {:?}",
                    idx, other
                )))
            }
        };
        if b.shape() != [out_dim] {
            return Err(ModelLoadError::Architecture(format!(
                "net.{}.bias has shape {:?}, expected [{}]",
                idx,
                b.shape(),
                out_dim
            )));
        }
        if let Some(prev) = layers.last().map(|l| l.out_dim) {
            if prev != in_dim {
                return Err(ModelLoadError::Architecture(format!(
                    "net.{} expects {} inputs but previous layer emits {}",
                    idx, in_dim, prev
                )));
            }
        }

        layers.push(LayerWeights {
            in_dim,
            out_dim,
            weight: bytes_f32(w.data()),
            bias: bytes_f32(b.data()),
        });
    }
    Ok(layers)
}

// ============================================================================
// libtorch implementation (requires "rl" feature)
// ============================================================================

#[cfg(feature = "rl")]
pub mod torch_impl {
    use super::*;
    use std::fmt;
    use tch::{nn, nn::OptimizerConfig, Device, Reduction, Tensor};

    pub struct QNetwork {
        vs: nn::VarStore,
        net: nn::Sequential,
        /// input, hidden..., output
        dims: Vec<usize>,
    }

    impl fmt::Debug for QNetwork {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("QNetwork").field("dims", &self.dims).finish()
        }
    }

    impl QNetwork {
        pub fn new(input_dim: usize, hidden: &[usize], output_dim: usize) -> Result<Self> {
            let mut dims = Vec::with_capacity(hidden.len() + 2);
            dims.push(input_dim);
            dims.extend_from_slice(hidden);
            dims.push(output_dim);

            let vs = nn::VarStore::new(Device::Cpu);
            let net = {
                let root = vs.root() / "net";
                let last = dims.len() - 2;
                let mut net = nn::seq();
                for (i, d) in dims.windows(2).enumerate() {
                    let linear = nn::linear(&root / (2 * i), d[0] as i64, d[1] as i64, Default::default());
                    net = net.add(linear);
                    if i < last {
                        net = net.add_fn(|x| x.relu());
                    }
                }
                net
            };
            Ok(Self { vs, net, dims })
        }

        /// Fresh network with libtorch's generator seeded first
        pub fn seeded(input_dim: usize, hidden: &[usize], output_dim: usize, seed: u64) -> Result<Self> {
            tch::manual_seed(seed as i64);
            Self::new(input_dim, hidden, output_dim)
        }

        pub fn input_dim(&self) -> usize {
            self.dims[0]
        }

        pub fn output_dim(&self) -> usize {
            self.dims[self.dims.len() - 1]
        }

        /// Hidden layer widths, used to compare architectures
        pub fn hidden_dims(&self) -> Vec<usize> {
            self.dims[1..self.dims.len() - 1].to_vec()
        }

        /// Q-values for one state; empty when the width does not match
        pub fn forward(&self, x: &[f32]) -> Vec<f32> {
            if x.len() != self.input_dim() {
                return Vec::new();
            }
            let out = tch::no_grad(|| {
                Tensor::from_slice(x)
                    .reshape(&[1, x.len() as i64])
                    .apply(&self.net)
            });
            Vec::<f32>::try_from(out.flatten(0, -1)).unwrap_or_default()
        }

        /// Hard copy of another network's weights (target sync)
        pub fn copy_from(&mut self, other: &QNetwork) -> Result<()> {
            self.vs.copy(&other.vs).context("copying network weights")
        }

        pub fn try_clone(&self) -> Result<Self> {
            Ok(Self::from_layers(&self.layers()?)?)
        }

        /// One optimizer step on the mean squared error between Q(s, a) and
        /// the target, for the taken action only. Returns the batch loss.
        pub fn train_batch(
            &mut self,
            states: &[Vec<f32>],
            actions: &[usize],
            targets: &[f32],
            optimizer: &mut Adam,
        ) -> f32 {
            let batch = states.len();
            if batch == 0 {
                return 0.0;
            }
            let flat: Vec<f32> = states.iter().flat_map(|s| s.iter().copied()).collect();
            let xs = Tensor::from_slice(&flat).reshape(&[batch as i64, self.input_dim() as i64]);
            let actions: Vec<i64> = actions.iter().map(|&a| a as i64).collect();
            let actions = Tensor::from_slice(&actions).unsqueeze(-1);
            let targets = Tensor::from_slice(targets);

            let q = xs.apply(&self.net).gather(1, &actions, false).squeeze_dim(-1);
            let loss = q.mse_loss(&targets, Reduction::Mean);
            optimizer.opt.backward_step(&loss);
            loss.double_value(&[]) as f32
        }

        /// Current weights in checkpoint layout
        pub fn layers(&self) -> Result<Vec<LayerWeights>> {
            let vars = self.vs.variables();
            self.dims
                .windows(2)
                .enumerate()
                .map(|(i, d)| {
                    let fetch = |kind: &str| -> Result<Vec<f32>> {
                        let name = format!("net.{}.{}", 2 * i, kind);
                        let t = vars.get(&name).with_context(|| format!("missing {}", name))?;
                        Vec::<f32>::try_from(t.detach().flatten(0, -1))
                            .with_context(|| format!("reading {}", name))
                    };
                    Ok(LayerWeights {
                        in_dim: d[0],
                        out_dim: d[1],
                        weight: fetch("weight")?,
                        bias: fetch("bias")?,
                    })
                })
                .collect()
        }

        pub fn from_layers(layers: &[LayerWeights]) -> Result<Self, ModelLoadError> {
            let (Some(first), Some(last)) = (layers.first(), layers.last()) else {
                return Err(ModelLoadError::NoInputLayer);
            };
            let hidden: Vec<usize> = layers[..layers.len() - 1].iter().map(|l| l.out_dim).collect();
            let net = Self::new(first.in_dim, &hidden, last.out_dim)
                .map_err(|e| ModelLoadError::Backend(e.to_string()))?;

            let vars = net.vs.variables();
            for (i, layer) in layers.iter().enumerate() {
                let params = [
                    ("weight", &layer.weight, vec![layer.out_dim as i64, layer.in_dim as i64]),
                    ("bias", &layer.bias, vec![layer.out_dim as i64]),
                ];
                for (kind, data, shape) in params {
                    let name = format!("net.{}.{}", 2 * i, kind);
                    let target = vars
                        .get(&name)
                        .ok_or_else(|| ModelLoadError::Architecture(format!("missing {}", name)))?;
                    let source = Tensor::from_slice(data).reshape(shape.as_slice());
                    let mut target = target.shallow_clone();
                    tch::no_grad(|| {
                        let _ = target.copy_(&source);
                    });
                }
            }
            Ok(net)
        }

        pub fn save(&self, path: &Path) -> Result<()> {
            write_checkpoint(path, &self.layers()?)
        }

        pub fn from_safetensors(bytes: &[u8]) -> Result<Self, ModelLoadError> {
            Self::from_layers(&parse_layers(bytes)?)
        }
    }

    /// Adam over every parameter of a [`QNetwork`]
    pub struct Adam {
        opt: nn::Optimizer,
    }

    impl Adam {
        pub fn new(lr: f32, net: &QNetwork) -> Result<Self> {
            let opt = nn::Adam::default()
                .build(&net.vs, lr as f64)
                .context("building Adam optimizer")?;
            Ok(Self { opt })
        }
    }
}

// ============================================================================
// Stub implementation (when "rl" feature is disabled)
// ============================================================================

#[cfg(not(feature = "rl"))]
pub mod stub_impl {
    use super::*;
    use anyhow::anyhow;

    const DISABLED: &str = "value network needs the `rl` feature (libtorch): build with --features rl";

    /// Stub network; every constructor fails
    #[derive(Debug)]
    pub struct QNetwork {
        dims: Vec<usize>,
    }

    impl QNetwork {
        pub fn new(_input_dim: usize, _hidden: &[usize], _output_dim: usize) -> Result<Self> {
            Err(anyhow!(DISABLED))
        }

        pub fn seeded(input_dim: usize, hidden: &[usize], output_dim: usize, _seed: u64) -> Result<Self> {
            Self::new(input_dim, hidden, output_dim)
        }

        pub fn input_dim(&self) -> usize {
            self.dims.first().copied().unwrap_or(0)
        }

        pub fn output_dim(&self) -> usize {
            self.dims.last().copied().unwrap_or(0)
        }

        pub fn hidden_dims(&self) -> Vec<usize> {
            self.dims
                .get(1..self.dims.len().saturating_sub(1))
                .map(|s| s.to_vec())
                .unwrap_or_default()
        }

        pub fn forward(&self, _x: &[f32]) -> Vec<f32> {
            Vec::new()
        }

        pub fn copy_from(&mut self, _other: &QNetwork) -> Result<()> {
            Err(anyhow!(DISABLED))
        }

        pub fn try_clone(&self) -> Result<Self> {
            Err(anyhow!(DISABLED))
        }

        pub fn train_batch(
            &mut self,
            _states: &[Vec<f32>],
            _actions: &[usize],
            _targets: &[f32],
            _optimizer: &mut Adam,
        ) -> f32 {
            0.0
        }

        pub fn layers(&self) -> Result<Vec<LayerWeights>> {
            Err(anyhow!(DISABLED))
        }

        pub fn from_layers(_layers: &[LayerWeights]) -> Result<Self, ModelLoadError> {
            Err(ModelLoadError::Backend(DISABLED.to_string()))
        }

        pub fn save(&self, _path: &Path) -> Result<()> {
            Err(anyhow!(DISABLED))
        }

        /// Validates the file so format errors still surface as such
        pub fn from_safetensors(bytes: &[u8]) -> Result<Self, ModelLoadError> {
            Self::from_layers(&parse_layers(bytes)?)
        }
    }

    pub struct Adam {
        _private: (),
    }

    impl Adam {
        pub fn new(_lr: f32, _net: &QNetwork) -> Result<Self> {
            Err(anyhow!(DISABLED))
        }
    }
}

#[cfg(feature = "rl")]
pub use torch_impl::{Adam, QNetwork};

#[cfg(not(feature = "rl"))]
pub use stub_impl::{Adam, QNetwork};

/// Deterministic layer chain for checkpoint fixtures
#[cfg(test)]
pub(crate) fn test_layers(dims: &[usize], seed: u64) -> Vec<LayerWeights> {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let mut rng = StdRng::seed_from_u64(seed);
    dims.windows(2)
        .map(|d| {
            let bound = 1.0 / (d[0] as f32).sqrt();
            LayerWeights {
                in_dim: d[0],
                out_dim: d[1],
                weight: (0..d[0] * d[1]).map(|_| rng.gen_range(-bound..bound)).collect(),
                bias: (0..d[1]).map(|_| rng.gen_range(-bound..bound)).collect(),
            }
        })
        .collect()
}
