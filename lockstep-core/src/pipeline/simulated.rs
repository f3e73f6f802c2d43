use candle_core::{bail, Device, Result, Tensor};

use super::{ModelInputs, ModelOutputs, ShardedModel};
use crate::lora::AdapterReadGuard;

/// Adapter module the simulated model applies its deltas to.
pub const HIDDEN_MODULE: &str = "hidden";

/// A deterministic stand-in for a vocab-sharded transformer.
///
/// The hidden state of an entry is a pseudo-random function of its last token
/// and that token's position, plus the feature row embedded at that token, if
/// any, and the delta of its adapter. The output head is sharded by vocabulary
/// columns, and every logit is reduced in the same order on every shard, so gathering
/// the shards of N replicas reproduces the single-replica logits bit for bit.
#[derive(Debug, Clone)]
pub struct SimulatedModel {
    vocab_size: usize,
    hidden_size: usize,
    seed: u64,
}

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Uniform in `[-1, 1)`.
fn unit(seed: u64, a: u64, b: u64, c: u64) -> f32 {
    let h = splitmix64(seed ^ splitmix64(a ^ splitmix64(b ^ splitmix64(c))));
    ((h >> 40) as f32 / (1u64 << 24) as f32) * 2. - 1.
}

impl SimulatedModel {
    pub fn new(vocab_size: usize, hidden_size: usize, seed: u64) -> Self {
        Self {
            vocab_size,
            hidden_size,
            seed,
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    fn hidden_states(&self, inputs: &ModelInputs) -> Result<Vec<f32>> {
        let tokens = inputs.tokens();
        let h = self.hidden_size;
        let mut hidden = vec![0f32; inputs.batch_size() * h];
        for (i, row) in hidden.chunks_mut(h).enumerate() {
            let span = inputs.span(i);
            let token = tokens[span.end - 1];
            if token < 0 || token as usize >= self.vocab_size {
                bail!(
                    "token {token} is outside the vocabulary of {}",
                    self.vocab_size
                );
            }
            let pos = inputs.last_position(i) as u64;
            for (k, v) in row.iter_mut().enumerate() {
                *v = unit(self.seed, token as u64, pos, k as u64);
            }
            if let Some(mm) = &inputs.multimodal {
                let dim = mm.features.shape().get(1).copied().unwrap_or(0);
                let locs = mm.feature_locs.as_i32().unwrap_or_default();
                let features = mm.features.as_f32().unwrap_or_default();
                // Only a feature placed at the output position counts, so the
                // result does not depend on how a prefix is split across passes.
                for (r, &loc) in locs.iter().enumerate() {
                    if loc < 0 || loc as usize != span.end - 1 {
                        continue;
                    }
                    if dim != h {
                        bail!("feature dim {dim} does not match hidden size {h}");
                    }
                    for (v, f) in row.iter_mut().zip(&features[r * dim..(r + 1) * dim]) {
                        *v += f;
                    }
                }
            }
        }
        Ok(hidden)
    }

    fn apply_adapters(
        &self,
        inputs: &ModelInputs,
        adapters: &[AdapterReadGuard],
        hidden: &mut [f32],
    ) -> Result<()> {
        let h = self.hidden_size;
        for (i, row) in hidden.chunks_mut(h).enumerate() {
            let Some(id) = inputs.lora_id(i) else {
                continue;
            };
            let Ok(at) = adapters.binary_search_by_key(&id, |g| g.id()) else {
                bail!("adapter {id} was not acquired for this pass");
            };
            let x = Tensor::from_slice(row, (1, h), &Device::Cpu)?;
            if let Some(delta) = adapters[at].weights().delta(0, HIDDEN_MODULE, &x)? {
                let delta = delta.flatten_all()?.to_vec1::<f32>()?;
                for (v, d) in row.iter_mut().zip(delta) {
                    *v += d;
                }
            }
        }
        Ok(())
    }
}

impl ShardedModel for SimulatedModel {
    fn forward(
        &self,
        inputs: &ModelInputs,
        adapters: &[AdapterReadGuard],
        rank: usize,
        world_size: usize,
    ) -> Result<ModelOutputs> {
        if world_size == 0 || self.vocab_size % world_size != 0 {
            bail!(
                "vocab size {} cannot be split across {world_size} replicas",
                self.vocab_size
            );
        }
        let batch = inputs.batch_size();
        let h = self.hidden_size;
        let mut hidden = self.hidden_states(inputs)?;
        self.apply_adapters(inputs, adapters, &mut hidden)?;

        let shard = self.vocab_size / world_size;
        let first_col = rank * shard;
        let head: Vec<f32> = (0..h)
            .flat_map(|k| {
                (first_col..first_col + shard)
                    .map(move |col| unit(!self.seed, k as u64, col as u64, 0))
            })
            .collect();
        let mut logits = vec![0f32; batch * shard];
        for (row, out) in hidden.chunks(h).zip(logits.chunks_mut(shard)) {
            for (j, logit) in out.iter_mut().enumerate() {
                *logit = row
                    .iter()
                    .enumerate()
                    .fold(0f32, |acc, (k, x)| acc + x * head[k * shard + j]);
            }
        }
        if let Some(bad) = logits.iter().find(|l| !l.is_finite()) {
            bail!("non-finite logit {bad}");
        }
        Ok(ModelOutputs {
            logits: Tensor::from_vec(logits, (batch, shard), &Device::Cpu)?,
            hidden_states: Tensor::from_vec(hidden, (batch, h), &Device::Cpu)?,
        })
    }
}
