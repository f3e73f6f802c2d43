#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use candle_core::{Error, Result, Tensor, D};
use rand::{
    distributions::{Distribution, WeightedIndex},
    SeedableRng,
};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    pub temperature: Option<f64>,
    pub top_k: Option<usize>,
    pub top_p: Option<f64>,
    /// Upper bound on generated tokens.
    pub max_new_tokens: Option<usize>,
    pub stop_token_ids: Vec<u32>,
    /// Token sequences that end generation when the output ends with one.
    pub stop_sequences: Vec<Vec<u32>>,
    pub seed: Option<u64>,
}

impl SamplingParams {
    pub fn greedy(max_new_tokens: usize) -> Self {
        Self {
            max_new_tokens: Some(max_new_tokens),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.temperature.is_some_and(|t| !t.is_finite() || t < 0.) {
            return Err("temperature must be a non-negative number".to_string());
        }
        if self.top_p.is_some_and(|p| !(0. ..=1.).contains(&p)) {
            return Err("top_p must lie in [0, 1]".to_string());
        }
        if self.max_new_tokens == Some(0) {
            return Err("max_new_tokens must be positive".to_string());
        }
        if self.stop_sequences.iter().any(Vec::is_empty) {
            return Err("stop sequences must not be empty".to_string());
        }
        Ok(())
    }
}

/// Sampler for sampling.
#[derive(Clone, Debug)]
pub struct Sampler {
    rng: rand::rngs::StdRng,
    temperature: Option<f64>,
    topk: usize,
    topp: f64,
}

impl Sampler {
    pub fn new(seed: u64, params: &SamplingParams) -> Self {
        let temperature = if params.temperature.map_or(true, |v| v < 1e-7) {
            None
        } else {
            params.temperature
        };
        Self {
            rng: rand::rngs::StdRng::seed_from_u64(params.seed.unwrap_or(seed)),
            temperature,
            topk: params.top_k.unwrap_or(0),
            topp: params.top_p.unwrap_or(1.),
        }
    }

    fn sample_argmax(&mut self, logits: &Tensor) -> Result<u32> {
        logits.argmax(D::Minus1)?.to_scalar::<u32>()
    }

    fn sample_multinomial(&mut self, probs: &[f32]) -> Result<u32> {
        let distr = WeightedIndex::new(probs).map_err(Error::wrap)?;
        // "Find the first item which has a weight *higher* than the chosen weight."
        let next_token = distr.sample(&mut self.rng);
        Ok(next_token as u32)
    }

    fn sample_topkp(&mut self, probs: &mut [f32]) -> Result<u32> {
        let mut argsort_indices = (0..probs.len()).collect::<Vec<_>>();
        // Sort by descending probability.
        argsort_indices.sort_unstable_by(|&i, &j| probs[j].total_cmp(&probs[i]));

        if self.topk > 0 {
            // Clamp smaller probabilities to zero.
            for &index in argsort_indices.iter().skip(self.topk) {
                probs[index] = 0.0;
            }
        }

        if self.topp <= 0.0 || self.topp >= 1.0 {
            return self.sample_multinomial(probs);
        }

        // top-p sampling (or "nucleus sampling") samples from the smallest set of
        // tokens that exceed probability top_p.
        let top_p = self.topp as f32;
        let mut cumsum = 0.;
        for &index in &argsort_indices {
            if cumsum >= top_p {
                probs[index] = 0.0;
            } else {
                cumsum += probs[index];
            }
        }
        self.sample_multinomial(probs)
    }

    /// Sample the next token from one row of logits.
    ///
    /// If the temperature is `None`, argmax sampling is used. With `top-p`
    /// sampling, if the `top-p` value is `<= 0.0` or `>= 1.0`, multinomial
    /// sampling is used.
    pub fn sample(&mut self, logits: &Tensor) -> Result<u32> {
        let logits = logits.flatten_all()?;
        match self.temperature {
            None => self.sample_argmax(&logits),
            Some(temperature) => {
                let logits = (&logits / temperature)?;
                let probs = candle_nn::ops::softmax_last_dim(&logits)?;
                let mut probs: Vec<f32> = probs.to_vec1()?;
                self.sample_topkp(&mut probs)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, Tensor};

    use super::*;

    #[test]
    fn test_argmax() {
        let mut sampler = Sampler::new(0, &SamplingParams::default());
        let logits = Tensor::arange(0f32, 1024f32, &Device::Cpu).unwrap();
        assert_eq!(sampler.sample(&logits).unwrap(), 1023);
    }

    #[test]
    fn test_top_k_one_is_greedy() {
        let params = SamplingParams {
            temperature: Some(0.8),
            top_k: Some(1),
            ..Default::default()
        };
        let mut sampler = Sampler::new(3, &params);
        let logits = Tensor::new(&[0.1f32, 2.5, 0.3, 1.0], &Device::Cpu).unwrap();
        for _ in 0..16 {
            assert_eq!(sampler.sample(&logits).unwrap(), 1);
        }
    }

    #[test]
    fn test_seeded_sampling_is_reproducible() {
        let params = SamplingParams {
            temperature: Some(1.0),
            seed: Some(42),
            ..Default::default()
        };
        let logits = Tensor::new(&[1f32, 1., 1., 1., 1., 1.], &Device::Cpu).unwrap();
        let draw = |mut s: Sampler| (0..8).map(|_| s.sample(&logits).unwrap()).collect::<Vec<_>>();
        assert_eq!(draw(Sampler::new(0, &params)), draw(Sampler::new(9, &params)));
    }

    #[test]
    fn test_params_validation() {
        assert!(SamplingParams::greedy(4).validate().is_ok());
        let bad = SamplingParams {
            top_p: Some(1.5),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        assert!(SamplingParams::greedy(0).validate().is_err());
    }
}
