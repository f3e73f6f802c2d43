use std::collections::HashMap;

use candle_core::{Result, Tensor};

mod registry;

pub use registry::{AdapterError, AdapterReadGuard, AdapterRegistry};

/// Identifier of a registered adapter. Requests carry `-1` on the wire for "none".
pub type AdapterId = i64;

pub type LoraMap = HashMap<String, Tensor>;

/// Low-rank deltas of one adapter: per layer, the `A` factors (`[rank, in]`)
/// and `B` factors (`[out, rank]`) keyed by target module name.
#[derive(Debug, Clone)]
pub struct AdapterWeights {
    a: Vec<LoraMap>,
    b: Vec<LoraMap>,
    scale: f64,
}

impl AdapterWeights {
    pub fn new(a: Vec<LoraMap>, b: Vec<LoraMap>) -> Self {
        Self { a, b, scale: 1. }
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn num_layers(&self) -> usize {
        self.a.len()
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn factors(&self, layer: usize, module: &str) -> Option<(&Tensor, &Tensor)> {
        let a = self.a.get(layer)?.get(module)?;
        let b = self.b.get(layer)?.get(module)?;
        Some((a, b))
    }

    /// `scale * x A^T B^T` for the given module, or `None` if the adapter does
    /// not target it.
    pub fn delta(&self, layer: usize, module: &str, x: &Tensor) -> Result<Option<Tensor>> {
        let Some((a, b)) = self.factors(layer, module) else {
            return Ok(None);
        };
        let down = x.matmul(&a.t()?)?;
        let up = down.matmul(&b.t()?)?;
        Ok(Some((up * self.scale)?))
    }

    /// The factor sets must line up layer by layer and key by key.
    pub(crate) fn check_shape(&self) -> std::result::Result<(), String> {
        if self.a.len() != self.b.len() {
            return Err(format!(
                "{} A layers but {} B layers",
                self.a.len(),
                self.b.len()
            ));
        }
        for (layer, (a, b)) in self.a.iter().zip(&self.b).enumerate() {
            if a.len() != b.len() || a.keys().any(|k| !b.contains_key(k)) {
                return Err(format!("layer {layer} targets different modules in A and B"));
            }
            for (name, a_t) in a {
                let b_t = &b[name];
                let (a_dims, b_dims) = (a_t.dims(), b_t.dims());
                if a_dims.len() != 2 || b_dims.len() != 2 || a_dims[0] != b_dims[1] {
                    return Err(format!(
                        "layer {layer} module {name}: A {a_dims:?} and B {b_dims:?} disagree on rank"
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, Tensor};

    use super::*;

    fn single(name: &str, t: Tensor) -> Vec<LoraMap> {
        vec![HashMap::from([(name.to_string(), t)])]
    }

    #[test]
    fn delta_is_low_rank_product() -> Result<()> {
        let dev = Device::Cpu;
        // rank 1, in 2, out 2
        let a = Tensor::from_vec(vec![1f32, 1.], (1, 2), &dev)?;
        let b = Tensor::from_vec(vec![2f32, 3.], (2, 1), &dev)?;
        let weights = AdapterWeights::new(single("proj", a), single("proj", b)).with_scale(0.5);
        let x = Tensor::from_vec(vec![1f32, 2.], (1, 2), &dev)?;
        let delta = weights.delta(0, "proj", &x)?.unwrap();
        assert_eq!(delta.to_vec2::<f32>()?, vec![vec![3., 4.5]]);
        assert!(weights.delta(0, "other", &x)?.is_none());
        Ok(())
    }

    #[test]
    fn mismatched_rank_is_rejected() -> Result<()> {
        let dev = Device::Cpu;
        let a = Tensor::zeros((2, 4), candle_core::DType::F32, &dev)?;
        let b = Tensor::zeros((4, 3), candle_core::DType::F32, &dev)?;
        let weights = AdapterWeights::new(single("proj", a), single("proj", b));
        assert!(weights.check_shape().is_err());
        Ok(())
    }

    #[test]
    fn layer_count_must_match() {
        let weights = AdapterWeights::new(vec![LoraMap::new()], vec![]);
        assert!(weights.check_shape().is_err());
    }
}
