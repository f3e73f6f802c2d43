use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use candle_core::{DType, Tensor};

use crate::lora::AdapterId;
use crate::sampler::SamplingParams;

pub type RequestId = usize;

/// Shared cancellation flag of one request. Cloning yields a handle to the
/// same flag.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Embedded feature rows that replace placeholder tokens of the prompt,
/// starting at prompt index `position`.
#[derive(Clone, Debug, PartialEq)]
pub struct MultimodalFeature {
    position: usize,
    rows: usize,
    dim: usize,
    data: Vec<f32>,
}

impl MultimodalFeature {
    /// `features` must be a `[rows, dim]` tensor.
    pub fn new(position: usize, features: &Tensor) -> candle_core::Result<Self> {
        let (rows, dim) = features.dims2()?;
        let data = features.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        Ok(Self {
            position,
            rows,
            dim,
            data,
        })
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.dim..(i + 1) * self.dim]
    }
}

pub struct Request {
    pub tokens: Vec<u32>,
    pub sampling_params: SamplingParams,
    pub adapter_id: Option<AdapterId>,
    pub multimodal: Vec<MultimodalFeature>,
    pub cancel: CancelHandle,
}

impl Request {
    pub fn new(tokens: Vec<u32>, sampling_params: SamplingParams) -> Self {
        Self {
            tokens,
            sampling_params,
            adapter_id: None,
            multimodal: Vec::new(),
            cancel: CancelHandle::new(),
        }
    }

    pub fn with_adapter(mut self, id: AdapterId) -> Self {
        self.adapter_id = Some(id);
        self
    }

    pub fn with_feature(mut self, feature: MultimodalFeature) -> Self {
        self.multimodal.push(feature);
        self
    }

    /// Check everything that does not depend on engine state.
    pub fn validate(&self, feature_dim: Option<usize>) -> Result<(), String> {
        if self.tokens.is_empty() {
            return Err("prompt must not be empty".to_string());
        }
        if let Some(t) = self.tokens.iter().find(|&&t| i32::try_from(t).is_err()) {
            return Err(format!("token {t} does not fit the wire format"));
        }
        if let Some(id) = self.adapter_id {
            if id < 0 || i32::try_from(id).is_err() {
                return Err(format!("adapter id {id} is out of range"));
            }
        }
        self.sampling_params.validate()?;
        let mut covered = vec![false; self.tokens.len()];
        for feature in &self.multimodal {
            match feature_dim {
                None => return Err("multimodal features are not enabled".to_string()),
                Some(dim) if dim != feature.dim() => {
                    return Err(format!(
                        "feature dim {} does not match the configured {dim}",
                        feature.dim()
                    ))
                }
                Some(_) => {}
            }
            let end = feature.position() + feature.rows();
            if feature.rows() == 0 || end > self.tokens.len() {
                return Err(format!(
                    "feature rows {}..{end} fall outside the prompt",
                    feature.position()
                ));
            }
            for slot in &mut covered[feature.position()..end] {
                if std::mem::replace(slot, true) {
                    return Err("multimodal features overlap".to_string());
                }
            }
        }
        Ok(())
    }
}

impl Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Request {{ tokens: {}, adapter: {:?}, features: {}, sampling_params: {:?} }}",
            self.tokens.len(),
            self.adapter_id,
            self.multimodal.len(),
            self.sampling_params
        )
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    #[test]
    fn cancel_handle_is_shared() {
        let handle = CancelHandle::new();
        let other = handle.clone();
        assert!(!other.is_cancelled());
        handle.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn validation() {
        let ok = Request::new(vec![1, 2, 3], SamplingParams::greedy(4));
        assert!(ok.validate(None).is_ok());
        assert!(Request::new(vec![], SamplingParams::default())
            .validate(None)
            .is_err());
        assert!(Request::new(vec![u32::MAX], SamplingParams::default())
            .validate(None)
            .is_err());
        assert!(Request::new(vec![1], SamplingParams::default())
            .with_adapter(-3)
            .validate(None)
            .is_err());
    }

    #[test]
    fn feature_placement_is_checked() {
        let rows = Tensor::zeros((2, 4), DType::F32, &Device::Cpu).unwrap();
        let feature = MultimodalFeature::new(1, &rows).unwrap();
        let req = Request::new(vec![0; 4], SamplingParams::default()).with_feature(feature.clone());
        assert!(req.validate(Some(4)).is_ok());
        assert!(req.validate(None).is_err());
        assert!(req.validate(Some(8)).is_err());

        let late = MultimodalFeature::new(3, &rows).unwrap();
        let req = Request::new(vec![0; 4], SamplingParams::default()).with_feature(late);
        assert!(req.validate(Some(4)).is_err());

        let req = Request::new(vec![0; 4], SamplingParams::default())
            .with_feature(feature.clone())
            .with_feature(feature);
        assert!(req.validate(Some(4)).is_err());
    }
}
