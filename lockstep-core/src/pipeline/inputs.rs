use std::ops::Range;

use candle_core::Tensor;

use crate::distributed::{BufferDType, HostBuffer, OptionalFields};
use crate::lora::AdapterId;
use crate::paged_attention::BlockId;
use crate::request::MultimodalFeature;

/// Sentinel for "no adapter" and for block-table padding.
pub const NONE_ID: i32 = -1;

/// Embedded features of the prefill entries in a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct MultimodalInputs {
    /// `[num_tokens]`, 1 where the slot holds a text token, 0 for a feature row.
    pub text_tokens_mask: HostBuffer,
    /// `[rows]`, index into the combined token stream of each feature row.
    pub feature_locs: HostBuffer,
    /// `[rows, dim]`
    pub features: HostBuffer,
}

/// One forward batch. Decode entries come first, then prefill entries; all
/// per-token buffers are concatenated in that order.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInputs {
    /// `[num_tokens]`
    pub combo_tokens: HostBuffer,
    /// `[batch]`, tokens fed this iteration per entry.
    pub input_lengths: HostBuffer,
    /// `[decode_count]`, tokens already cached per decode entry.
    pub sequence_lengths: HostBuffer,
    /// `[batch, max_blocks_per_seq]`, padded with -1.
    pub kv_cache_offsets: HostBuffer,
    /// `[batch]`, index of the last token of each entry in `combo_tokens`.
    pub lm_output_indexes: HostBuffer,
    pub combo_position_ids: Option<HostBuffer>,
    /// `[batch]`, -1 for entries without an adapter.
    pub lora_ids: Option<HostBuffer>,
    pub lora_input_lengths: Option<HostBuffer>,
    pub multimodal: Option<MultimodalInputs>,
}

impl Default for ModelInputs {
    fn default() -> Self {
        Self::empty()
    }
}

impl ModelInputs {
    /// A batch without entries. Rank 0 broadcasts one as an idle heartbeat.
    pub fn empty() -> Self {
        Self {
            combo_tokens: HostBuffer::vec_i32(vec![]),
            input_lengths: HostBuffer::vec_i32(vec![]),
            sequence_lengths: HostBuffer::vec_i32(vec![]),
            kv_cache_offsets: HostBuffer::zeros(BufferDType::I32, &[0, 0]),
            lm_output_indexes: HostBuffer::vec_i32(vec![]),
            combo_position_ids: None,
            lora_ids: None,
            lora_input_lengths: None,
            multimodal: None,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.input_lengths.dims1()
    }

    pub fn decode_count(&self) -> usize {
        self.sequence_lengths.dims1()
    }

    pub fn prefill_count(&self) -> usize {
        self.batch_size().saturating_sub(self.decode_count())
    }

    pub fn num_tokens(&self) -> usize {
        self.combo_tokens.dims1()
    }

    pub fn max_blocks_per_seq(&self) -> usize {
        self.kv_cache_offsets.shape().get(1).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.batch_size() == 0
    }

    pub fn presence(&self) -> OptionalFields {
        OptionalFields {
            position_ids: self.combo_position_ids.is_some(),
            lora: self.lora_ids.is_some(),
            multimodal: self.multimodal.is_some(),
        }
    }

    pub fn tokens(&self) -> &[i32] {
        self.combo_tokens.as_i32().unwrap_or_default()
    }

    pub fn lengths(&self) -> &[i32] {
        self.input_lengths.as_i32().unwrap_or_default()
    }

    /// Range of entry `i` within `combo_tokens`.
    pub fn span(&self, i: usize) -> Range<usize> {
        let lengths = self.lengths();
        let start: usize = lengths[..i].iter().map(|&l| l.max(0) as usize).sum();
        start..start + lengths[i].max(0) as usize
    }

    /// Position of the last token fed for entry `i`.
    pub fn last_position(&self, i: usize) -> usize {
        let decodes = self.decode_count();
        if i < decodes {
            let cached = self.sequence_lengths.as_i32().unwrap_or_default();
            cached[i].max(0) as usize
        } else {
            self.span(i).len().saturating_sub(1)
        }
    }

    pub fn lora_id(&self, i: usize) -> Option<AdapterId> {
        let ids = self.lora_ids.as_ref()?.as_i32()?;
        let id = *ids.get(i)?;
        (id != NONE_ID).then_some(AdapterId::from(id))
    }

    /// Adapters referenced by the batch, ascending and deduplicated.
    pub fn distinct_lora_ids(&self) -> Vec<AdapterId> {
        let mut ids: Vec<AdapterId> = (0..self.batch_size())
            .filter_map(|i| self.lora_id(i))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Payload buffers in wire order, each tagged with its name.
    pub fn buffers_mut(&mut self) -> Vec<(&'static str, &mut HostBuffer)> {
        let mut out: Vec<(&'static str, &mut HostBuffer)> = vec![
            ("combo_tokens", &mut self.combo_tokens),
            ("input_lengths", &mut self.input_lengths),
            ("sequence_lengths", &mut self.sequence_lengths),
            ("kv_cache_offsets", &mut self.kv_cache_offsets),
            ("lm_output_indexes", &mut self.lm_output_indexes),
        ];
        if let Some(b) = self.combo_position_ids.as_mut() {
            out.push(("combo_position_ids", b));
        }
        if let Some(b) = self.lora_ids.as_mut() {
            out.push(("lora_ids", b));
        }
        if let Some(b) = self.lora_input_lengths.as_mut() {
            out.push(("lora_input_lengths", b));
        }
        if let Some(mm) = self.multimodal.as_mut() {
            out.push(("text_tokens_mask", &mut mm.text_tokens_mask));
            out.push(("mm_feature_locs", &mut mm.feature_locs));
            out.push(("mm_features", &mut mm.features));
        }
        out
    }

    /// Check the internal consistency of the batch.
    pub fn validate(&self) -> Result<(), String> {
        let batch = self.batch_size();
        let decodes = self.decode_count();
        let tokens = self.num_tokens();
        let i32_buffers = [
            ("combo_tokens", &self.combo_tokens),
            ("input_lengths", &self.input_lengths),
            ("sequence_lengths", &self.sequence_lengths),
            ("kv_cache_offsets", &self.kv_cache_offsets),
            ("lm_output_indexes", &self.lm_output_indexes),
        ];
        for (name, buffer) in i32_buffers {
            if buffer.dtype() != BufferDType::I32 {
                return Err(format!("{name} must hold i32"));
            }
        }
        if decodes > batch {
            return Err(format!("{decodes} decode entries in a batch of {batch}"));
        }
        let lengths = self.lengths();
        if lengths.iter().any(|&l| l < 1) {
            return Err("every entry must feed at least one token".to_string());
        }
        if lengths[..decodes].iter().any(|&l| l != 1) {
            return Err("decode entries feed exactly one token".to_string());
        }
        let total: usize = lengths.iter().map(|&l| l as usize).sum();
        if total != tokens {
            return Err(format!("input lengths sum to {total}, {tokens} tokens given"));
        }
        if self.kv_cache_offsets.shape().len() != 2 || self.kv_cache_offsets.shape()[0] != batch {
            return Err(format!(
                "kv_cache_offsets has shape {:?} for a batch of {batch}",
                self.kv_cache_offsets.shape()
            ));
        }
        let lm = self.lm_output_indexes.as_i32().unwrap_or_default();
        if lm.len() != batch {
            return Err(format!("{} output indexes for a batch of {batch}", lm.len()));
        }
        for (i, &idx) in lm.iter().enumerate() {
            if idx < 0 || idx as usize != self.span(i).end - 1 {
                return Err(format!("output index {idx} of entry {i} is not its last token"));
            }
        }
        if let Some(pos) = &self.combo_position_ids {
            if pos.shape() != [tokens] {
                return Err("combo_position_ids must cover every token".to_string());
            }
        }
        match (&self.lora_ids, &self.lora_input_lengths) {
            (None, None) => {}
            (Some(ids), Some(lens)) => {
                if ids.shape() != [batch] || lens != &self.input_lengths {
                    return Err("lora buffers do not match the batch".to_string());
                }
            }
            _ => return Err("lora_ids and lora_input_lengths travel together".to_string()),
        }
        if let Some(mm) = &self.multimodal {
            if mm.text_tokens_mask.shape() != [tokens] {
                return Err("text_tokens_mask must cover every token".to_string());
            }
            let rows = mm.features.shape().first().copied().unwrap_or(0);
            if mm.features.shape().len() != 2 || mm.features.dtype() != BufferDType::F32 {
                return Err("features must be a [rows, dim] f32 buffer".to_string());
            }
            let locs = mm.feature_locs.as_i32().unwrap_or_default();
            if locs.len() != rows {
                return Err(format!("{} feature locations for {rows} rows", locs.len()));
            }
            if locs.iter().any(|&l| l < 0 || l as usize >= tokens) {
                return Err("feature location out of range".to_string());
            }
        }
        Ok(())
    }
}

/// Output of one forward pass, one row per batch entry.
#[derive(Debug, Clone)]
pub struct ModelOutputs {
    /// `[batch, vocab]`, or `[batch, vocab / world_size]` before gathering.
    pub logits: Tensor,
    /// `[batch, hidden]`
    pub hidden_states: Tensor,
}

fn to_i32(v: usize) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}

/// Accumulates batch entries in wire order. Decodes must be pushed before
/// prefills.
#[derive(Debug, Default)]
pub struct InputsBuilder {
    tokens: Vec<i32>,
    input_lengths: Vec<i32>,
    sequence_lengths: Vec<i32>,
    block_tables: Vec<Vec<i32>>,
    position_ids: Vec<i32>,
    lora_ids: Vec<i32>,
    mask: Vec<i32>,
    feature_locs: Vec<i32>,
    features: Vec<f32>,
    feature_dim: Option<usize>,
    emit_position_ids: bool,
}

impl InputsBuilder {
    pub fn new(emit_position_ids: bool) -> Self {
        Self {
            emit_position_ids,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.input_lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_lengths.is_empty()
    }

    /// Feed the latest token of a sequence that has `cached` tokens in its cache.
    pub fn decode(
        &mut self,
        token: u32,
        cached: usize,
        blocks: &[BlockId],
        lora: Option<AdapterId>,
    ) {
        debug_assert_eq!(
            self.sequence_lengths.len(),
            self.input_lengths.len(),
            "decode entries must precede prefill entries"
        );
        self.tokens.push(token as i32);
        self.mask.push(1);
        self.position_ids.push(to_i32(cached));
        self.input_lengths.push(1);
        self.sequence_lengths.push(to_i32(cached));
        self.push_common(blocks, lora);
    }

    pub fn prefill(
        &mut self,
        tokens: &[u32],
        blocks: &[BlockId],
        lora: Option<AdapterId>,
        features: &[MultimodalFeature],
    ) {
        let start = self.tokens.len();
        self.tokens.extend(tokens.iter().map(|&t| t as i32));
        self.position_ids.extend((0..tokens.len()).map(to_i32));
        let mask_start = self.mask.len();
        self.mask.extend(std::iter::repeat(1).take(tokens.len()));
        for feature in features {
            self.feature_dim.get_or_insert(feature.dim());
            for row in 0..feature.rows() {
                let loc = start + feature.position() + row;
                self.mask[mask_start + feature.position() + row] = 0;
                self.feature_locs.push(to_i32(loc));
                self.features.extend_from_slice(feature.row(row));
            }
        }
        self.input_lengths.push(to_i32(tokens.len()));
        self.push_common(blocks, lora);
    }

    fn push_common(&mut self, blocks: &[BlockId], lora: Option<AdapterId>) {
        self.block_tables
            .push(blocks.iter().map(|b| to_i32(b.index())).collect());
        self.lora_ids.push(
            lora.and_then(|id| i32::try_from(id).ok())
                .unwrap_or(NONE_ID),
        );
    }

    pub fn build(self) -> ModelInputs {
        let batch = self.input_lengths.len();
        let max_blocks = self.block_tables.iter().map(Vec::len).max().unwrap_or(0);
        let mut offsets = Vec::with_capacity(batch * max_blocks);
        for table in &self.block_tables {
            offsets.extend_from_slice(table);
            offsets.extend(std::iter::repeat(NONE_ID).take(max_blocks - table.len()));
        }
        let mut lm_output_indexes = Vec::with_capacity(batch);
        let mut end = 0;
        for &len in &self.input_lengths {
            end += len;
            lm_output_indexes.push(end - 1);
        }
        let num_tokens = self.tokens.len();
        let has_lora = self.lora_ids.iter().any(|&id| id != NONE_ID);
        let multimodal = self.feature_dim.map(|dim| {
            let rows = self.feature_locs.len();
            MultimodalInputs {
                text_tokens_mask: HostBuffer::vec_i32(self.mask),
                feature_locs: HostBuffer::vec_i32(self.feature_locs),
                features: HostBuffer::from_f32(&[rows, dim], self.features)
                    .unwrap_or_else(|_| HostBuffer::zeros(BufferDType::F32, &[rows, dim])),
            }
        });
        ModelInputs {
            combo_tokens: HostBuffer::vec_i32(self.tokens),
            input_lengths: HostBuffer::vec_i32(self.input_lengths.clone()),
            sequence_lengths: HostBuffer::vec_i32(self.sequence_lengths),
            kv_cache_offsets: HostBuffer::from_i32(&[batch, max_blocks], offsets)
                .unwrap_or_else(|_| HostBuffer::zeros(BufferDType::I32, &[batch, max_blocks])),
            lm_output_indexes: HostBuffer::vec_i32(lm_output_indexes),
            combo_position_ids: (self.emit_position_ids && num_tokens > 0)
                .then(|| HostBuffer::vec_i32(self.position_ids)),
            lora_ids: has_lora.then(|| HostBuffer::vec_i32(self.lora_ids)),
            lora_input_lengths: has_lora.then(|| HostBuffer::vec_i32(self.input_lengths)),
            multimodal,
        }
    }
}
