use super::{BufferDType, BufferKind, DeviceBackend, DistributedError, HostBuffer, Result};
use crate::pipeline::{ModelInputs, MultimodalInputs};

/// Slots of the shape descriptor, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputField {
    ComboTokens,
    InputLengths,
    SequenceLengths,
    MaxBlocksPerSeq,
    LmOutputIndexes,
    ComboPositionIds,
    LoraIds,
    LoraInputLengths,
    TextTokensMask,
    MmFeatureLocs,
    MmFeatureRows,
    MmFeatureDim,
    Presence,
    Control,
}

impl InputField {
    pub const COUNT: usize = 14;

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Which optional buffers follow the mandatory ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptionalFields {
    pub position_ids: bool,
    pub lora: bool,
    pub multimodal: bool,
}

impl OptionalFields {
    const POSITION_IDS: i32 = 1;
    const LORA: i32 = 1 << 1;
    const MULTIMODAL: i32 = 1 << 2;

    pub fn bits(self) -> i32 {
        let mut bits = 0;
        if self.position_ids {
            bits |= Self::POSITION_IDS;
        }
        if self.lora {
            bits |= Self::LORA;
        }
        if self.multimodal {
            bits |= Self::MULTIMODAL;
        }
        bits
    }

    pub fn from_bits(bits: i32) -> Result<Self> {
        if bits & !(Self::POSITION_IDS | Self::LORA | Self::MULTIMODAL) != 0 {
            return Err(DistributedError::BadDescriptor(format!(
                "unknown presence bits {bits:#x}"
            )));
        }
        Ok(Self {
            position_ids: bits & Self::POSITION_IDS != 0,
            lora: bits & Self::LORA != 0,
            multimodal: bits & Self::MULTIMODAL != 0,
        })
    }
}

/// What followers should do with the iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Run,
    Shutdown,
}

impl Control {
    fn to_wire(self) -> i32 {
        match self {
            Self::Run => 0,
            Self::Shutdown => 1,
        }
    }

    fn from_wire(v: i32) -> Result<Self> {
        match v {
            0 => Ok(Self::Run),
            1 => Ok(Self::Shutdown),
            other => Err(DistributedError::BadDescriptor(format!(
                "unknown control word {other}"
            ))),
        }
    }
}

/// Fixed-size array of element counts from which a follower can allocate every
/// buffer of the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShapeDescriptor {
    hints: [i32; InputField::COUNT],
}

fn count(field: InputField, n: usize) -> Result<i32> {
    i32::try_from(n).map_err(|_| {
        DistributedError::BadDescriptor(format!("{field:?} count {n} does not fit the wire"))
    })
}

impl ShapeDescriptor {
    pub fn new(inputs: &ModelInputs, control: Control) -> Result<Self> {
        let mut hints = [0i32; InputField::COUNT];
        let mut set = |field: InputField, n: usize| -> Result<()> {
            hints[field.index()] = count(field, n)?;
            Ok(())
        };
        set(InputField::ComboTokens, inputs.num_tokens())?;
        set(InputField::InputLengths, inputs.batch_size())?;
        set(InputField::SequenceLengths, inputs.decode_count())?;
        set(InputField::MaxBlocksPerSeq, inputs.max_blocks_per_seq())?;
        set(InputField::LmOutputIndexes, inputs.lm_output_indexes.dims1())?;
        if let Some(pos) = &inputs.combo_position_ids {
            set(InputField::ComboPositionIds, pos.dims1())?;
        }
        if let Some(ids) = &inputs.lora_ids {
            set(InputField::LoraIds, ids.dims1())?;
        }
        if let Some(lens) = &inputs.lora_input_lengths {
            set(InputField::LoraInputLengths, lens.dims1())?;
        }
        if let Some(mm) = &inputs.multimodal {
            set(InputField::TextTokensMask, mm.text_tokens_mask.dims1())?;
            set(InputField::MmFeatureLocs, mm.feature_locs.dims1())?;
            let shape = mm.features.shape();
            set(InputField::MmFeatureRows, shape.first().copied().unwrap_or(0))?;
            set(InputField::MmFeatureDim, shape.get(1).copied().unwrap_or(0))?;
        }
        hints[InputField::Presence.index()] = inputs.presence().bits();
        hints[InputField::Control.index()] = control.to_wire();
        Ok(Self { hints })
    }

    pub fn get(&self, field: InputField) -> usize {
        self.hints[field.index()].max(0) as usize
    }

    pub fn presence(&self) -> Result<OptionalFields> {
        OptionalFields::from_bits(self.hints[InputField::Presence.index()])
    }

    pub fn control(&self) -> Result<Control> {
        Control::from_wire(self.hints[InputField::Control.index()])
    }

    pub fn to_buffer(&self) -> HostBuffer {
        HostBuffer::vec_i32(self.hints.to_vec())
    }

    pub fn from_buffer(buffer: &HostBuffer) -> Result<Self> {
        let values = buffer.as_i32().ok_or_else(|| {
            DistributedError::BadDescriptor("descriptor must hold i32".to_string())
        })?;
        let hints: [i32; InputField::COUNT] = values.try_into().map_err(|_| {
            DistributedError::BadDescriptor(format!(
                "descriptor has {} slots, expected {}",
                values.len(),
                InputField::COUNT
            ))
        })?;
        if let Some(neg) = hints.iter().position(|&h| h < 0) {
            return Err(DistributedError::BadDescriptor(format!(
                "negative count in slot {neg}"
            )));
        }
        let descriptor = Self { hints };
        descriptor.presence()?;
        descriptor.control()?;
        Ok(descriptor)
    }

    /// Allocate zeroed buffers shaped exactly as described.
    pub fn allocate_inputs(&self, backend: &dyn DeviceBackend) -> Result<ModelInputs> {
        let presence = self.presence()?;
        let alloc = |shape: &[usize]| backend.allocate_buffer(BufferDType::I32, shape, BufferKind::Host);
        let batch = self.get(InputField::InputLengths);
        let optional = |present: bool, field: InputField| -> Result<Option<HostBuffer>> {
            if present {
                alloc(&[self.get(field)]).map(Some)
            } else {
                Ok(None)
            }
        };
        let multimodal = if presence.multimodal {
            Some(MultimodalInputs {
                text_tokens_mask: alloc(&[self.get(InputField::TextTokensMask)])?,
                feature_locs: alloc(&[self.get(InputField::MmFeatureLocs)])?,
                features: backend.allocate_buffer(
                    BufferDType::F32,
                    &[
                        self.get(InputField::MmFeatureRows),
                        self.get(InputField::MmFeatureDim),
                    ],
                    BufferKind::Device,
                )?,
            })
        } else {
            None
        };
        Ok(ModelInputs {
            combo_tokens: alloc(&[self.get(InputField::ComboTokens)])?,
            input_lengths: alloc(&[batch])?,
            sequence_lengths: alloc(&[self.get(InputField::SequenceLengths)])?,
            kv_cache_offsets: alloc(&[batch, self.get(InputField::MaxBlocksPerSeq)])?,
            lm_output_indexes: alloc(&[self.get(InputField::LmOutputIndexes)])?,
            combo_position_ids: optional(presence.position_ids, InputField::ComboPositionIds)?,
            lora_ids: optional(presence.lora, InputField::LoraIds)?,
            lora_input_lengths: optional(presence.lora, InputField::LoraInputLengths)?,
            multimodal,
        })
    }
}
