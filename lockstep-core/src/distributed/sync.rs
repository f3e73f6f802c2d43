use tracing::trace;

use super::{Control, DeviceBackend, DistributedError, Result, ShapeDescriptor};
use crate::pipeline::ModelInputs;

/// Make `inputs` identical on every rank.
///
/// On rank 0 `inputs` and `control` are the source of truth. On other ranks
/// `inputs` is replaced by buffers allocated from the broadcast descriptor and
/// `control` is ignored. Returns the control word of rank 0. With a single
/// replica this is a no-op.
pub fn synchronize(
    inputs: &mut ModelInputs,
    control: Control,
    backend: &dyn DeviceBackend,
) -> Result<Control> {
    if backend.world_size() <= 1 {
        return Ok(control);
    }
    let rank = backend.rank();

    let mut descriptor = if rank == 0 {
        ShapeDescriptor::new(inputs, control)?.to_buffer()
    } else {
        ShapeDescriptor::new(&ModelInputs::empty(), Control::Run)?.to_buffer()
    };
    backend.broadcast(&mut [&mut descriptor], 0)?;
    backend.barrier()?;
    let descriptor = ShapeDescriptor::from_buffer(&descriptor)?;
    let control = descriptor.control()?;

    if rank != 0 {
        *inputs = descriptor.allocate_inputs(backend)?;
    } else if descriptor.presence()? != inputs.presence() {
        return Err(DistributedError::BadDescriptor(
            "descriptor presence disagrees with the batch".to_string(),
        ));
    }
    if control == Control::Shutdown {
        return Ok(control);
    }

    {
        let mut named = inputs.buffers_mut();
        let mut buffers: Vec<_> = named.iter_mut().map(|(_, b)| &mut **b).collect();
        backend.broadcast(&mut buffers, 0)?;
    }
    backend.barrier()?;

    if rank != 0 {
        inputs.validate().map_err(DistributedError::BadDescriptor)?;
    }
    trace!(
        "Rank {rank} synchronized a batch of {} entries ({} tokens)",
        inputs.batch_size(),
        inputs.num_tokens()
    );
    Ok(control)
}
