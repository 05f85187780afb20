//! Typed and raw access to tensor data through its resolved binding.

use half::f16;

use crate::backend::{BackendBuffer, BackendError};
use crate::context::{Context, ContextError};
use crate::layout;
use crate::tensor::{DType, TensorData, TensorHeader, TensorId};

impl Context {
    /// Copies the raw bytes spanned by the tensor.
    pub fn read_bytes(&self, id: TensorId) -> Result<Vec<u8>, ContextError> {
        let header = self.tensor(id)?;
        let data = self.resolved(header)?;
        let mut bytes = vec![0u8; header.nbytes()];
        data.buffer.read(data.offset, &mut bytes)?;
        Ok(bytes)
    }

    /// Writes raw bytes `offset` bytes into the tensor's span.
    pub fn write_bytes(&self, id: TensorId, offset: usize, bytes: &[u8]) -> Result<(), ContextError> {
        let header = self.tensor(id)?;
        let data = self.resolved(header)?;
        BackendError::check_range(offset, bytes.len(), header.nbytes())?;
        data.buffer.write(data.offset + offset, bytes)?;
        Ok(())
    }

    /// Reads every element in logical order, converted to `f32`.
    pub fn read_f32(&self, id: TensorId) -> Result<Vec<f32>, ContextError> {
        let header = self.tensor(id)?;
        let dtype = scalar_type(header, "read_f32")?;
        let bytes = self.read_bytes(id)?;
        let size = dtype.type_size();
        Ok(layout::element_offsets(header.ne, header.nb)
            .map(|offset| decode(dtype, &bytes[offset..offset + size]))
            .collect())
    }

    /// Overwrites every element in logical order, converting from `f32`.
    pub fn write_f32(&self, id: TensorId, values: &[f32]) -> Result<(), ContextError> {
        let header = self.tensor(id)?;
        let dtype = scalar_type(header, "write_f32")?;
        let expected = header.nelements();
        if values.len() != expected {
            return Err(ContextError::ElementCount {
                expected,
                actual: values.len(),
            });
        }
        let size = dtype.type_size();
        // Strided tensors keep the bytes between their elements.
        let mut bytes = if header.is_contiguous() {
            vec![0u8; header.nbytes()]
        } else {
            self.read_bytes(id)?
        };
        for (offset, &value) in layout::element_offsets(header.ne, header.nb).zip(values) {
            encode(dtype, value, &mut bytes[offset..offset + size]);
        }
        self.write_bytes(id, 0, &bytes)
    }

    fn resolved(&self, header: &TensorHeader) -> Result<TensorData, ContextError> {
        self.data(header.id)?.ok_or_else(|| ContextError::Unbound {
            tensor: header.label(),
        })
    }
}

fn scalar_type(header: &TensorHeader, op: &'static str) -> Result<DType, ContextError> {
    let dtype = header.dtype();
    if dtype.is_quantized() {
        return Err(ContextError::UnsupportedType { op, dtype });
    }
    Ok(dtype)
}

pub(crate) fn decode(dtype: DType, bytes: &[u8]) -> f32 {
    match dtype {
        DType::F32 => bytemuck::pod_read_unaligned::<f32>(bytes),
        DType::F16 => f16::from_bits(bytemuck::pod_read_unaligned::<u16>(bytes)).to_f32(),
        DType::I8 => bytes[0] as i8 as f32,
        DType::I16 => bytemuck::pod_read_unaligned::<i16>(bytes) as f32,
        DType::I32 => bytemuck::pod_read_unaligned::<i32>(bytes) as f32,
        _ => f32::NAN,
    }
}

pub(crate) fn encode(dtype: DType, value: f32, out: &mut [u8]) {
    match dtype {
        DType::F32 => out.copy_from_slice(bytemuck::bytes_of(&value)),
        DType::F16 => out.copy_from_slice(bytemuck::bytes_of(&f16::from_f32(value).to_bits())),
        DType::I8 => out[0] = value as i8 as u8,
        DType::I16 => out.copy_from_slice(bytemuck::bytes_of(&(value as i16))),
        DType::I32 => out.copy_from_slice(bytemuck::bytes_of(&(value as i32))),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use crate::context::{Context, ContextError, ContextParams};
    use crate::tensor::DType;

    #[test]
    fn f32_values_survive_each_scalar_type() {
        let mut ctx = Context::new(ContextParams::new(1 << 16));
        for dtype in [DType::F32, DType::F16, DType::I8, DType::I16, DType::I32] {
            let t = ctx.new_tensor_2d(dtype, 3, 2).unwrap();
            ctx.write_f32(t, &[1.0, -2.0, 3.0, 4.0, 5.0, -6.0]).unwrap();
            assert_eq!(
                ctx.read_f32(t).unwrap(),
                vec![1.0, -2.0, 3.0, 4.0, 5.0, -6.0],
                "{dtype}"
            );
        }
    }

    #[test]
    fn element_count_must_match() {
        let mut ctx = Context::new(ContextParams::new(4096));
        let t = ctx.new_tensor_1d(DType::F32, 4).unwrap();
        assert!(matches!(
            ctx.write_f32(t, &[1.0]),
            Err(ContextError::ElementCount { expected: 4, actual: 1 })
        ));
    }

    #[test]
    fn quantized_and_unbound_tensors_are_rejected() {
        let mut ctx = Context::new(ContextParams::new(4096));
        let q = ctx.new_tensor_1d(DType::Q8_0, 32).unwrap();
        assert!(matches!(
            ctx.read_f32(q),
            Err(ContextError::UnsupportedType { .. })
        ));
        ctx.set_no_alloc(true);
        let unbound = ctx.new_tensor_1d(DType::F32, 4).unwrap();
        assert!(matches!(ctx.read_f32(unbound), Err(ContextError::Unbound { .. })));
    }
}
