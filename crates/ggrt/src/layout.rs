//! Shape, stride and alignment arithmetic shared by contexts, planners and buffers.

use crate::tensor::DType;

pub const MAX_DIMS: usize = 4;

/// Alignment of tensor data inside contexts and CPU buffers.
pub const TENSOR_ALIGNMENT: usize = 32;

/// Rounds `offset` up to the next multiple of `alignment` (a power of two).
pub fn align_up(offset: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (offset + alignment - 1) & !(alignment - 1)
}

/// [`align_up`] that returns `None` instead of overflowing.
pub fn checked_align_up(offset: usize, alignment: usize) -> Option<usize> {
    debug_assert!(alignment.is_power_of_two());
    Some(offset.checked_add(alignment - 1)? & !(alignment - 1))
}

/// Row-major strides for a densely packed tensor, or `None` if a stride
/// does not fit in `usize`.
pub fn contiguous_strides(dtype: DType, ne: &[usize; MAX_DIMS]) -> Option<[usize; MAX_DIMS]> {
    let mut nb = [0usize; MAX_DIMS];
    nb[0] = dtype.type_size();
    nb[1] = nb[0].checked_mul(ne[0] / dtype.block_size())?;
    for i in 2..MAX_DIMS {
        nb[i] = nb[i - 1].checked_mul(ne[i - 1])?;
    }
    Some(nb)
}

/// Bytes spanned by a tensor with the given shape and strides, or `None` on
/// overflow.
pub fn span_bytes(dtype: DType, ne: &[usize; MAX_DIMS], nb: &[usize; MAX_DIMS]) -> Option<usize> {
    let block = dtype.block_size();
    let mut bytes = if block == 1 {
        dtype.type_size()
    } else {
        ne[0].checked_mul(nb[0])? / block
    };
    let first = if block == 1 { 0 } else { 1 };
    for i in first..MAX_DIMS {
        bytes = bytes.checked_add(ne[i].checked_sub(1)?.checked_mul(nb[i])?)?;
    }
    Some(bytes)
}

pub fn nelements(ne: &[usize; MAX_DIMS]) -> Option<usize> {
    ne.iter().try_fold(1usize, |acc, &n| acc.checked_mul(n))
}

/// Expands up to four dimensions into a full shape, padding with ones.
pub(crate) fn expand_dims(dims: &[usize]) -> Option<[usize; MAX_DIMS]> {
    if dims.is_empty() || dims.len() > MAX_DIMS {
        return None;
    }
    let mut ne = [1usize; MAX_DIMS];
    ne[..dims.len()].copy_from_slice(dims);
    Some(ne)
}

/// Byte offsets of every element in logical (row-major) order.
pub(crate) fn element_offsets(
    ne: [usize; MAX_DIMS],
    nb: [usize; MAX_DIMS],
) -> impl Iterator<Item = usize> {
    (0..ne[3]).flat_map(move |i3| {
        (0..ne[2]).flat_map(move |i2| {
            (0..ne[1]).flat_map(move |i1| {
                (0..ne[0]).map(move |i0| i0 * nb[0] + i1 * nb[1] + i2 * nb[2] + i3 * nb[3])
            })
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(0, 32), 0);
        assert_eq!(align_up(1, 32), 32);
        assert_eq!(align_up(32, 32), 32);
        assert_eq!(align_up(33, 16), 48);
    }

    #[test]
    fn contiguous_span_matches_product() {
        let ne = [3, 4, 5, 2];
        let nb = contiguous_strides(DType::F32, &ne).unwrap();
        assert_eq!(nb, [4, 12, 48, 240]);
        assert_eq!(span_bytes(DType::F32, &ne, &nb), Some(480));
        assert_eq!(nelements(&ne), Some(120));
    }

    #[test]
    fn quantized_rows_use_block_size() {
        let ne = [64, 2, 1, 1];
        let nb = contiguous_strides(DType::Q4_0, &ne).unwrap();
        assert_eq!(nb[1], 36);
        assert_eq!(span_bytes(DType::Q4_0, &ne, &nb), Some(72));
    }

    #[test]
    fn transposed_span_covers_source() {
        let ne = [4, 3, 1, 1];
        let nb = [12, 4, 48, 48];
        assert_eq!(span_bytes(DType::F32, &ne, &nb), Some(48));
        let offsets: Vec<usize> = element_offsets(ne, nb).take(5).collect();
        assert_eq!(offsets, vec![0, 12, 24, 36, 4]);
    }

    #[test]
    fn oversized_shapes_report_overflow() {
        let ne = [1 << 62, 8, 1, 1];
        assert_eq!(contiguous_strides(DType::F32, &ne), None);
        assert_eq!(span_bytes(DType::F32, &ne, &[4, 1 << 62, 1 << 62, 1 << 62]), None);
        assert_eq!(nelements(&[usize::MAX, 2, 1, 1]), None);
        assert_eq!(checked_align_up(usize::MAX - 3, 32), None);
        assert_eq!(checked_align_up(33, 32), Some(64));
    }
}
