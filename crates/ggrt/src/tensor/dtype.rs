//! Element types and the static table of their storage traits.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Storage traits of one element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeTraits {
    pub name: &'static str,
    /// Elements per storage block; 1 for plain scalar types.
    pub block_size: usize,
    /// Bytes per storage block.
    pub type_size: usize,
    pub is_quantized: bool,
}

const QK: usize = 32;
const QK_K: usize = 256;

const fn scalar(name: &'static str, type_size: usize) -> TypeTraits {
    TypeTraits {
        name,
        block_size: 1,
        type_size,
        is_quantized: false,
    }
}

const fn quant(name: &'static str, block_size: usize, type_size: usize) -> TypeTraits {
    TypeTraits {
        name,
        block_size,
        type_size,
        is_quantized: true,
    }
}

// Indexed by `DType as usize`.
static TYPE_TRAITS: [TypeTraits; DType::COUNT] = [
    scalar("f32", 4),
    scalar("f16", 2),
    quant("q4_0", QK, 2 + QK / 2),
    quant("q4_1", QK, 2 * 2 + QK / 2),
    quant("q5_0", QK, 2 + 4 + QK / 2),
    quant("q5_1", QK, 2 * 2 + 4 + QK / 2),
    quant("q8_0", QK, 2 + QK),
    quant("q8_1", QK, 2 * 4 + QK),
    quant("q2_K", QK_K, 84),
    quant("q3_K", QK_K, 110),
    quant("q4_K", QK_K, 144),
    quant("q5_K", QK_K, 176),
    quant("q6_K", QK_K, 210),
    quant("q8_K", QK_K, 292),
    scalar("i8", 1),
    scalar("i16", 2),
    scalar("i32", 4),
];

/// Element type of a tensor.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    F16,
    Q4_0,
    Q4_1,
    Q5_0,
    Q5_1,
    Q8_0,
    Q8_1,
    Q2_K,
    Q3_K,
    Q4_K,
    Q5_K,
    Q6_K,
    Q8_K,
    I8,
    I16,
    I32,
}

impl DType {
    pub const COUNT: usize = 17;

    pub const ALL: [DType; DType::COUNT] = [
        DType::F32,
        DType::F16,
        DType::Q4_0,
        DType::Q4_1,
        DType::Q5_0,
        DType::Q5_1,
        DType::Q8_0,
        DType::Q8_1,
        DType::Q2_K,
        DType::Q3_K,
        DType::Q4_K,
        DType::Q5_K,
        DType::Q6_K,
        DType::Q8_K,
        DType::I8,
        DType::I16,
        DType::I32,
    ];

    pub fn traits(self) -> &'static TypeTraits {
        &TYPE_TRAITS[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.traits().name
    }

    pub fn block_size(self) -> usize {
        self.traits().block_size
    }

    pub fn type_size(self) -> usize {
        self.traits().type_size
    }

    pub fn is_quantized(self) -> bool {
        self.traits().is_quantized
    }

    /// Bytes occupied by one row of `ne0` elements.
    pub fn row_size(self, ne0: usize) -> usize {
        self.type_size() * ne0 / self.block_size()
    }

    /// Numeric tag used by serialized model headers. Tags 4 and 5 are retired.
    pub fn tag(self) -> u32 {
        match self {
            DType::F32 => 0,
            DType::F16 => 1,
            DType::Q4_0 => 2,
            DType::Q4_1 => 3,
            DType::Q5_0 => 6,
            DType::Q5_1 => 7,
            DType::Q8_0 => 8,
            DType::Q8_1 => 9,
            DType::Q2_K => 10,
            DType::Q3_K => 11,
            DType::Q4_K => 12,
            DType::Q5_K => 13,
            DType::Q6_K => 14,
            DType::Q8_K => 15,
            DType::I8 => 16,
            DType::I16 => 17,
            DType::I32 => 18,
        }
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        DType::ALL.into_iter().find(|dtype| dtype.tag() == tag)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_indexed_by_discriminant() {
        for dtype in DType::ALL {
            assert_eq!(
                dtype.traits().name.to_ascii_lowercase(),
                format!("{dtype:?}").to_ascii_lowercase()
            );
        }
    }

    #[test]
    fn tags_round_trip_and_skip_retired_values() {
        for dtype in DType::ALL {
            assert_eq!(DType::from_tag(dtype.tag()), Some(dtype));
        }
        assert_eq!(DType::from_tag(4), None);
        assert_eq!(DType::from_tag(5), None);
        assert_eq!(DType::from_tag(19), None);
    }

    #[test]
    fn row_size_accounts_for_blocks() {
        assert_eq!(DType::F32.row_size(10), 40);
        assert_eq!(DType::F16.row_size(10), 20);
        assert_eq!(DType::Q4_0.row_size(64), 36);
        assert_eq!(DType::Q8_K.row_size(256), 292);
    }
}
