//! Storage precisions for device tensors.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Precision a backend stores a tensor in.
///
/// Host tensors always hold `f32`; the dtype is picked when a tensor is handed to a backend and
/// every value stored in a reduced dtype is rounded to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    F16,
    /// Accelerator-native 16-bit format with the exponent range of `f32`.
    BF16,
}

impl DType {
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 | DType::BF16 => 2,
        }
    }

    /// Whether storing a value in this dtype can round it.
    pub fn is_reduced(self) -> bool {
        self != DType::F32
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduced_types_take_two_bytes() {
        assert_eq!(DType::F32.size_in_bytes(), 4);
        for dtype in [DType::F16, DType::BF16] {
            assert!(dtype.is_reduced());
            assert_eq!(dtype.size_in_bytes(), 2);
        }
        assert!(!DType::F32.is_reduced());
    }

    #[test]
    fn json_name_matches_display() {
        for dtype in [DType::F32, DType::F16, DType::BF16] {
            let json = serde_json::to_string(&dtype).unwrap();
            assert_eq!(json, format!("\"{dtype}\""));
        }
    }
}
