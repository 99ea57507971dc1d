//! Quantization-aware tensor datatypes.
//!
//! Values always live in float containers; the `DataType` annotation on a
//! tensor says which finite value set the container is allowed to hold.
//! This keeps rewrites purely structural: changing an annotation never
//! requires re-encoding a buffer.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Element datatype of a tensor.
///
/// The integer variants are fixed-point types of explicit bit-width;
/// `Bipolar` is the two-valued {-1, +1} set common in binarized networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Float32,
    Bipolar,
    Int { bits: u8 },
    Uint { bits: u8 },
}

impl DataType {
    /// Number of bits needed to store one element.
    pub fn bitwidth(&self) -> u32 {
        match self {
            DataType::Float32 => 32,
            DataType::Bipolar => 1,
            DataType::Int { bits } | DataType::Uint { bits } => u32::from(*bits),
        }
    }

    pub fn is_integer(&self) -> bool {
        !matches!(self, DataType::Float32)
    }

    pub fn signed(&self) -> bool {
        matches!(self, DataType::Float32 | DataType::Bipolar | DataType::Int { .. })
    }

    /// Smallest representable value.
    pub fn min(&self) -> f64 {
        match self {
            DataType::Float32 => f64::from(f32::MIN),
            DataType::Bipolar => -1.0,
            DataType::Int { bits } => -(2f64.powi(i32::from(*bits) - 1)),
            DataType::Uint { .. } => 0.0,
        }
    }

    /// Largest representable value.
    pub fn max(&self) -> f64 {
        match self {
            DataType::Float32 => f64::from(f32::MAX),
            DataType::Bipolar => 1.0,
            DataType::Int { bits } => 2f64.powi(i32::from(*bits) - 1) - 1.0,
            DataType::Uint { bits } => 2f64.powi(i32::from(*bits)) - 1.0,
        }
    }

    /// Whether `value` is a member of this datatype's value set.
    pub fn allowed(&self, value: f64) -> bool {
        match self {
            DataType::Float32 => true,
            DataType::Bipolar => value == -1.0 || value == 1.0,
            _ => value.fract() == 0.0 && value >= self.min() && value <= self.max(),
        }
    }

    /// Smallest integer datatype whose range contains `value`.
    ///
    /// Falls back to `Float32` for non-integral values.
    pub fn smallest_possible(value: f64) -> DataType {
        if value.fract() != 0.0 {
            return DataType::Float32;
        }
        for bits in 1..=64u8 {
            let unsigned = DataType::Uint { bits };
            if value >= 0.0 && unsigned.allowed(value) {
                return unsigned;
            }
            let signed = DataType::Int { bits };
            if signed.allowed(value) {
                return signed;
            }
        }
        DataType::Float32
    }

    /// Canonical annotation name, e.g. `INT4`, `UINT8`, `BIPOLAR`.
    pub fn name(&self) -> String {
        match self {
            DataType::Float32 => "FLOAT32".to_string(),
            DataType::Bipolar => "BIPOLAR".to_string(),
            DataType::Int { bits } => format!("INT{}", bits),
            DataType::Uint { bits } => format!("UINT{}", bits),
        }
    }

    /// Parse a canonical annotation name.
    pub fn from_name(name: &str) -> Option<DataType> {
        match name {
            "FLOAT32" => Some(DataType::Float32),
            "BIPOLAR" => Some(DataType::Bipolar),
            _ => {
                if let Some(bits) = name.strip_prefix("UINT") {
                    let bits: u8 = bits.parse().ok()?;
                    (1..=64).contains(&bits).then_some(DataType::Uint { bits })
                } else if let Some(bits) = name.strip_prefix("INT") {
                    let bits: u8 = bits.parse().ok()?;
                    (1..=64).contains(&bits).then_some(DataType::Int { bits })
                } else {
                    None
                }
            }
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
