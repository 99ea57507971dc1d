//! Supported operator kinds.
//!
//! The operator set is a closed, versioned enumeration: every opcode the
//! pipeline understands is listed here, and each carries its inference
//! rules (in `crate::infer`) and execution kernel (in `crate::exec`)
//! behind the same dispatch. String round-tripping exists only at the
//! serialization boundary.

use std::fmt;
use std::ops::RangeInclusive;

/// Version of the supported operator registry.
pub const OPSET_VERSION: u32 = 1;

/// Domain tag used when serializing the non-standard operators.
pub const CUSTOM_DOMAIN: &str = "quantir.custom";

/// Operator kind of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Add,
    Sub,
    Mul,
    Div,
    Conv,
    MatMul,
    AveragePool,
    Reshape,
    Transpose,
    Flatten,
    MultiThreshold,
    Im2Col,
    TopK,
}

/// Arity contract for one operator kind.
#[derive(Debug, Clone)]
pub struct OpSignature {
    pub inputs: RangeInclusive<usize>,
    pub outputs: RangeInclusive<usize>,
}

impl OpKind {
    /// All supported operator kinds, in registry order.
    pub fn registry() -> &'static [OpKind] {
        &[
            OpKind::Add,
            OpKind::Sub,
            OpKind::Mul,
            OpKind::Div,
            OpKind::Conv,
            OpKind::MatMul,
            OpKind::AveragePool,
            OpKind::Reshape,
            OpKind::Transpose,
            OpKind::Flatten,
            OpKind::MultiThreshold,
            OpKind::Im2Col,
            OpKind::TopK,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Add => "Add",
            OpKind::Sub => "Sub",
            OpKind::Mul => "Mul",
            OpKind::Div => "Div",
            OpKind::Conv => "Conv",
            OpKind::MatMul => "MatMul",
            OpKind::AveragePool => "AveragePool",
            OpKind::Reshape => "Reshape",
            OpKind::Transpose => "Transpose",
            OpKind::Flatten => "Flatten",
            OpKind::MultiThreshold => "MultiThreshold",
            OpKind::Im2Col => "Im2Col",
            OpKind::TopK => "TopK",
        }
    }

    pub fn from_str(s: &str) -> Option<OpKind> {
        OpKind::registry().iter().copied().find(|k| k.as_str() == s)
    }

    /// Serialization domain: standard opcodes use the default domain,
    /// the quantization-specific ones a custom one.
    pub fn domain(&self) -> &'static str {
        match self {
            OpKind::MultiThreshold | OpKind::Im2Col => CUSTOM_DOMAIN,
            _ => "",
        }
    }

    /// Binary elementwise arithmetic with broadcasting.
    pub fn is_elementwise(&self) -> bool {
        matches!(self, OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div)
    }

    /// Ops that only rearrange data without changing values.
    pub fn is_shape_op(&self) -> bool {
        matches!(self, OpKind::Reshape | OpKind::Transpose | OpKind::Flatten)
    }

    pub fn signature(&self) -> OpSignature {
        let (inputs, outputs) = match self {
            OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div => (2..=2, 1..=1),
            OpKind::Conv => (2..=3, 1..=1),
            OpKind::MatMul => (2..=2, 1..=1),
            OpKind::AveragePool => (1..=1, 1..=1),
            OpKind::Reshape => (2..=2, 1..=1),
            OpKind::Transpose | OpKind::Flatten => (1..=1, 1..=1),
            OpKind::MultiThreshold => (2..=2, 1..=1),
            OpKind::Im2Col => (1..=1, 1..=1),
            OpKind::TopK => (1..=2, 2..=2),
        };
        OpSignature { inputs, outputs }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_round_trip() {
        for &kind in OpKind::registry() {
            assert_eq!(OpKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(OpKind::from_str("Gemm"), None);
    }

    #[test]
    fn test_signatures() {
        assert_eq!(*OpKind::Add.signature().inputs.end(), 2);
        assert_eq!(*OpKind::TopK.signature().outputs.start(), 2);
        assert!(OpKind::Conv.signature().inputs.contains(&3));
    }

    #[test]
    fn test_custom_domain() {
        assert_eq!(OpKind::MultiThreshold.domain(), CUSTOM_DOMAIN);
        assert_eq!(OpKind::Im2Col.domain(), CUSTOM_DOMAIN);
        assert_eq!(OpKind::Conv.domain(), "");
    }
}
