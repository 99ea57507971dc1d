//! Data-layout tags for activation tensors.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Interpretation of a tensor's axes.
///
/// Weights and other parameter tensors carry no layout; only activations
/// flowing between operators are tagged. Convolutions and pools consume
/// channel-first (`NCHW`) data, the im2col lowering step works
/// channel-last (`NHWC`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataLayout {
    Nchw,
    Nhwc,
    Nc,
    C,
}

impl DataLayout {
    /// Axis letters, one per dimension.
    pub fn axes(&self) -> &'static [char] {
        match self {
            DataLayout::Nchw => &['N', 'C', 'H', 'W'],
            DataLayout::Nhwc => &['N', 'H', 'W', 'C'],
            DataLayout::Nc => &['N', 'C'],
            DataLayout::C => &['C'],
        }
    }

    pub fn rank(&self) -> usize {
        self.axes().len()
    }

    /// Match a permuted axis string back to a known layout.
    pub fn from_axes(axes: &[char]) -> Option<DataLayout> {
        [DataLayout::Nchw, DataLayout::Nhwc, DataLayout::Nc, DataLayout::C]
            .into_iter()
            .find(|l| l.axes() == axes)
    }

    /// Layout after applying a transpose permutation to this layout.
    ///
    /// Returns `None` when the permuted axes do not correspond to any
    /// known layout (e.g. `NWHC`).
    pub fn permute(&self, perm: &[i64]) -> Option<DataLayout> {
        let axes = self.axes();
        if perm.len() != axes.len() {
            return None;
        }
        let permuted: Option<Vec<char>> = perm
            .iter()
            .map(|&p| axes.get(usize::try_from(p).ok()?).copied())
            .collect();
        DataLayout::from_axes(&permuted?)
    }

    /// Default layout for a tensor of the given rank, if unambiguous.
    pub fn default_for_rank(rank: usize) -> Option<DataLayout> {
        match rank {
            4 => Some(DataLayout::Nchw),
            2 => Some(DataLayout::Nc),
            1 => Some(DataLayout::C),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataLayout::Nchw => "NCHW",
            DataLayout::Nhwc => "NHWC",
            DataLayout::Nc => "NC",
            DataLayout::C => "C",
        }
    }

    pub fn from_name(name: &str) -> Option<DataLayout> {
        match name {
            "NCHW" => Some(DataLayout::Nchw),
            "NHWC" => Some(DataLayout::Nhwc),
            "NC" => Some(DataLayout::Nc),
            "C" => Some(DataLayout::C),
            _ => None,
        }
    }
}

impl fmt::Display for DataLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
