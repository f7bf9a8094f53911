//! Topology descriptor: every shape, depth and channel hyperparameter the
//! assembler needs, plus validation of the pairing invariants between the
//! down, base and up paths.
use std::fs;
use std::path::Path;

use anyhow::Context;
use itertools::izip;
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// A 3D filter or extent `(x, y, z)`.
pub type Dims3 = [u64; 3];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("network_depth must be at least 1")]
    ZeroDepth,
    #[error("{field} has length {found}, expected {expected}")]
    LengthMismatch {
        field: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("{field}[{index}] is 0, every level needs at least one convolution")]
    ZeroLayers { field: &'static str, index: usize },
    #[error("{field}[{index}] is 0, channel counts must be positive")]
    ZeroChannels { field: &'static str, index: usize },
    #[error("{field}[{index}] = {channels} must be even, the up-convolution halves it")]
    OddChannels {
        field: &'static str,
        index: usize,
        channels: u64,
    },
    #[error("input extent {extent} on axis {axis} is not divisible by 2^{depth}")]
    IndivisibleExtent { axis: usize, extent: u64, depth: usize },
    #[error("{0} must be positive")]
    ZeroSize(&'static str),
    #[error("invalid batch norm parameters: epsilon={epsilon}, momentum={momentum}")]
    BatchNorm { epsilon: f32, momentum: f32 },
}

/// How a descendent level halves its spatial extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Downsample {
    /// 2x2x2 convolution with stride 2, channel preserving.
    StridedConv,
    /// 2x2x2 max pooling with stride 2.
    MaxPool,
}

impl Default for Downsample {
    fn default() -> Self {
        Downsample::StridedConv
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchNormConfig {
    pub epsilon: f32,
    /// Decay of the moving mean/variance.
    pub momentum: f32,
}

impl Default for BatchNormConfig {
    fn default() -> Self {
        BatchNormConfig {
            epsilon: 1e-3,
            momentum: 0.99,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitConfig {
    /// Standard deviation of the truncated normal used for every kernel.
    pub weight_stddev: f32,
    /// Constant every bias starts at.
    pub bias_value: f32,
}

impl Default for InitConfig {
    fn default() -> Self {
        InitConfig {
            weight_stddev: 0.1,
            bias_value: 0.1,
        }
    }
}

/// Configuration of a single level: how many layer primitives it chains,
/// with which filter, at what width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelConfig {
    pub conv_count: u64,
    pub filter_shape: Dims3,
    pub internal_channels: u64,
}

/// `2^depth`, the factor every input extent must be divisible by. `None`
/// when it does not fit a `u64`.
fn extent_factor(depth: usize) -> Option<u64> {
    u32::try_from(depth)
        .ok()
        .and_then(|shift| 1u64.checked_shl(shift))
}

fn default_filter() -> Dims3 {
    [3, 3, 3]
}

fn default_segm_layers() -> u64 {
    1
}

/// The full set of arrays describing a network.
///
/// Index `i` of the down arrays pairs with index `i` of the up arrays: the
/// retained tensor of encoder level `i` is the skip input of decoder level `i`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyDescriptor {
    pub input_shape: Dims3,
    pub input_channels: u64,
    pub num_classes: u64,
    #[serde(default = "default_filter")]
    pub filter_fine: Dims3,
    #[serde(default = "default_filter")]
    pub filter_out: Dims3,
    pub network_depth: usize,
    pub net_channels_down: Vec<u64>,
    pub net_layers_down: Vec<u64>,
    pub net_channels_base: Vec<u64>,
    pub net_layers_base: Vec<u64>,
    pub net_channels_up: Vec<u64>,
    pub net_layers_up: Vec<u64>,
    #[serde(default = "default_segm_layers")]
    pub net_layers_segm: u64,
    #[serde(default)]
    pub downsample: Downsample,
    #[serde(default)]
    pub batch_norm: BatchNormConfig,
    #[serde(default)]
    pub init: InitConfig,
}

impl TopologyDescriptor {
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let s = fs::read_to_string(path)
            .with_context(|| format!("reading topology from {}", path.display()))?;
        toml::from_str(&s).with_context(|| format!("parsing topology in {}", path.display()))
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = fs::File::open(path)
            .with_context(|| format!("opening topology {}", path.display()))?;
        serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("parsing topology in {}", path.display()))
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string(self)?)
    }

    /// Checks every length, pairing and divisibility invariant so that a bad
    /// descriptor fails here rather than deep inside shape inference.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let depth = self.network_depth;
        if depth == 0 {
            return Err(ConfigError::ZeroDepth);
        }

        let per_level: [(&'static str, &Vec<u64>, usize); 6] = [
            ("net_channels_down", &self.net_channels_down, depth),
            ("net_layers_down", &self.net_layers_down, depth),
            ("net_channels_base", &self.net_channels_base, 1),
            ("net_layers_base", &self.net_layers_base, 1),
            ("net_channels_up", &self.net_channels_up, depth),
            ("net_layers_up", &self.net_layers_up, depth),
        ];
        for (field, values, expected) in per_level {
            if values.len() != expected {
                return Err(ConfigError::LengthMismatch {
                    field,
                    expected,
                    found: values.len(),
                });
            }
        }

        for (field, values) in [
            ("net_layers_down", &self.net_layers_down),
            ("net_layers_base", &self.net_layers_base),
            ("net_layers_up", &self.net_layers_up),
        ] {
            if let Some(index) = values.iter().position(|&n| n == 0) {
                return Err(ConfigError::ZeroLayers { field, index });
            }
        }
        if self.net_layers_segm == 0 {
            return Err(ConfigError::ZeroLayers {
                field: "net_layers_segm",
                index: 0,
            });
        }

        for (field, values) in [
            ("net_channels_down", &self.net_channels_down),
            ("net_channels_base", &self.net_channels_base),
            ("net_channels_up", &self.net_channels_up),
        ] {
            if let Some(index) = values.iter().position(|&c| c == 0) {
                return Err(ConfigError::ZeroChannels { field, index });
            }
        }
        // base and every up level end in a transposed convolution
        for (field, values) in [
            ("net_channels_base", &self.net_channels_base),
            ("net_channels_up", &self.net_channels_up),
        ] {
            if let Some(index) = values.iter().position(|c| c % 2 != 0) {
                return Err(ConfigError::OddChannels {
                    field,
                    index,
                    channels: values[index],
                });
            }
        }

        if self.input_channels == 0 {
            return Err(ConfigError::ZeroSize("input_channels"));
        }
        if self.num_classes == 0 {
            return Err(ConfigError::ZeroSize("num_classes"));
        }
        if self.filter_fine.contains(&0) {
            return Err(ConfigError::ZeroSize("filter_fine"));
        }
        if self.filter_out.contains(&0) {
            return Err(ConfigError::ZeroSize("filter_out"));
        }

        let factor = extent_factor(depth).ok_or(ConfigError::IndivisibleExtent {
            axis: 0,
            extent: self.input_shape[0],
            depth,
        })?;
        for (axis, &extent) in self.input_shape.iter().enumerate() {
            if extent == 0 || extent % factor != 0 {
                return Err(ConfigError::IndivisibleExtent {
                    axis,
                    extent,
                    depth,
                });
            }
        }

        let bn = self.batch_norm;
        if !(bn.epsilon > 0.0) || !(0.0..1.0).contains(&bn.momentum) {
            return Err(ConfigError::BatchNorm {
                epsilon: bn.epsilon,
                momentum: bn.momentum,
            });
        }
        Ok(())
    }

    /// Encoder level configurations, index 0 (full resolution) first.
    pub fn down_levels(&self) -> Vec<LevelConfig> {
        izip!(&self.net_layers_down, &self.net_channels_down)
            .map(|(&conv_count, &internal_channels)| LevelConfig {
                conv_count,
                filter_shape: self.filter_fine,
                internal_channels,
            })
            .collect()
    }

    pub fn base_level(&self) -> LevelConfig {
        LevelConfig {
            conv_count: self.net_layers_base[0],
            filter_shape: self.filter_fine,
            internal_channels: self.net_channels_base[0],
        }
    }

    /// Decoder level configurations, indexed like [`Self::down_levels`].
    pub fn up_levels(&self) -> Vec<LevelConfig> {
        izip!(&self.net_layers_up, &self.net_channels_up)
            .map(|(&conv_count, &internal_channels)| LevelConfig {
                conv_count,
                filter_shape: self.filter_fine,
                internal_channels,
            })
            .collect()
    }

    pub fn segmentation_level(&self) -> LevelConfig {
        LevelConfig {
            conv_count: self.net_layers_segm,
            filter_shape: self.filter_out,
            internal_channels: self.num_classes,
        }
    }

    /// Number of values in one flattened input volume.
    pub fn flat_input_len(&self) -> u64 {
        self.input_shape.iter().product::<u64>() * self.input_channels
    }
}
