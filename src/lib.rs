//! SegNet3D: builds 3D U-Net style volumetric segmentation networks as
//! TensorFlow graphs. A [`TopologyDescriptor`] fixes the depth and the per
//! level channel and layer counts; [`Network::new`] wires encoder levels, a
//! bottleneck, decoder levels fed by skip connections and a classification
//! head, ending in per-voxel class probabilities. [`objective::dice_score`]
//! adds the overlap objective comparing predicted and reference class maps.
//!
//! Only graph construction lives here. Training loops, data loading and
//! checkpointing are left to the caller, who runs the returned outputs in a
//! `tensorflow::Session`.

//TODO: channels-first (NCDHW) data format option for the conv and pooling ops
use std::path::Path;

use log::LevelFilter;
use thiserror::Error;

pub mod activations;
pub mod config;
pub mod eval;
pub mod layers;
pub mod levels;
pub mod network;
pub mod objective;
pub mod observe;

pub use config::{ConfigError, Downsample, LevelConfig, TopologyDescriptor};
pub use levels::VolumeShape;
pub use network::{assemble_network, LevelKind, LevelRecord, Network};
pub use objective::dice_score;
pub use observe::{LogObserver, RecordingObserver, SummaryObserver, VariableObserver};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("shape mismatch in {context}: {left:?} vs {right:?}")]
    ShapeMismatch {
        context: String,
        left: Vec<u64>,
        right: Vec<u64>,
    },
    #[error(transparent)]
    Array(#[from] ndarray::ShapeError),
    #[error("tensorflow: {0}")]
    Graph(#[from] tensorflow::Status),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Sends log output to stderr at `level`.
pub fn init_logging(level: LevelFilter) {
    simple_logging::log_to_stderr(level);
}

/// Sends log output to the file at `path` at `level`.
pub fn init_file_logging<P: AsRef<Path>>(path: P, level: LevelFilter) -> std::io::Result<()> {
    simple_logging::log_to_file(path, level)
}
