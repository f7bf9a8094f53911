//! The four level blocks of the U-Net: descendent (encoder), base
//! (bottleneck), ascendent (decoder) and the segmentation head.
//!
//! Every level tracks the static shape of what it produces next to the graph
//! output, so the assembler can check skip/decoder pairing before any
//! concatenation is emitted.
use log::debug;
use tensorflow::Output;
use tensorflow::Scope;
use tensorflow::Status;

use crate::config::{Dims3, Downsample, LevelConfig};
use crate::layers::{concat_channels, conv_layer, downsample, upsample, LayerContext};
use crate::{Error, Result};

/// Static shape of one volume, batch dimension excluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeShape {
    pub extent: Dims3,
    pub channels: u64,
}

impl VolumeShape {
    pub fn new(extent: Dims3, channels: u64) -> Self {
        VolumeShape { extent, channels }
    }

    pub fn with_channels(self, channels: u64) -> Self {
        VolumeShape { channels, ..self }
    }

    /// Extent after a stride 2 same padded downsample.
    pub fn halved(self) -> Self {
        let [x, y, z] = self.extent;
        VolumeShape {
            extent: [(x + 1) / 2, (y + 1) / 2, (z + 1) / 2],
            ..self
        }
    }

    /// Extent and channels after a stride 2 transposed convolution.
    pub fn upsampled(self) -> Self {
        let [x, y, z] = self.extent;
        VolumeShape {
            extent: [x * 2, y * 2, z * 2],
            channels: self.channels / 2,
        }
    }

    /// Full shape with a leading batch dimension.
    pub fn with_batch(&self, batch: u64) -> Vec<u64> {
        let [x, y, z] = self.extent;
        vec![batch, x, y, z, self.channels]
    }
}

/// The two results of a resampling level.
#[derive(Debug, Clone)]
pub struct LevelOutput {
    /// Downsampled (encoder) or upsampled (base, decoder) tensor for the next level.
    pub resampled: Output,
    pub resampled_shape: VolumeShape,
    /// Output of the last layer primitive, before resampling. For encoder
    /// levels this is the skip tensor.
    pub retained: Output,
    pub retained_shape: VolumeShape,
}

/// `conv_count` chained layer primitives: the first maps the input's
/// channels to `internal_channels`, the rest keep that width.
fn conv_chain(
    config: &LevelConfig,
    input: Output,
    input_shape: VolumeShape,
    ctx: &mut LayerContext,
    scope: &mut Scope,
) -> std::result::Result<(Output, VolumeShape), Status> {
    let n = config.conv_count as usize;
    let internal = config.internal_channels;
    let mut h: Vec<Output> = Vec::with_capacity(n);
    h.push(conv_layer(
        input,
        input_shape.channels,
        internal,
        config.filter_shape,
        ctx,
        scope,
    )?);
    for i in 1..n {
        let next = conv_layer(
            h[i - 1].clone(),
            internal,
            internal,
            config.filter_shape,
            ctx,
            scope,
        )?;
        h.push(next);
    }
    Ok((h[n - 1].clone(), input_shape.with_channels(internal)))
}

/// Encoder stage: chained primitives, then a stride 2 downsample.
pub fn descendent_level(
    config: &LevelConfig,
    input: Output,
    input_shape: VolumeShape,
    mode: Downsample,
    ctx: &mut LayerContext,
    scope: &mut Scope,
    layer_name: &str,
) -> Result<LevelOutput> {
    let mut scope = scope.new_sub_scope(layer_name);
    let scope = &mut scope;
    let (h_relu, relu_shape) = conv_chain(config, input, input_shape, ctx, scope)?;
    let h_out = downsample(h_relu.clone(), relu_shape.channels, mode, ctx, scope)?;
    let out_shape = relu_shape.halved();
    debug!(
        "{}: {:?} -> skip {:?}, down {:?}",
        layer_name, input_shape, relu_shape, out_shape
    );
    Ok(LevelOutput {
        resampled: h_out,
        resampled_shape: out_shape,
        retained: h_relu,
        retained_shape: relu_shape,
    })
}

/// Bottleneck: chained primitives, then a stride 2 transposed convolution
/// that halves the channel count.
pub fn base_level(
    config: &LevelConfig,
    input: Output,
    input_shape: VolumeShape,
    ctx: &mut LayerContext,
    scope: &mut Scope,
    layer_name: &str,
) -> Result<LevelOutput> {
    let mut scope = scope.new_sub_scope(layer_name);
    let scope = &mut scope;
    let (h_relu, relu_shape) = conv_chain(config, input, input_shape, ctx, scope)?;
    let h_out = upsample(h_relu.clone(), relu_shape.extent, relu_shape.channels, ctx, scope)?;
    let out_shape = relu_shape.upsampled();
    debug!(
        "{}: {:?} -> {:?}, up {:?}",
        layer_name, input_shape, relu_shape, out_shape
    );
    Ok(LevelOutput {
        resampled: h_out,
        resampled_shape: out_shape,
        retained: h_relu,
        retained_shape: relu_shape,
    })
}

/// Decoder stage: concatenates `detail` (the paired encoder skip tensor)
/// and `input` along channels, skip first, then chains primitives and
/// upsamples like the base level.
///
/// Fails with [`Error::ShapeMismatch`] when the two extents differ.
#[allow(clippy::too_many_arguments)]
pub fn ascendent_level(
    config: &LevelConfig,
    input: Output,
    input_shape: VolumeShape,
    detail: Output,
    detail_shape: VolumeShape,
    ctx: &mut LayerContext,
    scope: &mut Scope,
    layer_name: &str,
) -> Result<LevelOutput> {
    if detail_shape.extent != input_shape.extent {
        return Err(Error::ShapeMismatch {
            context: format!("{} skip concatenation", layer_name),
            left: detail_shape.extent.to_vec(),
            right: input_shape.extent.to_vec(),
        });
    }
    let mut scope = scope.new_sub_scope(layer_name);
    let scope = &mut scope;
    let h_cat = concat_channels(&[detail, input], scope)?;
    let cat_shape = input_shape.with_channels(detail_shape.channels + input_shape.channels);
    let (h_relu, relu_shape) = conv_chain(config, h_cat, cat_shape, ctx, scope)?;
    let h_out = upsample(h_relu.clone(), relu_shape.extent, relu_shape.channels, ctx, scope)?;
    let out_shape = relu_shape.upsampled();
    debug!(
        "{}: concat {:?} -> {:?}, up {:?}",
        layer_name, cat_shape, relu_shape, out_shape
    );
    Ok(LevelOutput {
        resampled: h_out,
        resampled_shape: out_shape,
        retained: h_relu,
        retained_shape: relu_shape,
    })
}

/// Classification head: chained primitives down to `num_classes` channels,
/// no resampling. Returns per-voxel logits.
pub fn segmentation_layer(
    config: &LevelConfig,
    input: Output,
    input_shape: VolumeShape,
    ctx: &mut LayerContext,
    scope: &mut Scope,
    layer_name: &str,
) -> Result<(Output, VolumeShape)> {
    let mut scope = scope.new_sub_scope(layer_name);
    let (logits, shape) = conv_chain(config, input, input_shape, ctx, &mut scope)?;
    debug!("{}: {:?} -> {:?}", layer_name, input_shape, shape);
    Ok((logits, shape))
}
