//! Network assembly: wires the encoder levels, the base level, the decoder
//! levels and the segmentation head into one graph and normalizes the
//! logits into per-voxel class probabilities.
use itertools::Itertools;
use log::info;
use tensorflow::ops;
use tensorflow::DataType;
use tensorflow::Operation;
use tensorflow::Output;
use tensorflow::Scope;
use tensorflow::Shape;
use tensorflow::Variable;

use crate::activations;
use crate::config::TopologyDescriptor;
use crate::layers::LayerContext;
use crate::levels::{
    ascendent_level, base_level, descendent_level, segmentation_layer, LevelOutput, VolumeShape,
};
use crate::observe::{LogObserver, VariableObserver};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelKind {
    Down,
    Base,
    Up,
    Segmentation,
}

/// One assembled level, in construction order.
#[derive(Debug, Clone)]
pub struct LevelRecord {
    pub kind: LevelKind,
    /// Depth index; 0 for the base level and the head.
    pub index: usize,
    pub name: String,
    /// Resampled and retained outputs. The head has no resampling, both
    /// fields then hold its logits.
    pub output: LevelOutput,
    /// For decoder levels: the tensor concatenated after the skip tensor.
    pub decoder_input: Option<(Output, VolumeShape)>,
}

/// An assembled segmentation network.
#[derive(Debug)]
pub struct Network {
    pub descriptor: TopologyDescriptor,
    /// Flat `[batch, x*y*z*channels]` float input.
    pub input: Output,
    /// Scalar bool phase flag, defaults to inference (`false`) when not fed.
    pub phase: Output,
    /// Input reshaped to `[batch, x, y, z, channels]`.
    pub volume: Output,
    pub logits: Output,
    pub probabilities: Output,
    pub output_shape: VolumeShape,
    pub levels: Vec<LevelRecord>,
    /// Retained encoder tensors indexed by level.
    pub skips: Vec<Output>,
    pub variables: Vec<Variable>,
    pub moving_statistics: Vec<Variable>,
    /// Batch norm moving average updates; run them with every training step.
    pub update_ops: Vec<Operation>,
}

impl Network {
    /// Builds the input and phase placeholders and assembles the network
    /// on them.
    pub fn new(scope: &mut Scope, descriptor: &TopologyDescriptor) -> Result<Network> {
        Network::with_observer(scope, descriptor, &mut LogObserver)
    }

    pub fn with_observer(
        scope: &mut Scope,
        descriptor: &TopologyDescriptor,
        observer: &mut dyn VariableObserver,
    ) -> Result<Network> {
        descriptor.validate()?;
        let input = ops::Placeholder::new()
            .dtype(DataType::Float)
            .shape(Shape::from(Some(vec![
                None,
                Some(descriptor.flat_input_len() as i64),
            ])))
            .build(&mut scope.with_op_name("input"))?;
        let phase_default = ops::constant(false, scope)?;
        let phase = ops::PlaceholderWithDefault::new()
            .dtype(DataType::Bool)
            .shape(Shape::from(Some(Vec::<Option<i64>>::new())))
            .build(phase_default, &mut scope.with_op_name("phase"))?;
        assemble_network(scope, descriptor, input.into(), phase.into(), observer)
    }

    pub fn count(&self, kind: LevelKind) -> usize {
        self.levels.iter().filter(|l| l.kind == kind).count()
    }

    pub fn level(&self, kind: LevelKind, index: usize) -> Option<&LevelRecord> {
        self.levels
            .iter()
            .find(|l| l.kind == kind && l.index == index)
    }

    /// Initializers of every trainable and moving variable.
    pub fn initializers(&self) -> Vec<&Operation> {
        self.variables
            .iter()
            .chain(self.moving_statistics.iter())
            .map(|v| v.initializer())
            .collect()
    }
}

/// Assembles the network on an existing flat `input` and `phase` flag.
///
/// The descriptor is validated first; nothing is added to the graph when it
/// is inconsistent.
pub fn assemble_network(
    scope: &mut Scope,
    descriptor: &TopologyDescriptor,
    input: Output,
    phase: Output,
    observer: &mut dyn VariableObserver,
) -> Result<Network> {
    descriptor.validate()?;
    let depth = descriptor.network_depth;
    let mut ctx = LayerContext::new(
        phase.clone(),
        descriptor.batch_norm,
        descriptor.init,
        observer,
    );
    let mut levels = Vec::with_capacity(2 * depth + 2);

    // the input is reshaped to a 5d tensor with the channels last
    let [x, y, z] = descriptor.input_shape;
    let c = descriptor.input_channels;
    let target = ops::constant(&[-1i64, x as i64, y as i64, z as i64, c as i64][..], scope)?;
    let x_vol: Output = ops::reshape(input.clone(), target, scope)?.into();
    let in_shape = VolumeShape::new(descriptor.input_shape, c);

    // downward path, skip tensors stored by level index
    let down_configs = descriptor.down_levels();
    let mut h_down: Vec<LevelOutput> = Vec::with_capacity(depth);
    for (i, config) in down_configs.iter().enumerate() {
        let (level_input, level_shape) = match h_down.last() {
            Some(prev) => (prev.resampled.clone(), prev.resampled_shape),
            None => (x_vol.clone(), in_shape),
        };
        let name = format!("Level_{}_down", i);
        let out = descendent_level(
            config,
            level_input,
            level_shape,
            descriptor.downsample,
            &mut ctx,
            scope,
            &name,
        )?;
        h_down.push(out.clone());
        levels.push(LevelRecord {
            kind: LevelKind::Down,
            index: i,
            name,
            output: out,
            decoder_input: None,
        });
    }

    let deepest = &h_down[depth - 1];
    let h_base = base_level(
        &descriptor.base_level(),
        deepest.resampled.clone(),
        deepest.resampled_shape,
        &mut ctx,
        scope,
        "Base_Level",
    )?;
    levels.push(LevelRecord {
        kind: LevelKind::Base,
        index: 0,
        name: "Base_Level".to_string(),
        output: h_base.clone(),
        decoder_input: None,
    });

    // upward path, innermost level first: level i consumes the upsampled
    // output of level i+1 (the base level's for i = depth-1) and skip i
    let up_configs = descriptor.up_levels();
    let mut previous = h_base;
    for i in (0..depth).rev() {
        let (level_input, level_shape) = (previous.resampled.clone(), previous.resampled_shape);
        let skip = &h_down[i];
        let name = format!("Level_{}_up", i);
        let out = ascendent_level(
            &up_configs[i],
            level_input.clone(),
            level_shape,
            skip.retained.clone(),
            skip.retained_shape,
            &mut ctx,
            scope,
            &name,
        )?;
        levels.push(LevelRecord {
            kind: LevelKind::Up,
            index: i,
            name,
            output: out.clone(),
            decoder_input: Some((level_input, level_shape)),
        });
        previous = out;
    }

    // previous is now decoder level 0, the head reads its last layer
    let top = (previous.retained, previous.retained_shape);
    let (logits, logits_shape) = segmentation_layer(
        &descriptor.segmentation_level(),
        top.0,
        top.1,
        &mut ctx,
        scope,
        "Output_level",
    )?;
    levels.push(LevelRecord {
        kind: LevelKind::Segmentation,
        index: 0,
        name: "Output_level".to_string(),
        output: LevelOutput {
            resampled: logits.clone(),
            resampled_shape: logits_shape,
            retained: logits.clone(),
            retained_shape: logits_shape,
        },
        decoder_input: None,
    });

    let probabilities = {
        let mut scope = scope.new_sub_scope("softmax_node");
        activations::softmax()(logits.clone(), &mut scope)?
    };

    info!(
        "assembled depth {} network: input {} -> output {}, {} variables",
        depth,
        in_shape.with_batch(1).iter().skip(1).join("x"),
        logits_shape.with_batch(1).iter().skip(1).join("x"),
        ctx.trainable.len()
    );

    let LayerContext {
        trainable,
        moving,
        update_ops,
        ..
    } = ctx;
    Ok(Network {
        descriptor: descriptor.clone(),
        input,
        phase,
        volume: x_vol,
        logits,
        probabilities,
        output_shape: logits_shape,
        levels,
        skips: h_down.into_iter().map(|l| l.retained).collect(),
        variables: trainable,
        moving_statistics: moving,
        update_ops,
    })
}
