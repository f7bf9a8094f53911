//! Graph building blocks: variable creation, the 3D convolution helpers and
//! the convolution + bias + batch norm + relu layer primitive every level is
//! made of.
use log::trace;
use tensorflow::ops;
use tensorflow::DataType;
use tensorflow::Operation;
use tensorflow::Output;
use tensorflow::Scope;
use tensorflow::Shape;
use tensorflow::Status;
use tensorflow::Tensor;
use tensorflow::Variable;

use crate::activations;
use crate::config::{BatchNormConfig, Dims3, Downsample, InitConfig};
use crate::observe::VariableObserver;

/// Channel axis of every 5D (batch, x, y, z, channel) volume.
pub const CHANNEL_AXIS: i32 = 4;

/// State threaded through every layer of one forward pass: the phase flag
/// and everything the layers create that callers need afterwards.
pub struct LayerContext<'o> {
    /// Scalar bool, true while training. Selects batch statistics over the
    /// moving ones in every batch norm.
    pub phase: Output,
    pub batch_norm: BatchNormConfig,
    pub init: InitConfig,
    /// Weights, biases and batch norm scale/offset.
    pub trainable: Vec<Variable>,
    /// Batch norm moving mean/variance.
    pub moving: Vec<Variable>,
    /// Moving statistic updates, to run alongside each training step.
    pub update_ops: Vec<Operation>,
    observer: &'o mut dyn VariableObserver,
}

impl<'o> LayerContext<'o> {
    pub fn new(
        phase: Output,
        batch_norm: BatchNormConfig,
        init: InitConfig,
        observer: &'o mut dyn VariableObserver,
    ) -> Self {
        LayerContext {
            phase,
            batch_norm,
            init,
            trainable: vec![],
            moving: vec![],
            update_ops: vec![],
            observer,
        }
    }

    fn track(&mut self, var: Variable) -> Result<Variable, Status> {
        self.observer.observe(&var)?;
        self.trainable.push(var.clone());
        Ok(var)
    }

    fn track_moving(&mut self, var: Variable) -> Result<Variable, Status> {
        self.observer.observe(&var)?;
        self.moving.push(var.clone());
        Ok(var)
    }
}

/// Fully known static shape from a list of dimensions.
pub fn static_shape(dims: &[u64]) -> Shape {
    Shape::from(Some(dims.iter().map(|&d| Some(d as i64)).collect::<Vec<_>>()))
}

/// Kernel initialized from a truncated normal scaled by `stddev`.
pub fn weight_variable(
    shape: &[u64],
    stddev: f32,
    name: &str,
    scope: &mut Scope,
) -> Result<Variable, Status> {
    let dims: Vec<i64> = shape.iter().map(|&d| d as i64).collect();
    let w_shape = ops::constant(&dims[..], scope)?;
    let initial = ops::multiply(
        ops::TruncatedNormal::new()
            .dtype(DataType::Float)
            .build(w_shape, scope)?,
        ops::constant(stddev, scope)?,
        scope,
    )?;
    Variable::builder()
        .initial_value(initial)
        .data_type(DataType::Float)
        .shape(static_shape(shape))
        .build(&mut scope.with_op_name(name))
}

/// Vector of `size` copies of `value`, used for biases and batch norm state.
pub fn constant_variable(
    size: u64,
    value: f32,
    name: &str,
    scope: &mut Scope,
) -> Result<Variable, Status> {
    let init = Tensor::<f32>::new(&[size]).with_values(&vec![value; size as usize])?;
    Variable::builder()
        .const_initial_value(init)
        .shape(static_shape(&[size]))
        .build(&mut scope.with_op_name(name))
}

fn strides(step: i64) -> Vec<i64> {
    vec![1, step, step, step, 1]
}

/// Same padding, unit stride.
pub fn conv3d_fine<O1: Into<Output>, O2: Into<Output>>(
    x: O1,
    w: O2,
    scope: &mut Scope,
) -> Result<Operation, Status> {
    ops::Conv3D::new()
        .strides(strides(1))
        .padding("SAME")
        .build(x, w, scope)
}

/// Same padding, stride 2: halves every spatial extent.
pub fn conv3d_down<O1: Into<Output>, O2: Into<Output>>(
    x: O1,
    w: O2,
    scope: &mut Scope,
) -> Result<Operation, Status> {
    let mut scope = scope.new_sub_scope("Down_conv_2");
    ops::Conv3D::new()
        .strides(strides(2))
        .padding("SAME")
        .build(x, w, &mut scope)
}

pub fn max_pool_down<O1: Into<Output>>(x: O1, scope: &mut Scope) -> Result<Operation, Status> {
    ops::MaxPool3D::new()
        .ksize(strides(2))
        .strides(strides(2))
        .padding("SAME")
        .build(x, scope)
}

/// Stride 2 transposed convolution doubling every spatial extent.
///
/// `out_extent` and `out_channels` are the statically known output size; the
/// batch dimension is read from `x` at run time so the output keeps a fully
/// inferable spatial shape.
pub fn conv3d_up<O1: Into<Output>, O2: Into<Output>>(
    x: O1,
    w: O2,
    out_extent: Dims3,
    out_channels: u64,
    scope: &mut Scope,
) -> Result<Operation, Status> {
    let mut scope = scope.new_sub_scope("Up_conv_2");
    let scope = &mut scope;
    let x: Output = x.into();
    let x_shape = ops::shape(x.clone(), scope)?;
    let batch = ops::StridedSlice::new().shrink_axis_mask(1).build(
        x_shape,
        ops::constant(&[0i32][..], scope)?,
        ops::constant(&[1i32][..], scope)?,
        ops::constant(&[1i32][..], scope)?,
        scope,
    )?;
    let mut dims: Vec<Output> = vec![batch.into()];
    for d in out_extent.iter().chain(std::iter::once(&out_channels)) {
        dims.push(ops::constant(*d as i32, scope)?.into());
    }
    let output_shape = pack(&dims, scope)?;
    ops::Conv3DBackpropInputV2::new()
        .strides(strides(2))
        .padding("SAME")
        .build(output_shape, w, x, scope)
}

/// `Pack` over a list of scalars. List inputs go through the raw graph API.
fn pack(values: &[Output], scope: &mut Scope) -> Result<Output, Status> {
    let name = scope.get_unique_name_for_op("output_shape");
    let mut graph = scope.graph_mut();
    let mut nd = graph.new_operation("Pack", &name)?;
    nd.add_input_list(values);
    nd.set_attr_int("axis", 0)?;
    Ok(nd.finish()?.into())
}

/// Concatenates `values` along the channel axis, in order.
pub fn concat_channels(values: &[Output], scope: &mut Scope) -> Result<Output, Status> {
    let axis: Output = ops::constant(CHANNEL_AXIS, scope)?.into();
    let name = scope.get_unique_name_for_op("concat");
    let mut graph = scope.graph_mut();
    let mut nd = graph.new_operation("ConcatV2", &name)?;
    nd.add_input_list(values);
    nd.add_input(axis);
    Ok(nd.finish()?.into())
}

/// Batch normalization over the channel axis.
///
/// The phase flag picks the current batch's mean/variance (training) or the
/// moving ones (inference). Moving statistics only change when the update
/// operations pushed onto `ctx.update_ops` are run.
pub fn batch_norm(
    x: Output,
    channels: u64,
    ctx: &mut LayerContext,
    scope: &mut Scope,
) -> Result<Output, Status> {
    let mut scope = scope.new_sub_scope("batch_norm");
    let scope = &mut scope;
    let bn = ctx.batch_norm;

    let gamma = ctx.track(constant_variable(channels, 1.0, "gamma", scope)?)?;
    let beta = ctx.track(constant_variable(channels, 0.0, "beta", scope)?)?;
    let moving_mean = ctx.track_moving(constant_variable(channels, 0.0, "moving_mean", scope)?)?;
    let moving_variance =
        ctx.track_moving(constant_variable(channels, 1.0, "moving_variance", scope)?)?;

    let axes = ops::constant(&[0i32, 1, 2, 3][..], scope)?;
    let batch_mean: Output = ops::mean(x.clone(), axes.clone(), scope)?.into();
    let batch_variance: Output = ops::mean(
        ops::squared_difference(x.clone(), batch_mean.clone(), scope)?,
        axes,
        scope,
    )?
    .into();

    let decay = ops::constant(bn.momentum, scope)?;
    let rest = ops::constant(1.0 - bn.momentum, scope)?;
    for (moving, batch) in [
        (&moving_mean, &batch_mean),
        (&moving_variance, &batch_variance),
    ] {
        let updated = ops::add(
            ops::multiply(moving.output().clone(), decay.clone(), scope)?,
            ops::multiply(batch.clone(), rest.clone(), scope)?,
            scope,
        )?;
        ctx.update_ops
            .push(ops::assign(moving.output().clone(), updated, scope)?);
    }

    let mean = ops::select(
        ctx.phase.clone(),
        batch_mean,
        moving_mean.output().clone(),
        scope,
    )?;
    let variance = ops::select(
        ctx.phase.clone(),
        batch_variance,
        moving_variance.output().clone(),
        scope,
    )?;
    let inv_std = ops::rsqrt(
        ops::add(variance, ops::constant(bn.epsilon, scope)?, scope)?,
        scope,
    )?;
    let normalized = ops::multiply(ops::sub(x, mean, scope)?, inv_std, scope)?;
    Ok(ops::add(
        ops::multiply(normalized, gamma.output().clone(), scope)?,
        beta.output().clone(),
        scope,
    )?
    .into())
}

/// The layer primitive: same padded unit stride 3D convolution, bias, batch
/// norm, relu. Keeps the spatial extent and maps `input_size` channels to
/// `output_size`.
pub fn conv_layer<O1: Into<Output>>(
    input: O1,
    input_size: u64,
    output_size: u64,
    filt_size: Dims3,
    ctx: &mut LayerContext,
    scope: &mut Scope,
) -> Result<Output, Status> {
    let mut scope = scope.new_sub_scope("layer");
    let scope = &mut scope;
    let [kx, ky, kz] = filt_size;
    let w = ctx.track(weight_variable(
        &[kx, ky, kz, input_size, output_size],
        ctx.init.weight_stddev,
        "weights",
        scope,
    )?)?;
    let b = ctx.track(constant_variable(
        output_size,
        ctx.init.bias_value,
        "biases",
        scope,
    )?)?;
    trace!(
        "conv layer {}->{} filter {:?}",
        input_size,
        output_size,
        filt_size
    );

    let h_conv = conv3d_fine(input, w.output().clone(), scope)?;
    let h_bias = ops::bias_add(h_conv, b.output().clone(), scope)?;
    let h_bn = batch_norm(h_bias.into(), output_size, ctx, scope)?;
    activations::relu()(h_bn, scope)
}

/// Halves the spatial extent of a `channels` wide volume.
pub fn downsample<O1: Into<Output>>(
    input: O1,
    channels: u64,
    mode: Downsample,
    ctx: &mut LayerContext,
    scope: &mut Scope,
) -> Result<Output, Status> {
    match mode {
        Downsample::StridedConv => {
            let w = ctx.track(weight_variable(
                &[2, 2, 2, channels, channels],
                ctx.init.weight_stddev,
                "weights_down",
                scope,
            )?)?;
            Ok(conv3d_down(input, w.output().clone(), scope)?.into())
        }
        Downsample::MaxPool => Ok(max_pool_down(input, scope)?.into()),
    }
}

/// Doubles the spatial extent of a `channels` wide volume of extent
/// `extent`, halving its channel count.
pub fn upsample<O1: Into<Output>>(
    input: O1,
    extent: Dims3,
    channels: u64,
    ctx: &mut LayerContext,
    scope: &mut Scope,
) -> Result<Output, Status> {
    let w = ctx.track(weight_variable(
        &[2, 2, 2, channels / 2, channels],
        ctx.init.weight_stddev,
        "weights_up",
        scope,
    )?)?;
    let [x, y, z] = extent;
    Ok(conv3d_up(
        input,
        w.output().clone(),
        [x * 2, y * 2, z * 2],
        channels / 2,
        scope,
    )?
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observe::RecordingObserver;
    use tensorflow::{Session, SessionOptions, SessionRunArgs};

    fn phase(training: bool, scope: &mut Scope) -> Output {
        ops::constant(training, scope).unwrap().into()
    }

    fn fetch_dims(scope: &Scope, inits: &[Variable], out: &Output) -> (Vec<u64>, Vec<f32>) {
        let session = Session::new(&SessionOptions::new(), &scope.graph()).unwrap();
        let mut init = SessionRunArgs::new();
        for var in inits {
            init.add_target(var.initializer());
        }
        session.run(&mut init).unwrap();
        let mut args = SessionRunArgs::new();
        let token = args.request_fetch(&out.operation, out.index);
        session.run(&mut args).unwrap();
        let res: Tensor<f32> = args.fetch(token).unwrap();
        (res.dims().to_vec(), res.to_vec())
    }

    fn volume(dims: &[u64], scope: &mut Scope) -> Output {
        let n = dims.iter().product::<u64>() as usize;
        let values: Vec<f32> = (0..n).map(|i| (i % 7) as f32 - 3.0).collect();
        ops::constant(Tensor::new(dims).with_values(&values).unwrap(), scope)
            .unwrap()
            .into()
    }

    #[test]
    fn conv_layer_keeps_extent_and_sets_channels() {
        let mut scope = Scope::new_root_scope();
        let mut observer = RecordingObserver::default();
        let p = phase(true, &mut scope);
        let x = volume(&[2, 4, 4, 4, 3], &mut scope);
        let mut ctx = LayerContext::new(
            p,
            BatchNormConfig::default(),
            InitConfig::default(),
            &mut observer,
        );
        let out = conv_layer(x, 3, 5, [3, 3, 3], &mut ctx, &mut scope).unwrap();
        let mut vars = ctx.trainable.clone();
        vars.extend(ctx.moving.clone());
        assert_eq!(ctx.trainable.len(), 4);
        assert_eq!(ctx.moving.len(), 2);
        assert_eq!(ctx.update_ops.len(), 2);
        drop(ctx);

        let (dims, values) = fetch_dims(&scope, &vars, &out);
        assert_eq!(dims, vec![2, 4, 4, 4, 5]);
        assert!(values.iter().all(|v| *v >= 0.0));
        assert_eq!(observer.seen.len(), 6);
        assert!(observer.seen[0].ends_with("weights"));
    }

    #[test]
    fn down_and_up_sampling_shapes() {
        let mut scope = Scope::new_root_scope();
        let mut observer = RecordingObserver::default();
        let p = phase(false, &mut scope);
        let x = volume(&[1, 8, 8, 4, 6], &mut scope);
        let mut ctx = LayerContext::new(
            p,
            BatchNormConfig::default(),
            InitConfig::default(),
            &mut observer,
        );
        let down = downsample(x.clone(), 6, Downsample::StridedConv, &mut ctx, &mut scope).unwrap();
        let pooled = downsample(x.clone(), 6, Downsample::MaxPool, &mut ctx, &mut scope).unwrap();
        let up = upsample(x, [8, 8, 4], 6, &mut ctx, &mut scope).unwrap();
        let vars = ctx.trainable.clone();
        drop(ctx);

        assert_eq!(fetch_dims(&scope, &vars, &down).0, vec![1, 4, 4, 2, 6]);
        assert_eq!(fetch_dims(&scope, &vars, &pooled).0, vec![1, 4, 4, 2, 6]);
        assert_eq!(fetch_dims(&scope, &vars, &up).0, vec![1, 16, 16, 8, 3]);
    }

    /// Runs one batch norm on the test volume under a fixed phase, returning
    /// the input and output values.
    fn normalize(training: bool) -> (Vec<f32>, Vec<f32>) {
        let mut scope = Scope::new_root_scope();
        let mut observer = RecordingObserver::default();
        let p = phase(training, &mut scope);
        let x = volume(&[2, 4, 4, 4, 3], &mut scope);
        let mut ctx = LayerContext::new(
            p,
            BatchNormConfig::default(),
            InitConfig::default(),
            &mut observer,
        );
        let out = batch_norm(x.clone(), 3, &mut ctx, &mut scope).unwrap();
        let mut vars = ctx.trainable.clone();
        vars.extend(ctx.moving.clone());
        drop(ctx);
        let (_, input) = fetch_dims(&scope, &[], &x);
        let (dims, output) = fetch_dims(&scope, &vars, &out);
        assert_eq!(dims, vec![2, 4, 4, 4, 3]);
        (input, output)
    }

    #[test]
    fn training_phase_normalizes_with_batch_statistics() {
        let (_, output) = normalize(true);
        for c in 0..3 {
            let values: Vec<f32> = output.iter().skip(c).step_by(3).copied().collect();
            let n = values.len() as f32;
            let mean = values.iter().sum::<f32>() / n;
            let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
            assert!(mean.abs() < 1e-4, "channel {} mean {}", c, mean);
            assert!((var - 1.0).abs() < 1e-2, "channel {} variance {}", c, var);
        }
    }

    #[test]
    fn inference_phase_uses_moving_statistics() {
        // fresh moving statistics: mean 0, variance 1
        let (input, output) = normalize(false);
        let scale = 1.0 / (1.0f32 + BatchNormConfig::default().epsilon).sqrt();
        for (x, y) in input.iter().zip(&output) {
            assert!((x * scale - y).abs() < 1e-5);
        }
        assert!(input.iter().any(|x| x.abs() > 1.0));
    }

    #[test]
    fn concat_puts_first_input_first() {
        let mut scope = Scope::new_root_scope();
        let a = volume(&[1, 2, 2, 2, 1], &mut scope);
        let b = volume(&[1, 2, 2, 2, 2], &mut scope);
        let out = concat_channels(&[a, b], &mut scope).unwrap();
        let (dims, values) = fetch_dims(&scope, &[], &out);
        assert_eq!(dims, vec![1, 2, 2, 2, 3]);
        // first voxel: a[0] then b[0], b[1]
        assert_eq!(&values[..3], &[-3.0, -3.0, -2.0]);
    }
}
