//activation functions are pure functions that define how each voxel is activated
use tensorflow::ops;
use tensorflow::Output;
use tensorflow::Scope;
use tensorflow::Status;

pub type Activation = Box<dyn Fn(Output, &mut Scope) -> Result<Output, Status>>;

/// Rectifier used after every batch normalized convolution; negative values clamp to zero.
pub fn relu() -> Activation {
    Box::new(|output, scope| Ok(ops::relu(output, scope)?.into()))
}

///normalized exponential over the last (class) axis so that every voxel's
/// values sum to one.
pub fn softmax() -> Activation {
    Box::new(|output, scope| Ok(ops::softmax(output, scope)?.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tensorflow::{Session, SessionOptions, SessionRunArgs, Tensor};

    fn run(act: Activation, values: &[f32], dims: &[u64]) -> Vec<f32> {
        let mut scope = Scope::new_root_scope();
        let input = ops::constant(Tensor::new(dims).with_values(values).unwrap(), &mut scope)
            .unwrap();
        let out = act(input.into(), &mut scope).unwrap();
        let session = Session::new(&SessionOptions::new(), &scope.graph()).unwrap();
        let mut args = SessionRunArgs::new();
        let fetch = args.request_fetch(&out.operation, out.index);
        session.run(&mut args).unwrap();
        let res: Tensor<f32> = args.fetch(fetch).unwrap();
        res.to_vec()
    }

    #[test]
    fn relu_clamps_negatives() {
        assert_eq!(run(relu(), &[-2.0, 0.0, 3.5], &[3]), vec![0.0, 0.0, 3.5]);
    }

    #[test]
    fn softmax_normalizes_last_axis() {
        let out = run(softmax(), &[1.0, 2.0, 3.0, 0.0, 0.0, 0.0], &[1, 1, 1, 2, 3]);
        assert!((out[..3].iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!((out[3] - 1.0 / 3.0).abs() < 1e-5);
    }
}
