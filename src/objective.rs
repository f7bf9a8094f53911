//! Overlap based similarity objective between a predicted and a reference
//! class map.
use tensorflow::ops;
use tensorflow::Output;
use tensorflow::Scope;
use tensorflow::Status;

/// Dice similarity per batch element:
///
/// `2 * sum(pred * ref) / (sum(pred^2) + sum(ref^2))`
///
/// summed over the spatial and class axes of two `(batch, x, y, z, class)`
/// tensors of identical shape. The result has shape `[batch]`; turning it
/// into a scalar loss is left to the caller.
///
/// NOTE: when both maps are all zero for a batch element the ratio is 0/0
/// and the score is NaN. Nothing here guards against it; callers feeding
/// empty/empty regions have to handle that element themselves.
pub fn dice_score<O1: Into<Output>, O2: Into<Output>>(
    output_map: O1,
    objective_map: O2,
    scope: &mut Scope,
) -> Result<Output, Status> {
    let mut scope = scope.new_sub_scope("Dice_loss");
    let scope = &mut scope;
    let output_map: Output = output_map.into();
    let objective_map: Output = objective_map.into();
    let axes = ops::constant(&[1i32, 2, 3, 4][..], scope)?;

    // element-wise product of output and truth, summed per batch element
    let mult_sum = ops::sum(
        ops::multiply(output_map.clone(), objective_map.clone(), scope)?,
        axes.clone(),
        scope,
    )?;
    let sum_output = ops::sum(ops::square(output_map, scope)?, axes.clone(), scope)?;
    let sum_objective = ops::sum(ops::square(objective_map, scope)?, axes, scope)?;

    Ok(ops::div(
        ops::multiply(ops::constant(2.0f32, scope)?, mult_sum, scope)?,
        ops::add(sum_output, sum_objective, scope)?,
        scope,
    )?
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tensorflow::{DataType, Session, SessionOptions, SessionRunArgs, Shape, Tensor};

    const DIMS: [u64; 5] = [2, 4, 4, 4, 2];

    struct Harness {
        scope: Scope,
        pred: Output,
        reference: Output,
        score: Output,
    }

    impl Harness {
        fn new() -> Self {
            let mut scope = Scope::new_root_scope();
            let shape = Shape::from(Some(DIMS.iter().map(|&d| Some(d as i64)).collect::<Vec<_>>()));
            let pred: Output = ops::Placeholder::new()
                .dtype(DataType::Float)
                .shape(shape.clone())
                .build(&mut scope.with_op_name("pred"))
                .unwrap()
                .into();
            let reference: Output = ops::Placeholder::new()
                .dtype(DataType::Float)
                .shape(shape)
                .build(&mut scope.with_op_name("reference"))
                .unwrap()
                .into();
            let score = dice_score(pred.clone(), reference.clone(), &mut scope).unwrap();
            Harness {
                scope,
                pred,
                reference,
                score,
            }
        }

        fn score(&self, pred: &[f32], reference: &[f32]) -> Vec<f32> {
            let session = Session::new(&SessionOptions::new(), &self.scope.graph()).unwrap();
            let pred = Tensor::new(&DIMS).with_values(pred).unwrap();
            let reference = Tensor::new(&DIMS).with_values(reference).unwrap();
            let mut args = SessionRunArgs::new();
            args.add_feed(&self.pred.operation, self.pred.index, &pred);
            args.add_feed(&self.reference.operation, self.reference.index, &reference);
            let token = args.request_fetch(&self.score.operation, self.score.index);
            session.run(&mut args).unwrap();
            let out: Tensor<f32> = args.fetch(token).unwrap();
            assert_eq!(out.dims(), &[2]);
            out.to_vec()
        }
    }

    fn len() -> usize {
        DIMS.iter().product::<u64>() as usize
    }

    /// One voxel set per class in every batch element.
    fn one_voxel_per_class(offset: usize) -> Vec<f32> {
        let mut v = vec![0.0; len()];
        let per_batch = len() / 2;
        for b in 0..2 {
            v[b * per_batch + offset * 2] = 1.0;
            v[b * per_batch + (offset + 5) * 2 + 1] = 1.0;
        }
        v
    }

    #[test]
    fn identical_masks_score_one() {
        let h = Harness::new();
        let mask = one_voxel_per_class(0);
        for s in h.score(&mask, &mask) {
            assert!((s - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn disjoint_masks_score_zero_and_order_does_not_matter() {
        let h = Harness::new();
        let a = one_voxel_per_class(0);
        let b = one_voxel_per_class(1);
        assert_eq!(h.score(&a, &b), vec![0.0, 0.0]);

        let soft: Vec<f32> = (0..len()).map(|i| (i % 5) as f32 / 4.0).collect();
        let ab = h.score(&a, &soft);
        let ba = h.score(&soft, &a);
        for (x, y) in ab.iter().zip(&ba) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn empty_regions_are_nan() {
        let h = Harness::new();
        let zeros = vec![0.0; len()];
        assert!(h.score(&zeros, &zeros).iter().all(|s| s.is_nan()));
    }
}
