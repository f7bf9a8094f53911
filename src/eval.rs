//! Host side helpers for fetched tensors: conversion to `ndarray` and the
//! dice score computed outside the graph, one batch element per rayon task.
use ndarray::{Array1, Array5, ArrayView4, ArrayView5, ArrayViewD, Axis, Ix5, IxDyn};
use rayon::prelude::*;
use tensorflow::Tensor;

use crate::{Error, Result};

/// Dynamic-rank view of a fetched tensor.
pub fn tensor_view(tensor: &Tensor<f32>) -> Result<ArrayViewD<'_, f32>> {
    let dims: Vec<usize> = tensor.dims().iter().map(|&d| d as usize).collect();
    Ok(ArrayViewD::from_shape(IxDyn(&dims), &tensor[..])?)
}

/// Copies a fetched `(batch, x, y, z, class)` tensor into an owned array.
pub fn tensor_to_array5(tensor: &Tensor<f32>) -> Result<Array5<f32>> {
    Ok(tensor_view(tensor)?.into_dimensionality::<Ix5>()?.to_owned())
}

fn dice(pred: &ArrayView4<f32>, reference: &ArrayView4<f32>) -> f32 {
    let mut inter = 0.0f32;
    let mut sum_pred = 0.0f32;
    let mut sum_ref = 0.0f32;
    ndarray::Zip::from(pred).and(reference).for_each(|&p, &r| {
        inter += p * r;
        sum_pred += p * p;
        sum_ref += r * r;
    });
    2.0 * inter / (sum_pred + sum_ref)
}

/// Host counterpart of [`crate::objective::dice_score`], one score per batch
/// element. Empty/empty elements are NaN, as in the graph version.
pub fn dice_scores(pred: ArrayView5<f32>, reference: ArrayView5<f32>) -> Result<Array1<f32>> {
    if pred.shape() != reference.shape() {
        return Err(Error::ShapeMismatch {
            context: "dice_scores".to_string(),
            left: pred.shape().iter().map(|&d| d as u64).collect(),
            right: reference.shape().iter().map(|&d| d as u64).collect(),
        });
    }
    let pairs: Vec<(ArrayView4<f32>, ArrayView4<f32>)> =
        pred.outer_iter().zip(reference.outer_iter()).collect();
    let scores: Vec<f32> = pairs.par_iter().map(|(p, r)| dice(p, r)).collect();
    Ok(Array1::from(scores))
}

/// Largest distance from 1 of any voxel's sum over the class axis.
pub fn max_class_sum_error(probabilities: ArrayView5<f32>) -> f32 {
    probabilities
        .sum_axis(Axis(4))
        .iter()
        .fold(0.0f32, |worst, s| worst.max((s - 1.0).abs()))
}
