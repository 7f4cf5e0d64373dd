//! Dispatch and combine contractions.
//!
//! Two representations: the dense slot layout produced by `TopKGate`
//! (`sec,sm->ecm` / `sec,ecm->sm`) and the orderings produced by `LocalGate`.

use crate::utils::error::{MoeError, Result};
use candle_core::{Device, Tensor};

/// Build a 1-D `u32` index tensor.
pub fn index_tensor(indices: &[u32], device: &Device) -> Result<Tensor> {
    Ok(Tensor::from_vec(indices.to_vec(), (indices.len(),), device)?)
}

/// `sec,sm->ecm`: scatter tokens (N, D) into capacity slots (E, C, D).
pub fn dense_dispatch(dispatch_mask: &Tensor, x: &Tensor) -> Result<Tensor> {
    let (n, e, c) = dispatch_mask.dims3()?;
    let (xn, d) = x.dims2()?;
    if n != xn {
        return Err(MoeError::Invariant(format!(
            "dispatch mask covers {} tokens, batch has {}",
            n, xn
        )));
    }
    let mask = dispatch_mask.to_dtype(x.dtype())?.reshape((n, e * c))?.t()?.contiguous()?;
    Ok(mask.matmul(x)?.reshape((e, c, d))?)
}

/// `sec,ecm->sm`: weighted sum of slot outputs (E, C, D) back to tokens (N, D).
///
/// Tokens whose every selection was dropped get a zero row.
pub fn dense_combine(combine_weights: &Tensor, expert_out: &Tensor) -> Result<Tensor> {
    let (n, e, c) = combine_weights.dims3()?;
    let (oe, oc, d) = expert_out.dims3()?;
    if (e, c) != (oe, oc) {
        return Err(MoeError::Invariant(format!(
            "combine weights ({}, {}) do not match expert output ({}, {})",
            e, c, oe, oc
        )));
    }
    let weights = combine_weights.to_dtype(expert_out.dtype())?.reshape((n, e * c))?;
    Ok(weights.matmul(&expert_out.reshape((e * c, d))?)?)
}

/// Order-based combine: `out[reversed] * w`, summed over the `k` choices.
///
/// Args:
///   expert_out: Expert outputs in expert-sorted order (N * k, D)
///   reversed_order: Sorted row for each flattened (token, choice)
///   weights: Weight per flattened (token, choice) (N * k,)
///   k: Choices per token
pub fn combine_sorted(expert_out: &Tensor, reversed_order: &[u32], weights: &Tensor, k: usize) -> Result<Tensor> {
    let (rows, d) = expert_out.dims2()?;
    if rows != reversed_order.len() {
        return Err(MoeError::Invariant(format!(
            "{} expert rows for {} routed positions",
            rows,
            reversed_order.len()
        )));
    }
    if rows == 0 {
        return Ok(expert_out.clone());
    }
    let index = index_tensor(reversed_order, expert_out.device())?;
    let recovered = expert_out.index_select(&index, 0)?;
    let weights = weights.to_dtype(expert_out.dtype())?.reshape((rows, 1))?;
    let weighted = recovered.broadcast_mul(&weights)?;
    if k > 1 {
        Ok(weighted.reshape((rows / k, k, d))?.sum(1)?)
    } else {
        Ok(weighted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_dense_round_trip_zeroes_dropped() -> Result<()> {
        // token 0 -> (e1, c0), token 1 dropped, token 2 -> (e0, c0)
        let mut mask = vec![0f32; 3 * 2 * 1];
        mask[1] = 1.0;
        mask[4] = 1.0;
        let mask = Tensor::from_vec(mask, (3, 2, 1), &Device::Cpu)?;
        let x = Tensor::from_vec(vec![1f32, 2., 3., 4., 5., 6.], (3, 2), &Device::Cpu)?;

        let slots = dense_dispatch(&mask, &x)?;
        assert_eq!(slots.to_vec3::<f32>()?, vec![vec![vec![5., 6.]], vec![vec![1., 2.]]]);

        let out = dense_combine(&(mask * 0.5)?, &slots)?;
        assert_eq!(out.to_vec2::<f32>()?, vec![vec![0.5, 1.0], vec![0., 0.], vec![2.5, 3.0]]);
        Ok(())
    }

    #[test]
    fn test_combine_sorted_sums_choices() -> Result<()> {
        // one token, k = 2, sorted rows [a, b] came from choices [1, 0]
        let out = Tensor::from_vec(vec![1f32, 10.], (2, 1), &Device::Cpu)?;
        let w = Tensor::from_vec(vec![0.25f32, 0.75], (2,), &Device::Cpu)?;
        let combined = combine_sorted(&out, &[1, 0], &w, 2)?;
        assert_eq!(combined.to_vec2::<f32>()?, vec![vec![10.0 * 0.25 + 0.75]]);
        Ok(())
    }
}
