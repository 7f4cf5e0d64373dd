//! Language-model loss with the MoE auxiliary terms folded in.

use crate::utils::error::{MoeError, Result};
use candle_core::{DType, Tensor, D};
use candle_nn::ops;
use tracing::debug;

/// Next-token cross entropy over logits (B, T, V) and targets (B, T).
pub fn cross_entropy_loss(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let (batch_size, seq_len, vocab_size) = logits.dims3()?;
    if seq_len < 2 {
        return Err(MoeError::Invariant(format!(
            "next-token loss needs at least 2 positions, got {}",
            seq_len
        )));
    }

    // Shift for next-token prediction
    let shift_logits = logits.narrow(1, 0, seq_len - 1)?;
    let shift_targets = targets.narrow(1, 1, seq_len - 1)?;

    let flat_logits = shift_logits.reshape((batch_size * (seq_len - 1), vocab_size))?;
    let flat_targets = shift_targets.reshape((batch_size * (seq_len - 1),))?;

    let log_probs = ops::log_softmax(&flat_logits.to_dtype(DType::F32)?, D::Minus1)?;
    let flat_targets = flat_targets.to_dtype(DType::U32)?;
    let target_log_probs = log_probs.gather(&flat_targets.unsqueeze(1)?, 1)?.squeeze(1)?;

    Ok(target_log_probs.neg()?.mean_all()?)
}

/// Breakdown of one loss evaluation.
pub struct LossOutput {
    pub total: Tensor,
    pub lm_loss: f64,
    pub aux_loss: f64,
}

/// `lm_loss + moe_loss_weight * sum(aux_losses)`.
#[derive(Debug, Clone, Copy)]
pub struct MoeCrossEntropy {
    pub moe_loss_weight: f64,
}

impl MoeCrossEntropy {
    pub fn new(moe_loss_weight: f64) -> Self {
        Self { moe_loss_weight }
    }

    pub fn compute(&self, logits: &Tensor, targets: &Tensor, aux_losses: &[Tensor]) -> Result<LossOutput> {
        let lm = cross_entropy_loss(logits, targets)?;
        let device = lm.device().clone();

        let mut aux = Tensor::zeros((), DType::F32, &device)?;
        for loss in aux_losses {
            aux = (aux + loss.to_dtype(DType::F32)?)?;
        }
        let total = (&lm + (&aux * self.moe_loss_weight)?)?;

        let lm_loss = lm.to_scalar::<f32>()? as f64;
        let aux_loss = aux.to_scalar::<f32>()? as f64;
        debug!(lm_loss = lm_loss, aux_loss = aux_loss, layers = aux_losses.len(), "loss");
        Ok(LossOutput { total, lm_loss, aux_loss })
    }
}
