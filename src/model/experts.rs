//! Expert compute units and the per-device expert pool.

use crate::utils::error::{MoeError, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{init, Init, Linear, VarBuilder};
use std::sync::Arc;

/// A compute unit tokens can be routed to: (K, D) -> (K, D).
pub trait Expert: Send + Sync {
    fn forward(&self, x: &Tensor) -> Result<Tensor>;

    /// Trainable tensors, in a fixed order.
    fn weights(&self) -> Vec<Tensor>;

    /// Parameter paths, in the same order as `weights`.
    fn param_names(&self) -> Vec<String>;
}

fn gelu(x: &Tensor) -> candle_core::Result<Tensor> {
    // Approx GELU: 0.5 * x * (1 + tanh(sqrt(2/pi) * (x + 0.044715 * x^3)))
    let c1 = (2.0f64 / std::f64::consts::PI).sqrt();
    let c2 = 0.044715;
    let x3 = x.powf(3.0)?;
    let inner = ((x + (x3 * c2)?)? * c1)?;
    let tanh = inner.tanh()?;
    (x * 0.5)? * (tanh + 1.0)?
}

/// Two-layer GELU MLP.
pub struct FeedForwardExpert {
    fc1: Linear,
    fc2: Linear,
    prefix: String,
}

impl FeedForwardExpert {
    pub fn new(d_model: usize, hidden: usize, vb: VarBuilder) -> Result<Self> {
        let prefix = vb.prefix();
        let fc1 = candle_nn::linear_no_bias(d_model, hidden, vb.pp("fc1"))?;
        let fc2 = candle_nn::linear_no_bias(hidden, d_model, vb.pp("fc2"))?;
        Ok(Self { fc1, fc2, prefix })
    }

    pub fn from_weights(fc1: Tensor, fc2: Tensor, prefix: impl Into<String>) -> Self {
        Self {
            fc1: Linear::new(fc1, None),
            fc2: Linear::new(fc2, None),
            prefix: prefix.into(),
        }
    }

    /// Same initialisation as `new`, but the weights belong to no `VarMap`.
    pub fn unregistered(d_model: usize, hidden: usize, dtype: DType, device: &Device) -> Result<Self> {
        let fc1 = init::DEFAULT_KAIMING_NORMAL.var((hidden, d_model), dtype, device)?;
        let fc2 = init::DEFAULT_KAIMING_NORMAL.var((d_model, hidden), dtype, device)?;
        Ok(Self::from_weights(fc1.as_tensor().clone(), fc2.as_tensor().clone(), "dense"))
    }

    /// Trainable copy of this expert registered under `vb`.
    pub fn replicate(&self, vb: VarBuilder) -> Result<Self> {
        let prefix = vb.prefix();
        let fc1 = copy_weight(self.fc1.weight(), vb.pp("fc1"))?;
        let fc2 = copy_weight(self.fc2.weight(), vb.pp("fc2"))?;
        Ok(Self::from_weights(fc1, fc2, prefix))
    }
}

/// Create `<vb>.weight` and overwrite it in place with `src`.
fn copy_weight(src: &Tensor, vb: VarBuilder) -> Result<Tensor> {
    let dst = vb.get_with_hints(src.dims(), "weight", Init::Const(0.0))?;
    let src = src.to_dtype(dst.dtype())?.to_device(dst.device())?.contiguous()?;
    dst.slice_set(&src, 0, 0)?;
    Ok(dst)
}

impl Expert for FeedForwardExpert {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.fc1.forward(x)?;
        let x = gelu(&x)?;
        Ok(self.fc2.forward(&x)?)
    }

    fn weights(&self) -> Vec<Tensor> {
        vec![self.fc1.weight().clone(), self.fc2.weight().clone()]
    }

    fn param_names(&self) -> Vec<String> {
        vec![
            format!("{}.fc1.weight", self.prefix),
            format!("{}.fc2.weight", self.prefix),
        ]
    }
}

/// Experts resident on this device, indexed `0..len()`.
///
/// Cloning shares the underlying experts, which is how layers in a sharing
/// group reuse one pool.
#[derive(Clone)]
pub struct LocalExperts {
    experts: Vec<Arc<dyn Expert>>,
}

impl LocalExperts {
    pub fn new(experts: Vec<Arc<dyn Expert>>) -> Result<Self> {
        if experts.is_empty() {
            return Err(MoeError::Config("expert pool must not be empty".to_string()));
        }
        Ok(Self { experts })
    }

    /// `num_local` independently initialised feed-forward experts.
    pub fn feed_forward(d_model: usize, hidden: usize, num_local: usize, vb: VarBuilder) -> Result<Self> {
        let experts = (0..num_local)
            .map(|i| {
                FeedForwardExpert::new(d_model, hidden, vb.pp(format!("experts.{}", i)))
                    .map(|e| Arc::new(e) as Arc<dyn Expert>)
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(experts)
    }

    /// `num_local` copies of one dense MLP, registered at `experts.<i>` under `vb`.
    pub fn from_dense(dense: &FeedForwardExpert, num_local: usize, vb: VarBuilder) -> Result<Self> {
        let experts = (0..num_local)
            .map(|i| {
                dense
                    .replicate(vb.pp(format!("experts.{}", i)))
                    .map(|e| Arc::new(e) as Arc<dyn Expert>)
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(experts)
    }

    pub fn len(&self) -> usize {
        self.experts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.experts.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<&Arc<dyn Expert>> {
        self.experts.get(i)
    }

    /// Whether two pools hold the very same experts.
    pub fn shares_with(&self, other: &LocalExperts) -> bool {
        self.experts.len() == other.experts.len()
            && self
                .experts
                .iter()
                .zip(&other.experts)
                .all(|(a, b)| Arc::ptr_eq(a, b))
    }

    pub fn param_names(&self) -> Vec<String> {
        self.experts.iter().flat_map(|e| e.param_names()).collect()
    }

    /// Run expert `i` on the `splits[i]` consecutive rows starting after the
    /// rows of experts `0..i`.
    pub fn forward_split(&self, batch: &Tensor, splits: &[usize]) -> Result<Tensor> {
        let rows = batch.dim(0)?;
        if splits.len() != self.experts.len() {
            return Err(MoeError::Invariant(format!(
                "{} splits for {} local experts",
                splits.len(),
                self.experts.len()
            )));
        }
        if splits.iter().sum::<usize>() != rows {
            return Err(MoeError::Invariant(format!(
                "splits {:?} do not cover {} rows",
                splits, rows
            )));
        }
        if rows == 0 {
            return Ok(batch.clone());
        }

        let mut outputs = Vec::with_capacity(self.experts.len());
        let mut offset = 0;
        for (expert, &len) in self.experts.iter().zip(splits) {
            if len > 0 {
                outputs.push(expert.forward(&batch.narrow(0, offset, len)?)?);
            }
            offset += len;
        }
        Ok(Tensor::cat(&outputs, 0)?)
    }

    /// Run a capacity-shaped batch (G, L, C, D): expert `l` sees all `G * C`
    /// rows of slice `[:, l]`.
    pub fn forward_grouped(&self, batch: &Tensor) -> Result<Tensor> {
        let (g, l, c, d) = batch.dims4()?;
        if l != self.experts.len() {
            return Err(MoeError::Invariant(format!(
                "dispatched batch has {} expert slots, pool holds {}",
                l,
                self.experts.len()
            )));
        }

        let mut outputs = Vec::with_capacity(l);
        for (i, expert) in self.experts.iter().enumerate() {
            let chunk = batch.narrow(1, i, 1)?.reshape((g * c, d))?;
            let out = expert.forward(&chunk)?;
            outputs.push(out.reshape((g, 1, c, d))?);
        }
        Ok(Tensor::cat(&outputs, 1)?)
    }

    /// Fails unless every expert holds the same weights.
    pub fn assert_identical(&self) -> Result<()> {
        let reference = self.experts[0]
            .weights()
            .iter()
            .map(|w| w.flatten_all()?.to_vec1::<f32>())
            .collect::<candle_core::Result<Vec<_>>>()?;

        for (i, expert) in self.experts.iter().enumerate().skip(1) {
            let weights = expert.weights();
            if weights.len() != reference.len() {
                return Err(MoeError::Config(format!("expert {} differs in structure from expert 0", i)));
            }
            for (w, r) in weights.iter().zip(&reference) {
                if &w.flatten_all()?.to_vec1::<f32>()? != r {
                    return Err(MoeError::Config(format!(
                        "dense-initialised routing needs identical experts, expert {} differs from expert 0",
                        i
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    struct Scale(f32);

    impl Expert for Scale {
        fn forward(&self, x: &Tensor) -> Result<Tensor> {
            Ok((x * self.0 as f64)?)
        }
        fn weights(&self) -> Vec<Tensor> {
            Vec::new()
        }
        fn param_names(&self) -> Vec<String> {
            Vec::new()
        }
    }

    #[test]
    fn test_forward_split() -> Result<()> {
        let pool = LocalExperts::new(vec![Arc::new(Scale(1.0)) as Arc<dyn Expert>, Arc::new(Scale(10.0)) as Arc<dyn Expert>, Arc::new(Scale(100.0)) as Arc<dyn Expert>])?;
        let x = Tensor::ones((3, 1), DType::F32, &Device::Cpu)?;

        let out = pool.forward_split(&x, &[1, 0, 2])?;
        assert_eq!(out.flatten_all()?.to_vec1::<f32>()?, vec![1.0, 100.0, 100.0]);

        assert!(matches!(pool.forward_split(&x, &[1, 1, 0]), Err(MoeError::Invariant(_))));
        Ok(())
    }

    #[test]
    fn test_forward_grouped() -> Result<()> {
        let pool = LocalExperts::new(vec![Arc::new(Scale(2.0)) as Arc<dyn Expert>, Arc::new(Scale(3.0)) as Arc<dyn Expert>])?;
        let x = Tensor::ones((2, 2, 1, 1), DType::F32, &Device::Cpu)?;
        let out = pool.forward_grouped(&x)?;
        assert_eq!(out.flatten_all()?.to_vec1::<f32>()?, vec![2.0, 3.0, 2.0, 3.0]);
        Ok(())
    }

    #[test]
    fn test_dense_copies_are_identical() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let dense = FeedForwardExpert::unregistered(4, 8, DType::F32, &Device::Cpu)?;

        let pool = LocalExperts::from_dense(&dense, 3, vb.pp("moe"))?;
        pool.assert_identical()?;
        assert_eq!(pool.param_names()[2], "moe.experts.1.fc1.weight");

        // every replica is a trainable var; the dense source is not
        let data = varmap.data().lock().expect("varmap lock");
        assert!(data.contains_key("moe.experts.2.fc2.weight"));
        assert!(!data.keys().any(|k| k.contains("dense")));
        let stored = data["moe.experts.0.fc1.weight"].as_tensor().flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(stored, dense.weights()[0].flatten_all()?.to_vec1::<f32>()?);
        drop(data);

        let random = LocalExperts::feed_forward(4, 8, 2, vb.pp("random"))?;
        assert!(random.assert_identical().is_err());
        Ok(())
    }
}
