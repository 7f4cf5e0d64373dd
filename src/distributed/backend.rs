use super::CollectiveCommunicator;
use candle_core::{Error, Result, Tensor};
use std::sync::{Arc, Barrier, Mutex, MutexGuard};

struct SharedState {
    buffers: Mutex<Vec<Option<Tensor>>>,
    splits: Mutex<Vec<Vec<usize>>>,
    barrier: Barrier,
}

/// In-process communicator: one instance per rank, each driven by its own thread.
///
/// Every collective is a write / barrier / read / barrier rendezvous, so a rank
/// that skips a call blocks the others forever, exactly like a real transport.
pub struct LocalCommunicator {
    rank: usize,
    world_size: usize,
    shared: Arc<SharedState>,
}

impl LocalCommunicator {
    pub fn new_group(world_size: usize) -> Vec<Self> {
        let shared = Arc::new(SharedState {
            buffers: Mutex::new((0..world_size).map(|_| None).collect()),
            splits: Mutex::new(vec![Vec::new(); world_size]),
            barrier: Barrier::new(world_size),
        });

        (0..world_size)
            .map(|rank| Self {
                rank,
                world_size,
                shared: shared.clone(),
            })
            .collect()
    }

    fn buffers(&self) -> Result<MutexGuard<'_, Vec<Option<Tensor>>>> {
        self.shared
            .buffers
            .lock()
            .map_err(|e| Error::Msg(format!("rank {}: poisoned buffer lock: {}", self.rank, e)))
    }

    fn publish(&self, tensor: &Tensor) -> Result<()> {
        let mut buffers = self.buffers()?;
        buffers[self.rank] = Some(tensor.clone());
        Ok(())
    }

    fn published(buffers: &[Option<Tensor>], rank: usize) -> Result<&Tensor> {
        buffers[rank]
            .as_ref()
            .ok_or_else(|| Error::Msg(format!("rank {} did not publish a tensor", rank)))
    }
}

impl CollectiveCommunicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce(&self, tensor: &Tensor) -> Result<Tensor> {
        self.publish(tensor)?;
        self.shared.barrier.wait();

        let sum = {
            let buffers = self.buffers()?;
            let mut sum = Self::published(&buffers, 0)?.clone();
            for rank in 1..self.world_size {
                sum = (sum + Self::published(&buffers, rank)?)?;
            }
            sum
        };

        // Nobody may overwrite its slot before every rank has read.
        self.shared.barrier.wait();
        Ok(sum)
    }

    fn all_gather(&self, tensor: &Tensor) -> Result<Tensor> {
        self.publish(tensor)?;
        self.shared.barrier.wait();

        let gathered = {
            let buffers = self.buffers()?;
            let tensors = (0..self.world_size)
                .map(|rank| Self::published(&buffers, rank).cloned())
                .collect::<Result<Vec<_>>>()?;
            Tensor::cat(&tensors, 0)?
        };

        self.shared.barrier.wait();
        Ok(gathered)
    }

    fn all_to_all_variable(
        &self,
        tensor: &Tensor,
        input_splits: &[usize],
        output_splits: &[usize],
    ) -> Result<Tensor> {
        let invalid = match tensor.dim(0) {
            Err(e) => Some(format!("all_to_all: {}", e)),
            Ok(_) if input_splits.len() != self.world_size || output_splits.len() != self.world_size => {
                Some(format!(
                    "all_to_all: expected {} splits, got {} input / {} output",
                    self.world_size,
                    input_splits.len(),
                    output_splits.len()
                ))
            }
            Ok(rows) if input_splits.iter().sum::<usize>() != rows => Some(format!(
                "all_to_all: input splits {:?} do not cover {} rows",
                input_splits, rows
            )),
            Ok(_) => None,
        };

        // A rank with bad splits still joins both rendezvous; it publishes no
        // splits so its peers fail instead of blocking.
        self.publish(tensor)?;
        {
            let mut splits = self
                .shared
                .splits
                .lock()
                .map_err(|e| Error::Msg(format!("poisoned splits lock: {}", e)))?;
            splits[self.rank] = if invalid.is_some() { Vec::new() } else { input_splits.to_vec() };
        }
        self.shared.barrier.wait();

        let received = match invalid {
            Some(msg) => Err(Error::Msg(format!("rank {}: {}", self.rank, msg))),
            None => self.receive(tensor, output_splits),
        };

        // The second barrier runs even on error so peers are not left waiting.
        self.shared.barrier.wait();
        received
    }
}

impl LocalCommunicator {
    /// Read this rank's partition from every peer; called between the two barriers.
    fn receive(&self, tensor: &Tensor, output_splits: &[usize]) -> Result<Tensor> {
        let buffers = self.buffers()?;
        let splits = self
            .shared
            .splits
            .lock()
            .map_err(|e| Error::Msg(format!("poisoned splits lock: {}", e)))?;

        let mut parts = Vec::with_capacity(self.world_size);
        for (peer, peer_splits) in splits.iter().enumerate() {
            if peer_splits.len() != self.world_size {
                return Err(Error::Msg(format!(
                    "all_to_all: rank {} published no valid splits",
                    peer
                )));
            }
            let offset: usize = peer_splits[..self.rank].iter().sum();
            let len = peer_splits[self.rank];
            if len != output_splits[peer] {
                return Err(Error::Msg(format!(
                    "all_to_all: rank {} expected {} rows from rank {}, peer sent {}",
                    self.rank, output_splits[peer], peer, len
                )));
            }
            if len > 0 {
                parts.push(Self::published(&buffers, peer)?.narrow(0, offset, len)?);
            }
        }

        if parts.is_empty() {
            let mut dims = tensor.dims().to_vec();
            dims[0] = 0;
            Tensor::zeros(dims, tensor.dtype(), tensor.device())
        } else {
            Tensor::cat(&parts, 0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use std::thread;

    #[test]
    fn test_all_reduce() -> Result<()> {
        let world_size = 4;
        let comms = LocalCommunicator::new_group(world_size);

        let handles: Vec<_> = comms.into_iter().map(|comm| {
            thread::spawn(move || -> Result<f32> {
                let t = Tensor::new(&[1.0f32], &Device::Cpu)?;
                let res = comm.all_reduce(&t)?;
                res.get(0)?.to_scalar::<f32>()
            })
        }).collect();

        for h in handles {
            let val = h.join().expect("rank thread panicked")?;
            assert_eq!(val, 4.0);
        }
        Ok(())
    }

    #[test]
    fn test_all_to_all_variable() -> Result<()> {
        // rank r sends (r + 1) rows to every peer, each row tagged 10 * r + peer
        let world_size = 3;
        let comms = LocalCommunicator::new_group(world_size);

        let handles: Vec<_> = comms.into_iter().map(|comm| {
            thread::spawn(move || -> Result<Vec<f32>> {
                let rank = comm.rank();
                let mut rows = Vec::new();
                for peer in 0..world_size {
                    for _ in 0..=rank {
                        rows.push((10 * rank + peer) as f32);
                    }
                }
                let n = rows.len();
                let t = Tensor::from_vec(rows, (n, 1), &Device::Cpu)?;
                let input_splits = vec![rank + 1; world_size];
                let output_splits: Vec<usize> = (0..world_size).map(|peer| peer + 1).collect();
                let out = comm.all_to_all_variable(&t, &input_splits, &output_splits)?;
                out.flatten_all()?.to_vec1::<f32>()
            })
        }).collect();

        for (rank, h) in handles.into_iter().enumerate() {
            let got = h.join().expect("rank thread panicked")?;
            let mut expected = Vec::new();
            for peer in 0..world_size {
                for _ in 0..=peer {
                    expected.push((10 * peer + rank) as f32);
                }
            }
            assert_eq!(got, expected);
        }
        Ok(())
    }

    #[test]
    fn test_all_to_all_rejects_split_mismatch() -> Result<()> {
        let comms = LocalCommunicator::new_group(2);
        let handles: Vec<_> = comms.into_iter().map(|comm| {
            thread::spawn(move || -> bool {
                let t = match Tensor::zeros((2, 1), candle_core::DType::F32, &Device::Cpu) {
                    Ok(t) => t,
                    Err(_) => return false,
                };
                // every rank claims it will receive 2 rows from each peer but sends 1
                comm.all_to_all_variable(&t, &[1, 1], &[2, 2]).is_err()
            })
        }).collect();

        for h in handles {
            assert!(h.join().expect("rank thread panicked"));
        }
        Ok(())
    }

    #[test]
    fn test_bad_splits_on_one_rank_fail_every_rank() -> Result<()> {
        let comms = LocalCommunicator::new_group(2);
        let handles: Vec<_> = comms.into_iter().map(|comm| {
            thread::spawn(move || -> bool {
                let t = match Tensor::zeros((2, 1), candle_core::DType::F32, &Device::Cpu) {
                    Ok(t) => t,
                    Err(_) => return false,
                };
                // rank 1 gives splits that do not cover its rows; nobody may hang
                let input: &[usize] = if comm.rank() == 0 { &[1, 1] } else { &[3, 0] };
                comm.all_to_all_variable(&t, input, &[1, 1]).is_err()
            })
        }).collect();

        for h in handles {
            assert!(h.join().expect("rank thread panicked"));
        }
        Ok(())
    }
}
