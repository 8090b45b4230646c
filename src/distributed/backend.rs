use super::CollectiveCommunicator;
use candle_core::{Error, Result, Tensor};
use std::sync::{Arc, Barrier, Mutex, MutexGuard};

struct SharedState {
    buffers: Mutex<Vec<Option<Tensor>>>,
    barrier: Barrier,
}

/// In-process communicator: one instance per thread, all sharing a mailbox.
///
/// Every collective is write, barrier, read, barrier, so all ranks of the
/// group must call the same collectives in the same order.
pub struct LocalCommunicator {
    rank: usize,
    world_size: usize,
    shared: Arc<SharedState>,
}

impl LocalCommunicator {
    pub fn new_group(world_size: usize) -> Vec<Self> {
        let shared = Arc::new(SharedState {
            buffers: Mutex::new((0..world_size).map(|_| None).collect()),
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

    /// A group of one.
    pub fn single() -> Self {
        let shared = Arc::new(SharedState {
            buffers: Mutex::new(vec![None]),
            barrier: Barrier::new(1),
        });
        Self {
            rank: 0,
            world_size: 1,
            shared,
        }
    }

    fn buffers(&self) -> Result<MutexGuard<'_, Vec<Option<Tensor>>>> {
        self.shared
            .buffers
            .lock()
            .map_err(|_| Error::Msg("local communicator mailbox poisoned".to_string()))
    }

    fn publish(&self, tensor: &Tensor) -> Result<()> {
        self.buffers()?[self.rank] = Some(tensor.clone());
        self.shared.barrier.wait();
        Ok(())
    }

    /// Read every rank's published tensor through `f`, then wait for all
    /// readers before the mailbox can be reused.
    fn read_all<T>(&self, f: impl FnOnce(&[&Tensor]) -> Result<T>) -> Result<T> {
        let result = {
            let buffers = self.buffers()?;
            let tensors = buffers
                .iter()
                .enumerate()
                .map(|(rank, t)| {
                    t.as_ref()
                        .ok_or_else(|| Error::Msg(format!("rank {} published nothing", rank)))
                })
                .collect::<Result<Vec<_>>>();
            tensors.and_then(|tensors| f(&tensors))
        };
        self.shared.barrier.wait();
        result
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
        self.read_all(|tensors| {
            let mut sum = tensors[0].clone();
            for t in &tensors[1..] {
                sum = (sum + *t)?;
            }
            Ok(sum)
        })
    }

    fn all_gather(&self, tensor: &Tensor) -> Result<Tensor> {
        self.publish(tensor)?;
        self.read_all(|tensors| Tensor::cat(tensors, 0))
    }

    fn broadcast(&self, tensor: &Tensor, root_rank: usize) -> Result<Tensor> {
        if root_rank >= self.world_size {
            candle_core::bail!("broadcast root {} outside group of {}", root_rank, self.world_size);
        }
        if self.rank == root_rank {
            self.buffers()?[root_rank] = Some(tensor.clone());
        }
        self.shared.barrier.wait();

        let result = self
            .buffers()?
            .get(root_rank)
            .and_then(|t| t.clone())
            .ok_or_else(|| Error::Msg(format!("root {} published nothing", root_rank)));
        self.shared.barrier.wait();
        result
    }

    fn all_to_all(&self, tensor: &Tensor) -> Result<Tensor> {
        if self.world_size == 1 {
            return Ok(tensor.clone());
        }
        let chunk = super::check_divisible(tensor, self.world_size, "all_to_all")?;
        self.publish(tensor)?;
        self.read_all(|tensors| {
            let received = tensors
                .iter()
                .map(|t| t.narrow(0, self.rank * chunk, chunk))
                .collect::<Result<Vec<_>>>()?;
            Tensor::cat(&received, 0)
        })
    }

    fn shares_address_space(&self) -> bool {
        true
    }
}
