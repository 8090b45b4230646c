//! Differentiable collectives for expert parallelism.
//!
//! Provides:
//! - All-to-all exchange of dispatch buffers (`all_to_all`)
//! - The all-gather / reduce-scatter pair (`expand` / `contract`)
//! - Process-wide exchange backend selection (`ExchangeRuntime`)

use candle_core::{Result, Tensor};

/// Trait for collective communications.
///
/// Implementations include:
/// - `LocalCommunicator`: In-process simulation for testing
pub trait CollectiveCommunicator: Send + Sync {
    /// Get the rank of this process
    fn rank(&self) -> usize;

    /// Get the total number of processes
    fn world_size(&self) -> usize;

    /// All-reduce: Sum tensor across all ranks and broadcast result.
    fn all_reduce(&self, tensor: &Tensor) -> Result<Tensor>;

    /// All-gather: Gather tensors from all ranks, concatenating along dim 0.
    fn all_gather(&self, tensor: &Tensor) -> Result<Tensor>;

    /// Broadcast: Send tensor from root rank to all others.
    fn broadcast(&self, tensor: &Tensor, root_rank: usize) -> Result<Tensor>;

    /// Reduce-scatter: Sum across ranks, rank `r` keeps chunk `r` of dim 0.
    fn reduce_scatter(&self, tensor: &Tensor) -> Result<Tensor> {
        let reduced = self.all_reduce(tensor)?;
        let chunk_size = reduced.dim(0)? / self.world_size();
        let start = self.rank() * chunk_size;
        reduced.narrow(0, start, chunk_size)
    }

    /// All-to-all: chunk `j` of dim 0 goes to rank `j`; the output holds the
    /// received chunks in rank order.
    fn all_to_all(&self, tensor: &Tensor) -> Result<Tensor> {
        if self.world_size() == 1 {
            return Ok(tensor.clone());
        }
        Err(candle_core::Error::Msg("all_to_all not implemented for this backend".to_string()))
    }

    /// Whether all ranks of the group live in this address space, so that
    /// an in-process shared exchange can serve them.
    fn shares_address_space(&self) -> bool {
        false
    }
}

pub mod all_to_all;
pub mod backend;
pub mod exchange;
pub mod groups;
pub mod sum_ops;

// Re-export commonly used items
pub use all_to_all::{all_to_all, all_to_all_with, AllToAll};
pub use backend::LocalCommunicator;
pub use exchange::{A2aBackend, ExchangeRuntime, ExchangeUniqueId};
pub use groups::ProcessGroup;
pub use sum_ops::{contract, expand, PostAllreduceSum, PreAllreduceSum};

/// Check that dim 0 of `tensor` splits evenly into `world_size` chunks.
pub(crate) fn check_divisible(tensor: &Tensor, world_size: usize, op: &str) -> Result<usize> {
    let dim0 = tensor.dim(0)?;
    if dim0 % world_size != 0 {
        candle_core::bail!(
            "{}: dim 0 of size {} is not divisible by group size {}",
            op,
            dim0,
            world_size
        );
    }
    Ok(dim0 / world_size)
}
