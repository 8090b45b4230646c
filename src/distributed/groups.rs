//! Process group handles.
//!
//! Group creation is the caller's business; a `ProcessGroup` only pairs a
//! communicator with the global ranks it spans.

use super::backend::LocalCommunicator;
use super::CollectiveCommunicator;
use crate::utils::error::{MoeError, Result};
use std::sync::Arc;
use tracing::debug;

/// Process group handle
#[derive(Clone)]
pub struct ProcessGroup {
    /// Communicator for this group
    pub communicator: Arc<dyn CollectiveCommunicator>,
    /// Ranks in this group (global rank -> local rank mapping)
    pub ranks: Vec<usize>,
    /// Size of this group
    pub size: usize,
}

impl ProcessGroup {
    pub fn new(communicator: Arc<dyn CollectiveCommunicator>, ranks: Vec<usize>) -> Result<Self> {
        let size = ranks.len();
        if size != communicator.world_size() {
            return Err(MoeError::Distributed(format!(
                "group lists {} ranks but its communicator spans {}",
                size,
                communicator.world_size()
            )));
        }
        Ok(Self { communicator, ranks, size })
    }

    /// A group holding only this process.
    pub fn single() -> Self {
        Self {
            communicator: Arc::new(LocalCommunicator::single()),
            ranks: vec![0],
            size: 1,
        }
    }

    /// One handle per thread of an in-process group of `world_size` ranks.
    pub fn local(world_size: usize) -> Vec<Self> {
        debug!(world_size, "Creating in-process group");
        LocalCommunicator::new_group(world_size)
            .into_iter()
            .map(|comm| Self {
                communicator: Arc::new(comm),
                ranks: (0..world_size).collect(),
                size: world_size,
            })
            .collect()
    }

    /// Rank of this process within the group
    pub fn rank(&self) -> usize {
        self.communicator.rank()
    }

    /// Get local rank within this group
    pub fn local_rank(&self, global_rank: usize) -> Option<usize> {
        self.ranks.iter().position(|&r| r == global_rank)
    }

    pub fn is_single(&self) -> bool {
        self.size == 1
    }
}

impl std::fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("rank", &self.rank())
            .field("ranks", &self.ranks)
            .field("size", &self.size)
            .finish()
    }
}
