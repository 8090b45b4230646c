//! Sparse Mixture-of-Experts dispatch and combine with differentiable
//! collectives, on candle.
//!
//! - [`dispatch`]: capacity-bounded scatter of tokens into expert banks and
//!   the gate-weighted combine back
//! - [`distributed`]: all-to-all and the gather / reduce-scatter pair used
//!   for expert parallelism
//! - [`autograd`]: explicit gradient rules recorded on candle's graph

pub mod autograd;
pub mod dispatch;
pub mod distributed;
pub mod utils;

pub use dispatch::{DispatchConfig, FastDispatcher};
pub use distributed::{all_to_all, contract, expand, A2aBackend, ExchangeRuntime, ProcessGroup};
pub use utils::error::{MoeError, Result};
