//! Capacity-bounded sparse dispatch and combine.
//!
//! Tokens are placed into per-expert banks of `capacity` slots according to a
//! routing assignment produced by the gate:
//!
//! ```text
//! x [S, D] --encode--> [E * C, D] --experts--> [E * C, D] --decode--> [S, D]
//! ```
//!
//! Slot `(e, s)` lives at row `e * C + s`. Tokens whose location is at or
//! beyond the capacity are dropped: they contribute nothing and receive zero
//! gradient.

pub mod dispatcher;
pub mod kernels;
pub mod ops;

pub use dispatcher::{select_precision, supports_packed_half, DispatchConfig, FastDispatcher};
pub use kernels::{DispatchKernels, KernelCache, Precision, Route, ShapeKey};
pub use ops::{GatingDecoder, GatingEncoder};
