//! Mixture-of-Experts token routing.
//!
//! Capacity-constrained top-k gating, capacity-free permutation routing,
//! all-to-all exchange over an explicit process group, and the composed
//! strategies built from them: flat, hierarchical (cross-device then
//! intra-device), local-only and dense-initialised with overflow fallback.

pub mod benchmarks;
pub mod distributed;
pub mod model;
pub mod training;
pub mod utils;

pub use distributed::{LocalCommunicator, ParamSyncRegistry, ProcessGroup, SyncPolicy};
pub use model::aux_loss::{AuxLoss, RoutingMetadata};
pub use model::layer::MoeLayer;
pub use model::layout::MoeStack;
pub use model::strategy::{ForwardContext, MoeOutput, RoutingStrategy};
pub use utils::config::MoeConfig;
pub use utils::error::{MoeError, Result};
