//! Agent registry, reconciliation, and lifecycle control for `orch`.

pub mod event_log;
pub mod lifecycle;
pub mod lock;
pub mod merge;
pub mod reconciler;
pub mod registry;

#[cfg(test)]
mod test_support;

pub use event_log::*;
pub use lifecycle::*;
pub use lock::*;
pub use merge::*;
pub use reconciler::*;
pub use registry::*;
