//! Offline resource management: the write-ahead operation log, the
//! per-stream walker that plans garbage collection / rebuild / repack
//! work, the executor that applies it, and the namespace-wide driver.

pub mod log;
pub mod manager;
pub mod process;
pub mod repack;
pub mod walker;

pub use log::{LogMode, OpInfo, OpType, ResourceLog};
pub use manager::{run, NsSummary, RsrcMgrOpts, RunSummary};
pub use walker::{StreamWalker, Thresholds, WalkerReport};
