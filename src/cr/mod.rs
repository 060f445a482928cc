//! Conflict resolution: replaying a device-private unmerged branch onto the
//! advanced master branch and publishing a single resolution revision.

mod chains;
mod resolve;

pub use chains::{ChainSet, OpChain};
pub use resolve::{conflict_name, resolve};
