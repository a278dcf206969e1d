//! Multi-peer generation support.
//!
//! Generation itself is strictly sequential; the only cross-peer primitive is
//! the [`TerminationBarrier`] that keeps peers stepping in lock-step until all
//! of them are done.
//!
//! # Usage
//!
//! ```ignore
//! use mmgen_core::distributed::{LocalPeerGroup, TerminationBarrier};
//!
//! let group = LocalPeerGroup::new(2);
//! let peer = group.peer(0)?;
//! assert_eq!(peer.world_size(), 2);
//! ```

mod barrier;
mod error;

pub use barrier::{LocalPeer, LocalPeerGroup, SingleProcessBarrier, TerminationBarrier};
pub use error::{DistributedError, Result};
