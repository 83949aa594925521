//! Topology-aware many-to-few / few-to-many collective shuffles.
//!
//! A shuffle round moves irregularly sized byte payloads between producers
//! and a distinguished subset of *aggregators* over a ranked message-passing
//! substrate ([`rankwire`]). The crate is organized the way a round flows:
//!
//! 1. [`topology`] maps ranks to nodes and elects a proxy per node.
//! 2. [`aggregators`] elects the global aggregator list.
//! 3. [`binding`] extends it into a per-node local aggregator set and binds
//!    every rank to exactly one local aggregator.
//! 4. [`plan`] carries the per-pair sizes and payload buffers and performs
//!    the explicit size agreement.
//! 5. [`engine`] executes one round under any of the interchangeable
//!    schedule variants; all of them produce byte-identical results and
//!    differ only in timing.
//! 6. [`pattern`] verifies the delivered bytes; [`metrics`] records the
//!    per-phase wall clocks.
//!
//! Rounds are independent and stateless with respect to each other.

use rankwire::CommError;

pub mod aggregators;
pub mod binding;
pub mod engine;
pub mod metrics;
pub mod pattern;
pub mod plan;
pub mod topology;

pub use engine::{shuffle, RoundContext, Variant};

/// Result alias for shuffle operations.
pub type ShuffleResult<T> = Result<T, ShuffleError>;

/// Errors a shuffle round can surface. Nothing is swallowed: any failing
/// component reports here after draining its pending requests.
#[derive(Debug, thiserror::Error)]
pub enum ShuffleError {
    /// Locality discovery did not produce a usable node map; the round was
    /// never started.
    #[error("topology discovery failed")]
    TopologyUnavailable(#[source] CommError),
    /// The caller's parameters are inconsistent (aggregator count, binder
    /// cap, size-matrix asymmetry, malformed peer metadata).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A substrate call failed; the round is aborted with the substrate's
    /// error preserved.
    #[error("substrate failure, round aborted")]
    Substrate(#[from] CommError),
    /// The result verifier found a byte that does not match the expected
    /// pattern (test harness only).
    #[error(
        "mismatch at receiver {receiver}, sender {sender}, offset {offset}: \
         expected {expected:#04x}, got {actual:#04x}"
    )]
    VerifyMismatch {
        /// Rank that produced the byte.
        sender: usize,
        /// Rank that received it.
        receiver: usize,
        /// Byte offset within the pair's message.
        offset: usize,
        /// The expected pattern byte.
        expected: u8,
        /// The byte actually found.
        actual: u8,
    },
}
