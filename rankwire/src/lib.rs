//! Ranked message passing for collective shuffle rounds.
//!
//! This crate models the substrate an MPI-style shuffle engine runs on: a
//! fixed-size world of ranks with tagged point-to-point messages, a blocking
//! wait as the only suspension point, collectives, communicator splits, and
//! node-local shared-memory windows. The [`Communicator`] trait captures that
//! capability contract; [`MemWorld`] provides the in-process implementation
//! where every rank is a tokio task and delivery happens through shared
//! matching queues.
//!
//! Point-to-point matching is per `(source, tag)` pair and non-overtaking
//! within a pair; no ordering is guaranteed across pairs. Sends are eager:
//! posting buffers the payload, so [`Request::wait`] on a send never blocks
//! and `wait_all` on receives is the only place a rank parks.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::oneshot;

mod mem;
pub mod sim;
mod window;

pub use mem::{MemComm, MemWorld};
pub use window::SharedWindow;

/// Result alias for substrate operations.
pub type CommResult<T> = Result<T, CommError>;

/// Errors surfaced by the substrate.
///
/// Cloneable so a single collective failure can be reported to every rank
/// that participated in the call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommError {
    /// A peer rank outside `[0, size)` was named.
    #[error("peer rank {peer} out of range for world of {size} ranks")]
    PeerOutOfRange {
        /// The rank that was named.
        peer: usize,
        /// The communicator size.
        size: usize,
    },
    /// A zero-length message was posted. Zero-byte sends are left unmatched
    /// by real substrates, so the fabric rejects them outright.
    #[error("zero-length message posted to rank {peer}")]
    ZeroLengthMessage {
        /// The destination rank.
        peer: usize,
    },
    /// An arriving message was larger than the posted receive.
    #[error("message from rank {peer} truncated: {got} bytes arrived but {max} were posted")]
    Truncated {
        /// The source rank.
        peer: usize,
        /// Bytes that arrived.
        got: usize,
        /// Bytes the receive allowed.
        max: usize,
    },
    /// Ranks disagreed on which collective they are executing, or a
    /// collective was fed malformed input.
    #[error("collective mismatch: {0}")]
    Collective(String),
    /// The other end of a pending request went away (a rank dropped out of
    /// the round before completing its side).
    #[error("communicator torn down while a request was pending")]
    Disconnected,
    /// A window write fell outside the caller's own region.
    #[error("window write at {offset}+{len} exceeds the owned region of {region} bytes")]
    WindowBounds {
        /// Write offset within the region.
        offset: usize,
        /// Write length.
        len: usize,
        /// The owned region's size.
        region: usize,
    },
}

/// Handle for a posted non-blocking operation.
///
/// Dropping a request without waiting abandons it; the matching message (if
/// any) is discarded when the world is torn down. Engines are expected to
/// wait every request on every exit path, see [`wait_all`].
#[must_use = "requests do nothing unless waited"]
#[derive(Debug)]
pub struct Request {
    inner: RequestInner,
}

#[derive(Debug)]
enum RequestInner {
    /// An eagerly-buffered send; complete at post time.
    Sent,
    /// A receive that matched an already-arrived message at post time.
    Ready(CommResult<Bytes>),
    /// A receive pending on the matching send.
    Pending { peer: usize, rx: oneshot::Receiver<CommResult<Bytes>> },
}

impl Request {
    pub(crate) fn sent() -> Self {
        Request { inner: RequestInner::Sent }
    }

    pub(crate) fn ready(result: CommResult<Bytes>) -> Self {
        Request { inner: RequestInner::Ready(result) }
    }

    pub(crate) fn pending(peer: usize, rx: oneshot::Receiver<CommResult<Bytes>>) -> Self {
        Request { inner: RequestInner::Pending { peer, rx } }
    }

    /// Blocks until the operation completes. Sends resolve to `None`,
    /// receives to the delivered payload.
    pub async fn wait(self) -> CommResult<Option<Bytes>> {
        match self.inner {
            RequestInner::Sent => Ok(None),
            RequestInner::Ready(result) => result.map(Some),
            RequestInner::Pending { peer, rx } => match rx.await {
                Ok(result) => result.map(Some),
                Err(_) => {
                    tracing::debug!(peer, "receive abandoned: sender side tore down");
                    Err(CommError::Disconnected)
                }
            },
        }
    }
}

/// Waits every request in `requests`, draining all of them even when one
/// fails, then reports the first failure. Results are in posting order;
/// sends contribute `None`, receives the delivered payload.
pub async fn wait_all(requests: Vec<Request>) -> CommResult<Vec<Option<Bytes>>> {
    let results = futures::future::join_all(requests.into_iter().map(Request::wait)).await;
    let mut delivered = Vec::with_capacity(results.len());
    let mut first_err = None;
    for result in results {
        match result {
            Ok(payload) => delivered.push(payload),
            Err(err) => first_err = first_err.or(Some(err)),
        }
    }
    match first_err {
        None => Ok(delivered),
        Some(err) => Err(err),
    }
}

/// The substrate capability contract.
///
/// One value per rank; shared across that rank's round logic as
/// `Arc<dyn Communicator>`. All collectives must be called by every rank of
/// the communicator in the same order.
#[async_trait]
pub trait Communicator: Send + Sync {
    /// This rank's index in `[0, size)`.
    fn rank(&self) -> usize;

    /// Number of ranks in the communicator.
    fn size(&self) -> usize;

    /// The locality identifier (host name analog) of this rank.
    fn locality(&self) -> String;

    /// Posts a non-blocking send. Eager: the payload is buffered at post
    /// time and the returned request completes immediately on wait.
    fn isend(&self, peer: usize, tag: u64, payload: Bytes) -> CommResult<Request>;

    /// Posts a non-blocking receive for a message of at most `max_len`
    /// bytes from `peer` with `tag`.
    fn irecv(&self, peer: usize, tag: u64, max_len: usize) -> CommResult<Request>;

    /// Combined blocking exchange. Either side may be absent, mirroring
    /// substrates that accept a NULL buffer for the unused direction.
    async fn send_recv(
        &self,
        send: Option<(usize, u64, Bytes)>,
        recv: Option<(usize, u64, usize)>,
    ) -> CommResult<Option<Bytes>>;

    /// Blocks until every rank of the communicator has arrived.
    async fn barrier(&self) -> CommResult<()>;

    /// Contributes `part` and returns every rank's contribution in rank
    /// order.
    async fn all_gather(&self, part: Bytes) -> CommResult<Vec<Bytes>>;

    /// Vectorized all-to-all: `parts[j]` goes to rank `j`; the result holds
    /// one part from every rank, in rank order. Parts may be empty.
    async fn all_to_all(&self, parts: Vec<Bytes>) -> CommResult<Vec<Bytes>>;

    /// Element-wise maximum reduction; the reduced vector is returned at
    /// `root` and `None` elsewhere.
    async fn reduce_max(&self, values: Vec<f64>, root: usize) -> CommResult<Option<Vec<f64>>>;

    /// Splits the communicator by `color`; ranks sharing a color form a new
    /// communicator ordered by `(key, rank)`.
    async fn split(&self, color: u64, key: usize) -> CommResult<Arc<dyn Communicator>>;

    /// Collectively allocates a shared window with a region of `len` bytes
    /// owned by this rank. See [`SharedWindow`] for the fence discipline.
    async fn window(&self, len: usize) -> CommResult<SharedWindow>;
}
