//! Multi-rank execution harness for tests and drivers.
//!
//! Runs one future per rank of an in-process world, joins them all, and
//! verifies the world is quiescent afterwards: a message left unmatched or a
//! receive left pending means some rank broke request balance.

use std::future::Future;

use std::sync::Arc;

use crate::{CommResult, Communicator, MemWorld};

/// Locality strings for a synthetic cluster: rank `r` reports
/// `node{r / procs_per_node}`.
pub fn contiguous_localities(size: usize, procs_per_node: usize) -> Vec<String> {
    (0..size).map(|rank| format!("node{}", rank / procs_per_node)).collect()
}

/// Spawns `per_rank` once for every rank of a world with the given
/// localities, waits for all of them, and checks quiescence.
///
/// A panicking rank re-raises its panic here, so test assertions inside the
/// rank closure surface normally.
pub async fn run_world<T, F, Fut>(localities: Vec<String>, mut per_rank: F) -> CommResult<Vec<T>>
where
    F: FnMut(Arc<dyn Communicator>) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let world = MemWorld::with_localities(localities);
    let handles: Vec<_> =
        (0..world.size()).map(|rank| tokio::spawn(per_rank(world.comm(rank)))).collect();
    let mut outputs = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.await {
            Ok(output) => outputs.push(output),
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => panic!("rank task cancelled"),
        }
    }
    world.quiescent()?;
    Ok(outputs)
}
