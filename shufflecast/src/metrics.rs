//! Per-phase wall-clock recording for shuffle rounds.
//!
//! Four cumulative clocks wrap the phases of a round (request posting, send
//! waits, receive waits, barriers) plus the round total. Timestamps are
//! taken around each phase and never inside the request-completion path;
//! nothing is published until the round ends.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rankwire::Communicator;

use crate::{ShuffleError, ShuffleResult};

/// One rank's clocks for one round.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RoundMetrics {
    /// Time spent posting non-blocking requests.
    pub post: Duration,
    /// Time spent blocked on send completions.
    pub wait_send: Duration,
    /// Time spent blocked on receive completions.
    pub wait_recv: Duration,
    /// Time spent in in-round barriers.
    pub barrier: Duration,
    /// Wall-clock time of the whole round.
    pub total: Duration,
}

impl RoundMetrics {
    /// The clocks as seconds, in reporting order.
    pub fn as_seconds(&self) -> [f64; 5] {
        [
            self.post.as_secs_f64(),
            self.wait_send.as_secs_f64(),
            self.wait_recv.as_secs_f64(),
            self.barrier.as_secs_f64(),
            self.total.as_secs_f64(),
        ]
    }

    /// Rebuilds clocks from the `as_seconds` representation.
    pub fn from_seconds(seconds: [f64; 5]) -> Self {
        RoundMetrics {
            post: Duration::from_secs_f64(seconds[0]),
            wait_send: Duration::from_secs_f64(seconds[1]),
            wait_recv: Duration::from_secs_f64(seconds[2]),
            barrier: Duration::from_secs_f64(seconds[3]),
            total: Duration::from_secs_f64(seconds[4]),
        }
    }
}

/// Reduces one round's clocks with MAX across ranks; the result lands at
/// `root` and `None` elsewhere.
pub async fn reduce_max(
    comm: &Arc<dyn Communicator>,
    metrics: &RoundMetrics,
    root: usize,
) -> ShuffleResult<Option<RoundMetrics>> {
    let reduced = comm.reduce_max(metrics.as_seconds().to_vec(), root).await?;
    Ok(reduced.map(|values| {
        let mut seconds = [0.0; 5];
        seconds.copy_from_slice(&values);
        RoundMetrics::from_seconds(seconds)
    }))
}

/// Gathers every rank's per-round series; each rank receives the full
/// rank-major matrix. The driver writes its detail reports from rank 0's
/// copy.
pub async fn gather_series(
    comm: &Arc<dyn Communicator>,
    rounds: &[RoundMetrics],
) -> ShuffleResult<Vec<Vec<RoundMetrics>>> {
    let rows: Vec<[f64; 5]> = rounds.iter().map(RoundMetrics::as_seconds).collect();
    let encoded = Bytes::from(bincode::serialize(&rows).expect("second rows serialize"));
    let gathered = comm.all_gather(encoded).await?;
    gathered
        .iter()
        .map(|raw| {
            bincode::deserialize::<Vec<[f64; 5]>>(raw)
                .map(|rows| rows.into_iter().map(RoundMetrics::from_seconds).collect())
                .map_err(|err| {
                    ShuffleError::InvalidConfig(format!("malformed metrics series: {err}"))
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_round_trip() {
        let metrics = RoundMetrics {
            post: Duration::from_micros(120),
            wait_send: Duration::from_micros(7),
            wait_recv: Duration::from_millis(3),
            barrier: Duration::ZERO,
            total: Duration::from_millis(4),
        };
        let rebuilt = RoundMetrics::from_seconds(metrics.as_seconds());
        assert!((rebuilt.total.as_secs_f64() - metrics.total.as_secs_f64()).abs() < 1e-12);
        assert_eq!(Duration::ZERO, rebuilt.barrier);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn max_reduction_lands_at_root() {
        let outputs = rankwire::sim::run_world(vec!["n".to_owned(); 3], |comm| async move {
            let mine = RoundMetrics {
                post: Duration::from_secs(comm.rank() as u64),
                ..RoundMetrics::default()
            };
            reduce_max(&comm, &mine, 0).await.unwrap()
        })
        .await
        .unwrap();
        assert_eq!(Duration::from_secs(2), outputs[0].unwrap().post);
        assert!(outputs[1].is_none() && outputs[2].is_none());
    }
}
