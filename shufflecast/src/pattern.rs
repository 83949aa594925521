//! Deterministic payload generation and byte-exact verification.

use crate::plan::ShufflePlan;
use crate::{ShuffleError, ShuffleResult};

/// The pattern byte for `offset` of the `sender → receiver` message in
/// `round`. Pure, so any byte of any round can be recomputed at the
/// receiver without shipping reference data.
pub fn map_data(sender: usize, receiver: usize, offset: usize, round: u32) -> u8 {
    let a = sender as i64;
    let b = receiver as i64;
    let c = offset as i64;
    let d = round as i64;
    let value = a
        .wrapping_mul(123)
        .wrapping_add(b.wrapping_mul(653))
        .wrapping_add((c + a + b).wrapping_mul(33))
        .wrapping_add(14i64.wrapping_mul(a - 742).wrapping_mul(b - 15))
        .wrapping_add(d);
    value as u8
}

/// Fills every outgoing message of `plan` with the pattern.
pub fn fill(plan: &mut ShufflePlan, rank: usize) {
    let round = plan.round();
    for peer in 0..plan.size() {
        let part = plan.send_part_mut(peer);
        for (offset, byte) in part.iter_mut().enumerate() {
            *byte = map_data(rank, peer, offset, round);
        }
    }
}

/// Checks every received byte of `plan` against the pattern, reporting the
/// first mismatch with its full coordinates.
pub fn verify(plan: &ShufflePlan, rank: usize) -> ShuffleResult<()> {
    let round = plan.round();
    for sender in 0..plan.size() {
        for (offset, &actual) in plan.recv_part(sender).iter().enumerate() {
            let expected = map_data(sender, rank, offset, round);
            if actual != expected {
                return Err(ShuffleError::VerifyMismatch {
                    sender,
                    receiver: rank,
                    offset,
                    expected,
                    actual,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_depends_on_all_coordinates() {
        let base = map_data(3, 5, 7, 0);
        assert_ne!(base, map_data(4, 5, 7, 0));
        assert_ne!(base, map_data(3, 6, 7, 0));
        assert_ne!(base, map_data(3, 5, 8, 0));
        assert_ne!(base, map_data(3, 5, 7, 1));
    }

    #[test]
    fn fill_then_local_copy_verifies() {
        let mut plan = ShufflePlan::new(vec![0, 4], vec![0, 4], 2).unwrap();
        fill(&mut plan, 1);
        plan.copy_self(1).unwrap();
        verify(&plan, 1).unwrap();
    }

    #[test]
    fn corrupted_byte_is_located() {
        let mut plan = ShufflePlan::new(vec![3, 0], vec![3, 0], 0).unwrap();
        fill(&mut plan, 0);
        let mut wrong = plan.send_part(0).to_vec();
        wrong[1] ^= 0xff;
        plan.deliver(0, &wrong).unwrap();
        match verify(&plan, 0) {
            Err(ShuffleError::VerifyMismatch { sender: 0, receiver: 0, offset: 1, .. }) => {}
            other => panic!("expected a located mismatch, got {other:?}"),
        }
    }
}
