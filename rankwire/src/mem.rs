//! The in-process fabric: every rank is a tokio task, delivery goes through
//! shared matching queues, and collectives rendezvous on a per-communicator
//! call sequence number.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;

use crate::window::WindowState;
use crate::{CommError, CommResult, Communicator, Request, SharedWindow};

/// A buffered message awaiting its matching receive.
struct Envelope {
    src: usize,
    tag: u64,
    payload: Bytes,
}

/// A posted receive awaiting its matching send.
struct Waiter {
    src: usize,
    tag: u64,
    max_len: usize,
    tx: oneshot::Sender<CommResult<Bytes>>,
}

#[derive(Default)]
struct Mailbox {
    /// Arrived messages with no posted receive yet, in arrival order.
    unexpected: VecDeque<Envelope>,
    /// Posted receives with no arrived message yet, in posting order.
    waiting: VecDeque<Waiter>,
}

/// One rank's contribution to an in-flight collective.
enum Contribution {
    Bytes(Bytes),
    Parts(Vec<Bytes>),
    Values(Vec<f64>),
    SplitKey { color: u64, key: usize },
    RegionLen(usize),
}

impl Contribution {
    fn kind(&self) -> &'static str {
        match self {
            Contribution::Bytes(_) => "all_gather",
            Contribution::Parts(_) => "all_to_all",
            Contribution::Values(_) => "reduce_max",
            Contribution::SplitKey { .. } => "split",
            Contribution::RegionLen(_) => "window",
        }
    }
}

/// The completed result of a collective, shared by every participant.
#[derive(Clone)]
enum Outcome {
    Gathered(Arc<Vec<Bytes>>),
    Exchanged(Arc<Vec<Vec<Bytes>>>),
    Reduced(Arc<Vec<f64>>),
    Split(Arc<Vec<SplitGroup>>),
    Window(Arc<WindowState>),
}

#[derive(Clone)]
struct SplitGroup {
    color: u64,
    /// Parent ranks of the group, in new-communicator rank order.
    members: Vec<usize>,
    shared: Arc<Shared>,
}

struct PendingCollective {
    kind: &'static str,
    parts: Vec<Option<Contribution>>,
    arrived: usize,
    waiters: Vec<oneshot::Sender<CommResult<Outcome>>>,
}

/// State shared by every rank of one communicator.
struct Shared {
    localities: Vec<String>,
    mailboxes: Vec<Mutex<Mailbox>>,
    collectives: Mutex<FxHashMap<u64, PendingCollective>>,
}

impl Shared {
    fn new(localities: Vec<String>) -> Arc<Self> {
        let mailboxes = (0..localities.len()).map(|_| Mutex::new(Mailbox::default())).collect();
        Arc::new(Shared {
            localities,
            mailboxes,
            collectives: Mutex::new(FxHashMap::default()),
        })
    }

    fn size(&self) -> usize {
        self.localities.len()
    }
}

/// An in-process world of ranks. Hand each rank its [`Communicator`] via
/// [`MemWorld::comm`]; after every rank's round logic has returned,
/// [`MemWorld::quiescent`] verifies that no message was left unmatched.
pub struct MemWorld {
    shared: Arc<Shared>,
    comms: Vec<Arc<MemComm>>,
}

impl MemWorld {
    /// A world of `size` ranks sharing a single locality.
    pub fn new(size: usize) -> Self {
        Self::with_localities(vec!["localhost".to_owned(); size])
    }

    /// A world with one rank per entry of `localities`; ranks with equal
    /// entries present themselves as co-located to topology discovery.
    pub fn with_localities(localities: Vec<String>) -> Self {
        assert!(!localities.is_empty(), "world must have at least one rank");
        let shared = Shared::new(localities);
        let comms = (0..shared.size())
            .map(|rank| {
                Arc::new(MemComm {
                    shared: Arc::clone(&shared),
                    rank,
                    seq: AtomicU64::new(0),
                })
            })
            .collect();
        MemWorld { shared, comms }
    }

    /// Number of ranks.
    pub fn size(&self) -> usize {
        self.shared.size()
    }

    /// The communicator handle for `rank`.
    pub fn comm(&self, rank: usize) -> Arc<dyn Communicator> {
        Arc::clone(&self.comms[rank]) as Arc<dyn Communicator>
    }

    /// Verifies that every posted request was matched and every collective
    /// completed: the request-balance check run after a round.
    pub fn quiescent(&self) -> CommResult<()> {
        for (rank, mailbox) in self.shared.mailboxes.iter().enumerate() {
            let mailbox = mailbox.lock().expect("mailbox lock poisoned");
            if !mailbox.unexpected.is_empty() {
                return Err(CommError::Collective(format!(
                    "rank {rank} holds {} unmatched arrived messages",
                    mailbox.unexpected.len()
                )));
            }
            if !mailbox.waiting.is_empty() {
                return Err(CommError::Collective(format!(
                    "rank {rank} holds {} receives that never matched",
                    mailbox.waiting.len()
                )));
            }
        }
        let collectives = self.shared.collectives.lock().expect("collective lock poisoned");
        if !collectives.is_empty() {
            return Err(CommError::Collective(format!(
                "{} collective calls never completed",
                collectives.len()
            )));
        }
        Ok(())
    }
}

/// One rank's endpoint of the in-process fabric.
pub struct MemComm {
    shared: Arc<Shared>,
    rank: usize,
    /// Collective call sequence number; all ranks issue collectives on a
    /// communicator in the same program order, so matching numbers line up.
    seq: AtomicU64,
}

impl MemComm {
    fn check_peer(&self, peer: usize) -> CommResult<()> {
        if peer >= self.shared.size() {
            return Err(CommError::PeerOutOfRange { peer, size: self.shared.size() });
        }
        Ok(())
    }

    async fn collective(&self, part: Contribution) -> CommResult<Outcome> {
        let kind = part.kind();
        let size = self.shared.size();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let rx = {
            let mut map = self.shared.collectives.lock().expect("collective lock poisoned");
            let pending = map.entry(seq).or_insert_with(|| PendingCollective {
                kind,
                parts: std::iter::repeat_with(|| None).take(size).collect(),
                arrived: 0,
                waiters: Vec::new(),
            });
            if pending.kind != kind {
                return Err(CommError::Collective(format!(
                    "rank {} issued {kind} while peers issued {}",
                    self.rank, pending.kind
                )));
            }
            pending.parts[self.rank] = Some(part);
            pending.arrived += 1;
            if pending.arrived == size {
                let pending = map.remove(&seq).expect("pending collective vanished");
                drop(map);
                let outcome = finalize(
                    kind,
                    pending.parts.into_iter().map(|p| p.expect("missing contribution")).collect(),
                    &self.shared,
                );
                for tx in pending.waiters {
                    let _ = tx.send(outcome.clone());
                }
                return outcome;
            }
            let (tx, rx) = oneshot::channel();
            pending.waiters.push(tx);
            rx
        };
        rx.await.map_err(|_| CommError::Disconnected)?
    }
}

/// Completes a collective once every rank has contributed. Runs on the last
/// arriving rank's task.
fn finalize(kind: &'static str, parts: Vec<Contribution>, shared: &Arc<Shared>) -> CommResult<Outcome> {
    let size = shared.size();
    match kind {
        "all_gather" => {
            let gathered = parts
                .into_iter()
                .map(|part| match part {
                    Contribution::Bytes(bytes) => bytes,
                    _ => unreachable!("kind checked at entry"),
                })
                .collect();
            Ok(Outcome::Gathered(Arc::new(gathered)))
        }
        "all_to_all" => {
            let mut matrix = Vec::with_capacity(size);
            for (rank, part) in parts.into_iter().enumerate() {
                let Contribution::Parts(row) = part else {
                    unreachable!("kind checked at entry")
                };
                if row.len() != size {
                    return Err(CommError::Collective(format!(
                        "rank {rank} contributed {} all-to-all parts for a world of {size}",
                        row.len()
                    )));
                }
                matrix.push(row);
            }
            Ok(Outcome::Exchanged(Arc::new(matrix)))
        }
        "reduce_max" => {
            let mut reduced: Option<Vec<f64>> = None;
            for (rank, part) in parts.into_iter().enumerate() {
                let Contribution::Values(values) = part else {
                    unreachable!("kind checked at entry")
                };
                match &mut reduced {
                    None => reduced = Some(values),
                    Some(acc) => {
                        if acc.len() != values.len() {
                            return Err(CommError::Collective(format!(
                                "rank {rank} contributed {} reduce values, expected {}",
                                values.len(),
                                acc.len()
                            )));
                        }
                        for (slot, value) in acc.iter_mut().zip(values) {
                            *slot = slot.max(value);
                        }
                    }
                }
            }
            Ok(Outcome::Reduced(Arc::new(reduced.expect("non-empty world"))))
        }
        "split" => {
            let mut entries: Vec<(u64, usize, usize)> = parts
                .into_iter()
                .enumerate()
                .map(|(rank, part)| match part {
                    Contribution::SplitKey { color, key } => (color, key, rank),
                    _ => unreachable!("kind checked at entry"),
                })
                .collect();
            entries.sort_by_key(|&(color, key, rank)| (color, key, rank));
            let mut groups: Vec<SplitGroup> = Vec::new();
            for (color, _key, rank) in entries {
                match groups.last_mut() {
                    Some(group) if group.color == color => group.members.push(rank),
                    _ => groups.push(SplitGroup { color, members: vec![rank], shared: Arc::clone(shared) }),
                }
            }
            for group in &mut groups {
                let localities =
                    group.members.iter().map(|&rank| shared.localities[rank].clone()).collect();
                group.shared = Shared::new(localities);
            }
            tracing::trace!(groups = groups.len(), "communicator split");
            Ok(Outcome::Split(Arc::new(groups)))
        }
        "window" => {
            let lens = parts
                .into_iter()
                .map(|part| match part {
                    Contribution::RegionLen(len) => len,
                    _ => unreachable!("kind checked at entry"),
                })
                .collect();
            Ok(Outcome::Window(WindowState::allocate(lens)))
        }
        _ => unreachable!("unknown collective kind"),
    }
}

#[async_trait]
impl Communicator for MemComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size()
    }

    fn locality(&self) -> String {
        self.shared.localities[self.rank].clone()
    }

    fn isend(&self, peer: usize, tag: u64, payload: Bytes) -> CommResult<Request> {
        self.check_peer(peer)?;
        if payload.is_empty() {
            return Err(CommError::ZeroLengthMessage { peer });
        }
        let mut mailbox = self.shared.mailboxes[peer].lock().expect("mailbox lock poisoned");
        let matched = mailbox
            .waiting
            .iter()
            .position(|waiter| waiter.src == self.rank && waiter.tag == tag);
        match matched {
            Some(index) => {
                let waiter = mailbox.waiting.remove(index).expect("waiter index in range");
                let result = if payload.len() > waiter.max_len {
                    Err(CommError::Truncated {
                        peer: self.rank,
                        got: payload.len(),
                        max: waiter.max_len,
                    })
                } else {
                    Ok(payload)
                };
                // A dropped receiver abandoned the round; the message is
                // consumed either way.
                let _ = waiter.tx.send(result);
            }
            None => {
                mailbox.unexpected.push_back(Envelope { src: self.rank, tag, payload });
            }
        }
        Ok(Request::sent())
    }

    fn irecv(&self, peer: usize, tag: u64, max_len: usize) -> CommResult<Request> {
        self.check_peer(peer)?;
        let mut mailbox = self.shared.mailboxes[self.rank].lock().expect("mailbox lock poisoned");
        let matched = mailbox
            .unexpected
            .iter()
            .position(|envelope| envelope.src == peer && envelope.tag == tag);
        match matched {
            Some(index) => {
                let envelope = mailbox.unexpected.remove(index).expect("envelope index in range");
                let result = if envelope.payload.len() > max_len {
                    Err(CommError::Truncated {
                        peer,
                        got: envelope.payload.len(),
                        max: max_len,
                    })
                } else {
                    Ok(envelope.payload)
                };
                Ok(Request::ready(result))
            }
            None => {
                let (tx, rx) = oneshot::channel();
                mailbox.waiting.push_back(Waiter { src: peer, tag, max_len, tx });
                Ok(Request::pending(peer, rx))
            }
        }
    }

    async fn send_recv(
        &self,
        send: Option<(usize, u64, Bytes)>,
        recv: Option<(usize, u64, usize)>,
    ) -> CommResult<Option<Bytes>> {
        let send_req = match send {
            Some((peer, tag, payload)) => Some(self.isend(peer, tag, payload)?),
            None => None,
        };
        let recv_req = match recv {
            Some((peer, tag, max_len)) => Some(self.irecv(peer, tag, max_len)?),
            None => None,
        };
        if let Some(req) = send_req {
            req.wait().await?;
        }
        match recv_req {
            Some(req) => req.wait().await,
            None => Ok(None),
        }
    }

    async fn barrier(&self) -> CommResult<()> {
        self.all_gather(Bytes::from_static(&[0])).await?;
        Ok(())
    }

    async fn all_gather(&self, part: Bytes) -> CommResult<Vec<Bytes>> {
        match self.collective(Contribution::Bytes(part)).await? {
            Outcome::Gathered(gathered) => Ok(gathered.iter().cloned().collect()),
            _ => unreachable!("collective kind preserved"),
        }
    }

    async fn all_to_all(&self, parts: Vec<Bytes>) -> CommResult<Vec<Bytes>> {
        match self.collective(Contribution::Parts(parts)).await? {
            Outcome::Exchanged(matrix) => {
                Ok(matrix.iter().map(|row| row[self.rank].clone()).collect())
            }
            _ => unreachable!("collective kind preserved"),
        }
    }

    async fn reduce_max(&self, values: Vec<f64>, root: usize) -> CommResult<Option<Vec<f64>>> {
        self.check_peer(root)?;
        match self.collective(Contribution::Values(values)).await? {
            Outcome::Reduced(reduced) => {
                Ok((self.rank == root).then(|| reduced.as_ref().clone()))
            }
            _ => unreachable!("collective kind preserved"),
        }
    }

    async fn split(&self, color: u64, key: usize) -> CommResult<Arc<dyn Communicator>> {
        match self.collective(Contribution::SplitKey { color, key }).await? {
            Outcome::Split(groups) => {
                let group = groups
                    .iter()
                    .find(|group| group.members.contains(&self.rank))
                    .expect("every rank lands in a split group");
                let rank = group
                    .members
                    .iter()
                    .position(|&member| member == self.rank)
                    .expect("membership checked above");
                Ok(Arc::new(MemComm {
                    shared: Arc::clone(&group.shared),
                    rank,
                    seq: AtomicU64::new(0),
                }) as Arc<dyn Communicator>)
            }
            _ => unreachable!("collective kind preserved"),
        }
    }

    async fn window(&self, len: usize) -> CommResult<SharedWindow> {
        match self.collective(Contribution::RegionLen(len)).await? {
            Outcome::Window(state) => Ok(SharedWindow::new(self.rank, state)),
            _ => unreachable!("collective kind preserved"),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::wait_all;

    #[tokio::test(flavor = "multi_thread")]
    async fn send_matches_posted_receive() {
        let world = MemWorld::new(2);
        let sender = world.comm(0);
        let receiver = world.comm(1);

        let recv = receiver.irecv(0, 7, 16).unwrap();
        let send = sender.isend(1, 7, Bytes::from_static(b"hello")).unwrap();

        assert_eq!(None, send.wait().await.unwrap());
        assert_eq!(Some(Bytes::from_static(b"hello")), recv.wait().await.unwrap());
        world.quiescent().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unexpected_message_matches_later_receive() {
        let world = MemWorld::new(2);
        world.comm(0).isend(1, 3, Bytes::from_static(b"early")).unwrap().wait().await.unwrap();

        let got = world.comm(1).irecv(0, 3, 16).unwrap().wait().await.unwrap();
        assert_eq!(Some(Bytes::from_static(b"early")), got);
        world.quiescent().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn same_pair_messages_do_not_overtake() {
        let world = MemWorld::new(2);
        let sender = world.comm(0);
        let receiver = world.comm(1);
        sender.isend(1, 9, Bytes::from_static(b"first")).unwrap().wait().await.unwrap();
        sender.isend(1, 9, Bytes::from_static(b"second")).unwrap().wait().await.unwrap();

        let a = receiver.irecv(0, 9, 16).unwrap().wait().await.unwrap();
        let b = receiver.irecv(0, 9, 16).unwrap().wait().await.unwrap();
        assert_eq!(Some(Bytes::from_static(b"first")), a);
        assert_eq!(Some(Bytes::from_static(b"second")), b);
        world.quiescent().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn oversized_arrival_truncates() {
        let world = MemWorld::new(2);
        world.comm(0).isend(1, 1, Bytes::from_static(b"toolarge")).unwrap().wait().await.unwrap();
        let err = world.comm(1).irecv(0, 1, 4).unwrap().wait().await.unwrap_err();
        assert_eq!(CommError::Truncated { peer: 0, got: 8, max: 4 }, err);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn zero_length_send_rejected() {
        let world = MemWorld::new(2);
        let err = world.comm(0).isend(1, 0, Bytes::new()).unwrap_err();
        assert_eq!(CommError::ZeroLengthMessage { peer: 1 }, err);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn all_to_all_routes_columns() {
        let outputs = crate::sim::run_world(vec!["n".to_owned(); 3], |comm| async move {
            let parts = (0..3)
                .map(|peer| Bytes::from(format!("{}->{}", comm.rank(), peer)))
                .collect();
            comm.all_to_all(parts).await.unwrap()
        })
        .await
        .unwrap();
        for (rank, row) in outputs.iter().enumerate() {
            for (src, part) in row.iter().enumerate() {
                assert_eq!(format!("{src}->{rank}").as_bytes(), part.as_ref());
            }
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reduce_max_lands_at_root() {
        let outputs = crate::sim::run_world(vec!["n".to_owned(); 4], |comm| async move {
            let rank = comm.rank() as f64;
            comm.reduce_max(vec![rank, -rank], 0).await.unwrap()
        })
        .await
        .unwrap();
        assert_eq!(Some(vec![3.0, 0.0]), outputs[0]);
        assert!(outputs[1..].iter().all(Option::is_none));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn split_forms_ordered_subgroups() {
        let outputs = crate::sim::run_world(vec!["n".to_owned(); 4], |comm| async move {
            // Even ranks one color, odd ranks the other.
            let sub = comm.split((comm.rank() % 2) as u64, comm.rank()).await.unwrap();
            sub.barrier().await.unwrap();
            (sub.rank(), sub.size())
        })
        .await
        .unwrap();
        assert_eq!(vec![(0, 2), (0, 2), (1, 2), (1, 2)], outputs);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn window_publishes_after_fence() {
        let outputs = crate::sim::run_world(vec!["n".to_owned(); 3], |comm| async move {
            let window = comm.window(4).await.unwrap();
            assert_eq!(comm.rank(), window.index());
            assert_eq!(4, window.region_len(2));
            window.write(0, &[comm.rank() as u8; 4]).unwrap();
            window.fence().await;
            (0..window.members())
                .map(|peer| window.with_region(peer, |region| region[0]))
                .collect::<Vec<u8>>()
        })
        .await
        .unwrap();
        assert!(outputs.iter().all(|bytes| bytes == &[0, 1, 2]));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn leftover_message_fails_quiescence() {
        let world = MemWorld::new(2);
        world.comm(0).isend(1, 5, Bytes::from_static(b"stray")).unwrap().wait().await.unwrap();
        assert!(world.quiescent().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn wait_all_drains_every_request_before_reporting() {
        let world = MemWorld::new(2);
        world.comm(0).isend(1, 2, Bytes::from_static(b"toolarge")).unwrap().wait().await.unwrap();
        world.comm(0).isend(1, 3, Bytes::from_static(b"ok")).unwrap().wait().await.unwrap();
        let receiver = world.comm(1);
        let requests = vec![
            receiver.irecv(0, 2, 1).unwrap(),
            receiver.irecv(0, 3, 16).unwrap(),
        ];
        // The first receive fails, the second must still be drained so the
        // round leaves nothing pending.
        assert!(wait_all(requests).await.is_err());
        world.quiescent().unwrap();
    }
}
