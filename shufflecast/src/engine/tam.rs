//! Two-phase aggregation movers.
//!
//! All three variants reduce inter-node traffic to one exchange between
//! designated intra-node aggregation points: payloads funnel to the point
//! (phase A), the points exchange (phase B), and deliveries fan back out
//! (phase C, implicit where receives land in final buffers directly).
//!
//! Phase A builds the *inclusive* prefix table `lens[w·N + d]` over the
//! exact traversal order `for member w, for destination d`, so any byte
//! group is locatable in O(1); the boundary access `w·N + d − 1` needs the
//! explicit zero branch at `w == 0 ∧ d == 0`.

use std::sync::Arc;

use std::time::Instant;

use bytes::Bytes;
use rankwire::{wait_all, Communicator, Request};

use super::{pair_tag, RoundContext};
use crate::metrics::RoundMetrics;
use crate::plan::{RecvLayout, ShufflePlan};
use crate::{ShuffleError, ShuffleResult};

/// Wire size of a bincode `Vec<u64>` with `count` elements.
fn u64s_wire_len(count: usize) -> usize {
    8 + 8 * count
}

fn encode_u64s(values: impl IntoIterator<Item = u64>) -> Bytes {
    let values: Vec<u64> = values.into_iter().collect();
    Bytes::from(bincode::serialize(&values).expect("fixed-width integers serialize"))
}

fn decode_u64s(raw: &[u8], expected: usize) -> ShuffleResult<Vec<u64>> {
    let values: Vec<u64> = bincode::deserialize(raw)
        .map_err(|err| ShuffleError::InvalidConfig(format!("malformed size vector: {err}")))?;
    if values.len() != expected {
        return Err(ShuffleError::InvalidConfig(format!(
            "size vector carries {} entries, expected {expected}",
            values.len()
        )));
    }
    Ok(values)
}

/// The inclusive prefix table over `(member, destination)` rows.
fn inclusive_lens(rows: &[Vec<u64>]) -> Vec<u64> {
    let mut lens = Vec::with_capacity(rows.iter().map(Vec::len).sum());
    let mut acc = 0u64;
    for row in rows {
        for &len in row {
            acc += len;
            lens.push(acc);
        }
    }
    lens
}

/// Byte bounds of member `w`'s group for destination `d` within the
/// aggregate buffer described by the inclusive table.
fn segment(lens: &[u64], n: usize, w: usize, d: usize) -> (usize, usize) {
    let end = lens[w * n + d] as usize;
    let start = if w == 0 && d == 0 { 0 } else { lens[w * n + d - 1] as usize };
    (start, end)
}

/// Start of member `w`'s whole region within the aggregate buffer.
fn row_base(lens: &[u64], n: usize, w: usize) -> usize {
    if w == 0 {
        0
    } else {
        lens[w * n - 1] as usize
    }
}

async fn wait_indexed(posts: Vec<(usize, Request)>) -> ShuffleResult<Vec<(usize, Bytes)>> {
    let (indices, requests): (Vec<usize>, Vec<Request>) = posts.into_iter().unzip();
    let delivered = wait_all(requests).await?;
    Ok(indices
        .into_iter()
        .zip(delivered)
        .filter_map(|(index, payload)| payload.map(|bytes| (index, bytes)))
        .collect())
}

/// TAM through per-node proxies: gather to the node's lowest rank, one
/// proxy-to-proxy exchange, then scatter with per-destination reordering.
pub(super) async fn node_proxy(
    ctx: &RoundContext<'_>,
    plan: &mut ShufflePlan,
    metrics: &mut RoundMetrics,
) -> ShuffleResult<()> {
    let comm = ctx.comm.as_ref();
    let topo = ctx.topology;
    let n = ctx.size();
    let rank = ctx.rank();
    let round = plan.round();
    let node = topo.my_node();
    let proxy = topo.proxy_of_node(node);
    let total_send = plan.total_send();
    let total_recv = plan.total_recv();

    if rank != proxy {
        // Sizes up to the proxy.
        let started = Instant::now();
        let sizes = plan
            .send_lens()
            .iter()
            .chain(plan.recv_lens())
            .map(|&len| len as u64)
            .collect::<Vec<u64>>();
        let request = comm.isend(proxy, pair_tag(rank, proxy, round), encode_u64s(sizes))?;
        metrics.post += started.elapsed();
        let started = Instant::now();
        request.wait().await?;
        metrics.wait_send += started.elapsed();

        // Payload up to the proxy.
        if total_send > 0 {
            let started = Instant::now();
            let request = comm.isend(
                proxy,
                pair_tag(rank, proxy, round),
                Bytes::copy_from_slice(plan.send_all()),
            )?;
            metrics.post += started.elapsed();
            let started = Instant::now();
            request.wait().await?;
            metrics.wait_send += started.elapsed();
        }

        // Delivery back from the proxy, already ordered by source rank.
        if total_recv > 0 {
            let started = Instant::now();
            let request = comm.irecv(proxy, pair_tag(rank, proxy, round), total_recv)?;
            metrics.post += started.elapsed();
            let started = Instant::now();
            let bytes = request.wait().await?.expect("receives deliver a payload");
            metrics.wait_recv += started.elapsed();
            plan.deliver_all(&bytes)?;
        }
        return Ok(());
    }

    // Proxy. Phase A: collect every local rank's size vectors.
    let locals = topo.ranks_on_node(node).to_vec();
    let p = locals.len();
    let started = Instant::now();
    let mut posts = Vec::new();
    for (li, &local) in locals.iter().enumerate().skip(1) {
        posts.push((
            li,
            comm.irecv(local, pair_tag(local, rank, round), u64s_wire_len(2 * n))?,
        ));
    }
    metrics.post += started.elapsed();
    let mut send_rows: Vec<Vec<u64>> = vec![Vec::new(); p];
    let mut recv_rows: Vec<Vec<u64>> = vec![Vec::new(); p];
    send_rows[0] = plan.send_lens().iter().map(|&len| len as u64).collect();
    recv_rows[0] = plan.recv_lens().iter().map(|&len| len as u64).collect();
    let started = Instant::now();
    for (li, raw) in wait_indexed(posts).await? {
        let both = decode_u64s(&raw, 2 * n)?;
        send_rows[li] = both[..n].to_vec();
        recv_rows[li] = both[n..].to_vec();
    }
    metrics.wait_recv += started.elapsed();

    // Phase A: gather payloads into one buffer ordered (member, dest).
    let lens = inclusive_lens(&send_rows);
    let node_send_total = *lens.last().expect("table non-empty") as usize;
    let mut aggregate = vec![0u8; node_send_total];
    aggregate[..total_send].copy_from_slice(plan.send_all());
    let started = Instant::now();
    let mut posts = Vec::new();
    for (li, &local) in locals.iter().enumerate().skip(1) {
        let start = row_base(&lens, n, li);
        let len = row_base(&lens, n, li + 1).saturating_sub(start);
        if len > 0 {
            posts.push((li, comm.irecv(local, pair_tag(local, rank, round), len)?));
        }
    }
    metrics.post += started.elapsed();
    let started = Instant::now();
    for (li, raw) in wait_indexed(posts).await? {
        let start = row_base(&lens, n, li);
        aggregate[start..start + raw.len()].copy_from_slice(&raw);
    }
    metrics.wait_recv += started.elapsed();

    // Phase B: stage outgoing bytes per destination node, ordered by
    // destination rank, then by local member.
    let nodes = topo.node_count();
    let mut staging: Vec<Vec<u8>> = vec![Vec::new(); nodes];
    for (dst_node, out) in staging.iter_mut().enumerate() {
        for &dst in topo.ranks_on_node(dst_node) {
            for w in 0..p {
                let (start, end) = segment(&lens, n, w, dst);
                if end > start {
                    out.extend_from_slice(&aggregate[start..end]);
                }
            }
        }
    }
    drop(aggregate);

    // Phase B: one-integer size exchange between proxies.
    let mut in_total = vec![0usize; nodes];
    in_total[node] = staging[node].len();
    let started = Instant::now();
    let mut posts = Vec::new();
    let mut size_sends = Vec::new();
    for peer_node in 0..nodes {
        if peer_node == node {
            continue;
        }
        let peer = topo.proxy_of_node(peer_node);
        size_sends.push(comm.isend(
            peer,
            pair_tag(rank, peer, round),
            encode_u64s([staging[peer_node].len() as u64]),
        )?);
        posts.push((peer_node, comm.irecv(peer, pair_tag(peer, rank, round), u64s_wire_len(1))?));
    }
    metrics.post += started.elapsed();
    let started = Instant::now();
    for (peer_node, raw) in wait_indexed(posts).await? {
        in_total[peer_node] = decode_u64s(&raw, 1)?[0] as usize;
    }
    wait_all(size_sends).await?;
    metrics.wait_recv += started.elapsed();

    // Phase B: the data exchange itself; the self node moves by copy.
    let mut inbound: Vec<Vec<u8>> = vec![Vec::new(); nodes];
    inbound[node] = std::mem::take(&mut staging[node]);
    let started = Instant::now();
    let mut posts = Vec::new();
    let mut data_sends = Vec::new();
    for peer_node in 0..nodes {
        if peer_node == node {
            continue;
        }
        let peer = topo.proxy_of_node(peer_node);
        if !staging[peer_node].is_empty() {
            let payload = Bytes::from(std::mem::take(&mut staging[peer_node]));
            data_sends.push(comm.isend(peer, pair_tag(rank, peer, round), payload)?);
        }
        if in_total[peer_node] > 0 {
            posts.push((peer_node, comm.irecv(peer, pair_tag(peer, rank, round), in_total[peer_node])?));
        }
    }
    metrics.post += started.elapsed();
    let started = Instant::now();
    for (peer_node, raw) in wait_indexed(posts).await? {
        inbound[peer_node] = raw.to_vec();
    }
    wait_all(data_sends).await?;
    metrics.wait_recv += started.elapsed();

    // Phase C: slice deliveries back out, reordering by destination rank.
    // Inbound regions are ordered (destination on this node, then source
    // within the peer node), so one cursor per source node suffices.
    let mut cursors = vec![0usize; nodes];
    for src in 0..n {
        let len = recv_rows[0][src] as usize;
        if len > 0 {
            let src_node = topo.node_of(src);
            let at = cursors[src_node];
            plan.deliver(src, &inbound[src_node][at..at + len])?;
            cursors[src_node] += len;
        }
    }
    let started = Instant::now();
    let mut deliveries = Vec::new();
    for (li, &local) in locals.iter().enumerate().skip(1) {
        let total: u64 = recv_rows[li].iter().sum();
        if total == 0 {
            continue;
        }
        let mut out = Vec::with_capacity(total as usize);
        for src in 0..n {
            let len = recv_rows[li][src] as usize;
            if len > 0 {
                let src_node = topo.node_of(src);
                let at = cursors[src_node];
                out.extend_from_slice(&inbound[src_node][at..at + len]);
                cursors[src_node] += len;
            }
        }
        deliveries.push(comm.isend(local, pair_tag(local, rank, round), Bytes::from(out))?);
    }
    metrics.post += started.elapsed();
    let started = Instant::now();
    wait_all(deliveries).await?;
    metrics.wait_send += started.elapsed();
    Ok(())
}

/// TAM through the binder's local aggregators: clients gather to their
/// bound aggregator, which ships one per-source-grouped message to every
/// global aggregator; global aggregators receive straight into their final
/// buffers through the receive layout.
pub(super) async fn bound(
    ctx: &RoundContext<'_>,
    plan: &mut ShufflePlan,
    metrics: &mut RoundMetrics,
) -> ShuffleResult<()> {
    let comm = ctx.comm.as_ref();
    let binding = ctx.binding;
    let n = ctx.size();
    let rank = ctx.rank();
    let round = plan.round();
    let agg = binding.bind_of(rank);
    let is_local = agg == rank;
    let is_global = binding.is_global(rank);
    let layout = is_global.then(|| RecvLayout::new(plan, binding));

    // Phase A: size vectors up to the bound aggregator.
    let clients: Vec<usize> =
        if is_local { binding.clients_of(rank).expect("aggregators have clients").to_vec() } else { Vec::new() };
    let q = clients.len();
    let my_slot = clients.iter().position(|&c| c == rank);
    let started = Instant::now();
    let mut posts = Vec::new();
    for (ci, &client) in clients.iter().enumerate() {
        if client != rank {
            posts.push((ci, comm.irecv(client, pair_tag(client, rank, round), u64s_wire_len(n))?));
        }
    }
    let mut size_send = None;
    if !is_local {
        let sizes = plan.send_lens().iter().map(|&len| len as u64);
        size_send = Some(comm.isend(agg, pair_tag(rank, agg, round), encode_u64s(sizes))?);
    }
    metrics.post += started.elapsed();
    let mut send_rows: Vec<Vec<u64>> = vec![Vec::new(); q.max(1)];
    if let Some(slot) = my_slot {
        send_rows[slot] = plan.send_lens().iter().map(|&len| len as u64).collect();
    }
    let started = Instant::now();
    for (ci, raw) in wait_indexed(posts).await? {
        send_rows[ci] = decode_u64s(&raw, n)?;
    }
    if let Some(request) = size_send {
        request.wait().await?;
    }
    metrics.wait_recv += started.elapsed();

    // Phase A: payload gather into the aggregator's contiguous buffer.
    let mut aggregate = Vec::new();
    let mut lens = Vec::new();
    if is_local {
        lens = inclusive_lens(&send_rows);
        let total = *lens.last().expect("table non-empty") as usize;
        aggregate = vec![0u8; total];
        let slot = my_slot.expect("a local aggregator is its own client");
        let own_start = row_base(&lens, n, slot);
        aggregate[own_start..own_start + plan.total_send()].copy_from_slice(plan.send_all());
    }
    let started = Instant::now();
    let mut posts = Vec::new();
    for (ci, &client) in clients.iter().enumerate() {
        if client == rank {
            continue;
        }
        let start = row_base(&lens, n, ci);
        let len = row_base(&lens, n, ci + 1).saturating_sub(start);
        if len > 0 {
            posts.push((ci, comm.irecv(client, pair_tag(client, rank, round), len)?));
        }
    }
    let mut payload_send = None;
    if !is_local && plan.total_send() > 0 {
        payload_send = Some(comm.isend(
            agg,
            pair_tag(rank, agg, round),
            Bytes::copy_from_slice(plan.send_all()),
        )?);
    }
    metrics.post += started.elapsed();
    let started = Instant::now();
    for (ci, raw) in wait_indexed(posts).await? {
        let start = row_base(&lens, n, ci);
        aggregate[start..start + raw.len()].copy_from_slice(&raw);
    }
    if let Some(request) = payload_send {
        request.wait().await?;
    }
    metrics.wait_recv += started.elapsed();

    // Phase B: receives first, then the per-global-aggregator sends.
    let started = Instant::now();
    let mut posts = Vec::new();
    if let Some(layout) = &layout {
        for (li, &local_agg) in binding.local().iter().enumerate() {
            let expected = layout.expected_from(li);
            if expected > 0 {
                posts.push((li, comm.irecv(local_agg, pair_tag(local_agg, rank, round), expected)?));
            }
        }
    }
    let mut sends = Vec::new();
    if is_local {
        // Interleave the send order across nodes so consecutive posts do
        // not pile onto a single node's link.
        let mut targets = binding.global().to_vec();
        crate::aggregators::interleave_across_nodes(&mut targets, ctx.topology);
        for &global_agg in &targets {
            let mut out = Vec::new();
            for w in 0..q {
                let (start, end) = segment(&lens, n, w, global_agg);
                if end > start {
                    out.extend_from_slice(&aggregate[start..end]);
                }
            }
            if !out.is_empty() {
                sends.push(comm.isend(global_agg, pair_tag(rank, global_agg, round), Bytes::from(out))?);
            }
        }
    }
    metrics.post += started.elapsed();
    let started = Instant::now();
    let arrived = wait_indexed(posts).await?;
    wait_all(sends).await?;
    metrics.wait_recv += started.elapsed();
    if let Some(layout) = &layout {
        for (li, raw) in arrived {
            layout.scatter(li, &raw, plan)?;
        }
    }
    Ok(())
}

/// TAM with the intra-node gather through a shared window: the client
/// group's window holds `[size header | payload]` per member, a fence
/// publishes it, and the aggregator assembles phase-B messages by indexed
/// reads. The receive side matches [`bound`], so phase C is implicit.
pub(super) async fn windowed(
    ctx: &RoundContext<'_>,
    plan: &mut ShufflePlan,
    metrics: &mut RoundMetrics,
) -> ShuffleResult<()> {
    let comm: &Arc<dyn Communicator> = ctx.comm;
    let binding = ctx.binding;
    let n = ctx.size();
    let rank = ctx.rank();
    let round = plan.round();
    let agg = binding.bind_of(rank);
    let is_local = agg == rank;
    let is_global = binding.is_global(rank);
    let layout = is_global.then(|| RecvLayout::new(plan, binding));

    // Phase B receives go up before any collective work.
    let started = Instant::now();
    let mut posts = Vec::new();
    if let Some(layout) = &layout {
        for (li, &local_agg) in binding.local().iter().enumerate() {
            let expected = layout.expected_from(li);
            if expected > 0 {
                posts.push((li, comm.irecv(local_agg, pair_tag(local_agg, rank, round), expected)?));
            }
        }
    }
    metrics.post += started.elapsed();

    // Phase A: the client group's window, one region per member holding the
    // size header followed by the concatenated payload.
    let header = 8 * n;
    let sub = comm.split(agg as u64, rank).await?;
    let window = sub.window(header + plan.total_send()).await?;
    let mut head = Vec::with_capacity(header);
    for &len in plan.send_lens() {
        head.extend_from_slice(&(len as u64).to_le_bytes());
    }
    window.write(0, &head)?;
    if plan.total_send() > 0 {
        window.write(header, plan.send_all())?;
    }
    let started = Instant::now();
    window.fence().await;
    metrics.barrier += started.elapsed();

    // Phase B sends, assembled by indexed window reads.
    let started = Instant::now();
    let mut sends = Vec::new();
    if is_local {
        let members = window.members();
        let rows: Vec<Vec<u64>> = (0..members)
            .map(|w| {
                window.with_region(w, |region| {
                    region[..header]
                        .chunks_exact(8)
                        .map(|chunk| u64::from_le_bytes(chunk.try_into().expect("8-byte chunks")))
                        .collect()
                })
            })
            .collect();
        let lens = inclusive_lens(&rows);
        for &global_agg in binding.global() {
            let mut out = Vec::new();
            for w in 0..members {
                let (start, end) = segment(&lens, n, w, global_agg);
                if end > start {
                    let offset = header + (start - row_base(&lens, n, w));
                    window.with_region(w, |region| {
                        out.extend_from_slice(&region[offset..offset + (end - start)]);
                    });
                }
            }
            if !out.is_empty() {
                sends.push(comm.isend(global_agg, pair_tag(rank, global_agg, round), Bytes::from(out))?);
            }
        }
    }
    metrics.post += started.elapsed();

    let started = Instant::now();
    let arrived = wait_indexed(posts).await?;
    wait_all(sends).await?;
    metrics.wait_recv += started.elapsed();
    if let Some(layout) = &layout {
        for (li, raw) in arrived {
            layout.scatter(li, &raw, plan)?;
        }
    }

    // Closing fence: nobody tears the window down while a peer still reads.
    let started = Instant::now();
    window.fence().await;
    metrics.barrier += started.elapsed();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inclusive_table_accumulates_across_members() {
        // Two members on a four-rank world: the table keeps accumulating
        // across the member boundary.
        let rows = vec![vec![5, 0, 3, 2], vec![0, 0, 0, 0]];
        assert_eq!(vec![5, 5, 8, 10, 10, 10, 10, 10], inclusive_lens(&rows));
    }

    #[test]
    fn segment_bounds_use_the_zero_branch() {
        let rows = vec![vec![5, 0, 3, 2], vec![1, 1, 1, 1]];
        let lens = inclusive_lens(&rows);
        assert_eq!((0, 5), segment(&lens, 4, 0, 0));
        assert_eq!((5, 5), segment(&lens, 4, 0, 1));
        assert_eq!((8, 10), segment(&lens, 4, 0, 3));
        // Member boundary: member 1, destination 0 starts where member 0
        // ended.
        assert_eq!((10, 11), segment(&lens, 4, 1, 0));
        assert_eq!(10, row_base(&lens, 4, 1));
    }

    #[test]
    fn node_destined_totals_derive_from_the_table() {
        // Node-boundary case: two nodes of two, destinations 0 and 1 live
        // on node 0.
        let rows = vec![vec![5, 0, 3, 2], vec![0, 0, 0, 0]];
        let lens = inclusive_lens(&rows);
        let to_node0: usize = (0..2)
            .flat_map(|w| (0..2).map(move |d| (w, d)))
            .map(|(w, d)| {
                let (start, end) = segment(&lens, 4, w, d);
                end - start
            })
            .sum();
        assert_eq!(5, to_node0);
    }

    #[test]
    fn size_vectors_round_trip() {
        let encoded = encode_u64s([3, 0, 7]);
        assert_eq!(u64s_wire_len(3), encoded.len());
        assert_eq!(vec![3, 0, 7], decode_u64s(&encoded, 3).unwrap());
        assert!(decode_u64s(&encoded, 4).is_err());
    }
}
