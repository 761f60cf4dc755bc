//! Moving constraint rows between ranks.
//!
//! *Scatter* pushes every locally built row to the ranks that own the
//! constrained DOF or any of its masters. *Gather* pulls, round after round,
//! the rows for DOFs this rank references but does not own, until no rank
//! discovers a new DOF to ask about.

use std::collections::{BTreeMap, BTreeSet};

use crate::algs::communicator::{Communicator, DofMapCommTags};
use crate::algs::exchange::{all_to_all, allreduce_max};
use crate::algs::numbering::Numbering;
use crate::algs::wire::{
    kind, WireConstraintHdr, WireQoiValue, WireReader, WireTerm, WireU64, WireWriter,
};
use crate::data::constraints::{ConstraintOrigin, DofConstraint, DofConstraints};
use crate::dof_error::DofMapError;
use crate::topology::ids::{DofId, Rank};

/// Encode `rows` as one `CONSTRAINT_ROWS` message.
pub fn encode_rows<'a>(rows: impl ExactSizeIterator<Item = (DofId, &'a DofConstraint)>) -> Vec<u8> {
    let mut w = WireWriter::new(kind::CONSTRAINT_ROWS, rows.len());
    for (dof, c) in rows {
        w.push(WireConstraintHdr::new(
            dof,
            c.rhs,
            c.row.len(),
            c.adjoint_rhs.len(),
            c.origin.priority(),
        ));
        for (&m, &coeff) in &c.row {
            w.push(WireTerm::new(m, coeff));
        }
        for (&q, &v) in &c.adjoint_rhs {
            w.push(WireQoiValue::new(q, v));
        }
    }
    w.finish()
}

/// Decode a `CONSTRAINT_ROWS` message. An empty buffer carries no rows.
pub fn decode_rows(buf: &[u8]) -> Result<Vec<(DofId, DofConstraint)>, DofMapError> {
    if buf.is_empty() {
        return Ok(Vec::new());
    }
    let (mut r, n) = WireReader::open(buf, kind::CONSTRAINT_ROWS)?;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let hdr: WireConstraintHdr = r.take()?;
        let mut c = DofConstraint::new(
            BTreeMap::new(),
            hdr.rhs(),
            ConstraintOrigin::from_priority(hdr.priority()),
        );
        for _ in 0..hdr.n_terms() {
            let t: WireTerm = r.take()?;
            c.row.insert(t.dof(), t.coeff());
        }
        for _ in 0..hdr.n_qoi() {
            let q: WireQoiValue = r.take()?;
            c.adjoint_rhs.insert(q.qoi(), q.value());
        }
        out.push((hdr.dof(), c));
    }
    r.finish()?;
    Ok(out)
}

fn encode_dofs(dofs: &BTreeSet<DofId>) -> Vec<u8> {
    let mut w = WireWriter::new(kind::DOF_LIST, dofs.len());
    for &d in dofs {
        w.push(WireU64::of(d));
    }
    w.finish()
}

fn decode_dofs(buf: &[u8]) -> Result<Vec<DofId>, DofMapError> {
    if buf.is_empty() {
        return Ok(Vec::new());
    }
    let (mut r, n) = WireReader::open(buf, kind::DOF_LIST)?;
    let out = (0..n)
        .map(|_| r.take::<WireU64>().map(|v| v.get()))
        .collect::<Result<Vec<_>, _>>()?;
    r.finish()?;
    Ok(out)
}

/// Send each local row to the owners of its DOF and masters and merge what
/// arrives by origin priority. Collective. Returns the number of rows that
/// changed locally.
pub fn scatter_constraints<C: Communicator>(
    comm: &C,
    tags: &DofMapCommTags,
    numbering: &Numbering,
    constraints: &mut DofConstraints,
) -> Result<usize, DofMapError> {
    let me = comm.rank();
    let mut per_rank: BTreeMap<Rank, Vec<DofId>> = BTreeMap::new();
    for (dof, c) in constraints.iter() {
        let mut dest = BTreeSet::new();
        dest.insert(numbering.dof_owner(dof)?);
        for &m in c.row.keys() {
            dest.insert(numbering.dof_owner(m)?);
        }
        dest.remove(&me);
        for r in dest {
            per_rank.entry(r).or_default().push(dof);
        }
    }

    let outgoing = per_rank
        .into_iter()
        .map(|(r, dofs)| {
            let rows: Vec<_> = dofs
                .iter()
                .filter_map(|&d| constraints.get(d).map(|c| (d, c)))
                .collect();
            (r, encode_rows(rows.into_iter()))
        })
        .collect();
    let incoming = all_to_all(comm, tags.scatter_constraints, outgoing)?;

    let mut changed = 0;
    for (_, buf) in incoming {
        for (dof, c) in decode_rows(&buf)? {
            if constraints.merge(dof, c) {
                changed += 1;
            }
        }
    }
    log::debug!("rank {me}: scatter changed {changed} constraint rows");
    Ok(changed)
}

/// Pull the owners' rows for `wanted` and for every non-owned master
/// reachable from local rows, until closure. Collective. Returns the number
/// of rows received that changed the local table.
pub fn gather_constraints<C: Communicator>(
    comm: &C,
    tags: &DofMapCommTags,
    numbering: &Numbering,
    constraints: &mut DofConstraints,
    wanted: &BTreeSet<DofId>,
) -> Result<usize, DofMapError> {
    let me = comm.rank();
    let owned = numbering.local_range(me);
    let mut requested: BTreeSet<DofId> = BTreeSet::new();
    let mut changed = 0;
    let mut rounds = 0;

    let mut frontier: BTreeSet<DofId> = wanted
        .iter()
        .copied()
        .chain(constraints.iter().map(|(d, _)| d))
        .chain(constraints.all_masters())
        .filter(|d| !owned.contains(d))
        .collect();

    loop {
        frontier.retain(|d| !requested.contains(d));
        let global = allreduce_max(comm, tags.reduce, frontier.len() as u64)?;
        if global == 0 {
            break;
        }
        rounds += 1;

        let mut asks: BTreeMap<Rank, BTreeSet<DofId>> = BTreeMap::new();
        for &d in &frontier {
            asks.entry(numbering.dof_owner(d)?).or_default().insert(d);
        }
        requested.extend(frontier.iter().copied());
        let outgoing = asks.iter().map(|(&r, dofs)| (r, encode_dofs(dofs))).collect();
        let incoming = all_to_all(comm, tags.gather_constraints, outgoing)?;

        let mut replies = BTreeMap::new();
        for (peer, buf) in incoming {
            let dofs = decode_dofs(&buf)?;
            if dofs.is_empty() {
                continue;
            }
            let rows: Vec<_> = dofs
                .iter()
                .filter_map(|&d| constraints.get(d).map(|c| (d, c)))
                .collect();
            replies.insert(peer, encode_rows(rows.into_iter()));
        }
        let answers = all_to_all(comm, tags.gather_constraints, replies)?;

        let mut next = BTreeSet::new();
        for (_, buf) in answers {
            for (dof, c) in decode_rows(&buf)? {
                next.extend(c.row.keys().copied().filter(|m| !owned.contains(m)));
                if constraints.replace(dof, c) {
                    changed += 1;
                }
            }
        }
        frontier = next;
    }
    log::debug!("rank {me}: gathered {changed} constraint rows in {rounds} rounds");
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{NoComm, ThreadComm};

    fn numbering(blocks: &[u64]) -> Numbering {
        let mut first = Vec::new();
        let mut end = Vec::new();
        let mut acc = 0;
        for b in blocks {
            first.push(acc);
            acc += b;
            end.push(acc);
        }
        Numbering {
            first_dof: first,
            end_dof: end,
            n_dofs: acc,
            ..Numbering::default()
        }
    }

    #[test]
    fn rows_survive_the_wire() {
        let mut c = DofConstraint::new(BTreeMap::from([(1, 0.5), (2, 0.5)]), 3.0, ConstraintOrigin::Dirichlet(2));
        c.adjoint_rhs.insert(4, -1.0);
        let bytes = encode_rows([(9, &c)].into_iter());
        let rows = decode_rows(&bytes).unwrap();
        assert_eq!(rows, vec![(9, c)]);
        assert!(decode_rows(&[]).unwrap().is_empty());
    }

    #[test]
    fn serial_exchange_is_a_no_op() {
        let num = numbering(&[4]);
        let mut cons = DofConstraints::new();
        cons.add_constraint_row(0, BTreeMap::from([(1, 1.0)]), 0.0, ConstraintOrigin::User, true)
            .unwrap();
        let tags = DofMapCommTags::default();
        assert_eq!(scatter_constraints(&NoComm, &tags, &num, &mut cons).unwrap(), 0);
        assert_eq!(gather_constraints(&NoComm, &tags, &num, &mut cons, &BTreeSet::new()).unwrap(), 0);
        assert_eq!(cons.len(), 1);
    }

    #[test]
    fn gather_follows_master_chains_across_ranks() {
        // DOFs 0..2 on rank 0, 2..4 on rank 1, 4..6 on rank 2.
        // Rank 0 constrains 0 -> 2; rank 1 owns 2 -> 4; rank 2 owns 4 -> 5.
        let handles: Vec<_> = ThreadComm::world(3)
            .into_iter()
            .map(|comm| {
                std::thread::spawn(move || {
                    let num = numbering(&[2, 2, 2]);
                    let tags = DofMapCommTags::default();
                    let mut cons = DofConstraints::new();
                    let (dof, master) = match comm.rank() {
                        0 => (0, 2),
                        1 => (2, 4),
                        _ => (4, 5),
                    };
                    cons.add_constraint_row(dof, BTreeMap::from([(master, 1.0)]), 0.0, ConstraintOrigin::User, true)
                        .unwrap();
                    gather_constraints(&comm, &tags, &num, &mut cons, &BTreeSet::new()).unwrap();
                    cons.process(true).unwrap();
                    (comm.rank(), cons)
                })
            })
            .collect();
        for h in handles {
            let (rank, cons) = h.join().unwrap();
            if rank == 0 {
                assert!(cons.is_constrained(2) && cons.is_constrained(4));
                assert_eq!(cons.get(0).unwrap().row, BTreeMap::from([(5, 1.0)]));
            }
        }
    }

    #[test]
    fn scatter_merges_by_priority() {
        let handles: Vec<_> = ThreadComm::world(2)
            .into_iter()
            .map(|comm| {
                std::thread::spawn(move || {
                    let num = numbering(&[2, 2]);
                    let tags = DofMapCommTags::default();
                    let mut cons = DofConstraints::new();
                    // Both ranks constrain DOF 1; rank 1's hanging-node row outranks
                    // rank 0's Dirichlet row.
                    let (row, rhs, origin) = if comm.rank() == 0 {
                        (BTreeMap::new(), 9.0, ConstraintOrigin::Dirichlet(0))
                    } else {
                        (BTreeMap::from([(2, 0.5), (3, 0.5)]), 0.0, ConstraintOrigin::HangingNode)
                    };
                    cons.add_constraint_row(1, row, rhs, origin, true).unwrap();
                    scatter_constraints(&comm, &tags, &num, &mut cons).unwrap();
                    (comm.rank(), cons)
                })
            })
            .collect();
        for h in handles {
            let (rank, cons) = h.join().unwrap();
            let c = cons.get(1).unwrap();
            assert_eq!(c.origin, ConstraintOrigin::HangingNode, "rank {rank}");
        }
    }
}
