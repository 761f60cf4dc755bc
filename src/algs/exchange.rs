//! Collective helpers built on point-to-point [`Communicator`] messages.
//!
//! Each round is a personalized all-to-all: every rank sends exactly one
//! (possibly empty) buffer to every other rank on the same tag, then receives
//! one from each. Per-channel FIFO delivery keeps consecutive rounds on one
//! tag apart.

use std::collections::BTreeMap;

use crate::algs::communicator::{CommTag, Communicator, Wait};
use crate::algs::wire::{kind, WireReader, WireU64, WireWriter};
use crate::dof_error::DofMapError;
use crate::topology::ids::Rank;

/// Send `outgoing[r]` to each rank `r` and return what every rank sent us.
///
/// Ranks missing from `outgoing` receive an empty buffer. The entry for our
/// own rank is handed back without touching the communicator.
pub fn all_to_all<C: Communicator>(
    comm: &C,
    tag: CommTag,
    mut outgoing: BTreeMap<Rank, Vec<u8>>,
) -> Result<BTreeMap<Rank, Vec<u8>>, DofMapError> {
    let me = comm.rank();
    let size = comm.size();
    if let Some(&bad) = outgoing.keys().find(|&&r| r >= size) {
        return Err(DofMapError::ProcessorOutOfRange { rank: bad, size });
    }

    let mut incoming = BTreeMap::new();
    if let Some(own) = outgoing.remove(&me) {
        incoming.insert(me, own);
    }

    let mut pending_sends = Vec::with_capacity(size.saturating_sub(1));
    for peer in (0..size).filter(|&p| p != me) {
        let buf = outgoing.remove(&peer).unwrap_or_default();
        pending_sends.push(comm.isend(peer, tag.as_u16(), &buf));
    }
    let pending_recvs: Vec<_> = (0..size)
        .filter(|&p| p != me)
        .map(|peer| (peer, comm.irecv(peer, tag.as_u16())))
        .collect();

    for (peer, h) in pending_recvs {
        let data = h.wait().ok_or_else(|| DofMapError::CommError {
            neighbor: peer,
            detail: "receive did not complete".into(),
        })?;
        incoming.insert(peer, data);
    }
    for s in pending_sends {
        let _ = s.wait();
    }
    Ok(incoming)
}

/// Every rank's `value`, indexed by rank.
pub fn allgather_u64<C: Communicator>(
    comm: &C,
    tag: CommTag,
    value: u64,
) -> Result<Vec<u64>, DofMapError> {
    let mut w = WireWriter::new(kind::SCALAR, 1);
    w.push(WireU64::of(value));
    let msg = w.finish();
    let outgoing = (0..comm.size()).map(|r| (r, msg.clone())).collect();
    let incoming = all_to_all(comm, tag, outgoing)?;

    let mut out = Vec::with_capacity(comm.size());
    for (peer, buf) in incoming {
        let (mut r, n) = WireReader::open(&buf, kind::SCALAR)?;
        if n != 1 {
            return Err(DofMapError::WireFormat(format!(
                "rank {peer} sent {n} scalars"
            )));
        }
        out.push(r.take::<WireU64>()?.get());
        r.finish()?;
    }
    Ok(out)
}

/// Global sum of `value`.
pub fn allreduce_sum<C: Communicator>(
    comm: &C,
    tag: CommTag,
    value: u64,
) -> Result<u64, DofMapError> {
    Ok(allgather_u64(comm, tag, value)?.into_iter().sum())
}

/// Global maximum of `value`.
pub fn allreduce_max<C: Communicator>(
    comm: &C,
    tag: CommTag,
    value: u64,
) -> Result<u64, DofMapError> {
    Ok(allgather_u64(comm, tag, value)?
        .into_iter()
        .max()
        .unwrap_or(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{NoComm, ThreadComm};

    #[test]
    fn serial_collectives() {
        let tag = CommTag::new(1);
        assert_eq!(allgather_u64(&NoComm, tag, 5).unwrap(), vec![5]);
        assert_eq!(allreduce_sum(&NoComm, tag, 5).unwrap(), 5);
    }

    #[test]
    fn threaded_allgather_and_reduce() {
        let handles: Vec<_> = ThreadComm::world(3)
            .into_iter()
            .map(|comm| {
                std::thread::spawn(move || {
                    let tag = CommTag::new(2);
                    let v = 10 * (comm.rank() as u64 + 1);
                    let all = allgather_u64(&comm, tag, v).unwrap();
                    let sum = allreduce_sum(&comm, tag, v).unwrap();
                    let max = allreduce_max(&comm, tag, v).unwrap();
                    (all, sum, max)
                })
            })
            .collect();
        for h in handles {
            let (all, sum, max) = h.join().unwrap();
            assert_eq!(all, vec![10, 20, 30]);
            assert_eq!(sum, 60);
            assert_eq!(max, 30);
        }
    }

    #[test]
    fn all_to_all_personalized() {
        let handles: Vec<_> = ThreadComm::world(2)
            .into_iter()
            .map(|comm| {
                std::thread::spawn(move || {
                    let me = comm.rank() as u8;
                    let out = (0..2).map(|r| (r, vec![me, r as u8])).collect();
                    all_to_all(&comm, CommTag::new(3), out).unwrap()
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results[0][&1], vec![1, 0]);
        assert_eq!(results[1][&0], vec![0, 1]);
        assert_eq!(results[1][&1], vec![1, 1]);
    }

    #[test]
    fn out_of_range_destination_is_rejected() {
        let out = BTreeMap::from([(3, vec![1])]);
        let err = all_to_all(&NoComm, CommTag::new(4), out).unwrap_err();
        assert_eq!(err, DofMapError::ProcessorOutOfRange { rank: 3, size: 1 });
    }
}
