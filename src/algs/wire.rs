//! Fixed, versioned, little-endian wire types for the DOF map's exchanges.
//!
//! Every message starts with a [`WireHdr`] naming its kind, followed by a
//! [`WireCount`] and that many records. Records are `Pod` structs written in
//! sequence; [`WireReader`] decodes them without alignment requirements.

use bytemuck::{Pod, Zeroable};
use std::mem::size_of;

use crate::dof_error::DofMapError;

/// Bump when the layout or semantics change in incompatible ways.
pub const WIRE_VERSION: u16 = 1;

/// Message kinds.
pub mod kind {
    pub const SCALAR: u16 = 1;
    pub const DOF_REQUEST: u16 = 2;
    pub const DOF_REPLY: u16 = 3;
    pub const CONSTRAINT_ROWS: u16 = 4;
    pub const DOF_LIST: u16 = 5;
    pub const SPARSITY_ROWS: u16 = 6;
}

// ===== Common records ======================================================

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireHdr {
    pub version_le: u16,
    pub kind_le: u16,
    pub reserved_le: u32, // keep zero
}

impl WireHdr {
    pub fn new(kind: u16) -> Self {
        Self {
            version_le: WIRE_VERSION.to_le(),
            kind_le: kind.to_le(),
            reserved_le: 0,
        }
    }
    pub fn kind(&self) -> u16 {
        u16::from_le(self.kind_le)
    }
    pub fn version(&self) -> u16 {
        u16::from_le(self.version_le)
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireCount {
    pub n_le: u64,
}
impl WireCount {
    pub fn new(n: usize) -> Self {
        Self {
            n_le: (n as u64).to_le(),
        }
    }
    pub fn get(&self) -> usize {
        u64::from_le(self.n_le) as usize
    }
}

/// A bare `u64` (DOF index, count, reduction operand).
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireU64 {
    pub v_le: u64,
}
impl WireU64 {
    pub fn of(v: u64) -> Self {
        Self { v_le: v.to_le() }
    }
    pub fn get(&self) -> u64 {
        u64::from_le(self.v_le)
    }
}

/// A node or element handle.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireObjectKey {
    pub kind_le: u32,
    pub n_vars_le: u32, // number of WireDofStart records following, in replies
    pub id_le: u64,
}
impl WireObjectKey {
    pub fn new(kind: u32, id: u64, n_vars: u32) -> Self {
        Self {
            kind_le: kind.to_le(),
            n_vars_le: n_vars.to_le(),
            id_le: id.to_le(),
        }
    }
    pub fn kind(&self) -> u32 {
        u32::from_le(self.kind_le)
    }
    pub fn n_vars(&self) -> u32 {
        u32::from_le(self.n_vars_le)
    }
    pub fn id(&self) -> u64 {
        u64::from_le(self.id_le)
    }
}

/// First global index and count of one variable's DOFs on one object.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireDofStart {
    pub first_le: u64,
    pub n_le: u32,
    pub reserved_le: u32,
}
impl WireDofStart {
    pub fn new(first: u64, n: u32) -> Self {
        Self {
            first_le: first.to_le(),
            n_le: n.to_le(),
            reserved_le: 0,
        }
    }
    pub fn first(&self) -> u64 {
        u64::from_le(self.first_le)
    }
    pub fn n(&self) -> u32 {
        u32::from_le(self.n_le)
    }
}

/// Header of one constraint row; followed by `n_terms` [`WireTerm`] and
/// `n_qoi` [`WireQoiValue`] records.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireConstraintHdr {
    pub dof_le: u64,
    pub rhs_bits_le: u64,
    pub n_terms_le: u32,
    pub n_qoi_le: u32,
    pub priority_le: u32,
    pub reserved_le: u32,
}
impl WireConstraintHdr {
    pub fn new(dof: u64, rhs: f64, n_terms: usize, n_qoi: usize, priority: u32) -> Self {
        Self {
            dof_le: dof.to_le(),
            rhs_bits_le: rhs.to_bits().to_le(),
            n_terms_le: (n_terms as u32).to_le(),
            n_qoi_le: (n_qoi as u32).to_le(),
            priority_le: priority.to_le(),
            reserved_le: 0,
        }
    }
    pub fn dof(&self) -> u64 {
        u64::from_le(self.dof_le)
    }
    pub fn rhs(&self) -> f64 {
        f64::from_bits(u64::from_le(self.rhs_bits_le))
    }
    pub fn n_terms(&self) -> usize {
        u32::from_le(self.n_terms_le) as usize
    }
    pub fn n_qoi(&self) -> usize {
        u32::from_le(self.n_qoi_le) as usize
    }
    pub fn priority(&self) -> u32 {
        u32::from_le(self.priority_le)
    }
}

/// One `(master dof, coefficient)` pair.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireTerm {
    pub dof_le: u64,
    pub coeff_bits_le: u64,
}
impl WireTerm {
    pub fn new(dof: u64, coeff: f64) -> Self {
        Self {
            dof_le: dof.to_le(),
            coeff_bits_le: coeff.to_bits().to_le(),
        }
    }
    pub fn dof(&self) -> u64 {
        u64::from_le(self.dof_le)
    }
    pub fn coeff(&self) -> f64 {
        f64::from_bits(u64::from_le(self.coeff_bits_le))
    }
}

/// Adjoint constraint value for one quantity of interest.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireQoiValue {
    pub qoi_le: u32,
    pub reserved_le: u32,
    pub value_bits_le: u64,
}
impl WireQoiValue {
    pub fn new(qoi: u32, value: f64) -> Self {
        Self {
            qoi_le: qoi.to_le(),
            reserved_le: 0,
            value_bits_le: value.to_bits().to_le(),
        }
    }
    pub fn qoi(&self) -> u32 {
        u32::from_le(self.qoi_le)
    }
    pub fn value(&self) -> f64 {
        f64::from_bits(u64::from_le(self.value_bits_le))
    }
}

/// Header of one sparsity row; followed by `n_cols` [`WireU64`] column indices.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireRowHdr {
    pub row_le: u64,
    pub n_cols_le: u64,
}
impl WireRowHdr {
    pub fn new(row: u64, n_cols: usize) -> Self {
        Self {
            row_le: row.to_le(),
            n_cols_le: (n_cols as u64).to_le(),
        }
    }
    pub fn row(&self) -> u64 {
        u64::from_le(self.row_le)
    }
    pub fn n_cols(&self) -> usize {
        u64::from_le(self.n_cols_le) as usize
    }
}

// ===== Encoding / decoding =================================================

/// Appends records to a message buffer.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    /// Start a message of the given kind announcing `count` top-level records.
    pub fn new(kind: u16, count: usize) -> Self {
        let mut w = Self { buf: Vec::new() };
        w.push(WireHdr::new(kind));
        w.push(WireCount::new(count));
        w
    }

    pub fn push<T: Pod>(&mut self, rec: T) {
        self.buf.extend_from_slice(bytemuck::bytes_of(&rec));
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Decodes records from a received buffer.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    /// Check the header against `kind` and return the reader with the
    /// announced top-level record count.
    pub fn open(buf: &'a [u8], kind: u16) -> Result<(Self, usize), DofMapError> {
        let mut r = Self { buf, pos: 0 };
        let hdr: WireHdr = r.take()?;
        if hdr.version() != WIRE_VERSION {
            return Err(DofMapError::WireFormat(format!(
                "unsupported wire version {}",
                hdr.version()
            )));
        }
        if hdr.kind() != kind {
            return Err(DofMapError::WireFormat(format!(
                "expected message kind {kind}, got {}",
                hdr.kind()
            )));
        }
        let count: WireCount = r.take()?;
        Ok((r, count.get()))
    }

    pub fn take<T: Pod>(&mut self) -> Result<T, DofMapError> {
        let end = self.pos + size_of::<T>();
        let bytes = self.buf.get(self.pos..end).ok_or_else(|| {
            DofMapError::WireFormat(format!(
                "truncated record: need {} bytes at offset {}, have {}",
                size_of::<T>(),
                self.pos,
                self.buf.len()
            ))
        })?;
        self.pos = end;
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    /// Error unless every byte was consumed.
    pub fn finish(self) -> Result<(), DofMapError> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(DofMapError::WireFormat(format!(
                "{} trailing bytes",
                self.buf.len() - self.pos
            )))
        }
    }
}

#[cfg(test)]
mod layout_tests {
    use super::*;
    use static_assertions::const_assert_eq;

    const_assert_eq!(size_of::<WireHdr>(), 8);
    const_assert_eq!(size_of::<WireCount>(), 8);
    const_assert_eq!(size_of::<WireObjectKey>(), 16);
    const_assert_eq!(size_of::<WireDofStart>(), 16);
    const_assert_eq!(size_of::<WireConstraintHdr>(), 32);
    const_assert_eq!(size_of::<WireTerm>(), 16);
    const_assert_eq!(size_of::<WireQoiValue>(), 16);
    const_assert_eq!(size_of::<WireRowHdr>(), 16);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_row_decodes() {
        let mut w = WireWriter::new(kind::CONSTRAINT_ROWS, 1);
        w.push(WireConstraintHdr::new(12, 2.5, 2, 0, 3));
        w.push(WireTerm::new(4, 0.5));
        w.push(WireTerm::new(9, -0.25));
        let bytes = w.finish();

        let (mut r, n) = WireReader::open(&bytes, kind::CONSTRAINT_ROWS).unwrap();
        assert_eq!(n, 1);
        let hdr: WireConstraintHdr = r.take().unwrap();
        assert_eq!(hdr.dof(), 12);
        assert_eq!(hdr.rhs(), 2.5);
        assert_eq!(hdr.priority(), 3);
        let t0: WireTerm = r.take().unwrap();
        let t1: WireTerm = r.take().unwrap();
        assert_eq!((t0.dof(), t0.coeff()), (4, 0.5));
        assert_eq!((t1.dof(), t1.coeff()), (9, -0.25));
        r.finish().unwrap();
    }

    #[test]
    fn wrong_kind_and_truncation_are_errors() {
        let bytes = WireWriter::new(kind::DOF_LIST, 1).finish();
        assert!(WireReader::open(&bytes, kind::SCALAR).is_err());
        let (mut r, _) = WireReader::open(&bytes, kind::DOF_LIST).unwrap();
        assert!(r.take::<WireU64>().is_err());
    }
}
