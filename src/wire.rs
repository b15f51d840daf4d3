//! Binary wire formats
//!
//! Every integer that crosses a file boundary is **little-endian** with a
//! fixed width:
//!
//! | field              | bytes | signedness                      |
//! |--------------------|-------|---------------------------------|
//! | ENTITY (vertex id) | 5     | unsigned                        |
//! | PREDICATE (label)  | 4     | unsigned                        |
//! | BLOCK (local id)   | 4     | unsigned, `0` reserved          |
//! | BLOCK_OR_SINGLETON | 5     | two's complement, sign-extended |
//! | K_TYPE (level)     | 2     | unsigned                        |
//!
//! The record shapes built from these primitives (per-level outcomes,
//! refines-mappings, singleton-mappings, interval and local-to-global tables)
//! are exposed as small streaming readers plus free-function writers. Readers
//! distinguish a **clean EOF** (between records; `Ok(None)`) from an EOF in
//! the middle of a record, which is a file-format error.

use std::io::{self, Read, Write};

/// Width of an ENTITY (vertex id) field.
pub const BYTES_PER_ENTITY: usize = 5;
/// Width of a PREDICATE (edge label) field.
pub const BYTES_PER_PREDICATE: usize = 4;
/// Width of a BLOCK (unsigned local block id) field.
pub const BYTES_PER_BLOCK: usize = 4;
/// Width of a signed BLOCK_OR_SINGLETON field.
pub const BYTES_PER_BLOCK_OR_SINGLETON: usize = 5;
/// Width of a K_TYPE (level) field.
pub const BYTES_PER_K_TYPE: usize = 2;

/// Errors surfaced by the wire codecs.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The stream ended inside a record.
    #[error("unexpected EOF in the middle of a record")]
    UnexpectedEof,
    /// A field held a value the format does not allow.
    #[error("malformed record: {0}")]
    Malformed(&'static str),
}

/// Fill `buf` completely, or report a clean EOF.
///
/// Returns `Ok(false)` when the stream is exhausted *before the first byte*,
/// `Ok(true)` when `buf` was filled, and [`WireError::UnexpectedEof`] when the
/// stream ends partway through.
fn fill_or_eof<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<bool, WireError> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(WireError::UnexpectedEof),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

fn fill_exact<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<(), WireError> {
    if fill_or_eof(r, buf)? {
        Ok(())
    } else {
        Err(WireError::UnexpectedEof)
    }
}

// ============================================================================
// Primitives
// ============================================================================

/// Write a 5-byte ENTITY field.
pub fn write_entity<W: Write>(w: &mut W, value: u64) -> io::Result<()> {
    debug_assert!(value < 1 << 40, "entity id exceeds 5 bytes: {value}");
    w.write_all(&value.to_le_bytes()[..BYTES_PER_ENTITY])
}

/// Read a 5-byte ENTITY field; `None` on clean EOF.
pub fn read_entity_opt<R: Read>(r: &mut R) -> Result<Option<u64>, WireError> {
    let mut buf = [0u8; BYTES_PER_ENTITY];
    if !fill_or_eof(r, &mut buf)? {
        return Ok(None);
    }
    let mut full = [0u8; 8];
    full[..BYTES_PER_ENTITY].copy_from_slice(&buf);
    Ok(Some(u64::from_le_bytes(full)))
}

/// Read a 5-byte ENTITY field that must be present.
pub fn read_entity<R: Read>(r: &mut R) -> Result<u64, WireError> {
    read_entity_opt(r)?.ok_or(WireError::UnexpectedEof)
}

/// Write a 4-byte PREDICATE field.
pub fn write_predicate<W: Write>(w: &mut W, value: u32) -> io::Result<()> {
    w.write_all(&value.to_le_bytes())
}

/// Read a 4-byte PREDICATE field that must be present.
pub fn read_predicate<R: Read>(r: &mut R) -> Result<u32, WireError> {
    let mut buf = [0u8; BYTES_PER_PREDICATE];
    fill_exact(r, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Write a 4-byte BLOCK field.
pub fn write_block<W: Write>(w: &mut W, value: u64) -> io::Result<()> {
    debug_assert!(value <= u32::MAX as u64, "block id exceeds 4 bytes: {value}");
    w.write_all(&(value as u32).to_le_bytes())
}

/// Read a 4-byte BLOCK field; `None` on clean EOF.
pub fn read_block_opt<R: Read>(r: &mut R) -> Result<Option<u64>, WireError> {
    let mut buf = [0u8; BYTES_PER_BLOCK];
    if !fill_or_eof(r, &mut buf)? {
        return Ok(None);
    }
    Ok(Some(u32::from_le_bytes(buf) as u64))
}

/// Read a 4-byte BLOCK field that must be present.
pub fn read_block<R: Read>(r: &mut R) -> Result<u64, WireError> {
    read_block_opt(r)?.ok_or(WireError::UnexpectedEof)
}

/// Write a 5-byte signed BLOCK_OR_SINGLETON field (two's complement).
pub fn write_signed<W: Write>(w: &mut W, value: i64) -> io::Result<()> {
    debug_assert!(
        (-(1i64 << 39)..(1i64 << 39)).contains(&value),
        "signed id exceeds 5 bytes: {value}"
    );
    w.write_all(&value.to_le_bytes()[..BYTES_PER_BLOCK_OR_SINGLETON])
}

/// Read a 5-byte signed BLOCK_OR_SINGLETON field; `None` on clean EOF.
///
/// The high bit of the last byte is sign-extended into the full `i64`.
pub fn read_signed_opt<R: Read>(r: &mut R) -> Result<Option<i64>, WireError> {
    let mut buf = [0u8; BYTES_PER_BLOCK_OR_SINGLETON];
    if !fill_or_eof(r, &mut buf)? {
        return Ok(None);
    }
    let fill = if buf[BYTES_PER_BLOCK_OR_SINGLETON - 1] & 0x80 != 0 {
        0xFF
    } else {
        0x00
    };
    let mut full = [fill; 8];
    full[..BYTES_PER_BLOCK_OR_SINGLETON].copy_from_slice(&buf);
    Ok(Some(i64::from_le_bytes(full)))
}

/// Read a 5-byte signed BLOCK_OR_SINGLETON field that must be present.
pub fn read_signed<R: Read>(r: &mut R) -> Result<i64, WireError> {
    read_signed_opt(r)?.ok_or(WireError::UnexpectedEof)
}

/// Write a 2-byte K_TYPE field.
pub fn write_level<W: Write>(w: &mut W, value: u16) -> io::Result<()> {
    w.write_all(&value.to_le_bytes())
}

/// Read a 2-byte K_TYPE field; `None` on clean EOF.
pub fn read_level_opt<R: Read>(r: &mut R) -> Result<Option<u16>, WireError> {
    let mut buf = [0u8; BYTES_PER_K_TYPE];
    if !fill_or_eof(r, &mut buf)? {
        return Ok(None);
    }
    Ok(Some(u16::from_le_bytes(buf)))
}

/// Read a 2-byte K_TYPE field that must be present.
pub fn read_level<R: Read>(r: &mut R) -> Result<u16, WireError> {
    read_level_opt(r)?.ok_or(WireError::UnexpectedEof)
}

// ============================================================================
// Record shapes
// ============================================================================

/// One record of an `outcome_condensed-KKKK.bin` file.
///
/// `block` is the in-file (1-based) local block id; `0` never appears here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeRecord {
    /// In-file local block id.
    pub block: u64,
    /// Member vertex ids, in the order they were written.
    pub members: Vec<u64>,
}

/// Streaming reader for per-level outcome files.
pub struct OutcomeReader<R> {
    inner: R,
}

impl<R: Read> OutcomeReader<R> {
    /// Wrap a byte stream positioned at the start of the file.
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read the next record, or `None` at a clean end of file.
    pub fn next_record(&mut self) -> Result<Option<OutcomeRecord>, WireError> {
        let block = match read_block_opt(&mut self.inner)? {
            Some(b) => b,
            None => return Ok(None),
        };
        let size = read_entity(&mut self.inner)?;
        let mut members = Vec::with_capacity(size as usize);
        for _ in 0..size {
            members.push(read_entity(&mut self.inner)?);
        }
        Ok(Some(OutcomeRecord { block, members }))
    }
}

/// Write one outcome record (`BLOCK id | ENTITY size | ENTITY...`).
pub fn write_outcome_record<W: Write>(
    w: &mut W,
    infile_block: u64,
    members: &[u64],
) -> io::Result<()> {
    write_block(w, infile_block)?;
    write_entity(w, members.len() as u64)?;
    for &v in members {
        write_entity(w, v)?;
    }
    Ok(())
}

/// One record of a `mapping-KKKKtoLLLL.bin` refines file.
///
/// Children are in-file ids: `0` is the "some children are singletons"
/// sentinel, any other value is a level-`L` block id plus one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingRecord {
    /// In-file parent (level `K`) block id.
    pub parent: u64,
    /// In-file child ids, `0` = singleton sentinel.
    pub children: Vec<u64>,
}

/// Streaming reader for refines-mapping files.
pub struct MappingReader<R> {
    inner: R,
}

impl<R: Read> MappingReader<R> {
    /// Wrap a byte stream positioned at the start of the file.
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read the next record, or `None` at a clean end of file.
    pub fn next_record(&mut self) -> Result<Option<MappingRecord>, WireError> {
        let parent = match read_block_opt(&mut self.inner)? {
            Some(p) => p,
            None => return Ok(None),
        };
        let count = read_block(&mut self.inner)?;
        let mut children = Vec::with_capacity(count as usize);
        for _ in 0..count {
            children.push(read_block(&mut self.inner)?);
        }
        Ok(Some(MappingRecord { parent, children }))
    }
}

/// Write one refines record (`BLOCK parent | BLOCK count | BLOCK...`).
pub fn write_mapping_record<W: Write>(
    w: &mut W,
    infile_parent: u64,
    children: &[u64],
) -> io::Result<()> {
    write_block(w, infile_parent)?;
    write_block(w, children.len() as u64)?;
    for &c in children {
        write_block(w, c)?;
    }
    Ok(())
}

/// One record of a `singleton_mapping-KKKKtoLLLL.bin` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingletonMappingRecord {
    /// In-file parent (level `K`) block id.
    pub parent: u64,
    /// Vertices that left `parent` as singletons, decoded from their
    /// `−(v+1)` wire form.
    pub singletons: Vec<u64>,
}

/// Streaming reader for singleton-mapping files.
pub struct SingletonMappingReader<R> {
    inner: R,
}

impl<R: Read> SingletonMappingReader<R> {
    /// Wrap a byte stream positioned at the start of the file.
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read the next record, or `None` at a clean end of file.
    pub fn next_record(&mut self) -> Result<Option<SingletonMappingRecord>, WireError> {
        let parent = match read_block_opt(&mut self.inner)? {
            Some(p) => p,
            None => return Ok(None),
        };
        let count = read_signed(&mut self.inner)?;
        if count < 0 {
            return Err(WireError::Malformed("negative singleton count"));
        }
        let mut singletons = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let id = read_signed(&mut self.inner)?;
            if id >= 0 {
                return Err(WireError::Malformed("singleton id must be negative"));
            }
            singletons.push((-id - 1) as u64);
        }
        Ok(Some(SingletonMappingRecord { parent, singletons }))
    }
}

/// Write one singleton-mapping record; vertices are encoded as `−(v+1)`.
pub fn write_singleton_mapping_record<W: Write>(
    w: &mut W,
    infile_parent: u64,
    singleton_vertices: &[u64],
) -> io::Result<()> {
    write_block(w, infile_parent)?;
    write_signed(w, singleton_vertices.len() as i64)?;
    for &v in singleton_vertices {
        write_signed(w, -(v as i64) - 1)?;
    }
    Ok(())
}

/// One record of the `condensed_multi_summary_intervals.bin` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalRecord {
    /// Global summary node id (signed: negative = singleton).
    pub node: i64,
    /// First level the node is alive at.
    pub start: u16,
    /// Last level the node is alive at.
    pub end: u16,
}

/// Streaming reader for the intervals file.
pub struct IntervalReader<R> {
    inner: R,
}

impl<R: Read> IntervalReader<R> {
    /// Wrap a byte stream positioned at the start of the file.
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read the next record, or `None` at a clean end of file.
    pub fn next_record(&mut self) -> Result<Option<IntervalRecord>, WireError> {
        let node = match read_signed_opt(&mut self.inner)? {
            Some(n) => n,
            None => return Ok(None),
        };
        let start = read_level(&mut self.inner)?;
        let end = read_level(&mut self.inner)?;
        Ok(Some(IntervalRecord { node, start, end }))
    }
}

/// Write one interval record.
pub fn write_interval_record<W: Write>(w: &mut W, node: i64, start: u16, end: u16) -> io::Result<()> {
    write_signed(w, node)?;
    write_level(w, start)?;
    write_level(w, end)
}

/// One record of the `condensed_multi_summary_local_global_map.bin` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalGlobalRecord {
    /// Level the global node is first alive at.
    pub level: u16,
    /// Local (per-level, in-file) id; `0` is the synthetic universal block.
    pub local: i64,
    /// Globally unique id.
    pub global: i64,
}

/// Streaming reader for the local-to-global map file.
pub struct LocalGlobalReader<R> {
    inner: R,
}

impl<R: Read> LocalGlobalReader<R> {
    /// Wrap a byte stream positioned at the start of the file.
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read the next record, or `None` at a clean end of file.
    pub fn next_record(&mut self) -> Result<Option<LocalGlobalRecord>, WireError> {
        let level = match read_level_opt(&mut self.inner)? {
            Some(l) => l,
            None => return Ok(None),
        };
        let local = read_signed(&mut self.inner)?;
        let global = read_signed(&mut self.inner)?;
        Ok(Some(LocalGlobalRecord { level, local, global }))
    }
}

/// Write one local-to-global record.
pub fn write_local_global_record<W: Write>(
    w: &mut W,
    level: u16,
    local: i64,
    global: i64,
) -> io::Result<()> {
    write_level(w, level)?;
    write_signed(w, local)?;
    write_signed(w, global)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn entity_round_trip_and_width() {
        let mut buf = Vec::new();
        for v in [0u64, 1, 255, 256, (1 << 40) - 1] {
            write_entity(&mut buf, v).unwrap();
        }
        assert_eq!(buf.len(), 5 * BYTES_PER_ENTITY);
        let mut r = Cursor::new(buf);
        for v in [0u64, 1, 255, 256, (1 << 40) - 1] {
            assert_eq!(read_entity(&mut r).unwrap(), v);
        }
        assert_eq!(read_entity_opt(&mut r).unwrap(), None);
    }

    #[test]
    fn signed_sign_extension() {
        let mut buf = Vec::new();
        let values = [0i64, 1, -1, -2, 12345, -678901, (1 << 39) - 1, -(1 << 39)];
        for v in values {
            write_signed(&mut buf, v).unwrap();
        }
        let mut r = Cursor::new(buf);
        for v in values {
            assert_eq!(read_signed(&mut r).unwrap(), v);
        }
        assert_eq!(read_signed_opt(&mut r).unwrap(), None);
    }

    #[test]
    fn truncated_record_is_an_error() {
        // Three of the five entity bytes.
        let mut r = Cursor::new(vec![0xAAu8, 0xBB, 0xCC]);
        assert!(matches!(
            read_entity_opt(&mut r),
            Err(WireError::UnexpectedEof)
        ));
    }

    #[test]
    fn outcome_records_round_trip() {
        let mut buf = Vec::new();
        write_outcome_record(&mut buf, 1, &[0, 7, 42]).unwrap();
        write_outcome_record(&mut buf, 3, &[]).unwrap();
        let mut rd = OutcomeReader::new(Cursor::new(buf));
        assert_eq!(
            rd.next_record().unwrap().unwrap(),
            OutcomeRecord { block: 1, members: vec![0, 7, 42] }
        );
        assert_eq!(
            rd.next_record().unwrap().unwrap(),
            OutcomeRecord { block: 3, members: vec![] }
        );
        assert!(rd.next_record().unwrap().is_none());
    }

    #[test]
    fn mapping_records_keep_the_sentinel() {
        let mut buf = Vec::new();
        write_mapping_record(&mut buf, 1, &[2, 0, 5]).unwrap();
        let mut rd = MappingReader::new(Cursor::new(buf));
        let rec = rd.next_record().unwrap().unwrap();
        assert_eq!(rec.parent, 1);
        assert_eq!(rec.children, vec![2, 0, 5]);
        assert!(rd.next_record().unwrap().is_none());
    }

    #[test]
    fn singleton_mapping_encodes_negated_vertices() {
        let mut buf = Vec::new();
        write_singleton_mapping_record(&mut buf, 4, &[0, 9]).unwrap();
        // Raw layout check: the first singleton must be -(0+1) = -1.
        let mut probe = Cursor::new(buf.clone());
        assert_eq!(read_block(&mut probe).unwrap(), 4);
        assert_eq!(read_signed(&mut probe).unwrap(), 2);
        assert_eq!(read_signed(&mut probe).unwrap(), -1);
        assert_eq!(read_signed(&mut probe).unwrap(), -10);

        let mut rd = SingletonMappingReader::new(Cursor::new(buf));
        let rec = rd.next_record().unwrap().unwrap();
        assert_eq!(rec.parent, 4);
        assert_eq!(rec.singletons, vec![0, 9]);
    }

    #[test]
    fn singleton_mapping_rejects_nonnegative_ids() {
        let mut buf = Vec::new();
        write_block(&mut buf, 4).unwrap();
        write_signed(&mut buf, 1).unwrap();
        write_signed(&mut buf, 3).unwrap(); // not a singleton id
        let mut rd = SingletonMappingReader::new(Cursor::new(buf));
        assert!(matches!(rd.next_record(), Err(WireError::Malformed(_))));
    }

    #[test]
    fn interval_and_local_global_round_trip() {
        let mut buf = Vec::new();
        write_interval_record(&mut buf, -3, 1, 4).unwrap();
        write_interval_record(&mut buf, 17, 0, 0).unwrap();
        let mut rd = IntervalReader::new(Cursor::new(buf));
        assert_eq!(
            rd.next_record().unwrap().unwrap(),
            IntervalRecord { node: -3, start: 1, end: 4 }
        );
        assert_eq!(
            rd.next_record().unwrap().unwrap(),
            IntervalRecord { node: 17, start: 0, end: 0 }
        );
        assert!(rd.next_record().unwrap().is_none());

        let mut buf = Vec::new();
        write_local_global_record(&mut buf, 2, 5, 31).unwrap();
        let mut rd = LocalGlobalReader::new(Cursor::new(buf));
        assert_eq!(
            rd.next_record().unwrap().unwrap(),
            LocalGlobalRecord { level: 2, local: 5, global: 31 }
        );
    }
}
