//! File header constants and read/write helpers.
//!
//! ```text
//! offset  size  field
//! 0       6     magic "JEPSEN"
//! 6       4     version (u32 LE)
//! 10      8     block index pointer (u64 LE, 0 = none committed)
//! 18      ...   blocks
//! ```
//!
//! The index pointer is the only bytes of the file ever rewritten in place.
//! It is a single 8-byte write; a stale or torn pointer is caught when the
//! block it points at fails its CRC or is not an index block.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Result as IoResult, Seek, SeekFrom, Write};

/// Magic bytes at the start of every store file.
pub const MAGIC: &[u8; 6] = b"JEPSEN";

/// Length of [`MAGIC`].
pub const MAGIC_BYTES: u64 = 6;

/// Format version written by this crate.
pub const CURRENT_VERSION: u32 = 0;

/// Offset of the version field.
pub const VERSION_OFFSET: u64 = MAGIC_BYTES;

/// Offset of the block index pointer.
pub const INDEX_POINTER_OFFSET: u64 = VERSION_OFFSET + 4;

/// Total header size: magic (6) + version (4) + index pointer (8). The first
/// block starts here.
pub const HEADER_BYTES: u64 = INDEX_POINTER_OFFSET + 8;

/// Writes magic and `version` at offset 0. The index pointer slot is left
/// untouched.
pub fn write_header<W: Write + Seek>(w: &mut W, version: u32) -> IoResult<()> {
    let mut buf = Vec::with_capacity(INDEX_POINTER_OFFSET as usize);
    buf.extend_from_slice(MAGIC);
    buf.write_u32::<LittleEndian>(version)?;
    w.seek(SeekFrom::Start(0))?;
    w.write_all(&buf)?;
    Ok(())
}

/// Reads the magic bytes. Returns `None` if the file is shorter than the
/// magic.
pub fn read_magic<R: Read + Seek>(r: &mut R) -> IoResult<Option<[u8; 6]>> {
    r.seek(SeekFrom::Start(0))?;
    let mut buf = [0u8; 6];
    Ok(read_fully(r, &mut buf)?.then_some(buf))
}

/// Reads the version field. Returns `None` if it is truncated.
pub fn read_version<R: Read + Seek>(r: &mut R) -> IoResult<Option<u32>> {
    r.seek(SeekFrom::Start(VERSION_OFFSET))?;
    let mut buf = [0u8; 4];
    if !read_fully(r, &mut buf)? {
        return Ok(None);
    }
    Ok(Some((&buf[..]).read_u32::<LittleEndian>()?))
}

/// Reads the block index pointer. Returns `None` if the slot is missing
/// (short file) or zero (nothing committed yet).
pub fn read_index_pointer<R: Read + Seek>(r: &mut R) -> IoResult<Option<u64>> {
    r.seek(SeekFrom::Start(INDEX_POINTER_OFFSET))?;
    let mut buf = [0u8; 8];
    if !read_fully(r, &mut buf)? {
        return Ok(None);
    }
    let offset = (&buf[..]).read_u64::<LittleEndian>()?;
    Ok((offset != 0).then_some(offset))
}

/// Points the header at the block index stored at `offset`.
pub fn write_index_pointer<W: Write + Seek>(w: &mut W, offset: u64) -> IoResult<()> {
    w.seek(SeekFrom::Start(INDEX_POINTER_OFFSET))?;
    w.write_all(&offset.to_le_bytes())?;
    Ok(())
}

/// `read_exact` that reports a short read as `Ok(false)` instead of an error.
pub(crate) fn read_fully<R: Read>(r: &mut R, buf: &mut [u8]) -> IoResult<bool> {
    match r.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}
