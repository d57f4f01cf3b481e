//! Object/chunk boundary arithmetic. All of it is derived from the
//! triple `(objsize, headerlen, recoverybytes)` alone, so parallel
//! writers, readers and offline walkers compute identical boundaries
//! without coordination.

use crate::error::Error;
use crate::tagging::{DataState, Ftag};

/// Per-object data capacity of a file whose data begins right after the
/// recovery header. Every object reserves the header plus one footer for
/// the file run it terminates.
pub(crate) fn chunk_cap(objsize: u64, headerlen: u64, recoverybytes: u64) -> crate::Result<u64> {
    let overhead = headerlen + recoverybytes;
    if objsize <= overhead {
        return Err(Error::inval(format!(
            "object size {objsize} cannot hold {overhead} bytes of recovery info"
        )));
    }
    Ok(objsize - overhead)
}

/// Data capacity of a file's first object, where packing may have
/// shifted its start offset.
pub(crate) fn first_cap(objsize: u64, offset: u64, recoverybytes: u64) -> crate::Result<u64> {
    let overhead = offset + recoverybytes;
    if objsize <= overhead {
        return Err(Error::inval(format!(
            "object size {objsize} leaves no data room at offset {offset}"
        )));
    }
    Ok(objsize - overhead)
}

/// Final object number referenced by a file.
///
/// Finalized files use the exact layout capacity. A file still being
/// written reserves one extra footer per object, widening the bound so
/// offline passes never under-count the objects a crashed writer may
/// have touched.
pub(crate) fn file_bounds(ftag: &Ftag, headerlen: u64) -> crate::Result<u64> {
    let mut cap = chunk_cap(ftag.objsize, headerlen, ftag.recoverybytes)?;
    if ftag.state < DataState::Fin {
        cap = cap.saturating_sub(ftag.recoverybytes).max(1);
    }
    let rel = ftag.bytes + (ftag.offset.saturating_sub(headerlen));
    let mut endobj = ftag.objno + rel / cap;
    if ftag.state >= DataState::Fin && rel > 0 && rel % cap == 0 {
        endobj -= 1;
    }
    Ok(endobj)
}

/// `(logical offset, size)` of chunk `chunknum`, or `None` past the last
/// chunk. Chunk `k` occupies object `objno + k` in its entirety.
pub(crate) fn chunk_bounds(
    ftag: &Ftag,
    headerlen: u64,
    chunknum: u64,
) -> crate::Result<Option<(u64, u64)>> {
    let cap = chunk_cap(ftag.objsize, headerlen, ftag.recoverybytes)?;
    let cap0 = first_cap(ftag.objsize, ftag.offset, ftag.recoverybytes)?;
    if chunknum == 0 {
        return Ok(Some((0, ftag.bytes.min(cap0))));
    }
    let start = cap0 + (chunknum - 1) * cap;
    if start >= ftag.bytes {
        return Ok(None);
    }
    Ok(Some((start, cap.min(ftag.bytes - start))))
}

/// Map a logical file position onto `(objno, intra-object offset,
/// bytes remaining in the object's data region)`.
pub(crate) fn locate(ftag: &Ftag, headerlen: u64, pos: u64) -> crate::Result<(u64, u64, u64)> {
    let cap = chunk_cap(ftag.objsize, headerlen, ftag.recoverybytes)?;
    let cap0 = first_cap(ftag.objsize, ftag.offset, ftag.recoverybytes)?;
    if pos < cap0 {
        return Ok((ftag.objno, ftag.offset + pos, cap0 - pos));
    }
    let rel = pos - cap0;
    Ok((
        ftag.objno + 1 + rel / cap,
        headerlen + rel % cap,
        cap - rel % cap,
    ))
}
