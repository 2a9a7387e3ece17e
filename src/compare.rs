//! Byte-equality between files, plus the grouping helpers the dedup engine
//! uses to turn a hash collision into verified equivalence classes.

use std::fs::File;
use std::io::{Read, Result as IoResult};
use std::path::{Path, PathBuf};

pub const COMPARE_BUFFER_SIZE: usize = 10 * 1024;

/// `true` iff both files read identically to the end, streaming in fixed
/// buffers rather than loading either fully into memory.
pub fn contents_identical(a: &Path, b: &Path) -> IoResult<bool> {
    let mut fa = File::open(a)?;
    let mut fb = File::open(b)?;
    let mut buf_a = [0u8; COMPARE_BUFFER_SIZE];
    let mut buf_b = [0u8; COMPARE_BUFFER_SIZE];
    loop {
        let read_a = read_fill(&mut fa, &mut buf_a)?;
        let read_b = read_fill(&mut fb, &mut buf_b)?;
        if read_a != read_b || buf_a[..read_a] != buf_b[..read_b] {
            return Ok(false);
        }
        if read_a == 0 {
            return Ok(true);
        }
    }
}

/// Reads up to `buf.len()` bytes, retrying short reads, the way `read_exact`
/// would but without erroring on a final partial buffer.
fn read_fill(f: &mut File, buf: &mut [u8]) -> IoResult<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = f.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

/// `true` iff `path` contains exactly `bytes` and nothing more.
pub fn bytes_equal_file(bytes: &[u8], path: &Path) -> IoResult<bool> {
    let mut f = File::open(path)?;
    let mut buf = vec![0u8; bytes.len()];
    let read = read_fill(&mut f, &mut buf)?;
    if read != bytes.len() || buf != bytes {
        return Ok(false);
    }
    // Confirm there's nothing left.
    let mut probe = [0u8; 1];
    Ok(f.read(&mut probe)? == 0)
}

pub struct DedupResult {
    pub dups: Vec<PathBuf>,
    pub non_dups: Vec<PathBuf>,
}

/// Partitions `candidates` by whether each is byte-identical to `hero`.
/// Input order is preserved within each partition.
pub fn find_duplicates_of(hero: &Path, candidates: Vec<PathBuf>) -> IoResult<DedupResult> {
    if !hero.is_file() {
        return Ok(DedupResult { dups: vec![], non_dups: candidates });
    }

    let small_file_buffer = if candidates.len() > 1 {
        let metadata = std::fs::metadata(hero)?;
        if metadata.len() as usize <= COMPARE_BUFFER_SIZE {
            Some(std::fs::read(hero)?)
        } else {
            None
        }
    } else {
        None
    };

    let mut dups = Vec::new();
    let mut non_dups = Vec::new();
    for candidate in candidates {
        let identical = match &small_file_buffer {
            Some(buf) => bytes_equal_file(buf, &candidate)?,
            None => contents_identical(hero, &candidate)?,
        };
        if identical {
            dups.push(candidate);
        } else {
            non_dups.push(candidate);
        }
    }
    Ok(DedupResult { dups, non_dups })
}

/// Splits a list of same-hash candidates into content-equivalence classes.
/// `O(n^2)` worst case; acceptable since callers only ever hand this
/// pre-filtered hash-colliding groups.
pub fn group_duplicates(candidates: Vec<PathBuf>) -> IoResult<Vec<Vec<PathBuf>>> {
    let mut remaining = candidates;
    let mut groups = Vec::new();

    while !remaining.is_empty() {
        let pivot = remaining.remove(0);
        let DedupResult { mut dups, non_dups } = find_duplicates_of(&pivot, remaining)?;
        dups.insert(0, pivot);
        groups.push(dups);
        remaining = non_dups;
    }
    Ok(groups)
}
