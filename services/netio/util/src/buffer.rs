//! Buffer and segment helpers.
//!
//! Messages serialize into a list of `Bytes` segments which are written to
//! the transport with vectored I/O. The helpers here allocate read buffers,
//! grow them in fixed steps, and advance or flatten segment lists.

use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use std::io::IoSlice;

/// Allocate a read buffer with the given initial capacity.
pub fn allocate(capacity: usize) -> BytesMut {
    BytesMut::with_capacity(capacity.max(1))
}

/// Make sure `buf` has at least `step` bytes of spare capacity.
///
/// Growth happens in multiples of `step` so repeated small reads do not
/// trigger a reallocation each time.
pub fn ensure_spare(buf: &mut BytesMut, step: usize) {
    let step = step.max(1);
    if buf.capacity() - buf.len() < step {
        buf.reserve(step);
    }
}

/// Total number of bytes left across all segments.
pub fn remaining(segments: &[Bytes]) -> usize {
    segments.iter().map(Bytes::len).sum()
}

/// Whether any segment still has bytes to write.
pub fn has_remaining(segments: &[Bytes]) -> bool {
    segments.iter().any(|s| !s.is_empty())
}

/// Flatten segments into a single contiguous buffer.
///
/// A single segment is returned as is without copying.
pub fn gather(segments: &[Bytes]) -> Bytes {
    match segments {
        [] => Bytes::new(),
        [only] => only.clone(),
        many => {
            let mut out = BytesMut::with_capacity(remaining(many));
            for segment in many {
                out.extend_from_slice(segment);
            }
            out.freeze()
        }
    }
}

/// Borrow the non-empty segments as `IoSlice`s for a vectored write.
pub fn io_slices(segments: &VecDeque<Bytes>) -> Vec<IoSlice<'_>> {
    segments
        .iter()
        .filter(|s| !s.is_empty())
        .map(|s| IoSlice::new(s))
        .collect()
}

/// Consume `n` written bytes from the front of a segment list.
///
/// Fully written segments are dropped; a partially written one is advanced
/// in place.
pub fn advance(segments: &mut VecDeque<Bytes>, mut n: usize) {
    while n > 0 {
        let Some(front) = segments.front_mut() else {
            return;
        };
        if front.len() <= n {
            n -= front.len();
            segments.pop_front();
        } else {
            front.advance(n);
            n = 0;
        }
    }
    while segments.front().is_some_and(Bytes::is_empty) {
        segments.pop_front();
    }
}

/// Find the first occurrence of `pattern` in `haystack`.
///
/// An empty pattern never matches.
pub fn index_of(haystack: &[u8], pattern: &[u8]) -> Option<usize> {
    if pattern.is_empty() || pattern.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(pattern.len())
        .position(|window| window == pattern)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_single_segment_is_shared() {
        let one = Bytes::from_static(b"hello");
        let gathered = gather(std::slice::from_ref(&one));
        assert_eq!(gathered.as_ptr(), one.as_ptr());
    }

    #[test]
    fn test_gather_many_segments() {
        let segments = [
            Bytes::from_static(b"ab"),
            Bytes::new(),
            Bytes::from_static(b"cde"),
        ];
        assert_eq!(&gather(&segments)[..], b"abcde");
        assert_eq!(remaining(&segments), 5);
        assert!(has_remaining(&segments));
        assert!(!has_remaining(&[Bytes::new()]));
    }

    #[test]
    fn test_advance_across_segments() {
        let mut segments: VecDeque<Bytes> = VecDeque::from(vec![
            Bytes::from_static(b"abc"),
            Bytes::from_static(b"defg"),
        ]);
        advance(&mut segments, 4);
        assert_eq!(segments.len(), 1);
        assert_eq!(&segments[0][..], b"efg");

        advance(&mut segments, 3);
        assert!(segments.is_empty());
    }

    #[test]
    fn test_io_slices_skip_empty() {
        let segments: VecDeque<Bytes> =
            VecDeque::from(vec![Bytes::new(), Bytes::from_static(b"x")]);
        assert_eq!(io_slices(&segments).len(), 1);
    }

    #[test]
    fn test_ensure_spare_grows() {
        let mut buf = allocate(4);
        buf.extend_from_slice(b"1234");
        ensure_spare(&mut buf, 16);
        assert!(buf.capacity() - buf.len() >= 16);
    }

    #[test]
    fn test_index_of() {
        assert_eq!(index_of(b"hello\r\nworld", b"\r\n"), Some(5));
        assert_eq!(index_of(b"hello", b"xyz"), None);
        assert_eq!(index_of(b"ab", b"abc"), None);
        assert_eq!(index_of(b"ab", b""), None);
    }
}
