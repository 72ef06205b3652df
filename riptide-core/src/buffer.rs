use std::os::fd::RawFd;

/// Reserved region before the read cursor, lets a protocol layer prepend a
/// small header without moving the payload.
pub const CHEAP_PREPEND: usize = 8;

/// Initial writable capacity of a fresh buffer.
pub const INITIAL_SIZE: usize = 1024;

/// A growable, self-compacting byte container used for socket read/write
/// staging.
///
/// Layout invariant: `CHEAP_PREPEND <= read cursor <= write cursor <=
/// storage length`. Bytes between the cursors are readable, bytes after the
/// write cursor are writable, and everything before the read cursor is
/// prependable slack.
#[derive(Debug, Eq, PartialEq)]
pub struct Buffer {
    storage: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    /// Creates a buffer with [`INITIAL_SIZE`] writable bytes.
    #[must_use]
    pub fn new() -> Buffer {
        Self::with_capacity(INITIAL_SIZE)
    }

    /// Creates a buffer with `initial_size` writable bytes.
    #[must_use]
    pub fn with_capacity(initial_size: usize) -> Buffer {
        Buffer {
            storage: vec![0; CHEAP_PREPEND + initial_size],
            reader_index: CHEAP_PREPEND,
            writer_index: CHEAP_PREPEND,
        }
    }

    /// The number of unread bytes.
    #[must_use]
    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    /// The number of bytes that fit after the write cursor without growing.
    #[must_use]
    pub fn writable_bytes(&self) -> usize {
        self.storage.len() - self.writer_index
    }

    /// The slack before the read cursor, including the prepend reservation.
    #[must_use]
    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    /// A view of the unread bytes, without consuming them.
    #[must_use]
    pub fn peek(&self) -> &[u8] {
        &self.storage[self.reader_index..self.writer_index]
    }

    /// Advances the read cursor by `len`, clamped: consuming everything
    /// readable (or more) resets both cursors to the start of the usable
    /// region without releasing memory.
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.reader_index += len;
        } else {
            self.retrieve_all();
        }
    }

    /// Empties the buffer, resetting both cursors.
    pub fn retrieve_all(&mut self) {
        self.reader_index = CHEAP_PREPEND;
        self.writer_index = CHEAP_PREPEND;
    }

    /// Drains every unread byte as an owned byte vector.
    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        self.retrieve_as_bytes(self.readable_bytes())
    }

    /// Drains `len` bytes from the front as an owned byte vector. Arbitrary
    /// byte sequences survive the round trip untouched; callers wanting text
    /// convert at the edge, lossily or checked as they see fit.
    ///
    /// # Panics
    /// if `len` exceeds the readable bytes.
    pub fn retrieve_as_bytes(&mut self, len: usize) -> Vec<u8> {
        assert!(len <= self.readable_bytes());
        let result = self.peek()[..len].to_vec();
        self.retrieve(len);
        result
    }

    /// Appends `data` after the write cursor, growing or compacting first
    /// when the writable region is too small.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable_bytes(data.len());
        let start = self.writer_index;
        self.storage[start..start + data.len()].copy_from_slice(data);
        self.has_written(data.len());
    }

    /// Writes `data` into the reserved region immediately before the read
    /// cursor and moves the read cursor back over it.
    ///
    /// # Panics
    /// if `data` is larger than the prependable slack.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.reader_index -= data.len();
        let start = self.reader_index;
        self.storage[start..start + data.len()].copy_from_slice(data);
    }

    /// Guarantees at least `len` writable bytes.
    pub fn ensure_writable_bytes(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        assert!(self.writable_bytes() >= len);
    }

    /// Marks `len` bytes after the write cursor as written.
    ///
    /// # Panics
    /// if `len` exceeds the writable bytes.
    pub fn has_written(&mut self, len: usize) {
        assert!(len <= self.writable_bytes());
        self.writer_index += len;
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            // not enough combined free space, reallocate
            self.storage.resize(self.writer_index + len, 0);
        } else {
            // shift unread bytes to the front, keeping the prepend reservation
            let readable = self.readable_bytes();
            self.storage
                .copy_within(self.reader_index..self.writer_index, CHEAP_PREPEND);
            self.reader_index = CHEAP_PREPEND;
            self.writer_index = self.reader_index + readable;
            assert_eq!(readable, self.readable_bytes());
        }
    }

    /// One scatter read from `fd` into the writable tail plus a 64KiB stack
    /// fallback, appending any overflow afterwards. Returns the byte count
    /// from the single `readv` call, `Ok(0)` means the peer half-closed.
    pub fn read_fd(&mut self, fd: RawFd) -> std::io::Result<usize> {
        let mut extra = [0_u8; 65536];
        let writable = self.writable_bytes();
        let n = {
            let start = self.writer_index;
            let tail = &mut self.storage[start..];
            crate::sys::readv2(fd, tail, &mut extra)?
        };
        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.storage.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_buffer_invariants() {
        let buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn append_retrieve_round_trip() {
        let mut buf = Buffer::new();
        buf.append(b"hello riptide");
        assert_eq!(buf.readable_bytes(), 13);
        assert_eq!(buf.retrieve_as_bytes(5), b"hello");
        assert_eq!(buf.peek(), b" riptide");
        assert_eq!(buf.retrieve_all_as_bytes(), b" riptide");
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn non_utf8_bytes_round_trip_untouched() {
        let mut buf = Buffer::new();
        let payload = [0xFF_u8, 0xFE, 0x00, 0x41];
        buf.append(&payload);
        assert_eq!(buf.retrieve_as_bytes(payload.len()), payload);
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn retrieve_is_clamped() {
        let mut buf = Buffer::new();
        buf.append(b"abc");
        buf.retrieve(1024);
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
    }

    #[test]
    fn grows_past_initial_capacity() {
        let mut buf = Buffer::with_capacity(1024);
        let payload: Vec<u8> = (0..2000_u32).map(|i| u8::try_from(i % 251).unwrap()).collect();
        buf.append(&payload);
        assert_eq!(buf.readable_bytes(), 2000);
        assert_eq!(buf.retrieve_as_bytes(2000), payload);
    }

    #[test]
    fn compacts_in_place_instead_of_growing() {
        let mut buf = Buffer::with_capacity(100);
        buf.append(&[b'x'; 80]);
        buf.retrieve(60);
        // 20 readable, 20 writable, 60 + CHEAP_PREPEND slack at the front
        assert_eq!(buf.readable_bytes(), 20);
        buf.append(&[b'y'; 50]);
        // fits after compaction, no reallocation needed
        assert_eq!(buf.readable_bytes(), 70);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
        let drained = buf.retrieve_all_as_bytes();
        assert!(drained.starts_with(&[b'x'; 20]));
        assert!(drained.ends_with(&[b'y'; 50]));
    }

    #[test]
    fn round_trip_across_compaction_boundary() {
        let mut buf = Buffer::with_capacity(64);
        buf.append(&[1_u8; 48]);
        buf.retrieve(40);
        buf.append(&[2_u8; 40]);
        let mut expected = vec![1_u8; 8];
        expected.extend_from_slice(&[2_u8; 40]);
        assert_eq!(buf.retrieve_as_bytes(48), expected);
    }

    #[test]
    fn prepend_within_reservation() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        buf.prepend(&7_u32.to_be_bytes());
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND - 4);
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(buf.retrieve_as_bytes(4), 7_u32.to_be_bytes());
        assert_eq!(buf.retrieve_all_as_bytes(), b"payload");
    }

    #[test]
    #[should_panic(expected = "data.len() <= self.prependable_bytes()")]
    fn oversized_prepend_panics() {
        let mut buf = Buffer::new();
        buf.prepend(&[0_u8; CHEAP_PREPEND + 1]);
    }

    #[test]
    fn read_fd_small_payload() -> std::io::Result<()> {
        let mut fds: [libc::c_int; 2] = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let wrote = unsafe { libc::write(fds[1], b"ping".as_ptr().cast(), 4) };
        assert_eq!(wrote, 4);

        let mut buf = Buffer::new();
        let n = buf.read_fd(fds[0])?;
        assert_eq!(n, 4);
        assert_eq!(buf.retrieve_all_as_bytes(), b"ping");
        unsafe {
            _ = libc::close(fds[0]);
            _ = libc::close(fds[1]);
        }
        Ok(())
    }

    #[test]
    fn read_fd_overflows_into_extra_buffer() -> std::io::Result<()> {
        let mut fds: [libc::c_int; 2] = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let payload: Vec<u8> = (0..4096_u32).map(|i| u8::try_from(i % 13).unwrap()).collect();
        let wrote = unsafe { libc::write(fds[1], payload.as_ptr().cast(), payload.len()) };
        assert_eq!(wrote, 4096);

        // 16 writable bytes, the rest must land in the stack fallback
        let mut buf = Buffer::with_capacity(16);
        let n = buf.read_fd(fds[0])?;
        assert_eq!(n, 4096);
        assert_eq!(buf.retrieve_as_bytes(4096), payload);
        unsafe {
            _ = libc::close(fds[0]);
            _ = libc::close(fds[1]);
        }
        Ok(())
    }
}
