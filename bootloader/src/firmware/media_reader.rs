//! Bounded reader over an open boot device
//!
//! Wraps a [`MediaAccess`] driver and one open handle. All offsets are
//! relative to the candidate's image offset, and every read is checked
//! against the size the driver reports, so a parser can never ask the
//! hardware for bytes past the end of the medium.
//!
//! Small reads (tree tokens, property headers) go through a one-window
//! cache; bulk reads (hashing, loading) bypass it and are split into
//! liveness-sized chunks by the caller.

use alloc::vec;
use alloc::vec::Vec;
use stageboot_api::{IoError, Liveness, MediaAccess};

/// Size of the small-read cache window
pub const WINDOW_SIZE: usize = 512;

pub struct MediaReader<'a, M: MediaAccess> {
    media: &'a mut M,
    handle: &'a mut M::Handle,
    base: u64,
    len: u64,
    window: [u8; WINDOW_SIZE],
    window_start: u64,
    window_len: usize,
}

impl<'a, M: MediaAccess> MediaReader<'a, M> {
    /// Reader over the bytes of `handle` starting at `base`.
    pub fn new(media: &'a mut M, handle: &'a mut M::Handle, base: u64) -> Self {
        let len = media.size(handle).saturating_sub(base);
        Self {
            media,
            handle,
            base,
            len,
            window: [0; WINDOW_SIZE],
            window_start: 0,
            window_len: 0,
        }
    }

    /// Bytes available from the image offset to the end of the medium.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<(), IoError> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(IoError::OutOfRange),
        }
    }

    /// Fill `buf` from `offset`, looping over short driver reads.
    ///
    /// A driver that makes no progress is reported as a read failure
    /// instead of being retried forever.
    pub fn read_exact(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), IoError> {
        self.check_range(offset, buf.len())?;
        let mut done = 0usize;
        while done < buf.len() {
            let pos = self.base + offset + done as u64;
            let n = self.media.read(self.handle, pos, &mut buf[done..])?;
            if n == 0 {
                return Err(IoError::ReadFailed);
            }
            done += n.min(buf.len() - done);
        }
        Ok(())
    }

    /// Read through the window cache. Meant for reads well below
    /// [`WINDOW_SIZE`]; larger ones go straight to the driver.
    pub fn read_cached(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), IoError> {
        self.check_range(offset, buf.len())?;
        if buf.len() > WINDOW_SIZE / 2 {
            return self.read_exact(offset, buf);
        }

        let end = offset + buf.len() as u64;
        let cached_end = self.window_start + self.window_len as u64;
        if offset < self.window_start || end > cached_end {
            let fill = (self.len - offset).min(WINDOW_SIZE as u64) as usize;
            let mut window = [0u8; WINDOW_SIZE];
            self.read_exact(offset, &mut window[..fill])?;
            self.window = window;
            self.window_start = offset;
            self.window_len = fill;
        }

        let start = (offset - self.window_start) as usize;
        buf.copy_from_slice(&self.window[start..start + buf.len()]);
        Ok(())
    }

    /// Read `len` bytes into a new buffer.
    pub fn read_vec(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, IoError> {
        self.check_range(offset, len)?;
        let mut buf = vec![0u8; len];
        self.read_exact(offset, &mut buf)?;
        Ok(buf)
    }

    /// Fill `dst` from `offset` in `chunk`-byte pieces, kicking the
    /// watchdog after each piece.
    pub fn read_chunked(
        &mut self,
        offset: u64,
        dst: &mut [u8],
        chunk: usize,
        liveness: &mut dyn Liveness,
    ) -> Result<(), IoError> {
        self.check_range(offset, dst.len())?;
        let chunk = chunk.max(1);
        for (i, piece) in dst.chunks_mut(chunk).enumerate() {
            self.read_exact(offset + (i * chunk) as u64, piece)?;
            liveness.kick();
            #[cfg(feature = "verbose_logging")]
            log::trace!("read {:#x}+{:#x}", offset + (i * chunk) as u64, piece.len());
        }
        Ok(())
    }

    /// Stream `len` bytes from `offset` into `sink` through a bounce buffer
    /// of `chunk` bytes, kicking the watchdog after each piece.
    pub fn stream<F>(
        &mut self,
        offset: u64,
        len: u64,
        chunk: usize,
        liveness: &mut dyn Liveness,
        mut sink: F,
    ) -> Result<(), IoError>
    where
        F: FnMut(&[u8]),
    {
        let total = usize::try_from(len).map_err(|_| IoError::OutOfRange)?;
        self.check_range(offset, total)?;
        let chunk = chunk.max(1).min(total.max(1));
        let mut buf = vec![0u8; chunk];
        let mut done = 0u64;
        while done < len {
            let n = (len - done).min(chunk as u64) as usize;
            self.read_exact(offset + done, &mut buf[..n])?;
            sink(&buf[..n]);
            liveness.kick();
            done += n as u64;
            #[cfg(feature = "verbose_logging")]
            log::trace!("streamed {:#x}/{:#x}", done, len);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stageboot_api::{BootDeviceCandidate, NoWatchdog};

    /// Media returning at most `max_read` bytes per call
    struct SlowMedia {
        data: Vec<u8>,
        max_read: usize,
        reads: usize,
    }

    impl MediaAccess for SlowMedia {
        type Handle = ();

        fn open(&mut self, _candidate: &BootDeviceCandidate) -> Result<(), IoError> {
            Ok(())
        }

        fn read(&mut self, _h: &mut (), offset: u64, buf: &mut [u8]) -> Result<usize, IoError> {
            self.reads += 1;
            let start = offset as usize;
            if start >= self.data.len() {
                return Ok(0);
            }
            let n = buf.len().min(self.max_read).min(self.data.len() - start);
            buf[..n].copy_from_slice(&self.data[start..start + n]);
            Ok(n)
        }

        fn size(&self, _h: &()) -> u64 {
            self.data.len() as u64
        }

        fn close(&mut self, _h: ()) {}
    }

    fn media(len: usize, max_read: usize) -> SlowMedia {
        SlowMedia {
            data: (0..len).map(|i| i as u8).collect(),
            max_read,
            reads: 0,
        }
    }

    #[test]
    fn test_read_exact_loops_short_reads() {
        let mut m = media(100, 7);
        let mut h = ();
        let mut reader = MediaReader::new(&mut m, &mut h, 0);
        let mut buf = [0u8; 20];
        reader.read_exact(10, &mut buf).unwrap();
        assert_eq!(buf[0], 10);
        assert_eq!(buf[19], 29);
        drop(reader);
        assert_eq!(m.reads, 3);
    }

    #[test]
    fn test_reads_relative_to_base_and_bounded() {
        let mut m = media(100, 100);
        let mut h = ();
        let mut reader = MediaReader::new(&mut m, &mut h, 40);
        assert_eq!(reader.len(), 60);
        let mut buf = [0u8; 4];
        reader.read_exact(0, &mut buf).unwrap();
        assert_eq!(buf, [40, 41, 42, 43]);
        assert_eq!(reader.read_exact(57, &mut buf), Err(IoError::OutOfRange));
        assert_eq!(reader.read_vec(u64::MAX, 2), Err(IoError::OutOfRange));
    }

    #[test]
    fn test_cached_reads_hit_window() {
        let mut m = media(2048, 2048);
        let mut h = ();
        let mut reader = MediaReader::new(&mut m, &mut h, 0);
        let mut a = [0u8; 8];
        reader.read_cached(100, &mut a).unwrap();
        reader.read_cached(108, &mut a).unwrap();
        reader.read_cached(600, &mut a).unwrap();
        assert_eq!(a[0], (600 % 256) as u8);
        drop(reader);
        assert_eq!(m.reads, 1);
    }

    #[test]
    fn test_cached_read_near_end() {
        let mut m = media(100, 100);
        let mut h = ();
        let mut reader = MediaReader::new(&mut m, &mut h, 0);
        let mut a = [0u8; 4];
        reader.read_cached(96, &mut a).unwrap();
        assert_eq!(a, [96, 97, 98, 99]);
    }

    #[test]
    fn test_stream_chunks() {
        let mut m = media(1000, 1000);
        let mut h = ();
        let mut reader = MediaReader::new(&mut m, &mut h, 0);
        let mut seen = Vec::new();
        let mut pieces = 0;
        reader
            .stream(0, 1000, 300, &mut NoWatchdog, |b| {
                seen.extend_from_slice(b);
                pieces += 1;
            })
            .unwrap();
        assert_eq!(pieces, 4);
        assert_eq!(seen.len(), 1000);
        assert_eq!(seen[999], (999 % 256) as u8);
    }
}
