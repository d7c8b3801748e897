//! Stage loader
//!
//! Copies every placement of a validated [`LoadPlan`] from the medium to its
//! destination, decompressing where the payload says so. The plan has
//! already been checked for overlap and self-overwrite; the loader only
//! moves bytes. Any failure aborts the whole plan: a partially loaded image
//! is never reported as loaded.

use alloc::vec;
use stageboot_api::{
    CodecError, Decompressor, IoError, Liveness, MediaAccess, MemoryRange, TargetMemory,
};

use super::load_plan::{LoadPlan, Placement};
use crate::error::LoadError;
use crate::firmware::MediaReader;

/// Copies plans into target memory
pub struct StageLoader<'a> {
    memory: &'a mut dyn TargetMemory,
    codec: &'a mut dyn Decompressor,
    liveness: &'a mut dyn Liveness,
    chunk: usize,
}

impl<'a> StageLoader<'a> {
    pub fn new(
        memory: &'a mut dyn TargetMemory,
        codec: &'a mut dyn Decompressor,
        liveness: &'a mut dyn Liveness,
        chunk: usize,
    ) -> Self {
        Self {
            memory,
            codec,
            liveness,
            chunk,
        }
    }

    /// Load every placement of `plan` from `reader`.
    pub fn apply<M: MediaAccess>(
        &mut self,
        plan: &LoadPlan,
        reader: &mut MediaReader<'_, M>,
    ) -> Result<(), LoadError> {
        for placement in &plan.placements {
            self.load_one(placement, reader).map_err(|e| {
                log::warn!("load {} aborted: {}", placement, e);
                e
            })?;
        }
        log::info!(
            "{}: loaded {} payload(s), entry {:#x}",
            plan.candidate,
            plan.placements.len(),
            plan.entry_point
        );
        Ok(())
    }

    fn load_one<M: MediaAccess>(
        &mut self,
        placement: &Placement,
        reader: &mut MediaReader<'_, M>,
    ) -> Result<(), LoadError> {
        let payload = &placement.payload;
        if payload.length == 0 {
            return Ok(());
        }
        let short = |e: IoError| match e {
            IoError::OutOfRange => LoadError::ShortRead {
                offset: payload.offset,
            },
            other => LoadError::Io(other),
        };

        if !payload.compression.is_compressed() {
            let dst = self
                .memory
                .slice_mut(MemoryRange::new(placement.destination.start, payload.length))?;
            return reader
                .read_chunked(payload.offset, dst, self.chunk, &mut *self.liveness)
                .map_err(short);
        }

        let len = usize::try_from(payload.length).map_err(|_| LoadError::Codec(CodecError::OutputTooLarge))?;
        let mut src = vec![0u8; len];
        reader
            .read_chunked(payload.offset, &mut src, self.chunk, &mut *self.liveness)
            .map_err(short)?;
        let dst = self.memory.slice_mut(placement.destination)?;
        let produced = self.codec.decompress(payload.compression, &src, dst)?;
        self.liveness.kick();
        log::debug!(
            "{}: {} {:#x} -> {:#x} bytes",
            payload.label(),
            payload.compression,
            payload.length,
            produced
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot_stage::boot_config::VerificationLevel;
    use crate::kernel_if::descriptor::{PayloadEntry, PayloadRole};
    use crate::protocol::fdt::tests::Bytes;
    use crate::protocol::ImageFormatKind;
    use alloc::vec::Vec;
    use stageboot_api::{BootDeviceCandidate, CompressionKind, MediaKind, MemoryError, NoCodec};

    const BASE: u64 = 0x1000;

    struct Ram(Vec<u8>);

    impl TargetMemory for Ram {
        fn slice(&self, range: MemoryRange) -> Result<&[u8], MemoryError> {
            let start = (range.start - BASE) as usize;
            self.0
                .get(start..start + range.len as usize)
                .ok_or(MemoryError::Unmapped(range))
        }

        fn slice_mut(&mut self, range: MemoryRange) -> Result<&mut [u8], MemoryError> {
            let start = (range.start - BASE) as usize;
            self.0
                .get_mut(start..start + range.len as usize)
                .ok_or(MemoryError::Unmapped(range))
        }
    }

    /// Expands each source byte `b` into two copies
    struct Doubler;

    impl Decompressor for Doubler {
        fn decompress(
            &mut self,
            _kind: CompressionKind,
            src: &[u8],
            dst: &mut [u8],
        ) -> Result<usize, CodecError> {
            if src.len() * 2 > dst.len() {
                return Err(CodecError::OutputTooLarge);
            }
            for (i, b) in src.iter().enumerate() {
                dst[2 * i] = *b;
                dst[2 * i + 1] = *b;
            }
            Ok(src.len() * 2)
        }
    }

    struct Counter(usize);

    impl Liveness for Counter {
        fn kick(&mut self) {
            self.0 += 1;
        }
    }

    fn plan(placements: Vec<Placement>) -> LoadPlan {
        LoadPlan {
            candidate: BootDeviceCandidate::new(MediaKind::SpiFlash, 0),
            format: ImageFormatKind::Legacy,
            placements,
            entry_point: BASE,
            entry_index: 0,
            cmdline: None,
            verification: VerificationLevel::Checksum,
            unverified: false,
        }
    }

    fn placement(offset: u64, length: u64, dest: u64, window: u64) -> Placement {
        Placement {
            payload: PayloadEntry::new(PayloadRole::Kernel, offset, length),
            destination: MemoryRange::new(dest, window),
        }
    }

    fn source() -> Vec<u8> {
        (0..=255u8).cycle().take(1024).collect()
    }

    #[test]
    fn test_copies_and_kicks_per_chunk() {
        let mut media = Bytes(source());
        let mut handle = ();
        let mut reader = MediaReader::new(&mut media, &mut handle, 0);
        let mut ram = Ram(vec![0; 2048]);
        let mut codec = NoCodec;
        let mut counter = Counter(0);
        {
            let mut loader = StageLoader::new(&mut ram, &mut codec, &mut counter, 100);
            loader
                .apply(&plan(vec![placement(24, 500, BASE + 8, 500)]), &mut reader)
                .unwrap();
        }
        assert_eq!(&ram.0[8..508], &source()[24..524]);
        assert_eq!(counter.0, 5);
    }

    #[test]
    fn test_decompresses_into_window() {
        let mut media = Bytes(source());
        let mut handle = ();
        let mut reader = MediaReader::new(&mut media, &mut handle, 0);
        let mut ram = Ram(vec![0; 2048]);
        let mut codec = Doubler;
        let mut counter = Counter(0);
        let mut p = placement(0, 4, BASE, 64);
        p.payload.compression = CompressionKind::Lz4;
        StageLoader::new(&mut ram, &mut codec, &mut counter, 64)
            .apply(&plan(vec![p]), &mut reader)
            .unwrap();
        assert_eq!(&ram.0[..8], &[0, 0, 1, 1, 2, 2, 3, 3]);
    }

    #[test]
    fn test_missing_codec_aborts() {
        let mut media = Bytes(source());
        let mut handle = ();
        let mut reader = MediaReader::new(&mut media, &mut handle, 0);
        let mut ram = Ram(vec![0; 2048]);
        let mut codec = NoCodec;
        let mut counter = Counter(0);
        let mut p = placement(0, 16, BASE, 64);
        p.payload.compression = CompressionKind::Gzip;
        let err = StageLoader::new(&mut ram, &mut codec, &mut counter, 64)
            .apply(&plan(vec![p]), &mut reader)
            .unwrap_err();
        assert_eq!(err, LoadError::Codec(CodecError::Unsupported(CompressionKind::Gzip)));
    }

    #[test]
    fn test_read_past_media_is_short_read() {
        let mut media = Bytes(source());
        let mut handle = ();
        let mut reader = MediaReader::new(&mut media, &mut handle, 0);
        let mut ram = Ram(vec![0; 4096]);
        let mut codec = NoCodec;
        let mut counter = Counter(0);
        let err = StageLoader::new(&mut ram, &mut codec, &mut counter, 64)
            .apply(
                &plan(vec![
                    placement(0, 16, BASE, 16),
                    placement(1000, 100, BASE + 64, 100),
                ]),
                &mut reader,
            )
            .unwrap_err();
        assert_eq!(err, LoadError::ShortRead { offset: 1000 });
    }
}
