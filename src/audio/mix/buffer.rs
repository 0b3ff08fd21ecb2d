//! Fixed-point ring mix buffer.
//!
//! Each connected playback client owns a signed cursor into one shared ring
//! of widened accumulator cells. Clients add decoded samples into the cells
//! at their own pace; the transport-facing reader drains at most one period
//! at a time, scaling and saturating back to the wire format and zeroing
//! every delivered cell.
//!
//! A negative cursor means "ahead of the current read position by that many
//! samples" and is how a freshly started client places its first sample a
//! start-threshold's worth of periods in front of the mix head.

use crate::audio::format::{MixSample, S16Codec, S24Codec, S32Codec, SampleFormat, U8Codec};
use crate::common::errors::MixerError;

/// Accumulator storage, one variant per wire format.
enum Cells {
    U8(Box<[i16]>),
    S16(Box<[i32]>),
    S24(Box<[i32]>),
    S32(Box<[i64]>),
}

impl Cells {
    fn alloc(format: SampleFormat, size: usize) -> Result<Self, MixerError> {
        fn zeroed<T: Copy + Default>(size: usize) -> Result<Box<[T]>, MixerError> {
            let mut v = Vec::new();
            v.try_reserve_exact(size).map_err(|_| MixerError::OutOfMemory)?;
            v.resize(size, T::default());
            Ok(v.into_boxed_slice())
        }
        Ok(match format {
            SampleFormat::U8 => Cells::U8(zeroed(size)?),
            SampleFormat::S16Le => Cells::S16(zeroed(size)?),
            SampleFormat::S24Le => Cells::S24(zeroed(size)?),
            SampleFormat::S32Le => Cells::S32(zeroed(size)?),
        })
    }

    fn format(&self) -> SampleFormat {
        match self {
            Cells::U8(_) => SampleFormat::U8,
            Cells::S16(_) => SampleFormat::S16Le,
            Cells::S24(_) => SampleFormat::S24Le,
            Cells::S32(_) => SampleFormat::S32Le,
        }
    }

    fn clear(&mut self) {
        match self {
            Cells::U8(c) => c.fill(0),
            Cells::S16(c) => c.fill(0),
            Cells::S24(c) => c.fill(0),
            Cells::S32(c) => c.fill(0),
        }
    }
}

/// Decode `count` wire samples from `data` and add them into the ring,
/// starting at unwrapped sample position `start`.
fn mix_in<S: MixSample>(cells: &mut [S::Acc], size: usize, start: usize, count: usize, data: &[u8]) {
    for n in 0..count {
        let cell = (start + n) % size;
        cells[cell] += S::decode(&data[n * S::WIRE_SIZE..]);
    }
}

/// Drain `count` samples starting at `start` into `out`, applying the
/// per-channel scale and resetting every delivered cell.
fn drain_out<S: MixSample>(
    cells: &mut [S::Acc],
    size: usize,
    start: usize,
    count: usize,
    channels: usize,
    scale: &[f64],
    out: &mut [u8],
) {
    for n in 0..count {
        let cell = (start + n) % size;
        S::encode(cells[cell], scale[n % channels], &mut out[n * S::WIRE_SIZE..]);
        cells[cell] = S::Acc::default();
    }
}

pub struct MixBuffer {
    channels: usize,
    sample_size: usize,
    frame_size: usize,
    /// Ring capacity in samples, including one slack frame.
    size: usize,
    /// Samples per period.
    period: usize,
    /// Samples that must be queued before the transport should start.
    threshold: usize,
    /// Next sample the reader will deliver.
    mix_offset: usize,
    /// One past the furthest sample written by any client.
    end: usize,
    cells: Cells,
}

impl MixBuffer {
    /// Allocate a mix ring of `buffer_frames` frames with the given period.
    pub fn new(
        format: SampleFormat,
        channels: usize,
        buffer_frames: usize,
        period_frames: usize,
        threshold_periods: usize,
    ) -> Result<Self, MixerError> {
        if !SampleFormat::valid_channels(channels) {
            return Err(MixerError::InvalidFormat(format!("{} channels", channels)));
        }
        if period_frames == 0 || buffer_frames < period_frames {
            return Err(MixerError::InvalidFormat(format!(
                "period {} frames in a {} frame buffer",
                period_frames, buffer_frames
            )));
        }
        // One slack frame keeps a completely full ring distinguishable from
        // an empty one.
        let size = (buffer_frames + 1) * channels;
        Ok(Self {
            channels,
            sample_size: format.sample_size(),
            frame_size: format.frame_size(channels),
            size,
            period: period_frames * channels,
            threshold: threshold_periods * period_frames * channels,
            mix_offset: 0,
            end: 0,
            cells: Cells::alloc(format, size)?,
        })
    }

    pub fn format(&self) -> SampleFormat {
        self.cells.format()
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Samples currently queued between the read cursor and the furthest
    /// written sample.
    pub fn avail(&self) -> usize {
        (self.end + self.size - self.mix_offset) % self.size
    }

    pub fn empty(&self) -> bool {
        self.mix_offset == self.end
    }

    /// Whether enough audio is queued for the transport to start reading.
    pub fn at_threshold(&self) -> bool {
        self.avail() >= self.threshold
    }

    /// Wrap-aware distance from the read cursor to a client cursor: how many
    /// samples of that client's audio are still queued in front of the mix.
    pub fn delay(&self, cursor: isize) -> usize {
        if cursor < 0 {
            cursor.unsigned_abs()
        } else {
            (cursor as usize + self.size - self.mix_offset) % self.size
        }
    }

    /// Reset both cursors and zero the whole accumulator storage.
    pub fn clear(&mut self) {
        self.mix_offset = 0;
        self.end = 0;
        self.cells.clear();
    }

    /// Add client data into the ring at the client's cursor.
    ///
    /// Input is truncated to whole frames and clipped against the hard
    /// back-pressure bound of one period past the start threshold; a client
    /// at the bound gets 0 back and must wait for the reader to advance.
    /// Returns the number of source bytes consumed.
    pub fn add(&mut self, cursor: &mut isize, data: &[u8]) -> usize {
        let mix = self.mix_offset;
        let limit = mix + self.threshold + self.period;

        // Resolve the cursor to an unwrapped position at or after `mix`.
        let start = if *cursor < 0 {
            mix + cursor.unsigned_abs()
        } else {
            let s = *cursor as usize;
            if s < mix { s + self.size } else { s }
        };
        if start >= limit {
            return 0;
        }

        let mut samples = (data.len() / self.frame_size) * self.channels;
        samples = samples.min(limit - start);
        samples -= samples % self.channels;
        if samples == 0 {
            return 0;
        }

        let bytes = samples * self.sample_size;
        match &mut self.cells {
            Cells::U8(c) => mix_in::<U8Codec>(c, self.size, start, samples, &data[..bytes]),
            Cells::S16(c) => mix_in::<S16Codec>(c, self.size, start, samples, &data[..bytes]),
            Cells::S24(c) => mix_in::<S24Codec>(c, self.size, start, samples, &data[..bytes]),
            Cells::S32(c) => mix_in::<S32Codec>(c, self.size, start, samples, &data[..bytes]),
        }

        // Extend `end` if this client now leads every other writer.
        let end = if self.end < mix { self.end + self.size } else { self.end };
        let written = start + samples;
        if written > end {
            self.end = written % self.size;
        }
        *cursor = (written % self.size) as isize;

        bytes
    }

    /// Drain queued samples into `out` with per-channel scaling.
    ///
    /// Delivers whole frames only, at most one period per call, and never
    /// more than is queued. Every delivered accumulator cell is zeroed.
    /// Returns the number of samples written to `out`.
    pub fn read(&mut self, out: &mut [u8], scale: &[f64]) -> usize {
        let mut samples = out.len() / self.sample_size;
        samples -= samples % self.channels;
        samples = samples.min(self.period);
        samples = samples.min(self.avail());
        samples -= samples % self.channels;
        if samples == 0 {
            return 0;
        }

        let bytes = samples * self.sample_size;
        match &mut self.cells {
            Cells::U8(c) => drain_out::<U8Codec>(
                c,
                self.size,
                self.mix_offset,
                samples,
                self.channels,
                scale,
                &mut out[..bytes],
            ),
            Cells::S16(c) => drain_out::<S16Codec>(
                c,
                self.size,
                self.mix_offset,
                samples,
                self.channels,
                scale,
                &mut out[..bytes],
            ),
            Cells::S24(c) => drain_out::<S24Codec>(
                c,
                self.size,
                self.mix_offset,
                samples,
                self.channels,
                scale,
                &mut out[..bytes],
            ),
            Cells::S32(c) => drain_out::<S32Codec>(
                c,
                self.size,
                self.mix_offset,
                samples,
                self.channels,
                scale,
                &mut out[..bytes],
            ),
        }

        self.mix_offset = (self.mix_offset + samples) % self.size;
        samples
    }

    #[cfg(test)]
    pub(crate) fn cells_are_zero(&self) -> bool {
        match &self.cells {
            Cells::U8(c) => c.iter().all(|&v| v == 0),
            Cells::S16(c) => c.iter().all(|&v| v == 0),
            Cells::S24(c) => c.iter().all(|&v| v == 0),
            Cells::S32(c) => c.iter().all(|&v| v == 0),
        }
    }
}
