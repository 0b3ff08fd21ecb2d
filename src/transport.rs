//! Contract between the mixer core and the Bluetooth transport layer.
//!
//! The transport side owns the encoder/decoder threads, codec selection and
//! the PCM lifecycle; the mixer only needs the narrow surface below. The
//! dispatcher talks back to the transport I/O thread through an event
//! counter: any value below
//! [`WAKEUP_SHUTDOWN`](crate::audio::constants::WAKEUP_SHUTDOWN) requests
//! attention, anything at or above it means the hand-off is being torn down.

use crate::audio::format::SampleFormat;

/// Which way audio flows through a PCM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    /// Clients feed the mixer; the transport encoder drains it.
    Playback,
    /// The transport decoder feeds the mixer; clients drain it.
    Capture,
}

impl StreamDirection {
    pub fn is_playback(self) -> bool {
        matches!(self, StreamDirection::Playback)
    }
}

/// Stream geometry fixed by the transport at PCM configuration time.
#[derive(Debug, Clone, Copy)]
pub struct TransportAudio {
    pub format: SampleFormat,
    pub channels: usize,
    pub rate: u32,
}

/// Point-to-point signals from the mixer to the transport I/O thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSignal {
    Open,
    Close,
    Resume,
    Sync,
    Drop,
}

/// The transport-side collaborator of one PCM.
///
/// Implemented by the transport layer; the mixer holds it behind an
/// `Arc<dyn TransportLink>` and calls into it from both the worker thread
/// and the thread invoking [`Multi`](crate::multi::Multi) operations, so
/// implementations must be thread-safe.
pub trait TransportLink: Send + Sync {
    /// Format, channel count and rate of this PCM.
    fn audio(&self) -> TransportAudio;

    /// Fill `scale` with the current per-channel output scaling: soft-volume
    /// factors in `0.0..=1.0`, or plain 0/1 mute flags when soft-volume is
    /// handled in hardware.
    fn mix_scale(&self, scale: &mut [f64]);

    /// Send a point-to-point signal to the transport I/O thread.
    fn signal(&self, signal: TransportSignal);

    /// Drop the transport side of the PCM hand-off.
    fn release(&self);

    /// Re-arm the encoder/decoder after a pause.
    fn resume(&self);

    /// Discard whatever the transport still has queued for this PCM.
    fn drop_pending(&self);

    /// Tear the transport down if its last PCM has no more clients.
    fn stop_if_no_clients(&self);
}
