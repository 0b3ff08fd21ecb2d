//! Central constants for the mixer core.
//!
//! All magic numbers in `src/audio/**` and `src/multi/**` live here so they
//! can be tuned in one place and remain consistent across modules.

// ── Stream geometry ──────────────────────────────────────────────────────────

/// Highest channel count a transport PCM may carry.
pub const MAX_CHANNELS: usize = 8;

/// Mix buffer capacity in periods.
pub const DEFAULT_BUFFER_PERIODS: usize = 16;

/// Periods that must be queued in the mix before the transport is woken.
/// Legal range is 2..=4; the extra period of head-room on top of this is
/// what a fast client may write before it is back-pressured.
pub const DEFAULT_MIX_THRESHOLD_PERIODS: usize = 3;

/// Periods a playback client must buffer locally before it starts streaming.
pub const DEFAULT_CLIENT_THRESHOLD_PERIODS: usize = 2;

/// The local client buffer holds one period more than the start threshold.
pub const CLIENT_BUFFER_EXTRA_PERIODS: usize = 1;

// ── Clients ──────────────────────────────────────────────────────────────────

/// Default cap on simultaneously connected clients per transport PCM.
/// The accumulator cells are one size class wider than the sample format,
/// which leaves plenty of overflow head-room for full-scale streams well
/// past this count.
pub const DEFAULT_MAX_CLIENTS: usize = 32;

/// Nanoseconds between "client pipe fully drained" and the drain ack,
/// giving the Bluetooth stack time to play out in-flight frames.
pub const DEFAULT_DRAIN_SETTLE_NS: u64 = 300_000_000;

// ── Control protocol ─────────────────────────────────────────────────────────

/// Longest control command accepted on the client control socket.
pub const CONTROL_MSG_MAX: usize = 32;

pub const REPLY_OK: &[u8] = b"OK";
pub const REPLY_INVALID: &[u8] = b"Invalid";

// ── Wake-up protocol ─────────────────────────────────────────────────────────

/// Event counter values at or above this mark mean "shut down"; anything
/// lower is a data/attention nudge. Protocol marker, not a memory sentinel.
pub const WAKEUP_SHUTDOWN: u64 = 0xDEAD0000;
