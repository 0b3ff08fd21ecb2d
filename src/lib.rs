//! pcmlink: multi-client PCM mix/snoop core for Bluetooth audio transports.
//!
//! One [`multi::Multi`] instance sits between a transport PCM (an encoder
//! thread draining a playback link, or a decoder thread feeding a capture
//! link) and any number of local clients connected over byte pipes with
//! per-client control sockets. Playback mixes the clients' streams into one
//! real-time PCM flow; capture fans the transport's stream out to every
//! client.
//!
//! The transport side of the contract lives in [`transport`]; everything
//! else is internal machinery: the fixed-point ring mix buffer in
//! [`audio::mix`], the per-client state machines and the poll-based worker
//! loops in [`multi`].

pub mod audio;
pub mod common;
pub mod configs;
pub mod multi;
pub mod transport;

pub use audio::format::SampleFormat;
pub use audio::mix::MixBuffer;
pub use common::errors::MixerError;
pub use configs::{Config, MultiConfig};
pub use multi::{Multi, MultiState};
pub use transport::{StreamDirection, TransportAudio, TransportLink, TransportSignal};
