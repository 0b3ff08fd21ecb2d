use thiserror::Error;

pub type Result<T> = std::result::Result<T, MixerError>;

/// Error taxonomy of the mixer core.
///
/// Per-client conditions (`PeerClosed`, `Overrun`) stay local: the client is
/// evicted or the frames are dropped, and the rest of the PCM keeps
/// streaming. Only event-loop failures take the whole dispatcher down.
#[derive(Debug, Error)]
pub enum MixerError {
    /// Buffer or accumulator allocation failed. Fatal to the operation,
    /// never to the dispatcher.
    #[error("out of memory")]
    OutOfMemory,

    /// Init-time stream geometry the mixer cannot represent.
    #[error("invalid stream format: {0}")]
    InvalidFormat(String),

    /// The peer hung up its pipe or control socket.
    #[error("peer closed the stream")]
    PeerClosed,

    /// A capture peer is not keeping up; its frames were dropped.
    #[error("client overrun, frames dropped")]
    Overrun,

    /// The per-PCM client limit is reached.
    #[error("client limit reached")]
    TooManyClients,

    /// The stream has not reached its start threshold yet; try again.
    #[error("stream not started")]
    NotReady,

    /// The stream is in a state that cannot serve the request.
    #[error("stream state error")]
    Stream,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
