pub mod constants;
pub mod format;
pub mod mix;

pub use format::SampleFormat;
pub use mix::MixBuffer;
