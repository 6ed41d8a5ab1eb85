//! Audio output: decoding, device playback and the shared sink.

pub mod chime;
pub mod decode;
pub mod output;
pub mod playback;
pub mod silent;
pub mod sink;
pub mod timer;

pub use output::{AudioOutput, Clip, Voice};
pub use playback::CpalOutput;
pub use silent::SilentOutput;
pub use sink::{AudioSink, SinkEvent, SinkSnapshot};
