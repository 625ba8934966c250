//! Real-time audio output engine.
//!
//! One dedicated thread owns the output device. Callers on any thread drive it through an
//! [`Engine`] handle (play, pause, resume, seek, queue-next, reset), the engine pulls 16-bit
//! PCM from one or two [`DecoderSource`]s, writes it to an [`OutputBinding`] in a polling
//! loop, and reports completion, errors, seek completion and buffering through an ordered
//! [`EventReceiver`].
//!
//! A queued next source with the same sample rate is played without a gap: its first
//! buffer is written right behind the last buffer of the current source.

pub mod binding;
pub mod buffer;
pub mod config;
pub mod device;
pub mod effects;
pub mod engine;
pub mod error;
pub mod events;
pub mod output;
mod realtime;
mod request;
pub mod source;
pub mod status;
mod worker;

#[cfg(test)]
mod testing;

pub use binding::{MILLIBEL_MIN, OutputBinding};
pub use buffer::OutputBuffer;
pub use config::EngineConfig;
pub use effects::{Effects, EffectsProcessor, StrengthEffect};
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use events::{EngineEvent, EventReceiver};
pub use output::CpalBinding;
pub use source::{BufferingInfo, DecoderSource, SourceRef};
pub use status::{EngineStatus, StatusSnapshot};
