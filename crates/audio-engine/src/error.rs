//! Engine error types.
//!
//! Every failure inside the engine thread is caught there and turned into an
//! [`EngineError`]; callers only ever see it as a request outcome or inside an error event.

use std::sync::Arc;

use thiserror::Error;

/// Cloneable so one failure can be both the caller's reply and the source's error event.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// The request is not valid for the current state or requester.
    #[error("illegal request: {0}")]
    IllegalState(&'static str),

    /// The output binding returned a non-zero status.
    #[error("output device returned {code}")]
    Device { code: u32 },

    /// A device write returned a negative byte count.
    #[error("device write returned -{code}")]
    Io { code: u32 },

    /// The decoder source failed while resetting, seeking or producing output.
    #[error("decoder error: {0:#}")]
    Decoder(Arc<anyhow::Error>),

    /// A source slot still referenced a source whose owner already dropped it.
    #[error("decoder source was dropped while in use")]
    SourceDropped,

    /// The caller stopped waiting for the reply; the engine may still finish the request.
    #[error("timed out waiting for the engine")]
    Timeout,

    /// The engine thread is not running.
    #[error("engine is not running")]
    NotRunning,

    /// The output binding failed to initialize.
    #[error("output device init returned {code}")]
    Init { code: u32 },

    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] Arc<std::io::Error>),
}

impl EngineError {
    /// Backend specific error code, or `0` when the error did not come from the device.
    pub fn code(&self) -> u32 {
        match self {
            EngineError::Device { code } | EngineError::Io { code } | EngineError::Init { code } => {
                *code
            }
            _ => 0,
        }
    }

    /// Whether the failure was the caller's fault rather than a device or decoder fault.
    pub fn is_request_error(&self) -> bool {
        matches!(self, EngineError::IllegalState(_))
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Decoder(Arc::new(err))
    }
}

/// Map a raw binding status to a result. The sign carries no meaning, only the magnitude.
pub(crate) fn check_status(status: i32) -> Result<()> {
    if status == 0 {
        Ok(())
    } else {
        Err(EngineError::Device {
            code: status.unsigned_abs(),
        })
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
