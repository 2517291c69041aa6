//! Protocol implementations.

pub mod crc;
pub mod frame;

// Re-export common types
pub use frame::{
    COMPLETION_MARKER, CommandCode, CommandFrame, RawFrame, ResponseFrame, ResponseStatus,
    WriteMode, decode_frame, decode_response, encode_frame, stalled_frame_error,
};
