//! Binary wire format of events stored in the log

use rkyv::rancor;
use rkyv::util::AlignedVec;

use crate::Event;

/// Encode an event into log record bytes
pub fn encode_event(event: &Event) -> Result<Vec<u8>, CodecError> {
    rkyv::to_bytes::<rancor::Error>(event)
        .map(|bytes| bytes.to_vec())
        .map_err(|e| CodecError(e.to_string().into_boxed_str()))
}

/// Decode and validate log record bytes
pub fn decode_event(bytes: &[u8]) -> Result<Event, CodecError> {
    // Records handed out by a log carry no alignment guarantee
    let mut aligned = AlignedVec::<16>::with_capacity(bytes.len());
    aligned.extend_from_slice(bytes);
    rkyv::from_bytes::<Event, rancor::Error>(&aligned)
        .map_err(|e| CodecError(e.to_string().into_boxed_str()))
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("codec error: {0}")]
pub struct CodecError(pub Box<str>);
