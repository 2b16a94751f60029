//! Error handling surfaces: an in-band `Status` for serialize/deserialize paths, and a
//! `thiserror`-derived `CodecError` for attribute-store faults at the crate boundary.

use thiserror::Error;

/// Mirrors the status codes a codec's serialize/deserialize path can return. Bad timing
/// during `feed` never surfaces one of these; it resets the decoder instead (see the
/// `Decoder` trait docs in [`crate::codec`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    ErrorParserOthers,
    ErrorValueBitCount,
    ErrorValue,
    ParserCrcError,
    DecoderParameter,
}

impl Status {
    pub fn is_ok(self) -> bool {
        matches!(self, Status::Ok)
    }
}

/// Faults raised by the attribute store itself, as opposed to in-band codec `Status`.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("missing required key `{0}`")]
    MissingKey(&'static str),
    #[error("key `{0}` has the wrong bit count: expected {expected}, got {actual}")]
    WrongBitCount { key: &'static str, expected: usize, actual: usize },
    #[error("key `{0}` is not valid hex")]
    InvalidHex(&'static str),
    #[error("unknown protocol `{0}`")]
    UnknownProtocol(String),
}
