//! Sub-GHz keyfob RF protocol codecs: edge-stream decoders and encoders for
//! Ford, Kia, Subaru, Suzuki and VW rolling-code remotes.

pub mod attr_store;
pub mod codec;
pub mod edge;
pub mod error;
pub mod keeloq;
pub mod line_coding;
pub mod protocols;
