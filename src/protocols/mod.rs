//! Protocol decoders and encoders for sub-GHz keyfob systems.
//!
//! Each decoder consumes level/duration edge pairs and optionally supports
//! encoding (replay). Shared pieces live in [`crate::edge`], [`crate::line_coding`]
//! and [`crate::keeloq`].

pub mod ford_v0;
pub mod kia_v0;
pub mod kia_v3_v4;
pub mod subaru;
pub mod suzuki;
pub mod vw;

/// Every built-in codec, in a fixed order.
pub fn all() -> Vec<crate::codec::Protocol> {
    vec![
        ford_v0::protocol(),
        kia_v0::protocol(),
        kia_v3_v4::protocol(),
        subaru::protocol(),
        suzuki::protocol(),
        vw::protocol(),
    ]
}
