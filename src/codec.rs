//! Uniform codec contract: every protocol exposes the same `Decoder`/`Encoder` pair, and
//! a `Registry` looks codecs up by name or dispatches a raw edge stream against all of them.

use crate::attr_store::{AttributeStore, ProtocolFlags, RadioPreset};
use crate::edge::{EdgeEvent, TimingProfile, Yield};
use crate::error::Status;
use crate::protocols;

/// A fully decoded frame. Fields that don't apply to a given protocol are left `None`.
#[derive(Debug, Clone, Default)]
pub struct DecodedPacket {
    pub protocol_name: &'static str,
    pub bit_count: u16,
    pub raw_data: u64,
    pub raw_data_2: Option<u16>,
    pub serial: u32,
    pub button: u8,
    pub counter: u32,
    // Ford-V0
    pub key1: Option<u64>,
    pub key2: Option<u16>,
    // Kia V3/V4
    pub encrypted: Option<u32>,
    pub decrypted: Option<u32>,
    pub version: Option<u8>,
    // Suzuki
    pub crc: Option<u8>,
    // VW
    pub vw_type: Option<u8>,
    pub check: Option<u8>,
}

/// Decoder half of the uniform contract. `feed` never surfaces an error: bad timing
/// resets to the Reset phase, and a payload that fails validation is silently dropped.
pub trait Decoder {
    fn name(&self) -> &'static str;
    fn timing(&self) -> TimingProfile;
    fn reset(&mut self);
    fn feed(&mut self, level: bool, duration_us: u32) -> Option<DecodedPacket>;
    fn get_hash(&self) -> u8;
    fn serialize(&self, packet: &DecodedPacket, store: &mut dyn AttributeStore, preset: &RadioPreset) -> Status;
    fn deserialize(&self, store: &dyn AttributeStore) -> (Status, Option<DecodedPacket>);
    fn format(&self, packet: &DecodedPacket) -> String;
}

/// Encoder half of the uniform contract. `yield_edge` is a pure function of the
/// encoder's internal cursor; poll it until it returns `Yield::EndOfStream`.
pub trait Encoder {
    fn deserialize(&mut self, store: &dyn AttributeStore) -> Status;
    fn stop(&mut self);
    fn yield_edge(&mut self) -> Yield;
}

/// Descriptor tying a name, capability flags, and decoder/encoder factories together.
pub struct Protocol {
    pub name: &'static str,
    pub flags: ProtocolFlags,
    pub supported_frequencies: &'static [u32],
    pub make_decoder: fn() -> Box<dyn Decoder>,
    pub make_encoder: fn() -> Box<dyn Encoder>,
}

/// Static table of every built-in codec, looked up by name or tried in sequence
/// against a raw edge stream.
pub struct Registry {
    protocols: Vec<Protocol>,
}

impl Registry {
    pub fn new() -> Self {
        Self { protocols: protocols::all() }
    }

    pub fn get(&self, name: &str) -> Option<&Protocol> {
        self.protocols.iter().find(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn list(&self) -> Vec<&'static str> {
        self.protocols.iter().map(|p| p.name).collect()
    }

    /// Feed every edge event to every frequency-matching decoder, resetting all of them
    /// once any one of them produces a packet. Returns every packet found, in stream order.
    pub fn decode_stream(&self, events: &[EdgeEvent], frequency: u32) -> Vec<(&'static str, DecodedPacket)> {
        let mut decoders: Vec<(&'static str, Box<dyn Decoder>, &'static [u32])> = self
            .protocols
            .iter()
            .map(|p| (p.name, (p.make_decoder)(), p.supported_frequencies))
            .collect();

        let mut out = Vec::new();
        for event in events {
            for (name, decoder, freqs) in decoders.iter_mut() {
                let supported = freqs.iter().any(|&f| {
                    let diff = if f > frequency { f - frequency } else { frequency - f };
                    diff < f / 50
                });
                if !supported {
                    continue;
                }
                if let Some(packet) = decoder.feed(event.level, event.duration_us) {
                    out.push((*name, packet));
                    for (_, d, _) in decoders.iter_mut() {
                        d.reset();
                    }
                    break;
                }
            }
        }
        out
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lists_all_six_protocols() {
        let reg = Registry::new();
        let names = reg.list();
        assert_eq!(names.len(), 6);
        assert!(reg.get("Ford V0").is_some());
        assert!(reg.get("kia v0").is_some());
        assert!(reg.get("nonexistent").is_none());
    }
}
