//! VW: 80-bit custom Manchester variant with a long sync preamble and a
//! three-pulse start marker ahead of the data field.

use crate::attr_store::{AttributeStore, ProtocolFlags, RadioPreset};
use crate::codec::{DecodedPacket, Decoder, Encoder};
use crate::edge::{near, EdgeEvent, TimingProfile, Yield};
use crate::error::Status;
use crate::line_coding::{ManchesterDecoder, ManchesterEvent};

const TE_SHORT: u32 = 500;
const TE_LONG: u32 = 1000;
const TE_DELTA: u32 = 120;
const TE_MED: u32 = (TE_LONG + TE_SHORT) / 2;
const TE_END: u32 = TE_LONG * 5;
const MIN_COUNT_BIT: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Reset,
    FoundSync,
    FoundStart1,
    FoundStart2,
    FoundStart3,
    FoundData,
}

fn classify(level: bool, duration: u32) -> Option<ManchesterEvent> {
    if duration > TE_END {
        return Some(ManchesterEvent::ShortLow);
    }
    if near(duration, TE_SHORT, TE_DELTA) {
        Some(if level { ManchesterEvent::ShortHigh } else { ManchesterEvent::ShortLow })
    } else if near(duration, TE_LONG, TE_DELTA) {
        Some(if level { ManchesterEvent::LongHigh } else { ManchesterEvent::LongLow })
    } else {
        None
    }
}

fn bit_index(i: usize) -> (bool, usize) {
    if i >= 72 {
        (true, i - 64)
    } else if i >= 8 {
        (false, i - 8)
    } else {
        (true, i)
    }
}

pub struct VwDecoder {
    step: Step,
    sync_count: u16,
    manchester: ManchesterDecoder,
    data: u64,
    data_2: u16,
    bits_collected: usize,
}

impl VwDecoder {
    pub fn new() -> Self {
        Self {
            step: Step::Reset,
            sync_count: 0,
            manchester: ManchesterDecoder::new(),
            data: 0,
            data_2: 0,
            bits_collected: 0,
        }
    }

    fn place_bit(&mut self, bit: bool) {
        let i = MIN_COUNT_BIT - 1 - self.bits_collected;
        let (is_data_2, pos) = bit_index(i);
        if is_data_2 {
            if bit {
                self.data_2 |= 1 << pos;
            } else {
                self.data_2 &= !(1 << pos);
            }
        } else if bit {
            self.data |= 1 << pos;
        } else {
            self.data &= !(1 << pos);
        }
        self.bits_collected += 1;
    }

    fn parse(&self) -> DecodedPacket {
        let vw_type = (self.data_2 >> 8) as u8;
        let check = (self.data_2 & 0xFF) as u8;
        let button = (check >> 4) & 0xF;

        DecodedPacket {
            protocol_name: "VW",
            bit_count: MIN_COUNT_BIT as u16,
            raw_data: self.data,
            raw_data_2: Some(self.data_2),
            button,
            vw_type: Some(vw_type),
            check: Some(check),
            ..Default::default()
        }
    }
}

impl Default for VwDecoder {
    fn default() -> Self {
        Self::new()
    }
}

pub fn button_name(button: u8) -> &'static str {
    match button {
        1 => "UNLOCK",
        2 => "LOCK",
        3 => "Un+Lk",
        4 => "TRUNK",
        5 => "Un+Tr",
        6 => "Lk+Tr",
        7 => "Un+Lk+Tr",
        8 => "PANIC",
        _ => "Unknown",
    }
}

impl Decoder for VwDecoder {
    fn name(&self) -> &'static str {
        "VW"
    }

    fn timing(&self) -> TimingProfile {
        TimingProfile { te_short: TE_SHORT, te_long: TE_LONG, te_delta: TE_DELTA, gap_us: None, sync_us: Some(TE_LONG) }
    }

    fn reset(&mut self) {
        self.step = Step::Reset;
        self.sync_count = 0;
        self.manchester.reset();
        self.data = 0;
        self.data_2 = 0;
        self.bits_collected = 0;
    }

    fn feed(&mut self, level: bool, duration: u32) -> Option<DecodedPacket> {
        match self.step {
            Step::Reset => {
                if near(duration, TE_SHORT, TE_DELTA) {
                    self.step = Step::FoundSync;
                    self.sync_count = 0;
                }
            }

            Step::FoundSync => {
                if near(duration, TE_SHORT, TE_DELTA) {
                    self.sync_count += 1;
                } else if level && near(duration, TE_LONG, TE_DELTA) {
                    self.step = Step::FoundStart1;
                } else {
                    tracing::trace!("VW sync check failed, resetting");
                    self.step = Step::Reset;
                }
            }

            Step::FoundStart1 => {
                if !level && near(duration, TE_SHORT, TE_DELTA) {
                    self.step = Step::FoundStart2;
                } else {
                    tracing::trace!("VW start marker 1 out of envelope, resetting");
                    self.step = Step::Reset;
                }
            }

            Step::FoundStart2 => {
                if level && near(duration, TE_MED, TE_DELTA) {
                    self.step = Step::FoundStart3;
                } else {
                    tracing::trace!("VW start marker 2 out of envelope, resetting");
                    self.step = Step::Reset;
                }
            }

            Step::FoundStart3 => {
                if near(duration, TE_MED, TE_DELTA) {
                } else if level && near(duration, TE_SHORT, TE_DELTA) {
                    self.manchester.reset();
                    self.manchester.advance(ManchesterEvent::Reset);
                    self.data = 0;
                    self.data_2 = 0;
                    self.bits_collected = 0;
                    self.manchester.advance(ManchesterEvent::ShortHigh);
                    self.step = Step::FoundData;
                } else {
                    tracing::trace!("VW start marker 3 out of envelope, resetting");
                    self.step = Step::Reset;
                }
            }

            Step::FoundData => {
                let Some(event) = classify(level, duration) else {
                    tracing::trace!("VW data edge matched neither short nor long envelope, resetting");
                    self.step = Step::Reset;
                    return None;
                };
                if let Some(bit) = self.manchester.advance(event) {
                    self.place_bit(bit);
                    if self.bits_collected == MIN_COUNT_BIT {
                        let packet = self.parse();
                        self.step = Step::Reset;
                        return Some(packet);
                    }
                }
            }
        }
        None
    }

    fn get_hash(&self) -> u8 {
        (self.data as u8) ^ (self.data_2 as u8)
    }

    fn serialize(&self, packet: &DecodedPacket, store: &mut dyn AttributeStore, preset: &RadioPreset) -> Status {
        let mut key = Vec::with_capacity(10);
        key.extend_from_slice(&packet.raw_data_2.unwrap_or(0).to_be_bytes());
        key.extend_from_slice(&packet.raw_data.to_be_bytes());
        store.write_hex("Key", &key);
        store.write_u32("Bit", packet.bit_count as u32);
        store.write_string("Preset", &preset.name);
        store.write_u32("Btn", packet.button as u32);
        store.write_u32("VwType", packet.vw_type.unwrap_or(0) as u32);
        store.write_u32("Check", packet.check.unwrap_or(0) as u32);
        Status::Ok
    }

    fn deserialize(&self, store: &dyn AttributeStore) -> (Status, Option<DecodedPacket>) {
        let Ok(bits) = store.read_u32("Bit") else {
            return (Status::ErrorParserOthers, None);
        };
        if bits as usize != MIN_COUNT_BIT {
            return (Status::ErrorValueBitCount, None);
        }
        let Ok(key) = store.read_hex("Key", 10) else {
            return (Status::ErrorParserOthers, None);
        };
        let data_2 = u16::from_be_bytes([key[0], key[1]]);
        let data = u64::from_be_bytes(key[2..10].try_into().unwrap());
        let decoder = VwDecoder { data, data_2, bits_collected: MIN_COUNT_BIT, ..Self::new() };
        (Status::Ok, Some(decoder.parse()))
    }

    fn format(&self, packet: &DecodedPacket) -> String {
        format!(
            "VW: type={:02X} check={:02X} btn={} ({})",
            packet.vw_type.unwrap_or(0),
            packet.check.unwrap_or(0),
            packet.button,
            button_name(packet.button)
        )
    }
}

pub struct VwEncoder {
    data: u64,
    data_2: u16,
    cursor: usize,
}

const SYNC_PAIRS: usize = 43;
const SYNC_EDGES: usize = SYNC_PAIRS * 2;
const START_EDGES: usize = 1 + 1 + 4;
const DATA_EDGES: usize = MIN_COUNT_BIT * 2;
const TOTAL_EDGES: usize = SYNC_EDGES + START_EDGES + DATA_EDGES;

impl VwEncoder {
    pub fn new() -> Self {
        Self { data: 0, data_2: 0, cursor: 0 }
    }
}

impl Default for VwEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder for VwEncoder {
    fn deserialize(&mut self, store: &dyn AttributeStore) -> Status {
        let button = store.read_u32("Btn").unwrap_or(0) as u8;
        let vw_type = store.read_u32("VwType").unwrap_or(0) as u8;
        let check = store.read_u32("Check").unwrap_or((button << 4) as u32) as u8;
        self.data_2 = ((vw_type as u16) << 8) | check as u16;
        self.data = store.read_u32("Data").unwrap_or(0) as u64;
        self.cursor = 0;
        Status::Ok
    }

    fn stop(&mut self) {
        self.cursor = TOTAL_EDGES;
    }

    fn yield_edge(&mut self) -> Yield {
        if self.cursor >= TOTAL_EDGES {
            return Yield::EndOfStream;
        }
        let i = self.cursor;
        self.cursor += 1;

        if i < SYNC_EDGES {
            return Yield::Edge(EdgeEvent::new(i % 2 == 0, TE_SHORT));
        }
        let s = i - SYNC_EDGES;
        if s == 0 {
            return Yield::Edge(EdgeEvent::new(true, TE_LONG));
        }
        if s == 1 {
            return Yield::Edge(EdgeEvent::new(false, TE_SHORT));
        }
        if s < START_EDGES {
            return Yield::Edge(EdgeEvent::new(s % 2 == 0, TE_MED));
        }

        let d = i - SYNC_EDGES - START_EDGES;
        let bit_pos = d / 2;
        let first_pulse = d % 2 == 0;
        let (is_data_2, pos) = bit_index(bit_pos);
        let bit = if is_data_2 { (self.data_2 >> pos) & 1 != 0 } else { (self.data >> pos) & 1 != 0 };
        let level = if first_pulse { bit } else { !bit };
        Yield::Edge(EdgeEvent::new(level, TE_SHORT))
    }
}

pub fn protocol() -> crate::codec::Protocol {
    crate::codec::Protocol {
        name: "VW",
        flags: ProtocolFlags::BAND_433 | ProtocolFlags::AM | ProtocolFlags::DECODABLE | ProtocolFlags::SAVE | ProtocolFlags::SEND,
        supported_frequencies: &[433_920_000],
        make_decoder: || Box::new(VwDecoder::new()),
        make_encoder: || Box::new(VwEncoder::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn button_naming_matches_original_literals() {
        assert_eq!(button_name(8), "PANIC");
        assert_eq!(button_name(1), "UNLOCK");
        assert_eq!(button_name(0), "Unknown");
    }

    #[test]
    fn panic_check_byte_yields_button_eight() {
        let mut store = crate::attr_store::MapAttributeStore::new();
        store.write_u32("Btn", 8);
        store.write_u32("VwType", 0x01);
        store.write_u32("Check", 0x8F);

        let mut encoder = VwEncoder::new();
        encoder.deserialize(&store);

        let mut decoder = VwDecoder::new();
        let mut last = None;
        loop {
            match encoder.yield_edge() {
                Yield::EndOfStream => break,
                Yield::Edge(e) => {
                    if let Some(p) = decoder.feed(e.level, e.duration_us) {
                        last = Some(p);
                    }
                }
            }
        }
        let packet = last.expect("expected a decode");
        assert_eq!(packet.button, 8);
        assert_eq!(button_name(packet.button), "PANIC");
        assert_eq!(packet.check, Some(0x8F));
    }

    #[test]
    fn reset_with_no_signal_yields_nothing() {
        let mut decoder = VwDecoder::new();
        for _ in 0..10 {
            assert!(decoder.feed(true, 10).is_none());
        }
    }
}
