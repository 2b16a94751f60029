//! Subaru: 64-bit PWM protocol whose 16-bit rolling counter is folded into the serial
//! bytes via a counter-dependent rotate-and-XOR scramble rather than stored plainly.

use crate::attr_store::{AttributeStore, ProtocolFlags, RadioPreset};
use crate::codec::{DecodedPacket, Decoder, Encoder};
use crate::edge::{near, EdgeEvent, TimingProfile, Yield};
use crate::error::Status;

const TE_SHORT: u32 = 800;
const TE_LONG: u32 = 1600;
const TE_DELTA: u32 = 250;
const MIN_COUNT_BIT: usize = 64;
const END_THRESHOLD: u32 = 3000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Reset,
    CheckPreamble,
    FoundGap,
    FoundSync,
    SaveDuration,
    CheckDuration,
}

/// `subaru_decode_count`: reconstruct the 16-bit counter from the rotate-and-XOR
/// scramble of the serial bytes stored in `b[4..8]`.
fn decode_count(b: &[u8; 8]) -> u16 {
    let mut lo = 0u8;
    for (bit_pos, cond) in [
        (0x01u8, b[4] & 0x40 == 0),
        (0x02, b[4] & 0x80 == 0),
        (0x04, b[5] & 0x01 == 0),
        (0x08, b[5] & 0x02 == 0),
        (0x10, b[6] & 0x01 == 0),
        (0x20, b[6] & 0x02 == 0),
        (0x40, b[5] & 0x40 == 0),
        (0x80, b[5] & 0x80 == 0),
    ] {
        if cond {
            lo |= bit_pos;
        }
    }

    let mut reg_sh1 = (b[7] << 4) & 0xF0;
    if b[5] & 0x04 != 0 {
        reg_sh1 |= 0x04;
    }
    if b[5] & 0x08 != 0 {
        reg_sh1 |= 0x08;
    }
    if b[6] & 0x80 != 0 {
        reg_sh1 |= 0x02;
    }
    if b[6] & 0x40 != 0 {
        reg_sh1 |= 0x01;
    }
    let reg_sh2 = ((b[6] << 2) & 0xF0) | ((b[7] >> 4) & 0x0F);

    let (mut s0, mut s1, mut s2) = (b[3], b[1], b[2]);
    for _ in 0..(4 + lo as u32) {
        let carry = (s0 >> 7) & 1;
        s0 = (s0 << 1) | ((s1 >> 7) & 1);
        s1 = (s1 << 1) | ((s2 >> 7) & 1);
        s2 = (s2 << 1) | carry;
    }

    let t1 = s1 ^ reg_sh1;
    let t2 = s2 ^ reg_sh2;

    let mut hi = 0u8;
    for (bit_pos, cond) in [
        (0x04u8, t1 & 0x10 == 0),
        (0x08, t1 & 0x20 == 0),
        (0x02, t2 & 0x80 == 0),
        (0x01, t2 & 0x40 == 0),
        (0x40, t1 & 0x01 == 0),
        (0x80, t1 & 0x02 == 0),
        (0x20, t2 & 0x08 == 0),
        (0x10, t2 & 0x04 == 0),
    ] {
        if cond {
            hi |= bit_pos;
        }
    }

    ((hi as u16) << 8) | lo as u16
}

/// `subaru_encode_count`: the algebraic inverse of [`decode_count`], given the target
/// `serial` and `count`. Produces the `b[4..8]` bytes to embed in the 64-bit frame.
fn encode_count(serial: u32, count: u16) -> [u8; 4] {
    let hi = (count >> 8) as u8;
    let lo = count as u8;

    let (mut s0, mut s1, mut s2) = ((serial & 0xFF) as u8, ((serial >> 16) & 0xFF) as u8, ((serial >> 8) & 0xFF) as u8);
    for _ in 0..(4 + lo as u32) {
        let carry = s2 & 1;
        s2 = (s2 >> 1) | ((s1 & 1) << 7);
        s1 = (s1 >> 1) | ((s0 & 1) << 7);
        s0 = (s0 >> 1) | (carry << 7);
    }

    let mut t1 = 0u8;
    let mut t2 = 0u8;
    for (hi_bit, t, t_bit) in [
        (0x04u8, &mut t1, 0x10u8),
        (0x08, &mut t1, 0x20),
        (0x40, &mut t1, 0x01),
        (0x80, &mut t1, 0x02),
    ] {
        if hi & hi_bit == 0 {
            *t |= t_bit;
        }
    }
    for (hi_bit, t_bit) in [(0x02u8, 0x80u8), (0x01, 0x40), (0x20, 0x08), (0x10, 0x04)] {
        if hi & hi_bit == 0 {
            t2 |= t_bit;
        }
    }

    let reg_sh1 = t1 ^ s1;
    let reg_sh2 = t2 ^ s2;

    let mut b4 = 0u8;
    let mut b5 = 0u8;
    let mut b6 = 0u8;
    if lo & 0x01 == 0 {
        b4 |= 0x40;
    }
    if lo & 0x02 == 0 {
        b4 |= 0x80;
    }
    if lo & 0x04 == 0 {
        b5 |= 0x01;
    }
    if lo & 0x08 == 0 {
        b5 |= 0x02;
    }
    if lo & 0x10 == 0 {
        b6 |= 0x01;
    }
    if lo & 0x20 == 0 {
        b6 |= 0x02;
    }
    if lo & 0x40 == 0 {
        b5 |= 0x40;
    }
    if lo & 0x80 == 0 {
        b5 |= 0x80;
    }
    if reg_sh1 & 0x04 != 0 {
        b5 |= 0x04;
    }
    if reg_sh1 & 0x08 != 0 {
        b5 |= 0x08;
    }
    if reg_sh1 & 0x02 != 0 {
        b6 |= 0x80;
    }
    if reg_sh1 & 0x01 != 0 {
        b6 |= 0x40;
    }
    b6 |= (reg_sh2 >> 2) & 0x0F;
    let b7 = ((reg_sh1 >> 4) & 0x0F) | ((reg_sh2 & 0x0F) << 4);

    [b4, b5, b6, b7]
}

pub struct SubaruDecoder {
    step: Step,
    header_count: u16,
    bytes: [u8; 8],
    bit_count: usize,
}

impl SubaruDecoder {
    pub fn new() -> Self {
        Self { step: Step::Reset, header_count: 0, bytes: [0; 8], bit_count: 0 }
    }

    fn add_bit(&mut self, bit: bool) {
        let byte_idx = self.bit_count / 8;
        let bit_idx = 7 - (self.bit_count % 8);
        if byte_idx < self.bytes.len() {
            if bit {
                self.bytes[byte_idx] |= 1 << bit_idx;
            } else {
                self.bytes[byte_idx] &= !(1 << bit_idx);
            }
        }
        self.bit_count += 1;
    }

    fn process(&self) -> Option<DecodedPacket> {
        if self.bit_count < MIN_COUNT_BIT {
            return None;
        }
        let b = self.bytes;
        let serial = ((b[1] as u32) << 16) | ((b[2] as u32) << 8) | b[3] as u32;
        let button = b[0] & 0x0F;
        let counter = decode_count(&b);

        Some(DecodedPacket {
            protocol_name: "Subaru",
            bit_count: MIN_COUNT_BIT as u16,
            raw_data: u64::from_be_bytes(b),
            serial,
            button,
            counter: counter as u32,
            ..Default::default()
        })
    }
}

impl Default for SubaruDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for SubaruDecoder {
    fn name(&self) -> &'static str {
        "Subaru"
    }

    fn timing(&self) -> TimingProfile {
        TimingProfile { te_short: TE_SHORT, te_long: TE_LONG, te_delta: TE_DELTA, gap_us: Some(2750), sync_us: Some(2750) }
    }

    fn reset(&mut self) {
        self.step = Step::Reset;
        self.header_count = 0;
        self.bytes = [0; 8];
        self.bit_count = 0;
    }

    fn feed(&mut self, level: bool, duration: u32) -> Option<DecodedPacket> {
        match self.step {
            Step::Reset => {
                if level && near(duration, TE_LONG, TE_DELTA) {
                    self.step = Step::CheckPreamble;
                    self.header_count = 1;
                }
            }

            Step::CheckPreamble => {
                if near(duration, TE_LONG, TE_DELTA) {
                    self.header_count += 1;
                } else if !level && (2000..=3500).contains(&duration) && self.header_count > 20 {
                    self.step = Step::FoundGap;
                } else {
                    tracing::trace!("Subaru preamble check failed, resetting");
                    self.step = Step::Reset;
                }
            }

            Step::FoundGap => {
                if level && (2000..=3500).contains(&duration) {
                    self.step = Step::FoundSync;
                } else {
                    tracing::trace!("Subaru gap pulse out of envelope, resetting");
                    self.step = Step::Reset;
                }
            }

            Step::FoundSync => {
                if !level && near(duration, TE_LONG, TE_DELTA) {
                    self.bytes = [0; 8];
                    self.bit_count = 0;
                    self.step = Step::SaveDuration;
                } else {
                    tracing::trace!("Subaru sync pulse out of envelope, resetting");
                    self.step = Step::Reset;
                }
            }

            Step::SaveDuration => {
                if !level {
                    self.step = Step::Reset;
                    return None;
                }
                if duration > END_THRESHOLD {
                    let result = self.process();
                    self.step = Step::Reset;
                    return result;
                }
                if near(duration, TE_SHORT, TE_DELTA) {
                    self.add_bit(true);
                    self.step = Step::CheckDuration;
                } else if near(duration, TE_LONG, TE_DELTA) {
                    self.add_bit(false);
                    self.step = Step::CheckDuration;
                } else {
                    tracing::trace!("Subaru data edge matched neither short nor long envelope, resetting");
                    self.step = Step::Reset;
                }
            }

            Step::CheckDuration => {
                if level {
                    self.step = Step::Reset;
                    return None;
                }
                if duration > END_THRESHOLD {
                    let result = self.process();
                    self.step = Step::Reset;
                    return result;
                }
                if near(duration, TE_SHORT, TE_DELTA) || near(duration, TE_LONG, TE_DELTA) {
                    self.step = Step::SaveDuration;
                } else {
                    self.step = Step::Reset;
                }
            }
        }
        None
    }

    fn get_hash(&self) -> u8 {
        self.bytes.iter().fold(0u8, |acc, &b| acc ^ b)
    }

    fn serialize(&self, packet: &DecodedPacket, store: &mut dyn AttributeStore, preset: &RadioPreset) -> Status {
        store.write_hex("Key", &packet.raw_data.to_be_bytes());
        store.write_u32("Bit", packet.bit_count as u32);
        store.write_string("Preset", &preset.name);
        store.write_u32("Serial", packet.serial);
        store.write_u32("Btn", packet.button as u32);
        store.write_u32("Cnt", packet.counter);
        Status::Ok
    }

    fn deserialize(&self, store: &dyn AttributeStore) -> (Status, Option<DecodedPacket>) {
        let Ok(bits) = store.read_u32("Bit") else {
            return (Status::ErrorParserOthers, None);
        };
        if bits as usize != MIN_COUNT_BIT {
            return (Status::ErrorValueBitCount, None);
        }
        let Ok(key) = store.read_hex("Key", 8) else {
            return (Status::ErrorParserOthers, None);
        };
        let mut decoder = SubaruDecoder::new();
        decoder.bytes.copy_from_slice(&key);
        decoder.bit_count = MIN_COUNT_BIT;
        match decoder.process() {
            Some(p) => (Status::Ok, Some(p)),
            None => (Status::ErrorValue, None),
        }
    }

    fn format(&self, packet: &DecodedPacket) -> String {
        format!("Subaru: serial={:06X} btn={:X} cnt={:04X}", packet.serial, packet.button, packet.counter)
    }
}

fn encode_payload(serial: u32, button: u8, counter: u16) -> [u8; 8] {
    let mut b = [0u8; 8];
    b[0] = button & 0x0F;
    b[1] = (serial >> 16) as u8;
    b[2] = (serial >> 8) as u8;
    b[3] = serial as u8;
    let tail = encode_count(serial, counter);
    b[4..8].copy_from_slice(&tail);
    b
}

pub struct SubaruEncoder {
    bytes: [u8; 8],
    cursor: usize,
}

const PREAMBLE_EDGES: usize = 50;
const GAP_SYNC_EDGES: usize = 3;
const DATA_EDGES: usize = MIN_COUNT_BIT * 2;
const TRAILER_EDGES: usize = 1;
const TOTAL_EDGES: usize = PREAMBLE_EDGES + GAP_SYNC_EDGES + DATA_EDGES + TRAILER_EDGES;

impl SubaruEncoder {
    pub fn new() -> Self {
        Self { bytes: [0; 8], cursor: 0 }
    }
}

impl Default for SubaruEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder for SubaruEncoder {
    fn deserialize(&mut self, store: &dyn AttributeStore) -> Status {
        let Ok(serial) = store.read_u32("Serial") else {
            return Status::ErrorParserOthers;
        };
        let button = store.read_u32("Btn").unwrap_or(0) as u8;
        let counter = store.read_u32("Cnt").unwrap_or(0) as u16;
        self.bytes = encode_payload(serial, button, counter);
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

        if i < PREAMBLE_EDGES {
            return Yield::Edge(EdgeEvent::new(i % 2 == 0, TE_LONG));
        }
        let g = i - PREAMBLE_EDGES;
        if g == 0 {
            return Yield::Edge(EdgeEvent::new(false, 2750));
        }
        if g == 1 {
            return Yield::Edge(EdgeEvent::new(true, 2750));
        }
        if g == 2 {
            return Yield::Edge(EdgeEvent::new(false, TE_LONG));
        }

        let d = g - GAP_SYNC_EDGES;
        if d < DATA_EDGES {
            let bit_index = d / 2;
            let pulse_is_first = d % 2 == 0;
            let byte = self.bytes[bit_index / 8];
            let bit = (byte >> (7 - (bit_index % 8))) & 1 != 0;
            return if pulse_is_first {
                Yield::Edge(EdgeEvent::new(true, if bit { TE_SHORT } else { TE_LONG }))
            } else {
                Yield::Edge(EdgeEvent::new(false, TE_SHORT))
            };
        }
        Yield::Edge(EdgeEvent::new(false, 4000))
    }
}

pub fn protocol() -> crate::codec::Protocol {
    crate::codec::Protocol {
        name: "Subaru",
        flags: ProtocolFlags::BAND_433 | ProtocolFlags::AM | ProtocolFlags::DECODABLE | ProtocolFlags::SAVE | ProtocolFlags::SEND,
        supported_frequencies: &[433_920_000],
        make_decoder: || Box::new(SubaruDecoder::new()),
        make_encoder: || Box::new(SubaruEncoder::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_codec_round_trips() {
        for serial in [0u32, 0x123456, 0xABCDEF, 0xFFFFFF] {
            for counter in [0u16, 1, 0x1234, 0xFFFF] {
                let tail = encode_count(serial, counter);
                let mut b = [0u8; 8];
                b[1] = (serial >> 16) as u8;
                b[2] = (serial >> 8) as u8;
                b[3] = serial as u8;
                b[4..8].copy_from_slice(&tail);
                assert_eq!(decode_count(&b), counter, "serial={serial:06X} counter={counter:04X}");
            }
        }
    }

    #[test]
    fn encoder_output_decodes_to_same_counter() {
        let mut encoder = SubaruEncoder::new();
        encoder.bytes = encode_payload(0xA1B2C3, 0x1, 0x0042);

        let mut decoder = SubaruDecoder::new();
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
        assert_eq!(packet.counter, 0x0042);
    }
}
