//! Ensemble framing for synthesized data.
//!
//! The instrument produces these bytes itself; the encoder exists so the mock
//! transport and tests can generate realistic files.

use super::checksum::crc16;
use super::{EnsembleRecord, HEADER_MARKER_BYTE, HEADER_MARKER_LEN, SERIAL_NUMBER_LEN};
use bytes::{BufMut, BytesMut};
use chrono::{Datelike, Timelike};

/// Frame `record` as a complete ensemble (header, payload, checksum).
pub fn encode_ensemble(record: &EnsembleRecord) -> Vec<u8> {
    let payload = encode_payload(record);
    let len = payload.len() as u32;

    let mut out = BytesMut::with_capacity(super::HEADER_LEN + payload.len() + super::CHECKSUM_LEN);
    out.put_bytes(HEADER_MARKER_BYTE, HEADER_MARKER_LEN);
    out.put_u32_le(record.ensemble_number);
    out.put_u32_le(!record.ensemble_number);
    out.put_u32_le(len);
    out.put_u32_le(!len);
    out.put_slice(&payload);
    out.put_u32_le(crc16(&payload) as u32);
    out.to_vec()
}

fn encode_payload(record: &EnsembleRecord) -> BytesMut {
    let beams = record.beam_count();
    let bins = record.bin_count();
    let mut buf = BytesMut::with_capacity(48 + beams * 4 + bins * beams * 8);

    let mut serial = [0u8; SERIAL_NUMBER_LEN];
    let src = record.serial_number.as_bytes();
    let n = src.len().min(SERIAL_NUMBER_LEN);
    serial[..n].copy_from_slice(&src[..n]);
    buf.put_slice(&serial);

    let ts = record.timestamp;
    buf.put_u16_le(ts.year() as u16);
    buf.put_u8(ts.month() as u8);
    buf.put_u8(ts.day() as u8);
    buf.put_u8(ts.hour() as u8);
    buf.put_u8(ts.minute() as u8);
    buf.put_u8(ts.second() as u8);
    buf.put_u8((ts.nanosecond() / 10_000_000).min(99) as u8);

    buf.put_u8(beams as u8);
    buf.put_u8(0);
    buf.put_u16_le(bins as u16);
    buf.put_f32_le(record.pressure);

    for range in &record.ranges {
        buf.put_f32_le(*range);
    }
    for bin in 0..bins {
        for beam in 0..beams {
            buf.put_f32_le(cell(&record.velocities, bin, beam));
        }
    }
    for bin in 0..bins {
        for beam in 0..beams {
            buf.put_f32_le(cell(&record.correlations, bin, beam));
        }
    }
    buf
}

fn cell(grid: &[Vec<f32>], bin: usize, beam: usize) -> f32 {
    grid.get(bin)
        .and_then(|row| row.get(beam))
        .copied()
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::{CHECKSUM_LEN, HEADER_LEN};
    use chrono::NaiveDate;

    fn record() -> EnsembleRecord {
        EnsembleRecord {
            ensemble_number: 7,
            serial_number: "01300000000000000000000000000001".into(),
            timestamp: NaiveDate::from_ymd_opt(2024, 5, 1)
                .and_then(|d| d.and_hms_milli_opt(12, 30, 15, 250))
                .unwrap(),
            pressure: 10.5,
            ranges: vec![12.0, 12.1, 12.2, 12.3],
            velocities: vec![vec![0.1, 0.2, 0.3, 0.4]; 3],
            correlations: vec![vec![0.9; 4]; 3],
        }
    }

    #[test]
    fn frame_carries_length_and_inverses() {
        let bytes = encode_ensemble(&record());
        assert!(bytes[..HEADER_MARKER_LEN].iter().all(|b| *b == HEADER_MARKER_BYTE));

        let word = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        assert_eq!(word(16), 7);
        assert_eq!(word(20), !7u32);
        let len = word(24) as usize;
        assert_eq!(word(28), !(len as u32));
        assert_eq!(bytes.len(), HEADER_LEN + len + CHECKSUM_LEN);
    }

    #[test]
    fn long_serial_numbers_are_truncated() {
        let mut rec = record();
        rec.serial_number = "X".repeat(40);
        let bytes = encode_ensemble(&rec);
        let serial = &bytes[HEADER_LEN..HEADER_LEN + SERIAL_NUMBER_LEN];
        assert!(serial.iter().all(|b| *b == b'X'));
    }
}
