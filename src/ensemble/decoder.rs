//! Incremental ensemble decoder with resynchronization.
//!
//! The decoder keeps a residual buffer between calls, so an ensemble split
//! across chunks is reassembled. Corrupt spans (bad header, length mismatch,
//! checksum failure, truncated payload) are skipped one byte at a time until
//! the next valid header; the number of bytes skipped is logged once per span
//! and accumulated in [`DecodeStats`]. Only resource failures (opening or
//! reading a file) are reported as errors.
//!
//! # Payload layout
//! ```text
//! serial number      32 bytes ASCII, NUL padded
//! year               u16
//! month day hour minute second hundredths   u8 each
//! beam count         u8
//! reserved           u8
//! bin count          u16
//! pressure           f32 (dbar)
//! ranges             f32 x beams
//! velocities         f32 x bins x beams
//! correlations       f32 x bins x beams
//! ```

use super::checksum::crc16;
use super::{
    DecodedEnsemble, EnsembleRecord, CHECKSUM_LEN, HEADER_LEN, HEADER_MARKER_BYTE,
    HEADER_MARKER_LEN, MAX_PAYLOAD_LEN, SERIAL_NUMBER_LEN,
};
use crate::error::AppResult;
use bytes::{Buf, BytesMut};
use chrono::{NaiveDate, NaiveDateTime};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Fixed part of the payload before the per-beam arrays.
const PAYLOAD_FIXED_LEN: usize = SERIAL_NUMBER_LEN + 8 + 4 + 4;

const READ_CHUNK: usize = 64 * 1024;

/// Counters describing one decode run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeStats {
    /// Ensembles emitted.
    pub ensembles: u64,
    /// Bytes dropped while searching for a valid header.
    pub bytes_discarded: u64,
    /// Contiguous runs of discarded bytes.
    pub corrupt_spans: u64,
}

#[derive(Debug, Error)]
enum PayloadError {
    #[error("payload shorter than fixed fields ({0} bytes)")]
    TooShort(usize),
    #[error("payload length {actual} does not match {beams} beams x {bins} bins (expected {expected})")]
    ShapeMismatch {
        beams: usize,
        bins: usize,
        expected: usize,
        actual: usize,
    },
    #[error("invalid timestamp")]
    Timestamp,
}

/// Core byte-stream decoder.
#[derive(Debug, Default)]
pub struct EnsembleDecoder {
    buf: BytesMut,
    stats: DecodeStats,
    pending_discard: u64,
}

impl EnsembleDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and return every ensemble that is now complete.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<DecodedEnsemble> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(ensemble) = self.next_ensemble() {
            out.push(ensemble);
        }
        out
    }

    /// Signal end of input. Leftover bytes count as discarded.
    pub fn finish(&mut self) -> DecodeStats {
        let leftover = self.buf.len();
        if leftover > 0 {
            debug!(bytes = leftover, "Dropping incomplete trailing ensemble");
            self.discard(leftover);
        }
        self.flush_discard_log();
        self.stats
    }

    /// Counters so far.
    pub fn stats(&self) -> DecodeStats {
        self.stats
    }

    /// Bytes currently held waiting for the rest of an ensemble.
    pub fn residual_len(&self) -> usize {
        self.buf.len()
    }

    fn next_ensemble(&mut self) -> Option<DecodedEnsemble> {
        loop {
            match find_marker(&self.buf) {
                Some(0) => {}
                Some(pos) => self.discard(pos),
                None => {
                    // A marker may straddle the chunk boundary; keep its prefix.
                    let keep = self
                        .buf
                        .iter()
                        .rev()
                        .take(HEADER_MARKER_LEN - 1)
                        .take_while(|b| **b == HEADER_MARKER_BYTE)
                        .count();
                    let excess = self.buf.len() - keep;
                    if excess > 0 {
                        self.discard(excess);
                    }
                    return None;
                }
            }

            if self.buf.len() < HEADER_LEN {
                return None;
            }

            let number = read_u32(&self.buf, HEADER_MARKER_LEN);
            let number_inv = read_u32(&self.buf, HEADER_MARKER_LEN + 4);
            let len = read_u32(&self.buf, HEADER_MARKER_LEN + 8);
            let len_inv = read_u32(&self.buf, HEADER_MARKER_LEN + 12);
            let len = len as usize;
            if number != !number_inv || len as u32 != !len_inv || len > MAX_PAYLOAD_LEN {
                self.discard(1);
                continue;
            }

            let total = HEADER_LEN + len + CHECKSUM_LEN;
            if self.buf.len() < total {
                return None;
            }

            let payload = &self.buf[HEADER_LEN..HEADER_LEN + len];
            let stored = read_u32(&self.buf, HEADER_LEN + len);
            if stored != crc16(payload) as u32 {
                debug!(ensemble = number, "Checksum mismatch");
                self.discard(1);
                continue;
            }

            let record = match parse_payload(number, payload) {
                Ok(record) => record,
                Err(err) => {
                    debug!(ensemble = number, error = %err, "Malformed payload");
                    self.discard(1);
                    continue;
                }
            };

            self.flush_discard_log();
            let raw = self.buf.split_to(total).to_vec();
            self.stats.ensembles += 1;
            return Some(DecodedEnsemble { raw, record });
        }
    }

    fn discard(&mut self, n: usize) {
        self.buf.advance(n);
        self.pending_discard += n as u64;
        self.stats.bytes_discarded += n as u64;
    }

    fn flush_discard_log(&mut self) {
        if self.pending_discard > 0 {
            warn!(
                bytes = self.pending_discard,
                "Resynchronized ensemble stream, discarded {} bytes", self.pending_discard
            );
            self.stats.corrupt_spans += 1;
            self.pending_discard = 0;
        }
    }
}

fn find_marker(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_MARKER_LEN)
        .position(|w| w.iter().all(|b| *b == HEADER_MARKER_BYTE))
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn parse_payload(number: u32, mut payload: &[u8]) -> Result<EnsembleRecord, PayloadError> {
    if payload.len() < PAYLOAD_FIXED_LEN {
        return Err(PayloadError::TooShort(payload.len()));
    }
    let total = payload.len();

    let serial_raw = &payload[..SERIAL_NUMBER_LEN];
    let serial_end = serial_raw
        .iter()
        .position(|b| *b == 0)
        .unwrap_or(SERIAL_NUMBER_LEN);
    let serial_number = String::from_utf8_lossy(&serial_raw[..serial_end])
        .trim()
        .to_string();
    payload.advance(SERIAL_NUMBER_LEN);

    let year = payload.get_u16_le();
    let month = payload.get_u8();
    let day = payload.get_u8();
    let hour = payload.get_u8();
    let minute = payload.get_u8();
    let second = payload.get_u8();
    let hundredths = payload.get_u8();
    let timestamp = make_timestamp(year, month, day, hour, minute, second, hundredths)
        .ok_or(PayloadError::Timestamp)?;

    let beams = payload.get_u8() as usize;
    payload.advance(1);
    let bins = payload.get_u16_le() as usize;
    let pressure = payload.get_f32_le();

    let expected = PAYLOAD_FIXED_LEN + 4 * (beams + 2 * bins * beams);
    if total != expected {
        return Err(PayloadError::ShapeMismatch {
            beams,
            bins,
            expected,
            actual: total,
        });
    }

    let ranges = (0..beams).map(|_| payload.get_f32_le()).collect();
    let mut read_grid = || -> Vec<Vec<f32>> {
        (0..bins)
            .map(|_| (0..beams).map(|_| payload.get_f32_le()).collect())
            .collect()
    };
    let velocities = read_grid();
    let correlations = read_grid();

    Ok(EnsembleRecord {
        ensemble_number: number,
        serial_number,
        timestamp,
        pressure,
        ranges,
        velocities,
        correlations,
    })
}

fn make_timestamp(
    year: u16,
    month: u8,
    day: u8,
    hour: u8,
    minute: u8,
    second: u8,
    hundredths: u8,
) -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)?.and_hms_milli_opt(
        hour as u32,
        minute as u32,
        second as u32,
        hundredths as u32 * 10,
    )
}

/// Callback-driven decoder for live ingestion.
///
/// `on_ensemble` runs for every ensemble as soon as its last byte arrives.
/// `on_complete` runs exactly once, from [`StreamDecoder::complete`], which
/// consumes the decoder.
pub struct StreamDecoder<F, C>
where
    F: FnMut(DecodedEnsemble),
    C: FnOnce(DecodeStats),
{
    inner: EnsembleDecoder,
    on_ensemble: F,
    on_complete: C,
}

impl<F, C> StreamDecoder<F, C>
where
    F: FnMut(DecodedEnsemble),
    C: FnOnce(DecodeStats),
{
    /// Create a stream decoder with its two callbacks.
    pub fn new(on_ensemble: F, on_complete: C) -> Self {
        Self {
            inner: EnsembleDecoder::new(),
            on_ensemble,
            on_complete,
        }
    }

    /// Feed the next chunk of bytes, of any size.
    pub fn feed(&mut self, chunk: &[u8]) {
        for ensemble in self.inner.push(chunk) {
            (self.on_ensemble)(ensemble);
        }
    }

    /// Counters so far.
    pub fn stats(&self) -> DecodeStats {
        self.inner.stats()
    }

    /// No more bytes are coming. Fires `on_complete` and returns the totals.
    pub fn complete(mut self) -> DecodeStats {
        let stats = self.inner.finish();
        (self.on_complete)(stats);
        stats
    }
}

/// Open `path` and decode it lazily.
///
/// Each call opens the file afresh, so the sequence can be restarted by
/// calling this again.
pub fn decode_file(path: impl AsRef<Path>) -> AppResult<EnsembleFileIter> {
    let path = path.as_ref().to_path_buf();
    let file = File::open(&path)?;
    debug!(file = %path.display(), "Decoding ensemble file");
    Ok(EnsembleFileIter {
        path,
        file,
        chunk: vec![0u8; READ_CHUNK],
        decoder: EnsembleDecoder::new(),
        pending: VecDeque::new(),
        done: false,
    })
}

/// Lazy iterator over the ensembles of one file.
pub struct EnsembleFileIter {
    path: PathBuf,
    file: File,
    chunk: Vec<u8>,
    decoder: EnsembleDecoder,
    pending: VecDeque<DecodedEnsemble>,
    done: bool,
}

impl EnsembleFileIter {
    /// Path being decoded.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Counters so far; final once the iterator returns `None`.
    pub fn stats(&self) -> DecodeStats {
        self.decoder.stats()
    }
}

impl Iterator for EnsembleFileIter {
    type Item = AppResult<DecodedEnsemble>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(ensemble) = self.pending.pop_front() {
                return Some(Ok(ensemble));
            }
            if self.done {
                return None;
            }
            match self.file.read(&mut self.chunk) {
                Ok(0) => {
                    self.done = true;
                    let stats = self.decoder.finish();
                    debug!(
                        file = %self.path.display(),
                        ensembles = stats.ensembles,
                        discarded = stats.bytes_discarded,
                        "Decode complete"
                    );
                }
                Ok(n) => {
                    let decoded = self.decoder.push(&self.chunk[..n]);
                    self.pending.extend(decoded);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => {
                    self.done = true;
                    return Some(Err(err.into()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::encode_ensemble;
    use chrono::NaiveDate;

    fn record(number: u32) -> EnsembleRecord {
        EnsembleRecord {
            ensemble_number: number,
            serial_number: "SN-42".into(),
            timestamp: NaiveDate::from_ymd_opt(2023, 11, 2)
                .and_then(|d| d.and_hms_milli_opt(8, 0, number, 500))
                .unwrap(),
            pressure: 5.25,
            ranges: vec![9.0, 9.5, 10.0],
            velocities: vec![vec![0.5, -0.5, 0.25], vec![0.1, 0.2, 0.3]],
            correlations: vec![vec![0.8, 0.7, 0.6], vec![0.5, 0.4, 0.3]],
        }
    }

    #[test]
    fn decodes_back_the_encoded_fields() {
        let mut decoder = EnsembleDecoder::new();
        let out = decoder.push(&encode_ensemble(&record(3)));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].record, record(3));
        assert_eq!(decoder.residual_len(), 0);
    }

    #[test]
    fn reassembles_ensemble_split_byte_by_byte() {
        let bytes = encode_ensemble(&record(1));
        let mut decoder = EnsembleDecoder::new();
        let mut out = Vec::new();
        for b in &bytes {
            out.extend(decoder.push(std::slice::from_ref(b)));
        }
        assert_eq!(out.len(), 1);
        assert_eq!(decoder.finish().bytes_discarded, 0);
    }

    #[test]
    fn leading_garbage_is_counted() {
        let mut bytes = vec![0x11, 0x22, 0x80, 0x33];
        bytes.extend(encode_ensemble(&record(1)));
        let mut decoder = EnsembleDecoder::new();
        assert_eq!(decoder.push(&bytes).len(), 1);
        let stats = decoder.finish();
        assert_eq!(stats.bytes_discarded, 4);
        assert_eq!(stats.corrupt_spans, 1);
    }

    #[test]
    fn bad_length_inverse_is_skipped() {
        let mut bad = encode_ensemble(&record(1));
        bad[28] ^= 0xFF;
        let mut bytes = bad.clone();
        bytes.extend(encode_ensemble(&record(2)));

        let mut decoder = EnsembleDecoder::new();
        let out = decoder.push(&bytes);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].record.ensemble_number, 2);
        assert_eq!(decoder.stats().bytes_discarded, bad.len() as u64);
    }

    #[test]
    fn truncated_tail_is_discarded_on_finish() {
        let bytes = encode_ensemble(&record(1));
        let mut decoder = EnsembleDecoder::new();
        assert!(decoder.push(&bytes[..bytes.len() - 3]).is_empty());
        let stats = decoder.finish();
        assert_eq!(stats.ensembles, 0);
        assert_eq!(stats.bytes_discarded, (bytes.len() - 3) as u64);
    }

    #[test]
    fn invalid_timestamp_is_treated_as_corruption() {
        let mut rec = record(1);
        rec.timestamp = NaiveDate::from_ymd_opt(2023, 1, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .unwrap();
        let mut bytes = encode_ensemble(&rec);
        // month = 13, then fix up the checksum so only the payload is wrong
        let month_at = HEADER_LEN + SERIAL_NUMBER_LEN + 2;
        bytes[month_at] = 13;
        let len = bytes.len() - HEADER_LEN - CHECKSUM_LEN;
        let crc = crc16(&bytes[HEADER_LEN..HEADER_LEN + len]) as u32;
        bytes[HEADER_LEN + len..].copy_from_slice(&crc.to_le_bytes());

        let mut decoder = EnsembleDecoder::new();
        assert!(decoder.push(&bytes).is_empty());
        assert!(decoder.finish().bytes_discarded > 0);
    }
}
