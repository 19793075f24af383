//! XMODEM-1K receiver (CRC mode) used for file downloads over serial.
//!
//! Blocks are `[SOH|STX] [n] [255-n] [128|1024 data bytes] [crc hi] [crc lo]`.
//! The receiver starts the transfer by sending `C`, ACKs good blocks, NAKs
//! damaged ones, and stops on `EOT`. The sender pads the last block with
//! `0x1A`; the newest block is held back until the next one arrives so the
//! padding can be stripped from the final block at `EOT`.
//!
//! The size in the directory listing is a rounded megabyte figure and is
//! never used to cut the received data.

use crate::ensemble::checksum::crc16;
use std::io::{self, ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, trace};

const SOH: u8 = 0x01;
const STX: u8 = 0x02;
const EOT: u8 = 0x04;
const ACK: u8 = 0x06;
const NAK: u8 = 0x15;
const CAN: u8 = 0x18;
const CRC_MODE: u8 = b'C';
/// Filler the sender appends to the last block.
pub const PAD: u8 = 0x1A;

/// Consecutive errors tolerated before the transfer is abandoned.
pub const MAX_ERRORS: u32 = 10;

/// Ways an XMODEM receive can end without a file.
#[derive(Debug, Error)]
pub enum XmodemError {
    /// The port or the output failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The sender sent `CAN`.
    #[error("transfer cancelled by sender")]
    RemoteCancelled,
    /// The abort flag was raised.
    #[error("transfer aborted locally")]
    Aborted,
    /// Timeouts or damaged blocks in a row.
    #[error("too many consecutive errors ({0})")]
    TooManyErrors(u32),
    /// A block arrived out of order.
    #[error("block sequence lost (expected {expected}, got {got})")]
    Sequence {
        /// Block number the receiver waited for.
        expected: u8,
        /// Block number that arrived.
        got: u8,
    },
}

fn read_byte<P: Read>(port: &mut P) -> io::Result<Option<u8>> {
    let mut b = [0u8; 1];
    match port.read(&mut b) {
        Ok(0) => Ok(None),
        Ok(_) => Ok(Some(b[0])),
        Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => Ok(None),
        Err(e) => Err(e),
    }
}

fn read_exact_or_timeout<P: Read>(port: &mut P, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match port.read(&mut buf[filled..]) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                return Ok(false)
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

fn send<P: Write>(port: &mut P, byte: u8) -> io::Result<()> {
    port.write_all(&[byte])?;
    port.flush()
}

/// Receive one file from `port` into `out`.
///
/// `on_progress` is called with the running byte count after every accepted
/// block. Returns the number of bytes written, padding excluded.
pub fn receive<P, W, F>(
    port: &mut P,
    out: &mut W,
    abort: &AtomicBool,
    mut on_progress: F,
) -> Result<u64, XmodemError>
where
    P: Read + Write,
    W: Write,
    F: FnMut(u64),
{
    let mut expected: u8 = 1;
    let mut errors = 0u32;
    let mut written = 0u64;
    let mut started = false;
    let mut data = vec![0u8; 1024];
    let mut held: Vec<u8> = Vec::with_capacity(1024);

    send(port, CRC_MODE)?;

    loop {
        if abort.load(Ordering::Acquire) {
            port.write_all(&[CAN, CAN])?;
            port.flush()?;
            return Err(XmodemError::Aborted);
        }

        let Some(lead) = read_byte(port)? else {
            errors += 1;
            if errors > MAX_ERRORS {
                return Err(XmodemError::TooManyErrors(errors));
            }
            send(port, if started { NAK } else { CRC_MODE })?;
            continue;
        };

        let size = match lead {
            SOH => 128,
            STX => 1024,
            EOT => {
                send(port, ACK)?;
                let end = held.iter().rposition(|b| *b != PAD).map_or(0, |i| i + 1);
                out.write_all(&held[..end])?;
                written += end as u64;
                out.flush()?;
                debug!(bytes = written, "XMODEM transfer complete");
                return Ok(written);
            }
            CAN => return Err(XmodemError::RemoteCancelled),
            other => {
                trace!(byte = other, "Ignoring line noise");
                continue;
            }
        };

        let mut head = [0u8; 2];
        let block = &mut data[..size];
        let mut crc = [0u8; 2];
        let complete = read_exact_or_timeout(port, &mut head)?
            && read_exact_or_timeout(port, block)?
            && read_exact_or_timeout(port, &mut crc)?;

        let valid = complete
            && head[0] == !head[1]
            && u16::from_be_bytes(crc) == crc16(block);
        if !valid {
            errors += 1;
            debug!(block = head[0], errors, "Damaged XMODEM block");
            if errors > MAX_ERRORS {
                return Err(XmodemError::TooManyErrors(errors));
            }
            send(port, NAK)?;
            continue;
        }

        started = true;
        if head[0] == expected.wrapping_sub(1) {
            // Our ACK was lost; the sender repeated the previous block.
            send(port, ACK)?;
            continue;
        }
        if head[0] != expected {
            port.write_all(&[CAN, CAN])?;
            port.flush()?;
            return Err(XmodemError::Sequence {
                expected,
                got: head[0],
            });
        }

        out.write_all(&held)?;
        written += held.len() as u64;
        held.clear();
        held.extend_from_slice(block);
        on_progress(written + held.len() as u64);

        errors = 0;
        expected = expected.wrapping_add(1);
        send(port, ACK)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct FakePort {
        input: VecDeque<u8>,
        output: Vec<u8>,
    }

    impl Read for FakePort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.input.is_empty() {
                return Err(io::Error::new(ErrorKind::TimedOut, "no data"));
            }
            let n = buf.len().min(self.input.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.input.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for FakePort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn block(n: u8, payload: &[u8], size: usize) -> Vec<u8> {
        let mut data = payload.to_vec();
        data.resize(size, 0x1A);
        let mut out = vec![if size == 128 { SOH } else { STX }, n, !n];
        let crc = crc16(&data);
        out.extend(&data);
        out.extend(crc.to_be_bytes());
        out
    }

    #[test]
    fn receives_blocks_and_trims_padding() {
        let payload: Vec<u8> = (0..1200u32).map(|i| (i % 251) as u8).collect();
        let mut input = block(1, &payload[..1024], 1024);
        input.extend(block(2, &payload[1024..], 1024));
        input.push(EOT);
        let mut port = FakePort {
            input: input.into(),
            output: Vec::new(),
        };
        let mut out = Vec::new();
        let mut progress = Vec::new();

        let n = receive(&mut port, &mut out, &AtomicBool::new(false), |b| {
            progress.push(b)
        })
        .unwrap();

        assert_eq!(n, 1200);
        assert_eq!(out, payload);
        assert_eq!(progress, vec![1024, 2048]);
        assert_eq!(port.output, vec![CRC_MODE, ACK, ACK, ACK]);
    }

    #[test]
    fn file_size_survives_rounded_listing_size() {
        use crate::transport::parse_directory_listing;

        // 11 bytes lists as 0.000010 MB, which reads back as 10 bytes.
        let listing = parse_directory_listing("B0000011.ENS 2024/03/09 06:00:00 0.000010");
        assert_eq!(listing.entries[0].size, 10);

        let payload: Vec<u8> = (1..=11).collect();
        let mut input = block(1, &payload, 128);
        input.push(EOT);
        let mut port = FakePort {
            input: input.into(),
            output: Vec::new(),
        };
        let mut out = Vec::new();

        let n = receive(&mut port, &mut out, &AtomicBool::new(false), |_| {}).unwrap();
        assert_eq!(n, 11);
        assert_eq!(out, payload);
    }

    #[test]
    fn ensemble_file_keeps_checksum_trailer() {
        use crate::transport::mock::synthesize_ensembles;

        let file = synthesize_ensembles("SN1", 3);
        let mut input = Vec::new();
        for (i, chunk) in file.chunks(1024).enumerate() {
            input.extend(block(i as u8 + 1, chunk, 1024));
        }
        input.push(EOT);
        let mut port = FakePort {
            input: input.into(),
            output: Vec::new(),
        };
        let mut out = Vec::new();

        receive(&mut port, &mut out, &AtomicBool::new(false), |_| {}).unwrap();
        assert_eq!(out, file);
    }

    #[test]
    fn damaged_block_is_nakked_and_resent() {
        let data = [5u8; 128];
        let mut bad = block(1, &data, 128);
        bad[10] ^= 0xFF;
        let mut input = bad;
        input.extend(block(1, &data, 128));
        input.push(EOT);
        let mut port = FakePort {
            input: input.into(),
            output: Vec::new(),
        };
        let mut out = Vec::new();

        let n = receive(&mut port, &mut out, &AtomicBool::new(false), |_| {}).unwrap();
        assert_eq!(n, 128);
        assert_eq!(port.output, vec![CRC_MODE, NAK, ACK, ACK]);
    }

    #[test]
    fn abort_flag_cancels_transfer() {
        let mut port = FakePort {
            input: block(1, &[1; 128], 128).into(),
            output: Vec::new(),
        };
        let err = receive(&mut port, &mut Vec::new(), &AtomicBool::new(true), |_| {})
            .unwrap_err();
        assert!(matches!(err, XmodemError::Aborted));
        assert!(port.output.ends_with(&[CAN, CAN]));
    }

    #[test]
    fn silent_line_gives_up() {
        let mut port = FakePort {
            input: VecDeque::new(),
            output: Vec::new(),
        };
        let err = receive(&mut port, &mut Vec::new(), &AtomicBool::new(false), |_| {})
            .unwrap_err();
        assert!(matches!(err, XmodemError::TooManyErrors(_)));
    }
}
