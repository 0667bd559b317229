// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Writing of Annex B NAL units.

use std::io::Write;

use thiserror::Error;

use crate::bitstream_utils::BitWriter;
use crate::bitstream_utils::BitWriterError;

/// Inserts emulation prevention bytes so that `payload` holds no start code.
fn escape(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + payload.len() / 64);
    let mut zeros = 0;

    for &byte in payload {
        if zeros >= 2 && byte <= 0x03 {
            out.push(0x03);
            zeros = 0;
        }

        out.push(byte);
        zeros = if byte == 0x00 { zeros + 1 } else { 0 };
    }

    out
}

#[derive(Error, Debug)]
pub enum NaluWriterError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    BitWriterError(#[from] BitWriterError),
}

pub type NaluWriterResult<T> = std::result::Result<T, NaluWriterError>;

/// Writes NAL units one after the other.
///
/// The payload of a unit is collected until the next header or [`NaluWriter::flush`], then
/// written after its start code and header, with emulation prevention if enabled.
pub struct NaluWriter<W: Write> {
    out: W,
    header: Option<u8>,
    rbsp: BitWriter<Vec<u8>>,
    ep_enabled: bool,
}

impl<W: Write> NaluWriter<W> {
    pub fn new(writer: W, ep_enabled: bool) -> Self {
        Self {
            out: writer,
            header: None,
            rbsp: BitWriter::new(Vec::new()),
            ep_enabled,
        }
    }

    /// Corresponds to `f(n)`.
    pub fn write_f<T: Into<u32>>(&mut self, bits: usize, value: T) -> NaluWriterResult<usize> {
        Ok(self.rbsp.write_f(bits, value)?)
    }

    /// Corresponds to `u(n)`.
    pub fn write_u<T: Into<u32>>(&mut self, bits: usize, value: T) -> NaluWriterResult<usize> {
        self.write_f(bits, value)
    }

    pub fn write_ue<T: Into<u32>>(&mut self, value: T) -> NaluWriterResult<()> {
        Ok(self.rbsp.write_ue(value)?)
    }

    pub fn write_se<T: Into<i32>>(&mut self, value: T) -> NaluWriterResult<()> {
        Ok(self.rbsp.write_se(value)?)
    }

    /// Writes `rbsp_trailing_bits()`.
    pub fn write_trailing_bits(&mut self) -> NaluWriterResult<()> {
        Ok(self.rbsp.write_trailing_bits()?)
    }

    /// Ends the current unit and starts a new one with the given header fields.
    pub fn write_header(&mut self, ref_idc: u8, type_: u8) -> NaluWriterResult<()> {
        self.flush()?;
        self.header = Some((ref_idc & 0b11) << 5 | (type_ & 0b1_1111));
        Ok(())
    }

    /// Whether the next bit starts a byte.
    pub fn aligned(&self) -> bool {
        !self.rbsp.has_data_pending()
    }

    /// Writes the current unit to the output.
    pub fn flush(&mut self) -> NaluWriterResult<()> {
        self.rbsp.flush()?;
        let payload = std::mem::take(self.rbsp.inner_mut());

        if let Some(header) = self.header.take() {
            self.out.write_all(&[0x00, 0x00, 0x00, 0x01, header])?;
        }

        if self.ep_enabled {
            self.out.write_all(&escape(&payload))?;
        } else {
            self.out.write_all(&payload)?;
        }

        self.out.flush()?;
        Ok(())
    }
}

impl<W: Write> Drop for NaluWriter<W> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("Unable to flush NAL unit {e:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream_utils::BitReader;

    #[test]
    fn first_few_ue() {
        fn single_ue(value: u32) -> Vec<u8> {
            let mut buf = Vec::<u8>::new();
            {
                let mut writer = NaluWriter::new(&mut buf, false);
                writer.write_ue(value).unwrap();
                assert!(!writer.aligned());
            }
            buf
        }

        assert_eq!(single_ue(0), vec![0b10000000u8]);
        assert_eq!(single_ue(1), vec![0b01000000u8]);
        assert_eq!(single_ue(2), vec![0b01100000u8]);
        assert_eq!(single_ue(7), vec![0b00010000u8]);
        assert_eq!(single_ue(9), vec![0b00010100u8]);
    }

    #[test]
    fn header_follows_start_code() {
        let mut buf = Vec::<u8>::new();
        {
            let mut writer = NaluWriter::new(&mut buf, true);
            writer.write_header(3, 7).unwrap();
            writer.write_f(8, 0x42u8).unwrap();
            writer.write_header(0, 9).unwrap();
            writer.write_f(3, 0u8).unwrap();
            writer.write_trailing_bits().unwrap();
            assert!(writer.aligned());
        }

        assert_eq!(
            buf,
            vec![0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x00, 0x00, 0x01, 0x09, 0x10]
        );
    }

    #[test]
    fn emulation_prevention() {
        assert_eq!(escape(&[0x00, 0x00, 0x00]), vec![0x00, 0x00, 0x03, 0x00]);
        assert_eq!(escape(&[0x00, 0x00, 0x03]), vec![0x00, 0x00, 0x03, 0x03]);
        assert_eq!(escape(&[0x00, 0x00, 0x04]), vec![0x00, 0x00, 0x04]);
        assert_eq!(
            escape(&[0x00, 0x00, 0x00, 0x00, 0x01]),
            vec![0x00, 0x00, 0x03, 0x00, 0x00, 0x03, 0x01]
        );
        assert_eq!(
            escape(&[0x00, 0x00, 0x00, 0x01]),
            vec![0x00, 0x00, 0x03, 0x00, 0x01]
        );

        let input = [0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x80];
        let mut buf = Vec::<u8>::new();
        {
            let mut writer = NaluWriter::new(&mut buf, true);
            for byte in input {
                writer.write_f(8, byte).unwrap();
            }
        }

        let mut reader = BitReader::new_rbsp(&buf);
        for byte in input {
            assert_eq!(reader.read_u::<u8>(8).unwrap(), byte);
        }
        assert_eq!(reader.num_epb(), 2);
    }
}
