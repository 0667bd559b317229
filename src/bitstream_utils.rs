// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bit-granular reading and writing of coded bitstreams.

use std::io::Write;

use thiserror::Error;

/// How a sequence of bits returned by [`BitReader`] is turned back into a number.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Interpretation {
    /// Plain binary number.
    Raw,
    /// Suffix of an unsigned Exp-Golomb codeword, `ue(v)`.
    Golomb,
    /// Suffix of a signed Exp-Golomb codeword. The code number `k` maps to
    /// `(-1)^(k + 1) * (k / 2)` with the division rounded down, so odd code numbers are one lower
    /// than `se(v)`. Use [`BitReader::read_se`] for syntax elements.
    SignedGolomb,
}

/// Code number of an Exp-Golomb codeword whose suffix is `bits`.
fn code_num(bits: &[bool]) -> i64 {
    (1i64 << bits.len()) - 1 + lsb_first(bits)
}

fn lsb_first(bits: &[bool]) -> i64 {
    bits.iter()
        .enumerate()
        .fold(0i64, |acc, (i, bit)| acc | (i64::from(*bit) << i))
}

/// Maps a bit sequence read by [`BitReader`] back to an integer.
///
/// `bits[i]` carries the weight `2^i`, i.e. the sequence is stored least significant bit first.
/// For the Golomb interpretations `bits` is the codeword suffix, so its length is also the
/// number of leading zero bits of the codeword.
pub fn convert(bits: &[bool], interpretation: Interpretation) -> i64 {
    match interpretation {
        Interpretation::Raw => lsb_first(bits),
        Interpretation::Golomb => code_num(bits),
        Interpretation::SignedGolomb => {
            let k = code_num(bits);
            if k % 2 == 1 {
                k / 2
            } else {
                -(k / 2)
            }
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReadBitsError {
    #[error("more than 32 ({0}) bits were requested")]
    TooManyBitsRequested(usize),
    #[error("reader ran out of bits")]
    OutOfBits,
    #[error("exp-golomb codeword is longer than 32 bits")]
    InvalidGolomb,
    #[error("failed to convert read input to target type")]
    ConversionFailed,
}

pub type ReadBitsResult<T> = std::result::Result<T, ReadBitsError>;

/// A cursor over a coded buffer with bit granularity.
///
/// The position is a byte offset plus the number of bits already consumed from that byte
/// (most significant bit first). When constructed with [`BitReader::new_rbsp`] the reader drops
/// emulation prevention bytes (`00 00 03`) while reading fields.
#[derive(Clone, Debug)]
pub struct BitReader<'a> {
    data: &'a [u8],
    byte_index: usize,
    shift_in_bits: usize,
    needs_epb: bool,
    num_epb: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            byte_index: 0,
            shift_in_bits: 0,
            needs_epb: false,
            num_epb: 0,
        }
    }

    /// Reader over the payload of a NAL unit, skipping emulation prevention bytes.
    pub fn new_rbsp(data: &'a [u8]) -> Self {
        Self {
            needs_epb: true,
            ..Self::new(data)
        }
    }

    /// Offset of the byte holding the next unread bit.
    pub fn byte_index(&self) -> usize {
        self.byte_index
    }

    /// Number of bits of the current byte that were already consumed, in `0..8`.
    pub fn shift_in_bits(&self) -> usize {
        self.shift_in_bits
    }

    /// Returns the amount of bits left in the buffer.
    pub fn num_bits_left(&self) -> usize {
        (self.data.len().saturating_sub(self.byte_index)) * 8 - self.shift_in_bits
    }

    /// Returns the number of emulation-prevention bytes skipped so far.
    pub fn num_epb(&self) -> usize {
        self.num_epb
    }

    pub fn read_bit(&mut self) -> ReadBitsResult<bool> {
        let byte = *self
            .data
            .get(self.byte_index)
            .ok_or(ReadBitsError::OutOfBits)?;
        let bit = (byte >> (7 - self.shift_in_bits)) & 1;

        self.shift_in_bits += 1;
        if self.shift_in_bits == 8 {
            self.move_to_next_byte();
        }

        Ok(bit == 1)
    }

    /// Reads the next `num_bits` bits (at most 32). The returned sequence follows the layout
    /// expected by [`convert`].
    pub fn read_bits(&mut self, num_bits: usize) -> ReadBitsResult<Vec<bool>> {
        if num_bits > 32 {
            return Err(ReadBitsError::TooManyBitsRequested(num_bits));
        }
        if num_bits > self.num_bits_left() {
            return Err(ReadBitsError::OutOfBits);
        }

        let mut bits = (0..num_bits)
            .map(|_| self.read_bit())
            .collect::<ReadBitsResult<Vec<_>>>()?;
        bits.reverse();

        Ok(bits)
    }

    /// Reads an unsigned `num_bits`-wide field. Corresponds to `u(n)`.
    pub fn read_u32(&mut self, num_bits: usize) -> ReadBitsResult<u32> {
        if num_bits > 32 {
            return Err(ReadBitsError::TooManyBitsRequested(num_bits));
        }

        let mut out = 0u64;
        for _ in 0..num_bits {
            out = (out << 1) | u64::from(self.read_bit()?);
        }

        u32::try_from(out).map_err(|_| ReadBitsError::ConversionFailed)
    }

    pub fn read_u<U: TryFrom<u32>>(&mut self, num_bits: usize) -> ReadBitsResult<U> {
        U::try_from(self.read_u32(num_bits)?).map_err(|_| ReadBitsError::ConversionFailed)
    }

    /// Advances the cursor by `num_bits`. Returns `false`, leaving the cursor untouched, if
    /// fewer bits are left.
    pub fn skip_bits(&mut self, num_bits: usize) -> bool {
        if num_bits > self.num_bits_left() {
            return false;
        }

        if self.needs_epb {
            return (0..num_bits).all(|_| self.read_bit().is_ok());
        }

        let total = self.shift_in_bits + num_bits;
        self.byte_index += total / 8;
        self.shift_in_bits = total % 8;
        true
    }

    /// Reads an Exp-Golomb codeword and returns its suffix: as many bits as there were leading
    /// zeros. Use [`convert`] with [`Interpretation::Golomb`] or
    /// [`Interpretation::SignedGolomb`] to get the value.
    pub fn read_golomb(&mut self) -> ReadBitsResult<Vec<bool>> {
        let mut leading_zeros = 0;

        while !self.read_bit()? {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return Err(ReadBitsError::InvalidGolomb);
            }
        }

        self.read_bits(leading_zeros)
    }

    /// Reads an unsigned Exp-Golomb field. Corresponds to `ue(v)`.
    pub fn read_ue<U: TryFrom<i64>>(&mut self) -> ReadBitsResult<U> {
        let bits = self.read_golomb()?;
        U::try_from(convert(&bits, Interpretation::Golomb))
            .map_err(|_| ReadBitsError::ConversionFailed)
    }

    /// Reads a signed Exp-Golomb field. Corresponds to `se(v)`, H.264 9.1.1.
    pub fn read_se<U: TryFrom<i64>>(&mut self) -> ReadBitsResult<U> {
        let k = code_num(&self.read_golomb()?);
        let value = if k % 2 == 1 { (k + 1) / 2 } else { -(k / 2) };
        U::try_from(value).map_err(|_| ReadBitsError::ConversionFailed)
    }

    /// Moves past the next `00 00 01` start code and returns the `nal_unit_type` of the NAL unit
    /// that follows, consuming its header byte. Returns `None`, with the cursor at the end of the
    /// buffer, if there is no further NAL unit.
    pub fn find_nal_type(&mut self) -> Option<u8> {
        if self.shift_in_bits != 0 {
            self.shift_in_bits = 0;
            self.byte_index += 1;
        }

        let start = self.byte_index.min(self.data.len());
        let found = self.data[start..]
            .windows(3)
            .position(|window| window == [0x00, 0x00, 0x01]);

        match found {
            Some(offset) if start + offset + 3 < self.data.len() => {
                let header = self.data[start + offset + 3];
                self.byte_index = start + offset + 4;
                Some(header & 0x1f)
            }
            _ => {
                self.byte_index = self.data.len();
                None
            }
        }
    }

    fn move_to_next_byte(&mut self) {
        self.shift_in_bits = 0;
        self.byte_index += 1;

        if self.needs_epb
            && self.byte_index >= 2
            && self.data.get(self.byte_index) == Some(&0x03)
            && self.data[self.byte_index - 2] == 0x00
            && self.data[self.byte_index - 1] == 0x00
        {
            self.byte_index += 1;
            self.num_epb += 1;
        }
    }
}

#[derive(Debug, Error)]
pub enum BitWriterError {
    #[error("invalid bit count")]
    InvalidBitCount,
    #[error("value increment caused value overflow")]
    Overflow,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type BitWriterResult<T> = std::result::Result<T, BitWriterError>;

pub struct BitWriter<W: Write> {
    out: W,
    nth_bit: u8,
    curr_byte: u8,
}

impl<W: Write> BitWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            out: writer,
            curr_byte: 0,
            nth_bit: 0,
        }
    }

    /// Writes fixed bit size integer (up to 32 bit). Corresponds to `f(n)` and `u(n)`.
    pub fn write_f<T: Into<u32>>(&mut self, bits: usize, value: T) -> BitWriterResult<usize> {
        let value = value.into();

        if bits > 32 {
            return Err(BitWriterError::InvalidBitCount);
        }

        for bit in (0..bits).rev() {
            self.write_bit((value >> bit) & 1 == 1)?;
        }

        Ok(bits)
    }

    pub fn write_bit(&mut self, bit: bool) -> BitWriterResult<()> {
        self.curr_byte |= (bit as u8) << (7u8 - self.nth_bit);
        self.nth_bit += 1;

        if self.nth_bit == 8 {
            self.out.write_all(&[self.curr_byte])?;
            self.nth_bit = 0;
            self.curr_byte = 0;
        }

        Ok(())
    }

    /// Writes an unsigned Exp-Golomb codeword. Corresponds to `ue(v)`.
    pub fn write_ue<T: Into<u32>>(&mut self, value: T) -> BitWriterResult<()> {
        let value = value
            .into()
            .checked_add(1)
            .ok_or(BitWriterError::Overflow)?;
        let bits = 32 - value.leading_zeros() as usize;

        self.write_f(bits - 1, 0u32)?;
        self.write_f(bits, value)?;

        Ok(())
    }

    /// Writes a signed Exp-Golomb codeword. Corresponds to `se(v)`.
    pub fn write_se<T: Into<i32>>(&mut self, value: T) -> BitWriterResult<()> {
        let value: i32 = value.into();
        let abs_value = value.unsigned_abs();

        if value <= 0 {
            self.write_ue(2 * abs_value)
        } else {
            self.write_ue(2 * abs_value - 1)
        }
    }

    /// Writes the RBSP stop bit followed by zero bits up to the next byte boundary.
    pub fn write_trailing_bits(&mut self) -> BitWriterResult<()> {
        self.write_bit(true)?;
        while self.nth_bit != 0 {
            self.write_bit(false)?;
        }

        Ok(())
    }

    /// Immediately outputs any cached bits to [`std::io::Write`]
    pub fn flush(&mut self) -> BitWriterResult<()> {
        if self.nth_bit != 0 {
            self.out.write_all(&[self.curr_byte])?;
            self.nth_bit = 0;
            self.curr_byte = 0;
        }

        self.out.flush()?;
        Ok(())
    }

    /// Returns `true` if ['Self`] holds data that wasn't written to [`std::io::Write`]
    pub fn has_data_pending(&self) -> bool {
        self.nth_bit != 0
    }

    pub(crate) fn inner_mut(&mut self) -> &mut W {
        &mut self.out
    }
}

impl<W: Write> Drop for BitWriter<W> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("Unable to flush bits {e:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// SPS, PPS, SEI and IDR slice NAL units of a 4:2:0 stream, truncated after the IDR slice
    /// header bytes.
    const HEADERS_AND_IDR: [u8; 36] = [
        0x00, 0x00, 0x00, 0x01, 0x67, 0xf4, 0x00, 0x1f, 0x91, 0x9b, 0x28, 0x0f, 0x80, 0x4c,
        0x00, 0x00, 0x00, 0x01, 0x68, 0xeb, 0xe3, 0xc4, 0x48, 0x00, 0x00, 0x01, 0x06, 0x05,
        0xff, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84, 0x00,
    ];

    fn bits(v: &[u8]) -> Vec<bool> {
        v.iter().map(|b| *b == 1).collect()
    }

    #[test]
    fn convert_raw_is_lsb_first() {
        assert_eq!(convert(&bits(&[1, 1, 1, 0, 0, 0, 0, 0]), Interpretation::Raw), 7);
        assert_eq!(convert(&bits(&[0, 0, 0, 1, 0, 0, 0, 0]), Interpretation::Raw), 8);
        assert_eq!(convert(&bits(&[1, 0, 1, 0, 0, 0, 0, 0]), Interpretation::Raw), 5);
        assert_eq!(convert(&[], Interpretation::Raw), 0);
    }

    #[test]
    fn convert_golomb() {
        // Codeword 0000 1 0101: four leading zeros, suffix 0b1010.
        let suffix = bits(&[0, 1, 0, 1]);
        assert_eq!(convert(&suffix, Interpretation::Golomb), 25);
        assert_eq!(convert(&suffix, Interpretation::SignedGolomb), 12);

        assert_eq!(convert(&[], Interpretation::Golomb), 0);
        assert_eq!(convert(&[], Interpretation::SignedGolomb), 0);
        assert_eq!(convert(&bits(&[0]), Interpretation::SignedGolomb), 0);
        assert_eq!(convert(&bits(&[1]), Interpretation::SignedGolomb), -1);
        assert_eq!(convert(&bits(&[0, 1]), Interpretation::SignedGolomb), -2);
    }

    #[test]
    fn read_se_follows_codeword_mapping() {
        // 0000 1 1010 (codeNum 25), then 010 (codeNum 1) and 011 (codeNum 2).
        let mut reader = BitReader::new(&[0b0000_1101, 0b0010_0110]);
        assert_eq!(reader.read_se::<i32>().unwrap(), 13);
        assert_eq!(reader.read_se::<i32>().unwrap(), 1);
        assert_eq!(reader.read_se::<i32>().unwrap(), -1);
    }

    #[test]
    fn read_bits_advances_cursor() {
        let mut reader = BitReader::new(&HEADERS_AND_IDR);
        assert_eq!(reader.byte_index(), 0);
        assert_eq!(convert(&reader.read_bits(8).unwrap(), Interpretation::Raw), 0);
        assert_eq!(reader.byte_index(), 1);
        assert_eq!(convert(&reader.read_bits(8).unwrap(), Interpretation::Raw), 0);
        assert_eq!(convert(&reader.read_bits(8).unwrap(), Interpretation::Raw), 0);
        assert_eq!(convert(&reader.read_bits(8).unwrap(), Interpretation::Raw), 1);
        assert_eq!(reader.shift_in_bits(), 0);
        assert_eq!(reader.byte_index(), 4);

        // 0x67 = 011 00111
        assert_eq!(convert(&reader.read_bits(3).unwrap(), Interpretation::Raw), 3);
        assert_eq!(reader.byte_index(), 4);
        assert_eq!(reader.shift_in_bits(), 3);
        assert_eq!(convert(&reader.read_bits(5).unwrap(), Interpretation::Raw), 7);
        assert_eq!(reader.byte_index(), 5);

        // 0xf4 0x00
        assert_eq!(convert(&reader.read_bits(16).unwrap(), Interpretation::Raw), 0xf400);

        // 0x1f = 0001 1111: three leading zeros, suffix 0b111.
        let suffix = reader.read_golomb().unwrap();
        assert_eq!(convert(&suffix, Interpretation::Golomb), 14);
        assert_eq!(reader.byte_index(), 7);
        assert_eq!(reader.shift_in_bits(), 7);
        assert_eq!(convert(&reader.read_bits(1).unwrap(), Interpretation::Raw), 1);
        assert_eq!(reader.byte_index(), 8);
        assert_eq!(reader.shift_in_bits(), 0);
    }

    #[test]
    fn read_bits_out_of_range() {
        let mut reader = BitReader::new(&[0xff, 0x00]);
        assert_eq!(reader.read_bits(33), Err(ReadBitsError::TooManyBitsRequested(33)));
        assert_eq!(reader.read_bits(17), Err(ReadBitsError::OutOfBits));
        // Failed reads don't move the cursor.
        assert_eq!(reader.byte_index(), 0);
        assert_eq!(reader.read_u32(16).unwrap(), 0xff00);
        assert_eq!(reader.read_bits(1), Err(ReadBitsError::OutOfBits));
    }

    #[test]
    fn skip_bits() {
        let mut reader = BitReader::new(&HEADERS_AND_IDR);
        assert!(reader.skip_bits(32));
        assert_eq!(reader.byte_index(), 4);
        assert_eq!(reader.shift_in_bits(), 0);
        assert_eq!(convert(&reader.read_bits(8).unwrap(), Interpretation::Raw), 0x67);
        assert_eq!(reader.byte_index(), 5);
        assert!(reader.skip_bits(3));
        assert_eq!(reader.byte_index(), 5);
        assert_eq!(reader.shift_in_bits(), 3);
        // 0xf4 0x00 without the top three bits: 1 0100 0000 0000
        assert_eq!(convert(&reader.read_bits(13).unwrap(), Interpretation::Raw), 0x1400);
        assert_eq!(reader.byte_index(), 7);
        assert_eq!(reader.shift_in_bits(), 0);

        assert!(!reader.skip_bits(HEADERS_AND_IDR.len() * 8));
        assert_eq!(reader.byte_index(), 7);
    }

    #[test]
    fn find_nal_types() {
        let mut reader = BitReader::new(&HEADERS_AND_IDR);
        assert_eq!(reader.find_nal_type(), Some(7));
        // Four bytes of start code plus the NAL header.
        assert_eq!(reader.byte_index(), 5);
        assert_eq!(reader.shift_in_bits(), 0);
        assert_eq!(reader.find_nal_type(), Some(8));
        assert_eq!(reader.find_nal_type(), Some(6));
        assert_eq!(reader.find_nal_type(), Some(5));
        assert_eq!(reader.find_nal_type(), None);
        assert_eq!(reader.byte_index(), HEADERS_AND_IDR.len());
    }

    #[test]
    fn find_nal_type_realigns() {
        let mut reader = BitReader::new(&[0x00, 0x00, 0x01, 0x09, 0xf0, 0x00, 0x00, 0x01, 0x41]);
        assert_eq!(reader.find_nal_type(), Some(9));
        reader.read_bits(2).unwrap();
        assert_eq!(reader.find_nal_type(), Some(1));
    }

    #[test]
    fn rbsp_reader_skips_epb() {
        let mut reader = BitReader::new(&[0x00, 0x00, 0x03, 0x01]);
        assert_eq!(reader.read_u32(8).unwrap(), 0x00);
        assert_eq!(reader.read_u32(8).unwrap(), 0x00);
        assert_eq!(reader.read_u32(8).unwrap(), 0x03);
        assert_eq!(reader.read_u32(8).unwrap(), 0x01);

        let mut reader = BitReader::new_rbsp(&[0x00, 0x00, 0x03, 0x01]);
        assert_eq!(reader.read_u32(8).unwrap(), 0x00);
        assert_eq!(reader.read_u32(8).unwrap(), 0x00);
        assert_eq!(reader.read_u32(8).unwrap(), 0x01);
        assert_eq!(reader.num_epb(), 1);
    }

    #[test]
    fn read_ue_limits() {
        let mut reader = BitReader::new(&[0b0001_1010]);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 12);
        assert_eq!(reader.byte_index(), 0);
        assert_eq!(reader.shift_in_bits(), 7);

        let mut reader = BitReader::new(&[0b1000_0000]);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 0);

        // No prefix stop bit.
        let mut reader = BitReader::new(&[0b0000_0000]);
        reader.read_ue::<u32>().unwrap_err();

        // u32 max value: 31 0-bits, 1 bit marker, 31 bits 1-bits.
        let mut reader = BitReader::new(&[
            0b0000_0000,
            0b0000_0000,
            0b0000_0000,
            0b0000_0001,
            0b1111_1111,
            0b1111_1111,
            0b1111_1111,
            0b1111_1110,
        ]);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 0xffff_fffe);
    }

    #[test]
    fn golomb_round_trip() {
        let values = [0u32, 1, 2, 3, 7, 8, 25, 254, 255, 4096, 65535, 0xfff_ffff];
        let signed = [0i32, 1, -1, 2, -2, 13, -12, 1000, -1000];

        let mut buf = Vec::<u8>::new();
        {
            let mut writer = BitWriter::new(&mut buf);
            for v in values {
                writer.write_ue(v).unwrap();
            }
            for v in signed {
                writer.write_se(v).unwrap();
            }
        }

        let mut reader = BitReader::new(&buf);
        for v in values {
            assert_eq!(reader.read_ue::<u32>().unwrap(), v);
        }
        for v in signed {
            assert_eq!(reader.read_se::<i32>().unwrap(), v);
        }
    }

    #[test]
    fn bitwriter_packs_msb_first() {
        let mut buf = Vec::<u8>::new();
        {
            let mut writer = BitWriter::new(&mut buf);
            writer.write_f(3, 0b100u8).unwrap();
            writer.write_f(3, 0b101u8).unwrap();
            writer.write_f(3, 0b011u8).unwrap();
        }
        assert_eq!(buf, vec![0b10010101u8, 0b10000000u8]);

        let mut buf = Vec::<u8>::new();
        {
            let mut writer = BitWriter::new(&mut buf);
            writer.write_f(2, 0b11u8).unwrap();
            writer.write_trailing_bits().unwrap();
            assert!(!writer.has_data_pending());
        }
        assert_eq!(buf, vec![0b1110_0000]);
    }
}
