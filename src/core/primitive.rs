//! # Primitive Codec
//!
//! Fixed and variable width integers, arbitrary precision integers, floats
//! and length-prefixed spans, written in the legacy msgpack framing
//! (all multi-byte headers big-endian).
//!
//! ## Security
//! Every length read from the wire is validated against the input still
//! available before a buffer of that size is allocated. Streaming sources
//! whose length is unknown are read in bounded steps, so a forged length
//! fails with [`PickleError::EndOfInput`] instead of exhausting memory.

use bytes::{BufMut, BytesMut};
use num_bigint::BigInt;
use std::io::{self, Read};
use std::rc::Rc;

use crate::core::opcode::{self, ExtType};
use crate::error::{constants, PickleError, Result};

/// Step used when pulling payloads from a reader of unknown length.
pub const READ_STEP: usize = 64 * 1024;

fn checked_len(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| PickleError::Pickling(constants::ERR_CONTAINER_TOO_LARGE.into()))
}

/// Write an integer using the narrowest form the legacy writer would pick.
pub fn write_int(buf: &mut BytesMut, v: i64) {
    if (-32..=127).contains(&v) {
        buf.put_u8(v as u8);
    } else if (-128..-32).contains(&v) {
        buf.put_u8(opcode::INT8);
        buf.put_i8(v as i8);
    } else if (128..=255).contains(&v) {
        buf.put_u8(opcode::UINT8);
        buf.put_u8(v as u8);
    } else if (-32768..=0xFFFF).contains(&v) {
        if v < 0x0FFF {
            buf.put_u8(opcode::INT16);
            buf.put_i16(v as i16);
        } else {
            buf.put_u8(opcode::UINT16);
            buf.put_u16(v as u16);
        }
    } else if (-(1i64 << 31)..=0xFFFF_FFFF).contains(&v) {
        if v <= 0x0FFF_FFFF {
            buf.put_u8(opcode::INT32);
            buf.put_i32(v as i32);
        } else {
            buf.put_u8(opcode::UINT32);
            buf.put_u32(v as u32);
        }
    } else if v < 0x0FFF_FFFF_FFFF_FFFF {
        buf.put_u8(opcode::INT64);
        buf.put_i64(v);
    } else {
        buf.put_u8(opcode::UINT64);
        buf.put_u64(v as u64);
    }
}

/// Unsigned 64-bit form, used for integers between `i64::MAX` and `u64::MAX`.
pub fn write_u64(buf: &mut BytesMut, v: u64) {
    buf.put_u8(opcode::UINT64);
    buf.put_u64(v);
}

/// `LONG` extension: little-endian two's complement payload.
pub fn write_bigint(buf: &mut BytesMut, v: &BigInt) -> Result<()> {
    let payload = v.to_signed_bytes_le();
    write_ext_header(buf, ExtType::Long, payload.len())?;
    buf.put_slice(&payload);
    Ok(())
}

pub fn write_float(buf: &mut BytesMut, v: f64) {
    buf.put_u8(opcode::FLOAT64);
    buf.put_f64(v);
}

pub fn write_array_header(buf: &mut BytesMut, len: usize) -> Result<()> {
    let n = checked_len(len)?;
    if n < 16 {
        buf.put_u8(opcode::FIXARRAY | n as u8);
    } else if n < 0xFFFF {
        buf.put_u8(opcode::ARRAY16);
        buf.put_u16(n as u16);
    } else {
        buf.put_u8(opcode::ARRAY32);
        buf.put_u32(n);
    }
    Ok(())
}

pub fn write_map_header(buf: &mut BytesMut, len: usize) -> Result<()> {
    let n = checked_len(len)?;
    if n < 16 {
        buf.put_u8(opcode::FIXMAP | n as u8);
    } else if n < 65536 {
        buf.put_u8(opcode::MAP16);
        buf.put_u16(n as u16);
    } else {
        buf.put_u8(opcode::MAP32);
        buf.put_u32(n);
    }
    Ok(())
}

pub fn write_str_header(buf: &mut BytesMut, len: usize) -> Result<()> {
    let n = checked_len(len)?;
    if n < 32 {
        buf.put_u8(opcode::FIXSTR | n as u8);
    } else if n < 256 {
        buf.put_u8(opcode::STR8);
        buf.put_u8(n as u8);
    } else if n < 65536 {
        buf.put_u8(opcode::STR16);
        buf.put_u16(n as u16);
    } else {
        buf.put_u8(opcode::STR32);
        buf.put_u32(n);
    }
    Ok(())
}

pub fn write_ext_header(buf: &mut BytesMut, ext: ExtType, size: usize) -> Result<()> {
    let n = checked_len(size)?;
    match n {
        1 => buf.put_u8(opcode::FIXEXT1),
        2 => buf.put_u8(opcode::FIXEXT2),
        4 => buf.put_u8(opcode::FIXEXT4),
        8 => buf.put_u8(opcode::FIXEXT8),
        16 => buf.put_u8(opcode::FIXEXT16),
        n if n < 256 => {
            buf.put_u8(opcode::EXT8);
            buf.put_u8(n as u8);
        }
        n if n < 65536 => {
            buf.put_u8(opcode::EXT16);
            buf.put_u16(n as u16);
        }
        n => {
            buf.put_u8(opcode::EXT32);
            buf.put_u32(n);
        }
    }
    buf.put_u8(ext.type_byte());
    Ok(())
}

pub fn write_ref(buf: &mut BytesMut, index: u32) {
    buf.put_u8(opcode::REF);
    buf.put_u32(index);
}

pub fn write_bytes(buf: &mut BytesMut, data: &[u8]) -> Result<()> {
    write_ext_header(buf, ExtType::Bytes, data.len())?;
    buf.put_slice(data);
    Ok(())
}

pub fn write_text(buf: &mut BytesMut, text: &str) -> Result<()> {
    write_str_header(buf, text.len())?;
    buf.put_slice(text.as_bytes());
    Ok(())
}

/// `d4 00 <version>`
pub fn write_version(buf: &mut BytesMut, version: u8) {
    buf.put_u8(opcode::FIXEXT1);
    buf.put_u8(ExtType::Version.type_byte());
    buf.put_u8(version);
}

/// Payload-less instruction (`OBJECT`, `OBJECT_NEW`, `GLOBAL`) in the
/// legacy one-byte fixext form.
pub fn write_tag(buf: &mut BytesMut, ext: ExtType) {
    buf.put_u8(opcode::FIXEXT1);
    buf.put_u8(ext.type_byte());
}

/// `c7 00 09`
pub fn write_end(buf: &mut BytesMut) {
    buf.put_u8(opcode::EXT8);
    buf.put_u8(0);
    buf.put_u8(ExtType::End.type_byte());
}

/// Registered extension code in the smallest fixext that holds it.
pub fn write_extension_code(buf: &mut BytesMut, code: u32) {
    let tag = ExtType::Extension.type_byte();
    if code <= 0xFF {
        buf.put_u8(opcode::FIXEXT1);
        buf.put_u8(tag);
        buf.put_u8(code as u8);
    } else if code <= 0xFFFF {
        buf.put_u8(opcode::FIXEXT2);
        buf.put_u8(tag);
        buf.put_u16(code as u16);
    } else {
        buf.put_u8(opcode::FIXEXT4);
        buf.put_u8(tag);
        buf.put_u32(code);
    }
}

pub fn write_chunked(buf: &mut BytesMut, kind: opcode::ChunkKind) {
    buf.put_u8(opcode::FIXEXT1);
    buf.put_u8(ExtType::Chunked.type_byte());
    buf.put_u8(kind.kind_byte());
}

/// Decode a text payload, rejecting invalid UTF-8.
pub fn decode_text(raw: Vec<u8>) -> Result<Rc<str>> {
    String::from_utf8(raw)
        .map(Rc::from)
        .map_err(|_| PickleError::malformed(constants::ERR_INVALID_UTF8))
}

/// Byte input for the unpack engine.
pub trait Source {
    /// Bytes still available, when the source knows.
    fn remaining(&self) -> Option<usize>;

    /// Bytes consumed so far.
    fn consumed(&self) -> usize;

    fn read_u8(&mut self) -> Result<u8>;

    fn read_exact_into(&mut self, out: &mut [u8]) -> Result<()>;

    /// Read `len` bytes into a fresh buffer, validating before allocating.
    fn read_vec(&mut self, len: usize) -> Result<Vec<u8>>;

    /// Fail with `EndOfInput` if fewer than `len` bytes can possibly follow.
    fn ensure(&self, len: usize) -> Result<()> {
        match self.remaining() {
            Some(remaining) if len > remaining => Err(PickleError::EndOfInput {
                needed: len - remaining,
            }),
            _ => Ok(()),
        }
    }

    fn read_u16(&mut self) -> Result<u16> {
        let mut raw = [0u8; 2];
        self.read_exact_into(&mut raw)?;
        Ok(u16::from_be_bytes(raw))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let mut raw = [0u8; 4];
        self.read_exact_into(&mut raw)?;
        Ok(u32::from_be_bytes(raw))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let mut raw = [0u8; 8];
        self.read_exact_into(&mut raw)?;
        Ok(u64::from_be_bytes(raw))
    }
}

/// Source over an in-memory slice; the remaining length is exact.
#[derive(Debug)]
pub struct SliceSource<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SliceSource<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        self.ensure(len)?;
        let span = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(span)
    }
}

impl Source for SliceSource<'_> {
    fn remaining(&self) -> Option<usize> {
        Some(self.data.len() - self.pos)
    }

    fn consumed(&self) -> usize {
        self.pos
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_exact_into(&mut self, out: &mut [u8]) -> Result<()> {
        out.copy_from_slice(self.take(out.len())?);
        Ok(())
    }

    fn read_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        Ok(self.take(len)?.to_vec())
    }
}

/// Streaming source over any [`Read`].
///
/// Reads only the bytes a value needs, so several values can be loaded one
/// after another from the same reader. Wrap unbuffered readers in a
/// `BufReader`.
#[derive(Debug)]
pub struct ReaderSource<R: Read> {
    reader: R,
    consumed: usize,
}

impl<R: Read> ReaderSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            consumed: 0,
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.reader
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    fn fill(&mut self, out: &mut [u8]) -> Result<()> {
        let wanted = out.len();
        let mut filled = 0;
        while filled < wanted {
            match self.reader.read(&mut out[filled..]) {
                Ok(0) => {
                    self.consumed += filled;
                    return Err(PickleError::EndOfInput {
                        needed: wanted - filled,
                    });
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(PickleError::Io(e)),
            }
        }
        self.consumed += wanted;
        Ok(())
    }
}

impl<R: Read> Source for ReaderSource<R> {
    fn remaining(&self) -> Option<usize> {
        None
    }

    fn consumed(&self) -> usize {
        self.consumed
    }

    fn read_u8(&mut self) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.fill(&mut byte)?;
        Ok(byte[0])
    }

    fn read_exact_into(&mut self, out: &mut [u8]) -> Result<()> {
        self.fill(out)
    }

    fn read_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len.min(READ_STEP));
        while out.len() < len {
            let start = out.len();
            let step = (len - start).min(READ_STEP);
            out.resize(start + step, 0);
            match self.fill(&mut out[start..]) {
                Ok(()) => {}
                Err(PickleError::EndOfInput { needed }) => {
                    return Err(PickleError::EndOfInput {
                        needed: needed + (len - start - step),
                    })
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }
}
