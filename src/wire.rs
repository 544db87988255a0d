//! Minimal byte-cursor helpers for reading the kernel's flat dump buffer
//! and, in tests, for building one by hand. The kernel uAPI emits native-
//! endian fixed-size structs; this core runs only on the archectures the
//! host framework targets, so native-endian reads are the right primitive
//! (no on-the-wire byte-order negotiation happens here).

use crate::error::CrError;

pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CrError> {
        if self.remaining() < n {
            return Err(CrError::DecodeMismatch(format!(
                "buffer exhausted: need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8, CrError> {
        Ok(self.take(1)?[0])
    }

    pub fn u32(&mut self) -> Result<u32, CrError> {
        let b = self.take(4)?;
        Ok(u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn i32(&mut self) -> Result<i32, CrError> {
        Ok(self.u32()? as i32)
    }

    pub fn u64(&mut self) -> Result<u64, CrError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_ne_bytes(arr))
    }

    pub fn bytes16(&mut self) -> Result<[u8; 16], CrError> {
        let b = self.take(16)?;
        let mut arr = [0u8; 16];
        arr.copy_from_slice(b);
        Ok(arr)
    }

    pub fn seek_to(&mut self, pos: usize) -> Result<(), CrError> {
        if pos > self.buf.len() {
            return Err(CrError::DecodeMismatch(format!(
                "seek past end: {} > {}",
                pos,
                self.buf.len()
            )));
        }
        self.pos = pos;
        Ok(())
    }
}

/// Growable little helper mirroring [`Cursor`], used by test fixtures to
/// build a raw dump buffer by hand.
#[derive(Default)]
pub struct Builder {
    buf: Vec<u8>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_ne_bytes());
        self
    }

    pub fn i32(&mut self, v: i32) -> &mut Self {
        self.u32(v as u32)
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_ne_bytes());
        self
    }

    pub fn bytes16(&mut self, v: [u8; 16]) -> &mut Self {
        self.buf.extend_from_slice(&v);
        self
    }

    pub fn pad_to(&mut self, len: usize) -> &mut Self {
        while self.buf.len() < len {
            self.buf.push(0);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}
