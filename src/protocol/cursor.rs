//! Bounds-checked cursors over fixed byte buffers
//!
//! Every read and write checks the remaining length first and returns
//! [`OutOfBounds`] instead of panicking, so attacker-controlled input can
//! never take down the process. Multi-byte values are big-endian unless the
//! method name says otherwise.

use crate::error::OutOfBounds;

pub type CursorResult<T> = std::result::Result<T, OutOfBounds>;

/// Read cursor over a borrowed byte slice
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Whether at least `n` more bytes can be read
    pub fn require(&self, n: usize) -> bool {
        self.remaining() >= n
    }

    /// Move the cursor; negative values rewind.
    pub fn skip(&mut self, n: isize) -> CursorResult<()> {
        let target = self.pos as isize + n;
        if target < 0 || target as usize > self.data.len() {
            return Err(OutOfBounds {
                position: self.pos,
                needed: n.unsigned_abs(),
                available: if n < 0 { self.pos } else { self.remaining() },
            });
        }
        self.pos = target as usize;
        Ok(())
    }

    fn take(&mut self, n: usize) -> CursorResult<&'a [u8]> {
        if !self.require(n) {
            return Err(OutOfBounds {
                position: self.pos,
                needed: n,
                available: self.remaining(),
            });
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn take_array<const N: usize>(&mut self) -> CursorResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> CursorResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> CursorResult<u16> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    pub fn read_i16(&mut self) -> CursorResult<i16> {
        Ok(i16::from_be_bytes(self.take_array()?))
    }

    pub fn read_u24(&mut self) -> CursorResult<u32> {
        let b: [u8; 3] = self.take_array()?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }

    pub fn read_u32(&mut self) -> CursorResult<u32> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    /// Little-endian u32, only used by the chunk message stream id
    pub fn read_u32_le(&mut self) -> CursorResult<u32> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn read_u64(&mut self) -> CursorResult<u64> {
        Ok(u64::from_be_bytes(self.take_array()?))
    }

    pub fn read_f64(&mut self) -> CursorResult<f64> {
        Ok(f64::from_be_bytes(self.take_array()?))
    }

    pub fn read_bytes(&mut self, len: usize) -> CursorResult<&'a [u8]> {
        self.take(len)
    }

    /// Raw bytes interpreted lossily as UTF-8
    pub fn read_string(&mut self, len: usize) -> CursorResult<String> {
        Ok(String::from_utf8_lossy(self.take(len)?).into_owned())
    }
}

/// Write cursor over a borrowed, fixed-size byte slice
#[derive(Debug)]
pub struct ByteWriter<'a> {
    data: &'a mut [u8],
    pos: usize,
}

impl<'a> ByteWriter<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn require(&self, n: usize) -> bool {
        self.remaining() >= n
    }

    pub fn skip(&mut self, n: isize) -> CursorResult<()> {
        let target = self.pos as isize + n;
        if target < 0 || target as usize > self.data.len() {
            return Err(OutOfBounds {
                position: self.pos,
                needed: n.unsigned_abs(),
                available: if n < 0 { self.pos } else { self.remaining() },
            });
        }
        self.pos = target as usize;
        Ok(())
    }

    /// Bytes written so far
    pub fn written(&self) -> &[u8] {
        &self.data[..self.pos]
    }

    fn put(&mut self, bytes: &[u8]) -> CursorResult<()> {
        if !self.require(bytes.len()) {
            return Err(OutOfBounds {
                position: self.pos,
                needed: bytes.len(),
                available: self.remaining(),
            });
        }
        self.data[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }

    pub fn write_u8(&mut self, v: u8) -> CursorResult<()> {
        self.put(&[v])
    }

    pub fn write_u16(&mut self, v: u16) -> CursorResult<()> {
        self.put(&v.to_be_bytes())
    }

    pub fn write_i16(&mut self, v: i16) -> CursorResult<()> {
        self.put(&v.to_be_bytes())
    }

    /// Lower 24 bits of `v`
    pub fn write_u24(&mut self, v: u32) -> CursorResult<()> {
        let b = v.to_be_bytes();
        self.put(&b[1..])
    }

    pub fn write_u32(&mut self, v: u32) -> CursorResult<()> {
        self.put(&v.to_be_bytes())
    }

    pub fn write_u32_le(&mut self, v: u32) -> CursorResult<()> {
        self.put(&v.to_le_bytes())
    }

    pub fn write_u64(&mut self, v: u64) -> CursorResult<()> {
        self.put(&v.to_be_bytes())
    }

    pub fn write_f64(&mut self, v: f64) -> CursorResult<()> {
        self.put(&v.to_be_bytes())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> CursorResult<()> {
        self.put(bytes)
    }

    pub fn write_string(&mut self, s: &str) -> CursorResult<()> {
        self.put(s.as_bytes())
    }
}
