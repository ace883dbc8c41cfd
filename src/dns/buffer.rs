//! buffers for use when writing and reading dns packets

use derive_more::{Display, Error, From};

#[derive(Debug, Display, From, Error)]
pub enum BufferError {
    Io(std::io::Error),
    EndOfBuffer,
    #[display(fmt = "label exceeds 63 characters")]
    LabelTooLong,
    #[display(fmt = "too many compression jumps")]
    TooManyJumps,
}

type Result<T> = std::result::Result<T, BufferError>;

/// Upper bound on compression pointers followed while reading a single name
const MAX_JUMPS: usize = 5;

pub trait PacketBuffer {
    fn read(&mut self) -> Result<u8>;
    fn get(&mut self, pos: usize) -> Result<u8>;
    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]>;
    fn write(&mut self, val: u8) -> Result<()>;
    fn set(&mut self, pos: usize, val: u8) -> Result<()>;
    fn pos(&self) -> usize;
    fn seek(&mut self, pos: usize) -> Result<()>;
    fn step(&mut self, steps: usize) -> Result<()>;

    fn write_u8(&mut self, val: u8) -> Result<()> {
        self.write(val)?;

        Ok(())
    }

    fn set_u16(&mut self, pos: usize, val: u16) -> Result<()> {
        self.set(pos, (val >> 8) as u8)?;
        self.set(pos + 1, (val & 0xFF) as u8)?;

        Ok(())
    }

    fn write_u16(&mut self, val: u16) -> Result<()> {
        self.write((val >> 8) as u8)?;
        self.write((val & 0xFF) as u8)?;

        Ok(())
    }

    fn write_u32(&mut self, val: u32) -> Result<()> {
        self.write(((val >> 24) & 0xFF) as u8)?;
        self.write(((val >> 16) & 0xFF) as u8)?;
        self.write(((val >> 8) & 0xFF) as u8)?;
        self.write((val & 0xFF) as u8)?;

        Ok(())
    }

    /// Write a domain name as a sequence of length-prefixed labels.
    ///
    /// Names are written without compression. The root name (empty string or
    /// a single dot) is written as a lone zero byte.
    fn write_qname(&mut self, qname: &str) -> Result<()> {
        for label in qname.split('.').filter(|l| !l.is_empty()) {
            let len = label.len();
            if len > 0x3f {
                return Err(BufferError::LabelTooLong);
            }

            self.write_u8(len as u8)?;
            for b in label.as_bytes() {
                self.write_u8(*b)?;
            }
        }

        self.write_u8(0)?;

        Ok(())
    }

    fn read_u16(&mut self) -> Result<u16> {
        let res = ((self.read()? as u16) << 8) | (self.read()? as u16);

        Ok(res)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let res = ((self.read()? as u32) << 24)
            | ((self.read()? as u32) << 16)
            | ((self.read()? as u32) << 8)
            | (self.read()? as u32);

        Ok(res)
    }

    /// Read a domain name, following compression pointers.
    ///
    /// The labels are appended to `outstr` joined by dots. After a jump the
    /// buffer position is restored to just past the first pointer, so the
    /// caller can keep reading the record that contained the name.
    fn read_qname(&mut self, outstr: &mut String) -> Result<()> {
        let mut pos = self.pos();
        let mut jumped = false;
        let mut jumps = 0;

        let mut delim = "";
        loop {
            let len = self.get(pos)?;

            // two high bits set means a pointer to somewhere else in the packet
            if (len & 0xC0) == 0xC0 {
                if jumps >= MAX_JUMPS {
                    return Err(BufferError::TooManyJumps);
                }

                if !jumped {
                    self.seek(pos + 2)?;
                }

                let b2 = self.get(pos + 1)? as u16;
                let offset = (((len as u16) ^ 0xC0) << 8) | b2;
                pos = offset as usize;
                jumped = true;
                jumps += 1;
                continue;
            }

            pos += 1;

            if len == 0 {
                break;
            }

            outstr.push_str(delim);

            let str_buffer = self.get_range(pos, len as usize)?;
            outstr.push_str(&String::from_utf8_lossy(str_buffer).to_lowercase());

            delim = ".";

            pos += len as usize;
        }

        if !jumped {
            self.seek(pos)?;
        }

        Ok(())
    }
}

/// Growable buffer, used when serializing packets
#[derive(Default)]
pub struct VectorPacketBuffer {
    pub buffer: Vec<u8>,
    pub pos: usize,
}

impl VectorPacketBuffer {
    pub fn new() -> VectorPacketBuffer {
        VectorPacketBuffer {
            buffer: Vec::new(),
            pos: 0,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> VectorPacketBuffer {
        VectorPacketBuffer {
            buffer: bytes.to_vec(),
            pos: 0,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

impl PacketBuffer for VectorPacketBuffer {
    fn read(&mut self) -> Result<u8> {
        let res = *self.buffer.get(self.pos).ok_or(BufferError::EndOfBuffer)?;
        self.pos += 1;

        Ok(res)
    }

    fn get(&mut self, pos: usize) -> Result<u8> {
        self.buffer.get(pos).copied().ok_or(BufferError::EndOfBuffer)
    }

    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]> {
        let end = start.checked_add(len).ok_or(BufferError::EndOfBuffer)?;
        self.buffer.get(start..end).ok_or(BufferError::EndOfBuffer)
    }

    fn write(&mut self, val: u8) -> Result<()> {
        if self.pos < self.buffer.len() {
            self.buffer[self.pos] = val;
        } else {
            self.buffer.push(val);
        }
        self.pos += 1;

        Ok(())
    }

    fn set(&mut self, pos: usize, val: u8) -> Result<()> {
        let slot = self.buffer.get_mut(pos).ok_or(BufferError::EndOfBuffer)?;
        *slot = val;

        Ok(())
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn seek(&mut self, pos: usize) -> Result<()> {
        self.pos = pos;

        Ok(())
    }

    fn step(&mut self, steps: usize) -> Result<()> {
        self.pos += steps;

        Ok(())
    }
}

/// Fixed 512 byte buffer, the classic UDP payload limit
pub struct BytePacketBuffer {
    pub buf: [u8; 512],
    pub pos: usize,
}

impl BytePacketBuffer {
    pub fn new() -> BytePacketBuffer {
        BytePacketBuffer {
            buf: [0; 512],
            pos: 0,
        }
    }
}

impl Default for BytePacketBuffer {
    fn default() -> Self {
        BytePacketBuffer::new()
    }
}

impl PacketBuffer for BytePacketBuffer {
    fn read(&mut self) -> Result<u8> {
        if self.pos >= 512 {
            return Err(BufferError::EndOfBuffer);
        }
        let res = self.buf[self.pos];
        self.pos += 1;

        Ok(res)
    }

    fn get(&mut self, pos: usize) -> Result<u8> {
        if pos >= 512 {
            return Err(BufferError::EndOfBuffer);
        }
        Ok(self.buf[pos])
    }

    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]> {
        if start + len > 512 {
            return Err(BufferError::EndOfBuffer);
        }
        Ok(&self.buf[start..start + len])
    }

    fn write(&mut self, val: u8) -> Result<()> {
        if self.pos >= 512 {
            return Err(BufferError::EndOfBuffer);
        }
        self.buf[self.pos] = val;
        self.pos += 1;

        Ok(())
    }

    fn set(&mut self, pos: usize, val: u8) -> Result<()> {
        if pos >= 512 {
            return Err(BufferError::EndOfBuffer);
        }
        self.buf[pos] = val;

        Ok(())
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn seek(&mut self, pos: usize) -> Result<()> {
        self.pos = pos;

        Ok(())
    }

    fn step(&mut self, steps: usize) -> Result<()> {
        self.pos += steps;

        Ok(())
    }
}
