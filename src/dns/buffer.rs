//! buffers for use when reading and writing dns packets

use std::collections::BTreeMap;

use derive_more::{Display, Error};

/// Upper bound on compression pointers followed while reading one name.
const MAX_JUMPS: usize = 32;

/// Longest presentation-length name accepted on the wire.
const MAX_NAME_LEN: usize = 255;

#[derive(Debug, Display, Error, PartialEq, Eq)]
pub enum BufferError {
    #[display(fmt = "end of buffer")]
    EndOfBuffer,
    #[display(fmt = "buffer is read only")]
    ReadOnly,
    #[display(fmt = "label longer than 63 bytes")]
    LabelTooLong,
    #[display(fmt = "reserved label type")]
    BadLabel,
    #[display(fmt = "name longer than 255 bytes")]
    NameTooLong,
    #[display(fmt = "too many compression pointers")]
    TooManyJumps,
}

type Result<T> = std::result::Result<T, BufferError>;

pub trait PacketBuffer {
    fn read(&mut self) -> Result<u8>;
    fn get(&mut self, pos: usize) -> Result<u8>;
    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]>;
    fn write(&mut self, val: u8) -> Result<()>;
    fn set(&mut self, pos: usize, val: u8) -> Result<()>;
    fn pos(&self) -> usize;
    fn seek(&mut self, pos: usize) -> Result<()>;
    fn step(&mut self, steps: usize) -> Result<()>;
    fn find_label(&self, label: &str) -> Option<usize>;
    fn save_label(&mut self, label: &str, pos: usize);

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

    /// Writes `qname` label by label, reusing earlier suffixes through
    /// compression pointers where the buffer remembers them.
    fn write_qname(&mut self, qname: &str) -> Result<()> {
        let labels: Vec<&str> = qname.split('.').filter(|l| !l.is_empty()).collect();

        for (i, label) in labels.iter().enumerate() {
            if label.len() > 0x3f {
                return Err(BufferError::LabelTooLong);
            }

            let suffix = labels[i..].join(".");
            if let Some(prev_pos) = self.find_label(&suffix) {
                let jump_inst = (prev_pos as u16) | 0xC000;
                self.write_u16(jump_inst)?;
                return Ok(());
            }

            let pos = self.pos();
            if pos < 0x3FFF {
                self.save_label(&suffix, pos);
            }

            self.write_u8(label.len() as u8)?;
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

    /// Reads a possibly compressed name as a fully qualified string with a
    /// trailing dot. The root name reads as `"."`.
    fn read_qname(&mut self, outstr: &mut String) -> Result<()> {
        let mut pos = self.pos();
        let mut jumped = false;
        let mut jumps = 0;
        let mut name_len = 0;

        loop {
            let len = self.get(pos)?;

            if (len & 0xC0) == 0xC0 {
                if jumps >= MAX_JUMPS {
                    return Err(BufferError::TooManyJumps);
                }

                let b2 = self.get(pos + 1)? as u16;
                if !jumped {
                    self.seek(pos + 2)?;
                }

                pos = ((((len as u16) ^ 0xC0) << 8) | b2) as usize;
                jumped = true;
                jumps += 1;
                continue;
            }

            if (len & 0xC0) != 0 {
                return Err(BufferError::BadLabel);
            }

            pos += 1;

            if len == 0 {
                break;
            }

            name_len += len as usize + 1;
            if name_len > MAX_NAME_LEN {
                return Err(BufferError::NameTooLong);
            }

            let label = String::from_utf8_lossy(self.get_range(pos, len as usize)?).into_owned();
            outstr.push_str(&label);
            outstr.push('.');

            pos += len as usize;
        }

        if outstr.is_empty() {
            outstr.push('.');
        }

        if !jumped {
            self.seek(pos)?;
        }

        Ok(())
    }
}

/// Growable buffer used when composing packets.
#[derive(Default)]
pub struct VectorPacketBuffer {
    pub buffer: Vec<u8>,
    pub pos: usize,
    pub label_lookup: BTreeMap<String, usize>,
}

impl VectorPacketBuffer {
    pub fn new() -> VectorPacketBuffer {
        VectorPacketBuffer {
            buffer: Vec::new(),
            pos: 0,
            label_lookup: BTreeMap::new(),
        }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }
}

impl PacketBuffer for VectorPacketBuffer {
    fn find_label(&self, label: &str) -> Option<usize> {
        self.label_lookup.get(label).cloned()
    }

    fn save_label(&mut self, label: &str, pos: usize) {
        self.label_lookup.insert(label.to_string(), pos);
    }

    fn read(&mut self) -> Result<u8> {
        let res = *self.buffer.get(self.pos).ok_or(BufferError::EndOfBuffer)?;
        self.pos += 1;

        Ok(res)
    }

    fn get(&mut self, pos: usize) -> Result<u8> {
        self.buffer.get(pos).cloned().ok_or(BufferError::EndOfBuffer)
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

/// Read-only cursor over a captured payload. Parsing never copies the
/// payload; only the decoded names and rdata end up owned.
pub struct SlicePacketBuffer<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> SlicePacketBuffer<'a> {
    pub fn new(buf: &'a [u8]) -> SlicePacketBuffer<'a> {
        SlicePacketBuffer { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }
}

impl<'a> PacketBuffer for SlicePacketBuffer<'a> {
    fn find_label(&self, _: &str) -> Option<usize> {
        None
    }

    fn save_label(&mut self, _: &str, _: usize) {}

    fn read(&mut self) -> Result<u8> {
        let res = *self.buf.get(self.pos).ok_or(BufferError::EndOfBuffer)?;
        self.pos += 1;

        Ok(res)
    }

    fn get(&mut self, pos: usize) -> Result<u8> {
        self.buf.get(pos).cloned().ok_or(BufferError::EndOfBuffer)
    }

    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]> {
        let end = start.checked_add(len).ok_or(BufferError::EndOfBuffer)?;
        self.buf.get(start..end).ok_or(BufferError::EndOfBuffer)
    }

    fn write(&mut self, _: u8) -> Result<()> {
        Err(BufferError::ReadOnly)
    }

    fn set(&mut self, _: usize, _: u8) -> Result<()> {
        Err(BufferError::ReadOnly)
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.buf.len() {
            return Err(BufferError::EndOfBuffer);
        }
        self.pos = pos;

        Ok(())
    }

    fn step(&mut self, steps: usize) -> Result<()> {
        let pos = self.pos.checked_add(steps).ok_or(BufferError::EndOfBuffer)?;
        self.seek(pos)
    }
}
