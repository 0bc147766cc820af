use crate::error::DecodeError;

/// Little-endian reader over a reply or command stream.
///
/// The first failed read marks the decoder fatal; every later read fails with
/// [`DecodeError::Fatal`] so callers can decode a whole reply and check once at the end.
#[derive(Debug, Clone)]
pub struct CommandDecoder<'a> {
    bytes: &'a [u8],
    pos: usize,
    fatal: bool,
}

impl<'a> CommandDecoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            pos: 0,
            fatal: false,
        }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    pub fn set_fatal(&mut self) {
        self.fatal = true;
    }

    /// Fail unless `len` more bytes are available.
    pub fn ensure(&mut self, len: usize) -> Result<(), DecodeError> {
        if self.fatal {
            return Err(DecodeError::Fatal);
        }
        let remaining = self.remaining();
        if remaining < len {
            self.fatal = true;
            return Err(DecodeError::Truncated {
                needed: len,
                remaining,
            });
        }
        Ok(())
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        self.ensure(len)?;
        let start = self.pos;
        self.pos += len;
        Ok(&self.bytes[start..start + len])
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let bytes = self.read_bytes(8)?;
        Ok(u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    /// Look at the next `u32` without consuming it.
    pub fn peek_u32(&self) -> Option<u32> {
        if self.fatal {
            return None;
        }
        let bytes = self.bytes.get(self.pos..self.pos.checked_add(4)?)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn skip(&mut self, len: usize) -> Result<(), DecodeError> {
        self.read_bytes(len).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_little_endian_values() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0xAABB_CCDDu32.to_le_bytes());
        bytes.extend_from_slice(&0x0102_0304_0506_0708u64.to_le_bytes());
        bytes.extend_from_slice(b"xyz");

        let mut dec = CommandDecoder::new(&bytes);
        assert_eq!(dec.peek_u32(), Some(0xAABB_CCDD));
        assert_eq!(dec.read_u32().unwrap(), 0xAABB_CCDD);
        assert_eq!(dec.read_u64().unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(dec.read_bytes(3).unwrap(), b"xyz");
        assert_eq!(dec.remaining(), 0);
        assert!(!dec.is_fatal());
    }

    #[test]
    fn truncation_is_sticky() {
        let bytes = [1u8, 0, 0, 0, 2, 0];
        let mut dec = CommandDecoder::new(&bytes);
        assert_eq!(dec.read_u32().unwrap(), 1);
        assert_eq!(
            dec.read_u32().unwrap_err(),
            DecodeError::Truncated {
                needed: 4,
                remaining: 2
            }
        );
        assert!(dec.is_fatal());
        // Even a read that would fit now fails.
        assert_eq!(dec.read_bytes(1).unwrap_err(), DecodeError::Fatal);
        assert_eq!(dec.peek_u32(), None);
    }
}
