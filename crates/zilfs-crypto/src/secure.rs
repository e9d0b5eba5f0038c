//! Zeroising containers for key material and plaintext.
//!
//! Wiping goes through `zeroize`, which uses volatile writes plus a
//! compiler fence so the stores cannot be elided.

use zeroize::Zeroize;
use zilfs_core::{ZilError, ZilResult};

use crate::KEY_SIZE;

/// Fixed-capacity byte region that is wiped on release.
pub struct SecureBuffer {
    bytes: Vec<u8>,
    wiped: bool,
}

impl SecureBuffer {
    /// A zero-filled buffer of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        Self {
            bytes: vec![0u8; len],
            wiped: false,
        }
    }

    /// Take ownership of `bytes` without copying them.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            wiped: false,
        }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self::from_vec(data.to_vec())
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Borrow `len` bytes starting at `offset`.
    pub fn read(&self, offset: usize, len: usize) -> ZilResult<&[u8]> {
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| {
                ZilError::bad_argument(format!(
                    "read {len} bytes at {offset} exceeds buffer of {}",
                    self.bytes.len()
                ))
            })?;
        Ok(&self.bytes[offset..end])
    }

    /// Overwrite bytes in place starting at `offset`. Never grows the buffer.
    pub fn overwrite(&mut self, offset: usize, data: &[u8]) -> ZilResult<()> {
        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| {
                ZilError::bad_argument(format!(
                    "write of {} bytes at {offset} exceeds buffer of {}",
                    data.len(),
                    self.bytes.len()
                ))
            })?;
        self.bytes[offset..end].copy_from_slice(data);
        self.wiped = false;
        Ok(())
    }

    /// Shrink or zero-extend to `new_len`.
    ///
    /// Truncated bytes are wiped before the length drops. Growth past the
    /// current allocation copies into a fresh allocation and wipes the old one.
    pub fn resize(&mut self, new_len: usize) {
        let len = self.bytes.len();
        if new_len <= len {
            self.bytes[new_len..].zeroize();
            self.bytes.truncate(new_len);
        } else if new_len <= self.bytes.capacity() {
            self.bytes.resize(new_len, 0);
        } else {
            let mut grown = Vec::with_capacity(new_len);
            grown.extend_from_slice(&self.bytes);
            grown.resize(new_len, 0);
            let mut old = std::mem::replace(&mut self.bytes, grown);
            old.zeroize();
        }
    }

    /// Fill with zeroes. The length is preserved.
    pub fn wipe(&mut self) {
        self.bytes.as_mut_slice().zeroize();
        self.wiped = true;
    }

    pub fn is_wiped(&self) -> bool {
        self.wiped
    }
}

impl Drop for SecureBuffer {
    fn drop(&mut self) {
        // Whole capacity, not just the initialised length
        self.bytes.zeroize();
    }
}

impl Clone for SecureBuffer {
    fn clone(&self) -> Self {
        Self::from_slice(&self.bytes)
    }
}

impl std::fmt::Debug for SecureBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureBuffer")
            .field("len", &self.bytes.len())
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A 256-bit key. Heap-pinned so moves do not scatter copies; zeroized on drop.
#[derive(Clone)]
pub struct SecretKey {
    bytes: Box<[u8; KEY_SIZE]>,
}

impl SecretKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        let mut bytes = bytes;
        let key = Self {
            bytes: Box::new(bytes),
        };
        bytes.zeroize();
        key
    }

    pub fn from_slice(bytes: &[u8]) -> ZilResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(ZilError::bad_argument(format!(
                "key must be {KEY_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let mut key = Box::new([0u8; KEY_SIZE]);
        key.copy_from_slice(bytes);
        Ok(Self { bytes: key })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for SecretKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_and_overwrite_within_bounds() {
        let mut buf = SecureBuffer::zeroed(8);
        buf.overwrite(2, b"abc").unwrap();
        assert_eq!(buf.read(2, 3).unwrap(), b"abc");
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn out_of_bounds_is_bad_argument() {
        let mut buf = SecureBuffer::zeroed(4);
        assert!(matches!(buf.read(3, 2), Err(ZilError::BadArgument(_))));
        assert!(matches!(buf.overwrite(2, b"xyz"), Err(ZilError::BadArgument(_))));
        assert!(matches!(buf.read(usize::MAX, 2), Err(ZilError::BadArgument(_))));
    }

    #[test]
    fn wipe_zeroes_but_keeps_length() {
        let mut buf = SecureBuffer::from_slice(b"secret");
        buf.wipe();
        assert!(buf.is_wiped());
        assert_eq!(buf.as_slice(), &[0u8; 6]);
    }

    #[test]
    fn resize_truncates_and_extends() {
        let mut buf = SecureBuffer::from_slice(b"hello");
        buf.resize(2);
        assert_eq!(buf.as_slice(), b"he");
        buf.resize(64);
        assert_eq!(buf.len(), 64);
        assert_eq!(&buf.as_slice()[..2], b"he");
        assert!(buf.as_slice()[2..].iter().all(|&b| b == 0));
    }

    #[test]
    fn debug_is_redacted() {
        let key = SecretKey::from_bytes([7u8; KEY_SIZE]);
        let rendered = format!("{key:?} {:?}", SecureBuffer::from_slice(b"pw"));
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("7, 7"));
    }

    #[test]
    fn key_from_slice_checks_length() {
        assert!(SecretKey::from_slice(&[1u8; 31]).is_err());
        let key = SecretKey::from_slice(&[1u8; KEY_SIZE]).unwrap();
        assert_eq!(key.as_bytes(), &[1u8; KEY_SIZE]);
    }
}
