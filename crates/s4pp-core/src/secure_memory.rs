//! Secure memory management for cryptographic secrets
//!
//! Shared keys borrowed from the key store and HIDE session keys live in
//! [`SecureBytes`], which zeros its contents on drop and redacts itself from
//! `Debug` output so key material never reaches logs or error reports.

use std::fmt;
use std::ops::Deref;
use zeroize::Zeroize;

/// A secure wrapper that zeros memory on drop
#[derive(Clone)]
pub struct SecureBytes {
    data: Vec<u8>,
}

impl SecureBytes {
    /// Create a new secure byte container
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Create from a slice
    pub fn from_slice(slice: &[u8]) -> Self {
        Self {
            data: slice.to_vec(),
        }
    }

    /// Get length
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get as slice
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Explicitly zero the contents
    pub fn zero(&mut self) {
        self.data.zeroize();
    }
}

impl Deref for SecureBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for SecureBytes {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

// Prevent accidentally printing secrets
impl fmt::Debug for SecureBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecureBytes([REDACTED {} bytes])", self.data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_is_redacted() {
        let key = SecureBytes::from_slice(b"secret");
        let printed = format!("{:?}", key);
        assert!(!printed.contains("secret"));
        assert!(printed.contains("REDACTED"));
    }

    #[test]
    fn test_zero() {
        let mut key = SecureBytes::from_slice(b"secret");
        key.zero();
        assert_eq!(key.as_slice(), &[0u8; 6]);
    }

    #[test]
    fn test_deref() {
        let key = SecureBytes::from_slice(b"abc");
        assert_eq!(&key[..], b"abc");
        assert_eq!(key.len(), 3);
        assert!(!key.is_empty());
    }
}
