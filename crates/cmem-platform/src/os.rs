//! Operating system entropy.

use crate::error::{Error, Result};
use crate::traits::RandomSource;
use rand::rngs::OsRng;
use rand::RngCore;

/// Random source backed by the operating system RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsRandom;

impl OsRandom {
    /// Create an OS random source.
    pub fn new() -> Self {
        Self
    }
}

impl RandomSource for OsRandom {
    fn fill_bytes(&mut self, dest: &mut [u8]) -> Result<()> {
        OsRng
            .try_fill_bytes(dest)
            .map_err(|e| Error::Random(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_random_fills_buffer() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        OsRandom::new().fill_bytes(&mut a).unwrap();
        OsRandom::new().fill_bytes(&mut b).unwrap();
        assert_ne!(a, b, "Two OS draws should differ");
    }
}
