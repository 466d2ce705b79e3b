//! The CryptoMemory cryptoengine.
//!
//! Host and device each run an identical copy of this engine. It is a
//! nonlinear stream cipher built from three small shift registers whose
//! cells are combined with modular additions and rotations:
//! - R: 7 cells of 5 bits
//! - S: 7 cells of 7 bits
//! - T: 5 cells of 5 bits
//!
//! Every input byte clocks all three registers once and shifts a new
//! 4-bit nibble into the 8-bit output register. Authentication seeds the
//! engine from the cryptogram, random and secret; afterwards both sides feed
//! it every authenticated exchange, which is what makes the encrypted
//! checksum a MAC over the whole session transcript.

use zeroize::{Zeroize, ZeroizeOnDrop};

/// Modulus of the R register cells.
const MOD_R: u8 = 0x1F;
/// Modulus of the S register cells.
const MOD_S: u8 = 0x7F;
/// Modulus of the T register cells.
const MOD_T: u8 = 0x1F;

/// Idle clocks before each payload byte.
const CLOCKS_PER_BYTE: usize = 5;
/// Idle clocks before the first checksum byte.
const CLOCKS_CHECKSUM_FIRST: usize = 15;
/// Idle clocks before the second checksum byte.
const CLOCKS_CHECKSUM_SECOND: usize = 5;

/// Running cryptoengine state.
#[derive(Clone, Default, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct CryptoEngine {
    r: [u8; 7],
    s: [u8; 7],
    t: [u8; 5],
    output: u8,
}

impl core::fmt::Debug for CryptoEngine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CryptoEngine").finish_non_exhaustive()
    }
}

#[inline]
fn add_mod(a: u8, b: u8, modulus: u8) -> u8 {
    let sum = a + b;
    if sum > modulus {
        sum - modulus
    } else {
        sum
    }
}

#[inline]
fn rotate_5(x: u8) -> u8 {
    ((x << 1) & 0x1E) | ((x >> 4) & 0x01)
}

#[inline]
fn rotate_7(x: u8) -> u8 {
    ((x << 1) & 0x7E) | ((x >> 6) & 0x01)
}

impl CryptoEngine {
    /// Create an engine in the power-up (all zero) state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the engine to the power-up state.
    pub fn reset(&mut self) {
        self.zeroize();
    }

    /// Current output byte.
    pub fn output(&self) -> u8 {
        self.output
    }

    /// Clock the engine once with `input`.
    pub fn clock(&mut self, input: u8) {
        let din = input ^ self.output;
        let ri = din & 0x1F;
        let si = ((din << 3) & 0x78) | ((din >> 5) & 0x07);
        let ti = (din >> 3) & 0x1F;

        let r = &mut self.r;
        let r_sum = add_mod(r[3], rotate_5(r[6]), MOD_R);
        r[6] = r[5];
        r[5] = r[4];
        r[4] = r[3];
        r[3] = r[2] ^ ri;
        r[2] = r[1];
        r[1] = r[0];
        r[0] = r_sum;

        let s = &mut self.s;
        let s_sum = add_mod(s[5], rotate_7(s[6]), MOD_S);
        s[6] = s[5];
        s[5] = s[4] ^ si;
        s[4] = s[3];
        s[3] = s[2];
        s[2] = s[1];
        s[1] = s[0];
        s[0] = s_sum;

        let t = &mut self.t;
        let t_sum = add_mod(t[4], t[2], MOD_T);
        t[4] = t[3];
        t[3] = t[2];
        t[2] = t[1];
        t[1] = t[0] ^ ti;
        t[0] = t_sum;

        let nibble = (((self.r[0] ^ self.r[4]) & !self.s[0]) | ((self.t[0] ^ self.t[3]) & self.s[0])) & 0x0F;
        self.output = (self.output << 4) | nibble;
    }

    /// Clock the engine `count` times with a zero input.
    pub fn idle(&mut self, count: usize) {
        for _ in 0..count {
            self.clock(0);
        }
    }

    /// Clock the engine with each byte of `data`.
    pub fn absorb(&mut self, data: &[u8]) {
        for &byte in data {
            self.clock(byte);
        }
    }

    /// Feed the operand bytes of a command header (P1, P2, N).
    ///
    /// The command byte itself carries the bus address and is not absorbed.
    pub fn absorb_operands(&mut self, operands: &[u8]) {
        for &byte in operands {
            self.idle(CLOCKS_PER_BYTE);
            self.clock(byte);
        }
    }

    /// Absorb outgoing payload bytes, optionally encrypting them in place.
    ///
    /// The engine always absorbs the clear text, so host and device stay in
    /// step whether or not the payload travels encrypted.
    pub fn seal(&mut self, data: &mut [u8], encrypt: bool) {
        for byte in data.iter_mut() {
            self.idle(CLOCKS_PER_BYTE);
            let clear = *byte;
            if encrypt {
                *byte ^= self.output;
            }
            self.clock(clear);
        }
    }

    /// Absorb incoming payload bytes, optionally decrypting them in place.
    pub fn open(&mut self, data: &mut [u8], decrypt: bool) {
        for byte in data.iter_mut() {
            self.idle(CLOCKS_PER_BYTE);
            if decrypt {
                *byte ^= self.output;
            }
            self.clock(*byte);
        }
    }

    /// Extract the two checksum bytes, advancing the engine.
    pub fn checksum(&mut self) -> [u8; 2] {
        self.idle(CLOCKS_CHECKSUM_FIRST);
        let first = self.output;
        self.idle(CLOCKS_CHECKSUM_SECOND);
        [first, self.output]
    }
}
