//! Galois Field GF(256) arithmetic operations
//!
//! This module implements arithmetic in the Galois Field GF(2^8) using the
//! primitive polynomial x^8 + x^4 + x^3 + x^2 + 1 (0x11d), with 2 as the
//! primitive element. The log/antilog tables are computed at compile time and
//! shared process-wide through [`FIELD`]; nothing mutates them after that.

/// x^8 + x^4 + x^3 + x^2 + 1
const PRIMITIVE_POLY: u16 = 0x11d;

/// Galois Field GF(256) lookup tables
#[derive(Debug)]
pub struct GF256 {
    /// Discrete log of every non-zero element (log[0] is unused)
    log_table: [u8; 256],
    /// Powers of the primitive element, doubled in length so that
    /// `log a + log b` never needs a modulo
    antilog_table: [u8; 512],
}

/// The process-wide field instance.
pub static FIELD: GF256 = GF256::new();

impl GF256 {
    /// Build the logarithm and antilog tables.
    pub const fn new() -> Self {
        let mut log_table = [0u8; 256];
        let mut antilog_table = [0u8; 512];

        let mut value: u16 = 1;
        let mut i = 0;
        while i < 255 {
            antilog_table[i] = value as u8;
            log_table[value as usize] = i as u8;
            value <<= 1;
            if value & 0x100 != 0 {
                value ^= PRIMITIVE_POLY;
            }
            i += 1;
        }
        while i < 512 {
            antilog_table[i] = antilog_table[i - 255];
            i += 1;
        }

        Self {
            log_table,
            antilog_table,
        }
    }

    /// Addition in GF(256) - same as XOR
    #[inline]
    pub fn add(&self, a: u8, b: u8) -> u8 {
        a ^ b
    }

    /// Subtraction in GF(256) - same as XOR (since -x = x in GF(2^n))
    #[inline]
    pub fn subtract(&self, a: u8, b: u8) -> u8 {
        a ^ b
    }

    /// Multiplication in GF(256) using log/antilog tables
    #[inline]
    pub fn multiply(&self, a: u8, b: u8) -> u8 {
        if a == 0 || b == 0 {
            return 0;
        }
        let log_sum = self.log_table[a as usize] as usize + self.log_table[b as usize] as usize;
        self.antilog_table[log_sum]
    }

    /// Division in GF(256); `None` when dividing by zero
    pub fn divide(&self, a: u8, b: u8) -> Option<u8> {
        if b == 0 {
            return None;
        }
        if a == 0 {
            return Some(0);
        }
        let log_a = self.log_table[a as usize] as usize;
        let log_b = self.log_table[b as usize] as usize;
        Some(self.antilog_table[log_a + 255 - log_b])
    }

    /// Multiplicative inverse; zero has none
    pub fn inverse(&self, a: u8) -> Option<u8> {
        if a == 0 {
            return None;
        }
        Some(self.antilog_table[255 - self.log_table[a as usize] as usize])
    }

    /// The primitive element raised to `exponent` (mod 255).
    pub fn exp(&self, exponent: usize) -> u8 {
        self.antilog_table[exponent % 255]
    }

    /// `base^exponent` in GF(256)
    pub fn power(&self, base: u8, exponent: usize) -> u8 {
        if exponent == 0 {
            return 1;
        }
        if base == 0 {
            return 0;
        }
        let log_base = self.log_table[base as usize] as usize;
        self.antilog_table[(log_base * exponent) % 255]
    }

    /// `dst[i] ^= coefficient * src[i]` for every byte position.
    ///
    /// This is the inner loop of both parity computation and reconstruction,
    /// so the row of the multiplication table for `coefficient` is built once
    /// up front.
    pub fn mul_add_slice(&self, coefficient: u8, src: &[u8], dst: &mut [u8]) {
        match coefficient {
            0 => {}
            1 => {
                for (d, s) in dst.iter_mut().zip(src) {
                    *d ^= *s;
                }
            }
            c => {
                let mut row = [0u8; 256];
                for (x, slot) in row.iter_mut().enumerate() {
                    *slot = self.multiply(c, x as u8);
                }
                for (d, s) in dst.iter_mut().zip(src) {
                    *d ^= row[*s as usize];
                }
            }
        }
    }
}

impl Default for GF256 {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gf256_basic_operations() {
        let gf = &FIELD;

        assert_eq!(gf.add(0x53, 0xCA), 0x99);
        assert_eq!(gf.add(0xFF, 0xFF), 0x00);
        assert_eq!(gf.subtract(0x53, 0xCA), 0x99);
    }

    #[test]
    fn test_gf256_multiplication() {
        let gf = &FIELD;

        assert_eq!(gf.multiply(0, 5), 0);
        assert_eq!(gf.multiply(5, 0), 0);
        assert_eq!(gf.multiply(1, 5), 5);
        assert_eq!(gf.multiply(2, 2), 4);
        assert_eq!(gf.multiply(3, 3), 5);
        // 0x80 * 2 overflows and is reduced by 0x11d
        assert_eq!(gf.multiply(0x80, 2), 0x1d);

        for a in 1..=20u8 {
            for b in 1..=20u8 {
                assert_eq!(gf.multiply(a, b), gf.multiply(b, a));
            }
        }
    }

    #[test]
    fn test_gf256_inverse() {
        let gf = &FIELD;

        for a in 1..=255u8 {
            let inv_a = gf.inverse(a).unwrap();
            assert_eq!(gf.multiply(a, inv_a), 1, "Failed for a={}", a);
        }
        assert!(gf.inverse(0).is_none());
    }

    #[test]
    fn test_gf256_division() {
        let gf = &FIELD;

        assert_eq!(gf.divide(0, 5), Some(0));
        assert_eq!(gf.divide(5, 1), Some(5));
        assert!(gf.divide(5, 0).is_none());

        for a in 1..=30u8 {
            for b in 1..=30u8 {
                let product = gf.multiply(a, b);
                assert_eq!(gf.divide(product, b), Some(a), "Failed for a={}, b={}", a, b);
            }
        }
    }

    #[test]
    fn test_primitive_element_generates_field() {
        let gf = &FIELD;
        let mut seen = [false; 256];
        for e in 0..255 {
            let v = gf.exp(e);
            assert!(!seen[v as usize], "repeated element {} at exponent {}", v, e);
            seen[v as usize] = true;
        }
        assert!(!seen[0]);
        assert_eq!(gf.exp(255), 1);
    }

    #[test]
    fn test_gf256_power() {
        let gf = &FIELD;

        assert_eq!(gf.power(2, 0), 1);
        assert_eq!(gf.power(2, 1), 2);
        assert_eq!(gf.power(2, 8), 0x1d);
        assert_eq!(gf.power(0, 0), 1);
        assert_eq!(gf.power(0, 5), 0);
    }

    #[test]
    fn test_mul_add_slice_matches_scalar() {
        let gf = &FIELD;
        let src: Vec<u8> = (0..=255u8).collect();
        for coefficient in [0u8, 1, 2, 0x53, 0xff] {
            let mut dst = vec![0xAAu8; 256];
            gf.mul_add_slice(coefficient, &src, &mut dst);
            for (i, &s) in src.iter().enumerate() {
                assert_eq!(dst[i], 0xAA ^ gf.multiply(coefficient, s));
            }
        }
    }
}
