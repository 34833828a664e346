//! # Erasure coding
//!
//! Systematic Reed-Solomon style code over GF(2^8) built from a Vandermonde
//! matrix, as used to spread a fragmented message over `n` packets of which
//! any `k` suffice.
//!
//! ## Construction
//!
//! - Field polynomial x^8 + x^4 + x^3 + x^2 + 1 (0x11D), generator α = 2
//! - Row 0 of the n×k Vandermonde matrix is `[1, 0, .., 0]`; row r ≥ 1 holds
//!   `α^((r-1)·c)` in column c
//! - The matrix is multiplied by the inverse of its top k×k square so the
//!   first k shares are the source shares themselves
//!
//! Decoding inverts the k×k submatrix formed by the rows of the received
//! share indices.

/// Field polynomial (without the x^8 term the tables handle implicitly)
const GF_POLY: u16 = 0x11D;

/// Largest supported share count
pub const MAX_SHARES: usize = 255;

struct GfTables {
    exp: [u8; 512],
    log: [u16; 256],
}

/// Exponent and logarithm tables, computed at compile time
const GF: GfTables = {
    let mut exp = [0u8; 512];
    let mut log = [0u16; 256];
    let mut x: u16 = 1;
    let mut i = 0;
    while i < 255 {
        exp[i] = x as u8;
        exp[i + 255] = x as u8;
        log[x as usize] = i as u16;
        x <<= 1;
        if x & 0x100 != 0 {
            x ^= GF_POLY;
        }
        i += 1;
    }
    // Entries past 509 are never indexed (max log sum is 254 + 254).
    exp[510] = exp[0];
    exp[511] = exp[1];
    GfTables { exp, log }
};

#[inline]
fn gf_mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    GF.exp[(GF.log[a as usize] + GF.log[b as usize]) as usize]
}

#[inline]
fn gf_inv(a: u8) -> u8 {
    debug_assert!(a != 0);
    GF.exp[(255 - GF.log[a as usize]) as usize % 255]
}

#[inline]
fn gf_alpha_pow(e: usize) -> u8 {
    GF.exp[e % 255]
}

/// `dst ^= c · src` over the field
fn mul_add_slice(dst: &mut [u8], src: &[u8], c: u8) {
    if c == 0 {
        return;
    }
    if c == 1 {
        for (d, s) in dst.iter_mut().zip(src) {
            *d ^= s;
        }
        return;
    }
    let log_c = GF.log[c as usize];
    for (d, &s) in dst.iter_mut().zip(src) {
        if s != 0 {
            *d ^= GF.exp[(GF.log[s as usize] + log_c) as usize];
        }
    }
}

/// Error types for FEC operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FecError {
    /// `k` and `n` do not satisfy 1 ≤ k ≤ n ≤ 255
    InvalidParameters {
        /// Required shares
        k: usize,
        /// Total shares
        n: usize,
    },
    /// Wrong number of shares supplied
    WrongShareCount {
        /// Expected count
        expected: usize,
        /// Supplied count
        actual: usize,
    },
    /// Share index not below `n`
    IndexOutOfRange(usize),
    /// Same index supplied twice
    DuplicateIndex(usize),
    /// Shares of unequal length
    UnequalShareLength,
    /// Decoding matrix not invertible
    SingularMatrix,
}

impl std::fmt::Display for FecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FecError::InvalidParameters { k, n } => {
                write!(f, "Invalid FEC parameters k={} n={}", k, n)
            }
            FecError::WrongShareCount { expected, actual } => {
                write!(f, "Expected {} shares, got {}", expected, actual)
            }
            FecError::IndexOutOfRange(i) => write!(f, "Share index {} out of range", i),
            FecError::DuplicateIndex(i) => write!(f, "Share index {} supplied twice", i),
            FecError::UnequalShareLength => write!(f, "Shares differ in length"),
            FecError::SingularMatrix => write!(f, "Decoding matrix is singular"),
        }
    }
}

impl std::error::Error for FecError {}

/// Invert a k×k row-major matrix in place (Gauss-Jordan)
fn invert_matrix(m: &mut [u8], k: usize) -> Result<(), FecError> {
    let mut inv = vec![0u8; k * k];
    for i in 0..k {
        inv[i * k + i] = 1;
    }

    for col in 0..k {
        let pivot = (col..k)
            .find(|&r| m[r * k + col] != 0)
            .ok_or(FecError::SingularMatrix)?;
        if pivot != col {
            for c in 0..k {
                m.swap(pivot * k + c, col * k + c);
                inv.swap(pivot * k + c, col * k + c);
            }
        }

        let scale = gf_inv(m[col * k + col]);
        for c in 0..k {
            m[col * k + c] = gf_mul(m[col * k + c], scale);
            inv[col * k + c] = gf_mul(inv[col * k + c], scale);
        }

        for r in 0..k {
            let factor = m[r * k + col];
            if r == col || factor == 0 {
                continue;
            }
            for c in 0..k {
                m[r * k + c] ^= gf_mul(factor, m[col * k + c]);
                inv[r * k + c] ^= gf_mul(factor, inv[col * k + c]);
            }
        }
    }

    m.copy_from_slice(&inv);
    Ok(())
}

/// A systematic (k, n) erasure code
#[derive(Debug, Clone)]
pub struct FecCode {
    k: usize,
    n: usize,
    /// n×k encoding matrix, top k rows are the identity
    matrix: Vec<u8>,
}

impl FecCode {
    /// Build the code for `k` source shares and `n` total shares
    pub fn new(k: usize, n: usize) -> Result<Self, FecError> {
        if k == 0 || k > n || n > MAX_SHARES {
            return Err(FecError::InvalidParameters { k, n });
        }

        let mut vandermonde = vec![0u8; n * k];
        vandermonde[0] = 1;
        for row in 1..n {
            for col in 0..k {
                vandermonde[row * k + col] = gf_alpha_pow((row - 1) * col);
            }
        }

        let mut top_inverse = vandermonde[..k * k].to_vec();
        invert_matrix(&mut top_inverse, k)?;

        let mut matrix = vec![0u8; n * k];
        for i in 0..k {
            matrix[i * k + i] = 1;
        }
        for row in k..n {
            for col in 0..k {
                let mut acc = 0u8;
                for j in 0..k {
                    acc ^= gf_mul(vandermonde[row * k + j], top_inverse[j * k + col]);
                }
                matrix[row * k + col] = acc;
            }
        }

        Ok(Self { k, n, matrix })
    }

    /// Required share count
    pub fn k(&self) -> usize {
        self.k
    }

    /// Total share count
    pub fn n(&self) -> usize {
        self.n
    }

    fn check_lengths(shares: &[&[u8]]) -> Result<usize, FecError> {
        let len = shares.first().map(|s| s.len()).unwrap_or(0);
        if shares.iter().any(|s| s.len() != len) {
            return Err(FecError::UnequalShareLength);
        }
        Ok(len)
    }

    /// Produce share `index` from the `k` source shares
    pub fn encode(&self, source: &[&[u8]], index: usize) -> Result<Vec<u8>, FecError> {
        if source.len() != self.k {
            return Err(FecError::WrongShareCount {
                expected: self.k,
                actual: source.len(),
            });
        }
        if index >= self.n {
            return Err(FecError::IndexOutOfRange(index));
        }
        let len = Self::check_lengths(source)?;

        if index < self.k {
            return Ok(source[index].to_vec());
        }

        let mut out = vec![0u8; len];
        let row = &self.matrix[index * self.k..(index + 1) * self.k];
        for (coef, src) in row.iter().zip(source) {
            mul_add_slice(&mut out, src, *coef);
        }
        Ok(out)
    }

    /// Produce all `n` shares
    pub fn encode_all(&self, source: &[&[u8]]) -> Result<Vec<Vec<u8>>, FecError> {
        (0..self.n).map(|i| self.encode(source, i)).collect()
    }

    /// Rebuild the `k` source shares from any `k` distinct shares
    pub fn decode(&self, shares: &[&[u8]], indices: &[usize]) -> Result<Vec<Vec<u8>>, FecError> {
        if shares.len() != self.k || indices.len() != self.k {
            return Err(FecError::WrongShareCount {
                expected: self.k,
                actual: shares.len().min(indices.len()),
            });
        }
        let mut seen = vec![false; self.n];
        for &index in indices {
            if index >= self.n {
                return Err(FecError::IndexOutOfRange(index));
            }
            if seen[index] {
                return Err(FecError::DuplicateIndex(index));
            }
            seen[index] = true;
        }
        let len = Self::check_lengths(shares)?;

        let k = self.k;
        let mut sub = vec![0u8; k * k];
        for (r, &index) in indices.iter().enumerate() {
            sub[r * k..(r + 1) * k].copy_from_slice(&self.matrix[index * k..(index + 1) * k]);
        }
        invert_matrix(&mut sub, k)?;

        let mut out = vec![vec![0u8; len]; k];
        for (j, source) in out.iter_mut().enumerate() {
            for (i, share) in shares.iter().enumerate() {
                mul_add_slice(source, share, sub[j * k + i]);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_source(k: usize, len: usize) -> Vec<Vec<u8>> {
        (0..k)
            .map(|i| (0..len).map(|b| (i * 31 + b * 7 + 1) as u8).collect())
            .collect()
    }

    #[test]
    fn test_field_tables() {
        assert_eq!(gf_mul(2, 0x80), 0x1D);
        for a in 1..=255u8 {
            assert_eq!(gf_mul(a, gf_inv(a)), 1);
        }
        assert_eq!(gf_mul(0, 7), 0);
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(FecCode::new(0, 4).is_err());
        assert!(FecCode::new(5, 4).is_err());
        assert!(FecCode::new(4, 256).is_err());
        assert!(FecCode::new(16, 22).is_ok());
    }

    #[test]
    fn test_systematic_shares() {
        let code = FecCode::new(4, 6).unwrap();
        let source = sample_source(4, 32);
        let refs: Vec<&[u8]> = source.iter().map(|s| s.as_slice()).collect();
        for i in 0..4 {
            assert_eq!(code.encode(&refs, i).unwrap(), source[i]);
        }
    }

    #[test]
    fn test_decode_from_repair_shares() {
        let code = FecCode::new(3, 4).unwrap();
        let source = sample_source(3, 50);
        let refs: Vec<&[u8]> = source.iter().map(|s| s.as_slice()).collect();
        let shares = code.encode_all(&refs).unwrap();

        let picked = [3usize, 0, 2];
        let subset: Vec<&[u8]> = picked.iter().map(|&i| shares[i].as_slice()).collect();
        assert_eq!(code.decode(&subset, &picked).unwrap(), source);
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        let code = FecCode::new(2, 3).unwrap();
        let a = [1u8; 8];
        let b = [2u8; 8];
        let short = [3u8; 7];
        assert_eq!(
            code.decode(&[&a, &b], &[1, 1]),
            Err(FecError::DuplicateIndex(1))
        );
        assert_eq!(
            code.decode(&[&a, &b], &[0, 3]),
            Err(FecError::IndexOutOfRange(3))
        );
        assert_eq!(
            code.decode(&[&a, &short], &[0, 1]),
            Err(FecError::UnequalShareLength)
        );
        assert!(matches!(
            code.decode(&[&a], &[0]),
            Err(FecError::WrongShareCount { expected: 2, .. })
        ));
    }

    #[test]
    fn test_k_equals_n() {
        let code = FecCode::new(1, 1).unwrap();
        let data = [9u8; 5];
        assert_eq!(code.encode(&[&data], 0).unwrap(), data);
        assert_eq!(code.decode(&[&data], &[0]).unwrap(), vec![data.to_vec()]);
    }
}
