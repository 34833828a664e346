//! OS randomness for secrets, seeds, tags and padding.

/// Error types for random operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RandomError {
    /// System entropy source unavailable
    EntropyUnavailable,
}

impl std::fmt::Display for RandomError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RandomError::EntropyUnavailable => write!(f, "System entropy source unavailable"),
        }
    }
}

impl std::error::Error for RandomError {}

/// Generate a random byte array using system entropy
pub fn random_bytes<const N: usize>() -> Result<[u8; N], RandomError> {
    let mut bytes = [0u8; N];
    getrandom::getrandom(&mut bytes).map_err(|_| RandomError::EntropyUnavailable)?;
    Ok(bytes)
}

/// Generate random bytes into a mutable slice
pub fn fill_random(dest: &mut [u8]) -> Result<(), RandomError> {
    getrandom::getrandom(dest).map_err(|_| RandomError::EntropyUnavailable)
}

/// Generate a random vector of `len` bytes
pub fn random_vec(len: usize) -> Result<Vec<u8>, RandomError> {
    let mut out = vec![0u8; len];
    fill_random(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes_differ() {
        let a = random_bytes::<32>().unwrap();
        let b = random_bytes::<32>().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_random_vec_length() {
        assert_eq!(random_vec(0).unwrap().len(), 0);
        assert_eq!(random_vec(1000).unwrap().len(), 1000);
    }

    #[test]
    fn test_fill_random_touches_buffer() {
        let mut buf = [0u8; 64];
        fill_random(&mut buf).unwrap();
        assert!(buf.iter().any(|&b| b != 0));
    }
}
