//! # libmix-crypto
//!
//! Cryptographic primitives of the Type III (Mixminion-style) remailer
//! packet format.
//!
//! ## Overview
//!
//! Everything a client needs to build, peel and decode Type III packets,
//! without any networking: the packet digest, the keystream generator, the
//! wide-block cipher that wraps headers and payloads, the erasure code that
//! spreads long messages over several packets, payload compression and the
//! RSA operations on packet keys.
//!
//! ## Core Components
//!
//! - **[`hash`]** - SHA-1 digests, labelled sub-keys, HMAC and MD5 helpers
//! - **[`prng`]** - AES-128-CTR keystream generator and stream cipher
//! - **[`sprp`]** - LIONESS super-pseudorandom permutation
//! - **[`fec`]** - Systematic Vandermonde erasure code over GF(2^8)
//! - **[`compress`]** - zlib compression at level 9
//! - **[`pk`]** - RSA-OAEP sealing and PKCS#1 v1.5 signatures
//! - **[`random`]** - OS randomness
//!
//! ## Key Derivation
//!
//! ```text
//! hash(x)            = SHA-1(x)                  # 20 bytes
//! sub_key(s, label)  = hash(s | label)[0..16]    # AES-128 key
//! PRNG(k, len)       = AES-128-CTR(k, counter=0) # deterministic
//! SPRP(K, block)     = LIONESS(K, block)         # |K| = 20
//! ```
//!
//! ## Quick Start
//!
//! ### Wrapping a payload
//!
//! ```rust
//! use libmix_crypto::prelude::*;
//!
//! let secret = [7u8; 16];
//! let key = hash_concat(&[&secret, b"PAYLOAD ENCRYPT"]);
//! let payload = vec![0u8; 28672];
//!
//! let wrapped = sprp_encrypt(&key, &payload).unwrap();
//! assert_eq!(sprp_decrypt(&key, &wrapped).unwrap(), payload);
//! ```
//!
//! ### Erasure coding
//!
//! ```rust
//! use libmix_crypto::fec::FecCode;
//!
//! let code = FecCode::new(2, 3).unwrap();
//! let source: [&[u8]; 2] = [b"left", b"rght"];
//! let repair = code.encode(&source, 2).unwrap();
//!
//! let rebuilt = code.decode(&[&repair, b"rght"], &[2, 1]).unwrap();
//! assert_eq!(rebuilt[0], b"left");
//! ```
//!
//! ## Security Considerations
//!
//! SHA-1, MD5 and TLS 1.0 constructions are kept for wire compatibility with
//! deployed Type III relays, not for their strength.
//!
//! - Constant-time comparisons for digests and MACs (using `subtle` crate)
//! - Secret key schedules wiped on drop (using `zeroize` crate)
//!
//! ## License
//!
//! MIT OR Apache-2.0

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

// Re-export commonly used items at crate root
pub use compress::{compress, decompress, CompressError, ZLIB_MAGIC};
pub use fec::{FecCode, FecError};
pub use hash::{
    digest_eq, hash, hash_concat, hmac_md5, hmac_sha1, md5_concat, sub_key, Digest20,
    HASH_LEN, KEY_LEN, MD5_LEN,
};
pub use pk::{PkError, PrivateKey, PublicKey, OAEP_LABEL, PK_ENC_LEN, PK_MAX_DATA, PK_OVERHEAD};
pub use prng::{apply_keystream, create_prng, encrypt};
pub use random::{fill_random, random_bytes, random_vec, RandomError};
pub use sprp::{sprp_decrypt, sprp_encrypt, Lioness, SprpError, SPRP_KEY_LEN};

/// SHA-1 digests and key derivation
pub mod hash;

/// AES-CTR keystream generator
pub mod prng;

/// LIONESS wide-block cipher
pub mod sprp;

/// Vandermonde erasure code
pub mod fec;

/// zlib payload compression
pub mod compress;

/// RSA packet keys and signatures
pub mod pk;

/// Cryptographically secure random number generation
pub mod random;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = "libmix-crypto";

/// Prelude module for convenient imports
pub mod prelude {
    //! Convenient imports for common use cases
    //!
    //! ```rust
    //! use libmix_crypto::prelude::*;
    //! ```

    pub use crate::hash::{hash, hash_concat, sub_key, Digest20, HASH_LEN, KEY_LEN};
    pub use crate::prng::{create_prng, encrypt};
    pub use crate::sprp::{sprp_decrypt, sprp_encrypt, SPRP_KEY_LEN};
    pub use crate::fec::FecCode;
    pub use crate::pk::{PrivateKey, PublicKey};
    pub use crate::random::{random_bytes, random_vec};
}
