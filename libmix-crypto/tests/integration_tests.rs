//! Integration tests for libmix-crypto
//!
//! These tests verify that all components work together correctly.

use libmix_crypto::*;

mod sprp_tests {
    use super::*;

    #[test]
    fn test_payload_layers_unwrap_in_reverse() {
        let secrets: Vec<[u8; KEY_LEN]> = (0..4u8).map(|i| [i; KEY_LEN]).collect();
        let payload: Vec<u8> = (0..28672).map(|i| (i % 251) as u8).collect();

        let mut wrapped = payload.clone();
        for secret in secrets.iter().rev() {
            let key = hash_concat(&[secret, b"PAYLOAD ENCRYPT"]);
            wrapped = sprp_encrypt(&key, &wrapped).unwrap();
        }
        assert_ne!(wrapped, payload);

        for secret in &secrets {
            let key = hash_concat(&[secret, b"PAYLOAD ENCRYPT"]);
            wrapped = sprp_decrypt(&key, &wrapped).unwrap();
        }
        assert_eq!(wrapped, payload);
    }

    #[test]
    fn test_lioness_reusable_schedule() {
        let lioness = Lioness::new(&[0xEEu8; SPRP_KEY_LEN]);
        let mut a = vec![1u8; 2048];
        let mut b = vec![1u8; 2048];
        lioness.encrypt(&mut a).unwrap();
        lioness.encrypt(&mut b).unwrap();
        assert_eq!(a, b);
        lioness.decrypt(&mut a).unwrap();
        assert_eq!(a, vec![1u8; 2048]);
    }
}

mod fec_tests {
    use super::*;
    use proptest::prelude::*;

    fn source_shares(k: usize, len: usize, seed: u8) -> Vec<Vec<u8>> {
        let key = [seed; KEY_LEN];
        let stream = create_prng(&key, k * len);
        stream.chunks(len).map(|c| c.to_vec()).collect()
    }

    #[test]
    fn test_every_k_subset_of_small_code() {
        let (k, n) = (3usize, 4usize);
        let code = FecCode::new(k, n).unwrap();
        let source = source_shares(k, 40, 1);
        let refs: Vec<&[u8]> = source.iter().map(|s| s.as_slice()).collect();
        let shares = code.encode_all(&refs).unwrap();

        for skip in 0..n {
            let indices: Vec<usize> = (0..n).filter(|&i| i != skip).collect();
            let subset: Vec<&[u8]> = indices.iter().map(|&i| shares[i].as_slice()).collect();
            assert_eq!(code.decode(&subset, &indices).unwrap(), source);
        }
    }

    #[test]
    fn test_fragment_sized_code() {
        // Largest group used for fragments: k = 16, n = 22
        let code = FecCode::new(16, 22).unwrap();
        let source = source_shares(16, 256, 2);
        let refs: Vec<&[u8]> = source.iter().map(|s| s.as_slice()).collect();
        let shares = code.encode_all(&refs).unwrap();

        let indices: Vec<usize> = (6..22).collect();
        let subset: Vec<&[u8]> = indices.iter().map(|&i| shares[i].as_slice()).collect();
        assert_eq!(code.decode(&subset, &indices).unwrap(), source);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_any_k_of_n_reconstructs(
            k in 1usize..=16,
            extra in 0usize..=6,
            len in 1usize..64,
            seed in any::<u8>(),
            order in any::<u64>(),
        ) {
            let n = k + extra;
            let code = FecCode::new(k, n).unwrap();
            let source = source_shares(k, len, seed);
            let refs: Vec<&[u8]> = source.iter().map(|s| s.as_slice()).collect();
            let shares = code.encode_all(&refs).unwrap();

            // deterministic pseudo-random choice of k indices
            let mut indices: Vec<usize> = (0..n).collect();
            let mut state = order | 1;
            for i in (1..n).rev() {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let j = (state >> 33) as usize % (i + 1);
                indices.swap(i, j);
            }
            indices.truncate(k);

            let subset: Vec<&[u8]> = indices.iter().map(|&i| shares[i].as_slice()).collect();
            prop_assert_eq!(code.decode(&subset, &indices).unwrap(), source);
        }
    }
}

mod pk_tests {
    use super::*;

    const KEY_PEM: &str = include_str!("fixtures/rsa2048.pem");

    #[test]
    fn test_seal_sub_header_sized_block() {
        let key = PrivateKey::from_pkcs1_pem(KEY_PEM).unwrap();
        let public = PublicKey::from_pkcs1_der(&key.public_key().to_pkcs1_der().unwrap()).unwrap();

        let block = create_prng(&[4u8; KEY_LEN], PK_MAX_DATA);
        let sealed = public.oaep_encrypt(&block).unwrap();
        assert_eq!(sealed.len(), PK_ENC_LEN);
        assert_eq!(key.oaep_decrypt(&sealed).unwrap(), block);
    }

    #[test]
    fn test_tls_style_signature() {
        let key = PrivateKey::from_pkcs1_pem(KEY_PEM).unwrap();
        let params = b"dh params";
        let mut digest = md5_concat(&[b"client", b"server", params]).to_vec();
        digest.extend_from_slice(&hash_concat(&[b"client", b"server", params]));
        assert_eq!(digest.len(), MD5_LEN + HASH_LEN);

        let sig = key.sign_raw(&digest).unwrap();
        key.public_key().verify_raw(&digest, &sig).unwrap();
    }
}

mod compress_tests {
    use super::*;

    #[test]
    fn test_random_data_survives() {
        let data = random_vec(5000).unwrap();
        let packed = compress(&data).unwrap();
        assert_eq!(&packed[..2], &ZLIB_MAGIC);
        assert_eq!(decompress(&packed, 5000).unwrap(), data);
    }
}
