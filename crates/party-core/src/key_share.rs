//! Key-share decryption. Builds an OAEP context binding user id, party
//! keys, data indices (or streaming window), analysis type, algorithm, and
//! recipient key, and decrypts under it; the context doubles as the OAEP
//! label, so tampering with any bound field surfaces as a plain integrity
//! failure rather than a silent mismatch.

use rsa::{Oaep, RsaPublicKey};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::DecryptError;
use crate::party_keys::PartyKeys;

const SEP_DISCRETE: u8 = 0x01;
const SEP_STREAMING: u8 = 0x02;

fn le64(v: u64) -> [u8; 8] {
    v.to_le_bytes()
}

/// Reassembled fresh for every decryption; never cached or stored.
fn build_context(
    keys: &PartyKeys,
    separator: u8,
    user_id: &str,
    algorithm: &str,
    indices_blob: &[u8],
    analysis_type: &str,
) -> anyhow::Result<Vec<u8>> {
    let mut context = Vec::new();
    context.push(separator);
    context.extend_from_slice(user_id.as_bytes());
    context.extend_from_slice(&keys.party_keys_der_concatenated()?);
    context.extend_from_slice(indices_blob);
    context.extend_from_slice(analysis_type.as_bytes());
    context.extend_from_slice(algorithm.as_bytes());
    context.extend_from_slice(&keys.my_public_key_der()?);
    Ok(context)
}

fn indices_blob_discrete(indices: &[u64]) -> Vec<u8> {
    indices.iter().flat_map(|&d| le64(d)).collect()
}

fn indices_blob_streaming(begin_ms: u64, end_ms: u64) -> Vec<u8> {
    let mut blob = Vec::with_capacity(16);
    blob.extend_from_slice(&le64(begin_ms));
    blob.extend_from_slice(&le64(end_ms));
    blob
}

fn decrypt_under_context(
    keys: &PartyKeys,
    context: &[u8],
    envelope: &[u8],
) -> Result<Zeroizing<Vec<u8>>, DecryptError> {
    // `Oaep::new_with_label` takes its label as a string, so the binary
    // context is hex-encoded rather than passed as raw bytes.
    let padding = Oaep::new_with_label::<Sha256, _>(hex::encode(context));
    keys.my_private_key
        .decrypt(padding, envelope)
        .map(Zeroizing::new)
        .map_err(|_| DecryptError::Tag)
}

/// Context is bound to the exact set of data indices requested, so a
/// decryptor cannot be reused across requests.
pub fn decrypt_discrete(
    keys: &PartyKeys,
    user_id: &str,
    algorithm: &str,
    indices: &[u64],
    analysis_type: &str,
    envelope: &[u8],
) -> Result<Zeroizing<Vec<u8>>, DecryptError> {
    let blob = indices_blob_discrete(indices);
    let context = build_context(keys, SEP_DISCRETE, user_id, algorithm, &blob, analysis_type)
        .map_err(|_| DecryptError::Tag)?;
    decrypt_under_context(keys, &context, envelope)
}

/// Rejects outside `[stream_begin, stream_end)` before touching RSA at all.
pub fn decrypt_streaming(
    keys: &PartyKeys,
    user_id: &str,
    algorithm: &str,
    stream_begin_ms: u64,
    stream_end_ms: u64,
    analysis_type: &str,
    envelope: &[u8],
    now_ms: u64,
) -> Result<Zeroizing<Vec<u8>>, DecryptError> {
    if !(stream_begin_ms <= now_ms && now_ms < stream_end_ms) {
        return Err(DecryptError::Time);
    }
    let blob = indices_blob_streaming(stream_begin_ms, stream_end_ms);
    let context = build_context(keys, SEP_STREAMING, user_id, algorithm, &blob, analysis_type)
        .map_err(|_| DecryptError::Tag)?;
    decrypt_under_context(keys, &context, envelope)
}

/// Nonce/associated-data derivation for distributed re-encryption:
/// `SHA-256(context)[..12]` as nonce, full context as associated data.
pub fn derive_dist_enc_params(
    keys: &PartyKeys,
    user_id: &str,
    computation_id: &str,
    analysis_type: &str,
) -> anyhow::Result<([u8; 12], Vec<u8>)> {
    use sha2::Digest;

    let mut context = Vec::new();
    context.extend_from_slice(user_id.as_bytes());
    context.extend_from_slice(&keys.party_keys_der_concatenated()?);
    context.extend_from_slice(computation_id.as_bytes());
    context.extend_from_slice(analysis_type.as_bytes());

    let digest = Sha256::digest(&context);
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&digest[..12]);
    Ok((nonce, context))
}

#[allow(dead_code)]
fn encrypt_for_tests(
    recipient: &RsaPublicKey,
    context: &[u8],
    plaintext: &[u8],
) -> Vec<u8> {
    let padding = Oaep::new_with_label::<Sha256, _>(hex::encode(context));
    let mut rng = rand::thread_rng();
    recipient.encrypt(&mut rng, padding, plaintext).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::EncodePrivateKey;
    use rsa::RsaPrivateKey;

    fn test_keys(party_index: u8) -> PartyKeys {
        let mut rng = rand::thread_rng();
        let privs: Vec<RsaPrivateKey> = (0..3)
            .map(|_| RsaPrivateKey::new(&mut rng, 1024).unwrap())
            .collect();
        let pubs: [RsaPublicKey; 3] = [
            RsaPublicKey::from(&privs[0]),
            RsaPublicKey::from(&privs[1]),
            RsaPublicKey::from(&privs[2]),
        ];
        PartyKeys {
            party_index,
            party_pubkeys: pubs,
            my_private_key: privs[party_index as usize].clone(),
        }
    }

    #[test]
    fn round_trips_discrete_envelope() {
        let keys = test_keys(0);
        let indices = vec![1u64, 2, 3];
        let blob = indices_blob_discrete(&indices);
        let context =
            build_context(&keys, SEP_DISCRETE, "user-1", "AES-128", &blob, "heartbeat").unwrap();
        let plaintext = vec![7u8; 16];
        let envelope = encrypt_for_tests(keys.my_public_key(), &context, &plaintext);

        let decrypted =
            decrypt_discrete(&keys, "user-1", "AES-128", &indices, "heartbeat", &envelope).unwrap();
        assert_eq!(*decrypted, plaintext);
    }

    #[test]
    fn tamper_with_user_id_fails_integrity() {
        let keys = test_keys(0);
        let indices = vec![1u64];
        let blob = indices_blob_discrete(&indices);
        let context =
            build_context(&keys, SEP_DISCRETE, "user-1", "AES-128", &blob, "heartbeat").unwrap();
        let envelope = encrypt_for_tests(keys.my_public_key(), &context, &vec![1u8; 16]);

        let result = decrypt_discrete(&keys, "user-2", "AES-128", &indices, "heartbeat", &envelope);
        assert!(matches!(result, Err(DecryptError::Tag)));
    }

    #[test]
    fn streaming_outside_window_is_time_error() {
        let keys = test_keys(0);
        let result = decrypt_streaming(
            &keys, "user-1", "AES-128", 1_000, 2_000, "heartbeat", &[0u8; 16], 5_000,
        );
        assert!(matches!(result, Err(DecryptError::Time)));
    }

    #[test]
    fn streaming_within_window_decrypts() {
        let keys = test_keys(1);
        let blob = indices_blob_streaming(1_000, 2_000);
        let context =
            build_context(&keys, SEP_STREAMING, "user-1", "AES-128", &blob, "heartbeat").unwrap();
        let plaintext = vec![9u8; 176];
        let envelope = encrypt_for_tests(keys.my_public_key(), &context, &plaintext);

        let decrypted = decrypt_streaming(
            &keys, "user-1", "AES-128", 1_000, 2_000, "heartbeat", &envelope, 1_500,
        )
        .unwrap();
        assert_eq!(*decrypted, plaintext);
    }

    #[test]
    fn discrete_and_streaming_contexts_never_cross_accept() {
        let keys = test_keys(2);
        let indices = vec![42u64];
        let discrete_blob = indices_blob_discrete(&indices);
        let discrete_context =
            build_context(&keys, SEP_DISCRETE, "u", "AES-128", &discrete_blob, "heartbeat").unwrap();
        let envelope = encrypt_for_tests(keys.my_public_key(), &discrete_context, &vec![3u8; 16]);

        let result = decrypt_streaming(
            &keys, "u", "AES-128", 42, 43, "heartbeat", &envelope, 42,
        );
        assert!(matches!(result, Err(DecryptError::Tag)));
    }
}
