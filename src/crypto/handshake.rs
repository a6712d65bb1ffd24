// Handshake credential crypto: RSA-PKCS1 envelopes, the HMAC binding, and
// the server signature check.

use hmac::{Hmac, Mac};
use rsa::pkcs1::EncodeRsaPublicKey;
use rsa::{Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use thiserror::Error;

type HmacSha1 = Hmac<Sha1>;

/// Length of the server nonce opening the handshake.
pub const NONCE_LENGTH: usize = 40;

/// Raw device identifier length.
pub const DEVICE_ID_LENGTH: usize = 12;

/// Length of the decrypted credential block.
pub const CREDENTIALS_LENGTH: usize = 40;

/// RSA ciphertext wrapping the credentials (device key is 1024-bit).
pub const CREDENTIALS_CIPHERTEXT_LENGTH: usize = 128;

/// Server signature length (server key is 2048-bit).
pub const SIGNATURE_LENGTH: usize = 256;

/// Credentials ciphertext plus trailing signature.
pub const HANDSHAKE_REPLY_LENGTH: usize = CREDENTIALS_CIPHERTEXT_LENGTH + SIGNATURE_LENGTH;

/// Device proof ciphertext produced under the server public key.
pub const DEVICE_PROOF_LENGTH: usize = 256;

const HMAC_LENGTH: usize = 20;

#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The credential block did not decrypt under the device private key.
    #[error("credential decryption failed")]
    CredentialDecrypt,
    /// The server signature over the credential HMAC did not verify.
    #[error("credential signature verification failed")]
    SignatureMismatch,
    /// The handshake reply had the wrong shape.
    #[error("handshake reply length {0}, expected {HANDSHAKE_REPLY_LENGTH}")]
    MalformedReply(usize),
    /// The device public key could not be DER-encoded.
    #[error("device public key encoding failed")]
    PublicKeyEncoding,
    /// RSA encryption of the device proof failed.
    #[error("rsa error: {0}")]
    Rsa(#[from] rsa::Error),
}

/// Session material unpacked from the 40 decrypted credential bytes.
///
/// The counter seeds deliberately overlap the salt: bytes 32..40 are the
/// salt, while 32..34 seed the message id, 34 the token, and 35..39 the
/// PRNG. This aliasing is part of the wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub session_key: [u8; 16],
    pub iv: [u8; 16],
    pub salt: [u8; 8],
    pub message_id_seed: u16,
    pub token_seed: u8,
    pub prng_seed: u32,
}

impl Credentials {
    #[must_use]
    pub fn parse(raw: &[u8; CREDENTIALS_LENGTH]) -> Self {
        let mut session_key = [0u8; 16];
        let mut iv = [0u8; 16];
        let mut salt = [0u8; 8];
        session_key.copy_from_slice(&raw[..16]);
        iv.copy_from_slice(&raw[16..32]);
        salt.copy_from_slice(&raw[32..40]);

        Self {
            session_key,
            iv,
            salt,
            message_id_seed: u16::from_be_bytes([raw[32], raw[33]]),
            token_seed: raw[34],
            prng_seed: u32::from_le_bytes([raw[35], raw[36], raw[37], raw[38]]),
        }
    }
}

/// DER encoding (PKCS#1) of the public key derived from the device private
/// key, as placed in the handshake cleartext.
pub fn device_public_key_der(device_private: &RsaPrivateKey) -> Result<Vec<u8>, HandshakeError> {
    device_private
        .to_public_key()
        .to_pkcs1_der()
        .map(|der| der.as_bytes().to_vec())
        .map_err(|_| HandshakeError::PublicKeyEncoding)
}

/// Encrypts the nonce/id/pubkey cleartext under the server public key,
/// producing the fixed-size device proof.
pub fn encrypt_device_proof(
    server_public: &RsaPublicKey,
    cleartext: &[u8],
) -> Result<Vec<u8>, HandshakeError> {
    let ciphertext = server_public.encrypt(&mut rand::rngs::OsRng, Pkcs1v15Encrypt, cleartext)?;
    debug_assert_eq!(ciphertext.len(), DEVICE_PROOF_LENGTH);
    Ok(ciphertext)
}

/// Decrypts the 128-byte credential ciphertext with the device private key.
/// Any failure, including a wrong-length plaintext, is a decrypt failure.
pub fn decipher_credentials(
    device_private: &RsaPrivateKey,
    ciphertext: &[u8],
) -> Result<[u8; CREDENTIALS_LENGTH], HandshakeError> {
    let plaintext = device_private
        .decrypt(Pkcs1v15Encrypt, ciphertext)
        .map_err(|_| HandshakeError::CredentialDecrypt)?;
    plaintext
        .as_slice()
        .try_into()
        .map_err(|_| HandshakeError::CredentialDecrypt)
}

/// HMAC-SHA1 binding the credential ciphertext to its plaintext: keyed by
/// the 40 decrypted credential bytes, taken over the 128 ciphertext bytes.
#[must_use]
pub fn ciphertext_hmac(
    credentials: &[u8; CREDENTIALS_LENGTH],
    ciphertext: &[u8],
) -> [u8; HMAC_LENGTH] {
    let mut mac =
        HmacSha1::new_from_slice(credentials).expect("hmac accepts any key length");
    mac.update(ciphertext);
    let digest = mac.finalize().into_bytes();
    let mut out = [0u8; HMAC_LENGTH];
    out.copy_from_slice(&digest);
    out
}

/// Verifies the server's raw (unprefixed) PKCS#1 v1.5 signature over the
/// credential HMAC.
pub fn verify_server_signature(
    server_public: &RsaPublicKey,
    hmac: &[u8; HMAC_LENGTH],
    signature: &[u8],
) -> Result<(), HandshakeError> {
    server_public
        .verify(Pkcs1v15Sign::new_unprefixed(), hmac, signature)
        .map_err(|_| HandshakeError::SignatureMismatch)
}

/// Runs the credential side of the handshake over the 384-byte reply:
/// decrypt, bind, verify, unpack.
pub fn verify_and_decrypt(
    server_public: &RsaPublicKey,
    device_private: &RsaPrivateKey,
    reply: &[u8],
) -> Result<Credentials, HandshakeError> {
    if reply.len() != HANDSHAKE_REPLY_LENGTH {
        return Err(HandshakeError::MalformedReply(reply.len()));
    }
    let (ciphertext, signature) = reply.split_at(CREDENTIALS_CIPHERTEXT_LENGTH);

    let credentials = decipher_credentials(device_private, ciphertext)?;
    let hmac = ciphertext_hmac(&credentials, ciphertext);
    verify_server_signature(server_public, &hmac, signature)?;

    Ok(Credentials::parse(&credentials))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn sample_credentials() -> [u8; CREDENTIALS_LENGTH] {
        let mut raw = [0u8; CREDENTIALS_LENGTH];
        for (i, byte) in raw.iter_mut().enumerate() {
            *byte = i as u8;
        }
        raw
    }

    /// Server-side construction of the signed credential reply.
    fn build_reply(
        device_public: &RsaPublicKey,
        server_private: &RsaPrivateKey,
        credentials: &[u8; CREDENTIALS_LENGTH],
    ) -> Vec<u8> {
        let ciphertext = device_public
            .encrypt(&mut OsRng, Pkcs1v15Encrypt, credentials)
            .unwrap();
        assert_eq!(ciphertext.len(), CREDENTIALS_CIPHERTEXT_LENGTH);
        let hmac = ciphertext_hmac(credentials, &ciphertext);
        let signature = server_private
            .sign(Pkcs1v15Sign::new_unprefixed(), &hmac)
            .unwrap();
        assert_eq!(signature.len(), SIGNATURE_LENGTH);

        let mut reply = ciphertext;
        reply.extend_from_slice(&signature);
        reply
    }

    #[test]
    fn credentials_unpack_with_overlapping_seeds() {
        let creds = Credentials::parse(&sample_credentials());

        let mut expected_key = [0u8; 16];
        for (i, byte) in expected_key.iter_mut().enumerate() {
            *byte = i as u8;
        }
        assert_eq!(creds.session_key, expected_key);
        assert_eq!(creds.iv[0], 16);
        assert_eq!(creds.iv[15], 31);
        assert_eq!(creds.salt, [32, 33, 34, 35, 36, 37, 38, 39]);

        // Seeds alias the salt bytes.
        assert_eq!(creds.message_id_seed, 0x2021);
        assert_eq!(creds.token_seed, 0x22);
        assert_eq!(creds.prng_seed, u32::from_le_bytes([0x23, 0x24, 0x25, 0x26]));
    }

    #[test]
    fn reply_round_trip_verifies_and_unpacks() {
        let device_private = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let server_private = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
        let server_public = server_private.to_public_key();

        let raw = sample_credentials();
        let reply = build_reply(&device_private.to_public_key(), &server_private, &raw);

        let creds = verify_and_decrypt(&server_public, &device_private, &reply).unwrap();
        assert_eq!(creds, Credentials::parse(&raw));
    }

    #[test]
    fn tampered_signature_is_a_signature_mismatch() {
        let device_private = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let server_private = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();

        let mut reply = build_reply(
            &device_private.to_public_key(),
            &server_private,
            &sample_credentials(),
        );
        *reply.last_mut().unwrap() ^= 0x01;

        let err =
            verify_and_decrypt(&server_private.to_public_key(), &device_private, &reply)
                .unwrap_err();
        assert!(matches!(err, HandshakeError::SignatureMismatch));
    }

    #[test]
    fn garbage_ciphertext_is_a_decrypt_failure() {
        let device_private = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let server_private = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();

        let mut reply = vec![0x5a; HANDSHAKE_REPLY_LENGTH];
        reply[..4].copy_from_slice(&[1, 2, 3, 4]);

        let err =
            verify_and_decrypt(&server_private.to_public_key(), &device_private, &reply)
                .unwrap_err();
        assert!(matches!(err, HandshakeError::CredentialDecrypt));
    }

    #[test]
    fn short_reply_is_malformed() {
        let device_private = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let server_public = device_private.to_public_key();
        let err = verify_and_decrypt(&server_public, &device_private, &[0u8; 100]).unwrap_err();
        assert!(matches!(err, HandshakeError::MalformedReply(100)));
    }

    #[test]
    fn device_proof_fits_the_server_key() {
        let device_private = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let server_private = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
        let server_public = server_private.to_public_key();

        let der = device_public_key_der(&device_private).unwrap();
        let mut cleartext = vec![0u8; NONCE_LENGTH + DEVICE_ID_LENGTH];
        cleartext.extend_from_slice(&der);

        let proof = encrypt_device_proof(&server_public, &cleartext).unwrap();
        assert_eq!(proof.len(), DEVICE_PROOF_LENGTH);

        let recovered = server_private.decrypt(Pkcs1v15Encrypt, &proof).unwrap();
        assert_eq!(recovered, cleartext);
    }
}
