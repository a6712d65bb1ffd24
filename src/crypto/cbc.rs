// AES-128-CBC record protection with frame-chained IVs.
//
// The send chain continues standard CBC across frames: after encrypting a
// frame, the last ciphertext block becomes the IV of the next frame. The
// receive chain is keyed off the peer's framing instead: the first ciphertext
// block of frame N+1 is the IV used to decrypt frame N+1, captured before the
// frame is decrypted in place.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use thiserror::Error;

/// AES block and IV length.
pub const BLOCK_LEN: usize = 16;

/// Session key length (AES-128).
pub const KEY_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CbcError {
    /// Ciphertext or plaintext region is empty or not block-aligned.
    #[error("buffer length {0} is not a positive multiple of {BLOCK_LEN}")]
    Misaligned(usize),
}

/// Both directions of the session cipher plus their chained IVs.
pub struct CbcState {
    cipher: Aes128,
    iv_send: [u8; BLOCK_LEN],
    iv_receive: [u8; BLOCK_LEN],
}

impl CbcState {
    /// Builds the session cipher; both chains start from the same IV, as
    /// delivered in the handshake credentials.
    #[must_use]
    pub fn new(key: &[u8; KEY_LEN], iv: &[u8; BLOCK_LEN]) -> Self {
        Self {
            cipher: Aes128::new(GenericArray::from_slice(key)),
            iv_send: *iv,
            iv_receive: *iv,
        }
    }

    /// Encrypts a padded frame in place and advances the send chain to the
    /// last ciphertext block.
    pub fn encrypt_in_place(&mut self, buf: &mut [u8]) -> Result<(), CbcError> {
        if buf.is_empty() || buf.len() % BLOCK_LEN != 0 {
            return Err(CbcError::Misaligned(buf.len()));
        }

        let mut chain = self.iv_send;
        for block in buf.chunks_exact_mut(BLOCK_LEN) {
            for (byte, prev) in block.iter_mut().zip(chain.iter()) {
                *byte ^= prev;
            }
            self.cipher
                .encrypt_block(GenericArray::from_mut_slice(block));
            chain.copy_from_slice(block);
        }
        self.iv_send = chain;
        Ok(())
    }

    /// Decrypts a received frame in place. The first ciphertext block is
    /// captured before decryption and becomes the next receive IV.
    pub fn decrypt_in_place(&mut self, buf: &mut [u8]) -> Result<(), CbcError> {
        if buf.is_empty() || buf.len() % BLOCK_LEN != 0 {
            return Err(CbcError::Misaligned(buf.len()));
        }

        let mut next_iv = [0u8; BLOCK_LEN];
        next_iv.copy_from_slice(&buf[..BLOCK_LEN]);

        let mut chain = self.iv_receive;
        for block in buf.chunks_exact_mut(BLOCK_LEN) {
            let mut ciphertext = [0u8; BLOCK_LEN];
            ciphertext.copy_from_slice(block);
            self.cipher
                .decrypt_block(GenericArray::from_mut_slice(block));
            for (byte, prev) in block.iter_mut().zip(chain.iter()) {
                *byte ^= prev;
            }
            chain = ciphertext;
        }
        self.iv_receive = next_iv;
        Ok(())
    }

    #[must_use]
    pub fn iv_send(&self) -> &[u8; BLOCK_LEN] {
        &self.iv_send
    }

    #[must_use]
    pub fn iv_receive(&self) -> &[u8; BLOCK_LEN] {
        &self.iv_receive
    }
}

impl std::fmt::Debug for CbcState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.debug_struct("CbcState").finish_non_exhaustive()
    }
}
