// session.rs - per-connection state: cipher chains, counters, flags, timers

use crate::crypto::cbc::CbcState;
use crate::crypto::handshake::Credentials;

/// State established by a successful handshake and discarded on disconnect.
#[derive(Debug)]
pub struct Session {
    cbc: CbcState,
    salt: [u8; 8],
    message_id: u16,
    token: u8,
    pub expecting_ping_ack: bool,
    pub updating: bool,
    pub last_message_millis: u32,
    pub last_chunk_millis: u32,
    pub chunk_index: u16,
}

impl Session {
    pub fn new(credentials: &Credentials, now: u32) -> Self {
        Self {
            cbc: CbcState::new(&credentials.session_key, &credentials.iv),
            salt: credentials.salt,
            message_id: credentials.message_id_seed,
            token: credentials.token_seed,
            expecting_ping_ack: false,
            updating: false,
            last_message_millis: now,
            last_chunk_millis: now,
            chunk_index: 0,
        }
    }

    /// Pre-incremented message id; strictly monotonic modulo 2^16.
    pub fn next_message_id(&mut self) -> u16 {
        self.message_id = self.message_id.wrapping_add(1);
        self.message_id
    }

    /// Pre-incremented token correlator.
    pub fn next_token(&mut self) -> u8 {
        self.token = self.token.wrapping_add(1);
        self.token
    }

    pub fn cbc(&mut self) -> &mut CbcState {
        &mut self.cbc
    }

    /// Reserved for a future rekeying protocol.
    #[must_use]
    pub fn salt(&self) -> &[u8; 8] {
        &self.salt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::handshake::CREDENTIALS_LENGTH;

    fn session_with_seed(raw: [u8; CREDENTIALS_LENGTH]) -> Session {
        Session::new(&Credentials::parse(&raw), 0)
    }

    #[test]
    fn message_ids_ascend_from_the_credential_seed() {
        let mut raw = [0u8; CREDENTIALS_LENGTH];
        raw[32] = 0x20;
        raw[33] = 0x21;
        let mut session = session_with_seed(raw);

        assert_eq!(session.next_message_id(), 0x2022);
        assert_eq!(session.next_message_id(), 0x2023);
        assert_eq!(session.next_message_id(), 0x2024);
    }

    #[test]
    fn message_id_wraps_at_sixteen_bits() {
        let mut raw = [0u8; CREDENTIALS_LENGTH];
        raw[32] = 0xff;
        raw[33] = 0xfe;
        let mut session = session_with_seed(raw);

        assert_eq!(session.next_message_id(), 0xffff);
        assert_eq!(session.next_message_id(), 0x0000);
        assert_eq!(session.next_message_id(), 0x0001);
    }

    #[test]
    fn tokens_ascend_and_wrap() {
        let mut raw = [0u8; CREDENTIALS_LENGTH];
        raw[34] = 0xfe;
        let mut session = session_with_seed(raw);

        assert_eq!(session.next_token(), 0xff);
        assert_eq!(session.next_token(), 0x00);
    }

    #[test]
    fn fresh_session_has_no_pending_state() {
        let session = session_with_seed([7u8; CREDENTIALS_LENGTH]);
        assert!(!session.expecting_ping_ack);
        assert!(!session.updating);
        assert_eq!(session.chunk_index, 0);
    }
}
