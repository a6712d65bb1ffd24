// Cryptographic plumbing: the CBC record layer and handshake credentials.

pub mod cbc;
pub mod handshake;
