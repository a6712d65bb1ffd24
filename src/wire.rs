// Frame codec: PKCS#7-padded AES-CBC envelopes behind a two-byte length
// prefix, plus the builders for every outbound message.
//
// Builders write plaintext into the staging buffer starting two bytes in and
// return the message length; `wrap` pads, encrypts, and fills the prefix.

use std::ops::Range;

use thiserror::Error;

use crate::api::{Descriptor, VariableValue, MAX_FUNCTION_KEY_LENGTH, MAX_VARIABLE_KEY_LENGTH};
use crate::coap::{self, delta, PAYLOAD_MARKER};
use crate::crypto::cbc::{CbcError, CbcState, BLOCK_LEN};
use crate::events::{EventType, SubscriptionScope, MAX_EVENT_NAME_LENGTH};

/// Size of the shared staging area for one frame of ciphertext.
pub const QUEUE_SIZE: usize = 640;

/// Big-endian length prefix preceding every encrypted frame.
pub const LENGTH_PREFIX: usize = 2;

/// Largest plaintext message accepted by [`wrap`].
pub const MAX_MESSAGE_LENGTH: usize = QUEUE_SIZE - LENGTH_PREFIX;

/// Default event time-to-live; omitted from the wire when unchanged.
pub const DEFAULT_EVENT_TTL: u32 = 60;

/// Response codes for a received firmware chunk.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkReceivedCode {
    /// 2.04 Changed: chunk stored, send the next one.
    Ok = 0x44,
    /// 4.00 Bad Request: CRC mismatch, resend.
    Bad = 0x80,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// Plaintext too long for the staging buffer.
    #[error("message length {len} exceeds maximum {max}")]
    MessageTooLong { len: usize, max: usize },
    /// Staging buffer cannot hold the padded frame.
    #[error("buffer too short: need {needed} bytes, have {have}")]
    BufferTooShort { needed: usize, have: usize },
    /// Ciphertext region was not block-aligned.
    #[error(transparent)]
    Cbc(#[from] CbcError),
}

/// Padded frame length for a message of `msglen` bytes: the next multiple of
/// 16, always strictly greater (a full pad block when already aligned).
#[must_use]
pub const fn padded_len(msglen: usize) -> usize {
    (msglen & !(BLOCK_LEN - 1)) + BLOCK_LEN
}

/// Pads, encrypts, and length-prefixes the message staged at
/// `buf[LENGTH_PREFIX..LENGTH_PREFIX + msglen]`. Returns the wire length.
pub fn wrap(buf: &mut [u8], msglen: usize, cbc: &mut CbcState) -> Result<usize, WireError> {
    if msglen > MAX_MESSAGE_LENGTH {
        return Err(WireError::MessageTooLong {
            len: msglen,
            max: MAX_MESSAGE_LENGTH,
        });
    }
    let padded = padded_len(msglen);
    let total = LENGTH_PREFIX + padded;
    if buf.len() < total {
        return Err(WireError::BufferTooShort {
            needed: total,
            have: buf.len(),
        });
    }

    let pad = (padded - msglen) as u8;
    for byte in &mut buf[LENGTH_PREFIX + msglen..total] {
        *byte = pad;
    }
    cbc.encrypt_in_place(&mut buf[LENGTH_PREFIX..total])?;
    buf[0] = (padded >> 8) as u8;
    buf[1] = padded as u8;
    Ok(total)
}

/// Decrypts a received frame in place, advancing the receive IV chain.
/// PKCS#7 padding is left attached; callers read the final byte.
pub fn unwrap(buf: &mut [u8], cbc: &mut CbcState) -> Result<usize, WireError> {
    cbc.decrypt_in_place(buf)?;
    Ok(buf.len())
}

/// HELLO announcing product id, firmware version, and OTA status.
pub fn hello(
    buf: &mut [u8],
    message_id: u16,
    product_id: u16,
    firmware_version: u16,
    newly_upgraded: bool,
) -> usize {
    buf[0] = 0x50; // non-confirmable, no token
    buf[1] = coap::code::POST;
    buf[2..4].copy_from_slice(&message_id.to_be_bytes());
    buf[4] = 0xb1; // one-byte Uri-Path option
    buf[5] = b'h';
    buf[6] = PAYLOAD_MARKER;
    buf[7..9].copy_from_slice(&product_id.to_be_bytes());
    buf[9..11].copy_from_slice(&firmware_version.to_be_bytes());
    buf[11] = 0; // reserved flags
    buf[12] = newly_upgraded as u8;
    13
}

/// Confirmable keep-alive probe.
pub fn ping(buf: &mut [u8], message_id: u16) -> usize {
    buf[0] = 0x40; // confirmable, no token
    buf[1] = coap::code::EMPTY;
    buf[2..4].copy_from_slice(&message_id.to_be_bytes());
    4
}

/// Empty acknowledgment echoing the request's raw message id bytes.
pub fn empty_ack(buf: &mut [u8], message_id_msb: u8, message_id_lsb: u8) -> usize {
    buf[0] = 0x60; // acknowledgment, no token
    buf[1] = coap::code::EMPTY;
    buf[2] = message_id_msb;
    buf[3] = message_id_lsb;
    4
}

/// Piggybacked acknowledgment with a response code and token.
pub fn coded_ack(
    buf: &mut [u8],
    code: u8,
    message_id_msb: u8,
    message_id_lsb: u8,
    token: u8,
) -> usize {
    buf[0] = 0x61; // acknowledgment, one-byte token
    buf[1] = code;
    buf[2] = message_id_msb;
    buf[3] = message_id_lsb;
    buf[4] = token;
    5
}

/// Separately-sent response correlated by token, optionally carrying a short
/// payload (at most eight bytes in this protocol).
pub fn separate_response(
    buf: &mut [u8],
    message_id: u16,
    token: u8,
    code: u8,
    payload: &[u8],
) -> usize {
    debug_assert!(payload.len() <= 8, "separate responses carry short payloads");

    buf[0] = 0x51; // non-confirmable, one-byte token
    buf[1] = code;
    buf[2..4].copy_from_slice(&message_id.to_be_bytes());
    buf[4] = token;
    if payload.is_empty() {
        return 5;
    }
    buf[5] = PAYLOAD_MARKER;
    buf[6..6 + payload.len()].copy_from_slice(payload);
    6 + payload.len()
}

/// Function-call result: separate non-confirmable 2.04 with the 4-byte
/// big-endian return value.
pub fn function_return(buf: &mut [u8], message_id: u16, token: u8, return_value: i32) -> usize {
    separate_response(
        buf,
        message_id,
        token,
        coap::code::CHANGED,
        &return_value.to_be_bytes(),
    )
}

/// Retransmission request for a missed firmware chunk.
pub fn chunk_missed(buf: &mut [u8], message_id: u16, chunk_index: u16) -> usize {
    buf[0] = 0x40; // confirmable, no token
    buf[1] = coap::code::GET;
    buf[2..4].copy_from_slice(&message_id.to_be_bytes());
    buf[4] = 0xb1;
    buf[5] = b'c';
    buf[6] = PAYLOAD_MARKER;
    buf[7..9].copy_from_slice(&chunk_index.to_be_bytes());
    9
}

/// Piggybacked 2.05 carrying a typed variable value. Strings are truncated
/// to the staging capacity by the caller.
pub fn variable_value(
    buf: &mut [u8],
    token: u8,
    message_id_msb: u8,
    message_id_lsb: u8,
    value: &VariableValue,
) -> usize {
    buf[0] = 0x61; // acknowledgment, one-byte token
    buf[1] = coap::code::CONTENT;
    buf[2] = message_id_msb;
    buf[3] = message_id_lsb;
    buf[4] = token;
    buf[5] = PAYLOAD_MARKER;

    match value {
        VariableValue::Boolean(v) => {
            buf[6] = *v as u8;
            7
        }
        VariableValue::Int(v) => {
            buf[6..10].copy_from_slice(&v.to_be_bytes());
            10
        }
        VariableValue::Double(v) => {
            // Host float order, as consumed by the service.
            buf[6..14].copy_from_slice(&v.to_ne_bytes());
            14
        }
        VariableValue::Str(v) => {
            let len = v.len().min(buf.len() - 6);
            buf[6..6 + len].copy_from_slice(&v.as_bytes()[..len]);
            6 + len
        }
    }
}

/// DESCRIBE response: a piggybacked 2.05 whose payload is the JSON document
/// `{"f":[...function keys...],"v":{"name":type,...}}`.
pub fn description<D: Descriptor>(
    buf: &mut [u8],
    token: u8,
    message_id_msb: u8,
    message_id_lsb: u8,
    descriptor: &D,
) -> Result<usize, WireError> {
    buf[0] = 0x61;
    buf[1] = coap::code::CONTENT;
    buf[2] = message_id_msb;
    buf[3] = message_id_lsb;
    buf[4] = token;
    buf[5] = PAYLOAD_MARKER;

    let mut w = Cursor::new(buf, 6);
    w.put(b"{\"f\":[")?;
    for i in 0..descriptor.num_functions() {
        if i > 0 {
            w.put(b",")?;
        }
        w.put(b"\"")?;
        w.put(truncated(descriptor.function_key(i), MAX_FUNCTION_KEY_LENGTH))?;
        w.put(b"\"")?;
    }
    w.put(b"],\"v\":{")?;
    for i in 0..descriptor.num_variables() {
        if i > 0 {
            w.put(b",")?;
        }
        let key = descriptor.variable_key(i);
        let shown = truncated(key, MAX_VARIABLE_KEY_LENGTH);
        w.put(b"\"")?;
        w.put(shown)?;
        w.put(b"\":")?;
        // Unregistered keys cannot appear here; fall back to the string tag.
        let tag = descriptor
            .variable_type(key)
            .map_or(b'4', |t| t.as_digit());
        w.put(&[tag])?;
    }
    w.put(b"}}")?;
    Ok(w.position())
}

fn truncated(key: &str, max: usize) -> &[u8] {
    let bytes = key.as_bytes();
    &bytes[..bytes.len().min(max)]
}

/// Outbound event publish.
pub fn event(
    buf: &mut [u8],
    message_id: u16,
    name: &str,
    data: Option<&[u8]>,
    ttl: u32,
    kind: EventType,
) -> Result<usize, WireError> {
    buf[0] = 0x50; // non-confirmable, no token
    buf[1] = coap::code::POST;
    buf[2..4].copy_from_slice(&message_id.to_be_bytes());

    let name_bytes = name.as_bytes();
    let name_bytes = &name_bytes[..name_bytes.len().min(MAX_EVENT_NAME_LENGTH)];

    let mut at = coap::option_encode(buf, 4, delta::URI_PATH, &[kind.path_char()]);
    for segment in name_bytes.split(|&b| b == b'/') {
        at = coap::option_encode(buf, at, delta::REPEAT, segment);
    }
    if ttl != DEFAULT_EVENT_TTL {
        let ttl_bytes = ttl.to_be_bytes();
        at = coap::option_encode(buf, at, delta::MAX_AGE_AFTER_PATH, &ttl_bytes[1..]);
    }
    if let Some(data) = data {
        let needed = at + 1 + data.len();
        if needed > buf.len() {
            return Err(WireError::BufferTooShort {
                needed,
                have: buf.len(),
            });
        }
        buf[at] = PAYLOAD_MARKER;
        buf[at + 1..needed].copy_from_slice(data);
        at = needed;
    }
    Ok(at)
}

/// Target half of a subscription announcement.
#[derive(Debug, Clone, Copy)]
pub enum SubscriptionTarget<'a> {
    /// Events from one specific device.
    DeviceId(&'a [u8]),
    /// Events matched by scope alone.
    Scope(SubscriptionScope),
}

/// Subscription announcement: confirmable POST to `e` with the filter and
/// target carried as Uri-Query options.
pub fn subscription(
    buf: &mut [u8],
    message_id: u16,
    filter: &[u8],
    target: SubscriptionTarget<'_>,
) -> Result<usize, WireError> {
    buf[0] = 0x40; // confirmable, no token
    buf[1] = coap::code::POST;
    buf[2..4].copy_from_slice(&message_id.to_be_bytes());

    let filter = &filter[..filter.len().min(MAX_EVENT_NAME_LENGTH)];
    let mut at = coap::option_encode(buf, 4, delta::URI_PATH, &[b'e']);
    at = coap::option_encode(buf, at, delta::QUERY_AFTER_PATH, filter);
    match target {
        SubscriptionTarget::DeviceId(id) => {
            at = coap::option_encode(buf, at, delta::REPEAT, id);
        }
        SubscriptionTarget::Scope(SubscriptionScope::MyDevices) => {
            at = coap::option_encode(buf, at, delta::REPEAT, b"u");
        }
        SubscriptionTarget::Scope(SubscriptionScope::Firehose) => {}
    }
    Ok(at)
}

/// Confirmable GET asking the server for wall-clock time.
pub fn time_request(buf: &mut [u8], message_id: u16, token: u8) -> usize {
    buf[0] = 0x41; // confirmable, one-byte token
    buf[1] = coap::code::GET;
    buf[2..4].copy_from_slice(&message_id.to_be_bytes());
    buf[4] = token;
    buf[5] = 0xb1;
    buf[6] = b't';
    7
}

/// Unencrypted local-network beacon announcing this device id. Sent outside
/// the session, so it is not wrapped.
pub fn presence_announcement(buf: &mut [u8], device_id: &[u8; 12]) -> usize {
    buf[0] = 0x50;
    buf[1] = coap::code::POST;
    buf[2] = 0x00; // message id carries no meaning here
    buf[3] = 0x00;
    buf[4] = 0xb1;
    buf[5] = b'h';
    buf[6] = PAYLOAD_MARKER;
    buf[7..19].copy_from_slice(device_id);
    19
}

/// In-place decode of an inbound EVENT frame: joins successive Uri-Path
/// segments with `/` (shifting bytes left when a segment used an extended
/// length encoding), skips an optional Max-Age, and delimits the payload by
/// the PKCS#7 pad. Returns the name range and payload range, or `None` for
/// a malformed frame.
pub fn decode_event(
    buf: &mut [u8],
    len: usize,
) -> Option<(Range<usize>, Option<Range<usize>>)> {
    if len < 6 || len > buf.len() {
        return None;
    }
    let pad = buf[len - 1] as usize;
    if pad == 0 || pad > BLOCK_LEN || pad >= len {
        return None;
    }
    let end = len - pad;

    let tkl = coap::token_length(buf[0]);
    let mut idx = 4 + tkl;

    // Endpoint discriminator option (`e` / `E`).
    let (vstart, vlen) = coap::option_decode(&buf[..end], idx)?;
    idx = vstart + vlen;

    // First name segment.
    let (name_start, first_len) = coap::option_decode(&buf[..end], idx)?;
    if first_len == 0 {
        return None;
    }
    let mut name_end = name_start + first_len;
    idx = name_end;

    // Further Uri-Path options extend the name with `/`-joined segments.
    while idx < end && buf[idx] & 0xf0 == 0x00 {
        let (seg_start, seg_len) = coap::option_decode(&buf[..end], idx)?;
        buf[name_end] = b'/';
        name_end += 1;
        if name_end != seg_start {
            buf.copy_within(seg_start..seg_start + seg_len, name_end);
        }
        name_end += seg_len;
        idx = seg_start + seg_len;
    }

    // Max-Age, if present, is ignored.
    if idx < end && buf[idx] & 0xf0 == 0x30 {
        let (age_start, age_len) = coap::option_decode(&buf[..end], idx)?;
        idx = age_start + age_len;
    }

    let data = if idx < end && buf[idx] == PAYLOAD_MARKER {
        Some(idx + 1..end)
    } else {
        None
    };
    Some((name_start..name_end, data))
}

/// Bounds-checked sequential writer over the staging buffer.
struct Cursor<'a> {
    buf: &'a mut [u8],
    at: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a mut [u8], at: usize) -> Self {
        Self { buf, at }
    }

    fn put(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        let end = self.at + bytes.len();
        if end > self.buf.len() {
            return Err(WireError::BufferTooShort {
                needed: end,
                have: self.buf.len(),
            });
        }
        self.buf[self.at..end].copy_from_slice(bytes);
        self.at = end;
        Ok(())
    }

    fn position(&self) -> usize {
        self.at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coap::{classify, MessageType};
    use proptest::prelude::*;

    const KEY: [u8; 16] = [0x42; 16];
    const IV: [u8; 16] = [0x24; 16];

    fn fresh_pair() -> (CbcState, CbcState) {
        (CbcState::new(&KEY, &IV), CbcState::new(&KEY, &IV))
    }

    /// Wraps `msglen` staged bytes and hands back the decrypted plaintext
    /// (with pad attached) a receiving peer would observe.
    fn round_trip(buf: &mut [u8], msglen: usize) -> Vec<u8> {
        let (mut tx, mut rx) = fresh_pair();
        let total = wrap(buf, msglen, &mut tx).unwrap();
        let frame_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        assert_eq!(total, frame_len + LENGTH_PREFIX);

        let mut cipher = buf[LENGTH_PREFIX..total].to_vec();
        unwrap(&mut cipher, &mut rx).unwrap();
        cipher
    }

    #[test]
    fn wrap_applies_strict_pkcs7() {
        let mut buf = [0u8; 64];
        buf[2..7].copy_from_slice(b"hello");
        let plain = round_trip(&mut buf, 5);
        assert_eq!(plain.len(), 16);
        assert_eq!(&plain[..5], b"hello");
        assert_eq!(&plain[5..], &[11u8; 11]);
    }

    #[test]
    fn aligned_messages_gain_a_full_pad_block() {
        let mut buf = [0u8; 64];
        for (i, byte) in buf[2..18].iter_mut().enumerate() {
            *byte = i as u8;
        }
        let plain = round_trip(&mut buf, 16);
        assert_eq!(plain.len(), 32);
        assert_eq!(&plain[16..], &[16u8; 16]);
    }

    #[test]
    fn wrap_rejects_oversized_messages() {
        let mut buf = vec![0u8; QUEUE_SIZE + LENGTH_PREFIX];
        let mut cbc = CbcState::new(&KEY, &IV);
        let err = wrap(&mut buf, MAX_MESSAGE_LENGTH + 1, &mut cbc).unwrap_err();
        assert!(matches!(err, WireError::MessageTooLong { .. }));
    }

    #[test]
    fn iv_chains_follow_the_spec_directions() {
        let (mut tx, mut rx) = fresh_pair();

        let mut a = [0u8; 64];
        a[2..7].copy_from_slice(b"frame");
        let total_a = wrap(&mut a, 5, &mut tx).unwrap();
        let mut b = [0u8; 64];
        b[2..26].copy_from_slice(&[9u8; 24]);
        let total_b = wrap(&mut b, 24, &mut tx).unwrap();

        // Send chain: last ciphertext block of the most recent frame.
        assert_eq!(tx.iv_send(), &b[total_b - 16..total_b]);

        // Receive chain: first ciphertext block of the most recent frame,
        // captured before decryption.
        let mut cipher_a = a[LENGTH_PREFIX..total_a].to_vec();
        let first_a: [u8; 16] = cipher_a[..16].try_into().unwrap();
        unwrap(&mut cipher_a, &mut rx).unwrap();
        assert_eq!(rx.iv_receive(), &first_a);
    }

    proptest! {
        #[test]
        fn pad_byte_always_equals_its_count(msg in prop::collection::vec(any::<u8>(), 0..600)) {
            let mut buf = vec![0u8; QUEUE_SIZE + LENGTH_PREFIX];
            buf[LENGTH_PREFIX..LENGTH_PREFIX + msg.len()].copy_from_slice(&msg);
            let plain = round_trip(&mut buf, msg.len());

            let pad = *plain.last().unwrap() as usize;
            prop_assert!(pad >= 1 && pad <= 16);
            prop_assert_eq!(plain.len(), msg.len() + pad);
            prop_assert_eq!(plain.len() % 16, 0);
            prop_assert!(plain[msg.len()..].iter().all(|&b| b as usize == pad));
            prop_assert_eq!(&plain[..msg.len()], &msg[..]);
        }
    }

    #[test]
    fn hello_matches_the_wire_layout() {
        let mut buf = [0u8; 16];
        let len = hello(&mut buf, 0x1234, 0xaabb, 0xccdd, true);
        assert_eq!(len, 13);
        assert_eq!(
            &buf[..13],
            &[0x50, 0x02, 0x12, 0x34, 0xb1, b'h', 0xff, 0xaa, 0xbb, 0xcc, 0xdd, 0x00, 0x01]
        );
        assert_eq!(classify(&buf[..13]), MessageType::Hello);
    }

    #[test]
    fn ping_and_acks_match_the_wire_layout() {
        let mut buf = [0u8; 16];
        assert_eq!(ping(&mut buf, 0x0102), 4);
        assert_eq!(&buf[..4], &[0x40, 0x00, 0x01, 0x02]);
        assert_eq!(classify(&buf[..4]), MessageType::Ping);

        assert_eq!(empty_ack(&mut buf, 0x0a, 0x0b), 4);
        assert_eq!(&buf[..4], &[0x60, 0x00, 0x0a, 0x0b]);
        assert_eq!(classify(&buf[..4]), MessageType::EmptyAck);

        assert_eq!(coded_ack(&mut buf, 0x44, 0x0a, 0x0b, 7), 5);
        assert_eq!(&buf[..5], &[0x61, 0x44, 0x0a, 0x0b, 0x07]);
    }

    #[test]
    fn function_return_carries_big_endian_value() {
        let mut buf = [0u8; 16];
        let len = function_return(&mut buf, 0x0506, 9, 1);
        assert_eq!(len, 10);
        assert_eq!(
            &buf[..10],
            &[0x51, 0x44, 0x05, 0x06, 0x09, 0xff, 0x00, 0x00, 0x00, 0x01]
        );
    }

    #[test]
    fn chunk_missed_matches_the_wire_layout() {
        let mut buf = [0u8; 16];
        let len = chunk_missed(&mut buf, 0x0708, 0x0203);
        assert_eq!(len, 9);
        assert_eq!(
            &buf[..9],
            &[0x40, 0x01, 0x07, 0x08, 0xb1, b'c', 0xff, 0x02, 0x03]
        );
        assert_eq!(classify(&buf[..9]), MessageType::Chunk);
    }

    #[test]
    fn update_ready_is_a_separate_changed_with_one_byte() {
        let mut buf = [0u8; 16];
        let len = separate_response(&mut buf, 0x0100, 3, coap::code::CHANGED, &[1]);
        assert_eq!(len, 7);
        assert_eq!(&buf[..7], &[0x51, 0x44, 0x01, 0x00, 0x03, 0xff, 0x01]);
    }

    #[test]
    fn variable_values_encode_by_type() {
        let mut buf = [0u8; 64];

        let len = variable_value(&mut buf, 7, 0, 1, &VariableValue::Boolean(true));
        assert_eq!(len, 7);
        assert_eq!(&buf[..7], &[0x61, 0x45, 0x00, 0x01, 0x07, 0xff, 0x01]);

        let len = variable_value(&mut buf, 7, 0, 1, &VariableValue::Int(42));
        assert_eq!(len, 10);
        assert_eq!(&buf[6..10], &[0x00, 0x00, 0x00, 0x2a]);

        let len = variable_value(&mut buf, 7, 0, 1, &VariableValue::Double(2.5));
        assert_eq!(len, 14);
        assert_eq!(&buf[6..14], &2.5f64.to_ne_bytes());

        let len = variable_value(&mut buf, 7, 0, 1, &VariableValue::Str("ok".into()));
        assert_eq!(len, 8);
        assert_eq!(&buf[6..8], b"ok");
    }

    #[test]
    fn event_splits_name_segments_and_round_trips() {
        let mut buf = [0u8; 128];
        let len = event(
            &mut buf,
            0x0900,
            "a/b/c",
            Some(b"data"),
            DEFAULT_EVENT_TTL,
            EventType::Public,
        )
        .unwrap();
        assert_eq!(classify(&buf[..len]), MessageType::Event);

        // Re-attach a pad byte as the decrypt path would see it.
        let padded = padded_len(len);
        let pad = (padded - len) as u8;
        for byte in &mut buf[len..padded] {
            *byte = pad;
        }
        let (name, data) = decode_event(&mut buf, padded).unwrap();
        assert_eq!(&buf[name], b"a/b/c");
        let data = data.unwrap();
        assert_eq!(&buf[data], b"data");
    }

    #[test]
    fn event_private_uses_the_capital_discriminator() {
        let mut buf = [0u8; 64];
        let len = event(&mut buf, 1, "x", None, DEFAULT_EVENT_TTL, EventType::Private).unwrap();
        assert_eq!(buf[5], b'E');
        assert_eq!(classify(&buf[..len]), MessageType::Event);
    }

    #[test]
    fn event_nondefault_ttl_adds_max_age() {
        let mut buf = [0u8; 64];
        let len = event(&mut buf, 1, "x", None, 3600, EventType::Public).unwrap();
        // 0xb1 'e', 0x01 'x', then Max-Age (delta 3, three bytes).
        assert_eq!(&buf[4..len], &[0xb1, b'e', 0x01, b'x', 0x33, 0x00, 0x0e, 0x10]);
    }

    #[test]
    fn event_rejects_payloads_beyond_the_buffer() {
        let mut buf = [0u8; 32];
        let err = event(
            &mut buf,
            1,
            "x",
            Some(&[0u8; 64]),
            DEFAULT_EVENT_TTL,
            EventType::Public,
        )
        .unwrap_err();
        assert!(matches!(err, WireError::BufferTooShort { .. }));
    }

    #[test]
    fn subscription_encodes_filter_and_target() {
        let mut buf = [0u8; 128];

        let len = subscription(
            &mut buf,
            2,
            b"temp",
            SubscriptionTarget::Scope(SubscriptionScope::MyDevices),
        )
        .unwrap();
        assert_eq!(
            &buf[..len],
            &[0x40, 0x02, 0x00, 0x02, 0xb1, b'e', 0x44, b't', b'e', b'm', b'p', 0x01, b'u']
        );

        let len = subscription(
            &mut buf,
            3,
            b"temp",
            SubscriptionTarget::DeviceId(b"abcdefghijkl"),
        )
        .unwrap();
        assert_eq!(&buf[11..12], &[0x0c]);
        assert_eq!(&buf[12..len], b"abcdefghijkl");

        let len = subscription(
            &mut buf,
            4,
            b"temp",
            SubscriptionTarget::Scope(SubscriptionScope::Firehose),
        )
        .unwrap();
        assert_eq!(len, 11);
    }

    #[test]
    fn time_request_matches_the_wire_layout() {
        let mut buf = [0u8; 16];
        let len = time_request(&mut buf, 0x0a0b, 5);
        assert_eq!(len, 7);
        assert_eq!(&buf[..7], &[0x41, 0x01, 0x0a, 0x0b, 0x05, 0xb1, b't']);
    }

    #[test]
    fn presence_announcement_is_nineteen_bytes() {
        let mut buf = [0u8; 32];
        let len = presence_announcement(&mut buf, b"deadbeef0123");
        assert_eq!(len, 19);
        assert_eq!(&buf[..7], &[0x50, 0x02, 0x00, 0x00, 0xb1, b'h', 0xff]);
        assert_eq!(&buf[7..19], b"deadbeef0123");
    }

    #[test]
    fn decode_event_joins_segments_with_extended_lengths() {
        // POST e, then `a`, a 13-byte segment (extended length), and `c`.
        let mut frame = vec![0x40, 0x02, 0x00, 0x01];
        frame.extend_from_slice(&[0xb1, b'e']);
        frame.extend_from_slice(&[0x01, b'a']);
        frame.extend_from_slice(&[0x0d, 0x00]);
        frame.extend_from_slice(&[b'b'; 13]);
        frame.extend_from_slice(&[0x01, b'c']);
        frame.push(PAYLOAD_MARKER);
        frame.extend_from_slice(b"pay");

        let padded = padded_len(frame.len());
        let pad = (padded - frame.len()) as u8;
        frame.resize(padded, pad);

        let (name, data) = decode_event(&mut frame, padded).unwrap();
        let mut expected = b"a/".to_vec();
        expected.extend_from_slice(&[b'b'; 13]);
        expected.extend_from_slice(b"/c");
        assert_eq!(&frame[name], &expected[..]);
        assert_eq!(&frame[data.unwrap()], b"pay");
    }

    #[test]
    fn decode_event_skips_max_age() {
        let mut frame = vec![0x40, 0x02, 0x00, 0x01];
        frame.extend_from_slice(&[0xb1, b'e', 0x03, b'f', b'o', b'o']);
        frame.extend_from_slice(&[0x33, 0x00, 0x00, 0x3c]);
        frame.push(PAYLOAD_MARKER);
        frame.push(b'!');

        let padded = padded_len(frame.len());
        let pad = (padded - frame.len()) as u8;
        frame.resize(padded, pad);

        let (name, data) = decode_event(&mut frame, padded).unwrap();
        assert_eq!(&frame[name], b"foo");
        assert_eq!(&frame[data.unwrap()], b"!");
    }

    #[test]
    fn decode_event_rejects_bad_padding() {
        let mut frame = vec![0x40, 0x02, 0x00, 0x01, 0xb1, b'e', 0x01, b'x'];
        frame.resize(16, 0); // pad byte 0
        assert!(decode_event(&mut frame, 16).is_none());

        let mut frame = vec![0x40, 0x02, 0x00, 0x01, 0xb1, b'e', 0x01, b'x'];
        frame.resize(16, 17); // pad byte beyond a block
        assert!(decode_event(&mut frame, 16).is_none());
    }

    #[test]
    fn decode_event_without_payload_yields_no_data() {
        let mut frame = vec![0x40, 0x02, 0x00, 0x01, 0xb1, b'e', 0x02, b'h', b'i'];
        let padded = padded_len(frame.len());
        let pad = (padded - frame.len()) as u8;
        frame.resize(padded, pad);

        let (name, data) = decode_event(&mut frame, padded).unwrap();
        assert_eq!(&frame[name], b"hi");
        assert!(data.is_none());
    }
}
