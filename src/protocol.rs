// Protocol engine: handshake sequencing, the cooperative dispatch loop, and
// the request handlers behind it.

use rsa::{RsaPrivateKey, RsaPublicKey};
use thiserror::Error;
use tracing::{debug, warn};

use crate::api::{
    Descriptor, Platform, TransportError, VariableValue, MAX_FUNCTION_KEY_LENGTH,
    MAX_VARIABLE_KEY_LENGTH,
};
use crate::coap::{self, MessageType};
use crate::config::Profile;
use crate::crypto::handshake::{
    self, HandshakeError, DEVICE_ID_LENGTH, HANDSHAKE_REPLY_LENGTH, NONCE_LENGTH,
};
use crate::events::{
    EventError, EventHandler, EventRateLimiter, EventType, HandlerTable, SubscriptionScope,
};
use crate::metrics::Metrics;
use crate::queue::RingBuffer;
use crate::session::Session;
use crate::wire::{
    self, ChunkReceivedCode, SubscriptionTarget, LENGTH_PREFIX, MAX_MESSAGE_LENGTH, QUEUE_SIZE,
};

/// Staging area: the length prefix plus one maximal ciphertext frame.
const STAGING_SIZE: usize = QUEUE_SIZE + LENGTH_PREFIX;

/// Offsets into the CHUNK frame, fixed by the wire format.
const CHUNK_CRC_OFFSET: usize = 8;
const CHUNK_CRC_REGION_OFFSET: usize = 13;
const CHUNK_PAYLOAD_OFFSET: usize = 15;

/// Long-term key material fixed at construction.
pub struct DeviceKeys {
    pub server_public: RsaPublicKey,
    pub device_private: RsaPrivateKey,
}

/// Identity reported to the service.
#[derive(Debug, Clone, Copy)]
pub struct DeviceIdentity {
    pub device_id: [u8; DEVICE_ID_LENGTH],
    pub product_id: u16,
    pub product_firmware_version: u16,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Send or receive made no progress for the configured stall window.
    #[error("i/o made no progress for {0} ms")]
    IoStall(u32),
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Wire(#[from] wire::WireError),
    /// The peer announced a frame larger than the staging buffer.
    #[error("length prefix {0} exceeds queue capacity {QUEUE_SIZE}")]
    OversizedFrame(usize),
    #[error("ping acknowledgment timed out")]
    PingTimeout,
    #[error("no active session")]
    NotConnected,
}

/// Device-side cloud protocol core.
///
/// Owns the staging buffer, the session, and the host-provided platform and
/// descriptor. Single-threaded: the host calls [`Protocol::event_loop`] once
/// per main-loop iteration and re-runs [`Protocol::handshake`] from scratch
/// after any disconnect.
pub struct Protocol<P: Platform, D: Descriptor> {
    platform: P,
    descriptor: D,
    server_public: RsaPublicKey,
    device_private: RsaPrivateKey,
    device_id: [u8; DEVICE_ID_LENGTH],
    product_id: u16,
    product_firmware_version: u16,
    profile: Profile,
    queue: [u8; STAGING_SIZE],
    prefix: RingBuffer,
    session: Option<Session>,
    handlers: HandlerTable,
    limiter: EventRateLimiter,
    metrics: Option<Metrics>,
}

impl<P: Platform, D: Descriptor> Protocol<P, D> {
    pub fn new(
        identity: DeviceIdentity,
        keys: DeviceKeys,
        profile: Profile,
        platform: P,
        descriptor: D,
    ) -> Self {
        Self {
            platform,
            descriptor,
            server_public: keys.server_public,
            device_private: keys.device_private,
            device_id: identity.device_id,
            product_id: identity.product_id,
            product_firmware_version: identity.product_firmware_version,
            profile,
            queue: [0; STAGING_SIZE],
            prefix: RingBuffer::new(LENGTH_PREFIX + 2),
            session: None,
            handlers: HandlerTable::default(),
            limiter: EventRateLimiter::new(),
            metrics: None,
        }
    }

    /// Attaches a metrics registry; counting is otherwise skipped.
    pub fn attach_metrics(&mut self, metrics: Metrics) {
        self.metrics = Some(metrics);
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_updating(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.updating)
    }

    /// Clears a wedged firmware update without touching the session.
    pub fn reset_updating(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.updating = false;
        }
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn descriptor_mut(&mut self) -> &mut D {
        &mut self.descriptor
    }

    /// Runs the full handshake over a freshly connected transport and, on
    /// success, re-announces every stored subscription.
    pub fn handshake(&mut self) -> Result<(), ProtocolError> {
        match self.run_handshake() {
            Ok(()) => {
                if let Some(m) = &self.metrics {
                    m.handshakes.inc();
                }
                Ok(())
            }
            Err(err) => {
                if let Some(m) = &self.metrics {
                    m.handshake_failures.inc();
                }
                warn!(%err, "handshake failed");
                Err(err)
            }
        }
    }

    fn run_handshake(&mut self) -> Result<(), ProtocolError> {
        self.session = None;
        self.prefix.clear();
        let stall = self.profile.io_stall_timeout_ms;

        // Nonce in, device id appended behind it.
        blocking_receive(&mut self.platform, stall, &mut self.queue[..NONCE_LENGTH])?;
        self.queue[NONCE_LENGTH..NONCE_LENGTH + DEVICE_ID_LENGTH]
            .copy_from_slice(&self.device_id);

        // Device public key derived in memory, never stored.
        let der = handshake::device_public_key_der(&self.device_private)?;
        let clear_len = NONCE_LENGTH + DEVICE_ID_LENGTH + der.len();
        self.queue[NONCE_LENGTH + DEVICE_ID_LENGTH..clear_len].copy_from_slice(&der);

        let proof = handshake::encrypt_device_proof(&self.server_public, &self.queue[..clear_len])?;
        blocking_send(&mut self.platform, stall, &proof)?;

        blocking_receive(
            &mut self.platform,
            stall,
            &mut self.queue[..HANDSHAKE_REPLY_LENGTH],
        )?;
        let credentials = handshake::verify_and_decrypt(
            &self.server_public,
            &self.device_private,
            &self.queue[..HANDSHAKE_REPLY_LENGTH],
        )?;
        self.platform.random_seed_from_cloud(credentials.prng_seed);

        let now = self.platform.millis();
        let mut session = Session::new(&credentials, now);

        let msglen = wire::hello(
            &mut self.queue[LENGTH_PREFIX..],
            session.next_message_id(),
            self.product_id,
            self.product_firmware_version,
            self.descriptor.was_ota_upgrade_successful(),
        );
        let total = wire::wrap(&mut self.queue, msglen, session.cbc())?;
        blocking_send(&mut self.platform, stall, &self.queue[..total])?;

        debug!("handshake complete");
        self.session = Some(session);
        self.send_subscriptions()?;
        Ok(())
    }

    /// One cooperative tick: drain at most one inbound frame, otherwise run
    /// the keep-alive and chunk-retransmit timers. An `Err` means the
    /// session is gone and the caller must reconnect and re-handshake.
    pub fn event_loop(&mut self) -> Result<(), ProtocolError> {
        if self.session.is_none() {
            return Err(ProtocolError::NotConnected);
        }

        // The length prefix accumulates across ticks so a one-byte partial
        // read is not lost.
        let missing = LENGTH_PREFIX.saturating_sub(self.prefix.len());
        if missing > 0 {
            let mut tmp = [0u8; LENGTH_PREFIX];
            let n = self.platform.receive(&mut tmp[..missing])?;
            if n > 0 {
                self.prefix.push(&tmp[..n]);
            }
        }

        if self.prefix.len() >= LENGTH_PREFIX {
            let mut prefix = [0u8; LENGTH_PREFIX];
            self.prefix.pop(&mut prefix);
            let frame_len = u16::from_be_bytes(prefix) as usize;
            return self.handle_received_message(frame_len);
        }

        self.run_timers()
    }

    fn run_timers(&mut self) -> Result<(), ProtocolError> {
        let now = self.platform.millis();
        let profile = self.profile;
        let Some(session) = self.session.as_mut() else {
            return Err(ProtocolError::NotConnected);
        };

        if session.updating {
            if now.wrapping_sub(session.last_chunk_millis) > profile.chunk_missed_ms {
                debug!(chunk = session.chunk_index, "requesting chunk retransmit");
                let msglen = wire::chunk_missed(
                    &mut self.queue[LENGTH_PREFIX..],
                    session.next_message_id(),
                    session.chunk_index,
                );
                let total = wire::wrap(&mut self.queue, msglen, session.cbc())?;
                blocking_send(&mut self.platform, profile.io_stall_timeout_ms, &self.queue[..total])?;
                session.last_chunk_millis = self.platform.millis();
                if let Some(m) = &self.metrics {
                    m.chunk_retransmit_requests.inc();
                }
            }
        } else if session.expecting_ping_ack {
            if now.wrapping_sub(session.last_message_millis) > profile.ping_ack_timeout_ms {
                session.expecting_ping_ack = false;
                if let Some(m) = &self.metrics {
                    m.ping_timeouts.inc();
                }
                warn!("ping acknowledgment timed out");
                return Err(ProtocolError::PingTimeout);
            }
        } else if now.wrapping_sub(session.last_message_millis) > profile.keep_alive_ms {
            let msglen = wire::ping(&mut self.queue[LENGTH_PREFIX..], session.next_message_id());
            let total = wire::wrap(&mut self.queue, msglen, session.cbc())?;
            blocking_send(&mut self.platform, profile.io_stall_timeout_ms, &self.queue[..total])?;
            session.expecting_ping_ack = true;
            session.last_message_millis = self.platform.millis();
            if let Some(m) = &self.metrics {
                m.pings_sent.inc();
            }
        }
        Ok(())
    }

    fn handle_received_message(&mut self, frame_len: usize) -> Result<(), ProtocolError> {
        if frame_len > QUEUE_SIZE {
            warn!(frame_len, "oversized length prefix, dropping session");
            return Err(ProtocolError::OversizedFrame(frame_len));
        }
        let stall = self.profile.io_stall_timeout_ms;
        blocking_receive(&mut self.platform, stall, &mut self.queue[..frame_len])?;

        let Some(session) = self.session.as_mut() else {
            return Err(ProtocolError::NotConnected);
        };
        wire::unwrap(&mut self.queue[..frame_len], session.cbc())?;

        let message_type = coap::classify(&self.queue[..frame_len]);
        session.last_message_millis = self.platform.millis();
        session.expecting_ping_ack = false;
        if let Some(m) = &self.metrics {
            m.messages_received
                .with_label_values(&[type_label(message_type)])
                .inc();
        }
        debug!(?message_type, frame_len, "inbound message");

        match message_type {
            MessageType::Describe => self.on_describe(),
            MessageType::FunctionCall => self.on_function_call(frame_len),
            MessageType::VariableRequest => self.on_variable_request(frame_len),
            MessageType::Chunk => self.on_chunk(frame_len),
            MessageType::SaveBegin | MessageType::UpdateBegin => {
                self.on_update_begin(message_type, frame_len)
            }
            MessageType::UpdateDone => self.on_update_done(),
            MessageType::Event => self.on_event(frame_len),
            MessageType::Time => self.on_time(frame_len),
            MessageType::Ping => self.on_ping(),
            MessageType::SignalStart => self.on_signal(true),
            MessageType::SignalStop => self.on_signal(false),
            MessageType::Hello => {
                // Server ack of the OTA status we reported in HELLO.
                self.descriptor.ota_upgrade_status_sent();
                Ok(())
            }
            // Reserved for a future rekeying protocol: accept and drop.
            MessageType::KeyChange => Ok(()),
            MessageType::EmptyAck => Ok(()),
            MessageType::Error => {
                if let Some(m) = &self.metrics {
                    m.frames_dropped.inc();
                }
                debug!("unclassifiable frame dropped");
                Ok(())
            }
        }
    }

    /// Encrypts and sends a short reply through a scratch buffer, leaving
    /// the inbound frame in the staging area untouched.
    fn send_short<F>(&mut self, build: F) -> Result<(), ProtocolError>
    where
        F: FnOnce(&mut [u8], &mut Session) -> usize,
    {
        let Some(session) = self.session.as_mut() else {
            return Err(ProtocolError::NotConnected);
        };
        let mut buf = [0u8; LENGTH_PREFIX + 32];
        let msglen = build(&mut buf[LENGTH_PREFIX..], session);
        let total = wire::wrap(&mut buf, msglen, session.cbc())?;
        blocking_send(
            &mut self.platform,
            self.profile.io_stall_timeout_ms,
            &buf[..total],
        )
    }

    fn on_describe(&mut self) -> Result<(), ProtocolError> {
        let (msb, lsb, token) = (self.queue[2], self.queue[3], self.queue[4]);
        let Some(session) = self.session.as_mut() else {
            return Err(ProtocolError::NotConnected);
        };
        let msglen = wire::description(
            &mut self.queue[LENGTH_PREFIX..LENGTH_PREFIX + MAX_MESSAGE_LENGTH],
            token,
            msb,
            lsb,
            &self.descriptor,
        )?;
        let total = wire::wrap(&mut self.queue, msglen, session.cbc())?;
        blocking_send(
            &mut self.platform,
            self.profile.io_stall_timeout_ms,
            &self.queue[..total],
        )
    }

    fn on_function_call(&mut self, frame_len: usize) -> Result<(), ProtocolError> {
        let (msb, lsb, token) = (self.queue[2], self.queue[3], self.queue[4]);
        self.send_short(|buf, _| wire::empty_ack(buf, msb, lsb))?;

        let return_value = {
            let buf = &self.queue[..frame_len];
            let path_at = 4 + coap::token_length(buf[0]);
            let Some((path_start, path_len)) = coap::option_decode(buf, path_at) else {
                return Ok(());
            };
            let Some((key_start, key_len)) = coap::option_decode(buf, path_start + path_len)
            else {
                return Ok(());
            };
            if key_len > MAX_FUNCTION_KEY_LENGTH {
                return Ok(());
            }
            let Some((arg_start, arg_len)) = coap::option_decode(buf, key_start + key_len) else {
                return Ok(());
            };
            if arg_len >= self.profile.max_function_arg_length {
                warn!(arg_len, "function argument too long, dropping call");
                return Ok(());
            }
            let Ok(key) = std::str::from_utf8(&buf[key_start..key_start + key_len]) else {
                return Ok(());
            };
            let Ok(arg) = std::str::from_utf8(&buf[arg_start..arg_start + arg_len]) else {
                return Ok(());
            };
            debug!(key, "cloud function call");
            self.descriptor.call_function(key, arg)
        };
        if let Some(m) = &self.metrics {
            m.functions_called.inc();
        }

        self.send_short(|buf, s| wire::function_return(buf, s.next_message_id(), token, return_value))
    }

    fn on_variable_request(&mut self, frame_len: usize) -> Result<(), ProtocolError> {
        let (msb, lsb, token) = (self.queue[2], self.queue[3], self.queue[4]);

        let mut key_buf = [0u8; MAX_VARIABLE_KEY_LENGTH];
        let key_len = {
            let buf = &self.queue[..frame_len];
            let path_at = 4 + coap::token_length(buf[0]);
            let Some((path_start, path_len)) = coap::option_decode(buf, path_at) else {
                return Ok(());
            };
            let Some((key_start, key_len)) = coap::option_decode(buf, path_start + path_len)
            else {
                return Ok(());
            };
            let key_len = key_len.min(MAX_VARIABLE_KEY_LENGTH);
            key_buf[..key_len].copy_from_slice(&buf[key_start..key_start + key_len]);
            key_len
        };
        let Ok(key) = std::str::from_utf8(&key_buf[..key_len]) else {
            return Ok(());
        };

        match self.descriptor.get_variable(key) {
            Some(mut value) => {
                if let VariableValue::Str(s) = &mut value {
                    s.truncate(QUEUE_SIZE - 18);
                }
                if let Some(m) = &self.metrics {
                    m.variables_read.inc();
                }
                let Some(session) = self.session.as_mut() else {
                    return Err(ProtocolError::NotConnected);
                };
                let msglen = wire::variable_value(
                    &mut self.queue[LENGTH_PREFIX..],
                    token,
                    msb,
                    lsb,
                    &value,
                );
                let total = wire::wrap(&mut self.queue, msglen, session.cbc())?;
                blocking_send(
                    &mut self.platform,
                    self.profile.io_stall_timeout_ms,
                    &self.queue[..total],
                )
            }
            None => {
                debug!(key, "unknown variable requested");
                self.send_short(|buf, _| wire::empty_ack(buf, msb, lsb))
            }
        }
    }

    fn on_chunk(&mut self, frame_len: usize) -> Result<(), ProtocolError> {
        let (msb, lsb, token) = (self.queue[2], self.queue[3], self.queue[4]);
        self.send_short(|buf, _| wire::empty_ack(buf, msb, lsb))?;

        let pad = self.queue[frame_len - 1] as usize;
        if pad == 0 || pad > 16 || pad >= frame_len {
            if let Some(m) = &self.metrics {
                m.frames_dropped.inc();
            }
            return Ok(());
        }
        let end = frame_len - pad;
        if end < CHUNK_PAYLOAD_OFFSET {
            if let Some(m) = &self.metrics {
                m.frames_dropped.inc();
            }
            return Ok(());
        }

        let given_crc = u32::from_be_bytes(
            self.queue[CHUNK_CRC_OFFSET..CHUNK_CRC_OFFSET + 4]
                .try_into()
                .expect("fixed four-byte slice"),
        );
        let crc_ok = !self.profile.enforce_chunk_crc
            || self
                .platform
                .calculate_crc(&self.queue[CHUNK_CRC_REGION_OFFSET..end])
                == given_crc;

        if crc_ok {
            let next_index = self
                .platform
                .save_firmware_chunk(&self.queue[CHUNK_PAYLOAD_OFFSET..end]);
            let Some(session) = self.session.as_mut() else {
                return Err(ProtocolError::NotConnected);
            };
            let advanced = next_index > session.chunk_index;
            session.chunk_index = next_index;

            if advanced {
                if let Some(m) = &self.metrics {
                    m.chunks_ok.inc();
                }
                self.send_short(|buf, s| {
                    wire::separate_response(
                        buf,
                        s.next_message_id(),
                        token,
                        ChunkReceivedCode::Ok as u8,
                        &[],
                    )
                })?;
            } else {
                debug!(next_index, "stale chunk, requesting retransmit");
                if let Some(m) = &self.metrics {
                    m.chunk_retransmit_requests.inc();
                }
                self.send_short(|buf, s| {
                    wire::chunk_missed(buf, s.next_message_id(), next_index)
                })?;
            }
        } else {
            warn!("chunk crc mismatch");
            if let Some(m) = &self.metrics {
                m.chunks_bad.inc();
            }
            self.send_short(|buf, s| {
                wire::separate_response(
                    buf,
                    s.next_message_id(),
                    token,
                    ChunkReceivedCode::Bad as u8,
                    &[],
                )
            })?;
        }

        let now = self.platform.millis();
        if let Some(session) = self.session.as_mut() {
            session.last_chunk_millis = now;
        }
        Ok(())
    }

    fn on_update_begin(
        &mut self,
        message_type: MessageType,
        frame_len: usize,
    ) -> Result<(), ProtocolError> {
        let (msb, lsb, token) = (self.queue[2], self.queue[3], self.queue[4]);
        self.send_short(|buf, _| wire::empty_ack(buf, msb, lsb))?;

        if message_type == MessageType::SaveBegin {
            if frame_len < 16 {
                if let Some(m) = &self.metrics {
                    m.frames_dropped.inc();
                }
                return Ok(());
            }
            let address = u32::from_be_bytes(
                self.queue[8..12].try_into().expect("fixed four-byte slice"),
            );
            let file_size = u32::from_be_bytes(
                self.queue[12..16].try_into().expect("fixed four-byte slice"),
            );
            self.platform.prepare_to_save_file(address, file_size);
        } else {
            self.platform.prepare_for_firmware_update();
        }

        let now = self.platform.millis();
        let Some(session) = self.session.as_mut() else {
            return Err(ProtocolError::NotConnected);
        };
        session.updating = true;
        session.chunk_index = 0;
        session.last_chunk_millis = now;
        debug!("firmware transfer started");

        self.send_short(|buf, s| {
            wire::separate_response(buf, s.next_message_id(), token, coap::code::CHANGED, &[1])
        })
    }

    fn on_update_done(&mut self) -> Result<(), ProtocolError> {
        let (msb, lsb, token) = (self.queue[2], self.queue[3], self.queue[4]);
        self.send_short(|buf, _| wire::coded_ack(buf, coap::code::CHANGED, msb, lsb, token))?;

        if let Some(session) = self.session.as_mut() {
            session.updating = false;
        }
        debug!("firmware transfer finished");
        self.platform.finish_firmware_update(true);
        Ok(())
    }

    fn on_event(&mut self, frame_len: usize) -> Result<(), ProtocolError> {
        match wire::decode_event(&mut self.queue, frame_len) {
            Some((name, data)) => {
                if let Some(m) = &self.metrics {
                    m.events_dispatched.inc();
                }
                let name = &self.queue[name];
                let data = data.map(|range| &self.queue[range]);
                self.handlers.dispatch(name, data);
            }
            None => {
                if let Some(m) = &self.metrics {
                    m.frames_dropped.inc();
                }
                debug!("malformed event frame dropped");
            }
        }
        Ok(())
    }

    fn on_time(&mut self, frame_len: usize) -> Result<(), ProtocolError> {
        if frame_len < 10 {
            if let Some(m) = &self.metrics {
                m.frames_dropped.inc();
            }
            return Ok(());
        }
        let timestamp =
            u32::from_be_bytes(self.queue[6..10].try_into().expect("fixed four-byte slice"));
        self.platform.set_time(timestamp);
        Ok(())
    }

    fn on_ping(&mut self) -> Result<(), ProtocolError> {
        let (msb, lsb) = (self.queue[2], self.queue[3]);
        self.send_short(|buf, _| wire::empty_ack(buf, msb, lsb))
    }

    fn on_signal(&mut self, on: bool) -> Result<(), ProtocolError> {
        let (msb, lsb, token) = (self.queue[2], self.queue[3], self.queue[4]);
        self.send_short(|buf, _| wire::coded_ack(buf, coap::code::CHANGED, msb, lsb, token))?;
        self.platform.signal(on);
        Ok(())
    }

    /// Publishes a named event, subject to the rate limits.
    pub fn send_event(
        &mut self,
        name: &str,
        data: Option<&[u8]>,
        ttl: u32,
        kind: EventType,
    ) -> Result<(), EventError> {
        let Some(session) = self.session.as_mut() else {
            return Err(EventError::NotConnected);
        };
        if session.updating {
            return Err(EventError::Updating);
        }

        let now = self.platform.millis();
        if !self.limiter.admit(name.as_bytes(), now) {
            if let Some(m) = &self.metrics {
                m.events_rate_limited.inc();
            }
            return Err(EventError::RateLimited);
        }

        let msglen = wire::event(
            &mut self.queue[LENGTH_PREFIX..LENGTH_PREFIX + MAX_MESSAGE_LENGTH],
            session.next_message_id(),
            name,
            data,
            ttl,
            kind,
        )
        .map_err(|err| EventError::Protocol(err.into()))?;
        let total = wire::wrap(&mut self.queue, msglen, session.cbc())
            .map_err(|err| EventError::Protocol(err.into()))?;
        blocking_send(
            &mut self.platform,
            self.profile.io_stall_timeout_ms,
            &self.queue[..total],
        )
        .map_err(EventError::Protocol)?;

        if let Some(m) = &self.metrics {
            m.events_published.inc();
        }
        Ok(())
    }

    /// Asks the server for wall-clock time; the answer arrives as a TIME
    /// message through the loop.
    pub fn send_time_request(&mut self) -> Result<(), EventError> {
        let Some(session) = self.session.as_mut() else {
            return Err(EventError::NotConnected);
        };
        if session.updating {
            return Err(EventError::Updating);
        }

        let message_id = session.next_message_id();
        let token = session.next_token();
        let msglen = wire::time_request(&mut self.queue[LENGTH_PREFIX..], message_id, token);
        let total = wire::wrap(&mut self.queue, msglen, session.cbc())
            .map_err(|err| EventError::Protocol(err.into()))?;
        blocking_send(
            &mut self.platform,
            self.profile.io_stall_timeout_ms,
            &self.queue[..total],
        )
        .map_err(EventError::Protocol)
    }

    /// Registers an event handler. The subscription is announced on the next
    /// handshake, or immediately via [`Protocol::send_subscriptions`].
    pub fn add_event_handler(
        &mut self,
        name: &str,
        handler: EventHandler,
        scope: SubscriptionScope,
        device_id: Option<&[u8]>,
    ) -> Result<(), EventError> {
        self.handlers.add(name.as_bytes(), handler, scope, device_id)
    }

    /// Removes handlers by exact filter name; `None` clears the table.
    pub fn remove_event_handlers(&mut self, name: Option<&str>) {
        self.handlers.remove(name.map(str::as_bytes));
    }

    /// Announces every stored subscription to the server. Called
    /// automatically after each successful handshake.
    pub fn send_subscriptions(&mut self) -> Result<(), ProtocolError> {
        let Some(session) = self.session.as_mut() else {
            return Err(ProtocolError::NotConnected);
        };
        for entry in self.handlers.entries() {
            let target = match entry.device_id() {
                Some(id) => SubscriptionTarget::DeviceId(id),
                None => SubscriptionTarget::Scope(entry.scope()),
            };
            let msglen = wire::subscription(
                &mut self.queue[LENGTH_PREFIX..],
                session.next_message_id(),
                entry.filter(),
                target,
            )?;
            let total = wire::wrap(&mut self.queue, msglen, session.cbc())?;
            blocking_send(
                &mut self.platform,
                self.profile.io_stall_timeout_ms,
                &self.queue[..total],
            )?;
        }
        Ok(())
    }

    /// Fills `buf` with the unencrypted local-network presence beacon and
    /// returns its length. Sent outside the session by the host.
    pub fn presence_announcement(&self, buf: &mut [u8]) -> usize {
        wire::presence_announcement(buf, &self.device_id)
    }
}

fn type_label(message_type: MessageType) -> &'static str {
    match message_type {
        MessageType::VariableRequest => "variable",
        MessageType::Describe => "describe",
        MessageType::Event => "event",
        MessageType::Hello => "hello",
        MessageType::FunctionCall => "function",
        MessageType::SaveBegin => "save_begin",
        MessageType::UpdateBegin => "update_begin",
        MessageType::Chunk => "chunk",
        MessageType::KeyChange => "key_change",
        MessageType::UpdateDone => "update_done",
        MessageType::SignalStart => "signal_start",
        MessageType::SignalStop => "signal_stop",
        MessageType::Ping => "ping",
        MessageType::EmptyAck => "empty_ack",
        MessageType::Time => "time",
        MessageType::Error => "error",
    }
}

/// Polls `send` until the buffer is flushed, failing after `stall_ms` of
/// zero progress.
fn blocking_send<P: Platform>(
    platform: &mut P,
    stall_ms: u32,
    buf: &[u8],
) -> Result<(), ProtocolError> {
    let started = platform.millis();
    let mut sent = 0;
    while sent < buf.len() {
        let n = platform.send(&buf[sent..])?;
        if n > 0 {
            sent += n;
        } else if platform.millis().wrapping_sub(started) > stall_ms {
            return Err(ProtocolError::IoStall(stall_ms));
        }
    }
    Ok(())
}

/// Polls `receive` until `buf` is full, failing after `stall_ms` of zero
/// progress.
fn blocking_receive<P: Platform>(
    platform: &mut P,
    stall_ms: u32,
    buf: &mut [u8],
) -> Result<(), ProtocolError> {
    let started = platform.millis();
    let mut received = 0;
    while received < buf.len() {
        let n = platform.receive(&mut buf[received..])?;
        if n > 0 {
            received += n;
        } else if platform.millis().wrapping_sub(started) > stall_ms {
            return Err(ProtocolError::IoStall(stall_ms));
        }
    }
    Ok(())
}
