// Emberlink: device-side cloud protocol core.
//
// Maintains a secure long-lived session with a back-end service over an
// unreliable duplex byte stream: mutual-authentication handshake, AES-CBC
// record protection with chained IVs, CoAP-subset framing, variable reads
// and function calls, publish/subscribe events, a firmware chunk pipeline,
// and keep-alive with timeout-based disconnect detection.

pub mod api;

pub mod coap;

pub mod config;

pub mod crypto;

pub mod events;

pub mod metrics;

pub mod protocol;

pub mod queue;

pub mod session;

pub mod wire;

pub use api::{
    Descriptor, Platform, ReturnType, TransportError, VariableValue, MAX_FUNCTION_KEY_LENGTH,
    MAX_VARIABLE_KEY_LENGTH,
};

pub use coap::{classify, CoapType, MessageType, PAYLOAD_MARKER};

pub use config::{startup_profile, Config, ConfigError, Profile, ProfileName};

pub use crypto::{
    cbc::{CbcError, CbcState, BLOCK_LEN, KEY_LEN},
    handshake::{
        Credentials, HandshakeError, CREDENTIALS_LENGTH, DEVICE_ID_LENGTH, HANDSHAKE_REPLY_LENGTH,
        NONCE_LENGTH,
    },
};

pub use events::{
    EventError, EventHandler, EventRateLimiter, EventType, FilteringHandler, HandlerTable,
    SubscriptionScope, MAX_EVENT_NAME_LENGTH, NUM_EVENT_HANDLERS,
};

pub use metrics::{Metrics, MetricsError};

pub use protocol::{DeviceIdentity, DeviceKeys, Protocol, ProtocolError};

pub use queue::RingBuffer;

pub use session::Session;

pub use wire::{
    decode_event, unwrap, wrap, ChunkReceivedCode, SubscriptionTarget, WireError,
    DEFAULT_EVENT_TTL, LENGTH_PREFIX, MAX_MESSAGE_LENGTH, QUEUE_SIZE,
};
