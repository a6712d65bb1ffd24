// Host integration surface: platform callbacks and the application descriptor.

use thiserror::Error;

/// Maximum length of a cloud-callable function key.
pub const MAX_FUNCTION_KEY_LENGTH: usize = 12;

/// Maximum length of a cloud-readable variable key.
pub const MAX_VARIABLE_KEY_LENGTH: usize = 12;

/// Transport-level failure reported by the host send/receive callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The peer closed the connection.
    #[error("connection closed by peer")]
    Closed,
    /// Unrecoverable socket-level failure.
    #[error("transport failure")]
    Failed,
}

/// Wire type tag reported for a registered variable.
///
/// The numeric values are emitted as digits in the DESCRIBE document and are
/// fixed by the wire format.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnType {
    Boolean = 1,
    Int = 2,
    String = 4,
    Double = 9,
}

impl ReturnType {
    /// ASCII digit used in the DESCRIBE document.
    #[must_use]
    pub const fn as_digit(self) -> u8 {
        b'0' + self as u8
    }
}

/// A variable value handed back by the descriptor for a cloud read.
#[derive(Debug, Clone, PartialEq)]
pub enum VariableValue {
    Boolean(bool),
    Int(i32),
    Str(String),
    Double(f64),
}

impl VariableValue {
    /// Returns the wire type tag for this value.
    #[must_use]
    pub fn return_type(&self) -> ReturnType {
        match self {
            VariableValue::Boolean(_) => ReturnType::Boolean,
            VariableValue::Int(_) => ReturnType::Int,
            VariableValue::Str(_) => ReturnType::String,
            VariableValue::Double(_) => ReturnType::Double,
        }
    }
}

/// Host-provided platform callbacks: transport I/O, timekeeping, and the
/// firmware-update backend.
///
/// `send` and `receive` are non-blocking: `Ok(0)` means no progress was made
/// this call. The core converts sustained lack of progress into a disconnect
/// after the configured stall timeout.
pub trait Platform {
    /// Writes bytes to the transport, returning how many were accepted.
    fn send(&mut self, buf: &[u8]) -> Result<usize, TransportError>;

    /// Reads bytes from the transport, returning how many were produced.
    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Monotonic millisecond clock. Wrapping is expected and handled.
    fn millis(&mut self) -> u32;

    /// Called before the first firmware chunk of an over-the-air update.
    fn prepare_for_firmware_update(&mut self);

    /// Called before the first chunk of an external-flash file save.
    fn prepare_to_save_file(&mut self, flash_address: u32, file_size: u32);

    /// Persists one firmware chunk; returns the next expected chunk index.
    fn save_firmware_chunk(&mut self, chunk: &[u8]) -> u16;

    /// Called when the server declares the update finished (or aborted).
    fn finish_firmware_update(&mut self, ok: bool);

    /// CRC over a chunk check region. The default is CRC-32 (IEEE).
    fn calculate_crc(&mut self, buf: &[u8]) -> u32 {
        crc32fast::hash(buf)
    }

    /// Visual identification request from the cloud (RGB shout, LED blink).
    fn signal(&mut self, on: bool);

    /// Wall-clock time pushed by the server, seconds since the Unix epoch.
    fn set_time(&mut self, unix_seconds: u32);

    /// Cryptographically random seed supplied by the server during the
    /// handshake. Hosts typically reseed their PRNG here.
    fn random_seed_from_cloud(&mut self, _seed: u32) {}
}

/// Host-provided registry of cloud-visible functions and variables.
pub trait Descriptor {
    fn num_functions(&self) -> usize;

    /// Key of the function at `index`; keys beyond
    /// [`MAX_FUNCTION_KEY_LENGTH`] are truncated on the wire.
    fn function_key(&self, index: usize) -> &str;

    /// Invokes a registered function with its string argument.
    fn call_function(&mut self, key: &str, arg: &str) -> i32;

    fn num_variables(&self) -> usize;

    fn variable_key(&self, index: usize) -> &str;

    /// Wire type of the variable, or `None` when the key is unknown.
    fn variable_type(&self, key: &str) -> Option<ReturnType>;

    /// Current value of the variable, or `None` when the key is unknown.
    fn get_variable(&self, key: &str) -> Option<VariableValue>;

    /// True exactly once after booting into freshly flashed firmware.
    fn was_ota_upgrade_successful(&self) -> bool;

    /// The server acknowledged the OTA status carried in our HELLO.
    fn ota_upgrade_status_sent(&mut self);
}
