// events.rs - outbound publish rate limiting and the subscription handler table

use thiserror::Error;

use crate::crypto::handshake::DEVICE_ID_LENGTH;

/// Longest event name carried on the wire; longer names are truncated.
pub const MAX_EVENT_NAME_LENGTH: usize = 63;

/// Capacity of one handler filter slot.
pub const MAX_FILTER_LENGTH: usize = 64;

/// Fixed size of the subscription handler table.
pub const NUM_EVENT_HANDLERS: usize = 4;

/// Window length for the non-system burst limit.
const BURST_WINDOW_MS: u32 = 1000;

/// Visibility of a published event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Public,
    Private,
}

impl EventType {
    /// Uri-Path discriminator char for this visibility.
    #[must_use]
    pub const fn path_char(self) -> u8 {
        match self {
            EventType::Public => b'e',
            EventType::Private => b'E',
        }
    }
}

/// Breadth of an inbound subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionScope {
    /// Events published by devices owned by the same account.
    MyDevices,
    /// The full public event stream.
    Firehose,
}

/// Callback invoked for a matching inbound event. The payload is `None` when
/// the frame carried no payload marker.
pub type EventHandler = fn(name: &[u8], data: Option<&[u8]>);

#[derive(Debug, Error)]
pub enum EventError {
    /// Every handler slot is occupied.
    #[error("event handler table full")]
    TableFull,
    /// Publish denied by the system or burst rate limit.
    #[error("event rate limit exceeded")]
    RateLimited,
    /// Publishing is refused while a firmware update is in progress.
    #[error("refused while a firmware update is in progress")]
    Updating,
    /// No session is established.
    #[error("no active session")]
    NotConnected,
    /// Session-level failure while sending.
    #[error(transparent)]
    Protocol(#[from] crate::protocol::ProtocolError),
}

/// One occupied slot of the handler table.
#[derive(Debug, Clone, Copy)]
pub struct FilteringHandler {
    filter: [u8; MAX_FILTER_LENGTH],
    handler: EventHandler,
    device_id: [u8; DEVICE_ID_LENGTH],
    scope: SubscriptionScope,
}

fn c_strlen(bytes: &[u8]) -> usize {
    bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len())
}

impl FilteringHandler {
    /// Name prefix this handler subscribes to.
    #[must_use]
    pub fn filter(&self) -> &[u8] {
        &self.filter[..c_strlen(&self.filter)]
    }

    /// Target device id for a device-scoped subscription.
    #[must_use]
    pub fn device_id(&self) -> Option<&[u8]> {
        let len = c_strlen(&self.device_id);
        if len == 0 {
            None
        } else {
            Some(&self.device_id[..len])
        }
    }

    #[must_use]
    pub fn scope(&self) -> SubscriptionScope {
        self.scope
    }
}

/// Fixed table of event subscriptions. Survives reconnects; the protocol
/// re-announces every occupied slot after each handshake.
#[derive(Debug, Default)]
pub struct HandlerTable {
    slots: [Option<FilteringHandler>; NUM_EVENT_HANDLERS],
}

impl HandlerTable {
    /// Registers a handler in the first empty slot. An entry identical in
    /// filter, handler, scope, and device id is not duplicated.
    pub fn add(
        &mut self,
        name: &[u8],
        handler: EventHandler,
        scope: SubscriptionScope,
        device_id: Option<&[u8]>,
    ) -> Result<(), EventError> {
        let mut filter = [0u8; MAX_FILTER_LENGTH];
        let filter_len = name.len().min(MAX_FILTER_LENGTH);
        filter[..filter_len].copy_from_slice(&name[..filter_len]);

        let mut id = [0u8; DEVICE_ID_LENGTH];
        if let Some(src) = device_id {
            let id_len = src.len().min(DEVICE_ID_LENGTH);
            id[..id_len].copy_from_slice(&src[..id_len]);
        }

        let exists = self.slots.iter().flatten().any(|entry| {
            entry.handler == handler
                && entry.scope == scope
                && entry.filter == filter
                && entry.device_id == id
        });
        if exists {
            return Ok(());
        }

        match self.slots.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(FilteringHandler {
                    filter,
                    handler,
                    device_id: id,
                    scope,
                });
                Ok(())
            }
            None => Err(EventError::TableFull),
        }
    }

    /// Removes every entry whose filter equals `name`, compacting the rest
    /// toward the front in stable order. `None` clears the table.
    pub fn remove(&mut self, name: Option<&[u8]>) {
        let Some(name) = name else {
            self.slots = [None; NUM_EVENT_HANDLERS];
            return;
        };

        let mut dest = 0;
        for i in 0..NUM_EVENT_HANDLERS {
            let keep = match &self.slots[i] {
                Some(entry) => entry.filter() != name,
                None => false,
            };
            if keep {
                if dest != i {
                    self.slots[dest] = self.slots[i].take();
                }
                dest += 1;
            } else {
                self.slots[i] = None;
            }
        }
    }

    /// Delivers an inbound event to the first entry whose filter is a
    /// byte-wise prefix of `name`. Scanning stops at the first empty slot.
    pub fn dispatch(&self, name: &[u8], data: Option<&[u8]>) {
        for slot in &self.slots {
            let Some(entry) = slot else {
                break;
            };
            let filter = entry.filter();
            if name.len() >= filter.len() && &name[..filter.len()] == filter {
                (entry.handler)(name, data);
                break;
            }
        }
    }

    /// Occupied slots in table order.
    pub fn entries(&self) -> impl Iterator<Item = &FilteringHandler> {
        self.slots.iter().flatten()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Case-insensitive check for the reserved system-event namespace.
#[must_use]
pub fn is_system_event(name: &[u8]) -> bool {
    name.len() >= 5 && name[..5].eq_ignore_ascii_case(b"spark")
}

/// Dual rate limiter over outbound publishes.
///
/// System events get a generous per-"minute" budget, where a minute is the
/// upper 16 bits of the millisecond clock (~65.5 s). Everything else is held
/// to a burst of 4 per sliding second, tracked in a five-slot ring. Denial
/// has no side effects on either limiter.
#[derive(Debug)]
pub struct EventRateLimiter {
    last_minute: u16,
    events_this_minute: u8,
    recent_ticks: [u32; 5],
    tick_index: usize,
}

impl Default for EventRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_minute: 0,
            events_this_minute: 0,
            // Backdated so a fresh session can burst immediately.
            recent_ticks: [0u32.wrapping_sub(BURST_WINDOW_MS); 5],
            tick_index: 0,
        }
    }

    /// Decides whether an event named `name` may be published at `now`.
    pub fn admit(&mut self, name: &[u8], now: u32) -> bool {
        if is_system_event(name) {
            // Equality comparison also handles millis() wrap-around.
            let minute = (now >> 16) as u16;
            if minute == self.last_minute {
                if self.events_this_minute == u8::MAX {
                    return false;
                }
            } else {
                self.last_minute = minute;
                self.events_this_minute = 0;
            }
            self.events_this_minute += 1;
            true
        } else {
            let oldest = self.recent_ticks[(self.tick_index + 1) % self.recent_ticks.len()];
            if now.wrapping_sub(oldest) < BURST_WINDOW_MS {
                return false;
            }
            self.recent_ticks[self.tick_index] = now;
            self.tick_index = (self.tick_index + 1) % self.recent_ticks.len();
            true
        }
    }
}
