//! Typed messages between a castwire client and its host application.
//!
//! The client reports everything through [`ClientEvent`]s on a bounded
//! channel; applications either drain the channel themselves or forward each
//! event to a [`ConnectionObserver`].

mod events;
mod state;
mod types;

pub use events::{ClientEvent, ConnectionObserver};
pub use state::{ConnectionState, FailureReason, InvalidTransition};
pub use types::TransportStatistics;

use crossbeam_channel::{Receiver, Sender};

/// Channel capacity for events (client → application).
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Creates a bounded event channel.
pub fn event_channel() -> (Sender<ClientEvent>, Receiver<ClientEvent>) {
    event_channel_with_capacity(EVENT_CHANNEL_CAPACITY)
}

/// Creates a bounded event channel with a custom capacity.
pub fn event_channel_with_capacity(
    capacity: usize,
) -> (Sender<ClientEvent>, Receiver<ClientEvent>) {
    crossbeam_channel::bounded(capacity.max(1))
}
