//! The stream handle callers actually receive, and the events it and the stream-opening
//! tasks report back to the owning [`super::cpool::ConnectionPool`].

use std::ops::{Deref, DerefMut};

use tokio::sync::mpsc;

use crate::{pool::ConnectionId, transport::Channel};

/// Reported by a spawned stream-open task or by [`PooledChannel::drop`], drained by the
/// connection pool worker to keep its per-connection accounting current.
pub(crate) enum StreamEvent {
    /// `open_stream` completed successfully; the pool should record the stream as open.
    Opened { connection_id: ConnectionId },
    /// `open_stream` failed after a reservation had already been made for it.
    OpenFailed { connection_id: ConnectionId },
    /// A previously opened stream closed.
    Closed { connection_id: ConnectionId },
}

/// A stream handle leased from the pool.
///
/// The pool never learns a stream has closed through a callback from the transport; instead
/// this wrapper reports exactly one [`StreamEvent::Closed`] when it is dropped, so the stream
/// is always accounted for whether the caller finishes normally or drops it early.
#[derive(Debug)]
pub struct PooledChannel {
    channel: Option<Channel>,
    connection_id: ConnectionId,
    events: mpsc::Sender<StreamEvent>,
}

impl PooledChannel {
    pub(crate) fn new(channel: Channel, connection_id: ConnectionId, events: mpsc::Sender<StreamEvent>) -> Self {
        Self {
            channel: Some(channel),
            connection_id,
            events,
        }
    }
}

impl Deref for PooledChannel {
    type Target = Channel;

    fn deref(&self) -> &Channel {
        self.channel.as_ref().expect("channel taken before drop")
    }
}

impl DerefMut for PooledChannel {
    fn deref_mut(&mut self) -> &mut Channel {
        self.channel.as_mut().expect("channel taken before drop")
    }
}

impl Drop for PooledChannel {
    fn drop(&mut self) {
        let _ = self.events.try_send(StreamEvent::Closed {
            connection_id: self.connection_id,
        });
    }
}
