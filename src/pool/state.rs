//! Per-connection stream accounting, tied to the peer's HTTP/2 SETTINGS.

use std::sync::Arc;

use crate::transport::Multiplexer;

/// A snapshot of a connection's stream utilization: `(open, max_available)`.
pub(crate) type Utilization = (u32, u32);

/// The stream accounting for one connection manager.
///
/// Becomes available on the first SETTINGS frame and unavailable again on disconnect;
/// `reserved`/`open` are only meaningful while `availability` is `Some`.
#[derive(Debug)]
pub(crate) struct PerConnectionState {
    availability: Option<Availability>,
}

#[derive(Debug)]
struct Availability {
    multiplexer: Arc<dyn Multiplexer>,
    max_available: u32,
    reserved: u32,
    open: u32,
    quiescing: bool,
}

impl PerConnectionState {
    pub(crate) fn new() -> Self {
        Self { availability: None }
    }

    /// Records a SETTINGS frame, (re)establishing availability with `multiplexer`. Returns the
    /// previous `max_available`, or `None` if this is the first SETTINGS frame for the current
    /// connection instance (signalling "newly ready" to the caller).
    pub(crate) fn update_max_concurrent_streams(
        &mut self,
        multiplexer: Arc<dyn Multiplexer>,
        n: u32,
    ) -> Option<u32> {
        match &mut self.availability {
            Some(avail) => {
                let prev = avail.max_available;
                avail.max_available = n;
                avail.multiplexer = multiplexer;
                Some(prev)
            }
            None => {
                self.availability = Some(Availability {
                    multiplexer,
                    max_available: n,
                    reserved: 0,
                    open: 0,
                    quiescing: false,
                });
                None
            }
        }
    }

    /// Reserves a stream slot and returns the multiplexer to open it on, iff a slot is
    /// available and the connection is not quiescing.
    pub(crate) fn reserve(&mut self) -> Option<Arc<dyn Multiplexer>> {
        let avail = self.availability.as_mut()?;
        if avail.quiescing || avail.reserved >= avail.max_available {
            return None;
        }
        avail.reserved += 1;
        Some(avail.multiplexer.clone())
    }

    /// Releases a reservation that was never followed by `stream_opened`, e.g. because
    /// `open_stream` itself failed. Keeps `reserved` accurate without double-counting a
    /// `stream_closed` that will never come.
    pub(crate) fn release_unopened_reservation(&mut self) {
        if let Some(avail) = self.availability.as_mut() {
            avail.reserved = avail.reserved.saturating_sub(1);
        }
    }

    /// Marks one reserved stream as opened, returning the new utilization.
    pub(crate) fn stream_opened(&mut self) -> Utilization {
        let avail = self
            .availability
            .as_mut()
            .expect("stream_opened on connection with no availability");
        avail.open += 1;
        debug_assert!(avail.open <= avail.reserved);
        (avail.open, avail.max_available)
    }

    /// Marks one open stream as closed, decrementing both `open` and `reserved`. Returns the
    /// resulting utilization.
    pub(crate) fn stream_closed(&mut self) -> Utilization {
        let avail = self
            .availability
            .as_mut()
            .expect("stream_closed on connection with no availability");
        debug_assert!(avail.open > 0);
        debug_assert!(avail.reserved > 0);
        avail.open = avail.open.saturating_sub(1);
        avail.reserved = avail.reserved.saturating_sub(1);
        (avail.open, avail.max_available)
    }

    /// Marks this connection as quiescing: it keeps serving already-open streams but refuses
    /// new reservations.
    pub(crate) fn mark_quiescing(&mut self) {
        if let Some(avail) = self.availability.as_mut() {
            avail.quiescing = true;
        }
    }

    /// Clears availability entirely, returning the reservation count the pool must refund to
    /// the pool manager.
    pub(crate) fn mark_unavailable(&mut self) -> u32 {
        self.availability
            .take()
            .map(|avail| avail.reserved)
            .unwrap_or(0)
    }

    pub(crate) fn available_streams(&self) -> u32 {
        match &self.availability {
            Some(avail) if !avail.quiescing => avail.max_available.saturating_sub(avail.reserved),
            _ => 0,
        }
    }

    pub(crate) fn reserved_streams(&self) -> u32 {
        self.availability.as_ref().map_or(0, |a| a.reserved)
    }

    pub(crate) fn max_available_streams(&self) -> u32 {
        self.availability.as_ref().map_or(0, |a| a.max_available)
    }

    pub(crate) fn is_quiescing(&self) -> bool {
        self.availability.as_ref().is_some_and(|a| a.quiescing)
    }

    pub(crate) fn is_available(&self) -> bool {
        self.availability.is_some()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug)]
    struct StubMultiplexer;
    impl Multiplexer for StubMultiplexer {
        fn open_stream(
            &self,
            _initializer: Arc<dyn crate::transport::StreamInitializer>,
        ) -> crate::transport::BoxFuture<'static, crate::error::Result<crate::transport::Channel>>
        {
            unimplemented!("not exercised in these unit tests")
        }
    }

    fn mux() -> Arc<dyn Multiplexer> {
        Arc::new(StubMultiplexer)
    }

    #[test]
    fn first_settings_returns_none_and_establishes_availability() {
        let mut pcs = PerConnectionState::new();
        assert!(!pcs.is_available());
        let prev = pcs.update_max_concurrent_streams(mux(), 100);
        assert_eq!(prev, None);
        assert!(pcs.is_available());
        assert_eq!(pcs.available_streams(), 100);
    }

    #[test]
    fn subsequent_settings_returns_previous_value() {
        let mut pcs = PerConnectionState::new();
        pcs.update_max_concurrent_streams(mux(), 100);
        let prev = pcs.update_max_concurrent_streams(mux(), 50);
        assert_eq!(prev, Some(100));
        assert_eq!(pcs.max_available_streams(), 50);
    }

    #[test]
    fn reserve_open_close_round_trips_available_streams() {
        let mut pcs = PerConnectionState::new();
        pcs.update_max_concurrent_streams(mux(), 10);
        let before = pcs.available_streams();
        assert!(pcs.reserve().is_some());
        pcs.stream_opened();
        assert_eq!(pcs.reserved_streams(), 1);
        pcs.stream_closed();
        assert_eq!(pcs.available_streams(), before);
        assert_eq!(pcs.reserved_streams(), 0);
    }

    #[test]
    fn reserve_fails_when_saturated() {
        let mut pcs = PerConnectionState::new();
        pcs.update_max_concurrent_streams(mux(), 1);
        assert!(pcs.reserve().is_some());
        assert!(pcs.reserve().is_none());
    }

    #[test]
    fn quiescing_blocks_new_reservations_but_preserves_open() {
        let mut pcs = PerConnectionState::new();
        pcs.update_max_concurrent_streams(mux(), 10);
        pcs.reserve();
        pcs.stream_opened();
        pcs.mark_quiescing();
        assert_eq!(pcs.available_streams(), 0);
        assert!(pcs.reserve().is_none());
        assert_eq!(pcs.reserved_streams(), 1);
    }

    #[test]
    fn mark_unavailable_returns_dropped_reservations() {
        let mut pcs = PerConnectionState::new();
        pcs.update_max_concurrent_streams(mux(), 10);
        pcs.reserve();
        pcs.reserve();
        let dropped = pcs.mark_unavailable();
        assert_eq!(dropped, 2);
        assert!(!pcs.is_available());
        assert_eq!(pcs.available_streams(), 0);
    }
}
