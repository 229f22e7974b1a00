//! Link layer module.

pub mod mock;
pub mod traits;

pub use mock::MockLink;
pub use traits::{CharId, GattLink, LinkError, LinkEvent};

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Completion-awaiting wrapper around a link.
///
/// Replaces the busy-wait-on-shared-flag pattern: every blocking wait
/// goes through `poll_event` with a deadline, and flow-control
/// notifications that arrive while waiting for some other completion
/// are buffered rather than dropped.
pub struct EventPump<L: GattLink> {
    link: L,
    signals: VecDeque<u8>,
}

impl<L: GattLink> EventPump<L> {
    pub fn new(link: L) -> Self {
        Self {
            link,
            signals: VecDeque::new(),
        }
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn into_inner(self) -> L {
        self.link
    }

    /// Wait for the link-established event.
    pub fn await_connected(&mut self, timeout: Duration) -> Result<(), LinkError> {
        self.await_event(timeout, |event| match event {
            LinkEvent::Connected => Some(()),
            _ => None,
        })
    }

    /// Wait for service discovery to complete.
    pub fn await_services(&mut self, timeout: Duration) -> Result<(), LinkError> {
        self.await_event(timeout, |event| match event {
            LinkEvent::ServicesDiscovered => Some(()),
            _ => None,
        })
    }

    /// Wait for the write completion on `id`.
    pub fn await_written(&mut self, id: CharId, timeout: Duration) -> Result<(), LinkError> {
        self.await_event(timeout, |event| match event {
            LinkEvent::CharacteristicWritten { characteristic } if *characteristic == id => {
                Some(())
            }
            _ => None,
        })
    }

    /// Wait for the read completion on `id` and return the value.
    pub fn await_read(&mut self, id: CharId, timeout: Duration) -> Result<Vec<u8>, LinkError> {
        self.await_event(timeout, |event| match event {
            LinkEvent::CharacteristicRead {
                characteristic,
                value,
            } if *characteristic == id => Some(value.clone()),
            _ => None,
        })
    }

    /// Wait for the descriptor-write completion on `id`.
    pub fn await_descriptor_written(
        &mut self,
        id: CharId,
        timeout: Duration,
    ) -> Result<(), LinkError> {
        self.await_event(timeout, |event| match event {
            LinkEvent::DescriptorWritten { characteristic } if *characteristic == id => Some(()),
            _ => None,
        })
    }

    /// Block until a flow-control signal byte is available.
    pub fn next_signal(&mut self, timeout: Duration) -> Result<u8, LinkError> {
        if let Some(byte) = self.signals.pop_front() {
            return Ok(byte);
        }
        self.await_event(timeout, |event| match event {
            LinkEvent::CharacteristicChanged {
                characteristic: CharId::FlashControl,
                value,
            } => value.first().copied(),
            _ => None,
        })
    }

    /// Non-blocking check for a pending flow-control signal.
    pub fn try_signal(&mut self) -> Result<Option<u8>, LinkError> {
        if let Some(byte) = self.signals.pop_front() {
            return Ok(Some(byte));
        }
        loop {
            match self.link.poll_event(Duration::ZERO) {
                Ok(LinkEvent::CharacteristicChanged {
                    characteristic: CharId::FlashControl,
                    value,
                }) => {
                    if let Some(&byte) = value.first() {
                        return Ok(Some(byte));
                    }
                }
                Ok(LinkEvent::Disconnected) => return Err(LinkError::Disconnected),
                Ok(_) => continue,
                Err(LinkError::Timeout { .. }) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    fn await_event<T>(
        &mut self,
        timeout: Duration,
        matcher: impl Fn(&LinkEvent) -> Option<T>,
    ) -> Result<T, LinkError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(LinkError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            let event = self.link.poll_event(remaining)?;
            if let Some(result) = matcher(&event) {
                return Ok(result);
            }
            match event {
                LinkEvent::Disconnected => return Err(LinkError::Disconnected),
                LinkEvent::CharacteristicChanged {
                    characteristic: CharId::FlashControl,
                    value,
                } => {
                    // Flow signal arriving mid-wait; keep it for the
                    // transfer engine.
                    if let Some(&byte) = value.first() {
                        self.signals.push_back(byte);
                    }
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::PACKET_STATE_SENT;

    #[test]
    fn stray_signals_are_buffered_during_other_waits() {
        let mut mock = MockLink::new();
        mock.push_event(LinkEvent::CharacteristicChanged {
            characteristic: CharId::FlashControl,
            value: vec![PACKET_STATE_SENT],
        });
        mock.push_event(LinkEvent::CharacteristicWritten {
            characteristic: CharId::MemoryMap,
        });

        let mut pump = EventPump::new(mock);
        pump.await_written(CharId::MemoryMap, Duration::from_millis(100))
            .unwrap();
        assert_eq!(pump.try_signal().unwrap(), Some(PACKET_STATE_SENT));
    }

    #[test]
    fn waits_time_out_rather_than_hang() {
        let mut pump = EventPump::new(MockLink::new());
        let err = pump
            .await_written(CharId::MemoryMap, Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, LinkError::Timeout { .. }));
        assert_eq!(pump.try_signal().unwrap(), None);
    }

    #[test]
    fn disconnect_event_aborts_waits() {
        let mut mock = MockLink::new();
        mock.push_event(LinkEvent::Disconnected);
        let mut pump = EventPump::new(mock);
        let err = pump
            .await_written(CharId::MemoryMap, Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, LinkError::Disconnected));
    }
}
