//! Scripted link for testing.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::traits::{CharId, GattLink, LinkError, LinkEvent};
use crate::protocol::constants::{ACK_BATCH_SIZE, PACKET_STATE_SENT};

/// Mock link for unit testing protocol logic.
///
/// Completions are queued as `LinkEvent`s when operations are issued.
/// Flow-control signals are scripted: after every acknowledgement batch
/// of unacknowledged writes, the next scripted signal (default `Sent`)
/// is delivered as a notification.
pub struct MockLink {
    connected: bool,
    service_present: bool,
    missing_characteristics: HashSet<CharId>,
    events: VecDeque<LinkEvent>,
    /// Captured writes, shared so assertions survive moving the link
    /// into a session.
    write_log: Arc<Mutex<Vec<(CharId, Vec<u8>)>>>,
    read_queue: VecDeque<Vec<u8>>,
    signal_script: VecDeque<u8>,
    auto_signal: bool,
    packets_in_batch: usize,
    packets_accepted: usize,
    fail_packet_indices: HashSet<usize>,
    fail_descriptor_write: bool,
    disconnect_after_packets: Option<usize>,
}

impl MockLink {
    pub fn new() -> Self {
        Self {
            connected: false,
            service_present: true,
            missing_characteristics: HashSet::new(),
            events: VecDeque::new(),
            write_log: Arc::new(Mutex::new(Vec::new())),
            read_queue: VecDeque::new(),
            signal_script: VecDeque::new(),
            auto_signal: true,
            packets_in_batch: 0,
            packets_accepted: 0,
            fail_packet_indices: HashSet::new(),
            fail_descriptor_write: false,
            disconnect_after_packets: None,
        }
    }

    /// Queue a value to be returned by the next characteristic read.
    pub fn queue_read(&mut self, value: &[u8]) {
        self.read_queue.push_back(value.to_vec());
    }

    /// Script the flow-control signal for an upcoming batch. Unscripted
    /// batches are acknowledged with `Sent`.
    pub fn queue_signal(&mut self, byte: u8) {
        self.signal_script.push_back(byte);
    }

    /// Disable per-batch signal delivery entirely.
    pub fn set_auto_signal(&mut self, enabled: bool) {
        self.auto_signal = enabled;
    }

    /// Reject the Nth unacknowledged write (0-based) as a local queuing
    /// failure.
    pub fn fail_packet(&mut self, index: usize) {
        self.fail_packet_indices.insert(index);
    }

    /// Make the notification-enable descriptor write fail.
    pub fn fail_descriptor_write(&mut self) {
        self.fail_descriptor_write = true;
    }

    /// Drop the link after the Nth accepted unacknowledged write.
    pub fn disconnect_after_packets(&mut self, count: usize) {
        self.disconnect_after_packets = Some(count);
    }

    /// Pretend the service is absent.
    pub fn remove_service(&mut self) {
        self.service_present = false;
    }

    /// Pretend a single characteristic is absent.
    pub fn remove_characteristic(&mut self, id: CharId) {
        self.missing_characteristics.insert(id);
    }

    /// Inject an arbitrary event (stray notification, disconnect).
    pub fn push_event(&mut self, event: LinkEvent) {
        self.events.push_back(event);
    }

    /// All captured writes on one characteristic, in order.
    pub fn writes(&self, id: CharId) -> Vec<Vec<u8>> {
        self.write_log
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| *c == id)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Shared handle to the write log, usable after the link itself has
    /// been moved elsewhere.
    pub fn log_handle(&self) -> Arc<Mutex<Vec<(CharId, Vec<u8>)>>> {
        Arc::clone(&self.write_log)
    }

    fn check_characteristic(&self, id: CharId) -> Result<(), LinkError> {
        if !self.connected {
            return Err(LinkError::NotConnected);
        }
        if !self.has_characteristic(id) {
            return Err(LinkError::CharacteristicNotFound(id));
        }
        Ok(())
    }
}

impl Default for MockLink {
    fn default() -> Self {
        Self::new()
    }
}

impl GattLink for MockLink {
    fn connect(&mut self) -> Result<(), LinkError> {
        self.connected = true;
        self.events.push_back(LinkEvent::Connected);
        Ok(())
    }

    fn discover_services(&mut self) -> Result<(), LinkError> {
        if !self.connected {
            return Err(LinkError::NotConnected);
        }
        self.events.push_back(LinkEvent::ServicesDiscovered);
        Ok(())
    }

    fn has_characteristic(&self, id: CharId) -> bool {
        self.service_present && !self.missing_characteristics.contains(&id)
    }

    fn write_characteristic(&mut self, id: CharId, value: &[u8]) -> Result<(), LinkError> {
        self.check_characteristic(id)?;
        self.write_log.lock().unwrap().push((id, value.to_vec()));
        self.events
            .push_back(LinkEvent::CharacteristicWritten { characteristic: id });
        Ok(())
    }

    fn read_characteristic(&mut self, id: CharId) -> Result<(), LinkError> {
        self.check_characteristic(id)?;
        if let Some(value) = self.read_queue.pop_front() {
            self.events.push_back(LinkEvent::CharacteristicRead {
                characteristic: id,
                value,
            });
        }
        Ok(())
    }

    fn write_without_response(&mut self, id: CharId, value: &[u8]) -> Result<(), LinkError> {
        self.check_characteristic(id)?;

        let packet_index = self.packets_accepted;
        if self.fail_packet_indices.remove(&packet_index) {
            return Err(LinkError::OperationRejected(
                "local write queue full".to_string(),
            ));
        }

        self.write_log.lock().unwrap().push((id, value.to_vec()));
        self.packets_accepted += 1;

        if self.disconnect_after_packets == Some(self.packets_accepted) {
            self.connected = false;
            self.events.push_back(LinkEvent::Disconnected);
            return Ok(());
        }

        if self.auto_signal && id == CharId::FlashWrite {
            self.packets_in_batch += 1;
            if self.packets_in_batch == ACK_BATCH_SIZE {
                self.packets_in_batch = 0;
                let byte = self.signal_script.pop_front().unwrap_or(PACKET_STATE_SENT);
                self.events.push_back(LinkEvent::CharacteristicChanged {
                    characteristic: CharId::FlashControl,
                    value: vec![byte],
                });
            }
        }
        Ok(())
    }

    fn enable_notifications(&mut self, id: CharId) -> Result<(), LinkError> {
        self.check_characteristic(id)?;
        if self.fail_descriptor_write {
            return Err(LinkError::OperationRejected(
                "descriptor write rejected".to_string(),
            ));
        }
        self.events
            .push_back(LinkEvent::DescriptorWritten { characteristic: id });
        Ok(())
    }

    fn poll_event(&mut self, timeout: Duration) -> Result<LinkEvent, LinkError> {
        if let Some(event) = self.events.pop_front() {
            return Ok(event);
        }
        // No event scripted; behave like a silent device.
        if !timeout.is_zero() {
            thread::sleep(timeout.min(Duration::from_millis(50)));
        }
        Err(LinkError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        })
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::PACKET_STATE_RETRANSMIT;

    #[test]
    fn completions_follow_operations() {
        let mut mock = MockLink::new();
        mock.connect().unwrap();
        assert_eq!(
            mock.poll_event(Duration::ZERO).unwrap(),
            LinkEvent::Connected
        );

        mock.write_characteristic(CharId::MemoryMap, &[0xFF]).unwrap();
        assert_eq!(
            mock.poll_event(Duration::ZERO).unwrap(),
            LinkEvent::CharacteristicWritten {
                characteristic: CharId::MemoryMap
            }
        );
        assert_eq!(mock.writes(CharId::MemoryMap), vec![vec![0xFF]]);
    }

    #[test]
    fn signals_are_delivered_per_batch() {
        let mut mock = MockLink::new();
        mock.connect().unwrap();
        mock.queue_signal(PACKET_STATE_RETRANSMIT);

        for _ in 0..ACK_BATCH_SIZE {
            mock.write_without_response(CharId::FlashWrite, &[0x00])
                .unwrap();
        }
        assert_eq!(
            mock.poll_event(Duration::ZERO).unwrap(),
            LinkEvent::CharacteristicChanged {
                characteristic: CharId::FlashControl,
                value: vec![PACKET_STATE_RETRANSMIT],
            }
        );
    }

    #[test]
    fn scripted_packet_failure_is_local() {
        let mut mock = MockLink::new();
        mock.connect().unwrap();
        mock.fail_packet(1);

        assert!(mock.write_without_response(CharId::FlashWrite, &[1]).is_ok());
        assert!(mock.write_without_response(CharId::FlashWrite, &[2]).is_err());
        // The failed packet is not captured; the next one is.
        assert!(mock.write_without_response(CharId::FlashWrite, &[3]).is_ok());
        assert_eq!(mock.writes(CharId::FlashWrite).len(), 2);
    }

    #[test]
    fn log_handle_outlives_the_link() {
        let mut mock = MockLink::new();
        mock.connect().unwrap();
        let log = mock.log_handle();
        mock.write_characteristic(CharId::MemoryMap, &[0x01]).unwrap();
        drop(mock);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn missing_characteristic_rejects_operations() {
        let mut mock = MockLink::new();
        mock.connect().unwrap();
        mock.remove_characteristic(CharId::FlashControl);
        assert!(!mock.has_characteristic(CharId::FlashControl));
        assert!(mock.enable_notifications(CharId::FlashControl).is_err());
    }
}
