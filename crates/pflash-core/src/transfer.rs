//! Transfer engine.
//!
//! Streams decoded records over the flash write characteristic with
//! batched flow control and loss recovery. The device acknowledges
//! every fourth packet rather than each one, bounding in-flight data
//! without per-packet round trips; a `Retransmit` signal rewinds the
//! decoder to the last bookmark and replays the window. Sequence
//! numbers keep incrementing across replays; the device resynchronizes
//! on offset.

use std::fmt;
use std::io::{BufRead, Seek};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::FlashError;
use crate::events::{FlashEvent, FlashObserver};
use crate::hex::{HexError, HexReader};
use crate::link::{CharId, EventPump, GattLink};
use crate::protocol::constants::{ACK_BATCH_SIZE, PACKET_STATE_WAITING};
use crate::protocol::packet::{FlowSignal, TransferPacket};

/// Cooperative cancellation handle shared with the caller. Once set,
/// the engine issues no further writes.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Engine state for one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    AwaitingHandshake,
    Streaming,
    AwaitingDrain,
    Completing,
    Done,
    Failed,
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferState::AwaitingHandshake => write!(f, "AWAITING_HANDSHAKE"),
            TransferState::Streaming => write!(f, "STREAMING"),
            TransferState::AwaitingDrain => write!(f, "AWAITING_DRAIN"),
            TransferState::Completing => write!(f, "COMPLETING"),
            TransferState::Done => write!(f, "DONE"),
            TransferState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Outcome counters for a completed transfer.
#[derive(Debug, Clone)]
pub struct TransferStats {
    pub packets_sent: usize,
    pub lines_flashed: usize,
    pub retransmits: usize,
    pub elapsed: Duration,
}

/// Drives one image transfer over an established link. The decoder
/// must already be positioned at the bookmark preceding the metadata
/// marker (see `HexReader::read_metadata`).
pub struct TransferEngine<'a, L: GattLink, R, O: FlashObserver> {
    pump: &'a mut EventPump<L>,
    hex: &'a mut HexReader<R>,
    observer: &'a O,
    total_lines: usize,
    timeout: Duration,
    pacing: Duration,
    cancel: CancelToken,
    state: TransferState,
    sequence: u16,
    packets_sent: usize,
    lines_flashed: usize,
    retransmits: usize,
}

impl<'a, L: GattLink, R: BufRead + Seek, O: FlashObserver> TransferEngine<'a, L, R, O> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pump: &'a mut EventPump<L>,
        hex: &'a mut HexReader<R>,
        observer: &'a O,
        total_lines: usize,
        timeout: Duration,
        pacing: Duration,
        cancel: CancelToken,
    ) -> Self {
        Self {
            pump,
            hex,
            observer,
            total_lines,
            timeout,
            pacing,
            cancel,
            state: TransferState::AwaitingHandshake,
            sequence: 0,
            packets_sent: 0,
            lines_flashed: 0,
            retransmits: 0,
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Run the transfer to completion.
    pub fn run(&mut self) -> Result<TransferStats, FlashError> {
        let started = Instant::now();
        match self.drive() {
            Ok(()) => {
                self.goto(TransferState::Done);
                let stats = TransferStats {
                    packets_sent: self.packets_sent,
                    lines_flashed: self.lines_flashed,
                    retransmits: self.retransmits,
                    elapsed: started.elapsed(),
                };
                info!(
                    packets = stats.packets_sent,
                    lines = stats.lines_flashed,
                    retransmits = stats.retransmits,
                    elapsed_ms = stats.elapsed.as_millis() as u64,
                    "Transfer complete"
                );
                Ok(stats)
            }
            Err(e) => {
                self.goto(TransferState::Failed);
                Err(e)
            }
        }
    }

    fn drive(&mut self) -> Result<(), FlashError> {
        // Handshake: notifications must be flowing before any packet.
        self.pump
            .link_mut()
            .enable_notifications(CharId::FlashControl)?;
        self.pump
            .await_descriptor_written(CharId::FlashControl, self.timeout)?;
        debug!("Flow-control notifications enabled");

        self.goto(TransferState::Streaming);
        let mut batch_count = 0usize;
        loop {
            self.stream(&mut batch_count)?;

            // A retransmit request for the final window may still be
            // pending; honor it before declaring the image sent.
            self.goto(TransferState::AwaitingDrain);
            match self.pump.try_signal()? {
                Some(byte) if FlowSignal::from_byte(byte) == Some(FlowSignal::Retransmit) => {
                    debug!("Late retransmit request, replaying last window");
                    self.rewind_to_bookmark()?;
                    self.goto(TransferState::Streaming);
                }
                _ => break,
            }
        }

        // The device finalizes and resets on this packet; the link is
        // torn down regardless, so no acknowledgement is awaited.
        self.goto(TransferState::Completing);
        let terminal = TransferPacket::end_of_flash();
        self.pump
            .link_mut()
            .write_without_response(CharId::FlashWrite, &terminal.to_bytes())?;
        self.packets_sent += 1;
        debug!("End-of-flash packet sent");
        Ok(())
    }

    /// Stream records until the first non-Data record (or the end of
    /// the stream, for images without an explicit EndOfFile record).
    fn stream(&mut self, batch_count: &mut usize) -> Result<(), FlashError> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(FlashError::Cancelled);
            }

            let record = match self.hex.next_record() {
                Ok(record) => record,
                Err(HexError::EndOfStream) => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            if !record.record_type.is_data() {
                return Ok(());
            }

            self.sequence = self.sequence.wrapping_add(1);
            let packet = TransferPacket::from_record(&record, self.sequence)?;

            let mut signal = FlowSignal::Waiting;
            let mut resynced = false;
            let write = self
                .pump
                .link_mut()
                .write_without_response(CharId::FlashWrite, &packet.to_bytes());
            if let Err(e) = write {
                warn!(error = %e, sequence = self.sequence, "Packet rejected locally, sending resync");
                let resync = TransferPacket::resync(self.sequence);
                self.pump
                    .link_mut()
                    .write_without_response(CharId::FlashWrite, &resync.to_bytes())?;
                self.packets_sent += 1;
                // The device will see a gap; replay from the bookmark
                // without waiting for its signal.
                signal = FlowSignal::Retransmit;
                resynced = true;
                *batch_count = 0;
            } else {
                self.packets_sent += 1;
            }

            *batch_count += 1;
            if *batch_count == ACK_BATCH_SIZE {
                *batch_count = 0;
                if !resynced {
                    signal = self.await_batch_signal()?;
                }
            } else if !resynced {
                // Inside a batch: pace the link, and pick up an early
                // retransmit request without blocking.
                thread::sleep(self.pacing);
                if let Some(byte) = self.pump.try_signal()? {
                    if FlowSignal::from_byte(byte) == Some(FlowSignal::Retransmit) {
                        signal = FlowSignal::Retransmit;
                    }
                }
            }

            if signal == FlowSignal::Retransmit {
                self.rewind_to_bookmark()?;
            } else {
                self.hex.mark();
                self.lines_flashed += 1;
                let percent = if self.total_lines == 0 {
                    100
                } else {
                    ((self.lines_flashed * 100) / self.total_lines).min(100) as u8
                };
                self.observer.on_event(&FlashEvent::Progress { percent });
            }
        }
    }

    /// Block for the batch acknowledgement. `Waiting` bytes are not an
    /// acknowledgement; keep waiting until the device commits.
    fn await_batch_signal(&mut self) -> Result<FlowSignal, FlashError> {
        loop {
            let byte = self.pump.next_signal(self.timeout)?;
            if byte == PACKET_STATE_WAITING {
                continue;
            }
            return match FlowSignal::from_byte(byte) {
                Some(signal) => Ok(signal),
                None => Err(FlashError::Protocol(format!(
                    "unknown flow signal 0x{byte:02X}"
                ))),
            };
        }
    }

    fn rewind_to_bookmark(&mut self) -> Result<(), FlashError> {
        self.retransmits += 1;
        match self.hex.rewind() {
            Ok(()) => Ok(()),
            Err(HexError::InvalidState) => Err(FlashError::Protocol(
                "retransmit signal with no prior bookmark".to_string(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    fn goto(&mut self, state: TransferState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "Transfer state");
            self.state = state;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;
    use crate::link::{GattLink, MockLink};
    use crate::protocol::constants::{
        PACKET_STATE_RETRANSMIT, PXT_MAGIC, RESYNC_OFFSET,
    };
    use std::io::Cursor;

    fn record_line(address: u16, type_code: u8, data: &str) -> String {
        format!(":{:02X}{:04X}{:02X}{}FF", data.len() / 2, address, type_code, data)
    }

    /// Image with a marker, a hash record, and `n` further data
    /// records at distinct ascending offsets.
    fn image(n: usize) -> HexReader<Cursor<Vec<u8>>> {
        let mut lines = vec![
            record_line(0x0000, 0, PXT_MAGIC),
            record_line(0x0010, 0, "AAAAAAAAAAAAAAAA9999999999999999"),
        ];
        for i in 0..n {
            lines.push(record_line(
                0x0020 + (i as u16) * 0x10,
                0,
                "00112233445566778899AABBCCDDEEFF",
            ));
        }
        lines.push(record_line(0x0000, 1, ""));
        let mut reader = HexReader::new(Cursor::new(lines.join("\n").into_bytes()));
        reader.read_metadata().unwrap();
        reader
    }

    fn pump() -> EventPump<MockLink> {
        let mut mock = MockLink::new();
        mock.connect().unwrap();
        let mut pump = EventPump::new(mock);
        pump.await_connected(Duration::from_millis(100)).unwrap();
        pump
    }

    fn run_engine(
        pump: &mut EventPump<MockLink>,
        hex: &mut HexReader<Cursor<Vec<u8>>>,
        total_lines: usize,
        cancel: CancelToken,
    ) -> Result<TransferStats, FlashError> {
        let observer = NullObserver;
        let mut engine = TransferEngine::new(
            pump,
            hex,
            &observer,
            total_lines,
            Duration::from_millis(200),
            Duration::ZERO,
            cancel,
        );
        engine.run()
    }

    fn offsets(writes: &[Vec<u8>]) -> Vec<u16> {
        writes
            .iter()
            .map(|w| u16::from_be_bytes([w[w.len() - 4], w[w.len() - 3]]))
            .collect()
    }

    #[test]
    fn clean_transfer_ends_with_terminal_packet() {
        let mut pump = pump();
        // 10 data records + marker + hash record = 12 streamed lines.
        let mut hex = image(10);

        let stats = run_engine(&mut pump, &mut hex, 12, CancelToken::new()).unwrap();
        assert_eq!(stats.retransmits, 0);
        assert_eq!(stats.lines_flashed, 12);

        let link = pump.into_inner();
        let writes = link.writes(CharId::FlashWrite);
        assert_eq!(writes.len(), 13); // 12 records + terminal

        let terminal = writes.last().unwrap();
        assert_eq!(&terminal[..8], &[0xFF; 8]);
        assert_eq!(&terminal[8..], &[0xFF, 0xFF, 0xFF, 0xFF]);

        // Sequence numbers are monotonically incrementing from 1.
        for (i, write) in writes[..12].iter().enumerate() {
            let seq = u16::from_be_bytes([write[write.len() - 2], write[write.len() - 1]]);
            assert_eq!(seq, (i + 1) as u16);
        }
    }

    #[test]
    fn retransmit_signal_replays_exactly_the_last_window() {
        let mut pump = pump();
        let mut hex = image(10); // 12 streamed lines
        pump.link_mut().queue_signal(FlowSignal::Sent.as_byte());
        pump.link_mut().queue_signal(PACKET_STATE_RETRANSMIT);

        let stats = run_engine(&mut pump, &mut hex, 12, CancelToken::new()).unwrap();
        assert_eq!(stats.retransmits, 1);

        let writes = pump.link().writes(CharId::FlashWrite);
        let offs = offsets(&writes);

        // Signal after packet 8 requested a resend; the bookmark sat
        // after line 7, so exactly line 8 is replayed.
        let line8_offset = 0x0020 + 5 * 0x10; // marker, hash, then data lines
        assert_eq!(offs.iter().filter(|&&o| o == line8_offset).count(), 2);
        for line in 0..12u16 {
            let expected = match line {
                0 => 0x0000,
                1 => 0x0010,
                n => 0x0020 + (n - 2) * 0x10,
            };
            assert!(offs.contains(&expected), "line {line} missing");
        }
        // 12 lines + 1 replayed + terminal.
        assert_eq!(writes.len(), 14);

        // Sequence numbers never reset across the replay.
        let seqs: Vec<u16> = writes[..13]
            .iter()
            .map(|w| u16::from_be_bytes([w[w.len() - 2], w[w.len() - 1]]))
            .collect();
        assert_eq!(seqs, (1..=13).collect::<Vec<u16>>());
    }

    #[test]
    fn local_write_failure_resyncs_and_replays_from_bookmark() {
        let mut pump = pump();
        // 48 data records + marker + hash = 50 streamed lines.
        let mut hex = image(48);
        pump.link_mut().fail_packet(9); // packet 10 of 50

        let stats = run_engine(&mut pump, &mut hex, 50, CancelToken::new()).unwrap();
        assert!(stats.packets_sent >= 50);
        assert_eq!(stats.retransmits, 1);

        let writes = pump.link().writes(CharId::FlashWrite);
        let offs = offsets(&writes);

        // The resync packet carries the reserved offset.
        assert_eq!(offs.iter().filter(|&&o| o == RESYNC_OFFSET).count(), 1);
        let resync_index = offs.iter().position(|&o| o == RESYNC_OFFSET).unwrap();
        assert_eq!(resync_index, 9);
        assert_eq!(&writes[resync_index][..8], &[0xAA; 8]);

        // Replay resumes at line 10 (the failed packet), so every line
        // is still delivered exactly once.
        for line in 0..50u16 {
            let expected = match line {
                0 => 0x0000,
                1 => 0x0010,
                n => 0x0020 + (n - 2) * 0x10,
            };
            assert_eq!(
                offs.iter().filter(|&&o| o == expected).count(),
                1,
                "line {line}"
            );
        }
        // 9 before the failure + resync + 41 replayed + terminal.
        assert_eq!(writes.len(), 52);
    }

    #[test]
    fn unknown_flow_signal_is_a_protocol_violation() {
        let mut pump = pump();
        let mut hex = image(10);
        pump.link_mut().queue_signal(0x42);

        let err = run_engine(&mut pump, &mut hex, 12, CancelToken::new()).unwrap_err();
        assert!(matches!(err, FlashError::Protocol(_)));
    }

    #[test]
    fn handshake_failure_fails_the_transfer() {
        let mut pump = pump();
        pump.link_mut().fail_descriptor_write();
        let mut hex = image(4);

        let observer = NullObserver;
        let mut engine = TransferEngine::new(
            &mut pump,
            &mut hex,
            &observer,
            6,
            Duration::from_millis(100),
            Duration::ZERO,
            CancelToken::new(),
        );
        assert!(engine.run().is_err());
        assert_eq!(engine.state(), TransferState::Failed);
        assert!(pump.link().writes(CharId::FlashWrite).is_empty());
    }

    #[test]
    fn cancellation_stops_all_writes() {
        let mut pump = pump();
        let mut hex = image(10);
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = run_engine(&mut pump, &mut hex, 12, cancel).unwrap_err();
        assert!(matches!(err, FlashError::Cancelled));
        assert!(pump.link().writes(CharId::FlashWrite).is_empty());
    }

    #[test]
    fn missing_batch_signal_times_out_instead_of_hanging() {
        let mut pump = pump();
        pump.link_mut().set_auto_signal(false);
        let mut hex = image(10);

        let err = run_engine(&mut pump, &mut hex, 12, CancelToken::new()).unwrap_err();
        assert!(matches!(
            err,
            FlashError::Link(crate::link::LinkError::Timeout { .. })
        ));
    }
}
