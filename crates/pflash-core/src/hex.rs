//! Firmware image record decoding.
//!
//! The image is a line-oriented hexadecimal record format. Each line
//! encodes byte count, a 16-bit address, a record type, and payload at
//! fixed character offsets. The decoder tracks the current memory
//! segment, supports a bookmark/rewind facility for retransmission, and
//! extracts the PXT metadata hashes that gate partial flashing.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

use thiserror::Error;

use crate::protocol::constants::{EMBEDDED_SOURCE_MARKER, HASH_HEX_LEN, PXT_MAGIC};

#[derive(Error, Debug)]
pub enum HexError {
    #[error("Image not found: {0}")]
    NotFound(String),

    #[error("End of record stream")]
    EndOfStream,

    #[error("Metadata marker not found in image")]
    MarkerNotFound,

    #[error("Rewind without a prior mark")]
    InvalidState,

    #[error("Malformed record at line {line}: {reason}")]
    MalformedRecord { line: usize, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Record type codes defined by the image format. Only Data, EndOfFile
/// and ExtendedSegmentAddress are consumed by this protocol; the rest
/// pass through unmodified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Data,
    EndOfFile,
    ExtendedSegmentAddress,
    Other(u8),
}

impl RecordType {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => RecordType::Data,
            1 => RecordType::EndOfFile,
            4 => RecordType::ExtendedSegmentAddress,
            other => RecordType::Other(other),
        }
    }

    pub fn is_data(&self) -> bool {
        matches!(self, RecordType::Data)
    }
}

/// One decoded record. Immutable once produced; `data` holds exactly
/// `2 * byte_count` hex characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub record_type: RecordType,
    pub address: u16,
    pub byte_count: u8,
    pub data: String,
}

impl Record {
    /// Decode a record from one line. Field positions are fixed:
    /// byte count at chars [1,3), address [3,7), type [7,9), data
    /// [9, 9+2*count).
    pub fn parse(line: &str, line_no: usize) -> Result<Self, HexError> {
        let malformed = |reason: &str| HexError::MalformedRecord {
            line: line_no,
            reason: reason.to_string(),
        };

        if !line.is_ascii() {
            return Err(malformed("non-ASCII characters"));
        }
        if line.len() < 9 {
            return Err(malformed("shorter than record header"));
        }

        let byte_count = u8::from_str_radix(&line[1..3], 16)
            .map_err(|_| malformed("invalid byte count field"))?;
        let address = u16::from_str_radix(&line[3..7], 16)
            .map_err(|_| malformed("invalid address field"))?;
        let type_code = u8::from_str_radix(&line[7..9], 16)
            .map_err(|_| malformed("invalid type field"))?;

        let data_len = 2 * byte_count as usize;
        if line.len() < 9 + data_len {
            return Err(malformed("data field shorter than declared count"));
        }
        let data = &line[9..9 + data_len];
        if !data.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(malformed("non-hexadecimal data field"));
        }

        Ok(Self {
            record_type: RecordType::from_code(type_code),
            address,
            byte_count,
            data: data.to_string(),
        })
    }

    /// Raw payload bytes. Hex validity was checked at parse time.
    pub fn payload_bytes(&self) -> Vec<u8> {
        self.data
            .as_bytes()
            .chunks(2)
            .map(|pair| {
                let hi = (pair[0] as char).to_digit(16).unwrap_or(0) as u8;
                let lo = (pair[1] as char).to_digit(16).unwrap_or(0) as u8;
                (hi << 4) | lo
            })
            .collect()
    }
}

/// Saved position in the record stream. Only valid for the reader
/// instance that produced it.
#[derive(Debug, Clone, Copy)]
pub struct Bookmark {
    pos: u64,
    segment_base: u32,
    lines_read: usize,
}

/// Metadata extracted from the records following the magic marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexMetadata {
    pub template_hash: String,
    pub program_hash: String,
    /// Absolute address of the marker record (segment base + offset).
    pub marker_address: u32,
    /// Records consumed up to and including the marker; excluded from
    /// the progress denominator.
    pub lines_to_marker: usize,
}

/// Sequential record reader with bookmark support.
pub struct HexReader<R> {
    inner: R,
    pos: u64,
    segment_base: u32,
    lines_read: usize,
    mark: Option<Bookmark>,
}

impl HexReader<BufReader<File>> {
    /// Open an image file for decoding.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, HexError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                HexError::NotFound(path.display().to_string())
            } else {
                HexError::Io(e)
            }
        })?;
        Ok(Self::new(BufReader::new(file)))
    }

    /// Count records in a separate pass over the image, stopping before
    /// a line containing the embedded-source marker. Opens its own
    /// handle; the reader's position is unaffected.
    pub fn count_lines<P: AsRef<Path>>(path: P) -> Result<usize, HexError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                HexError::NotFound(path.display().to_string())
            } else {
                HexError::Io(e)
            }
        })?;
        Self::count_lines_in(BufReader::new(file))
    }
}

impl<R: BufRead + Seek> HexReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            pos: 0,
            segment_base: 0,
            lines_read: 0,
            mark: None,
        }
    }

    /// Records consumed so far.
    pub fn lines_read(&self) -> usize {
        self.lines_read
    }

    /// Current segment base, updated by ExtendedSegmentAddress records.
    pub fn segment_base(&self) -> u32 {
        self.segment_base
    }

    /// Decode the next record. Blank lines are skipped; `EndOfStream`
    /// when nothing remains.
    pub fn next_record(&mut self) -> Result<Record, HexError> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = self.inner.read_line(&mut line)?;
            if n == 0 {
                return Err(HexError::EndOfStream);
            }
            self.pos += n as u64;
            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                continue;
            }
            self.lines_read += 1;

            let record = Record::parse(trimmed, self.lines_read)?;
            if record.record_type == RecordType::ExtendedSegmentAddress {
                let base = u32::from_str_radix(&record.data, 16).map_err(|_| {
                    HexError::MalformedRecord {
                        line: self.lines_read,
                        reason: "invalid segment address".to_string(),
                    }
                })?;
                self.segment_base = base << 16;
            }
            return Ok(record);
        }
    }

    /// Scan forward for the first Data record whose payload equals
    /// `pattern` and return its absolute address. On success the
    /// bookmark is set one record before the match, so a rewind replays
    /// the marker record. `MarkerNotFound` if an EndOfFile record (or
    /// the end of the stream) is reached first.
    pub fn find_marker(&mut self, pattern: &str) -> Result<u32, HexError> {
        loop {
            let before = self.position();
            let record = match self.next_record() {
                Ok(r) => r,
                Err(HexError::EndOfStream) => return Err(HexError::MarkerNotFound),
                Err(e) => return Err(e),
            };
            match record.record_type {
                RecordType::Data if record.data == pattern => {
                    self.mark = Some(before);
                    return Ok(self.segment_base + record.address as u32);
                }
                RecordType::EndOfFile => return Err(HexError::MarkerNotFound),
                _ => {}
            }
        }
    }

    /// Set the bookmark to the current position.
    pub fn mark(&mut self) {
        self.mark = Some(self.position());
    }

    /// Rewind to the bookmark. The mark stays valid, so a stream of
    /// retransmit signals replays the same window repeatedly.
    pub fn rewind(&mut self) -> Result<(), HexError> {
        let bookmark = self.mark.ok_or(HexError::InvalidState)?;
        self.inner.seek(SeekFrom::Start(bookmark.pos))?;
        self.pos = bookmark.pos;
        self.segment_base = bookmark.segment_base;
        self.lines_read = bookmark.lines_read;
        Ok(())
    }

    /// Locate the PXT metadata: the magic marker record followed by a
    /// record carrying the template and program hashes. Leaves the
    /// reader rewound to one record before the marker, ready for
    /// streaming.
    pub fn read_metadata(&mut self) -> Result<HexMetadata, HexError> {
        let marker_address = self.find_marker(PXT_MAGIC)?;
        let lines_to_marker = self.lines_read;

        let hashes = self.next_record()?;
        if hashes.data.len() < 2 * HASH_HEX_LEN {
            return Err(HexError::MalformedRecord {
                line: self.lines_read,
                reason: "hash record shorter than two hashes".to_string(),
            });
        }
        let template_hash = hashes.data[..HASH_HEX_LEN].to_string();
        let program_hash = hashes.data[HASH_HEX_LEN..2 * HASH_HEX_LEN].to_string();

        self.rewind()?;

        Ok(HexMetadata {
            template_hash,
            program_hash,
            marker_address,
            lines_to_marker,
        })
    }

    /// Count records up to (not including) a line containing the
    /// embedded-source marker. A marker-less image yields the full line
    /// count rather than an error.
    pub fn count_lines_in(mut reader: R) -> Result<usize, HexError> {
        let mut lines = 0;
        let mut buf = String::new();
        loop {
            buf.clear();
            if reader.read_line(&mut buf)? == 0 {
                return Ok(lines);
            }
            if buf.contains(EMBEDDED_SOURCE_MARKER) {
                return Ok(lines);
            }
            if !buf.trim_end_matches(['\r', '\n']).is_empty() {
                lines += 1;
            }
        }
    }

    fn position(&self) -> Bookmark {
        Bookmark {
            pos: self.pos,
            segment_base: self.segment_base,
            lines_read: self.lines_read,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn record_line(address: u16, type_code: u8, data: &str) -> String {
        format!(":{:02X}{:04X}{:02X}{}FF", data.len() / 2, address, type_code, data)
    }

    fn reader(lines: &[String]) -> HexReader<Cursor<Vec<u8>>> {
        HexReader::new(Cursor::new(lines.join("\n").into_bytes()))
    }

    fn sample_image() -> Vec<String> {
        vec![
            record_line(0x0000, 4, "0003"),
            record_line(0x0000, 0, "00112233445566778899AABBCCDDEEFF"),
            record_line(0x0010, 0, PXT_MAGIC),
            record_line(0x0020, 0, "AAAAAAAAAAAAAAAA9999999999999999"),
            record_line(0x0030, 0, "DEADBEEFDEADBEEFDEADBEEFDEADBEEF"),
            record_line(0x0040, 0, "CAFEBABECAFEBABECAFEBABECAFEBABE"),
            record_line(0x0000, 1, ""),
        ]
    }

    #[test]
    fn parses_record_fields() {
        let line = record_line(0x1234, 0, "00FF");
        let record = Record::parse(&line, 1).unwrap();
        assert_eq!(record.record_type, RecordType::Data);
        assert_eq!(record.address, 0x1234);
        assert_eq!(record.byte_count, 2);
        assert_eq!(record.data, "00FF");
        assert_eq!(record.payload_bytes(), vec![0x00, 0xFF]);
    }

    #[test]
    fn unknown_record_types_pass_through() {
        let line = record_line(0x0000, 5, "AB");
        let record = Record::parse(&line, 1).unwrap();
        assert_eq!(record.record_type, RecordType::Other(5));
    }

    #[test]
    fn malformed_hex_is_rejected() {
        // 'G' inside the data field
        let err = Record::parse(":02000000GG00FF", 3).unwrap_err();
        assert!(matches!(err, HexError::MalformedRecord { line: 3, .. }));

        // data field shorter than the declared byte count
        let err = Record::parse(":10000000AABB", 4).unwrap_err();
        assert!(matches!(err, HexError::MalformedRecord { line: 4, .. }));
    }

    #[test]
    fn segment_base_tracks_extended_address_records() {
        let mut reader = reader(&sample_image());
        reader.next_record().unwrap();
        assert_eq!(reader.segment_base(), 0x0003_0000);
    }

    #[test]
    fn find_marker_returns_absolute_address() {
        let mut reader = reader(&sample_image());
        let address = reader.find_marker(PXT_MAGIC).unwrap();
        assert_eq!(address, 0x0003_0010);
    }

    #[test]
    fn find_marker_fails_on_end_of_file_record() {
        let mut reader = reader(&sample_image());
        let err = reader.find_marker("0000000000000000").unwrap_err();
        assert!(matches!(err, HexError::MarkerNotFound));
    }

    #[test]
    fn bookmark_round_trip_replays_identical_records() {
        let mut reader = reader(&sample_image());
        reader.find_marker(PXT_MAGIC).unwrap();

        // Forward-only read from the marker position.
        reader.rewind().unwrap();
        let forward: Vec<Record> = std::iter::from_fn(|| reader.next_record().ok()).collect();

        reader.rewind().unwrap();
        let replayed: Vec<Record> = std::iter::from_fn(|| reader.next_record().ok()).collect();

        assert_eq!(forward.len(), 5); // marker, hashes, 2 data, EOF
        assert_eq!(forward, replayed);
        assert_eq!(replayed[0].data, PXT_MAGIC);
    }

    #[test]
    fn rewind_without_mark_is_invalid() {
        let mut reader = reader(&sample_image());
        assert!(matches!(reader.rewind(), Err(HexError::InvalidState)));
    }

    #[test]
    fn mark_and_rewind_keep_line_counter_consistent() {
        let mut reader = reader(&sample_image());
        reader.next_record().unwrap();
        reader.next_record().unwrap();
        reader.mark();
        let marked_lines = reader.lines_read();

        reader.next_record().unwrap();
        reader.next_record().unwrap();
        reader.rewind().unwrap();
        assert_eq!(reader.lines_read(), marked_lines);

        let record = reader.next_record().unwrap();
        assert_eq!(record.data, PXT_MAGIC);
    }

    #[test]
    fn metadata_extraction() {
        let mut reader = reader(&sample_image());
        let meta = reader.read_metadata().unwrap();
        assert_eq!(meta.template_hash, "AAAAAAAAAAAAAAAA");
        assert_eq!(meta.program_hash, "9999999999999999");
        assert_eq!(meta.marker_address, 0x0003_0010);
        assert_eq!(meta.lines_to_marker, 3);

        // Reader is left positioned to replay the marker record.
        assert_eq!(reader.next_record().unwrap().data, PXT_MAGIC);
    }

    #[test]
    fn metadata_requires_two_hashes() {
        let lines = vec![
            record_line(0x0000, 0, PXT_MAGIC),
            record_line(0x0010, 0, "AAAAAAAAAAAAAAAA"),
            record_line(0x0000, 1, ""),
        ];
        let mut reader = reader(&lines);
        assert!(matches!(
            reader.read_metadata(),
            Err(HexError::MalformedRecord { .. })
        ));
    }

    #[test]
    fn count_lines_stops_at_embedded_source_marker() {
        let mut lines = sample_image();
        lines.insert(5, record_line(0x0050, 0, "41140E2FB82FA2BB41140E2FB82FA2BB"));
        let count =
            HexReader::count_lines_in(Cursor::new(lines.join("\n").into_bytes())).unwrap();
        assert_eq!(count, 5);
    }

    #[test]
    fn count_lines_without_marker_counts_everything() {
        let lines = sample_image();
        let count =
            HexReader::count_lines_in(Cursor::new(lines.join("\n").into_bytes())).unwrap();
        assert_eq!(count, 7);
    }
}
