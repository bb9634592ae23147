//! Journal records and their binary encoding.
//!
//! ## Frame
//!
//! ```text
//! | "<JR:" (4) | generation (16) | length u32 | crc32 u32 | ":>" (2) | payload (length) | "</JR" (4) | generation (16) |
//! ```
//!
//! ## Payload
//!
//! ```text
//! | name len u8 | status name | status code u8 | record length u32 | time i64 | sequence u64 |
//! | rolled-over u8 | gtrid len u16 | gtrid | name count u32 | (len u16 | unique name)* |
//! ```
//!
//! All integers are little-endian. The CRC covers the payload only.

use crate::error::{JournalError, JournalResult};
use crate::types::{Gtrid, TxStatus};
use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Marker opening a record header.
pub const RECORD_PREFIX: [u8; 4] = *b"<JR:";

/// Marker closing a record header.
pub const RECORD_SUFFIX: [u8; 2] = *b":>";

/// Marker opening a record trailer.
pub const RECORD_TRAILER: [u8; 4] = *b"</JR";

/// Size of a generation delimiter.
pub const DELIMITER_SIZE: usize = 16;

/// Size of the record header: prefix, delimiter, length, crc, suffix.
pub const RECORD_HEADER_SIZE: usize = RECORD_PREFIX.len() + DELIMITER_SIZE + 4 + 4 + RECORD_SUFFIX.len();

/// Size of the record trailer: trailer marker and delimiter.
pub const RECORD_TRAILER_SIZE: usize = RECORD_TRAILER.len() + DELIMITER_SIZE;

/// Framing bytes added around every payload.
pub const RECORD_OVERHEAD: usize = RECORD_HEADER_SIZE + RECORD_TRAILER_SIZE;

/// Computes the CRC32 (IEEE) of a payload.
#[must_use]
pub fn compute_crc32(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// One transaction status change as stored in the journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRecord {
    status: TxStatus,
    gtrid: Gtrid,
    unique_names: BTreeSet<String>,
    time: i64,
    sequence: u64,
    rolled_over: bool,
    valid: bool,
}

impl JournalRecord {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn new(status: TxStatus, gtrid: Gtrid, unique_names: BTreeSet<String>, sequence: u64) -> Self {
        Self {
            status,
            gtrid,
            unique_names,
            time: now_millis(),
            sequence,
            rolled_over: false,
            valid: true,
        }
    }

    /// Transaction status.
    #[must_use]
    pub fn status(&self) -> TxStatus {
        self.status
    }

    /// Global transaction id.
    #[must_use]
    pub fn gtrid(&self) -> &Gtrid {
        &self.gtrid
    }

    /// Unique names of the resources this status applies to.
    #[must_use]
    pub fn unique_names(&self) -> &BTreeSet<String> {
        &self.unique_names
    }

    /// Wall-clock time the record was created, in ms since the epoch.
    #[must_use]
    pub fn time(&self) -> i64 {
        self.time
    }

    /// Sequence number assigned at enqueue time.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// True if the record was re-appended by a rollover.
    #[must_use]
    pub fn is_rolled_over(&self) -> bool {
        self.rolled_over
    }

    /// True if the stored CRC matched the payload.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Returns a copy flagged as carried forward by a rollover.
    #[must_use]
    pub fn rolled_over(&self) -> Self {
        Self {
            rolled_over: true,
            ..self.clone()
        }
    }

    /// Replaces the unique names, keeping everything else.
    pub(crate) fn set_unique_names(&mut self, unique_names: BTreeSet<String>) {
        self.unique_names = unique_names;
    }

    #[cfg(test)]
    pub(crate) fn set_time(&mut self, time: i64) {
        self.time = time;
    }

    /// Size of the encoded payload in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        1 + self.status.name().len()
            + 1
            + 4
            + 8
            + 8
            + 1
            + 2
            + self.gtrid.len()
            + 4
            + self
                .unique_names
                .iter()
                .map(|name| 2 + name.len())
                .sum::<usize>()
    }

    /// Appends the encoded payload to `buf`.
    ///
    /// # Errors
    ///
    /// Returns an error if the GTRID or a unique name is too long for its
    /// length prefix.
    pub fn encode_payload_into(&self, buf: &mut Vec<u8>) -> JournalResult<()> {
        let length = u32::try_from(self.encoded_len())
            .map_err(|_| JournalError::invalid_argument("record payload too large"))?;
        let mut writer = PayloadWriter::new(buf);

        let name = self.status.name().as_bytes();
        writer.put_u8(name.len() as u8);
        writer.put_bytes(name);
        writer.put_u8(self.status.code());
        writer.put_u32(length);
        writer.put_i64(self.time);
        writer.put_u64(self.sequence);
        writer.put_u8(u8::from(self.rolled_over));

        let gtrid_len = u16::try_from(self.gtrid.len())
            .map_err(|_| JournalError::invalid_argument("GTRID too long"))?;
        writer.put_u16(gtrid_len);
        writer.put_bytes(self.gtrid.as_bytes());

        let count = u32::try_from(self.unique_names.len())
            .map_err(|_| JournalError::invalid_argument("too many unique names"))?;
        writer.put_u32(count);
        for unique_name in &self.unique_names {
            let len = u16::try_from(unique_name.len()).map_err(|_| {
                JournalError::invalid_argument(format!("unique name too long: {unique_name}"))
            })?;
            writer.put_u16(len);
            writer.put_bytes(unique_name.as_bytes());
        }
        Ok(())
    }

    /// Encodes the payload into a fresh vector.
    ///
    /// # Errors
    ///
    /// See [`encode_payload_into`](Self::encode_payload_into).
    pub fn encode_payload(&self) -> JournalResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_payload_into(&mut buf)?;
        Ok(buf)
    }

    /// Decodes a payload. `valid` is the outcome of the CRC check.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if the payload is truncated, has trailing
    /// bytes, or its status name and code disagree.
    pub fn decode_payload(payload: &[u8], valid: bool) -> JournalResult<Self> {
        let mut reader = PayloadReader::new(payload);

        let name_len = reader.get_u8()? as usize;
        let name = reader.get_bytes(name_len)?;
        let code = reader.get_u8()?;
        let status = TxStatus::from_code(code)
            .ok_or_else(|| JournalError::corruption(format!("unknown status code {code}")))?;
        if status.name().as_bytes() != name {
            return Err(JournalError::corruption(format!(
                "status name {:?} does not match code {code}",
                String::from_utf8_lossy(name)
            )));
        }

        let length = reader.get_u32()? as usize;
        if length != payload.len() {
            return Err(JournalError::corruption(format!(
                "record length {length} does not match payload length {}",
                payload.len()
            )));
        }

        let time = reader.get_i64()?;
        let sequence = reader.get_u64()?;
        let rolled_over = reader.get_u8()? != 0;

        let gtrid_len = reader.get_u16()? as usize;
        let gtrid = Gtrid::from_bytes(reader.get_bytes(gtrid_len)?);

        let count = reader.get_u32()?;
        let mut unique_names = BTreeSet::new();
        for _ in 0..count {
            let len = reader.get_u16()? as usize;
            let bytes = reader.get_bytes(len)?;
            let unique_name = std::str::from_utf8(bytes)
                .map_err(|_| JournalError::corruption("unique name is not UTF-8"))?;
            unique_names.insert(unique_name.to_owned());
        }

        if !reader.is_exhausted() {
            return Err(JournalError::corruption(format!(
                "trailing bytes in record payload: expected {} bytes, got {}",
                reader.position(),
                payload.len()
            )));
        }

        Ok(Self {
            status,
            gtrid,
            unique_names,
            time,
            sequence,
            rolled_over,
            valid,
        })
    }
}

/// Appends one framed record to `out`.
pub(crate) fn frame_into(out: &mut Vec<u8>, delimiter: &Uuid, payload: &[u8], crc: u32) {
    out.extend_from_slice(&RECORD_PREFIX);
    out.extend_from_slice(delimiter.as_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&RECORD_SUFFIX);
    out.extend_from_slice(payload);
    out.extend_from_slice(&RECORD_TRAILER);
    out.extend_from_slice(delimiter.as_bytes());
}

/// Sequential little-endian writer over a byte vector.
struct PayloadWriter<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> PayloadWriter<'a> {
    fn new(buf: &'a mut Vec<u8>) -> Self {
        Self { buf }
    }

    fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    fn put_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn put_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }
}

/// Sequential little-endian reader with an explicit cursor.
pub(crate) struct PayloadReader<'a> {
    bytes: &'a [u8],
    cursor: usize,
}

impl<'a> PayloadReader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, cursor: 0 }
    }

    pub(crate) fn position(&self) -> usize {
        self.cursor
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.cursor == self.bytes.len()
    }

    pub(crate) fn get_bytes(&mut self, len: usize) -> JournalResult<&'a [u8]> {
        let end = self
            .cursor
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| JournalError::corruption("unexpected end of payload"))?;
        let slice = &self.bytes[self.cursor..end];
        self.cursor = end;
        Ok(slice)
    }

    fn get_array<const N: usize>(&mut self) -> JournalResult<[u8; N]> {
        let bytes = self.get_bytes(N)?;
        let mut array = [0u8; N];
        array.copy_from_slice(bytes);
        Ok(array)
    }

    pub(crate) fn get_u8(&mut self) -> JournalResult<u8> {
        Ok(self.get_array::<1>()?[0])
    }

    pub(crate) fn get_u16(&mut self) -> JournalResult<u16> {
        Ok(u16::from_le_bytes(self.get_array()?))
    }

    pub(crate) fn get_u32(&mut self) -> JournalResult<u32> {
        Ok(u32::from_le_bytes(self.get_array()?))
    }

    pub(crate) fn get_u64(&mut self) -> JournalResult<u64> {
        Ok(u64::from_le_bytes(self.get_array()?))
    }

    pub(crate) fn get_i64(&mut self) -> JournalResult<i64> {
        Ok(i64::from_le_bytes(self.get_array()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    fn sample() -> JournalRecord {
        JournalRecord::new(
            TxStatus::Committing,
            Gtrid::from_bytes(b"gtrid-0001".to_vec()),
            names(&["db1", "queue"]),
            42,
        )
    }

    #[test]
    fn payload_round_trip() {
        let record = sample();
        let payload = record.encode_payload().unwrap();
        assert_eq!(payload.len(), record.encoded_len());

        let decoded = JournalRecord::decode_payload(&payload, true).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn payload_starts_with_status_mirror() {
        let payload = sample().encode_payload().unwrap();
        assert_eq!(payload[0] as usize, "COMMITTING".len());
        assert_eq!(&payload[1..11], b"COMMITTING");
        assert_eq!(payload[11], TxStatus::Committing.code());
    }

    #[test]
    fn decode_rejects_truncated_payload() {
        let payload = sample().encode_payload().unwrap();
        let result = JournalRecord::decode_payload(&payload[..payload.len() - 3], true);
        assert!(matches!(result, Err(JournalError::Corruption { .. })));
    }

    #[test]
    fn decode_rejects_mismatched_status_name() {
        let mut payload = sample().encode_payload().unwrap();
        payload[11] = TxStatus::Committed.code();
        let result = JournalRecord::decode_payload(&payload, true);
        assert!(matches!(result, Err(JournalError::Corruption { .. })));
    }

    #[test]
    fn frame_layout() {
        let delimiter = Uuid::new_v4();
        let payload = sample().encode_payload().unwrap();
        let crc = compute_crc32(&payload);

        let mut framed = Vec::new();
        frame_into(&mut framed, &delimiter, &payload, crc);

        assert_eq!(framed.len(), payload.len() + RECORD_OVERHEAD);
        assert_eq!(&framed[..4], &RECORD_PREFIX);
        assert_eq!(&framed[4..20], delimiter.as_bytes());
        assert_eq!(u32::from_le_bytes(framed[20..24].try_into().unwrap()) as usize, payload.len());
        assert_eq!(u32::from_le_bytes(framed[24..28].try_into().unwrap()), crc);
        assert_eq!(&framed[28..30], &RECORD_SUFFIX);
        let trailer = RECORD_HEADER_SIZE + payload.len();
        assert_eq!(&framed[trailer..trailer + 4], &RECORD_TRAILER);
        assert_eq!(&framed[trailer + 4..], delimiter.as_bytes());
    }

    #[test]
    fn crc_matches_known_vector() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
    }

    proptest! {
        #[test]
        fn single_bit_flip_breaks_crc(
            gtrid in prop::collection::vec(any::<u8>(), 1..64),
            resource_names in prop::collection::btree_set("[a-z][a-z0-9]{0,12}", 0..4),
            bit in any::<prop::sample::Index>(),
        ) {
            let record = JournalRecord::new(TxStatus::Prepared, Gtrid::from_bytes(gtrid), resource_names, 7);
            let mut payload = record.encode_payload().unwrap();
            let crc = compute_crc32(&payload);
            prop_assert_eq!(compute_crc32(&payload), crc);

            let bit = bit.index(payload.len() * 8);
            payload[bit / 8] ^= 1 << (bit % 8);
            prop_assert_ne!(compute_crc32(&payload), crc);
        }
    }
}
