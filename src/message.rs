//! Wire layout for the stored message record (section 6 of the spec).
//!
//! ```text
//! total_len(4) magic(4) body_crc(4) queue_id(4) flag(4) queue_offset(8)
//! phy_offset(8) sys_flag(4) born_ts(8) born_host(8) store_ts(8)
//! store_host(8) reconsume_times(4) prepared_tx_offset(8) body_len(4) body
//! topic_len(1) topic props_len(2) props
//! ```
//! All integers are big-endian.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;
use std::io::{self, Cursor, Read, Write};

pub const MESSAGE_MAGIC_CODE: i32 = -626_843_481;
pub const BLANK_MAGIC_CODE: i32 = -875_286_124;

/// Minimum size of a BLANK filler record: total_len(4) + magic(4) = 8, but
/// we reserve the same fixed prefix width used by `maped_file.go`'s
/// `minimum-blank-size` constant so a BLANK record is always decodable by a
/// recovery scan that doesn't special-case it.
pub const MIN_BLANK_LENGTH: i32 = 8;

pub const MAX_TOPIC_LENGTH: usize = 127;
pub const MAX_PROPERTIES_LENGTH: usize = 32_767;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Well-known property keys, mirrored from the original implementation's
/// `message_const.go` so schedule/pull/offset code shares one vocabulary.
pub mod properties {
    pub const KEYS: &str = "KEYS";
    pub const TAGS: &str = "TAGS";
    pub const WAIT_STORE_MSG_OK: &str = "WAIT";
    pub const DELAY_LEVEL: &str = "DELAY";
    pub const REAL_TOPIC: &str = "REAL_TOPIC";
    pub const REAL_QID: &str = "REAL_QID";
    pub const MIN_OFFSET: &str = "MIN_OFFSET";
    pub const MAX_OFFSET: &str = "MAX_OFFSET";
}

pub const SCHEDULE_TOPIC: &str = "SCHEDULE_TOPIC_XXXX";

/// System flag bits carried in `sys_flag`.
pub mod sys_flag {
    pub const COMPRESSED: i32 = 0x1;
    pub const MULTI_TAGS: i32 = 0x1 << 1;
    pub const TRANSACTION_NOT_TYPE: i32 = 0;
    pub const TRANSACTION_PREPARED_TYPE: i32 = 0x1 << 2;
    pub const TRANSACTION_COMMIT_TYPE: i32 = 0x2 << 2;
    pub const TRANSACTION_ROLLBACK_TYPE: i32 = 0x3 << 2;
}

/// A message as handed to the store by a producer (before physical/queue
/// offsets are assigned).
#[derive(Debug, Clone)]
pub struct MessageExtBrokerInner {
    pub topic: String,
    pub queue_id: i32,
    pub flag: i32,
    pub body: Vec<u8>,
    pub properties: HashMap<String, String>,
    pub born_timestamp: i64,
    pub born_host: u64,
    pub sys_flag: i32,
    pub reconsume_times: i32,
    pub prepared_transaction_offset: i64,
}

impl MessageExtBrokerInner {
    pub fn new(topic: impl Into<String>, queue_id: i32, body: Vec<u8>) -> MessageExtBrokerInner {
        MessageExtBrokerInner {
            topic: topic.into(),
            queue_id,
            flag: 0,
            body,
            properties: HashMap::new(),
            born_timestamp: now_millis(),
            born_host: 0,
            sys_flag: sys_flag::TRANSACTION_NOT_TYPE,
            reconsume_times: 0,
            prepared_transaction_offset: 0,
        }
    }

    pub fn with_property(mut self, key: &str, value: impl Into<String>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    pub fn tags_code(&self) -> i64 {
        match self.properties.get(properties::TAGS) {
            Some(tag) => tags_hash_code(tag),
            None => 0,
        }
    }

    pub fn properties_encoded(&self) -> String {
        encode_properties(&self.properties)
    }
}

pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// `KEY1\x01VALUE1\x02KEY2\x01VALUE2` — matches the original's
/// `PROPERTY_SEPARATOR` / `NAME_VALUE_SEPARATOR` scheme.
const NAME_VALUE_SEPARATOR: char = '\u{1}';
const PROPERTY_SEPARATOR: char = '\u{2}';

pub fn encode_properties(props: &HashMap<String, String>) -> String {
    let mut out = String::new();
    for (k, v) in props {
        if !out.is_empty() {
            out.push(PROPERTY_SEPARATOR);
        }
        out.push_str(k);
        out.push(NAME_VALUE_SEPARATOR);
        out.push_str(v);
    }
    out
}

pub fn decode_properties(s: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    if s.is_empty() {
        return out;
    }
    for kv in s.split(PROPERTY_SEPARATOR) {
        if let Some(idx) = kv.find(NAME_VALUE_SEPARATOR) {
            out.insert(kv[..idx].to_string(), kv[idx + 1..].to_string());
        }
    }
    out
}

pub fn tags_hash_code(tag: &str) -> i64 {
    use fnv::FnvHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = FnvHasher::default();
    tag.hash(&mut hasher);
    hasher.finish() as i64
}

/// A fully-assigned record, ready to be serialized into the commit log.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub inner: MessageExtBrokerInner,
    pub queue_offset: i64,
    pub phy_offset: i64,
    pub store_timestamp: i64,
    pub store_host: u64,
}

impl MessageRecord {
    /// Serializes to the big-endian stored form. Returns `None` if the
    /// topic or properties exceed the configured limits (caller maps that
    /// to `PutMessageStatus::MessageIllegal` / `PropertiesSizeExceeded`).
    pub fn encode(&self) -> Option<Vec<u8>> {
        let topic_bytes = self.inner.topic.as_bytes();
        if topic_bytes.len() > MAX_TOPIC_LENGTH {
            return None;
        }
        let props = self.inner.properties_encoded();
        let props_bytes = props.as_bytes();
        if props_bytes.len() > MAX_PROPERTIES_LENGTH {
            return None;
        }
        let body = &self.inner.body;

        let total_len = 4 + 4 + 4 + 4 + 4 + 8 + 8 + 4 + 8 + 8 + 8 + 8 + 4 + 8
            + 4
            + body.len()
            + 1
            + topic_bytes.len()
            + 2
            + props_bytes.len();

        let mut buf = Vec::with_capacity(total_len);
        buf.write_i32::<BigEndian>(total_len as i32).ok()?;
        buf.write_i32::<BigEndian>(MESSAGE_MAGIC_CODE).ok()?;
        let crc = crc32fast::hash(body) as i32;
        buf.write_i32::<BigEndian>(crc).ok()?;
        buf.write_i32::<BigEndian>(self.inner.queue_id).ok()?;
        buf.write_i32::<BigEndian>(self.inner.flag).ok()?;
        buf.write_i64::<BigEndian>(self.queue_offset).ok()?;
        buf.write_i64::<BigEndian>(self.phy_offset).ok()?;
        buf.write_i32::<BigEndian>(self.inner.sys_flag).ok()?;
        buf.write_i64::<BigEndian>(self.inner.born_timestamp).ok()?;
        buf.write_u64::<BigEndian>(self.inner.born_host).ok()?;
        buf.write_i64::<BigEndian>(self.store_timestamp).ok()?;
        buf.write_u64::<BigEndian>(self.store_host).ok()?;
        buf.write_i32::<BigEndian>(self.inner.reconsume_times).ok()?;
        buf.write_i64::<BigEndian>(self.inner.prepared_transaction_offset)
            .ok()?;
        buf.write_i32::<BigEndian>(body.len() as i32).ok()?;
        buf.write_all(body).ok()?;
        buf.write_u8(topic_bytes.len() as u8).ok()?;
        buf.write_all(topic_bytes).ok()?;
        buf.write_u16::<BigEndian>(props_bytes.len() as u16).ok()?;
        buf.write_all(props_bytes).ok()?;
        Some(buf)
    }
}

/// A decoded record read back from the commit log.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    pub total_len: i32,
    pub body_crc: i32,
    pub queue_id: i32,
    pub flag: i32,
    pub queue_offset: i64,
    pub phy_offset: i64,
    pub sys_flag: i32,
    pub born_timestamp: i64,
    pub born_host: u64,
    pub store_timestamp: i64,
    pub store_host: u64,
    pub reconsume_times: i32,
    pub prepared_transaction_offset: i64,
    pub body: Vec<u8>,
    pub topic: String,
    pub properties: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// A full message record was decoded; `consumed` bytes were used.
    Message,
    /// A BLANK filler record was found; the scan should skip to the next
    /// segment (this record marks the segment tail).
    Blank,
}

/// Decodes one record from `buf` starting at byte 0. Returns
/// `(outcome, consumed_bytes, message)`. Blank records return `None` for
/// the message. Returns `Err` on CRC/magic mismatch or truncated input —
/// callers (recovery, pull) treat this as "end of valid data here", not a
/// process-fatal error.
pub fn decode(buf: &[u8]) -> Result<(DecodeOutcome, i32, Option<DecodedMessage>), io::Error> {
    if buf.len() < 8 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short read"));
    }
    let mut cur = Cursor::new(buf);
    let total_len = cur.read_i32::<BigEndian>()?;
    let magic = cur.read_i32::<BigEndian>()?;
    if magic == BLANK_MAGIC_CODE {
        return Ok((DecodeOutcome::Blank, total_len, None));
    }
    if magic != MESSAGE_MAGIC_CODE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "bad magic code",
        ));
    }
    if total_len < 8 || (total_len as usize) > buf.len() {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated record"));
    }

    let body_crc = cur.read_i32::<BigEndian>()?;
    let queue_id = cur.read_i32::<BigEndian>()?;
    let flag = cur.read_i32::<BigEndian>()?;
    let queue_offset = cur.read_i64::<BigEndian>()?;
    let phy_offset = cur.read_i64::<BigEndian>()?;
    let sys_flag = cur.read_i32::<BigEndian>()?;
    let born_timestamp = cur.read_i64::<BigEndian>()?;
    let born_host = cur.read_u64::<BigEndian>()?;
    let store_timestamp = cur.read_i64::<BigEndian>()?;
    let store_host = cur.read_u64::<BigEndian>()?;
    let reconsume_times = cur.read_i32::<BigEndian>()?;
    let prepared_transaction_offset = cur.read_i64::<BigEndian>()?;
    let body_len = cur.read_i32::<BigEndian>()?;
    if body_len < 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "negative body len"));
    }
    let mut body = vec![0u8; body_len as usize];
    cur.read_exact(&mut body)?;

    let actual_crc = crc32fast::hash(&body) as i32;
    if actual_crc != body_crc {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "crc mismatch"));
    }

    let topic_len = cur.read_u8()?;
    let mut topic_buf = vec![0u8; topic_len as usize];
    cur.read_exact(&mut topic_buf)?;
    let topic = String::from_utf8(topic_buf)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad topic utf8"))?;

    let props_len = cur.read_u16::<BigEndian>()?;
    let mut props_buf = vec![0u8; props_len as usize];
    cur.read_exact(&mut props_buf)?;
    let props_str = String::from_utf8(props_buf)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad props utf8"))?;
    let properties = decode_properties(&props_str);

    Ok((
        DecodeOutcome::Message,
        total_len,
        Some(DecodedMessage {
            total_len,
            body_crc,
            queue_id,
            flag,
            queue_offset,
            phy_offset,
            sys_flag,
            born_timestamp,
            born_host,
            store_timestamp,
            store_host,
            reconsume_times,
            prepared_transaction_offset,
            body,
            topic,
            properties,
        }),
    ))
}

/// Serializes a BLANK filler record that occupies exactly `len` bytes of
/// tail space (`len` must be >= `MIN_BLANK_LENGTH`).
pub fn encode_blank(len: i32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(len as usize);
    buf.write_i32::<BigEndian>(len).unwrap();
    buf.write_i32::<BigEndian>(BLANK_MAGIC_CODE).unwrap();
    buf.resize(len as usize, 0);
    buf
}

/// Formats a message id the way consumers use to look a message up again:
/// hex(store_host) + hex(phy_offset), matching `VIEW_MESSAGE_BY_ID`'s key.
pub fn format_msg_id(store_host: u64, phy_offset: i64) -> String {
    format!("{:016X}{:016X}", store_host, phy_offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MessageRecord {
        let inner = MessageExtBrokerInner::new("T", 0, b"hello".to_vec())
            .with_property(properties::TAGS, "tagA");
        MessageRecord {
            inner,
            queue_offset: 7,
            phy_offset: 1024,
            store_timestamp: 123456,
            store_host: 0xdead_beef,
        }
    }

    #[test]
    fn roundtrip_encode_decode() {
        let rec = sample();
        let bytes = rec.encode().unwrap();
        let (outcome, consumed, msg) = decode(&bytes).unwrap();
        assert_eq!(outcome, DecodeOutcome::Message);
        assert_eq!(consumed as usize, bytes.len());
        let msg = msg.unwrap();
        assert_eq!(msg.topic, "T");
        assert_eq!(msg.body, b"hello");
        assert_eq!(msg.queue_offset, 7);
        assert_eq!(msg.phy_offset, 1024);
        assert_eq!(msg.properties.get(properties::TAGS).unwrap(), "tagA");
    }

    #[test]
    fn rejects_crc_mismatch() {
        let rec = sample();
        let mut bytes = rec.encode().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn topic_too_long_rejected() {
        let mut rec = sample();
        rec.inner.topic = "x".repeat(MAX_TOPIC_LENGTH + 1);
        assert!(rec.encode().is_none());
    }

    #[test]
    fn blank_record_decodes_as_blank() {
        let bytes = encode_blank(64);
        let (outcome, consumed, msg) = decode(&bytes).unwrap();
        assert_eq!(outcome, DecodeOutcome::Blank);
        assert_eq!(consumed, 64);
        assert!(msg.is_none());
    }

    #[test]
    fn properties_roundtrip() {
        let mut props = HashMap::new();
        props.insert("KEYS".to_string(), "abc".to_string());
        props.insert("TAGS".to_string(), "t1".to_string());
        let encoded = encode_properties(&props);
        let decoded = decode_properties(&encoded);
        assert_eq!(decoded, props);
    }
}
