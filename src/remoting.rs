//! The request/response envelope the core assumes from its remoting
//! collaborator (section 6 / SPEC_FULL [EXPANSION]): an integer command
//! code, an opaque correlation id, a flag bitfield, a string-keyed header
//! map, and a binary body. The full remoting stack (connection lifecycle,
//! sync/async/oneway RPC, retry) is out of scope (section 1); this module
//! only gives the broker-side processors a concrete type to be exercised
//! against, plus a minimal `tokio_util::codec` boundary implementation.

use bytes::{Buf, BufMut, BytesMut};
use serde_derive::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Subset of request codes the core consumes (section 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestCode {
    PutMessage,
    PullMessage,
    SendMessageV2,
    QueryConsumerOffset,
    UpdateConsumerOffset,
    GetMaxOffset,
    GetMinOffset,
    GetEarliestMsgStoretime,
    ViewMessageById,
    SearchOffsetByTimestamp,
    Other(i32),
}

impl RequestCode {
    pub fn code(self) -> i32 {
        match self {
            RequestCode::PutMessage => 10,
            RequestCode::PullMessage => 11,
            RequestCode::SendMessageV2 => 310,
            RequestCode::QueryConsumerOffset => 14,
            RequestCode::UpdateConsumerOffset => 15,
            RequestCode::GetMaxOffset => 16,
            RequestCode::GetMinOffset => 17,
            RequestCode::GetEarliestMsgStoretime => 18,
            RequestCode::ViewMessageById => 19,
            RequestCode::SearchOffsetByTimestamp => 20,
            RequestCode::Other(c) => c,
        }
    }

    pub fn from_code(code: i32) -> RequestCode {
        match code {
            10 => RequestCode::PutMessage,
            11 => RequestCode::PullMessage,
            310 => RequestCode::SendMessageV2,
            14 => RequestCode::QueryConsumerOffset,
            15 => RequestCode::UpdateConsumerOffset,
            16 => RequestCode::GetMaxOffset,
            17 => RequestCode::GetMinOffset,
            18 => RequestCode::GetEarliestMsgStoretime,
            19 => RequestCode::ViewMessageById,
            20 => RequestCode::SearchOffsetByTimestamp,
            other => RequestCode::Other(other),
        }
    }
}

/// Response-specific codes returned in the header's `code` field
/// (section 7's taxonomy, as it crosses the wire).
pub mod response_code {
    pub const SUCCESS: i32 = 0;
    pub const SYSTEM_ERROR: i32 = 1;
    pub const FLUSH_DISK_TIMEOUT: i32 = 10;
    pub const SLAVE_NOT_AVAILABLE: i32 = 11;
    pub const FLUSH_SLAVE_TIMEOUT: i32 = 12;
    pub const MESSAGE_ILLEGAL: i32 = 13;
    pub const SERVICE_NOT_AVAILABLE: i32 = 14;
    pub const PULL_NOT_FOUND: i32 = 19;
    pub const PULL_RETRY_IMMEDIATELY: i32 = 20;
    pub const PULL_OFFSET_MOVED: i32 = 21;
    pub const NO_PERMISSION: i32 = 22;
}

/// Bit 0: this command is a response, not a request. Bit 1: oneway (no
/// response expected).
pub mod flag {
    pub const RESPONSE: i32 = 0x1;
    pub const ONEWAY: i32 = 0x1 << 1;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Header {
    code: i32,
    language: String,
    version: i32,
    opaque: i32,
    flag: i32,
    remark: Option<String>,
    #[serde(rename = "extFields", default)]
    ext_fields: HashMap<String, String>,
}

/// The wire envelope described in section 6: `length(4) header_len(4)
/// header_json body`.
#[derive(Debug, Clone)]
pub struct RemotingCommand {
    pub code: i32,
    pub language: String,
    pub version: i32,
    pub opaque: i32,
    pub flag: i32,
    pub remark: Option<String>,
    pub ext_fields: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl RemotingCommand {
    pub fn create_request(code: RequestCode, opaque: i32) -> RemotingCommand {
        RemotingCommand {
            code: code.code(),
            language: "RUST".to_string(),
            version: 1,
            opaque,
            flag: 0,
            remark: None,
            ext_fields: HashMap::new(),
            body: Vec::new(),
        }
    }

    pub fn create_response(&self, code: i32, remark: Option<String>) -> RemotingCommand {
        RemotingCommand {
            code,
            language: "RUST".to_string(),
            version: 1,
            opaque: self.opaque,
            flag: flag::RESPONSE,
            remark,
            ext_fields: HashMap::new(),
            body: Vec::new(),
        }
    }

    pub fn is_response(&self) -> bool {
        self.flag & flag::RESPONSE != 0
    }

    pub fn is_oneway(&self) -> bool {
        self.flag & flag::ONEWAY != 0
    }

    pub fn with_body(mut self, body: Vec<u8>) -> RemotingCommand {
        self.body = body;
        self
    }

    pub fn with_ext(mut self, key: impl Into<String>, value: impl Into<String>) -> RemotingCommand {
        self.ext_fields.insert(key.into(), value.into());
        self
    }

    fn header(&self) -> Header {
        Header {
            code: self.code,
            language: self.language.clone(),
            version: self.version,
            opaque: self.opaque,
            flag: self.flag,
            remark: self.remark.clone(),
            ext_fields: self.ext_fields.clone(),
        }
    }

    fn from_header(header: Header, body: Vec<u8>) -> RemotingCommand {
        RemotingCommand {
            code: header.code,
            language: header.language,
            version: header.version,
            opaque: header.opaque,
            flag: header.flag,
            remark: header.remark,
            ext_fields: header.ext_fields,
            body,
        }
    }
}

/// `tokio_util::codec` boundary implementation: enough to exercise the
/// processors in tests against a real framed byte stream, not a
/// production-grade remoting stack (no heartbeats, no partial-frame
/// pipelining beyond what `Decoder` already buffers).
#[derive(Debug, Default)]
pub struct RemotingCodec {
    frame_len: Option<u32>,
}

const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

impl Decoder for RemotingCodec {
    type Item = RemotingCommand;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RemotingCommand>, io::Error> {
        let frame_len = match self.frame_len {
            Some(len) => len,
            None => {
                if src.len() < 4 {
                    return Ok(None);
                }
                let len = (&src[..4]).get_u32();
                if len == 0 || len > MAX_FRAME_LEN {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "frame length out of bounds"));
                }
                src.advance(4);
                self.frame_len = Some(len);
                len
            }
        };

        if (src.len() as u32) < frame_len {
            src.reserve((frame_len as usize).saturating_sub(src.len()));
            return Ok(None);
        }

        let mut frame = src.split_to(frame_len as usize);
        self.frame_len = None;

        if frame.len() < 4 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "frame missing header length"));
        }
        let header_len = (&frame[..4]).get_u32() as usize;
        frame.advance(4);
        if frame.len() < header_len {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "header length exceeds frame"));
        }
        let header_bytes = frame.split_to(header_len);
        let header: Header = serde_json::from_slice(&header_bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let body = frame.to_vec();

        Ok(Some(RemotingCommand::from_header(header, body)))
    }
}

impl Encoder<RemotingCommand> for RemotingCodec {
    type Error = io::Error;

    fn encode(&mut self, item: RemotingCommand, dst: &mut BytesMut) -> Result<(), io::Error> {
        let header_json = serde_json::to_vec(&item.header())?;
        let total_len = 4 + header_json.len() + item.body.len();
        dst.reserve(4 + total_len);
        dst.put_u32(total_len as u32);
        dst.put_u32(header_json.len() as u32);
        dst.put_slice(&header_json);
        dst.put_slice(&item.body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_the_codec() {
        let mut codec = RemotingCodec::default();
        let cmd = RemotingCommand::create_request(RequestCode::PullMessage, 7)
            .with_ext("topic", "T")
            .with_body(b"hello".to_vec());

        let mut buf = BytesMut::new();
        codec.encode(cmd.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.code, RequestCode::PullMessage.code());
        assert_eq!(decoded.opaque, 7);
        assert_eq!(decoded.body, b"hello");
        assert_eq!(decoded.ext_fields.get("topic").unwrap(), "T");
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_returns_none_on_partial_frame() {
        let mut codec = RemotingCodec::default();
        let cmd = RemotingCommand::create_request(RequestCode::PutMessage, 1).with_body(b"abc".to_vec());
        let mut full = BytesMut::new();
        codec.encode(cmd, &mut full).unwrap();

        let mut partial = full.split_to(full.len() - 2);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn response_flag_round_trips() {
        let req = RemotingCommand::create_request(RequestCode::PutMessage, 3);
        let resp = req.create_response(response_code::SUCCESS, None);
        assert!(resp.is_response());
        assert!(!req.is_response());
    }
}
