//! 프로토콜 메시지 정의 (RFC 1350)
//!
//! 모든 메시지는 빅엔디안 2바이트 opcode로 시작한다.
//!
//! | opcode | 이후 레이아웃 |
//! |---|---|
//! | 1 RRQ | filename NUL mode NUL (optname NUL optval NUL)* |
//! | 2 WRQ | RRQ와 동일 |
//! | 3 DATA | block(2) + 0..512 바이트 |
//! | 4 ACK | block(2) |
//! | 5 ERROR | code(2) + ASCII 메시지 NUL |
//!
//! 디코딩은 실패하지 않는다. 해석할 수 없는 입력은 `Message::Invalid`가 된다.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::MAX_BLOCK_SIZE;

/// 메시지 타입 (opcode)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    /// 읽기 요청 (RRQ)
    ReadRequest = 1,

    /// 쓰기 요청 (WRQ)
    WriteRequest = 2,

    /// 데이터 블록
    Data = 3,

    /// 블록 확인 응답
    Ack = 4,

    /// 에러
    Error = 5,
}

impl MessageType {
    pub fn from_u16(opcode: u16) -> Option<Self> {
        match opcode {
            1 => Some(MessageType::ReadRequest),
            2 => Some(MessageType::WriteRequest),
            3 => Some(MessageType::Data),
            4 => Some(MessageType::Ack),
            5 => Some(MessageType::Error),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// 표준 에러 코드
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    Undefined = 0,
    NotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileExists = 6,
    NoSuchUser = 7,
}

impl ErrorCode {
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            0 => Some(ErrorCode::Undefined),
            1 => Some(ErrorCode::NotFound),
            2 => Some(ErrorCode::AccessViolation),
            3 => Some(ErrorCode::DiskFull),
            4 => Some(ErrorCode::IllegalOperation),
            5 => Some(ErrorCode::UnknownTransferId),
            6 => Some(ErrorCode::FileExists),
            7 => Some(ErrorCode::NoSuchUser),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// RRQ/WRQ 본문
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    /// 요청 파일 경로
    pub path: String,

    /// 전송 모드 ("octet", "netascii" 등). 해석하지 않고 기록만 한다.
    pub mode: String,

    /// 옵션 (이름은 소문자, 같은 이름은 마지막 값이 남음)
    pub options: BTreeMap<String, String>,
}

impl Request {
    pub fn new(path: impl Into<String>, mode: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mode: mode.into(),
            options: BTreeMap::new(),
        }
    }

    pub fn with_option(mut self, name: &str, value: impl Into<String>) -> Self {
        self.options.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// 대소문자 구분 없이 옵션 조회
    pub fn option(&self, name: &str) -> Option<&str> {
        self.options
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        put_ascii(buf, &self.path);
        buf.put_u8(0);
        put_ascii(buf, &self.mode);
        buf.put_u8(0);
        for (name, value) in &self.options {
            put_ascii(buf, name);
            buf.put_u8(0);
            put_ascii(buf, value);
            buf.put_u8(0);
        }
    }

    fn decode(buf: &[u8]) -> Self {
        let (path, next) = read_string(buf, 2);
        let (mode, mut next) = read_string(buf, next);

        let mut options = BTreeMap::new();
        while next < buf.len() {
            let (name, after_name) = read_string(buf, next);
            let (value, after_value) = read_string(buf, after_name);
            options.insert(name.to_ascii_lowercase(), value);
            next = after_value;
        }

        Self {
            path,
            mode,
            options,
        }
    }
}

/// 통합 메시지 enum
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    ReadRequest(Request),
    WriteRequest(Request),
    Data { block: u16, payload: Bytes },
    Ack { block: u16 },
    Error { code: u16, text: String },
    /// 알 수 없는 opcode 또는 형식이 깨진 데이터그램
    Invalid { opcode: u16 },
}

impl Message {
    pub fn data(block: u16, payload: Bytes) -> Self {
        Message::Data { block, payload }
    }

    pub fn ack(block: u16) -> Self {
        Message::Ack { block }
    }

    pub fn error(code: ErrorCode, text: impl Into<String>) -> Self {
        Message::Error {
            code: code.as_u16(),
            text: text.into(),
        }
    }

    /// 메시지 타입 반환 (`Invalid`는 None)
    pub fn msg_type(&self) -> Option<MessageType> {
        match self {
            Message::ReadRequest(_) => Some(MessageType::ReadRequest),
            Message::WriteRequest(_) => Some(MessageType::WriteRequest),
            Message::Data { .. } => Some(MessageType::Data),
            Message::Ack { .. } => Some(MessageType::Ack),
            Message::Error { .. } => Some(MessageType::Error),
            Message::Invalid { .. } => None,
        }
    }

    /// 와이어 opcode
    pub fn opcode(&self) -> u16 {
        match self {
            Message::Invalid { opcode } => *opcode,
            other => other.msg_type().map(MessageType::as_u16).unwrap_or(0),
        }
    }

    /// 바이트로 직렬화
    ///
    /// `Data` 페이로드는 호출자가 512바이트 이하로 유지해야 한다.
    /// `Error` 텍스트의 비 ASCII 문자는 `?`로 바뀌고 NUL 종료는 여기서 붙인다.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u16(self.opcode());

        match self {
            Message::ReadRequest(req) | Message::WriteRequest(req) => req.encode_into(&mut buf),
            Message::Data { block, payload } => {
                buf.put_u16(*block);
                buf.put_slice(payload);
            }
            Message::Ack { block } => buf.put_u16(*block),
            Message::Error { code, text } => {
                buf.put_u16(*code);
                put_ascii(&mut buf, text);
                buf.put_u8(0);
            }
            Message::Invalid { .. } => {}
        }

        buf.freeze()
    }

    fn encoded_len(&self) -> usize {
        match self {
            Message::ReadRequest(req) | Message::WriteRequest(req) => {
                let options: usize = req
                    .options
                    .iter()
                    .map(|(name, value)| name.len() + value.len() + 2)
                    .sum();
                2 + req.path.len() + 1 + req.mode.len() + 1 + options
            }
            Message::Data { payload, .. } => 4 + payload.len(),
            Message::Ack { .. } => 4,
            Message::Error { text, .. } => 4 + text.len() + 1,
            Message::Invalid { .. } => 2,
        }
    }

    /// 데이터그램 파싱
    pub fn from_bytes(buf: &[u8]) -> Self {
        if buf.len() < 2 {
            return Message::Invalid { opcode: 0 };
        }

        let opcode = u16::from_be_bytes([buf[0], buf[1]]);
        let msg_type = match MessageType::from_u16(opcode) {
            Some(t) => t,
            None => return Message::Invalid { opcode },
        };

        match msg_type {
            MessageType::ReadRequest => Message::ReadRequest(Request::decode(buf)),
            MessageType::WriteRequest => Message::WriteRequest(Request::decode(buf)),
            MessageType::Data => match read_u16(buf, 2) {
                Some(block) if buf.len() - 4 <= MAX_BLOCK_SIZE => Message::Data {
                    block,
                    payload: Bytes::copy_from_slice(&buf[4..]),
                },
                _ => Message::Invalid { opcode },
            },
            MessageType::Ack => match read_u16(buf, 2) {
                Some(block) if buf.len() == 4 => Message::Ack { block },
                _ => Message::Invalid { opcode },
            },
            MessageType::Error => match read_u16(buf, 2) {
                Some(code) => Message::Error {
                    code,
                    text: read_string(buf, 4).0,
                },
                None => Message::Invalid { opcode },
            },
        }
    }
}

fn read_u16(buf: &[u8], offset: usize) -> Option<u16> {
    let bytes = buf.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// `start`부터 첫 NUL까지의 문자열과 NUL 다음 위치를 반환.
/// NUL이 없으면 버퍼 끝까지를 잘린 문자열로 취급한다.
fn read_string(buf: &[u8], start: usize) -> (String, usize) {
    let rest = buf.get(start..).unwrap_or(&[]);
    let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
    (ascii_lossy(&rest[..end]), start + end + 1)
}

fn ascii_lossy(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| if b.is_ascii() { b as char } else { '?' })
        .collect()
}

fn put_ascii(buf: &mut BytesMut, text: &str) {
    for c in text.chars() {
        if c.is_ascii() && c != '\0' {
            buf.put_u8(c as u8);
        } else {
            buf.put_u8(b'?');
        }
    }
}
