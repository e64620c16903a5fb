//! 에러 타입 정의
//!
//! 프로토콜 수준의 실패(파일 없음, 잘못된 블록 번호 등)는 여기서 다루지 않고
//! 피어에게 보내는 `Message::Error` 데이터그램으로 변환된다.

use std::net::SocketAddr;

use thiserror::Error;

/// TFTP 서버 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("세션 수 초과: 최대 {max}개")]
    SessionLimit { max: usize },

    #[error("세션 채널 닫힘: {peer}")]
    ChannelError { peer: SocketAddr },

    #[error("잘못된 인자: {0}")]
    InvalidArgument(String),
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
