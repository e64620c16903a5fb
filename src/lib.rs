//! # tftpd
//!
//! UDP 기반 TFTP(RFC 1350) 파일 전송 서버
//!
//! ## 핵심 특징
//! - **Lockstep**: 512바이트 블록 하나를 보내고 ACK를 받은 뒤에 다음 블록 전송
//! - **피어별 세션**: 원격 addr:port 하나당 세션 하나, 전용 태스크에서 직렬 처리
//! - **증가 간격 재전송**: 1초, 2초, 3초... 최대 5회
//! - **백프레셔**: 읽기는 블록마다 멈추고, 쓰기는 싱크가 비워질 때까지 ACK 보류
//! - **유휴 정리**: 30초 동안 조용한 세션은 스트림을 닫고 제거
//!
//! ## 구성
//! - [`message`]: 와이어 포맷 인코딩/디코딩
//! - [`session`]: 전송 상태 기계
//! - [`table`]: 피어 주소별 세션 테이블
//! - [`storage`] / [`transport`]: 파일 시스템과 소켓 협력자
//! - [`server`]: 수신 루프

pub mod config;
pub mod error;
pub mod message;
pub mod retry;
pub mod server;
pub mod session;
pub mod stats;
pub mod storage;
pub mod table;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::{Error, Result};
pub use message::{ErrorCode, Message, MessageType, Request};
pub use server::Server;
pub use session::{Direction, SessionState, TransferSession};
pub use stats::TransferStats;
pub use storage::{DiskStorage, Storage};
pub use table::SessionTable;
pub use transport::{Transport, UdpTransport};

/// 블록 크기 (바이트). 이보다 짧은 DATA가 전송의 끝.
pub const MAX_BLOCK_SIZE: usize = 512;

/// 기본 TFTP 포트
pub const DEFAULT_PORT: u16 = 69;

/// 블록당 최대 재전송 횟수
pub const MAX_RETRIES: u32 = 5;
