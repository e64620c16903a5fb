//! 서버 설정

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::{DEFAULT_PORT, MAX_RETRIES};

/// TFTP 서버 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// UDP 바인드 주소
    pub bind_addr: SocketAddr,

    /// 요청 경로의 기준 디렉터리
    pub root_dir: PathBuf,

    /// 재전송 기본 간격 (밀리초)
    /// n번째 재전송은 직전 전송으로부터 n * retry_interval_ms 후에 발생
    pub retry_interval_ms: u64,

    /// 최대 재전송 횟수
    pub max_retries: u32,

    /// 세션 유휴 타임아웃 (밀리초)
    pub idle_timeout_ms: u64,

    /// 유휴 세션 정리 주기 (밀리초)
    pub sweep_interval_ms: u64,

    /// 쓰기 싱크가 포화를 알리는 대기 바이트 수
    pub write_high_water: usize,

    /// 쓰기 요청 허용 여부
    pub allow_writes: bool,

    /// 최대 동시 세션 수
    pub max_sessions: usize,

    /// 피어가 Error를 보내면 세션을 즉시 종료
    pub abort_on_peer_error: bool,

    /// 재전송 소진 시 피어에게 Error 전송
    pub notify_on_retry_exhaustion: bool,

    /// 수신 버퍼 크기
    pub recv_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            root_dir: PathBuf::from("."),
            retry_interval_ms: 1000,          // 1초, 2초, 3초 ...
            max_retries: MAX_RETRIES,
            idle_timeout_ms: 30_000,          // 30초
            sweep_interval_ms: 30_000,        // 30초
            write_high_water: 16 * 1024,      // 16KB
            allow_writes: true,
            max_sessions: 1024,
            abort_on_peer_error: true,
            notify_on_retry_exhaustion: false,
            recv_buffer_size: 65535,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 읽기 전용 서버 설정
    pub fn read_only() -> Self {
        Self {
            allow_writes: false,
            ..Self::default()
        }
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}
