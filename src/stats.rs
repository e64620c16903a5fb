//! 세션별 전송 통계

use std::time::Duration;

use tokio::time::Instant;

/// 단일 전송 통계
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 처음 보낸(읽기) 또는 처음 받은(쓰기) 블록 수
    pub blocks: u64,

    /// 페이로드 바이트
    pub total_bytes: u64,

    /// 타이머 재전송 수
    pub retransmissions: u64,

    /// 무시한 중복/오래된 ACK 수
    pub duplicate_acks: u64,

    /// 다시 받은 DATA 블록 수 (ACK 유실)
    pub duplicate_blocks: u64,
}

impl TransferStats {
    pub fn new(start_time: Instant) -> Self {
        Self {
            start_time,
            blocks: 0,
            total_bytes: 0,
            retransmissions: 0,
            duplicate_acks: 0,
            duplicate_blocks: 0,
        }
    }

    pub fn record_block(&mut self, size: usize) {
        self.blocks += 1;
        self.total_bytes += size as u64;
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 처리율 (bytes/sec)
    pub fn throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.total_bytes as f64 / elapsed
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Blocks: {} | Bytes: {} | Throughput: {:.1} KB/s | Retransmits: {} | Dup ACKs: {} | Dup blocks: {}",
            self.elapsed().as_secs_f64(),
            self.blocks,
            self.total_bytes,
            self.throughput() / 1000.0,
            self.retransmissions,
            self.duplicate_acks,
            self.duplicate_blocks,
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new(Instant::now())
    }
}
