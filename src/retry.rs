//! 재전송 스케줄러
//!
//! 확인 응답을 기다리는 단일 데이터그램을 점점 늘어나는 간격으로 다시 보낸다.
//! n번째 재전송은 직전 전송으로부터 `n * interval` 후에 발생하며,
//! `max_retries`번 재전송한 뒤 한 슬롯을 더 기다렸다가 소진을 알린다.
//!
//! 타이머 자체는 소유하지 않는다. 세션 태스크가 `deadline()`까지 잠들었다가
//! `poll()`을 호출하므로 취소와 확인 처리가 같은 태스크에서 직렬화된다.

use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

/// 재전송 시점에 세션이 할 일
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryAction {
    /// 데이터그램을 다시 보냄 (attempt는 1부터)
    Resend { datagram: Bytes, attempt: u32 },

    /// 재전송 횟수 소진, 더 이상 보내지 않음
    Exhausted,
}

#[derive(Debug)]
struct PendingUnit {
    datagram: Bytes,
    /// 지금까지 재전송한 횟수
    attempts: u32,
    deadline: Instant,
}

/// 단일 미확인 데이터그램 재전송 스케줄러
#[derive(Debug)]
pub struct RetryScheduler {
    interval: Duration,
    max_retries: u32,
    pending: Option<PendingUnit>,
}

impl RetryScheduler {
    pub fn new(interval: Duration, max_retries: u32) -> Self {
        Self {
            interval,
            max_retries,
            pending: None,
        }
    }

    /// 방금 보낸 데이터그램을 등록. 이전 데이터그램 상태는 버린다.
    pub fn arm(&mut self, datagram: Bytes, now: Instant) {
        self.pending = Some(PendingUnit {
            datagram,
            attempts: 0,
            deadline: now + self.interval,
        });
    }

    /// 확인 응답 수신 또는 세션 종료 시 호출
    pub fn cancel(&mut self) {
        self.pending = None;
    }

    pub fn is_armed(&self) -> bool {
        self.pending.is_some()
    }

    /// 다음 타이머 만료 시각
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.deadline)
    }

    /// 만료 시각이 지났으면 다음 동작을 반환
    pub fn poll(&mut self, now: Instant) -> Option<RetryAction> {
        let pending = self.pending.as_mut()?;
        if now < pending.deadline {
            return None;
        }

        if pending.attempts >= self.max_retries {
            self.pending = None;
            return Some(RetryAction::Exhausted);
        }

        pending.attempts += 1;
        pending.deadline = now + self.interval * (pending.attempts + 1);

        Some(RetryAction::Resend {
            datagram: pending.datagram.clone(),
            attempt: pending.attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> RetryScheduler {
        RetryScheduler::new(Duration::from_millis(1000), 5)
    }

    #[test]
    fn test_increasing_delays() {
        let mut retry = scheduler();
        let start = Instant::now();
        retry.arm(Bytes::from_static(b"block"), start);

        let mut now = start;
        for attempt in 1..=5u32 {
            let delay = Duration::from_secs(attempt as u64);
            assert_eq!(retry.deadline(), Some(now + delay));

            // 만료 직전에는 아무 일도 없음
            assert_eq!(retry.poll(now + delay - Duration::from_millis(1)), None);

            now += delay;
            assert_eq!(
                retry.poll(now),
                Some(RetryAction::Resend {
                    datagram: Bytes::from_static(b"block"),
                    attempt,
                })
            );
        }

        // 다섯 번째 재전송 뒤에는 소진만 보고
        let deadline = retry.deadline().unwrap();
        assert_eq!(retry.poll(deadline), Some(RetryAction::Exhausted));
        assert!(!retry.is_armed());
        assert_eq!(retry.poll(deadline + Duration::from_secs(60)), None);
    }

    #[test]
    fn test_cancel_stops_resends() {
        let mut retry = scheduler();
        let start = Instant::now();
        retry.arm(Bytes::from_static(b"x"), start);
        retry.cancel();

        assert_eq!(retry.deadline(), None);
        assert_eq!(retry.poll(start + Duration::from_secs(10)), None);
    }

    #[test]
    fn test_rearm_replaces_previous_unit() {
        let mut retry = scheduler();
        let start = Instant::now();
        retry.arm(Bytes::from_static(b"old"), start);
        assert!(retry.poll(start + Duration::from_secs(1)).is_some());

        let later = start + Duration::from_secs(2);
        retry.arm(Bytes::from_static(b"new"), later);
        assert_eq!(retry.deadline(), Some(later + Duration::from_secs(1)));
        assert_eq!(
            retry.poll(later + Duration::from_secs(1)),
            Some(RetryAction::Resend {
                datagram: Bytes::from_static(b"new"),
                attempt: 1,
            })
        );
    }
}
