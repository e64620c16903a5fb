//! 피어 주소별 세션 테이블
//!
//! - 피어(addr:port)당 세션 하나, 처음 보는 피어면 생성
//! - 세션마다 전용 태스크가 메시지/스트림 이벤트/재전송 타이머를 처리
//! - 유휴 세션은 주기적으로 정리 (테이블에서 빠지면 세션 태스크가 스트림을 닫음)

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::message::Message;
use crate::session::{self, SessionCmd, TransferSession};
use crate::storage::Storage;
use crate::transport::Transport;
use crate::{Config, Error, Result};

/// 세션 식별자
pub type SessionId = u64;

struct SessionEntry {
    id: SessionId,
    commands: mpsc::UnboundedSender<SessionCmd>,
    last_activity: Instant,
    task: JoinHandle<()>,
}

/// 세션 테이블
pub struct SessionTable {
    config: Arc<Config>,
    storage: Arc<dyn Storage>,
    transport: Arc<dyn Transport>,
    sessions: DashMap<SocketAddr, SessionEntry>,
    next_session_id: AtomicU64,
}

impl SessionTable {
    pub fn new(config: Arc<Config>, storage: Arc<dyn Storage>, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            storage,
            transport,
            sessions: DashMap::new(),
            next_session_id: AtomicU64::new(1),
        }
    }

    /// 메시지를 피어의 세션으로 전달 (없으면 생성)
    pub fn route(&self, peer: SocketAddr, msg: Message, now: Instant) -> Result<SessionId> {
        // entry 가드를 잡은 채 len()을 부르면 교착되므로 먼저 계산
        let count = self.sessions.len();

        match self.sessions.entry(peer) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.last_activity = now;
                entry
                    .commands
                    .send(SessionCmd::Message(msg))
                    .map_err(|_| Error::ChannelError { peer })?;
                Ok(entry.id)
            }
            Entry::Vacant(vacant) => {
                if count >= self.config.max_sessions {
                    return Err(Error::SessionLimit {
                        max: self.config.max_sessions,
                    });
                }

                let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
                let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
                let (event_tx, event_rx) = mpsc::unbounded_channel();

                let session = TransferSession::new(
                    peer,
                    self.config.clone(),
                    self.storage.clone(),
                    self.transport.clone(),
                    event_tx,
                    now,
                );

                cmd_tx
                    .send(SessionCmd::Message(msg))
                    .map_err(|_| Error::ChannelError { peer })?;
                let task = tokio::spawn(session::run(session, cmd_rx, event_rx));

                debug!("세션 {} 생성: {}", id, peer);
                vacant.insert(SessionEntry {
                    id,
                    commands: cmd_tx,
                    last_activity: now,
                    task,
                });
                Ok(id)
            }
        }
    }

    /// `idle`보다 오래 조용한 세션 제거. 제거한 수를 반환.
    pub fn sweep(&self, now: Instant, idle: Duration) -> usize {
        let mut removed = 0;

        self.sessions.retain(|peer, entry| {
            if now.saturating_duration_since(entry.last_activity) <= idle {
                return true;
            }
            debug!("세션 {} 유휴 정리: {}", entry.id, peer);
            let _ = entry.commands.send(SessionCmd::Stop);
            removed += 1;
            false
        });

        if removed > 0 {
            info!("유휴 세션 {}개 정리, 남은 세션 {}개", removed, self.sessions.len());
        }
        removed
    }

    /// 세션 즉시 제거
    pub fn remove(&self, peer: &SocketAddr) -> bool {
        match self.sessions.remove(peer) {
            Some((_, entry)) => {
                let _ = entry.commands.send(SessionCmd::Stop);
                true
            }
            None => false,
        }
    }

    /// 기존 세션의 활동 시각만 갱신. 세션이 없으면 false.
    pub fn touch(&self, peer: &SocketAddr, now: Instant) -> bool {
        match self.sessions.get_mut(peer) {
            Some(mut entry) => {
                entry.last_activity = now;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, peer: &SocketAddr) -> bool {
        self.sessions.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// 모든 세션을 멈추고 태스크 종료를 기다림
    pub async fn shutdown(&self) {
        let peers: Vec<SocketAddr> = self.sessions.iter().map(|e| *e.key()).collect();

        for peer in peers {
            if let Some((_, entry)) = self.sessions.remove(&peer) {
                let _ = entry.commands.send(SessionCmd::Stop);
                let _ = entry.task.await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Request;
    use crate::testing::{FakeStorage, FakeTransport};

    fn rrq(path: &str) -> Message {
        Message::ReadRequest(Request::new(path, "octet"))
    }

    fn table_with(
        config: Config,
        storage: FakeStorage,
    ) -> (SessionTable, Arc<FakeStorage>, Arc<FakeTransport>) {
        let storage = Arc::new(storage);
        let transport = Arc::new(FakeTransport::default());
        let table = SessionTable::new(Arc::new(config), storage.clone(), transport.clone());
        (table, storage, transport)
    }

    #[tokio::test(start_paused = true)]
    async fn test_route_reuses_session_per_peer() {
        let (table, _, _) = table_with(Config::default(), FakeStorage::new());
        let a: SocketAddr = "10.0.0.1:1000".parse().unwrap();
        let b: SocketAddr = "10.0.0.1:1001".parse().unwrap();
        let now = Instant::now();

        let first = table.route(a, Message::ack(1), now).unwrap();
        let again = table.route(a, Message::ack(2), now).unwrap();
        let other = table.route(b, Message::ack(1), now).unwrap();

        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_eq!(table.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_closes_idle_session_once() {
        let (table, storage, transport) =
            table_with(Config::default(), FakeStorage::new().with_file("f.bin", 1300));
        let peer: SocketAddr = "10.0.0.2:2000".parse().unwrap();
        let start = Instant::now();

        table.route(peer, rrq("f.bin"), start).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.sent_count(), 1);

        assert_eq!(table.sweep(start + Duration::from_secs(10), Duration::from_secs(30)), 0);
        assert!(table.contains(&peer));

        // 재전송이 걸려 있는 상태에서 정리
        assert_eq!(table.sweep(start + Duration::from_secs(31), Duration::from_secs(30)), 1);
        assert!(table.is_empty());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(storage.reader_closes(), 1);
        assert_eq!(transport.sent_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_defers_sweep() {
        let (table, _, _) = table_with(Config::default(), FakeStorage::new());
        let peer: SocketAddr = "10.0.0.5:7".parse().unwrap();
        let start = Instant::now();

        assert!(!table.touch(&peer, start));
        table.route(peer, Message::ack(1), start).unwrap();
        assert!(table.touch(&peer, start + Duration::from_secs(20)));

        let idle = Duration::from_secs(30);
        assert_eq!(table.sweep(start + Duration::from_secs(35), idle), 0);
        assert_eq!(table.sweep(start + Duration::from_secs(51), idle), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_limit() {
        let config = Config {
            max_sessions: 1,
            ..Config::default()
        };
        let (table, _, _) = table_with(config, FakeStorage::new());
        let a: SocketAddr = "10.0.0.3:1".parse().unwrap();
        let b: SocketAddr = "10.0.0.3:2".parse().unwrap();
        let now = Instant::now();

        table.route(a, Message::ack(1), now).unwrap();
        assert!(matches!(
            table.route(b, Message::ack(1), now),
            Err(Error::SessionLimit { max: 1 })
        ));
        // 기존 피어는 계속 전달됨
        assert!(table.route(a, Message::ack(1), now).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_and_shutdown_close_streams() {
        let (table, storage, _) =
            table_with(Config::default(), FakeStorage::new().with_file("f.bin", 4096));
        let a: SocketAddr = "10.0.0.4:1".parse().unwrap();
        let b: SocketAddr = "10.0.0.4:2".parse().unwrap();
        let c: SocketAddr = "10.0.0.4:3".parse().unwrap();
        let now = Instant::now();

        for peer in [a, b, c] {
            table.route(peer, rrq("f.bin"), now).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(table.remove(&a));
        assert!(!table.remove(&a));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(storage.reader_closes(), 1);

        table.shutdown().await;
        assert!(table.is_empty());
        assert_eq!(storage.reader_closes(), 3);
    }
}
