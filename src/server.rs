//! UDP 서버 루프
//!
//! 소켓 하나로 모든 피어를 받는다. 수신한 데이터그램은 디코딩 후
//! 피어 주소별 세션으로 넘기고, 송신은 전용 송신 태스크가 맡는다.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::message::{ErrorCode, Message};
use crate::storage::{DiskStorage, Storage};
use crate::table::SessionTable;
use crate::transport::{Transport, UdpTransport};
use crate::{Config, Error, Result};

/// TFTP 서버
pub struct Server {
    config: Arc<Config>,
    socket: Arc<UdpSocket>,
    storage: Arc<dyn Storage>,
}

impl Server {
    /// `config.root_dir` 디스크 저장소로 바인드
    pub async fn bind(config: Config) -> Result<Self> {
        let storage = Arc::new(DiskStorage::new(
            config.root_dir.clone(),
            config.write_high_water,
        ));
        Self::with_storage(config, storage).await
    }

    pub async fn with_storage(config: Config, storage: Arc<dyn Storage>) -> Result<Self> {
        if config.max_sessions == 0 {
            return Err(Error::InvalidArgument(
                "max_sessions must be at least 1".to_string(),
            ));
        }

        if config.sweep_interval_ms == 0 {
            return Err(Error::InvalidArgument(
                "sweep_interval_ms must be positive".to_string(),
            ));
        }

        let socket = UdpSocket::bind(config.bind_addr).await?;
        info!("TFTP 서버 바인드: {}", socket.local_addr()?);

        Ok(Self {
            config: Arc::new(config),
            socket: Arc::new(socket),
            storage,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// 종료 없이 계속 실행
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// `shutdown`이 끝날 때까지 실행한 뒤 모든 세션을 정리
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let (udp, send_task) = UdpTransport::spawn(self.socket.clone());
        let transport: Arc<dyn Transport> = Arc::new(udp);
        let table = Arc::new(SessionTable::new(
            self.config.clone(),
            self.storage.clone(),
            transport.clone(),
        ));

        // ─────────────────────────────────────────────────────────────
        // 유휴 세션 정리 태스크
        // ─────────────────────────────────────────────────────────────
        let sweep_table = table.clone();
        let idle = self.config.idle_timeout();
        let period = self.config.sweep_interval();
        let sweep_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // 첫 tick은 즉시 완료

            loop {
                ticker.tick().await;
                sweep_table.sweep(Instant::now(), idle);
            }
        });

        let mut buf = vec![0u8; self.config.recv_buffer_size];
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, peer)) => dispatch(&table, transport.as_ref(), &buf[..len], peer),
                    Err(e) => warn!("수신 실패: {}", e),
                },
            }
        }

        info!("서버 종료 중 (세션 {}개)", table.len());
        sweep_task.abort();
        table.shutdown().await;
        send_task.abort();
        Ok(())
    }
}

/// 데이터그램 하나를 세션으로 전달
fn dispatch(table: &SessionTable, transport: &dyn Transport, datagram: &[u8], peer: SocketAddr) {
    let msg = Message::from_bytes(datagram);

    // 해석할 수 없는 데이터그램으로는 세션을 만들지 않음
    if let Message::Invalid { opcode } = msg {
        debug!("{}: Invalid opcode: {}", peer, opcode);
        table.touch(&peer, Instant::now());
        transport.send_message(
            &Message::error(ErrorCode::IllegalOperation, "Invalid opcode"),
            peer,
        );
        return;
    }

    match table.route(peer, msg, Instant::now()) {
        Ok(_) => {}
        Err(Error::SessionLimit { max }) => {
            warn!("{}: 세션 수 초과 (최대 {})", peer, max);
            transport.send_message(
                &Message::error(ErrorCode::Undefined, "Too many sessions"),
                peer,
            );
        }
        Err(e) => warn!("{}: 세션 전달 실패: {}", peer, e),
    }
}
