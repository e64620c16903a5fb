//! 데이터그램 송신 협력자

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::message::Message;

/// 피어에게 데이터그램 전송 (블로킹하지 않음)
pub trait Transport: Send + Sync + 'static {
    fn send_to(&self, datagram: Bytes, peer: SocketAddr);

    fn send_message(&self, message: &Message, peer: SocketAddr) {
        self.send_to(message.to_bytes(), peer);
    }
}

/// 송신 큐 기반 UDP 전송
///
/// 세션은 큐에 넣기만 하고, 별도 태스크가 소켓으로 내보낸다.
#[derive(Clone)]
pub struct UdpTransport {
    tx: mpsc::UnboundedSender<(Bytes, SocketAddr)>,
}

impl UdpTransport {
    /// 송신 태스크를 띄우고 전송 핸들 반환
    pub fn spawn(socket: Arc<UdpSocket>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<(Bytes, SocketAddr)>();

        let task = tokio::spawn(async move {
            while let Some((datagram, peer)) = rx.recv().await {
                if let Err(e) = socket.send_to(&datagram, peer).await {
                    warn!("송신 실패 {}: {}", peer, e);
                }
            }
        });

        (Self { tx }, task)
    }
}

impl Transport for UdpTransport {
    fn send_to(&self, datagram: Bytes, peer: SocketAddr) {
        if self.tx.send((datagram, peer)).is_err() {
            warn!("송신 큐 닫힘, {} 로의 데이터그램 버림", peer);
        }
    }
}
