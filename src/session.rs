//! 피어별 전송 세션
//!
//! `TransferSession`은 I/O를 직접 기다리지 않는 상태 기계다. 입력은 세 가지뿐이다.
//! - 피어가 보낸 메시지 (`handle_message`)
//! - 저장소 스트림 이벤트 (`on_stream_event`)
//! - 재전송 타이머 만료 (`on_retry_timer`)
//!
//! 세 입력 모두 `run` 태스크 하나에서 순서대로 처리되므로, 재전송 취소와
//! ACK 적용 사이에 경쟁이 없다.
//!
//! 상태: `Idle → {ReadActive, WriteActive} → Terminated`

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::message::{ErrorCode, Message, Request};
use crate::retry::{RetryAction, RetryScheduler};
use crate::stats::TransferStats;
use crate::storage::{
    FileKind, Storage, StorageReader, StorageWriter, StreamEvent, StreamEvents, WriteOutcome,
};
use crate::transport::Transport;
use crate::{Config, MAX_BLOCK_SIZE};

/// 전송 방향 (세션당 한 번만 정해짐)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    None,
    /// 피어가 파일을 받음 (RRQ)
    Reading,
    /// 피어가 파일을 보냄 (WRQ)
    Writing,
}

/// 세션 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    ReadActive,
    WriteActive,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadPhase {
    /// 다음 청크를 기다리는 중
    AwaitingData,
    /// 보낸 블록의 ACK를 기다리는 중
    AwaitingAck,
}

enum StreamHandle {
    Reader(Box<dyn StorageReader>),
    Writer(Box<dyn StorageWriter>),
}

impl StreamHandle {
    fn close(self) {
        match self {
            StreamHandle::Reader(mut reader) => reader.close(),
            StreamHandle::Writer(mut writer) => writer.close(),
        }
    }
}

/// 세션 태스크 명령
#[derive(Debug)]
pub enum SessionCmd {
    Message(Message),
    Stop,
}

/// 단일 피어 전송 세션
pub struct TransferSession {
    /// 로그용 피어 식별자 ("addr:port")
    id: String,
    peer: SocketAddr,
    config: Arc<Config>,
    storage: Arc<dyn Storage>,
    transport: Arc<dyn Transport>,
    stream_events: StreamEvents,

    state: SessionState,
    direction: Direction,
    expected_block: u16,

    /// 재전송용으로 보관하는 마지막 DATA(읽기) 또는 ACK(쓰기)
    pending_outbound: Option<Bytes>,
    retry: RetryScheduler,

    /// 아직 확인되지 않은 청크 (읽기)
    buffered: VecDeque<Bytes>,
    /// 읽기 스트림이 끝을 알림
    finished: bool,
    phase: ReadPhase,
    /// 마지막으로 보낸 DATA 페이로드 길이
    last_sent_len: Option<usize>,

    /// 싱크 포화로 ACK를 미루는 중 (쓰기)
    ack_deferred: bool,
    /// 마지막으로 확인한 블록 (쓰기, WRQ 응답은 0)
    last_acked: Option<u16>,

    completed: bool,
    stream: Option<StreamHandle>,
    last_activity: Instant,
    stats: TransferStats,
}

impl TransferSession {
    pub fn new(
        peer: SocketAddr,
        config: Arc<Config>,
        storage: Arc<dyn Storage>,
        transport: Arc<dyn Transport>,
        stream_events: StreamEvents,
        now: Instant,
    ) -> Self {
        let retry = RetryScheduler::new(config.retry_interval(), config.max_retries);

        Self {
            id: peer.to_string(),
            peer,
            config,
            storage,
            transport,
            stream_events,
            state: SessionState::Idle,
            direction: Direction::None,
            expected_block: 1,
            pending_outbound: None,
            retry,
            buffered: VecDeque::new(),
            finished: false,
            phase: ReadPhase::AwaitingData,
            last_sent_len: None,
            ack_deferred: false,
            last_acked: None,
            completed: false,
            stream: None,
            last_activity: now,
            stats: TransferStats::new(now),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn expected_block(&self) -> u16 {
        self.expected_block
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn has_stream(&self) -> bool {
        self.stream.is_some()
    }

    pub fn buffered_chunks(&self) -> usize {
        self.buffered.len()
    }

    pub fn pending_outbound(&self) -> Option<&Bytes> {
        self.pending_outbound.as_ref()
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn retry_deadline(&self) -> Option<Instant> {
        self.retry.deadline()
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    /// 피어 메시지 처리
    pub fn handle_message(&mut self, msg: Message, now: Instant) {
        self.last_activity = now;

        match msg {
            Message::ReadRequest(req) => self.init_read(req, now),
            Message::WriteRequest(req) => self.init_write(req, now),
            Message::Data { block, payload } => match self.direction {
                Direction::Writing => self.continue_write(block, payload),
                _ => self.send_error(ErrorCode::IllegalOperation, "Unexpected data block"),
            },
            Message::Ack { block } => match self.direction {
                Direction::Reading => self.continue_read(block, now),
                _ => self.send_error(ErrorCode::IllegalOperation, "Unexpected acknowledgement"),
            },
            Message::Error { code, text } => self.handle_peer_error(code, &text),
            Message::Invalid { opcode } => {
                debug!("{}: Invalid opcode: {}", self.id, opcode);
                self.send_error(ErrorCode::IllegalOperation, "Invalid opcode");
            }
        }
    }

    /// 저장소 스트림 이벤트 처리
    pub fn on_stream_event(&mut self, event: StreamEvent, now: Instant) {
        match event {
            StreamEvent::Chunk(chunk) => self.on_chunk(chunk, now),
            StreamEvent::End => self.on_end(now),
            StreamEvent::ReadFailed(e) => {
                if self.state != SessionState::ReadActive {
                    return;
                }
                warn!("{}: 읽기 실패: {}", self.id, e);
                self.send_error(ErrorCode::Undefined, "Read error");
                self.terminate();
            }
            StreamEvent::Drained => self.on_drained(),
            StreamEvent::WriteFailed(e) => {
                if !self.has_stream() && !self.ack_deferred {
                    return;
                }
                warn!("{}: 쓰기 실패: {}", self.id, e);
                self.ack_deferred = false;
                self.send_error(ErrorCode::Undefined, "Write error!");
                self.terminate();
            }
        }
    }

    /// 재전송 타이머 만료 처리
    pub fn on_retry_timer(&mut self, now: Instant) {
        match self.retry.poll(now) {
            None => {}
            Some(RetryAction::Resend { datagram, attempt }) => {
                debug!(
                    "{}: {} attempt to send block {}",
                    self.id,
                    attempt + 1,
                    self.expected_block
                );
                self.stats.retransmissions += 1;
                self.transport.send_to(datagram, self.peer);
            }
            Some(RetryAction::Exhausted) => {
                warn!(
                    "{}: Block {} was never acked. Stopping transmission.",
                    self.id, self.expected_block
                );
                if self.config.notify_on_retry_exhaustion {
                    self.send_error(ErrorCode::Undefined, "Retry limit exceeded");
                }
            }
        }
    }

    /// 세션 정리. 여러 번 호출해도 스트림은 한 번만 닫힌다.
    pub fn destroy(&mut self) {
        self.retry.cancel();
        if let Some(stream) = self.stream.take() {
            stream.close();
            debug!("{}: 스트림 닫음", self.id);
        }
        self.state = SessionState::Terminated;
    }

    // ─────────────────────────────────────────────────────────────────
    // 읽기 (피어가 받는 쪽)
    // ─────────────────────────────────────────────────────────────────

    fn init_read(&mut self, req: Request, now: Instant) {
        if self.direction != Direction::None {
            warn!("{}: 이미 진행 중인 전송에 읽기 요청", self.id);
            self.send_error(ErrorCode::IllegalOperation, "Unexpected read request");
            return;
        }

        info!("{}: GET {} (mode: {})", self.id, req.path, req.mode);
        if !req.options.is_empty() {
            debug!("{}: 옵션 무시: {:?}", self.id, req.options);
        }

        match self.storage.stat(&req.path) {
            Ok(FileKind::File) => {}
            Ok(_) => {
                self.send_error(ErrorCode::NotFound, format!("{} is not a file", req.path));
                return;
            }
            Err(e) => {
                self.send_error(ErrorCode::NotFound, e.to_string());
                return;
            }
        }

        let reader = match self
            .storage
            .open_reader(&req.path, MAX_BLOCK_SIZE, self.stream_events.clone())
        {
            Ok(reader) => reader,
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                self.send_error(ErrorCode::AccessViolation, e.to_string());
                return;
            }
            Err(e) => {
                warn!("{}: {} 열기 실패: {}", self.id, req.path, e);
                self.send_error(ErrorCode::Undefined, "Read error");
                return;
            }
        };

        self.stream = Some(StreamHandle::Reader(reader));
        self.direction = Direction::Reading;
        self.state = SessionState::ReadActive;
        self.phase = ReadPhase::AwaitingData;
        self.stats = TransferStats::new(now);
    }

    fn on_chunk(&mut self, chunk: Bytes, now: Instant) {
        if self.state != SessionState::ReadActive {
            debug!("{}: 종료된 세션의 청크 무시", self.id);
            return;
        }

        // 리더는 청크를 내보낸 직후 스스로 멈춰 있음
        self.buffered.push_back(chunk);
        if self.phase == ReadPhase::AwaitingData {
            self.send_next_block(now);
        }
    }

    fn on_end(&mut self, now: Instant) {
        if self.state != SessionState::ReadActive {
            return;
        }

        self.finished = true;
        if self.phase == ReadPhase::AwaitingData && self.buffered.is_empty() {
            self.finish_read(now);
        }
    }

    fn continue_read(&mut self, block: u16, now: Instant) {
        if self.state != SessionState::ReadActive
            || self.phase != ReadPhase::AwaitingAck
            || block != self.expected_block
        {
            debug!(
                "{}: Waiting for ack for {}, but got for {}.",
                self.id, self.expected_block, block
            );
            self.stats.duplicate_acks += 1;
            return;
        }

        self.retry.cancel();
        self.pending_outbound = None;
        self.buffered.pop_front();

        // 짧은 블록이 확인되면 전송 끝
        if self.last_sent_len.unwrap_or(0) < MAX_BLOCK_SIZE {
            self.complete();
            return;
        }

        self.expected_block = match self.expected_block.checked_add(1) {
            Some(next) => next,
            None => {
                warn!("{}: 블록 번호 한계 초과", self.id);
                self.send_error(ErrorCode::Undefined, "File too large");
                self.terminate();
                return;
            }
        };
        self.phase = ReadPhase::AwaitingData;

        if let Some(StreamHandle::Reader(reader)) = self.stream.as_mut() {
            reader.resume();
        }

        if !self.buffered.is_empty() {
            self.send_next_block(now);
        } else if self.finished {
            self.finish_read(now);
        }
    }

    /// 스트림이 끝났고 보낼 청크가 없을 때
    fn finish_read(&mut self, now: Instant) {
        match self.last_sent_len {
            Some(len) if len < MAX_BLOCK_SIZE => self.complete(),
            // 블록 크기의 배수인 파일(빈 파일 포함)은 빈 블록으로 끝을 알림
            _ => {
                debug!("{}: 종료용 빈 블록 {}", self.id, self.expected_block);
                self.transmit_block(Bytes::new(), now);
            }
        }
    }

    fn send_next_block(&mut self, now: Instant) {
        if let Some(chunk) = self.buffered.front().cloned() {
            self.transmit_block(chunk, now);
        }
    }

    fn transmit_block(&mut self, payload: Bytes, now: Instant) {
        let len = payload.len();
        let datagram = Message::data(self.expected_block, payload).to_bytes();

        self.transport.send_to(datagram.clone(), self.peer);
        self.retry.arm(datagram.clone(), now);
        self.pending_outbound = Some(datagram);
        self.last_sent_len = Some(len);
        self.phase = ReadPhase::AwaitingAck;
        self.stats.record_block(len);

        debug!("{}: DATA {} ({} bytes)", self.id, self.expected_block, len);
    }

    // ─────────────────────────────────────────────────────────────────
    // 쓰기 (피어가 보내는 쪽)
    // ─────────────────────────────────────────────────────────────────

    fn init_write(&mut self, req: Request, now: Instant) {
        if self.direction != Direction::None {
            warn!("{}: 이미 진행 중인 전송에 쓰기 요청", self.id);
            self.send_error(ErrorCode::IllegalOperation, "Unexpected write request");
            return;
        }

        if !self.config.allow_writes {
            self.send_error(ErrorCode::AccessViolation, "Writes are disabled");
            return;
        }

        info!("{}: PUT {} (mode: {})", self.id, req.path, req.mode);
        if !req.options.is_empty() {
            debug!("{}: 옵션 무시: {:?}", self.id, req.options);
        }

        let writer = match self
            .storage
            .open_writer(&req.path, self.stream_events.clone())
        {
            Ok(writer) => writer,
            Err(e) => {
                warn!("{}: {} 생성 실패: {}", self.id, req.path, e);
                self.send_error(ErrorCode::Undefined, "Write error!");
                return;
            }
        };

        self.stream = Some(StreamHandle::Writer(writer));
        self.direction = Direction::Writing;
        self.state = SessionState::WriteActive;
        self.expected_block = 1;
        self.stats = TransferStats::new(now);
        self.last_acked = Some(0);
        self.send_ack(0);
    }

    fn continue_write(&mut self, block: u16, payload: Bytes) {
        if block > self.expected_block {
            self.send_error(ErrorCode::Undefined, "Unexpected block number");
            return;
        }

        // 블록 65535 이후에는 expected_block이 더 나아가지 않으므로 last_acked로 판단
        if self.last_acked.map_or(false, |acked| block <= acked) {
            // 우리 ACK가 유실됐을 수 있음
            debug!("{}: 중복 블록 {}, ACK 재전송", self.id, block);
            self.stats.duplicate_blocks += 1;
            self.send_ack(block);
            return;
        }

        if self.ack_deferred {
            // 이미 큐에 들어간 블록, Drained 후 ACK
            self.stats.duplicate_blocks += 1;
            return;
        }

        let final_block = payload.len() < MAX_BLOCK_SIZE;
        if !final_block && block == u16::MAX {
            self.send_error(ErrorCode::Undefined, "File too large");
            self.terminate();
            return;
        }

        let writer = match self.stream.as_mut() {
            Some(StreamHandle::Writer(writer)) => writer,
            _ => {
                self.send_error(ErrorCode::IllegalOperation, "Transfer is not active");
                return;
            }
        };

        let size = payload.len();
        match writer.write(payload) {
            Ok(WriteOutcome::Accepted) => {
                self.stats.record_block(size);
                self.acknowledge_block();
            }
            Ok(WriteOutcome::Saturated) => {
                debug!("{}: 싱크 포화, 블록 {} ACK 보류", self.id, block);
                self.stats.record_block(size);
                self.ack_deferred = true;
            }
            Err(e) => {
                warn!("{}: 쓰기 실패: {}", self.id, e);
                self.send_error(ErrorCode::Undefined, "Write error!");
                self.terminate();
                return;
            }
        }

        if final_block {
            self.finish_write();
        }
    }

    fn on_drained(&mut self) {
        if !self.ack_deferred {
            return;
        }
        self.ack_deferred = false;
        self.acknowledge_block();
    }

    fn acknowledge_block(&mut self) {
        self.send_ack(self.expected_block);
        self.last_acked = Some(self.expected_block);
        self.expected_block = self.expected_block.saturating_add(1);
    }

    fn finish_write(&mut self) {
        if let Some(StreamHandle::Writer(mut writer)) = self.stream.take() {
            writer.finish();
        }
        self.completed = true;
        self.state = SessionState::Terminated;
        info!(
            "{}: Write finished successfully! {}",
            self.id,
            self.stats.summary()
        );
    }

    fn send_ack(&mut self, block: u16) {
        let datagram = Message::ack(block).to_bytes();
        self.transport.send_to(datagram.clone(), self.peer);
        self.pending_outbound = Some(datagram);
    }

    // ─────────────────────────────────────────────────────────────────
    // 공통
    // ─────────────────────────────────────────────────────────────────

    fn handle_peer_error(&mut self, code: u16, text: &str) {
        warn!(
            "{}: Client reported error! Code: {}, msg: {}",
            self.id, code, text
        );

        if self.config.abort_on_peer_error
            && matches!(
                self.state,
                SessionState::ReadActive | SessionState::WriteActive
            )
        {
            self.terminate();
        }
    }

    fn complete(&mut self) {
        self.completed = true;
        info!(
            "{}: File downloaded successfully! {}",
            self.id,
            self.stats.summary()
        );
        self.terminate();
    }

    fn terminate(&mut self) {
        self.destroy();
    }

    fn send_error(&self, code: ErrorCode, text: impl Into<String>) {
        let text = text.into();
        debug!("{}: ERROR {:?}: {}", self.id, code, text);
        self.transport
            .send_message(&Message::error(code, text), self.peer);
    }
}

impl Drop for TransferSession {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// 세션 태스크
///
/// 명령 채널이 닫히거나 `Stop`을 받으면 세션을 정리하고 끝난다.
pub async fn run(
    mut session: TransferSession,
    mut commands: mpsc::UnboundedReceiver<SessionCmd>,
    mut stream_rx: mpsc::UnboundedReceiver<StreamEvent>,
) {
    loop {
        let deadline = session.retry_deadline();

        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(SessionCmd::Message(msg)) => session.handle_message(msg, Instant::now()),
                Some(SessionCmd::Stop) | None => break,
            },
            Some(event) = stream_rx.recv() => {
                session.on_stream_event(event, Instant::now());
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                session.on_retry_timer(Instant::now());
            }
        }
    }

    session.destroy();
    debug!("{}: 세션 종료", session.peer());
}
