//! 테스트용 가짜 저장소/전송

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::message::Message;
use crate::storage::{
    FileKind, Storage, StorageReader, StorageWriter, StreamEvent, StreamEvents, WriteOutcome,
};
use crate::transport::Transport;

/// 보낸 데이터그램을 기록하는 전송
#[derive(Default)]
pub struct FakeTransport {
    sent: Mutex<Vec<(Bytes, SocketAddr)>>,
}

impl FakeTransport {
    /// 기록된 메시지를 꺼냄
    pub fn take_messages(&self) -> Vec<Message> {
        self.sent
            .lock()
            .drain(..)
            .map(|(datagram, _)| Message::from_bytes(&datagram))
            .collect()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

impl Transport for FakeTransport {
    fn send_to(&self, datagram: Bytes, peer: SocketAddr) {
        self.sent.lock().push((datagram, peer));
    }
}

enum FakeEntry {
    File(usize),
    Dir,
}

#[derive(Default)]
struct FakeLog {
    reader_closes: usize,
    writes: Vec<Bytes>,
    write_outcomes: VecDeque<WriteOutcome>,
    writer_finished: bool,
    writer_closes: usize,
    fail_writer_open: bool,
}

/// 메모리 저장소. 리더는 청크 하나를 내보낸 뒤 `resume()`까지 멈춘다.
#[derive(Default)]
pub struct FakeStorage {
    entries: HashMap<String, FakeEntry>,
    log: Arc<Mutex<FakeLog>>,
}

impl FakeStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: &str, size: usize) -> Self {
        self.entries.insert(path.to_string(), FakeEntry::File(size));
        self
    }

    pub fn with_dir(mut self, path: &str) -> Self {
        self.entries.insert(path.to_string(), FakeEntry::Dir);
        self
    }

    pub fn push_write_outcome(&self, outcome: WriteOutcome) {
        self.log.lock().write_outcomes.push_back(outcome);
    }

    pub fn fail_writer_open(&self) {
        self.log.lock().fail_writer_open = true;
    }

    pub fn reader_closes(&self) -> usize {
        self.log.lock().reader_closes
    }

    pub fn writer_closes(&self) -> usize {
        self.log.lock().writer_closes
    }

    pub fn writer_finished(&self) -> bool {
        self.log.lock().writer_finished
    }

    pub fn writes(&self) -> Vec<Bytes> {
        self.log.lock().writes.clone()
    }

    pub fn written_bytes(&self) -> usize {
        self.log.lock().writes.iter().map(|w| w.len()).sum()
    }
}

impl Storage for FakeStorage {
    fn stat(&self, path: &str) -> io::Result<FileKind> {
        match self.entries.get(path) {
            Some(FakeEntry::File(_)) => Ok(FileKind::File),
            Some(FakeEntry::Dir) => Ok(FileKind::Directory),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{}: No such file or directory", path),
            )),
        }
    }

    fn open_reader(
        &self,
        path: &str,
        block_size: usize,
        events: StreamEvents,
    ) -> io::Result<Box<dyn StorageReader>> {
        let size = match self.entries.get(path) {
            Some(FakeEntry::File(size)) => *size,
            _ => return Err(io::Error::from(io::ErrorKind::NotFound)),
        };

        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let chunks = data
            .chunks(block_size)
            .map(Bytes::copy_from_slice)
            .collect();

        let mut reader = FakeReader {
            chunks,
            events,
            ended: false,
            log: self.log.clone(),
        };
        reader.emit();
        Ok(Box::new(reader))
    }

    fn open_writer(&self, _path: &str, _events: StreamEvents) -> io::Result<Box<dyn StorageWriter>> {
        if self.log.lock().fail_writer_open {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
        }
        Ok(Box::new(FakeWriter {
            log: self.log.clone(),
        }))
    }
}

struct FakeReader {
    chunks: VecDeque<Bytes>,
    events: StreamEvents,
    ended: bool,
    log: Arc<Mutex<FakeLog>>,
}

impl FakeReader {
    fn emit(&mut self) {
        if let Some(chunk) = self.chunks.pop_front() {
            let _ = self.events.send(StreamEvent::Chunk(chunk));
        } else if !self.ended {
            self.ended = true;
            let _ = self.events.send(StreamEvent::End);
        }
    }
}

impl StorageReader for FakeReader {
    fn resume(&mut self) {
        self.emit();
    }

    fn close(&mut self) {
        self.log.lock().reader_closes += 1;
    }
}

struct FakeWriter {
    log: Arc<Mutex<FakeLog>>,
}

impl StorageWriter for FakeWriter {
    fn write(&mut self, data: Bytes) -> io::Result<WriteOutcome> {
        let mut log = self.log.lock();
        log.writes.push(data);
        Ok(log
            .write_outcomes
            .pop_front()
            .unwrap_or(WriteOutcome::Accepted))
    }

    fn finish(&mut self) {
        self.log.lock().writer_finished = true;
    }

    fn close(&mut self) {
        self.log.lock().writer_closes += 1;
    }
}
