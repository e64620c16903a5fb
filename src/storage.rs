//! 파일 저장소 협력자
//!
//! 세션은 파일 시스템을 직접 건드리지 않고 아래 트레이트만 사용한다.
//! 스트림은 비동기로 동작하며 결과를 `StreamEvent`로 세션 채널에 넣는다.
//!
//! - 읽기: 청크 하나를 내보낼 때마다 스스로 멈추고, `resume()`마다 한 청크씩 더 읽는다.
//! - 쓰기: 대기 바이트가 high water에 닿으면 `Saturated`를 반환하고,
//!   큐가 비면 `Drained`를 보낸다.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::debug;

/// 스트림이 세션에 보내는 이벤트
#[derive(Debug)]
pub enum StreamEvent {
    /// 읽은 청크 (마지막을 제외하면 정확히 block_size)
    Chunk(Bytes),

    /// 파일 끝
    End,

    /// 읽기 실패
    ReadFailed(io::Error),

    /// 포화됐던 쓰기 큐가 비었음
    Drained,

    /// 쓰기 실패
    WriteFailed(io::Error),
}

/// 스트림 이벤트 송신 채널
pub type StreamEvents = mpsc::UnboundedSender<StreamEvent>;

/// stat 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
    Other,
}

/// 쓰기 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// 큐에 여유가 있음
    Accepted,

    /// 큐가 포화됨, `Drained`까지 기다려야 함
    Saturated,
}

/// 읽기 스트림 핸들
pub trait StorageReader: Send {
    /// 청크 하나를 더 읽도록 허용
    fn resume(&mut self);

    /// 스트림 중단
    fn close(&mut self);
}

/// 쓰기 스트림 핸들
pub trait StorageWriter: Send {
    fn write(&mut self, data: Bytes) -> io::Result<WriteOutcome>;

    /// 남은 쓰기를 마치고 파일을 닫음
    fn finish(&mut self);

    /// 남은 쓰기를 버리고 중단
    fn close(&mut self);
}

/// 저장소
pub trait Storage: Send + Sync + 'static {
    fn stat(&self, path: &str) -> io::Result<FileKind>;

    fn open_reader(
        &self,
        path: &str,
        block_size: usize,
        events: StreamEvents,
    ) -> io::Result<Box<dyn StorageReader>>;

    fn open_writer(&self, path: &str, events: StreamEvents) -> io::Result<Box<dyn StorageWriter>>;
}

/// 로컬 디스크 저장소 (root 디렉터리 밖으로 나갈 수 없음)
#[derive(Debug, Clone)]
pub struct DiskStorage {
    root: PathBuf,
    write_high_water: usize,
}

impl DiskStorage {
    pub fn new(root: impl Into<PathBuf>, write_high_water: usize) -> Self {
        Self {
            root: root.into(),
            write_high_water,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 요청 경로를 root 기준 경로로 변환
    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        let mut resolved = self.root.clone();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
                Component::ParentDir => {
                    return Err(io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        format!("{} escapes the root directory", path),
                    ));
                }
            }
        }
        Ok(resolved)
    }
}

impl Storage for DiskStorage {
    fn stat(&self, path: &str) -> io::Result<FileKind> {
        let metadata = std::fs::metadata(self.resolve(path)?)?;
        Ok(if metadata.is_file() {
            FileKind::File
        } else if metadata.is_dir() {
            FileKind::Directory
        } else {
            FileKind::Other
        })
    }

    fn open_reader(
        &self,
        path: &str,
        block_size: usize,
        events: StreamEvents,
    ) -> io::Result<Box<dyn StorageReader>> {
        let file = std::fs::File::open(self.resolve(path)?)?;
        let resume = Arc::new(Notify::new());
        let task = tokio::spawn(read_pump(
            tokio::fs::File::from_std(file),
            block_size,
            resume.clone(),
            events,
        ));

        Ok(Box::new(DiskReader {
            resume,
            task: Some(task),
        }))
    }

    fn open_writer(&self, path: &str, events: StreamEvents) -> io::Result<Box<dyn StorageWriter>> {
        let file = std::fs::File::create(self.resolve(path)?)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let saturated = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(write_pump(
            tokio::fs::File::from_std(file),
            rx,
            queued.clone(),
            saturated.clone(),
            events,
        ));

        Ok(Box::new(DiskWriter {
            tx,
            queued,
            saturated,
            high_water: self.write_high_water,
            task: Some(task),
        }))
    }
}

struct DiskReader {
    resume: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl StorageReader for DiskReader {
    fn resume(&mut self) {
        self.resume.notify_one();
    }

    fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for DiskReader {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_pump(
    mut file: tokio::fs::File,
    block_size: usize,
    resume: Arc<Notify>,
    events: StreamEvents,
) {
    let mut buf = vec![0u8; block_size];

    loop {
        // 짧은 읽기는 파일 끝이 아닐 수 있으므로 블록을 가득 채움
        let mut filled = 0;
        while filled < block_size {
            match file.read(&mut buf[filled..]).await {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => {
                    let _ = events.send(StreamEvent::ReadFailed(e));
                    return;
                }
            }
        }

        if filled == 0 {
            let _ = events.send(StreamEvent::End);
            return;
        }

        if events
            .send(StreamEvent::Chunk(Bytes::copy_from_slice(&buf[..filled])))
            .is_err()
        {
            return;
        }

        // 세션이 블록 확인을 받을 때까지 대기
        resume.notified().await;
    }
}

enum WriteCmd {
    Chunk(Bytes),
    Finish,
}

struct DiskWriter {
    tx: mpsc::UnboundedSender<WriteCmd>,
    queued: Arc<AtomicUsize>,
    saturated: Arc<AtomicBool>,
    high_water: usize,
    task: Option<JoinHandle<()>>,
}

impl StorageWriter for DiskWriter {
    fn write(&mut self, data: Bytes) -> io::Result<WriteOutcome> {
        let queued = self.queued.fetch_add(data.len(), Ordering::SeqCst) + data.len();

        // 채널에 넣기 전에 표시해야 pump가 Drained를 놓치지 않음
        let outcome = if queued >= self.high_water {
            self.saturated.store(true, Ordering::SeqCst);
            WriteOutcome::Saturated
        } else {
            WriteOutcome::Accepted
        };

        self.tx
            .send(WriteCmd::Chunk(data))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "writer closed"))?;

        Ok(outcome)
    }

    fn finish(&mut self) {
        let _ = self.tx.send(WriteCmd::Finish);
        // pump가 큐를 끝까지 비우도록 분리
        self.task.take();
    }

    fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for DiskWriter {
    fn drop(&mut self) {
        self.close();
    }
}

async fn write_pump(
    mut file: tokio::fs::File,
    mut rx: mpsc::UnboundedReceiver<WriteCmd>,
    queued: Arc<AtomicUsize>,
    saturated: Arc<AtomicBool>,
    events: StreamEvents,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriteCmd::Chunk(data) => {
                if let Err(e) = file.write_all(&data).await {
                    let _ = events.send(StreamEvent::WriteFailed(e));
                    return;
                }

                let remaining = queued.fetch_sub(data.len(), Ordering::SeqCst) - data.len();
                if remaining == 0 && saturated.swap(false, Ordering::SeqCst) {
                    let _ = events.send(StreamEvent::Drained);
                }
            }
            WriteCmd::Finish => {
                if let Err(e) = file.flush().await {
                    let _ = events.send(StreamEvent::WriteFailed(e));
                }
                debug!("쓰기 스트림 종료");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<StreamEvent>) -> StreamEvent {
        tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("event timeout")
            .expect("channel closed")
    }

    #[test]
    fn test_resolve_confines_to_root() {
        let storage = DiskStorage::new("/srv/tftp", 1024);

        assert_eq!(
            storage.resolve("/boot/image.bin").unwrap(),
            PathBuf::from("/srv/tftp/boot/image.bin")
        );
        assert_eq!(
            storage.resolve("./a/b").unwrap(),
            PathBuf::from("/srv/tftp/a/b")
        );

        let err = storage.resolve("../etc/passwd").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_stat_kinds() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("file.bin"), b"abc").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let storage = DiskStorage::new(dir.path(), 1024);
        assert_eq!(storage.stat("file.bin").unwrap(), FileKind::File);
        assert_eq!(storage.stat("sub").unwrap(), FileKind::Directory);
        assert_eq!(
            storage.stat("missing").unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_reader_pauses_after_each_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..1300u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(dir.path().join("data.bin"), &data).unwrap();

        let storage = DiskStorage::new(dir.path(), 1024);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut reader = storage.open_reader("data.bin", 512, tx).unwrap();

        let mut received = Vec::new();
        let mut sizes = Vec::new();
        loop {
            match next_event(&mut rx).await {
                StreamEvent::Chunk(chunk) => {
                    sizes.push(chunk.len());
                    received.extend_from_slice(&chunk);

                    // resume 전에는 다음 청크가 오지 않음
                    tokio::task::yield_now().await;
                    assert!(rx.try_recv().is_err());
                    reader.resume();
                }
                StreamEvent::End => break,
                other => panic!("unexpected event: {:?}", other),
            }
        }

        assert_eq!(sizes, vec![512, 512, 276]);
        assert_eq!(received, data);
        reader.close();
    }

    #[tokio::test]
    async fn test_writer_reports_saturation_and_drain() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::new(dir.path(), 1000);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut writer = storage.open_writer("out.bin", tx).unwrap();

        assert_eq!(
            writer.write(Bytes::from(vec![1u8; 512])).unwrap(),
            WriteOutcome::Accepted
        );
        // 아직 pump가 첫 블록을 처리하지 않았다면 포화, 처리했다면 통과
        let outcome = writer.write(Bytes::from(vec![2u8; 512])).unwrap();
        if outcome == WriteOutcome::Saturated {
            assert!(matches!(next_event(&mut rx).await, StreamEvent::Drained));
        }

        writer.write(Bytes::from(vec![3u8; 10])).unwrap();
        writer.finish();

        let path = dir.path().join("out.bin");
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                if std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0) == 1034 {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("file not flushed");

        let written = std::fs::read(&path).unwrap();
        assert_eq!(&written[..512], &[1u8; 512][..]);
        assert_eq!(&written[1024..], &[3u8; 10][..]);
    }
}
