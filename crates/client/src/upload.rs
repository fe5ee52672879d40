//! Image uploader.
//!
//! Streams a disk image to the agent's shared storage: the codec is taken
//! from the file extension, raw images are compressed with zstd on the
//! fly, and a sibling `.bmap.json` descriptor is attached when present.
//! The image itself travels over the plain TCP data channel returned by
//! `storage_start`; completion is declared with `storage_flush` and the
//! agent is polled until it finished writing.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use benchlink_storage::{BlockMap, Compression, DEFAULT_CHUNK_SIZE};

use crate::client::AgentClient;
use crate::error::ClientError;

/// zstd level used for raw images; favours throughput over ratio.
const ON_THE_FLY_ZSTD_LEVEL: i32 = 1;

/// Suffix of block-map descriptors next to an image.
const BMAP_SUFFIX: &str = ".bmap.json";

/// Chunks buffered between the file reader and the socket.
const READ_AHEAD: usize = 4;

/// Callback invoked with transfer progress.
pub type ProgressCallback = Box<dyn Fn(&UploadProgress) + Send + Sync>;

/// Snapshot of a running upload.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadProgress {
    /// Bytes read from the image file.
    pub read: u64,
    /// Size of the image file.
    pub input_size: u64,
    /// Bytes committed to storage by the agent.
    pub written: u64,
    /// Expected size of the decoded image, when a block map declares it.
    pub output_size: Option<u64>,
}

/// Outcome of a successful upload.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadReport {
    /// Codec of the stream sent to the agent.
    pub compression: Compression,
    pub bmap: Option<PathBuf>,
    pub bytes_read: u64,
    pub bytes_sent: u64,
    pub written: u64,
}

/// Tuning of [`AgentClient::upload_image_with`].
pub struct UploadOptions {
    /// Size of the pieces written to the data channel.
    pub chunk_size: usize,
    /// Interval of the `storage_status` polls.
    pub poll_interval: Duration,
    pub progress: Option<ProgressCallback>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            poll_interval: Duration::from_millis(500),
            progress: None,
        }
    }
}

impl UploadOptions {
    fn report(&self, progress: &UploadProgress) {
        if let Some(cb) = &self.progress {
            cb(progress);
        }
    }
}

struct Chunk {
    data: Vec<u8>,
    /// Bytes read from the file so far.
    read: u64,
}

impl AgentClient {
    /// Writes the image at `path` to the agent's shared storage.
    pub async fn upload_image(&self, path: &Path) -> Result<UploadReport, ClientError> {
        self.upload_image_with(path, UploadOptions::default()).await
    }

    /// Like [`upload_image`](Self::upload_image) with explicit options.
    ///
    /// Shared storage is opened for the duration of the upload and closed
    /// afterwards, whatever the outcome.
    pub async fn upload_image_with(
        &self,
        path: &Path,
        options: UploadOptions,
    ) -> Result<UploadReport, ClientError> {
        let input_size = tokio::fs::metadata(path).await?.len();

        self.storage_open().await?;
        let result = self.transfer(path, input_size, &options).await;
        if let Err(e) = self.storage_close().await {
            warn!("failed to close shared storage: {e}");
        }
        result
    }

    async fn transfer(
        &self,
        path: &Path,
        input_size: u64,
        options: &UploadOptions,
    ) -> Result<UploadReport, ClientError> {
        let mut progress = UploadProgress {
            read: 0,
            input_size,
            written: 0,
            output_size: None,
        };

        let bmap = match find_bmap(path) {
            Some((bmap_path, descriptor, map)) => {
                info!(bmap = %bmap_path.display(), "discovered block map");
                self.storage_bmap(Some(descriptor)).await?;
                progress.output_size = Some(map.image_size);
                Some(bmap_path)
            }
            None => {
                debug!(image = %path.display(), "no block map next to image");
                None
            }
        };

        let source = Compression::from_path(path);
        let compress = source == Compression::Raw;
        let compression = if compress { Compression::Zstd } else { source };
        self.storage_compression(compression.as_str()).await?;

        let port = self.storage_start().await?;
        let mut stream = TcpStream::connect((self.host(), port)).await?;
        stream.set_nodelay(true)?;
        info!(image = %path.display(), port, %compression, "uploading image");

        let (tx, mut rx) = mpsc::channel(READ_AHEAD);
        let reader = {
            let path = path.to_path_buf();
            let chunk_size = options.chunk_size.max(1);
            tokio::task::spawn_blocking(move || read_chunks(&path, compress, chunk_size, tx))
        };

        let mut sent = 0u64;
        let mut last_report = Instant::now();
        while let Some(chunk) = rx.recv().await {
            let chunk = chunk?;
            stream.write_all(&chunk.data).await?;
            sent += chunk.data.len() as u64;
            progress.read = chunk.read;

            if last_report.elapsed() >= options.poll_interval {
                progress.written = self.storage_bytes_written().await?;
                options.report(&progress);
                last_report = Instant::now();
            }
        }
        reader.await.map_err(io::Error::other)??;
        stream.shutdown().await?;
        drop(stream);
        debug!(bytes = sent, "image sent, waiting for agent");

        self.storage_flush(sent).await?;
        let status = loop {
            let status = self.storage_status().await?;
            progress.written = status.written;
            options.report(&progress);
            if !status.writing {
                break status;
            }
            tokio::time::sleep(options.poll_interval).await;
        };

        if status.failed {
            warn!(written = status.written, "agent failed to write image");
            return Err(ClientError::WriteFailed {
                written: status.written,
            });
        }

        info!(bytes = sent, written = status.written, "image written");
        Ok(UploadReport {
            compression,
            bmap,
            bytes_read: progress.read,
            bytes_sent: sent,
            written: status.written,
        })
    }
}

/// Looks for `<image>.bmap.json`, then strips one extension at a time
/// (`disk.wic.xz` tries `disk.wic.xz`, `disk.wic` and `disk`).
fn find_bmap(image: &Path) -> Option<(PathBuf, serde_json::Value, BlockMap)> {
    let mut base = image.to_path_buf();
    loop {
        let mut candidate = base.clone().into_os_string();
        candidate.push(BMAP_SUFFIX);
        let candidate = PathBuf::from(candidate);

        if candidate.is_file() {
            match load_bmap(&candidate) {
                Ok((descriptor, map)) => return Some((candidate, descriptor, map)),
                Err(e) => warn!(bmap = %candidate.display(), "ignoring block map: {e}"),
            }
        }

        base.extension()?;
        base.set_extension("");
    }
}

fn load_bmap(path: &Path) -> Result<(serde_json::Value, BlockMap), Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)?;
    let descriptor: serde_json::Value = serde_json::from_str(&text)?;
    let map = BlockMap::from_value(descriptor.clone())?;
    Ok((descriptor, map))
}

/// Counts bytes pulled from the image file, ahead of the encoder.
struct CountingReader<R> {
    inner: R,
    count: Arc<AtomicU64>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

/// Reads the image in `chunk_size` pieces, zstd-compressing it when
/// `compress` is set. Runs on a blocking thread.
fn read_chunks(
    path: &Path,
    compress: bool,
    chunk_size: usize,
    tx: mpsc::Sender<io::Result<Chunk>>,
) -> io::Result<()> {
    let count = Arc::new(AtomicU64::new(0));
    let file = CountingReader {
        inner: File::open(path)?,
        count: Arc::clone(&count),
    };
    let mut input: Box<dyn Read> = if compress {
        Box::new(zstd::stream::read::Encoder::new(file, ON_THE_FLY_ZSTD_LEVEL)?)
    } else {
        Box::new(file)
    };

    loop {
        let mut data = vec![0u8; chunk_size];
        let n = fill(&mut input, &mut data)?;
        if n == 0 {
            return Ok(());
        }
        data.truncate(n);
        let chunk = Chunk {
            data,
            read: count.load(Ordering::Relaxed),
        };
        if tx.blocking_send(Ok(chunk)).is_err() {
            // Uploader gave up.
            return Ok(());
        }
    }
}

/// Reads until `buf` is full or the input ends.
fn fill(input: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Mutex;

    use benchlink_agent_server::{
        AgentServer, Broadcaster, Handler, HandlerFuture, Sender, ServerConfig,
    };
    use benchlink_protocol::MessageType;
    use benchlink_protocol::envelope::Message;
    use benchlink_protocol::messages::*;
    use benchlink_storage::{ImageWriter, SeekSink, WriterConfig};
    use sha2::{Digest, Sha256};

    use super::*;

    const BLOCK: usize = 4096;

    /// Storage side of an agent backed by a real image writer and a file.
    struct StorageAgent {
        writer: Mutex<ImageWriter>,
        target: PathBuf,
        calls: Mutex<Vec<MessageType>>,
    }

    impl StorageAgent {
        fn new(target: PathBuf) -> Self {
            let config = WriterConfig {
                recv_timeout: Duration::from_millis(100),
                ..Default::default()
            };
            Self {
                writer: Mutex::new(ImageWriter::new(config)),
                target,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn handle(&self, msg: &Message) -> Result<Message, String> {
            self.calls.lock().unwrap().push(msg.msg_type);
            let mut writer = self.writer.lock().unwrap();
            let ok = |msg: &Message| msg.reply(MessageType::Result, Some(&BoolResponse { result: true }));
            let reply = match msg.msg_type {
                MessageType::StorageOpen => ok(msg),
                MessageType::StorageClose => {
                    writer.stop();
                    ok(msg)
                }
                MessageType::StorageBmap => {
                    let req: BmapRequest = msg.require_payload().map_err(|e| e.to_string())?;
                    let map = req
                        .descriptor
                        .map(BlockMap::from_value)
                        .transpose()
                        .map_err(|e| e.to_string())?;
                    writer.set_bmap(map).map_err(|e| e.to_string())?;
                    msg.reply::<()>(MessageType::Result, None)
                }
                MessageType::StorageCompression => {
                    let req: CompressionRequest =
                        msg.require_payload().map_err(|e| e.to_string())?;
                    let codec = req.compression.parse().map_err(|e: benchlink_storage::WriterError| e.to_string())?;
                    let previous = writer.set_compression(codec);
                    msg.reply(
                        MessageType::Result,
                        Some(&CompressionResponse {
                            previous: previous.to_string(),
                        }),
                    )
                }
                MessageType::StorageStart => {
                    let file = std::fs::OpenOptions::new()
                        .write(true)
                        .open(&self.target)
                        .map_err(|e| e.to_string())?;
                    let sink = SeekSink::new(file).map_err(|e| e.to_string())?;
                    let port = writer
                        .start(Box::new(sink), msg.session.as_deref())
                        .map_err(|e| e.to_string())?;
                    msg.reply(MessageType::Result, Some(&StartResponse { port }))
                }
                MessageType::StorageFlush => {
                    let req: FlushRequest = msg.require_payload().map_err(|e| e.to_string())?;
                    writer.flush(req.total);
                    ok(msg)
                }
                MessageType::StorageStatus => msg.reply(
                    MessageType::Result,
                    Some(&StorageStatusResponse {
                        status: "HOST".into(),
                        writing: writer.writing(),
                        written: writer.written(),
                        failed: writer.failed(),
                    }),
                ),
                MessageType::StorageBytesWritten => msg.reply(
                    MessageType::Result,
                    Some(&BytesWrittenResponse {
                        written: writer.written(),
                    }),
                ),
                other => return Err(format!("unexpected {other:?}")),
            };
            reply.map_err(|e| e.to_string())
        }
    }

    impl Handler for StorageAgent {
        fn on_storage(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
            Box::pin(async move {
                let _ = match self.handle(&msg) {
                    Ok(reply) => sender.send_msg(reply),
                    Err(e) => sender.send_error(&msg, 400, &e),
                };
            })
        }
    }

    struct Bench {
        server: Arc<AgentServer<StorageAgent>>,
        client: AgentClient,
        dir: tempfile::TempDir,
    }

    impl Bench {
        async fn start(target_size: usize) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let target = dir.path().join("storage.img");
            std::fs::write(&target, vec![0u8; target_size]).unwrap();

            let config = ServerConfig {
                bind_addr: "127.0.0.1".parse().unwrap(),
                port: 0,
                ..Default::default()
            };
            let server = AgentServer::new(
                config,
                Arc::new(StorageAgent::new(target)),
                Broadcaster::new(),
            );
            let runner = server.clone();
            tokio::spawn(async move { runner.run().await });
            while server.port().await == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            let url = format!("ws://127.0.0.1:{}", server.port().await);
            let client = AgentClient::connect(&url, Some("tester".into()))
                .await
                .unwrap();
            Self {
                server,
                client,
                dir,
            }
        }

        fn path(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }

        fn storage(&self) -> Vec<u8> {
            std::fs::read(self.path("storage.img")).unwrap()
        }

        fn calls(&self) -> Vec<MessageType> {
            self.server.handler().calls.lock().unwrap().clone()
        }

        fn options(&self) -> UploadOptions {
            UploadOptions {
                chunk_size: 64 * 1024,
                poll_interval: Duration::from_millis(20),
                progress: None,
            }
        }
    }

    /// Compressible but not trivially repetitive.
    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| ((i / 7) % 251) as u8).collect()
    }

    fn sha256_hex(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    fn descriptor(image: &[u8], ranges: &[(u64, u64)]) -> serde_json::Value {
        let map: Vec<_> = ranges
            .iter()
            .map(|&(first, last)| {
                let bytes = &image[first as usize * BLOCK..(last as usize + 1) * BLOCK];
                serde_json::json!({"first": first, "last": last, "chksum": sha256_hex(bytes)})
            })
            .collect();
        serde_json::json!({
            "BlockSize": BLOCK,
            "ImageSize": image.len(),
            "ChecksumType": "sha256",
            "BlockMap": map,
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn raw_image_is_compressed_on_the_fly() {
        let image = pattern(3 * 1024 * 1024 + 123);
        let bench = Bench::start(image.len()).await;
        let path = bench.path("disk.img");
        std::fs::write(&path, &image).unwrap();

        let report = bench
            .client
            .upload_image_with(&path, bench.options())
            .await
            .unwrap();

        assert_eq!(report.compression, Compression::Zstd);
        assert_eq!(report.bytes_read, image.len() as u64);
        assert!(report.bytes_sent < image.len() as u64);
        assert_eq!(report.written, image.len() as u64);
        assert!(report.bmap.is_none());
        assert_eq!(bench.storage(), image);

        let calls = bench.calls();
        assert_eq!(calls.first(), Some(&MessageType::StorageOpen));
        assert_eq!(calls.last(), Some(&MessageType::StorageClose));
        assert!(!calls.contains(&MessageType::StorageBmap));
        bench.server.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn compressed_image_with_block_map() {
        let image = pattern(8 * BLOCK);
        let bench = Bench::start(image.len()).await;
        let path = bench.path("disk.img.zst");
        std::fs::write(&path, zstd::encode_all(&image[..], 3).unwrap()).unwrap();
        // Found after stripping ".zst".
        let bmap_path = bench.path("disk.img.bmap.json");
        let desc = descriptor(&image, &[(0, 1), (5, 6)]);
        std::fs::write(&bmap_path, desc.to_string()).unwrap();

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let options = UploadOptions {
            progress: Some(Box::new(move |p: &UploadProgress| {
                sink.lock().unwrap().push(p.clone());
            })),
            ..bench.options()
        };
        let report = bench.client.upload_image_with(&path, options).await.unwrap();

        assert_eq!(report.compression, Compression::Zstd);
        assert_eq!(report.bmap.as_deref(), Some(bmap_path.as_path()));

        let storage = bench.storage();
        assert_eq!(&storage[..2 * BLOCK], &image[..2 * BLOCK]);
        assert_eq!(&storage[5 * BLOCK..7 * BLOCK], &image[5 * BLOCK..7 * BLOCK]);
        // Unmapped blocks are skipped, not written.
        assert!(storage[2 * BLOCK..5 * BLOCK].iter().all(|&b| b == 0));

        let seen = seen.lock().unwrap();
        let last = seen.last().expect("progress reported");
        assert_eq!(last.output_size, Some(image.len() as u64));
        assert_eq!(last.written, report.written);
        bench.server.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn checksum_mismatch_fails_the_upload() {
        let image = pattern(4 * BLOCK);
        let bench = Bench::start(image.len()).await;
        let path = bench.path("disk.img");
        std::fs::write(&path, &image).unwrap();

        let mut other = image.clone();
        other[10] ^= 0xff;
        let desc = descriptor(&other, &[(0, 3)]);
        std::fs::write(bench.path("disk.img.bmap.json"), desc.to_string()).unwrap();

        let err = bench
            .client
            .upload_image_with(&path, bench.options())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::WriteFailed { .. }), "{err}");
        assert_eq!(bench.calls().last(), Some(&MessageType::StorageClose));
        bench.server.shutdown();
    }

    #[tokio::test]
    async fn missing_image_is_an_io_error() {
        let bench = Bench::start(0).await;
        let err = bench
            .client
            .upload_image(&bench.path("nope.img"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Io(_)));
        assert!(bench.calls().is_empty());
        bench.server.shutdown();
    }

    #[test]
    fn find_bmap_prefers_the_full_name() {
        let dir = tempfile::tempdir().unwrap();
        let image = pattern(BLOCK);
        let desc = descriptor(&image, &[(0, 0)]).to_string();
        std::fs::write(dir.path().join("a.wic.xz.bmap.json"), &desc).unwrap();
        std::fs::write(dir.path().join("a.wic.bmap.json"), &desc).unwrap();

        let (found, _, map) = find_bmap(&dir.path().join("a.wic.xz")).unwrap();
        assert_eq!(found, dir.path().join("a.wic.xz.bmap.json"));
        assert_eq!(map.block_size, BLOCK as u64);

        let (found, _, _) = find_bmap(&dir.path().join("a.wic.gz")).unwrap();
        assert_eq!(found, dir.path().join("a.wic.bmap.json"));

        assert!(find_bmap(&dir.path().join("b.img")).is_none());
    }

    #[test]
    fn invalid_bmap_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("c.img.bmap.json")).unwrap();
        f.write_all(b"<bmap version=\"2.0\"/>").unwrap();
        assert!(find_bmap(&dir.path().join("c.img")).is_none());
    }

    #[test]
    fn fill_reads_across_short_reads() {
        let mut chained = io::Read::chain(&b"abcdef"[..], &b"gh"[..]);
        let mut buf = [0u8; 8];
        assert_eq!(fill(&mut chained, &mut buf).unwrap(), 8);
        assert_eq!(&buf, b"abcdefgh");

        let mut short = &b"xy"[..];
        assert_eq!(fill(&mut short, &mut buf).unwrap(), 2);
    }
}
