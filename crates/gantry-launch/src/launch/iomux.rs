//! Collects the output streams of the tasks of a step and feeds them stdin.
//!
//! Every task opens two connections to the I/O port of the launcher, one per
//! [`StreamType`], and starts each with a [`StreamHeader`]. Output of a
//! connection is written to the local stdout or stderr; stdin of the
//! launcher is broadcast to the `inout` connections of every task. Each
//! connection is served by its own reader and stdin writer task, all of
//! which end together with [`IoMultiplexer::run`].
use std::future::Future;
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use gantry::credential::Signature;
use gantry::stream::{STREAM_HEADER_LEN, StreamHeader, StreamHeaderError, StreamType};
use gantry::{Map, Set};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::JoinSet;

/// Sent to every task once stdin of the launcher is exhausted.
pub const END_OF_TRANSMISSION: u8 = 0x04;

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Connections accepted per listener wake-up.
const ACCEPT_BATCH: usize = 8;

type StreamKey = (u32, StreamType);

enum TaskEvent {
    Data(StreamKey, Bytes),
    Closed(StreamKey),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IoStats {
    /// Connections with a valid header.
    pub accepted: usize,
    pub rejected: usize,
    /// Bytes received from tasks.
    pub output_bytes: u64,
    /// Bytes of stdin broadcast to tasks, counted once.
    pub input_bytes: u64,
}

pub struct IoMultiplexer {
    listener: TcpListener,
    nprocs: u32,
    signature: Signature,
    label: bool,
}

impl IoMultiplexer {
    pub fn new(listener: TcpListener, nprocs: u32, signature: Signature) -> Self {
        IoMultiplexer {
            listener,
            nprocs,
            signature,
            label: false,
        }
    }

    pub async fn bind(address: &str, nprocs: u32, signature: Signature) -> crate::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self::new(listener, nprocs, signature))
    }

    /// Prefixes every output line with the id of the task that wrote it.
    pub fn with_labels(mut self, label: bool) -> Self {
        self.label = label;
        self
    }

    pub fn local_addr(&self) -> crate::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Forwards I/O until both streams of every task are closed or
    /// `shutdown` resolves.
    pub async fn run<I, O, E, F>(
        self,
        mut stdin: Option<I>,
        stdout: O,
        stderr: E,
        shutdown: F,
    ) -> crate::Result<IoStats>
    where
        I: AsyncRead + Unpin,
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
        F: Future<Output = ()>,
    {
        let mut outputs = Outputs {
            stdout,
            stderr,
            label: self.label,
            partial: Map::default(),
        };
        // Stdin queues of `inout` connections
        let mut stdin_queues: Map<StreamKey, UnboundedSender<Bytes>> = Map::default();
        // Write halves of `sigerr` connections, kept open until the task closes them
        let mut idle_writers: Map<StreamKey, OwnedWriteHalf> = Map::default();
        let mut connected: Set<StreamKey> = Set::default();
        let mut done: Set<StreamKey> = Set::default();
        let mut stats = IoStats::default();

        let (events_tx, mut events_rx) = unbounded_channel();
        let mut pending = FuturesUnordered::new();
        let mut streams = JoinSet::new();
        // Without stdin the tasks get nothing, not even end of transmission
        let mut stdin_open = stdin.is_some();
        let mut stdin_eof = false;
        let mut stdin_buffer = vec![0; READ_BUFFER_SIZE];
        tokio::pin!(shutdown);

        let result = loop {
            if done.len() >= 2 * self.nprocs as usize {
                break Ok(());
            }
            tokio::select! {
                _ = &mut shutdown => {
                    log::debug!("I/O forwarding stopped before all tasks finished");
                    break Ok(());
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, address)) => pending.push(read_header(stream, address)),
                        Err(error) => {
                            log::warn!("Accepting an I/O connection failed: {error}");
                            continue;
                        }
                    }
                    for _ in 1..ACCEPT_BATCH {
                        match self.listener.accept().now_or_never() {
                            Some(Ok((stream, address))) => {
                                pending.push(read_header(stream, address));
                            }
                            Some(Err(error)) => {
                                log::warn!("Accepting an I/O connection failed: {error}");
                                break;
                            }
                            None => break,
                        }
                    }
                }
                Some((stream, address, header)) = pending.next(), if !pending.is_empty() => {
                    let key = match header.and_then(|h| self.check_header(&h, &connected)) {
                        Ok(key) => key,
                        Err(error) => {
                            log::error!("Rejected I/O connection from {address}: {error}");
                            stats.rejected += 1;
                            continue;
                        }
                    };
                    log::debug!("Task {} connected its {} stream from {address}", key.0, key.1);
                    let (reader, writer) = stream.into_split();
                    match key.1 {
                        StreamType::InOut => {
                            let (queue, input) = unbounded_channel();
                            if stdin_eof {
                                let _ = queue.send(Bytes::from_static(&[END_OF_TRANSMISSION]));
                            }
                            stdin_queues.insert(key, queue);
                            streams.spawn(write_task_stdin(key, writer, input));
                        }
                        StreamType::SigErr => {
                            idle_writers.insert(key, writer);
                        }
                    }
                    connected.insert(key);
                    stats.accepted += 1;
                    streams.spawn(forward_task_stream(key, reader, events_tx.clone()));
                }
                read = read_some(stdin.as_mut(), &mut stdin_buffer), if stdin_open => {
                    let data = match read {
                        Ok(0) => {
                            stdin_open = false;
                            stdin_eof = true;
                            Bytes::from_static(&[END_OF_TRANSMISSION])
                        }
                        Ok(size) => {
                            stats.input_bytes += size as u64;
                            Bytes::copy_from_slice(&stdin_buffer[..size])
                        }
                        Err(error) => {
                            log::warn!("Reading stdin failed: {error}");
                            stdin_open = false;
                            stdin_eof = true;
                            Bytes::from_static(&[END_OF_TRANSMISSION])
                        }
                    };
                    // A closed queue means its writer gave up on the task
                    stdin_queues.retain(|_, queue| queue.send(data.clone()).is_ok());
                }
                Some(event) = events_rx.recv() => {
                    match event {
                        TaskEvent::Data(key, data) => {
                            stats.output_bytes += data.len() as u64;
                            if let Err(error) = outputs.write(key, &data).await {
                                break Err(error);
                            }
                        }
                        TaskEvent::Closed(key) => {
                            log::debug!("Task {} closed its {} stream", key.0, key.1);
                            if let Err(error) = outputs.finish(key).await {
                                break Err(error);
                            }
                            stdin_queues.remove(&key);
                            idle_writers.remove(&key);
                            done.insert(key);
                        }
                    }
                }
                Some(joined) = streams.join_next(), if !streams.is_empty() => {
                    if let Err(error) = joined {
                        log::error!("I/O stream task failed: {error}");
                    }
                }
            }
        };
        drop(stdin_queues);
        drop(idle_writers);
        streams.shutdown().await;
        result?;
        outputs.flush().await?;
        Ok(stats)
    }

    fn check_header(
        &self,
        header: &[u8; STREAM_HEADER_LEN],
        connected: &Set<StreamKey>,
    ) -> crate::Result<StreamKey> {
        let key = StreamHeader::unpack(header)?.validate(self.nprocs, &self.signature)?;
        if connected.contains(&key) {
            return Err(format!("task {} already connected its {} stream", key.0, key.1).into());
        }
        Ok(key)
    }
}

async fn read_header(
    mut stream: TcpStream,
    address: SocketAddr,
) -> (TcpStream, SocketAddr, crate::Result<[u8; STREAM_HEADER_LEN]>) {
    let mut header = [0; STREAM_HEADER_LEN];
    let result = match stream.read_exact(&mut header).await {
        Ok(_) => Ok(header),
        Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(StreamHeaderError::Truncated(0).into())
        }
        Err(error) => Err(error.into()),
    };
    (stream, address, result)
}

async fn read_some<R: AsyncRead + Unpin>(
    reader: Option<&mut R>,
    buffer: &mut [u8],
) -> std::io::Result<usize> {
    match reader {
        Some(reader) => reader.read(buffer).await,
        None => std::future::pending().await,
    }
}

async fn write_task_stdin(
    key: StreamKey,
    mut writer: OwnedWriteHalf,
    mut input: UnboundedReceiver<Bytes>,
) {
    while let Some(data) = input.recv().await {
        if let Err(error) = writer.write_all(&data).await {
            log::warn!("Sending stdin to task {} failed: {error}", key.0);
            return;
        }
    }
}

async fn forward_task_stream(
    key: StreamKey,
    mut reader: OwnedReadHalf,
    events: UnboundedSender<TaskEvent>,
) {
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        buffer.reserve(READ_BUFFER_SIZE);
        match reader.read_buf(&mut buffer).await {
            Ok(0) => break,
            Ok(_) => {
                if events
                    .send(TaskEvent::Data(key, buffer.split().freeze()))
                    .is_err()
                {
                    return;
                }
            }
            Err(error) => {
                log::warn!("Stream {} of task {} failed: {error}", key.1, key.0);
                break;
            }
        }
    }
    // The receiver is gone only when forwarding already ended
    let _ = events.send(TaskEvent::Closed(key));
}

struct Outputs<O, E> {
    stdout: O,
    stderr: E,
    label: bool,
    // Unterminated last line per stream, labelled outputs only
    partial: Map<StreamKey, BytesMut>,
}

impl<O: AsyncWrite + Unpin, E: AsyncWrite + Unpin> Outputs<O, E> {
    async fn emit(&mut self, stream: StreamType, data: &[u8]) -> std::io::Result<()> {
        match stream {
            StreamType::InOut => self.stdout.write_all(data).await,
            StreamType::SigErr => self.stderr.write_all(data).await,
        }
    }

    async fn write(&mut self, key: StreamKey, data: &[u8]) -> std::io::Result<()> {
        if !self.label {
            return self.emit(key.1, data).await;
        }
        let labelled = {
            let carry = self.partial.entry(key).or_default();
            carry.extend_from_slice(data);
            let mut labelled = BytesMut::new();
            while let Some(end) = carry.iter().position(|b| *b == b'\n') {
                let line = carry.split_to(end + 1);
                labelled.extend_from_slice(format!("{}: ", key.0).as_bytes());
                labelled.extend_from_slice(&line);
            }
            labelled
        };
        if labelled.is_empty() {
            return Ok(());
        }
        self.emit(key.1, &labelled).await
    }

    /// Writes out the unterminated last line of a closed stream.
    async fn finish(&mut self, key: StreamKey) -> std::io::Result<()> {
        match self.partial.remove(&key) {
            Some(rest) if !rest.is_empty() => {
                let mut labelled = BytesMut::from(format!("{}: ", key.0).as_bytes());
                labelled.extend_from_slice(&rest);
                self.emit(key.1, &labelled).await
            }
            _ => Ok(()),
        }
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        let keys: Vec<StreamKey> = self.partial.keys().copied().collect();
        for key in keys {
            self.finish(key).await?;
        }
        self.stdout.flush().await?;
        self.stderr.flush().await
    }
}
