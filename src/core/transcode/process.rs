//! External-process transcoder: raw PCM in on stdin, raw PCM out on stdout.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;

use super::{TranscodeError, TranscodeResult, TranscodeWorker};
use crate::core::audio::{FrameChunker, PcmFormat};

/// How long `flush` waits for the process to drain after stdin closes.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

const READ_BUFFER_SIZE: usize = 4096;

/// Options for the conversion subprocess.
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    /// Path to the ffmpeg binary
    pub program: PathBuf,
    /// Optional `-filter:a` chain
    pub filter: Option<String>,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
            filter: None,
        }
    }
}

struct RunningProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: mpsc::UnboundedReceiver<Bytes>,
    reader: JoinHandle<()>,
}

/// Streams PCM through an ffmpeg subprocess.
///
/// The process is spawned lazily on the first audio event. If it dies or a
/// pipe breaks, the failure is logged, the process is discarded, and the next
/// call to [`TranscodeWorker::process`] spawns a fresh one.
pub struct ProcessTranscoder {
    input: PcmFormat,
    output: PcmFormat,
    options: ProcessOptions,
    running: Option<RunningProcess>,
    output_chunker: FrameChunker,
    spawn_count: u32,
}

impl ProcessTranscoder {
    pub fn new(input: PcmFormat, output: PcmFormat, options: ProcessOptions) -> Self {
        Self {
            input,
            output,
            options,
            running: None,
            output_chunker: FrameChunker::new(output.frame_bytes()),
            spawn_count: 0,
        }
    }

    /// Number of processes spawned over the worker's lifetime.
    pub fn spawn_count(&self) -> u32 {
        self.spawn_count
    }

    /// Command-line arguments for the configured conversion.
    pub fn build_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-f".into(),
            "s16le".into(),
            "-ar".into(),
            self.input.sample_rate.to_string(),
            "-ac".into(),
            self.input.channels.to_string(),
            "-i".into(),
            "-".into(),
        ];
        if let Some(filter) = &self.options.filter {
            args.push("-filter:a".into());
            args.push(filter.clone());
        }
        args.extend([
            "-f".into(),
            "s16le".into(),
            "-ar".into(),
            self.output.sample_rate.to_string(),
            "-ac".into(),
            self.output.channels.to_string(),
            "pipe:1".into(),
        ]);
        args
    }

    fn spawn(&mut self) -> TranscodeResult<()> {
        let program = self.options.program.display().to_string();
        let mut child = Command::new(&self.options.program)
            .args(self.build_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TranscodeError::Spawn {
                program: program.clone(),
                source,
            })?;

        let stdin = child.stdin.take();
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| TranscodeError::Process("stdout not captured".to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!("Transcoder stdout read failed: {}", e);
                        break;
                    }
                }
            }
        });

        self.spawn_count += 1;
        tracing::debug!(
            "Spawned {} ({} -> {}), spawn #{}",
            program,
            self.input,
            self.output,
            self.spawn_count
        );

        self.running = Some(RunningProcess {
            child,
            stdin,
            stdout: rx,
            reader,
        });
        Ok(())
    }

    /// Moves whatever the process has produced into the output framer.
    /// Returns false if the process has exited.
    fn collect_output(&mut self, frames: &mut Vec<Bytes>) -> bool {
        let Some(running) = self.running.as_mut() else {
            return false;
        };
        loop {
            match running.stdout.try_recv() {
                Ok(chunk) => frames.extend(self.output_chunker.push(&chunk)),
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    async fn discard(&mut self) {
        if let Some(mut running) = self.running.take() {
            running.stdin.take();
            if let Err(e) = running.child.start_kill() {
                tracing::debug!("Transcoder already exited: {}", e);
            }
            let _ = running.child.wait().await;
            running.reader.abort();
        }
    }
}

#[async_trait]
impl TranscodeWorker for ProcessTranscoder {
    fn input_format(&self) -> PcmFormat {
        self.input
    }

    fn output_format(&self) -> PcmFormat {
        self.output
    }

    async fn process(&mut self, pcm: &[u8]) -> TranscodeResult<Vec<Bytes>> {
        if self.running.is_none() {
            self.spawn()?;
        }

        let write_result = match self.running.as_mut().and_then(|r| r.stdin.as_mut()) {
            Some(stdin) => stdin.write_all(pcm).await,
            None => Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "stdin closed",
            )),
        };

        let mut frames = Vec::new();
        let alive = self.collect_output(&mut frames);

        if let Err(e) = write_result {
            tracing::error!("Transcoder process write failed, will respawn: {}", e);
            self.discard().await;
            return Err(TranscodeError::Process(e.to_string()));
        }
        if !alive {
            tracing::warn!("Transcoder process exited, will respawn on next audio");
            self.discard().await;
        }
        Ok(frames)
    }

    async fn flush(&mut self) -> TranscodeResult<Vec<Bytes>> {
        let mut frames = Vec::new();
        if let Some(mut running) = self.running.take() {
            // Closing stdin makes ffmpeg drain and exit
            running.stdin.take();
            let reader = &mut running.reader;
            if tokio::time::timeout(DRAIN_TIMEOUT, reader).await.is_err() {
                tracing::warn!("Transcoder did not drain within {:?}", DRAIN_TIMEOUT);
            }
            while let Ok(chunk) = running.stdout.try_recv() {
                frames.extend(self.output_chunker.push(&chunk));
            }
            let _ = running.child.start_kill();
            let _ = running.child.wait().await;
        }
        frames.extend(self.output_chunker.flush_padded());
        Ok(frames)
    }

    async fn shutdown(&mut self) {
        self.discard().await;
        self.output_chunker.clear();
    }
}
