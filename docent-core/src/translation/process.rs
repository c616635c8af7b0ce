//! JSON-lines translator running as a long-lived child process.
//!
//! One request line goes to the child's stdin; the reply is either a single
//! `{"success", "translated", "error"}` line or, for streamed requests, a run
//! of `{"type": "chunk" | "complete" | "error", ...}` lines. The child serves
//! one request at a time, so every exchange holds the pipe lock until its last
//! reply line has been read. Exchanges run in their own task: a caller that
//! gives up early leaves the reply to be drained, not to be read by the next
//! request.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc, oneshot};
use tracing::{debug, warn};

use super::{STREAM_BUFFER, TranslationEvent, TranslationService};
use crate::config::TranslationConfig;
use crate::error::TranslationError;
use crate::types::Language;

#[derive(Debug, Serialize)]
struct TranslateRequest {
    text: String,
    src_lang: String,
    tgt_lang: String,
    stream: bool,
}

impl TranslateRequest {
    fn new(text: &str, src: &Language, tgt: &Language, stream: bool) -> Self {
        Self {
            text: text.to_string(),
            src_lang: src.flores_code().to_string(),
            tgt_lang: tgt.flores_code().to_string(),
            stream,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ReplyLine {
    success: bool,
    #[serde(rename = "type")]
    kind: Option<String>,
    index: Option<usize>,
    total: Option<usize>,
    translated: Option<String>,
    error: Option<String>,
}

fn protocol(message: impl Into<String>) -> TranslationError {
    TranslationError::Protocol {
        message: message.into(),
    }
}

/// Parse the single reply to a non-streamed request.
fn parse_reply(line: &str) -> Result<String, TranslationError> {
    let reply: ReplyLine =
        serde_json::from_str(line).map_err(|e| protocol(format!("invalid reply: {e}")))?;
    if !reply.success {
        return Err(TranslationError::Failed {
            message: reply.error.unwrap_or_else(|| "unknown translator error".into()),
        });
    }
    reply
        .translated
        .ok_or_else(|| protocol("reply has no 'translated' field"))
}

/// Parse one line of a streamed reply.
fn parse_stream_line(line: &str) -> Result<TranslationEvent, TranslationError> {
    let reply: ReplyLine =
        serde_json::from_str(line).map_err(|e| protocol(format!("invalid stream line: {e}")))?;
    match reply.kind.as_deref() {
        Some("chunk") => Ok(TranslationEvent::Chunk {
            index: reply.index.unwrap_or(0),
            total: reply.total.unwrap_or(0),
            text: reply.translated.unwrap_or_default(),
        }),
        Some("complete") => Ok(TranslationEvent::Complete {
            text: reply
                .translated
                .ok_or_else(|| protocol("complete line has no 'translated' field"))?,
        }),
        Some("error") => Ok(TranslationEvent::Error {
            message: reply.error.unwrap_or_else(|| "unknown translator error".into()),
        }),
        // Request-level failures (empty text, bad JSON) come back untyped.
        None if !reply.success => Ok(TranslationEvent::Error {
            message: reply.error.unwrap_or_else(|| "unknown translator error".into()),
        }),
        other => Err(protocol(format!("unexpected stream line type {other:?}"))),
    }
}

struct ProcessIo {
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    /// Set once the reply stream may be out of step with requests.
    broken: Option<String>,
    _child: Child,
}

impl ProcessIo {
    fn check(&self) -> Result<(), TranslationError> {
        match &self.broken {
            Some(reason) => Err(TranslationError::Process {
                message: format!("translator unusable: {reason}"),
            }),
            None => Ok(()),
        }
    }

    fn mark_broken(&mut self, err: &TranslationError) {
        if self.broken.is_none() {
            warn!(error = %err, "Translator process marked unusable");
            self.broken = Some(err.to_string());
        }
    }

    async fn send(&mut self, request: &TranslateRequest) -> Result<(), TranslationError> {
        let line = serde_json::to_string(request).map_err(|e| protocol(e.to_string()))?;
        let write = async {
            self.stdin.write_all(line.as_bytes()).await?;
            self.stdin.write_all(b"\n").await?;
            self.stdin.flush().await
        };
        if let Err(e) = write.await {
            let err = TranslationError::Process {
                message: format!("write to translator failed: {e}"),
            };
            self.mark_broken(&err);
            return Err(err);
        }
        Ok(())
    }

    /// Next non-blank stdout line. Timeouts and EOF break the process.
    async fn next_line(&mut self, timeout: Duration) -> Result<String, TranslationError> {
        loop {
            let mut line = String::new();
            let read = tokio::time::timeout(timeout, self.reader.read_line(&mut line)).await;
            let result = match read {
                Err(_) => Err(TranslationError::Process {
                    message: format!("no reply within {}s", timeout.as_secs()),
                }),
                Ok(Err(e)) => Err(TranslationError::Process {
                    message: format!("read from translator failed: {e}"),
                }),
                Ok(Ok(0)) => Err(TranslationError::Process {
                    message: "translator exited".into(),
                }),
                Ok(Ok(_)) => Ok(line),
            };
            match result {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => return Ok(line.trim_end().to_string()),
                Err(err) => {
                    self.mark_broken(&err);
                    return Err(err);
                }
            }
        }
    }
}

/// Translator backed by a persistent child process speaking JSON lines.
pub struct ProcessTranslator {
    name: String,
    io: Arc<Mutex<ProcessIo>>,
    reply_timeout: Duration,
}

impl std::fmt::Debug for ProcessTranslator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessTranslator")
            .field("name", &self.name)
            .finish()
    }
}

impl ProcessTranslator {
    /// Spawn `command` with `args`. The child is killed when the translator is dropped.
    pub fn spawn(command: &str, args: &[String]) -> Result<Self, TranslationError> {
        let mut child = Command::new(command)
            .args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TranslationError::Process {
                message: format!("failed to spawn {command}: {e}"),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| TranslationError::Process {
            message: "failed to capture translator stdin".into(),
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TranslationError::Process {
                message: "failed to capture translator stdout".into(),
            })?;

        debug!(command, "Translator process started");
        Ok(Self {
            name: command.to_string(),
            io: Arc::new(Mutex::new(ProcessIo {
                stdin,
                reader: BufReader::new(stdout),
                broken: None,
                _child: child,
            })),
            reply_timeout: Duration::from_secs(120),
        })
    }

    /// Spawn the translator named by `config.command`.
    pub fn from_config(config: &TranslationConfig) -> Result<Self, TranslationError> {
        let (program, args) =
            config
                .command
                .split_first()
                .ok_or_else(|| TranslationError::Process {
                    message: "translation.command is empty".into(),
                })?;
        Ok(Self::spawn(program, args)?.with_reply_timeout(config.reply_timeout()))
    }

    /// Lock the pipe and send `request`, both inside a detached task.
    ///
    /// The returned receiver yields the send result. The guard is handed to
    /// `exchange`, which runs to completion whether or not anyone waits.
    async fn lock_and_send<F, Fut>(
        &self,
        request: TranslateRequest,
        exchange: F,
    ) -> Result<(), TranslationError>
    where
        F: FnOnce(OwnedMutexGuard<ProcessIo>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let io = Arc::clone(&self.io);
        let (sent_tx, sent_rx) = oneshot::channel();
        tokio::spawn(async move {
            let mut io = io.lock_owned().await;
            let sent = match io.check() {
                Ok(()) => io.send(&request).await,
                Err(err) => Err(err),
            };
            let ok = sent.is_ok();
            let _ = sent_tx.send(sent);
            if ok {
                exchange(io).await;
            }
        });
        sent_rx.await.map_err(|_| TranslationError::Closed)?
    }

    /// Longest wait for any single reply line.
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }
}

#[async_trait]
impl TranslationService for ProcessTranslator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn translate(
        &self,
        text: &str,
        src: &Language,
        tgt: &Language,
    ) -> Result<String, TranslationError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let timeout = self.reply_timeout;
        self.lock_and_send(
            TranslateRequest::new(text, src, tgt, false),
            move |mut io| async move {
                let reply = match io.next_line(timeout).await {
                    Ok(line) => parse_reply(&line).inspect_err(|err| {
                        if matches!(err, TranslationError::Protocol { .. }) {
                            io.mark_broken(err);
                        }
                    }),
                    Err(err) => Err(err),
                };
                if reply_tx.send(reply).is_err() {
                    debug!("Translation caller went away, reply discarded");
                }
            },
        )
        .await?;
        reply_rx.await.map_err(|_| TranslationError::Closed)?
    }

    async fn translate_stream(
        &self,
        text: &str,
        src: &Language,
        tgt: &Language,
    ) -> Result<mpsc::Receiver<TranslationEvent>, TranslationError> {
        // The guard is released only after the terminal line, so no other
        // request interleaves.
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let timeout = self.reply_timeout;
        self.lock_and_send(
            TranslateRequest::new(text, src, tgt, true),
            move |mut io| async move {
                loop {
                    let event = match io.next_line(timeout).await {
                        Ok(line) => match parse_stream_line(&line) {
                            Ok(event) => event,
                            Err(err) => {
                                io.mark_broken(&err);
                                TranslationEvent::Error {
                                    message: err.to_string(),
                                }
                            }
                        },
                        Err(err) => TranslationEvent::Error {
                            message: err.to_string(),
                        },
                    };
                    let terminal = event.is_terminal();
                    // Keep draining after the receiver is gone so the next
                    // request starts on a fresh reply.
                    if !tx.is_closed() {
                        let _ = tx.send(event).await;
                    }
                    if terminal || io.broken.is_some() {
                        break;
                    }
                }
            },
        )
        .await?;
        Ok(rx)
    }
}
