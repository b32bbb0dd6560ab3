use std::collections::VecDeque;

use manifold_core::{ErrorKind, FinishReason, GatewayError, Result, StreamChunk};
use manifold_providers::TokenEvent;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// What to do when the consumer falls behind the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Buffer up to `max_buffer` chunks, then stop pulling from the backend
    /// until the consumer catches up.
    Buffer,
    /// Drop the oldest undelivered token.
    DropOldest,
    /// Keep only the newest undelivered token.
    Latest,
    /// Fail the stream.
    Error,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub policy: BackpressurePolicy,
    pub max_buffer: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            policy: BackpressurePolicy::Buffer,
            max_buffer: 256,
        }
    }
}

/// How a driven stream ended; handed to the completion callback.
#[derive(Debug, Clone)]
pub struct StreamOutcome {
    pub finish: FinishReason,
    pub error: Option<ErrorKind>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Chunks delivered to the consumer, terminal included.
    pub delivered: u64,
}

/// Chunks, then possibly one trailing error after the terminal chunk.
pub type ChunkStream = mpsc::Receiver<Result<StreamChunk>>;

pub type CompletionFn = Box<dyn FnOnce(StreamOutcome) + Send>;

enum SourceEnd {
    Done(FinishReason),
    Failed(GatewayError),
    Disconnected,
}

/// Drive raw adapter [`TokenEvent`]s into numbered [`StreamChunk`]s.
///
/// Sequence numbers are assigned at delivery time and are therefore dense
/// under every backpressure policy — drop policies discard tokens, never
/// numbers. Exactly one terminal chunk is emitted on every path, including
/// backend disconnect (synthesized `finish_reason = error`) and consumer
/// cancellation (`finish_reason = cancelled`, backend receiver dropped so
/// the adapter stops within its next send).
pub fn drive(
    request_id: String,
    first: Option<TokenEvent>,
    source: mpsc::Receiver<TokenEvent>,
    cancel: CancellationToken,
    config: StreamConfig,
    on_complete: Option<CompletionFn>,
) -> ChunkStream {
    let capacity = match config.policy {
        BackpressurePolicy::Buffer => config.max_buffer.max(1),
        _ => 1,
    };
    let (tx, rx) = mpsc::channel(capacity);
    tokio::spawn(drive_inner(request_id, first, source, cancel, config, tx, on_complete));
    rx
}

async fn drive_inner(
    request_id: String,
    first: Option<TokenEvent>,
    mut source: mpsc::Receiver<TokenEvent>,
    cancel: CancellationToken,
    config: StreamConfig,
    tx: mpsc::Sender<Result<StreamChunk>>,
    on_complete: Option<CompletionFn>,
) {
    let mut pending: VecDeque<String> = VecDeque::new();
    let mut seq: u64 = 0;
    let mut input_tokens = 0u32;
    let mut output_tokens = 0u32;
    let mut end: Option<SourceEnd> = None;
    let mut source_open = true;

    let mut handle_event = |ev: Option<TokenEvent>,
                            pending: &mut VecDeque<String>,
                            end: &mut Option<SourceEnd>,
                            source_open: &mut bool,
                            input_tokens: &mut u32,
                            output_tokens: &mut u32| {
        match ev {
            Some(TokenEvent::Token(token)) => {
                if pending.len() >= config.max_buffer {
                    match config.policy {
                        BackpressurePolicy::Buffer => {} // recv arm is gated, not reachable
                        BackpressurePolicy::DropOldest => {
                            pending.pop_front();
                        }
                        BackpressurePolicy::Latest => pending.clear(),
                        BackpressurePolicy::Error => {
                            *end = Some(SourceEnd::Failed(GatewayError::from_kind(
                                ErrorKind::StreamBufferOverflow,
                            )));
                            *source_open = false;
                            pending.clear();
                            return;
                        }
                    }
                }
                pending.push_back(token);
            }
            Some(TokenEvent::Usage {
                input_tokens: it,
                output_tokens: ot,
            }) => {
                *input_tokens = it;
                *output_tokens = ot;
            }
            Some(TokenEvent::Done(reason)) => {
                *end = Some(SourceEnd::Done(reason));
                *source_open = false;
            }
            Some(TokenEvent::Error(e)) => {
                *end = Some(SourceEnd::Failed(e));
                *source_open = false;
            }
            None => {
                *end = Some(SourceEnd::Disconnected);
                *source_open = false;
            }
        }
    };

    if let Some(ev) = first {
        handle_event(
            Some(ev),
            &mut pending,
            &mut end,
            &mut source_open,
            &mut input_tokens,
            &mut output_tokens,
        );
    }

    let mut cancelled = false;
    loop {
        if !source_open && pending.is_empty() {
            break;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                cancelled = true;
                break;
            }
            permit = tx.reserve(), if !pending.is_empty() => {
                let Ok(permit) = permit else {
                    // consumer dropped the stream
                    cancelled = true;
                    break;
                };
                let token = pending.pop_front().unwrap_or_default();
                permit.send(Ok(StreamChunk::token(&request_id, seq, token)));
                seq += 1;
            }
            ev = source.recv(), if source_open
                && (config.policy != BackpressurePolicy::Buffer
                    || pending.len() < config.max_buffer) =>
            {
                handle_event(
                    ev,
                    &mut pending,
                    &mut end,
                    &mut source_open,
                    &mut input_tokens,
                    &mut output_tokens,
                );
            }
        }
    }
    // stop pulling: dropping the source receiver unblocks the adapter task
    drop(source);

    let (finish, trailing_error) = if cancelled {
        (FinishReason::Cancelled, None)
    } else {
        match end {
            Some(SourceEnd::Done(reason)) => (reason, None),
            Some(SourceEnd::Failed(e)) => (FinishReason::Error, Some(e)),
            Some(SourceEnd::Disconnected) | None => (
                FinishReason::Error,
                Some(
                    GatewayError::from_kind(ErrorKind::StreamDisconnected)
                        .with_context("request_id", &request_id),
                ),
            ),
        }
    };

    let error_kind = trailing_error.as_ref().map(|e| e.kind);
    let _ = tx.send(Ok(StreamChunk::terminal(&request_id, seq, finish))).await;
    let mut delivered = seq + 1;
    if let Some(e) = trailing_error {
        debug!(request_id = %request_id, error = %e, "stream terminated with error");
        let _ = tx.send(Err(e)).await;
        delivered += 1;
    }

    if let Some(on_complete) = on_complete {
        on_complete(StreamOutcome {
            finish,
            error: error_kind,
            input_tokens,
            output_tokens,
            delivered,
        });
    }
}
