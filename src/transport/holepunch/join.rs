//! Parallel channel binding joined on a countdown.
//!
//! Every bind attempt owns a [`CompletionSignal`] that reports exactly once:
//! completing consumes the signal, and dropping it unreported records the
//! attempt as abandoned. The join resolves once all signals have reported.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::transport::{ChannelFactory, ChannelHandle, ContextualError, ErrorContext, HandlerConfig, TransportError};

/// What a single completion signal reported
#[derive(Debug)]
pub enum Completion<T> {
    Done { index: usize, value: T },
    Abandoned { index: usize },
}

/// Countdown join over a fixed number of parallel completions
#[derive(Debug)]
pub struct CountdownJoin<T> {
    expected: usize,
    remaining: Arc<AtomicUsize>,
    receiver: mpsc::UnboundedReceiver<Completion<T>>,
}

/// One-shot completion handle for a single parallel attempt
#[derive(Debug)]
pub struct CompletionSignal<T> {
    index: usize,
    remaining: Arc<AtomicUsize>,
    sender: Option<mpsc::UnboundedSender<Completion<T>>>,
}

impl<T> CountdownJoin<T> {
    /// Create a join expecting `count` completions and the signals feeding it
    pub fn new(count: usize) -> (Self, Vec<CompletionSignal<T>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let remaining = Arc::new(AtomicUsize::new(count));

        let signals = (0..count)
            .map(|index| CompletionSignal {
                index,
                remaining: remaining.clone(),
                sender: Some(sender.clone()),
            })
            .collect();

        let join = Self {
            expected: count,
            remaining,
            receiver,
        };
        (join, signals)
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Signals that have not reported yet
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// Wait for every signal, returning outcomes in completion order
    pub async fn wait(mut self) -> Vec<Completion<T>> {
        let mut completions = Vec::with_capacity(self.expected);
        while completions.len() < self.expected {
            match self.receiver.recv().await {
                Some(completion) => completions.push(completion),
                None => break,
            }
        }
        completions
    }
}

impl<T> CompletionSignal<T> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn complete(mut self, value: T) {
        let index = self.index;
        self.report(Completion::Done { index, value });
    }

    fn report(&mut self, completion: Completion<T>) {
        if let Some(sender) = self.sender.take() {
            self.remaining.fetch_sub(1, Ordering::AcqRel);
            let _ = sender.send(completion);
        }
    }
}

impl<T> Drop for CompletionSignal<T> {
    fn drop(&mut self) {
        let index = self.index;
        self.report(Completion::Abandoned { index });
    }
}

/// A bind attempt that did not produce a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindFailure {
    pub attempt: usize,
    pub reason: String,
}

/// What to do when not a single bind succeeded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BindPolicy {
    /// Fail the session with `AllBindsFailed`
    #[default]
    Fail,
    /// Halve the hole count and bind again, at most `max_rounds` more times
    RetryWithFewerHoles { max_rounds: u32 },
}

/// Result of a parallel bind: the bound subset plus every failure
#[derive(Debug)]
pub struct BindOutcome {
    pub requested: usize,
    /// Bound channels in completion order
    pub bound: Vec<ChannelHandle>,
    pub failures: Vec<BindFailure>,
}

impl BindOutcome {
    fn from_completions(
        requested: usize,
        completions: Vec<Completion<Result<ChannelHandle, TransportError>>>,
    ) -> Self {
        let mut bound = Vec::new();
        let mut failures = Vec::new();

        for completion in completions {
            match completion {
                Completion::Done { value: Ok(channel), .. } => bound.push(channel),
                Completion::Done { index, value: Err(e) } => failures.push(BindFailure {
                    attempt: index,
                    reason: e.to_string(),
                }),
                Completion::Abandoned { index } => failures.push(BindFailure {
                    attempt: index,
                    reason: "bind task ended without reporting".to_string(),
                }),
            }
        }

        Self { requested, bound, failures }
    }

    pub fn is_complete_failure(&self) -> bool {
        self.bound.is_empty()
    }

    pub fn local_ports(&self) -> Vec<u16> {
        self.bound.iter().map(|c| c.local_port()).collect()
    }

    fn into_error(self) -> TransportError {
        TransportError::AllBindsFailed {
            attempted: self.requested,
            failures: self.failures,
        }
    }

    /// The bound channels, or `AllBindsFailed` when there are none
    pub fn into_result(self) -> Result<Vec<ChannelHandle>, TransportError> {
        if self.is_complete_failure() {
            Err(self.into_error())
        } else {
            Ok(self.bound)
        }
    }
}

/// Issue `count` parallel binds and wait for all of them
pub async fn bind_channels(
    factory: Arc<dyn ChannelFactory>,
    count: usize,
    handlers: &HandlerConfig,
    cancel: &CancellationToken,
) -> BindOutcome {
    let (join, signals) = CountdownJoin::new(count);

    for signal in signals {
        let factory = factory.clone();
        let handlers = handlers.clone();
        let cancel = cancel.clone();

        tokio::spawn(async move {
            let index = signal.index();
            let broadcast = handlers.broadcast;
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(TransportError::Cancelled),
                result = factory.bind_channel(broadcast, handlers, None) => result,
            }
            .map_err(|e| attempt_error(index, e));
            match &result {
                Ok(channel) => debug!("bind {} succeeded on {}", index, channel.local_addr()),
                Err(e) => {
                    let context = ErrorContext::new("bind channel").with_attempt(index as u32);
                    warn!("{}", ContextualError::new(e.clone(), context).log_message());
                }
            }
            signal.complete(result);
        });
    }

    BindOutcome::from_completions(count, join.wait().await)
}

/// Tag a failed bind with the attempt it belongs to
fn attempt_error(attempt: usize, error: TransportError) -> TransportError {
    match error {
        TransportError::Cancelled => TransportError::Cancelled,
        TransportError::BindFailed { reason, .. } => TransportError::BindFailed { attempt, reason },
        other => TransportError::BindFailed { attempt, reason: other.to_string() },
    }
}

/// Bind `count` channels, applying `policy` when every bind fails
pub async fn bind_with_policy(
    factory: Arc<dyn ChannelFactory>,
    count: usize,
    handlers: &HandlerConfig,
    policy: BindPolicy,
    cancel: &CancellationToken,
) -> Result<BindOutcome, TransportError> {
    let mut holes = count;
    let mut round = 0;

    loop {
        let outcome = bind_channels(factory.clone(), holes, handlers, cancel).await;
        if !outcome.is_complete_failure() {
            return Ok(outcome);
        }
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        match policy {
            BindPolicy::RetryWithFewerHoles { max_rounds } if round < max_rounds && holes > 1 => {
                round += 1;
                holes /= 2;
                warn!("all {} binds failed, retrying with {} holes (round {})", outcome.requested, holes, round);
            }
            _ => return Err(outcome.into_error()),
        }
    }
}
