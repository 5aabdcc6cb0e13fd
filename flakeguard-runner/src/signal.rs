// Copyright (c) The flakeguard Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cancellation of in-flight evaluations, from callers or from signals.

use crate::errors::SignalHandlerSetupError;
use std::{fmt, sync::Arc};
use tokio::sync::watch;

/// The kind of signal handling to set up for an evaluation.
///
/// A `SignalHandlerKind` can be passed into
/// [`DecisionEngineBuilder::set_signal_handler`](crate::engine::DecisionEngineBuilder::set_signal_handler).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum SignalHandlerKind {
    /// The standard signal handler. Captures interrupt and termination signals depending on the
    /// platform.
    Standard,

    /// A no-op signal handler. Useful for tests.
    #[default]
    Noop,
}

impl SignalHandlerKind {
    pub(crate) fn build(self) -> Result<SignalHandler, SignalHandlerSetupError> {
        match self {
            Self::Standard => SignalHandler::new(),
            Self::Noop => Ok(SignalHandler::noop()),
        }
    }
}

/// The signal handler implementation.
///
/// Must be built from within a tokio runtime.
#[derive(Debug)]
pub(crate) struct SignalHandler {
    signals: Option<imp::Signals>,
}

impl SignalHandler {
    fn new() -> Result<Self, SignalHandlerSetupError> {
        let signals = imp::Signals::new()?;
        Ok(Self {
            signals: Some(signals),
        })
    }

    fn noop() -> Self {
        Self { signals: None }
    }

    /// Waits for the next signal. Returns `None` if there will never be one.
    pub(crate) async fn recv(&mut self) -> Option<CancelReason> {
        match &mut self.signals {
            Some(signals) => signals.recv().await,
            None => None,
        }
    }
}

#[cfg(unix)]
mod imp {
    use super::CancelReason;
    use tokio::signal::unix::{Signal, SignalKind, signal};

    /// SIGINT, SIGTERM and SIGHUP on Unix.
    #[derive(Debug)]
    pub(super) struct Signals {
        sigint: Signal,
        sighup: Signal,
        sigterm: Signal,
    }

    impl Signals {
        pub(super) fn new() -> std::io::Result<Self> {
            Ok(Self {
                sigint: signal(SignalKind::interrupt())?,
                sighup: signal(SignalKind::hangup())?,
                sigterm: signal(SignalKind::terminate())?,
            })
        }

        pub(super) async fn recv(&mut self) -> Option<CancelReason> {
            tokio::select! {
                recv = self.sigint.recv() => recv.map(|()| CancelReason::Interrupt),
                recv = self.sighup.recv() => recv.map(|()| CancelReason::Hangup),
                recv = self.sigterm.recv() => recv.map(|()| CancelReason::Terminate),
            }
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use super::CancelReason;
    use tokio::signal::windows::{CtrlC, ctrl_c};

    /// Ctrl-C on Windows.
    #[derive(Debug)]
    pub(super) struct Signals {
        ctrl_c: CtrlC,
    }

    impl Signals {
        pub(super) fn new() -> std::io::Result<Self> {
            Ok(Self { ctrl_c: ctrl_c()? })
        }

        pub(super) async fn recv(&mut self) -> Option<CancelReason> {
            self.ctrl_c.recv().await.map(|()| CancelReason::Interrupt)
        }
    }
}

/// The reason an evaluation was cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller cancelled through a [`CancelHandle`].
    Requested,

    /// An interrupt signal (Ctrl-C) was received.
    Interrupt,

    /// A hangup signal was received.
    Hangup,

    /// A termination signal was received.
    Terminate,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => f.write_str("cancellation requested"),
            Self::Interrupt => f.write_str("interrupt signal received"),
            Self::Hangup => f.write_str("hangup signal received"),
            Self::Terminate => f.write_str("termination signal received"),
        }
    }
}

/// A handle used to cancel evaluations.
///
/// Cancellation is sticky: once cancelled, every in-flight and future evaluation run through the
/// engine that owns this handle returns
/// [`EvaluateError::Cancelled`](crate::errors::EvaluateError::Cancelled).
#[derive(Clone, Debug)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<Option<CancelReason>>>,
}

impl CancelHandle {
    /// Creates a new handle that hasn't been cancelled.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.cancel_with(CancelReason::Requested);
    }

    /// Returns the reason this handle was cancelled, if it was.
    pub fn reason(&self) -> Option<CancelReason> {
        *self.sender.borrow()
    }

    /// Returns true if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    pub(crate) fn cancel_with(&self, reason: CancelReason) {
        // The first reason wins.
        self.sender.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    /// Waits until cancellation is requested.
    pub(crate) async fn cancelled(&self) -> CancelReason {
        let mut receiver = self.sender.subscribe();
        match receiver.wait_for(Option::is_some).await {
            Ok(reason) => (*reason).unwrap_or(CancelReason::Requested),
            // The sender lives as long as self, so this can't happen.
            Err(_) => CancelReason::Requested,
        }
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}
