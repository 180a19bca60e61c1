//! Async executor for store-node round trips.
//!
//! A [`Command`] is one request/response exchange. A [`Process`] is an ordered
//! list of commands where each step may look at earlier replies. A
//! [`Transaction`] binds one process to one connection and runs it on a
//! spawned task, so callers never block on the network.
//!
//! Every command ends in exactly one [`Outcome`]. Subscribers registered
//! before `execute()` receive the same lifecycle as [`Event`]s. The executor
//! never retries; callers that want another attempt issue a new transaction.

mod command;
mod process;
mod transaction;

pub use command::Command;
pub use process::Process;
pub use transaction::{Transaction, TransactionHandle};

use async_trait::async_trait;
use std::{io, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::mpsc,
};

use tracing::trace;

use crate::protocol::{DEFAULT_MAX_FRAME_LEN, Response};

/// Terminal result of a command or process.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Completed(T),
    Failed(CommandFailure),
    TimedOut,
    AuthorizationDenied,
}

impl<T> Outcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Completed(value) => Outcome::Completed(f(value)),
            Outcome::Failed(failure) => Outcome::Failed(failure),
            Outcome::TimedOut => Outcome::TimedOut,
            Outcome::AuthorizationDenied => Outcome::AuthorizationDenied,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandFailure {
    pub message: String,
    pub cause: Option<String>,
}

impl CommandFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
        }
    }

    pub fn caused_by(message: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self {
            message: message.into(),
            cause: Some(cause.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub step: usize,
    pub direction: Direction,
    pub byte_count: usize,
    pub percent_sent: u8,
    pub percent_received: u8,
}

/// Lifecycle notifications of a running transaction.
///
/// `Complete` ends one command. `Finished`, `Error`, `Timeout` and
/// `AuthorizationDenied` end the whole process and at most one of them is
/// ever sent. Failures while connecting are reported against step 0.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ActionChanged {
        step: usize,
        action: String,
    },
    Progress(Progress),
    Complete {
        step: usize,
        action: String,
        response: Response,
    },
    Error {
        step: usize,
        message: String,
        cause: Option<String>,
    },
    Timeout {
        step: usize,
    },
    AuthorizationDenied {
        step: usize,
    },
    Finished,
}

impl Event {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::Error { .. }
                | Event::Timeout { .. }
                | Event::AuthorizationDenied { .. }
                | Event::Finished
        )
    }

    /// The terminal event matching a failed outcome, if it is one.
    fn failure<T>(step: usize, outcome: &Outcome<T>) -> Option<Self> {
        match outcome {
            Outcome::Completed(_) => None,
            Outcome::Failed(failure) => Some(Event::Error {
                step,
                message: failure.message.clone(),
                cause: failure.cause.clone(),
            }),
            Outcome::TimedOut => Some(Event::Timeout { step }),
            Outcome::AuthorizationDenied => Some(Event::AuthorizationDenied { step }),
        }
    }
}

/// Fan-out of events to every subscriber. Closed receivers are ignored.
#[derive(Default)]
pub(crate) struct EventSink {
    subscribers: Vec<mpsc::UnboundedSender<Event>>,
}

impl EventSink {
    pub(crate) fn new(subscribers: Vec<mpsc::UnboundedSender<Event>>) -> Self {
        Self { subscribers }
    }

    pub(crate) fn emit(&self, event: Event) {
        if event.is_terminal() {
            trace!(
                "terminal event {:?} to {} subscriber(s)",
                event,
                self.subscribers.len()
            );
        }
        for subscriber in &self.subscribers {
            let _ = subscriber.send(event.clone());
        }
    }
}

/// Settings applied to every connection a transaction opens.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Credential presented with every request.
    pub token: String,
    /// Time budget for connecting and for each command's reply.
    pub timeout: Duration,
    pub max_frame_len: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            token: String::new(),
            timeout: Duration::from_secs(10),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Connection for T {}

pub type BoxConnection = Box<dyn Connection>;

/// Opens byte streams to a store node.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> io::Result<BoxConnection>;
}

#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Arc<Self> {
        Arc::new(Self { addr: addr.into() })
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> io::Result<BoxConnection> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
