use std::sync::Arc;
use tokio::{
    sync::{mpsc, oneshot},
    time::timeout,
};
use tracing::{debug, info};

use super::{CommandFailure, ConnectOptions, Connector, Event, EventSink, Outcome, Process};
use crate::protocol::{self, Response};

/// Execution context that drives one [`Process`] over one connection.
///
/// Subscribe first, then call [`Transaction::execute`]; `execute` consumes the
/// transaction, so late subscriptions cannot be expressed.
pub struct Transaction {
    process: Process,
    connector: Arc<dyn Connector>,
    options: ConnectOptions,
    subscribers: Vec<mpsc::UnboundedSender<Event>>,
}

impl Transaction {
    pub fn new(process: Process, connector: Arc<dyn Connector>, options: ConnectOptions) -> Self {
        Self {
            process,
            connector,
            options,
            subscribers: Vec::new(),
        }
    }

    /// Receive every event of this transaction. The channel closes once the
    /// terminal event has been delivered.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Start the process on a background task and return immediately.
    pub fn execute(self) -> TransactionHandle {
        let name = self.process.name().to_string();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let outcome = self.run().await;
            let _ = tx.send(outcome);
        });
        TransactionHandle { name, rx }
    }

    async fn run(self) -> Outcome<Vec<Response>> {
        let Transaction {
            process,
            connector,
            options,
            subscribers,
        } = self;
        let events = EventSink::new(subscribers);
        debug!("transaction `{}` connecting", process.name());

        let io = match timeout(options.timeout, connector.connect()).await {
            Ok(Ok(io)) => io,
            Ok(Err(err)) => {
                let failure = CommandFailure::caused_by("could not reach store node", err);
                events.emit(Event::Error {
                    step: 0,
                    message: failure.message.clone(),
                    cause: failure.cause.clone(),
                });
                return Outcome::Failed(failure);
            }
            Err(_) => {
                events.emit(Event::Timeout { step: 0 });
                return Outcome::TimedOut;
            }
        };

        let mut conn = protocol::framed(io, options.max_frame_len);
        let name = process.name().to_string();
        let outcome = process.drive(&mut conn, &options, &events).await;
        if outcome.is_completed() {
            debug!("transaction `{}` completed", name);
        } else {
            info!("transaction `{}` ended without completing: {:?}", name, outcome);
        }
        outcome
    }
}

/// Awaitable result of an executing transaction.
pub struct TransactionHandle {
    name: String,
    rx: oneshot::Receiver<Outcome<Vec<Response>>>,
}

impl TransactionHandle {
    /// Wait for the terminal outcome.
    pub async fn outcome(self) -> Outcome<Vec<Response>> {
        self.rx.await.unwrap_or_else(|_| {
            Outcome::Failed(CommandFailure::new(format!(
                "transaction `{}` ended without an outcome",
                self.name
            )))
        })
    }
}
