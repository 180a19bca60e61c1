use futures::{SinkExt, StreamExt};
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;

use super::{
    BoxConnection, CommandFailure, ConnectOptions, Direction, Event, EventSink, Outcome, Progress,
};
use crate::protocol::{self, Envelope, ProtocolError, Request, Response};

/// One request/response exchange with a store node.
#[derive(Debug, Clone)]
pub struct Command {
    pub action: String,
    pub request: Request,
}

impl Command {
    pub fn new(action: impl Into<String>, request: Request) -> Self {
        Self {
            action: action.into(),
            request,
        }
    }

    /// Send the request and wait for its reply under the connection's time
    /// budget.
    ///
    /// `Denied` and `Failed` replies become the matching outcomes; every other
    /// reply completes the command.
    pub(crate) async fn run(
        self,
        step: usize,
        conn: &mut Framed<BoxConnection, LengthDelimitedCodec>,
        options: &ConnectOptions,
        events: &EventSink,
    ) -> Outcome<Response> {
        let envelope = Envelope {
            token: options.token.clone(),
            request: self.request,
        };
        let frame = match protocol::encode(&envelope) {
            Ok(frame) => frame,
            Err(err) => {
                return Outcome::Failed(CommandFailure::caused_by("request could not be encoded", err));
            }
        };

        let exchange = async {
            let sent = frame.len();
            conn.send(frame).await?;
            events.emit(Event::Progress(Progress {
                step,
                direction: Direction::Sent,
                byte_count: sent,
                percent_sent: 100,
                percent_received: 0,
            }));

            let reply = conn.next().await.ok_or(ProtocolError::Closed)??;
            events.emit(Event::Progress(Progress {
                step,
                direction: Direction::Received,
                byte_count: reply.len(),
                percent_sent: 100,
                percent_received: 100,
            }));
            protocol::decode::<Response>(&reply)
        };

        match timeout(options.timeout, exchange).await {
            Err(_) => {
                debug!("command `{}` timed out after {:?}", self.action, options.timeout);
                Outcome::TimedOut
            }
            Ok(Err(err)) => Outcome::Failed(CommandFailure::caused_by(
                format!("command `{}` failed", self.action),
                err,
            )),
            Ok(Ok(Response::Denied)) => Outcome::AuthorizationDenied,
            Ok(Ok(Response::Failed { message })) => Outcome::Failed(CommandFailure::new(message)),
            Ok(Ok(response)) => Outcome::Completed(response),
        }
    }
}
