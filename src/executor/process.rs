use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;

use super::{BoxConnection, Command, ConnectOptions, Event, EventSink, Outcome};
use crate::protocol::{Request, Response};

type StepBuilder = Box<dyn FnOnce(&[Response]) -> Option<Request> + Send>;

struct Step {
    action: String,
    build: StepBuilder,
}

/// An ordered list of commands run as one unit of work.
///
/// Each step's builder sees the replies of the commands already completed and
/// returns the next request, or `None` to skip the step. The first failing
/// command ends the process; later steps are never issued.
pub struct Process {
    name: String,
    steps: Vec<Step>,
}

impl Process {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// A process of exactly one command.
    pub fn single(request: Request) -> Self {
        let name = request.name();
        Self::new(name).step(name, move |_| Some(request))
    }

    pub fn step(
        mut self,
        action: impl Into<String>,
        build: impl FnOnce(&[Response]) -> Option<Request> + Send + 'static,
    ) -> Self {
        self.steps.push(Step {
            action: action.into(),
            build: Box::new(build),
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Walk the steps in order over one connection. Emits every lifecycle
    /// event, including the single terminal one, before returning.
    pub(crate) async fn drive(
        self,
        conn: &mut Framed<BoxConnection, LengthDelimitedCodec>,
        options: &ConnectOptions,
        events: &EventSink,
    ) -> Outcome<Vec<Response>> {
        let mut replies = Vec::with_capacity(self.steps.len());
        for (index, step) in self.steps.into_iter().enumerate() {
            let Some(request) = (step.build)(&replies) else {
                debug!("process `{}` skipped step {} ({})", self.name, index, step.action);
                continue;
            };

            events.emit(Event::ActionChanged {
                step: index,
                action: step.action.clone(),
            });
            let outcome = Command::new(step.action.clone(), request)
                .run(index, conn, options, events)
                .await;

            match outcome {
                Outcome::Completed(response) => {
                    events.emit(Event::Complete {
                        step: index,
                        action: step.action,
                        response: response.clone(),
                    });
                    replies.push(response);
                }
                failed => {
                    debug!(
                        "process `{}` stopped at step {} ({}): {:?}",
                        self.name, index, step.action, failed
                    );
                    if let Some(event) = Event::failure(index, &failed) {
                        events.emit(event);
                    }
                    return failed.map(|_| Vec::new());
                }
            }
        }

        events.emit(Event::Finished);
        Outcome::Completed(replies)
    }
}
