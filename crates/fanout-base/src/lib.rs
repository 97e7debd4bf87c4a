use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;

pub mod proto;

pub type Error = anyhow::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// What a job callback hands back instead of a value when it does not want to
/// (or cannot) produce one.
#[derive(Debug)]
pub enum Fault {
    /// Stop handing out new jobs; jobs already in flight finish naturally.
    /// The surrounding `map` yields no result vector.
    Break,
    /// Stop handing out new jobs and hard-kill every surviving worker.
    /// The surrounding `map` yields no result vector.
    Kill,
    /// An ordinary failure, re-surfaced to the caller of `map`.
    Error(Error),
}

impl From<Error> for Fault {
    fn from(err: Error) -> Self {
        Fault::Error(err)
    }
}

/// A worker-side failure in transportable form: the kind of failure plus its
/// rendered message. This is what crosses the pipe or socket back to the
/// master, where it is re-raised.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct JobFault {
    pub kind: String,
    pub message: String,
}

impl JobFault {
    pub fn from_error(err: &Error) -> Self {
        JobFault {
            kind: "error".into(),
            message: format!("{err:#}"),
        }
    }

    /// Payloads that are not strings cannot be rendered; substitute a generic
    /// message rather than losing the failure.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "job panicked with a payload that could not be rendered".to_string()
        };
        JobFault {
            kind: "panic".into(),
            message,
        }
    }

    pub fn into_error(self) -> Error {
        anyhow::anyhow!(self.message)
    }
}

/// The one error a dispatch call surfaces. Exactly one of these comes out of
/// a failed `map`; results accumulated before the failure are discarded.
#[derive(Debug)]
pub enum DispatchError {
    /// A worker's pipe or socket closed before it produced a reply.
    DeadWorker,
    /// The master gave up waiting for remote workers to connect back.
    RemoteWorkerTimeout,
    /// A job callback failed on some worker; this is that failure, re-raised.
    Job(Error),
    /// Pool setup or teardown failed on the calling side.
    System(Error),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::DeadWorker => write!(f, "a worker exited before replying"),
            DispatchError::RemoteWorkerTimeout => {
                write!(f, "timed out waiting for remote workers to connect back")
            }
            DispatchError::Job(err) => write!(f, "{err:#}"),
            DispatchError::System(err) => write!(f, "{err:#}"),
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DispatchError::Job(err) | DispatchError::System(err) => Some(&**err),
            _ => None,
        }
    }
}

pub type DispatchResult<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn job_fault_round_trips_the_message() {
        let err = anyhow!("boom");
        let fault = JobFault::from_error(&err);
        assert_eq!(fault.kind, "error");
        assert_eq!(fault.into_error().to_string(), "boom");
    }

    #[test]
    fn job_fault_renders_the_error_chain() {
        let err = anyhow!("root").context("outer");
        let fault = JobFault::from_error(&err);
        assert_eq!(fault.message, "outer: root");
    }

    #[test]
    fn panic_payloads_downcast_to_strings() {
        let payload: Box<dyn Any + Send> = Box::new("went sideways");
        assert_eq!(JobFault::from_panic(&*payload).message, "went sideways");

        let payload: Box<dyn Any + Send> = Box::new("owned".to_string());
        let fault = JobFault::from_panic(&*payload);
        assert_eq!(fault.kind, "panic");
        assert_eq!(fault.message, "owned");
    }

    #[test]
    fn undumpable_panic_payload_is_substituted() {
        let payload: Box<dyn Any + Send> = Box::new(17u32);
        let fault = JobFault::from_panic(&*payload);
        assert!(fault.message.contains("could not be rendered"));
    }

    #[test]
    fn dispatch_error_display() {
        assert_eq!(
            DispatchError::DeadWorker.to_string(),
            "a worker exited before replying"
        );
        assert_eq!(DispatchError::Job(anyhow!("boom")).to_string(), "boom");
    }
}
