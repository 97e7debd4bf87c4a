//! Master-side handles for a single worker, and the loop the worker itself
//! runs on the other end of the pipe or socket.

use crate::dispatch::invoke;
use crate::factory::JobFactory;
use fanout_base::proto::{self, FromWorker, JobPayload, ToWorker, WireFault};
use fanout_base::{DispatchError, DispatchResult, Fault, JobFault, Result};
use nix::errno::Errno;
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use serde::{de::DeserializeOwned, Serialize};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::net::{Shutdown, TcpStream};

/// One worker as the driver sees it: a strict request/reply endpoint. The
/// pipe (or socket) serializes jobs per worker, and reply arrival is the
/// driver's signal that the job slot is free again.
pub(crate) trait WorkerLink<I, O>: Send {
    fn work(&mut self, payload: JobPayload<I>) -> DispatchResult<WorkReply<O>>;
    fn pid(&self) -> Option<Pid>;
    /// Close both endpoints; the worker's read loop sees end-of-stream.
    fn close(&mut self);
    /// Reap the worker if there is anything to reap, swallowing EINTR.
    fn wait(&mut self);
}

pub(crate) enum WorkReply<O> {
    Output(O),
    Discarded,
    Fault(Fault),
}

/// A forked child on the far side of a pipe pair.
pub(crate) struct PipeWorker {
    reader: Option<BufReader<File>>,
    writer: Option<File>,
    pid: Pid,
}

impl PipeWorker {
    pub(crate) fn new(reader: File, writer: File, pid: Pid) -> Self {
        PipeWorker {
            reader: Some(BufReader::new(reader)),
            writer: Some(writer),
            pid,
        }
    }

    pub(crate) fn child(&self) -> Pid {
        self.pid
    }
}

impl<I: Serialize, O: DeserializeOwned> WorkerLink<I, O> for PipeWorker {
    fn work(&mut self, payload: JobPayload<I>) -> DispatchResult<WorkReply<O>> {
        let (Some(reader), Some(writer)) = (&mut self.reader, &mut self.writer) else {
            return Err(DispatchError::DeadWorker);
        };
        exchange(reader, writer, payload)
    }

    fn pid(&self) -> Option<Pid> {
        Some(self.pid)
    }

    fn close(&mut self) {
        self.writer.take();
        self.reader.take();
    }

    fn wait(&mut self) {
        loop {
            match waitpid(self.pid, None) {
                Err(Errno::EINTR) => continue,
                _ => break,
            }
        }
    }
}

/// A remote worker on the far side of one duplex socket. There is no child
/// to reap here; the remote side's exit is its own business.
pub(crate) struct SocketWorker {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl SocketWorker {
    pub(crate) fn new(stream: TcpStream) -> Result<Self> {
        Ok(SocketWorker {
            reader: BufReader::new(stream.try_clone()?),
            writer: stream,
        })
    }
}

impl<I: Serialize, O: DeserializeOwned> WorkerLink<I, O> for SocketWorker {
    fn work(&mut self, payload: JobPayload<I>) -> DispatchResult<WorkReply<O>> {
        exchange(&mut self.reader, &mut self.writer, payload)
    }

    fn pid(&self) -> Option<Pid> {
        None
    }

    fn close(&mut self) {
        // Unlike a pipe pair, closing our end would not end the remote read
        // loop promptly; tell it to quit first.
        proto::write_frame(&mut self.writer, &ToWorker::<()>::Shutdown).ok();
        self.writer.shutdown(Shutdown::Both).ok();
    }

    fn wait(&mut self) {}
}

/// One request/reply round trip. Any transport failure in either direction,
/// including end-of-stream before a full reply, means the worker is gone.
fn exchange<I: Serialize, O: DeserializeOwned>(
    reader: &mut impl Read,
    writer: &mut impl Write,
    payload: JobPayload<I>,
) -> DispatchResult<WorkReply<O>> {
    proto::write_frame(writer, &ToWorker::Job(payload)).map_err(|_| DispatchError::DeadWorker)?;
    match proto::read_frame::<FromWorker<O>>(reader) {
        Ok(Some(FromWorker::Output(output))) => Ok(WorkReply::Output(output)),
        Ok(Some(FromWorker::Discarded)) => Ok(WorkReply::Discarded),
        Ok(Some(FromWorker::Fault(WireFault::Break))) => Ok(WorkReply::Fault(Fault::Break)),
        Ok(Some(FromWorker::Fault(WireFault::Kill))) => Ok(WorkReply::Fault(Fault::Kill)),
        Ok(Some(FromWorker::Fault(WireFault::Error(fault)))) => {
            Ok(WorkReply::Fault(Fault::Error(fault.into_error())))
        }
        Ok(None) | Err(_) => Err(DispatchError::DeadWorker),
    }
}

/// The worker-side loop: decode a job, run the callback, frame the reply.
/// Returns cleanly on end-of-stream or the shutdown terminator; any framing
/// failure is terminal for this worker.
pub(crate) fn serve<I, O, F>(
    mut reader: impl Read,
    mut writer: impl Write,
    factory: &JobFactory<I>,
    preserve_results: bool,
    call: &F,
) -> Result<()>
where
    I: Clone + DeserializeOwned,
    O: Serialize,
    F: Fn(I, usize) -> std::result::Result<O, Fault>,
{
    loop {
        let payload = match proto::read_frame::<ToWorker<I>>(&mut reader)? {
            None | Some(ToWorker::Shutdown) => return Ok(()),
            Some(ToWorker::Job(payload)) => payload,
        };
        let (item, index) = factory.unpack(payload);
        let reply: FromWorker<O> = match invoke(call, item, index) {
            Ok(_) if !preserve_results => FromWorker::Discarded,
            Ok(output) => FromWorker::Output(output),
            Err(Fault::Break) => FromWorker::Fault(WireFault::Break),
            Err(Fault::Kill) => FromWorker::Fault(WireFault::Kill),
            Err(Fault::Error(err)) => {
                FromWorker::Fault(WireFault::Error(JobFault::from_error(&err)))
            }
        };
        proto::write_frame(&mut writer, &reply)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::Source;
    use anyhow::anyhow;
    use std::io::Cursor;
    use std::net::TcpListener;
    use std::thread;

    fn to_worker_frames(msgs: &[ToWorker<u32>]) -> Vec<u8> {
        let mut buf = vec![];
        for msg in msgs {
            proto::write_frame(&mut buf, msg).unwrap();
        }
        buf
    }

    fn replies(buf: &[u8]) -> Vec<FromWorker<u32>> {
        let mut cursor = Cursor::new(buf);
        let mut out = vec![];
        while let Some(reply) = proto::read_frame(&mut cursor).unwrap() {
            out.push(reply);
        }
        out
    }

    #[test]
    fn serves_jobs_until_the_terminator() {
        let factory = JobFactory::new(Source::from(vec![10u32, 20]), None);
        let input = to_worker_frames(&[
            ToWorker::Job(JobPayload::Index(1)),
            ToWorker::Job(JobPayload::Index(0)),
            ToWorker::Shutdown,
        ]);
        let mut output = vec![];
        serve(&input[..], &mut output, &factory, true, &|x: u32, _| {
            Ok::<_, Fault>(x * x)
        })
        .unwrap();
        assert_eq!(
            replies(&output),
            vec![FromWorker::Output(400), FromWorker::Output(100)]
        );
    }

    #[test]
    fn end_of_stream_is_a_clean_shutdown() {
        let factory = JobFactory::new(Source::from(vec![1u32]), None);
        let mut output = vec![];
        serve(&[][..], &mut output, &factory, true, &|x: u32, _| {
            Ok::<_, Fault>(x)
        })
        .unwrap();
        assert!(output.is_empty());
    }

    #[test]
    fn discards_results_when_asked_to() {
        let factory = JobFactory::new(Source::from(vec![10u32]), None);
        let input = to_worker_frames(&[ToWorker::Job(JobPayload::Index(0))]);
        let mut output = vec![];
        serve(&input[..], &mut output, &factory, false, &|x: u32, _| {
            Ok::<_, Fault>(x)
        })
        .unwrap();
        assert_eq!(replies(&output), vec![FromWorker::Discarded]);
    }

    #[test]
    fn faults_cross_back_with_their_tags() {
        let factory = JobFactory::new(Source::from(vec![0u32, 1, 2]), None);
        let input = to_worker_frames(&[
            ToWorker::Job(JobPayload::Index(0)),
            ToWorker::Job(JobPayload::Index(1)),
            ToWorker::Job(JobPayload::Index(2)),
        ]);
        let mut output = vec![];
        serve(
            &input[..],
            &mut output,
            &factory,
            true,
            &|x: u32, _| -> std::result::Result<u32, Fault> {
                match x {
                    0 => Err(Fault::Break),
                    1 => Err(Fault::Kill),
                    _ => Err(Fault::Error(anyhow!("boom"))),
                }
            },
        )
        .unwrap();
        let got = replies(&output);
        assert_eq!(got[0], FromWorker::Fault(WireFault::Break));
        assert_eq!(got[1], FromWorker::Fault(WireFault::Kill));
        match &got[2] {
            FromWorker::Fault(WireFault::Error(fault)) => assert_eq!(fault.message, "boom"),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn panics_come_back_as_faults_not_dead_workers() {
        let factory = JobFactory::new(Source::from(vec![7u32]), None);
        let input = to_worker_frames(&[ToWorker::Job(JobPayload::Index(0))]);
        let mut output = vec![];
        serve(
            &input[..],
            &mut output,
            &factory,
            true,
            &|_: u32, _| -> std::result::Result<u32, Fault> { panic!("job panicked") },
        )
        .unwrap();
        match &replies(&output)[0] {
            FromWorker::Fault(WireFault::Error(fault)) => {
                assert!(fault.message.contains("job panicked"));
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn socket_worker_round_trips_against_a_remote_loop() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let remote = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let factory = JobFactory::new(Source::from(vec![5u32, 6]), None);
            serve(
                BufReader::new(stream.try_clone().unwrap()),
                stream,
                &factory,
                true,
                &|x: u32, _| Ok::<_, Fault>(x + 1),
            )
            .unwrap();
        });

        let stream = TcpStream::connect(addr).unwrap();
        let mut worker = SocketWorker::new(stream).unwrap();
        match WorkerLink::<u32, u32>::work(&mut worker, JobPayload::Index(1)).unwrap() {
            WorkReply::Output(output) => assert_eq!(output, 7),
            _ => panic!("expected an output"),
        }
        // The shutdown terminator ends the remote loop cleanly.
        WorkerLink::<u32, u32>::close(&mut worker);
        remote.join().unwrap();
    }

    #[test]
    fn dead_peer_surfaces_dead_worker() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let remote = thread::spawn(move || {
            // Accept and immediately drop the connection: no reply ever comes.
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });
        let stream = TcpStream::connect(addr).unwrap();
        let mut worker = SocketWorker::new(stream).unwrap();
        let result = WorkerLink::<u32, u32>::work(&mut worker, JobPayload::Index(0));
        assert!(matches!(result, Err(DispatchError::DeadWorker)));
        remote.join().unwrap();
    }
}
