//! Messages that travel between the master and its workers, and the framing
//! codec that carries them. Each frame is a little-endian u32 length prefix
//! followed by a bincode body; the receiver treats every frame atomically.

use crate::{JobFault, Result};
use anyhow::Context as _;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::io::{ErrorKind, Read, Write};

/// One job as it travels to a worker.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum JobPayload<I> {
    /// Dense index into a source both sides hold a copy of. Local children
    /// were forked after the source was materialized; remote slaves
    /// materialized it from their own invocation of the same program.
    Index(usize),
    /// The item itself plus its index, for sources only the master can see.
    Item(I, usize),
}

impl<I> JobPayload<I> {
    pub fn index(&self) -> usize {
        match self {
            JobPayload::Index(index) => *index,
            JobPayload::Item(_, index) => *index,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ToWorker<I> {
    Job(JobPayload<I>),
    /// Terminator; the worker loop exits cleanly on receipt.
    Shutdown,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum FromWorker<O> {
    Output(O),
    /// The callback's value was discarded at the worker to skip transport.
    Discarded,
    Fault(WireFault),
}

/// A job verdict in transportable form. Break and Kill keep their tags;
/// everything else crosses as a rendered [`JobFault`].
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum WireFault {
    Break,
    Kill,
    Error(JobFault),
}

pub fn write_frame<T: Serialize>(mut writer: impl Write, msg: &T) -> Result<()> {
    let body = bincode::serialize(msg).context("encoding frame")?;
    writer.write_all(&(body.len() as u32).to_le_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame. `Ok(None)` is a clean end-of-stream: the peer closed its
/// end exactly on a frame boundary. EOF anywhere inside a frame is an error.
pub fn read_frame<T: DeserializeOwned>(mut reader: impl Read) -> Result<Option<T>> {
    let mut prefix = [0u8; 4];
    if !read_exact_or_eof(&mut reader, &mut prefix)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(prefix) as usize;
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .context("stream ended inside a frame")?;
    Ok(Some(bincode::deserialize(&body).context("decoding frame")?))
}

/// Like `read_exact`, except EOF before the first byte returns `Ok(false)`.
fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => anyhow::bail!("stream ended inside a frame"),
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(true)
}
