/*! Block implementation.

A block reads from its input streams, does one thing, and writes to its
output stream. [`AdaptiveFilterBlock`] is the one that matters here: it runs
the shared filter core over a sample stream, and optionally a desired
response stream.
*/
use log::{debug, trace};

use crate::bridge::SharedFilter;
use crate::packet::Packet;
use crate::stream::{ReadStream, WriteStream, new_stream};
use crate::{Error, Result};

/** Return type for all blocks.

This will let the runner know if more data could come out of this block,
or if it should just never bother calling it again.
*/
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockRet {
    /// Processed something. There may be more.
    Ok,

    /// Produced nothing, because not enough input.
    Noop,

    /// Block will never produce more output.
    ///
    /// Examples:
    /// * Input stream reached EOF, and everything was processed.
    /// * Filter core was shut down.
    EOF,
}

/// Block trait, implemented for all blocks.
pub trait Block {
    /** Name of block.

    Not name of *instance* of block.
     */
    fn block_name(&self) -> &'static str;

    /** Block work function.

    Processes at most one beat, so a runner that stops calling `work()`
    always stops on a sample boundary.
     */
    fn work(&mut self) -> Result<BlockRet>;
}

/// Runs the adaptive filter core over streams.
///
/// If there's a desired response stream, one beat is taken from it for
/// every input beat, whatever the control word says.
pub struct AdaptiveFilterBlock {
    filter: SharedFilter,
    src: ReadStream<Packet>,
    desired: Option<ReadStream<Packet>>,
    dst: WriteStream<Packet>,

    // Input beat waiting for its desired beat.
    pending: Option<Packet>,
    rejected: u64,
}

impl AdaptiveFilterBlock {
    /// Create a new block, and its output stream.
    #[must_use]
    pub fn new(
        filter: SharedFilter,
        src: ReadStream<Packet>,
        desired: Option<ReadStream<Packet>>,
        depth: usize,
    ) -> (Self, ReadStream<Packet>) {
        let (dst, out) = new_stream(depth);
        (
            Self {
                filter,
                src,
                desired,
                dst,
                pending: None,
                rejected: 0,
            },
            out,
        )
    }

    /// Beats this block saw rejected.
    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    // Next (input, desired) pair, or the reason there isn't one.
    fn next_pair(&mut self) -> Result<std::result::Result<(Packet, Option<Packet>), BlockRet>> {
        let input = match self.pending.take() {
            Some(p) => p,
            None => match self.src.pop()? {
                Some(p) => p,
                None if self.src.eof() => return Ok(Err(BlockRet::EOF)),
                None => return Ok(Err(BlockRet::Noop)),
            },
        };
        let Some(desired) = &self.desired else {
            return Ok(Ok((input, None)));
        };
        match desired.pop()? {
            Some(d) => Ok(Ok((input, Some(d)))),
            // Desired stream ran out early. Let the core judge the beat.
            None if desired.eof() => Ok(Ok((input, None))),
            None => {
                self.pending = Some(input);
                Ok(Err(BlockRet::Noop))
            }
        }
    }
}

impl Block for AdaptiveFilterBlock {
    fn block_name(&self) -> &'static str {
        "AdaptiveFilterBlock"
    }

    fn work(&mut self) -> Result<BlockRet> {
        let (input, desired) = match self.next_pair()? {
            Ok(pair) => pair,
            Err(ret) => return Ok(ret),
        };
        // The core is locked for exactly one sample. Register writes from
        // the host land between samples.
        let out = match self.filter.process(&input, desired.as_ref()) {
            Ok(out) => out,
            Err(Error::MalformedFraming(e)) => {
                self.rejected += 1;
                trace!("{}: dropped beat: {e}", self.block_name());
                return Ok(BlockRet::Ok);
            }
            Err(Error::InvalidState { op, state }) => {
                debug!("{}: {op} not allowed: {state}", self.block_name());
                return Ok(BlockRet::EOF);
            }
            Err(e) => return Err(e),
        };
        match self.dst.push(out) {
            Ok(()) => Ok(BlockRet::Ok),
            Err(Error::Closed) => {
                debug!("{}: output reader gone", self.block_name());
                Ok(BlockRet::EOF)
            }
            Err(e) => Err(e),
        }
    }
}
