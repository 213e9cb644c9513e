/*! Streaming packet framer.

Host side of the sample streams. A [`FrameWriter`] turns host samples into
beats and pushes them toward the core, with backpressure. A [`FrameReader`]
pops beats coming out of the core, one at a time or as whole bursts.

Framing rules:
* Beats are delivered in push order.
* A burst is everything up to and including a beat with `last` set.
* A partial `keep` is malformed when full width samples are required. It's
  rejected at push time, and nothing from that push is queued.
*/
use std::collections::VecDeque;

use log::{debug, trace};

use crate::fixed::Sc16;
use crate::packet::{KEEP_ALL, Packet};
use crate::stream::{ReadStream, WriteStream, new_stream};
use crate::{Error, Result, Sample};

/// Push side of a framed stream.
#[derive(Debug)]
pub struct FrameWriter {
    tx: WriteStream<Packet>,
    require_full_width: bool,
    pushed: u64,
    bursts: u64,
}

/// Pop side of a framed stream.
#[derive(Debug)]
pub struct FrameReader {
    rx: ReadStream<Packet>,
    // Beats taken off the stream but not yet popped.
    held: VecDeque<Packet>,
    burst: Vec<Sc16>,
    popped: u64,
    bursts: u64,
}

/// Create a framed stream of the given depth.
#[must_use]
pub fn framed(depth: usize, require_full_width: bool) -> (FrameWriter, FrameReader) {
    let (tx, rx) = new_stream(depth);
    (
        FrameWriter::new(tx, require_full_width),
        FrameReader::new(rx),
    )
}

impl FrameWriter {
    /// Wrap the write end of a stream.
    #[must_use]
    pub fn new(tx: WriteStream<Packet>, require_full_width: bool) -> Self {
        Self {
            tx,
            require_full_width,
            pushed: 0,
            bursts: 0,
        }
    }

    /// Frame one sample as a beat, without queuing it.
    pub fn frame(&self, sample: Sc16, last: bool, keep: u8) -> Result<Packet> {
        let p = Packet::with_keep(sample, last, keep);
        p.check(self.require_full_width)?;
        Ok(p)
    }

    fn count(&mut self, p: &Packet) {
        self.pushed += 1;
        if p.last {
            self.bursts += 1;
        }
    }

    /// Push one sample, blocking while the stream is full.
    pub fn push(&mut self, sample: Sc16, last: bool, keep: u8) -> Result<()> {
        let p = self.frame(sample, last, keep)?;
        self.tx.push(p)?;
        self.count(&p);
        Ok(())
    }

    /// Push one sample if there's room, else fail with `Busy`.
    pub fn try_push(&mut self, sample: Sc16, last: bool, keep: u8) -> Result<()> {
        let p = self.frame(sample, last, keep)?;
        self.try_push_packet(p)
    }

    /// Push an already framed beat if there's room, else fail with `Busy`.
    pub fn try_push_packet(&mut self, p: Packet) -> Result<()> {
        p.check(self.require_full_width)?;
        self.tx.try_push(p).map_err(|(e, _)| e)?;
        self.count(&p);
        Ok(())
    }

    /// Push a whole burst. The last sample gets `last`.
    pub fn push_burst(&mut self, samples: &[Sc16]) -> Result<()> {
        let n = samples.len();
        for (i, s) in samples.iter().enumerate() {
            self.push(*s, i + 1 == n, KEEP_ALL)?;
        }
        Ok(())
    }

    /// Frame raw host `sc16` bytes, without queuing anything.
    ///
    /// A trailing fragment shorter than one sample becomes a partial `keep`
    /// beat. If that's not allowed the whole buffer is rejected.
    pub fn frame_bytes(&self, data: &[u8], last: bool) -> Result<Vec<Packet>> {
        let size = Sc16::size();
        let chunks: Vec<&[u8]> = data.chunks(size).collect();
        let mut beats = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.iter().enumerate() {
            let is_last = last && i + 1 == chunks.len();
            if chunk.len() == size {
                beats.push(self.frame(Sc16::parse(chunk)?, is_last, KEEP_ALL)?);
                continue;
            }
            let keep = (1u8 << chunk.len()) - 1;
            let mut padded = [0u8; 4];
            padded[..chunk.len()].copy_from_slice(chunk);
            beats.push(self.frame(Sc16::parse(&padded)?, is_last, keep)?);
        }
        trace!("FrameWriter: {} bytes as {} beats", data.len(), beats.len());
        Ok(beats)
    }

    /// Push raw host `sc16` bytes, blocking while the stream is full.
    ///
    /// Nothing is queued unless the whole buffer frames cleanly.
    pub fn push_bytes(&mut self, data: &[u8], last: bool) -> Result<()> {
        for p in self.frame_bytes(data, last)? {
            self.tx.push(p)?;
            self.count(&p);
        }
        Ok(())
    }

    /// Signal that nothing more will be pushed.
    pub fn finish(&self) {
        debug!(
            "FrameWriter: done after {} beats in {} bursts",
            self.pushed, self.bursts
        );
        self.tx.set_eof();
    }

    /// Beats pushed so far.
    #[must_use]
    pub fn pushed(&self) -> u64 {
        self.pushed
    }

    /// Bursts completed so far.
    #[must_use]
    pub fn bursts(&self) -> u64 {
        self.bursts
    }

    /// True if the other end is gone.
    #[must_use]
    pub fn closed(&self) -> bool {
        self.tx.closed()
    }
}

impl FrameReader {
    /// Wrap the read end of a stream.
    #[must_use]
    pub fn new(rx: ReadStream<Packet>) -> Self {
        Self {
            rx,
            held: VecDeque::new(),
            burst: Vec::new(),
            popped: 0,
            bursts: 0,
        }
    }

    fn count(&mut self, p: Option<Packet>) -> Option<Packet> {
        if let Some(p) = &p {
            self.popped += 1;
            if p.last {
                self.bursts += 1;
            }
        }
        p
    }

    /// Pop the next beat. `None` means no data yet.
    pub fn pop(&mut self) -> Result<Option<Packet>> {
        let p = match self.held.pop_front() {
            Some(p) => Some(p),
            None => self.rx.pop()?,
        };
        Ok(self.count(p))
    }

    /// Pop the next beat, blocking. `None` means end of stream.
    pub fn pop_wait(&mut self) -> Result<Option<Packet>> {
        let p = match self.held.pop_front() {
            Some(p) => Some(p),
            None => self.rx.pop_wait()?,
        };
        Ok(self.count(p))
    }

    /// Move every beat waiting in the stream aside, freeing its slots.
    ///
    /// The beats still come out of `pop()` in order. Returns how many were
    /// moved.
    pub fn stash(&mut self) -> Result<usize> {
        let mut n = 0;
        while let Some(p) = self.rx.pop()? {
            self.held.push_back(p);
            n += 1;
        }
        Ok(n)
    }

    /// Pop beats until a burst is complete.
    ///
    /// Returns `None` if no complete burst is available yet. Beats of an
    /// incomplete burst are held until the rest arrives.
    pub fn pop_burst(&mut self) -> Result<Option<Vec<Sc16>>> {
        while let Some(p) = self.pop()? {
            self.burst.push(p.data);
            if p.last {
                return Ok(Some(std::mem::take(&mut self.burst)));
            }
        }
        Ok(None)
    }

    /// Pop the next burst, blocking.
    ///
    /// At end of stream a trailing burst without `last` is returned as is,
    /// and after that `None`.
    pub fn next_burst(&mut self) -> Result<Option<Vec<Sc16>>> {
        loop {
            match self.pop_wait()? {
                Some(p) => {
                    self.burst.push(p.data);
                    if p.last {
                        return Ok(Some(std::mem::take(&mut self.burst)));
                    }
                }
                None if self.burst.is_empty() => return Ok(None),
                None => {
                    debug!(
                        "FrameReader: stream ended inside a burst, {} samples",
                        self.burst.len()
                    );
                    return Ok(Some(std::mem::take(&mut self.burst)));
                }
            }
        }
    }

    /// Beats popped so far.
    #[must_use]
    pub fn popped(&self) -> u64 {
        self.popped
    }

    /// Complete bursts popped so far.
    #[must_use]
    pub fn bursts(&self) -> u64 {
        self.bursts
    }

    /// True if the writer is done and everything was read.
    #[must_use]
    pub fn eof(&self) -> bool {
        self.held.is_empty() && self.rx.eof()
    }
}

/// Fail unless two beats agree on where a burst ends.
pub fn check_aligned(a: &Packet, b: &Packet) -> Result<()> {
    if a.last != b.last {
        return Err(Error::MalformedFraming(format!(
            "streams disagree on burst end: {} vs {}",
            a.last, b.last
        )));
    }
    Ok(())
}
