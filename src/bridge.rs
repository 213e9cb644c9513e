/*! Host bridge.

What a host side driver needs to talk to the core: register access, lifecycle
control, and a running pipeline with framed streams in and out.

The transport itself (PCIe, Ethernet, whatever carries the register bus) is
not here. A bridge implements [`RegisterAccess`] and [`Lifecycle`] on top of
it, and the in process [`SharedFilter`] implements them directly.

# Example

```
use adaptive_filter::bridge::{Pipeline, RegisterAccess};
use adaptive_filter::config::Config;
use adaptive_filter::fixed::Sc16;
use adaptive_filter::registers::{ControlWord, OutputSelect, REG_COEFF_SEED, REG_USER_ADDR};

let p = Pipeline::start(&Config::with_order(1), true)?;
p.write_register(REG_COEFF_SEED, Sc16::new(0x4000, 0).pack())?;
p.filter().lock()?.reset(true)?;
let ctrl = ControlWord::default().with_step_size(0).with_output(OutputSelect::Filtered);
p.write_register(REG_USER_ADDR, ctrl.bits())?;

let mut p = p;
p.push_bursts(&[Sc16::new(1000, 0), Sc16::new(0, -800)], &[Sc16::ZERO, Sc16::ZERO])?;
let out = p.shutdown()?;
let got: Vec<_> = out.iter().map(|b| b.data).collect();
assert_eq!(got, vec![Sc16::new(500, 0), Sc16::new(0, -400)]);
# Ok::<(), adaptive_filter::Error>(())
```
*/
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::block::{AdaptiveFilterBlock, Block, BlockRet};
use crate::config::Config;
use crate::fixed::Sc16;
use crate::framer::{FrameReader, FrameWriter};
use crate::lms::AdaptiveFilter;
use crate::packet::{KEEP_ALL, Packet};
use crate::registers::DesiredSource;
use crate::stream::new_stream;
use crate::{Error, Result};

/// Register bus access.
pub trait RegisterAccess {
    /// Read a register on the readback bus.
    fn read_register(&self, addr: u32) -> Result<u32>;

    /// Write a register on the settings bus.
    fn write_register(&self, addr: u32, value: u32) -> Result<()>;
}

/// Core lifecycle control.
pub trait Lifecycle {
    /// Clear the delay line, and optionally reseed the coefficients.
    fn reset(&self, reseed: bool) -> Result<()>;

    /// Stop processing. Registers stay readable.
    fn shutdown(&self) -> Result<()>;
}

/// Filter core shared between the sample path and the host control path.
///
/// Each operation holds the lock for its whole duration, so a register
/// write or reset always lands between two samples.
#[derive(Clone, Debug)]
pub struct SharedFilter {
    inner: Arc<Mutex<AdaptiveFilter>>,
}

impl SharedFilter {
    /// Create a new core.
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self::from_filter(AdaptiveFilter::new(config)?))
    }

    /// Share an existing core.
    #[must_use]
    pub fn from_filter(f: AdaptiveFilter) -> Self {
        Self {
            inner: Arc::new(Mutex::new(f)),
        }
    }

    /// Lock the core.
    pub fn lock(&self) -> Result<MutexGuard<'_, AdaptiveFilter>> {
        self.inner.lock().map_err(|_| Error::poisoned("filter lock"))
    }

    /// Process one beat.
    pub fn process(&self, input: &Packet, desired: Option<&Packet>) -> Result<Packet> {
        self.lock()?.process(input, desired)
    }
}

impl RegisterAccess for SharedFilter {
    fn read_register(&self, addr: u32) -> Result<u32> {
        self.lock()?.read_register(addr)
    }
    fn write_register(&self, addr: u32, value: u32) -> Result<()> {
        self.lock()?.write_register(addr, value)
    }
}

impl Lifecycle for SharedFilter {
    fn reset(&self, reseed: bool) -> Result<()> {
        self.lock()?.reset(reseed)
    }
    fn shutdown(&self) -> Result<()> {
        self.lock()?.shutdown();
        Ok(())
    }
}

/// Cancellation token, for stopping the filter thread.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    inner: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create new cancellation token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the token cancelled.
    pub fn cancel(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }

    /// Check if the token is cancelled.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }
}

/** A running core: framed streams in, a filter thread, framed stream out.

The filter thread handles one beat at a time. Host pushes wait while an input
queue is full, so nothing is ever dropped. While waiting, finished output is
moved aside so the thread never stalls on it; it still comes out of the pop
calls in order.

With a reference stream the thread needs one desired beat per input beat.
Neither side may run more than the queue depth ahead of the other: such a
push fails with `Busy` and queues nothing. Use [`Pipeline::push_bursts`] or
[`Pipeline::push_pair`] to feed both sides in step.

Dropping a pipeline without calling [`Pipeline::shutdown`] cancels the
thread. It exits on the next sample boundary.
*/
pub struct Pipeline {
    filter: SharedFilter,
    input: FrameWriter,
    desired: Option<FrameWriter>,
    output: FrameReader,
    depth: u64,
    cancel_token: CancellationToken,
    thread: Option<std::thread::JoinHandle<Result<Duration>>>,
}

impl Pipeline {
    /// Start a core and its filter thread.
    ///
    /// With `reference`, there's a second input stream for the desired
    /// response. Without it the core can only run as a predictor: the
    /// default control word must select the input as desired response, and
    /// control words selecting the reference are refused.
    pub fn start(config: &Config, reference: bool) -> Result<Self> {
        let filter = SharedFilter::new(config)?;
        if !reference {
            filter.lock()?.pin_desired(DesiredSource::Input)?;
        }
        let depth = config.queue_depth;
        let (in_tx, in_rx) = new_stream(depth);
        let (desired, desired_rx) = if reference {
            let (tx, rx) = new_stream(depth);
            (
                Some(FrameWriter::new(tx, config.require_full_width)),
                Some(rx),
            )
        } else {
            (None, None)
        };
        let (mut block, out_rx) =
            AdaptiveFilterBlock::new(filter.clone(), in_rx, desired_rx, depth);

        let cancel_token = CancellationToken::new();
        let token = cancel_token.clone();
        debug!("Starting thread {}", block.block_name());
        let thread = std::thread::Builder::new()
            .name("adaptive filter".to_string())
            .spawn(move || -> Result<Duration> {
                let idle_sleep = Duration::from_micros(100);
                let mut tt = Duration::ZERO;
                while !token.is_canceled() {
                    let st = Instant::now();
                    let ret = block.work()?;
                    tt += st.elapsed();
                    match ret {
                        BlockRet::Ok => {}
                        BlockRet::Noop => std::thread::sleep(idle_sleep),
                        BlockRet::EOF => break,
                    }
                }
                debug!(
                    "{} done, {} beats rejected",
                    block.block_name(),
                    block.rejected()
                );
                Ok(tt)
            })?;

        Ok(Self {
            filter,
            input: FrameWriter::new(in_tx, config.require_full_width),
            desired,
            output: FrameReader::new(out_rx),
            depth: depth as u64,
            cancel_token,
            thread: Some(thread),
        })
    }

    /// The shared core, for register access and lifecycle control.
    #[must_use]
    pub fn filter(&self) -> &SharedFilter {
        &self.filter
    }

    /// Token that stops the filter thread at the next sample boundary.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    fn no_reference() -> Error {
        Error::InvalidState {
            op: "push desired",
            state: "pipeline has no reference stream".into(),
        }
    }

    fn desired(&mut self) -> Result<&mut FrameWriter> {
        self.desired.as_mut().ok_or_else(Self::no_reference)
    }

    // Fail with `Busy` if queuing `input` more input beats and `desired`
    // more desired beats would put one side more than a queue ahead.
    fn check_lag(&self, input: usize, desired: usize) -> Result<()> {
        let Some(d) = &self.desired else {
            return Ok(());
        };
        let ins = self.input.pushed() + input as u64;
        let des = d.pushed() + desired as u64;
        if ins.abs_diff(des) > self.depth {
            debug!(
                "Pipeline: refusing push, {ins} input vs {des} desired beats, depth {}",
                self.depth
            );
            return Err(Error::Busy);
        }
        Ok(())
    }

    // Queue one beat, moving output aside while the queue is full.
    fn feed(w: &mut FrameWriter, output: &mut FrameReader, p: Packet) -> Result<()> {
        let idle_sleep = Duration::from_micros(100);
        loop {
            match w.try_push_packet(p) {
                Err(Error::Busy) => {}
                other => return other,
            }
            if output.stash()? == 0 {
                std::thread::sleep(idle_sleep);
            }
        }
    }

    fn feed_input(&mut self, p: Packet) -> Result<()> {
        Self::feed(&mut self.input, &mut self.output, p)
    }

    fn feed_desired(&mut self, p: Packet) -> Result<()> {
        let w = self.desired.as_mut().ok_or_else(Self::no_reference)?;
        Self::feed(w, &mut self.output, p)
    }

    /// Push an input sample, waiting while the queue is full.
    pub fn push(&mut self, sample: Sc16, last: bool, keep: u8) -> Result<()> {
        let p = self.input.frame(sample, last, keep)?;
        self.check_lag(1, 0)?;
        self.feed_input(p)
    }

    /// Push an input sample, or fail with `Busy`.
    pub fn try_push(&mut self, sample: Sc16, last: bool, keep: u8) -> Result<()> {
        self.check_lag(1, 0)?;
        self.input.try_push(sample, last, keep)
    }

    /// Push an input burst.
    pub fn push_burst(&mut self, samples: &[Sc16]) -> Result<()> {
        self.check_lag(samples.len(), 0)?;
        let n = samples.len();
        for (i, s) in samples.iter().enumerate() {
            let p = self.input.frame(*s, i + 1 == n, KEEP_ALL)?;
            self.feed_input(p)?;
        }
        Ok(())
    }

    /// Push raw host `sc16` bytes to the input.
    ///
    /// Nothing is queued unless the whole buffer frames cleanly.
    pub fn push_bytes(&mut self, data: &[u8], last: bool) -> Result<()> {
        let beats = self.input.frame_bytes(data, last)?;
        self.check_lag(beats.len(), 0)?;
        for p in beats {
            self.feed_input(p)?;
        }
        Ok(())
    }

    /// Push a desired response sample.
    pub fn push_desired(&mut self, sample: Sc16, last: bool, keep: u8) -> Result<()> {
        let p = self.desired()?.frame(sample, last, keep)?;
        self.check_lag(0, 1)?;
        self.feed_desired(p)
    }

    /// Push a desired response burst.
    pub fn push_desired_burst(&mut self, samples: &[Sc16]) -> Result<()> {
        self.desired()?;
        self.check_lag(0, samples.len())?;
        let n = samples.len();
        for (i, s) in samples.iter().enumerate() {
            let p = self.desired()?.frame(*s, i + 1 == n, KEEP_ALL)?;
            self.feed_desired(p)?;
        }
        Ok(())
    }

    /// Push an input sample and its desired response sample together.
    pub fn push_pair(&mut self, input: Sc16, desired: Sc16, last: bool, keep: u8) -> Result<()> {
        let d = self.desired()?.frame(desired, last, keep)?;
        let p = self.input.frame(input, last, keep)?;
        // Lagging side first.
        if self.desired()?.pushed() < self.input.pushed() {
            self.feed_desired(d)?;
            return self.feed_input(p);
        }
        self.feed_input(p)?;
        self.feed_desired(d)
    }

    /// Push an input burst and its desired response burst, beat by beat.
    ///
    /// Any length works, whatever the queue depth.
    pub fn push_bursts(&mut self, input: &[Sc16], desired: &[Sc16]) -> Result<()> {
        self.desired()?;
        if input.len() != desired.len() {
            return Err(Error::MalformedFraming(format!(
                "{} input samples but {} desired",
                input.len(),
                desired.len()
            )));
        }
        let n = input.len();
        for (i, (x, d)) in input.iter().zip(desired).enumerate() {
            self.push_pair(*x, *d, i + 1 == n, KEEP_ALL)?;
        }
        Ok(())
    }

    /// Pop an output beat, if there is one.
    pub fn pop(&mut self) -> Result<Option<Packet>> {
        self.output.pop()
    }

    /// Pop an output beat, blocking. `None` once the thread is done.
    pub fn pop_wait(&mut self) -> Result<Option<Packet>> {
        self.output.pop_wait()
    }

    /// Pop a complete output burst, if there is one.
    pub fn pop_burst(&mut self) -> Result<Option<Vec<Sc16>>> {
        self.output.pop_burst()
    }

    /// Pop the next output burst, blocking.
    pub fn next_burst(&mut self) -> Result<Option<Vec<Sc16>>> {
        self.output.next_burst()
    }

    /// Close the inputs, let the thread finish, and shut the core down.
    ///
    /// Returns every output beat not yet popped, in order.
    pub fn shutdown(mut self) -> Result<Vec<Packet>> {
        self.input.finish();
        if let Some(d) = &self.desired {
            d.finish();
        }
        let mut rest = Vec::new();
        while let Some(p) = self.output.pop_wait()? {
            rest.push(p);
        }
        let busy = match self.thread.take() {
            Some(th) => th.join().map_err(|_| Error::InvalidState {
                op: "shutdown",
                state: "filter thread panicked".into(),
            })??,
            None => Duration::ZERO,
        };
        Lifecycle::shutdown(&self.filter)?;
        let f = self.filter.lock()?;
        info!(
            "Pipeline: {} samples, {} saturations, {} rejected, {:.3}s in filter",
            f.samples(),
            f.saturations(),
            f.rejected(),
            busy.as_secs_f64()
        );
        Ok(rest)
    }
}

impl RegisterAccess for Pipeline {
    fn read_register(&self, addr: u32) -> Result<u32> {
        self.filter.read_register(addr)
    }
    fn write_register(&self, addr: u32, value: u32) -> Result<()> {
        self.filter.write_register(addr, value)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.thread.is_some() {
            warn!("Pipeline dropped without shutdown, cancelling");
            self.cancel_token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::{
        ControlWord, OutputSelect, REG_COEFF_SEED, REG_NUM_TAPS, REG_SAMPLE_COUNT, REG_STATUS,
        REG_USER_ADDR,
    };

    fn filtered(p: &Pipeline, seed: Sc16) -> Result<()> {
        p.write_register(REG_COEFF_SEED, seed.pack())?;
        p.filter().reset(true)?;
        let ctrl = ControlWord::default()
            .with_step_size(0)
            .with_output(OutputSelect::Filtered);
        p.write_register(REG_USER_ADDR, ctrl.bits())
    }

    #[test]
    fn shared_registers() -> Result<()> {
        let f = SharedFilter::new(&Config::with_order(5))?;
        assert_eq!(f.read_register(REG_NUM_TAPS)?, 5);
        f.write_register(REG_USER_ADDR, 0x1234)?;
        assert_eq!(f.read_register(REG_USER_ADDR)?, 0x1234);
        assert!(matches!(
            f.write_register(REG_STATUS, 1),
            Err(Error::UnmappedRegister(REG_STATUS))
        ));
        Lifecycle::shutdown(&f)?;
        assert_eq!(f.read_register(REG_STATUS)?, 3);
        assert!(matches!(f.reset(false), Err(Error::InvalidState { .. })));
        Ok(())
    }

    #[test]
    fn drains_in_order() -> Result<()> {
        let mut p = Pipeline::start(&Config::with_order(1), true)?;
        filtered(&p, Sc16::new(0x4000, 0))?;
        for i in 0..100i16 {
            let last = i % 10 == 9;
            p.push(Sc16::new(i * 10, -i * 10), last, KEEP_ALL)?;
            p.push_desired(Sc16::ZERO, last, KEEP_ALL)?;
        }
        let f = p.filter().clone();
        let out = p.shutdown()?;
        assert_eq!(out.len(), 100);
        for (i, b) in out.iter().enumerate() {
            let i = i as i16;
            assert_eq!(b.data, Sc16::new(i * 5, -i * 5));
            assert_eq!(b.last, i % 10 == 9);
        }
        assert_eq!(f.read_register(REG_SAMPLE_COUNT)?, 100);
        assert_eq!(f.read_register(REG_STATUS)?, 3);
        Ok(())
    }

    #[test]
    fn register_write_while_streaming() -> Result<()> {
        let mut p = Pipeline::start(&Config::with_order(1), true)?;
        filtered(&p, Sc16::ZERO)?;
        let x = vec![Sc16::new(1000, 0); 10];
        let zero = vec![Sc16::ZERO; 10];

        p.push_burst(&x)?;
        p.push_desired_burst(&zero)?;
        let mut first = Vec::new();
        while first.len() < 10 {
            match p.pop_wait()? {
                Some(b) => first.push(b.data),
                None => break,
            }
        }
        assert_eq!(first, zero);

        p.write_register(REG_COEFF_SEED, Sc16::new(0x4000, 0).pack())?;
        p.filter().reset(true)?;
        p.push_burst(&x)?;
        p.push_desired_burst(&zero)?;
        let rest: Vec<_> = p.shutdown()?.iter().map(|b| b.data).collect();
        assert_eq!(rest, vec![Sc16::new(500, 0); 10]);
        Ok(())
    }

    #[test]
    fn bursts_out() -> Result<()> {
        let mut p = Pipeline::start(&Config::with_order(2), true)?;
        p.push_bursts(
            &[Sc16::new(1, 0), Sc16::new(2, 0), Sc16::new(3, 0)],
            &[Sc16::new(7, 7), Sc16::ZERO, Sc16::ZERO],
        )?;
        let burst = loop {
            if let Some(b) = p.pop_burst()? {
                break b;
            }
            std::thread::sleep(Duration::from_millis(1));
        };
        assert_eq!(burst.len(), 3);
        assert_eq!(burst[0], Sc16::new(7, 7));
        assert!(p.shutdown()?.is_empty());
        Ok(())
    }

    #[test]
    fn predictor_has_no_reference() -> Result<()> {
        // Default control word wants a reference stream that isn't there.
        assert!(matches!(
            Pipeline::start(&Config::with_order(2), false),
            Err(Error::InvalidConfiguration(_))
        ));

        let mut config = Config::with_order(2);
        let predictor = ControlWord::default().with_desired(DesiredSource::Input);
        config.defaults.control = predictor.bits();
        let mut p = Pipeline::start(&config, false)?;
        assert!(matches!(
            p.push_desired(Sc16::ZERO, false, KEEP_ALL),
            Err(Error::InvalidState { .. })
        ));
        assert!(matches!(
            p.push_bursts(&[Sc16::ZERO], &[Sc16::ZERO]),
            Err(Error::InvalidState { .. })
        ));
        assert!(matches!(
            p.write_register(REG_USER_ADDR, ControlWord::default().bits()),
            Err(Error::InvalidValue { .. })
        ));
        assert_eq!(p.read_register(REG_USER_ADDR)?, predictor.bits());

        p.push_burst(&[Sc16::new(100, 0); 5])?;
        let f = p.filter().clone();
        let out = p.shutdown()?;
        assert_eq!(out.len(), 5);
        assert_eq!(out[0].data, Sc16::new(100, 0));
        assert!(out[4].last);
        assert_eq!(f.lock()?.rejected(), 0);
        Ok(())
    }

    #[test]
    fn bursts_longer_than_queue() -> Result<()> {
        let config = Config {
            queue_depth: 8,
            ..Config::with_order(4)
        };
        let mut p = Pipeline::start(&config, true)?;
        let x: Vec<_> = (1..=20).map(|i| Sc16::new(i * 10, 0)).collect();
        let d = vec![Sc16::new(5, -5); x.len()];

        // The thread could never pair these up, so nothing is queued.
        assert!(matches!(p.push_burst(&x), Err(Error::Busy)));
        assert!(matches!(p.push_desired_burst(&d), Err(Error::Busy)));

        for _ in 0..3 {
            p.push_bursts(&x, &d)?;
        }
        for _ in 0..3 {
            let b = p.next_burst()?;
            assert_eq!(b.map(|b| b.len()), Some(x.len()));
        }
        assert!(matches!(
            p.push_bursts(&x, &d[1..]),
            Err(Error::MalformedFraming(_))
        ));

        // Up to a queue ahead is fine.
        p.push_burst(&x[..8])?;
        assert!(matches!(p.try_push(x[8], false, KEEP_ALL), Err(Error::Busy)));
        p.push_desired_burst(&d[..8])?;
        assert_eq!(p.next_burst()?.map(|b| b.len()), Some(8));

        let f = p.filter().clone();
        assert!(p.shutdown()?.is_empty());
        assert_eq!(f.read_register(REG_SAMPLE_COUNT)?, 68);
        Ok(())
    }

    #[test]
    fn cancel_stops_at_sample_boundary() -> Result<()> {
        let mut p = Pipeline::start(&Config::with_order(4), true)?;
        for i in 0..50 {
            p.push(Sc16::new(i, i), false, KEEP_ALL)?;
            p.push_desired(Sc16::ZERO, false, KEEP_ALL)?;
        }
        p.cancel_token().cancel();
        let f = p.filter().clone();
        let out = p.shutdown()?;
        // Whatever got processed came out whole.
        assert_eq!(out.len() as u64, f.lock()?.samples());
        Ok(())
    }

    #[test]
    fn bad_config() {
        assert!(matches!(
            Pipeline::start(&Config::with_order(0), true),
            Err(Error::InvalidConfiguration(_))
        ));
    }
}
