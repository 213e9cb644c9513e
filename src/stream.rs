/*! Streams connecting the framer and the filter core.

A stream is a bounded single producer, single consumer queue. It never drops
anything: when it's full, `push()` blocks and `try_push()` says
[`Error::Busy`].

Dropping the write end marks the stream EOF. Readers drain what's left, then
see the end. Dropping the read end makes further writes fail with
[`Error::Closed`].
*/
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::{Error, Result};

#[derive(Debug)]
struct Inner<T> {
    buf: VecDeque<T>,
    eof: bool,
    reader_gone: bool,
}

#[derive(Debug)]
struct Stream<T> {
    inner: Mutex<Inner<T>>,
    // Signalled on every state change. Readers and writers both wait on it.
    cond: Condvar,
    capacity: usize,
}

impl<T> Stream<T> {
    fn lock(&self) -> Result<MutexGuard<'_, Inner<T>>> {
        self.inner.lock().map_err(|_| Error::poisoned("stream lock"))
    }
}

/// Write end of a stream.
#[derive(Debug)]
pub struct WriteStream<T> {
    s: Arc<Stream<T>>,
}

/// Read end of a stream.
#[derive(Debug)]
pub struct ReadStream<T> {
    s: Arc<Stream<T>>,
}

/// Create a new stream holding at most `capacity` items.
#[must_use]
pub fn new_stream<T>(capacity: usize) -> (WriteStream<T>, ReadStream<T>) {
    let s = Arc::new(Stream {
        inner: Mutex::new(Inner {
            buf: VecDeque::with_capacity(capacity),
            eof: false,
            reader_gone: false,
        }),
        cond: Condvar::new(),
        capacity: capacity.max(1),
    });
    (WriteStream { s: s.clone() }, ReadStream { s })
}

impl<T> WriteStream<T> {
    /// Push one item, blocking while the stream is full.
    pub fn push(&self, val: T) -> Result<()> {
        let mut inner = self.s.lock()?;
        loop {
            if inner.reader_gone {
                return Err(Error::Closed);
            }
            if inner.buf.len() < self.s.capacity {
                break;
            }
            inner = self
                .s
                .cond
                .wait(inner)
                .map_err(|_| Error::poisoned("stream wait"))?;
        }
        inner.buf.push_back(val);
        self.s.cond.notify_all();
        Ok(())
    }

    /// Push one item if there's room.
    ///
    /// On `Busy` the item is handed back untouched.
    pub fn try_push(&self, val: T) -> std::result::Result<(), (Error, T)> {
        let mut inner = match self.s.lock() {
            Ok(i) => i,
            Err(e) => return Err((e, val)),
        };
        if inner.reader_gone {
            return Err((Error::Closed, val));
        }
        if inner.buf.len() >= self.s.capacity {
            return Err((Error::Busy, val));
        }
        inner.buf.push_back(val);
        self.s.cond.notify_all();
        Ok(())
    }

    /// Free slots.
    pub fn free(&self) -> Result<usize> {
        Ok(self.s.capacity - self.s.lock()?.buf.len())
    }

    /// Mark end of stream. Dropping the writer does the same.
    pub fn set_eof(&self) {
        if let Ok(mut inner) = self.s.lock() {
            inner.eof = true;
        }
        self.s.cond.notify_all();
    }

    /// True if the reader has hung up.
    #[must_use]
    pub fn closed(&self) -> bool {
        self.s.lock().map(|i| i.reader_gone).unwrap_or(true)
    }
}

impl<T> Drop for WriteStream<T> {
    fn drop(&mut self) {
        self.set_eof();
    }
}

impl<T> ReadStream<T> {
    /// Pop one item, if there is one.
    pub fn pop(&self) -> Result<Option<T>> {
        let mut inner = self.s.lock()?;
        let ret = inner.buf.pop_front();
        if ret.is_some() {
            self.s.cond.notify_all();
        }
        Ok(ret)
    }

    /// Pop one item, blocking until there is one.
    ///
    /// Returns `None` once the writer is done and everything is drained.
    pub fn pop_wait(&self) -> Result<Option<T>> {
        let mut inner = self.s.lock()?;
        loop {
            if let Some(v) = inner.buf.pop_front() {
                self.s.cond.notify_all();
                return Ok(Some(v));
            }
            if inner.eof {
                return Ok(None);
            }
            inner = self
                .s
                .cond
                .wait(inner)
                .map_err(|_| Error::poisoned("stream wait"))?;
        }
    }

    /// Number of queued items.
    pub fn len(&self) -> Result<usize> {
        Ok(self.s.lock()?.buf.len())
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// True if the writer is done, and everything has been read.
    #[must_use]
    pub fn eof(&self) -> bool {
        self.s
            .lock()
            .map(|i| i.eof && i.buf.is_empty())
            .unwrap_or(true)
    }
}

impl<T: Copy> ReadStream<T> {
    /// Create a finished stream holding `data`. Mostly for tests.
    #[must_use]
    pub fn from_slice(data: &[T]) -> Self {
        let (w, r) = new_stream(data.len());
        for v in data {
            // Can't fail: capacity fits, and the reader is alive.
            let _ = w.try_push(*v);
        }
        drop(w);
        r
    }
}

impl<T> Drop for ReadStream<T> {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.s.lock() {
            inner.reader_gone = true;
        }
        self.s.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() -> Result<()> {
        let (w, r) = new_stream(10);
        for i in 0..5u32 {
            w.push(i)?;
        }
        assert_eq!(r.len()?, 5);
        for i in 0..5u32 {
            assert_eq!(r.pop()?, Some(i));
        }
        assert_eq!(r.pop()?, None);
        assert!(!r.eof());
        drop(w);
        assert!(r.eof());
        assert_eq!(r.pop_wait()?, None);
        Ok(())
    }

    #[test]
    fn backpressure() -> Result<()> {
        let (w, r) = new_stream(2);
        w.try_push(1u8).map_err(|(e, _)| e)?;
        w.try_push(2u8).map_err(|(e, _)| e)?;
        assert_eq!(w.free()?, 0);
        match w.try_push(3u8) {
            Err((Error::Busy, 3)) => {}
            other => panic!("want Busy, got {other:?}"),
        }
        // Nothing dropped.
        assert_eq!(r.pop()?, Some(1));
        w.try_push(3u8).map_err(|(e, _)| e)?;
        assert_eq!(r.pop()?, Some(2));
        assert_eq!(r.pop()?, Some(3));
        Ok(())
    }

    #[test]
    fn blocking_push_waits_for_reader() -> Result<()> {
        let (w, r) = new_stream(1);
        let th = std::thread::spawn(move || -> Result<()> {
            for i in 0..100u32 {
                w.push(i)?;
            }
            Ok(())
        });
        let mut got = Vec::new();
        while let Some(v) = r.pop_wait()? {
            got.push(v);
        }
        th.join().expect("writer thread panicked")?;
        assert_eq!(got, (0..100).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn closed_reader() {
        let (w, r) = new_stream::<u8>(1);
        drop(r);
        assert!(w.closed());
        assert!(matches!(w.push(1), Err(Error::Closed)));
        assert!(matches!(w.try_push(1), Err((Error::Closed, 1))));
    }

    #[test]
    fn from_slice() -> Result<()> {
        let r = ReadStream::from_slice(&[1, 2, 3]);
        assert_eq!(r.pop_wait()?, Some(1));
        assert_eq!(r.pop_wait()?, Some(2));
        assert_eq!(r.pop_wait()?, Some(3));
        assert_eq!(r.pop_wait()?, None);
        assert!(r.eof());
        Ok(())
    }
}
