//! Write-duplicating sink used to feed one input stream to many hosts

use std::io::{self, Write};

/// How a [`BroadcastWriter`] treats a destination that fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePolicy {
    /// Errors are discarded and every write reports the full length.
    Silent,
    /// The first failing destination fails the write.
    FailFast,
}

/// A destination handed to [`BroadcastWriter::new`].
pub enum Destination {
    Single(Box<dyn Write + Send>),
    Nested(BroadcastWriter),
}

impl Destination {
    pub fn single<W: Write + Send + 'static>(writer: W) -> Self {
        Destination::Single(Box::new(writer))
    }
}

impl From<BroadcastWriter> for Destination {
    fn from(writer: BroadcastWriter) -> Self {
        Destination::Nested(writer)
    }
}

impl From<Box<dyn Write + Send>> for Destination {
    fn from(writer: Box<dyn Write + Send>) -> Self {
        Destination::Single(writer)
    }
}

/// Duplicates every write to each destination, like tee(1).
///
/// Nested broadcasters are flattened at construction, so a tree of
/// broadcasts always writes through a single flat list.
pub struct BroadcastWriter {
    writers: Vec<Box<dyn Write + Send>>,
    policy: WritePolicy,
}

impl BroadcastWriter {
    pub fn new<I>(destinations: I, policy: WritePolicy) -> Self
    where
        I: IntoIterator<Item = Destination>,
    {
        let mut writers = Vec::new();
        for destination in destinations {
            match destination {
                Destination::Single(writer) => writers.push(writer),
                Destination::Nested(nested) => writers.extend(nested.writers),
            }
        }
        Self { writers, policy }
    }

    /// Broadcaster that never reports destination errors
    pub fn silent<I>(destinations: I) -> Self
    where
        I: IntoIterator<Item = Destination>,
    {
        Self::new(destinations, WritePolicy::Silent)
    }

    pub fn policy(&self) -> WritePolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.writers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writers.is_empty()
    }
}

impl Write for BroadcastWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for writer in self.writers.iter_mut() {
            let result = writer.write_all(buf);
            if self.policy == WritePolicy::FailFast {
                result?;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        for writer in self.writers.iter_mut() {
            let result = writer.flush();
            if self.policy == WritePolicy::FailFast {
                result?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::SharedBuffer;

    /// Destination that behaves like a closed pipe
    struct Closed;

    impl Write for Closed {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }
    }

    #[test]
    fn test_silent_skips_closed_destination() {
        let first = SharedBuffer::new();
        let last = SharedBuffer::new();
        let mut writer = BroadcastWriter::silent(vec![
            Destination::single(first.clone()),
            Destination::single(Closed),
            Destination::single(last.clone()),
        ]);

        let n = writer.write(b"payload\n").unwrap();
        assert_eq!(n, 8);
        writer.flush().unwrap();

        assert_eq!(first.contents(), b"payload\n");
        assert_eq!(last.contents(), b"payload\n");
    }

    #[test]
    fn test_fail_fast_reports_error() {
        let first = SharedBuffer::new();
        let mut writer = BroadcastWriter::new(
            vec![Destination::single(first.clone()), Destination::single(Closed)],
            WritePolicy::FailFast,
        );

        let err = writer.write(b"abc").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(first.contents(), b"abc");
    }

    #[test]
    fn test_nested_broadcasts_are_flattened() {
        let a = SharedBuffer::new();
        let b = SharedBuffer::new();
        let c = SharedBuffer::new();

        let inner = BroadcastWriter::silent(vec![
            Destination::single(a.clone()),
            Destination::single(b.clone()),
        ]);
        let mut outer = BroadcastWriter::silent(vec![inner.into(), Destination::single(c.clone())]);
        assert_eq!(outer.len(), 3);

        io::copy(&mut &b"fan out"[..], &mut outer).unwrap();
        for buffer in [a, b, c] {
            assert_eq!(buffer.contents(), b"fan out");
        }
    }

    #[test]
    fn test_empty_broadcast_accepts_writes() {
        let mut writer = BroadcastWriter::silent(Vec::new());
        assert!(writer.is_empty());
        assert_eq!(writer.write(b"nobody listens").unwrap(), 14);
    }
}
