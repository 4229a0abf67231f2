use bytes::{Buf, BytesMut};

use crate::callback::{DuplicateIO, IOCallbackResult, IOCallbacks, RetryReason};

/// A transport handle together with the retry state of its last operation.
pub(crate) struct Bio<IO> {
    io: IO,
    retry: Option<RetryReason>,
}

impl<IO: IOCallbacks> Bio<IO> {
    pub(crate) fn new(io: IO) -> Self {
        Self { io, retry: None }
    }

    pub(crate) fn recv(&mut self, buf: &mut [u8]) -> IOCallbackResult<usize> {
        let res = self.io.recv(buf);
        self.retry = match res {
            IOCallbackResult::WouldBlock => {
                Some(self.io.retry_reason().unwrap_or(RetryReason::Read))
            }
            _ => None,
        };
        res
    }

    pub(crate) fn send(&mut self, buf: &[u8]) -> IOCallbackResult<usize> {
        let res = self.io.send(buf);
        self.retry = match res {
            IOCallbackResult::WouldBlock => {
                Some(self.io.retry_reason().unwrap_or(RetryReason::Write))
            }
            _ => None,
        };
        res
    }

    /// Why the last operation asked to be retried, if it did
    pub(crate) fn retry(&self) -> Option<RetryReason> {
        self.retry
    }

    pub(crate) fn set_retry(&mut self, reason: Option<RetryReason>) {
        self.retry = reason;
    }

    pub(crate) fn get_ref(&self) -> &IO {
        &self.io
    }

    pub(crate) fn get_mut(&mut self) -> &mut IO {
        &mut self.io
    }
}

impl<IO: DuplicateIO> Bio<IO> {
    fn dup_state(&self) -> std::io::Result<Self> {
        Ok(Self {
            io: self.io.duplicate()?,
            retry: self.retry,
        })
    }
}

/// The write side either shares the read handle or owns its own.
pub(crate) enum WriteBio<IO> {
    SameAsRead,
    Own(Bio<IO>),
}

/// What the protocol methods see of a connection's transport.
pub(crate) trait RecordIo {
    /// Reads from the read handle
    fn read(&mut self, buf: &mut [u8]) -> IOCallbackResult<usize>;
    /// Writes to the write chain, which accepts everything while the
    /// buffering layer is pushed
    fn write(&mut self, buf: &[u8]) -> IOCallbackResult<usize>;
    /// Pushes buffered bytes down to the write handle
    fn flush(&mut self) -> IOCallbackResult<()>;
    /// Pushes the buffering layer on top of the write handle
    fn push_buffer(&mut self);
    /// Pops the buffering layer, which must have been flushed
    fn pop_buffer(&mut self);
    /// Marks the read handle as wanting to be retried for reading without
    /// performing I/O
    fn set_read_retry(&mut self);
}

/// Read and write handles of a connection.
pub(crate) struct Bios<IO> {
    rbio: Bio<IO>,
    wbio: WriteBio<IO>,
    buffer: Option<BytesMut>,
}

impl<IO: IOCallbacks> Bios<IO> {
    pub(crate) fn new(read: IO, write: Option<IO>) -> Self {
        Self {
            rbio: Bio::new(read),
            wbio: write.map_or(WriteBio::SameAsRead, |w| WriteBio::Own(Bio::new(w))),
            buffer: None,
        }
    }

    pub(crate) fn rbio(&self) -> &Bio<IO> {
        &self.rbio
    }

    pub(crate) fn rbio_mut(&mut self) -> &mut Bio<IO> {
        &mut self.rbio
    }

    pub(crate) fn wbio(&self) -> &Bio<IO> {
        match &self.wbio {
            WriteBio::SameAsRead => &self.rbio,
            WriteBio::Own(bio) => bio,
        }
    }

    pub(crate) fn wbio_mut(&mut self) -> &mut Bio<IO> {
        match &mut self.wbio {
            WriteBio::SameAsRead => &mut self.rbio,
            WriteBio::Own(bio) => bio,
        }
    }

    pub(crate) fn is_shared(&self) -> bool {
        matches!(self.wbio, WriteBio::SameAsRead)
    }

    pub(crate) fn is_buffered(&self) -> bool {
        self.buffer.is_some()
    }
}

impl<IO: DuplicateIO> Bios<IO> {
    /// Duplicates the handles; a shared handle stays shared in the copy.
    /// The buffering layer is not carried over.
    pub(crate) fn duplicate(&self) -> std::io::Result<Self> {
        let rbio = self.rbio.dup_state()?;
        let wbio = match &self.wbio {
            WriteBio::SameAsRead => WriteBio::SameAsRead,
            WriteBio::Own(bio) => WriteBio::Own(bio.dup_state()?),
        };
        Ok(Self {
            rbio,
            wbio,
            buffer: None,
        })
    }
}

impl<IO: IOCallbacks> RecordIo for Bios<IO> {
    fn read(&mut self, buf: &mut [u8]) -> IOCallbackResult<usize> {
        self.rbio.recv(buf)
    }

    fn write(&mut self, buf: &[u8]) -> IOCallbackResult<usize> {
        match &mut self.buffer {
            Some(pending) => {
                pending.extend_from_slice(buf);
                IOCallbackResult::Ok(buf.len())
            }
            None => self.wbio_mut().send(buf),
        }
    }

    fn flush(&mut self) -> IOCallbackResult<()> {
        let Some(mut pending) = self.buffer.take() else {
            return IOCallbackResult::Ok(());
        };

        let res = loop {
            if pending.is_empty() {
                break IOCallbackResult::Ok(());
            }
            match self.wbio_mut().send(&pending) {
                IOCallbackResult::Ok(0) => {
                    break IOCallbackResult::Err(std::io::ErrorKind::WriteZero.into())
                }
                IOCallbackResult::Ok(n) => pending.advance(n),
                IOCallbackResult::WouldBlock => break IOCallbackResult::WouldBlock,
                IOCallbackResult::Err(e) => break IOCallbackResult::Err(e),
            }
        };

        self.buffer = Some(pending);
        res
    }

    fn push_buffer(&mut self) {
        if self.buffer.is_none() {
            self.buffer = Some(BytesMut::new());
        }
    }

    fn pop_buffer(&mut self) {
        match &self.buffer {
            Some(pending) if !pending.is_empty() => {
                log::warn!("Popping write buffer with {} unflushed bytes", pending.len());
                debug_assert!(false, "write buffer popped before flush");
            }
            _ => self.buffer = None,
        }
    }

    fn set_read_retry(&mut self) {
        self.rbio.set_retry(Some(RetryReason::Read));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::TcpIOCallbacks;
    use test_case::test_case;

    struct Stalled(Option<RetryReason>);

    impl IOCallbacks for Stalled {
        fn recv(&mut self, _buf: &mut [u8]) -> IOCallbackResult<usize> {
            IOCallbackResult::WouldBlock
        }

        fn send(&mut self, _buf: &[u8]) -> IOCallbackResult<usize> {
            IOCallbackResult::WouldBlock
        }

        fn retry_reason(&self) -> Option<RetryReason> {
            self.0
        }
    }

    #[test_case(None => Some(RetryReason::Read))]
    #[test_case(Some(RetryReason::Connect) => Some(RetryReason::Connect))]
    #[test_case(Some(RetryReason::Accept) => Some(RetryReason::Accept))]
    fn recv_records_retry_reason(reason: Option<RetryReason>) -> Option<RetryReason> {
        let mut bio = Bio::new(Stalled(reason));
        let _ = bio.recv(&mut [0u8; 4]);
        bio.retry()
    }

    #[test]
    fn send_defaults_to_write_retry() {
        let mut bio = Bio::new(Stalled(None));
        let _ = bio.send(b"abc");
        assert_eq!(bio.retry(), Some(RetryReason::Write));
    }

    #[test]
    fn buffered_writes_are_held_until_flush() {
        let (left, right) = TcpIOCallbacks::pair();
        let mut bios = Bios::new(left, None);
        bios.push_buffer();

        assert!(matches!(bios.write(b"hello"), IOCallbackResult::Ok(5)));
        assert!(right.pending_input().is_empty());

        assert!(matches!(bios.flush(), IOCallbackResult::Ok(())));
        assert_eq!(&right.pending_input()[..], b"hello");

        bios.pop_buffer();
        assert!(!bios.is_buffered());
    }

    #[test]
    fn duplicate_keeps_sharing() {
        let (left, _right) = TcpIOCallbacks::pair();
        let bios = Bios::new(left, None);
        let copy = bios.duplicate().unwrap();
        assert!(copy.is_shared());
        assert!(!copy.is_buffered());
    }
}
