//! Length-Prefixed Object Channel
//!
//! A bidirectional, framed byte stream between the orchestrator and one worker.
//! Both ends are created together with [`Channel::pair`]; each process keeps one.
//!
//! Frame format:
//! ```text
//! +----------------+------------------+
//! | length (4 BE)  | rkyv payload     |
//! +----------------+------------------+
//! ```
//!
//! Reads are buffered: a frame that arrives in pieces stays in the buffer until
//! the rest of it shows up, so callers only ever see whole messages.

use rkyv::ser::serializers::AllocSerializer;
use rkyv::validation::validators::DefaultValidator;
use rkyv::{AlignedVec, Archive, CheckBytes, Deserialize, Infallible, Serialize};
use std::io::{ErrorKind, Read, Write};
use std::marker::PhantomData;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use thiserror::Error;

/// Maximum frame size (16 MB) to prevent memory exhaustion
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Size of a single socket read
const READ_CHUNK: usize = 4096;

const HEADER_LEN: usize = 4;

/// Errors that can occur while sending or receiving frames
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Frame too large: {size} bytes (max {max} bytes)")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Stream ended inside a frame ({buffered} bytes buffered)")]
    TruncatedFrame { buffered: usize },

    #[error("Channel is closed")]
    Closed,
}

/// Outcome of a single receive attempt
#[derive(Debug)]
pub enum Recv<T> {
    /// A complete message was decoded
    Message(T),
    /// Non-blocking mode only: no complete frame is buffered right now
    WouldBlock,
    /// The peer closed the stream on a frame boundary
    Closed,
}

/// Serialize a message into a complete frame (header + payload).
pub fn encode_frame<T>(message: &T) -> Result<Vec<u8>, ChannelError>
where
    T: Serialize<AllocSerializer<256>>,
{
    let bytes = rkyv::to_bytes::<_, 256>(message)
        .map_err(|e| ChannelError::Serialization(e.to_string()))?;

    let len = bytes.len();
    if len > MAX_FRAME_SIZE {
        return Err(ChannelError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + len);
    frame.extend_from_slice(&(len as u32).to_be_bytes());
    frame.extend_from_slice(&bytes);
    Ok(frame)
}

/// Try to split one complete frame off the front of `buffer`.
///
/// Returns `Ok(None)` when the buffer holds less than a full frame; the bytes
/// are left in place for the next attempt.
pub fn decode_frame<T>(buffer: &mut Vec<u8>) -> Result<Option<T>, ChannelError>
where
    T: Archive,
    T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + Deserialize<T, Infallible>,
{
    if buffer.len() < HEADER_LEN {
        return Ok(None);
    }

    let mut len_buf = [0u8; HEADER_LEN];
    len_buf.copy_from_slice(&buffer[..HEADER_LEN]);
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(ChannelError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    if len == 0 {
        return Err(ChannelError::InvalidFrame("zero-length frame".to_string()));
    }
    if buffer.len() < HEADER_LEN + len {
        return Ok(None);
    }

    // rkyv needs an aligned buffer; the payload sits at an arbitrary offset
    let mut payload = AlignedVec::with_capacity(len);
    payload.extend_from_slice(&buffer[HEADER_LEN..HEADER_LEN + len]);
    buffer.drain(..HEADER_LEN + len);

    let archived = rkyv::check_archived_root::<T>(&payload)
        .map_err(|e| ChannelError::Deserialization(e.to_string()))?;
    let value: T = archived
        .deserialize(&mut Infallible)
        .map_err(|e| ChannelError::Deserialization(format!("{:?}", e)))?;

    Ok(Some(value))
}

/// One endpoint of a framed, bidirectional object stream.
#[derive(Debug)]
pub struct Channel {
    stream: Option<UnixStream>,
    buffer: Vec<u8>,
    nonblocking: bool,
    eof: bool,
}

impl Channel {
    /// Create two connected endpoints.
    pub fn pair() -> Result<(Channel, Channel), ChannelError> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::from_stream(a), Self::from_stream(b)))
    }

    /// Wrap an already-connected stream (blocking mode).
    pub fn from_stream(stream: UnixStream) -> Self {
        Self {
            stream: Some(stream),
            buffer: Vec::new(),
            nonblocking: false,
            eof: false,
        }
    }

    /// Adopt an inherited descriptor.
    ///
    /// # Safety
    /// `fd` must be an open stream socket owned by nobody else in this process.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self::from_stream(UnixStream::from_raw_fd(fd))
    }

    /// Descriptor for readiness polling, `None` once closed.
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|s| s.as_raw_fd())
    }

    /// Take the underlying stream out, leaving the channel closed.
    pub fn into_stream(mut self) -> Option<UnixStream> {
        self.stream.take()
    }

    /// Whether reads currently return instead of waiting.
    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Bytes of an incomplete frame waiting for the rest of their data.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Switch the endpoint's mode persistently.
    pub fn set_nonblocking(&mut self, nonblocking: bool) -> Result<(), ChannelError> {
        let stream = self.stream.as_ref().ok_or(ChannelError::Closed)?;
        if self.nonblocking != nonblocking {
            stream.set_nonblocking(nonblocking)?;
            self.nonblocking = nonblocking;
        }
        Ok(())
    }

    /// Run `f` in non-blocking mode, restoring the previous mode afterwards.
    pub fn nonblocking<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> Result<R, ChannelError> {
        self.with_mode(true, f)
    }

    /// Run `f` in blocking mode, restoring the previous mode afterwards.
    pub fn blocking<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> Result<R, ChannelError> {
        self.with_mode(false, f)
    }

    fn with_mode<R>(
        &mut self,
        nonblocking: bool,
        f: impl FnOnce(&mut Self) -> R,
    ) -> Result<R, ChannelError> {
        let previous = self.nonblocking;
        self.set_nonblocking(nonblocking)?;

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(&mut *self)));

        // `f` may have closed the channel; nothing to restore then
        let restored = if self.stream.is_some() {
            self.set_nonblocking(previous)
        } else {
            Ok(())
        };

        match outcome {
            Ok(value) => restored.map(|()| value),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Serialize and write one message as a single contiguous frame.
    pub fn send<T>(&mut self, message: &T) -> Result<(), ChannelError>
    where
        T: Serialize<AllocSerializer<256>>,
    {
        let frame = encode_frame(message)?;
        if self.nonblocking {
            self.blocking(|channel| channel.write_frame(&frame))?
        } else {
            self.write_frame(&frame)
        }
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<(), ChannelError> {
        let stream = self.stream.as_mut().ok_or(ChannelError::Closed)?;
        stream.write_all(frame)?;
        stream.flush()?;
        Ok(())
    }

    /// Receive the next message according to the current mode.
    ///
    /// Already-buffered frames are always returned first. In non-blocking mode
    /// this never waits: with no complete frame available it yields
    /// [`Recv::WouldBlock`].
    pub fn recv<T>(&mut self) -> Result<Recv<T>, ChannelError>
    where
        T: Archive,
        T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + Deserialize<T, Infallible>,
    {
        loop {
            if let Some(message) = decode_frame(&mut self.buffer)? {
                return Ok(Recv::Message(message));
            }

            if self.eof {
                if self.buffer.is_empty() {
                    return Ok(Recv::Closed);
                }
                return Err(ChannelError::TruncatedFrame {
                    buffered: self.buffer.len(),
                });
            }

            let stream = self.stream.as_mut().ok_or(ChannelError::Closed)?;
            let mut chunk = [0u8; READ_CHUNK];
            match stream.read(&mut chunk) {
                Ok(0) => self.eof = true,
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(Recv::WouldBlock),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(ChannelError::Io(e)),
            }
        }
    }

    /// Blocking convenience: the next message, or `None` on clean end-of-stream.
    pub fn next_message<T>(&mut self) -> Result<Option<T>, ChannelError>
    where
        T: Archive,
        T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + Deserialize<T, Infallible>,
    {
        self.blocking(|channel| match channel.recv()? {
            Recv::Message(message) => Ok(Some(message)),
            Recv::Closed => Ok(None),
            Recv::WouldBlock => Err(ChannelError::Io(ErrorKind::WouldBlock.into())),
        })?
    }

    /// Lazy sequence of messages in the current mode.
    ///
    /// The iterator ends on would-block or end-of-stream; calling `messages`
    /// again picks up where it stopped. Use [`Channel::at_eof`] to tell the two
    /// endings apart.
    pub fn messages<T>(&mut self) -> Messages<'_, T> {
        Messages {
            channel: self,
            done: false,
            _marker: PhantomData,
        }
    }

    /// Whether the peer has closed its end and nothing complete remains.
    pub fn at_eof(&self) -> bool {
        self.eof && self.buffer.is_empty()
    }

    /// Release the socket. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

impl AsRawFd for Channel {
    fn as_raw_fd(&self) -> RawFd {
        self.raw_fd().unwrap_or(-1)
    }
}

/// Iterator returned by [`Channel::messages`]
pub struct Messages<'a, T> {
    channel: &'a mut Channel,
    done: bool,
    _marker: PhantomData<T>,
}

impl<T> Iterator for Messages<'_, T>
where
    T: Archive,
    T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + Deserialize<T, Infallible>,
{
    type Item = Result<T, ChannelError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.channel.recv() {
            Ok(Recv::Message(message)) => Some(Ok(message)),
            Ok(Recv::WouldBlock) | Ok(Recv::Closed) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
