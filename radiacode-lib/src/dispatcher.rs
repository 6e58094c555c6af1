//! One-command-at-a-time request/response exchange over a `Transport`.

use crate::command::Command;
use crate::constants::{FRAME_OVERHEAD, SEQ_MODULUS, SEQ_REQUEST_FLAG};
use crate::error::{Error, FrameError};
use crate::frame::{Decoded, Frame, FrameBuffer};
use crate::transport::Transport;
use bytes::Bytes;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

pub struct Dispatcher<T: Transport> {
    transport: T,
    buffer: FrameBuffer,
    sequence: u8,
    consecutive_timeouts: u32,
    degrade_threshold: u32,
    degraded: bool,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(transport: T, degrade_threshold: u32) -> Self {
        let max_frame_len = transport.max_frame_len();
        Self {
            transport,
            buffer: FrameBuffer::new(max_frame_len),
            sequence: 0,
            consecutive_timeouts: 0,
            degrade_threshold: degrade_threshold.max(1),
            degraded: false,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub async fn close(&mut self) -> Result<(), Error> {
        self.buffer.clear();
        self.transport.close().await
    }

    fn next_seq(&mut self) -> u8 {
        let seq = SEQ_REQUEST_FLAG | (self.sequence % SEQ_MODULUS);
        self.sequence = (self.sequence + 1) % SEQ_MODULUS;
        seq
    }

    /// Send `command` and wait up to `timeout` for the frame echoing its header.
    ///
    /// Returns the reply payload. No retries: a timeout is reported to the
    /// caller, and enough of them in a row degrade the dispatcher until the
    /// session is rebuilt.
    pub async fn execute(&mut self, command: &Command, timeout: Duration) -> Result<Bytes, Error> {
        if self.degraded {
            return Err(Error::ReconnectRequired);
        }

        let max_frame_len = self.transport.max_frame_len();
        let wire_len = FRAME_OVERHEAD + command.payload().len();
        if wire_len > max_frame_len {
            return Err(Error::Validation(format!(
                "{} request of {wire_len} bytes exceeds the {max_frame_len}-byte frame limit",
                command.opcode()
            )));
        }

        let request = Frame::request(command, self.next_seq());
        trace!(opcode = %request.opcode(), seq = request.seq(), len = request.payload.len(), "Sending command");
        if let Err(e) = self.transport.write(&request.encode()).await {
            return Err(self.channel_failed(e));
        }

        let deadline = Instant::now() + timeout;
        let mut discarded: Option<FrameError> = None;
        loop {
            loop {
                match self.buffer.next_frame() {
                    Decoded::Frame(reply) if reply.header == request.header => {
                        self.consecutive_timeouts = 0;
                        return Ok(reply.payload);
                    }
                    Decoded::Frame(stale) => {
                        debug!(opcode = %stale.opcode(), seq = stale.seq(), "Discarding stale frame");
                    }
                    Decoded::Invalid(e) => {
                        debug!(error = %e, "Discarding invalid input");
                        discarded = Some(e);
                    }
                    Decoded::Incomplete => break,
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(self.timed_out(command, timeout, discarded));
            }
            match self.transport.read(self.transport.max_packet_len(), deadline - now).await {
                Ok(chunk) => self.buffer.extend(&chunk),
                Err(e) => return Err(self.channel_failed(e)),
            }
        }
    }

    fn timed_out(&mut self, command: &Command, after: Duration, discarded: Option<FrameError>) -> Error {
        if !self.buffer.is_empty() {
            debug!(dropped = self.buffer.len(), "Dropping partial response");
            self.buffer.clear();
        }
        self.consecutive_timeouts += 1;
        warn!(
            opcode = %command.opcode(),
            consecutive = self.consecutive_timeouts,
            "Command timed out"
        );
        if self.consecutive_timeouts >= self.degrade_threshold {
            warn!("Too many consecutive timeouts, session degraded");
            self.degraded = true;
        }
        Error::Timeout {
            opcode: command.opcode(),
            after,
            state_unknown: command.is_mutating(),
            discarded,
        }
    }

    fn channel_failed(&mut self, error: Error) -> Error {
        warn!(error = %error, "Transport failure, session degraded");
        self.buffer.clear();
        self.degraded = true;
        error
    }
}
