//! Holds inbound data while negotiation decides what the pipeline
//! should look like.

use bytes::Bytes;

use crate::pipeline::{Stage, StageContext};
use crate::prelude::debug;

/// A stage that buffers everything read from the transport.
///
/// Negotiation handlers install this below themselves before waiting
/// for secret delivery, so bytes that arrive early (a client's first
/// frames, a server's ClientHello) are not seen by stages that do not
/// exist yet. Removing the stage replays the buffered reads, in arrival
/// order, into whatever stage sits at its position by then.
///
/// Events, errors and writes pass through unbuffered.
#[derive(Debug, Default)]
pub struct BufferReads {
    reads: Vec<Bytes>,
    read_complete: bool,
}

impl BufferReads {
    /// An empty buffer.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Stage for BufferReads {
    fn on_read(&mut self, _ctx: &mut StageContext<'_>, data: Bytes) {
        self.reads.push(data);
    }

    fn on_read_complete(&mut self, _ctx: &mut StageContext<'_>) {
        self.read_complete = true;
    }

    fn on_removed(&mut self, ctx: &mut StageContext<'_>) {
        if !self.reads.is_empty() {
            debug!("replaying {} buffered read(s)", self.reads.len());
        }
        for data in self.reads.drain(..) {
            ctx.forward_read(data);
        }
        if self.read_complete {
            ctx.forward_read_complete();
        }
    }
}
