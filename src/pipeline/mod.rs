//! Connection pipeline: an ordered chain of stages between the
//! transport and the application.
//!
//! Index 0 is the stage closest to the transport. Inbound traffic
//! (reads, events, errors) travels from index 0 towards the tail;
//! outbound writes travel from the tail towards index 0. Whatever falls
//! off either end is recorded by the pipeline itself: ciphertext ready
//! for the socket on the head side, decrypted application data and
//! negotiation outcomes on the tail side.
//!
//! All pipeline access is single-threaded from the owner's point of
//! view. Code running elsewhere (secret delivery, timers) reaches the
//! pipeline through its [`ConnectionExecutor`], which marshals closures
//! onto the owner's task queue; the owner drains that queue with
//! [`Pipeline::run_scheduled`] or [`Pipeline::await_scheduled`].

mod buffer;

pub use buffer::BufferReads;

use std::collections::VecDeque;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::context::ConnectionMetadata;
use crate::error::Error;
use crate::prelude::{debug, trace, warn};

/// A closure marshaled onto a connection's pipeline.
pub type Task = Box<dyn FnOnce(&mut Pipeline) + Send>;

/// Sends closures to a pipeline from other threads or tasks.
///
/// This is the single synchronization point of the engine: anything that
/// must touch a pipeline from outside its owner goes through here.
#[derive(Clone)]
pub struct ConnectionExecutor {
    tx: mpsc::UnboundedSender<Task>,
}

impl std::fmt::Debug for ConnectionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConnectionExecutor")
    }
}

impl ConnectionExecutor {
    /// Queues `f` to run with exclusive access to the pipeline. Returns
    /// `false` when the pipeline has been dropped.
    pub fn execute<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut Pipeline) + Send + 'static,
    {
        self.tx.send(Box::new(f)).is_ok()
    }
}

/// Out-of-band signals that travel the pipeline inbound, alongside
/// reads.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionEvent {
    /// The transport connection is up; fired by the owner once the
    /// socket is accepted or connected.
    Established,

    /// Secure-channel negotiation finished and the pipeline now carries
    /// application data. Fired exactly once per connection.
    NegotiationComplete,
}

/// One stage in a pipeline.
///
/// Every hook has a pass-through default, so a stage only implements
/// the directions it cares about. Hooks must not block; long-running
/// work belongs on the runtime, coming back via the executor.
pub trait Stage: Send {
    /// Called after the stage is inserted into the pipeline.
    fn on_added(&mut self, ctx: &mut StageContext<'_>) {
        let _ = ctx;
    }

    /// Called after the stage is removed. Forwards issued here are
    /// delivered to the stage that now occupies this position.
    fn on_removed(&mut self, ctx: &mut StageContext<'_>) {
        let _ = ctx;
    }

    /// Inbound data from the transport side.
    fn on_read(&mut self, ctx: &mut StageContext<'_>, data: Bytes) {
        ctx.forward_read(data);
    }

    /// The transport side reached end-of-stream.
    fn on_read_complete(&mut self, ctx: &mut StageContext<'_>) {
        ctx.forward_read_complete();
    }

    /// An out-of-band event travelling inbound.
    fn on_event(&mut self, ctx: &mut StageContext<'_>, event: ConnectionEvent) {
        ctx.forward_event(event);
    }

    /// An error travelling inbound.
    fn on_error(&mut self, ctx: &mut StageContext<'_>, error: Error) {
        ctx.forward_error(error);
    }

    /// Outbound data from the application side.
    fn on_write(&mut self, ctx: &mut StageContext<'_>, data: Bytes) {
        ctx.forward_write(data);
    }
}

impl Stage for Box<dyn Stage> {
    fn on_added(&mut self, ctx: &mut StageContext<'_>) {
        (**self).on_added(ctx);
    }

    fn on_removed(&mut self, ctx: &mut StageContext<'_>) {
        (**self).on_removed(ctx);
    }

    fn on_read(&mut self, ctx: &mut StageContext<'_>, data: Bytes) {
        (**self).on_read(ctx, data);
    }

    fn on_read_complete(&mut self, ctx: &mut StageContext<'_>) {
        (**self).on_read_complete(ctx);
    }

    fn on_event(&mut self, ctx: &mut StageContext<'_>, event: ConnectionEvent) {
        (**self).on_event(ctx, event);
    }

    fn on_error(&mut self, ctx: &mut StageContext<'_>, error: Error) {
        (**self).on_error(ctx, error);
    }

    fn on_write(&mut self, ctx: &mut StageContext<'_>, data: Bytes) {
        (**self).on_write(ctx, data);
    }
}

struct Entry {
    name: String,
    // Taken out for the duration of a hook call, restored after.
    stage: Option<Box<dyn Stage>>,
}

enum Op {
    Read { dest: usize, data: Bytes },
    ReadComplete { dest: usize },
    Event { dest: usize, event: ConnectionEvent },
    Error { dest: usize, error: Error },
    // `below: None` means entering from the application side.
    Write { below: Option<usize>, data: Bytes },
    AddLast { name: String, stage: Box<dyn Stage> },
    InsertBefore { anchor: String, name: String, stage: Box<dyn Stage> },
    InsertAfter { anchor: String, name: String, stage: Box<dyn Stage> },
    Replace { name: String, new_name: String, stage: Box<dyn Stage> },
    Remove { name: String },
}

/// The per-connection stage chain and its surrounding bookkeeping.
pub struct Pipeline {
    entries: Vec<Entry>,
    ops: VecDeque<Op>,
    pumping: bool,
    metadata: ConnectionMetadata,
    tasks_tx: mpsc::UnboundedSender<Task>,
    tasks_rx: mpsc::UnboundedReceiver<Task>,
    outbound: Vec<Bytes>,
    inbound: Vec<Bytes>,
    inbound_complete: bool,
    negotiation_done: bool,
    events: Vec<ConnectionEvent>,
    failed: Option<Error>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stage_names())
            .field("negotiation_done", &self.negotiation_done)
            .field("failed", &self.failed)
            .finish()
    }
}

impl Pipeline {
    /// An empty pipeline for one connection.
    pub fn new(metadata: ConnectionMetadata) -> Self {
        let (tasks_tx, tasks_rx) = mpsc::unbounded_channel();
        Self {
            entries: Vec::new(),
            ops: VecDeque::new(),
            pumping: false,
            metadata,
            tasks_tx,
            tasks_rx,
            outbound: Vec::new(),
            inbound: Vec::new(),
            inbound_complete: false,
            negotiation_done: false,
            events: Vec::new(),
            failed: None,
        }
    }

    /// The executor that marshals work onto this pipeline.
    pub fn executor(&self) -> ConnectionExecutor {
        ConnectionExecutor {
            tx: self.tasks_tx.clone(),
        }
    }

    /// Connection metadata as seen by every stage.
    pub fn metadata(&self) -> &ConnectionMetadata {
        &self.metadata
    }

    /// Names of the current stages, transport side first.
    pub fn stage_names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    // ---- transport/application entry points -------------------------

    /// Feeds bytes read from the transport into the head of the chain.
    pub fn fire_read(&mut self, data: Bytes) {
        self.ops.push_back(Op::Read { dest: 0, data });
        self.pump();
    }

    /// Signals transport end-of-stream.
    pub fn fire_read_complete(&mut self) {
        self.ops.push_back(Op::ReadComplete { dest: 0 });
        self.pump();
    }

    /// Injects an event at the head of the chain.
    pub fn fire_event(&mut self, event: ConnectionEvent) {
        self.ops.push_back(Op::Event { dest: 0, event });
        self.pump();
    }

    /// Injects an error at the head of the chain.
    pub fn fire_error(&mut self, error: Error) {
        self.ops.push_back(Op::Error { dest: 0, error });
        self.pump();
    }

    /// Writes application data into the tail of the chain.
    pub fn write(&mut self, data: Bytes) {
        self.ops.push_back(Op::Write { below: None, data });
        self.pump();
    }

    // ---- chain mutation ---------------------------------------------

    /// Appends a stage at the application end of the chain.
    pub fn add_last(&mut self, name: &str, stage: impl Stage + 'static) {
        self.ops.push_back(Op::AddLast {
            name: name.to_string(),
            stage: Box::new(stage),
        });
        self.pump();
    }

    /// Inserts a stage just below (transport side of) `anchor`.
    pub fn insert_before(&mut self, anchor: &str, name: &str, stage: impl Stage + 'static) {
        self.ops.push_back(Op::InsertBefore {
            anchor: anchor.to_string(),
            name: name.to_string(),
            stage: Box::new(stage),
        });
        self.pump();
    }

    /// Inserts a stage just above (application side of) `anchor`.
    pub fn insert_after(&mut self, anchor: &str, name: &str, stage: impl Stage + 'static) {
        self.ops.push_back(Op::InsertAfter {
            anchor: anchor.to_string(),
            name: name.to_string(),
            stage: Box::new(stage),
        });
        self.pump();
    }

    /// Replaces the stage named `name` in place.
    pub fn replace(&mut self, name: &str, new_name: &str, stage: impl Stage + 'static) {
        self.ops.push_back(Op::Replace {
            name: name.to_string(),
            new_name: new_name.to_string(),
            stage: Box::new(stage),
        });
        self.pump();
    }

    /// Removes the stage named `name`, running its removal hook.
    pub fn remove(&mut self, name: &str) {
        self.ops.push_back(Op::Remove {
            name: name.to_string(),
        });
        self.pump();
    }

    // ---- task queue -------------------------------------------------

    /// Runs every task currently queued on the executor, including any
    /// they queue in turn. Returns the number of tasks run.
    pub fn run_scheduled(&mut self) -> usize {
        let mut count = 0;
        loop {
            let mut batch = Vec::new();
            while let Ok(task) = self.tasks_rx.try_recv() {
                batch.push(task);
            }
            if batch.is_empty() {
                return count;
            }
            count += batch.len();
            for task in batch {
                task(self);
            }
        }
    }

    /// Waits for at least one task, then drains the queue. Returns the
    /// number of tasks run.
    pub async fn await_scheduled(&mut self) -> usize {
        match self.tasks_rx.recv().await {
            Some(task) => {
                task(self);
                1 + self.run_scheduled()
            }
            None => 0,
        }
    }

    // ---- boundary observation ---------------------------------------

    /// Takes the bytes that reached the transport side, ready for the
    /// socket.
    pub fn take_outbound(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.outbound)
    }

    /// Takes the data that traversed the whole chain inbound.
    pub fn take_inbound(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.inbound)
    }

    /// Takes the events that reached the application side.
    pub fn take_events(&mut self) -> Vec<ConnectionEvent> {
        std::mem::take(&mut self.events)
    }

    /// True once [`ConnectionEvent::NegotiationComplete`] reached the
    /// application side.
    pub fn negotiation_complete(&self) -> bool {
        self.negotiation_done
    }

    /// True once transport end-of-stream traversed the chain.
    pub fn inbound_complete(&self) -> bool {
        self.inbound_complete
    }

    /// The first error that reached the application side, if any. The
    /// pipeline stops carrying data once this is set.
    pub fn error(&self) -> Option<&Error> {
        self.failed.as_ref()
    }

    // ---- dispatch ---------------------------------------------------

    fn pump(&mut self) {
        if self.pumping {
            return;
        }
        self.pumping = true;
        while let Some(op) = self.ops.pop_front() {
            self.process(op);
        }
        self.pumping = false;
    }

    fn process(&mut self, op: Op) {
        match op {
            Op::Read { dest, data } => {
                if self.failed.is_some() {
                    trace!("dropping {} inbound byte(s), pipeline failed", data.len());
                } else if dest < self.entries.len() {
                    self.call(dest, |stage, ctx| stage.on_read(ctx, data));
                } else {
                    self.inbound.push(data);
                }
            }
            Op::ReadComplete { dest } => {
                if self.failed.is_some() {
                    trace!("dropping read-complete, pipeline failed");
                } else if dest < self.entries.len() {
                    self.call(dest, |stage, ctx| stage.on_read_complete(ctx));
                } else {
                    self.inbound_complete = true;
                }
            }
            Op::Event { dest, event } => {
                if self.failed.is_some() {
                    trace!("dropping event {event:?}, pipeline failed");
                } else if dest < self.entries.len() {
                    self.call(dest, |stage, ctx| stage.on_event(ctx, event));
                } else {
                    self.record_event(event);
                }
            }
            Op::Error { dest, error } => {
                if dest < self.entries.len() {
                    self.call(dest, |stage, ctx| stage.on_error(ctx, error));
                } else if self.failed.is_none() {
                    self.failed = Some(error);
                } else {
                    debug!("suppressing subsequent pipeline error: {error}");
                }
            }
            Op::Write { below, data } => {
                if self.failed.is_some() {
                    trace!("dropping {} outbound byte(s), pipeline failed", data.len());
                    return;
                }
                let below = below.unwrap_or(self.entries.len());
                if below == 0 {
                    self.outbound.push(data);
                } else {
                    self.call(below - 1, |stage, ctx| stage.on_write(ctx, data));
                }
            }
            Op::AddLast { name, stage } => {
                let index = self.entries.len();
                self.insert_entry(index, name, stage);
            }
            Op::InsertBefore {
                anchor,
                name,
                stage,
            } => match self.position(&anchor) {
                Some(index) => self.insert_entry(index, name, stage),
                None => {
                    warn!("insert_before: no stage named {anchor:?}");
                }
            },
            Op::InsertAfter {
                anchor,
                name,
                stage,
            } => match self.position(&anchor) {
                Some(index) => self.insert_entry(index + 1, name, stage),
                None => {
                    warn!("insert_after: no stage named {anchor:?}");
                }
            },
            Op::Replace {
                name,
                new_name,
                stage,
            } => {
                let Some(index) = self.position(&name) else {
                    warn!("replace: no stage named {name:?}");
                    return;
                };
                if new_name != name && self.position(&new_name).is_some() {
                    warn!("replace: stage name {new_name:?} already in use");
                    return;
                }
                let old = std::mem::replace(
                    &mut self.entries[index],
                    Entry {
                        name: new_name,
                        stage: Some(stage),
                    },
                );
                if let Some(mut old_stage) = old.stage {
                    let mut ctx = StageContext {
                        pipeline: self,
                        index,
                        name: old.name,
                        removed: true,
                    };
                    old_stage.on_removed(&mut ctx);
                }
                self.call(index, |stage, ctx| stage.on_added(ctx));
            }
            Op::Remove { name } => {
                let Some(index) = self.position(&name) else {
                    warn!("remove: no stage named {name:?}");
                    return;
                };
                let entry = self.entries.remove(index);
                if let Some(mut stage) = entry.stage {
                    let mut ctx = StageContext {
                        pipeline: self,
                        index,
                        name: entry.name,
                        removed: true,
                    };
                    stage.on_removed(&mut ctx);
                }
            }
        }
    }

    fn record_event(&mut self, event: ConnectionEvent) {
        if event == ConnectionEvent::NegotiationComplete {
            if self.negotiation_done {
                warn!("negotiation completion signalled more than once");
                return;
            }
            self.negotiation_done = true;
        }
        self.events.push(event);
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name == name)
    }

    fn insert_entry(&mut self, index: usize, name: String, stage: Box<dyn Stage>) {
        if self.position(&name).is_some() {
            warn!("stage name {name:?} already in use, dropping stage");
            return;
        }
        self.entries.insert(
            index,
            Entry {
                name,
                stage: Some(stage),
            },
        );
        self.call(index, |stage, ctx| stage.on_added(ctx));
    }

    // Takes the stage out of its entry for the duration of the hook so
    // the context can borrow the pipeline mutably.
    fn call<F>(&mut self, index: usize, hook: F)
    where
        F: FnOnce(&mut Box<dyn Stage>, &mut StageContext<'_>),
    {
        let Some(mut stage) = self.entries[index].stage.take() else {
            warn!("stage at index {index} is mid-dispatch, dropping operation");
            return;
        };
        let name = self.entries[index].name.clone();
        let mut ctx = StageContext {
            pipeline: self,
            index,
            name,
            removed: false,
        };
        hook(&mut stage, &mut ctx);
        self.entries[index].stage = Some(stage);
    }
}

/// A stage's view of its pipeline during a hook call.
///
/// Forwards and mutations requested here are queued and applied in
/// order once the current hook returns.
pub struct StageContext<'a> {
    pipeline: &'a mut Pipeline,
    index: usize,
    name: String,
    removed: bool,
}

impl std::fmt::Debug for StageContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("name", &self.name)
            .field("index", &self.index)
            .finish()
    }
}

impl StageContext<'_> {
    /// The name this stage was registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connection metadata.
    pub fn metadata(&self) -> &ConnectionMetadata {
        self.pipeline.metadata()
    }

    /// The executor of the owning pipeline.
    pub fn executor(&self) -> ConnectionExecutor {
        self.pipeline.executor()
    }

    fn inbound_dest(&self) -> usize {
        if self.removed {
            self.index
        } else {
            self.index + 1
        }
    }

    /// Passes inbound data to the next stage towards the application.
    pub fn forward_read(&mut self, data: Bytes) {
        let dest = self.inbound_dest();
        self.pipeline.ops.push_back(Op::Read { dest, data });
    }

    /// Passes end-of-stream towards the application.
    pub fn forward_read_complete(&mut self) {
        let dest = self.inbound_dest();
        self.pipeline.ops.push_back(Op::ReadComplete { dest });
    }

    /// Passes an event towards the application.
    pub fn forward_event(&mut self, event: ConnectionEvent) {
        let dest = self.inbound_dest();
        self.pipeline.ops.push_back(Op::Event { dest, event });
    }

    /// Passes an error towards the application.
    pub fn forward_error(&mut self, error: Error) {
        let dest = self.inbound_dest();
        self.pipeline.ops.push_back(Op::Error { dest, error });
    }

    /// Passes outbound data to the next stage towards the transport.
    pub fn forward_write(&mut self, data: Bytes) {
        self.pipeline.ops.push_back(Op::Write {
            below: Some(self.index),
            data,
        });
    }

    /// Queues insertion of a stage just below this one.
    pub fn insert_before_self(&mut self, name: &str, stage: impl Stage + 'static) {
        self.pipeline.ops.push_back(Op::InsertBefore {
            anchor: self.name.clone(),
            name: name.to_string(),
            stage: Box::new(stage),
        });
    }

    /// Queues replacement of this stage.
    pub fn replace_self(&mut self, new_name: &str, stage: impl Stage + 'static) {
        self.pipeline.ops.push_back(Op::Replace {
            name: self.name.clone(),
            new_name: new_name.to_string(),
            stage: Box::new(stage),
        });
    }

    /// Queues removal of this stage.
    pub fn remove_self(&mut self) {
        self.remove(&self.name.clone());
    }

    /// Queues removal of the named stage.
    pub fn remove(&mut self, name: &str) {
        self.pipeline.ops.push_back(Op::Remove {
            name: name.to_string(),
        });
    }
}
