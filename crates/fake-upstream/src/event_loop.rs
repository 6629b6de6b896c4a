//! Single-threaded event loop.
//!
//! [`EventLoop`] wraps a current-thread tokio runtime plus a channel of posted
//! closures. The fake upstream runs one on its background thread; tests use
//! another for their client side and hand it to bounded waits as the
//! [`PeerLoop`].
//!
//! ```no_run
//! use fake_upstream::{EventLoop, RunType};
//!
//! let mut event_loop = EventLoop::new().unwrap();
//! let handle = event_loop.handle();
//! handle.post(|| println!("runs on the loop thread"));
//! handle.exit();
//! event_loop.run(RunType::Block);
//! ```

use std::future::Future;
use std::io;

use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::sync::PeerLoop;

/// Number of scheduler turns a non-blocking run gives ready tasks and I/O.
const NONBLOCK_ROUNDS: usize = 8;

/// How [`EventLoop::run`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunType {
    /// Run until [`LoopHandle::exit`] is called.
    Block,
    /// Run posted closures, ready tasks and ready I/O, then return.
    NonBlock,
}

enum LoopMessage {
    Task(Box<dyn FnOnce() + Send>),
    Exit,
}

/// Single-threaded reactor with a post queue.
pub struct EventLoop {
    runtime: Runtime,
    sender: UnboundedSender<LoopMessage>,
    receiver: UnboundedReceiver<LoopMessage>,
    exited: bool,
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("exited", &self.exited)
            .finish_non_exhaustive()
    }
}

impl EventLoop {
    /// Create a loop with I/O and timers enabled.
    pub fn new() -> io::Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        Ok(Self {
            runtime,
            sender,
            receiver,
            exited: false,
        })
    }

    /// A cloneable, thread-safe handle for posting work to this loop.
    #[must_use]
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            sender: self.sender.clone(),
            runtime: self.runtime.handle().clone(),
        }
    }

    /// Run the loop.
    ///
    /// Posted closures run in post order, interleaved with spawned tasks and
    /// I/O. After an exit request, `Block` runs return immediately.
    pub fn run(&mut self, run_type: RunType) {
        if self.exited {
            return;
        }
        let Self {
            runtime,
            receiver,
            exited,
            ..
        } = self;
        match run_type {
            RunType::Block => runtime.block_on(async {
                while let Some(message) = receiver.recv().await {
                    match message {
                        LoopMessage::Task(task) => task(),
                        LoopMessage::Exit => break,
                    }
                }
            }),
            RunType::NonBlock => runtime.block_on(async {
                for _ in 0..NONBLOCK_ROUNDS {
                    while let Ok(message) = receiver.try_recv() {
                        match message {
                            LoopMessage::Task(task) => task(),
                            LoopMessage::Exit => {
                                *exited = true;
                                return;
                            }
                        }
                    }
                    tokio::task::yield_now().await;
                }
            }),
        }
        if run_type == RunType::Block {
            *exited = true;
        }
    }

    /// Drive `future` to completion on this loop.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Spawn a task onto this loop. It progresses whenever the loop runs.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime.spawn(future)
    }
}

impl PeerLoop for EventLoop {
    fn run_nonblocking(&mut self) {
        self.run(RunType::NonBlock);
    }
}

/// Thread-safe handle to an [`EventLoop`].
#[derive(Clone)]
pub struct LoopHandle {
    sender: UnboundedSender<LoopMessage>,
    runtime: tokio::runtime::Handle,
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

impl LoopHandle {
    /// Queue `task` to run on the loop thread. Returns false if the loop is
    /// gone.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.sender.send(LoopMessage::Task(Box::new(task))).is_ok()
    }

    /// Ask a blocking run to return once everything posted before has run.
    pub fn exit(&self) {
        let _ = self.sender.send(LoopMessage::Exit);
    }

    /// Spawn a task onto the loop.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime.spawn(future)
    }
}
