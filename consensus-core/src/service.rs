//! Consensus service
//!
//! Owns the [`ConsensusCore`] on a dedicated thread and feeds it events from
//! a single channel. Network receivers, the timer thread and the commit path
//! only enqueue; the core is never touched from anywhere else.
//!
//! # Architecture
//!
//! ```text
//!  ┌───────────────────────────────────────────────────┐
//!  │                 ConsensusService                   │
//!  │                                                    │
//!  │  network ─┐                                        │
//!  │  timer  ──┼──▶ events ──▶ ┌───────────────┐        │
//!  │  commit ──┘   (channel)   │ ConsensusCore │──▶ backend
//!  │                           └──────┬────────┘        │
//!  │                                  │                 │
//!  │                           ┌──────▼────────┐        │
//!  │                           │   RoundView   │◀── readers
//!  │                           └───────────────┘        │
//!  └───────────────────────────────────────────────────┘
//! ```

use {
    crate::{
        backend::ConsensusBackend,
        config::BftConfig,
        engine::{ConsensusCore, ConsensusEvent},
        error::ServiceError,
        timeout::TimerThread,
        types::{ProposedBlock, RoundView},
    },
    crossbeam_channel::{Receiver, RecvTimeoutError, Sender},
    log::*,
    std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, PoisonError, RwLock,
        },
        thread::{self, Builder, JoinHandle},
        time::Duration,
    },
};

/// How often the loop wakes to check the exit flag when idle.
const EXIT_POLL_INTERVAL_MS: u64 = 50;

#[derive(Debug, Clone, Default)]
pub struct ConsensusServiceConfig {
    pub bft_config: BftConfig,
    /// Height of the last block already on chain; consensus starts above it.
    pub last_committed_height: u64,
}

/// Cloneable entry point for other threads.
#[derive(Debug, Clone)]
pub struct ConsensusHandle {
    events: Sender<ConsensusEvent>,
    view: Arc<RwLock<RoundView>>,
}

impl ConsensusHandle {
    pub fn submit_message(&self, bytes: Vec<u8>) -> Result<(), ServiceError> {
        self.submit(ConsensusEvent::Message(bytes))
    }

    pub fn submit_commit_confirmed(&self, block: ProposedBlock) -> Result<(), ServiceError> {
        self.submit(ConsensusEvent::CommitConfirmed(block))
    }

    pub fn submit(&self, event: ConsensusEvent) -> Result<(), ServiceError> {
        self.events
            .send(event)
            .map_err(|_| ServiceError::ChannelClosed)
    }

    /// Latest published height/round/step.
    pub fn view(&self) -> RoundView {
        *self.view.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Runs the consensus loop on the `trv1BftCore` thread.
pub struct ConsensusService {
    thread: JoinHandle<()>,
    timer: TimerThread,
    handle: ConsensusHandle,
}

impl ConsensusService {
    /// Build the core and start the loop.
    ///
    /// `events` is the channel every producer sends into; callers keep clones
    /// of its sender (or use [`ConsensusService::handle`]).
    pub fn new<B>(
        config: ConsensusServiceConfig,
        backend: B,
        events: (Sender<ConsensusEvent>, Receiver<ConsensusEvent>),
        exit: Arc<AtomicBool>,
    ) -> Result<Self, ServiceError>
    where
        B: ConsensusBackend + Send + 'static,
    {
        let (sender, receiver) = events;
        let timer = TimerThread::new(sender.clone())?;
        let core = ConsensusCore::new(config.bft_config, backend, config.last_committed_height)?
            .with_timer(timer.handle());

        let view = Arc::new(RwLock::new(core.view()));
        let handle = ConsensusHandle {
            events: sender,
            view: view.clone(),
        };

        let thread = Builder::new()
            .name("trv1BftCore".to_string())
            .spawn(move || Self::run(core, &receiver, &view, &exit))?;

        Ok(Self {
            thread,
            timer,
            handle,
        })
    }

    pub fn handle(&self) -> ConsensusHandle {
        self.handle.clone()
    }

    /// Join the consensus thread, then stop the timer.
    pub fn join(self) -> thread::Result<()> {
        self.thread.join()?;
        self.timer.join()
    }

    fn run<B: ConsensusBackend>(
        mut core: ConsensusCore<B>,
        events: &Receiver<ConsensusEvent>,
        view: &RwLock<RoundView>,
        exit: &AtomicBool,
    ) {
        info!(
            "ConsensusService: starting at height {} (identity: {})",
            core.height(),
            core.identity()
        );
        core.start();
        Self::publish(&core, view);

        loop {
            if exit.load(Ordering::Relaxed) {
                info!("ConsensusService: exit signal received, shutting down");
                break;
            }

            match events.recv_timeout(Duration::from_millis(EXIT_POLL_INTERVAL_MS)) {
                Ok(event) => {
                    if let Err(err) = core.handle_event(event) {
                        debug!("ConsensusService: event dropped: {err}");
                    }
                    Self::publish(&core, view);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    info!("ConsensusService: event channel closed, shutting down");
                    break;
                }
            }
        }
    }

    fn publish<B: ConsensusBackend>(core: &ConsensusCore<B>, view: &RwLock<RoundView>) {
        let snapshot = core.view();
        let mut published = view.write().unwrap_or_else(PoisonError::into_inner);
        if *published != snapshot {
            trace!("ConsensusService: now at {snapshot:?}");
            *published = snapshot;
        }
    }
}
