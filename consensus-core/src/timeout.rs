//! Timeout management for the agreement protocol.
//!
//! Each step (Propose, Prevote, Precommit) has its own one-shot timer whose
//! length grows linearly with the round. Timers are never cancelled across
//! threads: every schedule bumps a per-kind generation, and a fired event is
//! honoured only if it still carries the live generation.
//!
//! Without a [`TimerHandle`] the scheduler only records what is pending, so
//! tests can fire timeouts deterministically. With one, a [`TimerThread`]
//! sleeps until the earliest deadline and enqueues the event on the core's
//! channel.

use {
    crate::{config::BftConfig, engine::ConsensusEvent, types::ConsensusStep},
    crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender},
    log::*,
    std::{
        io,
        thread::{Builder, JoinHandle},
        time::{Duration, Instant},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    Propose,
    Prevote,
    Precommit,
}

impl TimeoutKind {
    pub const ALL: [TimeoutKind; 3] = [
        TimeoutKind::Propose,
        TimeoutKind::Prevote,
        TimeoutKind::Precommit,
    ];

    fn index(self) -> usize {
        match self {
            TimeoutKind::Propose => 0,
            TimeoutKind::Prevote => 1,
            TimeoutKind::Precommit => 2,
        }
    }

    /// Step the core must still be in for the timeout to act. The precommit
    /// timeout acts in any step of its round.
    pub fn required_step(self) -> Option<ConsensusStep> {
        match self {
            TimeoutKind::Propose => Some(ConsensusStep::Propose),
            TimeoutKind::Prevote => Some(ConsensusStep::Prevote),
            TimeoutKind::Precommit => None,
        }
    }
}

/// A timer firing, tagged with the position it was scheduled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutEvent {
    pub kind: TimeoutKind,
    pub height: u64,
    pub round: u32,
    pub generation: u64,
}

/// Tracks the live timer of each kind.
#[derive(Debug)]
pub struct TimeoutScheduler {
    config: BftConfig,
    generations: [u64; 3],
    pending: [Option<TimeoutEvent>; 3],
    timer: Option<TimerHandle>,
}

impl TimeoutScheduler {
    /// Create a scheduler that only records pending timers.
    pub fn new(config: BftConfig) -> Self {
        Self {
            config,
            generations: [0; 3],
            pending: [None; 3],
            timer: None,
        }
    }

    /// Deliver future timers through `timer`.
    pub fn attach(&mut self, timer: TimerHandle) {
        self.timer = Some(timer);
    }

    pub fn duration(&self, kind: TimeoutKind, round: u32) -> Duration {
        self.config.timeout(kind, round)
    }

    /// Start a timer of `kind`, replacing any live timer of that kind.
    pub fn schedule(&mut self, kind: TimeoutKind, height: u64, round: u32) -> TimeoutEvent {
        let slot = kind.index();
        self.generations[slot] = self.generations[slot].wrapping_add(1);
        let event = TimeoutEvent {
            kind,
            height,
            round,
            generation: self.generations[slot],
        };
        self.pending[slot] = Some(event);

        let duration = self.duration(kind, round);
        trace!("scheduled {kind:?} timeout for height {height} round {round} in {duration:?}");
        if let Some(timer) = &self.timer {
            timer.arm(event, Instant::now() + duration);
        }
        event
    }

    /// Accept `event` if it is the live timer of its kind, consuming it.
    pub fn take_if_live(&mut self, event: &TimeoutEvent) -> bool {
        let slot = event.kind.index();
        if self.pending[slot].as_ref() == Some(event) {
            self.pending[slot] = None;
            true
        } else {
            false
        }
    }

    pub fn is_live(&self, event: &TimeoutEvent) -> bool {
        self.pending[event.kind.index()].as_ref() == Some(event)
    }

    pub fn pending(&self, kind: TimeoutKind) -> Option<TimeoutEvent> {
        self.pending[kind.index()]
    }

    /// Invalidate every live timer. Already fired events become stale.
    pub fn cancel_all(&mut self) {
        for kind in TimeoutKind::ALL {
            let slot = kind.index();
            if self.pending[slot].take().is_some() {
                self.generations[slot] = self.generations[slot].wrapping_add(1);
            }
        }
    }
}

// ── Timer thread ────────────────────────────────────────────────────────────

#[derive(Debug)]
enum TimerCommand {
    Arm { event: TimeoutEvent, deadline: Instant },
    Shutdown,
}

/// Cheap handle for arming timers on a [`TimerThread`].
#[derive(Debug, Clone)]
pub struct TimerHandle {
    commands: Sender<TimerCommand>,
}

impl TimerHandle {
    fn arm(&self, event: TimeoutEvent, deadline: Instant) {
        if self
            .commands
            .send(TimerCommand::Arm { event, deadline })
            .is_err()
        {
            warn!("timer thread gone, dropping {:?} timeout", event.kind);
        }
    }
}

/// Thread that turns deadlines into [`ConsensusEvent::Timeout`] events.
pub struct TimerThread {
    thread: JoinHandle<()>,
    handle: TimerHandle,
}

impl TimerThread {
    pub fn new(events: Sender<ConsensusEvent>) -> io::Result<Self> {
        let (commands, receiver) = unbounded();
        let thread = Builder::new()
            .name("trv1BftTimer".to_string())
            .spawn(move || Self::run(receiver, events))?;
        Ok(Self {
            thread,
            handle: TimerHandle { commands },
        })
    }

    pub fn handle(&self) -> TimerHandle {
        self.handle.clone()
    }

    fn run(commands: Receiver<TimerCommand>, events: Sender<ConsensusEvent>) {
        // One slot per kind; re-arming a kind replaces its deadline.
        let mut armed: [Option<(Instant, TimeoutEvent)>; 3] = [None; 3];

        loop {
            let next = armed.iter().flatten().map(|(deadline, _)| *deadline).min();
            let command = match next {
                Some(deadline) => commands.recv_deadline(deadline),
                None => commands.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };

            match command {
                Ok(TimerCommand::Arm { event, deadline }) => {
                    armed[event.kind.index()] = Some((deadline, event));
                }
                Ok(TimerCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    let now = Instant::now();
                    let mut due: Vec<(Instant, TimeoutEvent)> = armed
                        .iter_mut()
                        .filter(|slot| matches!(slot, Some((deadline, _)) if *deadline <= now))
                        .filter_map(Option::take)
                        .collect();
                    due.sort_by_key(|(deadline, _)| *deadline);
                    for (_, event) in due {
                        if events.send(ConsensusEvent::Timeout(event)).is_err() {
                            debug!("consensus event channel closed, timer thread exiting");
                            return;
                        }
                    }
                }
            }
        }
    }

    pub fn join(self) -> std::thread::Result<()> {
        let _ = self.handle.commands.send(TimerCommand::Shutdown);
        self.thread.join()
    }
}

#[cfg(test)]
mod tests {
    use {super::*, assert_matches::assert_matches};

    #[test]
    fn test_duration_grows_with_round() {
        let scheduler = TimeoutScheduler::new(BftConfig::default());
        assert_eq!(
            scheduler.duration(TimeoutKind::Propose, 0),
            Duration::from_millis(3000)
        );
        assert_eq!(
            scheduler.duration(TimeoutKind::Propose, 2),
            Duration::from_millis(4000)
        );
        assert_eq!(
            scheduler.duration(TimeoutKind::Prevote, 1),
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn test_schedule_records_pending() {
        let mut scheduler = TimeoutScheduler::new(BftConfig::default());
        let event = scheduler.schedule(TimeoutKind::Prevote, 10, 2);
        assert_eq!(scheduler.pending(TimeoutKind::Prevote), Some(event));
        assert_eq!(scheduler.pending(TimeoutKind::Propose), None);
        assert!(scheduler.is_live(&event));
        assert!(scheduler.take_if_live(&event));
        assert!(!scheduler.take_if_live(&event));
    }

    #[test]
    fn test_reschedule_invalidates_previous() {
        let mut scheduler = TimeoutScheduler::new(BftConfig::default());
        let first = scheduler.schedule(TimeoutKind::Propose, 1, 0);
        let second = scheduler.schedule(TimeoutKind::Propose, 1, 0);
        assert_ne!(first.generation, second.generation);
        assert!(!scheduler.take_if_live(&first));
        assert!(scheduler.take_if_live(&second));
    }

    #[test]
    fn test_kinds_are_independent() {
        let mut scheduler = TimeoutScheduler::new(BftConfig::default());
        let propose = scheduler.schedule(TimeoutKind::Propose, 1, 0);
        let prevote = scheduler.schedule(TimeoutKind::Prevote, 1, 0);
        assert!(scheduler.is_live(&propose));
        assert!(scheduler.take_if_live(&prevote));
        assert!(scheduler.take_if_live(&propose));
    }

    #[test]
    fn test_cancel_all_makes_events_stale() {
        let mut scheduler = TimeoutScheduler::new(BftConfig::default());
        let event = scheduler.schedule(TimeoutKind::Precommit, 1, 0);
        scheduler.cancel_all();
        assert!(!scheduler.take_if_live(&event));
        assert_eq!(scheduler.pending(TimeoutKind::Precommit), None);

        // Same position scheduled again gets a fresh generation
        let again = scheduler.schedule(TimeoutKind::Precommit, 1, 0);
        assert_ne!(again, event);
    }

    #[test]
    fn test_required_step() {
        assert_eq!(
            TimeoutKind::Propose.required_step(),
            Some(ConsensusStep::Propose)
        );
        assert_eq!(
            TimeoutKind::Prevote.required_step(),
            Some(ConsensusStep::Prevote)
        );
        assert_eq!(TimeoutKind::Precommit.required_step(), None);
    }

    #[test]
    fn test_timer_thread_fires_in_deadline_order() {
        let (sender, receiver) = unbounded();
        let timer = TimerThread::new(sender).unwrap();
        let mut scheduler = TimeoutScheduler::new(BftConfig {
            propose_timeout_base_ms: 300,
            prevote_timeout_base_ms: 10,
            ..BftConfig::dev_default()
        });
        scheduler.attach(timer.handle());

        let propose = scheduler.schedule(TimeoutKind::Propose, 1, 0);
        let prevote = scheduler.schedule(TimeoutKind::Prevote, 1, 0);

        let deadline = Duration::from_secs(5);
        assert_matches!(
            receiver.recv_timeout(deadline),
            Ok(ConsensusEvent::Timeout(event)) if event == prevote
        );
        assert_matches!(
            receiver.recv_timeout(deadline),
            Ok(ConsensusEvent::Timeout(event)) if event == propose
        );
        timer.join().unwrap();
    }

    #[test]
    fn test_timer_thread_rearm_replaces_deadline() {
        let (sender, receiver) = unbounded();
        let timer = TimerThread::new(sender).unwrap();
        let mut scheduler = TimeoutScheduler::new(BftConfig {
            precommit_timeout_base_ms: 20,
            ..BftConfig::dev_default()
        });
        scheduler.attach(timer.handle());

        scheduler.schedule(TimeoutKind::Precommit, 1, 0);
        let second = scheduler.schedule(TimeoutKind::Precommit, 1, 1);

        assert_matches!(
            receiver.recv_timeout(Duration::from_secs(5)),
            Ok(ConsensusEvent::Timeout(event)) if event == second
        );
        assert!(receiver.recv_timeout(Duration::from_millis(200)).is_err());
        timer.join().unwrap();
    }
}
