//! OS signal handling.
//!
//! # Responsibilities
//! - Register the master's signal set with the runtime
//! - Translate signals to internal [`Event`]s
//! - Buffer events in a bounded queue drained by the master loop
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-signal-safe self-pipe underneath)
//! - Terminal signals are never dropped; they coalesce into one pending
//!   [`TerminalAction`], immediate outranking graceful
//! - When the queue is full the oldest ordinary event is dropped
//! - Repeated child-exit notifications collapse into one

use std::collections::VecDeque;
use std::io;

use futures_util::future::select_all;
use futures_util::FutureExt;
use nix::sys::signal::Signal as NixSignal;
use tokio::signal::unix::{signal, Signal, SignalKind};

/// Default queue bound.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Control events consumed by the master loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    GracefulQuit,
    Terminate,
    Reload,
    Upgrade,
    ReopenLogs,
    IncrementWorkers,
    DecrementWorkers,
    StopWorkers,
    ChildReaped,
}

impl Event {
    /// Event raised by an OS signal in the master.
    pub fn from_signal(signal: NixSignal) -> Option<Event> {
        let event = match signal {
            NixSignal::SIGQUIT => Event::GracefulQuit,
            NixSignal::SIGTERM | NixSignal::SIGINT => Event::Terminate,
            NixSignal::SIGHUP => Event::Reload,
            NixSignal::SIGUSR2 => Event::Upgrade,
            NixSignal::SIGUSR1 => Event::ReopenLogs,
            NixSignal::SIGTTIN => Event::IncrementWorkers,
            NixSignal::SIGTTOU => Event::DecrementWorkers,
            NixSignal::SIGWINCH => Event::StopWorkers,
            NixSignal::SIGCHLD => Event::ChildReaped,
            _ => return None,
        };
        Some(event)
    }

    pub fn terminal(self) -> Option<TerminalAction> {
        match self {
            Event::GracefulQuit => Some(TerminalAction::GracefulQuit),
            Event::Terminate => Some(TerminalAction::Terminate),
            _ => None,
        }
    }
}

/// Pending shutdown request. Ordered by priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TerminalAction {
    GracefulQuit,
    Terminate,
}

impl From<TerminalAction> for Event {
    fn from(action: TerminalAction) -> Self {
        match action {
            TerminalAction::GracefulQuit => Event::GracefulQuit,
            TerminalAction::Terminate => Event::Terminate,
        }
    }
}

/// Bounded FIFO of control events with a terminal-action slot.
#[derive(Debug)]
pub struct EventQueue {
    events: VecDeque<Event>,
    capacity: usize,
    terminal: Option<TerminalAction>,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            terminal: None,
        }
    }

    pub fn push(&mut self, event: Event) {
        if let Some(action) = event.terminal() {
            self.terminal = self.terminal.max(Some(action));
            return;
        }
        if event == Event::ChildReaped && self.events.contains(&Event::ChildReaped) {
            return;
        }
        if self.events.len() >= self.capacity {
            if let Some(dropped) = self.events.pop_front() {
                tracing::warn!(dropped = ?dropped, "Event queue full, dropping oldest event");
            }
        }
        self.events.push_back(event);
    }

    /// Next event; a pending terminal action always comes first.
    pub fn pop(&mut self) -> Option<Event> {
        if let Some(action) = self.terminal.take() {
            return Some(action.into());
        }
        self.events.pop_front()
    }

    pub fn pending_terminal(&self) -> Option<TerminalAction> {
        self.terminal
    }

    pub fn len(&self) -> usize {
        self.events.len() + usize::from(self.terminal.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

const MASTER_SIGNALS: [NixSignal; 10] = [
    NixSignal::SIGQUIT,
    NixSignal::SIGTERM,
    NixSignal::SIGINT,
    NixSignal::SIGHUP,
    NixSignal::SIGUSR2,
    NixSignal::SIGUSR1,
    NixSignal::SIGTTIN,
    NixSignal::SIGTTOU,
    NixSignal::SIGWINCH,
    NixSignal::SIGCHLD,
];

/// Converts OS signal delivery into queued [`Event`]s.
///
/// Must be created inside a Tokio runtime.
pub struct SignalDispatcher {
    streams: Vec<(Signal, Event)>,
}

impl SignalDispatcher {
    /// Install handlers for the full master signal set.
    pub fn install() -> io::Result<Self> {
        Self::for_signals(&MASTER_SIGNALS)
    }

    pub fn for_signals(signals: &[NixSignal]) -> io::Result<Self> {
        let mut streams = Vec::with_capacity(signals.len());
        for &sig in signals {
            let Some(event) = Event::from_signal(sig) else {
                continue;
            };
            streams.push((signal(SignalKind::from_raw(sig as i32))?, event));
        }
        Ok(Self { streams })
    }

    /// Wait for at least one signal, then enqueue it and any others already
    /// delivered.
    pub async fn wait(&mut self, queue: &mut EventQueue) {
        if self.streams.is_empty() {
            return std::future::pending().await;
        }

        let (first, _, _) = select_all(
            self.streams
                .iter_mut()
                .map(|(stream, event)| Box::pin(stream.recv().map(move |_| *event))),
        )
        .await;
        queue.push(first);
        self.drain_ready(queue);
    }

    /// Enqueue every signal that is already pending, without waiting.
    pub fn drain_ready(&mut self, queue: &mut EventQueue) {
        for (stream, event) in &mut self.streams {
            if let Some(Some(())) = stream.recv().now_or_never() {
                queue.push(*event);
            }
        }
    }
}

impl std::fmt::Debug for SignalDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalDispatcher")
            .field("events", &self.streams.iter().map(|(_, e)| e).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_actions_coalesce_and_jump_the_queue() {
        let mut queue = EventQueue::new(8);
        queue.push(Event::Reload);
        queue.push(Event::GracefulQuit);
        queue.push(Event::GracefulQuit);
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop(), Some(Event::GracefulQuit));
        assert_eq!(queue.pop(), Some(Event::Reload));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn terminate_outranks_graceful_quit() {
        let mut queue = EventQueue::new(8);
        queue.push(Event::Terminate);
        queue.push(Event::GracefulQuit);
        assert_eq!(queue.pending_terminal(), Some(TerminalAction::Terminate));
        assert_eq!(queue.pop(), Some(Event::Terminate));
        assert!(queue.is_empty());
    }

    #[test]
    fn full_queue_drops_oldest_but_keeps_terminal() {
        let mut queue = EventQueue::new(2);
        queue.push(Event::IncrementWorkers);
        queue.push(Event::Reload);
        queue.push(Event::Terminate);
        queue.push(Event::ReopenLogs);

        assert_eq!(queue.pop(), Some(Event::Terminate));
        assert_eq!(queue.pop(), Some(Event::Reload));
        assert_eq!(queue.pop(), Some(Event::ReopenLogs));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn child_reaped_collapses() {
        let mut queue = EventQueue::new(8);
        queue.push(Event::ChildReaped);
        queue.push(Event::ChildReaped);
        queue.push(Event::ChildReaped);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn signal_map() {
        assert_eq!(Event::from_signal(NixSignal::SIGINT), Some(Event::Terminate));
        assert_eq!(Event::from_signal(NixSignal::SIGUSR2), Some(Event::Upgrade));
        assert_eq!(Event::from_signal(NixSignal::SIGTTOU), Some(Event::DecrementWorkers));
        assert_eq!(Event::from_signal(NixSignal::SIGALRM), None);
    }

    #[tokio::test]
    async fn delivered_signal_becomes_event() {
        let mut dispatcher = SignalDispatcher::for_signals(&[NixSignal::SIGHUP]).unwrap();
        let mut queue = EventQueue::default();

        nix::sys::signal::raise(NixSignal::SIGHUP).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), dispatcher.wait(&mut queue))
            .await
            .unwrap();
        assert_eq!(queue.pop(), Some(Event::Reload));
    }
}
