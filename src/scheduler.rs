use parking_lot::{Condvar, Mutex};
use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, trace};

/// callback fired by the scheduler loop
///
/// Returning `Some(interval)` re-arms the event at `now + interval` with the
/// same priority. Periodic tasks re-arm as their own last step, so execution
/// time never accumulates more than one action's worth of drift. One-shot
/// actions return `None`.
pub type Action = Box<dyn FnMut() -> Option<Duration> + Send>;

struct QueuedEvent {
    fire_at: Instant,
    priority: u32,
    seq: u64,
    action: Action,
}

impl QueuedEvent {
    fn key(&self) -> (Instant, u32, u64) {
        (self.fire_at, self.priority, self.seq)
    }
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueuedEvent {}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

#[derive(Default)]
struct QueueState {
    queue: BinaryHeap<Reverse<QueuedEvent>>,
    seq: u64,
    stopped: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<QueueState>,
    cond: Condvar,
}

/// time-ordered event queue
///
/// Events with equal fire time dispatch in ascending priority order, equal
/// priority is FIFO by insertion. The loop sleeps until the next event is
/// eligible instead of busy-waiting; `schedule` and `request_stop` interrupt
/// the sleep. Panics in actions are deliberately not caught, a broken
/// callback is fatal for the run.
#[derive(Clone, Default)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// insert an event at `now + delay`; a zero delay fires as soon as the
    /// loop is serviced
    pub fn schedule(&self, delay: Duration, priority: u32, action: Action) {
        self.schedule_at(Instant::now() + delay, priority, action);
    }

    pub(crate) fn schedule_at(&self, fire_at: Instant, priority: u32, action: Action) {
        let mut state = self.shared.state.lock();
        let seq = state.seq;
        state.seq += 1;
        state.queue.push(Reverse(QueuedEvent {
            fire_at,
            priority,
            seq,
            action,
        }));
        trace!(priority, seq, "scheduled event");
        self.shared.cond.notify_all();
    }

    /// number of events still queued
    pub fn pending(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// stop firing events; pending events are discarded when the loop
    /// observes the flag
    pub fn request_stop(&self) {
        self.shared.state.lock().stopped = true;
        self.shared.cond.notify_all();
    }

    /// drive the queue until it is empty or a stop was requested
    pub fn run(&self) {
        loop {
            let mut event = {
                let mut state = self.shared.state.lock();
                loop {
                    if state.stopped {
                        let dropped = state.queue.len();
                        if dropped > 0 {
                            debug!(dropped, "discarding pending events on stop");
                        }
                        state.queue.clear();
                        return;
                    }
                    let fire_at = match state.queue.peek() {
                        Some(Reverse(head)) => head.fire_at,
                        None => return,
                    };
                    if fire_at <= Instant::now() {
                        break;
                    }
                    self.shared.cond.wait_until(&mut state, fire_at);
                }
                match state.queue.pop() {
                    Some(Reverse(event)) => event,
                    None => return,
                }
            };

            let rearm = (event.action)();

            if let Some(interval) = rearm {
                let mut state = self.shared.state.lock();
                if !state.stopped {
                    event.fire_at = Instant::now() + interval;
                    event.seq = state.seq;
                    state.seq += 1;
                    state.queue.push(Reverse(event));
                }
            }
        }
    }
}
