//! Timing Wheel
//!
//! Delayed-task engine driven by a single coordinator task.
//!
//! # Design
//!
//! - A fixed ring of `num_slots` buckets, advanced one bucket per tick
//! - Each entry remembers how many full laps (`circle`) it still has to wait,
//!   and how many extra slots (`diff`) it must travel after a reschedule
//! - The coordinator exclusively owns the slots, the entry arena and the
//!   key -> position index; handles talk to it over an `mpsc` command channel,
//!   so every mutation is totally ordered relative to tick boundaries
//! - Due entries are fired on spawned tasks, never on the coordinator
//!
//! # Slot arithmetic
//!
//! ```text
//! steps  = max(1, ceil((now - last_tick + delay) / interval))
//! pos    = (ticked_pos + steps % num_slots) % num_slots
//! circle = (steps - 1) / num_slots
//! ```
//!
//! Counting from the last processed tick keeps every firing inside
//! `[delay, delay + interval]` no matter when between two ticks the request arrives.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{Error, Result};

/// Concurrent callbacks while draining
pub const DRAIN_WORKERS: usize = 8;

/// Pending commands buffered before callers are back-pressured
const COMMAND_BUFFER: usize = 1024;

type Execute<K, V> = Arc<dyn Fn(K, V) -> BoxFuture<'static, ()> + Send + Sync>;

fn boxed_execute<K, V, F, Fut>(f: F) -> Execute<K, V>
where
    F: Fn(K, V) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |key, value| f(key, value).boxed())
}

/// Run one callback with its panic contained
async fn run_safe<K, V>(execute: Execute<K, V>, key: K, value: V)
where
    K: Send + 'static,
    V: Send + 'static,
{
    let call = AssertUnwindSafe(async move { execute(key, value).await });
    if call.catch_unwind().await.is_err() {
        error!("timing wheel callback panicked");
    }
}

// =============================================================================
// Commands
// =============================================================================

enum Command<K, V> {
    Set { key: K, value: V, delay: Duration },
    Move { key: K, delay: Duration },
    Remove { key: K },
    Drain {
        execute: Execute<K, V>,
        done: oneshot::Sender<usize>,
    },
}

// =============================================================================
// Handle
// =============================================================================

/// Handle to a running timing wheel
///
/// Cloning the handle is cheap; all clones drive the same coordinator.
pub struct TimingWheel<K, V> {
    interval: Duration,
    num_slots: usize,
    commands: mpsc::Sender<Command<K, V>>,
    shutdown: CancellationToken,
}

impl<K, V> Clone for TimingWheel<K, V> {
    fn clone(&self) -> Self {
        Self {
            interval: self.interval,
            num_slots: self.num_slots,
            commands: self.commands.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<K, V> std::fmt::Debug for TimingWheel<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimingWheel")
            .field("interval", &self.interval)
            .field("num_slots", &self.num_slots)
            .field("stopped", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl<K, V> TimingWheel<K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Send + 'static,
{
    /// Create a wheel and start its coordinator on the current Tokio runtime
    ///
    /// `execute` is invoked with the key and value of every timer that comes due.
    pub fn new<F, Fut>(interval: Duration, num_slots: usize, execute: F) -> Result<Self>
    where
        F: Fn(K, V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if interval.is_zero() || num_slots == 0 {
            return Err(Error::Config(format!(
                "timing wheel interval ({:?}) and slot count ({}) must be greater than zero",
                interval, num_slots
            )));
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            Error::Config(format!("timing wheel requires a Tokio runtime: {}", e))
        })?;

        let start = Instant::now();
        let mut ticker = time::interval_at(start + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let shutdown = CancellationToken::new();

        let coordinator = Coordinator {
            interval,
            slots: (0..num_slots).map(|_| VecDeque::new()).collect(),
            entries: HashMap::new(),
            timers: HashMap::new(),
            // The first tick lands on slot 0
            ticked_pos: num_slots - 1,
            last_tick: start,
            next_entry_id: 0,
            execute: boxed_execute(execute),
        };
        runtime.spawn(coordinator.run(ticker, rx, shutdown.clone()));

        info!(?interval, num_slots, "Timing wheel started");

        Ok(Self {
            interval,
            num_slots,
            commands: tx,
            shutdown,
        })
    }

    /// Tick interval
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Number of slots in the ring
    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    /// Schedule `value` under `key` to fire after `delay`
    ///
    /// An existing live timer for `key` gets the new value and is rescheduled
    /// instead of duplicated. A zero delay is ignored; any other delay shorter
    /// than one tick waits for the next tick.
    pub async fn set_timer(&self, key: K, value: V, delay: Duration) -> Result<()> {
        if delay.is_zero() {
            return Ok(());
        }
        self.send(Command::Set { key, value, delay }).await
    }

    /// Reschedule the live timer for `key`; no-op when there is none
    ///
    /// A delay shorter than one tick fires the timer right away.
    pub async fn move_timer(&self, key: K, delay: Duration) -> Result<()> {
        if delay.is_zero() {
            return Ok(());
        }
        self.send(Command::Move { key, delay }).await
    }

    /// Cancel the timer for `key`
    pub async fn remove_timer(&self, key: K) -> Result<()> {
        self.send(Command::Remove { key }).await
    }

    /// Empty the wheel, calling `f` once for every live timer
    ///
    /// Resolves after every callback completed and returns how many ran.
    pub async fn drain<F, Fut>(&self, f: F) -> Result<usize>
    where
        F: Fn(K, V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (done, drained) = oneshot::channel();
        self.send(Command::Drain {
            execute: boxed_execute(f),
            done,
        })
        .await?;
        drained.await.map_err(|_| Error::WheelStopped)
    }

    /// Stop the coordinator. Idempotent.
    pub fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            debug!("Stopping timing wheel");
        }
        self.shutdown.cancel();
    }

    /// Whether [`stop`](Self::stop) has been called
    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    async fn send(&self, command: Command<K, V>) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::WheelStopped);
        }
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::WheelStopped)
    }
}

// =============================================================================
// Coordinator
// =============================================================================

struct TimingEntry<K, V> {
    key: K,
    value: V,
    circle: usize,
    diff: usize,
}

#[derive(Debug, Clone, Copy)]
struct Position {
    pos: usize,
    id: u64,
}

/// Sole owner of the wheel state
///
/// Slots hold entry ids. An id that no longer resolves in `entries` is a
/// tombstone and is dropped the next time its slot is scanned.
struct Coordinator<K, V> {
    interval: Duration,
    slots: Vec<VecDeque<u64>>,
    entries: HashMap<u64, TimingEntry<K, V>>,
    timers: HashMap<K, Position>,
    ticked_pos: usize,
    last_tick: Instant,
    next_entry_id: u64,
    execute: Execute<K, V>,
}

impl<K, V> Coordinator<K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Send + 'static,
{
    async fn run(
        mut self,
        mut ticker: Interval,
        mut commands: mpsc::Receiver<Command<K, V>>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                tick = ticker.tick() => self.on_tick(tick),

                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
            }
        }

        debug!(pending = self.timers.len(), "Timing wheel coordinator exited");
    }

    fn handle(&mut self, command: Command<K, V>) {
        match command {
            Command::Set { key, value, delay } => self.set_task(key, value, delay),
            Command::Move { key, delay } => self.move_task(key, delay),
            Command::Remove { key } => self.remove_task(&key),
            Command::Drain { execute, done } => self.drain_all(execute, done),
        }
    }

    fn on_tick(&mut self, tick: Instant) {
        self.last_tick = tick;
        self.ticked_pos = (self.ticked_pos + 1) % self.slots.len();
        let due = self.scan_slot();
        self.run_tasks(due);
    }

    fn scan_slot(&mut self) -> Vec<(K, V)> {
        let num_slots = self.slots.len();
        let current = self.ticked_pos;
        let ids = std::mem::take(&mut self.slots[current]);
        let mut due = Vec::new();

        for id in ids {
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };

            if entry.circle > 0 {
                entry.circle -= 1;
                self.slots[current].push_back(id);
                continue;
            }

            if entry.diff > 0 {
                let pos = (current + entry.diff) % num_slots;
                entry.diff = 0;
                self.slots[pos].push_back(id);
                if let Some(position) = self.timers.get_mut(&entry.key) {
                    position.pos = pos;
                }
                continue;
            }

            if let Some(entry) = self.entries.remove(&id) {
                self.timers.remove(&entry.key);
                due.push((entry.key, entry.value));
            }
        }

        due
    }

    fn run_tasks(&self, tasks: Vec<(K, V)>) {
        for (key, value) in tasks {
            tokio::spawn(run_safe(Arc::clone(&self.execute), key, value));
        }
    }

    fn set_task(&mut self, key: K, value: V, delay: Duration) {
        // A reset must not take the immediate-fire path of a short move
        let delay = delay.max(self.interval);

        if let Some(position) = self.timers.get(&key).copied() {
            if let Some(entry) = self.entries.get_mut(&position.id) {
                entry.value = value;
            }
            self.move_task(key, delay);
            return;
        }

        let steps = self.steps_for(delay);
        let circle = (steps - 1) / self.slots.len();
        let pos = self.slot_after(steps);
        self.insert_entry(key, value, pos, circle);
    }

    fn move_task(&mut self, key: K, delay: Duration) {
        let Some(position) = self.timers.get(&key).copied() else {
            return;
        };

        if delay < self.interval {
            self.timers.remove(&key);
            if let Some(entry) = self.entries.remove(&position.id) {
                tokio::spawn(run_safe(Arc::clone(&self.execute), entry.key, entry.value));
            }
            return;
        }

        let num_slots = self.slots.len();
        let steps = self.steps_for(delay);
        let circle = (steps - 1) / num_slots;
        // Ticks into the final lap, 1..=num_slots
        let offset = steps - circle * num_slots;
        // Ticks until the entry's current slot is visited next, 1..=num_slots
        let distance = (position.pos + num_slots - self.ticked_pos - 1) % num_slots + 1;

        if offset >= distance {
            if let Some(entry) = self.entries.get_mut(&position.id) {
                entry.circle = circle;
                entry.diff = offset - distance;
            }
        } else if circle > 0 {
            if let Some(entry) = self.entries.get_mut(&position.id) {
                entry.circle = circle - 1;
                entry.diff = num_slots + offset - distance;
            }
        } else if let Some(entry) = self.entries.remove(&position.id) {
            // Old slot keeps a dangling id; the index moves to the new entry in
            // the same step so the key is never live twice.
            let pos = self.slot_after(steps);
            self.insert_entry(entry.key, entry.value, pos, 0);
        }
    }

    fn remove_task(&mut self, key: &K) {
        if let Some(position) = self.timers.remove(key) {
            self.entries.remove(&position.id);
        }
    }

    fn drain_all(&mut self, execute: Execute<K, V>, done: oneshot::Sender<usize>) {
        let mut tasks = Vec::with_capacity(self.timers.len());
        for slot in self.slots.iter_mut() {
            for id in slot.drain(..) {
                if let Some(entry) = self.entries.remove(&id) {
                    tasks.push((entry.key, entry.value));
                }
            }
        }
        self.timers.clear();

        debug!(count = tasks.len(), "Draining timing wheel");

        tokio::spawn(async move {
            let count = tasks.len();
            let workers = Arc::new(Semaphore::new(DRAIN_WORKERS));
            let mut running = JoinSet::new();

            for (key, value) in tasks {
                let Ok(permit) = Arc::clone(&workers).acquire_owned().await else {
                    break;
                };
                let execute = Arc::clone(&execute);
                running.spawn(async move {
                    let _permit = permit;
                    run_safe(execute, key, value).await;
                });
            }
            while running.join_next().await.is_some() {}

            let _ = done.send(count);
        });
    }

    fn steps_for(&self, delay: Duration) -> usize {
        let pending = Instant::now()
            .saturating_duration_since(self.last_tick)
            .saturating_add(delay);
        let steps = pending.as_nanos().div_ceil(self.interval.as_nanos());
        usize::try_from(steps).unwrap_or(usize::MAX).max(1)
    }

    /// Slot visited `steps` ticks after the cursor
    fn slot_after(&self, steps: usize) -> usize {
        let num_slots = self.slots.len();
        (self.ticked_pos + steps % num_slots) % num_slots
    }

    fn insert_entry(&mut self, key: K, value: V, pos: usize, circle: usize) {
        let id = self.next_entry_id;
        self.next_entry_id += 1;

        self.slots[pos].push_back(id);
        self.timers.insert(key.clone(), Position { pos, id });
        self.entries.insert(
            id,
            TimingEntry {
                key,
                value,
                circle,
                diff: 0,
            },
        );
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc::UnboundedReceiver;

    type Fired = (String, i32, Duration);

    /// Wheel whose callback reports (key, value, elapsed since creation)
    fn recording_wheel(
        interval: Duration,
        num_slots: usize,
    ) -> (TimingWheel<String, i32>, UnboundedReceiver<Fired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let start = Instant::now();
        let wheel = TimingWheel::new(interval, num_slots, move |key: String, value: i32| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((key, value, start.elapsed()));
            }
        })
        .unwrap();
        (wheel, rx)
    }

    fn collect(rx: &mut UnboundedReceiver<Fired>) -> Vec<Fired> {
        let mut fired = Vec::new();
        while let Ok(item) = rx.try_recv() {
            fired.push(item);
        }
        fired
    }

    fn assert_fired_between(fired: &Fired, low: Duration, high: Duration) {
        assert!(
            fired.2 >= low && fired.2 <= high,
            "{} fired at {:?}, expected within [{:?}, {:?}]",
            fired.0,
            fired.2,
            low,
            high
        );
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let zero_interval = TimingWheel::<u32, ()>::new(Duration::ZERO, 10, |_, _| async {});
        assert_matches!(zero_interval, Err(Error::Config(_)));

        let zero_slots = TimingWheel::<u32, ()>::new(Duration::from_secs(1), 0, |_, _| async {});
        assert_matches!(zero_slots, Err(Error::Config(_)));
    }

    #[test]
    fn test_requires_runtime() {
        let result = TimingWheel::<u32, ()>::new(Duration::from_secs(1), 10, |_, _| async {});
        assert_matches!(result, Err(Error::Config(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_within_one_interval_of_delay() {
        let (wheel, mut rx) = recording_wheel(Duration::from_secs(1), 10);

        wheel
            .set_timer("job".to_string(), 42, Duration::from_secs(3))
            .await
            .unwrap();

        time::sleep(Duration::from_secs(5)).await;

        let fired = collect(&mut rx);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, "job");
        assert_eq!(fired[0].1, 42);
        assert_fired_between(&fired[0], Duration::from_secs(3), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_between_ticks_never_fires_early() {
        let (wheel, mut rx) = recording_wheel(Duration::from_secs(1), 10);

        time::sleep(Duration::from_millis(1500)).await;
        wheel
            .set_timer("late".to_string(), 1, Duration::from_secs(2))
            .await
            .unwrap();

        time::sleep(Duration::from_secs(5)).await;

        let fired = collect(&mut rx);
        assert_eq!(fired.len(), 1);
        assert_fired_between(&fired[0], Duration::from_millis(3500), Duration::from_millis(4500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_timer_never_fires() {
        let (wheel, mut rx) = recording_wheel(Duration::from_secs(1), 10);

        wheel
            .set_timer("job".to_string(), 42, Duration::from_secs(3))
            .await
            .unwrap();
        time::sleep(Duration::from_secs(1)).await;
        wheel.remove_timer("job".to_string()).await.unwrap();

        time::sleep(Duration::from_secs(20)).await;
        assert!(collect(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_replaces_value_without_duplicate() {
        let (wheel, mut rx) = recording_wheel(Duration::from_secs(1), 10);

        wheel
            .set_timer("job".to_string(), 1, Duration::from_secs(3))
            .await
            .unwrap();
        wheel
            .set_timer("job".to_string(), 2, Duration::from_secs(3))
            .await
            .unwrap();

        time::sleep(Duration::from_secs(15)).await;

        let fired = collect(&mut rx);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].1, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_after_remove_creates_fresh_timer() {
        let (wheel, mut rx) = recording_wheel(Duration::from_secs(1), 10);

        wheel
            .set_timer("job".to_string(), 1, Duration::from_secs(2))
            .await
            .unwrap();
        wheel.remove_timer("job".to_string()).await.unwrap();
        wheel
            .set_timer("job".to_string(), 2, Duration::from_secs(4))
            .await
            .unwrap();

        time::sleep(Duration::from_secs(10)).await;

        let fired = collect(&mut rx);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].1, 2);
        assert_fired_between(&fired[0], Duration::from_secs(4), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_spanning_several_laps() {
        let (wheel, mut rx) = recording_wheel(Duration::from_secs(1), 10);

        wheel
            .set_timer("long".to_string(), 7, Duration::from_secs(25))
            .await
            .unwrap();
        wheel
            .set_timer("lap".to_string(), 8, Duration::from_secs(10))
            .await
            .unwrap();

        time::sleep(Duration::from_secs(30)).await;

        let fired = collect(&mut rx);
        assert_eq!(fired.len(), 2);
        let lap = fired.iter().find(|f| f.0 == "lap").unwrap();
        let long = fired.iter().find(|f| f.0 == "long").unwrap();
        assert_fired_between(lap, Duration::from_secs(10), Duration::from_secs(11));
        assert_fired_between(long, Duration::from_secs(25), Duration::from_secs(26));
    }

    #[tokio::test(start_paused = true)]
    async fn test_move_later_in_same_lap() {
        let (wheel, mut rx) = recording_wheel(Duration::from_secs(1), 10);

        wheel
            .set_timer("job".to_string(), 1, Duration::from_secs(2))
            .await
            .unwrap();
        wheel
            .move_timer("job".to_string(), Duration::from_secs(7))
            .await
            .unwrap();

        time::sleep(Duration::from_secs(12)).await;

        let fired = collect(&mut rx);
        assert_eq!(fired.len(), 1);
        assert_fired_between(&fired[0], Duration::from_secs(7), Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_move_earlier_reinserts() {
        let (wheel, mut rx) = recording_wheel(Duration::from_secs(1), 10);

        wheel
            .set_timer("job".to_string(), 1, Duration::from_secs(8))
            .await
            .unwrap();
        wheel
            .move_timer("job".to_string(), Duration::from_secs(3))
            .await
            .unwrap();

        time::sleep(Duration::from_secs(12)).await;

        let fired = collect(&mut rx);
        assert_eq!(fired.len(), 1);
        assert_fired_between(&fired[0], Duration::from_secs(3), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_move_earlier_with_lap_margin() {
        let (wheel, mut rx) = recording_wheel(Duration::from_secs(1), 10);

        wheel
            .set_timer("job".to_string(), 1, Duration::from_secs(8))
            .await
            .unwrap();
        wheel
            .move_timer("job".to_string(), Duration::from_secs(13))
            .await
            .unwrap();

        time::sleep(Duration::from_secs(20)).await;

        let fired = collect(&mut rx);
        assert_eq!(fired.len(), 1);
        assert_fired_between(&fired[0], Duration::from_secs(13), Duration::from_secs(14));
    }

    #[tokio::test(start_paused = true)]
    async fn test_move_across_wrap_around() {
        let (wheel, mut rx) = recording_wheel(Duration::from_secs(1), 10);

        // Cursor at slot 7; "job" sits in slot 1 after the wrap
        time::sleep(Duration::from_secs(8)).await;
        wheel
            .set_timer("job".to_string(), 1, Duration::from_secs(4))
            .await
            .unwrap();
        wheel
            .move_timer("job".to_string(), Duration::from_secs(2))
            .await
            .unwrap();

        time::sleep(Duration::from_secs(12)).await;

        let fired = collect(&mut rx);
        assert_eq!(fired.len(), 1);
        assert_fired_between(&fired[0], Duration::from_secs(10), Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn test_move_below_interval_fires_immediately_once() {
        let (wheel, mut rx) = recording_wheel(Duration::from_secs(1), 10);

        wheel
            .set_timer("job".to_string(), 5, Duration::from_secs(5))
            .await
            .unwrap();
        wheel
            .move_timer("job".to_string(), Duration::from_millis(10))
            .await
            .unwrap();

        time::sleep(Duration::from_millis(100)).await;
        let fired = collect(&mut rx);
        assert_eq!(fired.len(), 1);
        assert!(fired[0].2 < Duration::from_secs(1));

        time::sleep(Duration::from_secs(10)).await;
        assert!(collect(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_below_interval_waits_for_delay() {
        let (wheel, mut rx) = recording_wheel(Duration::from_secs(1), 10);

        wheel
            .set_timer("job".to_string(), 1, Duration::from_secs(5))
            .await
            .unwrap();
        wheel
            .set_timer("job".to_string(), 2, Duration::from_millis(500))
            .await
            .unwrap();

        time::sleep(Duration::from_millis(400)).await;
        assert!(collect(&mut rx).is_empty());

        time::sleep(Duration::from_secs(10)).await;
        let fired = collect(&mut rx);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].1, 2);
        assert_fired_between(&fired[0], Duration::from_millis(500), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_delay_keeps_coordinator_alive() {
        let (wheel, mut rx) = recording_wheel(Duration::from_secs(1), 10);

        wheel
            .set_timer("forever".to_string(), 1, Duration::MAX)
            .await
            .unwrap();
        wheel
            .set_timer("soon".to_string(), 2, Duration::from_secs(2))
            .await
            .unwrap();
        wheel
            .move_timer("forever".to_string(), Duration::MAX)
            .await
            .unwrap();

        time::sleep(Duration::from_secs(5)).await;
        let fired = collect(&mut rx);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, "soon");
        assert!(!wheel.is_stopped());

        let drained = wheel.drain(|_, _| async {}).await.unwrap();
        assert_eq!(drained, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_move_unknown_key_is_noop() {
        let (wheel, mut rx) = recording_wheel(Duration::from_secs(1), 10);

        wheel
            .move_timer("ghost".to_string(), Duration::from_millis(10))
            .await
            .unwrap();
        time::sleep(Duration::from_secs(3)).await;

        assert!(collect(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_delay_is_ignored() {
        let (wheel, mut rx) = recording_wheel(Duration::from_secs(1), 10);

        wheel
            .set_timer("now".to_string(), 1, Duration::ZERO)
            .await
            .unwrap();
        time::sleep(Duration::from_secs(15)).await;

        assert!(collect(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_runs_each_live_timer_once() {
        let (wheel, mut rx) = recording_wheel(Duration::from_secs(1), 10);

        for (i, key) in ["a", "b", "c", "d"].iter().enumerate() {
            wheel
                .set_timer(key.to_string(), i as i32, Duration::from_secs(30 + i as u64))
                .await
                .unwrap();
        }
        wheel.remove_timer("c".to_string()).await.unwrap();

        let drained = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&drained);
        let count = wheel
            .drain(move |key: String, value: i32| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().push((key, value));
                }
            })
            .await
            .unwrap();

        assert_eq!(count, 3);
        let mut drained = drained.lock().clone();
        drained.sort();
        assert_eq!(
            drained,
            vec![
                ("a".to_string(), 0),
                ("b".to_string(), 1),
                ("d".to_string(), 3)
            ]
        );

        // Nothing left to fire
        time::sleep(Duration::from_secs(60)).await;
        assert!(collect(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_callback_does_not_stall_wheel() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let wheel = TimingWheel::new(Duration::from_secs(1), 10, move |key: &'static str, _: ()| {
            let counter = Arc::clone(&counter);
            async move {
                if key == "boom" {
                    panic!("callback failure");
                }
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

        wheel.set_timer("boom", (), Duration::from_secs(1)).await.unwrap();
        wheel.set_timer("ok", (), Duration::from_secs(2)).await.unwrap();
        wheel.set_timer("also-ok", (), Duration::from_secs(3)).await.unwrap();

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_rejects_commands() {
        let (wheel, mut rx) = recording_wheel(Duration::from_secs(1), 10);

        wheel
            .set_timer("job".to_string(), 1, Duration::from_secs(2))
            .await
            .unwrap();
        wheel.stop();
        wheel.stop();
        assert!(wheel.is_stopped());

        assert_matches!(
            wheel.set_timer("x".to_string(), 1, Duration::from_secs(1)).await,
            Err(Error::WheelStopped)
        );
        assert_matches!(wheel.remove_timer("x".to_string()).await, Err(Error::WheelStopped));
        assert_matches!(wheel.drain(|_, _| async {}).await, Err(Error::WheelStopped));

        time::sleep(Duration::from_secs(5)).await;
        assert!(collect(&mut rx).is_empty());
    }
}
