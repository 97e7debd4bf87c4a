//! The job factory: a thread-safe, strictly-increasing stream of
//! `(item, index)` pairs shared by every driver in a pool, with an optional
//! token-bucket throttle.

use fanout_base::proto::JobPayload;
use rand::Rng as _;
use std::sync::mpsc::Receiver;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

/*              _     _ _
 *  _ __  _   _| |__ | (_) ___
 * | '_ \| | | | '_ \| | |/ __|
 * | |_) | |_| | |_) | | | (__
 * | .__/ \__,_|_.__/|_|_|\___|
 * |_|
 *  FIGLET: public
 */

/// What a producer closure hands back on each call.
pub enum Produced<I> {
    Item(I),
    /// End of stream. The producer is not called again once this is seen.
    Stop,
}

/// Where jobs come from. Array-mode sources have a known length and are
/// addressable by index; producer-mode sources are pulled one item at a time
/// until they signal [`Produced::Stop`].
pub enum Source<I> {
    Items(Vec<I>),
    Producer(Box<dyn FnMut() -> Produced<I> + Send>),
}

impl<I> Source<I> {
    pub fn from_fn(producer: impl FnMut() -> Produced<I> + Send + 'static) -> Self {
        Source::Producer(Box::new(producer))
    }

    /// A queue-like source: items are popped off the channel until every
    /// sender is gone, which ends the stream.
    pub fn from_receiver(receiver: Receiver<I>) -> Self
    where
        I: Send + 'static,
    {
        Source::from_fn(move || match receiver.recv() {
            Ok(item) => Produced::Item(item),
            Err(_) => Produced::Stop,
        })
    }
}

impl<I> From<Vec<I>> for Source<I> {
    fn from(items: Vec<I>) -> Self {
        Source::Items(items)
    }
}

impl<I> FromIterator<I> for Source<I> {
    fn from_iter<T: IntoIterator<Item = I>>(iter: T) -> Self {
        Source::Items(iter.into_iter().collect())
    }
}

pub struct JobFactory<I> {
    /// Array-mode items, read outside the lock once an index is claimed.
    items: Vec<I>,
    producer_mode: bool,
    shared: Mutex<Shared<I>>,
    gate: Option<RateGate>,
}

impl<I: Clone> JobFactory<I> {
    pub fn new(source: Source<I>, jobs_per_second: Option<u32>) -> Self {
        let (items, producer, producer_mode) = match source {
            Source::Items(items) => (items, None, false),
            Source::Producer(producer) => (vec![], Some(producer), true),
        };
        JobFactory {
            items,
            producer_mode,
            shared: Mutex::new(Shared {
                next_index: 0,
                stopped: false,
                producer,
            }),
            gate: jobs_per_second.map(RateGate::new),
        }
    }

    /// The next `(item, index)` pair, or `None` once the source is exhausted.
    /// Indices are unique and dense from 0 across all callers. Throttle
    /// admission runs before the source lock is taken, so a throttled caller
    /// never holds up the others.
    pub fn next(&self) -> Option<(I, usize)> {
        if let Some(gate) = &self.gate {
            loop {
                if self.exhausted() {
                    return None;
                }
                if gate.admit() {
                    break;
                }
                let pause = rand::thread_rng().gen_range(1..TICK_MS);
                thread::sleep(Duration::from_millis(pause));
            }
        }

        let mut shared = self.shared.lock().unwrap();
        if shared.producer.is_some() {
            if shared.stopped {
                return None;
            }
            match (shared.producer.as_mut().unwrap())() {
                Produced::Stop => {
                    shared.stopped = true;
                    None
                }
                Produced::Item(item) => {
                    let index = shared.next_index;
                    shared.next_index += 1;
                    Some((item, index))
                }
            }
        } else {
            let index = shared.next_index;
            if index >= self.items.len() {
                return None;
            }
            shared.next_index += 1;
            drop(shared);
            Some((self.items[index].clone(), index))
        }
    }

    /// `None` means unbounded (producer-mode).
    pub fn size(&self) -> Option<usize> {
        if self.producer_mode {
            None
        } else {
            Some(self.items.len())
        }
    }

    /// The wire form of a job: array-mode workers hold their own copy of the
    /// items, so only the index travels.
    pub fn pack(&self, item: I, index: usize) -> JobPayload<I> {
        if self.producer_mode {
            JobPayload::Item(item, index)
        } else {
            JobPayload::Index(index)
        }
    }

    pub fn unpack(&self, payload: JobPayload<I>) -> (I, usize) {
        match payload {
            JobPayload::Index(index) => (self.items[index].clone(), index),
            JobPayload::Item(item, index) => (item, index),
        }
    }

    /// Hand the source back once dispatch is over. Array-mode items come back
    /// intact; a producer comes back exhausted.
    pub fn into_source(self) -> Source<I> {
        match self.shared.into_inner().unwrap().producer {
            Some(producer) => Source::Producer(producer),
            None => Source::Items(self.items),
        }
    }

    fn exhausted(&self) -> bool {
        let shared = self.shared.lock().unwrap();
        if self.producer_mode {
            shared.stopped
        } else {
            shared.next_index >= self.items.len()
        }
    }
}

/*             _            _
 *  _ __  _ __(_)_   ____ _| |_ ___
 * | '_ \| '__| \ \ / / _` | __/ _ \
 * | |_) | |  | |\ V / (_| | ||  __/
 * | .__/|_|  |_| \_/ \__,_|\__\___|
 * |_|
 *  FIGLET: private
 */

struct Shared<I> {
    next_index: usize,
    stopped: bool,
    producer: Option<Box<dyn FnMut() -> Produced<I> + Send>>,
}

const TICK_MS: u64 = 100;

/// Strict token bucket: at most `jobs_per_tick` admissions per 100 ms tick
/// across the whole pool. The call counter resets whenever the tick changes.
struct RateGate {
    epoch: Instant,
    jobs_per_tick: u64,
    state: Mutex<GateState>,
}

#[derive(Default)]
struct GateState {
    tick: u64,
    calls: u64,
}

impl RateGate {
    fn new(jobs_per_second: u32) -> Self {
        RateGate {
            epoch: Instant::now(),
            jobs_per_tick: (u64::from(jobs_per_second) * TICK_MS).div_ceil(1000),
            state: Mutex::new(GateState::default()),
        }
    }

    fn admit(&self) -> bool {
        let tick = self.epoch.elapsed().as_millis() as u64 / TICK_MS;
        self.admit_at(tick)
    }

    fn admit_at(&self, tick: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.tick != tick {
            state.tick = tick;
            state.calls = 0;
        }
        if state.calls < self.jobs_per_tick {
            state.calls += 1;
            true
        } else {
            false
        }
    }
}

/*  _            _
 * | |_ ___  ___| |_ ___
 * | __/ _ \/ __| __/ __|
 * | ||  __/\__ \ |_\__ \
 *  \__\___||___/\__|___/
 *  FIGLET: tests
 */
