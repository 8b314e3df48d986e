use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{at, bounded, select, tick, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, warn};

use crate::config::StageTiming;
use crate::engine::pool::UserPool;
use crate::engine::vu::VirtualUser;

const RAMP_STEPS_PER_SEC: f64 = 10.0;
const RAMP_TICK: Duration = Duration::from_millis(100);

/// Deadline-backed cancellation token, one per stage. Cancellation is
/// observed, never forced: in-flight HTTP finishes under the client timeout
/// and scripting calls run to completion.
#[derive(Clone)]
pub struct StageToken {
    deadline: Instant,
    cancelled: Arc<AtomicBool>,
}

impl StageToken {
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed) || Instant::now() >= self.deadline
    }

    /// The explicit cancel signal alone, deadline excluded. The ramp
    /// controller schedules its last step on the deadline itself and must
    /// not be cut by it.
    fn cancel_requested(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// Drive one stage: ramp the shared active-user count, dispatch one work
/// unit per second to each active worker, and wind everything down at the
/// deadline. Returns the ending active-user count, which the next stage
/// picks up as its starting point.
pub fn run_stage(
    target: usize,
    timing: StageTiming,
    start: usize,
    pool: &UserPool,
    progress: bool,
) -> usize {
    let deadline = Instant::now() + timing.duration;
    let token = StageToken::with_deadline(deadline);
    let active = Arc::new(AtomicUsize::new(start));

    thread::scope(|scope| {
        {
            let token = token.clone();
            let active = active.clone();
            scope.spawn(move || ramp_controller(&active, &token, start, target, timing));
        }

        let mut work_slots: Vec<Sender<()>> = Vec::with_capacity(target);
        for _ in 0..target {
            let (work_tx, work_rx) = bounded::<()>(1);
            work_slots.push(work_tx);
            let token = token.clone();
            scope.spawn(move || {
                let user = pool.fetch();
                worker(&user, work_rx, &token);
                pool.release(user);
            });
        }

        if progress {
            let token = token.clone();
            scope.spawn(move || progress_reporter(&token, timing.duration));
        }

        dispatcher(&work_slots, &active, &token);

        token.cancel();
        drop(work_slots);
    });

    active.load(Ordering::Relaxed)
}

/// Adjust `active` from `start` to `target` and back in two linear pieces
/// with a plateau between them, at 10 steps per second. A zero ramp-up
/// assigns the target in one step; a zero ramp-down leaves the plateau value
/// in place so it carries into the next stage.
fn ramp_controller(
    active: &AtomicUsize,
    token: &StageToken,
    start: usize,
    target: usize,
    timing: StageTiming,
) {
    if !ramp_segment(active, token, start, target, Instant::now(), timing.ramp_up) {
        return;
    }

    let ramp_down_at = token.deadline() - timing.ramp_down;
    while Instant::now() < ramp_down_at {
        if token.is_cancelled() {
            return;
        }
        thread::sleep(RAMP_TICK.min(ramp_down_at.saturating_duration_since(Instant::now())));
    }

    if !timing.ramp_down.is_zero() {
        ramp_segment(active, token, target, start, ramp_down_at, timing.ramp_down);
    }
}

/// Step `active` linearly from `from` to `to` over `window`, with ticks
/// scheduled against `anchor` so the last step lands on the window edge even
/// when the controller wakes late. Returns false if cancellation cut the
/// segment short.
fn ramp_segment(
    active: &AtomicUsize,
    token: &StageToken,
    from: usize,
    to: usize,
    anchor: Instant,
    window: Duration,
) -> bool {
    if window.is_zero() {
        active.store(to, Ordering::Relaxed);
        return true;
    }

    let steps = (window.as_secs_f64() * RAMP_STEPS_PER_SEC).round().max(1.0) as u32;
    for i in 1..=steps {
        let next_tick = anchor + RAMP_TICK * i;
        while Instant::now() < next_tick {
            if token.cancel_requested() {
                return false;
            }
            thread::sleep(RAMP_TICK.min(next_tick.saturating_duration_since(Instant::now())));
        }
        active.store(ramp_value(from, to, steps, i), Ordering::Relaxed);
    }
    true
}

/// Rounded linear interpolation between `from` and `to` after `i` of
/// `steps` ticks.
fn ramp_value(from: usize, to: usize, steps: u32, i: u32) -> usize {
    let span = to as f64 - from as f64;
    (from as f64 + span / steps as f64 * i as f64).round().max(0.0) as usize
}

/// Once per second, hand one work unit to each of the first `active`
/// workers. Sends are non-blocking: a worker still busy with the previous
/// iteration simply misses the tick, which is the backpressure contract.
fn dispatcher(work_slots: &[Sender<()>], active: &AtomicUsize, token: &StageToken) {
    let ticker = tick(Duration::from_secs(1));
    let stop = at(token.deadline());
    loop {
        select! {
            recv(stop) -> _ => break,
            recv(ticker) -> _ => {
                let n = active.load(Ordering::Relaxed).min(work_slots.len());
                for slot in &work_slots[..n] {
                    let _ = slot.try_send(());
                }
            }
        }
    }
}

/// Worker loop: wait for cancellation or a work unit, run one iteration per
/// unit. Channel closure and the deadline both end the loop; the caller
/// returns the user to the pool.
fn worker(user: &VirtualUser, work: crossbeam_channel::Receiver<()>, token: &StageToken) {
    let stop = at(token.deadline());
    loop {
        select! {
            recv(stop) -> _ => break,
            recv(work) -> unit => {
                if unit.is_err() || token.is_cancelled() {
                    break;
                }
                if let Err(err) = user.run(token) {
                    warn!("{err:#}");
                }
            }
        }
    }
    debug!("worker finished");
}

fn progress_reporter(token: &StageToken, duration: Duration) {
    let bar = ProgressBar::new(duration.as_secs().max(1));
    bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40}] {pos}/{len}s")
            .expect("static progress template")
            .progress_chars("=>-"),
    );

    let started = Instant::now();
    let ticker = tick(Duration::from_secs(1));
    let stop = at(token.deadline());
    loop {
        select! {
            recv(stop) -> _ => break,
            recv(ticker) -> _ => {
                bar.set_position(started.elapsed().as_secs().min(bar.length().unwrap_or(0)));
            }
        }
    }
    bar.set_position(bar.length().unwrap_or(0));
    bar.finish();
}
