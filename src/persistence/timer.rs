//! Periodic flush scheduler.

use super::worker::{FlushReport, MetricsPersistentWorker};
use crate::core::{KestrelError, Result};
use crossbeam_channel::{select, tick, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

enum Command {
    /// Flush now; answer on the sender when done.
    Flush(Option<Sender<FlushReport>>),
    Stop,
}

/// Runs the flush cycle of a fixed set of workers on its own thread.
///
/// Workers are flushed in the given order, so minute workers listed first
/// hand their deltas to the coarser levels within the same cycle.
pub struct PersistenceTimer {
    commands: Sender<Command>,
    handle: Mutex<Option<JoinHandle<()>>>,
    cycles: Arc<AtomicU64>,
    interval: Duration,
}

impl PersistenceTimer {
    pub fn start(workers: Vec<Arc<MetricsPersistentWorker>>, interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(KestrelError::config("flush interval must be positive"));
        }

        let (commands, rx) = unbounded();
        let cycles = Arc::new(AtomicU64::new(0));
        let loop_cycles = Arc::clone(&cycles);

        let handle = thread::Builder::new()
            .name("persistence-timer".to_string())
            .spawn(move || run(&workers, interval, &rx, &loop_cycles))?;

        info!(interval_ms = interval.as_millis() as u64, "Persistence timer started");
        Ok(PersistenceTimer {
            commands,
            handle: Mutex::new(Some(handle)),
            cycles,
            interval,
        })
    }

    /// Requests a flush outside the schedule and returns immediately.
    pub fn trigger(&self) {
        if self.commands.send(Command::Flush(None)).is_err() {
            debug!("Flush trigger ignored, timer stopped");
        }
    }

    /// Flushes every worker and waits for the cycle to finish.
    pub fn flush_now(&self) -> Result<FlushReport> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.commands
            .send(Command::Flush(Some(tx)))
            .map_err(|_| KestrelError::ChannelClosed)?;
        rx.recv().map_err(|_| KestrelError::ChannelClosed)
    }

    /// Completed flush cycles, scheduled and forced.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Runs one last cycle and stops the timer thread. Idempotent.
    pub fn shutdown(&self) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        let _ = self.commands.send(Command::Stop);
        if handle.join().is_err() {
            error!("Persistence timer thread panicked");
        }
        info!(cycles = self.cycles(), "Persistence timer stopped");
    }
}

impl Drop for PersistenceTimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(
    workers: &[Arc<MetricsPersistentWorker>],
    interval: Duration,
    commands: &Receiver<Command>,
    cycles: &AtomicU64,
) {
    let ticker = tick(interval);
    loop {
        select! {
            recv(ticker) -> _ => {
                flush_all(workers, cycles);
            },
            recv(commands) -> command => match command {
                Ok(Command::Flush(reply)) => {
                    let report = flush_all(workers, cycles);
                    if let Some(reply) = reply {
                        let _ = reply.send(report);
                    }
                },
                Ok(Command::Stop) | Err(_) => {
                    flush_all(workers, cycles);
                    break;
                },
            },
        }
    }
}

fn flush_all(workers: &[Arc<MetricsPersistentWorker>], cycles: &AtomicU64) -> FlushReport {
    let started = Instant::now();
    let mut total = FlushReport::default();
    for worker in workers {
        let report = worker.flush();
        total.records += report.records;
        total.written += report.written;
        total.lost += report.lost;
        total.forwarded += report.forwarded;
    }
    cycles.fetch_add(1, Ordering::Relaxed);

    if total.records > 0 {
        debug!(
            records = total.records,
            written = total.written,
            lost = total.lost,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Flush cycle finished"
        );
    }
    total
}
