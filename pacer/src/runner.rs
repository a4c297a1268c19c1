//! Periodic runner: drives N workers issuing calls on an absolute
//! per-call schedule so the aggregate matches a target rate.
//!
//! Each worker owns its call adapter and its histogram for the whole run,
//! so the hot path takes no locks; the runner merges everything once the
//! workers have quiesced.

use chrono::{DateTime, Utc};
use pacer_core::{ConfigError, DistributionReport, Histogram};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
#[allow(unused)]
use tracing::{debug, error, info, trace, warn};

/// Lead time between worker spawn and the common first-call instant, so
/// all workers begin together.
const START_DELAY: Duration = Duration::from_millis(25);

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("setup failed: {0}")]
    Setup(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("worker failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Options shared by every protocol runner. Immutable once a run starts.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Target aggregate rate; <= 0 means unthrottled.
    pub qps: f64,
    pub num_workers: usize,
    /// `None` runs until interrupted; `Some(ZERO)` means "use `exactly`"
    /// and requires `exactly > 0`.
    pub duration: Option<Duration>,
    /// When > 0, run for exactly this many calls instead of a duration.
    pub exactly: u64,
    pub percentiles: Vec<f64>,
    /// Width of the finest histogram buckets, in seconds.
    pub resolution: f64,
    /// Origin of the histogram bucket schedule.
    pub offset: Duration,
    /// De-synchronize workers by a uniform offset of up to half a pacing
    /// interval per call.
    pub jitter: bool,
    pub run_id: String,
    pub labels: String,
    /// Suppress the abort policy on each worker's warmup call.
    pub allow_initial_errors: bool,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            qps: 8.0,
            num_workers: 4,
            duration: Some(Duration::from_secs(5)),
            exactly: 0,
            percentiles: vec![50.0, 75.0, 90.0, 99.0, 99.9],
            resolution: 0.001,
            offset: Duration::ZERO,
            jitter: false,
            run_id: String::new(),
            labels: String::new(),
            allow_initial_errors: false,
        }
    }
}

impl RunnerOptions {
    pub fn normalize(&mut self) -> Result<(), ConfigError> {
        if self.num_workers < 1 {
            self.num_workers = 1;
        }
        if self.resolution <= 0.0 {
            return Err(ConfigError::InvalidResolution(self.resolution));
        }
        if self.exactly == 0 && self.duration == Some(Duration::ZERO) {
            return Err(ConfigError::MissingRunLength);
        }
        for &p in &self.percentiles {
            if !(p > 0.0 && p <= 100.0) {
                return Err(ConfigError::InvalidPercentile(p.to_string()));
            }
        }
        Ok(())
    }

    pub fn unthrottled(&self) -> bool {
        self.qps <= 0.0
    }

    /// Warmup calls reported separately in the summary: one per worker in
    /// duration mode, none in exact mode.
    pub fn warmup(&self) -> u64 {
        if self.exactly > 0 {
            0
        } else {
            self.num_workers as u64
        }
    }
}

/// Result of one call: `ok` feeds the error tally, `abort` asks the
/// runner to stop the whole run (adapters set it when the configured
/// abort condition matched).
#[derive(Debug, Clone, Copy)]
pub struct CallOutcome {
    pub ok: bool,
    pub abort: bool,
}

impl CallOutcome {
    pub fn success() -> Self {
        Self {
            ok: true,
            abort: false,
        }
    }

    pub fn failure(abort: bool) -> Self {
        Self { ok: false, abort }
    }
}

/// One worker's call primitive. Implementations are thread-confined: the
/// runner hands each instance to exactly one worker for the whole run and
/// returns it afterwards so protocol runners can collect their tallies.
pub trait Caller: Send + 'static {
    fn call(&mut self) -> impl Future<Output = CallOutcome> + Send;
}

/// Cancellation handle observed by every worker before each sleep and
/// loop turn. Cloneable so the binary can wire it to Ctrl-C.
#[derive(Clone)]
pub struct Interrupt(Arc<watch::Sender<bool>>);

impl Interrupt {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self(Arc::new(tx))
    }

    pub fn trigger(&self) {
        let _ = self.0.send(true);
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.0.subscribe()
    }
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::new()
    }
}

/// Protocol-agnostic portion of a run result, flattened into each
/// protocol's report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RunnerResult {
    pub run_type: String,
    pub labels: String,
    #[serde(rename = "RunID")]
    pub run_id: String,
    pub start_time: DateTime<Utc>,
    #[serde(rename = "RequestedQPS")]
    pub requested_qps: String,
    pub requested_duration: String,
    #[serde(rename = "ActualQPS")]
    pub actual_qps: f64,
    /// Seconds from the common start instant to the last call completion.
    pub actual_duration: f64,
    pub num_threads: usize,
    pub exactly: u64,
    pub jitter: bool,
    pub error_count: u64,
    pub aborted: bool,
    pub duration_histogram: DistributionReport,
}

#[derive(Debug)]
pub struct RunOutput<C> {
    pub result: RunnerResult,
    /// Callers handed back in worker order for protocol-specific tallying.
    pub callers: Vec<C>,
}

struct WorkerPlan {
    idx: usize,
    t0: Instant,
    deadline: Option<Instant>,
    /// Pacing interval in seconds; `None` when unthrottled.
    interval: Option<f64>,
    jitter: bool,
    exactly: u64,
    tickets: Option<Arc<AtomicU64>>,
    allow_initial_errors: bool,
    offset: f64,
    resolution: f64,
}

struct WorkerOutput<C> {
    caller: C,
    histogram: Histogram,
    errors: u64,
    aborted: bool,
    last_end: Option<Instant>,
}

/// Runs `callers` against the schedule described by `opts` and merges the
/// per-worker measurements. `interrupt` stops the run at the next
/// scheduling point of each worker; in-flight calls always complete.
pub async fn run<C: Caller>(
    opts: &RunnerOptions,
    callers: Vec<C>,
    run_type: &str,
    interrupt: Interrupt,
) -> Result<RunOutput<C>, RunnerError> {
    let mut opts = opts.clone();
    opts.normalize()?;
    if callers.len() != opts.num_workers {
        return Err(RunnerError::Setup(format!(
            "expected {} callers, got {}",
            opts.num_workers,
            callers.len()
        )));
    }

    let start_time = Utc::now();
    let t0 = Instant::now() + START_DELAY;
    let deadline = if opts.exactly > 0 {
        None
    } else {
        opts.duration.map(|d| t0 + d)
    };
    let tickets = (opts.exactly > 0).then(|| Arc::new(AtomicU64::new(0)));
    let interval = (!opts.unthrottled()).then(|| opts.num_workers as f64 / opts.qps);

    info!(
        run_type,
        qps = opts.qps,
        workers = opts.num_workers,
        jitter = opts.jitter,
        "starting run"
    );

    let mut handles = Vec::with_capacity(callers.len());
    for (idx, caller) in callers.into_iter().enumerate() {
        let plan = WorkerPlan {
            idx,
            t0,
            deadline,
            interval,
            jitter: opts.jitter,
            exactly: opts.exactly,
            tickets: tickets.clone(),
            allow_initial_errors: opts.allow_initial_errors,
            offset: opts.offset.as_secs_f64(),
            resolution: opts.resolution,
        };
        handles.push(tokio::spawn(worker_loop(
            caller,
            plan,
            interrupt.clone(),
            interrupt.subscribe(),
        )));
    }

    let mut merged = Histogram::new(opts.offset.as_secs_f64(), opts.resolution);
    let mut callers_back = Vec::with_capacity(handles.len());
    let mut error_count = 0u64;
    let mut aborted = false;
    let mut last_end: Option<Instant> = None;
    for handle in handles {
        let out = handle.await?;
        merged
            .merge(&out.histogram)
            .expect("per-worker histograms share one schedule");
        error_count += out.errors;
        aborted |= out.aborted;
        if let Some(end) = out.last_end {
            last_end = Some(last_end.map_or(end, |cur| cur.max(end)));
        }
        callers_back.push(out.caller);
    }

    let elapsed = last_end.map_or(0.0, |end| end.duration_since(t0).as_secs_f64());
    let actual_qps = if elapsed > 0.0 {
        merged.count() as f64 / elapsed
    } else {
        0.0
    };

    if cfg!(feature = "metrics") {
        metrics::counter!("pacer_runs_total").increment(1);
        metrics::gauge!("pacer_last_run_qps").set(actual_qps);
    }

    info!(
        count = merged.count(),
        errors = error_count,
        aborted,
        qps = actual_qps,
        "run complete"
    );

    let requested_qps = if opts.unthrottled() {
        "max".to_string()
    } else {
        format!("{}", opts.qps)
    };
    let requested_duration = if opts.exactly > 0 {
        format!("exactly {} calls", opts.exactly)
    } else {
        match opts.duration {
            Some(d) => humantime::format_duration(d).to_string(),
            None => "until interrupted".to_string(),
        }
    };

    let result = RunnerResult {
        run_type: run_type.to_string(),
        labels: opts.labels.clone(),
        run_id: opts.run_id.clone(),
        start_time,
        requested_qps,
        requested_duration,
        actual_qps,
        actual_duration: elapsed,
        num_threads: opts.num_workers,
        exactly: opts.exactly,
        jitter: opts.jitter,
        error_count,
        aborted,
        duration_histogram: merged.export(&opts.percentiles),
    };
    Ok(RunOutput {
        result,
        callers: callers_back,
    })
}

async fn worker_loop<C: Caller>(
    mut caller: C,
    plan: WorkerPlan,
    interrupt: Interrupt,
    mut cancel: watch::Receiver<bool>,
) -> WorkerOutput<C> {
    let mut histogram = Histogram::new(plan.offset, plan.resolution);
    let mut errors = 0u64;
    let mut aborted = false;
    let mut last_end = None;
    let mut rng = SmallRng::from_entropy();

    // Common start barrier.
    tokio::select! {
        _ = tokio::time::sleep_until(plan.t0) => {}
        _ = cancel.changed() => {
            return WorkerOutput { caller, histogram, errors, aborted, last_end };
        }
    }

    let mut k: u64 = 0;
    loop {
        if *cancel.borrow() {
            break;
        }
        if let Some(interval) = plan.interval {
            // The k-th call is scheduled at T0 + k * interval; jitter
            // shifts each instant independently, not cumulatively.
            let mut sched = k as f64 * interval;
            if plan.jitter {
                sched += rng.gen_range(-interval / 2.0..interval / 2.0);
            }
            let target = plan.t0 + Duration::from_secs_f64(sched.max(0.0));
            if let Some(deadline) = plan.deadline {
                if target >= deadline {
                    break;
                }
            }
            if target > Instant::now() {
                tokio::select! {
                    _ = tokio::time::sleep_until(target) => {}
                    _ = cancel.changed() => break,
                }
            }
        }
        if let Some(deadline) = plan.deadline {
            if Instant::now() >= deadline {
                break;
            }
        }
        if let Some(tickets) = &plan.tickets {
            if tickets.fetch_add(1, Ordering::Relaxed) >= plan.exactly {
                break;
            }
        }

        let start = Instant::now();
        let outcome = caller.call().await;
        let end = Instant::now();
        histogram.record_duration(end - start);
        last_end = Some(end);
        if !outcome.ok {
            errors += 1;
            let warmup_call = plan.tickets.is_none() && k == 0;
            if outcome.abort && !(warmup_call && plan.allow_initial_errors) {
                warn!(worker = plan.idx, "abort condition matched, stopping run");
                aborted = true;
                interrupt.trigger();
            }
        }
        k += 1;
    }

    trace!(worker = plan.idx, calls = k, "worker quiescing");
    WorkerOutput {
        caller,
        histogram,
        errors,
        aborted,
        last_end,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_distr::{Distribution, Normal};

    #[derive(Debug)]
    struct SleepCaller {
        delay: Duration,
        noise_ms: f64,
        calls: u64,
    }

    impl SleepCaller {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                noise_ms: 0.0,
                calls: 0,
            }
        }
    }

    impl Caller for SleepCaller {
        fn call(&mut self) -> impl Future<Output = CallOutcome> + Send {
            self.calls += 1;
            let mut delay = self.delay;
            if self.noise_ms > 0.0 {
                let normal = Normal::new(0.0, self.noise_ms).unwrap();
                let extra: f64 = normal.sample(&mut rand::thread_rng()).max(0.0);
                delay += Duration::from_secs_f64(extra / 1000.0);
            }
            async move {
                tokio::time::sleep(delay).await;
                CallOutcome::success()
            }
        }
    }

    struct FailingCaller {
        abort_after: u64,
        calls: u64,
    }

    impl Caller for FailingCaller {
        fn call(&mut self) -> impl Future<Output = CallOutcome> + Send {
            self.calls += 1;
            let fail = self.calls > self.abort_after;
            async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                if fail {
                    CallOutcome::failure(true)
                } else {
                    CallOutcome::success()
                }
            }
        }
    }

    fn exact_opts(exactly: u64, workers: usize) -> RunnerOptions {
        RunnerOptions {
            qps: 0.0,
            num_workers: workers,
            duration: None,
            exactly,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn exact_mode_completes_exactly_n_calls() {
        let opts = exact_opts(25, 3);
        let callers = (0..3)
            .map(|_| SleepCaller::new(Duration::from_millis(1)))
            .collect();
        let out = run(&opts, callers, "TEST", Interrupt::new()).await.unwrap();
        assert_eq!(out.result.duration_histogram.count, 25);
        let issued: u64 = out.callers.iter().map(|c| c.calls).sum();
        assert_eq!(issued, 25);
        assert_eq!(out.result.error_count, 0);
        assert!(!out.result.aborted);
    }

    #[tokio::test]
    async fn exact_mode_ignores_qps_zero_warmup() {
        let opts = RunnerOptions {
            exactly: 10,
            num_workers: 2,
            qps: 0.0,
            duration: None,
            ..Default::default()
        };
        assert_eq!(opts.warmup(), 0);
        let callers = (0..2)
            .map(|_| SleepCaller::new(Duration::from_micros(100)))
            .collect();
        let out = run(&opts, callers, "TEST", Interrupt::new()).await.unwrap();
        assert_eq!(out.result.duration_histogram.count, 10);
        assert_eq!(out.result.requested_duration, "exactly 10 calls");
    }

    #[tokio::test]
    async fn duration_mode_hits_target_rate() {
        let opts = RunnerOptions {
            qps: 100.0,
            num_workers: 2,
            duration: Some(Duration::from_millis(1500)),
            ..Default::default()
        };
        let callers = (0..2)
            .map(|_| {
                let mut c = SleepCaller::new(Duration::from_millis(1));
                c.noise_ms = 0.2;
                c
            })
            .collect();
        let out = run(&opts, callers, "TEST", Interrupt::new()).await.unwrap();
        let count = out.result.duration_histogram.count;
        // 100 qps for 1.5s; generous bounds for loaded CI machines.
        assert!((100..=175).contains(&count), "count was {count}");
        assert!(out.result.actual_qps > 60.0, "qps {}", out.result.actual_qps);
        assert_eq!(opts.warmup(), 2);
    }

    #[tokio::test]
    async fn abort_stops_all_workers() {
        let opts = RunnerOptions {
            qps: 0.0,
            num_workers: 2,
            duration: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        let callers = (0..2)
            .map(|_| FailingCaller {
                abort_after: 3,
                calls: 0,
            })
            .collect();
        let start = Instant::now();
        let out = run(&opts, callers, "TEST", Interrupt::new()).await.unwrap();
        assert!(out.result.aborted);
        assert!(out.result.error_count >= 1);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn interrupt_ends_open_ended_run() {
        let opts = RunnerOptions {
            qps: 50.0,
            num_workers: 1,
            duration: None,
            ..Default::default()
        };
        let interrupt = Interrupt::new();
        let trigger = interrupt.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.trigger();
        });
        let callers = vec![SleepCaller::new(Duration::from_millis(1))];
        let out = run(&opts, callers, "TEST", interrupt).await.unwrap();
        assert!(!out.result.aborted);
        assert_eq!(out.result.requested_duration, "until interrupted");
        assert!(out.result.duration_histogram.count < 100);
    }

    #[tokio::test]
    async fn both_zero_run_lengths_are_rejected() {
        let opts = RunnerOptions {
            duration: Some(Duration::ZERO),
            exactly: 0,
            ..Default::default()
        };
        let callers = vec![SleepCaller::new(Duration::from_millis(1))];
        let err = run(&opts, callers, "TEST", Interrupt::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RunnerError::Config(ConfigError::MissingRunLength)
        ));
    }

    #[tokio::test]
    async fn unjittered_single_worker_paces_evenly() {
        let opts = RunnerOptions {
            qps: 50.0,
            num_workers: 1,
            duration: Some(Duration::from_secs(1)),
            ..Default::default()
        };
        let callers = vec![SleepCaller::new(Duration::from_micros(200))];
        let out = run(&opts, callers, "TEST", Interrupt::new()).await.unwrap();
        let count = out.result.duration_histogram.count;
        assert!((35..=60).contains(&count), "count was {count}");
    }
}
