use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rand::Rng;
use sentry::SentryFutureExt;
use serde::Deserialize;
use sketches_ddsketch::DDSketch;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;

use batcher_service::caching::{Scheduler, Value};
use batcher_service::config::Config;

#[derive(Debug, Deserialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

/// A synthetic workload hammering the scheduler.
#[derive(Debug, Clone, Deserialize)]
pub struct Workload {
    /// How many calls are in flight at the same time.
    pub concurrency: usize,
    /// The number of distinct keys calls are spread over.
    pub keys: usize,
    /// How long each producer takes.
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
    /// The share of producers that fail, between `0` and `1`.
    #[serde(default)]
    pub failure_rate: f64,
    /// A per-call TTL, the configured default is used otherwise.
    #[serde(default, with = "humantime_serde")]
    pub ttl: Option<Duration>,
}

impl WorkloadsConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = File::open(path).context("failed to open workloads file")?;
        let config: Self =
            serde_yaml::from_reader(file).context("failed to parse workloads YAML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (i, workload) in self.workloads.iter().enumerate() {
            anyhow::ensure!(workload.concurrency > 0, "workload {i}: concurrency must be positive");
            anyhow::ensure!(workload.keys > 0, "workload {i}: keys must be positive");
            anyhow::ensure!(
                (0.0..=1.0).contains(&workload.failure_rate),
                "workload {i}: failure_rate must be between 0 and 1"
            );
        }
        Ok(())
    }
}

struct WorkloadReport {
    concurrency: usize,
    errors: usize,
    task_durations: DDSketch,
}

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let scheduler = Scheduler::<Value>::new(&config, Handle::current())
        .context("failed to start the scheduler")?;

    let reports = run_workloads(&scheduler, workloads, duration).await?;

    for (i, report) in reports.into_iter().enumerate() {
        let WorkloadReport {
            concurrency,
            errors,
            task_durations,
        } = report;

        let ops = task_durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!(
            "Workload {i} (concurrency: {concurrency}): {ops} operations, {errors} errors, {ops_ps:.2} ops/s"
        );
        if ops == 0 {
            continue;
        }

        let quantile = |q| {
            let value = task_durations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(value)
        };
        let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
        let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }
    println!();

    let metrics = serde_json::to_string_pretty(&scheduler.metrics())?;
    println!("Scheduler metrics: {metrics}");

    scheduler.shutdown().await;
    Ok(())
}

/// Runs all workloads concurrently until `duration` has passed.
///
/// Calls that are still running at the deadline are waited for, and counted.
async fn run_workloads(
    scheduler: &Scheduler,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<Vec<WorkloadReport>> {
    let start = Instant::now();
    let deadline = tokio::time::Instant::from_std(start + duration);

    let mut tasks = Vec::with_capacity(workloads.workloads.len());
    for (i, workload) in workloads.workloads.into_iter().enumerate() {
        let scheduler = scheduler.clone();
        tracing::info!(
            "Starting workload {i} with {} keys and a latency of {}",
            workload.keys,
            humantime::format_duration(workload.latency),
        );

        let task = tokio::spawn(async move {
            let concurrency = workload.concurrency;
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let errors = Arc::new(AtomicUsize::new(0));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let scheduler = scheduler.clone();
                        let task_durations = Arc::clone(&task_durations);
                        let errors = Arc::clone(&errors);

                        let (key, fail) = {
                            let mut rng = rand::thread_rng();
                            let key = rng.gen_range(0..workload.keys);
                            (key, rng.gen_bool(workload.failure_rate))
                        };
                        let latency = workload.latency;
                        let ttl = workload.ttl;

                        let future = async move {
                            let task_start = Instant::now();
                            let producer = move || async move {
                                tokio::time::sleep(latency).await;
                                anyhow::ensure!(!fail, "simulated failure");
                                Ok(Value::Int(key as i64))
                            };

                            let result = scheduler
                                .call(&format!("workload-{i}/key-{key}"), producer, ttl)
                                .await;
                            if result.is_err() {
                                errors.fetch_add(1, Ordering::Relaxed);
                            }

                            task_durations.lock().unwrap().add(task_start.elapsed().as_secs_f64());

                            drop(permit);
                        };
                        tokio::spawn(future.bind_hub(sentry::Hub::new_from_top(sentry::Hub::current())));
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let task_durations: DDSketch = {
                let mut task_durations = task_durations.lock().unwrap();
                std::mem::take(&mut task_durations)
            };

            WorkloadReport {
                concurrency,
                errors: errors.load(Ordering::Relaxed),
                task_durations,
            }
        });
        tasks.push(task);
    }

    let mut reports = Vec::with_capacity(tasks.len());
    for task in futures::future::join_all(tasks).await {
        reports.push(task.context("workload task failed")?);
    }
    Ok(reports)
}
