//! Background jobs with per-job completion callbacks
//!
//! `joblib` below plays the part of a C library whose completion callback is
//! a bare function pointer with no user-data slot. Each job still gets its own
//! callback that knows which job it belongs to.
//!
//! ```text
//! cargo run -p atlas-trampoline --example background_jobs -- 5
//! RUST_LOG=atlas_trampoline=debug cargo run -p atlas-trampoline --example background_jobs -- 3
//! ```

#![cfg_attr(test, allow(dead_code))]

use anyhow::{bail, Context, Result};
use atlas_trampoline::{wrap_shared, ClosureBuilder, TrampolineConfig};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod joblib {
    use std::any::Any;
    use std::sync::{Mutex, PoisonError};
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    pub type JobCallback = unsafe extern "C" fn(result: f64);

    #[repr(C)]
    pub struct Job {
        pub param: f64,
        pub on_done: JobCallback,
    }

    pub(crate) static RUNNING: Mutex<Vec<JoinHandle<()>>> = Mutex::new(Vec::new());

    /// Start `job` in the background; `on_done` runs on an unspecified thread
    pub extern "C" fn start_job(job: Job) {
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis((job.param * 10.0) as u64));
            unsafe { (job.on_done)(job.param * job.param) };
        });
        RUNNING
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(worker);
    }

    /// Wait until every started job finished and its callback returned
    ///
    /// Returns the number of workers that panicked.
    pub extern "C" fn join() -> u32 {
        let workers = std::mem::take(&mut *RUNNING.lock().unwrap_or_else(PoisonError::into_inner));
        let mut failed = 0;
        for worker in workers {
            if let Err(cause) = worker.join() {
                tracing::error!(cause = panic_message(&*cause), "job worker panicked");
                failed += 1;
            }
        }
        failed
    }

    fn panic_message(cause: &(dyn Any + Send)) -> &str {
        cause
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| cause.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("non-string panic payload")
    }
}

/// Start background jobs and report their results through per-job callbacks
#[derive(Parser)]
#[command(name = "background_jobs")]
struct Cli {
    /// Number of jobs to start
    jobs: u32,

    /// Trampoline configuration file ([trampoline] section)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => TrampolineConfig::load_from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => TrampolineConfig::default(),
    }
    .apply_env_overrides()
    .context("Invalid trampoline environment override")?;
    let builder = ClosureBuilder::from_config(&config).context("Invalid trampoline configuration")?;

    // Built up front so a failure cannot drop a pointer a running job still
    // holds. The handles are kept until join() returns.
    let callbacks = (0..cli.jobs)
        .map(|job_number| {
            builder.build_shared(move |result: f64| {
                println!("Job #{job_number} completed with result {result}");
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to create job callbacks")?;

    for (job_number, callback) in (0..cli.jobs).zip(&callbacks) {
        joblib::start_job(joblib::Job {
            param: f64::from(job_number * 7 % 10),
            on_done: callback.pointer(),
        });
    }

    let failed = joblib::join();
    if failed > 0 {
        bail!("{failed} of {} jobs failed", cli.jobs);
    }
    info!(jobs = cli.jobs, "all jobs finished");

    // A one-off callback built without the config
    let summary = wrap_shared(|count: u32| info!(count, "releasing callbacks"))?;
    unsafe { (summary.pointer())(callbacks.len() as u32) };

    drop(callbacks);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::joblib;
    use atlas_trampoline::wrap_shared;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;

    static DONE: AtomicU32 = AtomicU32::new(0);

    #[test]
    fn test_join_waits_for_jobs_after_lock_poisoned() {
        let count = wrap_shared(|_: f64| {
            DONE.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let _ = thread::spawn(|| {
            let _running = joblib::RUNNING.lock();
            panic!("poison the job list");
        })
        .join();
        assert!(joblib::RUNNING.is_poisoned());

        for param in [3.0, 1.0] {
            joblib::start_job(joblib::Job {
                param,
                on_done: count.pointer(),
            });
        }
        assert_eq!(joblib::join(), 0);
        assert_eq!(DONE.load(Ordering::SeqCst), 2);
    }
}
