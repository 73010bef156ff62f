use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;

use time::{format_description::well_known::Iso8601, OffsetDateTime};
use tokio::signal;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, Duration, MissedTickBehavior};

use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use timed_kv::{Entry, TimedMap};

const DEFAULT_WORKERS: usize = 4;
const DEFAULT_STALE_AFTER_MS: u64 = 1500;
const DEFAULT_CHECK_INTERVAL_MS: u64 = 500;

/// Worker name to the sequence number of its latest heartbeat.
type Heartbeats = TimedMap<String, u64>;

#[derive(Debug, Clone, Copy)]
struct MonitorConfig {
    workers: usize,
    stale_after: Duration,
    check_interval: Duration,
}

impl MonitorConfig {
    fn from_env() -> Self {
        Self {
            workers: get_from_env("TIMED_KV_WORKERS", DEFAULT_WORKERS),
            stale_after: Duration::from_millis(get_from_env(
                "TIMED_KV_STALE_AFTER_MS",
                DEFAULT_STALE_AFTER_MS,
            )),
            check_interval: Duration::from_millis(get_from_env(
                "TIMED_KV_CHECK_INTERVAL_MS",
                DEFAULT_CHECK_INTERVAL_MS,
            )),
        }
    }

    // Later workers beat more slowly, so with the defaults some go stale.
    fn worker_period(&self, index: usize) -> Duration {
        self.check_interval * u32::try_from(index + 1).unwrap_or(u32::MAX)
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = MonitorConfig::from_env();
    info!("Starting heartbeat monitor: {:?}", config);

    let heartbeats = Arc::new(Heartbeats::with_capacity(config.workers));

    let mut workers = JoinSet::new();
    for index in 0..config.workers {
        let name = format!("worker-{}", index);
        let period = config.worker_period(index);
        workers.spawn(run_worker(heartbeats.clone(), name, period));
    }

    let (monitor_shutdown_tx, mut monitor_shutdown_rx) = oneshot::channel();

    let monitor_task = tokio::spawn({
        let monitor_heartbeats = heartbeats.clone();
        let monitor_loop = async move {
            let mut interval = interval(config.check_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let stale = check_heartbeats(&monitor_heartbeats, config.stale_after);
                info!(
                    "Heartbeat check at {}: {} tracked, {} stale",
                    server_time(),
                    monitor_heartbeats.len(),
                    stale
                );
            }
        };

        async move {
            tokio::select! {
                () = monitor_loop => {},
                _ = &mut monitor_shutdown_rx => {
                    info!("Monitor task received shutdown signal");
                },
            }
        }
    });

    () = shutdown_signal().await;

    info!("Initiating monitor shutdown");

    workers.abort_all();
    while workers.join_next().await.is_some() {}

    _ = monitor_shutdown_tx.send(());
    match timeout(Duration::from_secs(10), monitor_task).await {
        Ok(Err(e)) => error!("Monitor task error: {}", e),
        Ok(Ok(())) => {}
        Err(_) => warn!("Monitor task shutdown timed out after 10 seconds"),
    }

    info!(
        "Monitor shutdown complete, last known workers: {:?}",
        heartbeats
    );
}

fn get_from_env<T>(name: &str, default: T) -> T
where
    T: FromStr + Display,
{
    env::var(name)
        .map_err(|err| match err {
            env::VarError::NotPresent => {
                info!("{} environment variable not set. Using default: {}", name, default);
            }
            env::VarError::NotUnicode(_) => {
                error!("{} environment variable contains invalid UTF-8. Falling back to default: {}", name, default);
            }
        })
        .and_then(|value| {
            value.parse::<T>().map_err(|_| {
                error!("Invalid {} value: '{}'. Falling back to default: {}", name, value, default);
            })
        })
        .inspect(|value| {
            info!("Successfully read {} from environment: {}", name, value);
        })
        .unwrap_or(default)
}

#[tracing::instrument(level = "trace", skip(heartbeats))]
async fn run_worker(heartbeats: Arc<Heartbeats>, name: String, period: Duration) {
    let mut interval = interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    for sequence in 0u64.. {
        interval.tick().await;
        match heartbeats.put(name.clone(), sequence) {
            None => info!("Worker {} registered", name),
            Some(_) => debug!("Worker {} beat #{}", name, sequence),
        }
    }
}

/// Logs every worker whose last heartbeat is older than `stale_after` and
/// returns how many there were.
///
/// A worker silent for twice that long is evicted, unless it manages to
/// beat again between the check and the removal.
fn check_heartbeats(heartbeats: &Heartbeats, stale_after: Duration) -> usize {
    let mut names = heartbeats.keys();
    names.sort();

    let mut stale = 0;
    for name in names {
        let Some(last_beat) = heartbeats.get_entry(&name) else {
            continue;
        };

        let elapsed = last_beat.elapsed();
        if elapsed < stale_after {
            continue;
        }

        stale += 1;

        if elapsed < stale_after.saturating_mul(2) {
            warn!("Worker {} is stale: last heartbeat {}ms ago", name, elapsed.as_millis());
            continue;
        }

        if evict_worker(heartbeats, &name, &last_beat) {
            warn!("Worker {} evicted after {}ms without a heartbeat", name, elapsed.as_millis());
        } else {
            debug!("Worker {} beat again before eviction", name);
        }
    }

    stale
}

// Sequence numbers only grow, so a worker that beat after `last_beat` was
// read no longer holds its value and is kept.
fn evict_worker(heartbeats: &Heartbeats, name: &str, last_beat: &Entry<u64>) -> bool {
    heartbeats.remove_if(name, last_beat.value())
}

fn server_time() -> String {
    OffsetDateTime::now_local()
        .unwrap_or_else(|_| OffsetDateTime::now_utc())
        .format(&Iso8601::DATE_TIME_OFFSET)
        .unwrap_or_else(|_| "Error formatting server time".into())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_heartbeats() -> Heartbeats {
        let heartbeats = Heartbeats::new();
        heartbeats.put("worker-0".into(), 3);
        heartbeats.put("worker-1".into(), 8);
        heartbeats
    }

    #[test]
    fn test_fresh_workers_are_kept() {
        let heartbeats = setup_heartbeats();

        assert_eq!(check_heartbeats(&heartbeats, Duration::from_secs(3600)), 0);
        assert_eq!(heartbeats.len(), 2);
    }

    #[test]
    fn test_silent_workers_are_evicted() {
        let heartbeats = setup_heartbeats();

        assert_eq!(check_heartbeats(&heartbeats, Duration::ZERO), 2);
        assert!(heartbeats.is_empty());
    }

    #[test]
    fn test_worker_that_beat_again_is_not_evicted() {
        let heartbeats = setup_heartbeats();
        let last_beat = heartbeats.get_entry("worker-0").unwrap();

        heartbeats.put("worker-0".into(), 4);

        assert!(!evict_worker(&heartbeats, "worker-0", &last_beat));
        assert_eq!(heartbeats.get("worker-0"), Some(4));
    }

    #[test]
    fn test_silent_worker_is_evicted_from_its_snapshot() {
        let heartbeats = setup_heartbeats();
        let last_beat = heartbeats.get_entry("worker-1").unwrap();

        assert!(evict_worker(&heartbeats, "worker-1", &last_beat));
        assert!(!heartbeats.contains_key("worker-1"));
        assert!(heartbeats.contains_key("worker-0"));
    }

    #[tokio::test]
    async fn test_worker_registers_and_beats() {
        let heartbeats = Arc::new(Heartbeats::new());
        let worker = tokio::spawn(run_worker(
            heartbeats.clone(),
            "worker-0".into(),
            Duration::from_millis(5),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        worker.abort();

        assert!(heartbeats.get("worker-0").is_some_and(|sequence| sequence > 0));
        assert!(heartbeats.elapsed_millis("worker-0") < 1_000);
    }

    #[test]
    fn test_env_fallback() {
        env::set_var("TIMED_KV_TEST_BAD_NUMBER", "not-a-number");
        env::set_var("TIMED_KV_TEST_GOOD_NUMBER", "12");

        assert_eq!(get_from_env("TIMED_KV_TEST_BAD_NUMBER", 7usize), 7);
        assert_eq!(get_from_env("TIMED_KV_TEST_GOOD_NUMBER", 7usize), 12);
        assert_eq!(get_from_env("TIMED_KV_TEST_MISSING_NUMBER", 7usize), 7);
    }

    #[test]
    fn test_worker_periods_grow() {
        let config = MonitorConfig {
            workers: 3,
            stale_after: Duration::from_millis(1500),
            check_interval: Duration::from_millis(500),
        };

        assert_eq!(config.worker_period(0), Duration::from_millis(500));
        assert_eq!(config.worker_period(3), Duration::from_millis(2000));
    }
}
