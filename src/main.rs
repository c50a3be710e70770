// Scheduler demo binary - runs a service with a synthetic request load
//
// The binary loads the configuration, builds the service partitions and their NRS heads, starts
// the worker pool and a request generator, optionally enables TBF with the given rules, and logs
// JSON snapshots until Ctrl+C is received (or the requested duration elapses).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rpc_nrs::config::NrsConfig;
use rpc_nrs::policy::{NrsCtl, PolicyEnv};
use rpc_nrs::queue::QueueSelector;
use rpc_nrs::registry::PolicyRegistry;
use rpc_nrs::request::{Nid, Request, RequestIdentity};
use rpc_nrs::scheduler::TBF_POLICY;
use rpc_nrs::service::Service;
use rpc_nrs::threading::{core_count, partition_core, pin_current_thread, set_thread_priority};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// How long a worker sleeps waiting for work before re-checking for shutdown.
const IDLE_WAIT: Duration = Duration::from_millis(100);
/// Simulated handling time of one request.
const SERVICE_TIME: Duration = Duration::from_micros(50);

/// Command-line options parsed from program arguments.
struct CliOptions {
    /// TOML configuration file; defaults plus `NRS_` environment when absent.
    config: Option<PathBuf>,
    /// Start TBF on every head.
    tbf: bool,
    /// TBF rule commands applied after start (`--rule="start lan {192.168.1.*@tcp} 100"`).
    rules: Vec<String>,
    /// Distinct client NIDs the generator sends from.
    clients: usize,
    /// Generated requests per second over the whole service.
    load: u64,
    /// Stop on its own after this long.
    duration: Option<Duration>,
}

impl Default for CliOptions {
    fn default() -> Self {
        Self {
            config: None,
            tbf: false,
            rules: Vec::new(),
            clients: 8,
            load: 2_000,
            duration: None,
        }
    }
}

impl CliOptions {
    fn apply(&mut self, key: &str, value: String) {
        match key {
            "--config" => self.config = Some(PathBuf::from(value)),
            "--rule" => {
                self.tbf = true;
                self.rules.push(value);
            }
            "--clients" => self.clients = value.parse().unwrap_or(self.clients).max(1),
            "--load" => self.load = value.parse().unwrap_or(self.load).max(1),
            "--duration" => self.duration = value.parse().ok().map(Duration::from_secs),
            _ => {}
        }
    }
}

/// Parse command-line arguments into `CliOptions`.
///
/// Accepts `--key=value` and `--key value` forms, plus the bare `--tbf` switch.
fn parse_cli_options() -> CliOptions {
    let mut options = CliOptions::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--tbf" {
            options.tbf = true;
        } else if let Some((key, value)) = arg.split_once('=') {
            options.apply(key, value.to_owned());
        } else if let Some(value) = args.next() {
            options.apply(&arg, value);
        }
    }
    options
}

fn worker_loop(service: Arc<Service>, partition: usize, shutdown: Arc<AtomicBool>) {
    let settings = &service.config().service;
    if settings.pin_workers {
        let core = partition_core(partition, core_count());
        if !pin_current_thread(core) {
            warn!(partition, core, "could not pin worker");
        }
    }
    if settings.worker_priority != 0 && !set_thread_priority(settings.worker_priority) {
        warn!(partition, priority = settings.worker_priority, "could not raise worker priority");
    }

    let Some(part) = service.partition(partition) else {
        return;
    };
    loop {
        let epoch = part.work_epoch();
        if let Some(nrq) = part.next_request() {
            thread::sleep(SERVICE_TIME);
            part.finish(&nrq);
            continue;
        }
        if shutdown.load(Ordering::Relaxed) && !part.pending(true) && !part.pending(false) {
            break;
        }
        part.wait_for_work(epoch, IDLE_WAIT);
    }
}

fn generator_loop(service: Arc<Service>, options: &CliOptions, shutdown: Arc<AtomicBool>) {
    let nids: Vec<Nid> = (0..options.clients)
        .map(|i| {
            let addr = std::net::Ipv4Addr::new(192, 168, 1 + (i / 250) as u8, 1 + (i % 250) as u8);
            Nid::new(addr, "tcp")
        })
        .collect();
    let interval = Duration::from_nanos(1_000_000_000 / options.load);
    let partitions = service.partitions().len();
    let mut next = Instant::now();
    let mut sent: u64 = 0;

    while !shutdown.load(Ordering::Relaxed) {
        let nid = nids[sent as usize % nids.len()].clone();
        let identity = RequestIdentity::with_job(nid, format!("job.{}", sent % 4));
        let part = &service.partitions()[sent as usize % partitions];
        let hp = part.has_hp() && sent % 16 == 0;
        let queued = part
            .initialize(Request::new(identity))
            .and_then(|nrq| part.add(&nrq, hp));
        if let Err(err) = queued {
            warn!(partition = part.id(), %err, "request rejected");
        }
        sent += 1;

        next += interval;
        let now = Instant::now();
        if next > now {
            thread::sleep(next - now);
        }
    }
    info!(sent, "generator stopped");
}

/// Main entry point for the scheduler binary.
///
/// # Command-Line Arguments
/// - `--config=<path>`: TOML configuration file
/// - `--tbf`: start the TBF policy on every head
/// - `--rule=<command>`: TBF rule command, may repeat (implies `--tbf`)
/// - `--clients=<n>`, `--load=<req/s>`: shape of the synthetic load
/// - `--duration=<secs>`: stop after this many seconds
///
/// # Example Usage
/// ```bash
/// NRS_SERVICE__PARTITIONS=4 rpc-nrs --rule="start lan {192.168.1.[1-4]@tcp} 200" --load=5000
/// ```
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let options = parse_cli_options();
    let config = match &options.config {
        Some(path) => NrsConfig::load_from(path)?,
        None => NrsConfig::load()?,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log.filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let registry = Arc::new(PolicyRegistry::new());
    let env = PolicyEnv::system(config.tbf.clone());
    let service = Arc::new(Service::new(&config, registry, env)?);

    if options.tbf {
        service.policy_control(QueueSelector::Both, TBF_POLICY, &NrsCtl::Start)?;
        for rule in &options.rules {
            service.write_rule(TBF_POLICY, rule)?;
        }
        info!(rules = %service.dump_rules(TBF_POLICY)?, "tbf enabled");
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        shutdown_flag.store(true, Ordering::Relaxed);
    })?;

    let mut workers: Vec<JoinHandle<()>> = Vec::new();
    for partition in 0..service.partitions().len() {
        for worker in 0..config.service.workers_per_partition.max(1) {
            let service = Arc::clone(&service);
            let shutdown = Arc::clone(&shutdown);
            workers.push(
                thread::Builder::new()
                    .name(format!("nrs-{partition}-{worker}"))
                    .spawn(move || worker_loop(service, partition, shutdown))?,
            );
        }
    }

    let deadline = options.duration.map(|d| Instant::now() + d);
    let generator = {
        let service = Arc::clone(&service);
        let shutdown = Arc::clone(&shutdown);
        thread::Builder::new()
            .name("nrs-generator".into())
            .spawn(move || generator_loop(service, &options, shutdown))?
    };

    let snapshot_every = Duration::from_secs(config.log.snapshot_interval_secs);
    let mut last_snapshot = Instant::now();
    while !shutdown.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(100));
        if !snapshot_every.is_zero() && last_snapshot.elapsed() >= snapshot_every {
            match service.snapshot().to_json() {
                Ok(json) => info!(target: "rpc_nrs::snapshot", "{json}"),
                Err(err) => error!(%err, "failed to render snapshot"),
            }
            last_snapshot = Instant::now();
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            shutdown.store(true, Ordering::Relaxed);
        }
    }

    if generator.join().is_err() {
        error!("generator thread panicked");
    }
    // Hand anything still rate limited to the fallback so the workers can drain it.
    if let Err(err) = service.policy_control(QueueSelector::Both, TBF_POLICY, &NrsCtl::Stop) {
        warn!(%err, "failed to stop tbf");
    }
    for worker in workers {
        if worker.join().is_err() {
            error!("worker thread panicked");
        }
    }

    let snapshot = service.snapshot();
    service.shutdown();
    println!("{}", snapshot.to_json_pretty()?);
    Ok(())
}

