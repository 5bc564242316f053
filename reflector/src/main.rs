use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Parser;
use reflector::assign::{self, WorkerContext, WorkerId};
use reflector::config::{self, DeviceConfig, ReflectorConfig};
use reflector::dataplane::{
    BUFFER_SIZE, BufferPool, CounterRegistry, CounterSnapshot, WorkerHandle, WorkerLoop,
    spawn_worker,
};
use reflector::device::tap::{TapDevice, TapQueue};
use reflector::device::{DeviceId, DeviceQueues};
use reflector::topology::{self, Topology};
use tokio::signal::unix::{SignalKind, signal};
use tokio::time::Interval;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Reflect every received frame back out of the queue it arrived on
#[derive(Parser, Debug)]
#[command(name = "reflector", version, about = "Multi-queue packet reflector")]
struct Args {
    /// JSON configuration file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Device to reflect on, NAME[:QUEUES[:NUMA_NODE]] (repeatable)
    #[arg(short, long = "device", value_name = "DEVICE")]
    devices: Vec<DeviceConfig>,

    /// Worker CPUs as a cpu list, e.g. "2-5,8"
    #[arg(long)]
    cpus: Option<String>,

    /// Maximum frames per receive burst
    #[arg(long)]
    burst_size: Option<usize>,

    /// MAC address used in ARP and neighbor advertisement replies
    #[arg(long)]
    responder_mac: Option<String>,

    /// Forward frames unchanged without parsing them
    #[arg(long)]
    dry_run: bool,

    /// Log a summary of every frame before and after rewrite (debug level)
    #[arg(long)]
    trace_packets: bool,

    /// UDP destination port recognized as VXLAN
    #[arg(long)]
    vxlan_port: Option<u16>,

    /// Frames buffered per worker before a transmit burst
    #[arg(long)]
    tx_buffer_size: Option<usize>,

    /// Seconds between counter reports, 0 disables them
    #[arg(long)]
    stats_interval: Option<u64>,

    /// Packet buffers per device pool
    #[arg(long)]
    pool_buffers: Option<usize>,
}

impl Args {
    fn into_config(self) -> Result<ReflectorConfig> {
        let mut config = match &self.config {
            Some(path) => ReflectorConfig::load(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => ReflectorConfig::default(),
        };

        if !self.devices.is_empty() {
            config.devices = self.devices;
        }
        if let Some(cpus) = &self.cpus {
            config.cpus = Some(topology::parse_cpu_list(cpus).context("invalid --cpus")?);
        }
        if let Some(n) = self.burst_size {
            config.burst_size = n;
        }
        if let Some(mac) = &self.responder_mac {
            config.responder_mac = config::parse_mac(mac)?;
        }
        config.dry_run |= self.dry_run;
        config.trace_packets |= self.trace_packets;
        if let Some(port) = self.vxlan_port {
            config.vxlan_port = port;
        }
        if let Some(n) = self.tx_buffer_size {
            config.tx_buffer_size = n;
        }
        if let Some(secs) = self.stats_interval {
            config.stats_interval_secs = secs;
        }
        if let Some(n) = self.pool_buffers {
            config.pool_buffers = n;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Running workers and the counters they write
struct Dataplane {
    workers: Vec<WorkerHandle>,
    registry: Arc<CounterRegistry>,
    device_names: Vec<String>,
}

impl Dataplane {
    fn start(config: &ReflectorConfig) -> Result<Self> {
        let topology = Topology::discover();
        info!(nodes = ?topology.nodes(), "Discovered NUMA topology");

        let cpus = match &config.cpus {
            Some(cpus) => cpus.clone(),
            None => topology::default_worker_cpus().context("failed to read CPU affinity")?,
        };
        if cpus.is_empty() {
            bail!("no worker CPUs available");
        }

        let mut devices = Vec::with_capacity(config.devices.len());
        let mut queues: HashMap<(DeviceId, u16), TapQueue> = HashMap::new();
        let mut device_names = Vec::with_capacity(config.devices.len());

        for (index, dev) in config.devices.iter().enumerate() {
            let id = DeviceId(u16::try_from(index).context("too many devices")?);
            let pool = BufferPool::new(config.pool_buffers, BUFFER_SIZE)
                .map(Arc::new)
                .with_context(|| format!("failed to create buffer pool for {}", dev.name))?;
            let hugepages = pool.using_hugepages();
            let tap = TapDevice::open(&dev.name, dev.queues, pool)
                .with_context(|| format!("failed to open TAP device {}", dev.name))?;
            let numa_node = topology.device_node(&dev.name, dev.numa_node);

            info!(
                device = %id,
                name = tap.name(),
                queues = tap.num_queues(),
                numa_node,
                hugepages,
                "Opened device"
            );

            devices.push(DeviceQueues {
                device: id,
                numa_node,
                rx_queues: tap.num_queues(),
            });
            for queue in tap.into_queues() {
                queues.insert((id, queue.queue()), queue);
            }
            device_names.push(dev.name.clone());
        }

        let contexts: Vec<WorkerContext> = cpus
            .iter()
            .map(|&cpu| WorkerContext {
                id: WorkerId(cpu),
                numa_node: topology.node_of(cpu),
            })
            .collect();
        let assignment = assign::assign(&devices, &contexts).context("queue assignment failed")?;

        let idle = contexts.len().saturating_sub(assignment.len());
        if idle > 0 {
            info!(idle, "Workers without a queue stay idle");
        }

        let registry = Arc::new(CounterRegistry::new());
        let mut workers = Vec::with_capacity(assignment.len());
        for (worker, binding) in assignment.iter() {
            let key = (binding.queue.device, binding.queue.queue);
            let queue = queues
                .remove(&key)
                .with_context(|| format!("{} queue {} opened twice", key.0, key.1))?;
            let ctx = WorkerContext {
                id: worker,
                numa_node: topology.node_of(worker.0),
            };
            let counters = registry.register(key.0, key.1);
            let stop = Arc::new(AtomicBool::new(false));
            let worker_loop = WorkerLoop::new(ctx, *binding, queue, counters, config, stop);
            let handle = spawn_worker(worker_loop, worker.0)
                .with_context(|| format!("failed to spawn worker on cpu {}", worker.0))?;
            workers.push(handle);
        }

        info!(
            workers = workers.len(),
            dry_run = config.dry_run,
            burst_size = config.burst_size,
            "Data plane running"
        );

        Ok(Self {
            workers,
            registry,
            device_names,
        })
    }

    /// Log workers that exited on their own. Returns false once none is left.
    fn check_workers(&mut self) -> bool {
        self.workers.retain(|w| {
            let running = w.is_running();
            if !running {
                error!(worker = %w.worker, "Worker exited unexpectedly");
            }
            running
        });
        !self.workers.is_empty()
    }

    fn shutdown(self) {
        for worker in &self.workers {
            worker.stop();
        }
        for worker in self.workers {
            let id = worker.worker;
            if let Err(e) = worker.join() {
                error!(worker = %id, error = %e, "Failed to join worker");
            }
        }
        info!("Data plane stopped");
    }
}

/// Logs per-queue counter deltas as rates
struct StatsReporter {
    registry: Arc<CounterRegistry>,
    device_names: Vec<String>,
    last: HashMap<(DeviceId, u16), CounterSnapshot>,
    last_at: Instant,
}

impl StatsReporter {
    fn new(registry: Arc<CounterRegistry>, device_names: Vec<String>) -> Self {
        Self {
            registry,
            device_names,
            last: HashMap::new(),
            last_at: Instant::now(),
        }
    }

    fn report(&mut self) {
        let now = Instant::now();
        let secs = now.duration_since(self.last_at).as_secs_f64().max(f64::EPSILON);
        self.last_at = now;

        let mut total = CounterSnapshot::default();
        for stats in self.registry.snapshot() {
            let key = (stats.device, stats.queue);
            let prev = self.last.insert(key, stats.counters).unwrap_or_default();
            let delta = stats.counters.since(&prev);
            total.accumulate(&delta);

            let name = self
                .device_names
                .get(stats.device.0 as usize)
                .map_or("?", String::as_str);
            info!(
                device = name,
                queue = stats.queue,
                rx_pps = (delta.rx_packets as f64 / secs) as u64,
                tx_pps = (delta.tx_packets as f64 / secs) as u64,
                rx_mbps = delta.rx_bytes as f64 * 8.0 / secs / 1e6,
                tx_mbps = delta.tx_bytes as f64 * 8.0 / secs / 1e6,
                dropped = delta.dropped,
                tx_errors = delta.tx_errors,
                rx_nombuf = delta.rx_nombuf,
                "Queue stats"
            );
        }
        info!(
            rx_pps = (total.rx_packets as f64 / secs) as u64,
            tx_pps = (total.tx_packets as f64 / secs) as u64,
            dropped = total.dropped,
            tx_errors = total.tx_errors,
            rx_nombuf = total.rx_nombuf,
            "Total stats"
        );
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn run(mut dataplane: Dataplane, stats_interval: u64) -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt()).context("failed to set up SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to set up SIGTERM handler")?;

    let mut reporter = StatsReporter::new(
        Arc::clone(&dataplane.registry),
        dataplane.device_names.clone(),
    );
    let mut interval = (stats_interval > 0).then(|| {
        let period = Duration::from_secs(stats_interval);
        tokio::time::interval_at(tokio::time::Instant::now() + period, period)
    });

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                break;
            }
            _ = tick(&mut interval) => {
                reporter.report();
                if !dataplane.check_workers() {
                    error!("All workers exited");
                    break;
                }
            }
        }
    }

    dataplane.shutdown();
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let config = match args.into_config() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Invalid configuration");
            std::process::exit(1);
        }
    };

    info!(
        devices = config.devices.len(),
        responder_mac = %config.responder_mac,
        vxlan_port = config.vxlan_port,
        "Starting reflector"
    );

    let dataplane = match Dataplane::start(&config) {
        Ok(d) => d,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Failed to start data plane");
            error!("Do you have root privileges? Try running with 'sudo'.");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(dataplane, config.stats_interval_secs).await {
        error!(error = %format!("{e:#}"), "Reflector failed");
        std::process::exit(1);
    }
}
