use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use lorasim::channel::ChannelDistribution;
use lorasim::config::SimulationConfig;
use lorasim::export::RunRecord;
use lorasim::simulator::Simulator;
use lorasim::traffic::TrafficMode;

/// LoRa/LoRaWAN network simulator.
#[derive(Parser, Debug)]
#[command(name = "lorasim", version, about)]
struct Args {
    /// Number of end-devices
    #[arg(long, default_value_t = 10)]
    nodes: usize,

    /// Number of gateways
    #[arg(long, default_value_t = 1)]
    gateways: usize,

    /// Side length of the square deployment area, meters
    #[arg(long, default_value_t = 1000.0)]
    area: f64,

    /// Number of radio channels
    #[arg(long, default_value_t = 1)]
    channels: usize,

    /// Traffic mode
    #[arg(long, value_enum, default_value_t = Mode::Random)]
    mode: Mode,

    /// Fixed period or mean gap between transmissions, seconds
    #[arg(long, default_value_t = 60.0)]
    interval: f64,

    /// Number of simulation steps
    #[arg(long, default_value_t = 100)]
    steps: u64,

    /// Duty-cycle limit as a fraction (e.g. 0.01 for 1%); 0 disables
    #[arg(long, default_value_t = 0.01)]
    duty_cycle: f64,

    /// Enable smooth node mobility
    #[arg(long)]
    mobility: bool,

    /// Enable server-side ADR
    #[arg(long)]
    adr: bool,

    /// Start every node at this spreading factor (7..=12)
    #[arg(long)]
    sf: Option<u8>,

    /// Start every node at this transmit power, dBm
    #[arg(long)]
    tx_power: Option<f64>,

    /// Seed for the random stream (reproducible runs)
    #[arg(long)]
    seed: Option<u64>,

    /// Wall-clock budget in seconds; the run stops after the current step
    #[arg(long)]
    budget: Option<u64>,

    /// CSV file receiving the run record
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum Mode {
    Random,
    Periodic,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Random => write!(f, "random"),
            Mode::Periodic => write!(f, "periodic"),
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = SimulationConfig::default();
    config.num_nodes = args.nodes;
    config.num_gateways = args.gateways;
    config.area_size = args.area;
    config.num_channels = args.channels;
    config.channel_distribution = ChannelDistribution::RoundRobin;
    config.traffic_mode = match args.mode {
        Mode::Random => TrafficMode::Random,
        Mode::Periodic => TrafficMode::Periodic,
    };
    config.packet_interval = args.interval;
    config.steps = args.steps;
    config.duty_cycle_limit = (args.duty_cycle > 0.0).then_some(args.duty_cycle);
    config.mobility.enabled = args.mobility;
    config.adr.enabled = args.adr;
    config.fixed_sf = args.sf;
    config.fixed_tx_power_dbm = args.tx_power;
    config.seed = args.seed;

    log::info!(
        "simulating {} nodes, {} gateways, area {} m, {} channels, mode {}, interval {}, {} steps",
        config.num_nodes,
        config.num_gateways,
        config.area_size,
        config.num_channels,
        config.traffic_mode,
        config.packet_interval,
        config.steps
    );

    let mut sim = Simulator::new(config)?;
    if let Some(secs) = args.budget {
        sim.set_wall_clock_budget(Some(Duration::from_secs(secs)));
    }
    let stop = sim.stop_handle();
    ctrlc::set_handler(move || {
        stop.store(true, std::sync::atomic::Ordering::SeqCst);
    })?;

    let metrics = sim.run();
    log::info!(
        "results: PDR={:.2}%, delivered={}, collisions={}, energy={:.4} J, avg delay={:.3} s",
        metrics.pdr_percent(),
        metrics.delivered,
        metrics.collided,
        metrics.total_energy_j,
        metrics.avg_delay_s()
    );

    if let Some(path) = args.output {
        let record = RunRecord::new(sim.config(), &metrics);
        record.write_csv(File::create(&path)?)?;
        log::info!("results written to {}", path.display());
    }
    Ok(())
}
