use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{info, LevelFilter};
use simple_logger::SimpleLogger;

use octomesh::checkpoint::Checkpoint;
use octomesh::comm::LoopbackCommunicator;
use octomesh::science::LinearAdvection;
use octomesh::{Config, Engine};

#[derive(Debug, Parser)]
#[command(version, about = "Advect a scalar blob through the adaptive octree")]
struct Opts {
    /// RON configuration file; defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short = 't', long, default_value = "4")]
    num_threads: usize,

    /// Advection velocity components.
    #[arg(long, default_value = "1.0", allow_hyphen_values = true)]
    vx: f64,

    #[arg(long, default_value = "0.0", allow_hyphen_values = true)]
    vy: f64,

    #[arg(long, default_value = "0.0", allow_hyphen_values = true)]
    vz: f64,

    /// Where to dump the final checkpoint.
    #[arg(long, default_value = "state.cbor")]
    output: PathBuf,
}

fn main() -> octomesh::Result<()> {
    let opts = Opts::parse();
    init_logging();

    let config = match &opts.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    info!("{}", config);

    let science = Arc::new(LinearAdvection::new([opts.vx, opts.vy, opts.vz]));
    let engine = Engine::new(
        config.clone(),
        science,
        Arc::new(LoopbackCommunicator::new()),
        opts.num_threads,
    )?;

    engine.create_root()?;
    let science = engine.science().clone();
    engine.apply(&|node| science.initialize(node))?;

    // Build the initial hierarchy: one refinement pass per level, with the
    // sharp initial condition rewritten onto the new leaves.
    for _ in 1..config.levels_of_refinement {
        engine.refine()?;
        engine.apply(&|node| science.initialize(node))?;
    }

    let nodes = engine.reduce(&|_| 1usize, &|a, b| a + b)?;
    info!("initial tree holds {} nodes", nodes);

    let mut dt = engine.initial_dt()?;
    let mut next_output = config.output_frequency;
    while engine.time() < config.temporal_domain {
        let capped = dt.min(config.temporal_domain - engine.time());
        engine.step(capped)?;

        let step = engine.root()?.step();
        if step % config.temporal_prediction_gap == 0 {
            dt = engine.next_dt(capped, config.temporal_domain)?;
        }

        if engine.time() >= next_output {
            next_output += config.output_frequency;
            let root = engine.root()?;
            info!(
                "step {:>6}  t = {:.6e}  dt = {:.3e}",
                root.step(),
                root.time(),
                dt
            );
            engine.apply(&|node| science.output(node))?;
        }
    }

    let checkpoint = Checkpoint::capture(&engine, dt)?;
    let file = std::fs::File::create(&opts.output)
        .map_err(|e| octomesh::Error::Checkpoint(e.to_string()))?;
    checkpoint.write(std::io::BufWriter::new(file))?;
    info!("final state written to {}", opts.output.display());
    Ok(())
}

fn init_logging() {
    SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .init()
        .unwrap();
}
