use std::path::PathBuf;

use anyhow::{bail, Context};
use bed_probe::configfile::Configfile;
use bed_probe::extras::probe_params::ProbeParams;
use bed_probe::sim::{BedPlane, SimConfig, SimMachine};
use bed_probe::{PrinterProbe, ProbePtRaise};
use clap::Parser;
use log::{info, warn};

/// Probe a simulated bed with the [probe] section of a printer config
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file
    #[arg()]
    config_file: PathBuf,

    /// point to probe as "x,y" (repeatable)
    #[arg(short, long = "point")]
    points: Vec<String>,

    /// points are probe-tip positions instead of nozzle positions
    #[arg(short = 'r', long)]
    probe_relative: bool,

    /// skip the early-trigger sanity check
    #[arg(long)]
    no_sanity_check: bool,

    /// report level passed to each probe (3 logs every point)
    #[arg(short = 'V', long, default_value_t = 0)]
    verbose_level: u8,

    /// write log to file instead of stderr
    #[arg(short, long)]
    logfile: Option<String>,

    /// enable debug messages
    #[arg(short, long)]
    verbose: bool,
}

fn parse_point(text: &str) -> anyhow::Result<(f64, f64)> {
    let (x, y) = text.split_once(',').with_context(|| format!("point '{}' is not 'x,y'", text))?;
    let x = x.trim().parse::<f64>().with_context(|| format!("bad X in point '{}'", text))?;
    let y = y.trim().parse::<f64>().with_context(|| format!("bad Y in point '{}'", text))?;
    Ok((x, y))
}

/// Machine model from the optional [sim] section.
fn sim_config(config: &Configfile, params: &ProbeParams) -> anyhow::Result<SimConfig> {
    let mut sim = SimConfig { probe_offset: params.offset, ..SimConfig::default() };
    if !config.has_section("sim") {
        return Ok(sim);
    }
    let getf = |opt: &str, default: f64| config.getfloat("sim", opt, Some(default), None, None);
    sim.bed = BedPlane {
        z0: getf("bed_z", 0.0)?,
        slope_x: getf("bed_slope_x", 0.0)?,
        slope_y: getf("bed_slope_y", 0.0)?,
    };
    sim.max = [getf("size_x", sim.max[0])?, getf("size_y", sim.max[1])?, sim.max[2]];
    sim.start_position[2] = getf("start_z", sim.start_position[2])?;
    sim.probe_temp = getf("probe_temp", sim.probe_temp)?;
    Ok(sim)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut builder = env_logger::Builder::from_default_env();
    if args.verbose {
        builder.filter(None, log::LevelFilter::Debug);
    } else {
        builder.filter(None, log::LevelFilter::Info);
    }
    if let Some(ref logfile) = args.logfile {
        let target = Box::new(std::fs::File::create(logfile).with_context(|| format!("Can't create logfile {}", logfile))?);
        builder.target(env_logger::Target::Pipe(target));
    }
    builder.init();

    let config = Configfile::load(&args.config_file)
        .with_context(|| format!("reading {}", args.config_file.display()))?;
    let params = ProbeParams::new(&config).context("invalid [probe] section")?;

    let points = args.points.iter().map(|p| parse_point(p)).collect::<anyhow::Result<Vec<_>>>()?;
    if points.is_empty() {
        bail!("no points given, use --point x,y");
    }

    let sim = SimMachine::new(sim_config(&config, &params)?);
    let mut probe = PrinterProbe::new(params, sim.hardware(), &mut sim.pins());
    probe.init();
    info!("Probing {} point(s) with '{}' probe", points.len(), probe.mechanism_name());

    let mut results = Vec::new();
    for (idx, &(x, y)) in points.iter().enumerate() {
        let raise = if idx + 1 == points.len() { ProbePtRaise::LastStow } else { ProbePtRaise::Raise };
        match probe.probe_at_point(x, y, raise, args.verbose_level, args.probe_relative, !args.no_sanity_check) {
            Ok(z) => results.push(serde_json::json!({ "x": x, "y": y, "z": serde_json::Number::from_f64(z) })),
            Err(e) if e.is_fatal() => return Err(e).context("probing halted"),
            Err(e) => {
                warn!("Point X{} Y{} failed: {}", x, y, e);
                results.push(serde_json::json!({ "x": x, "y": y, "error": e.to_string() }));
            }
        }
    }

    let report = serde_json::json!({ "points": results, "status": probe.get_status() });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
