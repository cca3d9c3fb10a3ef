#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use ndarray::{Array1, Axis};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;

use hic_calibrate::config::RunConfig;
use hic_calibrate::context::CalibrationContext;
use hic_calibrate::emulator::MultiGpEmulator;
use hic_calibrate::observables::display_path;

#[derive(Args)]
pub struct TrainArgs {
    /// Path to the run configuration (TOML)
    pub config: PathBuf,

    /// Where to write the trained emulator
    #[arg(long, short, default_value = "emulator.toml")]
    pub output: PathBuf,

    /// Override the number of principal components
    #[arg(long)]
    pub npc: Option<usize>,

    /// Override the seed used for hyperparameter restarts
    #[arg(long)]
    pub seed: Option<u64>,
}

#[derive(Args)]
pub struct CalibrateArgs {
    /// Path to the run configuration (TOML)
    pub config: PathBuf,

    /// Path to an emulator written by `train`
    pub emulator: PathBuf,

    /// Where to write the compressed posterior archive
    #[arg(long, short, default_value = "posterior.json.gz")]
    pub output: PathBuf,

    /// Total steps per walker, including burn-in
    #[arg(long)]
    pub nsteps: Option<usize>,

    /// Burn-in steps discarded from the stored chain
    #[arg(long)]
    pub nburnsteps: Option<usize>,

    /// Number of ensemble walkers
    #[arg(long)]
    pub nwalkers: Option<usize>,

    /// Sampler seed
    #[arg(long)]
    pub seed: Option<u64>,
}

#[derive(Args)]
pub struct PredictArgs {
    /// Path to the run configuration (TOML); supplies the observable layout
    pub config: PathBuf,

    /// Path to an emulator written by `train`
    pub emulator: PathBuf,

    /// Parameter values in configuration order, comma separated
    #[arg(long, value_delimiter = ',', num_args = 1.., required = true, allow_negative_numbers = true)]
    pub point: Vec<f64>,
}

#[derive(Parser)]
#[command(
    name = "hic-calibrate",
    about = "Gaussian-process emulation and Bayesian calibration of collision models",
    long_about = "Trains a principal-component Gaussian-process emulator on a design of model \
                 runs and samples the posterior of the model parameters given experimental data."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the emulator on the design and model outputs named by a configuration
    #[command(about = "Train the PCA + Gaussian-process emulator")]
    Train(TrainArgs),

    /// Sample the posterior with a trained emulator
    #[command(about = "Run MCMC calibration against experimental data")]
    Calibrate(CalibrateArgs),

    /// Emulate the observables at one parameter point
    #[command(about = "Predict observables at a parameter point")]
    Predict(PredictArgs),

    /// Show version information
    #[command(about = "Show version information")]
    Version,
}

pub fn train(args: TrainArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = RunConfig::load(&args.config)?;
    if let Some(npc) = args.npc {
        config.emulator.npc = npc;
    }
    if let Some(seed) = args.seed {
        config.emulator.seed = seed;
    }

    let context = CalibrationContext::load(config)?;
    let emulator = context.train_emulator()?;

    let pca = emulator.pca();
    let retained: f64 = pca.weights().iter().take(emulator.npc()).sum();
    log::info!(
        "Retained {} of {} components, explaining {:.2}% of the variance",
        emulator.npc(),
        pca.n_components(),
        100.0 * retained
    );
    for (c, gp) in emulator.components().iter().enumerate() {
        let params = gp.params();
        log::info!(
            "  PC{}: amplitude {:.4e}, noise {:.4e}, length scales {:?}, log marginal likelihood {:.3}",
            c + 1,
            params.amplitude,
            params.noise,
            params.length_scales,
            gp.log_marginal_likelihood()
        );
    }

    emulator.save(&args.output)?;
    println!("Emulator saved to: {}", args.output.display());
    Ok(())
}

pub fn calibrate(args: CalibrateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = RunConfig::load(&args.config)?;
    if let Some(nsteps) = args.nsteps {
        config.mcmc.nsteps = nsteps;
    }
    if let Some(nburnsteps) = args.nburnsteps {
        config.mcmc.nburnsteps = nburnsteps;
    }
    if let Some(nwalkers) = args.nwalkers {
        config.mcmc.nwalkers = nwalkers;
    }
    if let Some(seed) = args.seed {
        config.mcmc.seed = seed;
    }

    let context = CalibrationContext::load(config)?;
    let emulator = MultiGpEmulator::load(&args.emulator)?;
    let posterior = context.calibrate(&emulator)?;

    log::info!(
        "Kept {} samples, mean acceptance fraction {:.3}",
        posterior.len(),
        posterior.chain().mean_acceptance()
    );
    if let (Some(mean), Some(std)) = (posterior.mean(), posterior.std()) {
        for ((name, m), s) in posterior.parameter_names().iter().zip(&mean).zip(&std) {
            println!("{name}\t{m:.6}\t{s:.6}");
        }
    }

    context.archive(&emulator, &posterior)?.write(&args.output)?;
    println!("Posterior saved to: {}", args.output.display());
    Ok(())
}

pub fn predict(args: PredictArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = RunConfig::load(&args.config)?;
    let spec = config.observable_spec()?;
    let emulator = MultiGpEmulator::load(&args.emulator)?;
    if emulator.n_features() != spec.total_len() {
        return Err(format!(
            "Emulator predicts {} features, but the configuration lists {}",
            emulator.n_features(),
            spec.total_len()
        )
        .into());
    }

    let point = Array1::from_vec(args.point);
    let prediction = emulator.predict(point.view())?;
    let std: Array1<f64> = prediction.cov.diag().mapv(|v| v.max(0.0).sqrt());

    let scale = emulator.scale();
    let mean = scale.restore_rows(prediction.mean.view().insert_axis(Axis(0)))?;
    let std = scale
        .restore_rows(std.view().insert_axis(Axis(0)))?
        .mapv(f64::abs);
    let means = spec.split(mean.view())?;
    let stds = spec.split(std.view())?;

    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    writeln!(out, "observable\tbin\tmean\tstd")?;
    for entry in spec.entries() {
        let name = display_path(&entry.path);
        let m = means.get(&entry.path)?;
        let s = stds.get(&entry.path)?;
        for (bin, (mv, sv)) in m.row(0).iter().zip(s.row(0)).enumerate() {
            writeln!(out, "{name}\t{bin}\t{mv}\t{sv}")?;
        }
    }
    out.flush()?;
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Train(args)) => train(args),
        Some(Commands::Calibrate(args)) => calibrate(args),
        Some(Commands::Predict(args)) => predict(args),
        Some(Commands::Version) => {
            print_version_info();
            Ok(())
        }
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(|err| Box::new(err) as Box<dyn std::error::Error>),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

/// Format seconds into a human-readable duration like "2.4 hours ago"
fn format_duration_ago(seconds: u64) -> String {
    const MINUTE: u64 = 60;
    const HOUR: u64 = 60 * MINUTE;
    const DAY: u64 = 24 * HOUR;

    if seconds < MINUTE {
        format!("{seconds} seconds ago")
    } else if seconds < HOUR {
        format!("{:.1} minutes ago", seconds as f64 / MINUTE as f64)
    } else if seconds < DAY {
        format!("{:.1} hours ago", seconds as f64 / HOUR as f64)
    } else {
        format!("{:.1} days ago", seconds as f64 / DAY as f64)
    }
}

fn print_version_info() {
    let version = env!("CARGO_PKG_VERSION");
    let build_timestamp: u64 = env!("HIC_CALIBRATE_BUILD_TIMESTAMP").parse().unwrap_or(0);

    println!("hic-calibrate {version}");

    if build_timestamp > 0 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        println!("Built: {}", format_duration_ago(now.saturating_sub(build_timestamp)));
    }
}
