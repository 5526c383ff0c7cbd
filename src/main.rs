#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process;

use trialgen::bootstrap::{BootstrapConfig, IntervalMethod};
use trialgen::data::{load_dataset, save_dataset};
use trialgen::estimators::Population;
use trialgen::synthetic::SyntheticStudyBuilder;
use trialgen::{AnalysisConfig, analyze, sampling_weight_table};

#[derive(Clone, Copy, ValueEnum)]
pub enum IntervalCli {
    Normal,
    Percentile,
}

#[derive(Args)]
pub struct RunArgs {
    /// Path to the TOML analysis configuration
    pub config: PathBuf,

    /// Number of bootstrap replicates (enables the bootstrap when the configuration has none)
    #[arg(long, value_name = "N")]
    pub replicates: Option<usize>,

    /// Bootstrap seed
    #[arg(long, value_name = "SEED")]
    pub seed: Option<u64>,

    /// Bootstrap interval method
    #[arg(long, value_enum)]
    pub interval: Option<IntervalCli>,

    /// Save the report as TOML
    #[arg(long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Export per-record IPSW weights as TSV
    #[arg(long, value_name = "PATH")]
    pub weights: Option<PathBuf>,
}

#[derive(Args)]
pub struct SimulateArgs {
    /// Output TSV path
    pub output: PathBuf,

    /// Total number of records (sample and target)
    #[arg(long, default_value = "3000")]
    pub records: usize,

    #[arg(long, default_value = "2021")]
    pub seed: u64,

    /// Make treatment depend on covariates among sample records
    #[arg(long)]
    pub confounded: bool,

    /// Report the true effect over sample and target records together
    #[arg(long)]
    pub generalize: bool,
}

#[derive(Parser)]
#[command(
    name = "trialgen",
    version,
    about = "Generalize and transport trial results to a target population",
    long_about = "Estimates the risk difference and risk ratio of a binary treatment in a target \
                 population with IPSW, the g-transport formula and augmented IPSW, with \
                 paired-bootstrap confidence intervals."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the estimators of an analysis configuration
    #[command(about = "Run a configured analysis (optionally writes report.toml and weights.tsv)")]
    Run(RunArgs),

    /// Write a synthetic study with known true effect
    #[command(about = "Generate a synthetic study dataset as TSV")]
    Simulate(SimulateArgs),
}

pub fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("Loading configuration from: {}", args.config.display());
    let mut config = AnalysisConfig::load(&args.config)?;

    if args.replicates.is_some() || args.seed.is_some() || args.interval.is_some() {
        let bootstrap = config.bootstrap.get_or_insert_with(BootstrapConfig::default);
        if let Some(replicates) = args.replicates {
            bootstrap.replicates = replicates;
        }
        if let Some(seed) = args.seed {
            bootstrap.seed = seed;
        }
        if let Some(interval) = args.interval {
            bootstrap.interval = match interval {
                IntervalCli::Normal => IntervalMethod::Normal,
                IntervalCli::Percentile => IntervalMethod::Percentile,
            };
        }
        config.validate()?;
    }

    println!("Loading study data from: {}", config.data.path.display());
    let data = load_dataset(&config.data.path, &config.columns, config.separator()?)?;
    let report = analyze(&data, &config)?;
    println!();
    print!("{report}");

    if let Some(path) = &args.output {
        report.save(path)?;
        println!("Report saved to: {}", path.display());
    }
    if let Some(path) = &args.weights {
        sampling_weight_table(&data, &config)?.save_tsv(path)?;
        println!("Sampling weights saved to: {}", path.display());
    }
    Ok(())
}

pub fn simulate(args: SimulateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let population = if args.generalize {
        Population::Generalize
    } else {
        Population::Transport
    };
    let study = SyntheticStudyBuilder::new(args.records)
        .seed(args.seed)
        .confounded(args.confounded)
        .population(population)
        .build()?;
    save_dataset(&study.dataset, &args.output)?;

    let sample = (0..study.dataset.len())
        .filter(|&row| study.dataset.is_sample(row))
        .count();
    println!(
        "Wrote {} records ({} sample, {} target) to: {}",
        study.dataset.len(),
        sample,
        study.dataset.len() - sample,
        args.output.display()
    );
    println!(
        "True risks: {:.4} treated, {:.4} untreated (RD {:.4}, RR {:.4})",
        study.true_risk_treated,
        study.true_risk_untreated,
        study.true_risk_difference(),
        study.true_risk_ratio()
    );
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Run(args)) => run(args),
        Some(Commands::Simulate(args)) => simulate(args),
        None => {
            let mut command = Cli::command();
            command
                .print_help()
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)
                .map(|_| println!())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
