use lacuna::data::{SimulationConfig, simulate_problem};
use lacuna::posterior::Posterior;

use clap::{Args, Parser, Subcommand};
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;
use std::process;
use std::time::Instant;

#[derive(Parser)]
#[command(
    name = "lacuna",
    about = "Evaluate the low-rank matrix-completion posterior oracle on synthetic problems",
    long_about = "Developer harness for the lacuna posterior oracle. Builds a reproducible \
                 synthetic matrix-completion instance, then evaluates the joint log-density \
                 and gradient the way an external HMC/NUTS sampler would."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct SimulationArgs {
    /// Path to a TOML file with a full simulation config
    #[arg(long)]
    config: Option<String>,

    /// Grid rows (overrides the config file)
    #[arg(long)]
    rows: Option<usize>,

    /// Grid columns
    #[arg(long)]
    cols: Option<usize>,

    /// Rank of the noise-free signal
    #[arg(long)]
    rank: Option<usize>,

    /// Gaussian noise standard deviation
    #[arg(long)]
    noise_std: Option<f64>,

    /// Probability that an entry is observed
    #[arg(long)]
    observed_fraction: Option<f64>,

    /// Moreau-Yosida smoothing scale of the rank penalty
    #[arg(long)]
    lambda: Option<f64>,

    /// RNG seed for the synthetic instance
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate the oracle once at the standard initial point
    #[command(about = "Evaluate log-density and gradient at the standard initial point")]
    Eval {
        #[command(flatten)]
        simulation: SimulationArgs,
    },

    /// Validate the analytic gradient against centered finite differences
    #[command(about = "Compare the analytic gradient to centered finite differences")]
    Gradcheck {
        #[command(flatten)]
        simulation: SimulationArgs,

        /// Finite-difference step
        #[arg(long, default_value = "1e-5")]
        step: f64,
    },

    /// Evaluate one independent context per chain, in parallel
    #[command(about = "Run per-chain evaluation contexts in parallel over perturbed parameters")]
    Chains {
        #[command(flatten)]
        simulation: SimulationArgs,

        /// Number of independent chains
        #[arg(long, default_value = "4")]
        chains: usize,

        /// Evaluations per chain
        #[arg(long, default_value = "25")]
        evals: usize,

        /// Scale of the per-evaluation parameter jitter
        #[arg(long, default_value = "0.01")]
        jitter: f64,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Eval { simulation } => eval_command(&simulation),
        Commands::Gradcheck { simulation, step } => gradcheck_command(&simulation, step),
        Commands::Chains {
            simulation,
            chains,
            evals,
            jitter,
        } => chains_command(&simulation, chains, evals, jitter),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

/// Resolves the simulation config: file if given, defaults otherwise, with
/// explicit flags winning over both.
fn resolve_config(args: &SimulationArgs) -> Result<SimulationConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            toml::from_str(&text)?
        }
        None => SimulationConfig::default(),
    };
    if let Some(rows) = args.rows {
        config.rows = rows;
    }
    if let Some(cols) = args.cols {
        config.cols = cols;
    }
    if let Some(rank) = args.rank {
        config.rank = rank;
    }
    if let Some(noise_std) = args.noise_std {
        config.noise_std = noise_std;
    }
    if let Some(fraction) = args.observed_fraction {
        config.observed_fraction = fraction;
    }
    if let Some(lambda) = args.lambda {
        config.lambda = lambda;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    Ok(config)
}

fn build_posterior(
    config: &SimulationConfig,
) -> Result<Posterior, Box<dyn std::error::Error>> {
    let (grid, observed) = simulate_problem(config)?;
    let posterior = Posterior::new(
        grid,
        observed,
        config.lambda,
        config.sigma2_prior,
        config.alpha_prior,
    )?;
    Ok(posterior)
}

fn eval_command(args: &SimulationArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = resolve_config(args)?;
    let posterior = build_posterior(&config)?;
    let (rows, cols) = posterior.shape();
    println!(
        "Problem: {}x{} grid, {} observed entries, lambda = {:.3e}",
        rows,
        cols,
        posterior.observed_len(),
        posterior.lambda()
    );

    let theta = posterior.initial_theta()?;
    let start = Instant::now();
    let (log_density, gradient) = posterior.evaluate(theta.view())?;
    let elapsed = start.elapsed();

    let gradient_norm = gradient.dot(&gradient).sqrt();
    let finite = log_density.is_finite() && gradient.iter().all(|g| g.is_finite());
    println!("log-density:   {:.6}", log_density);
    println!("gradient norm: {:.6}", gradient_norm);
    println!("gradient len:  {}", gradient.len());
    println!("all finite:    {}", finite);
    println!("evaluation:    {:.3?}", elapsed);
    Ok(())
}

fn gradcheck_command(args: &SimulationArgs, step: f64) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = resolve_config(args)?;
    // Finite differences over every coordinate; keep the grid small unless
    // the caller insists otherwise.
    if args.rows.is_none() && args.cols.is_none() && args.config.is_none() {
        config.rows = 4;
        config.cols = 4;
    }
    let posterior = build_posterior(&config)?;

    let mut rng = StdRng::seed_from_u64(config.seed ^ 0x9E37_79B9);
    let mut theta = posterior.initial_theta()?;
    for slot in theta.iter_mut() {
        *slot += 0.1 * rng.sample::<f64, _>(StandardNormal);
    }

    let (_, analytic) = posterior.evaluate(theta.view())?;

    let mut worst_error = 0.0_f64;
    let mut worst_index = 0;
    for index in 0..theta.len() {
        let mut plus = theta.clone();
        let mut minus = theta.clone();
        plus[index] += step;
        minus[index] -= step;
        let (logp_plus, _) = posterior.evaluate(plus.view())?;
        let (logp_minus, _) = posterior.evaluate(minus.view())?;
        let numeric = (logp_plus - logp_minus) / (2.0 * step);
        let error = (analytic[index] - numeric).abs() / analytic[index].abs().max(1e-8);
        if error > worst_error {
            worst_error = error;
            worst_index = index;
        }
    }

    println!(
        "Checked {} coordinates with step {:.1e}",
        theta.len(),
        step
    );
    println!(
        "worst relative error: {:.3e} (coordinate {})",
        worst_error, worst_index
    );
    Ok(())
}

fn chains_command(
    args: &SimulationArgs,
    chains: usize,
    evals: usize,
    jitter: f64,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = resolve_config(args)?;
    let posterior = build_posterior(&config)?;
    let theta0 = posterior.initial_theta()?;

    // One owned evaluation context per chain; the problem data stays shared.
    let contexts: Vec<Posterior> = (0..chains).map(|_| posterior.clone()).collect();

    let start = Instant::now();
    let summaries: Result<Vec<(usize, f64)>, _> = contexts
        .into_par_iter()
        .enumerate()
        .map(|(chain, oracle)| {
            let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(chain as u64));
            let mut total = 0.0;
            for _ in 0..evals {
                let mut theta: Array1<f64> = theta0.clone();
                for slot in theta.iter_mut() {
                    *slot += jitter * rng.sample::<f64, _>(StandardNormal);
                }
                let (log_density, _) = oracle.evaluate(theta.view())?;
                total += log_density;
            }
            Ok::<(usize, f64), lacuna::posterior::EvalError>((chain, total / evals as f64))
        })
        .collect();

    let elapsed = start.elapsed();
    for (chain, mean_log_density) in summaries? {
        println!("chain {:>2}: mean log-density {:.6}", chain, mean_log_density);
    }
    println!(
        "{} chains x {} evaluations in {:.3?}",
        chains, evals, elapsed
    );
    Ok(())
}
