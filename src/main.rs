use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use treeweave::ancestor_builder::AncestorBuilder;
use treeweave::ancestor_store::AncestorStore;
use treeweave::infer::{infer, InferOptions};
use treeweave::input_data::InputData;
use treeweave::match_ancestors::{AncestorScheduler, MatchAncestorsOptions};
use treeweave::match_samples::{MatchSamplesOptions, SampleScheduler};
use treeweave::tree_sequence::TreeSequenceTables;

#[derive(Parser)]
#[command(name = "treeweave")]
#[command(about = "Tree sequence inference from genotype data via Li-Stephens matching", long_about = None)]
#[command(version)]
struct Cli {
    /// Verbose level: 1=error, 2=warning, 3=message, 4+=debugging
    #[arg(short = 'v', long, value_name = "INT", default_value = "3", global = true)]
    verbosity: i32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover ancestor haplotypes from a genotype file
    BuildAncestors {
        /// Input genotype file (.txt or .txt.gz)
        #[arg(value_name = "SITES")]
        input: PathBuf,

        /// Output ancestor store
        #[arg(short = 'o', long, value_name = "FILE")]
        output: PathBuf,
    },

    /// Match ancestors into a tree sequence, epoch by epoch
    MatchAncestors {
        /// Input genotype file
        #[arg(value_name = "SITES")]
        input: PathBuf,

        /// Ancestor store built with 'build-ancestors'
        #[arg(value_name = "ANCESTORS")]
        ancestors: PathBuf,

        /// Output tree sequence (also the checkpoint target)
        #[arg(short = 'o', long, value_name = "FILE")]
        output: PathBuf,

        /// Number of worker threads; 0 runs fully sequential
        #[arg(short = 't', long, value_name = "INT", default_value = "0")]
        threads: usize,

        /// Minutes between checkpoints
        #[arg(short = 'c', long, value_name = "MINUTES")]
        checkpoint_interval: Option<f64>,

        /// Resume from the checkpoint at the output path
        #[arg(long)]
        resume: bool,

        /// Debug traceback dump pattern, '{}' replaced by the node id
        #[arg(long, value_name = "PATTERN")]
        traceback_pattern: Option<String>,
    },

    /// Match sample haplotypes against an ancestor tree sequence
    MatchSamples {
        /// Input genotype file
        #[arg(value_name = "SITES")]
        input: PathBuf,

        /// Ancestor tree sequence from 'match-ancestors'
        #[arg(value_name = "ANCESTOR_TS")]
        ancestor_ts: PathBuf,

        /// Output tree sequence
        #[arg(short = 'o', long, value_name = "FILE")]
        output: PathBuf,

        /// Number of worker threads; 0 runs fully sequential
        #[arg(short = 't', long, value_name = "INT", default_value = "0")]
        threads: usize,

        /// Genotyping error probability for sample matching
        #[arg(short = 'e', long, value_name = "FLOAT", default_value = "0")]
        error_probability: f64,

        /// Keep the full node set instead of simplifying to samples
        #[arg(long)]
        no_simplify: bool,
    },

    /// Run the full pipeline: build ancestors, match ancestors, match samples
    Infer {
        /// Input genotype file
        #[arg(value_name = "SITES")]
        input: PathBuf,

        /// Output tree sequence
        #[arg(short = 'o', long, value_name = "FILE")]
        output: PathBuf,

        /// Number of worker threads (default: all available cores)
        #[arg(short = 't', long, value_name = "INT")]
        threads: Option<usize>,

        /// Genotyping error probability for sample matching
        #[arg(short = 'e', long, value_name = "FLOAT", default_value = "0")]
        error_probability: f64,
    },
}

fn init_logger(verbosity: i32) {
    let log_level = match verbosity {
        v if v <= 1 => log::LevelFilter::Error,
        2 => log::LevelFilter::Warn,
        3 => log::LevelFilter::Info,
        4 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .format_timestamp(None)
        .format_target(false)
        .init();
}

fn validate_threads(threads: usize) -> usize {
    let max_threads = num_cpus::get() * 2;
    if threads > max_threads {
        log::warn!(
            "thread count {threads} exceeds recommended maximum {max_threads}, \
             capping at {max_threads}"
        );
        return max_threads;
    }
    threads
}

fn main() {
    let cli = Cli::parse();
    init_logger(cli.verbosity);
    if let Err(e) = run(cli.command) {
        log::error!("{e:#}");
        std::process::exit(1);
    }
}

fn run(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::BuildAncestors { input, output } => {
            let data = InputData::load(&input)
                .with_context(|| format!("loading genotypes from {}", input.display()))?;
            log::info!(
                "loaded {} sites x {} samples",
                data.num_sites(),
                data.num_samples()
            );
            let store = AncestorBuilder::new(&data).build()?;
            store.save(&output)?;
            log::info!(
                "wrote {} ancestors to {}",
                store.num_ancestors(),
                output.display()
            );
        }

        Commands::MatchAncestors {
            input,
            ancestors,
            output,
            threads,
            checkpoint_interval,
            resume,
            traceback_pattern,
        } => {
            let data = InputData::load(&input)
                .with_context(|| format!("loading genotypes from {}", input.display()))?;
            let store = AncestorStore::load(&ancestors)
                .with_context(|| format!("loading ancestors from {}", ancestors.display()))?;
            let threads = validate_threads(threads);
            log::info!(
                "matching {} ancestors with {threads} threads",
                store.num_ancestors()
            );
            let scheduler = AncestorScheduler::new(
                &data,
                &store,
                MatchAncestorsOptions {
                    num_threads: threads,
                    error_probability: 0.0,
                    output_path: Some(output),
                    checkpoint_interval_mins: checkpoint_interval,
                    resume,
                    traceback_file_pattern: traceback_pattern,
                },
            )?;
            scheduler.match_ancestors()?;
        }

        Commands::MatchSamples {
            input,
            ancestor_ts,
            output,
            threads,
            error_probability,
            no_simplify,
        } => {
            let data = InputData::load(&input)
                .with_context(|| format!("loading genotypes from {}", input.display()))?;
            let tables = TreeSequenceTables::load(&ancestor_ts).with_context(|| {
                format!(
                    "loading ancestor tree sequence from {}",
                    ancestor_ts.display()
                )
            })?;
            let threads = validate_threads(threads);
            let mut scheduler = SampleScheduler::new(
                &data,
                &tables,
                MatchSamplesOptions {
                    num_threads: threads,
                    error_probability,
                    traceback_file_pattern: None,
                },
            )?;
            scheduler.match_samples()?;
            let final_tables = scheduler.finalise(!no_simplify)?;
            final_tables.save(&output)?;
            log::info!("wrote tree sequence to {}", output.display());
        }

        Commands::Infer {
            input,
            output,
            threads,
            error_probability,
        } => {
            let data = InputData::load(&input)
                .with_context(|| format!("loading genotypes from {}", input.display()))?;
            let threads = validate_threads(threads.unwrap_or_else(num_cpus::get));
            log::info!(
                "inferring tree sequence for {} samples x {} sites with {threads} threads",
                data.num_samples(),
                data.num_sites()
            );
            let tables = infer(
                &data,
                &InferOptions {
                    num_threads: threads,
                    sample_error: error_probability,
                    simplify: true,
                },
            )?;
            tables.save(&output)?;
            log::info!(
                "wrote tree sequence with {} nodes, {} edges, {} mutations to {}",
                tables.num_nodes(),
                tables.num_edges(),
                tables.num_mutations(),
                output.display()
            );
        }
    }
    Ok(())
}
