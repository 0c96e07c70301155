use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// In-process simulator
    Sim,
    /// wgpu compute, one workgroup per core
    Gpu,
}

/// Build, run and verify the reference stream graph
#[derive(Parser, Debug)]
#[command(name = "tilestream", version, about, long_about = None)]
pub struct Cli {
    /// Device index
    #[arg(short, long, default_value_t = 0)]
    pub device: usize,

    /// Seed of the noise prefilled into the sink (random if omitted)
    #[arg(short, long)]
    pub seed: Option<u64>,

    #[arg(short, long, value_enum, default_value = "sim")]
    pub backend: Backend,

    /// YAML map configuration
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Where to write the Graphviz rendering of the graph
    #[arg(long, value_name = "FILE", default_value = "stream_graph.dot")]
    pub dot: PathBuf,

    /// Elements per stream
    #[arg(long, default_value_t = 2048)]
    pub count: usize,

    /// Cores per kernel, overrides the configuration
    #[arg(long)]
    pub cores: Option<usize>,

    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn init_logging(&self) {
        use tracing_subscriber::{fmt, EnvFilter};

        let level = match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
        fmt().with_env_filter(filter).with_target(false).init();
    }
}
