//! tilestream - runs the reference graph on a device and checks the result.
//!
//! Three constant sources (1.0, 2.0, 4.0) feed a kernel whose body selects its
//! third input; the sink must come back as 4.0 everywhere.

mod cli;

use std::process;

use anyhow::{bail, Context, Result};
use clap::Parser;
use half::bf16;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{info, warn};

use cli::{Backend, Cli};
use tilestream::{DataFormat, Device, GpuContext, Kernel, Map, MapConfig, SimConfig, SimDevice, Stream};

const EXPECTED: f32 = 4.0;

fn main() {
    let cli = Cli::parse();
    cli.init_logging();

    if let Err(e) = run(&cli) {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn open_device(cli: &Cli) -> Result<Box<dyn Device>> {
    Ok(match cli.backend {
        Backend::Sim => Box::new(SimDevice::with_config(cli.device, SimConfig::default())),
        Backend::Gpu => Box::new(
            pollster::block_on(GpuContext::with_adapter_index(cli.device))
                .with_context(|| format!("opening GPU adapter {}", cli.device))?,
        ),
    })
}

fn map_config(cli: &Cli) -> Result<MapConfig> {
    let mut config = match &cli.config {
        Some(path) => MapConfig::from_yaml_file(path)?,
        None => MapConfig::default(),
    };
    if let Some(cores) = cli.cores {
        if cores == 0 {
            bail!("--cores must be at least 1");
        }
        config.cores_per_kernel = cores;
    }
    Ok(config)
}

fn run(cli: &Cli) -> Result<()> {
    let device = open_device(cli)?;
    let info = device.info();
    info!(device = %info.name, id = info.id, grid = ?info.grid, "device opened");

    let seed = cli.seed.unwrap_or_else(rand::random);
    info!(seed, "sink prefill seed");
    let mut rng = StdRng::seed_from_u64(seed);
    let noise: Vec<f32> = (0..cli.count).map(|_| rng.gen_range(-100.0..100.0)).collect();

    let mut map = Map::new(map_config(cli)?);
    let mut kernel = Kernel::new("select_third");
    for port in ["in0", "in1", "in2"] {
        kernel.add_input_port(port, DataFormat::Float16B)?;
    }
    kernel.add_output_port("out0", DataFormat::Float16B)?;
    kernel.set_compute_kernel(
        r#"
        out0 = in2;
        "#,
    );
    let k = map.add_kernel(kernel);

    let sources = [1.0, 2.0, 4.0].map(|v| map.add_stream(Stream::constant(v, cli.count)));
    let sink = map.add_stream(Stream::from_f32(&noise));
    for (i, src) in sources.into_iter().enumerate() {
        map.add_connection(src, k.port(format!("in{i}")))?;
    }
    map.add_connection(k.port("out0"), sink)?;

    if let Err(e) = map.export_dot(&cli.dot) {
        warn!("{e}");
    }

    map.check_connections()?;
    map.generate_device_kernels(device.as_ref())?;
    map.execute(device.as_ref())?;

    let out = map.take_stream(sink).context("sink stream vanished")?;
    map.release(device.as_ref());

    let expected = bf16::from_f32(EXPECTED);
    let wrong = out.values().iter().filter(|v| **v != expected).count();
    if let Some((i, v)) = out.values().iter().enumerate().find(|(_, v)| **v != expected) {
        bail!("{wrong} of {} elements differ from {EXPECTED}, first at index {i}: {v}", out.element_count());
    }
    if out.values().len() != cli.count {
        bail!("sink holds {} elements, expected {}", out.values().len(), cli.count);
    }
    info!(elements = cli.count, "all elements equal {EXPECTED}");
    println!("OK: {} elements equal {EXPECTED}", cli.count);
    Ok(())
}
