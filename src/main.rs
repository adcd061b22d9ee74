use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info};

mod cli;
mod config;
mod device;
mod measurement;
mod metric;
mod orchestrator;
mod snmp;
mod status;
mod tsdb;

use cli::Opts;

/// Writes every log line to both stderr and the error log file, per the
/// "mirrored to standard error and to the error log" requirement.
struct TeeWriter {
    file: std::fs::File,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}

fn init_logging(log_dir: &str, http_port: u16, verbose: bool) -> Result<()> {
    std::fs::create_dir_all(log_dir).with_context(|| format!("creating log dir {log_dir}"))?;
    let error_log_path = format!("{log_dir}/error.{http_port}.log");
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o664)
        .open(&error_log_path)
        .with_context(|| format!("opening error log {error_log_path}"))?;

    let mut builder = env_logger::Builder::new();
    builder.filter_level(if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    });
    builder.target(env_logger::Target::Pipe(Box::new(TeeWriter { file })));
    builder.init();
    Ok(())
}

fn load_config(path: &str) -> Result<config::Config> {
    let metadata = std::fs::metadata(path).with_context(|| format!("reading config path {path}"))?;
    let mut config = if metadata.is_dir() {
        config::from_directory(path)?
    } else {
        config::from_file(path)?
    };
    config.finalize()?;
    Ok(config)
}

fn main() -> Result<()> {
    let cli = Opts::parse();

    let mut config = load_config(&cli.config)?;

    if let Some(freq) = cli.freq {
        for device in config.snmp_devices.values_mut() {
            device.freq = freq;
        }
    }
    if let Some(log_dir) = &cli.logs {
        config.general.log_dir = log_dir.clone();
    }
    let http_port = cli.http.unwrap_or(config.http.port);

    if cli.showconf {
        println!("{:#?}", config);
        return Ok(());
    }

    init_logging(&config.general.log_dir, http_port, cli.verbose)?;
    debug!("config: loaded {} devices", config.snmp_devices.len());

    let config = Arc::new(config);

    debug!("main: initializing tokio runtime");
    let rt = tokio::runtime::Builder::new_multi_thread()
        .thread_name_fn(|| {
            static ATOMIC_ID: AtomicUsize = AtomicUsize::new(0);
            let id = ATOMIC_ID.fetch_add(1, Ordering::SeqCst);
            format!("snmpc-rs#{id}")
        })
        .enable_all()
        .build()?;

    info!("main: starting runtime");
    rt.block_on(orchestrator::run(config, http_port))
}
