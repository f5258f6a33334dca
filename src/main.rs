use std::path::PathBuf;
use std::process;

use clap::Parser;
use log::{error, info};
use tokio::runtime::Builder;
use tokio::signal;

use socks5d::{logging, Config, Result, SOCKS5Server};

/// SOCKS5 proxy server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file, defaults to ./socks5d.json when present
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Append log records to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Listen address
    #[arg(short, long)]
    ip: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Runtime worker threads
    #[arg(short, long)]
    workers: Option<usize>,

    /// Seconds a client may take to negotiate
    #[arg(short = 't', long)]
    timeout: Option<u64>,

    /// Largest chunk relayed per step, in bytes
    #[arg(long)]
    chunk: Option<usize>,

    /// Refuse UDP ASSOCIATE requests
    #[arg(long)]
    no_udp: bool,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn into_config(self) -> Result<Config> {
        let mut config = Config::load_or_default(self.config.as_deref())?;

        if let Some(ip) = self.ip {
            config.listen_ip = ip;
        }
        if let Some(port) = self.port {
            config.listen_port = port;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(timeout) = self.timeout {
            config.handshake_timeout = timeout;
        }
        if let Some(chunk) = self.chunk {
            config.relay_buffer_size = chunk;
        }
        if self.no_udp {
            config.udp_associate = false;
        }

        config.validate()?;
        Ok(config)
    }
}

fn main() {
    let args = Args::parse();
    if let Err(err) = logging::init(args.verbose, args.log_file.as_deref()) {
        eprintln!("cannot open log file: {}", err);
        process::exit(1);
    }

    let config = match args.into_config() {
        Ok(config) => config,
        Err(err) => {
            error!("{}", err);
            process::exit(1);
        }
    };

    let runtime = match Builder::new_multi_thread()
        .worker_threads(config.workers)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("failed to start runtime: {}", err);
            process::exit(1);
        }
    };

    let result = runtime.block_on(async {
        let server = SOCKS5Server::bind(config).await?;
        server
            .run(async {
                match signal::ctrl_c().await {
                    Ok(()) => info!("received ctrl-c"),
                    Err(err) => {
                        error!("failed to listen for ctrl-c: {}", err);
                        std::future::pending::<()>().await;
                    }
                }
            })
            .await
    });

    if let Err(err) = result {
        error!("{}", err);
        process::exit(1);
    }
}
