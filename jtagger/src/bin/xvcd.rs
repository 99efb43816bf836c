//! Discover the cable and chain, then serve the Xilinx Virtual Cable
//! protocol on top of them.
//!
//! ```text
//! xvcd <cable-driver> [<cable-name>] [KEY=value ...]
//! ```

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use jtagger::server::{self, ServerOptions};
use jtagger::{Cable, Chain, Config, PartDatabase};

fn usage() -> String {
    "\
usage: xvcd <cable-driver> [<cable-name>] [KEY=value ...]

Cable drivers: ftdi, xvc, loopback.

Give the cable's index or (part of) its name; with a single cable
attached the name may be omitted. Any configuration key can be set
on the command line, e.g.:

    xvcd ftdi 0 FTDI_JTAG_FREQ=6e6 SOCKET_ADDRESS=2542
"
    .to_string()
}

fn run() -> anyhow::Result<()> {
    let (mut config, positional) = Config::from_args(std::env::args().skip(1))?;
    let mut positional = positional.into_iter();
    if let Some(driver) = positional.next() {
        config.cable_driver = Some(driver);
    }
    if let Some(name) = positional.next() {
        config.cable_name = Some(name);
    }
    let extra: Vec<String> = positional.collect();
    if !extra.is_empty() {
        anyhow::bail!("unexpected argument(s): {}\n\n{}", extra.join(" "), usage());
    }
    if config.cable_driver.is_none() {
        anyhow::bail!("{}", usage());
    }

    if config.show_config {
        println!("{}", config.dump());
    }

    let db = match &config.jtagid_file {
        Some(path) => {
            let mut db = PartDatabase::builtin();
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read {}", path.display()))?;
            db.add_parts(&text)?;
            db
        }
        None => PartDatabase::builtin(),
    };

    let mut cable = Cable::open(&config)?;
    tracing::info!("cable ready at {} kHz", cable.speed_khz());

    let chain = Chain::discover(&mut cable, &db, Default::default())?;
    if config.show_chain {
        println!("{chain}");
    }

    let options = ServerOptions { port: config.socket_address, log_packets: config.log_packets };
    let result = server::run(&mut cable, &options);
    cable.close();
    result?;
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
