//! A "soft IOC": serves the PVs named on the command line

use std::{
    error::Error,
    time::{Duration, SystemTime},
};

use clap::Parser;
use pvars::{
    ServerBuilder, ServerPv,
    data::{
        BitSet, PvStructure, PvValue,
        nt::{NtScalar, set_timestamp},
    },
    server::HandlerResult,
};
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Options {
    /// PVs to serve, as NAME or NAME=VALUE. Numbers are served as doubles, a
    /// comma-separated list of numbers as an array, anything else as a string.
    #[clap(required = true, id = "PV")]
    pvs: Vec<String>,
    /// Refuse writes from clients
    #[clap(long)]
    read_only: bool,
    /// Increment numeric PVs every PERIOD seconds
    #[clap(long, value_name = "PERIOD")]
    ramp: Option<f64>,
    /// Also serve an RPC under this name, returning the sum of arguments `a` and `b`
    #[clap(long, value_name = "NAME")]
    rpc: Option<String>,
    /// TCP port to listen on
    #[clap(long)]
    tcp_port: Option<u16>,
    /// UDP port to answer searches on
    #[clap(long)]
    udp_port: Option<u16>,
    /// Show debug output
    #[clap(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_value(text: Option<&str>) -> PvValue {
    let Some(text) = text else {
        return PvValue::Double(0.0);
    };
    if let Ok(value) = text.parse::<f64>() {
        return PvValue::Double(value);
    }
    if text.contains(',') {
        let numbers: Result<Vec<f64>, _> = text.split(',').map(|v| v.trim().parse()).collect();
        if let Ok(numbers) = numbers {
            return PvValue::DoubleArray(numbers);
        }
    }
    PvValue::String(text.to_string())
}

fn accept_write(pv: &ServerPv, changes: &BitSet, written: PvStructure) -> HandlerResult<()> {
    info!("{} written ({changes:?}): {:?}", pv.name(), written.get("value"));
    let mut written = written;
    set_timestamp(&mut written, SystemTime::now());
    pv.update(&written)?;
    Ok(())
}

fn add(parameters: &PvStructure) -> HandlerResult<PvStructure> {
    let argument = |name: &str| {
        parameters
            .get(name)
            .and_then(|v| v.as_f64())
            .ok_or_else(|| format!("Missing numeric argument '{name}'"))
    };
    let sum = argument("a")? + argument("b")?;
    Ok(NtScalar::new(PvValue::Double(sum)).build())
}

fn ramp(pv: &ServerPv) {
    let mut data = pv.get_data();
    let Some(value) = data.get_mut("value") else {
        return;
    };
    let Some(current) = value.as_f64() else {
        return;
    };
    if value.set_from_f64(current + 1.0).is_err() {
        return;
    }
    set_timestamp(&mut data, SystemTime::now());
    if let Err(e) = pv.update(&data) {
        warn!("Could not update {}: {e}", pv.name());
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let opts = Options::parse();
    let filter = EnvFilter::default().add_directive(
        match opts.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            2.. => LevelFilter::TRACE,
        }
        .into(),
    );
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut builder = ServerBuilder::new();
    if let Some(port) = opts.tcp_port {
        builder = builder.tcp_port(port);
    }
    if let Some(port) = opts.udp_port {
        builder = builder.udp_port(port);
    }
    let server = builder.start().await?;

    let mut pvs = Vec::new();
    for entry in &opts.pvs {
        let (name, value) = match entry.split_once('=') {
            Some((name, value)) => (name, Some(value)),
            None => (entry.as_str(), None),
        };
        let data = NtScalar::new(parse_value(value))
            .alarm()
            .timestamp()
            .build();
        let pv = if opts.read_only {
            server.create_pv(name, data)?
        } else {
            server.create_writable_pv(name, data, accept_write)?
        };
        info!("Serving {name}");
        pvs.push(pv);
    }
    if let Some(name) = &opts.rpc {
        server.create_rpc_pv(name, PvStructure::new(""), add)?;
        info!("Serving RPC {name}");
    }

    match opts.ramp {
        Some(period) => {
            let mut interval = tokio::time::interval(Duration::from_secs_f64(period.max(0.01)));
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = interval.tick() => pvs.iter().for_each(|pv| ramp(pv)),
                }
            }
        }
        None => tokio::signal::ctrl_c().await?,
    }
    info!("Shutting down");
    server.close().await;
    Ok(())
}
