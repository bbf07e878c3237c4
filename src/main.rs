//! pathsteer CLI - path ranking and probing diagnostics.

use std::path::Path as FsPath;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use pathsteer::cli::{rank_paths, Cli, Commands, ConfigArgs, OutputFormat, ProbeArgs, RankArgs};
use pathsteer::config::{init_logging, Config, LoggingConfig};
use pathsteer::connection::{ConnectionOptions, PathAwareConnection};
use pathsteer::error::{Error, Result};
use pathsteer::path::{Path, PathDescription};
use pathsteer::processor::{LatencyProbingPathProcessor, PathProcessor, Stage};
use pathsteer::transport::{EchoProfile, LoopbackTransport};
use pathsteer::types::{ProcessContext, Toggle};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = LoggingConfig {
        level: cli.log_level.clone(),
        color: !cli.no_color,
        ..Default::default()
    };
    init_logging(&log_config)?;

    let config = if let Some(ref path) = cli.config {
        Config::load(path)?
    } else if Config::default_path().exists() {
        Config::load(Config::default_path())?
    } else {
        Config::default()
    };

    match cli.command {
        Commands::Rank(args) => run_rank(&args, cli.format),
        Commands::Probe(args) => run_probe(args, config, cli.format).await,
        Commands::Config(args) => run_config(&args, &config),
    }
}

/// Rank a path set file
fn run_rank(args: &RankArgs, format: OutputFormat) -> Result<()> {
    let content = std::fs::read_to_string(&args.paths)?;
    let descriptions: Vec<PathDescription> = serde_json::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse path set: {e}")))?;

    let (ranked, weights) = rank_paths(descriptions, &args.penalties, args.sort);

    match format {
        OutputFormat::Json => {
            let described: Vec<_> = ranked.iter().map(Path::describe).collect();
            print_json(&described)?;
        }
        OutputFormat::Text => {
            for (rank, path) in ranked.iter().enumerate() {
                let weight = weights
                    .iter()
                    .find(|(p, _)| p == path)
                    .map_or(String::new(), |(_, w)| format!("  penalty {w:+.2}"));
                println!("{:>3}. {path} ({} hops){weight}", rank + 1, path.hops());
            }
        }
    }

    Ok(())
}

/// Probe simulated paths over a loopback transport
async fn run_probe(args: ProbeArgs, config: Config, format: OutputFormat) -> Result<()> {
    let local = "1-ff00:0:110,127.0.0.1:4000".parse()?;
    let remote = "1-ff00:0:110,127.0.0.1:5000".parse()?;

    let paths: Vec<Path> = args
        .paths
        .iter()
        .map(|p| Path::new(format!("{} sim", p.name), 1))
        .collect();
    let transport = Arc::new(LoopbackTransport::new(local, remote).with_paths(paths.clone()));
    for (path, sim) in paths.iter().zip(&args.paths) {
        transport.set_echo(path, EchoProfile::new(sim.rtt).with_loss(sim.loss));
    }

    let prober = Arc::new(LatencyProbingPathProcessor::with_pause_toggle(
        config.probing.clone(),
        Toggle::new(false),
    ));
    let mut completed = prober.completed().subscribe();

    let inbound = transport
        .take_inbound()
        .ok_or_else(|| Error::Internal("loopback inbound already taken".into()))?;
    let connection = PathAwareConnection::new(
        transport,
        vec![Stage::Active(prober.clone())],
        ConnectionOptions::new()
            .with_latency_probing(true)
            .with_config(config.connection.clone()),
    );
    let _unconsumed = connection.listen(inbound);

    let per_round = config.probing.inter_probe_interval * config.probing.burst_size as u32
        + config.probing.timeout
        + config.probing.reprobe_interval;
    for round in 0..args.rounds {
        tokio::time::timeout(per_round * 2, completed.recv())
            .await
            .map_err(|_| Error::Internal(format!("probe round {} timed out", round + 1)))?
            .map_err(|e| Error::Internal(format!("probe events closed: {e}")))?;
    }

    let ranked = prober.process(connection.root_paths(), ProcessContext::ROUTINE);

    match format {
        OutputFormat::Json => {
            let rows: Vec<_> = ranked
                .iter()
                .map(|p| {
                    serde_json::json!({
                        "path": p.fingerprint(),
                        "score_ms": finite_ms(prober.score(p)),
                        "recent_ms": prober.most_recent_score(p).map(|d| d.as_millis()),
                    })
                })
                .collect();
            print_json(&rows)?;
        }
        OutputFormat::Text => {
            for (rank, path) in ranked.iter().enumerate() {
                let score = finite_ms(prober.score(path))
                    .map_or_else(|| "unreachable".to_string(), |ms| format!("{ms} ms"));
                println!("{:>3}. {:<16} {score}", rank + 1, path.fingerprint());
            }
        }
    }

    connection.close();
    Ok(())
}

fn finite_ms(seconds: f64) -> Option<u64> {
    seconds.is_finite().then(|| Duration::from_secs_f64(seconds).as_millis() as u64)
}

/// Print configuration
fn run_config(args: &ConfigArgs, config: &Config) -> Result<()> {
    let config = if args.example { Config::example() } else { config.clone() };
    let output = toml::to_string_pretty(&config)
        .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;

    if let Some(ref path) = args.output {
        write_output(path, &output)?;
        println!("Configuration written to {}", path.display());
    } else {
        println!("{output}");
    }

    Ok(())
}

fn write_output(path: &FsPath, content: &str) -> Result<()> {
    std::fs::write(path, content)?;
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| Error::Internal(format!("Failed to serialize output: {e}")))?;
    println!("{json}");
    Ok(())
}
