//! Command line interface for pathsteer.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::path::{Path, PathDescription, PathSet};
use crate::processor::{
    penalize_bounded, HopPathSorter, LabeledLinkSorter, LatencyPathSorter, PathPenalizer,
    PipelineBuilder, WeightBounds,
};
use crate::types::ProcessContext;

/// pathsteer - path ranking and failover for path-aware networks
#[derive(Parser, Debug)]
#[command(
    name = "pathsteer",
    author,
    version,
    about = "Path ranking, latency probing and quality-driven failover",
    long_about = r#"
pathsteer ranks candidate network paths through a processor pipeline:

  - Static sorters (hop count, metadata latency, labelled links)
  - Penalty weights, as applied by call quality feedback
  - Active latency probing (simulated here over a loopback transport)

EXAMPLES:
  pathsteer rank paths.json --penalty 3fa1c=0.5
  pathsteer probe --path a=20 --path b=45:0.2
  pathsteer config --example
"#
)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, default_value = "warn")]
    pub log_level: String,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Rank a path set read from a JSON file
    Rank(RankArgs),

    /// Simulate latency probing over in-process paths
    Probe(ProbeArgs),

    /// Print configuration
    Config(ConfigArgs),
}

/// Rank command arguments
#[derive(Args, Debug)]
pub struct RankArgs {
    /// JSON file holding an array of path descriptions
    pub paths: PathBuf,

    /// Penalty as FINGERPRINT=WEIGHT (short canonical or full fingerprint)
    #[arg(long = "penalty", value_parser = parse_penalty)]
    pub penalties: Vec<(String, f64)>,

    /// Static sort applied before penalties
    #[arg(long, default_value = "hops")]
    pub sort: SortOrder,
}

/// Probe command arguments
#[derive(Args, Debug)]
pub struct ProbeArgs {
    /// Simulated path as NAME=RTT_MS[:LOSS]
    #[arg(long = "path", value_parser = parse_simulated_path, required = true)]
    pub paths: Vec<SimulatedPath>,

    /// Completed probing rounds to wait for
    #[arg(long, default_value = "2")]
    pub rounds: usize,
}

/// Config command arguments
#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Print the example configuration instead of the effective one
    #[arg(long)]
    pub example: bool,

    /// Output path
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Static ordering applied by `rank`
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SortOrder {
    /// Keep file order
    None,
    /// Fewest hops first
    Hops,
    /// Lowest metadata latency first
    Latency,
    /// Fewest traffic-controlled links first
    Labeled,
}

/// A path of the probe simulation.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedPath {
    pub name: String,
    pub rtt: Duration,
    pub loss: f64,
}

/// Parse `FINGERPRINT=WEIGHT`.
pub fn parse_penalty(s: &str) -> Result<(String, f64), String> {
    let (fingerprint, weight) = s
        .split_once('=')
        .ok_or_else(|| format!("expected FINGERPRINT=WEIGHT, got '{s}'"))?;
    let weight: f64 = weight
        .trim()
        .parse()
        .map_err(|e| format!("invalid weight '{weight}': {e}"))?;
    if fingerprint.trim().is_empty() {
        return Err("empty fingerprint".into());
    }
    Ok((fingerprint.trim().to_string(), weight))
}

/// Parse `NAME=RTT_MS[:LOSS]`.
pub fn parse_simulated_path(s: &str) -> Result<SimulatedPath, String> {
    let (name, rest) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=RTT_MS[:LOSS], got '{s}'"))?;
    let (rtt, loss) = rest.split_once(':').unwrap_or((rest, "0"));

    let rtt: u64 = rtt.parse().map_err(|e| format!("invalid rtt '{rtt}': {e}"))?;
    let loss: f64 = loss.parse().map_err(|e| format!("invalid loss '{loss}': {e}"))?;
    if !(0.0..=1.0).contains(&loss) {
        return Err(format!("loss {loss} outside [0, 1]"));
    }

    Ok(SimulatedPath {
        name: name.to_string(),
        rtt: Duration::from_millis(rtt),
        loss,
    })
}

/// Rank `descriptions` by `sort`, then by the given penalties.
///
/// Penalties naming no path of the set are ignored. Returns the ranked set
/// and the weight of every penalized path.
pub fn rank_paths(
    descriptions: Vec<PathDescription>,
    penalties: &[(String, f64)],
    sort: SortOrder,
) -> (PathSet, Vec<(Path, f64)>) {
    let paths: PathSet = descriptions.into_iter().map(Path::from).collect();
    let penalizer = std::sync::Arc::new(PathPenalizer::named("CLI", false));

    for (fingerprint, weight) in penalties {
        let matched = paths.iter().find(|p| {
            p.canonical_fingerprint_short() == fingerprint || p.fingerprint() == fingerprint
        });
        match matched {
            Some(path) => {
                penalize_bounded(&penalizer, path, *weight, WeightBounds::default());
            }
            None => tracing::warn!(fingerprint = %fingerprint, "No path matches penalty"),
        }
    }

    let builder = match sort {
        SortOrder::None => PipelineBuilder::new(),
        SortOrder::Hops => PipelineBuilder::new().passive(HopPathSorter),
        SortOrder::Latency => PipelineBuilder::new().passive(LatencyPathSorter),
        SortOrder::Labeled => PipelineBuilder::new().passive(LabeledLinkSorter),
    };
    let pipeline = builder.penalizer(penalizer.clone()).build();

    let ranked = crate::processor::PathProcessor::process(&pipeline, paths, ProcessContext::ROUTINE);
    let weights = penalizer.weights().into_iter().collect();
    (ranked, weights)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_penalty() {
        assert_eq!(parse_penalty("abcde=0.5"), Ok(("abcde".into(), 0.5)));
        assert_eq!(parse_penalty("abcde=-0.1"), Ok(("abcde".into(), -0.1)));
        assert!(parse_penalty("abcde").is_err());
        assert!(parse_penalty("=1").is_err());
        assert!(parse_penalty("abcde=lots").is_err());
    }

    #[test]
    fn test_parse_simulated_path() {
        let path = parse_simulated_path("b=45:0.2").unwrap();
        assert_eq!(path.name, "b");
        assert_eq!(path.rtt, Duration::from_millis(45));
        assert!((path.loss - 0.2).abs() < f64::EPSILON);

        assert_eq!(parse_simulated_path("a=20").unwrap().loss, 0.0);
        assert!(parse_simulated_path("a=20:2").is_err());
        assert!(parse_simulated_path("a").is_err());
    }

    #[test]
    fn test_rank_paths() {
        let descriptions: Vec<PathDescription> = serde_json::from_str(
            r#"[
                {"fingerprint": "a 1 b 2 c", "hops": 3},
                {"fingerprint": "a 3 c", "hops": 2},
                {"fingerprint": "a 4 d 5 e 6 c", "hops": 4}
            ]"#,
        )
        .unwrap();

        let (ranked, weights) = rank_paths(descriptions.clone(), &[], SortOrder::Hops);
        let hops: Vec<_> = ranked.iter().map(Path::hops).collect();
        assert_eq!(hops, vec![2, 3, 4]);
        assert!(weights.is_empty());

        let short = Path::new("a 3 c", 2).canonical_fingerprint_short().to_string();
        let (ranked, weights) =
            rank_paths(descriptions, &[(short, 1.0), ("nope".into(), 1.0)], SortOrder::Hops);
        assert_eq!(ranked.last().map(Path::hops), Some(2));
        assert_eq!(weights.len(), 1);
    }
}
