use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use smartfire_rs::config::{ConfigOverrides, LoggingConfig, LoggingOverrides, QueueOverrides};
use smartfire_rs::{
    FeatureLayer, FeatureLayerReader, Fire, JobState, MethodRegistry, ReconciliationStream,
    Smartfire, SmartfireConfig, StreamId,
};
use time::Date;
use tracing::{info, warn, Level};

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|arg| arg == flag)
}

fn print_help() {
    eprintln!(
        r#"smartfire_reconcile - Reconcile fire detections into events

USAGE:
    smartfire_reconcile --scenario <FILE> [OPTIONS]

OPTIONS:
    -c, --config <FILE>       Path to config file (TOML)
    -s, --scenario <FILE>     Scenario with streams, fires and layers (JSON)
    -w, --workers <N>         Override worker thread count [default: available cores]
        --log-level <LEVEL>   Override log level [default: info]
        --log-file <FILE>     Write logs to a file instead of stderr
        --timeout <SECS>      Seconds to wait for each job [default: 300]
    -h, --help                Print help

ENVIRONMENT:
    SMARTFIRE_CONFIG          Path to config file
    SMARTFIRE_QUEUE_WORKERS   Worker thread count

SCENARIO FILE:
    {{
      "streams": [{{ "id": 1, "name": "National", "sources": [...], "weightings": [...] }}],
      "fires":   [{{ "id": 1, "source": 1, "shape": {{...}}, "start": "...", "end": "..." }}],
      "layers":  [{{ "name": "counties", "features": [...] }}],
      "jobs":    [{{ "stream": 1, "first": "2024-07-01", "last": "2024-07-03" }}]
    }}

    Without "jobs", every stream is reconciled over the days its fires span.
"#
    );
}

#[derive(Debug, Deserialize)]
struct Scenario {
    #[serde(default)]
    streams: Vec<ReconciliationStream>,
    #[serde(default)]
    fires: Vec<Fire>,
    #[serde(default)]
    layers: Vec<FeatureLayer>,
    #[serde(default)]
    jobs: Vec<JobRequest>,
}

#[derive(Debug, Deserialize)]
struct JobRequest {
    stream: StreamId,
    first: Date,
    last: Date,
}

fn load_scenario(path: &Path) -> anyhow::Result<Scenario> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read scenario {}", path.display()))?;
    let scenario = serde_json::from_str(&raw)?;
    Ok(scenario)
}

fn init_logging(logging: &LoggingConfig) -> anyhow::Result<()> {
    let level: Level = logging
        .level
        .parse()
        .with_context(|| format!("invalid log level {:?}", logging.level))?;
    if let Some(path) = &logging.file {
        let file = fs::File::create(path)?;
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .init();
    }
    Ok(())
}

/// Day span covered by the fires of `stream`'s sources
fn fire_days(scenario: &Scenario, stream: &ReconciliationStream) -> Option<(Date, Date)> {
    let fires = scenario
        .fires
        .iter()
        .filter(|fire| stream.source(fire.source).is_some());
    let mut span: Option<(Date, Date)> = None;
    for fire in fires {
        let (start, end) = (fire.start.date(), fire.end.date());
        span = Some(match span {
            Some((first, last)) => (first.min(start), last.max(end)),
            None => (start, end),
        });
    }
    span
}

fn main() -> anyhow::Result<()> {
    if has_flag("-h") || has_flag("--help") {
        print_help();
        return Ok(());
    }

    let mut overrides = ConfigOverrides::default();
    if let Some(workers) = parse_arg("--workers").or_else(|| parse_arg("-w")) {
        overrides.queue = Some(QueueOverrides {
            workers: Some(workers.parse()?),
        });
    }
    let log_level = parse_arg("--log-level");
    let log_file = parse_arg("--log-file");
    if log_level.is_some() || log_file.is_some() {
        overrides.logging = Some(LoggingOverrides {
            level: log_level,
            file: log_file.map(Into::into),
        });
    }

    // Load config: CLI > Env > File > Defaults
    let config_path = parse_arg("--config")
        .or_else(|| parse_arg("-c"))
        .or_else(|| std::env::var("SMARTFIRE_CONFIG").ok());
    let config = SmartfireConfig::load(config_path.as_deref(), overrides)?;
    init_logging(&config.logging)?;

    let Some(scenario_path) = parse_arg("--scenario").or_else(|| parse_arg("-s")) else {
        print_help();
        anyhow::bail!("missing --scenario");
    };
    let timeout = Duration::from_secs(
        parse_arg("--timeout")
            .map(|value| value.parse())
            .transpose()?
            .unwrap_or(300),
    );

    let scenario = load_scenario(Path::new(&scenario_path))?;
    info!(
        "Loaded {} streams, {} fires and {} summary layers",
        scenario.streams.len(),
        scenario.fires.len(),
        scenario.layers.len()
    );

    let layers = FeatureLayerReader::from_layers(scenario.layers.iter().cloned());
    let smartfire =
        Smartfire::with_components(config, MethodRegistry::with_defaults(), Arc::new(layers))?;
    for stream in &scenario.streams {
        smartfire.add_stream(stream.clone());
    }
    smartfire.ingest(scenario.fires.iter().cloned());

    let mut queued = Vec::new();
    if scenario.jobs.is_empty() {
        for stream in scenario.streams.iter().filter(|s| s.auto_reconcile) {
            match fire_days(&scenario, stream) {
                Some((first, last)) => {
                    queued.push(smartfire.reconcile_days(stream.id, first, last)?)
                }
                None => warn!("Stream {} has no fires to reconcile", stream.name),
            }
        }
    } else {
        for request in &scenario.jobs {
            queued.push(smartfire.reconcile_days(request.stream, request.first, request.last)?);
        }
    }

    let mut failed = 0;
    for job in &queued {
        let state = job.wait(timeout);
        let info = job.info();
        match state {
            JobState::Success => info!(
                "{} finished in {}: {}",
                info.name,
                info.elapsed_string(),
                info.progress.status
            ),
            JobState::Failure => {
                failed += 1;
                warn!(
                    "{} failed: {}",
                    info.name,
                    info.error.unwrap_or_default()
                );
            }
            JobState::Queued | JobState::Running => {
                failed += 1;
                warn!("{} did not finish within {:?}", info.name, timeout);
            }
        }
    }

    let mut events = Vec::new();
    for stream in &scenario.streams {
        events.extend(smartfire.events_for_stream(stream.id));
    }
    println!("{}", serde_json::to_string_pretty(&events)?);

    smartfire.dispose();
    if failed > 0 {
        anyhow::bail!("{} of {} jobs did not succeed", failed, queued.len());
    }
    Ok(())
}
