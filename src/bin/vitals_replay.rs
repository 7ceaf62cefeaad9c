/// Replays a recorded vital-signs stream and prints the alerts it raises
///
/// Input is JSON lines, one reading per line, sampled once per second:
///   {"heart_rate":72,"respiratory_rate":16,"body_temperature":36.8,
///    "oxygen_saturation":98,"systolic_bp":115,"diastolic_bp":75}
///
/// Usage: vitals_replay <readings.jsonl> [--patient <context.json>]
use anyhow::{bail, Context, Result};
use carelive::vitals::{
    MemoryAlertStore, PatientContext, RangeClassifier, VitalReading, VitalsMonitor,
};
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn default_context() -> PatientContext {
    PatientContext {
        patient_id: "patient".to_string(),
        patient_name: "Unknown Patient".to_string(),
        issue_id: "replay".to_string(),
        doctor_ids: vec!["on-call".to_string()],
        demographics: Default::default(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let mut input = None;
    let mut context_path = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--patient" => {
                context_path = Some(PathBuf::from(args.next().context("--patient needs a path")?))
            }
            other if other.starts_with("--") => bail!("unknown option {}", other),
            other => input = Some(PathBuf::from(other)),
        }
    }
    let Some(input) = input else {
        bail!("usage: vitals_replay <readings.jsonl> [--patient <context.json>]");
    };

    let context = match context_path {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
        }
        None => default_context(),
    };

    let store = Arc::new(MemoryAlertStore::new());
    let mut monitor = VitalsMonitor::new(
        context,
        Arc::new(RangeClassifier::default()),
        store.clone(),
        chrono::Utc::now(),
    )?;

    let file = std::fs::File::open(&input).with_context(|| format!("opening {}", input.display()))?;
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<VitalReading>(&line) {
            Ok(reading) => {
                monitor.observe(reading).await;
            }
            Err(e) => warn!("Skipping line {}: {}", lineno + 1, e),
        }
    }

    let alerts = store.alerts().await;
    info!(
        "Processed {} readings, raised {} alerts",
        monitor.readings(),
        alerts.len()
    );
    for alert in alerts {
        println!("{}", serde_json::to_string(&alert)?);
    }
    Ok(())
}
