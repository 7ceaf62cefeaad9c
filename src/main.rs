//! File-backed transport for the media bridge
//!
//! Streams a 16 kHz mono WAV file (and optionally a still image) into a
//! Gemini Live session at real-time pace, then writes the spoken reply to a
//! 24 kHz WAV file.
//!
//! Usage: carelive <input.wav> [--image <path>] [--out <reply.wav>]
//!                 [--system <instruction>] [--wait <seconds>]

use anyhow::{bail, Context, Result};
use carelive::{
    AudioChunk, BridgeConfig, GeminiConfig, GeminiConnector, MediaSessionBridge, SessionState,
    VideoFrame,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Capture chunk length.
const CHUNK_MS: u64 = 20;
/// Silence appended after the input so the server detects end of speech.
const TRAILING_SILENCE_MS: u64 = 1500;

struct Args {
    input: PathBuf,
    image: Option<PathBuf>,
    output: PathBuf,
    system_instruction: Option<String>,
    wait: Duration,
}

fn parse_args() -> Result<Args> {
    let mut input = None;
    let mut image = None;
    let mut output = PathBuf::from("reply.wav");
    let mut system_instruction = None;
    let mut wait = Duration::from_secs(30);

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--image" => image = Some(PathBuf::from(args.next().context("--image needs a path")?)),
            "--out" => output = PathBuf::from(args.next().context("--out needs a path")?),
            "--system" => system_instruction = Some(args.next().context("--system needs text")?),
            "--wait" => {
                let secs: u64 = args
                    .next()
                    .context("--wait needs a number of seconds")?
                    .parse()
                    .context("--wait must be a whole number of seconds")?;
                wait = Duration::from_secs(secs);
            }
            other if other.starts_with("--") => bail!("unknown option {}", other),
            other => input = Some(PathBuf::from(other)),
        }
    }

    let input = match input {
        Some(input) => input,
        None => bail!(
            "usage: carelive <input.wav> [--image <path>] [--out <reply.wav>] [--system <text>] [--wait <secs>]"
        ),
    };

    Ok(Args {
        input,
        image,
        output,
        system_instruction,
        wait,
    })
}

fn read_wav(path: &Path, expected_rate: u32) -> Result<Vec<i16>> {
    let mut reader =
        hound::WavReader::open(path).with_context(|| format!("opening {}", path.display()))?;
    let spec = reader.spec();

    if spec.channels != 1
        || spec.bits_per_sample != 16
        || spec.sample_format != hound::SampleFormat::Int
    {
        bail!("{} must be mono 16-bit PCM", path.display());
    }
    if spec.sample_rate != expected_rate {
        bail!(
            "{} is {} Hz, expected {} Hz",
            path.display(),
            spec.sample_rate,
            expected_rate
        );
    }

    let samples = reader
        .samples::<i16>()
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(samples)
}

fn write_wav(path: &Path, samples: &[i16], sample_rate: u32) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::create(path, spec)?;
    for sample in samples {
        writer.write_sample(*sample)?;
    }
    writer.finalize()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = parse_args()?;
    let bridge_config = BridgeConfig::default();

    let mut samples = read_wav(&args.input, bridge_config.inbound_audio_rate)?;
    let silence = bridge_config.inbound_audio_rate as u64 * TRAILING_SILENCE_MS / 1000;
    samples.extend(std::iter::repeat(0i16).take(silence as usize));
    info!("Loaded {} samples from {}", samples.len(), args.input.display());

    let still = match &args.image {
        Some(path) => {
            let img = image::open(path).with_context(|| format!("opening {}", path.display()))?;
            Some(VideoFrame::from_image(&img))
        }
        None => None,
    };

    let mut gemini_config = GeminiConfig::from_env()?;
    gemini_config.system_instruction = args.system_instruction.clone();

    let bridge = Arc::new(MediaSessionBridge::new(
        bridge_config.clone(),
        Arc::new(GeminiConnector::new(gemini_config)),
    ));
    bridge.start().await?;

    let mut turns = bridge.subscribe_turns();
    let mut state = bridge.subscribe_state();

    let collector = {
        let bridge = bridge.clone();
        tokio::spawn(async move {
            let mut reply = Vec::new();
            while let Some(frame) = bridge.emit_audio().await {
                reply.extend_from_slice(&frame.samples);
            }
            reply
        })
    };

    // Nothing renders the echo here, just keep it drained
    let echo = {
        let bridge = bridge.clone();
        tokio::spawn(async move {
            let mut frames = 0usize;
            while bridge.emit_video().await.is_some() {
                frames += 1;
            }
            frames
        })
    };

    let chunk_len = (bridge_config.inbound_audio_rate as u64 * CHUNK_MS / 1000) as usize;
    let mut ticker = tokio::time::interval(Duration::from_millis(CHUNK_MS));
    for (i, chunk) in samples.chunks(chunk_len).enumerate() {
        ticker.tick().await;
        bridge
            .receive_audio(AudioChunk::new(bridge_config.inbound_audio_rate, chunk.to_vec()))
            .await?;

        // the throttle decides which of these reach the session
        if let Some(still) = &still {
            if i % 10 == 0 {
                bridge.receive_video(still.clone(), None).await?;
            }
        }
    }
    info!("Input streamed, waiting for the reply");

    tokio::select! {
        done = tokio::time::timeout(args.wait, turns.changed()) => match done {
            Ok(Ok(())) => info!("Reply complete"),
            Ok(Err(_)) => warn!("Session ended before a reply completed"),
            Err(_) => warn!("No complete reply within {:?}", args.wait),
        },
        _ = state.wait_for(|s| *s == SessionState::Closed) => {
            warn!("Session closed before a reply completed")
        }
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    bridge.shutdown().await;

    let reply = collector.await?;
    let echoed = echo.await?;
    info!("Echoed {} video frames", echoed);

    for turn in bridge.history().await.turns() {
        println!("{}: {}", turn.role.as_str(), turn.text);
    }

    if reply.is_empty() {
        warn!("No reply audio received");
        return Ok(());
    }
    write_wav(&args.output, &reply, bridge_config.outbound_audio_rate)?;
    info!(
        "Wrote {:.1}s of reply audio to {}",
        reply.len() as f32 / bridge_config.outbound_audio_rate as f32,
        args.output.display()
    );
    Ok(())
}
