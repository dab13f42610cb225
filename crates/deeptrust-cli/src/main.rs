use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::{Parser, Subcommand};
use deeptrust_contracts::schema::MediaType;
use deeptrust_contracts::scoring::check_consistency;
use deeptrust_engine::{AnalysisEngine, AnalysisRequest, EngineOptions};

#[derive(Debug, Parser)]
#[command(name = "deeptrust-rs", version, about = "DeepTrust analysis CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Analyze a local media file and print the normalized result.
    Analyze(AnalyzeArgs),
    /// Evaluate the cross-modal consistency step-function directly.
    Consistency(ConsistencyArgs),
}

#[derive(Debug, Parser)]
struct AnalyzeArgs {
    #[arg(long)]
    input: PathBuf,
    /// image, video or audio; inferred from the file extension when
    /// omitted.
    #[arg(long)]
    media_type: Option<String>,
    #[arg(long)]
    provider: Option<String>,
    #[arg(long)]
    model: Option<String>,
    /// Receipts and the audit trail are written here when set.
    #[arg(long)]
    out: Option<PathBuf>,
    /// Result cache file; omit to disable caching.
    #[arg(long)]
    cache: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct ConsistencyArgs {
    #[arg(long)]
    visual: f64,
    #[arg(long)]
    audio: f64,
    #[arg(long, default_value_t = 50.0)]
    trust: f64,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("deeptrust-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Analyze(args) => run_analyze(args),
        Command::Consistency(args) => run_consistency(args),
    }
}

fn run_analyze(args: AnalyzeArgs) -> Result<i32> {
    let media_type = match args.media_type.as_deref() {
        Some(raw) => MediaType::parse(raw)
            .with_context(|| format!("unknown media type '{raw}'"))?,
        None => infer_media_type(&args.input).with_context(|| {
            format!(
                "cannot infer media type from '{}'; pass --media-type",
                args.input.display()
            )
        })?,
    };

    let bytes = std::fs::read(&args.input)
        .with_context(|| format!("failed reading {}", args.input.display()))?;
    if bytes.is_empty() {
        bail!("{} is empty", args.input.display());
    }

    let engine = AnalysisEngine::new(EngineOptions {
        out_dir: args.out.clone(),
        cache_path: args.cache.clone(),
        ..EngineOptions::default()
    });
    let result = engine.analyze(&AnalysisRequest {
        media_base64: BASE64.encode(&bytes),
        media_type,
        provider: args.provider.clone(),
        model: args.model.clone(),
    })?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(0)
}

fn run_consistency(args: ConsistencyArgs) -> Result<i32> {
    let report = check_consistency(
        MediaType::Video,
        Some(args.visual),
        Some(args.audio),
        args.trust,
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(0)
}

fn infer_media_type(path: &Path) -> Option<MediaType> {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())?;
    match ext.as_str() {
        "png" | "jpg" | "jpeg" | "webp" | "gif" | "bmp" | "tiff" => Some(MediaType::Image),
        "mp4" | "mov" | "webm" | "mkv" | "avi" => Some(MediaType::Video),
        "mp3" | "wav" | "m4a" | "ogg" | "flac" | "aac" => Some(MediaType::Audio),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use deeptrust_contracts::schema::MediaType;

    use super::infer_media_type;

    #[test]
    fn media_type_inferred_from_extension() {
        assert_eq!(infer_media_type(Path::new("a.PNG")), Some(MediaType::Image));
        assert_eq!(infer_media_type(Path::new("clip.mp4")), Some(MediaType::Video));
        assert_eq!(infer_media_type(Path::new("voice.wav")), Some(MediaType::Audio));
        assert_eq!(infer_media_type(Path::new("notes.txt")), None);
        assert_eq!(infer_media_type(Path::new("no_extension")), None);
    }
}
