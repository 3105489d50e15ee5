//! `duosub` CLI - Inspect catalogs, replay them headlessly, export tracks

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use duosub::export::{self, ExportFormat};
use duosub::track::{Primitive, TrackSummary};
use duosub::{
    select_initial, ChatTranslator, DownloadState, Extent, HeadlessHost, HostPlayer, HttpFetcher, Manifest,
    ManifestActivation, MemoryCatalogStore, SessionObserver, Settings, SubtitleTrack, TrackFactory,
    TranslationConfig, TranslationSetup,
};

#[derive(Parser)]
#[command(name = "duosub")]
#[command(about = "Dual subtitle overlay engine")]
#[command(version)]
struct Cli {
    /// Settings file (default: ~/.config/duosub/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the subtitle tracks a catalog offers
    Tracks {
        /// Catalog JSON file
        catalog: PathBuf,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Replay a catalog against a headless player and print overlay changes
    Play {
        /// Catalog JSON file
        catalog: PathBuf,

        /// Select this language instead of the configured policy
        #[arg(short, long)]
        language: Option<String>,

        /// Start position in seconds
        #[arg(long, default_value = "0")]
        start: f64,

        /// Seconds of playback to simulate
        #[arg(short, long, default_value = "10")]
        duration: f64,

        /// Viewport size as WIDTHxHEIGHT
        #[arg(long, default_value = "1280x720")]
        viewport: String,

        /// Add the AI-translated entry
        #[arg(long)]
        translate: bool,
    },

    /// Download one track and write it as a sidecar file
    Export {
        /// Catalog JSON file
        catalog: PathBuf,

        /// BCP47 code of the track
        #[arg(short, long)]
        language: String,

        /// Prefer the closed-caption variant
        #[arg(long)]
        captions: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value = "srt")]
        format: FormatArg,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Translate the track and wait for every batch before writing
        #[arg(long)]
        translate: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    Srt,
    Vtt,
}

impl From<FormatArg> for ExportFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Srt => Self::Srt,
            FormatArg::Vtt => Self::Vtt,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let settings = match &cli.config {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    }
    .context("failed to load settings")?;

    match cli.command {
        Commands::Tracks { catalog, json } => {
            cmd_tracks(&settings, &catalog, json)?;
        }
        Commands::Play {
            catalog,
            language,
            start,
            duration,
            viewport,
            translate,
        } => {
            let viewport = parse_viewport(&viewport)?;
            cmd_play(&settings, &catalog, language.as_deref(), start, duration, viewport, translate).await?;
        }
        Commands::Export {
            catalog,
            language,
            captions,
            format,
            output,
            translate,
        } => {
            cmd_export(&settings, &catalog, &language, captions, format.into(), output.as_deref(), translate).await?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let builder = FmtSubscriber::builder()
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact();

    if std::env::var_os("RUST_LOG").is_some() {
        builder.with_env_filter(EnvFilter::from_default_env()).init();
    } else {
        builder
            .with_max_level(if verbose { Level::DEBUG } else { Level::INFO })
            .init();
    }
}

fn load_manifest(path: &Path) -> Result<Manifest> {
    let text = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    Manifest::from_json(&text).with_context(|| format!("invalid catalog {}", path.display()))
}

fn parse_viewport(value: &str) -> Result<Extent> {
    let (w, h) = value
        .split_once('x')
        .with_context(|| format!("viewport must be WIDTHxHEIGHT, got {value}"))?;
    let width: f64 = w.trim().parse().context("invalid viewport width")?;
    let height: f64 = h.trim().parse().context("invalid viewport height")?;
    if width <= 0.0 || height <= 0.0 {
        bail!("viewport must be positive, got {value}");
    }
    Ok(Extent::new(width, height))
}

fn build_factory(config: Option<&TranslationConfig>) -> Result<TrackFactory> {
    let fetcher = HttpFetcher::new().context("failed to build HTTP client")?;
    let mut factory = TrackFactory::new(Arc::new(fetcher));
    if let Some(config) = config {
        let translator = ChatTranslator::from_config(config).context("failed to set up translator")?;
        factory = factory.with_translation(Arc::new(TranslationSetup::new(Arc::new(translator), config.clone())));
    }
    Ok(factory)
}

/// The menu order activation produces: "Off", catalog tracks, then the
/// translated entry.
fn menu_tracks(factory: &TrackFactory, manifest: &Manifest) -> Vec<Arc<SubtitleTrack>> {
    let mut tracks = vec![Arc::new(SubtitleTrack::dummy())];
    tracks.extend(factory.build_all(manifest).into_iter().map(Arc::new));
    if let Some(ai) = factory
        .translation_source(manifest)
        .and_then(|source| factory.build_ai_translated(source))
    {
        tracks.push(Arc::new(ai));
    }
    tracks
}

fn cmd_tracks(settings: &Settings, catalog: &Path, json: bool) -> Result<()> {
    let manifest = load_manifest(catalog)?;
    let translation = settings.translation.enabled.then_some(&settings.translation);
    let factory = build_factory(translation)?;
    let tracks = menu_tracks(&factory, &manifest);
    let selected = select_initial(&tracks, &manifest, &settings.options);

    if json {
        let summaries: Vec<TrackSummary> = tracks.iter().map(|t| t.summary()).collect();
        let out = serde_json::json!({
            "movieId": manifest.movie_id,
            "selected": selected,
            "tracks": summaries,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("🎬 Title {}", manifest.movie_id);
    if let Some(ratio) = manifest.aspect_ratio() {
        println!("   Aspect ratio: {ratio:.3}");
    }
    if let Some(audio) = manifest.audio_language() {
        println!("   Audio: {audio}");
    }
    println!("\n📋 Tracks:");
    for (i, track) in tracks.iter().enumerate() {
        let marker = if selected == Some(i) { "*" } else { " " };
        let meta = track.meta();
        println!(
            "{marker} {i:>2}  {:<10} {:<8} {}",
            track.kind().name(),
            meta.bcp47,
            meta.display_language
        );
    }
    Ok(())
}

/// Mirrors session notifications into the log.
struct LogObserver;

impl SessionObserver for LogObserver {
    fn tracks_changed(&self, tracks: &[TrackSummary]) {
        let active = tracks
            .iter()
            .find(|t| t.active && t.kind != "off")
            .map_or("Off", |t| t.display_language.as_str());
        info!(tracks = tracks.len(), active, "Track menu changed");
    }

    fn language_selected(&self, bcp47: &str, is_caption: bool) {
        info!(language = bcp47, is_caption, "Last used language updated");
    }
}

fn describe(primitives: &[Primitive]) -> String {
    if primitives.is_empty() {
        return "(empty)".to_string();
    }
    primitives
        .iter()
        .map(|p| match p {
            Primitive::Text(text) => text.lines.join(" / "),
            Primitive::Image(image) => format!("[image {}]", image.src),
        })
        .collect::<Vec<_>>()
        .join(" | ")
}

async fn cmd_play(
    settings: &Settings,
    catalog: &Path,
    language: Option<&str>,
    start: f64,
    duration: f64,
    viewport: Extent,
    translate: bool,
) -> Result<()> {
    let manifest = load_manifest(catalog)?;
    let movie_id = manifest.movie_id;

    let translation = (translate || settings.translation.enabled).then_some(&settings.translation);
    let factory = build_factory(translation)?;

    let host = Arc::new(HeadlessHost::new(viewport));
    host.open_title(movie_id, format!("blob:title-{movie_id}"));
    host.seek(start);

    let (_options_tx, options_rx) = watch::channel(settings.options.clone());
    let mut activation = ManifestActivation::new(host.clone(), Arc::new(MemoryCatalogStore::new()), factory, options_rx)
        .with_observer(Arc::new(LogObserver))
        .with_config(settings.activation.clone())
        .with_loop_config(settings.render_loop.clone());

    let outcome = activation.on_manifest(manifest).await?;
    println!("▶️  {outcome:?}");

    if let Some(language) = language {
        let index = activation
            .tracks()
            .iter()
            .position(|t| t.meta().bcp47 == language)
            .with_context(|| format!("no track for language {language}"))?;
        activation.select(index);
    }

    host.play();
    let mut seen = 0;
    let mut poll = tokio::time::interval(Duration::from_millis(50));
    let deadline = tokio::time::Instant::now() + Duration::from_secs_f64(duration.max(0.0));

    while tokio::time::Instant::now() < deadline {
        poll.tick().await;
        let replacements = host.overlay_replacements();
        if replacements != seen {
            seen = replacements;
            let time = host.video().map_or(0.0, |v| v.current_time);
            println!("{time:>9.3}s  {}", describe(&host.overlay()));
        }
        if !activation.is_render_loop_running() {
            println!("⏹  Render loop stopped");
            break;
        }
    }

    activation.stop_render_loop();
    if let Some(track) = activation.active_track() {
        println!("📊 {} ended in state {:?}", track.meta().display_language, track.state());
    }
    Ok(())
}

async fn cmd_export(
    settings: &Settings,
    catalog: &Path,
    language: &str,
    captions: bool,
    format: ExportFormat,
    output: Option<&Path>,
    translate: bool,
) -> Result<()> {
    let manifest = load_manifest(catalog)?;

    let track = if translate {
        let config = TranslationConfig {
            enabled: true,
            source_language: language.to_string(),
            ..settings.translation.clone()
        };
        let factory = build_factory(Some(&config))?;
        let source = factory
            .translation_source(&manifest)
            .with_context(|| format!("no text track for language {language}"))?;
        factory
            .build_ai_translated(source)
            .context("track cannot be translated")?
    } else {
        let factory = build_factory(None)?;
        let mut candidates: Vec<SubtitleTrack> = factory
            .build_all(&manifest)
            .into_iter()
            .filter(|t| t.meta().bcp47 == language && !t.is_dehydrated())
            .collect();
        candidates.sort_by_key(|t| t.meta().is_caption != captions);
        candidates
            .into_iter()
            .next()
            .with_context(|| format!("no track for language {language}"))?
    };

    if track.activate().await != DownloadState::Ready {
        bail!("failed to download {}", track.meta().display_language);
    }
    if let Some(handle) = track.translation() {
        if let Some(progress) = handle.wait().await {
            info!(
                completed = progress.completed,
                failed = progress.failed_batches,
                "Translation finished"
            );
        }
    }

    let sheet = track.cues().context("track has no cues")?;
    let entries = export::entries_from_sheet(&sheet);
    if entries.is_empty() {
        bail!("{} has no text cues to export", track.meta().display_language);
    }

    match output {
        Some(path) => {
            export::write_to_file(format, &entries, path)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("💾 Wrote {} cues to {}", entries.len(), path.display());
        }
        None => {
            let mut stdout = tokio::io::stdout();
            export::write_to(format, &entries, &mut stdout).await?;
        }
    }
    Ok(())
}
