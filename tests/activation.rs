//! End-to-end activation against the headless player: a catalog arrives, the
//! selection policy picks a track, and the render loop draws its cues.

use std::sync::Arc;
use std::time::Duration;

use duosub::{
    ActivationConfig, ActivationOutcome, Extent, HeadlessHost, Manifest, ManifestActivation, MemoryCatalogStore,
    MemoryFetcher, Primitive, RecordingObserver, RenderLoopConfig, RenderOptions, SecondaryLanguageMode,
    SessionEvent, TrackFactory,
};
use tokio::sync::watch;

const CATALOG: &str = include_str!("fixtures/catalog.json");
const EN: &str = include_str!("fixtures/en.xml");
const FR: &str = include_str!("fixtures/fr.xml");

struct Harness {
    host: Arc<HeadlessHost>,
    observer: Arc<RecordingObserver>,
    activation: ManifestActivation,
    _options: watch::Sender<RenderOptions>,
}

fn harness(mode: SecondaryLanguageMode) -> Harness {
    let fetcher = MemoryFetcher::new()
        .with_body("file://tests/fixtures/en.xml", EN)
        .with_body("file://tests/fixtures/fr.xml", FR)
        .with_body("mem://de.xml", FR);

    let host = Arc::new(HeadlessHost::new(Extent::new(1280.0, 720.0)));
    host.open_title(42, "blob:title-42");
    host.seek(1.5);

    let observer = Arc::new(RecordingObserver::new());
    let (options, options_rx) = watch::channel(RenderOptions::default().with_mode(mode));
    let activation = ManifestActivation::new(
        host.clone(),
        Arc::new(MemoryCatalogStore::new()),
        TrackFactory::new(Arc::new(fetcher)),
        options_rx,
    )
    .with_observer(observer.clone())
    .with_config(ActivationConfig {
        video_wait_timeout_secs: 1,
        poll_interval_ms: 1,
    })
    .with_loop_config(RenderLoopConfig {
        frame_interval_ms: 5,
        ..RenderLoopConfig::default()
    });

    Harness {
        host,
        observer,
        activation,
        _options: options,
    }
}

fn overlay_text(host: &HeadlessHost) -> Vec<String> {
    host.overlay()
        .into_iter()
        .filter_map(|p| match p {
            Primitive::Text(text) => Some(text.lines.join("\n")),
            Primitive::Image(_) => None,
        })
        .collect()
}

/// Poll the overlay until it satisfies `pred` or two seconds pass.
async fn wait_for_overlay(host: &HeadlessHost, pred: impl Fn(&[String]) -> bool) -> Vec<String> {
    for _ in 0..200 {
        let text = overlay_text(host);
        if pred(&text) {
            return text;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    overlay_text(host)
}

#[tokio::test]
async fn match_audio_shows_native_language() {
    let mut h = harness(SecondaryLanguageMode::MatchAudio);

    let outcome = h
        .activation
        .on_manifest(Manifest::from_json(CATALOG).unwrap())
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ActivationOutcome::Activated {
            movie_id: 42,
            tracks: 5,
            selected: Some(1),
        }
    );

    let tracks = h.activation.tracks();
    assert!(tracks[1].is_active());
    assert!(!tracks[3].is_active());
    assert_eq!(tracks[1].meta().display_language, "English");
    assert!(h.activation.is_render_loop_running());

    let text = wait_for_overlay(&h.host, |t| !t.is_empty()).await;
    assert_eq!(text, vec!["Where are we going?".to_string()]);

    let events = h.observer.events();
    assert!(events.contains(&SessionEvent::RenderLoopStarted));
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::TracksChanged { active: Some(lang), .. } if lang == "English"
    )));

    h.activation.stop_render_loop();
}

#[tokio::test]
async fn switching_language_redraws_and_off_clears() {
    let mut h = harness(SecondaryLanguageMode::MatchAudio);
    h.activation
        .on_manifest(Manifest::from_json(CATALOG).unwrap())
        .await
        .unwrap();
    wait_for_overlay(&h.host, |t| !t.is_empty()).await;

    assert!(h.activation.select(3));
    let text = wait_for_overlay(&h.host, |t| t.iter().any(|l| l.contains("allons"))).await;
    assert_eq!(text, vec!["Où allons-nous ?".to_string()]);
    assert!(!h.activation.tracks()[1].is_active());
    assert!(h.observer.events().contains(&SessionEvent::LanguageSelected {
        bcp47: "fr".to_string(),
        is_caption: false,
    }));

    assert!(h.activation.select(0));
    let text = wait_for_overlay(&h.host, <[String]>::is_empty).await;
    assert!(text.is_empty());
    assert!(h.activation.active_track().is_none());

    h.activation.stop_render_loop();
}

#[tokio::test]
async fn hydrated_catalog_replaces_placeholder() {
    let mut h = harness(SecondaryLanguageMode::Disabled);
    h.activation
        .on_manifest(Manifest::from_json(CATALOG).unwrap())
        .await
        .unwrap();
    assert!(h.activation.tracks()[4].is_dehydrated());
    assert!(h.activation.active_track().is_none());

    let mut value: serde_json::Value = serde_json::from_str(CATALOG).unwrap();
    value["timedtexttracks"][4]["hydrated"] = serde_json::json!(true);
    value["timedtexttracks"][4]["ttDownloadables"] = serde_json::json!({
        "dfxp-ls-sdh": { "downloadUrls": { "1": "mem://de.xml" } }
    });
    let hydrated: Manifest = serde_json::from_value(value).unwrap();

    let outcome = h.activation.on_manifest(hydrated).await.unwrap();
    assert_eq!(
        outcome,
        ActivationOutcome::Merged {
            movie_id: 42,
            replaced: 1,
        }
    );

    let tracks = h.activation.tracks();
    assert_eq!(tracks.len(), 5);
    assert!(!tracks[4].is_dehydrated());
    assert_eq!(tracks[4].meta().display_language, "Deutsch");
    assert!(tracks[0].is_active());

    h.activation.stop_render_loop();
}

#[tokio::test]
async fn catalog_for_background_title_is_ignored() {
    let mut h = harness(SecondaryLanguageMode::MatchAudio);
    h.host.open_title(7, "blob:title-7");

    let outcome = h
        .activation
        .on_manifest(Manifest::from_json(CATALOG).unwrap())
        .await
        .unwrap();
    assert_eq!(outcome, ActivationOutcome::NotDisplayed { movie_id: 42 });
    assert!(h.activation.tracks().is_empty());
    assert!(!h.activation.is_render_loop_running());
}
