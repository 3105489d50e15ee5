//! Offline CLI runs against the fixture catalog. Every download resolves to
//! a `file://` URL under `tests/fixtures/`.

#![allow(deprecated)] // cargo_bin deprecation, replacement not yet stable

use assert_cmd::Command;
use predicates::prelude::*;

const CATALOG: &str = "tests/fixtures/catalog.json";
const CONFIG: &str = "tests/fixtures/duosub.toml";

fn duosub() -> Command {
    let mut cmd = Command::cargo_bin("duosub").expect("binary 'duosub' should be built");
    cmd.env_remove("RUST_LOG").args(["--config", CONFIG]);
    cmd
}

#[test]
fn tracks_lists_menu_in_order() {
    duosub()
        .args(["tracks", CATALOG])
        .assert()
        .success()
        .stdout(predicate::str::contains("Title 42"))
        .stdout(predicate::str::contains("Aspect ratio: 2.400"))
        .stdout(predicate::str::contains("English [CC]"))
        .stdout(predicate::str::contains("Français"))
        .stdout(predicate::str::contains("dehydrated"))
        .stdout(predicate::str::contains("NONE").not());
}

#[test]
fn tracks_json_reports_policy_choice() {
    let output = duosub().args(["tracks", CATALOG, "--json"]).output().unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["movieId"], 42);
    // Off, English, English [CC], Français, Deutsch
    let tracks = json["tracks"].as_array().unwrap();
    assert_eq!(tracks.len(), 5);
    assert_eq!(tracks[0]["kind"], "off");
    assert_eq!(tracks[4]["kind"], "dehydrated");
    assert_eq!(tracks[2]["display_language"], "English [CC]");
    // matchAudio: native audio is English, subtitles beat captions
    assert_eq!(json["selected"], 1);
}

#[test]
fn export_writes_srt_to_stdout() {
    duosub()
        .args(["export", CATALOG, "--language", "fr"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with(
            "1\n00:00:01,000 --> 00:00:03,000\nOù allons-nous ?\n",
        ))
        .stdout(predicate::str::contains("- Au nord.\n- Encore ?"));
}

#[test]
fn export_writes_vtt_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("en.vtt");

    duosub()
        .args(["export", CATALOG, "-l", "en", "--format", "vtt", "--output"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote 3 cues"));

    let content = std::fs::read_to_string(&path).unwrap();
    assert!(content.starts_with("WEBVTT\n\n"));
    assert!(content.contains("00:00:07.000 --> 00:00:09.500\n[BELL RINGING]"));
    assert!(content.contains("- North.\n- Again?"));
}

#[test]
fn export_unknown_language_fails() {
    duosub()
        .args(["export", CATALOG, "--language", "ja"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no track for language ja"));
}

#[test]
fn play_prints_overlay_text() {
    duosub()
        .args(["play", CATALOG, "--start", "1.5", "--duration", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Activated"))
        .stdout(predicate::str::contains("Where are we going?"));
}

#[test]
fn play_with_explicit_language() {
    duosub()
        .args(["play", CATALOG, "--language", "fr", "--start", "1.5", "--duration", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Où allons-nous ?"));
}
