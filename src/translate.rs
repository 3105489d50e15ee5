//! Background translation of a text track.
//!
//! Cues are sent to a chat-completions endpoint in fixed-size batches. Each
//! batch must come back as a JSON array with one string per input line; a
//! batch that fails or returns anything else is skipped and the pipeline
//! moves on. Successful batches rewrite each cue as `original\ntranslated`
//! with one whole-value swap per cue, so the render loop never sees half a
//! batch applied to a single cue.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::TranslationConfig;
use crate::error::{Error, Result};
use crate::track::CueSheet;

/// Sends one batch of lines and returns the raw model output.
#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate_batch(&self, lines: &[String]) -> Result<String>;
}

/// Everything an AI-translated track needs to start its pipeline.
pub struct TranslationSetup {
    pub translator: Arc<dyn Translator>,
    pub config: TranslationConfig,
}

impl TranslationSetup {
    pub fn new(translator: Arc<dyn Translator>, config: TranslationConfig) -> Self {
        Self { translator, config }
    }
}

fn system_prompt(target_language: &str) -> String {
    format!(
        "You translate subtitles into {target_language}. The user sends a JSON array of strings, \
         one subtitle line each. Reply with only a JSON array of the same length, one translation \
         per input line, in the same order. Do not merge, split, or renumber lines. Keep \
         onomatopoeia and sound-effect markers such as [music] or (laughs) verbatim."
    )
}

/// OpenAI-compatible chat completions client.
pub struct ChatTranslator {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    target_language: String,
}

impl ChatTranslator {
    /// Build from settings, reading the API key from the configured
    /// environment variable.
    pub fn from_config(config: &TranslationConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .use_rustls_tls()
            .gzip(true)
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: std::env::var(&config.api_key_env).ok().filter(|k| !k.trim().is_empty()),
            target_language: config.target_language.clone(),
        })
    }

    fn request_body(&self, lines: &[String]) -> Result<serde_json::Value> {
        Ok(json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system_prompt(&self.target_language)},
                {"role": "user", "content": serde_json::to_string(lines)?},
            ],
            "temperature": 0.2,
        }))
    }
}

#[async_trait]
impl Translator for ChatTranslator {
    #[instrument(skip(self, lines), fields(lines = lines.len(), model = %self.model))]
    async fn translate_batch(&self, lines: &[String]) -> Result<String> {
        let body = self.request_body(lines)?;
        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Status {
                url: self.endpoint.clone(),
                status: status.as_u16(),
            });
        }
        let value: serde_json::Value = response.json().await?;
        extract_content(&value)
            .map(str::to_string)
            .ok_or_else(|| Error::Translation("response missing message content".to_string()))
    }
}

/// Pull `choices[0].message.content` out of a chat completions response.
fn extract_content(value: &serde_json::Value) -> Option<&str> {
    value
        .get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
}

/// Parse model output into exactly `expected` strings.
///
/// A surrounding Markdown code fence is stripped first.
pub fn parse_translation(raw: &str, expected: usize) -> Result<Vec<String>> {
    let mut body = raw.trim();
    if let Some(rest) = body.strip_prefix("```") {
        // Drop the info string (e.g. "json") on the fence line
        body = rest.split_once('\n').map_or("", |(_, after)| after);
        body = body.trim_end().strip_suffix("```").unwrap_or(body).trim();
    }

    let lines: Vec<String> =
        serde_json::from_str(body).map_err(|e| Error::Translation(format!("not a JSON string array: {e}")))?;
    if lines.len() != expected {
        return Err(Error::LineCountMismatch {
            expected,
            got: lines.len(),
        });
    }
    Ok(lines)
}

// ─── Pipeline ──────────────────────────────────────────────────────────────

/// Progress published after every batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TranslationProgress {
    /// Cues processed so far, translated or skipped
    pub completed: usize,
    pub total: usize,
    /// Cues whose text now carries a translation
    pub translated: usize,
    pub failed_batches: usize,
    pub finished: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TranslationStatus {
    Running,
    Completed,
    /// The task ended without finishing (panicked)
    Failed,
}

/// Observable handle for a pipeline nobody awaits.
#[derive(Debug)]
pub struct TranslationHandle {
    progress: watch::Receiver<TranslationProgress>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TranslationHandle {
    pub fn progress(&self) -> TranslationProgress {
        self.progress.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TranslationProgress> {
        self.progress.clone()
    }

    pub fn status(&self) -> TranslationStatus {
        if self.progress.borrow().finished {
            return TranslationStatus::Completed;
        }
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        match task.as_ref() {
            Some(handle) if handle.is_finished() => TranslationStatus::Failed,
            _ => TranslationStatus::Running,
        }
    }

    /// Wait until the last batch has been processed.
    ///
    /// Returns the final progress, or `None` if the task died first.
    pub async fn wait(&self) -> Option<TranslationProgress> {
        let mut rx = self.progress.clone();
        let done = rx.wait_for(|p| p.finished).await.ok()?.clone();
        Some(done)
    }
}

pub struct TranslationOverlay;

impl TranslationOverlay {
    /// Start translating `sheet` in the background.
    pub fn spawn(sheet: Arc<CueSheet>, setup: Arc<TranslationSetup>) -> TranslationHandle {
        let total = sheet.text_cues().count();
        let (tx, rx) = watch::channel(TranslationProgress {
            total,
            ..TranslationProgress::default()
        });
        let task = tokio::spawn(async move {
            Self::run(&sheet, &setup, &tx).await;
        });
        TranslationHandle {
            progress: rx,
            task: Mutex::new(Some(task)),
        }
    }

    #[instrument(skip_all, fields(target = %setup.config.target_language))]
    async fn run(sheet: &CueSheet, setup: &TranslationSetup, tx: &watch::Sender<TranslationProgress>) {
        let cues: Vec<_> = sheet.text_cues().collect();
        let batch_size = setup.config.batch_size.max(1);
        let batches = cues.len().div_ceil(batch_size);
        info!(cues = cues.len(), batches, "Translation started");

        for (index, batch) in cues.chunks(batch_size).enumerate() {
            if index > 0 {
                tokio::time::sleep(setup.config.batch_delay()).await;
            }

            let originals: Vec<_> = batch.iter().filter_map(|c| c.text().map(|t| t.get())).collect();
            let lines: Vec<String> = originals.iter().map(|t| t.split_whitespace().collect::<Vec<_>>().join(" ")).collect();

            let outcome = match setup.translator.translate_batch(&lines).await {
                Ok(raw) => parse_translation(&raw, lines.len()),
                Err(e) => Err(e),
            };

            let applied = match outcome {
                Ok(translated) => {
                    for ((cue, original), line) in batch.iter().zip(&originals).zip(translated) {
                        if let Some(text) = cue.text() {
                            text.replace(format!("{original}\n{}", line.trim()));
                        }
                    }
                    sheet.bump_revision();
                    debug!(batch = index, cues = batch.len(), "Batch translated");
                    true
                }
                Err(e) => {
                    warn!(batch = index, error = %e, "Translation batch skipped");
                    false
                }
            };

            tx.send_modify(|p| {
                p.completed += batch.len();
                if applied {
                    p.translated += batch.len();
                } else {
                    p.failed_batches += 1;
                }
            });
        }

        tx.send_modify(|p| p.finished = true);
        let done = tx.borrow().clone();
        info!(
            translated = done.translated,
            total = done.total,
            failed_batches = done.failed_batches,
            "Translation finished"
        );
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::layout::Extent;
    use crate::track::{Cue, CuePayload, CueText};

    /// Upper-cases every line; fails any batch containing "BROKEN".
    pub(crate) struct UpperTranslator {
        pub calls: AtomicUsize,
    }

    impl UpperTranslator {
        pub(crate) fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Translator for UpperTranslator {
        async fn translate_batch(&self, lines: &[String]) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if lines.iter().any(|l| l.contains("BROKEN")) {
                return Ok("Sorry, I can't help with that.".to_string());
            }
            let upper: Vec<String> = lines.iter().map(|l| l.to_uppercase()).collect();
            Ok(format!("```json\n{}\n```", serde_json::to_string(&upper)?))
        }
    }

    pub(crate) fn setup(translator: Arc<dyn Translator>, batch_size: usize) -> Arc<TranslationSetup> {
        let config = TranslationConfig {
            enabled: true,
            batch_size,
            batch_delay_ms: 0,
            ..TranslationConfig::default()
        };
        Arc::new(TranslationSetup::new(translator, config))
    }

    fn sheet(lines: &[&str]) -> Arc<CueSheet> {
        let cues = lines
            .iter()
            .enumerate()
            .map(|(i, text)| Cue {
                id: i,
                begin: i as f64,
                end: i as f64 + 1.0,
                payload: CuePayload::Text(CueText::new(*text, None)),
            })
            .collect();
        Arc::new(CueSheet::new(Extent::new(1280.0, 720.0), cues, None))
    }

    fn text_of(sheet: &CueSheet, i: usize) -> String {
        sheet.cues[i].text().unwrap().get().to_string()
    }

    #[test]
    fn parse_plain_and_fenced() {
        assert_eq!(parse_translation(r#"["a", "b"]"#, 2).unwrap(), vec!["a", "b"]);
        assert_eq!(parse_translation("```json\n[\"a\"]\n```", 1).unwrap(), vec!["a"]);
        assert_eq!(parse_translation("```\n[\"a\"]\n```\n", 1).unwrap(), vec!["a"]);
    }

    #[test]
    fn parse_rejects_wrong_length_and_prose() {
        assert!(matches!(
            parse_translation(r#"["a"]"#, 2),
            Err(Error::LineCountMismatch { expected: 2, got: 1 })
        ));
        assert!(matches!(parse_translation("nope", 1), Err(Error::Translation(_))));
        assert!(parse_translation(r#"[1, 2]"#, 2).is_err());
    }

    #[test]
    fn extract_chat_content() {
        let value = json!({"choices": [{"message": {"role": "assistant", "content": "[\"x\"]"}}]});
        assert_eq!(extract_content(&value), Some("[\"x\"]"));
        assert_eq!(extract_content(&json!({"choices": []})), None);
    }

    #[test]
    fn request_carries_lines_as_json_array() {
        let translator = ChatTranslator::from_config(&TranslationConfig::default()).unwrap();
        let body = translator
            .request_body(&["[door slams]".to_string(), "Hi".to_string()])
            .unwrap();
        assert_eq!(body["model"], "gpt-4.1-mini");
        assert_eq!(body["messages"][1]["content"], r#"["[door slams]","Hi"]"#);
        assert!(body["messages"][0]["content"].as_str().unwrap().contains("zh-Hans"));
    }

    /// Answer exactly one request on a loopback port with `response`.
    async fn serve_once(response: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut chunk = [0u8; 4096];
            // Drain headers and body so closing does not reset the connection
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&request).to_lowercase();
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if request.len() >= end + 4 + length {
                        break;
                    }
                }
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });
        format!("http://{addr}/v1/chat/completions")
    }

    #[tokio::test]
    async fn server_error_reports_status_not_decode_failure() {
        let endpoint = serve_once(
            "HTTP/1.1 503 Service Unavailable\r\nContent-Type: text/html\r\nContent-Length: 25\r\nConnection: close\r\n\r\n<html>overloaded</html>\r\n",
        )
        .await;
        let config = TranslationConfig {
            endpoint,
            api_key_env: "DUOSUB_TEST_NO_SUCH_KEY".to_string(),
            ..TranslationConfig::default()
        };
        let translator = ChatTranslator::from_config(&config).unwrap();

        let err = translator.translate_batch(&["Hi".to_string()]).await.unwrap_err();
        assert!(matches!(err, Error::Status { status: 503, .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn successful_batches_merge_translations() {
        let sheet = sheet(&["hello", "two\nlines", "bye"]);
        let translator = Arc::new(UpperTranslator::new());
        let handle = TranslationOverlay::spawn(sheet.clone(), setup(translator.clone(), 2));

        let done = handle.wait().await.unwrap();
        assert_eq!(done.completed, 3);
        assert_eq!(done.translated, 3);
        assert_eq!(done.failed_batches, 0);
        assert_eq!(translator.calls.load(Ordering::SeqCst), 2);
        assert_eq!(text_of(&sheet, 0), "hello\nHELLO");
        assert_eq!(text_of(&sheet, 1), "two\nlines\nTWO LINES");
        assert_eq!(sheet.revision(), 2);
        assert_eq!(handle.status(), TranslationStatus::Completed);
    }

    #[tokio::test]
    async fn malformed_batch_is_skipped() {
        let sheet = sheet(&["one", "BROKEN", "three", "four"]);
        let translator = Arc::new(UpperTranslator::new());
        let handle = TranslationOverlay::spawn(sheet.clone(), setup(translator, 2));

        let done = handle.wait().await.unwrap();
        assert_eq!(done.completed, 4);
        assert_eq!(done.translated, 2);
        assert_eq!(done.failed_batches, 1);
        assert_eq!(text_of(&sheet, 0), "one");
        assert_eq!(text_of(&sheet, 1), "BROKEN");
        assert_eq!(text_of(&sheet, 2), "three\nTHREE");
        assert_eq!(text_of(&sheet, 3), "four\nFOUR");
    }
}
