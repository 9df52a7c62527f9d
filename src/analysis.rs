use crate::answer_log::{AnswerEntry, AnswerLog};
use crate::encode::EncodedImage;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o";
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a careful problem-solving assistant. \
Read the question shown in the screenshot and answer it.\n\n\
1. Identify the question and its type.\n\
2. List the approach and the key facts it relies on.\n\
3. Work through the solution step by step.\n\
4. Finish with the final answer.";
pub const DEFAULT_INSTRUCTION: &str = "Analyze the question in this screenshot and answer it in detail.";
pub const EXTRACTION_INSTRUCTION: &str = "Transcribe all text in this image exactly, keeping its \
layout. Output only the transcribed text without any commentary.";
const MAX_TOKENS: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub supports_vision: bool,
}

pub const AVAILABLE_MODELS: &[ModelInfo] = &[
    ModelInfo {
        id: "gpt-4o",
        name: "GPT-4o",
        supports_vision: true,
    },
    ModelInfo {
        id: "gpt-4o-mini",
        name: "GPT-4o Mini",
        supports_vision: true,
    },
    ModelInfo {
        id: "gpt-4-turbo",
        name: "GPT-4 Turbo",
        supports_vision: true,
    },
    ModelInfo {
        id: "o1",
        name: "o1",
        supports_vision: false,
    },
    ModelInfo {
        id: "o1-mini",
        name: "o1-mini",
        supports_vision: false,
    },
    ModelInfo {
        id: "o3-mini",
        name: "o3-mini",
        supports_vision: false,
    },
];

pub fn model_info(id: &str) -> Option<&'static ModelInfo> {
    AVAILABLE_MODELS.iter().find(|model| model.id == id)
}

/// Models missing from [`AVAILABLE_MODELS`] are trusted to read images.
pub fn supports_vision(model: &str) -> bool {
    model_info(model).is_none_or(|info| info.supports_vision)
}

fn vision_model_names() -> String {
    AVAILABLE_MODELS
        .iter()
        .filter(|model| model.supports_vision)
        .map(|model| model.id)
        .collect::<Vec<_>>()
        .join(", ")
}

/// How a capture reaches the answering model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisPlan {
    /// The answering model reads the image itself.
    Direct { model: String },
    /// A vision model transcribes the image and a text-only model answers.
    Transcribed { reader: String, model: String },
}

/// Refuses to send images to a model that cannot read them, unless a vision
/// capable `extraction_model` is configured to transcribe them first.
pub fn plan_analysis(model: &str, extraction_model: Option<&str>) -> Result<AnalysisPlan> {
    if supports_vision(model) {
        return Ok(AnalysisPlan::Direct {
            model: model.to_string(),
        });
    }
    match extraction_model {
        Some(reader) if supports_vision(reader) => Ok(AnalysisPlan::Transcribed {
            reader: reader.to_string(),
            model: model.to_string(),
        }),
        Some(reader) => bail!(
            "extraction model {reader} cannot read images either; use one of {}",
            vision_model_names()
        ),
        None => bail!(
            "model {model} cannot read images; choose one of {} or set analysis.extraction_model",
            vision_model_names()
        ),
    }
}

#[derive(Debug, Clone)]
pub struct AnalysisResult {
    pub answer: String,
    pub source: String,
}

/// Downstream receiver of captured images.
#[async_trait]
pub trait ImageConsumer: Send + Sync {
    async fn analyze(&self, image: &EncodedImage) -> Result<AnalysisResult>;
}

/// Offline consumer: describes the image instead of asking a model.
#[derive(Debug, Clone)]
pub struct MetadataAnalyzer;

#[async_trait]
impl ImageConsumer for MetadataAnalyzer {
    async fn analyze(&self, image: &EncodedImage) -> Result<AnalysisResult> {
        if image.is_empty() {
            bail!("received an empty image");
        }
        Ok(AnalysisResult {
            answer: format!(
                "Captured {}x{} screen ({} bytes {}, {} base64 characters).",
                image.width(),
                image.height(),
                image.len(),
                EncodedImage::MIME_TYPE,
                image.as_base64().len()
            ),
            source: "metadata".to_string(),
        })
    }
}

/// OpenAI-compatible `chat/completions` client. One attempt per image.
#[derive(Debug, Clone)]
pub struct VisionAnalyzer {
    client: Client,
    api_key: String,
    base_url: String,
    plan: AnalysisPlan,
    prompt: String,
}

impl VisionAnalyzer {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self::with_plan(
            api_key,
            base_url,
            AnalysisPlan::Direct {
                model: model.into(),
            },
            prompt,
        )
    }

    pub fn with_plan(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        plan: AnalysisPlan,
        prompt: impl Into<String>,
    ) -> Self {
        let base_url = base_url.into();
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            plan,
            prompt: prompt.into(),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// The model that writes the answer.
    pub fn model(&self) -> &str {
        match &self.plan {
            AnalysisPlan::Direct { model } | AnalysisPlan::Transcribed { model, .. } => model,
        }
    }

    fn request_body(&self, image: &EncodedImage) -> Value {
        json!({
            "model": self.model(),
            "max_tokens": MAX_TOKENS,
            "messages": [
                {"role": "system", "content": self.prompt},
                {
                    "role": "user",
                    "content": [
                        {
                            "type": "image_url",
                            "image_url": {"url": image.data_url(), "detail": "high"}
                        },
                        {"type": "text", "text": DEFAULT_INSTRUCTION}
                    ]
                }
            ]
        })
    }

    fn extraction_body(reader: &str, image: &EncodedImage) -> Value {
        json!({
            "model": reader,
            "max_tokens": MAX_TOKENS,
            "messages": [
                {
                    "role": "user",
                    "content": [
                        {
                            "type": "image_url",
                            "image_url": {"url": image.data_url(), "detail": "high"}
                        },
                        {"type": "text", "text": EXTRACTION_INSTRUCTION}
                    ]
                }
            ]
        })
    }

    fn transcript_body(&self, transcript: &str) -> Value {
        json!({
            "model": self.model(),
            "max_tokens": MAX_TOKENS,
            "messages": [
                {"role": "system", "content": self.prompt},
                {
                    "role": "user",
                    "content": format!("Answer the following question:\n\n{transcript}")
                }
            ]
        })
    }

    async fn complete(&self, body: &Value) -> Result<String> {
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .with_context(|| format!("failed to call {}", self.endpoint()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("model API error {status}: {body}");
        }

        let json: Value = response
            .json()
            .await
            .context("failed to decode chat completion JSON")?;

        Ok(extract_text(&json)
            .or_else(|| {
                json.pointer("/error/message")
                    .and_then(Value::as_str)
                    .map(ToOwned::to_owned)
            })
            .unwrap_or_else(|| "The model returned no text.".to_string()))
    }
}

#[async_trait]
impl ImageConsumer for VisionAnalyzer {
    async fn analyze(&self, image: &EncodedImage) -> Result<AnalysisResult> {
        match &self.plan {
            AnalysisPlan::Direct { model } => {
                if !supports_vision(model) {
                    bail!("model {model} cannot read images");
                }
                let answer = self.complete(&self.request_body(image)).await?;
                Ok(AnalysisResult {
                    answer,
                    source: model.clone(),
                })
            }
            AnalysisPlan::Transcribed { reader, model } => {
                let transcript = self
                    .complete(&Self::extraction_body(reader, image))
                    .await
                    .with_context(|| format!("{reader} could not transcribe the capture"))?;
                let answer = self.complete(&self.transcript_body(&transcript)).await?;
                Ok(AnalysisResult {
                    answer,
                    source: format!("{model} (read by {reader})"),
                })
            }
        }
    }
}

fn extract_text(root: &Value) -> Option<String> {
    let content = root.pointer("/choices/0/message/content")?;
    if let Some(text) = content.as_str() {
        let text = text.trim();
        return (!text.is_empty()).then(|| text.to_string());
    }

    let fragments: Vec<String> = content
        .as_array()?
        .iter()
        .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .map(|text| text.trim().to_string())
        .collect();

    if fragments.is_empty() {
        None
    } else {
        Some(fragments.join("\n"))
    }
}

#[derive(Debug, Clone)]
pub enum AnalysisEvent {
    Answered { sequence: u64, answer: String },
    Failed { sequence: u64, message: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnalysisSummary {
    pub answered: u64,
    pub failed: u64,
}

/// Consumes delivered images on its own task so that a slow model call never
/// holds up the next capture. Ends when every image sender is dropped.
pub fn spawn_analysis_worker(
    mut images: UnboundedReceiver<EncodedImage>,
    consumer: Arc<dyn ImageConsumer>,
    answer_log: Option<AnswerLog>,
    event_tx: Option<UnboundedSender<AnalysisEvent>>,
) -> JoinHandle<AnalysisSummary> {
    tokio::spawn(async move {
        let mut summary = AnalysisSummary::default();
        let mut sequence = 0;

        while let Some(image) = images.recv().await {
            sequence += 1;
            let timestamp = Utc::now();
            let (width, height) = (image.width(), image.height());

            let result = consumer.analyze(&image).await;
            drop(image);

            match result {
                Ok(result) => {
                    summary.answered += 1;
                    if let Some(answer_log) = &answer_log
                        && let Err(err) = answer_log.append(&AnswerEntry {
                            sequence,
                            timestamp,
                            width,
                            height,
                            source: result.source.clone(),
                            answer: result.answer.clone(),
                        })
                    {
                        log::warn!("failed to record answer {sequence}: {err:#}");
                    }
                    send_event(
                        &event_tx,
                        AnalysisEvent::Answered {
                            sequence,
                            answer: result.answer,
                        },
                    );
                }
                Err(err) => {
                    summary.failed += 1;
                    let message = format!("{err:#}");
                    log::warn!("analysis {sequence} failed: {message}");
                    if let Some(answer_log) = &answer_log
                        && let Err(err) = answer_log.append_failure(sequence, timestamp, &message)
                    {
                        log::warn!("failed to record analysis failure {sequence}: {err:#}");
                    }
                    send_event(&event_tx, AnalysisEvent::Failed { sequence, message });
                }
            }
        }

        summary
    })
}

fn send_event(event_tx: &Option<UnboundedSender<AnalysisEvent>>, event: AnalysisEvent) {
    if let Some(tx) = event_tx {
        let _ = tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::{
        AnalysisEvent, AnalysisPlan, AnalysisResult, ImageConsumer, MetadataAnalyzer,
        VisionAnalyzer, extract_text, plan_analysis, spawn_analysis_worker, supports_vision,
    };
    use crate::answer_log::AnswerLog;
    use crate::encode::{EncodedImage, RawFrame, encode};
    use anyhow::{Result, bail};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::tempdir;
    use tokio::sync::mpsc;

    const DEFAULT_TEST_URL: &str = "http://127.0.0.1:9/v1";

    fn sample_image() -> EncodedImage {
        encode(RawFrame::packed(8, 6, vec![200; 8 * 6 * 4]), 85).expect("encode")
    }

    #[test]
    fn extracts_message_content_string() {
        let value = json!({"choices": [{"message": {"content": "  42  "}}]});
        assert_eq!(extract_text(&value), Some("42".to_string()));
    }

    #[test]
    fn extracts_text_parts_from_content_array() {
        let value = json!({
            "choices": [{
                "message": {
                    "content": [
                        {"type": "text", "text": "line 1"},
                        {"type": "refusal", "refusal": "no"},
                        {"type": "text", "text": "line 2"}
                    ]
                }
            }]
        });
        assert_eq!(extract_text(&value), Some("line 1\nline 2".to_string()));
        assert_eq!(extract_text(&json!({"choices": []})), None);
    }

    #[test]
    fn request_carries_image_as_high_detail_data_url() {
        let analyzer = VisionAnalyzer::new("sk-test", "https://llm.example/v1/", "gpt-4o", "be brief");
        assert_eq!(
            analyzer.endpoint(),
            "https://llm.example/v1/chat/completions"
        );

        let image = sample_image();
        let body = analyzer.request_body(&image);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "be brief");
        let part = &body["messages"][1]["content"][0];
        assert_eq!(part["type"], "image_url");
        assert_eq!(part["image_url"]["detail"], "high");
        assert_eq!(
            part["image_url"]["url"].as_str(),
            Some(image.data_url().as_str())
        );
    }

    struct FailingConsumer;

    #[async_trait]
    impl ImageConsumer for FailingConsumer {
        async fn analyze(&self, _image: &EncodedImage) -> Result<AnalysisResult> {
            bail!("HTTP 503")
        }
    }

    #[tokio::test]
    async fn worker_answers_and_records() {
        let temp = tempdir().expect("tempdir");
        let log_path = temp.path().join("answers.md");
        let (image_tx, image_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();

        let worker = spawn_analysis_worker(
            image_rx,
            Arc::new(MetadataAnalyzer),
            Some(AnswerLog::new(&log_path)),
            Some(event_tx),
        );
        image_tx.send(sample_image()).expect("send");
        drop(image_tx);

        let summary = worker.await.expect("join");
        assert_eq!(summary.answered, 1);
        assert!(matches!(
            event_rx.recv().await,
            Some(AnalysisEvent::Answered { sequence: 1, .. })
        ));

        let content = std::fs::read_to_string(&log_path).expect("log exists");
        assert!(content.contains("Captured 8x6 screen"));
    }

    #[tokio::test]
    async fn worker_reports_failures() {
        let (image_tx, image_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();

        let worker =
            spawn_analysis_worker(image_rx, Arc::new(FailingConsumer), None, Some(event_tx));
        image_tx.send(sample_image()).expect("send");
        image_tx.send(sample_image()).expect("send");
        drop(image_tx);

        let summary = worker.await.expect("join");
        assert_eq!(summary.failed, 2);
        match event_rx.recv().await {
            Some(AnalysisEvent::Failed { sequence, message }) => {
                assert_eq!(sequence, 1);
                assert!(message.contains("503"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn reasoning_models_are_refused_without_a_reader() {
        assert!(supports_vision("gpt-4o-mini"));
        assert!(!supports_vision("o1-mini"));
        assert!(supports_vision("llava-local"));

        let err = plan_analysis("o3-mini", None).expect_err("text-only model");
        let message = err.to_string();
        assert!(message.contains("o3-mini cannot read images"), "{message}");
        assert!(message.contains("gpt-4o, gpt-4o-mini, gpt-4-turbo"), "{message}");

        assert!(plan_analysis("o1", Some("o1-mini")).is_err());
        assert_eq!(
            plan_analysis("gpt-4o", None).expect("vision model"),
            AnalysisPlan::Direct {
                model: "gpt-4o".to_string()
            }
        );
    }

    #[test]
    fn transcribed_plan_reads_with_vision_and_answers_with_text() {
        let plan = plan_analysis("o1", Some("gpt-4o-mini")).expect("reader configured");
        let analyzer = VisionAnalyzer::with_plan("sk-test", DEFAULT_TEST_URL, plan, "solve it");
        assert_eq!(analyzer.model(), "o1");

        let image = sample_image();
        let extraction = VisionAnalyzer::extraction_body("gpt-4o-mini", &image);
        assert_eq!(extraction["model"], "gpt-4o-mini");
        assert_eq!(
            extraction["messages"][0]["content"][0]["image_url"]["url"].as_str(),
            Some(image.data_url().as_str())
        );

        let answer = analyzer.transcript_body("What is 6 x 7?");
        assert_eq!(answer["model"], "o1");
        assert_eq!(answer["messages"][0]["content"], "solve it");
        let question = answer["messages"][1]["content"].as_str().expect("text only");
        assert!(question.ends_with("What is 6 x 7?"));
    }

    #[tokio::test]
    async fn direct_plan_never_sends_images_to_text_models() {
        let analyzer = VisionAnalyzer::new("sk-test", DEFAULT_TEST_URL, "o1-mini", "solve it");
        let err = analyzer
            .analyze(&sample_image())
            .await
            .expect_err("refused before any request");
        assert!(err.to_string().contains("cannot read images"));
    }
}
