//! Modality adapters
//!
//! A registry maps MIME type to an `Ingester`. Every adapter normalizes its
//! input to canonical text plus source metadata, or returns `None` when the
//! payload is unsupported or unusable. Binary modalities delegate to the
//! external parse/transcribe/scrape capabilities.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

use crate::providers::{DocumentParser, Scraper, Transcriber};
use crate::types::{IngestError, SourceType};

/// Raw request payload handed to an adapter.
#[derive(Debug, Clone)]
pub struct RawInput {
    pub mime_type: String,
    pub body: Vec<u8>,
    pub source_url: Option<String>,
    pub title: Option<String>,
}

/// Canonical adapter output.
#[derive(Debug, Clone)]
pub struct IngestedContent {
    pub text: String,
    pub source_type: SourceType,
    pub mime_type: String,
    pub content_hash: String,
    pub metadata: HashMap<String, serde_json::Value>,
    pub raw_source: Option<String>,
}

/// Hex SHA-256 of canonical text.
pub fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

fn content(
    text: String,
    source_type: SourceType,
    mime_type: &str,
    metadata: HashMap<String, serde_json::Value>,
    raw_source: Option<String>,
) -> IngestedContent {
    IngestedContent {
        content_hash: content_hash(&text),
        text,
        source_type,
        mime_type: mime_type.to_string(),
        metadata,
        raw_source,
    }
}

/// One modality adapter.
#[async_trait]
pub trait Ingester: Send + Sync {
    fn supports(&self, mime_type: &str) -> bool;

    /// Normalize the input, or `None` when this payload cannot be used.
    async fn ingest(&self, input: &RawInput) -> Result<Option<IngestedContent>, IngestError>;
}

/// Plain text and markdown.
pub struct TextIngester;

#[async_trait]
impl Ingester for TextIngester {
    fn supports(&self, mime_type: &str) -> bool {
        matches!(mime_type, "text/plain" | "text/markdown" | "text/html")
    }

    async fn ingest(&self, input: &RawInput) -> Result<Option<IngestedContent>, IngestError> {
        let Ok(text) = String::from_utf8(input.body.clone()) else {
            return Ok(None);
        };
        if text.trim().is_empty() {
            return Err(IngestError::EmptyBody);
        }
        Ok(Some(content(
            text,
            SourceType::Document,
            &input.mime_type,
            HashMap::new(),
            None,
        )))
    }
}

/// CSV rendered row-by-row as `header: value` lines.
pub struct CsvIngester;

impl CsvIngester {
    fn render(raw: &str) -> Option<(String, usize)> {
        let mut lines = raw.lines().filter(|l| !l.trim().is_empty());
        let header: Vec<String> = split_csv_line(lines.next()?);
        if header.is_empty() {
            return None;
        }

        let mut rendered = Vec::new();
        for line in lines {
            let fields = split_csv_line(line);
            let row: Vec<String> = header
                .iter()
                .zip(fields.iter())
                .map(|(h, v)| format!("{h}: {v}"))
                .collect();
            rendered.push(row.join("; "));
        }
        let count = rendered.len();
        Some((rendered.join("\n"), count))
    }
}

/// Minimal CSV field splitter with double-quote support.
fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                fields.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    fields.push(current.trim().to_string());
    fields
}

#[async_trait]
impl Ingester for CsvIngester {
    fn supports(&self, mime_type: &str) -> bool {
        matches!(mime_type, "text/csv" | "application/csv")
    }

    async fn ingest(&self, input: &RawInput) -> Result<Option<IngestedContent>, IngestError> {
        let Ok(raw) = String::from_utf8(input.body.clone()) else {
            return Ok(None);
        };
        if raw.trim().is_empty() {
            return Err(IngestError::EmptyBody);
        }
        let Some((text, row_count)) = Self::render(&raw) else {
            return Ok(None);
        };
        let mut metadata = HashMap::new();
        metadata.insert("rowCount".to_string(), serde_json::json!(row_count));
        Ok(Some(content(
            text,
            SourceType::Csv,
            &input.mime_type,
            metadata,
            Some(raw),
        )))
    }
}

/// PDF and DOCX via the external parse service. XLSX rides the same path.
pub struct BinaryDocIngester {
    parser: Option<Arc<dyn DocumentParser>>,
}

impl BinaryDocIngester {
    pub fn new(parser: Option<Arc<dyn DocumentParser>>) -> Self {
        Self { parser }
    }
}

#[async_trait]
impl Ingester for BinaryDocIngester {
    fn supports(&self, mime_type: &str) -> bool {
        matches!(
            mime_type,
            "application/pdf"
                | "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
                | "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
                | "application/msword"
        )
    }

    async fn ingest(&self, input: &RawInput) -> Result<Option<IngestedContent>, IngestError> {
        let Some(parser) = &self.parser else {
            tracing::warn!(mime = %input.mime_type, "no parse service configured, skipping");
            return Ok(None);
        };
        let text = parser
            .parse_document(&input.body, &input.mime_type)
            .await
            .map_err(|e| IngestError::AdapterFailed {
                mime_type: input.mime_type.clone(),
                reason: e.to_string(),
            })?;
        if text.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(content(
            text,
            SourceType::Document,
            &input.mime_type,
            HashMap::new(),
            None,
        )))
    }
}

/// Images through tiered OCR.
pub struct ImageIngester {
    parser: Option<Arc<dyn DocumentParser>>,
}

impl ImageIngester {
    pub fn new(parser: Option<Arc<dyn DocumentParser>>) -> Self {
        Self { parser }
    }
}

#[async_trait]
impl Ingester for ImageIngester {
    fn supports(&self, mime_type: &str) -> bool {
        mime_type.starts_with("image/")
    }

    async fn ingest(&self, input: &RawInput) -> Result<Option<IngestedContent>, IngestError> {
        let Some(parser) = &self.parser else {
            return Ok(None);
        };
        let text = parser
            .ocr_image(&input.body, &input.mime_type)
            .await
            .map_err(|e| IngestError::AdapterFailed {
                mime_type: input.mime_type.clone(),
                reason: e.to_string(),
            })?;
        if text.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(content(
            text,
            SourceType::Image,
            &input.mime_type,
            HashMap::new(),
            None,
        )))
    }
}

/// Audio through the transcription capability.
pub struct AudioIngester {
    transcriber: Option<Arc<dyn Transcriber>>,
}

impl AudioIngester {
    pub fn new(transcriber: Option<Arc<dyn Transcriber>>) -> Self {
        Self { transcriber }
    }
}

#[async_trait]
impl Ingester for AudioIngester {
    fn supports(&self, mime_type: &str) -> bool {
        mime_type.starts_with("audio/")
    }

    async fn ingest(&self, input: &RawInput) -> Result<Option<IngestedContent>, IngestError> {
        let Some(transcriber) = &self.transcriber else {
            return Ok(None);
        };
        let text = transcriber
            .transcribe(&input.body, &input.mime_type)
            .await
            .map_err(|e| IngestError::AdapterFailed {
                mime_type: input.mime_type.clone(),
                reason: e.to_string(),
            })?;
        if text.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(content(
            text,
            SourceType::Audio,
            &input.mime_type,
            HashMap::new(),
            None,
        )))
    }
}

/// URLs through the scrape service, which answers in markdown.
pub struct UrlIngester {
    scraper: Option<Arc<dyn Scraper>>,
}

impl UrlIngester {
    pub fn new(scraper: Option<Arc<dyn Scraper>>) -> Self {
        Self { scraper }
    }
}

#[async_trait]
impl Ingester for UrlIngester {
    fn supports(&self, mime_type: &str) -> bool {
        mime_type == "text/uri-list"
    }

    async fn ingest(&self, input: &RawInput) -> Result<Option<IngestedContent>, IngestError> {
        let url = match &input.source_url {
            Some(url) => url.clone(),
            None => match String::from_utf8(input.body.clone()) {
                Ok(body) => body.trim().to_string(),
                Err(_) => return Ok(None),
            },
        };
        if url.is_empty() {
            return Err(IngestError::EmptyBody);
        }
        let Some(scraper) = &self.scraper else {
            return Ok(None);
        };
        let markdown = scraper
            .scrape(&url)
            .await
            .map_err(|e| IngestError::AdapterFailed {
                mime_type: input.mime_type.clone(),
                reason: e.to_string(),
            })?;
        if markdown.trim().is_empty() {
            return Ok(None);
        }
        let mut metadata = HashMap::new();
        metadata.insert("url".to_string(), serde_json::json!(url));
        Ok(Some(content(
            markdown,
            SourceType::Web,
            "text/markdown",
            metadata,
            None,
        )))
    }
}

/// Generic JSON API feeds: records serialized one per line.
pub struct ApiFeedIngester;

#[async_trait]
impl Ingester for ApiFeedIngester {
    fn supports(&self, mime_type: &str) -> bool {
        mime_type == "application/json"
    }

    async fn ingest(&self, input: &RawInput) -> Result<Option<IngestedContent>, IngestError> {
        let Ok(raw) = String::from_utf8(input.body.clone()) else {
            return Ok(None);
        };
        if raw.trim().is_empty() {
            return Err(IngestError::EmptyBody);
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&raw) else {
            return Ok(None);
        };

        let (text, record_count) = match &value {
            serde_json::Value::Array(records) => {
                let lines: Vec<String> = records.iter().map(render_record).collect();
                (lines.join("\n"), records.len())
            }
            other => (render_record(other), 1),
        };

        let mut metadata = HashMap::new();
        metadata.insert("recordCount".to_string(), serde_json::json!(record_count));
        Ok(Some(content(
            text,
            SourceType::Api,
            &input.mime_type,
            metadata,
            Some(raw),
        )))
    }
}

fn render_record(record: &serde_json::Value) -> String {
    match record {
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(k, v)| match v {
                serde_json::Value::String(s) => format!("{k}: {s}"),
                other => format!("{k}: {other}"),
            })
            .collect::<Vec<_>>()
            .join("; "),
        other => other.to_string(),
    }
}

/// Registry dispatching by MIME type, first match wins.
pub struct IngesterRegistry {
    adapters: Vec<Arc<dyn Ingester>>,
}

impl IngesterRegistry {
    pub fn new(
        parser: Option<Arc<dyn DocumentParser>>,
        transcriber: Option<Arc<dyn Transcriber>>,
        scraper: Option<Arc<dyn Scraper>>,
    ) -> Self {
        Self {
            adapters: vec![
                Arc::new(TextIngester),
                Arc::new(CsvIngester),
                Arc::new(BinaryDocIngester::new(parser.clone())),
                Arc::new(ImageIngester::new(parser)),
                Arc::new(AudioIngester::new(transcriber)),
                Arc::new(UrlIngester::new(scraper)),
                Arc::new(ApiFeedIngester),
            ],
        }
    }

    /// Run the adapter for this MIME type.
    pub async fn ingest(
        &self,
        input: &RawInput,
    ) -> Result<Option<IngestedContent>, IngestError> {
        // A bare mime may carry parameters, e.g. `text/csv; charset=utf-8`.
        let mime = input
            .mime_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        let adapter = self
            .adapters
            .iter()
            .find(|a| a.supports(&mime))
            .ok_or_else(|| IngestError::UnsupportedType(mime.clone()))?;
        let normalized = RawInput {
            mime_type: mime,
            ..input.clone()
        };
        adapter.ingest(&normalized).await
    }
}
