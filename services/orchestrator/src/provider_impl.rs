//! Provider adapter implementations
//!
//! Three adapter families cover the configured candidate kinds:
//! - `HttpConvertAdapter` ("cloud-api"): commercial document conversion
//!   API, JSON over HTTP with bearer auth
//! - `VisionAdapter` ("llm-vision"): LLM-vision OCR/conversion
//!   endpoints with a locale gate checked before any quota is spent
//! - `LocalCommandAdapter` ("local"): free fallback that runs a
//!   configured argv against temp files via `tokio::process`
//!
//! Every adapter maps its provider's failures into the fixed
//! `AdapterError` vocabulary; remote adapters share
//! `provider::classify_response` for status mapping.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use common::Secret;
use provider::{
    AdapterError, AdapterSuccess, OperationInput, OperationOutput, ProviderAdapter,
    classify_response,
};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::CandidateConfig;
use crate::executor::Candidate;

/// Build the candidate registry from configuration.
///
/// Config validation has already checked the per-kind wiring, so the
/// per-kind fields can be taken directly.
pub fn build_candidates(
    configs: &[CandidateConfig],
    client: reqwest::Client,
) -> HashMap<String, Candidate> {
    let mut candidates = HashMap::new();
    for config in configs {
        let adapter: Arc<dyn ProviderAdapter> = match config.kind.as_str() {
            "cloud-api" => Arc::new(HttpConvertAdapter::new(
                config.name.clone(),
                client.clone(),
                config.base_url.clone().unwrap_or_default(),
            )),
            "llm-vision" => Arc::new(VisionAdapter::new(
                config.name.clone(),
                client.clone(),
                config.base_url.clone().unwrap_or_default(),
                config.model.clone(),
                config.languages.clone(),
            )),
            // "local" — the only remaining kind after validation
            _ => Arc::new(LocalCommandAdapter::new(
                config.name.clone(),
                config.command.clone(),
            )),
        };
        candidates.insert(
            config.name.clone(),
            Candidate {
                descriptor: config.descriptor(),
                adapter,
            },
        );
    }
    candidates
}

/// Token usage block shared by the remote provider response shapes.
#[derive(Debug, Default, Deserialize)]
struct UsageBlock {
    #[serde(default)]
    input_units: u64,
    #[serde(default)]
    output_units: u64,
}

/// Cloud document API response: either a produced file or plain text.
#[derive(Debug, Deserialize)]
struct ConvertResponse {
    #[serde(default)]
    document: Option<String>,
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    usage: Option<UsageBlock>,
}

/// Commercial cloud document API adapter ("cloud-api" kind).
pub struct HttpConvertAdapter {
    name: String,
    client: reqwest::Client,
    base_url: String,
}

impl HttpConvertAdapter {
    pub fn new(name: String, client: reqwest::Client, base_url: String) -> Self {
        Self {
            name,
            client,
            base_url,
        }
    }

    fn request_body(&self, input: &OperationInput) -> serde_json::Value {
        serde_json::json!({
            "operation": input.operation,
            "filename": input.filename,
            "source_format": input.source_format,
            "target_format": input.target_format,
            "language": input.language,
            "options": input.options,
            "document": BASE64.encode(&input.document),
        })
    }
}

impl ProviderAdapter for HttpConvertAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke<'a>(
        &'a self,
        secret: Option<&'a Secret<String>>,
        input: &'a OperationInput,
    ) -> Pin<Box<dyn Future<Output = provider::Result<AdapterSuccess>> + Send + 'a>> {
        Box::pin(async move {
            let secret = secret.ok_or(AdapterError::Unauthorized)?;
            let url = format!("{}/v1/convert", self.base_url.trim_end_matches('/'));

            let response = self
                .client
                .post(&url)
                .bearer_auth(secret.expose())
                .json(&self.request_body(input))
                .send()
                .await
                .map_err(request_error)?;

            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .map_err(|e| AdapterError::Transient(format!("reading response body: {e}")))?;

            if !(200..300).contains(&status) {
                return Err(classify_response(status, &body));
            }

            let parsed: ConvertResponse = serde_json::from_str(&body)
                .map_err(|e| AdapterError::Unknown(format!("unparseable response: {e}")))?;
            let usage = parsed.usage.unwrap_or_default();

            let output = if let Some(encoded) = parsed.document {
                let bytes = BASE64.decode(encoded.as_bytes()).map_err(|e| {
                    AdapterError::Unknown(format!("response document is not valid base64: {e}"))
                })?;
                OperationOutput::File {
                    bytes,
                    format: parsed.format.unwrap_or_else(|| "bin".to_string()),
                }
            } else if let Some(text) = parsed.text {
                OperationOutput::Text { content: text }
            } else {
                OperationOutput::Structured {
                    value: serde_json::from_str(&body).unwrap_or(serde_json::Value::Null),
                }
            };

            Ok(AdapterSuccess {
                output,
                tokens_in: usage.input_units,
                tokens_out: usage.output_units,
            })
        })
    }
}

/// LLM-vision response shape.
#[derive(Debug, Deserialize)]
struct VisionResponse {
    text: String,
    #[serde(default)]
    usage: Option<UsageBlock>,
}

/// LLM-vision OCR/conversion adapter ("llm-vision" kind).
///
/// The locale gate runs before the HTTP call: rejecting an unsupported
/// OCR language locally costs nothing, while letting the provider
/// reject it would burn user quota on a doomed attempt.
pub struct VisionAdapter {
    name: String,
    client: reqwest::Client,
    base_url: String,
    model: Option<String>,
    languages: Vec<String>,
}

impl VisionAdapter {
    pub fn new(
        name: String,
        client: reqwest::Client,
        base_url: String,
        model: Option<String>,
        languages: Vec<String>,
    ) -> Self {
        Self {
            name,
            client,
            base_url,
            model,
            languages,
        }
    }

    /// Empty locale list means the provider handles any language.
    fn supports_language(&self, language: &str) -> bool {
        self.languages.is_empty() || self.languages.iter().any(|l| l == language)
    }
}

impl ProviderAdapter for VisionAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke<'a>(
        &'a self,
        secret: Option<&'a Secret<String>>,
        input: &'a OperationInput,
    ) -> Pin<Box<dyn Future<Output = provider::Result<AdapterSuccess>> + Send + 'a>> {
        Box::pin(async move {
            if let Some(language) = &input.language
                && !self.supports_language(language)
            {
                return Err(AdapterError::UnsupportedCapability(format!(
                    "OCR language '{language}' not in locale list"
                )));
            }

            let secret = secret.ok_or(AdapterError::Unauthorized)?;
            let url = format!("{}/v1/analyze", self.base_url.trim_end_matches('/'));
            let body = serde_json::json!({
                "model": self.model,
                "operation": input.operation,
                "filename": input.filename,
                "language": input.language,
                "target_format": input.target_format,
                "document": BASE64.encode(&input.document),
            });

            let response = self
                .client
                .post(&url)
                .bearer_auth(secret.expose())
                .json(&body)
                .send()
                .await
                .map_err(request_error)?;

            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .map_err(|e| AdapterError::Transient(format!("reading response body: {e}")))?;

            if !(200..300).contains(&status) {
                return Err(classify_response(status, &body));
            }

            let parsed: VisionResponse = serde_json::from_str(&body)
                .map_err(|e| AdapterError::Unknown(format!("unparseable response: {e}")))?;
            let usage = parsed.usage.unwrap_or_default();

            Ok(AdapterSuccess {
                output: OperationOutput::Text {
                    content: parsed.text,
                },
                tokens_in: usage.input_units,
                tokens_out: usage.output_units,
            })
        })
    }
}

/// Local command-line fallback adapter ("local" kind).
///
/// Writes the document to a scratch directory, substitutes the
/// {input}/{output} placeholders in the configured argv, runs the
/// command, and returns the produced file. No credential, no token
/// metering — this is the free candidate of last resort.
pub struct LocalCommandAdapter {
    name: String,
    command: Vec<String>,
}

impl LocalCommandAdapter {
    pub fn new(name: String, command: Vec<String>) -> Self {
        Self { name, command }
    }
}

impl ProviderAdapter for LocalCommandAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke<'a>(
        &'a self,
        _secret: Option<&'a Secret<String>>,
        input: &'a OperationInput,
    ) -> Pin<Box<dyn Future<Output = provider::Result<AdapterSuccess>> + Send + 'a>> {
        Box::pin(async move {
            let scratch = tempfile::tempdir()
                .map_err(|e| AdapterError::Unknown(format!("creating scratch dir: {e}")))?;

            let input_path = scratch.path().join(format!(
                "input.{}",
                extension_of(&input.filename).unwrap_or("bin")
            ));
            let output_format = input
                .target_format
                .clone()
                .unwrap_or_else(|| "out".to_string());
            let output_path = scratch.path().join(format!("output.{output_format}"));

            tokio::fs::write(&input_path, &input.document)
                .await
                .map_err(|e| AdapterError::Unknown(format!("writing scratch input: {e}")))?;

            let argv = substitute_placeholders(&self.command, &input_path, &output_path);
            debug!(adapter = self.name, command = ?argv, "running local conversion");

            let output = match tokio::process::Command::new(&argv[0])
                .args(&argv[1..])
                .output()
                .await
            {
                Ok(o) => o,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(AdapterError::UnsupportedCapability(format!(
                        "local tool not installed: {}",
                        argv[0]
                    )));
                }
                Err(e) => {
                    return Err(AdapterError::Unknown(format!(
                        "spawning {}: {e}",
                        argv[0]
                    )));
                }
            };

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                warn!(adapter = self.name, status = ?output.status.code(), "local conversion failed");
                return Err(classify_exit(output.status.code(), &stderr));
            }

            let bytes = tokio::fs::read(&output_path).await.map_err(|_| {
                AdapterError::Unknown(format!(
                    "{} exited successfully but produced no output file",
                    argv[0]
                ))
            })?;

            Ok(AdapterSuccess {
                output: OperationOutput::File {
                    bytes,
                    format: output_format,
                },
                tokens_in: 0,
                tokens_out: 0,
            })
        })
    }
}

/// Map a reqwest transport error into the adapter vocabulary.
fn request_error(e: reqwest::Error) -> AdapterError {
    if e.is_timeout() {
        AdapterError::Transient(format!("request timed out: {e}"))
    } else {
        AdapterError::Transient(format!("request failed: {e}"))
    }
}

/// Substitute {input}/{output} placeholders in an argv template.
fn substitute_placeholders(command: &[String], input: &Path, output: &Path) -> Vec<String> {
    command
        .iter()
        .map(|arg| {
            arg.replace("{input}", &input.to_string_lossy())
                .replace("{output}", &output.to_string_lossy())
        })
        .collect()
}

/// Classify a nonzero local-tool exit: stderr mentioning an unreadable
/// document marks the input itself as the problem.
fn classify_exit(code: Option<i32>, stderr: &str) -> AdapterError {
    let lower = stderr.to_lowercase();
    for pattern in ["password", "encrypted", "corrupt", "damaged", "not a pdf"] {
        if lower.contains(pattern) {
            return AdapterError::InvalidInput(stderr.trim().to_string());
        }
    }
    AdapterError::Unknown(format!(
        "exit code {:?}: {}",
        code,
        stderr.trim().chars().take(200).collect::<String>()
    ))
}

/// File extension of the original filename, for the scratch copy.
fn extension_of(filename: &str) -> Option<&str> {
    Path::new(filename).extension().and_then(|e| e.to_str())
}
