use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};

use crate::AdapterRegistry;

const DEFAULT_SIZE: &str = "1024x1024";

/// The pass-through request shape: `{provider, apiKey, prompt, size}`.
#[derive(Debug, Clone, Default)]
pub struct ProxyRequest {
    pub provider: String,
    pub api_key: String,
    pub prompt: String,
    pub size: String,
}

impl ProxyRequest {
    pub fn from_json(payload: &Value) -> Self {
        let field = |name: &str| {
            payload
                .get(name)
                .and_then(Value::as_str)
                .map(str::trim)
                .unwrap_or_default()
                .to_string()
        };
        Self {
            provider: field("provider"),
            api_key: field("apiKey"),
            prompt: field("prompt"),
            size: field("size"),
        }
    }
}

/// Normalized success payload: one base64 data URL with a declared MIME
/// type, whatever shape the upstream returned.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyResponse {
    pub data_url: String,
}

impl ProxyResponse {
    pub fn to_json(&self) -> Value {
        json!({ "dataUrl": self.data_url })
    }
}

/// Client-visible failure: 400 for a bad request (missing field, unknown
/// provider), 502 for any upstream failure. Serializes as `{"error": ...}`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyError {
    pub status: u16,
    pub message: String,
}

impl ProxyError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: 400,
            message: message.into(),
        }
    }

    fn upstream(message: impl Into<String>) -> Self {
        Self {
            status: 502,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> Value {
        json!({ "error": self.message })
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.status)
    }
}

impl std::error::Error for ProxyError {}

/// Forwards one generation request through the registry and normalizes the
/// result into `{dataUrl}`. Stateless; orchestration stays in the worker.
pub fn forward(registry: &AdapterRegistry, request: &ProxyRequest) -> Result<ProxyResponse, ProxyError> {
    if request.provider.is_empty() {
        return Err(ProxyError::bad_request("missing field 'provider'"));
    }
    if request.prompt.is_empty() {
        return Err(ProxyError::bad_request("missing field 'prompt'"));
    }
    let Some(adapter) = registry.get(&request.provider) else {
        return Err(ProxyError::bad_request(format!(
            "unrecognized provider '{}'",
            request.provider
        )));
    };
    if adapter.requires_credential() && request.api_key.is_empty() {
        return Err(ProxyError::bad_request("missing field 'apiKey'"));
    }

    let size = if request.size.is_empty() {
        DEFAULT_SIZE
    } else {
        request.size.as_str()
    };
    let image = adapter
        .generate(&request.prompt, &request.api_key, size)
        .map_err(|err| ProxyError::upstream(format!("{err:#}")))?;

    let mime = image
        .mime_type
        .as_deref()
        .filter(|value| value.starts_with("image/"))
        .unwrap_or("image/png");
    Ok(ProxyResponse {
        data_url: format!("data:{mime};base64,{}", BASE64.encode(&image.bytes)),
    })
}
