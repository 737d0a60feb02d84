//! Language interpreter subsystem.
//!
//! Long-running child interpreters ([`worker::InterpreterWorker`]) speak a
//! line-delimited JSON protocol; [`pool::InterpreterPool`] keeps per-language
//! pools of them pre-warmed and binds workers exclusively to REPL-like
//! contexts.

pub mod pool;
pub mod worker;

use serde::{Deserialize, Serialize};

/// Supported interpreter languages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Javascript,
    Typescript,
}

impl Language {
    pub const ALL: [Language; 3] = [Self::Python, Self::Javascript, Self::Typescript];

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" => Some(Self::Python),
            "javascript" | "js" => Some(Self::Javascript),
            "typescript" | "ts" => Some(Self::Typescript),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Javascript => "javascript",
            Self::Typescript => "typescript",
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a rich execution output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Text,
    Image,
    Jpeg,
    Svg,
    Html,
    Json,
    Latex,
    Markdown,
    Javascript,
    Error,
}

/// One rich output produced by an execution (`data` is a string or base64
/// payload depending on the kind).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputItem {
    #[serde(rename = "type")]
    pub kind: OutputKind,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Request line written to a worker's stdin.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRequest<'a> {
    pub code: &'a str,
    pub execution_id: &'a str,
    pub timeout: Option<u64>,
}

/// Response line read from a worker's stdout.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResponse {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    pub success: bool,
    pub execution_id: String,
    #[serde(default)]
    pub outputs: Vec<OutputItem>,
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_parsing() {
        assert_eq!(Language::parse("python"), Some(Language::Python));
        assert_eq!(Language::parse("Python3"), Some(Language::Python));
        assert_eq!(Language::parse("js"), Some(Language::Javascript));
        assert_eq!(Language::parse("TypeScript"), Some(Language::Typescript));
        assert_eq!(Language::parse("ruby"), None);
    }

    #[test]
    fn request_wire_shape() {
        let req = WorkerRequest {
            code: "x = 1",
            execution_id: "e1",
            timeout: Some(1000),
        };
        let v: serde_json::Value = serde_json::from_str(&serde_json::to_string(&req).unwrap()).unwrap();
        assert_eq!(v["code"], "x = 1");
        assert_eq!(v["executionId"], "e1");
        assert_eq!(v["timeout"], 1000);
    }

    #[test]
    fn response_wire_shape() {
        let raw = r#"{
            "stdout": "hi\n",
            "stderr": "",
            "success": true,
            "executionId": "e2",
            "outputs": [{"type": "text", "data": "42"}]
        }"#;
        let resp: WorkerResponse = serde_json::from_str(raw).unwrap();
        assert!(resp.success);
        assert_eq!(resp.execution_id, "e2");
        assert_eq!(resp.outputs.len(), 1);
        assert_eq!(resp.outputs[0].kind, OutputKind::Text);
        assert_eq!(resp.outputs[0].data, "42");
        assert!(resp.error.is_none());
    }
}
