//! JSON-RPC 2.0 wire types and provider error classification.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use affscan_core::error::DEFAULT_RETRY_AFTER;
use affscan_core::ScanError;

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Vec<Value>,
    pub id: u64,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
            id,
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// The result value, or the error object.
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Map a JSON-RPC error object.
///
/// `range` is the `[from, to]` of an `eth_getLogs` call, used to recognise
/// providers that reject the range themselves.
pub fn classify_rpc_error(err: &JsonRpcError, range: Option<(u64, u64)>, max_range: u64) -> ScanError {
    let message = err.message.to_ascii_lowercase();
    if err.code == -32005 || err.code == 429 || message.contains("rate limit") || message.contains("too many requests") {
        return ScanError::RateLimited {
            retry_after: DEFAULT_RETRY_AFTER,
        };
    }
    if let Some((from, to)) = range {
        if message.contains("block range") || message.contains("range too large") || message.contains("more than") {
            return ScanError::RangeTooLarge { from, to, max_range };
        }
    }
    match err.code {
        // Implementation-defined server errors; usually a node hiccup.
        -32099..=-32000 | -32603 => ScanError::TransientNetwork(err.to_string()),
        _ => ScanError::FatalConfig(err.to_string()),
    }
}

/// Map a transport failure from `reqwest`.
pub fn classify_transport(err: &reqwest::Error) -> ScanError {
    if err.is_builder() {
        ScanError::FatalConfig(format!("invalid request: {err}"))
    } else {
        ScanError::TransientNetwork(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rpc_err(code: i64, message: &str) -> JsonRpcError {
        JsonRpcError {
            code,
            message: message.into(),
            data: None,
        }
    }

    #[test]
    fn request_serialization() {
        let req = JsonRpcRequest::new(7, "eth_blockNumber", vec![]);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"method\":\"eth_blockNumber\""));
        assert!(json.contains("\"id\":7"));
    }

    #[test]
    fn response_into_result() {
        let ok: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":"0x10"}"#).unwrap();
        assert_eq!(ok.into_result().unwrap(), Value::String("0x10".into()));

        let err: JsonRpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"header not found"}}"#,
        )
        .unwrap();
        assert_eq!(err.into_result().unwrap_err().code, -32000);
    }

    #[test]
    fn rpc_rate_limit_codes_and_messages() {
        assert!(matches!(classify_rpc_error(&rpc_err(-32005, "limit exceeded"), None, 10), ScanError::RateLimited { .. }));
        assert!(matches!(classify_rpc_error(&rpc_err(-32603, "Rate limit reached"), None, 10), ScanError::RateLimited { .. }));
    }

    #[test]
    fn rpc_range_complaint_becomes_range_too_large() {
        let err = classify_rpc_error(&rpc_err(-32600, "eth_getLogs block range too large"), Some((1, 5000)), 2000);
        assert!(matches!(err, ScanError::RangeTooLarge { from: 1, to: 5000, max_range: 2000 }));
    }

    #[test]
    fn rpc_server_errors_are_transient_and_others_fatal() {
        assert!(classify_rpc_error(&rpc_err(-32000, "header not found"), None, 10).is_retryable());
        assert!(classify_rpc_error(&rpc_err(-32601, "method not found"), None, 10).is_fatal());
    }
}
