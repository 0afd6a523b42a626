use serde::{Deserialize, Serialize};

use kai_hub::HubError;

/// JSON-RPC request arriving over the WebSocket.
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    pub params: Option<serde_json::Value>,
    pub id: Option<serde_json::Value>,
}

/// JSON-RPC response. `{ id, success, result?, error?: { code, message } }`
/// with string error codes.
#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub id: Option<serde_json::Value>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Serialize)]
pub struct RpcError {
    pub code: String,
    pub message: String,
}

impl RpcResponse {
    pub fn success(id: Option<serde_json::Value>, result: serde_json::Value) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<serde_json::Value>, code: &str, message: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(RpcError {
                code: code.to_string(),
                message: message.into(),
            }),
        }
    }

    pub fn from_hub_error(id: Option<serde_json::Value>, err: &HubError) -> Self {
        Self::error(id, err.error_kind(), err.to_string())
    }

    pub fn parse_error() -> Self {
        Self::error(None, "PARSE_ERROR", "Parse error")
    }

    pub fn rate_limited(id: Option<serde_json::Value>) -> Self {
        Self::error(id, "RATE_LIMITED", "Rate limit exceeded")
    }
}

// ── Param extraction helpers ──

pub fn require_str<'a>(params: &'a serde_json::Value, key: &str) -> Result<&'a str, HubError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| HubError::Validation(format!("Missing required parameter: {key}")))
}

pub fn optional_str<'a>(params: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

pub fn optional_bool(params: &serde_json::Value, key: &str) -> Option<bool> {
    params.get(key).and_then(|v| v.as_bool())
}

pub fn optional_u32(params: &serde_json::Value, key: &str) -> Option<u32> {
    params.get(key).and_then(|v| v.as_u64()).map(|v| v as u32)
}

pub fn optional_str_vec(params: &serde_json::Value, key: &str) -> Option<Vec<String>> {
    params.get(key).and_then(|v| v.as_array()).map(|arr| {
        arr.iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_rpc_request() {
        let raw = r#"{"method":"message.send","params":{"sessionId":"sess_1","content":"hi"},"id":1}"#;
        let req: RpcRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.method, "message.send");
        assert!(req.params.is_some());
        assert_eq!(req.id, Some(json!(1)));
    }

    #[test]
    fn success_response_shape() {
        let resp = RpcResponse::success(Some(json!(1)), json!({"ok": true}));
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["result"]["ok"], true);
        assert!(value.get("error").is_none());
    }

    #[test]
    fn error_response_shape() {
        let resp = RpcResponse::error(Some(json!(2)), "NOT_FOUND", "Session not found");
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["error"]["code"], "NOT_FOUND");
        assert_eq!(value["error"]["message"], "Session not found");
        assert!(value.get("result").is_none());
    }

    #[test]
    fn hub_error_mapping() {
        let resp = RpcResponse::from_hub_error(None, &HubError::MethodNotFound("x.y".into()));
        let err = resp.error.unwrap();
        assert_eq!(err.code, "METHOD_NOT_FOUND");
        assert_eq!(err.message, "Method not found: x.y");
    }

    #[test]
    fn parse_error_has_no_id() {
        let resp = RpcResponse::parse_error();
        assert!(resp.id.is_none());
        assert!(!resp.success);
        assert_eq!(resp.error.unwrap().code, "PARSE_ERROR");
    }

    #[test]
    fn extraction_helpers() {
        let params = json!({"name": "a", "flag": true, "n": 7, "list": ["x", "y"]});
        assert_eq!(require_str(&params, "name").unwrap(), "a");
        assert!(require_str(&params, "missing").is_err());
        assert_eq!(optional_bool(&params, "flag"), Some(true));
        assert_eq!(optional_u32(&params, "n"), Some(7));
        assert_eq!(
            optional_str_vec(&params, "list").unwrap(),
            vec!["x".to_string(), "y".to_string()]
        );
        assert!(optional_str(&params, "none").is_none());
    }
}
