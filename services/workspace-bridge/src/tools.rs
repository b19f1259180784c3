//! Line-delimited JSON tool protocol
//!
//! Each input line is one request:
//! `{"id": 1, "tool": "api_request", "arguments": {...}}`
//!
//! Each output line is one response:
//! `{"id": 1, "ok": true, "result": {...}}` or
//! `{"id": 1, "ok": false, "error": {"kind": "rate_limit", "message": "...", "retry_after_secs": 12}}`
//!
//! Errors are reduced to a kind and a message. Token material never
//! appears in a result.

use std::collections::BTreeMap;
use std::time::Instant;

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};
use workspace_api::ApiRequest;

use crate::bridge::{ApiCall, Bridge};
use crate::metrics::record_tool_call;

pub const TOOLS: &[&str] = &["auth_status", "authenticate", "revoke", "api_request"];

#[derive(Debug, Deserialize)]
pub struct ToolRequest {
    #[serde(default)]
    pub id: Value,
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Serialize)]
pub struct ToolResponse {
    pub id: Value,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
}

/// Sanitized error returned to the tool caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolError {
    pub kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing_scopes: Vec<String>,
}

impl ToolError {
    fn validation(message: impl Into<String>) -> Self {
        Self {
            kind: "validation",
            message: message.into(),
            retry_after_secs: None,
            missing_scopes: Vec::new(),
        }
    }
}

impl From<workspace_api::Error> for ToolError {
    fn from(err: workspace_api::Error) -> Self {
        use workspace_api::Error;
        let kind = err.kind();
        let retry_after_secs = err.retry_after_secs();
        let (message, missing_scopes) = match err {
            Error::Authorization {
                message,
                missing_scopes,
            } => (message, missing_scopes),
            // Storage errors can carry file paths and crypto details.
            Error::Storage(_) => ("token storage unavailable".to_string(), Vec::new()),
            other => (other.to_string(), Vec::new()),
        };
        Self {
            kind,
            message,
            retry_after_secs,
            missing_scopes,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AuthenticateArgs {
    services: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ApiRequestArgs {
    service: String,
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    query: BTreeMap<String, String>,
    #[serde(default)]
    body: Option<Value>,
    /// Defaults to the service's scopes.
    #[serde(default)]
    scopes: Option<Vec<String>>,
}

/// Handle one protocol line and return the response line.
pub async fn handle_line(bridge: &Bridge, line: &str) -> String {
    let response = match serde_json::from_str::<ToolRequest>(line) {
        Ok(request) => handle_request(bridge, request).await,
        Err(e) => ToolResponse {
            id: Value::Null,
            ok: false,
            result: None,
            error: Some(ToolError::validation(format!("malformed request: {e}"))),
        },
    };
    // ToolResponse holds only strings and JSON values.
    serde_json::to_string(&response).unwrap_or_else(|_| {
        r#"{"id":null,"ok":false,"error":{"kind":"internal","message":"unserializable response"}}"#
            .to_string()
    })
}

pub async fn handle_request(bridge: &Bridge, request: ToolRequest) -> ToolResponse {
    let started = Instant::now();
    let result = dispatch(bridge, &request.tool, request.arguments).await;
    let outcome = match &result {
        Ok(_) => "ok",
        Err(e) => e.kind,
    };
    record_tool_call(&request.tool, outcome);

    let duration_ms = started.elapsed().as_millis() as u64;
    match &result {
        Ok(_) => info!(tool = %request.tool, duration_ms, "tool call completed"),
        Err(e) => warn!(
            tool = %request.tool,
            kind = e.kind,
            error = %e.message,
            duration_ms,
            "tool call failed"
        ),
    }

    match result {
        Ok(value) => ToolResponse {
            id: request.id,
            ok: true,
            result: Some(value),
            error: None,
        },
        Err(error) => ToolResponse {
            id: request.id,
            ok: false,
            result: None,
            error: Some(error),
        },
    }
}

async fn dispatch(bridge: &Bridge, tool: &str, arguments: Value) -> Result<Value, ToolError> {
    match tool {
        "auth_status" => {
            let status = bridge.status().await?;
            serde_json::to_value(status).map_err(|e| ToolError::validation(e.to_string()))
        }
        "authenticate" => {
            let args: AuthenticateArgs = parse_args(arguments)?;
            let auth = bridge.authenticate(&args.services).await?;
            Ok(json!({
                "email": auth.user.email,
                "name": auth.user.name,
                "scopes": auth.tokens.scope_list(),
                "expires_at": auth.tokens.expires_at,
            }))
        }
        "revoke" => {
            bridge.revoke().await?;
            Ok(json!({ "revoked": true }))
        }
        "api_request" => {
            let call = api_call(parse_args(arguments)?)?;
            let response = bridge.call(&call).await?;
            let body = match response.json::<Value>() {
                Ok(value) => value,
                Err(_) => Value::String(response.text()),
            };
            Ok(json!({ "status": response.status, "body": body }))
        }
        other => Err(ToolError::validation(format!(
            "unknown tool {other:?}, expected one of: {}",
            TOOLS.join(", ")
        ))),
    }
}

fn parse_args<T: DeserializeOwned + Default>(arguments: Value) -> Result<T, ToolError> {
    if arguments.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(arguments)
        .map_err(|e| ToolError::validation(format!("invalid arguments: {e}")))
}

/// Validate `api_request` arguments into an `ApiCall`.
fn api_call(args: Option<ApiRequestArgs>) -> Result<ApiCall, ToolError> {
    let args = args.ok_or_else(|| ToolError::validation("missing arguments"))?;

    let service_scopes = workspace_auth::scopes_for_service(&args.service).ok_or_else(|| {
        ToolError::validation(format!(
            "unknown service {:?}, expected one of: {}",
            args.service,
            workspace_auth::SERVICES.join(", ")
        ))
    })?;

    let url = url::Url::parse(&args.url)
        .map_err(|e| ToolError::validation(format!("invalid url: {e}")))?;
    let google_host = url
        .host_str()
        .is_some_and(|h| h == "googleapis.com" || h.ends_with(".googleapis.com"));
    if url.scheme() != "https" || !google_host {
        return Err(ToolError::validation(
            "url must be an https://*.googleapis.com address",
        ));
    }

    let method = match args.method.as_deref().map(str::to_ascii_uppercase).as_deref() {
        None | Some("GET") => Method::GET,
        Some("POST") => Method::POST,
        Some("PUT") => Method::PUT,
        Some("PATCH") => Method::PATCH,
        Some("DELETE") => Method::DELETE,
        Some(other) => {
            return Err(ToolError::validation(format!(
                "unsupported method {other:?}"
            )));
        }
    };

    let scopes = match args.scopes {
        Some(scopes) if scopes.iter().any(|s| s.trim().is_empty()) => {
            return Err(ToolError::validation("scopes must not be empty strings"));
        }
        Some(scopes) if !scopes.is_empty() => scopes,
        _ => service_scopes.iter().map(|s| s.to_string()).collect(),
    };

    let endpoint = args
        .endpoint
        .filter(|e| !e.trim().is_empty())
        .unwrap_or_else(|| format!("{} {}", method, operation_path(url.path())));

    let mut request = ApiRequest::new(method, args.url.clone());
    for (key, value) in args.query {
        request = request.with_query(key, value);
    }
    if let Some(body) = args.body {
        request = request.with_body(body);
    }

    Ok(ApiCall {
        service: args.service,
        endpoint,
        scopes,
        request,
    })
}

/// Collapse resource ids in an API path so every call to the same
/// operation shares one rate-limit window and metrics label.
///
/// `/drive/v3/files/1AbC9x` becomes `/drive/v3/files/{id}` and
/// `/v4/spreadsheets/1x2y:batchUpdate` becomes `/v4/spreadsheets/{id}:batchUpdate`.
fn operation_path(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            let (base, action) = match segment.split_once(':') {
                Some((base, action)) => (base, Some(action)),
                None => (segment, None),
            };
            let base = if is_path_word(base) { base } else { "{id}" };
            match action {
                Some(action) if is_path_word(action) => format!("{base}:{action}"),
                Some(_) => format!("{base}:{{id}}"),
                None => base.to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// API versions (`v3`, `v1beta`) and plain resource or collection names.
fn is_path_word(segment: &str) -> bool {
    if segment.is_empty() {
        return true;
    }
    let is_version = segment
        .strip_prefix('v')
        .is_some_and(|rest| rest.starts_with(|c: char| c.is_ascii_digit()) && rest.len() <= 8);
    is_version || (segment.len() <= 32 && segment.chars().all(|c| c.is_ascii_alphabetic()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::testing::{ApprovingBrowser, harness, harness_with};
    use std::sync::Arc;

    async fn call(bridge: &Bridge, line: &str) -> Value {
        serde_json::from_str(&handle_line(bridge, line).await).unwrap()
    }

    #[tokio::test]
    async fn auth_status_reports_without_token_material() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), true).await;

        let response = call(&h.bridge, r#"{"id":1,"tool":"auth_status"}"#).await;

        assert_eq!(response["id"], 1);
        assert_eq!(response["ok"], true);
        assert_eq!(response["result"]["authenticated"], true);
        let text = response.to_string();
        assert!(!text.contains("seeded-access"));
        assert!(!text.contains("seeded-refresh"));
    }

    #[tokio::test]
    async fn malformed_line_returns_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), true).await;

        let response = call(&h.bridge, "not json").await;

        assert_eq!(response["id"], Value::Null);
        assert_eq!(response["ok"], false);
        assert_eq!(response["error"]["kind"], "validation");
    }

    #[tokio::test]
    async fn unknown_tool_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), true).await;

        let response = call(&h.bridge, r#"{"id":"a","tool":"format_disk"}"#).await;

        assert_eq!(response["id"], "a");
        assert_eq!(response["error"]["kind"], "validation");
        assert!(
            response["error"]["message"]
                .as_str()
                .unwrap()
                .contains("api_request")
        );
    }

    #[tokio::test]
    async fn authenticate_returns_identity_and_scopes() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), true).await;

        let response = call(
            &h.bridge,
            r#"{"id":2,"tool":"authenticate","arguments":{"services":["calendar"]}}"#,
        )
        .await;

        assert_eq!(response["ok"], true, "{response}");
        assert_eq!(response["result"]["email"], "user@example.com");
        assert!(
            response["result"]["scopes"]
                .as_array()
                .unwrap()
                .contains(&json!("https://www.googleapis.com/auth/calendar"))
        );
        assert!(!response.to_string().contains("seeded-access"));
    }

    #[tokio::test]
    async fn revoke_tool_clears_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), true).await;

        let response = call(&h.bridge, r#"{"id":3,"tool":"revoke"}"#).await;

        assert_eq!(response["result"]["revoked"], true);
        assert!(h.store.retrieve().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn api_request_returns_status_and_json_body() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), true).await;
        h.transport.push(200, r#"{"items":[{"id":"primary"}]}"#);

        let response = call(
            &h.bridge,
            r#"{"id":4,"tool":"api_request","arguments":{
                "service":"calendar",
                "url":"https://www.googleapis.com/calendar/v3/users/me/calendarList",
                "query":{"maxResults":"10"}
            }}"#,
        )
        .await;

        assert_eq!(response["ok"], true, "{response}");
        assert_eq!(response["result"]["status"], 200);
        assert_eq!(response["result"]["body"]["items"][0]["id"], "primary");

        let sent = h.transport.sent.lock().unwrap();
        let (request, token) = &sent[0];
        assert_eq!(request.method, Method::GET);
        assert_eq!(
            request.query,
            vec![("maxResults".to_string(), "10".to_string())]
        );
        assert_eq!(token, "seeded-access");
    }

    #[tokio::test]
    async fn api_request_rejects_non_google_url() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), true).await;

        for url in [
            "https://evil.example.com/drive/v3/files",
            "http://www.googleapis.com/drive/v3/files",
            "https://googleapis.com.evil.example/x",
        ] {
            let line = json!({
                "id": 5,
                "tool": "api_request",
                "arguments": {"service": "drive", "url": url}
            })
            .to_string();
            let response = call(&h.bridge, &line).await;
            assert_eq!(response["error"]["kind"], "validation", "{url}");
        }
        assert!(h.transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn api_request_rejects_unknown_service_and_method() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), true).await;

        let unknown_service = call(
            &h.bridge,
            r#"{"id":6,"tool":"api_request","arguments":{"service":"photos","url":"https://photoslibrary.googleapis.com/v1/albums"}}"#,
        )
        .await;
        assert_eq!(unknown_service["error"]["kind"], "validation");

        let bad_method = call(
            &h.bridge,
            r#"{"id":7,"tool":"api_request","arguments":{"service":"drive","method":"TRACE","url":"https://www.googleapis.com/drive/v3/files"}}"#,
        )
        .await;
        assert_eq!(bad_method["error"]["kind"], "validation");

        let missing = call(&h.bridge, r#"{"id":8,"tool":"api_request"}"#).await;
        assert_eq!(missing["error"]["kind"], "validation");
    }

    #[tokio::test]
    async fn api_request_surfaces_rate_limit_with_retry_after() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), true).await;
        h.transport.push(200, "{}");
        h.transport.push(200, "{}");

        let line = r#"{"id":9,"tool":"api_request","arguments":{"service":"drive","url":"https://www.googleapis.com/drive/v3/files"}}"#;
        assert_eq!(call(&h.bridge, line).await["ok"], true);
        assert_eq!(call(&h.bridge, line).await["ok"], true);

        let limited = call(&h.bridge, line).await;
        assert_eq!(limited["ok"], false);
        assert_eq!(limited["error"]["kind"], "rate_limit");
        assert!(limited["error"]["retry_after_secs"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn api_request_maps_forbidden_to_authorization() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), true).await;
        h.transport.push(
            403,
            r#"{"error":{"code":403,"message":"The caller does not have permission","status":"PERMISSION_DENIED"}}"#,
        );

        let response = call(
            &h.bridge,
            r#"{"id":10,"tool":"api_request","arguments":{"service":"sheets","method":"post","url":"https://sheets.googleapis.com/v4/spreadsheets","body":{"properties":{"title":"t"}}}}"#,
        )
        .await;

        assert_eq!(response["error"]["kind"], "authorization", "{response}");
        assert!(
            response["error"]["message"]
                .as_str()
                .unwrap()
                .contains("permission")
        );
    }

    #[test]
    fn storage_errors_are_sanitized() {
        let err = ToolError::from(workspace_api::Error::Storage(
            "decrypt /home/u/.config/tokens.json failed".to_string(),
        ));
        assert_eq!(err.kind, "storage");
        assert!(!err.message.contains("/home/u"));
    }

    #[test]
    fn authorization_errors_carry_missing_scopes() {
        let err = ToolError::from(workspace_api::Error::Authorization {
            message: "missing required scopes".to_string(),
            missing_scopes: vec!["https://www.googleapis.com/auth/drive".to_string()],
        });
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["kind"], "authorization");
        assert_eq!(value["missing_scopes"][0], "https://www.googleapis.com/auth/drive");
        assert!(value.get("retry_after_secs").is_none());
    }

    #[test]
    fn operation_path_collapses_resource_ids() {
        assert_eq!(
            operation_path("/drive/v3/files/1AbC9xYz_Q-2"),
            "/drive/v3/files/{id}"
        );
        assert_eq!(
            operation_path("/calendar/v3/calendars/primary/events/abc123def"),
            "/calendar/v3/calendars/primary/events/{id}"
        );
        assert_eq!(
            operation_path("/v4/spreadsheets/1x2y3z:batchUpdate"),
            "/v4/spreadsheets/{id}:batchUpdate"
        );
        assert_eq!(
            operation_path("/v4/spreadsheets/1x2y3z/values/Sheet1!A1:B2"),
            "/v4/spreadsheets/{id}/values/{id}:{id}"
        );
        assert_eq!(operation_path("/gmail/v1/users/me/messages"), "/gmail/v1/users/me/messages");
    }

    #[tokio::test]
    async fn requests_for_different_resources_share_a_rate_limit() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), true).await;
        for _ in 0..5 {
            h.transport.push(200, "{}");
        }

        let mut oks = Vec::new();
        for n in 0..5 {
            let line = json!({
                "id": n,
                "tool": "api_request",
                "arguments": {
                    "service": "drive",
                    "url": format!("https://www.googleapis.com/drive/v3/files/file{n}")
                }
            })
            .to_string();
            oks.push(call(&h.bridge, &line).await["ok"] == true);
        }

        assert_eq!(oks, vec![true, true, false, false, false]);
        assert_eq!(h.transport.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn api_request_extends_grant_for_new_service() {
        let dir = tempfile::tempdir().unwrap();
        let calendar = vec!["https://www.googleapis.com/auth/calendar".to_string()];
        let h = harness_with(dir.path(), Some(calendar), Arc::new(ApprovingBrowser::default())).await;
        h.transport.push(200, r#"{"files":[]}"#);

        let response = call(
            &h.bridge,
            r#"{"id":7,"tool":"api_request","arguments":{"service":"drive","url":"https://www.googleapis.com/drive/v3/files"}}"#,
        )
        .await;

        assert_eq!(response["ok"], true, "got: {response}");
        let sent = h.transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "access-exchanged");
    }

    #[test]
    fn default_endpoint_label_uses_method_and_path() {
        let call = api_call(Some(ApiRequestArgs {
            service: "gmail".to_string(),
            url: "https://gmail.googleapis.com/gmail/v1/users/me/messages".to_string(),
            method: Some("delete".to_string()),
            endpoint: None,
            query: BTreeMap::new(),
            body: None,
            scopes: None,
        }))
        .unwrap();
        assert_eq!(call.endpoint, "DELETE /gmail/v1/users/me/messages");
        assert_eq!(call.request.method, Method::DELETE);
        assert!(!call.scopes.is_empty());
    }
}
