use crate::pipeline::HostError;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Request snapshot attached by the error-middleware helper.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub body: Option<Value>,
}

pub fn request_context(request: &RequestContext) -> BTreeMap<String, Value> {
    BTreeMap::from([(
        "request".to_string(),
        json!({
            "method": request.method,
            "url": request.url,
            "headers": request.headers,
            "query": request.query,
            "body": request.body,
        }),
    )])
}

/// Capture a request-scoped error through the process-wide agent, attaching
/// `{method, url, headers, query, body}` context.
pub async fn capture_request_error(error: HostError, request: RequestContext) {
    crate::capture_exception(error, Some(request_context(&request))).await;
}
