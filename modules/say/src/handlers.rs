//! Message handlers of the `say` module.

use std::time::Duration;

use espresso::{CallContext, DispatchError};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Default, Deserialize)]
pub struct HelloRequest {
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct HelloResponse {
    pub content: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct EmptyRequest {}

#[derive(Debug, Serialize)]
pub struct EmptyResponse {}

/// Echo `content` back to the caller.
pub async fn hello(ctx: CallContext, req: HelloRequest) -> Result<HelloResponse, DispatchError> {
    if req.content.is_empty() {
        return Err(DispatchError::InvalidRequest("content is required".into()));
    }
    info!(
        client_ip = ctx.client_ip.as_deref().unwrap_or("-"),
        request_id = %ctx.request_id,
        content = %req.content,
        "say hello"
    );
    Ok(HelloResponse {
        content: req.content,
    })
}

pub async fn try_panic(_ctx: CallContext, _req: EmptyRequest) -> Result<EmptyResponse, DispatchError> {
    panic!("try panic");
}

pub async fn slow(
    _ctx: CallContext,
    _req: EmptyRequest,
    delay: Duration,
) -> Result<EmptyResponse, DispatchError> {
    tokio::time::sleep(delay).await;
    Ok(EmptyResponse {})
}
