//! The seam between a stream session and the network.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

use super::errors::InferenceError;
use super::types::ChatCompletionRequest;

/// Raw response body, chunked at arbitrary points.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, InferenceError>> + Send>>;

/// Opens one streaming chat-completion exchange.
///
/// Implementations return once the gateway has accepted the request (status
/// checked); body bytes are pulled lazily. Dropping the stream aborts the
/// transfer.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn open_stream(&self, body: &ChatCompletionRequest) -> Result<ByteStream, InferenceError>;

    /// Human-readable endpoint for logs.
    fn endpoint(&self) -> &str;
}
