//! Wiring a byte source into a streaming request body.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::runtime::Handle;
use tracing::{debug, error, trace};

use crate::error::BodyError;

/// A readable source of body chunks.
pub type ByteSource = BoxStream<'static, io::Result<Bytes>>;

/// The writable body of an in-flight request.
#[async_trait]
pub trait BodySink: Send + Sync + 'static {
    /// Write one chunk, waiting while the request applies backpressure.
    async fn write(&self, chunk: Bytes) -> Result<(), BodyError>;

    /// Finish the body. Idempotent.
    fn end(&self);

    /// Fail the request because the body could not be produced.
    fn abort(&self, reason: String);
}

/// Connect `source` to `sink`, or end an empty body.
///
/// With a source, a pump task is spawned on the current runtime that writes
/// every chunk and ends the sink when the source is exhausted. A source
/// failure aborts the sink instead. Without a source, the sink is ended at
/// once for verbs that carry a body (`bears_body`) so the request can be
/// sent; for other verbs the sink is left alone.
pub fn pipe_body(
    sink: Arc<dyn BodySink>,
    source: Option<ByteSource>,
    bears_body: bool,
) -> Result<(), BodyError> {
    match source {
        Some(source) => {
            let handle = Handle::try_current().map_err(|_| BodyError::NoRuntime)?;
            handle.spawn(pump(sink, source));
            Ok(())
        }
        None if bears_body => {
            trace!("no body source, ending request body");
            sink.end();
            Ok(())
        }
        None => Ok(()),
    }
}

async fn pump(sink: Arc<dyn BodySink>, mut source: ByteSource) {
    let mut written = 0usize;
    while let Some(chunk) = source.next().await {
        match chunk {
            Ok(chunk) => {
                let len = chunk.len();
                if let Err(e) = sink.write(chunk).await {
                    debug!(error = %e, written, "request stopped accepting body");
                    return;
                }
                written += len;
            }
            Err(e) => {
                error!(error = %e, written, "body source failed");
                sink.abort(e.to_string());
                return;
            }
        }
    }
    trace!(written, "body source exhausted");
    sink.end();
}
