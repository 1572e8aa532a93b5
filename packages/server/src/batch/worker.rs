//! Batch workers: build a request per work item, call with retries, fan
//! mini-batch responses back out to one line per input line.

use std::sync::Arc;
use std::time::Duration;

use predictor_core::{CodecError, JsonCodec, Message, Meta, Payload, Status, Tensor};
use rand::Rng;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use super::client::{PredictorClient, TransportError};
use super::reader::{Element, WorkItem};
use super::writer::OutputLine;
use super::{DataType, PayloadType};
use crate::service::operation::reasons;
use crate::service::Method;

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// `retries` extra attempts after the first, with capped exponential backoff
/// plus up to 25% jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, `attempt` counting from 0.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        let jitter_ms = u64::try_from(exp.as_millis() / 4).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };
        exp + Duration::from_millis(jitter)
    }
}

// ---------------------------------------------------------------------------
// Request building and response fan-out
// ---------------------------------------------------------------------------

/// How input lines become request documents.
#[derive(Debug, Clone, Copy)]
pub struct RequestShape {
    pub data_type: DataType,
    pub payload_type: PayloadType,
}

impl RequestShape {
    /// Builds the request for `elements`. Only `data` lines combine; the
    /// other encodings take exactly one line.
    ///
    /// # Errors
    ///
    /// A line that is not valid for the encoding.
    pub fn build(&self, elements: &[Element]) -> Result<Value, TransportError> {
        match self.data_type {
            DataType::Data => self.build_data(elements),
            DataType::Json => {
                let line = single(elements)?;
                let doc: Value = serde_json::from_str(&line.line).map_err(CodecError::from)?;
                Ok(doc)
            }
            DataType::Str => {
                let line = single(elements)?;
                Ok(json!({ "strData": line.line }))
            }
        }
    }

    fn build_data(&self, elements: &[Element]) -> Result<Value, TransportError> {
        let mut rows = Vec::with_capacity(elements.len());
        for element in elements {
            let row: Value = serde_json::from_str(&element.line).map_err(CodecError::from)?;
            if !row.is_array() {
                return Err(malformed(format!(
                    "line {} is not a JSON array",
                    element.sequence_index
                )));
            }
            rows.push(row);
        }
        let payload = match self.payload_type {
            PayloadType::Ndarray => Payload::NdArray(rows),
            PayloadType::Tensor => Payload::Tensor(
                Tensor::from_ndarray(&rows)
                    .ok_or_else(|| malformed("rows are not a rectangular numeric array"))?,
            ),
        };
        Ok(JsonCodec.encode_value(&Message::from_payload(payload))?)
    }
}

fn single(elements: &[Element]) -> Result<&Element, TransportError> {
    match elements {
        [one] => Ok(one),
        _ => Err(malformed("only data lines can be sent as a mini-batch")),
    }
}

fn malformed(info: impl Into<String>) -> TransportError {
    TransportError::Server(Status::failure(400, reasons::MALFORMED_PAYLOAD, info))
}

/// Splits a `k`-row response into `k` single-row responses sharing the
/// original names and meta.
///
/// # Errors
///
/// The response is not a tensor or ndarray with exactly `k` rows.
pub fn split_response(response: Value, k: usize) -> Result<Vec<Value>, TransportError> {
    let message: Message = JsonCodec.decode_value(response)?;
    let Message {
        payload,
        names,
        meta,
    } = message;

    let payloads: Vec<Payload> = match payload {
        Payload::Tensor(t) if t.rank() >= 1 && t.rows() == k => (0..k)
            .map(|i| t.slice_rows(i, i + 1).map(Payload::Tensor))
            .collect::<Result<_, _>>()?,
        Payload::NdArray(rows) if rows.len() == k => rows
            .into_iter()
            .map(|row| Payload::NdArray(vec![row]))
            .collect(),
        other => {
            return Err(TransportError::Server(Status::failure(
                500,
                reasons::PROTOCOL_VIOLATION,
                format!(
                    "mini-batch of {k} got a {} response that does not split into {k} rows",
                    other.kind().as_str()
                ),
            )))
        }
    };

    payloads
        .into_iter()
        .map(|payload| -> Result<Value, TransportError> {
            let part = Message::new(payload, names.clone(), meta.clone())?;
            Ok(JsonCodec.encode_value(&part)?)
        })
        .collect()
}

/// Tags identifying one element of a run. `position` is the element's slot
/// inside its mini-batch; the global input line goes in `batch_line`.
fn element_tags(batch_id: &str, position: usize, element: &Element) -> Map<String, Value> {
    let mut tags = Map::new();
    tags.insert("batch_index".into(), json!(position));
    tags.insert("batch_line".into(), json!(element.sequence_index));
    tags.insert("batch_instance_id".into(), json!(element.instance_id));
    tags.insert("batch_id".into(), json!(batch_id));
    tags
}

/// Merges `tags` into `doc.meta.tags`, creating the objects as needed.
fn stamp(doc: &mut Value, tags: Map<String, Value>) {
    let Some(root) = doc.as_object_mut() else {
        return;
    };
    let meta = root.entry("meta").or_insert_with(|| json!({}));
    if !meta.is_object() {
        *meta = json!({});
    }
    if let Some(meta) = meta.as_object_mut() {
        let existing = meta.entry("tags").or_insert_with(|| json!({}));
        if !existing.is_object() {
            *existing = json!({});
        }
        if let Some(existing) = existing.as_object_mut() {
            existing.extend(tags);
        }
    }
}

fn failure_line(status: &Status, tags: Map<String, Value>) -> OutputLine {
    let meta = Meta {
        tags: tags.into_iter().collect(),
        ..Meta::default()
    };
    let doc = json!({ "status": status, "meta": meta });
    OutputLine {
        line: doc.to_string(),
        failed: true,
    }
}

// ---------------------------------------------------------------------------
// BatchWorker
// ---------------------------------------------------------------------------

/// Shared input queue; workers take turns receiving.
pub type WorkQueue = Arc<Mutex<mpsc::Receiver<WorkItem>>>;

pub struct BatchWorker {
    pub id: usize,
    pub client: Arc<dyn PredictorClient>,
    pub method: Method,
    pub shape: RequestShape,
    pub policy: RetryPolicy,
    pub batch_id: Arc<str>,
    pub input: WorkQueue,
    pub output: mpsc::Sender<OutputLine>,
}

impl BatchWorker {
    /// Consumes items until the input queue closes and drains.
    ///
    /// # Errors
    ///
    /// Fails only when the output queue has closed.
    pub async fn run(self) -> anyhow::Result<u64> {
        let mut handled = 0u64;
        loop {
            let item = { self.input.lock().await.recv().await };
            let Some(item) = item else { break };
            for line in self.process(item).await {
                self.output
                    .send(line)
                    .await
                    .map_err(|_| anyhow::anyhow!("output queue closed"))?;
            }
            handled += 1;
        }
        debug!(worker = self.id, items = handled, "worker drained");
        Ok(handled)
    }

    /// One output line per element of `item`.
    pub async fn process(&self, item: WorkItem) -> Vec<OutputLine> {
        let outcome = match self.shape.build(&item.elements) {
            Ok(request) => self.call_with_retry(&request, &item.correlation_id).await,
            Err(err) => Err(err),
        };

        let responses = outcome.and_then(|response| {
            if item.elements.len() == 1 {
                Ok(vec![response])
            } else {
                split_response(response, item.elements.len())
            }
        });

        match responses {
            Ok(responses) => responses
                .into_iter()
                .zip(item.elements.iter().enumerate())
                .map(|(mut doc, (position, element))| {
                    stamp(&mut doc, element_tags(&self.batch_id, position, element));
                    OutputLine {
                        line: doc.to_string(),
                        failed: false,
                    }
                })
                .collect(),
            Err(err) => {
                let status = err.to_status();
                item.elements
                    .iter()
                    .enumerate()
                    .map(|(position, element)| {
                        failure_line(&status, element_tags(&self.batch_id, position, element))
                    })
                    .collect()
            }
        }
    }

    async fn call_with_retry(
        &self,
        request: &Value,
        correlation_id: &str,
    ) -> Result<Value, TransportError> {
        let mut attempt = 0u32;
        loop {
            match self.client.call(self.method, request, correlation_id).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    let retry = err.is_transient() && attempt < self.policy.retries;
                    warn!(
                        worker = self.id,
                        correlation_id,
                        attempt = attempt + 1,
                        retry,
                        error = %err,
                        "call failed"
                    );
                    if !retry {
                        return Err(err);
                    }
                    tokio::time::sleep(self.policy.backoff(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}
