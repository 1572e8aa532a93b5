//! The pluggable component contract.
//!
//! A [`Component`] is the user's business logic. Every operation method is
//! optional: the default implementations return
//! [`ComponentError::NotImplemented`], which the dispatcher treats as "fall
//! through to the next tier" rather than as a failure. What a component
//! actually overrides is declared once through [`Component::capabilities`],
//! from which the dispatcher builds its per-operation tier plan at
//! registration time.
//!
//! Three override levels exist per operation:
//!
//! 1. **Raw** (`*_raw`): receives the full decoded envelope and returns a
//!    full envelope (or an equivalent JSON map) used verbatim.
//! 2. **Legacy** (`handle_rest` / `handle_rpc`): receives the
//!    transport-native request. Deprecated; declaring it logs one warning at
//!    registration.
//! 3. **Typed** (`predict`, `route`, ...): receives extracted features and
//!    names and returns a [`ComponentResult`].

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use predictor_core::{Feedback, Message, MessageList, Meta, MetricRecord, Payload, Tensor};
use serde_json::Value;

use crate::service::operation::{Method, Transport};

mod identity;

pub use identity::Identity;

// ---------------------------------------------------------------------------
// Results and errors
// ---------------------------------------------------------------------------

/// Data returned by a typed component method.
#[derive(Debug, Clone, PartialEq)]
pub enum Data {
    Tensor(Tensor),
    /// Rows of JSON values; numeric rectangular rows are treated as a tensor
    /// during response assembly.
    Rows(Vec<Value>),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Json(Value),
}

impl Data {
    /// The request payload as data, used for identity transforms.
    #[must_use]
    pub fn from_payload(payload: &Payload) -> Self {
        match payload {
            Payload::Tensor(t) => Self::Tensor(t.clone()),
            Payload::NdArray(rows) => Self::Rows(rows.clone()),
            Payload::Binary(b) => Self::Bytes(b.clone()),
            Payload::Str(s) => Self::Str(s.clone()),
            Payload::Json(v) => Self::Json(v.clone()),
        }
    }
}

/// Output of a typed component call: data plus per-call tags and metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentResult {
    pub data: Data,
    /// Runtime tags. These win over the component's static tags.
    pub tags: BTreeMap<String, Value>,
    pub metrics: Vec<MetricRecord>,
}

impl ComponentResult {
    #[must_use]
    pub fn new(data: Data) -> Self {
        Self {
            data,
            tags: BTreeMap::new(),
            metrics: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_metric(mut self, record: MetricRecord) -> Self {
        self.metrics.push(record);
        self
    }
}

impl From<Data> for ComponentResult {
    fn from(data: Data) -> Self {
        Self::new(data)
    }
}

impl From<Tensor> for ComponentResult {
    fn from(t: Tensor) -> Self {
        Self::new(Data::Tensor(t))
    }
}

/// Output of a raw override: a full envelope, or a JSON map with the envelope
/// structure.
#[derive(Debug, Clone, PartialEq)]
pub enum RawResponse {
    Message(Message),
    Json(Value),
}

/// Errors a component may return.
#[derive(Debug, thiserror::Error)]
pub enum ComponentError {
    /// The method is not implemented. Triggers fallback; never surfaced.
    #[error("not implemented")]
    NotImplemented,
    /// The typed method refuses the `meta` argument. The dispatcher retries
    /// the call once without it.
    #[error("component does not accept meta")]
    MetaRejected,
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

pub type ComponentOutcome<T> = Result<T, ComponentError>;

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// One thing a component overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Typed(Method),
    Raw(Method),
    Legacy(Method, Transport),
    Tags,
    ClassNames,
    FeatureNames,
    Metrics,
}

/// The set of declared capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    set: HashSet<Capability>,
}

impl Capabilities {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, capability: Capability) -> Self {
        self.set.insert(capability);
        self
    }

    #[must_use]
    pub fn typed(self, method: Method) -> Self {
        self.with(Capability::Typed(method))
    }

    #[must_use]
    pub fn raw(self, method: Method) -> Self {
        self.with(Capability::Raw(method))
    }

    #[must_use]
    pub fn legacy(self, method: Method, transport: Transport) -> Self {
        self.with(Capability::Legacy(method, transport))
    }

    #[must_use]
    pub fn contains(&self, capability: Capability) -> bool {
        self.set.contains(&capability)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.set.iter()
    }
}

// ---------------------------------------------------------------------------
// Component
// ---------------------------------------------------------------------------

/// User-supplied business logic served by the runtime.
///
/// Implement the methods you need and list them in [`capabilities`]. Methods
/// not listed are never called.
///
/// [`capabilities`]: Component::capabilities
#[async_trait]
#[allow(unused_variables)]
pub trait Component: Send + Sync + 'static {
    /// Declares which methods this component overrides. Called once, when the
    /// dispatcher is built.
    fn capabilities(&self) -> Capabilities;

    /// Runs once before serving starts (model loading and similar).
    ///
    /// # Errors
    ///
    /// A failure aborts start-up.
    async fn load(&self) -> anyhow::Result<()> {
        Ok(())
    }

    // -- typed tier --------------------------------------------------------

    async fn predict(
        &self,
        features: &Payload,
        names: &[String],
        meta: Option<&Meta>,
    ) -> ComponentOutcome<ComponentResult> {
        Err(ComponentError::NotImplemented)
    }

    async fn transform_input(
        &self,
        features: &Payload,
        names: &[String],
        meta: Option<&Meta>,
    ) -> ComponentOutcome<ComponentResult> {
        Err(ComponentError::NotImplemented)
    }

    async fn transform_output(
        &self,
        features: &Payload,
        names: &[String],
        meta: Option<&Meta>,
    ) -> ComponentOutcome<ComponentResult> {
        Err(ComponentError::NotImplemented)
    }

    /// Must return [`Data::Int`], the index of the chosen branch.
    async fn route(
        &self,
        features: &Payload,
        names: &[String],
        meta: Option<&Meta>,
    ) -> ComponentOutcome<ComponentResult> {
        Err(ComponentError::NotImplemented)
    }

    /// Called once with the parallel lists of every input's features and names.
    async fn aggregate(
        &self,
        features: &[Payload],
        names: &[Vec<String>],
    ) -> ComponentOutcome<ComponentResult> {
        Err(ComponentError::NotImplemented)
    }

    /// `routing` is the branch this unit chose for the original request.
    async fn send_feedback(
        &self,
        features: &Payload,
        names: &[String],
        reward: f64,
        truth: Option<&Payload>,
        routing: Option<i64>,
    ) -> ComponentOutcome<ComponentResult> {
        Err(ComponentError::NotImplemented)
    }

    async fn health_status(&self) -> ComponentOutcome<ComponentResult> {
        Err(ComponentError::NotImplemented)
    }

    async fn metadata(&self) -> ComponentOutcome<Value> {
        Err(ComponentError::NotImplemented)
    }

    // -- static descriptors ------------------------------------------------

    fn tags(&self) -> BTreeMap<String, Value> {
        BTreeMap::new()
    }

    fn class_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn feature_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Metrics to record after every typed call.
    fn metrics(&self) -> Vec<MetricRecord> {
        Vec::new()
    }

    // -- raw tier ----------------------------------------------------------

    async fn predict_raw(&self, request: &Message) -> ComponentOutcome<RawResponse> {
        Err(ComponentError::NotImplemented)
    }

    async fn transform_input_raw(&self, request: &Message) -> ComponentOutcome<RawResponse> {
        Err(ComponentError::NotImplemented)
    }

    async fn transform_output_raw(&self, request: &Message) -> ComponentOutcome<RawResponse> {
        Err(ComponentError::NotImplemented)
    }

    async fn route_raw(&self, request: &Message) -> ComponentOutcome<RawResponse> {
        Err(ComponentError::NotImplemented)
    }

    async fn aggregate_raw(&self, request: &MessageList) -> ComponentOutcome<RawResponse> {
        Err(ComponentError::NotImplemented)
    }

    async fn send_feedback_raw(&self, request: &Feedback) -> ComponentOutcome<RawResponse> {
        Err(ComponentError::NotImplemented)
    }

    async fn health_status_raw(&self) -> ComponentOutcome<RawResponse> {
        Err(ComponentError::NotImplemented)
    }

    // -- legacy tier -------------------------------------------------------

    /// Text-transport override receiving the request JSON as sent.
    #[deprecated(note = "implement the `*_raw` method for the operation instead")]
    async fn handle_rest(&self, method: Method, request: &Value) -> ComponentOutcome<Value> {
        Err(ComponentError::NotImplemented)
    }

    /// RPC override receiving the `MsgPack` request body as sent.
    #[deprecated(note = "implement the `*_raw` method for the operation instead")]
    async fn handle_rpc(&self, method: Method, request: &[u8]) -> ComponentOutcome<Vec<u8>> {
        Err(ComponentError::NotImplemented)
    }
}
