//! Tiered dispatch of operations onto a [`Component`].
//!
//! For each call the dispatcher tries the raw override, then the legacy
//! transport-specific override (only on its transport, and only when the
//! native request was kept), then the typed method, then falls back to the
//! neutral result. `NotImplemented` at any tier means "next tier"; any other
//! component error ends the call.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use predictor_core::{Feedback, Message, MessageList, Meta, MetricRecord, Payload, Tensor};
use serde_json::{json, Value};
use tower::Service;
use tracing::{debug, error, warn};

use super::capability::{DispatchPlan, Tier};
use super::config::ServerConfig;
use super::operation::{
    Method, NativeRequest, Operation, OperationContext, OperationError, OperationResponse, Request,
};
use super::response::{Assembly, ResponseBuilder};
use crate::component::{Component, ComponentError, ComponentResult, Data, RawResponse};
use crate::metrics::MetricsAggregator;

/// Tower service terminating the operation pipeline.
///
/// Cloning is cheap; all clones share the component and the metrics store.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    component: Arc<dyn Component>,
    plan: Arc<DispatchPlan>,
    metrics: Arc<MetricsAggregator>,
    config: ServerConfig,
}

impl Dispatcher {
    /// Registers `component`, resolving its tier plan once.
    #[must_use]
    pub fn new(
        component: Arc<dyn Component>,
        metrics: Arc<MetricsAggregator>,
        config: ServerConfig,
    ) -> Self {
        let plan = Arc::new(DispatchPlan::build(&component.capabilities()));
        Self {
            inner: Arc::new(DispatcherInner {
                component,
                plan,
                metrics,
                config,
            }),
        }
    }

    /// Shared handle to the resolved plan.
    #[must_use]
    pub fn plan(&self) -> Arc<DispatchPlan> {
        Arc::clone(&self.inner.plan)
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<MetricsAggregator> {
        Arc::clone(&self.inner.metrics)
    }
}

impl Service<Operation> for Dispatcher {
    type Response = OperationResponse;
    type Error = OperationError;
    type Future = Pin<Box<dyn Future<Output = Result<OperationResponse, OperationError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, op: Operation) -> Self::Future {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move { inner.dispatch(op).await })
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

impl DispatcherInner {
    async fn dispatch(&self, op: Operation) -> Result<OperationResponse, OperationError> {
        let Operation {
            ctx,
            request,
            native,
        } = op;
        // the reward counts once the feedback is received, whatever the
        // component then does with it
        if let Request::Feedback(fb) = &request {
            self.metrics
                .record_feedback(fb.reward, ctx.method.metric_tag());
        }

        let (tier, response) = self.dispatch_tiers(&ctx, request, native).await?;
        debug!(
            request_id = %ctx.request_id,
            method = %ctx.method,
            tier = tier.as_str(),
            "operation dispatched"
        );
        Ok(response)
    }

    async fn dispatch_tiers(
        &self,
        ctx: &OperationContext,
        request: Request,
        native: Option<NativeRequest>,
    ) -> Result<(Tier, OperationResponse), OperationError> {
        let method = ctx.method;
        let tiers = self.plan.tiers(method);

        if tiers.raw {
            match self.call_raw(method, &request).await {
                Ok(raw) => return Ok((Tier::Raw, self.finish_raw(method, raw)?)),
                Err(ComponentError::NotImplemented) => {}
                Err(err) => return Err(self.component_failure(ctx, err)),
            }
        }

        if tiers.legacy(ctx.transport) {
            if let Some(native) = native {
                match self.call_legacy(method, native).await {
                    Ok(response) => return Ok((Tier::Legacy, response)),
                    Err(ComponentError::NotImplemented) => {}
                    Err(err) => return Err(self.component_failure(ctx, err)),
                }
            }
        }

        self.typed(ctx, request, tiers.typed).await
    }

    fn component_failure(&self, ctx: &OperationContext, err: ComponentError) -> OperationError {
        match err {
            ComponentError::Failed(source) => {
                error!(
                    request_id = %ctx.request_id,
                    method = %ctx.method,
                    error = %source,
                    "component call failed"
                );
                OperationError::Internal(source)
            }
            ComponentError::MetaRejected => OperationError::Internal(anyhow::anyhow!(
                "component rejected the call without meta"
            )),
            ComponentError::NotImplemented => {
                OperationError::Internal(anyhow::anyhow!("no implementation answered"))
            }
        }
    }

    // -- raw tier ----------------------------------------------------------

    async fn call_raw(
        &self,
        method: Method,
        request: &Request,
    ) -> Result<RawResponse, ComponentError> {
        let c = self.component.as_ref();
        match (method, request) {
            (Method::Predict, Request::Message(m)) => c.predict_raw(m).await,
            (Method::TransformInput, Request::Message(m)) => c.transform_input_raw(m).await,
            (Method::TransformOutput, Request::Message(m)) => c.transform_output_raw(m).await,
            (Method::Route, Request::Message(m)) => c.route_raw(m).await,
            (Method::Aggregate, Request::List(l)) => c.aggregate_raw(l).await,
            (Method::SendFeedback, Request::Feedback(f)) => c.send_feedback_raw(f).await,
            (Method::HealthStatus, _) => c.health_status_raw().await,
            _ => Err(ComponentError::NotImplemented),
        }
    }

    /// Records any metrics carried in the raw response's `meta.metrics` and
    /// passes the response through untouched.
    fn finish_raw(
        &self,
        method: Method,
        raw: RawResponse,
    ) -> Result<OperationResponse, OperationError> {
        match raw {
            RawResponse::Message(message) => {
                self.metrics
                    .record(&message.meta.metrics, method.metric_tag())?;
                Ok(OperationResponse::Message(message))
            }
            RawResponse::Json(doc) => {
                if let Some(list) = doc.pointer("/meta/metrics") {
                    let records = MetricRecord::parse_list(list)?;
                    self.metrics.record(&records, method.metric_tag())?;
                }
                Ok(OperationResponse::Document(doc))
            }
        }
    }

    // -- legacy tier -------------------------------------------------------

    #[allow(deprecated)]
    async fn call_legacy(
        &self,
        method: Method,
        native: NativeRequest,
    ) -> Result<OperationResponse, ComponentError> {
        match native {
            NativeRequest::Json(doc) => self
                .component
                .handle_rest(method, &doc)
                .await
                .map(OperationResponse::Document),
            NativeRequest::MsgPack(body) => self
                .component
                .handle_rpc(method, &body)
                .await
                .map(OperationResponse::Native),
        }
    }

    // -- typed tier --------------------------------------------------------

    async fn typed(
        &self,
        ctx: &OperationContext,
        request: Request,
        declared: bool,
    ) -> Result<(Tier, OperationResponse), OperationError> {
        match (ctx.method, request) {
            (
                method @ (Method::Predict
                | Method::TransformInput
                | Method::TransformOutput
                | Method::Route),
                Request::Message(message),
            ) => self.typed_message(ctx, method, &message, declared).await,
            (Method::Aggregate, Request::List(list)) => {
                self.typed_aggregate(ctx, &list, declared).await
            }
            (Method::SendFeedback, Request::Feedback(feedback)) => {
                self.typed_feedback(ctx, &feedback, declared).await
            }
            (Method::HealthStatus, _) => self.typed_health(ctx, declared).await,
            (Method::Metadata, _) => self.typed_metadata(ctx, declared).await,
            (method, _) => Err(OperationError::malformed(format!(
                "request body does not fit {method}"
            ))),
        }
    }

    /// Runs a typed call, mapping `NotImplemented` to the neutral result.
    fn settle(
        &self,
        ctx: &OperationContext,
        outcome: Result<ComponentResult, ComponentError>,
        neutral: impl FnOnce() -> Data,
    ) -> Result<(Tier, ComponentResult), OperationError> {
        match outcome {
            Ok(result) => Ok((Tier::Typed, result)),
            Err(ComponentError::NotImplemented) => {
                Ok((Tier::Neutral, ComponentResult::new(neutral())))
            }
            Err(err) => Err(self.component_failure(ctx, err)),
        }
    }

    async fn typed_message(
        &self,
        ctx: &OperationContext,
        method: Method,
        message: &Message,
        declared: bool,
    ) -> Result<(Tier, OperationResponse), OperationError> {
        let outcome = if declared {
            self.call_with_meta(ctx, method, message).await
        } else {
            Err(ComponentError::NotImplemented)
        };
        let (tier, mut result) = self.settle(ctx, outcome, || match method {
            Method::Route => Data::Int(-1),
            Method::TransformInput | Method::TransformOutput => Data::from_payload(&message.payload),
            _ => Data::Tensor(Tensor::empty()),
        })?;

        if method == Method::Route {
            let Data::Int(branch) = result.data else {
                return Err(OperationError::protocol(
                    "route must return an integer branch index",
                ));
            };
            #[allow(clippy::cast_precision_loss)]
            let tensor = Tensor::new(vec![1, 1], vec![branch as f64])
                .map_err(|e| OperationError::protocol(e.to_string()))?;
            result.data = Data::Tensor(tensor);
        }

        let recorded = self.record_metrics(method, &result)?;
        let mut request_meta = message.meta.clone();
        let metrics = carry_request_metrics(&mut request_meta, recorded);
        let response = self.builder().build(Assembly {
            method,
            request: Some(message),
            request_meta,
            result,
            metrics,
        })?;
        Ok((tier, OperationResponse::Message(response)))
    }

    /// Calls the typed method with `meta`; a component that rejects `meta`
    /// is called once more without it.
    async fn call_with_meta(
        &self,
        ctx: &OperationContext,
        method: Method,
        message: &Message,
    ) -> Result<ComponentResult, ComponentError> {
        match self.call_typed(method, message, Some(&message.meta)).await {
            Err(ComponentError::MetaRejected) => {
                warn!(
                    request_id = %ctx.request_id,
                    method = %method,
                    "component rejected meta, retrying without it"
                );
                self.call_typed(method, message, None).await
            }
            other => other,
        }
    }

    async fn call_typed(
        &self,
        method: Method,
        message: &Message,
        meta: Option<&Meta>,
    ) -> Result<ComponentResult, ComponentError> {
        let c = self.component.as_ref();
        let (features, names) = (&message.payload, message.names.as_slice());
        match method {
            Method::Predict => c.predict(features, names, meta).await,
            Method::TransformInput => c.transform_input(features, names, meta).await,
            Method::TransformOutput => c.transform_output(features, names, meta).await,
            Method::Route => c.route(features, names, meta).await,
            _ => Err(ComponentError::NotImplemented),
        }
    }

    async fn typed_aggregate(
        &self,
        ctx: &OperationContext,
        list: &MessageList,
        declared: bool,
    ) -> Result<(Tier, OperationResponse), OperationError> {
        let Some(first) = list.messages.first() else {
            return Err(OperationError::malformed(
                "aggregate needs at least one message",
            ));
        };
        let outcome = if declared {
            let features: Vec<Payload> = list.messages.iter().map(|m| m.payload.clone()).collect();
            let names: Vec<Vec<String>> = list.messages.iter().map(|m| m.names.clone()).collect();
            self.component.aggregate(&features, &names).await
        } else {
            Err(ComponentError::NotImplemented)
        };
        let (tier, result) = self.settle(ctx, outcome, || Data::Tensor(Tensor::empty()))?;

        let recorded = self.record_metrics(Method::Aggregate, &result)?;
        let mut request_meta = Meta::default();
        for message in &list.messages {
            request_meta.merge(&message.meta);
        }
        let metrics = carry_request_metrics(&mut request_meta, recorded);

        let response = self.builder().build(Assembly {
            method: Method::Aggregate,
            request: Some(first),
            request_meta,
            result,
            metrics,
        })?;
        Ok((tier, OperationResponse::Message(response)))
    }

    async fn typed_feedback(
        &self,
        ctx: &OperationContext,
        feedback: &Feedback,
        declared: bool,
    ) -> Result<(Tier, OperationResponse), OperationError> {
        let outcome = if declared {
            let empty = Payload::Tensor(Tensor::empty());
            let (features, names) = feedback
                .request
                .as_ref()
                .map_or((&empty, &[][..]), |m| (&m.payload, m.names.as_slice()));
            let truth = feedback.truth.as_ref().map(|m| &m.payload);
            let routing = feedback.response.as_ref().and_then(|r| {
                r.meta
                    .routing
                    .get(&self.config.predictive_unit_id)
                    .copied()
            });
            self.component
                .send_feedback(features, names, feedback.reward, truth, routing)
                .await
        } else {
            Err(ComponentError::NotImplemented)
        };
        let (tier, result) = self.settle(ctx, outcome, || Data::Tensor(Tensor::empty()))?;

        let recorded = self.record_metrics(Method::SendFeedback, &result)?;
        let mut request_meta = feedback
            .request
            .as_ref()
            .map(|m| m.meta.clone())
            .unwrap_or_default();
        let metrics = carry_request_metrics(&mut request_meta, recorded);
        let response = self.builder().build(Assembly {
            method: Method::SendFeedback,
            request: feedback.request.as_ref(),
            request_meta,
            result,
            metrics,
        })?;
        Ok((tier, OperationResponse::Message(response)))
    }

    async fn typed_health(
        &self,
        ctx: &OperationContext,
        declared: bool,
    ) -> Result<(Tier, OperationResponse), OperationError> {
        let outcome = if declared {
            self.component.health_status().await
        } else {
            Err(ComponentError::NotImplemented)
        };
        let (tier, result) = self.settle(ctx, outcome, || Data::Tensor(Tensor::empty()))?;
        let metrics = self.record_metrics(Method::HealthStatus, &result)?;
        let response = self.builder().build(Assembly {
            method: Method::HealthStatus,
            request: None,
            request_meta: Meta::default(),
            result,
            metrics,
        })?;
        Ok((tier, OperationResponse::Message(response)))
    }

    async fn typed_metadata(
        &self,
        ctx: &OperationContext,
        declared: bool,
    ) -> Result<(Tier, OperationResponse), OperationError> {
        let outcome = if declared {
            self.component.metadata().await
        } else {
            Err(ComponentError::NotImplemented)
        };
        let (tier, doc) = match outcome {
            Ok(doc) => (Tier::Typed, doc),
            Err(ComponentError::NotImplemented) => (Tier::Neutral, json!({})),
            Err(err) => return Err(self.component_failure(ctx, err)),
        };
        let Value::Object(mut map) = doc else {
            return Err(OperationError::protocol("metadata must be a JSON object"));
        };
        if !self.config.model_name.is_empty() {
            map.entry("name")
                .or_insert_with(|| Value::String(self.config.model_name.clone()));
        }
        Ok((tier, OperationResponse::Document(Value::Object(map))))
    }

    // -- helpers -----------------------------------------------------------

    /// Records the call's metrics plus the component's static metrics and
    /// returns everything recorded.
    fn record_metrics(
        &self,
        method: Method,
        result: &ComponentResult,
    ) -> Result<Vec<MetricRecord>, OperationError> {
        let mut records = result.metrics.clone();
        if self.plan.metrics {
            records.extend(self.component.metrics());
        }
        self.metrics.record(&records, method.metric_tag())?;
        Ok(records)
    }

    fn builder(&self) -> ResponseBuilder<'_> {
        ResponseBuilder {
            plan: &self.plan,
            component: self.component.as_ref(),
            config: &self.config,
        }
    }
}

/// Prepends the metrics that arrived on the request to those recorded by
/// this call. Incoming metrics are echoed, never recorded twice.
fn carry_request_metrics(
    request_meta: &mut Meta,
    recorded: Vec<MetricRecord>,
) -> Vec<MetricRecord> {
    let mut metrics = std::mem::take(&mut request_meta.metrics);
    metrics.extend(recorded);
    metrics
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use async_trait::async_trait;
    use predictor_core::{MetricType, Status};
    use tower::ServiceExt;

    use super::*;
    use crate::component::{Capabilities, Capability, ComponentOutcome};
    use crate::service::operation::Transport;

    fn op(method: Method, request: Request) -> Operation {
        Operation::new(
            OperationContext::new("req-1", method, Transport::Http, 1000),
            request,
        )
    }

    fn tensor_message(values: Vec<f64>) -> Message {
        Message::from_payload(Tensor::row(values))
    }

    fn dispatcher(component: impl Component) -> Dispatcher {
        Dispatcher::new(
            Arc::new(component),
            Arc::new(MetricsAggregator::new()),
            ServerConfig::default(),
        )
    }

    async fn call(d: &Dispatcher, op: Operation) -> Result<OperationResponse, OperationError> {
        d.clone().oneshot(op).await
    }

    fn message(response: OperationResponse) -> Message {
        match response {
            OperationResponse::Message(m) => m,
            other => panic!("expected message, got {other:?}"),
        }
    }

    // -- components --------------------------------------------------------

    struct Neutral;

    #[async_trait]
    impl Component for Neutral {
        fn capabilities(&self) -> Capabilities {
            Capabilities::new()
        }
    }

    struct Doubler;

    #[async_trait]
    impl Component for Doubler {
        fn capabilities(&self) -> Capabilities {
            Capabilities::new()
                .typed(Method::Predict)
                .with(Capability::ClassNames)
                .with(Capability::Tags)
                .with(Capability::Metrics)
        }

        async fn predict(
            &self,
            features: &Payload,
            _names: &[String],
            _meta: Option<&Meta>,
        ) -> ComponentOutcome<ComponentResult> {
            let t = features.as_tensor().ok_or(ComponentError::NotImplemented)?;
            let doubled: Vec<f64> = t.values().iter().map(|v| v * 2.0).collect();
            let out = Tensor::new(t.shape().to_vec(), doubled).map_err(anyhow::Error::from)?;
            Ok(ComponentResult::from(out)
                .with_tag("source", "runtime")
                .with_metric(MetricRecord::counter("calls", 1.0)))
        }

        fn class_names(&self) -> Vec<String> {
            vec!["a".into(), "b".into()]
        }

        fn tags(&self) -> BTreeMap<String, Value> {
            BTreeMap::from([
                ("source".to_string(), json!("static")),
                ("model".to_string(), json!("doubler")),
            ])
        }

        fn metrics(&self) -> Vec<MetricRecord> {
            vec![MetricRecord::gauge("static_gauge", 7.0)]
        }
    }

    struct MetaAverse;

    #[async_trait]
    impl Component for MetaAverse {
        fn capabilities(&self) -> Capabilities {
            Capabilities::new().typed(Method::Predict)
        }

        async fn predict(
            &self,
            features: &Payload,
            _names: &[String],
            meta: Option<&Meta>,
        ) -> ComponentOutcome<ComponentResult> {
            if meta.is_some() {
                return Err(ComponentError::MetaRejected);
            }
            Ok(ComponentResult::new(Data::from_payload(features)))
        }
    }

    struct Router(ComponentResult);

    #[async_trait]
    impl Component for Router {
        fn capabilities(&self) -> Capabilities {
            Capabilities::new().typed(Method::Route)
        }

        async fn route(
            &self,
            _features: &Payload,
            _names: &[String],
            _meta: Option<&Meta>,
        ) -> ComponentOutcome<ComponentResult> {
            Ok(self.0.clone())
        }
    }

    struct RawWithMetrics;

    #[async_trait]
    impl Component for RawWithMetrics {
        fn capabilities(&self) -> Capabilities {
            Capabilities::new()
                .raw(Method::Predict)
                .typed(Method::Predict)
                .raw(Method::TransformInput)
        }

        async fn predict_raw(&self, _request: &Message) -> ComponentOutcome<RawResponse> {
            Ok(RawResponse::Json(json!({
                "jsonData": {"raw": true},
                "meta": {"metrics": [{"key": "raw_counter", "type": "COUNTER", "value": 3}]}
            })))
        }

        async fn predict(
            &self,
            _features: &Payload,
            _names: &[String],
            _meta: Option<&Meta>,
        ) -> ComponentOutcome<ComponentResult> {
            Err(ComponentError::Failed(anyhow::anyhow!("typed tier must not run")))
        }

        async fn transform_input_raw(&self, _request: &Message) -> ComponentOutcome<RawResponse> {
            Ok(RawResponse::Json(json!({
                "meta": {"metrics": [{"key": "", "type": "COUNTER", "value": 1}]}
            })))
        }
    }

    struct Legacy;

    #[async_trait]
    impl Component for Legacy {
        fn capabilities(&self) -> Capabilities {
            Capabilities::new().legacy(Method::Predict, Transport::Http)
        }

        async fn handle_rest(&self, method: Method, request: &Value) -> ComponentOutcome<Value> {
            Ok(json!({"method": method.as_str(), "echo": request}))
        }
    }

    struct Failing;

    #[async_trait]
    impl Component for Failing {
        fn capabilities(&self) -> Capabilities {
            Capabilities::new().typed(Method::Predict)
        }

        async fn predict(
            &self,
            _features: &Payload,
            _names: &[String],
            _meta: Option<&Meta>,
        ) -> ComponentOutcome<ComponentResult> {
            Err(ComponentError::Failed(anyhow::anyhow!("model exploded")))
        }
    }

    struct Aggregator;

    #[async_trait]
    impl Component for Aggregator {
        fn capabilities(&self) -> Capabilities {
            Capabilities::new().typed(Method::Aggregate)
        }

        async fn aggregate(
            &self,
            features: &[Payload],
            _names: &[Vec<String>],
        ) -> ComponentOutcome<ComponentResult> {
            let sum: f64 = features
                .iter()
                .filter_map(Payload::as_tensor)
                .map(|t| t.values().iter().sum::<f64>())
                .sum();
            Ok(ComponentResult::new(Data::Float(sum)))
        }
    }

    struct FeedbackSink;

    #[async_trait]
    impl Component for FeedbackSink {
        fn capabilities(&self) -> Capabilities {
            Capabilities::new()
                .typed(Method::SendFeedback)
                .typed(Method::Metadata)
        }

        async fn send_feedback(
            &self,
            _features: &Payload,
            _names: &[String],
            reward: f64,
            _truth: Option<&Payload>,
            routing: Option<i64>,
        ) -> ComponentOutcome<ComponentResult> {
            Ok(ComponentResult::new(Data::Json(
                json!({"reward": reward, "routing": routing}),
            )))
        }

        async fn metadata(&self) -> ComponentOutcome<Value> {
            Ok(json!({"versions": ["v1"]}))
        }
    }

    struct BrokenFeedback;

    #[async_trait]
    impl Component for BrokenFeedback {
        fn capabilities(&self) -> Capabilities {
            Capabilities::new().typed(Method::SendFeedback)
        }

        async fn send_feedback(
            &self,
            _features: &Payload,
            _names: &[String],
            _reward: f64,
            _truth: Option<&Payload>,
            _routing: Option<i64>,
        ) -> ComponentOutcome<ComponentResult> {
            Err(ComponentError::Failed(anyhow::anyhow!("feedback store offline")))
        }
    }

    // -- tests -------------------------------------------------------------

    #[tokio::test]
    async fn neutral_predict_returns_empty_tensor() {
        let d = dispatcher(Neutral);
        let resp = message(
            call(&d, op(Method::Predict, Request::Message(tensor_message(vec![1.0]))))
                .await
                .unwrap(),
        );
        assert_eq!(resp.payload, Payload::Tensor(Tensor::empty()));
        assert_eq!(resp.meta.request_path.get("0"), Some(&String::new()));
    }

    #[tokio::test]
    async fn existing_request_path_entry_is_kept() {
        let d = Dispatcher::new(
            Arc::new(Neutral),
            Arc::new(MetricsAggregator::new()),
            ServerConfig {
                predictive_unit_id: "classifier".into(),
                predictive_unit_image: "img:2".into(),
                ..ServerConfig::default()
            },
        );
        let mut req = tensor_message(vec![1.0]);
        req.meta
            .request_path
            .insert("classifier".into(), "img:1".into());
        req.meta.request_path.insert("router".into(), "r:1".into());
        let resp = message(call(&d, op(Method::Predict, Request::Message(req))).await.unwrap());
        assert_eq!(resp.meta.request_path["classifier"], "img:1");
        assert_eq!(resp.meta.request_path["router"], "r:1");

        let resp = message(
            call(&d, op(Method::Predict, Request::Message(tensor_message(vec![1.0]))))
                .await
                .unwrap(),
        );
        assert_eq!(resp.meta.request_path["classifier"], "img:2");
    }

    #[tokio::test]
    async fn neutral_transform_is_identity() {
        let d = dispatcher(Neutral);
        let req = Message::from_payload(Payload::Str("hello".into()));
        let resp = message(
            call(&d, op(Method::TransformInput, Request::Message(req)))
                .await
                .unwrap(),
        );
        assert_eq!(resp.payload, Payload::Str("hello".into()));
    }

    #[tokio::test]
    async fn neutral_route_is_minus_one() {
        let d = dispatcher(Neutral);
        let resp = message(
            call(&d, op(Method::Route, Request::Message(tensor_message(vec![1.0]))))
                .await
                .unwrap(),
        );
        let t = resp.payload.as_tensor().unwrap();
        assert_eq!(t.shape(), &[1, 1]);
        assert_eq!(t.values(), &[-1.0]);
    }

    #[tokio::test]
    async fn typed_predict_assembles_envelope() {
        let d = dispatcher(Doubler);
        let mut req = tensor_message(vec![1.0, 2.0]);
        req.meta.puid = Some("abc".into());
        req.meta.tags.insert("incoming".into(), json!(1));
        let resp = message(call(&d, op(Method::Predict, Request::Message(req))).await.unwrap());

        assert_eq!(resp.payload.as_tensor().unwrap().values(), &[2.0, 4.0]);
        assert_eq!(resp.names, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(resp.meta.puid.as_deref(), Some("abc"));
        assert_eq!(resp.meta.tags["incoming"], json!(1));
        assert_eq!(resp.meta.tags["model"], json!("doubler"));
        assert_eq!(resp.meta.tags["source"], json!("runtime"));
        assert_eq!(resp.meta.metrics.len(), 2);

        let snapshot = d.metrics().snapshot();
        assert!(snapshot
            .get(MetricType::COUNTER, "calls", &[("method", "predict")])
            .is_some());
        assert!(snapshot
            .get(MetricType::GAUGE, "static_gauge", &[("method", "predict")])
            .is_some());
    }

    #[tokio::test]
    async fn class_names_that_do_not_fit_are_generated() {
        let d = dispatcher(Doubler);
        let resp = message(
            call(
                &d,
                op(Method::Predict, Request::Message(tensor_message(vec![1.0, 2.0, 3.0]))),
            )
            .await
            .unwrap(),
        );
        assert_eq!(resp.names, vec!["t:0", "t:1", "t:2"]);
    }

    #[tokio::test]
    async fn metrics_are_not_echoed_when_disabled() {
        let d = Dispatcher::new(
            Arc::new(Doubler),
            Arc::new(MetricsAggregator::new()),
            ServerConfig {
                include_metrics_in_response: false,
                ..ServerConfig::default()
            },
        );
        let resp = message(
            call(&d, op(Method::Predict, Request::Message(tensor_message(vec![1.0, 2.0]))))
                .await
                .unwrap(),
        );
        assert!(resp.meta.metrics.is_empty());
        assert_eq!(d.metrics().snapshot().entries.len(), 2);
    }

    #[tokio::test]
    async fn meta_rejection_retries_without_meta() {
        let d = dispatcher(MetaAverse);
        let resp = message(
            call(&d, op(Method::Predict, Request::Message(tensor_message(vec![5.0]))))
                .await
                .unwrap(),
        );
        assert_eq!(resp.payload.as_tensor().unwrap().values(), &[5.0]);
    }

    #[tokio::test]
    async fn route_returns_branch_tensor() {
        let d = dispatcher(Router(ComponentResult::new(Data::Int(2))));
        let resp = message(
            call(&d, op(Method::Route, Request::Message(tensor_message(vec![1.0]))))
                .await
                .unwrap(),
        );
        let t = resp.payload.as_tensor().unwrap();
        assert_eq!(t.shape(), &[1, 1]);
        assert_eq!(t.values(), &[2.0]);
    }

    #[tokio::test]
    async fn non_integer_route_is_protocol_violation() {
        let d = dispatcher(Router(ComponentResult::new(Data::Float(1.5))));
        let err = call(&d, op(Method::Route, Request::Message(tensor_message(vec![1.0]))))
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::ProtocolViolation { .. }));
        assert_eq!(err.status_code(), http::StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn raw_tier_wins_and_records_metrics() {
        let d = dispatcher(RawWithMetrics);
        let resp = call(&d, op(Method::Predict, Request::Message(tensor_message(vec![1.0]))))
            .await
            .unwrap();
        match resp {
            OperationResponse::Document(doc) => assert_eq!(doc["jsonData"]["raw"], json!(true)),
            other => panic!("expected document, got {other:?}"),
        }
        let snapshot = d.metrics().snapshot();
        assert!(snapshot
            .get(MetricType::COUNTER, "raw_counter", &[("method", "predict")])
            .is_some());
    }

    #[tokio::test]
    async fn raw_bad_metric_is_rejected() {
        let d = dispatcher(RawWithMetrics);
        let err = call(
            &d,
            op(Method::TransformInput, Request::Message(tensor_message(vec![1.0]))),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, OperationError::BadMetric(_)));
        assert!(d.metrics().snapshot().entries.is_empty());
    }

    #[tokio::test]
    async fn legacy_runs_only_on_its_transport_with_native_request() {
        let d = dispatcher(Legacy);
        let native = json!({"data": {"ndarray": [[1]]}});
        let with_native = op(Method::Predict, Request::Message(tensor_message(vec![1.0])))
            .with_native(NativeRequest::Json(native.clone()));
        match call(&d, with_native).await.unwrap() {
            OperationResponse::Document(doc) => {
                assert_eq!(doc["method"], json!("predict"));
                assert_eq!(doc["echo"], native);
            }
            other => panic!("expected document, got {other:?}"),
        }

        let rpc = Operation::new(
            OperationContext::new("r", Method::Predict, Transport::Rpc, 1000),
            Request::Message(tensor_message(vec![1.0])),
        )
        .with_native(NativeRequest::MsgPack(bytes::Bytes::from_static(b"\x80")));
        let resp = message(call(&d, rpc).await.unwrap());
        assert_eq!(resp.payload, Payload::Tensor(Tensor::empty()));
    }

    #[tokio::test]
    async fn component_failure_maps_to_internal() {
        let d = dispatcher(Failing);
        let err = call(&d, op(Method::Predict, Request::Message(tensor_message(vec![1.0]))))
            .await
            .unwrap_err();
        let status: Status = err.to_status();
        assert_eq!(status.code, 500);
        assert!(!status.info.contains("exploded"));
    }

    #[tokio::test]
    async fn aggregate_merges_input_meta() {
        let d = dispatcher(Aggregator);
        let mut a = tensor_message(vec![1.0, 2.0]);
        a.meta.tags.insert("shared".into(), json!("a"));
        a.meta.tags.insert("only_a".into(), json!(true));
        a.meta.metrics.push(MetricRecord::counter("upstream", 1.0));
        let mut b = tensor_message(vec![3.0]);
        b.meta.tags.insert("shared".into(), json!("b"));

        let list = MessageList::from(vec![a, b]);
        let resp = message(call(&d, op(Method::Aggregate, Request::List(list))).await.unwrap());
        assert_eq!(resp.payload.as_tensor().unwrap().values(), &[6.0]);
        assert_eq!(resp.meta.tags["shared"], json!("b"));
        assert_eq!(resp.meta.tags["only_a"], json!(true));
        assert!(resp.meta.metrics.iter().any(|m| m.key == "upstream"));
    }

    #[tokio::test]
    async fn empty_aggregate_is_malformed() {
        let d = dispatcher(Aggregator);
        let err = call(
            &d,
            op(Method::Aggregate, Request::List(MessageList::default())),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, OperationError::MalformedPayload { .. }));
    }

    #[tokio::test]
    async fn feedback_passes_routing_and_counts_reward() {
        let d = dispatcher(FeedbackSink);
        let mut response = tensor_message(vec![1.0]);
        response.meta.routing.insert("0".into(), 1);
        let feedback = Feedback {
            request: Some(tensor_message(vec![1.0])),
            response: Some(response),
            reward: 0.5,
            truth: None,
        };
        let resp = message(
            call(&d, op(Method::SendFeedback, Request::Feedback(feedback)))
                .await
                .unwrap(),
        );
        assert_eq!(
            resp.payload,
            Payload::Json(json!({"reward": 0.5, "routing": 1}))
        );

        let snapshot = d.metrics().snapshot();
        assert!(snapshot
            .find(MetricType::COUNTER, crate::metrics::aggregator::FEEDBACK_COUNT)
            .next()
            .is_some());
    }

    #[tokio::test]
    async fn failed_feedback_still_counts_reward() {
        let d = dispatcher(BrokenFeedback);
        let feedback = Feedback {
            request: Some(tensor_message(vec![1.0])),
            response: None,
            reward: 1.0,
            truth: None,
        };
        let err = call(&d, op(Method::SendFeedback, Request::Feedback(feedback)))
            .await
            .unwrap_err();
        assert_eq!(err.to_status().code, 500);

        let snapshot = d.metrics().snapshot();
        assert!(snapshot
            .find(MetricType::COUNTER, crate::metrics::aggregator::FEEDBACK_COUNT)
            .next()
            .is_some());
    }

    #[tokio::test]
    async fn request_metrics_are_echoed_on_predict_and_feedback() {
        let d = dispatcher(Doubler);
        let mut req = tensor_message(vec![1.0, 2.0]);
        req.meta.metrics.push(MetricRecord::counter("upstream", 1.0));
        let resp = message(call(&d, op(Method::Predict, Request::Message(req))).await.unwrap());
        let keys: Vec<&str> = resp.meta.metrics.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, vec!["upstream", "calls", "static_gauge"]);
        // echoed, not recorded
        assert!(d
            .metrics()
            .snapshot()
            .find(MetricType::COUNTER, "upstream")
            .next()
            .is_none());

        let d = dispatcher(FeedbackSink);
        let mut request = tensor_message(vec![1.0]);
        request.meta.metrics.push(MetricRecord::gauge("drift", 0.3));
        let feedback = Feedback {
            request: Some(request),
            response: None,
            reward: 0.0,
            truth: None,
        };
        let resp = message(
            call(&d, op(Method::SendFeedback, Request::Feedback(feedback)))
                .await
                .unwrap(),
        );
        assert!(resp.meta.metrics.iter().any(|m| m.key == "drift"));
    }

    #[tokio::test]
    async fn request_metrics_are_dropped_when_echo_is_disabled() {
        let d = Dispatcher::new(
            Arc::new(Doubler),
            Arc::new(MetricsAggregator::new()),
            ServerConfig {
                include_metrics_in_response: false,
                ..ServerConfig::default()
            },
        );
        let mut req = tensor_message(vec![1.0, 2.0]);
        req.meta.metrics.push(MetricRecord::counter("upstream", 1.0));
        let resp = message(call(&d, op(Method::Predict, Request::Message(req))).await.unwrap());
        assert!(resp.meta.metrics.is_empty());
    }

    #[tokio::test]
    async fn metadata_defaults_name_from_config() {
        let d = Dispatcher::new(
            Arc::new(FeedbackSink),
            Arc::new(MetricsAggregator::new()),
            ServerConfig {
                model_name: "iris".into(),
                ..ServerConfig::default()
            },
        );
        match call(&d, op(Method::Metadata, Request::Empty)).await.unwrap() {
            OperationResponse::Document(doc) => {
                assert_eq!(doc, json!({"name": "iris", "versions": ["v1"]}));
            }
            other => panic!("expected document, got {other:?}"),
        }

        let neutral = dispatcher(Neutral);
        match call(&neutral, op(Method::Metadata, Request::Empty)).await.unwrap() {
            OperationResponse::Document(doc) => assert_eq!(doc, json!({})),
            other => panic!("expected document, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn health_status_without_override_is_empty() {
        let d = dispatcher(Neutral);
        let resp = message(call(&d, op(Method::HealthStatus, Request::Empty)).await.unwrap());
        assert_eq!(resp.payload, Payload::Tensor(Tensor::empty()));
    }

    #[tokio::test]
    async fn mismatched_body_is_malformed() {
        let d = dispatcher(Neutral);
        let err = call(&d, op(Method::Predict, Request::Empty)).await.unwrap_err();
        assert!(matches!(err, OperationError::MalformedPayload { .. }));
    }
}
