//! A component that echoes its input. Served by `predictor-serve` when no
//! model is plugged in, and handy as a smoke-test target.

use std::collections::BTreeMap;

use async_trait::async_trait;
use predictor_core::{Meta, MetricRecord, Payload};
use serde_json::{json, Value};

use super::{Capabilities, Capability, Component, ComponentOutcome, ComponentResult, Data};
use crate::service::Method;

#[derive(Debug, Clone, Default)]
pub struct Identity {
    name: String,
}

impl Identity {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn echo(&self, features: &Payload, method: Method) -> ComponentResult {
        ComponentResult::new(Data::from_payload(features)).with_metric(
            MetricRecord::counter("identity_calls", 1.0).with_tag("method", method.metric_tag()),
        )
    }
}

#[async_trait]
impl Component for Identity {
    fn capabilities(&self) -> Capabilities {
        Capabilities::new()
            .typed(Method::Predict)
            .typed(Method::TransformInput)
            .typed(Method::TransformOutput)
            .typed(Method::SendFeedback)
            .typed(Method::Metadata)
            .with(Capability::Tags)
    }

    async fn predict(
        &self,
        features: &Payload,
        _names: &[String],
        _meta: Option<&Meta>,
    ) -> ComponentOutcome<ComponentResult> {
        Ok(self.echo(features, Method::Predict))
    }

    async fn transform_input(
        &self,
        features: &Payload,
        _names: &[String],
        _meta: Option<&Meta>,
    ) -> ComponentOutcome<ComponentResult> {
        Ok(self.echo(features, Method::TransformInput))
    }

    async fn transform_output(
        &self,
        features: &Payload,
        _names: &[String],
        _meta: Option<&Meta>,
    ) -> ComponentOutcome<ComponentResult> {
        Ok(self.echo(features, Method::TransformOutput))
    }

    async fn send_feedback(
        &self,
        features: &Payload,
        _names: &[String],
        _reward: f64,
        _truth: Option<&Payload>,
        _routing: Option<i64>,
    ) -> ComponentOutcome<ComponentResult> {
        Ok(self.echo(features, Method::SendFeedback))
    }

    async fn metadata(&self) -> ComponentOutcome<Value> {
        Ok(json!({
            "name": self.name,
            "versions": ["identity"],
            "platform": "predictor",
        }))
    }

    fn tags(&self) -> BTreeMap<String, Value> {
        BTreeMap::from([("component".to_string(), json!("identity"))])
    }
}
