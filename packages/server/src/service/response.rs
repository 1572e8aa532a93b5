//! Response envelope assembly for the typed tier.

use predictor_core::{Message, Meta, MetricRecord, Payload, PayloadKind, Tensor};

use super::capability::DispatchPlan;
use super::config::ServerConfig;
use super::operation::{Method, OperationError};
use crate::component::{Component, ComponentResult, Data};

/// Everything response assembly needs from one typed call.
pub(crate) struct Assembly<'a> {
    pub method: Method,
    /// The message whose data variant and names the response mirrors.
    pub request: Option<&'a Message>,
    /// Meta to carry over: puid, tags, routing and request path.
    pub request_meta: Meta,
    pub result: ComponentResult,
    /// Metrics echoed when `include_metrics_in_response` is on.
    pub metrics: Vec<MetricRecord>,
}

pub(crate) struct ResponseBuilder<'a> {
    pub plan: &'a DispatchPlan,
    pub component: &'a dyn Component,
    pub config: &'a ServerConfig,
}

impl ResponseBuilder<'_> {
    pub fn build(&self, assembly: Assembly<'_>) -> Result<Message, OperationError> {
        let Assembly {
            method,
            request,
            request_meta,
            result,
            metrics,
        } = assembly;

        let request_kind = request.map(|m| m.payload.kind());
        let payload = to_payload(result.data, request_kind)?;
        let names = self.names(method, &payload, request);

        let mut meta = request_meta;
        if self.plan.tags {
            meta.tags.extend(self.component.tags());
        }
        meta.tags.extend(result.tags);
        if !self.config.predictive_unit_id.is_empty() {
            meta.request_path
                .entry(self.config.predictive_unit_id.clone())
                .or_insert_with(|| self.config.predictive_unit_image.clone());
        }
        meta.metrics = if self.config.include_metrics_in_response {
            metrics
        } else {
            Vec::new()
        };

        Message::new(payload, names, meta).map_err(|e| OperationError::protocol(e.to_string()))
    }

    /// Column names for a rank >= 2 result: declared names when they fit,
    /// otherwise `t:0..t:n-1`.
    fn names(&self, method: Method, payload: &Payload, request: Option<&Message>) -> Vec<String> {
        let columns = match payload {
            Payload::Tensor(t) if t.rank() >= 2 => t.column_count(),
            Payload::NdArray(_) => payload.column_count(),
            _ => None,
        };
        let Some(columns) = columns else {
            return Vec::new();
        };

        let mut candidates: Vec<Vec<String>> = Vec::new();
        if method == Method::TransformInput {
            if self.plan.feature_names {
                candidates.push(self.component.feature_names());
            }
            if let Some(request) = request {
                candidates.push(request.names.clone());
            }
        } else if self.plan.class_names {
            candidates.push(self.component.class_names());
        }

        candidates
            .into_iter()
            .find(|names| names.len() == columns)
            .unwrap_or_else(|| (0..columns).map(|i| format!("t:{i}")).collect())
    }
}

/// Picks the payload variant for a result.
///
/// Numeric results follow the request's data variant (ndarray stays
/// ndarray) and default to tensor; non-numeric rows are ndarray.
pub(crate) fn to_payload(
    data: Data,
    request_kind: Option<PayloadKind>,
) -> Result<Payload, OperationError> {
    let wants_ndarray = request_kind == Some(PayloadKind::NdArray);
    let numeric = |t: Tensor| {
        if wants_ndarray {
            Payload::NdArray(t.to_ndarray())
        } else {
            Payload::Tensor(t)
        }
    };
    let scalar = |v: f64| {
        Tensor::new(vec![1], vec![v]).map_err(|e| OperationError::protocol(e.to_string()))
    };

    Ok(match data {
        Data::Tensor(t) => numeric(t),
        Data::Rows(rows) => match Tensor::from_ndarray(&rows) {
            Some(t) if !wants_ndarray => Payload::Tensor(t),
            _ => Payload::NdArray(rows),
        },
        #[allow(clippy::cast_precision_loss)]
        Data::Int(i) => numeric(scalar(i as f64)?),
        Data::Float(f) => numeric(scalar(f)?),
        Data::Str(s) => Payload::Str(s),
        Data::Bytes(b) => Payload::Binary(b),
        Data::Json(v) => Payload::Json(v),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn numeric_result_follows_ndarray_request() {
        let t = Tensor::row(vec![1.0, 2.0]);
        let p = to_payload(Data::Tensor(t.clone()), Some(PayloadKind::NdArray)).unwrap();
        assert_eq!(p, Payload::NdArray(vec![json!([1.0, 2.0])]));
        let p = to_payload(Data::Tensor(t.clone()), Some(PayloadKind::Tensor)).unwrap();
        assert_eq!(p, Payload::Tensor(t.clone()));
        let p = to_payload(Data::Tensor(t.clone()), Some(PayloadKind::Str)).unwrap();
        assert_eq!(p, Payload::Tensor(t));
    }

    #[test]
    fn numeric_rows_default_to_tensor() {
        let p = to_payload(Data::Rows(vec![json!([1, 2])]), None).unwrap();
        assert_eq!(p, Payload::Tensor(Tensor::row(vec![1.0, 2.0])));
    }

    #[test]
    fn mixed_rows_stay_ndarray() {
        let rows = vec![json!([1, "a"])];
        let p = to_payload(Data::Rows(rows.clone()), Some(PayloadKind::Tensor)).unwrap();
        assert_eq!(p, Payload::NdArray(rows));
    }

    #[test]
    fn scalars_and_non_numeric_variants() {
        let p = to_payload(Data::Int(3), None).unwrap();
        assert_eq!(p, Payload::Tensor(Tensor::new(vec![1], vec![3.0]).unwrap()));
        assert!(to_payload(Data::Float(f64::NAN), None).is_err());
        assert_eq!(
            to_payload(Data::Str("s".into()), None).unwrap(),
            Payload::Str("s".into())
        );
        assert_eq!(
            to_payload(Data::Bytes(vec![1]), None).unwrap(),
            Payload::Binary(vec![1])
        );
        assert_eq!(
            to_payload(Data::Json(json!({"a": 1})), None).unwrap(),
            Payload::Json(json!({"a": 1}))
        );
    }
}
