//! Runtime introspection of the RPC service.
//!
//! `ServerReflection/ListServices` names the services on this port and
//! `ServerReflection/DescribeService` returns methods, message type names
//! and their field schema.

use serde::{Deserialize, Serialize};

use super::frame;
use crate::service::{Method, OperationError};

pub const MODEL_SERVICE: &str = "predictor.Model";
pub const REFLECTION_SERVICE: &str = "ServerReflection";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListServicesResponse {
    pub services: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescribeServiceRequest {
    #[serde(default)]
    pub service: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub methods: Vec<MethodDescriptor>,
    pub types: Vec<TypeDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub name: String,
    pub input_type: String,
    pub output_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDescriptor {
    pub name: String,
    pub fields: Vec<FieldDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    pub optional: bool,
}

fn field(name: &str, field_type: &str, optional: bool) -> FieldDescriptor {
    FieldDescriptor {
        name: name.to_string(),
        field_type: field_type.to_string(),
        optional,
    }
}

fn message_types(method: Method) -> (&'static str, &'static str) {
    match method {
        Method::SendFeedback => ("Feedback", "Message"),
        Method::Aggregate => ("MessageList", "Message"),
        Method::HealthStatus => ("Empty", "Message"),
        Method::Metadata => ("Empty", "Metadata"),
        _ => ("Message", "Message"),
    }
}

/// Descriptor of the model service.
#[must_use]
pub fn describe_model() -> ServiceDescriptor {
    let methods = Method::ALL
        .iter()
        .map(|m| {
            let (input, output) = message_types(*m);
            MethodDescriptor {
                name: m.rpc_name().to_string(),
                input_type: input.to_string(),
                output_type: output.to_string(),
            }
        })
        .collect();

    let types = vec![
        TypeDescriptor {
            name: "Message".into(),
            fields: vec![
                field("data", "DefaultData", true),
                field("binData", "bytes", true),
                field("strData", "string", true),
                field("jsonData", "json", true),
                field("meta", "Meta", true),
            ],
        },
        TypeDescriptor {
            name: "DefaultData".into(),
            fields: vec![
                field("names", "list<string>", true),
                field("tensor", "Tensor", true),
                field("ndarray", "list<json>", true),
            ],
        },
        TypeDescriptor {
            name: "Tensor".into(),
            fields: vec![
                field("shape", "list<uint>", false),
                field("values", "list<double>", false),
            ],
        },
        TypeDescriptor {
            name: "Meta".into(),
            fields: vec![
                field("puid", "string", true),
                field("tags", "map<string,json>", true),
                field("routing", "map<string,int>", true),
                field("requestPath", "map<string,string>", true),
                field("metrics", "list<Metric>", true),
            ],
        },
        TypeDescriptor {
            name: "Metric".into(),
            fields: vec![
                field("key", "string", false),
                field("type", "COUNTER|GAUGE|TIMER", false),
                field("value", "double", false),
                field("tags", "map<string,string>", true),
            ],
        },
        TypeDescriptor {
            name: "Feedback".into(),
            fields: vec![
                field("request", "Message", true),
                field("response", "Message", true),
                field("reward", "double", true),
                field("truth", "Message", true),
            ],
        },
        TypeDescriptor {
            name: "MessageList".into(),
            fields: vec![field("seldonMessages", "list<Message>", false)],
        },
        TypeDescriptor {
            name: "Metadata".into(),
            fields: vec![field("name", "string", true)],
        },
        TypeDescriptor {
            name: "Empty".into(),
            fields: Vec::new(),
        },
    ];

    ServiceDescriptor {
        name: MODEL_SERVICE.to_string(),
        methods,
        types,
    }
}

fn describe_reflection() -> ServiceDescriptor {
    ServiceDescriptor {
        name: REFLECTION_SERVICE.to_string(),
        methods: vec![
            MethodDescriptor {
                name: "ListServices".into(),
                input_type: "Empty".into(),
                output_type: "ListServicesResponse".into(),
            },
            MethodDescriptor {
                name: "DescribeService".into(),
                input_type: "DescribeServiceRequest".into(),
                output_type: "ServiceDescriptor".into(),
            },
        ],
        types: vec![
            TypeDescriptor {
                name: "ListServicesResponse".into(),
                fields: vec![field("services", "list<string>", false)],
            },
            TypeDescriptor {
                name: "DescribeServiceRequest".into(),
                fields: vec![field("service", "string", true)],
            },
        ],
    }
}

/// Answers one reflection call; the result is a MessagePack body.
///
/// # Errors
///
/// `MalformedPayload` for an unknown call, an undecodable request or an
/// unknown service name.
pub fn handle(call: &str, body: &[u8]) -> Result<Vec<u8>, OperationError> {
    let encoded = match call {
        "ListServices" => frame::encode(&ListServicesResponse {
            services: vec![MODEL_SERVICE.to_string(), REFLECTION_SERVICE.to_string()],
        }),
        "DescribeService" => {
            let request: DescribeServiceRequest = if body.is_empty() {
                DescribeServiceRequest::default()
            } else {
                frame::decode(body)
                    .map_err(|e| OperationError::malformed(format!("describe request: {e}")))?
            };
            let descriptor = match request.service.as_str() {
                "" | MODEL_SERVICE => describe_model(),
                REFLECTION_SERVICE => describe_reflection(),
                other => {
                    return Err(OperationError::malformed(format!("unknown service {other}")))
                }
            };
            frame::encode(&descriptor)
        }
        other => {
            return Err(OperationError::malformed(format!(
                "unknown reflection call {other}"
            )))
        }
    };
    encoded.map_err(|e| OperationError::Internal(e.into()))
}
