//! Per-operation tier plan, built once from a component's capabilities.

use std::collections::HashMap;

use tracing::warn;

use super::operation::{Method, Transport};
use crate::component::{Capabilities, Capability};

/// Override level that handled a call. Logged on every dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Raw,
    Legacy,
    Typed,
    /// No override answered; the neutral result was returned.
    Neutral,
}

impl Tier {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Legacy => "legacy",
            Self::Typed => "typed",
            Self::Neutral => "neutral",
        }
    }
}

/// Which tiers exist for one operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierPlan {
    pub raw: bool,
    pub legacy_http: bool,
    pub legacy_rpc: bool,
    pub typed: bool,
}

impl TierPlan {
    #[must_use]
    pub fn legacy(&self, transport: Transport) -> bool {
        match transport {
            Transport::Http => self.legacy_http,
            Transport::Rpc => self.legacy_rpc,
        }
    }
}

/// Resolved dispatch plan for every operation plus the static descriptors a
/// component provides.
#[derive(Debug, Clone, Default)]
pub struct DispatchPlan {
    tiers: HashMap<Method, TierPlan>,
    pub tags: bool,
    pub class_names: bool,
    pub feature_names: bool,
    pub metrics: bool,
}

impl DispatchPlan {
    /// Builds the plan. Each declared legacy override is reported once here.
    #[must_use]
    pub fn build(capabilities: &Capabilities) -> Self {
        let mut plan = Self::default();
        for capability in capabilities.iter() {
            match *capability {
                Capability::Typed(m) => plan.entry(m).typed = true,
                Capability::Raw(m) => plan.entry(m).raw = true,
                Capability::Legacy(m, t) => {
                    warn!(
                        method = %m,
                        transport = %t,
                        "legacy transport-specific override is deprecated; implement {}_raw instead",
                        m.as_str()
                    );
                    match t {
                        Transport::Http => plan.entry(m).legacy_http = true,
                        Transport::Rpc => plan.entry(m).legacy_rpc = true,
                    }
                }
                Capability::Tags => plan.tags = true,
                Capability::ClassNames => plan.class_names = true,
                Capability::FeatureNames => plan.feature_names = true,
                Capability::Metrics => plan.metrics = true,
            }
        }
        plan
    }

    fn entry(&mut self, method: Method) -> &mut TierPlan {
        self.tiers.entry(method).or_default()
    }

    #[must_use]
    pub fn tiers(&self, method: Method) -> TierPlan {
        self.tiers.get(&method).copied().unwrap_or_default()
    }

    /// True when a call on `transport` needs its native request kept around.
    #[must_use]
    pub fn needs_native(&self, method: Method, transport: Transport) -> bool {
        self.tiers(method).legacy(transport)
    }
}
