use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Boolean accessibility states worth surfacing to the decision backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Selected,
    Checked,
    Pressed,
    Expanded,
}

impl NodeState {
    pub fn from_property(name: &str) -> Option<Self> {
        match name {
            "selected" => Some(Self::Selected),
            "checked" => Some(Self::Checked),
            "pressed" => Some(Self::Pressed),
            "expanded" => Some(Self::Expanded),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Selected => "selected",
            Self::Checked => "checked",
            Self::Pressed => "pressed",
            Self::Expanded => "expanded",
        }
    }
}

/// One normalized accessibility-tree entry.
///
/// `id` is the position of the source node in the snapshot it came from and
/// means nothing in any other snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticNode {
    pub id: usize,
    pub role: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub states: BTreeSet<NodeState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// A single atomic UI action the backend can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentAction {
    Click,
    Type,
    Wait,
    Finalize,
}

impl AgentAction {
    /// Accepts both the English keywords and the Spanish ones used by the
    /// rules store prompts.
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword.trim().to_lowercase().as_str() {
            "click" | "clic" => Some(Self::Click),
            "type" | "escribir" => Some(Self::Type),
            "wait" | "esperar" => Some(Self::Wait),
            "finalize" | "finish" | "done" | "finalizar" => Some(Self::Finalize),
            _ => None,
        }
    }
}

impl fmt::Display for AgentAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Click => "click",
            Self::Type => "type",
            Self::Wait => "wait",
            Self::Finalize => "finalize",
        };
        f.write_str(s)
    }
}

/// What the backend decided for one iteration. Lives for exactly one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AgentDecision {
    pub thought: String,
    pub action: Option<AgentAction>,
    pub target_node_id: Option<usize>,
    pub target_text: Option<String>,
    pub value: Option<String>,
    pub objective_verified: bool,
}

impl AgentDecision {
    /// The decision returned whenever the backend fails in any way.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.action.is_none() && !self.objective_verified
    }

    pub fn is_terminal(&self) -> bool {
        self.objective_verified || self.action == Some(AgentAction::Finalize)
    }
}

/// Summary of an executed step kept in the loop history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub step: usize,
    pub action: AgentAction,
    pub target: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NavigationGoal {
    pub objective: String,
    pub history_tail: Vec<HistoryEntry>,
    pub current_url: String,
}

/// Vehicle attributes a filter rule can point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VehicleField {
    Brand,
    Model,
    Year,
}

/// A search filter from the external rules store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RuleRepr")]
pub struct FilterRule {
    pub field: String,
    pub operator: String,
    pub value: Value,
}

impl FilterRule {
    pub fn vehicle_field(&self) -> Option<VehicleField> {
        match self.field.trim().to_lowercase().as_str() {
            "marca" | "brand" | "make" => Some(VehicleField::Brand),
            "modelo" | "model" => Some(VehicleField::Model),
            "año" | "ano" | "anio" | "year" => Some(VehicleField::Year),
            _ => None,
        }
    }

    /// Rule value rendered for a prompt; strings lose their JSON quotes.
    pub fn value_text(&self) -> String {
        match &self.value {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

// The rules store nests the interesting bits under `parametros`.
#[derive(Deserialize)]
#[serde(untagged)]
enum RuleRepr {
    Stored {
        parametros: StoredParams,
    },
    Flat {
        field: String,
        #[serde(default)]
        operator: String,
        #[serde(default)]
        value: Value,
    },
}

#[derive(Deserialize)]
struct StoredParams {
    #[serde(default)]
    campo: String,
    #[serde(default)]
    operador: String,
    #[serde(default)]
    valor: Value,
}

impl From<RuleRepr> for FilterRule {
    fn from(repr: RuleRepr) -> Self {
        match repr {
            RuleRepr::Stored { parametros } => Self {
                field: parametros.campo,
                operator: parametros.operador,
                value: parametros.valor,
            },
            RuleRepr::Flat {
                field,
                operator,
                value,
            } => Self {
                field,
                operator,
                value,
            },
        }
    }
}

/// The vehicle being searched for on every source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetVehicle {
    #[serde(alias = "marca")]
    pub brand: String,
    #[serde(alias = "modelo")]
    pub model: String,
    #[serde(alias = "año", alias = "anio")]
    pub year: Option<u16>,
}

impl TargetVehicle {
    pub fn value_for(&self, field: VehicleField) -> Option<String> {
        let value = match field {
            VehicleField::Brand => self.brand.trim().to_string(),
            VehicleField::Model => self.model.trim().to_string(),
            VehicleField::Year => self.year.map(|y| y.to_string()).unwrap_or_default(),
        };
        (!value.is_empty()).then_some(value)
    }

    /// Lowercased brand, model and year; empty attributes are skipped.
    pub fn keywords(&self) -> Vec<String> {
        [VehicleField::Brand, VehicleField::Model, VehicleField::Year]
            .into_iter()
            .filter_map(|f| self.value_for(f))
            .map(|v| v.to_lowercase())
            .collect()
    }
}

/// A vehicle listing found on the final results page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingCandidate {
    pub title: String,
    pub url: String,
    pub provenance: String,
}

pub const DEFAULT_MAX_STEPS: usize = 10;
pub const HISTORY_WINDOW: usize = 3;
pub const MAX_INTERACTIVE_NODES: usize = 200;
