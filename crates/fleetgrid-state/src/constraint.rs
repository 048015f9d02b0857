//! Typed constraint expressions.
//!
//! Interpolations such as `${attr.kernel.name}` are parsed into [`Target`]
//! when a job is deserialized, so the placement engine only ever compares
//! resolved values against a typed AST.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Node;

/// Errors produced while parsing constraint expressions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConstraintError {
    #[error("unknown interpolation target: {0}")]
    UnknownTarget(String),

    #[error("malformed interpolation: {0}")]
    Malformed(String),
}

/// A node field addressable through `${node.*}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeField {
    UniqueId,
    UniqueName,
    Datacenter,
    Class,
}

/// One side of a constraint, affinity, or spread.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Target {
    /// A plain value, compared verbatim.
    Literal(String),
    /// `${attr.<key>}`: a fingerprinted node attribute.
    Attr(String),
    /// `${meta.<key>}`: operator-supplied node metadata.
    Meta(String),
    /// `${node.<field>}`.
    Node(NodeField),
}

impl Default for Target {
    fn default() -> Self {
        Target::Literal(String::new())
    }
}

impl Target {
    pub fn literal(value: impl Into<String>) -> Self {
        Target::Literal(value.into())
    }

    pub fn attr(key: impl Into<String>) -> Self {
        Target::Attr(key.into())
    }

    pub fn meta(key: impl Into<String>) -> Self {
        Target::Meta(key.into())
    }

    /// Parse a raw expression.
    pub fn parse(raw: &str) -> Result<Self, ConstraintError> {
        let Some(inner) = raw.strip_prefix("${").and_then(|r| r.strip_suffix('}')) else {
            if raw.contains("${") {
                return Err(ConstraintError::Malformed(raw.to_string()));
            }
            return Ok(Target::Literal(raw.to_string()));
        };

        if inner.is_empty() || inner.contains("${") || inner.contains('}') {
            return Err(ConstraintError::Malformed(raw.to_string()));
        }

        if let Some(key) = inner.strip_prefix("attr.") {
            return Ok(Target::Attr(key.to_string()));
        }
        if let Some(key) = inner.strip_prefix("meta.") {
            return Ok(Target::Meta(key.to_string()));
        }
        match inner {
            "node.unique.id" => Ok(Target::Node(NodeField::UniqueId)),
            "node.unique.name" => Ok(Target::Node(NodeField::UniqueName)),
            "node.datacenter" => Ok(Target::Node(NodeField::Datacenter)),
            "node.class" => Ok(Target::Node(NodeField::Class)),
            _ => Err(ConstraintError::UnknownTarget(raw.to_string())),
        }
    }

    /// Resolve the target against a node. Literals always resolve.
    pub fn resolve<'a>(&'a self, node: &'a Node) -> Option<&'a str> {
        match self {
            Target::Literal(v) => Some(v.as_str()),
            Target::Attr(key) => node.attributes.get(key).map(String::as_str),
            Target::Meta(key) => node.meta.get(key).map(String::as_str),
            Target::Node(NodeField::UniqueId) => Some(node.id.as_str()),
            Target::Node(NodeField::UniqueName) => Some(node.name.as_str()),
            Target::Node(NodeField::Datacenter) => Some(node.datacenter.as_str()),
            Target::Node(NodeField::Class) => Some(node.node_class.as_str()),
        }
    }

    /// Whether the value is unique per node, which defeats class-level caching.
    pub fn is_unique(&self) -> bool {
        match self {
            Target::Literal(_) => false,
            Target::Attr(key) | Target::Meta(key) => key.starts_with("unique."),
            Target::Node(field) => matches!(field, NodeField::UniqueId | NodeField::UniqueName),
        }
    }
}

impl TryFrom<String> for Target {
    type Error = ConstraintError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Target::parse(&raw)
    }
}

impl From<Target> for String {
    fn from(target: Target) -> String {
        target.to_string()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Literal(v) => f.write_str(v),
            Target::Attr(key) => write!(f, "${{attr.{key}}}"),
            Target::Meta(key) => write!(f, "${{meta.{key}}}"),
            Target::Node(NodeField::UniqueId) => f.write_str("${node.unique.id}"),
            Target::Node(NodeField::UniqueName) => f.write_str("${node.unique.name}"),
            Target::Node(NodeField::Datacenter) => f.write_str("${node.datacenter}"),
            Target::Node(NodeField::Class) => f.write_str("${node.class}"),
        }
    }
}

/// Comparison operator of a constraint or affinity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operand {
    #[serde(rename = "=", alias = "==", alias = "is")]
    Equal,
    #[serde(rename = "!=", alias = "not")]
    NotEqual,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    /// Lenient version requirement; missing minor/patch components are zero.
    #[serde(rename = "version")]
    Version,
    /// Strict semantic-versioning requirement.
    #[serde(rename = "semver")]
    Semver,
    #[serde(rename = "regexp")]
    Regexp,
    #[serde(rename = "set_contains", alias = "set_contains_all")]
    SetContainsAll,
    #[serde(rename = "set_contains_any")]
    SetContainsAny,
    #[serde(rename = "is_set")]
    IsSet,
    #[serde(rename = "is_not_set")]
    IsNotSet,
    /// No two allocations of the job (or group) on the same node.
    #[serde(rename = "distinct_hosts")]
    DistinctHosts,
    /// At most `rtarget` (default 1) allocations per value of `ltarget`.
    #[serde(rename = "distinct_property")]
    DistinctProperty,
}

impl Operand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operand::Equal => "=",
            Operand::NotEqual => "!=",
            Operand::Lt => "<",
            Operand::Lte => "<=",
            Operand::Gt => ">",
            Operand::Gte => ">=",
            Operand::Version => "version",
            Operand::Semver => "semver",
            Operand::Regexp => "regexp",
            Operand::SetContainsAll => "set_contains",
            Operand::SetContainsAny => "set_contains_any",
            Operand::IsSet => "is_set",
            Operand::IsNotSet => "is_not_set",
            Operand::DistinctHosts => "distinct_hosts",
            Operand::DistinctProperty => "distinct_property",
        }
    }

    /// Operands that depend on the allocations proposed so far rather than
    /// on the node alone.
    pub fn is_placement_scoped(&self) -> bool {
        matches!(self, Operand::DistinctHosts | Operand::DistinctProperty)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A hard placement requirement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Constraint {
    #[serde(default)]
    pub ltarget: Target,
    pub operand: Operand,
    #[serde(default)]
    pub rtarget: Target,
}

impl Constraint {
    pub fn new(ltarget: Target, operand: Operand, rtarget: Target) -> Self {
        Self {
            ltarget,
            operand,
            rtarget,
        }
    }

    /// Whether feasibility of this constraint varies between nodes of the
    /// same computed class.
    pub fn is_unique(&self) -> bool {
        self.ltarget.is_unique() || self.rtarget.is_unique()
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.ltarget, self.operand, self.rtarget)
    }
}

/// A soft placement preference with a signed weight in `-100..=100`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Affinity {
    #[serde(default)]
    pub ltarget: Target,
    pub operand: Operand,
    #[serde(default)]
    pub rtarget: Target,
    pub weight: i8,
}

impl Affinity {
    pub fn new(ltarget: Target, operand: Operand, rtarget: Target, weight: i8) -> Self {
        Self {
            ltarget,
            operand,
            rtarget,
            weight,
        }
    }

    pub fn as_constraint(&self) -> Constraint {
        Constraint::new(self.ltarget.clone(), self.operand, self.rtarget.clone())
    }
}

/// Preference to distribute a group's allocations over the values of a node
/// attribute, optionally with explicit per-value shares.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Spread {
    pub attribute: Target,
    #[serde(default = "default_spread_weight")]
    pub weight: u8,
    #[serde(default)]
    pub targets: Vec<SpreadTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpreadTarget {
    pub value: String,
    pub percent: u8,
}

fn default_spread_weight() -> u8 {
    50
}
