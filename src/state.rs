//! Attribute values and the state maps exchanged with devices.
//!
//! A device exposes a fixed set of named attributes. Each attribute is
//! declared once through an [`AttributeSpec`], and the order of declaration
//! is the order in which writes are issued to hardware.

use crate::error::{DeviceError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::ramp::RampConfig;

/// A single attribute value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// On/off attribute such as an RF output gate.
    Flag(bool),
    /// Numeric attribute in the attribute's units.
    Number(f64),
}

impl Value {
    /// Numeric view of the value, `None` for flags.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(v) => Some(*v),
            Value::Flag(_) => None,
        }
    }

    /// Boolean view of the value, `None` for numbers.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Flag(b) => Some(*b),
            Value::Number(_) => None,
        }
    }

    /// Whether two values differ by more than `tolerance`.
    ///
    /// Flags differ when unequal. Values of different kinds always differ.
    pub fn differs(&self, other: &Value, tolerance: f64) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => (a - b).abs() > tolerance,
            (Value::Flag(a), Value::Flag(b)) => a != b,
            _ => true,
        }
    }

    /// Parse a command-line style value: `true`/`false`/`on`/`off` or a number.
    pub fn parse(text: &str) -> Option<Value> {
        match text.trim().to_ascii_lowercase().as_str() {
            "true" | "on" => Some(Value::Flag(true)),
            "false" | "off" => Some(Value::Flag(false)),
            other => other.parse::<f64>().ok().map(Value::Number),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Flag(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(v) => write!(f, "{}", v),
            Value::Flag(b) => write!(f, "{}", b),
        }
    }
}

/// Attribute name -> value. Used for observed and front-panel state.
pub type StateMap = BTreeMap<String, Value>;

/// Target values for a run.
///
/// Built once before the run starts; there is no way to mutate it afterwards.
/// Cloning shares the underlying map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DesiredState {
    values: Arc<StateMap>,
}

impl DesiredState {
    /// Freeze a map of target values.
    pub fn new(values: StateMap) -> Self {
        Self {
            values: Arc::new(values),
        }
    }

    /// Target value of `attribute`, if the run sets it.
    pub fn get(&self, attribute: &str) -> Option<&Value> {
        self.values.get(attribute)
    }

    /// Whether the run sets `attribute`.
    pub fn contains(&self, attribute: &str) -> bool {
        self.values.contains_key(attribute)
    }

    /// Number of target values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no target value is set.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Target values in attribute-name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// Read-only view of the frozen map.
    pub fn as_map(&self) -> &StateMap {
        &self.values
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for DesiredState {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::new(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl<'de> Deserialize<'de> for DesiredState {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        StateMap::deserialize(deserializer).map(Self::new)
    }
}

impl Serialize for DesiredState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.values.serialize(serializer)
    }
}

/// Kind of value an attribute holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Takes [`Value::Number`].
    Number,
    /// Takes [`Value::Flag`].
    Flag,
}

/// Declaration of one device attribute.
#[derive(Debug, Clone)]
pub struct AttributeSpec {
    /// Name used in desired states and on the front panel.
    pub name: String,
    /// Kind of value accepted.
    pub kind: ValueKind,
    /// Differences up to this amount are treated as "already there".
    pub tolerance: f64,
    /// Inclusive `(min, max)` accepted for desired values.
    pub limits: Option<(f64, f64)>,
    /// Move in bounded steps instead of a single jump.
    pub ramp: Option<RampConfig>,
    /// Unit label shown next to the value.
    pub units: &'static str,
}

impl AttributeSpec {
    /// Numeric attribute with the given tolerance.
    pub fn number(name: impl Into<String>, tolerance: f64) -> Self {
        Self {
            name: name.into(),
            kind: ValueKind::Number,
            tolerance,
            limits: None,
            ramp: None,
            units: "",
        }
    }

    /// Boolean attribute.
    pub fn flag(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ValueKind::Flag,
            tolerance: 0.0,
            limits: None,
            ramp: None,
            units: "",
        }
    }

    /// Accept only desired numbers within `min..=max`.
    pub fn with_limits(mut self, min: f64, max: f64) -> Self {
        self.limits = Some((min, max));
        self
    }

    /// Step towards new values instead of jumping.
    pub fn with_ramp(mut self, ramp: Option<RampConfig>) -> Self {
        self.ramp = ramp;
        self
    }

    /// Set the unit label.
    pub fn with_units(mut self, units: &'static str) -> Self {
        self.units = units;
        self
    }

    /// Check a desired value against kind and limits.
    pub fn validate(&self, value: &Value) -> Result<()> {
        match (self.kind, value) {
            (ValueKind::Number, Value::Number(v)) => {
                if !v.is_finite() {
                    return Err(DeviceError::OutOfRange {
                        attribute: self.name.clone(),
                        value: *v,
                        min: self.limits.map_or(f64::MIN, |l| l.0),
                        max: self.limits.map_or(f64::MAX, |l| l.1),
                    });
                }
                if let Some((min, max)) = self.limits {
                    if *v < min || *v > max {
                        return Err(DeviceError::OutOfRange {
                            attribute: self.name.clone(),
                            value: *v,
                            min,
                            max,
                        });
                    }
                }
                Ok(())
            }
            (ValueKind::Flag, Value::Flag(_)) => Ok(()),
            (ValueKind::Number, _) => Err(DeviceError::TypeMismatch {
                attribute: self.name.clone(),
                expected: "numeric",
            }),
            (ValueKind::Flag, _) => Err(DeviceError::TypeMismatch {
                attribute: self.name.clone(),
                expected: "boolean",
            }),
        }
    }
}
