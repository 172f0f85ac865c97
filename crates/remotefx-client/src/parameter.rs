//! Remote plugin parameters.
//!
//! Values are stored normalized (0..1). Conversion to the natural range
//! happens only in [`Parameter::value`] / [`Parameter::set_value`].

use serde::{Deserialize, Serialize};

/// Wire value meaning "no step count declared".
pub const UNBOUNDED_STEPS: i32 = 0x7fff_ffff;

const NUMERIC_CHARS: &str = "0123456789-.";

/// Parameter category. Wire codes are `(group << 16) | index`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum ParameterCategory {
    #[default]
    Generic,
    InputGain,
    OutputGain,
    InputMeter,
    OutputMeter,
    CompressorLimiterGainReductionMeter,
    ExpanderGateGainReductionMeter,
    AnalysisMeter,
    OtherMeter,
}

impl From<i32> for ParameterCategory {
    fn from(code: i32) -> Self {
        match code {
            0x1_0000 => Self::InputGain,
            0x1_0001 => Self::OutputGain,
            0x2_0000 => Self::InputMeter,
            0x2_0001 => Self::OutputMeter,
            0x2_0002 => Self::CompressorLimiterGainReductionMeter,
            0x2_0003 => Self::ExpanderGateGainReductionMeter,
            0x2_0004 => Self::AnalysisMeter,
            0x2_0005 => Self::OtherMeter,
            _ => Self::Generic,
        }
    }
}

impl From<ParameterCategory> for i32 {
    fn from(category: ParameterCategory) -> Self {
        match category {
            ParameterCategory::Generic => 0,
            ParameterCategory::InputGain => 0x1_0000,
            ParameterCategory::OutputGain => 0x1_0001,
            ParameterCategory::InputMeter => 0x2_0000,
            ParameterCategory::OutputMeter => 0x2_0001,
            ParameterCategory::CompressorLimiterGainReductionMeter => 0x2_0002,
            ParameterCategory::ExpanderGateGainReductionMeter => 0x2_0003,
            ParameterCategory::AnalysisMeter => 0x2_0004,
            ParameterCategory::OtherMeter => 0x2_0005,
        }
    }
}

/// Natural value range of a parameter. `interval` of 0 means continuous.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterRange {
    pub start: f64,
    pub end: f64,
    pub interval: f64,
}

impl Default for ParameterRange {
    fn default() -> Self {
        Self {
            start: 0.0,
            end: 1.0,
            interval: 0.0,
        }
    }
}

impl ParameterRange {
    pub fn length(&self) -> f64 {
        self.end - self.start
    }

    pub fn convert_to_0to1(&self, value: f64) -> f64 {
        ((value - self.start) / self.length()).clamp(0.0, 1.0)
    }

    pub fn convert_from_0to1(&self, proportion: f64) -> f64 {
        self.start + self.length() * proportion.clamp(0.0, 1.0)
    }
}

/// Parameter document as carried in command payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterWire {
    pub idx: i32,
    pub name: String,
    #[serde(default)]
    pub default_value: f32,
    #[serde(default)]
    pub current_value: Option<f32>,
    #[serde(default)]
    pub category: ParameterCategory,
    #[serde(default)]
    pub label: String,
    #[serde(default = "unbounded_steps")]
    pub num_steps: i32,
    #[serde(default)]
    pub is_boolean: bool,
    #[serde(default)]
    pub is_discrete: bool,
    #[serde(default)]
    pub is_meta: bool,
    #[serde(default)]
    pub is_orient_inv: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<String>,
    #[serde(default)]
    pub all_values: Vec<String>,
    #[serde(default = "no_automation_slot")]
    pub automation_slot: i32,
}

fn unbounded_steps() -> i32 {
    UNBOUNDED_STEPS
}

fn no_automation_slot() -> i32 {
    -1
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub index: i32,
    pub name: String,
    pub category: ParameterCategory,
    pub label: String,
    /// Normalized.
    pub default_value: f32,
    /// Normalized.
    pub current_value: f32,
    pub num_steps: i32,
    pub is_boolean: bool,
    pub is_discrete: bool,
    pub is_meta: bool,
    pub is_orientation_inverted: bool,
    pub all_values: Vec<String>,
    pub automation_slot: Option<i32>,
    pub range: ParameterRange,
}

impl Default for Parameter {
    fn default() -> Self {
        Self {
            index: -1,
            name: String::new(),
            category: ParameterCategory::Generic,
            label: String::new(),
            default_value: 0.0,
            current_value: 0.0,
            num_steps: UNBOUNDED_STEPS,
            is_boolean: false,
            is_discrete: false,
            is_meta: false,
            is_orientation_inverted: false,
            all_values: Vec::new(),
            automation_slot: None,
            range: ParameterRange::default(),
        }
    }
}

/// Parses a range bound. Anything that is not a plain decimal number yields `None`.
fn parse_bound(raw: Option<&str>) -> Option<f64> {
    let raw = raw?.trim();
    if raw.is_empty() || !raw.chars().all(|c| NUMERIC_CHARS.contains(c)) {
        return None;
    }
    raw.parse::<f64>().ok().filter(|v| v.is_finite())
}

impl Parameter {
    pub fn new(index: i32, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn from_wire(wire: ParameterWire) -> Self {
        let mut range = ParameterRange::default();
        if let Some(start) = parse_bound(wire.min_value.as_deref()) {
            range.start = start;
        }
        if let Some(end) = parse_bound(wire.max_value.as_deref()) {
            range.end = end;
        }
        if range.start >= range.end {
            range.start = 0.0;
            range.end = 1.0;
        }

        let mut is_boolean = wire.is_boolean;
        let label_count = wire.all_values.len();
        if label_count > 2 {
            range.start = 0.0;
            range.end = (label_count - 1) as f64;
            range.interval = 1.0 / label_count as f64;
        } else if wire.is_discrete && wire.num_steps > 0 {
            range.interval = 1.0 / wire.num_steps as f64;
            if wire.num_steps == 2 {
                is_boolean = true;
            }
        }

        Self {
            index: wire.idx,
            name: wire.name,
            category: wire.category,
            label: wire.label,
            default_value: wire.default_value,
            current_value: wire.current_value.unwrap_or(wire.default_value),
            num_steps: wire.num_steps,
            is_boolean,
            is_discrete: wire.is_discrete,
            is_meta: wire.is_meta,
            is_orientation_inverted: wire.is_orient_inv,
            all_values: wire.all_values,
            automation_slot: (wire.automation_slot >= 0).then_some(wire.automation_slot),
            range,
        }
    }

    pub fn to_wire(&self) -> ParameterWire {
        ParameterWire {
            idx: self.index,
            name: self.name.clone(),
            default_value: self.default_value,
            current_value: Some(self.current_value),
            category: self.category,
            label: self.label.clone(),
            num_steps: self.num_steps,
            is_boolean: self.is_boolean,
            is_discrete: self.is_discrete,
            is_meta: self.is_meta,
            is_orient_inv: self.is_orientation_inverted,
            min_value: Some(self.range.start.to_string()),
            max_value: Some(self.range.end.to_string()),
            all_values: self.all_values.clone(),
            automation_slot: self.automation_slot.unwrap_or(-1),
        }
    }

    /// Current value in natural units.
    pub fn value(&self) -> f32 {
        self.range.convert_from_0to1(self.current_value as f64) as f32
    }

    /// Sets the current value from natural units.
    pub fn set_value(&mut self, value: f32) {
        self.current_value = self.range.convert_to_0to1(value as f64) as f32;
    }

    /// Display label for the current value of an enumerated parameter.
    pub fn value_label(&self) -> Option<&str> {
        if self.all_values.is_empty() {
            return None;
        }
        let last = self.all_values.len() - 1;
        let pos = (self.current_value as f64 * last as f64).round() as usize;
        self.all_values.get(pos.min(last)).map(String::as_str)
    }
}
