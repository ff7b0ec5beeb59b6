//! Processing labels and the label registry.
//!
//! A processing label is a named, typed and parameterised transformation step. Labels
//! are registered once under a name; a pipeline is then an ordered list of label names
//! that the registry resolves into full [`ProcessingLabel`] values. The resolved values,
//! not the names, are what the fingerprint covers, so redefining a label under an
//! existing name yields new cache identities.

use crate::error::{AppResult, TsError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

/// Closed set of supported label types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelType {
    /// Zero-phase Butterworth lowpass: `fc`, `N`
    LowpassFilter,
    /// Zero-phase Butterworth highpass: `fc`, `N`
    HighpassFilter,
    /// Zero-phase Butterworth bandpass: `fcs`, `fce`, `N`
    BandpassFilter,
    /// Cosine taper: `flag` selects the ends, `m` the tapered samples
    Taper,
    /// Multiply every sample by `factor`
    Scale,
    /// Rotate the horizontal pair by `angle` degrees
    Rotate,
    /// One time integration
    Integrate,
    /// One time differentiation
    Differentiate,
}

impl LabelType {
    /// All supported label types, in display order.
    pub const ALL: [LabelType; 8] = [
        LabelType::LowpassFilter,
        LabelType::HighpassFilter,
        LabelType::BandpassFilter,
        LabelType::Taper,
        LabelType::Scale,
        LabelType::Rotate,
        LabelType::Integrate,
        LabelType::Differentiate,
    ];

    /// Stable textual name, also used in the fingerprint.
    pub fn as_str(&self) -> &'static str {
        match self {
            LabelType::LowpassFilter => "lowpass_filter",
            LabelType::HighpassFilter => "highpass_filter",
            LabelType::BandpassFilter => "bandpass_filter",
            LabelType::Taper => "taper",
            LabelType::Scale => "scale",
            LabelType::Rotate => "rotate",
            LabelType::Integrate => "integrate",
            LabelType::Differentiate => "differentiate",
        }
    }

    /// Hyperparameter names in canonical order.
    pub fn parameter_names(&self) -> &'static [&'static str] {
        match self {
            LabelType::LowpassFilter | LabelType::HighpassFilter => &["fc", "N"],
            LabelType::BandpassFilter => &["fcs", "fce", "N"],
            LabelType::Taper => &["flag", "m"],
            LabelType::Scale => &["factor"],
            LabelType::Rotate => &["angle"],
            LabelType::Integrate | LabelType::Differentiate => &[],
        }
    }

    /// Parse a label type from its textual name.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == name)
    }
}

impl fmt::Display for LabelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully resolved processing step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingLabel {
    /// Name the label was registered under
    pub name: String,
    /// Transformation applied
    pub label_type: LabelType,
    /// Hyperparameters in the canonical order of `label_type.parameter_names()`
    pub hyperparameters: Vec<(String, f64)>,
}

impl ProcessingLabel {
    /// Build and validate a label.
    ///
    /// Hyperparameters may be given in any order; they are stored in canonical order.
    /// Unknown, missing or out-of-range parameters are rejected.
    pub fn new<I, K>(name: &str, label_type: LabelType, hyperparameters: I) -> AppResult<Self>
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        let invalid = |reason: String| TsError::InvalidLabel {
            label: name.to_string(),
            reason,
        };

        if name.trim().is_empty() {
            return Err(invalid("label name cannot be empty".to_string()));
        }

        let mut given: BTreeMap<String, f64> = BTreeMap::new();
        for (key, value) in hyperparameters {
            let key = key.into();
            if given.insert(key.clone(), value).is_some() {
                return Err(invalid(format!("hyperparameter '{}' given twice", key)));
            }
        }

        let expected = label_type.parameter_names();
        if let Some(unknown) = given.keys().find(|k| !expected.contains(&k.as_str())) {
            return Err(invalid(format!(
                "unknown hyperparameter '{}' for {} (expected: [{}])",
                unknown,
                label_type,
                expected.join(", ")
            )));
        }

        let mut ordered = Vec::with_capacity(expected.len());
        for key in expected {
            let value = given
                .get(*key)
                .copied()
                .ok_or_else(|| invalid(format!("missing hyperparameter '{}'", key)))?;
            if !value.is_finite() {
                return Err(invalid(format!("hyperparameter '{}' must be finite", key)));
            }
            ordered.push(((*key).to_string(), value));
        }

        let label = Self {
            name: name.to_string(),
            label_type,
            hyperparameters: ordered,
        };
        label.check_ranges().map_err(invalid)?;
        Ok(label)
    }

    /// Look up a hyperparameter by name.
    pub fn param(&self, key: &str) -> Option<f64> {
        self.hyperparameters
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| *v)
    }

    fn check_ranges(&self) -> Result<(), String> {
        let p = |key: &str| self.param(key).unwrap_or(f64::NAN);
        let check_order = |n: f64| {
            if n < 2.0 || n.fract() != 0.0 || (n as u32) % 2 != 0 {
                Err(format!("filter order N must be a positive even integer, got {}", n))
            } else {
                Ok(())
            }
        };

        match self.label_type {
            LabelType::LowpassFilter | LabelType::HighpassFilter => {
                if p("fc") <= 0.0 {
                    return Err(format!("cutoff fc must be positive, got {}", p("fc")));
                }
                check_order(p("N"))
            }
            LabelType::BandpassFilter => {
                if p("fcs") <= 0.0 || p("fce") <= p("fcs") {
                    return Err(format!(
                        "bandpass requires 0 < fcs < fce, got fcs={} fce={}",
                        p("fcs"),
                        p("fce")
                    ));
                }
                check_order(p("N"))
            }
            LabelType::Taper => {
                let flag = p("flag");
                if ![0.0, 1.0, 2.0].contains(&flag) {
                    return Err(format!("taper flag must be 0, 1 or 2, got {}", flag));
                }
                let m = p("m");
                if m <= 0.0 || m > 0.5 {
                    return Err(format!("taper fraction m must be in (0, 0.5], got {}", m));
                }
                Ok(())
            }
            LabelType::Scale
            | LabelType::Rotate
            | LabelType::Integrate
            | LabelType::Differentiate => Ok(()),
        }
    }
}

impl fmt::Display for ProcessingLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}", self.name, self.label_type)?;
        for (key, value) in &self.hyperparameters {
            write!(f, ", {}={}", key, value)?;
        }
        write!(f, ")")
    }
}

/// Registry of named processing labels.
#[derive(Debug, Default, Clone)]
pub struct LabelRegistry {
    labels: BTreeMap<String, ProcessingLabel>,
}

impl LabelRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a label under `name`, replacing any previous definition.
    pub fn add<I, K>(&mut self, name: &str, label_type: LabelType, hyperparameters: I) -> AppResult<()>
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        let label = ProcessingLabel::new(name, label_type, hyperparameters)?;
        if let Some(previous) = self.labels.insert(name.to_string(), label) {
            warn!(label = %name, previous = %previous, "Processing label redefined");
        }
        Ok(())
    }

    /// Look up a single label.
    pub fn get(&self, name: &str) -> Option<&ProcessingLabel> {
        self.labels.get(name)
    }

    /// Whether a label is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.labels.contains_key(name)
    }

    /// Resolve a pipeline of label names into owned label definitions.
    ///
    /// The returned vector is a snapshot: later redefinitions do not affect it.
    pub fn resolve_pipeline<S: AsRef<str>>(&self, names: &[S]) -> AppResult<Vec<ProcessingLabel>> {
        names
            .iter()
            .map(|name| {
                self.labels
                    .get(name.as_ref())
                    .cloned()
                    .ok_or_else(|| TsError::UnregisteredLabel(name.as_ref().to_string()))
            })
            .collect()
    }

    /// All registered labels, sorted by name.
    pub fn list_labels(&self) -> Vec<&ProcessingLabel> {
        self.labels.values().collect()
    }

    /// Supported label types with their hyperparameter names.
    pub fn valid_label_types() -> Vec<(LabelType, &'static [&'static str])> {
        LabelType::ALL
            .iter()
            .map(|t| (*t, t.parameter_names()))
            .collect()
    }
}
