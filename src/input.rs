// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

//! Input dictionary and key bookkeeping.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;

use ndarray::{Array1, ArrayD, IxDyn};
use tracing::{info, warn};

use crate::error::{EikonalError, Result};

/// One value of the input dictionary.
#[derive(Debug, Clone, PartialEq)]
pub enum InputValue {
    /// Flag.
    Bool(bool),
    /// Scalar.
    Float(f64),
    /// Name.
    Str(String),
    /// Float array.
    Array(ArrayD<f64>),
    /// Boolean mask.
    Mask(ArrayD<bool>),
    /// List of names.
    List(Vec<String>),
}

impl InputValue {
    fn kind(&self) -> &'static str {
        match self {
            InputValue::Bool(_) => "bool",
            InputValue::Float(_) => "float",
            InputValue::Str(_) => "string",
            InputValue::Array(_) => "array",
            InputValue::Mask(_) => "mask",
            InputValue::List(_) => "list",
        }
    }
}

impl From<bool> for InputValue {
    fn from(v: bool) -> Self {
        InputValue::Bool(v)
    }
}

impl From<f64> for InputValue {
    fn from(v: f64) -> Self {
        InputValue::Float(v)
    }
}

impl From<&str> for InputValue {
    fn from(v: &str) -> Self {
        InputValue::Str(v.to_string())
    }
}

impl From<String> for InputValue {
    fn from(v: String) -> Self {
        InputValue::Str(v)
    }
}

impl From<ArrayD<f64>> for InputValue {
    fn from(v: ArrayD<f64>) -> Self {
        InputValue::Array(v)
    }
}

impl From<ArrayD<bool>> for InputValue {
    fn from(v: ArrayD<bool>) -> Self {
        InputValue::Mask(v)
    }
}

impl From<Vec<f64>> for InputValue {
    fn from(v: Vec<f64>) -> Self {
        InputValue::Array(Array1::from(v).into_dyn())
    }
}

impl From<Vec<String>> for InputValue {
    fn from(v: Vec<String>) -> Self {
        InputValue::List(v)
    }
}

/// Input dictionary of a run.
pub type HfmInput = BTreeMap<String, InputValue>;

/// Help text of the recognized keys.
const KEY_HELP: &[(&str, &str)] = &[
    ("arrayOrdering", "Array ordering convention, only RowMajor is supported"),
    ("verbosity", "Choose the amount of detail displayed on the run"),
    ("help", "List of keys for which to display help"),
    ("model", "Minimal path model to be solved"),
    ("dims", "Grid extents"),
    ("gridScale", "Grid spacing"),
    ("origin", "Physical position of the first grid node"),
    ("periodic", "Periodic axes"),
    ("cost", "Cost function, multiplies the metric"),
    ("speed", "Speed function, inverse of the cost"),
    ("metric", "Metric parameters, constant or one tuple per node"),
    ("seeds", "Points from which the front starts"),
    ("seedValues", "Initial time at the seeds"),
    ("seedValueVariation", "First order variation of the seed values"),
    ("costVariation", "First order variation of the cost"),
    ("seedRadius", "Spreading radius of the seeds, in pixels"),
    ("trigger", "Nodes from which the front starts, when there are no seeds"),
    ("values", "Initial values"),
    ("values_float64", "Export values using the float64 data type"),
    ("sensitivity", "Reverse automatic differentiation"),
    ("linear_rtol", "Relative convergence tolerance for the linear systems"),
    ("linear_atol", "Absolute convergence tolerance for the linear systems"),
    ("solver", "global_iteration or AGSI (adaptive Gauss-Seidel iteration)"),
    ("shape_i", "Shape of the blocks"),
    ("niter_i", "Number of sweeps per block update"),
    ("nitermax_o", "Maximum number of outer iterations"),
    ("tol", "Absolute convergence tolerance of the eikonal solver"),
    ("float_t", "Storage type of the values, float32 or float64"),
    ("multiprecision", "Store values as a float plus an integer residual"),
    ("multip_step", "Residual quantum, in units of gridScale times cost"),
    ("raiseOnNonConvergence", "Fail when the iteration budget is exhausted"),
    ("exportValues", "Export the value field"),
    ("exportGeodesicFlow", "Export the geodesic flow"),
];

/// Key usage of a run.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KeyReport {
    /// Keys read from the input.
    pub used: Vec<String>,
    /// Keys absent from the input, with the default that replaced them.
    pub defaulted: BTreeMap<String, String>,
    /// Keys looked up, present or not.
    pub visited: Vec<String>,
    /// Input keys never read.
    pub unused: Vec<String>,
    /// Help text shown for the keys listed in `help`.
    pub help: BTreeMap<String, String>,
}

/// Reads an [`HfmInput`] while recording which keys are used or defaulted.
pub struct RunContext<'a> {
    input: &'a HfmInput,
    verbosity: f64,
    help: BTreeSet<String>,
    keys: KeyReport,
    used: BTreeSet<String>,
    visited: BTreeSet<String>,
    warnings: Vec<String>,
}

impl<'a> RunContext<'a> {
    /// Start reading `input`. Reads `verbosity` and `help` first.
    pub fn new(input: &'a HfmInput) -> Result<Self> {
        let mut ctx = RunContext {
            input,
            verbosity: 1.0,
            help: BTreeSet::new(),
            keys: KeyReport::default(),
            used: BTreeSet::new(),
            visited: BTreeSet::new(),
            warnings: Vec::new(),
        };
        ctx.verbosity = ctx.float_or("verbosity", 1.0)?;
        let help = ctx.list_or("help", Vec::new())?;
        ctx.help = help.into_iter().collect();
        // Keys asked for before the help list was known.
        for key in ["verbosity", "help"] {
            ctx.show_help(key);
        }
        Ok(ctx)
    }

    /// Verbosity level.
    pub fn verbosity(&self) -> f64 {
        self.verbosity
    }

    fn show_help(&mut self, key: &str) {
        if !self.help.contains(key) || self.keys.help.contains_key(key) {
            return;
        }
        let text = KEY_HELP
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, h)| h.to_string())
            .unwrap_or_else(|| format!("Sorry : no help for key {}", key));
        if self.verbosity >= 1.0 {
            info!("---- Help for key {} ----\n{}", key, text);
        }
        self.keys.help.insert(key.to_string(), text);
    }

    fn lookup(&mut self, key: &str) -> Option<&'a InputValue> {
        if self.visited.insert(key.to_string()) {
            self.keys.visited.push(key.to_string());
        }
        self.show_help(key);
        let value = self.input.get(key);
        if value.is_some() && self.used.insert(key.to_string()) {
            self.keys.used.push(key.to_string());
        }
        value
    }

    /// Record that `key` took the default `rendered`.
    pub fn defaulted(&mut self, key: &str, rendered: impl Display) {
        let rendered = rendered.to_string();
        if self.verbosity >= 2.0 {
            info!("key {} defaults to {}", key, rendered);
        }
        self.keys.defaulted.insert(key.to_string(), rendered);
    }

    fn wrong_kind(key: &str, expected: &str, got: &InputValue) -> EikonalError {
        EikonalError::invalid(key, format!("expected {}, got {}", expected, got.kind()))
    }

    fn as_float(key: &str, value: &InputValue) -> Result<f64> {
        match value {
            InputValue::Float(x) => Ok(*x),
            InputValue::Array(a) if a.len() == 1 => Ok(a.iter().copied().next().unwrap_or(f64::NAN)),
            other => Err(Self::wrong_kind(key, "a number", other)),
        }
    }

    /// Number with a default.
    pub fn float_or(&mut self, key: &str, default: f64) -> Result<f64> {
        match self.lookup(key) {
            Some(v) => Self::as_float(key, v),
            None => {
                self.defaulted(key, default);
                Ok(default)
            }
        }
    }

    /// Optional number, `None` without recording a default.
    pub fn float_opt(&mut self, key: &str) -> Result<Option<f64>> {
        self.lookup(key).map(|v| Self::as_float(key, v)).transpose()
    }

    /// Non negative integer with a default.
    pub fn count_or(&mut self, key: &str, default: usize) -> Result<usize> {
        let x = self.float_or(key, default as f64)?;
        if x < 0.0 || x.fract() != 0.0 || !x.is_finite() {
            return Err(EikonalError::invalid(key, format!("{} is not a count", x)));
        }
        Ok(x as usize)
    }

    /// Flag with a default. Numbers are accepted, nonzero meaning true.
    pub fn bool_or(&mut self, key: &str, default: bool) -> Result<bool> {
        match self.lookup(key) {
            Some(InputValue::Bool(b)) => Ok(*b),
            Some(InputValue::Float(x)) => Ok(*x != 0.0),
            Some(other) => Err(Self::wrong_kind(key, "a flag", other)),
            None => {
                self.defaulted(key, default);
                Ok(default)
            }
        }
    }

    /// Required name.
    pub fn str(&mut self, key: &str) -> Result<String> {
        match self.lookup(key) {
            Some(InputValue::Str(s)) => Ok(s.clone()),
            Some(other) => Err(Self::wrong_kind(key, "a string", other)),
            None => Err(EikonalError::MissingKey(key.to_string())),
        }
    }

    /// Name with a default.
    pub fn str_or(&mut self, key: &str, default: &str) -> Result<String> {
        match self.lookup(key) {
            Some(InputValue::Str(s)) => Ok(s.clone()),
            Some(other) => Err(Self::wrong_kind(key, "a string", other)),
            None => {
                self.defaulted(key, default);
                Ok(default.to_string())
            }
        }
    }

    /// List of names with a default.
    pub fn list_or(&mut self, key: &str, default: Vec<String>) -> Result<Vec<String>> {
        match self.lookup(key) {
            Some(InputValue::List(l)) => Ok(l.clone()),
            Some(InputValue::Str(s)) => Ok(vec![s.clone()]),
            Some(other) => Err(Self::wrong_kind(key, "a list of names", other)),
            None => {
                self.defaulted(key, format!("{:?}", default));
                Ok(default)
            }
        }
    }

    /// Optional float array. A scalar is returned as a 0-dimensional array.
    pub fn array(&mut self, key: &str) -> Result<Option<ArrayD<f64>>> {
        match self.lookup(key) {
            Some(InputValue::Array(a)) => Ok(Some(a.as_standard_layout().into_owned())),
            Some(InputValue::Float(x)) => Ok(Some(ArrayD::from_elem(IxDyn(&[]), *x))),
            Some(InputValue::Mask(m)) => Ok(Some(m.mapv(|b| if b { 1.0 } else { 0.0 }))),
            Some(other) => Err(Self::wrong_kind(key, "an array", other)),
            None => Ok(None),
        }
    }

    /// Required float array.
    pub fn array_required(&mut self, key: &str) -> Result<ArrayD<f64>> {
        self.array(key)?
            .ok_or_else(|| EikonalError::MissingKey(key.to_string()))
    }

    /// Optional boolean mask. Float arrays are accepted, nonzero meaning true.
    pub fn mask(&mut self, key: &str) -> Result<Option<ArrayD<bool>>> {
        match self.lookup(key) {
            Some(InputValue::Mask(m)) => Ok(Some(m.as_standard_layout().into_owned())),
            Some(InputValue::Array(a)) => Ok(Some(a.mapv(|x| x != 0.0))),
            Some(other) => Err(Self::wrong_kind(key, "a mask", other)),
            None => Ok(None),
        }
    }

    /// Log a warning and keep it for the report.
    pub fn warn(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        if self.verbosity >= -1.0 {
            warn!("---- Warning ----\n{}\n-----------------", msg);
        }
        self.warnings.push(msg);
    }

    /// Close the run: compute the unused keys, warning about them.
    pub fn finish(mut self) -> (KeyReport, Vec<String>) {
        let unused: Vec<String> = self
            .input
            .keys()
            .filter(|k| !self.used.contains(*k))
            .cloned()
            .collect();
        if !unused.is_empty() {
            self.warn(format!("Unused keys from user : {:?}", unused));
        }
        self.keys.unused = unused;
        (self.keys, self.warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(pairs: Vec<(&str, InputValue)>) -> HfmInput {
        pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn used_defaulted_and_unused() {
        let inp = input(vec![
            ("model", "Isotropic2".into()),
            ("tol", 1e-3.into()),
            ("typo", 1.0.into()),
        ]);
        let mut ctx = RunContext::new(&inp).unwrap();
        assert_eq!(ctx.str("model").unwrap(), "Isotropic2");
        assert_eq!(ctx.float_or("tol", 0.5).unwrap(), 1e-3);
        assert_eq!(ctx.float_or("gridScale", 1.0).unwrap(), 1.0);
        let (keys, warnings) = ctx.finish();
        assert_eq!(keys.used, vec!["model", "tol"]);
        assert_eq!(keys.defaulted.get("gridScale").map(String::as_str), Some("1"));
        assert!(keys.defaulted.contains_key("verbosity"));
        assert_eq!(keys.unused, vec!["typo"]);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("typo"));
    }

    #[test]
    fn missing_required_key() {
        let inp = HfmInput::new();
        let mut ctx = RunContext::new(&inp).unwrap();
        assert!(matches!(ctx.str("model"), Err(EikonalError::MissingKey(k)) if k == "model"));
        assert!(matches!(ctx.array_required("dims"), Err(EikonalError::MissingKey(_))));
    }

    #[test]
    fn wrong_kind_is_configuration_error() {
        let inp = input(vec![("tol", "small".into())]);
        let mut ctx = RunContext::new(&inp).unwrap();
        let err = ctx.float_or("tol", 1.0).unwrap_err();
        assert!(err.is_configuration());
        assert!(ctx.count_or("nitermax_o", 10).is_ok());
    }

    #[test]
    fn help_is_recorded() {
        let inp = input(vec![
            ("help", vec!["tol".to_string(), "nonsense".to_string()].into()),
            ("verbosity", 0.0.into()),
        ]);
        let mut ctx = RunContext::new(&inp).unwrap();
        ctx.float_or("tol", 1.0).unwrap();
        ctx.float_opt("nonsense").unwrap();
        let (keys, _) = ctx.finish();
        assert!(keys.help["tol"].contains("tolerance"));
        assert!(keys.help["nonsense"].starts_with("Sorry"));
        assert!(keys.unused.is_empty());
    }

    #[test]
    fn scalars_and_masks_as_arrays() {
        let inp = input(vec![
            ("cost", 2.0.into()),
            ("trigger", InputValue::Array(ArrayD::from_shape_vec(IxDyn(&[2]), vec![0.0, 3.0]).unwrap())),
        ]);
        let mut ctx = RunContext::new(&inp).unwrap();
        let cost = ctx.array("cost").unwrap().unwrap();
        assert_eq!(cost.ndim(), 0);
        let trigger = ctx.mask("trigger").unwrap().unwrap();
        assert_eq!(trigger.iter().copied().collect::<Vec<_>>(), vec![false, true]);
    }
}
