//! Declarative step predicates and their interpreter.
//!
//! A predicate compares a looked-up field (or a rolling aggregate of one)
//! against an operand. Unresolvable fields evaluate to false.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

use super::oi::OiWallModel;
use crate::events::Fields;

const EQ_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = "gt", alias = ">")]
    Gt,
    #[serde(rename = "ge", alias = ">=")]
    Ge,
    #[serde(rename = "lt", alias = "<")]
    Lt,
    #[serde(rename = "le", alias = "<=")]
    Le,
    #[serde(rename = "eq", alias = "==")]
    Eq,
    #[serde(rename = "ne", alias = "!=")]
    Ne,
}

impl Comparator {
    pub fn apply(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Comparator::Gt => lhs > rhs,
            Comparator::Ge => lhs >= rhs,
            Comparator::Lt => lhs < rhs,
            Comparator::Le => lhs <= rhs,
            Comparator::Eq => (lhs - rhs).abs() <= EQ_EPSILON,
            Comparator::Ne => (lhs - rhs).abs() > EQ_EPSILON,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Mean,
    Sum,
    Min,
    Max,
}

impl Aggregation {
    pub fn apply<'a>(self, values: impl Iterator<Item = &'a f64>) -> Option<f64> {
        let mut n = 0usize;
        let mut acc: Option<f64> = None;
        for &v in values {
            n += 1;
            acc = Some(match (self, acc) {
                (_, None) => v,
                (Aggregation::Mean | Aggregation::Sum, Some(a)) => a + v,
                (Aggregation::Min, Some(a)) => a.min(v),
                (Aggregation::Max, Some(a)) => a.max(v),
            });
        }
        match self {
            Aggregation::Mean => acc.map(|sum| sum / n as f64),
            _ => acc,
        }
    }
}

/// Right-hand side of a comparison, or a captured value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Operand {
    Const(f64),
    Window { field: String, agg: Aggregation, window: usize },
    Field { field: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Predicate {
    Threshold { field: String, op: Comparator, value: Operand },
    Window { field: String, agg: Aggregation, window: usize, op: Comparator, value: Operand },
    All { of: Vec<Predicate> },
    Any { of: Vec<Predicate> },
}

impl Predicate {
    pub fn evaluate(&self, ctx: &EvalContext<'_>) -> bool {
        match self {
            Predicate::Threshold { field, op, value } => match (ctx.scope.lookup(field), ctx.resolve(value)) {
                (Some(lhs), Some(rhs)) => op.apply(lhs, rhs),
                _ => false,
            },
            Predicate::Window { field, agg, window, op, value } => {
                match (ctx.history.aggregate(field, *agg, *window), ctx.resolve(value)) {
                    (Some(lhs), Some(rhs)) => op.apply(lhs, rhs),
                    _ => false,
                }
            }
            Predicate::All { of } => of.iter().all(|p| p.evaluate(ctx)),
            Predicate::Any { of } => of.iter().any(|p| p.evaluate(ctx)),
        }
    }

    /// Field names this predicate reads directly (not aggregated).
    pub fn referenced_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Predicate::Threshold { field, value, .. } => {
                out.push(field);
                if let Operand::Field { field } = value {
                    out.push(field);
                }
            }
            Predicate::Window { value, .. } => {
                if let Operand::Field { field } = value {
                    out.push(field);
                }
            }
            Predicate::All { of } | Predicate::Any { of } => {
                for p in of {
                    p.referenced_fields(out);
                }
            }
        }
    }

    /// Deepest window needed per field.
    pub fn window_depths(&self, out: &mut BTreeMap<String, usize>) {
        match self {
            Predicate::Threshold { value, .. } => value.window_depths(out),
            Predicate::Window { field, window, value, .. } => {
                bump(out, field, *window);
                value.window_depths(out);
            }
            Predicate::All { of } | Predicate::Any { of } => {
                for p in of {
                    p.window_depths(out);
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            Predicate::Threshold { value, .. } => value.validate(),
            Predicate::Window { window, value, field, .. } => {
                if *window == 0 {
                    return Err(format!("window over {} must be > 0", field));
                }
                value.validate()
            }
            Predicate::All { of } | Predicate::Any { of } => {
                if of.is_empty() {
                    return Err("empty predicate group".to_string());
                }
                of.iter().try_for_each(|p| p.validate())
            }
        }
    }
}

impl Operand {
    pub fn window_depths(&self, out: &mut BTreeMap<String, usize>) {
        if let Operand::Window { field, window, .. } = self {
            bump(out, field, *window);
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            Operand::Window { window: 0, field, .. } => Err(format!("window over {} must be > 0", field)),
            Operand::Const(c) if !c.is_finite() => Err("non-finite constant".to_string()),
            _ => Ok(()),
        }
    }
}

fn bump(out: &mut BTreeMap<String, usize>, field: &str, window: usize) {
    let depth = out.entry(field.to_string()).or_insert(0);
    *depth = (*depth).max(window);
}

/// Everything a predicate can look up for one event.
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    pub fields: &'a Fields,
    pub vars: &'a Fields,
    pub screener: &'a Fields,
    pub oi: Option<&'a OiWallModel>,
}

impl<'a> Scope<'a> {
    /// Event fields first, then the `vars.`, `screener.` and `oi.` namespaces.
    pub fn lookup(&self, name: &str) -> Option<f64> {
        if let Some(v) = self.fields.get(name) {
            return Some(*v);
        }
        let (ns, key) = name.split_once('.')?;
        match ns {
            "vars" => self.vars.get(key).copied(),
            "screener" => self.screener.get(key).copied(),
            "oi" => self.oi.and_then(|m| m.field(key)),
            _ => None,
        }
    }
}

pub struct EvalContext<'a> {
    pub scope: Scope<'a>,
    pub history: &'a FieldHistory,
}

impl<'a> EvalContext<'a> {
    pub fn resolve(&self, operand: &Operand) -> Option<f64> {
        match operand {
            Operand::Const(c) => Some(*c),
            Operand::Field { field } => self.scope.lookup(field),
            Operand::Window { field, agg, window } => self.history.aggregate(field, *agg, *window),
        }
    }
}

/// Rolling per-field samples, bounded by the deepest window that reads them.
#[derive(Debug, Clone, Default)]
pub struct FieldHistory {
    depths: BTreeMap<String, usize>,
    samples: BTreeMap<String, VecDeque<f64>>,
}

impl FieldHistory {
    pub fn new(depths: BTreeMap<String, usize>) -> Self {
        Self { depths, samples: BTreeMap::new() }
    }

    /// Sample every tracked field resolvable in `scope`.
    pub fn record(&mut self, scope: &Scope<'_>) {
        for (field, depth) in &self.depths {
            let Some(value) = scope.lookup(field) else { continue };
            let buf = self.samples.entry(field.clone()).or_default();
            buf.push_back(value);
            while buf.len() > *depth {
                buf.pop_front();
            }
        }
    }

    /// Aggregate of the last `window` samples; `None` until that many exist.
    pub fn aggregate(&self, field: &str, agg: Aggregation, window: usize) -> Option<f64> {
        let buf = self.samples.get(field)?;
        if window == 0 || buf.len() < window {
            return None;
        }
        agg.apply(buf.iter().skip(buf.len() - window))
    }

    pub fn len(&self, field: &str) -> usize {
        self.samples.get(field).map_or(0, |b| b.len())
    }
}
