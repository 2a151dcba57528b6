use serde::Serialize;
use std::sync::Arc;

use super::oi::OiWallModel;
use super::predicate::{EvalContext, FieldHistory, Scope};
use super::{PatternDefinition, Step};
use crate::events::{Fields, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MachineStatus {
    Active,
    Satisfied,
    Expired,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Current step not met; still waiting.
    Pending,
    /// Step passed; now waiting on `next_step`.
    Advanced { next_step: usize },
    /// Final step passed.
    Satisfied,
    /// No progress within the staleness window or the step's timeout.
    Expired,
    /// Timestamp older than one already seen; event not evaluated.
    OutOfOrder { last: Timestamp },
    /// Machine is not active, or its definition has no step to evaluate.
    Ignored,
}

/// One symbol's progress through a pattern definition.
#[derive(Debug, Clone)]
pub struct PatternStateMachine {
    pub symbol: String,
    pub current_step_index: usize,
    pub accumulated_evidence: Fields,
    /// Time of creation or of the last step that passed.
    pub last_event_at: Timestamp,
    pub status: MachineStatus,
    definition: Arc<PatternDefinition>,
    last_seen_at: Option<Timestamp>,
    /// Failed evaluations of the current step.
    step_failures: u32,
    history: FieldHistory,
}

impl PatternStateMachine {
    pub fn new(symbol: impl Into<String>, definition: Arc<PatternDefinition>, created_at: Timestamp) -> Self {
        let history = FieldHistory::new(definition.window_depths());
        Self {
            symbol: symbol.into(),
            current_step_index: 0,
            accumulated_evidence: Fields::new(),
            last_event_at: created_at,
            status: MachineStatus::Active,
            definition,
            last_seen_at: None,
            step_failures: 0,
            history,
        }
    }

    pub fn step_definitions(&self) -> &[Step] {
        &self.definition.steps
    }

    pub fn pattern_id(&self) -> &str {
        &self.definition.pattern_id
    }

    pub fn is_stale(&self, now: Timestamp, staleness_ms: u64) -> bool {
        now.saturating_sub(self.last_event_at) > staleness_ms
    }

    /// Back to step 0 with fresh evidence. Rolling history is kept.
    pub fn rearm(&mut self, at: Timestamp) {
        self.current_step_index = 0;
        self.accumulated_evidence.clear();
        self.status = MachineStatus::Active;
        self.last_event_at = at;
        self.step_failures = 0;
    }

    pub fn expire(&mut self) {
        self.status = MachineStatus::Expired;
    }

    pub fn on_event(
        &mut self,
        fields: &Fields,
        screener: &Fields,
        oi: Option<&OiWallModel>,
        timestamp: Timestamp,
        staleness_ms: u64,
    ) -> StepOutcome {
        if self.status != MachineStatus::Active {
            return StepOutcome::Ignored;
        }
        let definition = Arc::clone(&self.definition);
        let Some(step) = definition.steps.get(self.current_step_index) else {
            return StepOutcome::Ignored;
        };
        if let Some(last) = self.last_seen_at {
            if timestamp < last {
                return StepOutcome::OutOfOrder { last };
            }
        }
        self.last_seen_at = Some(timestamp);

        let passed = {
            let scope = Scope { fields, vars: &self.accumulated_evidence, screener, oi };
            self.history.record(&scope);
            let ctx = EvalContext { scope, history: &self.history };
            if step.when.evaluate(&ctx) {
                let mut evidence: Vec<(String, f64)> = Vec::new();
                let mut referenced = Vec::new();
                step.when.referenced_fields(&mut referenced);
                for name in referenced {
                    if let Some(v) = scope.lookup(name) {
                        evidence.push((format!("{}.{}", step.id, name), v));
                    }
                }
                for (name, operand) in &step.capture {
                    if let Some(v) = ctx.resolve(operand) {
                        evidence.push((name.clone(), v));
                    }
                }
                Some(evidence)
            } else {
                None
            }
        };

        match passed {
            Some(evidence) => {
                self.accumulated_evidence.extend(evidence);
                self.current_step_index += 1;
                self.last_event_at = timestamp;
                self.step_failures = 0;
                if self.current_step_index == definition.steps.len() {
                    self.status = MachineStatus::Satisfied;
                    StepOutcome::Satisfied
                } else {
                    StepOutcome::Advanced { next_step: self.current_step_index }
                }
            }
            None => {
                self.step_failures += 1;
                let timed_out = step.timeout.is_some_and(|limit| self.step_failures >= limit);
                if timed_out || self.is_stale(timestamp, staleness_ms) {
                    self.expire();
                    StepOutcome::Expired
                } else {
                    StepOutcome::Pending
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::{Comparator, Operand, Predicate, Side};
    use std::collections::BTreeMap;

    fn fields(pairs: &[(&str, f64)]) -> Fields {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn gt(field: &str, value: f64) -> Predicate {
        Predicate::Threshold { field: field.into(), op: Comparator::Gt, value: Operand::Const(value) }
    }

    fn two_step() -> Arc<PatternDefinition> {
        Arc::new(PatternDefinition {
            pattern_id: "two".into(),
            side: Side::Buy,
            steps: vec![
                Step {
                    id: "first".into(),
                    when: gt("rsi", 60.0),
                    capture: BTreeMap::from([("level".to_string(), Operand::Field { field: "close".into() })]),
                    timeout: None,
                },
                Step {
                    id: "second".into(),
                    when: Predicate::Threshold {
                        field: "close".into(),
                        op: Comparator::Gt,
                        value: Operand::Field { field: "vars.level".into() },
                    },
                    capture: BTreeMap::new(),
                    timeout: None,
                },
            ],
            regime_config: BTreeMap::new(),
        })
    }

    fn feed(m: &mut PatternStateMachine, f: &Fields, ts: Timestamp) -> StepOutcome {
        m.on_event(f, &Fields::new(), None, ts, 60_000)
    }

    #[test]
    fn test_steps_advance_in_order_and_capture() {
        let mut m = PatternStateMachine::new("X", two_step(), 0);
        assert_eq!(feed(&mut m, &fields(&[("rsi", 50.0), ("close", 100.0)]), 1), StepOutcome::Pending);
        assert_eq!(
            feed(&mut m, &fields(&[("rsi", 65.0), ("close", 101.0)]), 2),
            StepOutcome::Advanced { next_step: 1 }
        );
        assert_eq!(m.accumulated_evidence["level"], 101.0);
        assert_eq!(m.accumulated_evidence["first.rsi"], 65.0);

        assert_eq!(feed(&mut m, &fields(&[("close", 100.5)]), 3), StepOutcome::Pending);
        assert_eq!(feed(&mut m, &fields(&[("close", 102.0)]), 4), StepOutcome::Satisfied);
        assert_eq!(m.status, MachineStatus::Satisfied);
        assert_eq!(m.current_step_index, 2);
        assert_eq!(feed(&mut m, &fields(&[("rsi", 70.0)]), 5), StepOutcome::Ignored);
    }

    #[test]
    fn test_out_of_order_event_is_not_evaluated() {
        let mut m = PatternStateMachine::new("X", two_step(), 0);
        feed(&mut m, &fields(&[("rsi", 10.0)]), 10);
        assert_eq!(feed(&mut m, &fields(&[("rsi", 90.0)]), 5), StepOutcome::OutOfOrder { last: 10 });
        assert_eq!(m.current_step_index, 0);
    }

    #[test]
    fn test_stale_machine_expires_on_failed_step() {
        let mut m = PatternStateMachine::new("X", two_step(), 0);
        assert_eq!(m.on_event(&fields(&[("rsi", 10.0)]), &Fields::new(), None, 500, 1_000), StepOutcome::Pending);
        assert_eq!(m.on_event(&fields(&[("rsi", 10.0)]), &Fields::new(), None, 1_001, 1_000), StepOutcome::Expired);
        assert_eq!(m.status, MachineStatus::Expired);
    }

    #[test]
    fn test_step_timeout_expires_before_staleness_window() {
        let mut def = (*two_step()).clone();
        def.steps[1].timeout = Some(3);
        let mut m = PatternStateMachine::new("X", Arc::new(def), 0);
        // Failures on step 0 do not count against step 1.
        feed(&mut m, &fields(&[("rsi", 10.0)]), 1);
        feed(&mut m, &fields(&[("rsi", 10.0)]), 2);
        feed(&mut m, &fields(&[("rsi", 10.0)]), 3);
        assert_eq!(feed(&mut m, &fields(&[("rsi", 65.0), ("close", 100.0)]), 4), StepOutcome::Advanced { next_step: 1 });

        assert_eq!(feed(&mut m, &fields(&[("close", 99.0)]), 5), StepOutcome::Pending);
        assert_eq!(feed(&mut m, &fields(&[("close", 99.0)]), 6), StepOutcome::Pending);
        // Well inside the 60s window, but the third miss exhausts the step.
        assert_eq!(feed(&mut m, &fields(&[("close", 99.0)]), 7), StepOutcome::Expired);
        assert_eq!(m.status, MachineStatus::Expired);
    }

    #[test]
    fn test_step_timeout_resets_on_advance() {
        let mut def = (*two_step()).clone();
        def.steps[1].timeout = Some(2);
        let mut m = PatternStateMachine::new("X", Arc::new(def), 0);
        feed(&mut m, &fields(&[("rsi", 65.0), ("close", 100.0)]), 1);
        assert_eq!(feed(&mut m, &fields(&[("close", 99.0)]), 2), StepOutcome::Pending);
        assert_eq!(feed(&mut m, &fields(&[("close", 101.0)]), 3), StepOutcome::Satisfied);
    }

    #[test]
    fn test_empty_definition_is_ignored() {
        let def = PatternDefinition {
            pattern_id: "empty".into(),
            side: Side::Buy,
            steps: vec![],
            regime_config: BTreeMap::new(),
        };
        let mut m = PatternStateMachine::new("X", Arc::new(def), 0);
        assert_eq!(feed(&mut m, &fields(&[("rsi", 65.0)]), 1), StepOutcome::Ignored);
        assert_eq!(m.status, MachineStatus::Active);
    }

    #[test]
    fn test_rearm_resets_progress() {
        let mut m = PatternStateMachine::new("X", two_step(), 0);
        feed(&mut m, &fields(&[("rsi", 65.0), ("close", 1.0)]), 1);
        feed(&mut m, &fields(&[("close", 2.0)]), 2);
        assert_eq!(m.status, MachineStatus::Satisfied);
        m.rearm(2);
        assert_eq!(m.status, MachineStatus::Active);
        assert_eq!(m.current_step_index, 0);
        assert!(m.accumulated_evidence.is_empty());
    }
}
