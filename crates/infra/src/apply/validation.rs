//! Plan validation.
//!
//! Validators are pure: the same plan always yields the same outcome, so a
//! rejected plan is never retried.

use std::collections::HashSet;

use super::types::ChangePlan;

/// Validator verdict.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValidationOutcome {
    pub ok: bool,
    pub reasons: Vec<String>,
}

impl ValidationOutcome {
    pub fn ok() -> Self {
        Self {
            ok: true,
            reasons: Vec::new(),
        }
    }

    pub fn rejected(reasons: Vec<String>) -> Self {
        Self { ok: false, reasons }
    }

    fn from_reasons(reasons: Vec<String>) -> Self {
        if reasons.is_empty() {
            Self::ok()
        } else {
            Self::rejected(reasons)
        }
    }
}

pub trait PlanValidator: Send + Sync {
    fn validate(&self, plan: &ChangePlan) -> ValidationOutcome;
}

impl<F> PlanValidator for F
where
    F: Fn(&ChangePlan) -> ValidationOutcome + Send + Sync,
{
    fn validate(&self, plan: &ChangePlan) -> ValidationOutcome {
        self(plan)
    }
}

/// Structural checks applied to every plan.
///
/// Plan size is unbounded unless `with_max_targets` sets a cap.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RuleValidator {
    max_targets: Option<usize>,
    required_attributes: Vec<String>,
}

impl RuleValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_targets(mut self, max_targets: usize) -> Self {
        self.max_targets = Some(max_targets);
        self
    }

    /// Attributes every `after` snapshot must carry.
    pub fn require_attribute(mut self, name: impl Into<String>) -> Self {
        self.required_attributes.push(name.into());
        self
    }
}

impl PlanValidator for RuleValidator {
    fn validate(&self, plan: &ChangePlan) -> ValidationOutcome {
        let mut reasons = Vec::new();

        if plan.operation_type.trim().is_empty() {
            reasons.push("operation type is empty".to_string());
        }
        if plan.changes.is_empty() {
            reasons.push("plan has no targets".to_string());
        }
        if let Some(limit) = self.max_targets.filter(|&limit| plan.changes.len() > limit) {
            reasons.push(format!(
                "plan has {} targets, limit is {limit}",
                plan.changes.len()
            ));
        }

        let mut seen = HashSet::new();
        for change in &plan.changes {
            let id = &change.entity_id;
            if !seen.insert(id) {
                reasons.push(format!("target {id} appears more than once"));
            }

            for (side, snapshot) in [("before", &change.before), ("after", &change.after)] {
                if let Some(entity) = snapshot.as_ref().filter(|e| &e.id != id) {
                    reasons.push(format!(
                        "{side} snapshot for target {id} describes entity {}",
                        entity.id
                    ));
                }
            }

            match &change.after {
                None if change.before.is_none() => {
                    reasons.push(format!("change for target {id} has neither before nor after"));
                }
                Some(after) => {
                    let missing = after.missing_attributes(&self.required_attributes);
                    if !missing.is_empty() {
                        reasons.push(format!(
                            "target {id} is missing required attributes: {}",
                            missing.join(", ")
                        ));
                    }
                }
                None => {}
            }
        }

        ValidationOutcome::from_reasons(reasons)
    }
}
