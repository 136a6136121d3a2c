//! The step/action pipeline.
//!
//! Planning happens once: every enabled step asks every plugin of every
//! scope for its actions and the result is stored as an ordered table of
//! steps indexing into one action arena. Within a step the project scope
//! comes first, then each configuration in order. Execution walks that table
//! and never changes it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::action::Action;
use crate::core::build_type::BuildType;
use crate::core::score::ScoreParse;
use crate::core::settings::Settings;
use crate::core::steps::{StepKind, StepPolicy};
use crate::error::{Error, classify};
use crate::plugin::{PlanContext, Plugin, actions_for};

/// Cooperative cancellation flag, checked before each action.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

type ActionId = usize;

#[derive(Debug, Clone)]
struct StepPlan {
    kind: StepKind,
    enabled: bool,
    policy: StepPolicy,
    actions: Vec<ActionId>,
}

/// Label of the project-wide scope in reports.
pub const PROJECT_SCOPE: &str = "project";

/// Plugins planned against one context: the project's own, or one
/// configuration's.
pub struct PlanScope<'a> {
    pub plugins: Vec<&'a dyn Plugin>,
    pub ctx: PlanContext<'a>,
}

impl PlanScope<'_> {
    pub fn label(&self) -> &str {
        self.ctx.configuration.unwrap_or(PROJECT_SCOPE)
    }
}

struct ActionSlot {
    scope_idx: usize,
    scope: String,
    plugin_idx: usize,
    plugin: String,
    action: Box<dyn Action>,
    non_fatal: bool,
    disabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionResult {
    Exit { code: i32 },
    TimedOut { timeout_secs: u64 },
    Error { message: String },
}

impl ActionResult {
    pub fn success(&self) -> bool {
        matches!(self, ActionResult::Exit { code: 0 })
    }

    fn from_run(result: Result<i32>) -> Self {
        match result {
            Ok(code) => ActionResult::Exit { code },
            Err(err) => match classify(&err) {
                Some(Error::Timeout { timeout_secs, .. }) => ActionResult::TimedOut {
                    timeout_secs: *timeout_secs,
                },
                _ => ActionResult::Error {
                    message: format!("{err:#}"),
                },
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionRecord {
    pub scope: String,
    pub plugin: String,
    pub description: String,
    pub result: ActionResult,
    pub non_fatal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Switched off for this build type.
    Disabled,
    /// Not reached because the build had already failed.
    Skipped,
    Passed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub step: StepKind,
    pub status: StepStatus,
    pub actions: Vec<ActionRecord>,
}

/// The action that failed the build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub step: StepKind,
    pub scope: String,
    pub plugin: String,
    pub action: String,
    pub result: ActionResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PipelineOutcome {
    Success,
    Failed(Failure),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub outcome: PipelineOutcome,
    pub steps: Vec<StepReport>,
    /// Scores reported by tester actions, by `<scope>: <action description>`.
    pub scores: Vec<(String, ScoreParse)>,
}

impl PipelineReport {
    pub fn succeeded(&self) -> bool {
        self.outcome == PipelineOutcome::Success
    }

    pub fn step(&self, step: StepKind) -> Option<&StepReport> {
        self.steps.iter().find(|report| report.step == step)
    }
}

/// Progress notifications emitted while executing.
pub enum PipelineEvent<'a> {
    StepStarted(StepKind),
    ActionFinished {
        step: StepKind,
        /// Index into the scopes the pipeline was planned with.
        scope: usize,
        plugin: &'a str,
        action: &'a dyn Action,
        result: &'a ActionResult,
    },
    StepFinished(StepKind, StepStatus),
}

pub struct Pipeline {
    steps: Vec<StepPlan>,
    actions: Vec<ActionSlot>,
}

impl Pipeline {
    /// Build the step table. Disabled steps get no actions and their plugins
    /// are never asked for any. Plugins are numbered across all scopes in
    /// order, as [`Pipeline::disable_plugin`] expects.
    pub fn plan(
        settings: &Settings,
        build_type: BuildType,
        scopes: &[PlanScope<'_>],
    ) -> Result<Self> {
        let mut steps = Vec::with_capacity(StepKind::ALL.len());
        let mut actions = Vec::new();
        for kind in StepKind::ALL {
            let enabled = settings.is_step_enabled(kind, build_type);
            let mut ids = Vec::new();
            if enabled {
                let plugins = scopes.iter().enumerate().flat_map(|(scope_idx, scope)| {
                    scope.plugins.iter().map(move |plugin| (scope_idx, scope, *plugin))
                });
                for (plugin_idx, (scope_idx, scope, plugin)) in plugins.enumerate() {
                    for planned in actions_for(plugin, kind, &scope.ctx)? {
                        ids.push(actions.len());
                        actions.push(ActionSlot {
                            scope_idx,
                            scope: scope.label().to_string(),
                            plugin_idx,
                            plugin: plugin.name().to_string(),
                            action: planned.action,
                            non_fatal: planned.non_fatal,
                            disabled: false,
                        });
                    }
                }
            }
            debug!(step = %kind, enabled, actions = ids.len(), "planned step");
            steps.push(StepPlan {
                kind,
                enabled,
                policy: settings.step_policy(kind),
                actions: ids,
            });
        }
        Ok(Self { steps, actions })
    }

    pub fn is_step_enabled(&self, step: StepKind) -> bool {
        self.steps
            .iter()
            .any(|plan| plan.kind == step && plan.enabled)
    }

    /// Drop every action contributed by the plugin at `plugin_idx`.
    pub fn disable_plugin(&mut self, plugin_idx: usize) {
        for slot in &mut self.actions {
            if slot.plugin_idx == plugin_idx {
                slot.disabled = true;
            }
        }
    }

    /// `(step, scope, description)` of every live action in execution order.
    pub fn planned_actions(&self) -> Vec<(StepKind, &str, String)> {
        self.steps
            .iter()
            .flat_map(|plan| {
                plan.actions
                    .iter()
                    .map(|id| &self.actions[*id])
                    .filter(|slot| !slot.disabled)
                    .map(|slot| (plan.kind, slot.scope.as_str(), slot.action.describe()))
            })
            .collect()
    }

    /// Run every step in order.
    ///
    /// Within a step, the first failing fatal action ends the step. A failed
    /// step fails the build unless it is best-effort; once the build has
    /// failed only steps that run after failure still execute.
    pub fn execute(
        &mut self,
        cancel: &CancelToken,
        on_event: &mut dyn FnMut(&PipelineEvent<'_>),
    ) -> PipelineReport {
        let mut outcome = PipelineOutcome::Success;
        let mut scores = Vec::new();
        let mut reports = Vec::with_capacity(self.steps.len());

        for plan in &self.steps {
            if !plan.enabled {
                reports.push(StepReport {
                    step: plan.kind,
                    status: StepStatus::Disabled,
                    actions: Vec::new(),
                });
                continue;
            }
            let skip = match outcome {
                PipelineOutcome::Success => false,
                PipelineOutcome::Failed(_) => !plan.policy.runs_after_failure,
                PipelineOutcome::Cancelled => true,
            };
            if skip {
                reports.push(StepReport {
                    step: plan.kind,
                    status: StepStatus::Skipped,
                    actions: Vec::new(),
                });
                continue;
            }

            on_event(&PipelineEvent::StepStarted(plan.kind));
            info!(step = %plan.kind, "step started");
            let mut status = StepStatus::Passed;
            let mut records = Vec::new();
            for id in &plan.actions {
                let slot = &mut self.actions[*id];
                if slot.disabled {
                    continue;
                }
                if cancel.is_cancelled() {
                    warn!(step = %plan.kind, "build cancelled");
                    status = StepStatus::Cancelled;
                    if outcome == PipelineOutcome::Success {
                        outcome = PipelineOutcome::Cancelled;
                    }
                    break;
                }

                let description = slot.action.describe();
                debug!(
                    step = %plan.kind,
                    scope = %slot.scope,
                    plugin = %slot.plugin,
                    action = %description,
                    "running action"
                );
                let result = ActionResult::from_run(slot.action.run());
                if let Some(score) = slot.action.test_score() {
                    scores.push((format!("{}: {description}", slot.scope), score));
                }
                on_event(&PipelineEvent::ActionFinished {
                    step: plan.kind,
                    scope: slot.scope_idx,
                    plugin: &slot.plugin,
                    action: slot.action.as_ref(),
                    result: &result,
                });
                records.push(ActionRecord {
                    scope: slot.scope.clone(),
                    plugin: slot.plugin.clone(),
                    description: description.clone(),
                    result: result.clone(),
                    non_fatal: slot.non_fatal,
                });

                if result.success() {
                    continue;
                }
                if slot.non_fatal {
                    warn!(step = %plan.kind, action = %description, result = ?result, "non-fatal action failed");
                    continue;
                }
                status = StepStatus::Failed;
                if plan.policy.best_effort {
                    warn!(step = %plan.kind, action = %description, result = ?result, "best-effort step failed");
                } else {
                    error!(step = %plan.kind, action = %description, result = ?result, "step failed");
                    if outcome == PipelineOutcome::Success {
                        outcome = PipelineOutcome::Failed(Failure {
                            step: plan.kind,
                            scope: slot.scope.clone(),
                            plugin: slot.plugin.clone(),
                            action: description,
                            result,
                        });
                    }
                }
                break;
            }
            on_event(&PipelineEvent::StepFinished(plan.kind, status));
            reports.push(StepReport {
                step: plan.kind,
                status,
                actions: records,
            });
        }

        PipelineReport {
            outcome,
            steps: reports,
            scores,
        }
    }
}
