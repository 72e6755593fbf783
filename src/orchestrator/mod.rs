//! Workflow Orchestrator.
//!
//! Walks a resolved workflow's root step list in order, then its group list.
//! Sequential groups run their members one after another, each feeding its
//! captures to the next; parallel groups spawn one task per member against a
//! read-snapshot of the scope and merge capture writes back at a join
//! barrier in declaration order, so two siblings capturing the same name
//! can't race — the same `JoinSet`+`Arc` shape as the executor's parallel
//! `repeat`.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinSet;

use crate::condition;
use crate::document::{Step, StepGroup, Workflow};
use crate::executor::{Executor, StepReport, StepStatus};
use crate::vars::Scope;

/// The result of running a whole workflow: every root step/group outcome
/// plus the workflow-scoped captures named in `captures`.
#[derive(Debug, Clone)]
pub struct WorkflowReport {
    pub name: String,
    pub steps: Vec<StepReport>,
    pub captures: HashMap<String, Value>,
    /// Set when `fail_fast` halted the run before every root step/group ran.
    pub halted_early: bool,
}

impl WorkflowReport {
    pub fn all_passed(&self) -> bool {
        self.steps.iter().all(StepReport::all_passed)
    }
}

pub struct Orchestrator {
    executor: Executor,
}

impl Orchestrator {
    pub fn new(executor: Executor) -> Self {
        Self { executor }
    }

    /// Runs every root step then every root group, halting after the first
    /// failure when `fail_fast` is set.
    pub async fn run(&self, workflow: &Workflow, scope: &mut Scope, fail_fast: bool) -> WorkflowReport {
        self.run_with_progress(workflow, scope, fail_fast, &mut |_, _, _| {}).await
    }

    /// Same as [`Self::run`], additionally invoking `on_step(index, total,
    /// report)` once every root step/group finishes — the hook the JSON-RPC
    /// shim uses to stream `stepwise/progress` notifications.
    pub async fn run_with_progress(
        &self,
        workflow: &Workflow,
        scope: &mut Scope,
        fail_fast: bool,
        on_step: &mut dyn FnMut(usize, usize, &StepReport),
    ) -> WorkflowReport {
        let total = workflow.steps.len() + workflow.groups.len();
        let mut reports = Vec::with_capacity(total);
        let mut halted = false;

        for step in &workflow.steps {
            let report = self.executor.execute(step, scope).await;
            let failed = report.status == StepStatus::Failed;
            on_step(reports.len(), total, &report);
            reports.push(report);
            if fail_fast && failed {
                halted = true;
                break;
            }
        }

        if !halted {
            for group in &workflow.groups {
                let (report, group_halted) = self.run_group(group, scope, fail_fast).await;
                on_step(reports.len(), total, &report);
                reports.push(report);
                if group_halted {
                    halted = true;
                    break;
                }
            }
        }

        let captures = workflow
            .captures
            .iter()
            .filter_map(|name| scope.get(name).map(|v| (name.clone(), v.clone())))
            .collect();

        WorkflowReport { name: workflow.name.clone(), steps: reports, captures, halted_early: halted }
    }

    /// Runs one group, recursing into nested groups. Returns the group's own
    /// aggregated report plus whether a fail-fast failure inside it should
    /// halt the enclosing walk.
    async fn run_group(&self, group: &StepGroup, scope: &mut Scope, fail_fast: bool) -> (StepReport, bool) {
        if let Some(condition_expr) = &group.condition {
            match condition::evaluate(condition_expr, scope) {
                Ok(true) => {}
                Ok(false) => {
                    return (
                        StepReport {
                            name: Some(group.name.clone()),
                            status: StepStatus::Skipped,
                            validations: Vec::new(),
                            error: None,
                            duration: Duration::ZERO,
                            response: None,
                            children: Vec::new(),
                        },
                        false,
                    );
                }
                Err(e) => {
                    return (
                        StepReport {
                            name: Some(group.name.clone()),
                            status: StepStatus::Failed,
                            validations: Vec::new(),
                            error: Some(e.to_string()),
                            duration: Duration::ZERO,
                            response: None,
                            children: Vec::new(),
                        },
                        fail_fast,
                    );
                }
            }
        }

        let (children, halted) = if group.parallel {
            self.run_parallel_members(group, scope).await
        } else {
            self.run_sequential_members(group, scope, fail_fast).await
        };

        let status = if children.iter().all(StepReport::all_passed) { StepStatus::Passed } else { StepStatus::Failed };
        let report = StepReport {
            name: Some(group.name.clone()),
            status,
            validations: Vec::new(),
            error: None,
            duration: Duration::ZERO,
            response: None,
            children,
        };
        (report, halted && fail_fast)
    }

    async fn run_sequential_members(&self, group: &StepGroup, scope: &mut Scope, fail_fast: bool) -> (Vec<StepReport>, bool) {
        let mut children = Vec::with_capacity(group.steps.len() + group.groups.len());

        for step in &group.steps {
            let report = self.executor.execute(step, scope).await;
            let failed = report.status == StepStatus::Failed;
            children.push(report);
            if fail_fast && failed {
                return (children, true);
            }
        }

        for nested in &group.groups {
            let (report, nested_halted) = Box::pin(self.run_group(nested, scope, fail_fast)).await;
            let failed = report.status == StepStatus::Failed;
            children.push(report);
            if nested_halted || (fail_fast && failed) {
                return (children, true);
            }
        }

        (children, false)
    }

    /// Spawns one task per member step and per nested group, each against its
    /// own snapshot of `scope`; captures are merged back in declaration order
    /// once every task finishes. Two siblings capturing the same name resolve
    /// first-declared wins, since merging applies in ascending index order
    /// and skips a key that's already set.
    async fn run_parallel_members(&self, group: &StepGroup, scope: &mut Scope) -> (Vec<StepReport>, bool) {
        enum Member {
            Step(Step),
            Group(StepGroup),
        }

        let mut members = Vec::with_capacity(group.steps.len() + group.groups.len());
        members.extend(group.steps.iter().cloned().map(Member::Step));
        members.extend(group.groups.iter().cloned().map(Member::Group));

        let mut join_set = JoinSet::new();
        for (index, member) in members.into_iter().enumerate() {
            let snapshot = scope.clone();
            let executor = self.executor.clone();
            let gate = self.executor.parallel_gate.clone();
            match member {
                Member::Step(step) => {
                    join_set.spawn(async move {
                        let _permit = gate.acquire_owned().await;
                        let mut local = snapshot;
                        let report = executor.execute(&step, &mut local).await;
                        (index, report, local)
                    });
                }
                Member::Group(nested) => {
                    join_set.spawn(async move {
                        let _permit = gate.acquire_owned().await;
                        let orchestrator = Orchestrator::new(executor);
                        let mut local = snapshot;
                        let (report, _) = Box::pin(orchestrator.run_group(&nested, &mut local, false)).await;
                        (index, report, local)
                    });
                }
            }
        }

        let mut results = Vec::with_capacity(join_set.len());
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(triple) => results.push(triple),
                Err(e) => results.push((
                    usize::MAX,
                    StepReport {
                        name: None,
                        status: StepStatus::Failed,
                        validations: Vec::new(),
                        error: Some(format!("group task panicked: {e}")),
                        duration: Duration::ZERO,
                        response: None,
                        children: Vec::new(),
                    },
                    scope.clone(),
                )),
            }
        }
        results.sort_by_key(|(index, _, _)| *index);

        let mut children = Vec::with_capacity(results.len());
        for (_, report, child_scope) in results {
            for (k, v) in child_scope.get_all() {
                if scope.get(k).is_none() {
                    scope.set(k.clone(), v.clone());
                }
            }
            children.push(report);
        }

        (children, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::ExecutionLimits;
    use crate::transport::TransportRegistry;
    use std::sync::Arc;

    fn test_orchestrator() -> Orchestrator {
        Orchestrator::new(Executor::new(Arc::new(TransportRegistry::new()), Arc::new(HashMap::new()), Arc::new(ExecutionLimits::default())))
    }

    fn wait_step(name: &str) -> Step {
        Step { name: Some(name.to_string()), wait: Some("1ms".into()), ..Default::default() }
    }

    fn failing_step(name: &str) -> Step {
        Step { name: Some(name.to_string()), use_component: Some("missing".into()), ..Default::default() }
    }

    #[tokio::test]
    async fn runs_root_steps_in_order() {
        let orchestrator = test_orchestrator();
        let workflow = Workflow { name: "demo".into(), steps: vec![wait_step("a"), wait_step("b")], ..Default::default() };
        let mut scope = Scope::new();
        let report = orchestrator.run(&workflow, &mut scope, false).await;
        assert_eq!(report.steps.len(), 2);
        assert!(report.all_passed());
        assert!(!report.halted_early);
    }

    #[tokio::test]
    async fn fail_fast_halts_after_first_failure() {
        let orchestrator = test_orchestrator();
        let workflow = Workflow { name: "demo".into(), steps: vec![failing_step("a"), wait_step("b")], ..Default::default() };
        let mut scope = Scope::new();
        let report = orchestrator.run(&workflow, &mut scope, true).await;
        assert_eq!(report.steps.len(), 1);
        assert!(report.halted_early);
    }

    #[tokio::test]
    async fn without_fail_fast_every_step_runs() {
        let orchestrator = test_orchestrator();
        let workflow = Workflow { name: "demo".into(), steps: vec![failing_step("a"), wait_step("b")], ..Default::default() };
        let mut scope = Scope::new();
        let report = orchestrator.run(&workflow, &mut scope, false).await;
        assert_eq!(report.steps.len(), 2);
        assert!(!report.halted_early);
        assert!(!report.all_passed());
    }

    #[tokio::test]
    async fn sequential_group_runs_members_in_order() {
        let orchestrator = test_orchestrator();
        let group = StepGroup { name: "grp".into(), steps: vec![wait_step("a"), wait_step("b")], ..Default::default() };
        let workflow = Workflow { name: "demo".into(), groups: vec![group], ..Default::default() };
        let mut scope = Scope::new();
        let report = orchestrator.run(&workflow, &mut scope, false).await;
        assert_eq!(report.steps.len(), 1);
        assert_eq!(report.steps[0].children.len(), 2);
        assert!(report.all_passed());
    }

    #[tokio::test]
    async fn parallel_group_runs_every_member() {
        let orchestrator = test_orchestrator();
        let group = StepGroup { name: "grp".into(), parallel: true, steps: vec![wait_step("a"), wait_step("b"), wait_step("c")], ..Default::default() };
        let workflow = Workflow { name: "demo".into(), groups: vec![group], ..Default::default() };
        let mut scope = Scope::new();
        let report = orchestrator.run(&workflow, &mut scope, false).await;
        assert_eq!(report.steps[0].children.len(), 3);
        assert!(report.all_passed());
    }

    #[tokio::test]
    async fn group_condition_false_skips_the_whole_group() {
        let orchestrator = test_orchestrator();
        let group = StepGroup { name: "grp".into(), condition: Some("false".into()), steps: vec![failing_step("a")], ..Default::default() };
        let workflow = Workflow { name: "demo".into(), groups: vec![group], ..Default::default() };
        let mut scope = Scope::new();
        let report = orchestrator.run(&workflow, &mut scope, false).await;
        assert_eq!(report.steps[0].status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn run_with_progress_invokes_hook_per_root_entry() {
        let orchestrator = test_orchestrator();
        let workflow = Workflow { name: "demo".into(), steps: vec![wait_step("a"), wait_step("b")], ..Default::default() };
        let mut scope = Scope::new();
        let mut seen = Vec::new();
        let mut hook = |index: usize, total: usize, report: &StepReport| {
            seen.push((index, total, report.name.clone()));
        };
        orchestrator.run_with_progress(&workflow, &mut scope, false, &mut hook).await;
        assert_eq!(seen, vec![(0, 2, Some("a".to_string())), (1, 2, Some("b".to_string()))]);
    }

    #[tokio::test]
    async fn workflow_captures_are_collected_from_scope() {
        let orchestrator = test_orchestrator();
        let workflow = Workflow { name: "demo".into(), captures: vec!["token".into()], ..Default::default() };
        let mut scope = Scope::new();
        scope.set("token", Value::String("abc123".into()));
        let report = orchestrator.run(&workflow, &mut scope, false).await;
        assert_eq!(report.captures.get("token"), Some(&Value::String("abc123".into())));
    }
}
