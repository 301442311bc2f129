use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{RatchetError, Result};
use crate::signal::Signal;
use crate::state::State;

/// Category of change a workflow applies to its target subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Target {
    Create,
    Modify,
    Terminate,
    System,
    Validate,
}

impl Target {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Modify => "MODIFY",
            Self::Terminate => "TERMINATE",
            Self::System => "SYSTEM",
            Self::Validate => "VALIDATE",
        }
    }
}

/// Operator role a blocked process is assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Assignee {
    System,
    Noc,
}

impl Assignee {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "SYSTEM",
            Self::Noc => "NOC",
        }
    }

    /// Parse from a stored string, defaulting to `System`.
    pub fn parse(s: &str) -> Self {
        match s {
            "NOC" => Self::Noc,
            _ => Self::System,
        }
    }
}

/// Resolved identity of the caller, as produced by the authentication layer.
#[derive(Debug, Clone, Default)]
pub struct UserClaims {
    /// Username the action is attributed to.
    pub user_name: String,
    /// Raw claim bundle from the identity provider.
    pub claims: serde_json::Value,
}

/// Step body: reads the state map, returns a control signal.
pub type StepFn = Arc<dyn Fn(State) -> Signal + Send + Sync>;

/// Authorization predicate over the (optional) caller identity.
pub type Authorizer = Arc<dyn Fn(Option<&UserClaims>) -> bool + Send + Sync>;

/// Validates user inputs against the current state, returning the validated
/// payload to merge into the state.
pub type FormValidator = Arc<dyn Fn(&State, &[State]) -> Result<State> + Send + Sync>;

/// A form validator that accepts anything and merges the supplied inputs.
pub fn accept_any_form() -> FormValidator {
    Arc::new(|_state, inputs| Ok(merge_inputs(inputs)))
}

/// Validate user inputs against a form. Without a form the inputs are
/// merged as-is.
pub fn validate_form(form: Option<&FormValidator>, state: &State, inputs: &[State]) -> Result<State> {
    match form {
        Some(validator) => validator(state, inputs),
        None => Ok(merge_inputs(inputs)),
    }
}

fn merge_inputs(inputs: &[State]) -> State {
    let mut merged = State::new();
    for input in inputs {
        crate::state::merge_state(&mut merged, input.clone());
    }
    merged
}

/// One unit of execution in a workflow.
#[derive(Clone)]
pub struct Step {
    /// Step name as persisted in the step log.
    pub name: String,
    /// Role assigned to the process when this step blocks.
    pub assignee: Assignee,
    /// The step body.
    pub run: StepFn,
    /// Form presented when this step suspends.
    pub form: Option<FormValidator>,
    /// Authorization override for resuming out of this step's suspension.
    pub resume_auth: Option<Authorizer>,
    /// Authorization override for retrying after this step fails.
    pub retry_auth: Option<Authorizer>,
}

impl Step {
    /// Create a step with the default `System` assignee.
    pub fn new(name: impl Into<String>, run: impl Fn(State) -> Signal + Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            assignee: Assignee::System,
            run: Arc::new(run),
            form: None,
            resume_auth: None,
            retry_auth: None,
        }
    }

    /// Set the assignee.
    pub fn assignee(mut self, assignee: Assignee) -> Self {
        self.assignee = assignee;
        self
    }

    /// Attach a suspension form.
    pub fn form(mut self, form: FormValidator) -> Self {
        self.form = Some(form);
        self
    }

    /// Override the resume authorization for this step.
    pub fn resume_auth(
        mut self,
        auth: impl Fn(Option<&UserClaims>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.resume_auth = Some(Arc::new(auth));
        self
    }

    /// Override the retry authorization for this step.
    pub fn retry_auth(
        mut self,
        auth: impl Fn(Option<&UserClaims>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retry_auth = Some(Arc::new(auth));
        self
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("assignee", &self.assignee)
            .field("has_form", &self.form.is_some())
            .finish()
    }
}

/// A named, ordered list of steps with authorization predicates.
#[derive(Clone)]
pub struct Workflow {
    /// Unique workflow key.
    pub name: String,
    pub target: Target,
    pub description: String,
    /// Validator for the inputs supplied at start.
    pub initial_form: Option<FormValidator>,
    pub steps: Vec<Step>,
    /// Predicate gating `start_process`. `None` allows everyone.
    pub authorize_start: Option<Authorizer>,
    /// Predicate gating retry of failed steps. Falls back to
    /// `authorize_start` when unset.
    pub authorize_retry: Option<Authorizer>,
}

impl Workflow {
    pub fn new(name: impl Into<String>, target: Target) -> Self {
        Self {
            name: name.into(),
            target,
            description: String::new(),
            initial_form: None,
            steps: Vec::new(),
            authorize_start: None,
            authorize_retry: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn initial_form(mut self, form: FormValidator) -> Self {
        self.initial_form = Some(form);
        self
    }

    /// Append a step.
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn authorize_start(
        mut self,
        auth: impl Fn(Option<&UserClaims>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.authorize_start = Some(Arc::new(auth));
        self
    }

    pub fn authorize_retry(
        mut self,
        auth: impl Fn(Option<&UserClaims>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.authorize_retry = Some(Arc::new(auth));
        self
    }

    /// Whether processes of this workflow are tasks (scheduler-driven).
    pub fn is_task(&self) -> bool {
        self.target == Target::System
    }

    /// Evaluate the start authorization predicate.
    pub fn may_start(&self, user: Option<&UserClaims>) -> bool {
        match &self.authorize_start {
            Some(auth) => auth(user),
            None => true,
        }
    }

    /// Digest over the ordered step names, captured on each process at
    /// start. A changed digest means the step list was edited while the
    /// process was in flight, which makes count-based recovery unsafe.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for step in &self.steps {
            hasher.update(step.name.as_bytes());
            hasher.update([0u8]);
        }
        format!("{:x}", hasher.finalize())
    }
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.name)
            .field("target", &self.target)
            .field("steps", &self.steps.iter().map(|s| &s.name).collect::<Vec<_>>())
            .finish()
    }
}

/// Runtime handle for one run of a workflow.
///
/// Owned by whichever executor task is currently advancing the process and
/// recreated from the persisted step log whenever the process is resumed.
#[derive(Clone)]
pub struct ProcessStat {
    pub process_id: Uuid,
    pub workflow: Arc<Workflow>,
    /// Current state as a control signal.
    pub state: Signal,
    /// Suffix of `workflow.steps` still to execute.
    pub remaining_steps: Vec<Step>,
    pub current_user: String,
    pub user_claims: Option<UserClaims>,
}

impl ProcessStat {
    pub fn new(
        process_id: Uuid,
        workflow: Arc<Workflow>,
        state: Signal,
        remaining_steps: Vec<Step>,
        current_user: impl Into<String>,
        user_claims: Option<UserClaims>,
    ) -> Self {
        Self {
            process_id,
            workflow,
            state,
            remaining_steps,
            current_user: current_user.into(),
            user_claims,
        }
    }

    /// Replace the current user.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.current_user = user.into();
        self
    }

    /// Replace the current state.
    pub fn with_state(mut self, state: Signal) -> Self {
        self.state = state;
        self
    }

    /// The form of the step the process is currently blocked on, if any.
    pub fn current_form(&self) -> Option<&FormValidator> {
        self.remaining_steps.first().and_then(|s| s.form.as_ref())
    }
}

impl fmt::Debug for ProcessStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessStat")
            .field("process_id", &self.process_id)
            .field("workflow", &self.workflow.name)
            .field("remaining_steps", &self.remaining_steps.len())
            .field("current_user", &self.current_user)
            .finish()
    }
}

/// Resolve the effective resume/retry authorizers for the current step.
///
/// Walks the completed steps plus the current one, choosing the most
/// recently established callback; a step-level resume override also
/// becomes the retry fallback. Defaults to the workflow-level callbacks.
pub fn auth_callbacks(
    steps: &[Step],
    workflow: &Workflow,
) -> (Option<Authorizer>, Option<Authorizer>) {
    let mut resume = workflow.authorize_start.clone();
    let mut retry = workflow
        .authorize_retry
        .clone()
        .or_else(|| resume.clone());

    for step in steps {
        if let Some(auth) = &step.resume_auth {
            resume = Some(auth.clone());
        }
        if let Some(auth) = step.retry_auth.as_ref().or(step.resume_auth.as_ref()) {
            retry = Some(auth.clone());
        }
    }

    (resume, retry)
}

/// The steps to evaluate for authorization of the current position: all
/// completed steps plus the step the process is blocked on.
pub fn steps_for_auth<'a>(workflow: &'a Workflow, remaining: &[Step]) -> Vec<Step> {
    if remaining.is_empty() {
        return workflow.steps.clone();
    }
    let done = workflow.steps.len().saturating_sub(remaining.len());
    let mut steps: Vec<Step> = workflow.steps[..done].to_vec();
    steps.push(remaining[0].clone());
    steps
}

/// Refuse operations on the sentinel workflow that replaces removed
/// definitions.
pub fn ensure_present(workflow: &Workflow) -> Result<()> {
    if crate::registry::WorkflowRegistry::is_removed(workflow) {
        return Err(RatchetError::WorkflowGone(workflow.name.clone()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::as_state;
    use serde_json::json;

    fn noop_step(name: &str) -> Step {
        Step::new(name, |state| Signal::Success(state))
    }

    #[test]
    fn test_workflow_builder() {
        let wf = Workflow::new("modify_subscription", Target::Modify)
            .description("Modify a subscription")
            .step(noop_step("fetch"))
            .step(noop_step("apply"));

        assert_eq!(wf.name, "modify_subscription");
        assert_eq!(wf.steps.len(), 2);
        assert!(!wf.is_task());
        assert!(wf.may_start(None));
    }

    #[test]
    fn test_task_target() {
        let wf = Workflow::new("validate_all", Target::System);
        assert!(wf.is_task());
    }

    #[test]
    fn test_digest_changes_with_steps() {
        let a = Workflow::new("wf", Target::Create).step(noop_step("one"));
        let b = Workflow::new("wf", Target::Create)
            .step(noop_step("one"))
            .step(noop_step("two"));

        assert_ne!(a.digest(), b.digest());
        assert_eq!(a.digest(), Workflow::new("wf", Target::Create).step(noop_step("one")).digest());
    }

    #[test]
    fn test_authorize_start_denies() {
        let wf = Workflow::new("wf", Target::Create).authorize_start(|user| user.is_some());
        assert!(!wf.may_start(None));

        let claims = UserClaims {
            user_name: "alice".into(),
            claims: json!({}),
        };
        assert!(wf.may_start(Some(&claims)));
    }

    #[test]
    fn test_auth_callbacks_step_overrides() {
        let wf = Workflow::new("wf", Target::Create)
            .authorize_start(|_| true)
            .step(noop_step("a"))
            .step(noop_step("b").resume_auth(|_| false));

        let (resume, retry) = auth_callbacks(&wf.steps, &wf);
        // Step b's resume override wins for both resume and retry.
        assert!(!(resume.unwrap())(None));
        assert!(!(retry.unwrap())(None));
    }

    #[test]
    fn test_steps_for_auth_includes_current() {
        let wf = Workflow::new("wf", Target::Create)
            .step(noop_step("a"))
            .step(noop_step("b"))
            .step(noop_step("c"));

        let remaining = wf.steps[1..].to_vec();
        let steps = steps_for_auth(&wf, &remaining);
        let names: Vec<&str> = steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);

        let steps = steps_for_auth(&wf, &[]);
        assert_eq!(steps.len(), 3);
    }

    #[test]
    fn test_process_stat_current_form() {
        let wf = Arc::new(
            Workflow::new("wf", Target::Create)
                .step(noop_step("a").form(accept_any_form()))
                .step(noop_step("b")),
        );
        let stat = ProcessStat::new(
            Uuid::new_v4(),
            wf.clone(),
            Signal::Suspend(as_state(json!({}))),
            wf.steps.clone(),
            "alice",
            None,
        );
        assert!(stat.current_form().is_some());
    }
}
