//! End-to-end interpreter scenarios over hand-built process graphs.
//!
//! Every scenario checks the structural invariants of the tree after each
//! driver call.

use anyhow::anyhow;
use pvm_lite_core::config::EngineConfig;
use pvm_lite_core::events::HistoryEvent;
use pvm_lite_core::hook::{ActivityHook, NoopHook};
use pvm_lite_core::job::JobKind;
use pvm_lite_core::model::{Condition, DefinitionBuilder, ListenerEvent};
use pvm_lite_core::{
    ActivityKind, AtomicOperation, EngineError, ExecutionId, Interpreter, ProcessDefinition,
    PROCESS_SCOPE,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

// ─── Helpers ───────────────────────────────────────────────────

fn interpreter(defs: Vec<ProcessDefinition>) -> Interpreter {
    with_hook(defs, Arc::new(NoopHook))
}

fn with_hook(defs: Vec<ProcessDefinition>, hook: Arc<dyn ActivityHook>) -> Interpreter {
    Interpreter::new(defs.into_iter().map(Arc::new), hook, EngineConfig::default())
}

fn started(interp: &mut Interpreter, key: &str) -> ExecutionId {
    let root = interp.create_process_instance(key).unwrap();
    interp.start(root, BTreeMap::new()).unwrap();
    interp.tree().check_invariants().unwrap();
    root
}

fn waiting_at(interp: &Interpreter, activity: &str) -> ExecutionId {
    interp
        .waiting_executions()
        .into_iter()
        .find(|(_, a)| a == activity)
        .map(|(e, _)| e)
        .unwrap_or_else(|| panic!("nothing waits at `{activity}`: {:?}", interp.waiting_executions()))
}

fn complete(interp: &mut Interpreter, activity: &str) {
    let execution = waiting_at(interp, activity);
    interp.signal(execution, "complete", Value::Null).unwrap();
    interp.tree().check_invariants().unwrap();
}

fn activity_name(interp: &Interpreter, execution: ExecutionId) -> Option<String> {
    let node = interp.tree().get(execution).unwrap();
    let def = interp.definition(&node.process_definition).unwrap();
    node.activity.map(|a| def.name_of(a).to_string())
}

/// Every started activity instance is ended exactly once and no id is
/// handed out twice.
fn assert_instances_paired(history: &[HistoryEvent]) {
    let mut open: HashMap<String, usize> = HashMap::new();
    let mut seen = Vec::new();
    for event in history {
        match event {
            HistoryEvent::ActivityInstanceStarted {
                activity_instance_id,
                ..
            } => {
                assert!(
                    !seen.contains(activity_instance_id),
                    "activity instance id {activity_instance_id} reused"
                );
                seen.push(activity_instance_id.clone());
                *open.entry(activity_instance_id.clone()).or_default() += 1;
            }
            HistoryEvent::ActivityInstanceEnded {
                activity_instance_id,
                ..
            } => {
                let count = open.entry(activity_instance_id.clone()).or_default();
                assert_eq!(*count, 1, "{activity_instance_id} ended without being open");
                *count -= 1;
            }
            _ => {}
        }
    }
    let dangling: Vec<_> = open.into_iter().filter(|(_, c)| *c != 0).collect();
    assert!(dangling.is_empty(), "activity instances never ended: {dangling:?}");
}

/// Parent activity instance recorded when `activity` was first entered.
fn entered_under(history: &[HistoryEvent], activity: &str) -> Option<String> {
    history
        .iter()
        .find_map(|e| match e {
            HistoryEvent::ActivityInstanceStarted {
                activity: a,
                parent_activity_instance_id,
                ..
            } if a == activity => Some(parent_activity_instance_id.clone()),
            _ => None,
        })
        .unwrap_or_else(|| panic!("`{activity}` never started"))
}

/// Id of the first activity instance opened for `activity`.
fn instance_of(history: &[HistoryEvent], activity: &str) -> String {
    history
        .iter()
        .find_map(|e| match e {
            HistoryEvent::ActivityInstanceStarted {
                activity: a,
                activity_instance_id,
                ..
            } if a == activity => Some(activity_instance_id.clone()),
            _ => None,
        })
        .unwrap_or_else(|| panic!("`{activity}` never started"))
}

fn ended_activities(history: &[HistoryEvent]) -> Vec<(String, bool)> {
    history
        .iter()
        .filter_map(|e| match e {
            HistoryEvent::ActivityInstanceEnded {
                activity, canceled, ..
            } => Some((activity.clone(), *canceled)),
            _ => None,
        })
        .collect()
}

// ─── Definitions ───────────────────────────────────────────────

fn sequential() -> ProcessDefinition {
    let mut b = DefinitionBuilder::new("sequential");
    let start = b.add("start", ActivityKind::StartEvent, PROCESS_SCOPE);
    let a = b.add("a", ActivityKind::UserTask, PROCESS_SCOPE);
    let end = b.add("end", ActivityKind::EndEvent, PROCESS_SCOPE);
    b.connect(start, a);
    b.connect(a, end);
    b.build().unwrap()
}

fn fork_join() -> ProcessDefinition {
    let mut b = DefinitionBuilder::new("fork_join");
    let start = b.add("start", ActivityKind::StartEvent, PROCESS_SCOPE);
    let fork = b.add("fork", ActivityKind::ParallelGateway, PROCESS_SCOPE);
    let a = b.add("a", ActivityKind::UserTask, PROCESS_SCOPE);
    let c = b.add("b", ActivityKind::UserTask, PROCESS_SCOPE);
    let join = b.add("join", ActivityKind::ParallelGateway, PROCESS_SCOPE);
    let end = b.add("end", ActivityKind::EndEvent, PROCESS_SCOPE);
    b.connect(start, fork);
    b.connect(fork, a);
    b.connect(fork, c);
    b.connect(a, join);
    b.connect(c, join);
    b.connect(join, end);
    b.build().unwrap()
}

fn boundary(interrupting: bool) -> ProcessDefinition {
    let mut b = DefinitionBuilder::new("boundary");
    let start = b.add("start", ActivityKind::StartEvent, PROCESS_SCOPE);
    let x = b.add("x", ActivityKind::UserTask, PROCESS_SCOPE);
    let end = b.add("end", ActivityKind::EndEvent, PROCESS_SCOPE);
    let e = b.attach("e", x, interrupting);
    let handle = b.add("handle", ActivityKind::UserTask, PROCESS_SCOPE);
    let handled = b.add("handled", ActivityKind::EndEvent, PROCESS_SCOPE);
    b.connect(start, x);
    b.connect(x, end);
    b.connect(e, handle);
    b.connect(handle, handled);
    b.timer(e, 1_000);
    b.listener(e, ListenerEvent::Start, "record");
    b.build().unwrap()
}

fn event_subprocess(interrupting: bool) -> ProcessDefinition {
    let mut b = DefinitionBuilder::new("esp_proc");
    let start = b.add("start", ActivityKind::StartEvent, PROCESS_SCOPE);
    let task = b.add("task", ActivityKind::UserTask, PROCESS_SCOPE);
    let end = b.add("end", ActivityKind::EndEvent, PROCESS_SCOPE);
    b.connect(start, task);
    b.connect(task, end);
    let esp = b.add("esp", ActivityKind::EventSubProcess, PROCESS_SCOPE);
    let esp_start = b.add("esp_start", ActivityKind::StartEvent, esp);
    let esp_task = b.add("esp_task", ActivityKind::UserTask, esp);
    let esp_end = b.add("esp_end", ActivityKind::EndEvent, esp);
    b.connect(esp_start, esp_task);
    b.connect(esp_task, esp_end);
    b.interrupting(esp, interrupting);
    b.timer(esp, 500);
    b.build().unwrap()
}

fn timer_job(interp: &mut Interpreter) -> pvm_lite_core::job::Job {
    interp
        .take_jobs()
        .into_iter()
        .find(|j| matches!(j.kind, JobKind::Timer { .. }))
        .expect("timer job scheduled")
}

// ─── Recording hook ───────────────────────────────────────────

#[derive(Debug, Clone)]
struct Observed {
    execution: ExecutionId,
    activity: Option<String>,
    is_active: bool,
    children: usize,
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<Observed>>,
}

impl ActivityHook for Recorder {
    fn notify(
        &self,
        interp: &mut Interpreter,
        execution: ExecutionId,
        _event: ListenerEvent,
        _listener: &str,
    ) -> anyhow::Result<()> {
        let node = interp.tree().get(execution)?;
        let observed = Observed {
            execution,
            activity: activity_name(interp, execution),
            is_active: node.is_active,
            children: node.children().len(),
        };
        self.seen
            .lock()
            .map_err(|_| anyhow!("recorder poisoned"))?
            .push(observed);
        Ok(())
    }
}

// ─── Scenarios ─────────────────────────────────────────────────

#[test]
fn test_sequential_run() {
    let mut interp = interpreter(vec![sequential()]);
    let root = started(&mut interp, "sequential");

    let node = interp.tree().get(root).unwrap();
    assert_eq!(activity_name(&interp, root).as_deref(), Some("a"));
    assert!(node.is_active && !node.is_ended);
    assert!(node.children().is_empty());

    complete(&mut interp, "a");

    let node = interp.tree().get(root).unwrap();
    assert!(node.is_ended);
    assert!(node.children().is_empty());
    assert_instances_paired(interp.history());
    assert!(matches!(
        interp.history().last(),
        Some(HistoryEvent::ProcessInstanceEnded { delete_reason: None, .. })
    ));
}

#[test]
fn test_fork_then_join() {
    let mut interp = interpreter(vec![fork_join()]);
    let root = started(&mut interp, "fork_join");

    let children = interp.tree().children(root).unwrap();
    assert_eq!(children.len(), 2);
    for &child in &children {
        let c = interp.tree().get(child).unwrap();
        assert!(c.is_concurrent && !c.is_scope && c.is_active);
    }
    assert!(!interp.tree().get(root).unwrap().is_active);

    let a = waiting_at(&interp, "a");
    interp
        .signal(a, "complete", json!({ "from_a": 1 }))
        .unwrap();
    interp.tree().check_invariants().unwrap();
    // the first arrival waits inactive at the join
    let at_join = interp.tree().get(a).unwrap();
    assert!(!at_join.is_active);
    assert_eq!(activity_name(&interp, a).as_deref(), Some("join"));
    assert_eq!(interp.tree().children(root).unwrap().len(), 2);

    complete(&mut interp, "b");

    let node = interp.tree().get(root).unwrap();
    assert!(node.children().is_empty());
    assert!(node.is_ended);
    assert_eq!(interp.tree().get_variable(root, "from_a").unwrap(), Some(json!(1)));
    assert_instances_paired(interp.history());
    let joins = interp
        .history()
        .iter()
        .filter(|e| matches!(e, HistoryEvent::ExecutionJoined { .. }))
        .count();
    assert_eq!(joins, 1);
}

#[test]
fn test_interrupting_boundary_event() {
    let recorder = Arc::new(Recorder::default());
    let mut interp = with_hook(vec![boundary(true)], recorder.clone());
    let root = started(&mut interp, "boundary");

    let children = interp.tree().children(root).unwrap();
    assert_eq!(children.len(), 1);
    let scope = children[0];
    assert_eq!(activity_name(&interp, scope).as_deref(), Some("x"));
    assert!(interp.tree().get(scope).unwrap().is_scope);

    let timer = timer_job(&mut interp);
    assert_eq!(timer.execution(), scope);
    interp.resume(&timer).unwrap();
    interp.tree().check_invariants().unwrap();

    // state at the moment the boundary event started
    let seen = recorder.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].execution, root);
    assert_eq!(seen[0].activity.as_deref(), Some("e"));
    assert!(seen[0].is_active);
    assert_eq!(seen[0].children, 0);

    assert!(interp.tree().get(scope).unwrap().is_removed());
    let node = interp.tree().get(root).unwrap();
    assert!(!node.is_ended);
    assert!(node.children().is_empty());
    assert_eq!(activity_name(&interp, root).as_deref(), Some("handle"));
    assert!(ended_activities(interp.history()).contains(&("x".to_string(), true)));

    complete(&mut interp, "handle");
    assert!(interp.tree().get(root).unwrap().is_ended);
    assert_instances_paired(interp.history());
}

#[test]
fn test_non_interrupting_boundary_event_forks() {
    let mut interp = interpreter(vec![boundary(false)]);
    let root = started(&mut interp, "boundary");
    let scope = interp.tree().children(root).unwrap()[0];

    let timer = timer_job(&mut interp);
    interp.resume(&timer).unwrap();
    interp.tree().check_invariants().unwrap();

    // x keeps running below a concurrent placeholder, `handle` runs beside it
    let children = interp.tree().children(root).unwrap();
    assert_eq!(children.len(), 2);
    let wrapper = interp.tree().parent(scope).unwrap().unwrap();
    assert!(children.contains(&wrapper));
    assert!(interp.tree().get(wrapper).unwrap().is_concurrent);
    waiting_at(&interp, "handle");

    let views = interp.activity_instance_tree(root).unwrap();
    let names: Vec<&str> = views.iter().map(|v| v.activity.as_str()).collect();
    assert!(names.contains(&"x") && names.contains(&"handle"), "{names:?}");

    complete(&mut interp, "x");
    // the last concurrent path folds back into the root
    assert!(interp.tree().children(root).unwrap().is_empty());
    assert_eq!(activity_name(&interp, root).as_deref(), Some("handle"));

    complete(&mut interp, "handle");
    assert!(interp.tree().get(root).unwrap().is_ended);
    assert_instances_paired(interp.history());
}

#[test]
fn test_interrupting_event_subprocess() {
    let mut interp = interpreter(vec![event_subprocess(true)]);
    let root = started(&mut interp, "esp_proc");
    let timer = timer_job(&mut interp);
    assert_eq!(timer.execution(), root);

    interp.resume(&timer).unwrap();
    interp.tree().check_invariants().unwrap();

    assert!(ended_activities(interp.history()).contains(&("task".to_string(), true)));
    let children = interp.tree().children(root).unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(activity_name(&interp, children[0]).as_deref(), Some("esp_task"));

    complete(&mut interp, "esp_task");
    let node = interp.tree().get(root).unwrap();
    assert!(node.is_ended && node.children().is_empty());
    assert_instances_paired(interp.history());
}

#[test]
fn test_non_interrupting_event_subprocess() {
    let mut interp = interpreter(vec![event_subprocess(false)]);
    let root = started(&mut interp, "esp_proc");
    let timer = timer_job(&mut interp);
    interp.resume(&timer).unwrap();
    interp.tree().check_invariants().unwrap();

    waiting_at(&interp, "task");
    waiting_at(&interp, "esp_task");
    assert_eq!(interp.tree().children(root).unwrap().len(), 2);
    // the event sub-process hangs below the process instance, like `task`
    let pid = interp.tree().get(root).unwrap().process_instance_id.to_string();
    assert_eq!(entered_under(interp.history(), "task"), Some(pid.clone()));
    assert_eq!(entered_under(interp.history(), "esp"), Some(pid));
    assert_eq!(
        entered_under(interp.history(), "esp_task"),
        Some(instance_of(interp.history(), "esp"))
    );

    complete(&mut interp, "esp_task");
    assert!(interp.tree().children(root).unwrap().is_empty());
    assert_eq!(activity_name(&interp, root).as_deref(), Some("task"));

    complete(&mut interp, "task");
    assert!(interp.tree().get(root).unwrap().is_ended);
    assert_instances_paired(interp.history());
}

#[test]
fn test_sub_process_leaving_over_two_flows_forks_at_process_level() {
    let mut b = DefinitionBuilder::new("split_after_sub");
    let start = b.add("start", ActivityKind::StartEvent, PROCESS_SCOPE);
    let sub = b.add("sub", ActivityKind::SubProcess, PROCESS_SCOPE);
    let a = b.add("a", ActivityKind::UserTask, PROCESS_SCOPE);
    let c = b.add("b", ActivityKind::UserTask, PROCESS_SCOPE);
    let end_a = b.add("end_a", ActivityKind::EndEvent, PROCESS_SCOPE);
    let end_b = b.add("end_b", ActivityKind::EndEvent, PROCESS_SCOPE);
    b.connect(start, sub);
    b.connect(sub, a);
    b.connect(sub, c);
    b.connect(a, end_a);
    b.connect(c, end_b);
    let sub_start = b.add("sub_start", ActivityKind::StartEvent, sub);
    let inner = b.add("inner", ActivityKind::UserTask, sub);
    let sub_end = b.add("sub_end", ActivityKind::EndEvent, sub);
    b.connect(sub_start, inner);
    b.connect(inner, sub_end);
    let mut interp = interpreter(vec![b.build().unwrap()]);

    let root = started(&mut interp, "split_after_sub");
    complete(&mut interp, "inner");

    // the root no longer runs anything itself, both paths are concurrent
    let node = interp.tree().get(root).unwrap();
    assert!(!node.is_ended && !node.is_active);
    assert_eq!(node.activity, None);
    let children = interp.tree().children(root).unwrap();
    assert_eq!(children.len(), 2);
    for name in ["a", "b"] {
        let e = waiting_at(&interp, name);
        assert!(children.contains(&e));
        assert!(interp.tree().get(e).unwrap().is_concurrent);
    }
    let pid = node.process_instance_id.to_string();
    assert_eq!(entered_under(interp.history(), "a"), Some(pid.clone()));
    assert_eq!(entered_under(interp.history(), "b"), Some(pid));

    complete(&mut interp, "a");
    let node = interp.tree().get(root).unwrap();
    assert!(!node.is_ended);
    assert!(node.children().is_empty());
    assert_eq!(waiting_at(&interp, "b"), root);

    complete(&mut interp, "b");
    assert!(interp.tree().get(root).unwrap().is_ended);
    assert_instances_paired(interp.history());
}

#[test]
fn test_scope_task_leaving_over_two_flows_stays_in_sub_process() {
    let mut b = DefinitionBuilder::new("split_in_sub");
    let start = b.add("start", ActivityKind::StartEvent, PROCESS_SCOPE);
    let sub = b.add("s", ActivityKind::SubProcess, PROCESS_SCOPE);
    let end = b.add("end", ActivityKind::EndEvent, PROCESS_SCOPE);
    b.connect(start, sub);
    b.connect(sub, end);
    let sub_start = b.add("s_start", ActivityKind::StartEvent, sub);
    let x = b.add("x", ActivityKind::UserTask, sub);
    b.attach("x_cancel", x, true);
    let a = b.add("a", ActivityKind::UserTask, sub);
    let c = b.add("b", ActivityKind::UserTask, sub);
    let a_end = b.add("a_end", ActivityKind::EndEvent, sub);
    let b_end = b.add("b_end", ActivityKind::EndEvent, sub);
    b.connect(sub_start, x);
    b.connect(x, a);
    b.connect(x, c);
    b.connect(a, a_end);
    b.connect(c, b_end);
    let mut interp = interpreter(vec![b.build().unwrap()]);

    let root = started(&mut interp, "split_in_sub");
    let x_exec = waiting_at(&interp, "x");
    let scope = interp.tree().parent(x_exec).unwrap().unwrap();
    assert_eq!(interp.tree().parent(scope).unwrap(), Some(root));

    complete(&mut interp, "x");

    // both paths fork below the sub-process scope, which stays a plain scope
    let s = interp.tree().get(scope).unwrap();
    assert!(s.is_scope && !s.is_concurrent && !s.is_active);
    assert_eq!(interp.tree().children(root).unwrap(), vec![scope]);
    let children = interp.tree().children(scope).unwrap();
    assert_eq!(children.len(), 2);
    for name in ["a", "b"] {
        let e = waiting_at(&interp, name);
        assert_eq!(interp.tree().parent(e).unwrap(), Some(scope));
        assert!(interp.tree().get(e).unwrap().is_concurrent);
    }
    let sub_instance = instance_of(interp.history(), "s");
    assert_eq!(entered_under(interp.history(), "a"), Some(sub_instance.clone()));
    assert_eq!(entered_under(interp.history(), "b"), Some(sub_instance));

    complete(&mut interp, "a");
    assert!(interp.tree().children(scope).unwrap().is_empty());
    assert_eq!(waiting_at(&interp, "b"), scope);

    complete(&mut interp, "b");
    assert!(interp.tree().get(root).unwrap().is_ended);
    assert_instances_paired(interp.history());
}

#[test]
fn test_terminate_end_cancels_sibling_paths() {
    let mut b = DefinitionBuilder::new("terminate");
    let start = b.add("start", ActivityKind::StartEvent, PROCESS_SCOPE);
    let fork = b.add("fork", ActivityKind::ParallelGateway, PROCESS_SCOPE);
    let a = b.add("a", ActivityKind::UserTask, PROCESS_SCOPE);
    let kill = b.add("kill", ActivityKind::TerminateEndEvent, PROCESS_SCOPE);
    let end = b.add("end", ActivityKind::EndEvent, PROCESS_SCOPE);
    b.connect(start, fork);
    b.connect(fork, a);
    b.connect(fork, kill);
    b.connect(a, end);
    let mut interp = interpreter(vec![b.build().unwrap()]);

    let root = started(&mut interp, "terminate");

    let node = interp.tree().get(root).unwrap();
    assert!(node.is_ended);
    assert!(node.children().is_empty());
    let ended = ended_activities(interp.history());
    assert!(ended.contains(&("a".to_string(), true)));
    assert!(ended.contains(&("kill".to_string(), false)));
    assert_instances_paired(interp.history());
}

#[test]
fn test_sub_process_completes_through_scope() {
    let mut b = DefinitionBuilder::new("nested");
    let start = b.add("start", ActivityKind::StartEvent, PROCESS_SCOPE);
    let sub = b.add("sub", ActivityKind::SubProcess, PROCESS_SCOPE);
    let end = b.add("end", ActivityKind::EndEvent, PROCESS_SCOPE);
    b.connect(start, sub);
    b.connect(sub, end);
    let sub_start = b.add("sub_start", ActivityKind::StartEvent, sub);
    let inner = b.add("inner", ActivityKind::UserTask, sub);
    let sub_end = b.add("sub_end", ActivityKind::EndEvent, sub);
    b.connect(sub_start, inner);
    b.connect(inner, sub_end);
    b.input_mapping(sub, "limit", json!(5));
    let mut interp = interpreter(vec![b.build().unwrap()]);

    let root = started(&mut interp, "nested");
    let inner_exec = waiting_at(&interp, "inner");
    assert_eq!(interp.tree().parent(inner_exec).unwrap(), Some(root));
    assert_eq!(
        interp.tree().get_variables_local(inner_exec).unwrap().get("limit"),
        Some(&json!(5))
    );
    let views = interp.activity_instance_tree(root).unwrap();
    assert!(views.iter().any(|v| v.activity == "sub"));
    assert!(views.iter().any(|v| v.activity == "inner"));

    complete(&mut interp, "inner");
    assert!(interp.tree().get(root).unwrap().is_ended);
    assert_instances_paired(interp.history());
}

#[test]
fn test_exclusive_gateway_picks_matching_branch() {
    let build = || {
        let mut b = DefinitionBuilder::new("choice");
        let start = b.add("start", ActivityKind::StartEvent, PROCESS_SCOPE);
        let gw = b.add("gw", ActivityKind::ExclusiveGateway, PROCESS_SCOPE);
        let big = b.add("big", ActivityKind::UserTask, PROCESS_SCOPE);
        let small = b.add("small", ActivityKind::UserTask, PROCESS_SCOPE);
        b.connect(start, gw);
        b.connect_when(
            gw,
            big,
            Condition {
                variable: "size".into(),
                equals: json!("big"),
            },
        );
        b.connect(gw, small);
        b.build().unwrap()
    };

    let mut interp = interpreter(vec![build()]);
    let root = interp.create_process_instance("choice").unwrap();
    interp
        .start(root, BTreeMap::from([("size".to_string(), json!("big"))]))
        .unwrap();
    assert_eq!(activity_name(&interp, root).as_deref(), Some("big"));

    let mut interp = interpreter(vec![build()]);
    let root = started(&mut interp, "choice");
    assert_eq!(activity_name(&interp, root).as_deref(), Some("small"));
}

#[test]
fn test_call_activity_returns_to_caller() {
    let mut parent = DefinitionBuilder::new("parent");
    let start = parent.add("start", ActivityKind::StartEvent, PROCESS_SCOPE);
    let call = parent.add("call", ActivityKind::CallActivity, PROCESS_SCOPE);
    let end = parent.add("end", ActivityKind::EndEvent, PROCESS_SCOPE);
    parent.connect(start, call);
    parent.connect(call, end);
    parent.called_element(call, "child");

    let mut child = DefinitionBuilder::new("child");
    let c_start = child.add("start", ActivityKind::StartEvent, PROCESS_SCOPE);
    let review = child.add("review", ActivityKind::UserTask, PROCESS_SCOPE);
    let c_end = child.add("end", ActivityKind::EndEvent, PROCESS_SCOPE);
    child.connect(c_start, review);
    child.connect(review, c_end);

    let mut interp = interpreter(vec![parent.build().unwrap(), child.build().unwrap()]);
    let root = interp.create_process_instance("parent").unwrap();
    interp
        .start(root, BTreeMap::from([("order".to_string(), json!(42))]))
        .unwrap();

    let sub = interp.tree().get(root).unwrap().sub_process_instance.unwrap();
    assert_eq!(interp.tree().get(sub).unwrap().super_execution, Some(root));
    assert_eq!(interp.tree().get_variable(sub, "order").unwrap(), Some(json!(42)));

    let review_exec = waiting_at(&interp, "review");
    interp
        .signal(review_exec, "complete", json!({ "approved": true }))
        .unwrap();

    assert!(interp.tree().get(sub).unwrap().is_ended);
    let node = interp.tree().get(root).unwrap();
    assert!(node.is_ended);
    assert_eq!(node.sub_process_instance, None);
    assert_eq!(interp.tree().get_variable(root, "approved").unwrap(), Some(json!(true)));
}

#[test]
fn test_delete_cascade_cancels_every_path() {
    let mut interp = interpreter(vec![fork_join()]);
    let root = started(&mut interp, "fork_join");
    let children = interp.tree().children(root).unwrap();

    interp.delete_cascade(root, "cancelled by operator", false, false).unwrap();

    let node = interp.tree().get(root).unwrap();
    assert!(node.is_ended && node.children().is_empty());
    for child in children {
        assert!(interp.tree().get(child).unwrap().is_removed());
    }
    let ended = ended_activities(interp.history());
    assert!(ended.contains(&("a".to_string(), true)));
    assert!(ended.contains(&("b".to_string(), true)));
    assert!(matches!(
        interp.history().last(),
        Some(HistoryEvent::ProcessInstanceEnded { delete_reason: Some(r), .. }) if r == "cancelled by operator"
    ));
    assert_instances_paired(interp.history());
}

#[test]
fn test_async_process_start_parks_untouched() {
    let mut b = DefinitionBuilder::new("async_start");
    let start = b.add("start", ActivityKind::StartEvent, PROCESS_SCOPE);
    let a = b.add("a", ActivityKind::UserTask, PROCESS_SCOPE);
    b.connect(start, a);
    b.async_before(start);
    let mut interp = interpreter(vec![b.build().unwrap()]);
    let root = interp.create_process_instance("async_start").unwrap();

    let before = serde_json::to_value(interp.tree()).unwrap();
    interp.perform_operation(AtomicOperation::ProcessStart, root).unwrap();
    assert_eq!(serde_json::to_value(interp.tree()).unwrap(), before);
    let jobs = interp.take_jobs();
    assert_eq!(jobs.len(), 1);

    // a restored tree resumes the parked operation
    let snapshot = interp.snapshot().unwrap();
    let mut restored = Interpreter::from_snapshot(
        serde_json::from_value(serde_json::to_value(&snapshot).unwrap()).unwrap(),
        vec![interp.definition("async_start").unwrap()],
        Arc::new(NoopHook),
        EngineConfig::default(),
    )
    .unwrap();
    restored.resume(&jobs[0]).unwrap();
    assert_eq!(activity_name(&restored, root).as_deref(), Some("a"));
}

#[test]
fn test_hook_failures_are_attributed() {
    struct Failing;
    impl ActivityHook for Failing {
        fn execute_service(
            &self,
            _interp: &mut Interpreter,
            _execution: ExecutionId,
            _activity: &str,
        ) -> anyhow::Result<()> {
            Err(anyhow!("downstream unavailable"))
        }
    }

    let mut b = DefinitionBuilder::new("service");
    let start = b.add("start", ActivityKind::StartEvent, PROCESS_SCOPE);
    let call = b.add("call_api", ActivityKind::ServiceTask, PROCESS_SCOPE);
    b.connect(start, call);
    let mut interp = with_hook(vec![b.build().unwrap()], Arc::new(Failing));
    let root = interp.create_process_instance("service").unwrap();

    let err = interp.start(root, BTreeMap::new()).unwrap_err();
    match err {
        EngineError::Hook {
            activity, signal, ..
        } => {
            assert_eq!(activity, "call_api");
            assert_eq!(signal, "execute");
        }
        other => panic!("expected hook error, got {other:?}"),
    }
}

#[test]
fn test_hook_may_reenter_interpreter() {
    /// Completes the sibling task as soon as the service runs.
    struct Reentrant;
    impl ActivityHook for Reentrant {
        fn execute_service(
            &self,
            interp: &mut Interpreter,
            execution: ExecutionId,
            _activity: &str,
        ) -> anyhow::Result<()> {
            interp.tree_mut().set_variable(execution, "touched", json!(true))?;
            let (sibling, _) = interp
                .waiting_executions()
                .into_iter()
                .find(|(_, a)| a == "manual")
                .ok_or_else(|| anyhow!("manual task not waiting"))?;
            interp.signal(sibling, "complete", Value::Null)?;
            Ok(())
        }
    }

    let mut b = DefinitionBuilder::new("reentrant");
    let start = b.add("start", ActivityKind::StartEvent, PROCESS_SCOPE);
    let fork = b.add("fork", ActivityKind::ParallelGateway, PROCESS_SCOPE);
    let manual = b.add("manual", ActivityKind::UserTask, PROCESS_SCOPE);
    let service = b.add("service", ActivityKind::ServiceTask, PROCESS_SCOPE);
    let join = b.add("join", ActivityKind::ParallelGateway, PROCESS_SCOPE);
    let end = b.add("end", ActivityKind::EndEvent, PROCESS_SCOPE);
    b.connect(start, fork);
    b.connect(fork, manual);
    b.connect(fork, service);
    b.connect(manual, join);
    b.connect(service, join);
    b.connect(join, end);
    let mut interp = with_hook(vec![b.build().unwrap()], Arc::new(Reentrant));

    let root = started(&mut interp, "reentrant");
    let node = interp.tree().get(root).unwrap();
    assert!(node.is_ended);
    assert_eq!(interp.tree().get_variable(root, "touched").unwrap(), Some(json!(true)));
    assert_instances_paired(interp.history());
}

#[test]
fn test_signal_on_non_waiting_execution_fails() {
    let mut interp = interpreter(vec![sequential()]);
    let root = started(&mut interp, "sequential");
    complete(&mut interp, "a");
    assert!(matches!(
        interp.signal(root, "again", Value::Null),
        Err(EngineError::NotWaiting { .. })
    ));
}

#[test]
fn test_delete_reaches_called_instance() {
    let mut parent = DefinitionBuilder::new("outer");
    let start = parent.add("start", ActivityKind::StartEvent, PROCESS_SCOPE);
    let call = parent.add("call", ActivityKind::CallActivity, PROCESS_SCOPE);
    parent.connect(start, call);
    parent.called_element(call, "inner");
    let mut child = DefinitionBuilder::new("inner");
    let c_start = child.add("start", ActivityKind::StartEvent, PROCESS_SCOPE);
    let wait = child.add("wait", ActivityKind::ReceiveTask, PROCESS_SCOPE);
    child.connect(c_start, wait);

    let mut interp = interpreter(vec![parent.build().unwrap(), child.build().unwrap()]);
    let root = started(&mut interp, "outer");
    let sub = interp.tree().get(root).unwrap().sub_process_instance.unwrap();

    interp.delete_cascade(root, "shutdown", true, true).unwrap();

    assert!(interp.tree().get(sub).unwrap().is_ended);
    assert!(interp.tree().get(root).unwrap().is_ended);
    let ended = ended_activities(interp.history());
    assert!(ended.contains(&("wait".to_string(), true)));
    assert!(ended.contains(&("call".to_string(), true)));
    let instance_ends = interp
        .history()
        .iter()
        .filter(|e| matches!(e, HistoryEvent::ProcessInstanceEnded { .. }))
        .count();
    assert_eq!(instance_ends, 2);
}
