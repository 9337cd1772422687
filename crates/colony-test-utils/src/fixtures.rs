use std::path::PathBuf;

use colony_core::{Agent, Capability, DependencyType, Subtask, TaskContext, TaskPriority};

pub fn agent(id: &str, capabilities: &[Capability]) -> Agent {
    Agent::new(id, format!("Agent {id}")).with_capabilities(capabilities.to_vec())
}

/// An agent holding every capability.
pub fn generalist(id: &str) -> Agent {
    agent(id, &Capability::ALL)
}

pub fn task(id: &str, priority: TaskPriority) -> TaskContext {
    TaskContext::new(id, format!("task {id}")).with_priority(priority)
}

pub fn subtask(id: &str, parent: &str, description: &str, caps: &[Capability]) -> Subtask {
    Subtask::new(id, parent, description).with_capabilities(caps.to_vec())
}

/// A task whose single subtask depends on each of `deps`.
pub fn task_depending_on(id: &str, deps: &[&str]) -> TaskContext {
    let mut sub = Subtask::new(format!("{id}-sub"), id, "dependent work");
    for dep in deps {
        sub = sub.depends_on(*dep, DependencyType::Sequential);
    }
    TaskContext::new(id, format!("task {id}")).with_subtask(sub)
}

/// Write `contents` to `name` inside a fresh temp dir.
pub fn write_temp_file(name: &str, contents: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join(name);
    std::fs::write(&path, contents).expect("write temp file");
    (dir, path)
}
