//! Subtask optimization rules.
//!
//! Each rule is a pure `TaskContext -> TaskContext` transform gated by a
//! condition. [`RulePipeline`] chains them in a fixed order.

use std::collections::HashSet;

use serde_json::{json, Value};

use colony_core::{Capability, DependencyType, JsonMap, Subtask, TaskContext};

pub trait OptimizationRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// Advisory only; the pipeline order is fixed.
    fn priority(&self) -> u32;

    fn condition(&self, task: &TaskContext) -> bool;

    fn optimize(&self, task: TaskContext) -> TaskContext;
}

/// Lowercased, whitespace-split token-set Jaccard similarity.
pub fn token_similarity(a: &str, b: &str) -> f64 {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    let left: HashSet<&str> = a.split_whitespace().collect();
    let right: HashSet<&str> = b.split_whitespace().collect();
    let union = left.union(&right).count();
    if union == 0 {
        return 1.0;
    }
    left.intersection(&right).count() as f64 / union as f64
}

fn push_history(metadata: &mut JsonMap, entry: &str) {
    let history = metadata
        .entry("optimization_history")
        .or_insert_with(|| Value::Array(vec![]));
    match history {
        Value::Array(items) => items.push(Value::from(entry)),
        other => *other = json!([entry]),
    }
}

fn capability_key(caps: &[Capability]) -> String {
    let mut names: Vec<&str> = caps.iter().map(Capability::as_str).collect();
    names.sort_unstable();
    names.join(",")
}

/// Collapses subtasks with near-identical descriptions.
///
/// Grouping is greedy: each ungrouped subtask, in order, collects every
/// later ungrouped subtask similar enough to it.
#[derive(Debug, Clone, Copy)]
pub struct SubtaskMergeRule {
    pub similarity_threshold: f64,
}

impl Default for SubtaskMergeRule {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.7,
        }
    }
}

impl SubtaskMergeRule {
    pub fn with_threshold(similarity_threshold: f64) -> Self {
        Self {
            similarity_threshold,
        }
    }

    fn merge_group(group_index: usize, group: Vec<Subtask>) -> Subtask {
        let descriptions: Vec<String> = group.iter().map(|s| s.description.clone()).collect();
        let complexity = group
            .iter()
            .map(|s| s.estimated_complexity)
            .max()
            .unwrap_or(1);
        let mut capabilities: Vec<Capability> = Vec::new();
        for cap in group.iter().flat_map(|s| s.required_capabilities.iter()) {
            if !capabilities.contains(cap) {
                capabilities.push(*cap);
            }
        }

        let mut iter = group.into_iter();
        // Groups are never empty; the fallback keeps this total.
        let mut merged = iter
            .next()
            .unwrap_or_else(|| Subtask::new(String::new(), String::new(), String::new()));
        merged.description = format!("Combined task: {}", descriptions.join(" AND "));
        merged.estimated_complexity = complexity;
        merged.required_capabilities = capabilities;
        merged
            .metadata
            .insert("similarity_group".into(), json!(format!("group-{group_index}")));
        merged
            .metadata
            .insert("original_description".into(), json!(descriptions.join(" | ")));
        merged
            .metadata
            .insert("original_descriptions".into(), json!(descriptions));
        push_history(&mut merged.metadata, "merged-similar-tasks");
        merged
    }
}

impl OptimizationRule for SubtaskMergeRule {
    fn name(&self) -> &'static str {
        "subtask-merge"
    }

    fn description(&self) -> &'static str {
        "Combines similar subtasks to reduce overhead"
    }

    fn priority(&self) -> u32 {
        10
    }

    fn condition(&self, task: &TaskContext) -> bool {
        task.subtasks.len() > 1
    }

    fn optimize(&self, mut task: TaskContext) -> TaskContext {
        let original = std::mem::take(&mut task.subtasks);
        let original_count = original.len();
        let mut grouped = vec![false; original.len()];
        let mut groups: Vec<(usize, Vec<usize>)> = Vec::new();

        for i in 0..original.len() {
            if grouped[i] {
                continue;
            }
            grouped[i] = true;
            let mut members = vec![i];
            for j in (i + 1)..original.len() {
                if grouped[j] {
                    continue;
                }
                let similarity =
                    token_similarity(&original[i].description, &original[j].description);
                if similarity >= self.similarity_threshold {
                    grouped[j] = true;
                    members.push(j);
                }
            }
            groups.push((i, members));
        }

        let mut slots: Vec<Option<Subtask>> = original.into_iter().map(Some).collect();
        for (group_index, members) in groups {
            let mut group: Vec<Subtask> = members
                .into_iter()
                .filter_map(|idx| slots[idx].take())
                .collect();
            if group.len() == 1 {
                task.subtasks.extend(group.pop());
            } else {
                task.subtasks.push(Self::merge_group(group_index, group));
            }
        }

        task.metadata.insert(
            "merge_optimization".into(),
            json!({
                "original_count": original_count,
                "merged_count": task.subtasks.len(),
            }),
        );
        task
    }
}

/// Orders subtasks hardest first and buckets them by capability set.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkloadBalanceRule;

impl OptimizationRule for WorkloadBalanceRule {
    fn name(&self) -> &'static str {
        "workload-balance"
    }

    fn description(&self) -> &'static str {
        "Balances workload across available agents"
    }

    fn priority(&self) -> u32 {
        8
    }

    fn condition(&self, task: &TaskContext) -> bool {
        task.subtasks.len() > 1
    }

    fn optimize(&self, mut task: TaskContext) -> TaskContext {
        let mut sorted = std::mem::take(&mut task.subtasks);
        sorted.sort_by(|a, b| b.estimated_complexity.cmp(&a.estimated_complexity));

        let mut buckets: Vec<(String, Vec<Subtask>)> = Vec::new();
        for subtask in sorted {
            let key = capability_key(&subtask.required_capabilities);
            match buckets.iter_mut().find(|(k, _)| *k == key) {
                Some((_, bucket)) => bucket.push(subtask),
                None => buckets.push((key, vec![subtask])),
            }
        }

        let group_count = buckets.len();
        for (key, bucket) in buckets {
            let size = bucket.len();
            for (order, mut subtask) in bucket.into_iter().enumerate() {
                subtask.metadata.insert("suggested_order".into(), json!(order));
                subtask.metadata.insert("group_size".into(), json!(size));
                subtask.metadata.insert("capability_group".into(), json!(key));
                push_history(&mut subtask.metadata, "workload-balanced");
                task.subtasks.push(subtask);
            }
        }

        task.metadata.insert(
            "workload_optimization".into(),
            json!({ "group_count": group_count }),
        );
        task
    }
}

/// Drops dependencies that carry no capability or conditional coupling.
#[derive(Debug, Clone, Copy, Default)]
pub struct DependencyOptimizationRule;

impl OptimizationRule for DependencyOptimizationRule {
    fn name(&self) -> &'static str {
        "dependency-optimization"
    }

    fn description(&self) -> &'static str {
        "Optimizes task dependencies for better parallelization"
    }

    fn priority(&self) -> u32 {
        9
    }

    fn condition(&self, task: &TaskContext) -> bool {
        task.subtasks.iter().any(|s| !s.dependencies.is_empty())
    }

    fn optimize(&self, mut task: TaskContext) -> TaskContext {
        let siblings: Vec<(String, Vec<Capability>)> = task
            .subtasks
            .iter()
            .map(|s| (s.id.clone(), s.required_capabilities.clone()))
            .collect();

        for subtask in &mut task.subtasks {
            let original = subtask.dependencies.len();
            let own_caps = subtask.required_capabilities.clone();
            subtask.dependencies.retain(|dep| {
                if dep.kind == DependencyType::Conditional {
                    return true;
                }
                siblings
                    .iter()
                    .find(|(id, _)| *id == dep.task_id)
                    .map(|(_, caps)| caps.iter().any(|c| own_caps.contains(c)))
                    .unwrap_or(false)
            });
            let removed = original - subtask.dependencies.len();
            subtask.metadata.insert(
                "dependency_optimization".into(),
                json!({
                    "original_dependencies": original,
                    "removed_dependencies": removed,
                }),
            );
            push_history(&mut subtask.metadata, "dependencies-optimized");
        }
        task
    }
}

/// Dependency pruning, then merging, then balancing; each only when its
/// condition holds.
pub struct RulePipeline {
    rules: Vec<Box<dyn OptimizationRule>>,
}

impl Default for RulePipeline {
    fn default() -> Self {
        Self::with_merge_threshold(SubtaskMergeRule::default().similarity_threshold)
    }
}

impl RulePipeline {
    pub fn with_merge_threshold(threshold: f64) -> Self {
        Self {
            rules: vec![
                Box::new(DependencyOptimizationRule),
                Box::new(SubtaskMergeRule::with_threshold(threshold)),
                Box::new(WorkloadBalanceRule),
            ],
        }
    }

    pub fn rules(&self) -> impl Iterator<Item = &dyn OptimizationRule> {
        self.rules.iter().map(|r| r.as_ref())
    }

    pub fn apply(&self, mut task: TaskContext) -> TaskContext {
        let mut applied = Vec::new();
        for rule in &self.rules {
            if rule.condition(&task) {
                task = rule.optimize(task);
                applied.push(rule.name());
            }
        }
        task.metadata.insert("applied_rules".into(), json!(applied));
        task
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colony_core::TaskPriority;
    use colony_test_utils::{subtask, task};

    fn with_subtasks(subtasks: Vec<Subtask>) -> TaskContext {
        task("t", TaskPriority::Medium).with_subtasks(subtasks)
    }

    #[test]
    fn similarity_is_token_jaccard() {
        assert_eq!(token_similarity("fetch user data", "fetch user records"), 0.5);
        assert_eq!(token_similarity("Fetch  USER data", "fetch user data"), 1.0);
        assert!((token_similarity("fetch the user data", "fetch the user data now") - 0.8).abs() < 1e-9);
    }

    #[test]
    fn merge_collapses_similar_and_keeps_outliers() {
        let input = with_subtasks(vec![
            subtask("s1", "t", "fetch the user data", &[Capability::DataProcessing])
                .with_complexity(3),
            subtask("s2", "t", "compile quarterly report", &[Capability::Analysis]),
            subtask("s3", "t", "fetch the user data now", &[Capability::Analysis, Capability::DataProcessing])
                .with_complexity(5),
        ]);
        let out = SubtaskMergeRule::default().optimize(input);

        assert_eq!(out.subtasks.len(), 2);
        let merged = &out.subtasks[0];
        assert_eq!(merged.id, "s1");
        assert_eq!(
            merged.description,
            "Combined task: fetch the user data AND fetch the user data now"
        );
        assert_eq!(merged.estimated_complexity, 5);
        assert_eq!(
            merged.required_capabilities,
            vec![Capability::DataProcessing, Capability::Analysis]
        );
        assert_eq!(merged.metadata["similarity_group"], "group-0");
        assert_eq!(merged.metadata["original_descriptions"].as_array().unwrap().len(), 2);

        let kept = &out.subtasks[1];
        assert_eq!(kept.description, "compile quarterly report");
        assert!(kept.metadata.is_empty());
        assert_eq!(out.metadata["merge_optimization"]["merged_count"], 2);
    }

    #[test]
    fn merge_threshold_is_configurable() {
        let input = with_subtasks(vec![
            subtask("s1", "t", "fetch user data", &[]),
            subtask("s2", "t", "fetch user records", &[]),
            subtask("s3", "t", "compile quarterly report", &[]),
        ]);
        assert_eq!(SubtaskMergeRule::default().optimize(input.clone()).subtasks.len(), 3);
        let out = SubtaskMergeRule::with_threshold(0.5).optimize(input);
        assert_eq!(out.subtasks.len(), 2);
        assert_eq!(out.subtasks[1].description, "compile quarterly report");
    }

    #[test]
    fn merge_is_deterministic_and_single_element_is_identity() {
        let input = with_subtasks(vec![
            subtask("a", "t", "scan logs for errors", &[]),
            subtask("b", "t", "scan logs for errors today", &[]),
            subtask("c", "t", "scan logs", &[]),
        ]);
        let rule = SubtaskMergeRule::default();
        let first: Vec<_> = rule.optimize(input.clone()).subtasks.into_iter().map(|s| s.description).collect();
        let second: Vec<_> = rule.optimize(input).subtasks.into_iter().map(|s| s.description).collect();
        assert_eq!(first, second);

        let single = with_subtasks(vec![subtask("a", "t", "only", &[])]);
        assert!(!rule.condition(&single));
        let out = rule.optimize(single);
        assert_eq!(out.subtasks.len(), 1);
        assert_eq!(out.subtasks[0].description, "only");
    }

    #[test]
    fn balance_orders_by_complexity_and_groups_capabilities() {
        let input = with_subtasks(vec![
            subtask("easy", "t", "x", &[Capability::Review]).with_complexity(1),
            subtask("hard", "t", "y", &[Capability::Analysis, Capability::Review]).with_complexity(9),
            subtask("mid", "t", "z", &[Capability::Review]).with_complexity(4),
            subtask("hard2", "t", "w", &[Capability::Review, Capability::Analysis]).with_complexity(9),
        ]);
        let out = WorkloadBalanceRule.optimize(input);
        let ids: Vec<_> = out.subtasks.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["hard", "hard2", "mid", "easy"]);
        assert_eq!(out.subtasks[0].metadata["capability_group"], "analysis,review");
        assert_eq!(out.subtasks[1].metadata["suggested_order"], 1);
        assert_eq!(out.subtasks[3].metadata["group_size"], 2);
        assert_eq!(out.subtasks[3].metadata["optimization_history"], json!(["workload-balanced"]));
        assert_eq!(out.metadata["workload_optimization"]["group_count"], 2);
    }

    #[test]
    fn dependency_rule_keeps_only_load_bearing_edges() {
        let input = with_subtasks(vec![
            subtask("load", "t", "load", &[Capability::DataProcessing]),
            subtask("plan", "t", "plan", &[Capability::Planning]),
            subtask("clean", "t", "clean", &[Capability::DataProcessing])
                .depends_on("load", DependencyType::Sequential)
                .depends_on("plan", DependencyType::Sequential)
                .depends_on("plan", DependencyType::Conditional)
                .depends_on("elsewhere", DependencyType::Optional),
        ]);
        let rule = DependencyOptimizationRule;
        assert!(rule.condition(&input));
        let out = rule.optimize(input);
        let clean = &out.subtasks[2];
        let kept: Vec<_> = clean.dependencies.iter().map(|d| (d.task_id.as_str(), d.kind)).collect();
        assert_eq!(
            kept,
            [("load", DependencyType::Sequential), ("plan", DependencyType::Conditional)]
        );
        assert_eq!(clean.metadata["dependency_optimization"]["removed_dependencies"], 2);
        assert_eq!(clean.metadata["dependency_optimization"]["original_dependencies"], 4);
    }

    #[test]
    fn pipeline_records_applied_rules() {
        let pipeline = RulePipeline::default();
        let input = with_subtasks(vec![
            subtask("a", "t", "fetch the user data", &[]),
            subtask("b", "t", "fetch the user data now", &[]),
        ]);
        let out = pipeline.apply(input);
        assert_eq!(out.subtasks.len(), 1);
        assert_eq!(out.metadata["applied_rules"], json!(["subtask-merge"]));

        let names: Vec<_> = pipeline.rules().map(|r| r.name()).collect();
        assert_eq!(names, ["dependency-optimization", "subtask-merge", "workload-balance"]);

        let bare = pipeline.apply(task("plain", TaskPriority::Low));
        assert_eq!(bare.metadata["applied_rules"], json!([]));
    }
}
