//! Quick benchmark to track merge solver fixed-point performance as the
//! candidate pool grows. Manual timing rather than criterion, matching the
//! teacher's other template_bench.rs (no criterion dependency is carried,
//! see DESIGN.md).

use netgen::merge::{merge_identical_tasks, MergeGraph};
use netgen::plan::{InMemoryPlan, PlanBackend, Task};
use std::time::Instant;

fn build_plan(task_count: usize, model_count: usize) -> InMemoryPlan {
    let mut plan = InMemoryPlan::new();
    for i in 0..task_count {
        let handle = plan.allocate_handle();
        let model = format!("Model{}", i % model_count);
        plan.add(Task::new(handle, model, i as u64));
    }
    plan
}

fn bench_merge(task_count: usize, model_count: usize, iterations: u32) {
    let mut total = std::time::Duration::ZERO;
    let mut final_count = 0;

    for _ in 0..iterations {
        let mut plan = build_plan(task_count, model_count);
        let mut graph = MergeGraph::new();

        let start = Instant::now();
        merge_identical_tasks(&mut plan, &mut graph).expect("merge solver does not fail on uniform tasks");
        total += start.elapsed();

        final_count = plan.all_handles().len();
    }

    let per_run = total / iterations;
    println!(
        "{task_count:>6} tasks / {model_count:>3} models -> {final_count:>3} survivors, avg {per_run:?} over {iterations} runs"
    );
}

fn main() {
    println!("Merge Solver Fixed-Point Performance");
    println!("=====================================\n");

    for &(task_count, model_count) in &[(10, 2), (100, 5), (1_000, 20), (5_000, 50)] {
        bench_merge(task_count, model_count, 10);
    }
}
