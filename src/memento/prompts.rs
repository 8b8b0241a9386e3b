//! Prompt text for the two memento roles.

use std::fmt::Write as _;
use std::path::Path;

use crate::plan::{ImplementationPlan, PLAN_TOOL_NAME};

pub const PLANNER_SYSTEM_PROMPT: &str = "You are the planner in an iterative development loop. \
You have no memory of earlier iterations except the git history of the code directory. \
Inspect the code, decide the next small, self-contained increment of work toward the task, \
and submit it with the submit_implementation_plan tool. Do not modify any files yourself. \
If the task is already fully done, submit a plan with isComplete set to true and a \
completionMessage summarising the result.";

pub const IMPLEMENTER_SYSTEM_PROMPT: &str = "You are the implementer in an iterative development loop. \
Carry out the plan you are given exactly, working only inside the code directory. \
Check each validation criterion before you finish. Do not commit; the loop commits your \
changes after you are done.";

/// What the planner sees of the world for one iteration.
#[derive(Debug, Clone)]
pub struct PlannerContext<'a> {
    pub task: &'a str,
    pub iteration: u32,
    pub max_iterations: u32,
    pub code_dir: &'a Path,
    pub branch: &'a str,
    pub git_log: &'a [String],
}

pub fn planner_prompt(ctx: &PlannerContext<'_>) -> String {
    let mut prompt = String::new();
    let cap = if ctx.max_iterations == 0 {
        "unlimited".to_string()
    } else {
        ctx.max_iterations.to_string()
    };
    let _ = writeln!(prompt, "# Task\n\n{}\n", ctx.task.trim());
    let _ = writeln!(prompt, "# Iteration\n\n{} of {}\n", ctx.iteration, cap);
    let _ = writeln!(prompt, "Code directory: {}", ctx.code_dir.display());
    let _ = writeln!(prompt, "Branch: {}\n", ctx.branch);

    prompt.push_str("# Recent commits\n\n");
    if ctx.git_log.is_empty() {
        prompt.push_str("(no commits yet)\n");
    } else {
        for line in ctx.git_log {
            let _ = writeln!(prompt, "{}", line);
        }
    }

    let _ = write!(
        prompt,
        "\nPlan the next iteration and submit it with `{}`.",
        PLAN_TOOL_NAME
    );
    prompt
}

pub fn implementer_prompt(plan: &ImplementationPlan, code_dir: &Path) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "# Goal\n\n{}\n", plan.summary.trim());
    let _ = writeln!(prompt, "Work in: {}\n", code_dir.display());

    prompt.push_str("# Steps\n\n");
    for (i, step) in plan.steps.iter().enumerate() {
        let _ = writeln!(prompt, "{}. {}", i + 1, step.description.trim());
        if !step.files.is_empty() {
            let _ = writeln!(prompt, "   Files: {}", step.files.join(", "));
        }
        for command in &step.commands {
            let _ = writeln!(prompt, "   Run: `{}`", command);
        }
    }

    prompt.push_str("\n# Validation\n\n");
    for criterion in &plan.validation_criteria {
        let _ = writeln!(prompt, "- {}", criterion.trim());
    }
    prompt
}

/// `[memento] iteration N: <summary>` using the summary's first line.
pub fn commit_message(iteration: u32, summary: &str) -> String {
    let first_line = summary.lines().next().unwrap_or_default().trim();
    format!("[memento] iteration {}: {}", iteration, first_line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanStep;

    fn plan() -> ImplementationPlan {
        ImplementationPlan {
            summary: "Add a health endpoint\nwith details".to_string(),
            steps: vec![
                PlanStep {
                    description: "Add GET /health".to_string(),
                    files: vec!["src/api.rs".to_string(), "src/main.rs".to_string()],
                    commands: vec![],
                },
                PlanStep {
                    description: "Run the tests".to_string(),
                    files: vec![],
                    commands: vec!["cargo test".to_string()],
                },
            ],
            validation_criteria: vec!["GET /health returns 200".to_string()],
            is_complete: false,
            completion_message: None,
        }
    }

    #[test]
    fn planner_prompt_carries_history_and_cap() {
        let log = vec!["abc123 [memento] iteration 1: scaffold".to_string()];
        let prompt = planner_prompt(&PlannerContext {
            task: "Build a web service",
            iteration: 2,
            max_iterations: 0,
            code_dir: Path::new("/work/svc"),
            branch: "memento/svc",
            git_log: &log,
        });
        assert!(prompt.contains("Build a web service"));
        assert!(prompt.contains("2 of unlimited"));
        assert!(prompt.contains("Branch: memento/svc"));
        assert!(prompt.contains("abc123 [memento] iteration 1: scaffold"));
        assert!(prompt.contains("submit_implementation_plan"));
    }

    #[test]
    fn planner_prompt_notes_empty_history() {
        let prompt = planner_prompt(&PlannerContext {
            task: "t",
            iteration: 1,
            max_iterations: 3,
            code_dir: Path::new("/w"),
            branch: "main",
            git_log: &[],
        });
        assert!(prompt.contains("1 of 3"));
        assert!(prompt.contains("(no commits yet)"));
    }

    #[test]
    fn implementer_prompt_enumerates_steps_and_criteria() {
        let prompt = implementer_prompt(&plan(), Path::new("/work/svc"));
        assert!(prompt.contains("1. Add GET /health"));
        assert!(prompt.contains("Files: src/api.rs, src/main.rs"));
        assert!(prompt.contains("2. Run the tests"));
        assert!(prompt.contains("Run: `cargo test`"));
        assert!(prompt.contains("- GET /health returns 200"));
    }

    #[test]
    fn commit_message_uses_first_summary_line() {
        assert_eq!(
            commit_message(3, &plan().summary),
            "[memento] iteration 3: Add a health endpoint"
        );
    }
}
