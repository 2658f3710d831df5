//! Prompt construction for agent subprocesses.

use crate::agents::AgentProfile;
use crate::tasks::model::Task;

/// Build the stdin prompt for `task`, at most `max_chars` characters long.
pub fn build_prompt(profile: &AgentProfile, task: &Task, max_chars: usize) -> String {
    let mut prompt = String::new();
    let persona = profile.persona.trim();
    if !persona.is_empty() {
        prompt.push_str(persona);
        prompt.push_str("\n\n");
    }
    prompt.push_str(&format!(
        "You are {} ({}).\nPriority: {}\n\nTask:\n{}\n",
        profile.name,
        profile.agent_type,
        task.priority,
        task.description.trim()
    ));
    truncate_chars(&prompt, max_chars).to_string()
}

/// Longest prefix of `s` with at most `max_chars` characters.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::model::{NewTask, Priority};

    fn profile() -> AgentProfile {
        AgentProfile::new("editor", "Gianni").with_persona("You edit Italian prose.")
    }

    #[test]
    fn prompt_contains_identity_and_description() {
        let task = Task::new(NewTask::new("gianni", "editor", "Fix typos in chapter 2").with_priority(Priority::High));
        let prompt = build_prompt(&profile(), &task, 4000);
        assert!(prompt.starts_with("You edit Italian prose."));
        assert!(prompt.contains("You are Gianni (editor)"));
        assert!(prompt.contains("Priority: high"));
        assert!(prompt.contains("Fix typos in chapter 2"));
    }

    #[test]
    fn prompt_is_bounded() {
        let task = Task::new(NewTask::new("gianni", "editor", "x".repeat(10_000)));
        let prompt = build_prompt(&profile(), &task, 500);
        assert_eq!(prompt.chars().count(), 500);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let s = "caffè però così";
        let cut = truncate_chars(s, 5);
        assert_eq!(cut, "caffè");
        assert_eq!(truncate_chars(s, 100), s);
        assert_eq!(truncate_chars("", 3), "");
    }
}
