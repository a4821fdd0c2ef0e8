use uuid::Uuid;

/// Generate a git branch name for a task: `task/<short-id>-<slug>`.
///
/// The slug keeps the branch readable in `git branch` output; the short id
/// keeps it unique enough for worktree-level collision checks to pass.
pub fn task_branch_name(task_id: &Uuid, title: &str) -> String {
    let short = short_id(task_id);
    let slug = slugify(title, 32);
    if slug.is_empty() {
        format!("task/{short}")
    } else {
        format!("task/{short}-{slug}")
    }
}

/// First 8 hex chars of a uuid, the same shorthand used in log lines.
pub fn short_id(id: &Uuid) -> String {
    id.to_string()[..8].to_string()
}

/// Lowercase, alphanumeric-and-hyphen slug, truncated to `max` chars.
pub fn slugify(input: &str, max: usize) -> String {
    let mut out = String::with_capacity(input.len().min(max));
    let mut last_hyphen = true;
    for c in input.chars() {
        if out.len() >= max {
            break;
        }
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_hyphen = false;
        } else if !last_hyphen {
            out.push('-');
            last_hyphen = true;
        }
    }
    out.trim_matches('-').to_string()
}
