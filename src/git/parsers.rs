//! Git output parsers

use super::types::{AheadBehind, StatusEntry, WorktreeEntry};
use std::path::PathBuf;

/// Split `git worktree list --porcelain` output into one block of lines per
/// worktree. Blocks are separated by blank lines, but a `worktree ` line also
/// starts a new block so output without separators still parses.
pub fn split_into_worktree_blocks(output: &str) -> Vec<Vec<&str>> {
    let mut blocks = Vec::new();
    let mut current_block = Vec::new();

    for line in output.lines() {
        if line.is_empty() {
            if !current_block.is_empty() {
                blocks.push(std::mem::take(&mut current_block));
            }
        } else if line.starts_with("worktree ") && !current_block.is_empty() {
            blocks.push(std::mem::take(&mut current_block));
            current_block.push(line);
        } else {
            current_block.push(line);
        }
    }

    if !current_block.is_empty() {
        blocks.push(current_block);
    }

    blocks
}

/// Parse a single worktree block. Returns `None` when the block has no
/// `worktree` line.
pub fn parse_worktree_block(block: &[&str]) -> Option<WorktreeEntry> {
    let path = block
        .iter()
        .find_map(|line| line.strip_prefix("worktree "))
        .map(PathBuf::from)?;

    let mut entry = WorktreeEntry {
        path,
        head: None,
        branch: None,
        is_bare: false,
        is_detached: false,
        is_locked: false,
        is_prunable: false,
    };

    for line in block {
        if let Some(head) = line.strip_prefix("HEAD ") {
            entry.head = Some(head.to_string());
        } else if let Some(branch) = line.strip_prefix("branch ") {
            let short = branch.strip_prefix("refs/heads/").unwrap_or(branch);
            entry.branch = Some(short.to_string());
        } else if *line == "detached" {
            entry.is_detached = true;
        } else if *line == "bare" {
            entry.is_bare = true;
        } else if line.starts_with("locked") {
            entry.is_locked = true;
        } else if line.starts_with("prunable") {
            entry.is_prunable = true;
        }
    }

    Some(entry)
}

/// Parse `git worktree list --porcelain` output
pub fn parse_worktree_list(output: &str) -> Vec<WorktreeEntry> {
    split_into_worktree_blocks(output)
        .iter()
        .filter_map(|block| parse_worktree_block(block))
        .collect()
}

/// Parse `git status --porcelain` (v1) output
pub fn parse_status_porcelain(output: &str) -> Vec<StatusEntry> {
    output
        .lines()
        .filter(|line| line.len() > 3)
        .map(|line| {
            let (code, rest) = line.split_at(2);
            let path = rest.trim_start();
            // Renames are reported as "old -> new"
            let path = path.rsplit(" -> ").next().unwrap_or(path);
            StatusEntry {
                code: code.to_string(),
                path: PathBuf::from(path.trim_matches('"')),
            }
        })
        .collect()
}

/// Parse `git rev-list --left-right --count <base>...<branch>` output.
/// The left count is commits only on the base (behind), the right count is
/// commits only on the branch (ahead).
pub fn parse_left_right_count(output: &str) -> Option<AheadBehind> {
    let mut parts = output.split_whitespace();
    let behind = parts.next()?.parse().ok()?;
    let ahead = parts.next()?.parse().ok()?;
    Some(AheadBehind { ahead, behind })
}
