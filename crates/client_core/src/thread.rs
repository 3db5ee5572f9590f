use std::collections::{HashMap, HashSet};

use shared::domain::{Message, MessageId};

/// One reply in a flattened thread.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadEntry {
    pub message: Message,
    /// 1 for direct replies to the root, 2 for replies to those, and so on.
    /// Orphans are reported at depth 1.
    pub depth: usize,
}

impl ThreadEntry {
    pub fn parent_id(&self) -> Option<MessageId> {
        self.message.parent_message_id
    }
}

/// Flattens the reply rows below `root_id` into depth-first order, siblings
/// by creation time. Rows whose parent chain never reaches the root are
/// appended at the end in creation order so every row is accounted for.
pub fn flatten_thread(root_id: MessageId, rows: &[Message]) -> Vec<ThreadEntry> {
    let mut order = (0..rows.len()).collect::<Vec<_>>();
    order.sort_by_key(|&i| (rows[i].created_at, rows[i].id));

    let mut children: HashMap<MessageId, Vec<usize>> = HashMap::new();
    for &i in &order {
        if let Some(parent) = rows[i].parent_message_id {
            children.entry(parent).or_default().push(i);
        }
    }

    let mut flattened = Vec::with_capacity(rows.len());
    let mut visited = HashSet::with_capacity(rows.len());
    let mut stack: Vec<(usize, usize)> = children
        .get(&root_id)
        .map(|direct| direct.iter().rev().map(|&i| (i, 1)).collect())
        .unwrap_or_default();

    while let Some((i, depth)) = stack.pop() {
        if !visited.insert(i) {
            continue;
        }
        flattened.push(ThreadEntry {
            message: rows[i].clone(),
            depth,
        });
        if let Some(kids) = children.get(&rows[i].id) {
            stack.extend(kids.iter().rev().map(|&k| (k, depth + 1)));
        }
    }

    for &i in &order {
        if !visited.contains(&i) && rows[i].id != root_id {
            visited.insert(i);
            flattened.push(ThreadEntry {
                message: rows[i].clone(),
                depth: 1,
            });
        }
    }

    flattened
}

/// Which threads the viewer has expanded in this session.
#[derive(Debug, Clone, Default)]
pub struct ExpansionState {
    expanded: HashSet<MessageId>,
}

impl ExpansionState {
    pub fn is_expanded(&self, root_id: MessageId) -> bool {
        self.expanded.contains(&root_id)
    }

    pub fn expand(&mut self, root_id: MessageId) {
        self.expanded.insert(root_id);
    }

    pub fn collapse(&mut self, root_id: MessageId) {
        self.expanded.remove(&root_id);
    }

    /// Flips the state and returns the new one.
    pub fn toggle(&mut self, root_id: MessageId) -> bool {
        if self.expanded.remove(&root_id) {
            false
        } else {
            self.expanded.insert(root_id);
            true
        }
    }

    pub fn clear(&mut self) {
        self.expanded.clear();
    }
}

/// What a thread shows right now.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadDisplay {
    pub root_id: MessageId,
    pub visible: Vec<ThreadEntry>,
    pub hidden_count: usize,
    pub total: usize,
    pub expanded: bool,
}

/// Collapsed threads show only their most recent reply.
pub fn display_thread(
    root_id: MessageId,
    entries: Vec<ThreadEntry>,
    expansion: &ExpansionState,
) -> ThreadDisplay {
    let total = entries.len();
    let expanded = expansion.is_expanded(root_id);
    let visible = if expanded {
        entries
    } else {
        entries
            .into_iter()
            .max_by_key(|e| (e.message.created_at, e.message.id))
            .into_iter()
            .collect()
    };
    ThreadDisplay {
        root_id,
        hidden_count: total - visible.len(),
        visible,
        total,
        expanded,
    }
}

#[cfg(test)]
#[path = "tests/thread_tests.rs"]
mod tests;
