//! Process-tree discovery and leaf-to-root termination.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),

    #[error("Refusing to signal invalid pid {0}")]
    InvalidPid(u32),

    #[error("Failed to signal pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to terminate process tree rooted at {pid}: {detail}")]
    TreeKill { pid: u32, detail: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeSignal {
    /// Cooperative shutdown request (SIGTERM).
    Terminate,
    /// Terminal interrupt (SIGINT).
    Interrupt,
    /// Forced kill (SIGKILL).
    Kill,
}

impl TreeSignal {
    pub fn is_forced(self) -> bool {
        matches!(self, TreeSignal::Kill)
    }

    #[cfg(unix)]
    pub fn as_raw(self) -> i32 {
        match self {
            TreeSignal::Terminate => libc::SIGTERM,
            TreeSignal::Interrupt => libc::SIGINT,
            TreeSignal::Kill => libc::SIGKILL,
        }
    }
}

/// Result of delivering a signal to one pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The process was already gone.
    NotFound,
}

/// What a tree kill did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeKill {
    pub signaled: Vec<u32>,
    pub skipped: Vec<u32>,
    pub failed: Vec<u32>,
}

impl TreeKill {
    pub fn is_noop(&self) -> bool {
        self.signaled.is_empty() && self.failed.is_empty()
    }
}

/// OS process table capability used by the terminator.
pub trait ProcessTable: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;

    /// Direct children of `pid`. Empty when `pid` is gone.
    fn children_of(&self, pid: u32) -> Vec<u32>;

    /// Parent to children map from a single read of the table. Tables that
    /// return `Some` are walked from this snapshot instead of `children_of`.
    fn children_map(&self) -> Option<HashMap<u32, Vec<u32>>> {
        None
    }

    fn send_signal(&self, pid: u32, signal: TreeSignal) -> Result<Delivery, TreeError>;

    /// Platforms with a single kill-with-descendants primitive return `Some`.
    fn kill_tree_native(
        &self,
        _root: u32,
        _signal: TreeSignal,
    ) -> Option<Result<TreeKill, TreeError>> {
        None
    }
}

/// Breadth-first walk from `root`, flattened so every child precedes its parent.
///
/// Returns an empty list when the root is not running.
pub fn collect_tree(table: &dyn ProcessTable, root: u32) -> Vec<u32> {
    if !table.is_alive(root) {
        return Vec::new();
    }

    let snapshot = table.children_map();
    let children = |pid: u32| match &snapshot {
        Some(map) => map.get(&pid).cloned().unwrap_or_default(),
        None => table.children_of(pid),
    };

    let mut visited = HashSet::from([root]);
    let mut order = vec![root];
    let mut queue = VecDeque::from([root]);

    while let Some(pid) = queue.pop_front() {
        for child in children(pid) {
            if visited.insert(child) {
                order.push(child);
                queue.push_back(child);
            }
        }
    }

    order.reverse();
    order
}

/// Signal `root` and all of its descendants, leaves first.
///
/// Already-exited processes are skipped. Calling this on a dead tree is a no-op.
pub fn kill_process_tree(
    table: &dyn ProcessTable,
    root: u32,
    signal: TreeSignal,
) -> Result<TreeKill, TreeError> {
    if let Some(result) = table.kill_tree_native(root, signal) {
        return result;
    }

    let mut report = TreeKill::default();
    for pid in collect_tree(table, root) {
        match table.send_signal(pid, signal) {
            Ok(Delivery::Sent) => report.signaled.push(pid),
            Ok(Delivery::NotFound) => report.skipped.push(pid),
            Err(TreeError::Unsupported(what)) => return Err(TreeError::Unsupported(what)),
            Err(e) => {
                warn!("{e}");
                report.failed.push(pid);
            }
        }
    }

    debug!(
        root,
        ?signal,
        signaled = ?report.signaled,
        skipped = ?report.skipped,
        "Process tree signaled"
    );
    Ok(report)
}

/// [`kill_process_tree`] on tokio's blocking pool.
pub async fn kill_process_tree_blocking(
    table: Arc<dyn ProcessTable>,
    root: u32,
    signal: TreeSignal,
) -> Result<TreeKill, TreeError> {
    tokio::task::spawn_blocking(move || kill_process_tree(table.as_ref(), root, signal))
        .await
        .map_err(|e| TreeError::TreeKill {
            pid: root,
            detail: e.to_string(),
        })?
}

/// [`ProcessTable::is_alive`] on tokio's blocking pool. A failed query counts
/// as not running.
pub async fn is_alive_blocking(table: Arc<dyn ProcessTable>, pid: u32) -> bool {
    tokio::task::spawn_blocking(move || table.is_alive(pid))
        .await
        .unwrap_or(false)
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use super::*;

    /// In-memory process table. Processes die on `Kill`, and on `Terminate`
    /// unless marked stubborn.
    #[derive(Default)]
    pub struct FakeTable {
        state: Mutex<FakeState>,
    }

    #[derive(Default)]
    struct FakeState {
        parents: HashMap<u32, u32>,
        alive: HashSet<u32>,
        stubborn: HashSet<u32>,
        log: Vec<(u32, TreeSignal)>,
    }

    impl FakeTable {
        pub fn with_tree(edges: &[(u32, u32)], roots: &[u32]) -> Self {
            let table = Self::default();
            {
                let mut s = table.state.lock().unwrap();
                for &root in roots {
                    s.alive.insert(root);
                }
                for &(parent, child) in edges {
                    s.parents.insert(child, parent);
                    s.alive.insert(parent);
                    s.alive.insert(child);
                }
            }
            table
        }

        pub fn stubborn(self, pid: u32) -> Self {
            self.state.lock().unwrap().stubborn.insert(pid);
            self
        }

        pub fn log(&self) -> Vec<(u32, TreeSignal)> {
            self.state.lock().unwrap().log.clone()
        }

        pub fn signals_for(&self, pid: u32) -> Vec<TreeSignal> {
            self.log()
                .into_iter()
                .filter(|(p, _)| *p == pid)
                .map(|(_, s)| s)
                .collect()
        }
    }

    impl ProcessTable for FakeTable {
        fn is_alive(&self, pid: u32) -> bool {
            self.state.lock().unwrap().alive.contains(&pid)
        }

        fn children_of(&self, pid: u32) -> Vec<u32> {
            let s = self.state.lock().unwrap();
            let mut children: Vec<u32> = s
                .parents
                .iter()
                .filter(|(child, parent)| **parent == pid && s.alive.contains(child))
                .map(|(child, _)| *child)
                .collect();
            children.sort_unstable();
            children
        }

        fn send_signal(&self, pid: u32, signal: TreeSignal) -> Result<Delivery, TreeError> {
            let mut s = self.state.lock().unwrap();
            if !s.alive.contains(&pid) {
                return Ok(Delivery::NotFound);
            }
            s.log.push((pid, signal));
            if signal.is_forced() || !s.stubborn.contains(&pid) {
                s.alive.remove(&pid);
            }
            Ok(Delivery::Sent)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeTable;
    use super::*;

    fn position(log: &[(u32, TreeSignal)], pid: u32) -> usize {
        log.iter().position(|(p, _)| *p == pid).unwrap()
    }

    #[test]
    fn chain_is_signaled_leaf_first() {
        // A(1) -> B(2) -> C(3)
        let table = FakeTable::with_tree(&[(1, 2), (2, 3)], &[]);
        let report = kill_process_tree(&table, 1, TreeSignal::Terminate).unwrap();

        assert_eq!(report.signaled, vec![3, 2, 1]);
        let order: Vec<u32> = table.log().iter().map(|(p, _)| *p).collect();
        assert_eq!(order, vec![3, 2, 1]);
    }

    #[test]
    fn every_child_precedes_its_parent_in_wide_trees() {
        let edges = [(1, 2), (1, 3), (2, 4), (2, 5), (3, 6), (6, 7), (5, 8)];
        let table = FakeTable::with_tree(&edges, &[]);
        kill_process_tree(&table, 1, TreeSignal::Kill).unwrap();

        let log = table.log();
        assert_eq!(log.len(), 8);
        for (parent, child) in edges {
            assert!(
                position(&log, child) < position(&log, parent),
                "{child} should be signaled before {parent}: {log:?}"
            );
        }
    }

    #[test]
    fn second_kill_on_dead_tree_sends_nothing() {
        let table = FakeTable::with_tree(&[(10, 11), (11, 12)], &[]);
        kill_process_tree(&table, 10, TreeSignal::Kill).unwrap();
        let first = table.log().len();

        let again = kill_process_tree(&table, 10, TreeSignal::Kill).unwrap();
        assert!(again.is_noop());
        assert_eq!(table.log().len(), first);
    }

    #[test]
    fn unrelated_processes_are_untouched() {
        let table = FakeTable::with_tree(&[(1, 2), (50, 51)], &[]);
        kill_process_tree(&table, 1, TreeSignal::Terminate).unwrap();

        assert!(table.is_alive(50));
        assert!(table.is_alive(51));
        assert!(table.signals_for(50).is_empty());
    }

    #[test]
    fn collect_tree_of_dead_root_is_empty() {
        let table = FakeTable::default();
        assert!(collect_tree(&table, 99).is_empty());
    }

    /// Child list that reports itself as a descendant, as a reused pid might.
    struct CyclicTable;

    impl ProcessTable for CyclicTable {
        fn is_alive(&self, _pid: u32) -> bool {
            true
        }

        fn children_of(&self, pid: u32) -> Vec<u32> {
            match pid {
                1 => vec![2],
                2 => vec![1, 3],
                _ => Vec::new(),
            }
        }

        fn send_signal(&self, _pid: u32, _signal: TreeSignal) -> Result<Delivery, TreeError> {
            Ok(Delivery::Sent)
        }
    }

    #[test]
    fn visited_set_guards_against_cycles() {
        assert_eq!(collect_tree(&CyclicTable, 1), vec![3, 2, 1]);
    }

    struct VanishingTable;

    impl ProcessTable for VanishingTable {
        fn is_alive(&self, _pid: u32) -> bool {
            true
        }

        fn children_of(&self, pid: u32) -> Vec<u32> {
            if pid == 1 { vec![2, 3] } else { Vec::new() }
        }

        fn send_signal(&self, pid: u32, _signal: TreeSignal) -> Result<Delivery, TreeError> {
            if pid == 2 {
                Ok(Delivery::NotFound)
            } else if pid == 3 {
                Err(TreeError::Signal {
                    pid,
                    source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
                })
            } else {
                Ok(Delivery::Sent)
            }
        }
    }

    #[test]
    fn vanished_and_failed_pids_do_not_abort_the_walk() {
        let report = kill_process_tree(&VanishingTable, 1, TreeSignal::Terminate).unwrap();
        assert_eq!(report.skipped, vec![2]);
        assert_eq!(report.failed, vec![3]);
        assert_eq!(report.signaled, vec![1]);
    }

    struct NativeTable;

    impl ProcessTable for NativeTable {
        fn is_alive(&self, _pid: u32) -> bool {
            true
        }

        fn children_of(&self, _pid: u32) -> Vec<u32> {
            panic!("native tree kill should not walk children")
        }

        fn send_signal(&self, _pid: u32, _signal: TreeSignal) -> Result<Delivery, TreeError> {
            panic!("native tree kill should not signal individually")
        }

        fn kill_tree_native(
            &self,
            root: u32,
            _signal: TreeSignal,
        ) -> Option<Result<TreeKill, TreeError>> {
            Some(Ok(TreeKill {
                signaled: vec![root],
                ..TreeKill::default()
            }))
        }
    }

    /// Answers only from a snapshot, like the OS-backed tables.
    struct SnapshotTable;

    impl ProcessTable for SnapshotTable {
        fn is_alive(&self, _pid: u32) -> bool {
            true
        }

        fn children_of(&self, _pid: u32) -> Vec<u32> {
            panic!("snapshot tables should not be queried per node")
        }

        fn send_signal(&self, _pid: u32, _signal: TreeSignal) -> Result<Delivery, TreeError> {
            Ok(Delivery::Sent)
        }

        fn children_map(&self) -> Option<HashMap<u32, Vec<u32>>> {
            Some(HashMap::from([(1, vec![2, 3]), (3, vec![4]), (9, vec![10])]))
        }
    }

    #[test]
    fn walk_uses_one_snapshot() {
        assert_eq!(collect_tree(&SnapshotTable, 1), vec![4, 3, 2, 1]);
    }

    #[tokio::test]
    async fn blocking_kill_reports_like_the_sync_walk() {
        let table = Arc::new(FakeTable::with_tree(&[(1, 2)], &[]));
        let report = kill_process_tree_blocking(table.clone(), 1, TreeSignal::Terminate)
            .await
            .unwrap();
        assert_eq!(report.signaled, vec![2, 1]);
        assert!(!is_alive_blocking(table, 1).await);
    }

    #[test]
    fn native_primitive_replaces_the_walk() {
        let report = kill_process_tree(&NativeTable, 7, TreeSignal::Kill).unwrap();
        assert_eq!(report.signaled, vec![7]);
    }
}
