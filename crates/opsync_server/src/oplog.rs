//! Server-side operation log.

use crate::error::{ServerError, ServerResult};
use opsync_protocol::{WireId, WireOperation};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Result of appending operations to a project.
#[derive(Debug, Clone, PartialEq)]
pub struct Appended {
    /// Project version after the append.
    pub version: u64,
    /// Client ids the server now holds, in request order.
    pub applied: Vec<WireId>,
    /// Operations stored by this call, with their server ids.
    pub stored: Vec<WireOperation>,
}

/// A page of history returned by [`ServerOplog::operations_since`].
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryPage {
    /// Operations after the requested version, oldest first.
    pub operations: Vec<WireOperation>,
    /// Version the page brings the reader up to.
    pub version: u64,
}

#[derive(Default)]
struct ProjectLog {
    version: u64,
    /// (version, operation) in commit order.
    operations: Vec<(u64, WireOperation)>,
    /// (device id, client id) pairs already applied.
    seen: HashSet<(String, String)>,
}

/// Server-side operation log.
///
/// The oplog maintains, per project:
/// - All operations in commit order
/// - The project version (one step per applied operation)
/// - The client ids already applied, so a retried batch is acknowledged
///   without being applied twice
pub struct ServerOplog {
    projects: RwLock<HashMap<String, ProjectLog>>,
}

impl ServerOplog {
    /// Creates a new empty oplog.
    pub fn new() -> Self {
        Self {
            projects: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the current version of a project (0 when unknown).
    pub fn version(&self, project_id: &str) -> u64 {
        self.projects
            .read()
            .get(project_id)
            .map_or(0, |log| log.version)
    }

    /// Returns the number of stored operations for a project.
    pub fn len(&self, project_id: &str) -> usize {
        self.projects
            .read()
            .get(project_id)
            .map_or(0, |log| log.operations.len())
    }

    /// Returns true if no project holds any operation.
    pub fn is_empty(&self) -> bool {
        self.projects
            .read()
            .values()
            .all(|log| log.operations.is_empty())
    }

    /// Returns known project ids, sorted.
    pub fn projects(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.projects.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Returns up to `limit` operations committed after `since`.
    ///
    /// When the page is truncated its version is that of the last returned
    /// operation, so a reader adopting it never skips history.
    pub fn operations_since(&self, project_id: &str, since: u64, limit: usize) -> HistoryPage {
        let projects = self.projects.read();
        let Some(log) = projects.get(project_id) else {
            return HistoryPage {
                operations: Vec::new(),
                version: 0,
            };
        };

        let pending: Vec<&(u64, WireOperation)> = log
            .operations
            .iter()
            .filter(|(version, _)| *version > since)
            .collect();
        let truncated = pending.len() > limit;
        let page: Vec<&(u64, WireOperation)> = pending.into_iter().take(limit).collect();

        let version = match page.last() {
            Some((last, _)) if truncated => *last,
            _ => log.version,
        };

        HistoryPage {
            operations: page.into_iter().map(|(_, op)| op.clone()).collect(),
            version,
        }
    }

    /// Appends operations from a client.
    ///
    /// With `expected` set, the append is refused when the client's version
    /// is behind the project's history.
    pub fn append(
        &self,
        project_id: &str,
        operations: Vec<WireOperation>,
        expected: Option<u64>,
    ) -> ServerResult<Appended> {
        let mut projects = self.projects.write();
        let log = projects.entry(project_id.to_string()).or_default();

        if let Some(actual) = expected {
            if actual < log.version {
                return Err(ServerError::VersionConflict {
                    expected: log.version,
                    actual,
                });
            }
        }

        let mut applied = Vec::with_capacity(operations.len());
        let mut stored = Vec::with_capacity(operations.len());

        for mut op in operations {
            let client_id = op.id.take();
            let dedupe_key = client_id
                .as_ref()
                .filter(|id| !id.is_temporary())
                .map(|id| (op.device_id.clone(), id.to_string()));

            if let Some(key) = &dedupe_key {
                if log.seen.contains(key) {
                    debug!(project_id, id = %key.1, "operation already applied");
                    applied.extend(client_id);
                    continue;
                }
            }

            log.version += 1;
            op.id = Some(WireId::from_id(log.version));
            op.project_id = Some(project_id.to_string());
            log.operations.push((log.version, op.clone()));
            stored.push(op);

            if let Some(key) = dedupe_key {
                log.seen.insert(key);
            }
            applied.extend(client_id);
        }

        Ok(Appended {
            version: log.version,
            applied,
            stored,
        })
    }
}

impl Default for ServerOplog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn make_op(id: Option<WireId>, device: &str) -> WireOperation {
        WireOperation {
            id,
            op_type: "node.update".into(),
            project_id: None,
            timeline_id: "main".into(),
            layer_id: Some("base".into()),
            payload: json!({"x": 1}),
            device_id: device.into(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn empty_oplog() {
        let oplog = ServerOplog::new();
        assert_eq!(oplog.version("p"), 0);
        assert!(oplog.is_empty());
        assert!(oplog.operations_since("p", 0, 10).operations.is_empty());
    }

    #[test]
    fn append_operations() {
        let oplog = ServerOplog::new();
        let appended = oplog
            .append(
                "p",
                vec![
                    make_op(Some(WireId::from_id(1)), "a"),
                    make_op(Some(WireId::from_id(2)), "a"),
                ],
                Some(0),
            )
            .unwrap();

        assert_eq!(appended.version, 2);
        assert_eq!(appended.applied, vec![WireId::from_id(1), WireId::from_id(2)]);
        assert_eq!(appended.stored[1].project_id.as_deref(), Some("p"));
        assert_eq!(oplog.len("p"), 2);
        assert_eq!(oplog.projects(), vec!["p".to_string()]);
    }

    #[test]
    fn stale_version_is_refused() {
        let oplog = ServerOplog::new();
        oplog
            .append("p", vec![make_op(Some(WireId::from_id(1)), "a")], Some(0))
            .unwrap();

        let err = oplog
            .append("p", vec![make_op(Some(WireId::from_id(1)), "b")], Some(0))
            .unwrap_err();
        assert!(matches!(
            err,
            ServerError::VersionConflict {
                expected: 1,
                actual: 0
            }
        ));
        assert_eq!(oplog.len("p"), 1);
    }

    #[test]
    fn projects_are_independent() {
        let oplog = ServerOplog::new();
        oplog
            .append("p", vec![make_op(Some(WireId::from_id(1)), "a")], Some(0))
            .unwrap();
        let appended = oplog
            .append("q", vec![make_op(Some(WireId::from_id(1)), "a")], Some(0))
            .unwrap();
        assert_eq!(appended.version, 1);
    }

    #[test]
    fn retried_operations_are_not_applied_twice() {
        let oplog = ServerOplog::new();
        let ops = vec![make_op(Some(WireId::from_id(7)), "a")];
        oplog.append("p", ops.clone(), Some(0)).unwrap();

        let again = oplog.append("p", ops, None).unwrap();
        assert_eq!(again.version, 1);
        assert_eq!(again.applied, vec![WireId::from_id(7)]);
        assert!(again.stored.is_empty());
    }

    #[test]
    fn temporary_ids_are_always_applied() {
        let oplog = ServerOplog::new();
        let op = make_op(Some(WireId::from("temp_x")), "a");
        oplog.append("p", vec![op.clone()], None).unwrap();
        let again = oplog.append("p", vec![op], None).unwrap();
        assert_eq!(again.version, 2);
    }

    #[test]
    fn truncated_page_reports_its_own_version() {
        let oplog = ServerOplog::new();
        let ops = (1..=5)
            .map(|i| make_op(Some(WireId::from_id(i)), "a"))
            .collect();
        oplog.append("p", ops, Some(0)).unwrap();

        let page = oplog.operations_since("p", 1, 2);
        assert_eq!(page.operations.len(), 2);
        assert_eq!(page.version, 3);

        let page = oplog.operations_since("p", page.version, 10);
        assert_eq!(page.operations.len(), 2);
        assert_eq!(page.version, 5);
    }
}
