//! Pure diff between tmux's pane list and the in-memory session map.

use std::collections::{BTreeMap, HashMap};

use super::backend::PaneInfo;
use super::{clamp_dimension, validate_session_id};

/// What the manager should change to match tmux.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Live daemon-owned sessions unknown locally.
    pub adopt: Vec<PaneInfo>,
    /// Local sessions that are gone or dead, with their exit code.
    pub drop: Vec<(String, i32)>,
    /// Local sessions whose size changed, as clamped `(id, cols, rows)`.
    pub update: Vec<(String, u16, u16)>,
    /// Dead daemon-owned sessions still present in tmux.
    pub reap: Vec<String>,
}

impl ReconcilePlan {
    /// True when nothing in the local map needs to change.
    pub fn is_settled(&self) -> bool {
        self.adopt.is_empty() && self.drop.is_empty() && self.update.is_empty()
    }
}

/// Computes the plan from a pane snapshot and the local `id -> (cols, rows)` map.
///
/// Only the first pane of each daemon-owned session counts. Sessions whose
/// name does not carry a valid id are ignored.
pub fn diff(snapshot: &[PaneInfo], local: &HashMap<String, (u16, u16)>) -> ReconcilePlan {
    let mut remote: BTreeMap<&str, &PaneInfo> = BTreeMap::new();
    for pane in snapshot {
        if let Some(id) = pane.session_id().filter(|id| validate_session_id(id)) {
            remote.entry(id).or_insert(pane);
        }
    }

    let mut plan = ReconcilePlan::default();

    for (id, pane) in &remote {
        if pane.dead {
            plan.reap.push(pane.session_name.clone());
            continue;
        }
        match local.get(*id) {
            None => plan.adopt.push((*pane).clone()),
            Some(&(cols, rows)) => {
                let size = (clamp_dimension(pane.width), clamp_dimension(pane.height));
                if (cols, rows) != size {
                    plan.update.push((id.to_string(), size.0, size.1));
                }
            }
        }
    }

    let mut dropped: Vec<(String, i32)> = local
        .keys()
        .filter_map(|id| match remote.get(id.as_str()) {
            None => Some((id.clone(), 0)),
            Some(pane) if pane.dead => Some((id.clone(), pane.dead_status.unwrap_or(0))),
            Some(_) => None,
        })
        .collect();
    dropped.sort();
    plan.drop = dropped;

    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pane(id: &str, width: u16, height: u16) -> PaneInfo {
        PaneInfo {
            session_name: format!("tether-{}", id),
            cwd: "/tmp".to_string(),
            width,
            height,
            created_secs: 1_700_000_000,
            dead: false,
            dead_status: None,
            pid: Some(100),
            cli: Some("shell".to_string()),
        }
    }

    fn dead(id: &str, status: Option<i32>) -> PaneInfo {
        PaneInfo {
            dead: true,
            dead_status: status,
            ..pane(id, 80, 24)
        }
    }

    fn local(entries: &[(&str, u16, u16)]) -> HashMap<String, (u16, u16)> {
        entries
            .iter()
            .map(|(id, c, r)| (id.to_string(), (*c, *r)))
            .collect()
    }

    #[test]
    fn test_empty_is_settled() {
        let plan = diff(&[], &HashMap::new());
        assert!(plan.is_settled());
        assert!(plan.reap.is_empty());
    }

    #[test]
    fn test_adopts_unknown_live_sessions() {
        let plan = diff(&[pane("a", 80, 24)], &HashMap::new());
        assert_eq!(plan.adopt.len(), 1);
        assert_eq!(plan.adopt[0].session_id(), Some("a"));
    }

    #[test]
    fn test_ignores_foreign_sessions() {
        let mut foreign = pane("x", 80, 24);
        foreign.session_name = "work".to_string();
        let mut invalid = pane("x", 80, 24);
        invalid.session_name = "tether-bad id".to_string();

        let plan = diff(&[foreign, invalid], &HashMap::new());
        assert!(plan.is_settled());
    }

    #[test]
    fn test_drops_missing_with_code_zero() {
        let plan = diff(&[], &local(&[("gone", 80, 24)]));
        assert_eq!(plan.drop, vec![("gone".to_string(), 0)]);
    }

    #[test]
    fn test_drops_dead_with_status_and_reaps() {
        let plan = diff(
            &[dead("a", Some(2)), dead("b", None)],
            &local(&[("a", 80, 24), ("b", 80, 24)]),
        );
        assert_eq!(plan.drop, vec![("a".to_string(), 2), ("b".to_string(), 0)]);
        assert_eq!(plan.reap, vec!["tether-a".to_string(), "tether-b".to_string()]);
        assert!(plan.adopt.is_empty());
    }

    #[test]
    fn test_dead_unknown_session_is_only_reaped() {
        let plan = diff(&[dead("z", Some(1))], &HashMap::new());
        assert!(plan.is_settled());
        assert_eq!(plan.reap, vec!["tether-z".to_string()]);
    }

    #[test]
    fn test_updates_changed_size() {
        let plan = diff(
            &[pane("a", 100, 30), pane("b", 80, 24)],
            &local(&[("a", 80, 24), ("b", 80, 24)]),
        );
        assert_eq!(plan.update, vec![("a".to_string(), 100, 30)]);
        assert!(plan.adopt.is_empty());
        assert!(plan.drop.is_empty());
    }

    #[test]
    fn test_out_of_range_pane_compares_clamped() {
        let plan = diff(
            &[pane("tiny", 5, 4), pane("huge", 900, 24)],
            &local(&[("tiny", 10, 10), ("huge", 500, 24)]),
        );
        assert!(plan.is_settled(), "clamped sizes should match: {:?}", plan);

        let plan = diff(&[pane("tiny", 5, 4)], &local(&[("tiny", 80, 24)]));
        assert_eq!(plan.update, vec![("tiny".to_string(), 10, 10)]);
    }

    #[test]
    fn test_first_pane_wins() {
        let plan = diff(&[pane("a", 100, 30), pane("a", 50, 20)], &local(&[("a", 100, 30)]));
        assert!(plan.is_settled());
    }

    #[test]
    fn test_applying_plan_is_idempotent() {
        let snapshot = vec![
            pane("keep", 120, 40),
            pane("new", 80, 24),
            dead("dying", Some(1)),
        ];
        let mut state = local(&[("keep", 80, 24), ("dying", 80, 24), ("lost", 80, 24)]);

        let plan = diff(&snapshot, &state);
        for pane in &plan.adopt {
            state.insert(
                pane.session_id().unwrap_or_default().to_string(),
                (clamp_dimension(pane.width), clamp_dimension(pane.height)),
            );
        }
        for (id, _) in &plan.drop {
            state.remove(id);
        }
        for (id, cols, rows) in &plan.update {
            state.insert(id.clone(), (*cols, *rows));
        }

        let again = diff(&snapshot, &state);
        assert!(again.is_settled(), "second pass not settled: {:?}", again);
        assert_eq!(diff(&snapshot, &state), again);
    }
}
