//! Victim treatment on preemption.

use crate::config::{PreemptAction, PreemptionConfig, PreemptionRule};
use crate::task::TaskMeta;

/// Decides whether a preempted task is suspended or cancelled.
///
/// The first rule matching the (preemptor kind, victim kind) pair wins.
/// Without a rule, resumable victims are suspended and the rest cancelled.
/// A non-resumable victim is always cancelled, whatever the rules say.
#[derive(Debug, Clone, Default)]
pub struct PreemptionPolicy {
    rules: Vec<PreemptionRule>,
}

impl PreemptionPolicy {
    pub fn new(rules: Vec<PreemptionRule>) -> Self {
        Self { rules }
    }

    pub fn from_config(config: &PreemptionConfig) -> Self {
        Self::new(config.rules.clone())
    }

    pub fn decide(&self, preemptor: &TaskMeta, victim: &TaskMeta) -> PreemptAction {
        if !victim.resumable {
            return PreemptAction::Cancel;
        }
        self.rules
            .iter()
            .find(|r| r.preemptor == preemptor.kind && r.victim == victim.kind)
            .map_or(PreemptAction::Suspend, |r| r.action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskId, TaskKind};

    fn meta(kind: TaskKind, resumable: bool) -> TaskMeta {
        TaskMeta {
            id: TaskId::new(),
            name: kind.to_string(),
            kind,
            priority: 1,
            resumable,
        }
    }

    #[test]
    fn defaults_follow_resumability() {
        let policy = PreemptionPolicy::default();
        let chime = meta(TaskKind::Clip, false);
        assert_eq!(
            policy.decide(&chime, &meta(TaskKind::Playlist, true)),
            PreemptAction::Suspend
        );
        assert_eq!(
            policy.decide(&chime, &meta(TaskKind::Speech, false)),
            PreemptAction::Cancel
        );
    }

    #[test]
    fn configured_rule_cancels_playlist_for_conversation() {
        let policy = PreemptionPolicy::from_config(&PreemptionConfig::default());
        let playlist = meta(TaskKind::Playlist, true);
        assert_eq!(
            policy.decide(&meta(TaskKind::Conversation, false), &playlist),
            PreemptAction::Cancel
        );
        assert_eq!(
            policy.decide(&meta(TaskKind::Clip, false), &playlist),
            PreemptAction::Suspend
        );
    }

    #[test]
    fn suspend_rule_never_pauses_non_resumable_victim() {
        let policy = PreemptionPolicy::new(vec![PreemptionRule {
            preemptor: TaskKind::Speech,
            victim: TaskKind::Conversation,
            action: PreemptAction::Suspend,
        }]);
        assert_eq!(
            policy.decide(&meta(TaskKind::Speech, false), &meta(TaskKind::Conversation, false)),
            PreemptAction::Cancel
        );
    }

    #[test]
    fn first_matching_rule_wins() {
        let rule = |action| PreemptionRule {
            preemptor: TaskKind::Speech,
            victim: TaskKind::Playlist,
            action,
        };
        let policy = PreemptionPolicy::new(vec![rule(PreemptAction::Cancel), rule(PreemptAction::Suspend)]);
        assert_eq!(
            policy.decide(&meta(TaskKind::Speech, false), &meta(TaskKind::Playlist, true)),
            PreemptAction::Cancel
        );
    }
}
