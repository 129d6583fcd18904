use crate::{
    error::{Result, ScanError},
    models::TaskStatus,
};

/// Lifecycle actions on a task and the states each one may leave from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Start,
    Pause,
    Resume,
    Cancel,
    Complete,
    Fail,
}

impl Action {
    pub fn name(self) -> &'static str {
        match self {
            Action::Start => "start",
            Action::Pause => "pause",
            Action::Resume => "resume",
            Action::Cancel => "cancel",
            Action::Complete => "complete",
            Action::Fail => "fail",
        }
    }

    pub fn allowed_from(self) -> &'static [TaskStatus] {
        match self {
            Action::Start => &[TaskStatus::Pending],
            Action::Pause | Action::Complete => &[TaskStatus::Running],
            Action::Resume => &[TaskStatus::Paused],
            // A stage can still be executing after its task was paused.
            Action::Cancel | Action::Fail => &[TaskStatus::Running, TaskStatus::Paused],
        }
    }

    pub fn target(self) -> TaskStatus {
        match self {
            Action::Start | Action::Resume => TaskStatus::Running,
            Action::Pause => TaskStatus::Paused,
            Action::Cancel => TaskStatus::Cancelled,
            Action::Complete => TaskStatus::Completed,
            Action::Fail => TaskStatus::Failed,
        }
    }

    pub fn check(self, from: TaskStatus) -> Result<()> {
        if self.allowed_from().contains(&from) {
            Ok(())
        } else {
            Err(ScanError::IllegalTransition {
                action: self.name(),
                from,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Paused,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    fn legal_sources(action: Action) -> Vec<TaskStatus> {
        ALL.into_iter().filter(|s| action.check(*s).is_ok()).collect()
    }

    #[test]
    fn only_pending_starts() {
        assert_eq!(legal_sources(Action::Start), [TaskStatus::Pending]);
    }

    #[test]
    fn pause_and_complete_need_running() {
        for action in [Action::Pause, Action::Complete] {
            assert_eq!(legal_sources(action), [TaskStatus::Running]);
        }
    }

    #[test]
    fn resume_needs_paused_while_cancel_and_fail_take_either() {
        assert_eq!(legal_sources(Action::Resume), [TaskStatus::Paused]);
        for action in [Action::Cancel, Action::Fail] {
            assert_eq!(
                legal_sources(action),
                [TaskStatus::Running, TaskStatus::Paused]
            );
        }
    }

    #[test]
    fn terminal_states_accept_nothing() {
        let actions = [
            Action::Start,
            Action::Pause,
            Action::Resume,
            Action::Cancel,
            Action::Complete,
            Action::Fail,
        ];
        for from in [TaskStatus::Completed, TaskStatus::Cancelled, TaskStatus::Failed] {
            for action in actions {
                assert!(action.check(from).is_err(), "{} from {from}", action.name());
            }
        }
    }

    #[test]
    fn rejection_names_action_and_state() {
        let err = Action::Pause.check(TaskStatus::Pending).unwrap_err();
        assert_eq!(
            err.to_string(),
            "illegal transition: cannot pause a task in state pending"
        );
    }
}
