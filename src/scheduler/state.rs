use serde::{Deserialize, Serialize};

/// Lifecycle states of a task.
///
/// Serialized snake_case everywhere (API bodies, DB `status` column).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    PendingApproval,
    Pending,
    Assigning,
    Running,
    Paused,
    Stopped,
    Completed,
    Failed,
    Killed,
    KilledOom,
    Lost,
    Rejected,
}

/// What kind of work a task represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Command,
    Vps,
}

/// Backend for VPS tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VpsBackend {
    Docker,
    Qemu,
}

/// Rejected state transition.
#[derive(Debug, thiserror::Error)]
#[error("invalid transition {from} -> {to}")]
pub struct TransitionError {
    pub from: TaskStatus,
    pub to: TaskStatus,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::PendingApproval => "pending_approval",
            TaskStatus::Pending => "pending",
            TaskStatus::Assigning => "assigning",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Stopped => "stopped",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Killed => "killed",
            TaskStatus::KilledOom => "killed_oom",
            TaskStatus::Lost => "lost",
            TaskStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<TaskStatus> {
        Some(match s {
            "pending_approval" => TaskStatus::PendingApproval,
            "pending" => TaskStatus::Pending,
            "assigning" => TaskStatus::Assigning,
            "running" => TaskStatus::Running,
            "paused" => TaskStatus::Paused,
            "stopped" => TaskStatus::Stopped,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            "killed" => TaskStatus::Killed,
            "killed_oom" => TaskStatus::KilledOom,
            "lost" => TaskStatus::Lost,
            "rejected" => TaskStatus::Rejected,
            _ => return None,
        })
    }

    /// Terminal states are write-once, with a single carve-out: a lost VPS
    /// may come back as running when its runner re-reports it.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::Killed
                | TaskStatus::KilledOom
                | TaskStatus::Rejected
                | TaskStatus::Stopped
                | TaskStatus::Lost
        )
    }

    /// States whose node resources are still accounted as allocated.
    pub fn holds_resources(&self) -> bool {
        matches!(
            self,
            TaskStatus::Assigning | TaskStatus::Running | TaskStatus::Paused
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Command => "command",
            TaskType::Vps => "vps",
        }
    }

    pub fn parse(s: &str) -> Option<TaskType> {
        match s {
            "command" => Some(TaskType::Command),
            "vps" => Some(TaskType::Vps),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl VpsBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            VpsBackend::Docker => "docker",
            VpsBackend::Qemu => "qemu",
        }
    }

    pub fn parse(s: &str) -> Option<VpsBackend> {
        match s {
            "docker" => Some(VpsBackend::Docker),
            "qemu" => Some(VpsBackend::Qemu),
            _ => None,
        }
    }
}

impl std::fmt::Display for VpsBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validate a status transition for the given task type.
///
/// The edge set mirrors the scheduler's lifecycle: submission routes to
/// `pending_approval` or `pending`, dispatch moves through `assigning` to
/// `running`, runners report terminal outcomes, the heartbeat scanner
/// demotes to `lost`, and a lost VPS may be reclaimed to `running`.
pub fn check_transition(
    from: TaskStatus,
    to: TaskStatus,
    task_type: TaskType,
) -> Result<(), TransitionError> {
    use TaskStatus::*;

    let allowed = match (from, to) {
        (PendingApproval, Pending) | (PendingApproval, Rejected) => true,
        (Pending, Assigning) => true,
        // A pending task can fail before dispatch (no node fits, reservation
        // mismatch, pool exhausted).
        (Pending, Failed) | (Pending, Rejected) => true,
        (Assigning, Running) => true,
        (Assigning, Failed) | (Assigning, Lost) => true,
        (Running, Completed)
        | (Running, Failed)
        | (Running, Killed)
        | (Running, KilledOom)
        | (Running, Lost) => true,
        (Running, Stopped) => task_type == TaskType::Vps,
        (Running, Paused) | (Paused, Running) => true,
        (Paused, Killed) | (Paused, Lost) | (Paused, Stopped) => true,
        // VPS recovery: the runner came back and still reports the task.
        (Lost, Running) => task_type == TaskType::Vps,
        // A stopped VPS can be restarted.
        (Stopped, Assigning) | (Stopped, Running) => task_type == TaskType::Vps,
        _ => false,
    };

    if allowed {
        Ok(())
    } else {
        Err(TransitionError { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TaskStatus::*;

    #[test]
    fn status_string_round_trip() {
        let all = [
            PendingApproval,
            Pending,
            Assigning,
            Running,
            Paused,
            Stopped,
            Completed,
            Failed,
            Killed,
            KilledOom,
            Lost,
            Rejected,
        ];
        for s in all {
            assert_eq!(TaskStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(TaskStatus::parse("bogus"), None);
    }

    #[test]
    fn happy_path_command() {
        assert!(check_transition(Pending, Assigning, TaskType::Command).is_ok());
        assert!(check_transition(Assigning, Running, TaskType::Command).is_ok());
        assert!(check_transition(Running, Completed, TaskType::Command).is_ok());
    }

    #[test]
    fn approval_gate() {
        assert!(check_transition(PendingApproval, Pending, TaskType::Command).is_ok());
        assert!(check_transition(PendingApproval, Rejected, TaskType::Command).is_ok());
        assert!(check_transition(PendingApproval, Running, TaskType::Command).is_err());
    }

    #[test]
    fn terminal_states_are_write_once() {
        for terminal in [Completed, Failed, Killed, KilledOom, Rejected] {
            for target in [Pending, Assigning, Running, Completed, Failed] {
                assert!(
                    check_transition(terminal, target, TaskType::Command).is_err(),
                    "{terminal} -> {target} must be rejected"
                );
            }
        }
    }

    #[test]
    fn lost_command_task_stays_lost() {
        assert!(check_transition(Lost, Running, TaskType::Command).is_err());
    }

    #[test]
    fn lost_vps_can_recover() {
        assert!(check_transition(Lost, Running, TaskType::Vps).is_ok());
    }

    #[test]
    fn stopped_is_terminal_for_commands_only() {
        assert!(check_transition(Running, Stopped, TaskType::Vps).is_ok());
        assert!(check_transition(Running, Stopped, TaskType::Command).is_err());
        assert!(check_transition(Stopped, Running, TaskType::Vps).is_ok());
    }

    #[test]
    fn pause_resume_cycle() {
        assert!(check_transition(Running, Paused, TaskType::Vps).is_ok());
        assert!(check_transition(Paused, Running, TaskType::Vps).is_ok());
        assert!(check_transition(Paused, Completed, TaskType::Vps).is_err());
    }

    #[test]
    fn oom_only_from_running() {
        assert!(check_transition(Running, KilledOom, TaskType::Command).is_ok());
        assert!(check_transition(Pending, KilledOom, TaskType::Command).is_err());
    }

    #[test]
    fn holds_resources_matches_active_states() {
        assert!(Assigning.holds_resources());
        assert!(Running.holds_resources());
        assert!(Paused.holds_resources());
        assert!(!Pending.holds_resources());
        assert!(!Completed.holds_resources());
        assert!(!Lost.holds_resources());
    }
}
