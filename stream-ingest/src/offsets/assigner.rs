//! Partition Assigner - deterministic mapping of topic partitions to distributed tasks
//!
//! Partition `p` belongs to the task whose effective index equals `p % effective_task_num`.
//! With a redundant leader in training mode, task 0 is a non-consuming coordinator and the
//! remaining tasks split the partitions among themselves with their index shifted down by one.
//! A job with a single task has nobody to shift to, so that task consumes everything.

use tracing::info;

use crate::error::ConfigError;
use crate::kafka::types::PartitionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskRole {
    /// Task 0: sole writer of shared checkpoint state
    Coordinator,
    Worker,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskAssignment {
    role: TaskRole,
    partitions: Vec<PartitionId>,
}

impl TaskAssignment {
    pub fn is_coordinator(&self) -> bool {
        self.role == TaskRole::Coordinator
    }

    /// Partitions this task consumes, ascending.
    pub fn partitions(&self) -> &[PartitionId] {
        &self.partitions
    }

    /// A redundant-leader coordinator owns no partitions.
    pub fn is_consuming(&self) -> bool {
        !self.partitions.is_empty()
    }
}

/// Assign partitions `[0, num_partitions)` to task `task_index` of `task_num`.
///
/// Fails when a consuming task would own no partition; callers should keep
/// `task_num <= num_partitions` (plus one for a redundant leader).
pub fn assign(
    num_partitions: usize,
    task_index: u32,
    task_num: u32,
    redundant_leader: bool,
    is_training: bool,
) -> Result<TaskAssignment, ConfigError> {
    if task_num == 0 || task_index >= task_num {
        return Err(ConfigError::Invalid(format!(
            "task index {task_index} is out of range for {task_num} tasks"
        )));
    }

    let role = if task_index == 0 {
        TaskRole::Coordinator
    } else {
        TaskRole::Worker
    };

    let redundant = redundant_leader && is_training && task_num > 1;

    if redundant && task_index == 0 {
        info!(
            task_index = task_index,
            task_num = task_num,
            "Redundant leader: coordinator task consumes no partitions"
        );
        return Ok(TaskAssignment {
            role,
            partitions: Vec::new(),
        });
    }

    let (effective_index, effective_num) = if redundant {
        (task_index - 1, task_num - 1)
    } else {
        (task_index, task_num)
    };

    let partitions: Vec<PartitionId> = (0..num_partitions)
        .filter(|p| p % effective_num as usize == effective_index as usize)
        .map(|p| p as PartitionId)
        .collect();

    if partitions.is_empty() {
        return Err(ConfigError::EmptyAssignment {
            task_index,
            task_num,
            num_partitions,
        });
    }

    info!(
        task_index = task_index,
        task_num = task_num,
        partitions = ?partitions,
        "Assigned topic partitions"
    );

    Ok(TaskAssignment { role, partitions })
}
