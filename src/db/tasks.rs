use chrono::Utc;
use sqlx::{Pool, Sqlite};

use super::models::TaskRecord;
use crate::protocol::SubmitRequest;
use crate::scheduler::state::{check_transition, TaskStatus, TaskType, TransitionError};

/// Errors from the task store that API handlers map to distinct status codes.
#[derive(Debug, thiserror::Error)]
pub enum TaskStoreError {
    #[error("task {0} not found")]
    NotFound(i64),
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

fn now_str() -> String {
    Utc::now().to_rfc3339()
}

/// Insert a freshly submitted task.
pub async fn insert(
    pool: &Pool<Sqlite>,
    task_id: i64,
    status: TaskStatus,
    req: &SubmitRequest,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO tasks (task_id, task_type, vps_backend, status, owner, owner_role, \
         required_cores, required_memory_bytes, required_gpus, target_numa_node_id, \
         target_hostname, reserved_ip, ip_reservation_token, \
         command, arguments, env_vars, working_dir, privileged, mounts, \
         container_name, registry_image, vm_image, vm_disk_size_gb, memory_mb, \
         ssh_key_mode, ssh_public_key, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(task_id)
    .bind(req.task_type.as_str())
    .bind(req.vps_backend.map(|b| b.as_str()))
    .bind(status.as_str())
    .bind(req.owner.as_deref().unwrap_or(""))
    .bind(req.owner_role.as_deref().unwrap_or("operator"))
    .bind(req.required_cores as i64)
    .bind(req.required_memory_bytes.map(|b| b as i64))
    .bind(serde_json::to_string(&req.required_gpus).unwrap_or_else(|_| "[]".into()))
    .bind(req.target_numa_node_id.map(|n| n as i64))
    .bind(&req.target_hostname)
    .bind(&req.reserved_ip)
    .bind(&req.ip_reservation_token)
    .bind(&req.command)
    .bind(serde_json::to_string(&req.arguments).unwrap_or_else(|_| "[]".into()))
    .bind(serde_json::to_string(&req.env_vars).unwrap_or_else(|_| "{}".into()))
    .bind(&req.working_dir)
    .bind(req.privileged)
    .bind(serde_json::to_string(&req.mounts).unwrap_or_else(|_| "[]".into()))
    .bind(&req.container_name)
    .bind(&req.registry_image)
    .bind(&req.vm_image)
    .bind(req.vm_disk_size_gb.map(|g| g as i64))
    .bind(req.memory_mb.map(|m| m as i64))
    .bind(req.ssh_key_mode.map(|m| m.as_str()))
    .bind(&req.ssh_public_key)
    .bind(now_str())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get(pool: &Pool<Sqlite>, task_id: i64) -> Result<Option<TaskRecord>, sqlx::Error> {
    sqlx::query_as::<_, TaskRecord>("SELECT * FROM tasks WHERE task_id = ?")
        .bind(task_id)
        .fetch_optional(pool)
        .await
}

pub async fn list(pool: &Pool<Sqlite>) -> Result<Vec<TaskRecord>, sqlx::Error> {
    sqlx::query_as::<_, TaskRecord>("SELECT * FROM tasks ORDER BY task_id DESC")
        .fetch_all(pool)
        .await
}

pub async fn list_by_status(
    pool: &Pool<Sqlite>,
    status: TaskStatus,
) -> Result<Vec<TaskRecord>, sqlx::Error> {
    sqlx::query_as::<_, TaskRecord>(
        "SELECT * FROM tasks WHERE status = ? ORDER BY task_id ASC",
    )
    .bind(status.as_str())
    .fetch_all(pool)
    .await
}

/// Tasks on a node currently holding resources (assigning/running/paused).
pub async fn active_on_node(
    pool: &Pool<Sqlite>,
    hostname: &str,
) -> Result<Vec<TaskRecord>, sqlx::Error> {
    sqlx::query_as::<_, TaskRecord>(
        "SELECT * FROM tasks WHERE assigned_node = ? \
         AND status IN ('assigning', 'running', 'paused') ORDER BY task_id ASC",
    )
    .bind(hostname)
    .fetch_all(pool)
    .await
}

/// Lost VPS tasks on a node, eligible for reclaim on re-registration.
pub async fn lost_vps_on_node(
    pool: &Pool<Sqlite>,
    hostname: &str,
) -> Result<Vec<TaskRecord>, sqlx::Error> {
    sqlx::query_as::<_, TaskRecord>(
        "SELECT * FROM tasks WHERE assigned_node = ? AND status = 'lost' \
         AND task_type = 'vps' ORDER BY task_id ASC",
    )
    .bind(hostname)
    .fetch_all(pool)
    .await
}

/// Optional result fields recorded together with a status transition.
#[derive(Debug, Default, Clone)]
pub struct ResultFields {
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub stdout_path: Option<String>,
    pub stderr_path: Option<String>,
}

/// Validated status transition. Reads the current row, checks the edge
/// against the state machine, and writes the new status plus timestamps in
/// one transaction. Returns the updated record.
pub async fn transition(
    pool: &Pool<Sqlite>,
    task_id: i64,
    to: TaskStatus,
    fields: ResultFields,
) -> Result<TaskRecord, TaskStoreError> {
    let mut tx = pool.begin().await?;

    let task = sqlx::query_as::<_, TaskRecord>("SELECT * FROM tasks WHERE task_id = ?")
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(TaskStoreError::NotFound(task_id))?;

    let from = task.status();
    let task_type = task.task_type();
    check_transition(from, to, task_type)?;

    let assigned_at = if to == TaskStatus::Assigning {
        Some(now_str())
    } else {
        task.assigned_at.clone()
    };
    let started_at = match (to, &task.started_at) {
        (TaskStatus::Running, None) => Some(now_str()),
        _ => task.started_at.clone(),
    };
    let completed_at = if to.is_terminal() {
        Some(now_str())
    } else if to == TaskStatus::Running && from == TaskStatus::Lost {
        // VPS reclaim: the task is alive again, clear the terminal stamp.
        None
    } else {
        task.completed_at.clone()
    };

    sqlx::query(
        "UPDATE tasks SET status = ?, \
         exit_code = COALESCE(?, exit_code), \
         error_message = COALESCE(?, error_message), \
         stdout_path = COALESCE(?, stdout_path), \
         stderr_path = COALESCE(?, stderr_path), \
         assigned_at = ?, started_at = ?, completed_at = ? \
         WHERE task_id = ?",
    )
    .bind(to.as_str())
    .bind(fields.exit_code)
    .bind(&fields.error_message)
    .bind(&fields.stdout_path)
    .bind(&fields.stderr_path)
    .bind(&assigned_at)
    .bind(&started_at)
    .bind(&completed_at)
    .bind(task_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    let updated = get(pool, task_id)
        .await?
        .ok_or(TaskStoreError::NotFound(task_id))?;
    Ok(updated)
}

/// Record the node a task is being dispatched to (pending -> assigning).
pub async fn assign(
    pool: &Pool<Sqlite>,
    task_id: i64,
    hostname: &str,
) -> Result<TaskRecord, TaskStoreError> {
    sqlx::query("UPDATE tasks SET assigned_node = ? WHERE task_id = ?")
        .bind(hostname)
        .bind(task_id)
        .execute(pool)
        .await?;
    transition(pool, task_id, TaskStatus::Assigning, ResultFields::default()).await
}

/// Tasks stuck in `assigning` whose dispatch is older than the cutoff.
pub async fn stale_assigning(
    pool: &Pool<Sqlite>,
    cutoff_rfc3339: &str,
) -> Result<Vec<TaskRecord>, sqlx::Error> {
    sqlx::query_as::<_, TaskRecord>(
        "SELECT * FROM tasks WHERE status = 'assigning' AND assigned_at < ?",
    )
    .bind(cutoff_rfc3339)
    .fetch_all(pool)
    .await
}

/// Increment the heartbeat-mismatch counter; returns the new value.
pub async fn bump_suspicion(pool: &Pool<Sqlite>, task_id: i64) -> Result<i64, sqlx::Error> {
    sqlx::query(
        "UPDATE tasks SET assignment_suspicion_count = assignment_suspicion_count + 1 \
         WHERE task_id = ?",
    )
    .bind(task_id)
    .execute(pool)
    .await?;
    let (count,): (i64,) = sqlx::query_as(
        "SELECT assignment_suspicion_count FROM tasks WHERE task_id = ?",
    )
    .bind(task_id)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

pub async fn clear_suspicion(pool: &Pool<Sqlite>, task_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE tasks SET assignment_suspicion_count = 0 WHERE task_id = ?")
        .bind(task_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Record SSH ports once a VPS is up (container side + host proxy side).
pub async fn set_ssh_ports(
    pool: &Pool<Sqlite>,
    task_id: i64,
    ssh_port: Option<u16>,
    host_ssh_port: Option<u16>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE tasks SET ssh_port = COALESCE(?, ssh_port), \
         host_ssh_port = COALESCE(?, host_ssh_port) WHERE task_id = ?",
    )
    .bind(ssh_port.map(|p| p as i64))
    .bind(host_ssh_port.map(|p| p as i64))
    .bind(task_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Record the overlay IP actually used by a dispatched task.
pub async fn set_reserved_ip(
    pool: &Pool<Sqlite>,
    task_id: i64,
    ip: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE tasks SET reserved_ip = ? WHERE task_id = ?")
        .bind(ip)
        .bind(task_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ---- meta: last issued task id ----

pub async fn last_task_id(pool: &Pool<Sqlite>) -> Result<u64, sqlx::Error> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT value FROM meta WHERE key = 'last_task_id'")
            .fetch_optional(pool)
            .await?;
    Ok(row
        .and_then(|(v,)| v.parse().ok())
        .unwrap_or(0))
}

pub async fn store_last_task_id(pool: &Pool<Sqlite>, id: u64) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO meta (key, value) VALUES ('last_task_id', ?) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(id.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::scheduler::state::TaskType;

    fn command_submit() -> SubmitRequest {
        SubmitRequest {
            task_type: TaskType::Command,
            vps_backend: None,
            owner: Some("alice".into()),
            owner_role: Some("operator".into()),
            required_cores: 2,
            required_memory_bytes: None,
            required_gpus: vec![],
            target_numa_node_id: None,
            target_hostname: Some("node1".into()),
            reserved_ip: None,
            ip_reservation_token: None,
            command: Some("/bin/echo".into()),
            arguments: vec!["hi".into()],
            env_vars: Default::default(),
            working_dir: None,
            privileged: false,
            mounts: vec![],
            container_name: Some("base".into()),
            registry_image: None,
            vm_image: None,
            vm_disk_size_gb: None,
            memory_mb: None,
            ssh_key_mode: None,
            ssh_public_key: None,
        }
    }

    async fn insert_pending(db: &Database, id: i64) -> TaskRecord {
        insert(&db.pool, id, TaskStatus::Pending, &command_submit())
            .await
            .unwrap();
        get(&db.pool, id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn insert_and_get_round_trip() {
        let db = Database::test_db().await;
        let task = insert_pending(&db, 100).await;
        assert_eq!(task.task_id, 100);
        assert_eq!(task.status(), TaskStatus::Pending);
        assert_eq!(task.required_cores, 2);
        assert_eq!(task.arguments(), vec!["hi"]);
        assert_eq!(task.owner, "alice");
        assert!(task.started_at.is_none());
    }

    #[tokio::test]
    async fn full_lifecycle_transitions() {
        let db = Database::test_db().await;
        insert_pending(&db, 1).await;

        let t = assign(&db.pool, 1, "node1").await.unwrap();
        assert_eq!(t.status(), TaskStatus::Assigning);
        assert_eq!(t.assigned_node.as_deref(), Some("node1"));

        let t = transition(&db.pool, 1, TaskStatus::Running, ResultFields::default())
            .await
            .unwrap();
        assert!(t.started_at.is_some());

        let t = transition(
            &db.pool,
            1,
            TaskStatus::Completed,
            ResultFields {
                exit_code: Some(0),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(t.status(), TaskStatus::Completed);
        assert_eq!(t.exit_code, Some(0));
        assert!(t.completed_at.is_some());
    }

    #[tokio::test]
    async fn terminal_status_is_frozen() {
        let db = Database::test_db().await;
        insert_pending(&db, 2).await;
        assign(&db.pool, 2, "node1").await.unwrap();
        transition(&db.pool, 2, TaskStatus::Running, ResultFields::default())
            .await
            .unwrap();
        transition(&db.pool, 2, TaskStatus::Completed, ResultFields::default())
            .await
            .unwrap();

        let err = transition(&db.pool, 2, TaskStatus::Running, ResultFields::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskStoreError::InvalidTransition(_)));

        // Status unchanged after the rejected write.
        let t = get(&db.pool, 2).await.unwrap().unwrap();
        assert_eq!(t.status(), TaskStatus::Completed);
    }

    #[tokio::test]
    async fn lost_vps_recovers_to_running() {
        let db = Database::test_db().await;
        let mut req = command_submit();
        req.task_type = TaskType::Vps;
        req.vps_backend = Some(crate::scheduler::state::VpsBackend::Docker);
        insert(&db.pool, 3, TaskStatus::Pending, &req).await.unwrap();

        assign(&db.pool, 3, "node1").await.unwrap();
        transition(&db.pool, 3, TaskStatus::Running, ResultFields::default())
            .await
            .unwrap();
        transition(&db.pool, 3, TaskStatus::Lost, ResultFields::default())
            .await
            .unwrap();

        let t = transition(&db.pool, 3, TaskStatus::Running, ResultFields::default())
            .await
            .unwrap();
        assert_eq!(t.status(), TaskStatus::Running);
        assert!(t.completed_at.is_none(), "reclaim clears the terminal stamp");
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let db = Database::test_db().await;
        let err = transition(&db.pool, 999, TaskStatus::Running, ResultFields::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskStoreError::NotFound(999)));
    }

    #[tokio::test]
    async fn suspicion_counter_accumulates_and_clears() {
        let db = Database::test_db().await;
        insert_pending(&db, 4).await;

        assert_eq!(bump_suspicion(&db.pool, 4).await.unwrap(), 1);
        assert_eq!(bump_suspicion(&db.pool, 4).await.unwrap(), 2);
        assert_eq!(bump_suspicion(&db.pool, 4).await.unwrap(), 3);

        clear_suspicion(&db.pool, 4).await.unwrap();
        assert_eq!(bump_suspicion(&db.pool, 4).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn active_on_node_filters_by_state() {
        let db = Database::test_db().await;
        insert_pending(&db, 10).await; // stays pending
        insert_pending(&db, 11).await;
        insert_pending(&db, 12).await;

        assign(&db.pool, 11, "node1").await.unwrap();
        assign(&db.pool, 12, "node2").await.unwrap();
        transition(&db.pool, 12, TaskStatus::Running, ResultFields::default())
            .await
            .unwrap();

        let on_node1 = active_on_node(&db.pool, "node1").await.unwrap();
        assert_eq!(on_node1.len(), 1);
        assert_eq!(on_node1[0].task_id, 11);

        let on_node2 = active_on_node(&db.pool, "node2").await.unwrap();
        assert_eq!(on_node2.len(), 1);
        assert_eq!(on_node2[0].task_id, 12);
    }

    #[tokio::test]
    async fn last_task_id_round_trip() {
        let db = Database::test_db().await;
        assert_eq!(last_task_id(&db.pool).await.unwrap(), 0);
        store_last_task_id(&db.pool, 42).await.unwrap();
        assert_eq!(last_task_id(&db.pool).await.unwrap(), 42);
        store_last_task_id(&db.pool, 43).await.unwrap();
        assert_eq!(last_task_id(&db.pool).await.unwrap(), 43);
    }
}
