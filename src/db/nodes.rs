use chrono::Utc;
use sqlx::{Pool, Sqlite};

use super::models::NodeRecord;
use crate::protocol::RegisterRequest;

/// Insert or refresh a node registration. Idempotent on hostname.
pub async fn upsert(pool: &Pool<Sqlite>, req: &RegisterRequest) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO nodes (hostname, url, physical_ip, total_cores, memory_total_bytes, \
         numa_topology, gpu_info, vm_capable, vfio_gpus, runner_version, status, \
         last_heartbeat, registered_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'online', ?, ?) \
         ON CONFLICT(hostname) DO UPDATE SET \
         url = excluded.url, physical_ip = excluded.physical_ip, \
         total_cores = excluded.total_cores, \
         memory_total_bytes = excluded.memory_total_bytes, \
         numa_topology = excluded.numa_topology, gpu_info = excluded.gpu_info, \
         vm_capable = excluded.vm_capable, vfio_gpus = excluded.vfio_gpus, \
         runner_version = excluded.runner_version, status = 'online', \
         last_heartbeat = excluded.last_heartbeat",
    )
    .bind(&req.hostname)
    .bind(&req.url)
    .bind(&req.physical_ip)
    .bind(req.total_cores as i64)
    .bind(req.memory_total_bytes as i64)
    .bind(serde_json::to_string(&req.numa_topology).unwrap_or_else(|_| "[]".into()))
    .bind(serde_json::to_string(&req.gpu_info).unwrap_or_else(|_| "[]".into()))
    .bind(req.vm_capable)
    .bind(serde_json::to_string(&req.vfio_gpus).unwrap_or_else(|_| "[]".into()))
    .bind(&req.runner_version)
    .bind(Utc::now().to_rfc3339())
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get(pool: &Pool<Sqlite>, hostname: &str) -> Result<Option<NodeRecord>, sqlx::Error> {
    sqlx::query_as::<_, NodeRecord>("SELECT * FROM nodes WHERE hostname = ?")
        .bind(hostname)
        .fetch_optional(pool)
        .await
}

pub async fn list(pool: &Pool<Sqlite>) -> Result<Vec<NodeRecord>, sqlx::Error> {
    sqlx::query_as::<_, NodeRecord>("SELECT * FROM nodes ORDER BY hostname")
        .fetch_all(pool)
        .await
}

pub async fn set_status(
    pool: &Pool<Sqlite>,
    hostname: &str,
    status: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE nodes SET status = ? WHERE hostname = ?")
        .bind(status)
        .bind(hostname)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn touch_heartbeat(
    pool: &Pool<Sqlite>,
    hostname: &str,
    gpu_info_json: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE nodes SET last_heartbeat = ?, status = 'online', gpu_info = ? \
         WHERE hostname = ?",
    )
    .bind(Utc::now().to_rfc3339())
    .bind(gpu_info_json)
    .bind(hostname)
    .execute(pool)
    .await?;
    Ok(())
}
