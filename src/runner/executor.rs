use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::images::ImageSync;
use super::HostClient;
use crate::config::RunnerConfig;
use crate::protocol::{ExecuteRequest, MountSpec, TaskStatusUpdate};
use crate::scheduler::state::TaskStatus;

/// Mount point of the tunnel client binary inside every container.
pub const TUNNEL_CLIENT_MOUNT: &str = "/usr/local/bin/kohaku-tunnel";

/// In-container log directory (bind of the shared log dir).
pub const CONTAINER_LOG_DIR: &str = "/kohakuriver-logs";

/// Docker network containers join when the overlay is active.
pub const OVERLAY_DOCKER_NETWORK: &str = "kohakuriver-overlay";

pub fn command_container_name(task_id: i64) -> String {
    format!("kohakuriver-task-{task_id}")
}

/// Resolve the image reference: registry images verbatim, tarball images
/// under the `kohakuriver/{name}:base` tag that image sync maintains.
pub fn image_reference(container_name: Option<&str>, registry_image: Option<&str>) -> String {
    match (registry_image, container_name) {
        (Some(img), _) => img.to_string(),
        (None, Some(name)) => format!("kohakuriver/{name}:base"),
        (None, None) => "kohakuriver/base:base".to_string(),
    }
}

/// POSIX single-quote escaping: safe for any byte string except NUL.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | '='))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Map a container exit code to the task's terminal status.
pub fn status_for_exit_code(code: i32) -> TaskStatus {
    match code {
        0 => TaskStatus::Completed,
        137 => TaskStatus::KilledOom,
        _ => TaskStatus::Failed,
    }
}

/// The shell line executed inside the container. `exec` is mandatory: the
/// workload must replace the shell so docker's signals reach it directly.
pub fn wrap_container_command(
    command: &str,
    arguments: &[String],
    numa_node: Option<u32>,
    stdout_path: &str,
    stderr_path: &str,
) -> String {
    let mut exec_part = String::from("exec ");
    if let Some(node) = numa_node {
        exec_part.push_str(&format!("numactl --cpunodebind={node} --membind={node} "));
    }
    exec_part.push_str(&shell_quote(command));
    for arg in arguments {
        exec_part.push(' ');
        exec_part.push_str(&shell_quote(arg));
    }
    format!(
        "(nohup {TUNNEL_CLIENT_MOUNT} >/dev/null 2>&1 &) && sleep 0.1 && {exec_part} > {} 2> {}",
        shell_quote(stdout_path),
        shell_quote(stderr_path),
    )
}

/// Everything needed to assemble `docker run` arguments for one container.
pub struct LaunchPlan {
    pub container_name: String,
    pub image: String,
    pub remove_on_exit: bool,
    pub overlay_network: bool,
    pub reserved_ip: Option<String>,
    pub cpus: u32,
    pub memory_bytes: Option<u64>,
    pub gpu_indices: Vec<u32>,
    pub env: Vec<(String, String)>,
    pub mounts: Vec<MountSpec>,
    pub privileged: bool,
    pub working_dir: Option<String>,
    /// Shell line passed to `/bin/sh -c`; None runs the image default.
    pub shell_command: Option<String>,
}

/// Assemble the full argv after `docker`.
pub fn build_docker_run_args(plan: &LaunchPlan, config: &RunnerConfig) -> Vec<String> {
    let mut args: Vec<String> = vec!["run".into(), "-d".into()];
    if plan.remove_on_exit {
        args.push("--rm".into());
    }
    args.push("--name".into());
    args.push(plan.container_name.clone());

    if plan.overlay_network {
        args.push("--network".into());
        args.push(OVERLAY_DOCKER_NETWORK.into());
        if let Some(ip) = &plan.reserved_ip {
            args.push("--ip".into());
            args.push(ip.clone());
        }
    }

    if plan.cpus > 0 {
        args.push("--cpus".into());
        args.push(plan.cpus.to_string());
    }
    if let Some(bytes) = plan.memory_bytes {
        args.push("--memory".into());
        args.push(format!("{}m", bytes / (1024 * 1024)));
    }
    if !plan.gpu_indices.is_empty() {
        let csv: Vec<String> = plan.gpu_indices.iter().map(|g| g.to_string()).collect();
        args.push("--gpus".into());
        args.push(format!("\"device={}\"", csv.join(",")));
    }

    // Standard mounts: shared storage, logs, node-local scratch, then the
    // task's own binds, then the tunnel client binary (read-only).
    args.push("--mount".into());
    args.push(format!(
        "type=bind,source={},target=/shared",
        config.shared_dir.display()
    ));
    args.push("--mount".into());
    args.push(format!(
        "type=bind,source={},target={CONTAINER_LOG_DIR}",
        config.log_dir().display()
    ));
    args.push("--mount".into());
    args.push(format!(
        "type=bind,source={},target=/local_temp",
        config.local_temp_dir.display()
    ));
    for mount in &plan.mounts {
        let ro = if mount.read_only { ",readonly" } else { "" };
        args.push("--mount".into());
        args.push(format!(
            "type=bind,source={},target={}{ro}",
            mount.source, mount.target
        ));
    }
    args.push("--mount".into());
    args.push(format!(
        "type=bind,source={},target={TUNNEL_CLIENT_MOUNT},readonly",
        config.tunnel_client_path.display()
    ));

    for (key, value) in &plan.env {
        args.push("-e".into());
        args.push(format!("{key}={value}"));
    }

    if plan.privileged && config.allow_privileged {
        args.push("--privileged".into());
    } else {
        args.push("--cap-add".into());
        args.push("SYS_NICE".into());
    }

    if let Some(dir) = &plan.working_dir {
        args.push("--workdir".into());
        args.push(dir.clone());
    }

    args.push(plan.image.clone());
    if let Some(shell) = &plan.shell_command {
        args.push("/bin/sh".into());
        args.push("-c".into());
        args.push(shell.clone());
    }
    args
}

/// Environment injected into every task container.
pub fn task_environment(
    task_id: i64,
    container_id: &str,
    user_env: &HashMap<String, String>,
    numa_node: Option<u32>,
    config: &RunnerConfig,
) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = user_env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    env.sort();
    env.push(("KOHAKURIVER_TASK_ID".into(), task_id.to_string()));
    env.push(("KOHAKURIVER_LOCAL_TEMP_DIR".into(), "/local_temp".into()));
    env.push(("KOHAKURIVER_SHARED_DIR".into(), "/shared".into()));
    if let Some(node) = numa_node {
        env.push(("KOHAKURIVER_TARGET_NUMA_NODE".into(), node.to_string()));
    }
    env.push((
        "KOHAKURIVER_TUNNEL_URL".into(),
        format!(
            "{}/ws/tunnel/{container_id}",
            http_to_ws(&config.advertise_url)
        ),
    ));
    env.push(("KOHAKURIVER_CONTAINER_ID".into(), container_id.to_string()));
    env
}

fn http_to_ws(url: &str) -> String {
    let base = url.trim_end_matches('/');
    if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{base}")
    }
}

#[derive(Debug)]
struct RunningTask {
    container_name: String,
}

/// Executes command tasks as detached docker containers and tracks them in
/// an in-process store. The store is the kill-coordination point: a task
/// removed from it before `docker kill` never reports a bogus failure.
pub struct TaskExecutor {
    config: Arc<RunnerConfig>,
    images: Arc<ImageSync>,
    host: Arc<HostClient>,
    tasks: Mutex<HashMap<i64, RunningTask>>,
}

impl TaskExecutor {
    pub fn new(config: Arc<RunnerConfig>, images: Arc<ImageSync>, host: Arc<HostClient>) -> Self {
        Self {
            config,
            images,
            host,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn running_task_ids(&self) -> Vec<i64> {
        self.tasks.lock().await.keys().copied().collect()
    }

    /// Accept an execute request; the launch itself runs in the background
    /// so the dispatch HTTP call can return 202 immediately.
    pub fn spawn_execute(self: &Arc<Self>, req: ExecuteRequest) {
        let this = self.clone();
        tokio::spawn(async move {
            let task_id = req.task_id;
            if let Err(e) = this.execute(req).await {
                error!(task = task_id, error = %e, "Task launch failed");
                this.host
                    .update(TaskStatusUpdate {
                        task_id,
                        status: TaskStatus::Failed,
                        exit_code: None,
                        error_message: Some(e.to_string()),
                        stdout_path: None,
                        stderr_path: None,
                    })
                    .await;
            }
        });
    }

    async fn execute(self: &Arc<Self>, req: ExecuteRequest) -> Result<()> {
        self.images
            .ensure_synced(req.container_name.as_deref(), req.registry_image.as_deref())
            .await?;

        let container_name = command_container_name(req.task_id);
        let log_dir = self.config.log_dir();
        tokio::fs::create_dir_all(&log_dir)
            .await
            .context("create log dir")?;

        let stdout_container = format!("{CONTAINER_LOG_DIR}/{}.stdout", req.task_id);
        let stderr_container = format!("{CONTAINER_LOG_DIR}/{}.stderr", req.task_id);
        let stdout_host = log_dir.join(format!("{}.stdout", req.task_id));
        let stderr_host = log_dir.join(format!("{}.stderr", req.task_id));

        let shell = wrap_container_command(
            &req.command,
            &req.arguments,
            req.target_numa_node_id,
            &stdout_container,
            &stderr_container,
        );

        let plan = LaunchPlan {
            container_name: container_name.clone(),
            image: image_reference(req.container_name.as_deref(), req.registry_image.as_deref()),
            remove_on_exit: true,
            overlay_network: self.config.overlay_enabled,
            reserved_ip: req.reserved_ip.clone(),
            cpus: req.required_cores,
            memory_bytes: req.required_memory_bytes,
            gpu_indices: req.gpu_indices.clone(),
            env: task_environment(
                req.task_id,
                &container_name,
                &req.env_vars,
                req.target_numa_node_id,
                &self.config,
            ),
            mounts: req.mounts.clone(),
            privileged: req.privileged,
            working_dir: req.working_dir.clone(),
            shell_command: Some(shell),
        };
        let args = build_docker_run_args(&plan, &self.config);

        run_docker(&args).await.context("docker run")?;
        self.tasks.lock().await.insert(
            req.task_id,
            RunningTask {
                container_name: container_name.clone(),
            },
        );
        info!(task = req.task_id, container = %container_name, "Task container started");

        self.host
            .update(TaskStatusUpdate {
                task_id: req.task_id,
                status: TaskStatus::Running,
                exit_code: None,
                error_message: None,
                stdout_path: Some(stdout_host.display().to_string()),
                stderr_path: Some(stderr_host.display().to_string()),
            })
            .await;

        // Wait for the container and report the outcome — unless a kill
        // removed the task from the store first.
        let this = self.clone();
        let task_id = req.task_id;
        tokio::spawn(async move {
            let exit_code = wait_for_container(&container_name).await;
            if this.tasks.lock().await.remove(&task_id).is_none() {
                // Killed via the API: the kill path already reported.
                return;
            }
            let (status, code) = match exit_code {
                Ok(code) => (status_for_exit_code(code), Some(code)),
                Err(e) => {
                    warn!(task = task_id, error = %e, "Container wait failed");
                    (TaskStatus::Failed, None)
                }
            };
            let error_message = match status {
                TaskStatus::KilledOom => Some("container killed by the OOM killer".into()),
                TaskStatus::Failed => {
                    Some(format!("exit code {}", code.map_or(-1, |c| c)))
                }
                _ => None,
            };
            this.host
                .update(TaskStatusUpdate {
                    task_id,
                    status,
                    exit_code: code,
                    error_message,
                    stdout_path: Some(stdout_host.display().to_string()),
                    stderr_path: Some(stderr_host.display().to_string()),
                })
                .await;
        });
        Ok(())
    }

    /// Kill a task. The store entry is removed *before* `docker kill` so the
    /// waiter coroutine cannot race in a stale failure report. Idempotent.
    pub async fn kill(&self, task_id: i64) -> Result<()> {
        let removed = self.tasks.lock().await.remove(&task_id);
        let container = removed
            .map(|t| t.container_name)
            .unwrap_or_else(|| command_container_name(task_id));
        match run_docker(&["kill".into(), container.clone()]).await {
            Ok(_) => info!(task = task_id, container = %container, "Task killed"),
            Err(e) => warn!(task = task_id, error = %e, "docker kill (already gone?)"),
        }
        Ok(())
    }

    pub async fn pause(&self, task_id: i64) -> Result<()> {
        let container = self.container_of(task_id).await?;
        run_docker(&["pause".into(), container]).await?;
        Ok(())
    }

    pub async fn resume(&self, task_id: i64) -> Result<()> {
        let container = self.container_of(task_id).await?;
        run_docker(&["unpause".into(), container]).await?;
        Ok(())
    }

    async fn container_of(&self, task_id: i64) -> Result<String> {
        self.tasks
            .lock()
            .await
            .get(&task_id)
            .map(|t| t.container_name.clone())
            .with_context(|| format!("task {task_id} is not running here"))
    }
}

/// `docker wait` blocks until the container exits and prints the exit code.
async fn wait_for_container(container_name: &str) -> Result<i32> {
    let out = run_docker(&["wait".into(), container_name.to_string()]).await?;
    out.trim()
        .parse()
        .with_context(|| format!("unparseable docker wait output {out:?}"))
}

pub(crate) async fn run_docker(args: &[String]) -> Result<String> {
    let output = tokio::process::Command::new("docker")
        .args(args)
        .output()
        .await
        .context("failed to spawn docker")?;
    if !output.status.success() {
        anyhow::bail!(
            "docker {} failed: {}",
            args.first().map(String::as_str).unwrap_or(""),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Host path for a task's stdout/stderr files under the shared log dir.
pub fn host_log_paths(config: &RunnerConfig, task_id: i64) -> (String, String) {
    let dir = config.log_dir();
    (
        dir.join(format!("{task_id}.stdout")).display().to_string(),
        dir.join(format!("{task_id}.stderr")).display().to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RunnerConfig, RunnerFileConfig};

    fn test_config() -> RunnerConfig {
        RunnerConfig::resolve(
            RunnerFileConfig {
                hostname: Some("node1".into()),
                ..Default::default()
            },
            &|_| None,
        )
        .unwrap()
    }

    // ── shell quoting ──

    #[test]
    fn plain_words_are_not_quoted() {
        assert_eq!(shell_quote("/bin/echo"), "/bin/echo");
        assert_eq!(shell_quote("abc-123_x.y"), "abc-123_x.y");
    }

    #[test]
    fn spaces_and_specials_are_quoted() {
        assert_eq!(shell_quote("hello world"), "'hello world'");
        assert_eq!(shell_quote("a;rm -rf /"), "'a;rm -rf /'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn embedded_single_quotes_survive() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    // ── command wrapper ──

    #[test]
    fn wrapper_starts_tunnel_and_execs() {
        let line = wrap_container_command(
            "/bin/echo",
            &["hi".into()],
            None,
            "/kohakuriver-logs/1.stdout",
            "/kohakuriver-logs/1.stderr",
        );
        assert!(line.starts_with(&format!("(nohup {TUNNEL_CLIENT_MOUNT} ")));
        assert!(line.contains("&& exec /bin/echo hi "));
        assert!(line.contains("> /kohakuriver-logs/1.stdout 2> /kohakuriver-logs/1.stderr"));
    }

    #[test]
    fn wrapper_prepends_numactl_when_numa_set() {
        let line = wrap_container_command("/bin/true", &[], Some(1), "/o", "/e");
        assert!(line.contains("exec numactl --cpunodebind=1 --membind=1 /bin/true"));
    }

    #[test]
    fn wrapper_quotes_arguments() {
        let line = wrap_container_command(
            "/bin/echo",
            &["two words".into(), "$(evil)".into()],
            None,
            "/o",
            "/e",
        );
        assert!(line.contains("'two words'"));
        assert!(line.contains("'$(evil)'"));
    }

    // ── exit code mapping ──

    #[test]
    fn exit_code_table() {
        assert_eq!(status_for_exit_code(0), TaskStatus::Completed);
        assert_eq!(status_for_exit_code(137), TaskStatus::KilledOom);
        assert_eq!(status_for_exit_code(143), TaskStatus::Failed);
        assert_eq!(status_for_exit_code(1), TaskStatus::Failed);
        assert_eq!(status_for_exit_code(255), TaskStatus::Failed);
    }

    // ── image references ──

    #[test]
    fn image_reference_prefers_registry() {
        assert_eq!(
            image_reference(Some("base"), Some("ubuntu:24.04")),
            "ubuntu:24.04"
        );
        assert_eq!(image_reference(Some("pytorch"), None), "kohakuriver/pytorch:base");
    }

    // ── docker argv construction ──

    fn base_plan() -> LaunchPlan {
        LaunchPlan {
            container_name: "kohakuriver-task-42".into(),
            image: "kohakuriver/base:base".into(),
            remove_on_exit: true,
            overlay_network: true,
            reserved_ip: Some("10.128.64.5".into()),
            cpus: 2,
            memory_bytes: Some(512 * 1024 * 1024),
            gpu_indices: vec![0, 1],
            env: vec![("KOHAKURIVER_TASK_ID".into(), "42".into())],
            mounts: vec![MountSpec {
                source: "/data".into(),
                target: "/mnt/data".into(),
                read_only: true,
            }],
            privileged: false,
            working_dir: Some("/work".into()),
            shell_command: Some("exec /bin/true".into()),
        }
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn run_args_cover_the_flag_table() {
        let cfg = test_config();
        let args = build_docker_run_args(&base_plan(), &cfg);

        assert_eq!(args[0], "run");
        assert!(args.contains(&"--rm".to_string()));
        assert!(has_pair(&args, "--name", "kohakuriver-task-42"));
        assert!(has_pair(&args, "--network", OVERLAY_DOCKER_NETWORK));
        assert!(has_pair(&args, "--ip", "10.128.64.5"));
        assert!(has_pair(&args, "--cpus", "2"));
        assert!(has_pair(&args, "--memory", "512m"));
        assert!(has_pair(&args, "--gpus", "\"device=0,1\""));
        assert!(has_pair(&args, "--cap-add", "SYS_NICE"));
        assert!(has_pair(&args, "--workdir", "/work"));
        assert!(!args.contains(&"--privileged".to_string()));

        // Image then the shell-wrapped command, in that order.
        let image_pos = args.iter().position(|a| a == "kohakuriver/base:base").unwrap();
        assert_eq!(args[image_pos + 1], "/bin/sh");
        assert_eq!(args[image_pos + 2], "-c");
        assert_eq!(args[image_pos + 3], "exec /bin/true");
    }

    #[test]
    fn run_args_mounts_include_standard_and_user_binds() {
        let cfg = test_config();
        let args = build_docker_run_args(&base_plan(), &cfg);
        let mounts: Vec<&String> = args
            .windows(2)
            .filter(|w| w[0] == "--mount")
            .map(|w| &w[1])
            .collect();

        assert!(mounts.iter().any(|m| m.contains("target=/shared")));
        assert!(mounts.iter().any(|m| m.contains("target=/kohakuriver-logs")));
        assert!(mounts.iter().any(|m| m.contains("target=/local_temp")));
        assert!(mounts
            .iter()
            .any(|m| m.contains("source=/data,target=/mnt/data,readonly")));
        assert!(mounts
            .iter()
            .any(|m| m.contains(TUNNEL_CLIENT_MOUNT) && m.contains("readonly")));
    }

    #[test]
    fn privileged_requires_runner_consent() {
        let mut plan = base_plan();
        plan.privileged = true;

        let cfg = test_config(); // allow_privileged = false
        let args = build_docker_run_args(&plan, &cfg);
        assert!(!args.contains(&"--privileged".to_string()));
        assert!(has_pair(&args, "--cap-add", "SYS_NICE"));

        let mut permissive = test_config();
        permissive.allow_privileged = true;
        let args = build_docker_run_args(&plan, &permissive);
        assert!(args.contains(&"--privileged".to_string()));
        assert!(!has_pair(&args, "--cap-add", "SYS_NICE"));
    }

    #[test]
    fn zero_cpus_omits_the_flag() {
        let mut plan = base_plan();
        plan.cpus = 0;
        plan.memory_bytes = None;
        plan.gpu_indices.clear();
        let args = build_docker_run_args(&plan, &test_config());
        assert!(!args.contains(&"--cpus".to_string()));
        assert!(!args.contains(&"--memory".to_string()));
        assert!(!args.contains(&"--gpus".to_string()));
    }

    #[test]
    fn non_overlay_launch_uses_default_network() {
        let mut plan = base_plan();
        plan.overlay_network = false;
        let args = build_docker_run_args(&plan, &test_config());
        assert!(!args.contains(&"--network".to_string()));
        assert!(!args.contains(&"--ip".to_string()));
    }

    // ── environment ──

    #[test]
    fn task_env_contains_injected_keys() {
        let cfg = test_config();
        let mut user = HashMap::new();
        user.insert("MY_VAR".to_string(), "1".to_string());
        let env = task_environment(42, "kohakuriver-task-42", &user, Some(0), &cfg);
        let keys: Vec<&str> = env.iter().map(|(k, _)| k.as_str()).collect();

        assert!(keys.contains(&"MY_VAR"));
        assert!(keys.contains(&"KOHAKURIVER_TASK_ID"));
        assert!(keys.contains(&"KOHAKURIVER_LOCAL_TEMP_DIR"));
        assert!(keys.contains(&"KOHAKURIVER_SHARED_DIR"));
        assert!(keys.contains(&"KOHAKURIVER_TARGET_NUMA_NODE"));
        assert!(keys.contains(&"KOHAKURIVER_CONTAINER_ID"));

        let tunnel = env
            .iter()
            .find(|(k, _)| k == "KOHAKURIVER_TUNNEL_URL")
            .unwrap();
        assert_eq!(tunnel.1, "ws://node1:8001/ws/tunnel/kohakuriver-task-42");
    }

    #[test]
    fn task_env_omits_numa_when_unset() {
        let cfg = test_config();
        let env = task_environment(42, "c", &HashMap::new(), None, &cfg);
        assert!(!env.iter().any(|(k, _)| k == "KOHAKURIVER_TARGET_NUMA_NODE"));
    }
}
