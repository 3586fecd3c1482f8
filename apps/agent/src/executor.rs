// [apps/agent/src/executor.rs]
//! External cracker invocation: command-line assembly, status-stream
//! parsing, progress reporting, stop handling and benchmark probes.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use krakenhashes_models::file::outfile_path;
use krakenhashes_models::hashcat::STATUS_RUNNING;
use krakenhashes_models::messages::{
    BenchmarkRequestPayload, BenchmarkResultPayload, Envelope, JobProgressPayload, MessageType,
    TaskAssignmentPayload,
};
use krakenhashes_models::HashcatStatus;

use crate::outfile::count_outfile_lines;
use crate::uplink::Uplink;

/// How one cracker invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Keyspace exhausted or every hash cracked.
    Completed {
        cracked_count: u64,
        keyspace_processed: u64,
        all_hashes_cracked: bool,
        /// Last observed `progress[1]` for keyspace calibration.
        total_effective_keyspace: Option<u64>,
    },
    Stopped,
    Failed(String),
}

/// Builds the cracker argv for a task assignment. Paths inside the
/// assignment are relative to the agent data dir.
pub fn build_task_args(assignment: &TaskAssignmentPayload, data_dir: &Path) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    let absolute = |relative: &str| data_dir.join(relative).to_string_lossy().into_owned();

    args.push(format!("--session=kh-{}", &assignment.task_id.to_string()[..8]));
    args.push("--status".into());
    args.push("--status-json".into());
    args.push(format!("--status-timer={}", assignment.report_interval.max(1)));
    args.push("--potfile-disable".into());
    args.push("-a".into());
    args.push(assignment.attack_mode.to_string());
    args.push("-m".into());
    args.push(assignment.hash_type.to_string());
    args.push("-o".into());
    args.push(outfile_path(data_dir, assignment.task_id).to_string_lossy().into_owned());
    args.push(format!("--outfile-format={}", assignment.output_format));

    if assignment.is_keyspace_split {
        args.push(format!("--skip={}", assignment.keyspace_start));
        args.push(format!(
            "--limit={}",
            assignment.keyspace_end.saturating_sub(assignment.keyspace_start)
        ));
    }

    if let Some(devices) = &assignment.enabled_devices {
        if !devices.is_empty() {
            let list: Vec<String> = devices.iter().map(|id| id.to_string()).collect();
            args.push("-d".into());
            args.push(list.join(","));
        }
    }

    // Layer tasks arrive with increment_mode = None and must never carry
    // the increment flags; the layer mask already fixes the length.
    if let Some(mode) = &assignment.increment_mode {
        use krakenhashes_models::IncrementMode;
        if !matches!(mode, IncrementMode::Off) {
            args.push("--increment".into());
            if matches!(mode, IncrementMode::IncrementInverse) {
                args.push("--increment-inverse".into());
            }
            if let Some(min) = assignment.increment_min {
                args.push(format!("--increment-min={min}"));
            }
            if let Some(max) = assignment.increment_max {
                args.push(format!("--increment-max={max}"));
            }
        }
    }

    for extra in assignment.extra_parameters.split_whitespace() {
        args.push(extra.to_string());
    }

    args.push(absolute(&assignment.hashlist_path));

    // Positional attack material per mode.
    match assignment.attack_mode {
        0 | 9 => {
            for wordlist in &assignment.wordlist_paths {
                args.push(absolute(wordlist));
            }
            for rule in &assignment.rule_paths {
                args.push("-r".into());
                args.push(absolute(rule));
            }
        }
        3 => {
            if let Some(mask) = &assignment.mask {
                args.push(mask.clone());
            }
        }
        6 => {
            if let Some(wordlist) = assignment.wordlist_paths.first() {
                args.push(absolute(wordlist));
            }
            if let Some(mask) = &assignment.mask {
                args.push(mask.clone());
            }
        }
        7 => {
            if let Some(mask) = &assignment.mask {
                args.push(mask.clone());
            }
            if let Some(wordlist) = assignment.wordlist_paths.first() {
                args.push(absolute(wordlist));
            }
        }
        other => {
            warn!("[EXECUTOR]: unhandled attack mode {other}, passing material in order");
            for wordlist in &assignment.wordlist_paths {
                args.push(absolute(wordlist));
            }
            if let Some(mask) = &assignment.mask {
                args.push(mask.clone());
            }
        }
    }

    // Rule paths double as rule-chunk paths for rule-split tasks; modes
    // other than 0/9 attach them here.
    if !matches!(assignment.attack_mode, 0 | 9) {
        for rule in &assignment.rule_paths {
            args.push("-r".into());
            args.push(absolute(rule));
        }
    }

    args
}

pub struct TaskRunner {
    uplink: Arc<Uplink>,
    data_dir: std::path::PathBuf,
}

impl TaskRunner {
    pub fn new(uplink: Arc<Uplink>, data_dir: std::path::PathBuf) -> Self {
        Self { uplink, data_dir }
    }

    /// Runs the cracker for one assignment, streaming progress envelopes
    /// until exit or a stop signal.
    #[instrument(skip(self, assignment, stop), fields(task = %assignment.task_id))]
    pub async fn run(
        &self,
        assignment: &TaskAssignmentPayload,
        mut stop: watch::Receiver<bool>,
    ) -> RunOutcome {
        let binary = self.data_dir.join(&assignment.binary_path);
        let args = build_task_args(assignment, &self.data_dir);
        debug!("[EXECUTOR]: spawning {} with {} args", binary.display(), args.len());

        let mut child = match Command::new(&binary)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(spawn_error) => {
                return RunOutcome::Failed(format!("spawn failed: {spawn_error}"));
            }
        };

        let stdout = child.stdout.take().expect("stdout piped above");
        let mut lines = BufReader::new(stdout).lines();

        let mut last_status: Option<HashcatStatus> = None;
        let mut was_stopped = false;

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if let Some(status) = parse_status_line(&line) {
                                self.report_progress(assignment.task_id, &status).await;
                                last_status = Some(status);
                            }
                        }
                        Ok(None) => break,
                        Err(read_error) => {
                            warn!("[EXECUTOR]: stdout read failed: {read_error}");
                            break;
                        }
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        info!("[EXECUTOR]: stop requested, killing cracker");
                        let _ = child.kill().await;
                        was_stopped = true;
                        break;
                    }
                }
            }
        }

        let exit = child.wait().await;
        if was_stopped {
            return RunOutcome::Stopped;
        }

        let cracked_count = count_outfile_lines(&outfile_path(&self.data_dir, assignment.task_id))
            .await
            .unwrap_or(0);

        match (exit, last_status) {
            (Ok(status), Some(last)) if status.success() || last.all_hashes_cracked() || last.is_exhausted() => {
                RunOutcome::Completed {
                    cracked_count,
                    keyspace_processed: last.progress[0],
                    all_hashes_cracked: last.all_hashes_cracked(),
                    total_effective_keyspace: Some(last.effective_keyspace()),
                }
            }
            (Ok(status), None) if status.success() => RunOutcome::Completed {
                cracked_count,
                keyspace_processed: 0,
                all_hashes_cracked: false,
                total_effective_keyspace: None,
            },
            (Ok(status), _) => RunOutcome::Failed(format!("cracker exited {status}")),
            (Err(wait_error), _) => RunOutcome::Failed(format!("wait failed: {wait_error}")),
        }
    }

    async fn report_progress(&self, task_id: Uuid, status: &HashcatStatus) {
        let total = status.progress[1].max(1);
        let payload = JobProgressPayload {
            task_id,
            keyspace_processed: status.progress[0],
            effective_progress: status.progress[0],
            progress_percent: (status.progress[0] as f64 / total as f64) * 100.0,
            hash_rate: status.total_speed(),
            cracked_count: status.recovered_hashes[0],
            all_hashes_cracked: status.all_hashes_cracked(),
            status: if status.status == STATUS_RUNNING { "running" } else { "finishing" }.to_string(),
            error_message: None,
            total_effective_keyspace: Some(status.effective_keyspace()),
        };
        if let Ok(envelope) = Envelope::new(MessageType::JobProgress, &payload) {
            // Progress is drop-safe; saturation costs one report, not the task.
            self.uplink.send_async(envelope);
        }
    }

    /// Runs a benchmark probe. Forced probes run the real attack long
    /// enough to capture `progress[1]`; plain probes only need a speed.
    #[instrument(skip(self, request), fields(request = %request.request_id))]
    pub async fn run_benchmark(&self, request: &BenchmarkRequestPayload) -> BenchmarkResultPayload {
        let binary = self.data_dir.join(&request.binary_path);
        let mut args: Vec<String> = vec![
            "--status".into(),
            "--status-json".into(),
            "--status-timer=1".into(),
            "--potfile-disable".into(),
            format!("--runtime={}", request.timeout_seconds.max(1)),
            "-a".into(),
            request.attack_mode.to_string(),
            "-m".into(),
            request.hash_type.to_string(),
        ];
        if !request.forced {
            // A pure speed probe does not need real coverage.
            args.push("--speed-only".into());
        }
        args.push(self.data_dir.join(&request.hashlist_path).to_string_lossy().into_owned());
        for wordlist in &request.wordlist_paths {
            args.push(self.data_dir.join(wordlist).to_string_lossy().into_owned());
        }
        if let Some(mask) = &request.mask {
            args.push(mask.clone());
        }
        for rule in &request.rule_paths {
            args.push("-r".into());
            args.push(self.data_dir.join(rule).to_string_lossy().into_owned());
        }

        let probe = async {
            let mut child = Command::new(&binary)
                .args(&args)
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()?;
            let stdout = child.stdout.take().expect("stdout piped above");
            let mut lines = BufReader::new(stdout).lines();

            let mut best_speed: u64 = 0;
            let mut total_keyspace: Option<u64> = None;
            while let Some(line) = lines.next_line().await? {
                if let Some(status) = parse_status_line(&line) {
                    best_speed = best_speed.max(status.total_speed());
                    if status.progress[1] > 0 {
                        total_keyspace = Some(status.effective_keyspace());
                    }
                }
            }
            let _ = child.wait().await;
            Ok::<(u64, Option<u64>), std::io::Error>((best_speed, total_keyspace))
        };

        // The server adds its own buffer on top; the local deadline keeps a
        // wedged cracker from pinning the agent forever.
        let deadline = Duration::from_secs(request.timeout_seconds + 30);
        match tokio::time::timeout(deadline, probe).await {
            Ok(Ok((speed, total_keyspace))) => BenchmarkResultPayload {
                request_id: request.request_id,
                attack_mode: request.attack_mode,
                hash_type: request.hash_type,
                salt_count: request.salt_count,
                speed,
                total_keyspace: if request.forced { total_keyspace } else { None },
                forced: request.forced,
                error_message: None,
            },
            Ok(Err(io_error)) => benchmark_failure(request, format!("probe failed: {io_error}")),
            Err(_) => benchmark_failure(request, "probe timed out".to_string()),
        }
    }
}

fn benchmark_failure(request: &BenchmarkRequestPayload, message: String) -> BenchmarkResultPayload {
    error!("[EXECUTOR]: benchmark {}: {message}", request.request_id);
    BenchmarkResultPayload {
        request_id: request.request_id,
        attack_mode: request.attack_mode,
        hash_type: request.hash_type,
        salt_count: request.salt_count,
        speed: 0,
        total_keyspace: None,
        forced: request.forced,
        error_message: Some(message),
    }
}

/// Status lines are JSON documents; everything else on stdout is banner
/// noise and ignored.
fn parse_status_line(line: &str) -> Option<HashcatStatus> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str::<HashcatStatus>(trimmed).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment() -> TaskAssignmentPayload {
        TaskAssignmentPayload {
            task_id: Uuid::new_v4(),
            job_execution_id: Uuid::new_v4(),
            hashlist_id: Uuid::new_v4(),
            hashlist_path: "hashlists/7.hash".into(),
            attack_mode: 3,
            hash_type: 1000,
            keyspace_start: 1000,
            keyspace_end: 3000,
            wordlist_paths: vec![],
            rule_paths: vec![],
            mask: Some("?l?l?l".into()),
            binary_path: "binaries/4/hashcat".into(),
            chunk_duration: 1200,
            report_interval: 5,
            output_format: "3".into(),
            extra_parameters: "-O -w 3".into(),
            enabled_devices: Some(vec![1, 3]),
            is_keyspace_split: true,
            increment_mode: None,
            increment_min: None,
            increment_max: None,
        }
    }

    #[test]
    fn keyspace_split_uses_skip_and_limit() {
        let args = build_task_args(&assignment(), Path::new("/data"));
        assert!(args.contains(&"--skip=1000".to_string()));
        assert!(args.contains(&"--limit=2000".to_string()));
        assert!(args.contains(&"--outfile-format=3".to_string()));
        assert!(args.contains(&"--potfile-disable".to_string()));
        assert!(args.contains(&"?l?l?l".to_string()));
        // Device filter and extra parameters survive.
        let device_index = args.iter().position(|a| a == "-d").unwrap();
        assert_eq!(args[device_index + 1], "1,3");
        assert!(args.contains(&"-O".to_string()));
    }

    #[test]
    fn layer_tasks_never_carry_increment_flags() {
        let mut layered = assignment();
        layered.increment_mode = None;
        let args = build_task_args(&layered, Path::new("/data"));
        assert!(!args.iter().any(|arg| arg.starts_with("--increment")));
    }

    #[test]
    fn whole_job_increment_carries_bounds() {
        let mut incremental = assignment();
        incremental.is_keyspace_split = false;
        incremental.increment_mode = Some(krakenhashes_models::IncrementMode::Increment);
        incremental.increment_min = Some(1);
        incremental.increment_max = Some(3);
        let args = build_task_args(&incremental, Path::new("/data"));
        assert!(args.contains(&"--increment".to_string()));
        assert!(args.contains(&"--increment-min=1".to_string()));
        assert!(args.contains(&"--increment-max=3".to_string()));
    }

    #[test]
    fn straight_mode_orders_wordlist_then_rules() {
        let mut straight = assignment();
        straight.attack_mode = 0;
        straight.mask = None;
        straight.is_keyspace_split = false;
        straight.wordlist_paths = vec!["wordlists/common/rockyou.txt".into()];
        straight.rule_paths = vec!["rules/chunks/job-1/chunk_0.rule".into()];
        let args = build_task_args(&straight, Path::new("/data"));

        let hashlist_index = args.iter().position(|a| a.ends_with("7.hash")).unwrap();
        let wordlist_index = args.iter().position(|a| a.ends_with("rockyou.txt")).unwrap();
        let rule_flag_index = args.iter().position(|a| a == "-r").unwrap();
        assert!(hashlist_index < wordlist_index);
        assert!(wordlist_index < rule_flag_index);
    }

    #[test]
    fn status_parsing_skips_banner_noise() {
        assert!(parse_status_line("hashcat (v6.2.6) starting...").is_none());
        let status = parse_status_line(
            r#"{"status": 3, "progress": [10, 100], "devices": [], "recovered_hashes": [0, 5]}"#,
        )
        .unwrap();
        assert_eq!(status.progress, [10, 100]);
    }
}
