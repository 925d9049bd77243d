//! Fencing orchestration
//!
//! Tracks fence requests per node until they succeed, and schedules the
//! periodic device health check. Nothing here spawns processes; the engine
//! asks for commands and reports exits back.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{error, info};

use crate::abstractions::{CommandSpec, ExitStatus, Instant};
use crate::config::{FencingConfig, FENCE_BAD_HOST_EXIT_CODE};
use crate::message::StonithResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceOutcome {
    /// The node is reset; its resources may be taken
    Fenced,
    /// Attempt failed and a retry is scheduled
    RetryScheduled { result: StonithResult, at: Instant },
}

#[derive(Debug, Clone, Default)]
struct PendingFence {
    attempts: u32,
    running: bool,
    retry_at: Option<Instant>,
}

#[derive(Debug)]
pub struct FencingOrchestrator {
    device: Option<FencingConfig>,
    retry_delay: Duration,
    status_interval: Duration,
    pending: BTreeMap<String, PendingFence>,
    status_check_at: Option<Instant>,
    status_running: bool,
}

impl FencingOrchestrator {
    pub fn new(device: Option<FencingConfig>, retry_delay: Duration, status_interval: Duration) -> Self {
        Self {
            device,
            retry_delay,
            status_interval,
            pending: BTreeMap::new(),
            status_check_at: None,
            status_running: false,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.device.is_some()
    }

    pub fn device_id(&self) -> &str {
        self.device.as_ref().map(|d| d.device_id.as_str()).unwrap_or("<none>")
    }

    fn command(&self) -> Option<CommandSpec> {
        self.device
            .as_ref()
            .map(|d| CommandSpec::new(&d.command).with_args(d.args.iter().cloned()))
    }

    /// Command for the next reset attempt of `node`; registers the request
    pub fn begin_reset(&mut self, node: &str) -> Option<CommandSpec> {
        let cmd = self.command()?.with_arg("reset").with_arg(node);
        let device = self.device_id().to_string();
        let entry = self.pending.entry(node.to_string()).or_default();
        entry.attempts += 1;
        entry.running = true;
        entry.retry_at = None;
        info!(node, %device, attempt = entry.attempts, "Resetting node");
        Some(cmd)
    }

    /// The reset child could not be started
    pub fn reset_not_started(&mut self, node: &str, now: Instant) -> Instant {
        self.schedule_retry(node, now)
    }

    fn schedule_retry(&mut self, node: &str, now: Instant) -> Instant {
        let at = now + self.retry_delay;
        let entry = self.pending.entry(node.to_string()).or_default();
        entry.running = false;
        entry.retry_at = Some(at);
        at
    }

    /// Classify a reset exit and schedule a retry on failure
    pub fn on_reset_exit(&mut self, node: &str, status: ExitStatus, now: Instant) -> FenceOutcome {
        let result = classify(status);
        if result == StonithResult::Ok {
            info!(node, "Node now reset");
            self.pending.remove(node);
            return FenceOutcome::Fenced;
        }

        if result == StonithResult::BadHost {
            error!(node, device = %self.device_id(), "Device cannot reset host");
        } else {
            error!(node, %status, "Host not reset");
        }
        error!(node, "Fencing failed, retrying");
        let at = self.schedule_retry(node, now);
        FenceOutcome::RetryScheduled { result, at }
    }

    /// Nodes whose retry delay has passed; each is returned once
    pub fn due_retries(&mut self, now: Instant) -> Vec<String> {
        let mut due = Vec::new();
        for (node, fence) in self.pending.iter_mut() {
            if matches!(fence.retry_at, Some(at) if at <= now) {
                fence.retry_at = None;
                due.push(node.clone());
            }
        }
        due
    }

    pub fn is_pending(&self, node: &str) -> bool {
        self.pending.contains_key(node)
    }

    /// A reset child for `node` is currently running
    pub fn in_flight(&self, node: &str) -> bool {
        self.pending.get(node).map(|f| f.running).unwrap_or(false)
    }

    pub fn attempts(&self, node: &str) -> u32 {
        self.pending.get(node).map(|f| f.attempts).unwrap_or(0)
    }

    /// Arm the first device status check
    pub fn start_status_checks(&mut self, now: Instant) {
        if self.is_configured() && self.status_check_at.is_none() && !self.status_running {
            self.status_check_at = Some(now);
        }
    }

    /// Command for a due status check, if any
    pub fn due_status_check(&mut self, now: Instant) -> Option<CommandSpec> {
        match self.status_check_at {
            Some(at) if at <= now && !self.status_running => {
                let cmd = self.command()?.with_arg("status");
                self.status_check_at = None;
                self.status_running = true;
                info!(device = %self.device_id(), "Checking status of fencing device");
                Some(cmd)
            }
            _ => None,
        }
    }

    /// Record a status check result and re-arm the next one
    pub fn on_status_exit(&mut self, status: ExitStatus, now: Instant) {
        if !status.success() {
            error!(device = %self.device_id(), %status, "Fencing device status operation failed");
            info!("This may mean that the fencing device has failed");
        }
        self.status_running = false;
        self.status_check_at = Some(now + self.status_interval);
    }
}

/// Map a fencing child's exit to the broadcast result
pub fn classify(status: ExitStatus) -> StonithResult {
    match status {
        ExitStatus::Exited(0) => StonithResult::Ok,
        ExitStatus::Exited(code) if code == FENCE_BAD_HOST_EXIT_CODE => StonithResult::BadHost,
        _ => StonithResult::Bad,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn orchestrator() -> FencingOrchestrator {
        FencingOrchestrator::new(
            Some(FencingConfig {
                device_id: "ipmi".into(),
                command: PathBuf::from("/usr/sbin/fence"),
                args: vec!["--lan".into()],
            }),
            Duration::from_secs(5),
            Duration::from_secs(3600),
        )
    }

    #[test]
    fn test_reset_command_shape() {
        let mut fencing = orchestrator();
        let cmd = fencing.begin_reset("beta").unwrap();
        assert_eq!(cmd.display(), "/usr/sbin/fence --lan reset beta");
        assert!(fencing.is_pending("beta"));
        assert!(fencing.in_flight("beta"));
    }

    #[test]
    fn test_failed_reset_is_retried_after_delay() {
        let mut fencing = orchestrator();
        let t0 = Instant::from_micros(0);
        fencing.begin_reset("beta");

        let outcome = fencing.on_reset_exit("beta", ExitStatus::Exited(1), t0);
        let retry_at = t0 + Duration::from_secs(5);
        assert_eq!(
            outcome,
            FenceOutcome::RetryScheduled {
                result: StonithResult::Bad,
                at: retry_at
            }
        );

        assert!(fencing.due_retries(t0 + Duration::from_secs(4)).is_empty());
        assert_eq!(fencing.due_retries(retry_at), vec!["beta".to_string()]);
        assert!(fencing.due_retries(retry_at).is_empty());

        fencing.begin_reset("beta");
        assert_eq!(fencing.attempts("beta"), 2);
        assert_eq!(
            fencing.on_reset_exit("beta", ExitStatus::Exited(0), retry_at),
            FenceOutcome::Fenced
        );
        assert!(!fencing.is_pending("beta"));
    }

    #[test]
    fn test_classify_exit_codes() {
        assert_eq!(classify(ExitStatus::Exited(0)), StonithResult::Ok);
        assert_eq!(classify(ExitStatus::Exited(100)), StonithResult::BadHost);
        assert_eq!(classify(ExitStatus::Exited(2)), StonithResult::Bad);
        assert_eq!(classify(ExitStatus::Signaled(9)), StonithResult::Bad);
    }

    #[test]
    fn test_status_check_rearms() {
        let mut fencing = orchestrator();
        let t0 = Instant::from_micros(0);
        fencing.start_status_checks(t0);

        let cmd = fencing.due_status_check(t0).unwrap();
        assert_eq!(cmd.args.last().map(String::as_str), Some("status"));
        assert!(fencing.due_status_check(t0).is_none());

        fencing.on_status_exit(ExitStatus::Exited(1), t0);
        assert!(fencing
            .due_status_check(t0 + Duration::from_secs(3599))
            .is_none());
        assert!(fencing
            .due_status_check(t0 + Duration::from_secs(3600))
            .is_some());
    }

    #[test]
    fn test_unconfigured_device() {
        let mut fencing = FencingOrchestrator::new(None, Duration::from_secs(5), Duration::from_secs(60));
        assert!(!fencing.is_configured());
        assert!(fencing.begin_reset("beta").is_none());
        fencing.start_status_checks(Instant::from_micros(0));
        assert!(fencing.due_status_check(Instant::from_micros(0)).is_none());
    }
}
