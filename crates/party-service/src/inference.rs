//! Inference binary invocation and the offline preprocessing subprocess
//! wrappers: the MPC runtime and its offline material distribution step,
//! both treated as black boxes.

use std::time::Duration;

use async_trait::async_trait;
use party_core::error::ProcessException;
use party_core::model::BatchSize;

#[async_trait]
pub trait SubprocessRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str]) -> std::io::Result<(i32, String, String)>;
}

pub struct TokioSubprocessRunner;

#[async_trait]
impl SubprocessRunner for TokioSubprocessRunner {
    async fn run(&self, program: &str, args: &[&str]) -> std::io::Result<(i32, String, String)> {
        let output = tokio::process::Command::new(program).args(args).output().await?;
        Ok((
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ))
    }
}

pub struct InferenceRunner {
    binary_path: String,
    hosts: String,
    party_index: u8,
    timeout: Duration,
    runner: Box<dyn SubprocessRunner>,
}

impl InferenceRunner {
    pub fn new(binary_path: String, hosts: String, party_index: u8, timeout: Duration) -> Self {
        Self {
            binary_path,
            hosts,
            party_index,
            timeout,
            runner: Box::new(TokioSubprocessRunner),
        }
    }

    pub fn with_runner(
        binary_path: String,
        hosts: String,
        party_index: u8,
        timeout: Duration,
        runner: Box<dyn SubprocessRunner>,
    ) -> Self {
        Self {
            binary_path,
            hosts,
            party_index,
            timeout,
            runner,
        }
    }

    /// `./malicious-rep-ring-party.x [-F] -v -ip HOSTS -p <party_index>
    /// heartbeat_inference_demo_batched_<batch_size>`.
    pub async fn run(&self, batch_size: BatchSize, online_only: bool) -> Result<(), ProcessException> {
        let party_index = self.party_index.to_string();
        let program = format!("heartbeat_inference_demo_batched_{}", batch_size.program_suffix());
        let mut args: Vec<&str> = Vec::new();
        if online_only {
            args.push("-F");
        }
        args.push("-v");
        args.push("-ip");
        args.push(&self.hosts);
        args.push("-p");
        args.push(&party_index);
        args.push(&program);

        let (code, _stdout, stderr) = tokio::time::timeout(self.timeout, self.runner.run(&self.binary_path, &args))
            .await
            .map_err(|_| ProcessException::new(Vec::<String>::new(), 504, "inference binary timed out".to_string()))?
            .map_err(|e| ProcessException::new(Vec::<String>::new(), 500, format!("spawning inference binary: {e}")))?;

        if code != 0 {
            return Err(ProcessException::new(
                Vec::<String>::new(),
                500,
                format!("inference binary exited with code {code}: {stderr}"),
            ));
        }
        Ok(())
    }
}

/// Offline preprocessing distribution: invokes the offline `Fake-Offline.x`
/// material generator, then `scp`s the resulting share files out to the
/// other parties. Both steps share the same subprocess seam as
/// `InferenceRunner`.
pub struct OfflineDistributor {
    offline_binary_path: String,
    timeout: Duration,
    runner: Box<dyn SubprocessRunner>,
}

impl OfflineDistributor {
    pub fn new(offline_binary_path: String, timeout: Duration) -> Self {
        Self {
            offline_binary_path,
            timeout,
            runner: Box::new(TokioSubprocessRunner),
        }
    }

    pub fn with_runner(offline_binary_path: String, timeout: Duration, runner: Box<dyn SubprocessRunner>) -> Self {
        Self {
            offline_binary_path,
            timeout,
            runner,
        }
    }

    /// `Fake-Offline.x 3 -lgp 64`: three parties, 64-bit ring width.
    pub async fn generate(&self) -> Result<(), ProcessException> {
        let args = ["3", "-lgp", "64"];
        let (code, _stdout, stderr) =
            tokio::time::timeout(self.timeout, self.runner.run(&self.offline_binary_path, &args))
                .await
                .map_err(|_| ProcessException::new(Vec::<String>::new(), 504, "offline generator timed out".to_string()))?
                .map_err(|e| ProcessException::new(Vec::<String>::new(), 500, format!("spawning offline generator: {e}")))?;

        if code != 0 {
            return Err(ProcessException::new(
                Vec::<String>::new(),
                500,
                format!("offline generator exited with code {code}: {stderr}"),
            ));
        }
        Ok(())
    }

    pub async fn distribute(&self, source: &str, destinations: &[String]) -> Result<(), ProcessException> {
        for dest in destinations {
            let args = [source, dest.as_str()];
            let (code, _stdout, stderr) = tokio::time::timeout(self.timeout, self.runner.run("scp", &args))
                .await
                .map_err(|_| ProcessException::new(Vec::<String>::new(), 504, "scp distribution timed out".to_string()))?
                .map_err(|e| ProcessException::new(Vec::<String>::new(), 500, format!("spawning scp: {e}")))?;

            if code != 0 {
                return Err(ProcessException::new(
                    Vec::<String>::new(),
                    500,
                    format!("scp to {dest} exited with code {code}: {stderr}"),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeRunner {
        code: i32,
    }

    #[async_trait]
    impl SubprocessRunner for FakeRunner {
        async fn run(&self, _program: &str, _args: &[&str]) -> std::io::Result<(i32, String, String)> {
            Ok((self.code, String::new(), String::new()))
        }
    }

    #[tokio::test]
    async fn nonzero_exit_is_fatal_for_inference() {
        let runner = InferenceRunner::with_runner(
            "bin".into(),
            "HOSTS".into(),
            0,
            Duration::from_secs(1),
            Box::new(FakeRunner { code: 1 }),
        );
        let result = runner.run(BatchSize::One, false).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn success_exit_is_ok() {
        let runner = InferenceRunner::with_runner(
            "bin".into(),
            "HOSTS".into(),
            0,
            Duration::from_secs(1),
            Box::new(FakeRunner { code: 0 }),
        );
        assert!(runner.run(BatchSize::SixtyFour, true).await.is_ok());
    }

    #[tokio::test]
    async fn scp_failure_stops_distribution() {
        let distributor = OfflineDistributor::with_runner(
            "Fake-Offline.x".into(),
            Duration::from_secs(1),
            Box::new(FakeRunner { code: 1 }),
        );
        let result = distributor.distribute("file", &["party1:/tmp".to_string()]).await;
        assert!(result.is_err());
    }
}
