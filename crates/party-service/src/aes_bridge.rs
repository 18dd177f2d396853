//! AES envelope subprocess bridge. Serializes batched `dist_enc` / `dist_dec`
//! jobs as a single JSON array on the MPC-AES binary's stdin and parses the
//! matching array back off stdout.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use party_core::error::ProcessException;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Seam for substituting a fake subprocess in tests without touching the
/// real binary.
#[async_trait]
pub trait SubprocessRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str], stdin: &str) -> std::io::Result<(i32, String, String)>;
}

pub struct TokioSubprocessRunner;

#[async_trait]
impl SubprocessRunner for TokioSubprocessRunner {
    async fn run(&self, program: &str, args: &[&str], stdin: &str) -> std::io::Result<(i32, String, String)> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut child_stdin) = child.stdin.take() {
            child_stdin.write_all(stdin.as_bytes()).await?;
        }

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let Some(mut out) = child.stdout.take() {
            out.read_to_string(&mut stdout).await?;
        }
        if let Some(mut err) = child.stderr.take() {
            err.read_to_string(&mut stderr).await?;
        }

        let status = child.wait().await?;
        Ok((status.code().unwrap_or(-1), stdout, stderr))
    }
}

/// Zeroized on drop; never logged or written anywhere but the AES bridge's
/// stdin.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub enum KeyMaterial {
    KeyShare([u8; 16]),
    KeySchedule([u8; 176]),
}

pub struct EncryptJob {
    pub key: KeyMaterial,
    pub nonce: [u8; 12],
    pub associated_data: Vec<u8>,
    pub message_share: Vec<(u64, u64)>,
}

pub struct DecryptJob {
    pub key: KeyMaterial,
    pub user_id: String,
    pub ciphertext: Vec<u8>,
}

#[derive(Serialize)]
struct EncJobWire {
    nonce: String,
    associated_data: String,
    message_share: Vec<[u64; 2]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    key_share: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    key_schedule_share: Option<String>,
}

#[derive(Serialize)]
struct DecJobWire {
    nonce: String,
    associated_data: String,
    ciphertext: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    key_share: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    key_schedule_share: Option<String>,
}

#[derive(Deserialize)]
struct EncResult {
    ciphertext: Option<String>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct DecResult {
    message_share: Option<Vec<[u64; 2]>>,
    #[serde(default)]
    tag_error: bool,
    error: Option<String>,
}

pub struct AesBridge {
    bin: String,
    config_path: String,
    runner: Box<dyn SubprocessRunner>,
    timeout: Duration,
}

fn key_fields(key: &KeyMaterial) -> (Option<String>, Option<String>) {
    match key {
        KeyMaterial::KeyShare(bytes) => (Some(hex::encode(bytes)), None),
        KeyMaterial::KeySchedule(bytes) => (None, Some(hex::encode(bytes))),
    }
}

fn is_key_schedule(key: &KeyMaterial) -> bool {
    matches!(key, KeyMaterial::KeySchedule(_))
}

impl AesBridge {
    pub fn new(bin: String, config_path: String, timeout: Duration) -> Self {
        Self {
            bin,
            config_path,
            runner: Box::new(TokioSubprocessRunner),
            timeout,
        }
    }

    pub fn with_runner(bin: String, config_path: String, timeout: Duration, runner: Box<dyn SubprocessRunner>) -> Self {
        Self {
            bin,
            config_path,
            runner,
            timeout,
        }
    }

    /// Batches all `jobs` into one subprocess invocation when every job
    /// carries a key-schedule share. Key-share jobs don't batch on the MPC
    /// side, so a mixed or all-key-share batch of more than one job is
    /// dispatched one job at a time instead.
    pub async fn dist_dec(&self, jobs: &[DecryptJob]) -> Result<Vec<Option<Vec<(u64, u64)>>>, ProcessException> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        if jobs.len() > 1 && !jobs.iter().all(|j| is_key_schedule(&j.key)) {
            let mut results = Vec::with_capacity(jobs.len());
            for job in jobs {
                let mut single = Box::pin(self.dist_dec(std::slice::from_ref(job))).await?;
                results.push(single.pop().expect("single-job dispatch yields exactly one result"));
            }
            return Ok(results);
        }

        let wire: Vec<DecJobWire> = jobs
            .iter()
            .map(|job| {
                let (key_share, key_schedule_share) = key_fields(&job.key);
                let associated_data = {
                    let mut buf = job.user_id.as_bytes().to_vec();
                    buf.extend_from_slice(&job.ciphertext[..12.min(job.ciphertext.len())]);
                    buf
                };
                DecJobWire {
                    nonce: hex::encode(&job.ciphertext[..12.min(job.ciphertext.len())]),
                    associated_data: hex::encode(associated_data),
                    ciphertext: hex::encode(&job.ciphertext[12.min(job.ciphertext.len())..]),
                    key_share,
                    key_schedule_share,
                }
            })
            .collect();

        let stdin = serde_json::to_string(&wire)
            .map_err(|e| ProcessException::new(Vec::<String>::new(), 500, format!("encoding dist_dec input: {e}")))?;

        let (code, stdout, stderr) = self.invoke("decrypt", &stdin).await?;
        if code != 0 {
            return Err(ProcessException::new(
                Vec::<String>::new(),
                500,
                format!("dist_dec subprocess exited with code {code}: {stderr}"),
            ));
        }

        let results: Vec<DecResult> = serde_json::from_str(&stdout)
            .map_err(|e| ProcessException::new(Vec::<String>::new(), 500, format!("parsing dist_dec output: {e}")))?;

        results
            .into_iter()
            .map(|r| {
                if r.tag_error {
                    Ok(None)
                } else if let Some(err) = r.error {
                    Err(ProcessException::new(Vec::<String>::new(), 500, format!("dist_dec failed: {err}")))
                } else if let Some(pairs) = r.message_share {
                    Ok(Some(pairs.into_iter().map(|p| (p[0], p[1])).collect()))
                } else {
                    Err(ProcessException::new(Vec::<String>::new(), 500, "unexpected dist_dec output shape".to_string()))
                }
            })
            .collect()
    }

    /// Dispatches one `dist_enc` job per user, all in a single subprocess
    /// invocation.
    pub async fn dist_enc(&self, jobs: &[EncryptJob]) -> Result<Vec<Vec<u8>>, ProcessException> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        if jobs.len() > 1 && !jobs.iter().all(|j| is_key_schedule(&j.key)) {
            return Err(ProcessException::new(
                Vec::<String>::new(),
                500,
                "mixed or key-share batch cannot be batched for dist_enc".to_string(),
            ));
        }

        let wire: Vec<EncJobWire> = jobs
            .iter()
            .map(|job| {
                let (key_share, key_schedule_share) = key_fields(&job.key);
                EncJobWire {
                    nonce: hex::encode(job.nonce),
                    associated_data: hex::encode(&job.associated_data),
                    message_share: job.message_share.iter().map(|&(a, b)| [a, b]).collect(),
                    key_share,
                    key_schedule_share,
                }
            })
            .collect();

        let stdin = serde_json::to_string(&wire)
            .map_err(|e| ProcessException::new(Vec::<String>::new(), 500, format!("encoding dist_enc input: {e}")))?;

        let (code, stdout, stderr) = self.invoke("encrypt", &stdin).await?;
        if code != 0 {
            return Err(ProcessException::new(
                Vec::<String>::new(),
                500,
                format!("dist_enc subprocess exited with code {code}: {stderr}"),
            ));
        }

        let results: Vec<EncResult> = serde_json::from_str(&stdout)
            .map_err(|e| ProcessException::new(Vec::<String>::new(), 500, format!("parsing dist_enc output: {e}")))?;

        results
            .into_iter()
            .map(|r| {
                if let Some(err) = r.error {
                    Err(ProcessException::new(Vec::<String>::new(), 500, format!("dist_enc failed: {err}")))
                } else if let Some(ct) = r.ciphertext {
                    hex::decode(ct).map_err(|e| ProcessException::new(Vec::<String>::new(), 500, format!("bad ciphertext hex: {e}")))
                } else {
                    Err(ProcessException::new(Vec::<String>::new(), 500, "unexpected dist_enc output shape".to_string()))
                }
            })
            .collect()
    }

    async fn invoke(&self, mode: &str, stdin: &str) -> Result<(i32, String, String), ProcessException> {
        let args = vec!["--config", self.config_path.as_str(), mode, "--mode", "AES-GCM-128"];
        tokio::time::timeout(self.timeout, self.runner.run(&self.bin, &args, stdin))
            .await
            .map_err(|_| ProcessException::new(Vec::<String>::new(), 504, "AES bridge subprocess timed out".to_string()))?
            .map_err(|e| ProcessException::new(Vec::<String>::new(), 500, format!("spawning AES bridge subprocess: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeRunner {
        stdout: String,
    }

    #[async_trait]
    impl SubprocessRunner for FakeRunner {
        async fn run(&self, _program: &str, _args: &[&str], _stdin: &str) -> std::io::Result<(i32, String, String)> {
            Ok((0, self.stdout.clone(), String::new()))
        }
    }

    #[tokio::test]
    async fn dist_dec_parses_tag_error_as_none() {
        let bridge = AesBridge::with_runner(
            "bin".into(),
            "cfg".into(),
            Duration::from_secs(1),
            Box::new(FakeRunner {
                stdout: r#"[{"tag_error": true}]"#.into(),
            }),
        );
        let job = DecryptJob {
            key: KeyMaterial::KeyShare([0u8; 16]),
            user_id: "u1".into(),
            ciphertext: vec![0u8; 28],
        };
        let result = bridge.dist_dec(&[job]).await.unwrap();
        assert_eq!(result, vec![None]);
    }

    #[tokio::test]
    async fn dist_enc_rejects_mixed_key_material_batch() {
        let bridge = AesBridge::with_runner(
            "bin".into(),
            "cfg".into(),
            Duration::from_secs(1),
            Box::new(FakeRunner { stdout: "[]".into() }),
        );
        let jobs = vec![
            EncryptJob {
                key: KeyMaterial::KeyShare([0u8; 16]),
                nonce: [0u8; 12],
                associated_data: vec![],
                message_share: vec![(1, 2)],
            },
            EncryptJob {
                key: KeyMaterial::KeySchedule([0u8; 176]),
                nonce: [0u8; 12],
                associated_data: vec![],
                message_share: vec![(1, 2)],
            },
        ];
        let result = bridge.dist_enc(&jobs).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn nonzero_exit_is_fatal() {
        struct FailingRunner;
        #[async_trait]
        impl SubprocessRunner for FailingRunner {
            async fn run(&self, _p: &str, _a: &[&str], _s: &str) -> std::io::Result<(i32, String, String)> {
                Ok((1, String::new(), "boom".into()))
            }
        }
        let bridge = AesBridge::with_runner("bin".into(), "cfg".into(), Duration::from_secs(1), Box::new(FailingRunner));
        let job = DecryptJob {
            key: KeyMaterial::KeyShare([0u8; 16]),
            user_id: "u1".into(),
            ciphertext: vec![0u8; 28],
        };
        let result = bridge.dist_dec(&[job]).await;
        assert!(result.is_err());
    }
}
