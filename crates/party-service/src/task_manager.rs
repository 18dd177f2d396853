//! The pipeline: queue ingest, key-share decryption, batch orchestration,
//! subprocess dispatch, timing, error projection. A bounded FIFO queue feeds
//! a single worker; the whole pipeline is serialized behind one coarse lock
//! because the shares file is a per-party singleton and the inference
//! binary interlocks every user's shares within one invocation.

use std::path::PathBuf;
use std::sync::Arc;

use party_core::cache::Cache;
use party_core::error::ProcessException;
use party_core::key_share;
use party_core::model::{AnalysisStatus, BatchSize};
use party_core::party_keys::PartyKeys;
use party_core::shares_codec;
use party_core::status_store::StatusStore;
use party_core::timer::AnalysisTimer;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{error, info, warn};

use crate::aes_bridge::{AesBridge, DecryptJob, EncryptJob, KeyMaterial};
use crate::inference::InferenceRunner;
use crate::obelisk_client::ObeliskClient;
use crate::weights::ModelShares;

const SUPPORTED_ANALYSIS_TYPE: &str = "Heartbeat-Demo-1";
const QUEUE_CAPACITY: usize = 256;

pub struct WorkItem {
    pub analysis_ids: Vec<String>,
    pub user_ids: Vec<String>,
    pub analysis_type: String,
    pub data_indices: Vec<Vec<u64>>,
    pub online_only: bool,
    pub streaming: Option<Vec<(u64, u64)>>,
}

pub struct TaskManagerHandle {
    sender: mpsc::Sender<WorkItem>,
}

impl TaskManagerHandle {
    pub async fn submit(&self, item: WorkItem) -> Result<(), ProcessException> {
        self.sender
            .send(item)
            .await
            .map_err(|_| ProcessException::new(Vec::<String>::new(), 500, "task manager queue is closed".to_string()))
    }
}

pub struct TaskManager {
    party_keys: Arc<PartyKeys>,
    obelisk: Arc<ObeliskClient>,
    aes_bridge: Arc<AesBridge>,
    inference: Arc<InferenceRunner>,
    cache: Arc<Cache>,
    status_store: Arc<StatusStore>,
    timer: Arc<AnalysisTimer>,
    shares_path: PathBuf,
    models_dir: PathBuf,
    party_index: u8,
    /// Serializes the entire pipeline: the shares file is a per-party
    /// singleton and the inference binary interlocks every user's shares
    /// within one invocation.
    request_lock: AsyncMutex<()>,
}

impl TaskManager {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        party_keys: Arc<PartyKeys>,
        obelisk: Arc<ObeliskClient>,
        aes_bridge: Arc<AesBridge>,
        inference: Arc<InferenceRunner>,
        cache: Arc<Cache>,
        status_store: Arc<StatusStore>,
        timer: Arc<AnalysisTimer>,
        shares_path: PathBuf,
        models_dir: PathBuf,
        party_index: u8,
    ) -> TaskManagerHandle {
        let manager = Arc::new(Self {
            party_keys,
            obelisk,
            aes_bridge,
            inference,
            cache,
            status_store,
            timer,
            shares_path,
            models_dir,
            party_index,
            request_lock: AsyncMutex::new(()),
        });

        let (sender, mut receiver) = mpsc::channel(QUEUE_CAPACITY);
        tokio::spawn(async move {
            while let Some(item) = receiver.recv().await {
                manager.process(item).await;
            }
        });

        TaskManagerHandle { sender }
    }

    async fn process(&self, item: WorkItem) {
        let _guard = self.request_lock.lock().await;

        for id in &item.analysis_ids {
            self.cache.pin(id);
        }

        if let Err(err) = self.run_pipeline(&item).await {
            for id in &err.analysis_ids {
                if let Err(store_err) = self
                    .status_store
                    .set_status(
                        id,
                        &AnalysisStatus::Error {
                            code: err.code,
                            message: err.message.clone(),
                        },
                    )
                    .await
                {
                    error!(analysis_id = %id, %store_err, "failed to persist error status");
                }
                self.timer.end(id);
            }
            warn!(code = err.code, message = %err.message, "batch failed");
        }

        for id in &item.analysis_ids {
            self.cache.unpin(id);
        }
    }

    async fn run_pipeline(&self, item: &WorkItem) -> Result<(), ProcessException> {
        // Step 1: mark Starting computation (admission already set Queuing).
        for id in &item.analysis_ids {
            self.status_store
                .set_status(id, &AnalysisStatus::StartingComputation)
                .await
                .map_err(|e| ProcessException::new(item.analysis_ids.clone(), 500, e.to_string()))?;
        }

        // Step 2: validate analysis_type.
        if item.analysis_type != SUPPORTED_ANALYSIS_TYPE {
            return Err(ProcessException::new(
                item.analysis_ids.clone(),
                500,
                format!(
                    "Invalid analysis_type {}. Current supported analysis_type is \"{SUPPORTED_ANALYSIS_TYPE}\".",
                    item.analysis_type
                ),
            ));
        }

        // Step 3: fetch ciphertexts and key-share envelopes.
        let samples = self
            .obelisk
            .get_data(&item.analysis_ids, &item.user_ids, &item.data_indices)
            .await?;
        let envelopes = self.obelisk.get_key_share(&item.analysis_ids).await?;

        // Step 4: decrypt each user's key share (or key schedule).
        let mut key_shares = Vec::with_capacity(item.user_ids.len());
        for (i, user_id) in item.user_ids.iter().enumerate() {
            let envelope = envelopes
                .get(i)
                .ok_or_else(|| ProcessException::new(item.analysis_ids.clone(), 500, "missing key-share envelope".to_string()))?;

            let plaintext = if let Some(streaming) = &item.streaming {
                let (begin_ms, end_ms) = streaming[i];
                let now_ms = chrono::Utc::now().timestamp_millis() as u64;
                key_share::decrypt_streaming(
                    &self.party_keys,
                    user_id,
                    "AES-128",
                    begin_ms,
                    end_ms,
                    &item.analysis_type,
                    envelope,
                    now_ms,
                )
            } else {
                key_share::decrypt_discrete(
                    &self.party_keys,
                    user_id,
                    "AES-128",
                    &item.data_indices[i],
                    &item.analysis_type,
                    envelope,
                )
            }
            .map_err(|e| ProcessException::new(item.analysis_ids.clone(), 500, e.to_string()))?;

            key_shares.push(to_key_material(&plaintext)
                .map_err(|msg| ProcessException::new(item.analysis_ids.clone(), 500, msg))?);
        }

        // Step 5: flatten into (user_id, key_share, sample) triples, enforce whitelist.
        let mut triples = Vec::new();
        for (i, user_rows) in samples.iter().enumerate() {
            for sample in user_rows {
                triples.push((item.user_ids[i].clone(), key_shares[i].clone(), sample.clone()));
            }
        }
        let batch_size = BatchSize::from_count(triples.len()).ok_or_else(|| {
            ProcessException::new(
                item.analysis_ids.clone(),
                500,
                format!("batch size {} is not in the enforced whitelist", triples.len()),
            )
        })?;

        // Step 6: distributed decryption of samples.
        let dec_jobs: Vec<DecryptJob> = triples
            .iter()
            .map(|(user_id, key, sample)| DecryptJob {
                key: key.clone(),
                user_id: user_id.clone(),
                ciphertext: sample.0.clone(),
            })
            .collect();
        let decrypted = self.aes_bridge.dist_dec(&dec_jobs).await?;
        let mut input_shares = Vec::new();
        for slot in decrypted {
            let shares = slot.ok_or_else(|| {
                ProcessException::new(item.analysis_ids.clone(), 500, "Decryption of a sample failed".to_string())
            })?;
            // Swap to the inference binary's input convention.
            input_shares.extend(shares.into_iter().map(|(a, b)| (b, a)));
        }

        // Step 7: prepend static model shares, write the shares file.
        let model = ModelShares::load(&self.models_dir, &item.analysis_type, self.party_index)
            .map_err(|e| ProcessException::new(item.analysis_ids.clone(), 500, e.to_string()))?;
        let mut body = model.shares;
        body.extend(input_shares);
        shares_codec::write_shares(&self.shares_path, &body, false)
            .map_err(|e| ProcessException::new(item.analysis_ids.clone(), 500, e.to_string()))?;

        // Step 8: invoke the inference binary.
        self.inference.run(batch_size, item.online_only).await.map_err(|mut e| {
            e.analysis_ids = item.analysis_ids.clone();
            e
        })?;

        // Step 9: read output shares.
        let output_shares = shares_codec::read_shares(&self.shares_path, 5 * batch_size.as_usize())
            .map_err(|e| ProcessException::new(item.analysis_ids.clone(), 500, e.to_string()))?;

        // Step 10: regroup per user, distributed re-encryption.
        let samples_per_user: Vec<usize> = samples.iter().map(|rows| rows.len()).collect();
        let mut enc_jobs = Vec::with_capacity(item.user_ids.len());
        let mut offset = 0;
        for (i, user_id) in item.user_ids.iter().enumerate() {
            let n = 5 * samples_per_user[i];
            let user_output = &output_shares[offset..offset + n];
            offset += n;

            let computation_id = item.analysis_ids.get(i).cloned().unwrap_or_default();
            let (nonce, associated_data) = key_share::derive_dist_enc_params(
                &self.party_keys,
                user_id,
                &computation_id,
                &item.analysis_type,
            )
            .map_err(|e| ProcessException::new(item.analysis_ids.clone(), 500, e.to_string()))?;

            enc_jobs.push(EncryptJob {
                key: key_shares[i].clone(),
                nonce,
                associated_data,
                message_share: user_output.to_vec(),
            });
        }
        let ciphertexts = self.aes_bridge.dist_enc(&enc_jobs).await?;

        // Step 11: store results.
        let hex_results: Vec<String> = ciphertexts.iter().map(hex::encode).collect();
        self.obelisk
            .store_result(&item.analysis_ids, &item.user_ids, &hex_results)
            .await?;

        // Step 12: mark Completed, stop timers.
        for id in &item.analysis_ids {
            self.status_store
                .set_status(id, &AnalysisStatus::Completed)
                .await
                .map_err(|e| ProcessException::new(item.analysis_ids.clone(), 500, e.to_string()))?;
            self.timer.end(id);
            info!(analysis_id = %id, "analysis completed");
        }

        Ok(())
    }
}

fn to_key_material(plaintext: &[u8]) -> Result<KeyMaterial, String> {
    match plaintext.len() {
        16 => {
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(plaintext);
            Ok(KeyMaterial::KeyShare(bytes))
        }
        176 => {
            let mut bytes = [0u8; 176];
            bytes.copy_from_slice(plaintext);
            Ok(KeyMaterial::KeySchedule(bytes))
        }
        other => Err(format!("decrypted key material has unexpected length {other}")),
    }
}
