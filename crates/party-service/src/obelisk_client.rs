//! OAuth2 client-credentials token lifecycle plus batched `get_data` /
//! `get_key_share` / `store_result` against the external data service.

use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;
use party_core::error::ProcessException;
use party_core::model::Sample;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

const TOKEN_REFRESH_AFTER_SECS: i64 = 240;

pub struct ObeliskClient {
    http: reqwest::Client,
    base_url: String,
    server_id: String,
    server_secret: String,
    bearer_token: Mutex<Zeroizing<String>>,
    token_issued_at: AtomicI64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct DataQueryResponse {
    user_data: Vec<Vec<String>>,
}

#[derive(Deserialize)]
struct KeyShareResponse {
    key_share: Vec<String>,
}

#[derive(Serialize)]
struct DataQueryRequest<'a> {
    analysis_ids: &'a [String],
    user_ids: &'a [String],
    data_indices: &'a [Vec<u64>],
}

#[derive(Serialize)]
struct KeyShareRequest<'a> {
    analysis_ids: &'a [String],
}

#[derive(Serialize)]
struct StoreResultRequest<'a> {
    analysis_ids: &'a [String],
    user_ids: &'a [String],
    results: &'a [String],
    is_combined: bool,
}

fn transport_exception(analysis_ids: &[String], err: reqwest::Error) -> ProcessException {
    ProcessException::new(analysis_ids.to_vec(), 500, format!("obelisk transport error: {err}"))
}

impl ObeliskClient {
    pub async fn connect(
        http: reqwest::Client,
        base_url: impl Into<String>,
        server_id: impl Into<String>,
        server_secret: impl Into<String>,
    ) -> Result<Self, ProcessException> {
        let base_url = base_url.into();
        let server_id = server_id.into();
        let server_secret = server_secret.into();

        let token = fetch_token(&http, &base_url, &server_id, &server_secret).await?;
        Ok(Self {
            http,
            base_url,
            server_id,
            server_secret,
            bearer_token: Mutex::new(Zeroizing::new(token)),
            token_issued_at: AtomicI64::new(now_secs()),
        })
    }

    async fn token(&self) -> Result<String, ProcessException> {
        let age = now_secs() - self.token_issued_at.load(Ordering::SeqCst);
        if age > TOKEN_REFRESH_AFTER_SECS {
            let fresh = fetch_token(&self.http, &self.base_url, &self.server_id, &self.server_secret).await?;
            // Old token is overwritten in place so the stale value is zeroized rather than just dropped.
            *self.bearer_token.lock() = Zeroizing::new(fresh);
            self.token_issued_at.store(now_secs(), Ordering::SeqCst);
        }
        Ok(self.bearer_token.lock().as_str().to_string())
    }

    /// `get_data(analysis_ids[], user_ids[], data_indices[][]) → [[sample, …], …]`.
    /// Each sample is validated against the fixed nonce||ciphertext||tag
    /// length before it reaches the pipeline. Caller enforces the batch-size
    /// whitelist on the flattened result.
    pub async fn get_data(
        &self,
        analysis_ids: &[String],
        user_ids: &[String],
        data_indices: &[Vec<u64>],
    ) -> Result<Vec<Vec<Sample>>, ProcessException> {
        let token = self.token().await?;
        let response = self
            .http
            .post(format!("{}/analysis/data/query", self.base_url))
            .bearer_auth(token)
            .json(&DataQueryRequest {
                analysis_ids,
                user_ids,
                data_indices,
            })
            .send()
            .await
            .map_err(|e| transport_exception(analysis_ids, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProcessException::new(
                analysis_ids.to_vec(),
                status.as_u16(),
                format!("obelisk get_data failed with status {status}"),
            ));
        }

        let body: DataQueryResponse = response
            .json()
            .await
            .map_err(|e| transport_exception(analysis_ids, e))?;

        body.user_data
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|hex_str| {
                        let bytes = decode_flexible(&hex_str)?;
                        Sample::from_bytes(bytes)
                            .ok_or_else(|| format!("sample has unexpected length for {hex_str}"))
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|msg| ProcessException::new(analysis_ids.to_vec(), 500, msg))
    }

    /// `get_key_share(analysis_ids[]) → [envelope, …]`.
    pub async fn get_key_share(
        &self,
        analysis_ids: &[String],
    ) -> Result<Vec<Vec<u8>>, ProcessException> {
        let token = self.token().await?;
        let response = self
            .http
            .post(format!("{}/mpc/keys/share", self.base_url))
            .bearer_auth(token)
            .json(&KeyShareRequest { analysis_ids })
            .send()
            .await
            .map_err(|e| transport_exception(analysis_ids, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProcessException::new(
                analysis_ids.to_vec(),
                status.as_u16(),
                format!("obelisk get_key_share failed with status {status}"),
            ));
        }

        let body: KeyShareResponse = response
            .json()
            .await
            .map_err(|e| transport_exception(analysis_ids, e))?;

        body.key_share
            .iter()
            .map(|s| decode_flexible(s))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|msg| ProcessException::new(analysis_ids.to_vec(), 500, msg))
    }

    /// `store_result(analysis_ids[], user_ids[], results[])`, `is_combined: true`.
    /// Success is exactly HTTP 204; anything else is a `ProcessException`.
    pub async fn store_result(
        &self,
        analysis_ids: &[String],
        user_ids: &[String],
        results: &[String],
    ) -> Result<(), ProcessException> {
        let token = self.token().await?;
        let response = self
            .http
            .post(format!("{}/analysis/result", self.base_url))
            .bearer_auth(token)
            .json(&StoreResultRequest {
                analysis_ids,
                user_ids,
                results,
                is_combined: true,
            })
            .send()
            .await
            .map_err(|e| transport_exception(analysis_ids, e))?;

        if response.status().as_u16() != 204 {
            return Err(ProcessException::new(
                analysis_ids.to_vec(),
                response.status().as_u16(),
                "obelisk store_result did not return 204".to_string(),
            ));
        }
        Ok(())
    }
}

async fn fetch_token(
    http: &reqwest::Client,
    base_url: &str,
    server_id: &str,
    server_secret: &str,
) -> Result<String, ProcessException> {
    let response = http
        .post(format!("{base_url}/protocol/openid-connect/token"))
        .basic_auth(server_id, Some(server_secret))
        .form(&[("grant_type", "client_credentials")])
        .send()
        .await
        .map_err(|e| ProcessException::new(Vec::<String>::new(), 500, format!("obelisk token request failed: {e}")))?;

    if !response.status().is_success() {
        return Err(ProcessException::new(
            Vec::<String>::new(),
            response.status().as_u16(),
            "obelisk token endpoint rejected credentials".to_string(),
        ));
    }

    let parsed: TokenResponse = response
        .json()
        .await
        .map_err(|e| ProcessException::new(Vec::<String>::new(), 500, format!("obelisk token response malformed: {e}")))?;
    Ok(parsed.access_token)
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Each element is hex- or base64-encoded; coerced to bytes.
fn decode_flexible(value: &str) -> Result<Vec<u8>, String> {
    if let Ok(bytes) = hex::decode(value) {
        return Ok(bytes);
    }
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(value)
        .map_err(|e| format!("value is neither hex nor base64: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_hex_values() {
        let decoded = decode_flexible("deadbeef").unwrap();
        assert_eq!(decoded, vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn decodes_base64_values_when_not_hex() {
        let decoded = decode_flexible("aGVsbG8=").unwrap();
        assert_eq!(decoded, b"hello");
    }
}
