//! etcd store over the v3 JSON gateway
//!
//! Every call goes to the active endpoint. A transport failure rotates to the
//! next endpoint for the following call but is still reported to the caller;
//! retrying is the lock manager's decision, not the client's.

use std::time::Duration;

use async_trait::async_trait;
use batata_lock::{CoordinationStore, KeyValue, StoreError, Txn, TxnResponse};
use parking_lot::RwLock;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::config::EtcdConfig;
use crate::model::{
    AuthenticateRequest, AuthenticateResponse, DeleteRangeRequest, DeleteRangeResponse,
    GatewayError, GatewayTxnResponse, RangeRequest, RangeResponse, StatusResponse, TxnRequest,
    encode,
};

const STATUS_PATH: &str = "/v3/maintenance/status";
const AUTH_PATH: &str = "/v3/auth/authenticate";
const RANGE_PATH: &str = "/v3/kv/range";
const DELETE_RANGE_PATH: &str = "/v3/kv/deleterange";
const TXN_PATH: &str = "/v3/kv/txn";

/// [`CoordinationStore`] backed by an etcd v3 cluster
pub struct EtcdStore {
    client: Client,
    config: EtcdConfig,
    current_endpoint: RwLock<usize>,
    token: RwLock<Option<String>>,
}

impl EtcdStore {
    /// Connect to the first reachable endpoint and authenticate if configured
    pub async fn connect(config: EtcdConfig) -> Result<Self, StoreError> {
        let first = config.endpoints.first().cloned().ok_or_else(|| StoreError::Connect {
            endpoint: String::new(),
            message: "no endpoints configured".to_string(),
        })?;

        let client = Client::builder()
            .connect_timeout(config.dial_timeout())
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| StoreError::Connect {
                endpoint: first.clone(),
                message: e.to_string(),
            })?;

        let store = Self {
            client,
            config,
            current_endpoint: RwLock::new(0),
            token: RwLock::new(None),
        };

        store.probe().await?;
        if store.config.has_auth() {
            store.authenticate().await.map_err(|e| StoreError::Connect {
                endpoint: store.current_endpoint(),
                message: format!("authentication failed: {}", e),
            })?;
        }

        Ok(store)
    }

    pub fn config(&self) -> &EtcdConfig {
        &self.config
    }

    /// Endpoint the next call will go to
    pub fn current_endpoint(&self) -> String {
        let index = *self.current_endpoint.read();
        self.config.endpoints[index].clone()
    }

    fn switch_to_next_endpoint(&self) {
        let mut index = self.current_endpoint.write();
        *index = (*index + 1) % self.config.endpoints.len();
        debug!("Switched to etcd endpoint index: {}", *index);
    }

    fn build_url(&self, path: &str) -> String {
        format!("{}{}", self.current_endpoint().trim_end_matches('/'), path)
    }

    /// Find the first endpoint that answers a status request
    async fn probe(&self) -> Result<(), StoreError> {
        let mut last_error = None;

        for index in 0..self.config.endpoints.len() {
            *self.current_endpoint.write() = index;
            let endpoint = self.current_endpoint();

            match self
                .send::<_, StatusResponse>(STATUS_PATH, &serde_json::json!({}))
                .await
            {
                Ok(status) => {
                    info!(
                        endpoint,
                        version = %status.version,
                        revision = status.header.revision,
                        "Connected to etcd"
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(endpoint, error = %e, "etcd endpoint unreachable");
                    last_error = Some(StoreError::Connect {
                        endpoint,
                        message: e.to_string(),
                    });
                }
            }
        }

        *self.current_endpoint.write() = 0;
        Err(last_error.unwrap_or_else(|| StoreError::Connect {
            endpoint: String::new(),
            message: "no endpoints configured".to_string(),
        }))
    }

    /// Exchange the configured credentials for a token
    pub async fn authenticate(&self) -> Result<(), StoreError> {
        let request = AuthenticateRequest {
            name: self.config.username.clone(),
            password: self.config.password.clone(),
        };
        let response: AuthenticateResponse = self.send(AUTH_PATH, &request).await?;
        if response.token.is_empty() {
            return Err(StoreError::Codec(
                "authenticate response carries no token".to_string(),
            ));
        }

        *self.token.write() = Some(response.token);
        debug!(user = %self.config.username, "Authenticated with etcd");
        Ok(())
    }

    /// POST a JSON body, re-authenticating once if the token was rejected
    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, StoreError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        match self.send(path, body).await {
            Err(StoreError::Status { code, .. })
                if code == StatusCode::UNAUTHORIZED.as_u16() && self.config.has_auth() =>
            {
                warn!("etcd token rejected, re-authenticating...");
                self.authenticate().await?;
                self.send(path, body).await
            }
            other => other,
        }
    }

    async fn send<B, T>(&self, path: &str, body: &B) -> Result<T, StoreError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.build_url(path);
        let token = self.token.read().clone();
        let mut request = self.client.post(&url).json(body);
        if let Some(token) = token {
            request = request.header("Authorization", token);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("Request to {} failed: {}, switching to next endpoint", url, e);
                self.switch_to_next_endpoint();
                return Err(transport_error(e, self.config.request_timeout()));
            }
        };

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport_error(e, self.config.request_timeout()))?;

        if !status.is_success() {
            let body = String::from_utf8_lossy(&bytes);
            return Err(StoreError::Status {
                code: status.as_u16(),
                message: GatewayError::describe(&body),
            });
        }

        Ok(serde_json::from_slice(&bytes)?)
    }
}

fn transport_error(err: reqwest::Error, timeout: Duration) -> StoreError {
    if err.is_timeout() {
        StoreError::Timeout(timeout)
    } else {
        StoreError::Transport(err.to_string())
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError> {
        let request = RangeRequest {
            key: encode(key.as_bytes()),
        };
        let response: RangeResponse = self.post(RANGE_PATH, &request).await?;
        response.first()
    }

    async fn delete(&self, key: &str) -> Result<u64, StoreError> {
        let request = DeleteRangeRequest {
            key: encode(key.as_bytes()),
        };
        let response: DeleteRangeResponse = self.post(DELETE_RANGE_PATH, &request).await?;
        Ok(response.deleted)
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResponse, StoreError> {
        let request = TxnRequest::from(&txn);
        let response: GatewayTxnResponse = self.post(TXN_PATH, &request).await?;
        response.into_txn_response()
    }
}
