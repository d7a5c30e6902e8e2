//! etcd v3 JSON gateway wire types
//!
//! Keys and values travel base64 encoded. 64-bit integers are rendered as JSON
//! strings by the gateway, and fields holding their proto3 default are left
//! out entirely, so every response field has a serde default.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use batata_lock::{
    Compare, CompareTarget, KeyValue, StoreError, Txn, TxnOp, TxnOpResponse, TxnResponse,
};
use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, PickFirst, serde_as};

pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode(text: &str) -> Result<Vec<u8>, StoreError> {
    STANDARD
        .decode(text)
        .map_err(|e| StoreError::Codec(format!("invalid base64 in response: {}", e)))
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RangeRequest {
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PutRequest {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeleteRangeRequest {
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOp {
    RequestRange(RangeRequest),
    RequestPut(PutRequest),
    RequestDeleteRange(DeleteRangeRequest),
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewayCompare {
    pub key: String,
    pub result: &'static str,
    pub target: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_revision: Option<i64>,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mod_revision: Option<i64>,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TxnRequest {
    pub compare: Vec<GatewayCompare>,
    pub success: Vec<RequestOp>,
    pub failure: Vec<RequestOp>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthenticateRequest {
    pub name: String,
    pub password: String,
}

impl From<&Compare> for GatewayCompare {
    fn from(compare: &Compare) -> Self {
        let mut out = GatewayCompare {
            key: encode(compare.key.as_bytes()),
            result: "EQUAL",
            target: "",
            value: None,
            create_revision: None,
            mod_revision: None,
            version: None,
        };
        match &compare.target {
            CompareTarget::Value(value) => {
                out.target = "VALUE";
                out.value = Some(encode(value));
            }
            CompareTarget::CreateRevision(revision) => {
                out.target = "CREATE";
                out.create_revision = Some(*revision);
            }
            CompareTarget::ModRevision(revision) => {
                out.target = "MOD";
                out.mod_revision = Some(*revision);
            }
            CompareTarget::Version(version) => {
                out.target = "VERSION";
                out.version = Some(*version);
            }
        }
        out
    }
}

impl From<&TxnOp> for RequestOp {
    fn from(op: &TxnOp) -> Self {
        match op {
            TxnOp::Get { key } => RequestOp::RequestRange(RangeRequest {
                key: encode(key.as_bytes()),
            }),
            TxnOp::Put { key, value } => RequestOp::RequestPut(PutRequest {
                key: encode(key.as_bytes()),
                value: encode(value),
            }),
            TxnOp::Delete { key } => RequestOp::RequestDeleteRange(DeleteRangeRequest {
                key: encode(key.as_bytes()),
            }),
        }
    }
}

impl From<&Txn> for TxnRequest {
    fn from(txn: &Txn) -> Self {
        TxnRequest {
            compare: txn.compare.iter().map(GatewayCompare::from).collect(),
            success: txn.success.iter().map(RequestOp::from).collect(),
            failure: txn.failure.iter().map(RequestOp::from).collect(),
        }
    }
}

// ============================================================================
// Responses
// ============================================================================

#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ResponseHeader {
    #[serde_as(as = "PickFirst<(DisplayFromStr, _)>")]
    #[serde(default)]
    pub revision: i64,
}

#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GatewayKeyValue {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde_as(as = "PickFirst<(DisplayFromStr, _)>")]
    #[serde(default)]
    pub create_revision: i64,
    #[serde_as(as = "PickFirst<(DisplayFromStr, _)>")]
    #[serde(default)]
    pub mod_revision: i64,
    #[serde_as(as = "PickFirst<(DisplayFromStr, _)>")]
    #[serde(default)]
    pub version: i64,
}

impl TryFrom<&GatewayKeyValue> for KeyValue {
    type Error = StoreError;

    fn try_from(kv: &GatewayKeyValue) -> Result<Self, Self::Error> {
        let key = String::from_utf8(decode(&kv.key)?)
            .map_err(|e| StoreError::Codec(format!("key is not valid UTF-8: {}", e)))?;
        Ok(KeyValue {
            key,
            value: decode(&kv.value)?,
            create_revision: kv.create_revision,
            mod_revision: kv.mod_revision,
            version: kv.version,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RangeResponse {
    #[serde(default)]
    pub header: ResponseHeader,
    #[serde(default)]
    pub kvs: Vec<GatewayKeyValue>,
}

impl RangeResponse {
    pub fn first(&self) -> Result<Option<KeyValue>, StoreError> {
        self.kvs.first().map(KeyValue::try_from).transpose()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PutResponse {
    #[serde(default)]
    pub header: ResponseHeader,
}

#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DeleteRangeResponse {
    #[serde(default)]
    pub header: ResponseHeader,
    #[serde_as(as = "PickFirst<(DisplayFromStr, _)>")]
    #[serde(default)]
    pub deleted: u64,
}

/// Exactly one field is set, matching the request op at the same position
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ResponseOp {
    #[serde(default)]
    pub response_range: Option<RangeResponse>,
    #[serde(default)]
    pub response_put: Option<PutResponse>,
    #[serde(default)]
    pub response_delete_range: Option<DeleteRangeResponse>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GatewayTxnResponse {
    #[serde(default)]
    pub header: ResponseHeader,
    #[serde(default)]
    pub succeeded: bool,
    #[serde(default)]
    pub responses: Vec<ResponseOp>,
}

impl GatewayTxnResponse {
    pub fn into_txn_response(self) -> Result<TxnResponse, StoreError> {
        let revision = self.header.revision;
        let responses = self
            .responses
            .iter()
            .map(|op| match op {
                ResponseOp {
                    response_range: Some(range),
                    ..
                } => Ok(TxnOpResponse::Get(range.first()?)),
                // Every write in a transaction commits at the transaction's revision
                ResponseOp {
                    response_put: Some(put),
                    ..
                } => Ok(TxnOpResponse::Put {
                    revision: if put.header.revision > 0 {
                        put.header.revision
                    } else {
                        revision
                    },
                }),
                ResponseOp {
                    response_delete_range: Some(delete),
                    ..
                } => Ok(TxnOpResponse::Delete {
                    deleted: delete.deleted,
                }),
                _ => Err(StoreError::Codec(
                    "transaction response op carries no result".to_string(),
                )),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TxnResponse {
            succeeded: self.succeeded,
            revision,
            responses,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthenticateResponse {
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusResponse {
    #[serde(default)]
    pub header: ResponseHeader,
    #[serde(default)]
    pub version: String,
}

/// Error body returned by the gateway on non-2xx responses
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayError {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub message: String,
}

impl GatewayError {
    pub fn describe(body: &str) -> String {
        match serde_json::from_str::<GatewayError>(body) {
            Ok(err) if !err.message.is_empty() => err.message,
            Ok(err) if !err.error.is_empty() => err.error,
            _ => body.to_string(),
        }
    }
}
