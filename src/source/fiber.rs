use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::ws::{self, Subscription};
use crate::export::health::HealthMetrics;
use crate::observation::{ConfirmationBatch, Hash, Observation, ObservationMeta};

const AUTH_HEADER: &str = "x-api-key";
const TRANSACTIONS_STREAM: &str = "newTxs";
const PAYLOADS_STREAM: &str = "newExecutionPayloads";

/// Transaction as delivered on the relay's transaction stream.
#[derive(Debug, Deserialize)]
struct FiberTransaction {
    hash: Hash,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    input: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PayloadHeader {
    #[serde(default)]
    number: u64,
    hash: Hash,
}

#[derive(Debug, Deserialize)]
struct PayloadTransaction {
    hash: Hash,
}

/// Execution payload: the block header plus its transaction hashes.
#[derive(Debug, Deserialize)]
struct ExecutionPayload {
    header: PayloadHeader,
    #[serde(default)]
    transactions: Vec<PayloadTransaction>,
}

/// The primary relay. One connection is opened per endpoint and all of them
/// feed the same channel.
#[derive(Debug, Clone)]
pub struct FiberSource {
    name: String,
    endpoints: Vec<String>,
    api_key: String,
    connect_timeout: Duration,
}

impl FiberSource {
    pub fn new(
        name: impl Into<String>,
        endpoints: Vec<String>,
        api_key: String,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            endpoints,
            api_key,
            connect_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Streams transaction observations.
    pub async fn transactions(
        &self,
        tx: mpsc::Sender<Observation>,
        cancel: CancellationToken,
        health: Option<Arc<HealthMetrics>>,
    ) -> Result<Vec<JoinHandle<()>>> {
        self.spawn_readers(TRANSACTIONS_STREAM, tx, cancel, health, decode_transaction)
            .await
    }

    /// Streams one observation per execution payload, keyed by block hash.
    pub async fn blocks(
        &self,
        tx: mpsc::Sender<Observation>,
        cancel: CancellationToken,
        health: Option<Arc<HealthMetrics>>,
    ) -> Result<Vec<JoinHandle<()>>> {
        self.spawn_readers(PAYLOADS_STREAM, tx, cancel, health, decode_block)
            .await
    }

    /// Streams the transaction hashes of each execution payload as ground truth.
    pub async fn confirmations(
        &self,
        tx: mpsc::Sender<ConfirmationBatch>,
        cancel: CancellationToken,
        health: Option<Arc<HealthMetrics>>,
    ) -> Result<Vec<JoinHandle<()>>> {
        self.spawn_readers(PAYLOADS_STREAM, tx, cancel, health, decode_confirmation)
            .await
    }

    async fn spawn_readers<T, F>(
        &self,
        stream: &'static str,
        tx: mpsc::Sender<T>,
        cancel: CancellationToken,
        health: Option<Arc<HealthMetrics>>,
        decode: F,
    ) -> Result<Vec<JoinHandle<()>>>
    where
        T: Send + 'static,
        F: Fn(&str, i64) -> Result<Vec<T>> + Copy + Send + 'static,
    {
        let mut handles = Vec::with_capacity(self.endpoints.len());

        for endpoint in &self.endpoints {
            let sub = Subscription {
                endpoint: endpoint.clone(),
                auth_header: AUTH_HEADER,
                auth_value: self.api_key.clone(),
                stream,
                include: &[],
            };

            let conn = ws::subscribe(&sub, self.connect_timeout)
                .await
                .with_context(|| format!("{}: subscribing to {stream}", self.name))?;

            handles.push(tokio::spawn(ws::read_frames(
                conn,
                self.name.clone(),
                tx.clone(),
                cancel.clone(),
                health.clone(),
                decode,
            )));
        }

        Ok(handles)
    }
}

fn decode_transaction(text: &str, timestamp: i64) -> Result<Vec<Observation>> {
    let tx: FiberTransaction = ws::decode_notification(text)?;

    let meta = ObservationMeta::Transaction {
        from: tx.from.unwrap_or_default(),
        to: tx.to,
        calldata_size: tx.input.as_deref().map_or(0, calldata_size),
    };

    Ok(vec![Observation::new(tx.hash, timestamp).with_meta(meta)])
}

fn decode_block(text: &str, timestamp: i64) -> Result<Vec<Observation>> {
    let payload: ExecutionPayload = ws::decode_notification(text)?;

    let meta = ObservationMeta::Block {
        tx_count: payload.transactions.len() as u64,
    };

    Ok(vec![
        Observation::new(payload.header.hash, timestamp).with_meta(meta)
    ])
}

fn decode_confirmation(text: &str, _timestamp: i64) -> Result<Vec<ConfirmationBatch>> {
    let payload: ExecutionPayload = ws::decode_notification(text)?;

    Ok(vec![ConfirmationBatch {
        number: payload.header.number,
        hashes: payload.transactions.into_iter().map(|t| t.hash).collect(),
    }])
}

/// Byte length of hex-encoded calldata.
fn calldata_size(input: &str) -> u64 {
    let digits = input
        .strip_prefix("0x")
        .or_else(|| input.strip_prefix("0X"))
        .unwrap_or(input);
    (digits.len() / 2) as u64
}
