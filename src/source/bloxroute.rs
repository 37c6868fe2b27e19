use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::ws::{self, Subscription};
use crate::export::health::HealthMetrics;
use crate::observation::{Hash, Observation, ObservationMeta};

const AUTH_HEADER: &str = "Authorization";

#[derive(Debug, Deserialize)]
struct BlxrTransaction {
    #[serde(alias = "txHash")]
    tx_hash: Hash,
    #[serde(default, alias = "txContents")]
    tx_contents: Option<BlxrTxContents>,
}

#[derive(Debug, Deserialize)]
struct BlxrTxContents {
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    input: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BlxrBlock {
    hash: Hash,
    #[serde(default)]
    transactions: Vec<serde_json::Value>,
}

/// The broadcast network feed.
#[derive(Debug, Clone)]
pub struct BloxrouteSource {
    name: String,
    endpoint: String,
    api_key: String,
    connect_timeout: Duration,
}

impl BloxrouteSource {
    pub fn new(
        name: impl Into<String>,
        endpoint: String,
        api_key: String,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint,
            api_key,
            connect_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Streams `newTxs` as transaction observations.
    pub async fn transactions(
        &self,
        tx: mpsc::Sender<Observation>,
        cancel: CancellationToken,
        health: Option<Arc<HealthMetrics>>,
    ) -> Result<JoinHandle<()>> {
        let sub = self.subscription("newTxs", &["tx_hash", "tx_contents"]);
        let conn = ws::subscribe(&sub, self.connect_timeout)
            .await
            .with_context(|| format!("{}: subscribing to newTxs", self.name))?;

        Ok(tokio::spawn(ws::read_frames(
            conn,
            self.name.clone(),
            tx,
            cancel,
            health,
            decode_transaction,
        )))
    }

    /// Streams `bdnBlocks` as block observations.
    pub async fn blocks(
        &self,
        tx: mpsc::Sender<Observation>,
        cancel: CancellationToken,
        health: Option<Arc<HealthMetrics>>,
    ) -> Result<JoinHandle<()>> {
        let sub = self.subscription("bdnBlocks", &["hash", "header", "transactions"]);
        let conn = ws::subscribe(&sub, self.connect_timeout)
            .await
            .with_context(|| format!("{}: subscribing to bdnBlocks", self.name))?;

        Ok(tokio::spawn(ws::read_frames(
            conn,
            self.name.clone(),
            tx,
            cancel,
            health,
            decode_block,
        )))
    }

    fn subscription(
        &self,
        stream: &'static str,
        include: &'static [&'static str],
    ) -> Subscription {
        Subscription {
            endpoint: self.endpoint.clone(),
            auth_header: AUTH_HEADER,
            auth_value: self.api_key.clone(),
            stream,
            include,
        }
    }
}

fn decode_transaction(text: &str, timestamp: i64) -> Result<Vec<Observation>> {
    let tx: BlxrTransaction = ws::decode_notification(text)?;

    let obs = Observation::new(tx.tx_hash, timestamp);
    let obs = match tx.tx_contents {
        Some(contents) => obs.with_meta(ObservationMeta::Transaction {
            from: contents.from.unwrap_or_default(),
            to: contents.to,
            calldata_size: contents
                .input
                .as_deref()
                .map_or(0, |input| (input.trim_start_matches("0x").len() / 2) as u64),
        }),
        None => obs,
    };

    Ok(vec![obs])
}

fn decode_block(text: &str, timestamp: i64) -> Result<Vec<Observation>> {
    let block: BlxrBlock = ws::decode_notification(text)?;

    Ok(vec![Observation::new(block.hash, timestamp).with_meta(
        ObservationMeta::Block {
            tx_count: block.transactions.len() as u64,
        },
    )])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_transaction_snake_and_camel_case() {
        let hash = Hash::from_low_u64(5);

        let snake = format!(r#"{{"params":{{"result":{{"tx_hash":"{hash}"}}}}}}"#);
        let obs = decode_transaction(&snake, 9).unwrap();
        assert_eq!(obs[0].hash, hash);
        assert_eq!(obs[0].meta, ObservationMeta::None);

        let camel = format!(
            r#"{{"params":{{"result":{{"txHash":"{hash}","txContents":{{"from":"0xf","to":"0xt","input":"0xdeadbeef"}}}}}}}}"#
        );
        let obs = decode_transaction(&camel, 9).unwrap();
        assert_eq!(
            obs[0].meta,
            ObservationMeta::Transaction {
                from: "0xf".to_string(),
                to: Some("0xt".to_string()),
                calldata_size: 4,
            }
        );
    }

    #[test]
    fn test_decode_block() {
        let hash = Hash::from_low_u64(77);
        let text = format!(
            r#"{{"params":{{"result":{{"hash":"{hash}","header":{{}},"transactions":[{{}},{{}},{{}}]}}}}}}"#
        );
        let obs = decode_block(&text, 1).unwrap();
        assert_eq!(obs[0].hash, hash);
        assert_eq!(obs[0].meta, ObservationMeta::Block { tx_count: 3 });
    }

    #[test]
    fn test_subscription_confirmation_is_not_a_payload() {
        let text = r#"{"jsonrpc":"2.0","id":1,"result":"8f3a-subscription"}"#;
        assert!(decode_transaction(text, 0).is_err());
    }
}
