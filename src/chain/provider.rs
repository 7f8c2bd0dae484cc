//! Default JSON-RPC chain reader
//!
//! Scans spoke pool logs over HTTP and decodes them by topic signature.
//! Indexed parameters are read from topics, the remainder from 32-byte data
//! words, matching the spoke pool event layout. Provider selection, failover
//! and retry policy live outside this crate; this reader speaks to the one
//! configured endpoint.

use super::{ChainReader, EventBatch};
use crate::config::ChainConfig;
use crate::error::{DataworkerError, DataworkerResult};
use crate::events::{Deposit, Fill, RouteUpdate, SlowFillRequest, TokensBridged};

use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{Address, Filter, Log, TransactionRequest, H256, U256};
use lazy_static::lazy_static;
use sha3::{Digest, Keccak256};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

fn event_topic(signature: &str) -> H256 {
    H256::from_slice(&Keccak256::digest(signature.as_bytes()))
}

lazy_static! {
    static ref FUNDS_DEPOSITED: H256 = event_topic(
        "FundsDeposited(uint32,address,uint256,uint256,uint256,uint32,uint32,address,address)"
    );
    static ref FILLED_RELAY: H256 = event_topic(
        "FilledRelay(uint32,uint256,address,uint256,uint256,uint256,uint256,bool)"
    );
    static ref REQUESTED_SLOW_FILL: H256 =
        event_topic("RequestedSlowFill(uint32,uint256,uint256)");
    static ref ENABLED_DEPOSIT_ROUTE: H256 =
        event_topic("EnabledDepositRoute(address,uint256,bool,uint32)");
    static ref TOKENS_BRIDGED: H256 =
        event_topic("TokensBridged(address,uint256,uint32)");
}

/// HTTP JSON-RPC backed reader for one chain
pub struct RpcChainReader {
    config: ChainConfig,
    provider: Provider<Http>,
    read_timeout: Duration,
}

impl RpcChainReader {
    pub fn new(config: ChainConfig, read_timeout_secs: u64) -> DataworkerResult<Self> {
        let provider = Provider::<Http>::try_from(config.rpc_url.as_str())
            .map_err(|e| DataworkerError::Config(format!("Bad RPC URL: {}", e)))?;
        Ok(Self {
            config,
            provider,
            read_timeout: Duration::from_secs(read_timeout_secs),
        })
    }

    fn spoke_pool(&self) -> DataworkerResult<Address> {
        self.config
            .spoke_pool_address
            .parse()
            .map_err(|e| DataworkerError::Config(format!("Bad spoke pool address: {}", e)))
    }

    async fn head_block(&self) -> DataworkerResult<u64> {
        let head = timeout(self.read_timeout, self.provider.get_block_number())
            .await
            .map_err(|_| DataworkerError::Timeout {
                operation: format!("eth_blockNumber on chain {}", self.config.chain_id),
            })?
            .map_err(|e| DataworkerError::ChainUnavailable {
                chain_id: self.config.chain_id,
                message: e.to_string(),
            })?;
        Ok(head.as_u64())
    }

    fn decode(&self, log: &Log, batch: &mut EventBatch) -> DataworkerResult<()> {
        let chain_id = self.config.chain_id;
        let block_number = log.block_number.map(|b| b.as_u64()).unwrap_or(0);
        let transaction_hash = log.transaction_hash.unwrap_or_default();
        let topic0 = log.topics.first().copied().unwrap_or_default();

        if topic0 == *FUNDS_DEPOSITED {
            batch.deposits.push(Deposit {
                deposit_id: u32_from_topic(log, 1)?,
                origin_chain_id: chain_id,
                destination_chain_id: word(log, 0)?.as_u64(),
                depositor: address_from_topic(log, 2)?,
                recipient: address_word(log, 4)?,
                input_token: address_word(log, 5)?,
                amount: word(log, 1)?,
                relayer_fee_pct: word(log, 2)?,
                quote_timestamp: word(log, 3)?.as_u32(),
                fill_deadline: word(log, 6)?.as_u32(),
                block_number,
                transaction_hash,
            });
        } else if topic0 == *FILLED_RELAY {
            batch.fills.push(Fill {
                deposit_id: u32_from_topic(log, 1)?,
                origin_chain_id: u256_from_topic(log, 2)?.as_u64(),
                destination_chain_id: chain_id,
                repayment_chain_id: word(log, 3)?.as_u64(),
                relayer: address_from_topic(log, 3)?,
                fill_amount: word(log, 0)?,
                total_filled_amount: word(log, 1)?,
                relayer_fee_pct: word(log, 2)?,
                is_slow_relay: !word(log, 4)?.is_zero(),
                block_number,
                transaction_hash,
            });
        } else if topic0 == *REQUESTED_SLOW_FILL {
            batch.slow_fill_requests.push(SlowFillRequest {
                deposit_id: u32_from_topic(log, 1)?,
                origin_chain_id: u256_from_topic(log, 2)?.as_u64(),
                destination_chain_id: chain_id,
                block_number,
                transaction_hash,
            });
        } else if topic0 == *ENABLED_DEPOSIT_ROUTE {
            batch.route_updates.push(RouteUpdate {
                origin_chain_id: chain_id,
                origin_token: address_from_topic(log, 1)?,
                destination_chain_id: word(log, 0)?.as_u64(),
                enabled: !word(log, 1)?.is_zero(),
                effective_timestamp: word(log, 2)?.as_u32(),
                block_number,
            });
        } else if topic0 == *TOKENS_BRIDGED {
            batch.tokens_bridged.push(TokensBridged {
                chain_id,
                l2_token_address: address_from_topic(log, 1)?,
                amount_to_return: word(log, 0)?,
                leaf_id: word(log, 1)?.as_u32(),
                block_number,
                transaction_hash,
            });
        } else {
            debug!(chain_id, topic = ?topic0, "Skipping unrecognized log topic");
        }

        Ok(())
    }
}

fn topic(log: &Log, index: usize) -> DataworkerResult<H256> {
    log.topics
        .get(index)
        .copied()
        .ok_or_else(|| DataworkerError::EventDecoding(format!("missing topic {}", index)))
}

fn u32_from_topic(log: &Log, index: usize) -> DataworkerResult<u32> {
    Ok(U256::from_big_endian(topic(log, index)?.as_bytes()).as_u32())
}

fn u256_from_topic(log: &Log, index: usize) -> DataworkerResult<U256> {
    Ok(U256::from_big_endian(topic(log, index)?.as_bytes()))
}

fn address_from_topic(log: &Log, index: usize) -> DataworkerResult<Address> {
    Ok(Address::from_slice(&topic(log, index)?.as_bytes()[12..32]))
}

/// The `index`-th 32-byte word of the log data
fn word(log: &Log, index: usize) -> DataworkerResult<U256> {
    let start = index * 32;
    let end = start + 32;
    if log.data.len() < end {
        return Err(DataworkerError::EventDecoding(format!(
            "log data too short: need word {}, have {} bytes",
            index,
            log.data.len()
        )));
    }
    Ok(U256::from_big_endian(&log.data[start..end]))
}

/// The `index`-th data word interpreted as an address
fn address_word(log: &Log, index: usize) -> DataworkerResult<Address> {
    let value = word(log, index)?;
    let mut buf = [0u8; 32];
    value.to_big_endian(&mut buf);
    Ok(Address::from_slice(&buf[12..32]))
}

#[async_trait]
impl ChainReader for RpcChainReader {
    async fn read(
        &self,
        chain_id: u64,
        from_block: u64,
        to_block: u64,
    ) -> DataworkerResult<EventBatch> {
        let mut batch = EventBatch {
            chain_id,
            last_block: to_block,
            ..Default::default()
        };
        if to_block < from_block {
            return Ok(batch);
        }

        // A head behind the requested range means the chain view regressed
        // since the range was derived
        let head = self.head_block().await?;
        if head < to_block {
            return Err(DataworkerError::ReorgSuspected {
                chain_id,
                block_number: head,
            });
        }

        let filter = Filter::new()
            .address(self.spoke_pool()?)
            .from_block(from_block)
            .to_block(to_block);

        let logs = timeout(self.read_timeout, self.provider.get_logs(&filter))
            .await
            .map_err(|_| DataworkerError::Timeout {
                operation: format!("eth_getLogs on chain {}", chain_id),
            })?
            .map_err(|e| DataworkerError::ChainUnavailable {
                chain_id,
                message: e.to_string(),
            })?;

        for log in &logs {
            if let Err(e) = self.decode(log, &mut batch) {
                // A malformed log is a contract/reader contract violation;
                // skip it rather than poison the whole range
                warn!(chain_id, error = %e, "Failed to decode log");
            }
        }

        debug!(
            chain_id,
            from_block,
            to_block,
            deposits = batch.deposits.len(),
            fills = batch.fills.len(),
            tokens_bridged = batch.tokens_bridged.len(),
            "Scanned block range"
        );

        Ok(batch)
    }

    async fn latest_block(&self, _chain_id: u64) -> DataworkerResult<u64> {
        let head = self.head_block().await?;
        Ok(head.saturating_sub(self.config.confirmation_blocks))
    }

    async fn token_balance(
        &self,
        chain_id: u64,
        token: Address,
        holder: Address,
    ) -> DataworkerResult<U256> {
        // balanceOf(address)
        let mut data = vec![0x70, 0xa0, 0x82, 0x31];
        data.extend_from_slice(&[0u8; 12]);
        data.extend_from_slice(holder.as_bytes());

        let call = TransactionRequest::new().to(token).data(data);
        let result = timeout(
            self.read_timeout,
            self.provider.call(&call.into(), None),
        )
        .await
        .map_err(|_| DataworkerError::Timeout {
            operation: format!("balanceOf on chain {}", chain_id),
        })?
        .map_err(|e| DataworkerError::ChainUnavailable {
            chain_id,
            message: e.to_string(),
        })?;

        if result.len() < 32 {
            return Err(DataworkerError::EventDecoding(
                "balanceOf returned short data".into(),
            ));
        }
        Ok(U256::from_big_endian(&result[..32]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::Bytes;

    fn reader() -> RpcChainReader {
        RpcChainReader::new(
            ChainConfig {
                chain_id: 10,
                name: "test".into(),
                rpc_url: "http://localhost:8545".into(),
                spoke_pool_address: "0x00000000000000000000000000000000000000aa".into(),
                confirmation_blocks: 32,
                protocol_family: crate::config::ProtocolFamily::Optimistic,
                bridge_portal_address: "0x00000000000000000000000000000000000000ee".into(),
                finalization_delay_blocks: 0,
                enabled: true,
            },
            30,
        )
        .unwrap()
    }

    fn word_bytes(values: &[U256]) -> Bytes {
        let mut data = Vec::new();
        for value in values {
            let mut buf = [0u8; 32];
            value.to_big_endian(&mut buf);
            data.extend_from_slice(&buf);
        }
        Bytes::from(data)
    }

    #[test]
    fn decodes_tokens_bridged_log() {
        let token = Address::repeat_byte(0x11);
        let log = Log {
            address: Address::repeat_byte(0xaa),
            topics: vec![*TOKENS_BRIDGED, H256::from(token)],
            data: word_bytes(&[U256::from(500u64), U256::from(3u64)]),
            block_number: Some(42.into()),
            transaction_hash: Some(H256::repeat_byte(0x99)),
            ..Default::default()
        };

        let mut batch = EventBatch::default();
        reader().decode(&log, &mut batch).unwrap();

        assert_eq!(batch.tokens_bridged.len(), 1);
        let event = &batch.tokens_bridged[0];
        assert_eq!(event.l2_token_address, token);
        assert_eq!(event.amount_to_return, U256::from(500u64));
        assert_eq!(event.leaf_id, 3);
        assert_eq!(event.block_number, 42);
    }

    #[test]
    fn short_data_is_a_decoding_error() {
        let log = Log {
            topics: vec![*TOKENS_BRIDGED, H256::from(Address::repeat_byte(0x11))],
            data: word_bytes(&[U256::from(500u64)]), // missing leaf id word
            ..Default::default()
        };

        let mut batch = EventBatch::default();
        assert!(reader().decode(&log, &mut batch).is_err());
        assert!(batch.tokens_bridged.is_empty());
    }
}
