//! Default bridge connector speaking to a chain's withdrawal portal
//!
//! The portal contract exposes a uniform surface across protocol families:
//! message lookup and status by (transaction, ordered log index), plus
//! prove/finalize entry points. Family differences surface only through the
//! status values the portal reports, so one connector serves all families.

use super::{AggregateCall, BridgeConnector, BridgeMessage, WithdrawalStatus};
use crate::config::ChainConfig;
use crate::error::{DataworkerError, DataworkerResult};
use crate::events::TokensBridged;

use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{Address, Bytes, TransactionRequest, H256, U256};
use sha3::{Digest, Keccak256};
use std::time::Duration;
use tokio::time::timeout;

fn selector(signature: &str) -> [u8; 4] {
    let digest = Keccak256::digest(signature.as_bytes());
    [digest[0], digest[1], digest[2], digest[3]]
}

fn portal_call(sel: [u8; 4], transaction_hash: H256, log_index: usize) -> Vec<u8> {
    let mut data = sel.to_vec();
    data.extend_from_slice(transaction_hash.as_bytes());
    let mut index_word = [0u8; 32];
    U256::from(log_index).to_big_endian(&mut index_word);
    data.extend_from_slice(&index_word);
    data
}

pub struct RpcBridgeConnector {
    config: ChainConfig,
    provider: Provider<Http>,
    read_timeout: Duration,
}

impl RpcBridgeConnector {
    pub fn new(config: ChainConfig, read_timeout_secs: u64) -> DataworkerResult<Self> {
        let provider = Provider::<Http>::try_from(config.rpc_url.as_str())
            .map_err(|e| DataworkerError::Config(format!("Bad RPC URL: {}", e)))?;
        Ok(Self {
            config,
            provider,
            read_timeout: Duration::from_secs(read_timeout_secs),
        })
    }

    fn portal(&self) -> DataworkerResult<Address> {
        self.config
            .bridge_portal_address
            .parse()
            .map_err(|e| DataworkerError::Config(format!("Bad bridge portal address: {}", e)))
    }

    async fn call_portal(&self, data: Vec<u8>) -> DataworkerResult<Bytes> {
        let request = TransactionRequest::new().to(self.portal()?).data(data);
        timeout(self.read_timeout, self.provider.call(&request.into(), None))
            .await
            .map_err(|_| DataworkerError::Timeout {
                operation: format!("portal call on chain {}", self.config.chain_id),
            })?
            .map_err(|e| DataworkerError::Bridge {
                chain_id: self.config.chain_id,
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl BridgeConnector for RpcBridgeConnector {
    async fn resolve_message(
        &self,
        event: TokensBridged,
        log_index: usize,
    ) -> DataworkerResult<BridgeMessage> {
        let data = portal_call(
            selector("messageNonce(bytes32,uint256)"),
            event.transaction_hash,
            log_index,
        );
        let result = self.call_portal(data).await?;
        if result.len() < 32 {
            return Err(DataworkerError::Bridge {
                chain_id: self.config.chain_id,
                message: "messageNonce returned short data".into(),
            });
        }

        Ok(BridgeMessage {
            chain_id: self.config.chain_id,
            transaction_hash: event.transaction_hash,
            log_index,
            nonce: U256::from_big_endian(&result[..32]),
        })
    }

    async fn message_status(&self, message: BridgeMessage) -> DataworkerResult<WithdrawalStatus> {
        let data = portal_call(
            selector("messageStatus(bytes32,uint256)"),
            message.transaction_hash,
            message.log_index,
        );
        let result = self.call_portal(data).await?;
        if result.len() < 32 {
            return Err(DataworkerError::Bridge {
                chain_id: self.config.chain_id,
                message: "messageStatus returned short data".into(),
            });
        }

        match U256::from_big_endian(&result[..32]).as_u64() {
            0 => Ok(WithdrawalStatus::Unconfirmed),
            1 => Ok(WithdrawalStatus::ReadyToProve),
            2 => Ok(WithdrawalStatus::Proved),
            3 => Ok(WithdrawalStatus::ReadyToFinalize),
            4 => Ok(WithdrawalStatus::Finalized),
            other => Err(DataworkerError::Bridge {
                chain_id: self.config.chain_id,
                message: format!("unknown withdrawal status {}", other),
            }),
        }
    }

    async fn prove_call(&self, message: BridgeMessage) -> DataworkerResult<AggregateCall> {
        Ok(AggregateCall {
            target: self.portal()?,
            call_data: Bytes::from(portal_call(
                selector("proveWithdrawal(bytes32,uint256)"),
                message.transaction_hash,
                message.log_index,
            )),
        })
    }

    async fn finalize_call(&self, message: BridgeMessage) -> DataworkerResult<AggregateCall> {
        Ok(AggregateCall {
            target: self.portal()?,
            call_data: Bytes::from(portal_call(
                selector("finalizeWithdrawal(bytes32,uint256)"),
                message.transaction_hash,
                message.log_index,
            )),
        })
    }
}

/// Multicall-backed aggregator submitting batched calls in one transaction,
/// signed by the node the dataworker is pointed at
pub struct RpcCallAggregator {
    provider: Provider<Http>,
    multicall_address: Address,
}

impl RpcCallAggregator {
    pub fn new(rpc_url: &str, multicall_address: &str) -> DataworkerResult<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| DataworkerError::Config(format!("Bad RPC URL: {}", e)))?;
        let multicall_address = multicall_address
            .parse()
            .map_err(|e| DataworkerError::Config(format!("Bad multicall address: {}", e)))?;
        Ok(Self {
            provider,
            multicall_address,
        })
    }
}

#[async_trait]
impl super::CallAggregator for RpcCallAggregator {
    async fn submit(&self, calls: Vec<AggregateCall>) -> DataworkerResult<H256> {
        use ethers::abi::{self, Token};

        // aggregate((address,bytes)[])
        let mut data = selector("aggregate((address,bytes)[])").to_vec();
        data.extend_from_slice(&abi::encode(&[Token::Array(
            calls
                .into_iter()
                .map(|call| {
                    Token::Tuple(vec![
                        Token::Address(call.target),
                        Token::Bytes(call.call_data.to_vec()),
                    ])
                })
                .collect(),
        )]));

        let request = TransactionRequest::new()
            .to(self.multicall_address)
            .data(data);
        let pending = self
            .provider
            .send_transaction(request, None)
            .await
            .map_err(|e| {
                let message = e.to_string();
                if message.contains("revert") {
                    DataworkerError::Reverted { reason: message }
                } else {
                    DataworkerError::ChainUnavailable {
                        chain_id: 0,
                        message,
                    }
                }
            })?;
        Ok(pending.tx_hash())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn portal_call_layout_is_selector_then_words() {
        let data = portal_call([0xde, 0xad, 0xbe, 0xef], H256::repeat_byte(0x11), 2);
        assert_eq!(data.len(), 4 + 32 + 32);
        assert_eq!(&data[..4], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(&data[4..36], H256::repeat_byte(0x11).as_bytes());
        assert_eq!(data[67], 2);
    }
}
