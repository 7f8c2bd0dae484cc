//! Default hub pool adapter
//!
//! Reads bundle state via eth_call and submits writes via
//! eth_sendTransaction, leaving key management to the node the dataworker is
//! pointed at. Calldata is built from computed selectors plus ABI-encoded
//! arguments; leaf structures are flattened in field order.

use super::{HubPool, PendingBundle};
use crate::bundle::leaves::{PoolRebalanceLeaf, RelayerRefundLeaf};
use crate::bundle::BundleBlockRange;
use crate::error::{DataworkerError, DataworkerResult};

use async_trait::async_trait;
use ethers::abi::{self, ParamType, Token};
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{Address, Bytes, TransactionRequest, H256, U256};
use sha3::{Digest, Keccak256};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

fn selector(signature: &str) -> [u8; 4] {
    let digest = Keccak256::digest(signature.as_bytes());
    [digest[0], digest[1], digest[2], digest[3]]
}

fn encode_call(sel: [u8; 4], tokens: &[Token]) -> Vec<u8> {
    let mut data = sel.to_vec();
    data.extend_from_slice(&abi::encode(tokens));
    data
}

fn range_token(range: &BundleBlockRange) -> Token {
    Token::Tuple(vec![
        Token::Uint(U256::from(range.chain_id)),
        Token::Uint(U256::from(range.start_block)),
        Token::Uint(U256::from(range.end_block)),
    ])
}

pub struct RpcHubPool {
    provider: Provider<Http>,
    hub_address: Address,
    read_timeout: Duration,
}

impl RpcHubPool {
    pub fn new(
        rpc_url: &str,
        hub_address: &str,
        read_timeout_secs: u64,
    ) -> DataworkerResult<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| DataworkerError::Config(format!("Bad RPC URL: {}", e)))?;
        let hub_address = hub_address
            .parse()
            .map_err(|e| DataworkerError::Config(format!("Bad hub pool address: {}", e)))?;
        Ok(Self {
            provider,
            hub_address,
            read_timeout: Duration::from_secs(read_timeout_secs),
        })
    }

    async fn read(&self, data: Vec<u8>) -> DataworkerResult<Bytes> {
        let request = TransactionRequest::new().to(self.hub_address).data(data);
        timeout(self.read_timeout, self.provider.call(&request.into(), None))
            .await
            .map_err(|_| DataworkerError::Timeout {
                operation: "hub pool call".into(),
            })?
            .map_err(|e| DataworkerError::ChainUnavailable {
                chain_id: 0,
                message: e.to_string(),
            })
    }

    async fn write(&self, data: Vec<u8>) -> DataworkerResult<H256> {
        let request = TransactionRequest::new().to(self.hub_address).data(data);
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

    fn fixed_bytes_32(token: Token) -> DataworkerResult<[u8; 32]> {
        let bytes = token
            .into_fixed_bytes()
            .ok_or_else(|| DataworkerError::EventDecoding("expected bytes32".into()))?;
        if bytes.len() != 32 {
            return Err(DataworkerError::EventDecoding("expected 32 bytes".into()));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(out)
    }

    fn uint(token: Token) -> DataworkerResult<U256> {
        token
            .into_uint()
            .ok_or_else(|| DataworkerError::EventDecoding("expected uint".into()))
    }
}

#[async_trait]
impl HubPool for RpcHubPool {
    async fn pending_bundle(&self) -> DataworkerResult<Option<PendingBundle>> {
        let data = encode_call(selector("rootBundleProposal()"), &[]);
        let raw = self.read(data).await?;

        let mut tokens = abi::decode(
            &[
                ParamType::FixedBytes(32),
                ParamType::FixedBytes(32),
                ParamType::FixedBytes(32),
                ParamType::Uint(256),
                ParamType::Uint(256),
                ParamType::Uint(256),
                ParamType::Array(Box::new(ParamType::Tuple(vec![
                    ParamType::Uint(64),
                    ParamType::Uint(64),
                    ParamType::Uint(64),
                ]))),
            ],
            &raw,
        )
        .map_err(|e| DataworkerError::EventDecoding(format!("rootBundleProposal: {}", e)))?;

        let ranges_token = tokens.pop().unwrap_or(Token::Array(vec![]));
        let unclaimed = Self::uint(tokens.pop().unwrap_or(Token::Uint(U256::zero())))?;
        let challenge_end = Self::uint(tokens.pop().unwrap_or(Token::Uint(U256::zero())))?;
        let proposal_block = Self::uint(tokens.pop().unwrap_or(Token::Uint(U256::zero())))?;
        let slow_relay_root =
            Self::fixed_bytes_32(tokens.pop().unwrap_or(Token::FixedBytes(vec![0; 32])))?;
        let relayer_refund_root =
            Self::fixed_bytes_32(tokens.pop().unwrap_or(Token::FixedBytes(vec![0; 32])))?;
        let pool_rebalance_root =
            Self::fixed_bytes_32(tokens.pop().unwrap_or(Token::FixedBytes(vec![0; 32])))?;

        // An empty proposal slot reads back as all-zero roots
        if pool_rebalance_root == [0u8; 32] {
            return Ok(None);
        }

        let mut block_ranges = Vec::new();
        if let Some(entries) = ranges_token.into_array() {
            for entry in entries {
                let mut fields = entry
                    .into_tuple()
                    .ok_or_else(|| DataworkerError::EventDecoding("expected range tuple".into()))?;
                let end_block = Self::uint(fields.pop().unwrap_or(Token::Uint(U256::zero())))?;
                let start_block = Self::uint(fields.pop().unwrap_or(Token::Uint(U256::zero())))?;
                let chain_id = Self::uint(fields.pop().unwrap_or(Token::Uint(U256::zero())))?;
                block_ranges.push(BundleBlockRange {
                    chain_id: chain_id.as_u64(),
                    start_block: start_block.as_u64(),
                    end_block: end_block.as_u64(),
                });
            }
        }

        Ok(Some(PendingBundle {
            pool_rebalance_root,
            relayer_refund_root,
            slow_relay_root,
            proposal_block: proposal_block.as_u64(),
            challenge_period_end: challenge_end.as_u64(),
            unclaimed_pool_rebalance_leaf_count: unclaimed.as_u32(),
            block_ranges,
        }))
    }

    async fn last_executed_end_blocks(&self) -> DataworkerResult<HashMap<u64, u64>> {
        let data = encode_call(selector("lastExecutedBlockRanges()"), &[]);
        let raw = self.read(data).await?;

        let tokens = abi::decode(
            &[ParamType::Array(Box::new(ParamType::Tuple(vec![
                ParamType::Uint(64),
                ParamType::Uint(64),
            ])))],
            &raw,
        )
        .map_err(|e| DataworkerError::EventDecoding(format!("lastExecutedBlockRanges: {}", e)))?;

        let mut ends = HashMap::new();
        if let Some(entries) = tokens.into_iter().next().and_then(Token::into_array) {
            for entry in entries {
                let mut fields = entry
                    .into_tuple()
                    .ok_or_else(|| DataworkerError::EventDecoding("expected end tuple".into()))?;
                let end_block = Self::uint(fields.pop().unwrap_or(Token::Uint(U256::zero())))?;
                let chain_id = Self::uint(fields.pop().unwrap_or(Token::Uint(U256::zero())))?;
                ends.insert(chain_id.as_u64(), end_block.as_u64());
            }
        }
        Ok(ends)
    }

    async fn current_time(&self) -> DataworkerResult<u64> {
        let data = encode_call(selector("getCurrentTime()"), &[]);
        let raw = self.read(data).await?;
        if raw.len() < 32 {
            return Err(DataworkerError::EventDecoding(
                "getCurrentTime returned short data".into(),
            ));
        }
        Ok(U256::from_big_endian(&raw[..32]).as_u64())
    }

    async fn propose(
        &self,
        pool_rebalance_root: [u8; 32],
        relayer_refund_root: [u8; 32],
        slow_relay_root: [u8; 32],
        block_ranges: Vec<BundleBlockRange>,
    ) -> DataworkerResult<H256> {
        let data = encode_call(
            selector("proposeRootBundle(bytes32,bytes32,bytes32,(uint64,uint64,uint64)[])"),
            &[
                Token::FixedBytes(pool_rebalance_root.to_vec()),
                Token::FixedBytes(relayer_refund_root.to_vec()),
                Token::FixedBytes(slow_relay_root.to_vec()),
                Token::Array(block_ranges.iter().map(range_token).collect()),
            ],
        );
        debug!(bytes = data.len(), "Submitting root bundle proposal");
        self.write(data).await
    }

    async fn dispute_bundle(&self) -> DataworkerResult<H256> {
        let data = encode_call(selector("disputeRootBundle()"), &[]);
        self.write(data).await
    }

    async fn execute_pool_rebalance_leaf(
        &self,
        leaf: PoolRebalanceLeaf,
        proof: Vec<[u8; 32]>,
    ) -> DataworkerResult<H256> {
        let data = encode_call(
            selector(
                "executePoolRebalanceLeaf(uint32,uint64,uint32,address[],int256[],int256[],uint256[],bytes32[])",
            ),
            &[
                Token::Uint(U256::from(leaf.leaf_id)),
                Token::Uint(U256::from(leaf.chain_id)),
                Token::Uint(U256::from(leaf.group_index)),
                Token::Array(leaf.l1_tokens.iter().map(|t| Token::Address(*t)).collect()),
                Token::Array(
                    leaf.net_send_amounts
                        .iter()
                        .map(|v| Token::Int(v.into_raw()))
                        .collect(),
                ),
                Token::Array(
                    leaf.running_balances
                        .iter()
                        .map(|v| Token::Int(v.into_raw()))
                        .collect(),
                ),
                Token::Array(leaf.bundle_lp_fees.iter().map(|v| Token::Uint(*v)).collect()),
                Token::Array(
                    proof
                        .iter()
                        .map(|p| Token::FixedBytes(p.to_vec()))
                        .collect(),
                ),
            ],
        );
        self.write(data).await
    }

    async fn execute_relayer_refund_leaf(
        &self,
        leaf: RelayerRefundLeaf,
        proof: Vec<[u8; 32]>,
    ) -> DataworkerResult<H256> {
        let data = encode_call(
            selector(
                "executeRelayerRefundLeaf(uint32,uint64,address,uint256,address[],uint256[],bytes32[])",
            ),
            &[
                Token::Uint(U256::from(leaf.leaf_id)),
                Token::Uint(U256::from(leaf.chain_id)),
                Token::Address(leaf.l1_token),
                Token::Uint(leaf.amount_to_return),
                Token::Array(
                    leaf.refund_addresses
                        .iter()
                        .map(|a| Token::Address(*a))
                        .collect(),
                ),
                Token::Array(leaf.refund_amounts.iter().map(|v| Token::Uint(*v)).collect()),
                Token::Array(
                    proof
                        .iter()
                        .map(|p| Token::FixedBytes(p.to_vec()))
                        .collect(),
                ),
            ],
        );
        self.write(data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selectors_are_stable_and_distinct() {
        assert_eq!(selector("getCurrentTime()"), selector("getCurrentTime()"));
        assert_ne!(selector("getCurrentTime()"), selector("disputeRootBundle()"));
    }

    #[test]
    fn range_tokens_encode_in_field_order() {
        let token = range_token(&BundleBlockRange {
            chain_id: 10,
            start_block: 100,
            end_block: 200,
        });
        match token {
            Token::Tuple(fields) => {
                assert_eq!(fields[0], Token::Uint(U256::from(10u64)));
                assert_eq!(fields[1], Token::Uint(U256::from(100u64)));
                assert_eq!(fields[2], Token::Uint(U256::from(200u64)));
            }
            other => panic!("expected tuple, got {:?}", other),
        }
    }
}
