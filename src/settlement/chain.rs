//! Conditional-tokens chain client.
//!
//! Everything the bot needs on-chain: collateral balance, payout state and
//! position balances for claimability checks, `redeemPositions` preflight
//! and submission (EIP-1559), receipt waits, and decoding the collateral
//! `Transfer` back to the wallet for exact realized proceeds.

use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{keccak256, Address, B256, U256};
use alloy::providers::Provider;
use alloy::rpc::types::{TransactionReceipt, TransactionRequest};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use alloy::sol_types::{SolCall, SolEvent};
use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::models::Side;
use crate::rpc_pool::RpcPool;
use crate::settlement::nonce::NonceManager;

sol! {
    interface IConditionalTokens {
        function payoutDenominator(bytes32 conditionId) external view returns (uint256);
        function payoutNumerators(bytes32 conditionId, uint256 index) external view returns (uint256);
        function balanceOf(address owner, uint256 id) external view returns (uint256);
        function redeemPositions(
            address collateralToken,
            bytes32 parentCollectionId,
            bytes32 conditionId,
            uint256[] calldata indexSets
        ) external;
    }

    interface IErc20 {
        event Transfer(address indexed from, address indexed to, uint256 value);
        function balanceOf(address owner) external view returns (uint256);
    }
}

/// USDC uses 6 decimals.
const COLLATERAL_DECIMALS: f64 = 1e6;
const CHAIN_ID: u64 = 137;

pub struct ChainClient {
    rpc: Arc<RpcPool>,
    pub wallet_address: Address,
    collateral: Address,
    conditional_tokens: Address,
    signer: Option<PrivateKeySigner>,
    nonce: Arc<NonceManager>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayoutState {
    Unresolved,
    UpWins,
    DownWins,
}

impl ChainClient {
    pub fn new(
        rpc: Arc<RpcPool>,
        wallet_address: &str,
        collateral: &str,
        conditional_tokens: &str,
        private_key: Option<&str>,
        nonce: Arc<NonceManager>,
    ) -> Result<Self> {
        let wallet_address: Address = wallet_address
            .parse()
            .context("invalid wallet address")?;
        let signer = match private_key {
            Some(pk) => {
                let signer: PrivateKeySigner =
                    pk.parse().context("invalid wallet private key")?;
                anyhow::ensure!(
                    signer.address() == wallet_address,
                    "private key does not match wallet address"
                );
                Some(signer)
            }
            None => None,
        };
        Ok(Self {
            rpc,
            wallet_address,
            collateral: collateral.parse().context("invalid collateral address")?,
            conditional_tokens: conditional_tokens
                .parse()
                .context("invalid conditional tokens address")?,
            signer,
            nonce,
        })
    }

    pub fn can_sign(&self) -> bool {
        self.signer.is_some()
    }

    fn cid_bytes(cid: &str) -> Result<B256> {
        let h = cid.trim().trim_start_matches("0x");
        anyhow::ensure!(h.len() == 64, "condition id must be 32 bytes: {cid}");
        let bytes = hex::decode(h).context("condition id is not hex")?;
        Ok(B256::from_slice(&bytes))
    }

    /// ERC-1155 position id for `(collateral, collectionId(cid, indexSet))`.
    pub fn position_id(&self, cid: &str, side: Side) -> Result<U256> {
        let cid_b = Self::cid_bytes(cid)?;
        let index_set = U256::from(side.index_set());
        let mut coll_input = [0u8; 64];
        coll_input[..32].copy_from_slice(cid_b.as_slice());
        coll_input[32..].copy_from_slice(&index_set.to_be_bytes::<32>());
        let collection_id = keccak256(coll_input);

        let mut pos_input = [0u8; 52];
        pos_input[..20].copy_from_slice(self.collateral.as_slice());
        pos_input[20..].copy_from_slice(collection_id.as_slice());
        Ok(U256::from_be_bytes(keccak256(pos_input).0))
    }

    async fn eth_call(&self, to: Address, data: Vec<u8>) -> Result<Vec<u8>> {
        let tx = TransactionRequest::default()
            .with_to(to)
            .with_input(data);
        let out = self
            .rpc
            .provider()
            .call(tx)
            .await
            .context("eth_call failed")?;
        Ok(out.to_vec())
    }

    /// Wallet collateral balance in USDC.
    pub async fn collateral_balance(&self) -> Result<f64> {
        let call = IErc20::balanceOfCall {
            owner: self.wallet_address,
        };
        let out = self.eth_call(self.collateral, call.abi_encode()).await?;
        let raw = IErc20::balanceOfCall::abi_decode_returns(&out)
            .context("bad balanceOf return")?;
        Ok(u128::try_from(raw).unwrap_or(0) as f64 / COLLATERAL_DECIMALS)
    }

    /// On-chain payout state for a condition.
    pub async fn payout_state(&self, cid: &str) -> Result<PayoutState> {
        let cid_b = Self::cid_bytes(cid)?;
        let denom_call = IConditionalTokens::payoutDenominatorCall {
            conditionId: cid_b,
        };
        let out = self
            .eth_call(self.conditional_tokens, denom_call.abi_encode())
            .await?;
        let denom = IConditionalTokens::payoutDenominatorCall::abi_decode_returns(&out)
            .context("bad payoutDenominator return")?;
        if denom.is_zero() {
            return Ok(PayoutState::Unresolved);
        }

        let mut numerators = [U256::ZERO; 2];
        for (i, slot) in numerators.iter_mut().enumerate() {
            let call = IConditionalTokens::payoutNumeratorsCall {
                conditionId: cid_b,
                index: U256::from(i),
            };
            let out = self
                .eth_call(self.conditional_tokens, call.abi_encode())
                .await?;
            *slot = IConditionalTokens::payoutNumeratorsCall::abi_decode_returns(&out)
                .context("bad payoutNumerators return")?;
        }
        if numerators[0] > U256::ZERO && numerators[1].is_zero() {
            Ok(PayoutState::UpWins)
        } else if numerators[1] > U256::ZERO && numerators[0].is_zero() {
            Ok(PayoutState::DownWins)
        } else {
            Ok(PayoutState::Unresolved)
        }
    }

    /// ERC-1155 balance of the wallet's outcome token, in shares.
    pub async fn position_balance(&self, cid: &str, side: Side) -> Result<f64> {
        let id = self.position_id(cid, side)?;
        let call = IConditionalTokens::balanceOfCall {
            owner: self.wallet_address,
            id,
        };
        let out = self
            .eth_call(self.conditional_tokens, call.abi_encode())
            .await?;
        let raw = IConditionalTokens::balanceOfCall::abi_decode_returns(&out)
            .context("bad 1155 balanceOf return")?;
        Ok(u128::try_from(raw).unwrap_or(0) as f64 / COLLATERAL_DECIMALS)
    }

    fn redeem_calldata(&self, cid: &str, side: Side) -> Result<Vec<u8>> {
        let call = IConditionalTokens::redeemPositionsCall {
            collateralToken: self.collateral,
            parentCollectionId: B256::ZERO,
            conditionId: Self::cid_bytes(cid)?,
            indexSets: vec![U256::from(side.index_set())],
        };
        Ok(call.abi_encode())
    }

    /// Preflight the redemption via `eth_call`; an error means it reverts.
    pub async fn preflight_redeem(&self, cid: &str, side: Side) -> Result<()> {
        let data = self.redeem_calldata(cid, side)?;
        let tx = TransactionRequest::default()
            .with_from(self.wallet_address)
            .with_to(self.conditional_tokens)
            .with_input(data);
        self.rpc
            .provider()
            .call(tx)
            .await
            .context("redeem preflight reverted")?;
        Ok(())
    }

    /// Build, sign and submit the redemption as an EIP-1559 transaction.
    /// Fees derive from the latest block; the nonce comes from the
    /// serialized manager, which resyncs on nonce-shaped rejections.
    pub async fn submit_redeem(
        &self,
        cid: &str,
        side: Side,
        gas_limit: u64,
        priority_fee_gwei: u64,
    ) -> Result<B256> {
        let signer = self
            .signer
            .clone()
            .ok_or_else(|| anyhow!("no signing key configured"))?;
        let provider = self.rpc.provider();

        let latest = provider
            .get_block_by_number(alloy::eips::BlockNumberOrTag::Latest)
            .await
            .context("latest block fetch failed")?
            .ok_or_else(|| anyhow!("no latest block"))?;
        let base_fee = latest.header.base_fee_per_gas.unwrap_or(35_000_000_000u64) as u128;
        let priority = priority_fee_gwei as u128 * 1_000_000_000;
        let max_fee = base_fee * 2 + priority;

        let nonce = self.nonce.next(&provider, self.wallet_address).await?;
        let data = self.redeem_calldata(cid, side)?;

        let tx = TransactionRequest::default()
            .with_from(self.wallet_address)
            .with_to(self.conditional_tokens)
            .with_input(data)
            .with_nonce(nonce)
            .with_chain_id(CHAIN_ID)
            .with_gas_limit(gas_limit)
            .with_max_fee_per_gas(max_fee)
            .with_max_priority_fee_per_gas(priority);

        let wallet = EthereumWallet::from(signer);
        let envelope = tx
            .build(&wallet)
            .await
            .context("failed to sign redemption tx")?;
        let tx_hash = *envelope.tx_hash();

        use alloy::eips::eip2718::Encodable2718;
        let raw = envelope.encoded_2718();
        if let Err(e) = provider.send_raw_transaction(&raw).await {
            let msg = e.to_string().to_ascii_lowercase();
            if msg.contains("nonce too low") || msg.contains("already known") {
                warn!(error = %e, "nonce rejection, resyncing");
                self.nonce.force_resync().await;
            }
            return Err(e).context("send_raw_transaction failed");
        }
        info!(cid = %cid, side = %side, tx = %tx_hash, nonce, "redeem tx submitted");
        Ok(tx_hash)
    }

    /// Wait for a receipt with a bounded timeout.
    pub async fn wait_receipt(
        &self,
        tx_hash: B256,
        timeout: Duration,
    ) -> Result<TransactionReceipt> {
        let provider = self.rpc.provider();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(receipt) = provider
                .get_transaction_receipt(tx_hash)
                .await
                .context("receipt fetch failed")?
            {
                return Ok(receipt);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!("receipt timeout for {tx_hash}"));
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    /// Sum of collateral `Transfer` amounts credited to the wallet in a
    /// redemption receipt: the exact realized USDC.
    pub fn realized_credit(&self, receipt: &TransactionReceipt) -> f64 {
        let mut total = U256::ZERO;
        for log in receipt.logs() {
            if log.address() != self.collateral {
                continue;
            }
            if let Ok(ev) = IErc20::Transfer::decode_log(&log.inner) {
                if ev.to == self.wallet_address {
                    total += ev.value;
                }
            }
        }
        u128::try_from(total).unwrap_or(0) as f64 / COLLATERAL_DECIMALS
    }

    /// Gas price sanity readout for diagnostics.
    pub async fn base_fee_gwei(&self) -> Result<f64> {
        let latest = self
            .rpc
            .provider()
            .get_block_by_number(alloy::eips::BlockNumberOrTag::Latest)
            .await?
            .ok_or_else(|| anyhow!("no latest block"))?;
        Ok(latest.header.base_fee_per_gas.unwrap_or(0) as f64 / 1e9)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settlement::nonce::NonceManager;

    fn client() -> ChainClient {
        let rpc = RpcPool::new(&["http://127.0.0.1:1".to_string()]).unwrap();
        ChainClient::new(
            rpc,
            "0x0000000000000000000000000000000000000001",
            "0x2791Bca1f2de4661ED88A30C99A7a9449Aa84174",
            "0x4D97DCd97eC945f40cF65F87097ACe5EA0476045",
            None,
            Arc::new(NonceManager::new()),
        )
        .unwrap()
    }

    #[test]
    fn cid_parsing_validates_length() {
        assert!(ChainClient::cid_bytes("0xdead").is_err());
        let cid = format!("0x{}", "ab".repeat(32));
        assert!(ChainClient::cid_bytes(&cid).is_ok());
    }

    #[test]
    fn position_ids_differ_by_side_and_are_stable() {
        let c = client();
        let cid = format!("0x{}", "12".repeat(32));
        let up = c.position_id(&cid, Side::Up).unwrap();
        let down = c.position_id(&cid, Side::Down).unwrap();
        assert_ne!(up, down);
        // Deterministic across calls.
        assert_eq!(up, c.position_id(&cid, Side::Up).unwrap());
    }

    #[test]
    fn redeem_calldata_encodes_index_set() {
        let c = client();
        let cid = format!("0x{}", "34".repeat(32));
        let up = c.redeem_calldata(&cid, Side::Up).unwrap();
        let down = c.redeem_calldata(&cid, Side::Down).unwrap();
        assert_ne!(up, down);
        // 4-byte selector + 4 words minimum.
        assert!(up.len() >= 4 + 32 * 4);
    }

    #[test]
    fn signing_is_unavailable_without_key() {
        assert!(!client().can_sign());
    }
}
