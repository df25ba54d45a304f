//! ERC-20 calls against the token that funds the escrow.

use alloy::primitives::{Address, TxHash, U256};
use alloy::providers::Provider;

use crate::chain::{self, wait_for_receipt};
use crate::{Result, Timeouts, ERC20};

/// Query the token balance of `owner`.
pub async fn balance_of<P: Provider>(
    provider: &P,
    timeouts: &Timeouts,
    token: Address,
    owner: Address,
) -> Result<U256> {
    let contract = ERC20::new(token, provider);
    chain::read(timeouts.chain_read, "balanceOf", contract.balanceOf(owner).call()).await
}

/// Query the allowance that `owner` has granted to `spender`.
pub async fn allowance<P: Provider>(
    provider: &P,
    timeouts: &Timeouts,
    token: Address,
    owner: Address,
    spender: Address,
) -> Result<U256> {
    let contract = ERC20::new(token, provider);
    chain::read(
        timeouts.chain_read,
        "allowance",
        contract.allowance(owner, spender).call(),
    )
    .await
}

/// Execute `approve(spender, amount)` and wait until it is mined.
pub async fn approve<P: Provider>(
    provider: &P,
    timeouts: &Timeouts,
    token: Address,
    spender: Address,
    amount: U256,
) -> Result<TxHash> {
    let contract = ERC20::new(token, provider);
    let call = contract.approve(spender, amount);
    let pending = chain::submit(timeouts.chain_submit, "approve", call.send()).await?;
    let tx_hash = *pending.tx_hash();
    tracing::info!(tx = %tx_hash, %spender, "approve submitted");

    let receipt = wait_for_receipt(provider, tx_hash, timeouts.receipt_wait).await?;
    Ok(receipt.transaction_hash)
}
