
use anyhow::Context;
use async_trait::async_trait;
use bdk_esplora::{esplora_client, EsploraAsyncExt};
use bdk_wallet::KeychainKind;
use bdk_wallet::chain::spk_client::{FullScanRequest, FullScanResponse};
use bitcoin::{FeeRate, Transaction, Txid};
use log::{debug, trace};

use bitcoin_ext::{BlockHeight, FeeRateExt, TxStatus};

const FEE_RATE_TARGET_CONF_REGULAR: u16 = 3;

/// Unused scripts in a row after which a full scan stops.
const STOP_GAP: usize = 50;
const PARALLEL_REQS: usize = 4;

/// The wallet's view of the bitcoin chain.
#[async_trait]
pub trait ChainSource: Send + Sync + 'static {
	/// Height of the current chain tip.
	async fn tip(&self) -> anyhow::Result<BlockHeight>;

	async fn tx_status(&self, txid: Txid) -> anyhow::Result<TxStatus>;

	/// Broadcast the tx. Broadcasting a tx that is already known is not an error.
	async fn broadcast_tx(&self, tx: &Transaction) -> anyhow::Result<()>;

	/// Scan the scripts of the request for wallet transactions until
	/// enough unused scripts in a row were seen.
	async fn full_scan(
		&self,
		request: FullScanRequest<KeychainKind>,
	) -> anyhow::Result<FullScanResponse<KeychainKind>>;

	/// Fee rate to use for regular txs like boards and sends.
	async fn regular_feerate(&self) -> anyhow::Result<FeeRate>;
}

/// [ChainSource] using the HTTP API of an Esplora server.
pub struct EsploraChainSource {
	client: esplora_client::AsyncClient,
}

impl EsploraChainSource {
	pub fn new(url: &str) -> anyhow::Result<EsploraChainSource> {
		// the esplora client doesn't deal well with trailing slash in url
		let url = url.strip_suffix("/").unwrap_or(url);
		let client = esplora_client::Builder::new(url).build_async()
			.with_context(|| format!("failed to create esplora client for url {}", url))?;
		Ok(EsploraChainSource { client })
	}
}

#[async_trait]
impl ChainSource for EsploraChainSource {
	async fn tip(&self) -> anyhow::Result<BlockHeight> {
		Ok(self.client.get_height().await?)
	}

	async fn tx_status(&self, txid: Txid) -> anyhow::Result<TxStatus> {
		if self.client.get_tx(&txid).await?.is_none() {
			return Ok(TxStatus::NotFound);
		}
		let status = self.client.get_tx_status(&txid).await?;
		Ok(match status.block_height {
			Some(height) if status.confirmed => TxStatus::Confirmed(height),
			_ => TxStatus::Mempool,
		})
	}

	async fn broadcast_tx(&self, tx: &Transaction) -> anyhow::Result<()> {
		let txid = tx.compute_txid();
		if self.tx_status(txid).await?.is_known() {
			trace!("Not broadcasting tx {}: already known", txid);
			return Ok(());
		}
		self.client.broadcast(tx).await
			.with_context(|| format!("failed to broadcast tx {}", txid))?;
		Ok(())
	}

	async fn full_scan(
		&self,
		request: FullScanRequest<KeychainKind>,
	) -> anyhow::Result<FullScanResponse<KeychainKind>> {
		let resp = self.client.full_scan(request, STOP_GAP, PARALLEL_REQS).await
			.map_err(|e| anyhow!("esplora full scan failed: {}", e))?;
		debug!("Full scan found {} txs", resp.tx_update.txs.len());
		Ok(resp)
	}

	async fn regular_feerate(&self) -> anyhow::Result<FeeRate> {
		// The API should return rates for targets 1-25, 144 and 1008
		let estimates = self.client.get_fee_estimates().await?;
		let fee = estimates.get(&FEE_RATE_TARGET_CONF_REGULAR).with_context(||
			format!("No rate returned from get_fee_estimates for a {} confirmation target",
				FEE_RATE_TARGET_CONF_REGULAR,
			)
		)?;
		FeeRate::from_sat_per_vb_decimal_checked(*fee).with_context(||
			format!("Invalid rate returned from get_fee_estimates {}", fee)
		)
	}
}
