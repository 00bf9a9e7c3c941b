
use std::str::FromStr;

use anyhow::Context;
use bitcoin::{Amount, Txid};
use lightning_invoice::Bolt11Invoice;
use rusqlite::{Result, Row};
use rusqlite::types::{ToSql, ToSqlOutput};

use ark::{Vtxo, VtxoId};
use ark::lightning::{PaymentHash, Preimage};
use bark_json::cli::OnchainTxType;
use bark_json::exit::ExitState;

use crate::movement::{Movement, MovementId, MovementKind};
use crate::onchain::ExitUtxo;
use crate::persist::models::{
	LightningReceive, LightningSend, LightningSendStatus, StoredExit, StoredOnchainTx,
};
use crate::vtxo_state::{VtxoState, WalletVtxo};

impl ToSql for VtxoState {
	fn to_sql(&self) -> Result<ToSqlOutput<'_>> {
		self.as_str().to_sql()
	}
}

pub(crate) fn raw_vtxo(vtxo: &Vtxo) -> anyhow::Result<Vec<u8>> {
	serde_json::to_vec(vtxo).context("failed to serialize vtxo")
}

fn vtxo_from_raw(raw: &[u8]) -> anyhow::Result<Vtxo> {
	serde_json::from_slice(raw).context("failed to deserialize stored vtxo")
}

pub(crate) fn row_to_wallet_vtxo(row: &Row<'_>) -> anyhow::Result<WalletVtxo> {
	let raw: Vec<u8> = row.get("raw_vtxo")?;
	let state: String = row.get("state_kind")?;
	Ok(WalletVtxo {
		vtxo: vtxo_from_raw(&raw)?,
		state: VtxoState::from_str(&state)?,
	})
}

pub(crate) fn row_to_exit_utxo(row: &Row<'_>) -> anyhow::Result<ExitUtxo> {
	let raw: Vec<u8> = row.get("raw_vtxo")?;
	Ok(ExitUtxo {
		vtxo: vtxo_from_raw(&raw)?,
		height: row.get("confirmation_height")?,
	})
}

pub(crate) fn row_to_movement(row: &Row<'_>) -> anyhow::Result<Movement> {
	let kind: u8 = row.get("kind")?;
	Ok(Movement {
		id: MovementId(row.get("id")?),
		kind: MovementKind::from_u8(kind).with_context(|| format!("invalid movement kind {}", kind))?,
		amount_sent: Amount::from_sat(row.get("amount_sent_sat")?),
		amount_received: Amount::from_sat(row.get("amount_received_sat")?),
		fees: Amount::from_sat(row.get("fees_sat")?),
		created_at: row.get("created_at")?,
	})
}

pub(crate) fn row_to_onchain_tx(row: &Row<'_>) -> anyhow::Result<StoredOnchainTx> {
	let txid: String = row.get("txid")?;
	let tx_type: String = row.get("tx_type")?;
	Ok(StoredOnchainTx {
		txid: Txid::from_str(&txid).context("invalid txid")?,
		amount: Amount::from_sat(row.get("amount_sat")?),
		created_at: row.get("created_at")?,
		tx_type: OnchainTxType::from_str(&tx_type).map_err(|e| anyhow!("{}: {}", e, tx_type))?,
		confirmation_height: row.get("confirmation_height")?,
	})
}

pub(crate) fn row_to_lightning_receive(row: &Row<'_>) -> anyhow::Result<LightningReceive> {
	let payment_hash: String = row.get("payment_hash")?;
	let preimage: String = row.get("preimage")?;
	let invoice: String = row.get("invoice")?;
	Ok(LightningReceive {
		payment_hash: PaymentHash::from_str(&payment_hash)?,
		preimage: Preimage::from_str(&preimage)?,
		invoice: Bolt11Invoice::from_str(&invoice).context("invalid stored invoice")?,
		amount: Amount::from_sat(row.get("amount_sat")?),
		claimed: row.get("claimed")?,
	})
}

pub(crate) fn row_to_lightning_send(row: &Row<'_>) -> anyhow::Result<LightningSend> {
	let payment_hash: String = row.get("payment_hash")?;
	let invoice: String = row.get("invoice")?;
	let inputs: String = row.get("inputs")?;
	let status: String = row.get("status")?;
	let preimage: Option<String> = row.get("preimage")?;
	Ok(LightningSend {
		payment_hash: PaymentHash::from_str(&payment_hash)?,
		invoice: Bolt11Invoice::from_str(&invoice).context("invalid stored invoice")?,
		amount: Amount::from_sat(row.get("amount_sat")?),
		inputs: serde_json::from_str::<Vec<VtxoId>>(&inputs)?,
		status: match status.as_str() {
			"pending" => LightningSendStatus::Pending,
			"paid" => LightningSendStatus::Paid,
			_ => bail!("invalid lightning send status: {}", status),
		},
		preimage: preimage.map(|p| Preimage::from_str(&p)).transpose()?,
	})
}

pub(crate) fn row_to_exit(row: &Row<'_>) -> anyhow::Result<StoredExit> {
	let raw: Vec<u8> = row.get("raw_vtxo")?;
	let state: String = row.get("state")?;
	Ok(StoredExit {
		vtxo: vtxo_from_raw(&raw)?,
		state: serde_json::from_str::<ExitState>(&state).context("invalid exit state")?,
	})
}
