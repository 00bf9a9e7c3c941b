use std::collections::HashMap;

use anyhow::Context;
use bitcoin::{Amount, OutPoint, Transaction, TxOut};
use bitcoin::secp256k1::PublicKey;

use ark::{ArkInfo, Vtxo};
use ark::vtxo::board_spk;
use bark_json::cli::{Board, MovementKind, OnchainTxType};

use crate::{Error, Wallet};
use crate::movement::NewMovement;
use crate::persist::{StagedChanges, StoredOnchainTx};
use crate::persist::sqlite::unix_now;
use crate::server::BoardCosignRequest;
use crate::vtxo_state::VtxoState;

/// The output of the funding tx that pays to the board script.
const BOARD_FUNDING_TX_VTXO_VOUT: u32 = 0;

impl Wallet {
	/// Board a VTXO with the given amount.
	///
	/// NB we will spend a little more on-chain to cover fees.
	pub async fn board_amount(&self, amount: Amount) -> Result<Board, Error> {
		if amount < self.config.dust_threshold {
			return Err(Error::BarkFailed(format!("board amount {} is below dust", amount)));
		}
		self.board(Some(amount)).await
	}

	/// Board a VTXO with all the funds in your on-chain wallet.
	pub async fn board_all(&self) -> Result<Board, Error> {
		self.board(None).await
	}

	async fn board(&self, amount: Option<Amount>) -> Result<Board, Error> {
		let ark_info = self.require_ark_info().await?;
		let fee_rate = self.fee_rate().await;

		let user_keypair = self.derive_store_next_keypair()?;
		let spk = board_spk(user_keypair.public_key(), ark_info.asp_pubkey, ark_info.vtxo_exit_delta);

		// held until the funding tx is broadcast or abandoned
		let _spend = self.onchain_spend.lock().await;
		let (funding_tx, fee) = {
			let mut onchain = self.onchain()?;
			let psbt = match amount {
				Some(amount) => {
					let output = TxOut { value: amount, script_pubkey: spk };
					onchain.prepare_tx(&[output], fee_rate, &[])?
				},
				None => onchain.prepare_drain_tx(spk, fee_rate)?,
			};
			let fee = psbt.fee().context("invalid board psbt")?;
			let tx = onchain.sign_tx(psbt, &[], &HashMap::new())
				.context("failed to sign board funding tx")?;
			(tx, fee)
		};

		match self.cosign_board(&ark_info, user_keypair.public_key(), &funding_tx).await {
			Ok(vtxo) => self.finish_board(vtxo, funding_tx, fee).await,
			Err(e) => {
				self.onchain()?.cancel_tx(&funding_tx)?;
				Err(e)
			},
		}
	}

	/// Get the board VTXO for the funding tx cosigned by the server.
	async fn cosign_board(
		&self,
		ark_info: &ArkInfo,
		user_pubkey: PublicKey,
		funding_tx: &Transaction,
	) -> Result<Vtxo, Error> {
		let board_amount = funding_tx.output[BOARD_FUNDING_TX_VTXO_VOUT as usize].value;
		if let Some(max) = ark_info.max_vtxo_amount {
			if board_amount > max {
				return Err(Error::BarkFailed(format!(
					"board amount {} exceeds the maximum vtxo amount {}", board_amount, max,
				)));
			}
		}

		let utxo = OutPoint::new(funding_tx.compute_txid(), BOARD_FUNDING_TX_VTXO_VOUT);
		trace!("Board funding tx: {}", bitcoin::consensus::encode::serialize_hex(funding_tx));
		let vtxo = self.server.board_cosign(BoardCosignRequest {
			user_pubkey,
			amount: board_amount,
			utxo,
			funding_tx: funding_tx.clone(),
		}).await?;

		if vtxo.amount() != board_amount
			|| vtxo.user_pubkey != user_pubkey
			|| vtxo.asp_pubkey != ark_info.asp_pubkey
			|| vtxo.exit_delta != ark_info.vtxo_exit_delta
		{
			return Err(Error::protocol("board vtxo from server doesn't match our request"));
		}
		vtxo.validate_anchored(utxo)
			.map_err(|e| Error::protocol(format!("invalid board vtxo: {}", e)))?;
		Ok(vtxo)
	}

	/// Broadcast the funding tx and only then store the board.
	async fn finish_board(
		&self,
		vtxo: Vtxo,
		funding_tx: Transaction,
		fee: Amount,
	) -> Result<Board, Error> {
		let funding_txid = funding_tx.compute_txid();
		let board_amount = vtxo.amount();
		if let Err(e) = self.chain.broadcast_tx(&funding_tx).await {
			if !self.tx_is_known(funding_txid).await {
				self.onchain()?.cancel_tx(&funding_tx)?;
				return Err(e.context("failed to broadcast board funding tx").into());
			}
			warn!("Broadcast of board funding tx {} failed but the chain knows it: {:#}", funding_txid, e);
		}
		info!("Broadcast board funding tx {} for {}", funding_txid, board_amount);
		self.onchain()?.apply_broadcast_tx(funding_tx)?;

		let mut changes = StagedChanges::new();
		changes.add_vtxo(vtxo.clone(), VtxoState::PendingBoard);
		changes.add_movement(
			NewMovement::new(MovementKind::Board).received(board_amount).fees(fee),
		);
		changes.store_onchain_tx(StoredOnchainTx {
			txid: funding_txid,
			amount: board_amount + fee,
			created_at: unix_now(),
			tx_type: OnchainTxType::Board,
			confirmation_height: None,
		});
		self.commit(&changes)?;

		match self.server.register_board(vtxo.id()).await {
			Ok(()) => {
				let mut changes = StagedChanges::new();
				changes.update_state([vtxo.id()], VtxoState::Spendable, &[VtxoState::PendingBoard]);
				self.commit(&changes)?;
				info!("Registered board {}", vtxo.id());
			},
			Err(e) => warn!("Failed to register board {}, will retry on sync: {}", vtxo.id(), e),
		}

		Ok(Board {
			funding_txid,
			vtxos: vec![vtxo.into()],
		})
	}
}
