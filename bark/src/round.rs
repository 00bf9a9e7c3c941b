//! Round participation.
//!
//! Refreshes and offboards are both a round: the inputs are forfeited to the
//! server in exchange for new VTXOs and on-chain outputs in the round tx.

use bitcoin::{Amount, Txid};

use ark::{ArkInfo, OffboardRequest, VtxoId, VtxoRequest};
use bark_json::cli::{MovementKind, Offboard};

use crate::{Error, Wallet, WalletVtxo};
use crate::movement::NewMovement;
use crate::persist::StagedChanges;
use crate::server::{RoundParticipation, RoundResult, ServerError, Signed};
use crate::vtxo_state::VtxoState;

impl Wallet {
	/// Load the VTXOs to use as round inputs.
	async fn round_inputs(&self, vtxos: &[VtxoId]) -> Result<Vec<WalletVtxo>, Error> {
		let tip = self.tip_or_last_synced().await?;
		let mut ret = Vec::with_capacity(vtxos.len());
		for id in vtxos {
			let vtxo = self.get_vtxo_by_id(*id)?;
			if vtxo.state != VtxoState::Spendable {
				return Err(Error::conflict(format!("vtxo {} is {}", id, vtxo.state)));
			}
			if vtxo.is_expired(tip) {
				return Err(Error::BarkFailed(format!("vtxo {} expired, it can only be exited", id)));
			}
			ret.push(vtxo);
		}
		Ok(ret)
	}

	/// All spendable VTXOs that did not expire.
	async fn all_round_inputs(&self) -> Result<Vec<VtxoId>, Error> {
		let tip = self.tip_or_last_synced().await?;
		Ok(self.vtxos()?.into_iter()
			.filter(|v| v.state == VtxoState::Spendable && !v.is_expired(tip))
			.map(|v| v.id())
			.collect())
	}

	/// Refresh the given VTXOs into a single new one.
	///
	/// Returns the round txid, or [None] if there was nothing to refresh.
	pub async fn refresh_vtxos(&self, vtxos: Vec<VtxoId>) -> Result<Option<Txid>, Error> {
		if vtxos.is_empty() {
			info!("No vtxos to refresh");
			return Ok(None);
		}
		let inputs = self.round_inputs(&vtxos).await?;
		let total = inputs.iter().map(|v| v.amount()).sum::<Amount>();

		let keypair = self.derive_store_next_keypair()?;
		let request = VtxoRequest { pubkey: keypair.public_key(), amount: total };
		let movement = NewMovement::new(MovementKind::Round).sent(total).received(total);

		let result = self.participate_round(inputs, vec![request], vec![], movement).await?;
		info!("Refreshed {} vtxos in round {}", vtxos.len(), result.round_txid);
		Ok(Some(result.round_txid))
	}

	/// Refresh all spendable VTXOs.
	pub async fn refresh_all(&self) -> Result<Option<Txid>, Error> {
		let vtxos = self.all_round_inputs().await?;
		self.refresh_vtxos(vtxos).await
	}

	/// Offboard the given VTXOs to a new on-chain address of the wallet.
	pub async fn offboard_vtxos(&self, vtxos: Vec<VtxoId>) -> Result<Offboard, Error> {
		if vtxos.is_empty() {
			return Err(Error::BarkFailed("no vtxos to offboard".into()));
		}
		let ark_info = self.require_ark_info().await?;
		let inputs = self.round_inputs(&vtxos).await?;
		let total = inputs.iter().map(|v| v.amount()).sum::<Amount>();

		let script_pubkey = self.onchain()?.address()?.script_pubkey();
		let fee = OffboardRequest::calculate_fee(&script_pubkey, ark_info.offboard_feerate)
			.ok_or_else(|| Error::BarkFailed("invalid offboard script".into()))?;
		let needed = fee + self.config.dust_threshold;
		if total < needed {
			return Err(Error::InsufficientFunds { needed, available: total });
		}
		let amount = total - fee;

		let offboard = OffboardRequest { script_pubkey, amount };
		offboard.validate().map_err(|e| Error::BarkFailed(e.to_owned()))?;
		let movement = NewMovement::new(MovementKind::Offboard).sent(amount).fees(fee);

		let result = self.participate_round(inputs, vec![], vec![offboard], movement).await?;
		info!("Offboarded {} in round {}", amount, result.round_txid);
		Ok(Offboard { round_txid: result.round_txid })
	}

	/// Offboard all spendable VTXOs.
	pub async fn offboard_all(&self) -> Result<Offboard, Error> {
		let vtxos = self.all_round_inputs().await?;
		self.offboard_vtxos(vtxos).await
	}

	/// Take part in a round with the given inputs.
	///
	/// The inputs are locked for the duration of the round. Either the round
	/// succeeds and the inputs are replaced by the new VTXOs, or the inputs
	/// become spendable again when the server never got or rejected the
	/// request. If the server might have spent them, they stay locked until
	/// a sync learns the outcome from the server.
	async fn participate_round(
		&self,
		inputs: Vec<WalletVtxo>,
		vtxo_requests: Vec<VtxoRequest>,
		offboard_requests: Vec<OffboardRequest>,
		movement: NewMovement,
	) -> Result<RoundResult, Error> {
		let ark_info = self.require_ark_info().await?;
		let input_ids = inputs.iter().map(|v| v.id()).collect::<Vec<_>>();
		let _in_flight = self.lock_vtxos(input_ids.clone())?;

		let participation = match self.round_participation(&inputs, &vtxo_requests, offboard_requests) {
			Ok(p) => p,
			Err(e) => {
				warn!("Failed to prepare round participation, unlocking inputs: {:#}", e);
				self.unlock_vtxos(input_ids);
				return Err(e.into());
			},
		};

		let result = match self.server.participate_round(participation).await {
			Ok(result) => result,
			Err(ServerError::Rejected(reason)) => {
				warn!("Round participation rejected, unlocking inputs: {}", reason);
				self.unlock_vtxos(input_ids);
				return Err(ServerError::Rejected(reason).into());
			},
			Err(e) => {
				warn!("Round participation got no answer, inputs stay locked until the next sync: {}", e);
				return Err(e.into());
			},
		};
		debug!("Round {} finished with {} new vtxos", result.round_txid, result.vtxos.len());

		self.store_round_result(&ark_info, &inputs, &vtxo_requests, &result, movement)
			.map_err(|e| {
				warn!("Failed to store round result, inputs stay locked until the next sync: {}", e);
				e
			})?;
		Ok(result)
	}

	fn round_participation(
		&self,
		inputs: &[WalletVtxo],
		vtxo_requests: &[VtxoRequest],
		offboard_requests: Vec<OffboardRequest>,
	) -> anyhow::Result<Signed<RoundParticipation>> {
		let keys = self.vtxo_keys(inputs.iter().map(|v| &v.vtxo))?;
		let participation = RoundParticipation {
			inputs: inputs.iter().map(|v| v.vtxo.clone()).collect(),
			vtxo_requests: vtxo_requests.to_vec(),
			offboard_requests,
		};
		Signed::sign(participation, &keys)
	}

	fn store_round_result(
		&self,
		ark_info: &ArkInfo,
		inputs: &[WalletVtxo],
		vtxo_requests: &[VtxoRequest],
		result: &RoundResult,
		movement: NewMovement,
	) -> Result<(), Error> {
		if result.vtxos.len() != vtxo_requests.len() {
			return Err(Error::protocol(format!(
				"requested {} vtxos in round, got {}", vtxo_requests.len(), result.vtxos.len(),
			)));
		}
		for (vtxo, req) in result.vtxos.iter().zip(vtxo_requests) {
			self.verify_vtxo(vtxo, ark_info, req.pubkey, req.amount)?;
		}

		let mut changes = StagedChanges::new();
		changes.remove_vtxos(inputs.iter().map(|v| v.id()));
		for vtxo in &result.vtxos {
			changes.add_vtxo(vtxo.clone(), VtxoState::Spendable);
		}
		changes.add_movement(movement);
		self.commit(&changes)?;
		Ok(())
	}
}
