use std::str::FromStr;

use bitcoin::{Amount, Network};
use bitcoin::secp256k1::PublicKey;

use ark::{ArkInfo, Vtxo, VtxoRequest};
use bark_json::cli::MovementKind;

use crate::{Error, Wallet};
use crate::movement::NewMovement;
use crate::persist::StagedChanges;
use crate::server::{ArkoorRequest, ServerError, Signed};
use crate::vtxo_selection::VtxoSelection;
use crate::vtxo_state::VtxoState;

impl Wallet {
	/// The pubkey to pay to for an arkoor destination.
	///
	/// The destination is either an Ark address or a hex encoded public key.
	fn parse_destination(&self, destination: &str, ark_info: &ArkInfo) -> Result<PublicKey, Error> {
		if let Ok(addr) = ark::Address::from_str(destination) {
			if !addr.is_for_server(ark_info.asp_pubkey) {
				return Err(Error::InvalidBarkAddress(format!(
					"{} is an address for a different ark server", destination,
				)));
			}
			if addr.is_testnet() != (self.properties.network != Network::Bitcoin) {
				return Err(Error::InvalidBarkAddress(format!(
					"{} is an address for a different network", destination,
				)));
			}
			return Ok(addr.user_pubkey());
		}

		if destination.len() == 66 && destination.chars().all(|c| c.is_ascii_hexdigit()) {
			return PublicKey::from_str(destination)
				.map_err(|e| Error::InvalidPublicKey(format!("{}: {}", destination, e)));
		}

		Err(Error::InvalidBarkAddress(destination.to_owned()))
	}

	/// Send an arkoor payment.
	///
	/// Returns the VTXOs created for the destination. The inputs are
	/// unlocked when the request never reached the server or the server
	/// rejected it. Any other failure leaves them locked until a sync
	/// learns from the server whether it spent them.
	pub async fn send(&self, destination: &str, amount: Amount) -> Result<Vec<Vtxo>, Error> {
		let ark_info = self.require_ark_info().await?;
		let pubkey = self.parse_destination(destination, &ark_info)?;
		if amount < self.config.dust_threshold {
			return Err(Error::BarkFailed(format!("amount {} is below dust", amount)));
		}

		let tip = self.tip_or_last_synced().await?;
		let (selection, _in_flight) = self.select_and_lock(amount, tip, |_, _, _| Ok(()))?;

		let (request, outputs) = match self.arkoor_request(pubkey, amount, &selection) {
			Ok(r) => r,
			Err(e) => {
				warn!("Failed to prepare arkoor payment, unlocking inputs: {:#}", e);
				self.unlock_vtxos(selection.input_ids());
				return Err(e.into());
			},
		};

		let new_vtxos = match self.server.arkoor_cosign(request).await {
			Ok(vtxos) => vtxos,
			Err(ServerError::Rejected(reason)) => {
				warn!("Arkoor payment rejected, unlocking inputs: {}", reason);
				self.unlock_vtxos(selection.input_ids());
				return Err(ServerError::Rejected(reason).into());
			},
			Err(e) => {
				warn!("Arkoor payment got no answer, inputs stay locked until the next sync: {}", e);
				return Err(e.into());
			},
		};

		let destination_vtxos = self.store_arkoor_send(&ark_info, amount, &selection, outputs, new_vtxos)
			.map_err(|e| {
				warn!("Failed to store arkoor payment, inputs stay locked until the next sync: {}", e);
				e
			})?;
		info!("Sent {} to {} out-of-round", amount, pubkey);

		if let Err(e) = self.server.post_mailbox(destination_vtxos.clone()).await {
			warn!("Failed to post arkoor vtxos to the mailbox: {}", e);
		}
		Ok(destination_vtxos)
	}

	/// The signed cosign request, with the requested outputs in order.
	fn arkoor_request(
		&self,
		pubkey: PublicKey,
		amount: Amount,
		selection: &VtxoSelection,
	) -> anyhow::Result<(Signed<ArkoorRequest>, Vec<VtxoRequest>)> {
		let mut outputs = vec![VtxoRequest { pubkey, amount }];
		if let Some(change) = selection.change {
			let change_key = self.derive_store_next_keypair()?;
			outputs.push(VtxoRequest { pubkey: change_key.public_key(), amount: change });
		}

		let keys = self.vtxo_keys(selection.inputs.iter().map(|v| &v.vtxo))?;
		let request = ArkoorRequest {
			inputs: selection.inputs.iter().map(|v| v.vtxo.clone()).collect(),
			outputs: outputs.clone(),
		};
		Ok((Signed::sign(request, &keys)?, outputs))
	}

	fn store_arkoor_send(
		&self,
		ark_info: &ArkInfo,
		amount: Amount,
		selection: &VtxoSelection,
		outputs: Vec<VtxoRequest>,
		mut new_vtxos: Vec<Vtxo>,
	) -> Result<Vec<Vtxo>, Error> {
		if new_vtxos.len() != outputs.len() {
			return Err(Error::protocol(format!(
				"requested {} arkoor vtxos, got {}", outputs.len(), new_vtxos.len(),
			)));
		}
		for (vtxo, req) in new_vtxos.iter().zip(&outputs) {
			self.verify_vtxo(vtxo, ark_info, req.pubkey, req.amount)?;
		}

		let mut changes = StagedChanges::new();
		changes.remove_vtxos(selection.input_ids());
		// the first output pays the destination, the rest is change
		let change_vtxos = new_vtxos.split_off(1);
		for vtxo in change_vtxos {
			changes.add_vtxo(vtxo, VtxoState::Spendable);
		}
		changes.add_movement(
			NewMovement::new(MovementKind::ArkoorSend).sent(amount).fees(selection.dust_fee),
		);
		self.commit(&changes)?;
		Ok(new_vtxos)
	}
}
