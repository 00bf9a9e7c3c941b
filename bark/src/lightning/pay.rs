use std::str::FromStr;

use bitcoin::Amount;
use lightning_invoice::Bolt11Invoice;

use ark::{Vtxo, VtxoRequest};
use ark::lightning::{Bolt11InvoiceExt, PaymentHash, Preimage};
use bark_json::cli::MovementKind;

use crate::{Error, Wallet, WalletVtxo};
use crate::movement::NewMovement;
use crate::persist::{LightningSend, LightningSendStatus, StagedChanges};
use crate::server::{LightningPayRequest, LightningPayStatus, ServerError, Signed};
use crate::vtxo_state::VtxoState;

impl Wallet {
	/// Pay a bolt11 invoice using VTXOs.
	///
	/// The amount is taken from the invoice, unless it doesn't encode one.
	/// While the server is working on the payment, the inputs stay locked.
	/// Pending payments are resolved when syncing.
	pub async fn pay_bolt11(
		&self,
		invoice: &str,
		user_amount: Option<Amount>,
	) -> Result<Preimage, Error> {
		let invoice = Bolt11Invoice::from_str(invoice)
			.map_err(|e| Error::InvalidBolt11Invoice(e.to_string()))?;
		if !invoice.is_for_network(self.properties.network) {
			return Err(Error::InvalidBolt11Invoice(format!(
				"invoice is for {}, wallet is on {}", invoice.network(), self.properties.network,
			)));
		}
		let amount = invoice.get_final_amount(user_amount)
			.map_err(|e| Error::InvalidBolt11Invoice(e.to_string()))?;
		let payment_hash = PaymentHash::from(&invoice);
		if self.db.get_lightning_send(payment_hash)?.is_some() {
			return Err(Error::InvalidBolt11Invoice(format!("invoice {} was already paid", payment_hash)));
		}

		let tip = self.tip_or_last_synced().await?;
		let mut send = LightningSend {
			payment_hash,
			invoice: invoice.clone(),
			amount,
			inputs: vec![],
			status: LightningSendStatus::Pending,
			preimage: None,
		};
		let (selection, _in_flight) = self.select_and_lock(amount, tip, |db, selection, changes| {
			// checked again under the writer lock
			if db.get_lightning_send(payment_hash)?.is_some() {
				return Err(Error::InvalidBolt11Invoice(format!(
					"invoice {} was already paid", payment_hash,
				)).into());
			}
			send.inputs = selection.input_ids();
			changes.store_lightning_send(send.clone());
			changes.add_movement(
				NewMovement::new(MovementKind::LightningSend).sent(amount).fees(selection.dust_fee),
			);
			Ok(())
		})?;
		info!("Paying invoice {} for {}", payment_hash, amount);

		let request = match self.lightning_pay_request(&send, &selection.inputs, selection.change) {
			Ok(r) => r,
			Err(e) => {
				self.revoke_lightning_send(&send)?;
				return Err(e.into());
			},
		};

		match self.server.pay_bolt11(request).await {
			Ok(LightningPayStatus::Succeeded { preimage, change }) => {
				self.settle_lightning_send(&send, preimage, change).await?;
				Ok(preimage)
			},
			Ok(LightningPayStatus::Failed { reason }) | Err(ServerError::Rejected(reason)) => {
				warn!("Lightning payment {} failed: {}", payment_hash, reason);
				self.revoke_lightning_send(&send)?;
				Err(Error::BarkFailed(format!("lightning payment failed: {}", reason)))
			},
			Ok(LightningPayStatus::Pending) => {
				info!("Lightning payment {} is still pending, will be resolved on sync", payment_hash);
				Err(Error::BarkFailed(format!("lightning payment {} is still pending", payment_hash)))
			},
			// we don't know whether the server is paying, keep the inputs locked
			Err(e) => Err(e.into()),
		}
	}

	fn lightning_pay_request(
		&self,
		send: &LightningSend,
		inputs: &[WalletVtxo],
		change: Option<Amount>,
	) -> anyhow::Result<Signed<LightningPayRequest>> {
		let change = match change {
			Some(amount) => {
				let keypair = self.derive_store_next_keypair()?;
				Some(VtxoRequest { pubkey: keypair.public_key(), amount })
			},
			None => None,
		};
		let keys = self.vtxo_keys(inputs.iter().map(|v| &v.vtxo))?;
		Signed::sign(LightningPayRequest {
			invoice: send.invoice.clone(),
			amount: send.amount,
			inputs: inputs.iter().map(|v| v.vtxo.clone()).collect(),
			change,
		}, &keys)
	}

	/// The total amount of the inputs of a lightning send.
	fn lightning_send_input_amount(&self, send: &LightningSend) -> anyhow::Result<Amount> {
		let mut total = Amount::ZERO;
		for id in &send.inputs {
			let vtxo = self.db.get_wallet_vtxo(*id)?
				.ok_or_else(|| Error::conflict(format!("input {} of lightning send is gone", id)))?;
			total += vtxo.amount();
		}
		Ok(total)
	}

	/// The server paid the invoice, our inputs are spent.
	async fn settle_lightning_send(
		&self,
		send: &LightningSend,
		preimage: Preimage,
		change: Option<Vtxo>,
	) -> Result<(), Error> {
		if preimage.compute_payment_hash() != send.payment_hash {
			return Err(Error::protocol(format!(
				"server returned a wrong preimage for payment {}", send.payment_hash,
			)));
		}

		let input_amount = self.lightning_send_input_amount(send)?;
		let surplus = input_amount.checked_sub(send.amount)
			.ok_or_else(|| Error::conflict("lightning send inputs don't cover the amount"))?;
		let expected_change = Some(surplus).filter(|s| *s >= self.config.dust_threshold);
		match (&change, expected_change) {
			(None, None) => {},
			(Some(vtxo), Some(amount)) => {
				let ark_info = self.require_ark_info().await?;
				if self.db.get_vtxo_key_index(&vtxo.user_pubkey)?.is_none() {
					return Err(Error::protocol("lightning change pays to a key that is not ours"));
				}
				self.verify_vtxo(vtxo, &ark_info, vtxo.user_pubkey, amount)?;
			},
			(Some(_), None) => return Err(Error::protocol("unexpected change from lightning payment")),
			(None, Some(_)) => return Err(Error::protocol("missing change from lightning payment")),
		}

		let mut changes = StagedChanges::new();
		changes.remove_vtxos(send.inputs.iter().copied());
		if let Some(vtxo) = change {
			changes.add_vtxo(vtxo, VtxoState::Spendable);
		}
		changes.store_lightning_send(LightningSend {
			status: LightningSendStatus::Paid,
			preimage: Some(preimage),
			..send.clone()
		});
		self.commit(&changes)?;

		info!("Lightning payment {} succeeded", send.payment_hash);
		Ok(())
	}

	/// The payment failed, give back the inputs.
	///
	/// The revocation movement restores the balance the payment took, the
	/// dust surplus that would have been fees included.
	fn revoke_lightning_send(&self, send: &LightningSend) -> anyhow::Result<()> {
		let input_amount = self.lightning_send_input_amount(send)?;
		let surplus = input_amount.checked_sub(send.amount).unwrap_or(Amount::ZERO);
		let dust_fee = if surplus < self.config.dust_threshold { surplus } else { Amount::ZERO };

		let mut changes = StagedChanges::new();
		changes.update_state(send.inputs.iter().copied(), VtxoState::Spendable, &[VtxoState::Locked]);
		changes.remove_lightning_send(send.payment_hash);
		changes.add_movement(
			NewMovement::new(MovementKind::LightningSendRevocation).received(send.amount + dust_fee),
		);
		self.commit(&changes)?;

		info!("Revoked lightning payment {}, {} vtxos are spendable again",
			send.payment_hash, send.inputs.len(),
		);
		Ok(())
	}

	/// Resolve lightning payments that were pending with the server.
	pub(crate) async fn sync_pending_lightning_sends(&self) -> anyhow::Result<()> {
		for send in self.db.get_pending_lightning_sends()? {
			match self.server.check_bolt11_payment(send.payment_hash).await {
				Ok(LightningPayStatus::Succeeded { preimage, change }) => {
					if let Err(e) = self.settle_lightning_send(&send, preimage, change).await {
						error!("Failed to settle lightning payment {}: {}", send.payment_hash, e);
					}
				},
				Ok(LightningPayStatus::Failed { reason }) => {
					warn!("Lightning payment {} failed: {}", send.payment_hash, reason);
					self.revoke_lightning_send(&send)?;
				},
				Ok(LightningPayStatus::Pending) => {
					debug!("Lightning payment {} still pending", send.payment_hash);
				},
				Err(e) => warn!("Failed to check lightning payment {}: {}", send.payment_hash, e),
			}
		}
		Ok(())
	}
}
