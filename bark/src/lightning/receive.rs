use std::str::FromStr;

use bitcoin::Amount;
use lightning_invoice::Bolt11Invoice;

use ark::Vtxo;
use ark::lightning::{Bolt11InvoiceExt, PaymentHash, Preimage};
use bark_json::cli::MovementKind;
use bitcoin_ext::AmountExt;

use crate::{Error, Wallet};
use crate::movement::NewMovement;
use crate::persist::{LightningReceive, StagedChanges};
use crate::server::{LightningClaimRequest, LightningReceiveRequest};
use crate::vtxo_state::VtxoState;

impl Wallet {
	/// Create a lightning invoice to receive `amount`.
	///
	/// The payment is held by the server until it's claimed using
	/// [Wallet::claim_bolt11_payment].
	pub async fn bolt11_invoice(&self, amount: Amount) -> Result<Bolt11Invoice, Error> {
		if amount == Amount::ZERO {
			return Err(Error::BarkFailed("can't create an invoice for zero".into()));
		}

		let preimage = Preimage::random();
		let payment_hash = preimage.compute_payment_hash();
		let invoice = self.server.start_lightning_receive(LightningReceiveRequest {
			payment_hash,
			amount,
		}).await?;

		if PaymentHash::from(&invoice) != payment_hash {
			return Err(Error::protocol("invoice from server has the wrong payment hash"));
		}
		if invoice.amount_milli_satoshis() != Some(amount.to_msat()) {
			return Err(Error::protocol(format!(
				"invoice from server has amount {:?} msat, expected {}",
				invoice.amount_milli_satoshis(), amount,
			)));
		}
		if !invoice.is_for_network(self.properties.network) {
			return Err(Error::protocol("invoice from server is for the wrong network"));
		}

		let mut changes = StagedChanges::new();
		changes.add_lightning_receive(LightningReceive {
			payment_hash,
			preimage,
			invoice: invoice.clone(),
			amount,
			claimed: false,
		});
		self.commit(&changes)?;

		info!("Created invoice for {} with payment hash {}", amount, payment_hash);
		Ok(invoice)
	}

	/// Claim an incoming lightning payment for one of our invoices.
	///
	/// Each invoice can be claimed only once.
	pub async fn claim_bolt11_payment(&self, invoice: &str) -> Result<Vtxo, Error> {
		let invoice = Bolt11Invoice::from_str(invoice)
			.map_err(|e| Error::InvalidBolt11Invoice(e.to_string()))?;
		let payment_hash = PaymentHash::from(&invoice);

		let receive = self.db.get_lightning_receive(payment_hash)?
			.ok_or_else(|| Error::protocol(format!("unknown invoice with payment hash {}", payment_hash)))?;
		if receive.claimed {
			return Err(Error::protocol(format!("invoice {} was already claimed", payment_hash)));
		}

		let ark_info = self.require_ark_info().await?;
		let keypair = self.derive_store_next_keypair()?;
		let vtxo = self.server.claim_lightning_receive(LightningClaimRequest {
			payment_hash,
			preimage: receive.preimage,
			user_pubkey: keypair.public_key(),
		}).await?;
		self.verify_vtxo(&vtxo, &ark_info, keypair.public_key(), receive.amount)?;

		let mut changes = StagedChanges::new();
		changes.claim_lightning_receive(payment_hash);
		changes.add_vtxo(vtxo.clone(), VtxoState::Spendable);
		changes.add_movement(
			NewMovement::new(MovementKind::LightningReceive).received(receive.amount),
		);
		self.commit(&changes)?;

		info!("Claimed lightning payment {} of {}", payment_hash, receive.amount);
		Ok(vtxo)
	}
}
