
use std::fmt;
use std::str::FromStr;

use bitcoin::{Amount, Network};
use bitcoin::hashes::{sha256, Hash};
use bitcoin::hex::{DisplayHex, FromHex};
use lightning_invoice::Bolt11Invoice;

use bitcoin_ext::AmountExt;

/// The secret revealed when a lightning payment settles.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Preimage([u8; 32]);

impl Preimage {
	/// Generate a new random preimage.
	pub fn random() -> Preimage {
		Preimage(rand::random())
	}

	pub fn from_byte_array(bytes: [u8; 32]) -> Preimage {
		Preimage(bytes)
	}

	pub fn to_byte_array(&self) -> [u8; 32] {
		self.0
	}

	pub fn compute_payment_hash(&self) -> PaymentHash {
		PaymentHash(sha256::Hash::hash(&self.0))
	}
}

impl fmt::Display for Preimage {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Display::fmt(&self.0[..].as_hex(), f)
	}
}

impl fmt::Debug for Preimage {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Display::fmt(self, f)
	}
}

impl FromStr for Preimage {
	type Err = bitcoin::hex::HexToArrayError;
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(Preimage(FromHex::from_hex(s)?))
	}
}

impl serde::Serialize for Preimage {
	fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
		s.collect_str(self)
	}
}

impl<'de> serde::Deserialize<'de> for Preimage {
	fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
		let s = <String as serde::Deserialize>::deserialize(d)?;
		Preimage::from_str(&s).map_err(serde::de::Error::custom)
	}
}

/// The hash of a [Preimage] that identifies a lightning payment.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(transparent)]
pub struct PaymentHash(sha256::Hash);

impl PaymentHash {
	pub fn to_byte_array(&self) -> [u8; 32] {
		self.0.to_byte_array()
	}

	pub fn as_hash(&self) -> sha256::Hash {
		self.0
	}
}

impl From<sha256::Hash> for PaymentHash {
	fn from(h: sha256::Hash) -> PaymentHash {
		PaymentHash(h)
	}
}

impl<'a> From<&'a Bolt11Invoice> for PaymentHash {
	fn from(invoice: &'a Bolt11Invoice) -> PaymentHash {
		PaymentHash(*invoice.payment_hash())
	}
}

impl fmt::Display for PaymentHash {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Display::fmt(&self.0, f)
	}
}

impl fmt::Debug for PaymentHash {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Display::fmt(self, f)
	}
}

impl FromStr for PaymentHash {
	type Err = bitcoin::hex::HexToArrayError;
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(PaymentHash(sha256::Hash::from_str(s)?))
	}
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CheckAmountError {
	#[error("invoice has amount of {invoice} encoded, please omit user-provided amount")]
	AmountConflict { invoice: Amount, user: Amount },
	#[error("the invoice doesn't encode an amount, please provide one")]
	AmountRequired,
	#[error("amount must be strictly positive")]
	ZeroAmount,
}

pub trait Bolt11InvoiceExt {
	fn invoice(&self) -> &Bolt11Invoice;

	/// The amount to pay for this invoice, given the optional user amount.
	///
	/// A user amount is only allowed when the invoice doesn't encode one.
	fn get_final_amount(&self, user_amount: Option<Amount>) -> Result<Amount, CheckAmountError> {
		let invoice_amount = self.invoice().amount_milli_satoshis().map(Amount::from_msat_ceil);
		let amount = match (invoice_amount, user_amount) {
			(Some(invoice), Some(user)) => {
				return Err(CheckAmountError::AmountConflict { invoice, user });
			},
			(Some(a), None) => a,
			(None, Some(a)) => a,
			(None, None) => return Err(CheckAmountError::AmountRequired),
		};
		if amount == Amount::ZERO {
			return Err(CheckAmountError::ZeroAmount);
		}
		Ok(amount)
	}

	fn is_for_network(&self, network: Network) -> bool {
		let inv = self.invoice().network();
		// testnet invoices are used on signet too
		inv == network || (network == Network::Signet && inv == Network::Testnet)
	}
}

impl Bolt11InvoiceExt for Bolt11Invoice {
	fn invoice(&self) -> &Bolt11Invoice { self }
}
