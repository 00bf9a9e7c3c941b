
use bitcoin::Amount;

pub use bark_json::MovementId;
pub use bark_json::cli::{Movement, MovementKind};

/// A movement that is yet to be written to the ledger.
///
/// The id and creation time are assigned by the persister.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMovement {
	pub kind: MovementKind,
	pub amount_sent: Amount,
	pub amount_received: Amount,
	pub fees: Amount,
}

impl NewMovement {
	pub fn new(kind: MovementKind) -> NewMovement {
		NewMovement {
			kind,
			amount_sent: Amount::ZERO,
			amount_received: Amount::ZERO,
			fees: Amount::ZERO,
		}
	}

	pub fn sent(mut self, amount: Amount) -> Self {
		self.amount_sent = amount;
		self
	}

	pub fn received(mut self, amount: Amount) -> Self {
		self.amount_received = amount;
		self
	}

	pub fn fees(mut self, fees: Amount) -> Self {
		self.fees = fees;
		self
	}
}
