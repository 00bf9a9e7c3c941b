use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

use ark::Vtxo;

const SPENDABLE: &'static str = "Spendable";
const PENDING_BOARD: &'static str = "PendingBoard";
const LOCKED: &'static str = "Locked";
const EXITING: &'static str = "Exiting";

/// The lifecycle state of a VTXO held by the wallet.
///
/// Spent VTXOs are removed from the wallet, so there is no spent state.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VtxoState {
	/// The VTXO can be used as input of any operation.
	Spendable,
	/// The funding tx of this board was signed but the board was not yet
	/// registered with the server.
	PendingBoard,
	/// The VTXO is an input of an in-flight operation.
	Locked,
	/// The VTXO is being unilaterally exited.
	Exiting,
}

impl fmt::Display for VtxoState {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", self.as_str())
	}
}

impl FromStr for VtxoState {

	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			SPENDABLE => Ok(VtxoState::Spendable),
			PENDING_BOARD => Ok(VtxoState::PendingBoard),
			LOCKED => Ok(VtxoState::Locked),
			EXITING => Ok(VtxoState::Exiting),
			_ => bail!("Invalid VtxoState: {}", s)
		}
	}
}

impl VtxoState {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Spendable => SPENDABLE,
			Self::PendingBoard => PENDING_BOARD,
			Self::Locked => LOCKED,
			Self::Exiting => EXITING,
		}
	}
}

/// A [Vtxo] together with its current state in the wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletVtxo {
	pub vtxo: Vtxo,
	pub state: VtxoState,
}

impl Deref for WalletVtxo {
	type Target = Vtxo;

	fn deref(&self) -> &Vtxo {
		&self.vtxo
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn convert_vtxo_state_and_back() {
		// From str to vtxostate
		assert_eq!(VtxoState::from_str("Spendable").unwrap(), VtxoState::Spendable);
		assert_eq!(VtxoState::from_str("PendingBoard").unwrap(), VtxoState::PendingBoard);
		assert_eq!(VtxoState::from_str("Locked").unwrap(), VtxoState::Locked);
		assert_eq!(VtxoState::from_str("Exiting").unwrap(), VtxoState::Exiting);
		assert!(VtxoState::from_str("Spent").is_err());

		// the serde names are used in the database too
		for state in [VtxoState::Spendable, VtxoState::PendingBoard, VtxoState::Locked, VtxoState::Exiting] {
			assert_eq!(serde_json::to_string(&state).unwrap(), format!("\"{}\"", state.as_str()));
		}

		// If a compiler error occurs,
		// This is a reminder that you should update the test above
		match VtxoState::Spendable {
			VtxoState::Spendable => {},
			VtxoState::PendingBoard => {},
			VtxoState::Locked => {},
			VtxoState::Exiting => (),
		}
	}
}
