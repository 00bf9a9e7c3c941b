
use bitcoin_ext::{BlockDelta, BlockHeight};

/// The progress of the unilateral exit of a single VTXO.
///
/// An exit moves `Requested -> Broadcast -> Confirming -> Swept`. Whenever
/// the exit transactions fail to propagate or disappear from the chain, it
/// becomes `Stalled` and is retried from there.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ExitState {
	Requested,
	Broadcast {
		/// Tip height at which the exit transactions were broadcast
		height: BlockHeight,
	},
	Confirming {
		confirmed_height: BlockHeight,
	},
	Swept {
		confirmed_height: BlockHeight,
	},
	Stalled {
		reason: String,
	},
}

impl ExitState {
	pub fn new_requested() -> Self {
		ExitState::Requested
	}

	pub fn new_broadcast(tip: BlockHeight) -> Self {
		ExitState::Broadcast { height: tip }
	}

	pub fn new_confirming(confirmed_height: BlockHeight) -> Self {
		ExitState::Confirming { confirmed_height }
	}

	pub fn new_swept(confirmed_height: BlockHeight) -> Self {
		ExitState::Swept { confirmed_height }
	}

	pub fn new_stalled(reason: impl Into<String>) -> Self {
		ExitState::Stalled { reason: reason.into() }
	}

	/// Whether the exit still needs to be driven.
	pub fn is_pending(&self) -> bool {
		!matches!(self, ExitState::Swept { .. })
	}

	/// The height at which the exit transaction confirmed, if it did.
	pub fn confirmed_height(&self) -> Option<BlockHeight> {
		match self {
			ExitState::Confirming { confirmed_height } => Some(*confirmed_height),
			ExitState::Swept { confirmed_height } => Some(*confirmed_height),
			ExitState::Requested | ExitState::Broadcast { .. } | ExitState::Stalled { .. } => None,
		}
	}

	/// The first height at which the exit output can be swept.
	pub fn spendable_height(&self, exit_delta: BlockDelta) -> Option<BlockHeight> {
		self.confirmed_height().map(|h| h + exit_delta as BlockHeight)
	}

	pub fn kind(&self) -> &'static str {
		match self {
			ExitState::Requested => "requested",
			ExitState::Broadcast { .. } => "broadcast",
			ExitState::Confirming { .. } => "confirming",
			ExitState::Swept { .. } => "swept",
			ExitState::Stalled { .. } => "stalled",
		}
	}
}
