
use bitcoin::{Amount, OutPoint, Txid};
use lightning_invoice::Bolt11Invoice;

use ark::{Vtxo, VtxoId};
use ark::lightning::{PaymentHash, Preimage};
use bark_json::cli::{OnchainTransaction, OnchainTxState, OnchainTxType};
use bark_json::exit::ExitState;
use bitcoin_ext::BlockHeight;

use crate::movement::NewMovement;
use crate::onchain::ExitUtxo;
use crate::vtxo_state::{VtxoState, WalletVtxo};

/// An invoice we issued and the preimage that settles it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LightningReceive {
	pub payment_hash: PaymentHash,
	pub preimage: Preimage,
	pub invoice: Bolt11Invoice,
	pub amount: Amount,
	pub claimed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightningSendStatus {
	/// The server may or may not have paid the invoice yet.
	Pending,
	Paid,
}

impl LightningSendStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			LightningSendStatus::Pending => "pending",
			LightningSendStatus::Paid => "paid",
		}
	}
}

/// An outgoing lightning payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LightningSend {
	pub payment_hash: PaymentHash,
	pub invoice: Bolt11Invoice,
	pub amount: Amount,
	/// The VTXOs locked to fund this payment.
	pub inputs: Vec<VtxoId>,
	pub status: LightningSendStatus,
	pub preimage: Option<Preimage>,
}

impl LightningSend {
	pub fn is_pending(&self) -> bool {
		self.status == LightningSendStatus::Pending
	}
}

/// A unilateral exit of a single VTXO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredExit {
	pub vtxo: Vtxo,
	pub state: ExitState,
}

impl StoredExit {
	pub fn id(&self) -> VtxoId {
		self.vtxo.id()
	}
}

/// An on-chain transaction that touched the wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredOnchainTx {
	pub txid: Txid,
	pub amount: Amount,
	/// Unix timestamp in seconds
	pub created_at: u64,
	pub tx_type: OnchainTxType,
	pub confirmation_height: Option<BlockHeight>,
}

impl StoredOnchainTx {
	pub fn to_onchain_transaction(&self, tip: Option<BlockHeight>) -> OnchainTransaction {
		let num_confirmations = match (self.confirmation_height, tip) {
			(Some(h), Some(tip)) if tip >= h => tip - h + 1,
			(Some(_), _) => 1,
			(None, _) => 0,
		};
		OnchainTransaction {
			txid: self.txid,
			amount: self.amount,
			created_at: self.created_at,
			state: if self.confirmation_height.is_some() {
				OnchainTxState::Confirmed
			} else {
				OnchainTxState::Pending
			},
			tx_type: self.tx_type,
			num_confirmations,
		}
	}
}

/// A state transition that only applies when the VTXO is in one of the
/// `allowed_old` states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VtxoStateUpdate {
	pub vtxo_id: VtxoId,
	pub new_state: VtxoState,
	pub allowed_old: Vec<VtxoState>,
}

/// Everything read to compute balances, taken from one read transaction.
#[derive(Debug, Clone, Default)]
pub struct WalletSnapshot {
	pub vtxos: Vec<WalletVtxo>,
	pub pending_lightning_sends: Vec<LightningSend>,
}

/// A set of changes that is committed atomically.
///
/// Checked parts (state updates, claims, removals, new VTXOs and new exit
/// outputs) make the whole commit fail with [crate::Error::Conflict] or
/// [crate::Error::DuplicateOutpoint] when the store changed since the
/// changes were prepared.
#[derive(Debug, Clone, Default)]
pub struct StagedChanges {
	pub state_updates: Vec<VtxoStateUpdate>,
	pub removed_vtxos: Vec<VtxoId>,
	pub new_vtxos: Vec<(Vtxo, VtxoState)>,
	pub removed_exit_utxos: Vec<OutPoint>,
	pub new_exit_utxos: Vec<ExitUtxo>,
	pub movements: Vec<NewMovement>,
	/// Inserted or replaced.
	pub exits: Vec<StoredExit>,
	/// Inserted or, for known txids, updated with the confirmation height.
	pub onchain_txs: Vec<StoredOnchainTx>,
	pub new_lightning_receives: Vec<LightningReceive>,
	pub claimed_lightning_receives: Vec<PaymentHash>,
	/// Inserted or replaced.
	pub lightning_sends: Vec<LightningSend>,
	pub removed_lightning_sends: Vec<PaymentHash>,
}

impl StagedChanges {
	pub fn new() -> StagedChanges {
		StagedChanges::default()
	}

	pub fn is_empty(&self) -> bool {
		self.state_updates.is_empty()
			&& self.removed_vtxos.is_empty()
			&& self.new_vtxos.is_empty()
			&& self.removed_exit_utxos.is_empty()
			&& self.new_exit_utxos.is_empty()
			&& self.movements.is_empty()
			&& self.exits.is_empty()
			&& self.onchain_txs.is_empty()
			&& self.new_lightning_receives.is_empty()
			&& self.claimed_lightning_receives.is_empty()
			&& self.lightning_sends.is_empty()
			&& self.removed_lightning_sends.is_empty()
	}

	pub fn update_state(
		&mut self,
		ids: impl IntoIterator<Item = VtxoId>,
		new_state: VtxoState,
		allowed_old: &[VtxoState],
	) -> &mut Self {
		for vtxo_id in ids {
			self.state_updates.push(VtxoStateUpdate {
				vtxo_id,
				new_state,
				allowed_old: allowed_old.to_vec(),
			});
		}
		self
	}

	pub fn remove_vtxos(&mut self, ids: impl IntoIterator<Item = VtxoId>) -> &mut Self {
		self.removed_vtxos.extend(ids);
		self
	}

	pub fn add_vtxo(&mut self, vtxo: Vtxo, state: VtxoState) -> &mut Self {
		self.new_vtxos.push((vtxo, state));
		self
	}

	/// Fails the commit if the exit output is not stored.
	pub fn remove_exit_utxo(&mut self, outpoint: OutPoint) -> &mut Self {
		self.removed_exit_utxos.push(outpoint);
		self
	}

	pub fn add_exit_utxo(&mut self, utxo: ExitUtxo) -> &mut Self {
		self.new_exit_utxos.push(utxo);
		self
	}

	pub fn add_movement(&mut self, movement: NewMovement) -> &mut Self {
		self.movements.push(movement);
		self
	}

	pub fn store_exit(&mut self, exit: StoredExit) -> &mut Self {
		self.exits.push(exit);
		self
	}

	pub fn store_onchain_tx(&mut self, tx: StoredOnchainTx) -> &mut Self {
		self.onchain_txs.push(tx);
		self
	}

	pub fn add_lightning_receive(&mut self, receive: LightningReceive) -> &mut Self {
		self.new_lightning_receives.push(receive);
		self
	}

	/// Marks the receive as claimed, fails the commit if it already was.
	pub fn claim_lightning_receive(&mut self, payment_hash: PaymentHash) -> &mut Self {
		self.claimed_lightning_receives.push(payment_hash);
		self
	}

	pub fn store_lightning_send(&mut self, send: LightningSend) -> &mut Self {
		self.lightning_sends.push(send);
		self
	}

	pub fn remove_lightning_send(&mut self, payment_hash: PaymentHash) -> &mut Self {
		self.removed_lightning_sends.push(payment_hash);
		self
	}
}
