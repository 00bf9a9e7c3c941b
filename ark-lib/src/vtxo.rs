
use bitcoin::{taproot, Amount, OutPoint, ScriptBuf, Transaction, TxOut, Txid};
use bitcoin::hashes::{sha256, Hash, HashEngine};
use bitcoin::secp256k1::{schnorr, Keypair, Message, PublicKey};

use bitcoin_ext::{BlockDelta, BlockHeight};

use crate::VtxoId;
use crate::util::{self, SECP};

/// Tag committed into every server signature over a VTXO.
const VTXO_SIGNATURE_TAG: &[u8] = b"ark/vtxo/server-signature";

/// The clause that allows the user to unilaterally spend the exit output
/// after `exit_delta` blocks.
pub fn exit_clause(
	user_pubkey: PublicKey,
	exit_delta: BlockDelta,
) -> ScriptBuf {
	util::delayed_sign(exit_delta, user_pubkey.x_only_public_key().0)
}

/// The clause used by user and server to cooperatively spend.
pub fn cosign_clause(
	user_pubkey: PublicKey,
	asp_pubkey: PublicKey,
) -> ScriptBuf {
	util::multisig_2of2(user_pubkey.x_only_public_key().0, asp_pubkey.x_only_public_key().0)
}

/// Taproot of a VTXO output and of board funding outputs.
pub fn exit_taproot(
	user_pubkey: PublicKey,
	asp_pubkey: PublicKey,
	exit_delta: BlockDelta,
) -> taproot::TaprootSpendInfo {
	let combined_pk = util::combine_keys(user_pubkey, asp_pubkey);
	bitcoin::taproot::TaprootBuilder::new()
		.add_leaf(1, cosign_clause(user_pubkey, asp_pubkey)).expect("valid depth")
		.add_leaf(1, exit_clause(user_pubkey, exit_delta)).expect("valid depth")
		.finalize(&SECP, combined_pk).expect("complete tree")
}

pub fn exit_spk(
	user_pubkey: PublicKey,
	asp_pubkey: PublicKey,
	exit_delta: BlockDelta,
) -> ScriptBuf {
	let taproot = exit_taproot(user_pubkey, asp_pubkey, exit_delta);
	ScriptBuf::new_p2tr_tweaked(taproot.output_key())
}

/// The script the funding tx of a board pays to.
///
/// The exit branch of the board VTXO spends this output.
pub fn board_spk(
	user_pubkey: PublicKey,
	asp_pubkey: PublicKey,
	exit_delta: BlockDelta,
) -> ScriptBuf {
	exit_spk(user_pubkey, asp_pubkey, exit_delta)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VtxoValidationError {
	#[error("the exit branch is empty")]
	EmptyExitBranch,
	#[error("exit tx {txid} does not spend the previous tx of the branch")]
	BrokenExitBranch { txid: Txid },
	#[error("the last exit tx doesn't create the vtxo output")]
	ExitOutputMismatch,
	#[error("exit branch is anchored on {found} instead of {expected}")]
	WrongAnchor { expected: OutPoint, found: OutPoint },
	#[error("invalid server signature on vtxo {0}")]
	InvalidSignature(VtxoId),
}

/// A virtual transaction output held by a user of the Ark.
///
/// The VTXO can be spent cooperatively together with the server as long
/// as it hasn't expired, or unilaterally by broadcasting the transactions
/// of its [Vtxo::exit_branch].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Vtxo {
	pub point: OutPoint,
	#[serde(rename = "amount_sat", with = "bitcoin::amount::serde::as_sat")]
	pub amount: Amount,
	pub user_pubkey: PublicKey,
	pub asp_pubkey: PublicKey,
	pub expiry_height: BlockHeight,
	pub exit_delta: BlockDelta,
	pub is_arkoor: bool,
	/// Signed transactions that, broadcast in order, create [Vtxo::point]
	/// on chain.
	pub exit_branch: Vec<Transaction>,
	pub asp_signature: schnorr::Signature,
}

impl Vtxo {
	pub fn id(&self) -> VtxoId {
		self.point.into()
	}

	pub fn amount(&self) -> Amount {
		self.amount
	}

	/// The on-chain outpoint the exit branch of this VTXO is built on.
	pub fn chain_anchor(&self) -> Option<OutPoint> {
		self.exit_branch.first().and_then(|tx| tx.input.first()).map(|i| i.previous_output)
	}

	/// The last transaction of the exit branch, the one creating the VTXO output.
	pub fn exit_tx(&self) -> Option<&Transaction> {
		self.exit_branch.last()
	}

	pub fn exit_spk(&self) -> ScriptBuf {
		exit_spk(self.user_pubkey, self.asp_pubkey, self.exit_delta)
	}

	pub fn exit_taproot(&self) -> taproot::TaprootSpendInfo {
		exit_taproot(self.user_pubkey, self.asp_pubkey, self.exit_delta)
	}

	pub fn exit_clause(&self) -> ScriptBuf {
		exit_clause(self.user_pubkey, self.exit_delta)
	}

	pub fn txout(&self) -> TxOut {
		TxOut {
			value: self.amount,
			script_pubkey: self.exit_spk(),
		}
	}

	/// Whether the VTXO can no longer be spent cooperatively at the given tip.
	pub fn is_expired(&self, tip: BlockHeight) -> bool {
		self.expiry_height <= tip
	}

	/// The message the server signs to vouch for this VTXO.
	pub fn signature_message(&self) -> Message {
		let mut engine = sha256::Hash::engine();
		engine.input(VTXO_SIGNATURE_TAG);
		engine.input(self.point.txid.as_byte_array());
		engine.input(&self.point.vout.to_le_bytes());
		engine.input(&self.amount.to_sat().to_le_bytes());
		engine.input(&self.user_pubkey.serialize());
		engine.input(&self.asp_pubkey.serialize());
		engine.input(&self.expiry_height.to_le_bytes());
		engine.input(&self.exit_delta.to_le_bytes());
		engine.input(&[self.is_arkoor as u8]);
		for tx in &self.exit_branch {
			engine.input(tx.compute_txid().as_byte_array());
		}
		Message::from_digest(sha256::Hash::from_engine(engine).to_byte_array())
	}

	/// Sign this VTXO with the server key.
	///
	/// The keypair must belong to [Vtxo::asp_pubkey].
	pub fn sign_as_server(&mut self, asp_key: &Keypair) {
		debug_assert_eq!(asp_key.public_key(), self.asp_pubkey);
		self.asp_signature = SECP.sign_schnorr_no_aux_rand(&self.signature_message(), asp_key);
	}

	pub fn verify_server_signature(&self) -> Result<(), VtxoValidationError> {
		let pk = self.asp_pubkey.x_only_public_key().0;
		SECP.verify_schnorr(&self.asp_signature, &self.signature_message(), &pk)
			.map_err(|_| VtxoValidationError::InvalidSignature(self.id()))
	}

	/// Check that the exit branch is a chain of transactions ending in the
	/// VTXO output.
	pub fn validate_exit_branch(&self) -> Result<(), VtxoValidationError> {
		let mut prev_txid = None;
		for tx in &self.exit_branch {
			if let Some(prev) = prev_txid {
				if !tx.input.iter().any(|i| i.previous_output.txid == prev) {
					return Err(VtxoValidationError::BrokenExitBranch { txid: tx.compute_txid() });
				}
			}
			prev_txid = Some(tx.compute_txid());
		}

		let last = self.exit_tx().ok_or(VtxoValidationError::EmptyExitBranch)?;
		if last.compute_txid() != self.point.txid {
			return Err(VtxoValidationError::ExitOutputMismatch);
		}
		match last.output.get(self.point.vout as usize) {
			Some(out) if *out == self.txout() => Ok(()),
			_ => Err(VtxoValidationError::ExitOutputMismatch),
		}
	}

	/// Full validation of a VTXO handed out by the server.
	pub fn validate(&self) -> Result<(), VtxoValidationError> {
		self.validate_exit_branch()?;
		self.verify_server_signature()
	}

	/// Full validation, also checking the branch is built on the given outpoint.
	pub fn validate_anchored(&self, anchor: OutPoint) -> Result<(), VtxoValidationError> {
		self.validate()?;
		let found = self.chain_anchor().ok_or(VtxoValidationError::EmptyExitBranch)?;
		if found != anchor {
			return Err(VtxoValidationError::WrongAnchor { expected: anchor, found });
		}
		Ok(())
	}
}
