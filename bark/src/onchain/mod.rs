//! The on-chain part of the wallet.
//!
//! The wallet keeps track of two kinds of on-chain outputs: outputs of its
//! BDK wallet, paying to BIP-86 taproot addresses, and outputs created by
//! unilaterally exiting VTXOs. The latter are added to BDK transactions as
//! foreign inputs and signed here through their exit clause.

mod bdk;
mod chain;

pub use self::bdk::OnchainWallet;
pub use self::chain::{ChainSource, EsploraChainSource};


use std::collections::HashMap;

use anyhow::Context;
use bitcoin::{psbt, Amount, OutPoint, Psbt, Sequence, TxOut, Weight, Witness};
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{Keypair, Message};
use bitcoin::sighash::{Prevouts, SighashCache, TapSighashType};
use bitcoin::taproot::{LeafVersion, TapLeafHash};

use ark::Vtxo;
use ark::util::SECP;
use bark_json::UtxoInfo;
use bitcoin_ext::BlockHeight;

/// An output of the BDK wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalUtxo {
	pub outpoint: OutPoint,
	pub txout: TxOut,
	pub confirmation_height: Option<BlockHeight>,
}

/// The output of a unilateral exit that was swept into the wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitUtxo {
	pub vtxo: Vtxo,
	/// Height at which the exit transaction confirmed.
	pub height: BlockHeight,
}

impl ExitUtxo {
	pub fn outpoint(&self) -> OutPoint {
		self.vtxo.point
	}

	pub fn amount(&self) -> Amount {
		self.vtxo.amount()
	}

	/// The relative timelock of the exit clause.
	pub fn sequence(&self) -> Sequence {
		Sequence::from_height(self.vtxo.exit_delta)
	}

	/// A witness of the same size as the one that will spend this output.
	fn dummy_witness(&self) -> Witness {
		let script = self.vtxo.exit_clause();
		// internal key and one hash for a tree of two leaves
		let control_block = [0u8; 33 + 32];
		Witness::from_slice(&[&[0u8; 64][..], script.as_bytes(), &control_block[..]])
	}

	/// The weight of the witness spending this output.
	pub fn satisfaction_weight(&self) -> Weight {
		Weight::from_wu(self.dummy_witness().size() as u64)
	}

	/// The PSBT input to add this output as a foreign input.
	pub fn psbt_input(&self) -> psbt::Input {
		psbt::Input {
			witness_utxo: Some(self.vtxo.txout()),
			..Default::default()
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Utxo {
	Local(LocalUtxo),
	Exit(ExitUtxo),
}

impl Utxo {
	pub fn outpoint(&self) -> OutPoint {
		match self {
			Utxo::Local(u) => u.outpoint,
			Utxo::Exit(e) => e.outpoint(),
		}
	}

	pub fn amount(&self) -> Amount {
		match self {
			Utxo::Local(u) => u.txout.value,
			Utxo::Exit(e) => e.amount(),
		}
	}

	pub fn confirmation_height(&self) -> Option<BlockHeight> {
		match self {
			Utxo::Local(u) => u.confirmation_height,
			Utxo::Exit(e) => Some(e.height),
		}
	}
}

impl From<Utxo> for UtxoInfo {
	fn from(v: Utxo) -> UtxoInfo {
		UtxoInfo {
			outpoint: v.outpoint(),
			amount: v.amount(),
			confirmation_height: v.confirmation_height(),
		}
	}
}

/// Sign the inputs of `psbt` that spend exit outputs.
///
/// Each exit is spent through its exit clause with the key in `keys` for
/// its VTXO. The inputs are finalized, other inputs are left untouched.
/// Returns the number of inputs signed.
pub fn sign_exit_inputs(
	psbt: &mut Psbt,
	exits: &[ExitUtxo],
	keys: &HashMap<OutPoint, Keypair>,
) -> anyhow::Result<usize> {
	let prevouts = psbt.inputs.iter().zip(&psbt.unsigned_tx.input).map(|(input, txin)| {
		input.witness_utxo.clone()
			.or_else(|| input.non_witness_utxo.as_ref()
				.and_then(|tx| tx.output.get(txin.previous_output.vout as usize).cloned()))
			.with_context(|| format!("no utxo for input {}", txin.previous_output))
	}).collect::<anyhow::Result<Vec<_>>>()?;
	let prevouts = Prevouts::All(&prevouts);

	let exits = exits.iter().map(|e| (e.outpoint(), e)).collect::<HashMap<_, _>>();
	let mut shc = SighashCache::new(&psbt.unsigned_tx);
	let mut signed = 0;
	for (idx, input) in psbt.inputs.iter_mut().enumerate() {
		let point = shc.transaction().input[idx].previous_output;
		let exit = match exits.get(&point) {
			Some(e) => e,
			None => continue,
		};
		let keypair = keys.get(&point).with_context(|| format!("no key for exit {}", point))?;

		let script = exit.vtxo.exit_clause();
		let leaf_hash = TapLeafHash::from_script(&script, LeafVersion::TapScript);
		let sighash = shc.taproot_script_spend_signature_hash(
			idx, &prevouts, leaf_hash, TapSighashType::Default,
		).context("sighash error")?;
		let msg = Message::from_digest(sighash.to_byte_array());
		let sig = SECP.sign_schnorr_no_aux_rand(&msg, keypair);
		let control_block = exit.vtxo.exit_taproot()
			.control_block(&(script.clone(), LeafVersion::TapScript))
			.context("exit clause not in vtxo taproot")?;
		input.final_script_witness = Some(Witness::from_slice(&[
			&sig.serialize()[..], script.as_bytes(), &control_block.serialize()[..],
		]));
		signed += 1;
	}
	Ok(signed)
}
