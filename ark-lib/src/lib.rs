
pub extern crate bitcoin;
pub extern crate lightning_invoice;

#[macro_use] extern crate serde;
#[macro_use] extern crate lazy_static;

pub mod address;
pub mod lightning;
pub mod util;
pub mod vtxo;

#[cfg(any(test, feature = "test-util"))]
pub mod test;

pub use crate::address::Address;
pub use crate::vtxo::{Vtxo, VtxoValidationError};
pub use bitcoin_ext::{BlockDelta, BlockHeight};


use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bitcoin::{Amount, FeeRate, Network, OutPoint, Script, ScriptBuf, TxOut, Weight};
use bitcoin::consensus::encode::VarInt;
use bitcoin::secp256k1::PublicKey;

use bitcoin_ext::{P2PKH_DUST_VB, P2SH_DUST_VB, P2TR_DUST_VB, P2WPKH_DUST_VB, P2WSH_DUST_VB};


/// The parameters an Ark server publishes about its Ark.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ArkInfo {
	/// The bitcoin network the server operates on
	pub network: Network,
	/// The Ark server pubkey
	pub asp_pubkey: PublicKey,
	/// The interval between each round
	pub round_interval: Duration,
	/// Number of nonces per round
	pub nb_round_nonces: usize,
	/// Delta between exit confirmation and coins becoming spendable
	pub vtxo_exit_delta: BlockDelta,
	/// Expiration delta of the VTXO
	pub vtxo_expiry_delta: BlockDelta,
	/// Maximum amount of a VTXO
	#[serde(default, with = "bitcoin::amount::serde::as_sat::opt")]
	pub max_vtxo_amount: Option<Amount>,
	/// The fee rate the server charges for offboards
	pub offboard_feerate: FeeRate,
}

/// Request for a new VTXO locked to `pubkey`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct VtxoRequest {
	pub pubkey: PublicKey,
	#[serde(with = "bitcoin::amount::serde::as_sat")]
	pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct OffboardRequest {
	pub script_pubkey: ScriptBuf,
	#[serde(with = "bitcoin::amount::serde::as_sat")]
	pub amount: Amount,
}

/// Output types the server accepts for offboards, with the virtual size
/// Bitcoin Core's dust rule assigns to them.
const OFFBOARD_OUTPUT_TYPES: [(fn(&Script) -> bool, u64); 5] = [
	(Script::is_p2pkh, P2PKH_DUST_VB),
	(Script::is_p2sh, P2SH_DUST_VB),
	(Script::is_p2wpkh, P2WPKH_DUST_VB),
	(Script::is_p2wsh, P2WSH_DUST_VB),
	(Script::is_p2tr, P2TR_DUST_VB),
];

impl OffboardRequest {
	/// The fee the server charges for an offboard to `script`.
	///
	/// This is the dust amount of the output at the given fee rate instead of
	/// the 3 sat/vb relay rate. Returns [None] for scripts that can't be
	/// offboarded to.
	pub fn calculate_fee(script: &Script, fee_rate: FeeRate) -> Option<Amount> {
		let vb = match OFFBOARD_OUTPUT_TYPES.iter().find(|(is_type, _)| is_type(script)) {
			Some((_, vb)) => *vb,
			None if script.is_op_return() => {
				let output = 8 + VarInt(script.len() as u64).size() as u64 + script.len() as u64;
				// outpoint, sequence and the empty script and witness
				let input = 36 + 4 + 1 + 1;
				output + input
			},
			None => return None,
		};
		fee_rate.checked_mul_by_weight(Weight::from_vb(vb)?)
	}

	pub fn validate(&self) -> Result<(), &'static str> {
		match Self::calculate_fee(&self.script_pubkey, FeeRate::ZERO) {
			Some(_) => Ok(()),
			None => Err("invalid script"),
		}
	}

	pub fn to_txout(&self) -> TxOut {
		TxOut { value: self.amount, script_pubkey: self.script_pubkey.clone() }
	}
}

/// Identifier of a VTXO: the outpoint of its output.
///
/// Serializes as the `txid:vout` string.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VtxoId(OutPoint);

impl VtxoId {
	pub fn outpoint(self) -> OutPoint {
		self.0
	}
}

impl From<OutPoint> for VtxoId {
	fn from(point: OutPoint) -> VtxoId {
		VtxoId(point)
	}
}

impl fmt::Display for VtxoId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Display::fmt(&self.0, f)
	}
}

impl fmt::Debug for VtxoId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "VtxoId({})", self.0)
	}
}

impl FromStr for VtxoId {
	type Err = <OutPoint as FromStr>::Err;
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(VtxoId(OutPoint::from_str(s)?))
	}
}

impl serde::Serialize for VtxoId {
	fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
		s.collect_str(self)
	}
}

impl<'de> serde::Deserialize<'de> for VtxoId {
	fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
		let s = <std::borrow::Cow<'de, str>>::deserialize(d)?;
		VtxoId::from_str(&s).map_err(serde::de::Error::custom)
	}
}
