
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bitcoin::secp256k1::PublicKey;
use bitcoin::{Amount, FeeRate, Txid};

use ark::VtxoId;
use bitcoin_ext::BlockHeight;

use crate::exit::ExitState;
use crate::primitives::{MovementId, VtxoInfo};
use crate::serde_utils;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ArkInfo {
	/// the network the server operates on
	pub network: bitcoin::Network,
	/// The Ark server pubkey
	pub asp_pubkey: PublicKey,
	/// The interval between each round
	#[serde(with = "serde_utils::duration")]
	pub round_interval: Duration,
	/// Number of nonces per round
	pub nb_round_nonces: usize,
	/// Delta between exit confirmation and coins becoming spendable
	pub vtxo_exit_delta: u16,
	/// Expiration delta of the VTXO
	pub vtxo_expiry_delta: u16,
	/// Maximum amount of a VTXO
	#[serde(rename = "max_vtxo_amount_sat", with = "bitcoin::amount::serde::as_sat::opt")]
	pub max_vtxo_amount: Option<Amount>,
	/// Fee rate used for offboards
	#[serde(rename = "offboard_feerate_kvb", with = "serde_utils::fee_rate_sat_per_kvb")]
	pub offboard_feerate: FeeRate,
}

impl<T: Borrow<ark::ArkInfo>> From<T> for ArkInfo {
	fn from(v: T) -> Self {
		let v = v.borrow();
		ArkInfo {
			network: v.network,
			asp_pubkey: v.asp_pubkey,
			round_interval: v.round_interval,
			nb_round_nonces: v.nb_round_nonces,
			vtxo_exit_delta: v.vtxo_exit_delta,
			vtxo_expiry_delta: v.vtxo_expiry_delta,
			max_vtxo_amount: v.max_vtxo_amount,
			offboard_feerate: v.offboard_feerate,
		}
	}
}

/// The off-chain balance of the wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct WalletBalance {
	#[serde(rename = "spendable_sat", with = "bitcoin::amount::serde::as_sat")]
	pub spendable: Amount,
	#[serde(rename = "pending_lightning_send_sat", with = "bitcoin::amount::serde::as_sat")]
	pub pending_lightning_send: Amount,
	#[serde(rename = "pending_exit_sat", with = "bitcoin::amount::serde::as_sat")]
	pub pending_exit: Amount,
	#[serde(rename = "pending_board_sat", with = "bitcoin::amount::serde::as_sat")]
	pub pending_board: Amount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OnchainBalance {
	/// All of them combined.
	#[serde(rename = "total_sat", with = "bitcoin::amount::serde::as_sat")]
	pub total: Amount,
	/// Confirmed coins plus unconfirmed change of our own transactions.
	///
	/// This is the balance you can spend right now that shouldn't get cancelled via another party
	/// double spending it.
	#[serde(rename = "trusted_spendable_sat", with = "bitcoin::amount::serde::as_sat")]
	pub trusted_spendable: Amount,
}

/// Aggregated progress of all unilateral exits of the wallet.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct ExitStatus {
	/// Whether all exits have been swept
	pub done: bool,
	/// The highest confirmation height of the exit transactions, once all
	/// of them confirmed
	pub height: Option<BlockHeight>,
	/// Status of each exit
	pub exits: Vec<ExitProgressStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ExitProgressStatus {
	/// The ID of the VTXO that is being unilaterally exited
	pub vtxo_id: VtxoId,
	/// The current state of the exit
	pub state: ExitState,
}

/// The kind of a balance-affecting event.
///
/// The numeric values are stored and must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MovementKind {
	Board = 1,
	Round = 2,
	Offboard = 3,
	Exit = 4,
	ArkoorSend = 5,
	ArkoorReceive = 6,
	LightningSend = 7,
	LightningSendRevocation = 8,
	LightningReceive = 9,
	/// VTXOs the server spent in a request whose result we never received.
	Forfeit = 10,
}

impl MovementKind {
	pub fn to_u8(self) -> u8 {
		self as u8
	}

	pub fn from_u8(v: u8) -> Option<MovementKind> {
		Some(match v {
			1 => MovementKind::Board,
			2 => MovementKind::Round,
			3 => MovementKind::Offboard,
			4 => MovementKind::Exit,
			5 => MovementKind::ArkoorSend,
			6 => MovementKind::ArkoorReceive,
			7 => MovementKind::LightningSend,
			8 => MovementKind::LightningSendRevocation,
			9 => MovementKind::LightningReceive,
			10 => MovementKind::Forfeit,
			_ => return None,
		})
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			MovementKind::Board => "board",
			MovementKind::Round => "round",
			MovementKind::Offboard => "offboard",
			MovementKind::Exit => "exit",
			MovementKind::ArkoorSend => "arkoor-send",
			MovementKind::ArkoorReceive => "arkoor-receive",
			MovementKind::LightningSend => "lightning-send",
			MovementKind::LightningSendRevocation => "lightning-send-revocation",
			MovementKind::LightningReceive => "lightning-receive",
			MovementKind::Forfeit => "forfeit",
		}
	}
}

impl fmt::Display for MovementKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// An entry of the movement ledger.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Movement {
	pub id: MovementId,
	pub kind: MovementKind,
	#[serde(rename = "amount_sent_sat", with = "bitcoin::amount::serde::as_sat")]
	pub amount_sent: Amount,
	#[serde(rename = "amount_received_sat", with = "bitcoin::amount::serde::as_sat")]
	pub amount_received: Amount,
	#[serde(rename = "fees_sat", with = "bitcoin::amount::serde::as_sat")]
	pub fees: Amount,
	/// Movement date
	pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OnchainTxState {
	Pending,
	Confirmed,
}

impl OnchainTxState {
	pub fn as_str(&self) -> &'static str {
		match self {
			OnchainTxState::Pending => "pending",
			OnchainTxState::Confirmed => "confirmed",
		}
	}
}

impl fmt::Display for OnchainTxState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OnchainTxType {
	Board,
	Send,
	Receive,
}

impl OnchainTxType {
	pub fn as_str(&self) -> &'static str {
		match self {
			OnchainTxType::Board => "board",
			OnchainTxType::Send => "send",
			OnchainTxType::Receive => "receive",
		}
	}
}

impl fmt::Display for OnchainTxType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for OnchainTxType {
	type Err = &'static str;
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"board" => Ok(OnchainTxType::Board),
			"send" => Ok(OnchainTxType::Send),
			"receive" => Ok(OnchainTxType::Receive),
			_ => Err("invalid onchain tx type"),
		}
	}
}

/// A transaction of the on-chain wallet.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct OnchainTransaction {
	pub txid: Txid,
	#[serde(rename = "amount_sat", with = "bitcoin::amount::serde::as_sat")]
	pub amount: Amount,
	/// Unix timestamp in seconds
	pub created_at: u64,
	pub state: OnchainTxState,
	pub tx_type: OnchainTxType,
	pub num_confirmations: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Board {
	/// The transaction that funds the board VTXOs
	pub funding_txid: Txid,
	pub vtxos: Vec<VtxoInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Offboard {
	/// The round transaction that pays to the destination
	pub round_txid: Txid,
}

pub mod onchain {
	use super::*;

	#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
	pub struct Send {
		pub txid: Txid,
	}

	#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
	pub struct Address {
		pub address: bitcoin::Address<bitcoin::address::NetworkUnchecked>,
	}
}
