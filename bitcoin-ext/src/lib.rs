
#[macro_use] extern crate serde;
extern crate bitcoin as cbitcoin;

mod bitcoin;
pub use bitcoin::{AmountExt, FeeRateExt, KeypairExt};


use cbitcoin::Amount;


/// Type representing a block height in the bitcoin blockchain.
pub type BlockHeight = u32;
/// Type representing a relative number of blocks.
pub type BlockDelta = u16;

/// Where a transaction is known to the chain source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxStatus {
	Confirmed(BlockHeight),
	Mempool,
	NotFound,
}

impl TxStatus {
	pub fn confirmed_height(&self) -> Option<BlockHeight> {
		match self {
			TxStatus::Confirmed(height) => Some(*height),
			_ => None,
		}
	}

	/// Whether the transaction is either confirmed or in the mempool.
	pub fn is_known(&self) -> bool {
		!matches!(self, TxStatus::NotFound)
	}
}

/// Size in vbytes of each standard output type together with the input
/// spending it. At the 3 sat/vB dust relay fee this gives the dust limit.
pub const P2TR_DUST_VB: u64 = 110;
pub const P2WPKH_DUST_VB: u64 = 90;
pub const P2PKH_DUST_VB: u64 = 182;
pub const P2SH_DUST_VB: u64 = 180;
pub const P2WSH_DUST_VB: u64 = 110;

/// 330 satoshis
pub const P2TR_DUST_SAT: u64 = P2TR_DUST_VB * 3;
pub const P2TR_DUST: Amount = Amount::from_sat(P2TR_DUST_SAT);
