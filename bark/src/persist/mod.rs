//! Persistence abstractions for Bark wallets.
//!
//! This module defines the [BarkPersister] trait and the data models the
//! wallet stores. Custom storage backends can be plugged in by implementing
//! [BarkPersister]; a default rusqlite implementation is provided by
//! [sqlite::SqliteClient].
//!
//! All writes go through [BarkPersister::commit], which applies a
//! [StagedChanges] set atomically.

pub mod models;
pub mod sqlite;


use bdk_wallet::ChangeSet;
use bitcoin::secp256k1::PublicKey;

use ark::{ArkInfo, VtxoId};
use ark::lightning::PaymentHash;
use bitcoin_ext::BlockHeight;

use crate::{Config, WalletProperties};
use crate::movement::{Movement, MovementId};
use crate::onchain::ExitUtxo;
use crate::vtxo_state::WalletVtxo;

pub use self::models::{
	LightningReceive, LightningSend, LightningSendStatus, StagedChanges, StoredExit,
	StoredOnchainTx, VtxoStateUpdate, WalletSnapshot,
};

/// Storage interface for Bark wallets.
///
/// Notes for implementors:
/// - [BarkPersister::commit] must apply all changes in one transaction, or
///   none of them.
/// - Checked updates and removals of missing items must fail with
///   [crate::Error::Conflict], duplicate VTXOs and exit outputs with
///   [crate::Error::DuplicateOutpoint], wrapped in [anyhow::Error].
/// - Reads are not required to be consistent with each other, except for
///   [BarkPersister::read_snapshot].
pub trait BarkPersister: Send + Sync + 'static {
	/// Initialize a wallet in storage with the provided config and properties.
	///
	/// Call exactly once per wallet database.
	fn init_wallet(&self, config: &Config, properties: &WalletProperties) -> anyhow::Result<()>;

	fn read_config(&self) -> anyhow::Result<Option<Config>>;

	/// Read wallet properties from storage.
	///
	/// Returns `None` if the wallet was not initialized.
	fn read_properties(&self) -> anyhow::Result<Option<WalletProperties>>;

	/// Cache the latest [ArkInfo] received from the server.
	fn write_ark_info(&self, ark_info: &ArkInfo) -> anyhow::Result<()>;
	fn read_ark_info(&self) -> anyhow::Result<Option<ArkInfo>>;

	/// Store the public key of a derived VTXO key.
	fn store_vtxo_key(&self, index: u32, public_key: PublicKey) -> anyhow::Result<()>;
	fn get_last_vtxo_key_index(&self) -> anyhow::Result<Option<u32>>;
	/// Find the derivation index of one of our VTXO keys.
	fn get_vtxo_key_index(&self, public_key: &PublicKey) -> anyhow::Result<Option<u32>>;
	fn get_vtxo_pubkeys(&self) -> anyhow::Result<Vec<PublicKey>>;

	/// Prepare storage for the BDK wallet and return the state stored so
	/// far, empty for a new wallet.
	fn initialize_bdk_wallet(&self) -> anyhow::Result<ChangeSet>;
	/// Merge an incremental BDK [ChangeSet] into the stored state.
	fn store_bdk_wallet_changeset(&self, changeset: &ChangeSet) -> anyhow::Result<()>;

	/// All VTXOs held by the wallet, in insertion order.
	fn get_all_vtxos(&self) -> anyhow::Result<Vec<WalletVtxo>>;
	fn get_wallet_vtxo(&self, id: VtxoId) -> anyhow::Result<Option<WalletVtxo>>;
	/// Whether the VTXO was ever held by the wallet, including VTXOs that
	/// were spent and removed since.
	fn has_seen_vtxo(&self, id: VtxoId) -> anyhow::Result<bool>;

	/// Outputs of confirmed exits that were not spent yet.
	fn get_exit_utxos(&self) -> anyhow::Result<Vec<ExitUtxo>>;

	/// All movements, ordered by id.
	fn get_movements(&self) -> anyhow::Result<Vec<Movement>>;

	fn get_exits(&self) -> anyhow::Result<Vec<StoredExit>>;

	/// All on-chain transactions, most recent first.
	fn get_onchain_transactions(&self) -> anyhow::Result<Vec<StoredOnchainTx>>;

	fn get_lightning_receive(&self, payment_hash: PaymentHash) -> anyhow::Result<Option<LightningReceive>>;
	fn get_lightning_send(&self, payment_hash: PaymentHash) -> anyhow::Result<Option<LightningSend>>;
	fn get_pending_lightning_sends(&self) -> anyhow::Result<Vec<LightningSend>>;

	/// Read everything that is needed to compute balances in one read
	/// transaction.
	fn read_snapshot(&self) -> anyhow::Result<WalletSnapshot>;

	/// Store the chain tip seen during the last sync.
	fn store_sync_height(&self, height: BlockHeight) -> anyhow::Result<()>;
	fn get_sync_height(&self) -> anyhow::Result<Option<BlockHeight>>;

	/// Atomically apply all the changes.
	///
	/// Returns the ids assigned to the new movements, in order.
	fn commit(&self, changes: &StagedChanges) -> anyhow::Result<Vec<MovementId>>;
}
