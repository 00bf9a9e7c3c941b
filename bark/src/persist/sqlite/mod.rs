//! SQLite persistence backend for Bark.
//!
//! Every call opens a fresh connection. Reads of more than one table happen
//! inside a read transaction, writes go through [BarkPersister::commit]
//! which applies a [StagedChanges] set in a single transaction.

mod convert;
mod migrations;
mod query;


use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;
use bitcoin::secp256k1::PublicKey;
use log::{debug, warn};
use rusqlite::{Connection, OpenFlags};

use ark::{ArkInfo, VtxoId};
use ark::lightning::PaymentHash;
use bitcoin_ext::BlockHeight;

use crate::{Config, Error, WalletProperties};
use crate::movement::{Movement, MovementId};
use crate::onchain::ExitUtxo;
use crate::persist::BarkPersister;
use crate::persist::models::{
	LightningReceive, LightningSend, StagedChanges, StoredExit, StoredOnchainTx, WalletSnapshot,
};
use crate::vtxo_state::WalletVtxo;

pub use self::query::unix_now;

/// An implementation of the BarkPersister using rusqlite. Changes are persisted using the given
/// [PathBuf].
#[derive(Clone)]
pub struct SqliteClient {
	connection_string: PathBuf,
}

impl SqliteClient {
	/// Create a new database at the given path.
	///
	/// Fails with [Error::DbFileAlreadyExists] if the file exists.
	pub fn create(db_file: impl AsRef<Path>) -> anyhow::Result<SqliteClient> {
		let path = db_file.as_ref().to_path_buf();
		// claim the file first so that two concurrent creates can't both succeed
		match OpenOptions::new().write(true).create_new(true).open(&path) {
			Ok(_) => {},
			Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
				return Err(Error::DbFileAlreadyExists.into());
			},
			Err(e) => {
				return Err(anyhow::Error::new(e)
					.context(format!("Error creating database {}", path.display())));
			},
		}

		debug!("Creating database at {}", path.display());
		let mut conn = Connection::open(&path)
			.with_context(|| format!("Error creating database {}", path.display()))?;
		migrations::migrate(&mut conn)?;

		Ok(SqliteClient { connection_string: path })
	}

	/// Open an existing database.
	///
	/// Fails with [Error::DbFileNotAccessible] if the file is missing, can't
	/// be read or is not a wallet database.
	pub fn open(db_file: impl AsRef<Path>) -> anyhow::Result<SqliteClient> {
		let path = db_file.as_ref().to_path_buf();
		if !path.is_file() {
			debug!("Database file {} does not exist", path.display());
			return Err(Error::DbFileNotAccessible.into());
		}

		debug!("Opening database at {}", path.display());
		let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
			| OpenFlags::SQLITE_OPEN_URI
			| OpenFlags::SQLITE_OPEN_NO_MUTEX;
		let mut conn = match Connection::open_with_flags(&path, flags) {
			Ok(c) => c,
			Err(e) => {
				warn!("Failed to open database {}: {}", path.display(), e);
				return Err(Error::DbFileNotAccessible.into());
			},
		};
		if let Err(e) = migrations::migrate(&mut conn) {
			warn!("Failed to migrate database {}: {:#}", path.display(), e);
			return Err(Error::DbFileNotAccessible.into());
		}

		Ok(SqliteClient { connection_string: path })
	}

	fn connect(&self) -> anyhow::Result<Connection> {
		rusqlite::Connection::open(&self.connection_string)
			.with_context(|| format!("Error connecting to database {}", self.connection_string.display()))
	}
}

impl BarkPersister for SqliteClient {
	fn init_wallet(&self, config: &Config, properties: &WalletProperties) -> anyhow::Result<()> {
		let mut conn = self.connect()?;
		let tx = conn.transaction()?;

		query::set_properties(&tx, properties)?;
		query::set_config(&tx, config)?;

		tx.commit()?;
		Ok(())
	}

	fn read_config(&self) -> anyhow::Result<Option<Config>> {
		let conn = self.connect()?;
		query::fetch_config(&conn)
	}

	fn read_properties(&self) -> anyhow::Result<Option<WalletProperties>> {
		let conn = self.connect()?;
		query::fetch_properties(&conn)
	}

	fn write_ark_info(&self, ark_info: &ArkInfo) -> anyhow::Result<()> {
		let conn = self.connect()?;
		query::set_ark_info(&conn, ark_info)
	}

	fn read_ark_info(&self) -> anyhow::Result<Option<ArkInfo>> {
		let conn = self.connect()?;
		query::fetch_ark_info(&conn)
	}

	fn store_vtxo_key(&self, index: u32, public_key: PublicKey) -> anyhow::Result<()> {
		let conn = self.connect()?;
		query::store_vtxo_key(&conn, index, public_key)
	}

	fn get_last_vtxo_key_index(&self) -> anyhow::Result<Option<u32>> {
		let conn = self.connect()?;
		query::get_last_vtxo_key_index(&conn)
	}

	fn get_vtxo_key_index(&self, public_key: &PublicKey) -> anyhow::Result<Option<u32>> {
		let conn = self.connect()?;
		query::get_vtxo_key_index(&conn, public_key)
	}

	fn get_vtxo_pubkeys(&self) -> anyhow::Result<Vec<PublicKey>> {
		let conn = self.connect()?;
		query::get_vtxo_pubkeys(&conn)
	}

	fn initialize_bdk_wallet(&self) -> anyhow::Result<bdk_wallet::ChangeSet> {
		let mut conn = self.connect()?;
		Ok(bdk_wallet::WalletPersister::initialize(&mut conn)?)
	}

	fn store_bdk_wallet_changeset(&self, changeset: &bdk_wallet::ChangeSet) -> anyhow::Result<()> {
		let mut conn = self.connect()?;
		bdk_wallet::WalletPersister::persist(&mut conn, changeset)?;
		Ok(())
	}

	fn get_all_vtxos(&self) -> anyhow::Result<Vec<WalletVtxo>> {
		let conn = self.connect()?;
		query::get_all_vtxos(&conn)
	}

	fn get_wallet_vtxo(&self, id: VtxoId) -> anyhow::Result<Option<WalletVtxo>> {
		let conn = self.connect()?;
		query::get_wallet_vtxo(&conn, id)
	}

	fn has_seen_vtxo(&self, id: VtxoId) -> anyhow::Result<bool> {
		let conn = self.connect()?;
		query::has_seen_vtxo(&conn, id)
	}

	fn get_exit_utxos(&self) -> anyhow::Result<Vec<ExitUtxo>> {
		let conn = self.connect()?;
		query::get_exit_utxos(&conn)
	}

	fn get_movements(&self) -> anyhow::Result<Vec<Movement>> {
		let conn = self.connect()?;
		query::get_movements(&conn)
	}

	fn get_exits(&self) -> anyhow::Result<Vec<StoredExit>> {
		let conn = self.connect()?;
		query::get_exits(&conn)
	}

	fn get_onchain_transactions(&self) -> anyhow::Result<Vec<StoredOnchainTx>> {
		let conn = self.connect()?;
		query::get_onchain_transactions(&conn)
	}

	fn get_lightning_receive(&self, payment_hash: PaymentHash) -> anyhow::Result<Option<LightningReceive>> {
		let conn = self.connect()?;
		query::get_lightning_receive(&conn, payment_hash)
	}

	fn get_lightning_send(&self, payment_hash: PaymentHash) -> anyhow::Result<Option<LightningSend>> {
		let conn = self.connect()?;
		query::get_lightning_send(&conn, payment_hash)
	}

	fn get_pending_lightning_sends(&self) -> anyhow::Result<Vec<LightningSend>> {
		let conn = self.connect()?;
		query::get_pending_lightning_sends(&conn)
	}

	fn read_snapshot(&self) -> anyhow::Result<WalletSnapshot> {
		let mut conn = self.connect()?;
		let tx = conn.transaction()?;
		let snapshot = WalletSnapshot {
			vtxos: query::get_all_vtxos(&tx)?,
			pending_lightning_sends: query::get_pending_lightning_sends(&tx)?,
		};
		tx.commit()?;
		Ok(snapshot)
	}

	fn store_sync_height(&self, height: BlockHeight) -> anyhow::Result<()> {
		let conn = self.connect()?;
		query::store_sync_height(&conn, height)
	}

	fn get_sync_height(&self) -> anyhow::Result<Option<BlockHeight>> {
		let conn = self.connect()?;
		query::get_sync_height(&conn)
	}

	fn commit(&self, changes: &StagedChanges) -> anyhow::Result<Vec<MovementId>> {
		let mut conn = self.connect()?;
		let tx = conn.transaction()?;

		for update in &changes.state_updates {
			query::update_vtxo_state_checked(&tx, update)?;
		}
		for payment_hash in &changes.claimed_lightning_receives {
			query::claim_lightning_receive(&tx, *payment_hash)?;
		}
		for id in &changes.removed_vtxos {
			query::remove_vtxo(&tx, *id)?;
		}
		for (vtxo, state) in &changes.new_vtxos {
			query::store_vtxo(&tx, vtxo, *state)?;
		}
		for outpoint in &changes.removed_exit_utxos {
			query::remove_exit_utxo(&tx, *outpoint)?;
		}
		for utxo in &changes.new_exit_utxos {
			query::store_exit_utxo(&tx, utxo)?;
		}
		let mut movement_ids = Vec::with_capacity(changes.movements.len());
		for movement in &changes.movements {
			movement_ids.push(query::create_movement(&tx, movement)?);
		}
		for exit in &changes.exits {
			query::store_exit(&tx, exit)?;
		}
		for onchain_tx in &changes.onchain_txs {
			query::store_onchain_tx(&tx, onchain_tx)?;
		}
		for receive in &changes.new_lightning_receives {
			query::store_lightning_receive(&tx, receive)?;
		}
		for send in &changes.lightning_sends {
			query::store_lightning_send(&tx, send)?;
		}
		for payment_hash in &changes.removed_lightning_sends {
			query::remove_lightning_send(&tx, *payment_hash)?;
		}

		tx.commit()?;
		Ok(movement_ids)
	}
}
