use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use bitcoin::Network;
use bitcoin::bip32::Fingerprint;
use bitcoin::secp256k1::PublicKey;
use rusqlite::{named_params, Connection, OptionalExtension};

use ark::{ArkInfo, Vtxo, VtxoId};
use ark::lightning::PaymentHash;
use bitcoin_ext::BlockHeight;

use crate::{Config, Error, WalletProperties};
use crate::movement::{Movement, MovementId, NewMovement};
use crate::onchain::ExitUtxo;
use crate::persist::models::{
	LightningReceive, LightningSend, StoredExit, StoredOnchainTx, VtxoStateUpdate,
};
use crate::vtxo_state::{VtxoState, WalletVtxo};

use super::convert::{
	raw_vtxo, row_to_exit, row_to_lightning_receive, row_to_lightning_send, row_to_movement,
	row_to_exit_utxo, row_to_onchain_tx, row_to_wallet_vtxo,
};

pub fn unix_now() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Set read-only properties for the wallet
///
/// This fails if properties are already set for the wallet
pub (crate) fn set_properties(
	conn: &Connection,
	properties: &WalletProperties,
) -> anyhow::Result<()> {
	let query =
		"INSERT INTO bark_properties (id, network, fingerprint)
		VALUES (1, :network, :fingerprint)";
	let mut statement = conn.prepare(query)?;

	statement.execute(named_params! {
		":network": properties.network.to_string(),
		":fingerprint": properties.fingerprint.to_string(),
	})?;

	Ok(())
}

pub (crate) fn fetch_properties(conn: &Connection) -> anyhow::Result<Option<WalletProperties>> {
	let query = "SELECT * FROM bark_properties";
	let mut statement = conn.prepare(query)?;
	let mut rows = statement.query([])?;

	if let Some(row) = rows.next()? {
		let network: String = row.get("network")?;
		let fingerprint: String = row.get("fingerprint")?;

		Ok(Some(
			WalletProperties {
				network: Network::from_str(&network).context("invalid network")?,
				fingerprint: Fingerprint::from_str(&fingerprint).context("invalid fingerprint")?,
			}
		))
	} else {
		Ok(None)
	}
}

pub (crate) fn set_config(conn: &Connection, config: &Config) -> anyhow::Result<()> {
	let query = "INSERT INTO bark_config (id, config) VALUES (1, :config)";
	conn.execute(query, named_params! {
		":config": serde_json::to_string(config)?,
	})?;
	Ok(())
}

pub (crate) fn fetch_config(conn: &Connection) -> anyhow::Result<Option<Config>> {
	let query = "SELECT config FROM bark_config WHERE id = 1";
	let config = conn.query_row(query, [], |r| r.get::<_, String>(0)).optional()?;
	match config {
		Some(c) => Ok(Some(serde_json::from_str(&c).context("invalid stored config")?)),
		None => Ok(None),
	}
}

pub (crate) fn set_ark_info(conn: &Connection, ark_info: &ArkInfo) -> anyhow::Result<()> {
	let query = "INSERT OR REPLACE INTO bark_ark_info (id, ark_info) VALUES (1, :ark_info)";
	conn.execute(query, named_params! {
		":ark_info": serde_json::to_string(ark_info)?,
	})?;
	Ok(())
}

pub (crate) fn fetch_ark_info(conn: &Connection) -> anyhow::Result<Option<ArkInfo>> {
	let query = "SELECT ark_info FROM bark_ark_info WHERE id = 1";
	let info = conn.query_row(query, [], |r| r.get::<_, String>(0)).optional()?;
	match info {
		Some(i) => Ok(Some(serde_json::from_str(&i).context("invalid stored ark info")?)),
		None => Ok(None),
	}
}

pub fn store_vtxo_key(conn: &Connection, index: u32, public_key: PublicKey) -> anyhow::Result<()> {
	let query = "INSERT INTO bark_vtxo_key (public_key, idx) VALUES (:public_key, :idx)";
	conn.execute(query, named_params! {
		":public_key": public_key.to_string(),
		":idx": index,
	})?;
	Ok(())
}

pub fn get_last_vtxo_key_index(conn: &Connection) -> anyhow::Result<Option<u32>> {
	let query = "SELECT MAX(idx) FROM bark_vtxo_key";
	Ok(conn.query_row(query, [], |r| r.get::<_, Option<u32>>(0))?)
}

pub fn get_vtxo_key_index(conn: &Connection, public_key: &PublicKey) -> anyhow::Result<Option<u32>> {
	let query = "SELECT idx FROM bark_vtxo_key WHERE public_key = :public_key";
	Ok(conn.query_row(query, named_params! {
		":public_key": public_key.to_string(),
	}, |r| r.get::<_, u32>(0)).optional()?)
}

pub fn get_vtxo_pubkeys(conn: &Connection) -> anyhow::Result<Vec<PublicKey>> {
	let mut statement = conn.prepare("SELECT public_key FROM bark_vtxo_key ORDER BY idx")?;
	let mut rows = statement.query([])?;
	let mut ret = Vec::new();
	while let Some(row) = rows.next()? {
		let pk: String = row.get(0)?;
		ret.push(PublicKey::from_str(&pk).context("invalid stored public key")?);
	}
	Ok(ret)
}

pub fn get_all_vtxos(conn: &Connection) -> anyhow::Result<Vec<WalletVtxo>> {
	let mut statement = conn.prepare("SELECT raw_vtxo, state_kind FROM vtxo_view ORDER BY seq")?;
	let mut rows = statement.query([])?;
	let mut ret = Vec::new();
	while let Some(row) = rows.next()? {
		ret.push(row_to_wallet_vtxo(row)?);
	}
	Ok(ret)
}

pub fn get_wallet_vtxo(conn: &Connection, id: VtxoId) -> anyhow::Result<Option<WalletVtxo>> {
	let query = "SELECT raw_vtxo, state_kind FROM vtxo_view WHERE id = :id";
	let mut statement = conn.prepare(query)?;
	let mut rows = statement.query(named_params! { ":id": id.to_string() })?;
	match rows.next()? {
		Some(row) => Ok(Some(row_to_wallet_vtxo(row)?)),
		None => Ok(None),
	}
}

pub fn get_vtxo_state(conn: &Connection, id: VtxoId) -> anyhow::Result<Option<VtxoState>> {
	let query = "SELECT state_kind FROM vtxo_view WHERE id = :id";
	let state = conn.query_row(query, named_params! { ":id": id.to_string() }, |r| {
		r.get::<_, String>(0)
	}).optional()?;
	state.map(|s| VtxoState::from_str(&s)).transpose()
}

pub fn has_seen_vtxo(conn: &Connection, id: VtxoId) -> anyhow::Result<bool> {
	let query = "SELECT EXISTS(SELECT 1 FROM bark_vtxo_state WHERE vtxo_id = :id)";
	let seen = conn.query_row(query, named_params! { ":id": id.to_string() }, |r| {
		r.get::<_, bool>(0)
	})?;
	Ok(seen)
}

fn insert_vtxo_state(conn: &Connection, id: VtxoId, state: VtxoState) -> anyhow::Result<()> {
	let query = "INSERT INTO bark_vtxo_state (vtxo_id, state_kind) VALUES (:vtxo_id, :state_kind)";
	conn.execute(query, named_params! {
		":vtxo_id": id.to_string(),
		":state_kind": state,
	})?;
	Ok(())
}

/// Store a new vtxo in the given state.
///
/// Fails with [Error::DuplicateOutpoint] if the vtxo is already present.
pub fn store_vtxo(conn: &Connection, vtxo: &Vtxo, state: VtxoState) -> anyhow::Result<()> {
	let query = "
		INSERT INTO bark_vtxo (id, expiry_height, amount_sat, raw_vtxo)
		VALUES (:id, :expiry_height, :amount_sat, :raw_vtxo)
		ON CONFLICT DO NOTHING";
	let inserted = conn.execute(query, named_params! {
		":id": vtxo.id().to_string(),
		":expiry_height": vtxo.expiry_height,
		":amount_sat": vtxo.amount().to_sat(),
		":raw_vtxo": raw_vtxo(vtxo)?,
	})?;
	if inserted == 0 {
		return Err(Error::DuplicateOutpoint(vtxo.point).into());
	}
	insert_vtxo_state(conn, vtxo.id(), state)
}

/// Update the state of a vtxo only if it is currently in one of the allowed states.
pub fn update_vtxo_state_checked(conn: &Connection, update: &VtxoStateUpdate) -> anyhow::Result<()> {
	match get_vtxo_state(conn, update.vtxo_id)? {
		None => {
			Err(Error::conflict(format!("vtxo {} not found", update.vtxo_id)).into())
		},
		Some(state) if !update.allowed_old.contains(&state) => {
			Err(Error::conflict(format!(
				"vtxo {} is {}, expected one of {:?}", update.vtxo_id, state, update.allowed_old,
			)).into())
		},
		Some(_) => insert_vtxo_state(conn, update.vtxo_id, update.new_state),
	}
}

/// Remove a vtxo, its state history is kept.
pub fn remove_vtxo(conn: &Connection, id: VtxoId) -> anyhow::Result<()> {
	let deleted = conn.execute("DELETE FROM bark_vtxo WHERE id = :id", named_params! {
		":id": id.to_string(),
	})?;
	if deleted == 0 {
		return Err(Error::conflict(format!("vtxo {} not found", id)).into());
	}
	Ok(())
}

pub fn get_exit_utxos(conn: &Connection) -> anyhow::Result<Vec<ExitUtxo>> {
	let mut statement = conn.prepare("SELECT * FROM bark_exit_utxo ORDER BY rowid")?;
	let mut rows = statement.query([])?;
	let mut ret = Vec::new();
	while let Some(row) = rows.next()? {
		ret.push(row_to_exit_utxo(row)?);
	}
	Ok(ret)
}

/// Fails with [Error::DuplicateOutpoint] if the outpoint is already present.
pub fn store_exit_utxo(conn: &Connection, utxo: &ExitUtxo) -> anyhow::Result<()> {
	let query = "
		INSERT INTO bark_exit_utxo (outpoint, raw_vtxo, confirmation_height)
		VALUES (:outpoint, :raw_vtxo, :confirmation_height)
		ON CONFLICT DO NOTHING";
	let inserted = conn.execute(query, named_params! {
		":outpoint": utxo.outpoint().to_string(),
		":raw_vtxo": raw_vtxo(&utxo.vtxo)?,
		":confirmation_height": utxo.height,
	})?;
	if inserted == 0 {
		return Err(Error::DuplicateOutpoint(utxo.outpoint()).into());
	}
	Ok(())
}

/// Fails with [Error::Conflict] if the outpoint is not present.
pub fn remove_exit_utxo(conn: &Connection, outpoint: bitcoin::OutPoint) -> anyhow::Result<()> {
	let deleted = conn.execute("DELETE FROM bark_exit_utxo WHERE outpoint = :outpoint", named_params! {
		":outpoint": outpoint.to_string(),
	})?;
	if deleted == 0 {
		return Err(Error::conflict(format!("exit output {} not found", outpoint)).into());
	}
	Ok(())
}

pub fn create_movement(conn: &Connection, movement: &NewMovement) -> anyhow::Result<MovementId> {
	let query = "
		INSERT INTO bark_movement (kind, amount_sent_sat, amount_received_sat, fees_sat)
		VALUES (:kind, :amount_sent_sat, :amount_received_sat, :fees_sat)
		RETURNING id";
	let mut statement = conn.prepare(query)?;
	let id = statement.query_row(named_params! {
		":kind": movement.kind.to_u8(),
		":amount_sent_sat": movement.amount_sent.to_sat(),
		":amount_received_sat": movement.amount_received.to_sat(),
		":fees_sat": movement.fees.to_sat(),
	}, |row| row.get::<_, u32>(0))?;
	Ok(MovementId(id))
}

pub fn get_movements(conn: &Connection) -> anyhow::Result<Vec<Movement>> {
	let mut statement = conn.prepare("SELECT * FROM bark_movement ORDER BY id")?;
	let mut rows = statement.query([])?;
	let mut ret = Vec::new();
	while let Some(row) = rows.next()? {
		ret.push(row_to_movement(row)?);
	}
	Ok(ret)
}

pub fn store_exit(conn: &Connection, exit: &StoredExit) -> anyhow::Result<()> {
	let query = "
		INSERT INTO bark_exit (vtxo_id, raw_vtxo, state)
		VALUES (:vtxo_id, :raw_vtxo, :state)
		ON CONFLICT (vtxo_id) DO UPDATE SET
			state = excluded.state,
			updated_at = strftime('%Y-%m-%d %H:%M:%f', 'now')";
	conn.execute(query, named_params! {
		":vtxo_id": exit.id().to_string(),
		":raw_vtxo": raw_vtxo(&exit.vtxo)?,
		":state": serde_json::to_string(&exit.state)?,
	})?;
	Ok(())
}

pub fn get_exits(conn: &Connection) -> anyhow::Result<Vec<StoredExit>> {
	let mut statement = conn.prepare("SELECT * FROM bark_exit ORDER BY rowid")?;
	let mut rows = statement.query([])?;
	let mut ret = Vec::new();
	while let Some(row) = rows.next()? {
		ret.push(row_to_exit(row)?);
	}
	Ok(ret)
}

/// Store a new onchain tx, or update the confirmation height of a known one.
pub fn store_onchain_tx(conn: &Connection, tx: &StoredOnchainTx) -> anyhow::Result<()> {
	let query = "
		INSERT INTO bark_onchain_tx (txid, amount_sat, created_at, tx_type, confirmation_height)
		VALUES (:txid, :amount_sat, :created_at, :tx_type, :confirmation_height)
		ON CONFLICT (txid) DO UPDATE SET confirmation_height = excluded.confirmation_height";
	conn.execute(query, named_params! {
		":txid": tx.txid.to_string(),
		":amount_sat": tx.amount.to_sat(),
		":created_at": tx.created_at,
		":tx_type": tx.tx_type.as_str(),
		":confirmation_height": tx.confirmation_height,
	})?;
	Ok(())
}

pub fn get_onchain_transactions(conn: &Connection) -> anyhow::Result<Vec<StoredOnchainTx>> {
	let query = "SELECT * FROM bark_onchain_tx ORDER BY created_at DESC, rowid DESC";
	let mut statement = conn.prepare(query)?;
	let mut rows = statement.query([])?;
	let mut ret = Vec::new();
	while let Some(row) = rows.next()? {
		ret.push(row_to_onchain_tx(row)?);
	}
	Ok(ret)
}

pub fn store_lightning_receive(conn: &Connection, receive: &LightningReceive) -> anyhow::Result<()> {
	let query = "
		INSERT INTO bark_lightning_receive (payment_hash, preimage, invoice, amount_sat, claimed)
		VALUES (:payment_hash, :preimage, :invoice, :amount_sat, :claimed)";
	conn.execute(query, named_params! {
		":payment_hash": receive.payment_hash.to_string(),
		":preimage": receive.preimage.to_string(),
		":invoice": receive.invoice.to_string(),
		":amount_sat": receive.amount.to_sat(),
		":claimed": receive.claimed,
	})?;
	Ok(())
}

pub fn get_lightning_receive(
	conn: &Connection,
	payment_hash: PaymentHash,
) -> anyhow::Result<Option<LightningReceive>> {
	let query = "SELECT * FROM bark_lightning_receive WHERE payment_hash = :payment_hash";
	let mut statement = conn.prepare(query)?;
	let mut rows = statement.query(named_params! { ":payment_hash": payment_hash.to_string() })?;
	match rows.next()? {
		Some(row) => Ok(Some(row_to_lightning_receive(row)?)),
		None => Ok(None),
	}
}

/// Mark a receive as claimed, fails with [Error::Conflict] if it already was.
pub fn claim_lightning_receive(conn: &Connection, payment_hash: PaymentHash) -> anyhow::Result<()> {
	let query = "
		UPDATE bark_lightning_receive SET claimed = 1
		WHERE payment_hash = :payment_hash AND claimed = 0";
	let updated = conn.execute(query, named_params! {
		":payment_hash": payment_hash.to_string(),
	})?;
	if updated == 0 {
		return Err(Error::conflict(format!(
			"lightning receive {} is unknown or already claimed", payment_hash,
		)).into());
	}
	Ok(())
}

pub fn store_lightning_send(conn: &Connection, send: &LightningSend) -> anyhow::Result<()> {
	let query = "
		INSERT INTO bark_lightning_send (payment_hash, invoice, amount_sat, inputs, status, preimage)
		VALUES (:payment_hash, :invoice, :amount_sat, :inputs, :status, :preimage)
		ON CONFLICT (payment_hash) DO UPDATE SET
			status = excluded.status,
			preimage = excluded.preimage";
	conn.execute(query, named_params! {
		":payment_hash": send.payment_hash.to_string(),
		":invoice": send.invoice.to_string(),
		":amount_sat": send.amount.to_sat(),
		":inputs": serde_json::to_string(&send.inputs)?,
		":status": send.status.as_str(),
		":preimage": send.preimage.map(|p| p.to_string()),
	})?;
	Ok(())
}

pub fn remove_lightning_send(conn: &Connection, payment_hash: PaymentHash) -> anyhow::Result<()> {
	conn.execute("DELETE FROM bark_lightning_send WHERE payment_hash = :payment_hash", named_params! {
		":payment_hash": payment_hash.to_string(),
	})?;
	Ok(())
}

pub fn get_lightning_send(
	conn: &Connection,
	payment_hash: PaymentHash,
) -> anyhow::Result<Option<LightningSend>> {
	let query = "SELECT * FROM bark_lightning_send WHERE payment_hash = :payment_hash";
	let mut statement = conn.prepare(query)?;
	let mut rows = statement.query(named_params! { ":payment_hash": payment_hash.to_string() })?;
	match rows.next()? {
		Some(row) => Ok(Some(row_to_lightning_send(row)?)),
		None => Ok(None),
	}
}

pub fn get_pending_lightning_sends(conn: &Connection) -> anyhow::Result<Vec<LightningSend>> {
	let query = "SELECT * FROM bark_lightning_send WHERE status = 'pending' ORDER BY rowid";
	let mut statement = conn.prepare(query)?;
	let mut rows = statement.query([])?;
	let mut ret = Vec::new();
	while let Some(row) = rows.next()? {
		ret.push(row_to_lightning_send(row)?);
	}
	Ok(ret)
}

pub fn store_sync_height(conn: &Connection, height: BlockHeight) -> anyhow::Result<()> {
	conn.execute("INSERT INTO bark_ark_sync (sync_height) VALUES (:sync_height)", named_params! {
		":sync_height": height,
	})?;
	Ok(())
}

pub fn get_sync_height(conn: &Connection) -> anyhow::Result<Option<BlockHeight>> {
	let query = "SELECT sync_height FROM bark_ark_sync ORDER BY id DESC LIMIT 1";
	Ok(conn.query_row(query, [], |r| r.get::<_, BlockHeight>(0)).optional()?)
}
