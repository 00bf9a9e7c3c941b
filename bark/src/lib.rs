
pub extern crate ark;
pub extern crate bark_json as json;
pub extern crate bip39;
pub extern crate bitcoin;
pub extern crate lightning_invoice;

#[macro_use] extern crate anyhow;
#[macro_use] extern crate log;
#[macro_use] extern crate serde;

mod arkoor;
mod board;
mod config;
mod error;
mod exit;
mod lightning;
pub mod logging;
pub mod movement;
pub mod onchain;
pub mod persist;
mod round;
pub mod server;
pub mod vtxo_selection;
pub mod vtxo_state;

pub use self::config::Config;
pub use self::error::Error;
pub use self::persist::sqlite::SqliteClient;
pub use self::vtxo_state::{VtxoState, WalletVtxo};
pub use bark_json::primitives::{UtxoInfo, VtxoInfo};
pub use bark_json::cli::{Board, ExitStatus, Offboard, OnchainBalance, WalletBalance};


use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use anyhow::Context;
use bip39::Mnemonic;
use bitcoin::{Address, Amount, FeeRate, Network, OutPoint, TxOut, Txid};
use bitcoin::bip32::{self, ChildNumber, Fingerprint};
use bitcoin::secp256k1::{Keypair, PublicKey};

use ark::{ArkInfo, Vtxo, VtxoId};
use ark::util::SECP;
use bark_json::cli::{Movement, MovementKind, OnchainTransaction, OnchainTxType};
use bitcoin_ext::{BlockHeight, TxStatus};

use crate::movement::NewMovement;
use crate::onchain::{ChainSource, EsploraChainSource, ExitUtxo, OnchainWallet, Utxo};
use crate::persist::{BarkPersister, StagedChanges, StoredOnchainTx, WalletSnapshot};
use crate::persist::sqlite::unix_now;
use crate::server::{ArkServer, HttpArkClient};
use crate::vtxo_selection::{select_vtxos, FilterVtxos, RefreshStrategy, VtxoSelection};

/// The hardened child of the master key VTXO keys are derived from.
const VTXO_SEED_INDEX: u32 = 350;

/// Boards whose funding tx didn't show up on chain after this long are dropped.
const BOARD_BROADCAST_GRACE: Duration = Duration::from_secs(60 * 60);

/// Read-only properties of the Bark wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletProperties {
	/// The Bitcoin network to run Bark on.
	///
	/// Default value: signet.
	pub network: Network,

	/// The wallet fingerpint
	///
	/// Used on wallet loading to check mnemonic correctness
	pub fingerprint: Fingerprint,
}

/// Struct representing an extended private key derived from a
/// wallet's seed, used to derived child VTXO keypairs
///
/// The VTXO seed is derived by applying a hardened derivation
/// step at index 350 from the wallet's seed.
pub struct VtxoSeed(bip32::Xpriv);

impl VtxoSeed {
	fn new(network: Network, seed: &[u8; 64]) -> anyhow::Result<Self> {
		let master = bip32::Xpriv::new_master(network, seed)?;
		let path = [ChildNumber::from_hardened_idx(VTXO_SEED_INDEX)?];
		Ok(Self(master.derive_priv(&SECP, &path)?))
	}

	fn fingerprint(&self) -> Fingerprint {
		self.0.fingerprint(&SECP)
	}

	fn derive_keypair(&self, keypair_idx: u32) -> anyhow::Result<Keypair> {
		let path = [ChildNumber::from_normal_idx(keypair_idx)?];
		Ok(self.0.derive_priv(&SECP, &path)?.to_keypair(&SECP))
	}
}

/// Create a new wallet with a fresh SQLite database at `path`.
///
/// The chain is accessed through the Esplora server from the config, so
/// [Config::esplora_address] must be set.
pub fn create_wallet(
	path: impl AsRef<Path>,
	mnemonic: &str,
	config: Config,
) -> Result<Wallet, Error> {
	let mnemonic = Mnemonic::from_str(mnemonic).map_err(|_| Error::InvalidMnemonic)?;
	let esplora = config.esplora_address.as_ref()
		.ok_or_else(|| Error::BarkFailed("an esplora address is required".into()))?;
	let chain = EsploraChainSource::new(esplora)?;
	let server = HttpArkClient::new(&config.asp_address)?;

	let db = SqliteClient::create(path)?;
	Wallet::create_with(&mnemonic, config, Arc::new(db), Arc::new(server), Arc::new(chain))
}

/// Open an existing wallet, using the config stored at creation.
pub fn open_wallet(path: impl AsRef<Path>, mnemonic: &str) -> Result<Wallet, Error> {
	let mnemonic = Mnemonic::from_str(mnemonic).map_err(|_| Error::InvalidMnemonic)?;
	let db = SqliteClient::open(path)?;
	let config = db.read_config()?.context("wallet is not initialised")?;
	let esplora = config.esplora_address.as_ref()
		.ok_or_else(|| Error::BarkFailed("an esplora address is required".into()))?;
	let chain = EsploraChainSource::new(esplora)?;
	let server = HttpArkClient::new(&config.asp_address)?;

	Wallet::open_with(&mnemonic, Arc::new(db), Arc::new(server), Arc::new(chain))
}

/// Balances of a set of VTXOs.
///
/// Expired VTXOs that are not exiting yet count as pending exit, they can't
/// be spent cooperatively anymore. VTXOs locked for anything but a
/// lightning payment are not counted, they are inputs of a round or an
/// arkoor transfer that will give change or new VTXOs.
fn compute_balance(snapshot: &WalletSnapshot, tip: BlockHeight) -> WalletBalance {
	let lightning_inputs = snapshot.pending_lightning_sends.iter()
		.flat_map(|s| s.inputs.iter().copied())
		.collect::<HashSet<VtxoId>>();

	let mut balance = WalletBalance::default();
	for vtxo in &snapshot.vtxos {
		let amount = vtxo.amount();
		match vtxo.state {
			VtxoState::Spendable if vtxo.is_expired(tip) => balance.pending_exit += amount,
			VtxoState::Spendable => balance.spendable += amount,
			VtxoState::Exiting => balance.pending_exit += amount,
			VtxoState::PendingBoard => balance.pending_board += amount,
			VtxoState::Locked if lightning_inputs.contains(&vtxo.id()) => {
				balance.pending_lightning_send += amount;
			},
			VtxoState::Locked => {},
		}
	}
	balance
}

/// Marks VTXOs as locked by a request that is still running.
///
/// Locked VTXOs that are not in flight belong to a request whose outcome we
/// never learned, [Wallet::sync_locked_vtxos] asks the server about them.
struct InFlight<'a> {
	wallet: &'a Wallet,
	ids: Vec<VtxoId>,
}

impl Drop for InFlight<'_> {
	fn drop(&mut self) {
		if let Ok(mut in_flight) = self.wallet.in_flight.lock() {
			for id in &self.ids {
				in_flight.remove(id);
			}
		}
	}
}

pub struct Wallet {
	config: Config,
	properties: WalletProperties,
	db: Arc<dyn BarkPersister>,
	vtxo_seed: VtxoSeed,
	/// Never held across an await.
	onchain: Mutex<OnchainWallet>,
	server: Arc<dyn ArkServer>,
	chain: Arc<dyn ChainSource>,
	ark_info: RwLock<Option<ArkInfo>>,
	/// Held while reading the inputs of a change and while committing it.
	writer: Mutex<()>,
	/// Held from coin selection until a tx spending on-chain funds is
	/// broadcast or abandoned.
	onchain_spend: tokio::sync::Mutex<()>,
	in_flight: Mutex<HashSet<VtxoId>>,
	/// Queues calls to sync and maintenance.
	maintenance_lock: tokio::sync::Mutex<()>,
}

impl Wallet {
	/// Create new wallet in the given, empty, database.
	pub fn create_with(
		mnemonic: &Mnemonic,
		config: Config,
		db: Arc<dyn BarkPersister>,
		server: Arc<dyn ArkServer>,
		chain: Arc<dyn ChainSource>,
	) -> Result<Wallet, Error> {
		trace!("Config: {:?}", config);
		if db.read_properties()?.is_some() {
			return Err(Error::BarkFailed("cannot overwrite already existing wallet".into()));
		}

		let vtxo_seed = VtxoSeed::new(config.network, &mnemonic.to_seed(""))?;
		let properties = WalletProperties {
			network: config.network,
			fingerprint: vtxo_seed.fingerprint(),
		};

		db.init_wallet(&config, &properties).context("cannot init wallet in the database")?;
		info!("Created wallet {} on {}", properties.fingerprint, properties.network);

		Wallet::open_with(mnemonic, db, server, chain)
	}

	/// Open existing wallet.
	pub fn open_with(
		mnemonic: &Mnemonic,
		db: Arc<dyn BarkPersister>,
		server: Arc<dyn ArkServer>,
		chain: Arc<dyn ChainSource>,
	) -> Result<Wallet, Error> {
		let config = db.read_config()?.context("wallet is not initialised")?;
		let properties = db.read_properties()?.context("wallet is not initialised")?;
		trace!("Config: {:?}", config);

		let seed = mnemonic.to_seed("");
		let vtxo_seed = VtxoSeed::new(properties.network, &seed)?;
		if properties.fingerprint != vtxo_seed.fingerprint() {
			return Err(Error::InvalidMnemonic);
		}
		let onchain = OnchainWallet::load_or_create(properties.network, &seed, db.clone())
			.context("failed to load on-chain wallet")?;

		let ark_info = db.read_ark_info()?;
		Ok(Wallet {
			config,
			properties,
			db,
			vtxo_seed,
			onchain: Mutex::new(onchain),
			server,
			chain,
			ark_info: RwLock::new(ark_info),
			writer: Mutex::new(()),
			onchain_spend: tokio::sync::Mutex::new(()),
			in_flight: Mutex::new(HashSet::new()),
			maintenance_lock: tokio::sync::Mutex::new(()),
		})
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	pub fn properties(&self) -> &WalletProperties {
		&self.properties
	}

	pub fn network(&self) -> Network {
		self.properties.network
	}

	/// Run `f` while holding the writer lock.
	///
	/// Use this to read the inputs of a change and commit it without
	/// anything else changing in between.
	fn with_writer<T>(
		&self,
		f: impl FnOnce(&dyn BarkPersister) -> anyhow::Result<T>,
	) -> anyhow::Result<T> {
		let _guard = self.writer.lock().map_err(|_| anyhow!("wallet writer lock poisoned"))?;
		f(&*self.db)
	}

	fn commit(&self, changes: &StagedChanges) -> anyhow::Result<Vec<movement::MovementId>> {
		self.with_writer(|db| db.commit(changes))
	}

	fn onchain(&self) -> anyhow::Result<MutexGuard<'_, OnchainWallet>> {
		self.onchain.lock().map_err(|_| anyhow!("on-chain wallet lock poisoned"))
	}

	/// Mark the VTXOs as in flight until the returned guard is dropped.
	fn mark_in_flight(&self, ids: Vec<VtxoId>) -> anyhow::Result<InFlight<'_>> {
		let mut in_flight = self.in_flight.lock().map_err(|_| anyhow!("in flight lock poisoned"))?;
		in_flight.extend(ids.iter().copied());
		Ok(InFlight { wallet: self, ids })
	}

	/// Derive and store the keypair directly after currently last revealed one
	pub fn derive_store_next_keypair(&self) -> anyhow::Result<Keypair> {
		self.with_writer(|db| {
			let index = db.get_last_vtxo_key_index()?.map(|i| i + 1).unwrap_or(0);
			let keypair = self.vtxo_seed.derive_keypair(index)?;
			db.store_vtxo_key(index, keypair.public_key())?;
			Ok(keypair)
		})
	}

	/// The keypair of one of our VTXO keys.
	fn keypair_for(&self, public_key: PublicKey) -> anyhow::Result<Keypair> {
		let index = self.db.get_vtxo_key_index(&public_key)?
			.with_context(|| format!("no vtxo key for public key {}", public_key))?;
		self.vtxo_seed.derive_keypair(index)
	}

	/// The keys to sign for swept exit outputs.
	fn exit_keys(&self, exits: &[ExitUtxo]) -> anyhow::Result<HashMap<OutPoint, Keypair>> {
		exits.iter().map(|e| Ok((e.outpoint(), self.keypair_for(e.vtxo.user_pubkey)?))).collect()
	}

	/// The keys owning the given VTXOs, in order.
	fn vtxo_keys<'a>(&self, vtxos: impl IntoIterator<Item = &'a Vtxo>) -> anyhow::Result<Vec<Keypair>> {
		vtxos.into_iter().map(|v| self.keypair_for(v.user_pubkey)).collect()
	}

	async fn fee_rate(&self) -> FeeRate {
		match self.chain.regular_feerate().await {
			Ok(fee_rate) => fee_rate,
			Err(e) => {
				warn!("Failed to get fee rate from chain source, using fallback: {:#}", e);
				self.config.fallback_fee_rate
			},
		}
	}

	/// Whether the chain knows the tx, errors count as not known.
	async fn tx_is_known(&self, txid: Txid) -> bool {
		match self.chain.tx_status(txid).await {
			Ok(status) => status.is_known(),
			Err(e) => {
				warn!("Failed to fetch status of tx {}: {:#}", txid, e);
				false
			},
		}
	}

	/// The chain tip, or the last synced height if the chain can't be reached.
	async fn tip_or_last_synced(&self) -> anyhow::Result<BlockHeight> {
		match self.chain.tip().await {
			Ok(tip) => Ok(tip),
			Err(e) => {
				warn!("Failed to fetch chain tip, using last synced height: {:#}", e);
				Ok(self.db.get_sync_height()?.unwrap_or(0))
			},
		}
	}

	fn cached_ark_info(&self) -> anyhow::Result<Option<ArkInfo>> {
		let cache = self.ark_info.read().map_err(|_| anyhow!("ark info lock poisoned"))?;
		Ok(cache.clone())
	}

	/// Fetch the [ArkInfo] from the server and cache it.
	async fn refresh_ark_info(&self) -> anyhow::Result<ArkInfo> {
		let info = self.server.ark_info().await.context("ark info request failed")?;
		if info.network != self.properties.network {
			return Err(Error::protocol(format!(
				"ark server is on network {} while we are on {}", info.network, self.properties.network,
			)).into());
		}

		if self.cached_ark_info()?.as_ref() != Some(&info) {
			debug!("Storing new ark info: {:?}", info);
			self.with_writer(|db| db.write_ark_info(&info))?;
			let mut cache = self.ark_info.write().map_err(|_| anyhow!("ark info lock poisoned"))?;
			*cache = Some(info.clone());
		}
		Ok(info)
	}

	/// The cached [ArkInfo], fetched from the server the first time.
	async fn require_ark_info(&self) -> anyhow::Result<ArkInfo> {
		match self.cached_ark_info()? {
			Some(info) => Ok(info),
			None => self.refresh_ark_info().await,
		}
	}

	/// Information about the Ark server.
	///
	/// Falls back to the last known info if the server can't be reached.
	pub async fn ark_info(&self) -> Result<ArkInfo, Error> {
		match self.refresh_ark_info().await {
			Ok(info) => Ok(info),
			Err(e) => match self.cached_ark_info()? {
				Some(info) => {
					warn!("Failed to fetch ark info, using cached info: {:#}", e);
					Ok(info)
				},
				None => Err(e.into()),
			},
		}
	}

	/// Retrieve the off-chain balance of the wallet.
	///
	/// Make sure you sync before calling this method.
	pub async fn wallet_balance(&self) -> Result<WalletBalance, Error> {
		let tip = self.tip_or_last_synced().await?;
		let snapshot = self.db.read_snapshot()?;
		Ok(compute_balance(&snapshot, tip))
	}

	/// The on-chain balance, including swept exits.
	///
	/// Make sure you sync before calling this method.
	pub fn onchain_balance(&self) -> Result<OnchainBalance, Error> {
		let exits = self.db.get_exit_utxos()?.iter().map(|e| e.amount()).sum::<Amount>();
		let balance = self.onchain()?.balance();
		Ok(OnchainBalance {
			total: balance.total() + exits,
			trusted_spendable: balance.trusted_spendable() + exits,
		})
	}

	/// All on-chain outputs owned by the wallet.
	pub fn utxos(&self) -> Result<Vec<Utxo>, Error> {
		let mut ret = self.onchain()?.utxos().into_iter().map(Utxo::Local).collect::<Vec<_>>();
		ret.extend(self.db.get_exit_utxos()?.into_iter().map(Utxo::Exit));
		Ok(ret)
	}

	/// On-chain transactions of the wallet, most recent first.
	///
	/// Confirmations are counted against the height of the last sync.
	pub fn onchain_transactions(&self) -> Result<Vec<OnchainTransaction>, Error> {
		let tip = self.db.get_sync_height()?;
		Ok(self.db.get_onchain_transactions()?.iter()
			.map(|tx| tx.to_onchain_transaction(tip))
			.collect())
	}

	/// Returns all vtxos held by the wallet, in the order they were received.
	pub fn vtxos(&self) -> Result<Vec<WalletVtxo>, Error> {
		Ok(self.db.get_all_vtxos()?)
	}

	/// Returns all vtxos matching the provided predicate
	pub fn vtxos_with(&self, filter: impl FilterVtxos) -> Result<Vec<WalletVtxo>, Error> {
		Ok(filter.filter(self.vtxos()?))
	}

	pub fn get_vtxo_by_id(&self, vtxo_id: VtxoId) -> Result<WalletVtxo, Error> {
		let vtxo = self.db.get_wallet_vtxo(vtxo_id)
			.with_context(|| format!("Error when querying vtxo {} in database", vtxo_id))?
			.with_context(|| format!("The VTXO with id {} cannot be found", vtxo_id))?;
		Ok(vtxo)
	}

	pub fn movements(&self) -> Result<Vec<Movement>, Error> {
		Ok(self.db.get_movements()?)
	}

	/// A new Ark address to receive arkoor payments on.
	pub async fn new_address(&self) -> Result<ark::Address, Error> {
		let ark_info = self.require_ark_info().await?;
		let keypair = self.derive_store_next_keypair()?;
		let testnet = self.properties.network != Network::Bitcoin;
		Ok(ark::Address::new(testnet, ark_info.asp_pubkey, keypair.public_key()))
	}

	/// A new on-chain address to receive funds on.
	pub fn onchain_address(&self) -> Result<Address, Error> {
		Ok(self.onchain()?.address()?)
	}

	/// Check a VTXO the server created for us.
	fn verify_vtxo(
		&self,
		vtxo: &Vtxo,
		ark_info: &ArkInfo,
		user_pubkey: PublicKey,
		amount: Amount,
	) -> Result<(), Error> {
		if vtxo.user_pubkey != user_pubkey {
			return Err(Error::protocol(format!("vtxo {} has wrong user pubkey", vtxo.id())));
		}
		if vtxo.amount() != amount {
			return Err(Error::protocol(format!(
				"vtxo {} has amount {}, expected {}", vtxo.id(), vtxo.amount(), amount,
			)));
		}
		if vtxo.asp_pubkey != ark_info.asp_pubkey {
			return Err(Error::protocol(format!("vtxo {} has wrong server pubkey", vtxo.id())));
		}
		vtxo.validate().map_err(|e| Error::protocol(format!("invalid vtxo {}: {}", vtxo.id(), e)))
	}

	/// Select spendable VTXOs to cover `amount` and lock them.
	///
	/// The extra changes staged by `stage` are committed together with the
	/// lock. Both happen under the writer lock. The inputs stay in flight
	/// while the returned guard lives.
	fn select_and_lock(
		&self,
		amount: Amount,
		tip: BlockHeight,
		stage: impl FnOnce(&dyn BarkPersister, &VtxoSelection, &mut StagedChanges) -> anyhow::Result<()>,
	) -> Result<(VtxoSelection, InFlight<'_>), Error> {
		let (selection, in_flight) = self.with_writer(|db| {
			let candidates = db.get_all_vtxos()?.into_iter()
				.filter(|v| v.state == VtxoState::Spendable && !v.is_expired(tip))
				.collect::<Vec<_>>();
			let selection = select_vtxos(candidates, amount, self.config.dust_threshold)?;

			let mut changes = StagedChanges::new();
			changes.update_state(selection.input_ids(), VtxoState::Locked, &[VtxoState::Spendable]);
			stage(db, &selection, &mut changes)?;
			db.commit(&changes)?;
			let in_flight = self.mark_in_flight(selection.input_ids())?;
			Ok((selection, in_flight))
		})?;
		debug!("Locked {} vtxos for {}", selection.inputs.len(), amount);
		Ok((selection, in_flight))
	}

	/// Lock the given spendable VTXOs, they stay in flight while the
	/// returned guard lives.
	fn lock_vtxos(&self, ids: Vec<VtxoId>) -> anyhow::Result<InFlight<'_>> {
		self.with_writer(|db| {
			let mut changes = StagedChanges::new();
			changes.update_state(ids.clone(), VtxoState::Locked, &[VtxoState::Spendable]);
			db.commit(&changes)?;
			self.mark_in_flight(ids)
		})
	}

	/// Make locked VTXOs spendable again after an operation failed.
	fn unlock_vtxos(&self, ids: Vec<VtxoId>) {
		let mut changes = StagedChanges::new();
		changes.update_state(ids, VtxoState::Spendable, &[VtxoState::Locked]);
		if let Err(e) = self.commit(&changes) {
			error!("Failed to unlock vtxos: {:#}", e);
		}
	}

	/// Sync the on-chain outputs, pending boards, the Ark mailbox and
	/// pending lightning payments.
	///
	/// The Ark server being unreachable is not an error.
	pub async fn sync(&self) -> Result<(), Error> {
		let _guard = self.maintenance_lock.lock().await;
		Ok(self.sync_inner().await?)
	}

	async fn sync_inner(&self) -> anyhow::Result<()> {
		let tip = self.chain.tip().await.context("failed to fetch chain tip")?;
		if self.db.get_sync_height()? != Some(tip) {
			self.with_writer(|db| db.store_sync_height(tip))?;
		}

		if let Err(e) = self.refresh_ark_info().await {
			warn!("Failed to fetch ark info: {:#}", e);
		}

		self.sync_onchain().await.context("failed to sync on-chain wallet")?;
		self.sync_pending_boards().await.context("failed to sync pending boards")?;
		if let Err(e) = self.sync_mailbox().await {
			warn!("Failed to sync ark mailbox: {:#}", e);
		}
		if let Err(e) = self.sync_locked_vtxos().await {
			warn!("Failed to sync locked vtxos: {:#}", e);
		}
		self.sync_pending_lightning_sends().await
			.context("failed to sync pending lightning payments")?;
		Ok(())
	}

	/// Scan the chain for transactions of the on-chain wallet and update
	/// the on-chain tx records.
	async fn sync_onchain(&self) -> anyhow::Result<()> {
		let request = self.onchain()?.start_full_scan();
		let update = self.chain.full_scan(request).await?;
		let received = {
			let mut onchain = self.onchain()?;
			onchain.apply_scan(update)?;
			onchain.received_txs()
		};

		let mut tx_heights = HashMap::new();
		for tx in self.db.get_onchain_transactions()? {
			if tx.confirmation_height.is_none() {
				if let TxStatus::Confirmed(h) = self.chain.tx_status(tx.txid).await? {
					tx_heights.insert(tx.txid, h);
				}
			}
		}

		self.with_writer(|db| {
			let known_txs = db.get_onchain_transactions()?.into_iter()
				.map(|tx| (tx.txid, tx))
				.collect::<HashMap<_, _>>();

			let mut changes = StagedChanges::new();
			for tx in received {
				match known_txs.get(&tx.txid) {
					Some(known) if known.confirmation_height.is_none() => {
						if let Some(height) = tx.confirmation_height.or(tx_heights.get(&tx.txid).copied()) {
							changes.store_onchain_tx(StoredOnchainTx {
								confirmation_height: Some(height),
								..known.clone()
							});
						}
					},
					Some(_) => {},
					None => {
						info!("Received {} on-chain in tx {}", tx.amount, tx.txid);
						changes.store_onchain_tx(StoredOnchainTx {
							txid: tx.txid,
							amount: tx.amount,
							created_at: unix_now(),
							tx_type: OnchainTxType::Receive,
							confirmation_height: tx.confirmation_height,
						});
					},
				}
			}

			for (txid, height) in tx_heights {
				if let Some(tx) = known_txs.get(&txid) {
					changes.store_onchain_tx(StoredOnchainTx {
						confirmation_height: Some(height),
						..tx.clone()
					});
				}
			}

			if !changes.is_empty() {
				db.commit(&changes)?;
			}
			Ok(())
		})
	}

	/// Finish registration of boards whose funding tx reached the chain and
	/// drop the ones whose funding tx never did.
	async fn sync_pending_boards(&self) -> anyhow::Result<()> {
		let boards = self.db.get_all_vtxos()?.into_iter()
			.filter(|v| v.state == VtxoState::PendingBoard)
			.collect::<Vec<_>>();
		if boards.is_empty() {
			return Ok(());
		}
		let board_txs = self.db.get_onchain_transactions()?.into_iter()
			.map(|tx| (tx.txid, tx.created_at))
			.collect::<HashMap<_, _>>();

		for board in boards {
			let funding_txid = match board.chain_anchor() {
				Some(anchor) => anchor.txid,
				None => continue,
			};

			if self.chain.tx_status(funding_txid).await?.is_known() {
				match self.server.register_board(board.id()).await {
					Ok(()) => {
						let mut changes = StagedChanges::new();
						changes.update_state(
							[board.id()], VtxoState::Spendable, &[VtxoState::PendingBoard],
						);
						self.commit(&changes)?;
						info!("Registered board {}", board.id());
					},
					Err(e) => warn!("Failed to register board {}: {}", board.id(), e),
				}
				continue;
			}

			let created_at = board_txs.get(&funding_txid).copied().unwrap_or(0);
			if unix_now().saturating_sub(created_at) < BOARD_BROADCAST_GRACE.as_secs() {
				debug!("Funding tx {} of board {} not seen yet", funding_txid, board.id());
				continue;
			}

			warn!("Funding tx {} of board {} never reached the chain, dropping board",
				funding_txid, board.id(),
			);
			let mut changes = StagedChanges::new();
			// fails if the board got registered in the meantime
			changes.update_state([board.id()], VtxoState::PendingBoard, &[VtxoState::PendingBoard]);
			changes.remove_vtxos([board.id()]);
			changes.add_movement(NewMovement::new(MovementKind::Board).sent(board.amount()));
			self.commit(&changes)?;
			// its inputs are ours to spend again
			self.onchain()?.evict_tx(funding_txid)?;
		}
		Ok(())
	}

	/// Register arkoor VTXOs the server holds for us.
	async fn sync_mailbox(&self) -> anyhow::Result<()> {
		let pubkeys = self.db.get_vtxo_pubkeys()?;
		if pubkeys.is_empty() {
			return Ok(());
		}
		let ark_info = self.require_ark_info().await?;
		let vtxos = self.server.fetch_mailbox(pubkeys).await?;
		trace!("Received {} vtxos from mailbox", vtxos.len());

		let mut valid = Vec::new();
		for vtxo in vtxos {
			let res = self.db.get_vtxo_key_index(&vtxo.user_pubkey)?
				.context("vtxo is not for one of our keys")
				.and_then(|_| Ok(self.verify_vtxo(&vtxo, &ark_info, vtxo.user_pubkey, vtxo.amount())?));
			match res {
				Ok(()) => valid.push(vtxo),
				Err(e) => warn!("Ignoring invalid vtxo {} from mailbox: {:#}", vtxo.id(), e),
			}
		}

		self.with_writer(|db| {
			let mut seen = HashSet::new();
			let mut changes = StagedChanges::new();
			for vtxo in valid {
				if !seen.insert(vtxo.id()) || db.has_seen_vtxo(vtxo.id())? {
					continue;
				}
				info!("Received arkoor vtxo {} of {}", vtxo.id(), vtxo.amount());
				changes.add_movement(
					NewMovement::new(MovementKind::ArkoorReceive).received(vtxo.amount()),
				);
				changes.add_vtxo(vtxo, VtxoState::Spendable);
			}
			if !changes.is_empty() {
				db.commit(&changes)?;
			}
			Ok(())
		})
	}

	/// Settle VTXOs that stayed locked after a request whose response we
	/// never received.
	///
	/// The ones the server spent are gone, the others are spendable again.
	/// VTXOs of running requests and of pending lightning payments are left
	/// alone.
	async fn sync_locked_vtxos(&self) -> anyhow::Result<()> {
		let locked = self.with_writer(|db| {
			let lightning_inputs = db.get_pending_lightning_sends()?.into_iter()
				.flat_map(|s| s.inputs)
				.collect::<HashSet<_>>();
			let in_flight = self.in_flight.lock()
				.map_err(|_| anyhow!("in flight lock poisoned"))?
				.clone();
			Ok(db.get_all_vtxos()?.into_iter()
				.filter(|v| v.state == VtxoState::Locked)
				.filter(|v| !lightning_inputs.contains(&v.id()) && !in_flight.contains(&v.id()))
				.collect::<Vec<_>>())
		})?;
		if locked.is_empty() {
			return Ok(());
		}

		let spent = self.server.spent_vtxos(locked.iter().map(|v| v.id()).collect()).await?
			.into_iter().collect::<HashSet<_>>();
		let (spent, unspent) = locked.into_iter()
			.partition::<Vec<_>, _>(|v| spent.contains(&v.id()));

		let mut changes = StagedChanges::new();
		if !unspent.is_empty() {
			info!("Unlocking {} vtxos the server didn't spend", unspent.len());
			changes.update_state(unspent.iter().map(|v| v.id()), VtxoState::Spendable, &[VtxoState::Locked]);
		}
		if !spent.is_empty() {
			let total = spent.iter().map(|v| v.amount()).sum::<Amount>();
			warn!("The server spent {} of our vtxos worth {} in a request we never got the result of",
				spent.len(), total,
			);
			// fails if anything else touched them in the meantime
			changes.update_state(spent.iter().map(|v| v.id()), VtxoState::Locked, &[VtxoState::Locked]);
			changes.remove_vtxos(spent.iter().map(|v| v.id()));
			changes.add_movement(NewMovement::new(MovementKind::Forfeit).sent(total));
		}
		self.commit(&changes)?;
		Ok(())
	}

	/// Sync and then take care of the VTXOs: refresh the ones about to
	/// expire, start exits for the ones that expired and drive the running
	/// exits.
	pub async fn maintenance(&self) -> Result<(), Error> {
		let _guard = self.maintenance_lock.lock().await;
		self.sync_inner().await?;

		let tip = self.chain.tip().await.context("failed to fetch chain tip")?;
		let strategy = RefreshStrategy::must_refresh(tip, self.config.vtxo_refresh_threshold);
		let must_refresh = self.vtxos_with(strategy)?.iter().map(|v| v.id()).collect::<Vec<_>>();
		if !must_refresh.is_empty() {
			info!("Refreshing {} vtxos that are about to expire", must_refresh.len());
			if let Err(e) = self.refresh_vtxos(must_refresh).await {
				warn!("Failed to refresh vtxos: {}", e);
			}
		}

		self.start_exits(|v| v.state == VtxoState::Spendable && v.is_expired(tip))?;
		self.progress_exits().await?;
		Ok(())
	}

	/// Send on-chain funds to the given address.
	///
	/// Swept exit outputs are always spent, they are the only inputs BDK
	/// coin selection doesn't know about.
	pub async fn send_onchain(&self, address: &str, amount: Amount) -> Result<Txid, Error> {
		let address = Address::from_str(address)
			.map_err(|e| Error::InvalidBitcoinAddress(e.to_string()))?
			.require_network(self.properties.network)
			.map_err(|e| Error::InvalidBitcoinAddress(e.to_string()))?;
		let output = TxOut { value: amount, script_pubkey: address.script_pubkey() };
		if amount < output.script_pubkey.minimal_non_dust() || amount < self.config.dust_threshold {
			return Err(Error::BarkFailed(format!("amount {} is below dust", amount)));
		}

		let fee_rate = self.fee_rate().await;
		let _spend = self.onchain_spend.lock().await;
		let exits = self.db.get_exit_utxos()?;
		let exit_keys = self.exit_keys(&exits)?;
		let (tx, fee) = {
			let mut onchain = self.onchain()?;
			let psbt = onchain.prepare_tx(&[output], fee_rate, &exits)?;
			let fee = psbt.fee().context("invalid psbt")?;
			(onchain.sign_tx(psbt, &exits, &exit_keys)?, fee)
		};
		let txid = tx.compute_txid();

		if let Err(e) = self.chain.broadcast_tx(&tx).await {
			if !self.tx_is_known(txid).await {
				self.onchain()?.cancel_tx(&tx)?;
				return Err(e.context("failed to broadcast tx").into());
			}
			warn!("Broadcast of tx {} failed but the chain knows it: {:#}", txid, e);
		}
		info!("Sent {} to {} in tx {}", amount, address, txid);
		self.onchain()?.apply_broadcast_tx(tx)?;

		let mut changes = StagedChanges::new();
		for exit in &exits {
			changes.remove_exit_utxo(exit.outpoint());
		}
		changes.store_onchain_tx(StoredOnchainTx {
			txid,
			amount: amount + fee,
			created_at: unix_now(),
			tx_type: OnchainTxType::Send,
			confirmation_height: None,
		});
		self.commit(&changes)?;
		Ok(txid)
	}
}
