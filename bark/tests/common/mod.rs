//! An in-memory Ark server and chain to drive wallets in tests.

#![allow(unused)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use bdk_wallet::KeychainKind;
use bdk_wallet::chain::{BlockId, CheckPoint, ConfirmationBlockTime, TxUpdate};
use bdk_wallet::chain::spk_client::{FullScanRequest, FullScanResponse};
use bitcoin::{
	absolute, transaction, Amount, BlockHash, FeeRate, Network, OutPoint, Script, ScriptBuf,
	Transaction, TxIn, TxOut, Txid,
};
use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::{PublicKey, SecretKey};
use lightning_invoice::{Bolt11Invoice, Currency, InvoiceBuilder};
use tempfile::TempDir;

use ark::{ArkInfo, Vtxo, VtxoId, VtxoRequest};
use ark::lightning::{PaymentHash, Preimage};
use ark::test::dummy::DummyServer;
use ark::util::SECP;
use bark::{Config, SqliteClient, Wallet};
use bark::bip39::Mnemonic;
use bark::onchain::ChainSource;
use bark::server::{
	ArkServer, ArkoorRequest, BoardCosignRequest, InputRequest, LightningClaimRequest,
	LightningPayRequest, LightningPayStatus, LightningReceiveRequest, RoundParticipation,
	RoundResult, ServerError, Signed,
};
use bitcoin_ext::{AmountExt, BlockHeight, TxStatus};

pub const MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
pub const OTHER_MNEMONIC: &str = "legal winner thank year wave sausage worth useful legal winner thank yellow";

/// Used to borrow a valid payment secret from.
const TEMPLATE_INVOICE: &str = "lnbcrt11p59rr6msp534kz2tahyrxl0rndcjrt8qpqvd0dynxxwfd28ea74rxjuj0tphfspp5nc0gf6vamuphaf4j49qzjvz2rg3del5907vdhncn686cj5yykvfsdqqcqzzs9qyysgqgalnpu3selnlgw8n66qmdpuqdjpqak900ru52v572742wk4mags8a8nec2unls57r5j95kkxxp4lr6wy9048uzgsvdhrz7dh498va2cq4t6qh8";

/// Build a signed regtest invoice for the given payment hash.
pub fn invoice(payment_hash: PaymentHash, amount: Option<Amount>) -> Bolt11Invoice {
	let template = Bolt11Invoice::from_str(TEMPLATE_INVOICE).unwrap();
	let key = SecretKey::from_slice(&[0x42; 32]).unwrap();
	let mut builder = InvoiceBuilder::new(Currency::Regtest)
		.description(String::new())
		.payment_hash(payment_hash.as_hash())
		.payment_secret(*template.payment_secret())
		.current_timestamp()
		.min_final_cltv_expiry_delta(144);
	if let Some(amount) = amount {
		builder = builder.amount_milli_satoshis(amount.to_msat());
	}
	builder.build_signed(|m| SECP.sign_ecdsa_recoverable(m, &key)).unwrap()
}

/// Gap of unused addresses after which a scan stops.
const SCAN_STOP_GAP: u32 = 20;

/// Block hashes of the mock chain, only the genesis block is real.
fn block_id(height: BlockHeight) -> BlockId {
	let hash = if height == 0 {
		bitcoin::constants::genesis_block(Network::Regtest).block_hash()
	} else {
		BlockHash::from_byte_array(sha256::Hash::hash(&height.to_le_bytes()).to_byte_array())
	};
	BlockId { height, hash }
}

#[derive(Default)]
struct ChainState {
	tip: BlockHeight,
	/// Each tx with its confirmation height, [None] while in the mempool.
	txs: HashMap<Txid, (Transaction, Option<BlockHeight>)>,
	fail_broadcast: bool,
	nonce: u32,
}

/// A chain where every broadcast tx enters the mempool and every mined
/// block confirms the whole mempool.
pub struct MockChain {
	state: Mutex<ChainState>,
}

impl MockChain {
	pub fn new(tip: BlockHeight) -> MockChain {
		MockChain {
			state: Mutex::new(ChainState { tip, ..Default::default() }),
		}
	}

	pub fn height(&self) -> BlockHeight {
		self.state.lock().unwrap().tip
	}

	pub fn mine(&self, blocks: BlockHeight) {
		let mut state = self.state.lock().unwrap();
		let height = state.tip + 1;
		for (_, h) in state.txs.values_mut() {
			if h.is_none() {
				*h = Some(height);
			}
		}
		state.tip += blocks;
	}

	pub fn set_fail_broadcast(&self, fail: bool) {
		self.state.lock().unwrap().fail_broadcast = fail;
	}

	/// Forget a tx, as if it got evicted from the mempool.
	pub fn evict(&self, txid: Txid) {
		self.state.lock().unwrap().txs.remove(&txid);
	}

	fn accept(state: &mut ChainState, tx: &Transaction, height: Option<BlockHeight>) -> Txid {
		let txid = tx.compute_txid();
		state.txs.insert(txid, (tx.clone(), height));
		txid
	}

	/// Create a confirmed output paying `amount` to `script_pubkey`.
	pub fn fund(&self, script_pubkey: &Script, amount: Amount) -> OutPoint {
		let mut state = self.state.lock().unwrap();
		state.nonce += 1;
		let coinbase = sha256::Hash::hash(&state.nonce.to_le_bytes());
		let tx = Transaction {
			version: transaction::Version::TWO,
			lock_time: absolute::LockTime::ZERO,
			input: vec![TxIn {
				previous_output: OutPoint::new(Txid::from_byte_array(coinbase.to_byte_array()), 0),
				..Default::default()
			}],
			output: vec![TxOut { value: amount, script_pubkey: script_pubkey.to_owned() }],
		};
		let height = Some(state.tip);
		OutPoint::new(MockChain::accept(&mut state, &tx, height), 0)
	}

	/// Put a tx in the mempool without any checks.
	pub fn add_mempool_tx(&self, tx: &Transaction) -> Txid {
		MockChain::accept(&mut self.state.lock().unwrap(), tx, None)
	}

	pub fn tx(&self, txid: Txid) -> Option<Transaction> {
		self.state.lock().unwrap().txs.get(&txid).map(|(tx, _)| tx.clone())
	}

	pub fn status(&self, txid: Txid) -> TxStatus {
		match self.state.lock().unwrap().txs.get(&txid) {
			Some((_, Some(h))) => TxStatus::Confirmed(*h),
			Some((_, None)) => TxStatus::Mempool,
			None => TxStatus::NotFound,
		}
	}
}

#[async_trait]
impl ChainSource for MockChain {
	async fn tip(&self) -> anyhow::Result<BlockHeight> {
		Ok(self.height())
	}

	async fn tx_status(&self, txid: Txid) -> anyhow::Result<TxStatus> {
		Ok(self.status(txid))
	}

	async fn broadcast_tx(&self, tx: &Transaction) -> anyhow::Result<()> {
		let mut state = self.state.lock().unwrap();
		if state.fail_broadcast {
			bail!("broadcast refused");
		}
		if !state.txs.contains_key(&tx.compute_txid()) {
			MockChain::accept(&mut state, tx, None);
		}
		Ok(())
	}

	async fn full_scan(
		&self,
		mut request: FullScanRequest<KeychainKind>,
	) -> anyhow::Result<FullScanResponse<KeychainKind>> {
		let state = self.state.lock().unwrap();
		let pays_to = |spk: &Script| state.txs.values()
			.any(|(tx, _)| tx.output.iter().any(|o| o.script_pubkey.as_script() == spk));

		let mut spks = HashSet::<ScriptBuf>::new();
		let mut last_active_indices = BTreeMap::new();
		for keychain in request.keychains() {
			let mut gap = 0;
			for (index, spk) in request.iter_spks(keychain) {
				if pays_to(spk.as_script()) {
					last_active_indices.insert(keychain, index);
					gap = 0;
				} else {
					gap += 1;
				}
				spks.insert(spk);
				if gap >= SCAN_STOP_GAP {
					break;
				}
			}
		}

		let ours = state.txs.iter().flat_map(|(txid, (tx, _))| {
			tx.output.iter().enumerate()
				.filter(|(_, o)| spks.contains(&o.script_pubkey))
				.map(|(vout, _)| OutPoint::new(*txid, vout as u32))
		}).collect::<HashSet<_>>();

		let mut tx_update = TxUpdate::default();
		for (txid, (tx, height)) in &state.txs {
			let relevant = tx.output.iter().any(|o| spks.contains(&o.script_pubkey))
				|| tx.input.iter().any(|i| ours.contains(&i.previous_output));
			if !relevant {
				continue;
			}
			tx_update.txs.push(Arc::new(tx.clone()));
			match height {
				Some(h) => {
					let anchor = ConfirmationBlockTime {
						block_id: block_id(*h),
						confirmation_time: *h as u64,
					};
					tx_update.anchors.insert((anchor, *txid));
				},
				None => {
					tx_update.seen_ats.insert((*txid, request.start_time()));
				},
			}
		}

		let chain_update = CheckPoint::from_block_ids((0..=state.tip).map(block_id)).ok();
		Ok(FullScanResponse { tx_update, last_active_indices, chain_update })
	}

	async fn regular_feerate(&self) -> anyhow::Result<FeeRate> {
		Ok(FeeRate::from_sat_per_vb_unchecked(2))
	}
}

/// How the mock server handles lightning payments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayBehavior {
	Succeed,
	Fail,
	Pending,
}

struct ServerState {
	online: bool,
	/// Refuse spending requests without looking at them.
	reject_requests: bool,
	/// Process spending requests but lose the response.
	drop_responses: bool,
	refuse_registration: bool,
	pay_behavior: PayBehavior,
	spent: HashSet<VtxoId>,
	mailbox: Vec<Vtxo>,
	receives: HashMap<PaymentHash, (Amount, bool)>,
	/// Preimages of invoices of lightning nodes outside the Ark.
	external_preimages: HashMap<PaymentHash, Preimage>,
	pending_payments: HashMap<PaymentHash, LightningPayRequest>,
	nonce: u32,
}

/// An Ark server that cosigns everything that doesn't create value.
pub struct MockServer {
	pub asp: DummyServer,
	chain: Arc<MockChain>,
	state: Mutex<ServerState>,
}

impl MockServer {
	pub fn new(chain: Arc<MockChain>) -> MockServer {
		MockServer {
			asp: DummyServer::new(),
			chain,
			state: Mutex::new(ServerState {
				online: true,
				reject_requests: false,
				drop_responses: false,
				refuse_registration: false,
				pay_behavior: PayBehavior::Succeed,
				spent: HashSet::new(),
				mailbox: Vec::new(),
				receives: HashMap::new(),
				external_preimages: HashMap::new(),
				pending_payments: HashMap::new(),
				nonce: 0,
			}),
		}
	}

	pub fn set_online(&self, online: bool) {
		self.state.lock().unwrap().online = online;
	}

	pub fn set_reject_requests(&self, reject: bool) {
		self.state.lock().unwrap().reject_requests = reject;
	}

	pub fn set_drop_responses(&self, drop: bool) {
		self.state.lock().unwrap().drop_responses = drop;
	}

	pub fn set_refuse_registration(&self, refuse: bool) {
		self.state.lock().unwrap().refuse_registration = refuse;
	}

	pub fn is_spent(&self, id: VtxoId) -> bool {
		self.state.lock().unwrap().spent.contains(&id)
	}

	pub fn set_pay_behavior(&self, behavior: PayBehavior) {
		self.state.lock().unwrap().pay_behavior = behavior;
	}

	/// An invoice of some lightning node outside the Ark.
	pub fn external_invoice(&self, amount: Option<Amount>) -> Bolt11Invoice {
		let preimage = Preimage::random();
		let payment_hash = preimage.compute_payment_hash();
		self.state.lock().unwrap().external_preimages.insert(payment_hash, preimage);
		invoice(payment_hash, amount)
	}

	pub fn mailbox_len(&self) -> usize {
		self.state.lock().unwrap().mailbox.len()
	}

	fn check_online(&self) -> Result<(), ServerError> {
		if self.state.lock().unwrap().online {
			Ok(())
		} else {
			Err(ServerError::Unreachable("connection refused".into()))
		}
	}

	/// Gate for requests that spend VTXOs.
	fn check_accepting(&self) -> Result<(), ServerError> {
		self.check_online()?;
		if self.state.lock().unwrap().reject_requests {
			return Err(ServerError::Rejected("not accepting requests".into()));
		}
		Ok(())
	}

	/// Lose a successful response if so configured.
	fn respond<T>(&self, res: Result<T, ServerError>) -> Result<T, ServerError> {
		match res {
			Ok(_) if self.state.lock().unwrap().drop_responses => {
				Err(ServerError::Unreachable("connection reset by peer".into()))
			},
			res => res,
		}
	}

	fn anchor(&self) -> OutPoint {
		let mut state = self.state.lock().unwrap();
		state.nonce += 1;
		let tx = Transaction {
			version: transaction::Version::TWO,
			lock_time: absolute::LockTime::from_consensus(state.nonce),
			input: vec![],
			output: vec![],
		};
		OutPoint::new(tx.compute_txid(), 0)
	}

	fn issue(&self, req: &VtxoRequest, anchor: OutPoint, is_arkoor: bool) -> Vtxo {
		let expiry = self.chain.height() + 1_000;
		self.asp.issue(req.pubkey, req.amount, expiry, anchor, is_arkoor)
	}

	/// Check the signatures and mark the inputs spent.
	///
	/// Fails if the inputs don't cover `out_amount`.
	fn spend_inputs<T: InputRequest>(
		&self,
		req: &Signed<T>,
		out_amount: Amount,
	) -> Result<(), ServerError> {
		req.verify().map_err(|e| ServerError::Rejected(e.to_string()))?;
		let inputs = req.request.inputs();
		let tip = self.chain.height();
		let mut state = self.state.lock().unwrap();
		for input in inputs {
			if state.spent.contains(&input.id()) {
				return Err(ServerError::Rejected(format!("input {} already spent", input.id())));
			}
			if input.is_expired(tip) {
				return Err(ServerError::Rejected(format!("input {} expired", input.id())));
			}
		}
		let in_amount = inputs.iter().map(|v| v.amount()).sum::<Amount>();
		if out_amount > in_amount {
			return Err(ServerError::Rejected(format!(
				"outputs {} exceed inputs {}", out_amount, in_amount,
			)));
		}
		state.spent.extend(inputs.iter().map(|v| v.id()));
		Ok(())
	}

	fn finish_payment(&self, req: &LightningPayRequest, preimage: Preimage) -> LightningPayStatus {
		let change = req.change.as_ref().map(|c| self.issue(c, self.anchor(), true));
		LightningPayStatus::Succeeded { preimage, change }
	}
}

#[async_trait]
impl ArkServer for MockServer {
	async fn ark_info(&self) -> Result<ArkInfo, ServerError> {
		self.check_online()?;
		Ok(ArkInfo {
			network: Network::Regtest,
			asp_pubkey: self.asp.pubkey(),
			round_interval: Duration::from_secs(10),
			nb_round_nonces: 8,
			vtxo_exit_delta: self.asp.exit_delta,
			vtxo_expiry_delta: 1_000,
			max_vtxo_amount: None,
			offboard_feerate: FeeRate::from_sat_per_vb_unchecked(1),
		})
	}

	async fn board_cosign(&self, req: BoardCosignRequest) -> Result<Vtxo, ServerError> {
		self.check_online()?;
		match req.funding_tx.output.get(req.utxo.vout as usize) {
			Some(out) if out.value == req.amount => {},
			_ => return Err(ServerError::Rejected("funding tx doesn't pay the board".into())),
		}
		let vtxo_req = VtxoRequest { pubkey: req.user_pubkey, amount: req.amount };
		Ok(self.issue(&vtxo_req, req.utxo, false))
	}

	async fn register_board(&self, _vtxo_id: VtxoId) -> Result<(), ServerError> {
		self.check_online()?;
		if self.state.lock().unwrap().refuse_registration {
			return Err(ServerError::Unreachable("board registration timed out".into()));
		}
		Ok(())
	}

	async fn participate_round(&self, req: Signed<RoundParticipation>) -> Result<RoundResult, ServerError> {
		self.check_accepting()?;
		let out_amount = req.request.vtxo_requests.iter().map(|r| r.amount)
			.chain(req.request.offboard_requests.iter().map(|o| o.amount))
			.sum::<Amount>();
		self.spend_inputs(&req, out_amount)?;

		let mut output = req.request.offboard_requests.iter()
			.map(|o| o.to_txout())
			.collect::<Vec<_>>();
		let vtxo_vout = output.len() as u32;
		output.push(TxOut { value: Amount::ZERO, script_pubkey: Default::default() });
		let round_tx = Transaction {
			version: transaction::Version::TWO,
			lock_time: absolute::LockTime::ZERO,
			input: vec![TxIn { previous_output: self.anchor(), ..Default::default() }],
			output,
		};
		let round_txid = self.chain.add_mempool_tx(&round_tx);

		let vtxos = req.request.vtxo_requests.iter().enumerate()
			.map(|(i, r)| self.issue(r, OutPoint::new(round_txid, vtxo_vout + i as u32), false))
			.collect();
		self.respond(Ok(RoundResult { round_txid, vtxos }))
	}

	async fn arkoor_cosign(&self, req: Signed<ArkoorRequest>) -> Result<Vec<Vtxo>, ServerError> {
		self.check_accepting()?;
		let out_amount = req.request.outputs.iter().map(|r| r.amount).sum::<Amount>();
		self.spend_inputs(&req, out_amount)?;
		self.respond(Ok(req.request.outputs.iter().map(|r| self.issue(r, self.anchor(), true)).collect()))
	}

	async fn post_mailbox(&self, vtxos: Vec<Vtxo>) -> Result<(), ServerError> {
		self.check_online()?;
		self.state.lock().unwrap().mailbox.extend(vtxos);
		Ok(())
	}

	async fn fetch_mailbox(&self, pubkeys: Vec<PublicKey>) -> Result<Vec<Vtxo>, ServerError> {
		self.check_online()?;
		Ok(self.state.lock().unwrap().mailbox.iter()
			.filter(|v| pubkeys.contains(&v.user_pubkey))
			.cloned()
			.collect())
	}

	async fn start_lightning_receive(&self, req: LightningReceiveRequest) -> Result<Bolt11Invoice, ServerError> {
		self.check_online()?;
		self.state.lock().unwrap().receives.insert(req.payment_hash, (req.amount, false));
		Ok(invoice(req.payment_hash, Some(req.amount)))
	}

	async fn claim_lightning_receive(&self, req: LightningClaimRequest) -> Result<Vtxo, ServerError> {
		self.check_online()?;
		if req.preimage.compute_payment_hash() != req.payment_hash {
			return Err(ServerError::Rejected("wrong preimage".into()));
		}
		let amount = {
			let mut state = self.state.lock().unwrap();
			let (amount, claimed) = state.receives.get_mut(&req.payment_hash)
				.ok_or_else(|| ServerError::Rejected("unknown payment".into()))?;
			if *claimed {
				return Err(ServerError::Rejected("already claimed".into()));
			}
			*claimed = true;
			*amount
		};
		let vtxo_req = VtxoRequest { pubkey: req.user_pubkey, amount };
		Ok(self.issue(&vtxo_req, self.anchor(), true))
	}

	async fn pay_bolt11(&self, req: Signed<LightningPayRequest>) -> Result<LightningPayStatus, ServerError> {
		self.check_accepting()?;
		let out_amount = req.request.amount + req.request.change.as_ref()
			.map(|c| c.amount).unwrap_or(Amount::ZERO);
		let payment_hash = PaymentHash::from(&req.request.invoice);

		let behavior = self.state.lock().unwrap().pay_behavior;
		match behavior {
			PayBehavior::Fail => Ok(LightningPayStatus::Failed { reason: "no route".into() }),
			PayBehavior::Pending => {
				self.spend_inputs(&req, out_amount)?;
				self.state.lock().unwrap().pending_payments.insert(payment_hash, req.request);
				Ok(LightningPayStatus::Pending)
			},
			PayBehavior::Succeed => {
				self.spend_inputs(&req, out_amount)?;
				let preimage = self.state.lock().unwrap().external_preimages.get(&payment_hash).copied()
					.ok_or_else(|| ServerError::Rejected("unknown invoice".into()))?;
				Ok(self.finish_payment(&req.request, preimage))
			},
		}
	}

	async fn check_bolt11_payment(&self, payment_hash: PaymentHash) -> Result<LightningPayStatus, ServerError> {
		self.check_online()?;
		let (behavior, req, preimage) = {
			let state = self.state.lock().unwrap();
			let req = state.pending_payments.get(&payment_hash).cloned()
				.ok_or_else(|| ServerError::Rejected("unknown payment".into()))?;
			let preimage = state.external_preimages.get(&payment_hash).copied();
			(state.pay_behavior, req, preimage)
		};
		match (behavior, preimage) {
			(PayBehavior::Pending, _) => Ok(LightningPayStatus::Pending),
			(PayBehavior::Succeed, Some(preimage)) => {
				self.state.lock().unwrap().pending_payments.remove(&payment_hash);
				Ok(self.finish_payment(&req, preimage))
			},
			(PayBehavior::Succeed, None) | (PayBehavior::Fail, _) => {
				let mut state = self.state.lock().unwrap();
				state.pending_payments.remove(&payment_hash);
				for input in &req.inputs {
					state.spent.remove(&input.id());
				}
				Ok(LightningPayStatus::Failed { reason: "no route".into() })
			},
		}
	}

	async fn spent_vtxos(&self, vtxo_ids: Vec<VtxoId>) -> Result<Vec<VtxoId>, ServerError> {
		self.check_online()?;
		let state = self.state.lock().unwrap();
		Ok(vtxo_ids.into_iter().filter(|id| state.spent.contains(id)).collect())
	}
}

/// A wallet backed by a fresh database in a temporary directory.
pub struct TestWallet {
	pub wallet: Wallet,
	pub server: Arc<MockServer>,
	pub chain: Arc<MockChain>,
	pub dir: TempDir,
}

impl std::ops::Deref for TestWallet {
	type Target = Wallet;
	fn deref(&self) -> &Wallet {
		&self.wallet
	}
}

pub fn new_wallet_with(mnemonic: &str, server: Arc<MockServer>, chain: Arc<MockChain>) -> TestWallet {
	new_wallet_with_config(mnemonic, Config::for_network(Network::Regtest), server, chain)
}

pub fn new_wallet_with_config(
	mnemonic: &str,
	config: Config,
	server: Arc<MockServer>,
	chain: Arc<MockChain>,
) -> TestWallet {
	// only the first call installs the logger
	let _ = bark::logging::init_logging(log::LevelFilter::Debug);
	let dir = tempfile::tempdir().unwrap();
	let db = SqliteClient::create(dir.path().join("db.sqlite")).unwrap();
	let mnemonic = Mnemonic::from_str(mnemonic).unwrap();
	let wallet = Wallet::create_with(
		&mnemonic,
		config,
		Arc::new(db),
		server.clone(),
		chain.clone(),
	).unwrap();
	TestWallet { wallet, server, chain, dir }
}

pub fn new_wallet() -> TestWallet {
	let chain = Arc::new(MockChain::new(100));
	let server = Arc::new(MockServer::new(chain.clone()));
	new_wallet_with(MNEMONIC, server, chain)
}

/// Fund the on-chain wallet and sync it.
pub async fn fund_onchain(w: &TestWallet, amount: Amount) {
	let address = w.onchain_address().unwrap();
	w.chain.fund(&address.script_pubkey(), amount);
	w.sync().await.unwrap();
}

/// A wallet holding a single spendable board VTXO of `amount`.
pub async fn boarded_wallet(amount: Amount) -> TestWallet {
	let w = new_wallet();
	fund_onchain(&w, amount + Amount::from_sat(100_000)).await;
	w.board_amount(amount).await.unwrap();
	w
}
