use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use bdk_wallet::{Balance, KeychainKind, LocalOutput, SignOptions, TxOrdering};
use bdk_wallet::Wallet as BdkWallet;
use bdk_wallet::chain::spk_client::{FullScanRequest, FullScanResponse};
use bdk_wallet::coin_selection::InsufficientFunds;
use bdk_wallet::error::CreateTxError;
use bitcoin::{bip32, Address, Amount, FeeRate, Network, OutPoint, Psbt, ScriptBuf, Transaction, TxOut, Txid};
use bitcoin::secp256k1::Keypair;

use bitcoin_ext::BlockHeight;

use crate::Error;
use crate::onchain::{sign_exit_inputs, ExitUtxo, LocalUtxo};
use crate::persist::BarkPersister;
use crate::persist::sqlite::unix_now;

impl From<LocalOutput> for LocalUtxo {
	fn from(value: LocalOutput) -> Self {
		LocalUtxo {
			outpoint: value.outpoint,
			txout: value.txout,
			confirmation_height: value.chain_position.confirmation_height_upper_bound(),
		}
	}
}

fn map_create_tx_error(e: CreateTxError) -> Error {
	match e {
		CreateTxError::CoinSelection(InsufficientFunds { needed, available }) => {
			Error::InsufficientFunds { needed, available }
		},
		e => Error::BarkFailed(format!("failed to create tx: {}", e)),
	}
}

/// A transaction of the BDK wallet that only pays to us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedTx {
	pub txid: Txid,
	pub amount: Amount,
	pub confirmation_height: Option<BlockHeight>,
}

/// The BDK wallet holding the on-chain funds, with every change persisted
/// through the [BarkPersister].
///
/// Callers keep this behind a lock that is never held across an await.
pub struct OnchainWallet {
	inner: BdkWallet,
	db: Arc<dyn BarkPersister>,
}

impl OnchainWallet {
	pub fn load_or_create(network: Network, seed: &[u8; 64], db: Arc<dyn BarkPersister>) -> anyhow::Result<Self> {
		let xpriv = bip32::Xpriv::new_master(network, seed).context("invalid seed")?;
		let desc = bdk_wallet::template::Bip86(xpriv, KeychainKind::External);

		let changeset = db.initialize_bdk_wallet().context("error reading bdk wallet state")?;
		let wallet_opt = BdkWallet::load()
			.descriptor(KeychainKind::External, Some(desc.clone()))
			.extract_keys()
			.check_network(network)
			.load_wallet_no_persist(changeset)?;

		let wallet = match wallet_opt {
			Some(wallet) => wallet,
			None => BdkWallet::create_single(desc)
				.network(network)
				.create_wallet_no_persist()?,
		};

		let mut ret = OnchainWallet { inner: wallet, db };
		ret.persist()?;
		Ok(ret)
	}

	fn persist(&mut self) -> anyhow::Result<()> {
		if let Some(stage) = self.inner.staged() {
			self.db.store_bdk_wallet_changeset(&*stage)?;
			let _ = self.inner.take_staged();
		}
		Ok(())
	}

	pub fn balance(&self) -> Balance {
		self.inner.balance()
	}

	pub fn utxos(&self) -> Vec<LocalUtxo> {
		self.inner.list_unspent().map(LocalUtxo::from).collect()
	}

	/// Reveal a new address to receive funds on.
	pub fn address(&mut self) -> anyhow::Result<Address> {
		let ret = self.inner.reveal_next_address(KeychainKind::External).address;
		self.persist()?;
		Ok(ret)
	}

	pub fn start_full_scan(&self) -> FullScanRequest<KeychainKind> {
		self.inner.start_full_scan().build()
	}

	pub fn apply_scan(&mut self, update: FullScanResponse<KeychainKind>) -> anyhow::Result<()> {
		self.inner.apply_update(update).context("failed to apply chain update")?;
		self.persist()?;
		debug!("On-chain wallet synced, {}", self.inner.balance());
		Ok(())
	}

	/// Transactions of the wallet that only pay to us.
	pub fn received_txs(&self) -> Vec<ReceivedTx> {
		self.inner.transactions().filter_map(|tx| {
			let (sent, received) = self.inner.sent_and_received(&tx.tx_node.tx);
			if sent != Amount::ZERO || received == Amount::ZERO {
				return None;
			}
			Some(ReceivedTx {
				txid: tx.tx_node.txid,
				amount: received,
				confirmation_height: tx.chain_position.confirmation_height_upper_bound(),
			})
		}).collect()
	}

	/// Fund a tx paying `outputs`, in order, followed by our change.
	///
	/// All `exits` are spent in the tx, other inputs are picked by BDK's
	/// coin selection.
	pub fn prepare_tx(
		&mut self,
		outputs: &[TxOut],
		fee_rate: FeeRate,
		exits: &[ExitUtxo],
	) -> Result<Psbt, Error> {
		let mut b = self.inner.build_tx();
		b.ordering(TxOrdering::Untouched);
		for output in outputs {
			b.add_recipient(output.script_pubkey.clone(), output.value);
		}
		if !exits.is_empty() {
			b.version(2);
		}
		for exit in exits {
			b.add_foreign_utxo_with_sequence(
				exit.outpoint(), exit.psbt_input(), exit.satisfaction_weight(), exit.sequence(),
			).with_context(|| format!("failed to add exit {} as input", exit.outpoint()))?;
		}
		b.fee_rate(fee_rate);
		b.finish().map_err(map_create_tx_error)
	}

	/// Spend all funds of the wallet to a single output paying to `spk`.
	pub fn prepare_drain_tx(&mut self, spk: ScriptBuf, fee_rate: FeeRate) -> Result<Psbt, Error> {
		let balance = self.inner.balance().total();
		if balance == Amount::ZERO {
			return Err(Error::InsufficientFunds { needed: Amount::ONE_SAT, available: balance });
		}
		let mut b = self.inner.build_tx();
		b.drain_to(spk);
		b.drain_wallet();
		b.fee_rate(fee_rate);
		b.finish().map_err(map_create_tx_error)
	}

	/// Sign the exit inputs with `exit_keys` and the rest with the wallet.
	pub fn sign_tx(
		&self,
		mut psbt: Psbt,
		exits: &[ExitUtxo],
		exit_keys: &HashMap<OutPoint, Keypair>,
	) -> anyhow::Result<Transaction> {
		sign_exit_inputs(&mut psbt, exits, exit_keys)?;
		let opts = SignOptions {
			trust_witness_utxo: true,
			..Default::default()
		};
		let finalized = self.inner.sign(&mut psbt, opts).context("signing error")?;
		if !finalized {
			bail!("failed to finalize all inputs of tx {}", psbt.unsigned_tx.compute_txid());
		}
		Ok(psbt.extract_tx()?)
	}

	/// Track a tx we broadcast until the chain confirms it.
	pub fn apply_broadcast_tx(&mut self, tx: Transaction) -> anyhow::Result<()> {
		self.inner.apply_unconfirmed_txs([(tx, unix_now())]);
		self.persist()
	}

	/// Release the change address of a tx that was never broadcast.
	pub fn cancel_tx(&mut self, tx: &Transaction) -> anyhow::Result<()> {
		self.inner.cancel_tx(tx);
		self.persist()
	}

	/// Forget a tx that left the mempool without confirming.
	pub fn evict_tx(&mut self, txid: Txid) -> anyhow::Result<()> {
		self.inner.apply_evicted_txs([(txid, unix_now())]);
		self.persist()
	}
}

#[cfg(test)]
mod test {
	use super::*;

	use bitcoin::{absolute, transaction, Sequence, TxIn, Witness};
	use bitcoin::hashes::Hash;

	use ark::test::dummy::dummy_user_keypair;
	use ark::util::SECP;

	use crate::persist::sqlite::SqliteClient;

	fn wallet(dir: &tempfile::TempDir) -> OnchainWallet {
		let db = SqliteClient::create(dir.path().join("db.sqlite"))
			.or_else(|_| SqliteClient::open(dir.path().join("db.sqlite")))
			.unwrap();
		OnchainWallet::load_or_create(Network::Regtest, &[7u8; 64], Arc::new(db)).unwrap()
	}

	fn fund(wallet: &mut OnchainWallet, sat: u64) -> Transaction {
		let address = wallet.address().unwrap();
		let tx = Transaction {
			version: transaction::Version::TWO,
			lock_time: absolute::LockTime::ZERO,
			input: vec![TxIn {
				previous_output: OutPoint::new(Txid::from_byte_array([sat as u8; 32]), 0),
				script_sig: ScriptBuf::new(),
				sequence: Sequence::MAX,
				witness: Witness::new(),
			}],
			output: vec![TxOut { value: Amount::from_sat(sat), script_pubkey: address.script_pubkey() }],
		};
		wallet.apply_broadcast_tx(tx.clone()).unwrap();
		tx
	}

	#[test]
	fn addresses_survive_reload() {
		let dir = tempfile::tempdir().unwrap();
		let (a0, a1) = {
			let mut w = wallet(&dir);
			(w.address().unwrap(), w.address().unwrap())
		};
		assert_ne!(a0, a1);
		assert!(a0.to_string().starts_with("bcrt1p"));

		let mut w = wallet(&dir);
		let a2 = w.address().unwrap();
		assert_ne!(a2, a0);
		assert_ne!(a2, a1);
	}

	#[test]
	fn fund_and_spend() {
		let dir = tempfile::tempdir().unwrap();
		let mut w = wallet(&dir);
		let fund_tx = fund(&mut w, 100_000);
		assert_eq!(w.balance().total(), Amount::from_sat(100_000));
		assert_eq!(w.utxos().len(), 1);
		assert_eq!(w.utxos()[0].confirmation_height, None);
		assert_eq!(w.received_txs(), vec![ReceivedTx {
			txid: fund_tx.compute_txid(),
			amount: Amount::from_sat(100_000),
			confirmation_height: None,
		}]);

		let dest = TxOut {
			value: Amount::from_sat(30_000),
			script_pubkey: ScriptBuf::new_p2tr(&SECP, dummy_user_keypair().x_only_public_key().0, None),
		};
		let fee_rate = FeeRate::from_sat_per_vb_unchecked(2);
		let psbt = w.prepare_tx(&[dest.clone()], fee_rate, &[]).unwrap();
		let fee = psbt.fee().unwrap();
		let tx = w.sign_tx(psbt, &[], &HashMap::new()).unwrap();
		assert_eq!(tx.output[0], dest);
		assert_eq!(tx.output.len(), 2);
		assert_eq!(tx.output[1].value + dest.value + fee, Amount::from_sat(100_000));

		w.apply_broadcast_tx(tx.clone()).unwrap();
		assert_eq!(w.balance().total(), tx.output[1].value);
		// only the funding tx counts as received
		assert_eq!(w.received_txs().len(), 1);

		let too_much = TxOut { value: Amount::from_sat(1_000_000), ..dest };
		assert!(matches!(
			w.prepare_tx(&[too_much], fee_rate, &[]),
			Err(Error::InsufficientFunds { .. }),
		));
	}

	#[test]
	fn drain_empty_wallet() {
		let dir = tempfile::tempdir().unwrap();
		let mut w = wallet(&dir);
		let spk = w.address().unwrap().script_pubkey();
		assert!(matches!(
			w.prepare_drain_tx(spk, FeeRate::from_sat_per_vb_unchecked(1)),
			Err(Error::InsufficientFunds { .. }),
		));
	}
}
