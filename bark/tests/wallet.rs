mod common;

use std::collections::HashSet;
use std::str::FromStr;

use bitcoin::{Amount, Network};

use bark::{Config, Error, VtxoState};
use bark::json::cli::{MovementKind, OnchainTxType};
use bark::movement::Movement;
use bitcoin_ext::TxStatus;

use common::*;

fn sat(s: u64) -> Amount {
	Amount::from_sat(s)
}

#[test]
fn create_and_open() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("db.sqlite");
	let mut config = Config::for_network(Network::Regtest);
	config.esplora_address = Some("http://127.0.0.1:3002".into());

	let wallet = bark::create_wallet(&path, MNEMONIC, config.clone()).unwrap();
	let fingerprint = wallet.properties().fingerprint;
	drop(wallet);

	let res = bark::create_wallet(&path, MNEMONIC, config.clone());
	assert!(matches!(res, Err(Error::DbFileAlreadyExists)));

	let missing = dir.path().join("missing.sqlite");
	assert!(matches!(bark::open_wallet(&missing, MNEMONIC), Err(Error::DbFileNotAccessible)));
	assert!(matches!(bark::open_wallet(&path, OTHER_MNEMONIC), Err(Error::InvalidMnemonic)));
	assert!(matches!(bark::open_wallet(&path, "not a mnemonic"), Err(Error::InvalidMnemonic)));

	let wallet = bark::open_wallet(&path, MNEMONIC).unwrap();
	assert_eq!(wallet.properties().fingerprint, fingerprint);
	assert_eq!(wallet.network(), Network::Regtest);
	assert_eq!(wallet.config(), &config);
}

#[tokio::test]
async fn board() {
	let w = new_wallet();
	fund_onchain(&w, sat(200_000)).await;
	assert_eq!(w.onchain_balance().unwrap().total, sat(200_000));

	let board = w.board_amount(sat(50_000)).await.unwrap();
	assert_eq!(board.vtxos.len(), 1);
	assert_eq!(board.vtxos[0].amount, sat(50_000));
	assert_eq!(board.vtxos[0].chain_anchor.map(|a| a.txid), Some(board.funding_txid));
	assert_eq!(w.chain.status(board.funding_txid), TxStatus::Mempool);

	let balance = w.wallet_balance().await.unwrap();
	assert_eq!(balance.spendable, sat(50_000));
	assert_eq!(balance.pending_board, Amount::ZERO);

	let movements = w.movements().unwrap();
	assert_eq!(movements.len(), 1);
	assert_eq!(movements[0].kind, MovementKind::Board);
	assert_eq!(movements[0].amount_received, sat(50_000));
	let fees = movements[0].fees;
	assert!(fees > Amount::ZERO);
	assert_eq!(w.onchain_balance().unwrap().total + sat(50_000) + fees, sat(200_000));

	// syncing doesn't change anything
	w.sync().await.unwrap();
	assert_eq!(w.wallet_balance().await.unwrap().spendable, sat(50_000));
	assert_eq!(w.onchain_balance().unwrap().total + sat(50_000) + fees, sat(200_000));

	let txs = w.onchain_transactions().unwrap();
	let board_tx = txs.iter().find(|t| t.txid == board.funding_txid).unwrap();
	assert_eq!(board_tx.tx_type, OnchainTxType::Board);
	assert_eq!(board_tx.amount, sat(50_000) + fees);
}

#[tokio::test]
async fn board_all() {
	let w = new_wallet();
	fund_onchain(&w, sat(80_000)).await;

	let board = w.board_all().await.unwrap();
	assert_eq!(w.onchain_balance().unwrap().total, Amount::ZERO);
	let fees = w.movements().unwrap()[0].fees;
	assert_eq!(board.vtxos[0].amount + fees, sat(80_000));
}

#[tokio::test]
async fn board_without_funds() {
	let w = new_wallet();
	let res = w.board_amount(sat(50_000)).await;
	assert!(matches!(res, Err(Error::InsufficientFunds { .. })), "{:?}", res);
	assert!(w.vtxos().unwrap().is_empty());
	assert!(w.movements().unwrap().is_empty());
}

#[tokio::test]
async fn failed_board_broadcast_changes_nothing() {
	let w = new_wallet();
	fund_onchain(&w, sat(200_000)).await;

	w.chain.set_fail_broadcast(true);
	let res = w.board_amount(sat(50_000)).await;
	assert!(matches!(res, Err(Error::BarkFailed(_))), "{:?}", res);
	assert!(w.vtxos().unwrap().is_empty());
	assert!(w.movements().unwrap().is_empty());
	assert_eq!(w.onchain_balance().unwrap().total, sat(200_000));
	assert_eq!(w.onchain_transactions().unwrap().len(), 1);

	w.chain.set_fail_broadcast(false);
	let board = w.board_amount(sat(50_000)).await.unwrap();
	assert_eq!(w.chain.status(board.funding_txid), TxStatus::Mempool);
	assert_eq!(w.wallet_balance().await.unwrap().spendable, sat(50_000));
}

#[tokio::test]
async fn concurrent_boards_spend_distinct_outputs() {
	let w = new_wallet();
	fund_onchain(&w, sat(200_000)).await;
	fund_onchain(&w, sat(200_000)).await;

	let (a, b) = tokio::join!(w.board_amount(sat(50_000)), w.board_amount(sat(60_000)));
	let (a, b) = (a.unwrap(), b.unwrap());
	let inputs = |txid| w.chain.tx(txid).unwrap().input.into_iter()
		.map(|i| i.previous_output)
		.collect::<HashSet<_>>();
	assert!(inputs(a.funding_txid).is_disjoint(&inputs(b.funding_txid)));
	assert_eq!(w.wallet_balance().await.unwrap().spendable, sat(110_000));
}

#[tokio::test]
async fn configured_dust_threshold() {
	let chain = std::sync::Arc::new(MockChain::new(100));
	let server = std::sync::Arc::new(MockServer::new(chain.clone()));
	let mut config = Config::for_network(Network::Regtest);
	config.dust_threshold = sat(5_000);
	let w = new_wallet_with_config(MNEMONIC, config, server, chain);
	fund_onchain(&w, sat(200_000)).await;

	let res = w.board_amount(sat(4_000)).await;
	assert!(matches!(res, Err(Error::BarkFailed(_))), "{:?}", res);
	w.board_amount(sat(50_000)).await.unwrap();

	let pubkey = w.derive_store_next_keypair().unwrap().public_key();
	let res = w.send(&pubkey.to_string(), sat(4_000)).await;
	assert!(matches!(res, Err(Error::BarkFailed(_))), "{:?}", res);
	let address = w.onchain_address().unwrap();
	let res = w.send_onchain(&address.to_string(), sat(4_000)).await;
	assert!(matches!(res, Err(Error::BarkFailed(_))), "{:?}", res);

	// a default wallet accepts the same amount
	let d = boarded_wallet(sat(50_000)).await;
	let pubkey = d.derive_store_next_keypair().unwrap().public_key();
	d.send(&pubkey.to_string(), sat(4_000)).await.unwrap();
}

#[tokio::test]
async fn arkoor_between_wallets() {
	let a = boarded_wallet(sat(50_000)).await;
	let b = new_wallet_with(OTHER_MNEMONIC, a.server.clone(), a.chain.clone());

	let address = b.new_address().await.unwrap();
	let sent = a.send(&address.to_string(), sat(20_000)).await.unwrap();
	assert_eq!(sent.len(), 1);
	assert_eq!(sent[0].amount(), sat(20_000));
	assert_eq!(sent[0].user_pubkey, address.user_pubkey());
	assert_eq!(a.wallet_balance().await.unwrap().spendable, sat(30_000));

	let movement = a.movements().unwrap().pop().unwrap();
	assert_eq!(movement.kind, MovementKind::ArkoorSend);
	assert_eq!(movement.amount_sent, sat(20_000));
	assert_eq!(movement.fees, Amount::ZERO);

	// the payment is registered exactly once
	b.sync().await.unwrap();
	b.sync().await.unwrap();
	assert_eq!(b.wallet_balance().await.unwrap().spendable, sat(20_000));
	let movements = b.movements().unwrap();
	assert_eq!(movements.len(), 1);
	assert_eq!(movements[0].kind, MovementKind::ArkoorReceive);
	assert_eq!(movements[0].amount_received, sat(20_000));

	// b can send it on to a plain public key of a
	let pubkey = a.derive_store_next_keypair().unwrap().public_key();
	b.send(&pubkey.to_string(), sat(5_000)).await.unwrap();
	a.sync().await.unwrap();
	assert_eq!(a.wallet_balance().await.unwrap().spendable, sat(35_000));
	assert_eq!(b.wallet_balance().await.unwrap().spendable, sat(15_000));
}

#[tokio::test]
async fn arkoor_invalid_destination() {
	let w = boarded_wallet(sat(50_000)).await;
	let pubkey = w.derive_store_next_keypair().unwrap().public_key();

	let other_server = ark::test::dummy::dummy_user_keypair().public_key();
	let foreign = ark::Address::new(true, other_server, pubkey);
	let res = w.send(&foreign.to_string(), sat(1_000)).await;
	assert!(matches!(res, Err(Error::InvalidBarkAddress(_))), "{:?}", res);

	let res = w.send("not an address", sat(1_000)).await;
	assert!(matches!(res, Err(Error::InvalidBarkAddress(_))), "{:?}", res);

	let res = w.send(&"ab".repeat(33), sat(1_000)).await;
	assert!(matches!(res, Err(Error::InvalidPublicKey(_))), "{:?}", res);

	assert_eq!(w.wallet_balance().await.unwrap().spendable, sat(50_000));
}

#[tokio::test]
async fn arkoor_insufficient_funds() {
	let w = boarded_wallet(sat(50_000)).await;
	let pubkey = w.derive_store_next_keypair().unwrap().public_key();

	let res = w.send(&pubkey.to_string(), sat(60_000)).await;
	match res {
		Err(Error::InsufficientFunds { needed, available }) => {
			assert_eq!(needed, sat(60_000));
			assert_eq!(available, sat(50_000));
		},
		other => panic!("unexpected result: {:?}", other),
	}
	assert!(w.vtxos().unwrap().iter().all(|v| v.state == VtxoState::Spendable));
}

#[tokio::test]
async fn unanswered_send_keeps_inputs_locked() {
	let w = boarded_wallet(sat(50_000)).await;
	let vtxo_id = w.vtxos().unwrap()[0].id();
	let pubkey = w.derive_store_next_keypair().unwrap().public_key();

	w.server.set_online(false);
	let res = w.send(&pubkey.to_string(), sat(10_000)).await;
	assert!(matches!(res, Err(Error::AspUnreachable(_))), "{:?}", res);
	// we can't know whether the server got the request
	assert_eq!(w.wallet_balance().await.unwrap().spendable, Amount::ZERO);
	assert_eq!(w.vtxos().unwrap()[0].state, VtxoState::Locked);

	// an unreachable server doesn't break syncing
	w.sync().await.unwrap();
	assert_eq!(w.wallet_balance().await.unwrap().spendable, Amount::ZERO);

	// the server never spent it
	w.server.set_online(true);
	w.sync().await.unwrap();
	assert!(!w.server.is_spent(vtxo_id));
	assert_eq!(w.wallet_balance().await.unwrap().spendable, sat(50_000));

	w.send(&pubkey.to_string(), sat(10_000)).await.unwrap();
	assert_eq!(w.wallet_balance().await.unwrap().spendable, sat(40_000));
}

#[tokio::test]
async fn rejected_send_unlocks_inputs() {
	let w = boarded_wallet(sat(50_000)).await;
	let pubkey = w.derive_store_next_keypair().unwrap().public_key();

	w.server.set_reject_requests(true);
	let res = w.send(&pubkey.to_string(), sat(10_000)).await;
	assert!(matches!(res, Err(Error::BarkFailed(_))), "{:?}", res);
	assert_eq!(w.wallet_balance().await.unwrap().spendable, sat(50_000));

	let res = w.refresh_all().await;
	assert!(res.is_err(), "{:?}", res);
	assert_eq!(w.wallet_balance().await.unwrap().spendable, sat(50_000));

	w.server.set_reject_requests(false);
	w.send(&pubkey.to_string(), sat(10_000)).await.unwrap();
	assert_eq!(w.wallet_balance().await.unwrap().spendable, sat(40_000));
}

#[tokio::test]
async fn lost_send_response_forfeits_inputs() {
	let w = boarded_wallet(sat(50_000)).await;
	let vtxo_id = w.vtxos().unwrap()[0].id();
	let pubkey = w.derive_store_next_keypair().unwrap().public_key();

	// the server processes the payment but the answer never arrives
	w.server.set_drop_responses(true);
	let res = w.send(&pubkey.to_string(), sat(10_000)).await;
	assert!(matches!(res, Err(Error::AspUnreachable(_))), "{:?}", res);
	assert!(w.server.is_spent(vtxo_id));
	assert_eq!(w.wallet_balance().await.unwrap().spendable, Amount::ZERO);
	w.server.set_drop_responses(false);

	// the spent inputs can't be used again
	let res = w.send(&pubkey.to_string(), sat(10_000)).await;
	assert!(matches!(res, Err(Error::InsufficientFunds { .. })), "{:?}", res);

	w.sync().await.unwrap();
	assert!(w.vtxos().unwrap().is_empty());
	assert_eq!(w.wallet_balance().await.unwrap().spendable, Amount::ZERO);
	let movement = w.movements().unwrap().pop().unwrap();
	assert_eq!(movement.kind, MovementKind::Forfeit);
	assert_eq!(movement.amount_sent, sat(50_000));
	assert_eq!(movement.amount_received, Amount::ZERO);
}

#[tokio::test]
async fn lost_round_response_forfeits_inputs() {
	let w = boarded_wallet(sat(50_000)).await;

	w.server.set_drop_responses(true);
	let res = w.refresh_all().await;
	assert!(res.is_err(), "{:?}", res);
	assert_eq!(w.wallet_balance().await.unwrap().spendable, Amount::ZERO);
	w.server.set_drop_responses(false);

	w.sync().await.unwrap();
	assert!(w.vtxos().unwrap().is_empty());
	let movement = w.movements().unwrap().pop().unwrap();
	assert_eq!(movement.kind, MovementKind::Forfeit);
	assert_eq!(movement.amount_sent, sat(50_000));
}

#[tokio::test]
async fn refresh() {
	let w = boarded_wallet(sat(50_000)).await;
	let before = w.vtxos().unwrap();

	let round_txid = w.refresh_all().await.unwrap();
	assert!(round_txid.is_some());

	let after = w.vtxos().unwrap();
	assert_eq!(after.len(), 1);
	assert_ne!(after[0].id(), before[0].id());
	assert_eq!(w.wallet_balance().await.unwrap().spendable, sat(50_000));

	let movement = w.movements().unwrap().pop().unwrap();
	assert_eq!(movement.kind, MovementKind::Round);
	assert_eq!(movement.amount_sent, sat(50_000));
	assert_eq!(movement.amount_received, sat(50_000));

	// refreshing a vtxo that is gone fails
	assert!(w.refresh_vtxos(vec![before[0].id()]).await.is_err());
	assert_eq!(w.refresh_vtxos(vec![]).await.unwrap(), None);
}

#[tokio::test]
async fn offboard() {
	let w = boarded_wallet(sat(50_000)).await;
	let onchain_before = w.onchain_balance().unwrap().total;

	w.offboard_all().await.unwrap();
	assert!(w.vtxos().unwrap().is_empty());

	let movement = w.movements().unwrap().pop().unwrap();
	assert_eq!(movement.kind, MovementKind::Offboard);
	assert!(movement.fees > Amount::ZERO);
	assert_eq!(movement.amount_sent + movement.fees, sat(50_000));

	w.sync().await.unwrap();
	assert_eq!(w.onchain_balance().unwrap().total, onchain_before + movement.amount_sent);
}

#[tokio::test]
async fn send_onchain() {
	let a = new_wallet();
	let b = new_wallet_with(OTHER_MNEMONIC, a.server.clone(), a.chain.clone());
	fund_onchain(&a, sat(200_000)).await;

	let address = b.onchain_address().unwrap();
	let res = a.send_onchain(&address.to_string(), sat(100)).await;
	assert!(matches!(res, Err(Error::BarkFailed(_))), "{:?}", res);
	let res = a.send_onchain("bc1qnotanaddress", sat(10_000)).await;
	assert!(matches!(res, Err(Error::InvalidBitcoinAddress(_))), "{:?}", res);

	let txid = a.send_onchain(&address.to_string(), sat(50_000)).await.unwrap();
	let sent = a.onchain_transactions().unwrap().into_iter().find(|t| t.txid == txid).unwrap();
	assert_eq!(sent.tx_type, OnchainTxType::Send);
	let fee = sent.amount - sat(50_000);
	assert_eq!(a.onchain_balance().unwrap().total, sat(150_000) - fee);

	b.sync().await.unwrap();
	assert_eq!(b.onchain_balance().unwrap().total, sat(50_000));
	let received = b.onchain_transactions().unwrap();
	assert_eq!(received.len(), 1);
	assert_eq!(received[0].tx_type, OnchainTxType::Receive);
	assert_eq!(received[0].num_confirmations, 0);

	a.chain.mine(1);
	b.sync().await.unwrap();
	assert_eq!(b.onchain_transactions().unwrap()[0].num_confirmations, 1);
	assert_eq!(b.onchain_balance().unwrap().trusted_spendable, sat(50_000));
}

#[tokio::test]
async fn movement_ids_increase() {
	let w = boarded_wallet(sat(50_000)).await;
	let pubkey = w.derive_store_next_keypair().unwrap().public_key();
	w.send(&pubkey.to_string(), sat(10_000)).await.unwrap();
	w.refresh_all().await.unwrap();
	w.sync().await.unwrap();

	let movements = w.movements().unwrap();
	assert_eq!(movements.len(), 4);
	assert!(movements.windows(2).all(|m| m[0].id < m[1].id));
}

#[tokio::test]
async fn coin_selection() {
	let a = new_wallet();
	fund_onchain(&a, sat(500_000)).await;
	for amount in [10_000, 20_000, 30_000] {
		a.board_amount(sat(amount)).await.unwrap();
	}

	// largest first: 30k and 20k, 5k change
	let pubkey = a.derive_store_next_keypair().unwrap().public_key();
	a.send(&pubkey.to_string(), sat(45_000)).await.unwrap();
	a.sync().await.unwrap();

	let mut amounts = a.vtxos().unwrap().iter().map(|v| v.amount().to_sat()).collect::<Vec<_>>();
	amounts.sort();
	assert_eq!(amounts, vec![5_000, 10_000, 45_000]);
}

#[test]
fn invoice_helper_is_valid() {
	let preimage = ark::lightning::Preimage::random();
	let invoice = invoice(preimage.compute_payment_hash(), Some(sat(1_000)));
	let parsed = lightning_invoice::Bolt11Invoice::from_str(&invoice.to_string()).unwrap();
	assert_eq!(parsed.amount_milli_satoshis(), Some(1_000_000));
}

/// Everything the wallet holds, off-chain and on-chain.
async fn total_value(w: &TestWallet) -> Amount {
	let balance = w.wallet_balance().await.unwrap();
	balance.spendable + balance.pending_board + balance.pending_exit
		+ balance.pending_lightning_send + w.onchain_balance().unwrap().total
}

fn check_conserved(funded: Amount, value: Amount, sent_away: Amount, movements: &[Movement]) {
	let fees = movements.iter().map(|m| m.fees).sum::<Amount>();
	assert!(value + sent_away <= funded, "{} + {} > {}", value, sent_away, funded);
	assert!(value + sent_away + fees >= funded, "{} + {} + {} < {}", value, sent_away, fees, funded);
}

/// The wallet never ends up with more than it was funded with, and loses
/// no more than the fees it paid.
#[tokio::test]
async fn no_value_is_created() {
	let w = new_wallet();
	let other = new_wallet_with(OTHER_MNEMONIC, w.server.clone(), w.chain.clone());
	let funded = sat(300_000);
	fund_onchain(&w, funded).await;

	w.board_amount(sat(100_000)).await.unwrap();
	w.sync().await.unwrap();
	check_conserved(funded, total_value(&w).await, Amount::ZERO, &w.movements().unwrap());

	let address = other.new_address().await.unwrap();
	w.send(&address.to_string(), sat(20_000)).await.unwrap();
	w.sync().await.unwrap();
	check_conserved(funded, total_value(&w).await, sat(20_000), &w.movements().unwrap());

	w.refresh_all().await.unwrap();
	w.sync().await.unwrap();
	check_conserved(funded, total_value(&w).await, sat(20_000), &w.movements().unwrap());

	w.server.set_pay_behavior(PayBehavior::Fail);
	let invoice = w.server.external_invoice(Some(sat(30_000)));
	assert!(w.pay_bolt11(&invoice.to_string(), None).await.is_err());
	assert_eq!(
		w.movements().unwrap().pop().unwrap().kind,
		MovementKind::LightningSendRevocation,
	);
	w.sync().await.unwrap();
	check_conserved(funded, total_value(&w).await, sat(20_000), &w.movements().unwrap());

	w.offboard_all().await.unwrap();
	w.sync().await.unwrap();
	assert!(w.vtxos().unwrap().is_empty());
	check_conserved(funded, total_value(&w).await, sat(20_000), &w.movements().unwrap());

	w.chain.mine(1);
	w.sync().await.unwrap();
	check_conserved(funded, total_value(&w).await, sat(20_000), &w.movements().unwrap());
}
