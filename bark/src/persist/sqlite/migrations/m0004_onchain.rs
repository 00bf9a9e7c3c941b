use super::Migration;

pub struct Migration0004 {}

impl Migration for Migration0004 {

	fn name(&self) -> &str {
		"Create onchain wallet tables"
	}

	fn to_version(&self) -> i64 { 4 }

	fn queries(&self) -> &[&str] {
		&[
			// the outputs of our own addresses live in the bdk wallet tables
			"CREATE TABLE IF NOT EXISTS bark_exit_utxo (
				outpoint TEXT NOT NULL PRIMARY KEY,
				raw_vtxo BLOB NOT NULL,
				confirmation_height INTEGER NOT NULL,
				created_at DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now'))
			);",
			"CREATE TABLE IF NOT EXISTS bark_onchain_tx (
				txid TEXT NOT NULL PRIMARY KEY,
				amount_sat INTEGER NOT NULL,
				created_at INTEGER NOT NULL,
				tx_type TEXT NOT NULL,
				confirmation_height INTEGER
			);",
		]
	}
}
