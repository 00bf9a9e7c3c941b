use super::Migration;

pub struct Migration0005 {}

impl Migration for Migration0005 {

	fn name(&self) -> &str {
		"Create lightning tables"
	}

	fn to_version(&self) -> i64 { 5 }

	fn queries(&self) -> &[&str] {
		&[
			"CREATE TABLE IF NOT EXISTS bark_lightning_receive (
				payment_hash TEXT NOT NULL PRIMARY KEY,
				preimage TEXT NOT NULL UNIQUE,
				invoice TEXT NOT NULL,
				amount_sat INTEGER NOT NULL,
				claimed INTEGER NOT NULL DEFAULT 0,
				created_at DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now'))
			);",
			"CREATE TABLE IF NOT EXISTS bark_lightning_send (
				payment_hash TEXT NOT NULL PRIMARY KEY,
				invoice TEXT NOT NULL,
				amount_sat INTEGER NOT NULL,
				inputs TEXT NOT NULL,
				status TEXT NOT NULL,
				preimage TEXT,
				created_at DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now'))
			);",
		]
	}
}
