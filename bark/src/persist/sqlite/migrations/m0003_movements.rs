use super::Migration;

pub struct Migration0003 {}

impl Migration for Migration0003 {

	fn name(&self) -> &str {
		"Create movement ledger"
	}

	fn to_version(&self) -> i64 { 3 }

	fn queries(&self) -> &[&str] {
		&[
			// AUTOINCREMENT so that ids are never reused
			"CREATE TABLE IF NOT EXISTS bark_movement (
				id INTEGER PRIMARY KEY AUTOINCREMENT,
				kind INTEGER NOT NULL,
				amount_sent_sat INTEGER NOT NULL,
				amount_received_sat INTEGER NOT NULL,
				fees_sat INTEGER NOT NULL,
				created_at DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now'))
			);",
		]
	}
}
