use super::Migration;

pub struct Migration0006 {}

impl Migration for Migration0006 {

	fn name(&self) -> &str {
		"Create exit table"
	}

	fn to_version(&self) -> i64 { 6 }

	fn queries(&self) -> &[&str] {
		&[
			"CREATE TABLE IF NOT EXISTS bark_exit (
				vtxo_id TEXT NOT NULL PRIMARY KEY,
				raw_vtxo BLOB NOT NULL,
				state TEXT NOT NULL,
				created_at DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now')),
				updated_at DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now'))
			);",
		]
	}
}
