use super::Migration;

pub struct Migration0002 {}

impl Migration for Migration0002 {

	fn name(&self) -> &str {
		"Create wallet meta tables"
	}

	fn to_version(&self) -> i64 { 2 }

	fn queries(&self) -> &[&str] {
		&[
			"CREATE TABLE IF NOT EXISTS bark_config (
				id INTEGER PRIMARY KEY,
				created_at DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now')),
				config TEXT NOT NULL
			);",
			"CREATE TABLE IF NOT EXISTS bark_properties (
				id INTEGER PRIMARY KEY,
				created_at DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now')),

				network TEXT NOT NULL,
				fingerprint TEXT NOT NULL
			);",
			"CREATE TABLE IF NOT EXISTS bark_ark_info (
				id INTEGER PRIMARY KEY,
				created_at DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now')),
				ark_info TEXT NOT NULL
			);",
		]
	}
}
