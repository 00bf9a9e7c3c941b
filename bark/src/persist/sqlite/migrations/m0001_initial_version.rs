use super::Migration;

pub struct Migration0001 {}

impl Migration for Migration0001 {

	fn name(&self) -> &str {
		"Create initial tables"
	}

	fn to_version(&self) -> i64 { 1 }

	fn queries(&self) -> &[&str] {
		&[
			"CREATE TABLE IF NOT EXISTS bark_vtxo (
				id TEXT PRIMARY KEY,
				expiry_height INTEGER NOT NULL,
				amount_sat INTEGER NOT NULL,
				raw_vtxo BLOB NOT NULL,
				created_at DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now'))
			);",
			"CREATE TABLE IF NOT EXISTS bark_vtxo_key (
				public_key TEXT NOT NULL PRIMARY KEY,
				idx INTEGER NOT NULL UNIQUE
			);",
			// state rows are never deleted, also not when the vtxo is removed
			"CREATE TABLE IF NOT EXISTS bark_vtxo_state (
				id INTEGER PRIMARY KEY AUTOINCREMENT,
				created_at DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now')),
				vtxo_id TEXT NOT NULL,
				state_kind TEXT NOT NULL
			);",
			"CREATE TABLE IF NOT EXISTS bark_ark_sync (
				id INTEGER PRIMARY KEY AUTOINCREMENT,
				sync_height INTEGER NOT NULL,
				created_at DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now'))
			);",
			"CREATE VIEW IF NOT EXISTS most_recent_vtxo_state
				(id, last_updated_at, vtxo_id, state_kind)
			AS
			WITH most_recent AS (SELECT MAX(id) as id FROM bark_vtxo_state GROUP BY vtxo_id)
			SELECT
					most_recent.id,
					vs.created_at,
					vs.vtxo_id,
					vs.state_kind
					FROM most_recent JOIN bark_vtxo_state as vs
						ON vs.id = most_recent.id;
			",
			"CREATE VIEW IF NOT EXISTS vtxo_view
			AS SELECT
				v.rowid AS seq,
				v.id,
				v.expiry_height,
				v.amount_sat,
				vs.state_kind,
				v.raw_vtxo,
				v.created_at,
				vs.last_updated_at
			FROM bark_vtxo as v
			JOIN most_recent_vtxo_state as vs
				ON v.id = vs.vtxo_id;
			",
		]
	}
}
