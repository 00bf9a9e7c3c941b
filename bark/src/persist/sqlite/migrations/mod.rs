mod m0001_initial_version;
mod m0002_config;
mod m0003_movements;
mod m0004_onchain;
mod m0005_lightning;
mod m0006_exit;

use anyhow::Context;
use log::{trace, debug};
use rusqlite::{Connection, OptionalExtension, Transaction};

use m0001_initial_version::Migration0001;
use m0002_config::Migration0002;
use m0003_movements::Migration0003;
use m0004_onchain::Migration0004;
use m0005_lightning::Migration0005;
use m0006_exit::Migration0006;

/// All schema migrations, in order.
const MIGRATIONS: &[&dyn Migration] = &[
	&Migration0001 {},
	&Migration0002 {},
	&Migration0003 {},
	&Migration0004 {},
	&Migration0005 {},
	&Migration0006 {},
];

/// The schema version after all migrations ran.
pub const LATEST_VERSION: i64 = MIGRATIONS.len() as i64;

/// Bring the schema of the database up to date.
///
/// Every migration runs in its own transaction. A database written by a
/// newer version of the software is refused.
pub fn migrate(conn: &mut Connection) -> anyhow::Result<()> {
	conn.execute(
		"CREATE TABLE IF NOT EXISTS migrations (
			id INTEGER PRIMARY KEY AUTOINCREMENT,
			created_at DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now')),
			value INTEGER NOT NULL
		)",
		(),
	).context("Failed to create migration table")?;

	let version = schema_version(conn)?;
	if version > LATEST_VERSION {
		bail!("Database schema version {} is newer than supported version {}",
			version, LATEST_VERSION,
		);
	}

	for migration in MIGRATIONS {
		apply(conn, *migration)?;
	}
	Ok(())
}

/// Run a single migration if the database is at its starting version.
fn apply(conn: &mut Connection, migration: &dyn Migration) -> anyhow::Result<()> {
	let tx = conn.transaction().context("Failed to start transaction")?;
	let version = schema_version(&tx)?;
	if version > migration.from_version() {
		trace!("Skipping migration {}", migration.summary());
		return Ok(());
	}
	if version < migration.from_version() {
		bail!("Database is at version {}, can't apply migration {}", version, migration.summary());
	}

	debug!("Performing migration {}", migration.summary());
	migration.do_migration(&tx)?;
	set_schema_version(&tx, migration.to_version())?;
	tx.commit().context("Failed to commit migration")?;
	Ok(())
}

/// The current schema version, 0 for a fresh database.
fn schema_version(conn: &Connection) -> anyhow::Result<i64> {
	let version = conn.query_row(
		"SELECT value FROM migrations ORDER BY value DESC LIMIT 1", (), |row| row.get(0),
	).optional().context("Failed to read schema version")?;
	Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i64) -> anyhow::Result<()> {
	conn.execute("INSERT INTO migrations (value) VALUES (?1)", [version])
		.context("Failed to update schema version")?;
	Ok(())
}

trait Migration {
	fn name(&self) -> &str;
	fn to_version(&self) -> i64;

	fn from_version(&self) -> i64 {
		self.to_version() - 1
	}

	/// The statements of this migration, executed in order.
	fn queries(&self) -> &[&str];

	fn do_migration(&self, conn: &Transaction) -> anyhow::Result<()> {
		for query in self.queries() {
			conn.execute(query, ())
				.with_context(|| format!("Failed to execute migration: {}", self.summary()))?;
		}
		Ok(())
	}

	fn summary(&self) -> String {
		format!("{}->{}:'{}'", self.from_version(), self.to_version(), self.name())
	}
}
