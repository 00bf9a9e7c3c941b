
use std::io;

use fern::colors::{Color, ColoredLevelConfig};
use log::LevelFilter;

/// Install a colored stderr logger for the wallet.
///
/// Embedders with their own logger should not call this. At [LevelFilter::Debug]
/// and above, records of the wallet crates carry their module path.
pub fn init_logging(level: LevelFilter) -> anyhow::Result<()> {
	let colors = ColoredLevelConfig::default()
		.info(Color::Green)
		.debug(Color::Blue)
		.trace(Color::Magenta);
	let verbose = level >= LevelFilter::Debug;

	fern::Dispatch::new()
		.level(level)
		.level_for("rusqlite", LevelFilter::Warn)
		.level_for("rustls", LevelFilter::Warn)
		.level_for("reqwest", LevelFilter::Warn)
		.level_for("hyper_util", LevelFilter::Warn)
		.format(move |out, msg, rec| {
			let now = chrono::Local::now();
			let stamp = now.format("%Y-%m-%d %H:%M:%S.%3f");
			let lvl = colors.color(rec.level());
			let module = rec.module_path().unwrap_or("");
			if verbose && (module.starts_with("bark") || module.starts_with("ark")) {
				out.finish(format_args!("[{stamp} {lvl: >5} {module}] {msg}"))
			} else {
				out.finish(format_args!("[{stamp} {lvl: >5}] {msg}"))
			}
		})
		.chain(io::stderr())
		.apply()?;
	Ok(())
}
