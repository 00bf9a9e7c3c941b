
use bitcoin::{Amount, OutPoint};

/// Errors returned by the public wallet API.
///
/// Internally the wallet works with [anyhow::Error]. Typed errors raised
/// deep inside an operation survive any context added on the way up and
/// are recovered when converting back into an [Error].
#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("database file is not accessible")]
	DbFileNotAccessible,
	#[error("database file already exists")]
	DbFileAlreadyExists,
	#[error("invalid network: {0}")]
	InvalidNetwork(String),
	#[error("invalid public key: {0}")]
	InvalidPublicKey(String),
	#[error("invalid mnemonic")]
	InvalidMnemonic,
	#[error("invalid bolt11 invoice: {0}")]
	InvalidBolt11Invoice(String),
	#[error("invalid bitcoin address: {0}")]
	InvalidBitcoinAddress(String),
	#[error("invalid ark address: {0}")]
	InvalidBarkAddress(String),
	#[error("insufficient funds: need {needed}, have {available}")]
	InsufficientFunds {
		needed: Amount,
		available: Amount,
	},
	#[error("ark server unreachable: {0}")]
	AspUnreachable(String),
	#[error("protocol error: {0}")]
	ProtocolError(String),
	#[error("conflicting wallet state: {0}")]
	Conflict(String),
	#[error("duplicate outpoint: {0}")]
	DuplicateOutpoint(OutPoint),
	#[error("{0}")]
	BarkFailed(String),
}

impl Error {
	pub(crate) fn protocol(msg: impl std::fmt::Display) -> Error {
		Error::ProtocolError(msg.to_string())
	}

	pub(crate) fn conflict(msg: impl std::fmt::Display) -> Error {
		Error::Conflict(msg.to_string())
	}
}

impl From<anyhow::Error> for Error {
	fn from(e: anyhow::Error) -> Error {
		match e.downcast::<Error>() {
			Ok(e) => e,
			Err(e) => match e.downcast::<crate::server::ServerError>() {
				Ok(e) => e.into(),
				Err(e) => Error::BarkFailed(format!("{:#}", e)),
			},
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	use anyhow::Context;

	#[test]
	fn typed_errors_survive_context() {
		let res: anyhow::Result<()> = Err(Error::InvalidMnemonic.into());
		let err = res.context("opening wallet").unwrap_err();
		assert!(matches!(Error::from(err), Error::InvalidMnemonic));
	}

	#[test]
	fn untyped_errors_keep_chain() {
		let res: anyhow::Result<()> = Err(anyhow::anyhow!("disk full"));
		let err = res.context("storing vtxo").unwrap_err();
		match Error::from(err) {
			Error::BarkFailed(msg) => assert_eq!(msg, "storing vtxo: disk full"),
			e => panic!("unexpected error: {}", e),
		}
	}
}
