
use bitcoin::{Amount, FeeRate, Network};

use bitcoin_ext::{BlockDelta, BlockHeight, P2TR_DUST};

use crate::Error;

/// Configuration of the Bark wallet.
///
/// The configuration is stored in the wallet database when the wallet
/// is created and read back when it is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
	/// The Bitcoin network to run Bark on.
	///
	/// Default value: signet.
	#[serde(deserialize_with = "deserialize_network")]
	pub network: Network,

	/// The address of your ASP.
	pub asp_address: String,

	/// The address of the Esplora HTTP server to use.
	pub esplora_address: Option<String>,

	/// The number of blocks before expiration to refresh vtxos.
	///
	/// Default value: 288 (48 hrs)
	pub vtxo_refresh_threshold: BlockHeight,

	/// Outputs below this amount are not created, their value goes to fees.
	///
	/// Default value: 330 sats
	#[serde(rename = "dust_threshold_sat", with = "bitcoin::amount::serde::as_sat")]
	pub dust_threshold: Amount,

	/// Fee rate used when the chain source can't provide an estimate.
	///
	/// Default value: 5 sat/vB
	pub fallback_fee_rate: FeeRate,

	/// The number of blocks an exit transaction may stay unconfirmed
	/// before the exit is considered stalled.
	///
	/// Default value: 144 (24 hrs)
	pub exit_stall_window: BlockDelta,
}

impl Default for Config {
	fn default() -> Config {
		Config {
			network: Network::Signet,
			asp_address: "http://127.0.0.1:3535".to_owned(),
			esplora_address: None,
			vtxo_refresh_threshold: 288,
			dust_threshold: P2TR_DUST,
			fallback_fee_rate: FeeRate::from_sat_per_vb_unchecked(5),
			exit_stall_window: 144,
		}
	}
}

fn deserialize_network<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Network, D::Error> {
	let s = <String as serde::Deserialize>::deserialize(d)?;
	Config::parse_network(&s).map_err(serde::de::Error::custom)
}

impl Config {
	/// Create a config from user input, with default values otherwise.
	pub fn new(
		network: &str,
		asp_address: impl Into<String>,
		esplora_address: Option<String>,
	) -> Result<Config, Error> {
		Ok(Config {
			network: Config::parse_network(network)?,
			asp_address: asp_address.into(),
			esplora_address,
			..Default::default()
		})
	}

	/// Parse the network names accepted in configuration.
	pub fn parse_network(s: &str) -> Result<Network, Error> {
		match s.trim().to_lowercase().as_str() {
			"mainnet" | "bitcoin" => Ok(Network::Bitcoin),
			"testnet" => Ok(Network::Testnet),
			"regtest" => Ok(Network::Regtest),
			"signet" => Ok(Network::Signet),
			_ => Err(Error::InvalidNetwork(s.to_owned())),
		}
	}

	/// Create a config for the given network with default values otherwise.
	pub fn for_network(network: Network) -> Config {
		Config { network, ..Default::default() }
	}
}
