
use std::fmt;
use std::str::FromStr;

use bitcoin::bech32::{self, Bech32m, Hrp};
use bitcoin::bech32::primitives::decode::CheckedHrpstring;
use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::PublicKey;


/// The human-readable part for mainnet addresses
const HRP_MAINNET: Hrp = Hrp::parse_unchecked("ark");

/// The human-readable part for test addresses
const HRP_TESTNET: Hrp = Hrp::parse_unchecked("tark");

/// Address version for addresses that pay to a plain user pubkey.
const VERSION_PUBKEY: u8 = 0;


/// Identifier for an Ark server as used in addresses
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArkId([u8; 4]);

impl ArkId {
	/// Create a new [ArkId] from a server pubkey
	pub fn from_server_pubkey(server_pubkey: PublicKey) -> ArkId {
		let hash = sha256::Hash::hash(&server_pubkey.serialize());
		let mut ret = [0u8; 4];
		ret[..].copy_from_slice(&hash.as_byte_array()[0..4]);
		ArkId(ret)
	}

	/// Check whether the given server pubkey matches this [ArkId].
	pub fn is_for_server(&self, server_pubkey: PublicKey) -> bool {
		*self == ArkId::from_server_pubkey(server_pubkey)
	}

	pub fn to_byte_array(&self) -> [u8; 4] {
		self.0
	}
}

impl From<PublicKey> for ArkId {
	fn from(pk: PublicKey) -> Self {
		ArkId::from_server_pubkey(pk)
	}
}

impl fmt::Debug for ArkId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		for b in self.0 {
			write!(f, "{:02x}", b)?;
		}
		Ok(())
	}
}

/// An Ark address
///
/// Used to address VTXO payments in an Ark. It commits to the Ark server
/// through its [ArkId] and to the pubkey of the receiving user.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Address {
	testnet: bool,
	ark_id: ArkId,
	user_pubkey: PublicKey,
}

impl Address {
	pub fn new(testnet: bool, ark_id: impl Into<ArkId>, user_pubkey: PublicKey) -> Address {
		Address {
			testnet: testnet,
			ark_id: ark_id.into(),
			user_pubkey: user_pubkey,
		}
	}

	/// Whether or not this [Address] is intended to be used in a test network
	pub fn is_testnet(&self) -> bool {
		self.testnet
	}

	/// The [ArkId] of the Ark in which the user wants to be paid
	pub fn ark_id(&self) -> ArkId {
		self.ark_id
	}

	/// Check whether this [Address] matches the given server pubkey
	pub fn is_for_server(&self, server_pubkey: PublicKey) -> bool {
		self.ark_id().is_for_server(server_pubkey)
	}

	/// The pubkey VTXOs for this address should be locked to
	pub fn user_pubkey(&self) -> PublicKey {
		self.user_pubkey
	}

	fn payload(&self) -> Vec<u8> {
		let mut buf = Vec::with_capacity(1 + 4 + 33);
		buf.push(VERSION_PUBKEY);
		buf.extend_from_slice(&self.ark_id.to_byte_array());
		buf.extend_from_slice(&self.user_pubkey.serialize());
		buf
	}
}

impl fmt::Display for Address {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		let hrp = if self.testnet {
			HRP_TESTNET
		} else {
			HRP_MAINNET
		};
		bech32::encode_to_fmt::<Bech32m, _>(f, hrp, &self.payload()).map_err(|_| fmt::Error)
	}
}

impl fmt::Debug for Address {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Display::fmt(self, f)
	}
}

/// Error parsing an [Address]
#[derive(Debug, thiserror::Error)]
pub enum ParseAddressError {
	#[error("bech32m decoding error: {0}")]
	Bech32(#[from] bech32::primitives::decode::CheckedHrpstringError),
	#[error("invalid HRP: '{0}'")]
	Hrp(Hrp),
	#[error("unknown version: '{0}'")]
	UnknownVersion(u8),
	#[error("invalid encoding: unexpected end of bytes")]
	Eof,
	#[error("invalid user pubkey: {0}")]
	InvalidPubkey(bitcoin::secp256k1::Error),
	#[error("invalid address: trailing bytes")]
	TrailingBytes,
}

impl FromStr for Address {
	type Err = ParseAddressError;
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let checked = CheckedHrpstring::new::<Bech32m>(s)?;

		let testnet = if checked.hrp() == HRP_MAINNET {
			false
		} else if checked.hrp() == HRP_TESTNET {
			true
		} else {
			return Err(ParseAddressError::Hrp(checked.hrp()));
		};

		let bytes = checked.byte_iter().collect::<Vec<u8>>();
		let (version, rest) = bytes.split_first().ok_or(ParseAddressError::Eof)?;
		if *version != VERSION_PUBKEY {
			return Err(ParseAddressError::UnknownVersion(*version));
		}
		if rest.len() < 4 + 33 {
			return Err(ParseAddressError::Eof);
		}
		if rest.len() > 4 + 33 {
			return Err(ParseAddressError::TrailingBytes);
		}

		let mut ark_id = [0u8; 4];
		ark_id.copy_from_slice(&rest[0..4]);
		let user_pubkey = PublicKey::from_slice(&rest[4..])
			.map_err(ParseAddressError::InvalidPubkey)?;

		Ok(Address::new(testnet, ArkId(ark_id), user_pubkey))
	}
}

impl serde::Serialize for Address {
	fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
		s.collect_str(self)
	}
}

impl<'de> serde::Deserialize<'de> for Address {
	fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
		let s = <String as serde::Deserialize>::deserialize(d)?;
		Address::from_str(&s).map_err(serde::de::Error::custom)
	}
}


#[cfg(test)]
mod test {
	use super::*;

	use crate::test::dummy::{dummy_user_keypair, DummyServer};

	#[test]
	fn address_roundtrip() {
		let server = DummyServer::new().pubkey();
		let user = dummy_user_keypair().public_key();

		let addr = Address::new(false, server, user);
		let s = addr.to_string();
		assert!(s.starts_with("ark1"), "{}", s);
		let parsed = Address::from_str(&s).unwrap();
		assert_eq!(parsed, addr);
		assert!(parsed.is_for_server(server));
		assert!(!parsed.is_for_server(user));
		assert_eq!(parsed.user_pubkey(), user);

		let testnet = Address::new(true, server, user);
		assert!(testnet.to_string().starts_with("tark1"));
		assert!(Address::from_str(&testnet.to_string()).unwrap().is_testnet());
	}

	#[test]
	fn invalid_addresses() {
		let server = DummyServer::new().pubkey();
		let user = dummy_user_keypair().public_key();
		let s = Address::new(false, server, user).to_string();

		// corrupt the checksum
		let mut bad = s.clone();
		let last = bad.pop().unwrap();
		bad.push(if last == 'q' { 'p' } else { 'q' });
		assert!(Address::from_str(&bad).is_err());

		// bitcoin addresses are not ark addresses
		assert!(Address::from_str("bc1p5cyxnuxmeuwuvkwfem96lqzszd02n6xdcjrs20cac6yqjjwudpxqkedrcr").is_err());
		assert!(Address::from_str("").is_err());
	}
}
